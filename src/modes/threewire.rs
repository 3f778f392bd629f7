//! 3-wire mode: full-duplex shift register with separate data in/out lines
//! and a chip select, SPI mode 0 timing without the SPI configuration
//! surface.

use crate::Platform;
use crate::bio::{PinBackend, PinPurpose};
use crate::bpio::{BpioError, DataRequest, run_bitwise_ops};
use crate::bytecode::Bytecode;
use crate::time::Hertz;

use super::{ModeContext, ModeError, ProtocolMode, ReadBuffer};

pub const MOSI: u8 = 0;
pub const SCLK: u8 = 1;
pub const MISO: u8 = 2;
pub const CS: u8 = 3;

const DEFAULT_SPEED: u32 = 100_000;

#[derive(Debug)]
pub struct ThreeWireMode {
    speed_hz: u32,
    cs_asserted: bool,
}

impl Default for ThreeWireMode {
    fn default() -> Self {
        ThreeWireMode {
            speed_hz: DEFAULT_SPEED,
            cs_asserted: false,
        }
    }
}

impl ThreeWireMode {
    fn half_period_ns(&self) -> u32 {
        500_000_000 / self.speed_hz.max(1)
    }

    fn set_cs<P: Platform>(&mut self, ctx: &mut ModeContext<'_, P>, asserted: bool) {
        // Active low.
        self.cs_asserted = asserted;
        ctx.bio.put(CS, !asserted);
    }

    fn transfer_word<P: Platform>(
        &self,
        ctx: &mut ModeContext<'_, P>,
        value: u32,
        bits: u8,
    ) -> u32 {
        let half = self.half_period_ns();
        let mut read = 0u32;
        for bit in (0..bits).rev() {
            ctx.bio.put(MOSI, value & (1 << bit) != 0);
            ctx.bio.backend_mut().delay_ns(half);
            ctx.bio.put(SCLK, true);
            read = (read << 1) | ctx.bio.get(MISO) as u32;
            ctx.bio.backend_mut().delay_ns(half);
            ctx.bio.put(SCLK, false);
        }
        read
    }
}

impl<P: Platform> ProtocolMode<P> for ThreeWireMode {
    fn name(&self) -> &'static str {
        "3WIRE"
    }

    fn setup_exc(&mut self, ctx: &mut ModeContext<'_, P>) -> Result<(), ModeError> {
        ctx.bio.claim(MOSI, PinPurpose::Mode, "MOSI")?;
        ctx.bio.claim(SCLK, PinPurpose::Mode, "SCLK")?;
        ctx.bio.claim(MISO, PinPurpose::Mode, "MISO")?;
        ctx.bio.claim(CS, PinPurpose::Mode, "CS")?;
        ctx.bio.output(MOSI);
        ctx.bio.output(SCLK);
        ctx.bio.put(SCLK, false);
        ctx.bio.input(MISO);
        ctx.bio.output(CS);
        self.cs_asserted = false;
        ctx.bio.put(CS, true);
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut ModeContext<'_, P>) {
        self.cs_asserted = false;
        for pin in [MOSI, SCLK, MISO, CS] {
            let _ = ctx.bio.release(pin);
        }
    }

    fn get_speed(&self) -> Hertz {
        Hertz::from_raw(self.speed_hz)
    }

    fn help(&self) -> &'static str {
        "[ select chip, ] deselect chip, 0x.. write, r read"
    }

    fn start(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        self.set_cs(ctx, true);
        result.message = Some("CS ENABLED");
    }

    fn start_alt(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        ProtocolMode::<P>::start(self, ctx, result);
    }

    fn stop(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        self.set_cs(ctx, false);
        result.message = Some("CS DISABLED");
    }

    fn stop_alt(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        ProtocolMode::<P>::stop(self, ctx, result);
    }

    fn write(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        let bits = result.effective_bits(8);
        result.in_data = self.transfer_word(ctx, result.out_data, bits);
    }

    fn read(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        let bits = result.effective_bits(8);
        result.in_data = self.transfer_word(ctx, u32::MAX, bits);
    }

    fn clock_high(&mut self, ctx: &mut ModeContext<'_, P>, _result: &mut Bytecode) {
        ctx.bio.put(SCLK, true);
    }

    fn clock_low(&mut self, ctx: &mut ModeContext<'_, P>, _result: &mut Bytecode) {
        ctx.bio.put(SCLK, false);
    }

    fn tick_clock(&mut self, ctx: &mut ModeContext<'_, P>, _result: &mut Bytecode) {
        let half = self.half_period_ns();
        ctx.bio.put(SCLK, true);
        ctx.bio.backend_mut().delay_ns(half);
        ctx.bio.put(SCLK, false);
        ctx.bio.backend_mut().delay_ns(half);
    }

    fn data_high(&mut self, ctx: &mut ModeContext<'_, P>, _result: &mut Bytecode) {
        ctx.bio.put(MOSI, true);
    }

    fn data_low(&mut self, ctx: &mut ModeContext<'_, P>, _result: &mut Bytecode) {
        ctx.bio.put(MOSI, false);
    }

    fn data_state(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        result.in_data = ctx.bio.get(MISO) as u32;
    }

    fn read_bit(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        result.in_data = ctx.bio.get(MISO) as u32;
    }

    fn binary_transaction(
        &mut self,
        ctx: &mut ModeContext<'_, P>,
        request: &DataRequest<'_>,
        read: &mut ReadBuffer,
    ) -> Result<(), BpioError> {
        if request.start_main || request.start_alt {
            self.set_cs(ctx, true);
        }
        for &byte in request.data_write {
            let reply = self.transfer_word(ctx, byte as u32, 8) as u8;
            if request.start_alt {
                read.push(reply).map_err(|_| BpioError::TooLarge)?;
            }
        }
        for _ in 0..request.bytes_read {
            let reply = self.transfer_word(ctx, 0xFF, 8) as u8;
            read.push(reply).map_err(|_| BpioError::TooLarge)?;
        }
        if request.stop_main || request.stop_alt {
            self.set_cs(ctx, false);
        }
        run_bitwise_ops::<P>(ctx, request.bitwise_ops, MOSI, SCLK, MISO, read)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::SyntaxCommand;
    use crate::dispatcher::tests::loopback_dispatcher;
    use crate::modes::ModeId;

    #[test]
    fn loopback_jumper_round_trips_words() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher.bio.backend_mut().tie(MOSI, MISO);
        dispatcher.change_mode(ModeId::ThreeWire, None).unwrap();
        let mut program = [
            Bytecode::new(SyntaxCommand::Start),
            Bytecode::write(0xC3),
            Bytecode::write(0x05).with_bits(4),
            Bytecode::new(SyntaxCommand::Read),
            Bytecode::new(SyntaxCommand::Stop),
        ];
        dispatcher.run_syntax(&mut program).unwrap();
        assert_eq!(program[1].in_data, 0xC3);
        assert_eq!(program[2].in_data, 0x05);
        // Reads clock out the all-ones fill word.
        assert_eq!(program[3].in_data, 0xFF);
        assert!(!dispatcher.error);
    }

    #[test]
    fn chip_select_is_active_low_around_the_burst() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher.change_mode(ModeId::ThreeWire, None).unwrap();
        dispatcher.bio.backend_mut().start_trace();
        let mut program = [
            Bytecode::new(SyntaxCommand::Start),
            Bytecode::write(0x0F),
            Bytecode::new(SyntaxCommand::Stop),
        ];
        dispatcher.run_syntax(&mut program).unwrap();
        let trace = dispatcher.bio.backend_mut().trace();
        assert!(trace.iter().any(|event| event.levels & (1 << CS) == 0));
        assert_eq!(trace.last().unwrap().levels & (1 << CS), 1 << CS);
        // Every clock rise happens inside the selected window.
        let mut last = trace[0].levels;
        for event in &trace[1..] {
            let rising = last & (1 << SCLK) == 0 && event.levels & (1 << SCLK) != 0;
            if rising {
                assert_eq!(event.levels & (1 << CS), 0);
            }
            last = event.levels;
        }
    }

    #[test]
    fn data_and_clock_ops_reach_the_pins() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher.bio.backend_mut().tie(MOSI, MISO);
        dispatcher.change_mode(ModeId::ThreeWire, None).unwrap();
        let mut program = [
            Bytecode::new(SyntaxCommand::DataHigh),
            Bytecode::new(SyntaxCommand::ReadBit),
            Bytecode::new(SyntaxCommand::DataLow),
            Bytecode::new(SyntaxCommand::ReadBit),
            Bytecode::new(SyntaxCommand::TickClock),
        ];
        dispatcher.run_syntax(&mut program).unwrap();
        assert_eq!(program[1].in_data, 1);
        assert_eq!(program[3].in_data, 0);
        assert!(!dispatcher.error);
    }
}
