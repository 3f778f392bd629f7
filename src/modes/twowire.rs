//! 2-wire mode: I2C-style clock/data framing without acknowledge bits.
//!
//! Useful for smart cards and other half-duplex devices that speak an
//! I2C-like wire discipline but own no ACK slot.

use crate::Platform;
use crate::bio::{PinBackend, PinPurpose};
use crate::bpio::{BpioError, DataRequest, run_bitwise_ops};
use crate::bytecode::Bytecode;
use crate::time::Hertz;

use super::{ModeContext, ModeError, ProtocolMode, ReadBuffer};

pub const SDA: u8 = 0;
pub const SCL: u8 = 1;

const DEFAULT_SPEED: u32 = 100_000;

#[derive(Debug)]
pub struct TwoWireMode {
    speed_hz: u32,
}

impl Default for TwoWireMode {
    fn default() -> Self {
        TwoWireMode {
            speed_hz: DEFAULT_SPEED,
        }
    }
}

impl TwoWireMode {
    fn half_period_ns(&self) -> u32 {
        500_000_000 / self.speed_hz.max(1)
    }

    fn delay<P: Platform>(&self, ctx: &mut ModeContext<'_, P>) {
        ctx.bio.backend_mut().delay_ns(self.half_period_ns());
    }

    fn sda_set<P: Platform>(&self, ctx: &mut ModeContext<'_, P>, high: bool) {
        if high {
            ctx.bio.input(SDA);
        } else {
            ctx.bio.put(SDA, false);
            ctx.bio.output(SDA);
        }
    }

    fn scl_set<P: Platform>(&self, ctx: &mut ModeContext<'_, P>, high: bool) {
        if high {
            ctx.bio.input(SCL);
        } else {
            ctx.bio.put(SCL, false);
            ctx.bio.output(SCL);
        }
    }

    fn transfer_bit<P: Platform>(&self, ctx: &mut ModeContext<'_, P>, out: bool) -> bool {
        self.sda_set(ctx, out);
        self.delay(ctx);
        self.scl_set(ctx, true);
        let read = ctx.bio.get(SDA);
        self.delay(ctx);
        self.scl_set(ctx, false);
        read
    }

    fn transfer_byte<P: Platform>(&self, ctx: &mut ModeContext<'_, P>, byte: u8) -> u8 {
        let mut read = 0u8;
        for bit in (0..8).rev() {
            let sampled = self.transfer_bit(ctx, byte & (1 << bit) != 0);
            read = (read << 1) | sampled as u8;
        }
        read
    }
}

impl<P: Platform> ProtocolMode<P> for TwoWireMode {
    fn name(&self) -> &'static str {
        "2WIRE"
    }

    fn setup_exc(&mut self, ctx: &mut ModeContext<'_, P>) -> Result<(), ModeError> {
        ctx.bio.claim(SDA, PinPurpose::Mode, "SDA")?;
        ctx.bio.claim(SCL, PinPurpose::Mode, "SCL")?;
        ctx.bio.input(SDA);
        self.scl_set(ctx, false);
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut ModeContext<'_, P>) {
        for pin in [SDA, SCL] {
            let _ = ctx.bio.release(pin);
        }
    }

    fn get_speed(&self) -> Hertz {
        Hertz::from_raw(self.speed_hz)
    }

    fn help(&self) -> &'static str {
        "[ start, ] stop, 0x.. write, r read; no ACK slots on this bus"
    }

    fn start(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        // I2C-shaped start: data falls while the clock is high.
        self.sda_set(ctx, true);
        self.scl_set(ctx, true);
        self.delay(ctx);
        self.sda_set(ctx, false);
        self.delay(ctx);
        self.scl_set(ctx, false);
        result.message = Some("START");
    }

    fn stop(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        self.sda_set(ctx, false);
        self.delay(ctx);
        self.scl_set(ctx, true);
        self.delay(ctx);
        self.sda_set(ctx, true);
        result.message = Some("STOP");
    }

    fn write(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        result.in_data = self.transfer_byte(ctx, result.out_data as u8) as u32;
    }

    fn read(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        result.in_data = self.transfer_byte(ctx, 0xFF) as u32;
    }

    fn clock_high(&mut self, ctx: &mut ModeContext<'_, P>, _result: &mut Bytecode) {
        self.scl_set(ctx, true);
    }

    fn clock_low(&mut self, ctx: &mut ModeContext<'_, P>, _result: &mut Bytecode) {
        self.scl_set(ctx, false);
    }

    fn tick_clock(&mut self, ctx: &mut ModeContext<'_, P>, _result: &mut Bytecode) {
        self.scl_set(ctx, true);
        self.delay(ctx);
        self.scl_set(ctx, false);
        self.delay(ctx);
    }

    fn data_high(&mut self, ctx: &mut ModeContext<'_, P>, _result: &mut Bytecode) {
        self.sda_set(ctx, true);
    }

    fn data_low(&mut self, ctx: &mut ModeContext<'_, P>, _result: &mut Bytecode) {
        self.sda_set(ctx, false);
    }

    fn data_state(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        result.in_data = ctx.bio.get(SDA) as u32;
    }

    fn read_bit(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        result.in_data = self.transfer_bit(ctx, true) as u32;
    }

    fn binary_transaction(
        &mut self,
        ctx: &mut ModeContext<'_, P>,
        request: &DataRequest<'_>,
        read: &mut ReadBuffer,
    ) -> Result<(), BpioError> {
        if request.start_main || request.start_alt {
            let mut scratch = Bytecode::new(crate::bytecode::SyntaxCommand::Start);
            ProtocolMode::<P>::start(self, ctx, &mut scratch);
        }
        for &byte in request.data_write {
            let reply = self.transfer_byte(ctx, byte);
            if request.start_alt {
                read.push(reply).map_err(|_| BpioError::TooLarge)?;
            }
        }
        for _ in 0..request.bytes_read {
            let reply = self.transfer_byte(ctx, 0xFF);
            read.push(reply).map_err(|_| BpioError::TooLarge)?;
        }
        if request.stop_main || request.stop_alt {
            let mut scratch = Bytecode::new(crate::bytecode::SyntaxCommand::Stop);
            ProtocolMode::<P>::stop(self, ctx, &mut scratch);
        }
        run_bitwise_ops::<P>(ctx, request.bitwise_ops, SDA, SCL, SDA, read)?;
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
    fn transfers_sample_the_shared_data_line() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher.change_mode(ModeId::TwoWire, None).unwrap();
        let mut program = [
            Bytecode::new(SyntaxCommand::Start),
            Bytecode::write(0xA5),
            Bytecode::new(SyntaxCommand::Read),
            Bytecode::new(SyntaxCommand::Stop),
        ];
        dispatcher.run_syntax(&mut program).unwrap();
        // SDA is sampled while we drive it, so a write reads itself back.
        assert_eq!(program[1].in_data, 0xA5);
        // A read clocks the released line: idle bus reads all ones.
        assert_eq!(program[2].in_data, 0xFF);
        assert!(!dispatcher.error);
    }

    #[test]
    fn clock_ops_drive_scl() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher.change_mode(ModeId::TwoWire, None).unwrap();
        dispatcher.bio.backend_mut().start_trace();
        let mut program = [
            Bytecode::new(SyntaxCommand::ClockHigh),
            Bytecode::new(SyntaxCommand::ClockLow),
            Bytecode::new(SyntaxCommand::TickClock),
        ];
        dispatcher.run_syntax(&mut program).unwrap();
        let trace = dispatcher.bio.backend_mut().trace();
        let rises = trace
            .windows(2)
            .filter(|pair| {
                pair[0].levels & (1 << SCL) == 0 && pair[1].levels & (1 << SCL) != 0
            })
            .count();
        assert_eq!(rises, 2);
        assert_eq!(trace.last().unwrap().levels & (1 << SCL), 0);
    }

    #[test]
    fn start_and_stop_frame_the_data_line() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher.change_mode(ModeId::TwoWire, None).unwrap();
        let mut program = [
            Bytecode::new(SyntaxCommand::Start),
            Bytecode::new(SyntaxCommand::DataState),
            Bytecode::new(SyntaxCommand::Stop),
            Bytecode::new(SyntaxCommand::DataState),
        ];
        dispatcher.run_syntax(&mut program).unwrap();
        assert_eq!(program[0].message, Some("START"));
        // After the start condition the data line is held low.
        assert_eq!(program[1].in_data, 0);
        assert_eq!(program[2].message, Some("STOP"));
        // The stop condition releases it back to the idle level.
        assert_eq!(program[3].in_data, 1);
    }
}
