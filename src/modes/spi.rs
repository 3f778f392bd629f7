//! SPI master over the buffered pins.
//!
//! Bit-banged with explicit clock phase/polarity handling so every one of
//! the four SPI modes behaves exactly like the hardware block it replaces.
//! The chip select is a plain GPIO with configurable idle level.

use embedded_hal::spi::{MODE_0, MODE_1, MODE_2, MODE_3, Mode};

use crate::Platform;
use crate::bio::{PinBackend, PinPurpose};
use crate::bpio::{BpioError, DataRequest, run_bitwise_ops};
use crate::bytecode::{Bytecode, reverse_bits};
use crate::config;
use crate::time::Hertz;

use super::{
    BitOrder, ConfigError, ModeCommand, ModeConfig, ModeContext, ModeError, ProtocolMode,
    ReadBuffer, SpiSetup,
};

pub const SCLK: u8 = 0;
pub const MOSI: u8 = 1;
pub const MISO: u8 = 2;
pub const CS: u8 = 3;

const COMMANDS: &[ModeCommand] = &[
    ModeCommand {
        name: "flash",
        description: "read/write/erase SPI flash chips",
        suppress_fala_capture: false,
    },
    ModeCommand {
        name: "eeprom",
        description: "read/write SPI EEPROMs",
        suppress_fala_capture: false,
    },
    ModeCommand {
        name: "sniff",
        description: "observe SPI traffic with the logic analyzer",
        suppress_fala_capture: true,
    },
];

/// The `embedded-hal` mode equivalent to a polarity/phase pair.
pub fn hal_mode(setup: &SpiSetup) -> Mode {
    match (setup.clock_polarity, setup.clock_phase) {
        (false, false) => MODE_0,
        (false, true) => MODE_1,
        (true, false) => MODE_2,
        (true, true) => MODE_3,
    }
}

#[inline(always)]
pub fn mode_to_cpol_cpha(mode: Mode) -> (bool, bool) {
    match mode {
        MODE_0 => (false, false),
        MODE_1 => (false, true),
        MODE_2 => (true, false),
        MODE_3 => (true, true),
    }
}

#[derive(Debug, Default)]
pub struct SpiMode {
    setup: SpiSetup,
    configured: bool,
    cs_asserted: bool,
    read_with_write: bool,
}

impl SpiMode {
    fn half_period_ns(&self) -> u32 {
        500_000_000 / self.setup.speed_hz.max(1)
    }

    fn clock_idle(&self) -> bool {
        self.setup.clock_polarity
    }

    fn cs_level(&self, asserted: bool) -> bool {
        // Idle-high CS is the common active-low select.
        asserted != self.setup.chip_select_idle_high
    }

    fn set_cs<P: Platform>(&mut self, ctx: &mut ModeContext<'_, P>, asserted: bool) {
        self.cs_asserted = asserted;
        let level = self.cs_level(asserted);
        ctx.bio.put(CS, level);
    }

    /// Shifts one word out on MOSI while sampling MISO, MSB first.
    fn transfer_word<P: Platform>(
        &self,
        ctx: &mut ModeContext<'_, P>,
        value: u32,
        bits: u8,
    ) -> u32 {
        let half = self.half_period_ns();
        let (idle, cpha) = mode_to_cpol_cpha(hal_mode(&self.setup));
        let mut read = 0u32;
        for bit in (0..bits).rev() {
            let out = value & (1 << bit) != 0;
            if !cpha {
                // Data valid before the leading edge; devices sample on it.
                ctx.bio.put(MOSI, out);
                ctx.bio.backend_mut().delay_ns(half);
                ctx.bio.put(SCLK, !idle);
                read = (read << 1) | ctx.bio.get(MISO) as u32;
                ctx.bio.backend_mut().delay_ns(half);
                ctx.bio.put(SCLK, idle);
            } else {
                // Data changes on the leading edge, sampled on the trailing.
                ctx.bio.put(SCLK, !idle);
                ctx.bio.put(MOSI, out);
                ctx.bio.backend_mut().delay_ns(half);
                ctx.bio.put(SCLK, idle);
                read = (read << 1) | ctx.bio.get(MISO) as u32;
                ctx.bio.backend_mut().delay_ns(half);
            }
        }
        read
    }

    fn transfer_byte<P: Platform>(&self, ctx: &mut ModeContext<'_, P>, byte: u8) -> u8 {
        self.transfer_word(ctx, byte as u32, 8) as u8
    }
}

impl<P: Platform> ProtocolMode<P> for SpiMode {
    fn name(&self) -> &'static str {
        "SPI"
    }

    fn commands(&self) -> &'static [ModeCommand] {
        COMMANDS
    }

    fn configure(&mut self, config: &ModeConfig) -> Result<(), ConfigError> {
        let ModeConfig::Spi(setup) = config else {
            return Err(ConfigError::WrongMode);
        };
        if setup.speed_hz == 0 || setup.speed_hz > 62_500_000 {
            return Err(ConfigError::OutOfRange("speed"));
        }
        if !(1..=32).contains(&setup.data_bits) {
            return Err(ConfigError::OutOfRange("data bits"));
        }
        self.setup = *setup;
        self.configured = true;
        Ok(())
    }

    fn setup_exc(&mut self, ctx: &mut ModeContext<'_, P>) -> Result<(), ModeError> {
        if !self.configured {
            if let Some(saved) = config::load_spi(ctx.store) {
                self.setup = saved;
            }
            self.configured = true;
        }
        config::save_spi(ctx.store, &self.setup);

        ctx.bio.claim(SCLK, PinPurpose::Mode, "SCLK")?;
        ctx.bio.claim(MOSI, PinPurpose::Mode, "MOSI")?;
        ctx.bio.claim(MISO, PinPurpose::Mode, "MISO")?;
        ctx.bio.claim(CS, PinPurpose::Mode, "CS")?;

        ctx.bio.output(SCLK);
        ctx.bio.put(SCLK, self.clock_idle());
        ctx.bio.output(MOSI);
        ctx.bio.input(MISO);
        ctx.bio.output(CS);
        self.cs_asserted = false;
        let idle = self.cs_level(false);
        ctx.bio.put(CS, idle);
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut ModeContext<'_, P>) {
        self.read_with_write = false;
        self.cs_asserted = false;
        for pin in [SCLK, MOSI, MISO, CS] {
            let _ = ctx.bio.release(pin);
        }
    }

    fn get_speed(&self) -> Hertz {
        Hertz::from_raw(self.setup.speed_hz)
    }

    fn settings(&self, out: &mut dyn core::fmt::Write) -> core::fmt::Result {
        write!(
            out,
            "SPI speed: {}Hz, bits: {}, CPOL: {}, CPHA: {}, CS idle: {}",
            self.setup.speed_hz,
            self.setup.data_bits,
            self.setup.clock_polarity as u8,
            self.setup.clock_phase as u8,
            if self.setup.chip_select_idle_high { "high" } else { "low" },
        )
    }

    fn help(&self) -> &'static str {
        "[ select chip, ] deselect chip, 0x.. write, r read"
    }

    fn start(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        self.read_with_write = false;
        self.set_cs(ctx, true);
        result.message = Some("CS ENABLED");
    }

    fn start_alt(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        self.read_with_write = true;
        self.set_cs(ctx, true);
        result.message = Some("CS ENABLED (READ WHILE WRITE)");
    }

    fn stop(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        self.read_with_write = false;
        self.set_cs(ctx, false);
        result.message = Some("CS DISABLED");
    }

    fn stop_alt(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        ProtocolMode::<P>::stop(self, ctx, result);
    }

    fn write(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        let bits = result.effective_bits(self.setup.data_bits);
        result.in_data = self.transfer_word(ctx, result.out_data, bits);
    }

    fn read(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        let bits = result.effective_bits(self.setup.data_bits);
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
        ctx.bio.put(SCLK, !self.clock_idle());
        ctx.bio.backend_mut().delay_ns(half);
        ctx.bio.put(SCLK, self.clock_idle());
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
        if request.debug {
            log::debug!("[SPI] transaction: {request:?}");
        }
        let lsb_first = ctx.display.bit_order == BitOrder::LsbFirst;

        if request.start_main || request.start_alt {
            self.set_cs(ctx, true);
        }

        for &byte in request.data_write {
            let wire = if lsb_first {
                reverse_bits(byte as u32, 8) as u8
            } else {
                byte
            };
            let reply = self.transfer_byte(ctx, wire);
            if request.start_alt {
                let reply = if lsb_first {
                    reverse_bits(reply as u32, 8) as u8
                } else {
                    reply
                };
                read.push(reply).map_err(|_| BpioError::TooLarge)?;
            }
        }

        for _ in 0..request.bytes_read {
            let reply = self.transfer_byte(ctx, 0xFF);
            let reply = if lsb_first {
                reverse_bits(reply as u32, 8) as u8
            } else {
                reply
            };
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
    use crate::dispatcher::tests::loopback_dispatcher;
    use crate::modes::ModeId;

    #[test]
    fn eeprom_write_drives_the_documented_mosi_pattern() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher
            .change_mode(
                ModeId::Spi,
                Some(&ModeConfig::Spi(SpiSetup {
                    speed_hz: 100_000,
                    ..SpiSetup::default()
                })),
            )
            .unwrap();
        dispatcher.bio.backend_mut().start_trace();

        let mut program = [
            Bytecode::new(crate::bytecode::SyntaxCommand::Start),
            Bytecode::write(0x02),
            Bytecode::write(0x00),
            Bytecode::write(0x00),
            Bytecode::write(0xAA),
            Bytecode::write(0x55),
            Bytecode::new(crate::bytecode::SyntaxCommand::Stop),
        ];
        dispatcher.run_syntax(&mut program).unwrap();

        let trace = dispatcher.bio.backend_mut().trace();
        // CS (bio3) low for the whole burst between the start/stop records.
        let cs_low: Vec<_> = trace
            .iter()
            .filter(|event| event.levels & (1 << CS) == 0)
            .collect();
        assert!(!cs_low.is_empty());

        // MOSI sampled at each rising SCLK edge while CS is low.
        let mut bits = Vec::new();
        let mut last = trace[0].levels;
        for event in &trace[1..] {
            let rising = last & (1 << SCLK) == 0 && event.levels & (1 << SCLK) != 0;
            if rising && event.levels & (1 << CS) == 0 {
                bits.push((event.levels >> MOSI) & 1);
            }
            last = event.levels;
        }
        let expected: Vec<u8> = [0x02u8, 0x00, 0x00, 0xAA, 0x55]
            .iter()
            .flat_map(|byte| (0..8).rev().map(move |bit| (byte >> bit) & 1))
            .collect();
        assert_eq!(bits, expected);
    }

    #[test]
    fn loopback_jumper_reads_back_written_words() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher.bio.backend_mut().tie(MOSI, MISO);
        dispatcher
            .change_mode(ModeId::Spi, Some(&ModeConfig::Spi(SpiSetup::default())))
            .unwrap();

        let mut program = [
            Bytecode::new(crate::bytecode::SyntaxCommand::StartAlt),
            Bytecode::write(0xA5),
            Bytecode::write(0x0F).with_bits(4),
            Bytecode::new(crate::bytecode::SyntaxCommand::Stop),
        ];
        dispatcher.run_syntax(&mut program).unwrap();
        assert_eq!(program[1].in_data, 0xA5);
        assert_eq!(program[2].in_data, 0x0F);
    }

    #[test]
    fn rejects_out_of_range_configuration() {
        let mut mode = SpiMode::default();
        let bad = ModeConfig::Spi(SpiSetup {
            speed_hz: 0,
            ..SpiSetup::default()
        });
        assert_eq!(
            <SpiMode as ProtocolMode<crate::loopback::LoopbackPlatform>>::configure(
                &mut mode, &bad
            ),
            Err(ConfigError::OutOfRange("speed"))
        );
    }
}
