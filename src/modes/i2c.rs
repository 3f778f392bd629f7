//! I2C master over the buffered pins.
//!
//! Open-drain bit-bang: a line is driven by switching the pin between
//! output-low and input, never by driving high. Clock stretching is honored
//! by waiting for SCL to actually rise, bounded by a poll-count timeout so
//! a held-down bus cannot hang the event loop.

use crate::Platform;
use crate::bio::{PinBackend, PinPurpose};
use crate::bpio::{BpioError, DataRequest, run_bitwise_ops};
use crate::bytecode::Bytecode;
use crate::config;
use crate::time::Hertz;

use super::{
    ConfigError, I2cSetup, ModeCommand, ModeConfig, ModeContext, ModeError, ProtocolError,
    ProtocolMode, ReadBuffer,
};

pub const SDA: u8 = 0;
pub const SCL: u8 = 1;

/// Poll budget for a stretched clock before giving up.
const STRETCH_TIMEOUT: u32 = 0xFFF;

const COMMANDS: &[ModeCommand] = &[
    ModeCommand {
        name: "scan",
        description: "probe all I2C addresses for devices",
        suppress_fala_capture: false,
    },
    ModeCommand {
        name: "eeprom",
        description: "read/write I2C EEPROMs",
        suppress_fala_capture: false,
    },
];

/// One responding address pair from a bus scan.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScanHit {
    /// 7-bit device address.
    pub address: u8,
    pub write_ack: bool,
    pub read_ack: bool,
}

pub type ScanReport = heapless::Vec<ScanHit, 64>;

#[derive(Debug, Default)]
pub struct I2cMode {
    setup: I2cSetup,
    configured: bool,
    started: bool,
}

impl I2cMode {
    fn quarter_period_ns(&self) -> u32 {
        250_000_000 / self.setup.speed_hz.max(1)
    }

    fn sda_low<P: Platform>(&self, ctx: &mut ModeContext<'_, P>) {
        ctx.bio.put(SDA, false);
        ctx.bio.output(SDA);
    }

    fn sda_release<P: Platform>(&self, ctx: &mut ModeContext<'_, P>) {
        ctx.bio.input(SDA);
    }

    fn scl_low<P: Platform>(&self, ctx: &mut ModeContext<'_, P>) {
        ctx.bio.put(SCL, false);
        ctx.bio.output(SCL);
    }

    /// Releases SCL and waits out any clock stretching.
    fn scl_release<P: Platform>(&self, ctx: &mut ModeContext<'_, P>) -> Result<(), ProtocolError> {
        ctx.bio.input(SCL);
        let mut budget = STRETCH_TIMEOUT;
        while !ctx.bio.get(SCL) {
            budget -= 1;
            if budget == 0 {
                return Err(ProtocolError::Timeout);
            }
            ctx.bio.backend_mut().delay_ns(self.quarter_period_ns());
        }
        Ok(())
    }

    fn delay<P: Platform>(&self, ctx: &mut ModeContext<'_, P>) {
        ctx.bio.backend_mut().delay_ns(self.quarter_period_ns());
    }

    /// START (or repeated START) condition.
    fn start_condition<P: Platform>(
        &mut self,
        ctx: &mut ModeContext<'_, P>,
    ) -> Result<(), ProtocolError> {
        self.sda_release(ctx);
        self.scl_release(ctx)?;
        self.delay(ctx);
        self.sda_low(ctx);
        self.delay(ctx);
        self.scl_low(ctx);
        self.delay(ctx);
        self.started = true;
        Ok(())
    }

    fn stop_condition<P: Platform>(
        &mut self,
        ctx: &mut ModeContext<'_, P>,
    ) -> Result<(), ProtocolError> {
        self.sda_low(ctx);
        self.delay(ctx);
        self.scl_release(ctx)?;
        self.delay(ctx);
        self.sda_release(ctx);
        self.delay(ctx);
        self.started = false;
        Ok(())
    }

    fn write_bit<P: Platform>(
        &self,
        ctx: &mut ModeContext<'_, P>,
        bit: bool,
    ) -> Result<(), ProtocolError> {
        if bit {
            self.sda_release(ctx);
        } else {
            self.sda_low(ctx);
        }
        self.delay(ctx);
        self.scl_release(ctx)?;
        self.delay(ctx);
        self.scl_low(ctx);
        Ok(())
    }

    fn read_bit<P: Platform>(&self, ctx: &mut ModeContext<'_, P>) -> Result<bool, ProtocolError> {
        self.sda_release(ctx);
        self.delay(ctx);
        self.scl_release(ctx)?;
        let bit = ctx.bio.get(SDA);
        self.delay(ctx);
        self.scl_low(ctx);
        Ok(bit)
    }

    /// Writes one byte, MSB first. Returns true when the device ACKed.
    fn write_byte<P: Platform>(
        &self,
        ctx: &mut ModeContext<'_, P>,
        byte: u8,
    ) -> Result<bool, ProtocolError> {
        for bit in (0..8).rev() {
            self.write_bit(ctx, byte & (1 << bit) != 0)?;
        }
        let nack = self.read_bit(ctx)?;
        Ok(!nack)
    }

    fn read_byte<P: Platform>(
        &self,
        ctx: &mut ModeContext<'_, P>,
        ack: bool,
    ) -> Result<u8, ProtocolError> {
        let mut byte = 0u8;
        for _ in 0..8 {
            byte = (byte << 1) | self.read_bit(ctx)? as u8;
        }
        self.write_bit(ctx, !ack)?;
        Ok(byte)
    }

    /// Clears a wedged transfer: clock out up to nine bits until the device
    /// releases SDA, then issue a STOP.
    fn resume_after_error<P: Platform>(&mut self, ctx: &mut ModeContext<'_, P>) {
        self.sda_release(ctx);
        for _ in 0..9 {
            if ctx.bio.get(SDA) {
                break;
            }
            let _ = self.scl_release(ctx);
            self.delay(ctx);
            self.scl_low(ctx);
            self.delay(ctx);
        }
        let _ = self.stop_condition(ctx);
    }

    fn probe_address<P: Platform>(&mut self, ctx: &mut ModeContext<'_, P>, address: u8) -> bool {
        if self.start_condition(ctx).is_err() {
            self.resume_after_error(ctx);
            return false;
        }
        let ack = match self.write_byte(ctx, address) {
            Ok(ack) => ack,
            Err(_) => {
                self.resume_after_error(ctx);
                false
            }
        };
        // Read addresses that ACK get one byte clocked out, NACKed, so the
        // device ends the transfer cleanly.
        if ack && address & 1 != 0 && self.read_byte(ctx, false).is_err() {
            self.resume_after_error(ctx);
        }
        if self.stop_condition(ctx).is_err() {
            self.resume_after_error(ctx);
        }
        ack
    }

    /// Probes every read and write address on the bus.
    ///
    /// Reserved address ranges are probed like any other; skipping them
    /// hides misbehaving devices more often than it helps.
    pub fn scan<P: Platform>(&mut self, ctx: &mut ModeContext<'_, P>) -> ScanReport {
        let mut report = ScanReport::new();
        for address in (0u16..256).step_by(2) {
            let write_ack = self.probe_address(ctx, address as u8);
            let read_ack = self.probe_address(ctx, address as u8 + 1);
            if (write_ack || read_ack)
                && report
                    .push(ScanHit {
                        address: (address >> 1) as u8,
                        write_ack,
                        read_ack,
                    })
                    .is_err()
            {
                log::warn!("i2c scan: more devices than the report can hold");
                break;
            }
        }
        report
    }
}

impl<P: Platform> ProtocolMode<P> for I2cMode {
    fn name(&self) -> &'static str {
        "I2C"
    }

    fn commands(&self) -> &'static [ModeCommand] {
        COMMANDS
    }

    fn configure(&mut self, config: &ModeConfig) -> Result<(), ConfigError> {
        let ModeConfig::I2c(setup) = config else {
            return Err(ConfigError::WrongMode);
        };
        if setup.speed_hz == 0 || setup.speed_hz > 1_000_000 {
            return Err(ConfigError::OutOfRange("speed"));
        }
        self.setup = *setup;
        self.configured = true;
        Ok(())
    }

    fn setup_exc(&mut self, ctx: &mut ModeContext<'_, P>) -> Result<(), ModeError> {
        if !self.configured {
            if let Some(saved) = config::load_i2c(ctx.store) {
                self.setup = saved;
            }
            self.configured = true;
        }
        config::save_i2c(ctx.store, &self.setup);

        ctx.bio.claim(SDA, PinPurpose::Mode, "SDA")?;
        ctx.bio.claim(SCL, PinPurpose::Mode, "SCL")?;
        // Idle released; the pull-ups define the idle-high level.
        ctx.bio.input(SDA);
        ctx.bio.input(SCL);
        self.started = false;
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut ModeContext<'_, P>) {
        self.started = false;
        for pin in [SDA, SCL] {
            let _ = ctx.bio.release(pin);
        }
    }

    fn get_speed(&self) -> Hertz {
        Hertz::from_raw(self.setup.speed_hz)
    }

    fn preflight_sanity_check(&self, ctx: &mut ModeContext<'_, P>) -> Result<(), ModeError> {
        if !ctx.power.pullups_enabled {
            return Err(ModeError::SanityCheck("no pull-ups enabled"));
        }
        Ok(())
    }

    fn settings(&self, out: &mut dyn core::fmt::Write) -> core::fmt::Result {
        write!(
            out,
            "I2C speed: {}Hz, clock stretching: {}",
            self.setup.speed_hz,
            if self.setup.clock_stretch { "on" } else { "off" },
        )
    }

    fn help(&self) -> &'static str {
        "[ start, ] stop, 0x.. write, r read; scan probes the bus"
    }

    fn start(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        match self.start_condition(ctx) {
            Ok(()) => result.message = Some("I2C START"),
            Err(_) => {
                self.resume_after_error(ctx);
                result.error = true;
                result.message = Some("I2C START timeout");
            }
        }
    }

    fn start_alt(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        ProtocolMode::<P>::start(self, ctx, result);
    }

    fn stop(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        match self.stop_condition(ctx) {
            Ok(()) => result.message = Some("I2C STOP"),
            Err(_) => {
                self.resume_after_error(ctx);
                result.error = true;
                result.message = Some("I2C STOP timeout");
            }
        }
    }

    fn stop_alt(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        ProtocolMode::<P>::stop(self, ctx, result);
    }

    fn write(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        match self.write_byte(ctx, result.out_data as u8) {
            Ok(true) => result.message = Some("ACK"),
            Ok(false) => {
                result.error = true;
                result.message = Some("NACK");
            }
            Err(_) => {
                self.resume_after_error(ctx);
                result.error = true;
                result.message = Some("I2C timeout");
            }
        }
    }

    fn read(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        match self.read_byte(ctx, true) {
            Ok(byte) => result.in_data = byte as u32,
            Err(_) => {
                self.resume_after_error(ctx);
                result.error = true;
                result.message = Some("I2C timeout");
            }
        }
    }

    fn run_macro(&mut self, ctx: &mut ModeContext<'_, P>, which: u32, result: &mut Bytecode) {
        match which {
            1 => {
                let report = self.scan(ctx);
                for hit in &report {
                    log::info!(
                        "0x{:02X} (0x{:02X} W{}) (0x{:02X} R{})",
                        hit.address,
                        hit.address << 1,
                        if hit.write_ack { "" } else { " nack" },
                        (hit.address << 1) | 1,
                        if hit.read_ack { "" } else { " nack" },
                    );
                }
                result.in_data = report.len() as u32;
                result.message = Some("address search complete");
            }
            _ => crate::bytecode::no_effect(result),
        }
    }

    fn binary_transaction(
        &mut self,
        ctx: &mut ModeContext<'_, P>,
        request: &DataRequest<'_>,
        read: &mut ReadBuffer,
    ) -> Result<(), BpioError> {
        if request.debug {
            log::debug!("[I2C] transaction: {request:?}");
        }
        if request.start_main || request.start_alt {
            self.start_condition(ctx).map_err(|_| BpioError::Timeout)?;
        }
        for &byte in request.data_write {
            match self.write_byte(ctx, byte) {
                Ok(true) => {}
                Ok(false) => {
                    let _ = self.stop_condition(ctx);
                    return Err(BpioError::BusError);
                }
                Err(_) => {
                    self.resume_after_error(ctx);
                    return Err(BpioError::Timeout);
                }
            }
        }
        if request.bytes_read > 0 {
            if request.start_main || request.start_alt {
                // Repeated START between the write and read phases.
                self.start_condition(ctx).map_err(|_| BpioError::Timeout)?;
            }
            for index in 0..request.bytes_read {
                let last = index + 1 == request.bytes_read;
                let byte = self
                    .read_byte(ctx, !last)
                    .map_err(|_| BpioError::Timeout)?;
                read.push(byte).map_err(|_| BpioError::TooLarge)?;
            }
        }
        if request.stop_main || request.stop_alt {
            self.stop_condition(ctx).map_err(|_| BpioError::Timeout)?;
        }
        run_bitwise_ops::<P>(ctx, request.bitwise_ops, SDA, SCL, SDA, read)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::loopback_dispatcher;
    use crate::modes::{ActiveMode, ModeId};

    #[test]
    fn scan_finds_the_single_responder() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher.bio.backend_mut().attach_i2c_device(0x3C);
        dispatcher
            .change_mode(ModeId::I2c, Some(&ModeConfig::I2c(I2cSetup::default())))
            .unwrap();
        dispatcher.power.pullups_enabled = true;

        let (active, mut ctx) = dispatcher.split();
        let ActiveMode::I2c(mode) = active else {
            panic!("wrong mode");
        };
        let report = mode.scan(&mut ctx);
        assert_eq!(report.len(), 1);
        assert_eq!(
            report[0],
            ScanHit {
                address: 0x3C,
                write_ack: true,
                read_ack: true,
            }
        );
    }

    #[test]
    fn preflight_requires_pullups() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher
            .change_mode(ModeId::I2c, Some(&ModeConfig::I2c(I2cSetup::default())))
            .unwrap();
        let mut program = [Bytecode::new(crate::bytecode::SyntaxCommand::Start)];
        assert!(dispatcher.run_syntax(&mut program).is_err());
        dispatcher.power.pullups_enabled = true;
        assert!(dispatcher.run_syntax(&mut program).is_ok());
    }
}
