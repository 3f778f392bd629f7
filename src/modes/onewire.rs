//! 1-Wire master, bit-banged on a single open-drain line.
//!
//! Standard-speed slot timings throughout: reset 480 us, write slots 60 us,
//! read sample at 15 us. ROM enumeration implements the SEARCH ROM binary
//! tree walk and keeps its discrepancy state between calls so repeated
//! searches step through every device on the bus.

use crate::Platform;
use crate::bio::{PinBackend, PinPurpose};
use crate::bpio::{BpioError, DataRequest, run_bitwise_ops};
use crate::bytecode::Bytecode;
use crate::time::Hertz;

use super::{
    ModeCommand, ModeContext, ModeError, ProtocolError, ProtocolMode, ReadBuffer,
};

pub const OWD: u8 = 0;

/// SEARCH ROM command, exposed as macro `(240)`.
pub const SEARCH_ROM: u8 = 0xF0;
pub const READ_ROM: u8 = 0x33;
pub const SKIP_ROM: u8 = 0xCC;
pub const MATCH_ROM: u8 = 0x55;

const COMMANDS: &[ModeCommand] = &[
    ModeCommand {
        name: "scan",
        description: "enumerate device ROMs on the bus",
        suppress_fala_capture: false,
    },
    ModeCommand {
        name: "ds18b20",
        description: "read a DS18B20 temperature sensor",
        suppress_fala_capture: false,
    },
];

/// Dallas/Maxim CRC8, polynomial 0x8C reflected.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        let mut byte = byte;
        for _ in 0..8 {
            let mix = (crc ^ byte) & 1;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8C;
            }
            byte >>= 1;
        }
    }
    crc
}

/// Friendly name for a ROM family code.
pub fn family_name(family: u8) -> &'static str {
    match family {
        0x01 => "silicon serial number",
        0x10 => "digital thermometer",
        0x22 => "econo digital thermometer",
        0x26 => "smart battery monitor",
        0x28 => "programmable resolution digital thermometer",
        0x2D => "1K EEPROM",
        _ => "unknown family",
    }
}

/// SEARCH ROM tree-walk state, carried across calls.
#[derive(Debug, Default)]
struct SearchState {
    last_discrepancy: u8,
    last_device: bool,
    rom: [u8; 8],
}

#[derive(Debug, Default)]
pub struct OneWireMode {
    search: SearchState,
}

impl OneWireMode {
    fn line_low<P: Platform>(&self, ctx: &mut ModeContext<'_, P>) {
        ctx.bio.put(OWD, false);
        ctx.bio.output(OWD);
    }

    fn line_release<P: Platform>(&self, ctx: &mut ModeContext<'_, P>) {
        ctx.bio.input(OWD);
    }

    fn delay_us<P: Platform>(&self, ctx: &mut ModeContext<'_, P>, us: u32) {
        ctx.bio.backend_mut().delay_ns(us * 1_000);
    }

    /// Reset pulse and presence detect. `Ok(true)` when a device answered.
    pub fn reset<P: Platform>(
        &self,
        ctx: &mut ModeContext<'_, P>,
    ) -> Result<bool, ProtocolError> {
        self.line_low(ctx);
        self.delay_us(ctx, 480);
        self.line_release(ctx);
        self.delay_us(ctx, 70);
        let presence = !ctx.bio.get(OWD);
        self.delay_us(ctx, 410);
        if !ctx.bio.get(OWD) {
            // Line stuck low after the presence window.
            return Err(ProtocolError::ShortCircuit);
        }
        Ok(presence)
    }

    pub fn write_bit<P: Platform>(&self, ctx: &mut ModeContext<'_, P>, bit: bool) {
        self.line_low(ctx);
        if bit {
            self.delay_us(ctx, 6);
            self.line_release(ctx);
            self.delay_us(ctx, 64);
        } else {
            self.delay_us(ctx, 60);
            self.line_release(ctx);
            self.delay_us(ctx, 10);
        }
    }

    pub fn read_bit_slot<P: Platform>(&self, ctx: &mut ModeContext<'_, P>) -> bool {
        self.line_low(ctx);
        self.delay_us(ctx, 6);
        self.line_release(ctx);
        self.delay_us(ctx, 9);
        let bit = ctx.bio.get(OWD);
        self.delay_us(ctx, 55);
        bit
    }

    pub fn write_byte<P: Platform>(&self, ctx: &mut ModeContext<'_, P>, byte: u8) {
        // LSB first on the wire.
        for bit in 0..8 {
            self.write_bit(ctx, byte & (1 << bit) != 0);
        }
    }

    pub fn read_byte<P: Platform>(&self, ctx: &mut ModeContext<'_, P>) -> u8 {
        let mut byte = 0u8;
        for bit in 0..8 {
            if self.read_bit_slot(ctx) {
                byte |= 1 << bit;
            }
        }
        byte
    }

    /// Restarts the ROM search from the beginning of the tree.
    pub fn search_reset(&mut self) {
        self.search = SearchState::default();
    }

    /// One SEARCH ROM pass. Returns the next ROM on the bus, or `None` when
    /// the walk is exhausted.
    pub fn search_next<P: Platform>(
        &mut self,
        ctx: &mut ModeContext<'_, P>,
    ) -> Result<Option<[u8; 8]>, ProtocolError> {
        if self.search.last_device {
            self.search_reset();
            return Ok(None);
        }
        if !self.reset(ctx)? {
            self.search_reset();
            return Err(ProtocolError::NoDevice);
        }
        self.write_byte(ctx, SEARCH_ROM);

        let mut last_zero = 0u8;
        for bit_number in 1..=64u8 {
            let bit = self.read_bit_slot(ctx);
            let complement = self.read_bit_slot(ctx);
            if bit && complement {
                // Nothing answered this branch.
                self.search_reset();
                return Ok(None);
            }
            let index = ((bit_number - 1) / 8) as usize;
            let mask = 1u8 << ((bit_number - 1) % 8);
            let direction = if bit != complement {
                bit
            } else {
                // Discrepancy: retrace the previous path, then branch.
                let chosen = if bit_number < self.search.last_discrepancy {
                    self.search.rom[index] & mask != 0
                } else {
                    bit_number == self.search.last_discrepancy
                };
                if !chosen {
                    last_zero = bit_number;
                }
                chosen
            };
            if direction {
                self.search.rom[index] |= mask;
            } else {
                self.search.rom[index] &= !mask;
            }
            self.write_bit(ctx, direction);
        }

        let rom = self.search.rom;
        if crc8(&rom[..7]) != rom[7] {
            // A glitched bit somewhere in the pass. Discard it and restart
            // the walk; a corrupt ROM must not steer later passes either.
            log::warn!("1-wire: ROM CRC mismatch on {rom:02x?}, pass discarded");
            self.search_reset();
            return Ok(None);
        }
        self.search.last_discrepancy = last_zero;
        if last_zero == 0 {
            self.search.last_device = true;
        }
        Ok(Some(rom))
    }
}

impl<P: Platform> ProtocolMode<P> for OneWireMode {
    fn name(&self) -> &'static str {
        "1WIRE"
    }

    fn commands(&self) -> &'static [ModeCommand] {
        COMMANDS
    }

    fn setup_exc(&mut self, ctx: &mut ModeContext<'_, P>) -> Result<(), ModeError> {
        ctx.bio.claim(OWD, PinPurpose::Mode, "OWD")?;
        ctx.bio.input(OWD);
        self.search_reset();
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut ModeContext<'_, P>) {
        let _ = ctx.bio.release(OWD);
    }

    fn get_speed(&self) -> Hertz {
        // Standard-speed slots are ~65 us, an effective 15 kbit/s.
        Hertz::from_raw(15_000)
    }

    fn preflight_sanity_check(&self, ctx: &mut ModeContext<'_, P>) -> Result<(), ModeError> {
        if !ctx.power.pullups_enabled {
            return Err(ModeError::SanityCheck("no pull-ups enabled"));
        }
        Ok(())
    }

    fn help(&self) -> &'static str {
        "[ reset, 0x.. write, r read; macro (240) searches ROMs"
    }

    fn start(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        match self.reset(ctx) {
            Ok(true) => result.message = Some("bus reset, device present"),
            Ok(false) => {
                result.error = true;
                result.message = Some("bus reset, no response");
            }
            Err(_) => {
                result.error = true;
                result.message = Some("bus held low");
            }
        }
    }

    fn start_alt(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        ProtocolMode::<P>::start(self, ctx, result);
    }

    fn write(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        self.write_byte(ctx, result.out_data as u8);
    }

    fn read(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        result.in_data = self.read_byte(ctx) as u32;
    }

    fn read_bit(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        result.in_data = self.read_bit_slot(ctx) as u32;
    }

    fn run_macro(&mut self, ctx: &mut ModeContext<'_, P>, which: u32, result: &mut Bytecode) {
        match which {
            240 => {
                self.search_reset();
                let mut found = 0u32;
                loop {
                    match self.search_next(ctx) {
                        Ok(Some(rom)) => {
                            found += 1;
                            log::info!(
                                "ROM {:02x?}: {}",
                                rom,
                                family_name(rom[0])
                            );
                        }
                        Ok(None) => break,
                        Err(error) => {
                            result.error = true;
                            result.message = Some(match error {
                                ProtocolError::NoDevice => "no device found",
                                _ => "bus error during search",
                            });
                            return;
                        }
                    }
                }
                result.in_data = found;
                result.message = Some("ROM search complete");
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
            log::debug!("[1WIRE] transaction: {request:?}");
        }
        if (request.start_main || request.start_alt)
            && !self.reset(ctx).map_err(|_| BpioError::BusError)?
        {
            return Err(BpioError::BusError);
        }
        for &byte in request.data_write {
            self.write_byte(ctx, byte);
        }
        for _ in 0..request.bytes_read {
            let byte = self.read_byte(ctx);
            read.push(byte).map_err(|_| BpioError::TooLarge)?;
        }
        run_bitwise_ops::<P>(ctx, request.bitwise_ops, OWD, OWD, OWD, read)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::loopback_dispatcher;
    use crate::modes::{ActiveMode, ModeId};

    const DS18B20_SERIAL: [u8; 6] = [0x11, 0x22, 0x33, 0x44, 0x55, 0x66];

    fn ds18b20_rom() -> [u8; 8] {
        let mut rom = [0u8; 8];
        rom[0] = 0x28;
        rom[1..7].copy_from_slice(&DS18B20_SERIAL);
        rom[7] = crc8(&rom[..7]);
        rom
    }

    #[test]
    fn crc8_matches_the_dallas_reference() {
        // Example ROM from the DS18B20 datasheet discussion.
        let rom = [0x28u8, 0xE8, 0xA7, 0x96, 0x04, 0x00, 0x00];
        let crc = crc8(&rom);
        let mut full = [0u8; 8];
        full[..7].copy_from_slice(&rom);
        full[7] = crc;
        assert_eq!(crc8(&full), 0);
    }

    #[test]
    fn search_rom_enumerates_the_simulated_thermometer() {
        let mut dispatcher = loopback_dispatcher();
        let rom = ds18b20_rom();
        dispatcher.bio.backend_mut().attach_onewire_device(rom);
        dispatcher.change_mode(ModeId::OneWire, None).unwrap();
        dispatcher.power.pullups_enabled = true;

        let (active, mut ctx) = dispatcher.split();
        let ActiveMode::OneWire(mode) = active else {
            panic!("wrong mode");
        };
        assert!(mode.reset(&mut ctx).unwrap());
        let found = mode.search_next(&mut ctx).unwrap();
        assert_eq!(found, Some(rom));
        assert_eq!(
            family_name(rom[0]),
            "programmable resolution digital thermometer"
        );
        // The walk is exhausted after the single device.
        assert_eq!(mode.search_next(&mut ctx).unwrap(), None);
    }

    #[test]
    fn corrupted_rom_is_discarded_not_reported() {
        let mut dispatcher = loopback_dispatcher();
        let mut rom = ds18b20_rom();
        // Glitch one bit of the CRC byte the device serves.
        rom[7] ^= 0x01;
        dispatcher.bio.backend_mut().attach_onewire_device(rom);
        dispatcher.change_mode(ModeId::OneWire, None).unwrap();
        dispatcher.power.pullups_enabled = true;

        let (active, mut ctx) = dispatcher.split();
        let ActiveMode::OneWire(mode) = active else {
            panic!("wrong mode");
        };
        assert_eq!(mode.search_next(&mut ctx).unwrap(), None);
        // The discarded pass left the walk restartable, not wedged on
        // stale discrepancy state.
        assert_eq!(mode.search_next(&mut ctx).unwrap(), None);
    }

    #[test]
    fn reset_without_devices_reports_no_presence() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher.change_mode(ModeId::OneWire, None).unwrap();
        let (active, mut ctx) = dispatcher.split();
        let ActiveMode::OneWire(mode) = active else {
            panic!("wrong mode");
        };
        assert_eq!(mode.reset(&mut ctx), Ok(false));
    }
}
