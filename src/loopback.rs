//! Deterministic loopback back-ends for every hardware seam.
//!
//! These drive the self-test paths and the host test suite: pins with
//! attachable bus device models and a signal trace, a wired-back serial
//! port, an echoing intercore FIFO and an in-memory configuration store.
//! Model time only advances through [`crate::bio::PinBackend::delay_ns`],
//! which is what makes the time-coded buses (1-Wire) reproducible.

use embedded_hal::digital::PinState;

use crate::bio::{BIO_PIN_COUNT, PinBackend, PinDirection};
use crate::config::{ConfigStore, StoreError};
use crate::intercore::IntercoreFifo;
use crate::modes::UartSetup;
use crate::modes::uart::SerialPort;

/// One recorded signal change.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub t_ns: u64,
    /// All eight pin levels after the change, bit `n` = BIO`n`.
    pub levels: u8,
}

const TRACE_CAPACITY: usize = 4096;

//==================================================================================================
// I2C responder model
//==================================================================================================

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum I2cPhase {
    Idle,
    /// Receiving eight bits; `first` marks the address byte.
    Receive { count: u8, byte: u8, first: bool },
    /// Driving the ACK slot low.
    AckOut { then_transmit: bool },
    /// Shifting a data byte out to the host.
    Transmit { byte: u8, count: u8 },
    /// Host ACK/NACK slot after a transmitted byte.
    AckIn { acked: bool },
    /// Not addressed; ignore traffic until the next START.
    Ghost,
}

/// Edge-clocked I2C slave at a fixed 7-bit address. Read transfers return a
/// deterministic incrementing pattern.
#[derive(Debug)]
struct I2cResponder {
    address: u8,
    phase: I2cPhase,
    drive_sda_low: bool,
    next_data: u8,
}

impl I2cResponder {
    fn new(address: u8) -> Self {
        I2cResponder {
            address,
            phase: I2cPhase::Idle,
            drive_sda_low: false,
            next_data: 0x5A,
        }
    }

    fn load_next(&mut self) -> u8 {
        let byte = self.next_data;
        self.next_data = self.next_data.wrapping_add(1);
        byte
    }

    /// Feeds one pair of bus levels; `sda`/`scl` are the new levels.
    fn on_edge(&mut self, old_sda: bool, old_scl: bool, sda: bool, scl: bool) {
        // START/STOP outrank every phase.
        if scl && old_scl {
            if old_sda && !sda {
                self.phase = I2cPhase::Receive {
                    count: 0,
                    byte: 0,
                    first: true,
                };
                self.drive_sda_low = false;
                return;
            }
            if !old_sda && sda {
                self.phase = I2cPhase::Idle;
                self.drive_sda_low = false;
                return;
            }
        }

        let scl_rise = scl && !old_scl;
        let scl_fall = !scl && old_scl;

        match self.phase {
            I2cPhase::Idle | I2cPhase::Ghost => {}
            I2cPhase::Receive {
                ref mut count,
                ref mut byte,
                first,
            } => {
                if scl_rise && *count < 8 {
                    *byte = (*byte << 1) | sda as u8;
                    *count += 1;
                } else if scl_fall && *count == 8 {
                    let byte = *byte;
                    if first {
                        if byte >> 1 == self.address {
                            self.drive_sda_low = true;
                            self.phase = I2cPhase::AckOut {
                                then_transmit: byte & 1 != 0,
                            };
                        } else {
                            self.phase = I2cPhase::Ghost;
                        }
                    } else {
                        // Data byte written to us.
                        self.drive_sda_low = true;
                        self.phase = I2cPhase::AckOut {
                            then_transmit: false,
                        };
                    }
                }
            }
            I2cPhase::AckOut { then_transmit } => {
                if scl_fall {
                    self.drive_sda_low = false;
                    if then_transmit {
                        let byte = self.load_next();
                        self.drive_sda_low = byte & 0x80 == 0;
                        self.phase = I2cPhase::Transmit { byte, count: 0 };
                    } else {
                        self.phase = I2cPhase::Receive {
                            count: 0,
                            byte: 0,
                            first: false,
                        };
                    }
                }
            }
            I2cPhase::Transmit {
                byte,
                ref mut count,
            } => {
                if scl_fall {
                    *count += 1;
                    if *count == 8 {
                        self.drive_sda_low = false;
                        self.phase = I2cPhase::AckIn { acked: false };
                    } else {
                        let bit = (byte >> (7 - *count)) & 1;
                        self.drive_sda_low = bit == 0;
                    }
                }
            }
            I2cPhase::AckIn { ref mut acked } => {
                if scl_rise {
                    *acked = !sda;
                } else if scl_fall {
                    if *acked {
                        let byte = self.load_next();
                        self.drive_sda_low = byte & 0x80 == 0;
                        self.phase = I2cPhase::Transmit { byte, count: 0 };
                    } else {
                        self.phase = I2cPhase::Ghost;
                    }
                }
            }
        }
    }
}

//==================================================================================================
// 1-Wire slave model
//==================================================================================================

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum SearchStage {
    SendBit,
    SendComplement,
    ReadDirection,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum OwPhase {
    WaitReset,
    ReadCommand { count: u8, byte: u8 },
    Search { index: u8, stage: SearchStage },
    TransmitRom { bit: u8 },
    Dormant,
}

/// Time-coded 1-Wire slave with a fixed 64-bit ROM. Slot timings follow the
/// standard-speed datasheet numbers.
#[derive(Debug)]
struct OneWireSlave {
    rom: [u8; 8],
    phase: OwPhase,
    fall_time: Option<u64>,
    /// Absolute time at which a host write slot gets sampled.
    pending_sample: Option<u64>,
    /// Device holds the line low until this absolute time.
    drive_until: u64,
    presence: Option<(u64, u64)>,
}

const OW_RESET_MIN_NS: u64 = 480_000;
const OW_SAMPLE_OFFSET_NS: u64 = 30_000;
const OW_TX_HOLD_NS: u64 = 45_000;
const OW_PRESENCE_START_NS: u64 = 30_000;
const OW_PRESENCE_END_NS: u64 = 150_000;

impl OneWireSlave {
    fn new(rom: [u8; 8]) -> Self {
        OneWireSlave {
            rom,
            phase: OwPhase::WaitReset,
            fall_time: None,
            pending_sample: None,
            drive_until: 0,
            presence: None,
        }
    }

    fn rom_bit(&self, index: u8) -> bool {
        self.rom[(index / 8) as usize] & (1 << (index % 8)) != 0
    }

    fn drives_low(&self, now: u64) -> bool {
        if now < self.drive_until {
            return true;
        }
        matches!(self.presence, Some((start, end)) if now >= start && now < end)
    }

    /// Evaluates a due write-slot sample against the line level that held
    /// since the previous event.
    fn evaluate_pending(&mut self, now: u64, line_high: bool) {
        let Some(at) = self.pending_sample else {
            return;
        };
        if now < at {
            return;
        }
        self.pending_sample = None;
        let bit = line_high;
        let mut phase = self.phase;
        match phase {
            OwPhase::ReadCommand {
                ref mut count,
                ref mut byte,
            } => {
                if bit {
                    *byte |= 1 << *count;
                }
                *count += 1;
                if *count == 8 {
                    phase = match *byte {
                        0xF0 => OwPhase::Search {
                            index: 0,
                            stage: SearchStage::SendBit,
                        },
                        0x33 => OwPhase::TransmitRom { bit: 0 },
                        0xCC => OwPhase::ReadCommand { count: 0, byte: 0 },
                        _ => OwPhase::Dormant,
                    };
                }
            }
            OwPhase::Search {
                ref mut index,
                ref mut stage,
            } if *stage == SearchStage::ReadDirection => {
                if bit != self.rom_bit(*index) {
                    phase = OwPhase::Dormant;
                } else {
                    *index += 1;
                    if *index == 64 {
                        phase = OwPhase::WaitReset;
                    } else {
                        *stage = SearchStage::SendBit;
                    }
                }
            }
            _ => {}
        }
        self.phase = phase;
    }

    fn on_fall(&mut self, now: u64) {
        // Falls caused by our own presence or transmit drive are not host
        // slot starts.
        if self.drives_low(now) {
            return;
        }
        self.fall_time = Some(now);
        let mut phase = self.phase;
        match phase {
            OwPhase::ReadCommand { .. } => {
                self.pending_sample = Some(now + OW_SAMPLE_OFFSET_NS);
            }
            OwPhase::Search {
                index,
                ref mut stage,
            } => match *stage {
                SearchStage::SendBit => {
                    if !self.rom_bit(index) {
                        self.drive_until = now + OW_TX_HOLD_NS;
                    }
                    *stage = SearchStage::SendComplement;
                }
                SearchStage::SendComplement => {
                    if self.rom_bit(index) {
                        self.drive_until = now + OW_TX_HOLD_NS;
                    }
                    *stage = SearchStage::ReadDirection;
                }
                SearchStage::ReadDirection => {
                    self.pending_sample = Some(now + OW_SAMPLE_OFFSET_NS);
                }
            },
            OwPhase::TransmitRom { ref mut bit } => {
                if !self.rom_bit(*bit) {
                    self.drive_until = now + OW_TX_HOLD_NS;
                }
                *bit += 1;
                if *bit == 64 {
                    phase = OwPhase::WaitReset;
                }
            }
            OwPhase::WaitReset | OwPhase::Dormant => {}
        }
        self.phase = phase;
    }

    fn on_rise(&mut self, now: u64) {
        if let Some(fall) = self.fall_time.take()
            && now - fall >= OW_RESET_MIN_NS
        {
            // Reset pulse: answer with presence and await a ROM command.
            self.presence = Some((now + OW_PRESENCE_START_NS, now + OW_PRESENCE_END_NS));
            self.phase = OwPhase::ReadCommand { count: 0, byte: 0 };
            self.pending_sample = None;
            self.drive_until = 0;
        }
    }
}

//==================================================================================================
// Pins
//==================================================================================================

/// Simulated buffered pins: host drives, optional jumper ties, attachable
/// device models, and an optional signal trace.
pub struct LoopbackPins {
    directions: [PinDirection; BIO_PIN_COUNT],
    driven: u8,
    now_ns: u64,
    last_levels: u8,
    tracing: bool,
    trace: heapless::Vec<TraceEvent, TRACE_CAPACITY>,
    ties: heapless::Vec<(u8, u8), 4>,
    i2c: Option<I2cResponder>,
    onewire: Option<OneWireSlave>,
}

impl LoopbackPins {
    pub fn new() -> Self {
        let mut pins = LoopbackPins {
            directions: [PinDirection::Input; BIO_PIN_COUNT],
            driven: 0,
            now_ns: 0,
            last_levels: 0,
            tracing: false,
            trace: heapless::Vec::new(),
            ties: heapless::Vec::new(),
            i2c: None,
            onewire: None,
        };
        pins.last_levels = pins.compute_levels();
        pins
    }

    /// Jumpers `from` (an output) onto `to` (an input), like a loopback
    /// cable between MOSI and MISO.
    pub fn tie(&mut self, from: u8, to: u8) {
        let _ = self.ties.push((from, to));
    }

    /// Attaches an I2C slave at a 7-bit address to pins 0 (SDA) / 1 (SCL).
    pub fn attach_i2c_device(&mut self, address: u8) {
        self.i2c = Some(I2cResponder::new(address));
    }

    /// Attaches a 1-Wire slave with the given ROM to pin 0.
    pub fn attach_onewire_device(&mut self, rom: [u8; 8]) {
        self.onewire = Some(OneWireSlave::new(rom));
    }

    pub fn start_trace(&mut self) {
        self.tracing = true;
        self.trace.clear();
        let now = self.now_ns;
        let levels = self.last_levels;
        let _ = self.trace.push(TraceEvent { t_ns: now, levels });
    }

    pub fn trace(&self) -> &[TraceEvent] {
        &self.trace
    }

    pub fn now_ns(&self) -> u64 {
        self.now_ns
    }

    fn compute_levels(&self) -> u8 {
        let mut levels = 0u8;
        for pin in 0..BIO_PIN_COUNT as u8 {
            let bit = if self.directions[pin as usize] == PinDirection::Output {
                self.driven & (1 << pin) != 0
            } else {
                // Idle bus level is high; jumpers and device pulls override.
                let mut level = true;
                for &(from, to) in &self.ties {
                    if to == pin && self.directions[from as usize] == PinDirection::Output {
                        level = self.driven & (1 << from) != 0;
                    }
                }
                if let Some(i2c) = &self.i2c
                    && pin == 0
                    && i2c.drive_sda_low
                {
                    level = false;
                }
                if let Some(onewire) = &self.onewire
                    && pin == 0
                    && onewire.drives_low(self.now_ns)
                {
                    level = false;
                }
                level
            };
            if bit {
                levels |= 1 << pin;
            }
        }
        levels
    }

    /// Settles the bus after any host action or time advance: due samples
    /// evaluate against the pre-change level, then devices see the edges.
    fn refresh(&mut self) {
        let now = self.now_ns;
        if let Some(onewire) = &mut self.onewire {
            let line_high = self.last_levels & 1 != 0;
            onewire.evaluate_pending(now, line_high);
        }

        // Device reactions can themselves change the line, so settle twice.
        for _ in 0..2 {
            let prev = self.last_levels;
            let new = self.compute_levels();
            if new == prev {
                break;
            }
            if let Some(i2c) = &mut self.i2c {
                i2c.on_edge(prev & 1 != 0, prev & 2 != 0, new & 1 != 0, new & 2 != 0);
            }
            if let Some(onewire) = &mut self.onewire {
                let owd_prev = prev & 1 != 0;
                let owd_new = new & 1 != 0;
                if owd_prev && !owd_new {
                    onewire.on_fall(now);
                } else if !owd_prev && owd_new {
                    onewire.on_rise(now);
                }
            }
            if self.tracing && self.trace.push(TraceEvent { t_ns: now, levels: new }).is_err() {
                self.tracing = false;
                log::warn!("loopback trace full, recording stopped");
            }
            self.last_levels = new;
        }
    }
}

impl Default for LoopbackPins {
    fn default() -> Self {
        Self::new()
    }
}

impl PinBackend for LoopbackPins {
    fn set_direction(&mut self, pin: u8, direction: PinDirection) {
        self.directions[pin as usize] = direction;
        self.refresh();
    }

    fn write(&mut self, pin: u8, state: PinState) {
        if state == PinState::High {
            self.driven |= 1 << pin;
        } else {
            self.driven &= !(1 << pin);
        }
        self.refresh();
    }

    fn read(&mut self, pin: u8) -> PinState {
        self.refresh();
        if self.last_levels & (1 << pin) != 0 {
            PinState::High
        } else {
            PinState::Low
        }
    }

    fn read_all(&mut self) -> u8 {
        self.refresh();
        self.last_levels
    }

    fn write_masked(&mut self, mask: u8, value: u8) {
        self.driven = (self.driven & !mask) | (value & mask);
        self.refresh();
    }

    fn delay_ns(&mut self, ns: u32) {
        self.now_ns += ns as u64;
        self.refresh();
    }
}

//==================================================================================================
// Serial, FIFO, store
//==================================================================================================

/// Serial port with TX wired back into RX, plus an injection queue for
/// scripted peers.
#[derive(Debug, Default)]
pub struct LoopbackSerial {
    rx: heapless::Deque<u8, 1024>,
    pub setup: Option<UartSetup>,
}

impl LoopbackSerial {
    /// Queues bytes as if a remote peer had sent them.
    pub fn inject_rx(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if self.rx.push_back(byte).is_err() {
                return;
            }
        }
    }
}

impl SerialPort for LoopbackSerial {
    fn configure(&mut self, setup: &UartSetup) {
        self.setup = Some(*setup);
    }

    fn write_byte(&mut self, byte: u8) {
        if self.rx.push_back(byte).is_err() {
            log::warn!("loopback serial overflow, byte dropped");
        }
    }

    fn read_byte(&mut self) -> nb::Result<u8, core::convert::Infallible> {
        self.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }

    fn tx_idle(&self) -> bool {
        true
    }
}

/// Intercore FIFO with the second core modeled as a verbatim echo.
/// [`Self::inject_reply`] plants a spurious word for desync testing.
#[derive(Debug, Default)]
pub struct EchoFifo {
    queue: heapless::Deque<u32, 8>,
}

impl EchoFifo {
    pub fn inject_reply(&mut self, word: u32) {
        self.queue
            .push_back(word)
            .expect("intercore fifo overflow");
    }
}

impl IntercoreFifo for EchoFifo {
    fn push_blocking(&mut self, word: u32) {
        self.queue
            .push_back(word)
            .expect("intercore fifo overflow");
    }

    fn pop_blocking(&mut self) -> u32 {
        self.queue
            .pop_front()
            .expect("intercore fifo empty: the second core never answered")
    }
}

/// In-memory named-file store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: heapless::Vec<(heapless::String<16>, heapless::Vec<u8, 256>), 8>,
}

impl ConfigStore for MemoryStore {
    fn save(&mut self, name: &str, contents: &[u8]) -> Result<(), StoreError> {
        let mut data = heapless::Vec::new();
        data.extend_from_slice(contents).map_err(|_| StoreError::Full)?;
        if let Some(slot) = self.files.iter_mut().find(|(n, _)| n.as_str() == name) {
            slot.1 = data;
            return Ok(());
        }
        let mut owned = heapless::String::new();
        owned.push_str(name).map_err(|_| StoreError::Full)?;
        self.files.push((owned, data)).map_err(|_| StoreError::Full)
    }

    fn load(&self, name: &str, out: &mut [u8]) -> Result<usize, StoreError> {
        let (_, data) = self
            .files
            .iter()
            .find(|(n, _)| n.as_str() == name)
            .ok_or(StoreError::NotFound)?;
        if data.len() > out.len() {
            return Err(StoreError::Io);
        }
        out[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }
}

/// The all-loopback [`crate::Platform`] used by the self-test and the host
/// test suite.
pub enum LoopbackPlatform {}

impl crate::Platform for LoopbackPlatform {
    type Pins = LoopbackPins;
    type Capture = crate::la::loopback::LoopbackEngine;
    type Serial = LoopbackSerial;
    type Fifo = EchoFifo;
    type Store = MemoryStore;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ties_mirror_outputs_onto_inputs() {
        let mut pins = LoopbackPins::new();
        pins.tie(1, 2);
        pins.set_direction(1, PinDirection::Output);
        pins.write(1, PinState::Low);
        assert_eq!(pins.read(2), PinState::Low);
        pins.write(1, PinState::High);
        assert_eq!(pins.read(2), PinState::High);
    }

    #[test]
    fn trace_records_level_changes_with_timestamps() {
        let mut pins = LoopbackPins::new();
        pins.set_direction(0, PinDirection::Output);
        pins.write(0, PinState::Low);
        pins.start_trace();
        pins.delay_ns(1_000);
        pins.write(0, PinState::High);
        pins.delay_ns(500);
        pins.write(0, PinState::Low);
        let trace = pins.trace();
        assert_eq!(trace.len(), 3);
        assert_eq!(trace[1].t_ns, 1_000);
        assert!(trace[1].levels & 1 != 0);
        assert_eq!(trace[2].t_ns, 1_500);
        assert!(trace[2].levels & 1 == 0);
    }
}
