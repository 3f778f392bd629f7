//! Look-behind logic analyzer.
//!
//! Eight pins are sampled into a 128 KiB ring carved out of the Big Buffer,
//! one byte per capture point. The ring is written by the capture engine
//! (PIO + chained DMA on silicon) and read backwards from the end pointer,
//! which is what makes "samples before the trigger" retrievable after the
//! fact.

use portable_atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use crate::intercore::{DesyncError, IcmMessage, IcmSender, IntercoreFifo};
use crate::mem::{BigBuffer, Owner, TempAllocation};
use crate::time::Hertz;

pub mod engine;
pub mod loopback;

use engine::{CaptureEngine, EngineError, ProgramConfig, TriggerProgram};

/// Capture ring size. The DMA ring-wrap addressing and the read cursor mask
/// both assume exactly this value.
pub const LA_BUFFER_SIZE: usize = crate::mem::TEMPORARY_BUFFER_SIZE;
const PTR_MASK: u32 = (LA_BUFFER_SIZE - 1) as u32;

static_assertions::const_assert!(LA_BUFFER_SIZE.is_power_of_two());

cfg_if::cfg_if! {
    if #[cfg(feature = "rev10")] {
        /// First pin of the dedicated look-behind tap block in front of the
        /// IO buffers.
        pub const LA_BASE_PIN: u8 = 8;
    } else {
        /// No analog tap on this revision: the capture sees the MCU-side
        /// pin block instead.
        pub const LA_BASE_PIN: u8 = 0;
    }
}

/// Capture progression. `ArmedInit` establishes the reference DMA tail,
/// `Armed` waits for it to move, `Capture` waits for the done signal.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Status {
    Idle = 0,
    ArmedInit = 1,
    Armed = 2,
    Capture = 3,
}

impl Status {
    fn from_raw(raw: u8) -> Status {
        match raw {
            1 => Status::ArmedInit,
            2 => Status::Armed,
            3 => Status::Capture,
            _ => Status::Idle,
        }
    }
}

/// Fields written from the completion interrupt and read by the polling
/// foreground. Everything here is atomic; the foreground never touches the
/// ring while a capture is in flight.
#[derive(Debug, Default)]
struct SharedState {
    status: AtomicU8,
    sm_done: AtomicBool,
    end_pointer: AtomicU32,
    samples_from_zero: AtomicU32,
}

/// One capture request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CaptureConfig {
    pub frequency: Hertz,
    pub samples: u32,
    /// Pins allowed to trigger, one bit each. Zero disables triggering.
    pub trigger_mask: u8,
    /// Trigger polarity per pin; a set bit selects the high-trigger program.
    pub trigger_direction: u8,
    pub edge: bool,
    pub interrupt_enabled: bool,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SetupError {
    #[error("capture ring allocation failed")]
    OutOfMemory,
    #[error("capture engine: {0}")]
    Engine(#[from] EngineError),
}

/// Computes the sampling divider and the frequency actually achieved:
/// `div = clk / (2 * desired)` floored and clamped to at least 1, two
/// program cycles per sample.
pub fn compute_actual_frequency(clk_sys: Hertz, desired: Hertz) -> (u32, Hertz) {
    let div = (clk_sys.raw() / (2 * desired.raw().max(1))).max(1);
    (div, Hertz::from_raw(clk_sys.raw() / (2 * div)))
}

/// The analyzer core: owns the engine, the ring and the capture state.
pub struct LogicAnalyzer<E: CaptureEngine> {
    engine: E,
    ring: TempAllocation,
    shared: SharedState,
    read_ptr: u32,
    base_pin: u8,
    /// Reference tail captured on the first poll after arming.
    armed_tail: u32,
    status_leds_enabled: bool,
}

impl<E: CaptureEngine> LogicAnalyzer<E> {
    /// Allocates the capture ring and claims the capture hardware.
    ///
    /// Ring allocation failure is an ordinary error the caller surfaces;
    /// a missing DMA channel pair is a configuration bug and comes back as
    /// [`EngineError::DmaUnavailable`].
    pub fn setup(buffer: &mut BigBuffer, mut engine: E) -> Result<Self, (SetupError, E)> {
        let Some(ring) = buffer.alloc_temporary(LA_BUFFER_SIZE, 1, Owner::La) else {
            return Err((SetupError::OutOfMemory, engine));
        };
        if let Err(error) = engine.setup() {
            buffer.free_temporary(ring, Owner::La);
            return Err((SetupError::Engine(error), engine));
        }
        Ok(LogicAnalyzer {
            engine,
            ring,
            shared: SharedState::default(),
            read_ptr: 0,
            base_pin: LA_BASE_PIN,
            armed_tail: 0,
            status_leds_enabled: false,
        })
    }

    /// Tears down the engine, frees the ring and releases the RGB LEDs back
    /// to the second core.
    pub fn cleanup<F: IntercoreFifo>(
        self,
        buffer: &mut BigBuffer,
        icm: &mut IcmSender<F>,
    ) -> Result<E, DesyncError> {
        let LogicAnalyzer {
            mut engine, ring, ..
        } = self;
        engine.teardown();
        buffer.free_temporary(ring, Owner::La);
        icm.send(IcmMessage::DisableRgbUpdates)?;
        Ok(engine)
    }

    pub fn set_base_pin(&mut self, base_pin: u8) {
        self.base_pin = base_pin;
    }

    /// Loads the trigger program selected by the capture config, rearms the
    /// DMA chain and returns the actual sampling frequency.
    pub fn configure(&mut self, config: &CaptureConfig) -> Result<Hertz, EngineError> {
        self.shared.sm_done.store(false, Ordering::Release);
        self.shared.status.store(Status::Idle as u8, Ordering::Release);

        // First set bit of the mask picks the trigger pin.
        let trigger_pin = (0..8u8).find(|pin| config.trigger_mask & (1 << pin) != 0);
        let program = match trigger_pin {
            Some(pin) if config.trigger_direction & (1 << pin) != 0 => TriggerProgram::HighTrigger,
            Some(_) => TriggerProgram::LowTrigger,
            None => TriggerProgram::NoTrigger,
        };

        let (divider, actual) =
            compute_actual_frequency(self.engine.system_clock(), config.frequency);
        let program_config = ProgramConfig {
            program,
            base_pin: self.base_pin,
            trigger_pin,
            edge: config.edge,
            divider,
            samples: config.samples,
            interrupt_enabled: config.interrupt_enabled,
        };
        log::debug!(
            "la: {program:?} trigger {trigger_pin:?} divider {divider} actual {actual}",
        );
        self.engine
            .configure(&program_config, self.ring.as_mut_slice())?;
        Ok(actual)
    }

    /// Arms the capture. With LED indication enabled, RGB control is first
    /// requested synchronously from the second core so LED traffic cannot
    /// disturb the sampling window.
    pub fn arm<F: IntercoreFifo>(
        &mut self,
        led_indication: bool,
        icm: &mut IcmSender<F>,
    ) -> Result<(), DesyncError> {
        self.status_leds_enabled = led_indication;
        if led_indication {
            icm.send(IcmMessage::EnableRgbUpdates)?;
        }
        self.shared
            .status
            .store(Status::ArmedInit as u8, Ordering::Release);
        self.engine.start();
        Ok(())
    }

    /// Completion path, shared by the done interrupt and the explicit stop:
    /// snapshots the final write position as the end pointer and read
    /// cursor.
    fn finish(&mut self, remaining: u32) {
        let tail = LA_BUFFER_SIZE as i64 - remaining as i64 - 1;
        let (samples, end) = if tail < 0 {
            // The counter sat at its reload value: the ring wrapped exactly
            // (or nothing arrived, indistinguishable at this level).
            (LA_BUFFER_SIZE as u32, PTR_MASK)
        } else {
            (tail as u32 + 1, tail as u32)
        };
        self.shared.samples_from_zero.store(samples, Ordering::Release);
        self.shared.end_pointer.store(end, Ordering::Release);
        self.read_ptr = end;
        self.shared.sm_done.store(true, Ordering::Release);
        if self.status_leds_enabled {
            // Dump indication; the second core renders it once RGB control
            // returns.
            log::trace!("la: capture complete, {samples} samples");
        }
    }

    /// Drives the state machine forward; true exactly when the capture has
    /// returned to idle.
    pub fn is_done(&mut self) -> bool {
        let status = self.engine.step(self.ring.as_mut_slice());

        match Status::from_raw(self.shared.status.load(Ordering::Acquire)) {
            Status::ArmedInit => {
                self.armed_tail = status.remaining;
                self.shared.status.store(Status::Armed as u8, Ordering::Release);
            }
            Status::Armed if status.remaining != self.armed_tail => {
                self.shared
                    .status
                    .store(Status::Capture as u8, Ordering::Release);
                log::trace!("la: first sample crossed, capturing");
            }
            _ => {}
        }
        if status.done && !self.shared.sm_done.load(Ordering::Acquire) {
            self.finish(status.remaining);
        }
        if self.shared.sm_done.load(Ordering::Acquire) {
            self.shared.status.store(Status::Idle as u8, Ordering::Release);
        }
        Status::from_raw(self.shared.status.load(Ordering::Acquire)) == Status::Idle
    }

    /// Force-stops the capture and snapshots the pointers. The data stays
    /// available for dumping.
    pub fn stop(&mut self) {
        let remaining = self.engine.halt(self.ring.as_mut_slice());
        self.finish(remaining);
        self.shared.status.store(Status::Idle as u8, Ordering::Release);
    }

    pub fn status(&self) -> Status {
        Status::from_raw(self.shared.status.load(Ordering::Acquire))
    }

    /// Usable sample count, counted from sample zero. Saturates at the ring
    /// size once the capture has wrapped.
    pub fn samples_from_zero(&self) -> u32 {
        self.shared.samples_from_zero.load(Ordering::Acquire)
    }

    /// Ring offset of the most recent sample.
    pub fn end_ptr(&self) -> u32 {
        self.shared.end_pointer.load(Ordering::Acquire)
    }

    /// Ring offset of the oldest sample of a `count`-sample window.
    pub fn start_ptr(&self, count: u32) -> u32 {
        (self.end_ptr().wrapping_add(1).wrapping_sub(count)) & PTR_MASK
    }

    pub fn current_ptr(&self) -> u32 {
        self.read_ptr
    }

    /// Rewinds the read cursor to the end pointer (most recent sample).
    pub fn reset_ptr(&mut self) {
        self.read_ptr = self.end_ptr();
    }

    /// Reads one sample at the cursor and steps the cursor backwards.
    /// Starting from the end pointer this walks the capture newest-first.
    pub fn dump(&mut self) -> u8 {
        let value = self.ring.as_slice()[self.read_ptr as usize];
        self.read_ptr = self.read_ptr.wrapping_sub(1) & PTR_MASK;
        value
    }

    /// Raw ring access for display paths that keep their own cursor.
    pub fn read_ptr_at(&self, offset: u32) -> u8 {
        self.ring.as_slice()[(offset & PTR_MASK) as usize]
    }
}

/// Validated interactive capture settings (the `logic` command surface).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CaptureSettings {
    pub frequency: Hertz,
    pub samples: u32,
    pub trigger_pin: Option<u8>,
    pub trigger_high: bool,
    pub edge: bool,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SettingsError {
    #[error("sample count {0} exceeds the capture ring")]
    TooManySamples(u32),
    #[error("trigger pin {0} out of range")]
    TriggerPinOutOfRange(u8),
    #[error("sample frequency may not be zero")]
    ZeroFrequency,
}

impl CaptureSettings {
    /// Checks the settings against the hardware limits and lowers them into
    /// a capture config.
    pub fn to_config(&self) -> Result<CaptureConfig, SettingsError> {
        if self.frequency.raw() == 0 {
            return Err(SettingsError::ZeroFrequency);
        }
        if self.samples as usize > LA_BUFFER_SIZE {
            return Err(SettingsError::TooManySamples(self.samples));
        }
        if let Some(pin) = self.trigger_pin
            && pin >= 8
        {
            return Err(SettingsError::TriggerPinOutOfRange(pin));
        }
        let mask = self.trigger_pin.map_or(0, |pin| 1 << pin);
        Ok(CaptureConfig {
            frequency: self.frequency,
            samples: self.samples,
            trigger_mask: mask,
            trigger_direction: if self.trigger_high { mask } else { 0 },
            edge: self.edge,
            interrupt_enabled: true,
        })
    }
}
