//! Capture engine seam.
//!
//! The logic analyzer core drives the sampling hardware through
//! [`CaptureEngine`]: on silicon that is a PIO state machine feeding two
//! chained DMA channels (data channel paced by the PIO RX DREQ writing the
//! ring, control channel reloading the data channel's transfer count for
//! indefinite circular capture). [`super::loopback::LoopbackEngine`]
//! implements the same contract with a deterministic pattern generator.

use crate::time::Hertz;

/// The three sampling programs. Exactly one is loaded per arming.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TriggerProgram {
    /// Capture immediately.
    NoTrigger,
    /// Wait for the masked pin to be high; edge mode waits for a rising edge.
    HighTrigger,
    /// Wait for the masked pin to be low; edge mode waits for a falling edge.
    LowTrigger,
}

/// Everything the engine needs to load and arm one capture.
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ProgramConfig {
    pub program: TriggerProgram,
    /// Lowest sampled pin; eight consecutive pins are captured.
    pub base_pin: u8,
    /// Offset of the trigger pin relative to `base_pin`.
    pub trigger_pin: Option<u8>,
    pub edge: bool,
    /// Sampling clock divider against the system clock. The program takes
    /// two cycles per sample, so the effective rate is `clk / (2 * divider)`.
    pub divider: u32,
    /// Number of samples to capture before raising the done interrupt.
    pub samples: u32,
    /// Install the completion interrupt handler. Follow-along captures are
    /// stopped explicitly instead.
    pub interrupt_enabled: bool,
}

/// Result of one engine poll.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EngineStatus {
    /// Remaining transfer count of the data DMA channel.
    pub remaining: u32,
    /// The sampling program signalled completion.
    pub done: bool,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EngineError {
    /// No free DMA channel pair. A configuration bug, not a runtime
    /// condition; callers treat this as fatal.
    #[error("no free DMA channel pair")]
    DmaUnavailable,
    #[error("sampling program did not fit in instruction memory")]
    ProgramLoad,
}

/// The PIO + chained-DMA sampling pair.
pub trait CaptureEngine {
    /// System clock the divider is computed against.
    fn system_clock(&self) -> Hertz;

    /// Claims the DMA channel pair and raises its bus priority.
    fn setup(&mut self) -> Result<(), EngineError>;

    /// Releases the DMA channels and removes any loaded program. Unknown
    /// hardware state at this point is tolerated silently.
    fn teardown(&mut self);

    /// Aborts any in-flight capture, swaps in the requested program, rearms
    /// the DMA chain over `ring` and queues the sample count. Returns with
    /// the state machine still disabled.
    fn configure(&mut self, config: &ProgramConfig, ring: &mut [u8]) -> Result<(), EngineError>;

    /// Enables the sampling state machine.
    fn start(&mut self);

    /// Polls the capture. Hardware implementations read the DMA registers;
    /// simulated implementations advance the capture here.
    fn step(&mut self, ring: &mut [u8]) -> EngineStatus;

    /// Force-stops the state machine and returns the final remaining
    /// transfer count. Used by follow-along captures, which have no
    /// natural end.
    fn halt(&mut self, ring: &mut [u8]) -> u32;
}
