//! Follow-along logic analyzer hook bus.
//!
//! Protocol modes never talk to the analyzer directly. Subscribers (the
//! terminal summary, the binary follow-along streamer) register here; while
//! at least one is registered, the dispatcher brackets every syntax run
//! with an arm/stop pair and broadcasts completion. The analyzer exists
//! exactly as long as the subscriber list is non-empty, which is what keeps
//! the 128 KiB capture ring from leaking across mode changes.

use crate::intercore::{DesyncError, IcmSender, IntercoreFifo};
use crate::la::engine::CaptureEngine;
use crate::la::{CaptureConfig, LA_BUFFER_SIZE, LogicAnalyzer, SetupError};
use crate::mem::BigBuffer;
use crate::time::Hertz;

pub mod stream;

/// Maximum number of subscribers. Bounding this at two keeps "analyzer
/// lifetime equals subscriber count" trivially auditable.
pub const MAX_HOOKS: usize = 2;

/// Identity of a follow-along subscriber.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FalaHook {
    /// Textual capture summary on the interactive terminal.
    TerminalSummary,
    /// Binary notification frames on the secondary CDC interface.
    BinaryStream,
}

/// Capture rate configuration. The effective sample rate is
/// `base_frequency * oversample`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FalaConfig {
    pub base_frequency: Hertz,
    pub oversample: u32,
    pub debug_level: u8,
    /// Rate actually achieved by the divider, updated on every arm.
    pub actual_sample_frequency: Hertz,
}

impl Default for FalaConfig {
    fn default() -> Self {
        FalaConfig {
            base_frequency: Hertz::from_raw(1_000_000),
            oversample: 8,
            debug_level: 0,
            actual_sample_frequency: Hertz::from_raw(0),
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FalaError {
    #[error("all follow-along hook slots are taken")]
    Full,
    #[error("logic analyzer setup failed: {0}")]
    Setup(#[from] SetupError),
}

/// The hook table plus the analyzer it keeps alive.
pub struct FalaBus<E: CaptureEngine> {
    hooks: [Option<FalaHook>; MAX_HOOKS],
    pub config: FalaConfig,
    la: Option<LogicAnalyzer<E>>,
    /// Engine parked here while no subscriber needs the analyzer.
    parked_engine: Option<E>,
}

impl<E: CaptureEngine> FalaBus<E> {
    pub fn new(engine: E) -> Self {
        FalaBus {
            hooks: [None; MAX_HOOKS],
            config: FalaConfig::default(),
            la: None,
            parked_engine: Some(engine),
        }
    }

    pub fn has_hook(&self) -> bool {
        self.hooks.iter().any(Option::is_some)
    }

    pub fn registered(&self) -> heapless::Vec<FalaHook, MAX_HOOKS> {
        self.hooks.iter().flatten().copied().collect()
    }

    pub fn la_mut(&mut self) -> Option<&mut LogicAnalyzer<E>> {
        self.la.as_mut()
    }

    /// Adds a subscriber. The first registration sets up the analyzer;
    /// registering an already-registered hook is a no-op.
    pub fn register(&mut self, hook: FalaHook, buffer: &mut BigBuffer) -> Result<(), FalaError> {
        if self.hooks.contains(&Some(hook)) {
            return Ok(());
        }
        if !self.has_hook() {
            #[cfg(not(feature = "rev10"))]
            log::warn!(
                "capture taps the MCU-side pin state behind the IO buffers; \
                 samples may not match the buffer outputs while they drive"
            );
            let engine = self
                .parked_engine
                .take()
                .expect("capture engine neither parked nor in use");
            match LogicAnalyzer::setup(buffer, engine) {
                Ok(la) => self.la = Some(la),
                Err((error, engine)) => {
                    self.parked_engine = Some(engine);
                    return Err(error.into());
                }
            }
        }
        let Some(slot) = self.hooks.iter_mut().find(|slot| slot.is_none()) else {
            return Err(FalaError::Full);
        };
        *slot = Some(hook);
        Ok(())
    }

    /// Removes a subscriber; tears the analyzer down when the last one
    /// leaves.
    pub fn unregister<F: IntercoreFifo>(
        &mut self,
        hook: FalaHook,
        buffer: &mut BigBuffer,
        icm: &mut IcmSender<F>,
    ) -> Result<(), DesyncError> {
        for slot in &mut self.hooks {
            if *slot == Some(hook) {
                *slot = None;
            }
        }
        if !self.has_hook()
            && let Some(la) = self.la.take()
        {
            self.parked_engine = Some(la.cleanup(buffer, icm)?);
        }
        Ok(())
    }

    /// Arms a follow-along capture: full ring, no trigger, no completion
    /// interrupt (the stop hook ends the capture explicitly).
    pub fn start_hook<F: IntercoreFifo>(&mut self, icm: &mut IcmSender<F>) {
        if !self.has_hook() {
            return;
        }
        let Some(la) = self.la.as_mut() else { return };
        let capture = CaptureConfig {
            frequency: Hertz::from_raw(
                self.config
                    .base_frequency
                    .raw()
                    .saturating_mul(self.config.oversample),
            ),
            samples: LA_BUFFER_SIZE as u32,
            trigger_mask: 0,
            trigger_direction: 0,
            edge: false,
            interrupt_enabled: false,
        };
        match la.configure(&capture) {
            Ok(actual) => self.config.actual_sample_frequency = actual,
            Err(error) => {
                log::error!("follow-along capture configure failed: {error}");
                return;
            }
        }
        if let Err(error) = la.arm(false, icm) {
            log::error!("follow-along capture arm failed: {error}");
        }
    }

    /// Ends the capture but keeps the data available for dumping.
    pub fn stop_hook(&mut self) {
        if !self.has_hook() {
            return;
        }
        if let Some(la) = self.la.as_mut() {
            la.stop();
        }
    }

    /// Broadcast point after a capture completes: logs the summary and
    /// hands the subscriber list back so the caller can service the sinks
    /// that need IO.
    pub fn notify_hook(&mut self) -> heapless::Vec<FalaHook, MAX_HOOKS> {
        if self.has_hook()
            && let Some(la) = self.la.as_mut()
        {
            log::info!("logic analyzer: {} samples captured", la.samples_from_zero());
        }
        self.registered()
    }

    /// Called after every mode change: follow the new mode's clock with 8x
    /// oversampling.
    pub fn mode_change_hook(&mut self, mode_speed: Hertz) {
        self.config.base_frequency = mode_speed;
        self.config.oversample = 8;
        if self.has_hook() {
            log::info!(
                "logic analyzer speed: {}Hz ({}x oversampling)",
                self.config.base_frequency.raw() * self.config.oversample,
                self.config.oversample
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::la::loopback::{LoopbackEngine, Pattern};
    use crate::loopback::EchoFifo;
    use crate::mem::{BIG_BUFFER_SIZE, BigBuffer, BigBufferRegion};
    use crate::time::RateExtU32;

    fn fresh_buffer() -> BigBuffer {
        BigBuffer::new(Box::leak(Box::new(BigBufferRegion::new())))
    }

    fn bus() -> FalaBus<LoopbackEngine> {
        FalaBus::new(LoopbackEngine::new(Pattern::Counter, 4096))
    }

    #[test]
    fn double_registration_keeps_one_subscription() {
        let mut buffer = fresh_buffer();
        let mut fala = bus();
        fala.register(FalaHook::TerminalSummary, &mut buffer).unwrap();
        fala.register(FalaHook::TerminalSummary, &mut buffer).unwrap();
        assert_eq!(fala.registered().len(), 1);
    }

    #[test]
    fn last_unregister_releases_the_capture_ring() {
        let mut buffer = fresh_buffer();
        let mut icm = IcmSender::new(EchoFifo::default());
        let mut fala = bus();

        fala.register(FalaHook::TerminalSummary, &mut buffer).unwrap();
        fala.register(FalaHook::BinaryStream, &mut buffer).unwrap();
        assert_eq!(
            buffer.available_temporary(1),
            BIG_BUFFER_SIZE - LA_BUFFER_SIZE
        );

        fala.unregister(FalaHook::TerminalSummary, &mut buffer, &mut icm)
            .unwrap();
        assert!(fala.has_hook());
        fala.unregister(FalaHook::BinaryStream, &mut buffer, &mut icm)
            .unwrap();
        assert!(!fala.has_hook());
        assert_eq!(buffer.available_temporary(1), BIG_BUFFER_SIZE);
        buffer.verify_no_temporary_allocations();
    }

    #[test]
    fn hooks_bracket_a_capture() {
        let mut buffer = fresh_buffer();
        let mut icm = IcmSender::new(EchoFifo::default());
        let mut fala = bus();
        fala.register(FalaHook::TerminalSummary, &mut buffer).unwrap();
        fala.mode_change_hook(100u32.kHz());
        assert_eq!(fala.config.base_frequency, 100u32.kHz::<1, 1>());
        assert_eq!(fala.config.oversample, 8);

        fala.start_hook(&mut icm);
        assert!(fala.config.actual_sample_frequency.raw() > 0);
        fala.stop_hook();
        let notified = fala.notify_hook();
        assert_eq!(notified.as_slice(), &[FalaHook::TerminalSummary]);
        let la = fala.la_mut().unwrap();
        assert_eq!(la.samples_from_zero(), 4096);
        fala.unregister(FalaHook::TerminalSummary, &mut buffer, &mut icm)
            .unwrap();
    }

    #[test]
    fn start_without_subscribers_is_a_no_op() {
        let mut icm = IcmSender::new(EchoFifo::default());
        let mut fala = bus();
        fala.start_hook(&mut icm);
        fala.stop_hook();
        assert!(fala.notify_hook().is_empty());
    }
}
