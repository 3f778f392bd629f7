//! Binary follow-along streamer on the secondary CDC interface.
//!
//! After every capture a `$FALADATA` preamble tells the host what was
//! sampled; the host answers `?` to re-request the preamble or `+` to pull
//! the raw sample bytes, oldest first.

use core::fmt::Write as _;

use embedded_io::{Read, Write};

use crate::intercore::{DesyncError, IcmSender, IntercoreFifo};
use crate::la::LA_BUFFER_SIZE;
use crate::la::engine::CaptureEngine;
use crate::mem::BigBuffer;

use super::{FalaBus, FalaError, FalaHook};

/// Transfer burst size towards the host.
const BURST: usize = 64;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Idle,
    Dump,
}

/// Host-facing state of the follow-along channel.
pub struct FalaStream {
    state: State,
    dump_cursor: u32,
    dump_remaining: u32,
}

impl FalaStream {
    pub const fn new() -> Self {
        FalaStream {
            state: State::Idle,
            dump_cursor: 0,
            dump_remaining: 0,
        }
    }

    /// Subscribes the streamer to capture notifications.
    pub fn setup<E: CaptureEngine>(
        &mut self,
        fala: &mut FalaBus<E>,
        buffer: &mut BigBuffer,
    ) -> Result<(), FalaError> {
        fala.register(FalaHook::BinaryStream, buffer)
    }

    pub fn cleanup<E: CaptureEngine, F: IntercoreFifo>(
        &mut self,
        fala: &mut FalaBus<E>,
        buffer: &mut BigBuffer,
        icm: &mut IcmSender<F>,
    ) -> Result<(), DesyncError> {
        self.state = State::Idle;
        self.dump_remaining = 0;
        fala.unregister(FalaHook::BinaryStream, buffer, icm)
    }

    /// Emits the capture preamble:
    /// `$FALADATA;{pins};{trigger_pins};{trigger_mask};{edge};{hz};{samples};{presamples};`
    pub fn notify<E: CaptureEngine, W: Write>(&self, fala: &mut FalaBus<E>, writer: &mut W) {
        let mut samples = fala
            .la_mut()
            .map_or(0, |la| la.samples_from_zero());
        if samples > LA_BUFFER_SIZE as u32 {
            // Invalid count; report an empty capture rather than garbage.
            samples = 0;
        }
        let actual = fala.config.actual_sample_frequency.raw();
        let mut preamble: heapless::String<96> = heapless::String::new();
        if write!(
            preamble,
            "$FALADATA;8;0;0;N;{actual};{samples};0;\n"
        )
        .is_err()
        {
            return;
        }
        if let Err(_error) = writer.write_all(preamble.as_bytes()) {
            log::warn!("follow-along notify dropped: host channel unavailable");
        }
    }

    /// Polls the host channel. `?` re-emits the preamble, `+` starts a raw
    /// dump of the last capture.
    pub fn service<E: CaptureEngine, R: Read, W: Write>(
        &mut self,
        fala: &mut FalaBus<E>,
        reader: &mut R,
        writer: &mut W,
    ) {
        match self.state {
            State::Idle => {
                let mut buf = [0u8; 64];
                let Ok(len) = reader.read(&mut buf) else {
                    return;
                };
                for &byte in &buf[..len] {
                    match byte {
                        b'?' => self.notify(fala, writer),
                        b'+' => {
                            if let Some(la) = fala.la_mut() {
                                // The ring holds the newest sample at the end
                                // pointer; walk forward from the oldest one.
                                let samples = la.samples_from_zero();
                                self.dump_cursor = la.start_ptr(samples);
                                self.dump_remaining = samples;
                                self.state = State::Dump;
                            }
                        }
                        _ => {}
                    }
                }
            }
            State::Dump => {
                let Some(la) = fala.la_mut() else {
                    self.state = State::Idle;
                    return;
                };
                let mut chunk = [0u8; BURST];
                let len = (self.dump_remaining as usize).min(BURST);
                for slot in &mut chunk[..len] {
                    *slot = la.read_ptr_at(self.dump_cursor);
                    self.dump_cursor = self.dump_cursor.wrapping_add(1);
                }
                self.dump_remaining -= len as u32;
                if writer.write_all(&chunk[..len]).is_err() {
                    log::warn!("follow-along dump aborted: host channel unavailable");
                    self.dump_remaining = 0;
                }
                if self.dump_remaining == 0 {
                    self.state = State::Idle;
                }
            }
        }
    }

    pub fn dump_in_progress(&self) -> bool {
        self.state == State::Dump
    }
}

impl Default for FalaStream {
    fn default() -> Self {
        Self::new()
    }
}
