//! Intercore messaging between the two CPU cores.
//!
//! Core 1 owns the RGB LED refresh and the LCD; core 0 requests state
//! changes over the hardware mailbox FIFO and blocks until core 1 echoes
//! the request word verbatim. A message counter is packed into every word
//! so a lost or duplicated reply is detected instead of silently skewing
//! the two cores, and the magic byte keeps the word inside an unmapped
//! address range so an accidental pointer dereference faults immediately.

use embedded_hal::delay::DelayNs;

/// Requests core 0 may send. The discriminants are the wire values.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum IcmMessage {
    /// Synchronizes core 0 and core 1 initialization.
    InitCore1 = 0xA5,
    DisableLcdUpdates = 0xF0,
    EnableLcdUpdates = 0xF1,
    /// Enable LCD updates and force an immediate redraw.
    ForceLcdUpdate = 0xF2,
    DisableRgbUpdates = 0xF3,
    EnableRgbUpdates = 0xF4,
}

impl IcmMessage {
    pub fn from_raw(raw: u8) -> Option<IcmMessage> {
        Some(match raw {
            0xA5 => IcmMessage::InitCore1,
            0xF0 => IcmMessage::DisableLcdUpdates,
            0xF1 => IcmMessage::EnableLcdUpdates,
            0xF2 => IcmMessage::ForceLcdUpdate,
            0xF3 => IcmMessage::DisableRgbUpdates,
            0xF4 => IcmMessage::EnableRgbUpdates,
            _ => return None,
        })
    }
}

/// Constant low byte of every raw word. Lands the value in the unmapped
/// range of the memory map.
pub const ICM_MAGIC: u8 = 0x80;

/// Raw 32-bit mailbox word: `{magic, counter, reserved, message}` from the
/// lowest byte up.
#[bitbybit::bitfield(u32, default = 0x0)]
#[derive(Debug)]
pub struct RawIcmWord {
    #[bits(0..=7, rw)]
    magic: u8,
    #[bits(8..=15, rw)]
    counter: u8,
    #[bits(16..=23, rw)]
    reserved: u8,
    #[bits(24..=31, rw)]
    message: u8,
}

/// The hardware mailbox between the cores. Both directions block; the FIFO
/// depth on real silicon is eight words and this protocol keeps at most one
/// request outstanding.
pub trait IntercoreFifo {
    fn push_blocking(&mut self, word: u32);
    fn pop_blocking(&mut self) -> u32;
}

/// Reply did not echo the request word. This means the cores disagree about
/// the protocol state, which no retry can repair.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[error("intercore desynchronization: sent {sent:#010x}, received {received:#010x}")]
pub struct DesyncError {
    pub sent: u32,
    pub received: u32,
}

/// Core 0 side of the channel.
pub struct IcmSender<F: IntercoreFifo> {
    fifo: F,
    counter: u8,
}

impl<F: IntercoreFifo> IcmSender<F> {
    pub fn new(fifo: F) -> Self {
        IcmSender { fifo, counter: 0 }
    }

    /// Sends a request and blocks for the echo. Every call bumps the
    /// message counter, so stale replies cannot match.
    pub fn send(&mut self, message: IcmMessage) -> Result<(), DesyncError> {
        self.counter = self.counter.wrapping_add(1);
        let word = RawIcmWord::new_with_raw_value(0)
            .with_magic(ICM_MAGIC)
            .with_counter(self.counter)
            .with_reserved(0)
            .with_message(message as u8);
        self.fifo.push_blocking(word.raw_value());
        let response = self.fifo.pop_blocking();
        if response != word.raw_value() {
            return Err(DesyncError {
                sent: word.raw_value(),
                received: response,
            });
        }
        Ok(())
    }

    pub fn last_counter(&self) -> u8 {
        self.counter
    }

    pub fn fifo_mut(&mut self) -> &mut F {
        &mut self.fifo
    }
}

/// Core 1 side: pop a raw word, act on it, echo it back verbatim. The echo
/// must happen even for unknown messages so core 0 never hangs.
pub fn core1_service<F: IntercoreFifo>(
    fifo: &mut F,
    mut act: impl FnMut(Option<IcmMessage>),
) -> u32 {
    let raw = fifo.pop_blocking();
    let word = RawIcmWord::new_with_raw_value(raw);
    act(IcmMessage::from_raw(word.message()));
    fifo.push_blocking(raw);
    raw
}

/// Terminal failure path for a desynchronized channel: print state every
/// five seconds, forever, so an external debugger can attach and inspect
/// both cores. Deliberately never returns.
pub fn desync_fatal_loop(error: &DesyncError, delay: &mut impl DelayNs) -> ! {
    loop {
        log::error!("{error}; halted for debugger attach");
        delay.delay_ms(5_000);
    }
}
