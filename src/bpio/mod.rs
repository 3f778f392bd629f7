//! Binary protocol IO.
//!
//! A host program drives the instrument over a second CDC interface with
//! framed request/response messages instead of the interactive syntax. A
//! request either reconfigures the active mode or runs one mode-agnostic
//! transaction against it; responses carry a status code and any bytes read
//! off the bus.

use serde::{Deserialize, Serialize};

use crate::Platform;
use crate::bio::PinBackend;
use crate::dispatcher::Dispatcher;
use crate::modes::{ActiveMode, ModeConfig, ModeContext, ModeId, ReadBuffer};

pub mod frame;

use frame::{FrameAccumulator, FrameError, MAX_ENCODED, MAX_PAYLOAD, MAX_RAW};

/// One mode-agnostic bus transaction.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DataRequest<'a> {
    pub debug: bool,
    /// Assert the mode's start condition (CS select, I2C START, bus reset).
    pub start_main: bool,
    /// Start with read-during-write: replies are captured while writing.
    pub start_alt: bool,
    #[serde(borrow)]
    pub data_write: &'a [u8],
    pub bytes_read: u16,
    pub stop_main: bool,
    pub stop_alt: bool,
    /// Lazy per-bit actions, one [`BitwiseOp`] byte each.
    #[serde(borrow)]
    pub bitwise_ops: &'a [u8],
}

/// Action encoded in a two-bit pin field.
#[derive(Debug, Eq, PartialEq)]
#[bitbybit::bitenum(u2, exhaustive = true)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinAction {
    None = 0b00,
    Low = 0b01,
    High = 0b10,
    /// Both bits set; a full pulse on the clock field, high elsewhere.
    Pulse = 0b11,
}

/// Per-bit action byte: a [`PinAction`] each for the data line and the
/// clock, plus a sample flag that captures the read pin into the reply
/// buffer.
#[bitbybit::bitfield(u8, default = 0x0)]
#[derive(Debug)]
pub struct BitwiseOp {
    #[bits(0..=1, rw)]
    data: PinAction,
    #[bits(2..=3, rw)]
    clock: PinAction,
    #[bit(4, rw)]
    read_sample: bool,
}

/// Errors a per-mode transaction handler reports.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BpioError {
    #[error("active mode has no binary handler")]
    Unsupported,
    #[error("bus timeout")]
    Timeout,
    #[error("bus error")]
    BusError,
    #[error("reply does not fit the read buffer")]
    TooLarge,
}

/// Wire status codes. Stable values; extensions append.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StatusCode {
    Ok,
    UnknownMode,
    ModeChangeFailed,
    DecodeError,
    Timeout,
    BusError,
    TooLarge,
    Unsupported,
}

impl From<BpioError> for StatusCode {
    fn from(error: BpioError) -> StatusCode {
        match error {
            BpioError::Unsupported => StatusCode::Unsupported,
            BpioError::Timeout => StatusCode::Timeout,
            BpioError::BusError => StatusCode::BusError,
            BpioError::TooLarge => StatusCode::TooLarge,
        }
    }
}

/// Host request.
#[derive(Debug, Serialize, Deserialize)]
pub enum Request<'a> {
    /// Switch to (and configure) a mode.
    ModeChange(ModeConfig),
    /// Run one transaction against the active mode.
    Transaction(#[serde(borrow)] DataRequest<'a>),
    /// Report the active mode.
    Status,
}

/// Instrument response.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response<'a> {
    pub status: StatusCode,
    pub mode: ModeId,
    pub data: &'a [u8],
}

/// Applies a bitwise-op sequence to a mode's data/clock/read pins.
pub fn run_bitwise_ops<P: Platform>(
    ctx: &mut ModeContext<'_, P>,
    ops: &[u8],
    data_pin: u8,
    clock_pin: u8,
    read_pin: u8,
    read: &mut ReadBuffer,
) -> Result<(), BpioError> {
    for &raw in ops {
        let op = BitwiseOp::new_with_raw_value(raw);
        match op.data() {
            PinAction::High | PinAction::Pulse => {
                ctx.bio.output(data_pin);
                ctx.bio.put(data_pin, true);
            }
            PinAction::Low => {
                ctx.bio.output(data_pin);
                ctx.bio.put(data_pin, false);
            }
            PinAction::None => {}
        }
        match op.clock() {
            PinAction::Pulse => {
                ctx.bio.output(clock_pin);
                ctx.bio.put(clock_pin, true);
                ctx.bio.backend_mut().delay_ns(1_000);
                ctx.bio.put(clock_pin, false);
            }
            PinAction::High => {
                ctx.bio.output(clock_pin);
                ctx.bio.put(clock_pin, true);
            }
            PinAction::Low => {
                ctx.bio.output(clock_pin);
                ctx.bio.put(clock_pin, false);
            }
            PinAction::None => {}
        }
        if op.read_sample() {
            let bit = ctx.bio.get(read_pin);
            read.push(bit as u8).map_err(|_| BpioError::TooLarge)?;
        }
    }
    Ok(())
}

/// Server state for the binary channel: frame reassembly plus the response
/// scratch buffers.
pub struct BpioServer {
    accumulator: FrameAccumulator,
}

impl BpioServer {
    pub const fn new() -> Self {
        BpioServer {
            accumulator: FrameAccumulator::new(),
        }
    }

    /// Feeds received wire bytes; every complete frame is handled and its
    /// response appended to `responses`.
    pub fn push_bytes<P: Platform, const N: usize>(
        &mut self,
        dispatcher: &mut Dispatcher<P>,
        bytes: &[u8],
        responses: &mut heapless::Vec<u8, N>,
    ) {
        // Collect the frames first: handling a request needs &mut self on
        // the dispatcher and must not run inside the accumulator borrow.
        let mut frames: heapless::Vec<heapless::Vec<u8, MAX_ENCODED>, 4> = heapless::Vec::new();
        self.accumulator.push(bytes, |frame| {
            let mut copy = heapless::Vec::new();
            if copy.extend_from_slice(frame).is_ok() && frames.push(copy).is_err() {
                log::warn!("binary channel: frame backlog overflow");
            }
        });
        for frame in &frames {
            let mut out = [0u8; MAX_ENCODED];
            let used = handle_frame(dispatcher, frame, &mut out);
            if responses.extend_from_slice(&out[..used]).is_err() {
                log::warn!("binary channel: response buffer overflow");
            }
        }
    }
}

impl Default for BpioServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes one frame, executes it, and writes the encoded response frame
/// into `out`. Always produces a response, even for garbage input.
pub fn handle_frame<P: Platform>(
    dispatcher: &mut Dispatcher<P>,
    encoded: &[u8],
    out: &mut [u8; MAX_ENCODED],
) -> usize {
    let mut scratch = [0u8; MAX_RAW];
    let mut read = ReadBuffer::new();
    let (status, mode) = match frame::decode_frame(encoded, &mut scratch) {
        Ok(payload) => match postcard::from_bytes::<Request<'_>>(payload) {
            Ok(request) => execute(dispatcher, &request, &mut read),
            Err(_) => (StatusCode::DecodeError, dispatcher.active_mode()),
        },
        Err(FrameError::TooLarge) => (StatusCode::TooLarge, dispatcher.active_mode()),
        Err(_) => (StatusCode::DecodeError, dispatcher.active_mode()),
    };

    let response = Response {
        status,
        mode,
        data: &read,
    };
    let mut payload = [0u8; MAX_PAYLOAD];
    let Ok(serialized) = postcard::to_slice(&response, &mut payload) else {
        log::error!("binary channel: response serialization failed");
        return 0;
    };
    match frame::encode_frame(serialized, out) {
        Ok(used) => used,
        Err(error) => {
            log::error!("binary channel: response framing failed: {error}");
            0
        }
    }
}

fn execute<P: Platform>(
    dispatcher: &mut Dispatcher<P>,
    request: &Request<'_>,
    read: &mut ReadBuffer,
) -> (StatusCode, ModeId) {
    match request {
        Request::Status => (StatusCode::Ok, dispatcher.active_mode()),
        Request::ModeChange(config) => {
            let id = config.mode_id();
            match dispatcher.change_mode(id, Some(config)) {
                Ok(()) => {
                    crate::config::save_binmode(&mut dispatcher.store, id);
                    (StatusCode::Ok, id)
                }
                Err(error) => {
                    log::warn!("binary mode change to {id:?} failed: {error}");
                    (StatusCode::ModeChangeFailed, dispatcher.active_mode())
                }
            }
        }
        Request::Transaction(data) => {
            let status = match dispatcher.binary_transaction(data, read) {
                Ok(()) => StatusCode::Ok,
                Err(error) => error.into(),
            };
            (status, dispatcher.active_mode())
        }
    }
}

/// Drains unsolicited UART RX traffic when the UART binary mode is idle.
/// Other modes have nothing to report asynchronously.
pub fn service_uart_async<P: Platform>(
    dispatcher: &mut Dispatcher<P>,
    out: &mut ReadBuffer,
) -> usize {
    let (active, mut ctx) = dispatcher.split();
    match active {
        ActiveMode::Uart(mode) => mode.drain_async(&mut ctx, out),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::loopback_dispatcher;
    use crate::modes::{I2cSetup, SpiSetup};

    fn roundtrip<P: Platform>(
        dispatcher: &mut Dispatcher<P>,
        request: &Request<'_>,
    ) -> (StatusCode, ModeId, Vec<u8>) {
        let mut payload = [0u8; MAX_PAYLOAD];
        let serialized = postcard::to_slice(request, &mut payload).unwrap();
        let mut encoded = [0u8; MAX_ENCODED];
        let used = frame::encode_frame(serialized, &mut encoded).unwrap();

        let mut out = [0u8; MAX_ENCODED];
        let written = handle_frame(dispatcher, &encoded[..used - 1], &mut out);
        let mut scratch = [0u8; MAX_RAW];
        let response_payload = frame::decode_frame(&out[..written - 1], &mut scratch).unwrap();
        let response: Response<'_> = postcard::from_bytes(response_payload).unwrap();
        (response.status, response.mode, response.data.to_vec())
    }

    #[test]
    fn mode_change_then_loopback_transaction() {
        let mut dispatcher = loopback_dispatcher();
        let (status, mode, _) = roundtrip(&mut dispatcher, &Request::ModeChange(ModeConfig::Loopback));
        assert_eq!(status, StatusCode::Ok);
        assert_eq!(mode, ModeId::Loopback);

        let (status, _, data) = roundtrip(
            &mut dispatcher,
            &Request::Transaction(DataRequest {
                data_write: b"\xDE\xAD\xBE\xEF",
                bytes_read: 4,
                ..DataRequest::default()
            }),
        );
        assert_eq!(status, StatusCode::Ok);
        assert_eq!(data, b"\xDE\xAD\xBE\xEF");
    }

    #[test]
    fn spi_read_during_write_over_the_jumper() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher
            .bio
            .backend_mut()
            .tie(crate::modes::spi::MOSI, crate::modes::spi::MISO);
        let (status, _, _) = roundtrip(
            &mut dispatcher,
            &Request::ModeChange(ModeConfig::Spi(SpiSetup::default())),
        );
        assert_eq!(status, StatusCode::Ok);

        let (status, _, data) = roundtrip(
            &mut dispatcher,
            &Request::Transaction(DataRequest {
                start_main: false,
                start_alt: true,
                data_write: b"\x12\x34",
                stop_main: true,
                ..DataRequest::default()
            }),
        );
        assert_eq!(status, StatusCode::Ok);
        assert_eq!(data, b"\x12\x34");
    }

    #[test]
    fn i2c_transaction_reports_missing_device() {
        let mut dispatcher = loopback_dispatcher();
        let (status, _, _) = roundtrip(
            &mut dispatcher,
            &Request::ModeChange(ModeConfig::I2c(I2cSetup::default())),
        );
        assert_eq!(status, StatusCode::Ok);
        let (status, _, _) = roundtrip(
            &mut dispatcher,
            &Request::Transaction(DataRequest {
                start_main: true,
                data_write: &[0x78, 0x00],
                stop_main: true,
                ..DataRequest::default()
            }),
        );
        assert_eq!(status, StatusCode::BusError);
    }

    #[test]
    fn garbage_still_gets_a_decode_error_response() {
        let mut dispatcher = loopback_dispatcher();
        let mut out = [0u8; MAX_ENCODED];
        let written = handle_frame(&mut dispatcher, &[0x05, 0xFF, 0x01], &mut out);
        assert!(written > 0);
        let mut scratch = [0u8; MAX_RAW];
        let payload = frame::decode_frame(&out[..written - 1], &mut scratch).unwrap();
        let response: Response<'_> = postcard::from_bytes(payload).unwrap();
        assert_eq!(response.status, StatusCode::DecodeError);
    }

    #[test]
    fn bitwise_ops_pulse_and_sample() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher
            .bio
            .backend_mut()
            .tie(crate::modes::spi::MOSI, crate::modes::spi::MISO);
        let (status, _, _) = roundtrip(
            &mut dispatcher,
            &Request::ModeChange(ModeConfig::Spi(SpiSetup::default())),
        );
        assert_eq!(status, StatusCode::Ok);

        // Data high + sample, then data low + sample.
        let ops = [0b0001_0010u8, 0b0001_0001];
        let (status, _, data) = roundtrip(
            &mut dispatcher,
            &Request::Transaction(DataRequest {
                bitwise_ops: &ops,
                ..DataRequest::default()
            }),
        );
        assert_eq!(status, StatusCode::Ok);
        assert_eq!(data, &[1, 0]);
    }
}
