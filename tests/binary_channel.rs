//! Binary protocol channel end to end: framed requests in, framed
//! responses out, transactions against the active mode.

use busprobe_core::bpio::frame::{MAX_ENCODED, MAX_PAYLOAD, MAX_RAW, decode_frame, encode_frame};
use busprobe_core::bpio::{BpioServer, DataRequest, Request, Response, StatusCode};
use busprobe_core::dispatcher::{Board, Dispatcher};
use busprobe_core::la::loopback::{LoopbackEngine, Pattern};
use busprobe_core::loopback::{
    EchoFifo, LoopbackPins, LoopbackPlatform, LoopbackSerial, MemoryStore,
};
use busprobe_core::mem::BigBufferRegion;
use busprobe_core::modes::{ModeConfig, ModeId, UartSetup};

fn dispatcher() -> Dispatcher<LoopbackPlatform> {
    Dispatcher::new(
        Board {
            pins: LoopbackPins::new(),
            capture: LoopbackEngine::new(Pattern::Counter, 256),
            serial: LoopbackSerial::default(),
            fifo: EchoFifo::default(),
            store: MemoryStore::default(),
        },
        Box::leak(Box::new(BigBufferRegion::new())),
    )
}

fn encode_request(request: &Request<'_>) -> Vec<u8> {
    let mut payload = [0u8; MAX_PAYLOAD];
    let serialized = postcard::to_slice(request, &mut payload).unwrap();
    let mut encoded = [0u8; MAX_ENCODED];
    let used = encode_frame(serialized, &mut encoded).unwrap();
    encoded[..used].to_vec()
}

fn decode_responses(wire: &[u8]) -> Vec<(StatusCode, ModeId, Vec<u8>)> {
    let mut responses = Vec::new();
    for chunk in wire.split(|&byte| byte == 0) {
        if chunk.is_empty() {
            continue;
        }
        let mut scratch = [0u8; MAX_RAW];
        let payload = decode_frame(chunk, &mut scratch).unwrap();
        let response: Response<'_> = postcard::from_bytes(payload).unwrap();
        responses.push((response.status, response.mode, response.data.to_vec()));
    }
    responses
}

#[test]
fn pipelined_requests_each_get_a_response() {
    let mut core = dispatcher();
    let mut server = BpioServer::new();

    // Three back-to-back frames in one USB burst: mode change, write+read
    // transaction, status query.
    let mut wire = Vec::new();
    wire.extend(encode_request(&Request::ModeChange(ModeConfig::Loopback)));
    wire.extend(encode_request(&Request::Transaction(DataRequest {
        data_write: b"ping",
        bytes_read: 4,
        ..DataRequest::default()
    })));
    wire.extend(encode_request(&Request::Status));

    let mut responses: heapless::Vec<u8, 4096> = heapless::Vec::new();
    server.push_bytes(&mut core, &wire, &mut responses);

    let decoded = decode_responses(&responses);
    assert_eq!(decoded.len(), 3);
    assert_eq!(decoded[0].0, StatusCode::Ok);
    assert_eq!(decoded[0].1, ModeId::Loopback);
    assert_eq!(decoded[1].0, StatusCode::Ok);
    assert_eq!(decoded[1].2, b"ping");
    assert_eq!(decoded[2].0, StatusCode::Ok);
}

#[test]
fn split_frames_reassemble_across_pushes() {
    let mut core = dispatcher();
    let mut server = BpioServer::new();
    let frame = encode_request(&Request::Status);
    let (head, tail) = frame.split_at(frame.len() / 2);

    let mut responses: heapless::Vec<u8, 1024> = heapless::Vec::new();
    server.push_bytes(&mut core, head, &mut responses);
    assert!(responses.is_empty());
    server.push_bytes(&mut core, tail, &mut responses);
    assert_eq!(decode_responses(&responses).len(), 1);
}

#[test]
fn uart_async_drain_feeds_the_notification_path() {
    let mut core = dispatcher();
    core.change_mode(ModeId::Uart, Some(&ModeConfig::Uart(UartSetup::default())))
        .unwrap();
    core.serial.inject_rx(b"unsolicited");

    let mut out = busprobe_core::modes::ReadBuffer::new();
    let drained = busprobe_core::bpio::service_uart_async(&mut core, &mut out);
    assert_eq!(drained, 11);
    assert_eq!(&out[..], b"unsolicited");
}

#[test]
fn rejected_mode_change_falls_back_to_hiz() {
    let mut core = dispatcher();
    core.change_mode(ModeId::Loopback, None).unwrap();
    let mut server = BpioServer::new();
    let bad = encode_request(&Request::ModeChange(ModeConfig::Led(
        busprobe_core::modes::LedSetup {
            kind: busprobe_core::modes::LedKind::Ws2812,
            num_leds: 0,
        },
    )));
    let mut responses: heapless::Vec<u8, 1024> = heapless::Vec::new();
    server.push_bytes(&mut core, &bad, &mut responses);
    let decoded = decode_responses(&responses);
    assert_eq!(decoded[0].0, StatusCode::ModeChangeFailed);
    // The failed change left the device in the HiZ safe state.
    assert_eq!(decoded[0].1, ModeId::HiZ);
    assert_eq!(core.active_mode(), ModeId::HiZ);
}
