//! End-to-end follow-along capture: a bus program runs inside the capture
//! bracket and the host pulls the samples over the binary stream.

use busprobe_core::bytecode::{Bytecode, SyntaxCommand};
use busprobe_core::dispatcher::{Board, Dispatcher};
use busprobe_core::fala::stream::FalaStream;
use busprobe_core::la::LA_BUFFER_SIZE;
use busprobe_core::la::loopback::{LoopbackEngine, Pattern};
use busprobe_core::loopback::{
    EchoFifo, LoopbackPins, LoopbackPlatform, LoopbackSerial, MemoryStore,
};
use busprobe_core::mem::BigBufferRegion;
use busprobe_core::modes::{ModeConfig, ModeId, SpiSetup};

fn dispatcher_with_stimulus(stimulus: u32) -> Dispatcher<LoopbackPlatform> {
    Dispatcher::new(
        Board {
            pins: LoopbackPins::new(),
            capture: LoopbackEngine::new(Pattern::Counter, stimulus),
            serial: LoopbackSerial::default(),
            fifo: EchoFifo::default(),
            store: MemoryStore::default(),
        },
        Box::leak(Box::new(BigBufferRegion::new())),
    )
}

#[test]
fn capture_preamble_and_dump_after_a_bus_program() {
    let mut dispatcher = dispatcher_with_stimulus(1000);
    let mut stream = FalaStream::new();
    stream
        .setup(&mut dispatcher.fala, &mut dispatcher.buffer)
        .unwrap();

    dispatcher
        .change_mode(ModeId::Spi, Some(&ModeConfig::Spi(SpiSetup::default())))
        .unwrap();

    let mut program = [
        Bytecode::new(SyntaxCommand::Start),
        Bytecode::write(0xA5),
        Bytecode::new(SyntaxCommand::Stop),
    ];
    dispatcher.run_syntax(&mut program).unwrap();

    // Preamble announces the capture parameters and sample count.
    let mut preamble = [0u8; 128];
    let mut writer = &mut preamble[..];
    stream.notify(&mut dispatcher.fala, &mut writer);
    let written = 128 - writer.len();
    let text = core::str::from_utf8(&preamble[..written]).unwrap();
    assert!(text.starts_with("$FALADATA;8;0;0;N;"), "got {text:?}");
    assert!(text.contains(";1000;"), "got {text:?}");

    // `+` pulls every sample, oldest first.
    let mut dump = vec![0u8; 2048];
    let mut writer = &mut dump[..];
    let mut request: &[u8] = b"+";
    stream.service(&mut dispatcher.fala, &mut request, &mut writer);
    let mut empty: &[u8] = b"";
    while stream.dump_in_progress() {
        stream.service(&mut dispatcher.fala, &mut empty, &mut writer);
    }
    let written = 2048 - writer.len();
    assert_eq!(written, 1000);
    for (index, &byte) in dump[..written].iter().enumerate() {
        assert_eq!(byte, index as u8);
    }

    // Tearing the stream down releases the capture ring.
    stream
        .cleanup(&mut dispatcher.fala, &mut dispatcher.buffer, &mut dispatcher.icm)
        .unwrap();
    dispatcher.buffer.verify_no_temporary_allocations();
}

#[test]
fn saturated_capture_reports_the_ring_size() {
    let mut dispatcher = dispatcher_with_stimulus(2 * LA_BUFFER_SIZE as u32);
    let mut stream = FalaStream::new();
    stream
        .setup(&mut dispatcher.fala, &mut dispatcher.buffer)
        .unwrap();
    dispatcher.change_mode(ModeId::Loopback, None).unwrap();

    let mut program = [Bytecode::write(0x01)];
    dispatcher.run_syntax(&mut program).unwrap();

    let la = dispatcher.fala.la_mut().unwrap();
    assert_eq!(la.samples_from_zero(), LA_BUFFER_SIZE as u32);
}
