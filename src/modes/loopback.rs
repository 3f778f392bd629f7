//! Binary loopback mode: writes come straight back on reads.
//!
//! No pins, no peripherals. Exists to exercise the dispatcher, the syntax
//! path and the binary channel end to end without touching hardware.

use crate::Platform;
use crate::bpio::{BpioError, DataRequest};
use crate::bytecode::Bytecode;
use crate::time::Hertz;

use super::{ModeContext, ModeError, ProtocolMode, ReadBuffer};

#[derive(Debug, Default)]
pub struct LoopbackMode {
    queue: heapless::Deque<u8, 512>,
}

impl<P: Platform> ProtocolMode<P> for LoopbackMode {
    fn name(&self) -> &'static str {
        "LOOPBACK"
    }

    fn setup_exc(&mut self, _ctx: &mut ModeContext<'_, P>) -> Result<(), ModeError> {
        self.queue.clear();
        Ok(())
    }

    fn cleanup(&mut self, _ctx: &mut ModeContext<'_, P>) {
        self.queue.clear();
    }

    fn get_speed(&self) -> Hertz {
        Hertz::from_raw(1_000_000)
    }

    fn help(&self) -> &'static str {
        "0x.. queue a byte, r read it back"
    }

    fn start(&mut self, _ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        self.queue.clear();
        result.message = Some("LOOPBACK RESET");
    }

    fn write(&mut self, _ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        if self.queue.push_back(result.out_data as u8).is_err() {
            result.error = true;
            result.message = Some("loopback queue full");
        }
    }

    fn read(&mut self, _ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        match self.queue.pop_front() {
            Some(byte) => result.in_data = byte as u32,
            None => {
                result.error = true;
                result.message = Some("loopback queue empty");
            }
        }
    }

    fn binary_transaction(
        &mut self,
        _ctx: &mut ModeContext<'_, P>,
        request: &DataRequest<'_>,
        read: &mut ReadBuffer,
    ) -> Result<(), BpioError> {
        for &byte in request.data_write {
            if self.queue.push_back(byte).is_err() {
                return Err(BpioError::TooLarge);
            }
        }
        for _ in 0..request.bytes_read {
            let byte = self.queue.pop_front().unwrap_or(0);
            read.push(byte).map_err(|_| BpioError::TooLarge)?;
        }
        Ok(())
    }
}
