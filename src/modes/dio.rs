//! Raw digital IO mode: all eight buffered pins as plain inputs/outputs.

use crate::Platform;
use crate::bio::{BIO_PIN_COUNT, PinPurpose};
use crate::bpio::{BpioError, DataRequest};
use crate::bytecode::Bytecode;
use crate::time::Hertz;

use super::{ModeContext, ModeError, ProtocolMode, ReadBuffer};

const LABELS: [&str; BIO_PIN_COUNT] = ["IO0", "IO1", "IO2", "IO3", "IO4", "IO5", "IO6", "IO7"];

#[derive(Debug, Default)]
pub struct DioMode {
    /// Pins currently driven as outputs, one bit each.
    output_mask: u8,
}

impl<P: Platform> ProtocolMode<P> for DioMode {
    fn name(&self) -> &'static str {
        "DIO"
    }

    fn setup_exc(&mut self, ctx: &mut ModeContext<'_, P>) -> Result<(), ModeError> {
        for pin in 0..BIO_PIN_COUNT as u8 {
            ctx.bio.claim(pin, PinPurpose::Io, LABELS[pin as usize])?;
            ctx.bio.input(pin);
        }
        self.output_mask = 0;
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut ModeContext<'_, P>) {
        self.output_mask = 0;
        for pin in 0..BIO_PIN_COUNT as u8 {
            let _ = ctx.bio.release(pin);
        }
    }

    fn get_speed(&self) -> Hertz {
        Hertz::from_raw(0)
    }

    fn help(&self) -> &'static str {
        "0x.. drive pin levels, r read all pins"
    }

    /// Drives the written value onto all eight pins.
    fn write(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        if self.output_mask != 0xFF {
            for pin in 0..BIO_PIN_COUNT as u8 {
                ctx.bio.output(pin);
            }
            self.output_mask = 0xFF;
        }
        ctx.bio.write_masked(0xFF, result.out_data as u8);
    }

    fn read(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        result.in_data = ctx.bio.read_all() as u32;
    }

    fn data_state(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        result.in_data = ctx.bio.read_all() as u32;
    }

    fn binary_transaction(
        &mut self,
        ctx: &mut ModeContext<'_, P>,
        request: &DataRequest<'_>,
        read: &mut ReadBuffer,
    ) -> Result<(), BpioError> {
        for &byte in request.data_write {
            let mut scratch = Bytecode::write(byte as u32);
            ProtocolMode::<P>::write(self, ctx, &mut scratch);
        }
        for _ in 0..request.bytes_read {
            read.push(ctx.bio.read_all())
                .map_err(|_| BpioError::TooLarge)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::SyntaxCommand;
    use crate::dispatcher::tests::loopback_dispatcher;
    use crate::modes::{ActiveMode, ModeId, ReadBuffer};

    #[test]
    fn writes_drive_all_pins_and_reads_see_them() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher.change_mode(ModeId::Dio, None).unwrap();
        let mut program = [
            Bytecode::write(0x5A),
            Bytecode::new(SyntaxCommand::Read),
            Bytecode::write(0xA5),
            Bytecode::new(SyntaxCommand::DataState),
        ];
        dispatcher.run_syntax(&mut program).unwrap();
        assert_eq!(program[1].in_data, 0x5A);
        assert_eq!(program[3].in_data, 0xA5);
        assert!(!dispatcher.error);
    }

    #[test]
    fn pins_only_switch_to_outputs_on_the_first_write() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher.change_mode(ModeId::Dio, None).unwrap();
        // All inputs after setup: the idle bus reads high.
        let mut program = [Bytecode::new(SyntaxCommand::Read)];
        dispatcher.run_syntax(&mut program).unwrap();
        assert_eq!(program[0].in_data, 0xFF);

        let mut program = [Bytecode::write(0x00), Bytecode::new(SyntaxCommand::Read)];
        dispatcher.run_syntax(&mut program).unwrap();
        assert_eq!(program[1].in_data, 0x00);
    }

    #[test]
    fn binary_transaction_writes_then_samples() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher.change_mode(ModeId::Dio, None).unwrap();
        let (active, mut ctx) = dispatcher.split();
        let ActiveMode::Dio(mode) = active else {
            panic!("wrong mode");
        };
        let mut read = ReadBuffer::new();
        let request = crate::bpio::DataRequest {
            data_write: &[0x3C],
            bytes_read: 1,
            ..Default::default()
        };
        ProtocolMode::<crate::loopback::LoopbackPlatform>::binary_transaction(
            mode, &mut ctx, &request, &mut read,
        )
        .unwrap();
        assert_eq!(&read[..], &[0x3C]);
    }

    #[test]
    fn cleanup_floats_every_pin_back_to_idle() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher.change_mode(ModeId::Dio, None).unwrap();
        let mut program = [Bytecode::write(0x00)];
        dispatcher.run_syntax(&mut program).unwrap();
        assert_eq!(dispatcher.bio.read_all(), 0x00);

        dispatcher.change_mode(ModeId::HiZ, None).unwrap();
        assert_eq!(dispatcher.bio.claimed_count(), 0);
        assert_eq!(dispatcher.bio.read_all(), 0xFF);
    }
}
