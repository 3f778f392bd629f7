//! UART bridge mode.
//!
//! The hardware UART block does the bit timing; this mode owns the claim on
//! the TX/RX pins, the configuration, and the pump between the bus and the
//! user. Received bytes arrive asynchronously and are drained by the
//! periodic hook into a small holding ring.

use crate::Platform;
use crate::bio::{PinBackend, PinPurpose};
use crate::bpio::{BpioError, DataRequest};
use crate::bytecode::Bytecode;
use crate::config;
use crate::time::Hertz;

use super::{
    ConfigError, ModeCommand, ModeConfig, ModeContext, ModeError, ProtocolMode, ReadBuffer,
    UartSetup,
};

pub const TX: u8 = 4;
pub const RX: u8 = 5;

/// Poll budget for a blocking read before reporting a timeout.
const READ_TIMEOUT_POLLS: u32 = 0xFFFF;

/// Upper bound for one asynchronous drain (the binary channel's
/// notification path).
pub const ASYNC_DRAIN_MAX: usize = 512;

const COMMANDS: &[ModeCommand] = &[
    ModeCommand {
        name: "bridge",
        description: "transparent UART bridge to the terminal",
        suppress_fala_capture: true,
    },
    ModeCommand {
        name: "glitch",
        description: "trigger-synchronized glitch generator",
        suppress_fala_capture: false,
    },
];

/// The hardware transmitter/receiver pair behind the mode.
pub trait SerialPort {
    fn configure(&mut self, setup: &UartSetup);
    fn write_byte(&mut self, byte: u8);
    /// Non-blocking receive.
    fn read_byte(&mut self) -> nb::Result<u8, core::convert::Infallible>;
    /// True when the transmit shifter and FIFO are empty.
    fn tx_idle(&self) -> bool;
}

#[derive(Debug, Default)]
pub struct UartMode {
    setup: UartSetup,
    configured: bool,
    open: bool,
    /// Unsolicited RX bytes held for the display layer.
    pending: heapless::Deque<u8, 64>,
}

impl UartMode {
    pub fn pending_byte(&mut self) -> Option<u8> {
        self.pending.pop_front()
    }

    /// Drains unsolicited RX traffic in one burst: first byte, a short
    /// settle wait, then everything that arrived behind it.
    pub fn drain_async<P: Platform>(
        &mut self,
        ctx: &mut ModeContext<'_, P>,
        out: &mut ReadBuffer,
    ) -> usize {
        let Ok(first) = ctx.serial.read_byte() else {
            return 0;
        };
        let _ = out.push(first);
        // Give a sender mid-burst time to queue the rest.
        ctx.bio.backend_mut().delay_ns(200_000);
        while out.len() < ASYNC_DRAIN_MAX {
            match ctx.serial.read_byte() {
                Ok(byte) => {
                    if out.push(byte).is_err() {
                        break;
                    }
                }
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(_)) => break,
            }
        }
        out.len()
    }
}

impl<P: Platform> ProtocolMode<P> for UartMode {
    fn name(&self) -> &'static str {
        "UART"
    }

    fn commands(&self) -> &'static [ModeCommand] {
        COMMANDS
    }

    fn configure(&mut self, config: &ModeConfig) -> Result<(), ConfigError> {
        let ModeConfig::Uart(setup) = config else {
            return Err(ConfigError::WrongMode);
        };
        if setup.baud == 0 || setup.baud > 7_800_000 {
            return Err(ConfigError::OutOfRange("baud"));
        }
        if !(5..=8).contains(&setup.data_bits) {
            return Err(ConfigError::OutOfRange("data bits"));
        }
        if !(1..=2).contains(&setup.stop_bits) {
            return Err(ConfigError::OutOfRange("stop bits"));
        }
        self.setup = *setup;
        self.configured = true;
        Ok(())
    }

    fn setup_exc(&mut self, ctx: &mut ModeContext<'_, P>) -> Result<(), ModeError> {
        if !self.configured {
            if let Some(saved) = config::load_uart(ctx.store) {
                self.setup = saved;
            }
            self.configured = true;
        }
        config::save_uart(ctx.store, &self.setup);

        ctx.bio.claim(TX, PinPurpose::Mode, "TX")?;
        ctx.bio.claim(RX, PinPurpose::Mode, "RX")?;
        ctx.serial.configure(&self.setup);
        self.open = false;
        self.pending.clear();
        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut ModeContext<'_, P>) {
        self.open = false;
        self.pending.clear();
        for pin in [TX, RX] {
            let _ = ctx.bio.release(pin);
        }
    }

    fn get_speed(&self) -> Hertz {
        Hertz::from_raw(self.setup.baud)
    }

    fn settings(&self, out: &mut dyn core::fmt::Write) -> core::fmt::Result {
        write!(
            out,
            "UART {} baud, {}{}{}, flow control: {}, invert: {}",
            self.setup.baud,
            self.setup.data_bits,
            match self.setup.parity {
                super::UartParity::None => "N",
                super::UartParity::Odd => "O",
                super::UartParity::Even => "E",
            },
            self.setup.stop_bits,
            if self.setup.flow_control { "on" } else { "off" },
            if self.setup.invert { "on" } else { "off" },
        )
    }

    fn help(&self) -> &'static str {
        "[ open, { open with RX echo, ] close, 0x.. write, r read"
    }

    /// Polled from the main loop; keeps unsolicited RX from overflowing the
    /// hardware FIFO while the port is open.
    fn periodic(&mut self, ctx: &mut ModeContext<'_, P>) {
        if !self.open {
            return;
        }
        while let Ok(byte) = ctx.serial.read_byte() {
            if self.pending.push_back(byte).is_err() {
                // Oldest byte gives way; the bridge consumer is behind.
                self.pending.pop_front();
                let _ = self.pending.push_back(byte);
            }
        }
    }

    fn start(&mut self, _ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        self.open = true;
        result.message = Some("UART OPEN");
    }

    fn start_alt(&mut self, _ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        self.open = true;
        result.message = Some("UART OPEN (ASYNC READ)");
    }

    fn stop(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        // Let the transmitter drain before the port closes.
        ProtocolMode::<P>::wait_done(self, ctx);
        self.open = false;
        result.message = Some("UART CLOSED");
    }

    fn stop_alt(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        ProtocolMode::<P>::stop(self, ctx, result);
    }

    fn write(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        ctx.serial.write_byte(result.out_data as u8);
    }

    fn read(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        // Buffered bytes first, then a bounded wait on the wire.
        if let Some(byte) = self.pending.pop_front() {
            result.in_data = byte as u32;
            return;
        }
        for _ in 0..READ_TIMEOUT_POLLS {
            if let Ok(byte) = ctx.serial.read_byte() {
                result.in_data = byte as u32;
                return;
            }
        }
        result.error = true;
        result.message = Some("no data");
    }

    fn wait_done(&mut self, ctx: &mut ModeContext<'_, P>) {
        let mut budget = READ_TIMEOUT_POLLS;
        while !ctx.serial.tx_idle() && budget > 0 {
            budget -= 1;
        }
    }

    fn binary_transaction(
        &mut self,
        ctx: &mut ModeContext<'_, P>,
        request: &DataRequest<'_>,
        read: &mut ReadBuffer,
    ) -> Result<(), BpioError> {
        if request.debug {
            log::debug!("[UART] transaction: {request:?}");
        }
        for &byte in request.data_write {
            ctx.serial.write_byte(byte);
        }
        ProtocolMode::<P>::wait_done(self, ctx);
        for _ in 0..request.bytes_read {
            let mut received = None;
            for _ in 0..READ_TIMEOUT_POLLS {
                if let Ok(byte) = ctx.serial.read_byte() {
                    received = Some(byte);
                    break;
                }
            }
            match received {
                Some(byte) => read.push(byte).map_err(|_| BpioError::TooLarge)?,
                None => return Err(BpioError::Timeout),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::loopback_dispatcher;
    use crate::modes::{ActiveMode, ModeId};

    #[test]
    fn loopback_serial_round_trips_through_the_syntax() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher
            .change_mode(ModeId::Uart, Some(&ModeConfig::Uart(UartSetup::default())))
            .unwrap();
        let mut program = [
            Bytecode::new(crate::bytecode::SyntaxCommand::Start),
            Bytecode::write(0x42),
            Bytecode::new(crate::bytecode::SyntaxCommand::Read),
            Bytecode::new(crate::bytecode::SyntaxCommand::Stop),
        ];
        dispatcher.run_syntax(&mut program).unwrap();
        // The loopback serial wires TX back into RX.
        assert_eq!(program[2].in_data, 0x42);
        assert!(!program[2].error);
    }

    #[test]
    fn async_drain_batches_unsolicited_bytes() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher
            .change_mode(ModeId::Uart, Some(&ModeConfig::Uart(UartSetup::default())))
            .unwrap();
        dispatcher.serial.inject_rx(b"hello from the wire");

        let (active, mut ctx) = dispatcher.split();
        let ActiveMode::Uart(mode) = active else {
            panic!("wrong mode");
        };
        let mut out = ReadBuffer::new();
        let drained = mode.drain_async(&mut ctx, &mut out);
        assert_eq!(drained, 19);
        assert_eq!(&out[..], b"hello from the wire");
        // Nothing further queued: the drain reports an empty batch.
        assert_eq!(mode.drain_async(&mut ctx, &mut out), 0);
    }
}
