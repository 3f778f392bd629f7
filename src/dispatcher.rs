//! Protocol mode dispatcher: owns the active mode, the shared hardware
//! state, and the execution of parsed syntax programs.
//!
//! Mode changes always pass through HiZ. The outgoing mode cleans up, HiZ
//! forces the device passive, and only then does the incoming mode claim
//! its resources; if that fails the device stays in HiZ rather than half
//! configured.

use crate::Platform;
use crate::bio::{BioPins, PinBackend};
use crate::bpio::{BpioError, DataRequest};
use crate::bytecode::{Bytecode, SyntaxCommand};
use crate::fala::FalaBus;
use crate::intercore::IcmSender;
use crate::mem::{BigBuffer, BigBufferRegion};
use crate::modes::{
    ActiveMode, ConfigError, DisplayConfig, HiZMode, ModeCommand, ModeConfig, ModeContext,
    ModeError, ModeId, PowerState, ProtocolMode, ReadBuffer,
};

/// Commands available in every mode. Mode tables shadow these on name
/// collision.
pub const GLOBAL_COMMANDS: &[ModeCommand] = &[
    ModeCommand {
        name: "ls",
        description: "list files on the storage card",
        suppress_fala_capture: false,
    },
    ModeCommand {
        name: "cd",
        description: "change storage directory",
        suppress_fala_capture: false,
    },
    ModeCommand {
        name: "m",
        description: "change protocol mode",
        suppress_fala_capture: false,
    },
    ModeCommand {
        name: "W",
        description: "enable the onboard power supply",
        suppress_fala_capture: false,
    },
    ModeCommand {
        name: "w",
        description: "disable the onboard power supply",
        suppress_fala_capture: false,
    },
    ModeCommand {
        name: "P",
        description: "enable pull-up resistors",
        suppress_fala_capture: false,
    },
    ModeCommand {
        name: "p",
        description: "disable pull-up resistors",
        suppress_fala_capture: false,
    },
    ModeCommand {
        name: "v",
        description: "measure pin voltages",
        suppress_fala_capture: false,
    },
    ModeCommand {
        name: "logic",
        description: "logic analyzer settings and navigation",
        suppress_fala_capture: true,
    },
];

/// Where a command lookup matched.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandScope {
    Mode,
    Global,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ModeChangeError {
    #[error("configuration rejected: {0}")]
    Config(#[from] ConfigError),
    #[error("mode setup failed: {0}")]
    Setup(ModeError),
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SyntaxAbort {
    #[error("preflight check failed: {0}")]
    Preflight(ModeError),
}

/// The hardware bundle handed to [`Dispatcher::new`].
pub struct Board<P: Platform> {
    pub pins: P::Pins,
    pub capture: P::Capture,
    pub serial: P::Serial,
    pub fifo: P::Fifo,
    pub store: P::Store,
}

/// Owner of the core state: active mode, pins, power, follow-along bus,
/// intercore channel and the Big Buffer.
pub struct Dispatcher<P: Platform> {
    pub bio: BioPins<P::Pins>,
    pub serial: P::Serial,
    pub store: P::Store,
    pub fala: FalaBus<P::Capture>,
    pub icm: IcmSender<P::Fifo>,
    pub buffer: BigBuffer,
    pub power: PowerState,
    pub display: DisplayConfig,
    /// Global error indicator; colors the prompt, never stops the shell.
    pub error: bool,
    active: ActiveMode,
}

impl<P: Platform> Dispatcher<P> {
    /// Builds the core and forces the device into the HiZ safe state.
    pub fn new(board: Board<P>, region: &'static mut BigBufferRegion) -> Self {
        let mut dispatcher = Dispatcher {
            bio: BioPins::new(board.pins),
            serial: board.serial,
            store: board.store,
            fala: FalaBus::new(board.capture),
            icm: IcmSender::new(board.fifo),
            buffer: BigBuffer::new(region),
            power: PowerState::default(),
            display: DisplayConfig::default(),
            error: false,
            active: ActiveMode::new(ModeId::HiZ),
        };
        let (active, mut ctx) = dispatcher.split();
        ProtocolMode::<P>::setup_exc(active, &mut ctx).expect("HiZ entry cannot fail");
        dispatcher
    }

    /// Splits the dispatcher into the active mode and the context the mode
    /// borrows. The two sides are disjoint, so mode calls can hold both.
    pub fn split(&mut self) -> (&mut ActiveMode, ModeContext<'_, P>) {
        (
            &mut self.active,
            ModeContext {
                bio: &mut self.bio,
                serial: &mut self.serial,
                store: &mut self.store,
                power: &mut self.power,
                display: &self.display,
            },
        )
    }

    pub fn active_mode(&self) -> ModeId {
        self.active.id()
    }

    pub fn mode_name(&self) -> &'static str {
        ProtocolMode::<P>::name(&self.active)
    }

    /// The full mode-change protocol: cleanup, HiZ interlude, configure,
    /// setup, follow-along speed notification. On failure the device is
    /// left in HiZ and the error is reported.
    pub fn change_mode(
        &mut self,
        id: ModeId,
        config: Option<&ModeConfig>,
    ) -> Result<(), ModeChangeError> {
        let (active, mut ctx) = self.split();
        ProtocolMode::<P>::cleanup(active, &mut ctx);
        let mut hiz = HiZMode;
        ProtocolMode::<P>::setup_exc(&mut hiz, &mut ctx).expect("HiZ entry cannot fail");

        // A dangling capture ring across a mode boundary is the kind of bug
        // that surfaces weeks later; catch it here. The follow-along ring
        // legitimately persists while subscribers exist.
        if !self.fala.has_hook() {
            self.buffer.verify_no_temporary_allocations();
        }

        self.active = ActiveMode::new(id);
        if let Some(config) = config {
            let result = ProtocolMode::<P>::configure(&mut self.active, config);
            if let Err(error) = result {
                self.active = ActiveMode::new(ModeId::HiZ);
                self.fala.mode_change_hook(crate::Hertz::from_raw(0));
                return Err(error.into());
            }
        }

        let (active, mut ctx) = self.split();
        if let Err(error) = ProtocolMode::<P>::setup_exc(active, &mut ctx) {
            log::warn!("mode {id:?} setup failed, rolling back to HiZ: {error}");
            ProtocolMode::<P>::cleanup(active, &mut ctx);
            let mut hiz = HiZMode;
            ProtocolMode::<P>::setup_exc(&mut hiz, &mut ctx).expect("HiZ entry cannot fail");
            self.active = ActiveMode::new(ModeId::HiZ);
            self.fala.mode_change_hook(crate::Hertz::from_raw(0));
            return Err(ModeChangeError::Setup(error));
        }

        let speed = ProtocolMode::<P>::get_speed(&self.active);
        self.fala.mode_change_hook(speed);
        log::info!("mode changed to {}", ProtocolMode::<P>::name(&self.active));
        Ok(())
    }

    fn dispatch_one(&mut self, record: &mut Bytecode) {
        let (active, mut ctx) = self.split();
        match record.command {
            SyntaxCommand::Write => ProtocolMode::<P>::write(active, &mut ctx, record),
            SyntaxCommand::Read => ProtocolMode::<P>::read(active, &mut ctx, record),
            SyntaxCommand::Start => ProtocolMode::<P>::start(active, &mut ctx, record),
            SyntaxCommand::StartAlt => ProtocolMode::<P>::start_alt(active, &mut ctx, record),
            SyntaxCommand::Stop => ProtocolMode::<P>::stop(active, &mut ctx, record),
            SyntaxCommand::StopAlt => ProtocolMode::<P>::stop_alt(active, &mut ctx, record),
            SyntaxCommand::ClockHigh => ProtocolMode::<P>::clock_high(active, &mut ctx, record),
            SyntaxCommand::ClockLow => ProtocolMode::<P>::clock_low(active, &mut ctx, record),
            SyntaxCommand::TickClock => ProtocolMode::<P>::tick_clock(active, &mut ctx, record),
            SyntaxCommand::DataHigh => ProtocolMode::<P>::data_high(active, &mut ctx, record),
            SyntaxCommand::DataLow => ProtocolMode::<P>::data_low(active, &mut ctx, record),
            SyntaxCommand::DataState => ProtocolMode::<P>::data_state(active, &mut ctx, record),
            SyntaxCommand::ReadBit => ProtocolMode::<P>::read_bit(active, &mut ctx, record),
            SyntaxCommand::DelayUs => ctx
                .bio
                .backend_mut()
                .delay_ns(record.out_data.saturating_mul(1_000)),
            SyntaxCommand::DelayMs => ctx
                .bio
                .backend_mut()
                .delay_ns(record.out_data.saturating_mul(1_000_000)),
        }
    }

    /// Executes one parsed program. The follow-along capture brackets the
    /// whole run; per-element protocol errors set flags and keep going, a
    /// failed preflight aborts before anything touches the bus.
    pub fn run_syntax(&mut self, program: &mut [Bytecode]) -> Result<(), SyntaxAbort> {
        {
            let (active, mut ctx) = self.split();
            ProtocolMode::<P>::preflight_sanity_check(active, &mut ctx)
                .map_err(SyntaxAbort::Preflight)?;
        }
        self.fala.start_hook(&mut self.icm);

        for index in 0..program.len() {
            let mut record = program[index];
            for _ in 0..record.repeat.max(1) {
                self.dispatch_one(&mut record);
            }
            {
                let (active, mut ctx) = self.split();
                ProtocolMode::<P>::wait_done(active, &mut ctx);
            }
            if record.error {
                self.error = true;
            }
            program[index] = record;
        }

        self.fala.stop_hook();
        self.fala.notify_hook();
        Ok(())
    }

    /// Executes a macro through the same capture bracket as a program.
    pub fn run_macro(&mut self, which: u32) -> Bytecode {
        let mut record = Bytecode::new(SyntaxCommand::Write);
        self.fala.start_hook(&mut self.icm);
        {
            let (active, mut ctx) = self.split();
            ProtocolMode::<P>::run_macro(active, &mut ctx, which, &mut record);
        }
        self.fala.stop_hook();
        self.fala.notify_hook();
        if record.error {
            self.error = true;
        }
        record
    }

    /// Command lookup: the mode table shadows the global one.
    pub fn lookup_command(&self, name: &str) -> Option<(&'static ModeCommand, CommandScope)> {
        let mode_commands = ProtocolMode::<P>::commands(&self.active);
        if let Some(command) = mode_commands.iter().find(|command| command.name == name) {
            return Some((command, CommandScope::Mode));
        }
        GLOBAL_COMMANDS
            .iter()
            .find(|command| command.name == name)
            .map(|command| (command, CommandScope::Global))
    }

    /// Runs a named command's body inside the follow-along bracket unless
    /// the command suppresses capture (analyzer commands do).
    pub fn run_command<T>(
        &mut self,
        command: &ModeCommand,
        body: impl FnOnce(&mut Self) -> T,
    ) -> T {
        if command.suppress_fala_capture {
            return body(self);
        }
        self.fala.start_hook(&mut self.icm);
        let out = body(self);
        self.fala.stop_hook();
        self.fala.notify_hook();
        out
    }

    /// One binary transaction against the active mode, captured like any
    /// other bus activity.
    pub fn binary_transaction(
        &mut self,
        request: &DataRequest<'_>,
        read: &mut ReadBuffer,
    ) -> Result<(), BpioError> {
        self.fala.start_hook(&mut self.icm);
        let result = {
            let (active, mut ctx) = self.split();
            ProtocolMode::<P>::binary_transaction(active, &mut ctx, request, read)
        };
        self.fala.stop_hook();
        self.fala.notify_hook();
        result
    }

    /// Event-loop service hook for the active mode.
    pub fn periodic(&mut self) {
        let (active, mut ctx) = self.split();
        ProtocolMode::<P>::periodic(active, &mut ctx);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::la::loopback::{LoopbackEngine, Pattern};
    use crate::loopback::{EchoFifo, LoopbackPins, LoopbackPlatform, LoopbackSerial, MemoryStore};

    pub(crate) fn loopback_dispatcher() -> Dispatcher<LoopbackPlatform> {
        let region = Box::leak(Box::new(BigBufferRegion::new()));
        Dispatcher::new(
            Board {
                pins: LoopbackPins::new(),
                capture: LoopbackEngine::new(Pattern::Counter, 4096),
                serial: LoopbackSerial::default(),
                fifo: EchoFifo::default(),
                store: MemoryStore::default(),
            },
            region,
        )
    }

    #[test]
    fn starts_in_hiz_with_a_passive_device() {
        let dispatcher = loopback_dispatcher();
        assert_eq!(dispatcher.active_mode(), ModeId::HiZ);
        assert_eq!(dispatcher.bio.claimed_count(), 0);
        assert!(dispatcher.power.all_off());
    }

    #[test]
    fn every_mode_returns_to_a_clean_hiz() {
        for id in ModeId::ALL {
            if id == ModeId::HiZ {
                continue;
            }
            let mut dispatcher = loopback_dispatcher();
            dispatcher.power.psu_enabled = true;
            dispatcher
                .change_mode(id, None)
                .unwrap_or_else(|error| panic!("{id:?} setup failed: {error}"));
            dispatcher.change_mode(ModeId::HiZ, None).unwrap();
            assert_eq!(dispatcher.bio.claimed_count(), 0, "{id:?} leaked pin claims");
            assert!(dispatcher.power.all_off(), "{id:?} left the power path on");
        }
    }

    #[test]
    fn repeated_mode_change_is_idempotent() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher.change_mode(ModeId::Spi, None).unwrap();
        let claims = dispatcher.bio.claimed_count();
        dispatcher.change_mode(ModeId::Spi, None).unwrap();
        assert_eq!(dispatcher.bio.claimed_count(), claims);
        assert_eq!(dispatcher.active_mode(), ModeId::Spi);
    }

    #[test]
    fn failed_setup_rolls_back_to_hiz() {
        let mut dispatcher = loopback_dispatcher();
        // An invalid configuration is rejected before setup.
        let bad = ModeConfig::Spi(crate::modes::SpiSetup {
            speed_hz: 0,
            ..Default::default()
        });
        assert!(dispatcher.change_mode(ModeId::Spi, Some(&bad)).is_err());
        assert_eq!(dispatcher.active_mode(), ModeId::HiZ);
        assert_eq!(dispatcher.bio.claimed_count(), 0);
    }

    #[test]
    fn unimplemented_operations_report_and_continue() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher.change_mode(ModeId::Dio, None).unwrap();
        let mut program = [
            Bytecode::new(SyntaxCommand::TickClock),
            Bytecode::write(0x0F),
            Bytecode::new(SyntaxCommand::Read),
        ];
        dispatcher.run_syntax(&mut program).unwrap();
        assert!(program[0].error);
        assert_eq!(
            program[0].message,
            Some(crate::bytecode::NO_EFFECT_MESSAGE)
        );
        // The rest of the program still executed.
        assert!(!program[1].error);
        assert_eq!(program[2].in_data, 0x0F);
        assert!(dispatcher.error);
    }

    #[test]
    fn repeat_replays_a_record() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher.change_mode(ModeId::Loopback, None).unwrap();
        let mut program = [
            Bytecode::write(0x11).with_repeat(3),
            Bytecode::new(SyntaxCommand::Read),
            Bytecode::new(SyntaxCommand::Read),
            Bytecode::new(SyntaxCommand::Read),
            Bytecode::new(SyntaxCommand::Read),
        ];
        dispatcher.run_syntax(&mut program).unwrap();
        assert_eq!(program[1].in_data, 0x11);
        assert_eq!(program[3].in_data, 0x11);
        // Only three writes happened; the fourth read under-runs.
        assert!(program[4].error);
    }

    #[test]
    fn command_lookup_prefers_the_mode_table() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher.change_mode(ModeId::I2c, None).unwrap();
        let (command, scope) = dispatcher.lookup_command("scan").unwrap();
        assert_eq!(scope, CommandScope::Mode);
        assert!(!command.suppress_fala_capture);
        let (command, scope) = dispatcher.lookup_command("logic").unwrap();
        assert_eq!(scope, CommandScope::Global);
        assert!(command.suppress_fala_capture);
        assert!(dispatcher.lookup_command("nope").is_none());
    }

    #[test]
    fn fala_brackets_syntax_runs() {
        let mut dispatcher = loopback_dispatcher();
        dispatcher
            .fala
            .register(crate::fala::FalaHook::TerminalSummary, &mut dispatcher.buffer)
            .unwrap();
        dispatcher.change_mode(ModeId::Loopback, None).unwrap();
        let mut program = [Bytecode::write(0xAB)];
        dispatcher.run_syntax(&mut program).unwrap();
        let la = dispatcher.fala.la_mut().unwrap();
        // The loopback engine fed its whole stimulus during the bracket.
        assert_eq!(la.samples_from_zero(), 4096);
    }
}
