//! Protocol mode system.
//!
//! Every bus protocol implements [`ProtocolMode`]; operations a mode leaves
//! to the default implementation report "no effect" and set the error flag
//! instead of aborting, so the dispatcher never has to null-check anything.
//! [`ActiveMode`] is the closed registry: one variant per mode, dispatched
//! at compile time.

use serde::{Deserialize, Serialize};

use crate::Platform;
use crate::bio::{BioPins, PinClaimError};
use crate::bpio::{BpioError, DataRequest};
use crate::bytecode::{Bytecode, no_effect};
use crate::time::Hertz;

pub mod dio;
pub mod hiz;
pub mod i2c;
pub mod led;
pub mod loopback;
pub mod onewire;
pub mod spi;
pub mod threewire;
pub mod twowire;
pub mod uart;

pub use hiz::HiZMode;

/// Buffer for bytes read back by a binary transaction.
pub type ReadBuffer = heapless::Vec<u8, 512>;

/// Wire-order applied by the display/BPIO layer before data reaches a bus.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BitOrder {
    #[default]
    MsbFirst,
    LsbFirst,
}

/// Global display configuration the dispatcher owns.
#[derive(Debug, Copy, Clone, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DisplayConfig {
    pub bit_order: BitOrder,
}

/// Power-path state beside the pin claim table. The HiZ mode forces all of
/// it off.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PowerState {
    pub psu_enabled: bool,
    pub pullups_enabled: bool,
    /// Frequency generators active per pin, one bit each.
    pub freq_active: u8,
    /// PWM generators active per pin, one bit each.
    pub pwm_active: u8,
}

impl PowerState {
    pub fn all_off(&self) -> bool {
        *self == PowerState::default()
    }
}

/// Everything a mode may touch while it runs, borrowed from the dispatcher
/// for the duration of one call.
pub struct ModeContext<'a, P: Platform> {
    pub bio: &'a mut BioPins<P::Pins>,
    pub serial: &'a mut P::Serial,
    pub store: &'a mut P::Store,
    pub power: &'a mut PowerState,
    pub display: &'a DisplayConfig,
}

/// Bus-level failures reported per bytecode element. Subsequent elements
/// still execute.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    #[error("no acknowledge")]
    Nack,
    #[error("bus timeout")]
    Timeout,
    #[error("short circuit suspected")]
    ShortCircuit,
    #[error("no device responded")]
    NoDevice,
}

/// Failures of mode setup and teardown. Resource errors unwind the mode
/// change back to HiZ.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ModeError {
    #[error("configuration rejected: {0}")]
    Config(&'static str),
    #[error(transparent)]
    Pin(#[from] PinClaimError),
    #[error("sanity check failed: {0}")]
    SanityCheck(&'static str),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Rejection of a flag-driven mode configuration request.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    #[error("{0} out of range")]
    OutOfRange(&'static str),
    #[error("configuration does not match this mode")]
    WrongMode,
}

/// Named command a mode exposes on top of the syntax, e.g. `scan`.
#[derive(Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ModeCommand {
    pub name: &'static str,
    pub description: &'static str,
    /// Skip the follow-along capture bracket around this command. Set on
    /// commands that drive the analyzer themselves.
    pub suppress_fala_capture: bool,
}

//==================================================================================================
// Per-mode binary configuration
//==================================================================================================

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SpiSetup {
    pub speed_hz: u32,
    pub data_bits: u8,
    pub clock_polarity: bool,
    pub clock_phase: bool,
    /// Idle level of the chip select line; true selects active-low CS.
    pub chip_select_idle_high: bool,
}

impl Default for SpiSetup {
    fn default() -> Self {
        SpiSetup {
            speed_hz: 100_000,
            data_bits: 8,
            clock_polarity: false,
            clock_phase: false,
            chip_select_idle_high: true,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct I2cSetup {
    pub speed_hz: u32,
    pub data_bits: u8,
    pub clock_stretch: bool,
}

impl Default for I2cSetup {
    fn default() -> Self {
        I2cSetup {
            speed_hz: 400_000,
            data_bits: 8,
            clock_stretch: false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UartParity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct UartSetup {
    pub baud: u32,
    pub parity: UartParity,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub flow_control: bool,
    pub invert: bool,
}

impl Default for UartSetup {
    fn default() -> Self {
        UartSetup {
            baud: 115_200,
            parity: UartParity::None,
            data_bits: 8,
            stop_bits: 1,
            flow_control: false,
            invert: false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum LedKind {
    Ws2812 = 0,
    Apa102 = 1,
    Onboard = 2,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LedSetup {
    pub kind: LedKind,
    pub num_leds: u16,
}

impl Default for LedSetup {
    fn default() -> Self {
        LedSetup {
            kind: LedKind::Ws2812,
            num_leds: 1,
        }
    }
}

/// Flag-driven configuration carried by a binary mode-change request.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ModeConfig {
    HiZ,
    OneWire,
    Uart(UartSetup),
    I2c(I2cSetup),
    Spi(SpiSetup),
    TwoWire,
    ThreeWire,
    Dio,
    Led(LedSetup),
    Loopback,
}

impl ModeConfig {
    pub fn mode_id(&self) -> ModeId {
        match self {
            ModeConfig::HiZ => ModeId::HiZ,
            ModeConfig::OneWire => ModeId::OneWire,
            ModeConfig::Uart(_) => ModeId::Uart,
            ModeConfig::I2c(_) => ModeId::I2c,
            ModeConfig::Spi(_) => ModeId::Spi,
            ModeConfig::TwoWire => ModeId::TwoWire,
            ModeConfig::ThreeWire => ModeId::ThreeWire,
            ModeConfig::Dio => ModeId::Dio,
            ModeConfig::Led(_) => ModeId::Led,
            ModeConfig::Loopback => ModeId::Loopback,
        }
    }
}

//==================================================================================================
// The mode trait
//==================================================================================================

/// Uniform interface over every bus protocol.
///
/// The lifecycle is `configure` (optional, flag-driven) → `setup_exc`
/// (claim pins, bring up peripherals) → syntax/command/binary traffic →
/// `cleanup` (release everything). `cleanup` must be idempotent and must
/// leave the follow-up HiZ entry able to succeed.
pub trait ProtocolMode<P: Platform> {
    fn name(&self) -> &'static str;

    fn commands(&self) -> &'static [ModeCommand] {
        &[]
    }

    /// Applies a flag-driven configuration. Interactive setup lives in the
    /// UI layer and ends up calling this too.
    fn configure(&mut self, config: &ModeConfig) -> Result<(), ConfigError> {
        if config.mode_id().name() == self.name() {
            Ok(())
        } else {
            Err(ConfigError::WrongMode)
        }
    }

    /// Claims pins and initializes peripherals. On failure the dispatcher
    /// rolls back to HiZ.
    fn setup_exc(&mut self, ctx: &mut ModeContext<'_, P>) -> Result<(), ModeError>;

    /// Releases every resource `setup_exc` took. Must be idempotent.
    fn cleanup(&mut self, ctx: &mut ModeContext<'_, P>);

    /// Current protocol clock; drives the follow-along oversampling.
    fn get_speed(&self) -> Hertz {
        Hertz::from_raw(0)
    }

    /// Checked once before a syntax program runs (pull-ups present, power
    /// good, no conflicting claims). A failure aborts the whole program.
    fn preflight_sanity_check(&self, _ctx: &mut ModeContext<'_, P>) -> Result<(), ModeError> {
        Ok(())
    }

    /// Lets asynchronous peripherals drain after a syntax element.
    fn wait_done(&mut self, _ctx: &mut ModeContext<'_, P>) {}

    /// Polled every event-loop iteration.
    fn periodic(&mut self, _ctx: &mut ModeContext<'_, P>) {}

    fn settings(&self, _out: &mut dyn core::fmt::Write) -> core::fmt::Result {
        Ok(())
    }

    fn help(&self) -> &'static str {
        ""
    }

    // Syntax operations. Defaults report "no effect" and continue.

    fn start(&mut self, _ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        no_effect(result);
    }
    fn start_alt(&mut self, _ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        no_effect(result);
    }
    fn stop(&mut self, _ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        no_effect(result);
    }
    fn stop_alt(&mut self, _ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        no_effect(result);
    }
    fn write(&mut self, _ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        no_effect(result);
    }
    fn read(&mut self, _ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        no_effect(result);
    }
    fn clock_high(&mut self, _ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        no_effect(result);
    }
    fn clock_low(&mut self, _ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        no_effect(result);
    }
    fn tick_clock(&mut self, _ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        no_effect(result);
    }
    fn data_high(&mut self, _ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        no_effect(result);
    }
    fn data_low(&mut self, _ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        no_effect(result);
    }
    fn data_state(&mut self, _ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        no_effect(result);
    }
    fn read_bit(&mut self, _ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        no_effect(result);
    }
    fn run_macro(&mut self, _ctx: &mut ModeContext<'_, P>, _which: u32, result: &mut Bytecode) {
        no_effect(result);
    }

    /// One transaction from the binary protocol channel. Modes without a
    /// binary handler reject the request.
    fn binary_transaction(
        &mut self,
        _ctx: &mut ModeContext<'_, P>,
        _request: &DataRequest<'_>,
        _read: &mut ReadBuffer,
    ) -> Result<(), BpioError> {
        Err(BpioError::Unsupported)
    }
}

//==================================================================================================
// Registry
//==================================================================================================

/// Stable mode identifiers. HiZ is index zero by contract: it is the sink
/// state every mode change passes through.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ModeId {
    HiZ = 0,
    OneWire,
    Uart,
    I2c,
    Spi,
    TwoWire,
    ThreeWire,
    Dio,
    Led,
    Loopback,
}

impl ModeId {
    pub const ALL: [ModeId; 10] = [
        ModeId::HiZ,
        ModeId::OneWire,
        ModeId::Uart,
        ModeId::I2c,
        ModeId::Spi,
        ModeId::TwoWire,
        ModeId::ThreeWire,
        ModeId::Dio,
        ModeId::Led,
        ModeId::Loopback,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ModeId::HiZ => "HiZ",
            ModeId::OneWire => "1WIRE",
            ModeId::Uart => "UART",
            ModeId::I2c => "I2C",
            ModeId::Spi => "SPI",
            ModeId::TwoWire => "2WIRE",
            ModeId::ThreeWire => "3WIRE",
            ModeId::Dio => "DIO",
            ModeId::Led => "LED",
            ModeId::Loopback => "LOOPBACK",
        }
    }

    pub fn from_name(name: &str) -> Option<ModeId> {
        ModeId::ALL
            .into_iter()
            .find(|id| id.name().eq_ignore_ascii_case(name))
    }
}

/// The active mode instance. One variant per protocol; operations are
/// selected at compile time.
pub enum ActiveMode {
    HiZ(hiz::HiZMode),
    OneWire(onewire::OneWireMode),
    Uart(uart::UartMode),
    I2c(i2c::I2cMode),
    Spi(spi::SpiMode),
    TwoWire(twowire::TwoWireMode),
    ThreeWire(threewire::ThreeWireMode),
    Dio(dio::DioMode),
    Led(led::LedMode),
    Loopback(loopback::LoopbackMode),
}

impl ActiveMode {
    pub fn new(id: ModeId) -> Self {
        match id {
            ModeId::HiZ => ActiveMode::HiZ(Default::default()),
            ModeId::OneWire => ActiveMode::OneWire(Default::default()),
            ModeId::Uart => ActiveMode::Uart(Default::default()),
            ModeId::I2c => ActiveMode::I2c(Default::default()),
            ModeId::Spi => ActiveMode::Spi(Default::default()),
            ModeId::TwoWire => ActiveMode::TwoWire(Default::default()),
            ModeId::ThreeWire => ActiveMode::ThreeWire(Default::default()),
            ModeId::Dio => ActiveMode::Dio(Default::default()),
            ModeId::Led => ActiveMode::Led(Default::default()),
            ModeId::Loopback => ActiveMode::Loopback(Default::default()),
        }
    }

    pub fn id(&self) -> ModeId {
        match self {
            ActiveMode::HiZ(_) => ModeId::HiZ,
            ActiveMode::OneWire(_) => ModeId::OneWire,
            ActiveMode::Uart(_) => ModeId::Uart,
            ActiveMode::I2c(_) => ModeId::I2c,
            ActiveMode::Spi(_) => ModeId::Spi,
            ActiveMode::TwoWire(_) => ModeId::TwoWire,
            ActiveMode::ThreeWire(_) => ModeId::ThreeWire,
            ActiveMode::Dio(_) => ModeId::Dio,
            ActiveMode::Led(_) => ModeId::Led,
            ActiveMode::Loopback(_) => ModeId::Loopback,
        }
    }
}

macro_rules! delegate {
    ($self:expr, $method:ident ( $($arg:expr),* )) => {
        match $self {
            ActiveMode::HiZ(mode) => ProtocolMode::<P>::$method(mode, $($arg),*),
            ActiveMode::OneWire(mode) => ProtocolMode::<P>::$method(mode, $($arg),*),
            ActiveMode::Uart(mode) => ProtocolMode::<P>::$method(mode, $($arg),*),
            ActiveMode::I2c(mode) => ProtocolMode::<P>::$method(mode, $($arg),*),
            ActiveMode::Spi(mode) => ProtocolMode::<P>::$method(mode, $($arg),*),
            ActiveMode::TwoWire(mode) => ProtocolMode::<P>::$method(mode, $($arg),*),
            ActiveMode::ThreeWire(mode) => ProtocolMode::<P>::$method(mode, $($arg),*),
            ActiveMode::Dio(mode) => ProtocolMode::<P>::$method(mode, $($arg),*),
            ActiveMode::Led(mode) => ProtocolMode::<P>::$method(mode, $($arg),*),
            ActiveMode::Loopback(mode) => ProtocolMode::<P>::$method(mode, $($arg),*),
        }
    };
}

impl<P: Platform> ProtocolMode<P> for ActiveMode {
    fn name(&self) -> &'static str {
        delegate!(self, name())
    }
    fn commands(&self) -> &'static [ModeCommand] {
        delegate!(self, commands())
    }
    fn configure(&mut self, config: &ModeConfig) -> Result<(), ConfigError> {
        delegate!(self, configure(config))
    }
    fn setup_exc(&mut self, ctx: &mut ModeContext<'_, P>) -> Result<(), ModeError> {
        delegate!(self, setup_exc(ctx))
    }
    fn cleanup(&mut self, ctx: &mut ModeContext<'_, P>) {
        delegate!(self, cleanup(ctx))
    }
    fn get_speed(&self) -> Hertz {
        delegate!(self, get_speed())
    }
    fn preflight_sanity_check(&self, ctx: &mut ModeContext<'_, P>) -> Result<(), ModeError> {
        delegate!(self, preflight_sanity_check(ctx))
    }
    fn wait_done(&mut self, ctx: &mut ModeContext<'_, P>) {
        delegate!(self, wait_done(ctx))
    }
    fn periodic(&mut self, ctx: &mut ModeContext<'_, P>) {
        delegate!(self, periodic(ctx))
    }
    fn settings(&self, out: &mut dyn core::fmt::Write) -> core::fmt::Result {
        delegate!(self, settings(out))
    }
    fn help(&self) -> &'static str {
        delegate!(self, help())
    }
    fn start(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        delegate!(self, start(ctx, result))
    }
    fn start_alt(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        delegate!(self, start_alt(ctx, result))
    }
    fn stop(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        delegate!(self, stop(ctx, result))
    }
    fn stop_alt(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        delegate!(self, stop_alt(ctx, result))
    }
    fn write(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        delegate!(self, write(ctx, result))
    }
    fn read(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        delegate!(self, read(ctx, result))
    }
    fn clock_high(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        delegate!(self, clock_high(ctx, result))
    }
    fn clock_low(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        delegate!(self, clock_low(ctx, result))
    }
    fn tick_clock(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        delegate!(self, tick_clock(ctx, result))
    }
    fn data_high(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        delegate!(self, data_high(ctx, result))
    }
    fn data_low(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        delegate!(self, data_low(ctx, result))
    }
    fn data_state(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        delegate!(self, data_state(ctx, result))
    }
    fn read_bit(&mut self, ctx: &mut ModeContext<'_, P>, result: &mut Bytecode) {
        delegate!(self, read_bit(ctx, result))
    }
    fn run_macro(&mut self, ctx: &mut ModeContext<'_, P>, which: u32, result: &mut Bytecode) {
        delegate!(self, run_macro(ctx, which, result))
    }
    fn binary_transaction(
        &mut self,
        ctx: &mut ModeContext<'_, P>,
        request: &DataRequest<'_>,
        read: &mut ReadBuffer,
    ) -> Result<(), BpioError> {
        delegate!(self, binary_transaction(ctx, request, read))
    }
}
