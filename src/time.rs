//! Frequency and clock types shared across the crate.

pub use fugit::HertzU32 as Hertz;
pub use fugit::RateExtU32;

/// System clock of the target MCU. Capture dividers and protocol clock
/// configuration are derived from this value.
pub const CLK_SYS: Hertz = Hertz::from_raw(125_000_000);
