//! Core subsystems shared by the bus probe firmware builds.
//!
//! The crate bundles the pieces every build of the instrument needs: the
//! dual-ended big-buffer allocator ([`mem`]), the look-behind logic analyzer
//! ([`la`]) with its follow-along hook bus ([`fala`]), the protocol mode
//! dispatcher ([`dispatcher`] / [`modes`]), the binary protocol channel
//! ([`bpio`]) and the intercore RGB arbitration ([`intercore`]).
//!
//! Hardware access is funneled through the [`Platform`] trait bundle so the
//! same core runs on silicon and against the deterministic loopback
//! back-ends in [`loopback`].
#![cfg_attr(not(test), no_std)]

pub mod bio;
pub mod bpio;
pub mod bytecode;
pub mod config;
pub mod dispatcher;
pub mod fala;
pub mod intercore;
pub mod la;
pub mod loopback;
pub mod mem;
pub mod modes;
pub mod time;

pub use dispatcher::Dispatcher;
pub use mem::{BigBuffer, BigBufferRegion, Owner};
pub use time::Hertz;

/// Hardware seams the core is generic over, bundled so a single type
/// parameter travels through the dispatcher.
///
/// A board support crate implements this once; host tests use
/// [`loopback::LoopbackPlatform`].
pub trait Platform {
    /// Electrical access to the eight buffered IO pins.
    type Pins: bio::PinBackend;
    /// The PIO + chained-DMA capture pair behind the logic analyzer.
    type Capture: la::engine::CaptureEngine;
    /// Hardware UART used by the UART mode.
    type Serial: modes::uart::SerialPort;
    /// The intercore mailbox FIFO shared with the second CPU.
    type Fifo: intercore::IntercoreFifo;
    /// Persisted configuration medium.
    type Store: config::ConfigStore;
}

#[allow(dead_code)]
pub(crate) mod sealed {
    pub trait Sealed {}
}
