//! Endpoint-side MHI (Modem Host Interface) bus transport.
//!
//! MHI is a shared-memory transport that lets a peripheral expose logical
//! data channels to a host processor. The host owns every ring and context
//! record in its own memory; the endpoint (this crate) mirrors what it
//! needs, consumes command and channel rings when the host rings a
//! doorbell register, produces completion records onto event rings, and
//! signals the host with an MSI after each batch of completions.
//!
//! The crate is the device model only. Everything that touches the outside
//! world comes in through a seam:
//! - [`host_mem::HostMemory`] — host-resident memory (ring arrays, context
//!   records, payload buffers).
//! - [`MsiSignal`] — raising an interrupt towards the host.
//! - [`Delay`] — sleeps for bounded retry loops.
//! - [`channel::ChannelClient`] / [`ChannelPairListener`] — the
//!   client-facing side of each logical channel.
//!
//! The root object is [`controller::MhiEpController`]; a host-simulation
//! harness drives it by writing its register file through
//! `mmio_write`/`mmio_read` and then letting the deferred contexts run via
//! `handle_irq`.

pub mod channel;
pub mod context;
pub mod controller;
pub mod element;
pub mod power;
pub mod regs;
pub mod ring;

use std::time::Duration;

use thiserror::Error;

pub use channel::{ChannelClient, Direction, TransferResult};
pub use controller::{MhiEpConfig, MhiEpController};
pub use power::{ExecEnv, LinkState, MhiState, PowerEvent};

/// Raises an interrupt towards the host (an MSI on the endpoint's PCIe
/// function). Vectors come from the host-published event ring contexts.
pub trait MsiSignal {
    fn raise(&mut self, vector: u32);
}

/// Platform sleep primitive used by bounded retry loops (waiting for the
/// host to reach M0, settle delays before announcing the execution
/// environment).
pub trait Delay {
    fn sleep(&mut self, duration: Duration);
}

/// A [`Delay`] that does not sleep. Useful in tests and in harnesses that
/// drive the controller from a scheduler of their own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDelay;

impl Delay for NoDelay {
    fn sleep(&mut self, _duration: Duration) {}
}

/// Notified when a Start-Channel command has brought an even/odd channel
/// pair up, i.e. when the client-visible logical device becomes usable.
pub trait ChannelPairListener {
    fn pair_started(&mut self, host_to_dev: u16, dev_to_host: u16);
}

/// Errors surfaced by the transport core.
///
/// The variants fall into four classes: protocol violations (rejected and
/// logged, no recovery at this layer), resource exhaustion (retryable),
/// host-memory access failures (transparent wrap, the enclosing element is
/// aborted without partial effects), and fatal conditions.
#[derive(Debug, Error)]
pub enum MhiEpError {
    #[error(transparent)]
    Memory(#[from] host_mem::HostMemoryError),

    #[error("invalid controller configuration: {0}")]
    Config(&'static str),

    #[error("ring element cache allocation failed")]
    CacheAlloc,

    #[error("ring has no free slots")]
    RingFull,

    #[error("ring has not been started by the host")]
    RingNotStarted,

    #[error("no descriptors available")]
    NothingAvailable,

    #[error("channel {0} out of range")]
    InvalidChannel(u16),

    #[error("event ring {0} out of range")]
    InvalidEventRing(u16),

    #[error("malformed ring context: {0}")]
    MalformedContext(&'static str),

    #[error("payload of {payload} bytes exceeds descriptor capacity of {capacity} bytes")]
    Overflow { payload: usize, capacity: usize },

    #[error("illegal transition: {event:?} while in {state:?}")]
    IllegalTransition {
        state: power::MhiState,
        event: power::PowerEvent,
    },

    #[error("channel {channel} does not transfer in the {requested:?} direction")]
    DirectionMismatch {
        channel: u16,
        requested: channel::Direction,
    },

    #[error("channel {0} is not running")]
    ChannelNotRunning(u16),

    #[error("host has not published the reset state with the ready flag clear")]
    NotReset,

    #[error("host did not reach M0 within the retry budget")]
    PowerUpTimeout,

    #[error("host context caches have not been fetched yet")]
    CachesNotReady,
}

pub type Result<T> = std::result::Result<T, MhiEpError>;
