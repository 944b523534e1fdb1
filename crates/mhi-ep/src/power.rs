//! Device power and link state machine.
//!
//! The endpoint tracks two related states: the protocol's standardized
//! power state (Reset/Ready/M0/M3/...) and the physical link's power state
//! (D0/D3). Host-requested transitions arrive as [`PowerEvent`]s through a
//! single-consumer queue; each event is validated against the legality
//! table before any state is mutated, and illegal events are logged and
//! rejected without touching the current state.

use std::collections::VecDeque;

use tracing::warn;

use crate::{MhiEpError, Result};

/// Standardized MHI power states. M1 and M2 exist on the wire but are not
/// supported by this endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MhiState {
    Reset,
    Ready,
    M0,
    M1,
    M2,
    M3,
    SysErr,
}

impl MhiState {
    pub const fn raw(self) -> u8 {
        match self {
            Self::Reset => 0x00,
            Self::Ready => 0x01,
            Self::M0 => 0x02,
            Self::M1 => 0x03,
            Self::M2 => 0x04,
            Self::M3 => 0x05,
            Self::SysErr => 0xff,
        }
    }

    pub const fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x00 => Some(Self::Reset),
            0x01 => Some(Self::Ready),
            0x02 => Some(Self::M0),
            0x03 => Some(Self::M1),
            0x04 => Some(Self::M2),
            0x05 => Some(Self::M3),
            0xff => Some(Self::SysErr),
            _ => None,
        }
    }
}

/// Physical link power states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Disabled,
    D0,
    D3Hot,
    D3Cold,
}

/// Execution environment (firmware stage) reported to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecEnv {
    Pbl,
    Sbl,
    Amss,
    Unknown(u8),
}

impl ExecEnv {
    pub const fn raw(self) -> u8 {
        match self {
            Self::Pbl => 0x00,
            Self::Sbl => 0x01,
            Self::Amss => 0x02,
            Self::Unknown(raw) => raw,
        }
    }
}

/// Events fed to the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PowerEvent {
    /// Host requested the active state.
    EnterM0,
    /// Host requested suspend.
    EnterM3,
    /// Hardware-accelerated or core-initiated wake request.
    Wake,
}

/// The power/link state machine plus its event queue.
///
/// The queue keeps event handling single-file: producers (the interrupt
/// path, the power-up sequence) enqueue, and one drain loop pops and
/// applies events in arrival order.
#[derive(Debug)]
pub struct PowerManager {
    state: MhiState,
    link: LinkState,
    queue: VecDeque<PowerEvent>,
}

impl PowerManager {
    pub fn new() -> Self {
        Self {
            state: MhiState::Reset,
            link: LinkState::Disabled,
            queue: VecDeque::new(),
        }
    }

    pub fn state(&self) -> MhiState {
        self.state
    }

    pub fn link_state(&self) -> LinkState {
        self.link
    }

    pub fn set_link_state(&mut self, link: LinkState) {
        self.link = link;
    }

    pub fn enqueue(&mut self, event: PowerEvent) {
        self.queue.push_back(event);
    }

    pub fn pop_event(&mut self) -> Option<PowerEvent> {
        self.queue.pop_front()
    }

    /// The legality table: may `event` be applied in the current state?
    pub fn is_allowed(&self, event: PowerEvent) -> bool {
        match event {
            PowerEvent::EnterM0 => self.link == LinkState::D0 && self.state != MhiState::Reset,
            PowerEvent::EnterM3 => matches!(self.state, MhiState::M0 | MhiState::M3),
            PowerEvent::Wake => matches!(self.state, MhiState::M0 | MhiState::M3),
        }
    }

    /// Applies `event`, returning the previous state. Illegal events are
    /// rejected without mutating the state.
    pub fn transition(&mut self, event: PowerEvent) -> Result<MhiState> {
        if !self.is_allowed(event) {
            warn!(state = ?self.state, link = ?self.link, ?event, "illegal power transition rejected");
            return Err(MhiEpError::IllegalTransition {
                state: self.state,
                event,
            });
        }
        let prev = self.state;
        self.state = match event {
            PowerEvent::EnterM0 => MhiState::M0,
            PowerEvent::EnterM3 => MhiState::M3,
            // A wake request does not change the power state by itself; the
            // host drives the M3 -> M0 move.
            PowerEvent::Wake => self.state,
        };
        Ok(prev)
    }

    /// Moves Reset -> Ready during bring-up. The register-level gating
    /// (host published Reset with the ready flag clear) lives with the
    /// controller; this only orders the internal state.
    pub fn set_ready(&mut self) {
        self.state = MhiState::Ready;
    }

    pub fn set_syserr(&mut self) {
        self.state = MhiState::SysErr;
    }

    /// Drops back to the post-reset baseline, keeping the link state.
    pub fn reset(&mut self) {
        self.state = MhiState::Reset;
        self.queue.clear();
    }
}

impl Default for PowerManager {
    fn default() -> Self {
        Self::new()
    }
}
