//! Channel state and the client-facing transfer seam.
//!
//! Channels are unidirectional and paired even/odd into one client-visible
//! device: the even id moves data host → device, the odd id device → host.
//! Each channel owns exactly one channel ring plus the bookkeeping needed
//! to hand a single host descriptor out to the client across several
//! partial reads.

use crate::element::{CompletionCode, TransferDescriptor};
use crate::ring::{Ring, RingKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

impl Direction {
    /// Direction of a channel by the even/odd pairing convention.
    pub fn of_channel(id: u16) -> Self {
        if id % 2 == 0 {
            Self::HostToDevice
        } else {
            Self::DeviceToHost
        }
    }
}

/// Channel lifecycle states, as published in the channel context record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Disabled,
    Enabled,
    Running,
    Suspended,
    Stopped,
    Error,
}

impl ChannelState {
    pub const fn raw(self) -> u8 {
        match self {
            Self::Disabled => 0,
            Self::Enabled => 1,
            Self::Running => 2,
            Self::Suspended => 3,
            Self::Stopped => 4,
            Self::Error => 5,
        }
    }
}

/// Outcome of one transfer delivered to a [`ChannelClient`].
#[derive(Debug)]
pub struct TransferResult {
    pub direction: Direction,
    /// Payload bytes for host → device completions; empty for
    /// device → host notifications.
    pub buffer: Vec<u8>,
    pub bytes_transferred: usize,
    pub code: CompletionCode,
}

/// Per-channel consumer registered by the client-facing device layer.
///
/// For host → device channels the callback delivers each completed
/// descriptor's payload. For device → host channels it fires with an empty
/// buffer and [`CompletionCode::Success`] when the host posts fresh
/// descriptors, signalling that `queue_outbound` has capacity again.
pub trait ChannelClient {
    fn transfer_complete(&mut self, chan: u16, result: TransferResult);
}

/// The descriptor currently handed out to the client in pieces.
#[derive(Clone, Copy, Debug)]
pub struct InflightDescriptor {
    /// Index of the descriptor in the channel ring.
    pub index: u64,
    pub descriptor: TransferDescriptor,
    /// Bytes of the descriptor not yet copied to the client.
    pub remaining: usize,
}

pub struct Channel {
    id: u16,
    direction: Direction,
    pub(crate) state: ChannelState,
    pub(crate) ring: Ring,
    pub(crate) inflight: Option<InflightDescriptor>,
    pub(crate) client: Option<Box<dyn ChannelClient>>,
}

impl Channel {
    pub fn new(id: u16) -> Self {
        Self {
            id,
            direction: Direction::of_channel(id),
            state: ChannelState::Disabled,
            ring: Ring::new(RingKind::Channel, id),
            inflight: None,
            client: None,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ChannelState::Running
    }

    /// Tears the channel back to its unconfigured baseline.
    pub fn reset(&mut self) {
        self.state = ChannelState::Disabled;
        self.inflight = None;
        self.ring.reset();
    }

    /// Partner channel id in the even/odd pairing.
    pub fn pair_id(&self) -> u16 {
        self.id ^ 1
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("state", &self.state)
            .field("inflight", &self.inflight)
            .field("has_client", &self.client.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_follows_even_odd_pairing() {
        assert_eq!(Direction::of_channel(0), Direction::HostToDevice);
        assert_eq!(Direction::of_channel(1), Direction::DeviceToHost);
        assert_eq!(Direction::of_channel(2), Direction::HostToDevice);

        let ch = Channel::new(2);
        assert_eq!(ch.pair_id(), 3);
        let ch = Channel::new(3);
        assert_eq!(ch.pair_id(), 2);
    }

    #[test]
    fn new_channels_start_disabled_with_no_inflight_descriptor() {
        let ch = Channel::new(0);
        assert_eq!(ch.state(), ChannelState::Disabled);
        assert!(ch.inflight.is_none());
        assert!(!ch.is_running());
    }
}
