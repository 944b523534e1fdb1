//! Ring element (descriptor) wire format.
//!
//! Every ring element is a 16-byte little-endian record consumed or
//! produced by the host's independent implementation of this protocol, so
//! the byte layout here is a hard external contract:
//!
//! - bytes `0..8`: a 64-bit data/reference pointer (transfer source or
//!   target buffer; for completion events, the address of the element the
//!   completion refers to),
//! - bytes `8..12`: the status dword — transfer length in bits 15:0, a
//!   completion code / state value / execution environment in bits 31:24,
//! - bytes `12..16`: the control dword — flag bits in the low bits, a
//!   channel id in byte 14, and the element-type tag always in byte 15.
//!
//! Encoding and decoding are explicit byte-buffer operations; nothing here
//! relies on struct layout.

/// Length of one ring element in bytes.
pub const ELEMENT_LEN: usize = 16;

/// One wire-format ring element.
pub type RawElement = [u8; ELEMENT_LEN];

const FLAG_CHAIN: u32 = 1 << 0;
const FLAG_IEOB: u32 = 1 << 8;
const FLAG_IEOT: u32 = 1 << 9;
const FLAG_BEI: u32 = 1 << 10;

/// Element-type tags (byte 15).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementType {
    Noop,
    Transfer,
    ResetChannel,
    StopChannel,
    StartChannel,
    StateChangeEvent,
    CommandCompletionEvent,
    TransferCompletionEvent,
    EeChangeEvent,
    Unknown(u8),
}

impl ElementType {
    #[inline]
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0x01 => Self::Noop,
            0x02 => Self::Transfer,
            0x10 => Self::ResetChannel,
            0x11 => Self::StopChannel,
            0x12 => Self::StartChannel,
            0x20 => Self::StateChangeEvent,
            0x21 => Self::CommandCompletionEvent,
            0x22 => Self::TransferCompletionEvent,
            0x40 => Self::EeChangeEvent,
            other => Self::Unknown(other),
        }
    }

    #[inline]
    pub const fn raw(self) -> u8 {
        match self {
            Self::Noop => 0x01,
            Self::Transfer => 0x02,
            Self::ResetChannel => 0x10,
            Self::StopChannel => 0x11,
            Self::StartChannel => 0x12,
            Self::StateChangeEvent => 0x20,
            Self::CommandCompletionEvent => 0x21,
            Self::TransferCompletionEvent => 0x22,
            Self::EeChangeEvent => 0x40,
            Self::Unknown(raw) => raw,
        }
    }
}

/// Completion codes carried in event elements (byte 11).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionCode {
    Invalid,
    Success,
    Eot,
    Overflow,
    Eob,
    Undefined,
    BadElement,
    Unknown(u8),
}

impl CompletionCode {
    #[inline]
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0x00 => Self::Invalid,
            0x01 => Self::Success,
            0x02 => Self::Eot,
            0x03 => Self::Overflow,
            0x04 => Self::Eob,
            0x10 => Self::Undefined,
            0x11 => Self::BadElement,
            other => Self::Unknown(other),
        }
    }

    #[inline]
    pub const fn raw(self) -> u8 {
        match self {
            Self::Invalid => 0x00,
            Self::Success => 0x01,
            Self::Eot => 0x02,
            Self::Overflow => 0x03,
            Self::Eob => 0x04,
            Self::Undefined => 0x10,
            Self::BadElement => 0x11,
            Self::Unknown(raw) => raw,
        }
    }
}

#[inline]
pub fn type_tag(raw: &RawElement) -> ElementType {
    ElementType::from_raw(raw[15])
}

#[inline]
pub fn channel_id(raw: &RawElement) -> u16 {
    raw[14] as u16
}

#[inline]
fn dword(raw: &RawElement, index: usize) -> u32 {
    let base = index * 4;
    u32::from_le_bytes([raw[base], raw[base + 1], raw[base + 2], raw[base + 3]])
}

#[inline]
fn pointer(raw: &RawElement) -> u64 {
    u64::from_le_bytes([
        raw[0], raw[1], raw[2], raw[3], raw[4], raw[5], raw[6], raw[7],
    ])
}

fn assemble(ptr: u64, dword0: u32, flags: u32, chan: u16, ty: ElementType) -> RawElement {
    debug_assert!(chan <= 0xff, "channel id {chan} does not fit the wire format");
    let mut raw = [0u8; ELEMENT_LEN];
    raw[0..8].copy_from_slice(&ptr.to_le_bytes());
    raw[8..12].copy_from_slice(&dword0.to_le_bytes());
    let dword1 = (flags & 0x0000_ffff) | ((chan as u32 & 0xff) << 16) | ((ty.raw() as u32) << 24);
    raw[12..16].copy_from_slice(&dword1.to_le_bytes());
    raw
}

/// A transfer descriptor posted by the host on a channel ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferDescriptor {
    /// Host bus address of the payload segment.
    pub ptr: u64,
    /// Segment length in bytes.
    pub len: u16,
    /// More descriptors belong to the same logical transfer.
    pub chain: bool,
    /// Interrupt on end-of-block (a chained segment completing).
    pub ieob: bool,
    /// Interrupt on end-of-transfer (the final segment completing).
    pub ieot: bool,
    /// Suppress the block-completion interrupt.
    pub bei: bool,
}

impl TransferDescriptor {
    pub fn parse(raw: &RawElement) -> Self {
        let dword1 = dword(raw, 3);
        Self {
            ptr: pointer(raw),
            len: (dword(raw, 2) & 0xffff) as u16,
            chain: dword1 & FLAG_CHAIN != 0,
            ieob: dword1 & FLAG_IEOB != 0,
            ieot: dword1 & FLAG_IEOT != 0,
            bei: dword1 & FLAG_BEI != 0,
        }
    }

    pub fn encode(&self) -> RawElement {
        let mut flags = 0;
        if self.chain {
            flags |= FLAG_CHAIN;
        }
        if self.ieob {
            flags |= FLAG_IEOB;
        }
        if self.ieot {
            flags |= FLAG_IEOT;
        }
        if self.bei {
            flags |= FLAG_BEI;
        }
        assemble(self.ptr, self.len as u32, flags, 0, ElementType::Transfer)
    }
}

/// Encodes a Start/Stop/Reset-Channel (or no-op) command element.
///
/// Commands are host-produced; the endpoint only encodes them in tests and
/// host-simulation harnesses.
pub fn encode_command(ty: ElementType, chan: u16) -> RawElement {
    assemble(0, 0, 0, chan, ty)
}

/// A transfer completion record produced on an event ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferCompletionEvent {
    /// Host address of the completed transfer descriptor.
    pub desc_addr: u64,
    pub chan: u16,
    /// Bytes moved for that descriptor.
    pub len: u16,
    pub code: CompletionCode,
}

impl TransferCompletionEvent {
    pub fn parse(raw: &RawElement) -> Self {
        let dword0 = dword(raw, 2);
        Self {
            desc_addr: pointer(raw),
            chan: channel_id(raw),
            len: (dword0 & 0xffff) as u16,
            code: CompletionCode::from_raw((dword0 >> 24) as u8),
        }
    }

    pub fn encode(&self) -> RawElement {
        let dword0 = (self.len as u32) | ((self.code.raw() as u32) << 24);
        assemble(
            self.desc_addr,
            dword0,
            0,
            self.chan,
            ElementType::TransferCompletionEvent,
        )
    }
}

/// A command completion record produced on event ring 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandCompletionEvent {
    /// Host address of the completed command element.
    pub cmd_addr: u64,
    pub code: CompletionCode,
}

impl CommandCompletionEvent {
    pub fn parse(raw: &RawElement) -> Self {
        Self {
            cmd_addr: pointer(raw),
            code: CompletionCode::from_raw((dword(raw, 2) >> 24) as u8),
        }
    }

    pub fn encode(&self) -> RawElement {
        let dword0 = (self.code.raw() as u32) << 24;
        assemble(
            self.cmd_addr,
            dword0,
            0,
            0,
            ElementType::CommandCompletionEvent,
        )
    }
}

/// A power-state-change notification produced on event ring 0. The state
/// value is the raw MHI state byte.
pub fn encode_state_change(state: u8) -> RawElement {
    assemble(0, (state as u32) << 24, 0, 0, ElementType::StateChangeEvent)
}

pub fn parse_state_change(raw: &RawElement) -> u8 {
    (dword(raw, 2) >> 24) as u8
}

/// An execution-environment-change notification produced on event ring 0.
pub fn encode_ee_change(ee: u8) -> RawElement {
    assemble(0, (ee as u32) << 24, 0, 0, ElementType::EeChangeEvent)
}

pub fn parse_ee_change(raw: &RawElement) -> u8 {
    (dword(raw, 2) >> 24) as u8
}
