//! The ring engine: a circular descriptor array living in host memory,
//! mirrored locally by the endpoint.
//!
//! Every ring is an array of 16-byte elements whose base, length and
//! pointers are published by the host in a context record. The endpoint
//! never dereferences host memory directly; command and channel rings are
//! mirrored into a local element cache that is refreshed up to the host's
//! write pointer whenever a doorbell announces new work. Event rings are
//! not cached — the endpoint is their producer, and the host's consumer
//! position arrives through the event ring doorbell instead.
//!
//! Index discipline: `read_offset` and `write_offset` are element indices
//! modulo the ring length. The ring is empty when they are equal and is
//! never allowed to become completely full (the producer keeps one slot
//! free), so equality alone distinguishes empty from full. On event rings
//! the endpoint is the producer, which makes `read_offset` the *producer*
//! cursor from its point of view — the shared convention names the field
//! after the host's reading of it.

use host_mem::{HostMemory, MappedRegion};
use tracing::debug;

use crate::context::{self, RingContext};
use crate::element::{RawElement, ELEMENT_LEN};
use crate::regs::Registers;
use crate::{MhiEpError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingKind {
    Command,
    Event,
    Channel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RingState {
    /// No context bound yet.
    Uninitialized,
    /// Bound to a host context, no work queued.
    Idle,
    /// A doorbell was observed; the ring is queued for processing.
    Pending,
}

/// One ring plus its local mirror state.
#[derive(Debug)]
pub struct Ring {
    kind: RingKind,
    id: u16,
    state: RingState,
    /// Ring length in elements.
    len: u64,
    /// Consumer cursor (producer cursor on event rings), element index.
    rd_offset: u64,
    /// The host's write pointer as last observed, element index.
    wr_offset: u64,
    /// Mirrored copy of the host-resident context record.
    ctx: RingContext,
    /// Host address of the context record (for read-pointer write-back).
    ctx_addr: u64,
    /// Local element mirror; empty for event rings.
    cache: Vec<RawElement>,
    started: bool,
}

impl Ring {
    pub fn new(kind: RingKind, id: u16) -> Self {
        Self {
            kind,
            id,
            state: RingState::Uninitialized,
            len: 0,
            rd_offset: 0,
            wr_offset: 0,
            ctx: RingContext::default(),
            ctx_addr: 0,
            cache: Vec::new(),
            started: false,
        }
    }

    pub fn kind(&self) -> RingKind {
        self.kind
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn state(&self) -> RingState {
        self.state
    }

    pub fn set_state(&mut self, state: RingState) {
        self.state = state;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.rd_offset == self.wr_offset
    }

    pub fn read_offset(&self) -> u64 {
        self.rd_offset
    }

    pub fn write_offset(&self) -> u64 {
        self.wr_offset
    }

    pub fn context(&self) -> &RingContext {
        &self.ctx
    }

    pub(crate) fn context_mut(&mut self) -> &mut RingContext {
        &mut self.ctx
    }

    /// Host address of element `index`.
    pub fn element_addr(&self, index: u64) -> u64 {
        self.ctx.rbase + index * ELEMENT_LEN as u64
    }

    /// The cached copy of element `index`. Only meaningful for command and
    /// channel rings after a refresh covering that index.
    pub fn element(&self, index: u64) -> &RawElement {
        &self.cache[index as usize]
    }

    /// Binds the ring to a host-published context and takes the initial
    /// mirror snapshot (command and channel rings only).
    pub fn start(
        &mut self,
        ctx: RingContext,
        ctx_addr: u64,
        mem: &mut dyn HostMemory,
    ) -> Result<()> {
        if ctx.rlen == 0 || ctx.rlen % ELEMENT_LEN as u64 != 0 {
            return Err(MhiEpError::MalformedContext(
                "ring length is not a multiple of the element size",
            ));
        }
        let len = ctx.rlen / ELEMENT_LEN as u64;
        if len < 2 {
            return Err(MhiEpError::MalformedContext(
                "ring must hold at least two elements",
            ));
        }

        self.ctx = ctx;
        self.ctx_addr = ctx_addr;
        self.len = len;

        // Both cursors start at the host's read pointer, per the protocol
        // convention for a freshly started ring.
        let start = self.offset_of_addr(ctx.rp, "read pointer")?;
        self.rd_offset = start;
        self.wr_offset = start;

        if self.kind != RingKind::Event {
            if self.cache.len() != len as usize {
                self.cache = Vec::new();
                self.cache
                    .try_reserve_exact(len as usize)
                    .map_err(|_| MhiEpError::CacheAlloc)?;
                self.cache.resize(len as usize, [0u8; ELEMENT_LEN]);
            }
            let wp = self.offset_of_addr(ctx.wp, "write pointer")?;
            self.cache_refresh(mem, wp)?;
            self.wr_offset = wp;
        }

        self.state = RingState::Idle;
        self.started = true;
        debug!(
            kind = ?self.kind,
            id = self.id,
            len = self.len,
            start,
            "ring started"
        );
        Ok(())
    }

    /// Drops the context binding and local mirror.
    pub fn reset(&mut self) {
        self.state = RingState::Uninitialized;
        self.len = 0;
        self.rd_offset = 0;
        self.wr_offset = 0;
        self.ctx = RingContext::default();
        self.ctx_addr = 0;
        self.cache = Vec::new();
        self.started = false;
    }

    /// Converts a host bus address inside the ring array into an element
    /// index.
    fn offset_of_addr(&self, addr: u64, what: &'static str) -> Result<u64> {
        let rbase = self.ctx.rbase;
        let rlen = self.ctx.rlen;
        let rend = rbase.checked_add(rlen).ok_or(MhiEpError::MalformedContext(
            "ring array wraps the address space",
        ))?;
        if addr < rbase || addr >= rend {
            debug!(kind = ?self.kind, id = self.id, addr, what, "pointer outside the ring");
            return Err(MhiEpError::MalformedContext("pointer outside the ring"));
        }
        let rel = addr - rbase;
        if rel % ELEMENT_LEN as u64 != 0 {
            return Err(MhiEpError::MalformedContext(
                "pointer not aligned to the element size",
            ));
        }
        Ok(rel / ELEMENT_LEN as u64)
    }

    /// Reads the ring's doorbell register pair to learn the host's current
    /// write pointer, refreshes the local mirror over the newly published
    /// span, and stores the new write offset.
    pub fn update_write_offset(
        &mut self,
        regs: &Registers,
        mem: &mut dyn HostMemory,
    ) -> Result<()> {
        if !self.started {
            return Err(MhiEpError::RingNotStarted);
        }
        let db = match self.kind {
            RingKind::Command => regs.command_doorbell(),
            RingKind::Channel => regs.channel_doorbell(self.id),
            RingKind::Event => regs.event_doorbell(self.id),
        };
        // A doorbell that has never been written reads as zero; the cursor
        // stays where the context put it.
        if db == 0 {
            return Ok(());
        }
        let new_wr = self.offset_of_addr(db, "doorbell")?;
        self.cache_refresh(mem, new_wr)?;
        self.wr_offset = new_wr;
        Ok(())
    }

    /// Copies the span `[write_offset, new_wr)` (wrapping) of the
    /// host-resident element array into the local mirror. No-op for event
    /// rings and for an unchanged write offset.
    fn cache_refresh(&mut self, mem: &mut dyn HostMemory, new_wr: u64) -> Result<()> {
        if self.kind == RingKind::Event || new_wr == self.wr_offset {
            return Ok(());
        }

        // The mapping covers the whole ring array and is torn down when the
        // region guard drops, on success and error paths alike.
        let region = MappedRegion::map(mem, self.ctx.rbase, self.ctx.rlen)?;

        let start = self.wr_offset;
        if new_wr > start {
            copy_span(&region, &mut self.cache, start, new_wr - start)?;
        } else {
            // Wrapping refresh: tail segment then head segment, two
            // contiguous copies.
            copy_span(&region, &mut self.cache, start, self.len - start)?;
            copy_span(&region, &mut self.cache, 0, new_wr)?;
        }
        Ok(())
    }

    /// Advances the consumer cursor by one element.
    pub fn advance_read(&mut self) {
        self.rd_offset = (self.rd_offset + 1) % self.len;
    }

    /// Publishes the current read offset into the host-resident context
    /// record.
    pub fn publish_read_pointer(&mut self, mem: &mut dyn HostMemory) -> Result<()> {
        self.ctx.rp = self.element_addr(self.rd_offset);
        context::write_read_pointer(mem, self.ctx_addr, self.ctx.rp)
    }

    /// Appends one element to a ring the endpoint produces (the event
    /// rings): refresh the host's consumer position from the doorbell,
    /// check for a free slot, advance the producer cursor, publish the
    /// updated read pointer, then copy the element into the host-resident
    /// array.
    pub fn add_element(
        &mut self,
        regs: &Registers,
        mem: &mut dyn HostMemory,
        raw: &RawElement,
    ) -> Result<()> {
        self.update_write_offset(regs, mem)?;

        let used = (self.rd_offset + self.len - self.wr_offset) % self.len;
        if used >= self.len - 1 {
            return Err(MhiEpError::RingFull);
        }

        let write_index = self.rd_offset;
        self.advance_read();
        self.publish_read_pointer(mem)?;

        let mut region = MappedRegion::map(mem, self.element_addr(write_index), ELEMENT_LEN as u64)?;
        region.write(0, raw)?;
        Ok(())
    }
}

fn copy_span(
    region: &MappedRegion<'_>,
    cache: &mut [RawElement],
    start: u64,
    count: u64,
) -> Result<()> {
    for i in 0..count {
        let index = (start + i) as usize;
        region.read((start + i) * ELEMENT_LEN as u64, &mut cache[index])?;
    }
    Ok(())
}
