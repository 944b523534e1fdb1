//! Host-simulation harness shared by the integration tests.
//!
//! The harness plays the host's role: it lays out context arrays and rings
//! in a [`DenseMemory`] image, programs the controller's register file
//! through the MMIO surface, posts elements, and rings doorbells. Recording
//! sinks capture MSIs, client callbacks and pair notifications for
//! assertions.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use host_mem::{DenseMemory, HostMemory};
use mhi_ep::channel::ChannelState;
use mhi_ep::context::{RingContext, CONTEXT_LEN};
use mhi_ep::element::{RawElement, TransferDescriptor, ELEMENT_LEN};
use mhi_ep::regs;
use mhi_ep::{
    ChannelClient, ChannelPairListener, Direction, MhiEpConfig, MhiEpController, MhiState,
    MsiSignal, NoDelay, TransferResult,
};

pub const CMD_CTX_BASE: u64 = 0x1000;
pub const EV_CTX_BASE: u64 = 0x1100;
pub const CH_CTX_BASE: u64 = 0x1400;

pub const CMD_RING_BASE: u64 = 0x2000;
pub const CMD_RING_LEN: u64 = 16;

pub const EV_RING_LEN: u64 = 32;
pub const CH_RING_LEN: u64 = 32;

/// Payload buffers live above the rings.
pub const DATA_BASE: u64 = 0x40000;

pub fn ev_ring_base(ring: u16) -> u64 {
    0x4000 + 0x1000 * ring as u64
}

pub fn ch_ring_base(chan: u16) -> u64 {
    0x10000 + 0x1000 * chan as u64
}

/// MSI vector the harness programs for event ring `ring`.
pub fn msi_vector(ring: u16) -> u32 {
    0x20 + ring as u32
}

pub struct HostSim {
    pub mem: DenseMemory,
    cmd_wp: u64,
    ch_wp: Vec<u64>,
}

impl HostSim {
    /// Builds the host image: one command context, `num_event_rings` event
    /// contexts, `num_channels` channel contexts, all rings empty.
    pub fn new(num_channels: u16, num_event_rings: u16) -> Self {
        let mut mem = DenseMemory::new(0x80000).unwrap();

        let cmd_ctx = RingContext {
            rbase: CMD_RING_BASE,
            rlen: CMD_RING_LEN * ELEMENT_LEN as u64,
            rp: CMD_RING_BASE,
            wp: CMD_RING_BASE,
            ..Default::default()
        };
        mem.write_from(CMD_CTX_BASE, &cmd_ctx.encode()).unwrap();

        for ring in 0..num_event_rings {
            let ctx = RingContext {
                dword2: msi_vector(ring),
                rbase: ev_ring_base(ring),
                rlen: EV_RING_LEN * ELEMENT_LEN as u64,
                rp: ev_ring_base(ring),
                wp: ev_ring_base(ring),
                ..Default::default()
            };
            mem.write_from(EV_CTX_BASE + CONTEXT_LEN * ring as u64, &ctx.encode())
                .unwrap();
        }

        for chan in 0..num_channels {
            let mut ctx = RingContext {
                rbase: ch_ring_base(chan),
                rlen: CH_RING_LEN * ELEMENT_LEN as u64,
                rp: ch_ring_base(chan),
                wp: ch_ring_base(chan),
                ..Default::default()
            };
            ctx.set_channel_state(ChannelState::Enabled.raw());
            mem.write_from(CH_CTX_BASE + CONTEXT_LEN * chan as u64, &ctx.encode())
                .unwrap();
        }

        Self {
            mem,
            cmd_wp: 0,
            ch_wp: vec![0; num_channels as usize],
        }
    }

    /// Programs the three context array base pairs (high word, then low).
    pub fn program_bases(&self, c: &mut MhiEpController) {
        c.mmio_write(regs::CCABAP_HIGHER, (CH_CTX_BASE >> 32) as u32);
        c.mmio_write(regs::CCABAP_LOWER, CH_CTX_BASE as u32);
        c.mmio_write(regs::ECABAP_HIGHER, (EV_CTX_BASE >> 32) as u32);
        c.mmio_write(regs::ECABAP_LOWER, EV_CTX_BASE as u32);
        c.mmio_write(regs::CRCBAP_HIGHER, (CMD_CTX_BASE >> 32) as u32);
        c.mmio_write(regs::CRCBAP_LOWER, CMD_CTX_BASE as u32);
    }

    /// Host-side MHICTRL state write.
    pub fn publish_state(&self, c: &mut MhiEpController, state: MhiState) {
        c.mmio_write(
            regs::MHICTRL,
            (state.raw() as u32) << regs::MHICTRL_MHISTATE_SHIFT,
        );
    }

    pub fn request_reset(&self, c: &mut MhiEpController) {
        c.mmio_write(regs::MHICTRL, regs::MHICTRL_RESET_MASK);
    }

    /// Designates the completion event ring for a channel (written into the
    /// channel context before the start command).
    pub fn set_channel_event_ring(&mut self, chan: u16, ring: u16) {
        let addr = CH_CTX_BASE + CONTEXT_LEN * chan as u64 + 8;
        self.mem.write_u32_le(addr, ring as u32).unwrap();
    }

    /// Posts one element on the command ring and rings the command
    /// doorbell.
    pub fn post_command(&mut self, c: &mut MhiEpController, raw: RawElement) {
        let addr = CMD_RING_BASE + self.cmd_wp * ELEMENT_LEN as u64;
        self.mem.write_from(addr, &raw).unwrap();
        self.cmd_wp = (self.cmd_wp + 1) % CMD_RING_LEN;

        let wp = CMD_RING_BASE + self.cmd_wp * ELEMENT_LEN as u64;
        self.mem.write_u64_le(CMD_CTX_BASE + 36, wp).unwrap();
        c.mmio_write(regs::CRDB_HIGHER, (wp >> 32) as u32);
        c.mmio_write(regs::CRDB_LOWER, wp as u32);
    }

    /// Posts a transfer descriptor on a channel ring without ringing the
    /// doorbell register.
    pub fn post_transfer_quiet(&mut self, chan: u16, td: TransferDescriptor) -> u64 {
        let index = self.ch_wp[chan as usize];
        let addr = ch_ring_base(chan) + index * ELEMENT_LEN as u64;
        self.mem.write_from(addr, &td.encode()).unwrap();
        self.ch_wp[chan as usize] = (index + 1) % CH_RING_LEN;

        let wp = ch_ring_base(chan) + self.ch_wp[chan as usize] * ELEMENT_LEN as u64;
        self.mem
            .write_u64_le(CH_CTX_BASE + CONTEXT_LEN * chan as u64 + 36, wp)
            .unwrap();
        addr
    }

    /// Writes the channel doorbell register with the ring's current write
    /// pointer. Latches the doorbell interrupt; processing happens on the
    /// next `handle_irq`.
    pub fn ring_channel_doorbell(&self, c: &mut MhiEpController, chan: u16) {
        let wp = ch_ring_base(chan) + self.ch_wp[chan as usize] * ELEMENT_LEN as u64;
        c.mmio_write(regs::chdb_higher(chan), (wp >> 32) as u32);
        c.mmio_write(regs::chdb_lower(chan), wp as u32);
    }

    /// Posts a transfer descriptor and rings the doorbell.
    pub fn post_transfer(
        &mut self,
        c: &mut MhiEpController,
        chan: u16,
        td: TransferDescriptor,
    ) -> u64 {
        let addr = self.post_transfer_quiet(chan, td);
        self.ring_channel_doorbell(c, chan);
        addr
    }

    /// Number of events the endpoint has produced on `ring`, derived from
    /// the read pointer it published into the event context.
    pub fn event_count(&mut self, ring: u16) -> u64 {
        let ctx_addr = EV_CTX_BASE + CONTEXT_LEN * ring as u64;
        let rp = self.mem.read_u64_le(ctx_addr + 28).unwrap();
        if rp == 0 {
            return 0;
        }
        (rp - ev_ring_base(ring)) / ELEMENT_LEN as u64
    }

    pub fn read_event(&mut self, ring: u16, index: u64) -> RawElement {
        let mut raw = [0u8; ELEMENT_LEN];
        self.mem
            .read_into(ev_ring_base(ring) + index * ELEMENT_LEN as u64, &mut raw)
            .unwrap();
        raw
    }

    /// Reads back the state byte the endpoint published into a channel
    /// context.
    pub fn channel_ctx_state(&mut self, chan: u16) -> u8 {
        let ctx_addr = CH_CTX_BASE + CONTEXT_LEN * chan as u64;
        (self.mem.read_u32_le(ctx_addr).unwrap() & 0xff) as u8
    }
}

// ---- recording sinks ----

pub struct SharedMsiLog(pub Arc<Mutex<Vec<u32>>>);

impl MsiSignal for SharedMsiLog {
    fn raise(&mut self, vector: u32) {
        self.0.lock().unwrap().push(vector);
    }
}

pub fn msi_recorder() -> (Box<SharedMsiLog>, Arc<Mutex<Vec<u32>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    (Box::new(SharedMsiLog(log.clone())), log)
}

#[derive(Debug)]
pub struct ClientRecord {
    pub chan: u16,
    pub direction: Direction,
    pub buffer: Vec<u8>,
    pub bytes: usize,
    pub code: mhi_ep::element::CompletionCode,
}

pub struct RecordingClient(pub Arc<Mutex<Vec<ClientRecord>>>);

impl ChannelClient for RecordingClient {
    fn transfer_complete(&mut self, chan: u16, result: TransferResult) {
        self.0.lock().unwrap().push(ClientRecord {
            chan,
            direction: result.direction,
            buffer: result.buffer,
            bytes: result.bytes_transferred,
            code: result.code,
        });
    }
}

pub fn client_recorder() -> (Box<RecordingClient>, Arc<Mutex<Vec<ClientRecord>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    (Box::new(RecordingClient(log.clone())), log)
}

pub struct PairLog(pub Arc<Mutex<Vec<(u16, u16)>>>);

impl ChannelPairListener for PairLog {
    fn pair_started(&mut self, host_to_dev: u16, dev_to_host: u16) {
        self.0.lock().unwrap().push((host_to_dev, dev_to_host));
    }
}

pub fn pair_recorder() -> (Box<PairLog>, Arc<Mutex<Vec<(u16, u16)>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    (Box::new(PairLog(log.clone())), log)
}

/// Builds a controller wired to recording sinks and a host image, then
/// walks it to M0: link up, ready published, host requests M0, interrupt
/// serviced.
pub fn bring_up(
    num_channels: u16,
    num_event_rings: u16,
) -> (MhiEpController, HostSim, Arc<Mutex<Vec<u32>>>) {
    let (msi, raised) = msi_recorder();
    let mut c = MhiEpController::new(
        MhiEpConfig {
            num_channels,
            num_event_rings,
            num_hw_event_rings: 0,
        },
        msi,
        Box::new(NoDelay),
    )
    .unwrap();
    let mut sim = HostSim::new(num_channels, num_event_rings);

    sim.program_bases(&mut c);
    c.set_link_state(mhi_ep::LinkState::D0);
    c.set_ready().unwrap();
    sim.publish_state(&mut c, MhiState::M0);
    c.handle_irq(&mut sim.mem).unwrap();
    assert_eq!(c.mhi_state(), MhiState::M0);

    (c, sim, raised)
}

/// Starts a channel pair by posting Start-Channel commands for both ids.
pub fn start_channel_pair(
    c: &mut MhiEpController,
    sim: &mut HostSim,
    even: u16,
    event_ring: u16,
) {
    use mhi_ep::element::{encode_command, ElementType};
    sim.set_channel_event_ring(even, event_ring);
    sim.set_channel_event_ring(even + 1, event_ring);
    sim.post_command(c, encode_command(ElementType::StartChannel, even));
    sim.post_command(c, encode_command(ElementType::StartChannel, even + 1));
    c.handle_irq(&mut sim.mem).unwrap();
}
