//! The endpoint controller: registers, rings, channels and the deferred
//! processing contexts that tie them together.
//!
//! The host drives the controller from the outside through
//! [`MhiEpController::mmio_write`]; doorbell and MHICTRL writes latch
//! per-class interrupt status bits, and the platform then invokes
//! [`MhiEpController::handle_irq`] for the endpoint's single interrupt
//! line. `handle_irq` scans the status bitmaps, feeds host state changes to
//! the power manager, queues rings with pending doorbells, and drains the
//! queue — command ring work always ahead of channel work within one
//! doorbell cycle.
//!
//! Lock discipline: each event ring has its own lock held across
//! refresh → append → read-pointer publish; the pending-ring queue and the
//! power manager have theirs; per-channel in-flight bookkeeping sits behind
//! the channel's lock. The read pointer is written back to host memory
//! before the MSI fires, so the host never observes an interrupt ahead of
//! the data it announces.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use host_mem::{HostMemory, MappedRegion};
use tracing::{debug, info, warn};

use crate::channel::{
    Channel, ChannelClient, ChannelState, Direction, InflightDescriptor, TransferResult,
};
use crate::context::{self, ContextArrays};
use crate::element::{
    self, CommandCompletionEvent, CompletionCode, ElementType, RawElement, TransferCompletionEvent,
    TransferDescriptor,
};
use crate::power::{ExecEnv, MhiState, LinkState, PowerEvent, PowerManager};
use crate::regs::{self, Registers};
use crate::ring::{Ring, RingKind, RingState};
use crate::{ChannelPairListener, Delay, MhiEpError, MsiSignal, Result};

/// Bounded wait for the host to publish M0 after bring-up.
const M0_WAIT_RETRIES: u32 = 20;
const M0_WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// Settle delay between the M0 event and the execution-environment
/// announcement on a cold start.
const EE_SETTLE_DELAY: Duration = Duration::from_millis(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PendingWork {
    Command,
    Channel(u16),
}

#[derive(Clone, Copy, Debug)]
pub struct MhiEpConfig {
    /// Number of channels; channels pair even/odd, so this must be even.
    pub num_channels: u16,
    pub num_event_rings: u16,
    /// Hardware-accelerated event rings advertised in MHICFG.
    pub num_hw_event_rings: u16,
}

impl Default for MhiEpConfig {
    fn default() -> Self {
        Self {
            num_channels: 16,
            num_event_rings: 4,
            num_hw_event_rings: 0,
        }
    }
}

impl MhiEpConfig {
    fn validate(&self) -> Result<()> {
        if self.num_channels == 0 || self.num_channels % 2 != 0 {
            return Err(MhiEpError::Config("channel count must be even and nonzero"));
        }
        if self.num_channels > regs::MAX_CHANNELS {
            return Err(MhiEpError::Config("too many channels"));
        }
        if self.num_event_rings == 0 || self.num_event_rings > regs::MAX_EVENT_RINGS {
            return Err(MhiEpError::Config("event ring count out of range"));
        }
        if self.num_hw_event_rings > self.num_event_rings {
            return Err(MhiEpError::Config(
                "hardware event rings exceed the event ring count",
            ));
        }
        Ok(())
    }
}

pub struct MhiEpController {
    cfg: MhiEpConfig,
    regs: Registers,
    command_ring: Ring,
    event_rings: Vec<Mutex<Ring>>,
    channels: Vec<Mutex<Channel>>,
    pending: Mutex<VecDeque<PendingWork>>,
    power: Mutex<PowerManager>,
    /// Context array bases, captured once from the register file after the
    /// host reaches M0.
    contexts: Option<ContextArrays>,
    msi: Box<dyn MsiSignal>,
    delay: Box<dyn Delay>,
    pair_listener: Option<Box<dyn ChannelPairListener>>,
}

impl MhiEpController {
    pub fn new(cfg: MhiEpConfig, msi: Box<dyn MsiSignal>, delay: Box<dyn Delay>) -> Result<Self> {
        cfg.validate()?;

        let mut registers = Registers::new();
        registers.write(regs::MHIREGLEN, regs::MHI_REG_SIZE as u32);
        registers.write(regs::MHIVER, regs::MHI_VERSION);
        registers.set_event_ring_counts(cfg.num_event_rings, cfg.num_hw_event_rings);
        registers.write(regs::CHDBOFF, regs::CHDB_BASE as u32);
        registers.write(regs::ERDBOFF, regs::ERDB_BASE as u32);
        registers.write(regs::BHIOFF, regs::BHI_BASE as u32);
        registers.set_exec_env(ExecEnv::Pbl.raw());

        Ok(Self {
            cfg,
            regs: registers,
            command_ring: Ring::new(RingKind::Command, 0),
            event_rings: (0..cfg.num_event_rings)
                .map(|i| Mutex::new(Ring::new(RingKind::Event, i)))
                .collect(),
            channels: (0..cfg.num_channels)
                .map(|i| Mutex::new(Channel::new(i)))
                .collect(),
            pending: Mutex::new(VecDeque::new()),
            power: Mutex::new(PowerManager::new()),
            contexts: None,
            msi,
            delay,
            pair_listener: None,
        })
    }

    pub fn config(&self) -> &MhiEpConfig {
        &self.cfg
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    pub fn mhi_state(&self) -> MhiState {
        lock(&self.power).state()
    }

    /// Platform hook: the physical link's power state (link training, D3
    /// entry/exit) is managed outside the transport.
    pub fn set_link_state(&mut self, link: LinkState) {
        lock(&self.power).set_link_state(link);
    }

    pub fn link_state(&self) -> LinkState {
        lock(&self.power).link_state()
    }

    pub fn channel_state(&self, chan: u16) -> Result<ChannelState> {
        let slot = self
            .channels
            .get(chan as usize)
            .ok_or(MhiEpError::InvalidChannel(chan))?;
        Ok(lock(slot).state())
    }

    pub fn set_pair_listener(&mut self, listener: Box<dyn ChannelPairListener>) {
        self.pair_listener = Some(listener);
    }

    /// Registers the client-facing consumer for one channel. The requested
    /// direction must match the channel's even/odd pairing.
    pub fn register_channel_client(
        &mut self,
        chan: u16,
        direction: Direction,
        client: Box<dyn ChannelClient>,
    ) -> Result<()> {
        let slot = self
            .channels
            .get(chan as usize)
            .ok_or(MhiEpError::InvalidChannel(chan))?;
        let mut ch = lock(slot);
        if ch.direction() != direction {
            return Err(MhiEpError::DirectionMismatch {
                channel: chan,
                requested: direction,
            });
        }
        ch.client = Some(client);
        Ok(())
    }

    // ---- host-facing MMIO surface ----

    pub fn mmio_read(&self, offset: u64) -> u32 {
        self.regs.read(offset)
    }

    /// A host write into the control register block. Doorbell and MHICTRL
    /// writes latch interrupt status; processing is deferred to
    /// [`Self::handle_irq`].
    pub fn mmio_write(&mut self, offset: u64, value: u32) {
        self.regs.write(offset, value);
        match offset {
            regs::MHICTRL => self.regs.latch_ctrl_interrupt(regs::CTRL_INT_MHICTRL),
            regs::CRDB_LOWER => self.regs.latch_ctrl_interrupt(regs::CTRL_INT_CRDB),
            o if (regs::CHDB_BASE..regs::ERDB_BASE).contains(&o) => {
                let rel = o - regs::CHDB_BASE;
                if rel % 8 == 0 {
                    self.regs.latch_channel_doorbell((rel / 8) as u16);
                }
            }
            o if (regs::ERDB_BASE..regs::BHI_BASE).contains(&o) => {
                let rel = o - regs::ERDB_BASE;
                if rel % 8 == 0 {
                    self.regs.latch_event_doorbell((rel / 8) as u16);
                }
            }
            _ => {}
        }
    }

    /// Level of the endpoint's single interrupt line: any latched and
    /// unmasked bit in any interrupt class.
    pub fn irq_asserted(&self) -> bool {
        if self.regs.pending_ctrl_interrupts() != 0 {
            return true;
        }
        (0..regs::DOORBELL_GROUPS).any(|g| {
            self.regs.pending_channel_doorbells(g) != 0
                || self.regs.pending_event_doorbells(g) != 0
        })
    }

    // ---- lifecycle ----

    /// Brings the endpoint up: link to D0, control interrupts armed, Ready
    /// published, then a bounded wait for the host to request M0.
    pub fn power_up(&mut self, mem: &mut dyn HostMemory) -> Result<()> {
        lock(&self.power).set_link_state(LinkState::D0);
        self.regs.set_exec_env(ExecEnv::Amss.raw());
        self.set_ready()?;

        for _ in 0..M0_WAIT_RETRIES {
            let (state_raw, _) = self.regs.host_requested_state();
            if MhiState::from_raw(state_raw) == Some(MhiState::M0) {
                lock(&self.power).enqueue(PowerEvent::EnterM0);
                self.regs.clear_ctrl_interrupt(regs::CTRL_INT_MHICTRL);
                return self.drain_power_events(mem);
            }
            self.delay.sleep(M0_WAIT_INTERVAL);
        }
        warn!("host did not publish M0 during power-up");
        Err(MhiEpError::PowerUpTimeout)
    }

    /// Publishes the Ready state and arms the control interrupts. The host
    /// must have published Reset with the ready flag still clear; anything
    /// else is a configuration error.
    pub fn set_ready(&mut self) -> Result<()> {
        let (state_raw, _) = self.regs.host_requested_state();
        if MhiState::from_raw(state_raw) != Some(MhiState::Reset) || self.regs.ready_flag() {
            return Err(MhiEpError::NotReset);
        }
        lock(&self.power).set_ready();
        self.regs.enable_ctrl_interrupts();
        self.regs.publish_state(MhiState::Ready.raw());
        self.regs.set_ready_flag(true);
        info!("endpoint ready");
        Ok(())
    }

    /// Drops the link and every ring/channel back to the unconfigured
    /// baseline.
    pub fn power_down(&mut self) {
        self.regs.disable_ctrl_interrupts();
        self.teardown_transfer_state();
        let mut power = lock(&self.power);
        power.reset();
        power.set_link_state(LinkState::Disabled);
        drop(power);
        self.regs.publish_state(MhiState::Reset.raw());
        self.regs.set_ready_flag(false);
        info!("endpoint powered down");
    }

    /// Publishes the system-error state to the host. There is no
    /// resolution logic behind this; it only makes the condition visible.
    pub fn notify_syserr(&mut self, mem: &mut dyn HostMemory) {
        lock(&self.power).set_syserr();
        self.regs.set_syserr_flag(true);
        self.regs.publish_state(MhiState::SysErr.raw());
        if let Err(err) = self.send_state_change(mem, MhiState::SysErr) {
            warn!(%err, "could not post the syserr state-change event");
        }
    }

    /// Core-initiated wake request towards a dozing host.
    pub fn request_host_wake(&mut self) -> Result<()> {
        lock(&self.power).transition(PowerEvent::Wake)?;
        let vector = {
            let ring = lock(&self.event_rings[0]);
            if ring.is_started() {
                ring.context().msi_vector()
            } else {
                self.regs.bhi_interrupt_vector()
            }
        };
        self.msi.raise(vector);
        Ok(())
    }

    // ---- interrupt entry and deferred processing ----

    /// The endpoint's interrupt handler plus its deferred contexts, run to
    /// completion: control/doorbell scan, then the pending-ring drain.
    pub fn handle_irq(&mut self, mem: &mut dyn HostMemory) -> Result<()> {
        let ctrl = self.regs.pending_ctrl_interrupts();
        if ctrl & regs::CTRL_INT_MHICTRL != 0 {
            self.regs.clear_ctrl_interrupt(regs::CTRL_INT_MHICTRL);
            self.observe_host_control(mem)?;
        }
        if ctrl & regs::CTRL_INT_CRDB != 0 {
            self.regs.clear_ctrl_interrupt(regs::CTRL_INT_CRDB);
            if self.command_ring.is_started() {
                self.command_ring.set_state(RingState::Pending);
                lock(&self.pending).push_back(PendingWork::Command);
            } else {
                warn!("command doorbell before the command ring was started");
            }
        }

        for group in 0..regs::DOORBELL_GROUPS {
            let bits = self.regs.pending_channel_doorbells(group);
            if bits == 0 {
                continue;
            }
            self.regs.clear_channel_doorbells(group, bits);
            for bit in 0..regs::DOORBELLS_PER_GROUP {
                if bits & (1 << bit) != 0 {
                    self.queue_channel_work(group * regs::DOORBELLS_PER_GROUP + bit);
                }
            }
        }

        self.process_pending(mem)
    }

    fn queue_channel_work(&mut self, chan: u16) {
        let Some(slot) = self.channels.get(chan as usize) else {
            warn!(chan, "doorbell for a channel that does not exist");
            return;
        };
        let mut ch = lock(slot);
        if !ch.ring.is_started() {
            warn!(chan, "doorbell for a channel that was never started");
            return;
        }
        if ch.ring.state() == RingState::Pending {
            // Already queued; the drain will pick up the new doorbell value.
            return;
        }
        ch.ring.set_state(RingState::Pending);
        drop(ch);
        lock(&self.pending).push_back(PendingWork::Channel(chan));
    }

    /// Drains the pending-ring queue in FIFO submission order.
    pub fn process_pending(&mut self, mem: &mut dyn HostMemory) -> Result<()> {
        loop {
            let work = lock(&self.pending).pop_front();
            let Some(work) = work else {
                return Ok(());
            };
            match work {
                PendingWork::Command => self.process_command_ring(mem)?,
                PendingWork::Channel(chan) => self.process_channel_ring(mem, chan)?,
            }
        }
    }

    // ---- host control / power flow ----

    fn observe_host_control(&mut self, mem: &mut dyn HostMemory) -> Result<()> {
        let (state_raw, reset) = self.regs.host_requested_state();
        if reset {
            self.handle_host_reset();
            return Ok(());
        }
        match MhiState::from_raw(state_raw) {
            Some(MhiState::M0) => lock(&self.power).enqueue(PowerEvent::EnterM0),
            Some(MhiState::M3) => lock(&self.power).enqueue(PowerEvent::EnterM3),
            Some(MhiState::Reset) => {}
            _ => warn!(state = state_raw, "host requested an unsupported state"),
        }
        self.drain_power_events(mem)
    }

    /// Applies queued power events one at a time, in arrival order. An
    /// illegal transition has already been logged and rejected by the state
    /// machine; it does not abort the drain.
    fn drain_power_events(&mut self, mem: &mut dyn HostMemory) -> Result<()> {
        loop {
            let event = lock(&self.power).pop_event();
            let Some(event) = event else {
                return Ok(());
            };
            let result = match event {
                PowerEvent::EnterM0 => self.enter_m0(mem),
                PowerEvent::EnterM3 => self.enter_m3(mem),
                PowerEvent::Wake => lock(&self.power).transition(PowerEvent::Wake).map(|_| ()),
            };
            match result {
                Err(MhiEpError::IllegalTransition { .. }) => continue,
                other => other?,
            }
        }
    }

    fn enter_m0(&mut self, mem: &mut dyn HostMemory) -> Result<()> {
        let prev = lock(&self.power).transition(PowerEvent::EnterM0)?;
        self.regs.publish_state(MhiState::M0.raw());

        if self.contexts.is_none() {
            // First M0: capture the context array bases the host programmed
            // and bring the command ring up from the first command context.
            let arrays = ContextArrays::capture(&self.regs)?;
            let ctx = context::read_context(mem, arrays.command_base, 0)?;
            self.command_ring
                .start(ctx, context::context_addr(arrays.command_base, 0), mem)?;
            self.contexts = Some(arrays);
        }

        if prev == MhiState::M3 {
            self.resume_channels();
        }

        self.send_state_change(mem, MhiState::M0)?;

        if prev == MhiState::Ready {
            // Cold start: give the host a moment before announcing the
            // active firmware environment.
            self.delay.sleep(EE_SETTLE_DELAY);
            self.send_ee_change(mem, ExecEnv::Amss)?;
        }
        debug!(?prev, "entered M0");
        Ok(())
    }

    fn enter_m3(&mut self, mem: &mut dyn HostMemory) -> Result<()> {
        lock(&self.power).transition(PowerEvent::EnterM3)?;
        self.regs.publish_state(MhiState::M3.raw());
        for slot in &self.channels {
            let mut ch = lock(slot);
            if ch.state() == ChannelState::Running {
                ch.state = ChannelState::Suspended;
            }
        }
        self.send_state_change(mem, MhiState::M3)
    }

    fn resume_channels(&mut self) {
        // TODO: rings that still hold unconsumed elements need a re-queue
        // here so suspended transfers make progress without a fresh
        // doorbell from the host.
        for slot in &self.channels {
            let mut ch = lock(slot);
            if ch.state() == ChannelState::Suspended {
                ch.state = ChannelState::Running;
            }
        }
    }

    fn handle_host_reset(&mut self) {
        info!("host requested reset");
        self.regs.clear_host_reset_request();
        self.teardown_transfer_state();
        let mut power = lock(&self.power);
        power.reset();
        power.set_ready();
        drop(power);
        self.regs.set_syserr_flag(false);
        self.regs.publish_state(MhiState::Ready.raw());
        // The ready flag stays set: the endpoint is immediately ready for a
        // fresh bring-up cycle.
    }

    fn teardown_transfer_state(&mut self) {
        self.command_ring.reset();
        for ring in &self.event_rings {
            lock(ring).reset();
        }
        for slot in &self.channels {
            lock(slot).reset();
        }
        for chan in 0..self.cfg.num_channels {
            self.regs.disable_channel_doorbell(chan);
        }
        lock(&self.pending).clear();
        self.contexts = None;
    }

    // ---- command processing ----

    fn process_command_ring(&mut self, mem: &mut dyn HostMemory) -> Result<()> {
        self.command_ring.update_write_offset(&self.regs, mem)?;
        while !self.command_ring.is_empty() {
            let index = self.command_ring.read_offset();
            let raw = *self.command_ring.element(index);
            let addr = self.command_ring.element_addr(index);
            // A failing element aborts the drain without advancing past
            // itself; the work stays pending for a retry.
            self.handle_command(mem, &raw, addr)?;
            self.command_ring.advance_read();
            self.command_ring.publish_read_pointer(mem)?;
        }
        self.command_ring.set_state(RingState::Idle);
        Ok(())
    }

    fn handle_command(
        &mut self,
        mem: &mut dyn HostMemory,
        raw: &RawElement,
        addr: u64,
    ) -> Result<()> {
        match element::type_tag(raw) {
            ElementType::StartChannel => {
                let chan = element::channel_id(raw);
                match self.start_channel(mem, chan) {
                    Ok((even, odd)) => {
                        self.send_command_completion(mem, addr, CompletionCode::Success)?;
                        if let Some(listener) = self.pair_listener.as_mut() {
                            listener.pair_started(even, odd);
                        }
                    }
                    Err(err) => {
                        warn!(chan, %err, "start-channel failed");
                        self.send_command_completion(mem, addr, CompletionCode::Undefined)?;
                    }
                }
            }
            // Recognized opcodes with no implemented handling.
            // TODO: stop/reset need the host-visible channel-quiesce
            // contract pinned down before they can be acted on.
            ElementType::Noop | ElementType::ResetChannel | ElementType::StopChannel => {
                debug!(ty = ?element::type_tag(raw), "command element left unhandled");
            }
            other => warn!(?other, "unexpected element type on the command ring"),
        }
        Ok(())
    }

    fn start_channel(&mut self, mem: &mut dyn HostMemory, chan: u16) -> Result<(u16, u16)> {
        let arrays = self.contexts.ok_or(MhiEpError::CachesNotReady)?;
        if chan as usize >= self.channels.len() {
            return Err(MhiEpError::InvalidChannel(chan));
        }

        let ctx_addr = context::context_addr(arrays.channel_base, chan);
        let ctx = context::read_context(mem, arrays.channel_base, chan)?;
        let event_ring = ctx.error_event_ring();
        if event_ring as usize >= self.event_rings.len() {
            return Err(MhiEpError::InvalidEventRing(event_ring));
        }

        {
            let mut ch = lock(&self.channels[chan as usize]);
            ch.ring.start(ctx, ctx_addr, mem)?;
            ch.state = ChannelState::Enabled;
        }
        self.regs.enable_channel_doorbell(chan);
        self.ensure_event_ring_started(mem, event_ring)?;

        // Publish the running state into the host-resident channel context
        // and mirror it locally.
        context::write_channel_state(mem, ctx_addr, ChannelState::Running.raw())?;
        {
            let mut ch = lock(&self.channels[chan as usize]);
            ch.ring
                .context_mut()
                .set_channel_state(ChannelState::Running.raw());
            ch.state = ChannelState::Running;
        }
        info!(chan, event_ring, "channel started");
        Ok((chan & !1, chan | 1))
    }

    fn ensure_event_ring_started(&mut self, mem: &mut dyn HostMemory, index: u16) -> Result<()> {
        let arrays = self.contexts.ok_or(MhiEpError::CachesNotReady)?;
        let slot = self
            .event_rings
            .get(index as usize)
            .ok_or(MhiEpError::InvalidEventRing(index))?;
        let mut ring = lock(slot);
        if ring.is_started() {
            return Ok(());
        }
        let ctx = context::read_context(mem, arrays.event_base, index)?;
        ring.start(ctx, context::context_addr(arrays.event_base, index), mem)
    }

    // ---- event submission ----

    fn send_state_change(&mut self, mem: &mut dyn HostMemory, state: MhiState) -> Result<()> {
        submit_event(
            &self.event_rings,
            self.contexts,
            &self.regs,
            &mut *self.msi,
            mem,
            0,
            &element::encode_state_change(state.raw()),
            true,
        )
    }

    fn send_ee_change(&mut self, mem: &mut dyn HostMemory, ee: ExecEnv) -> Result<()> {
        submit_event(
            &self.event_rings,
            self.contexts,
            &self.regs,
            &mut *self.msi,
            mem,
            0,
            &element::encode_ee_change(ee.raw()),
            true,
        )
    }

    fn send_command_completion(
        &mut self,
        mem: &mut dyn HostMemory,
        cmd_addr: u64,
        code: CompletionCode,
    ) -> Result<()> {
        let raw = CommandCompletionEvent { cmd_addr, code }.encode();
        submit_event(
            &self.event_rings,
            self.contexts,
            &self.regs,
            &mut *self.msi,
            mem,
            0,
            &raw,
            true,
        )
    }

    // ---- channel transfer processing ----

    fn process_channel_ring(&mut self, mem: &mut dyn HostMemory, chan: u16) -> Result<()> {
        let Some(slot) = self.channels.get(chan as usize) else {
            warn!(chan, "pending work for a channel that does not exist");
            return Ok(());
        };
        let direction = lock(slot).direction();
        match direction {
            Direction::HostToDevice => self.drain_upload_ring(mem, chan),
            Direction::DeviceToHost => self.notify_download_capacity(mem, chan),
        }
    }

    /// Drains a host → device channel ring: one descriptor per iteration,
    /// payload copied out of host memory, completion emitted per the
    /// descriptor's flags, then the client callback.
    fn drain_upload_ring(&mut self, mem: &mut dyn HostMemory, chan: u16) -> Result<()> {
        let Self {
            regs,
            channels,
            event_rings,
            contexts,
            msi,
            ..
        } = self;
        let mut ch = lock(&channels[chan as usize]);
        // Back to Idle as soon as the drain owns the ring: a doorbell that
        // arrives from here on must queue the ring again.
        ch.ring.set_state(RingState::Idle);
        if !ch.is_running() {
            warn!(chan, state = ?ch.state(), "doorbell for a channel that is not running");
            return Ok(());
        }

        ch.ring.update_write_offset(regs, mem)?;
        while !ch.ring.is_empty() {
            let index = ch.ring.read_offset();
            let raw = *ch.ring.element(index);
            if element::type_tag(&raw) != ElementType::Transfer {
                warn!(chan, index, "skipping a non-transfer element on a channel ring");
                ch.ring.advance_read();
                ch.ring.publish_read_pointer(mem)?;
                continue;
            }
            let td = TransferDescriptor::parse(&raw);
            let desc_addr = ch.ring.element_addr(index);

            let mut buffer = vec![0u8; td.len as usize];
            {
                let region = MappedRegion::map(mem, td.ptr, td.len as u64)?;
                region.read(0, &mut buffer)?;
            }

            ch.ring.advance_read();
            ch.ring.publish_read_pointer(mem)?;
            ch.inflight = None;

            if let Some((code, signal)) = completion_event_for(&td) {
                let event = TransferCompletionEvent {
                    desc_addr,
                    chan,
                    len: td.len,
                    code,
                }
                .encode();
                submit_event(
                    event_rings,
                    *contexts,
                    regs,
                    &mut **msi,
                    mem,
                    ch.ring.context().error_event_ring(),
                    &event,
                    signal,
                )?;
            }

            let bytes = buffer.len();
            if let Some(client) = ch.client.as_mut() {
                client.transfer_complete(
                    chan,
                    TransferResult {
                        direction: Direction::HostToDevice,
                        buffer,
                        bytes_transferred: bytes,
                        code: if td.chain {
                            CompletionCode::Eob
                        } else {
                            CompletionCode::Eot
                        },
                    },
                );
            }
        }
        Ok(())
    }

    /// A doorbell on a device → host channel announces fresh descriptors;
    /// the client is told so it can push queued payloads.
    fn notify_download_capacity(&mut self, mem: &mut dyn HostMemory, chan: u16) -> Result<()> {
        let Self { regs, channels, .. } = self;
        let mut ch = lock(&channels[chan as usize]);
        ch.ring.set_state(RingState::Idle);
        if !ch.is_running() {
            return Ok(());
        }
        ch.ring.update_write_offset(regs, mem)?;
        if let Some(client) = ch.client.as_mut() {
            client.transfer_complete(
                chan,
                TransferResult {
                    direction: Direction::DeviceToHost,
                    buffer: Vec::new(),
                    bytes_transferred: 0,
                    code: CompletionCode::Success,
                },
            );
        }
        Ok(())
    }

    /// Client pull path on a host → device channel: fills `buf` from the
    /// posted descriptors, keeping a partially consumed descriptor in
    /// flight across calls. Returns the byte count, or
    /// [`MhiEpError::NothingAvailable`] when neither the ring nor an
    /// in-flight descriptor has data.
    pub fn read_channel(
        &mut self,
        mem: &mut dyn HostMemory,
        chan: u16,
        buf: &mut [u8],
    ) -> Result<usize> {
        if chan as usize >= self.channels.len() {
            return Err(MhiEpError::InvalidChannel(chan));
        }
        let Self {
            regs,
            channels,
            event_rings,
            contexts,
            msi,
            ..
        } = self;
        let mut ch = lock(&channels[chan as usize]);
        if ch.direction() != Direction::HostToDevice {
            return Err(MhiEpError::DirectionMismatch {
                channel: chan,
                requested: Direction::HostToDevice,
            });
        }
        if !ch.is_running() {
            return Err(MhiEpError::ChannelNotRunning(chan));
        }

        ch.ring.update_write_offset(regs, mem)?;

        let mut filled = 0usize;
        while filled < buf.len() {
            let inflight = match ch.inflight {
                Some(inflight) => inflight,
                None => {
                    if ch.ring.is_empty() {
                        break;
                    }
                    let index = ch.ring.read_offset();
                    let raw = *ch.ring.element(index);
                    if element::type_tag(&raw) != ElementType::Transfer {
                        warn!(chan, index, "skipping a non-transfer element on a channel ring");
                        ch.ring.advance_read();
                        ch.ring.publish_read_pointer(mem)?;
                        continue;
                    }
                    let td = TransferDescriptor::parse(&raw);
                    let inflight = InflightDescriptor {
                        index,
                        descriptor: td,
                        remaining: td.len as usize,
                    };
                    ch.inflight = Some(inflight);
                    inflight
                }
            };

            let take = inflight.remaining.min(buf.len() - filled);
            if take > 0 {
                let consumed = inflight.descriptor.len as usize - inflight.remaining;
                let region =
                    MappedRegion::map(mem, inflight.descriptor.ptr + consumed as u64, take as u64)?;
                region.read(0, &mut buf[filled..filled + take])?;
                filled += take;
            }

            let remaining = inflight.remaining - take;
            if remaining > 0 {
                if let Some(inflight) = ch.inflight.as_mut() {
                    inflight.remaining = remaining;
                }
                continue;
            }

            // Descriptor fully consumed: retire it and emit the completion
            // its flags ask for.
            ch.inflight = None;
            ch.ring.advance_read();
            ch.ring.publish_read_pointer(mem)?;

            let td = inflight.descriptor;
            if let Some((code, signal)) = completion_event_for(&td) {
                let event = TransferCompletionEvent {
                    desc_addr: ch.ring.element_addr(inflight.index),
                    chan,
                    len: td.len,
                    code,
                }
                .encode();
                submit_event(
                    event_rings,
                    *contexts,
                    regs,
                    &mut **msi,
                    mem,
                    ch.ring.context().error_event_ring(),
                    &event,
                    signal,
                )?;
            }
        }

        if filled == 0 {
            return Err(MhiEpError::NothingAvailable);
        }
        Ok(filled)
    }

    /// Client push path on a device → host channel: writes `payload` into
    /// the descriptor at the ring's read offset, retires it, and notifies
    /// the host. Fails without writing anything when the payload exceeds
    /// the descriptor's advertised capacity.
    pub fn queue_outbound(
        &mut self,
        mem: &mut dyn HostMemory,
        chan: u16,
        payload: &[u8],
    ) -> Result<usize> {
        if chan as usize >= self.channels.len() {
            return Err(MhiEpError::InvalidChannel(chan));
        }
        let Self {
            regs,
            channels,
            event_rings,
            contexts,
            msi,
            ..
        } = self;
        let mut ch = lock(&channels[chan as usize]);
        if ch.direction() != Direction::DeviceToHost {
            return Err(MhiEpError::DirectionMismatch {
                channel: chan,
                requested: Direction::DeviceToHost,
            });
        }
        if !ch.is_running() {
            return Err(MhiEpError::ChannelNotRunning(chan));
        }

        ch.ring.update_write_offset(regs, mem)?;
        if ch.ring.is_empty() {
            return Err(MhiEpError::NothingAvailable);
        }

        let index = ch.ring.read_offset();
        let raw = *ch.ring.element(index);
        if element::type_tag(&raw) != ElementType::Transfer {
            return Err(MhiEpError::MalformedContext(
                "expected a transfer descriptor at the ring's read offset",
            ));
        }
        let td = TransferDescriptor::parse(&raw);
        let capacity = td.len as usize;
        if payload.len() > capacity {
            return Err(MhiEpError::Overflow {
                payload: payload.len(),
                capacity,
            });
        }

        {
            let mut region = MappedRegion::map(mem, td.ptr, payload.len() as u64)?;
            region.write(0, payload)?;
        }
        ch.ring.advance_read();
        ch.ring.publish_read_pointer(mem)?;

        let event = TransferCompletionEvent {
            desc_addr: ch.ring.element_addr(index),
            chan,
            len: payload.len() as u16,
            code: CompletionCode::Eot,
        }
        .encode();
        submit_event(
            event_rings,
            *contexts,
            regs,
            &mut **msi,
            mem,
            ch.ring.context().error_event_ring(),
            &event,
            true,
        )?;
        Ok(payload.len())
    }

    /// Error-recovery skip: advances past descriptors from the current
    /// offset until a non-chained descriptor has been crossed, dropping any
    /// in-flight bookkeeping. Returns the number of descriptors skipped.
    pub fn skip_transfer_group(&mut self, mem: &mut dyn HostMemory, chan: u16) -> Result<usize> {
        if chan as usize >= self.channels.len() {
            return Err(MhiEpError::InvalidChannel(chan));
        }
        let Self { regs, channels, .. } = self;
        let mut ch = lock(&channels[chan as usize]);
        if !ch.is_running() {
            return Err(MhiEpError::ChannelNotRunning(chan));
        }

        ch.ring.update_write_offset(regs, mem)?;
        ch.inflight = None;

        let mut skipped = 0usize;
        while !ch.ring.is_empty() {
            let raw = *ch.ring.element(ch.ring.read_offset());
            let chained = element::type_tag(&raw) == ElementType::Transfer
                && TransferDescriptor::parse(&raw).chain;
            ch.ring.advance_read();
            skipped += 1;
            if !chained {
                break;
            }
        }
        if skipped > 0 {
            debug!(chan, skipped, "skipped to the next transfer group boundary");
            ch.ring.publish_read_pointer(mem)?;
        }
        Ok(skipped)
    }
}

/// Which completion event a retired descriptor asks for, and whether the
/// host should be interrupted for it (`bei` suppresses the block-event
/// interrupt).
fn completion_event_for(td: &TransferDescriptor) -> Option<(CompletionCode, bool)> {
    if td.chain {
        td.ieob.then_some((CompletionCode::Eob, !td.bei))
    } else {
        td.ieot.then_some((CompletionCode::Eot, true))
    }
}

/// Appends one record to an event ring and signals the host.
///
/// The ring's lock is held across refresh → append → read-pointer publish
/// and released only after the host-memory mapping used for the append has
/// been torn down; the MSI fires after that, so the host cannot observe
/// the interrupt before the data it announces.
#[allow(clippy::too_many_arguments)]
fn submit_event(
    event_rings: &[Mutex<Ring>],
    contexts: Option<ContextArrays>,
    regs: &Registers,
    msi: &mut dyn MsiSignal,
    mem: &mut dyn HostMemory,
    index: u16,
    raw: &RawElement,
    signal: bool,
) -> Result<()> {
    let slot = event_rings
        .get(index as usize)
        .ok_or(MhiEpError::InvalidEventRing(index))?;
    let vector = {
        let mut ring = lock(slot);
        if !ring.is_started() {
            // Event rings come up lazily on first use.
            let arrays = contexts.ok_or(MhiEpError::CachesNotReady)?;
            let ctx = context::read_context(mem, arrays.event_base, index)?;
            ring.start(ctx, context::context_addr(arrays.event_base, index), mem)?;
        }
        ring.add_element(regs, mem, raw)?;
        ring.context().msi_vector()
    };
    if signal {
        msi.raise(vector);
    }
    Ok(())
}
