//! Controller front end
//!
//! [`XhciController`] owns the platform handle and the engine state behind a
//! single spinlock. Every public operation takes the lock, works on
//! [`HostState`], and collects finished work in an outbox. Notifications are
//! delivered after the lock is released, so the client callback may call
//! back into the controller.
//!
//! Submissions and interrupts that find the lock held are not lost: they are
//! parked and the current lock holder processes them before it lets go.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::mem;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bitflags::bitflags;
use heapless::Deque;
use spin::{Mutex, MutexGuard};

use crate::command::{CommandCompletion, CommandId, CommandOrigin, CommandRing};
use crate::config::{HostConfig, Quirks};
use crate::endpoint::{
    Endpoint, EndpointConfig, EpState, Slot, SlotInfo, SlotTable, StreamInfo, TransferType, MAX_ENDPOINTS,
};
use crate::error::{Result, XhciError};
use crate::event::IrqStatus;
use crate::hal::Platform;
use crate::perf::{PerfCounters, PerfSnapshot};
use crate::recovery::RecoveryStats;
use crate::register::{Iman, Registers, UsbCmd};
use crate::ring::{EventRing, Ring, RingType};
use crate::td::{TdArena, TdSizeMode};
use crate::transfer::{TransferCompletion, TransferId, TransferRequest, Urb};
use crate::trb::CommandTrb;

/// Submissions parked while the lock is held
pub const DEFERRED_SUBMITS: usize = 32;

bitflags! {
    /// Controller health
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HcState: u32 {
        /// Declared dead; all work fails with `Shutdown`
        const DYING = 1 << 0;
        /// Run/Stop cleared
        const HALTED = 1 << 1;
    }
}

/// Work handed to the client callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A submitted transfer finished, failed or was cancelled
    Transfer(TransferCompletion),
    /// A client command completed
    Command(CommandCompletion),
    PortStatusChange {
        port_id: u8,
        /// PORTSC as read when the event was handled
        portsc: u32,
    },
    DeviceNotification {
        slot_id: u8,
        notification_type: u8,
        data: u64,
    },
    /// The hub layer must clear the TT buffer of this endpoint and then call
    /// [`XhciController::clear_tt_complete`]
    ClearTtBuffer { slot_id: u8, ep_index: u8 },
    /// The controller stopped responding
    HostDied,
}

/// Engine state guarded by the controller lock
pub struct HostState {
    pub(crate) config: HostConfig,
    pub(crate) regs: Registers,
    pub(crate) td_size_mode: TdSizeMode,
    pub(crate) cmd: CommandRing,
    pub(crate) events: EventRing,
    pub(crate) slots: SlotTable,
    pub(crate) tds: TdArena,
    pub(crate) urbs: BTreeMap<TransferId, Urb>,
    /// Finished work, delivered once the lock is dropped
    pub(crate) outbox: Vec<Notification>,
    pub(crate) hc: HcState,
    /// Isochronous TDs between interrupts (AVOID_BEI)
    pub(crate) isoc_bei_interval: u32,
    pub(crate) mfindex_wraps: u32,
    /// Transfer events that matched no queued TD
    pub(crate) stray_events: u32,
    pub(crate) recovery: Arc<RecoveryStats>,
}

impl HostState {
    fn new<P: Platform>(hw: &P, config: HostConfig, recovery: Arc<RecoveryStats>) -> Result<Self> {
        let regs = Registers::discover(hw);
        let cmd_ring = Ring::new(hw, RingType::Command, config.command_ring_segments, 0, false)?;
        let events = match EventRing::new(hw, config.event_ring_segments) {
            Ok(events) => events,
            Err(e) => {
                cmd_ring.free(hw);
                return Err(e);
            }
        };
        if let Err(e) = events.check_erst_max(regs.erst_max()) {
            #[cfg(feature = "defmt")]
            defmt::error!("event ring has more segments than ERST max {}", regs.erst_max());
            events.free(hw);
            cmd_ring.free(hw);
            return Err(e);
        }
        Ok(Self {
            td_size_mode: TdSizeMode::for_host(regs.hci_version, config.quirks),
            isoc_bei_interval: config.isoc_bei_interval,
            config,
            regs,
            cmd: CommandRing::new(cmd_ring),
            events,
            slots: SlotTable::new(regs.max_slots()),
            tds: TdArena::new(),
            urbs: BTreeMap::new(),
            outbox: Vec::new(),
            hc: HcState::HALTED,
            mfindex_wraps: 0,
            stray_events: 0,
            recovery,
        })
    }

    /// Point the controller at the command and event rings and enable the interrupter
    fn program<P: Platform>(&mut self, hw: &P) {
        let ir = self.config.interrupter;
        let crcr = self.cmd.crcr_for(self.cmd.ring.enqueue());
        self.regs.write_crcr(hw, crcr);
        self.regs.write_erst(hw, ir, self.events.erst_size(), self.events.erst_dma());
        self.regs.write_erdp(hw, ir, self.events.erdp_value());
        let iman = self.regs.iman(hw, ir);
        self.regs.write_iman(hw, ir, iman | Iman::ENABLE.bits() | Iman::PENDING.bits());
        self.regs
            .modify_usbcmd(hw, |cmd| cmd | UsbCmd::INT_ENABLE | UsbCmd::HSE_ENABLE);
        #[cfg(feature = "defmt")]
        defmt::debug!(
            "xHCI {:#x}: {} slots, {} ports, ERST at {:#x}",
            self.regs.hci_version,
            self.regs.max_slots(),
            self.regs.max_ports(),
            self.events.erst_dma()
        );
    }

    fn add_endpoint<P: Platform>(&mut self, hw: &P, slot_id: u8, ep_index: u8, config: EndpointConfig) -> Result<u64> {
        if self.hc.contains(HcState::DYING) {
            return Err(XhciError::Shutdown);
        }
        let slot = self.slots.get_mut(slot_id).ok_or(XhciError::NoDevice)?;
        let entry = slot.eps.get_mut(usize::from(ep_index)).ok_or(XhciError::InvalidParameter)?;
        if entry.is_some() {
            return Err(XhciError::InvalidState);
        }
        let isoc = config.transfer_type == TransferType::Isochronous;
        let mut ep = Endpoint::new(
            hw,
            slot_id,
            ep_index,
            config,
            self.config.transfer_ring_segments,
            self.config.link_chain_quirk(isoc),
        )?;
        ep.use_extended_tbc = isoc && self.config.extended_tbc;
        let deq = ep.dequeue_pointer();
        *entry = Some(ep);
        #[cfg(feature = "defmt")]
        defmt::debug!("slot {} ep {} added, dequeue {:#x}", slot_id, ep_index, deq);
        Ok(deq)
    }

    /// Give back everything queued on an endpoint and release its rings
    fn drop_endpoint<P: Platform>(&mut self, hw: &P, slot_id: u8, ep_index: u8) -> Result<()> {
        if self.slots.ep(slot_id, ep_index).is_none() {
            return Err(XhciError::NoDevice);
        }
        self.kill_endpoint_tds(slot_id, ep_index);
        let ep = self
            .slots
            .get_mut(slot_id)
            .and_then(|slot| slot.eps.get_mut(usize::from(ep_index)))
            .and_then(Option::take)
            .ok_or(XhciError::NoDevice)?;
        ep.free(hw);
        Ok(())
    }

    fn reset_endpoint_ring(&mut self, slot_id: u8, ep_index: u8) -> Result<u64> {
        let ep = self.slots.ep_mut(slot_id, ep_index).ok_or(XhciError::NoDevice)?;
        if !ep.ring.td_list.is_empty() || !ep.cancelled_td_list.is_empty() {
            return Err(XhciError::Busy);
        }
        if ep.ep_state.intersects(EpState::DOORBELL_BLOCKED) {
            return Err(XhciError::InvalidState);
        }
        ep.ring.reinit();
        ep.ep_state.remove(EpState::HARD_CLEAR_TOGGLE);
        ep.err_count = 0;
        ep.skip = false;
        ep.next_frame_id = 0;
        Ok(ep.dequeue_pointer())
    }

    fn alloc_streams<P: Platform>(&mut self, hw: &P, slot_id: u8, ep_index: u8, num_streams: u16) -> Result<u64> {
        if self.config.quirks.contains(Quirks::BROKEN_STREAMS) {
            #[cfg(feature = "defmt")]
            defmt::warn!("streams are broken on this controller");
            return Err(XhciError::InvalidState);
        }
        let segments = self.config.transfer_ring_segments;
        let ep = self.slots.ep_mut(slot_id, ep_index).ok_or(XhciError::NoDevice)?;
        if ep.config.transfer_type != TransferType::Bulk {
            return Err(XhciError::InvalidParameter);
        }
        if ep.has_streams() || ep.streams.is_some() {
            return Err(XhciError::InvalidState);
        }
        if !ep.ring.td_list.is_empty() {
            return Err(XhciError::Busy);
        }
        let streams = StreamInfo::new(hw, num_streams, segments, ep.config.max_packet, false)?;
        let ctx = streams.ctx_dma();
        ep.streams = Some(streams);
        ep.ep_state.insert(EpState::HAS_STREAMS);
        #[cfg(feature = "defmt")]
        defmt::debug!("slot {} ep {}: {} streams, context array {:#x}", slot_id, ep_index, num_streams, ctx);
        Ok(ctx)
    }

    fn free_streams<P: Platform>(&mut self, hw: &P, slot_id: u8, ep_index: u8) -> Result<()> {
        let ep = self.slots.ep_mut(slot_id, ep_index).ok_or(XhciError::NoDevice)?;
        if !ep.has_streams() {
            return Err(XhciError::InvalidState);
        }
        if ep.ep_state.intersects(EpState::DOORBELL_BLOCKED) {
            return Err(XhciError::Busy);
        }
        ep.ep_state.insert(EpState::GETTING_NO_STREAMS);
        self.kill_endpoint_tds(slot_id, ep_index);
        let ep = self.slots.ep_mut(slot_id, ep_index).ok_or(XhciError::NoDevice)?;
        ep.ep_state.remove(EpState::HAS_STREAMS | EpState::GETTING_NO_STREAMS);
        if let Some(streams) = ep.streams.take() {
            streams.free(hw);
        }
        Ok(())
    }

    fn clear_tt_complete<P: Platform>(&mut self, hw: &P, slot_id: u8, ep_index: u8) {
        let Some(ep) = self.slots.ep_mut(slot_id, ep_index) else {
            return;
        };
        ep.ep_state.remove(EpState::CLEARING_TT);
        self.ring_doorbell_for_active_rings(hw, slot_id, ep_index);
    }
}

/// xHCI transfer ring engine for one controller and interrupter
pub struct XhciController<P: Platform> {
    hw: P,
    state: Mutex<HostState>,
    deferred: Mutex<Deque<(TransferId, TransferRequest), DEFERRED_SUBMITS>>,
    irq_pending: AtomicBool,
    notify: Box<dyn Fn(Notification) + Send + Sync>,
    perf: PerfCounters,
    recovery: Arc<RecoveryStats>,
    next_transfer_id: AtomicU32,
}

impl<P: Platform> XhciController<P> {
    /// Probe the controller, allocate the command and event rings and
    /// program them. The controller is left halted; call [`run`](Self::run).
    pub fn new(hw: P, config: HostConfig, notify: impl Fn(Notification) + Send + Sync + 'static) -> Result<Self> {
        let recovery = Arc::new(RecoveryStats::new());
        let mut state = HostState::new(&hw, config, Arc::clone(&recovery))?;
        state.program(&hw);
        Ok(Self {
            hw,
            state: Mutex::new(state),
            deferred: Mutex::new(Deque::new()),
            irq_pending: AtomicBool::new(false),
            notify: Box::new(notify),
            perf: PerfCounters::new(),
            recovery,
            next_transfer_id: AtomicU32::new(1),
        })
    }

    /// Platform handle, for tests and platform glue
    pub fn platform(&self) -> &P {
        &self.hw
    }

    /// Set Run/Stop and enable the interrupter line
    pub fn run(&self) -> Result<()> {
        self.with_state(|state| {
            if state.hc.contains(HcState::DYING) {
                return Err(XhciError::Shutdown);
            }
            state.regs.modify_usbcmd(&self.hw, |cmd| cmd | UsbCmd::RUN | UsbCmd::INT_ENABLE);
            state.hc.remove(HcState::HALTED);
            self.hw.set_enabled(true);
            #[cfg(feature = "defmt")]
            defmt::info!("xHCI running");
            Ok(())
        })
    }

    /// Clear Run/Stop. Queued work stays queued.
    pub fn halt(&self) {
        self.with_state(|state| state.halt(&self.hw))
    }

    /// Declare the controller dead: fail every command and transfer
    pub fn kill(&self) {
        self.with_state(|state| state.hc_died(&self.hw))
    }

    /// Stop the controller, fail all outstanding work and free every ring.
    /// Returns the platform handle.
    pub fn shutdown(self) -> P {
        let mut state = self.state.lock();
        state.halt(&self.hw);
        state.hc_died(&self.hw);
        self.release(state);

        let Self { hw, state, .. } = self;
        let mut state = state.into_inner();
        for slot in state.slots.iter_mut() {
            for ep in slot.eps.iter_mut().filter_map(Option::take) {
                ep.free(&hw);
            }
        }
        state.cmd.ring.free(&hw);
        state.events.free(&hw);
        hw
    }

    fn alloc_transfer_id(&self) -> TransferId {
        TransferId(self.next_transfer_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Queue a transfer. Completion arrives as [`Notification::Transfer`].
    ///
    /// If the lock is held (a callback submitting from inside delivery on
    /// another context), the request is parked and queued by the holder; a
    /// later failure is then reported through the notification instead.
    pub fn submit(&self, req: TransferRequest) -> Result<TransferId> {
        let id = self.alloc_transfer_id();
        match self.state.try_lock() {
            Some(mut state) => {
                let result = state.submit_transfer(&self.hw, id, req);
                if result.is_ok() {
                    self.perf.record_submit();
                }
                self.release(state);
                result?;
            }
            None => {
                self.deferred.lock().push_back((id, req)).map_err(|_| {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("deferred submit queue full");
                    XhciError::Busy
                })?;
                self.perf.record_submit();
                #[cfg(feature = "defmt")]
                defmt::trace!("submit {} deferred, lock held", id.0);
                self.release_parked();
            }
        }
        Ok(id)
    }

    /// Cancel a submitted transfer; it completes with `Cancelled`
    pub fn cancel(&self, id: TransferId) -> Result<()> {
        self.with_state(|state| state.cancel_transfer(&self.hw, id))
    }

    /// Queue a command with the default timeout and ring the host doorbell
    pub fn queue_command(&self, trb: CommandTrb) -> Result<CommandId> {
        self.queue_client_command(trb, None)
    }

    /// Queue a command with its own timeout
    pub fn queue_command_timeout(&self, trb: CommandTrb, timeout_ms: u32) -> Result<CommandId> {
        self.queue_client_command(trb, Some(timeout_ms))
    }

    fn queue_client_command(&self, trb: CommandTrb, timeout_ms: Option<u32>) -> Result<CommandId> {
        self.with_state(|state| {
            let timeout = timeout_ms.unwrap_or(state.config.command_timeout_ms);
            let id = state.queue_command(&self.hw, trb, timeout, CommandOrigin::Client, false)?;
            state.ring_cmd_db(&self.hw);
            Ok(id)
        })
    }

    /// Interrupt entry point
    pub fn handle_interrupt(&self) -> IrqStatus {
        let Some(mut state) = self.state.try_lock() else {
            self.irq_pending.store(true, Ordering::Release);
            self.release_parked();
            return IrqStatus::Deferred;
        };
        let status = state.irq(&self.hw);
        if let IrqStatus::Handled { events } = status {
            self.perf.record_interrupt(events);
        }
        self.release(state);
        status
    }

    /// Drive the command timer and abort handshake. Call when the deadline
    /// passed to `Clock::arm` is reached, or periodically.
    pub fn poll_timers(&self) {
        let now = self.hw.now_ms();
        self.with_state(|state| state.poll_command_timer(&self.hw, now))
    }

    /// Register a device slot after Enable Slot completed
    pub fn add_slot(&self, slot_id: u8, info: SlotInfo) -> Result<()> {
        self.with_state(|state| {
            if state.hc.contains(HcState::DYING) {
                return Err(XhciError::Shutdown);
            }
            state.slots.insert(Slot::new(slot_id, info))
        })
    }

    /// Forget a slot, giving back everything still queued on it
    pub fn remove_slot(&self, slot_id: u8) -> Result<()> {
        self.with_state(|state| {
            if state.slots.get(slot_id).is_none() {
                return Err(XhciError::NoDevice);
            }
            for ep_index in 0..MAX_ENDPOINTS as u8 {
                if state.slots.ep(slot_id, ep_index).is_some() {
                    state.drop_endpoint(&self.hw, slot_id, ep_index)?;
                }
            }
            state.slots.remove(slot_id);
            Ok(())
        })
    }

    /// Allocate the transfer ring of an endpoint. Returns the TR Dequeue
    /// Pointer (with DCS) for the input context.
    pub fn add_endpoint(&self, slot_id: u8, ep_index: u8, config: EndpointConfig) -> Result<u64> {
        self.with_state(|state| state.add_endpoint(&self.hw, slot_id, ep_index, config))
    }

    /// Release an endpoint; queued transfers complete with `Shutdown`
    pub fn drop_endpoint(&self, slot_id: u8, ep_index: u8) -> Result<()> {
        self.with_state(|state| state.drop_endpoint(&self.hw, slot_id, ep_index))
    }

    /// Return an idle endpoint ring to its initial state, as after a
    /// Configure Endpoint that dropped and re-added it. Returns the new
    /// TR Dequeue Pointer.
    pub fn reset_endpoint_ring(&self, slot_id: u8, ep_index: u8) -> Result<u64> {
        self.with_state(|state| state.reset_endpoint_ring(slot_id, ep_index))
    }

    /// Software state of an endpoint
    pub fn endpoint_state(&self, slot_id: u8, ep_index: u8) -> Option<EpState> {
        self.with_state(|state| state.slots.ep(slot_id, ep_index).map(Endpoint::state))
    }

    /// Switch a bulk endpoint to streams 1..=`num_streams`. Returns the
    /// stream context array address for the input context.
    pub fn alloc_streams(&self, slot_id: u8, ep_index: u8, num_streams: u16) -> Result<u64> {
        self.with_state(|state| state.alloc_streams(&self.hw, slot_id, ep_index, num_streams))
    }

    /// Tear down the streams of an endpoint; queued stream transfers
    /// complete with `Shutdown`
    pub fn free_streams(&self, slot_id: u8, ep_index: u8) -> Result<()> {
        self.with_state(|state| state.free_streams(&self.hw, slot_id, ep_index))
    }

    /// The hub layer finished clearing a TT buffer
    pub fn clear_tt_complete(&self, slot_id: u8, ep_index: u8) {
        self.with_state(|state| state.clear_tt_complete(&self.hw, slot_id, ep_index))
    }

    /// Free TRB slots on an endpoint ring (stream 0 for the endpoint ring itself)
    pub fn ring_trbs_free(&self, slot_id: u8, ep_index: u8, stream_id: u16) -> Option<usize> {
        self.with_state(|state| {
            let ep = state.slots.ep(slot_id, ep_index)?;
            if stream_id == 0 {
                return Some(ep.ring.num_trbs_free());
            }
            ep.streams.as_ref()?.ring(stream_id).map(Ring::num_trbs_free)
        })
    }

    pub fn is_dying(&self) -> bool {
        self.with_state(|state| state.hc.contains(HcState::DYING))
    }

    /// MFINDEX wraps seen since start
    pub fn mfindex_wraps(&self) -> u32 {
        self.with_state(|state| state.mfindex_wraps)
    }

    /// Transfer events dropped because they pointed into no queued TD
    pub fn stray_events(&self) -> u32 {
        self.with_state(|state| state.stray_events)
    }

    /// Commands queued and not yet completed
    pub fn pending_commands(&self) -> usize {
        self.with_state(|state| state.cmd.pending())
    }

    pub fn perf(&self) -> PerfSnapshot {
        self.perf.snapshot()
    }

    /// Error and recovery counters; readable without the controller lock
    pub fn recovery_stats(&self) -> Arc<RecoveryStats> {
        Arc::clone(&self.recovery)
    }

    /// Work parked while the lock was held
    fn drain_deferred(&self, state: &mut HostState) {
        if self.irq_pending.swap(false, Ordering::AcqRel) {
            let status = state.irq(&self.hw);
            if let IrqStatus::Handled { events } = status {
                self.perf.record_interrupt(events);
            }
        }
        loop {
            let Some((id, req)) = self.deferred.lock().pop_front() else {
                break;
            };
            let (slot_id, ep_index, stream_id) = (req.slot_id, req.ep_index, req.stream_id);
            if let Err(e) = state.submit_transfer(&self.hw, id, req) {
                state.outbox.push(Notification::Transfer(TransferCompletion {
                    id,
                    slot_id,
                    ep_index,
                    stream_id,
                    status: Some(e),
                    actual_length: 0,
                    iso_packets: Vec::new(),
                    start_frame: 0,
                    interval: 0,
                }));
            }
        }
    }

    /// Run `f` under the lock, then hand the guard to [`release`](Self::release)
    fn with_state<R>(&self, f: impl FnOnce(&mut HostState) -> R) -> R {
        let mut state = self.state.lock();
        let result = f(&mut state);
        self.release(state);
        result
    }

    /// Work was parked after a failed `try_lock`; the holder may have
    /// released before it landed
    fn release_parked(&self) {
        if let Some(state) = self.state.try_lock() {
            self.release(state);
        }
    }

    /// Process parked work, drop the lock and deliver the outbox
    fn release<'a>(&'a self, mut state: MutexGuard<'a, HostState>) {
        loop {
            self.drain_deferred(&mut state);
            self.perf.sync_timeouts(state.cmd.timeouts());
            let outbox = mem::take(&mut state.outbox);
            drop(state);
            self.deliver(outbox);

            let parked = !self.deferred.lock().is_empty() || self.irq_pending.load(Ordering::Acquire);
            if !parked {
                return;
            }
            match self.state.try_lock() {
                Some(next) => state = next,
                None => return,
            }
        }
    }

    fn deliver(&self, outbox: Vec<Notification>) {
        for notification in outbox {
            match &notification {
                Notification::Transfer(done) if done.is_ok() => {
                    self.perf.record_transfer_success(done.actual_length)
                }
                Notification::Transfer(_) => self.perf.record_transfer_failure(),
                Notification::Command(_) => self.perf.record_command(),
                _ => {}
            }
            (self.notify)(notification);
        }
    }
}
