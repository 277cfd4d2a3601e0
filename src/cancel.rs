//! Cancellation and halt recovery
//!
//! A cancelled TD cannot simply be rewritten while the controller may have
//! it cached. Cancellation stops the endpoint first; once stopped, TDs the
//! controller has not reached are turned into No-Ops, and the TD it stopped
//! inside is skipped with a Set TR Dequeue. Only one Set TR Dequeue may be in
//! flight per endpoint; TDs on other streams wait as deferred and are handled
//! when it completes.
//!
//! Halted endpoints go through Reset Endpoint, after which the same
//! invalidation runs over the cancelled list.

use alloc::vec::Vec;

use crate::command::CommandOrigin;
use crate::controller::{HcState, HostState};
use crate::endpoint::{EpState, QueuedDequeue};
use crate::error::{Result, XhciError};
use crate::hal::{EpContextState, Platform};
use crate::register::{ep_doorbell_value, mb};
use crate::ring::Cursor;
use crate::td::{CancelStatus, TdId};
use crate::transfer::TransferId;
use crate::trb::{CommandTrb, CompletionCode, SCT_PRIMARY_TR};

/// Kind of Reset Endpoint used for halt recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ResetType {
    /// Transfer state preserved; used for retries and stream endpoints
    Soft,
    /// Data toggle and sequence cleared
    Hard,
}

/// TD whose cached copy is being skipped by the next Set TR Dequeue
#[derive(Debug, Clone, Copy)]
struct CachedTd {
    id: TdId,
    stream_id: u16,
    start: Cursor,
    end: Cursor,
}

impl HostState {
    /// Ring the doorbell of one endpoint ring unless a pending command owns it
    pub(crate) fn ring_ep_doorbell<P: Platform>(&self, hw: &P, slot_id: u8, ep_index: u8, stream_id: u16) {
        let Some(ep) = self.slots.ep(slot_id, ep_index) else {
            return;
        };
        if ep.ep_state.intersects(EpState::DOORBELL_BLOCKED) {
            return;
        }
        mb();
        hw.ring(slot_id, ep_doorbell_value(ep_index, stream_id));
    }

    /// Restart every ring of an endpoint that has TDs queued
    pub(crate) fn ring_doorbell_for_active_rings<P: Platform>(&self, hw: &P, slot_id: u8, ep_index: u8) {
        let Some(ep) = self.slots.ep(slot_id, ep_index) else {
            return;
        };
        for stream_id in ep.active_streams() {
            self.ring_ep_doorbell(hw, slot_id, ep_index, stream_id);
        }
    }

    /// Cancel a submitted transfer.
    ///
    /// Its TDs are marked dirty and moved to the endpoint's cancelled list;
    /// the first cancellation on a running endpoint queues Stop Endpoint. The
    /// completion arrives later as a `Cancelled` notification. Cancelling an
    /// already cancelled transfer does nothing.
    pub(crate) fn cancel_transfer<P: Platform>(&mut self, hw: &P, id: TransferId) -> Result<()> {
        let Some(urb) = self.urbs.get_mut(&id) else {
            return Err(XhciError::InvalidParameter);
        };
        if urb.unlinked {
            return Ok(());
        }
        urb.unlinked = true;
        let (slot_id, ep_index) = (urb.slot_id, urb.ep_index);
        let tds: Vec<TdId> = urb.tds.clone();
        #[cfg(feature = "defmt")]
        defmt::debug!("cancel transfer {} on slot {} ep {}", id.0, slot_id, ep_index);

        if self.hc.contains(HcState::HALTED) || self.slots.ep(slot_id, ep_index).is_none() {
            // Nothing will process the rings; give the TDs back directly
            for td in tds {
                if let Some(ring_td) = self.tds.get_mut(td) {
                    ring_td.status = Some(XhciError::Cancelled);
                    self.td_cleanup(td, Some(XhciError::Cancelled));
                }
            }
            return Ok(());
        }

        let Some(ep) = self.slots.ep_mut(slot_id, ep_index) else {
            return Ok(());
        };
        for td_id in tds {
            let Some(td) = self.tds.get_mut(td_id) else {
                continue;
            };
            if td.cancel_status.is_none() {
                td.cancel_status = Some(CancelStatus::Dirty);
            }
            if !td.on_cancelled_list {
                td.on_cancelled_list = true;
                ep.cancelled_td_list.push_back(td_id);
            }
        }

        // Pending handlers will invalidate the cancelled list
        if ep.ep_state.intersects(EpState::SET_DEQ_PENDING | EpState::HALTED | EpState::CLEARING_TT) {
            #[cfg(feature = "defmt")]
            defmt::debug!("cancel deferred, endpoint state {:#x}", ep.ep_state.bits());
            return Ok(());
        }
        if ep.ep_state.contains(EpState::STOP_CMD_PENDING) {
            return Ok(());
        }
        ep.ep_state.insert(EpState::STOP_CMD_PENDING);
        ep.stop_time = hw.now_ms();

        let stop = CommandTrb::StopEndpoint {
            slot_id,
            ep_index,
            suspend: false,
        };
        let timeout = self.config.command_timeout_ms;
        if let Err(e) = self.queue_command(hw, stop, timeout, CommandOrigin::Engine, false) {
            if let Some(ep) = self.slots.ep_mut(slot_id, ep_index) {
                ep.ep_state.remove(EpState::STOP_CMD_PENDING);
            }
            return Err(e);
        }
        self.ring_cmd_db(hw);
        Ok(())
    }

    /// Turn cancelled TDs into No-Ops and, if the controller stopped inside
    /// one, queue a Set TR Dequeue past it
    pub(crate) fn invalidate_cancelled_tds<P: Platform>(&mut self, hw: &P, slot_id: u8, ep_index: u8) {
        let Some(ep) = self.slots.ep_mut(slot_id, ep_index) else {
            return;
        };
        // Dequeue pointers are moving; the Set TR Dequeue handler calls back
        if ep.ep_state.contains(EpState::SET_DEQ_PENDING) {
            return;
        }

        let mut cached: Option<CachedTd> = None;
        let cancelled: Vec<TdId> = ep.cancelled_td_list.iter().copied().collect();
        for id in cancelled {
            let Some(td) = self.tds.get_mut(id) else {
                continue;
            };
            let (stream_id, start, end, status) = (td.stream_id, td.start, td.end, td.cancel_status);
            let was_queued = core::mem::replace(&mut td.on_td_list, false);
            let hw_deq = ep.hw_dequeue(hw, stream_id);
            let Some(ring) = ep.ring_for_stream_mut(stream_id) else {
                #[cfg(feature = "defmt")]
                defmt::warn!("no ring for cancelled TD on stream {}", stream_id);
                continue;
            };
            if was_queued {
                ring.td_list.retain(|t| *t != id);
            }

            let hw_inside = ring.trb_in_td(start, end, hw_deq).is_some();
            if status != Some(CancelStatus::Halted) && !hw_inside {
                ring.td_to_noop(start, end, false);
                set_cancel_status(&mut self.tds, id, CancelStatus::Cleared);
                continue;
            }
            match status {
                Some(CancelStatus::Cleared) | Some(CancelStatus::ClearingCache) => {}
                _ => {
                    if let Some(c) = cached {
                        if c.stream_id != stream_id {
                            #[cfg(feature = "defmt")]
                            defmt::debug!("deferring dequeue move for stream {}", stream_id);
                            set_cancel_status(&mut self.tds, id, CancelStatus::ClearingCacheDeferred);
                            continue;
                        }
                        #[cfg(feature = "defmt")]
                        defmt::warn!("two cached TDs on stream {}, clearing the first", stream_id);
                        ring.td_to_noop(c.start, c.end, false);
                        set_cancel_status(&mut self.tds, c.id, CancelStatus::Cleared);
                    }
                    ring.td_to_noop(start, end, false);
                    set_cancel_status(&mut self.tds, id, CancelStatus::ClearingCache);
                    cached = Some(CachedTd {
                        id,
                        stream_id,
                        start,
                        end,
                    });
                }
            }
        }

        let Some(cached) = cached else {
            return;
        };
        if let Err(_e) = self.move_dequeue_past_td(hw, slot_id, ep_index, cached.stream_id, cached.id) {
            #[cfg(feature = "defmt")]
            defmt::warn!("failed to move dequeue past cancelled TD: {}", _e);
            let Some(ep) = self.slots.ep_mut(slot_id, ep_index) else {
                return;
            };
            let cancelled: Vec<TdId> = ep.cancelled_td_list.iter().copied().collect();
            for id in cancelled {
                let Some(td) = self.tds.get_mut(id) else {
                    continue;
                };
                if !matches!(
                    td.cancel_status,
                    Some(CancelStatus::ClearingCache) | Some(CancelStatus::ClearingCacheDeferred)
                ) {
                    continue;
                }
                if let Some(ring) = ep.ring_for_stream_mut(td.stream_id) {
                    ring.td_to_noop(td.start, td.end, false);
                }
                td.cancel_status = Some(CancelStatus::Cleared);
            }
        }
    }

    /// Queue a Set TR Dequeue pointing just past `td_id`, taking the cycle
    /// state from the TD's last TRB and any toggling Link crossed after it
    fn move_dequeue_past_td<P: Platform>(
        &mut self,
        hw: &P,
        slot_id: u8,
        ep_index: u8,
        stream_id: u16,
        td_id: TdId,
    ) -> Result<()> {
        let end = self.tds.get(td_id).ok_or(XhciError::InvalidParameter)?.end;
        let ep = self.slots.ep(slot_id, ep_index).ok_or(XhciError::NoDevice)?;
        let ring = ep.ring_for_stream(stream_id).ok_or(XhciError::NoDevice)?;
        let hw_deq = ep.hw_dequeue(hw, stream_id);

        let mut new_deq = ring.dequeue();
        let mut new_cycle = ring.trb(end).cycle();
        let mut hw_found = false;
        let mut end_found = false;
        loop {
            if !hw_found && ring.trb_virt_to_dma(new_deq) == hw_deq {
                hw_found = true;
                if end_found {
                    break;
                }
            }
            if new_deq == end {
                end_found = true;
            }
            if end_found && ring.is_link(new_deq) && ring.link_toggles_cycle(new_deq) {
                new_cycle = !new_cycle;
            }
            new_deq = ring.next_trb(new_deq);
            if new_deq == ring.dequeue() {
                #[cfg(feature = "defmt")]
                defmt::error!("failed finding new dequeue state");
                return Err(XhciError::InvalidParameter);
            }
            if hw_found && end_found {
                break;
            }
        }

        if ep.ep_state.contains(EpState::SET_DEQ_PENDING) {
            #[cfg(feature = "defmt")]
            defmt::warn!("set TR dequeue already pending, not moving dequeue");
            return Err(XhciError::Busy);
        }
        let dequeue = ring.trb_virt_to_dma(new_deq);
        let trb = CommandTrb::SetTrDequeue {
            slot_id,
            ep_index,
            stream_id,
            dequeue,
            cycle: new_cycle,
            sct: if stream_id != 0 { SCT_PRIMARY_TR } else { 0 },
        };
        let timeout = self.config.command_timeout_ms;
        self.queue_command(hw, trb, timeout, CommandOrigin::Engine, false)?;

        let ep = self.slots.ep_mut(slot_id, ep_index).ok_or(XhciError::NoDevice)?;
        ep.queued_deq = Some(QueuedDequeue {
            stream_id,
            cursor: new_deq,
            dma: dequeue,
        });
        ep.ep_state.insert(EpState::SET_DEQ_PENDING);
        #[cfg(feature = "defmt")]
        defmt::debug!("set TR dequeue to {:#x} cycle {}", dequeue, new_cycle);
        self.ring_cmd_db(hw);
        Ok(())
    }

    /// Give back every cancelled TD that has been cleared
    pub(crate) fn giveback_invalidated_tds(&mut self, slot_id: u8, ep_index: u8) {
        let Some(ep) = self.slots.ep(slot_id, ep_index) else {
            return;
        };
        let cancelled: Vec<TdId> = ep.cancelled_td_list.iter().copied().collect();
        for id in cancelled {
            if let Some(td) = self.tds.get(id) {
                if td.cancel_status == Some(CancelStatus::Cleared) {
                    let status = td.status;
                    self.td_cleanup(id, status);
                }
            }
            if self.hc.contains(HcState::DYING) {
                return;
            }
        }
    }

    /// First TD on the endpoint ring if the controller halted inside it.
    /// Not usable with streams.
    pub(crate) fn find_halted_td<P: Platform>(&self, hw: &P, slot_id: u8, ep_index: u8) -> Option<TdId> {
        let ep = self.slots.ep(slot_id, ep_index)?;
        let first = *ep.ring.td_list.front()?;
        let td = self.tds.get(first)?;
        let hw_deq = ep.hw_dequeue(hw, 0);
        ep.ring.trb_in_td(td.start, td.end, hw_deq).map(|_| first)
    }

    /// Queue Reset Endpoint for a halted endpoint.
    ///
    /// On a hard reset the halted TD joins the cancelled list so the reset
    /// handler moves the dequeue past it.
    pub(crate) fn handle_halted_endpoint<P: Platform>(
        &mut self,
        hw: &P,
        slot_id: u8,
        ep_index: u8,
        td: Option<TdId>,
        reset: ResetType,
    ) -> Result<()> {
        let ep = self.slots.ep_mut(slot_id, ep_index).ok_or(XhciError::NoDevice)?;
        if reset == ResetType::Hard {
            ep.ep_state.insert(EpState::HARD_CLEAR_TOGGLE);
            if let Some(td_ref) = td.and_then(|id| self.tds.get_mut(id)) {
                if !td_ref.on_cancelled_list {
                    td_ref.on_cancelled_list = true;
                    td_ref.cancel_status = Some(CancelStatus::Halted);
                    if let Some(id) = td {
                        ep.cancelled_td_list.push_back(id);
                    }
                }
            }
        }
        if ep.ep_state.contains(EpState::HALTED) {
            #[cfg(feature = "defmt")]
            defmt::debug!("reset endpoint for ep {} already pending", ep_index);
            return Ok(());
        }

        let trb = CommandTrb::ResetEndpoint {
            slot_id,
            ep_index,
            preserve: reset == ResetType::Soft,
        };
        let timeout = self.config.reset_timeout_ms;
        self.queue_command(hw, trb, timeout, CommandOrigin::Engine, false)?;
        if let Some(ep) = self.slots.ep_mut(slot_id, ep_index) {
            ep.ep_state.insert(EpState::HALTED);
        }
        self.ring_cmd_db(hw);
        Ok(())
    }

    /// Stop Endpoint completed for a cancellation
    pub(crate) fn handle_cmd_stop_ep<P: Platform>(&mut self, hw: &P, trb: &CommandTrb, code: CompletionCode) {
        let CommandTrb::StopEndpoint {
            slot_id,
            ep_index,
            suspend,
        } = *trb
        else {
            return;
        };
        if suspend {
            return;
        }
        let Some(ep) = self.slots.ep(slot_id, ep_index) else {
            return;
        };

        if code == CompletionCode::ContextStateError {
            let ep_state = ep.ep_state;
            let has_streams = ep.has_streams();
            let stop_time = ep.stop_time;
            match hw.endpoint_state(slot_id, ep_index) {
                EpContextState::Halted => {
                    #[cfg(feature = "defmt")]
                    defmt::debug!("stop endpoint raced with a halt");
                    // A Reset Endpoint from the halt event is already pending
                    let reset_done = ep_state.contains(EpState::HALTED) || {
                        let (reset, td) = if has_streams {
                            (ResetType::Soft, None)
                        } else {
                            let td = self.find_halted_td(hw, slot_id, ep_index);
                            if let Some(halted) = td.and_then(|id| self.tds.get_mut(id)) {
                                halted.status = Some(XhciError::TransactionError);
                            }
                            (ResetType::Hard, td)
                        };
                        self.handle_halted_endpoint(hw, slot_id, ep_index, td, reset).is_ok()
                    };
                    if reset_done {
                        if let Some(ep) = self.slots.ep_mut(slot_id, ep_index) {
                            ep.ep_state.remove(EpState::STOP_CMD_PENDING);
                        }
                        return;
                    }
                }
                EpContextState::Stopped if ep_state.contains(EpState::HALTED) => {}
                EpContextState::Stopped | EpContextState::Running => {
                    #[cfg(feature = "defmt")]
                    defmt::debug!("stop endpoint failed on a running context");
                    let deadline = stop_time + u64::from(self.config.stop_endpoint_retry_ms);
                    if hw.now_ms() <= deadline {
                        let stop = CommandTrb::StopEndpoint {
                            slot_id,
                            ep_index,
                            suspend: false,
                        };
                        let timeout = self.config.command_timeout_ms;
                        match self.queue_command(hw, stop, timeout, CommandOrigin::Engine, false) {
                            Ok(_) => self.ring_cmd_db(hw),
                            Err(_) => {
                                if let Some(ep) = self.slots.ep_mut(slot_id, ep_index) {
                                    ep.ep_state.remove(EpState::STOP_CMD_PENDING);
                                }
                            }
                        }
                        return;
                    }
                }
                _ => {}
            }
        }

        self.invalidate_cancelled_tds(hw, slot_id, ep_index);
        if let Some(ep) = self.slots.ep_mut(slot_id, ep_index) {
            ep.ep_state.remove(EpState::STOP_CMD_PENDING);
        }
        self.giveback_invalidated_tds(slot_id, ep_index);
        self.ring_doorbell_for_active_rings(hw, slot_id, ep_index);
    }

    /// Set TR Dequeue completed: adopt the new dequeue, give back the TDs it
    /// skipped and handle anything cancelled meanwhile
    pub(crate) fn handle_cmd_set_deq<P: Platform>(&mut self, hw: &P, trb: &CommandTrb, code: CompletionCode) {
        let CommandTrb::SetTrDequeue {
            slot_id,
            ep_index,
            stream_id,
            ..
        } = *trb
        else {
            return;
        };
        let cdns_sctx = self.config.quirks.contains(crate::config::Quirks::CDNS_SCTX);
        let Some(ep) = self.slots.ep_mut(slot_id, ep_index) else {
            return;
        };

        if ep.ring_for_stream(stream_id).is_none() {
            #[cfg(feature = "defmt")]
            defmt::warn!("set TR dequeue completed for a freed ring, stream {}", stream_id);
        } else {
            if code != CompletionCode::Success {
                #[cfg(feature = "defmt")]
                match code {
                    CompletionCode::TrbError => {
                        defmt::warn!("set TR dequeue: invalid stream id or bad cycle")
                    }
                    CompletionCode::ContextStateError => {
                        defmt::warn!(
                            "set TR dequeue: endpoint not stopped, context state {}",
                            hw.endpoint_state(slot_id, ep_index)
                        )
                    }
                    CompletionCode::SlotNotEnabled => defmt::warn!("set TR dequeue: slot not enabled"),
                    _ => defmt::warn!("set TR dequeue: unknown completion code {}", code),
                }
            } else {
                let deq = ep.hw_dequeue(hw, stream_id);
                if ep.has_streams() && cdns_sctx {
                    if let Some(streams) = ep.streams.as_mut() {
                        streams.clear_reserved(stream_id);
                    }
                }
                match ep.queued_deq {
                    Some(queued) if queued.dma == deq && queued.stream_id == stream_id => {
                        if let Some(ring) = ep.ring_for_stream_mut(stream_id) {
                            let mut cursor = queued.cursor;
                            if ring.is_link(cursor) {
                                cursor = ring.next_trb(cursor);
                            }
                            ring.dequeue = cursor;
                        }
                    }
                    _ => {
                        #[cfg(feature = "defmt")]
                        defmt::warn!("set TR dequeue completion does not match the queued dequeue {:#x}", deq);
                    }
                }
            }

            let clearing: Vec<TdId> = ep
                .cancelled_td_list
                .iter()
                .copied()
                .filter(|id| {
                    self.tds
                        .get(*id)
                        .is_some_and(|td| td.cancel_status == Some(CancelStatus::ClearingCache))
                })
                .collect();
            for id in clearing {
                let status = self.tds.get_mut(id).map(|td| {
                    td.cancel_status = Some(CancelStatus::Cleared);
                    td.status
                });
                if let Some(status) = status {
                    self.td_cleanup(id, status);
                }
            }
        }

        let Some(ep) = self.slots.ep_mut(slot_id, ep_index) else {
            return;
        };
        ep.ep_state.remove(EpState::SET_DEQ_PENDING);
        ep.queued_deq = None;
        if !ep.cancelled_td_list.is_empty() {
            self.invalidate_cancelled_tds(hw, slot_id, ep_index);
            self.ring_doorbell_for_active_rings(hw, slot_id, ep_index);
            self.giveback_invalidated_tds(slot_id, ep_index);
        } else {
            self.ring_doorbell_for_active_rings(hw, slot_id, ep_index);
        }
    }

    /// Reset Endpoint completed: the endpoint is stopped, clean up and, for a
    /// soft reset, restart it
    pub(crate) fn handle_cmd_reset_ep<P: Platform>(&mut self, hw: &P, trb: &CommandTrb, code: CompletionCode) {
        let CommandTrb::ResetEndpoint {
            slot_id,
            ep_index,
            preserve,
        } = *trb
        else {
            return;
        };
        if self.slots.ep(slot_id, ep_index).is_none() {
            return;
        }
        if code != CompletionCode::Success {
            #[cfg(feature = "defmt")]
            defmt::debug!("reset endpoint {} completed with {}", ep_index, code);
        }

        self.invalidate_cancelled_tds(hw, slot_id, ep_index);
        if let Some(ep) = self.slots.ep_mut(slot_id, ep_index) {
            ep.ep_state.remove(EpState::HALTED);
        }
        self.giveback_invalidated_tds(slot_id, ep_index);
        if preserve {
            self.ring_doorbell_for_active_rings(hw, slot_id, ep_index);
        }
    }
}

fn set_cancel_status(tds: &mut crate::td::TdArena, id: TdId, status: CancelStatus) {
    if let Some(td) = tds.get_mut(id) {
        td.cancel_status = Some(status);
    }
}
