//! Event ring consumer and transfer event handling
//!
//! Events are consumed while their cycle bit matches the event ring's cycle
//! state. A transfer event is matched against the first TD of the ring its
//! TRB pointer falls into; the completion policy of the endpoint's transfer
//! type then sets the request's length and status and decides whether the
//! endpoint needs a reset.
//!
//! Completions are not delivered from here. Finished requests are pushed to
//! the controller outbox and handed to the client after the lock is dropped.

use alloc::vec::Vec;

use heapless::Vec as ScratchVec;

use crate::cancel::ResetType;
use crate::config::{Quirks, AVOID_BEI_INTERVAL_MIN};
use crate::controller::{HcState, HostState, Notification};
use crate::endpoint::{EpState, TransferType};
use crate::error::{Result, XhciError};
use crate::hal::{EpContextState, Platform};
use crate::recovery::RecoveryAction;
use crate::register::{Iman, UsbSts, ERST_EHB, ERST_PTR_MASK};
use crate::ring::{Cursor, Ring, MAX_BOUNCE, TRBS_PER_SEGMENT};
use crate::td::{sum_trb_lengths, Td, TdId};
use crate::transfer::{TransferCompletion, TransferFlags, Urb};
use crate::trb::{
    CompletionCode, DeviceNotificationEvent, Event, PortStatusChangeEvent, Trb, TransferEvent, TrbType,
    TRB_LEN_MASK,
};

/// Outcome of an interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IrqStatus {
    /// EINT was clear; the line is shared or the interrupt was spurious
    NotOurs,
    Handled {
        /// Event TRBs consumed
        events: u32,
    },
    /// The controller lock was held; the holder drains the event ring on release
    Deferred,
}

/// Stage of a control TD an event points at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CtrlStage {
    Setup,
    Data,
    Status,
    Other,
}

impl CtrlStage {
    fn of(trb: &Trb) -> Self {
        match trb.trb_type() {
            Some(TrbType::SetupStage) => Self::Setup,
            Some(TrbType::DataStage) | Some(TrbType::Normal) => Self::Data,
            Some(TrbType::StatusStage) => Self::Status,
            _ => Self::Other,
        }
    }
}

/// The controller halted its side of the endpoint and needs a Reset Endpoint
pub(crate) fn halted_host_endpoint(ctx: EpContextState, code: CompletionCode) -> bool {
    match code {
        CompletionCode::StallError => true,
        // 0.95 controllers may not halt on babble; trust the context
        CompletionCode::UsbTransactionError
        | CompletionCode::BabbleDetectedError
        | CompletionCode::SplitTransactionError => ctx == EpContextState::Halted,
        _ => false,
    }
}

/// Copy the bounced tail of an IN TD back into the request buffer
fn unmap_td_bounce(ring: &mut Ring, td: &Td, urb: &Urb) {
    let Some(seg_id) = td.bounce_seg else {
        return;
    };
    let seg = ring.segment_mut(seg_id);
    let len = (seg.bounce_len as usize).min(MAX_BOUNCE);
    if urb.dir_in && len > 0 {
        if let Some(bounce) = seg.bounce() {
            let mut scratch: ScratchVec<u8, MAX_BOUNCE> = ScratchVec::new();
            if scratch.resize(len, 0).is_ok() {
                bounce.copy_out(0, &mut scratch);
                urb.buffer.write_at(seg.bounce_offs as usize, &scratch);
            }
        }
    }
    seg.bounce_len = 0;
    seg.bounce_offs = 0;
}

impl HostState {
    /// Retire a TD and give its request back once every TD of it is done
    pub(crate) fn td_cleanup(&mut self, td_id: TdId, status: Option<XhciError>) {
        self.td_cleanup_with(td_id, status, false);
    }

    fn td_cleanup_with(&mut self, td_id: TdId, mut status: Option<XhciError>, killed: bool) {
        let Some(td) = self.tds.remove(td_id) else {
            return;
        };
        if let Some(ep) = self.slots.ep_mut(td.slot_id, td.ep_index) {
            if td.on_cancelled_list {
                ep.cancelled_td_list.retain(|id| *id != td_id);
            }
            if let Some(ring) = ep.ring_for_stream_mut(td.stream_id) {
                if td.on_td_list {
                    ring.td_list.retain(|id| *id != td_id);
                }
                if let Some(urb) = self.urbs.get(&td.urb) {
                    unmap_td_bounce(ring, &td, urb);
                }
            }
        }

        let Some(urb) = self.urbs.get_mut(&td.urb) else {
            return;
        };
        if urb.actual_length > urb.length {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "transfer {} length mismatch: requested {} actual {}",
                urb.id.0,
                urb.length,
                urb.actual_length
            );
            urb.actual_length = 0;
            status = None;
        }
        urb.num_tds_done += 1;
        if urb.num_tds_done < urb.tds.len() {
            return;
        }
        let Some(urb) = self.urbs.remove(&td.urb) else {
            return;
        };

        let status = if killed {
            Some(XhciError::Shutdown)
        } else if urb.unlinked {
            Some(XhciError::Cancelled)
        } else if urb.is_isoc() {
            None
        } else if status.is_none()
            && urb.flags.contains(TransferFlags::SHORT_NOT_OK)
            && urb.actual_length < urb.length
        {
            Some(XhciError::ShortPacket)
        } else {
            status
        };
        #[cfg(feature = "defmt")]
        defmt::trace!(
            "giveback transfer {}: {} of {} bytes",
            urb.id.0,
            urb.actual_length,
            urb.length
        );
        self.outbox.push(Notification::Transfer(TransferCompletion {
            id: urb.id,
            slot_id: urb.slot_id,
            ep_index: urb.ep_index,
            stream_id: urb.stream_id,
            status,
            actual_length: urb.actual_length,
            iso_packets: urb.iso,
            start_frame: urb.start_frame,
            interval: urb.interval,
        }));
    }

    /// Move the ring dequeue past a TD and retire it
    fn dequeue_td(&mut self, td_id: TdId) {
        let Some(td) = self.tds.get(td_id) else {
            return;
        };
        let (slot_id, ep_index, stream_id, end, status) = (td.slot_id, td.ep_index, td.stream_id, td.end, td.status);
        if let Some(ring) = self
            .slots
            .ep_mut(slot_id, ep_index)
            .and_then(|ep| ep.ring_for_stream_mut(stream_id))
        {
            ring.dequeue = end;
            ring.inc_deq();
        }
        self.td_cleanup(td_id, status);
    }

    /// Ask the hub layer to clear the TT buffer of a low/full speed endpoint
    /// behind an external hub
    fn clear_hub_tt_buffer(&mut self, slot_id: u8, ep_index: u8) {
        let external = self
            .slots
            .get(slot_id)
            .and_then(|slot| slot.info.tt)
            .is_some_and(|tt| tt.is_external());
        let Some(ep) = self.slots.ep_mut(slot_id, ep_index) else {
            return;
        };
        if !external
            || ep.config.transfer_type == TransferType::Interrupt
            || ep.ep_state.contains(EpState::CLEARING_TT)
        {
            return;
        }
        ep.ep_state.insert(EpState::CLEARING_TT);
        #[cfg(feature = "defmt")]
        defmt::debug!("clearing TT buffer for slot {} ep {}", slot_id, ep_index);
        self.outbox.push(Notification::ClearTtBuffer { slot_id, ep_index });
    }

    fn reset_halted_endpoint<P: Platform>(
        &mut self,
        hw: &P,
        slot_id: u8,
        ep_index: u8,
        td: Option<TdId>,
        code: CompletionCode,
    ) {
        self.recovery.record(code, RecoveryAction::ResetEndpoint);
        if let Err(_e) = self.handle_halted_endpoint(hw, slot_id, ep_index, td, ResetType::Hard) {
            #[cfg(feature = "defmt")]
            defmt::warn!("could not queue reset endpoint for ep {}: {}", ep_index, _e);
        }
    }

    /// Final step of every completion policy
    fn finish_td<P: Platform>(&mut self, hw: &P, td_id: TdId, code: CompletionCode) {
        let Some(td) = self.tds.get(td_id) else {
            return;
        };
        let (slot_id, ep_index, on_cancelled) = (td.slot_id, td.ep_index, td.on_cancelled_list);
        match code {
            // The Stop Endpoint completion owns stopped TDs; they may restart
            CompletionCode::Stopped | CompletionCode::StoppedLengthInvalid | CompletionCode::StoppedShortPacket => {
                return;
            }
            CompletionCode::UsbTransactionError
            | CompletionCode::BabbleDetectedError
            | CompletionCode::SplitTransactionError => {
                if hw.endpoint_state(slot_id, ep_index) == EpContextState::Halted {
                    self.clear_hub_tt_buffer(slot_id, ep_index);
                    self.reset_halted_endpoint(hw, slot_id, ep_index, Some(td_id), code);
                    return;
                }
                let resolving = self
                    .slots
                    .ep(slot_id, ep_index)
                    .is_some_and(|ep| ep.ep_state.contains(EpState::HALTED));
                if resolving && on_cancelled {
                    #[cfg(feature = "defmt")]
                    defmt::debug!("reset already resolving halted ep {}", ep_index);
                    return;
                }
                self.recovery.record(code, RecoveryAction::Giveback);
            }
            CompletionCode::StallError => {
                if ep_index != 0 {
                    self.clear_hub_tt_buffer(slot_id, ep_index);
                }
                self.reset_halted_endpoint(hw, slot_id, ep_index, Some(td_id), code);
                return;
            }
            CompletionCode::Success | CompletionCode::ShortPacket | CompletionCode::VendorInfo(_) => {}
            _ => self.recovery.record(code, RecoveryAction::Giveback),
        }
        self.dequeue_td(td_id);
    }

    fn process_ctrl_td<P: Platform>(&mut self, hw: &P, td_id: TdId, ep_trb: Cursor, ev: &TransferEvent) {
        let Some(td) = self.tds.get_mut(td_id) else {
            return;
        };
        let Some(urb) = self.urbs.get_mut(&td.urb) else {
            return;
        };
        let Some(ring) = self
            .slots
            .ep(td.slot_id, td.ep_index)
            .and_then(|ep| ep.ring_for_stream(td.stream_id))
        else {
            return;
        };
        let stage = CtrlStage::of(&ring.trb(ep_trb));
        let requested = urb.length;
        let remaining = ev.transfer_length as usize;
        let code = ev.code;

        let mut finish = false;
        match code {
            CompletionCode::Success => {
                if stage != CtrlStage::Status {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("success on control {} TRB without IOC", if stage == CtrlStage::Data { "data" } else { "setup" });
                    td.status = Some(XhciError::Shutdown);
                } else {
                    td.status = None;
                }
            }
            CompletionCode::ShortPacket => td.status = None,
            CompletionCode::StoppedShortPacket => {
                if stage == CtrlStage::Data {
                    urb.actual_length = remaining;
                } else {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("stopped short packet on control setup or status TRB");
                }
                finish = true;
            }
            CompletionCode::Stopped => {
                match stage {
                    CtrlStage::Setup => urb.actual_length = 0,
                    CtrlStage::Data => urb.actual_length = requested.saturating_sub(remaining),
                    CtrlStage::Status => urb.actual_length = requested,
                    CtrlStage::Other => {
                        #[cfg(feature = "defmt")]
                        defmt::warn!("stopped on unexpected TRB type in control TD");
                    }
                }
                finish = true;
            }
            CompletionCode::StoppedLengthInvalid => finish = true,
            _ => {
                if halted_host_endpoint(hw.endpoint_state(td.slot_id, td.ep_index), code) {
                    // Did part of the data stage get through?
                    if stage == CtrlStage::Data {
                        urb.actual_length = requested.saturating_sub(remaining);
                    } else if !td.urb_length_set {
                        urb.actual_length = 0;
                    }
                    finish = true;
                }
            }
        }

        if !finish {
            match stage {
                CtrlStage::Setup => {}
                CtrlStage::Data => {
                    // Length is final; the Status stage event must not overwrite it
                    td.urb_length_set = true;
                    urb.actual_length = requested.saturating_sub(remaining);
                    #[cfg(feature = "defmt")]
                    defmt::trace!("control data stage done, waiting for status");
                    return;
                }
                CtrlStage::Status | CtrlStage::Other => {
                    if !td.urb_length_set {
                        urb.actual_length = requested;
                    }
                }
            }
        }
        self.finish_td(hw, td_id, code);
    }

    fn process_isoc_td<P: Platform>(&mut self, hw: &P, td_id: TdId, ep_trb: Cursor, ev: &TransferEvent) {
        let Some(td) = self.tds.get_mut(td_id) else {
            return;
        };
        let Some(urb) = self.urbs.get_mut(&td.urb) else {
            return;
        };
        let Some(ring) = self
            .slots
            .ep(td.slot_id, td.ep_index)
            .and_then(|ep| ep.ring_for_stream(td.stream_id))
        else {
            return;
        };
        let Some(frame) = urb.iso.get_mut(td.index) else {
            return;
        };
        let code = ev.code;
        let short_status = if urb.flags.contains(TransferFlags::SHORT_NOT_OK) {
            Some(XhciError::ShortPacket)
        } else {
            None
        };
        let mut requested = frame.length as u32;
        let mut remaining = ev.transfer_length;
        let mut ep_trb_len = ring.trb(ep_trb).status() & TRB_LEN_MASK;
        let at_end = ep_trb == td.end;
        let mut sum_trbs_for_length = false;

        match code {
            CompletionCode::Success => {
                // An earlier error on this TD keeps its status
                if !td.error_mid_td {
                    if remaining != 0 {
                        frame.status = short_status;
                        sum_trbs_for_length = true;
                    } else {
                        frame.status = None;
                    }
                }
            }
            CompletionCode::ShortPacket => {
                frame.status = short_status;
                sum_trbs_for_length = true;
            }
            CompletionCode::BandwidthOverrun => frame.status = Some(XhciError::BandwidthOverrun),
            CompletionCode::BabbleDetectedError | CompletionCode::IsochBufferOverrun => {
                sum_trbs_for_length = code == CompletionCode::BabbleDetectedError;
                frame.status = Some(XhciError::Babble);
                td.error_mid_td |= !at_end;
            }
            CompletionCode::MissedServiceError => {
                frame.status = Some(XhciError::MissedService);
                sum_trbs_for_length = true;
                td.error_mid_td |= !at_end;
            }
            CompletionCode::IncompatibleDeviceError => frame.status = Some(XhciError::IncompatibleDevice),
            CompletionCode::StallError => frame.status = Some(XhciError::Stall),
            CompletionCode::UsbTransactionError => {
                frame.status = Some(XhciError::TransactionError);
                sum_trbs_for_length = true;
                td.error_mid_td |= !at_end;
            }
            CompletionCode::Stopped => sum_trbs_for_length = true,
            CompletionCode::StoppedShortPacket => {
                // The length field holds the bytes transferred
                frame.status = short_status;
                requested = remaining;
            }
            CompletionCode::StoppedLengthInvalid => {
                sum_trbs_for_length = true;
                ep_trb_len = 0;
                remaining = 0;
            }
            _ => {
                sum_trbs_for_length = true;
                frame.status = Some(XhciError::UnknownCompletion);
            }
        }

        if !td.urb_length_set {
            let actual = if sum_trbs_for_length {
                (sum_trb_lengths(ring, td, ep_trb) + ep_trb_len).saturating_sub(remaining)
            } else {
                requested
            };
            frame.actual_length = actual as usize;
            urb.actual_length += actual as usize;
        }

        if td.error_mid_td && !at_end {
            #[cfg(feature = "defmt")]
            defmt::debug!("error mid isoc TD, waiting for its final event");
            td.urb_length_set = true;
            return;
        }
        self.finish_td(hw, td_id, code);
    }

    /// Give back an isochronous TD the controller never serviced
    fn skip_isoc_td(&mut self, td_id: TdId, status: Option<XhciError>) {
        let Some(td) = self.tds.get_mut(td_id) else {
            return;
        };
        td.status = status;
        if let Some(frame) = self.urbs.get_mut(&td.urb).and_then(|urb| urb.iso.get_mut(td.index)) {
            frame.status = Some(XhciError::MissedService);
            frame.actual_length = 0;
        }
        self.recovery.record(CompletionCode::MissedServiceError, RecoveryAction::SkipIsocFrame);
        self.dequeue_td(td_id);
    }

    fn process_bulk_intr_td<P: Platform>(&mut self, hw: &P, td_id: TdId, ep_trb: Cursor, ev: &TransferEvent) {
        let code = ev.code;
        let no_soft_retry = self.config.quirks.contains(Quirks::NO_SOFT_RETRY);
        let max_soft_retry = self.config.max_soft_retry;
        let Some(td) = self.tds.get_mut(td_id) else {
            return;
        };
        let Some(urb) = self.urbs.get_mut(&td.urb) else {
            return;
        };
        let (slot_id, ep_index) = (td.slot_id, td.ep_index);
        let behind_tt = self
            .slots
            .get(slot_id)
            .and_then(|slot| slot.info.tt)
            .is_some_and(|tt| tt.is_external());
        let Some(ep) = self.slots.ep_mut(slot_id, ep_index) else {
            return;
        };
        let Some(ring) = ep.ring_for_stream(td.stream_id) else {
            return;
        };
        let remaining = ev.transfer_length;
        let ep_trb_len = ring.trb(ep_trb).status() & TRB_LEN_MASK;
        let requested = urb.length as u32;
        let at_end = ep_trb == td.end;
        let sum = sum_trb_lengths(ring, td, ep_trb);

        let actual = match code {
            CompletionCode::StoppedShortPacket => Some(remaining),
            // Exclude the stopped TRB whose length is invalid
            CompletionCode::StoppedLengthInvalid => Some(sum),
            _ => None,
        };
        let actual = match actual {
            Some(actual) => actual,
            None => {
                match code {
                    CompletionCode::Success => {
                        ep.err_count = 0;
                        if !at_end || remaining != 0 {
                            #[cfg(feature = "defmt")]
                            defmt::warn!(
                                "successful completion on short transfer: {} of {} bytes untransferred",
                                remaining,
                                requested
                            );
                        }
                        td.status = None;
                    }
                    CompletionCode::ShortPacket => td.status = None,
                    CompletionCode::UsbTransactionError => {
                        let retry = !no_soft_retry && {
                            let tries = ep.err_count;
                            ep.err_count += 1;
                            tries < max_soft_retry
                        } && !behind_tt;
                        if retry {
                            td.status = None;
                            #[cfg(feature = "defmt")]
                            defmt::debug!("soft retry {} on slot {} ep {}", ep.err_count, slot_id, ep_index);
                            self.recovery.record(code, RecoveryAction::SoftRetry);
                            if let Err(_e) = self.handle_halted_endpoint(hw, slot_id, ep_index, Some(td_id), ResetType::Soft) {
                                #[cfg(feature = "defmt")]
                                defmt::warn!("soft retry reset failed: {}", _e);
                            }
                            return;
                        }
                    }
                    _ => {}
                }
                if at_end {
                    requested.saturating_sub(remaining)
                } else {
                    (sum + ep_trb_len).saturating_sub(remaining)
                }
            }
        };

        urb.actual_length = actual as usize;
        if remaining > requested {
            #[cfg(feature = "defmt")]
            defmt::warn!("bad transfer length {} in event", remaining);
            urb.actual_length = 0;
        }
        self.finish_td(hw, td_id, code);
    }

    /// Transfer events that carry no usable TRB pointer, or point into no
    /// known stream ring
    fn handle_transferless_tx_event<P: Platform>(
        &mut self,
        hw: &P,
        slot_id: u8,
        ep_index: u8,
        code: CompletionCode,
    ) -> Result<()> {
        match code {
            CompletionCode::StallError
            | CompletionCode::UsbTransactionError
            | CompletionCode::InvalidStreamType
            | CompletionCode::InvalidStreamIdError => {
                let max_soft_retry = self.config.max_soft_retry;
                let ep = self.slots.ep_mut(slot_id, ep_index).ok_or(XhciError::NoDevice)?;
                let tries = ep.err_count;
                ep.err_count += 1;
                #[cfg(feature = "defmt")]
                defmt::debug!("stream transaction error on ep {} with no stream id", ep_index);
                let (reset, action) = if tries > max_soft_retry {
                    (ResetType::Hard, RecoveryAction::ResetEndpoint)
                } else {
                    (ResetType::Soft, RecoveryAction::SoftRetry)
                };
                self.recovery.record(code, action);
                self.handle_halted_endpoint(hw, slot_id, ep_index, None, reset)
            }
            CompletionCode::RingUnderrun | CompletionCode::RingOverrun | CompletionCode::StoppedLengthInvalid => Ok(()),
            CompletionCode::EventLostError | CompletionCode::VfEventRingFull => {
                #[cfg(feature = "defmt")]
                defmt::warn!("transfer event {} for slot {} ep {} without a TRB", code, slot_id, ep_index);
                self.recovery.record(code, RecoveryAction::None);
                Ok(())
            }
            _ => {
                #[cfg(feature = "defmt")]
                defmt::error!("transfer event {} for unknown stream ring on slot {} ep {}", code, slot_id, ep_index);
                Err(XhciError::NoDevice)
            }
        }
    }

    /// A Success after a short packet (or an isochronous error on some
    /// controllers) that repeats a completion already handled
    fn spurious_success(&self, ring: &Ring, isoc: bool) -> bool {
        let old = ring.old_trb_comp_code;
        self.config.spurious_success.contains(old) || (isoc && self.config.spurious_success_isoc.contains(old))
    }

    fn check_endpoint_halted<P: Platform>(
        &mut self,
        hw: &P,
        slot_id: u8,
        ep_index: u8,
        td: Option<TdId>,
        code: CompletionCode,
    ) -> Result<()> {
        if halted_host_endpoint(hw.endpoint_state(slot_id, ep_index), code) {
            self.reset_halted_endpoint(hw, slot_id, ep_index, td, code);
        }
        Ok(())
    }

    /// Handle one Transfer Event.
    ///
    /// `InvalidTransfer` means the event matched no queued TD; the caller
    /// logs it and carries on.
    pub(crate) fn handle_tx_event<P: Platform>(&mut self, hw: &P, ev: &TransferEvent) -> Result<()> {
        let slot_id = ev.slot_id;
        let Some(ep_index) = ev.ep_index() else {
            #[cfg(feature = "defmt")]
            defmt::error!("transfer event with endpoint id 0 on slot {}", slot_id);
            return Err(XhciError::NoDevice);
        };
        let Some(ep) = self.slots.ep(slot_id, ep_index) else {
            #[cfg(feature = "defmt")]
            defmt::error!("transfer event for unknown slot {} ep {}", slot_id, ep_index);
            return Err(XhciError::NoDevice);
        };
        if hw.endpoint_state(slot_id, ep_index) == EpContextState::Disabled {
            #[cfg(feature = "defmt")]
            defmt::error!("transfer event for disabled slot {} ep {}", slot_id, ep_index);
            return Err(XhciError::NoDevice);
        }
        let isoc = ep.config.transfer_type == TransferType::Isochronous;
        let stream = match ev.code {
            CompletionCode::EventLostError | CompletionCode::VfEventRingFull => None,
            _ => ep.stream_for_dma(ev.trb_pointer),
        };
        let Some(stream_id) = stream else {
            return self.handle_transferless_tx_event(hw, slot_id, ep_index, ev.code);
        };

        let ptr = ev.trb_pointer;
        let mut code = ev.code;
        let mut status = None;
        let mut xrun = false;
        match code {
            CompletionCode::Success => {
                if ev.transfer_length != 0 {
                    #[cfg(feature = "defmt")]
                    defmt::debug!("success with {} bytes left on slot {} ep {}", ev.transfer_length, slot_id, ep_index);
                    code = CompletionCode::ShortPacket;
                }
            }
            CompletionCode::ShortPacket
            | CompletionCode::Stopped
            | CompletionCode::StoppedLengthInvalid
            | CompletionCode::StoppedShortPacket => {
                #[cfg(feature = "defmt")]
                defmt::trace!("{} on slot {} ep {}", code, slot_id, ep_index);
            }
            CompletionCode::StallError => status = Some(XhciError::Stall),
            CompletionCode::SplitTransactionError => status = Some(XhciError::SplitTransaction),
            CompletionCode::UsbTransactionError => status = Some(XhciError::TransactionError),
            CompletionCode::BabbleDetectedError => status = Some(XhciError::Babble),
            CompletionCode::TrbError => {
                #[cfg(feature = "defmt")]
                defmt::warn!("TRB error on slot {} ep {}", slot_id, ep_index);
                status = Some(XhciError::TrbError);
            }
            CompletionCode::DataBufferError => {
                #[cfg(feature = "defmt")]
                defmt::warn!("controller could not reach memory in time on slot {} ep {}", slot_id, ep_index);
                status = Some(XhciError::BufferError);
            }
            CompletionCode::BandwidthOverrun | CompletionCode::IsochBufferOverrun => {
                #[cfg(feature = "defmt")]
                defmt::warn!("{} on slot {} ep {}", code, slot_id, ep_index);
            }
            CompletionCode::RingUnderrun | CompletionCode::RingOverrun => {
                // Isochronous ring ran empty
                #[cfg(feature = "defmt")]
                defmt::debug!("{} on slot {} ep {}", code, slot_id, ep_index);
                xrun = true;
            }
            CompletionCode::MissedServiceError => {
                if let Some(ep) = self.slots.ep_mut(slot_id, ep_index) {
                    ep.skip = true;
                }
                #[cfg(feature = "defmt")]
                defmt::debug!("missed service on slot {} ep {}, skipping", slot_id, ep_index);
            }
            CompletionCode::NoPingResponseError => {
                if let Some(ep) = self.slots.ep_mut(slot_id, ep_index) {
                    ep.skip = true;
                }
                return Ok(());
            }
            CompletionCode::IncompatibleDeviceError => {
                #[cfg(feature = "defmt")]
                defmt::warn!("incompatible device on slot {}", slot_id);
                status = Some(XhciError::IncompatibleDevice);
            }
            CompletionCode::VendorInfo(_) => {}
            _ => {
                #[cfg(feature = "defmt")]
                defmt::warn!("unknown event condition {} on slot {} ep {}", code, slot_id, ep_index);
                let skip = self.slots.ep(slot_id, ep_index).is_some_and(|ep| ep.skip);
                if !skip {
                    return Ok(());
                }
            }
        }

        // A TD that errored mid-way completes when an event lands outside it
        let first = self
            .slots
            .ep(slot_id, ep_index)
            .and_then(|ep| ep.ring_for_stream(stream_id))
            .and_then(|ring| {
                let id = *ring.td_list.front()?;
                let td = self.tds.get(id)?;
                (td.error_mid_td && ring.trb_in_td(td.start, td.end, ptr).is_none()).then_some(id)
            });
        if let Some(id) = first {
            #[cfg(feature = "defmt")]
            defmt::debug!("missing completion event after mid TD error");
            self.dequeue_td(id);
        }

        // Without a TRB pointer the missed TDs are skipped on the next event
        if code == CompletionCode::MissedServiceError && ptr == 0 {
            return Ok(());
        }

        let (td_id, ep_trb) = loop {
            let ep = self.slots.ep(slot_id, ep_index).ok_or(XhciError::NoDevice)?;
            let skip = ep.skip;
            let ring = ep.ring_for_stream(stream_id).ok_or(XhciError::InvalidStream)?;
            let Some(&td_id) = ring.td_list.front() else {
                if !code.is_stopped() && !xrun && !self.spurious_success(ring, isoc) {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("event for slot {} ep {} with no TDs queued", slot_id, ep_index);
                }
                if let Some(ep) = self.slots.ep_mut(slot_id, ep_index) {
                    ep.skip = false;
                }
                return self.check_endpoint_halted(hw, slot_id, ep_index, None, code);
            };
            let td = self.tds.get(td_id).ok_or(XhciError::InvalidTransfer)?;

            if ring.trb_in_td(td.start, td.end, ptr).is_some() {
                let ep_trb = ring.dma_to_cursor(ptr).ok_or(XhciError::InvalidTransfer)?;
                if skip {
                    #[cfg(feature = "defmt")]
                    defmt::debug!("found TD, clearing skip on slot {} ep {}", slot_id, ep_index);
                    if let Some(ep) = self.slots.ep_mut(slot_id, ep_index) {
                        ep.skip = false;
                    }
                }
                break (td_id, ep_trb);
            }

            if skip && isoc {
                // Unlikely to match any TD; don't skip them all
                if code == CompletionCode::StoppedLengthInvalid {
                    return Ok(());
                }
                self.skip_isoc_td(td_id, status);
                let drained = self
                    .slots
                    .ep(slot_id, ep_index)
                    .and_then(|ep| ep.ring_for_stream(stream_id))
                    .map_or(true, |ring| ring.td_list.is_empty());
                if !drained {
                    // After an xrun nobody knows how many TDs were missed
                    if xrun {
                        return Ok(());
                    }
                    continue;
                }
                #[cfg(feature = "defmt")]
                defmt::debug!("all TDs skipped on slot {} ep {}", slot_id, ep_index);
                if let Some(ep) = self.slots.ep_mut(slot_id, ep_index) {
                    ep.skip = false;
                }
                return self.check_endpoint_halted(hw, slot_id, ep_index, None, code);
            }

            // TD queued after the xrun
            if xrun {
                return Ok(());
            }
            // Force stopped event on the TRB before the current TD
            if code.is_stopped() && code != CompletionCode::StoppedShortPacket {
                return Ok(());
            }
            if self.spurious_success(ring, isoc) {
                #[cfg(feature = "defmt")]
                defmt::debug!("spurious event {:#x} after {}", ptr, ring.old_trb_comp_code);
                if let Some(ring) = self
                    .slots
                    .ep_mut(slot_id, ep_index)
                    .and_then(|ep| ep.ring_for_stream_mut(stream_id))
                {
                    ring.old_trb_comp_code = CompletionCode::Invalid;
                }
                return Ok(());
            }
            #[cfg(feature = "defmt")]
            defmt::error!(
                "event {:#x} for ep {} code {} not part of TD at {:#x}",
                ptr,
                ep_index,
                code,
                ring.trb_virt_to_dma(td.start)
            );
            return Err(XhciError::InvalidTransfer);
        };

        let ring = self
            .slots
            .ep_mut(slot_id, ep_index)
            .and_then(|ep| ep.ring_for_stream_mut(stream_id))
            .ok_or(XhciError::InvalidStream)?;
        ring.old_trb_comp_code = code;
        if xrun {
            return Ok(());
        }
        // A killed TD can leave a No-Op that still raises a stall
        if ring.trb(ep_trb).is_noop() {
            return self.check_endpoint_halted(hw, slot_id, ep_index, Some(td_id), code);
        }
        if let Some(td) = self.tds.get_mut(td_id) {
            td.status = status;
        }

        let transfer_type = self
            .slots
            .ep(slot_id, ep_index)
            .map(|ep| ep.config.transfer_type)
            .ok_or(XhciError::NoDevice)?;
        match transfer_type {
            TransferType::Control => self.process_ctrl_td(hw, td_id, ep_trb, ev),
            TransferType::Isochronous => self.process_isoc_td(hw, td_id, ep_trb, ev),
            TransferType::Bulk | TransferType::Interrupt => self.process_bulk_intr_td(hw, td_id, ep_trb, ev),
        }
        Ok(())
    }

    fn handle_port_status<P: Platform>(&mut self, hw: &P, ev: &PortStatusChangeEvent) {
        if ev.code != CompletionCode::Success {
            #[cfg(feature = "defmt")]
            defmt::warn!("failed port status event: {}", ev.code);
        }
        let port_id = ev.port_id;
        if port_id == 0 || port_id > self.regs.max_ports() {
            #[cfg(feature = "defmt")]
            defmt::warn!("port change event with invalid port id {}", port_id);
            return;
        }
        let portsc = self.regs.portsc(hw, port_id);
        #[cfg(feature = "defmt")]
        defmt::debug!("port {} status change, PORTSC {:#x}", port_id, portsc);
        self.outbox.push(Notification::PortStatusChange { port_id, portsc });
    }

    fn handle_device_notification(&mut self, ev: &DeviceNotificationEvent) {
        if self.slots.get(ev.slot_id).is_none() {
            #[cfg(feature = "defmt")]
            defmt::warn!("device notification for unused slot {}", ev.slot_id);
            return;
        }
        self.outbox.push(Notification::DeviceNotification {
            slot_id: ev.slot_id,
            notification_type: ev.notification_type,
            data: ev.data,
        });
    }

    /// Dispatch one event TRB. Fails once the controller is dying.
    fn handle_event_trb<P: Platform>(&mut self, hw: &P, trb: Trb) -> Result<()> {
        match Event::decode(&trb) {
            Event::CommandCompletion(ev) => self.handle_cmd_completion(hw, &ev),
            Event::PortStatusChange(ev) => self.handle_port_status(hw, &ev),
            Event::Transfer(ev) => {
                if let Err(e) = self.handle_tx_event(hw, &ev) {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("transfer event for slot {} dropped: {}", ev.slot_id, e);
                    if e == XhciError::InvalidTransfer {
                        self.stray_events = self.stray_events.wrapping_add(1);
                    }
                }
            }
            Event::DeviceNotification(ev) => self.handle_device_notification(&ev),
            Event::MfindexWrap { .. } => {
                self.mfindex_wraps = self.mfindex_wraps.wrapping_add(1);
            }
            Event::Vendor { trb_type: _trb_type } => {
                #[cfg(feature = "defmt")]
                defmt::debug!("vendor event type {} ignored", _trb_type);
            }
            Event::Unknown { trb_type: _trb_type } => {
                #[cfg(feature = "defmt")]
                defmt::warn!("unknown event type {}", _trb_type);
            }
        }
        // A handler may have declared the controller dead
        if self.hc.contains(HcState::DYING) {
            #[cfg(feature = "defmt")]
            defmt::debug!("host dying, leaving the event handler");
            return Err(XhciError::Shutdown);
        }
        Ok(())
    }

    /// Write the software dequeue back to ERDP.
    ///
    /// Writes must move ERDP forward, so an unchanged pointer is only written
    /// when EHB needs clearing.
    fn update_erst_dequeue<P: Platform>(&mut self, hw: &P, clear_ehb: bool) {
        let ir = self.config.interrupter;
        let current = self.regs.erdp(hw, ir);
        let deq = self.events.dequeue_dma();
        if (current & ERST_PTR_MASK) == (deq & ERST_PTR_MASK) && !clear_ehb {
            return;
        }
        let mut value = self.events.erdp_value();
        if clear_ehb {
            value |= ERST_EHB;
        }
        self.regs.write_erdp(hw, ir, value);
    }

    /// Consume every event the controller has produced. Returns the number
    /// of events handled.
    pub(crate) fn handle_events<P: Platform>(&mut self, hw: &P) -> u32 {
        let ir = self.config.interrupter;
        if !hw.ip_autoclear() {
            let iman = self.regs.iman(hw, ir);
            self.regs.write_iman(hw, ir, iman | Iman::PENDING.bits());
        }

        if self.hc.intersects(HcState::DYING | HcState::HALTED) {
            #[cfg(feature = "defmt")]
            defmt::debug!("host dying or halted, ignoring interrupt");
            let erdp = self.regs.erdp(hw, ir);
            self.regs.write_erdp(hw, ir, erdp | ERST_EHB);
            return 0;
        }

        let mut handled = 0;
        let mut event_loop = 0;
        while let Some(trb) = self.events.current() {
            let result = self.handle_event_trb(hw, trb);
            handled += 1;

            // Half a segment in one go: publish progress and make isoc
            // TDs interrupt more often
            let publish = event_loop > TRBS_PER_SEGMENT / 2;
            event_loop += 1;
            if publish {
                self.update_erst_dequeue(hw, false);
                if self.isoc_bei_interval > AVOID_BEI_INTERVAL_MIN {
                    self.isoc_bei_interval /= 2;
                }
                event_loop = 0;
            }

            self.events.advance();
            if result.is_err() {
                break;
            }
        }
        self.update_erst_dequeue(hw, true);
        handled
    }

    /// Interrupt entry: check USBSTS, acknowledge EINT and drain the event ring
    pub(crate) fn irq<P: Platform>(&mut self, hw: &P) -> IrqStatus {
        let raw = self.regs.usbsts(hw);
        if raw == u32::MAX {
            #[cfg(feature = "defmt")]
            defmt::error!("USBSTS reads all ones, controller removed");
            self.hc_died(hw);
            return IrqStatus::Handled { events: 0 };
        }
        let status = UsbSts::from_bits_retain(raw);
        if !status.contains(UsbSts::EVENT_INTERRUPT) {
            return IrqStatus::NotOurs;
        }
        if status.contains(UsbSts::HOST_CONTROLLER_ERROR) {
            #[cfg(feature = "defmt")]
            defmt::warn!("host controller error");
            return IrqStatus::Handled { events: 0 };
        }
        if status.contains(UsbSts::HOST_SYSTEM_ERROR) {
            #[cfg(feature = "defmt")]
            defmt::warn!("host system error, halting");
            self.halt(hw);
            return IrqStatus::Handled { events: 0 };
        }
        // Clear EINT first so other interrupters can raise it again
        self.regs.write_usbsts(hw, (status | UsbSts::EVENT_INTERRUPT).bits());
        let events = self.handle_events(hw);
        IrqStatus::Handled { events }
    }

    /// The controller stopped responding: fail every command and transfer.
    ///
    /// Idempotent; new work is refused with `Shutdown` from here on.
    pub(crate) fn hc_died<P: Platform>(&mut self, hw: &P) {
        if self.hc.contains(HcState::DYING) {
            return;
        }
        #[cfg(feature = "defmt")]
        defmt::error!("xHCI host controller not responding, assume dead");
        self.hc.insert(HcState::DYING);
        hw.set_enabled(false);
        self.cleanup_command_queue();

        for (slot_id, ep_index) in self.slots.endpoint_ids() {
            self.kill_endpoint_tds(slot_id, ep_index);
        }
        self.outbox.push(Notification::HostDied);
    }

    /// Give back every TD of an endpoint with `Shutdown`
    pub(crate) fn kill_endpoint_tds(&mut self, slot_id: u8, ep_index: u8) {
        let Some(ep) = self.slots.ep_mut(slot_id, ep_index) else {
            return;
        };
        let mut doomed: Vec<TdId> = Vec::new();
        match ep.streams.as_mut() {
            Some(streams) if ep.ep_state.intersects(EpState::HAS_STREAMS | EpState::GETTING_NO_STREAMS) => {
                for ring in streams.rings.iter_mut().flatten() {
                    doomed.extend(ring.td_list.drain(..));
                }
            }
            _ => doomed.extend(ep.ring.td_list.drain(..)),
        }
        doomed.extend(ep.cancelled_td_list.drain(..));
        #[cfg(feature = "defmt")]
        defmt::debug!("killing {} TDs on slot {} ep {}", doomed.len(), slot_id, ep_index);
        for td_id in doomed {
            if let Some(td) = self.tds.get_mut(td_id) {
                td.on_td_list = false;
                td.on_cancelled_list = false;
            }
            self.td_cleanup_with(td_id, Some(XhciError::Shutdown), true);
        }
    }
}
