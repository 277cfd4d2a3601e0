//! Transfer cancellation tests
//!
//! Cancelling stops the endpoint, turns the cancelled TDs into No-Ops and,
//! when the controller stopped inside one, moves its dequeue pointer past it
//! with Set TR Dequeue before the transfer is given back.

mod common;

use common::{trb_dma, Harness};
use xhci_ring::trb::TrbType;
use xhci_ring::{
    CommandTrb, CompletionCode, EndpointConfig, EpState, HostConfig, TransferBuffer, TransferId,
    TransferRequest, XhciError,
};

const SLOT: u8 = 1;
const EP: u8 = 2;
const EP_DOORBELL: (u8, u32) = (SLOT, EP as u32 + 1);
const CMD_DOORBELL: (u8, u32) = (0, 0);

/// Two queued bulk OUT transfers: a two-TRB TD in slots 0-1 and a
/// single-TRB TD in slot 2
fn two_transfers() -> (Harness, u64, TransferId, TransferId) {
    let h = Harness::new(HostConfig::default());
    h.add_device(SLOT);
    let seg0 = h.add_endpoint(
        SLOT,
        EP,
        EndpointConfig {
            ring_segments: Some(1),
            ..EndpointConfig::bulk(false, 512)
        },
    );
    let dma = &h.hc().dma;
    let sg = TransferBuffer::Sg(vec![dma.buffer(512, 1), dma.buffer(512, 2)]);
    let first = h.ctrl.submit(TransferRequest::bulk(SLOT, EP, sg)).unwrap();
    let second = h.ctrl.submit(TransferRequest::bulk(SLOT, EP, h.buffer(256))).unwrap();
    h.hc().take_doorbells();
    (h, seg0, first, second)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The controller stopped inside the cancelled TD: it is skipped with
    /// Set TR Dequeue and only given back once that completes
    #[test]
    fn test_cancel_td_under_hardware_dequeue() {
        let (h, seg0, first, second) = two_transfers();

        h.ctrl.cancel(first).unwrap();
        assert_eq!(
            h.hc().command_trb(0).trb_type(),
            Some(TrbType::StopEndpoint),
            "stop endpoint queued first"
        );
        assert_eq!(h.hc().take_doorbells(), vec![CMD_DOORBELL]);
        assert!(h.take().is_empty());
        let state = h.ctrl.endpoint_state(SLOT, EP).unwrap();
        assert!(state.contains(EpState::STOP_CMD_PENDING));

        h.hc().set_ep_dequeue(SLOT, EP, trb_dma(seg0, 1));
        h.hc().complete_command(0, CompletionCode::Success);
        h.interrupt();

        // Cancelled TD is now No-Ops, the other one untouched
        assert_eq!(h.trb(seg0, 0).trb_type(), Some(TrbType::TransferNoop));
        assert_eq!(h.trb(seg0, 1).trb_type(), Some(TrbType::TransferNoop));
        assert_eq!(h.trb(seg0, 2).trb_type(), Some(TrbType::Normal));

        let set_deq = CommandTrb::decode(&h.hc().command_trb(1)).expect("command TRB");
        assert_eq!(
            set_deq,
            CommandTrb::SetTrDequeue {
                slot_id: SLOT,
                ep_index: EP,
                stream_id: 0,
                dequeue: trb_dma(seg0, 2),
                cycle: true,
                sct: 0,
            }
        );
        let doorbells = h.hc().take_doorbells();
        assert!(doorbells.contains(&CMD_DOORBELL));
        assert!(!doorbells.contains(&EP_DOORBELL), "endpoint stays stopped while dequeue moves");
        assert!(h.transfers().is_empty(), "not given back before the dequeue moved");

        h.hc().set_ep_dequeue(SLOT, EP, trb_dma(seg0, 2) | 1);
        h.hc().complete_command(1, CompletionCode::Success);
        h.interrupt();

        let done = h.transfers();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, first);
        assert_eq!(done[0].status, Some(XhciError::Cancelled));
        assert_eq!(h.hc().take_doorbells(), vec![EP_DOORBELL]);
        assert_eq!(h.ctrl.endpoint_state(SLOT, EP), Some(EpState::empty()));

        h.hc()
            .post_transfer_event(SLOT, EP, trb_dma(seg0, 2), 0, CompletionCode::Success);
        h.interrupt();
        let done = h.transfers();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, second);
        assert!(done[0].is_ok());
        assert_eq!(done[0].actual_length, 256);
    }

    /// One Set TR Dequeue at a time per endpoint: a second stream stopped
    /// inside a cancelled TD waits until the first dequeue move completed
    #[test]
    fn test_stream_dequeue_moves_one_at_a_time() {
        let h = Harness::new(HostConfig::default());
        h.add_device(SLOT);
        h.add_endpoint(SLOT, EP, EndpointConfig::bulk(false, 512));
        let ctx = h.ctrl.alloc_streams(SLOT, EP, 2).unwrap();
        let ring_of = |stream: u64| h.hc().dma.read_u64(ctx + stream * 16) & !0xf;
        let (s1, s2) = (ring_of(1), ring_of(2));

        let a = h
            .ctrl
            .submit(TransferRequest::bulk(SLOT, EP, h.buffer(64)).with_stream(1))
            .unwrap();
        let b = h
            .ctrl
            .submit(TransferRequest::bulk(SLOT, EP, h.buffer(64)).with_stream(2))
            .unwrap();
        h.hc().take_doorbells();

        // Both stream contexts still point at their first TRB
        h.ctrl.cancel(a).unwrap();
        h.ctrl.cancel(b).unwrap();
        assert_eq!(h.hc().command_trb(0).trb_type(), Some(TrbType::StopEndpoint));
        assert_eq!(h.hc().command_trb(1).trb_type(), None, "one stop for both cancels");
        h.hc().complete_command(0, CompletionCode::Success);
        h.interrupt();

        assert_eq!(h.trb(s1, 0).trb_type(), Some(TrbType::TransferNoop));
        assert_eq!(h.trb(s2, 0).trb_type(), Some(TrbType::TransferNoop));
        assert_eq!(
            CommandTrb::decode(&h.hc().command_trb(1)),
            Some(CommandTrb::SetTrDequeue {
                slot_id: SLOT,
                ep_index: EP,
                stream_id: 1,
                dequeue: trb_dma(s1, 1),
                cycle: true,
                sct: 1,
            })
        );
        assert_eq!(h.hc().command_trb(2).trb_type(), None, "second stream waits");
        assert!(h.transfers().is_empty());

        h.hc().dma.write_u64(ctx + 16, trb_dma(s1, 1) | 1);
        h.hc().complete_command(1, CompletionCode::Success);
        h.interrupt();

        let done = h.transfers();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, a);
        assert_eq!(done[0].status, Some(XhciError::Cancelled));
        assert_eq!(
            CommandTrb::decode(&h.hc().command_trb(2)),
            Some(CommandTrb::SetTrDequeue {
                slot_id: SLOT,
                ep_index: EP,
                stream_id: 2,
                dequeue: trb_dma(s2, 1),
                cycle: true,
                sct: 1,
            })
        );
        let state = h.ctrl.endpoint_state(SLOT, EP).unwrap();
        assert!(state.contains(EpState::SET_DEQ_PENDING));

        h.hc().dma.write_u64(ctx + 2 * 16, trb_dma(s2, 1) | 1);
        h.hc().complete_command(2, CompletionCode::Success);
        h.interrupt();

        let done = h.transfers();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, b);
        assert_eq!(done[0].status, Some(XhciError::Cancelled));
        assert_eq!(h.hc().command_trb(3).trb_type(), None);
        assert_eq!(h.ctrl.endpoint_state(SLOT, EP), Some(EpState::HAS_STREAMS));
    }

    /// A TD the controller has not reached is given back as soon as the
    /// endpoint stopped
    #[test]
    fn test_cancel_td_ahead_of_controller() {
        let (h, seg0, first, second) = two_transfers();

        h.ctrl.cancel(second).unwrap();
        assert_eq!(h.hc().take_doorbells(), vec![CMD_DOORBELL]);
        h.hc().set_ep_dequeue(SLOT, EP, trb_dma(seg0, 0));
        h.hc().complete_command(0, CompletionCode::Success);
        h.interrupt();

        assert_eq!(h.trb(seg0, 2).trb_type(), Some(TrbType::TransferNoop));
        assert_eq!(h.trb(seg0, 0).trb_type(), Some(TrbType::Normal));
        let done = h.transfers();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, second);
        assert_eq!(done[0].status, Some(XhciError::Cancelled));
        assert_eq!(h.ctrl.pending_commands(), 0, "no dequeue move needed");
        assert_eq!(h.hc().take_doorbells(), vec![EP_DOORBELL]);

        h.hc()
            .post_transfer_event(SLOT, EP, trb_dma(seg0, 1), 0, CompletionCode::Success);
        h.interrupt();
        let done = h.transfers();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, first);
        assert_eq!(done[0].actual_length, 1024);
    }

    /// Cancelling twice queues one Stop Endpoint
    #[test]
    fn test_double_cancel_is_noop() {
        let (h, _seg0, first, second) = two_transfers();

        h.ctrl.cancel(first).unwrap();
        h.ctrl.cancel(first).unwrap();
        assert_eq!(h.ctrl.pending_commands(), 1);
        // A second transfer joins the pending stop
        h.ctrl.cancel(second).unwrap();
        assert_eq!(h.ctrl.pending_commands(), 1);
        assert_eq!(h.hc().take_doorbells(), vec![CMD_DOORBELL]);

        h.hc().complete_command(0, CompletionCode::Success);
        h.interrupt();
        let mut ids: Vec<_> = h.transfers().into_iter().map(|t| t.id).collect();
        ids.sort();
        assert_eq!(ids, vec![first, second]);

        assert_eq!(h.ctrl.cancel(first), Err(XhciError::InvalidParameter));
    }

    /// Nothing processes the rings of a halted controller, so cancelled
    /// transfers come back immediately
    #[test]
    fn test_cancel_on_halted_controller() {
        let (h, _seg0, first, _second) = two_transfers();
        h.ctrl.halt();

        h.ctrl.cancel(first).unwrap();
        let done = h.transfers();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, first);
        assert_eq!(done[0].status, Some(XhciError::Cancelled));
        assert_eq!(h.ctrl.pending_commands(), 0);
    }

    /// Stop Endpoint racing a transfer that already completed: the
    /// completion wins and the late cancel finds nothing to do
    #[test]
    fn test_cancel_after_completion() {
        let (h, seg0, first, _second) = two_transfers();
        h.hc()
            .post_transfer_event(SLOT, EP, trb_dma(seg0, 1), 0, CompletionCode::Success);
        h.interrupt();
        assert_eq!(h.transfers().len(), 1);
        assert_eq!(h.ctrl.cancel(first), Err(XhciError::InvalidParameter));
        assert_eq!(h.ctrl.pending_commands(), 0);
    }
}
