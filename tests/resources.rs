//! Resource management tests
//!
//! Rings, bounce buffers and stream context arrays come from the platform's
//! coherent allocator and must all go back to it: when an endpoint is
//! dropped, when streams are torn down and when the controller shuts down.

mod common;

use std::sync::{Arc, Mutex};

use common::{trb_dma, Harness, Inbox, MockHc};
use xhci_ring::{
    CompletionCode, EndpointConfig, HostConfig, IrqStatus, Notification, SlotInfo, TransferBuffer,
    TransferRequest, UsbSpeed, XhciController, XhciError,
};

const SLOT: u8 = 1;
const EP: u8 = 2;

fn bulk_out() -> EndpointConfig {
    EndpointConfig::bulk(false, 512)
}

/// Shared controller, so platform callbacks can reenter it
fn shared_controller() -> (Arc<XhciController<MockHc>>, Inbox) {
    let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&inbox);
    let ctrl = XhciController::new(MockHc::new(), HostConfig::default(), move |n| sink.lock().unwrap().push(n))
        .expect("controller init");
    ctrl.run().expect("controller run");
    ctrl.add_slot(
        SLOT,
        SlotInfo {
            speed: UsbSpeed::High,
            root_port: 1,
            tt: None,
        },
    )
    .expect("add slot");
    (Arc::new(ctrl), inbox)
}

fn completions(inbox: &Inbox) -> Vec<xhci_ring::TransferCompletion> {
    std::mem::take(&mut *inbox.lock().unwrap())
        .into_iter()
        .filter_map(|n| match n {
            Notification::Transfer(done) => Some(done),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Each ring segment of a bulk endpoint carries a bounce buffer
    #[test]
    fn test_endpoint_rings_released_on_drop() {
        let h = Harness::new(HostConfig::default().with_transfer_ring_segments(2));
        h.add_device(SLOT);
        let idle = h.hc().dma.live_regions();

        h.add_endpoint(SLOT, EP, bulk_out());
        assert_eq!(h.hc().dma.live_regions(), idle + 4);

        let id = h.ctrl.submit(TransferRequest::bulk(SLOT, EP, h.buffer(64))).unwrap();
        h.ctrl.drop_endpoint(SLOT, EP).unwrap();
        assert_eq!(h.hc().dma.live_regions(), idle);

        let done = h.transfers();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, id);
        assert_eq!(done[0].status, Some(XhciError::Shutdown));
        assert_eq!(h.ctrl.drop_endpoint(SLOT, EP), Err(XhciError::NoDevice));
    }

    /// Adding an endpoint twice or to an unknown slot is refused
    #[test]
    fn test_endpoint_registration_errors() {
        let h = Harness::new(HostConfig::default());
        assert_eq!(h.ctrl.add_endpoint(SLOT, EP, bulk_out()), Err(XhciError::NoDevice));
        h.add_device(SLOT);
        h.add_endpoint(SLOT, EP, bulk_out());
        assert_eq!(h.ctrl.add_endpoint(SLOT, EP, bulk_out()), Err(XhciError::InvalidState));
        assert_eq!(h.ctrl.add_endpoint(SLOT, 31, bulk_out()), Err(XhciError::InvalidParameter));
    }

    /// Removing a slot drops all of its endpoints
    #[test]
    fn test_remove_slot() {
        let h = Harness::new(HostConfig::default());
        let idle = h.hc().dma.live_regions();
        h.add_device(SLOT);
        h.add_endpoint(SLOT, 0, EndpointConfig::control(64));
        h.add_endpoint(SLOT, EP, bulk_out());
        h.ctrl.submit(TransferRequest::bulk(SLOT, EP, h.buffer(64))).unwrap();

        h.ctrl.remove_slot(SLOT).unwrap();
        assert_eq!(h.hc().dma.live_regions(), idle);
        assert_eq!(h.transfers().len(), 1);
        assert_eq!(h.ctrl.remove_slot(SLOT), Err(XhciError::NoDevice));
        assert_eq!(h.ctrl.endpoint_state(SLOT, EP), None);
    }

    /// Stream rings are separate producers selected by stream id
    #[test]
    fn test_stream_transfers() {
        let h = Harness::new(HostConfig::default());
        h.add_device(SLOT);
        h.add_endpoint(SLOT, EP, bulk_out());
        let before = h.hc().dma.live_regions();

        let ctx = h.ctrl.alloc_streams(SLOT, EP, 4).unwrap();
        assert!(h.hc().dma.live_regions() > before);
        let entry = h.hc().dma.read_u64(ctx + 3 * 16);
        assert_eq!(entry & 1, 1, "stream rings start with DCS set");
        let stream3 = entry & !0xf;

        assert_eq!(
            h.ctrl.submit(TransferRequest::bulk(SLOT, EP, h.buffer(64))),
            Err(XhciError::InvalidStream),
            "stream endpoints need a stream id"
        );
        assert_eq!(
            h.ctrl.submit(TransferRequest::bulk(SLOT, EP, h.buffer(64)).with_stream(5)),
            Err(XhciError::InvalidStream)
        );

        h.hc().take_doorbells();
        let id = h
            .ctrl
            .submit(TransferRequest::bulk(SLOT, EP, h.buffer(64)).with_stream(3))
            .unwrap();
        assert_eq!(h.hc().take_doorbells(), vec![(SLOT, (u32::from(EP) + 1) | 3 << 16)]);
        assert!(h.trb(stream3, 0).cycle());
        let empty = h.ctrl.ring_trbs_free(SLOT, EP, 1).unwrap();
        assert_eq!(h.ctrl.ring_trbs_free(SLOT, EP, 3), Some(empty - 1));

        h.hc()
            .post_transfer_event(SLOT, EP, trb_dma(stream3, 0), 0, CompletionCode::Success);
        h.interrupt();
        let done = h.transfers();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, id);
        assert_eq!(done[0].stream_id, 3);
        assert!(done[0].is_ok());

        // Streams go away with anything still queued on them
        let pending = h
            .ctrl
            .submit(TransferRequest::bulk(SLOT, EP, h.buffer(64)).with_stream(2))
            .unwrap();
        h.ctrl.free_streams(SLOT, EP).unwrap();
        assert_eq!(h.hc().dma.live_regions(), before);
        let done = h.transfers();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, pending);
        assert_eq!(done[0].status, Some(XhciError::Shutdown));
        assert_eq!(h.ctrl.free_streams(SLOT, EP), Err(XhciError::InvalidState));
    }

    #[test]
    fn test_streams_need_idle_bulk_endpoint() {
        let h = Harness::new(HostConfig::default());
        h.add_device(SLOT);
        h.add_endpoint(SLOT, 0, EndpointConfig::control(64));
        h.add_endpoint(SLOT, EP, bulk_out());
        assert_eq!(h.ctrl.alloc_streams(SLOT, 0, 4), Err(XhciError::InvalidParameter));
        assert_eq!(h.ctrl.alloc_streams(SLOT, EP, 0), Err(XhciError::InvalidParameter));

        h.ctrl.submit(TransferRequest::bulk(SLOT, EP, h.buffer(64))).unwrap();
        assert_eq!(h.ctrl.alloc_streams(SLOT, EP, 4), Err(XhciError::Busy));
    }

    /// An idle ring can be reinitialized; a busy one cannot
    #[test]
    fn test_reset_endpoint_ring() {
        let h = Harness::new(HostConfig::default());
        h.add_device(SLOT);
        let seg0 = h.add_endpoint(SLOT, EP, bulk_out());
        h.ctrl.submit(TransferRequest::bulk(SLOT, EP, h.buffer(64))).unwrap();
        assert_eq!(h.ctrl.reset_endpoint_ring(SLOT, EP), Err(XhciError::Busy));

        h.hc()
            .post_transfer_event(SLOT, EP, trb_dma(seg0, 0), 0, CompletionCode::Success);
        h.interrupt();
        assert_eq!(h.transfers().len(), 1);

        assert_eq!(h.ctrl.reset_endpoint_ring(SLOT, EP), Ok(seg0 | 1));
        h.ctrl.submit(TransferRequest::bulk(SLOT, EP, h.buffer(64))).unwrap();
        assert!(h.trb(seg0, 0).cycle(), "queueing starts over at the first TRB");
    }

    /// Shutdown fails outstanding work and returns every allocation
    #[test]
    fn test_shutdown_releases_everything() {
        let h = Harness::new(HostConfig::default());
        h.add_device(SLOT);
        h.add_device(2);
        h.add_endpoint(SLOT, 0, EndpointConfig::control(64));
        h.add_endpoint(SLOT, EP, bulk_out());
        h.add_endpoint(2, EP, bulk_out());
        h.ctrl.alloc_streams(2, EP, 8).unwrap();
        let id = h.ctrl.submit(TransferRequest::bulk(SLOT, EP, h.buffer(512))).unwrap();
        h.ctrl.queue_command(xhci_ring::CommandTrb::Noop).unwrap();

        let Harness { ctrl, inbox } = h;
        let hc = ctrl.shutdown();
        assert_eq!(hc.dma.live_regions(), 0);
        assert!(!hc.irq_enabled());

        let events = std::mem::take(&mut *inbox.lock().unwrap());
        assert!(events.iter().any(|n| matches!(
            n,
            Notification::Transfer(t) if t.id == id && t.status == Some(XhciError::Shutdown)
        )));
        assert!(events.iter().any(|n| matches!(
            n,
            Notification::Command(c) if c.code == CompletionCode::CommandAborted
        )));
        assert!(matches!(events.last(), Some(Notification::HostDied)));
    }

    /// Completion counters follow what was delivered
    #[test]
    fn test_perf_counters() {
        let h = Harness::new(HostConfig::default());
        h.add_device(SLOT);
        let seg0 = h.add_endpoint(SLOT, EP, bulk_out());
        h.ctrl.submit(TransferRequest::bulk(SLOT, EP, h.buffer(300))).unwrap();
        h.ctrl.submit(TransferRequest::bulk(SLOT, EP, h.buffer(100))).unwrap();
        assert_eq!(h.ctrl.perf().in_flight(), 2);

        h.hc()
            .post_transfer_event(SLOT, EP, trb_dma(seg0, 0), 0, CompletionCode::Success);
        h.hc()
            .post_transfer_event(SLOT, EP, trb_dma(seg0, 1), 0, CompletionCode::DataBufferError);
        h.interrupt();

        let perf = h.ctrl.perf();
        assert_eq!(perf.transfers_submitted, 2);
        assert_eq!(perf.transfers_success, 1);
        assert_eq!(perf.transfers_failed, 1);
        assert_eq!(perf.bytes_transferred, 300);
        assert_eq!(perf.events_handled, 2);
        assert_eq!(perf.interrupt_count, 1);
        assert_eq!(perf.in_flight(), 0);
    }

    /// An interrupt that arrives while a ring is being allocated is handled
    /// before the allocating call returns
    #[test]
    fn test_interrupt_during_endpoint_setup() {
        let (ctrl, inbox) = shared_controller();
        let seg0 = ctrl.add_endpoint(SLOT, EP, bulk_out()).unwrap() & !0xf;
        let buffer = TransferBuffer::Single(ctrl.platform().dma.buffer(64, 0));
        let id = ctrl.submit(TransferRequest::bulk(SLOT, EP, buffer)).unwrap();
        ctrl.platform()
            .post_transfer_event(SLOT, EP, trb_dma(seg0, 0), 0, CompletionCode::Success);

        let seen = Arc::new(Mutex::new(None));
        let status = Arc::clone(&seen);
        let weak = Arc::downgrade(&ctrl);
        ctrl.platform().dma.on_next_alloc(move || {
            if let Some(ctrl) = weak.upgrade() {
                *status.lock().unwrap() = Some(ctrl.handle_interrupt());
            }
        });
        ctrl.add_endpoint(SLOT, 4, EndpointConfig::bulk(false, 512)).unwrap();

        assert_eq!(*seen.lock().unwrap(), Some(IrqStatus::Deferred));
        let done = completions(&inbox);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, id);
        assert!(done[0].is_ok());
    }

    /// A submit that finds the lock held is queued by the holder
    #[test]
    fn test_submit_during_stream_setup() {
        let (ctrl, inbox) = shared_controller();
        ctrl.add_endpoint(SLOT, EP, bulk_out()).unwrap();
        let other = ctrl.add_endpoint(SLOT, 4, bulk_out()).unwrap() & !0xf;
        let buffer = TransferBuffer::Single(ctrl.platform().dma.buffer(64, 0));
        ctrl.platform().take_doorbells();

        let parked = Arc::new(Mutex::new(None));
        let result = Arc::clone(&parked);
        let weak = Arc::downgrade(&ctrl);
        ctrl.platform().dma.on_next_alloc(move || {
            if let Some(ctrl) = weak.upgrade() {
                *result.lock().unwrap() = Some(ctrl.submit(TransferRequest::bulk(SLOT, 4, buffer)));
            }
        });
        ctrl.alloc_streams(SLOT, EP, 2).unwrap();

        let id = parked.lock().unwrap().take().expect("submit ran").expect("submit parked");
        assert!(ctrl.platform().dma.read_trb(other).cycle(), "queued before alloc_streams returned");
        assert_eq!(ctrl.platform().take_doorbells(), vec![(SLOT, 5)]);

        ctrl.platform()
            .post_transfer_event(SLOT, 4, trb_dma(other, 0), 0, CompletionCode::Success);
        ctrl.handle_interrupt();
        let done = completions(&inbox);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].id, id);
    }
}
