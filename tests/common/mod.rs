//! Shared test utilities for xhci-ring tests
//!
//! A `Harness` wires an `XhciController` to the mock controller and collects
//! every notification the engine delivers.

#![allow(dead_code)]

pub mod mock_hardware;

use std::sync::{Arc, Mutex};

pub use mock_hardware::{MockDma, MockHc, IR0, OP_BASE, RT_BASE};

use xhci_ring::trb::Trb;
use xhci_ring::{
    CommandCompletion, EndpointConfig, HostConfig, IrqStatus, Notification, SetupPacket, SlotInfo, TransferBuffer,
    TransferCompletion, UsbSpeed, XhciController,
};

/// Bytes per TRB
pub const TRB_BYTES: u64 = 16;
/// Slot index of the Link TRB in every segment
pub const LINK_SLOT: usize = 255;

pub type Inbox = Arc<Mutex<Vec<Notification>>>;

/// Controller on a mock, running, with notifications captured
pub struct Harness {
    pub ctrl: XhciController<MockHc>,
    pub inbox: Inbox,
}

impl Harness {
    pub fn new(config: HostConfig) -> Self {
        Self::with_hc(MockHc::new(), config)
    }

    pub fn with_hc(hc: MockHc, config: HostConfig) -> Self {
        let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&inbox);
        let ctrl = XhciController::new(hc, config, move |n| sink.lock().unwrap().push(n))
            .expect("controller init");
        ctrl.run().expect("controller run");
        Self { ctrl, inbox }
    }

    pub fn hc(&self) -> &MockHc {
        self.ctrl.platform()
    }

    /// Register a high-speed device in `slot_id`
    pub fn add_device(&self, slot_id: u8) {
        self.add_device_at(slot_id, UsbSpeed::High);
    }

    pub fn add_device_at(&self, slot_id: u8, speed: UsbSpeed) {
        self.ctrl
            .add_slot(
                slot_id,
                SlotInfo {
                    speed,
                    root_port: 1,
                    tt: None,
                },
            )
            .expect("add slot");
    }

    /// Add an endpoint and return the bus address of its first segment
    pub fn add_endpoint(&self, slot_id: u8, ep_index: u8, config: EndpointConfig) -> u64 {
        let deq = self.ctrl.add_endpoint(slot_id, ep_index, config).expect("add endpoint");
        assert_eq!(deq & 1, 1, "new rings start with DCS set");
        deq & !0xf
    }

    pub fn interrupt(&self) -> IrqStatus {
        self.ctrl.handle_interrupt()
    }

    pub fn take(&self) -> Vec<Notification> {
        std::mem::take(&mut *self.inbox.lock().unwrap())
    }

    pub fn transfers(&self) -> Vec<TransferCompletion> {
        self.take()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Transfer(done) => Some(done),
                _ => None,
            })
            .collect()
    }

    pub fn commands(&self) -> Vec<CommandCompletion> {
        self.take()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Command(done) => Some(done),
                _ => None,
            })
            .collect()
    }

    /// Client buffer of `len` bytes
    pub fn buffer(&self, len: usize) -> TransferBuffer {
        TransferBuffer::Single(self.hc().dma.buffer(len, 0xa5))
    }

    /// TRB `slot` of the segment at `seg_base`
    pub fn trb(&self, seg_base: u64, slot: usize) -> Trb {
        self.hc().dma.read_trb(seg_base + slot as u64 * TRB_BYTES)
    }

    /// Segment the Link TRB of `seg_base` points at
    pub fn next_segment(&self, seg_base: u64) -> u64 {
        self.trb(seg_base, LINK_SLOT).parameter() & !0xf
    }
}

/// Bus address of TRB `slot` in the segment at `seg_base`
pub fn trb_dma(seg_base: u64, slot: usize) -> u64 {
    seg_base + slot as u64 * TRB_BYTES
}

/// Standard GET_DESCRIPTOR for descriptor `desc_type`, index 0
pub fn get_descriptor(desc_type: u8, length: u16) -> SetupPacket {
    SetupPacket {
        request_type: 0x80,
        request: 0x06,
        value: u16::from(desc_type) << 8,
        index: 0,
        length,
    }
}
