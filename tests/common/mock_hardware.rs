//! Mock xHCI controller for host-side tests
//!
//! `MockHc` implements every platform trait. Registers live in a map with
//! the write-1-to-clear and abort behavior the engine relies on, coherent
//! memory comes from the host heap (bus address equals CPU address), and a
//! small producer writes events into the event ring the engine programmed.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::ptr::{self, NonNull};

use xhci_ring::register::{cap, op, rt, Crcr, UsbCmd, UsbSts, CRCR_PTR_MASK, ERST_EHB};
use xhci_ring::trb::{CommandCompletionEvent, Event, PortStatusChangeEvent, TransferEvent};
use xhci_ring::{
    Clock, CompletionCode, DmaMapper, DmaRegion, DmaSlice, Doorbell, EndpointContexts, EpContextState,
    InterruptSource, Mmio, Result, Trb, XhciError,
};

/// Operational base (CAPLENGTH)
pub const OP_BASE: usize = 0x20;
/// Runtime base (RTSOFF)
pub const RT_BASE: usize = 0x600;
/// Interrupter 0 register set
pub const IR0: usize = RT_BASE + rt::IR0;

pub const MAX_SLOTS: u32 = 32;
pub const MAX_PORTS: u32 = 4;

const PAGE: usize = 4096;
const TRB_BYTES: u64 = 16;
const USBSTS_W1C: u32 = UsbSts::HOST_SYSTEM_ERROR.bits()
    | UsbSts::EVENT_INTERRUPT.bits()
    | UsbSts::PORT_CHANGE.bits();
const IMAN_IP: u32 = 1 << 0;
const IMAN_IE: u32 = 1 << 1;

/// One-shot callback run from inside a coherent allocation
#[derive(Default)]
struct AllocHook(RefCell<Option<Box<dyn FnOnce()>>>);

impl std::fmt::Debug for AllocHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.0.borrow().is_some() { "AllocHook(armed)" } else { "AllocHook" })
    }
}

/// Coherent memory from the host heap, with every live allocation tracked
#[derive(Debug, Default)]
pub struct MockDma {
    coherent: RefCell<BTreeMap<u64, Layout>>,
    buffers: RefCell<Vec<(NonNull<u8>, Layout)>>,
    fail_after: Cell<Option<usize>>,
    alloc_hook: AllocHook,
}

impl MockDma {
    /// Coherent regions not yet returned
    pub fn live_regions(&self) -> usize {
        self.coherent.borrow().len()
    }

    /// Let `n` more coherent allocations succeed, then fail
    pub fn fail_after(&self, n: usize) {
        self.fail_after.set(Some(n));
    }

    /// Run `hook` from inside the next coherent allocation, while the
    /// engine holds its lock
    pub fn on_next_alloc(&self, hook: impl FnOnce() + 'static) {
        *self.alloc_hook.0.borrow_mut() = Some(Box::new(hook));
    }

    /// Mapped client buffer of `len` bytes filled with `fill`. Buffers up to
    /// 64 KiB never cross a 64 KiB boundary.
    pub fn buffer(&self, len: usize, fill: u8) -> DmaSlice {
        let align = len.next_power_of_two().clamp(64, 0x1_0000);
        let layout = Layout::from_size_align(len.max(1), align).expect("buffer layout");
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).expect("buffer allocation");
        unsafe { ptr::write_bytes(ptr.as_ptr(), fill, len) };
        self.buffers.borrow_mut().push((ptr, layout));
        unsafe { DmaSlice::new(ptr, ptr.as_ptr() as u64, len) }
    }

    pub fn read_u32(&self, bus: u64) -> u32 {
        u32::from_le(unsafe { ptr::read_volatile(bus as usize as *const u32) })
    }

    pub fn write_u32(&self, bus: u64, value: u32) {
        unsafe { ptr::write_volatile(bus as usize as *mut u32, value.to_le()) }
    }

    pub fn read_u64(&self, bus: u64) -> u64 {
        u64::from(self.read_u32(bus)) | u64::from(self.read_u32(bus + 4)) << 32
    }

    pub fn write_u64(&self, bus: u64, value: u64) {
        self.write_u32(bus, value as u32);
        self.write_u32(bus + 4, (value >> 32) as u32);
    }

    /// TRB at a bus address, as the controller would fetch it
    pub fn read_trb(&self, bus: u64) -> Trb {
        let mut bytes = [0u8; 16];
        for (i, chunk) in bytes.chunks_exact_mut(4).enumerate() {
            chunk.copy_from_slice(&self.read_u32(bus + 4 * i as u64).to_le_bytes());
        }
        Trb::from_bytes(&bytes)
    }

    /// Write a TRB, control dword last
    pub fn write_trb(&self, bus: u64, trb: &Trb) {
        let bytes = trb.to_bytes();
        for i in [0usize, 1, 2, 3] {
            let dword = u32::from_le_bytes([bytes[4 * i], bytes[4 * i + 1], bytes[4 * i + 2], bytes[4 * i + 3]]);
            self.write_u32(bus + 4 * i as u64, dword);
        }
    }
}

impl DmaMapper for MockDma {
    fn alloc_coherent(&self, size: usize, align: usize) -> Result<DmaRegion> {
        let hook = self.alloc_hook.0.borrow_mut().take();
        if let Some(hook) = hook {
            hook();
        }
        if let Some(left) = self.fail_after.get() {
            if left == 0 {
                return Err(XhciError::NoResources);
            }
            self.fail_after.set(Some(left - 1));
        }
        let layout = Layout::from_size_align(size.max(1), align.max(PAGE)).map_err(|_| XhciError::InvalidParameter)?;
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(XhciError::NoResources)?;
        let bus = ptr.as_ptr() as u64;
        self.coherent.borrow_mut().insert(bus, layout);
        Ok(unsafe { DmaRegion::from_raw_parts(ptr, bus, size) })
    }

    fn free_coherent(&self, region: DmaRegion) {
        let layout = self
            .coherent
            .borrow_mut()
            .remove(&region.dma())
            .expect("freeing memory that was never allocated");
        unsafe { dealloc(region.as_ptr(), layout) }
    }
}

impl Drop for MockDma {
    fn drop(&mut self) {
        for (bus, layout) in std::mem::take(&mut *self.coherent.borrow_mut()) {
            unsafe { dealloc(bus as usize as *mut u8, layout) }
        }
        for (ptr, layout) in self.buffers.borrow_mut().drain(..) {
            unsafe { dealloc(ptr.as_ptr(), layout) }
        }
    }
}

/// Where the next event goes
#[derive(Debug, Clone, Copy)]
struct Producer {
    segment: u64,
    slot: u64,
    cycle: bool,
}

/// Fake controller behind the platform traits
#[derive(Debug)]
pub struct MockHc {
    regs: RefCell<HashMap<usize, u32>>,
    crcr_writes: RefCell<Vec<u64>>,
    cmd_ring_running: Cell<bool>,
    /// CA leaves CRR set, as a wedged controller would
    abort_stuck: Cell<bool>,
    doorbells: RefCell<Vec<(u8, u32)>>,
    pub dma: MockDma,
    now: Cell<u64>,
    armed: Cell<Option<u64>>,
    ep_ctx: RefCell<HashMap<(u8, u8), (EpContextState, u64)>>,
    irq_enabled: Cell<bool>,
    producer: Cell<Producer>,
}

impl Default for MockHc {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHc {
    /// xHCI 1.1 controller: 32 slots, 4 ports, IST of 1 microframe,
    /// ERST max 16, halted
    pub fn new() -> Self {
        let mut regs = HashMap::new();
        regs.insert(cap::CAPLENGTH, 0x0110_0000 | OP_BASE as u32);
        regs.insert(cap::HCSPARAMS1, MAX_PORTS << 24 | 1 << 8 | MAX_SLOTS);
        regs.insert(cap::HCSPARAMS2, 4 << 4 | 1);
        regs.insert(cap::HCCPARAMS1, 0);
        regs.insert(cap::RTSOFF, RT_BASE as u32);
        regs.insert(OP_BASE + op::USBSTS, UsbSts::HALTED.bits());
        Self {
            regs: RefCell::new(regs),
            crcr_writes: RefCell::new(Vec::new()),
            cmd_ring_running: Cell::new(false),
            abort_stuck: Cell::new(false),
            doorbells: RefCell::new(Vec::new()),
            dma: MockDma::default(),
            now: Cell::new(0),
            armed: Cell::new(None),
            ep_ctx: RefCell::new(HashMap::new()),
            irq_enabled: Cell::new(false),
            producer: Cell::new(Producer {
                segment: 0,
                slot: 0,
                cycle: true,
            }),
        }
    }

    /// Report the Contiguous Frame ID capability
    pub fn with_cfc(self) -> Self {
        self.regs.borrow_mut().insert(cap::HCCPARAMS1, 1 << 11);
        self
    }

    /// Override a capability register before the controller reads it
    pub fn with_cap(self, offset: usize, value: u32) -> Self {
        self.regs.borrow_mut().insert(offset, value);
        self
    }

    pub fn reg(&self, offset: usize) -> u32 {
        self.regs.borrow().get(&offset).copied().unwrap_or(0)
    }

    pub fn set_reg(&self, offset: usize, value: u32) {
        self.regs.borrow_mut().insert(offset, value);
    }

    pub fn usbcmd(&self) -> UsbCmd {
        UsbCmd::from_bits_retain(self.reg(OP_BASE + op::USBCMD))
    }

    /// Raise bits in USBSTS as the controller would
    pub fn raise_usbsts(&self, bits: UsbSts) {
        let sts = self.reg(OP_BASE + op::USBSTS);
        self.set_reg(OP_BASE + op::USBSTS, sts | bits.bits());
    }

    pub fn set_portsc(&self, port_id: u8, value: u32) {
        let index = usize::from(port_id - 1);
        self.set_reg(OP_BASE + op::PORTSC_BASE + index * op::PORT_STRIDE, value);
    }

    pub fn set_mfindex(&self, mfindex: u32) {
        self.set_reg(RT_BASE + rt::MFINDEX, mfindex & 0x3fff);
    }

    /// Every 64-bit value written to CRCR
    pub fn crcr_writes(&self) -> Vec<u64> {
        self.crcr_writes.borrow().clone()
    }

    /// Bus address of the command ring as first programmed
    pub fn command_ring_base(&self) -> u64 {
        self.crcr_writes.borrow().first().copied().expect("CRCR never written") & CRCR_PTR_MASK
    }

    /// Bus address of the `index`th command TRB (single segment ring)
    pub fn command_dma(&self, index: usize) -> u64 {
        self.command_ring_base() + index as u64 * TRB_BYTES
    }

    pub fn command_trb(&self, index: usize) -> Trb {
        self.dma.read_trb(self.command_dma(index))
    }

    pub fn set_abort_stuck(&self, stuck: bool) {
        self.abort_stuck.set(stuck);
    }

    pub fn cmd_ring_running(&self) -> bool {
        self.cmd_ring_running.get()
    }

    /// Doorbell writes since the last call
    pub fn take_doorbells(&self) -> Vec<(u8, u32)> {
        std::mem::take(&mut *self.doorbells.borrow_mut())
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }

    /// Deadline most recently armed
    pub fn armed(&self) -> Option<u64> {
        self.armed.get()
    }

    pub fn irq_enabled(&self) -> bool {
        self.irq_enabled.get()
    }

    pub fn set_ep_state(&self, slot_id: u8, ep_index: u8, state: EpContextState) {
        self.ep_ctx.borrow_mut().entry((slot_id, ep_index)).or_insert((state, 0)).0 = state;
    }

    /// TR Dequeue Pointer the controller reports, DCS in bit 0
    pub fn set_ep_dequeue(&self, slot_id: u8, ep_index: u8, dequeue: u64) {
        self.ep_ctx
            .borrow_mut()
            .entry((slot_id, ep_index))
            .or_insert((EpContextState::Running, 0))
            .1 = dequeue;
    }

    /// Write `trb` into the next event ring slot with the producer cycle
    /// bit, then raise EINT and IMAN.IP
    pub fn post_event(&self, trb: Trb) {
        let erstba = u64::from(self.reg(IR0 + rt::ERSTBA)) | u64::from(self.reg(IR0 + rt::ERSTBA + 4)) << 32;
        let erstsz = u64::from(self.reg(IR0 + rt::ERSTSZ));
        assert!(erstba != 0 && erstsz != 0, "event ring not programmed");

        let mut p = self.producer.get();
        let entry = erstba + p.segment * 16;
        let seg_base = self.dma.read_u64(entry);
        let seg_size = u64::from(self.dma.read_u32(entry + 8));
        let control = trb.control() & !1 | u32::from(p.cycle);
        let bytes = trb.to_bytes();
        let mut with_cycle = [0u8; 16];
        with_cycle[..12].copy_from_slice(&bytes[..12]);
        with_cycle[12..].copy_from_slice(&control.to_le_bytes());
        self.dma.write_trb(seg_base + p.slot * TRB_BYTES, &Trb::from_bytes(&with_cycle));

        p.slot += 1;
        if p.slot == seg_size {
            p.slot = 0;
            p.segment += 1;
            if p.segment == erstsz {
                p.segment = 0;
                p.cycle = !p.cycle;
            }
        }
        self.producer.set(p);

        self.raise_usbsts(UsbSts::EVENT_INTERRUPT);
        let iman = self.reg(IR0 + rt::IMAN);
        self.set_reg(IR0 + rt::IMAN, iman | IMAN_IP);
    }

    pub fn post_transfer_event(&self, slot_id: u8, ep_index: u8, trb_dma: u64, residue: u32, code: CompletionCode) {
        self.post_event(
            TransferEvent {
                trb_pointer: trb_dma,
                transfer_length: residue,
                code,
                event_data: false,
                slot_id,
                endpoint_id: ep_index + 1,
            }
            .encode(),
        );
    }

    pub fn post_command_completion(&self, command_dma: u64, code: CompletionCode, slot_id: u8) {
        self.post_event(
            CommandCompletionEvent {
                command_trb: command_dma,
                parameter: 0,
                code,
                vf_id: 0,
                slot_id,
            }
            .encode(),
        );
    }

    /// Complete the `index`th command on the ring
    pub fn complete_command(&self, index: usize, code: CompletionCode) {
        let slot_id = ((self.command_trb(index).control() >> 24) & 0xff) as u8;
        self.post_command_completion(self.command_dma(index), code, slot_id);
    }

    pub fn post_port_status(&self, port_id: u8) {
        self.post_event(
            PortStatusChangeEvent {
                port_id,
                code: CompletionCode::Success,
            }
            .encode(),
        );
        self.raise_usbsts(UsbSts::PORT_CHANGE);
    }

    pub fn post_mfindex_wrap(&self) {
        self.post_event(
            Event::MfindexWrap {
                code: CompletionCode::Success,
            }
            .encode(),
        );
    }

    /// ERDP as last written, EHB reads back clear
    pub fn erdp(&self) -> u64 {
        u64::from(self.reg(IR0 + rt::ERDP)) | u64::from(self.reg(IR0 + rt::ERDP + 4)) << 32
    }
}

impl Mmio for MockHc {
    fn read32(&self, offset: usize) -> u32 {
        if offset == OP_BASE + op::CRCR {
            // Only CRR reads back
            return if self.cmd_ring_running.get() { Crcr::RUNNING.bits() as u32 } else { 0 };
        }
        if offset == OP_BASE + op::CRCR + 4 {
            return 0;
        }
        self.reg(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        match offset {
            o if o == OP_BASE + op::USBSTS => {
                let sts = self.reg(o);
                self.set_reg(o, sts & !(value & USBSTS_W1C));
            }
            o if o == OP_BASE + op::USBCMD => {
                self.set_reg(o, value);
                let sts = self.reg(OP_BASE + op::USBSTS);
                let sts = if value & UsbCmd::RUN.bits() != 0 {
                    sts & !UsbSts::HALTED.bits()
                } else {
                    sts | UsbSts::HALTED.bits()
                };
                self.set_reg(OP_BASE + op::USBSTS, sts);
            }
            o if o == IR0 + rt::IMAN => {
                let iman = self.reg(o);
                let mut next = (iman & IMAN_IP) | (value & IMAN_IE);
                if value & IMAN_IP != 0 {
                    next &= !IMAN_IP;
                }
                self.set_reg(o, next);
            }
            o if o == IR0 + rt::ERDP => {
                // EHB is write-1-to-clear and reads back clear here
                self.set_reg(o, value & !(ERST_EHB as u32));
            }
            o if o == OP_BASE + op::CRCR || o == OP_BASE + op::CRCR + 4 => {
                panic!("CRCR must be written with a single 64-bit access");
            }
            o => self.set_reg(o, value),
        }
    }

    fn write64(&self, offset: usize, value: u64) {
        if offset == OP_BASE + op::CRCR {
            self.crcr_writes.borrow_mut().push(value);
            let crcr = Crcr::from_bits_retain(value);
            if crcr.intersects(Crcr::ABORT | Crcr::STOP) && !self.abort_stuck.get() {
                self.cmd_ring_running.set(false);
            }
            return;
        }
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

impl DmaMapper for MockHc {
    fn alloc_coherent(&self, size: usize, align: usize) -> Result<DmaRegion> {
        self.dma.alloc_coherent(size, align)
    }

    fn free_coherent(&self, region: DmaRegion) {
        self.dma.free_coherent(region)
    }
}

impl Doorbell for MockHc {
    fn ring(&self, slot_id: u8, value: u32) {
        if slot_id == 0 {
            self.cmd_ring_running.set(true);
        }
        self.doorbells.borrow_mut().push((slot_id, value));
    }
}

impl InterruptSource for MockHc {
    fn set_enabled(&self, enabled: bool) {
        self.irq_enabled.set(enabled);
    }
}

impl Clock for MockHc {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn arm(&self, deadline_ms: u64) {
        self.armed.set(Some(deadline_ms));
    }
}

impl EndpointContexts for MockHc {
    fn endpoint_state(&self, slot_id: u8, ep_index: u8) -> EpContextState {
        self.ep_ctx
            .borrow()
            .get(&(slot_id, ep_index))
            .map_or(EpContextState::Running, |ctx| ctx.0)
    }

    fn endpoint_dequeue(&self, slot_id: u8, ep_index: u8) -> u64 {
        self.ep_ctx.borrow().get(&(slot_id, ep_index)).map_or(0, |ctx| ctx.1)
    }
}
