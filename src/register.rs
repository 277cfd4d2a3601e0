//! xHCI register map and ordered access helpers
//!
//! Offsets are relative to the capability base handed to [`Mmio`]. The
//! operational and runtime bases are read once from CAPLENGTH and RTSOFF.
//!
//! Memory barriers follow the weakly-ordered model: descriptor writes must be
//! visible before the control dword that publishes them, and before any
//! doorbell write.

use bitflags::bitflags;

use crate::hal::Mmio;

/// Write barrier: order prior stores before later stores
#[inline(always)]
pub fn wmb() {
    #[cfg(target_arch = "arm")]
    cortex_m::asm::dmb();
    #[cfg(not(target_arch = "arm"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
}

/// Read barrier: order prior loads before later loads
#[inline(always)]
pub fn rmb() {
    #[cfg(target_arch = "arm")]
    cortex_m::asm::dmb();
    #[cfg(not(target_arch = "arm"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::Acquire);
}

/// Full barrier, completes outstanding writes (used before doorbells)
#[inline(always)]
pub fn mb() {
    #[cfg(target_arch = "arm")]
    cortex_m::asm::dsb();
    #[cfg(not(target_arch = "arm"))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Capability register offsets
pub mod cap {
    /// CAPLENGTH (bits 0-7) and HCIVERSION (bits 16-31)
    pub const CAPLENGTH: usize = 0x00;
    pub const HCSPARAMS1: usize = 0x04;
    pub const HCSPARAMS2: usize = 0x08;
    pub const HCCPARAMS1: usize = 0x10;
    pub const DBOFF: usize = 0x14;
    pub const RTSOFF: usize = 0x18;
}

/// Operational register offsets (from the operational base)
pub mod op {
    pub const USBCMD: usize = 0x00;
    pub const USBSTS: usize = 0x04;
    pub const CRCR: usize = 0x18;
    pub const DCBAAP: usize = 0x30;
    pub const CONFIG: usize = 0x38;
    pub const PORTSC_BASE: usize = 0x400;
    pub const PORT_STRIDE: usize = 0x10;
}

/// Runtime register offsets (from the runtime base)
pub mod rt {
    pub const MFINDEX: usize = 0x00;
    pub const IR0: usize = 0x20;
    pub const IR_STRIDE: usize = 0x20;
    pub const IMAN: usize = 0x00;
    pub const IMOD: usize = 0x04;
    pub const ERSTSZ: usize = 0x08;
    pub const ERSTBA: usize = 0x10;
    pub const ERDP: usize = 0x18;
}

bitflags! {
    /// USB Command Register (USBCMD) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbCmd: u32 {
        /// Run/Stop (R/S) - Bit 0
        const RUN = 1 << 0;
        /// Host Controller Reset (HCRST) - Bit 1
        const HC_RESET = 1 << 1;
        /// Interrupter Enable (INTE) - Bit 2
        const INT_ENABLE = 1 << 2;
        /// Host System Error Enable (HSEE) - Bit 3
        const HSE_ENABLE = 1 << 3;
    }
}

bitflags! {
    /// USB Status Register (USBSTS) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbSts: u32 {
        /// HC Halted (HCH) - Bit 0
        const HALTED = 1 << 0;
        /// Host System Error (HSE) - Bit 2
        const HOST_SYSTEM_ERROR = 1 << 2;
        /// Event Interrupt (EINT) - Bit 3
        const EVENT_INTERRUPT = 1 << 3;
        /// Port Change Detect (PCD) - Bit 4
        const PORT_CHANGE = 1 << 4;
        /// Controller Not Ready (CNR) - Bit 11
        const NOT_READY = 1 << 11;
        /// Host Controller Error (HCE) - Bit 12
        const HOST_CONTROLLER_ERROR = 1 << 12;
    }
}

bitflags! {
    /// Command Ring Control Register (CRCR) low bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Crcr: u64 {
        /// Ring Cycle State (RCS) - Bit 0
        const RING_CYCLE = 1 << 0;
        /// Command Stop (CS) - Bit 1
        const STOP = 1 << 1;
        /// Command Abort (CA) - Bit 2
        const ABORT = 1 << 2;
        /// Command Ring Running (CRR) - Bit 3
        const RUNNING = 1 << 3;
    }
}

/// CRCR pointer bits
pub const CRCR_PTR_MASK: u64 = !0x3f;

bitflags! {
    /// Interrupter Management Register (IMAN)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Iman: u32 {
        /// Interrupt Pending (IP), write 1 to clear - Bit 0
        const PENDING = 1 << 0;
        /// Interrupt Enable (IE) - Bit 1
        const ENABLE = 1 << 1;
    }
}

/// ERDP Dequeue ERST Segment Index field
pub const ERST_DESI_MASK: u64 = 0x7;
/// ERDP Event Handler Busy, write 1 to clear
pub const ERST_EHB: u64 = 1 << 3;
/// ERDP pointer bits
pub const ERST_PTR_MASK: u64 = !0xf;

/// Doorbell target for the host command ring
pub const DB_HOST_COMMAND: u32 = 0;

/// Doorbell value for an endpoint ring: DCI in bits 0-7, stream id in bits 16-31
pub fn ep_doorbell_value(ep_index: u8, stream_id: u16) -> u32 {
    (u32::from(ep_index) + 1) | u32::from(stream_id) << 16
}

/// Probed register layout and controller parameters
#[derive(Debug, Clone, Copy)]
pub struct Registers {
    op_base: usize,
    rt_base: usize,
    /// Interface version number (BCD, e.g. 0x0110)
    pub hci_version: u16,
    hcs_params1: u32,
    hcs_params2: u32,
    hcc_params1: u32,
}

impl Registers {
    /// Read capability registers and compute the register bases
    pub fn discover<M: Mmio + ?Sized>(mmio: &M) -> Self {
        let cap = mmio.read32(cap::CAPLENGTH);
        Self {
            op_base: (cap & 0xff) as usize,
            rt_base: (mmio.read32(cap::RTSOFF) & !0x1f) as usize,
            hci_version: (cap >> 16) as u16,
            hcs_params1: mmio.read32(cap::HCSPARAMS1),
            hcs_params2: mmio.read32(cap::HCSPARAMS2),
            hcc_params1: mmio.read32(cap::HCCPARAMS1),
        }
    }

    /// Number of device slots
    pub fn max_slots(&self) -> u8 {
        self.hcs_params1 as u8
    }

    /// Number of root hub ports
    pub fn max_ports(&self) -> u8 {
        (self.hcs_params1 >> 24) as u8
    }

    /// Isochronous Scheduling Threshold, raw 4-bit field
    pub fn ist(&self) -> u32 {
        self.hcs_params2 & 0xf
    }

    /// Maximum ERST entries (2^ERST Max)
    pub fn erst_max(&self) -> usize {
        1 << ((self.hcs_params2 >> 4) & 0xf)
    }

    /// Contiguous Frame ID capability
    pub fn cfc(&self) -> bool {
        self.hcc_params1 & (1 << 11) != 0
    }

    /// Read USBSTS
    pub fn usbsts<M: Mmio + ?Sized>(&self, mmio: &M) -> u32 {
        mmio.read32(self.op_base + op::USBSTS)
    }

    /// Write USBSTS (RW1C bits)
    pub fn write_usbsts<M: Mmio + ?Sized>(&self, mmio: &M, value: u32) {
        mmio.write32(self.op_base + op::USBSTS, value);
    }

    /// Read-modify-write USBCMD
    pub fn modify_usbcmd<M: Mmio + ?Sized>(&self, mmio: &M, f: impl FnOnce(UsbCmd) -> UsbCmd) {
        let cmd = UsbCmd::from_bits_retain(mmio.read32(self.op_base + op::USBCMD));
        mmio.write32(self.op_base + op::USBCMD, f(cmd).bits());
    }

    /// Read CRCR
    pub fn crcr<M: Mmio + ?Sized>(&self, mmio: &M) -> u64 {
        mmio.read64(self.op_base + op::CRCR)
    }

    /// Write all 64 bits of CRCR
    pub fn write_crcr<M: Mmio + ?Sized>(&self, mmio: &M, value: u64) {
        mmio.write64(self.op_base + op::CRCR, value);
    }

    /// Read PORTSC of a one-based port
    pub fn portsc<M: Mmio + ?Sized>(&self, mmio: &M, port_id: u8) -> u32 {
        let index = usize::from(port_id.saturating_sub(1));
        mmio.read32(self.op_base + op::PORTSC_BASE + index * op::PORT_STRIDE)
    }

    /// Read MFINDEX (14-bit microframe index)
    pub fn mfindex<M: Mmio + ?Sized>(&self, mmio: &M) -> u32 {
        mmio.read32(self.rt_base + rt::MFINDEX) & 0x3fff
    }

    fn ir_base(&self, interrupter: u16) -> usize {
        self.rt_base + rt::IR0 + usize::from(interrupter) * rt::IR_STRIDE
    }

    /// Read IMAN of an interrupter
    pub fn iman<M: Mmio + ?Sized>(&self, mmio: &M, interrupter: u16) -> u32 {
        mmio.read32(self.ir_base(interrupter) + rt::IMAN)
    }

    /// Write IMAN of an interrupter
    pub fn write_iman<M: Mmio + ?Sized>(&self, mmio: &M, interrupter: u16, value: u32) {
        mmio.write32(self.ir_base(interrupter) + rt::IMAN, value);
    }

    /// Program the event ring segment table of an interrupter
    pub fn write_erst<M: Mmio + ?Sized>(&self, mmio: &M, interrupter: u16, size: u32, base: u64) {
        let ir = self.ir_base(interrupter);
        mmio.write32(ir + rt::ERSTSZ, size & 0xffff);
        mmio.write64(ir + rt::ERSTBA, base);
    }

    /// Read ERDP
    pub fn erdp<M: Mmio + ?Sized>(&self, mmio: &M, interrupter: u16) -> u64 {
        mmio.read64(self.ir_base(interrupter) + rt::ERDP)
    }

    /// Write ERDP
    pub fn write_erdp<M: Mmio + ?Sized>(&self, mmio: &M, interrupter: u16, value: u64) {
        mmio.write64(self.ir_base(interrupter) + rt::ERDP, value);
    }
}
