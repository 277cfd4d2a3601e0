//! Platform capability interfaces
//!
//! The engine never touches hardware directly. Register access, DMA memory,
//! doorbells, the interrupt line, time and the device output contexts are all
//! reached through these traits, implemented once per platform.

use crate::dma::DmaRegion;
use crate::error::Result;

/// Register access relative to the controller's capability base
pub trait Mmio {
    /// Read a 32-bit register
    fn read32(&self, offset: usize) -> u32;

    /// Write a 32-bit register
    fn write32(&self, offset: usize, value: u32);

    /// Read a 64-bit register, low dword first
    fn read64(&self, offset: usize) -> u64 {
        u64::from(self.read32(offset)) | u64::from(self.read32(offset + 4)) << 32
    }

    /// Write a 64-bit register, low dword first. Controllers that need a
    /// single 64-bit store override this.
    fn write64(&self, offset: usize, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

/// Coherent DMA memory provider
pub trait DmaMapper {
    /// Allocate zeroed coherent memory of `size` bytes aligned to `align`
    /// that does not cross a 64 KiB boundary
    fn alloc_coherent(&self, size: usize, align: usize) -> Result<DmaRegion>;

    /// Return memory obtained from `alloc_coherent`
    fn free_coherent(&self, region: DmaRegion);
}

/// Doorbell array writes
pub trait Doorbell {
    /// Write `value` to doorbell register `slot_id` (0 is the command ring)
    fn ring(&self, slot_id: u8, value: u32);
}

/// Interrupter line control
pub trait InterruptSource {
    /// Enable or mask the interrupter
    fn set_enabled(&self, enabled: bool);

    /// True when the line is message signalled and IMAN.IP clears itself
    fn ip_autoclear(&self) -> bool {
        false
    }
}

/// Monotonic time source and timer hint
pub trait Clock {
    /// Milliseconds since an arbitrary epoch
    fn now_ms(&self) -> u64;

    /// Request a call to `XhciController::poll_timers` at or after `deadline_ms`
    fn arm(&self, deadline_ms: u64) {
        let _ = deadline_ms;
    }
}

/// Endpoint context state as written back by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EpContextState {
    Disabled,
    Running,
    Halted,
    Stopped,
    Error,
}

impl EpContextState {
    /// Decode the 3-bit EP State field
    pub fn from_raw(raw: u32) -> Self {
        match raw & 0x7 {
            1 => Self::Running,
            2 => Self::Halted,
            3 => Self::Stopped,
            4 => Self::Error,
            _ => Self::Disabled,
        }
    }
}

/// Read-only view of the device output contexts owned by the enumeration layer
pub trait EndpointContexts {
    /// Current EP State of an endpoint context
    fn endpoint_state(&self, slot_id: u8, ep_index: u8) -> EpContextState;

    /// TR Dequeue Pointer field of an endpoint context, DCS in bit 0
    fn endpoint_dequeue(&self, slot_id: u8, ep_index: u8) -> u64;
}

/// Everything the engine needs from the platform
pub trait Platform: Mmio + DmaMapper + Doorbell + InterruptSource + Clock + EndpointContexts {}

impl<T> Platform for T where
    T: Mmio + DmaMapper + Doorbell + InterruptSource + Clock + EndpointContexts
{
}
