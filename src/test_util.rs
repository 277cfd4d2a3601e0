//! Host-side helpers shared by unit tests

use core::ptr::NonNull;
use std::alloc::{alloc_zeroed, dealloc, Layout};

use crate::dma::DmaRegion;
use crate::error::{Result, XhciError};
use crate::hal::DmaMapper;
use crate::transfer::SetupPacket;

const PAGE: usize = 4096;

/// Coherent memory from the host heap, bus address equal to the CPU address
#[derive(Debug, Default)]
pub struct HeapDma;

impl HeapDma {
    pub fn new() -> Self {
        Self
    }
}

impl DmaMapper for HeapDma {
    fn alloc_coherent(&self, size: usize, align: usize) -> Result<DmaRegion> {
        let layout = Layout::from_size_align(size.max(1), align.max(PAGE))
            .map_err(|_| XhciError::InvalidParameter)?;
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(XhciError::NoResources)?;
        Ok(unsafe { DmaRegion::from_raw_parts(ptr, ptr.as_ptr() as u64, size) })
    }

    fn free_coherent(&self, region: DmaRegion) {
        if let Ok(layout) = Layout::from_size_align(region.len().max(1), PAGE) {
            unsafe { dealloc(region.as_ptr(), layout) }
        }
    }
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
