//! DMA memory views shared with the controller
//!
//! `DmaRegion` is coherent memory handed out by the platform `DmaMapper`
//! (ring segments, ERST, stream context arrays, bounce buffers). `DmaSlice`
//! is a client data buffer that is already mapped for device access.
//!
//! All accesses to controller-visible memory are volatile and little-endian.

use core::ptr::{self, NonNull};

/// Alignment of ring segments, ERST and stream context arrays (xHCI requires 64)
pub const DMA_ALIGNMENT: usize = 64;

/// No controller data structure may cross this boundary
pub const DMA_BOUNDARY: u64 = 64 * 1024;

/// Round `value` up to a multiple of `align` (power of two)
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Check that `addr` is a multiple of `align` (power of two)
#[inline]
pub const fn is_aligned(addr: u64, align: u64) -> bool {
    addr & (align - 1) == 0
}

/// True when `[addr, addr + len)` stays inside one `boundary`-sized window
#[inline]
pub const fn within_boundary(addr: u64, len: u64, boundary: u64) -> bool {
    len == 0 || addr / boundary == (addr + len - 1) / boundary
}

/// Coherent memory region visible to both CPU and controller
#[derive(Debug)]
pub struct DmaRegion {
    ptr: NonNull<u8>,
    dma: u64,
    len: usize,
}

// The region is plain memory; access is serialized by the controller lock.
unsafe impl Send for DmaRegion {}

impl DmaRegion {
    /// Wrap memory handed out by a `DmaMapper`.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// the region is alive, must not be aliased by other Rust references, and
    /// `dma` must be the bus address the controller uses for the same memory.
    pub unsafe fn from_raw_parts(ptr: NonNull<u8>, dma: u64, len: usize) -> Self {
        Self { ptr, dma, len }
    }

    /// Bus address of the first byte
    pub fn dma(&self) -> u64 {
        self.dma
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length region
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// CPU pointer to the first byte
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Bus address at `offset`
    pub fn dma_at(&self, offset: usize) -> u64 {
        self.dma + offset as u64
    }

    /// Byte offset of bus address `dma`, if it lies inside the region
    pub fn offset_of(&self, dma: u64) -> Option<usize> {
        let offset = dma.checked_sub(self.dma)?;
        (offset < self.len as u64).then_some(offset as usize)
    }

    fn check(&self, offset: usize, size: usize) -> bool {
        let ok = offset.checked_add(size).is_some_and(|end| end <= self.len) && offset % 4 == 0;
        debug_assert!(ok, "DMA access out of bounds");
        ok
    }

    /// Volatile little-endian 32-bit read
    #[inline]
    pub fn read_u32(&self, offset: usize) -> u32 {
        if !self.check(offset, 4) {
            return 0;
        }
        // Bounds and alignment checked above.
        let raw = unsafe { ptr::read_volatile(self.ptr.as_ptr().add(offset) as *const u32) };
        u32::from_le(raw)
    }

    /// Volatile little-endian 32-bit write
    #[inline]
    pub fn write_u32(&mut self, offset: usize, value: u32) {
        if !self.check(offset, 4) {
            return;
        }
        unsafe { ptr::write_volatile(self.ptr.as_ptr().add(offset) as *mut u32, value.to_le()) }
    }

    /// 64-bit read as two 32-bit reads, low dword first
    pub fn read_u64(&self, offset: usize) -> u64 {
        u64::from(self.read_u32(offset)) | u64::from(self.read_u32(offset + 4)) << 32
    }

    /// 64-bit write as two 32-bit writes, low dword first
    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.write_u32(offset, value as u32);
        self.write_u32(offset + 4, (value >> 32) as u32);
    }

    /// Zero the whole region
    pub fn zero(&mut self) {
        for offset in (0..self.len & !3).step_by(4) {
            self.write_u32(offset, 0);
        }
    }

    /// Copy bytes into the region
    pub fn copy_in(&mut self, offset: usize, src: &[u8]) {
        if offset.checked_add(src.len()).map_or(true, |end| end > self.len) {
            debug_assert!(false, "DMA copy out of bounds");
            return;
        }
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), src.len());
        }
    }

    /// Copy bytes out of the region
    pub fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        if offset.checked_add(dst.len()).map_or(true, |end| end > self.len) {
            debug_assert!(false, "DMA copy out of bounds");
            return;
        }
        unsafe {
            ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
    }
}

/// Client data buffer that is mapped for the controller
///
/// The engine only reads or writes through the CPU pointer for immediate data
/// and bounce buffer copies.
#[derive(Debug, Clone, Copy)]
pub struct DmaSlice {
    ptr: NonNull<u8>,
    dma: u64,
    len: usize,
}

unsafe impl Send for DmaSlice {}

impl DmaSlice {
    /// Describe a mapped client buffer.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid for `len` bytes until the transfer using this
    /// slice has been given back, and `dma` must be its bus address.
    pub unsafe fn new(ptr: NonNull<u8>, dma: u64, len: usize) -> Self {
        Self { ptr, dma, len }
    }

    /// Bus address
    pub fn dma(&self) -> u64 {
        self.dma
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for a zero-length buffer
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the client buffer
    pub fn read(&self, offset: usize, dst: &mut [u8]) {
        let n = dst.len().min(self.len.saturating_sub(offset));
        unsafe { ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), dst.as_mut_ptr(), n) }
    }

    /// Copy `src` into the client buffer at `offset`
    pub fn write(&self, offset: usize, src: &[u8]) {
        let n = src.len().min(self.len.saturating_sub(offset));
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(offset), n) }
    }
}

const _: () = {
    assert!(DMA_ALIGNMENT.is_power_of_two());
    assert!(DMA_ALIGNMENT % crate::trb::TRB_SIZE == 0);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(128, 64), 128);
        assert!(is_aligned(0x1000, 64));
        assert!(!is_aligned(0x1010, 64));
    }

    #[test]
    fn test_boundary_check() {
        assert!(within_boundary(0xff00, 0x100, DMA_BOUNDARY));
        assert!(!within_boundary(0xff00, 0x101, DMA_BOUNDARY));
        assert!(within_boundary(0x1_0000, 0, DMA_BOUNDARY));
    }

    #[test]
    fn test_region_access() {
        let mut backing = [0u64; 8];
        let ptr = NonNull::new(backing.as_mut_ptr() as *mut u8).unwrap();
        let mut region = unsafe { DmaRegion::from_raw_parts(ptr, 0x4000, 64) };
        region.write_u64(8, 0x1122_3344_5566_7788);
        assert_eq!(region.read_u32(8), 0x5566_7788);
        assert_eq!(region.read_u64(8), 0x1122_3344_5566_7788);
        assert_eq!(region.offset_of(0x4010), Some(16));
        assert_eq!(region.offset_of(0x4040), None);
        region.copy_in(16, &[1, 2, 3]);
        let mut out = [0u8; 3];
        region.copy_out(16, &mut out);
        assert_eq!(out, [1, 2, 3]);
        region.zero();
        assert_eq!(region.read_u64(8), 0);
    }
}
