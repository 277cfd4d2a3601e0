//! Ring segments
//!
//! A segment is one page of TRB slots. On producer rings the last slot holds
//! the Link TRB to the next segment; event ring segments have no Link.

use crate::dma::{DmaRegion, DMA_ALIGNMENT};
use crate::error::Result;
use crate::hal::DmaMapper;
use crate::register::wmb;
use crate::trb::{Trb, TRB_CYCLE, TRB_SIZE};

/// TRB slots per segment
pub const TRBS_PER_SEGMENT: usize = 256;
/// Segment size in bytes
pub const SEGMENT_SIZE: usize = TRBS_PER_SEGMENT * TRB_SIZE;
/// Slot holding the Link TRB on producer rings
pub const LINK_SLOT: usize = TRBS_PER_SEGMENT - 1;
/// Largest bounce buffer (SuperSpeed max packet)
pub const MAX_BOUNCE: usize = 1024;

/// Arena index of a segment within its ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SegId(pub(crate) usize);

impl SegId {
    /// Arena index
    pub fn index(self) -> usize {
        self.0
    }
}

/// One segment of TRB slots
#[derive(Debug)]
pub struct Segment {
    mem: DmaRegion,
    pub(crate) next: SegId,
    /// Position in ring order, used for the ERDP segment index
    pub(crate) num: u32,
    bounce: Option<DmaRegion>,
    /// Bytes held in the bounce buffer by the TD using it
    pub(crate) bounce_len: u32,
    /// Offset into the transfer buffer the bounce data belongs to
    pub(crate) bounce_offs: u32,
}

impl Segment {
    /// Allocate a zeroed segment, optionally with a bounce buffer
    pub(crate) fn alloc<D: DmaMapper + ?Sized>(
        dma: &D,
        num: u32,
        bounce_len: usize,
    ) -> Result<Self> {
        let mut mem = dma.alloc_coherent(SEGMENT_SIZE, DMA_ALIGNMENT)?;
        mem.zero();
        let bounce = if bounce_len > 0 {
            match dma.alloc_coherent(bounce_len, DMA_ALIGNMENT) {
                Ok(buf) => Some(buf),
                Err(e) => {
                    dma.free_coherent(mem);
                    return Err(e);
                }
            }
        } else {
            None
        };
        Ok(Self {
            mem,
            next: SegId(0),
            num,
            bounce,
            bounce_len: 0,
            bounce_offs: 0,
        })
    }

    /// Release the segment memory
    pub(crate) fn free<D: DmaMapper + ?Sized>(self, dma: &D) {
        if let Some(bounce) = self.bounce {
            dma.free_coherent(bounce);
        }
        dma.free_coherent(self.mem);
    }

    /// Bus address of slot 0
    pub fn dma(&self) -> u64 {
        self.mem.dma()
    }

    /// Bus address of a slot
    pub fn trb_dma(&self, slot: usize) -> u64 {
        self.mem.dma_at(slot * TRB_SIZE)
    }

    /// Slot of a bus address inside this segment
    pub fn slot_of(&self, dma: u64) -> Option<usize> {
        let offset = self.mem.offset_of(dma)?;
        (offset % TRB_SIZE == 0).then_some(offset / TRB_SIZE)
    }

    /// Read a whole TRB
    pub fn read(&self, slot: usize) -> Trb {
        let base = slot * TRB_SIZE;
        Trb::new(
            self.mem.read_u32(base),
            self.mem.read_u32(base + 4),
            self.mem.read_u32(base + 8),
            self.mem.read_u32(base + 12),
        )
    }

    /// Read only the control dword
    pub fn read_control(&self, slot: usize) -> u32 {
        self.mem.read_u32(slot * TRB_SIZE + 12)
    }

    /// Write the three non-control dwords
    pub fn stage(&mut self, slot: usize, trb: &Trb) {
        let base = slot * TRB_SIZE;
        self.mem.write_u32(base, trb.field[0]);
        self.mem.write_u32(base + 4, trb.field[1]);
        self.mem.write_u32(base + 8, trb.field[2]);
    }

    /// Write the control dword after a write barrier, handing the TRB to the
    /// consumer when its cycle bit matches the consumer cycle state
    pub fn publish(&mut self, slot: usize, control: u32) {
        wmb();
        self.mem.write_u32(slot * TRB_SIZE + 12, control);
    }

    /// Rewrite the control dword in place without a barrier
    pub(crate) fn write_control(&mut self, slot: usize, control: u32) {
        self.mem.write_u32(slot * TRB_SIZE + 12, control);
    }

    /// Flip the cycle bit of a slot
    pub(crate) fn toggle_cycle(&mut self, slot: usize) {
        let control = self.read_control(slot);
        self.publish(slot, control ^ TRB_CYCLE);
    }

    /// Overwrite a whole slot, control dword last
    pub(crate) fn write(&mut self, slot: usize, trb: &Trb) {
        self.stage(slot, trb);
        self.publish(slot, trb.field[3]);
    }

    /// Bounce buffer, if the ring was created with one
    pub(crate) fn bounce(&self) -> Option<&DmaRegion> {
        self.bounce.as_ref()
    }

    pub(crate) fn bounce_mut(&mut self) -> Option<&mut DmaRegion> {
        self.bounce.as_mut()
    }

    /// Zero every slot
    pub(crate) fn clear(&mut self) {
        self.mem.zero();
    }

    /// Set the cycle bit in every slot (used when the ring cycle state is 0)
    pub(crate) fn set_all_cycle(&mut self) {
        for slot in 0..TRBS_PER_SEGMENT {
            let control = self.read_control(slot);
            self.write_control(slot, control | TRB_CYCLE);
        }
    }
}
