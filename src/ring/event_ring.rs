//! Event ring and its segment table

use super::{Ring, RingType, TRBS_PER_SEGMENT};
use crate::dma::{DmaRegion, DMA_ALIGNMENT};
use crate::error::{Result, XhciError};
use crate::hal::DmaMapper;
use crate::register::{rmb, ERST_DESI_MASK, ERST_PTR_MASK};
use crate::trb::{Trb, TRB_CYCLE};

/// Bytes per ERST entry
pub const ERST_ENTRY_SIZE: usize = 16;

/// Consumer side of the interrupter's event ring
#[derive(Debug)]
pub struct EventRing {
    ring: Ring,
    erst: DmaRegion,
}

impl EventRing {
    /// Allocate `num_segs` segments and an ERST describing them in ring order
    pub fn new<D: DmaMapper + ?Sized>(dma: &D, num_segs: usize) -> Result<Self> {
        let ring = Ring::new(dma, RingType::Event, num_segs, 0, false)?;
        let mut erst = match dma.alloc_coherent(num_segs * ERST_ENTRY_SIZE, DMA_ALIGNMENT) {
            Ok(erst) => erst,
            Err(e) => {
                ring.free(dma);
                return Err(e);
            }
        };
        erst.zero();
        for (i, id) in ring.segment_order().enumerate() {
            let offset = i * ERST_ENTRY_SIZE;
            erst.write_u64(offset, ring.segment(id).dma());
            erst.write_u32(offset + 8, TRBS_PER_SEGMENT as u32);
            erst.write_u32(offset + 12, 0);
        }
        Ok(Self { ring, erst })
    }

    /// Release ring and table memory
    pub fn free<D: DmaMapper + ?Sized>(self, dma: &D) {
        dma.free_coherent(self.erst);
        self.ring.free(dma);
    }

    /// Check that the table fits the controller's ERST Max
    pub fn check_erst_max(&self, erst_max: usize) -> Result<()> {
        if self.ring.num_segs() > erst_max {
            return Err(XhciError::InvalidParameter);
        }
        Ok(())
    }

    /// Bus address of the ERST (ERSTBA)
    pub fn erst_dma(&self) -> u64 {
        self.erst.dma()
    }

    /// Number of ERST entries (ERSTSZ)
    pub fn erst_size(&self) -> u32 {
        self.ring.num_segs() as u32
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Event at dequeue if the controller has produced it.
    ///
    /// Ownership is decided from the control dword alone; the rest of the
    /// TRB is read only after a read barrier.
    pub fn current(&self) -> Option<Trb> {
        let deq = self.ring.dequeue();
        let control = self.ring.segment(deq.seg).read_control(deq.slot);
        if (control & TRB_CYCLE != 0) != self.ring.cycle_state() {
            return None;
        }
        rmb();
        Some(self.ring.trb(deq))
    }

    /// Consume the event at dequeue
    pub fn advance(&mut self) {
        self.ring.inc_deq();
    }

    /// Bus address of the dequeue slot
    pub fn dequeue_dma(&self) -> u64 {
        self.ring.trb_virt_to_dma(self.ring.dequeue())
    }

    /// ERDP value for the current dequeue: pointer plus segment index, EHB clear
    pub fn erdp_value(&self) -> u64 {
        let seg = self.ring.segment(self.ring.dequeue().seg);
        (self.dequeue_dma() & ERST_PTR_MASK) | (u64::from(seg.num) & ERST_DESI_MASK)
    }
}
