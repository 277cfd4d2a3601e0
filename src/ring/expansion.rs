//! Transfer ring growth
//!
//! New segments are spliced in right after the enqueue segment. The new
//! chain is linked to the old successor first and only then made reachable,
//! so the controller never follows a Link into unlinked memory.

use super::{Ring, SegId, LINK_SLOT, TRBS_PER_SEGMENT};
use crate::error::Result;
use crate::hal::DmaMapper;
use crate::trb::LINK_TOGGLE;

const USABLE_PER_SEGMENT: usize = TRBS_PER_SEGMENT - 1;

impl Ring {
    /// Segments that must be added before `num_trbs` more TRBs fit.
    ///
    /// Expansion is already requested when the TD would exactly fill the
    /// enqueue segment, so a full ring is never confused with the empty ring
    /// whose enqueue is parked on a Link.
    pub fn expansion_needed(&self, num_trbs: usize) -> usize {
        let enq = self.enqueue;
        let Some(past_seg) = (enq.slot + num_trbs).checked_sub(USABLE_PER_SEGMENT) else {
            // Fits in the enqueue segment; only dequeue sitting ahead of us can block it
            return usize::from(
                self.dequeue.seg == enq.seg
                    && self.dequeue.slot > enq.slot
                    && enq.slot + num_trbs > self.dequeue.slot,
            );
        };
        if self.is_link(enq) && self.dequeue == super::Cursor::new(self.next_segment(enq.seg), 0) {
            return 0;
        }
        if self.dequeue.seg == enq.seg && self.dequeue.slot > enq.slot {
            return 1 + past_seg / USABLE_PER_SEGMENT;
        }
        let mut new_segs = 1 + past_seg / USABLE_PER_SEGMENT;
        let mut seg = enq.seg;
        while new_segs > 0 {
            seg = self.next_segment(seg);
            if seg == self.dequeue.seg {
                #[cfg(feature = "defmt")]
                defmt::debug!("{} TRBs need {} more ring segments", num_trbs, new_segs);
                return new_segs;
            }
            new_segs -= 1;
        }
        0
    }

    /// Splice `new_segs` zeroed segments in after the enqueue segment.
    ///
    /// When the ring's cycle state is 0 the new TRBs start with cycle 1 so
    /// the controller sees them as not yet produced. If the enqueue segment
    /// was the last one, the toggle bit moves to the new last segment.
    pub fn expand<D: DmaMapper + ?Sized>(&mut self, dma: &D, new_segs: usize) -> Result<()> {
        if new_segs == 0 {
            return Ok(());
        }
        let fresh = Self::alloc_segments(dma, new_segs, 0, self.bounce_buf_len)?;
        let base = self.segs.len();
        self.segs.extend(fresh);
        let new_first = SegId(base);
        let new_last = SegId(base + new_segs - 1);
        for i in base..base + new_segs {
            if !self.cycle_state {
                self.segs[i].set_all_cycle();
            }
        }
        for i in base..base + new_segs - 1 {
            self.link_segment(SegId(i), SegId(i + 1));
        }

        let insert_head = self.enqueue.seg;
        let insert_next = self.next_segment(insert_head);
        self.link_segment(new_last, insert_next);
        self.link_segment(insert_head, new_first);

        if insert_head == self.last {
            if self.ring_type.is_producer() {
                let head = self.segment_mut(insert_head);
                let control = head.read_control(LINK_SLOT);
                head.write_control(LINK_SLOT, control & !LINK_TOGGLE);
                let tail = self.segment_mut(new_last);
                let control = tail.read_control(LINK_SLOT);
                tail.publish(LINK_SLOT, control | LINK_TOGGLE);
            }
            self.last = new_last;
        }

        let order: alloc::vec::Vec<SegId> = self.segment_order().collect();
        for (num, id) in order.into_iter().enumerate() {
            self.segment_mut(id).num = num as u32;
        }
        #[cfg(feature = "defmt")]
        defmt::info!("ring expanded by {} segments to {}", new_segs, self.segs.len());
        Ok(())
    }
}
