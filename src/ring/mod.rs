//! TRB rings
//!
//! A ring is an arena of [`Segment`]s linked into a cycle. Each segment knows
//! the arena id of its successor; the Link TRB in its last slot carries the
//! successor's bus address, and only the last segment's Link toggles the
//! cycle state.
//!
//! Producer rings (transfer, command) are written by software and consumed by
//! the controller. The event ring is the reverse and has no Link TRBs; its
//! segments are described to the controller by the ERST.
//!
//! Publishing a TRB is split into [`Ring::stage`] (parameter and status
//! dwords) and [`Ring::publish`] (barrier, then control dword with the cycle
//! bit). Nothing else writes a control dword that the controller may own.

mod expansion;
pub mod event_ring;
pub mod segment;

use alloc::collections::VecDeque;
use alloc::vec::Vec;

pub use event_ring::EventRing;
pub use segment::{SegId, Segment, LINK_SLOT, MAX_BOUNCE, SEGMENT_SIZE, TRBS_PER_SEGMENT};

use crate::error::{Result, XhciError};
use crate::hal::DmaMapper;
use crate::register::wmb;
use crate::td::TdId;
use crate::trb::{encode_link, CompletionCode, Trb, TrbFlags, TrbType, LINK_TOGGLE, TRB_CYCLE};

/// Kind of ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RingType {
    Control,
    Isoc,
    Bulk,
    Interrupt,
    Stream,
    Command,
    Event,
}

impl RingType {
    /// Software produces, controller consumes
    pub fn is_producer(self) -> bool {
        self != Self::Event
    }
}

/// Position of one TRB slot in a ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Cursor {
    pub seg: SegId,
    pub slot: usize,
}

impl Cursor {
    pub const fn new(seg: SegId, slot: usize) -> Self {
        Self { seg, slot }
    }
}

/// A cyclic list of TRB segments with enqueue/dequeue cursors
#[derive(Debug)]
pub struct Ring {
    pub(crate) segs: Vec<Segment>,
    pub(crate) first: SegId,
    pub(crate) last: SegId,
    pub(crate) enqueue: Cursor,
    pub(crate) dequeue: Cursor,
    pub(crate) cycle_state: bool,
    pub(crate) ring_type: RingType,
    pub(crate) bounce_buf_len: u32,
    /// Stream this ring serves, 0 for non-stream rings
    pub(crate) stream_id: u16,
    /// In-flight TDs in enqueue order
    pub(crate) td_list: VecDeque<TdId>,
    /// Completion code of the previous transfer event on this ring
    pub(crate) old_trb_comp_code: CompletionCode,
    link_chain_quirk: bool,
}

impl Ring {
    /// Allocate `num_segs` segments and link them into a cycle.
    ///
    /// Starts with cycle state 1 and both cursors on the first slot.
    pub fn new<D: DmaMapper + ?Sized>(
        dma: &D,
        ring_type: RingType,
        num_segs: usize,
        bounce_buf_len: u32,
        link_chain_quirk: bool,
    ) -> Result<Self> {
        if num_segs == 0 {
            return Err(XhciError::InvalidParameter);
        }
        let segs = Self::alloc_segments(dma, num_segs, 0, bounce_buf_len)?;
        let first = SegId(0);
        let mut ring = Self {
            segs,
            first,
            last: SegId(num_segs - 1),
            enqueue: Cursor::new(first, 0),
            dequeue: Cursor::new(first, 0),
            cycle_state: true,
            ring_type,
            bounce_buf_len,
            stream_id: 0,
            td_list: VecDeque::new(),
            old_trb_comp_code: CompletionCode::Invalid,
            link_chain_quirk,
        };
        ring.init_links();
        Ok(ring)
    }

    fn alloc_segments<D: DmaMapper + ?Sized>(
        dma: &D,
        count: usize,
        first_num: u32,
        bounce_buf_len: u32,
    ) -> Result<Vec<Segment>> {
        let mut segs = Vec::with_capacity(count);
        for i in 0..count {
            match Segment::alloc(dma, first_num + i as u32, bounce_buf_len as usize) {
                Ok(seg) => segs.push(seg),
                Err(e) => {
                    for seg in segs {
                        seg.free(dma);
                    }
                    return Err(e);
                }
            }
        }
        Ok(segs)
    }

    fn init_links(&mut self) {
        let n = self.segs.len();
        for i in 0..n {
            self.link_segment(SegId(i), SegId((i + 1) % n));
        }
        if self.ring_type.is_producer() {
            let last = &mut self.segs[self.last.0];
            let control = last.read_control(LINK_SLOT);
            last.write_control(LINK_SLOT, control | LINK_TOGGLE);
        }
    }

    /// Point `prev` at `next`, rewriting `prev`'s Link TRB address while
    /// keeping its cycle, toggle and chain bits
    pub(crate) fn link_segment(&mut self, prev: SegId, next: SegId) {
        let next_dma = self.segs[next.0].dma();
        self.segs[prev.0].next = next;
        if !self.ring_type.is_producer() {
            return;
        }
        let link = encode_link(next_dma, false, self.link_chain_quirk);
        let seg = &mut self.segs[prev.0];
        let keep = seg.read_control(LINK_SLOT) & (TRB_CYCLE | LINK_TOGGLE | TrbFlags::CHAIN.bits());
        seg.stage(LINK_SLOT, &link);
        seg.publish(LINK_SLOT, link.field[3] | keep);
    }

    /// Return all segment memory to the mapper
    pub fn free<D: DmaMapper + ?Sized>(self, dma: &D) {
        for seg in self.segs {
            seg.free(dma);
        }
    }

    /// Zero every segment and return to the freshly allocated state
    pub(crate) fn reinit(&mut self) {
        for seg in &mut self.segs {
            seg.clear();
            seg.bounce_len = 0;
            seg.bounce_offs = 0;
        }
        let ids: Vec<SegId> = self.segment_order().collect();
        for (num, id) in ids.iter().enumerate() {
            self.segs[id.0].num = num as u32;
        }
        self.last = ids.last().copied().unwrap_or(self.first);
        for (i, id) in ids.iter().enumerate() {
            let next = ids[(i + 1) % ids.len()];
            self.link_segment(*id, next);
        }
        if self.ring_type.is_producer() {
            let last = &mut self.segs[self.last.0];
            let control = last.read_control(LINK_SLOT);
            last.write_control(LINK_SLOT, control | LINK_TOGGLE);
        }
        self.enqueue = Cursor::new(self.first, 0);
        self.dequeue = self.enqueue;
        self.cycle_state = true;
        self.td_list.clear();
        self.old_trb_comp_code = CompletionCode::Invalid;
    }

    /// Segment ids in ring order starting at the first segment
    pub fn segment_order(&self) -> impl Iterator<Item = SegId> + '_ {
        let mut cur = Some(self.first);
        core::iter::from_fn(move || {
            let id = cur?;
            let next = self.segs[id.0].next;
            cur = (next != self.first).then_some(next);
            Some(id)
        })
        .take(self.segs.len())
    }

    /// Number of segments
    pub fn num_segs(&self) -> usize {
        self.segs.len()
    }

    pub fn ring_type(&self) -> RingType {
        self.ring_type
    }

    /// Producer cycle state, or the expected cycle bit on an event ring
    pub fn cycle_state(&self) -> bool {
        self.cycle_state
    }

    pub fn enqueue(&self) -> Cursor {
        self.enqueue
    }

    pub fn dequeue(&self) -> Cursor {
        self.dequeue
    }

    pub fn first_segment(&self) -> SegId {
        self.first
    }

    pub fn segment(&self, id: SegId) -> &Segment {
        &self.segs[id.0]
    }

    pub(crate) fn segment_mut(&mut self, id: SegId) -> &mut Segment {
        &mut self.segs[id.0]
    }

    /// Successor of a segment
    pub fn next_segment(&self, id: SegId) -> SegId {
        self.segs[id.0].next
    }

    /// Read the TRB at a cursor
    pub fn trb(&self, c: Cursor) -> Trb {
        self.segs[c.seg.0].read(c.slot)
    }

    /// Bus address of the TRB at a cursor
    pub fn trb_virt_to_dma(&self, c: Cursor) -> u64 {
        self.segs[c.seg.0].trb_dma(c.slot)
    }

    /// Cursor of a TRB bus address, if it belongs to this ring
    pub fn dma_to_cursor(&self, dma: u64) -> Option<Cursor> {
        self.segs
            .iter()
            .enumerate()
            .find_map(|(i, seg)| seg.slot_of(dma).map(|slot| Cursor::new(SegId(i), slot)))
    }

    /// TRB at `c` is a Link TRB
    pub fn is_link(&self, c: Cursor) -> bool {
        self.ring_type.is_producer()
            && (self.segs[c.seg.0].read_control(c.slot) >> 10) & 0x3f == TrbType::Link as u32
    }

    /// `c` is the last slot of its segment
    pub fn last_trb_on_seg(&self, c: Cursor) -> bool {
        c.slot == TRBS_PER_SEGMENT - 1
    }

    fn last_trb_on_ring(&self, c: Cursor) -> bool {
        self.last_trb_on_seg(c) && self.segs[c.seg.0].next == self.first
    }

    pub(crate) fn link_toggles_cycle(&self, c: Cursor) -> bool {
        self.segs[c.seg.0].read_control(c.slot) & LINK_TOGGLE != 0
    }

    /// Next slot in ring order; does not skip Link TRBs
    pub fn next_trb(&self, c: Cursor) -> Cursor {
        if self.is_link(c) || self.last_trb_on_seg(c) {
            Cursor::new(self.segs[c.seg.0].next, 0)
        } else {
            Cursor::new(c.seg, c.slot + 1)
        }
    }

    /// Enqueue with a parked Link skipped, the slot the next TRB really goes to
    fn effective_enqueue(&self) -> Cursor {
        if self.is_link(self.enqueue) {
            Cursor::new(self.segs[self.enqueue.seg.0].next, 0)
        } else {
            self.enqueue
        }
    }

    /// No TRBs between dequeue and enqueue
    pub fn is_empty(&self) -> bool {
        self.effective_enqueue() == self.dequeue
    }

    /// Free non-Link slots between enqueue and dequeue
    pub fn num_trbs_free(&self) -> usize {
        let mut enq = self.effective_enqueue();
        if enq == self.dequeue {
            return self.segs.len() * (TRBS_PER_SEGMENT - 1);
        }
        let mut free = 0;
        for _ in 0..=self.segs.len() {
            if self.dequeue.seg == enq.seg && self.dequeue.slot >= enq.slot {
                return free + (self.dequeue.slot - enq.slot);
            }
            free += LINK_SLOT - enq.slot;
            enq = Cursor::new(self.segs[enq.seg.0].next, 0);
        }
        free
    }

    /// Write the parameter and status dwords of a slot
    pub fn stage(&mut self, c: Cursor, trb: &Trb) {
        self.segs[c.seg.0].stage(c.slot, trb);
    }

    /// Barrier, then write the control dword of a slot
    pub fn publish(&mut self, c: Cursor, control: u32) {
        self.segs[c.seg.0].publish(c.slot, control);
    }

    /// Write `trb` at enqueue with the ring's cycle state and advance
    pub fn queue_trb(&mut self, trb: Trb, more_trbs_coming: bool) -> Cursor {
        let cycle = self.cycle_state;
        self.queue_trb_cycle(trb, cycle, more_trbs_coming)
    }

    /// Write `trb` at enqueue with an explicit cycle bit and advance.
    ///
    /// The first TRB of a TD is written with the inverted cycle so the
    /// controller cannot start on a half-built TD.
    pub(crate) fn queue_trb_cycle(&mut self, trb: Trb, cycle: bool, more_trbs_coming: bool) -> Cursor {
        let c = self.enqueue;
        let control = (trb.field[3] & !TRB_CYCLE) | u32::from(cycle);
        self.stage(c, &trb);
        self.publish(c, control);
        #[cfg(feature = "defmt")]
        defmt::trace!("queue trb {:#x} type {}", self.trb_virt_to_dma(c), trb.raw_type());
        self.inc_enq(more_trbs_coming);
        c
    }

    /// Force the cycle bit of one TRB, publishing or retracting it
    pub(crate) fn set_cycle(&mut self, c: Cursor, cycle: bool) {
        let control = self.segs[c.seg.0].read_control(c.slot);
        self.publish(c, (control & !TRB_CYCLE) | u32::from(cycle));
    }

    /// Advance enqueue past the TRB just written.
    ///
    /// A Link TRB that follows is only crossed while a TD is being built
    /// (chain set on the last TRB, or more TRBs coming); otherwise enqueue
    /// parks on it until the next `prepare`.
    pub fn inc_enq(&mut self, more_trbs_coming: bool) {
        let chain = self.trb(self.enqueue).chain();
        if self.last_trb_on_seg(self.enqueue) {
            #[cfg(feature = "defmt")]
            defmt::error!("enqueue moved past ring segment");
            return;
        }
        self.enqueue.slot += 1;
        if self.is_link(self.enqueue) && (chain || more_trbs_coming) {
            self.inc_enq_past_link(chain);
        }
    }

    /// Follow Link TRBs at enqueue, giving each to the controller.
    ///
    /// The chain bit is rewritten to `chain` unless the Link chain quirk pins
    /// it. Crossing the toggling Link flips the cycle state.
    pub fn inc_enq_past_link(&mut self, chain: bool) {
        let mut count = 0;
        while self.is_link(self.enqueue) {
            let c = self.enqueue;
            let seg = &mut self.segs[c.seg.0];
            if !self.link_chain_quirk {
                let mut control = seg.read_control(c.slot) & !TrbFlags::CHAIN.bits();
                if chain {
                    control |= TrbFlags::CHAIN.bits();
                }
                seg.write_control(c.slot, control);
            }
            seg.toggle_cycle(c.slot);
            if self.link_toggles_cycle(c) {
                self.cycle_state = !self.cycle_state;
            }
            self.enqueue = Cursor::new(self.segs[c.seg.0].next, 0);
            count += 1;
            if count > self.segs.len() {
                #[cfg(feature = "defmt")]
                defmt::warn!("link TRB loop at enqueue");
                break;
            }
        }
    }

    /// Advance dequeue by one TRB.
    ///
    /// On the event ring this wraps at segment ends and flips the cycle
    /// state after the last segment; on producer rings Link TRBs are skipped.
    pub fn inc_deq(&mut self) {
        let deq = self.dequeue;
        if !self.ring_type.is_producer() {
            if !self.last_trb_on_seg(deq) {
                self.dequeue.slot += 1;
                return;
            }
            if self.last_trb_on_ring(deq) {
                self.cycle_state = !self.cycle_state;
            }
            self.dequeue = Cursor::new(self.segs[deq.seg.0].next, 0);
            return;
        }

        if !self.is_link(deq) {
            if self.last_trb_on_seg(deq) {
                #[cfg(feature = "defmt")]
                defmt::warn!("missing link TRB at end of segment");
            } else {
                self.dequeue.slot += 1;
            }
        }
        let mut count = 0;
        while self.is_link(self.dequeue) {
            self.dequeue = Cursor::new(self.segs[self.dequeue.seg.0].next, 0);
            count += 1;
            if count > self.segs.len() {
                #[cfg(feature = "defmt")]
                defmt::warn!("ring is an endless link TRB loop");
                break;
            }
        }
    }

    /// Segment holding `dma` if that TRB lies in the TD spanning
    /// `start..=end`, allowing a TD that wraps within one segment
    pub fn trb_in_td(&self, start: Cursor, end: Cursor, dma: u64) -> Option<SegId> {
        let suspect = self.dma_to_cursor(dma)?;
        let mut cur = start.seg;
        let mut start_slot = start.slot;
        for _ in 0..self.segs.len() {
            if end.seg == cur {
                let hit = if start_slot <= end.slot {
                    suspect.seg == cur && suspect.slot >= start_slot && suspect.slot <= end.slot
                } else {
                    suspect.seg == cur && (suspect.slot >= start_slot || suspect.slot <= end.slot)
                };
                return hit.then_some(cur);
            }
            if suspect.seg == cur && suspect.slot >= start_slot {
                return Some(cur);
            }
            cur = self.segs[cur.0].next;
            start_slot = 0;
            if cur == start.seg {
                break;
            }
        }
        None
    }

    /// Turn every TRB of `start..=end` into a No-Op, keeping cycle bits.
    ///
    /// Link TRBs only lose their chain bit. With `flip_cycle`, TRBs strictly
    /// inside the span are also taken back from the controller.
    pub(crate) fn td_to_noop(&mut self, start: Cursor, end: Cursor, flip_cycle: bool) {
        let mut c = start;
        for _ in 0..self.segs.len() * TRBS_PER_SEGMENT {
            let seg = &mut self.segs[c.seg.0];
            let control = seg.read_control(c.slot);
            let mut new_control = if (control >> 10) & 0x3f == TrbType::Link as u32 {
                control & !TrbFlags::CHAIN.bits()
            } else {
                seg.stage(c.slot, &Trb::zeroed());
                (control & TRB_CYCLE) | (TrbType::TransferNoop as u32) << 10
            };
            if flip_cycle && c != start && c != end {
                new_control ^= TRB_CYCLE;
            }
            seg.publish(c.slot, new_control);
            if c == end {
                break;
            }
            c = self.next_trb(c);
        }
    }

    /// Cursor with `slot` in the segment after `c`, skipping a Link at `c`
    pub(crate) fn cursor_after(&self, c: Cursor) -> Cursor {
        let mut next = self.next_trb(c);
        if self.is_link(next) {
            next = Cursor::new(self.segs[next.seg.0].next, 0);
        }
        next
    }

    /// Barrier helper used before a doorbell write
    pub(crate) fn flush(&self) {
        wmb();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::HeapDma;
    use crate::trb::{decode_normal, encode_normal};

    fn normal(len: u32) -> Trb {
        encode_normal(0x1000, len, 0, 0, TrbFlags::IOC)
    }

    #[test]
    fn test_new_ring_links_and_toggle() {
        let dma = HeapDma::new();
        let ring = Ring::new(&dma, RingType::Bulk, 3, 0, false).unwrap();
        let order: Vec<SegId> = ring.segment_order().collect();
        assert_eq!(order.len(), 3);
        for (i, id) in order.iter().enumerate() {
            let link = ring.trb(Cursor::new(*id, LINK_SLOT));
            assert!(link.is_link());
            assert!(!link.cycle());
            let next = order[(i + 1) % 3];
            assert_eq!(link.parameter(), ring.segment(next).dma());
            assert_eq!(link.control() & LINK_TOGGLE != 0, i == 2);
        }
        assert!(ring.cycle_state());
        assert!(ring.is_empty());
        assert_eq!(ring.num_trbs_free(), 3 * 255);
        ring.free(&dma);
    }

    #[test]
    fn test_free_count_after_two_trbs() {
        let dma = HeapDma::new();
        let mut ring = Ring::new(&dma, RingType::Bulk, 1, 0, false).unwrap();
        ring.queue_trb(normal(512), false);
        ring.queue_trb(normal(512), false);
        assert_eq!(ring.enqueue().slot, 2);
        assert_eq!(ring.num_trbs_free(), 253);
        ring.free(&dma);
    }

    #[test]
    fn test_enqueue_then_dequeue_is_empty() {
        let dma = HeapDma::new();
        let mut ring = Ring::new(&dma, RingType::Bulk, 2, 0, false).unwrap();
        let c = ring.queue_trb(normal(8), false);
        assert_eq!(c, Cursor::new(SegId(0), 0));
        assert!(!ring.is_empty());
        ring.inc_deq();
        assert!(ring.is_empty());
        assert_eq!(ring.enqueue(), ring.dequeue());
        ring.free(&dma);
    }

    #[test]
    fn test_queued_trb_carries_cycle_state() {
        let dma = HeapDma::new();
        let mut ring = Ring::new(&dma, RingType::Bulk, 1, 0, false).unwrap();
        let c = ring.queue_trb(normal(64), false);
        let trb = ring.trb(c);
        assert!(trb.cycle());
        assert_eq!(decode_normal(&trb).unwrap().length, 64);
        ring.free(&dma);
    }

    #[test]
    fn test_parked_link_is_crossed_with_toggle() {
        let dma = HeapDma::new();
        let mut ring = Ring::new(&dma, RingType::Bulk, 1, 0, false).unwrap();
        for _ in 0..LINK_SLOT {
            ring.queue_trb(normal(512), false);
            ring.inc_deq();
        }
        // Enqueue parked on the Link, dequeue already wrapped to slot 0
        assert!(ring.is_link(ring.enqueue()));
        assert_eq!(ring.dequeue(), Cursor::new(SegId(0), 0));
        assert!(ring.is_empty());
        assert_eq!(ring.num_trbs_free(), 255);

        ring.inc_enq_past_link(false);
        let link = ring.trb(Cursor::new(SegId(0), LINK_SLOT));
        assert!(link.cycle());
        assert!(!link.chain());
        assert!(!ring.cycle_state());
        let c = ring.queue_trb(normal(512), false);
        assert_eq!(c, Cursor::new(SegId(0), 0));
        assert!(!ring.trb(c).cycle());
        ring.free(&dma);
    }

    #[test]
    fn test_chained_trb_crosses_link_with_chain() {
        let dma = HeapDma::new();
        let mut ring = Ring::new(&dma, RingType::Bulk, 2, 0, false).unwrap();
        for _ in 0..LINK_SLOT - 1 {
            ring.queue_trb(normal(512), false);
        }
        let chained = encode_normal(0x1000, 512, 1, 0, TrbFlags::CHAIN);
        ring.queue_trb(chained, false);
        assert_eq!(ring.enqueue(), Cursor::new(SegId(1), 0));
        let link = ring.trb(Cursor::new(SegId(0), LINK_SLOT));
        assert!(link.chain());
        assert!(link.cycle());
        // Only the last segment's Link toggles
        assert!(ring.cycle_state());
        ring.free(&dma);
    }

    #[test]
    fn test_link_chain_quirk_keeps_chain_bit() {
        let dma = HeapDma::new();
        let mut ring = Ring::new(&dma, RingType::Isoc, 2, 0, true).unwrap();
        for _ in 0..LINK_SLOT {
            ring.queue_trb(normal(512), false);
        }
        ring.inc_enq_past_link(false);
        assert!(ring.trb(Cursor::new(SegId(0), LINK_SLOT)).chain());
        ring.free(&dma);
    }

    #[test]
    fn test_trb_in_td_spans() {
        let dma = HeapDma::new();
        let ring = Ring::new(&dma, RingType::Bulk, 2, 0, false).unwrap();
        let s0 = SegId(0);
        let s1 = SegId(1);
        let at = |seg: SegId, slot: usize| ring.trb_virt_to_dma(Cursor::new(seg, slot));

        // Span crossing into the second segment
        let start = Cursor::new(s0, 250);
        let end = Cursor::new(s1, 3);
        assert_eq!(ring.trb_in_td(start, end, at(s0, 252)), Some(s0));
        assert_eq!(ring.trb_in_td(start, end, at(s0, LINK_SLOT)), Some(s0));
        assert_eq!(ring.trb_in_td(start, end, at(s1, 3)), Some(s1));
        assert_eq!(ring.trb_in_td(start, end, at(s1, 4)), None);
        assert_eq!(ring.trb_in_td(start, end, at(s0, 249)), None);

        // Span wrapped within a single segment
        let start = Cursor::new(s0, 200);
        let end = Cursor::new(s0, 10);
        assert_eq!(ring.trb_in_td(start, end, at(s0, 5)), Some(s0));
        assert_eq!(ring.trb_in_td(start, end, at(s0, 220)), Some(s0));
        assert_eq!(ring.trb_in_td(start, end, at(s0, 100)), None);
        assert_eq!(ring.trb_in_td(start, end, 0xdead_0000), None);
        ring.free(&dma);
    }

    #[test]
    fn test_td_to_noop_preserves_cycle() {
        let dma = HeapDma::new();
        let mut ring = Ring::new(&dma, RingType::Bulk, 1, 0, false).unwrap();
        let start = ring.queue_trb(encode_normal(0x1000, 512, 1, 0, TrbFlags::CHAIN), true);
        let end = ring.queue_trb(normal(512), false);
        ring.td_to_noop(start, end, false);
        for c in [start, end] {
            let trb = ring.trb(c);
            assert_eq!(trb.trb_type(), Some(TrbType::TransferNoop));
            assert!(trb.cycle());
            assert_eq!(trb.field[0..3], [0, 0, 0]);
            assert!(!trb.chain());
        }
        ring.free(&dma);
    }

    #[test]
    fn test_dma_to_cursor() {
        let dma = HeapDma::new();
        let ring = Ring::new(&dma, RingType::Bulk, 2, 0, false).unwrap();
        let c = Cursor::new(SegId(1), 17);
        assert_eq!(ring.dma_to_cursor(ring.trb_virt_to_dma(c)), Some(c));
        assert_eq!(ring.dma_to_cursor(ring.trb_virt_to_dma(c) + 4), None);
        ring.free(&dma);
    }
}
