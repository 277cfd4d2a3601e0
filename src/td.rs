//! Transfer descriptors
//!
//! A TD is the span of TRBs queued for one request (or one isochronous
//! packet). TDs live in a generational slab owned by the controller state;
//! rings and endpoints refer to them by [`TdId`], so a stale id left in a
//! list can never reach a recycled TD.

use alloc::vec::Vec;

use crate::config::Quirks;
use crate::error::XhciError;
use crate::ring::{Cursor, Ring, SegId};
use crate::transfer::TransferId;
use crate::trb::{TRB_LEN_MASK, TRB_MAX_BUFF_SIZE};

/// Slab handle of a TD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TdId {
    index: u32,
    gen: u32,
}

/// Progress of a cancelled TD through the cancellation protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CancelStatus {
    /// Cancelled, controller may still have it cached
    Dirty,
    /// Put on the cancelled list by halt recovery
    Halted,
    /// Waiting for a Set TR Dequeue to move the controller past it
    ClearingCache,
    /// Needs a Set TR Dequeue on another stream once the pending one finishes
    ClearingCacheDeferred,
    /// Safe to give back
    Cleared,
}

/// One transfer descriptor
#[derive(Debug)]
pub struct Td {
    pub(crate) urb: TransferId,
    /// Position of this TD within its request (isochronous packet index)
    pub(crate) index: usize,
    pub(crate) slot_id: u8,
    pub(crate) ep_index: u8,
    pub(crate) stream_id: u16,
    pub(crate) start: Cursor,
    pub(crate) end: Cursor,
    /// Segment whose bounce buffer holds this TD's realigned tail
    pub(crate) bounce_seg: Option<SegId>,
    /// Completion status, `None` while pending or on success
    pub(crate) status: Option<XhciError>,
    pub(crate) cancel_status: Option<CancelStatus>,
    /// Error reported on a non-final TRB; the TD completes on its last event
    pub(crate) error_mid_td: bool,
    /// Actual length already accounted on an earlier event
    pub(crate) urb_length_set: bool,
    pub(crate) on_td_list: bool,
    pub(crate) on_cancelled_list: bool,
}

impl Td {
    pub(crate) fn new(urb: TransferId, index: usize, slot_id: u8, ep_index: u8, stream_id: u16, start: Cursor) -> Self {
        Self {
            urb,
            index,
            slot_id,
            ep_index,
            stream_id,
            start,
            end: start,
            bounce_seg: None,
            status: None,
            cancel_status: None,
            error_mid_td: false,
            urb_length_set: false,
            on_td_list: true,
            on_cancelled_list: false,
        }
    }

    /// Request this TD belongs to
    pub fn transfer(&self) -> TransferId {
        self.urb
    }

    pub fn start(&self) -> Cursor {
        self.start
    }

    pub fn end(&self) -> Cursor {
        self.end
    }

    pub fn cancel_status(&self) -> Option<CancelStatus> {
        self.cancel_status
    }
}

#[derive(Debug)]
struct Entry {
    gen: u32,
    td: Option<Td>,
}

/// Generational slab of TDs
#[derive(Debug, Default)]
pub struct TdArena {
    entries: Vec<Entry>,
    free: Vec<u32>,
    live: usize,
}

impl TdArena {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn insert(&mut self, td: Td) -> TdId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.td = Some(td);
            return TdId {
                index,
                gen: entry.gen,
            };
        }
        self.entries.push(Entry { gen: 0, td: Some(td) });
        TdId {
            index: (self.entries.len() - 1) as u32,
            gen: 0,
        }
    }

    pub fn get(&self, id: TdId) -> Option<&Td> {
        self.entries
            .get(id.index as usize)
            .filter(|e| e.gen == id.gen)
            .and_then(|e| e.td.as_ref())
    }

    pub fn get_mut(&mut self, id: TdId) -> Option<&mut Td> {
        self.entries
            .get_mut(id.index as usize)
            .filter(|e| e.gen == id.gen)
            .and_then(|e| e.td.as_mut())
    }

    /// Take a TD out; its id becomes stale
    pub fn remove(&mut self, id: TdId) -> Option<Td> {
        let entry = self.entries.get_mut(id.index as usize)?;
        if entry.gen != id.gen {
            return None;
        }
        let td = entry.td.take()?;
        entry.gen = entry.gen.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        Some(td)
    }

    /// Number of live TDs
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

/// TRBs needed for `len` bytes at bus address `addr`, split on 64 KiB boundaries.
/// A zero-length buffer still takes one TRB.
pub fn count_trbs(addr: u64, len: u64) -> usize {
    let max = u64::from(TRB_MAX_BUFF_SIZE);
    let n = (len + (addr & (max - 1))).div_ceil(max);
    n.max(1) as usize
}

/// TRBs needed for a scatter-gather list covering `full_len` bytes
pub fn count_sg_trbs(sg: impl IntoIterator<Item = (u64, usize)>, full_len: usize) -> usize {
    let mut remaining = full_len;
    let mut num_trbs = 0;
    for (addr, len) in sg {
        num_trbs += count_trbs(addr, len as u64);
        remaining -= len.min(remaining);
        if remaining == 0 {
            break;
        }
    }
    num_trbs
}

/// How the TD Size field is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TdSizeMode {
    /// Max-packet sized packets remaining after this TRB (HCI >= 1.0)
    Packets,
    /// Bytes remaining including this TRB, shifted right by 10 (HCI < 1.0)
    Legacy,
    /// Packets remaining including this TRB (MediaTek pre-1.0)
    PacketsInclusive,
}

impl TdSizeMode {
    pub fn for_host(hci_version: u16, quirks: Quirks) -> Self {
        match (hci_version < 0x100, quirks.contains(Quirks::MTK_HOST)) {
            (false, _) => Self::Packets,
            (true, true) => Self::PacketsInclusive,
            (true, false) => Self::Legacy,
        }
    }
}

/// TD Size for a TRB of `trb_buff_len` bytes after `transferred` bytes of a
/// `td_total_len` byte TD. The last TRB of a TD always gets 0; the TRB codec
/// clamps the result to the 5-bit field.
pub fn td_remainder(
    mode: TdSizeMode,
    transferred: u32,
    trb_buff_len: u32,
    td_total_len: u32,
    max_packet: u16,
    more_trbs_coming: bool,
) -> u32 {
    if mode == TdSizeMode::Legacy {
        return td_total_len.saturating_sub(transferred) >> 10;
    }
    if !more_trbs_coming || (transferred == 0 && trb_buff_len == 0) || trb_buff_len == td_total_len {
        return 0;
    }
    let trb_buff_len = if mode == TdSizeMode::PacketsInclusive { 0 } else { trb_buff_len };
    let maxp = u32::from(max_packet.max(1));
    let total_packet_count = td_total_len.div_ceil(maxp);
    total_packet_count.saturating_sub((transferred + trb_buff_len) / maxp)
}

/// Bytes described by the TD's data TRBs before `stop`, ignoring No-Ops and Links
pub fn sum_trb_lengths(ring: &Ring, td: &Td, stop: Cursor) -> u32 {
    let mut sum = 0;
    let mut c = td.start;
    for _ in 0..ring.num_segs() * crate::ring::TRBS_PER_SEGMENT {
        if c == stop {
            break;
        }
        let trb = ring.trb(c);
        if !trb.is_noop() && !trb.is_link() {
            sum += trb.status() & TRB_LEN_MASK;
        }
        c = ring.next_trb(c);
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingType;
    use crate::test_util::HeapDma;
    use crate::trb::{encode_normal, TrbFlags};

    #[test]
    fn test_count_trbs_boundaries() {
        assert_eq!(count_trbs(0x1000, 0), 1);
        assert_eq!(count_trbs(0x1000, 1024), 1);
        assert_eq!(count_trbs(0x0, 0x10000), 1);
        assert_eq!(count_trbs(0x0, 0x10001), 2);
        // Crossing one 64 KiB boundary
        assert_eq!(count_trbs(0xfff0, 0x20), 2);
    }

    #[test]
    fn test_count_sg_trbs_stops_at_length() {
        let sg = [(0x1_0000u64, 4096usize), (0x2_fff0, 64), (0x4_0000, 4096)];
        assert_eq!(count_sg_trbs(sg, 4096 + 64), 3);
        assert_eq!(count_sg_trbs(sg, 100), 1);
    }

    #[test]
    fn test_td_remainder_packets() {
        let m = TdSizeMode::Packets;
        // 1024-byte TD at max packet 512 in two TRBs
        assert_eq!(td_remainder(m, 0, 512, 1024, 512, true), 1);
        assert_eq!(td_remainder(m, 512, 512, 1024, 512, false), 0);
        // Single TRB covering the whole TD
        assert_eq!(td_remainder(m, 0, 1024, 1024, 512, true), 0);
        // Zero-length first TRB
        assert_eq!(td_remainder(m, 0, 0, 0, 512, true), 0);
    }

    #[test]
    fn test_td_remainder_legacy_and_mtk() {
        assert_eq!(td_remainder(TdSizeMode::Legacy, 0, 0x10000, 0x18000, 512, true), 0x60);
        assert_eq!(td_remainder(TdSizeMode::PacketsInclusive, 0, 512, 1024, 512, true), 2);
        assert_eq!(TdSizeMode::for_host(0x96, Quirks::MTK_HOST), TdSizeMode::PacketsInclusive);
        assert_eq!(TdSizeMode::for_host(0x96, Quirks::empty()), TdSizeMode::Legacy);
        assert_eq!(TdSizeMode::for_host(0x110, Quirks::MTK_HOST), TdSizeMode::Packets);
    }

    #[test]
    fn test_arena_ids_go_stale() {
        let mut arena = TdArena::new();
        let start = Cursor::new(SegId(0), 0);
        let a = arena.insert(Td::new(TransferId(1), 0, 1, 2, 0, start));
        assert!(arena.get(a).is_some());
        assert!(arena.remove(a).is_some());
        let b = arena.insert(Td::new(TransferId(2), 0, 1, 2, 0, start));
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(b).map(|td| td.transfer()), Some(TransferId(2)));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_sum_trb_lengths_skips_noops() {
        let dma = HeapDma::new();
        let mut ring = Ring::new(&dma, RingType::Bulk, 1, 0, false).unwrap();
        let start = ring.queue_trb(encode_normal(0x1000, 100, 0, 0, TrbFlags::CHAIN), true);
        let mid = ring.queue_trb(encode_normal(0x2000, 200, 0, 0, TrbFlags::CHAIN), true);
        let end = ring.queue_trb(encode_normal(0x3000, 300, 0, 0, TrbFlags::IOC), false);
        let mut td = Td::new(TransferId(7), 0, 1, 2, 0, start);
        td.end = end;
        assert_eq!(sum_trb_lengths(&ring, &td, end), 300);
        ring.td_to_noop(mid, mid, false);
        assert_eq!(sum_trb_lengths(&ring, &td, end), 100);
        ring.free(&dma);
    }
}
