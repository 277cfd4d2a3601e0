//! Bulk TD construction
//!
//! Buffers are split at 64 KiB boundaries and scatter-gather element ends.
//! A TD that would continue past a Link TRB must leave the segment on a
//! max-packet boundary; when splitting the TRB cannot achieve that, the tail
//! goes through the segment's bounce buffer.

use heapless::Vec as ScratchVec;

use super::{TransferFlags, TransferId};
use crate::controller::HostState;
use crate::error::{Result, XhciError};
use crate::hal::Platform;
use crate::ring::{Ring, LINK_SLOT, MAX_BOUNCE};
use crate::td::{count_sg_trbs, count_trbs, td_remainder};
use crate::trb::{encode_normal, TrbFlags, MAX_TD_SIZE, TRB_MAX_BUFF_SIZE};

/// Largest payload carried as immediate data
pub(crate) const TRB_IDT_MAX_SIZE: usize = 8;

/// OUT payload small enough to travel inside the TRB
pub(crate) fn suitable_for_idt(dir_in: bool, sg: bool, max_packet: u16, len: usize) -> bool {
    !dir_in && !sg && usize::from(max_packet) >= TRB_IDT_MAX_SIZE && len <= TRB_IDT_MAX_SIZE
}

/// Payload of an immediate data TRB, little endian
pub(crate) fn immediate_data(buffer: &super::TransferBuffer, len: usize) -> u64 {
    let mut bytes = [0u8; TRB_IDT_MAX_SIZE];
    buffer.read_at(0, &mut bytes[..len.min(TRB_IDT_MAX_SIZE)]);
    u64::from_le_bytes(bytes)
}

/// Outcome of aligning a TRB that precedes a Link
enum Align {
    /// Keep the TRB, possibly shortened
    Direct(usize),
    /// Send `len` bytes from the segment bounce buffer
    Bounce(usize),
}

/// Shorten the TRB to end on a max-packet boundary, or plan a bounce when it
/// is already shorter than the misalignment
fn align_td(enqd_len: usize, trb_len: usize, full_len: usize, max_packet: usize) -> Align {
    let unalign = (enqd_len + trb_len) % max_packet;
    if unalign == 0 {
        return Align::Direct(trb_len);
    }
    if trb_len > unalign {
        return Align::Direct(trb_len - unalign);
    }
    let new_len = (max_packet - enqd_len % max_packet).min(full_len - enqd_len);
    Align::Bounce(new_len)
}

impl HostState {
    /// Queue a bulk request, plus a zero-length TD when one is due
    pub(crate) fn queue_bulk_tx<P: Platform>(&mut self, hw: &P, urb_id: TransferId) -> Result<()> {
        let urb = self.urbs.get(&urb_id).ok_or(XhciError::InvalidParameter)?;
        let (slot_id, ep_index, stream_id) = (urb.slot_id, urb.ep_index, urb.stream_id);
        let ep = self.slots.ep(slot_id, ep_index).ok_or(XhciError::NoDevice)?;
        let max_packet = ep.config.max_packet.max(1);
        let full_len = urb.length;
        let sg = urb.buffer.is_sg();
        let num_trbs = if sg {
            count_sg_trbs(urb.buffer.blocks(), full_len)
        } else {
            let addr = urb.buffer.blocks().next().map_or(0, |(addr, _)| addr);
            count_trbs(addr, full_len as u64)
        };
        let need_zero_pkt = urb.flags.contains(TransferFlags::ZERO_PACKET)
            && !urb.dir_in
            && full_len > 0
            && full_len % usize::from(max_packet) == 0;

        let td_id = self.prepare_transfer(hw, urb_id, 0, num_trbs + usize::from(need_zero_pkt))?;
        let interrupter = self.config.interrupter;
        let mode = self.td_size_mode;
        let urb = self.urbs.get(&urb_id).ok_or(XhciError::InvalidParameter)?;
        let dir_in = urb.dir_in;
        let idt = suitable_for_idt(dir_in, sg, max_packet, full_len);
        let ring = ring_of(&mut self.slots, slot_id, ep_index, stream_id)?;
        let start = ring.enqueue();
        let start_cycle = ring.cycle_state();

        let mut blocks = urb.buffer.blocks();
        let (mut addr, mut block_len) = blocks.next().unwrap_or((0, 0));
        let mut enqd_len = 0usize;
        let mut first = true;
        let mut more_trbs_coming = true;
        while first || enqd_len < full_len {
            let boundary = TRB_MAX_BUFF_SIZE as usize - (addr & (u64::from(TRB_MAX_BUFF_SIZE) - 1)) as usize;
            let mut trb_len = boundary.min(block_len).min(full_len - enqd_len);
            let cycle = if first { !start_cycle } else { ring.cycle_state() };
            first = false;
            let mut flags = TrbFlags::empty();
            let mut send_addr = addr;

            if enqd_len + trb_len < full_len {
                flags |= TrbFlags::CHAIN;
                let enq = ring.enqueue();
                if enq.slot + 1 == LINK_SLOT && ring.is_link(ring.next_trb(enq)) {
                    match align_td(enqd_len, trb_len, full_len, usize::from(max_packet)) {
                        Align::Direct(len) => trb_len = len,
                        Align::Bounce(len) => {
                            if let Some(bounce_dma) = fill_bounce(ring, urb, enqd_len, len)? {
                                trb_len = len;
                                send_addr = bounce_dma;
                                if let Some(td) = self.tds.get_mut(td_id) {
                                    td.bounce_seg = Some(enq.seg);
                                }
                            }
                        }
                    }
                }
            }
            if enqd_len + trb_len >= full_len {
                flags.remove(TrbFlags::CHAIN);
                flags |= TrbFlags::IOC;
                more_trbs_coming = false;
                if let Some(td) = self.tds.get_mut(td_id) {
                    td.end = ring.enqueue();
                }
                if idt {
                    send_addr = immediate_data(&urb.buffer, trb_len);
                    flags |= TrbFlags::IDT;
                }
            }
            if dir_in {
                flags |= TrbFlags::ISP;
            }

            let remainder = td_remainder(
                mode,
                enqd_len as u32,
                trb_len as u32,
                full_len as u32,
                max_packet,
                more_trbs_coming,
            )
            .min(MAX_TD_SIZE);
            let trb = encode_normal(send_addr, trb_len as u32, remainder as u8, interrupter, flags);
            ring.queue_trb_cycle(trb, cycle, more_trbs_coming || need_zero_pkt);

            enqd_len += trb_len;
            addr += trb_len as u64;
            let mut sent = trb_len;
            if sg {
                while sent >= block_len {
                    sent -= block_len;
                    match blocks.next() {
                        Some((next_addr, next_len)) => {
                            block_len = next_len;
                            addr = next_addr + sent as u64;
                        }
                        None => break,
                    }
                }
            }
            block_len = block_len.saturating_sub(sent);
        }
        // Ends the borrow of the request buffer
        drop(blocks);
        if enqd_len != full_len {
            #[cfg(feature = "defmt")]
            defmt::warn!("bulk TD length {} does not match request {}", enqd_len, full_len);
        }

        if need_zero_pkt {
            let zlp = self.open_td(urb_id, 1)?;
            let ring = ring_of(&mut self.slots, slot_id, ep_index, stream_id)?;
            let end = ring.queue_trb(encode_normal(0, 0, 0, interrupter, TrbFlags::IOC), false);
            if let Some(td) = self.tds.get_mut(zlp) {
                td.end = end;
            }
        }

        #[cfg(feature = "defmt")]
        defmt::trace!("bulk TD of {} bytes on slot {} ep {}", full_len, slot_id, ep_index);
        self.giveback_first_trb(hw, slot_id, ep_index, stream_id, start_cycle, start);
        Ok(())
    }
}

/// Ring of an endpoint stream
pub(crate) fn ring_of(
    slots: &mut crate::endpoint::SlotTable,
    slot_id: u8,
    ep_index: u8,
    stream_id: u16,
) -> Result<&mut Ring> {
    slots
        .ep_mut(slot_id, ep_index)
        .ok_or(XhciError::NoDevice)?
        .ring_for_stream_mut(stream_id)
        .ok_or(XhciError::InvalidStream)
}

/// Stage `len` bytes for the enqueue segment's bounce buffer. OUT data is
/// copied in now; IN data is copied out when the TD completes.
fn fill_bounce(ring: &mut Ring, urb: &super::Urb, enqd_len: usize, len: usize) -> Result<Option<u64>> {
    let seg = ring.segment_mut(ring.enqueue().seg);
    let Some(bounce) = seg.bounce_mut() else {
        #[cfg(feature = "defmt")]
        defmt::warn!("no bounce buffer for unaligned TD tail");
        return Ok(None);
    };
    if len > bounce.len() || len > MAX_BOUNCE {
        return Err(XhciError::InvalidParameter);
    }
    if !urb.dir_in {
        let mut scratch: ScratchVec<u8, MAX_BOUNCE> = ScratchVec::new();
        scratch.resize(len, 0).map_err(|_| XhciError::NoResources)?;
        urb.buffer.read_at(enqd_len, &mut scratch);
        bounce.copy_in(0, &scratch);
    }
    let dma = bounce.dma();
    seg.bounce_len = len as u32;
    seg.bounce_offs = enqd_len as u32;
    Ok(Some(dma))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_td_shortens_when_possible() {
        // 700 + 400 = 1100, 76 past a 512 boundary
        match align_td(700, 400, 4096, 512) {
            Align::Direct(len) => assert_eq!(len, 324),
            Align::Bounce(_) => panic!("expected a split"),
        }
        match align_td(512, 512, 4096, 512) {
            Align::Direct(len) => assert_eq!(len, 512),
            Align::Bounce(_) => panic!("already aligned"),
        }
    }

    #[test]
    fn test_align_td_bounces_short_tail() {
        // 100 bytes that cannot be split down to a boundary
        match align_td(600, 100, 4096, 512) {
            Align::Bounce(len) => assert_eq!(len, 424),
            Align::Direct(_) => panic!("expected a bounce"),
        }
        match align_td(600, 100, 650, 512) {
            Align::Bounce(len) => assert_eq!(len, 50),
            Align::Direct(_) => panic!("expected a bounce"),
        }
    }

    #[test]
    fn test_idt_rules() {
        assert!(suitable_for_idt(false, false, 64, 8));
        assert!(suitable_for_idt(false, false, 64, 0));
        assert!(!suitable_for_idt(true, false, 64, 8));
        assert!(!suitable_for_idt(false, true, 64, 8));
        assert!(!suitable_for_idt(false, false, 64, 9));
        assert!(!suitable_for_idt(false, false, 4, 4));
    }
}
