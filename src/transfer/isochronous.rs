//! Isochronous TD construction
//!
//! Every packet of a request becomes its own TD, starting with an Isoch TRB
//! that carries the burst accounting and either an explicit frame id or
//! SIA. A request whose later TDs cannot be queued is rolled back in full:
//! the TRBs already written become No-Ops and enqueue returns to where the
//! request started.

use super::bulk::ring_of;
use super::{TransferFlags, TransferId};
use crate::config::Quirks;
use crate::controller::HostState;
use crate::endpoint::UsbSpeed;
use crate::error::{Result, XhciError};
use crate::hal::{EpContextState, Platform};
use crate::ring::Cursor;
use crate::td::{count_trbs, td_remainder};
use crate::trb::{encode_isoc, encode_normal, IsocFrame, TrbFlags, MAX_TD_SIZE, TRB_MAX_BUFF_SIZE};

/// Microframes between reading MFINDEX and the controller acting on a new TD
const CFC_DELAY: u32 = 10;

/// Scheduling window length after the current frame, in frames
const FRAME_WINDOW: u32 = 895;

const FRAME_ID_MASK: u32 = 0x7ff;

fn round_up(value: u32, multiple: u32) -> u32 {
    let multiple = multiple.max(1);
    value.div_ceil(multiple) * multiple
}

fn is_superspeed(speed: UsbSpeed) -> bool {
    matches!(speed, UsbSpeed::Super | UsbSpeed::SuperPlus)
}

/// Isochronous Scheduling Threshold in microframes. Bit 3 set means the
/// low three bits count frames.
pub(crate) fn ist_microframes(ist: u32) -> u32 {
    let threshold = ist & 0x7;
    if ist & (1 << 3) != 0 {
        threshold << 3
    } else {
        threshold
    }
}

/// Transfer Burst Count (zero-based) for a TD of `total_packets` packets.
/// Only SuperSpeed endpoints burst, and only 1.0+ controllers have the field.
pub fn isoc_burst_count(hci_version: u16, speed: UsbSpeed, max_burst: u8, total_packets: u32) -> u32 {
    if hci_version < 0x100 || !is_superspeed(speed) {
        return 0;
    }
    total_packets.div_ceil(u32::from(max_burst) + 1).saturating_sub(1)
}

/// Packets in the last burst of a TD, zero-based (TLBPC)
pub fn isoc_last_burst_packet_count(hci_version: u16, speed: UsbSpeed, max_burst: u8, total_packets: u32) -> u32 {
    if hci_version < 0x100 {
        return 0;
    }
    if is_superspeed(speed) {
        let residue = total_packets % (u32::from(max_burst) + 1);
        if residue == 0 {
            return u32::from(max_burst);
        }
        return residue - 1;
    }
    total_packets.saturating_sub(1)
}

/// Frame ids software may schedule at `mfindex`: from MFINDEX + IST + 1
/// rounded up to a frame, to MFINDEX + 895 ms rounded down. Both are 11-bit
/// frame ids and the window may wrap.
pub fn isoc_frame_window(mfindex: u32, ist: u32) -> (u32, u32) {
    let start = round_up(mfindex + ist_microframes(ist) + 1, 8);
    let end = (mfindex + FRAME_WINDOW * 8) & !0x7;
    ((start >> 3) & FRAME_ID_MASK, (end >> 3) & FRAME_ID_MASK)
}

fn frame_in_window(frame: u32, start_id: u32, end_id: u32) -> bool {
    if start_id < end_id {
        frame >= start_id && frame <= end_id
    } else if start_id > end_id {
        !(frame > end_id && frame < start_id)
    } else {
        false
    }
}

/// Block Event Interrupt for TD `i` of `num_tds`. The last TD always
/// interrupts; with AVOID_BEI every `bei_interval`th TD does as well.
fn block_event_intr(hci_version: u16, num_tds: usize, i: usize, bei_interval: u32, avoid_bei: bool) -> bool {
    if hci_version < 0x100 || i + 1 == num_tds {
        return false;
    }
    if i > 0 && bei_interval > 0 && avoid_bei {
        return i as u32 % bei_interval != 0;
    }
    true
}

impl HostState {
    /// Reserve ring room for the whole request and pick its start frame
    pub(crate) fn queue_isoc_tx_prepare<P: Platform>(&mut self, hw: &P, urb_id: TransferId) -> Result<()> {
        let urb = self.urbs.get(&urb_id).ok_or(XhciError::InvalidParameter)?;
        if urb.buffer.is_sg() {
            return Err(XhciError::InvalidParameter);
        }
        let (slot_id, ep_index, stream_id) = (urb.slot_id, urb.ep_index, urb.stream_id);
        let mut num_trbs = 0;
        for packet in &urb.iso {
            let addr = urb.buffer.dma_at(packet.offset).ok_or(XhciError::InvalidParameter)?;
            num_trbs += count_trbs(addr, packet.length as u64);
        }
        self.prepare_ring(hw, slot_id, ep_index, stream_id, num_trbs)?;
        self.check_interval(urb_id);

        let frames = self.slots.get(slot_id).ok_or(XhciError::NoDevice)?.info.speed.uses_frames();
        let ep = self.slots.ep(slot_id, ep_index).ok_or(XhciError::NoDevice)?;
        let busy = ep.ring_for_stream(stream_id).is_some_and(|ring| !ring.td_list.is_empty());
        let next_frame_id = ep.next_frame_id;
        let running = hw.endpoint_state(slot_id, ep_index) == EpContextState::Running;
        let mfindex = self.regs.mfindex(hw);
        let ist = ist_microframes(self.regs.ist());
        let cfc = self.regs.cfc();

        let urb = self.urbs.get_mut(&urb_id).ok_or(XhciError::InvalidParameter)?;
        if cfc && busy && running {
            urb.start_frame = next_frame_id;
        } else {
            let start = round_up(mfindex + ist + CFC_DELAY, 8);
            urb.start_frame = if frames {
                round_up(start, urb.interval << 3) >> 3
            } else {
                round_up(start, urb.interval)
            };
        }
        #[cfg(feature = "defmt")]
        defmt::trace!("isoc start frame {} interval {}", urb.start_frame, urb.interval);
        self.queue_isoc_tx(hw, urb_id)
    }

    /// Frame id for TD `index`, or `None` to fall back to SIA. The first TD
    /// is moved into the window when its frame has already passed.
    fn isoc_frame_id<P: Platform>(&mut self, hw: &P, urb_id: TransferId, index: usize) -> Option<u16> {
        let frames = self.slots.get(self.urbs.get(&urb_id)?.slot_id)?.info.speed.uses_frames();
        let (start_id, end_id) = isoc_frame_window(self.regs.mfindex(hw), self.regs.ist());
        let urb = self.urbs.get_mut(&urb_id)?;
        let target = urb.start_frame + index as u32 * urb.interval;
        let mut frame = if frames { target } else { target >> 3 } & FRAME_ID_MASK;
        let mut valid = frame_in_window(frame, start_id, end_id);

        if index == 0 && (!valid || frame == start_id) {
            frame = start_id + 1;
            urb.start_frame = if frames { frame } else { frame << 3 };
            valid = true;
        }
        if !valid {
            #[cfg(feature = "defmt")]
            defmt::warn!(
                "frame id {} (index {}) outside {}..={}, using SIA",
                frame,
                index,
                start_id,
                end_id
            );
            return None;
        }
        Some((frame & FRAME_ID_MASK) as u16)
    }

    fn queue_isoc_tx<P: Platform>(&mut self, hw: &P, urb_id: TransferId) -> Result<()> {
        let urb = self.urbs.get(&urb_id).ok_or(XhciError::InvalidParameter)?;
        let (slot_id, ep_index, stream_id) = (urb.slot_id, urb.ep_index, urb.stream_id);
        let num_tds = urb.iso.len();
        let dir_in = urb.dir_in;
        let asap = urb.flags.contains(TransferFlags::ISO_ASAP);
        let speed = self.slots.get(slot_id).ok_or(XhciError::NoDevice)?.info.speed;
        let ep = self.slots.ep(slot_id, ep_index).ok_or(XhciError::NoDevice)?;
        let max_packet = ep.config.max_packet.max(1);
        let max_burst = ep.config.max_burst;
        let extended_tbc = ep.use_extended_tbc;
        let hci_version = self.regs.hci_version;
        let cfc = self.regs.cfc();
        let interrupter = self.config.interrupter;
        let avoid_bei = self.config.quirks.contains(Quirks::AVOID_BEI);
        let mode = self.td_size_mode;

        let ring = ring_of(&mut self.slots, slot_id, ep_index, stream_id)?;
        let start = ring.enqueue();
        let start_cycle = ring.cycle_state();

        for i in 0..num_tds {
            let urb = self.urbs.get(&urb_id).ok_or(XhciError::InvalidParameter)?;
            let packet = urb.iso[i];
            let Some(mut addr) = urb.buffer.dma_at(packet.offset) else {
                return self.isoc_rollback(urb_id, i, start, start_cycle, XhciError::InvalidParameter);
            };
            let td_len = packet.length;
            let total_packets = (td_len.div_ceil(usize::from(max_packet)) as u32).max(1);
            let burst_count = isoc_burst_count(hci_version, speed, max_burst, total_packets);
            let last_burst = isoc_last_burst_packet_count(hci_version, speed, max_burst, total_packets);
            let trbs_per_td = count_trbs(addr, td_len as u64);

            let td_id = match self.prepare_transfer(hw, urb_id, i, trbs_per_td) {
                Ok(td_id) => td_id,
                Err(e) => return self.isoc_rollback(urb_id, i, start, start_cycle, e),
            };
            let frame = if !asap && cfc {
                self.isoc_frame_id(hw, urb_id, i).map_or(IsocFrame::Asap, IsocFrame::Frame)
            } else {
                IsocFrame::Asap
            };
            let bei = block_event_intr(hci_version, num_tds, i, self.isoc_bei_interval, avoid_bei);

            let ring = ring_of(&mut self.slots, slot_id, ep_index, stream_id)?;
            let mut running_total = 0usize;
            let mut end = ring.enqueue();
            for j in 0..trbs_per_td {
                let more_trbs_coming = j + 1 < trbs_per_td;
                let mut flags = if dir_in { TrbFlags::ISP } else { TrbFlags::empty() };
                if more_trbs_coming {
                    flags |= TrbFlags::CHAIN;
                } else {
                    end = ring.enqueue();
                    flags |= TrbFlags::IOC;
                    if bei {
                        flags |= TrbFlags::BEI;
                    }
                }
                let boundary = TRB_MAX_BUFF_SIZE as usize - (addr & (u64::from(TRB_MAX_BUFF_SIZE) - 1)) as usize;
                let trb_len = boundary.min(td_len - running_total);
                let remainder = td_remainder(
                    mode,
                    running_total as u32,
                    trb_len as u32,
                    td_len as u32,
                    max_packet,
                    more_trbs_coming,
                )
                .min(MAX_TD_SIZE);

                if j == 0 {
                    let (td_size, tbc) = if extended_tbc {
                        (burst_count.min(MAX_TD_SIZE), 0)
                    } else {
                        (remainder, burst_count)
                    };
                    let trb = encode_isoc(
                        addr,
                        trb_len as u32,
                        td_size as u8,
                        interrupter,
                        last_burst as u8,
                        tbc as u8,
                        frame,
                        flags,
                    );
                    let cycle = if i > 0 { ring.cycle_state() } else { !start_cycle };
                    ring.queue_trb_cycle(trb, cycle, more_trbs_coming);
                } else {
                    let trb = encode_normal(addr, trb_len as u32, remainder as u8, interrupter, flags);
                    ring.queue_trb(trb, more_trbs_coming);
                }
                running_total += trb_len;
                addr += trb_len as u64;
            }
            if let Some(td) = self.tds.get_mut(td_id) {
                td.end = end;
            }
            if running_total != td_len {
                #[cfg(feature = "defmt")]
                defmt::error!("isoc TD length {} does not match packet {}", running_total, td_len);
                return self.isoc_rollback(urb_id, i + 1, start, start_cycle, XhciError::InvalidParameter);
            }
        }

        let urb = self.urbs.get(&urb_id).ok_or(XhciError::InvalidParameter)?;
        if cfc {
            let next = urb.start_frame + num_tds as u32 * urb.interval;
            if let Some(ep) = self.slots.ep_mut(slot_id, ep_index) {
                ep.next_frame_id = next;
            }
        }
        self.giveback_first_trb(hw, slot_id, ep_index, stream_id, start_cycle, start);
        Ok(())
    }

    /// Undo a partially queued request. `queued` TDs were written; they turn
    /// into No-Ops owned by software and enqueue returns to `start`. The
    /// TDs themselves are released by the caller along with the request.
    fn isoc_rollback(
        &mut self,
        urb_id: TransferId,
        queued: usize,
        start: Cursor,
        start_cycle: bool,
        err: XhciError,
    ) -> Result<()> {
        if queued == 0 {
            return Err(err);
        }
        let urb = self.urbs.get(&urb_id).ok_or(err)?;
        let ring = ring_of(&mut self.slots, urb.slot_id, urb.ep_index, urb.stream_id)?;
        let end = ring.enqueue();
        ring.td_to_noop(start, end, true);
        ring.enqueue = start;
        ring.cycle_state = start_cycle;
        #[cfg(feature = "defmt")]
        defmt::warn!("isoc request {} rolled back after {} TDs", urb_id.0, queued);
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_counts_superspeed() {
        // Max burst 3 (4 packets per burst), 10 packets: bursts of 4, 4, 2
        assert_eq!(isoc_burst_count(0x110, UsbSpeed::Super, 3, 10), 2);
        assert_eq!(isoc_last_burst_packet_count(0x110, UsbSpeed::Super, 3, 10), 1);
        // Evenly divided: the last burst is full
        assert_eq!(isoc_burst_count(0x110, UsbSpeed::Super, 3, 8), 1);
        assert_eq!(isoc_last_burst_packet_count(0x110, UsbSpeed::Super, 3, 8), 3);
    }

    #[test]
    fn test_burst_counts_high_speed_and_legacy() {
        assert_eq!(isoc_burst_count(0x110, UsbSpeed::High, 3, 3), 0);
        assert_eq!(isoc_last_burst_packet_count(0x110, UsbSpeed::High, 0, 3), 2);
        assert_eq!(isoc_last_burst_packet_count(0x110, UsbSpeed::Full, 0, 0), 0);
        assert_eq!(isoc_burst_count(0x96, UsbSpeed::Super, 3, 10), 0);
        assert_eq!(isoc_last_burst_packet_count(0x96, UsbSpeed::Super, 3, 10), 0);
    }

    #[test]
    fn test_ist_units() {
        assert_eq!(ist_microframes(0x2), 2);
        assert_eq!(ist_microframes(0x9), 8);
    }

    #[test]
    fn test_frame_window_bounds() {
        let (start, end) = isoc_frame_window(0, 0);
        assert_eq!((start, end), (1, 895));
        assert!(frame_in_window(start, start, end));
        assert!(!frame_in_window(start - 1, start, end));
        assert!(frame_in_window(895, start, end));
        assert!(!frame_in_window(896, start, end));

        // IST in frames pushes the start out
        assert_eq!(isoc_frame_window(0, 0x9).0, 2);
    }

    #[test]
    fn test_frame_window_wraps() {
        // Frame 1536: the window runs past 2047 back to 383
        let (start, end) = isoc_frame_window(1536 << 3, 0);
        assert_eq!((start, end), (1537, 383));
        assert!(frame_in_window(2000, start, end));
        assert!(frame_in_window(100, start, end));
        assert!(frame_in_window(383, start, end));
        assert!(!frame_in_window(384, start, end));
        assert!(!frame_in_window(1536, start, end));
        assert!(frame_in_window(1537, start, end));
        assert!(!frame_in_window(5, 5, 5));
    }

    #[test]
    fn test_block_event_intr() {
        assert!(!block_event_intr(0x96, 8, 0, 0, false));
        assert!(block_event_intr(0x110, 8, 0, 0, false));
        assert!(!block_event_intr(0x110, 8, 7, 0, false));
        // AVOID_BEI: every 4th TD interrupts
        assert!(block_event_intr(0x110, 16, 3, 4, true));
        assert!(!block_event_intr(0x110, 16, 4, 4, true));
        assert!(block_event_intr(0x110, 16, 0, 4, true));
    }

    #[test]
    fn test_round_up() {
        assert_eq!(round_up(9, 8), 16);
        assert_eq!(round_up(16, 8), 16);
        assert_eq!(round_up(5, 0), 5);
    }
}
