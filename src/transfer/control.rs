//! Control TD construction: Setup, optional Data, Status

use super::bulk::{immediate_data, ring_of, suitable_for_idt};
use super::{SetupPacket, TransferId};
use crate::config::Quirks;
use crate::controller::HostState;
use crate::endpoint::UsbSpeed;
use crate::error::{Result, XhciError};
use crate::hal::Platform;
use crate::td::td_remainder;
use crate::trb::{encode_data, encode_noop, encode_setup, encode_status, SetupTransferType, TrbFlags};

/// Transfer Type field of the Setup TRB. Controllers before 1.0 (other than
/// MediaTek) expect 0 in every case.
pub(crate) fn setup_transfer_type(hci_version: u16, quirks: Quirks, setup: &SetupPacket, len: usize) -> SetupTransferType {
    if (hci_version < 0x100 && !quirks.contains(Quirks::MTK_HOST)) || len == 0 {
        return SetupTransferType::NoData;
    }
    if setup.is_in() {
        SetupTransferType::In
    } else {
        SetupTransferType::Out
    }
}

impl HostState {
    pub(crate) fn queue_ctrl_tx<P: Platform>(&mut self, hw: &P, urb_id: TransferId, setup: SetupPacket) -> Result<()> {
        let urb = self.urbs.get(&urb_id).ok_or(XhciError::InvalidParameter)?;
        let (slot_id, ep_index) = (urb.slot_id, urb.ep_index);
        let len = urb.length;
        if matches!(&urb.buffer, super::TransferBuffer::Sg(list) if list.len() > 1) {
            return Err(XhciError::InvalidParameter);
        }
        let speed = self.slots.get(slot_id).ok_or(XhciError::NoDevice)?.info.speed;
        let interrupter = self.config.interrupter;

        if self.config.quirks.contains(Quirks::ETRON_HOST) && matches!(speed, UsbSpeed::Super | UsbSpeed::SuperPlus) {
            // Keep the Setup and Data TRBs from being split by a Link
            let ring = ring_of(&mut self.slots, slot_id, ep_index, 0)?;
            let enq = ring.enqueue();
            if !ring.is_link(enq) && ring.last_trb_on_seg(crate::ring::Cursor::new(enq.seg, enq.slot + 1)) {
                ring.queue_trb(encode_noop(interrupter, TrbFlags::empty()), false);
            }
        }

        let num_trbs = 2 + usize::from(len > 0);
        let td_id = self.prepare_transfer(hw, urb_id, 0, num_trbs)?;

        let trt = setup_transfer_type(self.regs.hci_version, self.config.quirks, &setup, len);
        let mode = self.td_size_mode;
        let urb = self.urbs.get(&urb_id).ok_or(XhciError::InvalidParameter)?;
        let max_packet = self.slots.ep(slot_id, ep_index).ok_or(XhciError::NoDevice)?.config.max_packet;
        let ring = ring_of(&mut self.slots, slot_id, ep_index, 0)?;
        let start = ring.enqueue();
        let start_cycle = ring.cycle_state();

        let setup_trb = encode_setup(setup.to_bytes(), trt, interrupter, TrbFlags::empty());
        ring.queue_trb_cycle(setup_trb, !start_cycle, true);

        if len > 0 {
            let mut flags = if urb.dir_in { TrbFlags::ISP } else { TrbFlags::empty() };
            let addr = if suitable_for_idt(urb.dir_in, urb.buffer.is_sg(), max_packet, len) {
                flags |= TrbFlags::IDT;
                immediate_data(&urb.buffer, len)
            } else {
                urb.buffer.blocks().next().map_or(0, |(addr, _)| addr)
            };
            let remainder = td_remainder(mode, 0, len as u32, len as u32, max_packet, true);
            let data = encode_data(addr, len as u32, remainder as u8, interrupter, setup.is_in(), flags);
            ring.queue_trb(data, true);
        }

        let end = ring.enqueue();
        let status_in = !(len > 0 && setup.is_in());
        ring.queue_trb(encode_status(status_in, interrupter, TrbFlags::IOC), false);
        if let Some(td) = self.tds.get_mut(td_id) {
            td.end = end;
        }

        #[cfg(feature = "defmt")]
        defmt::trace!("control TD req {:#x} len {} on slot {}", setup.request, len, slot_id);
        self.giveback_first_trb(hw, slot_id, ep_index, 0, start_cycle, start);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::get_descriptor;

    #[test]
    fn test_setup_transfer_type() {
        let get = get_descriptor(1, 18);
        let set = SetupPacket {
            request_type: 0x00,
            request: 0x09,
            value: 1,
            index: 0,
            length: 0,
        };
        assert_eq!(setup_transfer_type(0x110, Quirks::empty(), &get, 18), SetupTransferType::In);
        assert_eq!(setup_transfer_type(0x110, Quirks::empty(), &set, 0), SetupTransferType::NoData);
        let out = SetupPacket {
            request_type: 0x21,
            request: 0x09,
            value: 0x200,
            index: 0,
            length: 4,
        };
        assert_eq!(setup_transfer_type(0x100, Quirks::empty(), &out, 4), SetupTransferType::Out);
        assert_eq!(setup_transfer_type(0x96, Quirks::empty(), &get, 18), SetupTransferType::NoData);
        assert_eq!(setup_transfer_type(0x96, Quirks::MTK_HOST, &get, 18), SetupTransferType::In);
    }
}
