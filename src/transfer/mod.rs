//! Transfer requests and ring submission
//!
//! A request becomes one TD (two for a bulk OUT with a trailing zero-length
//! packet, one per packet for isochronous) laid onto the endpoint ring or a
//! stream ring. The first TRB of a request is written with the inverted
//! cycle bit and flipped last, right before the doorbell, so the controller
//! never starts on a half-built request.

mod bulk;
mod control;
mod interrupt;
mod isochronous;

use alloc::vec::Vec;

use bitflags::bitflags;

pub use isochronous::{isoc_burst_count, isoc_frame_window, isoc_last_burst_packet_count};

use crate::controller::{HcState, HostState};
use crate::dma::DmaSlice;
use crate::endpoint::{EpState, TransferType};
use crate::error::{Result, XhciError};
use crate::hal::{EpContextState, Platform};
use crate::ring::Cursor;
use crate::td::{Td, TdId};

/// Handle of a submitted transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferId(pub u32);

/// USB Setup packet for control transfers
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Check if this is an IN transfer
    pub fn is_in(&self) -> bool {
        (self.request_type & 0x80) != 0
    }

    /// Wire layout, as carried in the Setup Stage TRB
    pub fn to_bytes(&self) -> [u8; 8] {
        let v = self.value.to_le_bytes();
        let i = self.index.to_le_bytes();
        let l = self.length.to_le_bytes();
        [self.request_type, self.request, v[0], v[1], i[0], i[1], l[0], l[1]]
    }
}

bitflags! {
    /// Per-request behavior flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TransferFlags: u32 {
        /// A short transfer completes with `ShortPacket` instead of success
        const SHORT_NOT_OK = 1 << 0;
        /// Bulk OUT: end a max-packet multiple with a zero-length packet
        const ZERO_PACKET = 1 << 1;
        /// Isochronous: let the controller pick the start frame (SIA)
        const ISO_ASAP = 1 << 2;
    }
}

/// Data stage memory of a request
#[derive(Debug, Clone, Default)]
pub enum TransferBuffer {
    /// No data stage
    #[default]
    None,
    Single(DmaSlice),
    /// Scatter-gather list, used in order
    Sg(Vec<DmaSlice>),
}

impl TransferBuffer {
    /// Total bytes
    pub fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Single(slice) => slice.len(),
            Self::Sg(list) => list.iter().map(DmaSlice::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_sg(&self) -> bool {
        matches!(self, Self::Sg(_))
    }

    fn slices(&self) -> &[DmaSlice] {
        match self {
            Self::None => &[],
            Self::Single(slice) => core::slice::from_ref(slice),
            Self::Sg(list) => list,
        }
    }

    /// (bus address, length) of every element
    pub(crate) fn blocks(&self) -> impl Iterator<Item = (u64, usize)> + '_ {
        self.slices().iter().map(|s| (s.dma(), s.len()))
    }

    /// Bus address of byte `offset` of a single buffer
    pub(crate) fn dma_at(&self, offset: usize) -> Option<u64> {
        match self {
            Self::Single(slice) if offset <= slice.len() => Some(slice.dma() + offset as u64),
            Self::None if offset == 0 => Some(0),
            _ => None,
        }
    }

    /// Copy out of the buffer starting at logical `offset`, across elements
    pub(crate) fn read_at(&self, mut offset: usize, mut dst: &mut [u8]) {
        for slice in self.slices() {
            if dst.is_empty() {
                return;
            }
            if offset >= slice.len() {
                offset -= slice.len();
                continue;
            }
            let n = dst.len().min(slice.len() - offset);
            let (head, rest) = dst.split_at_mut(n);
            slice.read(offset, head);
            dst = rest;
            offset = 0;
        }
    }

    /// Copy into the buffer starting at logical `offset`, across elements
    pub(crate) fn write_at(&self, mut offset: usize, mut src: &[u8]) {
        for slice in self.slices() {
            if src.is_empty() {
                return;
            }
            if offset >= slice.len() {
                offset -= slice.len();
                continue;
            }
            let n = src.len().min(slice.len() - offset);
            slice.write(offset, &src[..n]);
            src = &src[n..];
            offset = 0;
        }
    }
}

/// One packet of an isochronous request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IsoPacket {
    /// Offset into the request buffer
    pub offset: usize,
    pub length: usize,
    pub actual_length: usize,
    /// `Some(MissedService)` until the controller reports the frame
    pub status: Option<XhciError>,
}

impl IsoPacket {
    pub fn new(offset: usize, length: usize) -> Self {
        Self {
            offset,
            length,
            actual_length: 0,
            status: Some(XhciError::MissedService),
        }
    }
}

/// Kind of request, with the control setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferKind {
    Control(SetupPacket),
    Bulk,
    Interrupt,
    Isochronous,
}

impl TransferKind {
    fn transfer_type(&self) -> TransferType {
        match self {
            Self::Control(_) => TransferType::Control,
            Self::Bulk => TransferType::Bulk,
            Self::Interrupt => TransferType::Interrupt,
            Self::Isochronous => TransferType::Isochronous,
        }
    }
}

/// A transfer as handed to `submit`
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub slot_id: u8,
    pub ep_index: u8,
    /// Stream id, 0 for endpoints without streams
    pub stream_id: u16,
    pub kind: TransferKind,
    pub buffer: TransferBuffer,
    pub flags: TransferFlags,
    /// Requested interval, frames for low/full speed and microframes otherwise
    pub interval: u32,
    pub iso_packets: Vec<IsoPacket>,
}

impl TransferRequest {
    fn new(slot_id: u8, ep_index: u8, kind: TransferKind, buffer: TransferBuffer) -> Self {
        Self {
            slot_id,
            ep_index,
            stream_id: 0,
            kind,
            buffer,
            flags: TransferFlags::empty(),
            interval: 0,
            iso_packets: Vec::new(),
        }
    }

    /// Control transfer on the default endpoint
    pub fn control(slot_id: u8, setup: SetupPacket, buffer: TransferBuffer) -> Self {
        Self::new(slot_id, 0, TransferKind::Control(setup), buffer)
    }

    pub fn bulk(slot_id: u8, ep_index: u8, buffer: TransferBuffer) -> Self {
        Self::new(slot_id, ep_index, TransferKind::Bulk, buffer)
    }

    pub fn interrupt(slot_id: u8, ep_index: u8, buffer: TransferBuffer, interval: u32) -> Self {
        Self {
            interval,
            ..Self::new(slot_id, ep_index, TransferKind::Interrupt, buffer)
        }
    }

    /// Isochronous transfer of `packets` laid out in `buffer`
    pub fn isochronous(
        slot_id: u8,
        ep_index: u8,
        buffer: TransferBuffer,
        packets: Vec<IsoPacket>,
        interval: u32,
    ) -> Self {
        Self {
            interval,
            iso_packets: packets,
            ..Self::new(slot_id, ep_index, TransferKind::Isochronous, buffer)
        }
    }

    pub fn with_flags(mut self, flags: TransferFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_stream(mut self, stream_id: u16) -> Self {
        self.stream_id = stream_id;
        self
    }
}

/// A transfer given back to the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCompletion {
    pub id: TransferId,
    pub slot_id: u8,
    pub ep_index: u8,
    pub stream_id: u16,
    /// `None` on success (short transfers included unless `SHORT_NOT_OK`)
    pub status: Option<XhciError>,
    pub actual_length: usize,
    /// Per packet results of an isochronous transfer
    pub iso_packets: Vec<IsoPacket>,
    /// Frame the first isochronous packet was scheduled for
    pub start_frame: u32,
    /// Interval actually used, after correction from the endpoint context
    pub interval: u32,
}

impl TransferCompletion {
    pub fn is_ok(&self) -> bool {
        self.status.is_none()
    }
}

/// In-flight request
#[derive(Debug)]
pub(crate) struct Urb {
    pub(crate) id: TransferId,
    pub(crate) slot_id: u8,
    pub(crate) ep_index: u8,
    pub(crate) stream_id: u16,
    pub(crate) kind: TransferKind,
    pub(crate) flags: TransferFlags,
    pub(crate) buffer: TransferBuffer,
    pub(crate) length: usize,
    pub(crate) actual_length: usize,
    pub(crate) dir_in: bool,
    pub(crate) interval: u32,
    pub(crate) start_frame: u32,
    pub(crate) iso: Vec<IsoPacket>,
    pub(crate) tds: Vec<TdId>,
    pub(crate) num_tds_done: usize,
    /// Cancelled by the client; the completion reports `Cancelled`
    pub(crate) unlinked: bool,
}

impl Urb {
    pub(crate) fn is_isoc(&self) -> bool {
        self.kind == TransferKind::Isochronous
    }
}

impl HostState {
    /// Validate a request and lay it onto its ring
    pub(crate) fn submit_transfer<P: Platform>(&mut self, hw: &P, id: TransferId, req: TransferRequest) -> Result<()> {
        if self.hc.intersects(HcState::DYING | HcState::HALTED) {
            return Err(XhciError::Shutdown);
        }
        let ep = self.slots.ep(req.slot_id, req.ep_index).ok_or(XhciError::NoDevice)?;
        if ep.ep_state.contains(EpState::GETTING_NO_STREAMS) {
            #[cfg(feature = "defmt")]
            defmt::warn!("submit while streams are being torn down on ep {}", req.ep_index);
            return Err(XhciError::InvalidState);
        }
        if ep.config.transfer_type != req.kind.transfer_type() {
            return Err(XhciError::InvalidParameter);
        }
        if req.stream_id != 0 && !ep.has_streams() {
            return Err(XhciError::InvalidStream);
        }
        let dir_in = match req.kind {
            TransferKind::Control(setup) => setup.is_in(),
            _ => ep.config.dir_in,
        };
        let length = req.buffer.len();
        if req.kind == TransferKind::Isochronous {
            let in_bounds = req
                .iso_packets
                .iter()
                .all(|p| p.offset.checked_add(p.length).is_some_and(|end| end <= length));
            if req.iso_packets.is_empty() || !in_bounds {
                return Err(XhciError::InvalidParameter);
            }
        }

        let urb = Urb {
            id,
            slot_id: req.slot_id,
            ep_index: req.ep_index,
            stream_id: req.stream_id,
            kind: req.kind,
            flags: req.flags,
            buffer: req.buffer,
            length,
            actual_length: 0,
            dir_in,
            interval: req.interval,
            start_frame: 0,
            iso: req.iso_packets,
            tds: Vec::new(),
            num_tds_done: 0,
            unlinked: false,
        };
        self.urbs.insert(id, urb);

        let queued = match req.kind {
            TransferKind::Control(setup) => self.queue_ctrl_tx(hw, id, setup),
            TransferKind::Bulk => self.queue_bulk_tx(hw, id),
            TransferKind::Interrupt => self.queue_intr_tx(hw, id),
            TransferKind::Isochronous => self.queue_isoc_tx_prepare(hw, id),
        };
        if let Err(e) = queued {
            #[cfg(feature = "defmt")]
            defmt::debug!("submit {} failed: {}", id.0, e);
            if let Some(urb) = self.urbs.remove(&id) {
                if let Ok(ring) = bulk::ring_of(&mut self.slots, urb.slot_id, urb.ep_index, urb.stream_id) {
                    ring.td_list.retain(|td| !urb.tds.contains(td));
                }
                for td in urb.tds {
                    self.tds.remove(td);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    /// Make room for `num_trbs` TRBs on a ring whose endpoint may take work
    pub(crate) fn prepare_ring<P: Platform>(
        &mut self,
        hw: &P,
        slot_id: u8,
        ep_index: u8,
        stream_id: u16,
        num_trbs: usize,
    ) -> Result<()> {
        match hw.endpoint_state(slot_id, ep_index) {
            EpContextState::Disabled => {
                #[cfg(feature = "defmt")]
                defmt::warn!("submit to disabled ep {} of slot {}", ep_index, slot_id);
                return Err(XhciError::EndpointDisabled);
            }
            EpContextState::Error => {
                #[cfg(feature = "defmt")]
                defmt::warn!("submit to ep {} in error state", ep_index);
                return Err(XhciError::InvalidState);
            }
            EpContextState::Halted => {
                #[cfg(feature = "defmt")]
                defmt::debug!("submit to halted ep {}, queued until reset", ep_index);
            }
            EpContextState::Stopped | EpContextState::Running => {}
        }

        let ring = self
            .slots
            .ep_mut(slot_id, ep_index)
            .ok_or(XhciError::NoDevice)?
            .ring_for_stream_mut(stream_id)
            .ok_or(XhciError::InvalidStream)?;
        let new_segs = ring.expansion_needed(num_trbs);
        if new_segs > 0 {
            ring.expand(hw, new_segs).map_err(|_| {
                #[cfg(feature = "defmt")]
                defmt::error!("ring expansion by {} segments failed", new_segs);
                XhciError::NoResources
            })?;
        }
        if ring.is_link(ring.enqueue()) {
            ring.inc_enq_past_link(false);
        }
        if ring.last_trb_on_seg(ring.enqueue()) {
            #[cfg(feature = "defmt")]
            defmt::warn!("missing link TRB at end of ring segment");
            return Err(XhciError::InvalidState);
        }
        Ok(())
    }

    /// Check room for TD `index` of a request and open it at the enqueue pointer
    pub(crate) fn prepare_transfer<P: Platform>(&mut self, hw: &P, urb_id: TransferId, index: usize, num_trbs: usize) -> Result<TdId> {
        let urb = self.urbs.get(&urb_id).ok_or(XhciError::InvalidParameter)?;
        let (slot_id, ep_index, stream_id) = (urb.slot_id, urb.ep_index, urb.stream_id);
        self.prepare_ring(hw, slot_id, ep_index, stream_id, num_trbs)?;
        self.open_td(urb_id, index)
    }

    /// Start a TD at the current enqueue pointer without a room check
    pub(crate) fn open_td(&mut self, urb_id: TransferId, index: usize) -> Result<TdId> {
        let urb = self.urbs.get_mut(&urb_id).ok_or(XhciError::InvalidParameter)?;
        let ring = self
            .slots
            .ep_mut(urb.slot_id, urb.ep_index)
            .ok_or(XhciError::NoDevice)?
            .ring_for_stream_mut(urb.stream_id)
            .ok_or(XhciError::InvalidStream)?;
        let td = Td::new(urb_id, index, urb.slot_id, urb.ep_index, urb.stream_id, ring.enqueue());
        let td_id = self.tds.insert(td);
        ring.td_list.push_back(td_id);
        urb.tds.push(td_id);
        Ok(td_id)
    }

    /// Hand the request to the controller: flip the first TRB's cycle bit,
    /// then ring the doorbell
    pub(crate) fn giveback_first_trb<P: Platform>(
        &mut self,
        hw: &P,
        slot_id: u8,
        ep_index: u8,
        stream_id: u16,
        start_cycle: bool,
        start: Cursor,
    ) {
        let Some(ring) = self
            .slots
            .ep_mut(slot_id, ep_index)
            .and_then(|ep| ep.ring_for_stream_mut(stream_id))
        else {
            return;
        };
        ring.set_cycle(start, start_cycle);
        self.ring_ep_doorbell(hw, slot_id, ep_index, stream_id);
    }

    /// Reconcile a requested interval with the one programmed in the
    /// endpoint context; the context wins
    pub(crate) fn check_interval(&mut self, urb_id: TransferId) {
        let Some(urb) = self.urbs.get_mut(&urb_id) else {
            return;
        };
        let Some(slot) = self.slots.get(urb.slot_id) else {
            return;
        };
        let Some(ep) = slot.endpoint(urb.ep_index) else {
            return;
        };
        let frames = slot.info.speed.uses_frames();
        let ctx_interval = ep.config.interval;
        let requested = interrupt::context_interval(urb.interval, frames);
        if requested != ctx_interval {
            #[cfg(feature = "defmt")]
            defmt::debug!(
                "ep {} interval {} differs from context interval {}, using the context",
                urb.ep_index,
                requested,
                ctx_interval
            );
            urb.interval = if frames { ctx_interval / 8 } else { ctx_interval };
        }
    }
}
