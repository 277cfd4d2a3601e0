//! Device slots, endpoints and stream tables

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::dma::{DmaRegion, DMA_ALIGNMENT};
use crate::error::{Result, XhciError};
use crate::hal::{DmaMapper, EndpointContexts};
use crate::ring::{Cursor, Ring, RingType};
use crate::td::TdId;
use crate::trb::SCT_PRIMARY_TR;

/// Endpoints per slot (DCI 1-31)
pub const MAX_ENDPOINTS: usize = 31;

/// Bytes per stream context entry
pub const STREAM_CTX_SIZE: usize = 16;

/// Largest stream id an endpoint may request
pub const MAX_STREAMS: u16 = 1024;

const SCTX_DEQ_MASK: u64 = !0xf;

bitflags! {
    /// Software endpoint state, independent of the context state the controller reports
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EpState: u32 {
        /// Reset Endpoint queued or in flight
        const HALTED = 1 << 0;
        /// Stop Endpoint queued for cancellation
        const STOP_CMD_PENDING = 1 << 1;
        /// Set TR Dequeue in flight
        const SET_DEQ_PENDING = 1 << 2;
        const HAS_STREAMS = 1 << 3;
        /// Streams are being torn down
        const GETTING_NO_STREAMS = 1 << 4;
        /// Hub layer is clearing the TT buffer
        const CLEARING_TT = 1 << 5;
        /// Next reset must clear the data toggle
        const HARD_CLEAR_TOGGLE = 1 << 6;
    }
}

impl EpState {
    /// States in which the endpoint doorbell must not be rung
    pub const DOORBELL_BLOCKED: Self = Self::STOP_CMD_PENDING
        .union(Self::SET_DEQ_PENDING)
        .union(Self::HALTED)
        .union(Self::CLEARING_TT);
}

/// Transfer type of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    fn ring_type(self) -> RingType {
        match self {
            Self::Control => RingType::Control,
            Self::Isochronous => RingType::Isoc,
            Self::Bulk => RingType::Bulk,
            Self::Interrupt => RingType::Interrupt,
        }
    }
}

/// Device speed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsbSpeed {
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

impl UsbSpeed {
    /// Intervals and frame ids count 1 ms frames rather than microframes
    pub fn uses_frames(self) -> bool {
        matches!(self, Self::Low | Self::Full)
    }
}

/// Transaction translator a low/full speed device sits behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TtInfo {
    /// Slot of the high-speed hub, 0 for a TT integrated in the root hub
    pub hub_slot_id: u8,
    pub hub_port: u8,
    pub multi_tt: bool,
}

impl TtInfo {
    /// TT buffer clears go through an external hub
    pub fn is_external(&self) -> bool {
        self.hub_slot_id != 0
    }
}

/// What the engine needs to know about a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SlotInfo {
    pub speed: UsbSpeed,
    pub root_port: u8,
    pub tt: Option<TtInfo>,
}

/// Endpoint parameters from the endpoint descriptor and context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EndpointConfig {
    pub transfer_type: TransferType,
    pub dir_in: bool,
    pub max_packet: u16,
    /// Max Burst, zero-based
    pub max_burst: u8,
    /// Mult, zero-based (SuperSpeed isochronous)
    pub mult: u8,
    /// Service interval in microframes as programmed in the context
    pub interval: u32,
    /// Ring segments, `None` for the configured default
    pub ring_segments: Option<usize>,
}

impl EndpointConfig {
    /// Default control pipe with the given max packet size
    pub fn control(max_packet: u16) -> Self {
        Self {
            transfer_type: TransferType::Control,
            dir_in: false,
            max_packet,
            max_burst: 0,
            mult: 0,
            interval: 0,
            ring_segments: None,
        }
    }

    pub fn bulk(dir_in: bool, max_packet: u16) -> Self {
        Self {
            transfer_type: TransferType::Bulk,
            ..Self::control(max_packet)
        }
        .with_dir(dir_in)
    }

    pub fn interrupt(dir_in: bool, max_packet: u16, interval: u32) -> Self {
        Self {
            transfer_type: TransferType::Interrupt,
            interval,
            ..Self::control(max_packet)
        }
        .with_dir(dir_in)
    }

    pub fn isochronous(dir_in: bool, max_packet: u16, interval: u32) -> Self {
        Self {
            transfer_type: TransferType::Isochronous,
            interval,
            ..Self::control(max_packet)
        }
        .with_dir(dir_in)
    }

    fn with_dir(mut self, dir_in: bool) -> Self {
        self.dir_in = dir_in;
        self
    }

    pub fn with_burst(mut self, max_burst: u8, mult: u8) -> Self {
        self.max_burst = max_burst;
        self.mult = mult;
        self
    }
}

/// Stream rings of one endpoint and the stream context array describing them
#[derive(Debug)]
pub struct StreamInfo {
    /// Indexed by stream id; slot 0 is reserved
    pub(crate) rings: Vec<Option<Ring>>,
    pub(crate) ctx: DmaRegion,
}

impl StreamInfo {
    /// Allocate `num_streams` stream rings (ids 1..=num_streams) and a
    /// context array pointing at them
    pub(crate) fn new<D: DmaMapper + ?Sized>(
        dma: &D,
        num_streams: u16,
        segments: usize,
        max_packet: u16,
        link_chain_quirk: bool,
    ) -> Result<Self> {
        if num_streams == 0 || num_streams > MAX_STREAMS {
            return Err(XhciError::InvalidParameter);
        }
        let entries = usize::from(num_streams) + 1;
        let mut ctx = dma.alloc_coherent(entries * STREAM_CTX_SIZE, DMA_ALIGNMENT)?;
        ctx.zero();
        let mut info = Self {
            rings: Vec::with_capacity(entries),
            ctx,
        };
        info.rings.push(None);
        for stream_id in 1..=num_streams {
            let mut ring = match Ring::new(dma, RingType::Stream, segments, u32::from(max_packet), link_chain_quirk) {
                Ok(ring) => ring,
                Err(e) => {
                    info.free(dma);
                    return Err(e);
                }
            };
            ring.stream_id = stream_id;
            let deq = ring.segment(ring.first_segment()).dma()
                | u64::from(SCT_PRIMARY_TR) << 1
                | u64::from(ring.cycle_state());
            info.ctx.write_u64(usize::from(stream_id) * STREAM_CTX_SIZE, deq);
            info.rings.push(Some(ring));
        }
        Ok(info)
    }

    pub(crate) fn free<D: DmaMapper + ?Sized>(self, dma: &D) {
        for ring in self.rings.into_iter().flatten() {
            ring.free(dma);
        }
        dma.free_coherent(self.ctx);
    }

    /// Number of usable stream ids
    pub fn num_streams(&self) -> u16 {
        (self.rings.len() - 1) as u16
    }

    /// Bus address of the stream context array
    pub fn ctx_dma(&self) -> u64 {
        self.ctx.dma()
    }

    pub(crate) fn ring(&self, stream_id: u16) -> Option<&Ring> {
        self.rings.get(usize::from(stream_id))?.as_ref()
    }

    pub(crate) fn ring_mut(&mut self, stream_id: u16) -> Option<&mut Ring> {
        self.rings.get_mut(usize::from(stream_id))?.as_mut()
    }

    /// Dequeue pointer the controller saved in a stream context
    pub(crate) fn hw_dequeue(&self, stream_id: u16) -> u64 {
        self.ctx.read_u64(usize::from(stream_id) * STREAM_CTX_SIZE)
    }

    /// Cadence controllers keep state in the reserved dwords and never clear it
    pub(crate) fn clear_reserved(&mut self, stream_id: u16) {
        let offset = usize::from(stream_id) * STREAM_CTX_SIZE;
        self.ctx.write_u32(offset + 8, 0);
        self.ctx.write_u32(offset + 12, 0);
    }
}

/// Dequeue position requested by an in-flight Set TR Dequeue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) struct QueuedDequeue {
    pub(crate) stream_id: u16,
    pub(crate) cursor: Cursor,
    pub(crate) dma: u64,
}

/// One endpoint of a slot
#[derive(Debug)]
pub struct Endpoint {
    pub(crate) slot_id: u8,
    pub(crate) ep_index: u8,
    pub(crate) config: EndpointConfig,
    pub(crate) ring: Ring,
    pub(crate) streams: Option<StreamInfo>,
    pub(crate) ep_state: EpState,
    pub(crate) cancelled_td_list: VecDeque<TdId>,
    /// Consecutive transaction errors, reset on success
    pub(crate) err_count: u32,
    /// Missed service reported; isochronous TDs are skipped until an event matches
    pub(crate) skip: bool,
    /// When the pending Stop Endpoint was first queued
    pub(crate) stop_time: u64,
    pub(crate) queued_deq: Option<QueuedDequeue>,
    /// Frame id after the last queued isochronous TD (CFC)
    pub(crate) next_frame_id: u32,
    /// Burst count lives in the TD Size field
    pub(crate) use_extended_tbc: bool,
}

impl Endpoint {
    pub(crate) fn new<D: DmaMapper + ?Sized>(
        dma: &D,
        slot_id: u8,
        ep_index: u8,
        config: EndpointConfig,
        segments: usize,
        link_chain_quirk: bool,
    ) -> Result<Self> {
        let ring = Ring::new(
            dma,
            config.transfer_type.ring_type(),
            config.ring_segments.unwrap_or(segments),
            u32::from(config.max_packet),
            link_chain_quirk,
        )?;
        Ok(Self {
            slot_id,
            ep_index,
            config,
            ring,
            streams: None,
            ep_state: EpState::empty(),
            cancelled_td_list: VecDeque::new(),
            err_count: 0,
            skip: false,
            stop_time: 0,
            queued_deq: None,
            next_frame_id: 0,
            use_extended_tbc: false,
        })
    }

    pub(crate) fn free<D: DmaMapper + ?Sized>(self, dma: &D) {
        if let Some(streams) = self.streams {
            streams.free(dma);
        }
        self.ring.free(dma);
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn state(&self) -> EpState {
        self.ep_state
    }

    pub fn has_streams(&self) -> bool {
        self.ep_state.contains(EpState::HAS_STREAMS)
    }

    /// TR Dequeue Pointer with DCS, as the input context wants it
    pub fn dequeue_pointer(&self) -> u64 {
        let ring = &self.ring;
        ring.trb_virt_to_dma(ring.dequeue()) | u64::from(ring.cycle_state())
    }

    /// Ring serving `stream_id`; stream 0 selects the endpoint ring when
    /// streams are off
    pub(crate) fn ring_for_stream(&self, stream_id: u16) -> Option<&Ring> {
        match (&self.streams, self.has_streams()) {
            (Some(streams), true) => streams.ring(stream_id),
            _ if stream_id == 0 => Some(&self.ring),
            _ => None,
        }
    }

    pub(crate) fn ring_for_stream_mut(&mut self, stream_id: u16) -> Option<&mut Ring> {
        let has_streams = self.has_streams();
        match (&mut self.streams, has_streams) {
            (Some(streams), true) => streams.ring_mut(stream_id),
            _ if stream_id == 0 => Some(&mut self.ring),
            _ => None,
        }
    }

    /// Stream whose ring contains the TRB at `dma`. Without streams every
    /// event belongs to the endpoint ring.
    pub(crate) fn stream_for_dma(&self, dma: u64) -> Option<u16> {
        match (&self.streams, self.has_streams()) {
            (Some(streams), true) => streams
                .rings
                .iter()
                .enumerate()
                .filter_map(|(id, ring)| Some((id as u16, ring.as_ref()?)))
                .find(|(_, ring)| ring.dma_to_cursor(dma).is_some())
                .map(|(id, _)| id),
            _ => Some(0),
        }
    }

    /// Stream ids (0 without streams) whose rings have TDs in flight
    pub(crate) fn active_streams(&self) -> Vec<u16> {
        match (&self.streams, self.has_streams()) {
            (Some(streams), true) => streams
                .rings
                .iter()
                .enumerate()
                .filter(|(_, ring)| ring.as_ref().is_some_and(|r| !r.td_list.is_empty()))
                .map(|(id, _)| id as u16)
                .collect(),
            _ if !self.ring.td_list.is_empty() => alloc::vec![0],
            _ => Vec::new(),
        }
    }

    /// Dequeue pointer the controller last saved for a stream, DCS and SCT masked off
    pub(crate) fn hw_dequeue<C: EndpointContexts + ?Sized>(&self, ctx: &C, stream_id: u16) -> u64 {
        match (&self.streams, self.has_streams()) {
            (Some(streams), true) => streams.hw_dequeue(stream_id) & SCTX_DEQ_MASK,
            _ => ctx.endpoint_dequeue(self.slot_id, self.ep_index) & SCTX_DEQ_MASK,
        }
    }
}

/// One device slot
#[derive(Debug)]
pub struct Slot {
    pub(crate) slot_id: u8,
    pub(crate) info: SlotInfo,
    pub(crate) eps: [Option<Endpoint>; MAX_ENDPOINTS],
}

impl Slot {
    pub(crate) fn new(slot_id: u8, info: SlotInfo) -> Self {
        Self {
            slot_id,
            info,
            eps: core::array::from_fn(|_| None),
        }
    }

    pub fn info(&self) -> &SlotInfo {
        &self.info
    }

    pub fn endpoint(&self, ep_index: u8) -> Option<&Endpoint> {
        self.eps.get(usize::from(ep_index))?.as_ref()
    }
}

/// Slots indexed by slot id (1-based)
#[derive(Debug, Default)]
pub struct SlotTable {
    slots: Vec<Option<Slot>>,
}

impl SlotTable {
    pub fn new(max_slots: u8) -> Self {
        let mut slots = Vec::with_capacity(usize::from(max_slots) + 1);
        slots.resize_with(usize::from(max_slots) + 1, || None);
        Self { slots }
    }

    pub fn get(&self, slot_id: u8) -> Option<&Slot> {
        self.slots.get(usize::from(slot_id))?.as_ref()
    }

    pub fn get_mut(&mut self, slot_id: u8) -> Option<&mut Slot> {
        self.slots.get_mut(usize::from(slot_id))?.as_mut()
    }

    /// Install a slot; fails for id 0, out of range ids and ids in use
    pub(crate) fn insert(&mut self, slot: Slot) -> Result<()> {
        let id = usize::from(slot.slot_id);
        match self.slots.get_mut(id) {
            Some(entry @ None) if id != 0 => {
                *entry = Some(slot);
                Ok(())
            }
            Some(Some(_)) => Err(XhciError::InvalidState),
            _ => Err(XhciError::InvalidParameter),
        }
    }

    pub(crate) fn remove(&mut self, slot_id: u8) -> Option<Slot> {
        self.slots.get_mut(usize::from(slot_id))?.take()
    }

    pub fn ep(&self, slot_id: u8, ep_index: u8) -> Option<&Endpoint> {
        self.get(slot_id)?.endpoint(ep_index)
    }

    pub fn ep_mut(&mut self, slot_id: u8, ep_index: u8) -> Option<&mut Endpoint> {
        self.get_mut(slot_id)?.eps.get_mut(usize::from(ep_index))?.as_mut()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Slot> {
        self.slots.iter_mut().flatten()
    }

    /// Ids of every endpoint present, in slot then endpoint order
    pub(crate) fn endpoint_ids(&self) -> Vec<(u8, u8)> {
        self.slots
            .iter()
            .flatten()
            .flat_map(|slot| {
                slot.eps
                    .iter()
                    .enumerate()
                    .filter(|(_, ep)| ep.is_some())
                    .map(move |(i, _)| (slot.slot_id, i as u8))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::SegId;
    use crate::test_util::HeapDma;

    fn full_speed() -> SlotInfo {
        SlotInfo {
            speed: UsbSpeed::Full,
            root_port: 1,
            tt: Some(TtInfo {
                hub_slot_id: 2,
                hub_port: 3,
                multi_tt: false,
            }),
        }
    }

    #[test]
    fn test_slot_table_bounds() {
        let mut table = SlotTable::new(4);
        assert_eq!(table.insert(Slot::new(0, full_speed())), Err(XhciError::InvalidParameter));
        assert_eq!(table.insert(Slot::new(5, full_speed())), Err(XhciError::InvalidParameter));
        assert!(table.insert(Slot::new(4, full_speed())).is_ok());
        assert_eq!(table.insert(Slot::new(4, full_speed())), Err(XhciError::InvalidState));
        assert!(table.get(4).unwrap().info().tt.unwrap().is_external());
        assert!(table.remove(4).is_some());
        assert!(table.get(4).is_none());
    }

    #[test]
    fn test_endpoint_dequeue_pointer_has_dcs() {
        let dma = HeapDma::new();
        let ep = Endpoint::new(&dma, 1, 2, EndpointConfig::bulk(false, 512), 2, false).unwrap();
        let ptr = ep.dequeue_pointer();
        assert_eq!(ptr & 1, 1);
        assert_eq!(ptr & !0xf, ep.ring.segment(ep.ring.first_segment()).dma());
        assert_eq!(ep.stream_for_dma(0xdead_beef), Some(0));
        assert!(ep.active_streams().is_empty());
        ep.free(&dma);
    }

    #[test]
    fn test_stream_context_array() {
        let dma = HeapDma::new();
        let mut ep = Endpoint::new(&dma, 1, 2, EndpointConfig::bulk(true, 1024), 1, false).unwrap();
        let streams = StreamInfo::new(&dma, 4, 1, 1024, false).unwrap();
        assert_eq!(streams.num_streams(), 4);
        let ring3_dma = streams.ring(3).unwrap().segment(SegId(0)).dma();
        let entry = streams.hw_dequeue(3);
        assert_eq!(entry & SCTX_DEQ_MASK, ring3_dma);
        assert_eq!((entry >> 1) & 0x7, u64::from(SCT_PRIMARY_TR));
        assert_eq!(entry & 1, 1);
        ep.streams = Some(streams);
        ep.ep_state |= EpState::HAS_STREAMS;
        assert_eq!(ep.stream_for_dma(ring3_dma + 32), Some(3));
        assert!(ep.ring_for_stream(0).is_none());
        assert!(ep.ring_for_stream(5).is_none());
        assert_eq!(ep.ring_for_stream(2).map(|r| r.stream_id), Some(2));
        ep.free(&dma);
    }

    #[test]
    fn test_stream_count_limits() {
        let dma = HeapDma::new();
        assert!(StreamInfo::new(&dma, 0, 1, 512, false).is_err());
        assert!(StreamInfo::new(&dma, MAX_STREAMS + 1, 1, 512, false).is_err());
    }
}
