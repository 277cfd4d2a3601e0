//! Transfer Request Block codec
//!
//! Bit-exact packing of the 16-byte TRB used on transfer, command and event
//! rings. All encoders leave the cycle bit clear; the ring sets it when the
//! TRB is published.
//!
//! Layout (little-endian dwords):
//! - dword 0-1: parameter (buffer pointer, setup packet, context pointer)
//! - dword 2:   status (length, TD size, interrupter target, completion code)
//! - dword 3:   control (cycle, flags, TRB type in bits 10-15, slot/endpoint ids)

use bitflags::bitflags;

/// Size of one TRB in bytes
pub const TRB_SIZE: usize = 16;

/// Cycle bit, bit 0 of the control dword
pub const TRB_CYCLE: u32 = 1 << 0;

/// Toggle Cycle flag on Link TRBs
pub const LINK_TOGGLE: u32 = 1 << 1;

/// Largest buffer a single TRB may describe without crossing a 64 KiB boundary
pub const TRB_MAX_BUFF_SHIFT: u32 = 16;
/// Maximum TRB buffer size
pub const TRB_MAX_BUFF_SIZE: u32 = 1 << TRB_MAX_BUFF_SHIFT;

/// Transfer length field mask (17 bits)
pub const TRB_LEN_MASK: u32 = 0x1ffff;

/// Largest value the 5-bit TD Size field holds
pub const MAX_TD_SIZE: u32 = 31;

/// First TRB type number reserved for vendor use
pub const TRB_VENDOR_DEFINED_LOW: u8 = 48;

const TYPE_SHIFT: u32 = 10;
const TYPE_MASK: u32 = 0x3f << TYPE_SHIFT;
const TD_SIZE_SHIFT: u32 = 17;
const INTR_TARGET_SHIFT: u32 = 22;
const INTR_TARGET_MASK: u32 = 0x3ff;
const SLOT_ID_SHIFT: u32 = 24;
const EP_ID_SHIFT: u32 = 16;
const EP_ID_MASK: u32 = 0x1f;
const DIR_IN: u32 = 1 << 16;
const SETUP_TRT_SHIFT: u32 = 16;
const ISOC_TBC_SHIFT: u32 = 7;
const ISOC_TLBPC_SHIFT: u32 = 16;
const ISOC_FRAME_ID_SHIFT: u32 = 20;
const ISOC_FRAME_ID_MASK: u32 = 0x7ff;
const ISOC_SIA: u32 = 1 << 31;
const EVENT_DATA: u32 = 1 << 2;
const COMP_CODE_SHIFT: u32 = 24;
const EVENT_LEN_MASK: u32 = 0x00ff_ffff;
const BSR: u32 = 1 << 9;
const TSP: u32 = 1 << 9;
const DECONFIGURE: u32 = 1 << 9;
const SUSPEND_EP: u32 = 1 << 23;
const SLOT_TYPE_SHIFT: u32 = 16;
const STREAM_ID_SHIFT: u32 = 16;
const SCT_SHIFT: u32 = 1;
const SCT_MASK: u32 = 0x7;

/// Stream context type used for primary stream rings
pub const SCT_PRIMARY_TR: u8 = 1;

bitflags! {
    /// Transfer TRB control flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TrbFlags: u32 {
        /// Interrupt on Short Packet (ISP) - Bit 2
        const ISP = 1 << 2;
        /// No Snoop (NS) - Bit 3
        const NO_SNOOP = 1 << 3;
        /// Chain (CH) - Bit 4
        const CHAIN = 1 << 4;
        /// Interrupt On Completion (IOC) - Bit 5
        const IOC = 1 << 5;
        /// Immediate Data (IDT) - Bit 6
        const IDT = 1 << 6;
        /// Block Event Interrupt (BEI) - Bit 9
        const BEI = 1 << 9;
    }
}

impl TrbFlags {
    const STAGE: Self = Self::CHAIN.union(Self::IOC);
    const NORMAL: Self = Self::ISP
        .union(Self::NO_SNOOP)
        .union(Self::CHAIN)
        .union(Self::IOC)
        .union(Self::IDT)
        .union(Self::BEI);
}

/// TRB type, bits 10-15 of the control dword
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum TrbType {
    Normal = 1,
    SetupStage = 2,
    DataStage = 3,
    StatusStage = 4,
    Isoch = 5,
    Link = 6,
    EventData = 7,
    TransferNoop = 8,
    EnableSlot = 9,
    DisableSlot = 10,
    AddressDevice = 11,
    ConfigureEndpoint = 12,
    EvaluateContext = 13,
    ResetEndpoint = 14,
    StopEndpoint = 15,
    SetTrDequeue = 16,
    ResetDevice = 17,
    ForceEvent = 18,
    NegotiateBandwidth = 19,
    SetLatencyTolerance = 20,
    GetPortBandwidth = 21,
    ForceHeader = 22,
    CommandNoop = 23,
    TransferEvent = 32,
    CommandCompletion = 33,
    PortStatusChange = 34,
    BandwidthRequest = 35,
    Doorbell = 36,
    HostController = 37,
    DeviceNotification = 38,
    MfindexWrap = 39,
}

impl TrbType {
    /// Decode a raw 6-bit type value
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            1 => Self::Normal,
            2 => Self::SetupStage,
            3 => Self::DataStage,
            4 => Self::StatusStage,
            5 => Self::Isoch,
            6 => Self::Link,
            7 => Self::EventData,
            8 => Self::TransferNoop,
            9 => Self::EnableSlot,
            10 => Self::DisableSlot,
            11 => Self::AddressDevice,
            12 => Self::ConfigureEndpoint,
            13 => Self::EvaluateContext,
            14 => Self::ResetEndpoint,
            15 => Self::StopEndpoint,
            16 => Self::SetTrDequeue,
            17 => Self::ResetDevice,
            18 => Self::ForceEvent,
            19 => Self::NegotiateBandwidth,
            20 => Self::SetLatencyTolerance,
            21 => Self::GetPortBandwidth,
            22 => Self::ForceHeader,
            23 => Self::CommandNoop,
            32 => Self::TransferEvent,
            33 => Self::CommandCompletion,
            34 => Self::PortStatusChange,
            35 => Self::BandwidthRequest,
            36 => Self::Doorbell,
            37 => Self::HostController,
            38 => Self::DeviceNotification,
            39 => Self::MfindexWrap,
            _ => return None,
        })
    }

    const fn field(self) -> u32 {
        (self as u32) << TYPE_SHIFT
    }
}

/// Completion code reported in event TRBs (status bits 24-31)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CompletionCode {
    Invalid,
    Success,
    DataBufferError,
    BabbleDetectedError,
    UsbTransactionError,
    TrbError,
    StallError,
    ResourceError,
    BandwidthError,
    NoSlotsAvailable,
    InvalidStreamType,
    SlotNotEnabled,
    EndpointNotEnabled,
    ShortPacket,
    RingUnderrun,
    RingOverrun,
    VfEventRingFull,
    ParameterError,
    BandwidthOverrun,
    ContextStateError,
    NoPingResponseError,
    EventRingFullError,
    IncompatibleDeviceError,
    MissedServiceError,
    CommandRingStopped,
    CommandAborted,
    Stopped,
    StoppedLengthInvalid,
    StoppedShortPacket,
    MaxExitLatencyTooLarge,
    IsochBufferOverrun,
    EventLostError,
    UndefinedError,
    InvalidStreamIdError,
    SecondaryBandwidthError,
    SplitTransactionError,
    /// Vendor defined error, codes 192-223
    VendorError(u8),
    /// Vendor defined information, codes 224-255
    VendorInfo(u8),
    /// Reserved code
    Reserved(u8),
}

impl CompletionCode {
    /// Decode a raw completion code
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Invalid,
            1 => Self::Success,
            2 => Self::DataBufferError,
            3 => Self::BabbleDetectedError,
            4 => Self::UsbTransactionError,
            5 => Self::TrbError,
            6 => Self::StallError,
            7 => Self::ResourceError,
            8 => Self::BandwidthError,
            9 => Self::NoSlotsAvailable,
            10 => Self::InvalidStreamType,
            11 => Self::SlotNotEnabled,
            12 => Self::EndpointNotEnabled,
            13 => Self::ShortPacket,
            14 => Self::RingUnderrun,
            15 => Self::RingOverrun,
            16 => Self::VfEventRingFull,
            17 => Self::ParameterError,
            18 => Self::BandwidthOverrun,
            19 => Self::ContextStateError,
            20 => Self::NoPingResponseError,
            21 => Self::EventRingFullError,
            22 => Self::IncompatibleDeviceError,
            23 => Self::MissedServiceError,
            24 => Self::CommandRingStopped,
            25 => Self::CommandAborted,
            26 => Self::Stopped,
            27 => Self::StoppedLengthInvalid,
            28 => Self::StoppedShortPacket,
            29 => Self::MaxExitLatencyTooLarge,
            31 => Self::IsochBufferOverrun,
            32 => Self::EventLostError,
            33 => Self::UndefinedError,
            34 => Self::InvalidStreamIdError,
            35 => Self::SecondaryBandwidthError,
            36 => Self::SplitTransactionError,
            192..=223 => Self::VendorError(raw),
            224..=255 => Self::VendorInfo(raw),
            _ => Self::Reserved(raw),
        }
    }

    /// Raw 8-bit value
    pub fn raw(self) -> u8 {
        match self {
            Self::Invalid => 0,
            Self::Success => 1,
            Self::DataBufferError => 2,
            Self::BabbleDetectedError => 3,
            Self::UsbTransactionError => 4,
            Self::TrbError => 5,
            Self::StallError => 6,
            Self::ResourceError => 7,
            Self::BandwidthError => 8,
            Self::NoSlotsAvailable => 9,
            Self::InvalidStreamType => 10,
            Self::SlotNotEnabled => 11,
            Self::EndpointNotEnabled => 12,
            Self::ShortPacket => 13,
            Self::RingUnderrun => 14,
            Self::RingOverrun => 15,
            Self::VfEventRingFull => 16,
            Self::ParameterError => 17,
            Self::BandwidthOverrun => 18,
            Self::ContextStateError => 19,
            Self::NoPingResponseError => 20,
            Self::EventRingFullError => 21,
            Self::IncompatibleDeviceError => 22,
            Self::MissedServiceError => 23,
            Self::CommandRingStopped => 24,
            Self::CommandAborted => 25,
            Self::Stopped => 26,
            Self::StoppedLengthInvalid => 27,
            Self::StoppedShortPacket => 28,
            Self::MaxExitLatencyTooLarge => 29,
            Self::IsochBufferOverrun => 31,
            Self::EventLostError => 32,
            Self::UndefinedError => 33,
            Self::InvalidStreamIdError => 34,
            Self::SecondaryBandwidthError => 35,
            Self::SplitTransactionError => 36,
            Self::VendorError(raw) | Self::VendorInfo(raw) | Self::Reserved(raw) => raw,
        }
    }

    /// Success, or a vendor informational code that the controller uses as success
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::VendorInfo(_))
    }

    /// One of the three "endpoint stopped" codes
    pub fn is_stopped(self) -> bool {
        matches!(
            self,
            Self::Stopped | Self::StoppedLengthInvalid | Self::StoppedShortPacket
        )
    }
}

/// Set of completion codes, used to describe which previous codes make a
/// following Success event spurious
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CompletionCodeSet(u64);

impl CompletionCodeSet {
    /// Empty set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Set with `code` added. Codes above 63 are not representable and ignored.
    pub fn with(self, code: CompletionCode) -> Self {
        match code.raw() {
            raw @ 0..=63 => Self(self.0 | 1 << raw),
            _ => self,
        }
    }

    /// Membership test
    pub fn contains(self, code: CompletionCode) -> bool {
        match code.raw() {
            raw @ 0..=63 => self.0 & (1 << raw) != 0,
            _ => false,
        }
    }

    /// True when no code is in the set
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// One 16-byte TRB as four little-endian dwords
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Trb {
    pub field: [u32; 4],
}

impl Trb {
    /// Build a TRB from its four dwords
    pub const fn new(field0: u32, field1: u32, field2: u32, field3: u32) -> Self {
        Self {
            field: [field0, field1, field2, field3],
        }
    }

    /// All-zero TRB
    pub const fn zeroed() -> Self {
        Self { field: [0; 4] }
    }

    /// 64-bit parameter (dwords 0 and 1)
    pub fn parameter(&self) -> u64 {
        u64::from(self.field[0]) | u64::from(self.field[1]) << 32
    }

    /// Status dword
    pub fn status(&self) -> u32 {
        self.field[2]
    }

    /// Control dword
    pub fn control(&self) -> u32 {
        self.field[3]
    }

    /// Cycle bit
    pub fn cycle(&self) -> bool {
        self.field[3] & TRB_CYCLE != 0
    }

    /// Copy of this TRB with the cycle bit forced to `cycle`
    pub fn with_cycle(mut self, cycle: bool) -> Self {
        self.field[3] = (self.field[3] & !TRB_CYCLE) | u32::from(cycle);
        self
    }

    /// Raw 6-bit TRB type
    pub fn raw_type(&self) -> u8 {
        ((self.field[3] & TYPE_MASK) >> TYPE_SHIFT) as u8
    }

    /// Decoded TRB type
    pub fn trb_type(&self) -> Option<TrbType> {
        TrbType::from_raw(self.raw_type())
    }

    /// Link TRB test
    pub fn is_link(&self) -> bool {
        self.raw_type() == TrbType::Link as u8
    }

    /// Transfer or command No-Op
    pub fn is_noop(&self) -> bool {
        let raw = self.raw_type();
        raw == TrbType::TransferNoop as u8 || raw == TrbType::CommandNoop as u8
    }

    /// Chain flag in the control dword
    pub fn chain(&self) -> bool {
        self.field[3] & TrbFlags::CHAIN.bits() != 0
    }

    /// Serialize to the on-wire byte order
    pub fn to_bytes(&self) -> [u8; TRB_SIZE] {
        let mut out = [0u8; TRB_SIZE];
        for (i, word) in self.field.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Parse from on-wire bytes
    pub fn from_bytes(bytes: &[u8; TRB_SIZE]) -> Self {
        let mut field = [0u32; 4];
        for (i, word) in field.iter_mut().enumerate() {
            *word = u32::from_le_bytes([
                bytes[i * 4],
                bytes[i * 4 + 1],
                bytes[i * 4 + 2],
                bytes[i * 4 + 3],
            ]);
        }
        Self { field }
    }
}

fn lower_32(addr: u64) -> u32 {
    addr as u32
}

fn upper_32(addr: u64) -> u32 {
    (addr >> 32) as u32
}

fn transfer_status(len: u32, td_size: u8, interrupter: u16) -> u32 {
    (len & TRB_LEN_MASK)
        | (u32::from(td_size).min(MAX_TD_SIZE) << TD_SIZE_SHIFT)
        | ((u32::from(interrupter) & INTR_TARGET_MASK) << INTR_TARGET_SHIFT)
}

fn status_len(status: u32) -> u32 {
    status & TRB_LEN_MASK
}

fn status_td_size(status: u32) -> u8 {
    ((status >> TD_SIZE_SHIFT) & MAX_TD_SIZE) as u8
}

fn status_interrupter(status: u32) -> u16 {
    ((status >> INTR_TARGET_SHIFT) & INTR_TARGET_MASK) as u16
}

fn slot_field(slot_id: u8) -> u32 {
    u32::from(slot_id) << SLOT_ID_SHIFT
}

fn endpoint_field(ep_index: u8) -> u32 {
    ((u32::from(ep_index) + 1) & EP_ID_MASK) << EP_ID_SHIFT
}

fn control_slot(control: u32) -> u8 {
    (control >> SLOT_ID_SHIFT) as u8
}

fn control_ep_index(control: u32) -> u8 {
    (((control >> EP_ID_SHIFT) & EP_ID_MASK) as u8).saturating_sub(1)
}

fn is_type(trb: &Trb, t: TrbType) -> bool {
    trb.raw_type() == t as u8
}

/// Normal TRB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalTrb {
    pub buffer: u64,
    pub length: u32,
    pub td_size: u8,
    pub interrupter: u16,
    pub flags: TrbFlags,
}

impl NormalTrb {
    pub fn encode(&self) -> Trb {
        Trb::new(
            lower_32(self.buffer),
            upper_32(self.buffer),
            transfer_status(self.length, self.td_size, self.interrupter),
            TrbType::Normal.field() | (self.flags & TrbFlags::NORMAL).bits(),
        )
    }

    pub fn decode(trb: &Trb) -> Option<Self> {
        if !is_type(trb, TrbType::Normal) {
            return None;
        }
        Some(Self {
            buffer: trb.parameter(),
            length: status_len(trb.status()),
            td_size: status_td_size(trb.status()),
            interrupter: status_interrupter(trb.status()),
            flags: TrbFlags::from_bits_truncate(trb.control()) & TrbFlags::NORMAL,
        })
    }
}

/// Transfer Type field of a Setup Stage TRB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SetupTransferType {
    NoData = 0,
    Out = 2,
    In = 3,
}

/// Setup Stage TRB. Immediate Data is always set and not part of `flags`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupTrb {
    pub setup: [u8; 8],
    pub transfer_type: SetupTransferType,
    pub interrupter: u16,
    pub flags: TrbFlags,
}

impl SetupTrb {
    pub fn encode(&self) -> Trb {
        let s = &self.setup;
        Trb::new(
            u32::from_le_bytes([s[0], s[1], s[2], s[3]]),
            u32::from_le_bytes([s[4], s[5], s[6], s[7]]),
            transfer_status(8, 0, self.interrupter),
            TrbType::SetupStage.field()
                | TrbFlags::IDT.bits()
                | (self.flags & TrbFlags::STAGE).bits()
                | (self.transfer_type as u32) << SETUP_TRT_SHIFT,
        )
    }

    pub fn decode(trb: &Trb) -> Option<Self> {
        if !is_type(trb, TrbType::SetupStage) {
            return None;
        }
        let lo = trb.field[0].to_le_bytes();
        let hi = trb.field[1].to_le_bytes();
        let transfer_type = match (trb.control() >> SETUP_TRT_SHIFT) & 0x3 {
            2 => SetupTransferType::Out,
            3 => SetupTransferType::In,
            _ => SetupTransferType::NoData,
        };
        Some(Self {
            setup: [lo[0], lo[1], lo[2], lo[3], hi[0], hi[1], hi[2], hi[3]],
            transfer_type,
            interrupter: status_interrupter(trb.status()),
            flags: TrbFlags::from_bits_truncate(trb.control()) & TrbFlags::STAGE,
        })
    }
}

/// Data Stage TRB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataTrb {
    pub buffer: u64,
    pub length: u32,
    pub td_size: u8,
    pub interrupter: u16,
    pub dir_in: bool,
    pub flags: TrbFlags,
}

impl DataTrb {
    pub fn encode(&self) -> Trb {
        let dir = if self.dir_in { DIR_IN } else { 0 };
        Trb::new(
            lower_32(self.buffer),
            upper_32(self.buffer),
            transfer_status(self.length, self.td_size, self.interrupter),
            TrbType::DataStage.field() | dir | (self.flags & TrbFlags::NORMAL).bits(),
        )
    }

    pub fn decode(trb: &Trb) -> Option<Self> {
        if !is_type(trb, TrbType::DataStage) {
            return None;
        }
        Some(Self {
            buffer: trb.parameter(),
            length: status_len(trb.status()),
            td_size: status_td_size(trb.status()),
            interrupter: status_interrupter(trb.status()),
            dir_in: trb.control() & DIR_IN != 0,
            flags: TrbFlags::from_bits_truncate(trb.control()) & TrbFlags::NORMAL,
        })
    }
}

/// Status Stage TRB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusTrb {
    pub dir_in: bool,
    pub interrupter: u16,
    pub flags: TrbFlags,
}

impl StatusTrb {
    pub fn encode(&self) -> Trb {
        let dir = if self.dir_in { DIR_IN } else { 0 };
        Trb::new(
            0,
            0,
            transfer_status(0, 0, self.interrupter),
            TrbType::StatusStage.field() | dir | (self.flags & TrbFlags::STAGE).bits(),
        )
    }

    pub fn decode(trb: &Trb) -> Option<Self> {
        if !is_type(trb, TrbType::StatusStage) {
            return None;
        }
        Some(Self {
            dir_in: trb.control() & DIR_IN != 0,
            interrupter: status_interrupter(trb.status()),
            flags: TrbFlags::from_bits_truncate(trb.control()) & TrbFlags::STAGE,
        })
    }
}

/// Frame placement of an Isoch TRB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IsocFrame {
    /// Start Isoch ASAP (SIA)
    Asap,
    /// Explicit 11-bit frame id
    Frame(u16),
}

/// Isoch TRB (first TRB of an isochronous TD)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsochTrb {
    pub buffer: u64,
    pub length: u32,
    pub td_size: u8,
    pub interrupter: u16,
    /// Transfer Last Burst Packet Count
    pub tlbpc: u8,
    /// Transfer Burst Count
    pub tbc: u8,
    pub frame: IsocFrame,
    pub flags: TrbFlags,
}

impl IsochTrb {
    pub fn encode(&self) -> Trb {
        let frame = match self.frame {
            IsocFrame::Asap => ISOC_SIA,
            IsocFrame::Frame(id) => (u32::from(id) & ISOC_FRAME_ID_MASK) << ISOC_FRAME_ID_SHIFT,
        };
        Trb::new(
            lower_32(self.buffer),
            upper_32(self.buffer),
            transfer_status(self.length, self.td_size, self.interrupter),
            TrbType::Isoch.field()
                | (self.flags & TrbFlags::NORMAL).bits()
                | (u32::from(self.tbc) & 0x3) << ISOC_TBC_SHIFT
                | (u32::from(self.tlbpc) & 0xf) << ISOC_TLBPC_SHIFT
                | frame,
        )
    }

    pub fn decode(trb: &Trb) -> Option<Self> {
        if !is_type(trb, TrbType::Isoch) {
            return None;
        }
        let control = trb.control();
        let frame = if control & ISOC_SIA != 0 {
            IsocFrame::Asap
        } else {
            IsocFrame::Frame(((control >> ISOC_FRAME_ID_SHIFT) & ISOC_FRAME_ID_MASK) as u16)
        };
        Some(Self {
            buffer: trb.parameter(),
            length: status_len(trb.status()),
            td_size: status_td_size(trb.status()),
            interrupter: status_interrupter(trb.status()),
            tlbpc: ((control >> ISOC_TLBPC_SHIFT) & 0xf) as u8,
            tbc: ((control >> ISOC_TBC_SHIFT) & 0x3) as u8,
            frame,
            flags: TrbFlags::from_bits_truncate(control) & TrbFlags::NORMAL,
        })
    }
}

/// Link TRB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkTrb {
    pub segment: u64,
    pub toggle: bool,
    pub chain: bool,
}

impl LinkTrb {
    pub fn encode(&self) -> Trb {
        let mut control = TrbType::Link.field();
        if self.toggle {
            control |= LINK_TOGGLE;
        }
        if self.chain {
            control |= TrbFlags::CHAIN.bits();
        }
        Trb::new(lower_32(self.segment), upper_32(self.segment), 0, control)
    }

    pub fn decode(trb: &Trb) -> Option<Self> {
        if !trb.is_link() {
            return None;
        }
        Some(Self {
            segment: trb.parameter() & !0xf,
            toggle: trb.control() & LINK_TOGGLE != 0,
            chain: trb.chain(),
        })
    }
}

/// Encode a Normal TRB
pub fn encode_normal(addr: u64, len: u32, td_size: u8, interrupter: u16, flags: TrbFlags) -> Trb {
    NormalTrb {
        buffer: addr,
        length: len,
        td_size,
        interrupter,
        flags,
    }
    .encode()
}

/// Encode a Setup Stage TRB from the raw 8-byte setup packet
pub fn encode_setup(
    setup: [u8; 8],
    transfer_type: SetupTransferType,
    interrupter: u16,
    flags: TrbFlags,
) -> Trb {
    SetupTrb {
        setup,
        transfer_type,
        interrupter,
        flags,
    }
    .encode()
}

/// Encode a Data Stage TRB
pub fn encode_data(
    addr: u64,
    len: u32,
    td_size: u8,
    interrupter: u16,
    dir_in: bool,
    flags: TrbFlags,
) -> Trb {
    DataTrb {
        buffer: addr,
        length: len,
        td_size,
        interrupter,
        dir_in,
        flags,
    }
    .encode()
}

/// Encode a Status Stage TRB
pub fn encode_status(dir_in: bool, interrupter: u16, flags: TrbFlags) -> Trb {
    StatusTrb {
        dir_in,
        interrupter,
        flags,
    }
    .encode()
}

/// Encode an Isoch TRB
#[allow(clippy::too_many_arguments)]
pub fn encode_isoc(
    addr: u64,
    len: u32,
    td_size: u8,
    interrupter: u16,
    tlbpc: u8,
    tbc: u8,
    frame: IsocFrame,
    flags: TrbFlags,
) -> Trb {
    IsochTrb {
        buffer: addr,
        length: len,
        td_size,
        interrupter,
        tlbpc,
        tbc,
        frame,
        flags,
    }
    .encode()
}

/// Encode a Link TRB pointing at `next_seg_dma`
pub fn encode_link(next_seg_dma: u64, toggle: bool, chain: bool) -> Trb {
    LinkTrb {
        segment: next_seg_dma,
        toggle,
        chain,
    }
    .encode()
}

/// Encode a transfer ring No-Op TRB
pub fn encode_noop(interrupter: u16, flags: TrbFlags) -> Trb {
    Trb::new(
        0,
        0,
        transfer_status(0, 0, interrupter),
        TrbType::TransferNoop.field() | (flags & TrbFlags::STAGE).bits(),
    )
}

/// Decode a Normal TRB
pub fn decode_normal(trb: &Trb) -> Option<NormalTrb> {
    NormalTrb::decode(trb)
}

/// Decode a Setup Stage TRB
pub fn decode_setup(trb: &Trb) -> Option<SetupTrb> {
    SetupTrb::decode(trb)
}

/// Decode a Data Stage TRB
pub fn decode_data(trb: &Trb) -> Option<DataTrb> {
    DataTrb::decode(trb)
}

/// Decode a Status Stage TRB
pub fn decode_status(trb: &Trb) -> Option<StatusTrb> {
    StatusTrb::decode(trb)
}

/// Decode an Isoch TRB
pub fn decode_isoc(trb: &Trb) -> Option<IsochTrb> {
    IsochTrb::decode(trb)
}

/// Decode a Link TRB
pub fn decode_link(trb: &Trb) -> Option<LinkTrb> {
    LinkTrb::decode(trb)
}

/// Command ring TRBs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandTrb {
    EnableSlot {
        slot_type: u8,
    },
    DisableSlot {
        slot_id: u8,
    },
    AddressDevice {
        input_context: u64,
        slot_id: u8,
        block_set_address: bool,
    },
    ConfigureEndpoint {
        input_context: u64,
        slot_id: u8,
        deconfigure: bool,
    },
    EvaluateContext {
        input_context: u64,
        slot_id: u8,
    },
    ResetEndpoint {
        slot_id: u8,
        ep_index: u8,
        /// Transfer State Preserve (soft reset)
        preserve: bool,
    },
    StopEndpoint {
        slot_id: u8,
        ep_index: u8,
        suspend: bool,
    },
    SetTrDequeue {
        slot_id: u8,
        ep_index: u8,
        stream_id: u16,
        dequeue: u64,
        cycle: bool,
        sct: u8,
    },
    ResetDevice {
        slot_id: u8,
    },
    Noop,
}

impl CommandTrb {
    /// TRB type of this command
    pub fn trb_type(&self) -> TrbType {
        match self {
            Self::EnableSlot { .. } => TrbType::EnableSlot,
            Self::DisableSlot { .. } => TrbType::DisableSlot,
            Self::AddressDevice { .. } => TrbType::AddressDevice,
            Self::ConfigureEndpoint { .. } => TrbType::ConfigureEndpoint,
            Self::EvaluateContext { .. } => TrbType::EvaluateContext,
            Self::ResetEndpoint { .. } => TrbType::ResetEndpoint,
            Self::StopEndpoint { .. } => TrbType::StopEndpoint,
            Self::SetTrDequeue { .. } => TrbType::SetTrDequeue,
            Self::ResetDevice { .. } => TrbType::ResetDevice,
            Self::Noop => TrbType::CommandNoop,
        }
    }

    /// Slot the command targets, 0 for slot-less commands
    pub fn slot_id(&self) -> u8 {
        match *self {
            Self::EnableSlot { .. } | Self::Noop => 0,
            Self::DisableSlot { slot_id }
            | Self::AddressDevice { slot_id, .. }
            | Self::ConfigureEndpoint { slot_id, .. }
            | Self::EvaluateContext { slot_id, .. }
            | Self::ResetEndpoint { slot_id, .. }
            | Self::StopEndpoint { slot_id, .. }
            | Self::SetTrDequeue { slot_id, .. }
            | Self::ResetDevice { slot_id } => slot_id,
        }
    }

    pub fn encode(&self) -> Trb {
        let ty = self.trb_type().field();
        match *self {
            Self::EnableSlot { slot_type } => {
                Trb::new(0, 0, 0, ty | (u32::from(slot_type) & 0x1f) << SLOT_TYPE_SHIFT)
            }
            Self::DisableSlot { slot_id } | Self::ResetDevice { slot_id } => {
                Trb::new(0, 0, 0, ty | slot_field(slot_id))
            }
            Self::AddressDevice {
                input_context,
                slot_id,
                block_set_address,
            } => Trb::new(
                lower_32(input_context),
                upper_32(input_context),
                0,
                ty | slot_field(slot_id) | if block_set_address { BSR } else { 0 },
            ),
            Self::ConfigureEndpoint {
                input_context,
                slot_id,
                deconfigure,
            } => Trb::new(
                lower_32(input_context),
                upper_32(input_context),
                0,
                ty | slot_field(slot_id) | if deconfigure { DECONFIGURE } else { 0 },
            ),
            Self::EvaluateContext {
                input_context,
                slot_id,
            } => Trb::new(
                lower_32(input_context),
                upper_32(input_context),
                0,
                ty | slot_field(slot_id),
            ),
            Self::ResetEndpoint {
                slot_id,
                ep_index,
                preserve,
            } => Trb::new(
                0,
                0,
                0,
                ty | slot_field(slot_id) | endpoint_field(ep_index) | if preserve { TSP } else { 0 },
            ),
            Self::StopEndpoint {
                slot_id,
                ep_index,
                suspend,
            } => Trb::new(
                0,
                0,
                0,
                ty | slot_field(slot_id)
                    | endpoint_field(ep_index)
                    | if suspend { SUSPEND_EP } else { 0 },
            ),
            Self::SetTrDequeue {
                slot_id,
                ep_index,
                stream_id,
                dequeue,
                cycle,
                sct,
            } => Trb::new(
                lower_32(dequeue & !0xf)
                    | (u32::from(sct) & SCT_MASK) << SCT_SHIFT
                    | u32::from(cycle),
                upper_32(dequeue),
                u32::from(stream_id) << STREAM_ID_SHIFT,
                ty | slot_field(slot_id) | endpoint_field(ep_index),
            ),
            Self::Noop => Trb::new(0, 0, 0, ty),
        }
    }

    pub fn decode(trb: &Trb) -> Option<Self> {
        let control = trb.control();
        let slot_id = control_slot(control);
        let ep_index = control_ep_index(control);
        Some(match trb.trb_type()? {
            TrbType::EnableSlot => Self::EnableSlot {
                slot_type: ((control >> SLOT_TYPE_SHIFT) & 0x1f) as u8,
            },
            TrbType::DisableSlot => Self::DisableSlot { slot_id },
            TrbType::AddressDevice => Self::AddressDevice {
                input_context: trb.parameter(),
                slot_id,
                block_set_address: control & BSR != 0,
            },
            TrbType::ConfigureEndpoint => Self::ConfigureEndpoint {
                input_context: trb.parameter(),
                slot_id,
                deconfigure: control & DECONFIGURE != 0,
            },
            TrbType::EvaluateContext => Self::EvaluateContext {
                input_context: trb.parameter(),
                slot_id,
            },
            TrbType::ResetEndpoint => Self::ResetEndpoint {
                slot_id,
                ep_index,
                preserve: control & TSP != 0,
            },
            TrbType::StopEndpoint => Self::StopEndpoint {
                slot_id,
                ep_index,
                suspend: control & SUSPEND_EP != 0,
            },
            TrbType::SetTrDequeue => Self::SetTrDequeue {
                slot_id,
                ep_index,
                stream_id: (trb.status() >> STREAM_ID_SHIFT) as u16,
                dequeue: trb.parameter() & !0xf,
                cycle: trb.field[0] & 1 != 0,
                sct: ((trb.field[0] >> SCT_SHIFT) & SCT_MASK) as u8,
            },
            TrbType::ResetDevice => Self::ResetDevice { slot_id },
            TrbType::CommandNoop => Self::Noop,
            _ => return None,
        })
    }
}

/// Encode a command TRB
pub fn encode_command(command: &CommandTrb) -> Trb {
    command.encode()
}

/// Decode a command TRB
pub fn decode_command(trb: &Trb) -> Option<CommandTrb> {
    CommandTrb::decode(trb)
}

/// Transfer Event TRB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferEvent {
    /// DMA address of the TRB that generated the event (or Event Data payload)
    pub trb_pointer: u64,
    /// Residual bytes not transferred (24 bits)
    pub transfer_length: u32,
    pub code: CompletionCode,
    /// Event was generated by an Event Data TRB
    pub event_data: bool,
    pub slot_id: u8,
    /// Device Context Index (1-31)
    pub endpoint_id: u8,
}

impl TransferEvent {
    /// Endpoint index (DCI - 1), `None` for DCI 0
    pub fn ep_index(&self) -> Option<u8> {
        self.endpoint_id.checked_sub(1)
    }

    pub fn encode(&self) -> Trb {
        let ed = if self.event_data { EVENT_DATA } else { 0 };
        Trb::new(
            lower_32(self.trb_pointer),
            upper_32(self.trb_pointer),
            (self.transfer_length & EVENT_LEN_MASK) | u32::from(self.code.raw()) << COMP_CODE_SHIFT,
            TrbType::TransferEvent.field()
                | ed
                | (u32::from(self.endpoint_id) & EP_ID_MASK) << EP_ID_SHIFT
                | slot_field(self.slot_id),
        )
    }

    fn decode(trb: &Trb) -> Self {
        let control = trb.control();
        Self {
            trb_pointer: trb.parameter(),
            transfer_length: trb.status() & EVENT_LEN_MASK,
            code: CompletionCode::from_raw((trb.status() >> COMP_CODE_SHIFT) as u8),
            event_data: control & EVENT_DATA != 0,
            slot_id: control_slot(control),
            endpoint_id: ((control >> EP_ID_SHIFT) & EP_ID_MASK) as u8,
        }
    }
}

/// Command Completion Event TRB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandCompletionEvent {
    /// DMA address of the completed command TRB
    pub command_trb: u64,
    /// Command completion parameter (24 bits)
    pub parameter: u32,
    pub code: CompletionCode,
    pub vf_id: u8,
    pub slot_id: u8,
}

impl CommandCompletionEvent {
    pub fn encode(&self) -> Trb {
        Trb::new(
            lower_32(self.command_trb),
            upper_32(self.command_trb),
            (self.parameter & EVENT_LEN_MASK) | u32::from(self.code.raw()) << COMP_CODE_SHIFT,
            TrbType::CommandCompletion.field()
                | u32::from(self.vf_id) << 16
                | slot_field(self.slot_id),
        )
    }

    fn decode(trb: &Trb) -> Self {
        Self {
            command_trb: trb.parameter(),
            parameter: trb.status() & EVENT_LEN_MASK,
            code: CompletionCode::from_raw((trb.status() >> COMP_CODE_SHIFT) as u8),
            vf_id: (trb.control() >> 16) as u8,
            slot_id: control_slot(trb.control()),
        }
    }
}

/// Port Status Change Event TRB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PortStatusChangeEvent {
    /// One-based root hub port number
    pub port_id: u8,
    pub code: CompletionCode,
}

impl PortStatusChangeEvent {
    pub fn encode(&self) -> Trb {
        Trb::new(
            u32::from(self.port_id) << 24,
            0,
            u32::from(self.code.raw()) << COMP_CODE_SHIFT,
            TrbType::PortStatusChange.field(),
        )
    }

    fn decode(trb: &Trb) -> Self {
        Self {
            port_id: (trb.field[0] >> 24) as u8,
            code: CompletionCode::from_raw((trb.status() >> COMP_CODE_SHIFT) as u8),
        }
    }
}

/// Device Notification Event TRB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeviceNotificationEvent {
    pub notification_type: u8,
    /// Device notification data (parameter bits 8-63)
    pub data: u64,
    pub code: CompletionCode,
    pub slot_id: u8,
}

impl DeviceNotificationEvent {
    pub fn encode(&self) -> Trb {
        let param = (self.data << 8) | u64::from(self.notification_type & 0xf) << 4;
        Trb::new(
            lower_32(param),
            upper_32(param),
            u32::from(self.code.raw()) << COMP_CODE_SHIFT,
            TrbType::DeviceNotification.field() | slot_field(self.slot_id),
        )
    }

    fn decode(trb: &Trb) -> Self {
        Self {
            notification_type: ((trb.field[0] >> 4) & 0xf) as u8,
            data: trb.parameter() >> 8,
            code: CompletionCode::from_raw((trb.status() >> COMP_CODE_SHIFT) as u8),
            slot_id: control_slot(trb.control()),
        }
    }
}

/// Decoded event ring TRB
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    Transfer(TransferEvent),
    CommandCompletion(CommandCompletionEvent),
    PortStatusChange(PortStatusChangeEvent),
    DeviceNotification(DeviceNotificationEvent),
    MfindexWrap { code: CompletionCode },
    /// Vendor defined event type (48-63)
    Vendor { trb_type: u8 },
    /// Any other type; not expected on an event ring
    Unknown { trb_type: u8 },
}

impl Event {
    /// Classify an event TRB
    pub fn decode(trb: &Trb) -> Self {
        let raw = trb.raw_type();
        match TrbType::from_raw(raw) {
            Some(TrbType::TransferEvent) => Self::Transfer(TransferEvent::decode(trb)),
            Some(TrbType::CommandCompletion) => {
                Self::CommandCompletion(CommandCompletionEvent::decode(trb))
            }
            Some(TrbType::PortStatusChange) => {
                Self::PortStatusChange(PortStatusChangeEvent::decode(trb))
            }
            Some(TrbType::DeviceNotification) => {
                Self::DeviceNotification(DeviceNotificationEvent::decode(trb))
            }
            Some(TrbType::MfindexWrap) => Self::MfindexWrap {
                code: CompletionCode::from_raw((trb.status() >> COMP_CODE_SHIFT) as u8),
            },
            _ if raw >= TRB_VENDOR_DEFINED_LOW => Self::Vendor { trb_type: raw },
            _ => Self::Unknown { trb_type: raw },
        }
    }

    pub fn encode(&self) -> Trb {
        match self {
            Self::Transfer(ev) => ev.encode(),
            Self::CommandCompletion(ev) => ev.encode(),
            Self::PortStatusChange(ev) => ev.encode(),
            Self::DeviceNotification(ev) => ev.encode(),
            Self::MfindexWrap { code } => Trb::new(
                0,
                0,
                u32::from(code.raw()) << COMP_CODE_SHIFT,
                TrbType::MfindexWrap.field(),
            ),
            Self::Vendor { trb_type } | Self::Unknown { trb_type } => {
                Trb::new(0, 0, 0, (u32::from(*trb_type) << TYPE_SHIFT) & TYPE_MASK)
            }
        }
    }
}
