//! Error types for the transfer ring engine

use core::fmt;

use crate::trb::CompletionCode;

/// Engine operation result type
pub type Result<T> = core::result::Result<T, XhciError>;

/// Engine error types
///
/// Transfer completions carry one of these as their status; submission and
/// command APIs return them directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum XhciError {
    /// Slot or endpoint is gone
    NoDevice,
    /// Event referenced no queued TD
    InvalidTransfer,
    /// Endpoint halted with a STALL handshake
    Stall,
    /// Transaction error (CRC, timeout, bad PID)
    TransactionError,
    /// Split transaction error behind a transaction translator
    SplitTransaction,
    /// Device rejected by the controller as incompatible
    IncompatibleDevice,
    /// Device sent more data than requested
    Babble,
    /// Controller could not reach host memory in time
    BufferError,
    /// Isochronous frame was not serviced and has been skipped
    MissedService,
    /// Isochronous bandwidth overrun
    BandwidthOverrun,
    /// Controller reported a malformed TRB
    TrbError,
    /// Short transfer on a request that disallows short packets
    ShortPacket,
    /// Command or controller timeout
    Timeout,
    /// Request cancelled by the client
    Cancelled,
    /// Host controller died
    Shutdown,
    /// Ring cannot grow or DMA allocation failed
    NoResources,
    /// A Set TR Dequeue is already pending on the endpoint
    Busy,
    /// Invalid parameter
    InvalidParameter,
    /// Invalid state for operation
    InvalidState,
    /// Endpoint is disabled
    EndpointDisabled,
    /// Stream id out of range for the endpoint
    InvalidStream,
    /// Completion code with no defined meaning for transfers
    UnknownCompletion,
}

impl XhciError {
    /// Map a transfer completion code to the status seen by the client.
    ///
    /// Success, short packet and vendor informational codes are not errors.
    pub fn from_completion(code: CompletionCode) -> Option<Self> {
        use CompletionCode as C;
        match code {
            C::Success | C::ShortPacket | C::VendorInfo(_) => None,
            C::StallError => Some(Self::Stall),
            C::UsbTransactionError => Some(Self::TransactionError),
            C::SplitTransactionError => Some(Self::SplitTransaction),
            C::IncompatibleDeviceError => Some(Self::IncompatibleDevice),
            C::BabbleDetectedError | C::IsochBufferOverrun => Some(Self::Babble),
            C::DataBufferError | C::RingUnderrun | C::RingOverrun => Some(Self::BufferError),
            C::MissedServiceError => Some(Self::MissedService),
            C::BandwidthOverrun => Some(Self::BandwidthOverrun),
            C::TrbError => Some(Self::TrbError),
            C::Stopped | C::StoppedLengthInvalid | C::StoppedShortPacket => {
                Some(Self::Cancelled)
            }
            _ => Some(Self::UnknownCompletion),
        }
    }
}

impl fmt::Display for XhciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDevice => write!(f, "No such device"),
            Self::InvalidTransfer => write!(f, "Event for unknown transfer"),
            Self::Stall => write!(f, "Endpoint stalled"),
            Self::TransactionError => write!(f, "Transaction error"),
            Self::SplitTransaction => write!(f, "Split transaction error"),
            Self::IncompatibleDevice => write!(f, "Incompatible device"),
            Self::Babble => write!(f, "Babble detected"),
            Self::BufferError => write!(f, "Data buffer error"),
            Self::MissedService => write!(f, "Missed service interval"),
            Self::BandwidthOverrun => write!(f, "Bandwidth overrun"),
            Self::TrbError => write!(f, "TRB error"),
            Self::ShortPacket => write!(f, "Short packet"),
            Self::Timeout => write!(f, "Timeout"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Shutdown => write!(f, "Host controller shut down"),
            Self::NoResources => write!(f, "No resources available"),
            Self::Busy => write!(f, "Dequeue update already pending"),
            Self::InvalidParameter => write!(f, "Invalid parameter"),
            Self::InvalidState => write!(f, "Invalid state"),
            Self::EndpointDisabled => write!(f, "Endpoint disabled"),
            Self::InvalidStream => write!(f, "Invalid stream id"),
            Self::UnknownCompletion => write!(f, "Unknown completion code"),
        }
    }
}
