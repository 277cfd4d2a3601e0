//! Engine configuration and controller quirks

use bitflags::bitflags;

use crate::trb::{CompletionCode, CompletionCodeSet};

bitflags! {
    /// Controller-specific behavior switches
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Quirks: u32 {
        /// Link TRB chain bit is fixed at allocation and never rewritten
        const LINK_CHAIN = 1 << 0;
        /// Same as `LINK_CHAIN`, isochronous rings only
        const LINK_CHAIN_ISOC = 1 << 1;
        /// Controller may post Success after a Short Packet for the same TD
        const SPURIOUS_SUCCESS = 1 << 2;
        /// Etron: no Status TRB directly after a Link; spurious success on isoc rings
        const ETRON_HOST = 1 << 3;
        /// Never soft-retry transaction errors
        const NO_SOFT_RETRY = 1 << 4;
        /// Moderate isochronous BEI with a shrinking interval under event load
        const AVOID_BEI = 1 << 5;
        /// Cadence: reserved stream context fields must be cleared after Set TR Dequeue
        const CDNS_SCTX = 1 << 6;
        /// MediaTek: TD Size counts packets even on pre-1.0 interface versions
        const MTK_HOST = 1 << 7;
        /// Streams are not usable on this controller
        const BROKEN_STREAMS = 1 << 8;
    }
}

/// Ceiling for the isochronous BEI interval
pub const AVOID_BEI_INTERVAL_MAX: u32 = 32;
/// Floor for the isochronous BEI interval
pub const AVOID_BEI_INTERVAL_MIN: u32 = 8;

/// Engine configuration
#[derive(Debug, Clone, Copy)]
pub struct HostConfig {
    pub quirks: Quirks,
    /// Default command timeout
    pub command_timeout_ms: u32,
    /// Time allowed for CRR to clear after a command abort
    pub abort_timeout_ms: u32,
    /// Time allowed for the Command Ring Stopped event after CRR cleared
    pub ring_stopped_timeout_ms: u32,
    /// Window in which a Stop Endpoint that found a Running context is retried
    pub stop_endpoint_retry_ms: u32,
    /// Timeout applied to engine-issued Reset Endpoint commands
    pub reset_timeout_ms: u32,
    pub command_ring_segments: usize,
    pub event_ring_segments: usize,
    /// Segment count for new transfer and stream rings
    pub transfer_ring_segments: usize,
    /// Interrupter this engine services
    pub interrupter: u16,
    /// Transaction errors retried before surfacing to the client
    pub max_soft_retry: u32,
    /// Initial isochronous BEI interval (AVOID_BEI quirk)
    pub isoc_bei_interval: u32,
    /// Previous completion codes after which Success is spurious, any ring
    pub spurious_success: CompletionCodeSet,
    /// Same, isochronous rings only
    pub spurious_success_isoc: CompletionCodeSet,
    /// Extended TBC enabled (ETE); burst counts move to the TD Size field
    pub extended_tbc: bool,
}

impl HostConfig {
    /// Configuration with the code sets derived from `quirks`
    pub fn new(quirks: Quirks) -> Self {
        let mut spurious_success = CompletionCodeSet::empty();
        if quirks.contains(Quirks::SPURIOUS_SUCCESS) {
            spurious_success = spurious_success.with(CompletionCode::ShortPacket);
        }
        let mut spurious_success_isoc = CompletionCodeSet::empty();
        if quirks.contains(Quirks::ETRON_HOST) {
            spurious_success_isoc = spurious_success_isoc
                .with(CompletionCode::UsbTransactionError)
                .with(CompletionCode::BabbleDetectedError)
                .with(CompletionCode::IsochBufferOverrun);
        }
        Self {
            quirks,
            command_timeout_ms: 5000,
            abort_timeout_ms: 5000,
            ring_stopped_timeout_ms: 2000,
            stop_endpoint_retry_ms: 100,
            reset_timeout_ms: 50,
            command_ring_segments: 1,
            event_ring_segments: 1,
            transfer_ring_segments: 2,
            interrupter: 0,
            max_soft_retry: 3,
            isoc_bei_interval: AVOID_BEI_INTERVAL_MAX,
            spurious_success,
            spurious_success_isoc,
            extended_tbc: false,
        }
    }

    /// Override the default command timeout
    pub fn with_command_timeout(mut self, ms: u32) -> Self {
        self.command_timeout_ms = ms;
        self
    }

    /// Override the event ring segment count
    pub fn with_event_ring_segments(mut self, segments: usize) -> Self {
        self.event_ring_segments = segments;
        self
    }

    /// Override the transfer ring segment count
    pub fn with_transfer_ring_segments(mut self, segments: usize) -> Self {
        self.transfer_ring_segments = segments;
        self
    }

    /// Link chain bit must stay as allocated on a ring of this kind
    pub fn link_chain_quirk(&self, isoc: bool) -> bool {
        self.quirks.contains(Quirks::LINK_CHAIN)
            || (isoc && self.quirks.contains(Quirks::LINK_CHAIN_ISOC))
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self::new(Quirks::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let config = HostConfig::default();
        assert_eq!(config.command_timeout_ms, 5000);
        assert_eq!(config.stop_endpoint_retry_ms, 100);
        assert_eq!(config.reset_timeout_ms, 50);
        assert!(config.spurious_success.is_empty());
    }

    #[test]
    fn test_quirks_select_spurious_codes() {
        let config = HostConfig::new(Quirks::SPURIOUS_SUCCESS | Quirks::ETRON_HOST);
        assert!(config.spurious_success.contains(CompletionCode::ShortPacket));
        assert!(!config.spurious_success.contains(CompletionCode::BabbleDetectedError));
        assert!(config.spurious_success_isoc.contains(CompletionCode::IsochBufferOverrun));
    }

    #[test]
    fn test_link_chain_quirk_scope() {
        let config = HostConfig::new(Quirks::LINK_CHAIN_ISOC);
        assert!(config.link_chain_quirk(true));
        assert!(!config.link_chain_quirk(false));
    }
}
