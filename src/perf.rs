//! Performance counters
//!
//! Counters are updated when notifications are delivered, outside the
//! controller lock, and read through a [`PerfSnapshot`].

use core::sync::atomic::{AtomicU32, Ordering};

/// Engine activity counters
#[derive(Debug, Default)]
pub struct PerfCounters {
    /// Transfers accepted by `submit`
    pub transfers_submitted: AtomicU32,

    /// Transfers given back without error
    pub transfers_success: AtomicU32,

    /// Transfers given back with an error status
    pub transfers_failed: AtomicU32,

    /// Bytes moved by successful transfers, saturating
    pub bytes_transferred: AtomicU32,

    /// Event TRBs consumed from the event ring
    pub events_handled: AtomicU32,

    /// Interrupts that found events for this controller
    pub interrupt_count: AtomicU32,

    /// Client commands completed
    pub commands_completed: AtomicU32,

    /// Commands that ran past their timeout
    pub command_timeouts: AtomicU32,
}

impl PerfCounters {
    pub const fn new() -> Self {
        Self {
            transfers_submitted: AtomicU32::new(0),
            transfers_success: AtomicU32::new(0),
            transfers_failed: AtomicU32::new(0),
            bytes_transferred: AtomicU32::new(0),
            events_handled: AtomicU32::new(0),
            interrupt_count: AtomicU32::new(0),
            commands_completed: AtomicU32::new(0),
            command_timeouts: AtomicU32::new(0),
        }
    }

    #[inline(always)]
    pub fn record_submit(&self) {
        self.transfers_submitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_transfer_success(&self, bytes: usize) {
        self.transfers_success.fetch_add(1, Ordering::Relaxed);
        let bytes = u32::try_from(bytes).unwrap_or(u32::MAX);
        let _ = self
            .bytes_transferred
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_add(bytes))
            });
    }

    #[inline(always)]
    pub fn record_transfer_failure(&self) {
        self.transfers_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one interrupt that consumed `events` event TRBs
    #[inline(always)]
    pub fn record_interrupt(&self, events: u32) {
        self.interrupt_count.fetch_add(1, Ordering::Relaxed);
        self.events_handled.fetch_add(events, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_command(&self) {
        self.commands_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Raise the timeout counter to the command ring's running total
    pub fn sync_timeouts(&self, total: u32) {
        self.command_timeouts.fetch_max(total, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PerfSnapshot {
        PerfSnapshot {
            transfers_submitted: self.transfers_submitted.load(Ordering::Relaxed),
            transfers_success: self.transfers_success.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            events_handled: self.events_handled.load(Ordering::Relaxed),
            interrupt_count: self.interrupt_count.load(Ordering::Relaxed),
            commands_completed: self.commands_completed.load(Ordering::Relaxed),
            command_timeouts: self.command_timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.transfers_submitted,
            &self.transfers_success,
            &self.transfers_failed,
            &self.bytes_transferred,
            &self.events_handled,
            &self.interrupt_count,
            &self.commands_completed,
            &self.command_timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Immutable copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub struct PerfSnapshot {
    pub transfers_submitted: u32,
    pub transfers_success: u32,
    pub transfers_failed: u32,
    pub bytes_transferred: u32,
    pub events_handled: u32,
    pub interrupt_count: u32,
    pub commands_completed: u32,
    pub command_timeouts: u32,
}

impl PerfSnapshot {
    /// Transfers submitted and not yet given back
    pub fn in_flight(&self) -> u32 {
        self.transfers_submitted
            .saturating_sub(self.transfers_success + self.transfers_failed)
    }

    /// Percentage of completed transfers that succeeded
    pub fn success_rate(&self) -> f32 {
        let done = self.transfers_success + self.transfers_failed;
        if done == 0 {
            return 100.0;
        }
        (self.transfers_success as f32 / done as f32) * 100.0
    }

    /// Average events handled per interrupt
    pub fn events_per_interrupt(&self) -> f32 {
        if self.interrupt_count == 0 {
            return 0.0;
        }
        self.events_handled as f32 / self.interrupt_count as f32
    }
}
