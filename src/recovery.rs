//! Error recovery bookkeeping
//!
//! Every failing completion the event path handles is recorded together with
//! the recovery action the engine took for it. The counters are atomics so a
//! snapshot can be read without taking the controller lock.

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use crate::trb::CompletionCode;

/// Recovery action taken for a failing completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum RecoveryAction {
    /// Status handed to the client as is
    None = 0,
    /// Soft reset (Reset Endpoint with TSP) to retry a transaction error
    SoftRetry = 1,
    /// Hard reset of a halted endpoint
    ResetEndpoint = 2,
    /// Isochronous frame skipped and reported as missed
    SkipIsocFrame = 3,
    /// TD given back with the error, endpoint left running
    Giveback = 4,
    /// Controller declared dead
    HostDied = 5,
}

impl RecoveryAction {
    const COUNT: usize = 6;

    fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::None,
            1 => Self::SoftRetry,
            2 => Self::ResetEndpoint,
            3 => Self::SkipIsocFrame,
            4 => Self::Giveback,
            5 => Self::HostDied,
            _ => return None,
        })
    }
}

const CODE_SLOTS: usize = 64;
const NO_ACTION: u8 = u8::MAX;

/// Per completion code error counters
pub struct RecoveryStats {
    /// Indexed by raw completion code; vendor codes above 63 share the last slot
    code_counts: [AtomicU32; CODE_SLOTS],
    action_counts: [AtomicU32; RecoveryAction::COUNT],
    total_errors: AtomicU32,
    last_code: AtomicU8,
    last_action: AtomicU8,
}

impl RecoveryStats {
    pub const fn new() -> Self {
        const ZERO: AtomicU32 = AtomicU32::new(0);
        Self {
            code_counts: [ZERO; CODE_SLOTS],
            action_counts: [ZERO; RecoveryAction::COUNT],
            total_errors: AtomicU32::new(0),
            last_code: AtomicU8::new(0),
            last_action: AtomicU8::new(NO_ACTION),
        }
    }

    fn code_index(code: CompletionCode) -> usize {
        usize::from(code.raw()).min(CODE_SLOTS - 1)
    }

    /// Record one failing completion and what was done about it
    pub fn record(&self, code: CompletionCode, action: RecoveryAction) {
        self.code_counts[Self::code_index(code)].fetch_add(1, Ordering::Relaxed);
        self.action_counts[action as usize].fetch_add(1, Ordering::Relaxed);
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        self.last_code.store(code.raw(), Ordering::Relaxed);
        self.last_action.store(action as u8, Ordering::Relaxed);
    }

    /// Times `code` was recorded
    pub fn count(&self, code: CompletionCode) -> u32 {
        self.code_counts[Self::code_index(code)].load(Ordering::Relaxed)
    }

    /// Times `action` was taken
    pub fn action_count(&self, action: RecoveryAction) -> u32 {
        self.action_counts[action as usize].load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u32 {
        self.total_errors.load(Ordering::Relaxed)
    }

    /// Most recent failing code and the action chosen for it
    pub fn last(&self) -> Option<(CompletionCode, RecoveryAction)> {
        let action = RecoveryAction::from_raw(self.last_action.load(Ordering::Relaxed))?;
        Some((CompletionCode::from_raw(self.last_code.load(Ordering::Relaxed)), action))
    }

    /// True once the same code has been seen more than three times
    pub fn is_recurring(&self, code: CompletionCode) -> bool {
        self.count(code) > 3
    }

    pub fn reset(&self) {
        for counter in self.code_counts.iter().chain(self.action_counts.iter()) {
            counter.store(0, Ordering::Relaxed);
        }
        self.total_errors.store(0, Ordering::Relaxed);
        self.last_code.store(0, Ordering::Relaxed);
        self.last_action.store(NO_ACTION, Ordering::Relaxed);
    }
}

impl Default for RecoveryStats {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for RecoveryStats {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RecoveryStats")
            .field("total_errors", &self.total_errors())
            .field("last", &self.last())
            .finish()
    }
}
