//! Interrupt TDs
//!
//! An interrupt request is laid out exactly like a bulk request. The only
//! difference is the interval: the one programmed in the endpoint context is
//! what the controller honors, so the request is corrected to match it.

use super::TransferId;
use crate::controller::HostState;
use crate::error::Result;
use crate::hal::Platform;

impl HostState {
    pub(crate) fn queue_intr_tx<P: Platform>(&mut self, hw: &P, urb_id: TransferId) -> Result<()> {
        self.check_interval(urb_id);
        self.queue_bulk_tx(hw, urb_id)
    }
}

/// Interval in the unit the endpoint context uses (microframes)
pub(crate) fn context_interval(interval: u32, uses_frames: bool) -> u32 {
    if uses_frames {
        interval * 8
    } else {
        interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_interval_units() {
        assert_eq!(context_interval(4, true), 32);
        assert_eq!(context_interval(4, false), 4);
        assert_eq!(context_interval(0, true), 0);
    }
}
