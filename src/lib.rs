#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

//! xHCI transfer ring engine
//!
//! Host-side ring manager and event dispatcher for an xHCI controller: it
//! lays transfers out as TRBs on producer rings, consumes the event ring,
//! matches events to in-flight transfer descriptors, and runs the command
//! sequences that recover halted endpoints and cancel queued work.
//!
//! Device enumeration, context layout and hub handling belong to the caller;
//! the engine reaches hardware only through the traits in [`hal`].
//!
//! # Core Components
//!
//! - [`controller`] - [`XhciController`], the locked front end and notification delivery
//! - [`ring`] - segmented TRB rings, expansion and the event ring
//! - [`trb`] - TRB and event encoding
//! - [`transfer`] - request types and per transfer type TD construction
//! - [`command`] - command ring, timeouts and abort
//! - [`error`] - [`XhciError`] and completion code mapping
//! - [`recovery`], [`perf`] - diagnostics counters

extern crate alloc;

#[cfg(test)]
extern crate std;

#[cfg(feature = "defmt")]
use defmt as _;

mod cancel;
pub mod command;
pub mod config;
pub mod controller;
pub mod dma;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod hal;
pub mod perf;
pub mod recovery;
pub mod register;
pub mod ring;
pub mod td;
pub mod transfer;
pub mod trb;

#[cfg(test)]
mod test_util;

pub use command::{CmdRingState, CommandCompletion, CommandId};
pub use config::{HostConfig, Quirks};
pub use controller::{Notification, XhciController};
pub use dma::{DmaRegion, DmaSlice};
pub use endpoint::{EndpointConfig, EpState, SlotInfo, TransferType, TtInfo, UsbSpeed};
pub use error::{Result, XhciError};
pub use event::IrqStatus;
pub use hal::{Clock, Doorbell, DmaMapper, EndpointContexts, EpContextState, InterruptSource, Mmio, Platform};
pub use perf::{PerfCounters, PerfSnapshot};
pub use recovery::{RecoveryAction, RecoveryStats};
pub use transfer::{
    IsoPacket, SetupPacket, TransferBuffer, TransferCompletion, TransferFlags, TransferId, TransferKind,
    TransferRequest,
};
pub use trb::{CommandTrb, CompletionCode, Trb};
