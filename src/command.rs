//! Command ring engine
//!
//! Commands are queued FIFO on the command ring; the head of the queue is the
//! command the controller is executing and owns the single command timer.
//! Completion events must name the TRB at the command ring dequeue.
//!
//! A timed out command is aborted without blocking. `poll_timers` drives the
//! abort through its phases: wait for CRR to clear after writing CA, then wait
//! for the Command Ring Stopped event. Aborted commands are rewritten as
//! No-Ops and the ring is restarted at the next live command.

use alloc::collections::VecDeque;

use crate::controller::{HcState, HostState, Notification};
use crate::endpoint::EpState;
use crate::error::{Result, XhciError};
use crate::hal::Platform;
use crate::recovery::RecoveryAction;
use crate::register::{Crcr, UsbCmd, CRCR_PTR_MASK, DB_HOST_COMMAND};
use crate::ring::{Cursor, Ring};
use crate::trb::{CommandCompletionEvent, CommandTrb, CompletionCode, TrbType, TRB_CYCLE};

/// Handle of a queued command
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandId(pub u32);

/// Result of a client command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CommandCompletion {
    pub id: CommandId,
    pub command: CommandTrb,
    pub code: CompletionCode,
    /// Slot assigned by Enable Slot (0 on failure), otherwise the command's slot
    pub slot_id: u8,
    /// Command Completion Parameter
    pub parameter: u32,
}

/// Who is waiting for a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum CommandOrigin {
    Client,
    /// Issued by the engine for cancellation or halt recovery
    Engine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum CommandStatus {
    Queued,
    /// Timed out; abort in progress
    Aborted,
    /// Turned into a No-Op after the ring stopped
    RingStopped,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Command {
    pub(crate) id: CommandId,
    pub(crate) trb: CommandTrb,
    pub(crate) cursor: Cursor,
    pub(crate) status: CommandStatus,
    pub(crate) timeout_ms: u32,
    pub(crate) origin: CommandOrigin,
}

/// Software view of the command ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CmdRingState {
    Running,
    /// Abort requested, waiting for the controller
    Aborted,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AbortPhase {
    Idle,
    /// CA written, waiting for CRR to clear
    WaitCrrClear { deadline: u64 },
    /// CRR clear, waiting for the Command Ring Stopped event
    WaitRingStopped { deadline: u64 },
}

/// Command ring with its pending queue and timer
#[derive(Debug)]
pub struct CommandRing {
    pub(crate) ring: Ring,
    pub(crate) queue: VecDeque<Command>,
    pub(crate) state: CmdRingState,
    /// Deadline of the head command
    pub(crate) timer: Option<u64>,
    pub(crate) abort: AbortPhase,
    /// TRBs held back for commands that must not fail
    pub(crate) reserved_trbs: usize,
    pub(crate) timeouts: u32,
    next_id: u32,
}

impl CommandRing {
    pub(crate) fn new(ring: Ring) -> Self {
        Self {
            ring,
            queue: VecDeque::new(),
            state: CmdRingState::Running,
            timer: None,
            abort: AbortPhase::Idle,
            reserved_trbs: 1,
            timeouts: 0,
            next_id: 1,
        }
    }

    pub fn state(&self) -> CmdRingState {
        self.state
    }

    /// Commands queued and not yet completed
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Commands that ran past their timeout
    pub fn timeouts(&self) -> u32 {
        self.timeouts
    }

    /// CRCR value pointing the controller at `c` with the ring's cycle state
    pub(crate) fn crcr_for(&self, c: Cursor) -> u64 {
        (self.ring.trb_virt_to_dma(c) & CRCR_PTR_MASK) | u64::from(self.ring.cycle_state())
    }

    fn alloc_id(&mut self) -> CommandId {
        let id = CommandId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        id
    }
}

impl HostState {
    /// Put a command on the command ring.
    ///
    /// Commands that are not `must_succeed` leave the reserved TRBs free.
    /// The doorbell is not rung here.
    pub(crate) fn queue_command<P: Platform>(
        &mut self,
        hw: &P,
        trb: CommandTrb,
        timeout_ms: u32,
        origin: CommandOrigin,
        must_succeed: bool,
    ) -> Result<CommandId> {
        if self.hc.intersects(HcState::DYING | HcState::HALTED) {
            #[cfg(feature = "defmt")]
            defmt::debug!("host dying or halted, refusing {}", trb.trb_type());
            return Err(XhciError::Shutdown);
        }
        let needed = self.cmd.reserved_trbs + usize::from(!must_succeed);
        if self.cmd.ring.num_trbs_free() < needed {
            #[cfg(feature = "defmt")]
            defmt::error!("command ring full, cannot queue {}", trb.trb_type());
            return Err(XhciError::NoResources);
        }
        if self.cmd.ring.is_link(self.cmd.ring.enqueue()) {
            self.cmd.ring.inc_enq_past_link(false);
        }

        let id = self.cmd.alloc_id();
        let cursor = self.cmd.ring.enqueue();
        let command = Command {
            id,
            trb,
            cursor,
            status: CommandStatus::Queued,
            timeout_ms,
            origin,
        };
        if self.cmd.queue.is_empty() {
            self.arm_cmd_timer(hw, timeout_ms);
        }
        self.cmd.queue.push_back(command);
        self.cmd.ring.queue_trb(trb.encode(), false);
        #[cfg(feature = "defmt")]
        defmt::trace!("queued command {} {}", id.0, trb.trb_type());
        Ok(id)
    }

    fn arm_cmd_timer<P: Platform>(&mut self, hw: &P, timeout_ms: u32) {
        let deadline = hw.now_ms() + u64::from(timeout_ms);
        self.cmd.timer = Some(deadline);
        hw.arm(deadline);
    }

    /// Tell the controller the command ring has work
    pub(crate) fn ring_cmd_db<P: Platform>(&self, hw: &P) {
        if self.cmd.state != CmdRingState::Running {
            return;
        }
        self.cmd.ring.flush();
        hw.ring(0, DB_HOST_COMMAND);
    }

    /// Handle a Command Completion event
    pub(crate) fn handle_cmd_completion<P: Platform>(&mut self, hw: &P, ev: &CommandCompletionEvent) {
        if ev.slot_id > self.regs.max_slots() {
            #[cfg(feature = "defmt")]
            defmt::warn!("invalid slot id {} in command completion", ev.slot_id);
            return;
        }
        let mut code = ev.code;
        if code == CompletionCode::CommandRingStopped {
            self.handle_ring_stopped_event(hw);
            return;
        }

        let deq = self.cmd.ring.dequeue();
        let deq_dma = self.cmd.ring.trb_virt_to_dma(deq);
        let head = match self.cmd.queue.front() {
            Some(head) if ev.command_trb == deq_dma && head.cursor == deq => *head,
            _ => {
                #[cfg(feature = "defmt")]
                defmt::error!(
                    "command completion for {:#x} does not match dequeue {:#x}",
                    ev.command_trb,
                    deq_dma
                );
                self.hc_died(hw);
                return;
            }
        };
        self.cmd.timer = None;

        let mut aborted_head = false;
        if code == CompletionCode::CommandAborted {
            self.cmd.state = CmdRingState::Stopped;
            aborted_head = head.status == CommandStatus::Aborted;
        }

        let mut slot_id = head.trb.slot_id();
        if !aborted_head {
            let trb = self.cmd.ring.trb(deq);
            match trb.trb_type() {
                Some(TrbType::EnableSlot) => {
                    slot_id = if code == CompletionCode::Success { ev.slot_id } else { 0 };
                }
                Some(TrbType::StopEndpoint) => {
                    if head.origin == CommandOrigin::Engine {
                        self.handle_cmd_stop_ep(hw, &head.trb, code);
                    }
                }
                Some(TrbType::SetTrDequeue) => self.handle_cmd_set_deq(hw, &head.trb, code),
                Some(TrbType::ResetEndpoint) => self.handle_cmd_reset_ep(hw, &head.trb, code),
                Some(TrbType::CommandNoop) => {
                    if head.status == CommandStatus::RingStopped {
                        code = CompletionCode::CommandRingStopped;
                    }
                }
                Some(TrbType::ConfigureEndpoint) | Some(TrbType::EvaluateContext) => {
                    #[cfg(feature = "defmt")]
                    defmt::debug!("context command for slot {} completed: {}", slot_id, code);
                }
                _ => {}
            }
            if self.hc.contains(HcState::DYING) {
                return;
            }
            if self.cmd.queue.len() > 1 {
                let next_timeout = self.cmd.queue[1].timeout_ms;
                self.arm_cmd_timer(hw, next_timeout);
            }
        }

        self.cmd.queue.pop_front();
        self.cmd.ring.inc_deq();
        self.complete_command(&head, code, slot_id, ev.parameter);
    }

    fn complete_command(&mut self, cmd: &Command, code: CompletionCode, slot_id: u8, parameter: u32) {
        #[cfg(feature = "defmt")]
        defmt::trace!("command {} completed with {}", cmd.id.0, code);
        if cmd.origin == CommandOrigin::Client {
            self.outbox.push(Notification::Command(CommandCompletion {
                id: cmd.id,
                command: cmd.trb,
                code,
                slot_id,
                parameter,
            }));
        }
    }

    /// Command ring stopped after an abort: No-Op every aborted command and
    /// restart the ring at the current dequeue
    pub(crate) fn handle_stopped_cmd_ring<P: Platform>(&mut self, hw: &P) {
        let cycle_mask = TRB_CYCLE;
        for i in 0..self.cmd.queue.len() {
            if self.cmd.queue[i].status != CommandStatus::Aborted {
                continue;
            }
            let c = self.cmd.queue[i].cursor;
            self.cmd.queue[i].status = CommandStatus::RingStopped;
            let control = self.cmd.ring.trb(c).control();
            let noop = CommandTrb::Noop.encode();
            self.cmd.ring.stage(c, &noop);
            self.cmd.ring.publish(c, (noop.control() & !cycle_mask) | (control & cycle_mask));
            #[cfg(feature = "defmt")]
            defmt::debug!("turned aborted command {} into no-op", self.cmd.queue[i].id.0);
        }
        self.cmd.state = CmdRingState::Running;
        self.cmd.abort = AbortPhase::Idle;

        if !self.cmd.ring.is_empty() && !self.hc.contains(HcState::DYING) {
            if let Some(timeout) = self.cmd.queue.front().map(|c| c.timeout_ms) {
                self.arm_cmd_timer(hw, timeout);
            }
            self.ring_cmd_db(hw);
        }
    }

    fn handle_ring_stopped_event<P: Platform>(&mut self, hw: &P) {
        match self.cmd.abort {
            AbortPhase::Idle => {
                #[cfg(feature = "defmt")]
                defmt::debug!("command ring stopped with no abort pending");
            }
            AbortPhase::WaitCrrClear { .. } | AbortPhase::WaitRingStopped { .. } => {
                self.handle_stopped_cmd_ring(hw);
            }
        }
    }

    /// Give back every queued command with Command Aborted
    pub(crate) fn cleanup_command_queue(&mut self) {
        self.cmd.timer = None;
        self.cmd.abort = AbortPhase::Idle;
        while let Some(cmd) = self.cmd.queue.pop_front() {
            let slot_id = cmd.trb.slot_id();
            self.complete_command(&cmd, CompletionCode::CommandAborted, slot_id, 0);
        }
    }

    /// Advance the command timer and abort state machine to `now`
    pub(crate) fn poll_command_timer<P: Platform>(&mut self, hw: &P, now: u64) {
        match self.cmd.abort {
            AbortPhase::WaitCrrClear { deadline } => {
                let crcr = Crcr::from_bits_retain(self.regs.crcr(hw));
                if !crcr.contains(Crcr::RUNNING) {
                    let deadline = now + u64::from(self.config.ring_stopped_timeout_ms);
                    self.cmd.abort = AbortPhase::WaitRingStopped { deadline };
                    hw.arm(deadline);
                } else if now >= deadline {
                    #[cfg(feature = "defmt")]
                    defmt::error!("command ring abort timed out, host controller dead");
                    self.recovery.record(CompletionCode::CommandAborted, RecoveryAction::HostDied);
                    self.halt(hw);
                    self.hc_died(hw);
                }
                return;
            }
            AbortPhase::WaitRingStopped { deadline } => {
                if now >= deadline {
                    #[cfg(feature = "defmt")]
                    defmt::warn!("no command ring stopped event, aborting all commands");
                    self.cleanup_command_queue();
                    self.cmd.state = CmdRingState::Stopped;
                }
                return;
            }
            AbortPhase::Idle => {}
        }

        match self.cmd.timer {
            Some(deadline) if now >= deadline => self.command_timeout(hw, now),
            _ => {}
        }
    }

    fn command_timeout<P: Platform>(&mut self, hw: &P, now: u64) {
        self.cmd.timer = None;
        let Some(head_trb) = self.cmd.queue.front().map(|c| c.trb) else {
            return;
        };
        self.cmd.timeouts += 1;

        if let CommandTrb::StopEndpoint { slot_id, ep_index, .. } = head_trb {
            #[cfg(feature = "defmt")]
            defmt::error!("stop endpoint command timed out, host controller dead");
            if let Some(ep) = self.slots.ep_mut(slot_id, ep_index) {
                ep.ep_state.remove(EpState::STOP_CMD_PENDING);
            }
            self.recovery.record(CompletionCode::CommandAborted, RecoveryAction::HostDied);
            self.halt(hw);
            self.hc_died(hw);
            return;
        }

        if let Some(head) = self.cmd.queue.front_mut() {
            head.status = CommandStatus::Aborted;
        }
        let raw = self.regs.crcr(hw);
        if raw == u64::MAX {
            #[cfg(feature = "defmt")]
            defmt::error!("command timeout on a removed controller");
            self.hc_died(hw);
            return;
        }
        let crcr = Crcr::from_bits_retain(raw);
        if self.cmd.state == CmdRingState::Running && crcr.contains(Crcr::RUNNING) {
            #[cfg(feature = "defmt")]
            defmt::warn!("command timed out, aborting command ring");
            self.cmd.state = CmdRingState::Aborted;
            self.abort_cmd_ring(hw, now);
            return;
        }
        #[cfg(feature = "defmt")]
        defmt::warn!("command timed out on a stopped ring");
        self.handle_stopped_cmd_ring(hw);
    }

    /// Write CA with the dequeue pointer of the command after the current one.
    ///
    /// All 64 bits are written; some controllers ignore a low-dword-only abort.
    fn abort_cmd_ring<P: Platform>(&mut self, hw: &P, now: u64) {
        let next = self.cmd.ring.cursor_after(self.cmd.ring.dequeue());
        let value = self.cmd.crcr_for(next) | Crcr::ABORT.bits();
        self.regs.write_crcr(hw, value);

        let crcr = Crcr::from_bits_retain(self.regs.crcr(hw));
        let deadline = if crcr.contains(Crcr::RUNNING) {
            let deadline = now + u64::from(self.config.abort_timeout_ms);
            self.cmd.abort = AbortPhase::WaitCrrClear { deadline };
            deadline
        } else {
            let deadline = now + u64::from(self.config.ring_stopped_timeout_ms);
            self.cmd.abort = AbortPhase::WaitRingStopped { deadline };
            deadline
        };
        hw.arm(deadline);
    }

    /// Clear Run/Stop; the controller stops processing all rings
    pub(crate) fn halt<P: Platform>(&mut self, hw: &P) {
        self.regs.modify_usbcmd(hw, |cmd| cmd - UsbCmd::RUN - UsbCmd::INT_ENABLE);
        self.hc.insert(HcState::HALTED);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::RingType;
    use crate::test_util::HeapDma;

    #[test]
    fn test_crcr_value_carries_cycle() {
        let dma = HeapDma::new();
        let ring = Ring::new(&dma, RingType::Command, 1, 0, false).unwrap();
        let cmd = CommandRing::new(ring);
        let c = cmd.ring.enqueue();
        let value = cmd.crcr_for(c);
        assert_eq!(value & CRCR_PTR_MASK, cmd.ring.trb_virt_to_dma(c));
        assert_eq!(value & 1, 1);
        assert_eq!(cmd.state(), CmdRingState::Running);
        cmd.ring.free(&dma);
    }

    #[test]
    fn test_command_ids_skip_zero() {
        let dma = HeapDma::new();
        let ring = Ring::new(&dma, RingType::Command, 1, 0, false).unwrap();
        let mut cmd = CommandRing::new(ring);
        cmd.next_id = u32::MAX;
        assert_eq!(cmd.alloc_id(), CommandId(u32::MAX));
        assert_eq!(cmd.alloc_id(), CommandId(1));
        cmd.ring.free(&dma);
    }
}
