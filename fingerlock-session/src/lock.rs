//! Lock decision policy and the write gate
//!
//! While a lock write is in flight, and for a settle window after the lock
//! acknowledges it, fingerprint notifications are discarded. The lock
//! hardware echoes its own state change back through the sensor, and the
//! window swallows that bounce.

use fingerlock_proto::LockCommand;

use crate::classifier::ClassLabel;
use crate::error::LockError;
use crate::sink::Verdict;

/// Class the model uses for a rejected fingerprint
pub const REJECT_LABEL: ClassLabel = 2;

/// Identifies one pending delayed close; a stale ticket closes nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateTicket(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Closed,
    /// Writes issued and not yet acknowledged; never zero
    InFlight(u32),
    /// Acknowledged, waiting for the delayed close
    Settling(GateTicket),
}

#[derive(Debug)]
pub struct LockController {
    gate: Gate,
    next_ticket: u64,
}

impl Default for LockController {
    fn default() -> Self {
        Self::new()
    }
}

impl LockController {
    pub fn new() -> Self {
        Self {
            gate: Gate::Closed,
            next_ticket: 0,
        }
    }

    /// Label 2 locks, everything else unlocks
    pub fn decide(label: ClassLabel) -> LockCommand {
        if label == REJECT_LABEL {
            LockCommand::Close
        } else {
            LockCommand::Open
        }
    }

    pub fn verdict(command: LockCommand) -> Verdict {
        Verdict::for_command(command)
    }

    /// True while a write is in flight or settling
    pub fn is_gate_open(&self) -> bool {
        self.gate != Gate::Closed
    }

    /// Open the gate for a classified decision. Returns the byte to write.
    pub fn request_write(&mut self, command: LockCommand) -> Result<u8, LockError> {
        if self.is_gate_open() {
            return Err(LockError::WriteInFlight);
        }
        self.gate = Gate::InFlight(1);
        Ok(command.to_byte())
    }

    /// Manual override: write even if a previous write is still in flight or settling
    pub fn force_write(&mut self, command: LockCommand) -> u8 {
        self.gate = match self.gate {
            Gate::InFlight(pending) => Gate::InFlight(pending + 1),
            Gate::Closed | Gate::Settling(_) => Gate::InFlight(1),
        };
        command.to_byte()
    }

    /// The gate stays open; the caller closes it later with [`settle`](Self::settle).
    /// Only the acknowledgment of the last outstanding write yields a ticket.
    pub fn on_write_acknowledged(&mut self) -> Option<GateTicket> {
        match self.gate {
            Gate::InFlight(1) => {
                self.next_ticket += 1;
                let ticket = GateTicket(self.next_ticket);
                self.gate = Gate::Settling(ticket);
                Some(ticket)
            }
            Gate::InFlight(pending) => {
                self.gate = Gate::InFlight(pending - 1);
                None
            }
            Gate::Closed | Gate::Settling(_) => None,
        }
    }

    /// Closes the gate unless another write is still waiting for its acknowledgment
    pub fn on_write_failed(&mut self) {
        self.gate = match self.gate {
            Gate::InFlight(pending) if pending > 1 => Gate::InFlight(pending - 1),
            _ => Gate::Closed,
        };
    }

    /// Close the gate if `ticket` is still the pending one. Returns whether it closed.
    pub fn settle(&mut self, ticket: GateTicket) -> bool {
        if self.gate == Gate::Settling(ticket) {
            self.gate = Gate::Closed;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.gate = Gate::Closed;
    }
}
