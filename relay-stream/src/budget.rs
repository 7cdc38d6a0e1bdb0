#![forbid(unsafe_code)]

//! Sequence/acknowledge/window accounting for one half-stream, plus the owner-arbitrated
//! budget pools a session uses when several half-streams draw from one window.
//!
//! The same [`Budget`] is used from both ends of a half-stream. When the session receives on a
//! half-stream it validates the sender's frames (`on_received_*`) and grants window with
//! [`Budget::grant`]. When the session sends it debits with [`Budget::on_sent`] and absorbs the
//! peer's Credit and Reset frames.

use std::collections::HashMap;

use tracing::trace;

use crate::errors::Violation;
use crate::frame::FrameHeader;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Budget {
    sequence: u64,
    acknowledge: u64,
    maximum: u32,
    padding: u32,
    budget_id: u64,
    /// Highest acknowledge the sender has echoed back in its own frames.
    echoed: u64,
}

impl Budget {
    pub fn new(sequence: u64, acknowledge: u64, maximum: u32) -> Self {
        Self { sequence, acknowledge, maximum, padding: 0, budget_id: 0, echoed: acknowledge }
    }

    /// Starting point taken from an Open frame's header. The announced maximum belongs to the
    /// sender, so the window starts closed until the receiver grants one.
    pub fn from_header(header: &FrameHeader) -> Self {
        Self::new(header.sequence, header.acknowledge.min(header.sequence), 0)
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn acknowledge(&self) -> u64 {
        self.acknowledge
    }

    pub fn maximum(&self) -> u32 {
        self.maximum
    }

    pub fn padding(&self) -> u32 {
        self.padding
    }

    pub fn budget_id(&self) -> u64 {
        self.budget_id
    }

    pub fn set_budget_id(&mut self, budget_id: u64) {
        self.budget_id = budget_id;
    }

    /// Units the sender may transmit right now.
    pub fn available(&self) -> u64 {
        self.limit().saturating_sub(self.sequence)
    }

    /// Highest sequence the granted window reaches.
    fn limit(&self) -> u64 {
        self.acknowledge.saturating_add(self.maximum as u64)
    }

    /// Units sent but not yet acknowledged.
    pub fn outstanding(&self) -> u64 {
        self.sequence - self.acknowledge
    }

    pub fn can_send(&self, reserved: u32) -> bool {
        reserved as u64 <= self.available()
    }

    /// Debit `reserved` units for an outbound frame. Returns the sequence the frame carries.
    pub fn on_sent(&mut self, reserved: u32) -> Result<u64, Violation> {
        if !self.can_send(reserved) {
            return Err(Violation::WindowExceeded { reserved, available: self.available() });
        }
        let sequence = self.sequence;
        self.sequence += reserved as u64;
        Ok(sequence)
    }

    /// Validate the accounting fields every sender-originated frame carries.
    fn check_sender(&self, header: &FrameHeader) -> Result<(), Violation> {
        if header.acknowledge > header.sequence {
            return Err(Violation::AcknowledgeExceedsSequence {
                acknowledge: header.acknowledge,
                sequence: header.sequence,
            });
        }
        if header.sequence < self.sequence {
            return Err(Violation::SequenceRegressed {
                sequence: header.sequence,
                recorded: self.sequence,
            });
        }
        if header.acknowledge < self.echoed {
            return Err(Violation::StaleAcknowledge {
                acknowledge: header.acknowledge,
                recorded: self.echoed,
            });
        }
        if header.acknowledge > self.acknowledge {
            return Err(Violation::AcknowledgeNotGranted {
                acknowledge: header.acknowledge,
                granted: self.acknowledge,
            });
        }
        Ok(())
    }

    /// Sequence after a frame reserving `reserved` units, checked against the sequence space.
    fn end_of(&self, header: &FrameHeader, reserved: u32) -> Result<u64, Violation> {
        header.sequence.checked_add(reserved as u64).ok_or(Violation::WindowExceeded {
            reserved,
            available: self.limit().saturating_sub(header.sequence),
        })
    }

    fn absorb(&mut self, header: &FrameHeader, end: u64) {
        self.echoed = header.acknowledge;
        self.sequence = end;
    }

    /// Inbound Data or Flush on a half-stream the session receives on.
    pub fn on_received_data(
        &mut self,
        header: &FrameHeader,
        reserved: u32,
        length: usize,
    ) -> Result<(), Violation> {
        self.check_sender(header)?;
        if (reserved as usize) < length {
            return Err(Violation::ReservedTooSmall { reserved, length });
        }
        let limit = self.limit();
        let end = self.end_of(header, reserved)?;
        if end > limit {
            return Err(Violation::WindowExceeded {
                reserved,
                available: limit.saturating_sub(header.sequence),
            });
        }
        self.absorb(header, end);
        trace!("received seq={} ack={} max={}", self.sequence, self.acknowledge, self.maximum);
        Ok(())
    }

    /// Inbound Data accepted before any window was granted. The caller bounds the total by
    /// other means.
    pub fn on_received_eager(
        &mut self,
        header: &FrameHeader,
        reserved: u32,
        length: usize,
    ) -> Result<(), Violation> {
        self.check_sender(header)?;
        if (reserved as usize) < length {
            return Err(Violation::ReservedTooSmall { reserved, length });
        }
        let end = self.end_of(header, reserved)?;
        self.absorb(header, end);
        Ok(())
    }

    /// Inbound Close or Abort.
    pub fn on_received_end(&mut self, header: &FrameHeader) -> Result<(), Violation> {
        self.check_sender(header)?;
        self.absorb(header, header.sequence);
        Ok(())
    }

    fn check_receiver(&self, header: &FrameHeader) -> Result<(), Violation> {
        if header.acknowledge > header.sequence || header.acknowledge > self.sequence {
            return Err(Violation::AcknowledgeExceedsSequence {
                acknowledge: header.acknowledge,
                sequence: header.sequence.min(self.sequence),
            });
        }
        if header.acknowledge < self.acknowledge {
            return Err(Violation::StaleAcknowledge {
                acknowledge: header.acknowledge,
                recorded: self.acknowledge,
            });
        }
        Ok(())
    }

    /// Inbound Credit on a half-stream the session sends on. Returns whether the window moved.
    pub fn on_received_credit(
        &mut self,
        header: &FrameHeader,
        padding: u32,
    ) -> Result<bool, Violation> {
        self.check_receiver(header)?;
        if header.maximum < self.maximum {
            return Err(Violation::WindowShrunk { maximum: header.maximum, recorded: self.maximum });
        }
        let changed = header.acknowledge != self.acknowledge || header.maximum != self.maximum;
        self.acknowledge = header.acknowledge;
        self.maximum = header.maximum;
        self.padding = padding;
        Ok(changed)
    }

    /// Inbound Reset on a half-stream the session sends on.
    pub fn on_received_reset(&mut self, header: &FrameHeader) -> Result<(), Violation> {
        self.check_receiver(header)?;
        self.acknowledge = header.acknowledge;
        Ok(())
    }

    /// Grant window to the sender. Acknowledge never passes the received sequence and neither
    /// field moves backwards. Returns whether anything changed.
    pub fn grant(&mut self, acknowledge: u64, maximum: u32) -> bool {
        let acknowledge = acknowledge.max(self.acknowledge).min(self.sequence);
        let maximum = maximum.max(self.maximum);
        let changed = acknowledge != self.acknowledge || maximum != self.maximum;
        self.acknowledge = acknowledge;
        self.maximum = maximum;
        changed
    }

    /// Stamp this half-stream's accounting onto an outbound header.
    pub fn stamp(&self, header: FrameHeader) -> FrameHeader {
        header.with_budget(self.sequence, self.acknowledge, self.maximum)
    }
}

/// A named allowance shared by several consumers. The owner refreshes the allowance and decides
/// the order of claims; the pool only refuses to grant more than it holds.
#[derive(Debug, Clone, Default)]
pub struct BudgetPool {
    budget_id: u64,
    available: u64,
    granted: HashMap<u64, u64>,
}

impl BudgetPool {
    pub fn new(budget_id: u64) -> Self {
        Self { budget_id, ..Default::default() }
    }

    pub fn budget_id(&self) -> u64 {
        self.budget_id
    }

    /// Start a new arbitration round with `available` units.
    pub fn set_available(&mut self, available: u64) {
        self.available = available;
        self.granted.clear();
    }

    pub fn available(&self) -> u64 {
        self.available
    }

    /// Claim up to `maximum` units. Grants `maximum` when the pool holds it, otherwise whatever
    /// remains provided that is at least `minimum`, otherwise nothing.
    pub fn claim(&mut self, consumer: u64, minimum: u64, maximum: u64) -> u64 {
        let claimed = if self.available >= maximum {
            maximum
        } else if self.available >= minimum.max(1) {
            self.available
        } else {
            0
        };
        self.available -= claimed;
        if claimed > 0 {
            *self.granted.entry(consumer).or_default() += claimed;
        }
        claimed
    }

    /// Units granted to `consumer` since the last [`BudgetPool::set_available`].
    pub fn granted(&self, consumer: u64) -> u64 {
        self.granted.get(&consumer).copied().unwrap_or(0)
    }
}
