#![forbid(unsafe_code)]

//! Lifecycle of one half-stream: Idle → Opening → Open → Closing → Closed, with Aborted
//! reachable from any live state. Closed and Aborted are terminal.
//!
//! Transitions are pure functions returning the next state or the [`Violation`] the frame
//! represents; the session decides what to emit.

use std::fmt;

use crate::errors::Violation;

/// Half-stream logical state.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum HalfState {
    #[default]
    Idle,
    /// Open sent or received, no window granted yet.
    Opening,
    Open,
    /// Close sent or received, still draining.
    Closing,
    Closed,
    Aborted,
}

impl HalfState {
    pub fn is_terminal(self) -> bool {
        matches!(self, HalfState::Closed | HalfState::Aborted)
    }

    pub fn is_live(self) -> bool {
        !self.is_terminal() && self != HalfState::Idle
    }

    /// Data may flow (window has been granted and the sender has not closed).
    pub fn is_open(self) -> bool {
        self == HalfState::Open
    }

    fn reject(self) -> Violation {
        if self.is_terminal() {
            Violation::FrameAfterTerminal
        } else {
            Violation::UnexpectedFrame
        }
    }

    /// Open sent or received.
    pub fn on_open(self) -> Result<Self, Violation> {
        match self {
            HalfState::Idle => Ok(HalfState::Opening),
            s => Err(s.reject()),
        }
    }

    /// Window granted. The first grant opens the half-stream; grants keep arriving while the
    /// sender drains after Close.
    pub fn on_credit(self) -> Result<Self, Violation> {
        match self {
            HalfState::Opening => Ok(HalfState::Open),
            HalfState::Open | HalfState::Closing => Ok(self),
            s => Err(s.reject()),
        }
    }

    /// Data or Flush received or sent.
    pub fn on_data(self) -> Result<Self, Violation> {
        match self {
            HalfState::Open => Ok(self),
            s => Err(s.reject()),
        }
    }

    /// Close sent or received.
    pub fn on_close(self) -> Result<Self, Violation> {
        match self {
            HalfState::Opening | HalfState::Open => Ok(HalfState::Closing),
            s => Err(s.reject()),
        }
    }

    /// Final drain complete.
    pub fn on_drained(self) -> Self {
        match self {
            HalfState::Closing => HalfState::Closed,
            s => s,
        }
    }

    /// Abort or Reset. Terminal states are left untouched.
    pub fn on_abort(self) -> Self {
        if self.is_terminal() {
            self
        } else {
            HalfState::Aborted
        }
    }
}

impl fmt::Display for HalfState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HalfState::Idle => "IDLE",
            HalfState::Opening => "OPENING",
            HalfState::Open => "OPEN",
            HalfState::Closing => "CLOSING",
            HalfState::Closed => "CLOSED",
            HalfState::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}
