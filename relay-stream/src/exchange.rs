#![forbid(unsafe_code)]

//! Exchanges and the arena a session keeps them in.
//!
//! Exchanges are stored in a `Vec` owned by one session and addressed by index; a map from
//! stream id to [`StreamRef`] resolves inbound frames. Index [`FRONTEND`] is always the
//! exchange the session was created for.

use std::collections::HashMap;

use bytes::Bytes;
use tracing::debug;

use crate::budget::Budget;
use crate::frame::{ExchangeId, FrameHeader};
use crate::pool::Slot;
use crate::state::HalfState;

/// Arena index of the frontend exchange.
pub const FRONTEND: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HalfKind {
    /// Caller to callee.
    Initial,
    /// Callee to caller.
    Reply,
}

/// One direction of one exchange.
#[derive(Debug)]
pub struct HalfStream {
    pub stream_id: u64,
    pub state: HalfState,
    pub budget: Budget,
    /// Partial unit, or a complete eager unit waiting for the half-stream to open.
    pub slot: Option<Slot>,
    /// Extension of the unit being reassembled.
    pub unit_extension: Bytes,
    /// Sequence up to which received input has been relayed.
    pub consumed: u64,
    /// Slot holds a complete unit received before any window was granted.
    pub eager_ready: bool,
}

impl HalfStream {
    pub fn new(stream_id: u64) -> Self {
        Self {
            stream_id,
            state: HalfState::Idle,
            budget: Budget::default(),
            slot: None,
            unit_extension: Bytes::new(),
            consumed: 0,
            eager_ready: false,
        }
    }

    pub fn set_state(&mut self, next: HalfState) {
        if next != self.state {
            debug!("stream {} {} -> {}", self.stream_id, self.state, next);
            self.state = next;
        }
    }

    /// Adopt the accounting announced by an Open frame.
    pub fn open_with(&mut self, header: &FrameHeader) {
        self.budget = Budget::from_header(header);
        self.consumed = self.budget.acknowledge();
    }

    /// A unit is being reassembled.
    pub fn in_unit(&self) -> bool {
        self.slot.is_some() && !self.eager_ready
    }

    /// Window promised to the sender beyond what has been relayed.
    pub fn committed(&self) -> u64 {
        let limit = self.budget.acknowledge().saturating_add(self.budget.maximum() as u64);
        limit.saturating_sub(self.consumed)
    }

    pub fn release_slot(&mut self) {
        if let Some(mut slot) = self.slot.take() {
            slot.release();
        }
        self.eager_ready = false;
        self.unit_extension = Bytes::new();
    }

    /// Force the half-stream terminal. Returns the state it was in.
    pub fn abort(&mut self) -> HalfState {
        let previous = self.state;
        self.set_state(previous.on_abort());
        self.release_slot();
        previous
    }
}

/// Initial and reply half-streams sharing one identity.
#[derive(Debug)]
pub struct Exchange {
    pub origin_id: u64,
    pub routed_id: u64,
    pub affinity: u64,
    pub initial: HalfStream,
    pub reply: HalfStream,
}

impl Exchange {
    pub fn new(origin_id: u64, routed_id: u64, initial_id: u64, reply_id: u64) -> Self {
        Self {
            origin_id,
            routed_id,
            affinity: 0,
            initial: HalfStream::new(initial_id),
            reply: HalfStream::new(reply_id),
        }
    }

    pub fn id(&self) -> ExchangeId {
        ExchangeId {
            origin_id: self.origin_id,
            routed_id: self.routed_id,
            stream_id: self.initial.stream_id,
        }
    }

    pub fn half(&self, kind: HalfKind) -> &HalfStream {
        match kind {
            HalfKind::Initial => &self.initial,
            HalfKind::Reply => &self.reply,
        }
    }

    pub fn half_mut(&mut self, kind: HalfKind) -> &mut HalfStream {
        match kind {
            HalfKind::Initial => &mut self.initial,
            HalfKind::Reply => &mut self.reply,
        }
    }

    /// Header addressed to one half-stream, without accounting fields.
    pub fn header(&self, kind: HalfKind) -> FrameHeader {
        FrameHeader::new(self.origin_id, self.routed_id, self.half(kind).stream_id)
    }

    /// Both half-streams terminal and no slot still leased.
    pub fn is_terminated(&self) -> bool {
        self.initial.state.is_terminal()
            && self.reply.state.is_terminal()
            && self.initial.slot.is_none()
            && self.reply.slot.is_none()
    }
}

/// Location of a half-stream inside an [`ExchangeTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamRef {
    pub exchange: usize,
    pub half: HalfKind,
}

impl StreamRef {
    pub const fn new(exchange: usize, half: HalfKind) -> Self {
        Self { exchange, half }
    }

    pub fn is_frontend(&self) -> bool {
        self.exchange == FRONTEND
    }

    /// The session receives on frontend initial and backend reply half-streams.
    pub fn session_receives(&self) -> bool {
        self.is_frontend() == (self.half == HalfKind::Initial)
    }
}

#[derive(Debug, Default)]
pub struct ExchangeTable {
    exchanges: Vec<Exchange>,
    index: HashMap<u64, StreamRef>,
}

impl ExchangeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, exchange: Exchange) -> usize {
        let slot = self.exchanges.len();
        self.index.insert(exchange.initial.stream_id, StreamRef::new(slot, HalfKind::Initial));
        self.index.insert(exchange.reply.stream_id, StreamRef::new(slot, HalfKind::Reply));
        self.exchanges.push(exchange);
        slot
    }

    pub fn locate(&self, stream_id: u64) -> Option<StreamRef> {
        self.index.get(&stream_id).copied()
    }

    pub fn get(&self, index: usize) -> Option<&Exchange> {
        self.exchanges.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Exchange> {
        self.exchanges.get_mut(index)
    }

    pub fn half(&self, r: StreamRef) -> &HalfStream {
        self.exchanges[r.exchange].half(r.half)
    }

    pub fn half_mut(&mut self, r: StreamRef) -> &mut HalfStream {
        self.exchanges[r.exchange].half_mut(r.half)
    }

    pub fn exchange(&self, index: usize) -> &Exchange {
        &self.exchanges[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Exchange> {
        self.exchanges.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Exchange> {
        self.exchanges.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty()
    }

    pub fn stream_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.index.keys().copied()
    }
}
