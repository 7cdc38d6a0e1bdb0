#![forbid(unsafe_code)]

//! Proxy session: the bridge between one frontend exchange and the backend exchanges its route
//! resolves to.
//!
//! A session relays two flows. The *initial* flow carries units from the frontend initial
//! half-stream to every backend initial half-stream; the *reply* flow carries units from the
//! backend reply half-streams into the frontend reply half-stream. Each flow works the same way:
//!
//! 1. Data fragments are validated against the source's [`Budget`](crate::budget::Budget) and
//!    reassembled in a pool [`Slot`](crate::pool::Slot) until the final fragment arrives.
//! 2. The complete unit is translated by the [`BindingAdapter`] and queued.
//! 3. Queued units are sent, whole, once every target has window for them. Units that do not fit
//!    are held (bounded by [`SessionSettings::max_held_bytes`]).
//! 4. Sources are granted credit from what the targets can still absorb. Several sources sharing
//!    one target draw from a [`BudgetPool`] the session arbitrates.
//!
//! Frames are handled to completion one at a time; nothing here blocks or locks. Every fault is
//! reported to the [`FaultObserver`] and tears the whole session down with Abort/Reset frames.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use relay_core::SessionConfig;
use tracing::{debug, trace};

use crate::binding::{BindingAdapter, Flow, OpenMeta, RouteResolver, Unit};
use crate::budget::BudgetPool;
use crate::dispatch::{Dispatch, DispatchStatus};
use crate::errors::{Resource, StreamError, StreamResult, TranslationError, Violation};
use crate::exchange::{Exchange, ExchangeTable, HalfKind, StreamRef, FRONTEND};
use crate::frame::{DataFlags, Frame, FrameBody, FrameHeader, FrameKind};
use crate::ids::IdGenerator;
use crate::observer::{FaultObserver, FaultReport};
use crate::pool::{BufferPool, PoolError};
use crate::state::HalfState;

/// Per-session flow limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// Translated bytes a flow may hold while its targets lack window.
    pub max_held_bytes: usize,
    /// Largest window granted to any sender.
    pub max_window: u32,
}

impl SessionSettings {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self { max_held_bytes: config.max_held_bytes, max_window: config.max_window }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

/// Collaborators handed to every session at construction.
#[derive(Clone)]
pub struct ProxyContext {
    pub resolver: Arc<dyn RouteResolver>,
    pub ids: Arc<dyn IdGenerator>,
    pub adapter: Arc<dyn BindingAdapter>,
    /// Frames addressed to the frontend exchange.
    pub frontend: Arc<dyn Dispatch>,
    /// Frames addressed to backend exchanges.
    pub backend: Arc<dyn Dispatch>,
    pub pool: BufferPool,
    pub observer: Arc<dyn FaultObserver>,
    pub settings: SessionSettings,
}

/// Which dispatch a frame leaves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Frontend,
    Backend,
}

impl Side {
    fn of(r: StreamRef) -> Self {
        if r.is_frontend() {
            Side::Frontend
        } else {
            Side::Backend
        }
    }

    const fn index(self) -> usize {
        match self {
            Side::Frontend => 0,
            Side::Backend => 1,
        }
    }
}

/// A translated item waiting for target window.
#[derive(Debug)]
enum Pending {
    Data { unit: Unit, length: u32, source: usize, end: u64 },
    Flush { extension: Bytes, source: usize, end: u64 },
}

impl Pending {
    fn length(&self) -> u32 {
        match self {
            Pending::Data { length, .. } => *length,
            Pending::Flush { .. } => 0,
        }
    }

    fn held(&self) -> usize {
        self.length() as usize
    }

    fn source(&self) -> usize {
        match self {
            Pending::Data { source, .. } | Pending::Flush { source, .. } => *source,
        }
    }

    /// Source sequence fully relayed once this item is sent.
    fn end(&self) -> u64 {
        match self {
            Pending::Data { end, .. } | Pending::Flush { end, .. } => *end,
        }
    }
}

#[derive(Debug)]
struct FlowQueue {
    items: VecDeque<Pending>,
    held_bytes: usize,
    pool: BudgetPool,
    rotation: usize,
}

impl FlowQueue {
    fn new(budget_id: u64) -> Self {
        Self {
            items: VecDeque::new(),
            held_bytes: 0,
            pool: BudgetPool::new(budget_id),
            rotation: 0,
        }
    }

    fn push(&mut self, pending: Pending) {
        self.held_bytes += pending.held();
        self.items.push_back(pending);
    }

    fn pop(&mut self) -> Option<Pending> {
        let pending = self.items.pop_front()?;
        self.held_bytes -= pending.held();
        Some(pending)
    }

    fn holds_from(&self, source: usize) -> bool {
        self.items.iter().any(|p| p.source() == source)
    }

    fn clear(&mut self) {
        self.items.clear();
        self.held_bytes = 0;
    }
}

const fn flow_of(half: HalfKind) -> Flow {
    match half {
        HalfKind::Initial => Flow::Initial,
        HalfKind::Reply => Flow::Reply,
    }
}

const fn half_of(flow: Flow) -> HalfKind {
    match flow {
        Flow::Initial => HalfKind::Initial,
        Flow::Reply => HalfKind::Reply,
    }
}

/// Side that receives the relayed units of a flow.
const fn target_side(flow: Flow) -> Side {
    match flow {
        Flow::Initial => Side::Backend,
        Flow::Reply => Side::Frontend,
    }
}

/// Side that receives the credit of a flow.
const fn source_side(flow: Flow) -> Side {
    match flow {
        Flow::Initial => Side::Frontend,
        Flow::Reply => Side::Backend,
    }
}

fn protocol(stream_id: u64, kind: FrameKind, violation: Violation) -> StreamError {
    StreamError::ProtocolFault { stream_id, kind, violation }
}

fn translation(stream_id: u64, err: TranslationError) -> StreamError {
    StreamError::Translation { stream_id, reason: err.0 }
}

fn exhausted(stream_id: u64, err: PoolError) -> StreamError {
    let resource = match err {
        PoolError::Exhausted { .. } => Resource::SlotsExhausted,
        PoolError::Overflow { capacity, offset, requested } => {
            Resource::SlotOverflow { capacity, offset, requested }
        }
    };
    StreamError::ResourceExhausted { stream_id, resource }
}

pub struct ProxySession {
    ctx: ProxyContext,
    table: ExchangeTable,
    route_id: u64,
    trace_id: u64,
    authorization: u64,
    initial: FlowQueue,
    reply: FlowQueue,
    stalled: [bool; 2],
}

impl ProxySession {
    /// Handle a frontend Open: resolve its route and open one backend exchange per target.
    ///
    /// On failure the frontend initial half-stream is Reset, the fault is reported and no
    /// session state survives.
    pub fn accept(ctx: ProxyContext, open: Frame) -> StreamResult<Self> {
        let span = relay_telemetry::create_span("accept", "proxy_session");
        let _enter = span.enter();

        let header = open.header;
        let kind = open.kind();
        ctx.observer.on_frame(kind, true);
        let FrameBody::Open { affinity, extension } = open.body else {
            let err = protocol(header.stream_id, kind, Violation::UnexpectedFrame);
            report(&ctx, &header, kind, err.clone());
            return Err(err);
        };

        let meta = OpenMeta { header: &header, affinity, extension: &extension };
        let route = ctx
            .resolver
            .resolve(header.authorization, &meta)
            .filter(|r| !r.targets.is_empty());
        let Some(route) = route else {
            let err = StreamError::RouteResolution { stream_id: header.stream_id };
            return Err(reject(&ctx, &header, err));
        };
        let translated = match ctx.adapter.translate_open(Flow::Initial, &extension) {
            Ok(ext) => ext,
            Err(e) => return Err(reject(&ctx, &header, translation(header.stream_id, e))),
        };

        let mut table = ExchangeTable::new();
        let reply_id = ctx.ids.reply_id(header.stream_id);
        let mut frontend =
            Exchange::new(header.origin_id, header.routed_id, header.stream_id, reply_id);
        frontend.affinity = affinity;
        frontend.initial.open_with(&header);
        frontend.initial.set_state(HalfState::Opening);
        table.insert(frontend);

        let budget_id = header.stream_id;
        let mut session = Self {
            ctx,
            table,
            route_id: route.id,
            trace_id: header.trace_id,
            authorization: header.authorization,
            initial: FlowQueue::new(budget_id),
            reply: FlowQueue::new(budget_id),
            stalled: [false; 2],
        };

        for target in &route.targets {
            let initial_id = session.ctx.ids.next_initial_id(target.routed_id);
            let reply_id = session.ctx.ids.reply_id(initial_id);
            let mut backend =
                Exchange::new(header.routed_id, target.routed_id, initial_id, reply_id);
            backend.affinity = target.affinity;
            // Starts at the frontend Open's position; the backend grants its own window.
            backend.initial.open_with(&header);
            backend.initial.set_state(HalfState::Opening);
            let r = StreamRef::new(session.table.insert(backend), HalfKind::Initial);
            let frame = Frame::open(session.stamped(r), target.affinity, translated.clone());
            session.emit(r, frame);
        }

        debug!(
            "session {} routed via {} to {} backend(s)",
            header.stream_id,
            session.route_id,
            route.targets.len()
        );
        Ok(session)
    }

    /// Handle one inbound frame addressed to any half-stream this session owns.
    pub fn on_frame(&mut self, frame: Frame) -> StreamResult<()> {
        let kind = frame.kind();
        let stream_id = frame.stream_id();
        self.ctx.observer.on_frame(kind, true);
        trace!("frame {} on stream {}", kind, stream_id);

        let Some(r) = self.table.locate(stream_id) else {
            return Err(StreamError::UnknownStream { stream_id, kind });
        };
        if kind == FrameKind::Signal {
            return self.on_signal(r, frame);
        }
        if self.table.half(r).state.is_terminal() {
            let err = protocol(stream_id, kind, Violation::FrameAfterTerminal);
            self.report(stream_id, kind, err.clone());
            return Err(err);
        }

        let result = if kind.is_forward() != r.session_receives() {
            Err(protocol(stream_id, kind, Violation::UnexpectedFrame))
        } else {
            match kind {
                FrameKind::Open => self.on_open(r, frame),
                FrameKind::Data => self.on_data(r, frame),
                FrameKind::Flush => self.on_flush(r, frame),
                FrameKind::Close => self.on_close(r, frame),
                FrameKind::Abort => self.on_abort(r, frame),
                FrameKind::Credit => self.on_credit(r, frame),
                FrameKind::Reset => self.on_reset(r, frame),
                FrameKind::Signal => Ok(()),
            }
        };
        result.map_err(|err| self.fail(stream_id, kind, err))
    }

    /// Resume a side whose dispatch reported backpressure.
    pub fn on_dispatch_ready(&mut self, side: Side) -> StreamResult<()> {
        if !self.stalled[side.index()] {
            return Ok(());
        }
        self.stalled[side.index()] = false;
        debug!("session {} {:?} dispatch ready", self.frontend().initial.stream_id, side);
        let stream_id = self.frontend().initial.stream_id;
        for flow in [Flow::Initial, Flow::Reply] {
            if let Err(err) = self.flush_flow(flow, stream_id) {
                return Err(self.fail(stream_id, FrameKind::Credit, err));
            }
        }
        Ok(())
    }

    /// Every half-stream is terminal, or idle with nothing left that could open it.
    pub fn is_terminated(&self) -> bool {
        let frontend = self.frontend();
        let settled = |state: HalfState| state.is_terminal() || state == HalfState::Idle;
        frontend.initial.state.is_terminal()
            && frontend.reply.state.is_terminal()
            && self.backends().all(|b| settled(b.initial.state) && settled(b.reply.state))
            && self.table.iter().all(|e| e.initial.slot.is_none() && e.reply.slot.is_none())
    }

    pub fn frontend(&self) -> &Exchange {
        self.table.exchange(FRONTEND)
    }

    pub fn backends(&self) -> impl Iterator<Item = &Exchange> {
        self.table.iter().skip(1)
    }

    pub fn route_id(&self) -> u64 {
        self.route_id
    }

    pub fn stream_ids(&self) -> Vec<u64> {
        self.table.stream_ids().collect()
    }

    pub fn state_of(&self, stream_id: u64) -> Option<HalfState> {
        self.table.locate(stream_id).map(|r| self.table.half(r).state)
    }

    /// Translated bytes held for `flow`.
    pub fn held_bytes(&self, flow: Flow) -> usize {
        self.queue(flow).held_bytes
    }

    pub fn is_stalled(&self, side: Side) -> bool {
        self.stalled[side.index()]
    }

    fn queue(&self, flow: Flow) -> &FlowQueue {
        match flow {
            Flow::Initial => &self.initial,
            Flow::Reply => &self.reply,
        }
    }

    fn queue_mut(&mut self, flow: Flow) -> &mut FlowQueue {
        match flow {
            Flow::Initial => &mut self.initial,
            Flow::Reply => &mut self.reply,
        }
    }

    fn backend_indices(&self) -> std::ops::Range<usize> {
        1..self.table.len()
    }

    /// Half-streams the session receives a flow's units on.
    fn sources(&self, flow: Flow) -> Vec<StreamRef> {
        match flow {
            Flow::Initial => vec![StreamRef::new(FRONTEND, HalfKind::Initial)],
            Flow::Reply => {
                self.backend_indices().map(|i| StreamRef::new(i, HalfKind::Reply)).collect()
            }
        }
    }

    /// Half-streams the session relays a flow's units into.
    fn targets(&self, flow: Flow) -> Vec<StreamRef> {
        match flow {
            Flow::Initial => {
                self.backend_indices().map(|i| StreamRef::new(i, HalfKind::Initial)).collect()
            }
            Flow::Reply => vec![StreamRef::new(FRONTEND, HalfKind::Reply)],
        }
    }

    /// Header addressed to `r` carrying its current accounting.
    fn stamped(&self, r: StreamRef) -> FrameHeader {
        let exchange = self.table.exchange(r.exchange);
        exchange
            .half(r.half)
            .budget
            .stamp(exchange.header(r.half))
            .with_trace(self.trace_id)
            .with_authorization(self.authorization)
    }

    fn emit(&mut self, r: StreamRef, frame: Frame) {
        trace!("emit {} on stream {}", frame.kind(), frame.stream_id());
        self.ctx.observer.on_frame(frame.kind(), false);
        let side = Side::of(r);
        let status = match side {
            Side::Frontend => self.ctx.frontend.emit(frame),
            Side::Backend => self.ctx.backend.emit(frame),
        };
        if status == DispatchStatus::Backpressured && !self.stalled[side.index()] {
            debug!("{:?} dispatch backpressured, withholding credit", side);
            self.stalled[side.index()] = true;
        }
    }

    fn report(&self, stream_id: u64, kind: FrameKind, error: StreamError) {
        let frontend = self.frontend();
        self.ctx.observer.on_fault(&FaultReport {
            origin_id: frontend.origin_id,
            routed_id: frontend.routed_id,
            stream_id,
            kind,
            error,
        });
    }

    /// Report a fault and abort every half-stream of the session.
    fn fail(&mut self, stream_id: u64, kind: FrameKind, err: StreamError) -> StreamError {
        self.report(stream_id, kind, err.clone());
        for index in 0..self.table.len() {
            self.abort_half(StreamRef::new(index, HalfKind::Initial));
            self.abort_half(StreamRef::new(index, HalfKind::Reply));
        }
        self.initial.clear();
        self.reply.clear();
        err
    }

    /// Terminate one half-stream: Reset where the session receives, Abort where it sends.
    /// Idle backend half-streams are retired silently; the frontend is always told.
    fn abort_half(&mut self, r: StreamRef) {
        let state = self.table.half(r).state;
        if state.is_terminal() {
            self.table.half_mut(r).release_slot();
            return;
        }
        if state != HalfState::Idle || r.is_frontend() {
            let header = self.stamped(r);
            let frame =
                if r.session_receives() { Frame::reset(header) } else { Frame::abort(header) };
            self.emit(r, frame);
        }
        self.table.half_mut(r).abort();
    }

    /// Once the frontend initial half-stream is gone, an unopened reply can no longer start.
    fn settle_unopened_replies(&mut self) {
        let frontend = self.frontend();
        if !frontend.initial.state.is_terminal() || frontend.reply.state != HalfState::Idle {
            return;
        }
        self.abort_half(StreamRef::new(FRONTEND, HalfKind::Reply));
        for index in self.backend_indices() {
            let r = StreamRef::new(index, HalfKind::Reply);
            if self.table.half(r).state == HalfState::Idle {
                self.table.half_mut(r).abort();
            }
        }
    }

    fn on_signal(&mut self, r: StreamRef, frame: Frame) -> StreamResult<()> {
        let stream_id = frame.stream_id();
        let FrameBody::Signal { signal_id, payload } = frame.body else {
            return Ok(());
        };
        if !self.table.half(r).state.is_live() {
            trace!("signal {} ignored on stream {}", signal_id, stream_id);
            return Ok(());
        }
        match self.ctx.adapter.on_signal(flow_of(r.half), signal_id, &payload) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(stream_id, FrameKind::Signal, translation(stream_id, e))),
        }
    }

    /// A backend opens its reply half-stream.
    fn on_open(&mut self, r: StreamRef, frame: Frame) -> StreamResult<()> {
        let stream_id = frame.stream_id();
        let header = frame.header;
        let FrameBody::Open { affinity, extension } = frame.body else {
            return Err(protocol(stream_id, FrameKind::Open, Violation::UnexpectedFrame));
        };
        let half = self.table.half_mut(r);
        let next = half.state.on_open().map_err(|v| protocol(stream_id, FrameKind::Open, v))?;
        half.open_with(&header);
        half.set_state(next);
        let translated =
            self.ctx
                .adapter
                .translate_open(Flow::Reply, &extension)
                .map_err(|e| translation(stream_id, e))?;

        let front = StreamRef::new(FRONTEND, HalfKind::Reply);
        let front_state = self.table.half(front).state;
        if front_state == HalfState::Idle {
            let half = self.table.half_mut(front);
            half.open_with(&header);
            half.set_state(HalfState::Opening);
            let open = Frame::open(self.stamped(front), affinity, translated);
            self.emit(front, open);
        } else if front_state.is_terminal() {
            debug!("reply {} opened after frontend reply ended", stream_id);
            self.abort_half(r);
            return Ok(());
        }
        self.flush_flow(Flow::Reply, stream_id)
    }

    fn on_data(&mut self, r: StreamRef, frame: Frame) -> StreamResult<()> {
        let stream_id = frame.stream_id();
        let header = frame.header;
        let FrameBody::Data { flags, reserved, payload, extension, .. } = frame.body else {
            return Err(protocol(stream_id, FrameKind::Data, Violation::UnexpectedFrame));
        };
        let eager = self.table.half(r).state == HalfState::Opening
            && self.ctx.adapter.accepts_eager_data();
        let pool = self.ctx.pool.clone();
        let half = self.table.half_mut(r);

        let checked = if eager {
            half.budget.on_received_eager(&header, reserved, payload.len())
        } else {
            match half.state.on_data() {
                Ok(_) => half.budget.on_received_data(&header, reserved, payload.len()),
                Err(v) => Err(v),
            }
        };
        checked.map_err(|v| protocol(stream_id, FrameKind::Data, v))?;

        if half.eager_ready {
            let offset = half.slot.as_ref().map_or(0, |s| s.offset());
            let err = PoolError::Overflow {
                capacity: pool.slot_capacity(),
                offset,
                requested: payload.len(),
            };
            return Err(exhausted(stream_id, err));
        }

        let init = flags.contains(DataFlags::INIT);
        let fin = flags.contains(DataFlags::FIN);
        let in_unit = half.in_unit();
        if init && in_unit {
            return Err(protocol(stream_id, FrameKind::Data, Violation::UnexpectedInit));
        }
        if !init && !in_unit {
            return Err(protocol(stream_id, FrameKind::Data, Violation::MissingInit));
        }

        let unit = if init && fin && !eager {
            Unit::new(payload, extension)
        } else {
            if init {
                half.slot = Some(pool.acquire(stream_id).map_err(|e| exhausted(stream_id, e))?);
                half.unit_extension = extension;
            }
            let slot = half
                .slot
                .as_mut()
                .ok_or_else(|| protocol(stream_id, FrameKind::Data, Violation::MissingInit))?;
            slot.append(&payload).map_err(|e| exhausted(stream_id, e))?;
            if eager && fin {
                trace!("eager unit of {} bytes waits on stream {}", slot.offset(), stream_id);
                half.eager_ready = true;
                return Ok(());
            }
            if !fin {
                return self.flush_flow(flow_of(r.half), stream_id);
            }
            let payload = slot.take();
            let extension = std::mem::take(&mut half.unit_extension);
            half.release_slot();
            Unit::new(payload, extension)
        };

        let end = half.budget.sequence();
        let flow = flow_of(r.half);
        let translated = self
            .ctx
            .adapter
            .translate_payload(flow, unit)
            .map_err(|e| translation(stream_id, e))?;
        self.queue_unit(flow, translated, r.exchange, end, stream_id)?;
        self.flush_flow(flow, stream_id)
    }

    fn on_flush(&mut self, r: StreamRef, frame: Frame) -> StreamResult<()> {
        let stream_id = frame.stream_id();
        let header = frame.header;
        let FrameBody::Flush { reserved, extension, .. } = frame.body else {
            return Err(protocol(stream_id, FrameKind::Flush, Violation::UnexpectedFrame));
        };
        let half = self.table.half_mut(r);
        half.state.on_data().map_err(|v| protocol(stream_id, FrameKind::Flush, v))?;
        half.budget
            .on_received_data(&header, reserved, 0)
            .map_err(|v| protocol(stream_id, FrameKind::Flush, v))?;
        let end = half.budget.sequence();

        let flow = flow_of(r.half);
        let extension = self
            .ctx
            .adapter
            .translate_flush(flow, &extension)
            .map_err(|e| translation(stream_id, e))?;
        self.queue_mut(flow).push(Pending::Flush { extension, source: r.exchange, end });
        self.flush_flow(flow, stream_id)
    }

    fn on_close(&mut self, r: StreamRef, frame: Frame) -> StreamResult<()> {
        let stream_id = frame.stream_id();
        let half = self.table.half_mut(r);
        half.budget
            .on_received_end(&frame.header)
            .map_err(|v| protocol(stream_id, FrameKind::Close, v))?;
        if half.in_unit() {
            return Err(protocol(stream_id, FrameKind::Close, Violation::IncompleteUnit));
        }
        let next = half.state.on_close().map_err(|v| protocol(stream_id, FrameKind::Close, v))?;
        half.set_state(next);
        self.release_eager(r)?;
        self.flush_flow(flow_of(r.half), stream_id)
    }

    /// The sender of a half-stream the session receives on gave up.
    fn on_abort(&mut self, r: StreamRef, frame: Frame) -> StreamResult<()> {
        let stream_id = frame.stream_id();
        let half = self.table.half_mut(r);
        half.budget
            .on_received_end(&frame.header)
            .map_err(|v| protocol(stream_id, FrameKind::Abort, v))?;
        half.abort();

        let flow = flow_of(r.half);
        self.queue_mut(flow).clear();
        match flow {
            Flow::Initial => {
                for index in self.backend_indices() {
                    self.abort_half(StreamRef::new(index, HalfKind::Initial));
                }
                self.settle_unopened_replies();
            }
            Flow::Reply => {
                self.abort_half(StreamRef::new(FRONTEND, HalfKind::Reply));
                for index in self.backend_indices().filter(|&i| i != r.exchange) {
                    self.abort_half(StreamRef::new(index, HalfKind::Reply));
                }
            }
        }
        debug!("abort on stream {} propagated", stream_id);
        Ok(())
    }

    /// The receiver of a half-stream the session sends on rejected it.
    fn on_reset(&mut self, r: StreamRef, frame: Frame) -> StreamResult<()> {
        let stream_id = frame.stream_id();
        let half = self.table.half_mut(r);
        half.budget
            .on_received_reset(&frame.header)
            .map_err(|v| protocol(stream_id, FrameKind::Reset, v))?;
        half.abort();

        let flow = flow_of(r.half);
        self.queue_mut(flow).clear();
        match flow {
            Flow::Initial => {
                self.abort_half(StreamRef::new(FRONTEND, HalfKind::Initial));
                for index in self.backend_indices().filter(|&i| i != r.exchange) {
                    self.abort_half(StreamRef::new(index, HalfKind::Initial));
                }
                self.settle_unopened_replies();
            }
            Flow::Reply => {
                for index in self.backend_indices() {
                    self.abort_half(StreamRef::new(index, HalfKind::Reply));
                }
            }
        }
        debug!("reset on stream {} propagated", stream_id);
        Ok(())
    }

    fn on_credit(&mut self, r: StreamRef, frame: Frame) -> StreamResult<()> {
        let stream_id = frame.stream_id();
        let FrameBody::Credit { budget_id, padding } = frame.body else {
            return Err(protocol(stream_id, FrameKind::Credit, Violation::UnexpectedFrame));
        };
        let half = self.table.half_mut(r);
        let next = half.state.on_credit().map_err(|v| protocol(stream_id, FrameKind::Credit, v))?;
        half.budget
            .on_received_credit(&frame.header, padding)
            .map_err(|v| protocol(stream_id, FrameKind::Credit, v))?;
        half.budget.set_budget_id(budget_id);
        half.set_state(next);
        if next == HalfState::Closing && half.budget.outstanding() == 0 {
            half.set_state(next.on_drained());
        }
        self.flush_flow(flow_of(r.half), stream_id)
    }

    /// Queue a complete eager unit once its half-stream may relay.
    fn release_eager(&mut self, r: StreamRef) -> StreamResult<()> {
        let half = self.table.half_mut(r);
        if !half.eager_ready {
            return Ok(());
        }
        let payload = half.slot.as_mut().map(|s| s.take()).unwrap_or_default();
        let extension = std::mem::take(&mut half.unit_extension);
        half.release_slot();
        let end = half.budget.sequence();
        let stream_id = half.stream_id;

        let flow = flow_of(r.half);
        let unit = self
            .ctx
            .adapter
            .translate_payload(flow, Unit::new(payload, extension))
            .map_err(|e| translation(stream_id, e))?;
        self.queue_unit(flow, unit, r.exchange, end, stream_id)
    }

    /// Queue a translated unit. Its length must fit the frame's `reserved` field.
    fn queue_unit(
        &mut self,
        flow: Flow,
        unit: Unit,
        source: usize,
        end: u64,
        stream_id: u64,
    ) -> StreamResult<()> {
        let len = unit.payload.len();
        let length = u32::try_from(len).map_err(|_| StreamError::ResourceExhausted {
            stream_id,
            resource: Resource::UnitTooLarge { length: len },
        })?;
        self.queue_mut(flow).push(Pending::Data { unit, length, source, end });
        Ok(())
    }

    /// Relay what fits, finish pending closes and replenish credit until nothing moves.
    fn flush_flow(&mut self, flow: Flow, stream_id: u64) -> StreamResult<()> {
        loop {
            self.drain(flow)?;
            let limit = self.ctx.settings.max_held_bytes;
            if self.queue(flow).held_bytes > limit {
                return Err(StreamError::ResourceExhausted {
                    stream_id,
                    resource: Resource::HeldOverflow { limit },
                });
            }
            self.complete_close(flow);
            if !self.replenish(flow)? {
                return Ok(());
            }
        }
    }

    /// Send queued items, oldest first, while every target has window for them.
    fn drain(&mut self, flow: Flow) -> StreamResult<()> {
        let side = target_side(flow);
        let targets = self.targets(flow);
        while !self.stalled[side.index()] {
            let Some(front) = self.queue(flow).items.front() else {
                break;
            };
            let length = front.length();
            let is_data = matches!(front, Pending::Data { .. });
            let ready = targets.iter().all(|t| {
                let half = self.table.half(*t);
                let reserved = length.saturating_add(half.budget.padding());
                half.state.is_open() && (!is_data || half.budget.can_send(reserved))
            });
            if !ready {
                break;
            }
            let Some(pending) = self.queue_mut(flow).pop() else {
                break;
            };
            for t in &targets {
                self.send_pending(*t, &pending)?;
            }
            let source = self.table.half_mut(StreamRef::new(pending.source(), half_of(flow)));
            source.consumed = source.consumed.max(pending.end());
        }
        Ok(())
    }

    fn send_pending(&mut self, t: StreamRef, pending: &Pending) -> StreamResult<()> {
        let header = self.stamped(t);
        let half = self.table.half_mut(t);
        let budget_id = half.budget.budget_id();
        let frame = match pending {
            Pending::Data { unit, length, .. } => {
                let reserved = length.saturating_add(half.budget.padding());
                half.budget
                    .on_sent(reserved)
                    .map_err(|v| protocol(half.stream_id, FrameKind::Data, v))?;
                Frame::new(
                    header,
                    FrameBody::Data {
                        flags: DataFlags::WHOLE,
                        budget_id,
                        reserved,
                        payload: unit.payload.clone(),
                        extension: unit.extension.clone(),
                    },
                )
            }
            Pending::Flush { extension, .. } => {
                let extension = extension.clone();
                Frame::new(header, FrameBody::Flush { budget_id, reserved: 0, extension })
            }
        };
        self.emit(t, frame);
        Ok(())
    }

    /// Move drained sources from Closing to Closed and close targets nothing feeds any more.
    fn complete_close(&mut self, flow: Flow) {
        match flow {
            Flow::Initial => {
                let source = StreamRef::new(FRONTEND, HalfKind::Initial);
                let half = self.table.half(source);
                if half.state != HalfState::Closing
                    || half.slot.is_some()
                    || !self.initial.items.is_empty()
                {
                    return;
                }
                self.table.half_mut(source).set_state(HalfState::Closed);
                for t in self.targets(flow) {
                    self.close_half(t);
                }
            }
            Flow::Reply => {
                for index in self.backend_indices() {
                    let r = StreamRef::new(index, HalfKind::Reply);
                    let half = self.table.half(r);
                    if half.state == HalfState::Closing
                        && half.slot.is_none()
                        && !self.reply.holds_from(index)
                    {
                        self.table.half_mut(r).set_state(HalfState::Closed);
                    }
                }
                let front = StreamRef::new(FRONTEND, HalfKind::Reply);
                let done = self.backends().all(|b| {
                    b.reply.state == HalfState::Closed
                        || (b.reply.state == HalfState::Idle && b.initial.state.is_terminal())
                });
                if done && self.reply.items.is_empty() {
                    self.close_half(front);
                }
            }
        }
    }

    /// Close a half-stream the session sends on.
    fn close_half(&mut self, t: StreamRef) {
        let state = self.table.half(t).state;
        let Ok(next) = state.on_close() else {
            return;
        };
        let frame = Frame::close(self.stamped(t));
        self.emit(t, frame);
        let half = self.table.half_mut(t);
        half.set_state(next);
        if half.budget.outstanding() == 0 {
            half.set_state(next.on_drained());
        }
    }

    /// Grant sources the window their targets can absorb.
    ///
    /// For each source, `committed` is the window already promised beyond what was relayed.
    /// The flow's room is the narrowest target window minus held bytes; whatever room is not
    /// committed is offered to the sources through the flow's budget pool, each capped at an
    /// equal share of the narrowest target maximum. Acknowledge and maximum never move
    /// backwards. Returns whether a waiting eager unit was queued.
    fn replenish(&mut self, flow: Flow) -> StreamResult<bool> {
        if self.stalled[source_side(flow).index()] {
            return Ok(false);
        }
        let targets = self.targets(flow);
        let mut room = u64::MAX;
        let mut target_max = self.ctx.settings.max_window;
        let mut padding = 0u32;
        let mut target_outstanding = 0u64;
        for t in &targets {
            let half = self.table.half(*t);
            if !matches!(half.state, HalfState::Open | HalfState::Closing) {
                return Ok(false);
            }
            room = room.min(half.budget.available());
            target_max = target_max.min(half.budget.maximum());
            padding = padding.max(half.budget.padding());
            target_outstanding = target_outstanding.saturating_add(half.budget.outstanding());
        }
        if targets.is_empty() {
            return Ok(false);
        }
        room = room.saturating_sub(self.queue(flow).held_bytes as u64);

        let sources: Vec<StreamRef> = self
            .sources(flow)
            .into_iter()
            .filter(|s| matches!(self.table.half(*s).state, HalfState::Opening | HalfState::Open))
            .collect();
        if sources.is_empty() {
            return Ok(false);
        }
        let share = target_max as u64 / sources.len() as u64;
        let committed =
            sources.iter().fold(0u64, |sum, s| sum.saturating_add(self.table.half(*s).committed()));
        let queue = self.queue_mut(flow);
        queue.pool.set_available(room.saturating_sub(committed));
        let start = queue.rotation % sources.len();
        queue.rotation = queue.rotation.wrapping_add(1);

        let mut released = false;
        for k in 0..sources.len() {
            let s = sources[(start + k) % sources.len()];
            let half = self.table.half(s);
            let ack = half.budget.acknowledge();
            let max = half.budget.maximum() as u64;
            let consumed = half.consumed;
            let committed = half.committed();
            let opening = half.state == HalfState::Opening;
            let source_id = half.stream_id;

            let claim = max.max(share).saturating_sub(committed);
            let granted =
                if claim > 0 { self.queue_mut(flow).pool.claim(source_id, 1, claim) } else { 0 };
            let allowed = committed.saturating_add(granted);
            let new_max = max.max(share.min(allowed.saturating_add(consumed.saturating_sub(ack))));
            let new_ack = consumed.saturating_add(allowed).saturating_sub(new_max);

            let half = self.table.half_mut(s);
            let changed = half.budget.grant(new_ack, new_max.min(u32::MAX as u64) as u32);
            if !changed && !opening {
                continue;
            }
            if opening {
                half.set_state(HalfState::Open);
            }
            debug!(
                "credit stream {} ack={} max={}",
                source_id,
                half.budget.acknowledge(),
                half.budget.maximum()
            );
            let frame = Frame::credit(self.stamped(s), padding);
            self.emit(s, frame);
            if opening && self.table.half(s).eager_ready {
                self.release_eager(s)?;
                released = true;
            }
        }

        // A unit larger than every window the source can ever be granted would hang forever.
        if let [only] = sources.as_slice() {
            let half = self.table.half(*only);
            if half.in_unit()
                && half.budget.available() == 0
                && target_outstanding == 0
                && self.queue(flow).items.is_empty()
            {
                let window = half.budget.maximum();
                return Err(StreamError::ResourceExhausted {
                    stream_id: half.stream_id,
                    resource: Resource::UnitExceedsWindow { window },
                });
            }
        }
        Ok(released)
    }
}

fn report(ctx: &ProxyContext, header: &FrameHeader, kind: FrameKind, error: StreamError) {
    ctx.observer.on_fault(&FaultReport {
        origin_id: header.origin_id,
        routed_id: header.routed_id,
        stream_id: header.stream_id,
        kind,
        error,
    });
}

/// Refuse a frontend Open before any backend exists.
fn reject(ctx: &ProxyContext, header: &FrameHeader, err: StreamError) -> StreamError {
    let reset = FrameHeader::new(header.origin_id, header.routed_id, header.stream_id)
        .with_budget(header.sequence, header.acknowledge.min(header.sequence), 0)
        .with_trace(header.trace_id)
        .with_authorization(header.authorization);
    ctx.observer.on_frame(FrameKind::Reset, false);
    let _ = ctx.frontend.emit(Frame::reset(reset));
    report(ctx, header, FrameKind::Open, err.clone());
    err
}
