#![forbid(unsafe_code)]
//! Scripted peers and recording collaborators for driving proxy sessions in tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use relay_core::SessionConfig;
use relay_stream::{
    BindingAdapter, BufferPool, DataFlags, DefaultIdGenerator, Dispatch, DispatchStatus,
    FaultCategory, FaultObserver, FaultReport, Flow, Frame, FrameBody, FrameHeader, FrameKind,
    OpenMeta, Passthrough, ProxyContext, ProxySession, Route, RouteResolver, RouteTarget,
    SessionSettings, TranslationError, Unit,
};

/// Origin id of the frontend peer.
pub const CLIENT_ID: u64 = 10;
/// Routed id of the gateway binding.
pub const GATEWAY_ID: u64 = 20;
/// Frontend initial stream id used by [`Harness::accept`].
pub const FRONT_INITIAL: u64 = 1;
pub const FRONT_REPLY: u64 = 0;

/// Dispatch recording every frame, with switchable backpressure.
#[derive(Debug, Default)]
pub struct Recorder {
    frames: Mutex<Vec<Frame>>,
    backpressure: AtomicBool,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything recorded so far.
    pub fn take(&self) -> Vec<Frame> {
        std::mem::take(&mut *self.frames.lock())
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_backpressure(&self, on: bool) {
        self.backpressure.store(on, Ordering::SeqCst);
    }
}

impl Dispatch for Recorder {
    fn emit(&self, frame: Frame) -> DispatchStatus {
        self.frames.lock().push(frame);
        if self.backpressure.load(Ordering::SeqCst) {
            DispatchStatus::Backpressured
        } else {
            DispatchStatus::Ready
        }
    }
}

/// Kind and stream id of each frame, for compact assertions.
pub fn summary(frames: &[Frame]) -> Vec<(FrameKind, u64)> {
    frames.iter().map(|f| (f.kind(), f.stream_id())).collect()
}

/// Frames of one kind addressed to one stream.
pub fn of_kind(frames: &[Frame], kind: FrameKind, stream_id: u64) -> Vec<Frame> {
    frames.iter().filter(|f| f.kind() == kind && f.stream_id() == stream_id).cloned().collect()
}

/// Resolver routing every authorized Open to a fixed set of backends.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    route_id: u64,
    targets: Vec<u64>,
    /// Authorization value refused with no route.
    denied: Option<u64>,
}

impl StaticResolver {
    pub fn new(route_id: u64, targets: &[u64]) -> Self {
        Self { route_id, targets: targets.to_vec(), denied: None }
    }

    pub fn denying(mut self, authorization: u64) -> Self {
        self.denied = Some(authorization);
        self
    }
}

impl RouteResolver for StaticResolver {
    fn resolve(&self, authorization: u64, _open: &OpenMeta<'_>) -> Option<Route> {
        if self.denied == Some(authorization) || self.targets.is_empty() {
            return None;
        }
        Some(Route {
            id: self.route_id,
            targets: self.targets.iter().map(|&id| RouteTarget::new(id)).collect(),
        })
    }
}

/// Observer keeping every fault report.
#[derive(Debug, Default)]
pub struct FaultLog {
    reports: Mutex<Vec<FaultReport>>,
}

impl FaultLog {
    pub fn reports(&self) -> Vec<FaultReport> {
        self.reports.lock().clone()
    }

    pub fn categories(&self) -> Vec<FaultCategory> {
        self.reports.lock().iter().map(|r| r.error.category()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }
}

impl FaultObserver for FaultLog {
    fn on_fault(&self, report: &FaultReport) {
        self.reports.lock().push(report.clone());
    }
}

/// Upper-cases initial payloads and lower-cases reply payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct CaseAdapter;

impl BindingAdapter for CaseAdapter {
    fn translate_open(&self, _flow: Flow, extension: &Bytes) -> Result<Bytes, TranslationError> {
        Ok(extension.clone())
    }

    fn translate_payload(&self, flow: Flow, unit: Unit) -> Result<Unit, TranslationError> {
        let payload = match flow {
            Flow::Initial => unit.payload.to_ascii_uppercase(),
            Flow::Reply => unit.payload.to_ascii_lowercase(),
        };
        Ok(Unit::new(Bytes::from(payload), unit.extension))
    }

    fn translate_flush(&self, _flow: Flow, extension: &Bytes) -> Result<Bytes, TranslationError> {
        Ok(extension.clone())
    }
}

/// Refuses Opens whose extension is `reject` and payloads containing `bad`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PickyAdapter;

impl BindingAdapter for PickyAdapter {
    fn translate_open(&self, _flow: Flow, extension: &Bytes) -> Result<Bytes, TranslationError> {
        if extension.as_ref() == b"reject" {
            return Err(TranslationError::new("open refused"));
        }
        Ok(extension.clone())
    }

    fn translate_payload(&self, _flow: Flow, unit: Unit) -> Result<Unit, TranslationError> {
        if unit.payload.windows(3).any(|w| w == b"bad") {
            return Err(TranslationError::new("malformed unit"));
        }
        Ok(unit)
    }

    fn translate_flush(&self, _flow: Flow, extension: &Bytes) -> Result<Bytes, TranslationError> {
        Ok(extension.clone())
    }

    fn on_signal(
        &self,
        _flow: Flow,
        signal_id: u32,
        _payload: &Bytes,
    ) -> Result<(), TranslationError> {
        if signal_id == 0 {
            return Err(TranslationError::new("signal 0 unsupported"));
        }
        Ok(())
    }
}

/// Passthrough that lets a frontend send its first unit before any window is granted.
#[derive(Debug, Clone, Copy, Default)]
pub struct EagerAdapter;

impl BindingAdapter for EagerAdapter {
    fn translate_open(&self, flow: Flow, extension: &Bytes) -> Result<Bytes, TranslationError> {
        Passthrough.translate_open(flow, extension)
    }

    fn translate_payload(&self, flow: Flow, unit: Unit) -> Result<Unit, TranslationError> {
        Passthrough.translate_payload(flow, unit)
    }

    fn translate_flush(&self, flow: Flow, extension: &Bytes) -> Result<Bytes, TranslationError> {
        Passthrough.translate_flush(flow, extension)
    }

    fn accepts_eager_data(&self) -> bool {
        true
    }
}

/// One end of a half-stream as a well-behaved peer would drive it.
///
/// As a sender the peer advances `sequence` with each Data frame and absorbs the gateway's
/// Credit frames. As a receiver it absorbs Data and grants window with [`Peer::credit`].
#[derive(Debug, Clone, Copy)]
pub struct Peer {
    pub origin_id: u64,
    pub routed_id: u64,
    pub stream_id: u64,
    pub sequence: u64,
    pub acknowledge: u64,
    pub maximum: u32,
}

impl Peer {
    pub fn new(origin_id: u64, routed_id: u64, stream_id: u64) -> Self {
        Self { origin_id, routed_id, stream_id, sequence: 0, acknowledge: 0, maximum: 0 }
    }

    /// The frontend client's initial half-stream.
    pub fn client() -> Self {
        Self::new(CLIENT_ID, GATEWAY_ID, FRONT_INITIAL)
    }

    /// The frontend client's reply half-stream.
    pub fn client_reply() -> Self {
        Self::new(CLIENT_ID, GATEWAY_ID, FRONT_REPLY)
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader::new(self.origin_id, self.routed_id, self.stream_id).with_budget(
            self.sequence,
            self.acknowledge,
            self.maximum,
        )
    }

    pub fn open(&self, extension: &'static [u8]) -> Frame {
        Frame::open(self.header(), 0, Bytes::from_static(extension))
    }

    /// Data frame reserving exactly its payload length.
    pub fn data(&mut self, flags: DataFlags, payload: &[u8]) -> Frame {
        self.data_reserved(flags, payload, payload.len() as u32)
    }

    pub fn data_reserved(&mut self, flags: DataFlags, payload: &[u8], reserved: u32) -> Frame {
        let mut frame = Frame::data(self.header(), flags, Bytes::copy_from_slice(payload));
        if let FrameBody::Data { reserved: r, .. } = &mut frame.body {
            *r = reserved;
        }
        self.sequence += reserved as u64;
        frame
    }

    pub fn flush(&self) -> Frame {
        Frame::flush(self.header(), Bytes::new())
    }

    pub fn close(&self) -> Frame {
        Frame::close(self.header())
    }

    pub fn abort(&self) -> Frame {
        Frame::abort(self.header())
    }

    pub fn reset(&self) -> Frame {
        Frame::reset(self.header())
    }

    /// Absorb a Credit from the gateway.
    pub fn on_credit(&mut self, frame: &Frame) {
        self.acknowledge = self.acknowledge.max(frame.header.acknowledge);
        self.maximum = self.maximum.max(frame.header.maximum);
    }

    /// Absorb a Data frame from the gateway.
    pub fn on_data(&mut self, frame: &Frame) {
        let end = frame.header.sequence.saturating_add(frame.reserved() as u64);
        self.sequence = self.sequence.max(end);
    }

    /// Grant window after everything received so far.
    pub fn credit(&mut self, maximum: u32) -> Frame {
        self.acknowledge = self.sequence;
        self.maximum = self.maximum.max(maximum);
        Frame::credit(self.header(), 0)
    }

    /// Units the peer may still send.
    pub fn available(&self) -> u64 {
        (self.acknowledge + self.maximum as u64).saturating_sub(self.sequence)
    }
}

/// A session wired to recording collaborators.
pub struct Harness {
    pub frontend: Arc<Recorder>,
    pub backend: Arc<Recorder>,
    pub faults: Arc<FaultLog>,
    pub pool: BufferPool,
    pub resolver: StaticResolver,
    pub adapter: Arc<dyn BindingAdapter>,
    pub settings: SessionSettings,
}

impl Harness {
    pub fn new(targets: &[u64]) -> Self {
        Self::with_adapter(targets, Arc::new(Passthrough))
    }

    pub fn with_adapter(targets: &[u64], adapter: Arc<dyn BindingAdapter>) -> Self {
        Self {
            frontend: Arc::new(Recorder::new()),
            backend: Arc::new(Recorder::new()),
            faults: Arc::new(FaultLog::default()),
            pool: BufferPool::new(16, 256),
            resolver: StaticResolver::new(1, targets),
            adapter,
            settings: SessionSettings::from_config(&SessionConfig::default()),
        }
    }

    pub fn with_pool(mut self, slot_count: usize, slot_capacity: usize) -> Self {
        self.pool = BufferPool::new(slot_count, slot_capacity);
        self
    }

    pub fn with_settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn context(&self) -> ProxyContext {
        ProxyContext {
            resolver: Arc::new(self.resolver.clone()),
            ids: Arc::new(DefaultIdGenerator::new()),
            adapter: self.adapter.clone(),
            frontend: self.frontend.clone(),
            backend: self.backend.clone(),
            pool: self.pool.clone(),
            observer: self.faults.clone(),
            settings: self.settings,
        }
    }

    /// Accept a session for a frontend Open from [`Peer::client`].
    pub fn accept(&self) -> ProxySession {
        match ProxySession::accept(self.context(), Peer::client().open(b"")) {
            Ok(session) => session,
            Err(e) => panic!("session refused: {}", e),
        }
    }

    /// Accept a session and have every backend grant `window`. Recorded frames are discarded and
    /// the client has absorbed its credit.
    pub fn established(&self, window: u32) -> (ProxySession, Peer, Vec<(Peer, Peer)>) {
        let mut session = self.accept();
        let mut backends = Self::backend_peers(&session);
        for (initial, _) in backends.iter_mut() {
            if let Err(e) = session.on_frame(initial.credit(window)) {
                panic!("backend credit refused: {}", e);
            }
        }
        let mut client = Peer::client();
        for credit in of_kind(&self.frontend.take(), FrameKind::Credit, FRONT_INITIAL) {
            client.on_credit(&credit);
        }
        self.backend.take();
        (session, client, backends)
    }

    /// Peers for each backend of `session`: (initial receiver, reply sender).
    pub fn backend_peers(session: &ProxySession) -> Vec<(Peer, Peer)> {
        session
            .backends()
            .map(|b| {
                (
                    Peer::new(b.origin_id, b.routed_id, b.initial.stream_id),
                    Peer::new(b.origin_id, b.routed_id, b.reply.stream_id),
                )
            })
            .collect()
    }
}
