#![forbid(unsafe_code)]

//! Demultiplexes inbound frames onto proxy sessions and accepts new ones.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::errors::{StreamError, StreamResult};
use crate::frame::{Frame, FrameKind};
use crate::ids::is_initial;
use crate::session::{ProxyContext, ProxySession, Side};

pub struct Gateway {
    ctx: ProxyContext,
    sessions: HashMap<u64, ProxySession>,
    /// Stream id to the frontend initial id keying its session.
    routes: HashMap<u64, u64>,
}

impl Gateway {
    pub fn new(ctx: ProxyContext) -> Self {
        Self { ctx, sessions: HashMap::new(), routes: HashMap::new() }
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, frontend_id: u64) -> Option<&ProxySession> {
        self.sessions.get(&frontend_id)
    }

    /// Route one inbound frame. A frontend Open on an unknown initial id starts a session.
    pub fn on_frame(&mut self, frame: Frame) -> StreamResult<()> {
        let stream_id = frame.stream_id();
        if let Some(&key) = self.routes.get(&stream_id) {
            let result = match self.sessions.get_mut(&key) {
                Some(session) => session.on_frame(frame),
                None => Err(StreamError::UnknownStream { stream_id, kind: frame.kind() }),
            };
            self.retire(key);
            return result;
        }

        if frame.kind() == FrameKind::Open && is_initial(stream_id) {
            let session = ProxySession::accept(self.ctx.clone(), frame)?;
            for id in session.stream_ids() {
                self.routes.insert(id, stream_id);
            }
            self.sessions.insert(stream_id, session);
            relay_telemetry::record_session_opened();
            info!("session {} accepted, {} active", stream_id, self.sessions.len());
            return Ok(());
        }

        debug!("{} on unknown stream {}", frame.kind(), stream_id);
        Err(StreamError::UnknownStream { stream_id, kind: frame.kind() })
    }

    /// Resume every session after a dispatch drained below its high-water mark.
    pub fn on_dispatch_ready(&mut self, side: Side) {
        let keys: Vec<u64> = self.sessions.keys().copied().collect();
        for key in keys {
            if let Some(session) = self.sessions.get_mut(&key) {
                if let Err(e) = session.on_dispatch_ready(side) {
                    debug!("session {} failed on resume: {}", key, e);
                }
            }
            self.retire(key);
        }
    }

    fn retire(&mut self, key: u64) {
        let done = self.sessions.get(&key).map_or(false, |s| s.is_terminated());
        if !done {
            return;
        }
        if let Some(session) = self.sessions.remove(&key) {
            for id in session.stream_ids() {
                self.routes.remove(&id);
            }
            relay_telemetry::record_session_closed();
            debug!("session {} retired", key);
        }
    }
}
