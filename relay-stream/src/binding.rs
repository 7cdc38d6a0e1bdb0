#![forbid(unsafe_code)]

//! Narrow interfaces through which a proxy session reaches its protocol-specific collaborators.

use bytes::Bytes;

use crate::errors::TranslationError;
use crate::frame::FrameHeader;

/// Direction of a relay through the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flow {
    /// Frontend initial toward backend initials.
    Initial,
    /// Backend replies toward the frontend reply.
    Reply,
}

impl Flow {
    pub const fn as_str(self) -> &'static str {
        match self {
            Flow::Initial => "initial",
            Flow::Reply => "reply",
        }
    }
}

/// One backend a route fans out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteTarget {
    pub routed_id: u64,
    pub affinity: u64,
}

impl RouteTarget {
    pub fn new(routed_id: u64) -> Self {
        Self { routed_id, affinity: 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub id: u64,
    pub targets: Vec<RouteTarget>,
}

/// What a resolver sees of the frontend Open.
#[derive(Debug, Clone, Copy)]
pub struct OpenMeta<'a> {
    pub header: &'a FrameHeader,
    pub affinity: u64,
    pub extension: &'a Bytes,
}

pub trait RouteResolver: Send + Sync {
    /// `None` rejects the exchange.
    fn resolve(&self, authorization: u64, open: &OpenMeta<'_>) -> Option<Route>;
}

/// A complete protocol unit with its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Unit {
    pub payload: Bytes,
    pub extension: Bytes,
}

impl Unit {
    pub fn new(payload: Bytes, extension: Bytes) -> Self {
        Self { payload, extension }
    }
}

/// Protocol-specific translation plugged into a session.
pub trait BindingAdapter: Send + Sync {
    fn translate_open(&self, flow: Flow, extension: &Bytes) -> Result<Bytes, TranslationError>;

    fn translate_payload(&self, flow: Flow, unit: Unit) -> Result<Unit, TranslationError>;

    fn translate_flush(&self, flow: Flow, extension: &Bytes) -> Result<Bytes, TranslationError>;

    /// Whether Data may arrive before the session granted any window.
    fn accepts_eager_data(&self) -> bool {
        false
    }

    /// Out-of-band notification on a live half-stream.
    fn on_signal(
        &self,
        _flow: Flow,
        _signal_id: u32,
        _payload: &Bytes,
    ) -> Result<(), TranslationError> {
        Ok(())
    }
}

/// Adapter relaying every unit unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl BindingAdapter for Passthrough {
    fn translate_open(&self, _flow: Flow, extension: &Bytes) -> Result<Bytes, TranslationError> {
        Ok(extension.clone())
    }

    fn translate_payload(&self, _flow: Flow, unit: Unit) -> Result<Unit, TranslationError> {
        Ok(unit)
    }

    fn translate_flush(&self, _flow: Flow, extension: &Bytes) -> Result<Bytes, TranslationError> {
        Ok(extension.clone())
    }
}
