use thiserror::Error;

use crate::frame::FrameKind;

/// Result type for stream operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Frame-model invariant broken by an inbound frame.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Violation {
    #[error("acknowledge {acknowledge} exceeds sequence {sequence}")]
    AcknowledgeExceedsSequence { acknowledge: u64, sequence: u64 },
    #[error("acknowledge {acknowledge} behind recorded {recorded}")]
    StaleAcknowledge { acknowledge: u64, recorded: u64 },
    #[error("acknowledge {acknowledge} ahead of granted {granted}")]
    AcknowledgeNotGranted { acknowledge: u64, granted: u64 },
    #[error("sequence {sequence} behind recorded {recorded}")]
    SequenceRegressed { sequence: u64, recorded: u64 },
    #[error("maximum {maximum} below recorded {recorded}")]
    WindowShrunk { maximum: u32, recorded: u32 },
    #[error("reserved {reserved} exceeds available window {available}")]
    WindowExceeded { reserved: u32, available: u64 },
    #[error("reserved {reserved} smaller than payload length {length}")]
    ReservedTooSmall { reserved: u32, length: usize },
    #[error("frame arrived after half-stream terminated")]
    FrameAfterTerminal,
    #[error("frame not valid in current half-stream state")]
    UnexpectedFrame,
    #[error("initial fragment while a unit is in progress")]
    UnexpectedInit,
    #[error("continuation fragment without initial fragment")]
    MissingInit,
    #[error("half-stream ended inside an incomplete unit")]
    IncompleteUnit,
}

/// Capacity that could not satisfy a request.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    #[error("reassembly pool exhausted")]
    SlotsExhausted,
    #[error("slot overflow: capacity={capacity}, offset={offset}, requested={requested}")]
    SlotOverflow { capacity: usize, offset: usize, requested: usize },
    #[error("held units exceed {limit} bytes")]
    HeldOverflow { limit: usize },
    #[error("unit in progress cannot complete within window {window}")]
    UnitExceedsWindow { window: u32 },
    #[error("unit of {length} bytes does not fit a frame")]
    UnitTooLarge { length: usize },
}

/// Coarse grouping used for metrics labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultCategory {
    Protocol,
    Route,
    Translation,
    Resource,
    Unknown,
}

impl FaultCategory {
    pub const fn as_str(self) -> &'static str {
        match self {
            FaultCategory::Protocol => "protocol",
            FaultCategory::Route => "route",
            FaultCategory::Translation => "translation",
            FaultCategory::Resource => "resource",
            FaultCategory::Unknown => "unknown",
        }
    }
}

/// Stream error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("Protocol fault on stream {stream_id} ({kind}): {violation}")]
    ProtocolFault { stream_id: u64, kind: FrameKind, violation: Violation },

    #[error("No route for stream {stream_id}")]
    RouteResolution { stream_id: u64 },

    #[error("Translation failed on stream {stream_id}: {reason}")]
    Translation { stream_id: u64, reason: String },

    #[error("Resource exhausted on stream {stream_id}: {resource}")]
    ResourceExhausted { stream_id: u64, resource: Resource },

    #[error("Stream {stream_id} unknown ({kind})")]
    UnknownStream { stream_id: u64, kind: FrameKind },
}

impl StreamError {
    pub fn category(&self) -> FaultCategory {
        match self {
            StreamError::ProtocolFault { .. } => FaultCategory::Protocol,
            StreamError::RouteResolution { .. } => FaultCategory::Route,
            StreamError::Translation { .. } => FaultCategory::Translation,
            StreamError::ResourceExhausted { .. } => FaultCategory::Resource,
            StreamError::UnknownStream { .. } => FaultCategory::Unknown,
        }
    }

    pub fn stream_id(&self) -> u64 {
        match self {
            StreamError::ProtocolFault { stream_id, .. }
            | StreamError::RouteResolution { stream_id }
            | StreamError::Translation { stream_id, .. }
            | StreamError::ResourceExhausted { stream_id, .. }
            | StreamError::UnknownStream { stream_id, .. } => *stream_id,
        }
    }
}

/// Error returned by a binding adapter that cannot translate a unit.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct TranslationError(pub String);

impl TranslationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}
