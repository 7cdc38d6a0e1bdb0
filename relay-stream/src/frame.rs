#![forbid(unsafe_code)]

//! Frame model shared by every binding. Frames are plain data; all behavior lives in the
//! budget, state and session modules.

use std::fmt;

use bitflags::bitflags;
use bytes::Bytes;

bitflags! {
    /// Fragment flags carried by Data frames.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DataFlags: u8 {
        /// Final fragment of a unit.
        const FIN = 0x01;
        /// Initial fragment of a unit.
        const INIT = 0x02;
        /// Complete, unfragmented unit.
        const WHOLE = Self::FIN.bits() | Self::INIT.bits();
    }
}

/// Discriminant of a [`FrameBody`], used in logs, metrics and fault reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Open,
    Data,
    Close,
    Abort,
    Reset,
    Flush,
    Credit,
    Signal,
}

impl FrameKind {
    pub const fn code(self) -> u8 {
        match self {
            FrameKind::Open => 0x01,
            FrameKind::Data => 0x02,
            FrameKind::Close => 0x03,
            FrameKind::Abort => 0x04,
            FrameKind::Reset => 0x05,
            FrameKind::Flush => 0x06,
            FrameKind::Credit => 0x07,
            FrameKind::Signal => 0x08,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            FrameKind::Open => "open",
            FrameKind::Data => "data",
            FrameKind::Close => "close",
            FrameKind::Abort => "abort",
            FrameKind::Reset => "reset",
            FrameKind::Flush => "flush",
            FrameKind::Credit => "credit",
            FrameKind::Signal => "signal",
        }
    }

    /// Frames flowing from the sender of a half-stream to its receiver.
    pub const fn is_forward(self) -> bool {
        matches!(
            self,
            FrameKind::Open
                | FrameKind::Data
                | FrameKind::Close
                | FrameKind::Abort
                | FrameKind::Flush
        )
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one exchange: route plus stream id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeId {
    pub origin_id: u64,
    pub routed_id: u64,
    pub stream_id: u64,
}

/// Fields common to all frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    pub origin_id: u64,
    pub routed_id: u64,
    pub stream_id: u64,
    pub sequence: u64,
    pub acknowledge: u64,
    pub maximum: u32,
    pub trace_id: u64,
    pub authorization: u64,
}

impl FrameHeader {
    pub fn new(origin_id: u64, routed_id: u64, stream_id: u64) -> Self {
        Self { origin_id, routed_id, stream_id, ..Default::default() }
    }

    pub fn with_budget(mut self, sequence: u64, acknowledge: u64, maximum: u32) -> Self {
        self.sequence = sequence;
        self.acknowledge = acknowledge;
        self.maximum = maximum;
        self
    }

    pub fn with_trace(mut self, trace_id: u64) -> Self {
        self.trace_id = trace_id;
        self
    }

    pub fn with_authorization(mut self, authorization: u64) -> Self {
        self.authorization = authorization;
        self
    }

    pub fn exchange_id(&self) -> ExchangeId {
        ExchangeId {
            origin_id: self.origin_id,
            routed_id: self.routed_id,
            stream_id: self.stream_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    Open { affinity: u64, extension: Bytes },
    Data { flags: DataFlags, budget_id: u64, reserved: u32, payload: Bytes, extension: Bytes },
    Close { extension: Bytes },
    Abort { extension: Bytes },
    Reset { extension: Bytes },
    Flush { budget_id: u64, reserved: u32, extension: Bytes },
    Credit { budget_id: u64, padding: u32 },
    Signal { signal_id: u32, payload: Bytes },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub body: FrameBody,
}

impl Frame {
    pub fn new(header: FrameHeader, body: FrameBody) -> Self {
        Self { header, body }
    }

    pub fn open(header: FrameHeader, affinity: u64, extension: Bytes) -> Self {
        Self::new(header, FrameBody::Open { affinity, extension })
    }

    /// Data frame reserving exactly its payload length.
    ///
    /// Payloads are bounded by the 32-bit length field of the wire format. Longer payloads
    /// saturate `reserved`, which a receiver refuses as `ReservedTooSmall`.
    pub fn data(header: FrameHeader, flags: DataFlags, payload: Bytes) -> Self {
        let reserved = u32::try_from(payload.len()).unwrap_or(u32::MAX);
        Self::new(
            header,
            FrameBody::Data { flags, budget_id: 0, reserved, payload, extension: Bytes::new() },
        )
    }

    pub fn close(header: FrameHeader) -> Self {
        Self::new(header, FrameBody::Close { extension: Bytes::new() })
    }

    pub fn abort(header: FrameHeader) -> Self {
        Self::new(header, FrameBody::Abort { extension: Bytes::new() })
    }

    pub fn reset(header: FrameHeader) -> Self {
        Self::new(header, FrameBody::Reset { extension: Bytes::new() })
    }

    pub fn flush(header: FrameHeader, extension: Bytes) -> Self {
        Self::new(header, FrameBody::Flush { budget_id: 0, reserved: 0, extension })
    }

    pub fn credit(header: FrameHeader, padding: u32) -> Self {
        Self::new(header, FrameBody::Credit { budget_id: 0, padding })
    }

    pub fn signal(header: FrameHeader, signal_id: u32, payload: Bytes) -> Self {
        Self::new(header, FrameBody::Signal { signal_id, payload })
    }

    pub fn kind(&self) -> FrameKind {
        match self.body {
            FrameBody::Open { .. } => FrameKind::Open,
            FrameBody::Data { .. } => FrameKind::Data,
            FrameBody::Close { .. } => FrameKind::Close,
            FrameBody::Abort { .. } => FrameKind::Abort,
            FrameBody::Reset { .. } => FrameKind::Reset,
            FrameBody::Flush { .. } => FrameKind::Flush,
            FrameBody::Credit { .. } => FrameKind::Credit,
            FrameBody::Signal { .. } => FrameKind::Signal,
        }
    }

    pub fn stream_id(&self) -> u64 {
        self.header.stream_id
    }

    /// Credit units this frame consumes from its half-stream's window.
    pub fn reserved(&self) -> u32 {
        match self.body {
            FrameBody::Data { reserved, .. } | FrameBody::Flush { reserved, .. } => reserved,
            _ => 0,
        }
    }

    /// Payload of Data and Signal frames, empty otherwise.
    pub fn payload(&self) -> &[u8] {
        match &self.body {
            FrameBody::Data { payload, .. } | FrameBody::Signal { payload, .. } => payload,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whole_flag_is_init_and_fin() {
        assert!(DataFlags::WHOLE.contains(DataFlags::INIT));
        assert!(DataFlags::WHOLE.contains(DataFlags::FIN));
        assert_eq!(DataFlags::WHOLE.bits(), 0x03);
        assert_eq!(DataFlags::from_bits_truncate(0xFF), DataFlags::WHOLE);
    }

    #[test]
    fn test_data_reserves_payload_length() {
        let hdr = FrameHeader::new(1, 2, 3).with_budget(10, 4, 100);
        let frame = Frame::data(hdr, DataFlags::WHOLE, Bytes::from_static(b"hello"));
        assert_eq!(frame.kind(), FrameKind::Data);
        assert_eq!(frame.reserved(), 5);
        assert_eq!(frame.payload(), b"hello");
        let id = ExchangeId { origin_id: 1, routed_id: 2, stream_id: 3 };
        assert_eq!(frame.header.exchange_id(), id);
    }

    #[test]
    fn test_forward_kinds() {
        assert!(FrameKind::Data.is_forward());
        assert!(FrameKind::Abort.is_forward());
        assert!(!FrameKind::Credit.is_forward());
        assert!(!FrameKind::Reset.is_forward());
        assert!(!FrameKind::Signal.is_forward());
        assert_eq!(FrameKind::Credit.to_string(), "credit");
    }
}
