#![forbid(unsafe_code)]

//! Big-endian framing of [`Frame`] for byte-stream transports.
//!
//! Layout: kind (u8), then origin, routed, stream, sequence, acknowledge (u64 each),
//! maximum (u32), trace and authorization (u64 each), then the kind-specific body. Every octet
//! string in a body is prefixed by its u32 length.

use bytes::{BufMut, Bytes, BytesMut};
use nom::{
    bytes::complete::take,
    combinator::{fail, map},
    number::complete::{be_u32, be_u64, u8},
    IResult,
};

use crate::frame::{DataFlags, Frame, FrameBody, FrameHeader, FrameKind};

/// Size of the kind byte plus the common header.
pub const HEADER_LEN: usize = 1 + 8 * 5 + 4 + 8 * 2;

fn parse_octets(input: &[u8]) -> IResult<&[u8], Bytes> {
    let (input, len) = be_u32(input)?;
    map(take(len), Bytes::copy_from_slice)(input)
}

fn parse_header(input: &[u8]) -> IResult<&[u8], FrameHeader> {
    let (input, origin_id) = be_u64(input)?;
    let (input, routed_id) = be_u64(input)?;
    let (input, stream_id) = be_u64(input)?;
    let (input, sequence) = be_u64(input)?;
    let (input, acknowledge) = be_u64(input)?;
    let (input, maximum) = be_u32(input)?;
    let (input, trace_id) = be_u64(input)?;
    let (input, authorization) = be_u64(input)?;
    Ok((
        input,
        FrameHeader {
            origin_id,
            routed_id,
            stream_id,
            sequence,
            acknowledge,
            maximum,
            trace_id,
            authorization,
        },
    ))
}

fn parse_body(kind: u8, input: &[u8]) -> IResult<&[u8], FrameBody> {
    match kind {
        k if k == FrameKind::Open.code() => {
            let (input, affinity) = be_u64(input)?;
            let (input, extension) = parse_octets(input)?;
            Ok((input, FrameBody::Open { affinity, extension }))
        }
        k if k == FrameKind::Data.code() => {
            let (input, flags) = u8(input)?;
            let (input, budget_id) = be_u64(input)?;
            let (input, reserved) = be_u32(input)?;
            let (input, payload) = parse_octets(input)?;
            let (input, extension) = parse_octets(input)?;
            let flags = DataFlags::from_bits_truncate(flags);
            Ok((input, FrameBody::Data { flags, budget_id, reserved, payload, extension }))
        }
        k if k == FrameKind::Close.code() => {
            map(parse_octets, |extension| FrameBody::Close { extension })(input)
        }
        k if k == FrameKind::Abort.code() => {
            map(parse_octets, |extension| FrameBody::Abort { extension })(input)
        }
        k if k == FrameKind::Reset.code() => {
            map(parse_octets, |extension| FrameBody::Reset { extension })(input)
        }
        k if k == FrameKind::Flush.code() => {
            let (input, budget_id) = be_u64(input)?;
            let (input, reserved) = be_u32(input)?;
            let (input, extension) = parse_octets(input)?;
            Ok((input, FrameBody::Flush { budget_id, reserved, extension }))
        }
        k if k == FrameKind::Credit.code() => {
            let (input, budget_id) = be_u64(input)?;
            let (input, padding) = be_u32(input)?;
            Ok((input, FrameBody::Credit { budget_id, padding }))
        }
        k if k == FrameKind::Signal.code() => {
            let (input, signal_id) = be_u32(input)?;
            let (input, payload) = parse_octets(input)?;
            Ok((input, FrameBody::Signal { signal_id, payload }))
        }
        _ => fail(input),
    }
}

/// Parse one frame, returning the unconsumed remainder.
pub fn parse_frame(input: &[u8]) -> IResult<&[u8], Frame> {
    let (input, kind) = u8(input)?;
    let (input, header) = parse_header(input)?;
    let (input, body) = parse_body(kind, input)?;
    Ok((input, Frame { header, body }))
}

fn put_octets(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

/// Encode a frame into a freshly allocated buffer. Octet fields carry a 32-bit length prefix,
/// so payloads and extensions must stay below 4 GiB.
pub fn build_frame(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 32 + frame.payload().len());
    let h = &frame.header;
    buf.put_u8(frame.kind().code());
    buf.put_u64(h.origin_id);
    buf.put_u64(h.routed_id);
    buf.put_u64(h.stream_id);
    buf.put_u64(h.sequence);
    buf.put_u64(h.acknowledge);
    buf.put_u32(h.maximum);
    buf.put_u64(h.trace_id);
    buf.put_u64(h.authorization);
    match &frame.body {
        FrameBody::Open { affinity, extension } => {
            buf.put_u64(*affinity);
            put_octets(&mut buf, extension);
        }
        FrameBody::Data { flags, budget_id, reserved, payload, extension } => {
            buf.put_u8(flags.bits());
            buf.put_u64(*budget_id);
            buf.put_u32(*reserved);
            put_octets(&mut buf, payload);
            put_octets(&mut buf, extension);
        }
        FrameBody::Close { extension }
        | FrameBody::Abort { extension }
        | FrameBody::Reset { extension } => {
            put_octets(&mut buf, extension);
        }
        FrameBody::Flush { budget_id, reserved, extension } => {
            buf.put_u64(*budget_id);
            buf.put_u32(*reserved);
            put_octets(&mut buf, extension);
        }
        FrameBody::Credit { budget_id, padding } => {
            buf.put_u64(*budget_id);
            buf.put_u32(*padding);
        }
        FrameBody::Signal { signal_id, payload } => {
            buf.put_u32(*signal_id);
            put_octets(&mut buf, payload);
        }
    }
    buf.freeze()
}
