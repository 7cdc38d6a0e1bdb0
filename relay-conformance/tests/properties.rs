use bytes::Bytes;
use proptest::prelude::*;
use relay_conformance::{of_kind, Harness, Peer, FRONT_INITIAL};
use relay_stream::{
    build_frame, parse_frame, DataFlags, Frame, FrameHeader, FrameKind, HalfState, StreamError,
    Violation,
};

const WINDOW: u32 = 128;

fn arb_frame() -> impl Strategy<Value = Frame> {
    let ids = (any::<u64>(), any::<u64>(), any::<u64>());
    let budget = (any::<u64>(), any::<u32>(), any::<u64>());
    let header = (ids, budget).prop_map(|((origin, routed, stream), (sequence, maximum, trace))| {
        FrameHeader::new(origin, routed, stream)
            .with_budget(sequence, sequence / 2, maximum)
            .with_trace(trace)
    });
    let bytes = proptest::collection::vec(any::<u8>(), 0..64).prop_map(Bytes::from);
    let parts = (header, 0u8..8, bytes, any::<u32>(), 0u8..4);
    parts.prop_map(|(h, kind, payload, n, flags)| match kind {
        0 => Frame::open(h, n as u64, payload),
        1 => Frame::data(h, DataFlags::from_bits_truncate(flags), payload),
        2 => Frame::close(h),
        3 => Frame::abort(h),
        4 => Frame::reset(h),
        5 => Frame::flush(h, payload),
        6 => Frame::credit(h, n),
        _ => Frame::signal(h, n, payload),
    })
}

proptest! {
    #[test]
    fn wire_round_trip(frame in arb_frame()) {
        let encoded = build_frame(&frame);
        let (rest, decoded) = parse_frame(&encoded).unwrap();
        prop_assert!(rest.is_empty());
        prop_assert_eq!(decoded, frame);
    }

    /// A well-behaved client never sees acknowledge or maximum move backwards, the backend never
    /// receives more than it granted, and every byte arrives in order.
    #[test]
    fn accounting_monotonic_and_window_respected(
        units in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 1..=WINDOW as usize),
            1..20,
        )
    ) {
        let h = Harness::new(&[30]);
        let (mut session, mut client, mut backends) = h.established(WINDOW);
        let (binit, _) = &mut backends[0];
        let mut last_credit = (0u64, 0u32);
        let mut next_sequence = 0u64;
        let mut delivered = Vec::new();

        for unit in &units {
            if client.available() < unit.len() as u64 {
                for frame in h.backend.take() {
                    prop_assert_eq!(frame.kind(), FrameKind::Data);
                    prop_assert!(frame.header.sequence + frame.reserved() as u64
                        <= binit.acknowledge + binit.maximum as u64);
                    prop_assert_eq!(frame.header.sequence, next_sequence);
                    next_sequence += frame.reserved() as u64;
                    delivered.extend_from_slice(frame.payload());
                    binit.on_data(&frame);
                }
                session.on_frame(binit.credit(WINDOW)).unwrap();
                for credit in of_kind(&h.frontend.take(), FrameKind::Credit, FRONT_INITIAL) {
                    prop_assert!(credit.header.acknowledge >= last_credit.0);
                    prop_assert!(credit.header.maximum >= last_credit.1);
                    last_credit = (credit.header.acknowledge, credit.header.maximum);
                    client.on_credit(&credit);
                }
            }
            prop_assert!(client.available() >= unit.len() as u64);
            session.on_frame(client.data(DataFlags::WHOLE, unit)).unwrap();
        }
        for frame in h.backend.take() {
            let end = frame.header.sequence + frame.reserved() as u64;
            prop_assert!(end <= binit.acknowledge + binit.maximum as u64);
            delivered.extend_from_slice(frame.payload());
        }
        prop_assert_eq!(delivered, units.concat());
        prop_assert!(h.faults.is_empty());
    }

    /// Splitting a unit into fragments relays the same unit as sending it whole.
    #[test]
    fn fragmentation_is_transparent(
        unit in proptest::collection::vec(any::<u8>(), 1..200),
        cuts in proptest::collection::vec(1usize..200, 0..6)
    ) {
        let mut cuts: Vec<usize> = cuts.into_iter().filter(|&c| c < unit.len()).collect();
        cuts.sort_unstable();
        cuts.dedup();

        let h = Harness::new(&[30]);
        let (mut session, mut client, _) = h.established(256);
        let mut start = 0;
        let mut bounds = cuts.clone();
        bounds.push(unit.len());
        for (i, &end) in bounds.iter().enumerate() {
            let mut flags = DataFlags::empty();
            if i == 0 {
                flags |= DataFlags::INIT;
            }
            if i == bounds.len() - 1 {
                flags |= DataFlags::FIN;
            }
            session.on_frame(client.data(flags, &unit[start..end])).unwrap();
            start = end;
        }

        let data = h.backend.take();
        prop_assert_eq!(data.len(), 1);
        prop_assert_eq!(data[0].payload(), &unit[..]);
        prop_assert_eq!(h.pool.in_use(), 0);
    }

    /// Nothing moves a terminal half-stream and nothing is emitted for frames that reach one.
    #[test]
    fn terminal_states_are_final(
        abort in any::<bool>(),
        kind in 0u8..6,
        payload in proptest::collection::vec(any::<u8>(), 0..16),
    ) {
        let h = Harness::new(&[30]);
        let (mut session, mut client, mut backends) = h.established(64);
        let (binit, _) = &mut backends[0];
        let ending = if abort { client.abort() } else { client.close() };
        session.on_frame(ending).unwrap();
        let ended = if abort { HalfState::Aborted } else { HalfState::Closed };
        prop_assert_eq!(session.state_of(FRONT_INITIAL), Some(ended));
        prop_assert_eq!(session.state_of(binit.stream_id), Some(ended));
        h.frontend.take();
        h.backend.take();
        let faults = h.faults.reports().len();

        let late = match kind {
            0 => client.data(DataFlags::WHOLE, &payload),
            1 => client.close(),
            2 => client.abort(),
            3 => client.flush(),
            4 => client.open(b""),
            _ => binit.credit(64),
        };
        let err = session.on_frame(late).unwrap_err();
        prop_assert!(matches!(
            err,
            StreamError::ProtocolFault { violation: Violation::FrameAfterTerminal, .. }
        ), "unexpected error: {:?}", err);
        prop_assert_eq!(session.state_of(FRONT_INITIAL), Some(ended));
        prop_assert_eq!(session.state_of(binit.stream_id), Some(ended));
        prop_assert!(h.frontend.is_empty());
        prop_assert!(h.backend.is_empty());
        prop_assert_eq!(h.faults.reports().len(), faults + 1);
    }
}

#[test]
fn peer_tracks_gateway_credit() {
    let mut peer = Peer::client();
    peer.on_credit(&Frame::credit(FrameHeader::new(0, 0, 1).with_budget(0, 10, 50), 0));
    assert_eq!(peer.available(), 60);
}
