use std::sync::Arc;

use relay_conformance::{of_kind, summary, Harness, Peer, PickyAdapter, FRONT_INITIAL, FRONT_REPLY};
use relay_core::SessionConfig;
use relay_stream::{
    DataFlags, FaultCategory, Frame, FrameKind, HalfState, ProxySession, Resource, SessionSettings,
    StreamError, Violation,
};

#[test]
fn window_overflow_aborts_exchange() {
    let h = Harness::new(&[30]);
    let (mut session, mut client, _) = h.established(100);

    let err = session.on_frame(client.data(DataFlags::WHOLE, &[0; 150])).unwrap_err();
    assert!(matches!(
        err,
        StreamError::ProtocolFault {
            stream_id: 1,
            violation: Violation::WindowExceeded { reserved: 150, .. },
            ..
        }
    ));

    let front = summary(&h.frontend.take());
    assert!(front.contains(&(FrameKind::Reset, FRONT_INITIAL)));
    assert!(front.contains(&(FrameKind::Abort, FRONT_REPLY)));
    assert_eq!(session.state_of(FRONT_INITIAL), Some(HalfState::Aborted));
    assert_eq!(session.state_of(FRONT_REPLY), Some(HalfState::Aborted));
    assert!(h.backend.take().iter().all(|f| f.kind() != FrameKind::Data));
    assert_eq!(h.faults.categories(), vec![FaultCategory::Protocol]);
    assert!(session.is_terminated());
}

#[test]
fn backend_abort_propagates_to_frontend_reply() {
    let h = Harness::new(&[30]);
    let (mut session, _client, mut backends) = h.established(100);
    let (_, breply) = &mut backends[0];

    session.on_frame(breply.open(b"")).unwrap();
    let mut creply = Peer::client_reply();
    session.on_frame(creply.credit(256)).unwrap();
    for credit in of_kind(&h.backend.take(), FrameKind::Credit, breply.stream_id) {
        breply.on_credit(&credit);
    }
    h.frontend.take();

    session.on_frame(breply.data(DataFlags::INIT, b"partial")).unwrap();
    assert_eq!(h.pool.in_use(), 1);

    session.on_frame(breply.abort()).unwrap();
    assert_eq!(summary(&h.frontend.take()), vec![(FrameKind::Abort, FRONT_REPLY)]);
    assert_eq!(session.state_of(FRONT_REPLY), Some(HalfState::Aborted));
    assert_eq!(session.state_of(breply.stream_id), Some(HalfState::Aborted));
    assert_eq!(h.pool.in_use(), 0);
    assert!(h.faults.is_empty());
}

#[test]
fn backend_reset_propagates_to_frontend_initial() {
    let h = Harness::new(&[30]);
    let (mut session, _client, backends) = h.established(100);
    let (binit, _) = &backends[0];

    session.on_frame(binit.reset()).unwrap();
    let front = summary(&h.frontend.take());
    assert!(front.contains(&(FrameKind::Reset, FRONT_INITIAL)));
    assert!(front.contains(&(FrameKind::Abort, FRONT_REPLY)));
    assert!(session.is_terminated());
}

#[test]
fn oversized_unit_exhausts_slot() {
    let h = Harness::new(&[30]).with_pool(1, 64);
    let (mut session, mut client, _) = h.established(1000);

    session.on_frame(client.data(DataFlags::INIT, &[1; 40])).unwrap();
    assert_eq!(h.pool.in_use(), 1);
    let err = session.on_frame(client.data(DataFlags::empty(), &[2; 40])).unwrap_err();
    assert!(matches!(
        err,
        StreamError::ResourceExhausted {
            resource: Resource::SlotOverflow { capacity: 64, offset: 40, requested: 40 },
            ..
        }
    ));
    assert_eq!(h.pool.in_use(), 0);
    assert_eq!(h.faults.categories(), vec![FaultCategory::Resource]);
    assert!(summary(&h.frontend.take()).contains(&(FrameKind::Reset, FRONT_INITIAL)));
    assert!(session.is_terminated());
}

#[test]
fn exhausted_pool_fails_only_the_new_unit() {
    let h = Harness::new(&[30]).with_pool(1, 64);
    let (mut first, mut first_client, _) = h.established(100);
    let (mut second, mut second_client, _) = h.established(100);

    first.on_frame(first_client.data(DataFlags::INIT, b"held")).unwrap();
    let err = second.on_frame(second_client.data(DataFlags::INIT, b"none")).unwrap_err();
    assert!(matches!(
        err,
        StreamError::ResourceExhausted { resource: Resource::SlotsExhausted, .. }
    ));
    assert!(second.is_terminated());

    first.on_frame(first_client.data(DataFlags::FIN, b"!")).unwrap();
    let data = of_kind(&h.backend.take(), FrameKind::Data, 3);
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].payload(), b"held!");
    assert_eq!(h.pool.in_use(), 0);
}

#[test]
fn unit_larger_than_window_is_refused() {
    let h = Harness::new(&[30]);
    let (mut session, mut client, _) = h.established(100);

    let err = session.on_frame(client.data(DataFlags::INIT, &[0; 100])).unwrap_err();
    assert!(matches!(
        err,
        StreamError::ResourceExhausted { resource: Resource::UnitExceedsWindow { window: 100 }, .. }
    ));
    assert_eq!(h.pool.in_use(), 0);
}

#[test]
fn held_bytes_bounded() {
    let settings = SessionSettings { max_held_bytes: 100, ..SessionSettings::default() };
    let h = Harness::with_adapter(&[30], Arc::new(relay_conformance::EagerAdapter))
        .with_settings(settings);
    let mut session = h.accept();
    let mut binit = Harness::backend_peers(&session)[0].0;

    let mut client = Peer::client();
    session.on_frame(client.data(DataFlags::WHOLE, &[9; 200])).unwrap();
    let err = session.on_frame(binit.credit(50)).unwrap_err();
    assert!(matches!(
        err,
        StreamError::ResourceExhausted { resource: Resource::HeldOverflow { limit: 100 }, .. }
    ));
    assert!(session.is_terminated());
    assert_eq!(h.pool.in_use(), 0);
}

#[test]
fn unresolved_route_resets_frontend() {
    let h = Harness::new(&[]);
    let err = ProxySession::accept(h.context(), Peer::client().open(b"")).err().unwrap();
    assert_eq!(err, StreamError::RouteResolution { stream_id: FRONT_INITIAL });
    assert_eq!(summary(&h.frontend.take()), vec![(FrameKind::Reset, FRONT_INITIAL)]);
    assert!(h.backend.is_empty());
    assert_eq!(h.faults.categories(), vec![FaultCategory::Route]);
}

#[test]
fn denied_authorization_resets_frontend() {
    let mut h = Harness::new(&[30]);
    h.resolver = h.resolver.clone().denying(42);
    let open = Frame::open(Peer::client().header().with_authorization(42), 0, Default::default());
    assert!(ProxySession::accept(h.context(), open).is_err());
    assert_eq!(summary(&h.frontend.take()), vec![(FrameKind::Reset, FRONT_INITIAL)]);
}

#[test]
fn refused_open_translation_resets_frontend() {
    let h = Harness::with_adapter(&[30], Arc::new(PickyAdapter));
    let err = ProxySession::accept(h.context(), Peer::client().open(b"reject")).err().unwrap();
    assert!(matches!(err, StreamError::Translation { stream_id: 1, .. }));
    assert_eq!(summary(&h.frontend.take()), vec![(FrameKind::Reset, FRONT_INITIAL)]);
    assert!(h.backend.is_empty());
    assert_eq!(h.faults.categories(), vec![FaultCategory::Translation]);
}

#[test]
fn refused_unit_translation_aborts_exchange() {
    let h = Harness::with_adapter(&[30], Arc::new(PickyAdapter));
    let (mut session, mut client, _) = h.established(100);

    let err = session.on_frame(client.data(DataFlags::WHOLE, b"so bad")).unwrap_err();
    assert_eq!(err.category(), FaultCategory::Translation);
    let back = summary(&h.backend.take());
    assert_eq!(back, vec![(FrameKind::Abort, 3)]);
    assert!(session.is_terminated());
}

#[test]
fn refused_signal_aborts_exchange() {
    let h = Harness::with_adapter(&[30], Arc::new(PickyAdapter));
    let (mut session, client, _) = h.established(100);

    session.on_frame(Frame::signal(client.header(), 7, Default::default())).unwrap();
    assert!(h.frontend.is_empty());
    let err = session.on_frame(Frame::signal(client.header(), 0, Default::default())).unwrap_err();
    assert_eq!(err.category(), FaultCategory::Translation);
    assert!(session.is_terminated());
}

#[test]
fn data_before_window_is_a_protocol_fault() {
    let h = Harness::new(&[30]);
    let mut session = h.accept();
    let mut client = Peer::client();

    let err = session.on_frame(client.data(DataFlags::WHOLE, b"early")).unwrap_err();
    assert!(matches!(
        err,
        StreamError::ProtocolFault { violation: Violation::UnexpectedFrame, .. }
    ));
    assert!(session.is_terminated());
}

#[test]
fn fragment_sequence_violations() {
    let h = Harness::new(&[30]);
    let (mut session, mut client, _) = h.established(100);
    let err = session.on_frame(client.data(DataFlags::FIN, b"x")).unwrap_err();
    assert!(matches!(err, StreamError::ProtocolFault { violation: Violation::MissingInit, .. }));

    let (mut session, mut client, _) = h.established(100);
    session.on_frame(client.data(DataFlags::INIT, b"x")).unwrap();
    let err = session.on_frame(client.data(DataFlags::INIT, b"y")).unwrap_err();
    assert!(matches!(err, StreamError::ProtocolFault { violation: Violation::UnexpectedInit, .. }));

    let (mut session, mut client, _) = h.established(100);
    session.on_frame(client.data(DataFlags::INIT, b"x")).unwrap();
    let err = session.on_frame(client.close()).unwrap_err();
    assert!(matches!(err, StreamError::ProtocolFault { violation: Violation::IncompleteUnit, .. }));
    assert_eq!(h.pool.in_use(), 0);
}

#[test]
fn frames_in_wrong_direction_rejected() {
    let h = Harness::new(&[30]);
    let (mut session, client, _) = h.established(100);
    let err = session.on_frame(Frame::credit(client.header(), 0)).unwrap_err();
    assert!(matches!(
        err,
        StreamError::ProtocolFault { violation: Violation::UnexpectedFrame, .. }
    ));
    assert!(session.is_terminated());
}

#[test]
fn settings_follow_config() {
    let config = SessionConfig { max_held_bytes: 10, max_window: 20 };
    let settings = SessionSettings::from_config(&config);
    assert_eq!(settings.max_held_bytes, 10);
    assert_eq!(settings.max_window, 20);
}

#[test]
fn sequence_overflow_is_a_protocol_fault() {
    let h = Harness::new(&[30]);
    let (mut session, client, _) = h.established(100);

    let header = client.header().with_budget(u64::MAX, client.acknowledge, client.maximum);
    let frame = Frame::data(header, DataFlags::WHOLE, bytes::Bytes::from_static(b"x"));
    let err = session.on_frame(frame).unwrap_err();
    assert!(matches!(
        err,
        StreamError::ProtocolFault {
            stream_id: 1,
            violation: Violation::WindowExceeded { reserved: 1, available: 0 },
            ..
        }
    ));
    assert!(session.is_terminated());
    assert!(h.backend.take().iter().all(|f| f.kind() != FrameKind::Data));
    assert_eq!(h.faults.categories(), vec![FaultCategory::Protocol]);
}

#[test]
fn open_near_end_of_sequence_space() {
    let h = Harness::new(&[30]);
    let header = Peer::client().header().with_budget(u64::MAX - 1, 0, 0);
    let open = Frame::open(header, 0, Default::default());
    let mut session = ProxySession::accept(h.context(), open).unwrap();
    let mut binit = Harness::backend_peers(&session)[0].0;

    session.on_frame(binit.credit(50)).unwrap();
    assert!(!session.is_terminated());
    assert!(h.faults.is_empty());
}
