use std::sync::Arc;

use relay_conformance::{of_kind, summary, EagerAdapter, Harness, Peer, FRONT_INITIAL};
use relay_stream::{DataFlags, Flow, FrameKind, HalfState, Side};

#[test]
fn eager_unit_released_once_window_granted() {
    let h = Harness::with_adapter(&[30], Arc::new(EagerAdapter));
    let mut session = h.accept();
    let mut binit = Harness::backend_peers(&session)[0].0;
    h.backend.take();

    let mut client = Peer::client();
    session.on_frame(client.data(DataFlags::WHOLE, b"early")).unwrap();
    assert!(h.backend.is_empty());
    assert_eq!(h.pool.in_use(), 1);
    assert_eq!(session.state_of(FRONT_INITIAL), Some(HalfState::Opening));

    session.on_frame(binit.credit(100)).unwrap();
    let data = of_kind(&h.backend.take(), FrameKind::Data, 3);
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].payload(), b"early");
    assert_eq!(h.pool.in_use(), 0);

    let credits = of_kind(&h.frontend.take(), FrameKind::Credit, FRONT_INITIAL);
    assert_eq!(credits.len(), 1);
    client.on_credit(&credits[0]);
    assert_eq!(client.available(), 95);
    assert_eq!(session.state_of(FRONT_INITIAL), Some(HalfState::Open));
}

#[test]
fn second_eager_unit_rejected() {
    let h = Harness::with_adapter(&[30], Arc::new(EagerAdapter));
    let mut session = h.accept();
    let mut client = Peer::client();
    session.on_frame(client.data(DataFlags::WHOLE, b"one")).unwrap();
    assert!(session.on_frame(client.data(DataFlags::WHOLE, b"two")).is_err());
    assert_eq!(h.pool.in_use(), 0);
    assert!(session.is_terminated());
}

#[test]
fn stalled_frontend_withholds_credit() {
    let h = Harness::new(&[30]);
    let mut session = h.accept();
    let mut binit = Harness::backend_peers(&session)[0].0;
    h.backend.take();

    h.frontend.set_backpressure(true);
    session.on_frame(binit.credit(10)).unwrap();
    assert!(session.is_stalled(Side::Frontend));
    let mut client = Peer::client();
    for credit in of_kind(&h.frontend.take(), FrameKind::Credit, FRONT_INITIAL) {
        client.on_credit(&credit);
    }
    assert_eq!(client.available(), 10);

    session.on_frame(client.data(DataFlags::WHOLE, &[1; 10])).unwrap();
    let data = h.backend.take();
    assert_eq!(summary(&data), vec![(FrameKind::Data, 3)]);
    binit.on_data(&data[0]);
    session.on_frame(binit.credit(10)).unwrap();
    assert!(h.frontend.is_empty());

    h.frontend.set_backpressure(false);
    session.on_dispatch_ready(Side::Frontend).unwrap();
    assert!(!session.is_stalled(Side::Frontend));
    let credits = of_kind(&h.frontend.take(), FrameKind::Credit, FRONT_INITIAL);
    assert_eq!(credits.len(), 1);
    assert_eq!(credits[0].header.acknowledge, 10);
}

#[test]
fn stalled_backend_holds_units() {
    let h = Harness::new(&[30]);
    let (mut session, mut client, _) = h.established(100);

    h.backend.set_backpressure(true);
    session.on_frame(client.data(DataFlags::WHOLE, b"first")).unwrap();
    assert!(session.is_stalled(Side::Backend));
    session.on_frame(client.data(DataFlags::WHOLE, b"second")).unwrap();
    assert_eq!(h.backend.take().len(), 1);
    assert_eq!(session.held_bytes(Flow::Initial), 6);

    h.backend.set_backpressure(false);
    session.on_dispatch_ready(Side::Backend).unwrap();
    let data = h.backend.take();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0].payload(), b"second");
    assert_eq!(data[0].header.sequence, 5);
    assert_eq!(session.held_bytes(Flow::Initial), 0);
}

#[tokio::test]
async fn channel_dispatch_drives_a_session() {
    use relay_stream::{channel, ProxySession};

    let h = Harness::new(&[30]);
    let (front, mut front_rx) = channel(8);
    let (back, mut back_rx) = channel(8);
    let mut ctx = h.context();
    ctx.frontend = Arc::new(front);
    ctx.backend = Arc::new(back);

    let mut session = ProxySession::accept(ctx, Peer::client().open(b"")).unwrap();
    let open = back_rx.recv().await.unwrap();
    assert_eq!(open.kind(), FrameKind::Open);

    let mut binit = Harness::backend_peers(&session)[0].0;
    session.on_frame(binit.credit(32)).unwrap();
    let credit = front_rx.recv().await.unwrap();
    assert_eq!(credit.kind(), FrameKind::Credit);
    assert_eq!(credit.header.maximum, 32);
}
