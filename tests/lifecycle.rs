//! Link detach handshakes, remote closure, and operation deadlines.

mod common;

use std::time::Duration;

use common::{engine, engine_with};
use linkflow::{
    CloseScope,
    ConnectionOptions,
    Detach,
    EngineError,
    ErrorCondition,
    LinkHandle,
    ReceiverOptions,
    SessionFrame,
    SessionOptions,
};

const REMOTE: u32 = 21;

#[tokio::test]
async fn close_completes_on_the_peer_echo_and_is_idempotent() {
    let mut peer = engine(SessionOptions::default());
    let receiver = peer
        .open_attached_receiver("inbox", ReceiverOptions::default(), REMOTE)
        .await;

    let close_fut = receiver.close();
    tokio::pin!(close_fut);
    assert!(futures::poll!(close_fut.as_mut()).is_pending());

    let detach = peer.expect_detach().await;
    assert!(detach.closed);
    assert!(detach.error.is_none());

    peer.feed(SessionFrame::Detach(Detach {
        handle: LinkHandle(REMOTE),
        closed: true,
        error: None,
    }))
    .await;
    close_fut.await.expect("close completed");

    // Closing again succeeds without another handshake.
    receiver.close().await.expect("idempotent close");
    tokio::task::yield_now().await;
    peer.no_frame();
}

#[tokio::test]
async fn unsolicited_remote_close_is_echoed_and_surfaces_the_error() {
    let mut peer = engine(SessionOptions::default());
    let receiver = peer
        .open_attached_receiver("inbox", ReceiverOptions::default(), REMOTE)
        .await;

    peer.feed(SessionFrame::Detach(Detach {
        handle: LinkHandle(REMOTE),
        closed: true,
        error: Some(ErrorCondition::new("amqp:resource-deleted")),
    }))
    .await;

    let echo = peer.expect_detach().await;
    assert!(echo.closed);
    assert!(echo.error.is_none());

    let err = receiver.receive().await.expect_err("link is gone");
    match err {
        EngineError::RemotelyClosed { scope, error } => {
            assert_eq!(scope, CloseScope::Link);
            let error = error.expect("condition carried");
            assert_eq!(error.condition, "amqp:resource-deleted");
        }
        other => panic!("expected remote closure, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn receive_times_out_past_the_link_deadline() {
    let mut peer = engine(SessionOptions::default());
    let receiver = peer
        .open_attached_receiver(
            "inbox",
            ReceiverOptions::default().with_operation_timeout(Duration::from_millis(100)),
            REMOTE,
        )
        .await;

    let err = receiver.receive().await.expect_err("nothing arrives");
    assert!(matches!(err, EngineError::Timeout));
}

#[tokio::test(start_paused = true)]
async fn connection_deadline_applies_when_the_link_sets_none() {
    let mut peer = engine_with(
        ConnectionOptions::default().with_operation_timeout(Duration::from_millis(50)),
        SessionOptions::default(),
    );
    let receiver = peer
        .open_attached_receiver("inbox", ReceiverOptions::default(), REMOTE)
        .await;

    let err = receiver.receive().await.expect_err("nothing arrives");
    assert!(matches!(err, EngineError::Timeout));
}

#[tokio::test]
async fn session_close_fails_pending_operations() {
    let mut peer = engine(SessionOptions::default());
    let receiver = peer
        .open_attached_receiver("inbox", ReceiverOptions::default(), REMOTE)
        .await;

    let recv_fut = receiver.receive();
    tokio::pin!(recv_fut);
    assert!(futures::poll!(recv_fut.as_mut()).is_pending());

    peer.session.close();
    let err = recv_fut.await.expect_err("session shut down");
    assert!(matches!(err, EngineError::Io(_)));
}

#[tokio::test]
async fn losing_the_transport_fails_the_session() {
    let mut peer = engine(SessionOptions::default());
    let receiver = peer
        .open_attached_receiver("inbox", ReceiverOptions::default(), REMOTE)
        .await;

    let recv_fut = receiver.receive();
    tokio::pin!(recv_fut);
    assert!(futures::poll!(recv_fut.as_mut()).is_pending());

    drop(peer.to_engine);
    let err = recv_fut.await.expect_err("transport gone");
    assert!(matches!(err, EngineError::Io(_)));
}
