//! Credit window replenishment and drain behaviour through the session
//! engine.

mod common;

use common::{aborted_transfer, engine, transfer};
use linkflow::{
    EngineError,
    Flow,
    LinkHandle,
    ReceiverOptions,
    SessionFrame,
    SessionOptions,
};
use rstest::rstest;

const REMOTE: u32 = 40;

#[rstest]
#[case(1)]
#[case(10)]
#[case(64)]
#[tokio::test]
async fn windowed_receiver_advertises_full_window_on_attach(#[case] window: u32) {
    let mut peer = engine(SessionOptions::default());
    let receiver = peer
        .session
        .open_receiver("inbox", ReceiverOptions::default().with_credit_window(window))
        .await
        .expect("attach queued");
    let attach = peer.answer_attach(REMOTE).await;
    assert_eq!(attach.source.as_ref().and_then(|s| s.address.as_deref()), Some("inbox"));

    let flow = peer.expect_flow().await;
    assert_eq!(flow.handle, Some(receiver.handle()));
    assert_eq!(flow.link_credit, Some(window));
    assert_eq!(flow.delivery_count, Some(0));
    assert!(!flow.drain);
}

#[tokio::test]
async fn hysteresis_replenishes_on_every_third_consumed_delivery() {
    let mut peer = engine(SessionOptions::default());
    let receiver = peer
        .open_attached_receiver("inbox", ReceiverOptions::default().with_credit_window(10), REMOTE)
        .await;

    // Ten settled single-frame deliveries arrive up front.
    for id in 0..10u32 {
        peer.feed(transfer(REMOTE, Some(id), b"payload", false, true)).await;
    }

    let mut kept = Vec::new();
    let mut flows = Vec::new();
    for _ in 0..10 {
        kept.push(receiver.receive().await.expect("delivery ready"));
        // Give the engine a chance to emit, then record whether it did.
        tokio::task::yield_now().await;
        flows.push(peer.from_engine.try_recv().ok());
    }

    let pattern: Vec<bool> = flows.iter().map(Option::is_some).collect();
    assert_eq!(
        pattern,
        vec![false, false, true, false, false, true, false, false, true, false]
    );
    let credits: Vec<u32> = flows
        .into_iter()
        .flatten()
        .map(|frame| match frame {
            SessionFrame::Flow(Flow {
                link_credit: Some(credit),
                ..
            }) => credit,
            other => panic!("expected link flow, got {other:?}"),
        })
        .collect();
    // Each top-up restores outstanding credit to the full window.
    assert_eq!(credits, vec![3, 6, 9]);
}

#[tokio::test]
async fn add_credit_is_rejected_on_a_windowed_link() {
    let mut peer = engine(SessionOptions::default());
    let receiver = peer
        .open_attached_receiver("inbox", ReceiverOptions::default().with_credit_window(5), REMOTE)
        .await;

    let err = receiver.add_credit(1).await.expect_err("window manages credit");
    assert!(matches!(err, EngineError::IllegalState(_)));
}

#[tokio::test]
async fn manual_credit_flows_and_drain_excludes_add_credit() {
    let mut peer = engine(SessionOptions::default());
    let receiver = peer
        .open_attached_receiver("inbox", ReceiverOptions::default().with_manual_credit(), REMOTE)
        .await;

    receiver.add_credit(4).await.expect("credit granted");
    let flow = peer.expect_flow().await;
    assert_eq!(flow.link_credit, Some(4));

    // Drain holds further credit grants until the peer answers.
    let drain_fut = receiver.drain();
    tokio::pin!(drain_fut);
    assert!(futures::poll!(drain_fut.as_mut()).is_pending());
    let flow = peer.expect_flow().await;
    assert!(flow.drain);
    assert_eq!(flow.link_credit, Some(4));

    let err = receiver.add_credit(1).await.expect_err("drain in progress");
    assert!(matches!(err, EngineError::IllegalState(_)));

    // Peer forfeits the credit: delivery count advances, credit zeroes.
    peer.feed(SessionFrame::Flow(Flow {
        next_incoming_id: Some(0),
        incoming_window: 10,
        next_outgoing_id: 0,
        outgoing_window: 0,
        handle: Some(LinkHandle(REMOTE)),
        delivery_count: Some(4),
        link_credit: Some(0),
        available: None,
        drain: true,
        echo: false,
        properties: None,
    }))
    .await;
    drain_fut.await.expect("drain completed");

    // With the drain resolved, credit may be granted again.
    receiver.add_credit(2).await.expect("credit granted");
    let flow = peer.expect_flow().await;
    assert_eq!(flow.link_credit, Some(2));
}

#[tokio::test]
async fn drain_ignores_flows_without_credit_state() {
    let mut peer = engine(SessionOptions::default());
    let receiver = peer
        .open_attached_receiver("inbox", ReceiverOptions::default().with_manual_credit(), REMOTE)
        .await;

    receiver.add_credit(4).await.expect("credit granted");
    peer.expect_flow().await;

    let drain_fut = receiver.drain();
    tokio::pin!(drain_fut);
    assert!(futures::poll!(drain_fut.as_mut()).is_pending());
    peer.expect_flow().await;

    // A flow that omits delivery-count and credit says nothing about the
    // sender's drain progress; the request must stay outstanding.
    peer.feed(SessionFrame::Flow(Flow {
        next_incoming_id: Some(0),
        incoming_window: 10,
        next_outgoing_id: 0,
        outgoing_window: 0,
        handle: Some(LinkHandle(REMOTE)),
        delivery_count: None,
        link_credit: None,
        available: None,
        drain: true,
        echo: false,
        properties: None,
    }))
    .await;
    receiver.queued_deliveries().await.expect("engine alive");
    assert!(futures::poll!(drain_fut.as_mut()).is_pending());

    // The real answer carries the forfeited credit state.
    peer.feed(SessionFrame::Flow(Flow {
        next_incoming_id: Some(0),
        incoming_window: 10,
        next_outgoing_id: 0,
        outgoing_window: 0,
        handle: Some(LinkHandle(REMOTE)),
        delivery_count: Some(4),
        link_credit: Some(0),
        available: None,
        drain: true,
        echo: false,
        properties: None,
    }))
    .await;
    drain_fut.await.expect("drain completed");
}

#[tokio::test]
async fn aborted_delivery_tops_up_credit_and_restores_window() {
    let mut peer = engine(SessionOptions::default());
    let receiver = peer
        .open_attached_receiver("inbox", ReceiverOptions::default().with_credit_window(10), REMOTE)
        .await;

    peer.feed(transfer(REMOTE, Some(0), b"partial", true, true)).await;
    peer.feed(aborted_transfer(REMOTE)).await;

    let flow = peer.expect_flow().await;
    assert_eq!(flow.handle, Some(receiver.handle()));
    assert_eq!(flow.link_credit, Some(10));

    // The voided delivery never surfaces.
    assert_eq!(receiver.queued_deliveries().await.expect("count"), 0);
    assert!(receiver.try_receive().await.expect("no delivery").is_none());
}

#[tokio::test]
async fn flow_echo_is_answered_with_current_state() {
    let mut peer = engine(SessionOptions::default());
    let receiver = peer
        .open_attached_receiver("inbox", ReceiverOptions::default().with_credit_window(3), REMOTE)
        .await;

    peer.feed(SessionFrame::Flow(Flow {
        next_incoming_id: Some(0),
        incoming_window: 10,
        next_outgoing_id: 0,
        outgoing_window: 0,
        handle: Some(LinkHandle(REMOTE)),
        delivery_count: None,
        link_credit: None,
        available: None,
        drain: false,
        echo: true,
        properties: None,
    }))
    .await;

    let flow = peer.expect_flow().await;
    assert_eq!(flow.handle, Some(receiver.handle()));
    assert_eq!(flow.link_credit, Some(3));
    assert!(!flow.echo);
}
