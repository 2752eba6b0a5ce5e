//! Transactional outcomes: unsettled transactional dispositions and their
//! resolution at discharge.

mod common;

use common::{engine, transfer};
use linkflow::{DeliveryState, Outcome, ReceiverOptions, Role, SessionOptions};

const REMOTE: u32 = 5;

#[tokio::test]
async fn committed_transaction_settles_with_the_staged_outcome() {
    let mut peer = engine(SessionOptions::default());
    let receiver = peer
        .open_attached_receiver(
            "inbox",
            ReceiverOptions::default().with_auto_accept(false),
            REMOTE,
        )
        .await;

    peer.feed(transfer(REMOTE, Some(0), b"txn payload", false, false)).await;
    let mut delivery = receiver.receive().await.expect("delivery");

    let txn = peer.session.begin_transaction().await.expect("declared");
    txn.accept(&mut delivery).await.expect("staged");

    let staged = peer.expect_disposition().await;
    assert_eq!(staged.role, Role::Receiver);
    assert_eq!(staged.first, 0);
    assert!(!staged.settled);
    match staged.state {
        Some(DeliveryState::Transactional { txn_id, outcome }) => {
            assert_eq!(&txn_id[..], txn.id().as_slice());
            assert_eq!(outcome, Some(Outcome::Accepted));
        }
        other => panic!("expected transactional state, got {other:?}"),
    }

    txn.commit().await.expect("discharged");

    let settled = peer.expect_disposition().await;
    assert!(settled.settled);
    assert!(matches!(settled.state, Some(DeliveryState::Accepted)));

    let state = delivery.await_settlement().await.expect("resolved");
    assert!(state.is_accepted());
}

#[tokio::test]
async fn rolled_back_transaction_releases_covered_deliveries() {
    let mut peer = engine(SessionOptions::default());
    let receiver = peer
        .open_attached_receiver(
            "inbox",
            ReceiverOptions::default().with_auto_accept(false),
            REMOTE,
        )
        .await;

    peer.feed(transfer(REMOTE, Some(0), b"doomed", false, false)).await;
    let mut delivery = receiver.receive().await.expect("delivery");

    let txn = peer.session.begin_transaction().await.expect("declared");
    txn.reject(&mut delivery, "app:bad-payload", "checksum mismatch")
        .await
        .expect("staged");

    let staged = peer.expect_disposition().await;
    match staged.state {
        Some(DeliveryState::Transactional { outcome, .. }) => {
            let outcome = outcome.expect("outcome staged");
            assert_eq!(outcome.condition(), Some("app:bad-payload"));
            assert_eq!(outcome.description(), Some("checksum mismatch"));
        }
        other => panic!("expected transactional state, got {other:?}"),
    }

    txn.rollback().await.expect("discharged");

    let settled = peer.expect_disposition().await;
    assert!(settled.settled);
    assert!(matches!(settled.state, Some(DeliveryState::Released)));

    let state = delivery.await_settlement().await.expect("resolved");
    assert!(state.is_released());
}

#[tokio::test]
async fn transactions_get_distinct_identifiers() {
    let peer = engine(SessionOptions::default());
    let first = peer.session.begin_transaction().await.expect("declared");
    let second = peer.session.begin_transaction().await.expect("declared");
    assert_ne!(first.id(), second.id());
}
