//! Multi-frame reassembly and delivery consumption through the engine.

mod common;

use bytes::Bytes;
use common::{aborted_transfer, engine, transfer};
use linkflow::{
    BincodeSectionCodec,
    DeliveryState,
    EngineError,
    ReceiverOptions,
    Section,
    SessionFrame,
    SessionOptions,
    message::encode_sections,
    reassembly::{DeliveryBuffer, DeliveryProgress},
};
use proptest::prelude::*;

const REMOTE: u32 = 7;

fn section_payload(body: &[u8]) -> Bytes {
    encode_sections(&BincodeSectionCodec, &[Section::Data(Bytes::copy_from_slice(body))])
        .expect("encode payload")
}

#[tokio::test]
async fn split_delivery_reassembles_in_arrival_order() {
    let mut peer = engine(SessionOptions::default());
    let receiver = peer
        .open_attached_receiver("inbox", ReceiverOptions::default(), REMOTE)
        .await;

    let payload = section_payload(b"hello, split world");
    let (head, rest) = payload.split_at(5);
    let (mid, tail) = rest.split_at(7);
    peer.feed(transfer(REMOTE, Some(0), head, true, true)).await;
    peer.feed(transfer(REMOTE, None, mid, true, true)).await;
    peer.feed(transfer(REMOTE, None, tail, false, true)).await;

    let mut delivery = receiver.receive().await.expect("delivery completed");
    assert_eq!(delivery.delivery_id(), 0);
    assert!(delivery.is_completed());
    let message = delivery.message().await.expect("decodes");
    let body = message.body().expect("decode").expect("body present");
    assert_eq!(body, &Section::Data(Bytes::from_static(b"hello, split world")));
}

#[tokio::test]
async fn raw_read_returns_chunks_then_end_of_stream() {
    let mut peer = engine(SessionOptions::default());
    let receiver = peer
        .open_attached_receiver("inbox", ReceiverOptions::default(), REMOTE)
        .await;

    peer.feed(transfer(REMOTE, Some(0), b"ab", true, true)).await;
    peer.feed(transfer(REMOTE, None, b"cd", false, true)).await;

    let mut delivery = receiver.receive().await.expect("delivery completed");
    assert_eq!(delivery.raw_read().await.expect("chunk"), Some(Bytes::from_static(b"ab")));
    assert_eq!(delivery.raw_read().await.expect("chunk"), Some(Bytes::from_static(b"cd")));
    assert_eq!(delivery.raw_read().await.expect("end"), None);
}

#[tokio::test]
async fn consumption_mode_is_exclusive() {
    let mut peer = engine(SessionOptions::default());
    let receiver = peer
        .open_attached_receiver("inbox", ReceiverOptions::default(), REMOTE)
        .await;

    peer.feed(transfer(REMOTE, Some(0), &section_payload(b"one"), false, true))
        .await;
    peer.feed(transfer(REMOTE, Some(1), &section_payload(b"two"), false, true))
        .await;

    let mut first = receiver.receive().await.expect("delivery");
    first.message().await.expect("decoded view");
    let err = first.raw_read().await.expect_err("mode already chosen");
    assert!(matches!(err, EngineError::IllegalState(_)));
    // Repeating the chosen mode stays fine.
    first.message().await.expect("cached view");

    let mut second = receiver.receive().await.expect("delivery");
    second.raw_read().await.expect("raw chunk");
    let err = second.message().await.expect_err("mode already chosen");
    assert!(matches!(err, EngineError::IllegalState(_)));
}

#[tokio::test]
async fn abort_voids_accumulated_payload() {
    let mut peer = engine(SessionOptions::default());
    let receiver = peer
        .open_attached_receiver(
            "inbox",
            ReceiverOptions::default().with_credit_window(4),
            REMOTE,
        )
        .await;

    peer.feed(transfer(REMOTE, Some(0), b"doomed", true, true)).await;
    peer.feed(aborted_transfer(REMOTE)).await;
    // A later delivery on the same link is unaffected.
    peer.feed(transfer(REMOTE, Some(1), &section_payload(b"ok"), false, true))
        .await;

    let mut delivery = receiver.receive().await.expect("delivery");
    assert_eq!(delivery.delivery_id(), 1);
    let message = delivery.message().await.expect("decodes");
    assert_eq!(
        message.body().expect("decode"),
        Some(&Section::Data(Bytes::from_static(b"ok")))
    );
}

#[tokio::test]
async fn dropping_an_unsettled_delivery_releases_it() {
    let mut peer = engine(SessionOptions::default());
    let receiver = peer
        .open_attached_receiver(
            "inbox",
            ReceiverOptions::default().with_auto_accept(false),
            REMOTE,
        )
        .await;

    peer.feed(transfer(REMOTE, Some(0), &section_payload(b"unwanted"), false, false))
        .await;
    let delivery = receiver.receive().await.expect("delivery");
    drop(delivery);

    let disposition = peer.expect_disposition().await;
    assert_eq!(disposition.first, 0);
    assert!(disposition.settled);
    assert!(matches!(disposition.state, Some(DeliveryState::Released)));
}

#[tokio::test]
async fn auto_accept_settles_once_and_drop_stays_silent() {
    let mut peer = engine(SessionOptions::default());
    let receiver = peer
        .open_attached_receiver("inbox", ReceiverOptions::default(), REMOTE)
        .await;

    peer.feed(transfer(REMOTE, Some(0), &section_payload(b"kept"), false, false))
        .await;

    let mut delivery = receiver.receive().await.expect("delivery");
    let disposition = peer.expect_disposition().await;
    assert_eq!(disposition.first, 0);
    assert!(disposition.settled);
    assert!(matches!(disposition.state, Some(DeliveryState::Accepted)));
    // The settlement future resolves with the same outcome.
    let state = delivery.await_settlement().await.expect("settled");
    assert!(state.is_accepted());

    // Dropping the accepted delivery must not settle it again.
    drop(delivery);
    receiver.queued_deliveries().await.expect("engine alive");
    while let Ok(frame) = peer.from_engine.try_recv() {
        assert!(
            matches!(frame, SessionFrame::Flow(_)),
            "unexpected frame after drop: {}",
            frame.kind()
        );
    }
}

#[tokio::test]
async fn oversized_delivery_closes_the_link_with_an_error() {
    let options = SessionOptions {
        max_delivery_size: std::num::NonZeroUsize::new(8).expect("non-zero"),
        ..SessionOptions::default()
    };
    let mut peer = engine(options);
    let receiver = peer
        .open_attached_receiver("inbox", ReceiverOptions::default(), REMOTE)
        .await;

    peer.feed(transfer(REMOTE, Some(0), b"too big for the cap", false, true))
        .await;

    let detach = peer.expect_detach().await;
    assert!(detach.closed);
    let error = detach.error.expect("condition attached");
    assert_eq!(error.condition, "amqp:link:message-size-exceeded");

    let err = receiver.receive().await.expect_err("link failed");
    assert!(matches!(err, EngineError::IllegalState(_)));
}

proptest! {
    /// Any split of a payload into transfer frames reassembles to the
    /// original bytes.
    #[test]
    fn any_chunking_reassembles_to_original(
        payload in proptest::collection::vec(any::<u8>(), 1..512),
        cuts in proptest::collection::vec(any::<prop::sample::Index>(), 0..6),
    ) {
        let mut offsets: Vec<usize> = cuts.iter().map(|i| i.index(payload.len())).collect();
        offsets.push(0);
        offsets.push(payload.len());
        offsets.sort_unstable();
        offsets.dedup();

        let cap = std::num::NonZeroUsize::new(1024).expect("non-zero");
        let mut buffer = DeliveryBuffer::new(0, cap);
        for window in offsets.windows(2) {
            let chunk = Bytes::copy_from_slice(&payload[window[0]..window[1]]);
            let more = window[1] < payload.len();
            let progress = buffer.push(chunk, more, false).expect("accepted");
            if more {
                prop_assert_eq!(progress, DeliveryProgress::Accumulating);
            } else {
                prop_assert_eq!(progress, DeliveryProgress::Complete);
            }
        }
        prop_assert!(buffer.is_complete());
        prop_assert_eq!(buffer.into_bytes(), Bytes::from(payload));
    }
}
