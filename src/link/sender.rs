//! Sender-role link state.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tokio::sync::{oneshot, watch};

use super::{AttachState, DeliveryTagGenerator, LinkState};
use crate::{
    config::SenderOptions,
    delivery_state::DeliveryState,
    error::Result,
    frames::{DeliveryNumber, DeliveryTag, LinkHandle},
};

/// One queued outbound write.
///
/// Full-message sends and streaming flushes share the queue so frame
/// emission order matches the order writes were issued.
pub(crate) struct PendingWrite {
    pub payload: Bytes,
    pub message_format: u32,
    pub settled: bool,
    /// More frames follow for the same delivery.
    pub more: bool,
    pub aborted: bool,
    /// Part of the active streaming message rather than a standalone send.
    pub streaming: bool,
    /// Identity assigned when emission started but the outgoing window
    /// closed mid-delivery; the remainder resumes under the same identity.
    pub assigned: Option<(DeliveryNumber, DeliveryTag)>,
    /// Resolver handed back to the caller for the remote outcome.
    pub settlement: Option<oneshot::Sender<DeliveryState>>,
    pub reply: oneshot::Sender<Result<DeliveryNumber>>,
}

/// Lifecycle of the active streaming message on a sender.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StreamPhase {
    /// Begun; no transfer emitted yet.
    Open,
    /// At least one transfer emitted for the current delivery.
    Writing,
}

/// Streaming bookkeeping for a sender link.
pub(crate) struct ActiveStream {
    pub phase: StreamPhase,
    pub delivery_id: Option<DeliveryNumber>,
    pub delivery_tag: Option<DeliveryTag>,
}

/// State for one sending link, owned by the session task.
pub(crate) struct SenderLink {
    pub name: String,
    pub handle: LinkHandle,
    pub remote_handle: Option<LinkHandle>,
    pub state: LinkState,
    pub options: SenderOptions,
    /// Credit granted by the receiving peer.
    pub credit: u32,
    pub delivery_count: u32,
    /// Peer asked us to drain; unused credit must be forfeited.
    pub drain: bool,
    pub attach_tx: watch::Sender<AttachState>,
    pub tags: DeliveryTagGenerator,
    /// Writes waiting for credit or window, in issue order.
    pub pending: VecDeque<PendingWrite>,
    /// Settlement futures for unsettled deliveries in flight.
    pub settlements: HashMap<DeliveryNumber, oneshot::Sender<DeliveryState>>,
    pub pending_detach: Option<oneshot::Sender<Result<()>>>,
    /// The single permitted uncompleted streaming message, if any.
    pub stream: Option<ActiveStream>,
}

impl SenderLink {
    pub(crate) fn new(
        name: String,
        handle: LinkHandle,
        options: SenderOptions,
        attach_tx: watch::Sender<AttachState>,
    ) -> Self {
        Self {
            name,
            handle,
            remote_handle: None,
            state: LinkState::Idle,
            options,
            credit: 0,
            delivery_count: 0,
            drain: false,
            attach_tx,
            tags: DeliveryTagGenerator::default(),
            pending: VecDeque::new(),
            settlements: HashMap::new(),
            pending_detach: None,
            stream: None,
        }
    }

    /// Apply the link-level fields of an inbound flow frame.
    ///
    /// The peer communicates credit as `delivery_count + link_credit`
    /// relative to its view of our delivery count.
    pub(crate) fn on_remote_flow(
        &mut self,
        delivery_count: Option<u32>,
        link_credit: Option<u32>,
        drain: bool,
    ) {
        if let Some(link_credit) = link_credit {
            let remote_count = delivery_count.unwrap_or(0);
            self.credit = remote_count
                .wrapping_add(link_credit)
                .wrapping_sub(self.delivery_count);
        }
        self.drain = drain;
    }

    /// Whether the head of the write queue may be emitted.
    ///
    /// A new delivery needs link credit; continuation frames of an already
    /// started delivery do not. A standalone send is additionally held back
    /// while a streaming message is uncompleted so its frames cannot
    /// interleave with the stream's.
    pub(crate) fn can_emit_head(&self) -> bool {
        let Some(head) = self.pending.front() else {
            return false;
        };
        if head.streaming {
            // Continuations after the first chunk need no fresh credit.
            !matches!(
                self.stream.as_ref().map(|s| s.phase),
                Some(StreamPhase::Open)
            ) || self.credit > 0
        } else {
            self.stream.is_none() && self.credit > 0
        }
    }

    /// Whether a streaming message is currently uncompleted.
    pub(crate) fn stream_active(&self) -> bool { self.stream.is_some() }
}
