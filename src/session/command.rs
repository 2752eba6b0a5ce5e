//! Commands enqueued by application handles for the session task.

use bytes::Bytes;
use tokio::sync::{oneshot, watch};

use crate::{
    config::{ReceiverOptions, SenderOptions},
    delivery::Delivery,
    delivery_state::DeliveryState,
    error::Result,
    frames::{DeliveryNumber, ErrorCondition, LinkHandle, Terminus},
    link::AttachState,
    txn::TransactionId,
};

/// Reply payload of a successful attach command.
pub(crate) type AttachReply = (LinkHandle, watch::Receiver<AttachState>);

/// One application request processed by the session task.
///
/// Every blocking operation carries a `oneshot` responder; the handle side
/// awaits it, wrapped in a `tokio::time::timeout` when a deadline resolves.
pub(crate) enum Command {
    AttachReceiver {
        source: Terminus,
        options: ReceiverOptions,
        /// When set, surface deliveries on their first frame instead of on
        /// completion, buffering up to this many chunks per delivery.
        stream_buffer: Option<usize>,
        reply: oneshot::Sender<Result<AttachReply>>,
    },
    AttachSender {
        target: Option<Terminus>,
        options: SenderOptions,
        reply: oneshot::Sender<Result<AttachReply>>,
    },
    Detach {
        link: LinkHandle,
        closed: bool,
        error: Option<ErrorCondition>,
        reply: oneshot::Sender<Result<()>>,
    },
    AddCredit {
        link: LinkHandle,
        credit: u32,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Ask the sender to use or forfeit all credit; resolves when it does.
    Drain {
        link: LinkHandle,
        reply: oneshot::Sender<Result<()>>,
    },
    Receive {
        link: LinkHandle,
        reply: oneshot::Sender<Result<Delivery>>,
    },
    TryReceive {
        link: LinkHandle,
        reply: oneshot::Sender<Result<Option<Delivery>>>,
    },
    QueuedDeliveries {
        link: LinkHandle,
        reply: oneshot::Sender<usize>,
    },
    Disposition {
        link: LinkHandle,
        delivery_id: DeliveryNumber,
        state: DeliveryState,
        settled: bool,
        /// Absent for fire-and-forget dispositions issued from sync paths.
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    /// A reader consumed buffered payload frames; re-open the incoming
    /// window and forward any chunks held back by a full read buffer.
    FramesConsumed {
        link: LinkHandle,
        delivery_id: DeliveryNumber,
        frames: u32,
    },
    /// A delivery handle was dropped, possibly with frames unread.
    DeliveryDropped {
        link: LinkHandle,
        delivery_id: DeliveryNumber,
        had_local_state: bool,
    },
    Send {
        link: LinkHandle,
        payload: Bytes,
        message_format: u32,
        settled: bool,
        settlement: Option<oneshot::Sender<DeliveryState>>,
        reply: oneshot::Sender<Result<DeliveryNumber>>,
    },
    /// Reserve the sender's single streaming-message slot.
    BeginStream {
        link: LinkHandle,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Release a reserved streaming slot that never reached the wire.
    AbandonStream {
        link: LinkHandle,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Emit one chunk of the active streaming message.
    StreamWrite {
        link: LinkHandle,
        payload: Bytes,
        message_format: u32,
        more: bool,
        aborted: bool,
        reply: oneshot::Sender<Result<DeliveryNumber>>,
    },
    Declare {
        reply: oneshot::Sender<Result<TransactionId>>,
    },
    Discharge {
        txn_id: TransactionId,
        fail: bool,
        reply: oneshot::Sender<Result<()>>,
    },
}
