//! Application-facing session and link handles.
//!
//! Handles are thin: every operation is a [`Command`] enqueued to the
//! session task plus an awaited `oneshot` reply, bounded by the timeout
//! resolved most-specific-first through [`resolve_timeout`].

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::{Command, with_deadline};
use crate::{
    config::{
        ConnectionOptions, ReceiverOptions, SenderOptions, SessionOptions, StreamReceiverOptions,
        StreamSenderOptions, resolve_timeout,
    },
    delivery::Delivery,
    delivery_state::DeliveryState,
    error::{EngineError, Result},
    frames::{DeliveryNumber, ErrorCondition, Fields, LinkHandle, Terminus},
    link::{AttachState, AttachedInfo},
    message::{Section, SectionCodec, encode_sections},
    stream::StreamSender,
    txn::{Transaction, TransactionId},
};

pub(crate) async fn send_command(
    cmd_tx: &mpsc::Sender<Command>,
    command: Command,
) -> Result<()> {
    cmd_tx
        .send(command)
        .await
        .map_err(|_| EngineError::Io("session task stopped".to_owned()))
}

pub(crate) async fn await_reply<T>(reply: oneshot::Receiver<Result<T>>) -> Result<T> {
    reply
        .await
        .map_err(|_| EngineError::Io("session task stopped".to_owned()))?
}

/// Wait until the attach handshake resolves, within `deadline`.
pub(crate) async fn await_attached(
    attach_rx: &mut watch::Receiver<AttachState>,
    deadline: Option<Duration>,
) -> Result<AttachedInfo> {
    with_deadline(deadline, async {
        let state = attach_rx
            .wait_for(|state| !matches!(state, AttachState::Pending))
            .await
            .map_err(|_| EngineError::Io("session task stopped".to_owned()))?;
        match &*state {
            AttachState::Attached(info) => Ok((**info).clone()),
            AttachState::Failed(err) => Err(err.clone()),
            AttachState::Pending => Err(EngineError::IllegalState("attach still pending")),
        }
    })
    .await
}

/// Handle to a running session task.
///
/// Cloneable; links opened from any clone share the session's window and
/// frame ordering.
#[derive(Clone)]
pub struct Session {
    cmd_tx: mpsc::Sender<Command>,
    shutdown: CancellationToken,
    connection: ConnectionOptions,
    options: SessionOptions,
    codec: Arc<dyn SectionCodec>,
}

impl Session {
    pub(crate) fn new(
        cmd_tx: mpsc::Sender<Command>,
        shutdown: CancellationToken,
        connection: ConnectionOptions,
        options: SessionOptions,
        codec: Arc<dyn SectionCodec>,
    ) -> Self {
        Self {
            cmd_tx,
            shutdown,
            connection,
            options,
            codec,
        }
    }

    fn link_timeout(&self, link: Option<Duration>) -> Option<Duration> {
        resolve_timeout(
            None,
            link,
            self.options.operation_timeout,
            self.connection.operation_timeout,
        )
    }

    /// Open a receiving link to `address`.
    ///
    /// Returns as soon as the local attach is queued; use
    /// [`Receiver::attached`] to wait for the peer.
    ///
    /// # Errors
    ///
    /// Fails when the session has already closed.
    pub async fn open_receiver(
        &self,
        address: impl Into<String>,
        options: ReceiverOptions,
    ) -> Result<Receiver> {
        self.attach_receiver(Terminus::with_address(address), options, None)
            .await
    }

    /// Open a receiving link with a dynamically created source node.
    ///
    /// The peer-assigned address is available from
    /// [`Receiver::remote_address`] once attached.
    ///
    /// # Errors
    ///
    /// Fails when the session has already closed.
    pub async fn open_dynamic_receiver(&self, options: ReceiverOptions) -> Result<Receiver> {
        self.attach_receiver(Terminus::dynamic(), options, None).await
    }

    /// Open a receiving link whose deliveries surface on their first frame,
    /// for chunked reads of large messages.
    ///
    /// # Errors
    ///
    /// Fails when the session has already closed.
    pub async fn open_stream_receiver(
        &self,
        address: impl Into<String>,
        options: StreamReceiverOptions,
    ) -> Result<Receiver> {
        self.attach_receiver(
            Terminus::with_address(address),
            options.receiver,
            Some(options.read_buffer_frames),
        )
        .await
    }

    async fn attach_receiver(
        &self,
        source: Terminus,
        options: ReceiverOptions,
        stream_buffer: Option<usize>,
    ) -> Result<Receiver> {
        let (reply_tx, reply_rx) = oneshot::channel();
        send_command(&self.cmd_tx, Command::AttachReceiver {
            source,
            options,
            stream_buffer,
            reply: reply_tx,
        })
        .await?;
        let (link, attach_rx) = await_reply(reply_rx).await?;
        Ok(Receiver {
            link,
            cmd_tx: self.cmd_tx.clone(),
            attach_rx,
            timeout: self.link_timeout(options.operation_timeout),
            drain_timeout: options.drain_timeout,
        })
    }

    /// Open a sending link to `address`.
    ///
    /// # Errors
    ///
    /// Fails when the session has already closed.
    pub async fn open_sender(
        &self,
        address: impl Into<String>,
        options: SenderOptions,
    ) -> Result<Sender> {
        self.attach_sender(Some(Terminus::with_address(address)), options)
            .await
    }

    /// Open a sending link without a target address; each message must carry
    /// its destination in its properties.
    ///
    /// # Errors
    ///
    /// Fails when the session has already closed.
    pub async fn open_anonymous_sender(&self, options: SenderOptions) -> Result<Sender> {
        self.attach_sender(None, options).await
    }

    async fn attach_sender(
        &self,
        target: Option<Terminus>,
        options: SenderOptions,
    ) -> Result<Sender> {
        let (reply_tx, reply_rx) = oneshot::channel();
        send_command(&self.cmd_tx, Command::AttachSender {
            target,
            options,
            reply: reply_tx,
        })
        .await?;
        let (link, attach_rx) = await_reply(reply_rx).await?;
        Ok(Sender {
            link,
            cmd_tx: self.cmd_tx.clone(),
            attach_rx,
            timeout: self.link_timeout(options.operation_timeout),
            codec: Arc::clone(&self.codec),
        })
    }

    /// Open a sending link for streaming messages of unbounded size.
    ///
    /// # Errors
    ///
    /// Fails when the session has already closed.
    pub async fn open_stream_sender(
        &self,
        address: impl Into<String>,
        options: StreamSenderOptions,
    ) -> Result<StreamSender> {
        let sender = self.open_sender(address, options.sender).await?;
        Ok(StreamSender::new(sender, options.flush_threshold))
    }

    /// Declare a transaction on this session.
    ///
    /// # Errors
    ///
    /// Fails when the session has already closed.
    pub async fn begin_transaction(&self) -> Result<Transaction> {
        let (reply_tx, reply_rx) = oneshot::channel();
        send_command(&self.cmd_tx, Command::Declare { reply: reply_tx }).await?;
        let deadline = self.link_timeout(None);
        let id: TransactionId = with_deadline(deadline, await_reply(reply_rx)).await?;
        Ok(Transaction::new(id, self.cmd_tx.clone(), deadline))
    }

    /// Stop the session task; every pending operation fails.
    pub fn close(&self) { self.shutdown.cancel(); }
}

/// Handle to a receiving link.
pub struct Receiver {
    link: LinkHandle,
    cmd_tx: mpsc::Sender<Command>,
    attach_rx: watch::Receiver<AttachState>,
    timeout: Option<Duration>,
    drain_timeout: Option<Duration>,
}

impl Receiver {
    /// Session-local handle of this link.
    #[must_use]
    pub const fn handle(&self) -> LinkHandle { self.link }

    /// Wait for the attach handshake and return the remote attach data.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] past the resolved deadline, or the
    /// failure that ended the attach.
    pub async fn attached(&mut self) -> Result<AttachedInfo> {
        await_attached(&mut self.attach_rx, self.timeout).await
    }

    /// Source terminus granted by the peer.
    ///
    /// # Errors
    ///
    /// See [`attached`](Self::attached).
    pub async fn source(&mut self) -> Result<Option<Terminus>> {
        Ok(self.attached().await?.source)
    }

    /// Peer-assigned address, for dynamic sources.
    ///
    /// # Errors
    ///
    /// See [`attached`](Self::attached).
    pub async fn remote_address(&mut self) -> Result<Option<String>> {
        Ok(self
            .attached()
            .await?
            .remote_address()
            .map(str::to_owned))
    }

    /// Peer properties from the remote attach.
    ///
    /// # Errors
    ///
    /// See [`attached`](Self::attached).
    pub async fn peer_properties(&mut self) -> Result<Option<Fields>> {
        Ok(self.attached().await?.properties)
    }

    /// Receive the next delivery, waiting if none is ready.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] past the resolved deadline and
    /// [`EngineError::IllegalState`] when the link is already closed.
    pub async fn receive(&self) -> Result<Delivery> { self.receive_with(self.timeout).await }

    /// Receive with an explicit per-call deadline.
    ///
    /// # Errors
    ///
    /// See [`receive`](Self::receive).
    pub async fn receive_timeout(&self, timeout: Duration) -> Result<Delivery> {
        self.receive_with(Some(timeout)).await
    }

    async fn receive_with(&self, deadline: Option<Duration>) -> Result<Delivery> {
        let (reply_tx, reply_rx) = oneshot::channel();
        send_command(&self.cmd_tx, Command::Receive {
            link: self.link,
            reply: reply_tx,
        })
        .await?;
        with_deadline(deadline, await_reply(reply_rx)).await
    }

    /// Take a ready delivery without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] when the link is already
    /// closed.
    pub async fn try_receive(&self) -> Result<Option<Delivery>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        send_command(&self.cmd_tx, Command::TryReceive {
            link: self.link,
            reply: reply_tx,
        })
        .await?;
        await_reply(reply_rx).await
    }

    /// Completed deliveries waiting to be received.
    ///
    /// # Errors
    ///
    /// Fails only when the session task has stopped.
    pub async fn queued_deliveries(&self) -> Result<usize> {
        let (reply_tx, reply_rx) = oneshot::channel();
        send_command(&self.cmd_tx, Command::QueuedDeliveries {
            link: self.link,
            reply: reply_tx,
        })
        .await?;
        reply_rx
            .await
            .map_err(|_| EngineError::Io("session task stopped".to_owned()))
    }

    /// Grant `credit` additional deliveries to the sender.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] when a credit window manages
    /// this link or a drain is in progress.
    pub async fn add_credit(&self, credit: u32) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        send_command(&self.cmd_tx, Command::AddCredit {
            link: self.link,
            credit,
            reply: reply_tx,
        })
        .await?;
        with_deadline(self.timeout, await_reply(reply_rx)).await
    }

    /// Ask the sender to use or forfeit all outstanding credit, waiting for
    /// its response.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] when a drain is already in
    /// progress and [`EngineError::Timeout`] past the drain deadline.
    pub async fn drain(&self) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        send_command(&self.cmd_tx, Command::Drain {
            link: self.link,
            reply: reply_tx,
        })
        .await?;
        with_deadline(self.drain_timeout.or(self.timeout), await_reply(reply_rx)).await
    }

    /// Detach the link, leaving it resumable by the peer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] past the resolved deadline.
    pub async fn detach(&self) -> Result<()> { self.end(false, None).await }

    /// Close the link permanently. Idempotent once closed either side.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] past the resolved deadline.
    pub async fn close(&self) -> Result<()> { self.end(true, None).await }

    /// Close the link carrying an error condition.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] past the resolved deadline.
    pub async fn close_with_error(
        &self,
        condition: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<()> {
        self.end(
            true,
            Some(ErrorCondition::new(condition).with_description(description)),
        )
        .await
    }

    async fn end(&self, closed: bool, error: Option<ErrorCondition>) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        send_command(&self.cmd_tx, Command::Detach {
            link: self.link,
            closed,
            error,
            reply: reply_tx,
        })
        .await?;
        with_deadline(self.timeout, await_reply(reply_rx)).await
    }
}

/// Outcome tracking for one sent delivery.
pub struct SentDelivery {
    delivery_id: DeliveryNumber,
    settlement: Option<oneshot::Receiver<DeliveryState>>,
    remote_state: Option<DeliveryState>,
    timeout: Option<Duration>,
}

impl SentDelivery {
    /// Session-scoped id assigned to the delivery.
    #[must_use]
    pub const fn delivery_id(&self) -> DeliveryNumber { self.delivery_id }

    /// Wait for the receiving peer's terminal outcome.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] for settled sends, which have
    /// no outcome to wait for, and [`EngineError::Timeout`] past the
    /// resolved deadline.
    pub async fn await_settlement(&mut self) -> Result<&DeliveryState> {
        if let Some(settlement) = self.settlement.take() {
            let state = with_deadline(self.timeout, async {
                settlement
                    .await
                    .map_err(|_| EngineError::Io("session task stopped".to_owned()))
            })
            .await?;
            self.remote_state = Some(state);
        }
        self.remote_state
            .as_ref()
            .ok_or(EngineError::IllegalState("delivery was sent settled"))
    }
}

/// Handle to a sending link.
pub struct Sender {
    pub(crate) link: LinkHandle,
    pub(crate) cmd_tx: mpsc::Sender<Command>,
    pub(crate) attach_rx: watch::Receiver<AttachState>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) codec: Arc<dyn SectionCodec>,
}

impl Sender {
    /// Session-local handle of this link.
    #[must_use]
    pub const fn handle(&self) -> LinkHandle { self.link }

    /// Wait for the attach handshake and return the remote attach data.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] past the resolved deadline, or the
    /// failure that ended the attach.
    pub async fn attached(&mut self) -> Result<AttachedInfo> {
        await_attached(&mut self.attach_rx, self.timeout).await
    }

    /// Send a pre-encoded payload unsettled, returning outcome tracking.
    ///
    /// Blocks while the link lacks credit or the session lacks outgoing
    /// window.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] past the resolved deadline and the
    /// link's failure once it is closed.
    pub async fn send(&self, payload: Bytes) -> Result<SentDelivery> {
        self.send_with(payload, 0, false).await
    }

    /// Send a pre-encoded payload settled; no outcome will arrive.
    ///
    /// # Errors
    ///
    /// See [`send`](Self::send).
    pub async fn send_settled(&self, payload: Bytes) -> Result<DeliveryNumber> {
        Ok(self.send_with(payload, 0, true).await?.delivery_id)
    }

    /// Encode `sections` with the session codec and send them unsettled.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Decode`] when a section fails to encode; see
    /// [`send`](Self::send) otherwise.
    pub async fn send_sections(&self, sections: &[Section]) -> Result<SentDelivery> {
        let payload = encode_sections(&*self.codec, sections)?;
        self.send_with(payload, 0, false).await
    }

    async fn send_with(
        &self,
        payload: Bytes,
        message_format: u32,
        settled: bool,
    ) -> Result<SentDelivery> {
        let (settlement_tx, settlement_rx) = if settled {
            (None, None)
        } else {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        send_command(&self.cmd_tx, Command::Send {
            link: self.link,
            payload,
            message_format,
            settled,
            settlement: settlement_tx,
            reply: reply_tx,
        })
        .await?;
        let delivery_id = with_deadline(self.timeout, await_reply(reply_rx)).await?;
        Ok(SentDelivery {
            delivery_id,
            settlement: settlement_rx,
            remote_state: None,
            timeout: self.timeout,
        })
    }

    /// Detach the link, leaving it resumable by the peer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] past the resolved deadline.
    pub async fn detach(&self) -> Result<()> { self.end(false).await }

    /// Close the link permanently. Idempotent once closed either side.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] past the resolved deadline.
    pub async fn close(&self) -> Result<()> { self.end(true).await }

    async fn end(&self, closed: bool) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        send_command(&self.cmd_tx, Command::Detach {
            link: self.link,
            closed,
            error: None,
            reply: reply_tx,
        })
        .await?;
        with_deadline(self.timeout, await_reply(reply_rx)).await
    }
}
