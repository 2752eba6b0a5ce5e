//! Application-facing delivery handle.
//!
//! A [`Delivery`] surfaces one received message: its identity, its payload
//! (complete, or streaming in as transfer frames arrive), and its settlement
//! operations. The payload is consumed in exactly one of two modes, chosen by
//! the first accessor used: decoded [`Message`] sections or a raw byte
//! stream. Requesting the other mode afterwards fails; repeating the same
//! mode is idempotent.

use std::{collections::VecDeque, sync::Arc};

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};

use crate::{
    delivery_state::DeliveryState,
    error::{EngineError, Result},
    frames::{DeliveryNumber, DeliveryTag, LinkHandle},
    message::{Message, SectionCodec},
    session::Command,
};

/// Body data forwarded from the session task to a streaming delivery.
#[derive(Debug)]
pub(crate) enum BodyEvent {
    /// One transfer frame's payload.
    Chunk(Bytes),
    /// Final frame observed; no more chunks follow.
    Completed,
    /// The sender aborted the delivery.
    Aborted,
}

/// Payload source backing a delivery.
enum Body {
    /// Fully reassembled before the delivery was surfaced.
    Complete { chunks: VecDeque<Bytes> },
    /// Chunks still arriving; reads wait on the session task.
    Streaming {
        rx: mpsc::Receiver<BodyEvent>,
        finished: bool,
    },
}

/// Consumption mode chosen by the first accessor.
enum Access {
    Untouched,
    Message(Box<Message>),
    Raw,
}

/// One received delivery.
pub struct Delivery {
    delivery_id: DeliveryNumber,
    delivery_tag: DeliveryTag,
    message_format: u32,
    link: LinkHandle,
    settled: bool,
    aborted: bool,
    completed: bool,
    auto_accept: bool,
    local_state: Option<DeliveryState>,
    remote_state: Option<DeliveryState>,
    settlement: Option<oneshot::Receiver<DeliveryState>>,
    body: Body,
    access: Access,
    cmd_tx: mpsc::Sender<Command>,
    codec: Arc<dyn SectionCodec>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_id", &self.delivery_id)
            .field("settled", &self.settled)
            .field("aborted", &self.aborted)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

/// Inputs the session task uses to construct a delivery.
pub(crate) struct DeliveryParts {
    pub delivery_id: DeliveryNumber,
    pub delivery_tag: DeliveryTag,
    pub message_format: u32,
    pub link: LinkHandle,
    pub settled: bool,
    pub auto_accept: bool,
    pub settlement: Option<oneshot::Receiver<DeliveryState>>,
    pub cmd_tx: mpsc::Sender<Command>,
    pub codec: Arc<dyn SectionCodec>,
}

impl Delivery {
    /// Build a delivery whose payload is already whole.
    pub(crate) fn complete(parts: DeliveryParts, chunks: Vec<Bytes>) -> Self {
        Self::build(parts, Body::Complete {
            chunks: chunks.into(),
        })
        .mark_completed()
    }

    /// Build a delivery whose payload streams in over `rx`.
    pub(crate) fn streaming(parts: DeliveryParts, rx: mpsc::Receiver<BodyEvent>) -> Self {
        Self::build(parts, Body::Streaming {
            rx,
            finished: false,
        })
    }

    fn build(parts: DeliveryParts, body: Body) -> Self {
        Self {
            delivery_id: parts.delivery_id,
            delivery_tag: parts.delivery_tag,
            message_format: parts.message_format,
            link: parts.link,
            settled: parts.settled,
            aborted: false,
            completed: false,
            auto_accept: parts.auto_accept,
            local_state: None,
            remote_state: None,
            settlement: parts.settlement,
            body,
            access: Access::Untouched,
            cmd_tx: parts.cmd_tx,
            codec: parts.codec,
        }
    }

    const fn mark_completed(mut self) -> Self {
        self.completed = true;
        self
    }

    /// Session-scoped delivery id.
    #[must_use]
    pub const fn delivery_id(&self) -> DeliveryNumber { self.delivery_id }

    /// Sender-assigned delivery tag.
    #[must_use]
    pub const fn delivery_tag(&self) -> &DeliveryTag { &self.delivery_tag }

    /// Message format code from the first transfer frame.
    #[must_use]
    pub const fn message_format(&self) -> u32 { self.message_format }

    /// Whether the sender pre-settled this delivery.
    #[must_use]
    pub const fn is_settled(&self) -> bool { self.settled }

    /// Whether the sender aborted this delivery.
    #[must_use]
    pub const fn is_aborted(&self) -> bool { self.aborted }

    /// Whether the final transfer frame has been observed.
    #[must_use]
    pub const fn is_completed(&self) -> bool { self.completed }

    /// Locally applied delivery state, if a disposition was issued.
    #[must_use]
    pub const fn local_state(&self) -> Option<&DeliveryState> { self.local_state.as_ref() }

    /// Remote delivery state, once observed via disposition.
    #[must_use]
    pub const fn remote_state(&self) -> Option<&DeliveryState> { self.remote_state.as_ref() }

    /// Decode the payload as a message, completing the stream first if the
    /// payload is still arriving.
    ///
    /// The decoded view is cached; repeated calls return it. With
    /// auto-accept enabled, a decode failure inside the returned [`Message`]
    /// is the caller's to observe, but requesting the message on an aborted
    /// delivery fails immediately.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] if the raw stream was already
    /// requested, and [`EngineError::DeliveryAborted`] if the delivery
    /// aborted before completing.
    pub async fn message(&mut self) -> Result<&mut Message> {
        match self.access {
            Access::Raw => {
                return Err(EngineError::IllegalState(
                    "raw stream already requested for this delivery",
                ));
            }
            Access::Message(_) => {}
            Access::Untouched => {
                let payload = self.collect_all().await?;
                let mut message = Message::new(payload, Arc::clone(&self.codec));
                // With auto-accept the engine owns the disposition, so a
                // malformed payload is rejected here on its behalf.
                if self.auto_accept
                    && !self.settled
                    && let Err(err) = message.sections()
                {
                    let _ = self
                        .cmd_tx
                        .send(Command::Disposition {
                            link: self.link,
                            delivery_id: self.delivery_id,
                            state: DeliveryState::rejected(
                                "amqp:decode-error",
                                err.to_string(),
                            ),
                            settled: true,
                            reply: None,
                        })
                        .await;
                    return Err(err.into());
                }
                self.access = Access::Message(Box::new(message));
            }
        }
        match &mut self.access {
            Access::Message(message) => Ok(message),
            _ => Err(EngineError::IllegalState("delivery access mode changed")),
        }
    }

    /// Read the next raw payload chunk.
    ///
    /// Returns `Ok(None)` at end of stream. Reads past the currently
    /// available data suspend until more frames arrive. Each chunk handed
    /// out is one transfer frame; its consumption is reported to the
    /// session so the incoming window re-opens frame by frame.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] if message decoding was already
    /// requested, and [`EngineError::DeliveryAborted`] when the sender
    /// aborted the delivery.
    pub async fn raw_read(&mut self) -> Result<Option<Bytes>> {
        match self.access {
            Access::Message(_) => {
                return Err(EngineError::IllegalState(
                    "message decoding already requested for this delivery",
                ));
            }
            Access::Raw | Access::Untouched => self.access = Access::Raw,
        }
        if self.aborted {
            return Err(EngineError::DeliveryAborted);
        }

        let chunk = match &mut self.body {
            Body::Complete { chunks } => chunks.pop_front(),
            Body::Streaming { rx, finished } => {
                if *finished {
                    None
                } else {
                    match rx.recv().await {
                        Some(BodyEvent::Chunk(chunk)) => Some(chunk),
                        Some(BodyEvent::Completed) => {
                            *finished = true;
                            self.completed = true;
                            None
                        }
                        Some(BodyEvent::Aborted) => {
                            *finished = true;
                            self.aborted = true;
                            return Err(EngineError::DeliveryAborted);
                        }
                        // Session task gone; surface as a connection failure.
                        None => {
                            *finished = true;
                            return Err(EngineError::Io(
                                "session closed while reading delivery".to_owned(),
                            ));
                        }
                    }
                }
            }
        };

        if chunk.is_some() {
            self.notify_consumed().await;
        }
        Ok(chunk)
    }

    /// Accept the delivery, settling it.
    ///
    /// # Errors
    ///
    /// Propagates session failures; see [`disposition`](Self::disposition).
    pub async fn accept(&mut self) -> Result<()> {
        self.disposition(DeliveryState::Accepted, true).await
    }

    /// Release the delivery back to the sender.
    ///
    /// # Errors
    ///
    /// Propagates session failures; see [`disposition`](Self::disposition).
    pub async fn release(&mut self) -> Result<()> {
        self.disposition(DeliveryState::Released, true).await
    }

    /// Reject the delivery with an error condition.
    ///
    /// # Errors
    ///
    /// Propagates session failures; see [`disposition`](Self::disposition).
    pub async fn reject(
        &mut self,
        condition: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<()> {
        self.disposition(DeliveryState::rejected(condition, description), true)
            .await
    }

    /// Apply `state` to this delivery and emit the disposition frame.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] if a local state was already
    /// applied, or the session's failure if it has closed.
    pub async fn disposition(&mut self, state: DeliveryState, settled: bool) -> Result<()> {
        if self.local_state.is_some() {
            return Err(EngineError::IllegalState("delivery already has a local state"));
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command::Disposition {
            link: self.link,
            delivery_id: self.delivery_id,
            state: state.clone(),
            settled,
            reply: Some(reply_tx),
        };
        self.cmd_tx
            .send(command)
            .await
            .map_err(|_| EngineError::Io("session task stopped".to_owned()))?;
        reply_rx
            .await
            .map_err(|_| EngineError::Io("session task stopped".to_owned()))??;
        self.local_state = Some(state);
        self.settled = self.settled || settled;
        Ok(())
    }

    /// Wait for the remote peer's terminal disposition.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] when no settlement is pending
    /// (the delivery arrived pre-settled) and a connection failure when the
    /// session stops first.
    pub async fn await_settlement(&mut self) -> Result<&DeliveryState> {
        if let Some(settlement) = self.settlement.take() {
            let state = settlement
                .await
                .map_err(|_| EngineError::Io("session task stopped".to_owned()))?;
            self.remote_state = Some(state);
        }
        self.remote_state
            .as_ref()
            .ok_or(EngineError::IllegalState("delivery has no pending settlement"))
    }

    /// Whether the engine auto-accepts this delivery on consumption.
    #[must_use]
    pub const fn auto_accept(&self) -> bool { self.auto_accept }

    async fn collect_all(&mut self) -> Result<Bytes> {
        if self.aborted {
            return Err(EngineError::DeliveryAborted);
        }
        match &mut self.body {
            Body::Complete { chunks } => {
                let total = chunks.iter().map(Bytes::len).sum();
                let mut buffer = BytesMut::with_capacity(total);
                for chunk in chunks.iter() {
                    buffer.extend_from_slice(chunk);
                }
                Ok(buffer.freeze())
            }
            Body::Streaming { rx, finished } => {
                let mut buffer = BytesMut::new();
                while !*finished {
                    match rx.recv().await {
                        Some(BodyEvent::Chunk(chunk)) => {
                            buffer.extend_from_slice(&chunk);
                            // Per-frame reports release chunks a full read
                            // buffer was holding back.
                            let _ = self
                                .cmd_tx
                                .send(Command::FramesConsumed {
                                    link: self.link,
                                    delivery_id: self.delivery_id,
                                    frames: 1,
                                })
                                .await;
                        }
                        Some(BodyEvent::Completed) => {
                            *finished = true;
                            self.completed = true;
                        }
                        Some(BodyEvent::Aborted) => {
                            *finished = true;
                            self.aborted = true;
                        }
                        None => {
                            *finished = true;
                            return Err(EngineError::Io(
                                "session closed while reading delivery".to_owned(),
                            ));
                        }
                    }
                }
                if self.aborted {
                    return Err(EngineError::DeliveryAborted);
                }
                Ok(buffer.freeze())
            }
        }
    }

    /// Report one consumed payload frame so the session window re-opens.
    async fn notify_consumed(&self) {
        let _ = self
            .cmd_tx
            .send(Command::FramesConsumed {
                link: self.link,
                delivery_id: self.delivery_id,
                frames: 1,
            })
            .await;
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        // Unread frames must still open the session window; the session
        // task also releases the delivery if no disposition was applied.
        let _ = self.cmd_tx.try_send(Command::DeliveryDropped {
            link: self.link,
            delivery_id: self.delivery_id,
            had_local_state: self.local_state.is_some() || self.settled,
        });
    }
}
