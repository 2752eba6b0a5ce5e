//! Streaming message sender.
//!
//! A [`StreamSender`] produces one message at a time; each message moves
//! through a preamble phase, a body phase, and a terminal completed or
//! aborted phase. Body bytes accumulate in a buffer that flushes as a
//! multi-frame transfer chunk whenever it crosses the configured threshold,
//! so a message can exceed any in-memory size.
//!
//! Once an emit fails with a terminal error the message is poisoned: every
//! later operation returns the same failure.

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;

use crate::{
    config::OutputStreamOptions,
    error::{EngineError, Result},
    frames::{DeliveryNumber, Fields, LinkHandle},
    link::AttachedInfo,
    message::{Header, Properties, Section, encode_sections},
    session::{Command, Sender, handles, with_deadline},
};

/// Handle to a sending link that streams messages chunk by chunk.
pub struct StreamSender {
    sender: Sender,
    flush_threshold: usize,
}

impl StreamSender {
    pub(crate) const fn new(sender: Sender, flush_threshold: usize) -> Self {
        Self {
            sender,
            flush_threshold,
        }
    }

    /// Session-local handle of this link.
    #[must_use]
    pub const fn handle(&self) -> LinkHandle { self.sender.handle() }

    /// Wait for the attach handshake and return the remote attach data.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] past the resolved deadline, or the
    /// failure that ended the attach.
    pub async fn attached(&mut self) -> Result<AttachedInfo> { self.sender.attached().await }

    /// Start a new streaming message.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] while a previous message on
    /// this link is still in progress.
    pub async fn begin_message(&self) -> Result<StreamSenderMessage> {
        let (reply_tx, reply_rx) = oneshot::channel();
        handles::send_command(&self.sender.cmd_tx, Command::BeginStream {
            link: self.sender.link,
            reply: reply_tx,
        })
        .await?;
        with_deadline(self.sender.timeout, handles::await_reply(reply_rx)).await?;
        Ok(StreamSenderMessage {
            link: self.sender.link,
            cmd_tx: self.sender.cmd_tx.clone(),
            codec: std::sync::Arc::clone(&self.sender.codec),
            timeout: self.sender.timeout,
            flush_threshold: self.flush_threshold,
            message_format: 0,
            header: None,
            delivery_annotations: None,
            message_annotations: None,
            properties: None,
            application_properties: None,
            footer: None,
            phase: MessagePhase::Preamble,
            buffer: BytesMut::new(),
            delivery_id: None,
            emitted: false,
            failure: None,
        })
    }

    /// Detach the link, leaving it resumable by the peer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] past the resolved deadline.
    pub async fn detach(&self) -> Result<()> { self.sender.detach().await }

    /// Close the link permanently.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] past the resolved deadline.
    pub async fn close(&self) -> Result<()> { self.sender.close().await }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessagePhase {
    /// Header and metadata sections may still change.
    Preamble,
    /// Preamble encoded; only body bytes may follow.
    Body,
    Completed,
    Aborted,
}

/// One in-progress streaming message.
///
/// Holds the link's single streaming slot until completed or aborted;
/// dropping the message without either leaves the slot reserved, so callers
/// should always terminate it explicitly.
pub struct StreamSenderMessage {
    link: LinkHandle,
    cmd_tx: tokio::sync::mpsc::Sender<Command>,
    codec: std::sync::Arc<dyn crate::message::SectionCodec>,
    timeout: Option<std::time::Duration>,
    flush_threshold: usize,
    message_format: u32,
    header: Option<Header>,
    delivery_annotations: Option<Fields>,
    message_annotations: Option<Fields>,
    properties: Option<Properties>,
    application_properties: Option<Fields>,
    footer: Option<Fields>,
    phase: MessagePhase,
    buffer: BytesMut,
    /// Assigned by the first chunk reaching the wire.
    delivery_id: Option<DeliveryNumber>,
    /// Whether any chunk reached the session task.
    emitted: bool,
    failure: Option<EngineError>,
}

impl std::fmt::Debug for StreamSenderMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSenderMessage")
            .field("link", &self.link)
            .field("phase", &self.phase)
            .field("delivery_id", &self.delivery_id)
            .field("emitted", &self.emitted)
            .field("failure", &self.failure)
            .finish_non_exhaustive()
    }
}

impl StreamSenderMessage {
    /// Delivery id assigned once the first chunk is emitted.
    #[must_use]
    pub const fn delivery_id(&self) -> Option<DeliveryNumber> { self.delivery_id }

    fn check_usable(&self) -> Result<()> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        match self.phase {
            MessagePhase::Completed => Err(EngineError::IllegalState("message already completed")),
            MessagePhase::Aborted => Err(EngineError::IllegalState("message already aborted")),
            MessagePhase::Preamble | MessagePhase::Body => Ok(()),
        }
    }

    fn check_preamble(&self) -> Result<()> {
        self.check_usable()?;
        if self.phase == MessagePhase::Preamble {
            Ok(())
        } else {
            Err(EngineError::IllegalState("message body already started"))
        }
    }

    /// Set the message format carried on the first transfer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] once the body has started.
    pub fn set_message_format(&mut self, format: u32) -> Result<()> {
        self.check_preamble()?;
        self.message_format = format;
        Ok(())
    }

    /// Set the message header.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] once the body has started.
    pub fn set_header(&mut self, header: Header) -> Result<()> {
        self.check_preamble()?;
        self.header = Some(header);
        Ok(())
    }

    /// Set the delivery annotations.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] once the body has started.
    pub fn set_delivery_annotations(&mut self, fields: Fields) -> Result<()> {
        self.check_preamble()?;
        self.delivery_annotations = Some(fields);
        Ok(())
    }

    /// Set the message annotations.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] once the body has started.
    pub fn set_message_annotations(&mut self, fields: Fields) -> Result<()> {
        self.check_preamble()?;
        self.message_annotations = Some(fields);
        Ok(())
    }

    /// Set the message properties.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] once the body has started.
    pub fn set_properties(&mut self, properties: Properties) -> Result<()> {
        self.check_preamble()?;
        self.properties = Some(properties);
        Ok(())
    }

    /// Set the application properties.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] once the body has started.
    pub fn set_application_properties(&mut self, fields: Fields) -> Result<()> {
        self.check_preamble()?;
        self.application_properties = Some(fields);
        Ok(())
    }

    /// Set the footer, encoded after the final body section on completion.
    ///
    /// # Errors
    ///
    /// Returns the sticky failure once the message is terminal.
    pub fn set_footer(&mut self, fields: Fields) -> Result<()> {
        self.check_usable()?;
        self.footer = Some(fields);
        Ok(())
    }

    /// Encode the preamble sections into the buffer and seal them.
    fn enter_body(&mut self) -> Result<()> {
        if self.phase == MessagePhase::Body {
            return Ok(());
        }
        let mut sections = Vec::new();
        if let Some(header) = self.header.take() {
            sections.push(Section::Header(header));
        }
        if let Some(fields) = self.delivery_annotations.take() {
            sections.push(Section::DeliveryAnnotations(fields));
        }
        if let Some(fields) = self.message_annotations.take() {
            sections.push(Section::MessageAnnotations(fields));
        }
        if let Some(properties) = self.properties.take() {
            sections.push(Section::Properties(properties));
        }
        if let Some(fields) = self.application_properties.take() {
            sections.push(Section::ApplicationProperties(fields));
        }
        let encoded = encode_sections(&*self.codec, &sections)?;
        self.buffer.extend_from_slice(&encoded);
        self.phase = MessagePhase::Body;
        Ok(())
    }

    /// Append one body section to the message.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] for non-body sections and the
    /// sticky failure once the message is terminal.
    pub async fn write_body_section(&mut self, section: &Section) -> Result<()> {
        self.check_usable()?;
        if !section.is_body() {
            return Err(EngineError::IllegalState("section is not a body section"));
        }
        self.enter_body()?;
        let encoded = self.codec.encode(section).map_err(EngineError::from)?;
        self.buffer.extend_from_slice(&encoded);
        self.maybe_flush().await
    }

    /// Open a raw byte writer over the message body.
    ///
    /// # Errors
    ///
    /// Returns the sticky failure once the message is terminal.
    pub fn body_writer(&mut self, options: OutputStreamOptions) -> Result<BodyWriter<'_>> {
        self.check_usable()?;
        self.enter_body()?;
        Ok(BodyWriter {
            message: self,
            options,
            written: 0,
        })
    }

    /// Push the buffered bytes to the wire as a non-final chunk.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] past the resolved deadline and the
    /// link failure once it is closed; either poisons the message.
    pub async fn flush(&mut self) -> Result<()> {
        self.check_usable()?;
        self.enter_body()?;
        if self.buffer.is_empty() {
            return Ok(());
        }
        let payload = self.buffer.split().freeze();
        self.emit(payload, true, false).await.map(|_| ())
    }

    async fn maybe_flush(&mut self) -> Result<()> {
        if self.buffer.len() >= self.flush_threshold {
            let payload = self.buffer.split().freeze();
            self.emit(payload, true, false).await?;
        }
        Ok(())
    }

    /// Complete the message, emitting the footer and the final transfer.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] past the resolved deadline and the
    /// link failure once it is closed.
    pub async fn complete(&mut self) -> Result<DeliveryNumber> {
        self.check_usable()?;
        self.enter_body()?;
        if let Some(fields) = self.footer.take() {
            let encoded = self
                .codec
                .encode(&Section::Footer(fields))
                .map_err(EngineError::from)?;
            self.buffer.extend_from_slice(&encoded);
        }
        let payload = self.buffer.split().freeze();
        let delivery_id = self.emit(payload, false, false).await?;
        self.phase = MessagePhase::Completed;
        Ok(delivery_id)
    }

    /// Abort the message. Aborting an already aborted message is a no-op.
    ///
    /// A receiver that saw earlier chunks observes an aborted final
    /// transfer; a message that never reached the wire just releases the
    /// streaming slot.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] after completion.
    pub async fn abort(&mut self) -> Result<()> {
        match self.phase {
            MessagePhase::Aborted => return Ok(()),
            MessagePhase::Completed => {
                return Err(EngineError::IllegalState("message already completed"));
            }
            MessagePhase::Preamble | MessagePhase::Body => {}
        }
        self.buffer.clear();
        if self.emitted {
            self.emit(Bytes::new(), false, true).await?;
        } else {
            let (reply_tx, reply_rx) = oneshot::channel();
            handles::send_command(&self.cmd_tx, Command::AbandonStream {
                link: self.link,
                reply: reply_tx,
            })
            .await?;
            with_deadline(self.timeout, handles::await_reply(reply_rx)).await?;
        }
        self.phase = MessagePhase::Aborted;
        Ok(())
    }

    async fn emit(&mut self, payload: Bytes, more: bool, aborted: bool) -> Result<DeliveryNumber> {
        let (reply_tx, reply_rx) = oneshot::channel();
        handles::send_command(&self.cmd_tx, Command::StreamWrite {
            link: self.link,
            payload,
            message_format: self.message_format,
            more,
            aborted,
            reply: reply_tx,
        })
        .await?;
        let result = with_deadline(self.timeout, handles::await_reply(reply_rx)).await;
        match result {
            Ok(delivery_id) => {
                self.emitted = true;
                self.delivery_id = Some(delivery_id);
                Ok(delivery_id)
            }
            Err(err) => {
                if err.is_terminal() || matches!(err, EngineError::Timeout) {
                    self.failure = Some(err.clone());
                }
                Err(err)
            }
        }
    }
}

/// Raw byte writer over a streaming message body.
///
/// Bytes are wrapped in data sections at flush boundaries. Closing the
/// writer terminates the message according to its
/// [`OutputStreamOptions`].
pub struct BodyWriter<'a> {
    message: &'a mut StreamSenderMessage,
    options: OutputStreamOptions,
    written: u64,
}

impl BodyWriter<'_> {
    /// Bytes written so far.
    #[must_use]
    pub const fn written(&self) -> u64 { self.written }

    /// Append body bytes, flushing when the buffer crosses the threshold.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] when the write would exceed a
    /// declared body length, and the sticky failure once the message is
    /// terminal.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.message.check_usable()?;
        let after = self.written.saturating_add(bytes.len() as u64);
        if let Some(declared) = self.options.body_length
            && after > declared
        {
            return Err(EngineError::IllegalState(
                "write exceeds the declared body length",
            ));
        }
        let encoded = self
            .message
            .codec
            .encode(&Section::Data(Bytes::copy_from_slice(bytes)))
            .map_err(EngineError::from)?;
        self.message.buffer.extend_from_slice(&encoded);
        self.written = after;
        self.message.maybe_flush().await
    }

    /// Close the body stream.
    ///
    /// Completes the message when configured to and the declared length, if
    /// any, was fully written; otherwise aborts it.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::IllegalState`] when the declared body length
    /// was not reached; the message is aborted first.
    pub async fn close(self) -> Result<()> {
        if let Some(declared) = self.options.body_length
            && self.written < declared
        {
            self.message.abort().await?;
            return Err(EngineError::IllegalState(
                "stream closed before the declared body length was written",
            ));
        }
        if self.options.complete_on_close {
            self.message.complete().await.map(|_| ())
        } else {
            // Without completion the chunks on the wire cannot stand alone.
            self.message.abort().await
        }
    }
}
