//! Session task owning all link, credit, and window state.
//!
//! [`SessionEngine`] is a single-writer actor: application handles enqueue
//! [`Command`]s, the transport feeds inbound [`SessionFrame`]s, and the
//! engine's `select!` loop is the only place any of the per-link state
//! machines are mutated. Outbound frames are emitted to the transport
//! channel; blocking semantics live entirely on the handle side as awaited
//! `oneshot` replies under [`with_deadline`].

mod command;
pub(crate) mod handles;
mod inbound;

use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};

use bytes::Bytes;
use tracing::{debug, info, trace, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

pub(crate) use command::Command;
pub use handles::{Receiver, Sender, SentDelivery, Session};

use crate::{
    config::{ConnectionOptions, ReceiverOptions, SenderOptions, SessionOptions},
    credit::{CreditError, CreditTracker, FlowUpdate},
    delivery::{Delivery, DeliveryParts},
    delivery_state::{DeliveryState, Outcome},
    error::{CloseScope, EngineError, Result},
    frames::{
        Attach, Detach, DeliveryNumber, Disposition, Flow, LinkHandle, Role, SessionFrame,
        Terminus,
    },
    link::{AttachState, LinkState, PendingWrite, ReceiverLink, SenderLink, StreamPhase},
    message::{BincodeSectionCodec, SectionCodec},
    txn::TransactionId,
    window::SessionWindow,
};

/// Command queue depth between handles and the session task.
const COMMAND_QUEUE_DEPTH: usize = 64;

/// Frame channels connecting the session task to its transport.
pub struct SessionTransport {
    /// Inbound performatives, already parsed by the transport.
    pub inbound: mpsc::Receiver<SessionFrame>,
    /// Outbound performatives for the transport to encode and write.
    pub outbound: mpsc::Sender<SessionFrame>,
}

/// Await `operation`, bounding it by `deadline` when one is configured.
///
/// # Errors
///
/// Returns [`EngineError::Timeout`] when the deadline elapses first.
pub(crate) async fn with_deadline<T>(
    deadline: Option<Duration>,
    operation: impl Future<Output = Result<T>>,
) -> Result<T> {
    match deadline {
        Some(duration) => tokio::time::timeout(duration, operation)
            .await
            .map_err(|_| EngineError::Timeout)?,
        None => operation.await,
    }
}

/// Single-writer session actor.
pub struct SessionEngine {
    options: SessionOptions,
    codec: Arc<dyn SectionCodec>,
    window: SessionWindow,
    cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    frame_rx: mpsc::Receiver<SessionFrame>,
    out_tx: mpsc::Sender<SessionFrame>,
    shutdown: CancellationToken,
    receivers: HashMap<LinkHandle, ReceiverLink>,
    senders: HashMap<LinkHandle, SenderLink>,
    links_by_name: HashMap<String, LinkHandle>,
    remote_to_local: HashMap<LinkHandle, LinkHandle>,
    next_handle: u32,
    next_delivery_id: DeliveryNumber,
    /// Open multi-frame delivery per receiving link, for continuation
    /// routing.
    current_rx_delivery: HashMap<LinkHandle, DeliveryNumber>,
    /// Sender link that produced each unsettled outbound delivery.
    delivery_to_sender: HashMap<DeliveryNumber, LinkHandle>,
    /// Outcomes registered against each undischarged transaction.
    txns: HashMap<TransactionId, Vec<(LinkHandle, DeliveryNumber, Option<Outcome>)>>,
    next_txn: u64,
    /// Sticky failure; set once, every later command fails with it.
    closed: Option<EngineError>,
}

impl SessionEngine {
    /// Create an engine and its application handle with the default codec.
    #[must_use]
    pub fn new(
        transport: SessionTransport,
        connection: ConnectionOptions,
        options: SessionOptions,
    ) -> (Self, Session) {
        Self::with_codec(transport, connection, options, Arc::new(BincodeSectionCodec))
    }

    /// Create an engine with an explicit section codec.
    #[must_use]
    pub fn with_codec(
        transport: SessionTransport,
        connection: ConnectionOptions,
        options: SessionOptions,
        codec: Arc<dyn SectionCodec>,
    ) -> (Self, Session) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let shutdown = CancellationToken::new();
        let window = SessionWindow::new(
            options.incoming_capacity_bytes,
            options.max_frame_size,
            options.window_policy,
        );
        let handle = Session::new(
            cmd_tx.clone(),
            shutdown.clone(),
            connection,
            options,
            Arc::clone(&codec),
        );
        let engine = Self {
            options,
            codec,
            window,
            cmd_rx,
            cmd_tx,
            frame_rx: transport.inbound,
            out_tx: transport.outbound,
            shutdown,
            receivers: HashMap::new(),
            senders: HashMap::new(),
            links_by_name: HashMap::new(),
            remote_to_local: HashMap::new(),
            next_handle: 0,
            next_delivery_id: 0,
            current_rx_delivery: HashMap::new(),
            delivery_to_sender: HashMap::new(),
            txns: HashMap::new(),
            next_txn: 0,
            closed: None,
        };
        (engine, handle)
    }

    /// Drive the session until shutdown or transport loss.
    pub async fn run(mut self) {
        info!("session task started");
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    self.fail_session(EngineError::Io("session shut down".to_owned()));
                    break;
                }
                frame = self.frame_rx.recv() => match frame {
                    Some(frame) => {
                        trace!("inbound frame: kind={}", frame.kind());
                        self.on_frame(frame).await;
                    }
                    None => {
                        self.fail_session(EngineError::Io("transport closed".to_owned()));
                        break;
                    }
                },
                command = self.cmd_rx.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    // Unreachable while the engine holds a sender clone.
                    None => break,
                },
            }
            self.pump_sends().await;
        }
        info!("session task stopped");
    }

    async fn on_command(&mut self, command: Command) {
        if let Some(err) = &self.closed {
            Self::reject_command(command, err);
            return;
        }
        match command {
            Command::AttachReceiver {
                source,
                options,
                stream_buffer,
                reply,
            } => self.attach_receiver(source, options, stream_buffer, reply).await,
            Command::AttachSender {
                target,
                options,
                reply,
            } => self.attach_sender(target, options, reply).await,
            Command::Detach {
                link,
                closed,
                error,
                reply,
            } => self.detach(link, closed, error, reply).await,
            Command::AddCredit {
                link,
                credit,
                reply,
            } => self.add_credit(link, credit, reply).await,
            Command::Drain { link, reply } => self.drain(link, reply).await,
            Command::Receive { link, reply } => self.receive(link, reply).await,
            Command::TryReceive { link, reply } => self.try_receive(link, reply).await,
            Command::QueuedDeliveries { link, reply } => {
                let queued = self
                    .receivers
                    .get(&link)
                    .map_or(0, ReceiverLink::queued_deliveries);
                let _ = reply.send(queued);
            }
            Command::Disposition {
                link,
                delivery_id,
                state,
                settled,
                reply,
            } => self.disposition(link, delivery_id, state, settled, reply).await,
            Command::FramesConsumed {
                link,
                delivery_id,
                frames,
            } => self.frames_consumed(link, delivery_id, frames).await,
            Command::DeliveryDropped {
                link,
                delivery_id,
                had_local_state,
            } => self.delivery_dropped(link, delivery_id, had_local_state).await,
            Command::Send {
                link,
                payload,
                message_format,
                settled,
                settlement,
                reply,
            } => self.queue_send(link, payload, message_format, settled, settlement, reply),
            Command::BeginStream { link, reply } => self.begin_stream(link, reply),
            Command::AbandonStream { link, reply } => self.abandon_stream(link, reply),
            Command::StreamWrite {
                link,
                payload,
                message_format,
                more,
                aborted,
                reply,
            } => self.queue_stream_write(link, payload, message_format, more, aborted, reply),
            Command::Declare { reply } => self.declare(reply),
            Command::Discharge {
                txn_id,
                fail,
                reply,
            } => self.discharge(txn_id, fail, reply).await,
        }
    }

    /// Fail a command without processing it.
    fn reject_command(command: Command, err: &EngineError) {
        match command {
            Command::AttachReceiver { reply, .. } => {
                let _ = reply.send(Err(err.clone()));
            }
            Command::AttachSender { reply, .. } => {
                let _ = reply.send(Err(err.clone()));
            }
            Command::Detach { reply, .. }
            | Command::AddCredit { reply, .. }
            | Command::Drain { reply, .. }
            | Command::BeginStream { reply, .. }
            | Command::AbandonStream { reply, .. }
            | Command::Discharge { reply, .. } => {
                let _ = reply.send(Err(err.clone()));
            }
            Command::Receive { reply, .. } => {
                let _ = reply.send(Err(err.clone()));
            }
            Command::TryReceive { reply, .. } => {
                let _ = reply.send(Err(err.clone()));
            }
            Command::QueuedDeliveries { reply, .. } => {
                let _ = reply.send(0);
            }
            Command::Disposition { reply, .. } => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(err.clone()));
                }
            }
            Command::Send { reply, .. } | Command::StreamWrite { reply, .. } => {
                let _ = reply.send(Err(err.clone()));
            }
            Command::Declare { reply, .. } => {
                let _ = reply.send(Err(err.clone()));
            }
            Command::FramesConsumed { .. } | Command::DeliveryDropped { .. } => {}
        }
    }

    async fn attach_receiver(
        &mut self,
        source: Terminus,
        options: ReceiverOptions,
        stream_buffer: Option<usize>,
        reply: oneshot::Sender<Result<command::AttachReply>>,
    ) {
        let handle = self.allocate_handle();
        let name = format!("receiver-{}", handle.0);
        let credit = match options.credit_window {
            Some(window) => CreditTracker::windowed(window).0,
            None => CreditTracker::manual(),
        };
        let (attach_tx, attach_rx) = watch::channel(AttachState::Pending);
        let mut link = ReceiverLink::new(
            name.clone(),
            handle,
            credit,
            options,
            stream_buffer,
            attach_tx,
        );
        if let Err(err) = link.state.on_local_attach() {
            let _ = reply.send(Err(EngineError::IllegalState("link already attaching")));
            debug!("receiver attach rejected: {err}");
            return;
        }
        let attach = Attach {
            name: name.clone(),
            handle,
            role: Role::Receiver,
            source: Some(source),
            target: None,
            initial_delivery_count: None,
            max_message_size: u64::try_from(self.options.max_delivery_size.get()).ok(),
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: None,
        };
        self.links_by_name.insert(name, handle);
        self.receivers.insert(handle, link);
        let _ = reply.send(Ok((handle, attach_rx)));
        debug!("receiver attaching: handle={handle}");
        self.send_frames(vec![SessionFrame::Attach(attach)]).await;
    }

    async fn attach_sender(
        &mut self,
        target: Option<Terminus>,
        options: SenderOptions,
        reply: oneshot::Sender<Result<command::AttachReply>>,
    ) {
        let handle = self.allocate_handle();
        let name = format!("sender-{}", handle.0);
        let (attach_tx, attach_rx) = watch::channel(AttachState::Pending);
        let mut link = SenderLink::new(name.clone(), handle, options, attach_tx);
        if let Err(err) = link.state.on_local_attach() {
            let _ = reply.send(Err(EngineError::IllegalState("link already attaching")));
            debug!("sender attach rejected: {err}");
            return;
        }
        let attach = Attach {
            name: name.clone(),
            handle,
            role: Role::Sender,
            source: None,
            target,
            initial_delivery_count: Some(0),
            max_message_size: None,
            offered_capabilities: Vec::new(),
            desired_capabilities: Vec::new(),
            properties: None,
        };
        self.links_by_name.insert(name, handle);
        self.senders.insert(handle, link);
        let _ = reply.send(Ok((handle, attach_rx)));
        debug!("sender attaching: handle={handle}");
        self.send_frames(vec![SessionFrame::Attach(attach)]).await;
    }

    async fn detach(
        &mut self,
        link: LinkHandle,
        closed: bool,
        error: Option<crate::frames::ErrorCondition>,
        reply: oneshot::Sender<Result<()>>,
    ) {
        let mut frames = Vec::new();
        if let Some(receiver) = self.receivers.get_mut(&link) {
            if receiver.state.on_local_detach() {
                receiver.pending_detach = Some(reply);
                while let Some(waiter) = receiver.receive_waiters.pop_front() {
                    let _ = waiter.send(Err(EngineError::IllegalState("link is detached")));
                }
                frames.push(SessionFrame::Detach(Detach {
                    handle: link,
                    closed,
                    error,
                }));
            } else {
                // Already closed or closing; idempotent success.
                let _ = reply.send(Ok(()));
            }
        } else if let Some(sender) = self.senders.get_mut(&link) {
            if sender.state.on_local_detach() {
                sender.pending_detach = Some(reply);
                while let Some(write) = sender.pending.pop_front() {
                    let _ = write
                        .reply
                        .send(Err(EngineError::IllegalState("link is detached")));
                }
                sender.stream = None;
                frames.push(SessionFrame::Detach(Detach {
                    handle: link,
                    closed,
                    error,
                }));
            } else {
                let _ = reply.send(Ok(()));
            }
        } else {
            let _ = reply.send(Err(EngineError::IllegalState("unknown link")));
        }
        self.send_frames(frames).await;
    }

    async fn add_credit(
        &mut self,
        link: LinkHandle,
        credit: u32,
        reply: oneshot::Sender<Result<()>>,
    ) {
        let flow = {
            let Some(receiver) = self.receivers.get_mut(&link) else {
                let _ = reply.send(Err(EngineError::IllegalState("unknown link")));
                return;
            };
            if let Some(err) = Self::link_unusable(&receiver.state) {
                let _ = reply.send(Err(err));
                return;
            }
            match receiver.credit.add_credit(credit) {
                Ok(update) => {
                    let _ = reply.send(Ok(()));
                    // Hold the flow until the attach handshake completes.
                    receiver.state.is_attached().then_some((link, update))
                }
                Err(err) => {
                    let _ = reply.send(Err(Self::credit_error(err)));
                    return;
                }
            }
        };
        if let Some(link_flow) = flow {
            let frame = self.flow_frame(Some(link_flow));
            self.send_frames(vec![frame]).await;
        }
    }

    async fn drain(&mut self, link: LinkHandle, reply: oneshot::Sender<Result<()>>) {
        let flow = {
            let Some(receiver) = self.receivers.get_mut(&link) else {
                let _ = reply.send(Err(EngineError::IllegalState("unknown link")));
                return;
            };
            if let Some(err) = Self::link_unusable(&receiver.state) {
                let _ = reply.send(Err(err));
                return;
            }
            match receiver.credit.begin_drain() {
                Ok(update) => {
                    receiver.pending_drain = Some(reply);
                    (link, update)
                }
                Err(err) => {
                    let _ = reply.send(Err(Self::credit_error(err)));
                    return;
                }
            }
        };
        let frame = self.flow_frame(Some(flow));
        self.send_frames(vec![frame]).await;
    }

    async fn receive(&mut self, link: LinkHandle, reply: oneshot::Sender<Result<Delivery>>) {
        let handed = {
            let Some(receiver) = self.receivers.get_mut(&link) else {
                let _ = reply.send(Err(EngineError::IllegalState("unknown link")));
                return;
            };
            if receiver.ready.is_empty() {
                if let Some(err) = Self::link_unusable(&receiver.state) {
                    let _ = reply.send(Err(err));
                } else {
                    receiver.receive_waiters.push_back(reply);
                }
                return;
            }
            let Some(delivery) = receiver.ready.pop_front() else {
                return;
            };
            let id = delivery.delivery_id();
            match reply.send(Ok(delivery)) {
                Ok(()) => Some(id),
                // Caller gave up; keep the delivery at the head.
                Err(Ok(delivery)) => {
                    receiver.ready.push_front(delivery);
                    None
                }
                Err(Err(_)) => None,
            }
        };
        if let Some(id) = handed {
            self.after_handout(link, id).await;
        }
    }

    async fn try_receive(
        &mut self,
        link: LinkHandle,
        reply: oneshot::Sender<Result<Option<Delivery>>>,
    ) {
        let handed = {
            let Some(receiver) = self.receivers.get_mut(&link) else {
                let _ = reply.send(Err(EngineError::IllegalState("unknown link")));
                return;
            };
            if receiver.ready.is_empty() {
                let response = match Self::link_unusable(&receiver.state) {
                    Some(err) => Err(err),
                    None => Ok(None),
                };
                let _ = reply.send(response);
                return;
            }
            let Some(delivery) = receiver.ready.pop_front() else {
                return;
            };
            let id = delivery.delivery_id();
            match reply.send(Ok(Some(delivery))) {
                Ok(()) => Some(id),
                Err(Ok(Some(delivery))) => {
                    receiver.ready.push_front(delivery);
                    None
                }
                Err(_) => None,
            }
        };
        if let Some(id) = handed {
            self.after_handout(link, id).await;
        }
    }

    /// Bookkeeping after a completed delivery reaches the application:
    /// auto-accept and credit replenishment.
    async fn after_handout(&mut self, link: LinkHandle, id: DeliveryNumber) {
        let mut frames = Vec::new();
        let updates = {
            let Some(receiver) = self.receivers.get_mut(&link) else {
                return;
            };
            let mut auto_accept = false;
            if receiver.options.auto_accept
                && let Some(settlement) = receiver.settlements.remove(&id)
            {
                // The entry must go with the disposition; a later drop of the
                // delivery would otherwise settle it a second time.
                let _ = settlement.send(DeliveryState::Accepted);
                auto_accept = true;
            }
            let unconsumed = receiver.unconsumed();
            let credit_update = receiver.credit.on_delivery_consumed(unconsumed);
            (auto_accept, credit_update)
        };
        if updates.0 {
            frames.push(SessionFrame::Disposition(Disposition {
                role: Role::Receiver,
                first: id,
                last: None,
                settled: true,
                state: Some(DeliveryState::Accepted),
            }));
        }
        if let Some(update) = updates.1 {
            frames.push(self.flow_frame(Some((link, update))));
        }
        self.send_frames(frames).await;
    }

    async fn disposition(
        &mut self,
        link: LinkHandle,
        delivery_id: DeliveryNumber,
        state: DeliveryState,
        settled: bool,
        reply: Option<oneshot::Sender<Result<()>>>,
    ) {
        let Some(receiver) = self.receivers.get_mut(&link) else {
            if let Some(reply) = reply {
                let _ = reply.send(Err(EngineError::IllegalState("unknown link")));
            }
            return;
        };
        if let DeliveryState::Transactional { txn_id, outcome } = &state {
            self.txns
                .entry(TransactionId(txn_id.clone()))
                .or_default()
                .push((link, delivery_id, outcome.clone()));
        }
        if settled {
            // Nothing further will arrive for a settled delivery.
            receiver.settlements.remove(&delivery_id);
        }
        if let Some(reply) = reply {
            let _ = reply.send(Ok(()));
        }
        self.send_frames(vec![SessionFrame::Disposition(Disposition {
            role: Role::Receiver,
            first: delivery_id,
            last: None,
            settled,
            state: Some(state),
        })])
        .await;
    }

    async fn frames_consumed(&mut self, link: LinkHandle, delivery_id: DeliveryNumber, frames: u32) {
        let reopened = {
            let Some(receiver) = self.receivers.get_mut(&link) else {
                return;
            };
            match receiver.unread_frames.get_mut(&delivery_id) {
                Some(count) => {
                    let reopened = frames.min(*count);
                    *count -= reopened;
                    reopened
                }
                // Already settled up at abort or drop time.
                None => 0,
            }
        };
        if reopened > 0 && self.window.on_frames_freed(reopened).is_some() {
            let frame = self.flow_frame(None);
            self.send_frames(vec![frame]).await;
        }
        self.flush_body(link, delivery_id).await;
    }

    async fn delivery_dropped(
        &mut self,
        link: LinkHandle,
        delivery_id: DeliveryNumber,
        had_local_state: bool,
    ) {
        let mut frames = Vec::new();
        let (discarded, release) = {
            let Some(receiver) = self.receivers.get_mut(&link) else {
                return;
            };
            let mut discarded = receiver.unread_frames.remove(&delivery_id).unwrap_or(0);
            let mut terminal = false;
            if let Some(inflight) = receiver.in_flight.get_mut(&delivery_id) {
                inflight.discarded = true;
                inflight.body_tx = None;
                discarded = discarded.saturating_add(inflight.buffer.unread_frames());
                inflight.buffer.take_chunks();
                terminal = inflight.terminal.is_some();
            }
            if terminal {
                // Nothing more arrives from the wire; the entry is done.
                receiver.in_flight.remove(&delivery_id);
            }
            let unsettled = receiver.settlements.remove(&delivery_id).is_some();
            (discarded, !had_local_state && unsettled)
        };
        if release {
            debug!("releasing dropped delivery: delivery_id={delivery_id}");
            frames.push(SessionFrame::Disposition(Disposition {
                role: Role::Receiver,
                first: delivery_id,
                last: None,
                settled: true,
                state: Some(DeliveryState::Released),
            }));
        }
        if discarded > 0 && self.window.on_frames_freed(discarded).is_some() {
            frames.push(self.flow_frame(None));
        }
        self.send_frames(frames).await;
    }

    fn queue_send(
        &mut self,
        link: LinkHandle,
        payload: Bytes,
        message_format: u32,
        settled: bool,
        settlement: Option<oneshot::Sender<DeliveryState>>,
        reply: oneshot::Sender<Result<DeliveryNumber>>,
    ) {
        let Some(sender) = self.senders.get_mut(&link) else {
            let _ = reply.send(Err(EngineError::IllegalState("unknown link")));
            return;
        };
        if let Some(err) = Self::link_unusable(&sender.state) {
            let _ = reply.send(Err(err));
            return;
        }
        sender.pending.push_back(PendingWrite {
            payload,
            message_format,
            settled,
            more: false,
            aborted: false,
            streaming: false,
            assigned: None,
            settlement,
            reply,
        });
    }

    fn begin_stream(&mut self, link: LinkHandle, reply: oneshot::Sender<Result<()>>) {
        let Some(sender) = self.senders.get_mut(&link) else {
            let _ = reply.send(Err(EngineError::IllegalState("unknown link")));
            return;
        };
        if let Some(err) = Self::link_unusable(&sender.state) {
            let _ = reply.send(Err(err));
            return;
        }
        if sender.stream_active() {
            let _ = reply.send(Err(EngineError::IllegalState(
                "a streaming message is already in progress",
            )));
            return;
        }
        sender.stream = Some(crate::link::ActiveStream {
            phase: StreamPhase::Open,
            delivery_id: None,
            delivery_tag: None,
        });
        let _ = reply.send(Ok(()));
    }

    fn abandon_stream(&mut self, link: LinkHandle, reply: oneshot::Sender<Result<()>>) {
        let Some(sender) = self.senders.get_mut(&link) else {
            let _ = reply.send(Err(EngineError::IllegalState("unknown link")));
            return;
        };
        match sender.stream.as_ref().map(|stream| stream.phase) {
            Some(StreamPhase::Open) => {
                sender.stream = None;
                let _ = reply.send(Ok(()));
            }
            Some(StreamPhase::Writing) => {
                let _ = reply.send(Err(EngineError::IllegalState(
                    "streaming message already on the wire",
                )));
            }
            None => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn queue_stream_write(
        &mut self,
        link: LinkHandle,
        payload: Bytes,
        message_format: u32,
        more: bool,
        aborted: bool,
        reply: oneshot::Sender<Result<DeliveryNumber>>,
    ) {
        let Some(sender) = self.senders.get_mut(&link) else {
            let _ = reply.send(Err(EngineError::IllegalState("unknown link")));
            return;
        };
        if let Some(err) = Self::link_unusable(&sender.state) {
            let _ = reply.send(Err(err));
            return;
        }
        if sender.stream.is_none() {
            let _ = reply.send(Err(EngineError::IllegalState(
                "no streaming message in progress",
            )));
            return;
        }
        sender.pending.push_back(PendingWrite {
            payload,
            message_format,
            settled: false,
            more,
            aborted,
            streaming: true,
            assigned: None,
            settlement: None,
            reply,
        });
    }

    fn declare(&mut self, reply: oneshot::Sender<Result<TransactionId>>) {
        let id = TransactionId(Bytes::copy_from_slice(&self.next_txn.to_be_bytes()));
        self.next_txn = self.next_txn.wrapping_add(1);
        self.txns.insert(id.clone(), Vec::new());
        debug!("transaction declared: txn={:?}", id.as_slice());
        let _ = reply.send(Ok(id));
    }

    async fn discharge(
        &mut self,
        txn_id: TransactionId,
        fail: bool,
        reply: oneshot::Sender<Result<()>>,
    ) {
        let Some(entries) = self.txns.remove(&txn_id) else {
            let _ = reply.send(Err(EngineError::IllegalState("unknown transaction")));
            return;
        };
        let mut frames = Vec::new();
        for (link, delivery_id, outcome) in entries {
            let state = if fail {
                DeliveryState::Released
            } else {
                DeliveryState::from(outcome.unwrap_or(Outcome::Accepted))
            };
            if let Some(receiver) = self.receivers.get_mut(&link)
                && let Some(settlement) = receiver.settlements.remove(&delivery_id)
            {
                let _ = settlement.send(state.clone());
            }
            frames.push(SessionFrame::Disposition(Disposition {
                role: Role::Receiver,
                first: delivery_id,
                last: None,
                settled: true,
                state: Some(state),
            }));
        }
        debug!("transaction discharged: fail={fail}");
        let _ = reply.send(Ok(()));
        self.send_frames(frames).await;
    }

    /// Emit queued writes that now have credit and window.
    async fn pump_sends(&mut self) {
        let handles: Vec<LinkHandle> = self.senders.keys().copied().collect();
        for handle in handles {
            self.pump_sender(handle).await;
        }
    }

    async fn pump_sender(&mut self, handle: LinkHandle) {
        loop {
            let mut frames: Vec<SessionFrame> = Vec::new();
            let mut finished: Option<(oneshot::Sender<Result<DeliveryNumber>>, DeliveryNumber)> =
                None;
            {
                let Some(sender) = self.senders.get_mut(&handle) else {
                    return;
                };
                if !sender.state.is_attached()
                    || !sender.can_emit_head()
                    || !self.window.can_send()
                {
                    break;
                }
                let Some(mut write) = sender.pending.pop_front() else {
                    break;
                };

                let continuing_stream = write.streaming
                    && matches!(
                        sender.stream.as_ref().map(|stream| stream.phase),
                        Some(StreamPhase::Writing)
                    );
                let (delivery_id, delivery_tag, mut first_frame) =
                    if let Some((id, tag)) = write.assigned.take() {
                        (id, tag, false)
                    } else if continuing_stream {
                        let Some(stream) = sender.stream.as_ref() else {
                            break;
                        };
                        match (stream.delivery_id, stream.delivery_tag.clone()) {
                            (Some(id), Some(tag)) => (id, tag, false),
                            _ => break,
                        }
                    } else {
                        let id = self.next_delivery_id;
                        self.next_delivery_id = self.next_delivery_id.wrapping_add(1);
                        let tag = sender.tags.next_tag();
                        sender.credit = sender.credit.saturating_sub(1);
                        sender.delivery_count = sender.delivery_count.wrapping_add(1);
                        if write.streaming
                            && let Some(stream) = sender.stream.as_mut()
                        {
                            stream.phase = StreamPhase::Writing;
                            stream.delivery_id = Some(id);
                            stream.delivery_tag = Some(tag.clone());
                        }
                        (id, tag, true)
                    };

                let max_payload = self.options.max_frame_size as usize;
                let mut stalled = false;
                loop {
                    if !self.window.can_send() {
                        stalled = true;
                        break;
                    }
                    let take = write.payload.len().min(max_payload);
                    let chunk = write.payload.split_to(take);
                    let last = write.payload.is_empty();
                    frames.push(SessionFrame::Transfer(crate::frames::Transfer {
                        handle,
                        delivery_id: first_frame.then_some(delivery_id),
                        delivery_tag: first_frame.then(|| delivery_tag.clone()),
                        message_format: first_frame.then_some(write.message_format),
                        settled: write.settled,
                        more: write.more || !last,
                        aborted: write.aborted,
                        payload: chunk,
                    }));
                    self.window.on_transfer_sent();
                    first_frame = false;
                    if last {
                        break;
                    }
                }
                if stalled && !write.payload.is_empty() {
                    // Resume this delivery when the window re-opens.
                    write.assigned = Some((delivery_id, delivery_tag));
                    sender.pending.push_front(write);
                } else {
                    if !write.settled
                        && let Some(settlement) = write.settlement.take()
                    {
                        sender.settlements.insert(delivery_id, settlement);
                        self.delivery_to_sender.insert(delivery_id, handle);
                    }
                    if write.streaming && (!write.more || write.aborted) {
                        sender.stream = None;
                    }
                    finished = Some((write.reply, delivery_id));
                }
            }
            if let Some((reply, id)) = finished {
                let _ = reply.send(Ok(id));
            }
            if frames.is_empty() {
                break;
            }
            self.send_frames(frames).await;
        }
        self.answer_drain(handle).await;
    }

    /// Respond to an outstanding drain request by forfeiting unused credit.
    async fn answer_drain(&mut self, handle: LinkHandle) {
        let update = {
            let Some(sender) = self.senders.get_mut(&handle) else {
                return;
            };
            if !sender.drain || !sender.state.is_attached() {
                return;
            }
            sender.delivery_count = sender.delivery_count.wrapping_add(sender.credit);
            sender.credit = 0;
            sender.drain = false;
            FlowUpdate {
                link_credit: 0,
                delivery_count: sender.delivery_count,
                drain: true,
            }
        };
        debug!("drain answered: handle={handle}");
        let frame = self.flow_frame(Some((handle, update)));
        self.send_frames(vec![frame]).await;
    }

    fn allocate_handle(&mut self) -> LinkHandle {
        let handle = LinkHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        handle
    }

    /// Build a flow frame from the current session window, optionally
    /// carrying link-level credit state.
    fn flow_frame(&self, link: Option<(LinkHandle, FlowUpdate)>) -> SessionFrame {
        let window = self.window.update();
        SessionFrame::Flow(Flow {
            next_incoming_id: Some(window.next_incoming_id),
            incoming_window: window.incoming_window,
            next_outgoing_id: window.next_outgoing_id,
            outgoing_window: window.outgoing_window,
            handle: link.map(|(handle, _)| handle),
            delivery_count: link.map(|(_, update)| update.delivery_count),
            link_credit: link.map(|(_, update)| update.link_credit),
            available: None,
            drain: link.is_some_and(|(_, update)| update.drain),
            echo: false,
            properties: None,
        })
    }

    async fn send_frames(&mut self, frames: Vec<SessionFrame>) {
        for frame in frames {
            if self.out_tx.send(frame).await.is_err() {
                self.fail_session(EngineError::Io("transport closed".to_owned()));
                return;
            }
        }
    }

    /// Fan the failure out to every pending operation and mark the session
    /// permanently failed.
    fn fail_session(&mut self, err: EngineError) {
        if self.closed.is_some() {
            return;
        }
        warn!("session failed: {err}");
        for receiver in self.receivers.values_mut() {
            Self::fail_receiver(receiver, &err);
        }
        for sender in self.senders.values_mut() {
            Self::fail_sender(sender, &err);
        }
        self.closed = Some(err);
    }

    /// Fail every pending operation on a receiving link.
    ///
    /// Returns the count of buffered frames discarded, for window
    /// restoration.
    fn fail_receiver(receiver: &mut ReceiverLink, err: &EngineError) -> u32 {
        while let Some(waiter) = receiver.receive_waiters.pop_front() {
            let _ = waiter.send(Err(err.clone()));
        }
        if let Some(drain) = receiver.pending_drain.take() {
            let _ = drain.send(Err(err.clone()));
        }
        if let Some(detach) = receiver.pending_detach.take() {
            let _ = detach.send(Err(err.clone()));
        }
        let pending = matches!(&*receiver.attach_tx.borrow(), AttachState::Pending);
        if pending {
            receiver.attach_tx.send_replace(AttachState::Failed(err.clone()));
        }
        receiver.settlements.clear();
        receiver.ready.clear();
        let mut discarded = 0u32;
        for (_, inflight) in receiver.in_flight.drain() {
            // Dropping body_tx ends any in-progress streaming read.
            discarded = discarded.saturating_add(inflight.buffer.unread_frames());
        }
        for (_, frames) in receiver.unread_frames.drain() {
            discarded = discarded.saturating_add(frames);
        }
        discarded
    }

    /// Fail every pending operation on a sending link.
    fn fail_sender(sender: &mut SenderLink, err: &EngineError) {
        while let Some(write) = sender.pending.pop_front() {
            let _ = write.reply.send(Err(err.clone()));
        }
        if let Some(detach) = sender.pending_detach.take() {
            let _ = detach.send(Err(err.clone()));
        }
        let pending = matches!(&*sender.attach_tx.borrow(), AttachState::Pending);
        if pending {
            sender.attach_tx.send_replace(AttachState::Failed(err.clone()));
        }
        sender.settlements.clear();
        sender.stream = None;
    }

    /// Why a link cannot accept new operations, if it cannot.
    fn link_unusable(state: &LinkState) -> Option<EngineError> {
        match state {
            LinkState::RemotelyClosed { error } => Some(EngineError::RemotelyClosed {
                scope: CloseScope::Link,
                error: error.clone(),
            }),
            LinkState::Detaching | LinkState::Detached | LinkState::LocallyClosed => {
                Some(EngineError::IllegalState("link is detached"))
            }
            LinkState::Idle | LinkState::Attaching | LinkState::Attached => None,
        }
    }

    const fn credit_error(err: CreditError) -> EngineError {
        EngineError::IllegalState(match err {
            CreditError::DrainInProgress => "cannot add credit while a drain is in progress",
            CreditError::WindowManaged => "credit is managed by the configured window",
            CreditError::DrainAlreadyRequested => "drain already in progress",
        })
    }

    /// Build the shared parts for surfacing a delivery to the application.
    ///
    /// Takes the command channel and codec by value so callers can clone
    /// them before borrowing link state mutably.
    #[expect(clippy::too_many_arguments, reason = "plain constructor")]
    fn delivery_parts(
        cmd_tx: mpsc::Sender<Command>,
        codec: Arc<dyn SectionCodec>,
        link: LinkHandle,
        delivery_id: DeliveryNumber,
        delivery_tag: crate::frames::DeliveryTag,
        message_format: u32,
        settled: bool,
        auto_accept: bool,
        settlement: Option<oneshot::Receiver<DeliveryState>>,
    ) -> DeliveryParts {
        DeliveryParts {
            delivery_id,
            delivery_tag,
            message_format,
            link,
            settled,
            auto_accept,
            settlement,
            cmd_tx,
            codec,
        }
    }
}
