//! Inbound performative handling for the session task.

use bytes::Bytes;
use tracing::{debug, trace, warn};
use tokio::sync::{mpsc, oneshot};

use super::SessionEngine;
use crate::{
    credit::FlowUpdate,
    delivery::{BodyEvent, Delivery},
    delivery_state::DeliveryState,
    error::EngineError,
    frames::{
        Attach, Detach, DeliveryNumber, DeliveryTag, Disposition, ErrorCondition, Flow,
        LinkHandle, Role, SessionFrame, Transfer,
    },
    link::{AttachState, AttachedInfo, BodyEnd, InFlight, ReceiverLink},
    reassembly::{DeliveryBuffer, DeliveryProgress, ReassemblyError},
};

impl SessionEngine {
    pub(super) async fn on_frame(&mut self, frame: SessionFrame) {
        match frame {
            SessionFrame::Attach(attach) => self.on_remote_attach(attach).await,
            SessionFrame::Detach(detach) => self.on_remote_detach(detach).await,
            SessionFrame::Flow(flow) => self.on_remote_flow(flow).await,
            SessionFrame::Transfer(transfer) => self.on_transfer(transfer).await,
            SessionFrame::Disposition(disposition) => self.on_remote_disposition(disposition),
        }
    }

    async fn on_remote_attach(&mut self, attach: Attach) {
        let Some(&local) = self.links_by_name.get(&attach.name) else {
            warn!("attach for unknown link name: name={}", attach.name);
            return;
        };
        self.remote_to_local.insert(attach.handle, local);
        let info = AttachedInfo {
            source: attach.source,
            target: attach.target,
            offered_capabilities: attach.offered_capabilities,
            desired_capabilities: attach.desired_capabilities,
            properties: attach.properties,
            max_message_size: attach.max_message_size,
        };
        let initial_flow = if let Some(receiver) = self.receivers.get_mut(&local) {
            receiver.remote_handle = Some(attach.handle);
            if let Err(err) = receiver.state.on_remote_attach() {
                warn!("unexpected remote attach: handle={local}, {err}");
                return;
            }
            receiver
                .attach_tx
                .send_replace(AttachState::Attached(Box::new(info)));
            // Advertise any credit granted before the handshake finished.
            (receiver.credit.link_credit() > 0).then(|| {
                (local, FlowUpdate {
                    link_credit: receiver.credit.link_credit(),
                    delivery_count: receiver.credit.delivery_count(),
                    drain: false,
                })
            })
        } else if let Some(sender) = self.senders.get_mut(&local) {
            sender.remote_handle = Some(attach.handle);
            if let Err(err) = sender.state.on_remote_attach() {
                warn!("unexpected remote attach: handle={local}, {err}");
                return;
            }
            sender
                .attach_tx
                .send_replace(AttachState::Attached(Box::new(info)));
            None
        } else {
            None
        };
        debug!("link attached: handle={local}");
        if let Some(flow) = initial_flow {
            let frame = self.flow_frame(Some(flow));
            self.send_frames(vec![frame]).await;
        }
    }

    async fn on_remote_detach(&mut self, detach: Detach) {
        let Some(&local) = self.remote_to_local.get(&detach.handle) else {
            warn!("detach for unknown handle: handle={}", detach.handle);
            return;
        };
        let mut frames = Vec::new();
        let mut discarded = 0u32;
        let mut sender_gone = false;
        if let Some(receiver) = self.receivers.get_mut(&local) {
            if receiver.state.on_remote_detach(detach.error.clone()) {
                if let Some(reply) = receiver.pending_detach.take() {
                    let _ = reply.send(Ok(()));
                }
                debug!("receiver detached: handle={local}");
            } else {
                let err = remote_close_error(detach.error);
                warn!("receiver remotely closed: handle={local}, {err}");
                discarded = Self::fail_receiver(receiver, &err);
                frames.push(SessionFrame::Detach(Detach {
                    handle: local,
                    closed: detach.closed,
                    error: None,
                }));
            }
        } else if let Some(sender) = self.senders.get_mut(&local) {
            sender_gone = true;
            if sender.state.on_remote_detach(detach.error.clone()) {
                if let Some(reply) = sender.pending_detach.take() {
                    let _ = reply.send(Ok(()));
                }
                // No disposition can arrive for this link any more; waiting
                // settlements resolve as errors on the handle side.
                sender.settlements.clear();
                debug!("sender detached: handle={local}");
            } else {
                let err = remote_close_error(detach.error);
                warn!("sender remotely closed: handle={local}, {err}");
                Self::fail_sender(sender, &err);
                frames.push(SessionFrame::Detach(Detach {
                    handle: local,
                    closed: detach.closed,
                    error: None,
                }));
            }
        }
        self.current_rx_delivery.remove(&local);
        if sender_gone {
            self.delivery_to_sender.retain(|_, handle| *handle != local);
        }
        if discarded > 0 && self.window.on_frames_freed(discarded).is_some() {
            frames.push(self.flow_frame(None));
        }
        self.send_frames(frames).await;
    }

    async fn on_remote_flow(&mut self, flow: Flow) {
        self.window.on_remote_flow(flow.incoming_window, flow.next_incoming_id);
        let mut frames = Vec::new();
        if let Some(remote) = flow.handle {
            let Some(&local) = self.remote_to_local.get(&remote) else {
                trace!("flow for unknown handle: handle={remote}");
                return;
            };
            let link_flow = if let Some(sender) = self.senders.get_mut(&local) {
                sender.on_remote_flow(flow.delivery_count, flow.link_credit, flow.drain);
                None
            } else if let Some(receiver) = self.receivers.get_mut(&local) {
                // Only a flow carrying the sender's credit state can finish
                // a drain; echoes without those fields leave it pending.
                if let (Some(delivery_count), Some(link_credit)) =
                    (flow.delivery_count, flow.link_credit)
                    && receiver.credit.on_drain_flow(delivery_count, link_credit)
                    && let Some(reply) = receiver.pending_drain.take()
                {
                    let _ = reply.send(Ok(()));
                }
                flow.echo.then(|| {
                    (local, FlowUpdate {
                        link_credit: receiver.credit.link_credit(),
                        delivery_count: receiver.credit.delivery_count(),
                        drain: receiver.credit.drain_requested(),
                    })
                })
            } else {
                None
            };
            if let Some(link_flow) = link_flow {
                frames.push(self.flow_frame(Some(link_flow)));
            }
        } else if flow.echo {
            frames.push(self.flow_frame(None));
        }
        self.send_frames(frames).await;
    }

    async fn on_transfer(&mut self, transfer: Transfer) {
        self.window.on_transfer_received();
        let Some(&local) = self.remote_to_local.get(&transfer.handle) else {
            warn!("transfer for unknown handle: handle={}", transfer.handle);
            return;
        };
        let open = self.current_rx_delivery.get(&local).copied();
        let (delivery_id, is_new) = match (transfer.delivery_id, open) {
            (Some(id), Some(open)) if id == open => (id, false),
            (Some(id), _) => (id, true),
            (None, Some(open)) => (open, false),
            (None, None) => {
                warn!("continuation transfer with no open delivery: handle={local}");
                return;
            }
        };
        if is_new {
            self.current_rx_delivery.insert(local, delivery_id);
        }

        let progress = {
            let Some(receiver) = self.receivers.get_mut(&local) else {
                warn!("transfer for non-receiving link: handle={local}");
                return;
            };
            if is_new {
                receiver.credit.on_transfer();
                receiver.in_flight.insert(delivery_id, InFlight {
                    buffer: DeliveryBuffer::new(delivery_id, self.options.max_delivery_size),
                    delivery_tag: transfer
                        .delivery_tag
                        .clone()
                        .unwrap_or(DeliveryTag(Bytes::new())),
                    message_format: transfer.message_format.unwrap_or(0),
                    settled: transfer.settled,
                    body_tx: None,
                    discarded: false,
                    terminal: None,
                });
            }
            match receiver.in_flight.get_mut(&delivery_id) {
                Some(inflight) => {
                    inflight
                        .buffer
                        .push(transfer.payload, transfer.more, transfer.aborted)
                }
                None => Err(ReassemblyError::AlreadyComplete { delivery_id }),
            }
        };

        let progress = match progress {
            Ok(progress) => progress,
            Err(err) => {
                self.fail_link_local(local, &err).await;
                return;
            }
        };
        if !matches!(progress, DeliveryProgress::Accumulating) {
            self.current_rx_delivery.remove(&local);
        }
        match progress {
            DeliveryProgress::Accumulating => self.progress_streaming(local, delivery_id).await,
            DeliveryProgress::Complete => self.finalize_delivery(local, delivery_id).await,
            DeliveryProgress::Aborted => self.abort_delivery(local, delivery_id).await,
            DeliveryProgress::Empty => {}
        }
    }

    /// Surface a partially received delivery on its first frame and forward
    /// newly arrived chunks to its streaming reader.
    async fn progress_streaming(&mut self, local: LinkHandle, delivery_id: DeliveryNumber) {
        let cmd_tx = self.cmd_tx.clone();
        let codec = std::sync::Arc::clone(&self.codec);
        let surfaced = {
            let Some(receiver) = self.receivers.get_mut(&local) else {
                return;
            };
            let Some(buffer_frames) = receiver.stream_buffer else {
                return;
            };
            Self::surface_if_needed(receiver, local, delivery_id, buffer_frames).map(|rx| {
                let parts = Self::stream_parts(cmd_tx, codec, receiver, local, delivery_id);
                Delivery::streaming(parts, rx)
            })
        };
        if let Some(delivery) = surfaced {
            let Some(receiver) = self.receivers.get_mut(&local) else {
                return;
            };
            if let Some(returned) = receiver.offer(delivery) {
                receiver.ready.push_back(returned);
            }
        }
        self.flush_body(local, delivery_id).await;
    }

    async fn finalize_delivery(&mut self, local: LinkHandle, delivery_id: DeliveryNumber) {
        let streaming = self
            .receivers
            .get(&local)
            .is_some_and(ReceiverLink::streaming);
        if streaming {
            self.finalize_streaming(local, delivery_id).await;
        } else {
            self.finalize_complete(local, delivery_id).await;
        }
    }

    async fn finalize_complete(&mut self, local: LinkHandle, delivery_id: DeliveryNumber) {
        let cmd_tx = self.cmd_tx.clone();
        let codec = std::sync::Arc::clone(&self.codec);
        let handed = {
            let Some(receiver) = self.receivers.get_mut(&local) else {
                return;
            };
            let Some(mut inflight) = receiver.in_flight.remove(&delivery_id) else {
                return;
            };
            let frames_unread = inflight.buffer.unread_frames();
            let chunks = inflight.buffer.take_chunks();
            let settlement = Self::settlement_for(receiver, delivery_id, inflight.settled);
            let auto_accept = receiver.options.auto_accept;
            let parts = Self::delivery_parts(
                cmd_tx,
                codec,
                local,
                delivery_id,
                inflight.delivery_tag,
                inflight.message_format,
                inflight.settled,
                auto_accept,
                settlement,
            );
            let delivery = Delivery::complete(parts, chunks);
            receiver.unread_frames.insert(delivery_id, frames_unread);
            match receiver.offer(delivery) {
                Some(returned) => {
                    receiver.ready.push_back(returned);
                    None
                }
                None => Some(delivery_id),
            }
        };
        if let Some(id) = handed {
            self.after_handout(local, id).await;
        }
    }

    async fn finalize_streaming(&mut self, local: LinkHandle, delivery_id: DeliveryNumber) {
        let cmd_tx = self.cmd_tx.clone();
        let codec = std::sync::Arc::clone(&self.codec);
        let (surfaced, discarded_frames) = {
            let Some(receiver) = self.receivers.get_mut(&local) else {
                return;
            };
            let buffer_frames = receiver.stream_buffer.unwrap_or(1);
            let dropped = receiver
                .in_flight
                .get(&delivery_id)
                .is_some_and(|inflight| inflight.discarded);
            if dropped {
                let Some(inflight) = receiver.in_flight.remove(&delivery_id) else {
                    return;
                };
                let discarded = inflight
                    .buffer
                    .unread_frames()
                    .saturating_add(receiver.unread_frames.remove(&delivery_id).unwrap_or(0));
                (None, discarded)
            } else {
                let surfaced =
                    Self::surface_if_needed(receiver, local, delivery_id, buffer_frames).map(
                        |rx| {
                            let parts =
                                Self::stream_parts(cmd_tx, codec, receiver, local, delivery_id);
                            Delivery::streaming(parts, rx)
                        },
                    );
                if let Some(inflight) = receiver.in_flight.get_mut(&delivery_id) {
                    inflight.terminal = Some(BodyEnd::Completed);
                }
                (surfaced, 0)
            }
        };
        if let Some(delivery) = surfaced {
            let Some(receiver) = self.receivers.get_mut(&local) else {
                return;
            };
            if let Some(returned) = receiver.offer(delivery) {
                receiver.ready.push_back(returned);
            }
        }
        self.flush_body(local, delivery_id).await;
        if discarded_frames > 0 && self.window.on_frames_freed(discarded_frames).is_some() {
            let frame = self.flow_frame(None);
            self.send_frames(vec![frame]).await;
        }
        // Completion counts as consumption for the credit window.
        self.after_handout(local, delivery_id).await;
    }

    async fn abort_delivery(&mut self, local: LinkHandle, delivery_id: DeliveryNumber) {
        let (discarded, link_update) = {
            let Some(receiver) = self.receivers.get_mut(&local) else {
                return;
            };
            let Some(inflight) = receiver.in_flight.get_mut(&delivery_id) else {
                return;
            };
            // The abort frame itself also consumed a window unit; chunks
            // never handed to a reader are voided here.
            let mut discarded = inflight.buffer.unread_frames().saturating_add(1);
            inflight.buffer.take_chunks();
            inflight.terminal = Some(BodyEnd::Aborted);
            let draining = inflight.body_tx.is_some() && !inflight.discarded;
            if !draining {
                receiver.in_flight.remove(&delivery_id);
            }
            discarded = discarded
                .saturating_add(receiver.unread_frames.remove(&delivery_id).unwrap_or(0));
            receiver.settlements.remove(&delivery_id);
            let unconsumed = receiver.unconsumed();
            let link_update = receiver.credit.on_delivery_aborted(unconsumed);
            (discarded, link_update)
        };
        debug!("delivery aborted by sender: delivery_id={delivery_id}");
        let window_update = self.window.on_frames_freed(discarded);
        let mut frames = Vec::new();
        if window_update.is_some() || link_update.is_some() {
            frames.push(self.flow_frame(link_update.map(|update| (local, update))));
        }
        self.send_frames(frames).await;
        self.flush_body(local, delivery_id).await;
    }

    fn on_remote_disposition(&mut self, disposition: Disposition) {
        if disposition.state.is_none() && !disposition.settled {
            return;
        }
        let state = disposition.state.clone();
        match disposition.role {
            // The peer receiver is settling deliveries we sent.
            Role::Receiver => {
                for id in disposition.delivery_ids() {
                    let Some(&link) = self.delivery_to_sender.get(&id) else {
                        continue;
                    };
                    let Some(sender) = self.senders.get_mut(&link) else {
                        continue;
                    };
                    if let Some(settlement) = sender.settlements.remove(&id) {
                        let _ =
                            settlement.send(state.clone().unwrap_or(DeliveryState::Accepted));
                    }
                    if disposition.settled {
                        self.delivery_to_sender.remove(&id);
                    }
                }
            }
            // The peer sender is updating deliveries we received.
            Role::Sender => {
                for id in disposition.delivery_ids() {
                    for receiver in self.receivers.values_mut() {
                        if let Some(settlement) = receiver.settlements.remove(&id) {
                            let _ =
                                settlement.send(state.clone().unwrap_or(DeliveryState::Accepted));
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Close a receiving link locally after a protocol violation.
    async fn fail_link_local(&mut self, local: LinkHandle, cause: &ReassemblyError) {
        let condition = match cause {
            ReassemblyError::DeliveryTooLarge { .. } => "amqp:link:message-size-exceeded",
            ReassemblyError::AlreadyComplete { .. } | ReassemblyError::Aborted { .. } => {
                "amqp:not-allowed"
            }
        };
        warn!("closing link after protocol violation: handle={local}, {cause}");
        let err = EngineError::Decode(cause.to_string());
        let mut frames = Vec::new();
        let mut discarded = 0u32;
        if let Some(receiver) = self.receivers.get_mut(&local) {
            if receiver.state.on_local_detach() {
                frames.push(SessionFrame::Detach(Detach {
                    handle: local,
                    closed: true,
                    error: Some(
                        ErrorCondition::new(condition).with_description(cause.to_string()),
                    ),
                }));
            }
            // The violating frame itself still consumed a window unit.
            discarded = Self::fail_receiver(receiver, &err).saturating_add(1);
        }
        self.current_rx_delivery.remove(&local);
        if self.window.on_frames_freed(discarded).is_some() {
            frames.push(self.flow_frame(None));
        }
        self.send_frames(frames).await;
    }

    /// Create the chunk channel for a delivery not yet surfaced to a
    /// streaming reader. Returns the read half when newly surfaced.
    fn surface_if_needed(
        receiver: &mut ReceiverLink,
        _local: LinkHandle,
        delivery_id: DeliveryNumber,
        buffer_frames: usize,
    ) -> Option<mpsc::Receiver<BodyEvent>> {
        let inflight = receiver.in_flight.get_mut(&delivery_id)?;
        if inflight.discarded || inflight.body_tx.is_some() {
            return None;
        }
        let (tx, rx) = mpsc::channel(buffer_frames.max(1));
        inflight.body_tx = Some(tx);
        Some(rx)
    }

    /// Build delivery parts for a surfaced streaming delivery, registering a
    /// settlement resolver when it arrived unsettled.
    fn stream_parts(
        cmd_tx: mpsc::Sender<super::Command>,
        codec: std::sync::Arc<dyn crate::message::SectionCodec>,
        receiver: &mut ReceiverLink,
        local: LinkHandle,
        delivery_id: DeliveryNumber,
    ) -> crate::delivery::DeliveryParts {
        let (tag, format, settled) = receiver
            .in_flight
            .get(&delivery_id)
            .map_or((DeliveryTag(Bytes::new()), 0, true), |inflight| {
                (
                    inflight.delivery_tag.clone(),
                    inflight.message_format,
                    inflight.settled,
                )
            });
        let settlement = Self::settlement_for(receiver, delivery_id, settled);
        Self::delivery_parts(
            cmd_tx,
            codec,
            local,
            delivery_id,
            tag,
            format,
            settled,
            receiver.options.auto_accept,
            settlement,
        )
    }

    /// Register a settlement resolver for an unsettled delivery.
    fn settlement_for(
        receiver: &mut ReceiverLink,
        delivery_id: DeliveryNumber,
        settled: bool,
    ) -> Option<oneshot::Receiver<DeliveryState>> {
        if settled {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        receiver.settlements.insert(delivery_id, tx);
        Some(rx)
    }

    /// Forward buffered chunks and any terminal event of `delivery_id` to
    /// its streaming reader, without ever blocking the frame loop.
    ///
    /// Chunks the reader's channel cannot take yet stay buffered; each
    /// consumption report retries the flush. Frames arriving for a
    /// discarded delivery are voided and restore the session window
    /// immediately.
    pub(super) async fn flush_body(&mut self, local: LinkHandle, delivery_id: DeliveryNumber) {
        use tokio::sync::mpsc::error::TrySendError;

        let voided = {
            let Some(receiver) = self.receivers.get_mut(&local) else {
                return;
            };
            let Some(inflight) = receiver.in_flight.get_mut(&delivery_id) else {
                return;
            };
            if inflight.discarded {
                let voided = inflight.buffer.unread_frames();
                inflight.buffer.take_chunks();
                voided
            } else {
                let Some(tx) = inflight.body_tx.clone() else {
                    return;
                };
                let mut forwarded = 0u32;
                let mut blocked = false;
                let mut closed = false;
                while let Some(chunk) = inflight.buffer.peek_chunk() {
                    match tx.try_send(BodyEvent::Chunk(chunk)) {
                        Ok(()) => {
                            inflight.buffer.pop_chunk();
                            forwarded = forwarded.saturating_add(1);
                        }
                        Err(TrySendError::Full(_)) => {
                            blocked = true;
                            break;
                        }
                        Err(TrySendError::Closed(_)) => {
                            closed = true;
                            break;
                        }
                    }
                }
                let mut finished = false;
                if !blocked
                    && !closed
                    && let Some(end) = inflight.terminal
                {
                    let event = match end {
                        BodyEnd::Completed => BodyEvent::Completed,
                        BodyEnd::Aborted => BodyEvent::Aborted,
                    };
                    match tx.try_send(event) {
                        Ok(()) => finished = true,
                        Err(TrySendError::Full(_)) => {}
                        Err(TrySendError::Closed(_)) => closed = true,
                    }
                }
                if closed {
                    // Reader dropped the delivery; its drop report settles
                    // the remaining frames.
                    inflight.discarded = true;
                    inflight.body_tx = None;
                }
                let leftover = inflight.buffer.unread_frames();
                if forwarded > 0 {
                    let count = receiver.unread_frames.entry(delivery_id).or_insert(0);
                    *count = count.saturating_add(forwarded);
                }
                if finished {
                    // Frames with no payload were never forwarded; their
                    // window units come back when the reader drops the
                    // delivery.
                    if leftover > 0 {
                        let count = receiver.unread_frames.entry(delivery_id).or_insert(0);
                        *count = count.saturating_add(leftover);
                    }
                    receiver.in_flight.remove(&delivery_id);
                }
                0
            }
        };
        if voided > 0 && self.window.on_frames_freed(voided).is_some() {
            let frame = self.flow_frame(None);
            self.send_frames(vec![frame]).await;
        }
    }
}

fn remote_close_error(error: Option<ErrorCondition>) -> EngineError {
    match error {
        Some(condition) => {
            EngineError::closed_with(crate::error::CloseScope::Link, condition)
        }
        None => EngineError::closed(crate::error::CloseScope::Link),
    }
}
