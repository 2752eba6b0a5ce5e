//! Receiver-role link state.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{mpsc, oneshot, watch};

use super::{AttachState, LinkState};
use crate::{
    config::ReceiverOptions,
    credit::CreditTracker,
    delivery::{BodyEvent, Delivery},
    delivery_state::DeliveryState,
    error::Result,
    frames::{DeliveryNumber, DeliveryTag, LinkHandle},
    reassembly::DeliveryBuffer,
};

/// Terminal body event awaiting a slot in a streaming reader's channel.
#[derive(Clone, Copy, Debug)]
pub(crate) enum BodyEnd {
    Completed,
    Aborted,
}

/// A delivery currently being reassembled.
pub(crate) struct InFlight {
    pub buffer: DeliveryBuffer,
    pub delivery_tag: DeliveryTag,
    pub message_format: u32,
    pub settled: bool,
    /// Chunk forwarder for a delivery already surfaced to a stream reader.
    pub body_tx: Option<mpsc::Sender<BodyEvent>>,
    /// The application dropped the surfaced delivery; remaining frames only
    /// restore the session window.
    pub discarded: bool,
    /// Set once the wire side finished; the entry then only drains to the
    /// reader.
    pub terminal: Option<BodyEnd>,
}

/// State for one receiving link, owned by the session task.
pub(crate) struct ReceiverLink {
    pub name: String,
    pub handle: LinkHandle,
    pub remote_handle: Option<LinkHandle>,
    pub state: LinkState,
    pub credit: CreditTracker,
    pub options: ReceiverOptions,
    /// Chunk buffer per surfaced streaming delivery; `None` surfaces
    /// deliveries only on completion.
    pub stream_buffer: Option<usize>,
    pub attach_tx: watch::Sender<AttachState>,
    pub in_flight: HashMap<DeliveryNumber, InFlight>,
    /// Completed deliveries awaiting a `receive` call, in arrival order.
    pub ready: VecDeque<Delivery>,
    /// Blocked `receive` callers, in call order.
    pub receive_waiters: VecDeque<oneshot::Sender<Result<Delivery>>>,
    /// Resolver for an outstanding drain cycle.
    pub pending_drain: Option<oneshot::Sender<Result<()>>>,
    /// Resolver for an outstanding detach handshake.
    pub pending_detach: Option<oneshot::Sender<Result<()>>>,
    /// Settlement futures for unsettled deliveries handed to the
    /// application.
    pub settlements: HashMap<DeliveryNumber, oneshot::Sender<DeliveryState>>,
    /// Frames not yet read per surfaced delivery, for window restoration
    /// when a delivery is dropped unread.
    pub unread_frames: HashMap<DeliveryNumber, u32>,
}

impl ReceiverLink {
    pub(crate) fn new(
        name: String,
        handle: LinkHandle,
        credit: CreditTracker,
        options: ReceiverOptions,
        stream_buffer: Option<usize>,
        attach_tx: watch::Sender<AttachState>,
    ) -> Self {
        Self {
            name,
            handle,
            remote_handle: None,
            state: LinkState::Idle,
            credit,
            options,
            stream_buffer,
            attach_tx,
            in_flight: HashMap::new(),
            ready: VecDeque::new(),
            receive_waiters: VecDeque::new(),
            pending_drain: None,
            pending_detach: None,
            settlements: HashMap::new(),
            unread_frames: HashMap::new(),
        }
    }

    /// Deliveries completed and waiting to be received.
    pub(crate) fn queued_deliveries(&self) -> usize { self.ready.len() }

    /// Whether deliveries surface on their first frame.
    pub(crate) const fn streaming(&self) -> bool { self.stream_buffer.is_some() }

    /// Deliveries buffered but not yet consumed, for the replenishment
    /// policy's outstanding-credit computation.
    ///
    /// Entries whose wire side already finished are excluded; they only
    /// drain to their reader.
    pub(crate) fn unconsumed(&self) -> u32 {
        let pending = self
            .in_flight
            .values()
            .filter(|inflight| inflight.terminal.is_none())
            .count();
        u32::try_from(self.ready.len().saturating_add(pending)).unwrap_or(u32::MAX)
    }

    /// Hand a completed delivery to the next waiter or queue it.
    ///
    /// Returns the delivery back when no waiter is blocked.
    pub(crate) fn offer(&mut self, delivery: Delivery) -> Option<Delivery> {
        let mut delivery = delivery;
        while let Some(waiter) = self.receive_waiters.pop_front() {
            match waiter.send(Ok(delivery)) {
                Ok(()) => return None,
                // Caller timed out and dropped its receiver; try the next.
                Err(Ok(returned)) => delivery = returned,
                Err(Err(_)) => unreachable!("offered delivery is always Ok"),
            }
        }
        Some(delivery)
    }
}
