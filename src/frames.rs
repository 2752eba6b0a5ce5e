//! Session-level performative model.
//!
//! These are plain data types for the frames the engine consumes and emits:
//! `Attach`, `Detach`, `Flow`, `Transfer`, and `Disposition`. Wire-level
//! encoding of described types is an external concern; the transport hands the
//! engine already-parsed performatives and accepts them back for emission.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::delivery_state::DeliveryState;

/// Locally or remotely assigned link handle within a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkHandle(pub u32);

impl std::fmt::Display for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LinkHandle({})", self.0)
    }
}

/// Session-scoped transfer sequence number.
pub type TransferNumber = u32;

/// Session-scoped delivery identifier.
pub type DeliveryNumber = u32;

/// Link-scoped delivery sequence number.
pub type SequenceNo = u32;

/// Opaque per-delivery tag chosen by the sender.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryTag(pub Bytes);

impl DeliveryTag {
    /// Borrow the raw tag bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] { &self.0 }
}

impl From<Vec<u8>> for DeliveryTag {
    fn from(bytes: Vec<u8>) -> Self { Self(Bytes::from(bytes)) }
}

/// Role a link plays on this end of the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    /// Role the remote peer plays for a link with this local role.
    #[must_use]
    pub const fn remote(self) -> Self {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

/// Loosely typed value usable in performative field maps.
///
/// The full AMQP type system is out of scope; these variants cover the
/// shapes the engine itself inspects or round-trips.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Bool(bool),
    Ulong(u64),
    String(String),
    Binary(Bytes),
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self { FieldValue::String(value.to_owned()) }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self { FieldValue::Bool(value) }
}

impl From<u64> for FieldValue {
    fn from(value: u64) -> Self { FieldValue::Ulong(value) }
}

/// Ordered string-keyed field map carried by several performatives.
pub type Fields = std::collections::BTreeMap<String, FieldValue>;

/// Error information attached to detach/close performatives and to
/// `Rejected` outcomes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorCondition {
    /// Symbolic condition, e.g. `amqp:decode-error`.
    pub condition: String,
    /// Human-readable description.
    pub description: Option<String>,
    /// Extra peer-supplied detail.
    pub info: Option<Fields>,
}

impl ErrorCondition {
    /// Construct a condition without description or info.
    #[must_use]
    pub fn new(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            description: None,
            info: None,
        }
    }

    /// Attach a description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach an info map.
    #[must_use]
    pub fn with_info(mut self, info: Fields) -> Self {
        self.info = Some(info);
        self
    }
}

impl std::fmt::Display for ErrorCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {description}", self.condition),
            None => f.write_str(&self.condition),
        }
    }
}

/// Source or target terminus descriptor exchanged on attach.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Terminus {
    pub address: Option<String>,
    pub durable: bool,
    pub expiry_policy: Option<String>,
    pub dynamic: bool,
    pub dynamic_node_properties: Option<Fields>,
    pub capabilities: Vec<String>,
    pub outcomes: Vec<String>,
    pub filters: Option<Fields>,
}

impl Terminus {
    /// Terminus addressing a named node.
    #[must_use]
    pub fn with_address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    /// Terminus requesting a dynamically created node.
    #[must_use]
    pub fn dynamic() -> Self {
        Self {
            dynamic: true,
            ..Self::default()
        }
    }
}

/// Link attach performative.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attach {
    pub name: String,
    pub handle: LinkHandle,
    pub role: Role,
    pub source: Option<Terminus>,
    pub target: Option<Terminus>,
    /// Sender's initial delivery count; `None` for receiver-role attaches.
    pub initial_delivery_count: Option<SequenceNo>,
    pub max_message_size: Option<u64>,
    pub offered_capabilities: Vec<String>,
    pub desired_capabilities: Vec<String>,
    pub properties: Option<Fields>,
}

/// Link detach performative. `closed=true` closes the link permanently.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detach {
    pub handle: LinkHandle,
    pub closed: bool,
    pub error: Option<ErrorCondition>,
}

/// Flow performative carrying session window and link credit state.
///
/// Link-level fields (`handle`, `delivery_count`, `link_credit`, `available`,
/// `drain`) are absent on session-only flow updates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    pub next_incoming_id: Option<TransferNumber>,
    pub incoming_window: u32,
    pub next_outgoing_id: TransferNumber,
    pub outgoing_window: u32,
    pub handle: Option<LinkHandle>,
    pub delivery_count: Option<SequenceNo>,
    pub link_credit: Option<u32>,
    pub available: Option<u32>,
    pub drain: bool,
    pub echo: bool,
    pub properties: Option<Fields>,
}

/// Transfer performative carrying (part of) one delivery's payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub handle: LinkHandle,
    /// Absent on continuation frames of a multi-frame delivery.
    pub delivery_id: Option<DeliveryNumber>,
    pub delivery_tag: Option<DeliveryTag>,
    pub message_format: Option<u32>,
    pub settled: bool,
    /// More transfer frames follow for this delivery.
    pub more: bool,
    /// The sender abandoned this delivery; accumulated payload is void.
    pub aborted: bool,
    pub payload: Bytes,
}

/// Disposition performative settling a contiguous range of deliveries.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Disposition {
    pub role: Role,
    pub first: DeliveryNumber,
    /// Inclusive range end; `None` means `first` alone.
    pub last: Option<DeliveryNumber>,
    pub settled: bool,
    pub state: Option<DeliveryState>,
}

impl Disposition {
    /// Iterate the delivery ids covered by this disposition.
    pub fn delivery_ids(&self) -> impl Iterator<Item = DeliveryNumber> + use<> {
        self.first..=self.last.unwrap_or(self.first)
    }
}

/// Union of the session-level performatives the engine exchanges with the
/// transport.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SessionFrame {
    Attach(Attach),
    Detach(Detach),
    Flow(Flow),
    Transfer(Transfer),
    Disposition(Disposition),
}

impl SessionFrame {
    /// Short display name used in log output.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            SessionFrame::Attach(_) => "attach",
            SessionFrame::Detach(_) => "detach",
            SessionFrame::Flow(_) => "flow",
            SessionFrame::Transfer(_) => "transfer",
            SessionFrame::Disposition(_) => "disposition",
        }
    }
}
