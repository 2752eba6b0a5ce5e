//! Per-link engines driven by the session task.
//!
//! A link couples the lifecycle state machine with the credit tracker
//! (receiver role) or the peer-granted credit and write queue (sender role).
//! These types hold state only; the session task owns them and performs all
//! mutation, emitting the frames they request.

mod receiver;
mod sender;
mod state;
mod tag;

pub use state::{LinkState, LinkStateError};
pub use tag::DeliveryTagGenerator;

pub(crate) use receiver::{BodyEnd, InFlight, ReceiverLink};
pub(crate) use sender::{ActiveStream, PendingWrite, SenderLink, StreamPhase};

use crate::frames::{Fields, Terminus};

/// Remote attach data exposed through link accessors.
///
/// Accessors block until the remote attach arrives, so the data is published
/// through a watch channel updated by the session task.
#[derive(Clone, Debug, Default)]
pub struct AttachedInfo {
    pub source: Option<Terminus>,
    pub target: Option<Terminus>,
    pub offered_capabilities: Vec<String>,
    pub desired_capabilities: Vec<String>,
    pub properties: Option<Fields>,
    pub max_message_size: Option<u64>,
}

impl AttachedInfo {
    /// Address assigned by the peer, typically for dynamic termini.
    #[must_use]
    pub fn remote_address(&self) -> Option<&str> {
        self.source
            .as_ref()
            .and_then(|terminus| terminus.address.as_deref())
            .or_else(|| {
                self.target
                    .as_ref()
                    .and_then(|terminus| terminus.address.as_deref())
            })
    }
}

/// Progress of a link's attach handshake as observed by handles.
#[derive(Clone, Debug)]
pub enum AttachState {
    /// Local attach sent; remote response outstanding.
    Pending,
    /// Remote attach observed.
    Attached(Box<AttachedInfo>),
    /// The link, session, or connection failed before the remote attach.
    Failed(crate::error::EngineError),
}
