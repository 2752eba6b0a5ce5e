#![doc(html_root_url = "https://docs.rs/linkflow/latest")]
//! Public API for the `linkflow` library.
//!
//! This crate implements the session-and-link layer of AMQP 1.0 style
//! messaging: credit-based flow control, session transfer windows,
//! multi-frame delivery reassembly, streaming sends and reads, delivery
//! settlement, and transactional outcomes. It is transport-agnostic; a
//! [`session::SessionTransport`] pair of frame channels connects the engine
//! to whatever encodes frames onto the wire.

pub mod config;
pub mod credit;
pub mod delivery;
pub mod delivery_state;
pub mod error;
pub mod frames;
pub mod link;
pub mod message;
pub mod reassembly;
pub mod session;
pub mod stream;
pub mod txn;
pub mod window;

/// Result type alias re-exported for convenience.
pub use error::Result;

pub use config::{
    ConnectionOptions,
    OutputStreamOptions,
    ReceiverOptions,
    SenderOptions,
    SessionOptions,
    StreamReceiverOptions,
    StreamSenderOptions,
};
pub use delivery::Delivery;
pub use delivery_state::{DeliveryState, Outcome};
pub use error::{CloseScope, EngineError};
pub use frames::{
    Attach,
    DeliveryNumber,
    DeliveryTag,
    Detach,
    Disposition,
    ErrorCondition,
    FieldValue,
    Fields,
    Flow,
    LinkHandle,
    Role,
    SessionFrame,
    Terminus,
    Transfer,
};
pub use link::{AttachState, AttachedInfo, LinkState};
pub use message::{
    BincodeSectionCodec,
    CodecError,
    Header,
    Message,
    Properties,
    Section,
    SectionCodec,
};
pub use session::{Receiver, Sender, SentDelivery, Session, SessionEngine, SessionTransport};
pub use stream::{BodyWriter, StreamSender, StreamSenderMessage};
pub use txn::{Transaction, TransactionId};
