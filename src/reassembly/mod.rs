//! Multi-frame delivery reassembly.
//!
//! A delivery's payload may arrive split across many transfer frames. The
//! [`DeliveryBuffer`] accumulates the frame payloads in arrival order until a
//! final frame (`more=false`) completes the delivery or an aborted frame
//! voids it. The buffer is transport-agnostic so link engines and tests
//! exercise it directly.

mod buffer;
mod error;

pub use buffer::{DeliveryBuffer, DeliveryProgress};
pub use error::ReassemblyError;
