//! Errors raised while reassembling split deliveries.

use std::num::NonZeroUsize;

use thiserror::Error;

use crate::frames::DeliveryNumber;

/// Errors produced by [`DeliveryBuffer`](crate::reassembly::DeliveryBuffer).
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReassemblyError {
    /// A transfer frame arrived for a delivery that already completed.
    #[error("delivery {delivery_id} already complete")]
    AlreadyComplete { delivery_id: DeliveryNumber },
    /// A transfer frame arrived for a delivery that was aborted.
    #[error("delivery {delivery_id} was aborted")]
    Aborted { delivery_id: DeliveryNumber },
    /// Accumulated payload would exceed the configured cap.
    #[error("delivery {delivery_id} too large: {attempted} bytes exceeds limit {limit}")]
    DeliveryTooLarge {
        delivery_id: DeliveryNumber,
        attempted: usize,
        limit: NonZeroUsize,
    },
}
