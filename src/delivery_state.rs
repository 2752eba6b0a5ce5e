//! Delivery outcome and state model.
//!
//! [`DeliveryState`] is a closed sum over the terminal outcomes a delivery
//! can carry on a disposition. The transactional variant wraps an
//! [`Outcome`], a subset that excludes the transactional case itself, so a
//! nested transactional state is unrepresentable.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::frames::{ErrorCondition, Fields};

/// Non-transactional terminal outcome.
///
/// This is the payload permitted inside
/// [`DeliveryState::Transactional`]; it mirrors the plain variants of
/// [`DeliveryState`] one-for-one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Accepted,
    Released,
    Rejected { error: Option<ErrorCondition> },
    Modified {
        delivery_failed: bool,
        undeliverable_here: bool,
        message_annotations: Option<Fields>,
    },
}

impl Outcome {
    /// Condition carried by a rejected outcome, if any.
    #[must_use]
    pub fn condition(&self) -> Option<&str> {
        match self {
            Outcome::Rejected { error: Some(err) } => Some(err.condition.as_str()),
            _ => None,
        }
    }

    /// Description carried by a rejected outcome, if any.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        match self {
            Outcome::Rejected { error: Some(err) } => err.description.as_deref(),
            _ => None,
        }
    }

    /// Info map carried by a rejected outcome, if any.
    #[must_use]
    pub fn info(&self) -> Option<&Fields> {
        match self {
            Outcome::Rejected { error: Some(err) } => err.info.as_ref(),
            _ => None,
        }
    }
}

/// Delivery state communicated in disposition frames.
///
/// Immutable once constructed. Constructed via the associated helpers or
/// directly; exhaustive matching replaces runtime type inspection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DeliveryState {
    Accepted,
    Released,
    Rejected { error: Option<ErrorCondition> },
    Modified {
        delivery_failed: bool,
        undeliverable_here: bool,
        message_annotations: Option<Fields>,
    },
    /// Outcome routed through a transaction controller; final settlement
    /// awaits the transaction's discharge.
    Transactional {
        txn_id: Bytes,
        outcome: Option<Outcome>,
    },
}

impl DeliveryState {
    /// Rejected state carrying a condition and description.
    #[must_use]
    pub fn rejected(condition: impl Into<String>, description: impl Into<String>) -> Self {
        DeliveryState::Rejected {
            error: Some(ErrorCondition::new(condition).with_description(description)),
        }
    }

    /// Modified state without annotations.
    #[must_use]
    pub const fn modified(delivery_failed: bool, undeliverable_here: bool) -> Self {
        DeliveryState::Modified {
            delivery_failed,
            undeliverable_here,
            message_annotations: None,
        }
    }

    /// Wrap an outcome in a transactional state for `txn_id`.
    #[must_use]
    pub const fn transactional(txn_id: Bytes, outcome: Option<Outcome>) -> Self {
        DeliveryState::Transactional { txn_id, outcome }
    }

    /// Whether this state is `Accepted`, looking through a transactional
    /// wrapper.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(
            self,
            DeliveryState::Accepted
                | DeliveryState::Transactional {
                    outcome: Some(Outcome::Accepted),
                    ..
                }
        )
    }

    /// Whether this state is `Released`, looking through a transactional
    /// wrapper.
    #[must_use]
    pub fn is_released(&self) -> bool {
        matches!(
            self,
            DeliveryState::Released
                | DeliveryState::Transactional {
                    outcome: Some(Outcome::Released),
                    ..
                }
        )
    }

    /// Whether this state is `Rejected`, looking through a transactional
    /// wrapper.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(
            self,
            DeliveryState::Rejected { .. }
                | DeliveryState::Transactional {
                    outcome: Some(Outcome::Rejected { .. }),
                    ..
                }
        )
    }

    /// Whether this state is `Modified`, looking through a transactional
    /// wrapper.
    #[must_use]
    pub fn is_modified(&self) -> bool {
        matches!(
            self,
            DeliveryState::Modified { .. }
                | DeliveryState::Transactional {
                    outcome: Some(Outcome::Modified { .. }),
                    ..
                }
        )
    }

    /// Whether this state is transactional.
    #[must_use]
    pub const fn is_transactional(&self) -> bool {
        matches!(self, DeliveryState::Transactional { .. })
    }

    /// The effective terminal outcome: the state itself for plain variants,
    /// or the wrapped outcome for transactional states.
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            DeliveryState::Accepted => Some(Outcome::Accepted),
            DeliveryState::Released => Some(Outcome::Released),
            DeliveryState::Rejected { error } => Some(Outcome::Rejected {
                error: error.clone(),
            }),
            DeliveryState::Modified {
                delivery_failed,
                undeliverable_here,
                message_annotations,
            } => Some(Outcome::Modified {
                delivery_failed: *delivery_failed,
                undeliverable_here: *undeliverable_here,
                message_annotations: message_annotations.clone(),
            }),
            DeliveryState::Transactional { outcome, .. } => outcome.clone(),
        }
    }
}

impl From<Outcome> for DeliveryState {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Accepted => DeliveryState::Accepted,
            Outcome::Released => DeliveryState::Released,
            Outcome::Rejected { error } => DeliveryState::Rejected { error },
            Outcome::Modified {
                delivery_failed,
                undeliverable_here,
                message_annotations,
            } => DeliveryState::Modified {
                delivery_failed,
                undeliverable_here,
                message_annotations,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::{DeliveryState, Outcome};
    use crate::frames::{ErrorCondition, FieldValue, Fields};

    #[test]
    fn transactional_rejected_exposes_condition_and_info() {
        let mut info = Fields::new();
        info.insert("test".to_owned(), FieldValue::from("value"));
        let outcome = Outcome::Rejected {
            error: Some(
                ErrorCondition::new("test")
                    .with_description("data")
                    .with_info(info.clone()),
            ),
        };
        let state =
            DeliveryState::transactional(Bytes::from_static(b"txn-1"), Some(outcome));

        assert!(state.is_rejected());
        assert!(state.is_transactional());
        let outcome = state.outcome().expect("outcome present");
        assert_eq!(outcome.condition(), Some("test"));
        assert_eq!(outcome.description(), Some("data"));
        assert_eq!(outcome.info(), Some(&info));
    }

    #[test]
    fn plain_states_report_their_kind() {
        assert!(DeliveryState::Accepted.is_accepted());
        assert!(DeliveryState::Released.is_released());
        assert!(DeliveryState::modified(true, false).is_modified());
        assert!(!DeliveryState::Accepted.is_rejected());
    }

    #[test]
    fn transactional_without_outcome_has_none() {
        let state = DeliveryState::transactional(Bytes::from_static(b"t"), None);
        assert!(state.outcome().is_none());
        assert!(!state.is_accepted());
    }
}
