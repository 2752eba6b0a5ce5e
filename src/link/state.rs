//! Link lifecycle state machine.

use log::debug;
use thiserror::Error;

use crate::frames::ErrorCondition;

/// Lifecycle states of a link endpoint.
///
/// `Idle → Attaching → Attached → Detaching → Detached`, with the terminal
/// failure states reachable whenever the remote closes first or the
/// connection drops.
#[derive(Clone, Debug, PartialEq)]
pub enum LinkState {
    /// Created, attach not yet sent.
    Idle,
    /// Local attach sent, awaiting the remote attach.
    Attaching,
    /// Both attaches exchanged.
    Attached,
    /// Local detach sent, awaiting the remote detach.
    Detaching,
    /// Clean detach completed.
    Detached,
    /// This side closed the link.
    LocallyClosed,
    /// The peer closed the link, possibly with an error.
    RemotelyClosed { error: Option<ErrorCondition> },
}

/// Errors raised on invalid lifecycle transitions.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum LinkStateError {
    /// The operation requires an attached link.
    #[error("link is not attached (state: {state})")]
    NotAttached { state: &'static str },
    /// An attach was requested twice.
    #[error("attach already in progress or complete")]
    AlreadyAttached,
}

impl LinkState {
    /// Short name for diagnostics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            LinkState::Idle => "idle",
            LinkState::Attaching => "attaching",
            LinkState::Attached => "attached",
            LinkState::Detaching => "detaching",
            LinkState::Detached => "detached",
            LinkState::LocallyClosed => "locally-closed",
            LinkState::RemotelyClosed { .. } => "remotely-closed",
        }
    }

    /// Whether the link can process transfers and flow updates.
    #[must_use]
    pub const fn is_attached(&self) -> bool { matches!(self, LinkState::Attached) }

    /// Whether the link reached a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            LinkState::Detached | LinkState::LocallyClosed | LinkState::RemotelyClosed { .. }
        )
    }

    /// Whether the peer already closed this link.
    #[must_use]
    pub const fn is_remotely_closed(&self) -> bool {
        matches!(self, LinkState::RemotelyClosed { .. })
    }

    /// Record the local attach being sent.
    ///
    /// # Errors
    ///
    /// Returns [`LinkStateError::AlreadyAttached`] unless the link is idle.
    pub fn on_local_attach(&mut self) -> Result<(), LinkStateError> {
        match self {
            LinkState::Idle => {
                *self = LinkState::Attaching;
                Ok(())
            }
            _ => Err(LinkStateError::AlreadyAttached),
        }
    }

    /// Record the remote attach arriving.
    ///
    /// # Errors
    ///
    /// Returns [`LinkStateError::NotAttached`] unless an attach is pending.
    pub fn on_remote_attach(&mut self) -> Result<(), LinkStateError> {
        match self {
            LinkState::Attaching => {
                *self = LinkState::Attached;
                debug!("link attached");
                Ok(())
            }
            state => Err(LinkStateError::NotAttached { state: state.name() }),
        }
    }

    /// Record a local detach being sent.
    ///
    /// Returns `true` when a detach frame should actually be emitted;
    /// detaching an already remotely closed link is an idempotent no-op.
    pub fn on_local_detach(&mut self) -> bool {
        match self {
            LinkState::RemotelyClosed { .. } | LinkState::Detached => false,
            LinkState::Detaching | LinkState::LocallyClosed => false,
            _ => {
                *self = LinkState::Detaching;
                true
            }
        }
    }

    /// Record the remote detach arriving.
    ///
    /// Returns `true` when this completes a locally initiated detach.
    pub fn on_remote_detach(&mut self, error: Option<ErrorCondition>) -> bool {
        match self {
            LinkState::Detaching => {
                *self = LinkState::Detached;
                true
            }
            _ => {
                *self = LinkState::RemotelyClosed { error };
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{LinkState, LinkStateError};
    use crate::frames::ErrorCondition;

    #[test]
    fn clean_lifecycle_walks_all_states() {
        let mut state = LinkState::Idle;
        state.on_local_attach().expect("attach sent");
        assert_eq!(state, LinkState::Attaching);
        state.on_remote_attach().expect("remote attach");
        assert!(state.is_attached());
        assert!(state.on_local_detach());
        assert_eq!(state, LinkState::Detaching);
        assert!(state.on_remote_detach(None));
        assert_eq!(state, LinkState::Detached);
        assert!(state.is_terminal());
    }

    #[test]
    fn double_attach_is_rejected() {
        let mut state = LinkState::Idle;
        state.on_local_attach().expect("attach sent");
        assert_eq!(state.on_local_attach(), Err(LinkStateError::AlreadyAttached));
    }

    #[test]
    fn unsolicited_remote_detach_marks_remotely_closed() {
        let mut state = LinkState::Attached;
        let error = Some(ErrorCondition::new("amqp:link:detach-forced"));
        assert!(!state.on_remote_detach(error.clone()));
        assert_eq!(state, LinkState::RemotelyClosed { error });
        assert!(state.is_remotely_closed());
    }

    #[test]
    fn detach_after_remote_close_is_noop() {
        let mut state = LinkState::RemotelyClosed { error: None };
        assert!(!state.on_local_detach());
        assert!(state.is_remotely_closed());
    }
}
