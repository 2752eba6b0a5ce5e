//! Crate-level error taxonomy.
//!
//! Component modules define their own precise error enums; this module folds
//! them into the taxonomy surfaced to applications: timeouts, precondition
//! violations, remote closure, decode failures, transport loss, and
//! structural misuse.

use thiserror::Error;

use crate::frames::ErrorCondition;

/// Scope that was closed by the remote peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseScope {
    Link,
    Session,
    Connection,
}

impl std::fmt::Display for CloseScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CloseScope::Link => "link",
            CloseScope::Session => "session",
            CloseScope::Connection => "connection",
        })
    }
}

/// Errors surfaced by engine operations.
///
/// Clonable so a single failure can be fanned out to every operation pending
/// on the closed scope.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum EngineError {
    /// A blocking operation exceeded its configured deadline.
    #[error("operation timed out")]
    Timeout,
    /// Caller violated an operation precondition.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),
    /// The remote peer closed the link, session, or connection.
    #[error("{scope} remotely closed{}", format_condition(.error))]
    RemotelyClosed {
        scope: CloseScope,
        error: Option<ErrorCondition>,
    },
    /// Section bytes could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
    /// The sender aborted the delivery being read.
    #[error("delivery was aborted by the sender")]
    DeliveryAborted,
    /// Transport-level failure; the affected resource is permanently failed.
    #[error("connection failure: {0}")]
    Io(String),
    /// Structural misuse of a read-only or restricted resource.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(&'static str),
}

impl EngineError {
    /// Remote closure of `scope` without an error condition.
    #[must_use]
    pub const fn closed(scope: CloseScope) -> Self {
        EngineError::RemotelyClosed { scope, error: None }
    }

    /// Remote closure of `scope` carrying `error`.
    #[must_use]
    pub const fn closed_with(scope: CloseScope, error: ErrorCondition) -> Self {
        EngineError::RemotelyClosed {
            scope,
            error: Some(error),
        }
    }

    /// Whether this error indicates the enclosing scope is gone for good.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            EngineError::RemotelyClosed { .. } | EngineError::Io(_)
        )
    }
}

fn format_condition(error: &Option<ErrorCondition>) -> String {
    match error {
        Some(condition) => format!(": {condition}"),
        None => String::new(),
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
