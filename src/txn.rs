//! Transactional delivery coordination.
//!
//! A [`Transaction`] scopes delivery outcomes so they only take effect when
//! the transaction is committed. Outcomes applied through it travel as
//! [`DeliveryState::Transactional`]; settlement futures of the covered
//! deliveries resolve at discharge time.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::{
    delivery::Delivery,
    delivery_state::{DeliveryState, Outcome},
    error::{EngineError, Result},
    frames::ErrorCondition,
    session::{Command, with_deadline},
};

/// Opaque identifier of a declared transaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub Bytes);

impl TransactionId {
    /// Borrow the raw identifier bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] { &self.0 }
}

/// A declared, not yet discharged transaction.
///
/// Dropping without [`commit`](Self::commit) or
/// [`rollback`](Self::rollback) leaves the discharge to the session's
/// teardown; outcomes routed through the transaction then resolve as
/// released.
pub struct Transaction {
    id: TransactionId,
    cmd_tx: mpsc::Sender<Command>,
    timeout: Option<Duration>,
}

impl Transaction {
    pub(crate) const fn new(
        id: TransactionId,
        cmd_tx: mpsc::Sender<Command>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            cmd_tx,
            timeout,
        }
    }

    /// Identifier assigned at declaration.
    #[must_use]
    pub const fn id(&self) -> &TransactionId { &self.id }

    /// Accept `delivery` within this transaction.
    ///
    /// # Errors
    ///
    /// Propagates disposition failures; see [`Delivery::disposition`].
    pub async fn accept(&self, delivery: &mut Delivery) -> Result<()> {
        self.outcome(delivery, Outcome::Accepted).await
    }

    /// Release `delivery` within this transaction.
    ///
    /// # Errors
    ///
    /// Propagates disposition failures; see [`Delivery::disposition`].
    pub async fn release(&self, delivery: &mut Delivery) -> Result<()> {
        self.outcome(delivery, Outcome::Released).await
    }

    /// Reject `delivery` within this transaction.
    ///
    /// # Errors
    ///
    /// Propagates disposition failures; see [`Delivery::disposition`].
    pub async fn reject(
        &self,
        delivery: &mut Delivery,
        condition: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<()> {
        self.outcome(delivery, Outcome::Rejected {
            error: Some(ErrorCondition::new(condition).with_description(description)),
        })
        .await
    }

    async fn outcome(&self, delivery: &mut Delivery, outcome: Outcome) -> Result<()> {
        delivery
            .disposition(
                DeliveryState::transactional(self.id.0.clone(), Some(outcome)),
                false,
            )
            .await
    }

    /// Commit the transaction, making its outcomes effective.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] past the resolved deadline or the
    /// session's failure if it has closed.
    pub async fn commit(self) -> Result<()> { self.discharge(false).await }

    /// Roll the transaction back; covered outcomes are voided.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Timeout`] past the resolved deadline or the
    /// session's failure if it has closed.
    pub async fn rollback(self) -> Result<()> { self.discharge(true).await }

    async fn discharge(self, fail: bool) -> Result<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Discharge {
                txn_id: self.id.clone(),
                fail,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::Io("session task stopped".to_owned()))?;
        with_deadline(self.timeout, async {
            reply_rx
                .await
                .map_err(|_| EngineError::Io("session task stopped".to_owned()))?
        })
        .await
    }
}
