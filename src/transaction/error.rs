use thiserror::Error;

use crate::common::TransactionId;
use crate::lock::LockError;

#[derive(Error, Debug, Clone)]
pub enum TransactionError {
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    #[error("transaction {0}: operation failed, transaction aborted: {1}")]
    Aborted(TransactionId, String),

    #[error("transaction {0} already finished")]
    AlreadyFinished(TransactionId),
}

impl TransactionError {
    pub fn is_deadlock(&self) -> bool {
        matches!(self, TransactionError::Lock(LockError::Deadlock { .. }))
    }

    pub fn transaction_id(&self) -> TransactionId {
        match self {
            TransactionError::Lock(LockError::Deadlock { transaction, .. })
            | TransactionError::Lock(LockError::PhaseViolation { transaction })
            | TransactionError::Lock(LockError::NotHeld { transaction, .. })
            | TransactionError::Aborted(transaction, _)
            | TransactionError::AlreadyFinished(transaction) => *transaction,
        }
    }
}
