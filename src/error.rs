//! Error taxonomy of the transactional workflow.
//!
//! - [`StoreError`]: a single store call failed.
//! - [`WorkflowError`]: the run could not get as far as a transaction and is
//!   returned to the caller as `Err`.
//! - [`TransactionFailure`]: an operation inside the transaction or the
//!   commit failed. The workflow recovers from it by aborting, and it is
//!   carried inside the report.
//! - [`VerificationInconsistency`]: the store does not reflect a transaction
//!   it reported as committed.

use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;

use crate::dto::Collection;
use crate::runner::Step;
use crate::stores::Operation;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("duplicate key {id} in {collection}")]
    DuplicateKey { collection: Collection, id: u32 },

    #[error("no document with _id {id} in {collection}")]
    DocumentNotFound { collection: Collection, id: u32 },

    #[error("no transaction in progress")]
    NoActiveTransaction,

    #[error("a transaction is already in progress")]
    TransactionInProgress,

    #[error("session has already ended")]
    SessionEnded,

    #[error("write conflict: {0} changed after the transaction started")]
    WriteConflict(Collection),

    #[error("injected fault during {0}")]
    Injected(Operation),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: Operation, after: Duration },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Failures that end a run before it reaches the transaction.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("setup failed, no transaction attempted: {0}")]
    Setup(#[source] StoreError),

    #[error("could not open a transaction: {0}")]
    Session(#[source] StoreError),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TransactionFailure {
    #[error("{step} failed: {source}")]
    Operation {
        step: Step,
        #[source]
        source: StoreError,
    },

    #[error("commit failed: {0}")]
    Commit(#[source] StoreError),
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum VerificationInconsistency {
    #[error("account {account_id} not found after a successful commit")]
    AccountMissing { account_id: u32 },

    #[error("account balance is {actual}, expected {expected}")]
    BalanceMismatch { expected: Decimal, actual: Decimal },

    #[error("verification read failed after commit: {0}")]
    Unverifiable(#[source] StoreError),
}
