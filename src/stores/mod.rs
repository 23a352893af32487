//! Storage layer the workflow talks to. Provides:
//! - The capability set the workflow needs ([`DocumentStore`], [`StoreSession`])
//! - An in-process store with snapshot transactions and fault injection ([`MemoryStore`])
//! - A MongoDB backed store behind the `mongo` feature ([`MongoStore`])
//!
//! The store owns atomicity and isolation. The workflow only orders its calls.

mod memory;
#[cfg(feature = "mongo")]
mod mongo;

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::fmt;

use crate::dto::{Account, Collection, Filter, User};
use crate::error::StoreError;

pub use memory::{FaultPlan, MemorySession, MemoryStore};
#[cfg(feature = "mongo")]
pub use mongo::{MongoSession, MongoStore};

/// Store calls, as recorded by [`MemoryStore`] and named in timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    DeleteMany,
    StartSession,
    StartTransaction,
    InsertUser,
    InsertAccount,
    IncrementBalance,
    CommitTransaction,
    AbortTransaction,
    EndSession,
    CountDocuments,
    FindAccount,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::DeleteMany => "deleteMany",
            Operation::StartSession => "startSession",
            Operation::StartTransaction => "startTransaction",
            Operation::InsertUser => "insertOne(users)",
            Operation::InsertAccount => "insertOne(accounts)",
            Operation::IncrementBalance => "updateOne(accounts)",
            Operation::CommitTransaction => "commitTransaction",
            Operation::AbortTransaction => "abortTransaction",
            Operation::EndSession => "endSession",
            Operation::CountDocuments => "countDocuments",
            Operation::FindAccount => "findOne(accounts)",
        };
        f.write_str(name)
    }
}

/// Non-transactional access to the store, plus the entry point to sessions.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    type Session: StoreSession;

    /// Removes every document of `collection` matching `filter`.
    /// Returns the number of documents removed.
    async fn delete_many(&self, collection: Collection, filter: &Filter) -> Result<u64, StoreError>;

    async fn start_session(&self) -> Result<Self::Session, StoreError>;

    /// Counts committed documents only.
    async fn count_documents(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<u64, StoreError>;

    async fn find_account(&self, id: u32) -> Result<Option<Account>, StoreError>;
}

/// A session is owned by exactly one workflow run.
///
/// Writes are only accepted between `start_transaction` and
/// `commit_transaction`/`abort_transaction`. Dropping a session without
/// calling [`StoreSession::end_session`] still releases it, and any
/// transaction left open is discarded.
#[async_trait]
pub trait StoreSession: Send {
    async fn start_transaction(&mut self) -> Result<(), StoreError>;

    async fn insert_user(&mut self, user: &User) -> Result<(), StoreError>;

    async fn insert_account(&mut self, account: &Account) -> Result<(), StoreError>;

    /// Adds `delta` to the balance of the account. Fails with
    /// [`StoreError::DocumentNotFound`] when no account matches.
    async fn increment_balance(&mut self, account_id: u32, delta: Decimal)
        -> Result<(), StoreError>;

    async fn commit_transaction(&mut self) -> Result<(), StoreError>;

    async fn abort_transaction(&mut self) -> Result<(), StoreError>;

    async fn end_session(self);
}
