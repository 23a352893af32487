//! In-process document store with session scoped transactions.
//!
//! A transaction works on a private copy of the tables taken when it starts.
//! Commit publishes the collections it wrote to, unless one of them was
//! changed by someone else in the meantime (first committer wins). Reads
//! through the store only ever see committed data.
//!
//! Faults can be injected per [`Operation`] with a [`FaultPlan`], and every
//! call is journaled so tests can check ordering and session accounting. The
//! journal is test instrumentation and only keeps the latest calls.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

use super::{DocumentStore, Operation, StoreSession};
use crate::dto::{Account, Collection, Filter, User};
use crate::error::StoreError;

#[derive(Debug, Clone, Default)]
struct Tables {
    users: HashMap<u32, User>,
    accounts: HashMap<u32, Account>,
}

impl Tables {
    fn insert_user(&mut self, user: &User) -> Result<(), StoreError> {
        if self.users.contains_key(&user.id) {
            return Err(StoreError::DuplicateKey {
                collection: Collection::Users,
                id: user.id,
            });
        }
        self.users.insert(user.id, user.clone());
        Ok(())
    }

    fn insert_account(&mut self, account: &Account) -> Result<(), StoreError> {
        if self.accounts.contains_key(&account.id) {
            return Err(StoreError::DuplicateKey {
                collection: Collection::Accounts,
                id: account.id,
            });
        }
        self.accounts.insert(account.id, account.clone());
        Ok(())
    }

    fn increment_balance(&mut self, id: u32, delta: Decimal) -> Result<(), StoreError> {
        let account = self
            .accounts
            .get_mut(&id)
            .ok_or(StoreError::DocumentNotFound {
                collection: Collection::Accounts,
                id,
            })?;
        account.balance += delta;
        Ok(())
    }

    fn delete_many(&mut self, collection: Collection, filter: &Filter) -> u64 {
        fn purge<T>(table: &mut HashMap<u32, T>, filter: &Filter) -> u64 {
            let before = table.len();
            table.retain(|id, _| !filter.matches(*id));
            (before - table.len()) as u64
        }
        match collection {
            Collection::Users => purge(&mut self.users, filter),
            Collection::Accounts => purge(&mut self.accounts, filter),
        }
    }

    fn count(&self, collection: Collection, filter: &Filter) -> u64 {
        fn count_matching<T>(table: &HashMap<u32, T>, filter: &Filter) -> u64 {
            table.keys().filter(|id| filter.matches(**id)).count() as u64
        }
        match collection {
            Collection::Users => count_matching(&self.users, filter),
            Collection::Accounts => count_matching(&self.accounts, filter),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Remaining {
    Always,
    Times(u32),
}

/// Faults to inject into a [`MemoryStore`], keyed by the store call.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    failures: HashMap<Operation, Remaining>,
    stalls: HashMap<Operation, Duration>,
    panics: HashSet<Operation>,
    lose_commits: bool,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call to `operation` fails with [`StoreError::Injected`].
    pub fn fail(mut self, operation: Operation) -> Self {
        self.failures.insert(operation, Remaining::Always);
        self
    }

    /// The next `times` calls to `operation` fail, later calls succeed.
    pub fn fail_times(mut self, operation: Operation, times: u32) -> Self {
        self.failures.insert(operation, Remaining::Times(times));
        self
    }

    /// Calls to `operation` sleep for `delay` before doing their work.
    pub fn stall(mut self, operation: Operation, delay: Duration) -> Self {
        self.stalls.insert(operation, delay);
        self
    }

    pub fn panic_on(mut self, operation: Operation) -> Self {
        self.panics.insert(operation);
        self
    }

    /// Commits report success but publish nothing.
    pub fn lose_commits(mut self) -> Self {
        self.lose_commits = true;
        self
    }
}

enum Admission {
    Proceed,
    Stall(Duration),
    Fail,
    Panic,
}

const JOURNAL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Inner {
    tables: Tables,
    versions: HashMap<Collection, u64>,
    faults: FaultPlan,
    journal: VecDeque<Operation>,
    sessions_started: usize,
    sessions_ended: usize,
}

impl Inner {
    fn version(&self, collection: Collection) -> u64 {
        self.versions.get(&collection).copied().unwrap_or(0)
    }

    fn bump(&mut self, collection: Collection) {
        *self.versions.entry(collection).or_default() += 1;
    }

    fn record(&mut self, operation: Operation) {
        if self.journal.len() == JOURNAL_CAPACITY {
            self.journal.pop_front();
        }
        self.journal.push_back(operation);
    }

    fn admit(&mut self, operation: Operation) -> Admission {
        self.record(operation);
        if self.faults.panics.contains(&operation) {
            return Admission::Panic;
        }
        match self.faults.failures.get_mut(&operation) {
            Some(Remaining::Always) => return Admission::Fail,
            Some(Remaining::Times(remaining)) if *remaining > 0 => {
                *remaining -= 1;
                return Admission::Fail;
            }
            _ => {}
        }
        match self.faults.stalls.get(&operation) {
            Some(delay) => Admission::Stall(*delay),
            None => Admission::Proceed,
        }
    }
}

fn lock(inner: &Mutex<Inner>) -> Result<MutexGuard<'_, Inner>, StoreError> {
    inner
        .lock()
        .map_err(|_| StoreError::Backend("memory store lock poisoned".to_owned()))
}

/// Journals the call, then applies whatever fault the plan holds for it.
async fn admit(inner: &Mutex<Inner>, operation: Operation) -> Result<(), StoreError> {
    let admission = lock(inner)?.admit(operation);
    match admission {
        Admission::Proceed => Ok(()),
        Admission::Stall(delay) => {
            tokio::time::sleep(delay).await;
            Ok(())
        }
        Admission::Fail => Err(StoreError::Injected(operation)),
        Admission::Panic => panic!("injected panic during {operation}"),
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_faults(faults: FaultPlan) -> Self {
        let store = Self::new();
        store.set_faults(faults);
        store
    }

    /// Replaces the fault plan. Sessions already open see the new plan too.
    pub fn set_faults(&self, faults: FaultPlan) {
        self.state().faults = faults;
    }

    /// The most recent store calls, oldest first.
    pub fn journal(&self) -> Vec<Operation> {
        self.state().journal.iter().copied().collect()
    }

    pub fn sessions_started(&self) -> usize {
        self.state().sessions_started
    }

    pub fn sessions_ended(&self) -> usize {
        self.state().sessions_ended
    }

    // Introspection must keep working after an injected panic.
    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    type Session = MemorySession;

    async fn delete_many(&self, collection: Collection, filter: &Filter) -> Result<u64, StoreError> {
        admit(&self.inner, Operation::DeleteMany).await?;
        let mut inner = lock(&self.inner)?;
        let deleted = inner.tables.delete_many(collection, filter);
        if deleted > 0 {
            inner.bump(collection);
        }
        Ok(deleted)
    }

    async fn start_session(&self) -> Result<MemorySession, StoreError> {
        admit(&self.inner, Operation::StartSession).await?;
        let mut inner = lock(&self.inner)?;
        inner.sessions_started += 1;
        let id = inner.sessions_started;
        debug!(session = id, "session started");
        Ok(MemorySession {
            inner: Arc::clone(&self.inner),
            id,
            transaction: None,
            ended: false,
        })
    }

    async fn count_documents(
        &self,
        collection: Collection,
        filter: &Filter,
    ) -> Result<u64, StoreError> {
        admit(&self.inner, Operation::CountDocuments).await?;
        Ok(lock(&self.inner)?.tables.count(collection, filter))
    }

    async fn find_account(&self, id: u32) -> Result<Option<Account>, StoreError> {
        admit(&self.inner, Operation::FindAccount).await?;
        Ok(lock(&self.inner)?.tables.accounts.get(&id).cloned())
    }
}

#[derive(Debug)]
struct Workspace {
    tables: Tables,
    base: HashMap<Collection, u64>,
    written: HashSet<Collection>,
}

impl Workspace {
    fn base_version(&self, collection: Collection) -> u64 {
        self.base.get(&collection).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct MemorySession {
    inner: Arc<Mutex<Inner>>,
    id: usize,
    transaction: Option<Workspace>,
    ended: bool,
}

impl MemorySession {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.ended {
            return Err(StoreError::SessionEnded);
        }
        Ok(())
    }

    fn workspace(&mut self) -> Result<&mut Workspace, StoreError> {
        self.ensure_open()?;
        self.transaction
            .as_mut()
            .ok_or(StoreError::NoActiveTransaction)
    }

    /// Ends the session once. An open transaction is discarded.
    fn release(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        let discarded = self.transaction.take().is_some();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.record(Operation::EndSession);
        inner.sessions_ended += 1;
        debug!(session = self.id, discarded, "session ended");
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn start_transaction(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        admit(&self.inner, Operation::StartTransaction).await?;
        if self.transaction.is_some() {
            return Err(StoreError::TransactionInProgress);
        }
        let inner = lock(&self.inner)?;
        self.transaction = Some(Workspace {
            tables: inner.tables.clone(),
            base: inner.versions.clone(),
            written: HashSet::new(),
        });
        Ok(())
    }

    async fn insert_user(&mut self, user: &User) -> Result<(), StoreError> {
        self.workspace()?;
        admit(&self.inner, Operation::InsertUser).await?;
        let workspace = self.workspace()?;
        workspace.tables.insert_user(user)?;
        workspace.written.insert(Collection::Users);
        Ok(())
    }

    async fn insert_account(&mut self, account: &Account) -> Result<(), StoreError> {
        self.workspace()?;
        admit(&self.inner, Operation::InsertAccount).await?;
        let workspace = self.workspace()?;
        workspace.tables.insert_account(account)?;
        workspace.written.insert(Collection::Accounts);
        Ok(())
    }

    async fn increment_balance(
        &mut self,
        account_id: u32,
        delta: Decimal,
    ) -> Result<(), StoreError> {
        self.workspace()?;
        admit(&self.inner, Operation::IncrementBalance).await?;
        let workspace = self.workspace()?;
        workspace.tables.increment_balance(account_id, delta)?;
        workspace.written.insert(Collection::Accounts);
        Ok(())
    }

    async fn commit_transaction(&mut self) -> Result<(), StoreError> {
        self.workspace()?;
        admit(&self.inner, Operation::CommitTransaction).await?;
        let mut inner = lock(&self.inner)?;
        let workspace = self
            .transaction
            .as_ref()
            .ok_or(StoreError::NoActiveTransaction)?;
        if let Some(changed) = workspace
            .written
            .iter()
            .find(|collection| inner.version(**collection) != workspace.base_version(**collection))
        {
            return Err(StoreError::WriteConflict(*changed));
        }

        let Some(Workspace {
            tables, written, ..
        }) = self.transaction.take()
        else {
            return Err(StoreError::NoActiveTransaction);
        };
        if inner.faults.lose_commits {
            debug!(session = self.id, "commit acknowledged but dropped");
            return Ok(());
        }
        if written.contains(&Collection::Users) {
            inner.tables.users = tables.users;
            inner.bump(Collection::Users);
        }
        if written.contains(&Collection::Accounts) {
            inner.tables.accounts = tables.accounts;
            inner.bump(Collection::Accounts);
        }
        Ok(())
    }

    async fn abort_transaction(&mut self) -> Result<(), StoreError> {
        self.workspace()?;
        admit(&self.inner, Operation::AbortTransaction).await?;
        self.transaction = None;
        Ok(())
    }

    async fn end_session(mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn alice() -> User {
        User {
            id: 1,
            name: "Alice".to_owned(),
            email: "alice@example.com".to_owned(),
        }
    }

    fn account(balance: Decimal) -> Account {
        Account {
            id: 1,
            user_id: 1,
            balance,
        }
    }

    #[tokio::test]
    async fn test_new_store_is_empty() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        assert_eq!(store.count_documents(Collection::Users, &Filter::All).await?, 0);
        assert_eq!(store.find_account(1).await?, None);
        assert_eq!(store.sessions_started(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_commit_publishes_writes() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let mut session = store.start_session().await?;
        session.start_transaction().await?;
        session.insert_user(&alice()).await?;
        session.insert_account(&account(dec!(1000))).await?;
        session.increment_balance(1, dec!(-100)).await?;
        session.commit_transaction().await?;
        session.end_session().await;

        assert_eq!(store.count_documents(Collection::Users, &Filter::All).await?, 1);
        assert_eq!(store.find_account(1).await?, Some(account(dec!(900))));
        Ok(())
    }

    #[tokio::test]
    async fn test_uncommitted_writes_are_invisible() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let mut session = store.start_session().await?;
        session.start_transaction().await?;
        session.insert_user(&alice()).await?;

        // Outside readers only see committed data
        assert_eq!(store.count_documents(Collection::Users, &Filter::All).await?, 0);

        session.abort_transaction().await?;
        assert!(!session.in_transaction());
        session.end_session().await;
        assert_eq!(store.count_documents(Collection::Users, &Filter::All).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_writes_require_transaction() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let mut session = store.start_session().await?;
        assert_eq!(
            session.insert_user(&alice()).await,
            Err(StoreError::NoActiveTransaction)
        );
        assert_eq!(
            session.commit_transaction().await,
            Err(StoreError::NoActiveTransaction)
        );
        session.start_transaction().await?;
        assert_eq!(
            session.start_transaction().await,
            Err(StoreError::TransactionInProgress)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_key_rejected() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let mut session = store.start_session().await?;
        session.start_transaction().await?;
        session.insert_user(&alice()).await?;
        assert_eq!(
            session.insert_user(&alice()).await,
            Err(StoreError::DuplicateKey {
                collection: Collection::Users,
                id: 1
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_increment_missing_account() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let mut session = store.start_session().await?;
        session.start_transaction().await?;
        assert_eq!(
            session.increment_balance(7, dec!(1)).await,
            Err(StoreError::DocumentNotFound {
                collection: Collection::Accounts,
                id: 7
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_first_committer_wins() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let mut first = store.start_session().await?;
        let mut second = store.start_session().await?;
        first.start_transaction().await?;
        second.start_transaction().await?;

        second.insert_user(&alice()).await?;
        second.commit_transaction().await?;

        let mut bob = alice();
        bob.id = 2;
        first.insert_user(&bob).await?;
        assert_eq!(
            first.commit_transaction().await,
            Err(StoreError::WriteConflict(Collection::Users))
        );
        // The losing transaction stays open until aborted
        first.abort_transaction().await?;

        assert_eq!(store.count_documents(Collection::Users, &Filter::All).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_delete_many_is_idempotent() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        let mut session = store.start_session().await?;
        session.start_transaction().await?;
        session.insert_user(&alice()).await?;
        session.commit_transaction().await?;
        session.end_session().await;

        let scope = Filter::id(1);
        assert_eq!(store.delete_many(Collection::Users, &scope).await?, 1);
        assert_eq!(store.delete_many(Collection::Users, &scope).await?, 0);
        assert_eq!(store.count_documents(Collection::Users, &scope).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_drop_releases_session_once() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        {
            let mut session = store.start_session().await?;
            session.start_transaction().await?;
            session.insert_user(&alice()).await?;
        }
        assert_eq!(store.sessions_started(), 1);
        assert_eq!(store.sessions_ended(), 1);
        assert_eq!(store.count_documents(Collection::Users, &Filter::All).await?, 0);

        let session = store.start_session().await?;
        session.end_session().await;
        assert_eq!(store.sessions_ended(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_injected_failures() -> Result<(), StoreError> {
        let store = MemoryStore::with_faults(
            FaultPlan::new()
                .fail(Operation::InsertAccount)
                .fail_times(Operation::InsertUser, 1),
        );
        let mut session = store.start_session().await?;
        session.start_transaction().await?;
        assert_eq!(
            session.insert_user(&alice()).await,
            Err(StoreError::Injected(Operation::InsertUser))
        );
        session.insert_user(&alice()).await?;
        for _ in 0..2 {
            assert_eq!(
                session.insert_account(&account(dec!(1))).await,
                Err(StoreError::Injected(Operation::InsertAccount))
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_lost_commit() -> Result<(), StoreError> {
        let store = MemoryStore::with_faults(FaultPlan::new().lose_commits());
        let mut session = store.start_session().await?;
        session.start_transaction().await?;
        session.insert_account(&account(dec!(1000))).await?;
        session.commit_transaction().await?;
        assert!(!session.in_transaction());
        assert_eq!(store.find_account(1).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_journal_records_calls_in_order() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        store.delete_many(Collection::Users, &Filter::All).await?;
        let mut session = store.start_session().await?;
        session.start_transaction().await?;
        session.abort_transaction().await?;
        session.end_session().await;
        assert_eq!(
            store.journal(),
            vec![
                Operation::DeleteMany,
                Operation::StartSession,
                Operation::StartTransaction,
                Operation::AbortTransaction,
                Operation::EndSession,
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_journal_keeps_latest_calls() -> Result<(), StoreError> {
        let store = MemoryStore::new();
        for _ in 0..JOURNAL_CAPACITY {
            store.delete_many(Collection::Users, &Filter::All).await?;
        }
        store.count_documents(Collection::Users, &Filter::All).await?;

        let journal = store.journal();
        assert_eq!(journal.len(), JOURNAL_CAPACITY);
        assert_eq!(journal.last(), Some(&Operation::CountDocuments));
        assert_eq!(journal[0], Operation::DeleteMany);
        Ok(())
    }
}
