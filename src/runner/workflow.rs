use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::state::{Phase, PhaseTracker, Step};
use crate::dto::{Account, Collection};
use crate::error::{StoreError, TransactionFailure, VerificationInconsistency, WorkflowError};
use crate::fixture::Fixture;
use crate::report::{Outcome, Verification, WorkflowReport};
use crate::stores::{DocumentStore, Operation, StoreSession};

/// Upper bounds for store calls made inside the transaction.
/// `None` waits for as long as the store takes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeouts {
    pub operation: Option<Duration>,
    pub commit: Option<Duration>,
}

async fn bounded<T, F>(operation: Operation, limit: Option<Duration>, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    let Some(after) = limit else {
        return call.await;
    };
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout { operation, after }),
    }
}

/// Runs the user/account transaction against a store and checks its effects.
///
/// The runner never retries. See [`super::run_with_retries`] for a caller
/// side retry loop.
#[derive(Debug, Clone, Default)]
pub struct TransactionalWorkflowRunner {
    fixture: Fixture,
    timeouts: Timeouts,
}

impl TransactionalWorkflowRunner {
    pub fn new(fixture: Fixture) -> Self {
        Self {
            fixture,
            timeouts: Timeouts::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn fixture(&self) -> &Fixture {
        &self.fixture
    }

    /// Executes one run.
    ///
    /// # Errors
    /// Only when the run never reached its transaction:
    /// * [`WorkflowError::Setup`] if clearing the fixture documents failed
    /// * [`WorkflowError::Session`] if the session or transaction could not be opened
    ///
    /// Failures inside the transaction are reported as [`Outcome::Aborted`].
    pub async fn run<S: DocumentStore>(&self, store: &S) -> Result<WorkflowReport, WorkflowError> {
        let span = info_span!(
            "workflow",
            user_id = self.fixture.user.id,
            account_id = self.fixture.account.id
        );
        self.execute(store).instrument(span).await
    }

    async fn execute<S: DocumentStore>(&self, store: &S) -> Result<WorkflowReport, WorkflowError> {
        let mut phases = PhaseTracker::new();

        self.reset_scope(store).await.map_err(WorkflowError::Setup)?;

        let mut session = store
            .start_session()
            .await
            .map_err(WorkflowError::Session)?;
        let started = bounded(
            Operation::StartTransaction,
            self.timeouts.operation,
            session.start_transaction(),
        )
        .await;
        if let Err(err) = started {
            session.end_session().await;
            return Err(WorkflowError::Session(err));
        }
        phases.advance(Phase::InTransaction);
        info!("transaction started");

        let written = self.write_and_commit(&mut session).await;
        let (outcome, abort_error) = match written {
            Ok(()) => {
                phases.advance(Phase::Committed);
                info!("transaction committed");
                (Outcome::Committed, None)
            }
            Err(failure) => {
                warn!(%failure, "transaction failed, aborting");
                let abort_error = bounded(
                    Operation::AbortTransaction,
                    self.timeouts.operation,
                    session.abort_transaction(),
                )
                .await
                .err();
                if let Some(err) = &abort_error {
                    error!(error = %err, "abort request failed");
                }
                phases.advance(Phase::Aborted);
                (Outcome::Aborted(failure), abort_error)
            }
        };
        session.end_session().await;

        let verification = self.verify(store, &outcome).await;
        phases.advance(Phase::Verified);

        Ok(WorkflowReport {
            outcome,
            abort_error,
            verification,
            expected_balance: self.fixture.expected_balance(),
            phases: phases.into_history(),
        })
    }

    /// Clears documents left behind by earlier runs. Runs outside any transaction.
    async fn reset_scope<S: DocumentStore>(&self, store: &S) -> Result<(), StoreError> {
        for collection in [Collection::Users, Collection::Accounts] {
            let deleted = store
                .delete_many(collection, &self.fixture.scope(collection))
                .await?;
            debug!(%collection, deleted, "cleared previous documents");
        }
        Ok(())
    }

    async fn write_and_commit<T: StoreSession>(&self, session: &mut T) -> Result<(), TransactionFailure> {
        let limit = self.timeouts.operation;
        let fixture = &self.fixture;

        bounded(Operation::InsertUser, limit, session.insert_user(&fixture.user))
            .await
            .map_err(|source| TransactionFailure::Operation {
                step: Step::InsertUser,
                source,
            })?;
        bounded(
            Operation::InsertAccount,
            limit,
            session.insert_account(&fixture.account),
        )
        .await
        .map_err(|source| TransactionFailure::Operation {
            step: Step::InsertAccount,
            source,
        })?;
        bounded(
            Operation::IncrementBalance,
            limit,
            session.increment_balance(fixture.account.id, fixture.adjustment),
        )
        .await
        .map_err(|source| TransactionFailure::Operation {
            step: Step::AdjustBalance,
            source,
        })?;

        bounded(
            Operation::CommitTransaction,
            self.timeouts.commit,
            session.commit_transaction(),
        )
        .await
        .map_err(TransactionFailure::Commit)
    }

    async fn read_back<S: DocumentStore>(
        &self,
        store: &S,
    ) -> Result<(u64, u64, Option<Account>), StoreError> {
        let users = store
            .count_documents(Collection::Users, &self.fixture.scope(Collection::Users))
            .await?;
        let accounts = store
            .count_documents(
                Collection::Accounts,
                &self.fixture.scope(Collection::Accounts),
            )
            .await?;
        let account = store.find_account(self.fixture.account.id).await?;
        Ok((users, accounts, account))
    }

    async fn verify<S: DocumentStore>(&self, store: &S, outcome: &Outcome) -> Verification {
        let committed = matches!(outcome, Outcome::Committed);
        let (users, accounts, account) = match self.read_back(store).await {
            Ok(snapshot) => snapshot,
            Err(err) if committed => {
                warn!(error = %err, "could not verify committed transaction");
                return Verification {
                    inconsistency: Some(VerificationInconsistency::Unverifiable(err)),
                    ..Verification::default()
                };
            }
            Err(err) => {
                debug!(error = %err, "verification read after abort failed");
                return Verification::default();
            }
        };
        info!(users, accounts, "verification counts");

        let mut verification = Verification {
            users: Some(users),
            accounts: Some(accounts),
            ..Verification::default()
        };

        if !committed {
            verification.partial_writes_visible = users > 0 || accounts > 0;
            if verification.partial_writes_visible {
                warn!(users, accounts, "documents visible after abort");
            }
            return verification;
        }

        let expected = self.fixture.expected_balance();
        match account {
            Some(account) => {
                verification.final_balance = Some(account.balance);
                if account.balance != expected {
                    verification.inconsistency = Some(VerificationInconsistency::BalanceMismatch {
                        expected,
                        actual: account.balance,
                    });
                }
            }
            None => {
                verification.inconsistency = Some(VerificationInconsistency::AccountMissing {
                    account_id: self.fixture.account.id,
                });
            }
        }
        match &verification.inconsistency {
            Some(inconsistency) => warn!(%inconsistency, "committed data inconsistent"),
            None => info!(balance = %expected, "committed data verified"),
        }
        verification
    }
}
