//! The runner clears the fixture documents, writes a user and an account
//! inside one transaction, adjusts the balance, commits (or aborts), and
//! reads the result back to check it.
//!
//! The runner itself never retries; [`run_with_retries`] is the caller side
//! loop used by the binary.

mod state;
mod workflow;

use tracing::warn;

use crate::error::WorkflowError;
use crate::report::WorkflowReport;
use crate::stores::DocumentStore;

pub use state::{Phase, Step};
pub use workflow::{Timeouts, TransactionalWorkflowRunner};

/// Reruns the whole workflow while it aborts, at most `max_attempts` times
/// (at least once). Each attempt starts by clearing the fixture documents,
/// so a rerun cannot apply the writes of an earlier attempt twice.
///
/// Returns the report of every attempt; the last one is the final outcome.
///
/// # Errors
/// Stops at the first [`WorkflowError`], which is returned as is.
pub async fn run_with_retries<S: DocumentStore>(
    runner: &TransactionalWorkflowRunner,
    store: &S,
    max_attempts: u32,
) -> Result<Vec<WorkflowReport>, WorkflowError> {
    let max_attempts = max_attempts.max(1);
    let mut reports = Vec::new();
    for attempt in 1..=max_attempts {
        let report = runner.run(store).await?;
        let committed = report.is_committed();
        reports.push(report);
        if committed {
            break;
        }
        if attempt < max_attempts {
            warn!(attempt, max_attempts, "attempt aborted, retrying");
        }
    }
    Ok(reports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::fixture::Fixture;
    use crate::stores::{FaultPlan, MemoryStore, Operation};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_retries_until_committed() -> Result<(), WorkflowError> {
        let store =
            MemoryStore::with_faults(FaultPlan::new().fail_times(Operation::CommitTransaction, 2));
        let runner = TransactionalWorkflowRunner::new(Fixture::default());

        let reports = run_with_retries(&runner, &store, 5).await?;

        assert_eq!(reports.len(), 3);
        assert!(!reports[0].is_committed());
        assert!(!reports[1].is_committed());
        assert!(reports[2].is_consistent());
        // No double application across attempts
        assert_eq!(reports[2].final_balance(), Some(dec!(900)));
        Ok(())
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() -> Result<(), WorkflowError> {
        let store = MemoryStore::with_faults(FaultPlan::new().fail(Operation::InsertAccount));
        let runner = TransactionalWorkflowRunner::new(Fixture::default());

        let reports = run_with_retries(&runner, &store, 3).await?;
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|report| !report.is_committed()));
        assert_eq!(store.sessions_ended(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() -> Result<(), WorkflowError> {
        let store = MemoryStore::new();
        let runner = TransactionalWorkflowRunner::new(Fixture::default());
        let reports = run_with_retries(&runner, &store, 0).await?;
        assert_eq!(reports.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_setup_error_is_not_retried() {
        let store = MemoryStore::with_faults(FaultPlan::new().fail(Operation::DeleteMany));
        let runner = TransactionalWorkflowRunner::new(Fixture::default());

        let result = run_with_retries(&runner, &store, 3).await;
        assert!(matches!(
            result,
            Err(WorkflowError::Setup(StoreError::Injected(_)))
        ));
        let cleanups = store
            .journal()
            .into_iter()
            .filter(|operation| *operation == Operation::DeleteMany)
            .count();
        assert_eq!(cleanups, 1);
    }
}
