//! Outcome of a workflow run, in a human readable and a CSV form.

use rust_decimal::Decimal;
use std::fmt;
use std::io::Write;

use crate::csv_utils::write_csv;
use crate::dto::ReportRow;
use crate::error::{StoreError, TransactionFailure, VerificationInconsistency};
use crate::runner::Phase;

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Committed,
    /// The transaction was rolled back because of the contained failure.
    Aborted(TransactionFailure),
}

/// What the post-release reads observed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Verification {
    /// `None` when the reads themselves failed.
    pub users: Option<u64>,
    pub accounts: Option<u64>,
    /// Only filled in for committed runs that found the account.
    pub final_balance: Option<Decimal>,
    pub inconsistency: Option<VerificationInconsistency>,
    /// Documents of an aborted run were still visible afterwards.
    pub partial_writes_visible: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowReport {
    pub outcome: Outcome,
    /// Set when the abort request itself failed. Never changes the outcome.
    pub abort_error: Option<StoreError>,
    pub verification: Verification,
    pub expected_balance: Decimal,
    pub phases: Vec<Phase>,
}

impl WorkflowReport {
    pub fn is_committed(&self) -> bool {
        matches!(self.outcome, Outcome::Committed)
    }

    pub fn failure(&self) -> Option<&TransactionFailure> {
        match &self.outcome {
            Outcome::Committed => None,
            Outcome::Aborted(failure) => Some(failure),
        }
    }

    pub fn final_balance(&self) -> Option<Decimal> {
        self.verification.final_balance
    }

    /// True only for a committed run whose effects were read back intact.
    pub fn is_consistent(&self) -> bool {
        self.is_committed()
            && self.verification.inconsistency.is_none()
            && self.final_balance() == Some(self.expected_balance)
    }

    pub fn inconsistency(&self) -> Option<&VerificationInconsistency> {
        self.verification.inconsistency.as_ref()
    }

    /// The most relevant problem of the run, if any.
    pub fn diagnostic(&self) -> Option<String> {
        match (&self.outcome, &self.abort_error) {
            (Outcome::Aborted(failure), Some(abort)) => {
                Some(format!("{failure}; abort also failed: {abort}"))
            }
            (Outcome::Aborted(failure), None) => Some(failure.to_string()),
            (Outcome::Committed, _) => self.inconsistency().map(ToString::to_string),
        }
    }

    pub fn to_row(&self, attempt: u32) -> ReportRow {
        ReportRow {
            attempt,
            outcome: if self.is_committed() {
                "committed"
            } else {
                "aborted"
            },
            users: self.verification.users,
            accounts: self.verification.accounts,
            final_balance: self.final_balance(),
            consistent: self.is_consistent(),
            diagnostic: self.diagnostic(),
        }
    }
}

impl fmt::Display for WorkflowReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            Outcome::Committed => writeln!(f, "Transaction committed successfully")?,
            Outcome::Aborted(failure) => writeln!(f, "Transaction failed: {failure}")?,
        }
        if let Some(err) = &self.abort_error {
            writeln!(f, "Abort request failed: {err}")?;
        }

        let verification = &self.verification;
        match (verification.users, verification.accounts) {
            (Some(users), Some(accounts)) => {
                writeln!(f, "Users count: {users}")?;
                writeln!(f, "Accounts count: {accounts}")?;
            }
            _ => writeln!(f, "Counts unavailable")?,
        }
        if let Some(balance) = verification.final_balance {
            writeln!(f, "Final account balance: {balance}")?;
        }
        if verification.partial_writes_visible {
            writeln!(f, "Documents from the aborted transaction are visible")?;
        }

        if let Some(inconsistency) = &verification.inconsistency {
            write!(f, "Transaction data inconsistent: {inconsistency}")
        } else if self.is_consistent() {
            write!(f, "Multi-document transactions are working correctly")
        } else {
            write!(f, "No changes were applied")
        }
    }
}

/// Writes one CSV row per attempt, numbered from 1.
pub fn write_reports<W: Write>(writer: W, reports: &[WorkflowReport]) -> csv::Result<()> {
    let rows = reports
        .iter()
        .zip(1..)
        .map(|(report, attempt)| report.to_row(attempt));
    write_csv(writer, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::Step;
    use crate::stores::Operation;
    use rust_decimal_macros::dec;

    fn committed(balance: Option<Decimal>) -> WorkflowReport {
        WorkflowReport {
            outcome: Outcome::Committed,
            abort_error: None,
            verification: Verification {
                users: Some(1),
                accounts: Some(1),
                final_balance: balance,
                ..Verification::default()
            },
            expected_balance: dec!(900),
            phases: vec![
                Phase::NotStarted,
                Phase::InTransaction,
                Phase::Committed,
                Phase::Verified,
            ],
        }
    }

    fn aborted() -> WorkflowReport {
        WorkflowReport {
            outcome: Outcome::Aborted(TransactionFailure::Operation {
                step: Step::AdjustBalance,
                source: StoreError::Injected(Operation::IncrementBalance),
            }),
            abort_error: Some(StoreError::Backend("connection reset".to_owned())),
            verification: Verification {
                users: Some(0),
                accounts: Some(0),
                ..Verification::default()
            },
            expected_balance: dec!(900),
            phases: vec![
                Phase::NotStarted,
                Phase::InTransaction,
                Phase::Aborted,
                Phase::Verified,
            ],
        }
    }

    #[test]
    fn test_committed_summary() {
        let report = committed(Some(dec!(900)));
        assert!(report.is_consistent());
        assert_eq!(report.diagnostic(), None);
        assert_eq!(
            report.to_string(),
            "Transaction committed successfully
Users count: 1
Accounts count: 1
Final account balance: 900
Multi-document transactions are working correctly"
        );
    }

    #[test]
    fn test_aborted_summary_mentions_abort_failure() {
        let report = aborted();
        assert!(!report.is_consistent());
        assert_eq!(
            report.diagnostic().as_deref(),
            Some(
                "adjusting the balance failed: injected fault during updateOne(accounts); \
                 abort also failed: store backend error: connection reset"
            )
        );
        assert!(report
            .to_string()
            .starts_with("Transaction failed: adjusting the balance failed"));
    }

    #[test]
    fn test_write_reports() -> Result<(), Box<dyn std::error::Error>> {
        let mut output = Vec::new();
        write_reports(&mut output, &[aborted(), committed(Some(dec!(900)))])?;

        let expected = "attempt,outcome,users,accounts,final_balance,consistent,diagnostic
1,aborted,0,0,,false,adjusting the balance failed: injected fault during updateOne(accounts); abort also failed: store backend error: connection reset
2,committed,1,1,900,true,
";
        assert_eq!(String::from_utf8(output)?, expected);
        Ok(())
    }
}
