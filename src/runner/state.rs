use std::fmt;
use tracing::{debug, error};

/// Lifecycle of one workflow run.
///
/// `NotStarted -> InTransaction -> (Committed | Aborted) -> Verified`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    InTransaction,
    Committed,
    Aborted,
    Verified,
}

impl Phase {
    pub fn can_advance_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::NotStarted, Phase::InTransaction)
                | (Phase::InTransaction, Phase::Committed)
                | (Phase::InTransaction, Phase::Aborted)
                | (Phase::Committed, Phase::Verified)
                | (Phase::Aborted, Phase::Verified)
        )
    }
}

/// The writes issued inside the transaction, in the order they are issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    InsertUser,
    InsertAccount,
    AdjustBalance,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Step::InsertUser => "inserting the user",
            Step::InsertAccount => "inserting the account",
            Step::AdjustBalance => "adjusting the balance",
        })
    }
}

/// Records every phase a run passes through.
#[derive(Debug)]
pub(crate) struct PhaseTracker {
    history: Vec<Phase>,
}

impl PhaseTracker {
    pub(crate) fn new() -> Self {
        Self {
            history: vec![Phase::NotStarted],
        }
    }

    pub(crate) fn current(&self) -> Phase {
        self.history.last().copied().unwrap_or(Phase::NotStarted)
    }

    /// Moves to `next`. An illegal transition is logged and not recorded.
    pub(crate) fn advance(&mut self, next: Phase) -> bool {
        let current = self.current();
        if !current.can_advance_to(next) {
            error!(from = ?current, to = ?next, "illegal phase transition");
            return false;
        }
        debug!(from = ?current, to = ?next, "phase transition");
        self.history.push(next);
        true
    }

    pub(crate) fn into_history(self) -> Vec<Phase> {
        self.history
    }
}
