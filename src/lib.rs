mod csv_utils;
mod dto;
mod error;
mod fixture;
pub mod logging;
mod report;
mod runner;
mod settings;
mod stores;

pub use dto::{Account, Collection, Filter, ReportRow, User};
pub use error::{StoreError, TransactionFailure, VerificationInconsistency, WorkflowError};
pub use fixture::{CleanupScope, Fixture};
pub use report::{write_reports, Outcome, Verification, WorkflowReport};
pub use runner::{run_with_retries, Phase, Step, Timeouts, TransactionalWorkflowRunner};
pub use settings::{
    Backend, FixtureConfig, LogFormat, LoggingConfig, SettingsError, StoreConfig,
    TransactionConfig, WorkflowConfig,
};
pub use stores::{DocumentStore, FaultPlan, MemorySession, MemoryStore, Operation, StoreSession};
#[cfg(feature = "mongo")]
pub use stores::{MongoSession, MongoStore};
