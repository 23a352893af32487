use std::error::Error;
use std::io;
use std::process;

use tracing::{error, info};
use txn_smoke::{
    logging, run_with_retries, write_reports, Backend, DocumentStore, MemoryStore,
    TransactionalWorkflowRunner, WorkflowConfig, WorkflowReport,
};

type Result<T, E = Box<dyn Error + Send + Sync>> = std::result::Result<T, E>;

#[tokio::main]
async fn main() {
    match run_app().await {
        Ok(true) => {}
        // The smoke test ran but the store did not behave transactionally
        Ok(false) => process::exit(2),
        Err(err) => {
            eprintln!("Error: {}", err);
            process::exit(1);
        }
    }
}

async fn run_app() -> Result<bool> {
    let config = WorkflowConfig::load()?;
    logging::init(&config.logging)?;

    let runner = TransactionalWorkflowRunner::new(config.fixture()).with_timeouts(config.timeouts());
    let attempts = config.transaction.max_attempts;
    info!(backend = ?config.store.backend, attempts, "starting transaction smoke test");

    let reports = match config.store.backend {
        Backend::Memory => execute(&runner, &MemoryStore::new(), attempts).await?,
        Backend::Mongo => connect_and_execute(&runner, &config, attempts).await?,
    };

    let Some(last) = reports.last() else {
        return Err("workflow produced no report".into());
    };
    println!("{last}");
    println!();
    write_reports(io::stdout(), &reports)?;

    if !last.is_consistent() {
        error!("transaction smoke test failed");
    }
    Ok(last.is_consistent())
}

async fn execute<S: DocumentStore>(
    runner: &TransactionalWorkflowRunner,
    store: &S,
    attempts: u32,
) -> Result<Vec<WorkflowReport>> {
    Ok(run_with_retries(runner, store, attempts).await?)
}

#[cfg(feature = "mongo")]
async fn connect_and_execute(
    runner: &TransactionalWorkflowRunner,
    config: &WorkflowConfig,
    attempts: u32,
) -> Result<Vec<WorkflowReport>> {
    let store = txn_smoke::MongoStore::connect(&config.store.uri, &config.store.database).await?;
    execute(runner, &store, attempts).await
}

#[cfg(not(feature = "mongo"))]
async fn connect_and_execute(
    _runner: &TransactionalWorkflowRunner,
    _config: &WorkflowConfig,
    _attempts: u32,
) -> Result<Vec<WorkflowReport>> {
    Err("this build does not include the `mongo` feature".into())
}
