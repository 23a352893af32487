//! Runtime configuration.
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. `txn-smoke.toml` (or any other format `config` understands) in the working directory
//! 3. Environment variables such as `TXN_SMOKE__STORE__URI` or
//!    `TXN_SMOKE__TRANSACTION__COMMIT_TIMEOUT_MS`
//!
//! A `.env` file is loaded into the environment first when present.

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, Environment, File, FileFormat, Map};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::dto::{Account, User};
use crate::fixture::{CleanupScope, Fixture};
use crate::runner::Timeouts;

const CONFIG_FILE: &str = "txn-smoke";
const ENV_PREFIX: &str = "TXN_SMOKE";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("failed to load .env file: {0}")]
    DotEnv(#[from] dotenvy::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Memory,
    Mongo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: Backend,
    /// Connection string. Transactions need a replica set.
    pub uri: String,
    pub database: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureConfig {
    pub user_id: u32,
    pub user_name: String,
    pub user_email: String,
    pub account_id: u32,
    pub initial_balance: Decimal,
    pub adjustment: Decimal,
    pub cleanup: CleanupScope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionConfig {
    pub operation_timeout_ms: Option<u64>,
    pub commit_timeout_ms: Option<u64>,
    /// Whole-workflow attempts, including the first.
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// `EnvFilter` directives, used when `RUST_LOG` is unset.
    pub filter: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub store: StoreConfig,
    pub fixture: FixtureConfig,
    pub transaction: TransactionConfig,
    pub logging: LoggingConfig,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        let fixture = Fixture::default();
        Self {
            store: StoreConfig {
                backend: Backend::Memory,
                uri: "mongodb://localhost:27017/?replicaSet=rs0".to_owned(),
                database: "testdb".to_owned(),
            },
            fixture: FixtureConfig {
                user_id: fixture.user.id,
                user_name: fixture.user.name,
                user_email: fixture.user.email,
                account_id: fixture.account.id,
                initial_balance: fixture.account.balance,
                adjustment: fixture.adjustment,
                cleanup: fixture.cleanup,
            },
            transaction: TransactionConfig {
                operation_timeout_ms: None,
                commit_timeout_ms: None,
                max_attempts: 1,
            },
            logging: LoggingConfig {
                format: LogFormat::Pretty,
                filter: "info".to_owned(),
            },
        }
    }
}

impl WorkflowConfig {
    /// Loads and validates the configuration from all sources.
    pub fn load() -> Result<Self, SettingsError> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
        }
        let config = Self::layered(|builder| {
            builder
                .add_source(File::with_name(CONFIG_FILE).required(false))
                .add_source(environment(std::env::vars().collect()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by a TOML document.
    pub fn from_toml(toml: &str) -> Result<Self, SettingsError> {
        let config =
            Self::layered(|builder| builder.add_source(File::from_str(toml, FileFormat::Toml)))?;
        config.validate()?;
        Ok(config)
    }

    fn layered(
        sources: impl FnOnce(ConfigBuilder<DefaultState>) -> ConfigBuilder<DefaultState>,
    ) -> Result<Self, SettingsError> {
        let defaults = Config::try_from(&Self::default())?;
        let config = sources(Config::builder().add_source(defaults)).build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let invalid = |reason: &str| Err(SettingsError::Invalid(reason.to_owned()));
        if self.transaction.max_attempts == 0 {
            return invalid("transaction.max_attempts must be at least 1");
        }
        if self.transaction.operation_timeout_ms == Some(0)
            || self.transaction.commit_timeout_ms == Some(0)
        {
            return invalid("timeouts must be greater than zero when set");
        }
        if self.fixture.user_name.trim().is_empty() || self.fixture.user_email.trim().is_empty() {
            return invalid("fixture.user_name and fixture.user_email must not be empty");
        }
        if self.store.backend == Backend::Mongo && !cfg!(feature = "mongo") {
            return invalid("store.backend = \"mongo\" requires building with the `mongo` feature");
        }
        Ok(())
    }

    pub fn fixture(&self) -> Fixture {
        let fixture = &self.fixture;
        Fixture {
            user: User {
                id: fixture.user_id,
                name: fixture.user_name.clone(),
                email: fixture.user_email.clone(),
            },
            account: Account {
                id: fixture.account_id,
                user_id: fixture.user_id,
                balance: fixture.initial_balance,
            },
            adjustment: fixture.adjustment,
            cleanup: fixture.cleanup,
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            operation: self
                .transaction
                .operation_timeout_ms
                .map(Duration::from_millis),
            commit: self.transaction.commit_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// `TXN_SMOKE__TRANSACTION__COMMIT_TIMEOUT_MS` sets `transaction.commit_timeout_ms`.
fn environment(vars: Map<String, String>) -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
        .source(Some(vars))
}
