//! Environment-driven configuration.
//!
//! Read once at startup into typed values; nothing here is global.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use jobforge_core::QueueResult;

use crate::jobs::postgres::PostgresJobStore;
use crate::jobs::store::{InMemoryJobStore, JobStore};
use crate::jobs::types::{BackoffStrategy, RetryBackoff};

pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set when USE_PERSISTENT_STORES=true")]
    Missing(&'static str),

    #[error("invalid value for {key}: '{value}'")]
    Invalid { key: &'static str, value: String },
}

/// Which job store backs the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    InMemory,
    Postgres {
        database_url: String,
        max_connections: u32,
    },
}

impl StoreConfig {
    /// `USE_PERSISTENT_STORES`, `DATABASE_URL`, `JOBFORGE_DB_MAX_CONNECTIONS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let persistent = match lookup("USE_PERSISTENT_STORES") {
            Some(v) => parse_bool("USE_PERSISTENT_STORES", &v)?,
            None => false,
        };
        if !persistent {
            return Ok(Self::InMemory);
        }

        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let max_connections = parse_or(
            &lookup,
            "JOBFORGE_DB_MAX_CONNECTIONS",
            DEFAULT_MAX_CONNECTIONS,
        )?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "JOBFORGE_DB_MAX_CONNECTIONS",
                value: "0".into(),
            });
        }

        Ok(Self::Postgres {
            database_url,
            max_connections,
        })
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self, Self::Postgres { .. })
    }

    /// Build the configured store. Postgres connections are opened and the
    /// schema is applied before returning.
    pub async fn open(&self, backoff: RetryBackoff) -> QueueResult<Arc<dyn JobStore>> {
        match self {
            Self::InMemory => {
                info!("using in-memory job store");
                Ok(Arc::new(InMemoryJobStore::new().with_backoff(backoff)))
            }
            Self::Postgres {
                database_url,
                max_connections,
            } => {
                let store = PostgresJobStore::connect(database_url, *max_connections)
                    .await?
                    .with_backoff(backoff);
                store.migrate().await?;
                info!(max_connections, "using postgres job store");
                Ok(Arc::new(store))
            }
        }
    }
}

impl RetryBackoff {
    /// `JOBFORGE_RETRY_STRATEGY`, `JOBFORGE_RETRY_BASE_MS`, `JOBFORGE_RETRY_MAX_MS`.
    /// Unset values keep the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = RetryBackoff::default();

        let strategy = match lookup("JOBFORGE_RETRY_STRATEGY") {
            Some(v) => v.parse::<BackoffStrategy>().map_err(|_| ConfigError::Invalid {
                key: "JOBFORGE_RETRY_STRATEGY",
                value: v,
            })?,
            None => defaults.strategy,
        };
        let base_ms = parse_or(
            &lookup,
            "JOBFORGE_RETRY_BASE_MS",
            defaults.base_delay.as_millis() as u64,
        )?;
        let max_ms = parse_or(
            &lookup,
            "JOBFORGE_RETRY_MAX_MS",
            defaults.max_delay.as_millis() as u64,
        )?;

        Ok(Self {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms.max(base_ms)),
            strategy,
            jitter: if strategy == BackoffStrategy::Exponential {
                defaults.jitter
            } else {
                0.0
            },
        })
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(v) => v.trim().parse().map_err(|_| ConfigError::Invalid { key, value: v }),
        None => Ok(default),
    }
}
