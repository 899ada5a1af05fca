use std::sync::Arc;

use anyhow::Context;

use jobforge_infra::config::StoreConfig;
use jobforge_infra::jobs::{InMemoryJobStore, JobStore, QueueManager, RetryBackoff};

/// Queue manager over whichever store the process was configured with.
pub type SharedQueue = QueueManager<Arc<dyn JobStore>>;

/// Services shared by all handlers.
pub struct AppServices {
    pub queue: Arc<SharedQueue>,
    /// `"in_memory"` or `"postgres"`
    pub backend: &'static str,
}

impl AppServices {
    /// In-memory services for tests and local runs.
    pub fn in_memory() -> Self {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        Self {
            queue: Arc::new(QueueManager::new(store)),
            backend: "in_memory",
        }
    }

    pub async fn from_config(config: &StoreConfig, backoff: RetryBackoff) -> anyhow::Result<Self> {
        let store = config
            .open(backoff)
            .await
            .context("failed to open job store")?;
        Ok(Self {
            queue: Arc::new(QueueManager::new(store)),
            backend: if config.is_persistent() { "postgres" } else { "in_memory" },
        })
    }

    /// `USE_PERSISTENT_STORES`, `DATABASE_URL` and the retry settings.
    pub async fn from_env() -> anyhow::Result<Self> {
        let config = StoreConfig::from_env()?;
        let backoff = RetryBackoff::from_env()?;
        Self::from_config(&config, backoff).await
    }
}
