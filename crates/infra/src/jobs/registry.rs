//! Job type → handler mapping.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use jobforge_core::{QueueError, QueueResult};

use super::types::Job;

/// Error returned by a handler. The message is recorded on the job.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self(format!("invalid payload: {e}"))
    }
}

/// Executes jobs of one or more types.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, job: &Job) -> Result<serde_json::Value, HandlerError>;
}

/// Adapter for plain synchronous closures.
struct FnHandler<F>(F);

#[async_trait]
impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&Job) -> Result<serde_json::Value, HandlerError> + Send + Sync + 'static,
{
    async fn execute(&self, job: &Job) -> Result<serde_json::Value, HandlerError> {
        (self.0)(job)
    }
}

/// Registry of handlers keyed by job type.
///
/// Keys are exact job types, category patterns (`"report.*"` matches
/// `"report.daily"`), or the wildcard `"*"`. Built once at startup and shared
/// read-only.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same key.
    pub fn register(
        &mut self,
        pattern: impl Into<String>,
        handler: impl JobHandler + 'static,
    ) -> &mut Self {
        self.handlers.insert(pattern.into(), Arc::new(handler));
        self
    }

    /// Register a synchronous closure.
    pub fn register_fn<F>(&mut self, pattern: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&Job) -> Result<serde_json::Value, HandlerError> + Send + Sync + 'static,
    {
        self.register(pattern, FnHandler(handler))
    }

    /// Find the handler for `job_type`.
    pub fn resolve(&self, job_type: &str) -> QueueResult<Arc<dyn JobHandler>> {
        // Try exact match first
        if let Some(h) = self.handlers.get(job_type) {
            return Ok(h.clone());
        }

        // Longest matching category wins
        let category = self
            .handlers
            .iter()
            .filter_map(|(pattern, h)| {
                let prefix = pattern.strip_suffix(".*")?;
                let rest = job_type.strip_prefix(prefix)?;
                rest.starts_with('.').then_some((prefix.len(), h))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, h)| h.clone());
        if let Some(h) = category {
            return Ok(h);
        }

        self.handlers
            .get("*")
            .cloned()
            .ok_or_else(|| QueueError::unknown_type(job_type))
    }

    /// Exact job types registered, sorted. Patterns are not included.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .keys()
            .filter(|k| *k != "*" && !k.ends_with(".*"))
            .cloned()
            .collect();
        types.sort();
        types
    }

    /// Whether any pattern or wildcard is registered.
    pub fn has_patterns(&self) -> bool {
        self.handlers.keys().any(|k| k == "*" || k.ends_with(".*"))
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.handlers.keys().collect();
        keys.sort();
        f.debug_struct("HandlerRegistry").field("handlers", &keys).finish()
    }
}
