//! Infrastructure layer: job model, stores, worker runtime, config.

pub mod config;
pub mod jobs;
