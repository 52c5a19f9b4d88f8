//! Infrastructure layer: job orchestration, stores, projections, streaming.

pub mod config;
pub mod jobs;
pub mod program;
pub mod projections;
pub mod stream;

#[cfg(test)]
pub(crate) mod testing;

pub use config::OrchestratorConfig;
