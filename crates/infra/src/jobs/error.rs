use studyforge_core::{DomainError, JobId};
use studyforge_events::BuildPhase;

use super::store::JobStoreError;
use super::types::JobStatus;
use crate::program::ProgramStoreError;

/// Orchestrator error taxonomy.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BuildError {
    #[error("build job not found: {0}")]
    NotFound(JobId),

    #[error("{message} (current status: {status})")]
    InvalidState { status: JobStatus, message: String },

    #[error("retry limit reached ({retry_count}/{max_retries})")]
    LimitExceeded { retry_count: u32, max_retries: u32 },

    #[error("job is not RUNNING (current status: {status})")]
    NotRunning { status: JobStatus },

    #[error("heartbeat is not stale ({age_secs}s old, threshold {threshold_secs}s)")]
    HeartbeatNotStale { age_secs: i64, threshold_secs: i64 },

    #[error("user already has an active build job: {0}")]
    DuplicateActiveJob(JobId),

    #[error("{phase} phase failed: {message}")]
    PhaseFailed { phase: BuildPhase, message: String },

    #[error("stale heartbeat: no sign of life for {stale_seconds}s")]
    StaleExecution { stale_seconds: i64 },

    #[error("concurrent modification: {0}")]
    Conflict(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("job store error: {0}")]
    Store(JobStoreError),

    #[error("program store error: {0}")]
    Program(#[from] ProgramStoreError),
}

impl BuildError {
    /// Machine-readable reason code for API refusals.
    pub fn reason(&self) -> &'static str {
        match self {
            BuildError::NotFound(_) => "not_found",
            BuildError::InvalidState { .. } => "invalid_status",
            BuildError::LimitExceeded { .. } => "max_retries_reached",
            BuildError::NotRunning { .. } => "not_running",
            BuildError::HeartbeatNotStale { .. } => "heartbeat_not_stale",
            BuildError::DuplicateActiveJob(_) => "duplicate_active_job",
            BuildError::PhaseFailed { .. } => "phase_failed",
            BuildError::StaleExecution { .. } => "stale_execution",
            BuildError::Conflict(_) => "conflict",
            BuildError::Validation(_) => "validation_error",
            BuildError::Store(_) | BuildError::Program(_) => "internal_error",
        }
    }

    pub fn invalid_state(status: JobStatus, message: impl Into<String>) -> Self {
        Self::InvalidState {
            status,
            message: message.into(),
        }
    }
}

impl From<JobStoreError> for BuildError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => BuildError::NotFound(id),
            JobStoreError::Conflict(msg) => BuildError::Conflict(msg),
            JobStoreError::InvalidTransition { from, to } => {
                BuildError::invalid_state(from, format!("cannot move job to {to}"))
            }
            JobStoreError::LeaseLost(id) => {
                BuildError::Conflict(format!("job {id} is owned by another runner"))
            }
            JobStoreError::StillAlive { job_id, last_seen } => {
                BuildError::Conflict(format!("job {job_id} showed life at {last_seen}"))
            }
            other => BuildError::Store(other),
        }
    }
}

impl From<DomainError> for BuildError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Conflict(msg) => BuildError::Conflict(msg),
            other => BuildError::Validation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_into_the_taxonomy() {
        let id = JobId::new();
        assert_eq!(
            BuildError::from(JobStoreError::NotFound(id)),
            BuildError::NotFound(id)
        );
        let err = BuildError::from(JobStoreError::InvalidTransition {
            from: JobStatus::Completed,
            to: JobStatus::Queued,
        });
        assert_eq!(err.reason(), "invalid_status");
        assert_eq!(
            BuildError::from(JobStoreError::Storage("down".into())).reason(),
            "internal_error"
        );
    }
}
