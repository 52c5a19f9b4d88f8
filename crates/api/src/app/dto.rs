use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::{Deserialize, Serialize};

use studyforge_ai::LearnerProfile;
use studyforge_core::{JobId, ProgramId, UserId};
use studyforge_events::Checkpoint;
use studyforge_infra::jobs::{
    BuildJob, JobFilter, JobPage, JobStatus, RecoveryOutcome, RetryOutcome,
};

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateBuildRequest {
    pub profile: LearnerProfile,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListBuildsQuery {
    pub user_id: Option<String>,
    pub program_id: Option<String>,
    pub status: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

impl ListBuildsQuery {
    /// Parse the filter. Without `userId` the caller sees their own jobs.
    pub fn filter(&self, caller: UserId) -> Result<JobFilter, axum::response::Response> {
        let user_id = match self.user_id.as_deref() {
            None => caller,
            Some(raw) => raw.parse::<UserId>().map_err(|e| {
                errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string())
            })?,
        };
        let program_id = self
            .program_id
            .as_deref()
            .map(str::parse::<ProgramId>)
            .transpose()
            .map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()))?;
        let status = match self.status.as_deref() {
            None => None,
            Some(raw) => Some(JobStatus::parse(raw).ok_or_else(|| {
                errors::json_error(
                    StatusCode::BAD_REQUEST,
                    "validation_error",
                    "status must be one of: QUEUED, RUNNING, COMPLETED, FAILED, CANCELED",
                )
            })?),
        };

        Ok(JobFilter {
            user_id: Some(user_id),
            program_id,
            status,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    pub after_index: Option<u64>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedBuildResponse {
    pub job_id: JobId,
    pub program_id: Option<ProgramId>,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReusedBuildResponse {
    pub reused: bool,
    pub job_id: JobId,
    pub program_id: Option<ProgramId>,
    pub status: JobStatus,
}

impl CreatedBuildResponse {
    pub fn from_job(job: &BuildJob) -> Self {
        Self {
            job_id: job.id,
            program_id: job.program_id,
            status: job.status,
        }
    }
}

impl ReusedBuildResponse {
    pub fn from_job(job: &BuildJob) -> Self {
        Self {
            reused: true,
            job_id: job.id,
            program_id: job.program_id,
            status: job.status,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationResponse {
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
    pub has_more: bool,
}

#[derive(Debug, Serialize)]
pub struct ListBuildsResponse {
    pub jobs: Vec<BuildJob>,
    pub pagination: PaginationResponse,
}

impl From<JobPage> for ListBuildsResponse {
    fn from(page: JobPage) -> Self {
        Self {
            pagination: PaginationResponse {
                total: page.total,
                limit: page.limit,
                offset: page.offset,
                has_more: page.has_more,
            },
            jobs: page.jobs,
        }
    }
}

/// Accepted retry or recovery.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequeuedResponse {
    pub success: bool,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub resume_from: Checkpoint,
}

impl From<RetryOutcome> for RequeuedResponse {
    fn from(outcome: RetryOutcome) -> Self {
        Self {
            success: true,
            status: JobStatus::Queued,
            retry_count: outcome.retry_count,
            max_retries: outcome.max_retries,
            resume_from: outcome.resume_from,
        }
    }
}

/// Stale build that recovery failed but could not re-queue.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExhaustedResponse {
    pub success: bool,
    pub reason: &'static str,
    pub message: String,
    pub status: JobStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub checkpoint: Checkpoint,
}

/// Body for either recovery result.
pub fn recovery_response(outcome: RecoveryOutcome) -> axum::response::Response {
    match outcome {
        RecoveryOutcome::Requeued(outcome) => Json(RequeuedResponse::from(outcome)).into_response(),
        RecoveryOutcome::Exhausted {
            retry_count,
            max_retries,
            checkpoint,
        } => Json(ExhaustedResponse {
            success: false,
            reason: "max_retries_reached",
            message: format!(
                "stale build marked FAILED; retry limit reached ({retry_count}/{max_retries})"
            ),
            status: JobStatus::Failed,
            retry_count,
            max_retries,
            checkpoint,
        })
        .into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct CanceledResponse {
    pub success: bool,
    pub status: JobStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_query_defaults_to_caller() {
        let caller = UserId::new();
        let filter = ListBuildsQuery::default().filter(caller).unwrap();
        assert_eq!(filter.user_id, Some(caller));
        assert!(filter.program_id.is_none());
        assert!(filter.status.is_none());
    }

    #[test]
    fn list_query_parses_status_and_rejects_garbage() {
        let query = ListBuildsQuery {
            status: Some("FAILED".into()),
            ..Default::default()
        };
        let filter = query.filter(UserId::new()).unwrap();
        assert_eq!(filter.status, Some(JobStatus::Failed));

        let query = ListBuildsQuery {
            status: Some("sleeping".into()),
            ..Default::default()
        };
        let res = query.filter(UserId::new()).unwrap_err();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let query = ListBuildsQuery {
            program_id: Some("not-a-uuid".into()),
            ..Default::default()
        };
        assert!(query.filter(UserId::new()).is_err());
    }

    #[test]
    fn exhausted_recovery_reports_the_failed_job() {
        let res = recovery_response(RecoveryOutcome::Exhausted {
            retry_count: 3,
            max_retries: 3,
            checkpoint: Checkpoint::default(),
        });
        assert_eq!(res.status(), StatusCode::OK);

        let body = serde_json::to_value(ExhaustedResponse {
            success: false,
            reason: "max_retries_reached",
            message: "retry limit reached".into(),
            status: JobStatus::Failed,
            retry_count: 3,
            max_retries: 3,
            checkpoint: Checkpoint::default(),
        })
        .unwrap();
        assert_eq!(body["status"], "FAILED");
        assert_eq!(body["retryCount"], 3);
        assert_eq!(body["reason"], "max_retries_reached");
    }
}
