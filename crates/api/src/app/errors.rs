use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use studyforge_core::JobId;
use studyforge_infra::jobs::BuildError;

/// HTTP status for an orchestrator error.
pub fn status_for(err: &BuildError) -> StatusCode {
    match err {
        BuildError::NotFound(_) => StatusCode::NOT_FOUND,
        BuildError::Validation(_) => StatusCode::BAD_REQUEST,
        BuildError::InvalidState { .. }
        | BuildError::LimitExceeded { .. }
        | BuildError::NotRunning { .. }
        | BuildError::HeartbeatNotStale { .. }
        | BuildError::DuplicateActiveJob(_)
        | BuildError::Conflict(_) => StatusCode::CONFLICT,
        BuildError::PhaseFailed { .. }
        | BuildError::StaleExecution { .. }
        | BuildError::Store(_)
        | BuildError::Program(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Client-facing message. Infrastructure details stay in the logs.
fn public_message(err: &BuildError, status: StatusCode) -> String {
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "build request failed");
        "internal error, please try again later".to_string()
    } else {
        err.to_string()
    }
}

pub fn build_error_to_response(err: BuildError) -> axum::response::Response {
    let status = status_for(&err);
    let message = public_message(&err, status);
    json_error(status, err.reason(), message)
}

/// Refusal body used by the retry, recover and cancel endpoints.
pub fn refusal_to_response(err: BuildError) -> axum::response::Response {
    let status = status_for(&err);
    let message = public_message(&err, status);
    (
        status,
        axum::Json(json!({
            "success": false,
            "reason": err.reason(),
            "message": message,
        })),
    )
        .into_response()
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_job_id(s: &str) -> Result<JobId, axum::response::Response> {
    s.parse::<JobId>()
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()))
}
