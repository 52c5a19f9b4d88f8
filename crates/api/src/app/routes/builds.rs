use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{
        IntoResponse,
        sse::{Event as SseEvent, KeepAlive, Sse},
    },
    routing::{get, post},
};
use chrono::Utc;
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;

use studyforge_core::JobId;
use studyforge_infra::jobs::{BuildError, BuildJob, Pagination, Submission};

use crate::app::services::AppServices;
use crate::app::{dto, errors};
use crate::context::UserContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_build).get(list_builds))
        .route("/:job_id", get(get_build))
        .route("/:job_id/retry", post(retry_build))
        .route("/:job_id/recover", post(recover_build))
        .route("/:job_id/cancel", post(cancel_build))
        .route("/:job_id/stream", get(stream_build))
}

/// The job, if it belongs to the caller. Other users' jobs read as missing.
async fn owned_job(
    services: &AppServices,
    user: &UserContext,
    job_id: JobId,
) -> Result<BuildJob, BuildError> {
    match services.jobs.get_job(job_id).await? {
        Some(job) if job.user_id == user.user_id() => Ok(job),
        _ => Err(BuildError::NotFound(job_id)),
    }
}

pub async fn create_build(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Json(body): Json<dto::CreateBuildRequest>,
) -> axum::response::Response {
    let submission = match services.jobs.submit(user.user_id(), body.profile).await {
        Ok(s) => s,
        Err(e) => return errors::build_error_to_response(e),
    };

    // Reused jobs may be QUEUED with nobody running them yet.
    services.dispatcher.ensure_running(submission.job().id);

    match submission {
        Submission::Created(job) => (
            StatusCode::CREATED,
            Json(dto::CreatedBuildResponse::from_job(&job)),
        )
            .into_response(),
        Submission::Reused(job) => (
            StatusCode::ACCEPTED,
            Json(dto::ReusedBuildResponse::from_job(&job)),
        )
            .into_response(),
    }
}

pub async fn list_builds(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Query(query): Query<dto::ListBuildsQuery>,
) -> axum::response::Response {
    let filter = match query.filter(user.user_id()) {
        Ok(f) => f,
        Err(res) => return res,
    };
    // Listing is scoped to the caller.
    if filter.user_id != Some(user.user_id()) {
        return errors::json_error(
            StatusCode::FORBIDDEN,
            "forbidden",
            "jobs of other users cannot be listed",
        );
    }

    let page = Pagination::new(query.limit, query.offset);
    match services.jobs.list_jobs(&filter, page).await {
        Ok(page) => Json(dto::ListBuildsResponse::from(page)).into_response(),
        Err(e) => errors::build_error_to_response(e),
    }
}

pub async fn get_build(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&job_id) {
        Ok(id) => id,
        Err(res) => return res,
    };

    match services.projector.get_build_view(job_id).await {
        Ok(Some(view)) if view.job.user_id == user.user_id() => Json(view).into_response(),
        Ok(_) => errors::build_error_to_response(BuildError::NotFound(job_id)),
        Err(e) => errors::build_error_to_response(e),
    }
}

pub async fn retry_build(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&job_id) {
        Ok(id) => id,
        Err(res) => return res,
    };
    if let Err(e) = owned_job(&services, &user, job_id).await {
        return errors::refusal_to_response(e);
    }

    match services.recovery.retry(job_id).await {
        Ok(outcome) => Json(dto::RequeuedResponse::from(outcome)).into_response(),
        Err(e) => errors::refusal_to_response(e),
    }
}

pub async fn recover_build(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&job_id) {
        Ok(id) => id,
        Err(res) => return res,
    };
    if let Err(e) = owned_job(&services, &user, job_id).await {
        return errors::refusal_to_response(e);
    }

    match services.recovery.recover_stale(job_id, Utc::now()).await {
        Ok(outcome) => dto::recovery_response(outcome),
        Err(e) => errors::refusal_to_response(e),
    }
}

pub async fn cancel_build(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&job_id) {
        Ok(id) => id,
        Err(res) => return res,
    };
    if let Err(e) = owned_job(&services, &user, job_id).await {
        return errors::refusal_to_response(e);
    }

    match services.jobs.cancel_job(job_id).await {
        Ok(job) => Json(dto::CanceledResponse {
            success: true,
            status: job.status,
        })
        .into_response(),
        Err(e) => errors::refusal_to_response(e),
    }
}

/// Server-sent events for one job, resuming after `afterIndex`.
///
/// Unknown jobs still get a stream (`error` then `done`); jobs of other
/// users are a plain 404.
pub async fn stream_build(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(user): Extension<UserContext>,
    Path(job_id): Path<String>,
    Query(query): Query<dto::StreamQuery>,
) -> axum::response::Response {
    let job_id = match errors::parse_job_id(&job_id) {
        Ok(id) => id,
        Err(res) => return res,
    };
    match services.jobs.get_job(job_id).await {
        Ok(Some(job)) if job.user_id != user.user_id() => {
            return errors::build_error_to_response(BuildError::NotFound(job_id));
        }
        Ok(_) => {}
        Err(e) => return errors::build_error_to_response(e),
    }

    let after_index = query.after_index.unwrap_or(0);
    tracing::debug!(job_id = %job_id, after_index, "build stream opened");

    let cancel = CancellationToken::new();
    let rx = services.gateway.spawn(job_id, after_index, cancel.clone());

    // Dropped with the response body, so a disconnect wakes the pump at once.
    let guard = cancel.drop_guard();
    let stream = ReceiverStream::new(rx).map(move |msg| {
        let _held = &guard;
        Ok::<_, Infallible>(
            SseEvent::default()
                .event(msg.name())
                .data(msg.data().to_string()),
        )
    });

    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}
