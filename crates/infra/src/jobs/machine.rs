//! Job state machine: creation, dedup, patches, appends, cancel, listing.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use studyforge_ai::LearnerProfile;
use studyforge_core::{ExpectedIndex, JobId, UserId};
use studyforge_events::payload::{JobCanceled, JobQueued};
use studyforge_events::{BuildEvent, EventDraft, EventLevel, EventPayload, EventStatus, kind};

use super::error::BuildError;
use super::store::BuildJobStore;
use super::types::{BuildJob, JobFilter, JobPage, JobPatch, JobStatus, Pagination};
use crate::config::OrchestratorConfig;

/// Result of a build submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    Created(BuildJob),
    /// The user already had an active job; nothing was created.
    Reused(BuildJob),
}

impl Submission {
    pub fn job(&self) -> &BuildJob {
        match self {
            Submission::Created(job) | Submission::Reused(job) => job,
        }
    }

    pub fn is_reused(&self) -> bool {
        matches!(self, Submission::Reused(_))
    }
}

/// Entry point for job lifecycle operations.
#[derive(Clone)]
pub struct BuildJobs {
    store: Arc<dyn BuildJobStore>,
    max_retries: u32,
}

impl BuildJobs {
    pub fn new(store: Arc<dyn BuildJobStore>, config: &OrchestratorConfig) -> Self {
        Self {
            store,
            max_retries: config.max_retries,
        }
    }

    pub fn store(&self) -> &Arc<dyn BuildJobStore> {
        &self.store
    }

    /// Create a QUEUED job with its parameters. Leaves the event log empty.
    pub async fn create_job(
        &self,
        user_id: UserId,
        params: LearnerProfile,
    ) -> Result<BuildJob, BuildError> {
        params.validate()?;
        if let Some(active) = self.store.find_active_for_user(user_id).await? {
            return Err(BuildError::DuplicateActiveJob(active.id));
        }

        let job = BuildJob::new(user_id, params, self.max_retries, Utc::now());
        self.store.insert(job.clone()).await?;
        info!(job_id = %job.id, user_id = %user_id, "build job created");
        Ok(job)
    }

    /// Most recent QUEUED or RUNNING job of the user.
    pub async fn get_active_job_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<BuildJob>, BuildError> {
        Ok(self.store.find_active_for_user(user_id).await?)
    }

    /// Reuse the user's active job or create one and log `job.queued`.
    ///
    /// Check-then-act: two racing submissions may both create a job. Both
    /// stay visible; neither fails.
    pub async fn submit(
        &self,
        user_id: UserId,
        params: LearnerProfile,
    ) -> Result<Submission, BuildError> {
        if let Some(active) = self.get_active_job_for_user(user_id).await? {
            debug!(job_id = %active.id, "reusing active build job");
            return Ok(Submission::Reused(active));
        }

        let job = self.create_job(user_id, params).await?;
        let payload = EventPayload::JobQueued(JobQueued {
            user_id,
            program_id: job.program_id,
            max_retries: job.max_retries,
        });
        let (_, job) = self
            .store
            .append_event(
                job.id,
                EventDraft::new(kind::JOB_QUEUED, "Build queued")
                    .status(EventStatus::Pending)
                    .payload(payload),
                ExpectedIndex::Exact(0),
                JobPatch::new(),
                Utc::now(),
            )
            .await?;
        Ok(Submission::Created(job))
    }

    /// Merge a patch. Status changes are checked against the transition table.
    pub async fn update_job_state(
        &self,
        job_id: JobId,
        patch: JobPatch,
    ) -> Result<BuildJob, BuildError> {
        Ok(self.store.update(job_id, patch, Utc::now()).await?)
    }

    /// Append at the next index.
    pub async fn append_event(
        &self,
        job_id: JobId,
        draft: EventDraft,
    ) -> Result<BuildEvent, BuildError> {
        self.append_event_at(job_id, draft, ExpectedIndex::Any).await
    }

    /// Append only if the log still ends at `expected`.
    pub async fn append_event_at(
        &self,
        job_id: JobId,
        draft: EventDraft,
        expected: ExpectedIndex,
    ) -> Result<BuildEvent, BuildError> {
        let (event, _) = self
            .store
            .append_event(job_id, draft, expected, JobPatch::new(), Utc::now())
            .await?;
        Ok(event)
    }

    pub async fn events_since(
        &self,
        job_id: JobId,
        after_index: u64,
    ) -> Result<Vec<BuildEvent>, BuildError> {
        Ok(self.store.events_since(job_id, after_index).await?)
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<BuildJob>, BuildError> {
        Ok(self.store.get(job_id).await?)
    }

    pub async fn get_job_or_fail(&self, job_id: JobId) -> Result<BuildJob, BuildError> {
        self.store
            .get(job_id)
            .await?
            .ok_or(BuildError::NotFound(job_id))
    }

    /// Cancel a QUEUED or RUNNING job. A runner holding the job loses its
    /// lease and stops at its next heartbeat.
    pub async fn cancel_job(&self, job_id: JobId) -> Result<BuildJob, BuildError> {
        let job = self.get_job_or_fail(job_id).await?;
        if !job.status.is_active() {
            return Err(BuildError::invalid_state(
                job.status,
                "only QUEUED or RUNNING jobs can be canceled",
            ));
        }

        let now = Utc::now();
        let payload = EventPayload::JobCanceled(JobCanceled {
            previous_status: job.status.as_str().to_string(),
        });
        let (_, job) = self
            .store
            .append_event(
                job_id,
                EventDraft::new(kind::JOB_CANCELED, "Build canceled")
                    .status(EventStatus::Skipped)
                    .level(EventLevel::Warn)
                    .message("canceled on request")
                    .payload(payload),
                ExpectedIndex::Any,
                JobPatch::new()
                    .expect_status(job.status)
                    .status(JobStatus::Canceled)
                    .finished_at(Some(now))
                    .current_item(None)
                    .release_lease(),
                now,
            )
            .await?;
        info!(job_id = %job_id, "build job canceled");
        Ok(job)
    }

    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
        page: Pagination,
    ) -> Result<JobPage, BuildError> {
        Ok(self.store.list(filter, page).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::InMemoryBuildJobStore;
    use crate::testing::profile;

    fn machine() -> BuildJobs {
        BuildJobs::new(InMemoryBuildJobStore::arc(), &OrchestratorConfig::default())
    }

    #[tokio::test]
    async fn create_then_append_first_event() {
        let jobs = machine();
        let user = UserId::new();

        let job = jobs.create_job(user, profile()).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.last_event_index, 0);

        let event = jobs
            .append_event(job.id, EventDraft::new(kind::JOB_QUEUED, "Build queued"))
            .await
            .unwrap();
        assert_eq!(event.index, 1);

        let job = jobs.get_job_or_fail(job.id).await.unwrap();
        assert_eq!(job.last_event_index, 1);
        let events = jobs.events_since(job.id, 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, kind::JOB_QUEUED);
    }

    #[tokio::test]
    async fn duplicate_create_is_refused() {
        let jobs = machine();
        let user = UserId::new();
        let first = jobs.create_job(user, profile()).await.unwrap();

        let err = jobs.create_job(user, profile()).await.unwrap_err();
        assert_eq!(err, BuildError::DuplicateActiveJob(first.id));
        let active = jobs.get_active_job_for_user(user).await.unwrap().unwrap();
        assert_eq!(active.id, first.id);
    }

    #[tokio::test]
    async fn second_submit_reuses_the_active_job() {
        let jobs = machine();
        let user = UserId::new();

        let first = jobs.submit(user, profile()).await.unwrap();
        assert!(!first.is_reused());
        assert_eq!(first.job().last_event_index, 1);

        let second = jobs.submit(user, profile()).await.unwrap();
        assert!(second.is_reused());
        assert_eq!(second.job().id, first.job().id);

        let page = jobs
            .list_jobs(
                &JobFilter {
                    user_id: Some(user),
                    ..Default::default()
                },
                Pagination::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn invalid_profile_is_a_validation_error() {
        let jobs = machine();
        let mut params = profile();
        params.weeks = 0;
        let err = jobs.create_job(UserId::new(), params).await.unwrap_err();
        assert_eq!(err.reason(), "validation_error");
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let jobs = machine();
        let id = JobId::new();
        assert_eq!(
            jobs.get_job_or_fail(id).await.unwrap_err(),
            BuildError::NotFound(id)
        );
        assert_eq!(
            jobs.events_since(id, 0).await.unwrap_err(),
            BuildError::NotFound(id)
        );
    }

    #[tokio::test]
    async fn cancel_only_applies_to_active_jobs() {
        let jobs = machine();
        let job = jobs.create_job(UserId::new(), profile()).await.unwrap();

        let canceled = jobs.cancel_job(job.id).await.unwrap();
        assert_eq!(canceled.status, JobStatus::Canceled);
        assert!(canceled.finished_at.is_some());

        let err = jobs.cancel_job(job.id).await.unwrap_err();
        assert!(matches!(
            err,
            BuildError::InvalidState {
                status: JobStatus::Canceled,
                ..
            }
        ));
        let events = jobs.events_since(job.id, 0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, kind::JOB_CANCELED);
    }

    #[tokio::test]
    async fn transition_table_guards_updates() {
        let jobs = machine();
        let job = jobs.create_job(UserId::new(), profile()).await.unwrap();
        let err = jobs
            .update_job_state(job.id, JobPatch::new().status(JobStatus::Failed))
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "invalid_status");

        let before = job.updated_at;
        let updated = jobs
            .update_job_state(job.id, JobPatch::new().current_item(Some("x".into())))
            .await
            .unwrap();
        assert!(updated.updated_at >= before);
        assert_eq!(updated.current_item.as_deref(), Some("x"));
    }
}
