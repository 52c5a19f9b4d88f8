//! Job and event-log storage.
//!
//! A job row and its event log live behind one trait so that appending an
//! event and advancing `last_event_index` (plus any counter patch) happen in a
//! single atomic step.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use studyforge_core::{ExpectedIndex, JobId, UserId};
use studyforge_events::{BuildEvent, EventDraft};

use super::types::{BuildJob, JobFilter, JobGuard, JobPage, JobPatch, JobStatus, Pagination};

/// Job store abstraction.
#[async_trait]
pub trait BuildJobStore: Send + Sync {
    /// Insert a new job.
    async fn insert(&self, job: BuildJob) -> Result<(), JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<BuildJob>, JobStoreError>;

    /// Most recently created QUEUED or RUNNING job of a user.
    async fn find_active_for_user(&self, user_id: UserId)
    -> Result<Option<BuildJob>, JobStoreError>;

    /// Apply a patch (guard and transition checked atomically with the write).
    async fn update(
        &self,
        job_id: JobId,
        patch: JobPatch,
        now: DateTime<Utc>,
    ) -> Result<BuildJob, JobStoreError>;

    /// Append one event at `last_event_index + 1` and apply `patch` in the same
    /// step. Fails with `Conflict` when `expected` does not match.
    async fn append_event(
        &self,
        job_id: JobId,
        draft: EventDraft,
        expected: ExpectedIndex,
        patch: JobPatch,
        now: DateTime<Utc>,
    ) -> Result<(BuildEvent, BuildJob), JobStoreError>;

    /// Events with index > `after_index`, ascending.
    async fn events_since(
        &self,
        job_id: JobId,
        after_index: u64,
    ) -> Result<Vec<BuildEvent>, JobStoreError>;

    /// Take the job for `runner_id` until `lease_until`.
    async fn try_claim(
        &self,
        job_id: JobId,
        runner_id: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, JobStoreError>;

    /// Refresh heartbeat and lease. `LeaseLost` if the runner no longer owns the job.
    async fn heartbeat(
        &self,
        job_id: JobId,
        runner_id: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<BuildJob, JobStoreError>;

    async fn list(&self, filter: &JobFilter, page: Pagination) -> Result<JobPage, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("lease lost for job {0}")]
    LeaseLost(JobId),
    #[error("job {job_id} showed life at {last_seen}")]
    StillAlive {
        job_id: JobId,
        last_seen: DateTime<Utc>,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result of a claim attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed(BuildJob),
    /// Another (or this) runner holds a live lease.
    Held { runner_id: String },
    /// Status does not allow execution.
    Unclaimable(JobStatus),
}

impl JobGuard {
    pub fn check(&self, job: &BuildJob) -> Result<(), JobStoreError> {
        if let Some(expected) = self.status {
            if job.status != expected {
                return Err(JobStoreError::Conflict(format!(
                    "job {} is {}, expected {}",
                    job.id, job.status, expected
                )));
            }
        }
        if let Some(runner) = self.runner.as_deref() {
            if !job.is_held_by(runner) {
                return Err(JobStoreError::LeaseLost(job.id));
            }
        }
        if let Some(cutoff) = self.seen_before {
            let last_seen = job.last_seen_at();
            if last_seen > cutoff {
                return Err(JobStoreError::StillAlive {
                    job_id: job.id,
                    last_seen,
                });
            }
        }
        Ok(())
    }
}

/// Check guard and transition for `patch` against the current row.
pub fn validate_patch(job: &BuildJob, patch: &JobPatch) -> Result<(), JobStoreError> {
    patch.guard.check(job)?;
    if let Some(next) = patch.status {
        if next != job.status && !job.status.can_transition_to(next) {
            return Err(JobStoreError::InvalidTransition {
                from: job.status,
                to: next,
            });
        }
    }
    Ok(())
}

/// Patch a claim applies, or why the job cannot be claimed.
pub fn claim_patch(
    job: &BuildJob,
    runner_id: &str,
    lease_until: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<JobPatch, ClaimOutcome> {
    match job.status {
        JobStatus::Queued => Ok(JobPatch::new()
            .status(JobStatus::Running)
            .started_at(Some(now))
            .finished_at(None)
            .error(None)
            .heartbeat(now)
            .lease(runner_id, lease_until)),
        JobStatus::Running if job.lease_is_live(now) => Err(ClaimOutcome::Held {
            runner_id: job.claimed_by.clone().unwrap_or_default(),
        }),
        JobStatus::Running => Ok(JobPatch::new()
            .status(JobStatus::Running)
            .heartbeat(now)
            .lease(runner_id, lease_until)),
        other => Err(ClaimOutcome::Unclaimable(other)),
    }
}

/// Patch a heartbeat applies, or `LeaseLost`.
pub fn heartbeat_patch(
    job: &BuildJob,
    runner_id: &str,
    lease_until: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<JobPatch, JobStoreError> {
    if job.status != JobStatus::Running || !job.is_held_by(runner_id) {
        return Err(JobStoreError::LeaseLost(job.id));
    }
    Ok(JobPatch::new().heartbeat(now).lease(runner_id, lease_until))
}

#[derive(Debug)]
struct JobEntry {
    job: BuildJob,
    events: Vec<BuildEvent>,
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryBuildJobStore {
    jobs: RwLock<HashMap<JobId, JobEntry>>,
}

fn poisoned<T>(_: T) -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

impl InMemoryBuildJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl BuildJobStore for InMemoryBuildJobStore {
    async fn insert(&self, job: BuildJob) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(
            job.id,
            JobEntry {
                job,
                events: Vec::new(),
            },
        );
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<BuildJob>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs.get(&job_id).map(|e| e.job.clone()))
    }

    async fn find_active_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<BuildJob>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        Ok(jobs
            .values()
            .map(|e| &e.job)
            .filter(|j| j.user_id == user_id && j.status.is_active())
            .max_by_key(|j| (j.created_at, j.id))
            .cloned())
    }

    async fn update(
        &self,
        job_id: JobId,
        patch: JobPatch,
        now: DateTime<Utc>,
    ) -> Result<BuildJob, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let entry = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        validate_patch(&entry.job, &patch)?;
        patch.apply(&mut entry.job, now);
        Ok(entry.job.clone())
    }

    async fn append_event(
        &self,
        job_id: JobId,
        draft: EventDraft,
        expected: ExpectedIndex,
        patch: JobPatch,
        now: DateTime<Utc>,
    ) -> Result<(BuildEvent, BuildJob), JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let entry = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;

        expected
            .check(entry.job.last_event_index)
            .map_err(|e| JobStoreError::Conflict(e.to_string()))?;
        validate_patch(&entry.job, &patch)?;

        let index = entry.job.last_event_index + 1;
        let event = draft.into_event(job_id, index, now);
        entry.events.push(event.clone());
        entry.job.last_event_index = index;
        patch.apply(&mut entry.job, now);

        Ok((event, entry.job.clone()))
    }

    async fn events_since(
        &self,
        job_id: JobId,
        after_index: u64,
    ) -> Result<Vec<BuildEvent>, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let entry = jobs.get(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        // Indices are 1-based and gapless, so the suffix starts at `after_index`.
        let start = usize::try_from(after_index)
            .unwrap_or(usize::MAX)
            .min(entry.events.len());
        Ok(entry.events[start..].to_vec())
    }

    async fn try_claim(
        &self,
        job_id: JobId,
        runner_id: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let entry = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        match claim_patch(&entry.job, runner_id, lease_until, now) {
            Ok(patch) => {
                patch.apply(&mut entry.job, now);
                Ok(ClaimOutcome::Claimed(entry.job.clone()))
            }
            Err(outcome) => Ok(outcome),
        }
    }

    async fn heartbeat(
        &self,
        job_id: JobId,
        runner_id: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<BuildJob, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(poisoned)?;
        let entry = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        heartbeat_patch(&entry.job, runner_id, lease_until, now)?.apply(&mut entry.job, now);
        Ok(entry.job.clone())
    }

    async fn list(&self, filter: &JobFilter, page: Pagination) -> Result<JobPage, JobStoreError> {
        let jobs = self.jobs.read().map_err(poisoned)?;
        let mut matched: Vec<&BuildJob> = jobs
            .values()
            .map(|e| &e.job)
            .filter(|j| filter.matches(j))
            .collect();
        matched.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));

        let total = matched.len() as u64;
        let jobs = matched
            .into_iter()
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .cloned()
            .collect();
        Ok(JobPage::new(jobs, total, page))
    }
}

#[async_trait]
impl BuildJobStore for Arc<InMemoryBuildJobStore> {
    async fn insert(&self, job: BuildJob) -> Result<(), JobStoreError> {
        (**self).insert(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<BuildJob>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn find_active_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<BuildJob>, JobStoreError> {
        (**self).find_active_for_user(user_id).await
    }

    async fn update(
        &self,
        job_id: JobId,
        patch: JobPatch,
        now: DateTime<Utc>,
    ) -> Result<BuildJob, JobStoreError> {
        (**self).update(job_id, patch, now).await
    }

    async fn append_event(
        &self,
        job_id: JobId,
        draft: EventDraft,
        expected: ExpectedIndex,
        patch: JobPatch,
        now: DateTime<Utc>,
    ) -> Result<(BuildEvent, BuildJob), JobStoreError> {
        (**self).append_event(job_id, draft, expected, patch, now).await
    }

    async fn events_since(
        &self,
        job_id: JobId,
        after_index: u64,
    ) -> Result<Vec<BuildEvent>, JobStoreError> {
        (**self).events_since(job_id, after_index).await
    }

    async fn try_claim(
        &self,
        job_id: JobId,
        runner_id: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, JobStoreError> {
        (**self).try_claim(job_id, runner_id, lease_until, now).await
    }

    async fn heartbeat(
        &self,
        job_id: JobId,
        runner_id: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<BuildJob, JobStoreError> {
        (**self).heartbeat(job_id, runner_id, lease_until, now).await
    }

    async fn list(&self, filter: &JobFilter, page: Pagination) -> Result<JobPage, JobStoreError> {
        (**self).list(filter, page).await
    }
}
