//! Build job record and the partial updates applied to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use studyforge_ai::LearnerProfile;
use studyforge_core::{JobId, ProgramId, UserId};
use studyforge_events::BuildPhase;

/// Job status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// QUEUED or RUNNING: counts towards the one-active-job-per-user rule.
    pub fn is_active(self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    /// Allowed status transitions.
    ///
    /// `Running -> Running` is a claim taking over an expired lease;
    /// `Failed -> Queued` is only produced by the retry flow.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Canceled)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Canceled)
                | (Failed, Queued)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<JobStatus> {
        match s.to_ascii_uppercase().as_str() {
            "QUEUED" => Some(JobStatus::Queued),
            "RUNNING" => Some(JobStatus::Running),
            "COMPLETED" => Some(JobStatus::Completed),
            "FAILED" => Some(JobStatus::Failed),
            "CANCELED" => Some(JobStatus::Canceled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One program build, reused across retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildJob {
    pub id: JobId,
    pub user_id: UserId,
    pub program_id: Option<ProgramId>,

    pub status: JobStatus,
    pub phase: BuildPhase,
    pub current_item: Option<String>,
    pub total_modules: u32,
    pub completed_modules: u32,
    pub total_lessons: u32,
    pub completed_lessons: u32,

    pub retry_count: u32,
    pub max_retries: u32,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub error: Option<String>,
    /// Highest event index written so far (0 = no events).
    pub last_event_index: u64,

    pub params: LearnerProfile,

    pub claimed_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl BuildJob {
    pub fn new(
        user_id: UserId,
        params: LearnerProfile,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            user_id,
            program_id: None,
            status: JobStatus::Queued,
            phase: BuildPhase::Plan,
            current_item: None,
            total_modules: 0,
            completed_modules: 0,
            total_lessons: 0,
            completed_lessons: 0,
            retry_count: 0,
            max_retries,
            started_at: None,
            finished_at: None,
            last_heartbeat_at: None,
            created_at: now,
            updated_at: now,
            error: None,
            last_event_index: 0,
            params,
            claimed_by: None,
            lease_expires_at: None,
        }
    }

    /// Whether some runner currently holds an unexpired lease.
    pub fn lease_is_live(&self, now: DateTime<Utc>) -> bool {
        self.claimed_by.is_some() && self.lease_expires_at.is_some_and(|until| until > now)
    }

    pub fn is_held_by(&self, runner_id: &str) -> bool {
        self.claimed_by.as_deref() == Some(runner_id)
    }

    /// Last sign of life: heartbeat, else start, else creation.
    pub fn last_seen_at(&self) -> DateTime<Utc> {
        self.last_heartbeat_at
            .or(self.started_at)
            .unwrap_or(self.created_at)
    }

    pub fn heartbeat_age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_seen_at()).num_seconds()
    }
}

/// Preconditions checked by the store in the same critical section as a write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobGuard {
    /// Current status must equal this.
    pub status: Option<JobStatus>,
    /// Lease must be held by this runner.
    pub runner: Option<String>,
    /// Last sign of life must not be later than this.
    pub seen_before: Option<DateTime<Utc>>,
}

/// Partial update of a job. `None` leaves a field untouched; nested options
/// set nullable fields (`Some(None)` clears).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub guard: JobGuard,
    pub status: Option<JobStatus>,
    pub phase: Option<BuildPhase>,
    pub current_item: Option<Option<String>>,
    pub program_id: Option<ProgramId>,
    pub total_modules: Option<u32>,
    pub completed_modules: Option<u32>,
    pub total_lessons: Option<u32>,
    pub completed_lessons: Option<u32>,
    pub retry_count: Option<u32>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub finished_at: Option<Option<DateTime<Utc>>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub error: Option<Option<String>>,
    pub claimed_by: Option<Option<String>>,
    pub lease_expires_at: Option<Option<DateTime<Utc>>>,
}

impl JobPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_status(mut self, status: JobStatus) -> Self {
        self.guard.status = Some(status);
        self
    }

    pub fn held_by(mut self, runner_id: impl Into<String>) -> Self {
        self.guard.runner = Some(runner_id.into());
        self
    }

    /// Require the job to have been silent since `cutoff`.
    pub fn silent_since(mut self, cutoff: DateTime<Utc>) -> Self {
        self.guard.seen_before = Some(cutoff);
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn phase(mut self, phase: BuildPhase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn current_item(mut self, item: Option<String>) -> Self {
        self.current_item = Some(item);
        self
    }

    pub fn program_id(mut self, program_id: ProgramId) -> Self {
        self.program_id = Some(program_id);
        self
    }

    pub fn totals(mut self, modules: u32, lessons: u32) -> Self {
        self.total_modules = Some(modules);
        self.total_lessons = Some(lessons);
        self
    }

    pub fn completed_modules(mut self, n: u32) -> Self {
        self.completed_modules = Some(n);
        self
    }

    pub fn completed_lessons(mut self, n: u32) -> Self {
        self.completed_lessons = Some(n);
        self
    }

    pub fn retry_count(mut self, n: u32) -> Self {
        self.retry_count = Some(n);
        self
    }

    pub fn started_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.started_at = Some(at);
        self
    }

    pub fn finished_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.finished_at = Some(at);
        self
    }

    pub fn heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.last_heartbeat_at = Some(at);
        self
    }

    pub fn error(mut self, error: Option<String>) -> Self {
        self.error = Some(error);
        self
    }

    pub fn lease(mut self, runner_id: impl Into<String>, until: DateTime<Utc>) -> Self {
        self.claimed_by = Some(Some(runner_id.into()));
        self.lease_expires_at = Some(Some(until));
        self
    }

    pub fn release_lease(mut self) -> Self {
        self.claimed_by = Some(None);
        self.lease_expires_at = Some(None);
        self
    }

    /// Merge into `job`. Always bumps `updated_at`.
    pub fn apply(self, job: &mut BuildJob, now: DateTime<Utc>) {
        if let Some(v) = self.status {
            job.status = v;
        }
        if let Some(v) = self.phase {
            job.phase = v;
        }
        if let Some(v) = self.current_item {
            job.current_item = v;
        }
        if let Some(v) = self.program_id {
            job.program_id = Some(v);
        }
        if let Some(v) = self.total_modules {
            job.total_modules = v;
        }
        if let Some(v) = self.completed_modules {
            job.completed_modules = v;
        }
        if let Some(v) = self.total_lessons {
            job.total_lessons = v;
        }
        if let Some(v) = self.completed_lessons {
            job.completed_lessons = v;
        }
        if let Some(v) = self.retry_count {
            job.retry_count = v;
        }
        if let Some(v) = self.started_at {
            job.started_at = v;
        }
        if let Some(v) = self.finished_at {
            job.finished_at = v;
        }
        if let Some(v) = self.last_heartbeat_at {
            job.last_heartbeat_at = Some(v);
        }
        if let Some(v) = self.error {
            job.error = v;
        }
        if let Some(v) = self.claimed_by {
            job.claimed_by = v;
        }
        if let Some(v) = self.lease_expires_at {
            job.lease_expires_at = v;
        }
        job.updated_at = now;
    }
}

/// Filter for job listings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub user_id: Option<UserId>,
    pub program_id: Option<ProgramId>,
    pub status: Option<JobStatus>,
}

impl JobFilter {
    pub fn matches(&self, job: &BuildJob) -> bool {
        self.user_id.is_none_or(|u| job.user_id == u)
            && self.program_id.is_none_or(|p| job.program_id == Some(p))
            && self.status.is_none_or(|s| job.status == s)
    }
}

/// Pagination for job listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Pagination {
    pub const DEFAULT_LIMIT: u32 = 20;
    pub const MAX_LIMIT: u32 = 100;

    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit
                .unwrap_or(Self::DEFAULT_LIMIT)
                .clamp(1, Self::MAX_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// One page of jobs, newest first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPage {
    pub jobs: Vec<BuildJob>,
    pub total: u64,
    pub limit: u32,
    pub offset: u32,
    pub has_more: bool,
}

impl JobPage {
    pub fn new(jobs: Vec<BuildJob>, total: u64, page: Pagination) -> Self {
        let has_more = total > u64::from(page.offset) + jobs.len() as u64;
        Self {
            jobs,
            total,
            limit: page.limit,
            offset: page.offset,
            has_more,
        }
    }
}
