//! Explicit retry and stale-heartbeat recovery.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use studyforge_core::{ExpectedIndex, JobId};
use studyforge_events::payload::{RecoveryStarted, RetryQueued};
use studyforge_events::{Checkpoint, EventDraft, EventLevel, EventPayload, EventStatus, kind};

use super::checkpoint::load_checkpoint;
use super::dispatcher::BuildDispatcher;
use super::error::BuildError;
use super::machine::BuildJobs;
use super::store::JobStoreError;
use super::types::{JobFilter, JobPatch, JobStatus, Pagination};
use crate::config::OrchestratorConfig;

/// Accepted retry: the job is QUEUED again.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryOutcome {
    pub retry_count: u32,
    pub max_retries: u32,
    pub resume_from: Checkpoint,
}

/// What a stale-job recovery did.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryOutcome {
    /// Failed then re-queued from its checkpoint.
    Requeued(RetryOutcome),
    /// Failed for good: the retry budget is spent.
    Exhausted {
        retry_count: u32,
        max_retries: u32,
        checkpoint: Checkpoint,
    },
}

#[derive(Clone)]
pub struct RecoveryService {
    jobs: BuildJobs,
    stale_after: Duration,
    dispatcher: Option<BuildDispatcher>,
}

impl RecoveryService {
    pub fn new(jobs: BuildJobs, config: &OrchestratorConfig) -> Self {
        Self {
            jobs,
            stale_after: config.stale_after,
            dispatcher: None,
        }
    }

    /// Re-enqueue accepted jobs on this dispatcher.
    pub fn with_dispatcher(mut self, dispatcher: BuildDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Move a FAILED job back to QUEUED, keeping its checkpoint.
    ///
    /// Refusals (`NotFound`, `InvalidState`, `LimitExceeded`) write nothing.
    pub async fn reset_for_retry(&self, job_id: JobId) -> Result<RetryOutcome, BuildError> {
        let job = self.jobs.get_job_or_fail(job_id).await?;
        if job.status != JobStatus::Failed {
            return Err(BuildError::invalid_state(
                job.status,
                "only FAILED jobs can be retried",
            ));
        }
        if job.retry_count >= job.max_retries {
            return Err(BuildError::LimitExceeded {
                retry_count: job.retry_count,
                max_retries: job.max_retries,
            });
        }

        let store = self.jobs.store();
        let resume_from = load_checkpoint(&**store, job_id).await?;
        let retry_count = job.retry_count + 1;
        let outcome = RetryOutcome {
            retry_count,
            max_retries: job.max_retries,
            resume_from,
        };

        let now = Utc::now();
        store
            .append_event(
                job_id,
                EventDraft::new(kind::JOB_RETRY_QUEUED, "Retry queued")
                    .status(EventStatus::Pending)
                    .message(format!("retry {retry_count}/{}", job.max_retries))
                    .payload(EventPayload::RetryQueued(RetryQueued {
                        retry_count,
                        max_retries: job.max_retries,
                        resume_from: outcome.resume_from.clone(),
                    })),
                ExpectedIndex::Exact(job.last_event_index),
                JobPatch::new()
                    .expect_status(JobStatus::Failed)
                    .status(JobStatus::Queued)
                    .retry_count(retry_count)
                    .error(None)
                    .finished_at(None)
                    .release_lease(),
                now,
            )
            .await?;

        info!(
            job_id = %job_id,
            retry_count,
            max_retries = job.max_retries,
            resume_phase = %outcome.resume_from.phase,
            "build job re-queued"
        );
        Ok(outcome)
    }

    /// `reset_for_retry`, then hand the job to the dispatcher.
    pub async fn retry(&self, job_id: JobId) -> Result<RetryOutcome, BuildError> {
        let outcome = self.reset_for_retry(job_id).await?;
        self.enqueue(job_id);
        Ok(outcome)
    }

    /// Fail a RUNNING job whose heartbeat is older than the threshold and
    /// send it through the retry flow.
    ///
    /// The staleness check is repeated inside the write, so a heartbeat that
    /// lands after the read still refuses. When the retry budget is spent the
    /// job stays FAILED and `Exhausted` is returned.
    pub async fn recover_stale(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<RecoveryOutcome, BuildError> {
        let job = self.jobs.get_job_or_fail(job_id).await?;
        if job.status != JobStatus::Running {
            return Err(BuildError::NotRunning { status: job.status });
        }
        let age_secs = job.heartbeat_age_secs(now);
        let threshold_secs = self.stale_after.as_secs() as i64;
        if age_secs <= threshold_secs {
            return Err(BuildError::HeartbeatNotStale {
                age_secs,
                threshold_secs,
            });
        }

        let store = self.jobs.store();
        let checkpoint = load_checkpoint(&**store, job_id).await?;
        let error = BuildError::StaleExecution {
            stale_seconds: age_secs,
        }
        .to_string();
        let cutoff = now - chrono::Duration::seconds(threshold_secs);

        let written = store
            .append_event(
                job_id,
                EventDraft::new(kind::JOB_RECOVERY_STARTED, "Recovering stale build")
                    .status(EventStatus::InProgress)
                    .level(EventLevel::Warn)
                    .message(error.clone())
                    .payload(EventPayload::RecoveryStarted(RecoveryStarted {
                        checkpoint: checkpoint.clone(),
                        stale_seconds: age_secs,
                        last_heartbeat_at: job.last_heartbeat_at,
                    })),
                ExpectedIndex::Exact(job.last_event_index),
                JobPatch::new()
                    .expect_status(JobStatus::Running)
                    .silent_since(cutoff)
                    .status(JobStatus::Failed)
                    .error(Some(error))
                    .finished_at(Some(now))
                    .current_item(None)
                    .release_lease(),
                now,
            )
            .await;
        match written {
            Ok(_) => {}
            Err(JobStoreError::StillAlive { last_seen, .. }) => {
                return Err(BuildError::HeartbeatNotStale {
                    age_secs: (now - last_seen).num_seconds(),
                    threshold_secs,
                });
            }
            Err(err) => return Err(err.into()),
        }
        warn!(job_id = %job_id, stale_seconds = age_secs, "stale build marked failed");

        let outcome = match self.reset_for_retry(job_id).await {
            Ok(outcome) => outcome,
            Err(BuildError::LimitExceeded {
                retry_count,
                max_retries,
            }) => {
                warn!(
                    job_id = %job_id,
                    retry_count,
                    max_retries,
                    "stale build left FAILED, retry limit reached"
                );
                return Ok(RecoveryOutcome::Exhausted {
                    retry_count,
                    max_retries,
                    checkpoint,
                });
            }
            Err(err) => return Err(err),
        };
        self.jobs
            .append_event(
                job_id,
                EventDraft::new(kind::JOB_RECOVERY_QUEUED, "Recovered build queued")
                    .status(EventStatus::Pending)
                    .payload(EventPayload::RecoveryQueued(RetryQueued {
                        retry_count: outcome.retry_count,
                        max_retries: outcome.max_retries,
                        resume_from: outcome.resume_from.clone(),
                    })),
            )
            .await?;

        self.enqueue(job_id);
        Ok(RecoveryOutcome::Requeued(outcome))
    }

    /// Recover every RUNNING job whose heartbeat is stale at `now`.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> Result<Vec<JobId>, BuildError> {
        let filter = JobFilter {
            status: Some(JobStatus::Running),
            ..Default::default()
        };
        let threshold_secs = self.stale_after.as_secs() as i64;

        // Collect first: recovering changes the status and shifts the pages.
        let mut stale = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .jobs
                .list_jobs(&filter, Pagination::new(Some(100), Some(offset)))
                .await?;
            stale.extend(
                page.jobs
                    .iter()
                    .filter(|job| job.heartbeat_age_secs(now) > threshold_secs)
                    .map(|job| job.id),
            );
            if !page.has_more {
                break;
            }
            offset += page.limit;
        }

        let mut recovered = Vec::with_capacity(stale.len());
        for job_id in stale {
            match self.recover_stale(job_id, now).await {
                Ok(_) => recovered.push(job_id),
                Err(err) => {
                    debug!(job_id = %job_id, reason = err.reason(), "stale job not recovered")
                }
            }
        }
        Ok(recovered)
    }

    fn enqueue(&self, job_id: JobId) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.ensure_running(job_id);
        }
    }
}

/// Periodic `sweep_stale` on a fixed interval.
pub struct RecoverySweeper {
    service: RecoveryService,
    interval: Duration,
}

impl RecoverySweeper {
    pub fn new(service: RecoveryService, interval: Duration) -> Self {
        Self { service, interval }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("recovery sweeper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        match self.service.sweep_stale(Utc::now()).await {
                            Ok(recovered) if !recovered.is_empty() => {
                                info!(count = recovered.len(), "stale builds recovered");
                            }
                            Ok(_) => {}
                            Err(err) => warn!(error = %err, "recovery sweep failed"),
                        }
                    }
                }
            }
        })
    }
}
