//! Per-connection build stream.
//!
//! One task per subscriber: `status` and `partial` first, then one
//! `progress` per event after the cursor, a fresh `partial` whenever a
//! structural event was drained, and finally `complete` or `error` followed
//! by `done`. Reads only; never changes the job.

use std::time::Duration;

use serde_json::{Value as JsonValue, json};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use studyforge_core::JobId;
use studyforge_events::BuildEvent;

use crate::config::OrchestratorConfig;
use crate::jobs::{BuildDispatcher, BuildError, BuildJob, BuildJobs, JobStatus};
use crate::projections::{BuildView, BuildViewProjector};

/// One message of a build stream; `name()` is the SSE event name.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Status(BuildJob),
    Partial(BuildView),
    Progress(BuildEvent),
    Complete(BuildJob),
    Error {
        status: Option<JobStatus>,
        reason: String,
        message: String,
    },
    Done,
}

impl StreamMessage {
    pub fn name(&self) -> &'static str {
        match self {
            StreamMessage::Status(_) => "status",
            StreamMessage::Partial(_) => "partial",
            StreamMessage::Progress(_) => "progress",
            StreamMessage::Complete(_) => "complete",
            StreamMessage::Error { .. } => "error",
            StreamMessage::Done => "done",
        }
    }

    /// JSON body (camelCase).
    pub fn data(&self) -> JsonValue {
        match self {
            StreamMessage::Status(job) => json!({
                "jobId": job.id,
                "programId": job.program_id,
                "status": job.status,
                "phase": job.phase,
                "currentItem": job.current_item,
                "totalModules": job.total_modules,
                "completedModules": job.completed_modules,
                "totalLessons": job.total_lessons,
                "completedLessons": job.completed_lessons,
                "retryCount": job.retry_count,
                "maxRetries": job.max_retries,
                "lastEventIndex": job.last_event_index,
                "lastHeartbeatAt": job.last_heartbeat_at,
                "error": job.error,
            }),
            StreamMessage::Partial(view) => serde_json::to_value(view).unwrap_or(JsonValue::Null),
            StreamMessage::Progress(event) => json!({
                "index": event.index,
                "type": event.event_type,
                "step": event.step,
                "status": event.status,
                "level": event.level,
                "message": event.message,
                "payload": event.payload,
                "timestamp": event.created_at,
            }),
            StreamMessage::Complete(job) => json!({
                "jobId": job.id,
                "programId": job.program_id,
                "status": job.status,
                "completedModules": job.completed_modules,
                "completedLessons": job.completed_lessons,
                "finishedAt": job.finished_at,
            }),
            StreamMessage::Error {
                status,
                reason,
                message,
            } => json!({
                "status": status,
                "reason": reason,
                "message": message,
            }),
            StreamMessage::Done => json!({}),
        }
    }

    fn from_error(err: &BuildError) -> Self {
        StreamMessage::Error {
            status: None,
            reason: err.reason().to_string(),
            message: err.to_string(),
        }
    }

    fn terminal(job: BuildJob) -> Self {
        match job.status {
            JobStatus::Completed => StreamMessage::Complete(job),
            status => StreamMessage::Error {
                status: Some(status),
                reason: status.as_str().to_lowercase(),
                message: job.error.unwrap_or_else(|| match status {
                    JobStatus::Canceled => "build canceled".to_string(),
                    _ => "build failed".to_string(),
                }),
            },
        }
    }
}

#[derive(Clone)]
pub struct StreamGateway {
    jobs: BuildJobs,
    projector: BuildViewProjector,
    dispatcher: Option<BuildDispatcher>,
    poll_interval: Duration,
}

impl StreamGateway {
    pub fn new(
        jobs: BuildJobs,
        projector: BuildViewProjector,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            jobs,
            projector,
            dispatcher: None,
            poll_interval: config.stream_poll_interval,
        }
    }

    /// Kick active jobs on this dispatcher when a subscriber connects.
    pub fn with_dispatcher(mut self, dispatcher: BuildDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Start streaming `job_id` from `after_index`.
    ///
    /// The task ends after `done`, on `cancel`, or once the receiver is dropped.
    /// At most `STREAM_BUFFER` messages wait unread; the task then waits for
    /// the subscriber.
    pub fn spawn(
        &self,
        job_id: JobId,
        after_index: u64,
        cancel: CancellationToken,
    ) -> Receiver<StreamMessage> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let gateway = self.clone();
        tokio::spawn(async move {
            gateway.pump(job_id, after_index, Outbox { tx, cancel }).await;
            debug!(job_id = %job_id, "build stream closed");
        });
        rx
    }

    async fn pump(&self, job_id: JobId, mut cursor: u64, tx: Outbox) {
        let job = match self.jobs.get_job_or_fail(job_id).await {
            Ok(job) => job,
            Err(err) => return self.fail(&tx, &err).await,
        };

        if job.status.is_active() {
            if let Some(dispatcher) = &self.dispatcher {
                dispatcher.ensure_running(job_id);
            }
        }

        if !tx.send(StreamMessage::Status(job.clone())).await {
            return;
        }
        let mut stale_partial = false;
        if !self.send_partial(&tx, job).await {
            return;
        }

        loop {
            if tx.is_closed() {
                return;
            }

            // Status first: a terminal status implies its events are already logged.
            let job = match self.jobs.get_job_or_fail(job_id).await {
                Ok(job) => job,
                Err(err) => return self.fail(&tx, &err).await,
            };
            let events = match self.jobs.events_since(job_id, cursor).await {
                Ok(events) => events,
                Err(err) => return self.fail(&tx, &err).await,
            };

            let mut structural = false;
            for event in events {
                cursor = event.index;
                structural |= event.is_structural();
                if !tx.send(StreamMessage::Progress(event)).await {
                    return;
                }
                stale_partial = true;
            }

            if job.status.is_terminal() {
                if (structural || stale_partial) && !self.send_partial(&tx, job.clone()).await {
                    return;
                }
                if tx.send(StreamMessage::terminal(job)).await {
                    tx.send(StreamMessage::Done).await;
                }
                return;
            }

            if structural {
                match self.jobs.get_job_or_fail(job_id).await {
                    Ok(current) => {
                        if !self.send_partial(&tx, current).await {
                            return;
                        }
                        stale_partial = false;
                    }
                    Err(err) => return self.fail(&tx, &err).await,
                }
            }

            tokio::select! {
                _ = tx.cancel.cancelled() => return,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Send a snapshot of `job` and its program; false once the receiver is gone.
    async fn send_partial(&self, tx: &Outbox, job: BuildJob) -> bool {
        let program = match self.projector.program_snapshot(&job).await {
            Ok(program) => program,
            Err(err) => {
                warn!(job_id = %job.id, error = %err, "program snapshot unavailable");
                return !tx.is_closed();
            }
        };
        tx.send(StreamMessage::Partial(BuildView { job, program }))
            .await
    }

    async fn fail(&self, tx: &Outbox, err: &BuildError) {
        warn!(error = %err, "build stream aborted");
        if tx.send(StreamMessage::from_error(err)).await {
            tx.send(StreamMessage::Done).await;
        }
    }
}

/// Messages a subscriber may leave unread before the pump waits.
pub const STREAM_BUFFER: usize = 32;

/// Sending half of one stream.
struct Outbox {
    tx: Sender<StreamMessage>,
    cancel: CancellationToken,
}

impl Outbox {
    /// Wait for room; false once the subscriber is gone or the stream is canceled.
    async fn send(&self, msg: StreamMessage) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send(msg) => sent.is_ok(),
        }
    }

    fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use studyforge_ai::TemplateGenerator;
    use studyforge_core::UserId;
    use studyforge_events::{EventDraft, kind};

    use crate::jobs::{BuildJobStore, Collaborators, JobPatch};
    use crate::testing::{Harness, harness_with, profile};

    fn fast_harness() -> Harness {
        harness_with(
            Collaborators::from_generator(Arc::new(TemplateGenerator::with_limits(2, 2))),
            OrchestratorConfig::default().with_stream_poll_interval(Duration::from_millis(10)),
        )
    }

    fn gateway(h: &Harness) -> StreamGateway {
        let projector = BuildViewProjector::new(h.jobs_store.clone(), h.programs.clone());
        StreamGateway::new(h.jobs.clone(), projector, &h.config)
    }

    async fn collect(mut rx: Receiver<StreamMessage>) -> Vec<StreamMessage> {
        let mut out = Vec::new();
        let drain = async {
            while let Some(msg) = rx.recv().await {
                out.push(msg);
            }
        };
        tokio::time::timeout(Duration::from_secs(10), drain)
            .await
            .unwrap();
        out
    }

    fn names(messages: &[StreamMessage]) -> Vec<&'static str> {
        messages.iter().map(StreamMessage::name).collect()
    }

    #[tokio::test]
    async fn caught_up_completed_job_skips_progress() {
        let h = fast_harness();
        let job = h.jobs.create_job(UserId::new(), profile()).await.unwrap();
        for i in 0..5 {
            h.jobs
                .append_event(job.id, EventDraft::new(kind::JOB_QUEUED, format!("step {i}")))
                .await
                .unwrap();
        }
        h.jobs_store
            .try_claim(job.id, "r", chrono::Utc::now(), chrono::Utc::now())
            .await
            .unwrap();
        h.jobs
            .update_job_state(job.id, JobPatch::new().status(JobStatus::Completed))
            .await
            .unwrap();

        let rx = gateway(&h).spawn(job.id, 5, CancellationToken::new());
        let messages = collect(rx).await;
        assert_eq!(names(&messages), vec!["status", "partial", "complete", "done"]);
    }

    #[tokio::test]
    async fn unknown_job_gets_error_then_done() {
        let h = fast_harness();
        let rx = gateway(&h).spawn(JobId::new(), 0, CancellationToken::new());
        let messages = collect(rx).await;
        assert_eq!(names(&messages), vec!["error", "done"]);
        assert_eq!(messages[0].data()["reason"], "not_found");
    }

    #[tokio::test]
    async fn live_build_streams_every_event_once() {
        let h = fast_harness();
        let job = h.jobs.submit(UserId::new(), profile()).await.unwrap().job().clone();

        let rx = gateway(&h)
            .with_dispatcher(h.dispatcher.clone())
            .spawn(job.id, 0, CancellationToken::new());
        let messages = collect(rx).await;

        let names = names(&messages);
        assert_eq!(&names[..2], &["status", "partial"]);
        assert_eq!(&names[names.len() - 2..], &["complete", "done"]);
        assert_eq!(names.iter().filter(|n| **n == "done").count(), 1);

        let indices: Vec<u64> = messages
            .iter()
            .filter_map(|m| match m {
                StreamMessage::Progress(event) => Some(event.index),
                _ => None,
            })
            .collect();
        let last = h.jobs.get_job_or_fail(job.id).await.unwrap().last_event_index;
        assert_eq!(indices, (1..=last).collect::<Vec<_>>());

        match &messages[messages.len() - 3] {
            StreamMessage::Partial(view) => assert_eq!(view.program.modules.len(), 2),
            other => panic!("expected final partial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_job_ends_with_error() {
        let h = fast_harness();
        let job = h.jobs.create_job(UserId::new(), profile()).await.unwrap();
        h.jobs_store
            .try_claim(job.id, "r", chrono::Utc::now(), chrono::Utc::now())
            .await
            .unwrap();
        h.jobs
            .update_job_state(
                job.id,
                JobPatch::new()
                    .status(JobStatus::Failed)
                    .error(Some("lessons phase failed: boom".into())),
            )
            .await
            .unwrap();

        let messages = collect(gateway(&h).spawn(job.id, 0, CancellationToken::new())).await;
        assert_eq!(names(&messages), vec!["status", "partial", "error", "done"]);
        let data = messages[2].data();
        assert_eq!(data["status"], "FAILED");
        assert_eq!(data["message"], "lessons phase failed: boom");
    }

    #[tokio::test]
    async fn cancellation_closes_without_done() {
        let h = fast_harness();
        let job = h.jobs.create_job(UserId::new(), profile()).await.unwrap();
        let cancel = CancellationToken::new();

        let mut rx = gateway(&h).spawn(job.id, 0, cancel.clone());
        assert_eq!(rx.recv().await.unwrap().name(), "status");
        assert_eq!(rx.recv().await.unwrap().name(), "partial");
        cancel.cancel();

        let rest = collect(rx).await;
        assert!(rest.iter().all(|m| m.name() != "done"));
        let job = h.jobs.get_job_or_fail(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn slow_reader_holds_the_pump_at_the_buffer_limit() {
        let h = fast_harness();
        let job = h.jobs.submit(UserId::new(), profile()).await.unwrap().job().clone();
        h.dispatcher.run(job.id).await.unwrap();
        let last = h.jobs.get_job_or_fail(job.id).await.unwrap().last_event_index;
        assert!(last as usize + 4 > STREAM_BUFFER);

        let rx = gateway(&h).spawn(job.id, 0, CancellationToken::new());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(rx.len(), STREAM_BUFFER);

        let messages = collect(rx).await;
        let progress = messages.iter().filter(|m| m.name() == "progress").count();
        assert_eq!(progress as u64, last);
        let names = names(&messages);
        assert_eq!(&names[names.len() - 2..], &["complete", "done"]);
    }
}
