//! Build runner.
//!
//! Drives one job through plan → modules → lessons → resources →
//! assessments → schedule. Every unit is committed as one event (with the
//! checkpoint in its payload) plus the matching counter patch, so a later run
//! resumes exactly after the last committed unit.
//!
//! A run is gated by the lease taken in `try_claim`. The lease is renewed on
//! every unit and by a background ticker; losing it (cancel, recovery or a
//! takeover) stops the run without further writes.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use studyforge_ai::{
    GenerationResult, Grader, LessonWriter, PlanGenerator, ProgramContext, ResourceCurator,
    SchedulePlanner,
};
use studyforge_core::{ExpectedIndex, JobId, ProgramId};
use studyforge_events::payload::{
    JobFailed, JobFinished, JobStarted, PhaseCompleted, PhaseFailed, PhaseMarker, PlanCreated,
    UnitCompleted,
};
use studyforge_events::{
    BuildPhase, Checkpoint, EventDraft, EventLevel, EventPayload, EventStatus, kind,
};

use super::checkpoint::load_checkpoint;
use super::error::BuildError;
use super::store::{BuildJobStore, ClaimOutcome, JobStoreError};
use super::types::{BuildJob, JobPatch, JobStatus};
use crate::config::{OrchestratorConfig, to_chrono};
use crate::program::{Program, ProgramStore, ProgramUnit};

/// Generation collaborators injected into the runner.
#[derive(Clone)]
pub struct Collaborators {
    pub planner: Arc<dyn PlanGenerator>,
    pub writer: Arc<dyn LessonWriter>,
    pub curator: Arc<dyn ResourceCurator>,
    pub grader: Arc<dyn Grader>,
    pub scheduler: Arc<dyn SchedulePlanner>,
}

impl Collaborators {
    /// Use one generator for every role.
    pub fn from_generator<G>(generator: Arc<G>) -> Self
    where
        G: PlanGenerator + LessonWriter + ResourceCurator + Grader + SchedulePlanner + 'static,
    {
        Self {
            planner: generator.clone(),
            writer: generator.clone(),
            curator: generator.clone(),
            grader: generator.clone(),
            scheduler: generator,
        }
    }
}

/// How a call to [`BuildDispatcher::run`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    /// A phase failed; the job is FAILED until retried.
    Failed { phase: BuildPhase, message: String },
    /// Another runner holds a live lease.
    AlreadyRunning { runner_id: String },
    /// Status does not allow execution.
    NotRunnable(JobStatus),
    /// The lease was lost mid-run (canceled, recovered or taken over).
    Stopped,
}

struct Inner {
    jobs: Arc<dyn BuildJobStore>,
    programs: Arc<dyn ProgramStore>,
    collaborators: Collaborators,
    config: OrchestratorConfig,
    runner_id: String,
    in_flight: Mutex<HashSet<JobId>>,
}

/// Runs build jobs on the tokio runtime.
#[derive(Clone)]
pub struct BuildDispatcher {
    inner: Arc<Inner>,
}

/// Removes a job from the in-flight set when the spawned run ends.
struct InFlight {
    inner: Arc<Inner>,
    job_id: JobId,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut set = self
            .inner
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        set.remove(&self.job_id);
    }
}

impl BuildDispatcher {
    pub fn new(
        jobs: Arc<dyn BuildJobStore>,
        programs: Arc<dyn ProgramStore>,
        collaborators: Collaborators,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs,
                programs,
                collaborators,
                config,
                runner_id: format!("runner-{}", Uuid::now_v7()),
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn runner_id(&self) -> &str {
        &self.inner.runner_id
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Whether this process currently has `job_id` in flight.
    pub fn is_in_flight(&self, job_id: JobId) -> bool {
        self.inner
            .in_flight
            .lock()
            .map(|set| set.contains(&job_id))
            .unwrap_or(false)
    }

    /// Spawn `run(job_id)` unless this process already runs it.
    ///
    /// Returns the task handle when a run was spawned. Whether the run does
    /// anything is decided by the claim.
    pub fn ensure_running(
        &self,
        job_id: JobId,
    ) -> Option<JoinHandle<Result<RunOutcome, BuildError>>> {
        {
            let mut set = self
                .inner
                .in_flight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !set.insert(job_id) {
                debug!(job_id = %job_id, "build already in flight");
                return None;
            }
        }

        let guard = InFlight {
            inner: self.inner.clone(),
            job_id,
        };
        let this = self.clone();
        Some(tokio::spawn(async move {
            let _guard = guard;
            let run = tokio::spawn({
                let this = this.clone();
                async move { this.run(job_id).await }
            });
            let result = match run.await {
                Ok(result) => result,
                Err(join) if join.is_panic() => {
                    let message = panic_message(join.into_panic());
                    error!(job_id = %job_id, error = %message, "build run panicked");
                    this.fail_abandoned(job_id, &message).await
                }
                Err(_) => Ok(RunOutcome::Stopped),
            };
            if let Err(err) = &result {
                error!(job_id = %job_id, error = %err, "build run aborted");
            }
            result
        }))
    }

    /// Fail a job whose run died without unwinding through `Run::fail`.
    ///
    /// Only acts while this runner still holds the lease; otherwise the job
    /// belongs to someone else (or to recovery) and is left alone.
    async fn fail_abandoned(
        &self,
        job_id: JobId,
        message: &str,
    ) -> Result<RunOutcome, BuildError> {
        let inner = &*self.inner;
        let Some(job) = inner.jobs.get(job_id).await? else {
            return Err(BuildError::NotFound(job_id));
        };
        if job.status != JobStatus::Running || !job.is_held_by(&inner.runner_id) {
            return Ok(RunOutcome::Stopped);
        }

        let checkpoint = load_checkpoint(&*inner.jobs, job_id).await?;
        let phase = job.phase;
        let mut run = Run {
            inner,
            job_id,
            last_index: job.last_event_index,
            job,
            checkpoint,
            lease_lost: CancellationToken::new(),
        };
        let message = format!("runner panicked: {message}");
        match run.fail(phase, &message).await {
            Ok(()) => Ok(RunOutcome::Failed { phase, message }),
            Err(StepError::Store(err)) => Err(err.into()),
            Err(_) => Ok(RunOutcome::Stopped),
        }
    }

    /// Claim and execute a job from its checkpoint.
    ///
    /// A live claim by another runner makes this a no-op.
    #[instrument(skip(self), fields(job_id = %job_id, runner_id = %self.inner.runner_id))]
    pub async fn run(&self, job_id: JobId) -> Result<RunOutcome, BuildError> {
        let inner = &*self.inner;
        let now = Utc::now();
        let lease_until = now + to_chrono(inner.config.lease_ttl);

        let job = match inner
            .jobs
            .try_claim(job_id, &inner.runner_id, lease_until, now)
            .await?
        {
            ClaimOutcome::Claimed(job) => job,
            ClaimOutcome::Held { runner_id } => {
                debug!(holder = %runner_id, "job held by a live runner");
                return Ok(RunOutcome::AlreadyRunning { runner_id });
            }
            ClaimOutcome::Unclaimable(status) => {
                debug!(status = %status, "job not runnable");
                return Ok(RunOutcome::NotRunnable(status));
            }
        };

        let checkpoint = load_checkpoint(&*inner.jobs, job_id).await?;
        info!(
            phase = %checkpoint.phase,
            step = checkpoint.step,
            retry_count = job.retry_count,
            "build run started"
        );

        let stop = CancellationToken::new();
        let lease_lost = CancellationToken::new();
        let ticker = self.spawn_heartbeat(job_id, stop.clone(), lease_lost.clone());
        // Stops the ticker even if `execute` unwinds or the run is dropped.
        let stop_ticker = stop.drop_guard();

        let mut run = Run {
            inner,
            job_id,
            last_index: job.last_event_index,
            job,
            checkpoint,
            lease_lost,
        };
        let result = run.execute().await;

        drop(stop_ticker);
        let _ = ticker.await;

        match result {
            Ok(()) => {
                info!("build completed");
                Ok(RunOutcome::Completed)
            }
            Err(StepError::Phase { phase, message }) => match run.fail(phase, &message).await {
                Ok(()) => Ok(RunOutcome::Failed { phase, message }),
                Err(StepError::Store(err)) => Err(err.into()),
                Err(_) => Ok(RunOutcome::Stopped),
            },
            Err(StepError::Fenced) => {
                warn!("lease lost, build run stopped");
                Ok(RunOutcome::Stopped)
            }
            Err(StepError::Store(err)) => Err(err.into()),
        }
    }

    fn spawn_heartbeat(
        &self,
        job_id: JobId,
        stop: CancellationToken,
        lease_lost: CancellationToken,
    ) -> JoinHandle<()> {
        let jobs = self.inner.jobs.clone();
        let runner_id = self.inner.runner_id.clone();
        let period = self.inner.config.heartbeat_interval;
        let ttl = to_chrono(self.inner.config.lease_ttl);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        let now = Utc::now();
                        match jobs.heartbeat(job_id, &runner_id, now + ttl, now).await {
                            Ok(_) => {}
                            Err(JobStoreError::LeaseLost(_)) => {
                                warn!(job_id = %job_id, "heartbeat rejected, lease lost");
                                lease_lost.cancel();
                                break;
                            }
                            Err(err) => warn!(job_id = %job_id, error = %err, "heartbeat failed"),
                        }
                    }
                }
            }
        })
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

enum StepError {
    /// Generation or program commit failed inside a phase.
    Phase { phase: BuildPhase, message: String },
    /// The job moved under us: lease lost or log appended elsewhere.
    Fenced,
    Store(JobStoreError),
}

impl StepError {
    fn phase(phase: BuildPhase, err: impl std::fmt::Display) -> Self {
        StepError::Phase {
            phase,
            message: err.to_string(),
        }
    }
}

impl From<JobStoreError> for StepError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::LeaseLost(_)
            | JobStoreError::Conflict(_)
            | JobStoreError::InvalidTransition { .. } => StepError::Fenced,
            other => StepError::Store(other),
        }
    }
}

/// State of one claimed run.
struct Run<'a> {
    inner: &'a Inner,
    job_id: JobId,
    last_index: u64,
    job: BuildJob,
    checkpoint: Checkpoint,
    lease_lost: CancellationToken,
}

impl<'a> Run<'a> {
    async fn execute(&mut self) -> Result<(), StepError> {
        let started = EventPayload::JobStarted(JobStarted {
            runner_id: self.inner.runner_id.clone(),
            retry_count: self.job.retry_count,
            resume_from: self.checkpoint.clone(),
        });
        self.append(
            EventDraft::new(kind::JOB_STARTED, "Build started")
                .status(EventStatus::InProgress)
                .payload(started),
            JobPatch::new(),
        )
        .await?;

        for phase in BuildPhase::WORK {
            if self.checkpoint.phase_done(phase) {
                continue;
            }
            self.run_phase(phase).await?;
        }

        let now = Utc::now();
        let finished = EventPayload::JobCompleted(JobFinished {
            program_id: self.job.program_id,
            completed_modules: self.job.completed_modules,
            completed_lessons: self.job.completed_lessons,
            checkpoint: self.checkpoint.clone(),
        });
        self.append(
            EventDraft::new(kind::JOB_COMPLETED, "Build completed").payload(finished),
            JobPatch::new()
                .status(JobStatus::Completed)
                .phase(BuildPhase::Done)
                .finished_at(Some(now))
                .current_item(None)
                .release_lease(),
        )
        .await
    }

    async fn run_phase(&mut self, phase: BuildPhase) -> Result<(), StepError> {
        self.beat().await?;
        self.append(
            EventDraft::new(kind::PHASE_STARTED, phase.label())
                .status(EventStatus::InProgress)
                .payload(EventPayload::PhaseStarted(PhaseMarker { phase })),
            JobPatch::new()
                .phase(phase)
                .current_item(Some(phase.label().to_string())),
        )
        .await?;

        let units = match phase {
            BuildPhase::Plan => self.plan().await?,
            BuildPhase::Modules => self.modules().await?,
            BuildPhase::Lessons => self.lessons().await?,
            BuildPhase::Resources => self.resources().await?,
            BuildPhase::Assessments => self.assessments().await?,
            BuildPhase::Schedule => self.schedule().await?,
            BuildPhase::Done => 0,
        };

        let checkpoint = self.checkpoint.after_phase(phase);
        self.append(
            EventDraft::new(kind::PHASE_COMPLETED, phase.label()).payload(
                EventPayload::PhaseCompleted(PhaseCompleted {
                    phase,
                    units,
                    checkpoint: checkpoint.clone(),
                }),
            ),
            JobPatch::new().phase(phase.next()),
        )
        .await?;
        self.checkpoint = checkpoint;
        debug!(job_id = %self.job_id, phase = %phase, units, "phase completed");
        Ok(())
    }

    async fn plan(&mut self) -> Result<u32, StepError> {
        let phase = BuildPhase::Plan;
        if self.checkpoint.unit_done(phase, 0) {
            return Ok(1);
        }
        let inner = self.inner;

        let context = ProgramContext::from(&self.job.params);
        let plan = self.call(phase, inner.collaborators.planner.plan(&context)).await?;
        if plan.modules.is_empty() || plan.total_lessons() == 0 {
            return Err(StepError::phase(phase, "plan has no lessons"));
        }

        // Pin the program id on the job first so a redone plan reuses it.
        let program_id = match self.job.program_id {
            Some(id) => id,
            None => {
                let id = ProgramId::new();
                self.job = inner
                    .jobs
                    .update(self.job_id, self.guarded(JobPatch::new().program_id(id)), Utc::now())
                    .await?;
                id
            }
        };

        let total_modules = plan.modules.len() as u32;
        let total_lessons = plan.total_lessons();
        let title = plan.title.clone();
        inner
            .programs
            .save(
                program_id,
                ProgramUnit::Plan {
                    user_id: self.job.user_id,
                    context,
                    plan,
                },
                Utc::now(),
            )
            .await
            .map_err(|e| StepError::phase(phase, e))?;

        let checkpoint = self
            .checkpoint
            .clone()
            .with_program(program_id)
            .after_unit(phase, 0, None, None);
        self.append(
            EventDraft::new(kind::PLAN_CREATED, phase.label())
                .message(title.clone())
                .payload(EventPayload::PlanCreated(PlanCreated {
                    program_id,
                    title: title.clone(),
                    total_modules,
                    total_lessons,
                    checkpoint: checkpoint.clone(),
                })),
            JobPatch::new()
                .program_id(program_id)
                .totals(total_modules, total_lessons)
                .current_item(Some(title)),
        )
        .await?;
        self.checkpoint = checkpoint;
        Ok(1)
    }

    async fn modules(&mut self) -> Result<u32, StepError> {
        let phase = BuildPhase::Modules;
        let inner = self.inner;
        let program = self.program(phase).await?;

        for (m, module) in program.plan.modules.iter().enumerate() {
            let step = m as u32;
            if self.checkpoint.unit_done(phase, step) {
                continue;
            }
            self.beat().await?;
            inner
                .programs
                .save(program.id, ProgramUnit::Module { module_index: step }, Utc::now())
                .await
                .map_err(|e| StepError::phase(phase, e))?;
            self.commit_unit(
                phase,
                step,
                EventPayload::ModuleCreated,
                step,
                None,
                &module.title,
                JobPatch::new().current_item(Some(module.title.clone())),
            )
            .await?;
        }
        Ok(program.plan.modules.len() as u32)
    }

    /// One unit per lesson, then one closing unit per module.
    async fn lessons(&mut self) -> Result<u32, StepError> {
        let phase = BuildPhase::Lessons;
        let inner = self.inner;
        let program = self.program(phase).await?;
        let context = &program.context;
        let mut step = 0u32;

        for (m, module) in program.plan.modules.iter().enumerate() {
            let module_index = m as u32;
            for (l, lesson) in module.lessons.iter().enumerate() {
                let lesson_index = l as u32;
                if !self.checkpoint.unit_done(phase, step) {
                    self.beat().await?;
                    let content = self
                        .call(
                            phase,
                            inner.collaborators.writer.write_lesson(context, module, lesson),
                        )
                        .await?;
                    inner
                        .programs
                        .save(
                            program.id,
                            ProgramUnit::Lesson {
                                module_index,
                                lesson_index,
                                content,
                            },
                            Utc::now(),
                        )
                        .await
                        .map_err(|e| StepError::phase(phase, e))?;
                    let completed = self.job.completed_lessons + 1;
                    self.commit_unit(
                        phase,
                        step,
                        EventPayload::LessonCompleted,
                        module_index,
                        Some(lesson_index),
                        &lesson.title,
                        JobPatch::new()
                            .completed_lessons(completed)
                            .current_item(Some(lesson.title.clone())),
                    )
                    .await?;
                }
                step += 1;
            }

            if !self.checkpoint.unit_done(phase, step) {
                let completed = self.job.completed_modules + 1;
                self.commit_unit(
                    phase,
                    step,
                    EventPayload::ModuleCompleted,
                    module_index,
                    None,
                    &module.title,
                    JobPatch::new().completed_modules(completed),
                )
                .await?;
            }
            step += 1;
        }
        Ok(step)
    }

    async fn resources(&mut self) -> Result<u32, StepError> {
        let phase = BuildPhase::Resources;
        let inner = self.inner;
        let program = self.program(phase).await?;
        let mut step = 0u32;

        for module in &program.modules {
            for lesson in &module.lessons {
                if !self.checkpoint.unit_done(phase, step) {
                    self.beat().await?;
                    let resources = self
                        .call(
                            phase,
                            inner.collaborators.curator.curate(&program.context, &lesson.content()),
                        )
                        .await?;
                    inner
                        .programs
                        .save(
                            program.id,
                            ProgramUnit::Resources {
                                module_index: module.index,
                                lesson_index: lesson.index,
                                resources,
                            },
                            Utc::now(),
                        )
                        .await
                        .map_err(|e| StepError::phase(phase, e))?;
                    self.commit_unit(
                        phase,
                        step,
                        EventPayload::ResourcesCompleted,
                        module.index,
                        Some(lesson.index),
                        &lesson.title,
                        JobPatch::new().current_item(Some(lesson.title.clone())),
                    )
                    .await?;
                }
                step += 1;
            }
        }
        Ok(step)
    }

    async fn assessments(&mut self) -> Result<u32, StepError> {
        let phase = BuildPhase::Assessments;
        let inner = self.inner;
        let program = self.program(phase).await?;

        for (module, planned) in program.modules.iter().zip(&program.plan.modules) {
            let step = module.index;
            if self.checkpoint.unit_done(phase, step) {
                continue;
            }
            self.beat().await?;
            let lessons: Vec<_> = module.lessons.iter().map(|l| l.content()).collect();
            let exercises = self
                .call(
                    phase,
                    inner.collaborators.grader.exercises(&program.context, planned, &lessons),
                )
                .await?;
            let title = exercises.title.clone();
            inner
                .programs
                .save(
                    program.id,
                    ProgramUnit::Exercises {
                        module_index: module.index,
                        exercises,
                    },
                    Utc::now(),
                )
                .await
                .map_err(|e| StepError::phase(phase, e))?;
            self.commit_unit(
                phase,
                step,
                EventPayload::AssessmentCompleted,
                module.index,
                None,
                &title,
                JobPatch::new().current_item(Some(title.clone())),
            )
            .await?;
        }
        Ok(program.modules.len() as u32)
    }

    /// Single unit, committed by the `phase.completed` event itself.
    async fn schedule(&mut self) -> Result<u32, StepError> {
        let phase = BuildPhase::Schedule;
        let inner = self.inner;
        let program = self.program(phase).await?;

        self.beat().await?;
        let schedule = self
            .call(
                phase,
                inner.collaborators.scheduler.schedule(&program.context, &program.plan),
            )
            .await?;
        inner
            .programs
            .save(program.id, ProgramUnit::Schedule(schedule), Utc::now())
            .await
            .map_err(|e| StepError::phase(phase, e))?;
        Ok(1)
    }

    /// Record phase failure then job failure. The job ends FAILED.
    async fn fail(&mut self, phase: BuildPhase, message: &str) -> Result<(), StepError> {
        warn!(job_id = %self.job_id, phase = %phase, error = %message, "build phase failed");
        let error = BuildError::PhaseFailed {
            phase,
            message: message.to_string(),
        }
        .to_string();

        self.append(
            EventDraft::new(kind::PHASE_FAILED, phase.label())
                .status(EventStatus::Failed)
                .level(EventLevel::Error)
                .message(message)
                .payload(EventPayload::PhaseFailed(PhaseFailed {
                    phase,
                    error: message.to_string(),
                    checkpoint: self.checkpoint.clone(),
                })),
            JobPatch::new(),
        )
        .await?;

        self.append(
            EventDraft::new(kind::JOB_FAILED, "Build failed")
                .status(EventStatus::Failed)
                .level(EventLevel::Error)
                .message(error.clone())
                .payload(EventPayload::JobFailed(JobFailed {
                    error: error.clone(),
                    phase,
                })),
            JobPatch::new()
                .status(JobStatus::Failed)
                .error(Some(error))
                .finished_at(Some(Utc::now()))
                .current_item(None)
                .release_lease(),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit_unit(
        &mut self,
        phase: BuildPhase,
        step: u32,
        wrap: fn(UnitCompleted) -> EventPayload,
        module_index: u32,
        lesson_index: Option<u32>,
        title: &str,
        patch: JobPatch,
    ) -> Result<(), StepError> {
        let checkpoint =
            self.checkpoint
                .after_unit(phase, step, Some(module_index), lesson_index);
        let payload = wrap(UnitCompleted {
            module_index,
            lesson_index,
            title: Some(title.to_string()),
            checkpoint: checkpoint.clone(),
        });
        let Some(event_type) = payload.event_type() else {
            return Err(StepError::phase(phase, "unit payload has no event type"));
        };
        self.append(
            EventDraft::new(event_type, phase.label())
                .message(title)
                .payload(payload),
            patch,
        )
        .await?;
        self.checkpoint = checkpoint;
        Ok(())
    }

    /// Runner writes require the lease and a RUNNING job.
    fn guarded(&self, patch: JobPatch) -> JobPatch {
        patch
            .held_by(self.inner.runner_id.clone())
            .expect_status(JobStatus::Running)
    }

    async fn append(&mut self, draft: EventDraft, patch: JobPatch) -> Result<(), StepError> {
        let patch = self.guarded(patch);
        let (event, job) = self
            .inner
            .jobs
            .append_event(
                self.job_id,
                draft,
                ExpectedIndex::Exact(self.last_index),
                patch,
                Utc::now(),
            )
            .await?;
        self.last_index = event.index;
        self.job = job;
        Ok(())
    }

    async fn beat(&mut self) -> Result<(), StepError> {
        if self.lease_lost.is_cancelled() {
            return Err(StepError::Fenced);
        }
        let now = Utc::now();
        let until = now + to_chrono(self.inner.config.lease_ttl);
        self.job = self
            .inner
            .jobs
            .heartbeat(self.job_id, &self.inner.runner_id, until, now)
            .await?;
        Ok(())
    }

    /// Await a collaborator, abandoning it if the lease is lost meanwhile.
    async fn call<T>(
        &self,
        phase: BuildPhase,
        fut: impl Future<Output = GenerationResult<T>>,
    ) -> Result<T, StepError> {
        tokio::select! {
            _ = self.lease_lost.cancelled() => Err(StepError::Fenced),
            out = fut => out.map_err(|e| StepError::phase(phase, e)),
        }
    }

    async fn program(&self, phase: BuildPhase) -> Result<Program, StepError> {
        let program_id = self
            .checkpoint
            .program_id
            .or(self.job.program_id)
            .ok_or_else(|| StepError::phase(phase, "no program was planned"))?;
        self.inner
            .programs
            .get(program_id)
            .await
            .map_err(|e| StepError::phase(phase, e))?
            .ok_or_else(|| StepError::phase(phase, format!("program {program_id} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use studyforge_ai::{
        GenerationError, LessonContent, PlannedLesson, PlannedModule, TemplateGenerator,
    };
    use studyforge_core::UserId;

    use crate::testing::{Harness, harness, harness_with, profile};

    /// Lesson writer that misbehaves once at a given call.
    struct ScriptedWriter {
        inner: TemplateGenerator,
        calls: AtomicU32,
        trip_at: u32,
        tripped: AtomicBool,
        action: Trip,
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Trip {
        Fail,
        Hang,
        Panic,
    }

    impl ScriptedWriter {
        fn tripping_at(call: u32, action: Trip) -> Self {
            Self {
                inner: TemplateGenerator::with_limits(2, 2),
                calls: AtomicU32::new(0),
                trip_at: call,
                tripped: AtomicBool::new(false),
                action,
            }
        }

        fn failing_at(call: u32) -> Self {
            Self::tripping_at(call, Trip::Fail)
        }

        fn hanging() -> Self {
            Self::tripping_at(1, Trip::Hang)
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LessonWriter for ScriptedWriter {
        async fn write_lesson(
            &self,
            ctx: &ProgramContext,
            module: &PlannedModule,
            lesson: &PlannedLesson,
        ) -> GenerationResult<LessonContent> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.trip_at && !self.tripped.swap(true, Ordering::SeqCst) {
                match self.action {
                    Trip::Fail => return Err(GenerationError::failed("model timeout")),
                    Trip::Hang => std::future::pending::<()>().await,
                    Trip::Panic => panic!("writer blew up"),
                }
            }
            self.inner.write_lesson(ctx, module, lesson).await
        }
    }

    fn collaborators_with(writer: Arc<ScriptedWriter>) -> Collaborators {
        let mut collaborators =
            Collaborators::from_generator(Arc::new(TemplateGenerator::with_limits(2, 2)));
        collaborators.writer = writer;
        collaborators
    }

    fn with_writer(writer: Arc<ScriptedWriter>, config: OrchestratorConfig) -> Harness {
        harness_with(collaborators_with(writer), config)
    }

    async fn wait_for(h: &Harness, job_id: JobId, done: impl Fn(&BuildJob) -> bool) -> BuildJob {
        for _ in 0..400 {
            let job = h.jobs.get_job_or_fail(job_id).await.unwrap();
            if done(&job) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached the expected state");
    }

    async fn submitted(h: &Harness) -> BuildJob {
        h.jobs
            .submit(UserId::new(), profile())
            .await
            .unwrap()
            .job()
            .clone()
    }

    fn types(events: &[studyforge_events::BuildEvent]) -> Vec<&str> {
        events.iter().map(|e| e.event_type.as_str()).collect()
    }

    #[tokio::test]
    async fn full_run_builds_the_program() {
        let h = harness();
        let job = submitted(&h).await;

        let outcome = h.dispatcher.run(job.id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        let job = h.jobs.get_job_or_fail(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.phase, BuildPhase::Done);
        assert_eq!((job.total_modules, job.total_lessons), (2, 4));
        assert_eq!((job.completed_modules, job.completed_lessons), (2, 4));
        assert!(job.finished_at.is_some());
        assert!(job.claimed_by.is_none());

        let events = h.jobs.events_since(job.id, 0).await.unwrap();
        assert_eq!(events.len(), 30);
        assert!(events.iter().enumerate().all(|(i, e)| e.index == i as u64 + 1));
        let types = types(&events);
        assert_eq!(types[0], kind::JOB_QUEUED);
        assert_eq!(types[1], kind::JOB_STARTED);
        assert_eq!(types[29], kind::JOB_COMPLETED);
        assert_eq!(types.iter().filter(|t| **t == kind::LESSON_COMPLETED).count(), 4);
        assert_eq!(types.iter().filter(|t| **t == kind::MODULE_COMPLETED).count(), 2);
        assert_eq!(types.iter().filter(|t| **t == kind::PHASE_COMPLETED).count(), 6);

        let program = h
            .programs
            .get(job.program_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(program.schedule.is_some());
        assert!(program.modules.iter().all(|m| m.exercises.is_some()));
        assert!(
            program
                .modules
                .iter()
                .flat_map(|m| &m.lessons)
                .all(|l| l.resources.is_some())
        );
    }

    #[tokio::test]
    async fn failed_phase_resumes_after_the_last_committed_unit() {
        let writer = Arc::new(ScriptedWriter::failing_at(3));
        let h = with_writer(writer.clone(), OrchestratorConfig::default());
        let job = submitted(&h).await;

        let outcome = h.dispatcher.run(job.id).await.unwrap();
        assert!(matches!(
            outcome,
            RunOutcome::Failed {
                phase: BuildPhase::Lessons,
                ..
            }
        ));
        let failed = h.jobs.get_job_or_fail(job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.completed_lessons, 2);
        assert!(failed.error.as_deref().unwrap().contains("model timeout"));
        let events = h.jobs.events_since(job.id, 0).await.unwrap();
        let tail: Vec<_> = types(&events).into_iter().rev().take(2).collect();
        assert_eq!(tail, vec![kind::JOB_FAILED, kind::PHASE_FAILED]);

        h.jobs
            .update_job_state(
                job.id,
                JobPatch::new()
                    .expect_status(JobStatus::Failed)
                    .status(JobStatus::Queued)
                    .retry_count(1),
            )
            .await
            .unwrap();
        let outcome = h.dispatcher.run(job.id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        // Two lessons before the failure, then the failing one and the last.
        assert_eq!(writer.calls(), 5);
        let job = h.jobs.get_job_or_fail(job.id).await.unwrap();
        assert_eq!(job.completed_lessons, 4);
        assert_eq!(job.completed_modules, 2);
        let events = h.jobs.events_since(job.id, 0).await.unwrap();
        let plans = events
            .iter()
            .filter(|e| e.event_type == kind::PLAN_CREATED)
            .count();
        assert_eq!(plans, 1);
    }

    #[tokio::test]
    async fn live_lease_elsewhere_makes_run_a_no_op() {
        let h = harness();
        let job = submitted(&h).await;
        let now = Utc::now();
        h.jobs_store
            .try_claim(job.id, "other", now + chrono::Duration::seconds(60), now)
            .await
            .unwrap();

        let outcome = h.dispatcher.run(job.id).await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::AlreadyRunning {
                runner_id: "other".into()
            }
        );
        let events = h.jobs.events_since(job.id, 0).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn terminal_job_is_not_runnable() {
        let h = harness();
        let job = submitted(&h).await;
        h.jobs.cancel_job(job.id).await.unwrap();

        let outcome = h.dispatcher.run(job.id).await.unwrap();
        assert_eq!(outcome, RunOutcome::NotRunnable(JobStatus::Canceled));
    }

    #[tokio::test]
    async fn cancel_stops_a_running_build() {
        let config = OrchestratorConfig::default()
            .with_lease(Duration::from_millis(20), Duration::from_millis(500));
        let h = with_writer(Arc::new(ScriptedWriter::hanging()), config);
        let job = submitted(&h).await;

        let handle = h.dispatcher.ensure_running(job.id).unwrap();
        for _ in 0..100 {
            let current = h.jobs.get_job_or_fail(job.id).await.unwrap();
            if current.phase == BuildPhase::Lessons {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.jobs.cancel_job(job.id).await.unwrap();

        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(outcome, RunOutcome::Stopped);

        let job = h.jobs.get_job_or_fail(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        let events = h.jobs.events_since(job.id, 0).await.unwrap();
        assert_eq!(events.last().unwrap().event_type, kind::JOB_CANCELED);
    }

    #[tokio::test]
    async fn ensure_running_spawns_once_per_job() {
        let h = harness();
        let job = submitted(&h).await;

        let first = h.dispatcher.ensure_running(job.id);
        let second = h.dispatcher.ensure_running(job.id);
        assert!(first.is_some());
        assert!(second.is_none());

        let outcome = first.unwrap().await.unwrap().unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert!(!h.dispatcher.is_in_flight(job.id));
    }

    #[tokio::test]
    async fn panicking_writer_fails_the_job_and_releases_the_lease() {
        let config = OrchestratorConfig::default()
            .with_lease(Duration::from_millis(20), Duration::from_millis(500));
        let writer = Arc::new(ScriptedWriter::tripping_at(2, Trip::Panic));
        let h = with_writer(writer, config);
        let job = submitted(&h).await;

        let handle = h.dispatcher.ensure_running(job.id).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let RunOutcome::Failed { phase, message } = outcome else {
            panic!("expected a failed run, got {outcome:?}");
        };
        assert_eq!(phase, BuildPhase::Lessons);
        assert!(message.contains("writer blew up"));
        assert!(!h.dispatcher.is_in_flight(job.id));

        let failed = h.jobs.get_job_or_fail(job.id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.claimed_by.is_none());
        assert_eq!(failed.completed_lessons, 1);

        // The ticker is gone: nothing renews the job any more.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let later = h.jobs.get_job_or_fail(job.id).await.unwrap();
        assert_eq!(later.last_heartbeat_at, failed.last_heartbeat_at);
        assert_eq!(later.last_event_index, failed.last_event_index);
        let events = h.jobs.events_since(job.id, 0).await.unwrap();
        let tail: Vec<_> = types(&events).into_iter().rev().take(2).collect();
        assert_eq!(tail, vec![kind::JOB_FAILED, kind::PHASE_FAILED]);
    }

    #[tokio::test]
    async fn unwound_run_stops_renewing_its_lease() {
        let config = OrchestratorConfig::default()
            .with_lease(Duration::from_millis(20), Duration::from_millis(200));
        let writer = Arc::new(ScriptedWriter::tripping_at(1, Trip::Panic));
        let h = with_writer(writer, config);
        let job = submitted(&h).await;

        let dispatcher = h.dispatcher.clone();
        let joined = tokio::spawn(async move { dispatcher.run(job.id).await }).await;
        assert!(joined.unwrap_err().is_panic());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let before = h.jobs.get_job_or_fail(job.id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let after = h.jobs.get_job_or_fail(job.id).await.unwrap();
        assert_eq!(after.status, JobStatus::Running);
        assert_eq!(after.last_heartbeat_at, before.last_heartbeat_at);

        let expired = wait_for(&h, job.id, |j| !j.lease_is_live(Utc::now())).await;
        assert_eq!(expired.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn expired_lease_is_taken_over_from_the_checkpoint() {
        let config = OrchestratorConfig::default()
            .with_lease(Duration::from_millis(20), Duration::from_millis(150));
        let writer = Arc::new(ScriptedWriter::tripping_at(3, Trip::Hang));
        let h = with_writer(writer.clone(), config.clone());
        let job = submitted(&h).await;

        let dispatcher = h.dispatcher.clone();
        let first = tokio::spawn(async move { dispatcher.run(job.id).await });
        wait_for(&h, job.id, |j| j.completed_lessons == 2).await;
        while writer.calls() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // The first runner dies mid-lesson without a chance to clean up.
        first.abort();
        assert!(first.await.unwrap_err().is_cancelled());

        let stranded = wait_for(&h, job.id, |j| !j.lease_is_live(Utc::now())).await;
        assert_eq!(stranded.status, JobStatus::Running);
        assert_eq!(writer.calls(), 3);

        let successor = BuildDispatcher::new(
            h.jobs_store.clone(),
            h.programs.clone(),
            collaborators_with(writer.clone()),
            config,
        );
        assert_ne!(successor.runner_id(), h.dispatcher.runner_id());
        let outcome = successor.run(job.id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        // Only the two lessons never committed are written again.
        assert_eq!(writer.calls(), 5);
        let done = h.jobs.get_job_or_fail(job.id).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!((done.completed_modules, done.completed_lessons), (2, 4));

        let events = h.jobs.events_since(job.id, 0).await.unwrap();
        let count = |t: &str| events.iter().filter(|e| e.event_type == t).count();
        assert_eq!(count(kind::PLAN_CREATED), 1);
        assert_eq!(count(kind::LESSON_COMPLETED), 4);
        assert_eq!(count(kind::JOB_STARTED), 2);
    }
}
