//! Build view projection.
//!
//! Denormalized read of a job plus whatever part of its program has been
//! committed so far. Read-only; safe to call while a runner is writing.

use std::sync::Arc;

use serde::Serialize;

use studyforge_core::JobId;

use crate::jobs::{BuildError, BuildJob, BuildJobStore};
use crate::program::{ProgramSnapshot, ProgramStore};

/// Job state plus the partially built program.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildView {
    pub job: BuildJob,
    pub program: ProgramSnapshot,
}

#[derive(Clone)]
pub struct BuildViewProjector {
    jobs: Arc<dyn BuildJobStore>,
    programs: Arc<dyn ProgramStore>,
}

impl BuildViewProjector {
    pub fn new(jobs: Arc<dyn BuildJobStore>, programs: Arc<dyn ProgramStore>) -> Self {
        Self { jobs, programs }
    }

    /// `None` when the job does not exist.
    pub async fn get_build_view(&self, job_id: JobId) -> Result<Option<BuildView>, BuildError> {
        let Some(job) = self.jobs.get(job_id).await? else {
            return Ok(None);
        };
        let program = self.program_snapshot(&job).await?;
        Ok(Some(BuildView { job, program }))
    }

    /// Committed program of `job`; the empty shape before the plan exists.
    pub async fn program_snapshot(&self, job: &BuildJob) -> Result<ProgramSnapshot, BuildError> {
        let Some(program_id) = job.program_id else {
            return Ok(ProgramSnapshot::empty());
        };
        Ok(self
            .programs
            .get(program_id)
            .await?
            .map(|program| ProgramSnapshot::from(&program))
            .unwrap_or_default())
    }
}
