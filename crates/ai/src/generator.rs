//! Generation collaborators.
//!
//! Each phase of a build talks to exactly one of these. Implementations may
//! call remote models; they must be safe to call again for the same input
//! after a crash.

use async_trait::async_trait;

use crate::content::{
    ExerciseSet, LessonContent, PlannedLesson, PlannedModule, PlannedProgram, Resource, Schedule,
};
use crate::context::ProgramContext;
use crate::result::GenerationResult;

#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn plan(&self, ctx: &ProgramContext) -> GenerationResult<PlannedProgram>;
}

#[async_trait]
pub trait LessonWriter: Send + Sync {
    async fn write_lesson(
        &self,
        ctx: &ProgramContext,
        module: &PlannedModule,
        lesson: &PlannedLesson,
    ) -> GenerationResult<LessonContent>;
}

#[async_trait]
pub trait ResourceCurator: Send + Sync {
    async fn curate(
        &self,
        ctx: &ProgramContext,
        lesson: &LessonContent,
    ) -> GenerationResult<Vec<Resource>>;
}

/// Produces the exercise set closing a module.
#[async_trait]
pub trait Grader: Send + Sync {
    async fn exercises(
        &self,
        ctx: &ProgramContext,
        module: &PlannedModule,
        lessons: &[LessonContent],
    ) -> GenerationResult<ExerciseSet>;
}

#[async_trait]
pub trait SchedulePlanner: Send + Sync {
    async fn schedule(
        &self,
        ctx: &ProgramContext,
        plan: &PlannedProgram,
    ) -> GenerationResult<Schedule>;
}
