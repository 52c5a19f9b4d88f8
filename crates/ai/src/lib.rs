//! `studyforge-ai`
//!
//! **Responsibility:** boundary to the content generators that produce a program.
//!
//! The orchestrator only sees these traits:
//! - generators are injected, never looked up globally
//! - generators never touch job state or the event log
//! - a failed call is a `GenerationError`; the caller decides what it means

pub mod content;
pub mod context;
pub mod generator;
pub mod result;
pub mod template;

pub use content::{
    ExerciseSet, LessonContent, LessonRef, PlannedLesson, PlannedModule, PlannedProgram, Question,
    Resource, Schedule, ScheduleWeek,
};
pub use context::{GoalLevel, LearnerProfile, ProgramContext};
pub use generator::{Grader, LessonWriter, PlanGenerator, ResourceCurator, SchedulePlanner};
pub use result::{GenerationError, GenerationResult};
pub use template::TemplateGenerator;
