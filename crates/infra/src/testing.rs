//! Fixtures shared by unit tests.

use std::sync::Arc;

use studyforge_ai::{GoalLevel, LearnerProfile, PlannedProgram, ProgramContext, TemplateGenerator};

use crate::config::OrchestratorConfig;
use crate::jobs::{BuildDispatcher, BuildJobs, Collaborators, InMemoryBuildJobStore};
use crate::program::InMemoryProgramStore;

pub fn profile() -> LearnerProfile {
    LearnerProfile {
        goal: "Rust".into(),
        level: GoalLevel::Beginner,
        hours_per_day: 0.5,
        weeks: 3,
        language: "en".into(),
    }
}

/// Context and plan for `profile()`: 2 modules of 2 lessons.
pub fn planned_program() -> (ProgramContext, PlannedProgram) {
    let context = ProgramContext::from(&profile());
    let plan = fixture_plan(&context);
    (context, plan)
}

fn fixture_plan(context: &ProgramContext) -> PlannedProgram {
    use studyforge_ai::{PlannedLesson, PlannedModule};
    PlannedProgram {
        title: format!("{} in {} weeks", context.goal, context.weeks),
        summary: "fixture".into(),
        modules: (1..=2)
            .map(|m| PlannedModule {
                title: format!("Module {m}"),
                objective: format!("Objective {m}"),
                lessons: (1..=2)
                    .map(|l| PlannedLesson {
                        title: format!("Lesson {m}.{l}"),
                        minutes: 60,
                    })
                    .collect(),
            })
            .collect(),
    }
}

pub struct Harness {
    pub jobs_store: Arc<InMemoryBuildJobStore>,
    pub programs: Arc<InMemoryProgramStore>,
    pub jobs: BuildJobs,
    pub dispatcher: BuildDispatcher,
    pub config: OrchestratorConfig,
}

pub fn harness_with(collaborators: Collaborators, config: OrchestratorConfig) -> Harness {
    let jobs_store = InMemoryBuildJobStore::arc();
    let programs = InMemoryProgramStore::arc();
    let jobs = BuildJobs::new(jobs_store.clone(), &config);
    let dispatcher = BuildDispatcher::new(
        jobs_store.clone(),
        programs.clone(),
        collaborators,
        config.clone(),
    );
    Harness {
        jobs_store,
        programs,
        jobs,
        dispatcher,
        config,
    }
}

pub fn harness() -> Harness {
    harness_with(
        Collaborators::from_generator(Arc::new(TemplateGenerator::with_limits(2, 2))),
        OrchestratorConfig::default(),
    )
}
