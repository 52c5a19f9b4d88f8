//! Machine-readable event type names.

pub const JOB_QUEUED: &str = "job.queued";
pub const JOB_STARTED: &str = "job.started";
pub const JOB_COMPLETED: &str = "job.completed";
pub const JOB_FAILED: &str = "job.failed";
pub const JOB_CANCELED: &str = "job.canceled";
pub const JOB_RETRY_QUEUED: &str = "job.retry.queued";
pub const JOB_RECOVERY_STARTED: &str = "job.recovery.started";
pub const JOB_RECOVERY_QUEUED: &str = "job.recovery.queued";

pub const PHASE_STARTED: &str = "phase.started";
pub const PHASE_COMPLETED: &str = "phase.completed";
pub const PHASE_FAILED: &str = "phase.failed";

pub const PLAN_CREATED: &str = "plan.created";
pub const MODULE_CREATED: &str = "module.created";
pub const LESSON_COMPLETED: &str = "lesson.completed";
pub const MODULE_COMPLETED: &str = "module.completed";
pub const RESOURCES_COMPLETED: &str = "resources.completed";
pub const ASSESSMENT_COMPLETED: &str = "assessment.completed";

/// Event types after which the program tree has visibly changed shape.
pub fn is_structural(event_type: &str) -> bool {
    matches!(
        event_type,
        PLAN_CREATED | MODULE_COMPLETED | LESSON_COMPLETED | PHASE_COMPLETED
    )
}
