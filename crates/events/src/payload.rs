//! Typed view over event payloads.
//!
//! The payload column stays plain JSON so old rows keep decoding while shapes
//! evolve. Readers go through [`EventPayload::decode`], which never fails:
//! anything it does not recognize comes back as [`EventPayload::Opaque`].

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use studyforge_core::{ProgramId, UserId};

use crate::checkpoint::Checkpoint;
use crate::kind;
use crate::phase::BuildPhase;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobQueued {
    pub user_id: UserId,
    pub program_id: Option<ProgramId>,
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStarted {
    pub runner_id: String,
    pub retry_count: u32,
    pub resume_from: Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseMarker {
    pub phase: BuildPhase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseCompleted {
    pub phase: BuildPhase,
    pub units: u32,
    pub checkpoint: Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseFailed {
    pub phase: BuildPhase,
    pub error: String,
    pub checkpoint: Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanCreated {
    pub program_id: ProgramId,
    pub title: String,
    pub total_modules: u32,
    pub total_lessons: u32,
    pub checkpoint: Checkpoint,
}

/// One committed unit inside a phase (module, lesson, resource set, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitCompleted {
    pub module_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lesson_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub checkpoint: Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFinished {
    pub program_id: Option<ProgramId>,
    pub completed_modules: u32,
    pub completed_lessons: u32,
    pub checkpoint: Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFailed {
    pub error: String,
    pub phase: BuildPhase,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCanceled {
    pub previous_status: String,
}

/// Carried by both `job.retry.queued` and `job.recovery.queued`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryQueued {
    pub retry_count: u32,
    pub max_retries: u32,
    pub resume_from: Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStarted {
    pub checkpoint: Checkpoint,
    pub stale_seconds: i64,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    JobQueued(JobQueued),
    JobStarted(JobStarted),
    JobCompleted(JobFinished),
    JobFailed(JobFailed),
    JobCanceled(JobCanceled),
    RetryQueued(RetryQueued),
    RecoveryStarted(RecoveryStarted),
    RecoveryQueued(RetryQueued),
    PhaseStarted(PhaseMarker),
    PhaseCompleted(PhaseCompleted),
    PhaseFailed(PhaseFailed),
    PlanCreated(PlanCreated),
    ModuleCreated(UnitCompleted),
    LessonCompleted(UnitCompleted),
    ModuleCompleted(UnitCompleted),
    ResourcesCompleted(UnitCompleted),
    AssessmentCompleted(UnitCompleted),
    Opaque(JsonValue),
}

fn typed<T: DeserializeOwned>(value: &JsonValue, wrap: fn(T) -> EventPayload) -> EventPayload {
    match serde_json::from_value::<T>(value.clone()) {
        Ok(inner) => wrap(inner),
        Err(_) => EventPayload::Opaque(value.clone()),
    }
}

impl EventPayload {
    /// Decode a stored payload according to its event type.
    pub fn decode(event_type: &str, value: &JsonValue) -> Self {
        match event_type {
            kind::JOB_QUEUED => typed(value, EventPayload::JobQueued),
            kind::JOB_STARTED => typed(value, EventPayload::JobStarted),
            kind::JOB_COMPLETED => typed(value, EventPayload::JobCompleted),
            kind::JOB_FAILED => typed(value, EventPayload::JobFailed),
            kind::JOB_CANCELED => typed(value, EventPayload::JobCanceled),
            kind::JOB_RETRY_QUEUED => typed(value, EventPayload::RetryQueued),
            kind::JOB_RECOVERY_STARTED => typed(value, EventPayload::RecoveryStarted),
            kind::JOB_RECOVERY_QUEUED => typed(value, EventPayload::RecoveryQueued),
            kind::PHASE_STARTED => typed(value, EventPayload::PhaseStarted),
            kind::PHASE_COMPLETED => typed(value, EventPayload::PhaseCompleted),
            kind::PHASE_FAILED => typed(value, EventPayload::PhaseFailed),
            kind::PLAN_CREATED => typed(value, EventPayload::PlanCreated),
            kind::MODULE_CREATED => typed(value, EventPayload::ModuleCreated),
            kind::LESSON_COMPLETED => typed(value, EventPayload::LessonCompleted),
            kind::MODULE_COMPLETED => typed(value, EventPayload::ModuleCompleted),
            kind::RESOURCES_COMPLETED => typed(value, EventPayload::ResourcesCompleted),
            kind::ASSESSMENT_COMPLETED => typed(value, EventPayload::AssessmentCompleted),
            _ => EventPayload::Opaque(value.clone()),
        }
    }

    /// Event type this payload belongs to; `None` for opaque payloads.
    pub fn event_type(&self) -> Option<&'static str> {
        let ty = match self {
            EventPayload::JobQueued(_) => kind::JOB_QUEUED,
            EventPayload::JobStarted(_) => kind::JOB_STARTED,
            EventPayload::JobCompleted(_) => kind::JOB_COMPLETED,
            EventPayload::JobFailed(_) => kind::JOB_FAILED,
            EventPayload::JobCanceled(_) => kind::JOB_CANCELED,
            EventPayload::RetryQueued(_) => kind::JOB_RETRY_QUEUED,
            EventPayload::RecoveryStarted(_) => kind::JOB_RECOVERY_STARTED,
            EventPayload::RecoveryQueued(_) => kind::JOB_RECOVERY_QUEUED,
            EventPayload::PhaseStarted(_) => kind::PHASE_STARTED,
            EventPayload::PhaseCompleted(_) => kind::PHASE_COMPLETED,
            EventPayload::PhaseFailed(_) => kind::PHASE_FAILED,
            EventPayload::PlanCreated(_) => kind::PLAN_CREATED,
            EventPayload::ModuleCreated(_) => kind::MODULE_CREATED,
            EventPayload::LessonCompleted(_) => kind::LESSON_COMPLETED,
            EventPayload::ModuleCompleted(_) => kind::MODULE_COMPLETED,
            EventPayload::ResourcesCompleted(_) => kind::RESOURCES_COMPLETED,
            EventPayload::AssessmentCompleted(_) => kind::ASSESSMENT_COMPLETED,
            EventPayload::Opaque(_) => return None,
        };
        Some(ty)
    }

    pub fn to_json(&self) -> JsonValue {
        let encoded = match self {
            EventPayload::JobQueued(p) => serde_json::to_value(p),
            EventPayload::JobStarted(p) => serde_json::to_value(p),
            EventPayload::JobCompleted(p) => serde_json::to_value(p),
            EventPayload::JobFailed(p) => serde_json::to_value(p),
            EventPayload::JobCanceled(p) => serde_json::to_value(p),
            EventPayload::RetryQueued(p) | EventPayload::RecoveryQueued(p) => {
                serde_json::to_value(p)
            }
            EventPayload::RecoveryStarted(p) => serde_json::to_value(p),
            EventPayload::PhaseStarted(p) => serde_json::to_value(p),
            EventPayload::PhaseCompleted(p) => serde_json::to_value(p),
            EventPayload::PhaseFailed(p) => serde_json::to_value(p),
            EventPayload::PlanCreated(p) => serde_json::to_value(p),
            EventPayload::ModuleCreated(p)
            | EventPayload::LessonCompleted(p)
            | EventPayload::ModuleCompleted(p)
            | EventPayload::ResourcesCompleted(p)
            | EventPayload::AssessmentCompleted(p) => serde_json::to_value(p),
            EventPayload::Opaque(v) => return v.clone(),
        };
        // Plain structs with string keys always encode.
        encoded.unwrap_or(JsonValue::Null)
    }

    /// Resume marker carried by this payload, if any.
    pub fn checkpoint(&self) -> Option<&Checkpoint> {
        match self {
            EventPayload::JobStarted(p) => Some(&p.resume_from),
            EventPayload::JobCompleted(p) => Some(&p.checkpoint),
            EventPayload::RetryQueued(p) | EventPayload::RecoveryQueued(p) => Some(&p.resume_from),
            EventPayload::RecoveryStarted(p) => Some(&p.checkpoint),
            EventPayload::PhaseCompleted(p) => Some(&p.checkpoint),
            EventPayload::PhaseFailed(p) => Some(&p.checkpoint),
            EventPayload::PlanCreated(p) => Some(&p.checkpoint),
            EventPayload::ModuleCreated(p)
            | EventPayload::LessonCompleted(p)
            | EventPayload::ModuleCompleted(p)
            | EventPayload::ResourcesCompleted(p)
            | EventPayload::AssessmentCompleted(p) => Some(&p.checkpoint),
            EventPayload::JobQueued(_)
            | EventPayload::JobFailed(_)
            | EventPayload::JobCanceled(_)
            | EventPayload::PhaseStarted(_)
            | EventPayload::Opaque(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lesson(step: u32) -> EventPayload {
        EventPayload::LessonCompleted(UnitCompleted {
            module_index: 0,
            lesson_index: Some(step),
            title: Some("Ownership".into()),
            checkpoint: Checkpoint::initial().after_unit(
                BuildPhase::Lessons,
                step,
                Some(0),
                Some(step),
            ),
        })
    }

    #[test]
    fn known_payload_decodes_to_its_variant() {
        let payload = lesson(1);
        let decoded = EventPayload::decode(kind::LESSON_COMPLETED, &payload.to_json());
        assert_eq!(decoded, payload);
        assert_eq!(decoded.event_type(), Some(kind::LESSON_COMPLETED));
        assert_eq!(decoded.checkpoint().map(|cp| cp.step), Some(2));
    }

    #[test]
    fn unknown_type_is_opaque() {
        let raw = json!({"anything": [1, 2, 3]});
        let decoded = EventPayload::decode("agent.thought", &raw);
        assert_eq!(decoded, EventPayload::Opaque(raw));
        assert!(decoded.checkpoint().is_none());
        assert!(decoded.event_type().is_none());
    }

    #[test]
    fn malformed_known_payload_is_opaque() {
        let raw = json!({"retryCount": "three"});
        let decoded = EventPayload::decode(kind::JOB_RETRY_QUEUED, &raw);
        assert_eq!(decoded, EventPayload::Opaque(raw));
    }

    #[test]
    fn recovery_started_keeps_stale_duration() {
        let payload = EventPayload::RecoveryStarted(RecoveryStarted {
            checkpoint: Checkpoint::initial(),
            stale_seconds: 200,
            last_heartbeat_at: None,
        });
        let json = payload.to_json();
        assert_eq!(json["staleSeconds"], 200);
        assert_eq!(json["checkpoint"]["phase"], "plan");
    }
}
