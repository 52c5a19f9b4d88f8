use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use studyforge_core::{EventId, JobId};

use crate::kind;
use crate::payload::EventPayload;

/// Lifecycle status carried by an event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Pending => "PENDING",
            EventStatus::InProgress => "IN_PROGRESS",
            EventStatus::Completed => "COMPLETED",
            EventStatus::Failed => "FAILED",
            EventStatus::Skipped => "SKIPPED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(EventStatus::Pending),
            "IN_PROGRESS" => Some(EventStatus::InProgress),
            "COMPLETED" => Some(EventStatus::Completed),
            "FAILED" => Some(EventStatus::Failed),
            "SKIPPED" => Some(EventStatus::Skipped),
            _ => None,
        }
    }
}

/// Severity of an event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

impl EventLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            EventLevel::Info => "INFO",
            EventLevel::Warn => "WARN",
            EventLevel::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INFO" => Some(EventLevel::Info),
            "WARN" => Some(EventLevel::Warn),
            "ERROR" => Some(EventLevel::Error),
            _ => None,
        }
    }
}

/// A persisted build event.
///
/// Immutable once written. `index` is assigned by the store: strictly
/// increasing per job, starting at 1, without gaps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildEvent {
    pub id: EventId,
    pub job_id: JobId,
    pub index: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub step: String,
    pub status: EventStatus,
    pub level: EventLevel,
    pub message: Option<String>,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl BuildEvent {
    /// Typed view of the payload (unknown shapes come back as `Opaque`).
    pub fn typed_payload(&self) -> EventPayload {
        EventPayload::decode(&self.event_type, &self.payload)
    }

    pub fn is_structural(&self) -> bool {
        kind::is_structural(&self.event_type)
    }
}

/// An event ready to be appended (not yet assigned an index).
#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub event_type: String,
    pub step: String,
    pub status: EventStatus,
    pub level: EventLevel,
    pub message: Option<String>,
    pub payload: JsonValue,
}

impl EventDraft {
    pub fn new(event_type: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            step: step.into(),
            status: EventStatus::Completed,
            level: EventLevel::Info,
            message: None,
            payload: JsonValue::Null,
        }
    }

    pub fn status(mut self, status: EventStatus) -> Self {
        self.status = status;
        self
    }

    pub fn level(mut self, level: EventLevel) -> Self {
        self.level = level;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload.to_json();
        self
    }

    pub fn raw_payload(mut self, payload: JsonValue) -> Self {
        self.payload = payload;
        self
    }

    /// Materialize the draft at a store-assigned index.
    pub fn into_event(self, job_id: JobId, index: u64, created_at: DateTime<Utc>) -> BuildEvent {
        BuildEvent {
            id: EventId::new(),
            job_id,
            index,
            event_type: self.event_type,
            step: self.step,
            status: self.status,
            level: self.level,
            message: self.message,
            payload: self.payload,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn draft_defaults_to_completed_info() {
        let draft = EventDraft::new(kind::JOB_QUEUED, "Queued");
        assert_eq!(draft.status, EventStatus::Completed);
        assert_eq!(draft.level, EventLevel::Info);
        assert!(draft.payload.is_null());
    }

    #[test]
    fn event_serializes_with_wire_names() {
        let event = EventDraft::new(kind::PHASE_STARTED, "Planning curriculum")
            .status(EventStatus::InProgress)
            .raw_payload(json!({"phase": "plan"}))
            .into_event(JobId::new(), 1, Utc::now());

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "phase.started");
        assert_eq!(value["status"], "IN_PROGRESS");
        assert_eq!(value["level"], "INFO");
        assert_eq!(value["index"], 1);
        assert!(value.get("jobId").is_some());
    }

    #[test]
    fn status_and_level_parse_their_wire_form() {
        for status in [
            EventStatus::Pending,
            EventStatus::InProgress,
            EventStatus::Completed,
            EventStatus::Failed,
            EventStatus::Skipped,
        ] {
            assert_eq!(EventStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(EventLevel::parse("WARN"), Some(EventLevel::Warn));
        assert_eq!(EventLevel::parse("warn"), None);
    }
}
