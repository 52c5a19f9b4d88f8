//! Resume point of a job, read back from its event log.

use studyforge_core::JobId;
use studyforge_events::{BuildEvent, Checkpoint};

use super::store::{BuildJobStore, JobStoreError};

/// Latest checkpoint carried by `events` (scanned newest first).
pub fn latest_checkpoint(events: &[BuildEvent]) -> Option<Checkpoint> {
    events
        .iter()
        .rev()
        .find_map(|event| event.typed_payload().checkpoint().cloned())
}

/// Checkpoint a resumed run continues from; the initial one when nothing
/// was committed yet.
pub async fn load_checkpoint(
    store: &dyn BuildJobStore,
    job_id: JobId,
) -> Result<Checkpoint, JobStoreError> {
    let job = store
        .get(job_id)
        .await?
        .ok_or(JobStoreError::NotFound(job_id))?;
    let events = store.events_since(job_id, 0).await?;

    let mut checkpoint = latest_checkpoint(&events).unwrap_or_default();
    if checkpoint.program_id.is_none() {
        checkpoint.program_id = job.program_id;
    }
    Ok(checkpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use studyforge_core::{ExpectedIndex, ProgramId, UserId};
    use studyforge_events::payload::{PhaseCompleted, PhaseMarker};
    use studyforge_events::{BuildPhase, EventDraft, EventPayload, kind};

    use crate::jobs::{BuildJob, InMemoryBuildJobStore, JobPatch};
    use crate::testing::profile;

    async fn append(store: &InMemoryBuildJobStore, job_id: JobId, draft: EventDraft) {
        store
            .append_event(job_id, draft, ExpectedIndex::Any, JobPatch::new(), Utc::now())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn empty_log_resumes_from_the_start() {
        let store = InMemoryBuildJobStore::new();
        let job = BuildJob::new(UserId::new(), profile(), 3, Utc::now());
        store.insert(job.clone()).await.unwrap();

        let cp = load_checkpoint(&store, job.id).await.unwrap();
        assert_eq!(cp, Checkpoint::initial());
    }

    #[tokio::test]
    async fn newest_checkpoint_wins_and_opaque_events_are_skipped() {
        let store = InMemoryBuildJobStore::new();
        let job = BuildJob::new(UserId::new(), profile(), 3, Utc::now());
        store.insert(job.clone()).await.unwrap();
        let program_id = ProgramId::new();

        let after_plan = Checkpoint::initial()
            .with_program(program_id)
            .after_phase(BuildPhase::Plan);
        append(
            &store,
            job.id,
            EventDraft::new(kind::PHASE_COMPLETED, "Planning curriculum").payload(
                EventPayload::PhaseCompleted(PhaseCompleted {
                    phase: BuildPhase::Plan,
                    units: 1,
                    checkpoint: after_plan.clone(),
                }),
            ),
        )
        .await;
        append(
            &store,
            job.id,
            EventDraft::new(kind::PHASE_STARTED, "Creating modules").payload(
                EventPayload::PhaseStarted(PhaseMarker {
                    phase: BuildPhase::Modules,
                }),
            ),
        )
        .await;
        append(
            &store,
            job.id,
            EventDraft::new("agent.note", "note").raw_payload(json!({"checkpoint": "garbage"})),
        )
        .await;

        let cp = load_checkpoint(&store, job.id).await.unwrap();
        assert_eq!(cp, after_plan);
        assert_eq!(cp.program_id, Some(program_id));
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let store = InMemoryBuildJobStore::new();
        let id = JobId::new();
        assert_eq!(
            load_checkpoint(&store, id).await.unwrap_err(),
            JobStoreError::NotFound(id)
        );
    }
}
