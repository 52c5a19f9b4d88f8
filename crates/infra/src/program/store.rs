use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use studyforge_core::ProgramId;

use super::tree::{Program, ProgramUnit};

/// Program store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProgramStoreError {
    #[error("program not found: {0}")]
    NotFound(ProgramId),
    #[error("invalid unit for program {program_id}: {message}")]
    InvalidUnit {
        program_id: ProgramId,
        message: String,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl ProgramStoreError {
    pub fn invalid(program_id: ProgramId, message: impl Into<String>) -> Self {
        Self::InvalidUnit {
            program_id,
            message: message.into(),
        }
    }
}

/// Storage for program trees.
#[async_trait]
pub trait ProgramStore: Send + Sync {
    async fn get(&self, program_id: ProgramId) -> Result<Option<Program>, ProgramStoreError>;

    /// Commit one unit. A `Plan` unit creates the program when missing; every
    /// other unit requires it to exist.
    async fn save(
        &self,
        program_id: ProgramId,
        unit: ProgramUnit,
        now: DateTime<Utc>,
    ) -> Result<Program, ProgramStoreError>;
}

/// Shared by both backends: compute the program after committing `unit`.
pub(crate) fn commit_unit(
    existing: Option<Program>,
    program_id: ProgramId,
    unit: ProgramUnit,
    now: DateTime<Utc>,
) -> Result<Program, ProgramStoreError> {
    match (existing, unit) {
        (
            None,
            ProgramUnit::Plan {
                user_id,
                context,
                plan,
            },
        ) => Ok(Program::from_plan(program_id, user_id, context, plan, now)),
        (None, _) => Err(ProgramStoreError::NotFound(program_id)),
        (Some(mut program), unit) => {
            program.apply(unit, now)?;
            Ok(program)
        }
    }
}

/// In-memory program store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryProgramStore {
    programs: RwLock<HashMap<ProgramId, Program>>,
}

impl InMemoryProgramStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

fn poisoned<T>(_: T) -> ProgramStoreError {
    ProgramStoreError::Storage("program store lock poisoned".to_string())
}

#[async_trait]
impl ProgramStore for InMemoryProgramStore {
    async fn get(&self, program_id: ProgramId) -> Result<Option<Program>, ProgramStoreError> {
        let programs = self.programs.read().map_err(poisoned)?;
        Ok(programs.get(&program_id).cloned())
    }

    async fn save(
        &self,
        program_id: ProgramId,
        unit: ProgramUnit,
        now: DateTime<Utc>,
    ) -> Result<Program, ProgramStoreError> {
        let mut programs = self.programs.write().map_err(poisoned)?;
        let updated = commit_unit(programs.get(&program_id).cloned(), program_id, unit, now)?;
        programs.insert(program_id, updated.clone());
        Ok(updated)
    }
}

#[async_trait]
impl ProgramStore for Arc<InMemoryProgramStore> {
    async fn get(&self, program_id: ProgramId) -> Result<Option<Program>, ProgramStoreError> {
        (**self).get(program_id).await
    }

    async fn save(
        &self,
        program_id: ProgramId,
        unit: ProgramUnit,
        now: DateTime<Utc>,
    ) -> Result<Program, ProgramStoreError> {
        (**self).save(program_id, unit, now).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::planned_program;
    use studyforge_core::UserId;

    #[tokio::test]
    async fn plan_creates_then_units_extend() {
        let store = InMemoryProgramStore::new();
        let id = ProgramId::new();
        let (context, plan) = planned_program();

        let err = store
            .save(id, ProgramUnit::Module { module_index: 0 }, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err, ProgramStoreError::NotFound(id));

        store
            .save(
                id,
                ProgramUnit::Plan {
                    user_id: UserId::new(),
                    context,
                    plan,
                },
                Utc::now(),
            )
            .await
            .unwrap();
        let program = store
            .save(id, ProgramUnit::Module { module_index: 0 }, Utc::now())
            .await
            .unwrap();
        assert_eq!(program.modules.len(), 1);
        assert_eq!(store.get(id).await.unwrap(), Some(program));
    }
}
