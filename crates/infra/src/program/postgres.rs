//! Postgres-backed program store.
//!
//! A program is stored as one JSONB document. `save` locks the row, applies
//! the unit with the same rules as the in-memory store and writes the whole
//! document back, so readers only ever see committed units.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use studyforge_core::ProgramId;

use super::store::{ProgramStore, ProgramStoreError, commit_unit};
use super::tree::{Program, ProgramUnit};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS programs (
    id          UUID PRIMARY KEY,
    user_id     UUID NOT NULL,
    document    JSONB NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL
);
"#;

#[derive(Debug, Clone)]
pub struct PostgresProgramStore {
    pool: Arc<PgPool>,
}

impl PostgresProgramStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), ProgramStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl ProgramStore for PostgresProgramStore {
    #[instrument(skip(self), fields(program_id = %program_id), err)]
    async fn get(&self, program_id: ProgramId) -> Result<Option<Program>, ProgramStoreError> {
        let row = sqlx::query("SELECT document FROM programs WHERE id = $1")
            .bind(program_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_program", e))?;
        row.map(|row| decode(&row)).transpose()
    }

    #[instrument(skip(self, unit), fields(program_id = %program_id, unit = unit.name()), err)]
    async fn save(
        &self,
        program_id: ProgramId,
        unit: ProgramUnit,
        now: DateTime<Utc>,
    ) -> Result<Program, ProgramStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let existing = sqlx::query("SELECT document FROM programs WHERE id = $1 FOR UPDATE")
            .bind(program_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("lock_program", e))?
            .map(|row| decode(&row))
            .transpose()?;

        let program = commit_unit(existing, program_id, unit, now)?;
        let document = serde_json::to_value(&program).map_err(|e| {
            ProgramStoreError::Storage(format!("failed to encode program {program_id}: {e}"))
        })?;

        sqlx::query(
            r#"
            INSERT INTO programs (id, user_id, document, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                document = EXCLUDED.document,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(program_id.as_uuid())
        .bind(program.user_id.as_uuid())
        .bind(&document)
        .bind(program.created_at)
        .bind(program.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_program", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(program)
    }
}

fn decode(row: &sqlx::postgres::PgRow) -> Result<Program, ProgramStoreError> {
    let document: serde_json::Value = row
        .try_get("document")
        .map_err(|e| ProgramStoreError::Storage(format!("failed to read document: {e}")))?;
    serde_json::from_value(document)
        .map_err(|e| ProgramStoreError::Storage(format!("failed to decode program: {e}")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> ProgramStoreError {
    match err {
        sqlx::Error::Database(db_err) => ProgramStoreError::Storage(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        _ => ProgramStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
