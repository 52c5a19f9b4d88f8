//! Postgres-backed job store.
//!
//! Job rows live in `build_jobs`, their logs in `build_events`. Every write
//! runs in a transaction that locks the job row (`SELECT ... FOR UPDATE`),
//! checks guards and transitions with the same helpers as the in-memory
//! store, then writes the row back. The `(job_id, idx)` unique constraint
//! backs the index check.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | any | `Storage` |
//! | PoolClosed / other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use studyforge_core::{EventId, ExpectedIndex, JobId, ProgramId, UserId};
use studyforge_events::{BuildEvent, BuildPhase, EventDraft, EventLevel, EventStatus};

use super::store::{
    BuildJobStore, ClaimOutcome, JobStoreError, claim_patch, heartbeat_patch, validate_patch,
};
use super::types::{BuildJob, JobFilter, JobPage, JobPatch, JobStatus, Pagination};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS build_jobs (
    id                UUID PRIMARY KEY,
    user_id           UUID NOT NULL,
    program_id        UUID,
    status            TEXT NOT NULL,
    phase             TEXT NOT NULL,
    current_item      TEXT,
    total_modules     INTEGER NOT NULL DEFAULT 0,
    completed_modules INTEGER NOT NULL DEFAULT 0,
    total_lessons     INTEGER NOT NULL DEFAULT 0,
    completed_lessons INTEGER NOT NULL DEFAULT 0,
    retry_count       INTEGER NOT NULL DEFAULT 0,
    max_retries       INTEGER NOT NULL,
    started_at        TIMESTAMPTZ,
    finished_at       TIMESTAMPTZ,
    last_heartbeat_at TIMESTAMPTZ,
    created_at        TIMESTAMPTZ NOT NULL,
    updated_at        TIMESTAMPTZ NOT NULL,
    error             TEXT,
    last_event_index  BIGINT NOT NULL DEFAULT 0,
    params            JSONB NOT NULL,
    claimed_by        TEXT,
    lease_expires_at  TIMESTAMPTZ
);
CREATE INDEX IF NOT EXISTS build_jobs_user_status_idx ON build_jobs (user_id, status);
CREATE TABLE IF NOT EXISTS build_events (
    id          UUID PRIMARY KEY,
    job_id      UUID NOT NULL REFERENCES build_jobs (id),
    idx         BIGINT NOT NULL CHECK (idx > 0),
    event_type  TEXT NOT NULL,
    step        TEXT NOT NULL,
    status      TEXT NOT NULL,
    level       TEXT NOT NULL,
    message     TEXT,
    payload     JSONB NOT NULL,
    created_at  TIMESTAMPTZ NOT NULL,
    UNIQUE (job_id, idx)
);
"#;

const JOB_COLUMNS: &str = "id, user_id, program_id, status, phase, current_item, \
    total_modules, completed_modules, total_lessons, completed_lessons, retry_count, \
    max_retries, started_at, finished_at, last_heartbeat_at, created_at, updated_at, \
    error, last_event_index, params, claimed_by, lease_expires_at";

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresBuildJobStore {
    pool: Arc<PgPool>,
}

impl PostgresBuildJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create tables and indexes when missing.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }
}

#[async_trait]
impl BuildJobStore for PostgresBuildJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, user_id = %job.user_id), err)]
    async fn insert(&self, job: BuildJob) -> Result<(), JobStoreError> {
        let params = serde_json::to_value(&job.params)
            .map_err(|e| JobStoreError::Storage(format!("failed to encode params: {e}")))?;
        sqlx::query(&format!(
            "INSERT INTO build_jobs ({JOB_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
              $18, $19, $20, $21, $22)"
        ))
        .bind(job.id.as_uuid())
        .bind(job.user_id.as_uuid())
        .bind(job.program_id.map(|p| *p.as_uuid()))
        .bind(job.status.as_str())
        .bind(job.phase.as_str())
        .bind(&job.current_item)
        .bind(job.total_modules as i32)
        .bind(job.completed_modules as i32)
        .bind(job.total_lessons as i32)
        .bind(job.completed_lessons as i32)
        .bind(job.retry_count as i32)
        .bind(job.max_retries as i32)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.last_heartbeat_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(&job.error)
        .bind(job.last_event_index as i64)
        .bind(params)
        .bind(&job.claimed_by)
        .bind(job.lease_expires_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<BuildJob>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM build_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn find_active_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Option<BuildJob>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM build_jobs \
             WHERE user_id = $1 AND status IN ('QUEUED', 'RUNNING') \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        ))
        .bind(user_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_active_for_user", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self, patch), fields(job_id = %job_id), err)]
    async fn update(
        &self,
        job_id: JobId,
        patch: JobPatch,
        now: DateTime<Utc>,
    ) -> Result<BuildJob, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, job_id).await?;
        validate_patch(&job, &patch)?;
        patch.apply(&mut job, now);
        write_job(&mut tx, &job).await?;
        commit(tx).await?;
        Ok(job)
    }

    #[instrument(
        skip(self, draft, patch),
        fields(job_id = %job_id, event_type = %draft.event_type, expected = ?expected),
        err
    )]
    async fn append_event(
        &self,
        job_id: JobId,
        draft: EventDraft,
        expected: ExpectedIndex,
        patch: JobPatch,
        now: DateTime<Utc>,
    ) -> Result<(BuildEvent, BuildJob), JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, job_id).await?;

        expected
            .check(job.last_event_index)
            .map_err(|e| JobStoreError::Conflict(e.to_string()))?;
        validate_patch(&job, &patch)?;

        let index = job.last_event_index + 1;
        let event = draft.into_event(job_id, index, now);
        sqlx::query(
            r#"
            INSERT INTO build_events (
                id, job_id, idx, event_type, step, status, level, message, payload, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event.id.as_uuid())
        .bind(job_id.as_uuid())
        .bind(index as i64)
        .bind(&event.event_type)
        .bind(&event.step)
        .bind(event.status.as_str())
        .bind(event.level.as_str())
        .bind(&event.message)
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::Conflict(format!("event index {index} already exists"))
            } else {
                map_sqlx_error("insert_event", e)
            }
        })?;

        job.last_event_index = index;
        patch.apply(&mut job, now);
        write_job(&mut tx, &job).await?;
        commit(tx).await?;
        Ok((event, job))
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn events_since(
        &self,
        job_id: JobId,
        after_index: u64,
    ) -> Result<Vec<BuildEvent>, JobStoreError> {
        let exists = sqlx::query("SELECT 1 FROM build_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("events_since", e))?;
        if exists.is_none() {
            return Err(JobStoreError::NotFound(job_id));
        }

        let rows = sqlx::query(
            r#"
            SELECT id, job_id, idx, event_type, step, status, level, message, payload, created_at
            FROM build_events
            WHERE job_id = $1 AND idx > $2
            ORDER BY idx ASC
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(i64::try_from(after_index).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("events_since", e))?;

        rows.iter().map(event_from_row).collect()
    }

    #[instrument(skip(self), fields(job_id = %job_id, runner_id = %runner_id), err)]
    async fn try_claim(
        &self,
        job_id: JobId,
        runner_id: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, job_id).await?;
        match claim_patch(&job, runner_id, lease_until, now) {
            Ok(patch) => {
                patch.apply(&mut job, now);
                write_job(&mut tx, &job).await?;
                commit(tx).await?;
                Ok(ClaimOutcome::Claimed(job))
            }
            Err(outcome) => Ok(outcome),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id, runner_id = %runner_id), err)]
    async fn heartbeat(
        &self,
        job_id: JobId,
        runner_id: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<BuildJob, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = lock_job(&mut tx, job_id).await?;
        heartbeat_patch(&job, runner_id, lease_until, now)?.apply(&mut job, now);
        write_job(&mut tx, &job).await?;
        commit(tx).await?;
        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn list(&self, filter: &JobFilter, page: Pagination) -> Result<JobPage, JobStoreError> {
        const WHERE: &str = "($1::uuid IS NULL OR user_id = $1) \
            AND ($2::uuid IS NULL OR program_id = $2) \
            AND ($3::text IS NULL OR status = $3)";
        let user_id = filter.user_id.map(|u| *u.as_uuid());
        let program_id = filter.program_id.map(|p| *p.as_uuid());
        let status = filter.status.map(|s| s.as_str());

        let count_sql = format!("SELECT COUNT(*) AS total FROM build_jobs WHERE {WHERE}");
        let total: i64 = sqlx::query(&count_sql)
            .bind(user_id)
            .bind(program_id)
            .bind(status)
            .fetch_one(&*self.pool)
            .await
            .and_then(|row| row.try_get("total"))
            .map_err(|e| map_sqlx_error("count_jobs", e))?;

        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM build_jobs WHERE {WHERE} \
             ORDER BY created_at DESC, id DESC LIMIT $4 OFFSET $5"
        ))
        .bind(user_id)
        .bind(program_id)
        .bind(status)
        .bind(i64::from(page.limit))
        .bind(i64::from(page.offset))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_jobs", e))?;

        let jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        Ok(JobPage::new(jobs, total.max(0) as u64, page))
    }
}

async fn lock_job(
    tx: &mut Transaction<'_, Postgres>,
    job_id: JobId,
) -> Result<BuildJob, JobStoreError> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM build_jobs WHERE id = $1 FOR UPDATE"
    ))
    .bind(job_id.as_uuid())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_job", e))?;
    match row {
        Some(row) => job_from_row(&row),
        None => Err(JobStoreError::NotFound(job_id)),
    }
}

async fn write_job(
    tx: &mut Transaction<'_, Postgres>,
    job: &BuildJob,
) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        UPDATE build_jobs SET
            program_id = $2,
            status = $3,
            phase = $4,
            current_item = $5,
            total_modules = $6,
            completed_modules = $7,
            total_lessons = $8,
            completed_lessons = $9,
            retry_count = $10,
            started_at = $11,
            finished_at = $12,
            last_heartbeat_at = $13,
            updated_at = $14,
            error = $15,
            last_event_index = $16,
            claimed_by = $17,
            lease_expires_at = $18
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.program_id.map(|p| *p.as_uuid()))
    .bind(job.status.as_str())
    .bind(job.phase.as_str())
    .bind(&job.current_item)
    .bind(job.total_modules as i32)
    .bind(job.completed_modules as i32)
    .bind(job.total_lessons as i32)
    .bind(job.completed_lessons as i32)
    .bind(job.retry_count as i32)
    .bind(job.started_at)
    .bind(job.finished_at)
    .bind(job.last_heartbeat_at)
    .bind(job.updated_at)
    .bind(&job.error)
    .bind(job.last_event_index as i64)
    .bind(&job.claimed_by)
    .bind(job.lease_expires_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("write_job", e))?;
    Ok(())
}

async fn commit(tx: Transaction<'_, Postgres>) -> Result<(), JobStoreError> {
    tx.commit()
        .await
        .map_err(|e| map_sqlx_error("commit_transaction", e))
}

fn decode_err(what: &str, err: impl std::fmt::Display) -> JobStoreError {
    JobStoreError::Storage(format!("failed to decode {what}: {err}"))
}

fn job_from_row(row: &PgRow) -> Result<BuildJob, JobStoreError> {
    let get_u32 = |col: &str| -> Result<u32, JobStoreError> {
        let v: i32 = row.try_get(col).map_err(|e| decode_err(col, e))?;
        Ok(v.max(0) as u32)
    };
    let status: String = row.try_get("status").map_err(|e| decode_err("status", e))?;
    let phase: String = row.try_get("phase").map_err(|e| decode_err("phase", e))?;
    let params: serde_json::Value = row.try_get("params").map_err(|e| decode_err("params", e))?;
    let last_event_index: i64 = row
        .try_get("last_event_index")
        .map_err(|e| decode_err("last_event_index", e))?;

    Ok(BuildJob {
        id: JobId::from_uuid(row.try_get("id").map_err(|e| decode_err("id", e))?),
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(|e| decode_err("user_id", e))?),
        program_id: row
            .try_get::<Option<uuid::Uuid>, _>("program_id")
            .map_err(|e| decode_err("program_id", e))?
            .map(ProgramId::from_uuid),
        status: JobStatus::parse(&status).ok_or_else(|| decode_err("status", &status))?,
        phase: BuildPhase::parse(&phase).ok_or_else(|| decode_err("phase", &phase))?,
        current_item: row
            .try_get("current_item")
            .map_err(|e| decode_err("current_item", e))?,
        total_modules: get_u32("total_modules")?,
        completed_modules: get_u32("completed_modules")?,
        total_lessons: get_u32("total_lessons")?,
        completed_lessons: get_u32("completed_lessons")?,
        retry_count: get_u32("retry_count")?,
        max_retries: get_u32("max_retries")?,
        started_at: row.try_get("started_at").map_err(|e| decode_err("started_at", e))?,
        finished_at: row.try_get("finished_at").map_err(|e| decode_err("finished_at", e))?,
        last_heartbeat_at: row
            .try_get("last_heartbeat_at")
            .map_err(|e| decode_err("last_heartbeat_at", e))?,
        created_at: row.try_get("created_at").map_err(|e| decode_err("created_at", e))?,
        updated_at: row.try_get("updated_at").map_err(|e| decode_err("updated_at", e))?,
        error: row.try_get("error").map_err(|e| decode_err("error", e))?,
        last_event_index: last_event_index.max(0) as u64,
        params: serde_json::from_value(params).map_err(|e| decode_err("params", e))?,
        claimed_by: row.try_get("claimed_by").map_err(|e| decode_err("claimed_by", e))?,
        lease_expires_at: row
            .try_get("lease_expires_at")
            .map_err(|e| decode_err("lease_expires_at", e))?,
    })
}

fn event_from_row(row: &PgRow) -> Result<BuildEvent, JobStoreError> {
    let status: String = row.try_get("status").map_err(|e| decode_err("status", e))?;
    let level: String = row.try_get("level").map_err(|e| decode_err("level", e))?;
    let index: i64 = row.try_get("idx").map_err(|e| decode_err("idx", e))?;

    Ok(BuildEvent {
        id: EventId::from_uuid(row.try_get("id").map_err(|e| decode_err("id", e))?),
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(|e| decode_err("job_id", e))?),
        index: index.max(0) as u64,
        event_type: row.try_get("event_type").map_err(|e| decode_err("event_type", e))?,
        step: row.try_get("step").map_err(|e| decode_err("step", e))?,
        status: EventStatus::parse(&status).ok_or_else(|| decode_err("status", &status))?,
        level: EventLevel::parse(&level).ok_or_else(|| decode_err("level", &level))?,
        message: row.try_get("message").map_err(|e| decode_err("message", e))?,
        payload: row.try_get("payload").map_err(|e| decode_err("payload", e))?,
        created_at: row.try_get("created_at").map_err(|e| decode_err("created_at", e))?,
    })
}

/// Map SQLx errors to JobStoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => JobStoreError::Conflict(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
