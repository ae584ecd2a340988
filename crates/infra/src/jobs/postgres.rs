//! Postgres-backed job store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError | Scenario |
//! |------------|----------------------|---------------|----------|
//! | Database (unique violation) | `23505` | `Conflict` | A second active job for the mailbox (partial unique index) |
//! | Database (check violation) | `23514` | `Storage` | Row would break a schema invariant |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed / other | N/A | `Storage` | Connection failures, etc. |
//!
//! ## Concurrency
//!
//! Every mutation is a single `UPDATE ... WHERE` statement, except
//! `record_outcome`, which inserts the item marker and bumps the counters in
//! one transaction. Counter updates
//! are relative (`col = col + $n`), and status transitions carry
//! `status IN ('pending', 'running')` in their predicate, so the row lock
//! taken by the update is the only synchronisation needed.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use async_trait::async_trait;

use sweep_core::{JobId, MailboxId, MessageId, UserId};
use sweep_jobs::{
    BulkJob, CounterDelta, DiscoveryProgress, ItemOutcome, JobCounters, JobError, JobStatus,
    NewJob, QueryWindow,
};

use super::store::{JobStore, JobStoreError};

const SCHEMA: &str = include_str!("../../migrations/0001_bulk_jobs.sql");

const JOB_COLUMNS: &str = r#"
    id, mailbox_id, user_id, start_date, end_date, unread_only, force_reprocess,
    status, total_emails, emails_queued, processed_emails, failed_emails,
    page_token, pages_fetched, discovery_finished, last_error,
    created_at, updated_at, completed_at
"#;

/// Relative increments. Right-hand sides read the pre-update row; outcome
/// increments are capped to the headroom left under the new total.
const INCREMENT_COUNTERS: &str = r#"
    UPDATE bulk_jobs
    SET total_emails = total_emails + $2,
        emails_queued = LEAST(emails_queued + $3, total_emails + $2),
        processed_emails = processed_emails
            + LEAST($4, GREATEST(total_emails + $2 - processed_emails - failed_emails, 0)),
        failed_emails = failed_emails
            + LEAST($5, GREATEST(
                total_emails + $2 - processed_emails - failed_emails
                - LEAST($4, GREATEST(total_emails + $2 - processed_emails - failed_emails, 0)),
                0)),
        updated_at = now()
    WHERE id = $1
    RETURNING total_emails, emails_queued, processed_emails, failed_emails
"#;

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the table and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("migrate", e))?;
        }
        Ok(())
    }

    async fn fetch(&self, job_id: JobId) -> Result<Option<BulkJob>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM bulk_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Shared path for every status change. Terminal targets also stamp
    /// `completed_at`.
    async fn transition(
        &self,
        job_id: JobId,
        to: JobStatus,
        error: Option<&str>,
    ) -> Result<BulkJob, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE bulk_jobs
            SET status = $2,
                updated_at = now(),
                completed_at = CASE WHEN $3 THEN now() ELSE completed_at END,
                last_error = COALESCE($4, last_error)
            WHERE id = $1 AND status IN ('pending', 'running')
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(to.as_str())
        .bind(to.is_terminal())
        .bind(error)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition", e))?;

        if let Some(row) = row {
            return job_from_row(&row);
        }

        // Nothing updated: either missing or already terminal.
        match self.fetch(job_id).await? {
            None => Err(JobStoreError::NotFound(job_id)),
            Some(current) => Err(JobError::InvalidTransition {
                job_id,
                from: current.status,
                to,
            }
            .into()),
        }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, input), fields(mailbox_id = %input.mailbox_id), err)]
    async fn create_job(&self, input: NewJob) -> Result<BulkJob, JobStoreError> {
        let job = BulkJob::new(input);
        sqlx::query(
            r#"
            INSERT INTO bulk_jobs (
                id, mailbox_id, user_id, start_date, end_date, unread_only, force_reprocess,
                status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.mailbox_id.as_uuid())
        .bind(job.user_id.as_uuid())
        .bind(job.window.start_date)
        .bind(job.window.end_date)
        .bind(job.window.unread_only)
        .bind(job.force_reprocess)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            // The primary key is a fresh UUIDv7, so the only unique index
            // that can fire is the one-active-job-per-mailbox index.
            if is_unique_violation(&e) {
                JobStoreError::Conflict(job.mailbox_id)
            } else {
                map_sqlx_error("create_job", e)
            }
        })?;
        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<BulkJob>, JobStoreError> {
        self.fetch(job_id).await
    }

    #[instrument(skip(self), fields(mailbox_id = %mailbox_id), err)]
    async fn list_for_mailbox(
        &self,
        mailbox_id: MailboxId,
        limit: usize,
    ) -> Result<Vec<BulkJob>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM bulk_jobs
            WHERE mailbox_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#
        ))
        .bind(mailbox_id.as_uuid())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_for_mailbox", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn mark_running(&self, job_id: JobId) -> Result<BulkJob, JobStoreError> {
        self.transition(job_id, JobStatus::Running, None).await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn mark_completed(&self, job_id: JobId) -> Result<BulkJob, JobStoreError> {
        self.transition(job_id, JobStatus::Completed, None).await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn mark_failed(&self, job_id: JobId, error: &str) -> Result<BulkJob, JobStoreError> {
        self.transition(job_id, JobStatus::Failed, Some(error)).await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn mark_cancelled(&self, job_id: JobId) -> Result<BulkJob, JobStoreError> {
        self.transition(job_id, JobStatus::Cancelled, None).await
    }

    #[instrument(skip(self), fields(job_id = %job_id, delta = ?delta), err)]
    async fn increment_counters(
        &self,
        job_id: JobId,
        delta: CounterDelta,
    ) -> Result<JobCounters, JobStoreError> {
        let row = sqlx::query(INCREMENT_COUNTERS)
            .bind(job_id.as_uuid())
            .bind(to_i64(delta.total))
            .bind(to_i64(delta.queued))
            .bind(to_i64(delta.processed))
            .bind(to_i64(delta.failed))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("increment_counters", e))?
            .ok_or(JobStoreError::NotFound(job_id))?;
        counters_from_row(&row)
    }

    #[instrument(skip(self, message_ids), fields(job_id = %job_id, messages = message_ids.len()), err)]
    async fn record_discovered(
        &self,
        job_id: JobId,
        message_ids: &[MessageId],
    ) -> Result<u64, JobStoreError> {
        let ids: Vec<String> = message_ids.iter().map(|m| m.as_str().to_owned()).collect();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("record_discovered", e))?;

        let fresh = sqlx::query(
            r#"
            INSERT INTO bulk_job_discovered (job_id, message_id)
            SELECT j.id, m FROM bulk_jobs j, unnest($2::text[]) AS m
            WHERE j.id = $1
            ON CONFLICT (job_id, message_id) DO NOTHING
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(ids.as_slice())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("record_discovered", e))?
        .rows_affected();

        if fresh == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("record_discovered", e))?;
            return match self.fetch(job_id).await? {
                Some(_) => Ok(0),
                None => Err(JobStoreError::NotFound(job_id)),
            };
        }

        sqlx::query(INCREMENT_COUNTERS)
            .bind(job_id.as_uuid())
            .bind(to_i64(fresh))
            .bind(0_i64)
            .bind(0_i64)
            .bind(0_i64)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("record_discovered", e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("record_discovered", e))?;
        Ok(fresh)
    }

    #[instrument(skip(self, message_ids), fields(job_id = %job_id, messages = message_ids.len()), err)]
    async fn record_queued(
        &self,
        job_id: JobId,
        message_ids: &[MessageId],
    ) -> Result<u64, JobStoreError> {
        let ids: Vec<String> = message_ids.iter().map(|m| m.as_str().to_owned()).collect();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("record_queued", e))?;

        let fresh = sqlx::query(
            r#"
            UPDATE bulk_job_discovered SET queued = TRUE
            WHERE job_id = $1 AND message_id = ANY($2) AND NOT queued
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(ids.as_slice())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("record_queued", e))?
        .rows_affected();

        if fresh == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("record_queued", e))?;
            return match self.fetch(job_id).await? {
                Some(_) => Ok(0),
                None => Err(JobStoreError::NotFound(job_id)),
            };
        }

        sqlx::query(INCREMENT_COUNTERS)
            .bind(job_id.as_uuid())
            .bind(0_i64)
            .bind(to_i64(fresh))
            .bind(0_i64)
            .bind(0_i64)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("record_queued", e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("record_queued", e))?;
        Ok(fresh)
    }

    #[instrument(skip(self), fields(job_id = %job_id, message_id = %message_id, outcome = outcome.as_str()), err)]
    async fn record_outcome(
        &self,
        job_id: JobId,
        message_id: &MessageId,
        outcome: ItemOutcome,
    ) -> Result<Option<JobCounters>, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("record_outcome", e))?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO bulk_job_items (job_id, message_id, outcome)
            SELECT id, $2, $3 FROM bulk_jobs WHERE id = $1
            ON CONFLICT (job_id, message_id) DO NOTHING
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(message_id.as_str())
        .bind(outcome.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("record_outcome", e))?
        .rows_affected();

        if inserted == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("record_outcome", e))?;
            return match self.fetch(job_id).await? {
                Some(_) => Ok(None),
                None => Err(JobStoreError::NotFound(job_id)),
            };
        }

        let delta = outcome.delta();
        let row = sqlx::query(INCREMENT_COUNTERS)
            .bind(job_id.as_uuid())
            .bind(0_i64)
            .bind(0_i64)
            .bind(to_i64(delta.processed))
            .bind(to_i64(delta.failed))
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("record_outcome", e))?;
        let counters = counters_from_row(&row)?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("record_outcome", e))?;
        Ok(Some(counters))
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn record_error(&self, job_id: JobId, error: &str) -> Result<(), JobStoreError> {
        let result = sqlx::query("UPDATE bulk_jobs SET last_error = $2, updated_at = now() WHERE id = $1")
            .bind(job_id.as_uuid())
            .bind(error)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("record_error", e))?;
        expect_row("record_error", job_id, result.rows_affected())
    }

    async fn is_cancelled(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM bulk_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("is_cancelled", e))?;
        match status {
            Some(status) => Ok(status == JobStatus::Cancelled.as_str()),
            None => Err(JobStoreError::NotFound(job_id)),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id, mailbox_id = %mailbox_id), err)]
    async fn verify_ownership(
        &self,
        job_id: JobId,
        mailbox_id: MailboxId,
    ) -> Result<BulkJob, JobStoreError> {
        match self.fetch(job_id).await? {
            Some(job) if job.mailbox_id == mailbox_id => Ok(job),
            _ => Err(JobStoreError::NotFound(job_id)),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn save_checkpoint(
        &self,
        job_id: JobId,
        next_page_token: Option<String>,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE bulk_jobs
            SET page_token = $2, pages_fetched = pages_fetched + 1, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(next_page_token)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("save_checkpoint", e))?;
        expect_row("save_checkpoint", job_id, result.rows_affected())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn finish_discovery(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE bulk_jobs
            SET discovery_finished = TRUE, page_token = NULL, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("finish_discovery", e))?;
        expect_row("finish_discovery", job_id, result.rows_affected())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn complete_if_drained(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE bulk_jobs
            SET status = 'completed', completed_at = now(), updated_at = now()
            WHERE id = $1
              AND status = 'running'
              AND discovery_finished
              AND processed_emails + failed_emails >= total_emails
            "#,
        )
        .bind(job_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete_if_drained", e))?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.fetch(job_id).await? {
            Some(_) => Ok(false),
            None => Err(JobStoreError::NotFound(job_id)),
        }
    }
}

/// Map SQLx errors to `JobStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505"))
}

fn expect_row(operation: &str, job_id: JobId, rows: u64) -> Result<(), JobStoreError> {
    if rows == 0 {
        tracing::debug!(operation, job_id = %job_id, "no row updated");
        return Err(JobStoreError::NotFound(job_id));
    }
    Ok(())
}

fn decode_error(err: sqlx::Error) -> JobStoreError {
    JobStoreError::Storage(format!("failed to decode job row: {err}"))
}

fn to_i64(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn from_i64(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

// SQLx row mapping

fn counters_from_row(row: &sqlx::postgres::PgRow) -> Result<JobCounters, JobStoreError> {
    Ok(JobCounters {
        total_emails: from_i64(row.try_get("total_emails").map_err(decode_error)?),
        emails_queued: from_i64(row.try_get("emails_queued").map_err(decode_error)?),
        processed_emails: from_i64(row.try_get("processed_emails").map_err(decode_error)?),
        failed_emails: from_i64(row.try_get("failed_emails").map_err(decode_error)?),
    })
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<BulkJob, JobStoreError> {
    let status: String = row.try_get("status").map_err(decode_error)?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|e| JobStoreError::Storage(e.to_string()))?;
    let pages_fetched: i32 = row.try_get("pages_fetched").map_err(decode_error)?;

    Ok(BulkJob {
        id: JobId::from_uuid(row.try_get::<Uuid, _>("id").map_err(decode_error)?),
        mailbox_id: MailboxId::from_uuid(row.try_get::<Uuid, _>("mailbox_id").map_err(decode_error)?),
        user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id").map_err(decode_error)?),
        window: QueryWindow {
            start_date: row.try_get::<NaiveDate, _>("start_date").map_err(decode_error)?,
            end_date: row.try_get::<Option<NaiveDate>, _>("end_date").map_err(decode_error)?,
            unread_only: row.try_get("unread_only").map_err(decode_error)?,
        },
        force_reprocess: row.try_get("force_reprocess").map_err(decode_error)?,
        status,
        counters: counters_from_row(row)?,
        discovery: DiscoveryProgress {
            page_token: row.try_get("page_token").map_err(decode_error)?,
            pages_fetched: u32::try_from(pages_fetched).unwrap_or(0),
            finished: row.try_get("discovery_finished").map_err(decode_error)?,
        },
        last_error: row.try_get("last_error").map_err(decode_error)?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at").map_err(decode_error)?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at").map_err(decode_error)?,
        completed_at: row
            .try_get::<Option<DateTime<Utc>>, _>("completed_at")
            .map_err(decode_error)?,
    })
}
