//! Job repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{JobDbModel, JobExecutionLogDbModel};
use crate::database::time::now_ms;
use crate::{Error, Result};

/// Keyset cursor for paging: `(created_at, id)` of the last row seen.
pub type JobCursor = (i64, String);

/// Job repository trait.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn get_job(&self, id: &str) -> Result<JobDbModel>;
    async fn create_job(&self, job: &JobDbModel) -> Result<()>;
    /// Write `job` only if the stored row still has `expected_status` and
    /// `expected_stage_index`. Returns `false` when the guard did not match.
    async fn update_job_guarded(
        &self,
        job: &JobDbModel,
        expected_status: &str,
        expected_stage_index: i64,
    ) -> Result<bool>;
    /// Atomically move the highest-priority, oldest queued job to `running`.
    async fn claim_next_queued(&self) -> Result<Option<JobDbModel>>;
    /// One page of jobs ordered by `(created_at, id)`.
    async fn list_jobs_page(
        &self,
        statuses: &[String],
        pipeline: Option<&str>,
        after: Option<&JobCursor>,
        limit: i64,
    ) -> Result<Vec<JobDbModel>>;
    async fn list_jobs_by_status(&self, status: &str) -> Result<Vec<JobDbModel>>;
    async fn request_cancel(&self, id: &str) -> Result<bool>;
    /// Recovery path: `running -> queued` outside the normal transition table.
    async fn requeue_job(&self, id: &str) -> Result<bool>;
    /// Mark a non-terminal job `failed` with the given error JSON.
    async fn force_fail(&self, id: &str, error: &str) -> Result<bool>;
    async fn list_terminal_unpurged_before(
        &self,
        statuses: &[String],
        cutoff_ms: i64,
        limit: i64,
    ) -> Result<Vec<JobDbModel>>;
    async fn count_by_status(&self) -> Result<Vec<(String, i64)>>;
    async fn delete_job(&self, id: &str) -> Result<()>;

    // Execution logs
    async fn add_execution_log(&self, log: &JobExecutionLogDbModel) -> Result<()>;
    async fn get_execution_logs(&self, job_id: &str) -> Result<Vec<JobExecutionLogDbModel>>;
}

/// SQLx implementation of JobRepository.
pub struct SqlxJobRepository {
    pool: SqlitePool,
}

impl SqlxJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn statuses_json(statuses: &[String]) -> Result<Option<String>> {
    if statuses.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(statuses)?))
    }
}

#[async_trait]
impl JobRepository for SqlxJobRepository {
    async fn get_job(&self, id: &str) -> Result<JobDbModel> {
        sqlx::query_as::<_, JobDbModel>("SELECT * FROM job WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn create_job(&self, job: &JobDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job (
                id, pipeline, status, priority, stage_index, stage_count,
                inputs, params, progress, progress_note, current_artifact,
                output, error, cancel_requested, retry_of, artifacts_purged,
                created_at, updated_at, started_at, completed_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.pipeline)
        .bind(&job.status)
        .bind(job.priority)
        .bind(job.stage_index)
        .bind(job.stage_count)
        .bind(&job.inputs)
        .bind(&job.params)
        .bind(job.progress)
        .bind(&job.progress_note)
        .bind(&job.current_artifact)
        .bind(&job.output)
        .bind(&job.error)
        .bind(job.cancel_requested)
        .bind(&job.retry_of)
        .bind(job.artifacts_purged)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_job_guarded(
        &self,
        job: &JobDbModel,
        expected_status: &str,
        expected_stage_index: i64,
    ) -> Result<bool> {
        // cancel_requested is owned by request_cancel and never written here.
        let result = sqlx::query(
            r#"
            UPDATE job SET
                status = ?,
                stage_index = ?,
                progress = ?,
                progress_note = ?,
                current_artifact = ?,
                output = ?,
                error = ?,
                artifacts_purged = ?,
                updated_at = ?,
                started_at = ?,
                completed_at = ?
            WHERE id = ? AND status = ? AND stage_index = ?
            "#,
        )
        .bind(&job.status)
        .bind(job.stage_index)
        .bind(job.progress)
        .bind(&job.progress_note)
        .bind(&job.current_artifact)
        .bind(&job.output)
        .bind(&job.error)
        .bind(job.artifacts_purged)
        .bind(job.updated_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(&job.id)
        .bind(expected_status)
        .bind(expected_stage_index)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_next_queued(&self) -> Result<Option<JobDbModel>> {
        let now = now_ms();
        let job = sqlx::query_as::<_, JobDbModel>(
            r#"
            UPDATE job SET
                status = 'running',
                updated_at = ?,
                started_at = COALESCE(started_at, ?)
            WHERE id = (
                SELECT id FROM job
                WHERE status = 'queued' AND cancel_requested = 0
                ORDER BY priority DESC, created_at, id
                LIMIT 1
            )
            AND status = 'queued'
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    async fn list_jobs_page(
        &self,
        statuses: &[String],
        pipeline: Option<&str>,
        after: Option<&JobCursor>,
        limit: i64,
    ) -> Result<Vec<JobDbModel>> {
        let statuses = statuses_json(statuses)?;
        let (after_created, after_id) = match after {
            Some((created, id)) => (Some(*created), Some(id.as_str())),
            None => (None, None),
        };

        let jobs = sqlx::query_as::<_, JobDbModel>(
            r#"
            SELECT * FROM job
            WHERE (? IS NULL OR status IN (SELECT value FROM json_each(?)))
              AND (? IS NULL OR pipeline = ?)
              AND (? IS NULL OR created_at > ? OR (created_at = ? AND id > ?))
            ORDER BY created_at, id
            LIMIT ?
            "#,
        )
        .bind(&statuses)
        .bind(&statuses)
        .bind(pipeline)
        .bind(pipeline)
        .bind(after_created)
        .bind(after_created)
        .bind(after_created)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn list_jobs_by_status(&self, status: &str) -> Result<Vec<JobDbModel>> {
        let jobs = sqlx::query_as::<_, JobDbModel>(
            "SELECT * FROM job WHERE status = ? ORDER BY created_at, id",
        )
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn request_cancel(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job SET cancel_requested = 1, updated_at = ?
            WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn requeue_job(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE job SET
                status = 'queued',
                progress = 0,
                progress_note = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'running'
            "#,
        )
        .bind(now_ms())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn force_fail(&self, id: &str, error: &str) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(
            r#"
            UPDATE job SET
                status = 'failed',
                error = ?,
                updated_at = ?,
                completed_at = ?
            WHERE id = ? AND status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn list_terminal_unpurged_before(
        &self,
        statuses: &[String],
        cutoff_ms: i64,
        limit: i64,
    ) -> Result<Vec<JobDbModel>> {
        let statuses = serde_json::to_string(statuses)?;
        let jobs = sqlx::query_as::<_, JobDbModel>(
            r#"
            SELECT * FROM job
            WHERE status IN (SELECT value FROM json_each(?))
              AND artifacts_purged = 0
              AND completed_at IS NOT NULL
              AND completed_at < ?
            ORDER BY completed_at
            LIMIT ?
            "#,
        )
        .bind(&statuses)
        .bind(cutoff_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(jobs)
    }

    async fn count_by_status(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM job GROUP BY status ORDER BY status")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    async fn delete_job(&self, id: &str) -> Result<()> {
        // Execution logs are deleted via CASCADE
        sqlx::query("DELETE FROM job WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn add_execution_log(&self, log: &JobExecutionLogDbModel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_execution_log (id, job_id, level, message, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&log.id)
        .bind(&log.job_id)
        .bind(&log.level)
        .bind(&log.message)
        .bind(log.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_execution_logs(&self, job_id: &str) -> Result<Vec<JobExecutionLogDbModel>> {
        let logs = sqlx::query_as::<_, JobExecutionLogDbModel>(
            "SELECT * FROM job_execution_log WHERE job_id = ? ORDER BY created_at, id",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }
}
