use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream, TryStreamExt};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::filter::JobFilter;
use crate::database::models::{JobDbModel, JobExecutionLogDbModel, LogLevel};
use crate::database::repositories::{JobCursor, JobRepository};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::datetime_to_ms;
use crate::domain::{Job, JobErrorDetail, JobPatch, JobStatus, Progress};
use crate::utils::KeyedLocks;
use crate::{Error, Result};

/// Guarded writes that lost to a writer outside this process are retried
/// against the fresh row this many times.
const MAX_GUARD_ATTEMPTS: usize = 8;

/// Outcome of startup reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// `running` jobs put back to `queued` at their last persisted stage.
    pub requeued: Vec<String>,
    /// `stage_failed` jobs finalised as `failed`.
    pub failed: Vec<String>,
    /// `queued` jobs with a pending cancellation request, now `cancelled`.
    pub cancelled: Vec<String>,
}

/// Durable record of all jobs.
pub struct JobStore {
    repo: Arc<dyn JobRepository>,
    /// Per-id update locks. Different jobs never share a lock.
    locks: KeyedLocks,
    /// Signalled when a job becomes claimable.
    notify: Notify,
}

impl JobStore {
    pub fn new(repo: Arc<dyn JobRepository>) -> Self {
        Self {
            repo,
            locks: KeyedLocks::new(),
            notify: Notify::new(),
        }
    }

    /// Persist a new job and wake one waiting worker.
    pub async fn create(&self, job: &Job) -> Result<String> {
        let model = JobDbModel::from_domain(job)?;
        retry_on_sqlite_busy("create_job", || self.repo.create_job(&model)).await?;
        debug!(job_id = %job.id, pipeline = %job.pipeline, "Job created");
        self.notify.notify_one();
        Ok(job.id.clone())
    }

    pub async fn get(&self, id: &str) -> Result<Job> {
        let model = retry_on_sqlite_busy("get_job", || self.repo.get_job(id)).await?;
        model.into_domain()
    }

    /// Atomically apply `patch` to the job.
    ///
    /// A patch that would violate a job invariant is rejected with
    /// [`Error::StoreInconsistency`] and nothing is written.
    pub async fn update(&self, id: &str, patch: JobPatch) -> Result<Job> {
        self.update_inner(id, &|_| true, &patch)
            .await?
            .ok_or_else(|| Error::inconsistency(id, "update produced no write"))
    }

    /// Apply `patch` only while the job is in `expected` status.
    ///
    /// Returns `Ok(None)` when the job is in any other status.
    pub async fn update_if(
        &self,
        id: &str,
        expected: JobStatus,
        patch: JobPatch,
    ) -> Result<Option<Job>> {
        self.update_inner(id, &|job| job.status == expected, &patch)
            .await
    }

    /// Record progress for `stage_index` if the job is still running that stage.
    ///
    /// Late reports for a stage that already finished are dropped.
    pub async fn update_progress(
        &self,
        id: &str,
        stage_index: usize,
        progress: Progress,
    ) -> Result<bool> {
        let patch = JobPatch::new().progress(progress);
        let accept = |job: &Job| job.status == JobStatus::Running && job.stage_index == stage_index;
        Ok(self.update_inner(id, &accept, &patch).await?.is_some())
    }

    async fn update_inner(
        &self,
        id: &str,
        accept: &(dyn Fn(&Job) -> bool + Sync),
        patch: &JobPatch,
    ) -> Result<Option<Job>> {
        let _guard = self.locks.lock(id).await;
        for attempt in 0..MAX_GUARD_ATTEMPTS {
            let current = self.get(id).await?;
            if !accept(&current) {
                return Ok(None);
            }

            let next = patch
                .apply_to(&current)
                .map_err(|reason| Error::inconsistency(id, reason))?;
            let model = JobDbModel::from_domain(&next)?;
            let status = current.status.as_str();
            let stage_index = current.stage_index as i64;

            let written = retry_on_sqlite_busy("update_job_guarded", || {
                self.repo.update_job_guarded(&model, status, stage_index)
            })
            .await?;

            if written {
                return Ok(Some(next));
            }
            debug!(
                job_id = %id,
                attempt = attempt + 1,
                "Job changed underneath a guarded write, re-reading"
            );
        }

        Err(Error::Database(format!(
            "job {} kept changing during update; gave up after {} attempts",
            id, MAX_GUARD_ATTEMPTS
        )))
    }

    /// Claim the next queued job for execution (`queued -> running`).
    pub async fn claim_next(&self) -> Result<Option<Job>> {
        let claimed = retry_on_sqlite_busy("claim_next_queued", || self.repo.claim_next_queued())
            .await?;
        claimed.map(JobDbModel::into_domain).transpose()
    }

    /// Wait until a job may have become claimable.
    pub async fn wait_for_job(&self) {
        self.notify.notified().await;
    }

    /// Lazily stream jobs matching `filter`, oldest first.
    ///
    /// Rows are fetched one page at a time as the stream is polled.
    pub fn list(&self, filter: JobFilter) -> impl Stream<Item = Result<Job>> + Send + '_ {
        let statuses = filter.status_strings();
        let pipeline = filter.pipeline.map(|p| p.to_string());
        let page_size = filter.page_size.max(1) as i64;

        // `None` once the last page has been emitted.
        let initial: Option<Option<JobCursor>> = Some(None);
        stream::try_unfold(initial, move |state| {
            let statuses = statuses.clone();
            let pipeline = pipeline.clone();
            async move {
                let Some(after) = state else {
                    return Ok(None);
                };
                let page = self
                    .repo
                    .list_jobs_page(&statuses, pipeline.as_deref(), after.as_ref(), page_size)
                    .await?;
                if page.is_empty() {
                    return Ok(None);
                }

                let next_state = if (page.len() as i64) < page_size {
                    None
                } else {
                    page.last().map(|m| Some((m.created_at, m.id.clone())))
                };
                let jobs: Vec<Result<Job>> =
                    page.into_iter().map(JobDbModel::into_domain).collect();
                Ok::<_, Error>(Some((stream::iter(jobs), next_state)))
            }
        })
        .try_flatten()
    }

    /// Collect all jobs matching `filter`.
    pub async fn list_all(&self, filter: JobFilter) -> Result<Vec<Job>> {
        self.list(filter).try_collect().await
    }

    /// Persist a cancellation request for a non-terminal job.
    ///
    /// Returns `false` if the job is already terminal.
    pub async fn request_cancel(&self, id: &str) -> Result<bool> {
        retry_on_sqlite_busy("request_cancel", || self.repo.request_cancel(id)).await
    }

    /// Force a non-terminal job to `failed`, bypassing patch validation.
    ///
    /// Used when a job's own record is inconsistent and cannot be advanced
    /// through a normal update.
    pub async fn force_fail(&self, id: &str, detail: &JobErrorDetail) -> Result<bool> {
        let _guard = self.locks.lock(id).await;
        let error = serde_json::to_string(detail)?;
        let forced =
            retry_on_sqlite_busy("force_fail", || self.repo.force_fail(id, &error)).await?;
        if forced {
            warn!(job_id = %id, cause = %detail.cause(), "Job forced to failed");
        }
        Ok(forced)
    }

    /// Re-queue orphaned work left by a previous process lifetime.
    ///
    /// `active` holds the ids this process is currently executing; those are
    /// never touched. Orphaned `running` jobs keep their stage index and
    /// current artifact, so execution resumes at the last persisted stage.
    pub async fn reconcile(&self, active: &HashSet<String>) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();

        let running = self.repo.list_jobs_by_status(JobStatus::Running.as_str()).await?;
        for model in running {
            if active.contains(&model.id) {
                continue;
            }
            let id = model.id.clone();
            let requeued = {
                let _guard = self.locks.lock(&id).await;
                retry_on_sqlite_busy("requeue_job", || self.repo.requeue_job(&id)).await?
            };
            if requeued {
                info!(
                    job_id = %id,
                    stage_index = model.stage_index,
                    "Re-queued orphaned running job"
                );
                summary.requeued.push(id);
            }
        }

        let stage_failed = self
            .repo
            .list_jobs_by_status(JobStatus::StageFailed.as_str())
            .await?;
        for model in stage_failed {
            if active.contains(&model.id) {
                continue;
            }
            let patch = JobPatch::new().status(JobStatus::Failed);
            if self
                .update_if(&model.id, JobStatus::StageFailed, patch)
                .await?
                .is_some()
            {
                summary.failed.push(model.id);
            }
        }

        let queued = self.repo.list_jobs_by_status(JobStatus::Queued.as_str()).await?;
        for model in queued.into_iter().filter(|m| m.cancel_requested) {
            let patch = JobPatch::new().status(JobStatus::Cancelled);
            if self
                .update_if(&model.id, JobStatus::Queued, patch)
                .await?
                .is_some()
            {
                summary.cancelled.push(model.id);
            }
        }

        if !summary.requeued.is_empty() {
            self.notify.notify_waiters();
        }
        Ok(summary)
    }

    /// Terminal jobs in `statuses` whose artifacts have not been purged and
    /// that finished before `cutoff`.
    pub async fn terminal_unpurged_before(
        &self,
        statuses: &[JobStatus],
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let models = self
            .repo
            .list_terminal_unpurged_before(&statuses, datetime_to_ms(cutoff), limit as i64)
            .await?;
        models.into_iter().map(JobDbModel::into_domain).collect()
    }

    /// Number of jobs per status.
    pub async fn counts(&self) -> Result<Vec<(JobStatus, i64)>> {
        let rows = self.repo.count_by_status().await?;
        Ok(rows
            .into_iter()
            .filter_map(|(status, count)| JobStatus::parse(&status).map(|s| (s, count)))
            .collect())
    }

    /// Append an execution log entry. Failures are logged, never propagated.
    pub async fn log(&self, job_id: &str, level: LogLevel, message: impl Into<String>) {
        let entry = JobExecutionLogDbModel::new(job_id, level, message);
        if let Err(e) =
            retry_on_sqlite_busy("add_execution_log", || self.repo.add_execution_log(&entry)).await
        {
            warn!(job_id = %job_id, "Failed to persist execution log: {}", e);
        }
    }

    pub async fn logs(&self, job_id: &str) -> Result<Vec<JobExecutionLogDbModel>> {
        self.repo.get_execution_logs(job_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxJobRepository;
    use crate::database::{init_pool_with_size, run_migrations, sqlite_url_for};
    use crate::domain::{JobErrorKind, PipelineKind, Priority};
    use futures::StreamExt;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<JobStore>) {
        let dir = TempDir::new().unwrap();
        let pool = init_pool_with_size(&sqlite_url_for(&dir.path().join("store.db")), 4)
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        let repo = Arc::new(SqlxJobRepository::new(pool));
        (dir, Arc::new(JobStore::new(repo)))
    }

    fn job(stage_count: usize) -> Job {
        Job::new(PipelineKind::FaceSwap, stage_count, vec![])
    }

    #[tokio::test]
    async fn test_create_get_and_not_found() {
        let (_dir, store) = setup().await;
        let id = store.create(&job(2)).await.unwrap();
        let stored = store.get(&id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        assert_eq!(stored.stage_count, 2);

        assert!(store.get("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_update_is_visible_to_next_read() {
        let (_dir, store) = setup().await;
        let id = store.create(&job(3)).await.unwrap();
        store.claim_next().await.unwrap().unwrap();

        store
            .update(&id, JobPatch::new().progress(Progress::new(42, None)))
            .await
            .unwrap();
        assert_eq!(store.get(&id).await.unwrap().progress.percent, 42);
    }

    #[tokio::test]
    async fn test_regression_is_store_inconsistency() {
        let (_dir, store) = setup().await;
        let id = store.create(&job(3)).await.unwrap();
        store.claim_next().await.unwrap().unwrap();
        store
            .update(&id, JobPatch::new().stage_index(2))
            .await
            .unwrap();

        let err = store
            .update(&id, JobPatch::new().stage_index(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoreInconsistency { .. }));
        assert_eq!(store.get(&id).await.unwrap().stage_index, 2);

        let detail = JobErrorDetail::new(JobErrorKind::StoreInconsistency, err.to_string());
        assert!(store.force_fail(&id, &detail).await.unwrap());
        let failed = store.get(&id).await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.unwrap().kind, JobErrorKind::StoreInconsistency);
    }

    #[tokio::test]
    async fn test_concurrent_progress_updates_serialise() {
        let (_dir, store) = setup().await;
        let id = store.create(&job(1)).await.unwrap();
        store.claim_next().await.unwrap().unwrap();

        let mut handles = Vec::new();
        for pct in 0..20u8 {
            let store = store.clone();
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(&id, JobPatch::new().progress(Progress::new(pct, None)))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(store.get(&id).await.unwrap().status, JobStatus::Running);
        assert!(store.locks.is_empty());
    }

    #[tokio::test]
    async fn test_update_if_skips_other_status() {
        let (_dir, store) = setup().await;
        let id = store.create(&job(1)).await.unwrap();
        store.claim_next().await.unwrap().unwrap();
        let skipped = store
            .update_if(&id, JobStatus::Queued, JobPatch::new().status(JobStatus::Cancelled))
            .await
            .unwrap();
        assert!(skipped.is_none());
        assert_eq!(store.get(&id).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_list_is_paged_and_filtered() {
        let (_dir, store) = setup().await;
        for _ in 0..7 {
            store.create(&job(1)).await.unwrap();
        }
        let high = job(1).with_priority(Priority::High);
        store.create(&high).await.unwrap();
        // Highest priority is claimed first.
        assert_eq!(store.claim_next().await.unwrap().unwrap().id, high.id);

        let queued: Vec<Job> = store
            .list(JobFilter::new().with_status(JobStatus::Queued).with_page_size(3))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(queued.len(), 7);
        assert!(queued.windows(2).all(|w| w[0].created_at <= w[1].created_at));

        let running = store
            .list_all(JobFilter::new().with_status(JobStatus::Running))
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
    }

    #[tokio::test]
    async fn test_reconcile_requeues_orphans_at_last_stage() {
        let (_dir, store) = setup().await;
        let orphan = store.create(&job(3)).await.unwrap();
        let active = store.create(&job(3)).await.unwrap();
        store.claim_next().await.unwrap().unwrap();
        store.claim_next().await.unwrap().unwrap();
        store
            .update(&orphan, JobPatch::new().stage_index(2))
            .await
            .unwrap();

        let mut live = HashSet::new();
        live.insert(active.clone());
        let summary = store.reconcile(&live).await.unwrap();
        assert_eq!(summary.requeued, vec![orphan.clone()]);

        let requeued = store.get(&orphan).await.unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert_eq!(requeued.stage_index, 2);
        assert_eq!(store.get(&active).await.unwrap().status, JobStatus::Running);
    }

    #[tokio::test]
    async fn test_execution_log_roundtrip() {
        let (_dir, store) = setup().await;
        let id = store.create(&job(1)).await.unwrap();
        store.log(&id, LogLevel::Warn, "retrying stage").await;
        let logs = store.logs(&id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].level, "warn");
    }
}
