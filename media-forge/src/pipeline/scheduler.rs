//! Scheduler: claims queued jobs while execution slots are free and runs them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::progress::{progress_channel, spawn_progress_aggregator};
use super::registry::PipelineRegistry;
use super::runner::{JobRunner, SchedulerShared};
use crate::Result;
use crate::artifact::ArtifactManager;
use crate::device::{DeviceArbiter, LeaseWatchdog};
use crate::domain::{JobPatch, JobStatus};
use crate::store::{JobStore, ReconcileSummary};

/// Configuration for the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of CPU stages executed concurrently. Device stages do not
    /// take a worker; the device is its own slot.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Claimed jobs allowed to wait for the device on top of `max_workers`.
    #[serde(default = "default_max_device_waiters")]
    pub max_device_waiters: usize,
    /// Fallback poll interval when no submission wakes a worker, in milliseconds.
    /// Also the period of the cross-process cancellation check.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Deadline for stages that do not declare one. 0 disables it.
    #[serde(default)]
    pub default_stage_timeout_secs: u64,
    /// In-place retries of a stage that ran out of resources. 0 fails the job
    /// on the first occurrence.
    #[serde(default)]
    pub resource_exhaustion_retries: u32,
    /// Base backoff between resource exhaustion retries, multiplied by the attempt.
    #[serde(default = "default_resource_retry_backoff_ms")]
    pub resource_retry_backoff_ms: u64,
    #[serde(default = "default_watchdog_interval_secs")]
    pub watchdog_interval_secs: u64,
    /// Time past a stage deadline after which the watchdog reclaims the device.
    #[serde(default = "default_watchdog_grace_secs")]
    pub watchdog_grace_secs: u64,
}

fn default_max_workers() -> usize {
    2
}

fn default_max_device_waiters() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_resource_retry_backoff_ms() -> u64 {
    10_000
}

fn default_watchdog_interval_secs() -> u64 {
    5
}

fn default_watchdog_grace_secs() -> u64 {
    30
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_device_waiters: default_max_device_waiters(),
            poll_interval_ms: default_poll_interval_ms(),
            default_stage_timeout_secs: 0,
            resource_exhaustion_retries: 0,
            resource_retry_backoff_ms: default_resource_retry_backoff_ms(),
            watchdog_interval_secs: default_watchdog_interval_secs(),
            watchdog_grace_secs: default_watchdog_grace_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_workers(mut self, workers: usize) -> Self {
        self.max_workers = workers;
        self
    }

    pub fn with_max_device_waiters(mut self, waiters: usize) -> Self {
        self.max_device_waiters = waiters;
        self
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_default_stage_timeout_secs(mut self, secs: u64) -> Self {
        self.default_stage_timeout_secs = secs;
        self
    }

    pub fn with_resource_exhaustion_retries(mut self, retries: u32) -> Self {
        self.resource_exhaustion_retries = retries;
        self
    }

    pub fn with_resource_retry_backoff_ms(mut self, ms: u64) -> Self {
        self.resource_retry_backoff_ms = ms;
        self
    }

    pub fn with_watchdog_grace_secs(mut self, secs: u64) -> Self {
        self.watchdog_grace_secs = secs;
        self
    }

    /// Upper bound on jobs claimed by this process at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_workers.max(1) + self.max_device_waiters
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn default_stage_timeout(&self) -> Option<Duration> {
        (self.default_stage_timeout_secs > 0)
            .then(|| Duration::from_secs(self.default_stage_timeout_secs))
    }

    pub fn resource_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.resource_retry_backoff_ms)
    }
}

/// Pulls queued jobs from the store and drives them through their pipelines.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<JobStore>,
        registry: Arc<PipelineRegistry>,
        arbiter: DeviceArbiter,
        artifacts: Arc<ArtifactManager>,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_workers.max(1)));
        Self {
            shared: Arc::new(SchedulerShared {
                slots,
                config,
                store,
                registry,
                arbiter,
                artifacts,
                active: DashMap::new(),
                shutdown: CancellationToken::new(),
            }),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Re-queue orphaned work and clean up after jobs cancelled while queued.
    ///
    /// Jobs this process is executing are left alone.
    pub async fn reconcile(&self) -> Result<ReconcileSummary> {
        let active: HashSet<String> = self
            .shared
            .active
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let summary = self.shared.store.reconcile(&active).await?;

        for job_id in &summary.cancelled {
            if let Err(e) = self.shared.artifacts.purge(job_id).await {
                warn!(job_id = %job_id, "Failed to purge artifacts of cancelled job: {}", e);
                continue;
            }
            self.shared
                .store
                .update_if(job_id, JobStatus::Cancelled, JobPatch::new().artifacts_purged(true))
                .await?;
        }

        if !summary.requeued.is_empty() || !summary.failed.is_empty() || !summary.cancelled.is_empty()
        {
            info!(
                requeued = summary.requeued.len(),
                failed = summary.failed.len(),
                cancelled = summary.cancelled.len(),
                "Reconciled job store"
            );
        }
        Ok(summary)
    }

    /// Reconcile the store, then start workers and background tasks.
    pub async fn start(&self) -> Result<()> {
        self.reconcile().await?;

        let config = &self.shared.config;
        let (progress_tx, progress_rx) = progress_channel();
        let mut guard = self.tasks.lock();
        let Some(tasks) = guard.as_mut() else {
            warn!("Scheduler already stopped");
            return Ok(());
        };

        info!(workers = config.max_workers, "Starting scheduler");

        let aggregator = spawn_progress_aggregator(self.shared.store.clone(), progress_rx);
        tasks.spawn(async move {
            if let Err(e) = aggregator.await {
                error!("Progress aggregator failed: {}", e);
            }
        });

        let watchdog = LeaseWatchdog::new(self.shared.arbiter.clone())
            .with_interval(Duration::from_secs(config.watchdog_interval_secs.max(1)))
            .with_grace(Duration::from_secs(config.watchdog_grace_secs));
        tasks.spawn(watchdog.run(self.shared.shutdown.clone()));

        tasks.spawn(watch_cancel_requests(self.shared.clone()));

        let runner = JobRunner::new(self.shared.clone(), progress_tx);
        tasks.spawn(dispatch_loop(self.shared.clone(), runner));
        Ok(())
    }

    /// Signal cancellation to a job executing in this process.
    ///
    /// Returns `false` if the job is not running here. The caller is
    /// expected to have persisted the request already.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.shared.active.get(job_id) {
            Some(token) => {
                token.cancel();
                debug!(job_id = %job_id, "Cancellation signalled");
                true
            }
            None => false,
        }
    }

    /// Ids of jobs currently executing in this process.
    pub fn active_jobs(&self) -> Vec<String> {
        self.shared
            .active
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Stop the workers. In-flight jobs stay `running` and resume on the
    /// next start.
    pub async fn stop(&self) {
        info!("Stopping scheduler");
        self.shared.shutdown.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("Scheduler stopped");
    }
}

/// Claims queued jobs while an execution slot is free and runs each one on
/// its own task.
async fn dispatch_loop(shared: Arc<SchedulerShared>, runner: JobRunner) {
    let poll_interval = shared.config.poll_interval();
    let admission = Arc::new(Semaphore::new(shared.config.max_in_flight()));
    let mut jobs = JoinSet::new();
    debug!(
        workers = shared.config.max_workers,
        max_in_flight = shared.config.max_in_flight(),
        "Dispatcher started"
    );

    loop {
        while jobs.try_join_next().is_some() {}

        let permits = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            permits = acquire_permits(&admission, &shared.slots) => permits,
        };
        let Some((admitted, slot)) = permits else {
            break;
        };

        match shared.store.claim_next().await {
            Ok(Some(job)) => {
                let runner = runner.clone();
                jobs.spawn(async move {
                    runner.run(job, slot).await;
                    drop(admitted);
                });
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                error!("Error claiming job: {}", e);
            }
        }
        drop((admitted, slot));

        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = shared.store.wait_for_job() => {}
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    while jobs.join_next().await.is_some() {}
    debug!("Dispatcher shutting down");
}

async fn acquire_permits(
    admission: &Arc<Semaphore>,
    slots: &Arc<Semaphore>,
) -> Option<(OwnedSemaphorePermit, OwnedSemaphorePermit)> {
    let admitted = admission.clone().acquire_owned().await.ok()?;
    let slot = slots.clone().acquire_owned().await.ok()?;
    Some((admitted, slot))
}

/// Picks up cancellation requests persisted by other processes.
async fn watch_cancel_requests(shared: Arc<SchedulerShared>) {
    let mut interval = tokio::time::interval(shared.config.poll_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let pending: Vec<(String, CancellationToken)> = shared
            .active
            .iter()
            .filter(|entry| !entry.value().is_cancelled())
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (job_id, token) in pending {
            match shared.store.get(&job_id).await {
                Ok(job) if job.cancel_requested => {
                    info!(job_id = %job_id, "Observed persisted cancellation request");
                    token.cancel();
                }
                Ok(_) => {}
                Err(e) => debug!(job_id = %job_id, "Cancellation check failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_config_default() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.max_in_flight(), 6);
        assert_eq!(config.resource_exhaustion_retries, 0);
        assert_eq!(config.default_stage_timeout(), None);
    }

    #[test]
    fn test_scheduler_config_builder() {
        let config = SchedulerConfig::new()
            .with_max_workers(4)
            .with_max_device_waiters(0)
            .with_poll_interval_ms(0)
            .with_default_stage_timeout_secs(60)
            .with_resource_exhaustion_retries(2);
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.max_in_flight(), 4);
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
        assert_eq!(config.default_stage_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.resource_exhaustion_retries, 2);
    }

    #[test]
    fn test_scheduler_config_deserialize_defaults() {
        let config: SchedulerConfig = serde_json::from_str(r#"{"max_workers": 3}"#).unwrap();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.watchdog_grace_secs, 30);
    }
}
