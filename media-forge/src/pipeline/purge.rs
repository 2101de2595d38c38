//! Artifact retention sweeper.
//!
//! Runs in the background and removes the intermediates of terminal jobs
//! once they are older than the retention period. Promoted outputs are never
//! touched; only an explicit purge removes those.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::artifact::ArtifactManager;
use crate::domain::{JobPatch, JobStatus};
use crate::store::JobStore;

/// Configuration for artifact purging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPurgeConfig {
    /// Hours to keep intermediates of completed/failed jobs.
    /// Set to 0 to keep them until purged explicitly.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u32,

    /// Jobs handled per sweep batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Interval between sweeps in seconds.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_retention_hours() -> u32 {
    72
}

fn default_batch_size() -> u32 {
    100
}

fn default_check_interval_secs() -> u64 {
    3600
}

impl Default for ArtifactPurgeConfig {
    fn default() -> Self {
        Self {
            retention_hours: default_retention_hours(),
            batch_size: default_batch_size(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

impl ArtifactPurgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention_hours(mut self, hours: u32) -> Self {
        self.retention_hours = hours;
        self
    }

    pub fn with_batch_size(mut self, size: u32) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_check_interval_secs(mut self, secs: u64) -> Self {
        self.check_interval_secs = secs;
        self
    }
}

pub struct ArtifactPurgeService {
    config: ArtifactPurgeConfig,
    store: Arc<JobStore>,
    artifacts: Arc<ArtifactManager>,
}

impl ArtifactPurgeService {
    pub fn new(
        config: ArtifactPurgeConfig,
        store: Arc<JobStore>,
        artifacts: Arc<ArtifactManager>,
    ) -> Self {
        Self {
            config,
            store,
            artifacts,
        }
    }

    /// Run one sweep. Returns the number of jobs whose artifacts were purged.
    ///
    /// Cancelled jobs are swept regardless of age.
    pub async fn run_purge(&self) -> Result<u64> {
        let now = Utc::now();
        let batch = self.config.batch_size.max(1) as usize;
        let mut total = self
            .sweep(&[JobStatus::Cancelled], now + chrono::Duration::seconds(1), batch)
            .await?;

        if self.config.retention_hours == 0 {
            debug!("Artifact retention sweep disabled (retention_hours = 0)");
        } else {
            let cutoff = now - chrono::Duration::hours(i64::from(self.config.retention_hours));
            total += self
                .sweep(&[JobStatus::Completed, JobStatus::Failed], cutoff, batch)
                .await?;
        }

        if total > 0 {
            info!(
                "Purged artifacts of {} jobs (retention: {} hours)",
                total, self.config.retention_hours
            );
        } else {
            debug!("No artifacts to purge");
        }
        Ok(total)
    }

    async fn sweep(
        &self,
        statuses: &[JobStatus],
        cutoff: chrono::DateTime<Utc>,
        batch: usize,
    ) -> Result<u64> {
        let mut purged = 0u64;
        loop {
            let jobs = self
                .store
                .terminal_unpurged_before(statuses, cutoff, batch)
                .await?;
            let fetched = jobs.len();
            let mut batch_purged = 0u64;

            for job in jobs {
                if let Err(e) = self.artifacts.purge(&job.id).await {
                    warn!(job_id = %job.id, "Failed to purge artifacts: {}", e);
                    continue;
                }
                let patch = JobPatch::new().artifacts_purged(true);
                if self.store.update_if(&job.id, job.status, patch).await?.is_some() {
                    batch_purged += 1;
                }
            }
            purged += batch_purged;

            // Failed purges stay unpurged; stop rather than refetch them forever.
            if fetched < batch || batch_purged == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(purged)
    }

    /// Start the background sweep task.
    pub fn start_background_task(self: Arc<Self>, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut check_interval = interval(Duration::from_secs(self.config.check_interval_secs.max(1)));

            info!(
                "Artifact purge service started (retention: {} hours, interval: {}s)",
                self.config.retention_hours, self.config.check_interval_secs
            );

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        info!("Artifact purge service shutting down");
                        break;
                    }
                    _ = check_interval.tick() => {
                        if let Err(e) = self.run_purge().await {
                            error!("Artifact purge cycle failed: {}", e);
                        }
                    }
                }
            }
        })
    }

    pub fn config(&self) -> &ArtifactPurgeConfig {
        &self.config
    }
}
