//! Stage progress reporting.
//!
//! Stages report progress through a [`ProgressReporter`], which only sends
//! messages. A single aggregator task coalesces them per job and writes the
//! latest value through [`JobStore::update_progress`], so no component ever
//! shares mutable job state in memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::domain::Progress;
use crate::store::JobStore;

const PROGRESS_CHANNEL_CAPACITY: usize = 1024;
const PROGRESS_FLUSH_INTERVAL_MS: u64 = 250;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub job_id: String,
    pub stage_index: usize,
    pub progress: Progress,
}

#[derive(Clone)]
pub struct ProgressReporter {
    job_id: String,
    stage_index: usize,
    tx: mpsc::Sender<ProgressUpdate>,
}

impl ProgressReporter {
    pub fn new(
        job_id: impl Into<String>,
        stage_index: usize,
        tx: mpsc::Sender<ProgressUpdate>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            stage_index,
            tx,
        }
    }

    pub fn noop(job_id: impl Into<String>) -> Self {
        let (tx, _rx) = mpsc::channel::<ProgressUpdate>(1);
        Self::new(job_id, 0, tx)
    }

    /// Report progress. Never blocks; updates are dropped if the channel is full.
    pub fn report(&self, percent: u8, note: Option<String>) {
        let _ = self.tx.try_send(ProgressUpdate {
            job_id: self.job_id.clone(),
            stage_index: self.stage_index,
            progress: Progress::new(percent, note),
        });
    }
}

pub fn progress_channel() -> (mpsc::Sender<ProgressUpdate>, mpsc::Receiver<ProgressUpdate>) {
    mpsc::channel(PROGRESS_CHANNEL_CAPACITY)
}

/// Spawn the aggregator. It exits once every sender is dropped, after a
/// final flush.
pub fn spawn_progress_aggregator(
    store: Arc<JobStore>,
    mut rx: mpsc::Receiver<ProgressUpdate>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut pending: HashMap<String, ProgressUpdate> = HashMap::new();
        let mut tick = tokio::time::interval(Duration::from_millis(PROGRESS_FLUSH_INTERVAL_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    flush(&store, &mut pending).await;
                }
                update = rx.recv() => {
                    let Some(update) = update else {
                        flush(&store, &mut pending).await;
                        break;
                    };
                    pending.insert(update.job_id.clone(), update);
                }
            }
        }
    })
}

async fn flush(store: &JobStore, pending: &mut HashMap<String, ProgressUpdate>) {
    for (job_id, update) in pending.drain() {
        match store
            .update_progress(&job_id, update.stage_index, update.progress)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %job_id, stage_index = update.stage_index, "Dropped stale progress update");
            }
            Err(e) => {
                debug!(job_id = %job_id, "Failed to persist progress: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_report_is_non_blocking_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let reporter = ProgressReporter::new("job", 0, tx);
        reporter.report(10, None);
        reporter.report(20, None);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.progress.percent, 10);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_report_clamps_percent() {
        let (tx, mut rx) = mpsc::channel(1);
        ProgressReporter::new("job", 2, tx).report(150, Some("x".into()));
        let update = rx.try_recv().unwrap();
        assert_eq!(update.progress.percent, 100);
        assert_eq!(update.stage_index, 2);
    }
}
