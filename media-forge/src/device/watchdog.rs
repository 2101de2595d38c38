//! Abandoned lease watchdog.
//!
//! Stages that overrun their deadline may be stuck in a model call that
//! cannot be interrupted. The watchdog periodically checks the current
//! holder and reclaims the device once the deadline plus a grace period
//! has passed, so other jobs are not starved.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::arbiter::DeviceArbiter;

/// Default check interval.
pub const LEASE_WATCHDOG_INTERVAL: Duration = Duration::from_secs(5);

/// Default grace period after a missed deadline.
pub const LEASE_WATCHDOG_GRACE: Duration = Duration::from_secs(30);

pub struct LeaseWatchdog {
    arbiter: DeviceArbiter,
    interval: Duration,
    grace: Duration,
}

impl LeaseWatchdog {
    pub fn new(arbiter: DeviceArbiter) -> Self {
        Self {
            arbiter,
            interval: LEASE_WATCHDOG_INTERVAL,
            grace: LEASE_WATCHDOG_GRACE,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Runs the watchdog until cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Lease watchdog shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Some(info) = self.arbiter.reclaim_expired(self.grace) {
                        warn!(
                            job_id = %info.job_id,
                            lease_id = info.lease_id,
                            held_since = %info.acquired_at,
                            "Lease watchdog reclaimed the device"
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Priority;

    #[tokio::test]
    async fn test_watchdog_stops_on_cancellation() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let watchdog = LeaseWatchdog::new(DeviceArbiter::new());
        let result = tokio::time::timeout(Duration::from_millis(100), watchdog.run(shutdown)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_watchdog_reclaims_overrun_lease() {
        let arbiter = DeviceArbiter::new();
        let lease = arbiter.acquire("stuck", Priority::Normal).await.unwrap();
        lease.set_deadline(Some(Duration::from_millis(10)));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            LeaseWatchdog::new(arbiter.clone())
                .with_interval(Duration::from_millis(10))
                .with_grace(Duration::from_millis(10))
                .run(shutdown.clone()),
        );

        tokio::time::timeout(Duration::from_secs(2), lease.revoked().cancelled())
            .await
            .unwrap();
        assert!(arbiter.holder().is_none());

        // The next job gets the device even though the stuck holder never released.
        let next = arbiter.acquire("next", Priority::Normal).await.unwrap();
        assert_eq!(arbiter.holder().unwrap().job_id, "next");
        drop(next);
        drop(lease);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
