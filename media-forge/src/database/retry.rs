//! Retrying store operations that lose a race for the SQLite write lock.
//!
//! The CLI and a running `serve` share one database file, so short
//! `SQLITE_BUSY` windows are expected and are absorbed here instead of
//! surfacing as job failures.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::{Error, Result};

/// Primary result codes that mean "try again later".
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

/// Backoff schedule for busy retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyRetry {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BusyRetry {
    fn default() -> Self {
        Self {
            max_retries: 12,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BusyRetry {
    /// Delay before retry number `attempt` (0-based): doubling from
    /// `base_delay`, up to 25% jitter, never above `max_delay`.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let doubled = self
            .base_delay
            .saturating_mul(1u32 << attempt.min(16) as u32)
            .min(self.max_delay);
        let jitter_cap = doubled.as_millis() as u64 / 4;
        let jitter = Duration::from_millis(rand::random::<u64>() % (jitter_cap + 1));
        (doubled + jitter).min(self.max_delay)
    }

    /// Run `op`, retrying while it fails with a busy or locked database.
    pub async fn run<T, F, Fut>(&self, op_name: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0usize;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempt >= self.max_retries || !is_busy(&err) {
                return Err(err);
            }

            let delay = self.delay_for(attempt);
            attempt += 1;
            debug!(
                op = op_name,
                attempt,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                "Database busy, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// [`BusyRetry::run`] with the default schedule.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    BusyRetry::default().run(op_name, op).await
}

/// Whether `err` is SQLite refusing the lock, including extended codes such
/// as `SQLITE_BUSY_SNAPSHOT` (517).
fn is_busy(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };
    if let sqlx::Error::Database(db_err) = sqlx_err
        && let Some(code) = db_err.code().and_then(|c| c.parse::<i64>().ok())
    {
        return matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED);
    }
    mentions_lock(&sqlx_err.to_string())
}

fn mentions_lock(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("database is locked") || message.contains("database is busy")
}
