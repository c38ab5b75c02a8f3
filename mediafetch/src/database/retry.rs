//! Busy-retry for SQLite writes.
//!
//! Claims, redemptions and failure counters all take the write lock. Under
//! several workers the busy timeout alone is not always enough, so these
//! operations are retried a bounded number of times.

use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;

use rand::random;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

/// Backoff for lock contention. Much tighter than the delivery retry policy.
#[derive(Debug, Clone, Copy)]
pub struct BusyRetry {
    pub max_retries: u32,
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
    /// Delay before retry number `attempt` (0-based), with up to 25% jitter.
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let cap = self.max_delay.as_millis() as u64;
        let backoff = base.saturating_mul(1u64 << attempt.min(32)).min(cap);
        let jitter = random::<u64>() % (backoff / 4 + 1);
        Duration::from_millis(backoff.saturating_add(jitter).min(cap))
    }
}

impl Error {
    /// SQLITE_BUSY or SQLITE_LOCKED, whether reported by code or by message.
    pub fn is_sqlite_busy(&self) -> bool {
        let Self::DatabaseSqlx(err) = self else {
            return false;
        };
        let message = match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(Cow::into_owned);
                if matches!(code.as_deref(), Some("5" | "6")) {
                    return true;
                }
                db_err.message().to_ascii_lowercase()
            }
            other => other.to_string().to_ascii_lowercase(),
        };
        message.contains("database is locked") || message.contains("database is busy")
    }
}

/// Run `op` with the default [`BusyRetry`] policy.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with(BusyRetry::default(), op_name, op).await
}

pub async fn retry_with<T, F, Fut>(policy: BusyRetry, op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if err.is_sqlite_busy() && attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                debug!(op = op_name, attempt = attempt + 1, ?delay, "SQLite busy, retrying");
                sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}
