//! Retrying writes that collide with another SQLite writer.

use rand::random;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

const MAX_RETRIES: u32 = 8;
const BASE_DELAY: Duration = Duration::from_millis(10);
const MAX_DELAY: Duration = Duration::from_millis(1500);

/// SQLITE_BUSY (5) or SQLITE_LOCKED (6), by code or by message.
fn is_busy(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    if let sqlx::Error::Database(db_err) = sqlx_err {
        if matches!(db_err.code().as_deref(), Some("5") | Some("6")) {
            return true;
        }
    }

    let msg = sqlx_err.to_string().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

/// Delay before retry number `attempt` (0-based): doubling from the base, capped,
/// plus up to 25% jitter.
fn busy_delay(attempt: u32) -> Duration {
    let exp = BASE_DELAY.saturating_mul(1u32 << attempt.min(16));
    let capped = exp.min(MAX_DELAY);
    let jitter_ms = random::<u64>() % (capped.as_millis() as u64 / 4 + 1);
    (capped + Duration::from_millis(jitter_ms)).min(MAX_DELAY)
}

/// Run `op`, retrying with backoff while SQLite reports the database as busy.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(err) if is_busy(&err) && attempt < MAX_RETRIES => {
                let delay = busy_delay(attempt);
                debug!(op = op_name, ?delay, attempt = attempt + 1, "SQLite busy, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
