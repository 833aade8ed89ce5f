//! Retry helper for SQLite writes that hit `SQLITE_BUSY` / `SQLITE_LOCKED`.
//!
//! Several worker processes may share one database file. Claims and bulk reaps
//! are single statements, so a busy error means "try again shortly", not
//! "the queue is down".

use rand::random;
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const BUSY_MAX_RETRIES: u32 = 12;
const BUSY_BASE_DELAY_MS: u64 = 10;
const BUSY_MAX_DELAY_MS: u64 = 2000;

fn is_sqlite_busy_error(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    let sqlx::Error::Database(db_err) = sqlx_err else {
        let msg = sqlx_err.to_string().to_ascii_lowercase();
        return msg.contains("database is locked") || msg.contains("database is busy");
    };

    // 5 = SQLITE_BUSY, 6 = SQLITE_LOCKED
    let code = db_err.code().map(Cow::into_owned);
    if matches!(code.as_deref(), Some("5") | Some("6")) {
        return true;
    }

    let msg = db_err.message().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

/// Delay before retry number `attempt` (0-based), without jitter.
fn busy_delay(attempt: u32) -> Duration {
    let exp_ms = BUSY_BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(20));
    Duration::from_millis(exp_ms.min(BUSY_MAX_DELAY_MS))
}

/// Run `op`, retrying with jittered exponential backoff while SQLite reports busy.
///
/// Any other error, or exhausting the retry budget, is returned unchanged.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if is_sqlite_busy_error(&err) && attempt < BUSY_MAX_RETRIES => {
                let base = busy_delay(attempt);
                let jitter_ms = random::<u64>() % (base.as_millis() as u64 / 4 + 1);
                let delay = (base + Duration::from_millis(jitter_ms))
                    .min(Duration::from_millis(BUSY_MAX_DELAY_MS));

                debug!(
                    op = op_name,
                    attempt = attempt + 1,
                    max = BUSY_MAX_RETRIES,
                    "SQLite busy, retrying in {:?}",
                    delay
                );

                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
