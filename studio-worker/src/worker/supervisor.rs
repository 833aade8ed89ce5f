//! Restarts the poll loop after loop-level faults.

use std::time::Duration;
use tracing::{error, warn};

use super::scheduler::PollLoop;
use crate::{Error, Result};

/// Exponential backoff: `base`, doubling per attempt, capped at `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Delay before retry `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

/// Run `poll_loop` until shutdown, restarting it with backoff after each
/// fault. Gives up with [`Error::PollLoopExhausted`] once the configured
/// number of consecutive faults is reached.
pub(crate) async fn supervise(poll_loop: &PollLoop) -> Result<()> {
    let backoff = BackoffPolicy::new(poll_loop.config.poll_interval, poll_loop.config.backoff_cap);
    let max_faults = poll_loop.config.max_consecutive_errors;

    loop {
        let fault = match poll_loop.run().await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let attempt = poll_loop.run.record_fault();
        if attempt >= max_faults {
            error!(
                attempts = attempt,
                error = %fault,
                "Poll loop failed too many times in a row, giving up"
            );
            return Err(Error::PollLoopExhausted {
                attempts: attempt,
                last_error: fault.to_string(),
            });
        }

        let delay = backoff.delay_for(attempt);
        warn!(
            attempt,
            max = max_faults,
            delay_ms = delay.as_millis() as u64,
            error = %fault,
            "Poll loop fault, restarting after backoff"
        );

        tokio::select! {
            _ = poll_loop.shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
