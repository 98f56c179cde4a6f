//! Pacing for bulk admissions that find the queue saturated.

use super::bulk::BulkRetry;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pause {
    /// The delay elapsed; try the admission again.
    Retry,
    /// Every allowed attempt was saturated.
    Exhausted,
    Cancelled,
}

/// Tracks saturated admission attempts for one entity. Delays double from
/// the initial delay up to the cap.
pub(crate) struct SaturationBackoff<'a> {
    delay: Duration,
    max_delay: Duration,
    attempts: usize,
    max_attempts: usize,
    shutdown: &'a CancellationToken,
}

impl<'a> SaturationBackoff<'a> {
    pub(crate) fn new(retry: BulkRetry, shutdown: &'a CancellationToken) -> Self {
        Self {
            delay: retry.initial_delay,
            max_delay: retry.max_delay,
            attempts: 0,
            max_attempts: retry.max_attempts.max(1),
            shutdown,
        }
    }

    /// Saturated attempts recorded so far.
    pub(crate) fn attempts(&self) -> usize {
        self.attempts
    }

    /// Delay the next [`pause`](Self::pause) will wait.
    pub(crate) fn delay(&self) -> Duration {
        self.delay
    }

    /// Records a saturated attempt, then waits out the current delay unless
    /// the attempt budget is spent or shutdown begins.
    pub(crate) async fn pause(&mut self) -> Pause {
        self.attempts += 1;
        if self.attempts >= self.max_attempts {
            return Pause::Exhausted;
        }

        let delay = self.delay;
        self.delay = grow(delay, self.max_delay);
        if delay.is_zero() {
            yield_now().await;
            return if self.shutdown.is_cancelled() {
                Pause::Cancelled
            } else {
                Pause::Retry
            };
        }

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Pause::Cancelled,
            _ = sleep(delay) => Pause::Retry,
        }
    }
}

fn grow(current: Duration, max_delay: Duration) -> Duration {
    if current.is_zero() {
        return max_delay.min(Duration::from_millis(1));
    }
    current.saturating_mul(2).min(max_delay)
}
