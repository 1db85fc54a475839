use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::broker::BrokerClient;
use crate::clock::sleep_unless_cancelled;
use crate::errors::CommitError;
use crate::metrics_consts::{
    RUNNER_COMMIT_ATTEMPTS, RUNNER_COMMIT_RETRIES_EXHAUSTED, RUNNER_UNITS_COMMITTED,
};
use crate::types::Partition;

const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(100);
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(2);

/// How a unit commit ended after retries.
#[derive(Debug)]
pub(crate) enum CommitStatus {
    Committed,
    /// Retry budget exhausted; escalate to the fatal path.
    Exhausted(CommitError),
    /// Shutdown observed while backing off between attempts.
    Shutdown,
}

/// Wraps the broker commit with bounded retry. Runs on the driver, like every
/// other broker call.
///
/// Timeouts are retried while `attempt < commit_attempts`; any other commit
/// error is granted a single attempt beyond that budget before escalating.
/// Backoff between attempts starts at 100ms, doubles, and caps at 2s.
#[derive(Debug, Default)]
pub struct CommitEngine {
    total_attempts: AtomicU64,
    committed_units: AtomicU64,
}

impl CommitEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit attempts issued over the life of the engine, successful or not.
    pub fn total_attempts(&self) -> u64 {
        self.total_attempts.load(Ordering::Relaxed)
    }

    /// Units whose offsets were successfully committed.
    pub fn committed_units(&self) -> u64 {
        self.committed_units.load(Ordering::Relaxed)
    }

    pub(crate) async fn commit_unit<K, V, B>(
        &self,
        broker: &mut B,
        offsets: &HashMap<Partition, i64>,
        commit_attempts: u32,
        shutdown: &CancellationToken,
    ) -> CommitStatus
    where
        B: BrokerClient<K, V> + ?Sized,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.total_attempts.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(RUNNER_COMMIT_ATTEMPTS).increment(1);

            match broker.commit_sync(offsets).await {
                Ok(()) => {
                    self.committed_units.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(RUNNER_UNITS_COMMITTED).increment(1);
                    return CommitStatus::Committed;
                }
                Err(CommitError::Timeout(cause)) if attempt < commit_attempts => {
                    warn!(attempt, cause = %cause, "offset commit timed out, retrying");
                }
                Err(CommitError::Other(cause)) if attempt < commit_attempts.saturating_add(1) => {
                    warn!(attempt, cause = %cause, "offset commit failed, retrying");
                }
                Err(cause) => {
                    error!(attempt, error = %cause, "offset commit retries exhausted");
                    metrics::counter!(RUNNER_COMMIT_RETRIES_EXHAUSTED).increment(1);
                    return CommitStatus::Exhausted(cause);
                }
            }

            let backoff = RETRY_BACKOFF_BASE
                .saturating_mul(1u32 << (attempt - 1).min(5))
                .min(RETRY_BACKOFF_CAP);
            if !sleep_unless_cancelled(backoff, shutdown).await {
                return CommitStatus::Shutdown;
            }
        }
    }
}
