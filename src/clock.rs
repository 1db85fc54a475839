use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Monotonic time source, swappable in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Tokio-backed clock; honors `tokio::time::pause` in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Sleep that aborts early on shutdown. Returns false when cancelled.
pub async fn sleep_unless_cancelled(duration: Duration, shutdown: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !shutdown.is_cancelled();
    }
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_when_not_cancelled() {
        let token = CancellationToken::new();
        assert!(sleep_unless_cancelled(Duration::from_secs(5), &token).await);
    }

    #[tokio::test]
    async fn sleep_aborts_on_cancellation() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(!sleep_unless_cancelled(Duration::from_secs(60), &token).await);
    }

    #[tokio::test]
    async fn zero_sleep_reports_cancellation_state() {
        let token = CancellationToken::new();
        assert!(sleep_unless_cancelled(Duration::ZERO, &token).await);
        token.cancel();
        assert!(!sleep_unless_cancelled(Duration::ZERO, &token).await);
    }
}
