use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Snapshot of the pause descriptor.
#[derive(Debug, Clone)]
pub struct PauseState {
    pub paused: bool,
    pub since: Instant,
    pub attempt: u32,
    pub next_attempt_after: Duration,
    pub reason: String,
}

/// Holds the pause descriptor with exponential backoff.
///
/// Mutated only by the driver; anyone else reads snapshots. The attempt
/// counter grows with each pause and is only reset by an intervening
/// successful unit, so back-to-back pauses keep climbing the backoff ladder
/// even when resumes happen in between.
pub struct PauseController {
    base: Duration,
    max: Duration,
    state: Mutex<PauseState>,
}

impl PauseController {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            state: Mutex::new(PauseState {
                paused: false,
                since: Instant::now(),
                attempt: 0,
                next_attempt_after: base,
                reason: String::new(),
            }),
        }
    }

    /// Enter the paused state. An explicit hint wins over the computed
    /// backoff but is still clamped into `[base, max]`.
    pub fn request_pause(&self, now: Instant, reason: &str, hint: Option<Duration>) -> PauseState {
        let mut state = self.state.lock().expect("pause state poisoned");
        state.attempt = state.attempt.saturating_add(1);

        let computed = self.backoff_for(state.attempt);
        let next = hint.unwrap_or(computed).max(self.base).min(self.max);

        state.paused = true;
        state.since = now;
        state.next_attempt_after = next;
        state.reason = reason.to_owned();

        debug!(
            attempt = state.attempt,
            backoff = ?next,
            reason,
            "pause requested"
        );
        state.clone()
    }

    /// Leave the paused state once the backoff has elapsed. The attempt
    /// counter is left alone here; see [`PauseController::record_success`].
    pub fn try_resume(&self, now: Instant) -> bool {
        let mut state = self.state.lock().expect("pause state poisoned");
        if !state.paused {
            return false;
        }
        if now < state.since + state.next_attempt_after {
            return false;
        }
        state.paused = false;
        state.reason.clear();
        true
    }

    /// A successfully committed unit resets the backoff ladder.
    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("pause state poisoned");
        state.attempt = 0;
    }

    pub fn snapshot(&self) -> PauseState {
        self.state.lock().expect("pause state poisoned").clone()
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << exponent).min(self.max)
    }
}
