// ==== Poll loop metrics ====
/// Counter for non-empty batches surfaced by the poll loop
pub const RUNNER_BATCHES_POLLED: &str = "consumer_runner_batches_polled";

/// Counter for decoded records handed to the dispatcher
pub const RUNNER_RECORDS_POLLED: &str = "consumer_runner_records_polled";

/// Counter for records skipped because their key or value failed to decode
pub const RUNNER_DECODE_ERRORS: &str = "consumer_runner_decode_errors";

/// Counter for transient broker errors ridden out with a short backoff
pub const RUNNER_BROKER_ERRORS: &str = "consumer_runner_broker_errors";

// ==== Commit metrics ====
/// Counter for process units whose offsets were successfully committed
pub const RUNNER_UNITS_COMMITTED: &str = "consumer_runner_units_committed";

/// Counter for commit calls issued, successful or not, including retries
pub const RUNNER_COMMIT_ATTEMPTS: &str = "consumer_runner_commit_attempts";

/// Counter for units whose commit retry budget was exhausted
pub const RUNNER_COMMIT_RETRIES_EXHAUSTED: &str = "consumer_runner_commit_retries_exhausted";

// ==== Pause/resume metrics ====
/// Counter for transitions into the paused state
pub const RUNNER_PAUSES: &str = "consumer_runner_pauses";

/// Counter for resumes after the pause backoff elapsed
pub const RUNNER_RESUMES: &str = "consumer_runner_resumes";

// ==== Lifecycle metrics ====
/// Counter for panics caught and suppressed in lifecycle hooks, tagged by hook
pub const RUNNER_HOOK_PANICS: &str = "consumer_runner_hook_panics";

pub const RUNNER_FATAL_ERRORS: &str = "consumer_runner_fatal_errors";
