use std::time::Duration;

use thiserror::Error;

/// Reasons a runner configuration is rejected before any broker work starts.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("runner has no configuration")]
    Missing,
    #[error("bootstrap servers must not be empty")]
    EmptyBootstrapServers,
    #[error("consumer group id must not be empty")]
    EmptyGroupId,
    #[error("at least one topic must be configured")]
    EmptyTopics,
    #[error("key and value deserializer factories must both be set")]
    MissingDeserializers,
    #[error("unrecognized value `{value}` for {field}")]
    UnrecognizedValue { field: &'static str, value: String },
}

/// Errors surfaced by the broker client outside of the commit path.
///
/// Timeouts are distinguishable from other faults so the runner can decide
/// policy from data rather than string matching.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker operation timed out: {0}")]
    Timeout(String),
    #[error("broker authentication failed: {0}")]
    Authentication(String),
    #[error("fatal broker error: {0}")]
    Fatal(String),
    #[error("broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Errors that cannot be ridden out by backing off and polling again.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::Authentication(_) | BrokerError::Fatal(_))
    }
}

/// Commit failures. `Timeout` is retriable within the commit engine's attempt
/// budget; anything else gets a single extra attempt before escalating.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("offset commit timed out: {0}")]
    Timeout(String),
    #[error("offset commit failed: {0}")]
    Other(String),
}

/// Failure modes a processor invocation may complete with.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Cooperative signal: stop handing out records, back off, retry later.
    /// The unit's offsets are not committed and the broker will redeliver.
    #[error("pause requested: {reason}")]
    NeedForPause {
        reason: String,
        /// Explicit backoff hint; the pause controller computes one when absent.
        backoff: Option<Duration>,
    },
    /// Unrecoverable failure; stops the runner.
    #[error("fatal processing failure: {0}")]
    Fatal(anyhow::Error),
    /// Anything else; resolved by `RunnerConfig::on_unknown_handler_failure`.
    #[error("processing failure: {0}")]
    Other(anyhow::Error),
}

impl ProcessError {
    pub fn pause(reason: impl Into<String>) -> Self {
        ProcessError::NeedForPause {
            reason: reason.into(),
            backoff: None,
        }
    }

    pub fn pause_for(reason: impl Into<String>, backoff: Duration) -> Self {
        ProcessError::NeedForPause {
            reason: reason.into(),
            backoff: Some(backoff),
        }
    }
}

/// Errors returned by runner lifecycle calls.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}
