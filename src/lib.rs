//! Resilient streaming consumer runner: a supervised poll/process/commit
//! loop over a partitioned, at-least-once log.
//!
//! The runner turns an asynchronous record handler into a backpressure-aware
//! pipeline with explicit pause/resume, timeout-aware commit retry, and a
//! choice of per-partition or whole-batch dispatch. A single driver task owns
//! the broker client; handler failures are cooperative signals, not crashes.

pub mod broker;
pub mod clock;
pub mod commit;
pub mod config;
pub mod deser;
pub mod dispatch;
pub mod errors;
pub mod hooks;
pub mod invoker;
pub mod metrics_consts;
pub mod pause;
pub mod runner;
pub mod test_utils;
pub mod types;

// Public API - what users of the runner should reach for.
pub use broker::{BrokerClient, KafkaBroker};
pub use clock::{Clock, TokioClock};
pub use commit::CommitEngine;
pub use config::{
    AutoOffsetReset, DispatchStrategy, OnUnknownFailure, RunnerConfig, RunnerEnvConfig,
};
pub use deser::{
    Deserializer, DeserializerFactory, JsonDeserializer, JsonDeserializerFactory,
    StringDeserializer, StringDeserializerFactory,
};
pub use errors::{BrokerError, CommitError, ConfigError, ProcessError, RunnerError};
pub use hooks::RunnerHooks;
pub use invoker::Processor;
pub use pause::{PauseController, PauseState};
pub use runner::ConsumerRunner;
pub use types::{Partition, PollBatch, ProcessResult, ProcessUnit, Record, RunnerState};
