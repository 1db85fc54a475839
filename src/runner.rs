use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::broker::{BrokerClient, KafkaBroker};
use crate::clock::{sleep_unless_cancelled, Clock, TokioClock};
use crate::commit::{CommitEngine, CommitStatus};
use crate::config::RunnerConfig;
use crate::dispatch::dispatch;
use crate::errors::{ConfigError, RunnerError};
use crate::hooks::{HookBus, RunnerHooks};
use crate::invoker::{Outcome, ProcessInvoker, Processor};
use crate::metrics_consts::{
    RUNNER_BATCHES_POLLED, RUNNER_BROKER_ERRORS, RUNNER_FATAL_ERRORS, RUNNER_PAUSES,
    RUNNER_RECORDS_POLLED, RUNNER_RESUMES,
};
use crate::pause::PauseController;
use crate::types::{ProcessResult, RunnerState};

/// Idle wait after a poll that surfaced nothing.
const IDLE_YIELD: Duration = Duration::from_millis(50);
/// Wait after a transient broker error before polling again.
const TRANSIENT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Monotonic suffix distinguishing runner instances in logs.
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(0);

struct Shared {
    state: AtomicU8,
    paused_history: AtomicU64,
    unpaused_history: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(RunnerState::New as u8),
            paused_history: AtomicU64::new(0),
            unpaused_history: AtomicU64::new(0),
        }
    }

    fn state(&self) -> RunnerState {
        RunnerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: RunnerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

struct DriverHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// Supervised poll/process/commit loop over a partitioned log.
///
/// The runner owns its broker client exclusively: a single driver task
/// performs every broker call (poll, commit, pause, resume, close) and awaits
/// each processor invocation before moving on. Units are handled sequentially
/// within a batch so that a pause request cleanly abandons the remainder for
/// redelivery.
pub struct ConsumerRunner<K, V> {
    instance_id: u64,
    shared: Arc<Shared>,
    hooks: Arc<HookBus>,
    commit_engine: Arc<CommitEngine>,
    processor: Arc<dyn Processor<K, V>>,
    clock: Arc<dyn Clock>,
    config: Mutex<Option<RunnerConfig<K, V>>>,
    broker_override: Mutex<Option<Box<dyn BrokerClient<K, V>>>>,
    driver: Mutex<Option<DriverHandle>>,
}

impl<K, V> ConsumerRunner<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    pub fn new(processor: Arc<dyn Processor<K, V>>) -> Self {
        Self {
            instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            shared: Arc::new(Shared::new()),
            hooks: Arc::new(HookBus::new()),
            commit_engine: Arc::new(CommitEngine::new()),
            processor,
            clock: Arc::new(TokioClock),
            config: Mutex::new(None),
            broker_override: Mutex::new(None),
            driver: Mutex::new(None),
        }
    }

    /// Substitute the broker client built from config; used by tests to run
    /// against an in-memory broker. Consumed by the next `start`.
    pub fn with_broker(self, broker: Box<dyn BrokerClient<K, V>>) -> Self {
        *self.broker_override.lock().expect("broker slot poisoned") = Some(broker);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate and store the configuration. On success the runner moves to
    /// `Configured`; on failure nothing is stored.
    pub fn configure(&self, config: RunnerConfig<K, V>) -> Result<(), ConfigError> {
        config.validate()?;
        *self.config.lock().expect("config slot poisoned") = Some(config);
        if self.shared.state() == RunnerState::New {
            self.shared.set_state(RunnerState::Configured);
        }
        Ok(())
    }

    /// Register a lifecycle observer. Safe at any point; registration after
    /// start takes effect on the next event.
    pub fn register_hooks(&self, hooks: Arc<dyn RunnerHooks>) {
        self.hooks.register(hooks);
    }

    /// Spawn the driver. Idempotent while running; fails fast with
    /// `InvalidConfig` when the runner was never (or incorrectly) configured,
    /// leaving it `Stopped`.
    pub async fn start(&self) -> Result<(), RunnerError> {
        match self.shared.state() {
            RunnerState::Running | RunnerState::Paused | RunnerState::Stopping => return Ok(()),
            RunnerState::New => {
                error!(
                    instance = self.instance_id,
                    "refusing to start: runner has no configuration"
                );
                self.shared.set_state(RunnerState::Stopped);
                return Err(ConfigError::Missing.into());
            }
            RunnerState::Configured | RunnerState::Stopped => {}
        }

        let config = match self.config.lock().expect("config slot poisoned").clone() {
            Some(config) => config,
            None => {
                self.shared.set_state(RunnerState::Stopped);
                return Err(ConfigError::Missing.into());
            }
        };
        if let Err(e) = config.validate() {
            error!(
                instance = self.instance_id,
                error = %e,
                "refusing to start with invalid configuration"
            );
            self.shared.set_state(RunnerState::Stopped);
            return Err(e.into());
        }

        let broker = match self
            .broker_override
            .lock()
            .expect("broker slot poisoned")
            .take()
        {
            Some(broker) => broker,
            None => match KafkaBroker::from_config(&config) {
                Ok(broker) => Box::new(broker) as Box<dyn BrokerClient<K, V>>,
                Err(e) => {
                    error!(
                        instance = self.instance_id,
                        error = %e,
                        "failed to build broker client"
                    );
                    self.shared.set_state(RunnerState::Stopped);
                    return Err(e.into());
                }
            },
        };

        let cancel = CancellationToken::new();
        let driver = Driver {
            shared: self.shared.clone(),
            hooks: self.hooks.clone(),
            engine: self.commit_engine.clone(),
            processor: self.processor.clone(),
            clock: self.clock.clone(),
            config,
        };

        self.shared.set_state(RunnerState::Running);
        let span = tracing::info_span!("consumer_runner", instance = self.instance_id);
        let join = tokio::spawn(driver.run(broker, cancel.clone()).instrument(span));
        *self.driver.lock().expect("driver slot poisoned") = Some(DriverHandle { cancel, join });
        Ok(())
    }

    /// Cooperative shutdown: signals the driver and waits until it has
    /// released the broker handle. A second call is a no-op.
    pub async fn stop(&self) {
        let handle = self.driver.lock().expect("driver slot poisoned").take();
        let Some(DriverHandle { cancel, join }) = handle else {
            return;
        };
        cancel.cancel();
        if let Err(e) = join.await {
            error!(instance = self.instance_id, "driver task panicked: {e}");
            self.shared.set_state(RunnerState::Stopped);
        }
    }

    pub fn state(&self) -> RunnerState {
        self.shared.state()
    }

    pub fn running(&self) -> bool {
        self.shared.state().is_running()
    }

    pub fn paused_history(&self) -> u64 {
        self.shared.paused_history.load(Ordering::Relaxed)
    }

    pub fn unpaused_history(&self) -> u64 {
        self.shared.unpaused_history.load(Ordering::Relaxed)
    }

    /// Units whose offsets were committed over the life of the runner.
    pub fn post_commit_count(&self) -> u64 {
        self.commit_engine.committed_units()
    }

    /// Commit attempts issued, successful or not.
    pub fn commit_attempts_total(&self) -> u64 {
        self.commit_engine.total_attempts()
    }
}

enum StopCause {
    Fatal(anyhow::Error),
    Shutdown,
}

struct Driver<K, V> {
    shared: Arc<Shared>,
    hooks: Arc<HookBus>,
    engine: Arc<CommitEngine>,
    processor: Arc<dyn Processor<K, V>>,
    clock: Arc<dyn Clock>,
    config: RunnerConfig<K, V>,
}

impl<K, V> Driver<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    async fn run(self, mut broker: Box<dyn BrokerClient<K, V>>, shutdown: CancellationToken) {
        let topics: Vec<String> = self.config.topics.iter().cloned().collect();
        info!(topics = ?topics, group = %self.config.group_id, "starting consumption");

        if let Err(e) = broker.subscribe(&topics).await {
            self.fail(&mut broker, anyhow!(e).context("subscribe failed")).await;
            return;
        }

        let invoker = ProcessInvoker::new(
            self.processor.clone(),
            self.config.invoke_timeout(),
            self.config.delay_single_record,
            self.config.on_unknown_handler_failure,
        );
        let pause = PauseController::new(self.config.pause_base, self.config.pause_max);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if pause.snapshot().paused {
                if pause.try_resume(self.clock.now()) {
                    self.shared.set_state(RunnerState::Running);
                    self.shared.unpaused_history.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(RUNNER_RESUMES).increment(1);
                    match broker.assignment() {
                        Ok(assigned) => {
                            if let Err(e) = broker.resume(&assigned).await {
                                warn!(error = %e, "failed to resume partitions");
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to read assignment for resume"),
                    }
                    self.hooks.resume();
                    info!("resumed consumption");
                } else {
                    // keep the broker session alive without surfacing records
                    match broker.poll(self.config.poll_timeout).await {
                        Ok(batch) if !batch.is_empty() => {
                            debug!(records = batch.len(), "discarding records polled while paused")
                        }
                        Ok(_) => {}
                        Err(e) if e.is_fatal() => {
                            self.fail(&mut broker, anyhow!(e).context("paused poll failed"))
                                .await;
                            return;
                        }
                        Err(e) => warn!(error = %e, "broker error during paused poll"),
                    }
                    if !sleep_unless_cancelled(IDLE_YIELD, &shutdown).await {
                        break;
                    }
                    continue;
                }
            }

            self.hooks.pre_poll();
            let batch = match broker.poll(self.config.poll_timeout).await {
                Ok(batch) => batch,
                Err(e) if e.is_fatal() => {
                    self.fail(&mut broker, anyhow!(e).context("poll failed")).await;
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "transient broker error, backing off");
                    metrics::counter!(RUNNER_BROKER_ERRORS).increment(1);
                    if !sleep_unless_cancelled(TRANSIENT_ERROR_BACKOFF, &shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                if !sleep_unless_cancelled(IDLE_YIELD, &shutdown).await {
                    break;
                }
                continue;
            }

            metrics::counter!(RUNNER_BATCHES_POLLED).increment(1);
            metrics::counter!(RUNNER_RECORDS_POLLED).increment(batch.len() as u64);

            if !self.config.delay_records.is_zero()
                && !sleep_unless_cancelled(self.config.delay_records, &shutdown).await
            {
                break;
            }

            let units = dispatch(batch, self.config.strategy);
            let mut committed = 0usize;
            let mut stop_cause: Option<StopCause> = None;

            for mut unit in units {
                let outcome = if unit.is_empty() {
                    // nothing decodable on this partition; commit straight
                    // through to move the watermark past the skipped records
                    Outcome::Success(ProcessResult::new(Vec::new()))
                } else {
                    invoker.invoke(&mut unit, &shutdown).await
                };

                match outcome {
                    Outcome::Success(result) => {
                        match self
                            .engine
                            .commit_unit(
                                broker.as_mut(),
                                unit.next_offsets(),
                                self.config.commit_attempts,
                                &shutdown,
                            )
                            .await
                        {
                            CommitStatus::Committed => {
                                committed += 1;
                                pause.record_success();
                                debug!(
                                    unit = unit.index(),
                                    result_id = %result.id(),
                                    "unit committed"
                                );
                            }
                            CommitStatus::Exhausted(e) => {
                                stop_cause = Some(StopCause::Fatal(
                                    anyhow!(e).context("offset commit gave up"),
                                ));
                                break;
                            }
                            CommitStatus::Shutdown => {
                                stop_cause = Some(StopCause::Shutdown);
                                break;
                            }
                        }
                    }
                    Outcome::Pause { reason, backoff } => {
                        let state = pause.request_pause(self.clock.now(), &reason, backoff);
                        self.shared.paused_history.fetch_add(1, Ordering::Relaxed);
                        metrics::counter!(RUNNER_PAUSES).increment(1);
                        self.shared.set_state(RunnerState::Paused);
                        warn!(
                            reason = %state.reason,
                            backoff = ?state.next_attempt_after,
                            attempt = state.attempt,
                            "pausing consumption, abandoning remainder of batch"
                        );
                        match broker.assignment() {
                            Ok(assigned) => {
                                if let Err(e) = broker.pause(&assigned).await {
                                    warn!(error = %e, "failed to pause partitions");
                                }
                            }
                            Err(e) => warn!(error = %e, "failed to read assignment for pause"),
                        }
                        self.hooks.pause(&state.reason, state.next_attempt_after);
                        break;
                    }
                    Outcome::Fatal(cause) => {
                        stop_cause = Some(StopCause::Fatal(cause));
                        break;
                    }
                    Outcome::Shutdown => {
                        stop_cause = Some(StopCause::Shutdown);
                        break;
                    }
                }
            }

            match stop_cause {
                Some(StopCause::Fatal(cause)) => {
                    self.fail(&mut broker, cause).await;
                    return;
                }
                Some(StopCause::Shutdown) => break,
                None => self.hooks.post_commit(committed),
            }
        }

        self.shared.set_state(RunnerState::Stopping);
        info!("stopping, releasing broker");
        if let Err(e) = broker.close().await {
            warn!(error = %e, "error closing broker client");
        }
        self.shared.set_state(RunnerState::Stopped);
        info!("consumer runner stopped");
    }

    /// Fatal path: release the broker, fire `on_fatal` last, optionally
    /// terminate the host.
    async fn fail(&self, broker: &mut Box<dyn BrokerClient<K, V>>, cause: anyhow::Error) {
        metrics::counter!(RUNNER_FATAL_ERRORS).increment(1);
        error!("fatal error, stopping consumer runner: {cause:#}");
        self.shared.set_state(RunnerState::Stopping);
        if let Err(e) = broker.close().await {
            warn!(error = %e, "error closing broker client");
        }
        self.hooks.fatal(&cause);
        self.shared.set_state(RunnerState::Stopped);
        if self.config.force_exit {
            error!("terminating process after fatal error");
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::deser::StringDeserializerFactory;
    use crate::errors::ProcessError;
    use crate::types::Record;
    use async_trait::async_trait;

    struct NoopProcessor;

    #[async_trait]
    impl Processor<String, String> for NoopProcessor {
        async fn process(
            &self,
            records: Vec<Record<String, String>>,
        ) -> Result<ProcessResult<String, String>, ProcessError> {
            Ok(ProcessResult::new(records))
        }
    }

    fn valid_config() -> RunnerConfig<String, String> {
        RunnerConfig::new("localhost:9092", "group")
            .with_topic("events")
            .with_key_deserializer(Arc::new(StringDeserializerFactory))
            .with_value_deserializer(Arc::new(StringDeserializerFactory))
    }

    #[tokio::test]
    async fn start_without_configuration_fails_fast() {
        let runner = ConsumerRunner::new(Arc::new(NoopProcessor));
        let err = runner.start().await.unwrap_err();
        assert!(matches!(
            err,
            RunnerError::InvalidConfig(ConfigError::Missing)
        ));
        assert!(!runner.running());
        assert_eq!(runner.state(), RunnerState::Stopped);
    }

    #[tokio::test]
    async fn invalid_configuration_is_rejected_and_not_stored() {
        let runner = ConsumerRunner::new(Arc::new(NoopProcessor));
        let mut config = valid_config();
        config.topics.clear();

        assert_eq!(runner.configure(config), Err(ConfigError::EmptyTopics));
        assert_eq!(runner.state(), RunnerState::New);
    }

    #[tokio::test]
    async fn configure_transitions_to_configured() {
        let runner = ConsumerRunner::new(Arc::new(NoopProcessor));
        runner.configure(valid_config()).unwrap();
        assert_eq!(runner.state(), RunnerState::Configured);
        assert!(!runner.running());
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let runner = ConsumerRunner::new(Arc::new(NoopProcessor));
        runner.configure(valid_config()).unwrap();
        runner.stop().await;
        runner.stop().await;
        assert_eq!(runner.state(), RunnerState::Configured);
    }
}
