use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::deser::DeserializerFactory;
use crate::errors::ConfigError;

/// Where to start when the group has no committed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoOffsetReset {
    Earliest,
    #[default]
    Latest,
    /// Surface an error instead of resetting.
    None,
}

impl AutoOffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoOffsetReset::Earliest => "earliest",
            AutoOffsetReset::Latest => "latest",
            AutoOffsetReset::None => "error",
        }
    }

    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "earliest" => Ok(AutoOffsetReset::Earliest),
            "latest" => Ok(AutoOffsetReset::Latest),
            "none" | "error" => Ok(AutoOffsetReset::None),
            other => Err(ConfigError::UnrecognizedValue {
                field: "auto offset reset",
                value: other.to_string(),
            }),
        }
    }
}

/// How a poll batch is split into process units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchStrategy {
    /// One unit per partition present in the batch, records in offset order.
    #[default]
    OnePerPartition,
    /// A single unit carrying the whole batch.
    All,
}

impl DispatchStrategy {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "one-per-partition" => Ok(DispatchStrategy::OnePerPartition),
            "all" => Ok(DispatchStrategy::All),
            other => Err(ConfigError::UnrecognizedValue {
                field: "dispatch strategy",
                value: other.to_string(),
            }),
        }
    }
}

/// Policy for handler failures that are neither pause requests nor explicitly
/// fatal (including handler timeouts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnUnknownFailure {
    /// Treat like a pause request with the default backoff.
    #[default]
    PauseDefault,
    /// Stop the runner.
    Fatal,
}

/// Structured runner configuration. Built programmatically or from the
/// environment via [`RunnerEnvConfig`]; the deserializer factories are always
/// injected in code.
pub struct RunnerConfig<K, V> {
    pub bootstrap_servers: String,
    pub group_id: String,
    pub topics: BTreeSet<String>,
    pub auto_offset_reset: AutoOffsetReset,
    pub strategy: DispatchStrategy,
    pub poll_timeout: Duration,
    /// Per-record sleep before each invocation; test-style throttling.
    pub delay_single_record: Duration,
    /// Sleep between receiving a batch and dispatching it.
    pub delay_records: Duration,
    pub pause_base: Duration,
    pub pause_max: Duration,
    pub commit_attempts: u32,
    /// When true, a fatal error terminates the host process after the broker
    /// handle is released.
    pub force_exit: bool,
    pub on_unknown_handler_failure: OnUnknownFailure,
    pub key_deserializer: Option<Arc<dyn DeserializerFactory<K>>>,
    pub value_deserializer: Option<Arc<dyn DeserializerFactory<V>>>,
}

impl<K, V> RunnerConfig<K, V> {
    pub fn new(bootstrap_servers: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            group_id: group_id.into(),
            topics: BTreeSet::new(),
            auto_offset_reset: AutoOffsetReset::default(),
            strategy: DispatchStrategy::default(),
            poll_timeout: Duration::from_secs(1),
            delay_single_record: Duration::ZERO,
            delay_records: Duration::ZERO,
            pause_base: Duration::from_secs(1),
            pause_max: Duration::from_secs(120),
            commit_attempts: 3,
            force_exit: true,
            on_unknown_handler_failure: OnUnknownFailure::default(),
            key_deserializer: None,
            value_deserializer: None,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.insert(topic.into());
        self
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics.extend(topics.into_iter().map(Into::into));
        self
    }

    pub fn with_offset_reset(mut self, reset: AutoOffsetReset) -> Self {
        self.auto_offset_reset = reset;
        self
    }

    pub fn with_strategy(mut self, strategy: DispatchStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_delay_single_record(mut self, delay: Duration) -> Self {
        self.delay_single_record = delay;
        self
    }

    pub fn with_delay_records(mut self, delay: Duration) -> Self {
        self.delay_records = delay;
        self
    }

    pub fn with_pause_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.pause_base = base;
        self.pause_max = max;
        self
    }

    pub fn with_commit_attempts(mut self, attempts: u32) -> Self {
        self.commit_attempts = attempts;
        self
    }

    pub fn with_force_exit(mut self, force_exit: bool) -> Self {
        self.force_exit = force_exit;
        self
    }

    pub fn with_unknown_failure_policy(mut self, policy: OnUnknownFailure) -> Self {
        self.on_unknown_handler_failure = policy;
        self
    }

    pub fn with_key_deserializer(mut self, factory: Arc<dyn DeserializerFactory<K>>) -> Self {
        self.key_deserializer = Some(factory);
        self
    }

    pub fn with_value_deserializer(mut self, factory: Arc<dyn DeserializerFactory<V>>) -> Self {
        self.value_deserializer = Some(factory);
        self
    }

    /// Gate checked by `configure` and again by `start`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.trim().is_empty() {
            return Err(ConfigError::EmptyBootstrapServers);
        }
        if self.group_id.trim().is_empty() {
            return Err(ConfigError::EmptyGroupId);
        }
        if self.topics.is_empty() || self.topics.iter().all(|t| t.trim().is_empty()) {
            return Err(ConfigError::EmptyTopics);
        }
        if self.key_deserializer.is_none() || self.value_deserializer.is_none() {
            return Err(ConfigError::MissingDeserializers);
        }
        Ok(())
    }

    /// Ceiling for a single processor invocation.
    pub fn invoke_timeout(&self) -> Duration {
        (self.poll_timeout * 5).max(Duration::from_secs(30))
    }

    /// Assemble the rdkafka client config. Offsets are fully managed by the
    /// commit engine, so both auto-commit and auto-store are off.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", self.auto_offset_reset.as_str())
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");
        config
    }
}

impl<K, V> Clone for RunnerConfig<K, V> {
    fn clone(&self) -> Self {
        Self {
            bootstrap_servers: self.bootstrap_servers.clone(),
            group_id: self.group_id.clone(),
            topics: self.topics.clone(),
            auto_offset_reset: self.auto_offset_reset,
            strategy: self.strategy,
            poll_timeout: self.poll_timeout,
            delay_single_record: self.delay_single_record,
            delay_records: self.delay_records,
            pause_base: self.pause_base,
            pause_max: self.pause_max,
            commit_attempts: self.commit_attempts,
            force_exit: self.force_exit,
            on_unknown_handler_failure: self.on_unknown_handler_failure,
            key_deserializer: self.key_deserializer.clone(),
            value_deserializer: self.value_deserializer.clone(),
        }
    }
}

impl<K, V> fmt::Debug for RunnerConfig<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerConfig")
            .field("bootstrap_servers", &self.bootstrap_servers)
            .field("group_id", &self.group_id)
            .field("topics", &self.topics)
            .field("auto_offset_reset", &self.auto_offset_reset)
            .field("strategy", &self.strategy)
            .field("poll_timeout", &self.poll_timeout)
            .field("delay_single_record", &self.delay_single_record)
            .field("delay_records", &self.delay_records)
            .field("pause_base", &self.pause_base)
            .field("pause_max", &self.pause_max)
            .field("commit_attempts", &self.commit_attempts)
            .field("force_exit", &self.force_exit)
            .field(
                "on_unknown_handler_failure",
                &self.on_unknown_handler_failure,
            )
            .field("key_deserializer", &self.key_deserializer.is_some())
            .field("value_deserializer", &self.value_deserializer.is_some())
            .finish()
    }
}

/// Flat environment loader for the scalar fields, deploy-env style.
#[derive(Envconfig, Clone, Debug)]
pub struct RunnerEnvConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "consumer-runner")]
    pub kafka_consumer_group: String,

    // comma separated
    #[envconfig(default = "events")]
    pub kafka_consumer_topics: String,

    #[envconfig(default = "latest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "one-per-partition")]
    pub dispatch_strategy: String,

    #[envconfig(default = "1000")]
    pub poll_timeout_ms: u64,

    #[envconfig(default = "0")]
    pub delay_single_record_ms: u64,

    #[envconfig(default = "0")]
    pub delay_records_ms: u64,

    #[envconfig(default = "1000")]
    pub pause_base_ms: u64,

    #[envconfig(default = "120000")]
    pub pause_max_ms: u64,

    #[envconfig(default = "3")]
    pub commit_attempts: u32,

    #[envconfig(default = "true")]
    pub force_exit: bool,
}

impl RunnerEnvConfig {
    /// Combine the environment scalars with code-injected deserializers.
    pub fn into_runner_config<K, V>(
        self,
        key_deserializer: Arc<dyn DeserializerFactory<K>>,
        value_deserializer: Arc<dyn DeserializerFactory<V>>,
    ) -> Result<RunnerConfig<K, V>, ConfigError> {
        let topics = self
            .kafka_consumer_topics
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_owned)
            .collect::<Vec<_>>();

        Ok(
            RunnerConfig::new(self.kafka_hosts, self.kafka_consumer_group)
                .with_topics(topics)
                .with_offset_reset(AutoOffsetReset::parse(&self.kafka_consumer_offset_reset)?)
                .with_strategy(DispatchStrategy::parse(&self.dispatch_strategy)?)
                .with_poll_timeout(Duration::from_millis(self.poll_timeout_ms))
                .with_delay_single_record(Duration::from_millis(self.delay_single_record_ms))
                .with_delay_records(Duration::from_millis(self.delay_records_ms))
                .with_pause_backoff(
                    Duration::from_millis(self.pause_base_ms),
                    Duration::from_millis(self.pause_max_ms),
                )
                .with_commit_attempts(self.commit_attempts)
                .with_force_exit(self.force_exit)
                .with_key_deserializer(key_deserializer)
                .with_value_deserializer(value_deserializer),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deser::StringDeserializerFactory;

    fn complete_config() -> RunnerConfig<String, String> {
        RunnerConfig::new("localhost:9092", "test-group")
            .with_topic("events")
            .with_key_deserializer(Arc::new(StringDeserializerFactory))
            .with_value_deserializer(Arc::new(StringDeserializerFactory))
    }

    #[test]
    fn complete_config_validates() {
        assert!(complete_config().validate().is_ok());
    }

    #[test]
    fn missing_fields_are_rejected() {
        let mut config = complete_config();
        config.bootstrap_servers = "  ".to_string();
        assert_eq!(config.validate(), Err(ConfigError::EmptyBootstrapServers));

        let mut config = complete_config();
        config.group_id = String::new();
        assert_eq!(config.validate(), Err(ConfigError::EmptyGroupId));

        let mut config = complete_config();
        config.topics.clear();
        assert_eq!(config.validate(), Err(ConfigError::EmptyTopics));

        let mut config = complete_config();
        config.value_deserializer = None;
        assert_eq!(config.validate(), Err(ConfigError::MissingDeserializers));
    }

    #[test]
    fn invoke_timeout_has_a_floor() {
        let config = complete_config().with_poll_timeout(Duration::from_secs(1));
        assert_eq!(config.invoke_timeout(), Duration::from_secs(30));

        let config = complete_config().with_poll_timeout(Duration::from_secs(10));
        assert_eq!(config.invoke_timeout(), Duration::from_secs(50));
    }

    #[test]
    fn client_config_disables_auto_offsets() {
        let config = complete_config()
            .with_offset_reset(AutoOffsetReset::Earliest)
            .client_config();
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("enable.auto.offset.store"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn enum_parsing() {
        assert_eq!(
            AutoOffsetReset::parse("earliest").unwrap(),
            AutoOffsetReset::Earliest
        );
        assert_eq!(
            AutoOffsetReset::parse("none").unwrap(),
            AutoOffsetReset::None
        );
        assert!(AutoOffsetReset::parse("yesterday").is_err());

        assert_eq!(
            DispatchStrategy::parse("all").unwrap(),
            DispatchStrategy::All
        );
        assert!(DispatchStrategy::parse("per-topic").is_err());
    }
}
