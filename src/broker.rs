use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{Offset, TopicPartitionList};
use tracing::{debug, warn};

use crate::config::{AutoOffsetReset, RunnerConfig};
use crate::deser::Deserializer;
use crate::errors::{BrokerError, CommitError};
use crate::metrics_consts::RUNNER_DECODE_ERRORS;
use crate::types::{Partition, PollBatch, Record};

/// Upper bound on records accumulated by a single poll.
const DEFAULT_MAX_BATCH_RECORDS: usize = 500;

/// Timeout for the metadata calls made on the pause path.
const OFFSET_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// The slice of broker functionality the runner consumes.
///
/// Implementations are confined to the runner's driver, so they only need to
/// be `Send`, not `Sync`; all calls are serialized. Commit timeouts must be
/// distinguishable from other commit faults.
#[async_trait]
pub trait BrokerClient<K, V>: Send {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError>;

    /// Accumulate everything available within `timeout` into one batch. An
    /// empty batch is a normal outcome.
    async fn poll(&mut self, timeout: Duration) -> Result<PollBatch<K, V>, BrokerError>;

    /// Commit the given next-offsets synchronously.
    async fn commit_sync(&mut self, offsets: &HashMap<Partition, i64>) -> Result<(), CommitError>;

    async fn pause(&mut self, partitions: &BTreeSet<Partition>) -> Result<(), BrokerError>;

    async fn resume(&mut self, partitions: &BTreeSet<Partition>) -> Result<(), BrokerError>;

    fn assignment(&self) -> Result<BTreeSet<Partition>, BrokerError>;

    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// rdkafka-backed broker client.
pub struct KafkaBroker<K, V> {
    consumer: StreamConsumer,
    key_deserializer: Box<dyn Deserializer<K>>,
    value_deserializer: Box<dyn Deserializer<V>>,
    /// Where to rewind a partition with no committed offset before pausing.
    rewind_fallback: Option<Offset>,
    max_batch_records: usize,
}

impl<K, V> KafkaBroker<K, V> {
    pub fn from_config(config: &RunnerConfig<K, V>) -> Result<Self, BrokerError> {
        let key_factory = config
            .key_deserializer
            .as_ref()
            .ok_or_else(|| BrokerError::Fatal("key deserializer factory not configured".into()))?;
        let value_factory = config.value_deserializer.as_ref().ok_or_else(|| {
            BrokerError::Fatal("value deserializer factory not configured".into())
        })?;

        let key_deserializer = key_factory
            .create()
            .map_err(|e| BrokerError::Fatal(format!("key deserializer construction failed: {e:#}")))?;
        let value_deserializer = value_factory.create().map_err(|e| {
            BrokerError::Fatal(format!("value deserializer construction failed: {e:#}"))
        })?;

        let consumer: StreamConsumer = config
            .client_config()
            .create()
            .map_err(|e| BrokerError::Fatal(format!("failed to create consumer: {e}")))?;

        Ok(Self {
            consumer,
            key_deserializer,
            value_deserializer,
            rewind_fallback: match config.auto_offset_reset {
                AutoOffsetReset::Earliest => Some(Offset::Beginning),
                AutoOffsetReset::Latest | AutoOffsetReset::None => None,
            },
            max_batch_records: DEFAULT_MAX_BATCH_RECORDS,
        })
    }

    pub fn with_max_batch_records(mut self, max: usize) -> Self {
        self.max_batch_records = max.max(1);
        self
    }

    fn absorb(&self, message: &BorrowedMessage<'_>, batch: &mut PollBatch<K, V>) {
        let partition = Partition::new(message.topic(), message.partition());
        let offset = message.offset();
        let timestamp = message.timestamp().to_millis().unwrap_or(-1);

        let Some(payload) = message.payload() else {
            // tombstone or poison pill: advance past it once the unit commits
            warn!(%partition, offset, "skipping record without payload");
            metrics::counter!(RUNNER_DECODE_ERRORS).increment(1);
            batch.observe(partition, offset);
            return;
        };

        let value = match self.value_deserializer.deserialize(message.topic(), payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(%partition, offset, "skipping undecodable value: {e:#}");
                metrics::counter!(RUNNER_DECODE_ERRORS).increment(1);
                batch.observe(partition, offset);
                return;
            }
        };

        let key = match message.key() {
            None => None,
            Some(raw) => match self.key_deserializer.deserialize(message.topic(), raw) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(%partition, offset, "skipping undecodable key: {e:#}");
                    metrics::counter!(RUNNER_DECODE_ERRORS).increment(1);
                    batch.observe(partition, offset);
                    return;
                }
            },
        };

        let headers = message
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .map(|h| (h.key.to_owned(), h.value.map(<[u8]>::to_vec).unwrap_or_default()))
                    .collect()
            })
            .unwrap_or_default();

        batch.push(Record::new(partition, offset, key, value, timestamp, headers));
    }
}

#[async_trait]
impl<K, V> BrokerClient<K, V> for KafkaBroker<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError> {
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&names)
            .map_err(|e| classify_kafka_error(&e))
    }

    async fn poll(&mut self, timeout: Duration) -> Result<PollBatch<K, V>, BrokerError> {
        let mut batch = PollBatch::new();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if batch.len() >= self.max_batch_records {
                break;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }

            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Err(_) => break,
                Ok(Ok(message)) => self.absorb(&message, &mut batch),
                Ok(Err(e)) => {
                    let classified = classify_kafka_error(&e);
                    if classified.is_fatal() {
                        return Err(classified);
                    }
                    warn!(error = %classified, "transient broker error while polling");
                    metrics::counter!(crate::metrics_consts::RUNNER_BROKER_ERRORS).increment(1);
                    break;
                }
            }
        }

        Ok(batch)
    }

    async fn commit_sync(&mut self, offsets: &HashMap<Partition, i64>) -> Result<(), CommitError> {
        let mut list = TopicPartitionList::new();
        for (partition, next) in offsets {
            list.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                Offset::Offset(*next),
            )
            .map_err(|e| CommitError::Other(e.to_string()))?;
        }
        self.consumer
            .commit(&list, CommitMode::Sync)
            .map_err(classify_commit_error)
    }

    async fn pause(&mut self, partitions: &BTreeSet<Partition>) -> Result<(), BrokerError> {
        if partitions.is_empty() {
            return Ok(());
        }

        // Rewind each partition to its committed position first so the
        // records of the abandoned batch are redelivered after resume.
        let committed = self
            .consumer
            .committed(OFFSET_FETCH_TIMEOUT)
            .map_err(|e| classify_kafka_error(&e))?;
        for elem in committed.elements() {
            let partition = Partition::new(elem.topic(), elem.partition());
            if !partitions.contains(&partition) {
                continue;
            }
            let target = match elem.offset() {
                Offset::Offset(o) => Some(Offset::Offset(o)),
                _ => self.rewind_fallback,
            };
            if let Some(target) = target {
                if let Err(e) =
                    self.consumer
                        .seek(elem.topic(), elem.partition(), target, OFFSET_FETCH_TIMEOUT)
                {
                    warn!(%partition, error = %e, "failed to rewind partition before pause");
                }
            }
        }

        self.consumer
            .pause(&to_topic_partition_list(partitions))
            .map_err(|e| classify_kafka_error(&e))
    }

    async fn resume(&mut self, partitions: &BTreeSet<Partition>) -> Result<(), BrokerError> {
        if partitions.is_empty() {
            return Ok(());
        }
        self.consumer
            .resume(&to_topic_partition_list(partitions))
            .map_err(|e| classify_kafka_error(&e))
    }

    fn assignment(&self) -> Result<BTreeSet<Partition>, BrokerError> {
        let assignment = self
            .consumer
            .assignment()
            .map_err(|e| classify_kafka_error(&e))?;
        Ok(assignment
            .elements()
            .into_iter()
            .map(|elem| Partition::new(elem.topic(), elem.partition()))
            .collect())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        debug!("unsubscribing consumer");
        self.consumer.unsubscribe();
        Ok(())
    }
}

fn to_topic_partition_list(partitions: &BTreeSet<Partition>) -> TopicPartitionList {
    let mut list = TopicPartitionList::new();
    for partition in partitions {
        list.add_partition(partition.topic(), partition.partition_number());
    }
    list
}

fn classify_kafka_error(error: &KafkaError) -> BrokerError {
    match error {
        KafkaError::MessageConsumptionFatal(code) => BrokerError::Fatal(code.to_string()),
        KafkaError::Global(code) | KafkaError::MessageConsumption(code) => match code {
            RDKafkaErrorCode::Authentication => BrokerError::Authentication(code.to_string()),
            RDKafkaErrorCode::OperationTimedOut | RDKafkaErrorCode::RequestTimedOut => {
                BrokerError::Timeout(code.to_string())
            }
            _ => BrokerError::Other(code.to_string()),
        },
        other => BrokerError::Other(other.to_string()),
    }
}

fn classify_commit_error(error: KafkaError) -> CommitError {
    match &error {
        KafkaError::ConsumerCommit(code) | KafkaError::Global(code)
            if matches!(
                code,
                RDKafkaErrorCode::OperationTimedOut | RDKafkaErrorCode::RequestTimedOut
            ) =>
        {
            CommitError::Timeout(error.to_string())
        }
        _ => CommitError::Other(error.to_string()),
    }
}
