//! In-memory doubles for exercising the runner without a broker.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::broker::BrokerClient;
use crate::errors::{BrokerError, CommitError};
use crate::hooks::RunnerHooks;
use crate::types::{Partition, PollBatch, Record};

/// Scripted outcome for a single commit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedCommit {
    Succeed,
    TimeOut,
    Fail,
}

struct PartitionLog<K, V> {
    records: Vec<Record<K, V>>,
    /// Next record index to hand out.
    position: usize,
    /// Next offset a restarted consumer would read from.
    committed: Option<i64>,
}

struct Inner<K, V> {
    logs: BTreeMap<Partition, PartitionLog<K, V>>,
    commit_script: VecDeque<ScriptedCommit>,
    paused: BTreeSet<Partition>,
    subscribed: Vec<String>,
    closed: bool,
    max_poll_records: usize,
    poll_calls: u64,
    commit_calls: u64,
}

/// In-memory broker with seedable records and scriptable commit outcomes.
///
/// Mirrors the rewind-on-pause behavior of the Kafka-backed client: pausing
/// resets each partition's read position to its committed offset so the
/// records of an abandoned batch are redelivered after resume. Clones share
/// state, so tests can keep one handle for assertions while the runner owns
/// another.
pub struct ScriptedBroker<K, V> {
    inner: Arc<Mutex<Inner<K, V>>>,
}

impl<K, V> Clone for ScriptedBroker<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> Default for ScriptedBroker<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ScriptedBroker<K, V> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                logs: BTreeMap::new(),
                commit_script: VecDeque::new(),
                paused: BTreeSet::new(),
                subscribed: Vec::new(),
                closed: false,
                max_poll_records: 500,
                poll_calls: 0,
                commit_calls: 0,
            })),
        }
    }

    pub fn with_max_poll_records(self, max: usize) -> Self {
        self.inner
            .lock()
            .expect("broker state poisoned")
            .max_poll_records = max.max(1);
        self
    }

    /// Append a record to a partition; offsets are assigned contiguously.
    pub fn seed(&self, topic: &str, partition: i32, key: Option<K>, value: V) {
        let mut inner = self.inner.lock().expect("broker state poisoned");
        let partition = Partition::new(topic, partition);
        let log = inner.logs.entry(partition.clone()).or_insert(PartitionLog {
            records: Vec::new(),
            position: 0,
            committed: None,
        });
        let offset = log.records.len() as i64;
        log.records.push(Record::new(
            partition,
            offset,
            key,
            value,
            offset,
            HashMap::new(),
        ));
    }

    /// Queue outcomes for upcoming commit calls; once drained, commits
    /// succeed.
    pub fn script_commit(&self, outcomes: impl IntoIterator<Item = ScriptedCommit>) {
        self.inner
            .lock()
            .expect("broker state poisoned")
            .commit_script
            .extend(outcomes);
    }

    /// The committed next-offset for a partition, if any commit landed.
    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.inner
            .lock()
            .expect("broker state poisoned")
            .logs
            .get(&Partition::new(topic, partition))
            .and_then(|log| log.committed)
    }

    /// Committed next-offsets summed over all partitions.
    pub fn total_committed(&self) -> i64 {
        self.inner
            .lock()
            .expect("broker state poisoned")
            .logs
            .values()
            .filter_map(|log| log.committed)
            .sum()
    }

    pub fn poll_calls(&self) -> u64 {
        self.inner.lock().expect("broker state poisoned").poll_calls
    }

    pub fn commit_calls(&self) -> u64 {
        self.inner.lock().expect("broker state poisoned").commit_calls
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("broker state poisoned")
            .subscribed
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("broker state poisoned").closed
    }
}

#[async_trait]
impl<K, V> BrokerClient<K, V> for ScriptedBroker<K, V>
where
    K: Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().expect("broker state poisoned");
        inner.subscribed = topics.to_vec();
        Ok(())
    }

    async fn poll(&mut self, _timeout: Duration) -> Result<PollBatch<K, V>, BrokerError> {
        let mut inner = self.inner.lock().expect("broker state poisoned");
        if inner.closed {
            return Err(BrokerError::Fatal("broker closed".to_string()));
        }
        inner.poll_calls += 1;

        let max = inner.max_poll_records;
        let paused = inner.paused.clone();
        let mut batch = PollBatch::new();
        for (partition, log) in inner.logs.iter_mut() {
            if paused.contains(partition) {
                continue;
            }
            while log.position < log.records.len() && batch.len() < max {
                batch.push(log.records[log.position].clone());
                log.position += 1;
            }
        }
        Ok(batch)
    }

    async fn commit_sync(&mut self, offsets: &HashMap<Partition, i64>) -> Result<(), CommitError> {
        let mut inner = self.inner.lock().expect("broker state poisoned");
        inner.commit_calls += 1;

        match inner.commit_script.pop_front() {
            Some(ScriptedCommit::TimeOut) => {
                return Err(CommitError::Timeout("scripted commit timeout".to_string()))
            }
            Some(ScriptedCommit::Fail) => {
                return Err(CommitError::Other("scripted commit failure".to_string()))
            }
            Some(ScriptedCommit::Succeed) | None => {}
        }

        for (partition, next) in offsets {
            let log = inner.logs.entry(partition.clone()).or_insert(PartitionLog {
                records: Vec::new(),
                position: 0,
                committed: None,
            });
            log.committed = Some(*next);
        }
        Ok(())
    }

    async fn pause(&mut self, partitions: &BTreeSet<Partition>) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().expect("broker state poisoned");
        for partition in partitions {
            inner.paused.insert(partition.clone());
            if let Some(log) = inner.logs.get_mut(partition) {
                // rewind to committed so uncommitted records are redelivered
                let rewound = log.committed.unwrap_or(0).max(0) as usize;
                log.position = rewound.min(log.records.len());
            }
        }
        Ok(())
    }

    async fn resume(&mut self, partitions: &BTreeSet<Partition>) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().expect("broker state poisoned");
        for partition in partitions {
            inner.paused.remove(partition);
        }
        Ok(())
    }

    fn assignment(&self) -> Result<BTreeSet<Partition>, BrokerError> {
        let inner = self.inner.lock().expect("broker state poisoned");
        Ok(inner.logs.keys().cloned().collect())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.inner.lock().expect("broker state poisoned").closed = true;
        Ok(())
    }
}

/// A single lifecycle event seen by [`RecordingHooks`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    PrePoll,
    PostCommit(usize),
    Pause { reason: String, backoff: Duration },
    Resume,
    Fatal(String),
}

/// Hook observer that records every event for later assertions.
#[derive(Default)]
pub struct RecordingHooks {
    events: Mutex<Vec<HookEvent>>,
}

impl RecordingHooks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().expect("hook events poisoned").clone()
    }

    pub fn count(&self, matches: impl Fn(&HookEvent) -> bool) -> usize {
        self.events().iter().filter(|e| matches(e)).count()
    }

    /// Sum of all `on_post_commit` tallies.
    pub fn post_commit_total(&self) -> usize {
        self.events()
            .iter()
            .map(|e| match e {
                HookEvent::PostCommit(n) => *n,
                _ => 0,
            })
            .sum()
    }

    fn push(&self, event: HookEvent) {
        self.events.lock().expect("hook events poisoned").push(event);
    }
}

impl RunnerHooks for RecordingHooks {
    fn on_pre_poll(&self) {
        self.push(HookEvent::PrePoll);
    }

    fn on_post_commit(&self, committed: usize) {
        self.push(HookEvent::PostCommit(committed));
    }

    fn on_pause(&self, reason: &str, backoff: Duration) {
        self.push(HookEvent::Pause {
            reason: reason.to_string(),
            backoff,
        });
    }

    fn on_resume(&self) {
        self.push(HookEvent::Resume);
    }

    fn on_fatal(&self, error: &anyhow::Error) {
        self.push(HookEvent::Fatal(format!("{error:#}")));
    }
}

/// Poll `condition` until it holds or `timeout` elapses; returns the final
/// verdict.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_broker_delivers_then_redelivers_after_pause() {
        let broker: ScriptedBroker<String, String> = ScriptedBroker::new();
        broker.seed("events", 0, None, "a".to_string());
        broker.seed("events", 0, None, "b".to_string());

        let mut client = broker.clone();
        let batch = client.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(batch.len(), 2);

        // nothing committed; pausing rewinds to the start
        let partitions = BTreeSet::from([Partition::new("events", 0)]);
        client.pause(&partitions).await.unwrap();
        assert!(client
            .poll(Duration::from_millis(10))
            .await
            .unwrap()
            .is_empty());

        client.resume(&partitions).await.unwrap();
        let redelivered = client.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(redelivered.len(), 2);
    }

    #[tokio::test]
    async fn committed_records_are_not_redelivered() {
        let broker: ScriptedBroker<String, String> = ScriptedBroker::new();
        broker.seed("events", 0, None, "a".to_string());
        broker.seed("events", 0, None, "b".to_string());

        let mut client = broker.clone();
        client.poll(Duration::from_millis(10)).await.unwrap();
        client
            .commit_sync(&HashMap::from([(Partition::new("events", 0), 2)]))
            .await
            .unwrap();

        let partitions = BTreeSet::from([Partition::new("events", 0)]);
        client.pause(&partitions).await.unwrap();
        client.resume(&partitions).await.unwrap();
        assert!(client
            .poll(Duration::from_millis(10))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(broker.committed("events", 0), Some(2));
    }
}
