use std::collections::{BTreeSet, HashMap};
use std::fmt;

use uuid::Uuid;

/// A topic/partition pair. Ordered so iteration over a batch's partition set
/// is stable across runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition_number)
    }
}

/// A single decoded record. Immutable once polled.
#[derive(Debug, Clone)]
pub struct Record<K, V> {
    partition: Partition,
    offset: i64,
    key: Option<K>,
    value: V,
    timestamp: i64,
    headers: HashMap<String, Vec<u8>>,
}

impl<K, V> Record<K, V> {
    pub fn new(
        partition: Partition,
        offset: i64,
        key: Option<K>,
        value: V,
        timestamp: i64,
        headers: HashMap<String, Vec<u8>>,
    ) -> Self {
        Self {
            partition,
            offset,
            key,
            value,
            timestamp,
            headers,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    /// Epoch milliseconds; -1 when the broker supplied no timestamp.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn headers(&self) -> &HashMap<String, Vec<u8>> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers.get(name).map(Vec::as_slice)
    }

    pub fn into_value(self) -> V {
        self.value
    }
}

/// Everything one poll produced. Consumed once by the dispatcher.
///
/// `observed` tracks the highest offset polled per partition, including
/// records whose payload could not be decoded. Those poison offsets are only
/// advanced at the broker once the owning partition's unit commits.
#[derive(Debug, Clone)]
pub struct PollBatch<K, V> {
    records: Vec<Record<K, V>>,
    observed: HashMap<Partition, i64>,
}

impl<K, V> PollBatch<K, V> {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
            observed: HashMap::new(),
        }
    }

    pub fn with_capacity(hint: usize) -> Self {
        Self {
            records: Vec::with_capacity(hint),
            observed: HashMap::new(),
        }
    }

    pub fn push(&mut self, record: Record<K, V>) {
        self.observe(record.partition().clone(), record.offset());
        self.records.push(record);
    }

    /// Record that an offset was polled without yielding a decodable record.
    pub fn observe(&mut self, partition: Partition, offset: i64) {
        self.observed
            .entry(partition)
            .and_modify(|current| *current = (*current).max(offset))
            .or_insert(offset);
    }

    pub fn records(&self) -> &[Record<K, V>] {
        &self.records
    }

    pub fn partitions(&self) -> BTreeSet<Partition> {
        self.observed.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the poll yielded nothing at all, decodable or not.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.observed.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Vec<Record<K, V>>, HashMap<Partition, i64>) {
        (self.records, self.observed)
    }
}

impl<K, V> Default for PollBatch<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// The quantum handed to the processor: either one partition's slice of a
/// batch, or the whole batch, depending on the dispatch strategy.
#[derive(Debug)]
pub struct ProcessUnit<K, V> {
    index: usize,
    current_partition: Partition,
    all_partitions: BTreeSet<Partition>,
    records: Vec<Record<K, V>>,
    next_offsets: HashMap<Partition, i64>,
}

impl<K, V> ProcessUnit<K, V> {
    pub(crate) fn new(
        index: usize,
        current_partition: Partition,
        all_partitions: BTreeSet<Partition>,
        records: Vec<Record<K, V>>,
        next_offsets: HashMap<Partition, i64>,
    ) -> Self {
        Self {
            index,
            current_partition,
            all_partitions,
            records,
            next_offsets,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn current_partition(&self) -> &Partition {
        &self.current_partition
    }

    pub fn all_partitions(&self) -> &BTreeSet<Partition> {
        &self.all_partitions
    }

    pub fn records(&self) -> &[Record<K, V>] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The offsets the commit engine advances to when this unit succeeds:
    /// highest observed offset per partition, plus one.
    pub fn next_offsets(&self) -> &HashMap<Partition, i64> {
        &self.next_offsets
    }

    pub(crate) fn take_records(&mut self) -> Vec<Record<K, V>> {
        std::mem::take(&mut self.records)
    }
}

/// Returned by the processor on success. The id is opaque to the runner and
/// only surfaced through post-process hooks; the records are advisory.
#[derive(Debug, Clone)]
pub struct ProcessResult<K, V> {
    id: Uuid,
    records: Vec<Record<K, V>>,
}

impl<K, V> ProcessResult<K, V> {
    pub fn new(records: Vec<Record<K, V>>) -> Self {
        Self {
            id: Uuid::new_v4(),
            records,
        }
    }

    pub fn with_id(id: Uuid, records: Vec<Record<K, V>>) -> Self {
        Self { id, records }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn records(&self) -> &[Record<K, V>] {
        &self.records
    }
}

/// Lifecycle states of a consumer runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunnerState {
    New = 0,
    Configured = 1,
    Running = 2,
    Paused = 3,
    Stopping = 4,
    Stopped = 5,
}

impl RunnerState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => RunnerState::New,
            1 => RunnerState::Configured,
            2 => RunnerState::Running,
            3 => RunnerState::Paused,
            4 => RunnerState::Stopping,
            _ => RunnerState::Stopped,
        }
    }

    /// True while the driver loop is alive, paused or not.
    pub fn is_running(&self) -> bool {
        matches!(self, RunnerState::Running | RunnerState::Paused)
    }
}
