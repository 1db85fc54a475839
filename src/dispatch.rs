use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::config::DispatchStrategy;
use crate::types::{Partition, PollBatch, ProcessUnit, Record};

/// Split a poll batch into process units. Pure: the same batch always yields
/// the same units in the same order.
///
/// `OnePerPartition` produces a unit per partition observed in the batch,
/// indexed in partition order, each carrying that partition's records in
/// broker offset order. A partition whose records all failed to decode yields
/// a record-less unit so its watermark still advances on commit. `All`
/// produces a single unit over the whole batch with the smallest partition as
/// the current one.
pub fn dispatch<K, V>(
    batch: PollBatch<K, V>,
    strategy: DispatchStrategy,
) -> Vec<ProcessUnit<K, V>> {
    let (records, observed) = batch.into_parts();
    let all_partitions: BTreeSet<Partition> = observed.keys().cloned().collect();
    let Some(first_partition) = all_partitions.first().cloned() else {
        return Vec::new();
    };

    match strategy {
        DispatchStrategy::All => {
            let next_offsets: HashMap<Partition, i64> = observed
                .iter()
                .map(|(partition, offset)| (partition.clone(), offset + 1))
                .collect();
            vec![ProcessUnit::new(
                0,
                first_partition,
                all_partitions,
                records,
                next_offsets,
            )]
        }
        DispatchStrategy::OnePerPartition => {
            let mut grouped: BTreeMap<Partition, Vec<Record<K, V>>> = all_partitions
                .iter()
                .map(|partition| (partition.clone(), Vec::new()))
                .collect();
            for record in records {
                if let Some(bucket) = grouped.get_mut(record.partition()) {
                    bucket.push(record);
                }
            }

            grouped
                .into_iter()
                .enumerate()
                .map(|(index, (partition, partition_records))| {
                    let next_offsets =
                        HashMap::from([(partition.clone(), observed[&partition] + 1)]);
                    ProcessUnit::new(
                        index,
                        partition,
                        all_partitions.clone(),
                        partition_records,
                        next_offsets,
                    )
                })
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(partition: i32, offset: i64) -> Record<String, String> {
        Record::new(
            Partition::new("events", partition),
            offset,
            None,
            format!("p{partition}-o{offset}"),
            0,
            HashMap::new(),
        )
    }

    fn batch_of(records: Vec<Record<String, String>>) -> PollBatch<String, String> {
        let mut batch = PollBatch::new();
        for r in records {
            batch.push(r);
        }
        batch
    }

    #[test]
    fn one_per_partition_splits_in_stable_order() {
        let batch = batch_of(vec![
            record(2, 10),
            record(0, 4),
            record(2, 11),
            record(1, 7),
        ]);

        let units = dispatch(batch, DispatchStrategy::OnePerPartition);

        assert_eq!(units.len(), 3);
        for (index, unit) in units.iter().enumerate() {
            assert_eq!(unit.index(), index);
            assert_eq!(unit.all_partitions().len(), 3);
        }
        assert_eq!(units[0].current_partition(), &Partition::new("events", 0));
        assert_eq!(units[2].current_partition(), &Partition::new("events", 2));

        // offset order preserved within the partition
        let offsets: Vec<i64> = units[2].records().iter().map(Record::offset).collect();
        assert_eq!(offsets, vec![10, 11]);
        assert_eq!(
            units[2].next_offsets()[&Partition::new("events", 2)],
            12
        );
    }

    #[test]
    fn all_strategy_yields_a_single_unit() {
        let batch = batch_of(vec![record(3, 1), record(1, 5), record(3, 2)]);

        let units = dispatch(batch, DispatchStrategy::All);

        assert_eq!(units.len(), 1);
        let unit = &units[0];
        assert_eq!(unit.index(), 0);
        assert_eq!(unit.current_partition(), &Partition::new("events", 1));
        assert_eq!(unit.records().len(), 3);
        assert_eq!(unit.next_offsets()[&Partition::new("events", 1)], 6);
        assert_eq!(unit.next_offsets()[&Partition::new("events", 3)], 3);
    }

    #[test]
    fn poison_only_partition_still_gets_a_unit() {
        let mut batch = batch_of(vec![record(0, 1)]);
        batch.observe(Partition::new("events", 1), 9);

        let units = dispatch(batch, DispatchStrategy::OnePerPartition);

        assert_eq!(units.len(), 2);
        assert!(units[1].is_empty());
        assert_eq!(units[1].next_offsets()[&Partition::new("events", 1)], 10);
    }

    #[test]
    fn empty_batch_dispatches_to_nothing() {
        let batch: PollBatch<String, String> = PollBatch::new();
        assert!(dispatch(batch, DispatchStrategy::OnePerPartition).is_empty());
    }

    #[test]
    fn dispatch_is_deterministic() {
        let batch = batch_of(vec![record(5, 0), record(2, 3), record(5, 1)]);

        let first: Vec<_> = dispatch(batch.clone(), DispatchStrategy::OnePerPartition)
            .iter()
            .map(|u| (u.index(), u.current_partition().clone(), u.records().len()))
            .collect();
        let second: Vec<_> = dispatch(batch, DispatchStrategy::OnePerPartition)
            .iter()
            .map(|u| (u.index(), u.current_partition().clone(), u.records().len()))
            .collect();

        assert_eq!(first, second);
    }
}
