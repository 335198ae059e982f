//! In-memory replayable change-log.
//!
//! A `MemoryLog` is a set of partitions, each a totally ordered sequence of
//! records starting at a log start offset. Handles are cheap to clone and
//! share the same partitions, so producers and consumers on different
//! threads see one log. Appends wake consumers blocked in `poll`.

#![allow(clippy::significant_drop_tightening)]

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use bytes::Bytes;
use keel_core::{ConsumerRecord, Offset, Timestamp, TopicPartition};

use crate::consumer::{LogConsumer, LogConsumerConfig};
use crate::error::{SourceError, SourceResult};

/// A record as stored in a partition; its offset is implied by position.
#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Bytes>,
    value: Option<Bytes>,
    timestamp: Timestamp,
}

/// One partition's retained records.
#[derive(Debug, Default)]
pub(crate) struct PartitionLog {
    /// Offset of the first retained record.
    start: Offset,
    /// Retained records; `records[i]` has offset `start + i`.
    records: VecDeque<StoredRecord>,
}

impl PartitionLog {
    fn starting_at(start: Offset) -> Self {
        Self {
            start,
            records: VecDeque::new(),
        }
    }

    /// Returns the first retained offset.
    pub(crate) const fn start(&self) -> Offset {
        self.start
    }

    /// Returns the next offset to be written.
    pub(crate) fn end(&self) -> Offset {
        Offset::new(self.start.get() + self.records.len() as u64)
    }

    /// Returns true if `offset` can be sought to.
    pub(crate) fn contains_position(&self, offset: Offset) -> bool {
        self.start <= offset && offset <= self.end()
    }

    /// Reads up to `max` records starting at `from`.
    ///
    /// `from` must satisfy `contains_position`.
    #[allow(clippy::cast_possible_truncation)] // Bounded by records.len().
    pub(crate) fn read(
        &self,
        partition: &TopicPartition,
        from: Offset,
        max: usize,
    ) -> Vec<ConsumerRecord> {
        debug_assert!(self.contains_position(from));

        let skip = from.distance_from(self.start) as usize;
        self.records
            .iter()
            .enumerate()
            .skip(skip)
            .take(max)
            .map(|(i, stored)| ConsumerRecord {
                partition: partition.clone(),
                offset: Offset::new(self.start.get() + i as u64),
                key: stored.key.clone(),
                value: stored.value.clone(),
                timestamp: stored.timestamp,
            })
            .collect()
    }

    fn push(&mut self, record: StoredRecord) -> Offset {
        let offset = self.end();
        self.records.push_back(record);
        offset
    }

    /// Drops records before `offset`, which must not exceed `end()`.
    fn truncate_before(&mut self, offset: Offset) {
        debug_assert!(offset <= self.end());
        while self.start < offset && self.records.pop_front().is_some() {
            self.start = self.start.next();
        }
    }
}

/// Shared state behind every `MemoryLog` handle.
#[derive(Debug, Default)]
pub(crate) struct LogShared {
    partitions: Mutex<HashMap<TopicPartition, PartitionLog>>,
    appended: Condvar,
}

impl LogShared {
    /// Locks the partition map.
    ///
    /// # Panics
    ///
    /// Panics if the mutex is poisoned.
    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<TopicPartition, PartitionLog>> {
        self.partitions.lock().expect("memory log lock poisoned")
    }

    /// Returns the condition variable signalled on append and wakeup.
    pub(crate) const fn appended(&self) -> &Condvar {
        &self.appended
    }

    /// Wakes every blocked poller.
    ///
    /// Takes the lock first so a poller between its checks and its wait
    /// cannot miss the signal.
    pub(crate) fn notify_all(&self) {
        let _guard = self.lock();
        self.appended.notify_all();
    }
}

/// A shared, in-memory, replayable log of change-log partitions.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    shared: Arc<LogShared>,
}

impl MemoryLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a partition whose first offset is `start`.
    ///
    /// Returns false if the partition already exists.
    pub fn create_partition(&self, partition: TopicPartition, start: Offset) -> bool {
        let mut partitions = self.shared.lock();
        if partitions.contains_key(&partition) {
            return false;
        }
        partitions.insert(partition, PartitionLog::starting_at(start));
        true
    }

    /// Appends a keyed value, creating the partition at offset 0 if needed.
    ///
    /// Returns the offset assigned to the record.
    pub fn append(
        &self,
        partition: &TopicPartition,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Offset {
        self.append_record(partition, Some(key.into()), Some(value.into()))
    }

    /// Appends a tombstone for `key`.
    pub fn append_tombstone(&self, partition: &TopicPartition, key: impl Into<Bytes>) -> Offset {
        self.append_record(partition, Some(key.into()), None)
    }

    /// Appends a raw record.
    pub fn append_record(
        &self,
        partition: &TopicPartition,
        key: Option<Bytes>,
        value: Option<Bytes>,
    ) -> Offset {
        let offset = {
            let mut partitions = self.shared.lock();
            partitions
                .entry(partition.clone())
                .or_default()
                .push(StoredRecord {
                    key,
                    value,
                    timestamp: Timestamp::now(),
                })
        };
        self.shared.appended().notify_all();
        offset
    }

    /// Drops every record before `offset`, advancing the log start.
    ///
    /// # Errors
    /// Returns `UnknownPartition` if the partition does not exist, or
    /// `OffsetOutOfRange` if `offset` is past the log end.
    pub fn truncate_before(&self, partition: &TopicPartition, offset: Offset) -> SourceResult<()> {
        let mut partitions = self.shared.lock();
        let log = partitions
            .get_mut(partition)
            .ok_or_else(|| SourceError::UnknownPartition {
                partition: partition.clone(),
            })?;

        if offset > log.end() {
            return Err(SourceError::OffsetOutOfRange {
                partition: partition.clone(),
                offset,
                start: log.start(),
                end: log.end(),
            });
        }

        log.truncate_before(offset);
        Ok(())
    }

    /// Returns the first retained offset of a partition.
    #[must_use]
    pub fn log_start_offset(&self, partition: &TopicPartition) -> Option<Offset> {
        self.shared.lock().get(partition).map(PartitionLog::start)
    }

    /// Returns the next offset to be written to a partition.
    #[must_use]
    pub fn log_end_offset(&self, partition: &TopicPartition) -> Option<Offset> {
        self.shared.lock().get(partition).map(PartitionLog::end)
    }

    /// Returns every partition in the log.
    #[must_use]
    pub fn partitions(&self) -> BTreeSet<TopicPartition> {
        self.shared.lock().keys().cloned().collect()
    }

    /// Creates a consumer reading from this log.
    #[must_use]
    pub fn consumer(&self, config: LogConsumerConfig) -> LogConsumer {
        LogConsumer::new(self.clone(), config)
    }

    pub(crate) fn shared(&self) -> &Arc<LogShared> {
        &self.shared
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp() -> TopicPartition {
        TopicPartition::new("topic-one", 1)
    }

    #[test]
    fn test_append_assigns_sequential_offsets() {
        let log = MemoryLog::new();
        assert_eq!(log.append(&tp(), "a", "1"), Offset::new(0));
        assert_eq!(log.append(&tp(), "b", "2"), Offset::new(1));
        assert_eq!(log.append_tombstone(&tp(), "a"), Offset::new(2));

        assert_eq!(log.log_start_offset(&tp()), Some(Offset::new(0)));
        assert_eq!(log.log_end_offset(&tp()), Some(Offset::new(3)));
    }

    #[test]
    fn test_create_partition_at_offset() {
        let log = MemoryLog::new();
        assert!(log.create_partition(tp(), Offset::new(20)));
        assert!(!log.create_partition(tp(), Offset::new(0)));

        assert_eq!(log.append(&tp(), "k", "v"), Offset::new(20));
        assert_eq!(log.log_end_offset(&tp()), Some(Offset::new(21)));
    }

    #[test]
    fn test_truncate_before() {
        let log = MemoryLog::new();
        for i in 0..5 {
            log.append(&tp(), format!("k{i}"), "v");
        }

        log.truncate_before(&tp(), Offset::new(3)).unwrap();
        assert_eq!(log.log_start_offset(&tp()), Some(Offset::new(3)));
        assert_eq!(log.log_end_offset(&tp()), Some(Offset::new(5)));

        // Truncating backwards is a no-op.
        log.truncate_before(&tp(), Offset::new(1)).unwrap();
        assert_eq!(log.log_start_offset(&tp()), Some(Offset::new(3)));
    }

    #[test]
    fn test_truncate_past_end_fails() {
        let log = MemoryLog::new();
        log.append(&tp(), "k", "v");

        let err = log.truncate_before(&tp(), Offset::new(2)).unwrap_err();
        assert!(err.is_offset_out_of_range());
    }

    #[test]
    fn test_truncate_unknown_partition_fails() {
        let log = MemoryLog::new();
        let err = log.truncate_before(&tp(), Offset::new(0)).unwrap_err();
        assert_eq!(err, SourceError::UnknownPartition { partition: tp() });
    }

    #[test]
    fn test_partition_read_carries_offsets() {
        let log = MemoryLog::new();
        log.create_partition(tp(), Offset::new(10));
        log.append(&tp(), "a", "1");
        log.append(&tp(), "b", "2");
        log.append(&tp(), "c", "3");

        let partitions = log.shared().lock();
        let records = partitions[&tp()].read(&tp(), Offset::new(11), 10);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].offset, Offset::new(11));
        assert_eq!(records[1].key.as_deref(), Some(b"c".as_slice()));
    }

    #[test]
    fn test_clones_share_partitions() {
        let log = MemoryLog::new();
        let other = log.clone();
        other.append(&tp(), "k", "v");

        assert_eq!(log.partitions().len(), 1);
    }
}
