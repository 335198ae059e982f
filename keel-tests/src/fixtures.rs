//! Shared fixtures for integration tests.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use keel_core::{ConsumerRecord, Offset, TopicPartition};
use keel_log::{MemoryLog, RecordSource, SourceError, SourceResult, WakeupHandle};
use keel_state::{
    KeyValueStore, OffsetCheckpoint, SnapshotStore, StoreBinding, StoreMaintainerConfig,
};
use tracing::debug;

/// Store fed by [`topic_one`].
pub const STORE_ONE: &str = "store-one";
/// Store fed by [`topic_two`].
pub const STORE_TWO: &str = "store-two";

/// First change-log partition.
#[must_use]
pub fn topic_one() -> TopicPartition {
    TopicPartition::new("topic-one", 1)
}

/// Second change-log partition.
#[must_use]
pub fn topic_two() -> TopicPartition {
    TopicPartition::new("topic-two", 1)
}

/// Key of the `i`th seeded record.
#[must_use]
pub fn key(i: usize) -> Bytes {
    Bytes::from(format!("key-{i}"))
}

/// Value of the `i`th seeded record.
#[must_use]
pub fn value(i: usize) -> Bytes {
    Bytes::from(format!("value-{i}"))
}

/// Creates a log where each partition holds `count` records keyed
/// `key-0..key-{count}`.
#[must_use]
pub fn seeded_log(partitions: &[(TopicPartition, usize)]) -> MemoryLog {
    let log = MemoryLog::new();
    for (tp, count) in partitions {
        log.create_partition(tp.clone(), Offset::ZERO);
        append_range(&log, tp, 0..*count);
    }
    log
}

/// Appends records `key-i`/`value-i` for every `i` in `range`.
pub fn append_range(log: &MemoryLog, tp: &TopicPartition, range: std::ops::Range<usize>) {
    for i in range {
        log.append(tp, key(i), value(i));
    }
}

/// Persistent [`STORE_ONE`] on [`topic_one`] and [`STORE_TWO`] on
/// [`topic_two`], checkpointing every cycle.
#[must_use]
pub fn two_store_config(state_dir: &Path) -> StoreMaintainerConfig {
    StoreMaintainerConfig::for_testing(state_dir)
        .with_binding(StoreBinding::persistent(STORE_ONE, [topic_one()]))
        .with_binding(StoreBinding::persistent(STORE_TWO, [topic_two()]))
}

/// Leaves `state_dir` as a previous run would have: an empty snapshot per
/// store and a checkpoint at the given next offsets.
///
/// # Panics
///
/// Panics if the state directory cannot be written.
pub fn seed_checkpoint(state_dir: &Path, entries: &[(&str, TopicPartition, u64)]) {
    std::fs::create_dir_all(state_dir).expect("create state dir");

    for (store_name, _, _) in entries {
        let mut store =
            SnapshotStore::open(state_dir, store_name, u64::MAX).expect("open snapshot store");
        // Touch the store so flush writes an (empty) snapshot.
        store.put(Bytes::from_static(b"seed"), Bytes::new()).expect("put");
        store.delete(b"seed").expect("delete");
        store.close().expect("close snapshot store");
    }

    let offsets = entries
        .iter()
        .map(|(_, tp, offset)| (tp.clone(), Offset::new(*offset)))
        .collect();
    OffsetCheckpoint::in_dir(state_dir)
        .write(&offsets)
        .expect("write checkpoint");
}

/// Faults a [`FaultySource`] injects.
#[derive(Debug, Clone, Default)]
pub struct SourceFaultConfig {
    /// Fail every poll after this many successful polls.
    pub fail_poll_after: Option<u64>,
    /// Error returned by failing polls. Defaults to `Closed`.
    pub poll_error: Option<SourceError>,
    /// Fail `close` after closing the inner source.
    pub fail_close: bool,
}

impl SourceFaultConfig {
    /// Fails polls after `polls` successful ones with `error`.
    #[must_use]
    pub const fn poll_fails_after(polls: u64, error: SourceError) -> Self {
        Self {
            fail_poll_after: Some(polls),
            poll_error: Some(error),
            fail_close: false,
        }
    }

    /// Fails `close`.
    #[must_use]
    pub const fn close_fails() -> Self {
        Self {
            fail_poll_after: None,
            poll_error: None,
            fail_close: true,
        }
    }
}

/// Call counters of a [`FaultySource`], readable after it moved away.
#[derive(Debug, Default)]
pub struct SourceStats {
    /// Polls attempted.
    pub polls: AtomicU64,
    /// Closes attempted.
    pub closes: AtomicU64,
}

impl SourceStats {
    /// Returns the polls attempted.
    pub fn polls(&self) -> u64 {
        self.polls.load(Ordering::SeqCst)
    }

    /// Returns the closes attempted.
    pub fn closes(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Record source that delegates to another and injects faults.
#[derive(Debug)]
pub struct FaultySource<S> {
    inner: S,
    faults: SourceFaultConfig,
    stats: Arc<SourceStats>,
}

impl<S: RecordSource> FaultySource<S> {
    /// Wraps `inner`.
    pub fn new(inner: S, faults: SourceFaultConfig) -> Self {
        Self {
            inner,
            faults,
            stats: Arc::new(SourceStats::default()),
        }
    }

    /// Returns the shared call counters.
    #[must_use]
    pub fn stats(&self) -> Arc<SourceStats> {
        Arc::clone(&self.stats)
    }
}

impl<S: RecordSource> RecordSource for FaultySource<S> {
    fn assign(&mut self, partitions: BTreeSet<TopicPartition>) -> SourceResult<()> {
        self.inner.assign(partitions)
    }

    fn assignment(&self) -> BTreeSet<TopicPartition> {
        self.inner.assignment()
    }

    fn seek(&mut self, partition: &TopicPartition, offset: Offset) -> SourceResult<()> {
        self.inner.seek(partition, offset)
    }

    fn seek_to_beginning(&mut self, partition: &TopicPartition) -> SourceResult<Offset> {
        self.inner.seek_to_beginning(partition)
    }

    fn position(&self, partition: &TopicPartition) -> SourceResult<Offset> {
        self.inner.position(partition)
    }

    fn poll(&mut self, timeout: Duration) -> SourceResult<Vec<ConsumerRecord>> {
        let attempted = self.stats.polls.fetch_add(1, Ordering::SeqCst);
        if self.faults.fail_poll_after.is_some_and(|n| attempted >= n) {
            let error = self.faults.poll_error.clone().unwrap_or(SourceError::Closed);
            debug!(poll = attempted, error = %error, "Injecting poll fault");
            return Err(error);
        }
        self.inner.poll(timeout)
    }

    fn wakeup_handle(&self) -> WakeupHandle {
        self.inner.wakeup_handle()
    }

    fn close(&mut self) -> SourceResult<()> {
        self.stats.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close()?;
        if self.faults.fail_close {
            debug!("Injecting close fault");
            return Err(SourceError::Closed);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}
