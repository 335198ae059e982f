//! State maintainer backed by key/value stores in a state directory.
//!
//! # Layout
//!
//! ```text
//! {state_dir}/
//!   .checkpoint            <- next offset to read per change-log partition
//!   {store}.snapshot       <- one snapshot per persistent store
//! ```
//!
//! # Checkpointing
//!
//! A checkpoint flushes every store and then writes the checkpoint file, so
//! a checkpointed offset never runs ahead of the data on disk. Records
//! applied after the checkpoint are replayed on restart; overwrite semantics
//! make that replay harmless.
//!
//! In-memory stores are never checkpointed and always replay from the
//! earliest offset.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use keel_core::{ConsumerRecord, Limits, Offset, StartPosition, StartingOffsets, TopicPartition};
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointConfig, OffsetCheckpoint};
use crate::clock::{Clock, SystemClock};
use crate::error::{MaintainerError, MaintainerResult};
use crate::maintainer::GlobalStateMaintainer;
use crate::store::{KeyValueStore, MemoryStore, SnapshotStore, StoreReader};

/// A store and the change-log partitions that feed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreBinding {
    /// Store name; also the snapshot file name.
    pub store_name: String,
    /// Change-log partitions replayed into the store.
    pub partitions: Vec<TopicPartition>,
    /// Whether the store is persisted and checkpointed.
    pub persistent: bool,
}

impl StoreBinding {
    /// Binds a persistent, snapshot-backed store.
    #[must_use]
    pub fn persistent(
        store_name: impl Into<String>,
        partitions: impl IntoIterator<Item = TopicPartition>,
    ) -> Self {
        Self {
            store_name: store_name.into(),
            partitions: partitions.into_iter().collect(),
            persistent: true,
        }
    }

    /// Binds an in-memory store.
    #[must_use]
    pub fn in_memory(
        store_name: impl Into<String>,
        partitions: impl IntoIterator<Item = TopicPartition>,
    ) -> Self {
        Self {
            persistent: false,
            ..Self::persistent(store_name, partitions)
        }
    }
}

/// Configuration for a [`StoreMaintainer`].
#[derive(Debug, Clone)]
pub struct StoreMaintainerConfig {
    /// Directory holding snapshots and the checkpoint file.
    pub state_dir: PathBuf,
    /// Stores and their change-log partitions.
    pub bindings: Vec<StoreBinding>,
    /// Checkpoint cadence.
    pub checkpoint: CheckpointConfig,
    /// Record and store limits.
    pub limits: Limits,
    /// Whether snapshots are fsynced before being renamed into place.
    pub sync_on_flush: bool,
}

impl StoreMaintainerConfig {
    /// Creates a config with no stores and default cadence.
    #[must_use]
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            bindings: Vec::new(),
            checkpoint: CheckpointConfig::default(),
            limits: Limits::new(),
            sync_on_flush: true,
        }
    }

    /// Creates a config that checkpoints eagerly and skips fsync.
    #[must_use]
    pub fn for_testing(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint: CheckpointConfig::for_testing(),
            sync_on_flush: false,
            ..Self::new(state_dir)
        }
    }

    /// Adds a store binding.
    #[must_use]
    pub fn with_binding(mut self, binding: StoreBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Sets the checkpoint cadence.
    #[must_use]
    pub const fn with_checkpoint(mut self, checkpoint: CheckpointConfig) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    /// Sets the limits.
    #[must_use]
    pub const fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Checks that store names are usable and each partition feeds one store.
    ///
    /// # Errors
    /// Returns `InvalidConfig` describing the first problem found.
    pub fn validate(&self) -> MaintainerResult<()> {
        self.limits.validate()?;

        let mut names = BTreeMap::new();
        let mut owners: HashMap<&TopicPartition, &str> = HashMap::new();

        for binding in &self.bindings {
            let name = binding.store_name.as_str();
            if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
                return Err(MaintainerError::InvalidConfig {
                    message: format!("invalid store name {name:?}"),
                });
            }
            if names.insert(name, ()).is_some() {
                return Err(MaintainerError::InvalidConfig {
                    message: format!("store {name} is bound twice"),
                });
            }
            if binding.partitions.is_empty() {
                return Err(MaintainerError::InvalidConfig {
                    message: format!("store {name} has no change-log partitions"),
                });
            }
            for tp in &binding.partitions {
                if let Some(owner) = owners.insert(tp, name) {
                    return Err(MaintainerError::InvalidConfig {
                        message: format!("partition {tp} feeds both {owner} and {name}"),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Lifecycle of a [`StoreMaintainer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Initialized,
    Closed,
}

/// [`GlobalStateMaintainer`] over key/value stores and a checkpoint file.
pub struct StoreMaintainer {
    config: StoreMaintainerConfig,
    clock: Arc<dyn Clock>,
    checkpoint_file: OffsetCheckpoint,
    /// Open stores by name.
    stores: BTreeMap<String, Box<dyn KeyValueStore>>,
    /// Persistent stores that had no snapshot when opened.
    missing_snapshots: BTreeSet<String>,
    /// Store name fed by each partition.
    routes: HashMap<TopicPartition, String>,
    /// Next offset to read per partition, as applied.
    offsets: BTreeMap<TopicPartition, Offset>,
    /// Offsets as of the last checkpoint.
    checkpointed: BTreeMap<TopicPartition, Offset>,
    /// Time of the last checkpoint, in microseconds.
    last_checkpoint_us: u64,
    /// Number of checkpoints written.
    checkpoint_count: u64,
    phase: Phase,
}

impl StoreMaintainer {
    /// Creates a maintainer using the system clock.
    ///
    /// Stores are opened, and their snapshots loaded, right away so readers
    /// can be handed out before the maintainer moves to the loop thread.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the configuration is inconsistent, or a
    /// store error if a snapshot cannot be loaded.
    pub fn new(config: StoreMaintainerConfig) -> MaintainerResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Creates a maintainer reading time from `clock`.
    ///
    /// # Errors
    /// Same as [`StoreMaintainer::new`].
    pub fn with_clock(config: StoreMaintainerConfig, clock: Arc<dyn Clock>) -> MaintainerResult<Self> {
        config.validate()?;

        let mut stores = BTreeMap::new();
        let mut missing_snapshots = BTreeSet::new();
        for binding in &config.bindings {
            if binding.persistent
                && !SnapshotStore::snapshot_path(&config.state_dir, &binding.store_name).exists()
            {
                missing_snapshots.insert(binding.store_name.clone());
            }
            stores.insert(binding.store_name.clone(), open_store(&config, binding)?);
        }

        let routes = config
            .bindings
            .iter()
            .flat_map(|binding| {
                binding
                    .partitions
                    .iter()
                    .map(move |tp| (tp.clone(), binding.store_name.clone()))
            })
            .collect();

        Ok(Self {
            checkpoint_file: OffsetCheckpoint::in_dir(&config.state_dir),
            config,
            clock,
            stores,
            missing_snapshots,
            routes,
            offsets: BTreeMap::new(),
            checkpointed: BTreeMap::new(),
            last_checkpoint_us: 0,
            checkpoint_count: 0,
            phase: Phase::Created,
        })
    }

    /// Returns the state directory.
    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.config.state_dir
    }

    /// Returns a reader for store `name`.
    #[must_use]
    pub fn reader(&self, name: &str) -> Option<StoreReader> {
        self.stores.get(name).map(|store| store.reader())
    }

    /// Returns readers for every store.
    #[must_use]
    pub fn readers(&self) -> BTreeMap<String, StoreReader> {
        self.stores
            .iter()
            .map(|(name, store)| (name.clone(), store.reader()))
            .collect()
    }

    /// Returns the next offset to read per partition, as applied so far.
    #[must_use]
    pub const fn applied_offsets(&self) -> &BTreeMap<TopicPartition, Offset> {
        &self.offsets
    }

    /// Returns the offsets recorded by the last checkpoint.
    #[must_use]
    pub const fn checkpointed_offsets(&self) -> &BTreeMap<TopicPartition, Offset> {
        &self.checkpointed
    }

    /// Returns how many checkpoints were written.
    #[must_use]
    pub const fn checkpoint_count(&self) -> u64 {
        self.checkpoint_count
    }

    fn ensure_initialized(&self) -> MaintainerResult<()> {
        match self.phase {
            Phase::Initialized => Ok(()),
            Phase::Created => Err(MaintainerError::InvalidState {
                state: "not initialized",
            }),
            Phase::Closed => Err(MaintainerError::InvalidState { state: "closed" }),
        }
    }

    /// Offset delta since the last checkpoint, summed over partitions.
    fn pending_delta(&self) -> u64 {
        self.offsets
            .iter()
            .map(|(tp, offset)| {
                let base = self.checkpointed.get(tp).copied().unwrap_or_default();
                offset.distance_from(base)
            })
            .sum()
    }

    /// Flushes every store, then records offsets of persistent stores.
    fn checkpoint(&mut self) -> MaintainerResult<()> {
        for store in self.stores.values_mut() {
            store.flush()?;
        }

        let persisted: BTreeMap<TopicPartition, Offset> = self
            .offsets
            .iter()
            .filter(|(tp, _)| {
                self.routes
                    .get(*tp)
                    .and_then(|name| self.stores.get(name))
                    .is_some_and(|store| store.persistent())
            })
            .map(|(tp, offset)| (tp.clone(), *offset))
            .collect();
        self.checkpoint_file.write(&persisted)?;

        self.checkpointed = self.offsets.clone();
        self.last_checkpoint_us = self.clock.now_us();
        self.checkpoint_count += 1;

        debug!(
            partitions = persisted.len(),
            count = self.checkpoint_count,
            "Wrote checkpoint"
        );
        Ok(())
    }

    fn wipe(&self) -> MaintainerResult<()> {
        for reader in self.readers().values() {
            reader.clear();
        }

        // The checkpoint goes first: if removal stops halfway, the next start
        // replays every partition from the earliest offset.
        self.checkpoint_file.delete()?;

        match fs::remove_dir_all(&self.config.state_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MaintainerError::Io {
                operation: "wipe_state_dir",
                message: format!(
                    "failed to remove '{}': {e}",
                    self.config.state_dir.display()
                ),
            }),
        }
    }
}

fn open_store(
    config: &StoreMaintainerConfig,
    binding: &StoreBinding,
) -> MaintainerResult<Box<dyn KeyValueStore>> {
    let max_entries = config.limits.max_store_entries;
    if !binding.persistent {
        return Ok(Box::new(MemoryStore::new(&binding.store_name, max_entries)));
    }

    let store = SnapshotStore::open(&config.state_dir, &binding.store_name, max_entries)?;
    Ok(Box::new(if config.sync_on_flush {
        store
    } else {
        store.without_sync()
    }))
}

impl GlobalStateMaintainer for StoreMaintainer {
    type Error = MaintainerError;

    fn initialize(&mut self) -> MaintainerResult<StartingOffsets> {
        if self.phase != Phase::Created {
            return Err(MaintainerError::InvalidState {
                state: "already initialized",
            });
        }

        fs::create_dir_all(&self.config.state_dir).map_err(|e| MaintainerError::Io {
            operation: "create_state_dir",
            message: format!(
                "failed to create '{}': {e}",
                self.config.state_dir.display()
            ),
        })?;

        let checkpointed = self.checkpoint_file.read()?;
        for tp in checkpointed.keys().filter(|tp| !self.routes.contains_key(*tp)) {
            warn!(partition = %tp, "Ignoring checkpoint for partition that feeds no store");
        }

        let mut starting = StartingOffsets::new();
        for binding in &self.config.bindings {
            let snapshot_exists = !self.missing_snapshots.contains(&binding.store_name);

            for tp in &binding.partitions {
                let position = match checkpointed.get(tp) {
                    Some(&offset) if binding.persistent && snapshot_exists => {
                        StartPosition::At(offset)
                    }
                    Some(&offset) if binding.persistent => {
                        warn!(
                            store = %binding.store_name,
                            partition = %tp,
                            checkpointed = offset.get(),
                            "Snapshot missing for checkpointed store, replaying from earliest"
                        );
                        StartPosition::Earliest
                    }
                    _ => StartPosition::Earliest,
                };
                starting.insert(tp.clone(), position);
            }
        }

        // Partitions replayed from the earliest offset get an entry once
        // their first record is applied.
        self.offsets = starting
            .iter()
            .filter_map(|(tp, position)| position.offset().map(|offset| (tp.clone(), offset)))
            .collect();
        self.checkpointed = self.offsets.clone();
        self.last_checkpoint_us = self.clock.now_us();
        self.phase = Phase::Initialized;

        info!(
            state_dir = %self.config.state_dir.display(),
            stores = self.stores.len(),
            partitions = starting.len(),
            "Global stores initialized"
        );
        Ok(starting)
    }

    fn update(&mut self, record: &ConsumerRecord) -> MaintainerResult<()> {
        self.ensure_initialized()?;

        let name = self
            .routes
            .get(&record.partition)
            .ok_or_else(|| MaintainerError::UnknownPartition {
                partition: record.partition.clone(),
            })?;
        let key = record.key.clone().ok_or_else(|| MaintainerError::MissingKey {
            partition: record.partition.clone(),
            offset: record.offset,
        })?;
        record.validate(&self.config.limits)?;

        let store = self
            .stores
            .get_mut(name)
            .ok_or(MaintainerError::InvalidState {
                state: "missing store",
            })?;
        match &record.value {
            Some(value) => store.put(key, value.clone())?,
            None => {
                store.delete(&key)?;
            }
        }

        // A replayed record never moves the applied position backwards.
        let next = record.offset.next();
        self.offsets
            .entry(record.partition.clone())
            .and_modify(|applied| *applied = (*applied).max(next))
            .or_insert(next);
        Ok(())
    }

    fn maybe_checkpoint(&mut self) -> MaintainerResult<()> {
        self.ensure_initialized()?;

        let delta = self.pending_delta();
        if delta == 0 {
            return Ok(());
        }

        let elapsed_us = self.clock.now_us().saturating_sub(self.last_checkpoint_us);
        let interval_us =
            u64::try_from(self.config.checkpoint.commit_interval.as_micros()).unwrap_or(u64::MAX);

        if elapsed_us >= interval_us || delta >= self.config.checkpoint.offset_delta_threshold {
            self.checkpoint()?;
        }
        Ok(())
    }

    fn close(&mut self, wipe_state_store: bool) -> MaintainerResult<()> {
        if self.phase == Phase::Closed {
            return Ok(());
        }
        let was_initialized = self.phase == Phase::Initialized;
        self.phase = Phase::Closed;

        let mut first_error = None;

        if was_initialized && !wipe_state_store && self.pending_delta() > 0 {
            if let Err(e) = self.checkpoint() {
                warn!(error = %e, "Final checkpoint failed");
                first_error.get_or_insert(e);
            }
        }

        for (name, store) in &mut self.stores {
            if let Err(e) = store.close() {
                warn!(store = %name, error = %e, "Failed to close store");
                first_error.get_or_insert(e.into());
            }
        }

        if wipe_state_store {
            if let Err(e) = self.wipe() {
                warn!(error = %e, "Failed to wipe state directory");
                first_error.get_or_insert(e);
            }
        }

        info!(
            state_dir = %self.config.state_dir.display(),
            wiped = wipe_state_store,
            "Global stores closed"
        );

        first_error.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for StoreMaintainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreMaintainer")
            .field("state_dir", &self.config.state_dir)
            .field("stores", &self.stores.keys().collect::<Vec<_>>())
            .field("offsets", &self.offsets)
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::clock::ManualClock;

    fn topic_one() -> TopicPartition {
        TopicPartition::new("topic-one", 1)
    }

    fn topic_two() -> TopicPartition {
        TopicPartition::new("topic-two", 1)
    }

    fn config(dir: &Path) -> StoreMaintainerConfig {
        StoreMaintainerConfig::for_testing(dir.join("state"))
            .with_binding(StoreBinding::persistent("users", [topic_one()]))
            .with_binding(StoreBinding::in_memory("sessions", [topic_two()]))
    }

    fn record(tp: &TopicPartition, offset: u64, key: &str, value: &str) -> ConsumerRecord {
        ConsumerRecord::new(tp.clone(), Offset::new(offset), key.to_string(), value.to_string())
    }

    #[test]
    fn test_fresh_state_starts_at_earliest() {
        let dir = tempfile::tempdir().unwrap();
        let mut maintainer = StoreMaintainer::new(config(dir.path())).unwrap();

        let starting = maintainer.initialize().unwrap();
        assert_eq!(starting.len(), 2);
        assert_eq!(starting[&topic_one()], StartPosition::Earliest);
        assert_eq!(starting[&topic_two()], StartPosition::Earliest);
        assert!(maintainer.state_dir().exists());
    }

    #[test]
    fn test_update_routes_puts_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let mut maintainer = StoreMaintainer::new(config(dir.path())).unwrap();
        maintainer.initialize().unwrap();

        maintainer.update(&record(&topic_one(), 0, "alice", "1")).unwrap();
        maintainer.update(&record(&topic_one(), 1, "bob", "2")).unwrap();
        maintainer
            .update(&ConsumerRecord::tombstone(topic_one(), Offset::new(2), "alice"))
            .unwrap();
        maintainer.update(&record(&topic_two(), 0, "s1", "x")).unwrap();

        let users = maintainer.reader("users").unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users.get(b"bob"), Some(Bytes::from("2")));
        assert_eq!(maintainer.reader("sessions").unwrap().len(), 1);
        assert_eq!(maintainer.applied_offsets()[&topic_one()], Offset::new(3));
    }

    #[test]
    fn test_update_is_replay_tolerant() {
        let dir = tempfile::tempdir().unwrap();
        let mut maintainer = StoreMaintainer::new(config(dir.path())).unwrap();
        maintainer.initialize().unwrap();

        let r = record(&topic_one(), 0, "alice", "1");
        maintainer.update(&r).unwrap();
        maintainer.update(&r).unwrap();

        let users = maintainer.reader("users").unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users.get(b"alice"), Some(Bytes::from("1")));
    }

    #[test]
    fn test_replayed_record_keeps_applied_offset() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new();
        let cfg = config(dir.path()).with_checkpoint(
            CheckpointConfig::new(Duration::from_secs(3600)).with_offset_delta_threshold(3),
        );
        let mut maintainer = StoreMaintainer::with_clock(cfg, Arc::new(clock)).unwrap();
        maintainer.initialize().unwrap();

        for offset in 0..3 {
            maintainer.update(&record(&topic_one(), offset, "k", "v")).unwrap();
        }
        maintainer.update(&record(&topic_one(), 0, "k", "v")).unwrap();
        assert_eq!(maintainer.applied_offsets()[&topic_one()], Offset::new(3));

        // The delta still counts all three records.
        maintainer.maybe_checkpoint().unwrap();
        assert_eq!(maintainer.checkpoint_count(), 1);
        assert_eq!(maintainer.checkpointed_offsets()[&topic_one()], Offset::new(3));
    }

    #[test]
    fn test_update_rejects_unknown_partition_and_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut maintainer = StoreMaintainer::new(config(dir.path())).unwrap();
        maintainer.initialize().unwrap();

        let stray = record(&TopicPartition::new("other", 0), 0, "k", "v");
        assert!(matches!(
            maintainer.update(&stray),
            Err(MaintainerError::UnknownPartition { .. })
        ));

        let mut keyless = record(&topic_one(), 0, "k", "v");
        keyless.key = None;
        assert!(matches!(
            maintainer.update(&keyless),
            Err(MaintainerError::MissingKey { .. })
        ));
    }

    #[test]
    fn test_update_before_initialize_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut maintainer = StoreMaintainer::new(config(dir.path())).unwrap();

        let err = maintainer.update(&record(&topic_one(), 0, "k", "v")).unwrap_err();
        assert!(matches!(err, MaintainerError::InvalidState { .. }));
    }

    #[test]
    fn test_checkpoint_resumes_after_restart() {
        let dir = tempfile::tempdir().unwrap();

        let mut maintainer = StoreMaintainer::new(config(dir.path())).unwrap();
        maintainer.initialize().unwrap();
        maintainer.update(&record(&topic_one(), 0, "alice", "1")).unwrap();
        maintainer.update(&record(&topic_one(), 1, "bob", "2")).unwrap();
        maintainer.update(&record(&topic_two(), 0, "s1", "x")).unwrap();
        maintainer.maybe_checkpoint().unwrap();
        assert_eq!(maintainer.checkpoint_count(), 1);
        maintainer.close(false).unwrap();

        let mut restarted = StoreMaintainer::new(config(dir.path())).unwrap();
        let starting = restarted.initialize().unwrap();

        assert_eq!(starting[&topic_one()], StartPosition::At(Offset::new(2)));
        // In-memory stores always replay from the beginning.
        assert_eq!(starting[&topic_two()], StartPosition::Earliest);
        assert_eq!(restarted.reader("users").unwrap().len(), 2);
        assert!(restarted.reader("sessions").unwrap().is_empty());
    }

    #[test]
    fn test_close_writes_final_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path()).with_checkpoint(CheckpointConfig::new(Duration::from_secs(3600)));

        let mut maintainer = StoreMaintainer::new(cfg.clone()).unwrap();
        maintainer.initialize().unwrap();
        maintainer.update(&record(&topic_one(), 0, "alice", "1")).unwrap();
        maintainer.close(false).unwrap();

        let mut restarted = StoreMaintainer::new(cfg).unwrap();
        assert_eq!(
            restarted.initialize().unwrap()[&topic_one()],
            StartPosition::At(Offset::new(1))
        );
    }

    #[test]
    fn test_wipe_forces_replay_from_earliest() {
        let dir = tempfile::tempdir().unwrap();

        let mut maintainer = StoreMaintainer::new(config(dir.path())).unwrap();
        maintainer.initialize().unwrap();
        maintainer.update(&record(&topic_one(), 0, "alice", "1")).unwrap();
        maintainer.maybe_checkpoint().unwrap();
        let users = maintainer.reader("users").unwrap();
        maintainer.close(true).unwrap();
        assert!(!maintainer.state_dir().exists());
        assert!(users.is_empty());

        let mut restarted = StoreMaintainer::new(config(dir.path())).unwrap();
        let starting = restarted.initialize().unwrap();
        assert_eq!(starting[&topic_one()], StartPosition::Earliest);
        assert!(restarted.reader("users").unwrap().is_empty());
    }

    #[test]
    fn test_close_is_idempotent_and_allowed_before_initialize() {
        let dir = tempfile::tempdir().unwrap();
        let mut maintainer = StoreMaintainer::new(config(dir.path())).unwrap();

        maintainer.close(false).unwrap();
        maintainer.close(true).unwrap();
        assert!(matches!(
            maintainer.initialize(),
            Err(MaintainerError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_checkpoint_waits_for_interval() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new();
        let cfg = config(dir.path()).with_checkpoint(
            CheckpointConfig::new(Duration::from_secs(10)).with_offset_delta_threshold(100),
        );
        let mut maintainer = StoreMaintainer::with_clock(cfg, Arc::new(clock.clone())).unwrap();
        maintainer.initialize().unwrap();

        maintainer.update(&record(&topic_one(), 0, "a", "1")).unwrap();
        maintainer.maybe_checkpoint().unwrap();
        assert_eq!(maintainer.checkpoint_count(), 0);

        clock.advance(Duration::from_secs(10));
        maintainer.maybe_checkpoint().unwrap();
        assert_eq!(maintainer.checkpoint_count(), 1);
        assert_eq!(maintainer.checkpointed_offsets()[&topic_one()], Offset::new(1));

        // Nothing moved: no checkpoint even though the interval passed.
        clock.advance(Duration::from_secs(10));
        maintainer.maybe_checkpoint().unwrap();
        assert_eq!(maintainer.checkpoint_count(), 1);
    }

    #[test]
    fn test_checkpoint_on_offset_delta() {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::new();
        let cfg = config(dir.path()).with_checkpoint(
            CheckpointConfig::new(Duration::from_secs(3600)).with_offset_delta_threshold(3),
        );
        let mut maintainer = StoreMaintainer::with_clock(cfg, Arc::new(clock)).unwrap();
        maintainer.initialize().unwrap();

        maintainer.update(&record(&topic_one(), 0, "a", "1")).unwrap();
        maintainer.update(&record(&topic_one(), 1, "b", "1")).unwrap();
        maintainer.maybe_checkpoint().unwrap();
        assert_eq!(maintainer.checkpoint_count(), 0);

        maintainer.update(&record(&topic_two(), 0, "c", "1")).unwrap();
        maintainer.maybe_checkpoint().unwrap();
        assert_eq!(maintainer.checkpoint_count(), 1);
    }

    #[test]
    fn test_missing_snapshot_ignores_checkpoint() {
        let dir = tempfile::tempdir().unwrap();

        let mut maintainer = StoreMaintainer::new(config(dir.path())).unwrap();
        maintainer.initialize().unwrap();
        maintainer.update(&record(&topic_one(), 0, "alice", "1")).unwrap();
        maintainer.close(false).unwrap();

        fs::remove_file(SnapshotStore::snapshot_path(&dir.path().join("state"), "users")).unwrap();

        let mut restarted = StoreMaintainer::new(config(dir.path())).unwrap();
        assert_eq!(
            restarted.initialize().unwrap()[&topic_one()],
            StartPosition::Earliest
        );
    }

    #[test]
    fn test_stale_checkpoint_entries_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        fs::create_dir_all(&state_dir).unwrap();
        OffsetCheckpoint::in_dir(&state_dir)
            .write(&[(TopicPartition::new("retired", 0), Offset::new(9))].into_iter().collect())
            .unwrap();

        let mut maintainer = StoreMaintainer::new(config(dir.path())).unwrap();
        let starting = maintainer.initialize().unwrap();
        assert!(!starting.contains_key(&TopicPartition::new("retired", 0)));
    }

    #[test]
    fn test_config_validation() {
        let dup_partition = StoreMaintainerConfig::new("/tmp/x")
            .with_binding(StoreBinding::persistent("a", [topic_one()]))
            .with_binding(StoreBinding::persistent("b", [topic_one()]));
        assert!(matches!(
            dup_partition.validate(),
            Err(MaintainerError::InvalidConfig { .. })
        ));

        let dup_store = StoreMaintainerConfig::new("/tmp/x")
            .with_binding(StoreBinding::persistent("a", [topic_one()]))
            .with_binding(StoreBinding::persistent("a", [topic_two()]));
        assert!(dup_store.validate().is_err());

        let bad_name = StoreMaintainerConfig::new("/tmp/x")
            .with_binding(StoreBinding::persistent("../a", [topic_one()]));
        assert!(bad_name.validate().is_err());

        let no_partitions = StoreMaintainerConfig::new("/tmp/x")
            .with_binding(StoreBinding::persistent("a", []));
        assert!(no_partitions.validate().is_err());
    }
}
