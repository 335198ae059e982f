//! State consumer integration tests.
//!
//! The consumption loop over a `MemoryLog` consumer and a `StoreMaintainer`,
//! covering positioning, per-partition application and checkpointing.

// Test-specific lint allowances.
#![allow(clippy::too_many_lines)]
#![allow(clippy::significant_drop_tightening)]

use std::collections::BTreeSet;

use bytes::Bytes;
use keel_core::{ConsumerRecord, Offset, StartPosition};
use keel_log::{AutoOffsetReset, LogConsumer, LogConsumerConfig, MemoryLog, RecordSource};
use keel_state::{
    ConsumerState, GlobalStateMaintainer, InitializationError, OffsetCheckpoint, StateConsumer,
    StateConsumerConfig, StateError, StoreMaintainer,
};

use crate::fixtures::{
    key, seed_checkpoint, seeded_log, topic_one, topic_two, two_store_config, value, STORE_ONE,
    STORE_TWO,
};

type Consumer = StateConsumer<LogConsumer, StoreMaintainer>;

fn consumer(log: &MemoryLog, state_dir: &std::path::Path) -> Consumer {
    consumer_with(log, state_dir, LogConsumerConfig::default())
}

fn consumer_with(
    log: &MemoryLog,
    state_dir: &std::path::Path,
    source_config: LogConsumerConfig,
) -> Consumer {
    StateConsumer::new(
        log.consumer(source_config),
        StoreMaintainer::new(two_store_config(state_dir)).unwrap(),
        StateConsumerConfig::for_testing(),
    )
}

/// Log with `one` and `two` records per partition, checkpointed at 20 / 30.
fn scenario(dir: &tempfile::TempDir, one: usize, two: usize) -> Consumer {
    let state_dir = dir.path().join("state");
    seed_checkpoint(
        &state_dir,
        &[(STORE_ONE, topic_one(), 20), (STORE_TWO, topic_two(), 30)],
    );
    let log = seeded_log(&[(topic_one(), one), (topic_two(), two)]);
    consumer(&log, &state_dir)
}

/// Polls until a cycle applies nothing.
fn drain(consumer: &mut Consumer) -> usize {
    let mut applied = 0;
    // Bounded loop: the log is not appended to concurrently.
    for _ in 0..1_000 {
        let summary = consumer.poll_and_update().unwrap();
        if summary.is_empty() {
            return applied;
        }
        applied += summary.records;
    }
    panic!("log never drained");
}

#[test]
fn test_state_consumer_positions_at_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut consumer = scenario(&dir, 40, 40);

    let starting = consumer.initialize().unwrap();

    assert_eq!(starting[&topic_one()], StartPosition::At(Offset::new(20)));
    assert_eq!(starting[&topic_two()], StartPosition::At(Offset::new(30)));
    let source = consumer.source();
    assert_eq!(
        source.assignment(),
        [topic_one(), topic_two()].into_iter().collect::<BTreeSet<_>>()
    );
    assert_eq!(source.position(&topic_one()).unwrap(), Offset::new(20));
    assert_eq!(source.position(&topic_two()).unwrap(), Offset::new(30));
}

#[test]
fn test_state_consumer_applies_batch_on_one_partition() {
    let dir = tempfile::tempdir().unwrap();
    // topic-one holds 20 and 21 past the checkpoint; topic-two is caught up.
    let mut consumer = scenario(&dir, 22, 30);
    consumer.initialize().unwrap();

    let summary = consumer.poll_and_update().unwrap();

    assert_eq!(summary.records, 2);
    assert_eq!(summary.partitions[&topic_one()], 2);
    assert!(!summary.partitions.contains_key(&topic_two()));

    let maintainer = consumer.maintainer();
    let store = maintainer.reader(STORE_ONE).unwrap();
    assert_eq!(store.get(&key(20)), Some(value(20)));
    assert_eq!(store.get(&key(21)), Some(value(21)));
    assert_eq!(maintainer.checkpoint_count(), 1);
    assert_eq!(maintainer.checkpointed_offsets()[&topic_one()], Offset::new(22));
}

#[test]
fn test_state_consumer_applies_batch_across_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let mut consumer = scenario(&dir, 21, 32);
    consumer.initialize().unwrap();

    let summary = consumer.poll_and_update().unwrap();

    assert_eq!(summary.partitions[&topic_one()], 1);
    assert_eq!(summary.partitions[&topic_two()], 2);
    let maintainer = consumer.maintainer();
    assert_eq!(maintainer.reader(STORE_ONE).unwrap().len(), 1);
    assert_eq!(maintainer.reader(STORE_TWO).unwrap().len(), 2);
    assert_eq!(maintainer.applied_offsets()[&topic_two()], Offset::new(32));
}

#[test]
fn test_state_consumer_fresh_state_replays_everything() {
    let dir = tempfile::tempdir().unwrap();
    let log = seeded_log(&[(topic_one(), 5), (topic_two(), 3)]);
    let mut consumer = consumer(&log, &dir.path().join("state"));

    let starting = consumer.initialize().unwrap();
    assert!(starting.values().all(|offset| *offset == StartPosition::Earliest));

    assert_eq!(drain(&mut consumer), 8);
    assert_eq!(consumer.records_applied(), 8);
    assert_eq!(consumer.maintainer().reader(STORE_ONE).unwrap().len(), 5);
    assert_eq!(consumer.maintainer().reader(STORE_TWO).unwrap().len(), 3);
}

#[test]
fn test_state_consumer_tombstone_deletes_key() {
    let dir = tempfile::tempdir().unwrap();
    let log = seeded_log(&[(topic_one(), 3), (topic_two(), 0)]);
    log.append_tombstone(&topic_one(), key(1));
    log.append(&topic_one(), key(0), "updated");
    let mut consumer = consumer(&log, &dir.path().join("state"));
    consumer.initialize().unwrap();

    drain(&mut consumer);

    let store = consumer.maintainer().reader(STORE_ONE).unwrap();
    assert_eq!(store.len(), 2);
    assert_eq!(store.get(&key(1)), None);
    assert_eq!(store.get(&key(0)), Some(Bytes::from("updated")));
}

#[test]
fn test_state_consumer_one_checkpoint_opportunity_per_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let log = seeded_log(&[(topic_one(), 10), (topic_two(), 10)]);
    let mut consumer = consumer_with(
        &log,
        &dir.path().join("state"),
        LogConsumerConfig::default().with_max_poll_records(4),
    );
    consumer.initialize().unwrap();

    for cycle in 1..=5 {
        consumer.poll_and_update().unwrap();
        // Every cycle moved offsets, so the eager cadence checkpoints once each.
        assert_eq!(consumer.maintainer().checkpoint_count(), cycle);
    }

    // Caught up: an empty cycle has nothing to checkpoint.
    assert!(consumer.poll_and_update().unwrap().is_empty());
    assert_eq!(consumer.maintainer().checkpoint_count(), 5);
}

#[test]
fn test_state_consumer_batches_alternate_partitions() {
    let dir = tempfile::tempdir().unwrap();
    let log = seeded_log(&[(topic_one(), 10), (topic_two(), 10)]);
    let mut consumer = consumer_with(
        &log,
        &dir.path().join("state"),
        LogConsumerConfig::default().with_max_poll_records(3),
    );
    consumer.initialize().unwrap();

    let first = consumer.poll_and_update().unwrap();
    let second = consumer.poll_and_update().unwrap();

    assert_eq!(first.partitions.keys().next(), Some(&topic_one()));
    assert_eq!(second.partitions.get(&topic_two()), Some(&3));
}

#[test]
fn test_state_consumer_checkpoint_file_tracks_next_offset() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");
    let log = seeded_log(&[(topic_one(), 7), (topic_two(), 2)]);
    let mut consumer = consumer(&log, &state_dir);
    consumer.initialize().unwrap();

    drain(&mut consumer);

    let checkpointed = OffsetCheckpoint::in_dir(&state_dir).read().unwrap();
    assert_eq!(checkpointed[&topic_one()], Offset::new(7));
    assert_eq!(checkpointed[&topic_two()], Offset::new(2));
}

#[test]
fn test_state_consumer_seek_past_log_end_fails() {
    let dir = tempfile::tempdir().unwrap();
    // Checkpoint at 20 but topic-one only holds 10 records.
    let mut consumer = scenario(&dir, 10, 40);

    let err = consumer.initialize().unwrap_err();

    assert!(err.is_offset_out_of_range());
    assert!(matches!(
        err,
        StateError::Initialization(InitializationError::Seek { ref partition, offset, .. })
            if *partition == topic_one() && offset == Offset::new(20)
    ));
    assert_eq!(consumer.state(), ConsumerState::Created);
}

#[test]
fn test_state_consumer_seek_before_log_start_fails() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");
    seed_checkpoint(
        &state_dir,
        &[(STORE_ONE, topic_one(), 20), (STORE_TWO, topic_two(), 30)],
    );
    let log = seeded_log(&[(topic_one(), 40), (topic_two(), 40)]);
    log.truncate_before(&topic_one(), Offset::new(25)).unwrap();
    let mut consumer = consumer_with(
        &log,
        &state_dir,
        LogConsumerConfig::new(AutoOffsetReset::None),
    );

    let err = consumer.initialize().unwrap_err();

    assert!(err.is_offset_out_of_range());
    // Nothing was substituted for the rejected offset.
    assert!(consumer.source().position(&topic_one()).is_err());
}

#[test]
fn test_state_consumer_checkpoint_at_zero_is_sought_exactly() {
    // Offsets 0 and 1 are both behind a log start of 4 and must fail alike.
    for checkpointed in [0, 1] {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        seed_checkpoint(
            &state_dir,
            &[(STORE_ONE, topic_one(), checkpointed), (STORE_TWO, topic_two(), 0)],
        );
        let log = seeded_log(&[(topic_one(), 10), (topic_two(), 3)]);
        log.truncate_before(&topic_one(), Offset::new(4)).unwrap();
        let mut consumer = consumer_with(
            &log,
            &state_dir,
            LogConsumerConfig::new(AutoOffsetReset::None),
        );

        let err = consumer.initialize().unwrap_err();

        assert!(err.is_offset_out_of_range(), "checkpoint {checkpointed}: {err}");
        assert!(matches!(
            err,
            StateError::Initialization(InitializationError::Seek { ref partition, offset, .. })
                if *partition == topic_one() && offset == Offset::new(checkpointed)
        ));
        assert!(consumer.source().position(&topic_one()).is_err());
    }
}

#[test]
fn test_state_consumer_earliest_follows_log_start() {
    let dir = tempfile::tempdir().unwrap();
    let log = seeded_log(&[(topic_one(), 10), (topic_two(), 3)]);
    log.truncate_before(&topic_one(), Offset::new(4)).unwrap();
    let mut consumer = consumer(&log, &dir.path().join("state"));

    let starting = consumer.initialize().unwrap();

    assert_eq!(starting[&topic_one()], StartPosition::Earliest);
    assert_eq!(consumer.source().position(&topic_one()).unwrap(), Offset::new(4));
    assert_eq!(consumer.poll_and_update().unwrap().partitions[&topic_one()], 6);
}

#[test]
fn test_state_consumer_retention_past_position_fails_poll() {
    let dir = tempfile::tempdir().unwrap();
    let log = seeded_log(&[(topic_one(), 10), (topic_two(), 10)]);
    let mut consumer = consumer(&log, &dir.path().join("state"));
    consumer.initialize().unwrap();

    log.truncate_before(&topic_one(), Offset::new(5)).unwrap();
    let err = consumer.poll_and_update().unwrap_err();

    assert!(matches!(err, StateError::Poll(_)));
    assert!(err.is_offset_out_of_range());
    assert_eq!(consumer.maintainer().checkpoint_count(), 0);
}

#[test]
fn test_state_consumer_apply_failure_withholds_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let log = seeded_log(&[(topic_one(), 2), (topic_two(), 0)]);
    // A keyless record cannot be routed to a key.
    log.append_record(&topic_one(), None, Some(Bytes::from("orphan")));
    let mut consumer = consumer(&log, &dir.path().join("state"));
    consumer.initialize().unwrap();

    let err = consumer.poll_and_update().unwrap_err();

    match err {
        StateError::Apply { partition, offset, .. } => {
            assert_eq!(partition, topic_one());
            assert_eq!(offset, Offset::new(2));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(consumer.records_applied(), 2);
    assert_eq!(consumer.maintainer().checkpoint_count(), 0);
}

#[test]
fn test_state_consumer_close_releases_both() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");
    let log = seeded_log(&[(topic_one(), 3), (topic_two(), 3)]);
    let mut consumer = consumer(&log, &state_dir);
    consumer.initialize().unwrap();
    drain(&mut consumer);

    consumer.close(false).unwrap();

    assert!(consumer.source().is_closed());
    assert_eq!(consumer.state(), ConsumerState::Closed);
    assert!(state_dir.exists());
    // The maintainer is closed too: it no longer accepts records.
    let record = ConsumerRecord::new(topic_one(), Offset::new(3), "k", "v");
    assert!(consumer.maintainer_mut().update(&record).is_err());

    // Second close is a no-op, even asking for a wipe.
    consumer.close(true).unwrap();
    assert!(state_dir.exists());
}

#[test]
fn test_state_consumer_close_with_wipe_removes_state() {
    let dir = tempfile::tempdir().unwrap();
    let state_dir = dir.path().join("state");
    let log = seeded_log(&[(topic_one(), 3), (topic_two(), 3)]);
    let mut consumer = consumer(&log, &state_dir);
    consumer.initialize().unwrap();
    drain(&mut consumer);

    consumer.close(true).unwrap();

    assert!(!state_dir.exists());
}
