//! Keel global store restoration binary.
//!
//! Loads change-log files into an in-memory log and replays them into
//! snapshot-backed stores under a state directory, resuming from the last
//! checkpoint if one exists.
//!
//! # Change-log files
//!
//! One record per line. `key<TAB>value` writes a value; a line holding only
//! a key deletes it.
//!
//! # Usage
//!
//! Replay until caught up, then exit:
//!
//! ```bash
//! keel-restore --state-dir /var/lib/keel \
//!     --store users=users-changelog:0:users.log \
//!     --store users=users-changelog:1:users-1.log \
//!     --idle-polls 3
//! ```
//!
//! Without `--idle-polls` the process keeps the stores current until Ctrl-C.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use keel_core::{Offset, TopicPartition};
use keel_log::{LogConsumerConfig, MemoryLog};
use keel_state::{
    CheckpointConfig, GlobalStateThread, GlobalStateThreadConfig, StateConsumer,
    StateConsumerConfig, StoreBinding, StoreMaintainer, StoreMaintainerConfig,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Keel global store restoration.
#[derive(Parser, Debug)]
#[command(name = "keel-restore")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding store snapshots and the offset checkpoint.
    #[arg(long)]
    state_dir: PathBuf,

    /// Store fed by a change-log file, in format `name=topic:partition:file`.
    /// Can be specified multiple times; repeat a name to feed one store from
    /// several partitions.
    #[arg(long = "store", value_parser = parse_store, required = true)]
    stores: Vec<StoreArg>,

    /// Longest a single poll may block, in milliseconds.
    #[arg(long, default_value = "100")]
    poll_timeout_ms: u64,

    /// Minimum time between checkpoints, in milliseconds.
    #[arg(long, default_value = "10000")]
    commit_interval_ms: u64,

    /// Exit after this many consecutive empty polls.
    #[arg(long)]
    idle_polls: Option<u32>,

    /// Delete the state directory on exit.
    #[arg(long)]
    wipe_on_close: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: Level,
}

/// A store fed by one change-log file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StoreArg {
    /// Store name.
    name: String,
    /// Change-log partition the file is loaded into.
    partition: TopicPartition,
    /// Change-log file.
    file: PathBuf,
}

/// Parses a store argument in format `name=topic:partition:file`.
fn parse_store(s: &str) -> Result<StoreArg, String> {
    let (name, source) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid store '{s}', expected 'name=topic:partition:file'"))?;
    if name.is_empty() {
        return Err(format!("empty store name in '{s}'"));
    }

    let parts: Vec<&str> = source.splitn(3, ':').collect();
    if parts.len() != 3 {
        return Err(format!(
            "invalid store '{s}', expected 'name=topic:partition:file'"
        ));
    }

    let topic = parts[0];
    if topic.is_empty() || topic.chars().any(char::is_whitespace) {
        return Err(format!("invalid topic '{topic}' in store '{s}'"));
    }

    let partition: u32 = parts[1]
        .parse()
        .map_err(|_| format!("invalid partition '{}' in store '{s}'", parts[1]))?;

    if parts[2].is_empty() {
        return Err(format!("empty file in store '{s}'"));
    }

    Ok(StoreArg {
        name: name.to_string(),
        partition: TopicPartition::new(topic, partition),
        file: PathBuf::from(parts[2]),
    })
}

/// Appends every line of a change-log file to `partition`.
///
/// Returns the number of records appended.
fn load_changelog(log: &MemoryLog, partition: &TopicPartition, file: &Path) -> io::Result<usize> {
    let text = fs::read_to_string(file)?;
    let mut count = 0;

    for line in text.lines().filter(|line| !line.is_empty()) {
        match line.split_once('\t') {
            Some((key, value)) => {
                log.append(partition, key.to_string(), value.to_string());
            }
            None => {
                log.append_tombstone(partition, line.to_string());
            }
        }
        count += 1;
    }

    Ok(count)
}

/// Groups store arguments into one binding per store.
fn bindings(stores: &[StoreArg]) -> Vec<StoreBinding> {
    let mut partitions: BTreeMap<&str, Vec<TopicPartition>> = BTreeMap::new();
    for arg in stores {
        partitions
            .entry(arg.name.as_str())
            .or_default()
            .push(arg.partition.clone());
    }

    partitions
        .into_iter()
        .map(|(name, partitions)| StoreBinding::persistent(name, partitions))
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the final store counts.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!(
        state_dir = %args.state_dir.display(),
        stores = args.stores.len(),
        idle_polls = ?args.idle_polls,
        wipe_on_close = args.wipe_on_close,
        "Starting Keel restore"
    );

    let log = MemoryLog::new();
    for arg in &args.stores {
        log.create_partition(arg.partition.clone(), Offset::ZERO);
        let records = load_changelog(&log, &arg.partition, &arg.file)
            .map_err(|e| format!("failed to load '{}': {e}", arg.file.display()))?;
        info!(
            store = %arg.name,
            partition = %arg.partition,
            records,
            "Loaded change-log"
        );
    }

    let mut maintainer_config = StoreMaintainerConfig::new(&args.state_dir).with_checkpoint(
        CheckpointConfig::new(Duration::from_millis(args.commit_interval_ms)),
    );
    for binding in bindings(&args.stores) {
        maintainer_config = maintainer_config.with_binding(binding);
    }

    let maintainer = StoreMaintainer::new(maintainer_config)?;
    let readers = maintainer.readers();
    let consumer = StateConsumer::new(
        log.consumer(LogConsumerConfig::default()),
        maintainer,
        StateConsumerConfig::new(Duration::from_millis(args.poll_timeout_ms)),
    );

    let mut thread_config = GlobalStateThreadConfig::default().with_wipe_on_close(args.wipe_on_close);
    if let Some(idle_polls) = args.idle_polls {
        thread_config = thread_config.with_max_idle_polls(idle_polls);
    }

    let thread = GlobalStateThread::start(consumer, thread_config)?;
    let shutdown = thread.shutdown_handle();
    let mut join = tokio::task::spawn_blocking(move || thread.join());

    let summary = tokio::select! {
        result = &mut join => result??,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Received Ctrl-C, shutting down");
            shutdown.shutdown();
            join.await??
        }
    };

    info!(
        poll_cycles = summary.poll_cycles,
        records_applied = summary.records_applied,
        caught_up = summary.caught_up,
        "Restore finished"
    );

    for (name, reader) in &readers {
        println!("{name}\t{}", reader.len());
    }

    Ok(())
}
