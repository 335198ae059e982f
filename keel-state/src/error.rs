//! State restoration error types.

use std::path::PathBuf;

use keel_core::{Offset, TopicPartition};
use keel_log::SourceError;
use thiserror::Error;

use crate::consumer::ConsumerState;

/// Boxed error raised by a state maintainer.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for state-consumption operations.
pub type StateResult<T> = Result<T, StateError>;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for checkpoint file operations.
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Result type for [`StoreMaintainer`](crate::StoreMaintainer) operations.
pub type MaintainerResult<T> = Result<T, MaintainerError>;

/// Errors raised by the state-consumption loop.
#[derive(Debug, Error)]
pub enum StateError {
    /// The loop could not be positioned at its starting offsets.
    #[error("initialization failed: {0}")]
    Initialization(#[from] InitializationError),

    /// The record source failed to poll.
    #[error("poll failed: {0}")]
    Poll(#[source] SourceError),

    /// The maintainer failed to apply a record.
    #[error("failed to apply record {partition}@{offset}: {source}")]
    Apply {
        /// Partition of the record.
        partition: TopicPartition,
        /// Offset of the record.
        offset: Offset,
        /// Maintainer error.
        source: BoxError,
    },

    /// The maintainer failed to checkpoint.
    #[error("checkpoint failed: {0}")]
    Checkpoint(#[source] BoxError),

    /// One or both collaborators failed to close.
    #[error(
        "close failed: record source: {}, state maintainer: {}",
        describe(.source_error.as_ref()),
        describe(.maintainer_error.as_ref())
    )]
    Close {
        /// Record source close failure, if any.
        source_error: Option<SourceError>,
        /// Maintainer close failure, if any.
        maintainer_error: Option<BoxError>,
    },

    /// The operation is not allowed in the current lifecycle state.
    #[error("cannot {operation} in state {state:?}")]
    InvalidState {
        /// Operation attempted.
        operation: &'static str,
        /// Current lifecycle state.
        state: ConsumerState,
    },

    /// The loop thread could not be spawned.
    #[error("failed to spawn global state thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),

    /// The loop thread panicked.
    #[error("global state thread panicked")]
    ThreadPanicked,
}

impl StateError {
    /// Returns true if the error means a position is no longer retained by
    /// the log, so local state cannot be brought up to date by replay.
    #[must_use]
    pub fn is_offset_out_of_range(&self) -> bool {
        match self {
            Self::Initialization(
                InitializationError::Assign(source)
                | InitializationError::Seek { source, .. }
                | InitializationError::SeekToBeginning { source, .. },
            )
            | Self::Poll(source) => source.is_offset_out_of_range(),
            _ => false,
        }
    }
}

fn describe<E: std::fmt::Display + ?Sized>(error: Option<&E>) -> String {
    error.map_or_else(|| "ok".to_string(), ToString::to_string)
}

/// Reasons `initialize` can fail.
#[derive(Debug, Error)]
pub enum InitializationError {
    /// The maintainer could not report starting offsets.
    #[error("state maintainer: {0}")]
    Maintainer(#[source] BoxError),

    /// The record source rejected the assignment.
    #[error("assignment rejected: {0}")]
    Assign(#[source] SourceError),

    /// The record source could not seek to a starting offset.
    #[error("cannot seek {partition} to {offset}: {source}")]
    Seek {
        /// Partition being sought.
        partition: TopicPartition,
        /// Requested starting offset.
        offset: Offset,
        /// Record source error.
        source: SourceError,
    },

    /// The record source could not find the first retained offset.
    #[error("cannot seek {partition} to its earliest offset: {source}")]
    SeekToBeginning {
        /// Partition being sought.
        partition: TopicPartition,
        /// Record source error.
        source: SourceError,
    },
}

/// Errors raised by key/value stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is closed.
    #[error("store {name} is closed")]
    Closed {
        /// Store name.
        name: String,
    },

    /// The store would exceed its entry limit.
    #[error("store {name} is full: {count} entries >= max {max}")]
    TooManyEntries {
        /// Store name.
        name: String,
        /// Current entry count.
        count: u64,
        /// Maximum allowed.
        max: u64,
    },

    /// A snapshot file is not readable.
    #[error("corrupt snapshot {}: {reason}", path.display())]
    Corruption {
        /// Snapshot path.
        path: PathBuf,
        /// What was wrong.
        reason: &'static str,
    },

    /// A snapshot's checksum does not match its contents.
    #[error("snapshot {} checksum mismatch: expected {expected:#010x}, got {actual:#010x}", path.display())]
    ChecksumMismatch {
        /// Snapshot path.
        path: PathBuf,
        /// Stored CRC32.
        expected: u32,
        /// Computed CRC32.
        actual: u32,
    },

    /// I/O error.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// Error message.
        message: String,
    },
}

/// Errors raised reading or writing the offset checkpoint file.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    /// The file has a version this build cannot read.
    #[error("unsupported checkpoint version {version}")]
    UnsupportedVersion {
        /// Version found in the file.
        version: u32,
    },

    /// The file contents are malformed.
    #[error("malformed checkpoint at line {line}: {reason}")]
    Malformed {
        /// One-based line number.
        line: usize,
        /// What was wrong.
        reason: &'static str,
    },

    /// A topic name cannot be written to the file.
    #[error("topic {topic:?} cannot be checkpointed: {reason}")]
    InvalidTopic {
        /// Topic name.
        topic: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// I/O error.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// Error message.
        message: String,
    },
}

/// Errors raised by [`StoreMaintainer`](crate::StoreMaintainer).
#[derive(Debug, Error)]
pub enum MaintainerError {
    /// The configuration is inconsistent.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// What is wrong.
        message: String,
    },

    /// The maintainer is not in a state that allows the operation.
    #[error("state maintainer is {state}")]
    InvalidState {
        /// Description of the current state.
        state: &'static str,
    },

    /// A record arrived for a partition that feeds no store.
    #[error("no store is fed by partition {partition}")]
    UnknownPartition {
        /// The partition.
        partition: TopicPartition,
    },

    /// A record has no key.
    #[error("record {partition}@{offset} has no key")]
    MissingKey {
        /// Partition of the record.
        partition: TopicPartition,
        /// Offset of the record.
        offset: Offset,
    },

    /// A record exceeds configured limits.
    #[error("record rejected: {0}")]
    Limit(#[from] keel_core::Error),

    /// A store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The checkpoint file could not be read or written.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// I/O error on the state directory.
    #[error("I/O error: {operation}: {message}")]
    Io {
        /// What operation was being performed.
        operation: &'static str,
        /// Error message.
        message: String,
    },
}
