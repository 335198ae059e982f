//! Offset checkpoint file and checkpoint cadence.
//!
//! # File Format
//!
//! The checkpoint is a small text file in the state directory:
//!
//! ```text
//! 0                  <- version
//! 2                  <- entry count
//! topic-one 1 21     <- topic, partition, next offset to read
//! topic-two 1 33
//! ```
//!
//! Writes go to a temporary file that is synced and then renamed over the
//! checkpoint, so a crash leaves either the old or the new checkpoint.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::time::Duration;

use keel_core::{Offset, TopicPartition};

use crate::error::{CheckpointError, CheckpointResult};

/// Checkpoint file format version.
const CHECKPOINT_VERSION: u32 = 0;

/// Cadence at which a maintainer persists progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointConfig {
    /// Minimum time between checkpoints.
    pub commit_interval: Duration,
    /// Offset advance, summed over partitions, that forces a checkpoint
    /// before `commit_interval` has elapsed.
    pub offset_delta_threshold: u64,
}

impl CheckpointConfig {
    /// Offset advance that forces an early checkpoint by default.
    pub const DEFAULT_OFFSET_DELTA_THRESHOLD: u64 = 10_000;

    /// Creates a config with the given interval and the default threshold.
    #[must_use]
    pub const fn new(commit_interval: Duration) -> Self {
        Self {
            commit_interval,
            offset_delta_threshold: Self::DEFAULT_OFFSET_DELTA_THRESHOLD,
        }
    }

    /// Creates a config that checkpoints whenever any offset moved.
    #[must_use]
    pub const fn for_testing() -> Self {
        Self {
            commit_interval: Duration::ZERO,
            offset_delta_threshold: 1,
        }
    }

    /// Sets the offset delta threshold.
    #[must_use]
    pub const fn with_offset_delta_threshold(mut self, threshold: u64) -> Self {
        self.offset_delta_threshold = threshold;
        self
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

/// Reader and writer for an offset checkpoint file.
#[derive(Debug, Clone)]
pub struct OffsetCheckpoint {
    path: PathBuf,
}

impl OffsetCheckpoint {
    /// Name of the checkpoint file inside a state directory.
    pub const FILE_NAME: &'static str = ".checkpoint";

    /// Creates a checkpoint at an explicit path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Creates the checkpoint for a state directory.
    #[must_use]
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(Self::FILE_NAME))
    }

    /// Returns the checkpoint path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the checkpointed offsets. A missing file reads as empty.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is malformed.
    pub fn read(&self) -> CheckpointResult<BTreeMap<TopicPartition, Offset>> {
        match fs::read_to_string(&self.path) {
            Ok(text) => decode(&text),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(io_error("read_checkpoint", &e)),
        }
    }

    /// Atomically replaces the checkpoint with `offsets`.
    ///
    /// # Errors
    /// Returns an error if a topic cannot be encoded or the write fails.
    pub fn write(&self, offsets: &BTreeMap<TopicPartition, Offset>) -> CheckpointResult<()> {
        let text = encode(offsets)?;
        let tmp = self.path.with_extension("tmp");

        {
            let mut file =
                fs::File::create(&tmp).map_err(|e| io_error("create_checkpoint_tmp", &e))?;
            file.write_all(text.as_bytes())
                .map_err(|e| io_error("write_checkpoint_tmp", &e))?;
            file.sync_all()
                .map_err(|e| io_error("sync_checkpoint_tmp", &e))?;
        }

        fs::rename(&tmp, &self.path).map_err(|e| io_error("rename_checkpoint", &e))
    }

    /// Removes the checkpoint file. A missing file is not an error.
    ///
    /// # Errors
    /// Returns an error if the file exists and cannot be removed.
    pub fn delete(&self) -> CheckpointResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("delete_checkpoint", &e)),
        }
    }
}

fn io_error(operation: &'static str, e: &io::Error) -> CheckpointError {
    CheckpointError::Io {
        operation,
        message: e.to_string(),
    }
}

fn encode(offsets: &BTreeMap<TopicPartition, Offset>) -> CheckpointResult<String> {
    let mut text = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(text, "{CHECKPOINT_VERSION}");
    let _ = writeln!(text, "{}", offsets.len());

    for (tp, offset) in offsets {
        if tp.topic().chars().any(char::is_whitespace) {
            return Err(CheckpointError::InvalidTopic {
                topic: tp.topic().to_string(),
                reason: "contains whitespace",
            });
        }
        let _ = writeln!(text, "{} {} {}", tp.topic(), tp.partition(), offset.get());
    }

    Ok(text)
}

fn decode(text: &str) -> CheckpointResult<BTreeMap<TopicPartition, Offset>> {
    let mut lines = text.lines().enumerate().map(|(i, line)| (i + 1, line.trim()));

    let (line, version) = lines.next().ok_or(CheckpointError::Malformed {
        line: 1,
        reason: "missing version",
    })?;
    let version: u32 = version.parse().map_err(|_| CheckpointError::Malformed {
        line,
        reason: "version is not a number",
    })?;
    if version != CHECKPOINT_VERSION {
        return Err(CheckpointError::UnsupportedVersion { version });
    }

    let (line, count) = lines.next().ok_or(CheckpointError::Malformed {
        line: 2,
        reason: "missing entry count",
    })?;
    let expected: usize = count.parse().map_err(|_| CheckpointError::Malformed {
        line,
        reason: "entry count is not a number",
    })?;

    let mut offsets = BTreeMap::new();
    let mut last_line = line;
    for (line, entry) in lines {
        last_line = line;
        if entry.is_empty() {
            continue;
        }

        let mut fields = entry.split_whitespace();
        let (Some(topic), Some(partition), Some(offset), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(CheckpointError::Malformed {
                line,
                reason: "expected '<topic> <partition> <offset>'",
            });
        };

        let partition: u32 = partition.parse().map_err(|_| CheckpointError::Malformed {
            line,
            reason: "partition is not a number",
        })?;
        let offset: u64 = offset.parse().map_err(|_| CheckpointError::Malformed {
            line,
            reason: "offset is not a number",
        })?;

        offsets.insert(TopicPartition::new(topic, partition), Offset::new(offset));
    }

    if offsets.len() != expected {
        return Err(CheckpointError::Malformed {
            line: last_line,
            reason: "entry count does not match entries",
        });
    }

    Ok(offsets)
}
