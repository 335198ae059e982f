//! Identifiers for change-log partitions and positions within them.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A change-log partition: a topic name plus a partition index.
///
/// Ordered by topic then partition so that sets and maps of partitions
/// iterate deterministically.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicPartition {
    topic: Arc<str>,
    partition: u32,
}

impl TopicPartition {
    /// Creates a new topic partition.
    ///
    /// # Panics
    /// Panics if `topic` is empty.
    #[must_use]
    pub fn new(topic: impl AsRef<str>, partition: u32) -> Self {
        let topic = topic.as_ref();
        assert!(!topic.is_empty(), "topic name must not be empty");
        Self {
            topic: Arc::from(topic),
            partition,
        }
    }

    /// Returns the topic name.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns the partition index within the topic.
    #[must_use]
    pub const fn partition(&self) -> u32 {
        self.partition
    }
}

impl fmt::Debug for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tp({}/{})", self.topic, self.partition)
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// Position within one topic partition.
///
/// Used as a seek target it names the next record to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Offset(u64);

impl Offset {
    /// The first offset of a partition that never lost records to retention.
    pub const ZERO: Self = Self(0);

    /// Creates an offset from a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw offset value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns the next offset.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Returns how far `self` is ahead of `earlier`, or zero if it is behind.
    #[must_use]
    pub const fn distance_from(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Offset {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

/// Where replay of one change-log partition begins.
///
/// `Earliest` is kept apart from any concrete offset: `At(Offset::ZERO)` is
/// sought exactly and fails once retention moved the log start past zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartPosition {
    /// The first offset the log still retains.
    Earliest,
    /// Exactly this offset.
    At(Offset),
}

impl StartPosition {
    /// Returns the concrete offset, or `None` for `Earliest`.
    #[must_use]
    pub const fn offset(self) -> Option<Offset> {
        match self {
            Self::Earliest => None,
            Self::At(offset) => Some(offset),
        }
    }
}

impl fmt::Display for StartPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Earliest => f.write_str("earliest"),
            Self::At(offset) => write!(f, "{offset}"),
        }
    }
}

impl From<Offset> for StartPosition {
    fn from(offset: Offset) -> Self {
        Self::At(offset)
    }
}

/// Where replay resumes for each change-log partition.
pub type StartingOffsets = BTreeMap<TopicPartition, StartPosition>;
