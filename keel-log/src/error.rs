//! Record source error types.

use keel_core::{Offset, TopicPartition};
use thiserror::Error;

/// Result type for record source operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// Errors raised by a record source.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The offset is outside the retained range of the partition.
    #[error("offset {offset} out of range for {partition}: retained [{start}, {end}]")]
    OffsetOutOfRange {
        /// Partition being read or sought.
        partition: TopicPartition,
        /// Requested offset.
        offset: Offset,
        /// First retained offset.
        start: Offset,
        /// Log end offset (next offset to be written).
        end: Offset,
    },

    /// The partition is not part of the current assignment.
    #[error("partition {partition} is not assigned")]
    NotAssigned {
        /// The partition.
        partition: TopicPartition,
    },

    /// The partition does not exist in the log.
    #[error("partition {partition} does not exist")]
    UnknownPartition {
        /// The partition.
        partition: TopicPartition,
    },

    /// The partition is assigned but has no position yet.
    #[error("no position for {partition}: seek required")]
    NoPosition {
        /// The partition.
        partition: TopicPartition,
    },

    /// The assignment is larger than allowed.
    #[error("too many partitions assigned: {count} > {max}")]
    TooManyPartitions {
        /// Requested assignment size.
        count: usize,
        /// Maximum allowed.
        max: u32,
    },

    /// The source has been closed.
    #[error("record source is closed")]
    Closed,
}

impl SourceError {
    /// Returns true if this error means the requested offset is not retained.
    #[must_use]
    pub const fn is_offset_out_of_range(&self) -> bool {
        matches!(self, Self::OffsetOutOfRange { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SourceError::OffsetOutOfRange {
            partition: TopicPartition::new("topic-one", 1),
            offset: Offset::new(100),
            start: Offset::new(0),
            end: Offset::new(50),
        };
        let msg = err.to_string();
        assert!(msg.contains("topic-one/1"));
        assert!(msg.contains("100"));
        assert!(msg.contains("[0, 50]"));
        assert!(err.is_offset_out_of_range());
    }

    #[test]
    fn test_closed_is_not_out_of_range() {
        assert!(!SourceError::Closed.is_offset_out_of_range());
    }
}
