//! Records as delivered by a record source.
//!
//! A record carries its change-log partition, its offset in that partition,
//! an optional key, an optional value and a timestamp. Keys and values are
//! opaque bytes. A record with no value is a tombstone: it deletes the key
//! from the store it is applied to.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::limits::Limits;
use crate::types::{Offset, TopicPartition};

/// Append time of a record, in milliseconds since the Unix epoch.
///
/// A negative value means no time was attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// No time attached.
    pub const NONE: Self = Self(-1);

    /// Creates a timestamp from epoch milliseconds.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the epoch milliseconds, if a time is attached.
    #[must_use]
    pub const fn millis(self) -> Option<i64> {
        if self.0 < 0 {
            None
        } else {
            Some(self.0)
        }
    }

    /// Returns the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX));
        Self(millis)
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Self::NONE
    }
}

/// A single change-log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    /// Partition the record was read from.
    pub partition: TopicPartition,
    /// Offset of the record within its partition.
    pub offset: Offset,
    /// Record key.
    pub key: Option<Bytes>,
    /// Record value; `None` marks a tombstone.
    pub value: Option<Bytes>,
    /// Timestamp of the record.
    pub timestamp: Timestamp,
}

impl ConsumerRecord {
    /// Creates a keyed record carrying a value.
    #[must_use]
    pub fn new(
        partition: TopicPartition,
        offset: Offset,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            partition,
            offset,
            key: Some(key.into()),
            value: Some(value.into()),
            timestamp: Timestamp::NONE,
        }
    }

    /// Creates a tombstone for `key`.
    #[must_use]
    pub fn tombstone(partition: TopicPartition, offset: Offset, key: impl Into<Bytes>) -> Self {
        Self {
            partition,
            offset,
            key: Some(key.into()),
            value: None,
            timestamp: Timestamp::NONE,
        }
    }

    /// Sets the timestamp.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Returns true if this record deletes its key.
    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Returns the approximate size of the record in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        let key_size = self.key.as_ref().map_or(0, Bytes::len);
        let value_size = self.value.as_ref().map_or(0, Bytes::len);
        8 + 8 + 4 + key_size + 4 + value_size
    }

    /// Validates the record against limits.
    ///
    /// # Errors
    /// Returns `LimitExceeded` if the key or value is too large.
    pub fn validate(&self, limits: &Limits) -> Result<()> {
        if let Some(ref key) = self.key {
            if key.len() > limits.max_key_bytes as usize {
                return Err(Error::LimitExceeded {
                    limit: "max_key_bytes",
                    max: u64::from(limits.max_key_bytes),
                    actual: key.len() as u64,
                });
            }
        }

        if let Some(ref value) = self.value {
            if value.len() > limits.max_value_bytes as usize {
                return Err(Error::LimitExceeded {
                    limit: "max_value_bytes",
                    max: u64::from(limits.max_value_bytes),
                    actual: value.len() as u64,
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp() -> TopicPartition {
        TopicPartition::new("topic-one", 1)
    }

    #[test]
    fn test_record_tombstone() {
        let put = ConsumerRecord::new(tp(), Offset::new(20), "k", "v");
        let delete = ConsumerRecord::tombstone(tp(), Offset::new(21), "k");

        assert!(!put.is_tombstone());
        assert!(delete.is_tombstone());
        assert_eq!(delete.key.as_deref(), Some(b"k".as_slice()));
    }

    #[test]
    fn test_record_validate_value_limit() {
        let limits = Limits {
            max_value_bytes: 4,
            ..Limits::new()
        };
        let small = ConsumerRecord::new(tp(), Offset::new(0), "k", "1234");
        let large = ConsumerRecord::new(tp(), Offset::new(1), "k", "12345");

        assert!(small.validate(&limits).is_ok());
        let err = large.validate(&limits).unwrap_err();
        assert!(err.to_string().contains("max_value_bytes"));
    }

    #[test]
    fn test_record_validate_key_limit() {
        let limits = Limits {
            max_key_bytes: 2,
            ..Limits::new()
        };
        let record = ConsumerRecord::tombstone(tp(), Offset::new(0), "abc");
        assert!(record.validate(&limits).is_err());
    }

    #[test]
    fn test_timestamp_millis() {
        assert_eq!(Timestamp::default().millis(), None);
        assert_eq!(Timestamp::from_millis(5).millis(), Some(5));
        assert!(Timestamp::now().millis().is_some());
    }
}
