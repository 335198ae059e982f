//! Bounds on polling and storage.
//!
//! Every batch and buffer has an explicit maximum so that a single poll or a
//! single snapshot cannot grow without bound.

/// System-wide limits for Keel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Maximum number of records returned by a single poll.
    pub max_poll_records: u32,
    /// Maximum size of a record key in bytes.
    pub max_key_bytes: u32,
    /// Maximum size of a record value in bytes.
    pub max_value_bytes: u32,
    /// Maximum number of entries held by one store snapshot.
    pub max_store_entries: u64,
    /// Maximum number of partitions a single consumer may be assigned.
    pub max_assigned_partitions: u32,
}

impl Limits {
    /// Creates limits with safe defaults.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            // 500 records/poll, matching common consumer defaults.
            max_poll_records: 500,
            // 64KB keys, 1MB values.
            max_key_bytes: 64 * 1024,
            max_value_bytes: 1024 * 1024,
            // 100M entries per store.
            max_store_entries: 100_000_000,
            max_assigned_partitions: 10_000,
        }
    }

    /// Validates that all limits are internally consistent.
    ///
    /// # Errors
    /// Returns an error if any limit is zero.
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_poll_records == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_poll_records",
                reason: "must be positive",
            });
        }

        if self.max_key_bytes == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_key_bytes",
                reason: "must be positive",
            });
        }

        if self.max_value_bytes == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_value_bytes",
                reason: "must be positive",
            });
        }

        if self.max_store_entries == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_store_entries",
                reason: "must be positive",
            });
        }

        if self.max_assigned_partitions == 0 {
            return Err(crate::Error::InvalidArgument {
                name: "max_assigned_partitions",
                reason: "must be positive",
            });
        }

        Ok(())
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_are_valid() {
        assert!(Limits::new().validate().is_ok());
    }

    #[test]
    fn test_zero_poll_records_invalid() {
        let mut limits = Limits::new();
        limits.max_poll_records = 0;
        assert!(limits.validate().is_err());
    }

    #[test]
    fn test_zero_assigned_partitions_invalid() {
        let limits = Limits {
            max_assigned_partitions: 0,
            ..Limits::new()
        };
        assert!(limits.validate().is_err());
    }
}
