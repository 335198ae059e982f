//! Error types for Keel core operations.

use thiserror::Error;

/// The result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised when validating core values against limits.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A resource limit was exceeded.
    #[error("limit exceeded: {limit} (max={max}, actual={actual})")]
    LimitExceeded {
        /// Which limit was exceeded.
        limit: &'static str,
        /// The maximum allowed value.
        max: u64,
        /// The actual value that exceeded the limit.
        actual: u64,
    },

    /// An invalid argument was provided.
    #[error("invalid argument '{name}': {reason}")]
    InvalidArgument {
        /// The name of the argument.
        name: &'static str,
        /// Why it was invalid.
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_exceeded_display() {
        let err = Error::LimitExceeded {
            limit: "max_poll_records",
            max: 500,
            actual: 501,
        };
        assert_eq!(
            err.to_string(),
            "limit exceeded: max_poll_records (max=500, actual=501)"
        );
    }

    #[test]
    fn test_invalid_argument_display() {
        let err = Error::InvalidArgument {
            name: "max_key_bytes",
            reason: "must be positive",
        };
        assert!(err.to_string().contains("max_key_bytes"));
    }
}
