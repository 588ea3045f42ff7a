//! Error types for profile-sync identifiers.

use thiserror::Error;

/// Validation failures for identity types.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    /// Owner key was empty or whitespace.
    #[error("owner key must not be empty")]
    EmptyOwnerKey,

    /// Profile identifier was empty or whitespace.
    #[error("profile identifier must not be empty")]
    EmptyIdentifier,

    /// Value exceeded its maximum length.
    #[error("{field} too long: {len} bytes (limit: {max} bytes)")]
    TooLong {
        /// Which value was too long.
        field: &'static str,
        /// Actual length.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// Value contained characters that are not allowed.
    #[error("{field} contains invalid characters")]
    InvalidCharacters {
        /// Which value was invalid.
        field: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = IdError::TooLong {
            field: "owner key",
            len: 300,
            max: 256,
        };
        assert_eq!(err.to_string(), "owner key too long: 300 bytes (limit: 256 bytes)");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<IdError>();
    }
}
