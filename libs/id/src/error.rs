//! Parse errors for keys and prefixed IDs.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("ID cannot be empty")]
    Empty,

    /// Store-assigned key over the length limit.
    #[error("key is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },

    /// Whitespace or control character in a key.
    #[error("key contains forbidden character {found:?} at byte {offset}")]
    ForbiddenChar { found: char, offset: usize },

    /// Prefixed ID with the wrong prefix, e.g. a boot ID parsed as a tick ID.
    #[error("expected '{expected}_' prefix, got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("prefixed ID has no '_' separator")]
    MissingSeparator,

    #[error("invalid ULID: {0}")]
    InvalidUlid(String),
}

impl IdError {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    pub fn is_prefix_error(&self) -> bool {
        matches!(self, Self::InvalidPrefix { .. } | Self::MissingSeparator)
    }

    /// True for errors that only a store-assigned key can produce.
    pub fn is_key_error(&self) -> bool {
        matches!(self, Self::TooLong { .. } | Self::ForbiddenChar { .. })
    }
}
