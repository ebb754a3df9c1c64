//! Error types for the index storage layer

use thiserror::Error;

use crate::key::KeyType;

/// Errors raised by index storage
#[derive(Debug, Error)]
pub enum StorageError {
    /// Page or file I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Checksum, magic or structural mismatch in persisted data
    #[error("corruption: {0}")]
    Corruption(String),

    /// Bad or conflicting index configuration
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Entry does not fit the node size limit
    #[error("entry of {size} bytes exceeds the limit of {max} bytes")]
    EntryTooLarge {
        /// Encoded entry size
        size: usize,
        /// Largest accepted entry
        max: usize,
    },

    /// Key of the wrong type for this index
    #[error("key type mismatch: index holds {expected:?}, got {actual:?}")]
    KeyTypeMismatch {
        /// Declared index key type
        expected: KeyType,
        /// Type of the offered key
        actual: KeyType,
    },

    /// Document decoding failure
    #[error("document error: {0}")]
    Document(#[from] tapedb_core::Error),
}

/// Result alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = StorageError::EntryTooLarge { size: 100, max: 64 };
        assert_eq!(
            err.to_string(),
            "entry of 100 bytes exceeds the limit of 64 bytes"
        );
        let err = StorageError::KeyTypeMismatch {
            expected: KeyType::Int32,
            actual: KeyType::String,
        };
        assert!(err.to_string().contains("Int32"));
    }

    #[test]
    fn test_from_io() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: StorageError = io.into();
        assert!(matches!(err, StorageError::Io(_)));
    }
}
