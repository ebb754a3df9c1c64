//! Error types for the document core
//!
//! This module defines the errors raised by tape encoding, document access and
//! the document codecs. We use `thiserror` for automatic `Display` and `Error`
//! trait implementations.

use thiserror::Error;

/// Result type alias for document-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the document core
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// Tape access past the last cell
    #[error("Tape index {index} out of range (tape has {len} cells)")]
    OutOfRange {
        /// Requested cell index
        index: usize,
        /// Number of cells on the tape
        len: usize,
    },

    /// A value had a different kind than the operation requires
    #[error("Type mismatch: expected {expected}, found {actual}")]
    TypeMismatch {
        /// Kind required by the operation
        expected: &'static str,
        /// Kind actually found
        actual: &'static str,
    },

    /// A key path could not be used for the requested mutation
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// An update document was not understood
    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    /// Tape bytes or headers failed validation
    #[error("Malformed tape: {0}")]
    Malformed(String),

    /// MessagePack or JSON encoding failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The fixed-capacity tape writer ran out of room
    #[error("Tape capacity exceeded: requested {requested}, available {available}")]
    CapacityExceeded {
        /// Cells or bytes requested
        requested: usize,
        /// Cells or bytes left
        available: usize,
    },

    /// An object id string was not 24 hex digits
    #[error("Invalid object id: {0}")]
    InvalidObjectId(String),
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_out_of_range() {
        let err = Error::OutOfRange { index: 7, len: 3 };
        let msg = err.to_string();
        assert!(msg.contains("out of range"));
        assert!(msg.contains('7'));
        assert!(msg.contains('3'));
    }

    #[test]
    fn test_error_display_type_mismatch() {
        let err = Error::TypeMismatch {
            expected: "number",
            actual: "string",
        };
        assert_eq!(
            err.to_string(),
            "Type mismatch: expected number, found string"
        );
    }

    #[test]
    fn test_error_display_invalid_path() {
        let err = Error::InvalidPath("a.b".to_string());
        assert!(err.to_string().contains("a.b"));
    }

    #[test]
    fn test_error_display_capacity() {
        let err = Error::CapacityExceeded {
            requested: 10,
            available: 4,
        };
        let msg = err.to_string();
        assert!(msg.contains("10"));
        assert!(msg.contains('4'));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_error_from_msgpack() {
        let msgpack_err = rmp_serde::from_slice::<String>(&[0xc1]).unwrap_err();
        let err: Error = msgpack_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }

        fn returns_error() -> Result<i32> {
            Err(Error::InvalidUpdate("nope".to_string()))
        }

        assert_eq!(returns_result().unwrap(), 42);
        assert!(returns_error().is_err());
    }
}
