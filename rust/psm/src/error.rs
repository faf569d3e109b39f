// src/error.rs

use std::fmt;
use std::io;
use std::time::Duration;

use crate::codec::{CorruptFrame, DecodeError, EncodeError};
use crate::value::ValueKind;

/// Errors returned by segment and store operations.
#[derive(Debug)]
pub enum StoreError {
    /// A creator found an object with its name already present.
    AlreadyExists { name: String },
    /// An attacher found no object with its name.
    NotFound { name: String },
    /// The value's variant differs from the store's declared kind.
    TypeMismatch {
        expected: ValueKind,
        found: ValueKind,
    },
    /// The segment holds no frame, the handle is stopped, or the backing
    /// object went away.
    NoValue,
    /// The segment holds a malformed frame.
    CorruptFrame(CorruptFrame),
    /// The encoded frame is larger than the segment.
    CapacityExceeded { needed: usize, capacity: usize },
    /// The value cannot be represented on the wire.
    Encode(EncodeError),
    /// The logical name cannot be used to build an object name.
    InvalidName { name: String, reason: &'static str },
    /// A creator was constructed without an initial value.
    InitialValueRequired,
    /// The segment lock could not be taken in time.
    LockTimeout { name: String, timeout: Duration },
    /// Item access on a value that has no items.
    NotIndexable { kind: ValueKind },
    /// Item mutation on a value that does not allow it.
    ReadOnly { kind: ValueKind },
    /// Sequence index outside the stored sequence.
    IndexOutOfRange { index: i64, len: usize },
    /// Mapping key not present.
    KeyNotFound { key: String },
    /// OS failure while opening, sizing or mapping the segment.
    Io(io::Error),
}

impl StoreError {
    /// Whether the caller can reasonably retry, rename, or treat the
    /// condition as "nothing stored".
    ///
    /// Only OS failures are not: mapping failures after a successful open
    /// (out of memory, resource exhaustion) are surfaced and never retried.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, StoreError::Io(_))
    }

    /// Whether nothing usable is currently stored.
    pub fn is_nothing_stored(&self) -> bool {
        matches!(self, StoreError::NoValue | StoreError::CorruptFrame(_))
    }

    /// Get a short, stable description of the error class.
    pub fn description(&self) -> &'static str {
        match self {
            StoreError::AlreadyExists { .. } => "already exists",
            StoreError::NotFound { .. } => "not found",
            StoreError::TypeMismatch { .. } => "type mismatch",
            StoreError::NoValue => "no value",
            StoreError::CorruptFrame(_) => "corrupt frame",
            StoreError::CapacityExceeded { .. } => "capacity exceeded",
            StoreError::Encode(_) => "unencodable value",
            StoreError::InvalidName { .. } => "invalid name",
            StoreError::InitialValueRequired => "initial value required",
            StoreError::LockTimeout { .. } => "lock timeout",
            StoreError::NotIndexable { .. } => "not indexable",
            StoreError::ReadOnly { .. } => "read only",
            StoreError::IndexOutOfRange { .. } => "index out of range",
            StoreError::KeyNotFound { .. } => "key not found",
            StoreError::Io(_) => "I/O error",
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::AlreadyExists { name } => {
                write!(f, "shared memory object {name} already exists")
            }
            StoreError::NotFound { name } => write!(f, "shared memory object {name} not found"),
            StoreError::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: store holds {expected}, got {found}")
            }
            StoreError::NoValue => write!(f, "no value stored"),
            StoreError::CorruptFrame(c) => write!(f, "corrupt frame: {c}"),
            StoreError::CapacityExceeded { needed, capacity } => write!(
                f,
                "frame needs {needed} bytes but the segment holds {capacity}"
            ),
            StoreError::Encode(e) => write!(f, "cannot encode value: {e}"),
            StoreError::InvalidName { name, reason } => {
                write!(f, "invalid store name {name:?}: {reason}")
            }
            StoreError::InitialValueRequired => {
                write!(f, "a creator needs an initial value")
            }
            StoreError::LockTimeout { name, timeout } => {
                write!(f, "timed out after {timeout:?} waiting for lock {name}")
            }
            StoreError::NotIndexable { kind } => write!(f, "{kind} values have no items"),
            StoreError::ReadOnly { kind } => write!(f, "{kind} items cannot be modified"),
            StoreError::IndexOutOfRange { index, len } => {
                write!(f, "index {index} out of range for length {len}")
            }
            StoreError::KeyNotFound { key } => write!(f, "key {key} not found"),
            StoreError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::CorruptFrame(c) => Some(c),
            StoreError::Encode(e) => Some(e),
            StoreError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<EncodeError> for StoreError {
    fn from(e: EncodeError) -> Self {
        StoreError::Encode(e)
    }
}

impl From<DecodeError> for StoreError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::NoValue => StoreError::NoValue,
            DecodeError::Corrupt(c) => StoreError::CorruptFrame(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_errors_map_to_store_errors() {
        assert!(matches!(
            StoreError::from(DecodeError::NoValue),
            StoreError::NoValue
        ));
        let err = StoreError::from(DecodeError::Corrupt(CorruptFrame::Truncated));
        assert!(err.is_nothing_stored());
        assert!(err.is_recoverable());
    }

    #[test]
    fn io_errors_are_not_recoverable() {
        let err = StoreError::from(io::Error::other("mmap failed"));
        assert!(!err.is_recoverable());
        assert!(!err.is_nothing_stored());
        assert_eq!(err.description(), "I/O error");
    }

    #[test]
    fn display_names_the_object() {
        let err = StoreError::AlreadyExists {
            name: "/psm_x".into(),
        };
        assert_eq!(err.to_string(), "shared memory object /psm_x already exists");
        let err = StoreError::TypeMismatch {
            expected: ValueKind::Text,
            found: ValueKind::Integer,
        };
        assert_eq!(err.to_string(), "type mismatch: store holds text, got integer");
    }
}
