//! Error types for dump decoding, index building and marking

use std::path::PathBuf;
use thiserror::Error;

/// One heap dump found in a multi-dump file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpDescriptor {
    /// Zero-based dump index, usable as a dump selection
    pub index: usize,
    /// Creation time in milliseconds since the epoch
    pub created_at_ms: i64,
    /// Human readable description ("Heap dump created at ...")
    pub description: String,
}

impl DumpDescriptor {
    /// Identifier used in messages, e.g. `#1`
    pub fn runtime_id(&self) -> String {
        format!("#{}", self.index)
    }
}

/// A recoverable violation of the HPROF format.
///
/// Whether it is fatal depends on the configured strictness.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatViolation {
    #[error(
        "(Possibly) invalid HPROF file at byte {offset}: expected to read another {length} bytes, \
         but only {available} bytes are available"
    )]
    RecordOverrun {
        offset: u64,
        length: u64,
        available: u64,
    },

    #[error("Heap dump record 0x{tag:02x} at byte {offset} size {length} is not a supported record type")]
    UnexpectedRecord { tag: u8, offset: u64, length: u64 },

    #[error("Heap dump segment at 0x{start:x} size {length} ends at 0x{actual:x} instead of 0x{expected:x}")]
    SegmentEndMismatch {
        start: u64,
        length: u64,
        actual: u64,
        expected: u64,
    },

    #[error("Instance at byte {offset} declares {declared} payload bytes but its class layout reads {read}")]
    InstanceSizeMismatch { offset: u64, declared: u64, read: u64 },
}

/// Errors that can occur while building or using a heap index
#[derive(Error, Debug)]
pub enum HeapError {
    #[error("Invalid HPROF file header: {0}")]
    InvalidHeader(String),

    #[error("Only 32bit and 64bit dumps are supported (identifier size {0})")]
    UnsupportedIdentifierSize(u32),

    #[error("Illegal record length {length} at byte {offset} for record type 0x{tag:02x}")]
    IllegalRecordLength { length: i64, offset: u64, tag: u8 },

    #[error("Invalid heap dump file: unsupported segment type 0x{tag:02x} at position {offset}")]
    InvalidSubRecord { tag: u8, offset: u64 },

    #[error("Illegal primitive object array type {tag} at position {offset}")]
    IllegalPrimitiveType { tag: u8, offset: u64 },

    #[error("Unknown basic type {tag} at position {offset}")]
    InvalidValueType { tag: u8, offset: u64 },

    #[error(
        "The HPROF parser encountered a violation of the HPROF format that it could not safely \
         handle. Set strictness to \"warn\" or \"permissive\" to continue anyway: {source}"
    )]
    Stopped {
        #[source]
        source: FormatViolation,
    },

    #[error("{} heap dumps found", .0.len())]
    MultipleDumps(Vec<DumpDescriptor>),

    #[error("Parser found {found} HPROF dumps. No heap dump index {requested} found")]
    DumpNotFound { found: usize, requested: usize },

    #[error("Found instance segment but expected class segment: 0x{0:x}")]
    ExpectedClassSegment(u64),

    #[error("Missing class 0x{class_address:x} for object at position {offset}")]
    MissingClass { class_address: u64, offset: u64 },

    #[error("Multiple class instances exist for {0}")]
    AmbiguousClass(String),

    #[error("Corrupt index file {path}: {reason}")]
    CorruptIndex { path: PathBuf, reason: String },

    #[error("Object id {id} is out of range (object count {count})")]
    InvalidObjectId { id: u32, count: usize },

    #[error("Reachability set holds {bits} entries but the heap has {objects} objects")]
    BitsetSizeMismatch { bits: usize, objects: usize },

    #[error("Failed to encode index metadata: {0}")]
    Metadata(String),

    #[error("Operation canceled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HeapError {
    /// Whether this is the cooperative cancellation signal rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, HeapError::Cancelled)
    }

    /// Dump descriptors when the file holds several dumps and none was selected
    pub fn available_dumps(&self) -> Option<&[DumpDescriptor]> {
        match self {
            HeapError::MultipleDumps(dumps) => Some(dumps),
            _ => None,
        }
    }
}

pub type HeapResult<T> = Result<T, HeapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopped_error_keeps_violation_as_source() {
        let err = HeapError::Stopped {
            source: FormatViolation::RecordOverrun {
                offset: 31,
                length: 1000,
                available: 12,
            },
        };
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("byte 31"));
        assert!(!err.is_cancelled());
    }

    #[test]
    fn test_multiple_dumps_message() {
        let dumps: Vec<DumpDescriptor> = (0..3)
            .map(|index| DumpDescriptor {
                index,
                created_at_ms: 0,
                description: String::new(),
            })
            .collect();
        let err = HeapError::MultipleDumps(dumps);
        assert_eq!(err.to_string(), "3 heap dumps found");
        assert_eq!(err.available_dumps().unwrap()[2].runtime_id(), "#2");
    }
}
