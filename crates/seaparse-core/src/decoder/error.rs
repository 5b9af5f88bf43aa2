use serde::Serialize;
use thiserror::Error;

/// Record-level failures. Each rejects one record; the file continues.
///
/// Offsets are the start of the rejected record in the unwrapped buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecodeError {
    #[error("checksum mismatch at offset {offset}: stored {stored:#x}, computed {computed:#x}")]
    ChecksumMismatch {
        offset: usize,
        stored: u64,
        computed: u64,
    },
    #[error("invalid value for field '{field}' in record at offset {offset}")]
    FieldFormat { offset: usize, field: String },
    #[error("record at offset {offset} too short: need {needed} bytes, got {actual}")]
    TruncatedRecord {
        offset: usize,
        needed: usize,
        actual: usize,
    },
    #[error("unexpected data at offset {offset}")]
    UnexpectedData { offset: usize },
}

impl DecodeError {
    pub fn offset(&self) -> usize {
        match self {
            DecodeError::ChecksumMismatch { offset, .. }
            | DecodeError::FieldFormat { offset, .. }
            | DecodeError::TruncatedRecord { offset, .. }
            | DecodeError::UnexpectedData { offset } => *offset,
        }
    }
}
