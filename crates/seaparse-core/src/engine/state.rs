use serde::{Deserialize, Serialize};

use crate::decoder::DecodeError;

/// What went wrong with one skipped record or byte range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bytes passed over while resynchronising.
    Corrupt { length: usize },
    ChecksumMismatch { stored: u64, computed: u64 },
    FieldFormat { field: String },
    TruncatedRecord { needed: usize, actual: usize },
    UnexpectedData,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::Corrupt { .. } => "corrupt",
            ErrorKind::ChecksumMismatch { .. } => "checksum_mismatch",
            ErrorKind::FieldFormat { .. } => "field_format",
            ErrorKind::TruncatedRecord { .. } => "truncated_record",
            ErrorKind::UnexpectedData => "unexpected_data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverableError {
    pub offset: usize,
    #[serde(flatten)]
    pub kind: ErrorKind,
}

impl From<DecodeError> for RecoverableError {
    fn from(value: DecodeError) -> Self {
        match value {
            DecodeError::ChecksumMismatch {
                offset,
                stored,
                computed,
            } => RecoverableError {
                offset,
                kind: ErrorKind::ChecksumMismatch { stored, computed },
            },
            DecodeError::FieldFormat { offset, field } => RecoverableError {
                offset,
                kind: ErrorKind::FieldFormat { field },
            },
            DecodeError::TruncatedRecord {
                offset,
                needed,
                actual,
            } => RecoverableError {
                offset,
                kind: ErrorKind::TruncatedRecord { needed, actual },
            },
            DecodeError::UnexpectedData { offset } => RecoverableError {
                offset,
                kind: ErrorKind::UnexpectedData,
            },
        }
    }
}

/// Progress of one engine over one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseState {
    /// Next unread byte; never decreases.
    pub cursor_offset: usize,
    pub particles_emitted: usize,
    pub recoverable_errors: Vec<RecoverableError>,
}

impl ParseState {
    pub(crate) fn starting_at(offset: usize) -> Self {
        Self {
            cursor_offset: offset,
            ..Self::default()
        }
    }

    pub(crate) fn advance(&mut self, offset: usize) {
        self.cursor_offset = self.cursor_offset.max(offset);
    }

    pub(crate) fn record(&mut self, error: RecoverableError) {
        self.recoverable_errors.push(error);
    }
}

/// Engine life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Scanning,
    Decoding,
    Emitting,
    Finished,
    Aborted,
}

/// A resumable position, held by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub offset: usize,
    /// First stream of the record at `offset` not yet handed out.
    #[serde(default)]
    pub next_stream: usize,
}
