use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Framing failures. Both variants end the file.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamError {
    #[error("no sync pattern within {window} bytes after offset {offset}")]
    Unrecoverable { offset: usize, window: usize },
    #[error("truncated record at offset {offset}: need {needed} bytes, {available} available")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
}

impl StreamError {
    pub fn offset(&self) -> usize {
        match self {
            StreamError::Unrecoverable { offset, .. } | StreamError::Truncated { offset, .. } => {
                *offset
            }
        }
    }
}
