use crate::bytes::read_uint;
use crate::schema::ChecksumConfig;

use super::error::DecodeError;

/// Sum of `bytes` modulo 2^(8 * width).
pub fn modular_sum(bytes: &[u8], width: usize) -> u64 {
    let sum = bytes
        .iter()
        .fold(0u64, |acc, &b| acc.wrapping_add(u64::from(b)));
    if width >= 8 {
        sum
    } else {
        sum & ((1u64 << (width * 8)) - 1)
    }
}

/// Verify the trailing checksum of a record and return its body length.
///
/// # Errors
/// `ChecksumMismatch` when the stored and computed values differ;
/// `TruncatedRecord` when the record cannot hold the checksum.
pub fn verify(
    checksum: &ChecksumConfig,
    record: &[u8],
    record_offset: usize,
) -> Result<usize, DecodeError> {
    match checksum {
        ChecksumConfig::None => Ok(record.len()),
        ChecksumConfig::ModularSum { width, endian } => {
            let body_len = record.len().checked_sub(*width).ok_or(DecodeError::TruncatedRecord {
                offset: record_offset,
                needed: *width,
                actual: record.len(),
            })?;
            let stored = read_uint(record, body_len, *width, *endian).ok_or(
                DecodeError::TruncatedRecord {
                    offset: record_offset,
                    needed: record.len() + 1,
                    actual: record.len(),
                },
            )?;
            let computed = modular_sum(&record[..body_len], *width);
            if stored != computed {
                return Err(DecodeError::ChecksumMismatch {
                    offset: record_offset,
                    stored,
                    computed,
                });
            }
            Ok(body_len)
        }
    }
}
