use crate::bytes::read_uint;
use crate::schema::Endian;

use super::error::DecodeError;

/// Bounded reads over one record (or one sub-record window of it).
///
/// Every failed read reports `TruncatedRecord` against the record start.
#[derive(Debug, Clone, Copy)]
pub struct FieldReader<'a> {
    bytes: &'a [u8],
    endian: Endian,
    record_offset: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(bytes: &'a [u8], endian: Endian, record_offset: usize) -> Self {
        Self {
            bytes,
            endian,
            record_offset,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn record_offset(&self) -> usize {
        self.record_offset
    }

    fn too_short(&self, needed: usize) -> DecodeError {
        DecodeError::TruncatedRecord {
            offset: self.record_offset,
            needed,
            actual: self.bytes.len(),
        }
    }

    pub fn require_len(&self, needed: usize) -> Result<(), DecodeError> {
        if self.bytes.len() < needed {
            return Err(self.too_short(needed));
        }
        Ok(())
    }

    /// Narrow the reader to `range`, keeping the record offset for errors.
    pub fn window(&self, range: std::ops::Range<usize>) -> Result<FieldReader<'a>, DecodeError> {
        let end = range.end;
        self.bytes
            .get(range)
            .map(|bytes| FieldReader { bytes, ..*self })
            .ok_or_else(|| self.too_short(end))
    }

    pub fn read_uint(&self, offset: usize, width: usize) -> Result<u64, DecodeError> {
        read_uint(self.bytes, offset, width, self.endian)
            .ok_or_else(|| self.too_short(offset.saturating_add(width)))
    }

    pub fn read_f32(&self, offset: usize) -> Result<f32, DecodeError> {
        self.read_uint(offset, 4)
            .map(|raw| f32::from_bits(raw as u32))
    }

    pub fn read_usize(&self, offset: usize, width: usize) -> Result<usize, DecodeError> {
        let raw = self.read_uint(offset, width)?;
        usize::try_from(raw).map_err(|_| self.too_short(usize::MAX))
    }
}
