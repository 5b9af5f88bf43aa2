use tracing::debug;

use crate::bytes::read_uint;
use crate::schema::LengthFieldConfig;

use super::error::StreamError;
use super::{ByteSpan, RawRecord, RecordScanner, Scanned, StreamCursor};

/// Sync-pattern framing with a declared record length.
#[derive(Debug, Clone)]
pub struct BinaryScanner {
    sync: Vec<u8>,
    length: LengthFieldConfig,
    min_length: usize,
    max_resync: usize,
}

enum Candidate {
    /// Sync matched but the declared length is implausible.
    False,
    Record(usize),
    Truncated(StreamError),
}

impl BinaryScanner {
    pub fn new(
        sync: Vec<u8>,
        length: LengthFieldConfig,
        min_length: usize,
        max_resync: usize,
    ) -> Self {
        Self {
            sync,
            length,
            min_length,
            max_resync,
        }
    }

    fn header_len(&self) -> usize {
        self.sync.len().max(self.length.offset + self.length.width)
    }

    fn candidate(&self, bytes: &[u8], pos: usize) -> Candidate {
        let available = bytes.len() - pos;
        let header_len = self.header_len();
        if available < header_len {
            return Candidate::Truncated(StreamError::Truncated {
                offset: pos,
                needed: header_len,
                available,
            });
        }
        let Some(stored) = read_uint(
            bytes,
            pos + self.length.offset,
            self.length.width,
            self.length.endian,
        ) else {
            return Candidate::False;
        };
        let declared = i64::try_from(stored)
            .ok()
            .and_then(|stored| stored.checked_add(self.length.add))
            .and_then(|len| usize::try_from(len).ok());
        match declared {
            Some(len) if len >= self.min_length => {
                if len > available {
                    Candidate::Truncated(StreamError::Truncated {
                        offset: pos,
                        needed: len,
                        available,
                    })
                } else {
                    Candidate::Record(len)
                }
            }
            _ => Candidate::False,
        }
    }

    fn sync_at(&self, bytes: &[u8], pos: usize) -> bool {
        let tail = &bytes[pos..];
        if tail.len() >= self.sync.len() {
            tail.starts_with(&self.sync)
        } else {
            // a partial sync at end of buffer is a truncated header
            self.sync.starts_with(tail)
        }
    }
}

impl RecordScanner for BinaryScanner {
    fn next_record<'a>(&self, cursor: &mut StreamCursor<'a>) -> Result<Scanned<'a>, StreamError> {
        let bytes = cursor.bytes();
        let start = cursor.offset();
        if start >= bytes.len() {
            return Ok(Scanned::EndOfStream);
        }

        let mut pos = start;
        loop {
            if pos - start > self.max_resync {
                return Err(StreamError::Unrecoverable {
                    offset: start,
                    window: self.max_resync,
                });
            }
            if pos >= bytes.len() {
                debug!(offset = start, length = pos - start, "no sync before end of buffer");
                cursor.advance_to(pos);
                return Ok(Scanned::Skipped(ByteSpan {
                    offset: start,
                    length: pos - start,
                }));
            }
            if self.sync_at(bytes, pos) {
                let candidate = self.candidate(bytes, pos);
                if pos > start && !matches!(candidate, Candidate::False) {
                    debug!(offset = start, length = pos - start, "resynchronised");
                    cursor.advance_to(pos);
                    return Ok(Scanned::Skipped(ByteSpan {
                        offset: start,
                        length: pos - start,
                    }));
                }
                match candidate {
                    Candidate::False => {}
                    Candidate::Record(length) => {
                        cursor.advance_to(pos + length);
                        return Ok(Scanned::Record(RawRecord {
                            offset: pos,
                            length,
                            source: bytes,
                            port_timestamp: cursor.port_clock().at(pos),
                        }));
                    }
                    Candidate::Truncated(err) => return Err(err),
                }
            }
            pos += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::BinaryScanner;
    use crate::input::PortClock;
    use crate::scanner::{ByteSpan, RecordScanner, Scanned, StreamCursor, StreamError};
    use crate::schema::{Endian, LengthFieldConfig};

    /// Sync `AA 55`, u8 length at offset 2 counting the whole record.
    fn scanner(max_resync: usize) -> BinaryScanner {
        BinaryScanner::new(
            vec![0xAA, 0x55],
            LengthFieldConfig {
                offset: 2,
                width: 1,
                endian: Endian::Little,
                add: 0,
            },
            4,
            max_resync,
        )
    }

    fn record(len: u8) -> Vec<u8> {
        let mut bytes = vec![0xAA, 0x55, len];
        bytes.resize(len as usize, 0x11);
        bytes
    }

    /// Scan to the end, returning `(offset, length, is_record)` per item.
    fn scan_all(
        scanner: &BinaryScanner,
        bytes: &[u8],
    ) -> (Vec<(usize, usize, bool)>, Option<StreamError>) {
        let clock = PortClock::default();
        let mut cursor = StreamCursor::new(bytes, &clock);
        let mut out = Vec::new();
        loop {
            match scanner.next_record(&mut cursor) {
                Ok(Scanned::EndOfStream) => return (out, None),
                Ok(Scanned::Record(raw)) => out.push((raw.offset, raw.length, true)),
                Ok(Scanned::Skipped(span)) => out.push((span.offset, span.length, false)),
                Err(err) => return (out, Some(err)),
            }
        }
    }

    #[test]
    fn frames_back_to_back_records() {
        let mut bytes = record(5);
        bytes.extend(record(6));
        let clock = PortClock::default();
        let mut cursor = StreamCursor::new(&bytes, &clock);
        let scanner = scanner(64);

        let Ok(Scanned::Record(first)) = scanner.next_record(&mut cursor) else {
            panic!("expected record");
        };
        assert_eq!((first.offset, first.length), (0, 5));
        let Ok(Scanned::Record(second)) = scanner.next_record(&mut cursor) else {
            panic!("expected record");
        };
        assert_eq!((second.offset, second.length), (5, 6));
        assert_eq!(scanner.next_record(&mut cursor), Ok(Scanned::EndOfStream));
    }

    #[test]
    fn garbage_is_reported_as_skipped_span() {
        let mut bytes = vec![0x00, 0x01, 0xAA];
        bytes.extend(record(5));
        let clock = PortClock::default();
        let mut cursor = StreamCursor::new(&bytes, &clock);
        let scanner = scanner(64);

        assert_eq!(
            scanner.next_record(&mut cursor),
            Ok(Scanned::Skipped(ByteSpan {
                offset: 0,
                length: 3
            }))
        );
        let Ok(Scanned::Record(raw)) = scanner.next_record(&mut cursor) else {
            panic!("expected record");
        };
        assert_eq!(raw.offset, 3);
        assert_eq!(raw.bytes()[..2], [0xAA, 0x55]);
    }

    #[test]
    fn short_declared_length_is_a_false_sync() {
        // sync followed by a length below min_length
        let mut bytes = vec![0xAA, 0x55, 0x01];
        bytes.extend(record(4));
        let clock = PortClock::default();
        let mut cursor = StreamCursor::new(&bytes, &clock);
        let scanner = scanner(64);

        assert_eq!(
            scanner.next_record(&mut cursor),
            Ok(Scanned::Skipped(ByteSpan {
                offset: 0,
                length: 3
            }))
        );
        assert!(matches!(scanner.next_record(&mut cursor), Ok(Scanned::Record(raw)) if raw.offset == 3));
    }

    #[test]
    fn declared_length_past_end_is_truncated() {
        let mut bytes = record(5);
        bytes.extend(&record(8)[..6]);
        let clock = PortClock::default();
        let mut cursor = StreamCursor::new(&bytes, &clock);
        let scanner = scanner(64);

        assert!(matches!(scanner.next_record(&mut cursor), Ok(Scanned::Record(_))));
        assert_eq!(
            scanner.next_record(&mut cursor),
            Err(StreamError::Truncated {
                offset: 5,
                needed: 8,
                available: 6
            })
        );
    }

    #[test]
    fn partial_sync_at_end_is_truncated() {
        let mut bytes = record(5);
        bytes.push(0xAA);
        let clock = PortClock::default();
        let mut cursor = StreamCursor::new(&bytes, &clock);
        let scanner = scanner(64);

        assert!(matches!(scanner.next_record(&mut cursor), Ok(Scanned::Record(_))));
        assert!(matches!(
            scanner.next_record(&mut cursor),
            Err(StreamError::Truncated { offset: 5, .. })
        ));
    }

    #[test]
    fn resync_window_is_bounded() {
        let mut bytes = vec![0u8; 32];
        bytes.extend(record(5));
        let (_, err) = scan_all(&scanner(8), &bytes);
        assert_eq!(
            err,
            Some(StreamError::Unrecoverable {
                offset: 0,
                window: 8
            })
        );
    }

    #[test]
    fn trailing_garbage_within_window_is_skipped() {
        let mut bytes = record(5);
        bytes.extend([1, 2, 3]);
        let (scanned, err) = scan_all(&scanner(64), &bytes);
        assert_eq!(err, None);
        assert_eq!(scanned, vec![(0, 5, true), (5, 3, false)]);
    }
}
