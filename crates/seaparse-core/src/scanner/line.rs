use crate::input::parse_controller_stamp;
use crate::schema::WrapperKind;

use super::error::StreamError;
use super::{RawRecord, RecordScanner, Scanned, StreamCursor};

/// Terminator-delimited ASCII records.
#[derive(Debug, Clone)]
pub struct LineScanner {
    terminator: Vec<u8>,
    wrapper: WrapperKind,
}

impl LineScanner {
    pub fn new(terminator: Vec<u8>, wrapper: WrapperKind) -> Self {
        Self {
            terminator,
            wrapper,
        }
    }

    fn find_terminator(&self, bytes: &[u8], from: usize) -> Option<usize> {
        bytes[from..]
            .windows(self.terminator.len())
            .position(|window| window == self.terminator.as_slice())
            .map(|idx| from + idx)
    }
}

impl RecordScanner for LineScanner {
    fn next_record<'a>(&self, cursor: &mut StreamCursor<'a>) -> Result<Scanned<'a>, StreamError> {
        let bytes = cursor.bytes();
        let mut pos = cursor.offset();
        loop {
            if pos >= bytes.len() {
                cursor.advance_to(pos);
                return Ok(Scanned::EndOfStream);
            }
            let Some(end) = self.find_terminator(bytes, pos) else {
                let fragment = &bytes[pos..];
                if fragment.iter().all(u8::is_ascii_whitespace) {
                    cursor.advance_to(bytes.len());
                    return Ok(Scanned::EndOfStream);
                }
                cursor.advance_to(pos);
                return Err(StreamError::Truncated {
                    offset: pos,
                    needed: fragment.len() + self.terminator.len(),
                    available: fragment.len(),
                });
            };
            let next = end + self.terminator.len();
            let line = &bytes[pos..end];
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.iter().all(u8::is_ascii_whitespace) {
                pos = next;
                continue;
            }

            let port_timestamp = match self.wrapper {
                WrapperKind::Controller => std::str::from_utf8(line)
                    .ok()
                    .and_then(parse_controller_stamp),
                WrapperKind::None | WrapperKind::ControllerHex => None,
            };
            cursor.advance_to(next);
            return Ok(Scanned::Record(RawRecord {
                offset: pos,
                length: line.len(),
                source: bytes,
                port_timestamp,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LineScanner;
    use crate::input::{PortClock, parse_controller_stamp};
    use crate::scanner::{RecordScanner, Scanned, StreamCursor, StreamError};
    use crate::schema::WrapperKind;

    fn lines(scanner: &LineScanner, bytes: &[u8]) -> (Vec<String>, Option<StreamError>) {
        let clock = PortClock::default();
        let mut cursor = StreamCursor::new(bytes, &clock);
        let mut out = Vec::new();
        loop {
            match scanner.next_record(&mut cursor) {
                Ok(Scanned::Record(raw)) => {
                    out.push(String::from_utf8_lossy(raw.bytes()).into_owned())
                }
                Ok(Scanned::Skipped(_)) => {}
                Ok(Scanned::EndOfStream) => return (out, None),
                Err(err) => return (out, Some(err)),
            }
        }
    }

    #[test]
    fn strips_carriage_returns_and_blank_lines() {
        let scanner = LineScanner::new(b"\n".to_vec(), WrapperKind::None);
        let (out, err) = lines(&scanner, b"a,1\r\n\r\n\nb,2\n");
        assert_eq!(out, vec!["a,1", "b,2"]);
        assert_eq!(err, None);
    }

    #[test]
    fn trailing_fragment_is_truncated() {
        let scanner = LineScanner::new(b"\n".to_vec(), WrapperKind::None);
        let (out, err) = lines(&scanner, b"a,1\nb,");
        assert_eq!(out, vec!["a,1"]);
        assert_eq!(
            err,
            Some(StreamError::Truncated {
                offset: 4,
                needed: 3,
                available: 2
            })
        );
    }

    #[test]
    fn trailing_whitespace_is_not_a_fragment() {
        let scanner = LineScanner::new(b"\n".to_vec(), WrapperKind::None);
        let (out, err) = lines(&scanner, b"a,1\n  ");
        assert_eq!(out, vec!["a,1"]);
        assert_eq!(err, None);
    }

    #[test]
    fn controller_prefix_sets_port_timestamp() {
        let scanner = LineScanner::new(b"\n".to_vec(), WrapperKind::Controller);
        let bytes = b"2014/08/17 00:57:10.648 # 24.5, 0.001\n";
        let clock = PortClock::default();
        let mut cursor = StreamCursor::new(bytes, &clock);
        let Ok(Scanned::Record(raw)) = scanner.next_record(&mut cursor) else {
            panic!("expected record");
        };
        assert_eq!(
            raw.port_timestamp,
            parse_controller_stamp("2014/08/17 00:57:10.648")
        );
        assert_eq!(cursor.offset(), bytes.len());
    }
}
