//! Record framing.
//!
//! A scanner finds the boundaries of the next raw record in an unwrapped
//! buffer. Binary framing hunts for a sync pattern and trusts the declared
//! length; line framing splits on a terminator. Scanners never interpret
//! record contents.

mod binary;
pub mod error;
mod line;

pub use binary::BinaryScanner;
pub use error::StreamError;
pub use line::LineScanner;

use crate::input::PortClock;
use crate::schema::Framing;
use crate::timestamp::Timestamp;

/// A framed record: a byte span of the buffer it was found in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawRecord<'a> {
    pub offset: usize,
    pub length: usize,
    pub source: &'a [u8],
    pub port_timestamp: Option<Timestamp>,
}

impl<'a> RawRecord<'a> {
    pub fn bytes(&self) -> &'a [u8] {
        &self.source[self.offset..self.offset + self.length]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteSpan {
    pub offset: usize,
    pub length: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Scanned<'a> {
    Record(RawRecord<'a>),
    /// Bytes passed over while resynchronising.
    Skipped(ByteSpan),
    EndOfStream,
}

/// Forward-only position in a buffer.
#[derive(Debug, Clone)]
pub struct StreamCursor<'a> {
    bytes: &'a [u8],
    offset: usize,
    port_clock: &'a PortClock,
}

impl<'a> StreamCursor<'a> {
    pub fn new(bytes: &'a [u8], port_clock: &'a PortClock) -> Self {
        Self::at(bytes, port_clock, 0)
    }

    pub fn at(bytes: &'a [u8], port_clock: &'a PortClock, offset: usize) -> Self {
        Self {
            bytes,
            offset: offset.min(bytes.len()),
            port_clock,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    pub(crate) fn port_clock(&self) -> &'a PortClock {
        self.port_clock
    }

    pub(crate) fn advance_to(&mut self, offset: usize) {
        debug_assert!(offset >= self.offset);
        self.offset = offset.clamp(self.offset, self.bytes.len());
    }
}

pub trait RecordScanner {
    /// Frame the next record at or after the cursor and advance past it.
    ///
    /// # Errors
    /// Returns a `StreamError` when framing cannot continue in this buffer.
    fn next_record<'a>(&self, cursor: &mut StreamCursor<'a>) -> Result<Scanned<'a>, StreamError>;
}

/// Build the scanner matching an instrument's framing.
pub fn scanner_for(framing: &Framing) -> Box<dyn RecordScanner + Send + Sync> {
    match framing {
        Framing::Binary {
            sync,
            length,
            min_length,
            max_resync,
            ..
        } => Box::new(BinaryScanner::new(
            sync.clone(),
            length.clone(),
            *min_length,
            *max_resync,
        )),
        Framing::Lines {
            terminator,
            wrapper,
        } => Box::new(LineScanner::new(terminator.clone(), *wrapper)),
    }
}
