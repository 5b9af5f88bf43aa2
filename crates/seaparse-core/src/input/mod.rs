//! File input and controller unwrapping.
//!
//! Bare files are used as-is. Files logged through a data controller in
//! `controller_hex` form are unwrapped into the binary stream they carry;
//! every payload byte keeps the controller clock of the line it arrived on
//! so records can be given a port timestamp.

pub mod error;
pub mod layout;

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use time::PrimitiveDateTime;
use time::format_description::BorrowedFormatItem;
use time::macros::format_description;
use tracing::debug;

use crate::schema::WrapperKind;
use crate::timestamp::Timestamp;

pub use error::InputError;

const STAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]/[month]/[day] [hour]:[minute]:[second].[subsecond digits:3]");

static HEX_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(layout::HEX_LINE_PATTERN).expect("invalid controller hex pattern"));

/// Parse a controller clock prefix (`YYYY/MM/DD HH:MM:SS.mmm`).
///
/// # Examples
/// ```
/// use seaparse_core::input::parse_controller_stamp;
///
/// let ts = parse_controller_stamp("2014/08/17 00:57:10.648").unwrap();
/// assert!((ts.unix_seconds() - 1_408_237_030.648).abs() < 1e-6);
/// assert!(parse_controller_stamp("2014/13/17 00:57:10.648").is_none());
/// ```
pub fn parse_controller_stamp(text: &str) -> Option<Timestamp> {
    let stamp = text.get(..layout::CONTROLLER_STAMP_LEN)?;
    PrimitiveDateTime::parse(stamp, STAMP_FORMAT)
        .ok()
        .map(Timestamp::from_datetime)
}

/// Controller clock marks over an unwrapped buffer.
///
/// A mark applies from its offset up to the next mark.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PortClock {
    marks: Vec<(usize, Option<Timestamp>)>,
}

impl PortClock {
    fn mark(&mut self, offset: usize, stamp: Option<Timestamp>) {
        self.marks.push((offset, stamp));
    }

    /// Port timestamp of the byte at `offset`.
    pub fn at(&self, offset: usize) -> Option<Timestamp> {
        let idx = self.marks.partition_point(|(start, _)| *start <= offset);
        idx.checked_sub(1).and_then(|idx| self.marks[idx].1)
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}

/// The byte stream a scanner works on.
#[derive(Debug, Clone, Default)]
pub struct InputBuffer {
    bytes: Vec<u8>,
    port_clock: PortClock,
    rejected: Vec<usize>,
}

impl InputBuffer {
    /// Read and unwrap a file.
    ///
    /// # Errors
    /// Returns `InputError::Io` when the file cannot be read.
    pub fn open(path: &Path, wrapper: WrapperKind) -> Result<Self, InputError> {
        let raw = std::fs::read(path).map_err(|source| InputError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_bytes(raw, wrapper))
    }

    pub fn from_bytes(raw: Vec<u8>, wrapper: WrapperKind) -> Self {
        match wrapper {
            WrapperKind::None | WrapperKind::Controller => Self {
                bytes: raw,
                ..Self::default()
            },
            WrapperKind::ControllerHex => unwrap_controller_hex(&raw),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn port_clock(&self) -> &PortClock {
        &self.port_clock
    }

    /// Buffer offsets at which a wrapper line without a controller clock was
    /// dropped.
    pub fn rejected(&self) -> &[usize] {
        &self.rejected
    }
}

fn unwrap_controller_hex(raw: &[u8]) -> InputBuffer {
    let mut buffer = InputBuffer::default();
    for line in raw.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let Ok(text) = std::str::from_utf8(line) else {
            buffer.rejected.push(buffer.bytes.len());
            continue;
        };
        let Some(caps) = HEX_LINE.captures(text) else {
            if parse_controller_stamp(text).is_some() {
                // controller status message, not instrument data
                debug!(line = text, "ignoring controller line without payload");
            } else {
                buffer.rejected.push(buffer.bytes.len());
            }
            continue;
        };
        let hex = &caps["hex"];
        let Some(payload) = decode_hex(hex) else {
            buffer.rejected.push(buffer.bytes.len());
            continue;
        };
        if payload.is_empty() {
            continue;
        }
        let stamp = parse_controller_stamp(&caps["stamp"]);
        buffer.port_clock.mark(buffer.bytes.len(), stamp);
        buffer.bytes.extend_from_slice(&payload);
    }
    buffer
}

fn decode_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    hex.as_bytes()
        .chunks_exact(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).ok()?;
            u8::from_str_radix(pair, 16).ok()
        })
        .collect()
}
