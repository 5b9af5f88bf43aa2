//! seaparse core library for oceanographic telemetry decoding.
//!
//! Raw instrument recordings flow through a fixed pipeline: `input` reads a
//! file and unwraps controller logging, a `scanner` frames records, a
//! `decoder` turns each record into typed fields, and the `particle`
//! builder stamps them with port and instrument time, one particle per
//! stream the record feeds. The `engine` drives
//! this per file; `batch` fans files out over worker threads; `echogram`
//! aggregates acoustic particles into depth x time matrices.
//!
//! Every instrument is described by a TOML document compiled once into a
//! [`SchemaTable`]; adding an instrument means adding a schema, not code.
//!
//! Invariants:
//! - A particle exists only for a record that passed checksum or grammar
//!   validation.
//! - Corrupt records are skipped and reported; they never end a file.
//! - Identical input yields identical particles and error offsets.
//!
//! Version française (résumé):
//! Cette crate décode des fichiers bruts d'instruments océanographiques :
//! entrée -> découpage -> décodage -> particules horodatées, avec un rapport
//! d'erreurs par fichier. Les enregistrements corrompus sont ignorés et
//! comptabilisés, jamais réparés.
//!
//! # Examples
//! ```no_run
//! use std::path::Path;
//!
//! use seaparse_core::{InstrumentConfig, ParserEngine, SchemaTable};
//!
//! let config = InstrumentConfig::from_toml_str(&std::fs::read_to_string("adcp_pd0.toml")?)?;
//! let table = SchemaTable::compile(vec![config])?;
//! let instrument = table.get("adcp_pd0")?;
//! let mut engine = ParserEngine::open(instrument, Path::new("ensembles.000"))?;
//! for particle in engine.by_ref() {
//!     println!("{}", serde_json::to_string(&particle)?);
//! }
//! println!("status: {:?}", engine.finish().status);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod batch;
mod bytes;
pub mod decoder;
pub mod echogram;
pub mod engine;
pub mod input;
pub mod particle;
pub mod scanner;
pub mod schema;
pub mod timestamp;

pub use batch::{BatchJob, BatchSummary, run_batch};
pub use decoder::{DecodeError, DecodedFields, FieldValue};
pub use echogram::render::{EchogramMetadata, EchogramRenderer, PngRenderer, RenderError};
pub use echogram::{ContrastWindow, EchogramAssembler, EchogramMatrix, TimeRange};
pub use engine::{Checkpoint, ErrorKind, ParseState, ParserEngine, Phase, RecoverableError};
pub use input::{InputBuffer, InputError};
pub use particle::{Particle, QualityFlag};
pub use scanner::StreamError;
pub use schema::{CompiledInstrument, ConfigError, InstrumentConfig, SchemaTable, StreamSpec};
pub use timestamp::{Epoch, Timestamp};

/// Current file report schema version.
pub const REPORT_VERSION: u32 = 1;

/// Outcome of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Every record decoded.
    Success,
    /// Some particles were produced, some records were not.
    Partial,
    /// No particles and at least one problem.
    Failed,
    /// Output already present; not decoded again.
    Skipped,
}

impl FileStatus {
    /// Status of a parsed file.
    ///
    /// # Examples
    /// ```
    /// use seaparse_core::FileStatus;
    ///
    /// assert_eq!(FileStatus::from_outcome(10, false), FileStatus::Success);
    /// assert_eq!(FileStatus::from_outcome(10, true), FileStatus::Partial);
    /// assert_eq!(FileStatus::from_outcome(0, true), FileStatus::Failed);
    /// assert_eq!(FileStatus::from_outcome(0, false), FileStatus::Success);
    /// ```
    pub fn from_outcome(particles: usize, had_problems: bool) -> Self {
        match (particles, had_problems) {
            (_, false) => FileStatus::Success,
            (0, true) => FileStatus::Failed,
            (_, true) => FileStatus::Partial,
        }
    }
}

/// Per-file report with errors aggregated once.
///
/// # Examples
/// ```
/// use seaparse_core::{FileReport, FileStatus};
///
/// let report = FileReport::skipped("ensembles.000", "adcp_pd0");
/// assert_eq!(report.status, FileStatus::Skipped);
/// assert_eq!(report.particles, 0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReport {
    /// Report schema version (not the binary version).
    pub report_version: u32,
    /// Input file name.
    pub source: String,
    pub instrument_id: String,
    pub status: FileStatus,
    /// Particles emitted.
    pub particles: usize,
    /// Particles suppressed as repeats of the previous one.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub suppressed_duplicates: usize,
    /// Offset of the first byte not consumed.
    pub bytes_consumed: usize,
    /// Recoverable error totals keyed by kind, in stable order.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub error_counts: BTreeMap<String, usize>,
    /// Recoverable errors ordered by offset.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recoverable_errors: Vec<RecoverableError>,
    /// Framing error that ended the file early.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_error: Option<StreamError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub io_error: Option<String>,
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

impl FileReport {
    pub fn skipped(source: &str, instrument_id: &str) -> Self {
        Self::empty(source, instrument_id, FileStatus::Skipped)
    }

    pub fn io_failure(source: &str, instrument_id: &str, message: String) -> Self {
        let mut report = Self::empty(source, instrument_id, FileStatus::Failed);
        report.io_error = Some(message);
        report
    }

    fn empty(source: &str, instrument_id: &str, status: FileStatus) -> Self {
        Self {
            report_version: REPORT_VERSION,
            source: source.to_string(),
            instrument_id: instrument_id.to_string(),
            status,
            particles: 0,
            suppressed_duplicates: 0,
            bytes_consumed: 0,
            error_counts: BTreeMap::new(),
            recoverable_errors: Vec::new(),
            terminal_error: None,
            io_error: None,
        }
    }

    /// Attach an output problem; the file can no longer count as a success.
    pub fn with_io_error(mut self, message: String) -> Self {
        self.io_error = Some(message);
        self.status = FileStatus::from_outcome(self.particles, true);
        self
    }

    pub(crate) fn count_errors(errors: &[RecoverableError]) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for error in errors {
            *counts.entry(error.kind.name().to_string()).or_insert(0) += 1;
        }
        counts
    }
}
