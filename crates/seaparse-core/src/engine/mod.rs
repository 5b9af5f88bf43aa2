//! Per-file parse engine.
//!
//! The engine drives scanner, decoder and particle builder over one input
//! buffer and hands out particles lazily. A record yields one particle per
//! stream it feeds; particles not yet handed out stay queued and a checkpoint
//! taken between them points back into the record. Record-level failures are
//! recorded and skipped; a framing failure ends the file. Output depends only
//! on the input bytes, never on how many particles are requested per call.

mod state;

use std::collections::VecDeque;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::decoder::{DecodedFields, RecordDecoder, decoder_for};
use crate::input::{InputBuffer, InputError};
use crate::particle::{BuildContext, Particle, ParticleBuilder};
use crate::scanner::{RecordScanner, Scanned, StreamCursor, StreamError, scanner_for};
use crate::schema::CompiledInstrument;
use crate::timestamp::Timestamp;
use crate::{FileReport, FileStatus, REPORT_VERSION};

pub use state::{Checkpoint, ErrorKind, ParseState, Phase, RecoverableError};

pub struct ParserEngine<'s> {
    instrument: &'s CompiledInstrument,
    input: InputBuffer,
    source_name: String,
    scanner: Box<dyn RecordScanner + Send + Sync>,
    decoder: Box<dyn RecordDecoder + Send + Sync + 's>,
    builder: ParticleBuilder<'s>,
    state: ParseState,
    phase: Phase,
    terminal: Option<StreamError>,
    /// Particles of the current record not yet handed out, with stream index.
    pending: VecDeque<(usize, Particle)>,
    pending_offset: usize,
    /// Streams already handed out for the record at a resumed checkpoint.
    resume_skip: Option<(usize, usize)>,
    /// Last emitted fields per stream, for duplicate suppression.
    last_fields: Vec<Option<DecodedFields>>,
    suppressed: usize,
}

impl<'s> ParserEngine<'s> {
    /// Start at the beginning of `input`.
    pub fn new(instrument: &'s CompiledInstrument, input: InputBuffer, source_name: &str) -> Self {
        Self::resume_from(instrument, input, source_name, Checkpoint::default())
    }

    /// Read `path` with the instrument's wrapper and start at its beginning.
    ///
    /// # Errors
    /// Returns `InputError` when the file cannot be read.
    pub fn open(instrument: &'s CompiledInstrument, path: &Path) -> Result<Self, InputError> {
        let input = InputBuffer::open(path, instrument.framing.wrapper())?;
        let source_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::new(instrument, input, &source_name))
    }

    /// Continue from a checkpoint taken on the same input.
    ///
    /// Duplicate suppression restarts at the checkpoint. Streams before
    /// `next_stream` are skipped for the record at the checkpoint offset.
    pub fn resume_from(
        instrument: &'s CompiledInstrument,
        input: InputBuffer,
        source_name: &str,
        checkpoint: Checkpoint,
    ) -> Self {
        let mut state = ParseState::starting_at(checkpoint.offset.min(input.bytes().len()));
        for &offset in input.rejected() {
            if offset >= state.cursor_offset {
                state.record(RecoverableError {
                    offset,
                    kind: ErrorKind::UnexpectedData,
                });
            }
        }
        Self {
            instrument,
            scanner: scanner_for(&instrument.framing),
            decoder: decoder_for(&instrument.family),
            builder: ParticleBuilder::new(instrument),
            input,
            source_name: source_name.to_string(),
            state,
            phase: Phase::Idle,
            terminal: None,
            pending: VecDeque::new(),
            pending_offset: 0,
            resume_skip: (checkpoint.next_stream > 0)
                .then_some((checkpoint.offset, checkpoint.next_stream)),
            last_fields: vec![None; instrument.streams.len()],
            suppressed: 0,
        }
    }

    pub fn checkpoint(&self) -> Checkpoint {
        match self.pending.front() {
            Some(&(next_stream, _)) => Checkpoint {
                offset: self.pending_offset,
                next_stream,
            },
            None => Checkpoint {
                offset: self.state.cursor_offset,
                next_stream: 0,
            },
        }
    }

    pub fn state(&self) -> &ParseState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Up to `n` further particles; fewer only at end of input.
    pub fn get_records(&mut self, n: usize) -> Vec<Particle> {
        let mut out = Vec::with_capacity(n.min(1024));
        while out.len() < n {
            match self.step() {
                Some(particle) => out.push(particle),
                None => break,
            }
        }
        out
    }

    fn step(&mut self) -> Option<Particle> {
        loop {
            if let Some((_, particle)) = self.pending.pop_front() {
                self.state.particles_emitted += 1;
                return Some(particle);
            }
            if matches!(self.phase, Phase::Finished | Phase::Aborted) {
                return None;
            }
            self.phase = Phase::Scanning;
            let mut cursor = StreamCursor::at(
                self.input.bytes(),
                self.input.port_clock(),
                self.state.cursor_offset,
            );
            let scanned = match self.scanner.next_record(&mut cursor) {
                Ok(scanned) => scanned,
                Err(err) => {
                    warn!(source = %self.source_name, error = %err, "stream ended early");
                    self.terminal = Some(err);
                    self.phase = Phase::Aborted;
                    return None;
                }
            };
            self.state.advance(cursor.offset());

            let raw = match scanned {
                Scanned::EndOfStream => {
                    self.phase = Phase::Finished;
                    return None;
                }
                Scanned::Skipped(span) => {
                    debug!(source = %self.source_name, offset = span.offset, length = span.length, "skipped corrupt bytes");
                    self.state.record(RecoverableError {
                        offset: span.offset,
                        kind: ErrorKind::Corrupt {
                            length: span.length,
                        },
                    });
                    continue;
                }
                Scanned::Record(raw) => raw,
            };

            self.phase = Phase::Decoding;
            let fields = match self.decoder.decode(&raw) {
                Ok(Some(fields)) => fields,
                Ok(None) => continue,
                Err(err) => {
                    debug!(source = %self.source_name, error = %err, "rejected record");
                    self.state.record(err.into());
                    continue;
                }
            };

            let skip = match self.resume_skip.take() {
                Some((offset, next_stream)) if offset == raw.offset => next_stream,
                _ => 0,
            };
            self.phase = Phase::Emitting;
            self.queue(&fields, raw.offset, raw.port_timestamp, skip);
        }
    }

    /// Build each stream's particle for one record, dropping repeats on
    /// deduplicated streams.
    fn queue(
        &mut self,
        fields: &DecodedFields,
        offset: usize,
        port_timestamp: Option<Timestamp>,
        skip: usize,
    ) {
        let instrument = self.instrument;
        let context = BuildContext {
            source_name: &self.source_name,
            offset,
            port_timestamp,
        };
        for (idx, stream) in instrument.streams.iter().enumerate().skip(skip) {
            let Some(particle) = self.builder.build(stream, fields, &context) else {
                continue;
            };
            if stream.dedupe {
                let last = &mut self.last_fields[idx];
                if last.as_ref().is_some_and(|last| last.same_as(&particle.fields)) {
                    self.suppressed += 1;
                    continue;
                }
                *last = Some(particle.fields.clone());
            }
            self.pending.push_back((idx, particle));
        }
        self.pending_offset = offset;
    }

    /// Report on everything consumed so far, including any terminal error.
    ///
    /// Call after the particle sequence has ended to report on the whole file.
    pub fn finish(self) -> FileReport {
        let mut errors = self.state.recoverable_errors;
        errors.sort_by_key(|error| error.offset);
        let status = FileStatus::from_outcome(
            self.state.particles_emitted,
            !errors.is_empty() || self.terminal.is_some(),
        );
        info!(
            source = %self.source_name,
            instrument = %self.instrument.id,
            particles = self.state.particles_emitted,
            errors = errors.len(),
            status = ?status,
            "file parsed"
        );
        FileReport {
            report_version: REPORT_VERSION,
            source: self.source_name,
            instrument_id: self.instrument.id.clone(),
            status,
            particles: self.state.particles_emitted,
            suppressed_duplicates: self.suppressed,
            bytes_consumed: self.state.cursor_offset,
            error_counts: FileReport::count_errors(&errors),
            recoverable_errors: errors,
            terminal_error: self.terminal,
            io_error: None,
        }
    }
}

impl Iterator for ParserEngine<'_> {
    type Item = Particle;

    fn next(&mut self) -> Option<Particle> {
        self.step()
    }
}
