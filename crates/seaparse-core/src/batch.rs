//! Multi-file driver.
//!
//! Files are independent: a fixed pool of scoped worker threads pulls paths
//! from a work queue, parses each file with its own engine and writes its
//! particles as JSON lines. Reports travel back over a result queue. A
//! worker checks the cancel flag before taking the next file; the file in
//! progress always finishes.
//!
//! Output is written to `<stem>.particles.jsonl.partial` and renamed on
//! completion, so an existing `<stem>.particles.jsonl` marks a finished file
//! and is skipped on re-runs.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::unbounded;
use serde::Serialize;
use tracing::{debug, info};

use crate::engine::ParserEngine;
use crate::schema::CompiledInstrument;
use crate::{FileReport, FileStatus};

pub const PARTICLES_SUFFIX: &str = "particles.jsonl";
const PARTIAL_SUFFIX: &str = "partial";

pub struct BatchJob<'a> {
    pub instrument: &'a CompiledInstrument,
    pub files: Vec<PathBuf>,
    pub output_dir: PathBuf,
    pub workers: usize,
    pub cancel: &'a AtomicBool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    /// One report per started file, in input order.
    pub reports: Vec<FileReport>,
    /// Files never started because the batch was cancelled.
    pub not_started: Vec<String>,
}

impl BatchSummary {
    pub fn count(&self, status: FileStatus) -> usize {
        self.reports
            .iter()
            .filter(|report| report.status == status)
            .count()
    }
}

/// Particle output path for `input` under `output_dir`.
pub fn output_path(output_dir: &Path, input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "input".to_string());
    output_dir.join(format!("{stem}.{PARTICLES_SUFFIX}"))
}

pub fn run_batch(job: &BatchJob<'_>) -> BatchSummary {
    let (work_tx, work_rx) = unbounded::<(usize, &Path)>();
    let (result_tx, result_rx) = unbounded::<(usize, FileReport)>();
    for (idx, path) in job.files.iter().enumerate() {
        // receivers outlive this loop
        let _ = work_tx.send((idx, path.as_path()));
    }
    drop(work_tx);

    let workers = job.workers.clamp(1, job.files.len().max(1));
    std::thread::scope(|scope| {
        for worker in 0..workers {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move || {
                loop {
                    if job.cancel.load(Ordering::SeqCst) {
                        debug!(worker, "cancelled, not taking further files");
                        break;
                    }
                    let Ok((idx, path)) = work_rx.recv() else {
                        break;
                    };
                    let report = parse_file_to(job.instrument, path, &job.output_dir);
                    if result_tx.send((idx, report)).is_err() {
                        break;
                    }
                }
            });
        }
    });
    drop(result_tx);

    let mut finished: Vec<Option<FileReport>> = vec![None; job.files.len()];
    for (idx, report) in result_rx.iter() {
        finished[idx] = Some(report);
    }
    let mut summary = BatchSummary {
        reports: Vec::with_capacity(job.files.len()),
        not_started: Vec::new(),
    };
    for (path, report) in job.files.iter().zip(finished) {
        match report {
            Some(report) => summary.reports.push(report),
            None => summary.not_started.push(path.display().to_string()),
        }
    }
    info!(
        files = job.files.len(),
        success = summary.count(FileStatus::Success),
        partial = summary.count(FileStatus::Partial),
        failed = summary.count(FileStatus::Failed),
        skipped = summary.count(FileStatus::Skipped),
        not_started = summary.not_started.len(),
        "batch finished"
    );
    summary
}

/// Parse one file and write its particles under `output_dir`.
///
/// Never fails: I/O problems become a `Failed` report.
pub fn parse_file_to(instrument: &CompiledInstrument, path: &Path, output_dir: &Path) -> FileReport {
    let source = source_name(path);
    let target = output_path(output_dir, path);
    if target.exists() {
        debug!(path = %path.display(), "output exists, skipping");
        return FileReport::skipped(&source, &instrument.id);
    }

    let engine = match ParserEngine::open(instrument, path) {
        Ok(engine) => engine,
        Err(err) => return FileReport::io_failure(&source, &instrument.id, err.to_string()),
    };
    let partial = target.with_extension(format!("jsonl.{PARTIAL_SUFFIX}"));
    match write_particles(engine, &partial) {
        Ok(report) => match std::fs::rename(&partial, &target) {
            Ok(()) => report,
            Err(err) => report.with_io_error(format!("failed to finalise {}: {err}", target.display())),
        },
        Err((report, err)) => {
            let _ = std::fs::remove_file(&partial);
            report.with_io_error(format!("failed to write {}: {err}", partial.display()))
        }
    }
}

fn write_particles(
    mut engine: ParserEngine<'_>,
    path: &Path,
) -> Result<FileReport, (FileReport, std::io::Error)> {
    let file = match File::create(path) {
        Ok(file) => file,
        Err(err) => return Err((engine.finish(), err)),
    };
    let mut writer = BufWriter::new(file);
    let mut written = || -> std::io::Result<()> {
        for particle in engine.by_ref() {
            serde_json::to_writer(&mut writer, &particle)?;
            writer.write_all(b"\n")?;
        }
        writer.flush()
    };
    match written() {
        Ok(()) => Ok(engine.finish()),
        Err(err) => Err((engine.finish(), err)),
    }
}

fn source_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
