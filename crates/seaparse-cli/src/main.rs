use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use glob::glob;
use seaparse_core::{
    BatchJob, CompiledInstrument, ConfigError, EchogramAssembler, EchogramMatrix,
    EchogramMetadata, FileReport, FileStatus, InstrumentConfig, ParserEngine, PngRenderer,
    SchemaTable, Timestamp, run_batch,
};
use time::macros::format_description;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const EXAMPLES: &str = "Examples:\n  seaparse instruments\n  seaparse parse ensembles.000 -i adcp_pd0 -o ensembles.jsonl\n  seaparse parse 'logs/20140817*.log' -i ctdbp_dcl --stdout\n  seaparse batch 'raw/*.000' -i adcp_pd0 --out-dir particles -j 4\n  seaparse echogram 'raw/*.01A' -i zplsc_profile --out-dir echograms";

#[derive(Parser, Debug)]
#[command(name = "seaparse")]
#[command(version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("SEAPARSE_BUILD_COMMIT"), ")"))]
#[command(long_version = concat!(
    env!("CARGO_PKG_VERSION"),
    "\ncommit: ",
    env!("SEAPARSE_BUILD_COMMIT"),
    "\ncommit date: ",
    env!("SEAPARSE_BUILD_DATE")
))]
#[command(
    about = "Decoder for raw oceanographic instrument telemetry.",
    long_about = None,
    after_help = EXAMPLES
)]
struct Cli {
    /// Directory holding one TOML document per instrument
    #[arg(long, global = true, default_value = "instruments")]
    instruments: PathBuf,

    /// Raise log verbosity (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the instruments defined in the instrument directory.
    Instruments,

    /// Parse one file and write its particles as JSON lines.
    Parse {
        /// Input file, or a pattern matching exactly one file
        input: PathBuf,

        /// Instrument id
        #[arg(short, long)]
        instrument: String,

        /// Particle output path (JSON lines)
        #[arg(short = 'o', long, required_unless_present = "stdout")]
        output: Option<PathBuf>,

        /// Write particles to stdout
        #[arg(long, conflicts_with = "output")]
        stdout: bool,

        /// Also write the file report (JSON)
        #[arg(long)]
        report: Option<PathBuf>,

        /// Pretty-print the file report
        #[arg(long)]
        pretty: bool,

        /// Suppress non-error output
        #[arg(long)]
        quiet: bool,

        /// Exit with a non-zero code unless every record decoded
        #[arg(long)]
        strict: bool,
    },

    /// Parse many files in parallel, one JSON-lines file per input.
    Batch {
        /// Input files or patterns
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Instrument id
        #[arg(short, long)]
        instrument: String,

        /// Directory for `<stem>.particles.jsonl` outputs
        #[arg(long)]
        out_dir: PathBuf,

        /// Worker threads
        #[arg(short = 'j', long, default_value_t = 4)]
        workers: usize,

        /// Write the batch summary (JSON)
        #[arg(long)]
        summary: Option<PathBuf>,

        /// Suppress non-error output
        #[arg(long)]
        quiet: bool,
    },

    /// Build one echogram image per frequency and day from acoustic files.
    Echogram {
        /// Input files or patterns, in time order
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Instrument id
        #[arg(short, long)]
        instrument: String,

        /// Directory for PNG images and their JSON metadata
        #[arg(long)]
        out_dir: PathBuf,

        /// Suppress non-error output
        #[arg(long)]
        quiet: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let result = match cli.command {
        Commands::Instruments => cmd_instruments(&cli.instruments),
        Commands::Parse {
            input,
            instrument,
            output,
            stdout,
            report,
            pretty,
            quiet,
            strict,
        } => cmd_parse(
            &cli.instruments,
            ParseArgs {
                input,
                instrument,
                output,
                stdout,
                report,
                pretty,
                quiet,
                strict,
            },
        ),
        Commands::Batch {
            inputs,
            instrument,
            out_dir,
            workers,
            summary,
            quiet,
        } => cmd_batch(
            &cli.instruments,
            &inputs,
            &instrument,
            out_dir,
            workers,
            summary,
            quiet,
        ),
        Commands::Echogram {
            inputs,
            instrument,
            out_dir,
            quiet,
        } => cmd_echogram(&cli.instruments, &inputs, &instrument, &out_dir, quiet),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err.message);
            if let Some(hint) = err.hint {
                eprintln!("hint: {}", hint);
            }
            ExitCode::from(2)
        }
    }
}

/// Logs go to stderr so particle JSON on stdout stays clean.
fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

#[derive(Debug)]
struct CliError {
    message: String,
    hint: Option<String>,
}

impl CliError {
    fn new(message: impl Into<String>, hint: Option<String>) -> Self {
        Self {
            message: message.into(),
            hint,
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        CliError::new(format!("{err:#}"), None)
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        let hint = match &err {
            ConfigError::UnknownInstrument { .. } => {
                "run `seaparse instruments` to list the available ids"
            }
            _ => "fix the instrument document and retry",
        };
        CliError::new(err.to_string(), Some(hint.to_string()))
    }
}

/// Read and compile every `*.toml` under `dir`.
fn load_instruments(dir: &Path) -> Result<SchemaTable, CliError> {
    if !dir.is_dir() {
        return Err(CliError::new(
            format!("instrument directory not found: {}", dir.display()),
            Some("pass --instruments <dir> with one TOML file per instrument".to_string()),
        ));
    }
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to list instrument directory: {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();

    let mut configs = Vec::with_capacity(paths.len());
    for path in &paths {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read instrument file: {}", path.display()))?;
        let config = InstrumentConfig::from_toml_str(&text).map_err(|err| {
            CliError::new(
                format!("{}: {err}", path.display()),
                Some("fix the instrument document and retry".to_string()),
            )
        })?;
        configs.push(config);
    }
    let table = SchemaTable::compile(configs)?;
    debug!(dir = %dir.display(), instruments = table.len(), "instruments loaded");
    Ok(table)
}

fn instrument<'t>(table: &'t SchemaTable, id: &str) -> Result<&'t CompiledInstrument, CliError> {
    table.get(id).map_err(|err| {
        let known = table.ids().collect::<Vec<_>>().join(", ");
        let mut cli = CliError::from(err);
        if !known.is_empty() {
            cli.hint = Some(format!("known instruments: {known}"));
        }
        cli
    })
}

fn cmd_instruments(dir: &Path) -> Result<(), CliError> {
    let table = load_instruments(dir)?;
    let mut ids: Vec<&str> = table.ids().collect();
    ids.sort_unstable();
    for id in ids {
        let inst = instrument(&table, id)?;
        let echogram = if inst.echogram.is_some() {
            " (echogram)"
        } else {
            ""
        };
        let streams: Vec<&str> = inst.stream_names().collect();
        println!("{id}\t{}{echogram}", streams.join(","));
    }
    Ok(())
}

struct ParseArgs {
    input: PathBuf,
    instrument: String,
    output: Option<PathBuf>,
    stdout: bool,
    report: Option<PathBuf>,
    pretty: bool,
    quiet: bool,
    strict: bool,
}

fn cmd_parse(dir: &Path, args: ParseArgs) -> Result<(), CliError> {
    let table = load_instruments(dir)?;
    let inst = instrument(&table, &args.instrument)?;
    let input = resolve_single_input(&args.input)?;
    validate_input_file(&input)?;

    let output = if args.stdout {
        None
    } else {
        let output = args.output.ok_or_else(|| {
            CliError::new(
                "missing output path",
                Some("use -o/--output or --stdout".to_string()),
            )
        })?;
        ensure_distinct(&input, &output)?;
        Some(output)
    };

    let mut engine = ParserEngine::open(inst, &input)
        .with_context(|| format!("Failed to open input: {}", input.display()))?;
    match &output {
        Some(path) => {
            create_parent(path)?;
            let file = fs::File::create(path)
                .with_context(|| format!("Failed to create output: {}", path.display()))?;
            write_particles(&mut engine, BufWriter::new(file))
                .with_context(|| format!("Failed to write particles: {}", path.display()))?;
        }
        None => {
            write_particles(&mut engine, BufWriter::new(io::stdout().lock()))
                .context("Failed to write particles to stdout")?;
        }
    }
    let report = engine.finish();

    if let Some(path) = &args.report {
        write_json(path, &report, args.pretty)?;
    }
    if !args.quiet {
        print_report_summary(&report, output.as_deref());
    }
    if args.strict && report.status != FileStatus::Success {
        return Err(CliError::new(
            format!(
                "{} finished with status {:?}",
                report.source, report.status
            ),
            Some("use --report to inspect the recoverable errors".to_string()),
        ));
    }
    Ok(())
}

fn write_particles<W: Write>(engine: &mut ParserEngine<'_>, mut writer: W) -> Result<()> {
    for particle in engine.by_ref() {
        serde_json::to_writer(&mut writer, &particle).context("JSON serialization failed")?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

fn print_report_summary(report: &FileReport, output: Option<&Path>) {
    let errors: usize = report.error_counts.values().sum();
    let target = output
        .map(|path| format!(" -> {}", path.display()))
        .unwrap_or_default();
    eprintln!(
        "{:?}: {} particles, {} recoverable errors{}",
        report.status, report.particles, errors, target
    );
    if let Some(terminal) = &report.terminal_error {
        eprintln!("  stopped early: {terminal}");
    }
}

fn cmd_batch(
    dir: &Path,
    inputs: &[PathBuf],
    instrument_id: &str,
    out_dir: PathBuf,
    workers: usize,
    summary_path: Option<PathBuf>,
    quiet: bool,
) -> Result<(), CliError> {
    let table = load_instruments(dir)?;
    let inst = instrument(&table, instrument_id)?;
    let files = expand_inputs(inputs)?;
    if workers == 0 {
        return Err(CliError::new(
            "worker count must be positive",
            Some("use -j/--workers 1 or more".to_string()),
        ));
    }
    fs::create_dir_all(&out_dir)
        .with_context(|| format!("Failed to create output directory: {}", out_dir.display()))?;

    let cancel = AtomicBool::new(false);
    let summary = run_batch(&BatchJob {
        instrument: inst,
        files,
        output_dir: out_dir.clone(),
        workers,
        cancel: &cancel,
    });

    if let Some(path) = &summary_path {
        write_json(path, &summary, true)?;
    }
    if !quiet {
        eprintln!(
            "OK: {} success, {} partial, {} failed, {} skipped -> {}",
            summary.count(FileStatus::Success),
            summary.count(FileStatus::Partial),
            summary.count(FileStatus::Failed),
            summary.count(FileStatus::Skipped),
            out_dir.display()
        );
        for report in summary
            .reports
            .iter()
            .filter(|report| matches!(report.status, FileStatus::Partial | FileStatus::Failed))
        {
            let reason = report
                .io_error
                .clone()
                .or_else(|| report.terminal_error.as_ref().map(ToString::to_string))
                .unwrap_or_else(|| format!("{} recoverable errors", report.recoverable_errors.len()));
            eprintln!("  {:?} {}: {}", report.status, report.source, reason);
        }
    }
    Ok(())
}

fn cmd_echogram(
    dir: &Path,
    inputs: &[PathBuf],
    instrument_id: &str,
    out_dir: &Path,
    quiet: bool,
) -> Result<(), CliError> {
    let table = load_instruments(dir)?;
    let inst = instrument(&table, instrument_id)?;
    let mut assembler = EchogramAssembler::new(inst).map_err(|err| {
        CliError::new(
            err.to_string(),
            Some("add an [echogram] section to the instrument document".to_string()),
        )
    })?;
    let files = expand_inputs(inputs)?;
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create output directory: {}", out_dir.display()))?;

    let run = render_echograms(inst, &mut assembler, &files, out_dir)?;
    if !quiet {
        eprintln!(
            "OK: {} echogram images, {} files failed -> {}",
            run.written,
            run.failed,
            out_dir.display()
        );
    }
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
struct EchogramRun {
    written: usize,
    failed: usize,
}

/// Feed `files` in order into the assembler and write every finished day.
///
/// An unreadable file is logged and counted; the remaining files still
/// contribute.
fn render_echograms(
    inst: &CompiledInstrument,
    assembler: &mut EchogramAssembler,
    files: &[PathBuf],
    out_dir: &Path,
) -> Result<EchogramRun, CliError> {
    let renderer = PngRenderer::default();
    let mut run = EchogramRun::default();
    for path in files {
        let mut engine = match ParserEngine::open(inst, path) {
            Ok(engine) => engine,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "input skipped");
                run.failed += 1;
                continue;
            }
        };
        let mut earliest: Option<Timestamp> = None;
        for particle in engine.by_ref() {
            if let Some(ts) = particle.preferred_timestamp {
                earliest = Some(earliest.map_or(ts, |seen| if ts < seen { ts } else { seen }));
            }
            assembler.ingest(&particle);
        }
        let report = engine.finish();
        match report.status {
            FileStatus::Success => {}
            FileStatus::Failed => {
                warn!(source = %report.source, "no particles decoded");
                run.failed += 1;
            }
            status => warn!(source = %report.source, status = ?status, "file not fully decoded"),
        }
        // files arrive in time order: buckets before this file's first ping are complete
        if let Some(earliest) = earliest {
            for matrix in assembler.drain_completed(earliest) {
                run.written += write_echogram(&renderer, inst, &matrix, out_dir)?;
            }
        }
    }
    for range in assembler.pending_ranges() {
        for matrix in assembler.finalize(range) {
            run.written += write_echogram(&renderer, inst, &matrix, out_dir)?;
        }
    }
    if assembler.rejected() > 0 {
        warn!(rejected = assembler.rejected(), "particles without a timestamp were left out");
    }
    Ok(run)
}

/// Write one matrix as `<instrument>_<YYYYMMDD>_<freq>kHz.png` plus its JSON
/// metadata. Matrices without data are skipped.
fn write_echogram(
    renderer: &PngRenderer,
    inst: &CompiledInstrument,
    matrix: &EchogramMatrix,
    out_dir: &Path,
) -> Result<usize, CliError> {
    if !matrix.has_data() {
        debug!(frequency = matrix.frequency_id, "no data, not rendered");
        return Ok(0);
    }
    let day = matrix
        .range
        .start
        .to_datetime()
        .and_then(|dt| dt.format(format_description!("[year][month][day]")).ok())
        .ok_or_else(|| CliError::new("echogram start time is out of range", None))?;
    let stem = format!("{}_{day}_{}kHz", inst.id, matrix.frequency_id);
    let image = out_dir.join(format!("{stem}.png"));
    renderer
        .write_png(matrix, &image)
        .map_err(|err| CliError::new(err.to_string(), None))?;
    write_json(
        &out_dir.join(format!("{stem}.json")),
        &EchogramMetadata::for_matrix(&inst.id, matrix),
        true,
    )?;
    info!(path = %image.display(), "echogram written");
    Ok(1)
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T, pretty: bool) -> Result<(), CliError> {
    let json = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .context("JSON serialization failed")?;
    create_parent(path)?;
    fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn create_parent(path: &Path) -> Result<(), CliError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create output directory: {}", parent.display())
            })?;
        }
    }
    Ok(())
}

fn ensure_distinct(input: &Path, output: &Path) -> Result<(), CliError> {
    let input_abs = fs::canonicalize(input)
        .with_context(|| format!("Failed to resolve input path: {}", input.display()))?;
    let output_abs = fs::canonicalize(output).ok();
    if output_abs.as_deref() == Some(input_abs.as_path()) {
        return Err(CliError::new(
            format!("output path must differ from input: {}", output.display()),
            Some("choose a different output path".to_string()),
        ));
    }
    Ok(())
}

fn validate_input_file(input: &Path) -> Result<(), CliError> {
    if !input.exists() {
        return Err(CliError::new(
            format!("input file not found: {}", input.display()),
            Some("check the path or quote the pattern".to_string()),
        ));
    }
    if !input.is_file() {
        return Err(CliError::new(
            format!("input is not a file: {}", input.display()),
            Some("pass a raw instrument file".to_string()),
        ));
    }
    Ok(())
}

/// Expand every argument; plain paths must exist, patterns must match.
fn expand_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>, CliError> {
    let mut files = Vec::new();
    for input in inputs {
        let pattern = input.to_string_lossy();
        if is_glob_pattern(&pattern) {
            files.extend(glob_files(&pattern)?);
        } else {
            validate_input_file(input)?;
            files.push(input.clone());
        }
    }
    files.dedup();
    Ok(files)
}

fn resolve_single_input(input: &Path) -> Result<PathBuf, CliError> {
    let pattern = input.to_string_lossy();
    if !is_glob_pattern(&pattern) {
        return Ok(input.to_path_buf());
    }

    let mut matches = glob_files(&pattern)?;
    if matches.len() > 1 {
        let hint = "pass a single file, or use `seaparse batch`".to_string();
        let mut message = format!(
            "multiple files match pattern '{}' ({} matches)",
            pattern,
            matches.len()
        );
        let listed = matches
            .iter()
            .take(3)
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>();
        message.push_str("; matches: ");
        message.push_str(&listed.join(", "));
        if matches.len() > 3 {
            message.push_str(", ...");
        }
        return Err(CliError::new(message, Some(hint)));
    }
    Ok(matches.remove(0))
}

/// Files matching `pattern`, in path order; an empty match is an error.
fn glob_files(pattern: &str) -> Result<Vec<PathBuf>, CliError> {
    let paths = glob(pattern).map_err(|err| {
        CliError::new(
            format!("invalid input pattern '{}'", pattern),
            Some(format!("pattern error: {}", err.msg)),
        )
    })?;
    let mut matches = Vec::new();
    for entry in paths {
        let path = entry.map_err(|err| {
            CliError::new(
                format!("invalid input pattern '{}'", pattern),
                Some(format!("pattern error: {}", err)),
            )
        })?;
        if path.is_file() {
            matches.push(path);
        }
    }
    if matches.is_empty() {
        return Err(CliError::new(
            format!("no files match pattern '{}'", pattern),
            Some("check the path or quote the pattern".to_string()),
        ));
    }
    Ok(matches)
}

fn is_glob_pattern(input: &str) -> bool {
    input.contains('*') || input.contains('?') || input.contains('[')
}
