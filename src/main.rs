// ========================================================================================
//
//                         The command-line front end: chromocombine
//
// ========================================================================================
//
// Combines per-chromosome painting matrices into one genome-wide matrix by summing
// them cell by cell. This file only parses arguments, sets up logging and drives the
// library in order: resolve the run, learn the shape from the first input, reduce every
// input into one total and write it. Any fatal error ends the process with status 1
// before an output file appears.

use chromocombine::config::{FileConfig, RunConfig, Selections};
use chromocombine::diagnostics::LogSink;
use chromocombine::io::GzPathSource;
use chromocombine::output::write_matrix;
use chromocombine::pipeline::{self, PipelineError};
use chromocombine::prepare::resolve_shape;
use chromocombine::types::{MalformedTokenPolicy, MatrixFormat};
use clap::{Parser, ValueEnum};
use log::{info, warn};
use std::error::Error;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

#[derive(Parser, Debug)]
#[clap(
    name = "chromocombine",
    version,
    about = "Sums per-chromosome painting matrices into a single genome-wide matrix."
)]
struct Args {
    /// Text placed before each chromosome token to form an input path.
    #[clap(short = 'p', long = "pre-chr", alias = "pre_chr")]
    pre_chr: String,

    /// Text placed after each chromosome token to form an input path.
    #[clap(short = 'a', long = "post-chr", alias = "post_chr", default_value = "")]
    post_chr: String,

    /// Comma-separated chromosome tokens, e.g. "1,2,3,X".
    #[clap(short = 'c', long = "chrs")]
    chrs: String,

    /// Path of the gzip-compressed combined matrix.
    #[clap(short = 'o', long = "output")]
    output: PathBuf,

    /// Tool that produced the inputs.
    #[clap(short = 't', long = "type", value_enum)]
    format: FormatArg,

    /// Number of files summed concurrently; 1 runs sequentially. Defaults to all cores.
    #[clap(short = 'j', long = "threads")]
    threads: Option<usize>,

    /// What to do with a value that is not a number.
    #[clap(long = "on-malformed", value_enum)]
    on_malformed: Option<PolicyArg>,

    /// Size of each decompressed read, in MiB.
    #[clap(long = "chunk-size-mib")]
    chunk_size_mib: Option<usize>,

    /// TOML file with defaults for threads, on_malformed and chunk_size_mib.
    #[clap(long = "config")]
    config: Option<PathBuf>,

    /// Log per-file detail and clamped values.
    #[clap(short = 'v', long = "verbose")]
    verbose: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Pbwt,
    Chromopainter,
    #[value(alias = "SparsePainter")]
    Sparse,
}

impl From<FormatArg> for MatrixFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Pbwt => MatrixFormat::Pbwt,
            FormatArg::Chromopainter => MatrixFormat::ChromoPainter,
            FormatArg::Sparse => MatrixFormat::SparsePainter,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PolicyArg {
    Warn,
    Silent,
    Error,
}

impl From<PolicyArg> for MalformedTokenPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Warn => MalformedTokenPolicy::Warn,
            PolicyArg::Silent => MalformedTokenPolicy::Silent,
            PolicyArg::Error => MalformedTokenPolicy::Error,
        }
    }
}

impl Args {
    fn selections(&self) -> Selections {
        Selections {
            pre_chr: self.pre_chr.clone(),
            post_chr: self.post_chr.clone(),
            chrs: self.chrs.clone(),
            output: self.output.clone(),
            format: self.format.into(),
            threads: self.threads,
            on_malformed: self.on_malformed.map(Into::into),
            chunk_size_mib: self.chunk_size_mib,
        }
    }
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(&args) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

// ========================================================================================
//                              The main orchestration logic
// ========================================================================================

fn run(args: &Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    let start = Instant::now();
    info!("Starting chromosome combination");

    let file_config = match &args.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    let config = RunConfig::resolve(args.selections(), &file_config)?;
    info!(
        "Parameters: type={} pre_chr='{}' post_chr='{}' chromosomes={} output={} threads={}",
        config.format,
        args.pre_chr,
        args.post_chr,
        config.inputs.len(),
        config.output.display(),
        config.threads
    );

    let sources: Vec<GzPathSource> = config
        .inputs
        .iter()
        .map(|path| GzPathSource::new(path.clone()))
        .collect();
    let first = sources.first().ok_or(PipelineError::NoSources)?;

    let sink = LogSink::new();
    let shape = resolve_shape(first, config.format, &config.pass, &sink)?;
    info!(
        "Matrix size will be {} rows × {} cols",
        shape.nrows(),
        shape.ncols()
    );

    let total = pipeline::run(&sources, &shape, &config.pass, config.threads, &sink)?;
    info!("All chromosomes processed");

    info!("Writing gzipped output to {}", config.output.display());
    write_matrix(&config.output, &shape, &total)?;

    let counts = sink.counts();
    if !counts.is_clean() {
        warn!(
            "Summary: {} file(s) with an unexpected row count, {} non-numeric value(s), {} clamped value(s), {} row(s) without a label",
            counts.row_count_mismatches,
            counts.malformed_tokens,
            counts.overflows,
            counts.missing_row_labels
        );
    }
    info!(
        "Done ({}×{}) in {:.2?}",
        shape.nrows(),
        shape.ncols(),
        start.elapsed()
    );
    Ok(())
}
