// ========================================================================================
//
//                     The reduction orchestrator: many files, one sum
//
// ========================================================================================
//
// ### Purpose ###
//
// One contribution pass runs per input. With a degree of one the passes run in order
// straight into the shared total. With a higher degree a pool of workers pulls input
// indices from a queue, sums its files into a private accumulator and merges that
// accumulator into the shared total once the queue is empty.
//
// The first fatal error raises a shared cancellation flag. Every other worker stops at
// its next line or its next queue pull, and the run returns that first error. Nothing
// is merged after cancellation, and the caller writes no output.

use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::io::{LineError, MatrixSource};
use crate::kernel::{MatrixAccumulator, PassSummary, accumulate};
use crate::prepare::SchemaError;
use crate::types::{MatrixShape, PassOptions};
use crossbeam_channel::Receiver;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info, warn};
use std::io::{self, IsTerminal};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use sysinfo::System;
use thiserror::Error;

// ========================================================================================
//                                    Error type
// ========================================================================================

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("'{path}' ended before its header line was complete")]
    TruncatedHeader { path: String },
    #[error("'{path}': {source}")]
    Schema {
        path: String,
        #[source]
        source: SchemaError,
    },
    #[error("'{path}': non-numeric value '{token}' at row {row}, column {column}")]
    MalformedToken {
        path: String,
        row: usize,
        column: usize,
        token: String,
    },
    #[error("a {rows} x {cols} matrix is too large to allocate")]
    MatrixTooLarge { rows: usize, cols: usize },
    #[error("the run was cancelled")]
    Cancelled,
    #[error("failed to create worker pool: {0}")]
    ThreadPool(String),
    #[error("no input files to combine")]
    NoSources,
}

impl PipelineError {
    pub fn io(path: &str, source: io::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            source,
        }
    }

    pub fn from_line(path: &str, error: LineError) -> Self {
        match error {
            LineError::Io(source) => Self::io(path, source),
            LineError::TruncatedHeader => Self::TruncatedHeader {
                path: path.to_string(),
            },
        }
    }
}

// ========================================================================================
//                                   Public entry
// ========================================================================================

/// Sums every source into one accumulator of `shape`.
///
/// `degree` is the requested number of concurrent workers; 1 runs the passes in order
/// on the calling thread. The effective degree never exceeds the number of sources and
/// is lowered when the private accumulators would not fit in available memory.
pub fn run<S: MatrixSource>(
    sources: &[S],
    shape: &MatrixShape,
    options: &PassOptions,
    degree: usize,
    sink: &dyn DiagnosticSink,
) -> Result<MatrixAccumulator, PipelineError> {
    if sources.is_empty() {
        return Err(PipelineError::NoSources);
    }

    let mut total = MatrixAccumulator::zeros(shape.nrows(), shape.ncols())?;
    let degree = effective_degree(degree, sources.len(), total.byte_len());
    debug!("Combining {} files with {degree} worker(s)", sources.len());

    let progress = create_progress_bar(sources.len() as u64, "Combining chromosomes...");
    let cancel = AtomicBool::new(false);

    if degree <= 1 {
        for source in sources {
            process_one(source, shape, &mut total, options, sink, &cancel)?;
            progress.inc(1);
        }
        progress.finish_and_clear();
        return Ok(total);
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(degree)
        .thread_name(|i| format!("chromocombine-worker-{i}"))
        .build()
        .map_err(|e| PipelineError::ThreadPool(e.to_string()))?;

    let (sender, queue) = crossbeam_channel::unbounded::<usize>();
    for index in 0..sources.len() {
        if sender.send(index).is_err() {
            break;
        }
    }
    drop(sender);

    let context = WorkerContext {
        sources,
        shape,
        options,
        sink,
        cancel: &cancel,
        shared: Mutex::new(total),
        first_error: FirstError::default(),
        progress: &progress,
    };

    pool.scope(|scope| {
        for worker in 0..degree {
            let context = &context;
            let queue = queue.clone();
            scope.spawn(move |_| context.drain(worker, &queue));
        }
    });
    progress.finish_and_clear();

    let WorkerContext {
        shared,
        first_error,
        ..
    } = context;
    if let Some(error) = first_error.into_inner() {
        return Err(error);
    }
    Ok(shared.into_inner().unwrap_or_else(PoisonError::into_inner))
}

/// Runs one contribution pass and reports a row-count mismatch for that file.
fn process_one(
    source: &dyn MatrixSource,
    shape: &MatrixShape,
    target: &mut MatrixAccumulator,
    options: &PassOptions,
    sink: &dyn DiagnosticSink,
    cancel: &AtomicBool,
) -> Result<PassSummary, PipelineError> {
    let label = source.label();
    info!("Processing {label}");
    let summary = accumulate(source, shape, target, options, sink, cancel)?;
    if summary.rows != shape.nrows() {
        sink.record(Diagnostic::RowCountMismatch {
            source: label.to_string(),
            found: summary.rows,
            expected: shape.nrows(),
        });
    }
    info!("Finished {label} rows={}", summary.rows);
    Ok(summary)
}

// ========================================================================================
//                                 Concurrent workers
// ========================================================================================

struct WorkerContext<'a, S> {
    sources: &'a [S],
    shape: &'a MatrixShape,
    options: &'a PassOptions,
    sink: &'a dyn DiagnosticSink,
    cancel: &'a AtomicBool,
    shared: Mutex<MatrixAccumulator>,
    first_error: FirstError,
    progress: &'a ProgressBar,
}

impl<S: MatrixSource> WorkerContext<'_, S> {
    fn drain(&self, worker: usize, queue: &Receiver<usize>) {
        let mut local: Option<MatrixAccumulator> = None;
        let mut files = 0usize;

        while let Ok(index) = queue.recv() {
            if self.cancel.load(Ordering::Relaxed) {
                return;
            }

            // The private copy is only allocated once this worker has real work.
            if local.is_none() {
                match MatrixAccumulator::zeros(self.shape.nrows(), self.shape.ncols()) {
                    Ok(acc) => local = Some(acc),
                    Err(e) => return self.fail(e),
                }
            }
            let Some(acc) = local.as_mut() else {
                return;
            };

            let source = &self.sources[index];
            if let Err(e) = process_one(source, self.shape, acc, self.options, self.sink, self.cancel)
            {
                return self.fail(e);
            }
            files += 1;
            self.progress.inc(1);
        }

        if self.cancel.load(Ordering::Relaxed) {
            return;
        }
        if let Some(acc) = local {
            debug!("Worker {worker} merging {files} file(s) into the total");
            self.shared
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .merge_from(&acc);
        }
    }

    fn fail(&self, error: PipelineError) {
        self.cancel.store(true, Ordering::Relaxed);
        self.first_error.record(error);
    }
}

/// Holds the error that stopped a run. A real error always replaces `Cancelled`,
/// which is only the echo of another worker's failure.
#[derive(Debug, Default)]
struct FirstError(Mutex<Option<PipelineError>>);

impl FirstError {
    fn record(&self, error: PipelineError) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() || matches!(*slot, Some(PipelineError::Cancelled)) {
            *slot = Some(error);
        }
    }

    fn into_inner(self) -> Option<PipelineError> {
        self.0.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

// ========================================================================================
//                               Degree and memory guard
// ========================================================================================

/// How many private accumulators fit next to the shared total in `available` bytes.
/// Never less than one.
pub fn max_workers_for_memory(available: u64, matrix_bytes: u64) -> usize {
    if matrix_bytes == 0 {
        return usize::MAX;
    }
    let copies = (available / matrix_bytes).saturating_sub(1).max(1);
    usize::try_from(copies).unwrap_or(usize::MAX)
}

fn effective_degree(requested: usize, sources: usize, matrix_bytes: u64) -> usize {
    let degree = requested.max(1).min(sources.max(1));
    if degree <= 1 {
        return degree;
    }

    let mut system = System::new();
    system.refresh_memory();
    let available = system.available_memory();
    if available == 0 {
        return degree;
    }

    let cap = max_workers_for_memory(available, matrix_bytes);
    if cap < degree {
        warn!(
            "Reducing workers from {degree} to {cap}: each needs a {matrix_bytes}-byte matrix and {available} bytes are available"
        );
        return cap;
    }
    degree
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(10)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template(
        "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} files ({eta}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ");
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}
