//! # Diagnostic events
//!
//! Non-fatal conditions found while streaming inputs are reported as `Diagnostic`
//! values to a `DiagnosticSink` that the caller injects into each component. Nothing
//! in the engine logs these conditions on its own; the sink decides whether an event
//! is printed, counted, or kept.

use log::{debug, warn};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// After this many events of one repetitive kind, `LogSink` only counts them.
const WARNING_LOG_LIMIT: u64 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A file's data row count differs from the shape learned from the first file.
    RowCountMismatch {
        source: String,
        found: usize,
        expected: usize,
    },
    /// A token in a data column is not a number. Its cell contributed zero.
    NumericParse {
        source: String,
        row: usize,
        column: usize,
        token: String,
    },
    /// A number's magnitude exceeded `f32` and was clamped to `f32::MAX`.
    Overflow {
        source: String,
        row: usize,
        column: usize,
        token: String,
    },
    /// A row of a rectangular input has no token at the identifier position.
    MissingRowLabel { source: String, row: usize },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RowCountMismatch {
                source,
                found,
                expected,
            } => write!(f, "{source} has {found} rows (expected {expected})"),
            Self::NumericParse {
                source,
                row,
                column,
                token,
            } => write!(
                f,
                "{source}: non-numeric value '{token}' at row {row}, column {column} counted as 0"
            ),
            Self::Overflow {
                source,
                row,
                column,
                token,
            } => write!(
                f,
                "{source}: value '{token}' at row {row}, column {column} is out of range and was clamped"
            ),
            Self::MissingRowLabel { source, row } => {
                write!(f, "{source}: row {row} has no identifier token")
            }
        }
    }
}

/// Receives non-fatal events from the streaming components.
pub trait DiagnosticSink: Send + Sync {
    fn record(&self, event: Diagnostic);
}

/// Totals of every event a `LogSink` has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticCounts {
    pub row_count_mismatches: u64,
    pub malformed_tokens: u64,
    pub overflows: u64,
    pub missing_row_labels: u64,
}

impl DiagnosticCounts {
    pub fn is_clean(&self) -> bool {
        *self == Self::default()
    }
}

/// Forwards events to the `log` facade.
///
/// Row-count mismatches are always logged. Malformed tokens and missing labels can
/// repeat millions of times in a broken file, so only the first few are logged and
/// the rest are counted. Overflow adjustments go to the debug level.
#[derive(Debug, Default)]
pub struct LogSink {
    row_count_mismatches: AtomicU64,
    malformed_tokens: AtomicU64,
    overflows: AtomicU64,
    missing_row_labels: AtomicU64,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counts(&self) -> DiagnosticCounts {
        DiagnosticCounts {
            row_count_mismatches: self.row_count_mismatches.load(Ordering::Relaxed),
            malformed_tokens: self.malformed_tokens.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            missing_row_labels: self.missing_row_labels.load(Ordering::Relaxed),
        }
    }
}

fn log_limited(counter: &AtomicU64, event: &Diagnostic, what: &str) {
    let seen = counter.fetch_add(1, Ordering::Relaxed) + 1;
    if seen <= WARNING_LOG_LIMIT {
        warn!("{event}");
    }
    if seen == WARNING_LOG_LIMIT {
        warn!("Further {what} warnings are suppressed; see the summary at the end of the run");
    }
}

impl DiagnosticSink for LogSink {
    fn record(&self, event: Diagnostic) {
        match &event {
            Diagnostic::RowCountMismatch { .. } => {
                self.row_count_mismatches.fetch_add(1, Ordering::Relaxed);
                warn!("{event}");
            }
            Diagnostic::NumericParse { .. } => {
                log_limited(&self.malformed_tokens, &event, "non-numeric value");
            }
            Diagnostic::MissingRowLabel { .. } => {
                log_limited(&self.missing_row_labels, &event, "missing row label");
            }
            Diagnostic::Overflow { .. } => {
                self.overflows.fetch_add(1, Ordering::Relaxed);
                debug!("{event}");
            }
        }
    }
}

/// Keeps every event in arrival order.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Diagnostic> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl DiagnosticSink for CollectingSink {
    fn record(&self, event: Diagnostic) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn malformed(row: usize) -> Diagnostic {
        Diagnostic::NumericParse {
            source: "chr1.gz".to_string(),
            row,
            column: 2,
            token: "n/a".to_string(),
        }
    }

    #[test]
    fn log_sink_counts_past_the_log_limit() {
        let sink = LogSink::new();
        for row in 0..(WARNING_LOG_LIMIT as usize + 5) {
            sink.record(malformed(row));
        }
        sink.record(Diagnostic::RowCountMismatch {
            source: "chr2.gz".to_string(),
            found: 3,
            expected: 4,
        });

        let counts = sink.counts();
        assert_eq!(counts.malformed_tokens, WARNING_LOG_LIMIT + 5);
        assert_eq!(counts.row_count_mismatches, 1);
        assert_eq!(counts.overflows, 0);
        assert!(!counts.is_clean());
        assert!(LogSink::new().counts().is_clean());
    }

    #[test]
    fn collecting_sink_keeps_order() {
        let sink = CollectingSink::new();
        sink.record(malformed(0));
        sink.record(malformed(1));
        assert_eq!(sink.events(), vec![malformed(0), malformed(1)]);
    }

    #[test]
    fn messages_name_the_source() {
        let text = Diagnostic::RowCountMismatch {
            source: "chr9.gz".to_string(),
            found: 1,
            expected: 2,
        }
        .to_string();
        assert_eq!(text, "chr9.gz has 1 rows (expected 2)");
    }
}
