// ========================================================================================
//
//                      The accumulation kernel: one file, one pass
//
// ========================================================================================
//
// ### Purpose ###
//
// This module owns the dense matrix of running sums and the hot loop that streams one
// input into it. The loop is a tight, synchronous read-tokenize-parse-add cycle: row
// order inside a file defines the row index, so a single file is never split across
// threads.
//
// ### Numeric policy ###
//
//   - A finite literal whose magnitude does not fit in `f32` is clamped to `f32::MAX`
//     with the literal's sign. This is an adjustment, not an error.
//   - A token that is not a number contributes zero. The column position still
//     advances so the rest of the row stays aligned. Whether this is reported, silent,
//     or fatal is decided by `MalformedTokenPolicy`.

use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::io::{ChunkedLineReader, MatrixSource};
use crate::pipeline::PipelineError;
use crate::tokenize::tokens;
use crate::types::{MalformedTokenPolicy, MatrixShape, PassOptions};
use ndarray::Array2;
use std::sync::atomic::{AtomicBool, Ordering};

// ========================================================================================
//                                 Matrix accumulator
// ========================================================================================

/// A dense, row-major `nrows x ncols` grid of `f32` sums, zero-initialized.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixAccumulator {
    cells: Array2<f32>,
}

impl MatrixAccumulator {
    /// Allocates a zeroed grid. A size that overflows the address space or cannot be
    /// reserved is reported as `MatrixTooLarge` instead of aborting the process.
    pub fn zeros(nrows: usize, ncols: usize) -> Result<Self, PipelineError> {
        let too_large = || PipelineError::MatrixTooLarge {
            rows: nrows,
            cols: ncols,
        };

        let len = nrows.checked_mul(ncols).ok_or_else(too_large)?;
        let mut storage: Vec<f32> = Vec::new();
        storage.try_reserve_exact(len).map_err(|_| too_large())?;
        storage.resize(len, 0.0);

        let cells = Array2::from_shape_vec((nrows, ncols), storage).map_err(|_| too_large())?;
        Ok(Self { cells })
    }

    #[inline]
    pub fn nrows(&self) -> usize {
        self.cells.nrows()
    }

    #[inline]
    pub fn ncols(&self) -> usize {
        self.cells.ncols()
    }

    /// Size of the grid in bytes.
    pub fn byte_len(&self) -> u64 {
        (self.cells.len() as u64).saturating_mul(std::mem::size_of::<f32>() as u64)
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        self.cells.get((row, col)).copied()
    }

    /// Adds `value` at `(row, col)`. Positions outside the grid are dropped.
    #[inline]
    pub fn add(&mut self, row: usize, col: usize, value: f32) {
        if let Some(cell) = self.cells.get_mut((row, col)) {
            *cell += value;
        }
    }

    /// The values of one row, in column order.
    pub fn row(&self, row: usize) -> Option<&[f32]> {
        if row < self.nrows() {
            self.cells.row(row).to_slice()
        } else {
            None
        }
    }

    fn row_mut(&mut self, row: usize) -> Option<&mut [f32]> {
        if row < self.nrows() {
            self.cells.row_mut(row).into_slice()
        } else {
            None
        }
    }

    /// Adds every cell of `other` into the matching cell of `self`.
    pub fn merge_from(&mut self, other: &MatrixAccumulator) {
        assert_eq!(
            self.cells.dim(),
            other.cells.dim(),
            "Logic error: merging accumulators of different shapes."
        );
        self.cells += &other.cells;
    }

    pub fn cells(&self) -> &Array2<f32> {
        &self.cells
    }
}

// ========================================================================================
//                                 Contribution pass
// ========================================================================================

/// What a single contribution pass saw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    /// Data rows consumed, including rows beyond the expected row count.
    pub rows: usize,
    pub malformed_tokens: u64,
    pub overflowed_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParsedValue {
    Finite(f32),
    Clamped(f32),
    Malformed,
}

#[inline]
fn parse_value(bytes: &[u8]) -> ParsedValue {
    match lexical_core::parse::<f32>(bytes) {
        Ok(value) if value.is_infinite() && !spells_infinity(bytes) => {
            ParsedValue::Clamped(if value.is_sign_negative() {
                -f32::MAX
            } else {
                f32::MAX
            })
        }
        Ok(value) => ParsedValue::Finite(value),
        Err(_) => ParsedValue::Malformed,
    }
}

/// True for the literal spellings `inf` and `infinity`, which are not overflows.
fn spells_infinity(bytes: &[u8]) -> bool {
    bytes.iter().any(|b| b.eq_ignore_ascii_case(&b'i'))
}

/// Streams the data rows of `source` into `target`.
///
/// Row `r` of the file (zero-based, header excluded) is added into row `r` of the
/// grid. In each row the identifier token at `shape.remove_index` is skipped and every
/// other token is added into the next data column. Rows or columns beyond the grid are
/// dropped. The pass stops early with `Cancelled` once `cancel` is raised.
pub fn accumulate(
    source: &dyn MatrixSource,
    shape: &MatrixShape,
    target: &mut MatrixAccumulator,
    options: &PassOptions,
    sink: &dyn DiagnosticSink,
    cancel: &AtomicBool,
) -> Result<PassSummary, PipelineError> {
    let label = source.label();
    let stream = source.open().map_err(|e| PipelineError::io(label, e))?;
    let mut reader = ChunkedLineReader::new(stream, options.chunk_size);
    reader
        .read_header_line()
        .map_err(|e| PipelineError::from_line(label, e))?;

    let remove_index = shape.remove_index;
    let ncols = shape.ncols().min(target.ncols());
    let mut summary = PassSummary::default();
    let mut row = 0usize;

    while let Some(line) = reader.next_line().map_err(|e| PipelineError::io(label, e))? {
        if cancel.load(Ordering::Relaxed) {
            return Err(PipelineError::Cancelled);
        }

        let Some(cells) = target.row_mut(row) else {
            row += 1;
            continue;
        };

        let mut out_col = 0usize;
        for token in tokens(line) {
            if token.column == remove_index {
                continue;
            }
            if out_col >= ncols {
                break;
            }

            match parse_value(token.bytes) {
                ParsedValue::Finite(value) => cells[out_col] += value,
                ParsedValue::Clamped(value) => {
                    summary.overflowed_tokens += 1;
                    sink.record(Diagnostic::Overflow {
                        source: label.to_string(),
                        row,
                        column: token.column,
                        token: String::from_utf8_lossy(token.bytes).into_owned(),
                    });
                    cells[out_col] += value;
                }
                ParsedValue::Malformed => {
                    summary.malformed_tokens += 1;
                    match options.malformed {
                        MalformedTokenPolicy::Warn => sink.record(Diagnostic::NumericParse {
                            source: label.to_string(),
                            row,
                            column: token.column,
                            token: String::from_utf8_lossy(token.bytes).into_owned(),
                        }),
                        MalformedTokenPolicy::Silent => {}
                        MalformedTokenPolicy::Error => {
                            return Err(PipelineError::MalformedToken {
                                path: label.to_string(),
                                row,
                                column: token.column,
                                token: String::from_utf8_lossy(token.bytes).into_owned(),
                            });
                        }
                    }
                }
            }
            out_col += 1;
        }
        row += 1;
    }

    summary.rows = row;
    Ok(summary)
}
