// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are shared between files, not types that only are used in one file.

use serde::Deserialize;
use std::fmt;
use std::sync::Arc;

/// The painting tool that produced a family of per-chromosome matrices.
///
/// The format decides two things: the exact name of the identifier column in the
/// header, and whether the row labels are the column labels (square) or must be
/// discovered by a separate pass over the first file (rectangular).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatrixFormat {
    Pbwt,
    ChromoPainter,
    SparsePainter,
}

impl MatrixFormat {
    /// The header token that marks the identifier column for this format.
    pub fn id_column_name(self) -> &'static str {
        match self {
            Self::Pbwt => "RECIPIENT",
            Self::ChromoPainter => "Recipient",
            Self::SparsePainter => "indnames",
        }
    }

    /// Square formats share one label set between rows and columns.
    pub fn is_square(self) -> bool {
        !matches!(self, Self::SparsePainter)
    }

    pub fn id_spec(self) -> IdColumnSpec {
        IdColumnSpec {
            format: self,
            name: self.id_column_name(),
        }
    }
}

impl fmt::Display for MatrixFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pbwt => "pbwt",
            Self::ChromoPainter => "chromopainter",
            Self::SparsePainter => "sparse",
        })
    }
}

/// The resolved (format, expected identifier name) pair. Fixed once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdColumnSpec {
    pub format: MatrixFormat,
    pub name: &'static str,
}

/// A sample identifier exactly as it appeared in the input. Identifiers are not
/// required to be UTF-8 and are written back byte for byte.
pub type Label = Box<[u8]>;

/// Builds a label sequence from anything byte-like.
pub fn label_set<I>(names: I) -> Arc<[Label]>
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    names
        .into_iter()
        .map(|name| Label::from(name.as_ref()))
        .collect()
}

/// The shape of every matrix in a run, as learned from the first input.
///
/// In square mode `rows` and `columns` point at the same allocation.
#[derive(Debug, Clone)]
pub struct MatrixShape {
    pub spec: IdColumnSpec,
    /// Position of the identifier token among a line's tokens.
    pub remove_index: usize,
    pub columns: Arc<[Label]>,
    pub rows: Arc<[Label]>,
}

impl MatrixShape {
    #[inline]
    pub fn nrows(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    /// True when row labels are the column labels rather than a copy of them.
    pub fn shares_labels(&self) -> bool {
        Arc::ptr_eq(&self.rows, &self.columns)
    }
}

/// What a contribution pass does with a token that is not a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedTokenPolicy {
    /// Contribute zero and report a warning through the diagnostic sink.
    #[default]
    Warn,
    /// Contribute zero without reporting anything.
    Silent,
    /// Abort the run.
    Error,
}

/// Tuning knobs shared by every streaming pass over an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassOptions {
    /// Size in bytes of each decompressed read.
    pub chunk_size: usize,
    pub malformed: MalformedTokenPolicy,
}

impl Default for PassOptions {
    fn default() -> Self {
        Self {
            chunk_size: crate::io::DEFAULT_CHUNK_SIZE,
            malformed: MalformedTokenPolicy::default(),
        }
    }
}
