// ========================================================================================
//
//                       Shape discovery: schema and row census
//
// ========================================================================================
//
// Everything about the shape of a run is learned from the first input and never
// re-derived: the identifier column position, the column labels and, for rectangular
// inputs, the row labels. The remaining inputs are trusted to share this schema
// positionally.

use crate::diagnostics::{Diagnostic, DiagnosticSink};
use crate::io::{ChunkedLineReader, MatrixSource};
use crate::pipeline::PipelineError;
use crate::tokenize::{nth_token, tokens};
use crate::types::{IdColumnSpec, Label, MatrixFormat, MatrixShape, PassOptions};
use log::{debug, info};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("identifier column '{expected}' not found in header")]
    IdColumnNotFound { expected: &'static str },
}

/// The outcome of reading a header: where the identifier sits and what the data
/// columns are called.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    pub remove_index: usize,
    pub columns: Vec<Label>,
}

/// Locates the identifier column in a header line and collects the remaining labels.
///
/// The first token equal to the expected name wins. Every other token, in order,
/// becomes a data column label.
pub fn resolve_schema(header: &[u8], spec: IdColumnSpec) -> Result<Schema, SchemaError> {
    let expected = spec.name.as_bytes();
    let remove_index = tokens(header)
        .find(|token| token.bytes == expected)
        .map(|token| token.column)
        .ok_or(SchemaError::IdColumnNotFound {
            expected: spec.name,
        })?;

    let columns = tokens(header)
        .filter(|token| token.column != remove_index)
        .map(|token| Label::from(token.bytes))
        .collect();

    Ok(Schema {
        remove_index,
        columns,
    })
}

/// Collects the identifier token of every data row of `source`.
///
/// Only rectangular inputs need this. The pass streams the whole file but tokenizes
/// each line only up to the identifier position. A row without an identifier token
/// keeps its slot with an empty label, so row indices stay aligned with the
/// contribution pass.
pub fn census_rows(
    source: &dyn MatrixSource,
    remove_index: usize,
    options: &PassOptions,
    sink: &dyn DiagnosticSink,
) -> Result<Vec<Label>, PipelineError> {
    let label = source.label();
    let stream = source.open().map_err(|e| PipelineError::io(label, e))?;
    let mut reader = ChunkedLineReader::new(stream, options.chunk_size);
    reader
        .read_header_line()
        .map_err(|e| PipelineError::from_line(label, e))?;

    let mut rows = Vec::new();
    while let Some(line) = reader.next_line().map_err(|e| PipelineError::io(label, e))? {
        match nth_token(line, remove_index) {
            Some(id) => rows.push(Label::from(id)),
            None => {
                sink.record(Diagnostic::MissingRowLabel {
                    source: label.to_string(),
                    row: rows.len(),
                });
                rows.push(Label::default());
            }
        }
    }

    debug!(
        "Row census of {label}: {} rows, {} lines crossed a chunk boundary",
        rows.len(),
        reader.lines_spilled()
    );
    Ok(rows)
}

/// Reads the header of the first input and derives the shape of the whole run.
pub fn resolve_shape(
    first: &dyn MatrixSource,
    format: MatrixFormat,
    options: &PassOptions,
    sink: &dyn DiagnosticSink,
) -> Result<MatrixShape, PipelineError> {
    let spec = format.id_spec();
    let label = first.label();

    let schema = {
        let stream = first.open().map_err(|e| PipelineError::io(label, e))?;
        let mut reader = ChunkedLineReader::new(stream, options.chunk_size);
        let header = reader
            .read_header_line()
            .map_err(|e| PipelineError::from_line(label, e))?;
        resolve_schema(header, spec).map_err(|source| PipelineError::Schema {
            path: label.to_string(),
            source,
        })?
    };
    debug!(
        "Identifier column '{}' found at position {} of {label}",
        spec.name, schema.remove_index
    );

    let columns: Arc<[Label]> = schema.columns.into();
    let rows: Arc<[Label]> = if format.is_square() {
        Arc::clone(&columns)
    } else {
        info!("Collecting row names from {label}");
        census_rows(first, schema.remove_index, options, sink)?.into()
    };

    Ok(MatrixShape {
        spec,
        remove_index: schema.remove_index,
        columns,
        rows,
    })
}
