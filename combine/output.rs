// ========================================================================================
//
//                              Writing the combined matrix
//
// ========================================================================================

use crate::kernel::MatrixAccumulator;
use crate::pipeline::PipelineError;
use crate::types::MatrixShape;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

const OUTPUT_BUFFER_SIZE: usize = 16 * 1024 * 1024;
const TEMP_ATTEMPTS: u32 = 16;

static TEMP_SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Writes the matrix as text.
///
/// The header is the identifier label followed by the column labels. Each row is its
/// label followed by one value per column with six decimals. Fields are separated by a
/// single space and every line ends with a newline.
pub fn write_matrix_to<W: Write>(
    writer: &mut W,
    shape: &MatrixShape,
    acc: &MatrixAccumulator,
) -> io::Result<()> {
    write!(writer, "{}", shape.spec.name)?;
    for column in shape.columns.iter() {
        writer.write_all(b" ")?;
        writer.write_all(column)?;
    }
    writeln!(writer)?;

    for (index, label) in shape.rows.iter().enumerate() {
        let values = acc.row(index).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Matrix has no row {index} for label '{}'.",
                    String::from_utf8_lossy(label)
                ),
            )
        })?;
        writer.write_all(label)?;
        for value in values {
            write!(writer, " {value:.6}")?;
        }
        writeln!(writer)?;
    }
    Ok(())
}

/// Writes the gzip-compressed matrix to `path`.
///
/// The data goes to a temporary file in the destination directory, which is synced and
/// then renamed over `path`. On failure the temporary file is removed and `path` is
/// left untouched.
pub fn write_matrix(
    path: &Path,
    shape: &MatrixShape,
    acc: &MatrixAccumulator,
) -> Result<(), PipelineError> {
    let label = path.display().to_string();
    let (temp_path, temp_file) =
        create_temp_file(path).map_err(|e| PipelineError::io(&label, e))?;

    let write_result = (|| -> io::Result<()> {
        let encoder = GzEncoder::new(temp_file, Compression::default());
        let mut writer = BufWriter::with_capacity(OUTPUT_BUFFER_SIZE, encoder);
        write_matrix_to(&mut writer, shape, acc)?;
        let encoder = writer.into_inner().map_err(io::Error::other)?;
        let file = encoder.finish()?;
        file.sync_all()
    })();

    if let Err(err) = write_result {
        let _ = fs::remove_file(&temp_path);
        return Err(PipelineError::io(&label, err));
    }

    fs::rename(&temp_path, path).map_err(|err| {
        let _ = fs::remove_file(&temp_path);
        PipelineError::io(&label, err)
    })
}

// Creates a file beside `path` so the final rename stays on one filesystem.
fn create_temp_file(path: &Path) -> io::Result<(PathBuf, File)> {
    for _ in 0..TEMP_ATTEMPTS {
        let sequence = TEMP_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let mut name = path.as_os_str().to_owned();
        name.push(format!(".{}-{sequence}.partial", std::process::id()));
        let candidate = PathBuf::from(name);
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "every temporary name beside the output is taken",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CollectingSink;
    use crate::io::MemorySource;
    use crate::pipeline;
    use crate::prepare::resolve_shape;
    use crate::types::{Label, MatrixFormat, PassOptions, label_set};
    use flate2::read::MultiGzDecoder;
    use std::io::Read;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn labels(names: &[&str]) -> Arc<[Label]> {
        label_set(names)
    }

    fn summed_fixture() -> (MatrixShape, MatrixAccumulator) {
        let columns = labels(&["A", "B", "C"]);
        let shape = MatrixShape {
            spec: MatrixFormat::Pbwt.id_spec(),
            remove_index: 0,
            columns: Arc::clone(&columns),
            rows: columns,
        };
        let mut acc = MatrixAccumulator::zeros(3, 3).unwrap();
        for (col, value) in [5.0, 7.0, 9.0].into_iter().enumerate() {
            acc.add(0, col, value);
        }
        (shape, acc)
    }

    #[test]
    fn text_layout_matches_the_input_convention() {
        let (shape, acc) = summed_fixture();
        let mut out = Vec::new();
        write_matrix_to(&mut out, &shape, &acc).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "RECIPIENT A B C\n\
             A 5.000000 7.000000 9.000000\n\
             B 0.000000 0.000000 0.000000\n\
             C 0.000000 0.000000 0.000000\n"
        );
    }

    #[test]
    fn rectangular_rows_carry_their_census_labels() {
        let shape = MatrixShape {
            spec: MatrixFormat::SparsePainter.id_spec(),
            remove_index: 0,
            columns: labels(&["p1", "p2"]),
            rows: labels(&["ref1", "ref2", "ref3"]),
        };
        let mut acc = MatrixAccumulator::zeros(3, 2).unwrap();
        acc.add(2, 1, 0.125);
        let mut out = Vec::new();
        write_matrix_to(&mut out, &shape, &acc).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "indnames p1 p2");
        assert_eq!(lines[3], "ref3 0.000000 0.125000");
    }

    #[test]
    fn latin1_labels_are_written_back_byte_for_byte() {
        let input = b"RECIPIENT caf\xe9 B\ncaf\xe9 1 2\nB 3 4\n";
        let sources = [MemorySource::new("chr1", input.to_vec())];
        let options = PassOptions::default();
        let sink = CollectingSink::new();
        let shape = resolve_shape(&sources[0], MatrixFormat::Pbwt, &options, &sink).unwrap();
        let total = pipeline::run(&sources, &shape, &options, 1, &sink).unwrap();

        let mut out = Vec::new();
        write_matrix_to(&mut out, &shape, &total).unwrap();
        assert_eq!(
            out,
            b"RECIPIENT caf\xe9 B\ncaf\xe9 1.000000 2.000000\nB 3.000000 4.000000\n".to_vec()
        );
    }

    #[test]
    fn gzip_output_replaces_the_destination_and_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("combined.gz");
        fs::write(&path, b"stale").unwrap();

        let (shape, acc) = summed_fixture();
        write_matrix(&path, &shape, &acc).unwrap();

        let mut text = String::new();
        MultiGzDecoder::new(File::open(&path).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert!(text.starts_with("RECIPIENT A B C\nA 5.000000 7.000000 9.000000\n"));

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn unwritable_destination_names_the_path() {
        let (shape, acc) = summed_fixture();
        let err = write_matrix(Path::new("/no/such/dir/out.gz"), &shape, &acc).unwrap_err();
        match err {
            PipelineError::Io { path, .. } => assert_eq!(path, "/no/such/dir/out.gz"),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
