use flate2::Compression;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Command, Output};

use tempfile::tempdir;

fn write_gz(path: &Path, text: &str) {
    let file = File::create(path).expect("create input");
    let mut encoder = GzEncoder::new(file, Compression::fast());
    encoder.write_all(text.as_bytes()).expect("write input");
    encoder.finish().expect("finish gzip");
}

fn read_gz(path: &Path) -> String {
    let mut text = String::new();
    MultiGzDecoder::new(File::open(path).expect("open output"))
        .read_to_string(&mut text)
        .expect("decode output");
    text
}

fn combine(dir: &Path, chrs: &str, format: &str, extra: &[&str]) -> Output {
    let prefix = dir.join("chr");
    let output = dir.join("combined.gz");
    Command::new(env!("CARGO_BIN_EXE_chromocombine"))
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .args([
            "-p",
            prefix.to_str().expect("path str"),
            "-a",
            ".out.gz",
            "-c",
            chrs,
            "-o",
            output.to_str().expect("path str"),
            "-t",
            format,
        ])
        .args(extra)
        .output()
        .expect("run chromocombine")
}

#[test]
fn pbwt_matrices_are_summed_by_row_label() {
    let tmp = tempdir().expect("temporary directory");
    write_gz(&tmp.path().join("chr1.out.gz"), "RECIPIENT A B C\nA 1.0 2.0 3.0\n");
    write_gz(&tmp.path().join("chr2.out.gz"), "RECIPIENT A B C\nA 4.0 5.0 6.0\n");

    let output = combine(tmp.path(), "1,2", "pbwt", &["-j", "1"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    assert_eq!(
        read_gz(&tmp.path().join("combined.gz")),
        "RECIPIENT A B C\n\
         A 5.000000 7.000000 9.000000\n\
         B 0.000000 0.000000 0.000000\n\
         C 0.000000 0.000000 0.000000\n"
    );

    // Both inputs are short, so each one is reported.
    let log = String::from_utf8_lossy(&output.stderr);
    assert_eq!(log.matches("rows (expected 3)").count(), 2, "log: {log}");
}

#[test]
fn chromopainter_identifier_column_is_excluded_wherever_it_sits() {
    let tmp = tempdir().expect("temporary directory");
    for chr in ["1", "2", "3"] {
        write_gz(
            &tmp.path().join(format!("chr{chr}.out.gz")),
            "P1 Recipient P2\n0.5 P1 1.5\n2 P2 0.25\n",
        );
    }

    let output = combine(tmp.path(), " 1, 2 ,3,", "chromopainter", &["-j", "3"]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(
        read_gz(&tmp.path().join("combined.gz")),
        "Recipient P1 P2\nP1 1.500000 4.500000\nP2 6.000000 0.750000\n"
    );
}

#[test]
fn sparsepainter_rows_come_from_the_first_file() {
    let tmp = tempdir().expect("temporary directory");
    let text = "indnames d1 d2\nref1 0.1 0.2\nref2 0.3 0.4\nref3 0.5 0.6\n";
    write_gz(&tmp.path().join("chr21.out.gz"), text);
    write_gz(&tmp.path().join("chr22.out.gz"), text);

    let output = combine(tmp.path(), "21,22", "SparsePainter", &[]);
    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));

    let combined = read_gz(&tmp.path().join("combined.gz"));
    let lines: Vec<&str> = combined.lines().collect();
    assert_eq!(
        lines,
        vec![
            "indnames d1 d2",
            "ref1 0.200000 0.400000",
            "ref2 0.600000 0.800000",
            "ref3 1.000000 1.200000",
        ]
    );
}

#[test]
fn missing_identifier_column_fails_without_output() {
    let tmp = tempdir().expect("temporary directory");
    write_gz(&tmp.path().join("chr1.out.gz"), "ID A B\nA 1 2\nB 3 4\n");

    let output = combine(tmp.path(), "1", "pbwt", &[]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("RECIPIENT"));
    assert!(!tmp.path().join("combined.gz").exists());
}

#[test]
fn missing_input_fails_without_output() {
    let tmp = tempdir().expect("temporary directory");
    write_gz(&tmp.path().join("chr1.out.gz"), "RECIPIENT A\nA 1\n");
    write_gz(&tmp.path().join("chr3.out.gz"), "RECIPIENT A\nA 1\n");

    let output = combine(tmp.path(), "1,2,3", "pbwt", &["-j", "2"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("chr2.out.gz"));
    assert!(!tmp.path().join("combined.gz").exists());

    // Only the two inputs remain; no temporary output was left behind.
    assert_eq!(fs::read_dir(tmp.path()).expect("list dir").count(), 2);
}

#[test]
fn strict_policy_from_config_rejects_malformed_values() {
    let tmp = tempdir().expect("temporary directory");
    write_gz(&tmp.path().join("chr1.out.gz"), "RECIPIENT A B\nA 1 x\nB 2 3\n");
    let config = tmp.path().join("combine.toml");
    fs::write(&config, "on_malformed = \"error\"\nthreads = 1\n").expect("write config");

    let strict = combine(
        tmp.path(),
        "1",
        "pbwt",
        &["--config", config.to_str().expect("path str")],
    );
    assert!(!strict.status.success());
    assert!(!tmp.path().join("combined.gz").exists());

    // The command line takes precedence over the file.
    let lenient = combine(
        tmp.path(),
        "1",
        "pbwt",
        &[
            "--config",
            config.to_str().expect("path str"),
            "--on-malformed",
            "silent",
        ],
    );
    assert!(lenient.status.success(), "stderr: {}", String::from_utf8_lossy(&lenient.stderr));
    assert_eq!(
        read_gz(&tmp.path().join("combined.gz")),
        "RECIPIENT A B\nA 1.000000 0.000000\nB 2.000000 3.000000\n"
    );
}

#[test]
fn empty_chromosome_list_is_rejected() {
    let tmp = tempdir().expect("temporary directory");
    let output = combine(tmp.path(), " , ", "pbwt", &[]);
    assert!(!output.status.success());
    assert!(!tmp.path().join("combined.gz").exists());
}
