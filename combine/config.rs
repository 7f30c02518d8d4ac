// ========================================================================================
//
//                       Run configuration: command line and file
//
// ========================================================================================
//
// The command line names the inputs and the output. An optional TOML file can supply
// defaults for the tuning knobs; a value given on the command line always wins. The
// merged result is validated once, here, so the engine never sees a zero thread count
// or an empty chromosome list.

use crate::io::DEFAULT_CHUNK_SIZE;
use crate::types::{MalformedTokenPolicy, MatrixFormat, PassOptions};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const MIB: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no chromosomes were selected; pass a comma-separated list with --chrs")]
    NoChromosomes,
    #[error("the number of threads must be at least 1")]
    ZeroThreads,
    #[error("the chunk size must be at least 1 MiB")]
    ZeroChunkSize,
    #[error("the chunk size of {0} MiB does not fit in memory addresses")]
    ChunkSizeOverflow(usize),
    #[error("failed to read config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file '{}': {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Optional defaults read from a TOML file.
///
/// ```toml
/// threads = 8
/// on_malformed = "error"
/// chunk_size_mib = 64
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub threads: Option<usize>,
    pub on_malformed: Option<MalformedTokenPolicy>,
    pub chunk_size_mib: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Everything the command line selected, before validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selections {
    pub pre_chr: String,
    pub post_chr: String,
    pub chrs: String,
    pub output: PathBuf,
    pub format: MatrixFormat,
    pub threads: Option<usize>,
    pub on_malformed: Option<MalformedTokenPolicy>,
    pub chunk_size_mib: Option<usize>,
}

/// A validated run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub format: MatrixFormat,
    /// Concurrency degree; 1 is sequential.
    pub threads: usize,
    pub pass: PassOptions,
}

impl RunConfig {
    /// Merges command-line selections over file defaults and validates the result.
    pub fn resolve(selections: Selections, file: &FileConfig) -> Result<Self, ConfigError> {
        let chromosomes = parse_chromosome_list(&selections.chrs);
        if chromosomes.is_empty() {
            return Err(ConfigError::NoChromosomes);
        }

        let threads = selections
            .threads
            .or(file.threads)
            .unwrap_or_else(num_cpus::get);
        if threads == 0 {
            return Err(ConfigError::ZeroThreads);
        }

        let chunk_size = match selections.chunk_size_mib.or(file.chunk_size_mib) {
            None => DEFAULT_CHUNK_SIZE,
            Some(0) => return Err(ConfigError::ZeroChunkSize),
            Some(mib) => mib
                .checked_mul(MIB)
                .ok_or(ConfigError::ChunkSizeOverflow(mib))?,
        };

        let malformed = selections
            .on_malformed
            .or(file.on_malformed)
            .unwrap_or_default();

        Ok(Self {
            inputs: input_paths(&selections.pre_chr, &chromosomes, &selections.post_chr),
            output: selections.output,
            format: selections.format,
            threads,
            pass: PassOptions {
                chunk_size,
                malformed,
            },
        })
    }
}

/// Splits a comma-separated chromosome list. Whitespace around entries is trimmed and
/// empty entries are dropped.
pub fn parse_chromosome_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|chr| !chr.is_empty())
        .map(str::to_string)
        .collect()
}

/// Builds one input path per chromosome: `prefix + chromosome + suffix`, in order.
pub fn input_paths(prefix: &str, chromosomes: &[String], suffix: &str) -> Vec<PathBuf> {
    chromosomes
        .iter()
        .map(|chr| PathBuf::from(format!("{prefix}{chr}{suffix}")))
        .collect()
}
