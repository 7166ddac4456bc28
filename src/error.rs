//! Error taxonomy for the campaign.
//!
//! Configuration errors are fatal and surface before any dispatch. Dispatch and
//! parse errors are per-artifact: they are logged and degrade one record, never
//! the whole pass.

use std::io;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("dataset list is empty")]
    NoDatasets,
    #[error("algorithm catalog is empty")]
    NoAlgorithms,
    #[error("datasets {first} and {second} share the row label {label:?}")]
    DuplicateDataset {
        label: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("algorithm {what} {key:?} is used by more than one variant")]
    DuplicateVariant { what: &'static str, key: String },
    #[error("largest subset of {subset} does not fit {datasets} datasets")]
    LargestSubset { subset: usize, datasets: usize },
    #[error("available parallelism is zero")]
    NoParallelism,
    #[error("{field} must be at least 1")]
    Zero { field: &'static str },
    #[error("{what} is empty")]
    EmptyCommand { what: &'static str },
    #[error("{what} not found: {program}")]
    MissingTool { what: &'static str, program: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to prepare {path}: {source}")]
    Artifact { path: PathBuf, source: io::Error },
    #[error("failed to write campaign manifest {path}: {source}")]
    Manifest { path: PathBuf, source: io::Error },
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("marker {marker:?} not found")]
    MarkerMissing { marker: &'static str },
    #[error("value {raw:?} after marker {marker:?} is not a number")]
    BadNumber { marker: &'static str, raw: String },
    #[error("no structured report found")]
    NoReport,
    #[error("malformed structured report: {0}")]
    Malformed(String),
    #[error("failed to read artifact: {0}")]
    Io(String),
}

impl From<io::Error> for ParseError {
    fn from(e: io::Error) -> Self {
        ParseError::Io(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CampaignError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("failed to write table {path}: {source}")]
    Table { path: PathBuf, source: io::Error },
    #[error("failed to read campaign manifest {path}: {source}")]
    Manifest { path: PathBuf, source: io::Error },
    #[error("malformed campaign manifest {path}: {source}")]
    ManifestFormat {
        path: PathBuf,
        source: serde_json::Error,
    },
}
