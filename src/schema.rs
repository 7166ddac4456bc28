//! Persisted records: the campaign manifest written next to the artifacts,
//! and the JSON report printed by the binary.

use crate::error::{CampaignError, DispatchError};
use crate::space::RunDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub schema_version: u32,
    pub tool_version: String,
    pub timestamp_utc: String,
    pub git_sha: Option<String>,
    pub synthetic: bool,
}

impl RunMeta {
    pub fn capture(synthetic: bool) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp_utc: now_utc(),
            git_sha: git_sha_short(),
            synthetic,
        }
    }
}

fn now_utc() -> String {
    // Seconds since the epoch are enough to order manifests.
    use std::time::{SystemTime, UNIX_EPOCH};
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format!("unix:{secs}")
}

fn git_sha_short() -> Option<String> {
    std::env::var("GIT_SHA")
        .ok()
        .or_else(|| std::env::var("GITHUB_SHA").ok())
        .map(|s| s.chars().take(12).collect())
}

/// What happened to one dispatched invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum RunOutcome {
    Succeeded,
    /// Non-zero exit; `code` is `None` when killed by a signal.
    Failed { code: Option<i32> },
    TimedOut { after_secs: f64 },
    /// The process could not be spawned or awaited.
    SpawnError { message: String },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Succeeded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub run: RunDescriptor,
    pub artifact: PathBuf,
    pub command: String,
    pub outcome: RunOutcome,
    pub elapsed_secs: f64,
    /// SHA-256 of the artifact right after the run, hex encoded.
    pub sha256: Option<String>,
}

/// Everything the run phase hands to the aggregation phase besides the
/// artifacts themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignManifest {
    pub run: RunMeta,
    pub records: Vec<DispatchRecord>,
}

impl CampaignManifest {
    pub const FILE_NAME: &'static str = "campaign-manifest.json";

    pub fn path(results_dir: &Path) -> PathBuf {
        results_dir.join(Self::FILE_NAME)
    }

    /// `Ok(None)` when no run phase has written a manifest yet.
    pub fn load(results_dir: &Path) -> Result<Option<Self>, CampaignError> {
        let path = Self::path(results_dir);
        let json = match fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CampaignError::Manifest { path, source }),
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|source| CampaignError::ManifestFormat { path, source })
    }

    pub fn save(&self, results_dir: &Path) -> Result<(), DispatchError> {
        let path = Self::path(results_dir);
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| DispatchError::Manifest {
                path: path.clone(),
                source: io::Error::other(e),
            })?;
        fs::write(&path, json).map_err(|source| DispatchError::Manifest { path, source })
    }

    /// Latest record per artifact; later dispatches supersede earlier ones.
    pub fn latest(&self) -> HashMap<&Path, &DispatchRecord> {
        let mut out = HashMap::new();
        for rec in &self.records {
            out.insert(rec.artifact.as_path(), rec);
        }
        out
    }

    pub fn failures(&self) -> usize {
        self.latest()
            .values()
            .filter(|r| !r.outcome.is_success())
            .count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSummary {
    pub name: String,
    pub path: PathBuf,
    pub rows: usize,
    pub columns: usize,
    pub invalid_cells: usize,
    pub missing_cells: usize,
}

/// Result of one aggregation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregationSummary {
    pub tables: Vec<TableSummary>,
    pub parse_failures: usize,
    pub failed_runs: usize,
    pub modified_artifacts: usize,
    pub unexpected_artifacts: Vec<PathBuf>,
}

/// JSON report the binary prints for `run`, `aggregate` and `all`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignReport {
    pub run: RunMeta,
    pub dispatched: usize,
    pub failed: usize,
    pub aggregation: Option<AggregationSummary>,
}
