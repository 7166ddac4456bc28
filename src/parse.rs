//! Raw artifact parsers.
//!
//! Artifacts mix tool banners with the executable's own output, so every
//! extractor searches for its marker instead of assuming a pure format. When
//! repeated runs have been appended to one artifact the most recent value wins.
//! All functions are pure over the artifact text.

use crate::error::ParseError;
use serde::Deserialize;
use serde_yaml::Value;
use std::fs;
use std::path::Path;
use tracing::warn;

/// Memory the executable reports for holding the dataset, in kilobytes.
pub const DATASET_MEMORY_MARKER: &str = "dataset-memory-used:";
/// Peak resident set size reported by `time -v`, in kilobytes.
pub const MAX_RSS_MARKER: &str = "Maximum resident set size (kbytes):";
/// Event name `perf stat` prints after the counter total.
pub const CACHE_MISSES_MARKER: &str = "cache-misses";

const HASH_DISTRIBUTION_KEY: &str = "face-hash-distribution";

/// Read an artifact without assuming it is valid UTF-8.
pub fn read_artifact(path: &Path) -> Result<String, ParseError> {
    let bytes = fs::read(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Collapse a failed extraction to the historical zero sentinel, with a
/// diagnostic naming the artifact.
pub fn or_zero<T: Default>(result: Result<T, ParseError>, artifact: &Path) -> T {
    result.unwrap_or_else(|e| {
        warn!(artifact = %artifact.display(), error = %e, "extraction failed, reporting zero");
        T::default()
    })
}

fn grouped_digits(token: &str) -> Option<u64> {
    let digits: String = token.chars().filter(|c| *c != ',').collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Integer that follows the last `marker`, spaces or tabs in between. The
/// last occurrence is authoritative: if its value does not parse, earlier
/// appended runs are not consulted.
pub fn value_after(text: &str, marker: &'static str) -> Result<u64, ParseError> {
    let idx = text
        .rfind(marker)
        .ok_or(ParseError::MarkerMissing { marker })?;
    let rest = text[idx + marker.len()..].trim_start_matches([' ', '\t']);
    let token: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ',')
        .collect();
    grouped_digits(&token).ok_or_else(|| ParseError::BadNumber {
        marker,
        raw: rest.lines().next().unwrap_or("").trim().to_string(),
    })
}

/// Integer that precedes the last `marker` occurrence standing on its own
/// (whitespace before it, so `L1-dcache-misses` is not a match). Grouping
/// separators are stripped.
pub fn count_before(text: &str, marker: &'static str) -> Result<u64, ParseError> {
    let head = text
        .rmatch_indices(marker)
        .map(|(idx, _)| &text[..idx])
        .find(|head| head.ends_with(char::is_whitespace))
        .ok_or(ParseError::MarkerMissing { marker })?
        .trim_end();
    let start = head
        .rfind(|c: char| !(c.is_ascii_digit() || c == ','))
        .map(|i| i + head[i..].chars().next().map_or(1, char::len_utf8))
        .unwrap_or(0);
    grouped_digits(&head[start..]).ok_or_else(|| ParseError::BadNumber {
        marker,
        raw: head.lines().last().unwrap_or("").trim().to_string(),
    })
}

/// Scalars captured by a memory-profiled run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryReport {
    pub dataset_kb: u64,
    pub max_rss_kb: u64,
}

/// Both figures of the latest appended run. `time -v` prints the peak RSS
/// after the executable's own output, so the latest run spans from the end of
/// the previous RSS line to the last one.
pub fn parse_memory_report(text: &str) -> Result<MemoryReport, ParseError> {
    let missing_rss = ParseError::MarkerMissing {
        marker: MAX_RSS_MARKER,
    };
    let rss_at = text.rfind(MAX_RSS_MARKER).ok_or(missing_rss.clone())?;
    if text[rss_at..].contains(DATASET_MEMORY_MARKER) {
        // The latest run died before `time -v` reported.
        return Err(missing_rss);
    }
    let run_start = text[..rss_at]
        .rfind(MAX_RSS_MARKER)
        .map_or(0, |i| i + MAX_RSS_MARKER.len());
    Ok(MemoryReport {
        dataset_kb: value_after(&text[run_start..rss_at], DATASET_MEMORY_MARKER)?,
        max_rss_kb: value_after(&text[rss_at..], MAX_RSS_MARKER)?,
    })
}

pub fn parse_cache_misses(text: &str) -> Result<u64, ParseError> {
    count_before(text, CACHE_MISSES_MARKER)
}

#[derive(Debug, Deserialize)]
struct ReportEntry {
    #[serde(default)]
    experiments: Value,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Trial {
    #[serde(rename = "seconds-total")]
    pub seconds_total: f64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Experiment {
    #[serde(rename = "algorithm-name")]
    pub algorithm_name: String,
    #[serde(rename = "hash-name", default)]
    pub hash_name: Option<String>,
    #[serde(default)]
    pub trials: Vec<Trial>,
}

impl Experiment {
    /// `Name` when no hash function applies, otherwise `Name-Hash`.
    pub fn column_key(&self) -> String {
        match self.hash_name.as_deref() {
            None | Some("None") | Some("") => self.algorithm_name.clone(),
            Some(hash) => format!("{}-{}", self.algorithm_name, hash),
        }
    }

    /// Arithmetic mean of `seconds-total`; zero when there are no trials.
    pub fn mean_seconds(&self) -> f64 {
        if self.trials.is_empty() {
            return 0.0;
        }
        let total: f64 = self.trials.iter().map(|t| t.seconds_total).sum();
        total / self.trials.len() as f64
    }
}

/// Mean time per variant, in report order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunReport {
    pub timings: Vec<(String, f64)>,
}

impl RunReport {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.timings
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
    }
}

/// Candidate YAML blocks: runs of lines opened by a top-level `-` item and
/// continued by indented, blank, or further top-level item lines.
fn yaml_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Option<String> = None;
    for line in text.lines() {
        let top_item = line.starts_with("- ") || line == "-";
        let continuation = line.trim().is_empty() || line.starts_with(char::is_whitespace);
        if let Some(block) = current.as_mut() {
            if top_item || continuation {
                block.push_str(line);
                block.push('\n');
                continue;
            }
            blocks.extend(current.take());
        }
        if top_item {
            current = Some(format!("{line}\n"));
        }
    }
    blocks.extend(current);
    blocks
}

/// The most recent report entry in the artifact.
fn latest_entry(text: &str) -> Result<ReportEntry, ParseError> {
    if let Ok(entries) = serde_yaml::from_str::<Vec<ReportEntry>>(text) {
        return entries.into_iter().last().ok_or(ParseError::NoReport);
    }

    let mut last_err = None;
    let mut latest = None;
    for block in yaml_blocks(text) {
        match serde_yaml::from_str::<Vec<ReportEntry>>(&block) {
            Ok(entries) => latest = entries.into_iter().last().or(latest),
            Err(e) => last_err = Some(e.to_string()),
        }
    }
    match (latest, last_err) {
        (Some(entry), _) => Ok(entry),
        (None, Some(e)) => Err(ParseError::Malformed(e)),
        (None, None) => Err(ParseError::NoReport),
    }
}

/// Average trial time of every experiment in a structured run report.
pub fn parse_run_report(text: &str) -> Result<RunReport, ParseError> {
    let entry = latest_entry(text)?;
    let experiments: Vec<Experiment> = match entry.experiments {
        Value::Sequence(_) => serde_yaml::from_value(entry.experiments)
            .map_err(|e| ParseError::Malformed(e.to_string()))?,
        Value::Null => Vec::new(),
        _ => {
            return Err(ParseError::Malformed(
                "experiments is not a sequence".to_string(),
            ))
        }
    };
    Ok(RunReport {
        timings: experiments
            .iter()
            .map(|e| (e.column_key(), e.mean_seconds()))
            .collect(),
    })
}

fn scalar_label(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}

fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Bucket -> count pairs of the face hash distribution, in report order.
/// Accepts a mapping (bucket to count) or a plain sequence of counts.
pub fn parse_hash_distribution(text: &str) -> Result<Vec<(String, f64)>, ParseError> {
    let entry = latest_entry(text)?;
    let dist = entry
        .experiments
        .get(HASH_DISTRIBUTION_KEY)
        .ok_or_else(|| ParseError::Malformed(format!("{HASH_DISTRIBUTION_KEY} missing")))?;

    let malformed = |what: &str| ParseError::Malformed(format!("non-numeric {what} in distribution"));
    let count = |label: String, v: &Value| -> Result<(String, f64), ParseError> {
        Ok((label, number(v).ok_or_else(|| malformed("count"))?))
    };
    match dist {
        Value::Mapping(map) => map.iter().map(|(k, v)| count(scalar_label(k), v)).collect(),
        Value::Sequence(seq) => seq
            .iter()
            .enumerate()
            .map(|(i, v)| count(i.to_string(), v))
            .collect(),
        other => number(other)
            .map(|v| vec![("value".to_string(), v)])
            .ok_or_else(|| malformed("value")),
    }
}
