//! Aggregation: parse every artifact of a finished run phase and fold the
//! results into one metric table per measurement category.
//!
//! Parsing is read-only and runs in parallel; tables are filled afterwards in
//! dataset order. A failed run or a failed extraction becomes an invalid cell,
//! never an aborted pass.

use crate::config::CampaignConfig;
use crate::dispatch::artifact_digest;
use crate::error::{CampaignError, ParseError};
use crate::metrics::{net_cache_misses, net_memory_gib, parallel_efficiency};
use crate::parse::{
    or_zero, parse_cache_misses, parse_hash_distribution, parse_memory_report,
    parse_run_report, read_artifact,
};
use crate::schema::{AggregationSummary, CampaignManifest, TableSummary};
use crate::space::{
    column_key, Dataset, ExperimentSpace, HashFunction, MetricCategory, RunDescriptor,
};
use crate::table::{Cell, MetricTable};
use crate::SentinelMode;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};
use walkdir::WalkDir;

/// A table and where it is written.
#[derive(Clone, Debug)]
pub struct PlacedTable {
    pub path: PathBuf,
    pub table: MetricTable,
}

pub struct Aggregator<'a> {
    config: &'a CampaignConfig,
    space: &'a ExperimentSpace,
    mode: SentinelMode,
    failed_runs: HashSet<PathBuf>,
    digests: HashMap<PathBuf, String>,
    parse_failures: AtomicUsize,
}

impl<'a> Aggregator<'a> {
    pub fn new(config: &'a CampaignConfig, space: &'a ExperimentSpace, mode: SentinelMode) -> Self {
        Self {
            config,
            space,
            mode,
            failed_runs: HashSet::new(),
            digests: HashMap::new(),
            parse_failures: AtomicUsize::new(0),
        }
    }

    /// Use the run phase's manifest to mark failed runs and detect artifacts
    /// that changed after they were captured.
    pub fn with_manifest(mut self, manifest: &CampaignManifest) -> Self {
        for (path, rec) in manifest.latest() {
            if !rec.outcome.is_success() {
                self.failed_runs.insert(path.to_path_buf());
            }
            if let Some(d) = &rec.sha256 {
                self.digests.insert(path.to_path_buf(), d.clone());
            }
        }
        self
    }

    fn results_dir(&self) -> &Path {
        &self.config.results_dir
    }

    fn row_labels(&self, category: MetricCategory) -> Vec<String> {
        self.space
            .datasets_for(category)
            .iter()
            .map(Dataset::label)
            .collect()
    }

    /// Read and parse one artifact. `None` when the run failed during
    /// dispatch; parse failures are counted here.
    fn parse_artifact<T>(
        &self,
        run: &RunDescriptor,
        parse: fn(&str) -> Result<T, ParseError>,
    ) -> Option<(PathBuf, Result<T, ParseError>)> {
        let path = run.artifact_path(self.results_dir());
        if self.failed_runs.contains(&path) {
            warn!(artifact = %path.display(), "run failed during dispatch, cell marked invalid");
            return None;
        }
        let result = read_artifact(&path).and_then(|text| parse(&text));
        if result.is_err() {
            self.parse_failures.fetch_add(1, Ordering::Relaxed);
        }
        Some((path, result))
    }

    /// Parse a report. Failures are logged and yield `None`; the caller marks
    /// the cells it would have filled invalid.
    fn extract<T>(&self, run: &RunDescriptor, parse: fn(&str) -> Result<T, ParseError>) -> Option<T> {
        let (path, result) = self.parse_artifact(run, parse)?;
        result
            .map_err(|e| warn!(artifact = %path.display(), error = %e, "extraction failed"))
            .ok()
    }

    /// Like `extract`, but in zero mode a parse failure collapses to the zero
    /// value before any metric is derived from it.
    fn extract_scalar<T: Default>(
        &self,
        run: &RunDescriptor,
        parse: fn(&str) -> Result<T, ParseError>,
    ) -> Option<T> {
        match self.mode {
            SentinelMode::Zero => {
                let (path, result) = self.parse_artifact(run, parse)?;
                Some(or_zero(result, &path))
            }
            SentinelMode::Explicit => self.extract(run, parse),
        }
    }

    fn placed(&self, category: MetricCategory, table: MetricTable) -> PlacedTable {
        PlacedTable {
            path: category
                .dir(self.results_dir())
                .join(format!("{}.csv", table.name())),
            table,
        }
    }

    pub fn memory_footprint(&self) -> MetricTable {
        let category = MetricCategory::MemoryFootprint;
        let runs = self.space.for_category(category);
        let cells: Vec<Cell> = runs
            .par_iter()
            .map(|run| match self.extract_scalar(run, parse_memory_report) {
                Some(m) => Cell::Value(net_memory_gib(m.max_rss_kb, m.dataset_kb)),
                None => Cell::Invalid,
            })
            .collect();

        let mut table = MetricTable::new("memory-footprint", self.row_labels(category));
        for (run, cell) in runs.iter().zip(cells) {
            if let Some(key) = run.column_key() {
                table.set(&run.dataset.label(), &key, cell);
            }
        }
        table
    }

    pub fn cache_misses(&self) -> MetricTable {
        let category = MetricCategory::CacheMisses;
        let runs = self.space.for_category(category);
        let counts: Vec<Option<u64>> = runs
            .par_iter()
            .map(|run| self.extract_scalar(run, parse_cache_misses))
            .collect();

        let mut baselines: HashMap<String, Option<u64>> = HashMap::new();
        for (run, count) in runs.iter().zip(&counts) {
            if run.is_baseline() {
                baselines.insert(run.dataset.label(), *count);
            }
        }

        let mut table = MetricTable::new("cache-misses", self.row_labels(category));
        for (run, count) in runs.iter().zip(&counts) {
            let Some(key) = run.column_key() else {
                continue;
            };
            let ds = run.dataset.label();
            let baseline = baselines.get(&ds).copied().flatten();
            let cell = match (count, baseline) {
                (Some(total), Some(base)) => Cell::Value(net_cache_misses(*total, base) as f64),
                _ => Cell::Invalid,
            };
            table.set(&ds, &key, cell);
        }
        table
    }

    pub fn hash_distribution(&self) -> MetricTable {
        let category = MetricCategory::HashDistribution;
        let runs = self.space.for_category(category);
        let parsed: Vec<Option<Vec<(String, f64)>>> = runs
            .par_iter()
            .map(|run| self.extract(run, parse_hash_distribution))
            .collect();

        let mut table = MetricTable::new("hash-distribution", self.row_labels(category));
        let mut failed = Vec::new();
        for (run, dist) in runs.iter().zip(parsed) {
            match dist {
                Some(buckets) => {
                    for (bucket, count) in buckets {
                        table.set(&run.dataset.label(), &bucket, Cell::Value(count));
                    }
                }
                None => failed.push(run),
            }
        }
        for run in failed {
            invalidate_row(&mut table, run);
        }
        table
    }

    /// Mean-time tables for a timing category, one per distinct `name_of`.
    pub fn timing_tables(
        &self,
        category: MetricCategory,
        name_of: impl Fn(&RunDescriptor) -> String,
    ) -> Vec<MetricTable> {
        let runs = self.space.for_category(category);
        let parsed: Vec<_> = runs
            .par_iter()
            .map(|run| self.extract(run, parse_run_report))
            .collect();

        let rows = self.row_labels(category);
        let mut tables: Vec<MetricTable> = Vec::new();
        let mut failed = Vec::new();
        for (run, report) in runs.iter().zip(parsed) {
            let name = name_of(run);
            let idx = match tables.iter().position(|t| t.name() == name) {
                Some(i) => i,
                None => {
                    tables.push(MetricTable::new(&name, rows.clone()));
                    tables.len() - 1
                }
            };
            match report {
                Some(report) => {
                    let ds = run.dataset.label();
                    for (key, secs) in report.timings {
                        tables[idx].set(&ds, &key, Cell::Value(secs));
                    }
                }
                None => failed.push((idx, run)),
            }
        }
        for (idx, run) in failed {
            invalidate_row(&mut tables[idx], run);
        }
        tables
    }

    /// `<variant>@<threads>` efficiency relative to the one-thread run.
    pub fn efficiency_table(&self, per_thread: &[MetricTable]) -> Option<MetricTable> {
        let sweep = self.space.thread_sweep();
        let by_threads: Vec<(usize, &MetricTable)> = sweep
            .iter()
            .filter_map(|&t| {
                let name = sweep_table_name(t);
                per_thread.iter().find(|tb| tb.name() == name).map(|tb| (t, tb))
            })
            .collect();
        let (_, base) = by_threads.iter().find(|(t, _)| *t == 1)?;

        let mut columns: Vec<&String> = Vec::new();
        for (_, tb) in &by_threads {
            for c in tb.columns() {
                if !columns.contains(&c) {
                    columns.push(c);
                }
            }
        }

        let rows = self.row_labels(MetricCategory::ParallelEfficiency);
        let mut table = MetricTable::new("parallel-efficiency", rows.clone());
        for ds in &rows {
            for col in &columns {
                for (t, tb) in &by_threads {
                    let cell = match (base.get(ds, col), tb.get(ds, col)) {
                        (Some(Cell::Value(t1)), Some(Cell::Value(tn))) => parallel_efficiency(t1, tn, *t)
                            .map(Cell::Value)
                            .unwrap_or(Cell::Invalid),
                        _ => Cell::Invalid,
                    };
                    table.set(ds, &format!("{col}@{t}"), cell);
                }
            }
        }
        Some(table)
    }

    /// Build every table without writing anything.
    pub fn build(&self) -> Vec<PlacedTable> {
        let mut out = Vec::new();

        info!("aggregating memory footprint");
        out.push(self.placed(MetricCategory::MemoryFootprint, self.memory_footprint()));

        info!("aggregating cpu time");
        for table in self.timing_tables(MetricCategory::CpuTime, |r| {
            format!("{}_threads_{}", r.threads.unwrap_or(1), r.access.label())
        }) {
            out.push(self.placed(MetricCategory::CpuTime, table));
        }

        info!("aggregating hash distribution");
        out.push(self.placed(MetricCategory::HashDistribution, self.hash_distribution()));

        info!("aggregating cache misses");
        out.push(self.placed(MetricCategory::CacheMisses, self.cache_misses()));

        info!("aggregating parallel efficiency");
        let per_thread = self.timing_tables(MetricCategory::ParallelEfficiency, |r| {
            sweep_table_name(r.threads.unwrap_or(1))
        });
        if let Some(eff) = self.efficiency_table(&per_thread) {
            out.push(self.placed(MetricCategory::ParallelEfficiency, eff));
        }
        for table in per_thread {
            out.push(self.placed(MetricCategory::ParallelEfficiency, table));
        }

        info!("aggregating gpu time");
        for table in self.timing_tables(MetricCategory::GpuTime, |r| {
            format!("gpu_time_{}", r.access.label())
        }) {
            out.push(self.placed(MetricCategory::GpuTime, table));
        }

        out
    }

    fn modified_artifacts(&self) -> usize {
        let mut modified = 0;
        for (path, recorded) in &self.digests {
            match artifact_digest(path) {
                Ok(now) if &now == recorded => {}
                Ok(_) => {
                    modified += 1;
                    warn!(artifact = %path.display(), "artifact changed after the run phase");
                }
                Err(e) => {
                    modified += 1;
                    warn!(artifact = %path.display(), error = %e, "artifact disappeared after the run phase");
                }
            }
        }
        modified
    }

    /// Files in the category directories that no descriptor accounts for.
    fn unexpected_artifacts(&self) -> Vec<PathBuf> {
        let expected: HashSet<PathBuf> = self
            .space
            .enumerate()
            .iter()
            .map(|r| r.artifact_path(self.results_dir()))
            .collect();
        let dirs: HashSet<PathBuf> = MetricCategory::ALL
            .iter()
            .map(|c| c.dir(self.results_dir()))
            .collect();

        let mut out = Vec::new();
        for dir in dirs.iter().filter(|d| d.is_dir()) {
            for entry in WalkDir::new(dir).follow_links(false).into_iter().flatten() {
                let path = entry.path();
                if !entry.file_type().is_file() || path.extension().is_some_and(|e| e == "csv") {
                    continue;
                }
                if !expected.contains(path) {
                    warn!(artifact = %path.display(), "artifact not produced by this campaign");
                    out.push(path.to_path_buf());
                }
            }
        }
        out.sort();
        out
    }

    /// Build and write every table.
    pub fn run(&self) -> Result<AggregationSummary, CampaignError> {
        let placed = self.build();
        let mut summary = AggregationSummary {
            failed_runs: self.failed_runs.len(),
            modified_artifacts: self.modified_artifacts(),
            unexpected_artifacts: self.unexpected_artifacts(),
            ..AggregationSummary::default()
        };

        for PlacedTable { path, table } in placed {
            table
                .write_csv(&path, self.mode)
                .map_err(|source| CampaignError::Table {
                    path: path.clone(),
                    source,
                })?;
            info!(table = table.name(), path = %path.display(), "table written");
            summary.tables.push(TableSummary {
                name: table.name().to_string(),
                rows: table.datasets().count(),
                columns: table.columns().len(),
                invalid_cells: table.invalid_count(),
                missing_cells: table.missing_cells().len(),
                path,
            });
        }
        summary.parse_failures = self.parse_failures.load(Ordering::Relaxed);
        Ok(summary)
    }
}

fn sweep_table_name(threads: usize) -> String {
    format!("{threads}_threads")
}

/// Mark a failed row invalid across the table's columns, or across the column
/// keys the run would have reported when no other row produced columns either.
fn invalidate_row(table: &mut MetricTable, run: &RunDescriptor) {
    let mut columns = table.columns().to_vec();
    if columns.is_empty() {
        columns = run
            .variants
            .iter()
            .map(|v| {
                let hash = v
                    .is_hash_parameterized()
                    .then(|| run.hash.unwrap_or(HashFunction::Combined));
                column_key(&v.name, hash)
            })
            .collect();
    }
    let ds = run.dataset.label();
    for col in columns {
        table.set(&ds, &col, Cell::Invalid);
    }
}
