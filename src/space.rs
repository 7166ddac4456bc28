//! Experiment space: the combinatorial run matrix and its artifact naming.
//!
//! Everything here is pure. `ExperimentSpace::enumerate` yields descriptors in
//! dispatch order and `RunDescriptor::artifact_path` maps each one to a unique
//! file under the results directory.

use crate::config::CampaignConfig;
use crate::error::ConfigError;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Whether an algorithm variant can use more than one thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlgorithmCategory {
    SequentialOnly,
    ParallelCapable,
}

/// Whether an algorithm variant takes a hash-function selector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Hashing {
    HashFree,
    HashParameterized,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlgorithmVariant {
    /// Command-line flag selecting the variant, e.g. `--p-hash-sort`.
    pub flag: String,
    /// Report name, e.g. `P-Hash-Sort`. Also the table column stem.
    pub name: String,
    pub category: AlgorithmCategory,
    pub hashing: Hashing,
}

impl AlgorithmVariant {
    pub fn new(flag: &str, name: &str, category: AlgorithmCategory, hashing: Hashing) -> Self {
        Self {
            flag: flag.to_string(),
            name: name.to_string(),
            category,
            hashing,
        }
    }

    pub fn is_parallel(&self) -> bool {
        self.category == AlgorithmCategory::ParallelCapable
    }

    pub fn is_hash_parameterized(&self) -> bool {
        self.hashing == Hashing::HashParameterized
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HashFunction {
    /// Placeholder meaning "no specific hash function"; never iterated.
    Combined,
    Fnv1a,
    MinPointId,
}

impl HashFunction {
    /// The hash functions that are measured separately.
    pub const CONCRETE: [HashFunction; 2] = [HashFunction::Fnv1a, HashFunction::MinPointId];

    /// Value passed to the executable's `-f` selector.
    pub fn selector(self) -> u8 {
        match self {
            HashFunction::Combined => 0,
            HashFunction::Fnv1a => 1,
            HashFunction::MinPointId => 2,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            HashFunction::Combined => "Both",
            HashFunction::Fnv1a => "FNV1A",
            HashFunction::MinPointId => "MinPointID",
        }
    }
}

impl fmt::Display for HashFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Table column identity of a variant: `Name` or `Name-Hash`.
pub fn column_key(name: &str, hash: Option<HashFunction>) -> String {
    match hash {
        Some(h) => format!("{name}-{}", h.label()),
        None => name.to_string(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessPattern {
    Sequential,
    Random,
}

impl AccessPattern {
    pub fn label(self) -> &'static str {
        match self {
            AccessPattern::Sequential => "normal",
            AccessPattern::Random => "random",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    CpuParallel,
    Gpu,
}

/// How the invocation is wrapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MeasurementMode {
    Timing,
    MemoryProfiled,
    CacheCounterProfiled,
}

impl MeasurementMode {
    /// Profiled runs measure whole-system usage and must not overlap.
    pub fn is_profiled(self) -> bool {
        !matches!(self, MeasurementMode::Timing)
    }
}

/// Measurement category, in dispatch order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "kebab-case")]
pub enum MetricCategory {
    MemoryFootprint,
    CpuTime,
    HashDistribution,
    CacheMisses,
    ParallelEfficiency,
    GpuTime,
}

impl MetricCategory {
    pub const ALL: [MetricCategory; 6] = [
        MetricCategory::MemoryFootprint,
        MetricCategory::CpuTime,
        MetricCategory::HashDistribution,
        MetricCategory::CacheMisses,
        MetricCategory::ParallelEfficiency,
        MetricCategory::GpuTime,
    ];

    /// Directory under the results root. Hash distribution and cache misses
    /// share one directory; their file names keep them apart.
    pub fn dir_name(self) -> &'static str {
        match self {
            MetricCategory::MemoryFootprint => "memory_footprint",
            MetricCategory::CpuTime => "cpu_time",
            MetricCategory::HashDistribution | MetricCategory::CacheMisses => "hash_performance",
            MetricCategory::ParallelEfficiency => "cpu_parallel_efficiency",
            MetricCategory::GpuTime => "gpu_time",
        }
    }

    pub fn dir(self, results_dir: &Path) -> PathBuf {
        results_dir.join(self.dir_name())
    }

    pub fn mode(self) -> MeasurementMode {
        match self {
            MetricCategory::MemoryFootprint => MeasurementMode::MemoryProfiled,
            MetricCategory::CacheMisses => MeasurementMode::CacheCounterProfiled,
            _ => MeasurementMode::Timing,
        }
    }

    /// Expensive categories only run against the largest datasets.
    pub fn largest_only(self) -> bool {
        matches!(
            self,
            MetricCategory::HashDistribution
                | MetricCategory::CacheMisses
                | MetricCategory::ParallelEfficiency
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MetricCategory::MemoryFootprint => "memory-footprint",
            MetricCategory::CpuTime => "cpu-time",
            MetricCategory::HashDistribution => "hash-distribution",
            MetricCategory::CacheMisses => "cache-misses",
            MetricCategory::ParallelEfficiency => "parallel-efficiency",
            MetricCategory::GpuTime => "gpu-time",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dataset {
    pub path: PathBuf,
}

impl Dataset {
    /// Row label: the file name, extension included.
    pub fn label(&self) -> String {
        self.path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }
}

/// Full identity of one invocation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunDescriptor {
    pub category: MetricCategory,
    pub dataset: Dataset,
    /// Empty for bare dataset loads and hash-distribution queries.
    pub variants: Vec<AlgorithmVariant>,
    pub hash: Option<HashFunction>,
    /// `None` leaves the thread count to the executable.
    pub threads: Option<usize>,
    pub access: AccessPattern,
    /// `None` omits `-n`.
    pub iterations: Option<u32>,
    pub mode: MeasurementMode,
    pub backend: Backend,
}

impl RunDescriptor {
    /// True for the bare dataset-load measurement used as a baseline.
    pub fn is_baseline(&self) -> bool {
        self.category == MetricCategory::CacheMisses && self.variants.is_empty()
    }

    /// Column key for single-variant descriptors.
    pub fn column_key(&self) -> Option<String> {
        match self.variants.as_slice() {
            [v] => Some(column_key(&v.name, self.hash)),
            _ => None,
        }
    }

    pub fn artifact_name(&self) -> String {
        let ds = self.dataset.label();
        let threads = self.threads.unwrap_or(1);
        match self.category {
            MetricCategory::MemoryFootprint => {
                format!("{ds}_{}.txt", self.column_key().unwrap_or_default())
            }
            MetricCategory::CpuTime => {
                format!("{ds}_{threads}_threads_{}.yaml", self.access.label())
            }
            MetricCategory::HashDistribution => format!("{ds}_hash_distribution.yaml"),
            MetricCategory::CacheMisses => match self.column_key() {
                Some(key) => format!("{ds}_{key}_cache_misses.txt"),
                None => format!("{ds}_cache_misses.txt"),
            },
            MetricCategory::ParallelEfficiency => format!("{ds}_{threads}_threads.yaml"),
            MetricCategory::GpuTime => format!("{ds}_{}.yaml", self.access.label()),
        }
    }

    pub fn artifact_path(&self, results_dir: &Path) -> PathBuf {
        self.category.dir(results_dir).join(self.artifact_name())
    }
}

/// Largest power of two not exceeding `available`.
pub fn max_power_of_two(available: usize) -> usize {
    if available == 0 {
        return 0;
    }
    1usize << (usize::BITS - 1 - available.leading_zeros())
}

/// Every power of two from 1 up to the largest one within `available`.
pub fn thread_sweep(available: usize) -> Vec<usize> {
    let max = max_power_of_two(available);
    std::iter::successors(Some(1usize), |t| t.checked_mul(2))
        .take_while(|&t| t <= max)
        .collect()
}

/// Validated, enumerable run matrix.
#[derive(Clone, Debug)]
pub struct ExperimentSpace {
    datasets: Vec<Dataset>,
    largest_subset: usize,
    algorithms: Vec<AlgorithmVariant>,
    iterations: u32,
    max_threads: usize,
    sweep: Vec<usize>,
}

impl ExperimentSpace {
    pub fn new(config: &CampaignConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let available = config.parallelism();
        Ok(Self {
            datasets: config
                .datasets
                .iter()
                .map(|p| Dataset { path: p.clone() })
                .collect(),
            largest_subset: config.largest_subset_len(),
            algorithms: config.algorithms.clone(),
            iterations: config.iterations,
            max_threads: max_power_of_two(available),
            sweep: thread_sweep(available),
        })
    }

    pub fn datasets(&self) -> &[Dataset] {
        &self.datasets
    }

    /// Suffix of the size-ordered dataset list.
    pub fn largest_datasets(&self) -> &[Dataset] {
        &self.datasets[self.datasets.len() - self.largest_subset..]
    }

    pub fn datasets_for(&self, category: MetricCategory) -> &[Dataset] {
        if category.largest_only() {
            self.largest_datasets()
        } else {
            self.datasets()
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    pub fn thread_sweep(&self) -> &[usize] {
        &self.sweep
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn algorithms(&self) -> &[AlgorithmVariant] {
        &self.algorithms
    }

    pub fn parallel_algorithms(&self) -> Vec<AlgorithmVariant> {
        self.algorithms.iter().filter(|a| a.is_parallel()).cloned().collect()
    }

    pub fn hashed_algorithms(&self) -> Vec<AlgorithmVariant> {
        self.algorithms
            .iter()
            .filter(|a| a.is_hash_parameterized())
            .cloned()
            .collect()
    }

    /// Single-variant identities: hash-free variants alone, hash-parameterized
    /// variants once per concrete hash function.
    pub fn single_variants(&self) -> Vec<(AlgorithmVariant, Option<HashFunction>)> {
        let mut out = Vec::new();
        for algo in self.algorithms.iter().filter(|a| !a.is_hash_parameterized()) {
            out.push((algo.clone(), None));
        }
        for algo in self.algorithms.iter().filter(|a| a.is_hash_parameterized()) {
            for h in HashFunction::CONCRETE {
                out.push((algo.clone(), Some(h)));
            }
        }
        out
    }

    /// Every descriptor, categories in dispatch order.
    pub fn enumerate(&self) -> Vec<RunDescriptor> {
        MetricCategory::ALL
            .iter()
            .flat_map(|&c| self.for_category(c))
            .collect()
    }

    pub fn for_category(&self, category: MetricCategory) -> Vec<RunDescriptor> {
        let mut out = Vec::new();
        for dataset in self.datasets_for(category) {
            self.push_runs(category, dataset, &mut out);
        }
        out
    }

    fn base(&self, category: MetricCategory, dataset: &Dataset) -> RunDescriptor {
        RunDescriptor {
            category,
            dataset: dataset.clone(),
            variants: Vec::new(),
            hash: None,
            threads: Some(1),
            access: AccessPattern::Sequential,
            iterations: Some(self.iterations),
            mode: category.mode(),
            backend: Backend::CpuParallel,
        }
    }

    fn push_runs(&self, category: MetricCategory, dataset: &Dataset, out: &mut Vec<RunDescriptor>) {
        let base = self.base(category, dataset);
        match category {
            MetricCategory::MemoryFootprint => {
                for (algo, hash) in self.single_variants() {
                    out.push(RunDescriptor {
                        variants: vec![algo],
                        hash,
                        iterations: Some(0),
                        ..base.clone()
                    });
                }
            }
            MetricCategory::CpuTime => {
                out.push(RunDescriptor {
                    variants: self.algorithms.clone(),
                    ..base.clone()
                });
                let parallel = self.parallel_algorithms();
                if parallel.is_empty() {
                    return;
                }
                // On a single-core host the sequential-pattern run at max
                // threads is the one-thread run above.
                if self.max_threads > 1 {
                    out.push(RunDescriptor {
                        variants: parallel.clone(),
                        threads: Some(self.max_threads),
                        ..base.clone()
                    });
                }
                out.push(RunDescriptor {
                    variants: parallel,
                    threads: Some(self.max_threads),
                    access: AccessPattern::Random,
                    ..base
                });
            }
            MetricCategory::HashDistribution => out.push(RunDescriptor {
                iterations: None,
                ..base
            }),
            MetricCategory::CacheMisses => {
                out.push(RunDescriptor {
                    threads: None,
                    iterations: Some(0),
                    ..base.clone()
                });
                for algo in self.hashed_algorithms() {
                    for h in HashFunction::CONCRETE {
                        out.push(RunDescriptor {
                            variants: vec![algo.clone()],
                            hash: Some(h),
                            iterations: Some(0),
                            ..base.clone()
                        });
                    }
                }
            }
            MetricCategory::ParallelEfficiency => {
                let parallel = self.parallel_algorithms();
                if parallel.is_empty() {
                    return;
                }
                for &t in &self.sweep {
                    out.push(RunDescriptor {
                        variants: parallel.clone(),
                        threads: Some(t),
                        ..base.clone()
                    });
                }
            }
            MetricCategory::GpuTime => {
                let hashed = self.hashed_algorithms();
                if hashed.is_empty() {
                    return;
                }
                for access in [AccessPattern::Sequential, AccessPattern::Random] {
                    out.push(RunDescriptor {
                        variants: hashed.clone(),
                        threads: None,
                        access,
                        backend: Backend::Gpu,
                        ..base.clone()
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn config(datasets: &[&str], parallelism: usize) -> CampaignConfig {
        CampaignConfig {
            datasets: datasets.iter().map(PathBuf::from).collect(),
            available_parallelism: Some(parallelism),
            ..CampaignConfig::default()
        }
    }

    #[test]
    fn powers_of_two() {
        assert_eq!(max_power_of_two(1), 1);
        assert_eq!(max_power_of_two(6), 4);
        assert_eq!(max_power_of_two(16), 16);
        assert_eq!(thread_sweep(12), vec![1, 2, 4, 8]);
        assert_eq!(thread_sweep(1), vec![1]);
    }

    #[test]
    fn artifact_paths_are_unique() {
        for parallelism in [1, 3, 8] {
            let cfg = config(&["/d/a.vtu", "/d/b.vtu", "/d/c.vtu", "/d/e.vtu"], parallelism);
            let space = ExperimentSpace::new(&cfg).unwrap();
            let runs = space.enumerate();
            let paths: HashSet<PathBuf> =
                runs.iter().map(|r| r.artifact_path(Path::new("/r"))).collect();
            assert_eq!(paths.len(), runs.len(), "collision at parallelism {parallelism}");
        }
    }

    #[test]
    fn artifact_path_is_deterministic() {
        let cfg = config(&["/d/a.vtu", "/d/b.vtu"], 4);
        let a = ExperimentSpace::new(&cfg).unwrap().enumerate();
        let b = ExperimentSpace::new(&cfg).unwrap().enumerate();
        assert_eq!(a, b);
        let root = Path::new("/results");
        for (x, y) in a.iter().zip(&b) {
            assert_eq!(x.artifact_path(root), y.artifact_path(root));
        }
    }

    #[test]
    fn memory_runs_cover_single_variants() {
        let cfg = config(&["/d/a.vtu"], 4);
        let space = ExperimentSpace::new(&cfg).unwrap();
        let names: Vec<String> = space
            .for_category(MetricCategory::MemoryFootprint)
            .iter()
            .map(|r| r.artifact_name())
            .collect();
        assert_eq!(names.len(), 4 + 3 * 2);
        assert!(names.contains(&"a.vtu_S-Hash.txt".to_string()));
        assert!(names.contains(&"a.vtu_P-Hash-Sort-FNV1A.txt".to_string()));
        assert!(!names.iter().any(|n| n.contains("Both")));
    }

    #[test]
    fn expensive_categories_use_largest_subset() {
        let cfg = CampaignConfig {
            largest_subset: Some(2),
            ..config(&["/d/a.vtu", "/d/b.vtu", "/d/c.vtu"], 4)
        };
        let space = ExperimentSpace::new(&cfg).unwrap();
        let cache = space.for_category(MetricCategory::CacheMisses);
        assert!(cache.iter().all(|r| r.dataset.label() != "a.vtu"));
        // Baseline plus 3 hashed variants x 2 hash functions, per dataset.
        assert_eq!(cache.len(), 2 * (1 + 6));
        assert_eq!(cache.iter().filter(|r| r.is_baseline()).count(), 2);

        let sweep = space.for_category(MetricCategory::ParallelEfficiency);
        let threads: Vec<usize> = sweep.iter().filter_map(|r| r.threads).collect();
        assert_eq!(threads, vec![1, 2, 4, 1, 2, 4]);

        let dist = space.for_category(MetricCategory::HashDistribution);
        let labels: Vec<String> = dist.iter().map(|r| r.dataset.label()).collect();
        assert_eq!(labels, vec!["b.vtu", "c.vtu"]);
    }

    #[test]
    fn cpu_time_uses_one_and_max_threads() {
        let cfg = config(&["/d/a.vtu"], 6);
        let space = ExperimentSpace::new(&cfg).unwrap();
        let names: Vec<String> = space
            .for_category(MetricCategory::CpuTime)
            .iter()
            .map(|r| r.artifact_name())
            .collect();
        assert_eq!(
            names,
            vec![
                "a.vtu_1_threads_normal.yaml",
                "a.vtu_4_threads_normal.yaml",
                "a.vtu_4_threads_random.yaml",
            ]
        );
    }

    #[test]
    fn random_access_only_for_parallel_and_gpu() {
        let cfg = config(&["/d/a.vtu"], 4);
        let space = ExperimentSpace::new(&cfg).unwrap();
        for run in space.enumerate() {
            if run.access == AccessPattern::Random && run.backend == Backend::CpuParallel {
                assert!(run.variants.iter().all(|v| v.is_parallel()));
            }
        }
        let gpu = space.for_category(MetricCategory::GpuTime);
        assert_eq!(gpu.len(), 2);
        assert!(gpu.iter().all(|r| r.backend == Backend::Gpu));
    }

    #[test]
    fn categories_follow_declared_order() {
        let cfg = config(&["/d/a.vtu", "/d/b.vtu"], 2);
        let space = ExperimentSpace::new(&cfg).unwrap();
        let runs = space.enumerate();
        let order: Vec<MetricCategory> = runs.iter().map(|r| r.category).collect();
        let mut sorted = order.clone();
        sorted.sort();
        assert_eq!(order, sorted);
    }

    #[test]
    fn empty_datasets_fail_fast() {
        let cfg = config(&[], 4);
        assert!(matches!(
            ExperimentSpace::new(&cfg),
            Err(ConfigError::NoDatasets)
        ));
    }

    #[test]
    fn zero_parallelism_fails_fast() {
        let cfg = config(&["/d/a.vtu"], 0);
        assert!(matches!(
            ExperimentSpace::new(&cfg),
            Err(ConfigError::NoParallelism)
        ));
    }
}
