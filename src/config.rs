//! Immutable campaign configuration.
//!
//! Built once (YAML file, then CLI overrides) and passed by reference to every
//! stage.

use crate::error::ConfigError;
use crate::space::{column_key, AlgorithmCategory, AlgorithmVariant, HashFunction, Hashing};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Wrapper used for memory footprint runs (GNU time, verbose report).
pub const DEFAULT_MEMORY_PROFILER: &str = "time -v";
/// Wrapper used for cache-miss runs.
pub const DEFAULT_CACHE_PROFILER: &str = "perf stat -e cache-misses";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CampaignConfig {
    /// The benchmarked executable.
    pub executable: PathBuf,
    /// Root of the per-category artifact directories.
    pub results_dir: PathBuf,
    /// Input datasets, smallest first.
    pub datasets: Vec<PathBuf>,
    /// Number of largest datasets used by the expensive categories.
    /// Defaults to two (or every dataset, if fewer).
    pub largest_subset: Option<usize>,
    pub iterations: u32,
    pub algorithms: Vec<AlgorithmVariant>,
    pub memory_profiler: String,
    pub cache_profiler: String,
    /// Backend identifier passed with `-d` for CPU runs.
    pub cpu_backend: String,
    /// Backend identifier passed with `-d` for GPU runs.
    pub gpu_backend: String,
    /// Overrides the host's available parallelism.
    pub available_parallelism: Option<usize>,
    /// Per-invocation timeout; expiry is a reported failure for that run.
    pub timeout_secs: Option<u64>,
    /// Cap on concurrent unprofiled invocations.
    pub jobs: usize,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("vtk-external-facelist-evaluation"),
            results_dir: PathBuf::from("results"),
            datasets: Vec::new(),
            largest_subset: None,
            iterations: 10,
            algorithms: default_algorithms(),
            memory_profiler: DEFAULT_MEMORY_PROFILER.to_string(),
            cache_profiler: DEFAULT_CACHE_PROFILER.to_string(),
            cpu_backend: "TBB".to_string(),
            gpu_backend: "KOKKOS".to_string(),
            available_parallelism: None,
            timeout_secs: None,
            jobs: 1,
        }
    }
}

/// The seven variants of the external-faces executable.
pub fn default_algorithms() -> Vec<AlgorithmVariant> {
    use AlgorithmCategory::{ParallelCapable, SequentialOnly};
    use Hashing::{HashFree, HashParameterized};
    vec![
        AlgorithmVariant::new("--s-classifier", "S-Classifier", SequentialOnly, HashFree),
        AlgorithmVariant::new("--s-hash", "S-Hash", SequentialOnly, HashFree),
        AlgorithmVariant::new("--p-classifier", "P-Classifier", ParallelCapable, HashFree),
        AlgorithmVariant::new("--p-hash", "P-Hash", ParallelCapable, HashFree),
        AlgorithmVariant::new("--p-hash-sort", "P-Hash-Sort", ParallelCapable, HashParameterized),
        AlgorithmVariant::new("--p-hash-fight", "P-Hash-Fight", ParallelCapable, HashParameterized),
        AlgorithmVariant::new("--p-hash-count", "P-Hash-Count", ParallelCapable, HashParameterized),
    ]
}

impl CampaignConfig {
    /// Load a configuration from a YAML file. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Host parallelism unless overridden; 0 when it cannot be determined.
    pub fn parallelism(&self) -> usize {
        self.available_parallelism.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(0)
        })
    }

    pub fn largest_subset_len(&self) -> usize {
        self.largest_subset.unwrap_or(2).min(self.datasets.len())
    }

    /// Structural checks that must pass before anything is dispatched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.datasets.is_empty() {
            return Err(ConfigError::NoDatasets);
        }
        if self.algorithms.is_empty() {
            return Err(ConfigError::NoAlgorithms);
        }

        let mut labels: HashMap<String, &PathBuf> = HashMap::new();
        for path in &self.datasets {
            let label = crate::space::Dataset { path: path.clone() }.label();
            if let Some(first) = labels.insert(label.clone(), path) {
                return Err(ConfigError::DuplicateDataset {
                    label,
                    first: first.clone(),
                    second: path.clone(),
                });
            }
        }

        self.check_variant_identities()?;

        if let Some(subset) = self.largest_subset {
            if subset == 0 || subset > self.datasets.len() {
                return Err(ConfigError::LargestSubset {
                    subset,
                    datasets: self.datasets.len(),
                });
            }
        }
        if self.parallelism() == 0 {
            return Err(ConfigError::NoParallelism);
        }
        if self.iterations == 0 {
            return Err(ConfigError::Zero { field: "iterations" });
        }
        if self.jobs == 0 {
            return Err(ConfigError::Zero { field: "jobs" });
        }
        if self.memory_profiler.trim().is_empty() {
            return Err(ConfigError::EmptyCommand {
                what: "memory profiler",
            });
        }
        if self.cache_profiler.trim().is_empty() {
            return Err(ConfigError::EmptyCommand {
                what: "cache profiler",
            });
        }
        Ok(())
    }

    /// Flags must be distinct, and so must every column key the catalog can
    /// produce: `Name` for hash-free variants, `Name-<hash>` for the others,
    /// including the combined label of batched runs.
    fn check_variant_identities(&self) -> Result<(), ConfigError> {
        let mut flags = HashSet::new();
        let mut keys = HashSet::new();
        for algo in &self.algorithms {
            if !flags.insert(algo.flag.as_str()) {
                return Err(ConfigError::DuplicateVariant {
                    what: "flag",
                    key: algo.flag.clone(),
                });
            }
            let hashes: Vec<Option<HashFunction>> = if algo.is_hash_parameterized() {
                HashFunction::CONCRETE
                    .into_iter()
                    .chain([HashFunction::Combined])
                    .map(Some)
                    .collect()
            } else {
                vec![None]
            };
            for hash in hashes {
                let key = column_key(&algo.name, hash);
                if !keys.insert(key.clone()) {
                    return Err(ConfigError::DuplicateVariant { what: "name", key });
                }
            }
        }
        Ok(())
    }

    /// Check that the executable and both wrapper tools can be found.
    /// Only needed before a real (non-synthetic) dispatch.
    pub fn preflight(&self) -> Result<(), ConfigError> {
        self.validate()?;
        let exe = self.executable.to_string_lossy().into_owned();
        require_tool("executable", &exe)?;
        for (what, cmd) in [
            ("memory profiler", &self.memory_profiler),
            ("cache profiler", &self.cache_profiler),
        ] {
            let program = cmd
                .split_whitespace()
                .next()
                .ok_or(ConfigError::EmptyCommand { what })?;
            require_tool(what, program)?;
        }
        Ok(())
    }
}

fn require_tool(what: &'static str, program: &str) -> Result<(), ConfigError> {
    if find_program(program).is_some() {
        Ok(())
    } else {
        Err(ConfigError::MissingTool {
            what,
            program: program.to_string(),
        })
    }
}

/// Resolve a program the way a shell would: paths as-is, bare names on `PATH`.
pub fn find_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn yaml_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("campaign.yaml");
        fs::write(
            &path,
            "executable: /opt/bin/eval\ndatasets:\n  - /data/small.vtu\n  - /data/big.vtu\niterations: 3\n",
        )
        .unwrap();

        let cfg = CampaignConfig::load(&path).unwrap();
        assert_eq!(cfg.executable, PathBuf::from("/opt/bin/eval"));
        assert_eq!(cfg.datasets.len(), 2);
        assert_eq!(cfg.iterations, 3);
        assert_eq!(cfg.algorithms.len(), 7);
        assert_eq!(cfg.memory_profiler, DEFAULT_MEMORY_PROFILER);
        assert_eq!(cfg.largest_subset_len(), 2);
    }

    #[test]
    fn yaml_algorithm_catalog() {
        let yaml = r#"
datasets: [a.vtu]
algorithms:
  - flag: --x
    name: X
    category: sequential-only
    hashing: hash-free
  - flag: --y
    name: Y
    category: parallel-capable
    hashing: hash-parameterized
"#;
        let cfg: CampaignConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.algorithms.len(), 2);
        assert!(cfg.algorithms[1].is_parallel());
        assert!(cfg.algorithms[1].is_hash_parameterized());
    }

    #[test]
    fn unknown_field_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.yaml");
        fs::write(&path, "datasetz: []\n").unwrap();
        assert!(matches!(
            CampaignConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn duplicate_row_labels_are_rejected() {
        let cfg = CampaignConfig {
            datasets: vec!["/a/mesh.vtu".into(), "/b/mesh.vtu".into()],
            available_parallelism: Some(2),
            ..CampaignConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DuplicateDataset { .. })
        ));
    }

    #[test]
    fn colliding_variants_are_rejected() {
        use AlgorithmCategory::{ParallelCapable, SequentialOnly};
        use Hashing::{HashFree, HashParameterized};
        let with = |algorithms: Vec<AlgorithmVariant>| CampaignConfig {
            datasets: vec!["a.vtu".into()],
            algorithms,
            available_parallelism: Some(2),
            ..CampaignConfig::default()
        };

        let same_name = with(vec![
            AlgorithmVariant::new("--a", "X", SequentialOnly, HashFree),
            AlgorithmVariant::new("--b", "X", SequentialOnly, HashFree),
        ]);
        assert!(matches!(
            same_name.validate(),
            Err(ConfigError::DuplicateVariant { what: "name", .. })
        ));

        let same_flag = with(vec![
            AlgorithmVariant::new("--a", "X", SequentialOnly, HashFree),
            AlgorithmVariant::new("--a", "Y", SequentialOnly, HashFree),
        ]);
        assert!(matches!(
            same_flag.validate(),
            Err(ConfigError::DuplicateVariant { what: "flag", .. })
        ));

        // `P-FNV1A` would share a column with `P` under the FNV1A hash.
        let shadowed = with(vec![
            AlgorithmVariant::new("--p", "P", ParallelCapable, HashParameterized),
            AlgorithmVariant::new("--q", "P-FNV1A", ParallelCapable, HashFree),
        ]);
        match shadowed.validate() {
            Err(ConfigError::DuplicateVariant { what: "name", key }) => assert_eq!(key, "P-FNV1A"),
            other => panic!("unexpected {other:?}"),
        }

        assert!(CampaignConfig {
            datasets: vec!["a.vtu".into()],
            available_parallelism: Some(2),
            ..CampaignConfig::default()
        }
        .validate()
        .is_ok());
    }

    #[test]
    fn oversized_subset_is_rejected() {
        let cfg = CampaignConfig {
            datasets: vec!["a.vtu".into()],
            largest_subset: Some(3),
            available_parallelism: Some(2),
            ..CampaignConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::LargestSubset { subset: 3, datasets: 1 })
        ));
    }

    #[test]
    fn empty_catalog_is_rejected() {
        let cfg = CampaignConfig {
            datasets: vec!["a.vtu".into()],
            algorithms: Vec::new(),
            available_parallelism: Some(2),
            ..CampaignConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::NoAlgorithms)));
    }

    #[test]
    fn missing_executable_fails_preflight() {
        let cfg = CampaignConfig {
            executable: "/definitely/not/here/eval".into(),
            datasets: vec!["a.vtu".into()],
            available_parallelism: Some(2),
            ..CampaignConfig::default()
        };
        assert!(matches!(
            cfg.preflight(),
            Err(ConfigError::MissingTool { what: "executable", .. })
        ));
    }
}
