//! Command dispatch: one external invocation per run descriptor, output
//! captured into the descriptor's artifact.
//!
//! Dispatch is best effort. A failed or timed-out run is recorded and logged,
//! and the campaign moves on; only an artifact that cannot be opened stops it.

use crate::config::CampaignConfig;
use crate::error::DispatchError;
use crate::schema::{CampaignManifest, DispatchRecord, RunMeta, RunOutcome};
use crate::space::{
    AccessPattern, Backend, ExperimentSpace, HashFunction, MeasurementMode, MetricCategory,
    RunDescriptor,
};
use rand::Rng;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
#[cfg(unix)]
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A fully resolved command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn for_run(config: &CampaignConfig, run: &RunDescriptor) -> Self {
        let wrapper = match run.mode {
            MeasurementMode::Timing => "",
            MeasurementMode::MemoryProfiled => config.memory_profiler.as_str(),
            MeasurementMode::CacheCounterProfiled => config.cache_profiler.as_str(),
        };
        let mut words: Vec<String> = wrapper.split_whitespace().map(str::to_string).collect();
        words.push(config.executable.to_string_lossy().into_owned());

        words.push("-i".into());
        words.push(run.dataset.path.to_string_lossy().into_owned());
        words.push("-d".into());
        words.push(match run.backend {
            Backend::CpuParallel => config.cpu_backend.clone(),
            Backend::Gpu => config.gpu_backend.clone(),
        });
        if let Some(t) = run.threads {
            words.push("-t".into());
            words.push(t.to_string());
        }
        words.extend(run.variants.iter().map(|v| v.flag.clone()));
        if let Some(h) = run.hash {
            words.push("-f".into());
            words.push(h.selector().to_string());
        }
        if run.category == MetricCategory::HashDistribution {
            words.push("--hash-distribution".into());
        }
        if let Some(n) = run.iterations {
            words.push("-n".into());
            words.push(n.to_string());
        }
        if run.access == AccessPattern::Random {
            words.push("-r".into());
        }

        let program = words.remove(0);
        Self {
            program,
            args: words,
        }
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Something that can execute an invocation and leave its output in an
/// artifact. Output is always appended.
pub trait Invoke: Sync {
    fn invoke(
        &self,
        invocation: &Invocation,
        run: &RunDescriptor,
        artifact: &Path,
    ) -> Result<RunOutcome, DispatchError>;
}

fn open_append(artifact: &Path) -> Result<File, DispatchError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(artifact)
        .map_err(|source| DispatchError::Artifact {
            path: artifact.to_path_buf(),
            source,
        })
}

/// Spawns the real process. Standard output and standard error both go to
/// the artifact.
#[derive(Clone, Debug, Default)]
pub struct ProcessInvoker {
    pub timeout: Option<Duration>,
}

impl ProcessInvoker {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

/// The child leads its own process group, so this also reaches whatever a
/// profiler wrapper forked.
#[cfg(unix)]
fn kill_group(child: &Child) {
    let pgid = child.id() as libc::pid_t;
    // SAFETY: plain syscall on a group id we created; no memory is shared.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } != 0 {
        debug!(pgid, error = %io::Error::last_os_error(), "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

/// `Ok(None)` when the deadline passed and the child was killed.
fn wait_with_timeout(child: &mut Child, limit: Duration) -> io::Result<Option<ExitStatus>> {
    let start = Instant::now();
    let mut poll = Duration::from_millis(5);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() >= limit {
            kill_group(child);
            child.kill()?;
            child.wait()?;
            return Ok(None);
        }
        std::thread::sleep(poll);
        poll = (poll * 2).min(Duration::from_millis(100));
    }
}

impl Invoke for ProcessInvoker {
    fn invoke(
        &self,
        invocation: &Invocation,
        _run: &RunDescriptor,
        artifact: &Path,
    ) -> Result<RunOutcome, DispatchError> {
        let stdout = open_append(artifact)?;
        let stderr = stdout
            .try_clone()
            .map_err(|source| DispatchError::Artifact {
                path: artifact.to_path_buf(),
                source,
            })?;

        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));
        #[cfg(unix)]
        cmd.process_group(0);
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return Ok(RunOutcome::SpawnError {
                    message: e.to_string(),
                })
            }
        };

        let waited = match self.timeout {
            Some(limit) => wait_with_timeout(&mut child, limit),
            None => child.wait().map(Some),
        };
        Ok(match waited {
            Ok(Some(status)) if status.success() => RunOutcome::Succeeded,
            Ok(Some(status)) => RunOutcome::Failed {
                code: status.code(),
            },
            Ok(None) => RunOutcome::TimedOut {
                after_secs: self.timeout.unwrap_or_default().as_secs_f64(),
            },
            Err(e) => RunOutcome::SpawnError {
                message: e.to_string(),
            },
        })
    }
}

/// Writes plausible, well-formed artifacts instead of running anything.
/// Values are a pure function of the seed and the artifact name.
#[derive(Clone, Debug, Default)]
pub struct SyntheticInvoker {
    pub seed: u64,
}

impl SyntheticInvoker {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn rng_for(&self, artifact: &Path) -> ChaCha8Rng {
        let name = artifact
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let digest = Sha256::digest(name.as_bytes());
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        let index = u64::from_le_bytes(first);
        ChaCha8Rng::seed_from_u64(
            self.seed
                .wrapping_add(index)
                .wrapping_mul(0x517cc1b727220a95),
        )
    }

    /// Artifact content for `run`, including the banners a real run prints.
    pub fn render(&self, invocation: &Invocation, run: &RunDescriptor, artifact: &Path) -> String {
        let mut rng = self.rng_for(artifact);
        let cmd = invocation.command_line();
        let mut out = String::new();
        match run.category {
            MetricCategory::MemoryFootprint => {
                let dataset_kb: u64 = rng.gen_range(200_000..2_000_000);
                let algo_kb: u64 = rng.gen_range(50_000..1_500_000);
                let _ = writeln!(out, "Number of input cells: {}", rng.gen_range(10_000..5_000_000u64));
                let _ = writeln!(out, "dataset-memory-used: {dataset_kb}");
                let _ = writeln!(out, "\tCommand being timed: \"{cmd}\"");
                let _ = writeln!(out, "\tUser time (seconds): {:.2}", rng.gen_range(0.1..20.0f64));
                let _ = writeln!(out, "\tMaximum resident set size (kbytes): {}", dataset_kb + algo_kb);
                let _ = writeln!(out, "\tExit status: 0");
            }
            MetricCategory::CacheMisses => {
                let baseline = rng.gen_range(1_000_000..50_000_000u64);
                let misses = if run.is_baseline() {
                    baseline
                } else {
                    baseline + rng.gen_range(100_000..20_000_000u64)
                };
                let _ = writeln!(out, "Number of input cells: {}", rng.gen_range(10_000..5_000_000u64));
                let _ = writeln!(out);
                let _ = writeln!(out, " Performance counter stats for '{cmd}':");
                let _ = writeln!(out);
                let _ = writeln!(out, "{:>18}      cache-misses", group_thousands(misses));
                let _ = writeln!(out);
                let _ = writeln!(out, "{:>18.9} seconds time elapsed", rng.gen_range(0.5..30.0f64));
            }
            MetricCategory::HashDistribution => {
                let _ = writeln!(out, "- experiments:");
                let _ = writeln!(out, "    face-hash-distribution:");
                let mut count = rng.gen_range(100_000..1_000_000u64);
                for bucket in 1..=6 {
                    let _ = writeln!(out, "      {bucket}: {count}");
                    count /= rng.gen_range(3..12u64);
                }
            }
            MetricCategory::CpuTime | MetricCategory::ParallelEfficiency | MetricCategory::GpuTime => {
                let threads = run.threads.unwrap_or(1) as f64;
                let trials = run.iterations.unwrap_or(1);
                let _ = writeln!(out, "Number of input cells: {}", rng.gen_range(10_000..5_000_000u64));
                let _ = writeln!(out, "- experiments:");
                for variant in &run.variants {
                    let hash = match (variant.is_hash_parameterized(), run.hash) {
                        (false, _) => "None".to_string(),
                        (true, Some(h)) => h.label().to_string(),
                        (true, None) => HashFunction::Combined.label().to_string(),
                    };
                    let scale = if variant.is_parallel() { threads.powf(0.8) } else { 1.0 };
                    let base = rng.gen_range(0.5..8.0f64) / scale;
                    let _ = writeln!(out, "    - algorithm-name: {}", variant.name);
                    let _ = writeln!(out, "      hash-name: {hash}");
                    let _ = writeln!(out, "      trials:");
                    for _ in 0..trials {
                        let _ = writeln!(
                            out,
                            "        - seconds-total: {:.6}",
                            base * rng.gen_range(0.95..1.05f64)
                        );
                    }
                }
            }
        }
        out
    }
}

fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

impl Invoke for SyntheticInvoker {
    fn invoke(
        &self,
        invocation: &Invocation,
        run: &RunDescriptor,
        artifact: &Path,
    ) -> Result<RunOutcome, DispatchError> {
        let mut file = open_append(artifact)?;
        file.write_all(self.render(invocation, run, artifact).as_bytes())
            .map_err(|source| DispatchError::Artifact {
                path: artifact.to_path_buf(),
                source,
            })?;
        Ok(RunOutcome::Succeeded)
    }
}

/// Hex SHA-256 of a file.
pub fn artifact_digest(path: &Path) -> io::Result<String> {
    let bytes = fs::read(path)?;
    let digest = Sha256::digest(&bytes);
    let mut s = String::with_capacity(64);
    for b in digest {
        let _ = write!(s, "{b:02x}");
    }
    Ok(s)
}

#[derive(Clone, Debug, Default)]
pub struct DispatchOptions {
    /// Remove the previous artifacts and manifest records of the dispatched
    /// categories instead of appending to them.
    pub clean: bool,
    /// Restrict the pass to these categories; empty means all.
    pub categories: Vec<MetricCategory>,
}

pub struct Dispatcher<'a, I: Invoke> {
    config: &'a CampaignConfig,
    invoker: I,
}

impl<'a, I: Invoke> Dispatcher<'a, I> {
    pub fn new(config: &'a CampaignConfig, invoker: I) -> Self {
        Self { config, invoker }
    }

    /// Dispatch one descriptor. Fails only when the artifact cannot be written.
    pub fn dispatch(&self, run: &RunDescriptor) -> Result<DispatchRecord, DispatchError> {
        let artifact = run.artifact_path(&self.config.results_dir);
        let invocation = Invocation::for_run(self.config, run);
        let command = invocation.command_line();
        debug!(%command, artifact = %artifact.display(), "dispatch");

        let start = Instant::now();
        let outcome = self.invoker.invoke(&invocation, run, &artifact)?;
        let elapsed_secs = start.elapsed().as_secs_f64();

        if !outcome.is_success() {
            warn!(artifact = %artifact.display(), ?outcome, "run did not succeed; its cells will be invalid");
        }
        let sha256 = match artifact_digest(&artifact) {
            Ok(d) => Some(d),
            Err(e) => {
                warn!(artifact = %artifact.display(), error = %e, "artifact unreadable after run");
                None
            }
        };

        Ok(DispatchRecord {
            run: run.clone(),
            artifact,
            command,
            outcome,
            elapsed_secs,
            sha256,
        })
    }

    /// Create the category directory. With `clean`, the whole directory goes
    /// only when every category stored there is part of this pass; otherwise
    /// just the artifacts of `runs` are removed.
    fn prepare_dir(
        &self,
        category: MetricCategory,
        runs: &[RunDescriptor],
        clean: bool,
        selected: &[MetricCategory],
        prepared: &mut HashSet<PathBuf>,
    ) -> Result<(), DispatchError> {
        let dir = category.dir(&self.config.results_dir);
        let first = prepared.insert(dir.clone());
        let io_err = |path: &Path, source| DispatchError::Artifact {
            path: path.to_path_buf(),
            source,
        };
        if clean {
            let shared = MetricCategory::ALL
                .iter()
                .any(|c| c.dir_name() == category.dir_name() && !selected.contains(c));
            if shared {
                info!(category = category.as_str(), dir = %dir.display(), "clearing previous artifacts of category");
                for run in runs {
                    let path = run.artifact_path(&self.config.results_dir);
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(source) => return Err(io_err(&path, source)),
                    }
                }
            } else if first && dir.exists() {
                info!(dir = %dir.display(), "clearing previous artifacts");
                fs::remove_dir_all(&dir).map_err(|source| io_err(&dir, source))?;
            }
        }
        fs::create_dir_all(&dir).map_err(|source| io_err(&dir, source))
    }

    /// Run every descriptor of the campaign, category by category, and persist
    /// the manifest. Profiled categories always run one invocation at a time;
    /// the others use up to `jobs` concurrent invocations.
    pub fn run_campaign(
        &self,
        space: &ExperimentSpace,
        opts: &DispatchOptions,
        meta: RunMeta,
    ) -> Result<CampaignManifest, DispatchError> {
        let results_dir = &self.config.results_dir;
        fs::create_dir_all(results_dir).map_err(|source| DispatchError::Artifact {
            path: results_dir.clone(),
            source,
        })?;

        let selected: Vec<MetricCategory> = MetricCategory::ALL
            .into_iter()
            .filter(|c| opts.categories.is_empty() || opts.categories.contains(c))
            .collect();

        let mut records = match CampaignManifest::load(results_dir) {
            Ok(prev) => prev.map(|m| m.records).unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "previous manifest unreadable, starting a new one");
                Vec::new()
            }
        };
        if opts.clean {
            // Records of categories outside this pass still describe files on disk.
            records.retain(|r| !selected.contains(&r.run.category));
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.jobs.max(1))
            .build()?;
        let mut prepared = HashSet::new();

        for &category in &selected {
            let runs = space.for_category(category);
            if runs.is_empty() {
                continue;
            }
            self.prepare_dir(category, &runs, opts.clean, &selected, &mut prepared)?;
            info!(category = category.as_str(), runs = runs.len(), "dispatching");

            let batch: Vec<DispatchRecord> =
                if category.mode().is_profiled() || self.config.jobs <= 1 {
                    runs.iter()
                        .map(|r| self.dispatch(r))
                        .collect::<Result<Vec<_>, DispatchError>>()?
                } else {
                    pool.install(|| {
                        runs.par_iter()
                            .map(|r| self.dispatch(r))
                            .collect::<Result<Vec<_>, DispatchError>>()
                    })?
                };

            let failed = batch.iter().filter(|r| !r.outcome.is_success()).count();
            if failed > 0 {
                warn!(category = category.as_str(), failed, "runs did not succeed");
            }
            records.extend(batch);
        }

        let manifest = CampaignManifest { run: meta, records };
        manifest.save(results_dir)?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;
    use tempfile::tempdir;

    fn config(results: &Path) -> CampaignConfig {
        CampaignConfig {
            executable: PathBuf::from("/opt/eval"),
            results_dir: results.to_path_buf(),
            datasets: vec!["/data/small.vtu".into(), "/data/big.vtu".into()],
            available_parallelism: Some(4),
            ..CampaignConfig::default()
        }
    }

    fn find(space: &ExperimentSpace, category: MetricCategory, name: &str) -> RunDescriptor {
        space
            .for_category(category)
            .into_iter()
            .find(|r| r.artifact_name() == name)
            .unwrap()
    }

    #[test]
    fn memory_invocation_is_wrapped() {
        let cfg = config(Path::new("/r"));
        let space = ExperimentSpace::new(&cfg).unwrap();
        let run = find(&space, MetricCategory::MemoryFootprint, "small.vtu_P-Hash-Count-MinPointID.txt");
        let inv = Invocation::for_run(&cfg, &run);
        assert_eq!(
            inv.command_line(),
            "time -v /opt/eval -i /data/small.vtu -d TBB -t 1 --p-hash-count -f 2 -n 0"
        );
    }

    #[test]
    fn timing_invocations() {
        let cfg = config(Path::new("/r"));
        let space = ExperimentSpace::new(&cfg).unwrap();

        let random = find(&space, MetricCategory::CpuTime, "big.vtu_4_threads_random.yaml");
        assert_eq!(
            Invocation::for_run(&cfg, &random).command_line(),
            "/opt/eval -i /data/big.vtu -d TBB -t 4 --p-classifier --p-hash --p-hash-sort \
             --p-hash-fight --p-hash-count -n 10 -r"
        );

        let baseline = find(&space, MetricCategory::CacheMisses, "big.vtu_cache_misses.txt");
        assert_eq!(
            Invocation::for_run(&cfg, &baseline).command_line(),
            "perf stat -e cache-misses /opt/eval -i /data/big.vtu -d TBB -n 0"
        );

        let dist = find(&space, MetricCategory::HashDistribution, "small.vtu_hash_distribution.yaml");
        assert_eq!(
            Invocation::for_run(&cfg, &dist).command_line(),
            "/opt/eval -i /data/small.vtu -d TBB -t 1 --hash-distribution"
        );

        let gpu = find(&space, MetricCategory::GpuTime, "small.vtu_normal.yaml");
        assert_eq!(
            Invocation::for_run(&cfg, &gpu).command_line(),
            "/opt/eval -i /data/small.vtu -d KOKKOS --p-hash-sort --p-hash-fight --p-hash-count -n 10"
        );
    }

    #[test]
    fn thousands_grouping() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(12_345), "12,345");
        assert_eq!(group_thousands(1_234_567), "1,234,567");
    }

    #[test]
    fn synthetic_artifacts_parse() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let space = ExperimentSpace::new(&cfg).unwrap();
        let invoker = SyntheticInvoker::new(7);
        for run in space.enumerate() {
            let path = run.artifact_path(dir.path());
            let text = invoker.render(&Invocation::for_run(&cfg, &run), &run, &path);
            match run.category {
                MetricCategory::MemoryFootprint => {
                    let m = parse::parse_memory_report(&text).unwrap();
                    assert!(m.max_rss_kb > m.dataset_kb);
                }
                MetricCategory::CacheMisses => {
                    parse::parse_cache_misses(&text).unwrap();
                }
                MetricCategory::HashDistribution => {
                    assert_eq!(parse::parse_hash_distribution(&text).unwrap().len(), 6);
                }
                _ => {
                    let report = parse::parse_run_report(&text).unwrap();
                    assert_eq!(report.timings.len(), run.variants.len());
                }
            }
        }
    }

    #[test]
    fn synthetic_is_deterministic() {
        let cfg = config(Path::new("/r"));
        let space = ExperimentSpace::new(&cfg).unwrap();
        let run = &space.enumerate()[0];
        let inv = Invocation::for_run(&cfg, run);
        let path = run.artifact_path(Path::new("/r"));
        let a = SyntheticInvoker::new(1).render(&inv, run, &path);
        let b = SyntheticInvoker::new(1).render(&inv, run, &path);
        let c = SyntheticInvoker::new(2).render(&inv, run, &path);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn process_output_is_appended() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("echo.txt");
        let cfg = config(dir.path());
        let space = ExperimentSpace::new(&cfg).unwrap();
        let run = space.enumerate().remove(0);
        let inv = Invocation {
            program: "sh".into(),
            args: vec!["-c".into(), "echo out; echo err 1>&2".into()],
        };
        let invoker = ProcessInvoker::default();
        assert_eq!(invoker.invoke(&inv, &run, &artifact).unwrap(), RunOutcome::Succeeded);
        assert_eq!(invoker.invoke(&inv, &run, &artifact).unwrap(), RunOutcome::Succeeded);
        let text = fs::read_to_string(&artifact).unwrap();
        assert_eq!(text.matches("out").count(), 2);
        assert_eq!(text.matches("err").count(), 2);
    }

    #[test]
    fn process_failures_are_reported_not_fatal() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("fail.txt");
        let cfg = config(dir.path());
        let run = ExperimentSpace::new(&cfg).unwrap().enumerate().remove(0);

        let exit = Invocation {
            program: "sh".into(),
            args: vec!["-c".into(), "exit 3".into()],
        };
        assert_eq!(
            ProcessInvoker::default().invoke(&exit, &run, &artifact).unwrap(),
            RunOutcome::Failed { code: Some(3) }
        );

        let missing = Invocation {
            program: "/definitely/not/here".into(),
            args: Vec::new(),
        };
        assert!(matches!(
            ProcessInvoker::default().invoke(&missing, &run, &artifact).unwrap(),
            RunOutcome::SpawnError { .. }
        ));

        let slow = Invocation {
            program: "sleep".into(),
            args: vec!["5".into()],
        };
        let invoker = ProcessInvoker::new(Some(Duration::from_millis(100)));
        assert!(matches!(
            invoker.invoke(&slow, &run, &artifact).unwrap(),
            RunOutcome::TimedOut { .. }
        ));
    }

    #[test]
    fn timeout_kills_forked_children() {
        let dir = tempdir().unwrap();
        let artifact = dir.path().join("wrapped.txt");
        let cfg = config(dir.path());
        let run = ExperimentSpace::new(&cfg).unwrap().enumerate().remove(0);

        // A wrapper that forks the real work and waits on it, like a profiler.
        let wrapper = Invocation {
            program: "sh".into(),
            args: vec!["-c".into(), "(sleep 1; echo LATE-WRITE) & sleep 5".into()],
        };
        let invoker = ProcessInvoker::new(Some(Duration::from_millis(200)));
        assert!(matches!(
            invoker.invoke(&wrapper, &run, &artifact).unwrap(),
            RunOutcome::TimedOut { .. }
        ));

        std::thread::sleep(Duration::from_millis(1500));
        let text = fs::read_to_string(&artifact).unwrap_or_default();
        assert!(!text.contains("LATE-WRITE"), "{text}");
    }

    #[test]
    fn campaign_writes_every_artifact_and_manifest() {
        let dir = tempdir().unwrap();
        let cfg = CampaignConfig {
            jobs: 3,
            ..config(dir.path())
        };
        let space = ExperimentSpace::new(&cfg).unwrap();
        let dispatcher = Dispatcher::new(&cfg, SyntheticInvoker::new(0));
        let manifest = dispatcher
            .run_campaign(&space, &DispatchOptions::default(), RunMeta::capture(true))
            .unwrap();

        let runs = space.enumerate();
        assert_eq!(manifest.records.len(), runs.len());
        for (rec, run) in manifest.records.iter().zip(&runs) {
            assert_eq!(&rec.run, run);
            assert!(rec.artifact.is_file());
            assert_eq!(rec.sha256.as_deref(), Some(artifact_digest(&rec.artifact).unwrap().as_str()));
        }
        let loaded = CampaignManifest::load(dir.path()).unwrap().unwrap();
        assert_eq!(loaded.records.len(), runs.len());
        assert_eq!(loaded.failures(), 0);
    }

    #[test]
    fn second_pass_appends_unless_cleaned() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let space = ExperimentSpace::new(&cfg).unwrap();
        let dispatcher = Dispatcher::new(&cfg, SyntheticInvoker::new(0));
        let only_cpu = DispatchOptions {
            clean: false,
            categories: vec![MetricCategory::CpuTime],
        };
        dispatcher.run_campaign(&space, &only_cpu, RunMeta::capture(true)).unwrap();
        let artifact = dir.path().join("cpu_time").join("small.vtu_1_threads_normal.yaml");
        let once = fs::read_to_string(&artifact).unwrap();

        let manifest = dispatcher.run_campaign(&space, &only_cpu, RunMeta::capture(true)).unwrap();
        assert_eq!(fs::read_to_string(&artifact).unwrap(), once.repeat(2));
        assert_eq!(manifest.records.len(), 2 * space.for_category(MetricCategory::CpuTime).len());

        let cleaned = DispatchOptions { clean: true, ..only_cpu };
        dispatcher.run_campaign(&space, &cleaned, RunMeta::capture(true)).unwrap();
        assert_eq!(fs::read_to_string(&artifact).unwrap(), once);
    }

    #[test]
    fn clean_pass_leaves_other_categories_alone() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        let space = ExperimentSpace::new(&cfg).unwrap();
        let dispatcher = Dispatcher::new(&cfg, SyntheticInvoker::new(0));
        let full = dispatcher
            .run_campaign(&space, &DispatchOptions::default(), RunMeta::capture(true))
            .unwrap();

        let cache_runs = space.for_category(MetricCategory::CacheMisses);
        let dist_runs = space.for_category(MetricCategory::HashDistribution);
        assert!(!cache_runs.is_empty() && !dist_runs.is_empty());
        let cache = cache_runs[0].artifact_path(dir.path());
        let dist = dist_runs[0].artifact_path(dir.path());
        assert_eq!(cache.parent(), dist.parent());
        let cache_once = fs::read_to_string(&cache).unwrap();
        let dist_once = fs::read_to_string(&dist).unwrap();

        let only_cache = DispatchOptions {
            clean: true,
            categories: vec![MetricCategory::CacheMisses],
        };
        let manifest = dispatcher.run_campaign(&space, &only_cache, RunMeta::capture(true)).unwrap();

        assert_eq!(fs::read_to_string(&cache).unwrap(), cache_once);
        assert_eq!(fs::read_to_string(&dist).unwrap(), dist_once);
        assert_eq!(manifest.records.len(), full.records.len());
        let cached = manifest
            .records
            .iter()
            .filter(|r| r.run.category == MetricCategory::CacheMisses)
            .count();
        assert_eq!(cached, cache_runs.len());
        assert!(manifest
            .records
            .iter()
            .any(|r| r.run.category == MetricCategory::HashDistribution));
        for rec in &manifest.records {
            assert!(rec.artifact.is_file(), "{}", rec.artifact.display());
        }
    }
}
