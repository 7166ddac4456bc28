use clap::{Parser, Subcommand};
use facelist_eval_campaign::config::CampaignConfig;
use facelist_eval_campaign::dispatch::{
    DispatchOptions, Dispatcher, ProcessInvoker, SyntheticInvoker,
};
use facelist_eval_campaign::schema::{AggregationSummary, CampaignManifest, CampaignReport, RunMeta};
use facelist_eval_campaign::space::{ExperimentSpace, MetricCategory, RunDescriptor};
use facelist_eval_campaign::{Aggregator, CampaignError, SentinelMode};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every run descriptor of the campaign, in dispatch order.
    Plan,

    /// Dispatch the campaign and write the manifest.
    Run {
        /// Remove previous artifacts instead of appending to them.
        #[arg(long, default_value_t = false)]
        clean: bool,

        /// Only dispatch these categories. Can be provided multiple times.
        #[arg(long, value_enum, action = clap::ArgAction::Append)]
        only: Vec<MetricCategory>,
    },

    /// Parse existing artifacts and write the metric tables.
    Aggregate,

    /// `run --clean` followed by `aggregate`.
    All,
}

#[derive(Parser, Debug)]
#[command(name = "facelist-eval-campaign")]
#[command(about = "External-facelist benchmark campaign: dispatch, parse, tabulate (JSON output)")]
struct Args {
    /// Campaign configuration (YAML). Defaults apply when omitted.
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Dataset path, smallest first. Replaces the configured list. Can be
    /// provided multiple times.
    #[arg(short = 'i', long, value_name = "PATH", action = clap::ArgAction::Append, global = true)]
    dataset: Vec<PathBuf>,

    #[arg(long, value_name = "DIR", global = true)]
    results_dir: Option<PathBuf>,

    /// Concurrent invocations for unprofiled categories.
    #[arg(long, global = true)]
    jobs: Option<usize>,

    #[arg(long, global = true)]
    timeout_secs: Option<u64>,

    /// Write generated artifacts instead of running the executable.
    #[arg(long, default_value_t = false, global = true)]
    synthetic: bool,

    /// Seed for `--synthetic`.
    #[arg(long, default_value_t = 0, global = true)]
    seed: u64,

    #[arg(long, value_enum, default_value_t = SentinelMode::Explicit, global = true)]
    sentinel: SentinelMode,

    /// Where to write the JSON report. If omitted, prints to stdout.
    #[arg(long, global = true)]
    out: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Output {
    Plan(Vec<RunDescriptor>),
    Report(CampaignReport),
}

fn load_config(args: &Args) -> Result<CampaignConfig, CampaignError> {
    let mut config = match &args.config {
        Some(path) => CampaignConfig::load(path)?,
        None => CampaignConfig::default(),
    };
    if !args.dataset.is_empty() {
        config.datasets = args.dataset.clone();
    }
    if let Some(dir) = &args.results_dir {
        config.results_dir = dir.clone();
    }
    if let Some(jobs) = args.jobs {
        config.jobs = jobs;
    }
    if args.timeout_secs.is_some() {
        config.timeout_secs = args.timeout_secs;
    }
    Ok(config)
}

fn dispatch_phase(
    args: &Args,
    config: &CampaignConfig,
    space: &ExperimentSpace,
    opts: &DispatchOptions,
) -> Result<CampaignManifest, CampaignError> {
    let meta = RunMeta::capture(args.synthetic);
    let manifest = if args.synthetic {
        Dispatcher::new(config, SyntheticInvoker::new(args.seed)).run_campaign(space, opts, meta)?
    } else {
        config.preflight()?;
        let timeout = config.timeout_secs.map(Duration::from_secs);
        Dispatcher::new(config, ProcessInvoker::new(timeout)).run_campaign(space, opts, meta)?
    };
    info!(
        records = manifest.records.len(),
        failed = manifest.failures(),
        "run phase finished"
    );
    Ok(manifest)
}

fn aggregate_phase(
    args: &Args,
    config: &CampaignConfig,
    space: &ExperimentSpace,
) -> Result<(usize, AggregationSummary), CampaignError> {
    let manifest = CampaignManifest::load(&config.results_dir)?;
    let mut aggregator = Aggregator::new(config, space, args.sentinel);
    if let Some(m) = &manifest {
        aggregator = aggregator.with_manifest(m);
    }
    let summary = aggregator.run()?;
    let failed = manifest.map(|m| m.failures()).unwrap_or(0);
    Ok((failed, summary))
}

fn execute(args: &Args) -> Result<Output, CampaignError> {
    let config = load_config(args)?;
    let space = ExperimentSpace::new(&config)?;

    let report = match &args.cmd {
        Command::Plan => return Ok(Output::Plan(space.enumerate())),
        Command::Run { clean, only } => {
            let opts = DispatchOptions {
                clean: *clean,
                categories: only.clone(),
            };
            let manifest = dispatch_phase(args, &config, &space, &opts)?;
            CampaignReport {
                dispatched: manifest.records.len(),
                failed: manifest.failures(),
                run: manifest.run,
                aggregation: None,
            }
        }
        Command::Aggregate => {
            let (failed, summary) = aggregate_phase(args, &config, &space)?;
            CampaignReport {
                run: RunMeta::capture(args.synthetic),
                dispatched: 0,
                failed,
                aggregation: Some(summary),
            }
        }
        Command::All => {
            let opts = DispatchOptions {
                clean: true,
                categories: Vec::new(),
            };
            let manifest = dispatch_phase(args, &config, &space, &opts)?;
            let (failed, summary) = aggregate_phase(args, &config, &space)?;
            CampaignReport {
                dispatched: manifest.records.len(),
                failed,
                run: manifest.run,
                aggregation: Some(summary),
            }
        }
    };
    Ok(Output::Report(report))
}

fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let output = execute(&args).map_err(io::Error::other)?;

    let json = serde_json::to_string_pretty(&output).map_err(io::Error::other)?;
    if let Some(out) = &args.out {
        fs::write(out, json)?;
    } else {
        println!("{json}");
    }

    Ok(())
}
