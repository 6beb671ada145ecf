pub mod allocator;
pub mod config;
pub mod error;
pub mod fleet;
pub mod instrumentation;
pub mod interrupt;
pub mod logging;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod model;
pub mod node;
pub mod results;
pub mod retry;
pub mod session;
pub mod stats;
pub mod transport;
pub mod trial;

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use tracing::{info, warn};

pub use allocator::{Allocation, Allocator, CommandAllocator, StaticAllocator};
pub use config::{load_config, ExperimentConfig};
pub use error::OrchestratorError;
pub use interrupt::Interrupt;
pub use model::{CommandExecution, CommandList, CompletionStatus, OrderType, Trial};
pub use stats::{ExternalStats, OrderEffectSummary, StatisticsSink};
pub use transport::{OpenSshTransport, Transport};

use fleet::Fleet;
use results::{ManifestGuard, ResultsDir, RunDetails, EXP_RESULTS, RUN_RESULTS};

pub struct RunResult {
    pub results_dir: PathBuf,
    pub run_id: String,
    pub details: RunDetails,
}

#[derive(Debug, Clone)]
pub struct ExperimentSummary {
    pub workers: Vec<String>,
    pub repo: String,
    pub working_directory: String,
    pub n_runs: u32,
    pub trials_per_worker: u32,
    pub interleave: bool,
    pub seed: Option<u64>,
    pub reset_enabled: bool,
    pub instrumentation: Vec<String>,
    pub results_root: PathBuf,
    pub stats_command: Option<Vec<String>>,
    pub config_digest: String,
}

/// Loads and validates `path` without contacting any host.
///
/// Workers may be left to an allocator, so an empty `workers` list passes here.
pub fn describe_experiment(path: &Path) -> Result<ExperimentSummary> {
    let config = load_config(path)?;
    config.validate(true)?;
    let trials_per_worker = config
        .total_loops()
        .ok_or_else(|| anyhow!("trials.n_runs is too large"))?;
    Ok(ExperimentSummary {
        workers: config.workers.clone(),
        repo: config.repo.clone(),
        working_directory: config.working_directory(),
        n_runs: config.trials.n_runs,
        trials_per_worker,
        interleave: config.trials.interleave,
        seed: config.trials.seed,
        reset_enabled: config.reset.enabled,
        instrumentation: config.instrumentation.clone(),
        results_root: config.results_root.clone(),
        stats_command: config.stats_command.clone(),
        config_digest: config.digest(),
    })
}

/// The built-in summary, plus the configured external program if any.
pub fn default_sinks(config: &ExperimentConfig, interrupt: &Interrupt) -> Vec<Box<dyn StatisticsSink>> {
    let mut sinks: Vec<Box<dyn StatisticsSink>> = vec![Box::new(OrderEffectSummary)];
    if let Some(argv) = &config.stats_command {
        sinks.push(Box::new(ExternalStats::new(
            argv.clone(),
            config.local_policy(),
            interrupt,
        )));
    }
    sinks
}

/// Runs a full experiment: allocate, initialize, run trials, aggregate.
///
/// The results directory is created before any worker is touched and the
/// allocation is always released, also when the run fails.
pub fn run_experiment(
    config: &ExperimentConfig,
    allocator: &dyn Allocator,
    transport: &dyn Transport,
    sinks: &[Box<dyn StatisticsSink>],
    interrupt: &Interrupt,
) -> Result<RunResult> {
    config.validate(allocator.supplies_workers())?;
    let dir = ResultsDir::create(&config.results_root)?;
    let mut manifest = ManifestGuard::new(&dir, &config.digest())?;

    let mut allocation = allocator.allocate(config, transport, interrupt)?;
    let outcome = execute(config, &mut allocation, transport, sinks, interrupt, &dir);
    if let Err(e) = allocator.deallocate(&allocation, config, transport, &Interrupt::new()) {
        warn!("deallocation failed: {}", e);
    }

    let details = match outcome {
        Ok(details) => details,
        Err(e) => {
            let interrupted = e
                .downcast_ref::<OrchestratorError>()
                .is_some_and(OrchestratorError::is_interrupt);
            if interrupted {
                manifest.complete("interrupted", &RunDetails::default())?;
            }
            return Err(e);
        }
    };
    manifest.complete("completed", &details)?;
    info!(
        "Run {} complete: {} trial(s), {} command execution(s) in {}",
        manifest.run_id(),
        details.trials,
        details.executions,
        dir.path().display()
    );
    Ok(RunResult {
        results_dir: dir.path().to_path_buf(),
        run_id: manifest.run_id().to_string(),
        details,
    })
}

fn execute(
    config: &ExperimentConfig,
    allocation: &mut Allocation,
    transport: &dyn Transport,
    sinks: &[Box<dyn StatisticsSink>],
    interrupt: &Interrupt,
    dir: &ResultsDir,
) -> Result<RunDetails> {
    let fleet = Fleet::new(config, transport, dir.path(), interrupt);
    let coordinated = fleet.coordinate(allocation)?;
    let outcomes = fleet.run_all(allocation, &coordinated.commands)?;

    let mut details = RunDetails {
        hosts: allocation.hostnames().to_vec(),
        ..RunDetails::default()
    };
    for failure in &coordinated.excluded {
        details
            .excluded
            .insert(failure.host.clone(), failure.error.to_string());
    }

    let mut executions = Vec::new();
    let mut trials = Vec::new();
    for outcome in outcomes {
        let host = outcome.host;
        let mut worker = match outcome.result {
            Ok(worker) => worker,
            Err(e) => {
                details.failed_workers.insert(host, e.to_string());
                continue;
            }
        };
        if let Some(lines) = worker
            .collected
            .as_ref()
            .and_then(|c| c.result_lines.as_ref())
        {
            results::attach_results(&mut worker.run.executions, lines);
        }
        results::write_executions(&dir.worker_file(&host, EXP_RESULTS), &worker.run.executions)?;
        results::write_trials(&dir.worker_file(&host, RUN_RESULTS), &worker.run.trials)?;
        details.seeds.insert(host.clone(), worker.run.seed);
        if let Some(reason) = worker.run.stopped_early {
            details.stopped_early.insert(host, reason);
        }
        executions.extend(worker.run.executions);
        trials.extend(worker.run.trials);
    }

    let merged = dir.merged_file(EXP_RESULTS);
    results::write_executions(&merged, &executions)?;
    results::write_trials(&dir.merged_file(RUN_RESULTS), &trials)?;
    results::merge_env_files(dir, allocation.hostnames(), &config.env_output)?;

    for sink in sinks {
        if let Err(e) = sink.consume(&merged, &executions, dir) {
            warn!("{} failed: {:#}", sink.name(), e);
        }
    }
    details.trials = trials.len();
    details.executions = executions.len();
    Ok(details)
}

/// Re-runs the built-in summary over an existing results directory.
pub fn summarize_results_dir(path: &Path) -> Result<PathBuf> {
    let dir = ResultsDir::open(path)?;
    let merged = dir.merged_file(EXP_RESULTS);
    if !merged.exists() {
        return Err(anyhow!("no merged table at {}", merged.display()));
    }
    let executions = results::read_executions(&merged)?;
    OrderEffectSummary.consume(&merged, &executions, &dir)?;
    Ok(dir.summary_file(stats::CI_SUMMARY))
}
