use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use orderbench_runner::{
    default_sinks, describe_experiment, load_config, run_experiment, summarize_results_dir,
    Allocator, CommandAllocator, ExperimentSummary, Interrupt, OpenSshTransport,
    OrchestratorError, RunResult, StaticAllocator,
};

const INTERRUPTED_EXIT: i32 = 130;

#[derive(Parser)]
#[command(
    name = "orderbench",
    version = "0.3.0",
    about = "Benchmark execution-order experiments across remote workers"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision workers, run fixed/random trials and aggregate the results.
    Run {
        #[arg(long, default_value = "orderbench.yaml")]
        config: PathBuf,
        /// Allocate workers through the allocation portal instead of the static list.
        #[arg(long)]
        cloudlab: bool,
        #[arg(long, default_value = "cloudlab.yaml")]
        cloudlab_config: PathBuf,
        #[arg(long)]
        verbose: bool,
        #[arg(long)]
        json: bool,
    },
    /// Print the resolved experiment plan without touching any worker.
    Describe {
        #[arg(long, default_value = "orderbench.yaml")]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Recompute the order-effect summary for an existing results directory.
    Stats {
        #[arg(long)]
        dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            let interrupted = err
                .downcast_ref::<OrchestratorError>()
                .is_some_and(OrchestratorError::is_interrupt);
            if json_mode {
                let code = if interrupted { "interrupted" } else { "command_failed" };
                emit_json(&json_error(code, format!("{:#}", err), json!({})));
            }
            if interrupted {
                eprintln!("interrupted");
                std::process::exit(INTERRUPTED_EXIT);
            }
            if json_mode {
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            config,
            cloudlab,
            cloudlab_config,
            verbose,
            json,
        } => {
            let experiment = load_config(&config)
                .with_context(|| format!("load {}", config.display()))?;
            init_logging(verbose || experiment.verbose, Some(&experiment.log_file))?;
            let summary = describe_experiment(&config)?;
            info!(
                "Loaded {} ({} trial(s) per worker, {})",
                config.display(),
                summary.trials_per_worker,
                summary.config_digest
            );

            let allocator: Box<dyn Allocator> = if cloudlab {
                Box::new(CommandAllocator::from_file(&cloudlab_config)?)
            } else {
                Box::new(StaticAllocator)
            };
            let interrupt = Interrupt::new();
            install_interrupt_handler(&interrupt);
            let transport = OpenSshTransport::new();
            let sinks = default_sinks(&experiment, &interrupt);

            let result = run_experiment(
                &experiment,
                allocator.as_ref(),
                &transport,
                &sinks,
                &interrupt,
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "summary": summary_to_json(&summary),
                    "run": run_result_to_json(&result),
                    "cloudlab": cloudlab
                })));
            }
            print_summary(&summary);
            print_run_result(&result);
        }
        Commands::Describe { config, json } => {
            let summary = describe_experiment(&config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_to_json(&summary)
                })));
            }
            print_summary(&summary);
        }
        Commands::Stats { dir, json } => {
            init_logging(false, None)?;
            let written = summarize_results_dir(&dir)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "stats",
                    "summary_path": written.display().to_string()
                })));
            }
            println!("summary: {}", written.display());
        }
    }
    Ok(None)
}

/// Console at INFO (DEBUG when verbose, `RUST_LOG` overrides), plus a
/// DEBUG file log without ANSI colours.
fn init_logging(verbose: bool, log_file: Option<&Path>) -> Result<()> {
    let console_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let console_filter = EnvFilter::builder()
        .with_default_directive(console_level.into())
        .from_env_lossy();
    let console = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_writer(Arc::new(file))
                    .with_ansi(false)
                    .with_filter(LevelFilter::DEBUG),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .context("install tracing subscriber")?;
    Ok(())
}

/// First ^C stops every worker; a second one exits immediately.
fn install_interrupt_handler(interrupt: &Interrupt) {
    let interrupt = interrupt.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        if interrupt.is_triggered() {
            eprintln!("==> second interrupt, exiting");
            std::process::exit(INTERRUPTED_EXIT);
        }
        eprintln!("==> interrupt received, stopping all workers (^C again to force)");
        interrupt.trigger();
    }) {
        eprintln!("==> failed to set ^C handler: {}", e);
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Stats { json, .. } => *json,
    }
}

fn summary_to_json(summary: &ExperimentSummary) -> Value {
    json!({
        "workers": summary.workers,
        "repo": summary.repo,
        "working_directory": summary.working_directory,
        "n_runs": summary.n_runs,
        "trials_per_worker": summary.trials_per_worker,
        "order_policy": order_policy(summary),
        "seed": summary.seed,
        "reset_enabled": summary.reset_enabled,
        "instrumentation": summary.instrumentation,
        "results_root": summary.results_root.display().to_string(),
        "stats_command": summary.stats_command,
        "config_digest": summary.config_digest
    })
}

fn run_result_to_json(result: &RunResult) -> Value {
    json!({
        "run_id": result.run_id,
        "results_dir": result.results_dir.display().to_string(),
        "details": result.details
    })
}

fn order_policy(summary: &ExperimentSummary) -> &'static str {
    if summary.interleave {
        "interleaved"
    } else {
        "blocked"
    }
}

fn print_summary(summary: &ExperimentSummary) {
    if summary.workers.is_empty() {
        println!("workers: (from allocator)");
    } else {
        println!("workers: {}", summary.workers.join(", "));
    }
    println!("repo: {}", summary.repo);
    println!("working_directory: {}", summary.working_directory);
    println!("n_runs: {}", summary.n_runs);
    println!("trials_per_worker: {}", summary.trials_per_worker);
    println!("order_policy: {}", order_policy(summary));
    match summary.seed {
        Some(seed) => println!("seed: {}", seed),
        None => println!("seed: wall clock"),
    }
    println!("reset: {}", if summary.reset_enabled { "enabled" } else { "disabled" });
    if !summary.instrumentation.is_empty() {
        println!("instrumentation: {}", summary.instrumentation.join(", "));
    }
    println!("results_root: {}", summary.results_root.display());
    if let Some(cmd) = &summary.stats_command {
        println!("stats_command: {:?}", cmd);
    }
    println!("config_digest: {}", summary.config_digest);
}

fn print_run_result(result: &RunResult) {
    println!("run_id: {}", result.run_id);
    println!("results_dir: {}", result.results_dir.display());
    println!("hosts: {}", result.details.hosts.join(", "));
    for (host, reason) in &result.details.excluded {
        println!("excluded: {} ({})", host, reason);
    }
    for (host, reason) in &result.details.stopped_early {
        println!("stopped_early: {} ({})", host, reason);
    }
    for (host, reason) in &result.details.failed_workers {
        println!("failed: {} ({})", host, reason);
    }
    println!("trials: {}", result.details.trials);
    println!("executions: {}", result.details.executions);
}
