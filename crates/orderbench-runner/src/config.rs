use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{OrchestratorError, Result};
use crate::instrumentation;
use crate::retry::RetryPolicy;

/// Largest `trials.n_runs` whose loop count still fits in a `u32`.
pub const MAX_N_RUNS: u32 = u32::MAX / 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Pre-allocated worker hostnames. May be empty when an allocator supplies them.
    #[serde(default)]
    pub workers: Vec<String>,
    pub ssh: SshConfig,
    pub repo: String,
    #[serde(default)]
    pub commands: RemoteCommands,
    #[serde(default)]
    pub worker_results: WorkerResults,
    #[serde(default)]
    pub env_script: Option<PathBuf>,
    #[serde(default = "default_env_output")]
    pub env_output: String,
    #[serde(default)]
    pub trials: TrialSettings,
    #[serde(default)]
    pub reset: ResetSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub instrumentation: Vec<String>,
    #[serde(default = "default_results_root")]
    pub results_root: PathBuf,
    #[serde(default)]
    pub stats_command: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub verbose: bool,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub user: String,
    pub keyfile: PathBuf,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteCommands {
    #[serde(default = "default_init_command")]
    pub init: String,
    #[serde(default = "default_list_command")]
    pub list: String,
}

impl Default for RemoteCommands {
    fn default() -> Self {
        Self {
            init: default_init_command(),
            list: default_list_command(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResults {
    #[serde(default = "default_results_dir")]
    pub dir: String,
    #[serde(default = "default_results_file")]
    pub file: String,
}

impl Default for WorkerResults {
    fn default() -> Self {
        Self {
            dir: default_results_dir(),
            file: default_results_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialSettings {
    /// Repetitions per order type; the runner performs twice as many loops.
    #[serde(default = "default_n_runs")]
    pub n_runs: u32,
    #[serde(default = "default_true")]
    pub interleave: bool,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for TrialSettings {
    fn default() -> Self {
        Self {
            n_runs: default_n_runs(),
            interleave: true,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    #[serde(default = "default_reboot_command")]
    pub command: String,
}

impl Default for ResetSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            grace_secs: default_grace_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            max_polls: default_max_polls(),
            command: default_reboot_command(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_attempts")]
    pub remote_attempts: u32,
    #[serde(default = "default_attempts")]
    pub local_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub delay_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            remote_attempts: default_attempts(),
            local_attempts: default_attempts(),
            delay_secs: default_retry_delay(),
        }
    }
}

fn default_env_output() -> String {
    "env_out.csv".to_string()
}
fn default_results_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_true() -> bool {
    true
}
fn default_log_file() -> PathBuf {
    PathBuf::from("logfile.log")
}
fn default_port() -> u16 {
    22
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_connect_attempts() -> u32 {
    3
}
fn default_init_command() -> String {
    "cd test-experiments && bash initialize.sh".to_string()
}
fn default_list_command() -> String {
    "cd test-experiments && python3 exp_config.py".to_string()
}
fn default_results_dir() -> String {
    "~/test-experiments/results".to_string()
}
fn default_results_file() -> String {
    "results.txt".to_string()
}
fn default_n_runs() -> u32 {
    3
}
fn default_grace_secs() -> u64 {
    120
}
fn default_poll_interval_secs() -> u64 {
    60
}
fn default_max_polls() -> u32 {
    8
}
fn default_reboot_command() -> String {
    "sudo reboot".to_string()
}
fn default_attempts() -> u32 {
    1
}
fn default_retry_delay() -> u64 {
    10
}

/// Everything needed to reach a worker, minus its hostname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub keyfile: PathBuf,
    pub port: u16,
}

impl SshConfig {
    pub fn credentials(&self) -> Credentials {
        Credentials {
            user: self.user.clone(),
            keyfile: expand_home(&self.keyfile),
            port: self.port,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl ExperimentConfig {
    /// Directory the experiment repository is cloned into on each worker.
    pub fn working_directory(&self) -> String {
        repo_directory_name(&self.repo)
    }

    pub fn remote_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.remote_attempts,
            Duration::from_secs(self.retry.delay_secs),
        )
    }

    pub fn local_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.local_attempts,
            Duration::from_secs(self.retry.delay_secs),
        )
    }

    /// Total loops per worker: one fixed and one random pass per repetition.
    ///
    /// `None` when the count does not fit in a `u32`.
    pub fn total_loops(&self) -> Option<u32> {
        self.trials.n_runs.checked_mul(2)
    }

    pub fn validate(&self, workers_from_allocator: bool) -> Result<()> {
        let mut problems = Vec::new();
        if self.workers.is_empty() && !workers_from_allocator {
            problems.push("workers: at least one hostname is required".to_string());
        }
        if self.workers.iter().any(|w| w.trim().is_empty()) {
            problems.push("workers: hostnames must not be empty".to_string());
        }
        if self.repo.trim().is_empty() {
            problems.push("repo: must not be empty".to_string());
        }
        if self.trials.n_runs == 0 {
            problems.push("trials.n_runs: must be at least 1".to_string());
        } else if self.total_loops().is_none() {
            problems.push(format!("trials.n_runs: must be at most {}", MAX_N_RUNS));
        }
        if self.ssh.connect_attempts == 0 {
            problems.push("ssh.connect_attempts: must be at least 1".to_string());
        }
        if self.reset.enabled && self.reset.max_polls == 0 {
            problems.push("reset.max_polls: must be at least 1 when reset is enabled".to_string());
        }
        for name in &self.instrumentation {
            if instrumentation::lookup(name).is_none() {
                problems.push(format!(
                    "instrumentation: unknown kind '{}' (known: {})",
                    name,
                    instrumentation::KNOWN.join(", ")
                ));
            }
        }
        if let Some(cmd) = &self.stats_command {
            if cmd.is_empty() {
                problems.push("stats_command: must name a program".to_string());
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Config(problems.join("; ")))
        }
    }

    /// `sha256:<hex>` over the canonical JSON form of the resolved config.
    pub fn digest(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        let bytes = serde_json::to_vec(&value).unwrap_or_default();
        format!("sha256:{}", hex::encode(Sha256::digest(&bytes)))
    }
}

pub fn load_config(path: &Path) -> Result<ExperimentConfig> {
    let raw = fs::read_to_string(path)?;
    parse_config(&raw)
}

pub fn parse_config(raw: &str) -> Result<ExperimentConfig> {
    serde_yaml::from_str(raw).map_err(|e| OrchestratorError::Config(e.to_string()))
}

pub fn repo_directory_name(repo: &str) -> String {
    let last = repo
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(repo);
    last.strip_suffix(".git").unwrap_or(last).to_string()
}

pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}
