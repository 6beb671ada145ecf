#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use orderbench_runner::config::parse_config;
use orderbench_runner::mock::MockReply;
use orderbench_runner::ExperimentConfig;

pub const LIST_COMMAND: &str = "cd bench && python3 exp_config.py";

pub fn temp_root(tag: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "orderbench_it_{}_{}_{}",
        tag,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    fs::create_dir_all(&root).expect("temp root");
    root
}

/// Config with every wait set to zero so tests never sleep.
pub fn config(workers: &[&str], results_root: &Path) -> ExperimentConfig {
    let yaml = format!(
        "
workers: [{workers}]
ssh: {{user: alice, keyfile: /keys/id, connect_timeout_secs: 0, connect_attempts: 1}}
repo: https://example.org/lab/bench.git
commands: {{list: '{list}'}}
trials: {{n_runs: 1, interleave: true, seed: 7}}
reset: {{enabled: false, grace_secs: 0, poll_interval_secs: 0, max_polls: 1}}
retry: {{remote_attempts: 1, local_attempts: 1, delay_secs: 0}}
results_root: {root}
",
        workers = workers.join(", "),
        list = LIST_COMMAND,
        root = results_root.display(),
    );
    parse_config(&yaml).expect("test config")
}

/// Answers the list command with `commands`; everything else succeeds.
pub fn listing(commands: &'static [&'static str]) -> impl Fn(&str, &str) -> MockReply + Send + Sync {
    move |_, cmd| {
        if cmd == LIST_COMMAND {
            MockReply::ok(&commands.join("\n"))
        } else {
            MockReply::ok("")
        }
    }
}

pub fn files_ending_with(dir: &Path, suffix: &str) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .expect("read dir")
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|n| n.ends_with(suffix))
        .collect();
    names.sort();
    names
}
