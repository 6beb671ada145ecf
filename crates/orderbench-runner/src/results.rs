//! Result Aggregator: per-worker and merged tables under one timestamped
//! results directory, plus the run manifest.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::model::{CommandExecution, Trial};

pub const EXP_RESULTS: &str = "exp_results.csv";
pub const RUN_RESULTS: &str = "run_results.csv";
pub const MANIFEST_FILE: &str = "manifest.json";
const DIR_SUFFIX: &str = "_results";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultsDir {
    path: PathBuf,
    timestamp: String,
}

impl ResultsDir {
    /// Creates `<root>/<YYYYmmdd_HHMMSS>_results`, adding a counter when a
    /// directory from the same second already exists.
    pub fn create(root: &Path) -> Result<Self> {
        let base = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let mut timestamp = base.clone();
        let mut n = 1;
        while root.join(format!("{}{}", timestamp, DIR_SUFFIX)).exists() {
            timestamp = format!("{}_{}", base, n);
            n += 1;
        }
        let path = root.join(format!("{}{}", timestamp, DIR_SUFFIX));
        ensure_dir(&path)?;
        info!("Results directory: {}", path.display());
        Ok(Self { path, timestamp })
    }

    /// Opens an existing results directory.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_dir() {
            anyhow::bail!("results directory not found: {}", path.display());
        }
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        let timestamp = name.strip_suffix(DIR_SUFFIX).unwrap_or(name).to_string();
        Ok(Self {
            path: path.to_path_buf(),
            timestamp,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn run_id(&self) -> String {
        format!("run_{}", self.timestamp)
    }

    /// `<host>_<kind>`
    pub fn worker_file(&self, host: &str, kind: &str) -> PathBuf {
        self.path.join(format!("{}_{}", host, kind))
    }

    /// `<timestamp>_all_<kind>`
    pub fn merged_file(&self, kind: &str) -> PathBuf {
        self.path.join(format!("{}_all_{}", self.timestamp, kind))
    }

    pub fn summary_file(&self, kind: &str) -> PathBuf {
        self.path.join(format!("{}_{}", self.timestamp, kind))
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create {}", path.display()))
}

pub fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("create {}", path.display()))?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_rows<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("open {}", path.display()))?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row.with_context(|| format!("parse {}", path.display()))?);
    }
    Ok(rows)
}

pub fn write_executions(path: &Path, rows: &[CommandExecution]) -> Result<()> {
    write_rows(path, rows)
}

pub fn read_executions(path: &Path) -> Result<Vec<CommandExecution>> {
    read_rows(path)
}

pub fn write_trials(path: &Path, rows: &[Trial]) -> Result<()> {
    write_rows(path, rows)
}

pub fn read_trials(path: &Path) -> Result<Vec<Trial>> {
    read_rows(path)
}

/// Attaches worker result lines, in execution order, when the counts match.
pub fn attach_results(executions: &mut [CommandExecution], lines: &[String]) -> bool {
    if executions.len() != lines.len() {
        warn!(
            "{} result line(s) for {} command execution(s); leaving results empty",
            lines.len(),
            executions.len()
        );
        return false;
    }
    for (execution, line) in executions.iter_mut().zip(lines) {
        execution.result = if line.is_empty() {
            None
        } else {
            Some(line.clone())
        };
    }
    true
}

/// Concatenates the per-host environment tables under a single header.
///
/// Files whose header differs from the first are skipped with a warning.
pub fn merge_env_files(
    dir: &ResultsDir,
    hosts: &[String],
    env_output: &str,
) -> Result<Option<PathBuf>> {
    let mut header: Option<String> = None;
    let mut body = String::new();
    for host in hosts {
        let path = dir.worker_file(host, env_output);
        if !path.exists() {
            continue;
        }
        let text = fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let mut lines = text.lines();
        let Some(first) = lines.next() else {
            continue;
        };
        match &header {
            Some(h) if h != first => {
                warn!("{} has a different header; not merged", path.display());
                continue;
            }
            Some(_) => {}
            None => header = Some(first.to_string()),
        }
        for line in lines.filter(|l| !l.trim().is_empty()) {
            body.push_str(line);
            body.push('\n');
        }
    }
    let Some(header) = header else {
        return Ok(None);
    };
    let out = dir.merged_file(env_output);
    let mut file = fs::File::create(&out).with_context(|| format!("create {}", out.display()))?;
    writeln!(file, "{}", header)?;
    file.write_all(body.as_bytes())?;
    Ok(Some(out))
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

/// Per-run facts recorded in the manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunDetails {
    pub hosts: Vec<String>,
    /// Host -> why initialization failed.
    pub excluded: BTreeMap<String, String>,
    /// Host -> why its trials ended early.
    pub stopped_early: BTreeMap<String, String>,
    /// Host -> why it produced no results at all.
    pub failed_workers: BTreeMap<String, String>,
    pub seeds: BTreeMap<String, u64>,
    pub trials: usize,
    pub executions: usize,
}

fn write_manifest(
    dir: &Path,
    run_id: &str,
    created_at: DateTime<Utc>,
    config_digest: &str,
    status: &str,
    details: Option<&RunDetails>,
) -> Result<()> {
    let payload = json!({
        "schema_version": "run_manifest_v1",
        "run_id": run_id,
        "status": status,
        "created_at": created_at.to_rfc3339(),
        "updated_at": Utc::now().to_rfc3339(),
        "config_digest": config_digest,
        "details": details,
    });
    atomic_write_json_pretty(&dir.join(MANIFEST_FILE), &payload)
}

/// Writes a `failed` manifest on drop unless the run completed.
pub struct ManifestGuard {
    dir: PathBuf,
    run_id: String,
    created_at: DateTime<Utc>,
    config_digest: String,
    done: bool,
}

impl ManifestGuard {
    pub fn new(dir: &ResultsDir, config_digest: &str) -> Result<Self> {
        let guard = Self {
            dir: dir.path().to_path_buf(),
            run_id: dir.run_id(),
            created_at: Utc::now(),
            config_digest: config_digest.to_string(),
            done: false,
        };
        write_manifest(
            &guard.dir,
            &guard.run_id,
            guard.created_at,
            &guard.config_digest,
            "running",
            None,
        )?;
        Ok(guard)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn complete(&mut self, status: &str, details: &RunDetails) -> Result<()> {
        write_manifest(
            &self.dir,
            &self.run_id,
            self.created_at,
            &self.config_digest,
            status,
            Some(details),
        )?;
        self.done = true;
        Ok(())
    }
}

impl Drop for ManifestGuard {
    fn drop(&mut self) {
        if !self.done {
            let _ = write_manifest(
                &self.dir,
                &self.run_id,
                self.created_at,
                &self.config_digest,
                "failed",
                None,
            );
        }
    }
}

pub fn read_manifest(dir: &Path) -> Result<Value> {
    let path = dir.join(MANIFEST_FILE);
    let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CompletionStatus, OrderType};
    use uuid::Uuid;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "orderbench_results_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("temp root");
        root
    }

    fn execution(position: usize, status: CompletionStatus) -> CommandExecution {
        let now = Utc::now();
        CommandExecution {
            trial_id: Uuid::now_v7(),
            hostname: "n0".into(),
            trial_index: 1,
            total_trials: 2,
            command: "echo \"a, b\"".into(),
            command_index: 1 - position,
            position,
            order_type: OrderType::Random,
            started_at: now,
            finished_at: now,
            completion_status: status,
            result: None,
        }
    }

    #[test]
    fn executions_survive_a_csv_round_trip() {
        let root = temp_root("rt");
        let dir = ResultsDir::create(&root).expect("dir");
        let mut rows = vec![
            execution(0, CompletionStatus::Success),
            execution(1, CompletionStatus::Failure),
        ];
        rows[0].result = Some("12.5".into());
        let path = dir.worker_file("n0", EXP_RESULTS);
        write_executions(&path, &rows).expect("write");
        assert_eq!(read_executions(&path).expect("read"), rows);

        let header = fs::read_to_string(&path).expect("raw");
        assert!(header.starts_with(
            "run_uuid,hostname,run_num,total_runs,exp_command,exp_number,order_number,\
             order_type,time_start,time_stop,completion_status,result"
        ));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn trials_survive_a_csv_round_trip() {
        let root = temp_root("trials");
        let path = root.join("t.csv");
        let now = Utc::now();
        let rows = vec![
            Trial {
                trial_id: Uuid::now_v7(),
                hostname: "n0".into(),
                index: 0,
                total: 2,
                order_type: OrderType::Fixed,
                seed: None,
                started_at: now,
                finished_at: now,
            },
            Trial {
                trial_id: Uuid::now_v7(),
                hostname: "n0".into(),
                index: 1,
                total: 2,
                order_type: OrderType::Random,
                seed: Some(u64::MAX),
                started_at: now,
                finished_at: now,
            },
        ];
        write_trials(&path, &rows).expect("write");
        assert_eq!(read_trials(&path).expect("read"), rows);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn results_attach_only_when_counts_match() {
        let mut rows = vec![
            execution(0, CompletionStatus::Success),
            execution(1, CompletionStatus::Success),
        ];
        assert!(!attach_results(&mut rows, &["1".to_string()]));
        assert!(rows.iter().all(|r| r.result.is_none()));
        assert!(attach_results(&mut rows, &["1".to_string(), String::new()]));
        assert_eq!(rows[0].result.as_deref(), Some("1"));
        assert_eq!(rows[1].result, None);
    }

    #[test]
    fn env_files_merge_under_one_header() {
        let root = temp_root("env");
        let dir = ResultsDir::create(&root).expect("dir");
        fs::write(dir.worker_file("a", "env_out.csv"), "host,cpus\na,8\n").expect("a");
        fs::write(dir.worker_file("b", "env_out.csv"), "host,cpus\nb,16\n").expect("b");
        fs::write(dir.worker_file("c", "env_out.csv"), "other\nc\n").expect("c");
        let hosts = vec!["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()];
        let merged = merge_env_files(&dir, &hosts, "env_out.csv")
            .expect("merge")
            .expect("some file");
        assert_eq!(
            fs::read_to_string(merged).expect("read"),
            "host,cpus\na,8\nb,16\n"
        );
        assert_eq!(merge_env_files(&dir, &[], "env_out.csv").expect("none"), None);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn manifest_guard_marks_abandoned_runs_failed() {
        let root = temp_root("manifest");
        let dir = ResultsDir::create(&root).expect("dir");
        {
            let guard = ManifestGuard::new(&dir, "sha256:abc").expect("guard");
            assert_eq!(read_manifest(dir.path()).expect("m")["status"], "running");
            assert!(guard.run_id().starts_with("run_"));
        }
        assert_eq!(read_manifest(dir.path()).expect("m")["status"], "failed");

        let mut guard = ManifestGuard::new(&dir, "sha256:abc").expect("guard");
        let details = RunDetails {
            hosts: vec!["n0".into()],
            trials: 2,
            ..RunDetails::default()
        };
        guard.complete("completed", &details).expect("complete");
        drop(guard);
        let manifest = read_manifest(dir.path()).expect("m");
        assert_eq!(manifest["status"], "completed");
        assert_eq!(manifest["details"]["trials"], 2);
        assert_eq!(manifest["config_digest"], "sha256:abc");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn create_never_reuses_a_directory() {
        let root = temp_root("unique");
        let a = ResultsDir::create(&root).expect("a");
        let b = ResultsDir::create(&root).expect("b");
        assert_ne!(a.path(), b.path());
        let reopened = ResultsDir::open(a.path()).expect("open");
        assert_eq!(reopened.timestamp(), a.timestamp());
        let _ = fs::remove_dir_all(root);
    }
}
