//! Statistics handoff.
//!
//! [`process_data`] applies the failure filter every consumer relies on.
//! [`OrderEffectSummary`] is the built-in per-command comparison of fixed
//! and random orders; [`ExternalStats`] hands the merged table to an
//! external program.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::interrupt::Interrupt;
use crate::model::{CommandExecution, OrderType};
use crate::results::{write_rows, ResultsDir};
use crate::retry::RetryPolicy;
use crate::session::run_local;

pub const CI_SUMMARY: &str = "ci_summary.csv";

/// z for a two-sided 95% interval.
const Z_95: f64 = 1.959_963_984_540_054;

pub trait StatisticsSink {
    fn name(&self) -> &str;

    /// `merged` is the merged command-execution table on disk; `executions`
    /// holds the same rows.
    fn consume(&self, merged: &Path, executions: &[CommandExecution], dir: &ResultsDir)
        -> Result<()>;
}

/// Drops every trial whose fixed-order run contains a failure, then every
/// remaining failed row.
pub fn process_data(executions: &[CommandExecution]) -> Vec<CommandExecution> {
    let failed_fixed: HashSet<Uuid> = executions
        .iter()
        .filter(|e| e.order_type == OrderType::Fixed && !e.completion_status.is_success())
        .map(|e| e.trial_id)
        .collect();
    executions
        .iter()
        .filter(|e| !failed_fixed.contains(&e.trial_id))
        .filter(|e| e.completion_status.is_success())
        .cloned()
        .collect()
}

/// Linear-interpolated quantile of sorted data.
fn quantile(sorted: &[f64], p: f64) -> f64 {
    let pos = p * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}

/// Median and its nonparametric 95% confidence interval (Le Boudec's rank
/// method), as `(median, low, high)`.
pub fn median_ci(values: &[f64]) -> Option<(f64, f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let n = sorted.len() as f64;
    let spread = Z_95 * (n * 0.25).sqrt();
    let lo_rank = (n * 0.5 - spread).floor().max(0.0) as usize;
    let hi_rank = ((n * 0.5 + spread).ceil() as usize + 1).min(sorted.len() - 1);
    Some((quantile(&sorted, 0.5), sorted[lo_rank], sorted[hi_rank]))
}

/// How two confidence intervals relate.
///
/// `1`: disjoint. `3`: each median lies inside the other interval.
/// `2`: anything in between.
pub fn ci_case(a: (f64, f64, f64), b: (f64, f64, f64)) -> u8 {
    let (a_med, a_lo, a_hi) = a;
    let (b_med, b_lo, b_hi) = b;
    if a_hi < b_lo || b_hi < a_lo {
        1
    } else if (b_lo..=b_hi).contains(&a_med) && (a_lo..=a_hi).contains(&b_med) {
        3
    } else {
        2
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// `(fixed - random) / fixed * 100` over the sample means.
pub fn percent_difference(fixed: &[f64], random: &[f64]) -> Option<f64> {
    if fixed.is_empty() || random.is_empty() {
        return None;
    }
    let f = mean(fixed);
    (f != 0.0).then(|| (f - mean(random)) / f * 100.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRow {
    /// `all`, or a hostname when several workers contributed.
    pub scope: String,
    pub exp_command: String,
    pub fixed_n: usize,
    pub random_n: usize,
    pub fixed_median: f64,
    pub fixed_ci_low: f64,
    pub fixed_ci_high: f64,
    pub random_median: f64,
    pub random_ci_low: f64,
    pub random_ci_high: f64,
    pub percent_diff: Option<f64>,
    pub ci_case: u8,
    /// Gap between disjoint intervals.
    pub inner_diff: Option<f64>,
}

#[derive(Default)]
struct Samples {
    fixed: Vec<f64>,
    random: Vec<f64>,
}

fn summarize_group(scope: &str, groups: BTreeMap<String, Samples>) -> Vec<SummaryRow> {
    let mut rows = Vec::new();
    for (command, samples) in groups {
        let (Some(f), Some(r)) = (median_ci(&samples.fixed), median_ci(&samples.random)) else {
            warn!("{}: {} lacks samples of both orders; skipped", scope, command);
            continue;
        };
        let case = ci_case(f, r);
        let inner_diff = (case == 1).then(|| (r.1 - f.2).max(f.1 - r.2));
        rows.push(SummaryRow {
            scope: scope.to_string(),
            exp_command: command,
            fixed_n: samples.fixed.len(),
            random_n: samples.random.len(),
            fixed_median: f.0,
            fixed_ci_low: f.1,
            fixed_ci_high: f.2,
            random_median: r.0,
            random_ci_low: r.1,
            random_ci_high: r.2,
            percent_diff: percent_difference(&samples.fixed, &samples.random),
            ci_case: case,
            inner_diff,
        });
    }
    rows
}

/// Per-command comparison of fixed and random order results.
///
/// Only rows that survive [`process_data`] and carry a numeric result count.
pub fn summarize(executions: &[CommandExecution]) -> Vec<SummaryRow> {
    let kept = process_data(executions);
    let mut all: BTreeMap<String, Samples> = BTreeMap::new();
    let mut per_host: BTreeMap<String, BTreeMap<String, Samples>> = BTreeMap::new();
    for e in &kept {
        let Some(value) = e.result.as_deref().and_then(|r| r.trim().parse::<f64>().ok()) else {
            continue;
        };
        if !value.is_finite() {
            continue;
        }
        for samples in [
            all.entry(e.command.clone()).or_default(),
            per_host
                .entry(e.hostname.clone())
                .or_default()
                .entry(e.command.clone())
                .or_default(),
        ] {
            match e.order_type {
                OrderType::Fixed => samples.fixed.push(value),
                OrderType::Random => samples.random.push(value),
            }
        }
    }
    let mut rows = summarize_group("all", all);
    if per_host.len() > 1 {
        for (host, groups) in per_host {
            rows.extend(summarize_group(&host, groups));
        }
    }
    rows
}

#[derive(Debug, Clone, Default)]
pub struct OrderEffectSummary;

impl StatisticsSink for OrderEffectSummary {
    fn name(&self) -> &str {
        "order-effect summary"
    }

    fn consume(
        &self,
        _merged: &Path,
        executions: &[CommandExecution],
        dir: &ResultsDir,
    ) -> Result<()> {
        let rows = summarize(executions);
        let path = dir.summary_file(CI_SUMMARY);
        write_rows(&path, &rows)?;
        let disjoint = rows.iter().filter(|r| r.ci_case == 1).count();
        info!(
            "{} command(s) summarized, {} with disjoint intervals: {}",
            rows.len(),
            disjoint,
            path.display()
        );
        Ok(())
    }
}

/// Runs `<argv...> <merged table> <results dir>` on the controller.
#[derive(Debug, Clone)]
pub struct ExternalStats {
    argv: Vec<String>,
    policy: RetryPolicy,
    interrupt: Interrupt,
}

impl ExternalStats {
    pub fn new(argv: Vec<String>, policy: RetryPolicy, interrupt: &Interrupt) -> Self {
        Self {
            argv,
            policy,
            interrupt: interrupt.clone(),
        }
    }
}

impl StatisticsSink for ExternalStats {
    fn name(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("external")
    }

    fn consume(&self, merged: &Path, _executions: &[CommandExecution], dir: &ResultsDir) -> Result<()> {
        let mut argv = self.argv.clone();
        argv.push(merged.to_string_lossy().into_owned());
        argv.push(dir.path().to_string_lossy().into_owned());
        run_local(&argv, &self.policy, true, &self.interrupt)?;
        Ok(())
    }
}
