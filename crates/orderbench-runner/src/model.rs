use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Fixed,
    Random,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Fixed => "fixed",
            OrderType::Random => "random",
        }
    }
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionStatus {
    Success,
    Failure,
}

impl CompletionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, CompletionStatus::Success)
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionStatus::Success => f.write_str("Success"),
            CompletionStatus::Failure => f.write_str("Failure"),
        }
    }
}

/// One pass over the full command list on one worker.
///
/// Field order is the column order of the persisted trial tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    #[serde(rename = "run_uuid")]
    pub trial_id: Uuid,
    pub hostname: String,
    #[serde(rename = "run_num")]
    pub index: u32,
    #[serde(rename = "total_runs")]
    pub total: u32,
    pub order_type: OrderType,
    #[serde(rename = "random_seed")]
    pub seed: Option<u64>,
    #[serde(rename = "time_start")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "time_stop")]
    pub finished_at: DateTime<Utc>,
}

/// One benchmark command's outcome within a trial.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandExecution {
    #[serde(rename = "run_uuid")]
    pub trial_id: Uuid,
    pub hostname: String,
    #[serde(rename = "run_num")]
    pub trial_index: u32,
    #[serde(rename = "total_runs")]
    pub total_trials: u32,
    #[serde(rename = "exp_command")]
    pub command: String,
    /// Index in the original, unshuffled command list.
    #[serde(rename = "exp_number")]
    pub command_index: usize,
    /// Position within this trial's execution order.
    #[serde(rename = "order_number")]
    pub position: usize,
    pub order_type: OrderType,
    #[serde(rename = "time_start")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "time_stop")]
    pub finished_at: DateTime<Utc>,
    pub completion_status: CompletionStatus,
    /// Raw benchmark output line collected from the worker, when available.
    #[serde(default)]
    pub result: Option<String>,
}

/// Benchmark commands as listed by the worker; list order is the fixed order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandList {
    commands: Vec<String>,
}

impl CommandList {
    pub fn new(commands: Vec<String>) -> Self {
        Self { commands }
    }

    /// One command per non-blank line of the listing command's output.
    pub fn parse(output: &str) -> Self {
        Self::new(
            output
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.commands.get(index).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.commands.iter().map(String::as_str)
    }
}
