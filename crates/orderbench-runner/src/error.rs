use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("failed to connect to {host} after {attempts} attempt(s): {reason}")]
    Connection {
        host: String,
        attempts: u32,
        reason: String,
    },

    #[error("remote command failed on {host} after {attempts} attempt(s): {command}: {detail}")]
    RemoteCommand {
        host: String,
        command: String,
        attempts: u32,
        detail: String,
    },

    #[error("{host} did not come back after reboot ({polls} reachability checks)")]
    ResetTimeout { host: String, polls: u32 },

    #[error("local command failed after {attempts} attempt(s): {command}: {detail}")]
    LocalCommand {
        command: String,
        attempts: u32,
        detail: String,
    },

    #[error("allocator config {}: {reason}", path.display())]
    AllocatorConfig { path: PathBuf, reason: String },

    #[error("initialization of {host} failed during {step}: {source}")]
    Initialization {
        host: String,
        step: &'static str,
        #[source]
        source: Box<OrchestratorError>,
    },

    #[error("worker unit for {host} panicked")]
    WorkerPanicked { host: String },

    #[error("no workers remaining after initialization")]
    NoWorkersRemaining,

    #[error("interrupted")]
    Interrupted,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    pub fn is_interrupt(&self) -> bool {
        match self {
            OrchestratorError::Interrupted => true,
            OrchestratorError::Initialization { source, .. } => source.is_interrupt(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
