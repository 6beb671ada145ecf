//! Remote Session: one authenticated connection to one worker.
//!
//! Every remote and local invocation in the engine goes through
//! [`RemoteSession::execute`]/[`RemoteSession::capture`] or [`run_local`],
//! so retry, logging, and timeout handling live here and nowhere else.

use std::io;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::{Credentials, ExperimentConfig};
use crate::error::{OrchestratorError, Result};
use crate::interrupt::Interrupt;
use crate::logging::LogContext;
use crate::model::CompletionStatus;
use crate::retry::{Attempt, RetryPolicy};
use crate::transport::{Connection, Transport};

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub connect_timeout: Duration,
    pub connect_attempts: u32,
    pub command_policy: RetryPolicy,
    pub transfer_policy: RetryPolicy,
}

impl SessionSettings {
    /// Transfers follow the local-command policy.
    pub fn from_config(config: &ExperimentConfig) -> Self {
        Self {
            connect_timeout: config.ssh.connect_timeout(),
            connect_attempts: config.ssh.connect_attempts,
            command_policy: config.remote_policy(),
            transfer_policy: config.local_policy(),
        }
    }
}

pub struct RemoteSession {
    host: String,
    conn: Box<dyn Connection>,
    command_policy: RetryPolicy,
    transfer_policy: RetryPolicy,
    interrupt: Interrupt,
    log: LogContext,
}

impl RemoteSession {
    /// Authenticates against `host`, sleeping `connect_timeout` between attempts.
    ///
    /// A rejected key is not retried.
    pub fn connect(
        transport: &dyn Transport,
        host: &str,
        credentials: &Credentials,
        settings: &SessionSettings,
        interrupt: &Interrupt,
        log: &LogContext,
    ) -> Result<Self> {
        let _entered = log.enter();
        let policy = RetryPolicy::new(settings.connect_attempts, settings.connect_timeout);
        let what = format!("ssh connection to {}", host);
        let outcome = policy.run(&what, interrupt, |_| {
            match transport.connect(host, credentials, settings.connect_timeout) {
                Ok(conn) => Attempt::Done(conn),
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => Attempt::Fatal(e),
                Err(e) => Attempt::Retryable(e),
            }
        })?;
        match outcome {
            Ok(conn) => {
                info!("SSH connection to {} successful", host);
                Ok(Self {
                    host: host.to_string(),
                    conn,
                    command_policy: settings.command_policy.clone(),
                    transfer_policy: settings.transfer_policy.clone(),
                    interrupt: interrupt.clone(),
                    log: log.clone(),
                })
            }
            Err((e, attempts)) => {
                error!("failure to connect to {}", host);
                Err(OrchestratorError::Connection {
                    host: host.to_string(),
                    attempts,
                    reason: e.to_string(),
                })
            }
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Runs `command`, streaming its output into the log.
    pub fn execute(&mut self, command: &str) -> Result<CompletionStatus> {
        self.run(command, false).map(|(status, _)| status)
    }

    /// Runs `command` and returns its merged output alongside the status.
    pub fn capture(&mut self, command: &str) -> Result<(CompletionStatus, String)> {
        self.run(command, true)
    }

    fn run(&mut self, command: &str, capture: bool) -> Result<(CompletionStatus, String)> {
        let _entered = self.log.enter();
        let host = self.host.clone();
        let conn = &mut self.conn;
        let outcome = self.command_policy.run(command, &self.interrupt, |_| {
            let mut output = String::new();
            let mut on_line = |line: &str| {
                if capture {
                    output.push_str(line);
                    output.push('\n');
                } else {
                    debug!("{}", line);
                }
            };
            match conn.exec(command, &mut on_line) {
                Ok(0) => Attempt::Done((CompletionStatus::Success, output)),
                Ok(code) => {
                    error!(
                        "error executing command on {}: {}. Exit status: {}",
                        host, command, code
                    );
                    Attempt::Done((CompletionStatus::Failure, output))
                }
                Err(e) => {
                    error!("SSH exception on {} while executing {}: {}", host, command, e);
                    Attempt::Retryable(e)
                }
            }
        })?;
        outcome.map_err(|(e, attempts)| OrchestratorError::RemoteCommand {
            host: self.host.clone(),
            command: command.to_string(),
            attempts,
            detail: e.to_string(),
        })
    }

    pub fn copy_to(&mut self, local: &Path, remote: &str) -> Result<CompletionStatus> {
        let what = format!("copy {} to {}:{}", local.display(), self.host, remote);
        self.transfer(&what, |conn| conn.put(local, remote))
    }

    pub fn copy_from(
        &mut self,
        remote: &str,
        local: &Path,
        recursive: bool,
    ) -> Result<CompletionStatus> {
        let what = format!("copy {}:{} to {}", self.host, remote, local.display());
        self.transfer(&what, |conn| conn.get(remote, local, recursive))
    }

    fn transfer<F>(&mut self, what: &str, mut op: F) -> Result<CompletionStatus>
    where
        F: FnMut(&mut dyn Connection) -> io::Result<()>,
    {
        let _entered = self.log.enter();
        let conn = &mut self.conn;
        let outcome = self.transfer_policy.run(what, &self.interrupt, |_| {
            match op(conn.as_mut()) {
                Ok(()) => Attempt::Done(()),
                Err(e) => Attempt::Retryable(e),
            }
        })?;
        match outcome {
            Ok(()) => {
                debug!("{}: done", what);
                Ok(CompletionStatus::Success)
            }
            Err((e, attempts)) => {
                error!("{} failed after {} attempt(s): {}", what, attempts, e);
                Ok(CompletionStatus::Failure)
            }
        }
    }

    pub fn close(mut self) {
        self.conn.close();
    }
}

/// Runs `argv` on the controlling machine, capturing combined output.
///
/// Non-zero exits and spawn errors are retried. When retries run out the
/// result is `Failure`, unless `strict` is set, in which case the last
/// error propagates.
pub fn run_local(
    argv: &[String],
    policy: &RetryPolicy,
    strict: bool,
    interrupt: &Interrupt,
) -> Result<CompletionStatus> {
    let Some((program, args)) = argv.split_first() else {
        return Err(OrchestratorError::LocalCommand {
            command: String::new(),
            attempts: 0,
            detail: "empty command".to_string(),
        });
    };
    let joined = argv.join(" ");
    let outcome = policy.run(&joined, interrupt, |_| {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output();
        match output {
            Ok(out) => {
                let mut merged = String::from_utf8_lossy(&out.stdout).to_string();
                merged.push_str(&String::from_utf8_lossy(&out.stderr));
                if out.status.success() {
                    if !merged.trim().is_empty() {
                        info!("{}", merged.trim_end());
                    }
                    Attempt::Done(())
                } else {
                    warn!("{}", merged.trim_end());
                    Attempt::Retryable(format!("exit status {}", out.status))
                }
            }
            Err(e) => Attempt::Retryable(e.to_string()),
        }
    })?;
    match outcome {
        Ok(()) => Ok(CompletionStatus::Success),
        Err((detail, attempts)) => {
            error!("failed to execute {}", joined);
            if strict {
                Err(OrchestratorError::LocalCommand {
                    command: joined,
                    attempts,
                    detail,
                })
            } else {
                Ok(CompletionStatus::Failure)
            }
        }
    }
}
