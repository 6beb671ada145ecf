//! Node Lifecycle Controller: provisioning, reset and collection for one worker.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::allocator::Allocation;
use crate::config::{Credentials, ExperimentConfig};
use crate::error::{OrchestratorError, Result};
use crate::instrumentation::{self, InstrumentationProfile};
use crate::interrupt::Interrupt;
use crate::logging::LogContext;
use crate::model::CompletionStatus;
use crate::session::{RemoteSession, SessionSettings};
use crate::transport::Transport;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const REMOTE_ENV_SCRIPT: &str = "env_info.sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Uninitialized,
    Cloning,
    Configuring,
    SpecsGathered,
    ResetPending,
    Ready,
    Failed,
}

/// What [`NodeController::collect`] brought back from the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Collected {
    /// Lines of the worker's results file, one per benchmark execution.
    pub result_lines: Option<Vec<String>>,
    pub instrumentation: Vec<PathBuf>,
}

pub struct NodeController<'a> {
    host: String,
    credentials: &'a Credentials,
    config: &'a ExperimentConfig,
    transport: &'a dyn Transport,
    settings: SessionSettings,
    profiles: Vec<InstrumentationProfile>,
    results_dir: &'a Path,
    interrupt: Interrupt,
    log: LogContext,
    state: NodeState,
    history: Vec<NodeState>,
}

impl<'a> NodeController<'a> {
    pub fn new(
        host: &str,
        allocation: &'a Allocation,
        config: &'a ExperimentConfig,
        transport: &'a dyn Transport,
        results_dir: &'a Path,
        interrupt: &Interrupt,
    ) -> Self {
        Self {
            host: host.to_string(),
            credentials: &allocation.credentials,
            config,
            transport,
            settings: SessionSettings::from_config(config),
            profiles: instrumentation::resolve(&config.instrumentation),
            results_dir,
            interrupt: interrupt.clone(),
            log: LogContext::worker(host),
            state: NodeState::Uninitialized,
            history: vec![NodeState::Uninitialized],
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Every state the node has passed through, oldest first.
    pub fn history(&self) -> &[NodeState] {
        &self.history
    }

    fn transition(&mut self, next: NodeState) {
        debug!("{}: {:?} -> {:?}", self.host, self.state, next);
        self.state = next;
        self.history.push(next);
    }

    pub fn config(&self) -> &ExperimentConfig {
        self.config
    }

    pub fn log(&self) -> &LogContext {
        &self.log
    }

    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    pub fn profiles(&self) -> &[InstrumentationProfile] {
        &self.profiles
    }

    pub fn open_session(&self) -> Result<RemoteSession> {
        RemoteSession::connect(
            self.transport,
            &self.host,
            self.credentials,
            &self.settings,
            &self.interrupt,
            &self.log,
        )
    }

    /// Clones, configures, gathers specs and resets the worker.
    ///
    /// Any failing step leaves the node `Failed` and is reported as
    /// [`OrchestratorError::Initialization`] naming that step.
    pub fn initialize(&mut self) -> Result<()> {
        let log = self.log.clone();
        let _entered = log.enter();
        info!("Initializing {}", self.host);
        let result = self.provision();
        match &result {
            Ok(()) => {
                self.transition(NodeState::Ready);
                info!("{} is ready", self.host);
            }
            Err(e) => {
                let reached = self.state;
                self.transition(NodeState::Failed);
                error!(
                    "initialization of {} failed after {:?}: {}",
                    self.host, reached, e
                );
            }
        }
        result
    }

    fn provision(&mut self) -> Result<()> {
        self.transition(NodeState::Cloning);
        let mut session = self.step("connect", self.open_session())?;
        let outcome = self.provision_with(&mut session);
        session.close();
        outcome
    }

    fn provision_with(&mut self, session: &mut RemoteSession) -> Result<()> {
        let workdir = self.config.working_directory();
        self.step("clone", self.require(session, &format!("rm -rf ~/{}", workdir)))?;
        self.step(
            "clone",
            self.require(session, &format!("git clone {}", self.config.repo)),
        )?;

        self.transition(NodeState::Configuring);
        self.step("init", self.require(session, &self.config.commands.init))?;
        self.step("instrumentation", self.configure_instrumentation(session))?;

        self.step("specs", self.gather_specs(session))?;
        self.transition(NodeState::SpecsGathered);

        self.transition(NodeState::ResetPending);
        self.step("reset", self.reset(session))
    }

    fn step<T>(&self, step: &'static str, result: Result<T>) -> Result<T> {
        result.map_err(|e| match e {
            OrchestratorError::Interrupted => e,
            other => OrchestratorError::Initialization {
                host: self.host.clone(),
                step,
                source: Box::new(other),
            },
        })
    }

    /// Runs `command`, treating a non-zero exit as an error.
    fn require(&self, session: &mut RemoteSession, command: &str) -> Result<()> {
        match session.execute(command)? {
            CompletionStatus::Success => Ok(()),
            CompletionStatus::Failure => Err(OrchestratorError::RemoteCommand {
                host: self.host.clone(),
                command: command.to_string(),
                attempts: 1,
                detail: "non-zero exit status".to_string(),
            }),
        }
    }

    fn require_transfer(&self, status: CompletionStatus, what: &str) -> Result<()> {
        match status {
            CompletionStatus::Success => Ok(()),
            CompletionStatus::Failure => Err(OrchestratorError::RemoteCommand {
                host: self.host.clone(),
                command: what.to_string(),
                attempts: self.settings.transfer_policy.max_attempts,
                detail: "transfer failed".to_string(),
            }),
        }
    }

    fn configure_instrumentation(&self, session: &mut RemoteSession) -> Result<()> {
        if self.profiles.is_empty() {
            return Ok(());
        }
        for profile in &self.profiles {
            info!("Configuring instrumentation {}", profile.name);
            if let Some(init) = &profile.init_command {
                self.require(session, init)?;
            }
        }
        let env = instrumentation::merged_env(&self.profiles);
        let local = std::env::temp_dir().join(format!(
            "orderbench_{}_{}_{}",
            std::process::id(),
            self.host,
            instrumentation::ENV_FILE
        ));
        fs::write(&local, instrumentation::render_env_file(&env))?;
        let status = session.copy_to(&local, instrumentation::ENV_FILE);
        let _ = fs::remove_file(&local);
        self.require_transfer(status?, instrumentation::ENV_FILE)
    }

    /// Runs the environment script and pulls its output as `<host>_<env_output>`.
    fn gather_specs(&self, session: &mut RemoteSession) -> Result<()> {
        let Some(script) = &self.config.env_script else {
            debug!("no environment script configured");
            return Ok(());
        };
        let status = session.copy_to(script, REMOTE_ENV_SCRIPT)?;
        self.require_transfer(status, REMOTE_ENV_SCRIPT)?;
        self.require(session, &format!("bash {}", REMOTE_ENV_SCRIPT))?;

        let renamed = env_file_name(&self.host, &self.config.env_output);
        self.require(
            session,
            &format!("mv {} {}", self.config.env_output, renamed),
        )?;
        let status = session.copy_from(&renamed, &self.results_dir.join(&renamed), false)?;
        self.require_transfer(status, &renamed)
    }

    /// Reboots the worker and waits for its SSH port to answer again.
    ///
    /// Succeeds immediately when reset is disabled.
    pub fn reset(&self, session: &mut RemoteSession) -> Result<()> {
        let settings = &self.config.reset;
        if !settings.enabled {
            debug!("reset disabled; skipping reboot of {}", self.host);
            return Ok(());
        }
        info!("Rebooting {}", self.host);
        match session.execute(&settings.command) {
            Ok(_) => {}
            Err(e) if e.is_interrupt() => return Err(e),
            Err(e) => debug!("connection dropped while issuing reboot: {}", e),
        }

        self.interrupt
            .sleep(Duration::from_secs(settings.grace_secs))?;
        for poll in 1..=settings.max_polls {
            if self
                .transport
                .is_reachable(&self.host, self.credentials.port, PROBE_TIMEOUT)
            {
                info!("{} is back up after {} check(s)", self.host, poll);
                return Ok(());
            }
            info!(
                "{} not reachable yet ({}/{})",
                self.host, poll, settings.max_polls
            );
            if poll < settings.max_polls {
                self.interrupt
                    .sleep(Duration::from_secs(settings.poll_interval_secs))?;
            }
        }
        error!("{} did not come back after reboot", self.host);
        Err(OrchestratorError::ResetTimeout {
            host: self.host.clone(),
            polls: settings.max_polls,
        })
    }

    /// Pulls the worker's results directory and instrumentation output.
    ///
    /// Transfer failures are logged and leave the corresponding field empty.
    pub fn collect(&self) -> Result<Collected> {
        let _entered = self.log.enter();
        let mut session = self.open_session()?;
        let mut collected = Collected::default();

        let local = self.results_dir.join(format!("{}_results", self.host));
        let remote = &self.config.worker_results.dir;
        if session.copy_from(remote, &local, true)?.is_success() {
            let file = local.join(&self.config.worker_results.file);
            match fs::read_to_string(&file) {
                Ok(text) => {
                    collected.result_lines = Some(
                        text.lines()
                            .map(str::trim)
                            .filter(|l| !l.is_empty())
                            .map(str::to_string)
                            .collect(),
                    );
                }
                Err(e) => warn!("cannot read {}: {}", file.display(), e),
            }
        } else {
            warn!("could not pull {} from {}", remote, self.host);
        }

        for profile in &self.profiles {
            let Some(path) = &profile.results_path else {
                continue;
            };
            info!("Pulling {} results from {}", profile.name, path);
            let dest = self
                .results_dir
                .join(format!("{}_{}", self.host, profile.name));
            if session.copy_from(path, &dest, true)?.is_success() {
                collected.instrumentation.push(dest);
            }
        }
        session.close();
        Ok(collected)
    }
}

pub fn env_file_name(host: &str, env_output: &str) -> String {
    format!("{}_{}", host, env_output)
}
