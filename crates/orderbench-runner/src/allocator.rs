//! Worker allocation.
//!
//! An [`Allocation`] is produced once per run by an [`Allocator`] and is
//! owned by the fleet afterwards. Hostnames are only ever removed, and only
//! at the fleet's join point.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::{expand_home, Credentials, ExperimentConfig};
use crate::error::{OrchestratorError, Result};
use crate::interrupt::Interrupt;
use crate::logging::LogContext;
use crate::session::{RemoteSession, SessionSettings};
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    hostnames: Vec<String>,
    retired: Vec<String>,
    pub credentials: Credentials,
    pub site: Option<String>,
    pub hardware_type: Option<String>,
    /// Opaque handle of an external allocator (e.g. its project name).
    pub handle: Option<String>,
}

impl Allocation {
    pub fn new(hostnames: Vec<String>, credentials: Credentials) -> Self {
        Self {
            hostnames,
            retired: Vec::new(),
            credentials,
            site: None,
            hardware_type: None,
            handle: None,
        }
    }

    /// Active hostnames.
    pub fn hostnames(&self) -> &[String] {
        &self.hostnames
    }

    /// Hostnames removed after failing initialization.
    pub fn retired(&self) -> &[String] {
        &self.retired
    }

    /// Every hostname ever allocated, active first.
    pub fn all_hostnames(&self) -> Vec<String> {
        self.hostnames
            .iter()
            .chain(self.retired.iter())
            .cloned()
            .collect()
    }

    pub fn contains(&self, host: &str) -> bool {
        self.hostnames.iter().any(|h| h == host)
    }

    pub(crate) fn retire(&mut self, host: &str) {
        if let Some(pos) = self.hostnames.iter().position(|h| h == host) {
            let removed = self.hostnames.remove(pos);
            self.retired.push(removed);
        }
    }
}

pub trait Allocator {
    /// True when `allocate` supplies hostnames of its own.
    fn supplies_workers(&self) -> bool {
        false
    }

    fn allocate(
        &self,
        config: &ExperimentConfig,
        transport: &dyn Transport,
        interrupt: &Interrupt,
    ) -> Result<Allocation>;

    fn deallocate(
        &self,
        allocation: &Allocation,
        config: &ExperimentConfig,
        transport: &dyn Transport,
        interrupt: &Interrupt,
    ) -> Result<()>;
}

/// Uses the pre-configured worker list.
#[derive(Debug, Clone, Default)]
pub struct StaticAllocator;

impl Allocator for StaticAllocator {
    fn allocate(
        &self,
        config: &ExperimentConfig,
        _transport: &dyn Transport,
        _interrupt: &Interrupt,
    ) -> Result<Allocation> {
        info!("Using pre-allocated machines for running experiments");
        Ok(Allocation::new(
            config.workers.clone(),
            config.ssh.credentials(),
        ))
    }

    fn deallocate(
        &self,
        _allocation: &Allocation,
        _config: &ExperimentConfig,
        _transport: &dyn Transport,
        _interrupt: &Interrupt,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawAllocatorConfig {
    hostname: Option<String>,
    port_num: Option<u16>,
    user: Option<String>,
    keyfile: Option<PathBuf>,
    node_count: Option<u32>,
    site: Option<String>,
    hardware_type: Option<String>,
    project: Option<String>,
    allocate_command: Option<String>,
    deallocate_command: Option<String>,
}

/// Access details for the allocation portal plus the request to make there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    pub hostname: String,
    pub port_num: u16,
    pub user: String,
    pub keyfile: PathBuf,
    pub node_count: u32,
    pub site: Option<String>,
    pub hardware_type: Option<String>,
    pub project: Option<String>,
    /// Run on the portal; prints one worker hostname per line.
    pub allocate_command: Option<String>,
    pub deallocate_command: Option<String>,
}

impl AllocatorConfig {
    fn portal_credentials(&self) -> Credentials {
        Credentials {
            user: self.user.clone(),
            keyfile: expand_home(&self.keyfile),
            port: self.port_num,
        }
    }

    /// Fills `{count}`, `{site}`, `{hwtype}`, `{project}` and `{hosts}`.
    pub fn render(&self, template: &str, hosts: &[String]) -> String {
        template
            .replace("{count}", &self.node_count.to_string())
            .replace("{site}", self.site.as_deref().unwrap_or(""))
            .replace("{hwtype}", self.hardware_type.as_deref().unwrap_or(""))
            .replace("{project}", self.project.as_deref().unwrap_or(""))
            .replace("{hosts}", &hosts.join(" "))
    }
}

pub fn load_allocator_config(path: &Path) -> Result<AllocatorConfig> {
    let raw = fs::read_to_string(path).map_err(|e| OrchestratorError::AllocatorConfig {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    parse_allocator_config(&raw, path)
}

/// Missing required options are reported together.
pub fn parse_allocator_config(raw: &str, path: &Path) -> Result<AllocatorConfig> {
    let bad = |reason: String| OrchestratorError::AllocatorConfig {
        path: path.to_path_buf(),
        reason,
    };
    let parsed: RawAllocatorConfig = serde_yaml::from_str(raw).map_err(|e| bad(e.to_string()))?;

    let mut missing = Vec::new();
    if parsed.hostname.is_none() {
        missing.push("hostname");
    }
    if parsed.port_num.is_none() {
        missing.push("port_num");
    }
    if parsed.user.is_none() {
        missing.push("user");
    }
    if parsed.keyfile.is_none() {
        missing.push("keyfile");
    }
    match (parsed.hostname, parsed.port_num, parsed.user, parsed.keyfile) {
        (Some(hostname), Some(port_num), Some(user), Some(keyfile)) => Ok(AllocatorConfig {
            hostname,
            port_num,
            user,
            keyfile,
            node_count: parsed.node_count.unwrap_or(1),
            site: parsed.site,
            hardware_type: parsed.hardware_type,
            project: parsed.project,
            allocate_command: parsed.allocate_command,
            deallocate_command: parsed.deallocate_command,
        }),
        _ => Err(bad(format!(
            "required option(s) missing: {}",
            missing.join(", ")
        ))),
    }
}

/// Allocates workers by running commands on an allocation portal over SSH.
#[derive(Debug, Clone)]
pub struct CommandAllocator {
    config: AllocatorConfig,
}

impl CommandAllocator {
    pub fn new(config: AllocatorConfig) -> Self {
        Self { config }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        load_allocator_config(path).map(Self::new)
    }

    fn portal_session(
        &self,
        config: &ExperimentConfig,
        transport: &dyn Transport,
        interrupt: &Interrupt,
    ) -> Result<RemoteSession> {
        RemoteSession::connect(
            transport,
            &self.config.hostname,
            &self.config.portal_credentials(),
            &SessionSettings::from_config(config),
            interrupt,
            &LogContext::controller(),
        )
    }
}

impl Allocator for CommandAllocator {
    fn supplies_workers(&self) -> bool {
        self.config.allocate_command.is_some()
    }

    fn allocate(
        &self,
        config: &ExperimentConfig,
        transport: &dyn Transport,
        interrupt: &Interrupt,
    ) -> Result<Allocation> {
        info!("Using CloudLab as a platform for running experiments");
        let mut session = self.portal_session(config, transport, interrupt)?;
        info!("Established ssh access to {}", self.config.hostname);

        let hostnames = match &self.config.allocate_command {
            Some(template) => {
                let command = self.config.render(template, &[]);
                let (status, output) = session.capture(&command)?;
                let hosts: Vec<String> = output
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(str::to_string)
                    .collect();
                if !status.is_success() || hosts.is_empty() {
                    session.close();
                    return Err(OrchestratorError::RemoteCommand {
                        host: self.config.hostname.clone(),
                        command,
                        attempts: 1,
                        detail: format!("allocation returned {} hostname(s)", hosts.len()),
                    });
                }
                hosts
            }
            None => config.workers.clone(),
        };
        session.close();
        info!("Allocated workers: {}", hostnames.join(", "));

        let mut allocation = Allocation::new(
            hostnames,
            Credentials {
                user: self.config.user.clone(),
                keyfile: expand_home(&self.config.keyfile),
                port: config.ssh.port,
            },
        );
        allocation.site = self.config.site.clone();
        allocation.hardware_type = self.config.hardware_type.clone();
        allocation.handle = self.config.project.clone();
        Ok(allocation)
    }

    fn deallocate(
        &self,
        allocation: &Allocation,
        config: &ExperimentConfig,
        transport: &dyn Transport,
        interrupt: &Interrupt,
    ) -> Result<()> {
        let Some(template) = &self.config.deallocate_command else {
            return Ok(());
        };
        let mut session = self.portal_session(config, transport, interrupt)?;
        let command = self.config.render(template, &allocation.all_hostnames());
        if !session.execute(&command)?.is_success() {
            warn!("deallocation command failed on {}", self.config.hostname);
        }
        session.close();
        Ok(())
    }
}
