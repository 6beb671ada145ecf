//! Fleet Coordinator: fans initialization and trials out across workers.
//!
//! Each worker gets one scoped thread that owns its sessions, log span and
//! accumulators. Units return their result at the join point; the
//! allocation's hostname set is only pruned after every unit has joined.

use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::thread;

use tracing::{error, info, warn};

use crate::allocator::Allocation;
use crate::config::ExperimentConfig;
use crate::error::{OrchestratorError, Result};
use crate::interrupt::Interrupt;
use crate::model::CommandList;
use crate::node::{env_file_name, Collected, NodeController};
use crate::transport::Transport;
use crate::trial::{RunOutput, TrialRunner};

#[derive(Debug)]
pub struct InitFailure {
    pub host: String,
    pub error: OrchestratorError,
}

#[derive(Debug)]
pub struct Coordinated {
    pub commands: CommandList,
    pub excluded: Vec<InitFailure>,
}

#[derive(Debug)]
pub struct WorkerResult {
    pub run: RunOutput,
    pub collected: Option<Collected>,
}

#[derive(Debug)]
pub struct WorkerOutcome {
    pub host: String,
    pub result: std::result::Result<WorkerResult, OrchestratorError>,
}

pub struct Fleet<'a> {
    config: &'a ExperimentConfig,
    transport: &'a dyn Transport,
    results_dir: &'a Path,
    interrupt: Interrupt,
}

impl<'a> Fleet<'a> {
    pub fn new(
        config: &'a ExperimentConfig,
        transport: &'a dyn Transport,
        results_dir: &'a Path,
        interrupt: &Interrupt,
    ) -> Self {
        Self {
            config,
            transport,
            results_dir,
            interrupt: interrupt.clone(),
        }
    }

    fn node<'b>(&'b self, host: &str, allocation: &'b Allocation) -> NodeController<'b> {
        NodeController::new(
            host,
            allocation,
            self.config,
            self.transport,
            self.results_dir,
            &self.interrupt,
        )
    }

    /// Initializes every worker, drops the ones that failed, then fetches
    /// the shared command list from the first survivor.
    pub fn coordinate(&self, allocation: &mut Allocation) -> Result<Coordinated> {
        let outcomes = self.initialize_all(allocation);
        if self.interrupt.is_triggered() || outcomes.iter().any(|(_, r)| is_interrupt(r)) {
            return Err(OrchestratorError::Interrupted);
        }

        let mut excluded = Vec::new();
        for (host, result) in outcomes {
            if let Err(error) = result {
                warn!("excluding {} from the run: {}", host, error);
                allocation.retire(&host);
                let env_file = self
                    .results_dir
                    .join(env_file_name(&host, &self.config.env_output));
                if env_file.exists() {
                    let _ = fs::remove_file(env_file);
                }
                excluded.push(InitFailure { host, error });
            }
        }
        if allocation.hostnames().is_empty() {
            error!("no workers survived initialization");
            return Err(OrchestratorError::NoWorkersRemaining);
        }
        info!(
            "{} of {} worker(s) ready: {}",
            allocation.hostnames().len(),
            allocation.hostnames().len() + excluded.len(),
            allocation.hostnames().join(", ")
        );

        let commands = self.discover_commands(allocation)?;
        Ok(Coordinated { commands, excluded })
    }

    fn initialize_all(&self, allocation: &Allocation) -> Vec<(String, Result<()>)> {
        fan_out(allocation.hostnames(), |host| {
            self.node(host, allocation).initialize()
        })
    }

    /// Runs the list command on the first active worker.
    pub fn discover_commands(&self, allocation: &Allocation) -> Result<CommandList> {
        let host = allocation
            .hostnames()
            .first()
            .ok_or(OrchestratorError::NoWorkersRemaining)?;
        let node = self.node(host, allocation);
        let _entered = node.log().enter();
        let mut session = node.open_session()?;
        let listing = session.capture(&self.config.commands.list);
        session.close();
        let (status, output) = listing?;
        let commands = CommandList::parse(&output);
        if !status.is_success() || commands.is_empty() {
            return Err(OrchestratorError::RemoteCommand {
                host: host.clone(),
                command: self.config.commands.list.clone(),
                attempts: 1,
                detail: format!("listed {} command(s) with status {}", commands.len(), status),
            });
        }
        info!("Discovered {} benchmark command(s)", commands.len());
        for (i, command) in commands.iter().enumerate() {
            info!("  [{}] {}", i, command);
        }
        Ok(commands)
    }

    /// Runs every trial on every active worker, then collects their results.
    ///
    /// A failing worker does not affect its siblings; only an interrupt is
    /// returned as an error.
    pub fn run_all(
        &self,
        allocation: &Allocation,
        commands: &CommandList,
    ) -> Result<Vec<WorkerOutcome>> {
        let workdir = self.config.working_directory();
        let outcomes = fan_out(allocation.hostnames(), |host| {
            let node = self.node(host, allocation);
            let run = TrialRunner::new(&node).run(commands, self.config.trials.n_runs, &workdir)?;
            let collected = match node.collect() {
                Ok(c) => Some(c),
                Err(e) if e.is_interrupt() => return Err(e),
                Err(e) => {
                    warn!("could not collect results from {}: {}", host, e);
                    None
                }
            };
            Ok(WorkerResult { run, collected })
        });
        if self.interrupt.is_triggered() || outcomes.iter().any(|(_, r)| is_interrupt(r)) {
            return Err(OrchestratorError::Interrupted);
        }
        Ok(outcomes
            .into_iter()
            .map(|(host, result)| {
                if let Err(e) = &result {
                    error!("worker {} produced no results: {}", host, e);
                }
                WorkerOutcome { host, result }
            })
            .collect())
    }
}

fn is_interrupt<T>(result: &Result<T>) -> bool {
    matches!(result, Err(e) if e.is_interrupt())
}

/// One unit per host; a single host runs on the calling thread.
///
/// A panicking unit becomes [`OrchestratorError::WorkerPanicked`] either way.
fn fan_out<T, F>(hosts: &[String], unit: F) -> Vec<(String, Result<T>)>
where
    T: Send,
    F: Fn(&str) -> Result<T> + Sync,
{
    if let [host] = hosts {
        let result = panic::catch_unwind(AssertUnwindSafe(|| unit(host)))
            .unwrap_or_else(|_| Err(OrchestratorError::WorkerPanicked { host: host.clone() }));
        return vec![(host.clone(), result)];
    }
    thread::scope(|scope| {
        let unit = &unit;
        let handles: Vec<_> = hosts
            .iter()
            .map(|host| (host.clone(), scope.spawn(move || unit(host))))
            .collect();
        handles
            .into_iter()
            .map(|(host, handle)| {
                let result = handle
                    .join()
                    .unwrap_or_else(|_| Err(OrchestratorError::WorkerPanicked { host: host.clone() }));
                (host, result)
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fan_out_keeps_host_order_and_isolates_panics() {
        let hosts: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let results = fan_out(&hosts, |host| {
            if host == "b" {
                panic!("boom");
            }
            Ok(host.to_uppercase())
        });
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].0, "a");
        assert_eq!(results[0].1.as_ref().ok().map(String::as_str), Some("A"));
        assert!(matches!(
            results[1].1,
            Err(OrchestratorError::WorkerPanicked { .. })
        ));
        assert_eq!(results[2].1.as_ref().ok().map(String::as_str), Some("C"));
    }

    #[test]
    fn single_host_runs_inline() {
        let caller = thread::current().id();
        let results = fan_out(&["solo".to_string()], |_| Ok(thread::current().id()));
        assert_eq!(results[0].1.as_ref().ok(), Some(&caller));
    }

    #[test]
    fn single_host_panic_is_contained() {
        let results = fan_out(&["solo".to_string()], |host| -> Result<()> {
            panic!("{} lost its session", host)
        });
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "solo");
        assert!(matches!(
            &results[0].1,
            Err(OrchestratorError::WorkerPanicked { host }) if host == "solo"
        ));
    }
}
