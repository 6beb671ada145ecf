//! Trial Runner: repeated fixed/random passes over the command list on one node.

use std::time::{Duration, Instant};

use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::instrumentation;
use crate::model::{CommandExecution, CommandList, CompletionStatus, OrderType, Trial};
use crate::node::NodeController;

/// Everything one node produced, including a note when it stopped early.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub executions: Vec<CommandExecution>,
    pub trials: Vec<Trial>,
    pub seed: u64,
    pub stopped_early: Option<String>,
}

/// With interleaving, loops alternate starting with fixed; otherwise the
/// first `n_loops` are fixed and the rest random.
pub fn order_type_for(x: u32, n_loops: u32, interleave: bool) -> OrderType {
    let fixed = if interleave { x % 2 == 0 } else { x < n_loops };
    if fixed {
        OrderType::Fixed
    } else {
        OrderType::Random
    }
}

pub fn loop_seed(base: u64, x: u32) -> u64 {
    base.wrapping_add(u64::from(x))
}

/// Permutation of `0..len` drawn from `seed`.
pub fn shuffled_order(len: usize, seed: u64) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(&mut StdRng::seed_from_u64(seed));
    order
}

pub fn wall_clock_seed() -> u64 {
    Utc::now().timestamp().unsigned_abs()
}

/// Rolling average of loop durations.
#[derive(Debug, Clone, Default)]
pub struct ProgressEstimator {
    elapsed: Duration,
    completed: u32,
}

impl ProgressEstimator {
    pub fn record(&mut self, loop_duration: Duration) {
        self.elapsed += loop_duration;
        self.completed += 1;
    }

    pub fn average(&self) -> Option<Duration> {
        (self.completed > 0).then(|| self.elapsed / self.completed)
    }

    pub fn remaining(&self, loops_left: u32) -> Option<Duration> {
        self.average().map(|avg| avg * loops_left)
    }
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

pub struct TrialRunner<'n, 'a> {
    node: &'n NodeController<'a>,
    seed: u64,
    interleave: bool,
}

impl<'n, 'a> TrialRunner<'n, 'a> {
    /// Seeds from the configuration, falling back to the wall clock.
    pub fn new(node: &'n NodeController<'a>) -> Self {
        let trials = &node.config().trials;
        Self {
            node,
            seed: trials.seed.unwrap_or_else(wall_clock_seed),
            interleave: trials.interleave,
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Runs `n_loops * 2` trials of `commands` inside `working_directory`.
    ///
    /// Command failures are recorded, never raised. A failed reset or a lost
    /// connection ends the run early with whatever has been collected. Only
    /// an interrupt, or a loop count that overflows `u32`, is returned as an
    /// error.
    pub fn run(
        &self,
        commands: &CommandList,
        n_loops: u32,
        working_directory: &str,
    ) -> Result<RunOutput> {
        let node = self.node;
        let host = node.host();
        let interrupt = node.interrupt();
        let _entered = node.log().enter();

        let total = n_loops.checked_mul(2).ok_or_else(|| {
            OrchestratorError::Config(format!(
                "trials.n_runs: {} repetitions overflow the loop count",
                n_loops
            ))
        })?;
        let prefix = instrumentation::command_prefix(node.profiles());
        let mut out = RunOutput {
            seed: self.seed,
            ..RunOutput::default()
        };
        let mut progress = ProgressEstimator::default();
        info!("Running {} trial(s) on {} with seed {}", total, host, self.seed);

        for x in 0..total {
            interrupt.check()?;
            if let Some(left) = progress.remaining(total - x) {
                info!("Estimated time remaining: {}", format_duration(left));
            }
            let loop_started = Instant::now();

            let order_type = order_type_for(x, n_loops, self.interleave);
            let (order, seed) = match order_type {
                OrderType::Fixed => ((0..commands.len()).collect::<Vec<_>>(), None),
                OrderType::Random => {
                    let seed = loop_seed(self.seed, x);
                    (shuffled_order(commands.len(), seed), Some(seed))
                }
            };

            let mut session = match node.open_session() {
                Ok(session) => session,
                Err(e) if e.is_interrupt() => return Err(e),
                Err(e) => {
                    error!("cannot open session for trial {} on {}: {}", x, host, e);
                    out.stopped_early = Some(format!("trial {}: {}", x, e));
                    break;
                }
            };

            let trial_id = Uuid::now_v7();
            let trial_started = Utc::now();
            info!("Starting {} order trial {} of {}", order_type, x + 1, total);
            for (position, &index) in order.iter().enumerate() {
                if let Err(e) = interrupt.check() {
                    session.close();
                    return Err(e);
                }
                let command = commands.get(index).unwrap_or_default();
                let full = match &prefix {
                    Some(p) => format!("{} && cd {} && {}", p, working_directory, command),
                    None => format!("cd {} && {}", working_directory, command),
                };
                let started_at = Utc::now();
                let status = match session.execute(&full) {
                    Ok(status) => status,
                    Err(e) if e.is_interrupt() => {
                        session.close();
                        return Err(e);
                    }
                    Err(e) => {
                        error!("{} failed on {}: {}", command, host, e);
                        CompletionStatus::Failure
                    }
                };
                out.executions.push(CommandExecution {
                    trial_id,
                    hostname: host.to_string(),
                    trial_index: x,
                    total_trials: total,
                    command: command.to_string(),
                    command_index: index,
                    position,
                    order_type,
                    started_at,
                    finished_at: Utc::now(),
                    completion_status: status,
                    result: None,
                });
            }
            out.trials.push(Trial {
                trial_id,
                hostname: host.to_string(),
                index: x,
                total,
                order_type,
                seed,
                started_at: trial_started,
                finished_at: Utc::now(),
            });

            let reset = node.reset(&mut session);
            session.close();
            match reset {
                Ok(()) => {}
                Err(e) if e.is_interrupt() => return Err(e),
                Err(e) => {
                    warn!(
                        "reset failed on {}; ending run after {} of {} trial(s): {}",
                        host,
                        out.trials.len(),
                        total,
                        e
                    );
                    out.stopped_early = Some(e.to_string());
                    break;
                }
            }
            progress.record(loop_started.elapsed());
        }
        info!(
            "{} finished {} trial(s), {} command execution(s)",
            host,
            out.trials.len(),
            out.executions.len()
        );
        Ok(out)
    }
}
