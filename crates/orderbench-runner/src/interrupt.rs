//! Process-wide cancellation flag.
//!
//! The CLI trips the flag from its Ctrl-C handler; every concurrent unit
//! polls it between commands and while sleeping, so an operator interrupt
//! ends the whole run rather than a single worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{OrchestratorError, Result};

const SLEEP_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            Err(OrchestratorError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Sleeps for `duration`, waking early with `Interrupted` if the flag trips.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            self.check()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep((deadline - now).min(SLEEP_SLICE));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sleep_returns_immediately() {
        let interrupt = Interrupt::new();
        interrupt.sleep(Duration::ZERO).expect("no interrupt");
    }

    #[test]
    fn triggered_flag_is_shared_by_clones() {
        let interrupt = Interrupt::new();
        let clone = interrupt.clone();
        clone.trigger();
        assert!(interrupt.is_triggered());
        let err = interrupt
            .sleep(Duration::from_secs(60))
            .expect_err("sleep must abort");
        assert!(err.is_interrupt());
    }
}
