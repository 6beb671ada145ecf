//! Shared retry policy for remote and local primitives.

use std::fmt::Display;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::Result;
use crate::interrupt::Interrupt;

/// Outcome of one attempt as seen by the policy.
pub enum Attempt<T, E> {
    Done(T),
    Retryable(E),
    Fatal(E),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Runs `op` until it finishes, hits a fatal error, or the budget runs out.
    ///
    /// `op` receives the 1-based attempt number. The last error is returned
    /// together with the number of attempts spent.
    pub fn run<T, E, F>(
        &self,
        what: &str,
        interrupt: &Interrupt,
        mut op: F,
    ) -> Result<std::result::Result<T, (E, u32)>>
    where
        E: Display,
        F: FnMut(u32) -> Attempt<T, E>,
    {
        let mut attempt = 0;
        loop {
            interrupt.check()?;
            attempt += 1;
            match op(attempt) {
                Attempt::Done(value) => return Ok(Ok(value)),
                Attempt::Fatal(err) => return Ok(Err((err, attempt))),
                Attempt::Retryable(err) => {
                    warn!(
                        "{} failed (attempt {} of {}): {}",
                        what, attempt, self.max_attempts, err
                    );
                    if attempt >= self.max_attempts {
                        return Ok(Err((err, attempt)));
                    }
                    info!("retrying {} in {:?}", what, self.delay);
                    interrupt.sleep(self.delay)?;
                }
            }
        }
    }
}
