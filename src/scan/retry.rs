//! Retry policy for failed line scans and the operator confirmation seam.

use crate::config::RetrySettings;
use crate::error::DaqError;
use async_trait::async_trait;
use std::io::{BufRead, Write};
use std::time::Duration;

/// How failed line scans are retried.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Ask the operator after every this many consecutive failures.
    pub confirm_every: u32,
    /// The delay between retry attempts.
    pub backoff_delay: Duration,
}

impl RetryPolicy {
    /// Policy from the `retry` settings section.
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            confirm_every: settings.confirm_every,
            backoff_delay: Duration::from_millis(settings.backoff_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            confirm_every: 5,
            backoff_delay: Duration::ZERO,
        }
    }
}

/// Consecutive failures of one grid cell.
#[derive(Clone, Debug)]
pub struct RetryBudget {
    confirm_every: u32,
    failures: u32,
}

impl RetryBudget {
    /// Empty budget for one cell.
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            confirm_every: policy.confirm_every,
            failures: 0,
        }
    }

    /// Count one more failure and return the total.
    pub fn record_failure(&mut self) -> u32 {
        self.failures += 1;
        self.failures
    }

    /// Failures so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// True right after every `confirm_every`-th failure.
    pub fn needs_confirmation(&self) -> bool {
        self.confirm_every > 0 && self.failures > 0 && self.failures % self.confirm_every == 0
    }
}

/// Asks whether a repeatedly failing line should be attempted again.
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// `true` to keep retrying, `false` to abort the sweep.
    async fn confirm_retry(&self, failures: u32, error: &DaqError) -> bool;
}

/// Interpret an answer to a `[Y/n]` question; empty means yes.
pub fn parse_answer(answer: &str) -> bool {
    let answer = answer.trim();
    answer.is_empty() || answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes")
}

/// Prompts on the terminal.
///
/// End of input counts as a refusal so an unattended run cannot loop forever.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPrompt;

#[async_trait]
impl OperatorPrompt for StdinPrompt {
    async fn confirm_retry(&self, failures: u32, error: &DaqError) -> bool {
        let question = format!(
            "Line scan failed {} times in a row (last error: {}). Continue? [Y/n] ",
            failures, error
        );
        let answer = tokio::task::spawn_blocking(move || {
            let mut stdout = std::io::stdout();
            write!(stdout, "{}", question).ok()?;
            stdout.flush().ok()?;
            let mut line = String::new();
            match std::io::stdin().lock().read_line(&mut line) {
                Ok(0) | Err(_) => None,
                Ok(_) => Some(line),
            }
        })
        .await
        .ok()
        .flatten();

        answer.map(|a| parse_answer(&a)).unwrap_or(false)
    }
}
