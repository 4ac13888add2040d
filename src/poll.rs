//! Bounded polling
//!
//! Every "wait for X" in the handshake (the signing request to appear, the
//! certificate to be issued, the registration record to exist, the hub to
//! accept the spoke) goes through [`poll_until`]. The check closure reports
//! either a ready value or a short description of what it observed; that
//! description becomes the `last_observed` field of [`Error::Timeout`].
//!
//! Polling never times out before the deadline: a final check always runs
//! at or after it. Callers cancel by dropping the returned future between
//! checks.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::error::Error;
use crate::{DEFAULT_ACCEPTANCE_TIMEOUT, DEFAULT_POLL_INTERVAL};

/// Deadline used when `timeout` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Result of a single poll check
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PollStatus<T> {
    /// Desired state reached
    Ready(T),
    /// Not there yet; the string describes what was observed
    Pending(String),
}

/// Interval and deadline for a poll loop
#[derive(Clone, Debug, PartialEq)]
pub struct PollConfig {
    /// Delay between the first checks
    pub interval: Duration,
    /// Wall-clock deadline measured from the first check
    pub timeout: Duration,
    /// Interval growth per check (1.0 = fixed interval)
    pub backoff_multiplier: f64,
    /// Upper bound on the interval when backing off
    pub max_interval: Duration,
}

impl PollConfig {
    /// Poll at a fixed interval until the timeout
    pub fn fixed(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            backoff_multiplier: 1.0,
            max_interval: interval,
        }
    }

    /// Grow the interval geometrically, capped at `max_interval`
    pub fn with_backoff(mut self, multiplier: f64, max_interval: Duration) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self.max_interval = max_interval.max(self.interval);
        self
    }

    fn next_interval(&self, current: Duration) -> Duration {
        Duration::try_from_secs_f64(
            (current.as_secs_f64() * self.backoff_multiplier).min(self.max_interval.as_secs_f64()),
        )
        .unwrap_or(self.max_interval)
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::fixed(DEFAULT_POLL_INTERVAL, DEFAULT_ACCEPTANCE_TIMEOUT)
    }
}

/// Poll until `check` reports [`PollStatus::Ready`] or the deadline passes.
///
/// Transient errors (see [`Error::is_transient`]) are recorded and retried;
/// any other error ends the poll immediately.
///
/// # Arguments
/// * `description` - What is being waited for, used in logs and the timeout error
/// * `config` - Interval and deadline
/// * `check` - One observation of the world
pub async fn poll_until<T, F, Fut>(
    description: &str,
    config: &PollConfig,
    mut check: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<PollStatus<T>, Error>>,
{
    let start = Instant::now();
    let deadline = start
        .checked_add(config.timeout)
        .unwrap_or_else(|| start + FAR_FUTURE);
    let mut interval = config.interval;
    let mut last_observed = String::from("nothing observed");
    let mut last_error: Option<String> = None;

    loop {
        match check().await {
            Ok(PollStatus::Ready(value)) => return Ok(value),
            Ok(PollStatus::Pending(observed)) => {
                trace!(description, observed = %observed, "Condition not yet met");
                last_observed = observed;
                last_error = None;
            }
            Err(e) if e.is_transient() => {
                trace!(description, error = %e, "Transient error while polling, retrying");
                last_error = Some(e.to_string());
            }
            Err(e) => return Err(e),
        }

        let now = Instant::now();
        if now >= deadline {
            let last_observed = match last_error {
                Some(error) => format!("{last_observed}; then error: {error}"),
                None => last_observed,
            };
            return Err(Error::Timeout {
                description: description.to_string(),
                elapsed: now - start,
                last_observed,
            });
        }

        tokio::time::sleep(interval.min(deadline - now)).await;
        interval = config.next_interval(interval);
    }
}
