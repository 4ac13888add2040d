//! Bounded retry for read-modify-write cycles
//!
//! [`retry_on_error`] retries only errors matching a predicate and returns
//! every other error immediately. [`retry_on_conflict`] is the
//! read-modify-write flavour: it retries optimistic-concurrency conflicts
//! and reports [`Error::ConflictExhausted`] once the budget is spent.
//!
//! The closure passed to [`retry_on_conflict`] must re-read the object on
//! every attempt and re-check any idempotent precondition (for example "the
//! signing request is already terminal") before mutating it.
//!
//! # Example
//!
//! ```ignore
//! use registration::retry::{retry_on_conflict, RetryConfig};
//!
//! let record = retry_on_conflict(&RetryConfig::on_conflict(), "accept_spoke_cluster", || async {
//!     let mut record = store.get("edge-1").await?;
//!     record.spec.hub_accepts_client = true;
//!     store.update(&record).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::Error;
use crate::{DEFAULT_CONFLICT_RETRY_ATTEMPTS, DEFAULT_CONFLICT_RETRY_DELAY};

/// Attempt budget and delay curve for a retried operation
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, at least 1
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Bounded, flat-interval budget for read-modify-write conflicts:
    /// five attempts roughly 10ms apart.
    pub fn on_conflict() -> Self {
        Self::conflict_budget(DEFAULT_CONFLICT_RETRY_ATTEMPTS, DEFAULT_CONFLICT_RETRY_DELAY)
    }

    /// Conflict budget with an explicit attempt count and flat delay
    pub fn conflict_budget(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts.max(1),
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::try_from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
        .unwrap_or(self.max_delay)
    }

    fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Add jitter: 0.5x to 1.5x of the delay
fn jittered(delay: Duration) -> Duration {
    let jitter = rand::thread_rng().gen_range(0.5..1.5);
    Duration::try_from_secs_f64(delay.as_secs_f64() * jitter).unwrap_or(delay)
}

/// Retry an operation only while its error matches `is_retriable`.
///
/// Non-matching errors return immediately. When the attempt budget runs
/// out the last (retriable) error is returned.
pub async fn retry_on_error<F, Fut, T, P>(
    config: &RetryConfig,
    operation_name: &str,
    is_retriable: P,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
    P: Fn(&Error) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !is_retriable(&e) => return Err(e),
            Err(e) => {
                if config.exhausted(attempt) {
                    warn!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Retry budget exhausted"
                    );
                    return Err(e);
                }

                let jittered_delay = jittered(delay);
                debug!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Retriable error, retrying"
                );

                tokio::time::sleep(jittered_delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

/// Run a read-modify-write operation, restarting it on resource-version
/// conflicts.
///
/// Exceeding the budget yields [`Error::ConflictExhausted`]. Every other
/// error propagates unchanged on first occurrence.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    match retry_on_error(config, operation_name, Error::is_conflict, operation).await {
        Err(e) if e.is_conflict() => Err(Error::ConflictExhausted {
            operation: operation_name.to_string(),
            attempts: config.max_attempts,
        }),
        other => other,
    }
}
