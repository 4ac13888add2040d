//! Handshake timing configuration
//!
//! Every bound the handshake uses (poll intervals, deadlines, conflict
//! budgets) lives in [`HandshakeConfig`]. Defaults match the crate-level
//! constants; a YAML file can override any subset of them:
//!
//! ```yaml
//! pollIntervalSecs: 1
//! acceptanceTimeoutSecs: 30
//! conflictRetryAttempts: 8
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::poll::PollConfig;
use crate::retry::RetryConfig;
use crate::{
    Error, Result, DEFAULT_ACCEPTANCE_TIMEOUT, DEFAULT_CERTIFICATE_TIMEOUT,
    DEFAULT_CONFLICT_RETRY_ATTEMPTS, DEFAULT_CONFLICT_RETRY_DELAY, DEFAULT_CSR_TIMEOUT,
    DEFAULT_POLL_INTERVAL, DEFAULT_RECONCILE_INTERVAL, DEFAULT_RECORD_TIMEOUT,
};

/// Default reason written on approvals
pub const DEFAULT_APPROVAL_REASON: &str = "AutoApprovedByHubController";

/// Default message written on approvals
pub const DEFAULT_APPROVAL_MESSAGE: &str = "Approved bootstrap signing request for spoke cluster";

/// Upper bound on any configured interval or deadline (one week)
pub const MAX_DURATION_SECS: u64 = 7 * 24 * 60 * 60;

/// Timing and wording knobs for both sides of the handshake
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct HandshakeConfig {
    /// Interval between polls, in seconds
    pub poll_interval_secs: u64,
    /// Interval growth per poll (1.0 = fixed)
    pub poll_backoff_multiplier: f64,
    /// Cap on the poll interval when backing off, in seconds
    pub max_poll_interval_secs: u64,
    /// Hub wait for a spoke's signing request, in seconds
    pub csr_timeout_secs: u64,
    /// Spoke wait for its certificate, in seconds
    pub certificate_timeout_secs: u64,
    /// Hub wait for a spoke's registration record, in seconds
    pub record_timeout_secs: u64,
    /// Wait for `HubAcceptedSpoke=True`, in seconds
    pub acceptance_timeout_secs: u64,
    /// Attempts for each read-modify-write
    pub conflict_retry_attempts: u32,
    /// Delay between conflicting attempts, in milliseconds
    pub conflict_retry_delay_ms: u64,
    /// Hub reconciler loop interval, in seconds
    pub reconcile_interval_secs: u64,
    /// Reason written on approval conditions
    pub approval_reason: String,
    /// Message written on approval conditions
    pub approval_message: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
            poll_backoff_multiplier: 1.0,
            max_poll_interval_secs: DEFAULT_POLL_INTERVAL.as_secs(),
            csr_timeout_secs: DEFAULT_CSR_TIMEOUT.as_secs(),
            certificate_timeout_secs: DEFAULT_CERTIFICATE_TIMEOUT.as_secs(),
            record_timeout_secs: DEFAULT_RECORD_TIMEOUT.as_secs(),
            acceptance_timeout_secs: DEFAULT_ACCEPTANCE_TIMEOUT.as_secs(),
            conflict_retry_attempts: DEFAULT_CONFLICT_RETRY_ATTEMPTS,
            conflict_retry_delay_ms: DEFAULT_CONFLICT_RETRY_DELAY.as_millis() as u64,
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL.as_secs(),
            approval_reason: DEFAULT_APPROVAL_REASON.to_string(),
            approval_message: DEFAULT_APPROVAL_MESSAGE.to_string(),
        }
    }
}

impl HandshakeConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::serialization(format!("invalid handshake config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            Error::validation(format!("cannot read config {}: {e}", path.display()))
        })?;
        Self::from_yaml(&yaml)
    }

    /// Reject values that would make a loop spin or never run
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(Error::validation("pollIntervalSecs must be at least 1"));
        }
        if self.reconcile_interval_secs == 0 {
            return Err(Error::validation("reconcileIntervalSecs must be at least 1"));
        }
        if self.conflict_retry_attempts == 0 {
            return Err(Error::validation("conflictRetryAttempts must be at least 1"));
        }
        if !self.poll_backoff_multiplier.is_finite() || self.poll_backoff_multiplier < 1.0 {
            return Err(Error::validation("pollBackoffMultiplier must be >= 1.0"));
        }
        let bounded = [
            ("pollIntervalSecs", self.poll_interval_secs),
            ("maxPollIntervalSecs", self.max_poll_interval_secs),
            ("csrTimeoutSecs", self.csr_timeout_secs),
            ("certificateTimeoutSecs", self.certificate_timeout_secs),
            ("recordTimeoutSecs", self.record_timeout_secs),
            ("acceptanceTimeoutSecs", self.acceptance_timeout_secs),
            ("reconcileIntervalSecs", self.reconcile_interval_secs),
            ("conflictRetryDelayMs", self.conflict_retry_delay_ms / 1000),
        ];
        for (field, secs) in bounded {
            if secs > MAX_DURATION_SECS {
                return Err(Error::validation(format!(
                    "{field} must not exceed {MAX_DURATION_SECS} seconds"
                )));
            }
        }
        if self.approval_reason.trim().is_empty() {
            return Err(Error::validation("approvalReason must not be empty"));
        }
        Ok(())
    }

    fn poll(&self, timeout_secs: u64) -> PollConfig {
        let config = PollConfig::fixed(
            Duration::from_secs(self.poll_interval_secs),
            Duration::from_secs(timeout_secs),
        );
        if self.poll_backoff_multiplier > 1.0 {
            config.with_backoff(
                self.poll_backoff_multiplier,
                Duration::from_secs(self.max_poll_interval_secs),
            )
        } else {
            config
        }
    }

    /// Poll bounds for the hub waiting on a signing request
    pub fn csr_poll(&self) -> PollConfig {
        self.poll(self.csr_timeout_secs)
    }

    /// Poll bounds for the spoke waiting on its certificate
    pub fn certificate_poll(&self) -> PollConfig {
        self.poll(self.certificate_timeout_secs)
    }

    /// Poll bounds for the hub waiting on a registration record
    pub fn record_poll(&self) -> PollConfig {
        self.poll(self.record_timeout_secs)
    }

    /// Poll bounds for waiting on `HubAcceptedSpoke=True`
    pub fn acceptance_poll(&self) -> PollConfig {
        self.poll(self.acceptance_timeout_secs)
    }

    /// Budget for read-modify-write conflicts
    pub fn conflict_retry(&self) -> RetryConfig {
        RetryConfig::conflict_budget(
            self.conflict_retry_attempts,
            Duration::from_millis(self.conflict_retry_delay_ms),
        )
    }

    /// Hub reconciler interval
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }
}
