//! Hub administrator acceptance of a spoke

use std::sync::Arc;

use tracing::{info, instrument};

use crate::crd::SpokeCluster;
use crate::poll::{poll_until, PollConfig, PollStatus};
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::store::ResourceStore;
use crate::Result;

/// Result of an acceptance request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptanceOutcome {
    /// This call set `hubAcceptsClient: true`
    Accepted,
    /// The flag was already true; nothing written
    AlreadyAccepted,
}

/// Flips `hubAcceptsClient` on registration records
pub struct HubAcceptance {
    records: Arc<dyn ResourceStore<SpokeCluster>>,
    retry: RetryConfig,
}

impl HubAcceptance {
    /// Create with the default conflict budget
    pub fn new(records: Arc<dyn ResourceStore<SpokeCluster>>) -> Self {
        Self {
            records,
            retry: RetryConfig::on_conflict(),
        }
    }

    /// Override the conflict budget
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Wait until the spoke has created its record
    #[instrument(skip(self, poll))]
    pub async fn wait_for_record(&self, name: &str, poll: &PollConfig) -> Result<SpokeCluster> {
        let records = &self.records;
        let description = format!("SpokeCluster {name:?} to be registered");

        poll_until(&description, poll, || async move {
            // NotFound is transient to poll_until and keeps the loop going
            records.get(name).await.map(PollStatus::Ready)
        })
        .await
    }

    /// Set `hubAcceptsClient: true` on the record.
    ///
    /// Concurrent callers are safe: whoever loses the write race re-reads,
    /// sees the flag already set and returns [`AcceptanceOutcome::AlreadyAccepted`].
    #[instrument(skip(self))]
    pub async fn accept(&self, name: &str) -> Result<AcceptanceOutcome> {
        let records = &self.records;

        let outcome = retry_on_conflict(&self.retry, "accept_spoke_cluster", || async move {
            let mut record = records.get(name).await?;
            if record.spec.hub_accepts_client {
                return Ok(AcceptanceOutcome::AlreadyAccepted);
            }
            record.spec.hub_accepts_client = true;
            records.update(&record).await?;
            Ok(AcceptanceOutcome::Accepted)
        })
        .await?;

        if outcome == AcceptanceOutcome::Accepted {
            info!("Spoke cluster accepted");
        }
        Ok(outcome)
    }
}
