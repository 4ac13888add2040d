//! Reflects `hubAcceptsClient` into the `HubAcceptedSpoke` condition
//!
//! The condition is derived state. It is computed from the flag on the same
//! copy of the record that gets written back, so a flag change that lands
//! between read and write turns into a conflict and a fresh read. The
//! record therefore never shows `HubAcceptedSpoke=True` next to
//! `hubAcceptsClient: false`.

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::crd::{set_condition, SpokeCluster};
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::store::{LabelSelector, ResourceStore};
use crate::Result;

/// Result of reconciling one record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The condition was written
    Updated,
    /// The condition already matched the flag
    Unchanged,
}

/// Counts from one pass over all records
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Records whose condition was written
    pub updated: usize,
    /// Records already in sync
    pub unchanged: usize,
    /// Records that failed to reconcile
    pub failed: usize,
}

/// Hub reconciler for SpokeCluster records
pub struct SpokeClusterReconciler {
    records: Arc<dyn ResourceStore<SpokeCluster>>,
    retry: RetryConfig,
}

impl SpokeClusterReconciler {
    /// Create with the default conflict budget.
    ///
    /// Against a Kubernetes API server `records` should write through the
    /// `status` subresource.
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

    /// Bring one record's `HubAcceptedSpoke` condition in line with its flag
    #[instrument(skip(self))]
    pub async fn reconcile(&self, name: &str) -> Result<ReconcileOutcome> {
        let records = &self.records;

        let outcome = retry_on_conflict(&self.retry, "reconcile_spoke_cluster", || async move {
            let mut record = records.get(name).await?;
            let desired = record.desired_acceptance_condition();

            let mut status = record.status.clone().unwrap_or_default();
            if !set_condition(&mut status.conditions, desired) {
                return Ok(ReconcileOutcome::Unchanged);
            }
            record.status = Some(status);

            records.update(&record).await?;
            Ok(ReconcileOutcome::Updated)
        })
        .await?;

        if outcome == ReconcileOutcome::Updated {
            info!("Updated HubAcceptedSpoke condition");
        }
        Ok(outcome)
    }

    /// Reconcile every record once.
    ///
    /// A failure on one record is logged and counted; it does not stop the
    /// pass. Only a failure to list is returned.
    pub async fn reconcile_all(&self) -> Result<ReconcileSummary> {
        let mut summary = ReconcileSummary::default();
        for record in self.records.list(&LabelSelector::everything()).await? {
            let name = record.name_any();
            match self.reconcile(&name).await {
                Ok(ReconcileOutcome::Updated) => summary.updated += 1,
                Ok(ReconcileOutcome::Unchanged) => summary.unchanged += 1,
                Err(e) => {
                    warn!(cluster = %name, error = %e, "Failed to reconcile spoke cluster");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Reconcile all records every `interval` until cancelled
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        info!(interval_ms = interval.as_millis(), "Spoke cluster reconciler started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.reconcile_all().await {
                Ok(summary) if summary.updated > 0 || summary.failed > 0 => {
                    debug!(?summary, "Reconcile pass complete")
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to list spoke clusters"),
            }
        }
        info!("Spoke cluster reconciler stopped");
    }
}
