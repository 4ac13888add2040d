//! Waiting for the hub to accept the spoke

use std::sync::Arc;

use tracing::{info, instrument};

use crate::crd::SpokeCluster;
use crate::poll::{poll_until, PollConfig, PollStatus};
use crate::store::ResourceStore;
use crate::Result;

/// Polls the spoke's registration record until the hub reports
/// `HubAcceptedSpoke=True`
pub struct AcceptancePoller {
    records: Arc<dyn ResourceStore<SpokeCluster>>,
}

impl AcceptancePoller {
    /// Create a poller over the hub's SpokeCluster records
    pub fn new(records: Arc<dyn ResourceStore<SpokeCluster>>) -> Self {
        Self { records }
    }

    /// Wait for acceptance and return the record as last read.
    ///
    /// A missing record is expected early on and keeps the poll going. On
    /// timeout the error carries the last condition seen, or `absent`.
    #[instrument(skip(self, poll))]
    pub async fn wait_for_acceptance(
        &self,
        cluster_name: &str,
        poll: &PollConfig,
    ) -> Result<SpokeCluster> {
        let records = &self.records;
        let description = format!("SpokeCluster {cluster_name:?} to be accepted");

        let record = poll_until(&description, poll, || async move {
            match records.get(cluster_name).await {
                Ok(record) if record.is_accepted() => Ok(PollStatus::Ready(record)),
                Ok(record) => Ok(PollStatus::Pending(record.acceptance_summary())),
                Err(e) if e.is_not_found() => Ok(PollStatus::Pending("absent".to_string())),
                Err(e) => Err(e),
            }
        })
        .await?;

        info!("Hub accepted spoke cluster");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{set_condition, SpokeClusterStatus};
    use crate::store::InMemoryStore;
    use crate::Error;
    use kube::core::ErrorResponse;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    fn poll() -> PollConfig {
        PollConfig::fixed(Duration::from_secs(1), Duration::from_secs(10))
    }

    async fn accept(store: &InMemoryStore<SpokeCluster>, name: &str) {
        let mut record = store.get(name).await.unwrap();
        record.spec.hub_accepts_client = true;
        let condition = record.desired_acceptance_condition();
        let status = record.status.get_or_insert_with(SpokeClusterStatus::default);
        set_condition(&mut status.conditions, condition);
        store.update(&record).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_accepted_returns_immediately() {
        let store = Arc::new(InMemoryStore::<SpokeCluster>::new());
        store.create(&SpokeCluster::pending("edge-1")).await.unwrap();
        accept(&store, "edge-1").await;

        let start = Instant::now();
        let record = AcceptancePoller::new(store)
            .wait_for_acceptance("edge-1", &poll())
            .await
            .unwrap();

        assert!(record.is_accepted());
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    /// Story: The spoke waits through "not created yet" and "not accepted yet"
    #[tokio::test(start_paused = true)]
    async fn story_poller_tolerates_missing_record_then_sees_acceptance() {
        let store = Arc::new(InMemoryStore::<SpokeCluster>::new());
        let poller = AcceptancePoller::new(store.clone());

        let hub = {
            let store = store.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(2)).await;
                store.create(&SpokeCluster::pending("edge-1")).await.unwrap();
                tokio::time::sleep(Duration::from_secs(3)).await;
                accept(&store, "edge-1").await;
            }
        };

        let poll = poll();
        let start = Instant::now();
        let (result, ()) = tokio::join!(poller.wait_for_acceptance("edge-1", &poll), hub);

        assert!(result.unwrap().is_accepted());
        assert!(start.elapsed() <= Duration::from_secs(6));
    }

    /// Story: An unaccepted spoke times out at the deadline with the denial visible
    #[tokio::test(start_paused = true)]
    async fn story_unaccepted_record_times_out_with_last_condition() {
        let store = Arc::new(InMemoryStore::<SpokeCluster>::new());
        let mut record = store.create(&SpokeCluster::pending("edge-1")).await.unwrap();
        let condition = record.desired_acceptance_condition();
        record.status = Some(SpokeClusterStatus {
            conditions: vec![condition],
        });
        store.update(&record).await.unwrap();

        let start = Instant::now();
        let result = AcceptancePoller::new(store)
            .wait_for_acceptance("edge-1", &poll())
            .await;

        assert_eq!(start.elapsed(), Duration::from_secs(10));
        match result {
            Err(Error::Timeout { last_observed, .. }) => {
                assert_eq!(last_observed, "HubAcceptedSpoke=False (HubClusterAdminDenied)")
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_record_reports_absent() {
        let store = Arc::new(InMemoryStore::<SpokeCluster>::new());

        match AcceptancePoller::new(store)
            .wait_for_acceptance("edge-1", &poll())
            .await
        {
            Err(Error::Timeout { last_observed, .. }) => assert_eq!(last_observed, "absent"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    /// Store whose reads fail with a fixed API error
    struct FailingStore {
        code: u16,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl ResourceStore<SpokeCluster> for FailingStore {
        async fn create(&self, _: &SpokeCluster) -> Result<SpokeCluster> {
            unreachable!()
        }
        async fn get(&self, _: &str) -> Result<SpokeCluster> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Kube(kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: "injected".to_string(),
                reason: "Injected".to_string(),
                code: self.code,
            })))
        }
        async fn list(&self, _: &crate::store::LabelSelector) -> Result<Vec<SpokeCluster>> {
            unreachable!()
        }
        async fn update(&self, _: &SpokeCluster) -> Result<SpokeCluster> {
            unreachable!()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_are_retried_until_deadline() {
        let store = Arc::new(FailingStore {
            code: 503,
            calls: AtomicU32::new(0),
        });

        let result = AcceptancePoller::new(store.clone())
            .wait_for_acceptance("edge-1", &poll())
            .await;

        assert!(matches!(result, Err(Error::Timeout { .. })));
        assert!(store.calls.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forbidden_ends_poll_immediately() {
        let store = Arc::new(FailingStore {
            code: 403,
            calls: AtomicU32::new(0),
        });

        let result = AcceptancePoller::new(store.clone())
            .wait_for_acceptance("edge-1", &poll())
            .await;

        assert!(matches!(result, Err(Error::Kube(_))));
        assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    }
}
