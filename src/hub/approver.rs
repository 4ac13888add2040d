//! Signing request approval
//!
//! The coordinator works over every request carrying a cluster's label.
//! Approval is idempotent: a request that already has an `Approved` or
//! `Denied` condition is left alone, and that check is repeated on every
//! conflict retry so two coordinators racing on the same request leave
//! exactly one terminal condition behind.

use std::sync::Arc;

use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::ResourceExt;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info, instrument, warn};

use crate::bootstrap::BOOTSTRAP_USER_PREFIX;
use crate::config::{DEFAULT_APPROVAL_MESSAGE, DEFAULT_APPROVAL_REASON};
use crate::csr::{self, TerminalState, CONDITION_APPROVED, CONDITION_DENIED};
use crate::pki::{cluster_from_common_name, csr_common_name};
use crate::poll::{poll_until, PollConfig, PollStatus};
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::store::{LabelSelector, ResourceStore};
use crate::{Result, CLUSTER_NAME_LABEL};

/// What a policy wants done with a pending request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Append an `Approved` condition
    Approve,
    /// Append a `Denied` condition
    Deny {
        /// Machine-readable reason
        reason: String,
        /// Human-readable message
        message: String,
    },
}

impl PolicyDecision {
    fn deny(reason: &str, message: impl Into<String>) -> Self {
        Self::Deny {
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

/// Decides on pending signing requests
#[cfg_attr(test, automock)]
pub trait ApprovalPolicy: Send + Sync {
    /// Evaluate a non-terminal request
    fn evaluate(&self, request: &CertificateSigningRequest) -> PolicyDecision;
}

/// Approves every request
pub struct ApproveAll;

impl ApprovalPolicy for ApproveAll {
    fn evaluate(&self, _: &CertificateSigningRequest) -> PolicyDecision {
        PolicyDecision::Approve
    }
}

/// Approves requests submitted with a bootstrap token whose subject names
/// the labeled cluster
pub struct BootstrapRequesterPolicy;

impl ApprovalPolicy for BootstrapRequesterPolicy {
    fn evaluate(&self, request: &CertificateSigningRequest) -> PolicyDecision {
        let Some(cluster) = csr::cluster_name(request) else {
            return PolicyDecision::deny("MissingClusterLabel", "request has no cluster label");
        };

        match csr::requester(request) {
            Some(user) if user.starts_with(BOOTSTRAP_USER_PREFIX) => {}
            other => {
                return PolicyDecision::deny(
                    "UnknownRequester",
                    format!("requester {other:?} is not a bootstrap identity"),
                )
            }
        }

        let subject = csr::request_pem(request)
            .ok()
            .and_then(|pem| csr_common_name(&pem).ok());
        match subject.as_deref().and_then(cluster_from_common_name) {
            Some(named) if named == cluster => PolicyDecision::Approve,
            _ => PolicyDecision::deny(
                "SubjectMismatch",
                format!("request subject {subject:?} does not name cluster {cluster:?}"),
            ),
        }
    }
}

/// Result of one approval attempt
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// This call wrote the terminal condition
    Applied(TerminalState),
    /// The request was already terminal; nothing written
    Skipped(TerminalState),
}

impl ApprovalOutcome {
    /// Terminal state of the request after the call
    pub fn state(&self) -> &TerminalState {
        match self {
            Self::Applied(s) | Self::Skipped(s) => s,
        }
    }
}

/// Approves (or denies) a spoke's signing requests
pub struct ApprovalCoordinator {
    requests: Arc<dyn ResourceStore<CertificateSigningRequest>>,
    policy: Arc<dyn ApprovalPolicy>,
    retry: RetryConfig,
    reason: String,
    message: String,
}

impl ApprovalCoordinator {
    /// Create a coordinator with the default conflict budget and wording
    pub fn new(
        requests: Arc<dyn ResourceStore<CertificateSigningRequest>>,
        policy: Arc<dyn ApprovalPolicy>,
    ) -> Self {
        Self {
            requests,
            policy,
            retry: RetryConfig::on_conflict(),
            reason: DEFAULT_APPROVAL_REASON.to_string(),
            message: DEFAULT_APPROVAL_MESSAGE.to_string(),
        }
    }

    /// Override the conflict budget
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Override the reason and message written on approvals
    pub fn with_reason(mut self, reason: impl Into<String>, message: impl Into<String>) -> Self {
        self.reason = reason.into();
        self.message = message.into();
        self
    }

    /// Wait until at least one request for `cluster_name` exists
    #[instrument(skip(self, poll))]
    pub async fn wait_for_requests(
        &self,
        cluster_name: &str,
        poll: &PollConfig,
    ) -> Result<Vec<CertificateSigningRequest>> {
        let requests = &self.requests;
        let selector = LabelSelector::eq(CLUSTER_NAME_LABEL, cluster_name);
        let selector = &selector;
        let description = format!("signing request for cluster {cluster_name:?}");

        poll_until(&description, poll, || async move {
            let found = requests.list(selector).await?;
            Ok(if found.is_empty() {
                PollStatus::Pending("no matching signing requests".to_string())
            } else {
                PollStatus::Ready(found)
            })
        })
        .await
    }

    /// Run [`approve`](Self::approve) on every request for `cluster_name`.
    ///
    /// Stops at the first failure; requests already handled keep their
    /// conditions.
    #[instrument(skip(self))]
    pub async fn approve_cluster(
        &self,
        cluster_name: &str,
    ) -> Result<Vec<(String, ApprovalOutcome)>> {
        let selector = LabelSelector::eq(CLUSTER_NAME_LABEL, cluster_name);
        let mut outcomes = Vec::new();
        for request in self.requests.list(&selector).await? {
            let name = request.name_any();
            let outcome = self.approve(&name).await?;
            outcomes.push((name, outcome));
        }
        Ok(outcomes)
    }

    /// Decide on one request.
    ///
    /// Missing requests are [`Error::NotFound`](crate::Error::NotFound); the
    /// caller is expected to know the request exists.
    #[instrument(skip(self))]
    pub async fn approve(&self, name: &str) -> Result<ApprovalOutcome> {
        let requests = &self.requests;
        let policy = self.policy.as_ref();
        let (reason, message) = (self.reason.as_str(), self.message.as_str());

        let outcome = retry_on_conflict(&self.retry, "approve_signing_request", || async move {
            let mut request = requests.get(name).await?;

            if let Some(state) = csr::terminal_state(&request) {
                debug!(state = %state, "Request already terminal");
                return Ok(ApprovalOutcome::Skipped(state));
            }

            let state = match policy.evaluate(&request) {
                PolicyDecision::Approve => {
                    csr::append_condition(&mut request, CONDITION_APPROVED, reason, message);
                    TerminalState::Approved
                }
                PolicyDecision::Deny { reason, message } => {
                    csr::append_condition(&mut request, CONDITION_DENIED, &reason, &message);
                    TerminalState::Denied { reason }
                }
            };

            requests.update(&request).await?;
            Ok(ApprovalOutcome::Applied(state))
        })
        .await?;

        match &outcome {
            ApprovalOutcome::Applied(TerminalState::Approved) => info!("Approved signing request"),
            ApprovalOutcome::Applied(state) => warn!(state = %state, "Denied signing request"),
            ApprovalOutcome::Skipped(_) => {}
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::AgentCertRequest;
    use k8s_openapi::api::certificates::v1::CertificateSigningRequestCondition;
    use crate::store::InMemoryStore;
    use crate::Error;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    type Requests = InMemoryStore<CertificateSigningRequest>;

    async fn submit(store: &Requests, cluster: &str, subject_cluster: &str) -> String {
        let request = AgentCertRequest::new(subject_cluster).unwrap();
        let csr = csr::build_signing_request(
            cluster,
            request.csr_pem(),
            Some("system:bootstrap:abcdef"),
        );
        store.create(&csr).await.unwrap().name_any()
    }

    fn approve_all(store: Arc<dyn ResourceStore<CertificateSigningRequest>>) -> ApprovalCoordinator {
        ApprovalCoordinator::new(store, Arc::new(ApproveAll))
    }

    // ==========================================================================
    // Story: Idempotent approval
    //
    // However many times, and from however many coordinators, a request is
    // approved, it ends up with exactly one terminal condition.
    // ==========================================================================

    #[tokio::test]
    async fn story_approving_twice_leaves_one_condition() {
        let store = Arc::new(Requests::new());
        let name = submit(&store, "edge-1", "edge-1").await;
        let coordinator = approve_all(store.clone());

        let first = coordinator.approve(&name).await.unwrap();
        let second = coordinator.approve(&name).await.unwrap();

        assert_eq!(first, ApprovalOutcome::Applied(TerminalState::Approved));
        assert_eq!(second, ApprovalOutcome::Skipped(TerminalState::Approved));

        let request = store.get(&name).await.unwrap();
        assert_eq!(csr::terminal_condition_count(&request), 1);
    }

    /// Yields after every read so joined coordinators interleave between
    /// their read and their write
    struct YieldingStore {
        inner: Arc<Requests>,
        updates: AtomicU32,
    }

    #[async_trait]
    impl ResourceStore<CertificateSigningRequest> for YieldingStore {
        async fn create(&self, o: &CertificateSigningRequest) -> Result<CertificateSigningRequest> {
            self.inner.create(o).await
        }
        async fn get(&self, name: &str) -> Result<CertificateSigningRequest> {
            let request = self.inner.get(name).await;
            tokio::task::yield_now().await;
            request
        }
        async fn list(&self, s: &LabelSelector) -> Result<Vec<CertificateSigningRequest>> {
            self.inner.list(s).await
        }
        async fn update(&self, o: &CertificateSigningRequest) -> Result<CertificateSigningRequest> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            self.inner.update(o).await
        }
    }

    #[tokio::test]
    async fn story_concurrent_coordinators_leave_one_condition() {
        let inner = Arc::new(Requests::new());
        let name = submit(&inner, "edge-1", "edge-1").await;
        let store = Arc::new(YieldingStore {
            inner: inner.clone(),
            updates: AtomicU32::new(0),
        });
        let a = approve_all(store.clone());
        let b = approve_all(store.clone());

        let (ra, rb) = tokio::join!(a.approve(&name), b.approve(&name));
        let outcomes = [ra.unwrap(), rb.unwrap()];

        // Both read the pending request before either wrote, so the loser
        // hit a conflict and re-read
        assert_eq!(store.updates.load(Ordering::SeqCst), 2);

        let applied = outcomes
            .iter()
            .filter(|o| matches!(o, ApprovalOutcome::Applied(_)))
            .count();
        assert_eq!(applied, 1);
        assert_eq!(
            csr::terminal_condition_count(&inner.get(&name).await.unwrap()),
            1
        );
    }

    #[tokio::test]
    async fn story_denied_request_stays_denied() {
        let store = Arc::new(Requests::new());
        let name = submit(&store, "edge-1", "edge-1").await;

        let mut request = store.get(&name).await.unwrap();
        csr::append_condition(&mut request, CONDITION_DENIED, "AdminDenied", "no");
        store.update(&request).await.unwrap();

        let mut policy = MockApprovalPolicy::new();
        policy.expect_evaluate().times(0);
        let coordinator = ApprovalCoordinator::new(store.clone(), Arc::new(policy));

        let outcome = coordinator.approve(&name).await.unwrap();
        assert_eq!(
            outcome,
            ApprovalOutcome::Skipped(TerminalState::Denied {
                reason: "AdminDenied".to_string()
            })
        );

        let request = store.get(&name).await.unwrap();
        assert_eq!(csr::terminal_condition_count(&request), 1);
        assert!(matches!(
            csr::terminal_state(&request),
            Some(TerminalState::Denied { .. })
        ));
    }

    #[tokio::test]
    async fn test_denied_condition_without_true_status_is_not_overridden() {
        let store = Arc::new(Requests::new());
        let name = submit(&store, "edge-1", "edge-1").await;

        let mut request = store.get(&name).await.unwrap();
        request
            .status
            .get_or_insert_with(Default::default)
            .conditions
            .get_or_insert_with(Vec::new)
            .push(CertificateSigningRequestCondition {
                type_: CONDITION_DENIED.to_string(),
                status: String::new(),
                reason: Some("AdminDenied".to_string()),
                ..Default::default()
            });
        store.update(&request).await.unwrap();

        let outcome = approve_all(store.clone()).approve(&name).await.unwrap();
        assert!(matches!(
            outcome,
            ApprovalOutcome::Skipped(TerminalState::Denied { .. })
        ));

        let request = store.get(&name).await.unwrap();
        let types: Vec<_> = request
            .status
            .iter()
            .flat_map(|s| s.conditions.iter().flatten())
            .map(|c| c.type_.clone())
            .collect();
        assert_eq!(types, vec![CONDITION_DENIED.to_string()]);
    }

    // ==========================================================================
    // Story: Conflicts are retried against fresh state
    // ==========================================================================

    /// Wraps a store and lets another approver win the race on the first update
    struct RacingStore {
        inner: Arc<Requests>,
        raced: AtomicBool,
    }

    #[async_trait]
    impl ResourceStore<CertificateSigningRequest> for RacingStore {
        async fn create(&self, o: &CertificateSigningRequest) -> Result<CertificateSigningRequest> {
            self.inner.create(o).await
        }
        async fn get(&self, name: &str) -> Result<CertificateSigningRequest> {
            self.inner.get(name).await
        }
        async fn list(&self, s: &LabelSelector) -> Result<Vec<CertificateSigningRequest>> {
            self.inner.list(s).await
        }
        async fn update(&self, o: &CertificateSigningRequest) -> Result<CertificateSigningRequest> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                let mut winner = self.inner.get(&o.name_any()).await?;
                csr::append_condition(&mut winner, CONDITION_APPROVED, "OtherApprover", "won");
                self.inner.update(&winner).await?;
            }
            self.inner.update(o).await
        }
    }

    #[tokio::test]
    async fn story_lost_race_rechecks_terminal_state() {
        let inner = Arc::new(Requests::new());
        let name = submit(&inner, "edge-1", "edge-1").await;
        let racing = Arc::new(RacingStore {
            inner: inner.clone(),
            raced: AtomicBool::new(false),
        });

        let mut policy = MockApprovalPolicy::new();
        policy
            .expect_evaluate()
            .times(1)
            .returning(|_| PolicyDecision::Approve);
        let coordinator = ApprovalCoordinator::new(racing, Arc::new(policy));

        let outcome = coordinator.approve(&name).await.unwrap();
        assert_eq!(outcome, ApprovalOutcome::Skipped(TerminalState::Approved));

        let request = inner.get(&name).await.unwrap();
        assert_eq!(csr::terminal_condition_count(&request), 1);
        let reasons: Vec<_> = request
            .status
            .iter()
            .flat_map(|s| s.conditions.iter().flatten())
            .filter_map(|c| c.reason.clone())
            .collect();
        assert_eq!(reasons, vec!["OtherApprover".to_string()]);
    }

    /// Store whose updates always lose
    struct AlwaysConflict {
        inner: Arc<Requests>,
        updates: AtomicU32,
    }

    #[async_trait]
    impl ResourceStore<CertificateSigningRequest> for AlwaysConflict {
        async fn create(&self, o: &CertificateSigningRequest) -> Result<CertificateSigningRequest> {
            self.inner.create(o).await
        }
        async fn get(&self, name: &str) -> Result<CertificateSigningRequest> {
            self.inner.get(name).await
        }
        async fn list(&self, s: &LabelSelector) -> Result<Vec<CertificateSigningRequest>> {
            self.inner.list(s).await
        }
        async fn update(&self, o: &CertificateSigningRequest) -> Result<CertificateSigningRequest> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            Err(Error::conflict("CertificateSigningRequest", o.name_any()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_budget_exhaustion_surfaces() {
        let inner = Arc::new(Requests::new());
        let name = submit(&inner, "edge-1", "edge-1").await;
        let store = Arc::new(AlwaysConflict {
            inner,
            updates: AtomicU32::new(0),
        });

        let coordinator = ApprovalCoordinator::new(store.clone(), Arc::new(ApproveAll))
            .with_retry(RetryConfig::conflict_budget(3, Duration::from_millis(10)));

        match coordinator.approve(&name).await {
            Err(Error::ConflictExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected ConflictExhausted, got {other:?}"),
        }
        assert_eq!(store.updates.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_missing_request_is_not_found() {
        let coordinator = approve_all(Arc::new(Requests::new()));
        assert!(coordinator
            .approve("edge-1-zzzzz")
            .await
            .unwrap_err()
            .is_not_found());
    }

    // ==========================================================================
    // Story: Cluster-wide approval
    // ==========================================================================

    #[tokio::test]
    async fn story_approve_cluster_only_touches_labeled_requests() {
        let store = Arc::new(Requests::new());
        let mine = submit(&store, "edge-1", "edge-1").await;
        let other = submit(&store, "edge-2", "edge-2").await;

        let outcomes = approve_all(store.clone())
            .with_reason("Approved by E2E", "Approved as part of Loopback e2e")
            .approve_cluster("edge-1")
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, mine);
        assert_eq!(*outcomes[0].1.state(), TerminalState::Approved);
        assert_eq!(csr::terminal_state(&store.get(&other).await.unwrap()), None);

        let request = store.get(&mine).await.unwrap();
        let conditions = request.status.unwrap().conditions.unwrap();
        assert_eq!(conditions[0].reason.as_deref(), Some("Approved by E2E"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_requests_times_out_without_submission() {
        let coordinator = approve_all(Arc::new(Requests::new()));
        let poll = PollConfig::fixed(Duration::from_secs(1), Duration::from_secs(5));

        match coordinator.wait_for_requests("edge-1", &poll).await {
            Err(Error::Timeout { last_observed, .. }) => {
                assert_eq!(last_observed, "no matching signing requests")
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    // ==========================================================================
    // Story: Bootstrap requester policy
    // ==========================================================================

    #[tokio::test]
    async fn story_bootstrap_policy_checks_requester_and_subject() {
        let store = Requests::new();
        let good = submit(&store, "edge-1", "edge-1").await;
        let spoofed = submit(&store, "edge-1", "edge-2").await;
        let policy = BootstrapRequesterPolicy;

        assert_eq!(
            policy.evaluate(&store.get(&good).await.unwrap()),
            PolicyDecision::Approve
        );
        assert!(matches!(
            policy.evaluate(&store.get(&spoofed).await.unwrap()),
            PolicyDecision::Deny { reason, .. } if reason == "SubjectMismatch"
        ));

        let mut foreign = store.get(&good).await.unwrap();
        foreign.spec.username = Some("system:serviceaccount:default:builder".to_string());
        assert!(matches!(
            policy.evaluate(&foreign),
            PolicyDecision::Deny { reason, .. } if reason == "UnknownRequester"
        ));

        let mut unlabeled = store.get(&good).await.unwrap();
        unlabeled.metadata.labels = None;
        assert!(matches!(
            policy.evaluate(&unlabeled),
            PolicyDecision::Deny { reason, .. } if reason == "MissingClusterLabel"
        ));
    }

    #[tokio::test]
    async fn test_policy_denial_is_recorded() {
        let store = Arc::new(Requests::new());
        let name = submit(&store, "edge-1", "edge-2").await;
        let coordinator = ApprovalCoordinator::new(store.clone(), Arc::new(BootstrapRequesterPolicy));

        let outcome = coordinator.approve(&name).await.unwrap();
        assert_eq!(
            outcome,
            ApprovalOutcome::Applied(TerminalState::Denied {
                reason: "SubjectMismatch".to_string()
            })
        );
    }
}
