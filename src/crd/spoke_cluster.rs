//! SpokeCluster Custom Resource Definition
//!
//! The SpokeCluster is the hub-side registration record of a spoke. The
//! spoke creates it on first authenticated contact; only hub actors change
//! `hubAcceptsClient`, and only the hub reconciler writes conditions.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{find_condition, Condition, ConditionStatus};

/// Condition reporting whether the hub has accepted the spoke
pub const CONDITION_HUB_ACCEPTED: &str = "HubAcceptedSpoke";

/// Reason used when the hub administrator accepted the spoke
pub const REASON_HUB_ACCEPTED: &str = "HubClusterAdminAccepted";

/// Reason used while the hub administrator has not accepted the spoke
pub const REASON_HUB_DENIED: &str = "HubClusterAdminDenied";

/// Specification for a SpokeCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.open-cluster-management.io",
    version = "v1",
    kind = "SpokeCluster",
    plural = "spokeclusters",
    status = "SpokeClusterStatus",
    namespaced = false,
    printcolumn = r#"{"name":"Hub Accepted","type":"boolean","jsonPath":".spec.hubAcceptsClient"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SpokeClusterSpec {
    /// Desired acceptance set by the hub administrator
    #[serde(default)]
    pub hub_accepts_client: bool,
}

/// Status for a SpokeCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpokeClusterStatus {
    /// Conditions, at most one per type
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl SpokeCluster {
    /// A fresh, not-yet-accepted registration record
    pub fn pending(name: &str) -> Self {
        Self::new(
            name,
            SpokeClusterSpec {
                hub_accepts_client: false,
            },
        )
    }

    /// Conditions of the record (empty if no status yet)
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    /// The `HubAcceptedSpoke` condition, if the hub has written one
    pub fn accepted_condition(&self) -> Option<&Condition> {
        find_condition(self.conditions(), CONDITION_HUB_ACCEPTED)
    }

    /// True once the hub has reflected acceptance in status
    pub fn is_accepted(&self) -> bool {
        self.accepted_condition().is_some_and(Condition::is_true)
    }

    /// Short description of the acceptance condition for logs and timeouts
    pub fn acceptance_summary(&self) -> String {
        match self.accepted_condition() {
            Some(c) => c.to_string(),
            None => "absent".to_string(),
        }
    }

    /// The `HubAcceptedSpoke` condition the hub should report for the
    /// current `hubAcceptsClient` value
    pub fn desired_acceptance_condition(&self) -> Condition {
        if self.spec.hub_accepts_client {
            Condition::new(
                CONDITION_HUB_ACCEPTED,
                ConditionStatus::True,
                REASON_HUB_ACCEPTED,
                "Accepted by hub cluster admin",
            )
        } else {
            Condition::new(
                CONDITION_HUB_ACCEPTED,
                ConditionStatus::False,
                REASON_HUB_DENIED,
                "Denied by hub cluster admin",
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn pending_record_is_not_accepted() {
        let record = SpokeCluster::pending("edge-1");

        assert!(!record.spec.hub_accepts_client);
        assert!(!record.is_accepted());
        assert_eq!(record.acceptance_summary(), "absent");
        assert!(record.conditions().is_empty());
    }

    /// Story: The desired condition mirrors the administrator's flag
    #[test]
    fn story_desired_condition_follows_flag() {
        let mut record = SpokeCluster::pending("edge-1");
        let denied = record.desired_acceptance_condition();
        assert_eq!(denied.status, ConditionStatus::False);
        assert_eq!(denied.reason, REASON_HUB_DENIED);

        record.spec.hub_accepts_client = true;
        let accepted = record.desired_acceptance_condition();
        assert!(accepted.is_true());
        assert_eq!(accepted.reason, REASON_HUB_ACCEPTED);
    }

    #[test]
    fn spec_serializes_with_kubernetes_field_names() {
        let record = SpokeCluster::pending("edge-1");
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["spec"]["hubAcceptsClient"], false);
        assert_eq!(json["kind"], "SpokeCluster");
        assert_eq!(json["apiVersion"], "cluster.open-cluster-management.io/v1");
    }

    #[test]
    fn missing_flag_defaults_to_not_accepted() {
        let record: SpokeCluster = serde_json::from_value(serde_json::json!({
            "apiVersion": "cluster.open-cluster-management.io/v1",
            "kind": "SpokeCluster",
            "metadata": {"name": "edge-1"},
            "spec": {}
        }))
        .unwrap();

        assert!(!record.spec.hub_accepts_client);
    }

    #[test]
    fn crd_is_cluster_scoped() {
        let crd = SpokeCluster::crd();
        assert_eq!(crd.spec.scope, "Cluster");
        assert_eq!(crd.spec.names.kind, "SpokeCluster");
    }
}
