//! Custom Resource Definitions
//!
//! The SpokeCluster registration record and the condition type shared by
//! its status.

mod spoke_cluster;
mod types;

pub use spoke_cluster::{
    SpokeCluster, SpokeClusterSpec, SpokeClusterStatus, CONDITION_HUB_ACCEPTED,
    REASON_HUB_ACCEPTED, REASON_HUB_DENIED,
};
pub use types::{find_condition, set_condition, Condition, ConditionStatus};
