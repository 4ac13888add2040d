//! Hub side of the registration handshake
//!
//! The hub never initiates contact with a spoke. It reacts to objects the
//! spoke creates on the hub API server:
//!
//! - [`ApprovalCoordinator`] decides on signing requests labeled with a
//!   cluster name
//! - [`CsrSigner`] issues certificates for approved requests when the hub
//!   signs them itself
//! - [`HubAcceptance`] flips `hubAcceptsClient` on a registration record
//! - [`SpokeClusterReconciler`] reflects that flag in the
//!   `HubAcceptedSpoke` condition
//!
//! Each actor reads, checks, mutates and writes under
//! [`retry_on_conflict`](crate::retry::retry_on_conflict); any number of them
//! may run concurrently against the same objects.

mod acceptance;
mod approver;
mod reconciler;
mod signer;

pub use acceptance::{AcceptanceOutcome, HubAcceptance};
pub use approver::{
    ApprovalCoordinator, ApprovalOutcome, ApprovalPolicy, ApproveAll, BootstrapRequesterPolicy,
    PolicyDecision,
};
pub use reconciler::{ReconcileOutcome, ReconcileSummary, SpokeClusterReconciler};
pub use signer::{CsrSigner, SigningOutcome};

#[cfg(test)]
pub use approver::MockApprovalPolicy;
