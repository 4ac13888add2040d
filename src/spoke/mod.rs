//! Spoke side of the registration handshake
//!
//! # Flow
//!
//! 1. [`IdentityRequestIssuer`] generates a key pair locally and submits a
//!    signing request labeled with the cluster name, authenticated with the
//!    bootstrap credential
//! 2. The issuer waits for the hub to approve and sign it
//! 3. [`SpokeAgent`] connects to the hub with the issued identity and
//!    creates the cluster's `SpokeCluster` record
//! 4. [`AcceptancePoller`] waits for `HubAcceptedSpoke=True`
//! 5. The bootstrap credential is consumed
//!
//! The private key never leaves the spoke.

mod agent;
mod issuer;
mod poller;

pub use agent::{
    ensure_registration_record, HandshakeOutcome, HubConnector, KubeHubConnector, SpokeAgent,
    StaticHubConnector,
};
pub use issuer::{IdentityRequestIssuer, IssuedIdentity, PendingIdentity};
pub use poller::AcceptancePoller;
