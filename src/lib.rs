//! Registration - hub/spoke cluster registration handshake
//!
//! A spoke cluster joins a hub with nothing but a one-time bootstrap
//! credential. The handshake converges through objects on the hub's API
//! server: a certificate signing request, its approval, the issued
//! certificate, and a `SpokeCluster` record the hub administrator accepts.
//!
//! # Handshake
//!
//! 1. Spoke loads its bootstrap credential and submits a CSR labeled with
//!    its cluster name ([`spoke::IdentityRequestIssuer`])
//! 2. Hub approves pending CSRs for the cluster ([`hub::ApprovalCoordinator`])
//!    and the certificate is issued ([`hub::CsrSigner`] or the API server)
//! 3. Spoke, now using its issued identity, creates its `SpokeCluster`
//!    record with `hubAcceptsClient: false`
//! 4. Hub administrator flips `hubAcceptsClient` ([`hub::HubAcceptance`]) and
//!    the hub reconciler sets `HubAcceptedSpoke=True`
//!    ([`hub::SpokeClusterReconciler`])
//! 5. Spoke observes the condition ([`spoke::AcceptancePoller`]) and
//!    discards the bootstrap credential
//!
//! All writes are read-modify-write under optimistic concurrency; nothing
//! in this crate holds a lock across store calls.
//!
//! # Modules
//!
//! - [`crd`] - `SpokeCluster` custom resource and condition helpers
//! - [`csr`] - Signing request construction and terminal-state inspection
//! - [`store`] - Generic resource store contract with in-memory and Kubernetes backends
//! - [`bootstrap`] - Bootstrap credential loading
//! - [`spoke`] - Spoke-side issuer, acceptance poller and agent
//! - [`hub`] - Hub-side approval, signing, acceptance and reconciliation
//! - [`pki`] - Key, CSR and certificate handling
//! - [`retry`] / [`poll`] - Bounded retry and poll primitives
//! - [`config`] - Handshake timing configuration
//! - [`error`] - Error types

#![deny(missing_docs)]

use std::time::Duration;

pub mod bootstrap;
pub mod config;
pub mod crd;
pub mod csr;
pub mod error;
pub mod hub;
pub mod pki;
pub mod poll;
pub mod retry;
pub mod spoke;
pub mod store;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// Timings follow the behaviour the handshake was designed around: one-second
// polls, a generous wait for the spoke's CSR to show up, a short wait for the
// hub to reflect acceptance, and a small flat budget for write conflicts.

/// Label carrying the cluster name on signing requests
pub const CLUSTER_NAME_LABEL: &str = "open-cluster-management.io/cluster-name";

/// Interval between polls of hub objects
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How long the hub waits for a spoke's signing request to appear
pub const DEFAULT_CSR_TIMEOUT: Duration = Duration::from_secs(90);

/// How long the spoke waits for its certificate to be issued
pub const DEFAULT_CERTIFICATE_TIMEOUT: Duration = Duration::from_secs(300);

/// How long the hub waits for a spoke's registration record to appear
pub const DEFAULT_RECORD_TIMEOUT: Duration = Duration::from_secs(60);

/// How long to wait for `HubAcceptedSpoke=True` once acceptance was requested
pub const DEFAULT_ACCEPTANCE_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts for a read-modify-write before giving up on conflicts
pub const DEFAULT_CONFLICT_RETRY_ATTEMPTS: u32 = 5;

/// Delay between conflicting read-modify-write attempts
pub const DEFAULT_CONFLICT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Interval of the hub reconciler loop
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(2);
