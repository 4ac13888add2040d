//! Signing request submission and certificate pickup

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::ResourceExt;
use tracing::{info, instrument};

use crate::bootstrap::BootstrapCredential;
use crate::csr::{self, TerminalState};
use crate::pki::AgentCertRequest;
use crate::poll::{poll_until, PollConfig, PollStatus};
use crate::store::{kind_of, ResourceStore};
use crate::{Error, Result};

/// A submitted signing request and the key that goes with it
pub struct PendingIdentity {
    cluster_name: String,
    request_name: String,
    private_key_pem: String,
}

impl PendingIdentity {
    /// Cluster the request was made for
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Name the hub assigned to the signing request
    pub fn request_name(&self) -> &str {
        &self.request_name
    }

    fn into_issued(self, certificate_pem: String) -> IssuedIdentity {
        IssuedIdentity {
            cluster_name: self.cluster_name,
            request_name: self.request_name,
            certificate_pem,
            private_key_pem: self.private_key_pem,
        }
    }
}

impl fmt::Debug for PendingIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingIdentity")
            .field("cluster_name", &self.cluster_name)
            .field("request_name", &self.request_name)
            .finish_non_exhaustive()
    }
}

/// A signed client certificate and its private key
#[derive(Clone)]
pub struct IssuedIdentity {
    cluster_name: String,
    request_name: String,
    certificate_pem: String,
    private_key_pem: String,
}

impl IssuedIdentity {
    /// Cluster the identity belongs to
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Signing request the certificate was issued for
    pub fn request_name(&self) -> &str {
        &self.request_name
    }

    /// Client certificate (PEM)
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// Private key (PEM)
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }
}

impl fmt::Debug for IssuedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedIdentity")
            .field("cluster_name", &self.cluster_name)
            .field("request_name", &self.request_name)
            .finish_non_exhaustive()
    }
}

/// Reject names that cannot be a label value or an object name prefix
fn validate_cluster_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 57
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "invalid cluster name {name:?}: expected up to 57 lowercase alphanumerics or '-'"
        )))
    }
}

/// Submits the spoke's signing request to the hub
pub struct IdentityRequestIssuer {
    requests: Arc<dyn ResourceStore<CertificateSigningRequest>>,
}

impl IdentityRequestIssuer {
    /// Create an issuer over the hub's signing requests, reached with the
    /// bootstrap credential
    pub fn new(requests: Arc<dyn ResourceStore<CertificateSigningRequest>>) -> Self {
        Self { requests }
    }

    /// Generate a key and submit one signing request for `cluster_name`.
    ///
    /// Not idempotent: every call creates a new request. Any rejection by
    /// the store comes back as [`Error::Submission`] and is not retried.
    #[instrument(skip(self, credential), fields(credential = %credential.source()))]
    pub async fn issue(
        &self,
        cluster_name: &str,
        credential: &BootstrapCredential,
    ) -> Result<PendingIdentity> {
        validate_cluster_name(cluster_name)?;

        let (private_key_pem, csr_pem) = AgentCertRequest::new(cluster_name)?.into_parts();
        let request =
            csr::build_signing_request(cluster_name, &csr_pem, credential.requester().as_deref());

        let created = self.requests.create(&request).await.map_err(|e| {
            Error::submission(
                kind_of::<CertificateSigningRequest>(),
                format!("{cluster_name}-"),
                e,
            )
        })?;

        let request_name = created.name_any();
        info!(request = %request_name, "Submitted signing request");

        Ok(PendingIdentity {
            cluster_name: cluster_name.to_string(),
            request_name,
            private_key_pem,
        })
    }

    /// Wait until the hub has approved and signed the request.
    ///
    /// A denied request ends the wait with [`Error::Denied`].
    #[instrument(skip(self, pending, poll), fields(request = %pending.request_name))]
    pub async fn wait_for_certificate(
        &self,
        pending: PendingIdentity,
        poll: &PollConfig,
    ) -> Result<IssuedIdentity> {
        let name = pending.request_name.as_str();
        let requests = &self.requests;
        let description = format!("certificate for signing request {name:?}");

        let certificate = poll_until(&description, poll, || async move {
            let request = requests.get(name).await?;
            if let Some(TerminalState::Denied { reason }) = csr::terminal_state(&request) {
                return Err(Error::Denied {
                    name: name.to_string(),
                    reason,
                });
            }
            Ok(match csr::issued_certificate(&request) {
                Some(cert) => PollStatus::Ready(cert),
                None => PollStatus::Pending(csr::describe(&request)),
            })
        })
        .await?;

        info!("Certificate issued");
        Ok(pending.into_issued(certificate))
    }
}
