//! Signing request construction and inspection
//!
//! Signing requests are plain `certificates.k8s.io/v1` CertificateSigningRequests.
//! The cluster they belong to is carried in the [`CLUSTER_NAME_LABEL`] label;
//! the hub finds a spoke's requests by listing on that label.
//!
//! A request is terminal once it carries an `Approved` or `Denied` condition.
//! Terminal requests are never modified again by this crate.

use std::fmt;

use chrono::Utc;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;

use crate::{Error, Result, CLUSTER_NAME_LABEL};

/// Signer for client certificates the hub API server trusts
pub const SIGNER_NAME: &str = "kubernetes.io/kube-apiserver-client";

/// Condition type marking an approved request
pub const CONDITION_APPROVED: &str = "Approved";

/// Condition type marking a denied request
pub const CONDITION_DENIED: &str = "Denied";

/// Key usages requested for the spoke's client certificate
pub const CLIENT_USAGES: [&str; 3] = ["digital signature", "key encipherment", "client auth"];

/// Terminal decision recorded on a signing request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TerminalState {
    /// Request carries an `Approved` condition
    Approved,
    /// Request carries a `Denied` condition
    Denied {
        /// Reason recorded on the condition
        reason: String,
    },
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approved => write!(f, "{CONDITION_APPROVED}"),
            Self::Denied { reason } => write!(f, "{CONDITION_DENIED} ({reason})"),
        }
    }
}

/// Build the signing request a spoke submits for `cluster_name`.
///
/// The object uses `generateName` so every submission gets a distinct
/// `<cluster>-<suffix>` name. `requester` is what the spoke claims to be;
/// a real API server replaces it with the authenticated user.
pub fn build_signing_request(
    cluster_name: &str,
    csr_pem: &str,
    requester: Option<&str>,
) -> CertificateSigningRequest {
    CertificateSigningRequest {
        metadata: ObjectMeta {
            generate_name: Some(format!("{cluster_name}-")),
            labels: Some([(CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string())].into()),
            ..Default::default()
        },
        spec: CertificateSigningRequestSpec {
            request: ByteString(csr_pem.as_bytes().to_vec()),
            signer_name: SIGNER_NAME.to_string(),
            usages: Some(CLIENT_USAGES.iter().map(|u| u.to_string()).collect()),
            username: requester.map(str::to_string),
            ..Default::default()
        },
        status: None,
    }
}

fn conditions(csr: &CertificateSigningRequest) -> &[CertificateSigningRequestCondition] {
    csr.status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default()
}

/// The terminal decision on a request, if any.
///
/// Any `Approved` or `Denied` condition is terminal whatever its status.
/// When both are somehow present the first one in the list wins.
pub fn terminal_state(csr: &CertificateSigningRequest) -> Option<TerminalState> {
    conditions(csr)
        .iter()
        .find_map(|c| match c.type_.as_str() {
            CONDITION_APPROVED => Some(TerminalState::Approved),
            CONDITION_DENIED => Some(TerminalState::Denied {
                reason: c.reason.clone().unwrap_or_default(),
            }),
            _ => None,
        })
}

/// Number of terminal conditions on a request
pub fn terminal_condition_count(csr: &CertificateSigningRequest) -> usize {
    conditions(csr)
        .iter()
        .filter(|c| c.type_ == CONDITION_APPROVED || c.type_ == CONDITION_DENIED)
        .count()
}

/// Append a `True` condition of the given type
pub fn append_condition(
    csr: &mut CertificateSigningRequest,
    type_: &str,
    reason: &str,
    message: &str,
) {
    let now = Time(Utc::now());
    csr.status
        .get_or_insert_with(Default::default)
        .conditions
        .get_or_insert_with(Vec::new)
        .push(CertificateSigningRequestCondition {
            type_: type_.to_string(),
            status: "True".to_string(),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            last_update_time: Some(now.clone()),
            last_transition_time: Some(now),
        });
}

/// PEM certificate issued for the request, once the signer has written it
pub fn issued_certificate(csr: &CertificateSigningRequest) -> Option<String> {
    csr.status
        .as_ref()
        .and_then(|s| s.certificate.as_ref())
        .filter(|c| !c.0.is_empty())
        .and_then(|c| String::from_utf8(c.0.clone()).ok())
}

/// Cluster named by the request's label
pub fn cluster_name(csr: &CertificateSigningRequest) -> Option<&str> {
    csr.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(CLUSTER_NAME_LABEL))
        .map(String::as_str)
}

/// Identity that submitted the request
pub fn requester(csr: &CertificateSigningRequest) -> Option<&str> {
    csr.spec.username.as_deref()
}

/// The PEM-encoded PKCS#10 request carried by the object
pub fn request_pem(csr: &CertificateSigningRequest) -> Result<String> {
    String::from_utf8(csr.spec.request.0.clone())
        .map_err(|e| Error::validation(format!("signing request is not valid PEM text: {e}")))
}

/// Short description of a request's state for logs and poll timeouts
pub fn describe(csr: &CertificateSigningRequest) -> String {
    match (terminal_state(csr), issued_certificate(csr)) {
        (Some(TerminalState::Approved), Some(_)) => "Approved, certificate issued".to_string(),
        (Some(state), _) => state.to_string(),
        (None, _) => "pending".to_string(),
    }
}
