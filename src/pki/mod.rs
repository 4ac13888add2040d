//! PKI operations for spoke identities
//!
//! The spoke generates its key pair locally and sends only a CSR to the hub.
//! The hub (or the API server's signer) returns a client certificate whose
//! subject names the cluster. The hub CA here is used when the hub signs
//! requests itself instead of delegating to the API server's signer.
//!
//! # Identity format
//!
//! - CN: `system:open-cluster-management:<cluster>:agent`
//! - O:  `system:open-cluster-management:<cluster>`

use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DistinguishedName,
    DnType, DnValue, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use thiserror::Error;
use x509_parser::prelude::*;

/// Prefix shared by every spoke identity
pub const IDENTITY_PREFIX: &str = "system:open-cluster-management:";

/// Suffix of the agent common name
const AGENT_SUFFIX: &str = ":agent";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Invalid CSR
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Common name of the agent identity for a cluster
pub fn agent_common_name(cluster_name: &str) -> String {
    format!("{IDENTITY_PREFIX}{cluster_name}{AGENT_SUFFIX}")
}

/// Organization (group) of the agent identity for a cluster
pub fn agent_organization(cluster_name: &str) -> String {
    format!("{IDENTITY_PREFIX}{cluster_name}")
}

/// Extract the cluster name from an agent common name
pub fn cluster_from_common_name(cn: &str) -> Option<&str> {
    cn.strip_prefix(IDENTITY_PREFIX)?
        .strip_suffix(AGENT_SUFFIX)
        .filter(|name| !name.is_empty())
}

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

fn agent_distinguished_name(cluster_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(agent_common_name(cluster_name)),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(agent_organization(cluster_name)),
    );
    dn
}

fn first_common_name(name: &X509Name<'_>) -> Option<String> {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
}

/// Common name of the subject of a PEM-encoded CSR
pub fn csr_common_name(csr_pem: &str) -> Result<String> {
    let der = parse_pem(csr_pem)?;
    let (_, csr) = X509CertificationRequest::from_der(&der)
        .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))?;
    first_common_name(&csr.certification_request_info.subject)
        .ok_or_else(|| PkiError::InvalidCsr("CSR subject has no common name".to_string()))
}

/// Common name of the subject of a PEM-encoded certificate
pub fn certificate_common_name(cert_pem: &str) -> Result<String> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;
    first_common_name(cert.subject())
        .ok_or_else(|| PkiError::ParseError("certificate subject has no common name".to_string()))
}

/// Certificate Authority for signing spoke CSRs
pub struct CertificateAuthority {
    /// CA key pair serialized as PEM (KeyPair isn't Clone)
    ca_key_pem: String,
    /// PEM-encoded CA certificate for distribution
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2034, 1, 1);

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;
        let ca_key_pem = key_pair.serialize_pem();

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load CA from PEM
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        parse_pem(cert_pem)?;

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// Get the CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Sign a spoke CSR and return the client certificate in PEM format
    ///
    /// The subject is forced to the agent identity of `cluster_name`
    /// regardless of what the CSR asked for.
    pub fn sign_csr(&self, csr_pem: &str, cluster_name: &str) -> Result<String> {
        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))?;

        csr_params.params.distinguished_name = agent_distinguished_name(cluster_name);
        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        csr_params.params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
        csr_params.params.subject_alt_names = vec![];

        csr_params.params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        csr_params.params.not_after = rcgen::date_time_ymd(2029, 1, 1);

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let signed_cert = csr_params.signed_by(&issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })?;

        Ok(signed_cert.pem())
    }
}

/// Spoke certificate request (generates keypair and CSR locally)
pub struct AgentCertRequest {
    key_pem: String,
    csr_pem: String,
}

impl AgentCertRequest {
    /// Generate a new key pair and CSR for a spoke cluster
    pub fn new(cluster_name: &str) -> Result<Self> {
        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate agent key: {}", e))
        })?;

        let mut params = CertificateParams::default();
        params.distinguished_name = agent_distinguished_name(cluster_name);

        let csr = params.serialize_request(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CSR: {}", e))
        })?;
        let csr_pem = csr.pem().map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to serialize CSR: {}", e))
        })?;

        Ok(Self {
            key_pem: key_pair.serialize_pem(),
            csr_pem,
        })
    }

    /// CSR in PEM format (submitted to the hub)
    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// Private key in PEM format (stays on the spoke)
    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Split into (private key PEM, CSR PEM)
    pub fn into_parts(self) -> (String, String) {
        (self.key_pem, self.csr_pem)
    }
}
