//! Bootstrap credential loading
//!
//! A spoke's first contact with the hub is authenticated with a short-lived
//! bootstrap credential, provisioned out-of-band into a namespace-local
//! Secret. It only needs to be good enough to submit a signing request;
//! everything after that uses the issued client certificate.
//!
//! # Secret shapes
//!
//! - `kubeconfig`: a complete hub kubeconfig
//! - `server` + `token` (+ optional `ca.crt`): a bootstrap token for the hub
//!   API server at `server`
//!
//! The credential is consumed when the handshake completes: [`BootstrapCredential::consume`]
//! takes it by value so it cannot be used again.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use aws_lc_rs::digest::{digest, SHA256};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use k8s_openapi::api::core::v1::Secret;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::ResourceExt;
use tracing::{debug, info, instrument};

use crate::store::ResourceStore;
use crate::{Error, Result};

/// Default name of the bootstrap Secret in the agent namespace
pub const DEFAULT_SECRET_NAME: &str = "bootstrap-secret";

/// Key holding a full hub kubeconfig
pub const KUBECONFIG_KEY: &str = "kubeconfig";

/// Key holding the hub API server URL
pub const SERVER_KEY: &str = "server";

/// Key holding the bootstrap token
pub const TOKEN_KEY: &str = "token";

/// Key holding the hub CA bundle (PEM)
pub const CA_KEY: &str = "ca.crt";

/// Prefix of usernames the API server assigns to bootstrap tokens
pub const BOOTSTRAP_USER_PREFIX: &str = "system:bootstrap:";

/// Opaque key/value credential used for the first contact with the hub.
///
/// Not `Clone`: once [`consume`](Self::consume) has taken it no copy
/// remains.
///
/// ```compile_fail
/// fn keep_copy(credential: &registration::bootstrap::BootstrapCredential) {
///     let _copy: registration::bootstrap::BootstrapCredential = credential.clone();
/// }
/// ```
pub struct BootstrapCredential {
    data: BTreeMap<String, Vec<u8>>,
    source: String,
}

impl BootstrapCredential {
    /// Build a credential from raw key/value data.
    ///
    /// Fails unless the data carries either a `kubeconfig` or both `server`
    /// and `token`.
    pub fn from_data(source: impl Into<String>, data: BTreeMap<String, Vec<u8>>) -> Result<Self> {
        let source = source.into();
        let non_empty = |key: &str| data.get(key).is_some_and(|v| !v.is_empty());

        if !non_empty(KUBECONFIG_KEY) && !(non_empty(SERVER_KEY) && non_empty(TOKEN_KEY)) {
            return Err(Error::credential(format!(
                "{source}: expected `{KUBECONFIG_KEY}` or `{SERVER_KEY}` and `{TOKEN_KEY}`"
            )));
        }

        Ok(Self { data, source })
    }

    /// Build a credential from a Secret, merging `data` and `stringData`
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let mut data: BTreeMap<String, Vec<u8>> = secret
            .data
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), v.0.clone()))
            .collect();
        for (k, v) in secret.string_data.iter().flatten() {
            data.insert(k.clone(), v.clone().into_bytes());
        }

        let source = match secret.namespace() {
            Some(ns) => format!("secret {ns}/{}", secret.name_any()),
            None => format!("secret {}", secret.name_any()),
        };
        Self::from_data(source, data)
    }

    /// Where the credential was loaded from
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Raw value of a key
    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.data.get(key).map(Vec::as_slice)
    }

    fn get_str(&self, key: &str) -> Result<Option<&str>> {
        self.get(key)
            .map(|v| {
                std::str::from_utf8(v)
                    .map(str::trim)
                    .map_err(|_| Error::credential(format!("{}: `{key}` is not UTF-8", self.source)))
            })
            .transpose()
    }

    /// SHA-256 fingerprint over all keys and values, safe to log
    pub fn fingerprint(&self) -> String {
        let mut buf = Vec::new();
        for (k, v) in &self.data {
            buf.extend_from_slice(k.as_bytes());
            buf.push(0);
            buf.extend_from_slice(v);
            buf.push(0);
        }
        let hash = digest(&SHA256, &buf);
        URL_SAFE_NO_PAD.encode(&hash.as_ref()[..12])
    }

    /// Username the hub API server will assign to this credential, when it
    /// can be derived from a `<id>.<secret>` bootstrap token
    pub fn requester(&self) -> Option<String> {
        let token = self.get_str(TOKEN_KEY).ok().flatten()?;
        let (id, secret) = token.split_once('.')?;
        if id.is_empty() || secret.is_empty() {
            return None;
        }
        Some(format!("{BOOTSTRAP_USER_PREFIX}{id}"))
    }

    /// Client configuration for talking to the hub with this credential
    pub async fn hub_config(&self) -> Result<kube::Config> {
        if let Some(kubeconfig) = self.get_str(KUBECONFIG_KEY)? {
            let kubeconfig = Kubeconfig::from_yaml(kubeconfig).map_err(|e| {
                Error::credential(format!("{}: invalid kubeconfig: {e}", self.source))
            })?;
            return kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::credential(format!("{}: unusable kubeconfig: {e}", self.source))
                });
        }

        let server = self
            .get_str(SERVER_KEY)?
            .ok_or_else(|| Error::credential(format!("{}: missing `{SERVER_KEY}`", self.source)))?;
        let token = self
            .get_str(TOKEN_KEY)?
            .ok_or_else(|| Error::credential(format!("{}: missing `{TOKEN_KEY}`", self.source)))?;

        let uri: http::Uri = server.parse().map_err(|e| {
            Error::credential(format!("{}: invalid server URL {server:?}: {e}", self.source))
        })?;

        let mut config = kube::Config::new(uri);
        config.auth_info.token = Some(token.to_string().into());

        if let Some(ca) = self.get(CA_KEY) {
            let certs = pem::parse_many(ca).map_err(|e| {
                Error::credential(format!("{}: invalid `{CA_KEY}`: {e}", self.source))
            })?;
            config.root_cert = Some(certs.iter().map(|p| p.contents().to_vec()).collect());
        }

        Ok(config)
    }

    /// Retire the credential once the spoke has its own identity.
    ///
    /// Returns the fingerprint of the consumed credential for logging.
    pub fn consume(self) -> String {
        let fingerprint = self.fingerprint();
        info!(source = %self.source, fingerprint = %fingerprint, "Bootstrap credential consumed");
        fingerprint
    }
}

impl fmt::Debug for BootstrapCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print secret bytes
        f.debug_struct("BootstrapCredential")
            .field("source", &self.source)
            .field("keys", &self.data.keys().collect::<Vec<_>>())
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Reads bootstrap credentials from Secrets in the agent namespace
pub struct BootstrapCredentialLoader {
    secrets: Arc<dyn ResourceStore<Secret>>,
}

impl BootstrapCredentialLoader {
    /// Create a loader over a namespace-scoped Secret store
    pub fn new(secrets: Arc<dyn ResourceStore<Secret>>) -> Self {
        Self { secrets }
    }

    /// Load the credential from the named Secret.
    ///
    /// A missing Secret is reported as [`Error::NotFound`]; the caller
    /// expects it to have been provisioned already.
    #[instrument(skip(self))]
    pub async fn load(&self, secret_name: &str) -> Result<BootstrapCredential> {
        let secret = self.secrets.get(secret_name).await?;
        let credential = BootstrapCredential::from_secret(&secret)?;
        debug!(fingerprint = %credential.fingerprint(), "Loaded bootstrap credential");
        Ok(credential)
    }
}
