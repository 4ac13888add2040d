//! End-to-end spoke flow

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use kube::api::Api;
use tracing::{info, instrument, warn};

use super::issuer::{IdentityRequestIssuer, IssuedIdentity};
use super::poller::AcceptancePoller;
use crate::bootstrap::BootstrapCredential;
use crate::config::HandshakeConfig;
use crate::crd::SpokeCluster;
use crate::pki::{certificate_common_name, cluster_from_common_name};
use crate::store::{KubeStore, ResourceStore};
use crate::{Error, Result};

/// Opens the spoke's authenticated view of the hub once it has an identity
#[async_trait]
pub trait HubConnector: Send + Sync {
    /// SpokeCluster store reached with the issued identity
    async fn connect(&self, identity: &IssuedIdentity)
        -> Result<Arc<dyn ResourceStore<SpokeCluster>>>;
}

/// Connects to the hub API server with the issued client certificate.
///
/// Server URL and CA trust come from the bootstrap configuration; only the
/// client credentials are replaced.
pub struct KubeHubConnector {
    hub: kube::Config,
}

impl KubeHubConnector {
    /// Build from the hub configuration the bootstrap credential produced
    pub fn new(hub: kube::Config) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl HubConnector for KubeHubConnector {
    async fn connect(
        &self,
        identity: &IssuedIdentity,
    ) -> Result<Arc<dyn ResourceStore<SpokeCluster>>> {
        let mut config = self.hub.clone();
        config.auth_info = kube::config::AuthInfo {
            client_certificate_data: Some(STANDARD.encode(identity.certificate_pem())),
            client_key_data: Some(STANDARD.encode(identity.private_key_pem()).into()),
            ..Default::default()
        };
        let client = kube::Client::try_from(config)?;
        Ok(Arc::new(KubeStore::new(Api::<SpokeCluster>::all(client))))
    }
}

/// Hands out a fixed store regardless of identity (in-process hubs)
pub struct StaticHubConnector {
    records: Arc<dyn ResourceStore<SpokeCluster>>,
}

impl StaticHubConnector {
    /// Always connect to `records`
    pub fn new(records: Arc<dyn ResourceStore<SpokeCluster>>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl HubConnector for StaticHubConnector {
    async fn connect(&self, _: &IssuedIdentity) -> Result<Arc<dyn ResourceStore<SpokeCluster>>> {
        Ok(self.records.clone())
    }
}

/// What the spoke holds once the hub has accepted it
#[derive(Debug)]
pub struct HandshakeOutcome {
    /// Issued client identity
    pub identity: IssuedIdentity,
    /// Registration record as observed when acceptance was seen
    pub record: SpokeCluster,
}

/// Drives the spoke side of the handshake for one cluster
pub struct SpokeAgent {
    cluster_name: String,
    issuer: IdentityRequestIssuer,
    connector: Arc<dyn HubConnector>,
    config: HandshakeConfig,
}

impl SpokeAgent {
    /// Create an agent for `cluster_name`
    pub fn new(
        cluster_name: impl Into<String>,
        issuer: IdentityRequestIssuer,
        connector: Arc<dyn HubConnector>,
        config: HandshakeConfig,
    ) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            issuer,
            connector,
            config,
        }
    }

    /// Run the handshake to completion.
    ///
    /// The credential is consumed only on success. On error it is dropped
    /// unconsumed and the caller may load it again to retry.
    #[instrument(skip(self, credential), fields(cluster = %self.cluster_name))]
    pub async fn run(&self, credential: BootstrapCredential) -> Result<HandshakeOutcome> {
        let pending = self.issuer.issue(&self.cluster_name, &credential).await?;
        let identity = self
            .issuer
            .wait_for_certificate(pending, &self.config.certificate_poll())
            .await?;
        self.verify_identity(&identity)?;

        let records = self.connector.connect(&identity).await?;
        ensure_registration_record(records.as_ref(), &self.cluster_name).await?;

        let record = AcceptancePoller::new(records)
            .wait_for_acceptance(&self.cluster_name, &self.config.acceptance_poll())
            .await?;

        credential.consume();
        info!("Registration handshake complete");
        Ok(HandshakeOutcome { identity, record })
    }

    fn verify_identity(&self, identity: &IssuedIdentity) -> Result<()> {
        let cn = certificate_common_name(identity.certificate_pem())?;
        match cluster_from_common_name(&cn) {
            Some(cluster) if cluster == self.cluster_name => Ok(()),
            _ => Err(Error::validation(format!(
                "issued certificate subject {cn:?} does not name cluster {:?}",
                self.cluster_name
            ))),
        }
    }
}

/// Create the cluster's registration record, or fetch it if it exists.
///
/// A fresh record always starts with `hubAcceptsClient: false`; an existing
/// record is returned untouched so a re-registering spoke never resets
/// the hub's decision.
#[instrument(skip(records))]
pub async fn ensure_registration_record(
    records: &dyn ResourceStore<SpokeCluster>,
    cluster_name: &str,
) -> Result<SpokeCluster> {
    match records.create(&SpokeCluster::pending(cluster_name)).await {
        Ok(record) => {
            info!("Created registration record");
            Ok(record)
        }
        Err(Error::AlreadyExists { .. }) => {
            warn!("Registration record already exists, reusing it");
            records.get(cluster_name).await
        }
        Err(e) => Err(e),
    }
}
