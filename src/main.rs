//! Registration - hub/spoke cluster registration handshake

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use registration::bootstrap::{BootstrapCredentialLoader, DEFAULT_SECRET_NAME};
use registration::config::HandshakeConfig;
use registration::crd::SpokeCluster;
use registration::hub::{
    ApprovalCoordinator, ApprovalPolicy, ApproveAll, BootstrapRequesterPolicy, CsrSigner,
    HubAcceptance, SpokeClusterReconciler,
};
use registration::pki::CertificateAuthority;
use registration::spoke::{
    AcceptancePoller, IdentityRequestIssuer, IssuedIdentity, KubeHubConnector, SpokeAgent,
};
use registration::store::{KubeStore, ResourceStore};
use registration::Error;

/// Registration - join spoke clusters to a hub with a one-time bootstrap credential
#[derive(Parser, Debug)]
#[command(name = "registration", version, about, long_about = None)]
struct Cli {
    /// Print the SpokeCluster CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Handshake timing configuration (YAML)
    #[arg(long, env = "REGISTRATION_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the spoke agent: submit a signing request, register, wait for acceptance
    Agent(AgentArgs),

    /// Approve the signing requests of a spoke cluster (hub side)
    Approve(ApproveArgs),

    /// Accept a spoke cluster's registration (hub side)
    Accept(AcceptArgs),

    /// Run the hub controller: reconcile acceptance conditions and optionally sign certificates
    Controller(ControllerArgs),
}

#[derive(Parser, Debug)]
struct AgentArgs {
    /// Name this spoke registers under
    #[arg(long, env = "CLUSTER_NAME")]
    cluster_name: String,

    /// Namespace holding the bootstrap Secret on the spoke
    #[arg(long, env = "POD_NAMESPACE", default_value = "open-cluster-management-agent")]
    namespace: String,

    /// Name of the bootstrap Secret
    #[arg(long, default_value = DEFAULT_SECRET_NAME)]
    bootstrap_secret: String,

    /// Secret the issued identity is stored in
    #[arg(long, default_value = "hub-kubeconfig-secret")]
    identity_secret: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    /// Approve every request for the cluster
    ApproveAll,
    /// Require a bootstrap requester and a matching subject
    Bootstrap,
}

#[derive(Parser, Debug)]
struct ApproveArgs {
    /// Spoke cluster whose requests to approve
    #[arg(long)]
    cluster_name: String,

    /// Approval policy. `bootstrap` writes a permanent Denied for requests
    /// not submitted with a bootstrap token.
    #[arg(long, value_enum, default_value = "approve-all")]
    policy: PolicyArg,
}

#[derive(Parser, Debug)]
struct AcceptArgs {
    /// Spoke cluster to accept
    #[arg(long)]
    cluster_name: String,

    /// Also wait until the hub reports HubAcceptedSpoke=True
    #[arg(long)]
    wait: bool,
}

#[derive(Parser, Debug)]
struct ControllerArgs {
    /// Hub CA certificate (PEM); enables certificate signing together with --ca-key
    #[arg(long, env = "HUB_CA_CERT", requires = "ca_key")]
    ca_cert: Option<PathBuf>,

    /// Hub CA private key (PEM)
    #[arg(long, env = "HUB_CA_KEY", requires = "ca_cert")]
    ca_key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&SpokeCluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => HandshakeConfig::from_file(path)?,
        None => HandshakeConfig::default(),
    };

    match cli.command {
        Some(Commands::Agent(args)) => run_agent(args, config).await,
        Some(Commands::Approve(args)) => run_approve(args, config).await,
        Some(Commands::Accept(args)) => run_accept(args, config).await,
        Some(Commands::Controller(args)) => run_controller(args, config).await,
        None => Err(anyhow::anyhow!(
            "no command given; use --crd or one of: agent, approve, accept, controller"
        )),
    }
}

/// Spoke side: bootstrap credential to accepted registration
async fn run_agent(args: AgentArgs, config: HandshakeConfig) -> anyhow::Result<()> {
    let spoke = Client::try_default().await?;
    let secrets: Arc<dyn ResourceStore<Secret>> = Arc::new(KubeStore::new(
        Api::<Secret>::namespaced(spoke, &args.namespace),
    ));

    let credential = BootstrapCredentialLoader::new(secrets.clone())
        .load(&args.bootstrap_secret)
        .await?;
    let hub_config = credential.hub_config().await?;

    let bootstrap_client = Client::try_from(hub_config.clone())?;
    let issuer = IdentityRequestIssuer::new(Arc::new(KubeStore::new(
        Api::<CertificateSigningRequest>::all(bootstrap_client),
    )));

    let agent = SpokeAgent::new(
        &args.cluster_name,
        issuer,
        Arc::new(KubeHubConnector::new(hub_config)),
        config,
    );
    let outcome = agent.run(credential).await?;

    store_identity(secrets.as_ref(), &args.identity_secret, &outcome.identity).await?;
    info!(
        cluster = %args.cluster_name,
        identity_secret = %args.identity_secret,
        "Spoke cluster registered and accepted"
    );
    Ok(())
}

/// Persist the issued identity on the spoke so later runs can use it
async fn store_identity(
    secrets: &dyn ResourceStore<Secret>,
    name: &str,
    identity: &IssuedIdentity,
) -> Result<(), Error> {
    let data = [
        (
            "cluster-name".to_string(),
            ByteString(identity.cluster_name().as_bytes().to_vec()),
        ),
        (
            "tls.crt".to_string(),
            ByteString(identity.certificate_pem().as_bytes().to_vec()),
        ),
        (
            "tls.key".to_string(),
            ByteString(identity.private_key_pem().as_bytes().to_vec()),
        ),
    ];

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        data: Some(data.clone().into()),
        type_: Some("kubernetes.io/tls".to_string()),
        ..Default::default()
    };

    match secrets.create(&secret).await {
        Ok(_) => Ok(()),
        Err(Error::AlreadyExists { .. }) => {
            let mut existing = secrets.get(name).await?;
            existing.data = Some(data.into());
            secrets.update(&existing).await.map(|_| ())
        }
        Err(e) => Err(e),
    }
}

/// Hub side: approve a spoke's signing requests once they appear
async fn run_approve(args: ApproveArgs, config: HandshakeConfig) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    let requests = KubeStore::new(Api::<CertificateSigningRequest>::all(client))
        .with_update_subresource("approval");
    let policy: Arc<dyn ApprovalPolicy> = match args.policy {
        PolicyArg::ApproveAll => Arc::new(ApproveAll),
        PolicyArg::Bootstrap => Arc::new(BootstrapRequesterPolicy),
    };

    let coordinator = ApprovalCoordinator::new(Arc::new(requests), policy)
        .with_retry(config.conflict_retry())
        .with_reason(&config.approval_reason, &config.approval_message);

    coordinator
        .wait_for_requests(&args.cluster_name, &config.csr_poll())
        .await?;
    for (name, outcome) in coordinator.approve_cluster(&args.cluster_name).await? {
        info!(request = %name, outcome = ?outcome, "Signing request decided");
    }
    Ok(())
}

/// Hub side: set hubAcceptsClient on a spoke's registration record
async fn run_accept(args: AcceptArgs, config: HandshakeConfig) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    let records: Arc<dyn ResourceStore<SpokeCluster>> =
        Arc::new(KubeStore::new(Api::<SpokeCluster>::all(client)));

    let acceptance = HubAcceptance::new(records.clone()).with_retry(config.conflict_retry());
    acceptance
        .wait_for_record(&args.cluster_name, &config.record_poll())
        .await?;
    let outcome = acceptance.accept(&args.cluster_name).await?;
    info!(cluster = %args.cluster_name, outcome = ?outcome, "Acceptance recorded");

    if args.wait {
        AcceptancePoller::new(records)
            .wait_for_acceptance(&args.cluster_name, &config.acceptance_poll())
            .await?;
        info!(cluster = %args.cluster_name, "HubAcceptedSpoke=True");
    }
    Ok(())
}

/// Hub side: long-running reconciler (and optional signer)
async fn run_controller(args: ControllerArgs, config: HandshakeConfig) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown requested");
            cancel.cancel();
        });
    }

    let reconciler = SpokeClusterReconciler::new(Arc::new(
        KubeStore::new(Api::<SpokeCluster>::all(client.clone())).with_update_subresource("status"),
    ))
    .with_retry(config.conflict_retry());

    let signer = match (&args.ca_cert, &args.ca_key) {
        (Some(cert), Some(key)) => {
            let ca = CertificateAuthority::from_pem(
                &tokio::fs::read_to_string(cert).await?,
                &tokio::fs::read_to_string(key).await?,
            )?;
            Some(
                CsrSigner::new(
                    Arc::new(
                        KubeStore::new(Api::<CertificateSigningRequest>::all(client))
                            .with_update_subresource("status"),
                    ),
                    Arc::new(ca),
                )
                .with_retry(config.conflict_retry()),
            )
        }
        _ => None,
    };

    let interval = config.reconcile_interval();
    let signing = async {
        match &signer {
            Some(signer) => signer.run(interval, cancel.clone()).await,
            None => info!("No hub CA configured, certificate signing left to the API server"),
        }
    };
    tokio::join!(reconciler.run(interval, cancel.clone()), signing);
    Ok(())
}
