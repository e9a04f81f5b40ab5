//! bkapp-operator entry point.
//!
//! Startup order: JSON logging, configuration from the environment, the
//! health server, leader election on a Lease, then the BkApp and
//! DomainGroupMapping controllers. SIGTERM/SIGINT marks the operator unready
//! and gives in-flight passes a short grace period.

use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;
use kube::Client;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use bkapp_operator::OperatorConfig;
use bkapp_operator::health::{HealthState, run_health_server};
use bkapp_operator::leader::LeaderLock;
use bkapp_operator::run_controller;

const LEASE_NAME: &str = "bkapp-operator-leader";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on the shutdown grace period.
const MAX_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Who competes for the lease, and where the lease lives.
#[derive(Debug, Clone)]
struct Identity {
    holder: String,
    namespace: String,
}

impl Identity {
    fn from_env() -> Self {
        let holder = std::env::var("POD_NAME").unwrap_or_else(|_| {
            warn!("POD_NAME not set, using hostname");
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        });
        let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| {
            warn!("POD_NAMESPACE not set, using 'default'");
            "default".to_string()
        });
        Self { holder, namespace }
    }

    fn lease_lock(&self, client: Client) -> LeaderLock {
        LeaderLock::new(client, &self.namespace, LEASE_NAME, &self.holder, LEASE_TTL)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bkapp_operator=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .json()
        .init();

    let config = OperatorConfig::init_from_env()?;
    config.validate()?;
    let config = Arc::new(config);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = config.watch_namespace.as_deref().unwrap_or("*"),
        autoscaling = config.autoscaling_enabled,
        concurrency = config.max_concurrent_reconciles,
        "Starting bkapp-operator"
    );

    let client = Client::try_default().await?;
    let identity = Identity::from_env();
    let health_state = Arc::new(HealthState::new());

    // Health checks must answer while this replica is still a follower
    let health_handle: JoinHandle<()> = {
        let health_state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!(error = %e, "Health server failed");
            }
        })
    };

    let election_lock = identity.lease_lock(client.clone());
    tokio::select! {
        _ = acquire_leadership(&election_lock, &identity) => {}
        _ = shutdown_signal() => {
            info!("Shutdown requested before leadership was acquired");
            return Ok(());
        }
    }

    let renewal_handle = spawn_lease_renewal(identity.lease_lock(client.clone()));
    let controller_handle: JoinHandle<()> = {
        let health_state = health_state.clone();
        let config = config.clone();
        tokio::spawn(async move {
            run_controller(client, config, Some(health_state)).await;
        })
    };

    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!(error = %e, "Health server task panicked");
            }
        }
        // Renewal only returns by panicking; losing the lease exits the process
        Err(e) = renewal_handle => {
            error!(error = %e, "Lease renewal task panicked");
        }
        _ = shutdown_signal() => {
            health_state.set_ready(false).await;
            let grace = config.reconcile_timeout().min(MAX_SHUTDOWN_GRACE);
            info!(grace_secs = grace.as_secs(), "Shutdown requested, draining in-flight reconciles");
            tokio::time::sleep(grace).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Block until this replica holds the lease.
async fn acquire_leadership(lock: &LeaderLock, identity: &Identity) {
    info!(
        holder_id = %identity.holder,
        namespace = %identity.namespace,
        lease_name = LEASE_NAME,
        "Waiting to acquire leadership"
    );
    loop {
        match lock.try_acquire_or_renew().await {
            Ok(true) => {
                info!("Acquired leadership");
                return;
            }
            Ok(false) => info!("Another replica holds the lease, waiting"),
            Err(e) => warn!(error = %e, "Failed to acquire lease, retrying"),
        }
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
    }
}

/// Renew the lease forever. Losing it exits the process so Kubernetes
/// restarts the pod into a fresh election.
#[allow(clippy::exit)]
fn spawn_lease_renewal(lock: LeaderLock) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
            match lock.try_acquire_or_renew().await {
                Ok(true) => {}
                Ok(false) => {
                    error!("Lost leadership, exiting");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(error = %e, "Failed to renew lease, exiting");
                    std::process::exit(1);
                }
            }
        }
    })
}

/// Resolve on SIGTERM or SIGINT. A handler that cannot be installed never
/// resolves, leaving the other signal in charge.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
