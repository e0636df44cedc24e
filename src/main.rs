//! datagrid-operator entry point.
//!
//! Starts the health server, waits for the leader lease, then runs the
//! DataGridCluster and Cache controllers until a signal arrives or the lease
//! is lost.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use datagrid_operator::OperatorConfig;
use datagrid_operator::health::{HealthState, run_health_server};
use datagrid_operator::run_controllers;

const LEASE_NAME: &str = "datagrid-operator-leader";
const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Time given to in-flight reconciliations after readiness is withdrawn.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::from_default_env()
        .add_directive("datagrid_operator=info".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("kube_leader_election=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).json().init();
    Ok(())
}

/// Lease held by the active operator replica.
struct Leadership {
    lock: LeaseLock,
}

impl Leadership {
    fn new(client: Client, config: &OperatorConfig) -> Self {
        let lock = LeaseLock::new(
            client,
            &config.pod_namespace,
            LeaseLockParams {
                holder_id: config.pod_name.clone(),
                lease_name: LEASE_NAME.to_string(),
                lease_ttl: LEASE_TTL,
            },
        );
        Self { lock }
    }

    /// Block until this replica holds the lease.
    async fn acquire(&self) {
        loop {
            match self.lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {
                    info!("Acquired leadership");
                    return;
                }
                Ok(_) => info!("Another replica holds the lease, waiting"),
                Err(e) => warn!(error = %e, "Failed to acquire lease, retrying"),
            }
            tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
        }
    }

    /// Renew the lease until renewal fails; returns the reason.
    async fn hold(self) -> String {
        loop {
            tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
            match self.lock.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {}
                Ok(_) => return "lease taken over by another replica".to_string(),
                Err(e) => return format!("lease renewal failed: {e}"),
            }
        }
    }
}

fn spawn_health_server(state: Arc<HealthState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = run_health_server(state).await {
            error!(error = %e, "Health server failed");
        }
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;

    let config = OperatorConfig::from_env();
    info!(
        pod = %config.pod_name,
        namespace = %config.pod_namespace,
        scope = config.watch_namespace.as_deref().unwrap_or("cluster-wide"),
        "Starting datagrid-operator"
    );

    let client = Client::try_default().await?;
    let health_state = Arc::new(HealthState::new());

    // Probes answer before leadership so non-leaders stay live
    let health_handle = spawn_health_server(health_state.clone());

    let leadership = Leadership::new(client.clone(), &config);
    info!(lease = LEASE_NAME, "Waiting for leadership");
    leadership.acquire().await;

    let controllers = run_controllers(client, config, Some(health_state.clone()));

    tokio::select! {
        () = controllers => {
            error!("Controllers stopped unexpectedly");
        }
        result = health_handle => {
            if let Err(e) = result {
                error!(error = %e, "Health server task panicked");
            }
        }
        reason = leadership.hold() => {
            // Exit non-zero so the pod restarts and rejoins the election
            error!(%reason, "Lost leadership, exiting");
            return Err(reason.into());
        }
        result = shutdown_signal() => {
            result?;
            info!("Received shutdown signal");
            health_state.set_ready(false).await;
            info!(
                grace_secs = SHUTDOWN_GRACE_PERIOD.as_secs(),
                "Draining in-flight reconciliations"
            );
            tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    signal::ctrl_c().await
}
