//! Reconciliation loop for DataGridCluster.
//!
//! Each pass re-reads the cluster, its StatefulSet and pods, then:
//!
//! 1. validates the resource spec
//! 2. ensures secrets and services
//! 3. plans graceful shutdown and upgrades from persisted status
//! 4. applies the StatefulSet when its topology diverges
//! 5. checks cluster membership
//! 6. writes status when it changed
//!
//! No state is kept between passes except the listener registry and failure
//! counters in [`Context`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::{ResourceExt, runtime::controller::Action};
use tracing::{debug, error, info, warn};

use crate::client::Endpoint;
use crate::controller::cache_listener::CacheListener;
use crate::controller::cluster_state_machine::{LifecycleContext, LifecyclePhase, plan_lifecycle};
use crate::controller::cluster_topology::{ExpectedTopology, ObservedWorkload};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::membership::{Membership, await_membership};
use crate::controller::retry::RECONCILE_BACKOFF;
use crate::controller::status::ConditionBuilder;
use crate::controller::upgrade_state_machine::{
    UpgradeEvent, UpgradeTransitionContext, plan_upgrade,
};
use crate::crd::{
    ConditionType, DataGridCluster, DataGridClusterStatus, EncryptionType, UpgradeState,
};
use crate::resources::cache_template::{DEFAULT_CACHE_NAME, default_cache_template};
use crate::resources::common::{
    cpu_limit, memory_limit, parse_cpu_millis, parse_memory_bytes, pod_selector_labels,
    statefulset_name,
};
use crate::resources::{secrets, services, statefulset};

const KIND: &str = "DataGridCluster";

/// Requeue interval while pods, upgrades or shutdowns are in flight.
const PROGRESS_REQUEUE: Duration = Duration::from_secs(5);

/// Controller entry point.
pub async fn reconcile(obj: Arc<DataGridCluster>, ctx: Arc<Context>) -> Result<Action> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    let result = reconcile_cluster(&ctx, &namespace, &name).await;

    if result.is_ok() {
        ctx.failures.reset(&failure_key(&namespace, &name));
        if let Some(ref health_state) = ctx.health_state {
            health_state.metrics.record_reconcile(
                KIND,
                &namespace,
                &name,
                start_time.elapsed().as_secs_f64(),
            );
        }
    }
    result
}

/// Error policy for the controller
pub fn error_policy(obj: Arc<DataGridCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(KIND, &namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        let failures = ctx.failures.record_failure(&failure_key(&namespace, &name));
        warn!(name = %name, error = %error, failures, "Retryable error, will retry");
        Action::requeue(RECONCILE_BACKOFF.delay(failures))
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
        Action::requeue(error.requeue_after())
    }
}

fn failure_key(namespace: &str, name: &str) -> String {
    format!("{KIND}/{namespace}/{name}")
}

fn listener_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Reconcile the DataGridCluster `namespace/name`.
pub async fn reconcile_cluster(ctx: &Context, namespace: &str, name: &str) -> Result<Action> {
    let Some(cluster) = ctx.store.get_cluster(namespace, name).await? else {
        debug!(name = %name, namespace = %namespace, "Cluster not found, stopping listener");
        ctx.listeners.stop(&listener_key(namespace, name));
        return Ok(Action::await_change());
    };
    if cluster.is_deleting() {
        ctx.listeners.stop(&listener_key(namespace, name));
        return Ok(Action::await_change());
    }

    let current = cluster.status.clone().unwrap_or_default();

    // Preliminary checks
    if let Err(e) = validate_cluster(ctx, &cluster, namespace).await {
        return match e {
            Error::Validation(_) => reject(ctx, &cluster, &current, &e).await,
            e => Err(e),
        };
    }

    // Owned secrets and services
    ensure_secrets(ctx, &cluster).await?;
    let spec_changed = current.observed_generation != cluster.metadata.generation;

    // Observe the workload
    let sts_name = statefulset_name(&cluster);
    let live_sts = ctx.store.get_stateful_set(namespace, &sts_name).await?;
    if spec_changed || live_sts.is_none() {
        for service in services::generate_services(&cluster) {
            ctx.store.apply_service(&service).await?;
        }
    }
    let pods = ctx
        .store
        .list_pods(namespace, &pod_selector_labels(&cluster))
        .await?;
    let observed = ObservedWorkload::observe(live_sts.as_ref(), &pods);

    // Plan shutdown and upgrade
    let lifecycle = match plan_lifecycle(
        cluster.status.as_ref(),
        &LifecycleContext {
            spec_replicas: cluster.spec.replicas,
            workload_replicas: observed.replicas,
            running_pods: observed.running_pods,
            replicas_wanted_at_restart: current.replicas_wanted_at_restart,
        },
    ) {
        Ok(plan) => plan,
        Err(e @ Error::Validation(_)) => return reject(ctx, &cluster, &current, &e).await,
        Err(e) => return Err(e),
    };

    let mut upgrade_ctx = UpgradeTransitionContext {
        strategy: cluster.spec.upgrades.type_,
        desired_image: cluster.desired_image().to_string(),
        operand_image: current.operand_image.clone(),
        workload_image: observed.image.clone(),
        running_pods: observed.running_pods,
        rollout_complete: observed.rollout_complete,
        cluster_formed: false,
    };
    let mut upgrade = plan_upgrade(current.upgrade.as_ref(), &upgrade_ctx);
    if let Some(event) = upgrade.event {
        info!(name = %name, event = %event, state = %upgrade.state(), "Upgrade transition");
    }
    if upgrade.event == Some(UpgradeEvent::VersionChanged) {
        ctx.publish_normal_event(
            &cluster,
            "UpgradeStarted",
            "Upgrading",
            Some(format!("Upgrading to {}", cluster.desired_image())),
        )
        .await;
    }

    let replicas = if lifecycle.phase.holds_workload_down() || upgrade.holds_workload_down() {
        0
    } else {
        cluster.spec.replicas
    };
    let image = upgrade.workload_image(&upgrade_ctx).to_string();

    // Graceful shutdown: tell the servers before the pods go away
    if lifecycle.signal_shutdown() {
        info!(name = %name, "Graceful shutdown requested");
        signal_shutdown(ctx, &cluster, &observed).await;
        ctx.publish_normal_event(
            &cluster,
            "ShutdownRequested",
            "Stopping",
            Some("Scaling the cluster to zero".to_string()),
        )
        .await;
    }

    // Topology
    let expected = ExpectedTopology::for_cluster(&cluster, replicas, &image);
    let changes = expected.diff(live_sts.as_ref());
    if !changes.is_empty() {
        let summary: Vec<String> = changes.iter().map(ToString::to_string).collect();
        info!(name = %name, changes = ?summary, "Applying StatefulSet");
        ctx.store
            .apply_stateful_set(&statefulset::generate_statefulset(&cluster, replicas, &image))
            .await?;
    }

    // Membership
    let membership = if !changes.is_empty() {
        None
    } else if replicas == 0 {
        Some(Membership {
            formed: false,
            reason: "ClusterStopped",
            message: "the cluster has no members".to_string(),
        })
    } else if observed.ready_count() < replicas {
        Some(Membership::pods_not_ready(observed.ready_count(), replicas))
    } else {
        Some(await_membership(ctx, &cluster, &observed.ready_pods, replicas).await)
    };
    let formed = membership
        .as_ref()
        .map_or_else(|| cluster.is_well_formed(), |m| m.formed);

    // Only a membership check against the new pods completes an upgrade
    let members_verified = membership.as_ref().is_some_and(|m| m.formed);
    if members_verified && upgrade.state() == UpgradeState::WellFormed {
        upgrade_ctx.cluster_formed = true;
        upgrade = plan_upgrade(upgrade.upgrade.as_ref(), &upgrade_ctx);
        if upgrade.event == Some(UpgradeEvent::ClusterFormed) {
            info!(name = %name, image = ?upgrade.operand_image, "Upgrade complete");
            ctx.publish_normal_event(&cluster, "UpgradeCompleted", "Upgrading", None)
                .await;
        }
    }

    // Status
    let mut status = current.clone();
    status.observed_generation = cluster.metadata.generation;
    status.stateful_set_name = Some(sts_name);
    status.ready_replicas = observed.ready_count();
    status.replicas_wanted_at_restart = lifecycle.replicas_wanted_at_restart;
    status.upgrade = upgrade.upgrade.clone();
    status.operand_image = upgrade.operand_image.clone();
    if formed && !upgrade.in_progress() && status.operand_image.is_none() {
        status.operand_image = Some(image.clone());
    }

    let generation = cluster.metadata.generation;
    let mut conditions = ConditionBuilder::from_existing(&current.conditions);
    conditions.condition(
        ConditionType::PreliminaryChecksPassed,
        true,
        "ChecksPassed",
        "",
        generation,
    );
    if let Some(ref m) = membership {
        conditions.well_formed(m.formed, m.reason, &m.message, generation);
    }
    match upgrade.upgrade {
        Some(ref u) => conditions.condition(
            ConditionType::Upgrade,
            true,
            "Upgrading",
            &format!("{} to {}", u.state, u.target_image),
            generation,
        ),
        None => conditions.remove(ConditionType::Upgrade),
    };
    match lifecycle.phase {
        LifecyclePhase::Running => conditions
            .remove(ConditionType::Stopping)
            .remove(ConditionType::GracefulShutdown),
        LifecyclePhase::Stopping => conditions
            .condition(ConditionType::Stopping, true, "ScaledToZero", "", generation)
            .remove(ConditionType::GracefulShutdown),
        LifecyclePhase::Stopped => conditions
            .condition(ConditionType::Stopping, false, "PodsDrained", "", generation)
            .condition(
                ConditionType::GracefulShutdown,
                true,
                "PodsDrained",
                "all pods stopped",
                generation,
            ),
    };
    status.conditions = conditions.build();

    let became_formed = formed && !cluster.is_well_formed();
    if status != current {
        ctx.store
            .patch_cluster_status(namespace, name, &status)
            .await?;
    }
    if became_formed {
        ctx.publish_normal_event(&cluster, "WellFormed", "Reconciling", None)
            .await;
    }

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.set_cluster_state(
            namespace,
            name,
            formed,
            i64::from(cluster.spec.replicas),
            i64::from(observed.ready_count()),
        );
    }

    // Server-side follow-ups
    let mut in_flight = !changes.is_empty()
        || upgrade.in_progress()
        || lifecycle.phase == LifecyclePhase::Stopping
        || (replicas > 0 && !formed);

    if formed && !cluster.is_data_grid()
        && let Err(e) = ensure_default_cache(ctx, &cluster).await
    {
        warn!(name = %name, error = %e, "Unable to provision the default cache");
        in_flight = true;
    }
    sync_listener(ctx, &cluster, formed);

    if in_flight {
        Ok(Action::requeue(PROGRESS_REQUEUE))
    } else {
        Ok(Action::requeue(ctx.config.resync_interval))
    }
}

/// Spec checks that need no server access.
pub fn validate_spec(cluster: &DataGridCluster) -> Result<()> {
    if cluster.spec.replicas < 0 {
        return Err(Error::Validation("spec.replicas cannot be negative".to_string()));
    }
    let cpu = cpu_limit(cluster);
    if parse_cpu_millis(cpu).is_none_or(|m| m <= 0) {
        return Err(Error::Validation(format!("invalid container cpu '{cpu}'")));
    }
    let memory = memory_limit(cluster);
    if parse_memory_bytes(memory).is_none_or(|b| b <= 0) {
        return Err(Error::Validation(format!("invalid container memory '{memory}'")));
    }
    let encryption = &cluster.spec.security.endpoint_encryption;
    if encryption.type_ == EncryptionType::Secret && encryption.cert_secret_name.is_none() {
        return Err(Error::Validation(
            "spec.security.endpointEncryption.certSecretName is required for type Secret"
                .to_string(),
        ));
    }
    Ok(())
}

async fn validate_cluster(ctx: &Context, cluster: &DataGridCluster, namespace: &str) -> Result<()> {
    validate_spec(cluster)?;
    let encryption = &cluster.spec.security.endpoint_encryption;
    if encryption.type_ == EncryptionType::Secret
        && let Some(ref secret_name) = encryption.cert_secret_name
        && ctx.store.get_secret(namespace, secret_name).await?.is_none()
    {
        return Err(Error::Validation(format!(
            "encryption secret {secret_name} not found"
        )));
    }
    if !cluster.spec.security.endpoint_authentication
        && let Some(ref secret_name) = cluster.spec.security.endpoint_secret_name
    {
        debug!(secret = %secret_name, "Endpoint secret ignored, authentication is disabled");
    }
    Ok(())
}

/// Record a terminal validation failure and wait for a spec change.
async fn reject(
    ctx: &Context,
    cluster: &DataGridCluster,
    current: &DataGridClusterStatus,
    e: &Error,
) -> Result<Action> {
    let name = cluster.name_any();
    warn!(name = %name, error = %e, "Validation failed");

    let mut conditions = ConditionBuilder::from_existing(&current.conditions);
    conditions.condition(
        ConditionType::PreliminaryChecksPassed,
        false,
        e.reason(),
        &e.to_string(),
        cluster.metadata.generation,
    );
    let status = DataGridClusterStatus {
        conditions: conditions.build(),
        ..current.clone()
    };
    if status != *current {
        let namespace = cluster.namespace().unwrap_or_default();
        ctx.store
            .patch_cluster_status(&namespace, &name, &status)
            .await?;
        ctx.publish_warning_event(cluster, e.reason(), "Validating", Some(e.to_string()))
            .await;
    }
    Ok(Action::await_change())
}

/// Create the identity secrets unless they already exist.
async fn ensure_secrets(ctx: &Context, cluster: &DataGridCluster) -> Result<()> {
    let namespace = cluster.namespace().unwrap_or_default();
    let mut wanted = vec![(cluster.operator_secret_name(), None)];
    if let Some(endpoint) = secrets::generate_endpoint_secret(cluster) {
        wanted.push((cluster.endpoint_secret_name(), Some(endpoint)));
    }

    for (secret_name, generated) in wanted {
        if ctx.store.get_secret(&namespace, &secret_name).await?.is_some() {
            continue;
        }
        let secret = match generated {
            Some(secret) => secret?,
            None => secrets::generate_operator_secret(cluster)?,
        };
        info!(secret = %secret_name, "Creating identities secret");
        match ctx.store.create_secret(&secret).await {
            Err(e) if e.is_conflict() => debug!(secret = %secret_name, "Secret already exists"),
            other => other?,
        }
    }
    Ok(())
}

/// Ask a running server to persist state and stop. Failures are logged only.
async fn signal_shutdown(ctx: &Context, cluster: &DataGridCluster, observed: &ObservedWorkload) {
    let Some(pod) = observed.ready_pods.first() else {
        debug!("No ready pod to signal shutdown to");
        return;
    };
    let endpoint = Endpoint::Pod {
        name: pod.name.clone(),
        ip: pod.ip.clone(),
    };
    let result = match ctx.connector.connect(cluster, endpoint).await {
        Ok(client) => client.shutdown_container().await.map_err(Error::from),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!(pod = %pod.name, error = %e, "Container shutdown signal failed");
    }
}

/// Cache service clusters always provide the default cache.
async fn ensure_default_cache(ctx: &Context, cluster: &DataGridCluster) -> Result<()> {
    let client = ctx.connector.connect(cluster, Endpoint::Service).await?;
    if client.cache_exists(DEFAULT_CACHE_NAME).await? {
        return Ok(());
    }
    let template = default_cache_template(cluster, DEFAULT_CACHE_NAME)?;
    client
        .create_cache(DEFAULT_CACHE_NAME, &template, crate::client::MediaType::Xml)
        .await?;
    info!(name = %cluster.name_any(), "Created default cache");
    Ok(())
}

/// Run the cache listener for WellFormed DataGrid clusters, stop it otherwise.
fn sync_listener(ctx: &Context, cluster: &DataGridCluster, formed: bool) {
    let namespace = cluster.namespace().unwrap_or_default();
    let key = listener_key(&namespace, &cluster.name_any());

    if !(formed && cluster.is_data_grid() && ctx.config.listener_enabled) {
        if ctx.listeners.stop(&key) {
            info!(cluster = %key, "Stopped cache listener");
        }
        return;
    }

    let listener = match CacheListener::new(ctx.store.clone(), ctx.connector.clone(), cluster.clone())
    {
        Ok(listener) => listener.with_health_state(ctx.health_state.clone()),
        Err(e) => {
            warn!(cluster = %key, error = %e, "Unable to build cache listener");
            return;
        }
    };
    let interval = ctx.config.stale_sweep_interval;
    if ctx
        .listeners
        .ensure_running(&key, || tokio::spawn(listener.run(interval)))
    {
        info!(cluster = %key, "Started cache listener");
    }
}
