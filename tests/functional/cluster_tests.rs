//! DataGridCluster scenarios: formation, validation, graceful shutdown and
//! upgrades, each driven through several reconciliation passes.

use std::time::Duration;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;

use datagrid_operator::crd::{
    ConditionType, DEFAULT_IMAGE, EncryptionType, ServiceType, UpgradeState, UpgradeStrategy,
};
use datagrid_operator::resources::cache_template::DEFAULT_CACHE_NAME;
use datagrid_operator::resources::statefulset::CONTAINER_NAME;

use crate::mock_state::*;

const NEXT_IMAGE: &str = "quay.io/infinispan/server:15.1";

fn workload_replicas(h: &Harness, cluster: &str) -> i32 {
    h.store
        .stateful_set(cluster)
        .and_then(|s| s.spec)
        .and_then(|s| s.replicas)
        .unwrap()
}

fn workload_image(h: &Harness, cluster: &str) -> String {
    let sts = h.store.stateful_set(cluster).unwrap();
    sts.spec
        .unwrap()
        .template
        .spec
        .unwrap()
        .containers
        .into_iter()
        .find(|c| c.name == CONTAINER_NAME)
        .and_then(|c| c.image)
        .unwrap()
}

fn upgrade_state(h: &Harness, cluster: &str) -> UpgradeState {
    h.store
        .cluster_status(cluster)
        .upgrade
        .map_or(UpgradeState::None, |u| u.state)
}

// ============================================================================
// Formation
// ============================================================================

/// A single-member cluster is WellFormed once its only pod reports a view of
/// one member; the first pass only creates the workload.
#[tokio::test]
async fn test_single_member_cluster_forms() {
    let h = Harness::new();
    h.store
        .insert_cluster(cluster("example", 1, ServiceType::DataGrid));
    h.grid.set_cluster_size(1);

    let action = h.reconcile_cluster("example").await;
    assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    let status = h.store.cluster_status("example");
    assert!(!status.is_condition_true(ConditionType::WellFormed));
    assert!(status.is_condition_true(ConditionType::PreliminaryChecksPassed));
    assert_eq!(workload_replicas(&h, "example"), 1);
    assert_eq!(h.grid.lock().size_queries, 0);
    assert_eq!(h.store.lock().secrets.len(), 2);
    assert!(h.store.lock().service_applies >= 3);

    h.store.settle_workload("example");
    h.reconcile_cluster("example").await;

    let status = h.store.cluster_status("example");
    let well_formed = cluster_condition(&status, ConditionType::WellFormed).unwrap();
    assert!(well_formed.is_true());
    assert_eq!(well_formed.reason, "ClusterFormed");
    assert_eq!(status.ready_replicas, 1);
    assert_eq!(status.operand_image.as_deref(), Some(DEFAULT_IMAGE));
    assert_eq!(h.grid.lock().size_queries, 1);
}

/// Reconciling a converged cluster again writes nothing.
#[tokio::test]
async fn test_converged_cluster_is_idempotent() {
    let h = Harness::new();
    h.converge(cluster("example", 3, ServiceType::DataGrid))
        .await;

    let writes = h.store.writes();
    let action = h.reconcile_cluster("example").await;

    assert_eq!(h.store.writes(), writes);
    assert_eq!(action, Action::requeue(h.ctx.config.resync_interval));
    assert!(h.store.cluster("example").is_well_formed());
}

/// Quantities rewritten by the API server do not trigger another rollout.
#[tokio::test]
async fn test_canonicalized_quantities_converge() {
    let h = Harness::new();
    let mut resource = cluster("example", 2, ServiceType::DataGrid);
    resource.spec.container.cpu = Some("2".to_string());
    resource.spec.container.memory = Some("1024Mi".to_string());
    h.converge(resource).await;

    let applies = h.store.lock().stateful_set_applies;
    h.reconcile_cluster("example").await;

    assert_eq!(h.store.lock().stateful_set_applies, applies);
    assert!(h.store.cluster("example").is_well_formed());
}

/// Members that do not all see each other keep the cluster forming.
#[tokio::test]
async fn test_partial_membership_is_not_well_formed() {
    let h = Harness::new();
    h.store
        .insert_cluster(cluster("example", 3, ServiceType::DataGrid));
    h.grid.set_cluster_size(2);

    h.reconcile_cluster("example").await;
    h.store.settle_workload("example");
    let action = h.reconcile_cluster("example").await;

    let status = h.store.cluster_status("example");
    let well_formed = cluster_condition(&status, ConditionType::WellFormed).unwrap();
    assert!(!well_formed.is_true());
    assert_eq!(well_formed.reason, "ClusterForming");
    assert_eq!(action, Action::requeue(Duration::from_secs(5)));

    h.grid.set_cluster_size(3);
    h.reconcile_cluster("example").await;
    assert!(h.store.cluster("example").is_well_formed());
}

/// Pods that are not ready yet are reported without asking the servers.
#[tokio::test]
async fn test_missing_pods_report_not_ready() {
    let h = Harness::new();
    h.store
        .insert_cluster(cluster("example", 2, ServiceType::DataGrid));

    h.reconcile_cluster("example").await;
    h.reconcile_cluster("example").await;

    let status = h.store.cluster_status("example");
    let well_formed = cluster_condition(&status, ConditionType::WellFormed).unwrap();
    assert_eq!(well_formed.reason, "PodsNotReady");
    assert_eq!(h.grid.lock().size_queries, 0);
}

/// Cache service clusters provide the default cache once formed.
#[tokio::test]
async fn test_cache_service_provisions_default_cache() {
    let h = Harness::new();
    h.converge(cluster("example", 1, ServiceType::Cache)).await;

    let (config, _) = h.grid.cache_config(DEFAULT_CACHE_NAME).unwrap();
    assert!(config.contains(r#"name="default""#));

    h.reconcile_cluster("example").await;
    assert_eq!(h.grid.calls(), vec!["create default".to_string()]);
}

/// DataGrid clusters get no default cache.
#[tokio::test]
async fn test_data_grid_cluster_has_no_default_cache() {
    let h = Harness::new();
    h.converge(cluster("example", 1, ServiceType::DataGrid))
        .await;

    assert!(h.grid.cache_config(DEFAULT_CACHE_NAME).is_none());
    assert!(h.grid.calls().is_empty());
}

// ============================================================================
// Validation
// ============================================================================

/// An invalid spec is reported and nothing is deployed.
#[tokio::test]
async fn test_invalid_spec_is_rejected() {
    let h = Harness::new();
    h.store
        .insert_cluster(cluster("example", -1, ServiceType::DataGrid));

    let action = h.reconcile_cluster("example").await;

    assert_eq!(action, Action::await_change());
    let status = h.store.cluster_status("example");
    let checks = cluster_condition(&status, ConditionType::PreliminaryChecksPassed).unwrap();
    assert!(!checks.is_true());
    assert!(checks.message.contains("replicas"));
    assert!(h.store.stateful_set("example").is_none());

    let writes = h.store.writes();
    h.reconcile_cluster("example").await;
    assert_eq!(h.store.writes(), writes);
}

/// Encryption from a secret waits for the secret to exist.
#[tokio::test]
async fn test_missing_encryption_secret_blocks_deployment() {
    let h = Harness::new();
    let mut resource = cluster("example", 1, ServiceType::DataGrid);
    resource.spec.security.endpoint_encryption.type_ = EncryptionType::Secret;
    resource.spec.security.endpoint_encryption.cert_secret_name = Some("example-tls".to_string());
    h.store.insert_cluster(resource);

    h.reconcile_cluster("example").await;
    let status = h.store.cluster_status("example");
    let checks = cluster_condition(&status, ConditionType::PreliminaryChecksPassed).unwrap();
    assert!(!checks.is_true());
    assert!(checks.message.contains("example-tls"));
    assert!(h.store.stateful_set("example").is_none());

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some("example-tls".to_string()),
            namespace: Some(NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(
            [("tls.crt".to_string(), ByteString(b"cert".to_vec()))]
                .into_iter()
                .collect(),
        ),
        ..Default::default()
    };
    h.store
        .lock()
        .secrets
        .insert((NAMESPACE.to_string(), "example-tls".to_string()), secret);

    h.reconcile_cluster("example").await;
    let status = h.store.cluster_status("example");
    assert!(status.is_condition_true(ConditionType::PreliminaryChecksPassed));
    assert!(h.store.stateful_set("example").is_some());
}

// ============================================================================
// Graceful shutdown
// ============================================================================

/// Scaling to zero stops the servers gracefully; a restart must bring back
/// the replica count the cluster was stopped with.
#[tokio::test]
async fn test_graceful_shutdown_and_restart() {
    let h = Harness::new();
    h.converge(cluster("example", 2, ServiceType::DataGrid))
        .await;

    // Shutdown requested
    h.store.edit_cluster("example", |spec| spec.replicas = 0);
    h.reconcile_cluster("example").await;

    assert_eq!(h.grid.calls(), vec!["shutdown".to_string()]);
    assert_eq!(workload_replicas(&h, "example"), 0);
    let status = h.store.cluster_status("example");
    assert!(status.is_condition_true(ConditionType::Stopping));
    assert_eq!(status.replicas_wanted_at_restart, Some(2));

    // Pods drained
    h.store.settle_workload("example");
    h.reconcile_cluster("example").await;

    let status = h.store.cluster_status("example");
    assert!(status.is_condition_true(ConditionType::GracefulShutdown));
    assert!(!status.is_condition_true(ConditionType::Stopping));
    assert!(!status.is_condition_true(ConditionType::WellFormed));

    // Restart with another size is refused
    h.store.edit_cluster("example", |spec| spec.replicas = 3);
    let action = h.reconcile_cluster("example").await;

    assert_eq!(action, Action::await_change());
    let status = h.store.cluster_status("example");
    let checks = cluster_condition(&status, ConditionType::PreliminaryChecksPassed).unwrap();
    assert!(!checks.is_true());
    assert!(checks.message.contains('2'));
    assert_eq!(workload_replicas(&h, "example"), 0);

    // Restart with the remembered size
    h.store.edit_cluster("example", |spec| spec.replicas = 2);
    h.reconcile_cluster("example").await;

    assert_eq!(workload_replicas(&h, "example"), 2);
    let status = h.store.cluster_status("example");
    assert!(status.condition(ConditionType::GracefulShutdown).is_none());
    assert_eq!(status.replicas_wanted_at_restart, None);
    assert!(status.is_condition_true(ConditionType::PreliminaryChecksPassed));

    h.store.settle_workload("example");
    h.reconcile_cluster("example").await;
    assert!(h.store.cluster("example").is_well_formed());
}

// ============================================================================
// Upgrades
// ============================================================================

/// The shutdown strategy stops the old members before starting the new image.
#[tokio::test]
async fn test_shutdown_upgrade() {
    let h = Harness::new();
    let mut resource = cluster("example", 2, ServiceType::DataGrid);
    resource.spec.upgrades.type_ = UpgradeStrategy::Shutdown;
    h.converge(resource).await;

    h.store
        .edit_cluster("example", |spec| spec.image = Some(NEXT_IMAGE.to_string()));

    // New image held back
    h.reconcile_cluster("example").await;
    assert_eq!(upgrade_state(&h, "example"), UpgradeState::Upgrading);
    assert_eq!(workload_image(&h, "example"), DEFAULT_IMAGE);
    assert_eq!(workload_replicas(&h, "example"), 2);
    let status = h.store.cluster_status("example");
    assert!(status.is_condition_true(ConditionType::Upgrade));

    // Old members stopped
    h.reconcile_cluster("example").await;
    assert_eq!(upgrade_state(&h, "example"), UpgradeState::Stopping);
    assert_eq!(workload_replicas(&h, "example"), 0);
    assert_eq!(workload_image(&h, "example"), DEFAULT_IMAGE);

    // New members started
    h.store.settle_workload("example");
    h.reconcile_cluster("example").await;
    assert_eq!(upgrade_state(&h, "example"), UpgradeState::WellFormed);
    assert_eq!(workload_replicas(&h, "example"), 2);
    assert_eq!(workload_image(&h, "example"), NEXT_IMAGE);
    assert_eq!(
        h.store.cluster_status("example").operand_image.as_deref(),
        Some(DEFAULT_IMAGE)
    );

    // Cluster re-formed
    h.store.settle_workload("example");
    h.reconcile_cluster("example").await;
    let status = h.store.cluster_status("example");
    assert_eq!(status.upgrade, None);
    assert_eq!(status.operand_image.as_deref(), Some(NEXT_IMAGE));
    assert!(status.condition(ConditionType::Upgrade).is_none());
    assert!(status.is_condition_true(ConditionType::WellFormed));
}

/// The rolling strategy hands the new image to the StatefulSet rollout.
#[tokio::test]
async fn test_rolling_upgrade() {
    let h = Harness::new();
    let mut resource = cluster("example", 3, ServiceType::DataGrid);
    resource.spec.upgrades.type_ = UpgradeStrategy::Rolling;
    h.converge(resource).await;

    h.store
        .edit_cluster("example", |spec| spec.image = Some(NEXT_IMAGE.to_string()));

    h.reconcile_cluster("example").await;
    assert_eq!(upgrade_state(&h, "example"), UpgradeState::Upgrading);
    assert_eq!(workload_image(&h, "example"), NEXT_IMAGE);
    assert_eq!(workload_replicas(&h, "example"), 3);

    h.store.settle_workload("example");
    h.reconcile_cluster("example").await;

    let status = h.store.cluster_status("example");
    assert_eq!(status.upgrade, None);
    assert_eq!(status.operand_image.as_deref(), Some(NEXT_IMAGE));
    assert!(status.is_condition_true(ConditionType::WellFormed));
    assert!(h.grid.calls().is_empty());
}

/// Reverting the image before the old members stop cancels the upgrade.
#[tokio::test]
async fn test_reverted_image_cancels_upgrade() {
    let h = Harness::new();
    h.converge(cluster("example", 2, ServiceType::DataGrid))
        .await;

    h.store
        .edit_cluster("example", |spec| spec.image = Some(NEXT_IMAGE.to_string()));
    h.reconcile_cluster("example").await;
    assert_eq!(upgrade_state(&h, "example"), UpgradeState::Upgrading);

    h.store
        .edit_cluster("example", |spec| spec.image = Some(DEFAULT_IMAGE.to_string()));
    h.reconcile_cluster("example").await;

    let status = h.store.cluster_status("example");
    assert_eq!(status.upgrade, None);
    assert!(status.condition(ConditionType::Upgrade).is_none());
    assert_eq!(status.operand_image.as_deref(), Some(DEFAULT_IMAGE));
    assert_eq!(workload_replicas(&h, "example"), 2);
}

// ============================================================================
// Event listener lifecycle
// ============================================================================

/// The cache listener runs while a DataGrid cluster is WellFormed and stops
/// once the cluster is gone.
#[tokio::test]
async fn test_listener_follows_cluster() {
    let h = Harness::with_config(datagrid_operator::OperatorConfig {
        listener_enabled: true,
        ..test_config()
    });
    h.converge(cluster("example", 1, ServiceType::DataGrid))
        .await;
    assert!(h.ctx.listeners.is_running("grid/example"));

    h.store.remove_cluster("example");
    let action = h.reconcile_cluster("example").await;

    assert_eq!(action, Action::await_change());
    assert!(!h.ctx.listeners.is_running("grid/example"));
}

/// Cache service clusters never mirror server changes.
#[tokio::test]
async fn test_no_listener_for_cache_service() {
    let h = Harness::with_config(datagrid_operator::OperatorConfig {
        listener_enabled: true,
        ..test_config()
    });
    h.converge(cluster("example", 1, ServiceType::Cache)).await;
    assert!(!h.ctx.listeners.is_running("grid/example"));
}
