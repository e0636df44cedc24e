//! datagrid-operator library crate
//!
//! This module exports the controllers, CRD definitions, clients and resource
//! generators.

pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;

pub use config::OperatorConfig;
pub use health::HealthState;

use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Service;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, WatchStreamExt, metadata_watcher, predicates, reflector, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use controller::context::Context;
use controller::{cache_reconciler, cluster_reconciler};
use crd::{Cache, DataGridCluster};

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Create the default watcher configuration for all controllers.
///
/// This ensures consistent behavior across all controllers:
/// - `any_semantic()`: More reliable resource discovery in test environments
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Create a filtered stream for a resource type with standard optimizations.
///
/// This creates a reflector-backed stream that:
/// - Maintains an in-memory cache via reflector
/// - Uses automatic retry with exponential backoff on errors
/// - Converts watch events to objects (Added/Modified only)
/// - Filters out status-only updates via `predicate`
///
/// Returns the reflector store (for cache lookups) and the filtered stream.
fn create_filtered_stream<K>(
    api: Api<K>,
    watcher_config: WatcherConfig,
    predicate: fn(&K) -> Option<u64>,
) -> (
    reflector::Store<K>,
    impl Stream<Item = Result<K, watcher::Error>>,
)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicate);
    (reader, stream)
}

/// Log a controller result, demoting not-found errors to debug.
async fn log_result<K, E>(
    result: Result<(ObjectRef<K>, kube::runtime::controller::Action), kube::runtime::controller::Error<E, watcher::Error>>,
    is_not_found: impl Fn(&E) -> bool,
) where
    K: Resource,
    E: std::error::Error + 'static,
{
    match result {
        Ok((obj, _action)) => {
            debug!("Reconciled: {}", obj.name);
        }
        Err(e) => {
            // Related watch events can trigger reconciliation of an object
            // that was just deleted.
            let not_found = match &e {
                kube::runtime::controller::Error::ObjectNotFound(_) => true,
                kube::runtime::controller::Error::ReconcilerFailed(err, _) => is_not_found(err),
                _ => false,
            };
            if not_found {
                debug!("Object no longer exists (likely deleted): {:?}", e);
            } else {
                error!("Reconciliation error: {:?}", e);
            }
        }
    }
}

/// Run both controllers (cluster-wide unless `config.watch_namespace` is set).
///
/// If health_state is provided, metrics will be recorded for reconciliations.
pub async fn run_controllers(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
) {
    let namespace = config.watch_namespace.clone();
    let namespace = namespace.as_deref();
    info!(
        "Starting controllers for DataGridCluster and Cache resources (scope: {})",
        namespace.unwrap_or("cluster-wide")
    );

    // Mark as ready once we start the controllers
    if let Some(ref state) = health_state {
        state.set_ready(true).await;
    }

    let ctx = Arc::new(Context::new(client.clone(), config, health_state));

    let clusters: Api<DataGridCluster> = scoped_api(client.clone(), namespace);
    let caches: Api<Cache> = scoped_api(client.clone(), namespace);
    let statefulsets: Api<StatefulSet> = scoped_api(client.clone(), namespace);
    let services: Api<Service> = scoped_api(client.clone(), namespace);

    let watcher_config = default_watcher_config();

    // DataGridCluster controller. StatefulSet status drives membership, so
    // it is watched in full; services only need metadata.
    let (cluster_reader, cluster_stream) = create_filtered_stream(
        clusters.clone(),
        watcher_config.clone(),
        predicates::generation,
    );
    let cluster_controller = Controller::for_stream(cluster_stream, cluster_reader)
        .owns(statefulsets, watcher_config.clone())
        .owns_stream(metadata_watcher(services, watcher_config.clone()).touched_objects())
        .run(
            cluster_reconciler::reconcile,
            cluster_reconciler::error_policy,
            ctx.clone(),
        )
        .for_each(|result| log_result(result, controller::error::Error::is_not_found));

    // Cache controller. Cluster status changes (WellFormed) re-enqueue the
    // caches of that cluster, looked up in the cache reflector store.
    // Listener markers are annotation-only changes and must pass the filter
    let (cache_reader, cache_stream) = create_filtered_stream(
        caches,
        watcher_config.clone(),
        cache_reconciler::cache_change_predicate,
    );
    let cache_store = cache_reader.clone();
    let cache_controller = Controller::for_stream(cache_stream, cache_reader)
        .watches(clusters, watcher_config, move |cluster: DataGridCluster| {
            let ready = cluster.is_well_formed() && !cluster.is_deleting();
            let name = cluster.name_any();
            let namespace = cluster.namespace();
            let refs: Vec<ObjectRef<Cache>> = if ready {
                cache_store
                    .state()
                    .iter()
                    .filter(|c| c.spec.cluster_name == name && c.namespace() == namespace)
                    .map(|c| ObjectRef::from_obj(c.as_ref()))
                    .collect()
            } else {
                Vec::new()
            };
            refs
        })
        .run(
            cache_reconciler::reconcile,
            cache_reconciler::error_policy,
            ctx,
        )
        .for_each(|result| log_result(result, controller::error::Error::is_not_found));

    tokio::join!(cluster_controller, cache_controller);

    // This should never complete in normal operation
    error!("Controller streams ended unexpectedly");
}
