//! Reconciliation loop for Cache.
//!
//! Pushes the declared cache configuration to the data grid server of the
//! owning cluster and removes the cache from the server when the resource is
//! deleted. Specs written by the event listener already reflect the server
//! state and are only acknowledged, never pushed back.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use kube::{ResourceExt, runtime::controller::Action};
use tracing::{debug, error, info, warn};

use crate::client::{DataGridClient, Endpoint, MediaType};
use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::retry::RECONCILE_BACKOFF;
use crate::controller::status::ConditionBuilder;
use crate::crd::{Cache, CacheLifecycle, CacheStatus, DataGridCluster};
use crate::resources::cache_template::default_cache_template;

const KIND: &str = "Cache";

/// What the server sync did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSync {
    /// The server already holds this generation.
    Skipped,
    Created,
    Updated,
    /// The cache exists and nothing in the resource spec needs to be pushed.
    Unchanged,
}

/// Watch predicate for Cache objects.
///
/// The listener's origin and delete markers are annotations and do not move
/// `metadata.generation`, so they are part of the key alongside it.
pub fn cache_change_predicate(cache: &Cache) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    cache.metadata.generation.hash(&mut hasher);
    cache.metadata.annotations.hash(&mut hasher);
    cache.metadata.deletion_timestamp.is_some().hash(&mut hasher);
    Some(hasher.finish())
}

/// Controller entry point.
pub async fn reconcile(obj: Arc<Cache>, ctx: Arc<Context>) -> Result<Action> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    let result = reconcile_cache(&ctx, &namespace, &name).await;

    if result.is_ok()
        && let Some(ref health_state) = ctx.health_state
    {
        health_state.metrics.record_reconcile(
            KIND,
            &namespace,
            &name,
            start_time.elapsed().as_secs_f64(),
        );
    }
    result
}

/// Error policy for the controller
pub fn error_policy(obj: Arc<Cache>, error: &Error, ctx: Arc<Context>) -> Action {
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
        let failures = ctx.failures.record_failure(&format!("{KIND}/{namespace}/{name}"));
        warn!(name = %name, error = %error, failures, "Retryable error, will retry");
        Action::requeue(RECONCILE_BACKOFF.delay(failures))
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
        Action::requeue(error.requeue_after())
    }
}

/// Reconcile the Cache `namespace/name`.
pub async fn reconcile_cache(ctx: &Context, namespace: &str, name: &str) -> Result<Action> {
    let Some(cache) = ctx.store.get_cache(namespace, name).await? else {
        debug!(name = %name, namespace = %namespace, "Cache not found, ignoring");
        return Ok(Action::await_change());
    };
    let failure_key = format!("{KIND}/{namespace}/{name}");

    // The listener saw the cache disappear from the server
    if cache.lifecycle() == CacheLifecycle::PendingServerDelete {
        info!(name = %name, "Cache removed on the server, deleting resource");
        ignore_not_found(ctx.store.remove_cache_finalizer(namespace, name).await)?;
        ignore_not_found(ctx.store.delete_cache(namespace, name).await)?;
        return Ok(Action::await_change());
    }

    let cluster_name = &cache.spec.cluster_name;
    let Some(cluster) = ctx.store.get_cluster(namespace, cluster_name).await? else {
        warn!(name = %name, cluster = %cluster_name, "Cluster not found");
        if cache.is_deleting() {
            if cache.has_finalizer() {
                ignore_not_found(ctx.store.remove_cache_finalizer(namespace, name).await)?;
            }
            return Ok(Action::await_change());
        }
        let message = format!("cluster {cluster_name} not found");
        write_ready(ctx, &cache, false, "ClusterNotFound", &message).await?;
        return Ok(Action::await_change());
    };

    // The cluster watch enqueues this cache once the cluster is WellFormed
    if !cluster.is_well_formed() {
        debug!(name = %name, cluster = %cluster_name, "Cluster not well formed, waiting");
        return Ok(Action::await_change());
    }

    if cache.is_deleting() {
        if cache.has_finalizer() {
            remove_from_server(ctx, &cluster, &cache).await?;
            ignore_not_found(ctx.store.remove_cache_finalizer(namespace, name).await)?;
            ctx.publish_normal_event(
                &cache,
                "CacheDeleted",
                "Deleting",
                Some(format!("Removed cache {} from the server", cache.cache_name())),
            )
            .await;
        }
        return Ok(Action::await_change());
    }

    let sync = if !cache.reconcile_on_server() || cache.in_sync() {
        Ok(CacheSync::Skipped)
    } else {
        sync_to_server(ctx, &cluster, &cache).await
    };

    match sync {
        Ok(sync) => {
            write_ready(ctx, &cache, true, "CacheReady", "").await?;
            if !cache.has_finalizer() {
                ctx.store.add_cache_finalizer(namespace, name).await?;
            }
            if matches!(sync, CacheSync::Created | CacheSync::Updated) {
                info!(name = %name, cache = %cache.cache_name(), result = ?sync, "Cache synced to server");
                ctx.publish_normal_event(
                    &cache,
                    if sync == CacheSync::Created { "CacheCreated" } else { "CacheUpdated" },
                    "Reconciling",
                    None,
                )
                .await;
            }
            ctx.failures.reset(&failure_key);
            Ok(Action::await_change())
        }
        Err(e) => {
            warn!(name = %name, error = %e, "Cache sync failed");
            write_ready(ctx, &cache, false, e.reason(), &e.to_string()).await?;
            match e {
                Error::Validation(_) => {
                    ctx.publish_warning_event(&cache, e.reason(), "Reconciling", Some(e.to_string()))
                        .await;
                    Ok(Action::await_change())
                }
                e if e.is_retryable() => {
                    let failures = ctx.failures.record_failure(&failure_key);
                    Ok(Action::requeue(RECONCILE_BACKOFF.delay(failures)))
                }
                e => Err(e),
            }
        }
    }
}

/// Create or update the cache on the server.
pub async fn sync_to_server(
    ctx: &Context,
    cluster: &DataGridCluster,
    cache: &Cache,
) -> Result<CacheSync> {
    let client = ctx.connector.connect(cluster, Endpoint::Service).await?;
    let cache_name = cache.cache_name();
    let exists = client.cache_exists(&cache_name).await?;

    if cluster.is_data_grid() {
        sync_data_grid(client.as_ref(), cache, &cache_name, exists).await
    } else {
        sync_cache_service(client.as_ref(), cluster, cache, &cache_name, exists).await
    }
}

async fn sync_cache_service(
    client: &dyn DataGridClient,
    cluster: &DataGridCluster,
    cache: &Cache,
    cache_name: &str,
    exists: bool,
) -> Result<CacheSync> {
    if exists {
        return Err(Error::Validation(
            "cannot update an existing cache in a CacheService cluster".to_string(),
        ));
    }
    if cache.inline_template().is_some() || cache.template_name().is_some() {
        return Err(Error::Validation(
            "cannot create a cache with a template in a CacheService cluster".to_string(),
        ));
    }
    let template = default_cache_template(cluster, cache_name)?;
    client
        .create_cache(cache_name, &template, MediaType::Xml)
        .await?;
    Ok(CacheSync::Created)
}

async fn sync_data_grid(
    client: &dyn DataGridClient,
    cache: &Cache,
    cache_name: &str,
    exists: bool,
) -> Result<CacheSync> {
    if exists {
        return match cache.inline_template() {
            Some(template) => {
                client
                    .update_cache_config(cache_name, template, MediaType::guess_markup(template))
                    .await?;
                Ok(CacheSync::Updated)
            }
            None => Ok(CacheSync::Unchanged),
        };
    }

    match (cache.template_name(), cache.inline_template()) {
        (Some(template_name), _) => {
            client
                .create_cache_from_template(cache_name, template_name)
                .await?
        }
        (None, Some(template)) => {
            client
                .create_cache(cache_name, template, MediaType::guess_markup(template))
                .await?
        }
        (None, None) => {
            return Err(Error::Validation(
                "either spec.template or spec.templateName must be set".to_string(),
            ));
        }
    }
    Ok(CacheSync::Created)
}

async fn remove_from_server(ctx: &Context, cluster: &DataGridCluster, cache: &Cache) -> Result<()> {
    let client = ctx.connector.connect(cluster, Endpoint::Service).await?;
    match client.delete_cache(&cache.cache_name()).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => {
            debug!(cache = %cache.cache_name(), "Cache already absent on the server");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Write the Ready condition when it differs from the stored status.
async fn write_ready(
    ctx: &Context,
    cache: &Cache,
    ready: bool,
    reason: &str,
    message: &str,
) -> Result<()> {
    let current = cache.status.clone().unwrap_or_default();
    let mut builder = ConditionBuilder::from_existing(&current.conditions);
    builder.ready(ready, reason, message, cache.metadata.generation);
    let status = CacheStatus {
        conditions: builder.build(),
        observed_generation: if ready {
            cache.metadata.generation
        } else {
            current.observed_generation
        },
    };
    if status == current {
        return Ok(());
    }
    let namespace = cache.namespace().unwrap_or_default();
    ignore_not_found(
        ctx.store
            .patch_cache_status(&namespace, &cache.name_any(), &status)
            .await,
    )
}

fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
