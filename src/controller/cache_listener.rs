//! Server configuration event listener.
//!
//! Caches can be created, changed and removed on a data grid server without
//! going through a Cache resource (CLI, REST, Hot Rod clients). For every
//! WellFormed DataGrid cluster a [`CacheListener`] task follows the server's
//! configuration event stream and mirrors those changes into Cache resources:
//!
//! - `create-cache` / `update-cache`: [`CacheListener::create_or_update`]
//! - `remove-cache`: [`CacheListener::delete`]
//! - periodically: [`CacheListener::remove_stale_resources`]
//!
//! Every spec the listener writes carries the listener generation annotation,
//! so the cache reconciler can tell it apart from a user edit and does not
//! push it back to the server.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;

use futures::StreamExt;
use kube::ResourceExt;
use kube::api::ObjectMeta;
use regex::Regex;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, error, info, warn};

use crate::client::{
    ConfigEvent, ConfigEventKind, DataGridConnector, Endpoint, MediaType, ResourceStore,
};
use crate::controller::cluster_topology::ObservedWorkload;
use crate::controller::common::to_kebab_case;
use crate::controller::error::{Error, Result};
use crate::controller::retry::{LISTENER_RECONNECT_BACKOFF, LISTENER_UPDATE_RETRY};
use crate::crd::{
    CACHE_FINALIZER, Cache, CacheLifecycle, CacheOrigin, CacheSpec, DataGridCluster,
};
use crate::health::HealthState;
use crate::resources::common::{is_owned_by, owner_reference, pod_selector_labels};

/// Server caches with this prefix are internal and never mirrored.
const INTERNAL_CACHE_PREFIX: &str = "___";

static INVALID_NAME_CHARS: LazyLock<std::result::Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new("[^-a-z0-9]"));

/// What a listener operation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerOutcome {
    /// A Cache resource was created; carries the generated name.
    Created(String),
    /// An existing Cache resource was updated.
    Updated(String),
    /// A Cache resource was marked for deletion.
    Marked(String),
    /// Nothing to do.
    Ignored,
}

impl ListenerOutcome {
    fn label(&self) -> &'static str {
        match self {
            ListenerOutcome::Created(_) => "created",
            ListenerOutcome::Updated(_) => "updated",
            ListenerOutcome::Marked(_) => "marked",
            ListenerOutcome::Ignored => "ignored",
        }
    }
}

// ============================================================================
// Payload handling
// ============================================================================

/// Split a configuration event payload into cache name and YAML configuration.
///
/// The payload is a document of the form
/// `infinispan.cacheContainer.caches.<name>: <configuration>` holding exactly
/// one cache.
pub fn parse_cache_event(payload: &str) -> Result<(String, String)> {
    let doc: serde_yaml::Value = serde_yaml::from_str(payload)
        .map_err(|e| Error::MalformedPayload(format!("unable to parse event data: {e}")))?;

    let caches = doc
        .get("infinispan")
        .and_then(|v| v.get("cacheContainer"))
        .and_then(|v| v.get("caches"))
        .and_then(serde_yaml::Value::as_mapping)
        .ok_or_else(|| Error::MalformedPayload(format!("unexpected event format: {payload}")))?;

    let mut entries = caches.iter();
    let (Some((name, config)), None) = (entries.next(), entries.next()) else {
        return Err(Error::MalformedPayload(format!(
            "expected exactly one cache, found {}",
            caches.len()
        )));
    };
    let name = name
        .as_str()
        .ok_or_else(|| Error::MalformedPayload("cache name is not a string".to_string()))?;

    Ok((name.to_string(), serde_yaml::to_string(config)?))
}

/// Resource name prefix for a server cache name.
///
/// The name is kebab-cased, every character outside `[-a-z0-9]` is replaced
/// by `-`, and the result must be a valid DNS-1123 subdomain.
pub fn sanitize_cache_name(cache_name: &str) -> Result<String> {
    let regex = INVALID_NAME_CHARS
        .as_ref()
        .map_err(|e| Error::Permanent(format!("invalid name pattern: {e}")))?;
    let sanitized = regex
        .replace_all(&to_kebab_case(cache_name), "-")
        .into_owned();

    let valid = !sanitized.is_empty()
        && sanitized.len() <= 253
        && sanitized.starts_with(|c: char| c.is_ascii_alphanumeric())
        && sanitized.ends_with(|c: char| c.is_ascii_alphanumeric());
    if !valid {
        return Err(Error::Validation(format!(
            "unable to derive a resource name for cache '{cache_name}': '{sanitized}' is not a DNS-1123 subdomain"
        )));
    }
    Ok(sanitized)
}

fn add_cache_finalizer(cache: &mut Cache) {
    let finalizers = cache.metadata.finalizers.get_or_insert_with(Vec::new);
    if !finalizers.iter().any(|f| f == CACHE_FINALIZER) {
        finalizers.push(CACHE_FINALIZER.to_string());
    }
}

// ============================================================================
// Listener
// ============================================================================

/// Mirrors server configuration changes of one cluster into Cache resources.
#[derive(Clone)]
pub struct CacheListener {
    store: Arc<dyn ResourceStore>,
    connector: Arc<dyn DataGridConnector>,
    cluster: DataGridCluster,
    namespace: String,
    health_state: Option<Arc<HealthState>>,
}

impl CacheListener {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        connector: Arc<dyn DataGridConnector>,
        cluster: DataGridCluster,
    ) -> Result<Self> {
        let namespace = cluster
            .namespace()
            .ok_or_else(|| Error::MissingField("metadata.namespace".to_string()))?;
        Ok(Self {
            store,
            connector,
            cluster,
            namespace,
            health_state: None,
        })
    }

    /// Record handled events in the operator metrics.
    pub fn with_health_state(mut self, health_state: Option<Arc<HealthState>>) -> Self {
        self.health_state = health_state;
        self
    }

    fn cluster_name(&self) -> String {
        self.cluster.name_any()
    }

    /// The unique Cache resource for `cache_name` on this cluster, if any.
    pub async fn find_existing_cache(&self, cache_name: &str) -> Result<Option<Cache>> {
        let cluster_name = self.cluster_name();
        let mut matches: Vec<Cache> = self
            .store
            .list_caches_for_cluster(&self.namespace, &cluster_name)
            .await?
            .into_iter()
            .filter(|c| c.cache_name() == cache_name)
            .collect();

        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            n => {
                let names: Vec<String> = matches.iter().map(ResourceExt::name_any).collect();
                Err(Error::Consistency(format!(
                    "{n} Cache resources found for cache '{cache_name}' on cluster '{cluster_name}': {}",
                    names.join(", ")
                )))
            }
        }
    }

    /// Mirror a created or updated server cache.
    pub async fn create_or_update(&self, payload: &str) -> Result<ListenerOutcome> {
        let (cache_name, config) = parse_cache_event(payload)?;
        if cache_name.starts_with(INTERNAL_CACHE_PREFIX) {
            debug!(cache = %cache_name, "Ignoring internal cache");
            return Ok(ListenerOutcome::Ignored);
        }

        match self.find_existing_cache(&cache_name).await? {
            None => self.create(&cache_name, config).await,
            Some(existing) => self.update(&existing.name_any(), &cache_name, &config).await,
        }
    }

    async fn create(&self, cache_name: &str, config: String) -> Result<ListenerOutcome> {
        let prefix = sanitize_cache_name(cache_name)?;
        let mut cache = Cache {
            metadata: ObjectMeta {
                generate_name: Some(format!("{prefix}-")),
                namespace: Some(self.namespace.clone()),
                owner_references: Some(vec![owner_reference(&self.cluster)]),
                ..Default::default()
            },
            spec: CacheSpec {
                cluster_name: self.cluster_name(),
                name: Some(cache_name.to_string()),
                template: Some(config),
                template_name: None,
            },
            status: None,
        };
        cache.set_origin(CacheOrigin::ServerEvent { generation: 1 });
        add_cache_finalizer(&mut cache);

        let created = self.store.create_cache(&cache).await?;
        let name = created.name_any();
        info!(cache = %cache_name, resource = %name, "Created Cache resource for server cache");
        Ok(ListenerOutcome::Created(name))
    }

    async fn update(
        &self,
        resource_name: &str,
        cache_name: &str,
        config: &str,
    ) -> Result<ListenerOutcome> {
        LISTENER_UPDATE_RETRY
            .run("update cache from server event", |attempt| async move {
                let mut cache = self
                    .store
                    .get_cache(&self.namespace, resource_name)
                    .await?
                    .ok_or_else(|| {
                        Error::NotFound(format!("cache {}/{resource_name}", self.namespace))
                    })?;

                let (template, template_name) = match cache.inline_template() {
                    Some(existing) => {
                        let markup = MediaType::guess_markup(existing);
                        (Some(self.to_markup(config, markup).await?), None)
                    }
                    None => (None, cache.spec.template_name.clone()),
                };

                let generation = cache.metadata.generation.unwrap_or_default();
                cache.set_origin(CacheOrigin::ServerEvent {
                    generation: generation + 1,
                });
                add_cache_finalizer(&mut cache);
                cache.spec = CacheSpec {
                    cluster_name: self.cluster_name(),
                    name: Some(cache_name.to_string()),
                    template,
                    template_name,
                };

                debug!(resource = %resource_name, attempt, "Updating Cache resource from server event");
                self.store.replace_cache(&cache).await?;
                Ok(ListenerOutcome::Updated(resource_name.to_string()))
            })
            .await
    }

    /// Render a YAML configuration in the markup the user originally wrote.
    async fn to_markup(&self, config: &str, markup: MediaType) -> Result<String> {
        if markup == MediaType::Yaml {
            return Ok(config.to_string());
        }
        let client = self
            .connector
            .connect(&self.cluster, Endpoint::Service)
            .await?;
        Ok(client
            .convert_config(config, MediaType::Yaml, markup)
            .await?)
    }

    /// Mark the Cache resource of a removed server cache for deletion.
    pub async fn delete(&self, payload: &str) -> Result<ListenerOutcome> {
        let cache_name = payload.trim();
        let Some(existing) = self.find_existing_cache(cache_name).await? else {
            debug!(cache = %cache_name, "No Cache resource for removed cache");
            return Ok(ListenerOutcome::Ignored);
        };
        let resource_name = existing.name_any();

        let result = LISTENER_UPDATE_RETRY
            .run("mark cache for deletion", |_| {
                let resource_name = resource_name.clone();
                async move {
                    let Some(mut cache) = self.store.get_cache(&self.namespace, &resource_name).await?
                    else {
                        return Ok(ListenerOutcome::Ignored);
                    };
                    if cache.is_deleting() || cache.lifecycle() == CacheLifecycle::PendingServerDelete {
                        return Ok(ListenerOutcome::Ignored);
                    }
                    cache.mark_pending_server_delete();
                    self.store.replace_cache(&cache).await?;
                    Ok(ListenerOutcome::Marked(resource_name))
                }
            })
            .await;

        match result {
            Err(e) if e.is_not_found() => Ok(ListenerOutcome::Ignored),
            Ok(ListenerOutcome::Marked(name)) => {
                info!(cache = %cache_name, resource = %name, "Marked Cache resource for removal");
                Ok(ListenerOutcome::Marked(name))
            }
            other => other,
        }
    }

    /// Mark listener-created Cache resources whose cache no longer exists on
    /// the server. Returns the names of the marked resources.
    pub async fn remove_stale_resources(&self, probe: Endpoint) -> Result<Vec<String>> {
        let client = self.connector.connect(&self.cluster, probe).await?;
        let server_caches: HashSet<String> = client
            .list_cache_names()
            .await?
            .iter()
            .map(|name| to_kebab_case(name))
            .collect();
        debug!(caches = ?server_caches, "Caches defined on the server");

        let caches = self
            .store
            .list_caches_for_cluster(&self.namespace, &self.cluster_name())
            .await?;

        let mut marked = Vec::new();
        for mut cache in caches {
            let owned = is_owned_by(cache.metadata.owner_references.as_deref(), &self.cluster);
            if !owned
                || cache.is_deleting()
                || cache.lifecycle() == CacheLifecycle::PendingServerDelete
                || server_caches.contains(&to_kebab_case(&cache.cache_name()))
            {
                continue;
            }

            let name = cache.name_any();
            info!(resource = %name, "Marking stale Cache resource for deletion");
            cache.mark_pending_server_delete();
            match self.store.replace_cache(&cache).await {
                Ok(_) => marked.push(name),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(marked)
    }

    async fn handle_event(&self, event: ConfigEvent) {
        let result = match event.kind {
            ConfigEventKind::CreateCache | ConfigEventKind::UpdateCache => {
                self.create_or_update(&event.payload).await
            }
            ConfigEventKind::RemoveCache => self.delete(&event.payload).await,
        };
        let outcome = match &result {
            Ok(outcome) => outcome.label(),
            Err(_) => "error",
        };
        if let Some(health_state) = &self.health_state {
            health_state.metrics.record_listener_event(
                &self.cluster_name(),
                event.kind.event_name(),
                outcome,
            );
        }
        if let Err(e) = result {
            error!(
                cluster = %self.cluster_name(),
                event = event.kind.event_name(),
                error = %e,
                "Failed to handle configuration event"
            );
        }
    }

    async fn sweep(&self) {
        let pods = match self
            .store
            .list_pods(&self.namespace, &pod_selector_labels(&self.cluster))
            .await
        {
            Ok(pods) => pods,
            Err(e) => {
                warn!(cluster = %self.cluster_name(), error = %e, "Unable to list pods for stale cache sweep");
                return;
            }
        };
        let Some(probe) = ObservedWorkload::observe(None, &pods).ready_pods.into_iter().next()
        else {
            debug!(cluster = %self.cluster_name(), "No ready pod for stale cache sweep");
            return;
        };
        let endpoint = Endpoint::Pod {
            name: probe.name,
            ip: probe.ip,
        };
        if let Err(e) = self.remove_stale_resources(endpoint).await {
            warn!(cluster = %self.cluster_name(), error = %e, "Stale cache sweep failed");
        }
    }

    /// Follow the configuration event stream until the cluster goes away.
    pub async fn run(mut self, stale_sweep_interval: Duration) {
        let mut sweep = interval(stale_sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            match self
                .store
                .get_cluster(&self.namespace, &self.cluster_name())
                .await
            {
                Ok(Some(cluster)) if !cluster.is_deleting() => self.cluster = cluster,
                Ok(_) => {
                    info!(cluster = %self.cluster_name(), "Cluster gone, stopping cache listener");
                    return;
                }
                Err(e) => warn!(cluster = %self.cluster_name(), error = %e, "Unable to refresh cluster"),
            }

            let stream = match self
                .connector
                .connect(&self.cluster, Endpoint::Service)
                .await
            {
                Ok(client) => client.config_events().await.map_err(Error::from),
                Err(e) => Err(e),
            };

            match stream {
                Ok(mut events) => {
                    info!(cluster = %self.cluster_name(), "Listening for server configuration events");
                    failures = 0;
                    loop {
                        tokio::select! {
                            _ = sweep.tick() => self.sweep().await,
                            event = events.next() => match event {
                                Some(Ok(event)) => self.handle_event(event).await,
                                Some(Err(e)) => {
                                    warn!(cluster = %self.cluster_name(), error = %e, "Configuration event stream failed");
                                    break;
                                }
                                None => {
                                    debug!(cluster = %self.cluster_name(), "Configuration event stream closed");
                                    break;
                                }
                            },
                        }
                    }
                }
                Err(e) => {
                    warn!(cluster = %self.cluster_name(), error = %e, "Unable to open configuration event stream");
                }
            }

            failures = failures.saturating_add(1);
            sleep(LISTENER_RECONNECT_BACKOFF.delay(failures)).await;
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Running listener tasks keyed by `namespace/cluster`.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl ListenerRegistry {
    /// Start a listener for `key` unless one is already running.
    ///
    /// Returns true when a new task was spawned.
    pub fn ensure_running<F>(&self, key: &str, spawn: F) -> bool
    where
        F: FnOnce() -> JoinHandle<()>,
    {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        if tasks.get(key).is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        tasks.insert(key.to_string(), spawn());
        true
    }

    /// Abort the listener for `key`. Returns true when one was running.
    pub fn stop(&self, key: &str) -> bool {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        match tasks.remove(key) {
            Some(handle) => {
                let running = !handle.is_finished();
                handle.abort();
                running
            }
            None => false,
        }
    }

    /// Whether a listener for `key` is running.
    pub fn is_running(&self, key: &str) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        tasks.get(key).is_some_and(|handle| !handle.is_finished())
    }
}
