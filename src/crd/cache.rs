//! Cache Custom Resource Definition.
//!
//! A Cache declares one cache on a DataGridCluster. Caches are created either
//! by users or by the operator itself when the server reports a cache that was
//! created through another channel. Two annotations carry that provenance on
//! the wire; [`CacheOrigin`] and [`CacheLifecycle`] are the typed view of them.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::{Condition, ConditionType};

/// Finalizer guarding removal of the cache from the server.
pub const CACHE_FINALIZER: &str = "datagridoperator.io/finalizer";

/// Generation of the last spec written by the server event listener.
pub const LISTENER_GENERATION_ANNOTATION: &str = "datagridoperator.io/listener-generation";

/// Marks a resource whose cache was already removed on the server.
pub const LISTENER_DELETE_ANNOTATION: &str = "datagridoperator.io/listener-delete";

/// Cache is a custom resource declaring a cache on a data grid cluster.
///
/// Example:
/// ```yaml
/// apiVersion: datagridoperator.io/v2alpha1
/// kind: Cache
/// metadata:
///   name: sessions
/// spec:
///   clusterName: example
///   template: |
///     distributedCache:
///       mode: SYNC
/// ```
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "datagridoperator.io",
    version = "v2alpha1",
    kind = "Cache",
    plural = "caches",
    status = "CacheStatus",
    namespaced,
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.clusterName"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CacheSpec {
    /// Name of the DataGridCluster hosting the cache.
    pub cluster_name: String,

    /// Cache name on the server. Defaults to the resource name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Inline cache configuration in XML, YAML or JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,

    /// Name of a server-side template to create the cache from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
}

/// Status of a Cache.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    /// Conditions describing the current state.
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation last pushed to the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Who made the latest change to a Cache spec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheOrigin {
    /// A user edited the resource; the server must be updated.
    UserEdit,
    /// The event listener mirrored a server change at this generation.
    ServerEvent { generation: i64 },
}

/// Lifecycle of a Cache with respect to the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheLifecycle {
    /// The cache is expected to exist on the server.
    Active,
    /// The cache is gone from the server; only the resource remains.
    PendingServerDelete,
}

impl Cache {
    /// Cache name on the server.
    pub fn cache_name(&self) -> String {
        self.spec
            .name
            .clone()
            .unwrap_or_else(|| self.metadata.name.clone().unwrap_or_default())
    }

    /// Inline template, if set and non-empty.
    pub fn inline_template(&self) -> Option<&str> {
        self.spec.template.as_deref().filter(|t| !t.trim().is_empty())
    }

    /// Server template name, if set and non-empty.
    pub fn template_name(&self) -> Option<&str> {
        self.spec
            .template_name
            .as_deref()
            .filter(|t| !t.trim().is_empty())
    }

    /// Typed view of the listener generation annotation.
    pub fn origin(&self) -> CacheOrigin {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(LISTENER_GENERATION_ANNOTATION))
            .and_then(|g| g.parse::<i64>().ok())
            .map_or(CacheOrigin::UserEdit, |generation| {
                CacheOrigin::ServerEvent { generation }
            })
    }

    /// Typed view of the delete marker annotation.
    pub fn lifecycle(&self) -> CacheLifecycle {
        let marked = self
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(LISTENER_DELETE_ANNOTATION))
            .is_some_and(|v| v == "true");
        if marked {
            CacheLifecycle::PendingServerDelete
        } else {
            CacheLifecycle::Active
        }
    }

    /// Whether the resource was created by the event listener.
    pub fn listener_created(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .is_some_and(|a| a.contains_key(LISTENER_GENERATION_ANNOTATION))
    }

    /// Record the generation the listener is about to write.
    pub fn set_origin(&mut self, origin: CacheOrigin) {
        let annotations = self.metadata.annotations.get_or_insert_with(Default::default);
        match origin {
            CacheOrigin::UserEdit => {
                annotations.remove(LISTENER_GENERATION_ANNOTATION);
            }
            CacheOrigin::ServerEvent { generation } => {
                annotations.insert(
                    LISTENER_GENERATION_ANNOTATION.to_string(),
                    generation.to_string(),
                );
            }
        }
    }

    /// Mark the resource for removal without touching the server.
    pub fn mark_pending_server_delete(&mut self) {
        self.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(LISTENER_DELETE_ANNOTATION.to_string(), "true".to_string());
    }

    /// Whether changes to this resource must be pushed to the server.
    ///
    /// False when the current generation was written by the event listener,
    /// which would otherwise echo server changes back to the server.
    pub fn reconcile_on_server(&self) -> bool {
        match self.origin() {
            CacheOrigin::UserEdit => true,
            CacheOrigin::ServerEvent { generation } => {
                self.metadata.generation != Some(generation)
            }
        }
    }

    /// Whether the last server push covered the current generation.
    pub fn in_sync(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.observed_generation.is_some()
                && s.observed_generation == self.metadata.generation
                && s.conditions
                    .iter()
                    .any(|c| c.r#type == ConditionType::Ready.to_string() && c.is_true())
        })
    }

    /// Whether a deletion was requested.
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the cache finalizer is attached.
    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| f.iter().any(|f| f == CACHE_FINALIZER))
    }
}
