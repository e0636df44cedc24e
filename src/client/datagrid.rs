//! Data grid client abstraction.
//!
//! Defines the operations the controllers need from a running data grid
//! server, independent of transport. The HTTP implementation lives in
//! [`crate::client::http`]; tests substitute mocks or in-memory fakes.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::crd::DataGridCluster;

/// Errors returned by data grid servers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DataGridError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("server returned {status}: {body}")]
    Server { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),
}

impl DataGridError {
    /// The requested cache or resource does not exist on the server.
    pub fn is_not_found(&self) -> bool {
        matches!(self, DataGridError::NotFound(_))
    }

    /// Connection refused, timeouts and server-side failures.
    pub fn is_transient(&self) -> bool {
        match self {
            DataGridError::Transport(_) | DataGridError::Timeout(_) => true,
            DataGridError::Server { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// Media types understood by the configuration endpoints.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaType {
    Xml,
    Yaml,
    Json,
}

impl MediaType {
    /// Content type header value.
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Xml => "application/xml",
            MediaType::Yaml => "application/yaml",
            MediaType::Json => "application/json",
        }
    }

    /// Detect the markup of a configuration document from its first
    /// significant character.
    pub fn guess_markup(body: &str) -> MediaType {
        match body.trim_start().chars().next() {
            Some('<') => MediaType::Xml,
            Some('{') | Some('[') => MediaType::Json,
            _ => MediaType::Yaml,
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of configuration change reported by the server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigEventKind {
    CreateCache,
    UpdateCache,
    RemoveCache,
}

impl ConfigEventKind {
    /// Map a server-sent event name to a change kind.
    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "create-cache" => Some(ConfigEventKind::CreateCache),
            "update-cache" => Some(ConfigEventKind::UpdateCache),
            "remove-cache" => Some(ConfigEventKind::RemoveCache),
            _ => None,
        }
    }

    /// Server-sent event name of this change kind.
    pub fn event_name(&self) -> &'static str {
        match self {
            ConfigEventKind::CreateCache => "create-cache",
            ConfigEventKind::UpdateCache => "update-cache",
            ConfigEventKind::RemoveCache => "remove-cache",
        }
    }
}

/// One configuration change reported by the server.
///
/// For create and update events the payload is the cache configuration as a
/// YAML document; for remove events it is the bare cache name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConfigEvent {
    pub kind: ConfigEventKind,
    pub payload: String,
}

/// Operations on a single data grid endpoint (a pod or the cluster service).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DataGridClient: Send + Sync {
    /// Whether a cache with this name exists.
    async fn cache_exists(&self, name: &str) -> Result<bool, DataGridError>;

    /// Create a cache from a configuration document.
    async fn create_cache(
        &self,
        name: &str,
        config: &str,
        media_type: MediaType,
    ) -> Result<(), DataGridError>;

    /// Create a cache from a server-side template.
    async fn create_cache_from_template(
        &self,
        name: &str,
        template: &str,
    ) -> Result<(), DataGridError>;

    /// Replace the configuration of an existing cache.
    async fn update_cache_config(
        &self,
        name: &str,
        config: &str,
        media_type: MediaType,
    ) -> Result<(), DataGridError>;

    /// Remove a cache.
    async fn delete_cache(&self, name: &str) -> Result<(), DataGridError>;

    /// Names of all caches defined on the server.
    async fn list_cache_names(&self) -> Result<Vec<String>, DataGridError>;

    /// Convert a configuration document between markups.
    async fn convert_config(
        &self,
        config: &str,
        from: MediaType,
        to: MediaType,
    ) -> Result<String, DataGridError>;

    /// Number of members this server sees in its cluster view.
    async fn cluster_size(&self) -> Result<i32, DataGridError>;

    /// Ask the server to persist state and stop the container.
    async fn shutdown_container(&self) -> Result<(), DataGridError>;

    /// Stream of configuration changes, starting with the current state.
    async fn config_events(
        &self,
    ) -> Result<BoxStream<'static, Result<ConfigEvent, DataGridError>>, DataGridError>;
}

/// Where a client should connect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// The admin service balancing over all members.
    Service,
    /// A single member pod.
    Pod { name: String, ip: String },
}

/// Builds authenticated clients for a cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DataGridConnector: Send + Sync {
    /// Resolve credentials and TLS material for `cluster` and return a
    /// client bound to `endpoint`.
    async fn connect(
        &self,
        cluster: &DataGridCluster,
        endpoint: Endpoint,
    ) -> Result<Arc<dyn DataGridClient>, crate::controller::error::Error>;
}
