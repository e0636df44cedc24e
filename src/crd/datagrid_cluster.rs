//! DataGridCluster Custom Resource Definition.
//!
//! Declares a clustered data grid: how many server pods to run, which image,
//! container sizing, the service flavour (a minimal cache service or a full
//! data grid), endpoint security, external exposure and upgrade strategy.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::condition::{Condition, ConditionType};

/// Server image used when the resource spec does not pin one.
pub const DEFAULT_IMAGE: &str = "quay.io/infinispan/server:15.0";

/// Port serving the REST and Hot Rod endpoints.
pub const CLIENT_PORT: i32 = 11222;

/// Port serving the operator-only admin endpoint.
pub const ADMIN_PORT: i32 = 11223;

/// Port used by the cluster transport for member discovery.
pub const PING_PORT: i32 = 8888;

/// DataGridCluster is a custom resource describing a data grid deployment.
///
/// Example:
/// ```yaml
/// apiVersion: datagridoperator.io/v1
/// kind: DataGridCluster
/// metadata:
///   name: example
/// spec:
///   replicas: 3
///   service:
///     type: DataGrid
///   container:
///     cpu: "500m"
///     memory: "1Gi"
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "datagridoperator.io",
    version = "v1",
    kind = "DataGridCluster",
    plural = "datagridclusters",
    shortname = "dgc",
    status = "DataGridClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"WellFormed", "type":"string", "jsonPath":".status.conditions[?(@.type==\"WellFormed\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DataGridClusterSpec {
    /// Number of server pods. Zero requests a graceful shutdown.
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Server container image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Container sizing and JVM options.
    #[serde(default)]
    pub container: ContainerSpec,

    /// Service flavour.
    #[serde(default)]
    pub service: ServiceSpec,

    /// Endpoint security.
    #[serde(default)]
    pub security: SecuritySpec,

    /// External exposure of the client endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expose: Option<ExposeSpec>,

    /// How version changes are rolled out.
    #[serde(default)]
    pub upgrades: UpgradeSpec,

    /// Additional labels to apply to all managed resources.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Default for DataGridClusterSpec {
    fn default() -> Self {
        Self {
            replicas: default_replicas(),
            image: None,
            container: ContainerSpec::default(),
            service: ServiceSpec::default(),
            security: SecuritySpec::default(),
            expose: None,
            upgrades: UpgradeSpec::default(),
            labels: BTreeMap::new(),
        }
    }
}

fn default_replicas() -> i32 {
    1
}

/// Container sizing.
///
/// The CPU value is the limit; the request is half of it. Memory request and
/// limit are equal.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    /// CPU limit (e.g. "500m" or "2").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,

    /// Memory limit and request (e.g. "1Gi").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    /// Extra options passed to the server JVM.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_jvm_opts: Option<String>,
}

/// Service flavour of a cluster.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ServiceType {
    /// Minimal cache service: caches are created from a fixed default
    /// template and cannot be updated.
    #[default]
    Cache,
    /// Full data grid: arbitrary cache templates and configuration updates.
    DataGrid,
}

impl std::fmt::Display for ServiceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceType::Cache => write!(f, "Cache"),
            ServiceType::DataGrid => write!(f, "DataGrid"),
        }
    }
}

/// Service configuration.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Service flavour (default: Cache).
    #[serde(default, rename = "type")]
    pub type_: ServiceType,

    /// Number of owners for entries of caches created by the cache service.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
}

impl Default for ServiceSpec {
    fn default() -> Self {
        Self {
            type_: ServiceType::default(),
            replication_factor: default_replication_factor(),
        }
    }
}

fn default_replication_factor() -> i32 {
    2
}

/// Endpoint security configuration.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySpec {
    /// Secret holding application identities. Generated when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_secret_name: Option<String>,

    /// Encryption of the client endpoint.
    #[serde(default)]
    pub endpoint_encryption: EndpointEncryption,

    /// Whether the client endpoint requires authentication (default: true).
    #[serde(default = "default_endpoint_authentication")]
    pub endpoint_authentication: bool,
}

impl Default for SecuritySpec {
    fn default() -> Self {
        Self {
            endpoint_secret_name: None,
            endpoint_encryption: EndpointEncryption::default(),
            endpoint_authentication: default_endpoint_authentication(),
        }
    }
}

fn default_endpoint_authentication() -> bool {
    true
}

/// Encryption type of the client endpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum EncryptionType {
    /// Plain HTTP.
    #[default]
    None,
    /// TLS with a certificate read from a user secret.
    Secret,
}

/// Client endpoint encryption.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndpointEncryption {
    /// Encryption type (default: None).
    #[serde(default, rename = "type")]
    pub type_: EncryptionType,

    /// Secret holding `tls.crt` and `tls.key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_secret_name: Option<String>,
}

impl EndpointEncryption {
    /// Whether clients must use TLS.
    pub fn enabled(&self) -> bool {
        self.type_ != EncryptionType::None
    }
}

/// Type of external exposure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ExposeType {
    /// Expose the client port on every node.
    NodePort,
    /// Expose the client port through a cloud load balancer.
    LoadBalancer,
}

/// External exposure configuration.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExposeSpec {
    /// Exposure type.
    #[serde(rename = "type")]
    pub type_: ExposeType,

    /// Fixed node port for NodePort exposure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_port: Option<i32>,
}

/// Upgrade strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum UpgradeStrategy {
    /// Stop every pod, then start the new version.
    #[default]
    Shutdown,
    /// Replace pods one at a time through the StatefulSet rollout.
    Rolling,
}

/// Upgrade configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeSpec {
    /// Upgrade strategy (default: Shutdown).
    #[serde(default, rename = "type")]
    pub type_: UpgradeStrategy,
}

/// Status of a DataGridCluster.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataGridClusterStatus {
    /// Conditions describing the current state.
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// The generation most recently observed by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Name of the StatefulSet running the servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stateful_set_name: Option<String>,

    /// Number of ready server pods.
    #[serde(default)]
    pub ready_replicas: i32,

    /// Pod count to restore when restarting after a graceful shutdown.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas_wanted_at_restart: Option<i32>,

    /// Image the running cluster was formed with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operand_image: Option<String>,

    /// Progress of an in-flight upgrade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade: Option<UpgradeStatus>,
}

impl DataGridClusterStatus {
    /// Look up a condition by type.
    pub fn condition(&self, condition_type: ConditionType) -> Option<&Condition> {
        let name = condition_type.to_string();
        self.conditions.iter().find(|c| c.r#type == name)
    }

    /// Whether a condition is present with status "True".
    pub fn is_condition_true(&self, condition_type: ConditionType) -> bool {
        self.condition(condition_type).is_some_and(Condition::is_true)
    }
}

/// Upgrade progress states.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum UpgradeState {
    /// No upgrade in progress.
    #[default]
    None,
    /// A version change was detected; the new image is held back.
    Upgrading,
    /// Old pods are being drained.
    Stopping,
    /// New pods are running; waiting for the cluster to re-form.
    WellFormed,
}

impl std::fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpgradeState::None => write!(f, "None"),
            UpgradeState::Upgrading => write!(f, "Upgrading"),
            UpgradeState::Stopping => write!(f, "Stopping"),
            UpgradeState::WellFormed => write!(f, "WellFormed"),
        }
    }
}

/// Upgrade progress recorded in status.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeStatus {
    /// Current upgrade state.
    pub state: UpgradeState,
    /// Image being rolled out.
    pub target_image: String,
}

impl DataGridCluster {
    /// Image the resource spec asks for.
    pub fn desired_image(&self) -> &str {
        self.spec.image.as_deref().unwrap_or(DEFAULT_IMAGE)
    }

    /// Whether the cluster is marked WellFormed.
    pub fn is_well_formed(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|s| s.is_condition_true(ConditionType::WellFormed))
    }

    /// Whether a deletion was requested.
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether the cluster runs the full data grid service.
    pub fn is_data_grid(&self) -> bool {
        self.spec.service.type_ == ServiceType::DataGrid
    }

    /// Name of the Secret holding application identities.
    pub fn endpoint_secret_name(&self) -> String {
        let name = self.metadata.name.as_deref().unwrap_or_default();
        self.spec
            .security
            .endpoint_secret_name
            .clone()
            .unwrap_or_else(|| format!("{}-generated-secret", name))
    }

    /// Name of the Secret holding the operator identity.
    pub fn operator_secret_name(&self) -> String {
        let name = self.metadata.name.as_deref().unwrap_or_default();
        format!("{}-generated-operator-secret", name)
    }
}
