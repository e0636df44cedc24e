//! Common resource generation utilities.
//!
//! Provides labels, owner references, resource names and quantity parsing
//! shared by the generators of the resources a DataGridCluster owns.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use std::collections::BTreeMap;

use crate::crd::DataGridCluster;

/// Value of the managed-by label.
pub const MANAGED_BY: &str = "datagrid-operator";

/// Memory limit used when the resource spec does not set one.
pub const DEFAULT_MEMORY: &str = "512Mi";

/// CPU limit used when the resource spec does not set one.
pub const DEFAULT_CPU: &str = "500m";

/// Standard labels applied to all managed resources
pub fn standard_labels(resource: &DataGridCluster) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), resource.name_any());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        MANAGED_BY.to_string(),
    );
    labels.insert(
        "app.kubernetes.io/component".to_string(),
        "datagrid".to_string(),
    );

    // Merge user-defined labels
    for (key, value) in &resource.spec.labels {
        labels.insert(key.clone(), value.clone());
    }

    labels
}

/// Labels selecting the server pods of a cluster.
pub fn pod_selector_labels(resource: &DataGridCluster) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "datagrid-pod".to_string());
    labels.insert("clusterName".to_string(), resource.name_any());
    labels
}

/// Create owner reference for a DataGridCluster
pub fn owner_reference(resource: &DataGridCluster) -> OwnerReference {
    OwnerReference {
        api_version: "datagridoperator.io/v1".to_string(),
        kind: "DataGridCluster".to_string(),
        name: resource.name_any(),
        uid: resource.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Whether `owner_references` point at this cluster.
pub fn is_owned_by(owner_references: Option<&[OwnerReference]>, resource: &DataGridCluster) -> bool {
    let uid = resource.uid();
    owner_references.is_some_and(|refs| {
        refs.iter().any(|r| {
            r.kind == "DataGridCluster"
                && r.name == resource.name_any()
                && (uid.is_none() || uid.as_deref() == Some(r.uid.as_str()))
        })
    })
}

/// Headless service used for member discovery.
pub fn ping_service_name(resource: &DataGridCluster) -> String {
    format!("{}-ping", resource.name_any())
}

/// Service exposing the client port inside the cluster.
pub fn client_service_name(resource: &DataGridCluster) -> String {
    resource.name_any()
}

/// Service exposing the operator-only admin port.
pub fn admin_service_name(resource: &DataGridCluster) -> String {
    format!("{}-admin", resource.name_any())
}

/// Service exposing the client port outside the cluster.
pub fn external_service_name(resource: &DataGridCluster) -> String {
    format!("{}-external", resource.name_any())
}

/// StatefulSet running the servers.
pub fn statefulset_name(resource: &DataGridCluster) -> String {
    resource.name_any()
}

/// CPU limit of the server container.
pub fn cpu_limit(resource: &DataGridCluster) -> &str {
    resource
        .spec
        .container
        .cpu
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .unwrap_or(DEFAULT_CPU)
}

/// Memory limit (and request) of the server container.
pub fn memory_limit(resource: &DataGridCluster) -> &str {
    resource
        .spec
        .container
        .memory
        .as_deref()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or(DEFAULT_MEMORY)
}

/// CPU request derived from the limit: half of it.
pub fn cpu_request(limit: &str) -> Option<String> {
    parse_cpu_millis(limit).map(|m| format_cpu_millis((m / 2).max(1)))
}

/// Canonical CPU quantity for millicores, as the API server stores it.
pub fn format_cpu_millis(millis: i64) -> String {
    if millis % 1000 == 0 {
        (millis / 1000).to_string()
    } else {
        format!("{millis}m")
    }
}

/// Parse a CPU quantity ("500m", "2", "0.5") into millicores.
pub fn parse_cpu_millis(quantity: &str) -> Option<i64> {
    let quantity = quantity.trim();
    if let Some(millis) = quantity.strip_suffix('m') {
        return millis.parse::<i64>().ok().filter(|m| *m > 0);
    }
    let cores: f64 = quantity.parse().ok()?;
    if !cores.is_finite() || cores <= 0.0 {
        return None;
    }
    Some((cores * 1000.0).round() as i64)
}

/// Parse a memory quantity ("1Gi", "512Mi", "1G", "1048576") into bytes.
pub fn parse_memory_bytes(quantity: &str) -> Option<i64> {
    const SUFFIXES: [(&str, i64); 8] = [
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    let quantity = quantity.trim();
    for (suffix, factor) in SUFFIXES {
        if let Some(number) = quantity.strip_suffix(suffix) {
            return number
                .parse::<i64>()
                .ok()
                .filter(|n| *n > 0)
                .and_then(|n| n.checked_mul(factor));
        }
    }
    quantity.parse::<i64>().ok().filter(|n| *n > 0)
}
