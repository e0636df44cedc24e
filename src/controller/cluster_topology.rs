//! Expected versus observed workload topology.
//!
//! Provides [`ObservedWorkload`], a snapshot of the StatefulSet and its pods,
//! and [`ExpectedTopology`], the handful of StatefulSet fields the operator
//! owns. Diffing the two tells the reconciler whether the StatefulSet must
//! be re-applied, so an unchanged cluster produces no writes.

use std::fmt;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Container, Pod};

use crate::crd::DataGridCluster;
use crate::resources::common::{
    cpu_limit, cpu_request, memory_limit, parse_cpu_millis, parse_memory_bytes,
};
use crate::resources::statefulset::{CONTAINER_NAME, JAVA_OPTIONS_ENV};

// ============================================================================
// Observed state
// ============================================================================

/// A server pod that is ready to answer requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyPod {
    pub name: String,
    pub ip: String,
}

/// Snapshot of the workload of a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedWorkload {
    /// Replicas set on the StatefulSet, `None` when it does not exist.
    pub replicas: Option<i32>,
    /// Image of the server container.
    pub image: Option<String>,
    /// Pods that exist, including terminating ones.
    pub running_pods: i32,
    /// Pods that are ready and have an address.
    pub ready_pods: Vec<ReadyPod>,
    /// Whether the StatefulSet finished rolling out its current spec.
    pub rollout_complete: bool,
}

impl ObservedWorkload {
    /// Build the snapshot from the live StatefulSet and its pods.
    pub fn observe(sts: Option<&StatefulSet>, pods: &[Pod]) -> Self {
        let replicas = sts.and_then(|s| s.spec.as_ref()).and_then(|s| s.replicas);
        let image = sts
            .and_then(server_container)
            .and_then(|c| c.image.clone());
        let rollout_complete = sts.is_some_and(|s| {
            let Some(status) = s.status.as_ref() else {
                return false;
            };
            let observed = status.observed_generation.unwrap_or_default()
                >= s.metadata.generation.unwrap_or_default();
            observed
                && status.current_revision == status.update_revision
                && status.updated_replicas.unwrap_or_default() == replicas.unwrap_or_default()
        });

        let ready_pods = pods
            .iter()
            .filter(|p| p.metadata.deletion_timestamp.is_none() && is_pod_ready(p))
            .filter_map(|p| {
                let ip = p.status.as_ref()?.pod_ip.clone()?;
                Some(ReadyPod {
                    name: p.metadata.name.clone()?,
                    ip,
                })
            })
            .collect();

        Self {
            replicas,
            image,
            running_pods: i32::try_from(pods.len()).unwrap_or(i32::MAX),
            ready_pods,
            rollout_complete,
        }
    }

    /// Number of ready pods.
    pub fn ready_count(&self) -> i32 {
        i32::try_from(self.ready_pods.len()).unwrap_or(i32::MAX)
    }

    /// Whether the StatefulSet exists.
    pub fn exists(&self) -> bool {
        self.replicas.is_some()
    }
}

fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

fn server_container(sts: &StatefulSet) -> Option<&Container> {
    sts.spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == CONTAINER_NAME)
}

// ============================================================================
// Expected topology
// ============================================================================

/// StatefulSet fields owned by the operator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedTopology {
    pub replicas: i32,
    pub image: String,
    pub cpu_limit: Option<String>,
    pub cpu_request: Option<String>,
    pub memory: Option<String>,
    pub java_options: String,
    pub volumes: Vec<String>,
}

/// One divergence between the expected and the live StatefulSet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyChange {
    Missing,
    Replicas { from: i32, to: i32 },
    Image { from: String, to: String },
    Cpu,
    Memory,
    JavaOptions,
    Volumes,
}

impl fmt::Display for TopologyChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyChange::Missing => write!(f, "statefulset missing"),
            TopologyChange::Replicas { from, to } => write!(f, "replicas {from} -> {to}"),
            TopologyChange::Image { from, to } => write!(f, "image {from} -> {to}"),
            TopologyChange::Cpu => write!(f, "cpu"),
            TopologyChange::Memory => write!(f, "memory"),
            TopologyChange::JavaOptions => write!(f, "java options"),
            TopologyChange::Volumes => write!(f, "volumes"),
        }
    }
}

impl ExpectedTopology {
    /// Topology the cluster should run with the given replicas and image.
    pub fn for_cluster(resource: &DataGridCluster, replicas: i32, image: &str) -> Self {
        let cpu = cpu_limit(resource);
        let mut volumes = vec!["admin-identities".to_string(), "identities".to_string()];
        let encryption = &resource.spec.security.endpoint_encryption;
        if encryption.enabled() && encryption.cert_secret_name.is_some() {
            volumes.push("encrypt".to_string());
        }
        volumes.sort();
        Self {
            replicas,
            image: image.to_string(),
            cpu_limit: Some(cpu.to_string()),
            cpu_request: Some(cpu_request(cpu).unwrap_or_else(|| cpu.to_string())),
            memory: Some(memory_limit(resource).to_string()),
            java_options: resource
                .spec
                .container
                .extra_jvm_opts
                .clone()
                .unwrap_or_default(),
            volumes,
        }
    }

    /// Topology a live StatefulSet carries.
    pub fn from_statefulset(sts: &StatefulSet) -> Self {
        let replicas = sts
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or_default();
        let container = server_container(sts);
        let resources = container.and_then(|c| c.resources.as_ref());
        let quantity = |requests: bool, key: &str| {
            resources
                .and_then(|r| if requests { r.requests.as_ref() } else { r.limits.as_ref() })
                .and_then(|m| m.get(key))
                .map(|q| q.0.clone())
        };
        let java_options = container
            .and_then(|c| c.env.as_ref())
            .and_then(|env| env.iter().find(|e| e.name == JAVA_OPTIONS_ENV))
            .and_then(|e| e.value.clone())
            .unwrap_or_default();
        let mut volumes: Vec<String> = sts
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|p| p.volumes.as_ref())
            .map(|v| v.iter().map(|v| v.name.clone()).collect())
            .unwrap_or_default();
        volumes.sort();

        Self {
            replicas,
            image: container.and_then(|c| c.image.clone()).unwrap_or_default(),
            cpu_limit: quantity(false, "cpu"),
            cpu_request: quantity(true, "cpu"),
            memory: quantity(true, "memory"),
            java_options,
            volumes,
        }
    }

    /// Changes needed to turn `live` into this topology.
    pub fn diff(&self, live: Option<&StatefulSet>) -> Vec<TopologyChange> {
        let Some(live) = live else {
            return vec![TopologyChange::Missing];
        };
        let current = Self::from_statefulset(live);
        let mut changes = Vec::new();
        if current.replicas != self.replicas {
            changes.push(TopologyChange::Replicas {
                from: current.replicas,
                to: self.replicas,
            });
        }
        if current.image != self.image {
            changes.push(TopologyChange::Image {
                from: current.image.clone(),
                to: self.image.clone(),
            });
        }
        // The API server rewrites quantities into canonical form ("1000m" -> "1")
        if !same_quantity(&current.cpu_limit, &self.cpu_limit, parse_cpu_millis)
            || !same_quantity(&current.cpu_request, &self.cpu_request, parse_cpu_millis)
        {
            changes.push(TopologyChange::Cpu);
        }
        if !same_quantity(&current.memory, &self.memory, parse_memory_bytes) {
            changes.push(TopologyChange::Memory);
        }
        if current.java_options != self.java_options {
            changes.push(TopologyChange::JavaOptions);
        }
        if current.volumes != self.volumes {
            changes.push(TopologyChange::Volumes);
        }
        changes
    }
}

fn same_quantity(
    live: &Option<String>,
    expected: &Option<String>,
    parse: fn(&str) -> Option<i64>,
) -> bool {
    match (live.as_deref(), expected.as_deref()) {
        (Some(live), Some(expected)) => match (parse(live), parse(expected)) {
            (Some(a), Some(b)) => a == b,
            _ => live == expected,
        },
        (live, expected) => live == expected,
    }
}
