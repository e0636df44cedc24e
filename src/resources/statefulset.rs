//! StatefulSet generation for data grid clusters.
//!
//! Creates a StatefulSet with the configuration a data grid server needs:
//! - Stable network identity via the headless ping service
//! - Persistent storage so caches survive a graceful shutdown
//! - Identity secrets for the operator and application users
//! - Optional TLS material for encrypted endpoints
//! - HTTP probes against the admin endpoint
//!
//! Replicas and image are passed in rather than read from the resource spec: upgrades
//! and graceful shutdown hold them at values the resource spec does not ask for.

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, ObjectFieldSelector,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, SecretVolumeSource, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

use crate::crd::{ADMIN_PORT, CLIENT_PORT, DataGridCluster, PING_PORT};
use crate::resources::common::{
    cpu_limit, cpu_request, memory_limit, owner_reference, ping_service_name,
    pod_selector_labels, standard_labels, statefulset_name,
};

/// Name of the server container.
pub const CONTAINER_NAME: &str = "datagrid";
/// Environment variable carrying extra JVM options.
pub const JAVA_OPTIONS_ENV: &str = "JAVA_OPTIONS";
/// Size of the per-pod data volume.
const DATA_VOLUME_SIZE: &str = "1Gi";
/// Time servers get to persist state on termination.
const TERMINATION_GRACE_PERIOD: i64 = 60;
/// Health endpoint served on the admin port.
const HEALTH_PATH: &str = "/rest/v2/container/health/status";

/// Generate a StatefulSet for a DataGridCluster.
pub fn generate_statefulset(resource: &DataGridCluster, replicas: i32, image: &str) -> StatefulSet {
    let labels = standard_labels(resource);
    let mut pod_labels = labels.clone();
    pod_labels.extend(pod_selector_labels(resource));

    StatefulSet {
        metadata: ObjectMeta {
            name: Some(statefulset_name(resource)),
            namespace: resource.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner_reference(resource)]),
            ..Default::default()
        },
        spec: Some(StatefulSetSpec {
            replicas: Some(replicas),
            service_name: Some(ping_service_name(resource)),
            selector: LabelSelector {
                match_labels: Some(pod_selector_labels(resource)),
                ..Default::default()
            },
            // Members join in any order
            pod_management_policy: Some("Parallel".to_string()),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD),
                    containers: vec![generate_container(resource, image)],
                    volumes: Some(generate_volumes(resource)),
                    ..Default::default()
                }),
            },
            volume_claim_templates: Some(vec![generate_pvc_template()]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the server container.
fn generate_container(resource: &DataGridCluster, image: &str) -> Container {
    let scheme = if resource.spec.security.endpoint_encryption.enabled() {
        "HTTPS"
    } else {
        "HTTP"
    };
    Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        ports: Some(vec![
            container_port("client", CLIENT_PORT),
            container_port("admin", ADMIN_PORT),
            container_port("ping", PING_PORT),
        ]),
        env: Some(generate_env_vars(resource)),
        resources: Some(generate_resource_requirements(resource)),
        volume_mounts: Some(generate_volume_mounts(resource)),
        startup_probe: Some(http_probe(scheme, 60)),
        liveness_probe: Some(http_probe(scheme, 5)),
        readiness_probe: Some(http_probe(scheme, 3)),
        ..Default::default()
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        container_port: port,
        name: Some(name.to_string()),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn http_probe(scheme: &str, failure_threshold: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(HEALTH_PATH.to_string()),
            port: IntOrString::Int(ADMIN_PORT),
            scheme: Some(scheme.to_string()),
            ..Default::default()
        }),
        period_seconds: Some(10),
        timeout_seconds: Some(80),
        failure_threshold: Some(failure_threshold),
        success_threshold: Some(1),
        ..Default::default()
    }
}

/// Generate environment variables for the server.
fn generate_env_vars(resource: &DataGridCluster) -> Vec<EnvVar> {
    let namespace = resource
        .namespace()
        .unwrap_or_else(|| "default".to_string());
    vec![
        EnvVar {
            name: "POD_NAME".to_string(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: "metadata.name".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        EnvVar {
            name: "PING_SERVICE".to_string(),
            value: Some(format!(
                "{}.{}.svc.cluster.local",
                ping_service_name(resource),
                namespace
            )),
            ..Default::default()
        },
        EnvVar {
            name: JAVA_OPTIONS_ENV.to_string(),
            value: Some(
                resource
                    .spec
                    .container
                    .extra_jvm_opts
                    .clone()
                    .unwrap_or_default(),
            ),
            ..Default::default()
        },
    ]
}

/// Generate resource requirements: CPU request is half the limit, memory
/// request equals the limit.
fn generate_resource_requirements(resource: &DataGridCluster) -> ResourceRequirements {
    let cpu = cpu_limit(resource);
    let memory = memory_limit(resource);

    let mut limits = BTreeMap::new();
    limits.insert("cpu".to_string(), Quantity(cpu.to_string()));
    limits.insert("memory".to_string(), Quantity(memory.to_string()));

    let mut requests = BTreeMap::new();
    requests.insert(
        "cpu".to_string(),
        Quantity(cpu_request(cpu).unwrap_or_else(|| cpu.to_string())),
    );
    requests.insert("memory".to_string(), Quantity(memory.to_string()));

    ResourceRequirements {
        limits: Some(limits),
        requests: Some(requests),
        ..Default::default()
    }
}

fn secret_volume(name: &str, secret_name: String, optional: bool) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name),
            optional: optional.then_some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate volumes for the pod.
fn generate_volumes(resource: &DataGridCluster) -> Vec<Volume> {
    let mut volumes = vec![
        // Absent when endpoint authentication is disabled
        secret_volume("identities", resource.endpoint_secret_name(), true),
        secret_volume("admin-identities", resource.operator_secret_name(), false),
    ];
    let encryption = &resource.spec.security.endpoint_encryption;
    if encryption.enabled()
        && let Some(cert_secret) = &encryption.cert_secret_name
    {
        volumes.push(secret_volume("encrypt", cert_secret.clone(), false));
    }
    volumes
}

/// Generate volume mounts for the container.
fn generate_volume_mounts(resource: &DataGridCluster) -> Vec<VolumeMount> {
    let mut mounts = vec![
        VolumeMount {
            name: "data".to_string(),
            mount_path: "/opt/datagrid/server/data".to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "identities".to_string(),
            mount_path: "/etc/security".to_string(),
            read_only: Some(true),
            ..Default::default()
        },
        VolumeMount {
            name: "admin-identities".to_string(),
            mount_path: "/etc/security/admin".to_string(),
            read_only: Some(true),
            ..Default::default()
        },
    ];
    let encryption = &resource.spec.security.endpoint_encryption;
    if encryption.enabled() && encryption.cert_secret_name.is_some() {
        mounts.push(VolumeMount {
            name: "encrypt".to_string(),
            mount_path: "/etc/encrypt".to_string(),
            read_only: Some(true),
            ..Default::default()
        });
    }
    mounts
}

/// Generate PVC template for the StatefulSet.
fn generate_pvc_template() -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some("data".to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some({
                    let mut requests = BTreeMap::new();
                    requests.insert(
                        "storage".to_string(),
                        Quantity(DATA_VOLUME_SIZE.to_string()),
                    );
                    requests
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}
