//! Service generation for data grid clusters.
//!
//! Creates up to four services:
//! - **Ping Service**: headless, used by the cluster transport to discover members
//! - **Client Service**: client connections with load balancing
//! - **Admin Service**: operator-only admin endpoint
//! - **External Service**: NodePort or LoadBalancer, only when `spec.expose` is set

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::{ADMIN_PORT, CLIENT_PORT, DataGridCluster, ExposeType, PING_PORT};
use crate::resources::common::{
    admin_service_name, client_service_name, external_service_name, owner_reference,
    ping_service_name, pod_selector_labels, standard_labels,
};

fn service_metadata(resource: &DataGridCluster, name: String, service_type: &str) -> ObjectMeta {
    let mut labels = standard_labels(resource);
    labels.insert(
        "app.kubernetes.io/service-type".to_string(),
        service_type.to_string(),
    );
    ObjectMeta {
        name: Some(name),
        namespace: resource.namespace(),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference(resource)]),
        ..Default::default()
    }
}

fn port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        port,
        target_port: Some(IntOrString::String(name.to_string())),
        name: Some(name.to_string()),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Generate the headless ping Service for member discovery.
///
/// Not-ready addresses are published so members can find each other while
/// the cluster is still forming.
pub fn generate_ping_service(resource: &DataGridCluster) -> Service {
    Service {
        metadata: service_metadata(resource, ping_service_name(resource), "ping"),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(pod_selector_labels(resource)),
            ports: Some(vec![port("ping", PING_PORT)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the client Service.
pub fn generate_client_service(resource: &DataGridCluster) -> Service {
    Service {
        metadata: service_metadata(resource, client_service_name(resource), "client"),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(pod_selector_labels(resource)),
            ports: Some(vec![port("client", CLIENT_PORT)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the admin Service the operator talks to.
pub fn generate_admin_service(resource: &DataGridCluster) -> Service {
    Service {
        metadata: service_metadata(resource, admin_service_name(resource), "admin"),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(pod_selector_labels(resource)),
            ports: Some(vec![port("admin", ADMIN_PORT)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Generate the external Service, if exposure is requested.
pub fn generate_external_service(resource: &DataGridCluster) -> Option<Service> {
    let expose = resource.spec.expose.as_ref()?;
    let mut client_port = port("client", CLIENT_PORT);
    let type_ = match expose.type_ {
        ExposeType::NodePort => {
            client_port.node_port = expose.node_port;
            "NodePort"
        }
        ExposeType::LoadBalancer => "LoadBalancer",
    };
    Some(Service {
        metadata: service_metadata(resource, external_service_name(resource), "external"),
        spec: Some(ServiceSpec {
            type_: Some(type_.to_string()),
            selector: Some(pod_selector_labels(resource)),
            ports: Some(vec![client_port]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// All services a cluster needs.
pub fn generate_services(resource: &DataGridCluster) -> Vec<Service> {
    let mut services = vec![
        generate_ping_service(resource),
        generate_client_service(resource),
        generate_admin_service(resource),
    ];
    services.extend(generate_external_service(resource));
    services
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::get_unwrap
)]
mod tests {
    use super::*;
    use crate::crd::{DataGridClusterSpec, ExposeSpec};

    fn test_resource(expose: Option<ExposeSpec>) -> DataGridCluster {
        DataGridCluster {
            metadata: ObjectMeta {
                name: Some("my-grid".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("test-uid".to_string()),
                ..Default::default()
            },
            spec: DataGridClusterSpec {
                expose,
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn test_generate_ping_service() {
        let svc = generate_ping_service(&test_resource(None));

        assert_eq!(svc.metadata.name, Some("my-grid-ping".to_string()));
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip, Some("None".to_string()));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, PING_PORT);
    }

    #[test]
    fn test_generate_admin_service() {
        let svc = generate_admin_service(&test_resource(None));
        assert_eq!(svc.metadata.name, Some("my-grid-admin".to_string()));
        let ports = svc.spec.unwrap().ports.unwrap();
        assert_eq!(ports[0].port, ADMIN_PORT);
        assert_eq!(
            svc.metadata
                .labels
                .unwrap()
                .get("app.kubernetes.io/service-type"),
            Some(&"admin".to_string())
        );
    }

    #[test]
    fn test_external_service_only_when_exposed() {
        assert!(generate_external_service(&test_resource(None)).is_none());
        assert_eq!(generate_services(&test_resource(None)).len(), 3);

        let svc = generate_external_service(&test_resource(Some(ExposeSpec {
            type_: ExposeType::NodePort,
            node_port: Some(30222),
        })))
        .unwrap();
        assert_eq!(svc.metadata.name, Some("my-grid-external".to_string()));
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_, Some("NodePort".to_string()));
        assert_eq!(spec.ports.unwrap()[0].node_port, Some(30222));
    }

    #[test]
    fn test_load_balancer_ignores_node_port() {
        let svc = generate_external_service(&test_resource(Some(ExposeSpec {
            type_: ExposeType::LoadBalancer,
            node_port: Some(30222),
        })))
        .unwrap();
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_, Some("LoadBalancer".to_string()));
        assert_eq!(spec.ports.unwrap()[0].node_port, None);
    }
}
