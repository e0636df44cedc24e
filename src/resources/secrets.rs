//! Identity secrets owned by a cluster.
//!
//! Both secrets are created once and never overwritten: regenerating them
//! would change passwords the running servers and applications already use.

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use crate::client::Identities;
use crate::client::credentials::{DEVELOPER_USER, OPERATOR_USER};
use crate::controller::error::Result;
use crate::crd::DataGridCluster;
use crate::resources::common::{owner_reference, standard_labels};

fn identities_secret(resource: &DataGridCluster, name: String, identities: &Identities) -> Result<Secret> {
    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: resource.namespace(),
            labels: Some(standard_labels(resource)),
            owner_references: Some(vec![owner_reference(resource)]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(identities.to_secret_data()?),
        ..Default::default()
    })
}

/// Secret holding the operator identity with a fresh password.
pub fn generate_operator_secret(resource: &DataGridCluster) -> Result<Secret> {
    identities_secret(
        resource,
        resource.operator_secret_name(),
        &Identities::generate(OPERATOR_USER, &["admin"]),
    )
}

/// Secret holding the default application identity.
///
/// `None` when the resource spec names a user-provided endpoint secret, or when
/// authentication is disabled.
pub fn generate_endpoint_secret(resource: &DataGridCluster) -> Option<Result<Secret>> {
    let security = &resource.spec.security;
    if security.endpoint_secret_name.is_some() || !security.endpoint_authentication {
        return None;
    }
    Some(identities_secret(
        resource,
        resource.endpoint_secret_name(),
        &Identities::generate(DEVELOPER_USER, &["admin"]),
    ))
}
