//! Identities stored in cluster secrets.
//!
//! Servers read their users from an `identities.yaml` document kept in a
//! Secret. The operator authenticates as [`OPERATOR_USER`] using the
//! generated operator secret; application users live in the endpoint secret.

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use serde::{Deserialize, Serialize};

use crate::controller::error::{Error, Result};

/// Key holding the identities document inside a Secret.
pub const IDENTITIES_KEY: &str = "identities.yaml";

/// User the operator authenticates as.
pub const OPERATOR_USER: &str = "operator";

/// Default application user created when no endpoint secret is supplied.
pub const DEVELOPER_USER: &str = "developer";

/// A server user.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Credential {
    pub username: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

/// The identities document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Identities {
    #[serde(default)]
    pub credentials: Vec<Credential>,
}

impl Identities {
    /// A document holding one user with a freshly generated password.
    pub fn generate(username: &str, roles: &[&str]) -> Self {
        Self {
            credentials: vec![Credential {
                username: username.to_string(),
                password: generate_password(),
                roles: roles.iter().map(|r| r.to_string()).collect(),
            }],
        }
    }

    /// Parse the identities document.
    pub fn from_yaml(doc: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(doc)?)
    }

    /// Read the identities document from a Secret.
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        let raw = secret
            .data
            .as_ref()
            .and_then(|d| d.get(IDENTITIES_KEY))
            .ok_or_else(|| Error::MissingField(format!("{IDENTITIES_KEY} in secret {name}")))?;
        let doc = std::str::from_utf8(&raw.0)
            .map_err(|e| Error::Validation(format!("secret {name} is not UTF-8: {e}")))?;
        Self::from_yaml(doc)
    }

    /// Password of `user`, if present.
    pub fn password_for(&self, user: &str) -> Option<&str> {
        self.credentials
            .iter()
            .find(|c| c.username == user)
            .map(|c| c.password.as_str())
    }

    /// Secret data carrying this document.
    pub fn to_secret_data(&self) -> Result<BTreeMap<String, ByteString>> {
        let doc = serde_yaml::to_string(self)?;
        Ok(BTreeMap::from([(
            IDENTITIES_KEY.to_string(),
            ByteString(doc.into_bytes()),
        )]))
    }
}

/// Random password without separators.
fn generate_password() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
