//! HTTP implementation of the data grid client over the REST v2 API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use tracing::debug;

use super::credentials::{Identities, OPERATOR_USER};
use super::datagrid::{
    ConfigEvent, DataGridClient, DataGridConnector, DataGridError, Endpoint, MediaType,
};
use super::events::EventStreamParser;
use super::store::ResourceStore;
use crate::controller::error::{Error, Result};
use crate::crd::{ADMIN_PORT, DataGridCluster};

/// Connection settings for one data grid endpoint.
#[derive(Clone, Debug)]
pub struct DataGridClientConfig {
    /// Base URL, e.g. `http://10.0.0.12:11223`.
    pub base_url: String,
    /// Basic-auth user.
    pub username: String,
    /// Basic-auth password.
    pub password: Option<String>,
    /// PEM encoded CA certificate for TLS endpoints.
    pub ca_cert_pem: Option<Vec<u8>>,
    /// Timeout of a single request (not applied to event streams).
    pub request_timeout: Duration,
    /// Connection establishment timeout.
    pub connect_timeout: Duration,
}

impl DataGridClientConfig {
    /// Create a new configuration for a base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            username: OPERATOR_USER.to_string(),
            password: None,
            ca_cert_pem: None,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Set credentials.
    pub fn with_credentials(mut self, username: &str, password: String) -> Self {
        self.username = username.to_string();
        self.password = Some(password);
        self
    }

    /// Trust a CA certificate.
    pub fn with_ca_cert(mut self, pem: Vec<u8>) -> Self {
        self.ca_cert_pem = Some(pem);
        self
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Data grid client speaking the REST v2 API.
pub struct HttpDataGridClient {
    http: reqwest::Client,
    base_url: Url,
    config: DataGridClientConfig,
}

#[derive(Deserialize)]
struct HealthResponse {
    cluster_health: ClusterHealth,
}

#[derive(Deserialize)]
struct ClusterHealth {
    number_of_nodes: i32,
}

fn transport(err: reqwest::Error) -> DataGridError {
    if err.is_timeout() {
        DataGridError::Timeout(err.to_string())
    } else {
        DataGridError::Transport(err.to_string())
    }
}

async fn check(response: Response, what: &str) -> std::result::Result<Response, DataGridError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::NOT_FOUND => DataGridError::NotFound(what.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            DataGridError::Unauthorized(what.to_string())
        }
        StatusCode::CONFLICT => DataGridError::Conflict(what.to_string()),
        other => DataGridError::Server {
            status: other.as_u16(),
            body,
        },
    })
}

impl HttpDataGridClient {
    /// Build a client from its configuration.
    pub fn new(config: DataGridClientConfig) -> std::result::Result<Self, DataGridError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| DataGridError::InvalidConfig(format!("{}: {e}", config.base_url)))?;

        let mut builder = reqwest::Client::builder().connect_timeout(config.connect_timeout);
        if let Some(pem) = &config.ca_cert_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| DataGridError::InvalidConfig(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder
            .build()
            .map_err(|e| DataGridError::InvalidConfig(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            config,
        })
    }

    fn url(&self, segments: &[&str]) -> std::result::Result<Url, DataGridError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DataGridError::InvalidConfig(format!("{} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(["rest", "v2"])
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.config.password {
            Some(password) => builder.basic_auth(&self.config.username, Some(password)),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        what: &str,
    ) -> std::result::Result<Response, DataGridError> {
        let response = builder
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(transport)?;
        check(response, what).await
    }
}

#[async_trait]
impl DataGridClient for HttpDataGridClient {
    async fn cache_exists(&self, name: &str) -> std::result::Result<bool, DataGridError> {
        let url = self.url(&["caches", name])?;
        match self.send(self.request(Method::HEAD, url), name).await {
            Ok(_) => Ok(true),
            Err(DataGridError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create_cache(
        &self,
        name: &str,
        config: &str,
        media_type: MediaType,
    ) -> std::result::Result<(), DataGridError> {
        let url = self.url(&["caches", name])?;
        let request = self
            .request(Method::POST, url)
            .header(reqwest::header::CONTENT_TYPE, media_type.as_str())
            .body(config.to_string());
        self.send(request, name).await?;
        debug!(cache = %name, media_type = %media_type, "Created cache");
        Ok(())
    }

    async fn create_cache_from_template(
        &self,
        name: &str,
        template: &str,
    ) -> std::result::Result<(), DataGridError> {
        let mut url = self.url(&["caches", name])?;
        url.query_pairs_mut().append_pair("template", template);
        self.send(self.request(Method::POST, url), name).await?;
        debug!(cache = %name, template = %template, "Created cache from template");
        Ok(())
    }

    async fn update_cache_config(
        &self,
        name: &str,
        config: &str,
        media_type: MediaType,
    ) -> std::result::Result<(), DataGridError> {
        let url = self.url(&["caches", name])?;
        let request = self
            .request(Method::PUT, url)
            .header(reqwest::header::CONTENT_TYPE, media_type.as_str())
            .body(config.to_string());
        self.send(request, name).await?;
        Ok(())
    }

    async fn delete_cache(&self, name: &str) -> std::result::Result<(), DataGridError> {
        let url = self.url(&["caches", name])?;
        self.send(self.request(Method::DELETE, url), name).await?;
        Ok(())
    }

    async fn list_cache_names(&self) -> std::result::Result<Vec<String>, DataGridError> {
        let url = self.url(&["caches"])?;
        let response = self.send(self.request(Method::GET, url), "caches").await?;
        response
            .json::<Vec<String>>()
            .await
            .map_err(|e| DataGridError::Decode(e.to_string()))
    }

    async fn convert_config(
        &self,
        config: &str,
        from: MediaType,
        to: MediaType,
    ) -> std::result::Result<String, DataGridError> {
        let mut url = self.url(&["caches"])?;
        url.query_pairs_mut().append_pair("action", "convert");
        let request = self
            .request(Method::POST, url)
            .header(reqwest::header::CONTENT_TYPE, from.as_str())
            .header(reqwest::header::ACCEPT, to.as_str())
            .body(config.to_string());
        let response = self.send(request, "convert").await?;
        response
            .text()
            .await
            .map_err(|e| DataGridError::Decode(e.to_string()))
    }

    async fn cluster_size(&self) -> std::result::Result<i32, DataGridError> {
        let url = self.url(&["cache-managers", "default", "health"])?;
        let response = self.send(self.request(Method::GET, url), "health").await?;
        let health: HealthResponse = response
            .json()
            .await
            .map_err(|e| DataGridError::Decode(e.to_string()))?;
        Ok(health.cluster_health.number_of_nodes)
    }

    async fn shutdown_container(&self) -> std::result::Result<(), DataGridError> {
        let mut url = self.url(&["container"])?;
        url.query_pairs_mut().append_pair("action", "shutdown");
        self.send(self.request(Method::POST, url), "container")
            .await?;
        Ok(())
    }

    async fn config_events(
        &self,
    ) -> std::result::Result<BoxStream<'static, std::result::Result<ConfigEvent, DataGridError>>, DataGridError>
    {
        let mut url = self.url(&["container", "config"])?;
        url.query_pairs_mut()
            .append_pair("action", "listen")
            .append_pair("includeCurrentState", "true");
        let response = self
            .request(Method::GET, url)
            .header(reqwest::header::ACCEPT, MediaType::Yaml.as_str())
            .send()
            .await
            .map_err(transport)?;
        let response = check(response, "config listener").await?;

        let events = response
            .bytes_stream()
            .scan(EventStreamParser::new(), |parser, chunk| {
                let batch: Vec<std::result::Result<ConfigEvent, DataGridError>> = match chunk {
                    Ok(bytes) => parser.feed(&bytes).into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(transport(e))],
                };
                futures::future::ready(Some(futures::stream::iter(batch)))
            })
            .flatten()
            .boxed();
        Ok(events)
    }
}

/// Builds [`HttpDataGridClient`]s from cluster secrets.
pub struct HttpConnector {
    store: Arc<dyn ResourceStore>,
    request_timeout: Duration,
}

impl HttpConnector {
    pub fn new(store: Arc<dyn ResourceStore>, request_timeout: Duration) -> Self {
        Self {
            store,
            request_timeout,
        }
    }

    async fn operator_password(&self, cluster: &DataGridCluster, namespace: &str) -> Result<String> {
        // The cluster reconciler (re)creates this secret, so its absence is retried
        let secret_name = cluster.operator_secret_name();
        let secret = self
            .store
            .get_secret(namespace, &secret_name)
            .await?
            .ok_or_else(|| {
                Error::Transient(format!("operator secret {namespace}/{secret_name} not found"))
            })?;
        let identities = Identities::from_secret(&secret)?;
        identities
            .password_for(OPERATOR_USER)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Transient(format!("{OPERATOR_USER} identity missing in secret {secret_name}"))
            })
    }

    async fn ca_cert(&self, cluster: &DataGridCluster, namespace: &str) -> Result<Option<Vec<u8>>> {
        let encryption = &cluster.spec.security.endpoint_encryption;
        let Some(secret_name) = encryption.cert_secret_name.as_deref() else {
            return Ok(None);
        };
        if !encryption.enabled() {
            return Ok(None);
        }
        let secret = self
            .store
            .get_secret(namespace, secret_name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("secret {namespace}/{secret_name}")))?;
        Ok(secret
            .data
            .and_then(|mut d| d.remove("tls.crt"))
            .map(|b| b.0))
    }
}

/// Base URL of the admin endpoint for a cluster or one of its pods.
pub fn endpoint_url(cluster: &DataGridCluster, namespace: &str, endpoint: &Endpoint) -> String {
    let scheme = if cluster.spec.security.endpoint_encryption.enabled() {
        "https"
    } else {
        "http"
    };
    let name = cluster.metadata.name.as_deref().unwrap_or_default();
    match endpoint {
        Endpoint::Service => format!("{scheme}://{name}-admin.{namespace}.svc:{ADMIN_PORT}"),
        Endpoint::Pod { ip, .. } => format!("{scheme}://{ip}:{ADMIN_PORT}"),
    }
}

#[async_trait]
impl DataGridConnector for HttpConnector {
    async fn connect(
        &self,
        cluster: &DataGridCluster,
        endpoint: Endpoint,
    ) -> Result<Arc<dyn DataGridClient>> {
        let namespace = cluster.metadata.namespace.clone().unwrap_or_default();
        let password = self.operator_password(cluster, &namespace).await?;
        let mut config = DataGridClientConfig::new(endpoint_url(cluster, &namespace, &endpoint))
            .with_credentials(OPERATOR_USER, password)
            .with_request_timeout(self.request_timeout);
        if let Some(pem) = self.ca_cert(cluster, &namespace).await? {
            config = config.with_ca_cert(pem);
        }
        Ok(Arc::new(HttpDataGridClient::new(config)?))
    }
}
