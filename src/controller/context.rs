//! Shared context for the controllers.
//!
//! The Context struct holds everything a reconciler needs: the resource store,
//! the data grid connector, configuration, metrics, the event recorder and
//! the registry of running event listeners. It is built once at startup and
//! passed to every reconciliation; tests build it from in-memory doubles.

use std::sync::Arc;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::client::{DataGridConnector, HttpConnector, KubeStore, ResourceStore};
use crate::config::OperatorConfig;
use crate::controller::cache_listener::ListenerRegistry;
use crate::controller::retry::FailureTracker;
use crate::health::HealthState;

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "datagrid-operator";

/// Shared context for the controllers
pub struct Context {
    /// Declarative resource access
    pub store: Arc<dyn ResourceStore>,
    /// Builds data grid clients for clusters and pods
    pub connector: Arc<dyn DataGridConnector>,
    /// Operator configuration
    pub config: OperatorConfig,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
    /// Event listener tasks per cluster
    pub listeners: ListenerRegistry,
    /// Consecutive failures per object, drives requeue backoff
    pub failures: FailureTracker,
    /// Kubernetes event recorder (absent in tests)
    recorder: Option<Recorder>,
}

impl Context {
    /// Create a context backed by the Kubernetes API
    pub fn new(
        client: Client,
        config: OperatorConfig,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        let store: Arc<dyn ResourceStore> = Arc::new(KubeStore::new(client.clone()));
        let connector = Arc::new(HttpConnector::new(store.clone(), config.http_timeout));
        let reporter = Reporter {
            controller: FIELD_MANAGER.into(),
            instance: Some(config.pod_name.clone()),
        };
        Self {
            store,
            connector,
            config,
            health_state,
            listeners: ListenerRegistry::default(),
            failures: FailureTracker::new(),
            recorder: Some(Recorder::new(client, reporter)),
        }
    }

    /// Create a context from explicit parts
    pub fn from_parts(
        store: Arc<dyn ResourceStore>,
        connector: Arc<dyn DataGridConnector>,
        config: OperatorConfig,
    ) -> Self {
        Self {
            store,
            connector,
            config,
            health_state: None,
            listeners: ListenerRegistry::default(),
            failures: FailureTracker::new(),
            recorder: None,
        }
    }

    /// Attach health state for metrics
    pub fn with_health_state(mut self, health_state: Arc<HealthState>) -> Self {
        self.health_state = Some(health_state);
        self
    }

    /// Publish a normal event for a resource
    pub async fn publish_normal_event<K>(
        &self,
        resource: &K,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) where
        K: Resource<DynamicType = ()>,
    {
        self.publish(resource, EventType::Normal, reason, action, note)
            .await;
    }

    /// Publish a warning event for a resource
    pub async fn publish_warning_event<K>(
        &self,
        resource: &K,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) where
        K: Resource<DynamicType = ()>,
    {
        self.publish(resource, EventType::Warning, reason, action, note)
            .await;
    }

    async fn publish<K>(
        &self,
        resource: &K,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) where
        K: Resource<DynamicType = ()>,
    {
        let Some(recorder) = &self.recorder else {
            return;
        };
        let object_ref = resource.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }
}
