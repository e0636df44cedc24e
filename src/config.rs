//! Operator configuration read from the environment.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// Runtime settings for the controllers.
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Name of the operator pod (leader election identity, event reporter).
    pub pod_name: String,
    /// Namespace the operator runs in (leader election lease).
    pub pod_namespace: String,
    /// Namespace to watch, or `None` for cluster-wide.
    pub watch_namespace: Option<String>,
    /// Upper bound for waiting on cluster membership to converge.
    pub formation_timeout: Duration,
    /// Interval between membership polls.
    pub poll_period: Duration,
    /// Interval between stale cache sweeps of the event listener.
    pub stale_sweep_interval: Duration,
    /// Whether server configuration changes are mirrored into Cache resources.
    pub listener_enabled: bool,
    /// Timeout of a single request to a data grid server.
    pub http_timeout: Duration,
    /// Periodic re-check interval for clusters that converged.
    pub resync_interval: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            pod_name: "datagrid-operator".to_string(),
            pod_namespace: "default".to_string(),
            watch_namespace: None,
            formation_timeout: Duration::from_secs(120),
            poll_period: Duration::from_secs(1),
            stale_sweep_interval: Duration::from_secs(300),
            listener_enabled: true,
            http_timeout: Duration::from_secs(30),
            resync_interval: Duration::from_secs(60),
        }
    }
}

impl OperatorConfig {
    /// Read configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through a variable lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let pod_name = lookup("POD_NAME").unwrap_or_else(|| {
            warn!("POD_NAME not set, using hostname");
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| defaults.pod_name.clone())
        });
        let pod_namespace = lookup("POD_NAMESPACE").unwrap_or_else(|| {
            warn!("POD_NAMESPACE not set, using 'default'");
            defaults.pod_namespace.clone()
        });
        let watch_namespace = lookup("WATCH_NAMESPACE").filter(|ns| !ns.trim().is_empty());

        Self {
            pod_name,
            pod_namespace,
            watch_namespace,
            formation_timeout: seconds(
                &lookup,
                "DATAGRID_FORMATION_TIMEOUT_SECS",
                defaults.formation_timeout,
            ),
            poll_period: seconds(&lookup, "DATAGRID_POLL_PERIOD_SECS", defaults.poll_period),
            stale_sweep_interval: seconds(
                &lookup,
                "DATAGRID_STALE_SWEEP_SECS",
                defaults.stale_sweep_interval,
            ),
            listener_enabled: parsed(&lookup, "DATAGRID_LISTENER_ENABLED", defaults.listener_enabled),
            http_timeout: seconds(&lookup, "DATAGRID_HTTP_TIMEOUT_SECS", defaults.http_timeout),
            resync_interval: seconds(&lookup, "DATAGRID_RESYNC_SECS", defaults.resync_interval),
        }
    }
}

fn parsed<T: FromStr + std::fmt::Debug>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key = %key, value = %raw, default = ?default, "Ignoring unparsable setting");
            default
        }),
    }
}

fn seconds(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: Duration) -> Duration {
    Duration::from_secs(parsed(lookup, key, default.as_secs()))
}
