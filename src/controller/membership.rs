//! Cluster membership checks.
//!
//! A cluster is formed when every expected pod reports a cluster view of
//! exactly the expected size. Pods are polled until that holds or the
//! configured formation timeout elapses.

use tokio::time::{Instant, sleep};
use tracing::debug;

use crate::client::Endpoint;
use crate::controller::cluster_topology::ReadyPod;
use crate::controller::context::Context;
use crate::crd::DataGridCluster;

/// Outcome of a membership check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub formed: bool,
    pub reason: &'static str,
    pub message: String,
}

impl Membership {
    fn formed(expected: i32) -> Self {
        Self {
            formed: true,
            reason: "ClusterFormed",
            message: format!("all {expected} members joined the cluster"),
        }
    }

    fn forming(reason: &'static str, message: String) -> Self {
        Self {
            formed: false,
            reason,
            message,
        }
    }

    /// Not all expected pods are ready yet, so membership was not polled.
    pub fn pods_not_ready(ready: i32, expected: i32) -> Self {
        Self::forming(
            "PodsNotReady",
            format!("{ready} of {expected} pods are ready"),
        )
    }
}

/// Poll `pods` until all report `expected` members or the timeout elapses.
pub async fn await_membership(
    ctx: &Context,
    cluster: &DataGridCluster,
    pods: &[ReadyPod],
    expected: i32,
) -> Membership {
    let deadline = Instant::now() + ctx.config.formation_timeout;
    loop {
        let membership = poll_membership(ctx, cluster, pods, expected).await;
        if membership.formed || Instant::now() >= deadline {
            return membership;
        }
        debug!(reason = membership.reason, message = %membership.message, "Cluster not formed yet");
        sleep(ctx.config.poll_period).await;
    }
}

/// Ask every pod once for its view of the cluster size.
pub async fn poll_membership(
    ctx: &Context,
    cluster: &DataGridCluster,
    pods: &[ReadyPod],
    expected: i32,
) -> Membership {
    if expected <= 0 || pods.is_empty() {
        return Membership::forming("NoMembers", "no members are expected".to_string());
    }

    for pod in pods {
        let endpoint = Endpoint::Pod {
            name: pod.name.clone(),
            ip: pod.ip.clone(),
        };
        let size = match ctx.connector.connect(cluster, endpoint).await {
            Ok(client) => client.cluster_size().await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match size {
            Ok(size) if size == expected => {}
            Ok(size) if size > expected => {
                return Membership::forming(
                    "TooManyMembers",
                    format!("pod {} sees {size} members, expected {expected}", pod.name),
                );
            }
            Ok(size) => {
                return Membership::forming(
                    "ClusterForming",
                    format!("pod {} sees {size} of {expected} members", pod.name),
                );
            }
            Err(e) => {
                return Membership::forming(
                    "MemberUnreachable",
                    format!("pod {} did not report its cluster view: {e}", pod.name),
                );
            }
        }
    }
    Membership::formed(expected)
}
