//! Status conditions shared by the DataGridCluster and Cache resources.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition describes the state of a resource at a certain point.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: ConditionType,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Create a "Ready" condition.
    pub fn ready(ready: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new(ConditionType::Ready, ready, reason, message, generation)
    }

    /// Create a "WellFormed" condition.
    pub fn well_formed(formed: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new(ConditionType::WellFormed, formed, reason, message, generation)
    }

    /// Whether the condition status is "True".
    pub fn is_true(&self) -> bool {
        self.status == "True"
    }

    /// Two conditions carry the same observable state, ignoring the timestamp.
    pub fn same_state(&self, other: &Condition) -> bool {
        self.r#type == other.r#type
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
            && self.observed_generation == other.observed_generation
    }
}

/// Types of conditions reported by the operator.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConditionType {
    /// Every expected member joined the cluster.
    WellFormed,
    /// A version upgrade is in progress.
    Upgrade,
    /// Pods are being stopped for a graceful shutdown or a downtime upgrade.
    Stopping,
    /// The cluster has been shut down gracefully and may be restarted.
    GracefulShutdown,
    /// The cluster spec passed validation.
    PreliminaryChecksPassed,
    /// The cache exists on the server with the declared configuration.
    Ready,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionType::WellFormed => write!(f, "WellFormed"),
            ConditionType::Upgrade => write!(f, "Upgrade"),
            ConditionType::Stopping => write!(f, "Stopping"),
            ConditionType::GracefulShutdown => write!(f, "GracefulShutdown"),
            ConditionType::PreliminaryChecksPassed => write!(f, "PreliminaryChecksPassed"),
            ConditionType::Ready => write!(f, "Ready"),
        }
    }
}
