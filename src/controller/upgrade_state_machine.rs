//! State machine for operand version upgrades.
//!
//! An upgrade starts when the image the resource spec asks for differs from the image
//! the running cluster was formed with (`status.operandImage`). Two strategies
//! exist:
//!
//! - Shutdown: None → Upgrading → Stopping → WellFormed → None. The old
//!   members are drained completely before pods with the new image start.
//! - Rolling: None → Upgrading → WellFormed → None. The StatefulSet replaces
//!   pods one at a time.
//!
//! The state lives in `status.upgrade`, so every step is derived from the
//! persisted status plus observed workload and survives operator restarts.

use std::fmt;

use crate::crd::{UpgradeState, UpgradeStatus, UpgradeStrategy};

// ============================================================================
// Upgrade Events
// ============================================================================

/// Events that can trigger upgrade state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeEvent {
    /// The desired image differs from the operand image.
    VersionChanged,

    /// The desired image was reverted before any pod was stopped.
    VersionReverted,

    /// Old pods should be stopped (Shutdown strategy).
    StopRequested,

    /// All old pods terminated.
    PodsDrained,

    /// The StatefulSet rolled every pod to the target image (Rolling strategy).
    RolloutComplete,

    /// The cluster re-formed on the target image.
    ClusterFormed,
}

impl fmt::Display for UpgradeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeEvent::VersionChanged => write!(f, "VersionChanged"),
            UpgradeEvent::VersionReverted => write!(f, "VersionReverted"),
            UpgradeEvent::StopRequested => write!(f, "StopRequested"),
            UpgradeEvent::PodsDrained => write!(f, "PodsDrained"),
            UpgradeEvent::RolloutComplete => write!(f, "RolloutComplete"),
            UpgradeEvent::ClusterFormed => write!(f, "ClusterFormed"),
        }
    }
}

// ============================================================================
// Transition Context
// ============================================================================

/// Context data used to evaluate transition guards.
#[derive(Debug, Clone, Default)]
pub struct UpgradeTransitionContext {
    /// Upgrade strategy from the resource spec.
    pub strategy: UpgradeStrategy,

    /// Image the resource spec asks for.
    pub desired_image: String,

    /// Image the running cluster was formed with.
    pub operand_image: Option<String>,

    /// Image currently set on the StatefulSet.
    pub workload_image: Option<String>,

    /// Pods of the cluster that still exist.
    pub running_pods: i32,

    /// Whether the StatefulSet finished rolling out its current spec.
    pub rollout_complete: bool,

    /// Whether membership validation passed.
    pub cluster_formed: bool,
}

impl UpgradeTransitionContext {
    /// Whether the resource spec asks for an image other than the running one.
    pub fn version_changed(&self) -> bool {
        self.operand_image
            .as_deref()
            .is_some_and(|current| current != self.desired_image)
    }
}

// ============================================================================
// Upgrade Transition
// ============================================================================

/// Represents a single state transition.
#[derive(Debug, Clone)]
pub struct UpgradeTransition {
    /// Source state.
    pub from: UpgradeState,

    /// Target state.
    pub to: UpgradeState,

    /// Event that triggers this transition.
    pub event: UpgradeEvent,

    /// Human-readable description.
    pub description: &'static str,
}

// ============================================================================
// Upgrade State Machine
// ============================================================================

/// State machine for validating upgrade state transitions.
#[derive(Debug, Clone)]
pub struct UpgradeStateMachine {
    transitions: Vec<UpgradeTransition>,
}

impl Default for UpgradeStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl UpgradeStateMachine {
    /// Create a new state machine with all valid transitions.
    pub fn new() -> Self {
        let transitions = vec![
            // From None
            UpgradeTransition {
                from: UpgradeState::None,
                to: UpgradeState::Upgrading,
                event: UpgradeEvent::VersionChanged,
                description: "New image requested, hold it back from the workload",
            },
            // From Upgrading
            UpgradeTransition {
                from: UpgradeState::Upgrading,
                to: UpgradeState::None,
                event: UpgradeEvent::VersionReverted,
                description: "Image reverted to the running version",
            },
            UpgradeTransition {
                from: UpgradeState::Upgrading,
                to: UpgradeState::Stopping,
                event: UpgradeEvent::StopRequested,
                description: "Scale the old members to zero",
            },
            UpgradeTransition {
                from: UpgradeState::Upgrading,
                to: UpgradeState::WellFormed,
                event: UpgradeEvent::RolloutComplete,
                description: "Rolling update finished",
            },
            // From Stopping
            UpgradeTransition {
                from: UpgradeState::Stopping,
                to: UpgradeState::WellFormed,
                event: UpgradeEvent::PodsDrained,
                description: "Old members drained, start the new image",
            },
            // From WellFormed
            UpgradeTransition {
                from: UpgradeState::WellFormed,
                to: UpgradeState::None,
                event: UpgradeEvent::ClusterFormed,
                description: "Cluster re-formed on the new image",
            },
        ];

        Self { transitions }
    }

    /// Attempt to transition from one state to another given an event.
    ///
    /// Returns the transition if valid, None otherwise.
    pub fn transition(
        &self,
        from: UpgradeState,
        event: UpgradeEvent,
        ctx: &UpgradeTransitionContext,
    ) -> Option<UpgradeTransition> {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == from && t.event == event)?;

        if !self.evaluate_guards(transition, ctx) {
            return None;
        }

        Some(transition.clone())
    }

    /// Evaluate guards for a transition.
    fn evaluate_guards(&self, transition: &UpgradeTransition, ctx: &UpgradeTransitionContext) -> bool {
        match transition.event {
            UpgradeEvent::VersionChanged => ctx.version_changed(),
            UpgradeEvent::VersionReverted => !ctx.version_changed(),
            UpgradeEvent::StopRequested => ctx.strategy == UpgradeStrategy::Shutdown,
            UpgradeEvent::PodsDrained => ctx.running_pods == 0,
            UpgradeEvent::RolloutComplete => {
                ctx.strategy == UpgradeStrategy::Rolling
                    && ctx.rollout_complete
                    && ctx.workload_image.as_deref() == Some(ctx.desired_image.as_str())
            }
            UpgradeEvent::ClusterFormed => ctx.cluster_formed,
        }
    }

    /// Check if a state transition is valid (without guards).
    pub fn can_transition(&self, from: UpgradeState, to: UpgradeState) -> bool {
        if from == to {
            return true;
        }

        self.transitions
            .iter()
            .any(|t| t.from == from && t.to == to)
    }

    /// Get the list of valid next states from a given state.
    pub fn valid_transitions(&self, from: UpgradeState) -> Vec<UpgradeState> {
        self.transitions
            .iter()
            .filter(|t| t.from == from)
            .map(|t| t.to)
            .collect()
    }
}

/// Determine the appropriate upgrade event based on context.
pub fn determine_upgrade_event(
    state: UpgradeState,
    ctx: &UpgradeTransitionContext,
) -> Option<UpgradeEvent> {
    match state {
        UpgradeState::None => ctx.version_changed().then_some(UpgradeEvent::VersionChanged),

        UpgradeState::Upgrading => {
            if !ctx.version_changed() {
                Some(UpgradeEvent::VersionReverted)
            } else {
                match ctx.strategy {
                    UpgradeStrategy::Shutdown => Some(UpgradeEvent::StopRequested),
                    UpgradeStrategy::Rolling => Some(UpgradeEvent::RolloutComplete),
                }
            }
        }

        UpgradeState::Stopping => Some(UpgradeEvent::PodsDrained),

        UpgradeState::WellFormed => Some(UpgradeEvent::ClusterFormed),
    }
}

// ============================================================================
// Planning
// ============================================================================

/// Outcome of one upgrade planning step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradePlan {
    /// Upgrade progress to record in status (`None` when idle).
    pub upgrade: Option<UpgradeStatus>,
    /// Image the running cluster is considered to be formed with.
    pub operand_image: Option<String>,
    /// Event fired in this step.
    pub event: Option<UpgradeEvent>,
}

impl UpgradePlan {
    /// Current upgrade state.
    pub fn state(&self) -> UpgradeState {
        self.upgrade.as_ref().map_or(UpgradeState::None, |u| u.state)
    }

    /// Whether an upgrade is in flight.
    pub fn in_progress(&self) -> bool {
        self.state() != UpgradeState::None
    }

    /// Image the StatefulSet must carry in this state.
    pub fn workload_image<'a>(&'a self, ctx: &'a UpgradeTransitionContext) -> &'a str {
        let operand = self.operand_image.as_deref().unwrap_or(ctx.desired_image.as_str());
        let target = self
            .upgrade
            .as_ref()
            .map_or(ctx.desired_image.as_str(), |u| u.target_image.as_str());
        match self.state() {
            UpgradeState::None => ctx.desired_image.as_str(),
            UpgradeState::Upgrading => match ctx.strategy {
                UpgradeStrategy::Shutdown => operand,
                UpgradeStrategy::Rolling => target,
            },
            UpgradeState::Stopping => operand,
            UpgradeState::WellFormed => target,
        }
    }

    /// Whether the workload must be held at zero replicas.
    pub fn holds_workload_down(&self) -> bool {
        self.state() == UpgradeState::Stopping
    }
}

/// Advance the upgrade by at most one transition.
///
/// While an upgrade is in flight the target image follows the resource spec, so a
/// second image change during an upgrade is folded into the current one.
pub fn plan_upgrade(current: Option<&UpgradeStatus>, ctx: &UpgradeTransitionContext) -> UpgradePlan {
    let sm = UpgradeStateMachine::new();
    let state = current.map_or(UpgradeState::None, |u| u.state);
    let mut plan = UpgradePlan {
        upgrade: current
            .filter(|u| u.state != UpgradeState::None)
            .cloned(),
        operand_image: ctx.operand_image.clone(),
        event: None,
    };

    if let Some(upgrade) = plan.upgrade.as_mut()
        && matches!(state, UpgradeState::Upgrading | UpgradeState::Stopping)
    {
        upgrade.target_image = ctx.desired_image.clone();
    }

    let Some(event) = determine_upgrade_event(state, ctx) else {
        return plan;
    };
    let Some(transition) = sm.transition(state, event, ctx) else {
        return plan;
    };

    plan.event = Some(event);
    match transition.to {
        UpgradeState::None => {
            if event == UpgradeEvent::ClusterFormed {
                plan.operand_image = plan.upgrade.as_ref().map(|u| u.target_image.clone());
            }
            plan.upgrade = None;
        }
        to => {
            let target_image = plan
                .upgrade
                .as_ref()
                .map_or_else(|| ctx.desired_image.clone(), |u| u.target_image.clone());
            plan.upgrade = Some(UpgradeStatus {
                state: to,
                target_image,
            });
        }
    }
    plan
}
