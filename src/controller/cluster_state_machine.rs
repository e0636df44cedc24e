//! Formal finite state machine for graceful shutdown and restart.
//!
//! A cluster scaled to zero replicas is stopped gracefully: the servers are
//! asked to persist their state, the pod count is remembered and the
//! StatefulSet drains. Scaling back up restarts the cluster with the same
//! number of members.
//!
//! ## Phases
//!
//! Running → Stopping → Stopped → Running
//!
//! The phase is never stored on its own. It is derived from the Stopping and
//! GracefulShutdown conditions so a restarted operator resumes where the
//! previous one left off.

use std::fmt;

use crate::controller::error::{Error, Result};
use crate::crd::{ConditionType, DataGridClusterStatus};

/// Lifecycle phase of a cluster with respect to graceful shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecyclePhase {
    /// Pods run with the resource spec replica count.
    Running,
    /// Scaled to zero, waiting for the pods to terminate.
    Stopping,
    /// All pods gone; restart requires the remembered replica count.
    Stopped,
}

impl LifecyclePhase {
    /// Derive the phase from status conditions.
    pub fn from_status(status: Option<&DataGridClusterStatus>) -> Self {
        match status {
            Some(s) if s.is_condition_true(ConditionType::GracefulShutdown) => {
                LifecyclePhase::Stopped
            }
            Some(s) if s.is_condition_true(ConditionType::Stopping) => LifecyclePhase::Stopping,
            _ => LifecyclePhase::Running,
        }
    }

    /// Whether the workload must be held at zero replicas.
    pub fn holds_workload_down(&self) -> bool {
        !matches!(self, LifecyclePhase::Running)
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecyclePhase::Running => write!(f, "Running"),
            LifecyclePhase::Stopping => write!(f, "Stopping"),
            LifecyclePhase::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Events that trigger lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    /// The spec asks for zero replicas.
    ShutdownRequested,
    /// No pods of the cluster remain.
    PodsDrained,
    /// The spec asks for replicas again.
    RestartRequested,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::ShutdownRequested => write!(f, "ShutdownRequested"),
            LifecycleEvent::PodsDrained => write!(f, "PodsDrained"),
            LifecycleEvent::RestartRequested => write!(f, "RestartRequested"),
        }
    }
}

/// Observations used to evaluate lifecycle guards.
#[derive(Debug, Clone, Default)]
pub struct LifecycleContext {
    /// Replicas requested by the resource spec.
    pub spec_replicas: i32,
    /// Replicas currently set on the StatefulSet, if it exists.
    pub workload_replicas: Option<i32>,
    /// Pods of the cluster that still exist.
    pub running_pods: i32,
    /// Replica count remembered at shutdown.
    pub replicas_wanted_at_restart: Option<i32>,
}

/// A single lifecycle transition.
#[derive(Debug, Clone)]
pub struct LifecycleTransition {
    pub from: LifecyclePhase,
    pub to: LifecyclePhase,
    pub event: LifecycleEvent,
    pub description: &'static str,
}

/// Validates lifecycle transitions.
#[derive(Debug, Clone)]
pub struct LifecycleStateMachine {
    transitions: Vec<LifecycleTransition>,
}

impl Default for LifecycleStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleStateMachine {
    /// Create a state machine with all valid transitions.
    pub fn new() -> Self {
        let transitions = vec![
            LifecycleTransition {
                from: LifecyclePhase::Running,
                to: LifecyclePhase::Stopping,
                event: LifecycleEvent::ShutdownRequested,
                description: "Replicas set to zero, begin graceful shutdown",
            },
            LifecycleTransition {
                from: LifecyclePhase::Stopping,
                to: LifecyclePhase::Stopped,
                event: LifecycleEvent::PodsDrained,
                description: "All pods terminated",
            },
            LifecycleTransition {
                from: LifecyclePhase::Stopping,
                to: LifecyclePhase::Running,
                event: LifecycleEvent::RestartRequested,
                description: "Shutdown cancelled before pods drained",
            },
            LifecycleTransition {
                from: LifecyclePhase::Stopped,
                to: LifecyclePhase::Running,
                event: LifecycleEvent::RestartRequested,
                description: "Restart with the remembered replica count",
            },
        ];
        Self { transitions }
    }

    /// Attempt a transition; returns it when valid and its guard passes.
    pub fn transition(
        &self,
        from: LifecyclePhase,
        event: LifecycleEvent,
        ctx: &LifecycleContext,
    ) -> Option<LifecycleTransition> {
        let transition = self
            .transitions
            .iter()
            .find(|t| t.from == from && t.event == event)?;
        if !Self::evaluate_guards(transition, ctx) {
            return None;
        }
        Some(transition.clone())
    }

    fn evaluate_guards(transition: &LifecycleTransition, ctx: &LifecycleContext) -> bool {
        match transition.event {
            LifecycleEvent::ShutdownRequested => ctx.spec_replicas == 0,
            LifecycleEvent::PodsDrained => ctx.running_pods == 0,
            LifecycleEvent::RestartRequested => ctx.spec_replicas > 0,
        }
    }

    /// Phases reachable from `from`.
    pub fn valid_transitions(&self, from: LifecyclePhase) -> Vec<LifecyclePhase> {
        self.transitions
            .iter()
            .filter(|t| t.from == from)
            .map(|t| t.to)
            .collect()
    }

    /// Check if a phase transition is valid (without guards).
    pub fn can_transition(&self, from: LifecyclePhase, to: LifecyclePhase) -> bool {
        from == to
            || self
                .transitions
                .iter()
                .any(|t| t.from == from && t.to == to)
    }
}

/// Determine the lifecycle event implied by the observations.
pub fn determine_lifecycle_event(
    phase: LifecyclePhase,
    ctx: &LifecycleContext,
) -> Option<LifecycleEvent> {
    match phase {
        LifecyclePhase::Running if ctx.spec_replicas == 0 => {
            Some(LifecycleEvent::ShutdownRequested)
        }
        LifecyclePhase::Running => None,
        LifecyclePhase::Stopping | LifecyclePhase::Stopped if ctx.spec_replicas > 0 => {
            Some(LifecycleEvent::RestartRequested)
        }
        LifecyclePhase::Stopping if ctx.running_pods == 0 => Some(LifecycleEvent::PodsDrained),
        LifecyclePhase::Stopping | LifecyclePhase::Stopped => None,
    }
}

/// Outcome of lifecycle planning for one reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecyclePlan {
    /// Phase after this reconciliation.
    pub phase: LifecyclePhase,
    /// Transition taken, if any.
    pub event: Option<LifecycleEvent>,
    /// Value for `status.replicasWantedAtRestart`.
    pub replicas_wanted_at_restart: Option<i32>,
}

impl LifecyclePlan {
    /// Whether the servers should be told to persist state and stop.
    pub fn signal_shutdown(&self) -> bool {
        self.event == Some(LifecycleEvent::ShutdownRequested)
    }

    /// Replica count the StatefulSet must carry.
    pub fn workload_replicas(&self, spec_replicas: i32) -> i32 {
        if self.phase.holds_workload_down() {
            0
        } else {
            spec_replicas
        }
    }
}

/// Plan the lifecycle step for the current observations.
///
/// Restarting a stopped cluster with a replica count other than the one it
/// was stopped with is rejected; the members would not find their persisted
/// state otherwise.
pub fn plan_lifecycle(
    status: Option<&DataGridClusterStatus>,
    ctx: &LifecycleContext,
) -> Result<LifecyclePlan> {
    let sm = LifecycleStateMachine::new();
    let phase = LifecyclePhase::from_status(status);
    let mut plan = LifecyclePlan {
        phase,
        event: None,
        replicas_wanted_at_restart: ctx.replicas_wanted_at_restart,
    };

    let Some(event) = determine_lifecycle_event(phase, ctx) else {
        return Ok(plan);
    };
    let Some(transition) = sm.transition(phase, event, ctx) else {
        return Ok(plan);
    };

    match event {
        LifecycleEvent::ShutdownRequested => {
            plan.replicas_wanted_at_restart = ctx
                .workload_replicas
                .filter(|r| *r > 0)
                .or(ctx.replicas_wanted_at_restart);
        }
        LifecycleEvent::RestartRequested if phase == LifecyclePhase::Stopped => {
            if let Some(wanted) = ctx.replicas_wanted_at_restart
                && wanted != ctx.spec_replicas
            {
                return Err(Error::Validation(format!(
                    "spec.replicas must equal {wanted} to restart the cluster"
                )));
            }
            plan.replicas_wanted_at_restart = None;
        }
        LifecycleEvent::RestartRequested => {
            plan.replicas_wanted_at_restart = None;
        }
        LifecycleEvent::PodsDrained => {}
    }

    plan.phase = transition.to;
    plan.event = Some(event);
    Ok(plan)
}
