// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic,
    clippy::string_slice
)]

//! Property-based tests for datagrid-operator.
//!
//! Uses proptest to generate random inputs and verify invariants.

use proptest::prelude::*;

use datagrid_operator::client::{ConfigEvent, ConfigEventKind, EventStreamParser};
use datagrid_operator::controller::cache_listener::{parse_cache_event, sanitize_cache_name};
use datagrid_operator::controller::cluster_state_machine::{
    LifecycleContext, LifecyclePhase, LifecycleStateMachine, plan_lifecycle,
};
use datagrid_operator::controller::common::to_kebab_case;
use datagrid_operator::controller::error::Error;
use datagrid_operator::controller::upgrade_state_machine::{
    UpgradeEvent, UpgradeStateMachine, UpgradeTransitionContext, plan_upgrade,
};
use datagrid_operator::crd::{
    Condition, ConditionType, DataGridClusterStatus, UpgradeState, UpgradeStatus,
    UpgradeStrategy,
};

const IMAGES: [&str; 3] = [
    "quay.io/infinispan/server:14.0",
    "quay.io/infinispan/server:15.0",
    "quay.io/infinispan/server:15.1",
];

/// Strategy for generating lifecycle phases.
fn any_phase() -> impl Strategy<Value = LifecyclePhase> {
    prop_oneof![
        Just(LifecyclePhase::Running),
        Just(LifecyclePhase::Stopping),
        Just(LifecyclePhase::Stopped),
    ]
}

/// Strategy for generating upgrade states.
fn any_upgrade_state() -> impl Strategy<Value = UpgradeState> {
    prop_oneof![
        Just(UpgradeState::None),
        Just(UpgradeState::Upgrading),
        Just(UpgradeState::Stopping),
        Just(UpgradeState::WellFormed),
    ]
}

fn any_strategy() -> impl Strategy<Value = UpgradeStrategy> {
    prop_oneof![Just(UpgradeStrategy::Shutdown), Just(UpgradeStrategy::Rolling)]
}

fn any_image() -> impl Strategy<Value = String> {
    prop::sample::select(IMAGES.to_vec()).prop_map(str::to_string)
}

fn lifecycle_context() -> impl Strategy<Value = LifecycleContext> {
    (
        0..=7i32,
        prop::option::of(0..=7i32),
        0..=7i32,
        prop::option::of(1..=7i32),
    )
        .prop_map(
            |(spec_replicas, workload_replicas, running_pods, replicas_wanted_at_restart)| {
                LifecycleContext {
                    spec_replicas,
                    workload_replicas,
                    running_pods,
                    replicas_wanted_at_restart,
                }
            },
        )
}

fn upgrade_context() -> impl Strategy<Value = UpgradeTransitionContext> {
    (
        any_strategy(),
        any_image(),
        prop::option::of(any_image()),
        prop::option::of(any_image()),
        0..=5i32,
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(
            |(
                strategy,
                desired_image,
                operand_image,
                workload_image,
                running_pods,
                rollout_complete,
                cluster_formed,
            )| UpgradeTransitionContext {
                strategy,
                desired_image,
                operand_image,
                workload_image,
                running_pods,
                rollout_complete,
                cluster_formed,
            },
        )
}

/// Status whose conditions encode `phase`.
fn status_for(phase: LifecyclePhase) -> DataGridClusterStatus {
    let conditions = match phase {
        LifecyclePhase::Running => vec![],
        LifecyclePhase::Stopping => vec![Condition::new(
            ConditionType::Stopping,
            true,
            "ScaledToZero",
            "",
            None,
        )],
        LifecyclePhase::Stopped => vec![Condition::new(
            ConditionType::GracefulShutdown,
            true,
            "PodsDrained",
            "",
            None,
        )],
    };
    DataGridClusterStatus {
        conditions,
        ..Default::default()
    }
}

fn render_event(kind: ConfigEventKind, payload_lines: &[String]) -> String {
    let mut out = format!("event: {}\n", kind.event_name());
    for line in payload_lines {
        out.push_str(&format!("data: {line}\n"));
    }
    out.push('\n');
    out
}

fn any_event_kind() -> impl Strategy<Value = ConfigEventKind> {
    prop_oneof![
        Just(ConfigEventKind::CreateCache),
        Just(ConfigEventKind::UpdateCache),
        Just(ConfigEventKind::RemoveCache),
    ]
}

proptest! {
    /// Property: Lifecycle planning only moves along declared transitions.
    #[test]
    fn test_lifecycle_plan_follows_state_machine(
        phase in any_phase(),
        ctx in lifecycle_context()
    ) {
        let sm = LifecycleStateMachine::new();
        if let Ok(plan) = plan_lifecycle(Some(&status_for(phase)), &ctx) {
            prop_assert!(
                sm.can_transition(phase, plan.phase),
                "{:?} -> {:?} is not a declared transition", phase, plan.phase
            );
            prop_assert_eq!(plan.event.is_some(), plan.phase != phase);
        }
    }

    /// Property: Only a restart with a different replica count is rejected.
    #[test]
    fn test_restart_requires_remembered_replicas(
        spec_replicas in 1..=7i32,
        wanted in 1..=7i32
    ) {
        let ctx = LifecycleContext {
            spec_replicas,
            workload_replicas: Some(0),
            running_pods: 0,
            replicas_wanted_at_restart: Some(wanted),
        };
        let result = plan_lifecycle(Some(&status_for(LifecyclePhase::Stopped)), &ctx);
        if spec_replicas == wanted {
            let plan = result.unwrap();
            prop_assert_eq!(plan.phase, LifecyclePhase::Running);
            prop_assert_eq!(plan.replicas_wanted_at_restart, None);
        } else {
            prop_assert!(matches!(result, Err(Error::Validation(_))));
        }
    }

    /// Property: A shutdown remembers the running replica count.
    #[test]
    fn test_shutdown_remembers_replicas(workload in 1..=7i32, running in 0..=7i32) {
        let ctx = LifecycleContext {
            spec_replicas: 0,
            workload_replicas: Some(workload),
            running_pods: running,
            replicas_wanted_at_restart: None,
        };
        let plan = plan_lifecycle(None, &ctx).unwrap();
        prop_assert_eq!(plan.phase, LifecyclePhase::Stopping);
        prop_assert!(plan.signal_shutdown());
        prop_assert_eq!(plan.replicas_wanted_at_restart, Some(workload));
        prop_assert_eq!(plan.workload_replicas(0), 0);
    }

    /// Property: Upgrade planning only moves along declared transitions.
    #[test]
    fn test_upgrade_plan_follows_state_machine(
        state in any_upgrade_state(),
        target in any_image(),
        ctx in upgrade_context()
    ) {
        let sm = UpgradeStateMachine::new();
        let current = UpgradeStatus { state, target_image: target };
        let plan = plan_upgrade(Some(&current), &ctx);
        prop_assert!(
            sm.can_transition(state, plan.state()),
            "{:?} -> {:?} is not a declared transition", state, plan.state()
        );
    }

    /// Property: The operand image only changes when the cluster re-formed.
    #[test]
    fn test_operand_image_changes_only_on_formation(
        state in any_upgrade_state(),
        target in any_image(),
        ctx in upgrade_context()
    ) {
        let current = UpgradeStatus { state, target_image: target };
        let plan = plan_upgrade(Some(&current), &ctx);
        if plan.operand_image != ctx.operand_image {
            prop_assert_eq!(plan.event, Some(UpgradeEvent::ClusterFormed));
        }
    }

    /// Property: Without an image change no upgrade starts.
    #[test]
    fn test_no_upgrade_without_version_change(ctx in upgrade_context()) {
        let ctx = UpgradeTransitionContext {
            operand_image: Some(ctx.desired_image.clone()),
            ..ctx
        };
        let plan = plan_upgrade(None, &ctx);
        prop_assert_eq!(plan.state(), UpgradeState::None);
        prop_assert_eq!(plan.event, None);
        prop_assert_eq!(plan.workload_image(&ctx), ctx.desired_image.as_str());
    }

    /// Property: Sanitized cache names are valid DNS-1123 subdomains.
    #[test]
    fn test_sanitized_names_are_dns_subdomains(name in "\\PC{0,40}") {
        if let Ok(sanitized) = sanitize_cache_name(&name) {
            prop_assert!(!sanitized.is_empty());
            prop_assert!(sanitized.len() <= 253);
            prop_assert!(sanitized.chars().all(|c| c == '-' || c.is_ascii_lowercase() || c.is_ascii_digit()));
            prop_assert!(!sanitized.starts_with('-'));
            prop_assert!(!sanitized.ends_with('-'));
        }
    }

    /// Property: ASCII names with at least one letter always sanitize.
    #[test]
    fn test_ascii_names_sanitize(name in "[A-Za-z][A-Za-z0-9_. -]{0,30}") {
        prop_assert!(sanitize_cache_name(&name).is_ok());
    }

    /// Property: Kebab-casing is idempotent.
    #[test]
    fn test_kebab_case_idempotent(name in "[A-Za-z0-9_. -]{0,40}") {
        let once = to_kebab_case(&name);
        prop_assert_eq!(to_kebab_case(&once), once);
    }

    /// Property: Event payloads round-trip the single cache they carry.
    #[test]
    fn test_cache_event_payload_yields_its_cache(
        name in "c[a-zA-Z0-9_]{0,20}",
        mode in prop_oneof![Just("SYNC"), Just("ASYNC")],
        owners in 1..=5u8
    ) {
        let payload = format!(
            "infinispan:\n  cacheContainer:\n    caches:\n      {name}:\n        distributedCache:\n          mode: {mode}\n          owners: {owners}\n"
        );
        let (parsed_name, config) = parse_cache_event(&payload).unwrap();
        prop_assert_eq!(parsed_name, name);
        let config: serde_yaml::Value = serde_yaml::from_str(&config).unwrap();
        prop_assert_eq!(
            config["distributedCache"]["mode"].as_str(),
            Some(mode)
        );
    }

    /// Property: The event stream parser does not depend on chunk boundaries.
    #[test]
    fn test_event_stream_chunking(
        events in prop::collection::vec(
            (any_event_kind(), prop::collection::vec("[a-zA-Z0-9 :_]{0,20}", 1..4)),
            0..6
        ),
        split_seed in any::<usize>()
    ) {
        let body: String = events
            .iter()
            .map(|(kind, lines)| render_event(*kind, lines))
            .collect();
        let expected: Vec<ConfigEvent> = events
            .iter()
            .map(|(kind, lines)| ConfigEvent { kind: *kind, payload: lines.join("\n") })
            .collect();

        let mut whole = EventStreamParser::new();
        prop_assert_eq!(&whole.feed(body.as_bytes()), &expected);

        let split = if body.is_empty() { 0 } else { split_seed % body.len() };
        let (head, tail) = body.as_bytes().split_at(split);
        let mut chunked = EventStreamParser::new();
        let mut parsed = chunked.feed(head);
        parsed.extend(chunked.feed(tail));
        prop_assert_eq!(parsed, expected);
    }
}
