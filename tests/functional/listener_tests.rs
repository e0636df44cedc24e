//! Event listener scenarios: server-side cache changes mirrored into Cache
//! resources, and those resources left alone by the cache reconciler.

use std::time::Duration;

use kube::ResourceExt;

use datagrid_operator::client::{ConfigEvent, ConfigEventKind, Endpoint};
use datagrid_operator::controller::cache_listener::ListenerOutcome;
use datagrid_operator::controller::error::Error;
use datagrid_operator::crd::{
    Cache, CacheLifecycle, CacheOrigin, LISTENER_GENERATION_ANNOTATION,
};

use crate::mock_state::*;

const SYNC_CONFIG: &str = "distributedCache:\n  mode: SYNC";
const ASYNC_CONFIG: &str = "distributedCache:\n  mode: ASYNC";

fn harness() -> Harness {
    let h = Harness::new();
    h.store.insert_cluster(well_formed_cluster("example"));
    h
}

fn created_name(outcome: ListenerOutcome) -> String {
    match outcome {
        ListenerOutcome::Created(name) => name,
        other => panic!("expected a created resource, got {other:?}"),
    }
}

fn listener_generation(cache: &Cache) -> Option<String> {
    cache
        .annotations()
        .get(LISTENER_GENERATION_ANNOTATION)
        .cloned()
}

// ============================================================================
// Create and update
// ============================================================================

/// A cache created on the server gets a Cache resource with a generated
/// name, provenance and ownership.
#[tokio::test]
async fn test_server_cache_creates_resource() {
    let h = harness();
    let listener = h.listener("example");

    let outcome = listener
        .create_or_update(&cache_event_payload("foo", SYNC_CONFIG))
        .await
        .unwrap();

    let name = created_name(outcome);
    assert!(name.starts_with("foo-"));
    let created = h.store.cache(&name).unwrap();
    assert_eq!(created.metadata.generate_name.as_deref(), Some("foo-"));
    assert_eq!(listener_generation(&created).as_deref(), Some("1"));
    assert_eq!(created.spec.name.as_deref(), Some("foo"));
    assert_eq!(created.spec.cluster_name, "example");
    assert!(created.spec.template.as_deref().unwrap().contains("mode: SYNC"));
    assert!(created.has_finalizer());
    let owner = &created.owner_references()[0];
    assert_eq!(owner.name, "example");
    assert_eq!(owner.uid, "uid-example");
    assert!(!created.reconcile_on_server());
}

/// The mirrored resource is acknowledged without echoing it to the server.
#[tokio::test]
async fn test_mirrored_resource_is_not_pushed_back() {
    let h = harness();
    let name = created_name(
        h.listener("example")
            .create_or_update(&cache_event_payload("foo", SYNC_CONFIG))
            .await
            .unwrap(),
    );

    h.reconcile_cache(&name).await.unwrap();

    assert!(h.grid.calls().is_empty());
    let stored = h.store.cache(&name).unwrap();
    assert!(ready_condition(&stored).unwrap().is_true());
}

/// A second server change bumps the listener generation with the resource
/// generation.
#[tokio::test]
async fn test_server_update_tracks_generation() {
    let h = harness();
    let listener = h.listener("example");
    let name = created_name(
        listener
            .create_or_update(&cache_event_payload("foo", SYNC_CONFIG))
            .await
            .unwrap(),
    );

    let outcome = listener
        .create_or_update(&cache_event_payload("foo", ASYNC_CONFIG))
        .await
        .unwrap();

    assert_eq!(outcome, ListenerOutcome::Updated(name.clone()));
    let updated = h.store.cache(&name).unwrap();
    assert_eq!(listener_generation(&updated).as_deref(), Some("2"));
    assert_eq!(updated.metadata.generation, Some(2));
    assert_eq!(updated.origin(), CacheOrigin::ServerEvent { generation: 2 });
    assert!(updated.spec.template.as_deref().unwrap().contains("mode: ASYNC"));
    assert!(!updated.reconcile_on_server());
    assert_eq!(h.store.caches().len(), 1);
}

/// Lost optimistic concurrency races are retried with a fresh read.
#[tokio::test]
async fn test_update_retries_conflicts() {
    let h = harness();
    let listener = h.listener("example");
    let name = created_name(
        listener
            .create_or_update(&cache_event_payload("foo", SYNC_CONFIG))
            .await
            .unwrap(),
    );

    h.store.inject_conflicts(4);
    let outcome = listener
        .create_or_update(&cache_event_payload("foo", ASYNC_CONFIG))
        .await
        .unwrap();

    assert_eq!(outcome, ListenerOutcome::Updated(name.clone()));
    assert_eq!(
        listener_generation(&h.store.cache(&name).unwrap()).as_deref(),
        Some("2")
    );
}

/// Five conflicting attempts give up with a permanent error.
#[tokio::test]
async fn test_update_gives_up_after_five_conflicts() {
    let h = harness();
    let listener = h.listener("example");
    let name = created_name(
        listener
            .create_or_update(&cache_event_payload("foo", SYNC_CONFIG))
            .await
            .unwrap(),
    );

    h.store.inject_conflicts(5);
    let err = listener
        .create_or_update(&cache_event_payload("foo", ASYNC_CONFIG))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Permanent(_)));
    let unchanged = h.store.cache(&name).unwrap();
    assert_eq!(listener_generation(&unchanged).as_deref(), Some("1"));
    assert!(unchanged.spec.template.as_deref().unwrap().contains("mode: SYNC"));
}

/// Updates keep the markup the user wrote the template in.
#[tokio::test]
async fn test_update_keeps_user_markup() {
    let h = harness();
    h.store.insert_cache(cache(
        "sessions",
        "example",
        Some(r#"<distributed-cache mode="SYNC"/>"#),
        None,
    ));

    let outcome = h
        .listener("example")
        .create_or_update(&cache_event_payload("sessions", ASYNC_CONFIG))
        .await
        .unwrap();

    assert_eq!(outcome, ListenerOutcome::Updated("sessions".to_string()));
    let updated = h.store.cache("sessions").unwrap();
    assert!(updated.spec.template.as_deref().unwrap().starts_with("<converted"));
    assert_eq!(h.grid.lock().conversions, 1);
    assert!(!updated.reconcile_on_server());
}

/// Resources created from a server template keep referring to it.
#[tokio::test]
async fn test_update_keeps_template_name() {
    let h = harness();
    let mut declared = cache("sessions", "example", None, Some("org.infinispan.DIST_SYNC"));
    declared.spec.name = Some("sessions".to_string());
    h.store.insert_cache(declared);

    h.listener("example")
        .create_or_update(&cache_event_payload("sessions", ASYNC_CONFIG))
        .await
        .unwrap();

    let updated = h.store.cache("sessions").unwrap();
    assert_eq!(
        updated.spec.template_name.as_deref(),
        Some("org.infinispan.DIST_SYNC")
    );
    assert_eq!(updated.spec.template, None);
    assert_eq!(listener_generation(&updated).as_deref(), Some("2"));
}

/// Internal server caches are never mirrored.
#[tokio::test]
async fn test_internal_caches_are_ignored() {
    let h = harness();

    let outcome = h
        .listener("example")
        .create_or_update(&cache_event_payload("___protobuf_metadata", SYNC_CONFIG))
        .await
        .unwrap();

    assert_eq!(outcome, ListenerOutcome::Ignored);
    assert!(h.store.caches().is_empty());
}

/// Cache names that map to no valid resource name are refused.
#[tokio::test]
async fn test_unrepresentable_cache_name_is_rejected() {
    let h = harness();

    let err = h
        .listener("example")
        .create_or_update(&cache_event_payload("café", SYNC_CONFIG))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert!(h.store.caches().is_empty());
}

/// Server names are kebab-cased into the resource name prefix.
#[tokio::test]
async fn test_resource_name_is_kebab_cased() {
    let h = harness();

    let name = created_name(
        h.listener("example")
            .create_or_update(&cache_event_payload("UserSessions", SYNC_CONFIG))
            .await
            .unwrap(),
    );

    assert!(name.starts_with("user-sessions-"));
    assert_eq!(
        h.store.cache(&name).unwrap().spec.name.as_deref(),
        Some("UserSessions")
    );
}

/// Two resources for one server cache cannot be reconciled.
#[tokio::test]
async fn test_duplicate_resources_are_a_consistency_error() {
    let h = harness();
    for name in ["foo-a", "foo-b"] {
        let mut duplicate = cache(name, "example", Some(SYNC_CONFIG), None);
        duplicate.spec.name = Some("foo".to_string());
        h.store.insert_cache(duplicate);
    }

    let err = h
        .listener("example")
        .create_or_update(&cache_event_payload("foo", ASYNC_CONFIG))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Consistency(_)));
}

/// Payloads that do not hold exactly one cache are malformed.
#[tokio::test]
async fn test_malformed_payload_is_rejected() {
    let h = harness();

    let err = h
        .listener("example")
        .create_or_update("infinispan:\n  cacheContainer:\n    caches: {}\n")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::MalformedPayload(_)));
}

// ============================================================================
// Removal
// ============================================================================

/// A cache removed on the server marks its resource, which the cache
/// reconciler then deletes without calling the server.
#[tokio::test]
async fn test_remove_event_marks_and_deletes_resource() {
    let h = harness();
    let listener = h.listener("example");
    let name = created_name(
        listener
            .create_or_update(&cache_event_payload("foo", SYNC_CONFIG))
            .await
            .unwrap(),
    );

    let outcome = listener.delete("foo").await.unwrap();

    assert_eq!(outcome, ListenerOutcome::Marked(name.clone()));
    assert_eq!(
        h.store.cache(&name).unwrap().lifecycle(),
        CacheLifecycle::PendingServerDelete
    );
    assert_eq!(listener.delete("foo").await.unwrap(), ListenerOutcome::Ignored);

    h.reconcile_cache(&name).await.unwrap();
    assert!(h.store.cache(&name).is_none());
    assert!(h.grid.calls().is_empty());
}

/// Removing an unknown cache is a no-op.
#[tokio::test]
async fn test_remove_event_for_unknown_cache() {
    let h = harness();

    let outcome = h.listener("example").delete("nothing").await.unwrap();

    assert_eq!(outcome, ListenerOutcome::Ignored);
    assert_eq!(h.store.writes(), 0);
}

/// Only listener-owned resources missing on the server are marked stale.
#[tokio::test]
async fn test_stale_sweep_marks_only_missing_owned_caches() {
    let h = harness();
    let listener = h.listener("example");
    let mut names = Vec::new();
    for cache_name in ["a", "b", "c"] {
        names.push(created_name(
            listener
                .create_or_update(&cache_event_payload(cache_name, SYNC_CONFIG))
                .await
                .unwrap(),
        ));
    }
    h.store
        .insert_cache(cache("d", "example", Some(SYNC_CONFIG), None));
    h.grid.define_cache("a", SYNC_CONFIG);
    h.grid.define_cache("b", SYNC_CONFIG);

    let marked = listener
        .remove_stale_resources(Endpoint::Service)
        .await
        .unwrap();

    assert_eq!(marked, vec![names[2].clone()]);
    let lifecycle = |name: &str| h.store.cache(name).unwrap().lifecycle();
    assert_eq!(lifecycle(&names[0]), CacheLifecycle::Active);
    assert_eq!(lifecycle(&names[1]), CacheLifecycle::Active);
    assert_eq!(lifecycle(&names[2]), CacheLifecycle::PendingServerDelete);
    assert_eq!(lifecycle("d"), CacheLifecycle::Active);

    let marked_again = listener
        .remove_stale_resources(Endpoint::Service)
        .await
        .unwrap();
    assert!(marked_again.is_empty());
}

// ============================================================================
// Listener task
// ============================================================================

/// The listener task mirrors streamed events and exits once its cluster is
/// gone.
#[tokio::test(start_paused = true)]
async fn test_listener_task_runs_until_cluster_removed() {
    let h = harness();
    h.grid.push_event(ConfigEvent {
        kind: ConfigEventKind::CreateCache,
        payload: cache_event_payload("foo", SYNC_CONFIG),
    });
    h.grid.push_event(ConfigEvent {
        kind: ConfigEventKind::CreateCache,
        payload: cache_event_payload("bar", SYNC_CONFIG),
    });
    h.grid.push_event(ConfigEvent {
        kind: ConfigEventKind::RemoveCache,
        payload: "bar".to_string(),
    });

    let task = tokio::spawn(h.listener("example").run(Duration::from_secs(300)));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let caches = h.store.caches();
    let foo = caches
        .iter()
        .find(|c| c.cache_name() == "foo")
        .unwrap();
    assert_eq!(foo.lifecycle(), CacheLifecycle::Active);
    let bar = caches
        .iter()
        .find(|c| c.cache_name() == "bar")
        .unwrap();
    assert_eq!(bar.lifecycle(), CacheLifecycle::PendingServerDelete);

    h.store.remove_cluster("example");
    tokio::time::timeout(Duration::from_secs(600), task)
        .await
        .unwrap()
        .unwrap();
}
