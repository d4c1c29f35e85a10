//! Integration tests for the reconciliation tick.
//!
//! These tests drive `Orchestrator::tick` directly against the in-memory
//! store and the mock runtime, and check:
//! 1. Convergence of live workers to the enabled desired agents
//! 2. Idempotence of repeated ticks
//! 3. Hash-triggered, positional graph reloads
//! 4. Dirty resets, removals and port accounting
//! 5. Failure handling (store down, load failures, pool exhaustion)

use std::sync::Arc;
use std::time::Duration;

use magick_id::AgentId;
use magick_reconcile::{GraphHash, PortRange};
use magick_world::runtime::RuntimeEvent;
use magick_world::{
    AgentStore, DesiredAgentRecord, GraphSlot, MemoryStore, MockRuntime, Orchestrator,
    OrchestratorConfig, TickOutcome, TickPhase, TickReport, WorkerRuntime,
};
use rstest::rstest;

struct World {
    store: Arc<MemoryStore>,
    runtime: Arc<MockRuntime>,
    orchestrator: Orchestrator,
}

fn agent(id: &str) -> AgentId {
    AgentId::parse(id).unwrap()
}

fn hash(value: &str) -> GraphHash {
    GraphHash::new(value)
}

fn world(ports: PortRange) -> World {
    let store = Arc::new(MemoryStore::new());
    let runtime = Arc::new(MockRuntime::new());
    let orchestrator = Orchestrator::new(
        Arc::clone(&store) as Arc<dyn AgentStore>,
        Arc::clone(&runtime) as Arc<dyn WorkerRuntime>,
        OrchestratorConfig {
            ports,
            operation_timeout: Duration::from_secs(5),
        },
    );

    World {
        store,
        runtime,
        orchestrator,
    }
}

fn default_world() -> World {
    world(PortRange::new(10001, 10010))
}

async fn completed(world: &World) -> TickReport {
    match world.orchestrator.tick().await.unwrap() {
        TickOutcome::Completed(report) => report,
        other => panic!("expected completed tick, got {other:?}"),
    }
}

async fn failed(world: &World) -> TickReport {
    match world.orchestrator.tick().await.unwrap() {
        TickOutcome::Failed(report) => report,
        other => panic!("expected failed tick, got {other:?}"),
    }
}

#[tokio::test]
async fn test_single_agent_gets_a_worker() {
    let world = default_world();
    world.store.upsert_agent(DesiredAgentRecord::new(agent("1"))).await;

    let report = completed(&world).await;

    assert_eq!(report.created, vec![agent("1")]);
    assert_eq!(world.orchestrator.list_active_worker_ids().await, vec![agent("1")]);
    assert_eq!(world.orchestrator.worker_port(&agent("1")).await, Some(10001));
    assert_eq!(report.reloads, 0);
}

#[rstest]
#[case(&[("1", true)], &["1"])]
#[case(&[("1", true), ("2", false), ("3", true)], &["1", "3"])]
#[case(&[("1", false)], &[])]
#[case(&[], &[])]
#[tokio::test]
async fn test_convergence(#[case] records: &[(&str, bool)], #[case] expected: &[&str]) {
    let world = default_world();
    for (id, enabled) in records {
        world
            .store
            .upsert_agent(DesiredAgentRecord::new(agent(id)).with_enabled(*enabled))
            .await;
    }

    completed(&world).await;

    let expected: Vec<AgentId> = expected.iter().map(|id| agent(id)).collect();
    assert_eq!(world.orchestrator.list_active_worker_ids().await, expected);
}

#[tokio::test]
async fn test_unchanged_state_is_idempotent() {
    let world = default_world();
    world.store.put_graph_with_hash("root", hash("a")).await;
    world.store.put_graph_with_hash("s1", hash("x")).await;
    world
        .store
        .upsert_agent(
            DesiredAgentRecord::new(agent("1"))
                .with_root_spell("root")
                .with_spells(["s1"]),
        )
        .await;
    world.store.upsert_agent(DesiredAgentRecord::new(agent("2"))).await;

    let first = completed(&world).await;
    assert_eq!(first.created.len(), 2);
    assert_eq!(first.reloads, 2);
    let events_after_first = world.runtime.events().len();

    let second = completed(&world).await;

    assert!(second.is_noop(), "second tick did work: {second:?}");
    assert_eq!(world.runtime.events().len(), events_after_first);
}

#[tokio::test]
async fn test_root_hash_change_reloads_once() {
    let world = default_world();
    world.store.put_graph_with_hash("root-1", hash("a")).await;
    world.store.put_graph_with_hash("root-2", hash("q")).await;
    world
        .store
        .upsert_agent(DesiredAgentRecord::new(agent("1")).with_root_spell("root-1"))
        .await;
    world
        .store
        .upsert_agent(DesiredAgentRecord::new(agent("2")).with_root_spell("root-2"))
        .await;
    completed(&world).await;
    world.runtime.clear_events();

    world.store.put_graph_with_hash("root-1", hash("b")).await;
    let report = completed(&world).await;

    assert_eq!(report.reloads, 1);
    assert_eq!(
        world.runtime.events(),
        vec![RuntimeEvent::Loaded {
            agent_id: agent("1"),
            slot: GraphSlot::Root,
            graph: "root-1".to_string(),
            hash: hash("b"),
        }]
    );

    let (root, _) = world.orchestrator.worker_hashes(&agent("1")).await.unwrap();
    assert_eq!(root, Some(hash("b")));
    let (root, _) = world.orchestrator.worker_hashes(&agent("2")).await.unwrap();
    assert_eq!(root, Some(hash("q")));
}

#[tokio::test]
async fn test_spell_reload_is_positional() {
    let world = default_world();
    for (name, h) in [("a", "ha"), ("b", "hb"), ("c", "hc")] {
        world.store.put_graph_with_hash(name, hash(h)).await;
    }
    world
        .store
        .upsert_agent(DesiredAgentRecord::new(agent("1")).with_spells(["a", "b", "c"]))
        .await;
    let first = completed(&world).await;
    assert_eq!(first.reloads, 3);
    world.runtime.clear_events();

    world.store.put_graph_with_hash("b", hash("hb2")).await;
    let report = completed(&world).await;

    assert_eq!(report.reloads, 1);
    assert_eq!(
        world.runtime.events(),
        vec![RuntimeEvent::Loaded {
            agent_id: agent("1"),
            slot: GraphSlot::Spell(1),
            graph: "b".to_string(),
            hash: hash("hb2"),
        }]
    );

    let (_, spells) = world.orchestrator.worker_hashes(&agent("1")).await.unwrap();
    assert_eq!(spells, vec![Some(hash("ha")), Some(hash("hb2")), Some(hash("hc"))]);
}

#[tokio::test]
async fn test_spell_list_shrinks_and_grows() {
    let world = default_world();
    for (name, h) in [("a", "ha"), ("b", "hb")] {
        world.store.put_graph_with_hash(name, hash(h)).await;
    }
    world
        .store
        .upsert_agent(DesiredAgentRecord::new(agent("1")).with_spells(["a", "b"]))
        .await;
    completed(&world).await;

    world
        .store
        .upsert_agent(DesiredAgentRecord::new(agent("1")).with_spells(["b"]))
        .await;
    let report = completed(&world).await;

    // "b" moved to position 0, whose cached hash was "ha"
    assert_eq!(report.reloads, 1);
    let (_, spells) = world.orchestrator.worker_hashes(&agent("1")).await.unwrap();
    assert_eq!(spells, vec![Some(hash("hb"))]);

    world
        .store
        .upsert_agent(DesiredAgentRecord::new(agent("1")).with_spells(["b", "a"]))
        .await;
    let report = completed(&world).await;
    assert_eq!(report.reloads, 1);
}

#[tokio::test]
async fn test_root_loads_before_spells() {
    let world = default_world();
    world.store.put_graph_with_hash("root", hash("r")).await;
    world.store.put_graph_with_hash("s", hash("s")).await;
    world
        .store
        .upsert_agent(
            DesiredAgentRecord::new(agent("1"))
                .with_root_spell("root")
                .with_spells(["s"]),
        )
        .await;

    completed(&world).await;

    let slots: Vec<GraphSlot> = world
        .runtime
        .events_for(&agent("1"))
        .into_iter()
        .filter_map(|event| match event {
            RuntimeEvent::Loaded { slot, .. } => Some(slot),
            _ => None,
        })
        .collect();
    assert_eq!(slots, vec![GraphSlot::Root, GraphSlot::Spell(0)]);
}

#[tokio::test]
async fn test_dirty_forces_full_reset() {
    let world = default_world();
    world.store.put_graph_with_hash("root", hash("a")).await;
    world
        .store
        .upsert_agent(DesiredAgentRecord::new(agent("1")).with_root_spell("root"))
        .await;
    completed(&world).await;
    world.runtime.clear_events();

    world
        .store
        .upsert_agent(
            DesiredAgentRecord::new(agent("1"))
                .with_root_spell("root")
                .with_dirty(true),
        )
        .await;
    let report = completed(&world).await;

    assert_eq!(report.recreated, vec![agent("1")]);
    assert!(report.created.is_empty());
    assert!(report.destroyed.is_empty());

    let events = world.runtime.events_for(&agent("1"));
    assert!(matches!(events[0], RuntimeEvent::Stopped { .. }));
    assert!(matches!(events[1], RuntimeEvent::Started { .. }));
    // Fresh worker has no cached hashes, so the unchanged root reloads
    assert!(matches!(events[2], RuntimeEvent::Loaded { slot: GraphSlot::Root, .. }));
    assert_eq!(events.len(), 3);

    assert_eq!(world.store.cleared_dirty(), vec![agent("1")]);
    assert!(!world.store.agent(&agent("1")).await.unwrap().dirty);

    let next = completed(&world).await;
    assert!(next.is_noop());
    assert_eq!(world.store.cleared_dirty().len(), 1);
}

#[tokio::test]
async fn test_dirty_ack_failure_does_not_abort_tick() {
    let world = default_world();
    world.store.upsert_agent(DesiredAgentRecord::new(agent("1"))).await;
    completed(&world).await;

    world
        .store
        .upsert_agent(DesiredAgentRecord::new(agent("1")).with_dirty(true))
        .await;
    world.store.set_clear_dirty_failing(true);

    let report = completed(&world).await;

    assert!(report.snapshot_replaced);
    assert_eq!(report.recreated, vec![agent("1")]);
    assert!(report.failures.is_empty());
    assert!(world.store.agent(&agent("1")).await.unwrap().dirty);
    assert!(world.store.cleared_dirty().is_empty());

    // Flag still set: the next tick resets again and acknowledges
    world.store.set_clear_dirty_failing(false);
    let report = completed(&world).await;

    assert_eq!(report.recreated, vec![agent("1")]);
    assert_eq!(world.store.cleared_dirty(), vec![agent("1")]);
    assert!(!world.store.agent(&agent("1")).await.unwrap().dirty);

    assert!(completed(&world).await.is_noop());
}

#[tokio::test]
async fn test_dirty_new_agent_is_created_once() {
    let world = default_world();
    world
        .store
        .upsert_agent(DesiredAgentRecord::new(agent("1")).with_dirty(true))
        .await;

    let report = completed(&world).await;

    assert_eq!(report.created, vec![agent("1")]);
    assert!(report.recreated.is_empty());
    assert_eq!(world.runtime.events_for(&agent("1")).len(), 1);
    assert_eq!(world.store.cleared_dirty(), vec![agent("1")]);
}

#[tokio::test]
async fn test_dirty_disabled_agent_is_left_alone() {
    let world = default_world();
    world
        .store
        .upsert_agent(
            DesiredAgentRecord::new(agent("1"))
                .with_enabled(false)
                .with_dirty(true),
        )
        .await;

    completed(&world).await;

    assert!(world.store.cleared_dirty().is_empty());
    assert!(world.runtime.events().is_empty());
}

#[tokio::test]
async fn test_removed_agent_releases_port() {
    let world = world(PortRange::new(10, 12));
    world.store.upsert_agent(DesiredAgentRecord::new(agent("1"))).await;
    completed(&world).await;
    assert_eq!(world.orchestrator.available_ports().await, 2);

    world.store.remove_agent(&agent("1")).await;
    let report = completed(&world).await;

    assert_eq!(report.destroyed, vec![agent("1")]);
    assert!(world.orchestrator.list_active_worker_ids().await.is_empty());
    assert_eq!(world.orchestrator.available_ports().await, 3);
    assert!(matches!(
        world.runtime.events().last(),
        Some(RuntimeEvent::Stopped { port: 10, .. })
    ));
}

#[tokio::test]
async fn test_enabled_toggle_converges() {
    let world = default_world();
    world.store.upsert_agent(DesiredAgentRecord::new(agent("1"))).await;
    completed(&world).await;

    world
        .store
        .upsert_agent(DesiredAgentRecord::new(agent("1")).with_enabled(false))
        .await;
    let report = completed(&world).await;
    assert_eq!(report.destroyed, vec![agent("1")]);

    world.store.upsert_agent(DesiredAgentRecord::new(agent("1"))).await;
    let report = completed(&world).await;
    assert_eq!(report.created, vec![agent("1")]);
}

#[tokio::test]
async fn test_pool_exhaustion_is_retried() {
    let world = world(PortRange::new(10, 12));
    for id in ["1", "2", "3", "4"] {
        world.store.upsert_agent(DesiredAgentRecord::new(agent(id))).await;
    }

    let report = completed(&world).await;

    assert_eq!(report.created.len(), 3);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].kind, "pool_exhausted");
    assert_eq!(report.failures[0].agent_id, Some(agent("4")));
    assert_eq!(world.orchestrator.available_ports().await, 0);

    world.store.remove_agent(&agent("2")).await;
    let report = completed(&world).await;

    assert_eq!(report.destroyed, vec![agent("2")]);
    assert_eq!(report.created, vec![agent("4")]);
    assert_eq!(world.orchestrator.worker_port(&agent("4")).await, Some(11));
    assert!(report.failures.is_empty());
}

#[tokio::test]
async fn test_store_outage_is_retried() {
    let world = default_world();
    world.store.upsert_agent(DesiredAgentRecord::new(agent("1"))).await;
    world.store.set_unavailable(true);

    let report = failed(&world).await;
    assert_eq!(report.failures[0].kind, "store_unavailable");
    assert!(world.orchestrator.list_active_worker_ids().await.is_empty());

    world.store.set_unavailable(false);
    let report = completed(&world).await;
    assert_eq!(report.created, vec![agent("1")]);
}

#[tokio::test]
async fn test_graph_load_failure_keeps_worker_and_retries() {
    let world = default_world();
    world.store.put_graph_with_hash("root", hash("a")).await;
    world.store.put_graph_with_hash("s", hash("x")).await;
    world
        .store
        .upsert_agent(
            DesiredAgentRecord::new(agent("1"))
                .with_root_spell("root")
                .with_spells(["s"]),
        )
        .await;
    world.store.upsert_agent(DesiredAgentRecord::new(agent("2")).with_root_spell("root")).await;
    world.runtime.set_graph_failing("root", true);

    let report = failed(&world).await;

    assert!(!report.snapshot_replaced);
    assert_eq!(report.failures.len(), 2);
    assert!(report.failures.iter().all(|f| f.kind == "graph_load_failed"));
    assert_eq!(
        world.orchestrator.list_active_worker_ids().await,
        vec![agent("1"), agent("2")]
    );
    let (root, spells) = world.orchestrator.worker_hashes(&agent("1")).await.unwrap();
    assert_eq!(root, None);
    // Spells wait for the root
    assert!(spells.is_empty());

    world.runtime.set_graph_failing("root", false);
    let report = completed(&world).await;

    assert!(report.created.is_empty());
    assert_eq!(report.reloads, 3);
    let (root, spells) = world.orchestrator.worker_hashes(&agent("1")).await.unwrap();
    assert_eq!(root, Some(hash("a")));
    assert_eq!(spells, vec![Some(hash("x"))]);
}

#[tokio::test]
async fn test_removal_after_failed_tick_still_converges() {
    let world = default_world();
    world.store.put_graph_with_hash("root", hash("a")).await;
    world
        .store
        .upsert_agent(DesiredAgentRecord::new(agent("1")).with_root_spell("root"))
        .await;
    world.runtime.set_graph_failing("root", true);

    // Worker is created, then the tick aborts before the snapshot is replaced
    failed(&world).await;
    assert_eq!(world.orchestrator.list_active_worker_ids().await, vec![agent("1")]);

    world.store.remove_agent(&agent("1")).await;
    let report = completed(&world).await;

    assert_eq!(report.destroyed, vec![agent("1")]);
    assert!(world.orchestrator.list_active_worker_ids().await.is_empty());
    assert_eq!(world.orchestrator.available_ports().await, 10);
}

#[tokio::test]
async fn test_unknown_graph_is_skipped() {
    let world = default_world();
    world
        .store
        .upsert_agent(
            DesiredAgentRecord::new(agent("1"))
                .with_root_spell("missing-root")
                .with_spells(["missing-spell"]),
        )
        .await;

    let report = completed(&world).await;

    assert_eq!(report.created, vec![agent("1")]);
    assert_eq!(report.reloads, 0);
    assert!(report.failures.is_empty());
}

#[tokio::test]
async fn test_worker_start_failure_is_retried() {
    let world = default_world();
    world.store.upsert_agent(DesiredAgentRecord::new(agent("1"))).await;
    world.runtime.set_fail_starts(true);

    let report = completed(&world).await;
    assert_eq!(report.failures[0].kind, "worker_start_failed");
    assert!(world.orchestrator.list_active_worker_ids().await.is_empty());
    assert_eq!(world.orchestrator.available_ports().await, 10);

    world.runtime.set_fail_starts(false);
    let report = completed(&world).await;
    assert_eq!(report.created, vec![agent("1")]);
}

#[tokio::test]
async fn test_graph_hashes_from_definitions() {
    let world = default_world();
    world
        .store
        .put_graph("root", serde_json::json!({"nodes": [{"id": 1, "kind": "speak"}]}))
        .await;
    world
        .store
        .upsert_agent(DesiredAgentRecord::new(agent("1")).with_root_spell("root"))
        .await;
    completed(&world).await;

    // Same content, different key order: no reload
    world
        .store
        .put_graph("root", serde_json::json!({"nodes": [{"kind": "speak", "id": 1}]}))
        .await;
    assert!(completed(&world).await.is_noop());

    let new_hash = world
        .store
        .put_graph("root", serde_json::json!({"nodes": [{"id": 2}]}))
        .await;
    let report = completed(&world).await;
    assert_eq!(report.reloads, 1);
    let (root, _) = world.orchestrator.worker_hashes(&agent("1")).await.unwrap();
    assert_eq!(root, Some(new_hash));
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_tick_is_skipped() {
    let world = default_world();
    world.store.upsert_agent(DesiredAgentRecord::new(agent("1"))).await;
    world.store.set_list_delay(Duration::from_secs(2));

    let (first, second) = tokio::join!(world.orchestrator.tick(), async {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let phase = world.orchestrator.phase();
        (phase, world.orchestrator.tick().await)
    });

    assert!(first.unwrap().is_completed());
    let (phase, second) = second;
    assert_eq!(phase, TickPhase::Fetching);
    assert!(second.unwrap().is_skipped());
    assert_eq!(world.store.list_calls(), 1);
    assert_eq!(world.orchestrator.phase(), TickPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_slow_store_times_out() {
    let store = Arc::new(MemoryStore::new());
    let runtime = Arc::new(MockRuntime::new());
    let orchestrator = Orchestrator::new(
        Arc::clone(&store) as Arc<dyn AgentStore>,
        Arc::clone(&runtime) as Arc<dyn WorkerRuntime>,
        OrchestratorConfig {
            ports: PortRange::new(10, 12),
            operation_timeout: Duration::from_secs(1),
        },
    );
    store.set_list_delay(Duration::from_secs(60));

    let outcome = orchestrator.tick().await.unwrap();

    let TickOutcome::Failed(report) = outcome else {
        panic!("expected failed tick");
    };
    assert!(report.failures[0].message.contains("timed out"));
    assert_eq!(orchestrator.phase(), TickPhase::Idle);
}

#[tokio::test]
async fn test_last_report_tracks_latest_tick() {
    let world = default_world();
    assert!(world.orchestrator.last_report().await.is_none());

    world.store.upsert_agent(DesiredAgentRecord::new(agent("1"))).await;
    let report = completed(&world).await;

    let last = world.orchestrator.last_report().await.unwrap();
    assert_eq!(last.tick_id, report.tick_id);
    assert_eq!(last.created, vec![agent("1")]);
}
