//! End-to-end integration tests for the Parley flow engine.
//!
//! Each test exercises whole turns: load flow -> validate -> run the step loop
//! against recording collaborators -> persist -> verify.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use parley_engine::{
    default_registry, lint, validate, Collaborators, EchoGenerator, EngineConfig, FileStateStore,
    FlowDefinition, FlowEngine, InMemoryFlowSource, KeywordExtractor, MemoryStateStore, NoDedup,
    RecordingDelivery, Severity, StateStore, StaticAdapter, StaticExtractor, TurnStatus,
};
use parley_types::{
    ConversationKey, ConversationState, ConversationStatus, Cursor, FlowError, InboundEvent,
    Result,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn flow(json: Value) -> FlowDefinition {
    FlowDefinition::from_json(&json.to_string()).expect("flow JSON should parse")
}

fn event(id: &str, text: &str) -> InboundEvent {
    InboundEvent::new("shoes", "5491100", id).with_field("text", json!(text))
}

fn key() -> ConversationKey {
    ConversationKey::new("shoes", "5491100")
}

fn engine_with(
    definition: FlowDefinition,
    store: Arc<dyn StateStore>,
    collaborators: Collaborators,
    config: EngineConfig,
) -> FlowEngine {
    let source = Arc::new(InMemoryFlowSource::new().with_flow(definition));
    FlowEngine::new(source, store, default_registry(&collaborators), config)
}

fn echo_collaborators(delivery: Arc<RecordingDelivery>) -> Collaborators {
    Collaborators::new(Arc::new(EchoGenerator), Arc::new(KeywordExtractor), delivery)
}

fn greeting_flow() -> FlowDefinition {
    flow(json!({
        "id": "greet", "tenantId": "shoes", "version": 1,
        "nodes": [
            { "id": "start", "type": "trigger" },
            { "id": "hello", "type": "outbound-message", "config": { "text": "Hola!" } },
            { "id": "end", "type": "terminal" }
        ],
        "edges": [
            { "source": "start", "target": "hello" },
            { "source": "hello", "target": "end" }
        ]
    }))
}

/// Trigger -> slow catalog search -> outbound -> terminal.
fn slow_search_flow() -> FlowDefinition {
    flow(json!({
        "id": "search", "tenantId": "shoes",
        "nodes": [
            { "id": "start", "type": "trigger" },
            { "id": "search", "type": "action-adapter", "config": { "adapter": "catalog", "action": "search" } },
            { "id": "say", "type": "outbound-message", "config": { "text": "Listo" } },
            { "id": "end", "type": "terminal" }
        ],
        "edges": [
            { "source": "start", "target": "search" },
            { "source": "search", "target": "say" },
            { "source": "say", "target": "end" }
        ]
    }))
}

/// Shoe store slot filling: extract size and color until complete, search,
/// offer, finish.
fn slot_filling_flow() -> FlowDefinition {
    flow(json!({
        "id": "sales", "tenantId": "shoes", "version": 3, "name": "Ventas",
        "nodes": [
            { "id": "start", "type": "trigger" },
            { "id": "collect", "type": "llm-extract", "config": {
                "persist": ["values"],
                "schema": [
                    { "name": "size", "type": "number", "required": true },
                    { "name": "color", "required": true, "noPreference": ["me da igual"] },
                    { "name": "brand", "required": false }
                ]
            } },
            { "id": "check", "type": "router", "config": { "routes": ["ready", "more"] } },
            { "id": "ask", "type": "outbound-message", "config": {
                "text": "Me falta saber: {{collect.missingFields}}",
                "resumeAt": "collect"
            } },
            { "id": "search", "type": "action-adapter", "config": {
                "adapter": "catalog",
                "action": "search",
                "params": { "size": "{{collect.size}}", "color": "{{collect.color}}" }
            } },
            { "id": "offer", "type": "outbound-message", "config": { "text": "Tenemos {{search.result.name}} talle {{collect.size}}" } },
            { "id": "end", "type": "terminal", "config": { "reason": "offer_sent" } }
        ],
        "edges": [
            { "source": "start", "target": "collect" },
            { "source": "collect", "target": "check" },
            { "source": "check", "sourceHandle": "ready", "target": "search", "guard": "{{collect.complete}} equals true" },
            { "source": "check", "sourceHandle": "more", "target": "ask", "guard": "true" },
            { "source": "search", "target": "offer" },
            { "source": "offer", "target": "end" }
        ]
    }))
}

// ---------------------------------------------------------------------------
// Test 1: Multi-turn slot filling with a "no preference" answer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn slot_filling_across_turns() {
    let delivery = Arc::new(RecordingDelivery::new());
    let extractor = Arc::new(StaticExtractor::new(vec![
        json!({ "size": "42" }),
        json!({ "color": "me da igual" }),
        json!({}),
    ]));
    let catalog = Arc::new(StaticAdapter::new(json!({ "name": "Runner X" })));
    let collaborators = Collaborators::new(Arc::new(EchoGenerator), extractor.clone(), delivery.clone())
        .with_adapter("catalog", catalog.clone());
    let store = Arc::new(MemoryStateStore::new());
    let engine = engine_with(slot_filling_flow(), store.clone(), collaborators, EngineConfig::default());

    // Turn 1: size known, color still missing.
    let first = engine.handle_event(event("e1", "busco zapatillas talle 42")).await.unwrap();
    assert_eq!(first.status, TurnStatus::AwaitingInput);
    assert_eq!(first.visited, vec!["start", "collect", "check", "ask"]);
    assert_eq!(first.bindings["collect.missingFields"], json!(["color"]));
    assert_eq!(delivery.texts()[0], r#"Me falta saber: ["color"]"#);

    let state = store.load(&key()).await.unwrap().unwrap();
    assert_eq!(state.cursor, Cursor::Execute("collect".into()));
    assert_eq!(state.globals["collect.values"], json!({ "size": 42 }));

    // Turn 2: "me da igual" resolves color; the search runs with typed params.
    let second = engine.handle_event(event("e2", "me da igual")).await.unwrap();
    assert_eq!(second.status, TurnStatus::AwaitingInput);
    assert_eq!(second.visited, vec!["collect", "check", "search", "offer"]);
    assert_eq!(second.bindings["collect.complete"], json!(true));
    assert_eq!(second.bindings["collect.noPreferenceFields"], json!(["color"]));
    assert_eq!(
        catalog.calls(),
        vec![("search".to_string(), json!({ "size": 42, "color": "me da igual" }))]
    );
    assert_eq!(delivery.texts()[1], "Tenemos Runner X talle 42");

    // The extractor saw the value known from the first turn.
    let requests = extractor.requests();
    assert_eq!(requests[1].known, json!({ "size": 42 }).as_object().cloned().unwrap());
    assert_eq!(requests[1].input, "me da igual");

    // Turn 3: any reply finishes the conversation.
    let third = engine.handle_event(event("e3", "gracias")).await.unwrap();
    assert_eq!(third.status, TurnStatus::Terminated);
    assert_eq!(third.bindings["end.reason"], json!("offer_sent"));
    assert!(store.load(&key()).await.unwrap().is_none());
    assert_eq!(store.archived(&key()).len(), 1);
}

// ---------------------------------------------------------------------------
// Test 2: Optional field answered with "no preference" is complete
// ---------------------------------------------------------------------------

#[tokio::test]
async fn optional_no_preference_field_is_complete() {
    let definition = flow(json!({
        "id": "books", "tenantId": "shoes",
        "nodes": [
            { "id": "start", "type": "trigger" },
            { "id": "prefs", "type": "llm-extract", "config": {
                "schema": [ { "name": "editorial", "required": false, "noPreference": ["no preference"] } ]
            } },
            { "id": "done", "type": "terminal" }
        ],
        "edges": [
            { "source": "start", "target": "prefs" },
            { "source": "prefs", "target": "done" }
        ]
    }));
    let delivery = Arc::new(RecordingDelivery::new());
    let engine = engine_with(
        definition,
        Arc::new(MemoryStateStore::new()),
        echo_collaborators(delivery),
        EngineConfig::default(),
    );

    let outcome = engine.handle_event(event("e1", "no preference")).await.unwrap();
    assert_eq!(outcome.status, TurnStatus::Terminated);
    assert_eq!(outcome.bindings["prefs.complete"], json!(true));
    assert_eq!(outcome.bindings["prefs.missingFields"], json!([]));
    assert_eq!(outcome.bindings["prefs.editorial"], json!("no preference"));
}

// ---------------------------------------------------------------------------
// Test 3: State persisted to disk resumes in a new engine instance
// ---------------------------------------------------------------------------

#[tokio::test]
async fn file_store_resumes_across_engines() {
    let dir = tempfile::tempdir().unwrap();

    let delivery = Arc::new(RecordingDelivery::new());
    let first = engine_with(
        greeting_flow(),
        Arc::new(FileStateStore::new(dir.path())),
        echo_collaborators(delivery.clone()),
        EngineConfig::default(),
    );
    let outcome = first.handle_event(event("e1", "hola")).await.unwrap();
    assert_eq!(outcome.status, TurnStatus::AwaitingInput);

    let store = Arc::new(FileStateStore::new(dir.path()));
    let saved = store.load(&key()).await.unwrap().unwrap();
    assert_eq!(saved.cursor, Cursor::RouteFrom("hello".into()));
    assert_eq!(saved.status, ConversationStatus::AwaitingInput);

    let second = engine_with(
        greeting_flow(),
        store.clone(),
        echo_collaborators(delivery.clone()),
        EngineConfig::default(),
    );
    let outcome = second.handle_event(event("e2", "chau")).await.unwrap();
    assert_eq!(outcome.status, TurnStatus::Terminated);
    assert!(store.load(&key()).await.unwrap().is_none());
    assert!(dir.path().join("archive").join("shoes").exists());
    assert_eq!(delivery.texts(), vec!["Hola!"]);
}

// ---------------------------------------------------------------------------
// Test 4: Replays after archive are caught by the dedup hook
// ---------------------------------------------------------------------------

#[tokio::test]
async fn replay_after_termination_is_duplicate() {
    let delivery = Arc::new(RecordingDelivery::new());
    let engine = engine_with(
        greeting_flow(),
        Arc::new(MemoryStateStore::new()),
        echo_collaborators(delivery.clone()),
        EngineConfig::default(),
    );
    engine.handle_event(event("e1", "hola")).await.unwrap();
    engine.handle_event(event("e2", "chau")).await.unwrap();

    let replay = engine.handle_event(event("e2", "chau")).await.unwrap();
    assert_eq!(replay.status, TurnStatus::Duplicate);
    assert_eq!(delivery.sent().len(), 1);
}

#[tokio::test]
async fn without_dedup_hook_replay_after_archive_starts_over() {
    let delivery = Arc::new(RecordingDelivery::new());
    let engine = engine_with(
        greeting_flow(),
        Arc::new(MemoryStateStore::new()),
        echo_collaborators(delivery.clone()),
        EngineConfig::default(),
    )
    .with_dedup(Arc::new(NoDedup));
    engine.handle_event(event("e1", "hola")).await.unwrap();

    // Within a live conversation the stored window still dedups.
    let replay = engine.handle_event(event("e1", "hola")).await.unwrap();
    assert_eq!(replay.status, TurnStatus::Duplicate);

    engine.handle_event(event("e2", "chau")).await.unwrap();
    let replay = engine.handle_event(event("e2", "chau")).await.unwrap();
    assert_eq!(replay.status, TurnStatus::AwaitingInput);
    assert_eq!(delivery.sent().len(), 2);
}

// ---------------------------------------------------------------------------
// Test 5: Events for one conversation are serialized
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_events_for_one_key_queue() {
    let delivery = Arc::new(RecordingDelivery::new());
    let catalog = Arc::new(StaticAdapter::new(json!([])).with_delay(Duration::from_millis(200)));
    let store = Arc::new(MemoryStateStore::new());
    let engine = Arc::new(engine_with(
        slow_search_flow(),
        store.clone(),
        echo_collaborators(delivery.clone()).with_adapter("catalog", catalog),
        EngineConfig::default(),
    ));

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.handle_event(event("e1", "hola")).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    let second = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.handle_event(event("e2", "gracias")).await })
    };

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.status, TurnStatus::AwaitingInput);
    // The second event resumed from the state the first one saved.
    assert_eq!(second.status, TurnStatus::Terminated);
    assert_eq!(second.visited, vec!["end"]);
}

#[tokio::test]
async fn lock_wait_elapses_with_lock_busy() {
    let catalog = Arc::new(StaticAdapter::new(json!([])).with_delay(Duration::from_millis(300)));
    let engine = Arc::new(engine_with(
        slow_search_flow(),
        Arc::new(MemoryStateStore::new()),
        echo_collaborators(Arc::new(RecordingDelivery::new())).with_adapter("catalog", catalog),
        EngineConfig {
            lock_wait: Duration::from_millis(20),
            ..EngineConfig::default()
        },
    ));

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.handle_event(event("e1", "hola")).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let err = engine.handle_event(event("e2", "hola?")).await.unwrap_err();
    assert!(matches!(err, FlowError::LockBusy { .. }));
    assert!(err.is_retryable());

    assert_eq!(first.await.unwrap().unwrap().status, TurnStatus::AwaitingInput);
}

#[tokio::test]
async fn turn_longer_than_lease_ttl_keeps_the_key() {
    // The search node overrides the adapter timeout and outlives several TTLs.
    let definition = flow(json!({
        "id": "search", "tenantId": "shoes",
        "nodes": [
            { "id": "start", "type": "trigger" },
            { "id": "search", "type": "action-adapter", "config": { "adapter": "catalog", "action": "search", "timeoutMs": 1000 } },
            { "id": "say", "type": "outbound-message", "config": { "text": "hi {{text}}" } },
            { "id": "end", "type": "terminal" }
        ],
        "edges": [
            { "source": "start", "target": "search" },
            { "source": "search", "target": "say" },
            { "source": "say", "target": "end" }
        ]
    }));
    let config = EngineConfig::from_json(
        r#"{ "lockTtl": "50ms", "lockWait": "2s", "adapterTimeout": "40ms" }"#,
    )
    .unwrap();
    let delivery = Arc::new(RecordingDelivery::new());
    let catalog = Arc::new(StaticAdapter::new(json!([])).with_delay(Duration::from_millis(200)));
    let engine = Arc::new(engine_with(
        definition,
        Arc::new(MemoryStateStore::new()),
        echo_collaborators(delivery.clone()).with_adapter("catalog", catalog.clone()),
        config,
    ));

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.handle_event(event("e1", "one")).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.handle_event(event("e2", "two")).await })
    };

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(engine.leases().is_held(&key()));

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.status, TurnStatus::AwaitingInput);
    // The second event waited and resumed instead of running its own loop.
    assert_eq!(second.status, TurnStatus::Terminated);
    assert_eq!(second.visited, vec!["end"]);
    assert_eq!(delivery.texts(), vec!["hi one"]);
    assert_eq!(catalog.calls().len(), 1);
}

#[tokio::test]
async fn distinct_conversations_run_in_parallel() {
    let catalog = Arc::new(StaticAdapter::new(json!([])).with_delay(Duration::from_millis(150)));
    let engine = Arc::new(engine_with(
        slow_search_flow(),
        Arc::new(MemoryStateStore::new()),
        echo_collaborators(Arc::new(RecordingDelivery::new())).with_adapter("catalog", catalog),
        EngineConfig {
            lock_wait: Duration::from_millis(10),
            ..EngineConfig::default()
        },
    ));

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let ev = InboundEvent::new("shoes", format!("user-{i}"), format!("e{i}"))
                    .with_field("text", json!("hola"));
                engine.handle_event(ev).await
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().status, TurnStatus::AwaitingInput);
    }
}

// ---------------------------------------------------------------------------
// Test 6: A concurrent writer makes the save fail with VersionConflict
// ---------------------------------------------------------------------------

/// Delegates to a memory store; when armed, another writer saves first.
struct RacingStore {
    inner: MemoryStateStore,
    armed: Mutex<bool>,
}

#[async_trait]
impl StateStore for RacingStore {
    async fn load(&self, key: &ConversationKey) -> Result<Option<ConversationState>> {
        self.inner.load(key).await
    }

    async fn save(&self, state: &ConversationState, expected_version: u64) -> Result<u64> {
        let race = std::mem::take(&mut *self.armed.lock());
        if race {
            if let Some(current) = self.inner.load(&state.key()).await? {
                self.inner.save(&current, current.version).await?;
            }
        }
        self.inner.save(state, expected_version).await
    }

    async fn archive(&self, key: &ConversationKey) -> Result<()> {
        self.inner.archive(key).await
    }
}

#[tokio::test]
async fn version_conflict_is_retryable() {
    let store = Arc::new(RacingStore {
        inner: MemoryStateStore::new(),
        armed: Mutex::new(false),
    });
    let engine = engine_with(
        greeting_flow(),
        store.clone(),
        echo_collaborators(Arc::new(RecordingDelivery::new())),
        EngineConfig::default(),
    );
    engine.handle_event(event("e1", "hola")).await.unwrap();

    *store.armed.lock() = true;
    let err = engine.handle_event(event("e2", "chau")).await.unwrap_err();
    match &err {
        FlowError::VersionConflict { expected, actual, .. } => {
            assert_eq!(*expected, 1);
            assert_eq!(*actual, 2);
        }
        other => panic!("Expected VersionConflict, got: {other:?}"),
    }
    assert!(err.is_retryable());

    // Reload and retry the whole turn.
    let retried = engine.handle_event(event("e2", "chau")).await.unwrap();
    assert_eq!(retried.status, TurnStatus::Terminated);
}

// ---------------------------------------------------------------------------
// Test 7: Failed turn keeps a diagnosable record
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_record_carries_node_scope_and_reason() {
    let definition = flow(json!({
        "id": "menu", "tenantId": "shoes",
        "nodes": [
            { "id": "start", "type": "trigger" },
            { "id": "menu", "type": "router", "config": { "routes": ["x"] } },
            { "id": "x", "type": "terminal" }
        ],
        "edges": [
            { "source": "start", "target": "menu" },
            { "source": "menu", "sourceHandle": "x", "target": "x", "guard": "{{choice}} exists" }
        ]
    }));
    let store = Arc::new(MemoryStateStore::new());
    let engine = engine_with(
        definition,
        store.clone(),
        echo_collaborators(Arc::new(RecordingDelivery::new())),
        EngineConfig::default(),
    );

    let outcome = engine.handle_event(event("e1", "hola")).await.unwrap();
    assert_eq!(outcome.status, TurnStatus::Failed);
    assert!(matches!(
        outcome.into_result(),
        Err(FlowError::RoutingDeadEnd { ref node }) if node == "menu"
    ));

    let state = store.load(&key()).await.unwrap().unwrap();
    let failure = state.failure.unwrap();
    assert_eq!(failure.node_id, "menu");
    assert_eq!(failure.scope["start.text"], json!("hola"));
    assert!(failure.reason.contains("menu"));
    assert!(failure.to_error().is_terminal());
}

// ---------------------------------------------------------------------------
// Test 8: Lint reports every structural defect
// ---------------------------------------------------------------------------

#[test]
fn lint_reports_structural_defects() {
    let definition = flow(json!({
        "id": "bad", "tenantId": "shoes",
        "nodes": [
            { "id": "a", "type": "trigger" },
            { "id": "b", "type": "trigger" },
            { "id": "menu", "type": "router", "config": { "routes": ["yes", "no"] } },
            { "id": "end", "type": "terminal" }
        ],
        "edges": [
            { "source": "a", "target": "menu" },
            { "source": "menu", "sourceHandle": "yes", "target": "end" },
            { "source": "menu", "sourceHandle": "yes", "target": "ghost" }
        ]
    }));
    let errors: Vec<String> = lint(&definition)
        .into_iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.rule)
        .collect();

    assert!(errors.contains(&"trigger_count".to_string()), "{errors:?}");
    assert!(errors.contains(&"edge_endpoints".to_string()), "{errors:?}");
    assert!(errors.contains(&"router_routes".to_string()), "{errors:?}");
    assert!(validate(&definition).is_err());

    assert!(validate(&slot_filling_flow()).is_ok());
}
