//! Conversation turn execution: the core step loop.
//!
//! One inbound event drives one turn: take the conversation lease, load the
//! state, decide between resuming and starting fresh, walk the graph until a
//! node suspends, terminates or fails, persist, release.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use parley_types::{
    stringify, ConversationKey, ConversationState, ConversationStatus, Cursor, Directive,
    FailureKind, FailureRecord, FlowError, HandlerResult, InboundEvent, Result, Scope,
};

use crate::collaborators::{AdapterFailure, FlowSource};
use crate::config::{EngineConfig, VersionPolicy};
use crate::dedup::{Deduplicator, RecentEvents};
use crate::edge_selection::select_edge;
use crate::events::{EngineEvent, EventEmitter};
use crate::graph::{qualify, FlowDefinition, Node, NodeType, ValidFlow};
use crate::handler::{HandlerRegistry, TriggerMatch, EVENT_KEY};
use crate::lock::{LeaseGuard, LeaseTable};
use crate::store::StateStore;
use crate::template::resolve_value;
use crate::validation::validate;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    AwaitingInput,
    Terminated,
    Failed,
    /// The event id was already processed; nothing changed.
    Duplicate,
    /// The trigger did not match the event; no state was created.
    Ignored,
}

/// A `{{path}}` token that did not resolve while preparing a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingVariable {
    pub node_id: String,
    pub path: String,
}

/// The result of handling one inbound event.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub status: TurnStatus,
    /// Non-trigger nodes executed.
    pub steps: usize,
    pub visited: Vec<String>,
    /// Scope snapshot at the end of the turn, globals overlaid by turn-local values.
    pub bindings: BTreeMap<String, Value>,
    pub diagnostics: Vec<MissingVariable>,
    pub failure: Option<FailureRecord>,
    /// Stored version after the turn, if the turn saved.
    pub state_version: Option<u64>,
}

impl TurnOutcome {
    fn skipped(status: TurnStatus) -> Self {
        Self {
            status,
            steps: 0,
            visited: Vec::new(),
            bindings: BTreeMap::new(),
            diagnostics: Vec::new(),
            failure: None,
            state_version: None,
        }
    }

    /// Turn a failed outcome into the error that failed it.
    pub fn into_result(self) -> Result<Self> {
        match &self.failure {
            Some(record) if self.status == TurnStatus::Failed => Err(record.to_error()),
            _ => Ok(self),
        }
    }
}

// ---------------------------------------------------------------------------
// Turn internals
// ---------------------------------------------------------------------------

/// Where the step loop stopped.
enum Halt {
    Suspend { node: String, cursor: Cursor },
    Terminate { node: String },
    Fail { node: String, error: FlowError },
}

impl Halt {
    fn fail(node: &str, error: FlowError) -> Self {
        Halt::Fail {
            node: node.to_string(),
            error,
        }
    }
}

enum Plan {
    Resume { flow: Arc<ValidFlow>, state: ConversationState },
    Fresh { flow: Arc<ValidFlow>, state: ConversationState },
    Ignored,
}

/// Mutable bookkeeping of one running turn.
struct TurnRun {
    conversation: String,
    state: ConversationState,
    scope: Scope,
    steps: usize,
    visited: Vec<String>,
    diagnostics: Vec<MissingVariable>,
}

impl TurnRun {
    /// Merge a node's bindings: turn-local always, global only where the node
    /// config marks the field persistent.
    fn merge(&mut self, node: &Node, bindings: BTreeMap<String, Value>) {
        for (field, value) in bindings {
            if let Some(global) = node.persisted_key(&field) {
                self.scope.set_global(global, value.clone());
            }
            self.scope.set_turn(qualify(&node.id, &field), value);
        }
    }
}

fn directive_label(directive: &Directive) -> &'static str {
    match directive {
        Directive::Continue => "continue",
        Directive::AwaitInput => "await_input",
        Directive::Terminate => "terminate",
        Directive::Error(_) => "error",
    }
}

/// Message persisted in a failure record; `FailureRecord::to_error` reads it back.
fn failure_reason(error: &FlowError) -> String {
    match error {
        FlowError::Adapter { message, .. } | FlowError::HandlerError { message, .. } => {
            message.clone()
        }
        other => other.to_string(),
    }
}

/// Seed the turn-local layer from the inbound event.
fn seed_scope(globals: BTreeMap<String, Value>, event: &InboundEvent) -> Scope {
    let mut scope = Scope::with_globals(globals);
    for (field, value) in &event.payload {
        scope.set_turn(field.clone(), value.clone());
    }
    scope.set_turn("eventId", Value::String(event.event_id.clone()));
    scope.set_turn(
        EVENT_KEY,
        json!({
            "tenantId": event.tenant_id,
            "endUserId": event.end_user_id,
            "eventId": event.event_id,
            "payload": event.payload,
            "receivedAt": event.received_at.to_rfc3339(),
        }),
    );
    scope
}

type FlowCacheKey = (String, String, u64);

/// Validated versions kept per (tenant, flow id). Older versions still load
/// on demand, they are just validated again.
const CACHED_VERSIONS_PER_FLOW: usize = 4;

/// Drop all but the newest cached versions of one flow.
fn evict_old_versions(flows: &mut HashMap<FlowCacheKey, Arc<ValidFlow>>, tenant_id: &str, flow_id: &str) {
    let mut versions: Vec<u64> = flows
        .keys()
        .filter(|(tenant, id, _)| tenant == tenant_id && id == flow_id)
        .map(|(_, _, version)| *version)
        .collect();
    if versions.len() <= CACHED_VERSIONS_PER_FLOW {
        return;
    }
    versions.sort_unstable_by(|a, b| b.cmp(a));
    for version in &versions[CACHED_VERSIONS_PER_FLOW..] {
        flows.remove(&(tenant_id.to_string(), flow_id.to_string(), *version));
    }
}

// ---------------------------------------------------------------------------
// FlowEngine
// ---------------------------------------------------------------------------

/// Executes conversation turns. Share it behind an `Arc`; distinct
/// conversations run in parallel, turns of one conversation are serialized.
pub struct FlowEngine {
    source: Arc<dyn FlowSource>,
    store: Arc<dyn StateStore>,
    registry: HandlerRegistry,
    config: EngineConfig,
    emitter: EventEmitter,
    dedup: Arc<dyn Deduplicator>,
    leases: LeaseTable,
    flows: RwLock<HashMap<FlowCacheKey, Arc<ValidFlow>>>,
}

impl FlowEngine {
    pub fn new(
        source: Arc<dyn FlowSource>,
        store: Arc<dyn StateStore>,
        registry: HandlerRegistry,
        config: EngineConfig,
    ) -> Self {
        Self {
            source,
            store,
            registry,
            dedup: Arc::new(RecentEvents::new(config.dedup_window)),
            leases: LeaseTable::new(config.lock_ttl),
            emitter: EventEmitter::default(),
            flows: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_dedup(mut self, dedup: Arc<dyn Deduplicator>) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    /// Number of validated flow versions currently cached.
    pub fn cached_flows(&self) -> usize {
        self.flows.read().len()
    }

    pub async fn handle_event(&self, event: InboundEvent) -> Result<TurnOutcome> {
        self.handle_event_with_cancel(event, CancellationToken::new()).await
    }

    /// Handle one inbound event. Cancelling `cancel` stops the turn between
    /// steps or while a handler is in flight and persists it as Failed.
    ///
    /// Routing, budget, adapter and handler failures are persisted and come
    /// back as a `Failed` outcome; use [`TurnOutcome::into_result`] to get
    /// them as errors. Configuration, storage and concurrency errors return
    /// `Err` and leave the stored state untouched.
    pub async fn handle_event_with_cancel(
        &self,
        event: InboundEvent,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome> {
        let key = event.key();
        let lease = self.leases.acquire(&key, self.config.lock_wait).await?;

        let stored = self.store.load(&key).await?;
        let seen = stored.as_ref().is_some_and(|s| s.has_seen(&event.event_id));
        if seen || self.dedup.seen(&key, &event.event_id).await {
            tracing::info!(conversation = %key, event_id = %event.event_id, "Duplicate event ignored");
            self.emitter.emit(EngineEvent::DuplicateIgnored {
                conversation: key.to_string(),
                event_id: event.event_id.clone(),
            });
            return Ok(TurnOutcome::skipped(TurnStatus::Duplicate));
        }

        let (flow, state, resumed) = match self.plan_turn(&key, &event, stored).await? {
            Plan::Resume { flow, state } => (flow, state, true),
            Plan::Fresh { flow, state } => (flow, state, false),
            Plan::Ignored => {
                tracing::debug!(conversation = %key, "Trigger did not match event");
                return Ok(TurnOutcome::skipped(TurnStatus::Ignored));
            }
        };

        tracing::info!(
            conversation = %key,
            flow = %flow.id(),
            version = flow.version(),
            event_id = %event.event_id,
            resumed,
            "Turn started"
        );
        self.emitter.emit(EngineEvent::TurnStarted {
            conversation: key.to_string(),
            event_id: event.event_id.clone(),
            flow_id: flow.id().to_string(),
            flow_version: flow.version(),
            resumed,
        });

        let entry = if resumed {
            state.cursor.clone()
        } else {
            Cursor::Execute(flow.trigger().id.clone())
        };
        let mut run = TurnRun {
            conversation: key.to_string(),
            scope: seed_scope(state.globals.clone(), &event),
            state,
            steps: 0,
            visited: Vec::new(),
            diagnostics: Vec::new(),
        };
        run.state.status = ConversationStatus::Running;

        let halt = self.run_steps(&flow, &mut run, entry, &lease, &cancel).await?;
        self.finish(&key, &event, run, halt).await
    }

    /// Archive a conversation so its next event starts fresh.
    pub async fn reset(&self, tenant_id: &str, end_user_id: &str) -> Result<()> {
        let key = ConversationKey::new(tenant_id, end_user_id);
        let _lease = self.leases.acquire(&key, self.config.lock_wait).await?;
        self.store.archive(&key).await?;
        tracing::info!(conversation = %key, "Conversation reset");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Planning
    // -----------------------------------------------------------------------

    async fn plan_turn(
        &self,
        key: &ConversationKey,
        event: &InboundEvent,
        stored: Option<ConversationState>,
    ) -> Result<Plan> {
        let active = self.source.load_validated(&key.tenant_id).await?;

        let stored_version = stored.as_ref().map_or(0, |s| s.version);
        let recent_ids = stored
            .as_ref()
            .map(|s| s.recent_event_ids.clone())
            .unwrap_or_default();

        if let Some(state) = stored.filter(|s| !s.is_finished() && s.cursor != Cursor::Start) {
            if let Some(flow) = self.flow_for_resume(&state, active.as_ref()).await? {
                return Ok(Plan::Resume { flow, state });
            }
            tracing::info!(
                conversation = %key,
                flow = %state.flow_id,
                version = state.flow_version,
                "Flow version changed, restarting conversation"
            );
        }

        let definition = active.ok_or_else(|| {
            FlowError::Configuration(format!("tenant '{}' has no active flow", key.tenant_id))
        })?;
        let flow = self.compile(definition)?;
        if !TriggerMatch::from_node(flow.trigger()).matches(event) {
            return Ok(Plan::Ignored);
        }

        let mut state = ConversationState::new(key, flow.id(), flow.version());
        state.version = stored_version;
        state.recent_event_ids = recent_ids;
        Ok(Plan::Fresh { flow, state })
    }

    /// The flow an in-flight conversation continues on, if any.
    async fn flow_for_resume(
        &self,
        state: &ConversationState,
        active: Option<&FlowDefinition>,
    ) -> Result<Option<Arc<ValidFlow>>> {
        if let Some(def) = active {
            if def.id == state.flow_id && def.version == state.flow_version {
                return self.compile(def.clone()).map(Some);
            }
        }
        if self.config.version_policy == VersionPolicy::Pin {
            let pinned = self
                .source
                .load_version(&state.tenant_id, &state.flow_id, state.flow_version)
                .await?;
            if let Some(def) = pinned {
                return self.compile(def).map(Some);
            }
        }
        Ok(None)
    }

    /// Validate a flow version once and cache the result.
    fn compile(&self, definition: FlowDefinition) -> Result<Arc<ValidFlow>> {
        let cache_key = (
            definition.tenant_id.clone(),
            definition.id.clone(),
            definition.version,
        );
        if let Some(flow) = self.flows.read().get(&cache_key) {
            return Ok(flow.clone());
        }

        let flow = validate(&definition)?;
        self.registry.ensure_supports(&flow)?;
        let flow = Arc::new(flow);
        tracing::debug!(flow = %flow.id(), version = flow.version(), "Flow validated");
        let mut flows = self.flows.write();
        flows.insert(cache_key, flow.clone());
        evict_old_versions(&mut flows, flow.tenant_id(), flow.id());
        Ok(flow)
    }

    // -----------------------------------------------------------------------
    // Step loop
    // -----------------------------------------------------------------------

    async fn run_steps(
        &self,
        flow: &ValidFlow,
        run: &mut TurnRun,
        entry: Cursor,
        lease: &LeaseGuard,
        cancel: &CancellationToken,
    ) -> Result<Halt> {
        let renew_every = (self.leases.ttl() / 3).max(Duration::from_millis(1));

        let mut current = match entry {
            Cursor::Start => flow.trigger().id.clone(),
            Cursor::Execute(id) => id,
            Cursor::RouteFrom(id) => match self.follow(flow, run, &id) {
                Ok(next) => next,
                Err(error) => return Ok(Halt::fail(&id, error)),
            },
        };

        loop {
            if cancel.is_cancelled() {
                return Ok(Halt::fail(&current, FlowError::Cancelled { node: current.clone() }));
            }
            if !lease.renew() {
                return Ok(self.lease_lost(run, &current));
            }

            let node = flow.node(&current).ok_or_else(|| {
                FlowError::Configuration(format!(
                    "node '{current}' is not part of flow '{}' v{}",
                    flow.id(),
                    flow.version()
                ))
            })?;

            // Only the trigger that opens the turn is free; re-entering it counts.
            let opens_turn = node.node_type == NodeType::Trigger && run.visited.is_empty();
            if !opens_turn {
                if run.steps >= self.config.max_steps_per_turn {
                    let error = FlowError::StepBudgetExceeded {
                        node: node.id.clone(),
                        limit: self.config.max_steps_per_turn,
                    };
                    return Ok(Halt::fail(&node.id, error));
                }
                run.steps += 1;
            }
            run.visited.push(node.id.clone());

            let handler = self.registry.get(node.node_type).ok_or_else(|| {
                FlowError::Configuration(format!("no handler registered for '{}'", node.node_type))
            })?;

            let resolution = resolve_value(&node.config, &run.scope);
            for path in resolution.missing {
                tracing::debug!(node = %node.id, path = %path, "Template variable missing");
                self.emitter.emit(EngineEvent::VariableMissing {
                    conversation: run.conversation.clone(),
                    node_id: node.id.clone(),
                    path: path.clone(),
                });
                run.diagnostics.push(MissingVariable {
                    node_id: node.id.clone(),
                    path,
                });
            }

            self.emitter.emit(EngineEvent::StepStarted {
                conversation: run.conversation.clone(),
                node_id: node.id.clone(),
                node_type: node.node_type.to_string(),
            });
            let started = Instant::now();
            let limit = node.timeout().unwrap_or(self.config.adapter_timeout);

            // Keep the lease alive while the handler is in flight.
            let invocation = {
                let call = tokio::time::timeout(limit, handler.handle(node, &resolution.value, &run.scope));
                tokio::pin!(call);
                let mut heartbeat = tokio::time::interval(renew_every);
                heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Ok(Halt::fail(&node.id, FlowError::Cancelled { node: node.id.clone() }));
                        }
                        outcome = &mut call => {
                            break match outcome {
                                Ok(result) => result,
                                Err(_) => {
                                    let failure = AdapterFailure::timeout(limit);
                                    Ok(HandlerResult::failed(failure.code, failure.message))
                                }
                            };
                        }
                        _ = heartbeat.tick() => {
                            if !lease.renew() {
                                return Ok(self.lease_lost(run, &node.id));
                            }
                        }
                    }
                }
            };
            let mut result = match invocation {
                Ok(result) => result,
                Err(error) if FailureKind::from_error(&error).is_some() => {
                    return Ok(Halt::fail(&node.id, error));
                }
                Err(error) => return Err(error),
            };

            self.emitter.emit(EngineEvent::StepCompleted {
                conversation: run.conversation.clone(),
                node_id: node.id.clone(),
                directive: directive_label(&result.directive).to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
            });

            match result.directive.clone() {
                Directive::Continue => {
                    run.merge(node, result.bindings);
                    current = match self.follow(flow, run, &node.id) {
                        Ok(next) => next,
                        Err(error) => return Ok(Halt::fail(&node.id, error)),
                    };
                    if self.config.persist_every_step {
                        self.checkpoint(run, Cursor::Execute(current.clone())).await?;
                    }
                }
                Directive::AwaitInput => {
                    run.merge(node, result.bindings);
                    let cursor = match node.resume_at() {
                        Some(target) => Cursor::Execute(target.to_string()),
                        None => Cursor::RouteFrom(node.id.clone()),
                    };
                    return Ok(Halt::Suspend {
                        node: node.id.clone(),
                        cursor,
                    });
                }
                Directive::Terminate => {
                    run.merge(node, result.bindings);
                    return Ok(Halt::Terminate {
                        node: node.id.clone(),
                    });
                }
                Directive::Error(code) => {
                    let error_binding = result.bindings.remove("error");
                    let message = error_binding
                        .as_ref()
                        .and_then(|e| e.get("message"))
                        .map(stringify)
                        .unwrap_or_default();

                    let Some(edge) = flow.on_error(&node.id) else {
                        let error = FlowError::Adapter {
                            node: node.id.clone(),
                            code,
                            message,
                        };
                        return Ok(Halt::fail(&node.id, error));
                    };

                    tracing::warn!(
                        node = %node.id,
                        code = %code,
                        target = %edge.target,
                        "Collaborator failed, following on-error edge"
                    );
                    if let Some(value) = error_binding {
                        run.merge(node, BTreeMap::from([("error".to_string(), value)]));
                    }
                    self.emitter.emit(EngineEvent::EdgeSelected {
                        conversation: run.conversation.clone(),
                        from_node: node.id.clone(),
                        to_node: edge.target.clone(),
                        edge_id: edge.id.clone(),
                    });
                    current = edge.target.clone();
                }
            }
        }
    }

    fn lease_lost(&self, run: &TurnRun, node_id: &str) -> Halt {
        tracing::warn!(
            conversation = %run.conversation,
            node = %node_id,
            "Lease expired and was taken over, stopping turn"
        );
        Halt::fail(node_id, FlowError::LeaseLost { node: node_id.to_string() })
    }

    /// Pick the outgoing edge of `node_id` and return its target.
    fn follow(&self, flow: &ValidFlow, run: &TurnRun, node_id: &str) -> Result<String> {
        let edge = select_edge(flow, node_id, &run.scope)?;
        tracing::debug!(from = %node_id, to = %edge.target, edge = %edge.id, "Edge selected");
        self.emitter.emit(EngineEvent::EdgeSelected {
            conversation: run.conversation.clone(),
            from_node: node_id.to_string(),
            to_node: edge.target.clone(),
            edge_id: edge.id.clone(),
        });
        Ok(edge.target.clone())
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    async fn save(&self, run: &mut TurnRun) -> Result<u64> {
        let version = self.store.save(&run.state, run.state.version).await?;
        run.state.version = version;
        self.emitter.emit(EngineEvent::StateSaved {
            conversation: run.conversation.clone(),
            version,
        });
        Ok(version)
    }

    async fn checkpoint(&self, run: &mut TurnRun, cursor: Cursor) -> Result<()> {
        run.state.cursor = cursor;
        run.state.status = ConversationStatus::Running;
        run.state.globals = run.scope.globals().clone();
        self.save(run).await?;
        Ok(())
    }

    async fn finish(
        &self,
        key: &ConversationKey,
        event: &InboundEvent,
        mut run: TurnRun,
        halt: Halt,
    ) -> Result<TurnOutcome> {
        run.state.globals = run.scope.globals().clone();
        run.state.record_event(event.event_id.clone(), self.config.dedup_window);

        let (status, failure) = match halt {
            Halt::Suspend { node, cursor } => {
                run.state.cursor = cursor;
                run.state.status = ConversationStatus::AwaitingInput;
                run.state.failure = None;
                self.save(&mut run).await?;
                tracing::info!(conversation = %key, node = %node, steps = run.steps, "Turn suspended");
                self.emitter.emit(EngineEvent::TurnSuspended {
                    conversation: run.conversation.clone(),
                    node_id: node,
                    steps: run.steps,
                });
                (TurnStatus::AwaitingInput, None)
            }
            Halt::Terminate { node } => {
                run.state.cursor = Cursor::Execute(node.clone());
                run.state.status = ConversationStatus::Terminated;
                run.state.failure = None;
                self.save(&mut run).await?;
                self.store.archive(key).await?;
                tracing::info!(conversation = %key, node = %node, steps = run.steps, "Conversation terminated");
                self.emitter.emit(EngineEvent::TurnTerminated {
                    conversation: run.conversation.clone(),
                    node_id: node,
                    steps: run.steps,
                });
                (TurnStatus::Terminated, None)
            }
            Halt::Fail { node, error } => {
                let kind = FailureKind::from_error(&error).unwrap_or(FailureKind::Handler {
                    handler: "engine".into(),
                });
                let record = FailureRecord::new(&node, kind, failure_reason(&error), run.scope.snapshot());
                run.state.cursor = Cursor::Execute(node.clone());
                run.state.status = ConversationStatus::Failed;
                run.state.failure = Some(record.clone());
                self.save(&mut run).await?;
                tracing::warn!(conversation = %key, node = %node, error = %error, "Turn failed");
                self.emitter.emit(EngineEvent::TurnFailed {
                    conversation: run.conversation.clone(),
                    node_id: node,
                    error: error.to_string(),
                });
                (TurnStatus::Failed, Some(record))
            }
        };

        self.dedup.record(key, &event.event_id).await;

        Ok(TurnOutcome {
            status,
            steps: run.steps,
            visited: run.visited,
            bindings: run.scope.snapshot(),
            diagnostics: run.diagnostics,
            failure,
            state_version: Some(run.state.version),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
