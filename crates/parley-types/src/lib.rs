//! Shared types, errors, variable scope, and conversation state for the Parley
//! flow engine.
//!
//! This crate provides the foundational types used across the other Parley crates:
//! - `FlowError` — unified error taxonomy
//! - `Scope` — turn-local and persisted-global variable bindings
//! - `HandlerResult` — result of executing a node handler
//! - `InboundEvent` — a messaging event addressed to one conversation
//! - `ConversationState` — the persisted, versioned record of one conversation

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unified error type for all Parley subsystems.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    // === Flow definition errors ===
    #[error("Flow configuration invalid: {0}")]
    Configuration(String),

    // === Execution errors ===
    #[error("No outgoing edge matched at node '{node}'")]
    RoutingDeadEnd { node: String },

    #[error("Step budget of {limit} steps exceeded at node '{node}'")]
    StepBudgetExceeded { node: String, limit: usize },

    #[error("Adapter failed on node '{node}' ({code}): {message}")]
    Adapter {
        node: String,
        code: String,
        message: String,
    },

    #[error("Handler '{handler}' failed on node '{node}': {message}")]
    HandlerError {
        handler: String,
        node: String,
        message: String,
    },

    #[error("Turn cancelled at node '{node}'")]
    Cancelled { node: String },

    #[error("Conversation lease expired and was taken over at node '{node}'")]
    LeaseLost { node: String },

    // === Persistence and concurrency errors ===
    #[error("Version conflict for conversation {key}: expected {expected}, found {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("Conversation {key} is busy with another turn")]
    LockBusy { key: String },

    #[error("State store error: {0}")]
    Store(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl FlowError {
    /// Returns `true` if the caller should reload state and retry the whole turn.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FlowError::VersionConflict { .. } | FlowError::LockBusy { .. }
        )
    }

    /// Returns `true` if the error points at a bad graph rather than a transient fault.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowError::Configuration(_)
                | FlowError::RoutingDeadEnd { .. }
                | FlowError::StepBudgetExceeded { .. }
        )
    }

    /// Stable snake_case code, persisted in failure records.
    pub fn code(&self) -> &'static str {
        match self {
            FlowError::Configuration(_) => "configuration",
            FlowError::RoutingDeadEnd { .. } => "routing_dead_end",
            FlowError::StepBudgetExceeded { .. } => "step_budget_exceeded",
            FlowError::Adapter { .. } => "adapter_error",
            FlowError::HandlerError { .. } => "handler_error",
            FlowError::Cancelled { .. } => "cancelled",
            FlowError::LeaseLost { .. } => "lease_lost",
            FlowError::VersionConflict { .. } => "version_conflict",
            FlowError::LockBusy { .. } => "lock_busy",
            FlowError::Store(_) => "store",
            FlowError::Io(_) => "io",
            FlowError::Json(_) => "json",
            FlowError::Other(_) => "other",
        }
    }
}

/// A convenience alias for `Result<T, FlowError>`.
pub type Result<T> = std::result::Result<T, FlowError>;

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

/// Render a scope value the way it appears inside a larger string.
///
/// Strings are verbatim, null is empty, lists and objects are compact JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathSegment {
    Key(String),
    Index(usize),
}

/// Split `a.items[0].name` into key and index segments.
fn split_path(path: &str) -> Option<Vec<PathSegment>> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                } else if !matches!(segments.last(), Some(PathSegment::Index(_))) {
                    return None;
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
                let mut digits = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(d) => digits.push(d),
                        None => return None,
                    }
                }
                let index = digits.trim().parse::<usize>().ok()?;
                segments.push(PathSegment::Index(index));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        segments.push(PathSegment::Key(current));
    }
    if segments.is_empty() {
        None
    } else {
        Some(segments)
    }
}

fn descend<'a>(root: &'a Value, segments: &[PathSegment]) -> Option<&'a Value> {
    let mut current = root;
    for segment in segments {
        current = match (segment, current) {
            (PathSegment::Key(k), Value::Object(map)) => map.get(k)?,
            (PathSegment::Key(k), Value::Array(items)) => items.get(k.parse::<usize>().ok()?)?,
            (PathSegment::Index(i), Value::Array(items)) => items.get(*i)?,
            _ => return None,
        };
    }
    Some(current)
}

// ---------------------------------------------------------------------------
// Scope — turn-local and persisted-global variable bindings
// ---------------------------------------------------------------------------

/// Variable bindings visible while a turn executes.
///
/// Keys are either qualified (`nodeId.field`) or bare global names. Lookups
/// consult the turn-local layer first and fall back to the global layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    turn: BTreeMap<String, Value>,
    global: BTreeMap<String, Value>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a turn on top of previously persisted globals.
    pub fn with_globals(global: BTreeMap<String, Value>) -> Self {
        Self {
            turn: BTreeMap::new(),
            global,
        }
    }

    pub fn set_turn(&mut self, key: impl Into<String>, value: Value) {
        self.turn.insert(key.into(), value);
    }

    pub fn set_global(&mut self, key: impl Into<String>, value: Value) {
        self.global.insert(key.into(), value);
    }

    /// Exact key lookup, turn layer first.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.turn.get(key).or_else(|| self.global.get(key))
    }

    /// Resolve a dotted path with optional array indexes.
    ///
    /// The longest leading run of key segments that names a binding is used as
    /// the root, and the remaining segments descend into it. `ask.values.city`
    /// therefore finds the binding `ask.values` and reads its `city` field.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if let Some(v) = self.get(path) {
            return Some(v);
        }
        let segments = split_path(path)?;
        let key_count = segments
            .iter()
            .take_while(|s| matches!(s, PathSegment::Key(_)))
            .count();

        for n in (1..=key_count).rev() {
            let key = segments[..n]
                .iter()
                .filter_map(|s| match s {
                    PathSegment::Key(k) => Some(k.as_str()),
                    PathSegment::Index(_) => None,
                })
                .collect::<Vec<_>>()
                .join(".");
            if let Some(found) = self.get(&key).and_then(|root| descend(root, &segments[n..])) {
                return Some(found);
            }
        }
        None
    }

    pub fn contains(&self, path: &str) -> bool {
        self.lookup(path).is_some()
    }

    pub fn turn(&self) -> &BTreeMap<String, Value> {
        &self.turn
    }

    pub fn globals(&self) -> &BTreeMap<String, Value> {
        &self.global
    }

    pub fn clear_turn(&mut self) {
        self.turn.clear();
    }

    /// Merged view: globals overlaid by turn-local bindings.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        let mut merged = self.global.clone();
        merged.extend(self.turn.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    pub fn into_globals(self) -> BTreeMap<String, Value> {
        self.global
    }
}

// ---------------------------------------------------------------------------
// HandlerResult — result of executing a node handler
// ---------------------------------------------------------------------------

/// What the step loop does after a handler returns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "directive", content = "reason", rename_all = "snake_case")]
pub enum Directive {
    Continue,
    AwaitInput,
    Terminate,
    Error(String),
}

/// Bindings are unqualified field names; the engine prefixes them with the node id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerResult {
    pub bindings: BTreeMap<String, Value>,
    pub directive: Directive,
}

impl HandlerResult {
    /// Continue with no bindings.
    pub fn proceed() -> Self {
        Self {
            bindings: BTreeMap::new(),
            directive: Directive::Continue,
        }
    }

    pub fn await_input() -> Self {
        Self {
            bindings: BTreeMap::new(),
            directive: Directive::AwaitInput,
        }
    }

    pub fn terminate() -> Self {
        Self {
            bindings: BTreeMap::new(),
            directive: Directive::Terminate,
        }
    }

    /// An adapter-level failure. The `error` binding carries code and message
    /// and is only merged when the node declares an `on-error` edge.
    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let mut bindings = BTreeMap::new();
        bindings.insert(
            "error".to_string(),
            serde_json::json!({ "code": code.clone(), "message": message.into() }),
        );
        Self {
            bindings,
            directive: Directive::Error(code),
        }
    }

    pub fn bind(mut self, field: impl Into<String>, value: Value) -> Self {
        self.bindings.insert(field.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// InboundEvent / ConversationKey
// ---------------------------------------------------------------------------

/// Identifies one conversation: a single end user of a single tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationKey {
    pub tenant_id: String,
    pub end_user_id: String,
}

impl ConversationKey {
    pub fn new(tenant_id: impl Into<String>, end_user_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            end_user_id: end_user_id.into(),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant_id, self.end_user_id)
    }
}

/// An event delivered by a messaging-channel collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    pub tenant_id: String,
    pub end_user_id: String,
    pub event_id: String,
    #[serde(default, alias = "payloadFields")]
    pub payload: serde_json::Map<String, Value>,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl InboundEvent {
    pub fn new(
        tenant_id: impl Into<String>,
        end_user_id: impl Into<String>,
        event_id: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            end_user_id: end_user_id.into(),
            event_id: event_id.into(),
            payload: serde_json::Map::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    /// Convenience for the common `text` payload field.
    pub fn text(&self) -> Option<&str> {
        self.payload.get("text").and_then(Value::as_str)
    }

    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(&self.tenant_id, &self.end_user_id)
    }
}

// ---------------------------------------------------------------------------
// ConversationState — persisted per-conversation record
// ---------------------------------------------------------------------------

/// Where the next turn picks up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "node", rename_all = "snake_case")]
pub enum Cursor {
    /// Start at the trigger.
    Start,
    /// Execute this node first.
    Execute(String),
    /// This node already ran; pick its outgoing edge with the new turn's scope.
    RouteFrom(String),
}

impl Cursor {
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Cursor::Start => None,
            Cursor::Execute(id) | Cursor::RouteFrom(id) => Some(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Idle,
    Running,
    AwaitingInput,
    Failed,
    Terminated,
}

/// Classification of a failed turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    RoutingDeadEnd,
    StepBudgetExceeded { limit: usize },
    Adapter { code: String },
    Handler { handler: String },
    Cancelled,
    LeaseLost,
}

impl FailureKind {
    /// Map an execution error to a failure kind. Errors that do not end a
    /// turn in the Failed state (storage, concurrency, configuration) map to `None`.
    pub fn from_error(err: &FlowError) -> Option<Self> {
        match err {
            FlowError::RoutingDeadEnd { .. } => Some(FailureKind::RoutingDeadEnd),
            FlowError::StepBudgetExceeded { limit, .. } => {
                Some(FailureKind::StepBudgetExceeded { limit: *limit })
            }
            FlowError::Adapter { code, .. } => Some(FailureKind::Adapter { code: code.clone() }),
            FlowError::HandlerError { handler, .. } => Some(FailureKind::Handler {
                handler: handler.clone(),
            }),
            FlowError::Cancelled { .. } => Some(FailureKind::Cancelled),
            FlowError::LeaseLost { .. } => Some(FailureKind::LeaseLost),
            _ => None,
        }
    }
}

/// Everything needed to diagnose a failed turn without replaying traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub node_id: String,
    #[serde(flatten)]
    pub kind: FailureKind,
    pub reason: String,
    pub scope: BTreeMap<String, Value>,
    pub failed_at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(
        node_id: impl Into<String>,
        kind: FailureKind,
        reason: impl Into<String>,
        scope: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            kind,
            reason: reason.into(),
            scope,
            failed_at: Utc::now(),
        }
    }

    /// Rebuild the error this record was created from.
    pub fn to_error(&self) -> FlowError {
        let node = self.node_id.clone();
        match &self.kind {
            FailureKind::RoutingDeadEnd => FlowError::RoutingDeadEnd { node },
            FailureKind::StepBudgetExceeded { limit } => FlowError::StepBudgetExceeded {
                node,
                limit: *limit,
            },
            FailureKind::Adapter { code } => FlowError::Adapter {
                node,
                code: code.clone(),
                message: self.reason.clone(),
            },
            FailureKind::Handler { handler } => FlowError::HandlerError {
                handler: handler.clone(),
                node,
                message: self.reason.clone(),
            },
            FailureKind::Cancelled => FlowError::Cancelled { node },
            FailureKind::LeaseLost => FlowError::LeaseLost { node },
        }
    }
}

/// The persisted execution cursor and global bindings of one conversation.
///
/// `version` counts successful saves; a record that was never saved has
/// version 0. Stores reject a save whose expected version differs from the
/// stored one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationState {
    pub tenant_id: String,
    pub end_user_id: String,
    pub flow_id: String,
    pub flow_version: u64,
    pub cursor: Cursor,
    pub status: ConversationStatus,
    #[serde(default)]
    pub globals: BTreeMap<String, Value>,
    pub version: u64,
    #[serde(default)]
    pub recent_event_ids: VecDeque<String>,
    #[serde(default)]
    pub failure: Option<FailureRecord>,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(key: &ConversationKey, flow_id: impl Into<String>, flow_version: u64) -> Self {
        let now = Utc::now();
        Self {
            tenant_id: key.tenant_id.clone(),
            end_user_id: key.end_user_id.clone(),
            flow_id: flow_id.into(),
            flow_version,
            cursor: Cursor::Start,
            status: ConversationStatus::Idle,
            globals: BTreeMap::new(),
            version: 0,
            recent_event_ids: VecDeque::new(),
            failure: None,
            started_at: now,
            last_updated: now,
        }
    }

    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(&self.tenant_id, &self.end_user_id)
    }

    pub fn has_seen(&self, event_id: &str) -> bool {
        self.recent_event_ids.iter().any(|id| id == event_id)
    }

    /// Remember an event id, keeping at most `window` of the newest ids.
    pub fn record_event(&mut self, event_id: impl Into<String>, window: usize) {
        self.recent_event_ids.push_back(event_id.into());
        while self.recent_event_ids.len() > window.max(1) {
            self.recent_event_ids.pop_front();
        }
    }

    /// Failed and Terminated records never resume; the next event starts over.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            ConversationStatus::Failed | ConversationStatus::Terminated
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // --- FlowError ---

    #[test]
    fn error_display_routing_dead_end() {
        let err = FlowError::RoutingDeadEnd {
            node: "menu".into(),
        };
        assert_eq!(err.to_string(), "No outgoing edge matched at node 'menu'");
    }

    #[test]
    fn error_display_step_budget() {
        let err = FlowError::StepBudgetExceeded {
            node: "loop_a".into(),
            limit: 10,
        };
        assert_eq!(
            err.to_string(),
            "Step budget of 10 steps exceeded at node 'loop_a'"
        );
    }

    #[test]
    fn error_display_adapter() {
        let err = FlowError::Adapter {
            node: "pay".into(),
            code: "timeout".into(),
            message: "no answer after 10000ms".into(),
        };
        assert_eq!(
            err.to_string(),
            "Adapter failed on node 'pay' (timeout): no answer after 10000ms"
        );
    }

    #[test]
    fn error_display_version_conflict() {
        let err = FlowError::VersionConflict {
            key: "acme/5491100".into(),
            expected: 3,
            actual: 4,
        };
        assert_eq!(
            err.to_string(),
            "Version conflict for conversation acme/5491100: expected 3, found 4"
        );
    }

    #[test]
    fn retryable_only_for_concurrency_errors() {
        assert!(FlowError::LockBusy { key: "k".into() }.is_retryable());
        assert!(FlowError::VersionConflict {
            key: "k".into(),
            expected: 1,
            actual: 2
        }
        .is_retryable());
        assert!(!FlowError::RoutingDeadEnd { node: "n".into() }.is_retryable());
        assert!(!FlowError::Configuration("bad".into()).is_retryable());
    }

    #[test]
    fn terminal_for_graph_errors() {
        assert!(FlowError::Configuration("bad".into()).is_terminal());
        assert!(FlowError::RoutingDeadEnd { node: "n".into() }.is_terminal());
        assert!(FlowError::StepBudgetExceeded {
            node: "n".into(),
            limit: 5
        }
        .is_terminal());
        assert!(!FlowError::Adapter {
            node: "n".into(),
            code: "x".into(),
            message: "y".into()
        }
        .is_terminal());
    }

    #[test]
    fn lease_lost_round_trips_through_failure_record() {
        let err = FlowError::LeaseLost { node: "pay".into() };
        assert_eq!(err.code(), "lease_lost");
        assert!(!err.is_retryable());

        let kind = FailureKind::from_error(&err).unwrap();
        assert_eq!(kind, FailureKind::LeaseLost);
        let record = FailureRecord::new("pay", kind, err.to_string(), BTreeMap::new());
        assert!(matches!(record.to_error(), FlowError::LeaseLost { node } if node == "pay"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<Value>("not json").unwrap_err();
        let err: FlowError = json_err.into();
        assert!(matches!(err, FlowError::Json(_)));
        assert_eq!(err.code(), "json");
    }

    // --- stringify ---

    #[test]
    fn stringify_scalars_and_containers() {
        assert_eq!(stringify(&json!("hola")), "hola");
        assert_eq!(stringify(&json!(42)), "42");
        assert_eq!(stringify(&json!(true)), "true");
        assert_eq!(stringify(&Value::Null), "");
        assert_eq!(stringify(&json!([1, 2])), "[1,2]");
    }

    // --- Scope ---

    #[test]
    fn turn_layer_shadows_global() {
        let mut scope = Scope::new();
        scope.set_global("city", json!("Rosario"));
        scope.set_turn("city", json!("Córdoba"));
        assert_eq!(scope.get("city"), Some(&json!("Córdoba")));

        scope.clear_turn();
        assert_eq!(scope.get("city"), Some(&json!("Rosario")));
    }

    #[test]
    fn lookup_descends_from_longest_matching_key() {
        let mut scope = Scope::new();
        scope.set_turn("ask.values", json!({ "city": "Salta", "tags": ["a", "b"] }));
        assert_eq!(scope.lookup("ask.values.city"), Some(&json!("Salta")));
        assert_eq!(scope.lookup("ask.values.tags[1]"), Some(&json!("b")));
        assert_eq!(scope.lookup("ask.values.tags.0"), Some(&json!("a")));
        assert_eq!(scope.lookup("ask.values.missing"), None);
    }

    #[test]
    fn lookup_exact_qualified_key() {
        let mut scope = Scope::new();
        scope.set_global("greet.text", json!("hi"));
        assert_eq!(scope.lookup("greet.text"), Some(&json!("hi")));
        assert!(scope.contains("greet.text"));
        assert!(!scope.contains("greet.other"));
    }

    #[test]
    fn lookup_rejects_malformed_paths() {
        let mut scope = Scope::new();
        scope.set_turn("items", json!([1, 2, 3]));
        assert_eq!(scope.lookup("items[1]"), Some(&json!(2)));
        assert_eq!(scope.lookup("items[x]"), None);
        assert_eq!(scope.lookup("items[1"), None);
        assert_eq!(scope.lookup("a..b"), None);
    }

    #[test]
    fn lookup_present_null_is_found() {
        let mut scope = Scope::new();
        scope.set_turn("x", Value::Null);
        assert!(scope.contains("x"));
    }

    #[test]
    fn snapshot_overlays_turn_on_global() {
        let mut scope = Scope::with_globals(BTreeMap::from([
            ("a".to_string(), json!(1)),
            ("b".to_string(), json!(2)),
        ]));
        scope.set_turn("b", json!(20));
        scope.set_turn("c", json!(30));
        let snap = scope.snapshot();
        assert_eq!(snap.get("a"), Some(&json!(1)));
        assert_eq!(snap.get("b"), Some(&json!(20)));
        assert_eq!(snap.get("c"), Some(&json!(30)));
        assert_eq!(scope.into_globals().len(), 2);
    }

    // --- HandlerResult ---

    #[test]
    fn failed_result_carries_error_binding() {
        let result = HandlerResult::failed("timeout", "gave up");
        assert_eq!(result.directive, Directive::Error("timeout".into()));
        assert_eq!(
            result.bindings.get("error"),
            Some(&json!({ "code": "timeout", "message": "gave up" }))
        );
    }

    #[test]
    fn directive_serializes_with_reason() {
        let json = serde_json::to_value(Directive::Error("boom".into())).unwrap();
        assert_eq!(json, json!({ "directive": "error", "reason": "boom" }));
        let json = serde_json::to_value(Directive::AwaitInput).unwrap();
        assert_eq!(json, json!({ "directive": "await_input" }));
    }

    // --- InboundEvent ---

    #[test]
    fn inbound_event_deserializes_payload_fields_alias() {
        let event: InboundEvent = serde_json::from_value(json!({
            "tenantId": "acme",
            "endUserId": "u1",
            "eventId": "wamid.1",
            "payloadFields": { "text": "hola" }
        }))
        .unwrap();
        assert_eq!(event.text(), Some("hola"));
        assert_eq!(event.key().to_string(), "acme/u1");
    }

    // --- ConversationState ---

    fn sample_state() -> ConversationState {
        let mut state = ConversationState::new(&ConversationKey::new("acme", "u1"), "sales", 3);
        state.cursor = Cursor::RouteFrom("ask_city".into());
        state.status = ConversationStatus::AwaitingInput;
        state.globals.insert("extract.values".into(), json!({ "city": "Salta" }));
        state.globals.insert("name".into(), json!("Ana"));
        state.version = 7;
        state.record_event("e1", 8);
        state
    }

    #[test]
    fn state_serialization_round_trip() {
        let state = sample_state();
        let json = serde_json::to_string(&state).unwrap();
        let restored: ConversationState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
        assert_eq!(restored.cursor, Cursor::RouteFrom("ask_city".into()));
    }

    #[test]
    fn cursor_serializes_with_mode() {
        assert_eq!(
            serde_json::to_value(Cursor::Execute("n1".into())).unwrap(),
            json!({ "mode": "execute", "node": "n1" })
        );
        assert_eq!(
            serde_json::to_value(Cursor::Start).unwrap(),
            json!({ "mode": "start" })
        );
    }

    #[test]
    fn record_event_keeps_window() {
        let mut state = sample_state();
        for i in 0..10 {
            state.record_event(format!("id{i}"), 3);
        }
        assert_eq!(state.recent_event_ids.len(), 3);
        assert!(state.has_seen("id9"));
        assert!(!state.has_seen("id6"));
    }

    #[test]
    fn failure_record_rebuilds_error() {
        let err = FlowError::Adapter {
            node: "pay".into(),
            code: "timeout".into(),
            message: "slow".into(),
        };
        let kind = FailureKind::from_error(&err).unwrap();
        let record = FailureRecord::new("pay", kind, "slow", BTreeMap::new());
        match record.to_error() {
            FlowError::Adapter { node, code, message } => {
                assert_eq!(node, "pay");
                assert_eq!(code, "timeout");
                assert_eq!(message, "slow");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(FailureKind::from_error(&FlowError::Store("x".into())).is_none());
    }

    #[test]
    fn failure_record_serializes_flat_kind() {
        let record = FailureRecord::new(
            "loop",
            FailureKind::StepBudgetExceeded { limit: 10 },
            "cycle",
            BTreeMap::new(),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "step_budget_exceeded");
        assert_eq!(json["limit"], 10);
        assert_eq!(json["nodeId"], "loop");
    }
}
