//! Node handler trait, dynamic dispatch wrapper, and handler registry.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use parley_types::{FlowError, HandlerResult, InboundEvent, Result, Scope};

use crate::collaborators::Collaborators;
use crate::graph::{Node, NodeType, ValidFlow};
use crate::handlers::{ActionAdapterHandler, ExtractHandler, GenerateHandler, OutboundHandler};

/// Turn-local scope key holding the inbound event that started the turn.
pub const EVENT_KEY: &str = "event";

// ---------------------------------------------------------------------------
// NodeHandler trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// The node type this handler executes.
    fn node_type(&self) -> NodeType;

    /// Execute a node. `config` is the node config with every template resolved.
    ///
    /// Returned bindings use unqualified field names. Collaborator failures
    /// are reported as `Directive::Error`, not as `Err`.
    async fn handle(&self, node: &Node, config: &Value, scope: &Scope) -> Result<HandlerResult>;
}

// ---------------------------------------------------------------------------
// DynHandler — object-safe wrapper
// ---------------------------------------------------------------------------

pub struct DynHandler(Box<dyn NodeHandler>);

impl DynHandler {
    pub fn new(handler: impl NodeHandler + 'static) -> Self {
        Self(Box::new(handler))
    }

    pub fn node_type(&self) -> NodeType {
        self.0.node_type()
    }

    pub async fn handle(&self, node: &Node, config: &Value, scope: &Scope) -> Result<HandlerResult> {
        self.0.handle(node, config, scope).await
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

/// Static map from node type to handler, filled at startup.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<NodeType, DynHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous handler for the same type.
    pub fn register(&mut self, handler: impl NodeHandler + 'static) {
        self.handlers.insert(handler.node_type(), DynHandler::new(handler));
    }

    pub fn get(&self, node_type: NodeType) -> Option<&DynHandler> {
        self.handlers.get(&node_type)
    }

    pub fn has(&self, node_type: NodeType) -> bool {
        self.handlers.contains_key(&node_type)
    }

    /// Fail with a `Configuration` error if the flow uses a node type with no handler.
    pub fn ensure_supports(&self, flow: &ValidFlow) -> Result<()> {
        let missing: Vec<String> = flow
            .node_types()
            .into_iter()
            .filter(|t| !self.has(*t))
            .map(|t| t.to_string())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(FlowError::Configuration(format!(
                "flow '{}' uses node types with no registered handler: {}",
                flow.id(),
                missing.join(", ")
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Trigger matching
// ---------------------------------------------------------------------------

/// Whether a trigger starts a fresh run for an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerMatch {
    Always,
    /// Case-insensitive containment on the `text` payload field.
    Keywords(Vec<String>),
}

impl TriggerMatch {
    /// `match: "always"` (or absent) or `match: {"keyword": [..]}`.
    pub fn from_node(node: &Node) -> Self {
        let Some(Value::Object(rule)) = node.config.get("match") else {
            return TriggerMatch::Always;
        };
        let keywords = rule.get("keyword").or_else(|| rule.get("keywords"));
        match keywords {
            Some(Value::String(k)) => TriggerMatch::Keywords(vec![k.to_lowercase()]),
            Some(Value::Array(ks)) => TriggerMatch::Keywords(
                ks.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_lowercase)
                    .collect(),
            ),
            _ => TriggerMatch::Always,
        }
    }

    pub fn matches(&self, event: &InboundEvent) -> bool {
        match self {
            TriggerMatch::Always => true,
            TriggerMatch::Keywords(keywords) => {
                let text = event.text().unwrap_or_default().to_lowercase();
                keywords.iter().any(|k| text.contains(k.as_str()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

/// Binds the event payload fields and `eventId` under the trigger's id.
pub struct TriggerHandler;

#[async_trait]
impl NodeHandler for TriggerHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Trigger
    }

    async fn handle(&self, _node: &Node, _config: &Value, scope: &Scope) -> Result<HandlerResult> {
        let mut result = HandlerResult::proceed();
        if let Some(event) = scope.get(EVENT_KEY) {
            if let Some(Value::Object(payload)) = event.get("payload") {
                for (field, value) in payload {
                    result = result.bind(field.clone(), value.clone());
                }
            }
            if let Some(id) = event.get("eventId") {
                result = result.bind("eventId", id.clone());
            }
        }
        Ok(result)
    }
}

/// Pure routing; the engine picks the next edge.
pub struct RouterHandler;

#[async_trait]
impl NodeHandler for RouterHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Router
    }

    async fn handle(&self, _node: &Node, _config: &Value, _scope: &Scope) -> Result<HandlerResult> {
        Ok(HandlerResult::proceed())
    }
}

pub struct TerminalHandler;

#[async_trait]
impl NodeHandler for TerminalHandler {
    fn node_type(&self) -> NodeType {
        NodeType::Terminal
    }

    async fn handle(&self, _node: &Node, config: &Value, _scope: &Scope) -> Result<HandlerResult> {
        let mut result = HandlerResult::terminate();
        if let Some(reason) = config.get("reason") {
            result = result.bind("reason", reason.clone());
        }
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Default registry factory
// ---------------------------------------------------------------------------

/// Registry with a handler for every node type, wired to the given collaborators.
pub fn default_registry(collaborators: &Collaborators) -> HandlerRegistry {
    let mut reg = HandlerRegistry::new();
    reg.register(TriggerHandler);
    reg.register(RouterHandler);
    reg.register(TerminalHandler);
    reg.register(GenerateHandler::new(collaborators.generator.clone()));
    reg.register(ExtractHandler::new(collaborators.extractor.clone()));
    reg.register(ActionAdapterHandler::new(collaborators.adapters.clone()));
    reg.register(OutboundHandler::new(collaborators.delivery.clone()));
    reg
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
