//! Flow definitions as authored, and the validated, immutable [`ValidFlow`]
//! the engine executes.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use parley_types::{FlowError, Result};

use crate::condition::{parse_guard, Guard};

/// Reserved source handle marking an adapter error edge.
pub const ON_ERROR: &str = "on-error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    Trigger,
    Router,
    LlmGenerate,
    LlmExtract,
    ActionAdapter,
    OutboundMessage,
    Terminal,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Trigger => "trigger",
            NodeType::Router => "router",
            NodeType::LlmGenerate => "llm-generate",
            NodeType::LlmExtract => "llm-extract",
            NodeType::ActionAdapter => "action-adapter",
            NodeType::OutboundMessage => "outbound-message",
            NodeType::Terminal => "terminal",
        }
    }

    /// Node types that call an external collaborator and may fail with an adapter error.
    pub fn calls_collaborator(self) -> bool {
        matches!(
            self,
            NodeType::LlmGenerate
                | NodeType::LlmExtract
                | NodeType::ActionAdapter
                | NodeType::OutboundMessage
        )
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    #[serde(default = "empty_object")]
    pub config: Value,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Node {
    pub fn new(id: impl Into<String>, node_type: NodeType, config: Value) -> Self {
        Self {
            id: id.into(),
            node_type,
            config,
        }
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    /// Declared route identifiers of a router, in order.
    ///
    /// Accepts `["a", "b"]` or `[{"id": "a", ...}, ...]`.
    pub fn routes(&self) -> Vec<String> {
        self.config
            .get("routes")
            .and_then(Value::as_array)
            .map(|routes| {
                routes
                    .iter()
                    .filter_map(|r| match r {
                        Value::String(s) => Some(s.clone()),
                        Value::Object(o) => o.get("id").and_then(Value::as_str).map(String::from),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Per-node override of the adapter timeout (`timeoutMs`).
    pub fn timeout(&self) -> Option<Duration> {
        self.config
            .get("timeoutMs")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
    }

    /// Node executed on the next inbound event after an outbound message suspends.
    pub fn resume_at(&self) -> Option<&str> {
        self.config_str("resumeAt")
    }

    /// Global key a binding is persisted under, if the node marks it persistent.
    ///
    /// `persist: true` and `persist: ["field"]` keep the qualified key
    /// `nodeId.field`; `persist: {"field": "name"}` stores under the bare name.
    pub fn persisted_key(&self, field: &str) -> Option<String> {
        match self.config.get("persist")? {
            Value::Bool(true) => Some(qualify(&self.id, field)),
            Value::Array(fields) => fields
                .iter()
                .any(|f| f.as_str() == Some(field))
                .then(|| qualify(&self.id, field)),
            Value::Object(renames) => renames.get(field).and_then(Value::as_str).map(String::from),
            _ => None,
        }
    }
}

/// `nodeId.field`
pub fn qualify(node_id: &str, field: &str) -> String {
    format!("{node_id}.{field}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    #[serde(default)]
    pub id: String,
    #[serde(alias = "sourceNodeId")]
    pub source: String,
    #[serde(default)]
    pub source_handle: Option<String>,
    #[serde(alias = "targetNodeId")]
    pub target: String,
    #[serde(default, alias = "condition")]
    pub guard: Option<String>,
}

impl Edge {
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            source_handle: None,
            target: target.into(),
            guard: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }

    pub fn with_guard(mut self, guard: impl Into<String>) -> Self {
        self.guard = Some(guard.into());
        self
    }

    pub fn is_on_error(&self) -> bool {
        self.source_handle.as_deref() == Some(ON_ERROR)
    }

    /// True when the edge has no guard, or a blank one.
    pub fn is_unconditional(&self) -> bool {
        self.guard.as_deref().map_or(true, |g| g.trim().is_empty())
    }
}

/// A tenant-authored flow, as stored. Not yet validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowDefinition {
    pub id: String,
    pub tenant_id: String,
    #[serde(default = "first_version")]
    pub version: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub priority: i64,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

fn first_version() -> u64 {
    1
}

impl FlowDefinition {
    /// Parse a flow from JSON. Edges without an id get `edge-<n>`.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut flow: FlowDefinition = serde_json::from_str(json)?;
        for (i, edge) in flow.edges.iter_mut().enumerate() {
            if edge.id.is_empty() {
                edge.id = format!("edge-{i}");
            }
        }
        Ok(flow)
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn triggers(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.node_type == NodeType::Trigger)
    }

    /// Outgoing edges of a node in declaration order, including `on-error` edges.
    pub fn edges_from<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.source == node_id)
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

// ---------------------------------------------------------------------------
// ValidFlow
// ---------------------------------------------------------------------------

/// An outgoing edge with its pre-parsed guard.
#[derive(Debug, Clone)]
pub struct Route {
    pub edge: Edge,
    /// `None` for an unconditional edge.
    pub guard: Option<Guard>,
}

/// A flow that passed validation. Immutable; shared between conversations.
#[derive(Debug, Clone)]
pub struct ValidFlow {
    definition: FlowDefinition,
    index: HashMap<String, usize>,
    trigger: usize,
    routes: HashMap<String, Vec<Route>>,
    on_error: HashMap<String, Edge>,
}

impl ValidFlow {
    /// Build the execution view of a flow whose lint diagnostics carry no errors.
    pub(crate) fn from_checked(definition: FlowDefinition) -> Result<Self> {
        let index: HashMap<String, usize> = definition
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        let trigger = definition
            .nodes
            .iter()
            .position(|n| n.node_type == NodeType::Trigger)
            .ok_or_else(|| {
                FlowError::Configuration(format!("flow '{}' has no trigger", definition.id))
            })?;

        let mut routes: HashMap<String, Vec<Route>> = HashMap::new();
        let mut on_error = HashMap::new();

        for node in &definition.nodes {
            let outgoing: Vec<&Edge> = definition.edges_from(&node.id).collect();
            if let Some(edge) = outgoing.iter().find(|e| e.is_on_error()) {
                on_error.insert(node.id.clone(), (*edge).clone());
            }

            // Routers follow declared route order; everything else declaration order.
            let ordered: Vec<&Edge> = if node.node_type == NodeType::Router {
                node.routes()
                    .iter()
                    .filter_map(|route| {
                        outgoing
                            .iter()
                            .find(|e| e.source_handle.as_deref() == Some(route.as_str()))
                            .copied()
                    })
                    .collect()
            } else {
                outgoing.into_iter().filter(|e| !e.is_on_error()).collect()
            };

            let mut node_routes = Vec::with_capacity(ordered.len());
            for edge in ordered {
                let guard = match edge.guard.as_deref() {
                    Some(g) if !g.trim().is_empty() => Some(parse_guard(g)?),
                    _ => None,
                };
                node_routes.push(Route {
                    edge: edge.clone(),
                    guard,
                });
            }
            routes.insert(node.id.clone(), node_routes);
        }

        Ok(Self {
            definition,
            index,
            trigger,
            routes,
            on_error,
        })
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    pub fn tenant_id(&self) -> &str {
        &self.definition.tenant_id
    }

    pub fn version(&self) -> u64 {
        self.definition.version
    }

    pub fn definition(&self) -> &FlowDefinition {
        &self.definition
    }

    pub fn trigger(&self) -> &Node {
        &self.definition.nodes[self.trigger]
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.index.get(id).map(|&i| &self.definition.nodes[i])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.definition.nodes.iter()
    }

    /// Normal outgoing edges, in route order for routers and declaration order otherwise.
    pub fn routes(&self, node_id: &str) -> &[Route] {
        self.routes.get(node_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn on_error(&self, node_id: &str) -> Option<&Edge> {
        self.on_error.get(node_id)
    }

    pub fn node_types(&self) -> BTreeSet<NodeType> {
        self.definition.nodes.iter().map(|n| n.node_type).collect()
    }
}
