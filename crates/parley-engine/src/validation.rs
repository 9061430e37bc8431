//! Flow validation: lint rules and diagnostics.
//!
//! Each rule inspects a raw [`FlowDefinition`] and reports [`Diagnostic`]s.
//! Call [`lint`] for the full advisory list or [`validate`] to obtain a
//! [`ValidFlow`], which fails with a `Configuration` error naming every
//! error-severity diagnostic.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use parley_types::{FlowError, Result};

use crate::condition::parse_guard;
use crate::graph::{FlowDefinition, NodeType, ValidFlow, ON_ERROR};
use crate::handlers::extract::ExtractionSchema;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub edge_id: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => f.write_str("ERROR"),
            Severity::Warning => f.write_str("WARN"),
            Severity::Info => f.write_str("INFO"),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.rule, self.message)
    }
}

impl Diagnostic {
    fn error(rule: &str, message: String) -> Self {
        Self {
            rule: rule.into(),
            severity: Severity::Error,
            message,
            node_id: None,
            edge_id: None,
            fix: None,
        }
    }

    fn warning(rule: &str, message: String) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(rule, message)
        }
    }

    fn node(mut self, id: &str) -> Self {
        self.node_id = Some(id.to_string());
        self
    }

    fn edge(mut self, id: &str) -> Self {
        self.edge_id = Some(id.to_string());
        self
    }

    fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct TriggerCountRule;
impl LintRule for TriggerCountRule {
    fn name(&self) -> &str { "trigger_count" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        let triggers: Vec<_> = flow.triggers().map(|n| n.id.as_str()).collect();
        match triggers.len() {
            1 => vec![],
            0 => vec![Diagnostic::error(self.name(), "Flow has no trigger node".into())
                .fix("Add exactly one node with type \"trigger\"")],
            n => vec![Diagnostic::error(
                self.name(),
                format!("Flow has {n} trigger nodes: {}; expected exactly one", triggers.join(", ")),
            )
            .fix("Remove extra trigger nodes so only one remains")],
        }
    }
}

struct UniqueIdsRule;
impl LintRule for UniqueIdsRule {
    fn name(&self) -> &str { "unique_ids" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        let mut seen = HashSet::new();
        for node in &flow.nodes {
            if !seen.insert(node.id.as_str()) {
                diags.push(
                    Diagnostic::error(self.name(), format!("Duplicate node id '{}'", node.id))
                        .node(&node.id),
                );
            }
        }
        let mut seen = HashSet::new();
        for edge in &flow.edges {
            if !seen.insert(edge.id.as_str()) {
                diags.push(
                    Diagnostic::error(self.name(), format!("Duplicate edge id '{}'", edge.id))
                        .edge(&edge.id),
                );
            }
        }
        diags
    }
}

struct EdgeEndpointsRule;
impl LintRule for EdgeEndpointsRule {
    fn name(&self) -> &str { "edge_endpoints" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for edge in &flow.edges {
            for (end, id) in [("source", &edge.source), ("target", &edge.target)] {
                if flow.node(id).is_none() {
                    diags.push(
                        Diagnostic::error(
                            self.name(),
                            format!("Edge '{}' references non-existent {end} '{id}'", edge.id),
                        )
                        .edge(&edge.id)
                        .fix(format!("Add node '{id}' or fix the edge {end}")),
                    );
                }
            }
        }
        diags
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str { "reachability" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        let mut triggers = flow.triggers();
        let start = match (triggers.next(), triggers.next()) {
            (Some(n), None) => n.id.clone(),
            _ => return vec![], // TriggerCountRule reports this
        };

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(start.clone());
        queue.push_back(start);

        while let Some(current) = queue.pop_front() {
            for edge in flow.edges_from(&current) {
                if visited.insert(edge.target.clone()) {
                    queue.push_back(edge.target.clone());
                }
            }
            // A suspended outbound message resumes at its resumeAt node.
            if let Some(target) = flow.node(&current).and_then(|n| n.resume_at()) {
                if visited.insert(target.to_string()) {
                    queue.push_back(target.to_string());
                }
            }
        }

        flow.nodes
            .iter()
            .filter(|n| !visited.contains(&n.id))
            .map(|n| {
                Diagnostic::error(
                    self.name(),
                    format!("Node '{}' is not reachable from the trigger", n.id),
                )
                .node(&n.id)
                .fix(format!("Add an edge leading to '{}' or remove it", n.id))
            })
            .collect()
    }
}

struct RouterRoutesRule;
impl LintRule for RouterRoutesRule {
    fn name(&self) -> &str { "router_routes" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for node in flow.nodes.iter().filter(|n| n.node_type == NodeType::Router) {
            let routes = node.routes();
            if routes.is_empty() {
                diags.push(
                    Diagnostic::error(self.name(), format!("Router '{}' declares no routes", node.id))
                        .node(&node.id)
                        .fix("Declare route ids in config.routes"),
                );
            }

            let mut declared = HashSet::new();
            for route in &routes {
                if !declared.insert(route.as_str()) {
                    diags.push(
                        Diagnostic::error(
                            self.name(),
                            format!("Router '{}' declares route '{route}' twice", node.id),
                        )
                        .node(&node.id),
                    );
                }
            }

            let mut handled: HashMap<&str, usize> = HashMap::new();
            for edge in flow.edges_from(&node.id) {
                match edge.source_handle.as_deref() {
                    None => diags.push(
                        Diagnostic::error(
                            self.name(),
                            format!("Edge '{}' leaves router '{}' without a route handle", edge.id, node.id),
                        )
                        .node(&node.id)
                        .edge(&edge.id)
                        .fix("Set sourceHandle to one of the router's declared routes"),
                    ),
                    Some(ON_ERROR) => {}
                    Some(handle) if !declared.contains(handle) => diags.push(
                        Diagnostic::error(
                            self.name(),
                            format!("Edge '{}' carries undeclared route '{handle}' of router '{}'", edge.id, node.id),
                        )
                        .node(&node.id)
                        .edge(&edge.id)
                        .fix(format!("Declare route '{handle}' or remove the edge")),
                    ),
                    Some(handle) => *handled.entry(handle).or_default() += 1,
                }
            }

            for route in &routes {
                match handled.get(route.as_str()).copied().unwrap_or(0) {
                    1 => {}
                    0 => diags.push(
                        Diagnostic::error(
                            self.name(),
                            format!("Router '{}' declares route '{route}' but no edge carries it", node.id),
                        )
                        .node(&node.id)
                        .fix(format!("Add an edge with sourceHandle \"{route}\"")),
                    ),
                    n => diags.push(
                        Diagnostic::error(
                            self.name(),
                            format!("Route '{route}' of router '{}' is carried by {n} edges", node.id),
                        )
                        .node(&node.id)
                        .fix("Keep exactly one edge per route"),
                    ),
                }
            }
        }
        diags
    }
}

struct RouteHandlesRule;
impl LintRule for RouteHandlesRule {
    fn name(&self) -> &str { "route_handles" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        flow.edges
            .iter()
            .filter(|e| {
                flow.node(&e.source)
                    .is_some_and(|n| n.node_type != NodeType::Router)
            })
            .filter_map(|e| {
                let handle = e.source_handle.as_deref()?;
                (handle != ON_ERROR).then(|| {
                    Diagnostic::error(
                        self.name(),
                        format!(
                            "Edge '{}' carries route handle '{handle}' but '{}' is not a router",
                            e.id, e.source
                        ),
                    )
                    .edge(&e.id)
                    .fix(format!("Remove the handle or use \"{ON_ERROR}\""))
                })
            })
            .collect()
    }
}

struct UnconditionalFanoutRule;
impl LintRule for UnconditionalFanoutRule {
    fn name(&self) -> &str { "unconditional_fanout" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        flow.nodes
            .iter()
            .filter(|n| n.node_type != NodeType::Router)
            .filter_map(|n| {
                let count = flow
                    .edges_from(&n.id)
                    .filter(|e| !e.is_on_error() && e.is_unconditional())
                    .count();
                (count > 1).then(|| {
                    Diagnostic::error(
                        self.name(),
                        format!("Node '{}' has {count} unconditional outgoing edges", n.id),
                    )
                    .node(&n.id)
                    .fix("Add guards, or turn the node's successor into a router")
                })
            })
            .collect()
    }
}

struct GuardSyntaxRule;
impl LintRule for GuardSyntaxRule {
    fn name(&self) -> &str { "guard_syntax" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        flow.edges
            .iter()
            .filter_map(|e| {
                let guard = e.guard.as_deref()?;
                let err = parse_guard(guard).err()?;
                Some(
                    Diagnostic::error(
                        self.name(),
                        format!("Edge '{}' has invalid guard '{guard}': {err}", e.id),
                    )
                    .edge(&e.id)
                    .fix("Fix the guard expression syntax"),
                )
            })
            .collect()
    }
}

struct NodeExitRule;
impl LintRule for NodeExitRule {
    fn name(&self) -> &str { "node_exit" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        flow.nodes
            .iter()
            .filter(|n| n.node_type != NodeType::Terminal)
            .filter(|n| !(n.node_type == NodeType::OutboundMessage && n.resume_at().is_some()))
            .filter(|n| flow.edges_from(&n.id).all(|e| e.is_on_error()))
            .map(|n| {
                Diagnostic::error(
                    self.name(),
                    format!("Node '{}' ({}) has no outgoing edge", n.id, n.node_type),
                )
                .node(&n.id)
                .fix("Connect it to a successor, or end the branch with a terminal node")
            })
            .collect()
    }
}

struct TerminalNoOutgoingRule;
impl LintRule for TerminalNoOutgoingRule {
    fn name(&self) -> &str { "terminal_no_outgoing" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        flow.nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Terminal)
            .filter(|n| flow.edges_from(&n.id).next().is_some())
            .map(|n| {
                Diagnostic::warning(
                    self.name(),
                    format!("Terminal node '{}' has outgoing edges that are never taken", n.id),
                )
                .node(&n.id)
                .fix(format!("Remove outgoing edges from '{}'", n.id))
            })
            .collect()
    }
}

struct OnErrorSourceRule;
impl LintRule for OnErrorSourceRule {
    fn name(&self) -> &str { "on_error_source" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for node in &flow.nodes {
            let count = flow.edges_from(&node.id).filter(|e| e.is_on_error()).count();
            if count == 0 {
                continue;
            }
            if count > 1 {
                diags.push(
                    Diagnostic::error(
                        self.name(),
                        format!("Node '{}' has {count} on-error edges; at most one is allowed", node.id),
                    )
                    .node(&node.id),
                );
            }
            if !node.node_type.calls_collaborator() {
                diags.push(
                    Diagnostic::warning(
                        self.name(),
                        format!(
                            "Node '{}' ({}) never calls a collaborator, its on-error edge is never taken",
                            node.id, node.node_type
                        ),
                    )
                    .node(&node.id),
                );
            }
        }
        diags
    }
}

struct ResumeTargetRule;
impl LintRule for ResumeTargetRule {
    fn name(&self) -> &str { "resume_target" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        flow.nodes
            .iter()
            .filter_map(|n| {
                let target = n.resume_at()?;
                if n.node_type != NodeType::OutboundMessage {
                    return Some(
                        Diagnostic::warning(
                            self.name(),
                            format!("Node '{}' sets resumeAt but only outbound messages suspend", n.id),
                        )
                        .node(&n.id),
                    );
                }
                let node = flow.node(target);
                match node {
                    None => Some(
                        Diagnostic::error(
                            self.name(),
                            format!("Node '{}' resumes at '{target}' which does not exist", n.id),
                        )
                        .node(&n.id)
                        .fix(format!("Add node '{target}' or fix resumeAt")),
                    ),
                    Some(t) if t.node_type == NodeType::Trigger => Some(
                        Diagnostic::error(
                            self.name(),
                            format!("Node '{}' resumes at the trigger '{target}'", n.id),
                        )
                        .node(&n.id),
                    ),
                    Some(_) => None,
                }
            })
            .collect()
    }
}

struct ExtractionSchemaRule;
impl LintRule for ExtractionSchemaRule {
    fn name(&self) -> &str { "extraction_schema" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        flow.nodes
            .iter()
            .filter(|n| n.node_type == NodeType::LlmExtract)
            .filter_map(|n| {
                let err = ExtractionSchema::from_node(n).err()?;
                Some(
                    Diagnostic::error(self.name(), format!("Node '{}': {err}", n.id))
                        .node(&n.id)
                        .fix("Declare config.schema as a list of {name, type, required} fields"),
                )
            })
            .collect()
    }
}

struct TriggerNoIncomingRule;
impl LintRule for TriggerNoIncomingRule {
    fn name(&self) -> &str { "trigger_no_incoming" }
    fn apply(&self, flow: &FlowDefinition) -> Vec<Diagnostic> {
        let triggers: HashSet<&str> = flow.triggers().map(|n| n.id.as_str()).collect();
        flow.edges
            .iter()
            .filter(|e| triggers.contains(e.target.as_str()))
            .map(|e| {
                Diagnostic::warning(
                    self.name(),
                    format!("Edge '{}' points at the trigger '{}', which only runs on a fresh start", e.id, e.target),
                )
                .edge(&e.id)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

fn rules() -> Vec<Box<dyn LintRule>> {
    vec![
        Box::new(TriggerCountRule),
        Box::new(UniqueIdsRule),
        Box::new(EdgeEndpointsRule),
        Box::new(ReachabilityRule),
        Box::new(RouterRoutesRule),
        Box::new(RouteHandlesRule),
        Box::new(UnconditionalFanoutRule),
        Box::new(GuardSyntaxRule),
        Box::new(NodeExitRule),
        Box::new(TerminalNoOutgoingRule),
        Box::new(OnErrorSourceRule),
        Box::new(ResumeTargetRule),
        Box::new(ExtractionSchemaRule),
        Box::new(TriggerNoIncomingRule),
    ]
}

/// Run all built-in lint rules and return collected diagnostics.
pub fn lint(flow: &FlowDefinition) -> Vec<Diagnostic> {
    rules().iter().flat_map(|rule| rule.apply(flow)).collect()
}

/// Lint the flow and build its [`ValidFlow`]; any `Error` diagnostic fails.
pub fn validate(flow: &FlowDefinition) -> Result<ValidFlow> {
    let diagnostics = lint(flow);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| format!("{}: {}", d.rule, d.message))
        .collect();
    if !errors.is_empty() {
        return Err(FlowError::Configuration(format!(
            "flow '{}' v{} is invalid: {}",
            flow.id,
            flow.version,
            errors.join("; ")
        )));
    }
    for warning in diagnostics.iter().filter(|d| d.severity == Severity::Warning) {
        tracing::warn!(flow = %flow.id, rule = %warning.rule, "{}", warning.message);
    }
    ValidFlow::from_checked(flow.clone())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
