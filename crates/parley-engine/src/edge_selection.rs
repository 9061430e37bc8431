//! Outgoing edge selection after a node continues.
//!
//! A node with exactly one unconditional edge always takes it. Otherwise the
//! edges are evaluated in route order (declared routes for routers,
//! declaration order elsewhere) and the first whose guard holds wins; an
//! unguarded edge always holds. No match is a dead end, never a silent default.

use parley_types::{FlowError, Result, Scope};

use crate::condition::evaluate_guard;
use crate::graph::{Edge, ValidFlow};

/// Select the edge to follow out of `node_id`.
pub fn select_edge<'a>(flow: &'a ValidFlow, node_id: &str, scope: &Scope) -> Result<&'a Edge> {
    let routes = flow.routes(node_id);

    if let [only] = routes {
        if only.guard.is_none() {
            return Ok(&only.edge);
        }
    }

    routes
        .iter()
        .find(|route| {
            route
                .guard
                .as_ref()
                .map_or(true, |guard| evaluate_guard(guard, scope))
        })
        .map(|route| &route.edge)
        .ok_or_else(|| FlowError::RoutingDeadEnd {
            node: node_id.to_string(),
        })
}
