use async_trait::async_trait;
use serde_json::Value;

use parley_types::{FlowError, HandlerResult, Result, Scope};

use crate::collaborators::AdapterSet;
use crate::graph::{Node, NodeType};
use crate::handler::NodeHandler;

// ---------------------------------------------------------------------------
// ActionAdapterHandler — calls a named external integration (action-adapter)
// ---------------------------------------------------------------------------

pub struct ActionAdapterHandler {
    adapters: AdapterSet,
}

impl ActionAdapterHandler {
    pub fn new(adapters: AdapterSet) -> Self {
        Self { adapters }
    }
}

#[async_trait]
impl NodeHandler for ActionAdapterHandler {
    fn node_type(&self) -> NodeType {
        NodeType::ActionAdapter
    }

    async fn handle(&self, node: &Node, config: &Value, _scope: &Scope) -> Result<HandlerResult> {
        let handler_error = |message: String| FlowError::HandlerError {
            handler: NodeType::ActionAdapter.to_string(),
            node: node.id.clone(),
            message,
        };

        let name = config
            .get("adapter")
            .and_then(Value::as_str)
            .ok_or_else(|| handler_error("Missing adapter name".into()))?;
        let adapter = self
            .adapters
            .get(name)
            .ok_or_else(|| handler_error(format!("No adapter registered as '{name}'")))?;

        let action = config.get("action").and_then(Value::as_str).unwrap_or_default();
        let params = config
            .get("params")
            .cloned()
            .unwrap_or_else(|| Value::Object(serde_json::Map::new()));

        tracing::info!(node = %node.id, adapter = %name, action = %action, "Invoking adapter");
        match adapter.invoke(action, &params).await {
            Ok(result) => Ok(HandlerResult::proceed().bind("result", result)),
            Err(failure) => {
                tracing::warn!(node = %node.id, adapter = %name, code = %failure.code, "Adapter failed");
                Ok(HandlerResult::failed(failure.code, failure.message))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{FailingAdapter, StaticAdapter};
    use parley_types::Directive;
    use serde_json::json;
    use std::sync::Arc;

    fn node() -> Node {
        Node::new("pay", NodeType::ActionAdapter, json!({}))
    }

    #[tokio::test]
    async fn adapter_result_is_bound() {
        let adapter = Arc::new(StaticAdapter::new(json!({ "url": "https://pay.example/x" })));
        let mut set = AdapterSet::new();
        set.register("payments", adapter.clone());
        let handler = ActionAdapterHandler::new(set);

        let config = json!({ "adapter": "payments", "action": "create_link", "params": { "amount": 1500 } });
        let result = handler.handle(&node(), &config, &Scope::new()).await.unwrap();
        assert_eq!(result.directive, Directive::Continue);
        assert_eq!(result.bindings["result"]["url"], json!("https://pay.example/x"));
        assert_eq!(adapter.calls(), vec![("create_link".to_string(), json!({ "amount": 1500 }))]);
    }

    #[tokio::test]
    async fn adapter_failure_surfaces_code() {
        let mut set = AdapterSet::new();
        set.register("payments", Arc::new(FailingAdapter::new("declined", "card declined")));
        let handler = ActionAdapterHandler::new(set);

        let result = handler
            .handle(&node(), &json!({ "adapter": "payments" }), &Scope::new())
            .await
            .unwrap();
        assert_eq!(result.directive, Directive::Error("declined".into()));
        assert_eq!(
            result.bindings["error"],
            json!({ "code": "declined", "message": "card declined" })
        );
    }

    #[tokio::test]
    async fn unknown_adapter_is_handler_error() {
        let handler = ActionAdapterHandler::new(AdapterSet::new());
        let err = handler
            .handle(&node(), &json!({ "adapter": "crm" }), &Scope::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("'crm'"));
    }
}
