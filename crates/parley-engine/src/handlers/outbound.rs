use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use parley_types::{stringify, FlowError, HandlerResult, Result, Scope};

use crate::collaborators::{MessageDelivery, OutboundMessage};
use crate::graph::{Node, NodeType};
use crate::handler::NodeHandler;

// ---------------------------------------------------------------------------
// OutboundHandler — sends a message and suspends (outbound-message)
// ---------------------------------------------------------------------------

pub struct OutboundHandler {
    delivery: Arc<dyn MessageDelivery>,
}

impl OutboundHandler {
    pub fn new(delivery: Arc<dyn MessageDelivery>) -> Self {
        Self { delivery }
    }
}

#[async_trait]
impl NodeHandler for OutboundHandler {
    fn node_type(&self) -> NodeType {
        NodeType::OutboundMessage
    }

    async fn handle(&self, node: &Node, config: &Value, scope: &Scope) -> Result<HandlerResult> {
        let text = config
            .get("text")
            .map(stringify)
            .ok_or_else(|| FlowError::HandlerError {
                handler: NodeType::OutboundMessage.to_string(),
                node: node.id.clone(),
                message: "Missing text".into(),
            })?;
        let to = config
            .get("to")
            .map(stringify)
            .or_else(|| scope.lookup("event.endUserId").map(stringify))
            .unwrap_or_default();
        let tenant_id = scope.lookup("event.tenantId").map(stringify).unwrap_or_default();

        let message = OutboundMessage {
            tenant_id,
            to,
            text: text.clone(),
            node_id: node.id.clone(),
        };
        match self.delivery.deliver(message).await {
            Ok(receipt) => {
                tracing::debug!(node = %node.id, message_id = %receipt.message_id, "Message delivered");
                let mut result = HandlerResult::await_input();
                result.bindings.insert("messageId".into(), Value::String(receipt.message_id));
                result.bindings.insert("text".into(), Value::String(text));
                Ok(result)
            }
            Err(failure) => Ok(HandlerResult::failed(failure.code, failure.message)),
        }
    }
}
