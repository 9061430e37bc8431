use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use parley_types::{stringify, FlowError, HandlerResult, Result, Scope};

use crate::collaborators::{GenerationRequest, TextGenerator};
use crate::graph::{Node, NodeType};
use crate::handler::NodeHandler;

// ---------------------------------------------------------------------------
// GenerateHandler — free-text generation (llm-generate)
// ---------------------------------------------------------------------------

pub struct GenerateHandler {
    generator: Arc<dyn TextGenerator>,
}

impl GenerateHandler {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        Self { generator }
    }
}

#[async_trait]
impl NodeHandler for GenerateHandler {
    fn node_type(&self) -> NodeType {
        NodeType::LlmGenerate
    }

    async fn handle(&self, node: &Node, config: &Value, _scope: &Scope) -> Result<HandlerResult> {
        let prompt = config
            .get("prompt")
            .map(stringify)
            .ok_or_else(|| FlowError::HandlerError {
                handler: NodeType::LlmGenerate.to_string(),
                node: node.id.clone(),
                message: "Missing prompt".into(),
            })?;

        let request = GenerationRequest {
            node_id: node.id.clone(),
            prompt,
            system: config.get("system").map(stringify),
            model: config.get("model").and_then(Value::as_str).map(String::from),
            temperature: config.get("temperature").and_then(Value::as_f64),
        };

        tracing::debug!(node = %node.id, model = ?request.model, "Generating text");
        match self.generator.generate(request).await {
            Ok(response) => {
                let mut result = HandlerResult::proceed().bind("text", Value::String(response.text));
                if let Some(usage) = response.usage {
                    result = result.bind("usage", usage);
                }
                Ok(result)
            }
            Err(failure) => Ok(HandlerResult::failed(failure.code, failure.message)),
        }
    }
}
