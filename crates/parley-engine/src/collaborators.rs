//! Collaborator traits the handlers delegate I/O to, plus in-process
//! implementations used by tests and the CLI simulator.
//!
//! Concrete third-party clients (LLM providers, payment links, messaging
//! channels) live outside this crate and implement these traits.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use parley_types::Result;

use crate::graph::FlowDefinition;
use crate::handlers::extract::ExtractionSchema;

/// Failure reported by an external collaborator. Surfaces as `Error(code)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterFailure {
    pub code: String,
    pub message: String,
}

impl AdapterFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new("timeout", format!("no answer after {}ms", after.as_millis()))
    }
}

impl fmt::Display for AdapterFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

pub type AdapterResult<T> = std::result::Result<T, AdapterFailure>;

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub node_id: String,
    pub prompt: String,
    pub system: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResponse {
    pub text: String,
    pub usage: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub node_id: String,
    pub input: String,
    pub schema: ExtractionSchema,
    /// Values already known from earlier turns, keyed by field name.
    pub known: Map<String, Value>,
    pub instructions: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub tenant_id: String,
    pub to: String,
    pub text: String,
    pub node_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: String,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> AdapterResult<GenerationResponse>;
}

#[async_trait]
pub trait StructuredExtractor: Send + Sync {
    /// Returns field name -> extracted value. Fields it could not find may be
    /// omitted or null; the engine computes completeness itself.
    async fn extract(&self, request: ExtractionRequest) -> AdapterResult<Map<String, Value>>;
}

#[async_trait]
pub trait ActionAdapter: Send + Sync {
    async fn invoke(&self, action: &str, params: &Value) -> AdapterResult<Value>;
}

#[async_trait]
pub trait MessageDelivery: Send + Sync {
    async fn deliver(&self, message: OutboundMessage) -> AdapterResult<DeliveryReceipt>;
}

/// Supplies the active flow definition of a tenant.
#[async_trait]
pub trait FlowSource: Send + Sync {
    /// The tenant's active flow, or `None` when it has none.
    async fn load_validated(&self, tenant_id: &str) -> Result<Option<FlowDefinition>>;

    /// A specific stored version, used to keep in-flight conversations on the
    /// version they started with.
    async fn load_version(
        &self,
        _tenant_id: &str,
        _flow_id: &str,
        _version: u64,
    ) -> Result<Option<FlowDefinition>> {
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// AdapterSet / Collaborators
// ---------------------------------------------------------------------------

/// Named action adapters, addressed by `config.adapter` on action-adapter nodes.
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<String, Arc<dyn ActionAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, adapter: Arc<dyn ActionAdapter>) {
        self.adapters.insert(name.into(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionAdapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Everything the built-in handlers delegate to.
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn TextGenerator>,
    pub extractor: Arc<dyn StructuredExtractor>,
    pub adapters: AdapterSet,
    pub delivery: Arc<dyn MessageDelivery>,
}

impl Collaborators {
    pub fn new(
        generator: Arc<dyn TextGenerator>,
        extractor: Arc<dyn StructuredExtractor>,
        delivery: Arc<dyn MessageDelivery>,
    ) -> Self {
        Self {
            generator,
            extractor,
            adapters: AdapterSet::new(),
            delivery,
        }
    }

    pub fn with_adapter(mut self, name: impl Into<String>, adapter: Arc<dyn ActionAdapter>) -> Self {
        self.adapters.register(name, adapter);
        self
    }
}

// ---------------------------------------------------------------------------
// EchoGenerator
// ---------------------------------------------------------------------------

/// Replies with the resolved prompt.
pub struct EchoGenerator;

#[async_trait]
impl TextGenerator for EchoGenerator {
    async fn generate(&self, request: GenerationRequest) -> AdapterResult<GenerationResponse> {
        Ok(GenerationResponse {
            text: request.prompt,
            usage: None,
        })
    }
}

// ---------------------------------------------------------------------------
// RecordingGenerator
// ---------------------------------------------------------------------------

/// Pops scripted replies in order and records every request.
/// Falls back to echoing the prompt once the script runs out.
pub struct RecordingGenerator {
    replies: Mutex<Vec<String>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl RecordingGenerator {
    pub fn new(replies: Vec<String>) -> Self {
        let mut reversed = replies;
        reversed.reverse();
        Self {
            replies: Mutex::new(reversed),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl TextGenerator for RecordingGenerator {
    async fn generate(&self, request: GenerationRequest) -> AdapterResult<GenerationResponse> {
        self.requests.lock().push(request.clone());
        let text = self.replies.lock().pop().unwrap_or(request.prompt);
        Ok(GenerationResponse {
            text,
            usage: Some(serde_json::json!({ "calls": self.requests.lock().len() })),
        })
    }
}

// ---------------------------------------------------------------------------
// KeywordExtractor
// ---------------------------------------------------------------------------

/// Pulls `field: value` / `field = value` pairs out of the input text.
///
/// A reply that is exactly one of a field's "no preference" sentinels fills
/// the first field not already known. Useful for local simulation.
pub struct KeywordExtractor;

#[async_trait]
impl StructuredExtractor for KeywordExtractor {
    async fn extract(&self, request: ExtractionRequest) -> AdapterResult<Map<String, Value>> {
        let mut values = Map::new();
        for field in &request.schema.fields {
            let pattern = format!(r"(?i)\b{}\s*[:=]\s*([^,;\n]+)", regex::escape(&field.name));
            let Ok(re) = regex::Regex::new(&pattern) else {
                continue;
            };
            if let Some(caps) = re.captures(&request.input) {
                values.insert(field.name.clone(), Value::String(caps[1].trim().to_string()));
            }
        }

        if values.is_empty() {
            let reply = request.input.trim();
            let open = request
                .schema
                .fields
                .iter()
                .find(|f| request.known.get(&f.name).map_or(true, Value::is_null));
            if let Some(field) = open {
                if request.schema.is_sentinel(field, reply) {
                    values.insert(field.name.clone(), Value::String(reply.to_string()));
                }
            }
        }
        Ok(values)
    }
}

// ---------------------------------------------------------------------------
// StaticExtractor
// ---------------------------------------------------------------------------

/// Returns scripted extraction results in order; the last one repeats.
pub struct StaticExtractor {
    results: Mutex<Vec<Map<String, Value>>>,
    requests: Mutex<Vec<ExtractionRequest>>,
}

impl StaticExtractor {
    pub fn new(results: Vec<Value>) -> Self {
        let mut maps: Vec<Map<String, Value>> = results
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect();
        maps.reverse();
        Self {
            results: Mutex::new(maps),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ExtractionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl StructuredExtractor for StaticExtractor {
    async fn extract(&self, request: ExtractionRequest) -> AdapterResult<Map<String, Value>> {
        self.requests.lock().push(request);
        let mut results = self.results.lock();
        let result = if results.len() > 1 {
            results.pop()
        } else {
            results.last().cloned()
        };
        Ok(result.unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// StaticAdapter / FailingAdapter
// ---------------------------------------------------------------------------

/// Answers every action with a fixed value, optionally after a delay.
pub struct StaticAdapter {
    result: Value,
    delay: Option<Duration>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl StaticAdapter {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ActionAdapter for StaticAdapter {
    async fn invoke(&self, action: &str, params: &Value) -> AdapterResult<Value> {
        self.calls.lock().push((action.to_string(), params.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.result.clone())
    }
}

/// Fails every action with the same code.
pub struct FailingAdapter {
    failure: AdapterFailure,
}

impl FailingAdapter {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            failure: AdapterFailure::new(code, message),
        }
    }
}

#[async_trait]
impl ActionAdapter for FailingAdapter {
    async fn invoke(&self, _action: &str, _params: &Value) -> AdapterResult<Value> {
        Err(self.failure.clone())
    }
}

// ---------------------------------------------------------------------------
// RecordingDelivery
// ---------------------------------------------------------------------------

/// Records delivered messages and hands out sequential message ids.
#[derive(Default)]
pub struct RecordingDelivery {
    sent: Mutex<Vec<OutboundMessage>>,
    failure: Option<AdapterFailure>,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failure: Some(AdapterFailure::new(code, message)),
        }
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent.lock().iter().map(|m| m.text.clone()).collect()
    }
}

#[async_trait]
impl MessageDelivery for RecordingDelivery {
    async fn deliver(&self, message: OutboundMessage) -> AdapterResult<DeliveryReceipt> {
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        let mut sent = self.sent.lock();
        sent.push(message);
        Ok(DeliveryReceipt {
            message_id: format!("msg-{}", sent.len()),
        })
    }
}

// ---------------------------------------------------------------------------
// InMemoryFlowSource
// ---------------------------------------------------------------------------

/// Holds every stored version of every flow, per tenant.
///
/// The active flow of a tenant is chosen among the latest version of each
/// flow id: highest `priority` first, ties broken by the lowest id.
#[derive(Default)]
pub struct InMemoryFlowSource {
    flows: RwLock<HashMap<String, Vec<FlowDefinition>>>,
}

impl InMemoryFlowSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, flow: FlowDefinition) {
        let mut flows = self.flows.write();
        let versions = flows.entry(flow.tenant_id.clone()).or_default();
        versions.retain(|f| !(f.id == flow.id && f.version == flow.version));
        versions.push(flow);
    }

    pub fn with_flow(self, flow: FlowDefinition) -> Self {
        self.insert(flow);
        self
    }

    fn active(&self, tenant_id: &str) -> Option<FlowDefinition> {
        let flows = self.flows.read();
        let versions = flows.get(tenant_id)?;

        let mut latest: HashMap<&str, &FlowDefinition> = HashMap::new();
        for flow in versions {
            let entry = latest.entry(flow.id.as_str()).or_insert(flow);
            if flow.version > entry.version {
                *entry = flow;
            }
        }

        latest
            .into_values()
            .max_by(|a, b| a.priority.cmp(&b.priority).then_with(|| b.id.cmp(&a.id)))
            .cloned()
    }
}

#[async_trait]
impl FlowSource for InMemoryFlowSource {
    async fn load_validated(&self, tenant_id: &str) -> Result<Option<FlowDefinition>> {
        Ok(self.active(tenant_id))
    }

    async fn load_version(
        &self,
        tenant_id: &str,
        flow_id: &str,
        version: u64,
    ) -> Result<Option<FlowDefinition>> {
        Ok(self.flows.read().get(tenant_id).and_then(|versions| {
            versions
                .iter()
                .find(|f| f.id == flow_id && f.version == version)
                .cloned()
        }))
    }
}
