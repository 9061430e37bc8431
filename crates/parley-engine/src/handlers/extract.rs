//! Structured extraction: the schema model, the engine-side completeness
//! computation, and the `llm-extract` handler.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use parley_types::{stringify, FlowError, HandlerResult, Result, Scope};

use crate::collaborators::{ExtractionRequest, StructuredExtractor};
use crate::graph::{qualify, Node, NodeType};
use crate::handler::NodeHandler;

/// Binding names the handler itself produces; schema fields may not shadow them.
const RESERVED_BINDINGS: &[&str] = &["values", "complete", "missingFields", "noPreferenceFields", "error"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    String,
    Number,
    Boolean,
    List,
    Object,
}

impl FieldType {
    /// Best-effort conversion of an extractor answer to the declared type.
    /// Values that do not convert are kept as returned.
    pub fn coerce(self, value: Value) -> Value {
        match (self, value) {
            (FieldType::Number, Value::String(s)) => {
                let cleaned = s.trim().replace(',', ".");
                if let Ok(i) = cleaned.parse::<i64>() {
                    Value::from(i)
                } else if let Some(n) = cleaned.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
                    Value::Number(n)
                } else {
                    Value::String(s)
                }
            }
            (FieldType::Boolean, Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "si" | "sí" => Value::Bool(true),
                "false" | "no" => Value::Bool(false),
                _ => Value::String(s),
            },
            (FieldType::List, Value::String(s)) => Value::Array(
                s.split(',')
                    .map(|item| item.trim())
                    .filter(|item| !item.is_empty())
                    .map(|item| Value::String(item.to_string()))
                    .collect(),
            ),
            (_, other) => other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaField {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: Option<String>,
    /// Answers that mean "any value is fine" for this field.
    #[serde(default)]
    pub no_preference: Vec<String>,
}

/// Ordered list of fields an `llm-extract` node fills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionSchema {
    pub fields: Vec<SchemaField>,
    /// Sentinels that apply to every field.
    #[serde(default)]
    pub no_preference: Vec<String>,
}

/// Outcome of checking extracted values against the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completeness {
    pub complete: bool,
    pub missing_fields: Vec<String>,
    pub no_preference_fields: Vec<String>,
}

impl ExtractionSchema {
    /// Accepts either a bare field list or `{ "fields": [...], "noPreference": [...] }`.
    pub fn from_config(config: &Value) -> Result<Self> {
        let schema = match config {
            Value::Array(_) => ExtractionSchema {
                fields: serde_json::from_value(config.clone()).map_err(schema_error)?,
                no_preference: Vec::new(),
            },
            Value::Object(_) => serde_json::from_value(config.clone()).map_err(schema_error)?,
            _ => return Err(FlowError::Configuration("schema must be a list or an object".into())),
        };
        schema.check()?;
        Ok(schema)
    }

    pub fn from_node(node: &Node) -> Result<Self> {
        let config = node.config.get("schema").ok_or_else(|| {
            FlowError::Configuration(format!("extraction node '{}' has no schema", node.id))
        })?;
        Self::from_config(config)
    }

    fn check(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(FlowError::Configuration("schema declares no fields".into()));
        }
        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.trim().is_empty() {
                return Err(FlowError::Configuration("schema field with empty name".into()));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(FlowError::Configuration(format!(
                    "schema field '{}' declared twice",
                    field.name
                )));
            }
            if RESERVED_BINDINGS.contains(&field.name.as_str()) {
                return Err(FlowError::Configuration(format!(
                    "schema field '{}' shadows a reserved binding",
                    field.name
                )));
            }
        }
        Ok(())
    }

    pub fn field(&self, name: &str) -> Option<&SchemaField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// True if `answer` is a "no preference" sentinel for `field`.
    /// Comparison ignores case and surrounding whitespace.
    pub fn is_sentinel(&self, field: &SchemaField, answer: &str) -> bool {
        let answer = answer.trim().to_lowercase();
        !answer.is_empty()
            && field
                .no_preference
                .iter()
                .chain(self.no_preference.iter())
                .any(|s| s.trim().to_lowercase() == answer)
    }

    /// Every required field must hold a non-null, non-blank value or a sentinel.
    pub fn evaluate(&self, values: &Map<String, Value>) -> Completeness {
        let mut missing_fields = Vec::new();
        let mut no_preference_fields = Vec::new();

        for field in &self.fields {
            let value = values.get(&field.name);
            let sentinel = matches!(value, Some(Value::String(s)) if self.is_sentinel(field, s));
            if sentinel {
                no_preference_fields.push(field.name.clone());
            }
            let resolved = sentinel
                || match value {
                    None | Some(Value::Null) => false,
                    Some(Value::String(s)) => !s.trim().is_empty(),
                    Some(_) => true,
                };
            if field.required && !resolved {
                missing_fields.push(field.name.clone());
            }
        }

        Completeness {
            complete: missing_fields.is_empty(),
            missing_fields,
            no_preference_fields,
        }
    }

    /// Overlay freshly extracted values on what was already known.
    ///
    /// Unknown fields are dropped, nulls never clobber a known value, and
    /// sentinel answers are kept verbatim instead of being coerced.
    pub fn merge(&self, known: &Map<String, Value>, extracted: Map<String, Value>) -> Map<String, Value> {
        let mut values: Map<String, Value> = known
            .iter()
            .filter(|(k, _)| self.field(k).is_some())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        for (name, value) in extracted {
            let Some(field) = self.field(&name) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let value = match value {
                Value::String(s) if self.is_sentinel(field, &s) => Value::String(s),
                other => field.field_type.coerce(other),
            };
            values.insert(name, value);
        }
        values
    }
}

fn schema_error(err: serde_json::Error) -> FlowError {
    FlowError::Configuration(format!("invalid extraction schema: {err}"))
}

// ---------------------------------------------------------------------------
// ExtractHandler
// ---------------------------------------------------------------------------

pub struct ExtractHandler {
    extractor: Arc<dyn StructuredExtractor>,
}

impl ExtractHandler {
    pub fn new(extractor: Arc<dyn StructuredExtractor>) -> Self {
        Self { extractor }
    }
}

#[async_trait]
impl NodeHandler for ExtractHandler {
    fn node_type(&self) -> NodeType {
        NodeType::LlmExtract
    }

    async fn handle(&self, node: &Node, config: &Value, scope: &Scope) -> Result<HandlerResult> {
        let schema = ExtractionSchema::from_node(node).map_err(|e| FlowError::HandlerError {
            handler: NodeType::LlmExtract.to_string(),
            node: node.id.clone(),
            message: e.to_string(),
        })?;

        let input = match config.get("input") {
            Some(v) => stringify(v),
            None => scope.lookup("text").map(stringify).unwrap_or_default(),
        };
        let known = scope
            .lookup(&qualify(&node.id, "values"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let request = ExtractionRequest {
            node_id: node.id.clone(),
            input,
            schema: schema.clone(),
            known: known.clone(),
            instructions: config.get("instructions").map(stringify),
        };

        let extracted = match self.extractor.extract(request).await {
            Ok(extracted) => extracted,
            Err(failure) => return Ok(HandlerResult::failed(failure.code, failure.message)),
        };

        let values = schema.merge(&known, extracted);
        let completeness = schema.evaluate(&values);
        tracing::debug!(
            node = %node.id,
            complete = completeness.complete,
            missing = ?completeness.missing_fields,
            "Extraction evaluated"
        );

        let mut result = HandlerResult::proceed();
        for (name, value) in &values {
            result = result.bind(name.clone(), value.clone());
        }
        Ok(result
            .bind("values", Value::Object(values))
            .bind("complete", Value::Bool(completeness.complete))
            .bind("missingFields", serde_json::json!(completeness.missing_fields))
            .bind("noPreferenceFields", serde_json::json!(completeness.no_preference_fields)))
    }
}
