//! Conversation flow execution engine.
//!
//! Validates tenant-authored flow graphs, resolves `{{path}}` templates,
//! evaluates edge guards, dispatches nodes to handlers, and runs one turn per
//! inbound event against versioned, per-conversation state.

pub mod collaborators;
pub mod condition;
pub mod config;
pub mod dedup;
pub mod duration_serde;
pub mod edge_selection;
pub mod engine;
pub mod events;
pub mod graph;
pub mod handler;
pub mod handlers;
pub mod lock;
pub mod store;
pub mod template;
pub mod validation;

pub use collaborators::{
    ActionAdapter, AdapterFailure, AdapterResult, AdapterSet, Collaborators, DeliveryReceipt,
    EchoGenerator, ExtractionRequest, FailingAdapter, FlowSource, GenerationRequest,
    GenerationResponse, InMemoryFlowSource, KeywordExtractor, MessageDelivery, OutboundMessage,
    RecordingDelivery, RecordingGenerator, StaticAdapter, StaticExtractor, StructuredExtractor,
    TextGenerator,
};
pub use condition::{evaluate, evaluate_guard, parse_guard, Clause, Guard, Operand, Operator};
pub use config::{EngineConfig, VersionPolicy};
pub use dedup::{Deduplicator, NoDedup, RecentEvents};
pub use edge_selection::select_edge;
pub use engine::{FlowEngine, MissingVariable, TurnOutcome, TurnStatus};
pub use events::{EngineEvent, EventEmitter};
pub use graph::{Edge, FlowDefinition, Node, NodeType, Route, ValidFlow, ON_ERROR};
pub use handler::{
    default_registry, DynHandler, HandlerRegistry, NodeHandler, RouterHandler, TerminalHandler,
    TriggerHandler, TriggerMatch,
};
pub use handlers::{
    ActionAdapterHandler, Completeness, ExtractHandler, ExtractionSchema, FieldType,
    GenerateHandler, OutboundHandler, SchemaField,
};
pub use lock::{LeaseGuard, LeaseTable};
pub use store::{FileStateStore, MemoryStateStore, StateStore};
pub use template::{referenced_paths, resolve, resolve_value, Resolution};
pub use validation::{lint, validate, Diagnostic, LintRule, Severity};
