//! Handlers for node types that delegate to an external collaborator.

pub mod adapter;
pub mod extract;
pub mod generate;
pub mod outbound;

pub use adapter::ActionAdapterHandler;
pub use extract::{Completeness, ExtractHandler, ExtractionSchema, FieldType, SchemaField};
pub use generate::GenerateHandler;
pub use outbound::OutboundHandler;
