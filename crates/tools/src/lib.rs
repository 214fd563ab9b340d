//! Datastore implementations for Turnkeep.
//!
//! Steps reach domain data only through `turnkeep_core::Datastore`. This
//! crate provides the collection schemas, request validation and repair
//! that sit in front of any datastore, and an in-memory implementation
//! used by the CLI and the tests.

pub mod filter;
pub mod in_memory;
pub mod schema;
pub mod validate;

pub use in_memory::InMemoryDatastore;
pub use schema::{CollectionSchema, FieldKind, FieldSpec};
pub use validate::validate_request;

/// Best human-readable label for a record.
pub fn record_label(record: &serde_json::Value) -> String {
    for key in ["name", "title", "label", "item"] {
        if let Some(text) = record.get(key).and_then(|v| v.as_str()) {
            if !text.is_empty() {
                return text.to_string();
            }
        }
    }
    record
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or("unnamed")
        .to_string()
}
