//! In-memory datastore: per-user collections of JSON records.
//!
//! Records get canonical UUIDs on creation. Every operation is scoped to the
//! calling user's partition.

use crate::filter::matches_all;
use crate::schema::CollectionSchema;
use crate::validate::validate_request;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use turnkeep_core::error::ToolError;
use turnkeep_core::tool::{Datastore, ToolOp, ToolOutput, ToolRequest};
use uuid::Uuid;

/// Records per `(user_id, collection)`.
type Partitions = HashMap<(String, String), Vec<Value>>;

#[derive(Clone, Default)]
pub struct InMemoryDatastore {
    schemas: Arc<HashMap<String, CollectionSchema>>,
    records: Arc<RwLock<Partitions>>,
}

impl InMemoryDatastore {
    pub fn new(schemas: Vec<CollectionSchema>) -> Self {
        Self {
            schemas: Arc::new(schemas.into_iter().map(|s| (s.name.clone(), s)).collect()),
            records: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Insert records directly, bypassing validation. Returns their ids.
    pub async fn seed(&self, user_id: &str, collection: &str, rows: Vec<Value>) -> Vec<String> {
        let mut records = self.records.write().await;
        let partition = records
            .entry((user_id.to_string(), collection.to_string()))
            .or_default();
        rows.into_iter()
            .map(|mut row| {
                let id = Uuid::new_v4().to_string();
                if let Value::Object(obj) = &mut row {
                    obj.insert("id".into(), Value::String(id.clone()));
                }
                partition.push(row);
                id
            })
            .collect()
    }

    /// Number of records a user holds in a collection.
    pub async fn count(&self, user_id: &str, collection: &str) -> usize {
        self.records
            .read()
            .await
            .get(&(user_id.to_string(), collection.to_string()))
            .map_or(0, Vec::len)
    }

    fn schema_for(&self, collection: &str) -> Result<&CollectionSchema, ToolError> {
        self.schemas
            .get(collection)
            .ok_or_else(|| ToolError::UnknownCollection(collection.to_string()))
    }
}

fn record_id(record: &Value) -> String {
    record
        .get("id")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    fn name(&self) -> &str {
        "in_memory"
    }

    fn collections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.schemas.keys().cloned().collect();
        names.sort();
        names
    }

    async fn execute(&self, user_id: &str, request: ToolRequest) -> Result<ToolOutput, ToolError> {
        let schema = self.schema_for(&request.collection)?;
        let request = validate_request(request, schema)?;
        let key = (user_id.to_string(), request.collection.clone());

        let mut records = self.records.write().await;
        let partition = records.entry(key).or_default();

        let mut output = ToolOutput {
            op: request.op,
            collection: request.collection.clone(),
            records: Vec::new(),
            affected_ids: Vec::new(),
        };

        match request.op {
            ToolOp::Read => {
                let limit = request.limit.unwrap_or(usize::MAX);
                output.records = partition
                    .iter()
                    .filter(|r| matches_all(r, &request.filters))
                    .take(limit)
                    .cloned()
                    .collect();
            }
            ToolOp::Create => {
                let rows = match request.data {
                    Some(Value::Array(items)) => items,
                    Some(other) => vec![other],
                    None => Vec::new(),
                };
                for mut row in rows {
                    let id = Uuid::new_v4().to_string();
                    if let Value::Object(obj) = &mut row {
                        obj.insert("id".into(), Value::String(id.clone()));
                    }
                    partition.push(row.clone());
                    output.records.push(row);
                    output.affected_ids.push(id);
                }
            }
            ToolOp::Update => {
                let changes = request.data.unwrap_or(Value::Null);
                for record in partition.iter_mut().filter(|r| matches_all(r, &request.filters)) {
                    if let (Value::Object(target), Value::Object(changes)) = (record, &changes) {
                        for (field, value) in changes {
                            target.insert(field.clone(), value.clone());
                        }
                        let updated = Value::Object(target.clone());
                        output.affected_ids.push(record_id(&updated));
                        output.records.push(updated);
                    }
                }
            }
            ToolOp::Delete => {
                let (removed, kept): (Vec<Value>, Vec<Value>) = partition
                    .drain(..)
                    .partition(|r| matches_all(r, &request.filters));
                *partition = kept;
                output.affected_ids = removed.iter().map(record_id).collect();
                output.records = removed;
            }
        }

        debug!(
            user_id,
            collection = %output.collection,
            op = output.op.as_str(),
            records = output.records.len(),
            "Datastore call"
        );
        Ok(output)
    }

    async fn schema(&self, collection: &str) -> Result<Value, ToolError> {
        Ok(self.schema_for(collection)?.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldKind;
    use serde_json::json;
    use turnkeep_core::tool::FilterClause;

    fn store() -> InMemoryDatastore {
        InMemoryDatastore::new(vec![
            CollectionSchema::new("inventory")
                .with_field("name", FieldKind::Text, true)
                .with_field("quantity", FieldKind::Number, false),
        ])
    }

    #[tokio::test]
    async fn create_assigns_canonical_ids() {
        let ds = store();
        let out = ds
            .execute(
                "u1",
                ToolRequest {
                    op: ToolOp::Create,
                    collection: "inventory".into(),
                    filters: vec![],
                    data: Some(json!({"id": "model-made", "name": "Rice"})),
                    limit: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(out.affected_ids.len(), 1);
        assert_ne!(out.affected_ids[0], "model-made");
        assert_eq!(out.records[0]["id"], json!(out.affected_ids[0]));
    }

    #[tokio::test]
    async fn reads_are_user_scoped_and_filtered() {
        let ds = store();
        ds.seed("u1", "inventory", vec![json!({"name": "Rice"}), json!({"name": "Cod"})])
            .await;
        ds.seed("u2", "inventory", vec![json!({"name": "Secret"})]).await;

        let all = ds.execute("u1", ToolRequest::read("inventory")).await.unwrap();
        assert_eq!(all.records.len(), 2);

        let cod = ds
            .execute(
                "u1",
                ToolRequest::read("inventory").with_filter(FilterClause::eq("name", "cod")),
            )
            .await
            .unwrap();
        assert_eq!(cod.records.len(), 1);
        assert_eq!(ds.count("u2", "inventory").await, 1);
    }

    #[tokio::test]
    async fn update_and_delete_by_id() {
        let ds = store();
        let ids = ds.seed("u1", "inventory", vec![json!({"name": "Rice", "quantity": 1})]).await;

        let updated = ds
            .execute(
                "u1",
                ToolRequest {
                    op: ToolOp::Update,
                    collection: "inventory".into(),
                    filters: vec![FilterClause::eq("id", ids[0].clone())],
                    data: Some(json!({"quantity": "3"})),
                    limit: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.records[0]["quantity"], json!(3.0));
        assert_eq!(updated.affected_ids, ids);

        let deleted = ds
            .execute(
                "u1",
                ToolRequest {
                    op: ToolOp::Delete,
                    collection: "inventory".into(),
                    filters: vec![FilterClause::eq("id", ids[0].clone())],
                    data: None,
                    limit: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(deleted.affected_ids, ids);
        assert_eq!(ds.count("u1", "inventory").await, 0);
    }

    #[tokio::test]
    async fn unknown_collection_and_schema() {
        let ds = store();
        assert!(matches!(
            ds.execute("u1", ToolRequest::read("recipes")).await,
            Err(ToolError::UnknownCollection(_))
        ));
        let schema = ds.schema("inventory").await.unwrap();
        assert_eq!(schema["name"], "inventory");
        assert_eq!(ds.collections(), vec!["inventory"]);
    }
}
