//! Datastore trait: the generic CRUD contract steps act through.
//!
//! The model only ever produces a [`ToolRequest`]: an operation, a collection,
//! filter clauses and a payload. Identifiers are the datastore's business.
//! Mutations come back with canonical ids that the engine registers and
//! hands to the model as reference tokens.

use crate::error::ToolError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOp {
    #[serde(alias = "get", alias = "list", alias = "query", alias = "select")]
    Read,
    #[serde(alias = "insert", alias = "add")]
    Create,
    #[serde(alias = "edit", alias = "patch")]
    Update,
    #[serde(alias = "remove")]
    Delete,
}

impl ToolOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Read)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    #[default]
    #[serde(alias = "=", alias = "==", alias = "equals")]
    Eq,
    #[serde(alias = "!=", alias = "ne")]
    Neq,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Gte,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Lte,
    #[serde(alias = "like", alias = "ilike")]
    Contains,
    In,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause {
    pub field: String,
    #[serde(default)]
    pub op: FilterOp,
    pub value: serde_json::Value,
}

impl FilterClause {
    pub fn eq(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }
}

/// One datastore operation as requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    pub op: ToolOp,
    #[serde(alias = "table")]
    pub collection: String,
    #[serde(default, alias = "where")]
    pub filters: Vec<FilterClause>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "payload")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl ToolRequest {
    pub fn read(collection: impl Into<String>) -> Self {
        Self {
            op: ToolOp::Read,
            collection: collection.into(),
            filters: Vec::new(),
            data: None,
            limit: None,
        }
    }

    pub fn with_filter(mut self, clause: FilterClause) -> Self {
        self.filters.push(clause);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Result of one datastore operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub op: ToolOp,
    pub collection: String,
    /// Records returned or affected, each carrying its canonical `id`.
    #[serde(default)]
    pub records: Vec<serde_json::Value>,
    /// Canonical ids of created, updated or deleted records.
    #[serde(default)]
    pub affected_ids: Vec<String>,
}

/// The datastore behind every `tool_call`.
///
/// Every call is scoped to one user; implementations must never let one
/// user's request see another user's records.
#[async_trait]
pub trait Datastore: Send + Sync {
    fn name(&self) -> &str;

    /// Collections this datastore serves.
    fn collections(&self) -> Vec<String>;

    /// Execute one operation on behalf of `user_id`.
    async fn execute(
        &self,
        user_id: &str,
        request: ToolRequest,
    ) -> std::result::Result<ToolOutput, ToolError>;

    /// Describe a collection's fields.
    async fn schema(&self, collection: &str) -> std::result::Result<serde_json::Value, ToolError>;
}
