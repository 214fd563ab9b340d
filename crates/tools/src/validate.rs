//! Request validation and repair.
//!
//! Runs before every datastore call. Small, unambiguous problems are fixed
//! in place (model-supplied ids stripped, numeric strings coerced); anything
//! else comes back as `ToolError::InvalidArguments` with a message the model
//! can act on.

use crate::schema::{CollectionSchema, FieldKind};
use serde_json::{Map, Value};
use tracing::debug;
use turnkeep_core::error::ToolError;
use turnkeep_core::tool::{ToolOp, ToolRequest};

/// Fields the model may never set itself.
const RESERVED_FIELDS: &[&str] = &["id", "_id", "_ref", "user_id"];

pub fn validate_request(
    mut request: ToolRequest,
    schema: &CollectionSchema,
) -> Result<ToolRequest, ToolError> {
    for clause in &request.filters {
        if clause.field != "id" && schema.field(&clause.field).is_none() {
            return Err(unknown_field(schema, &clause.field));
        }
    }

    match request.op {
        ToolOp::Read => {}
        ToolOp::Create => {
            let data = request
                .data
                .take()
                .ok_or_else(|| ToolError::InvalidArguments("create needs a 'data' payload".into()))?;
            let repaired = match data {
                Value::Object(obj) => Value::Object(repair_object(obj, schema, true)?),
                Value::Array(items) => Value::Array(
                    items
                        .into_iter()
                        .map(|item| match item {
                            Value::Object(obj) => repair_object(obj, schema, true).map(Value::Object),
                            _ => Err(ToolError::InvalidArguments(
                                "create 'data' array must contain objects".into(),
                            )),
                        })
                        .collect::<Result<Vec<_>, _>>()?,
                ),
                _ => {
                    return Err(ToolError::InvalidArguments(
                        "create 'data' must be an object or an array of objects".into(),
                    ));
                }
            };
            request.data = Some(repaired);
        }
        ToolOp::Update => {
            require_filters(&request)?;
            let data = match request.data.take() {
                Some(Value::Object(obj)) => obj,
                _ => {
                    return Err(ToolError::InvalidArguments(
                        "update needs a 'data' object with the fields to change".into(),
                    ));
                }
            };
            request.data = Some(Value::Object(repair_object(data, schema, false)?));
        }
        ToolOp::Delete => require_filters(&request)?,
    }

    Ok(request)
}

fn require_filters(request: &ToolRequest) -> Result<(), ToolError> {
    if request.filters.is_empty() {
        return Err(ToolError::InvalidArguments(format!(
            "{} on '{}' needs at least one filter; refer to records by reference token",
            request.op.as_str(),
            request.collection
        )));
    }
    Ok(())
}

fn unknown_field(schema: &CollectionSchema, field: &str) -> ToolError {
    let known: Vec<&str> = schema.fields.iter().map(|f| f.name.as_str()).collect();
    ToolError::InvalidArguments(format!(
        "'{}' has no field '{field}'; known fields: {}",
        schema.name,
        known.join(", ")
    ))
}

fn repair_object(
    mut obj: Map<String, Value>,
    schema: &CollectionSchema,
    check_required: bool,
) -> Result<Map<String, Value>, ToolError> {
    for reserved in RESERVED_FIELDS {
        if obj.remove(*reserved).is_some() {
            debug!(collection = %schema.name, field = *reserved, "Stripped model-supplied identifier");
        }
    }

    for (name, value) in obj.iter_mut() {
        let field = schema.field(name).ok_or_else(|| unknown_field(schema, name))?;
        if field.kind == FieldKind::Number {
            if let Value::String(s) = value {
                if let Ok(n) = s.trim().parse::<f64>() {
                    *value = serde_json::json!(n);
                }
            }
        }
    }

    if check_required {
        let missing: Vec<&str> = schema
            .fields
            .iter()
            .filter(|f| f.required && !obj.contains_key(&f.name))
            .map(|f| f.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(ToolError::InvalidArguments(format!(
                "'{}' requires fields: {}",
                schema.name,
                missing.join(", ")
            )));
        }
    }

    Ok(obj)
}
