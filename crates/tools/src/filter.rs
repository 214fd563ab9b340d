//! Filter clause evaluation against JSON records.

use serde_json::Value;
use std::cmp::Ordering;
use turnkeep_core::tool::{FilterClause, FilterOp};

/// Whether `record` satisfies every clause.
pub fn matches_all(record: &Value, clauses: &[FilterClause]) -> bool {
    clauses.iter().all(|c| matches(record, c))
}

pub fn matches(record: &Value, clause: &FilterClause) -> bool {
    let actual = record.get(&clause.field).unwrap_or(&Value::Null);
    match clause.op {
        FilterOp::Eq => loose_eq(actual, &clause.value),
        FilterOp::Neq => !loose_eq(actual, &clause.value),
        FilterOp::Gt => compare(actual, &clause.value) == Some(Ordering::Greater),
        FilterOp::Gte => matches!(
            compare(actual, &clause.value),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOp::Lt => compare(actual, &clause.value) == Some(Ordering::Less),
        FilterOp::Lte => matches!(
            compare(actual, &clause.value),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOp::Contains => contains(actual, &clause.value),
        FilterOp::In => match &clause.value {
            Value::Array(options) => options.iter().any(|o| loose_eq(actual, o)),
            other => loose_eq(actual, other),
        },
    }
}

/// Equality that treats strings case-insensitively and numbers numerically.
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x.eq_ignore_ascii_case(y),
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Number(x), Value::String(y)) | (Value::String(y), Value::Number(x)) => {
            y.parse::<f64>().ok() == x.as_f64()
        }
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => match (a.as_str(), b.as_str()) {
            // ISO dates compare correctly as strings
            (Some(x), Some(y)) => Some(x.cmp(y)),
            _ => None,
        },
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn contains(actual: &Value, needle: &Value) -> bool {
    match actual {
        Value::String(s) => needle
            .as_str()
            .is_some_and(|n| s.to_lowercase().contains(&n.to_lowercase())),
        Value::Array(items) => items.iter().any(|i| loose_eq(i, needle) || contains(i, needle)),
        _ => false,
    }
}
