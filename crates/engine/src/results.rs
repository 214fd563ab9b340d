//! Step result cache.
//!
//! Records returned by datastore calls stay resident for the rest of the
//! turn so later steps can use them without reading again. Each record is
//! shown to the model with its `_ref` token in place of the raw id.

use crate::context::token::estimate_tokens;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use turnkeep_core::tool::ToolOp;

/// One datastore call's result as the model sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepResult {
    Records {
        step: usize,
        table: String,
        op: ToolOp,
        records: Vec<Value>,
    },
    /// Stand-in left behind by mid-execution compression.
    Summarized {
        step: usize,
        table: String,
        count: usize,
        sample_ids: Vec<String>,
        summary: String,
    },
}

impl StepResult {
    pub fn step(&self) -> usize {
        match self {
            Self::Records { step, .. } | Self::Summarized { step, .. } => *step,
        }
    }

    pub fn is_summarized(&self) -> bool {
        matches!(self, Self::Summarized { .. })
    }

    fn render(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepResults {
    entries: Vec<StepResult>,
}

impl StepResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, result: StepResult) {
        self.entries.push(result);
    }

    pub fn entries(&self) -> &[StepResult] {
        &self.entries
    }

    pub(crate) fn entries_mut(&mut self) -> &mut Vec<StepResult> {
        &mut self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One JSON line per result, oldest first.
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(StepResult::render)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.render())
    }
}
