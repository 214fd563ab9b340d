//! Deferred planning state carried across a turn boundary.

use crate::plan::PlannedStep;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingKind {
    Propose,
    Clarify,
}

/// A proposal awaiting confirmation or a question awaiting an answer.
///
/// Created when planning defers execution and cleared as soon as a later
/// turn's planning turns it into a direct plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingState {
    #[serde(rename = "type")]
    pub kind: PendingKind,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proposed_steps: Vec<PlannedStep>,
    pub created_turn: u32,
}

impl PendingState {
    pub fn render(&self) -> String {
        let mut out = match self.kind {
            PendingKind::Propose => format!("Awaiting confirmation of proposal: {}", self.context),
            PendingKind::Clarify => format!("Awaiting answers about: {}", self.context),
        };
        for question in &self.questions {
            out.push_str(&format!("\n- {question}"));
        }
        for (i, step) in self.proposed_steps.iter().enumerate() {
            out.push_str(&format!("\n{}. {}", i + 1, step.description));
        }
        out
    }
}
