//! The step action protocol.
//!
//! Inside a step the model must answer with exactly one of these actions.
//! Anything that does not parse into a [`StepAction`] is sent back for repair
//! and never executed.

use crate::tool::ToolRequest;
use serde::{Deserialize, Serialize};

/// Content produced by a generate step, registered as a `generated` entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub entity_type: String,
    pub label: String,
    #[serde(default)]
    pub content: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum StepAction {
    /// Run one datastore operation and feed the result back.
    #[serde(alias = "tool", alias = "call_tool")]
    ToolCall(ToolRequest),

    /// The step is done.
    #[serde(alias = "complete", alias = "done")]
    StepComplete {
        #[serde(default)]
        note: String,
        #[serde(default)]
        generated: Vec<GeneratedContent>,
        #[serde(default)]
        conclusions: Vec<String>,
    },

    /// Ask for a collection's schema before calling it.
    #[serde(alias = "schema")]
    RequestSchema { collection: String },

    /// End the turn with a question to the user.
    #[serde(alias = "ask")]
    AskUser { question: String },

    /// The step cannot proceed as planned.
    Blocked(BlockedSignal),

    /// The step cannot succeed at all.
    Fail {
        #[serde(default)]
        reason: String,
    },
}

impl StepAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ToolCall(_) => "tool_call",
            Self::StepComplete { .. } => "step_complete",
            Self::RequestSchema { .. } => "request_schema",
            Self::AskUser { .. } => "ask_user",
            Self::Blocked(_) => "blocked",
            Self::Fail { .. } => "fail",
        }
    }

    /// Whether this action ends the step sub-loop.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::ToolCall(_) | Self::RequestSchema { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockedReason {
    #[serde(alias = "insufficient_info")]
    InsufficientInfo,
    #[serde(alias = "plan_invalid")]
    PlanInvalid,
    #[serde(alias = "tool_failure")]
    ToolFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedNext {
    AskUser,
    Replan,
    Fail,
}

/// Structured "I am stuck" signal, raised by the model or forced by a cap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedSignal {
    pub reason_code: BlockedReason,
    #[serde(default)]
    pub details: String,
    pub suggested_next: SuggestedNext,
    /// Question to put to the user when the missing data is theirs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    /// Set when an earlier step's assumption turned out to be wrong.
    #[serde(default)]
    pub invalidates_earlier: bool,
}

impl BlockedSignal {
    pub fn new(
        reason_code: BlockedReason,
        details: impl Into<String>,
        suggested_next: SuggestedNext,
    ) -> Self {
        Self {
            reason_code,
            details: details.into(),
            suggested_next,
            question: None,
            invalidates_earlier: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolOp;

    #[test]
    fn tool_call_is_flattened_under_action_tag() {
        let action: StepAction = serde_json::from_value(serde_json::json!({
            "action": "tool_call",
            "op": "read",
            "collection": "inventory",
            "filters": [{"field": "name", "op": "contains", "value": "cod"}]
        }))
        .unwrap();
        let StepAction::ToolCall(request) = action else {
            panic!("expected tool call");
        };
        assert_eq!(request.op, ToolOp::Read);
        assert_eq!(request.filters.len(), 1);
    }

    #[test]
    fn blocked_uses_screaming_reason_codes() {
        let action = StepAction::Blocked(BlockedSignal::new(
            BlockedReason::PlanInvalid,
            "too many tool calls",
            SuggestedNext::Replan,
        ));
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "blocked");
        assert_eq!(json["reason_code"], "PLAN_INVALID");
        assert_eq!(json["suggested_next"], "replan");
    }

    #[test]
    fn aliases_and_terminal_flags() {
        let done: StepAction =
            serde_json::from_value(serde_json::json!({"action": "done", "note": "ok"})).unwrap();
        assert_eq!(done.name(), "step_complete");
        assert!(done.is_terminal());
        let schema: StepAction =
            serde_json::from_value(serde_json::json!({"action": "schema", "collection": "recipes"}))
                .unwrap();
        assert!(!schema.is_terminal());
    }
}
