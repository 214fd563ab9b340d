//! Reasoning trace: what the engine did on recent turns and why.
//!
//! The last few [`TurnExecutionSummary`] records are kept whole. Older ones
//! are folded, oldest first, into a single narrative that only grows.

use crate::entity::CurationOutcome;
use crate::plan::StepType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How a step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    AskedUser,
    Blocked,
    Failed,
    Skipped,
}

impl StepOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::AskedUser => "asked_user",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// Record of one finished step. Never modified after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecutionSummary {
    pub description: String,
    pub step_type: StepType,
    pub subdomain: String,
    pub outcome: StepOutcome,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub entities_affected: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurationSummary {
    #[serde(default)]
    pub retained: Vec<String>,
    #[serde(default)]
    pub demoted: Vec<String>,
    #[serde(default)]
    pub reasons: BTreeMap<String, String>,
}

impl From<CurationOutcome> for CurationSummary {
    fn from(outcome: CurationOutcome) -> Self {
        Self {
            retained: outcome.retained,
            demoted: outcome.demoted,
            reasons: outcome.reasons,
        }
    }
}

/// Where the conversation stands after a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationPhase {
    #[default]
    Conversing,
    Clarifying,
    Proposing,
    Executing,
    Blocked,
}

impl ConversationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conversing => "conversing",
            Self::Clarifying => "clarifying",
            Self::Proposing => "proposing",
            Self::Executing => "executing",
            Self::Blocked => "blocked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnExecutionSummary {
    pub turn_number: u32,
    pub user_message: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub steps: Vec<StepExecutionSummary>,
    #[serde(default)]
    pub curation: CurationSummary,
    #[serde(default)]
    pub analysis_conclusions: Vec<String>,
    #[serde(default)]
    pub response_summary: String,
    #[serde(default)]
    pub conversation_phase: ConversationPhase,
    #[serde(default)]
    pub tone: String,
}

impl TurnExecutionSummary {
    /// One deterministic line for the folded narrative.
    pub fn narrative_line(&self) -> String {
        let mut line = format!("Turn {}", self.turn_number);
        if !self.goal.is_empty() {
            line.push_str(&format!(" ({})", self.goal));
        }
        if !self.steps.is_empty() {
            let completed = self
                .steps
                .iter()
                .filter(|s| s.outcome == StepOutcome::Completed)
                .count();
            line.push_str(&format!(": {completed}/{} steps completed", self.steps.len()));
        }
        if !self.curation.demoted.is_empty() {
            line.push_str(&format!(", set aside {}", self.curation.demoted.join(", ")));
        }
        line.push_str(&format!(" [{}]", self.conversation_phase.as_str()));
        if !self.response_summary.is_empty() {
            line.push_str(&format!(" {}", self.response_summary));
        }
        if !line.ends_with('.') {
            line.push('.');
        }
        line
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningTrace {
    #[serde(default)]
    pub recent: Vec<TurnExecutionSummary>,
    #[serde(default)]
    pub reasoning_summary: String,
    /// Highest turn number already folded into `reasoning_summary`.
    #[serde(default)]
    pub compressed_through: u32,
}

impl ReasoningTrace {
    pub fn push(&mut self, summary: TurnExecutionSummary) {
        self.recent.push(summary);
    }

    pub fn last(&self) -> Option<&TurnExecutionSummary> {
        self.recent.last()
    }

    /// Fold everything beyond the newest `keep` summaries into the narrative.
    ///
    /// Returns the number of summaries folded. Calling it again with the
    /// same `keep` is a no-op.
    pub fn compress(&mut self, keep: usize) -> usize {
        let excess = self.recent.len().saturating_sub(keep);
        if excess == 0 {
            return 0;
        }
        let mut folded = 0;
        for summary in self.recent.drain(..excess) {
            if summary.turn_number <= self.compressed_through {
                continue;
            }
            if !self.reasoning_summary.is_empty() {
                self.reasoning_summary.push(' ');
            }
            self.reasoning_summary.push_str(&summary.narrative_line());
            self.compressed_through = summary.turn_number;
            folded += 1;
        }
        folded
    }

    /// Curation decisions from the summaries still held in full.
    pub fn curation_history(&self) -> impl Iterator<Item = (u32, &CurationSummary)> {
        self.recent.iter().map(|s| (s.turn_number, &s.curation))
    }
}
