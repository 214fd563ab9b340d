//! Planner output: what a turn intends to do.

use serde::{Deserialize, Serialize};

/// Kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    #[serde(alias = "query", alias = "lookup", alias = "fetch")]
    Read,
    #[serde(alias = "create", alias = "update", alias = "delete", alias = "mutate")]
    Write,
    #[serde(alias = "analyse", alias = "analysis", alias = "reason")]
    Analyze,
    #[serde(alias = "compose", alias = "draft", alias = "generation")]
    Generate,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Analyze => "analyze",
            Self::Generate => "generate",
        }
    }
}

/// Planner-assigned difficulty, mapped to a model tier before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    #[serde(alias = "easy", alias = "simple")]
    Low,
    #[serde(alias = "moderate", alias = "normal")]
    Medium,
    #[serde(alias = "hard", alias = "complex")]
    High,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// One step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub description: String,
    #[serde(default)]
    pub subdomain: String,
    #[serde(alias = "type")]
    pub step_type: StepType,
    /// Filled from the complexity rules when the planner leaves it out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complexity: Option<Complexity>,
}

/// The three ways planning can end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PlanDecision {
    /// Execute these steps now.
    #[serde(alias = "plan_direct", alias = "execute")]
    Direct {
        #[serde(default)]
        goal: String,
        #[serde(default)]
        steps: Vec<PlannedStep>,
    },
    /// Describe the plan and wait for confirmation.
    Propose {
        #[serde(default)]
        goal: String,
        #[serde(default)]
        assumptions: Vec<String>,
        #[serde(default)]
        steps: Vec<PlannedStep>,
    },
    /// Ask before planning further.
    Clarify {
        #[serde(default)]
        context: String,
        #[serde(default)]
        questions: Vec<String>,
    },
}

impl PlanDecision {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Direct { .. } => "direct",
            Self::Propose { .. } => "propose",
            Self::Clarify { .. } => "clarify",
        }
    }
}
