//! Per-stage context builders.

use super::token::estimate_tokens;
use crate::results::StepResults;
use crate::stage::Stage;
use turnkeep_config::EngineConfig;
use turnkeep_core::entity::{EntityView, SnapshotMode};
use turnkeep_core::history::{ConversationTurn, RoutingDecision};
use turnkeep_core::plan::PlannedStep;
use turnkeep_core::reasoning::{ConversationPhase, StepExecutionSummary};
use turnkeep_core::session::SessionDocument;

/// One titled block of a stage context.
#[derive(Debug, Clone, PartialEq)]
pub struct ContextSection {
    pub title: &'static str,
    pub body: String,
}

/// The assembled view handed to one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageContext {
    pub stage: Stage,
    pub sections: Vec<ContextSection>,
}

impl StageContext {
    fn new(stage: Stage) -> Self {
        Self {
            stage,
            sections: Vec::new(),
        }
    }

    /// Add a section. Empty bodies are dropped.
    fn push(&mut self, title: &'static str, body: impl Into<String>) {
        let body = body.into();
        if !body.trim().is_empty() {
            self.sections.push(ContextSection { title, body });
        }
    }

    /// Append an extra section after the built ones.
    pub fn with_section(mut self, title: &'static str, body: impl Into<String>) -> Self {
        self.push(title, body);
        self
    }

    pub fn section(&self, title: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.title == title)
            .map(|s| s.body.as_str())
    }

    pub fn render(&self) -> String {
        self.sections
            .iter()
            .map(|s| format!("[{}]\n{}", s.title, s.body))
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.render())
    }
}

// Section titles, shared with the tests.
pub const ENTITIES: &str = "Entities";
pub const RECENT_TURNS: &str = "Recent Turns";
pub const HISTORY_SUMMARY: &str = "Earlier Conversation";
pub const PENDING: &str = "Pending";
pub const CURATION_HISTORY: &str = "Curation History";
pub const LAST_TURN: &str = "Last Turn";
pub const SUBDOMAINS: &str = "Subdomains";
pub const ROUTING: &str = "Routing";
pub const CURRENT_STEP: &str = "Current Step";
pub const STEPS_THIS_TURN: &str = "Steps This Turn";
pub const STEP_RESULTS: &str = "Step Results";
pub const COLLECTIONS: &str = "Collections";
pub const OUTCOMES: &str = "Outcomes";
pub const PHASE: &str = "Conversation Phase";

/// Builds stage contexts from one read-only view of the session.
pub struct ContextBuilder<'a> {
    doc: &'a SessionDocument,
    engine: &'a EngineConfig,
    turn: u32,
}

impl<'a> ContextBuilder<'a> {
    pub fn new(doc: &'a SessionDocument, engine: &'a EngineConfig, turn: u32) -> Self {
        Self { doc, engine, turn }
    }

    pub fn for_routing(&self) -> StageContext {
        let mut ctx = StageContext::new(Stage::Route);
        ctx.push(SUBDOMAINS, self.render_subdomains());
        ctx.push(RECENT_TURNS, self.render_recent());
        ctx.push(PENDING, self.render_pending());
        ctx
    }

    /// Everything the curation decision may touch, in every tier.
    pub fn for_curation(&self) -> StageContext {
        let mut ctx = StageContext::new(Stage::Understand);
        ctx.push(ENTITIES, self.render_entities(SnapshotMode::Curation));
        ctx.push(HISTORY_SUMMARY, self.doc.history.history_summary.clone());
        ctx.push(RECENT_TURNS, self.render_recent());
        ctx.push(PENDING, self.render_pending());

        let curation: Vec<String> = self
            .doc
            .reasoning
            .curation_history()
            .filter(|(_, c)| !c.retained.is_empty() || !c.demoted.is_empty())
            .map(|(turn, c)| {
                let retained: Vec<String> = c
                    .retained
                    .iter()
                    .map(|t| match c.reasons.get(t) {
                        Some(reason) => format!("{t} ({reason})"),
                        None => t.clone(),
                    })
                    .collect();
                format!(
                    "Turn {turn}: retained [{}], demoted [{}]",
                    retained.join(", "),
                    c.demoted.join(", ")
                )
            })
            .collect();
        ctx.push(CURATION_HISTORY, curation.join("\n"));
        ctx
    }

    /// Refs and labels only, so the planner knows what is resident without
    /// paying for payloads.
    pub fn for_planning(&self, routing: &RoutingDecision, collections: &[String]) -> StageContext {
        let mut ctx = StageContext::new(Stage::Plan);
        ctx.push(ROUTING, render_routing(routing));
        ctx.push(SUBDOMAINS, self.render_subdomains());
        ctx.push(COLLECTIONS, collections.join(", "));
        ctx.push(ENTITIES, self.render_entities(SnapshotMode::RefsAndLabels));
        ctx.push(HISTORY_SUMMARY, self.doc.history.history_summary.clone());
        ctx.push(RECENT_TURNS, self.render_recent());
        ctx.push(PENDING, self.render_pending());

        if let Some(last) = self.doc.reasoning.last() {
            let mut body = format!("Turn {} goal: {}", last.turn_number, last.goal);
            for step in &last.steps {
                body.push_str(&format!("\n{}", render_step(step)));
            }
            if !last.curation.demoted.is_empty() {
                body.push_str(&format!("\nSet aside: {}", last.curation.demoted.join(", ")));
            }
            if !last.curation.retained.is_empty() {
                body.push_str(&format!("\nKept in view: {}", last.curation.retained.join(", ")));
            }
            ctx.push(LAST_TURN, body);
        }
        ctx
    }

    /// Full payloads, recent turns, and only this turn's steps.
    pub fn for_execution(
        &self,
        index: usize,
        step: &PlannedStep,
        completed: &[StepExecutionSummary],
        results: &StepResults,
        collections: &[String],
    ) -> StageContext {
        let mut ctx = StageContext::new(Stage::Execute);
        ctx.push(
            CURRENT_STEP,
            format!(
                "Step {}: {} (type: {}, subdomain: {})",
                index + 1,
                step.description,
                step.step_type.as_str(),
                step.subdomain
            ),
        );
        ctx.push(COLLECTIONS, collections.join(", "));
        ctx.push(ENTITIES, self.render_entities(SnapshotMode::Full));
        ctx.push(RECENT_TURNS, self.render_recent());
        ctx.push(
            STEPS_THIS_TURN,
            completed.iter().map(render_step).collect::<Vec<_>>().join("\n"),
        );
        ctx.push(STEP_RESULTS, results.render());
        ctx
    }

    /// Labels only: the reply talks about things by name, never by token.
    pub fn for_reply(
        &self,
        outcomes: &[StepExecutionSummary],
        conclusions: &[String],
        phase: ConversationPhase,
    ) -> StageContext {
        let mut ctx = StageContext::new(Stage::Reply);
        ctx.push(ENTITIES, self.render_entities(SnapshotMode::LabelsOnly));
        ctx.push(HISTORY_SUMMARY, self.doc.history.history_summary.clone());
        ctx.push(RECENT_TURNS, self.render_recent());

        let mut body: Vec<String> = outcomes.iter().map(render_step).collect();
        body.extend(conclusions.iter().map(|c| format!("Conclusion: {c}")));
        ctx.push(OUTCOMES, body.join("\n"));
        ctx.push(PHASE, phase.as_str());
        ctx.push(PENDING, self.render_pending());
        ctx
    }

    // ── Renderers ─────────────────────────────────────────────────────────

    fn render_entities(&self, mode: SnapshotMode) -> String {
        let views = self.doc.registry.snapshot(
            mode,
            self.turn,
            self.engine.retention.entity_active_window,
        );
        render_views(&views)
    }

    fn render_recent(&self) -> String {
        render_turns(
            self.doc
                .history
                .last_turns(self.engine.retention.conversation_window),
        )
    }

    fn render_pending(&self) -> String {
        self.doc
            .pending
            .as_ref()
            .map(|p| p.render())
            .unwrap_or_default()
    }

    fn render_subdomains(&self) -> String {
        self.engine
            .subdomains
            .iter()
            .map(|s| {
                if s.description.is_empty() {
                    format!("- {}", s.name)
                } else {
                    format!("- {}: {}", s.name, s.description)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn render_views(views: &[EntityView]) -> String {
    views
        .iter()
        .filter_map(|v| serde_json::to_string(v).ok())
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_turns(turns: &[ConversationTurn]) -> String {
    turns
        .iter()
        .map(|t| {
            format!(
                "Turn {}\nUser: {}\nAssistant: {}",
                t.turn_number, t.user_text, t.assistant_summary
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_routing(routing: &RoutingDecision) -> String {
    if routing.intent.is_empty() {
        return String::new();
    }
    format!("Intent: {}\nScope: {}", routing.intent, routing.scope.join(", "))
}

fn render_step(step: &StepExecutionSummary) -> String {
    let mut line = format!("- {} [{}]", step.description, step.outcome.as_str());
    if !step.note.is_empty() {
        line.push_str(&format!(": {}", step.note));
    }
    if !step.entities_affected.is_empty() {
        line.push_str(&format!(" ({})", step.entities_affected.join(", ")));
    }
    line
}
