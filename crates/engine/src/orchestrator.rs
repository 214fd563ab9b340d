//! The turn engine: one user message in, one committed turn out.

use crate::bypass::{self, ExitHandoff};
use crate::client::ModelClient;
use crate::commit::{SessionCommitter, TurnDraft};
use crate::context::{ContextBuilder, StageContext};
use crate::error::EngineError;
use crate::escalation::{EscalationPolicy, ReplanScope, Resolution, apology};
use crate::executor::{StepEnd, StepExecutor, StepRun};
use crate::results::StepResults;
use crate::stage::Stage;
use crate::stages::plan::{plan, replan};
use crate::stages::reply::{ComposedReply, reply};
use crate::stages::route::route;
use crate::stages::summarize::{assistant_summary, summarize};
use crate::stages::understand::understand;
use crate::tiers::step_complexity;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use turnkeep_config::{AppConfig, PIPELINE_MODE};
use turnkeep_core::action::BlockedSignal;
use turnkeep_core::event::{EventBus, ProgressEvent};
use turnkeep_core::history::{ConversationTurn, RoutingDecision};
use turnkeep_core::pending::{PendingKind, PendingState};
use turnkeep_core::plan::{PlanDecision, PlannedStep};
use turnkeep_core::provider::Provider;
use turnkeep_core::reasoning::{
    ConversationPhase, CurationSummary, StepExecutionSummary, TurnExecutionSummary,
};
use turnkeep_core::session::{SessionKey, SessionStore};
use turnkeep_core::tool::Datastore;

/// One user message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnRequest {
    pub message: String,

    /// Bypass mode to run in. `None` or `"pipeline"` runs the full pipeline,
    /// leaving any active mode first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    /// Mode-specific setup, passed to the mode's prompt as given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode_init: Option<Value>,
}

impl TurnRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            mode: None,
            mode_init: None,
        }
    }

    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn with_mode_init(mut self, init: Value) -> Self {
        self.mode_init = Some(init);
        self
    }
}

/// A committed turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnResult {
    pub turn_number: u32,
    pub reply: String,
    pub phase: ConversationPhase,
    /// Mode the session is in after this turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Set when this turn left a bypass mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handoff: Option<ExitHandoff>,
    /// Session document version written by this turn.
    pub version: u64,
}

/// What executing a direct plan produced.
#[derive(Debug, Default)]
struct PlanRun {
    steps: Vec<StepExecutionSummary>,
    conclusions: Vec<String>,
    phase: ConversationPhase,
    /// Set when the turn ends without composing a reply.
    terminal_reply: Option<String>,
    pending: Option<PendingState>,
}

impl PlanRun {
    fn ask(&mut self, question: String, context: &str, turn: u32) {
        self.phase = ConversationPhase::Clarifying;
        self.pending = Some(PendingState {
            kind: PendingKind::Clarify,
            context: context.to_string(),
            questions: vec![question.clone()],
            proposed_steps: Vec::new(),
            created_turn: turn,
        });
        self.terminal_reply = Some(question);
    }

    fn fail(&mut self, message: String) {
        self.phase = ConversationPhase::Blocked;
        self.terminal_reply = Some(message);
    }
}

/// Runs turns against one provider, datastore and session store.
pub struct TurnEngine {
    config: Arc<AppConfig>,
    client: ModelClient,
    executor: StepExecutor,
    committer: SessionCommitter,
}

impl TurnEngine {
    pub fn new(
        config: Arc<AppConfig>,
        provider: Arc<dyn Provider>,
        datastore: Arc<dyn Datastore>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        let client = ModelClient::new(provider, config.clone());
        Self {
            executor: StepExecutor::new(client.clone(), datastore),
            committer: SessionCommitter::new(store),
            client,
            config,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        self.committer.store()
    }

    /// Run one turn and commit it.
    ///
    /// Publishes `done` with the reply on success and `error` with a
    /// user-facing message on failure. A failed turn commits nothing.
    pub async fn run_turn(
        &self,
        key: &SessionKey,
        request: TurnRequest,
        bus: &EventBus,
    ) -> Result<TurnResult, EngineError> {
        match self.execute_turn(key, request, bus).await {
            Ok(result) => {
                bus.publish(ProgressEvent::Done {
                    turn_number: result.turn_number,
                    reply: result.reply.clone(),
                });
                Ok(result)
            }
            Err(e) => {
                error!(session = %key, error = %e, "Turn failed");
                bus.publish(ProgressEvent::Error {
                    message: e.user_message(),
                });
                Err(e)
            }
        }
    }

    async fn execute_turn(
        &self,
        key: &SessionKey,
        request: TurnRequest,
        bus: &EventBus,
    ) -> Result<TurnResult, EngineError> {
        let mode = match request.mode.as_deref().filter(|m| *m != PIPELINE_MODE) {
            Some(name) => Some(
                self.config
                    .engine
                    .mode(name)
                    .cloned()
                    .ok_or_else(|| EngineError::UnknownMode(name.to_string()))?,
            ),
            None => None,
        };

        let mut draft = self.committer.begin(key).await?;
        let turn = draft.turn();
        info!(
            session = %key,
            turn,
            mode = mode.as_ref().map_or(PIPELINE_MODE, |m| m.name.as_str()),
            "Turn started"
        );

        let mut handoff = None;
        let active = draft.doc().active_mode.clone();
        if active.is_some() && active.as_deref() != mode.as_ref().map(|m| m.name.as_str()) {
            stage_started(bus, Stage::Handoff);
            handoff = bypass::exit_mode(&self.client, &mut draft).await?;
        }

        let (reply, phase) = match &mode {
            Some(mode) => {
                stage_started(bus, Stage::Bypass);
                let reply = bypass::run_bypass(
                    &self.client,
                    &mut draft,
                    mode,
                    &request.message,
                    request.mode_init.as_ref(),
                    bus,
                )
                .await?;
                (reply, ConversationPhase::Conversing)
            }
            None => self.run_pipeline(&mut draft, &request.message, bus).await?,
        };

        draft.finish(Some(&reply));
        let doc = self.committer.commit(draft).await?;
        info!(session = %key, turn, phase = phase.as_str(), version = doc.version, "Turn finished");

        Ok(TurnResult {
            turn_number: turn,
            reply,
            phase,
            mode: doc.active_mode.clone(),
            handoff,
            version: doc.version,
        })
    }

    async fn run_pipeline(
        &self,
        draft: &mut TurnDraft,
        message: &str,
        bus: &EventBus,
    ) -> Result<(String, ConversationPhase), EngineError> {
        let engine = &self.config.engine;
        let turn = draft.turn();

        // ── Route ─────────────────────────────────────────────────────────
        stage_started(bus, Stage::Route);
        let ctx = ContextBuilder::new(draft.doc(), engine, turn).for_routing();
        context_ready(bus, &ctx);
        let routing = route(&self.client, &ctx, message).await?;

        // ── Understand ────────────────────────────────────────────────────
        let mut curation = CurationSummary::default();
        if !draft.doc().registry.is_empty() {
            stage_started(bus, Stage::Understand);
            let ctx = ContextBuilder::new(draft.doc(), engine, turn).for_curation();
            context_ready(bus, &ctx);
            let decision = understand(&self.client, &ctx, message).await?;
            if !decision.is_empty() {
                let outcome = draft.apply_curation(&decision.retained(), &decision.demoted());
                if !outcome.unknown.is_empty() {
                    debug!(unknown = ?outcome.unknown, "Curation named unknown tokens");
                }
                curation = outcome.into();
            }
        }

        // ── Plan ──────────────────────────────────────────────────────────
        stage_started(bus, Stage::Plan);
        let collections = self.scope_collections(&routing);
        let ctx = ContextBuilder::new(draft.doc(), engine, turn).for_planning(&routing, &collections);
        context_ready(bus, &ctx);
        let decision = plan(&self.client, &ctx, message).await?;

        // ── Execute ───────────────────────────────────────────────────────
        let goal;
        let mut run = PlanRun::default();
        match decision {
            PlanDecision::Clarify { context, questions } => {
                draft.set_pending(Some(PendingState {
                    kind: PendingKind::Clarify,
                    context: context.clone(),
                    questions,
                    proposed_steps: Vec::new(),
                    created_turn: turn,
                }));
                run.phase = ConversationPhase::Clarifying;
                goal = context;
            }
            PlanDecision::Propose {
                goal: proposed,
                assumptions,
                steps,
            } => {
                draft.set_pending(Some(PendingState {
                    kind: PendingKind::Propose,
                    context: proposed.clone(),
                    questions: assumptions,
                    proposed_steps: steps,
                    created_turn: turn,
                }));
                run.phase = ConversationPhase::Proposing;
                goal = proposed;
            }
            PlanDecision::Direct { goal: direct, steps } => {
                draft.set_pending(None);
                run = self
                    .execute_plan(draft, message, &routing, &collections, steps, bus)
                    .await?;
                if let Some(pending) = run.pending.clone() {
                    draft.set_pending(Some(pending));
                }
                goal = direct;
            }
        }

        // ── Reply ─────────────────────────────────────────────────────────
        let composed = match run.terminal_reply.take() {
            Some(text) => ComposedReply {
                text,
                tone: "neutral".into(),
            },
            None => {
                stage_started(bus, Stage::Reply);
                let ctx = ContextBuilder::new(draft.doc(), engine, turn).for_reply(
                    &run.steps,
                    &run.conclusions,
                    run.phase,
                );
                context_ready(bus, &ctx);
                reply(&self.client, &ctx, message).await?
            }
        };

        // ── Summarize ─────────────────────────────────────────────────────
        stage_started(bus, Stage::Summarize);
        let short = assistant_summary(&composed.text);
        let record = ConversationTurn {
            turn_number: turn,
            user_text: message.to_string(),
            assistant_summary: short.clone(),
            routing,
            timestamp: Some(Utc::now()),
        };
        let summary = TurnExecutionSummary {
            turn_number: turn,
            user_message: message.to_string(),
            goal,
            steps: run.steps,
            curation,
            analysis_conclusions: run.conclusions,
            response_summary: short,
            conversation_phase: run.phase,
            tone: composed.tone,
        };
        summarize(&self.client, draft, record, summary).await;

        Ok((composed.text, run.phase))
    }

    /// Run a direct plan's steps in order, escalating blocked ones.
    async fn execute_plan(
        &self,
        draft: &mut TurnDraft,
        message: &str,
        routing: &RoutingDecision,
        collections: &[String],
        mut steps: Vec<PlannedStep>,
        bus: &EventBus,
    ) -> Result<PlanRun, EngineError> {
        let engine = &self.config.engine;
        let turn = draft.turn();
        let mut policy = EscalationPolicy::new(engine.limits.max_replans_per_turn);
        let mut results = StepResults::new();
        let mut run = PlanRun {
            phase: if steps.is_empty() {
                ConversationPhase::Conversing
            } else {
                ConversationPhase::Executing
            },
            ..PlanRun::default()
        };

        let mut index = 0;
        while index < steps.len() {
            let step = steps[index].clone();
            let tier = step_complexity(&self.config, &step);
            info!(step = index, tier = tier.as_str(), subdomain = %step.subdomain, "Step started");
            bus.publish(ProgressEvent::StepStarted {
                index,
                description: step.description.clone(),
                tier: tier.as_str().into(),
            });

            let step_run = match self
                .executor
                .run_step(draft, index, &step, &run.steps, &mut results, message)
                .await
            {
                Ok(step_run) => step_run,
                // Writes already made must reach the session, so end the turn instead
                Err(EngineError::Provider(e)) if !writes_this_turn(draft).is_empty() => {
                    warn!(step = index, error = %e, "Provider failed after datastore writes, ending turn");
                    let unreported = writes_this_turn(draft)
                        .into_iter()
                        .filter(|t| !run.steps.iter().any(|s| s.entities_affected.contains(t)))
                        .collect();
                    StepRun {
                        entities_affected: unreported,
                        end: StepEnd::Failed(
                            "the assistant stopped responding partway through; the changes listed so far were saved"
                                .into(),
                        ),
                        tool_calls: 0,
                    }
                }
                Err(e) => return Err(e),
            };
            let summary = step_run.summary(&step);
            bus.publish(ProgressEvent::StepFinished {
                index,
                outcome: summary.outcome.as_str().into(),
                note: summary.note.clone(),
            });
            run.steps.push(summary);

            match step_run.end {
                StepEnd::Completed { conclusions, .. } => {
                    run.conclusions.extend(conclusions);
                    index += 1;
                }
                StepEnd::AskedUser(question) => {
                    run.ask(question, &step.description, turn);
                    break;
                }
                StepEnd::Failed(reason) => {
                    run.fail(apology(&reason));
                    break;
                }
                StepEnd::Blocked(signal) => match policy.resolve(&signal, index) {
                    Resolution::AskUser(question) => {
                        run.ask(question, &step.description, turn);
                        break;
                    }
                    Resolution::Fail(text) => {
                        run.fail(text);
                        break;
                    }
                    Resolution::Replan(scope) => {
                        stage_started(bus, Stage::Plan);
                        let ctx = ContextBuilder::new(draft.doc(), engine, turn)
                            .for_planning(routing, collections);
                        let blocked = render_blocked(index, &steps, &signal, scope);
                        match replan(&self.client, ctx, &blocked, message).await? {
                            Some(PlanDecision::Direct {
                                steps: replacement, ..
                            }) => {
                                splice(&mut steps, index, scope, replacement);
                                let max = engine.limits.max_steps_per_plan.max(index);
                                if steps.len() > max {
                                    warn!(steps = steps.len(), max, "Replanned steps over the cap, truncating");
                                    steps.truncate(max);
                                }
                            }
                            Some(PlanDecision::Clarify { questions, context }) => {
                                let question = questions.into_iter().next().unwrap_or(context);
                                run.ask(question, &step.description, turn);
                                break;
                            }
                            Some(PlanDecision::Propose { goal, .. }) => {
                                run.ask(
                                    format!("Before I go on: should I {goal}?"),
                                    &step.description,
                                    turn,
                                );
                                break;
                            }
                            None => {
                                run.fail(apology(&signal.details));
                                break;
                            }
                        }
                    }
                },
            }
        }
        Ok(run)
    }

    /// Collections the routed subdomains may touch.
    fn scope_collections(&self, routing: &RoutingDecision) -> Vec<String> {
        let mut collections: Vec<String> = Vec::new();
        for subdomain in &routing.scope {
            for collection in self.executor.collections_for(subdomain) {
                if !collections.contains(&collection) {
                    collections.push(collection);
                }
            }
        }
        collections
    }
}

/// Replace the blocked step at `index`, or everything from it on.
/// Tokens written to the datastore during this turn.
fn writes_this_turn(draft: &TurnDraft) -> Vec<String> {
    draft
        .doc()
        .registry
        .iter()
        .filter(|e| e.turn_last_referenced == draft.turn() && e.status.is_write())
        .map(|e| e.ref_token.clone())
        .collect()
}

fn splice(
    steps: &mut Vec<PlannedStep>,
    index: usize,
    scope: ReplanScope,
    replacement: Vec<PlannedStep>,
) {
    let end = match scope {
        ReplanScope::CurrentStep => index + 1,
        ReplanScope::RemainingPlan => steps.len(),
    };
    steps.splice(index..end, replacement);
}

fn render_blocked(
    index: usize,
    steps: &[PlannedStep],
    signal: &BlockedSignal,
    scope: ReplanScope,
) -> String {
    let mut body = format!(
        "Step {} ({}) is blocked: {:?}. {}",
        index + 1,
        steps[index].description,
        signal.reason_code,
        signal.details
    );
    match scope {
        ReplanScope::CurrentStep => {
            body.push_str("\nReplace this step only. These steps follow it and stay as they are:");
            for (i, step) in steps.iter().enumerate().skip(index + 1) {
                body.push_str(&format!("\n{}. {}", i + 1, step.description));
            }
        }
        ReplanScope::RemainingPlan => {
            body.push_str(
                "\nAn earlier step's assumption no longer holds. Replace this step and every step after it.",
            );
        }
    }
    body
}

fn stage_started(bus: &EventBus, stage: Stage) {
    debug!(stage = stage.as_str(), "Stage started");
    bus.publish(ProgressEvent::StageStarted {
        stage: stage.as_str().into(),
    });
}

fn context_ready(bus: &EventBus, ctx: &StageContext) {
    let estimated_tokens = ctx.estimated_tokens();
    debug!(stage = ctx.stage.as_str(), estimated_tokens, "Context ready");
    bus.publish(ProgressEvent::ContextReady {
        stage: ctx.stage.as_str().into(),
        estimated_tokens,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ScriptedProvider;
    use serde_json::json;
    use turnkeep_core::plan::StepType;
    use turnkeep_store::InMemorySessionStore;
    use turnkeep_tools::{CollectionSchema, FieldKind, InMemoryDatastore};

    fn datastore() -> InMemoryDatastore {
        InMemoryDatastore::new(vec![
            CollectionSchema::new("inventory")
                .with_field("name", FieldKind::Text, true)
                .with_field("quantity", FieldKind::Number, false),
        ])
    }

    fn engine(provider: Arc<ScriptedProvider>, store: InMemoryDatastore) -> TurnEngine {
        TurnEngine::new(
            Arc::new(AppConfig::default()),
            provider,
            Arc::new(store),
            Arc::new(InMemorySessionStore::new()),
        )
    }

    const READ_PLAN: &str = r#"{"decision": "direct", "goal": "show pantry", "steps": [
        {"description": "Read inventory", "step_type": "read"}]}"#;
    const READ_CALL: &str = r#"{"action": "tool_call", "op": "read", "collection": "inventory"}"#;
    const DONE: &str = r#"{"action": "step_complete", "note": "listed items"}"#;

    #[tokio::test]
    async fn direct_plan_runs_steps_and_commits_once() {
        let store = datastore();
        store
            .seed("u1", "inventory", vec![json!({"name": "Rice"}), json!({"name": "Cod"})])
            .await;
        let provider = Arc::new(
            ScriptedProvider::new()
                .script(Stage::Plan, [READ_PLAN])
                .script(Stage::Execute, [READ_CALL, DONE])
                .script(Stage::Reply, [r#"{"reply": "You have rice and cod.", "tone": "helpful"}"#]),
        );
        let engine = engine(provider.clone(), store);
        let key = SessionKey::new("u1", "s1");
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let result = engine
            .run_turn(&key, TurnRequest::new("what's in my pantry?"), &bus)
            .await
            .unwrap();
        assert_eq!(result.reply, "You have rice and cod.");
        assert_eq!(result.phase, ConversationPhase::Executing);
        assert_eq!(result.version, 1);

        let doc = engine.store().load(&key).await.unwrap().unwrap();
        assert_eq!(doc.registry.len(), 2);
        assert_eq!(doc.turn_count, 1);
        assert_eq!(doc.reasoning.recent[0].tone, "helpful");
        assert_eq!(doc.reasoning.recent[0].steps[0].entities_affected.len(), 2);

        // No curation on an empty registry
        assert!(provider.requests_for(Stage::Understand).is_empty());

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(event.event_type());
        }
        assert!(kinds.contains(&"step_started"));
        assert_eq!(kinds.last(), Some(&"done"));
    }

    #[tokio::test]
    async fn clarify_sets_pending_and_direct_clears_it() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .script(
                    Stage::Plan,
                    [r#"{"decision": "clarify", "context": "meal plan", "questions": ["How many people?"]}"#],
                )
                .script(Stage::Reply, ["How many people are eating?"]),
        );
        let engine = engine(provider, datastore());
        let key = SessionKey::new("u1", "s1");

        let first = engine
            .run_turn(&key, TurnRequest::new("plan my week"), &EventBus::default())
            .await
            .unwrap();
        assert_eq!(first.phase, ConversationPhase::Clarifying);
        let doc = engine.store().load(&key).await.unwrap().unwrap();
        assert_eq!(doc.pending.as_ref().unwrap().kind, PendingKind::Clarify);

        // Default plan reply is a direct empty plan
        let second = engine
            .run_turn(&key, TurnRequest::new("two"), &EventBus::default())
            .await
            .unwrap();
        assert_eq!(second.phase, ConversationPhase::Conversing);
        let doc = engine.store().load(&key).await.unwrap().unwrap();
        assert!(doc.pending.is_none());
        assert_eq!(doc.turn_count, 2);
    }

    #[tokio::test]
    async fn blocked_step_is_replanned_in_place() {
        let store = datastore();
        store.seed("u1", "inventory", vec![json!({"name": "Rice"})]).await;
        let provider = Arc::new(
            ScriptedProvider::new()
                .script(
                    Stage::Plan,
                    [
                        READ_PLAN,
                        r#"{"decision": "direct", "steps": [{"description": "Read inventory by name", "step_type": "read"}]}"#,
                    ],
                )
                .script(
                    Stage::Execute,
                    [
                        r#"{"action": "blocked", "reason_code": "PLAN_INVALID", "details": "wrong approach", "suggested_next": "replan"}"#,
                        READ_CALL,
                        DONE,
                    ],
                ),
        );
        let engine = engine(provider.clone(), store);
        let key = SessionKey::new("u1", "s1");
        let result = engine
            .run_turn(&key, TurnRequest::new("check rice"), &EventBus::default())
            .await
            .unwrap();
        assert_eq!(result.phase, ConversationPhase::Executing);

        let doc = engine.store().load(&key).await.unwrap().unwrap();
        let steps = &doc.reasoning.recent[0].steps;
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].outcome.as_str(), "blocked");
        assert_eq!(steps[1].description, "Read inventory by name");
        assert_eq!(steps[1].outcome.as_str(), "completed");

        let replan_request = &provider.requests_for(Stage::Plan)[1];
        assert!(replan_request.messages[0].content.contains("[Blocked]"));
    }

    #[tokio::test]
    async fn explicit_fail_ends_turn_without_reply_stage() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .script(Stage::Plan, [READ_PLAN])
                .script(Stage::Execute, [r#"{"action": "fail", "reason": "the pantry is offline"}"#]),
        );
        let engine = engine(provider.clone(), datastore());
        let result = engine
            .run_turn(&SessionKey::new("u1", "s1"), TurnRequest::new("x"), &EventBus::default())
            .await
            .unwrap();
        assert_eq!(result.phase, ConversationPhase::Blocked);
        assert!(result.reply.contains("the pantry is offline"));
        assert!(provider.requests_for(Stage::Reply).is_empty());
    }

    #[tokio::test]
    async fn provider_failure_commits_nothing() {
        let provider = Arc::new(ScriptedProvider::new().failing(Stage::Plan));
        let engine = engine(provider, datastore());
        let key = SessionKey::new("u1", "s1");
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        assert!(engine.run_turn(&key, TurnRequest::new("x"), &bus).await.is_err());
        assert!(engine.store().load(&key).await.unwrap().is_none());

        let mut last = None;
        while let Ok(event) = rx.try_recv() {
            last = Some(event);
        }
        assert!(matches!(
            last.as_deref(),
            Some(ProgressEvent::Error { .. })
        ));
    }

    #[tokio::test]
    async fn provider_loss_after_a_write_still_commits_it() {
        let plan = r#"{"decision": "direct", "goal": "restock", "steps": [
            {"description": "Add oats", "step_type": "create"},
            {"description": "Check stock", "step_type": "read"}]}"#;
        let create = r#"{"action": "tool_call", "op": "create", "collection": "inventory", "data": {"name": "Oats", "quantity": 2}}"#;
        let provider = Arc::new(
            ScriptedProvider::new()
                .script(Stage::Plan, [plan])
                .script(Stage::Execute, [create, DONE])
                .failing_after_script(Stage::Execute),
        );
        let engine = engine(provider.clone(), datastore());
        let key = SessionKey::new("u1", "s1");

        let result = engine
            .run_turn(&key, TurnRequest::new("add oats"), &EventBus::default())
            .await
            .unwrap();
        assert_eq!(result.phase, ConversationPhase::Blocked);
        assert!(result.reply.contains("were saved"));
        assert!(provider.requests_for(Stage::Reply).is_empty());

        let doc = engine.store().load(&key).await.unwrap().unwrap();
        assert_eq!(doc.turn_count, 1);
        let oats = doc.registry.get("inventory_1").unwrap();
        assert_eq!(oats.status, turnkeep_core::entity::EntityStatus::Created);
        let steps = &doc.reasoning.recent[0].steps;
        assert_eq!(steps[0].entities_affected, vec!["inventory_1"]);
        assert_eq!(steps[1].outcome.as_str(), "failed");
    }

    #[tokio::test]
    async fn bypass_mode_skips_pipeline_and_hands_off_on_exit() {
        let provider = Arc::new(ScriptedProvider::new());
        let engine = engine(provider.clone(), datastore());
        let key = SessionKey::new("u1", "s1");

        let chat = engine
            .run_turn(&key, TurnRequest::new("hi").with_mode("freeform"), &EventBus::default())
            .await
            .unwrap();
        assert_eq!(chat.reply, "Happy to chat.");
        assert_eq!(chat.mode.as_deref(), Some("freeform"));
        assert!(provider.requests_for(Stage::Route).is_empty());

        let back = engine
            .run_turn(&key, TurnRequest::new("what's in stock?"), &EventBus::default())
            .await
            .unwrap();
        assert!(back.mode.is_none());
        assert_eq!(back.handoff.unwrap().summary, "Chatted freely.");

        let doc = engine.store().load(&key).await.unwrap().unwrap();
        assert!(doc.history.history_summary.contains("In freeform mode: Chatted freely."));
        assert!(doc.mode_transcript.is_empty());
    }

    #[tokio::test]
    async fn unknown_mode_is_rejected() {
        let engine = engine(Arc::new(ScriptedProvider::new()), datastore());
        let err = engine
            .run_turn(
                &SessionKey::new("u1", "s1"),
                TurnRequest::new("x").with_mode("karaoke"),
                &EventBus::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownMode(_)));
    }

    #[test]
    fn splice_respects_scope() {
        let step = |d: &str| PlannedStep {
            description: d.into(),
            subdomain: "general".into(),
            step_type: StepType::Read,
            complexity: None,
        };
        let mut steps = vec![step("a"), step("b"), step("c")];
        splice(&mut steps, 1, ReplanScope::CurrentStep, vec![step("b2")]);
        let names: Vec<_> = steps.iter().map(|s| s.description.as_str()).collect();
        assert_eq!(names, vec!["a", "b2", "c"]);

        splice(&mut steps, 1, ReplanScope::RemainingPlan, vec![step("x")]);
        let names: Vec<_> = steps.iter().map(|s| s.description.as_str()).collect();
        assert_eq!(names, vec!["a", "x"]);
    }
}
