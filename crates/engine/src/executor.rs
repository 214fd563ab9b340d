//! Step execution: the bounded action loop inside one planned step.
//!
//! Each round the model sees the execution context plus this step's own
//! exchange so far and answers with one [`StepAction`]. The loop ends on
//! `step_complete`, `ask_user`, `blocked` or `fail`. It can also be forced
//! to end: more than `max_tool_calls_per_step` tool calls, or more than
//! `max_schema_requests_per_step` schema requests, ends the step as
//! `blocked(PLAN_INVALID)`.
//!
//! Both caps count totals for the step rather than runs of the same action,
//! so a model alternating `tool_call` and `request_schema` still hits one.

use crate::client::ModelClient;
use crate::commit::TurnDraft;
use crate::compression::compress_if_needed;
use crate::context::ContextBuilder;
use crate::context::token::estimate_messages_tokens;
use crate::error::EngineError;
use crate::parse::parse_step_action;
use crate::prompts;
use crate::results::{StepResult, StepResults};
use crate::stage::Stage;
use crate::tiers::step_complexity;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use turnkeep_core::action::{BlockedReason, BlockedSignal, StepAction, SuggestedNext};
use turnkeep_core::entity::{EntityRegistry, EntityStatus};
use turnkeep_core::error::ToolError;
use turnkeep_core::message::Message;
use turnkeep_core::plan::PlannedStep;
use turnkeep_core::reasoning::{StepExecutionSummary, StepOutcome};
use turnkeep_core::tool::{Datastore, ToolOp, ToolOutput, ToolRequest};
use turnkeep_tools::record_label;
use uuid::Uuid;

/// How a step ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StepEnd {
    Completed {
        note: String,
        conclusions: Vec<String>,
    },
    AskedUser(String),
    Blocked(BlockedSignal),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepRun {
    pub end: StepEnd,
    pub entities_affected: Vec<String>,
    pub tool_calls: usize,
}

impl StepRun {
    pub fn summary(&self, step: &PlannedStep) -> StepExecutionSummary {
        let (outcome, note) = match &self.end {
            StepEnd::Completed { note, .. } => (StepOutcome::Completed, note.clone()),
            StepEnd::AskedUser(q) => (StepOutcome::AskedUser, q.clone()),
            StepEnd::Blocked(signal) => (
                StepOutcome::Blocked,
                format!("{:?}: {}", signal.reason_code, signal.details),
            ),
            StepEnd::Failed(reason) => (StepOutcome::Failed, reason.clone()),
        };
        StepExecutionSummary {
            description: step.description.clone(),
            step_type: step.step_type,
            subdomain: step.subdomain.clone(),
            outcome,
            note,
            entities_affected: self.entities_affected.clone(),
        }
    }
}

/// Runs planned steps against the datastore.
#[derive(Clone)]
pub struct StepExecutor {
    client: ModelClient,
    datastore: Arc<dyn Datastore>,
}

impl StepExecutor {
    pub fn new(client: ModelClient, datastore: Arc<dyn Datastore>) -> Self {
        Self { client, datastore }
    }

    /// Collections a step in `subdomain` may touch.
    pub fn collections_for(&self, subdomain: &str) -> Vec<String> {
        self.client
            .config()
            .engine
            .subdomain(subdomain)
            .map(|s| s.collections.clone())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| self.datastore.collections())
    }

    pub async fn run_step(
        &self,
        draft: &mut TurnDraft,
        index: usize,
        step: &PlannedStep,
        completed: &[StepExecutionSummary],
        results: &mut StepResults,
        user_message: &str,
    ) -> Result<StepRun, EngineError> {
        let config = self.client.config();
        let engine = &config.engine;
        let limits = &engine.limits;
        let complexity = step_complexity(config, step);
        let collections = self.collections_for(&step.subdomain);

        let mut exchange: Vec<Message> = Vec::new();
        let mut affected: Vec<String> = Vec::new();
        let mut tool_calls = 0;
        let mut schema_requests = 0;

        let finish = |end: StepEnd, affected: Vec<String>, tool_calls: usize| StepRun {
            end,
            entities_affected: affected,
            tool_calls,
        };

        loop {
            let mut ctx = ContextBuilder::new(draft.doc(), engine, draft.turn())
                .for_execution(index, step, completed, results, &collections);
            let tokens = ctx.estimated_tokens() + estimate_messages_tokens(&exchange);
            if compress_if_needed(results, tokens, engine) > 0 {
                ctx = ContextBuilder::new(draft.doc(), engine, draft.turn())
                    .for_execution(index, step, completed, results, &collections);
            }

            let mut messages = ModelClient::messages(
                Stage::Execute,
                prompts::EXECUTE,
                Some(&ctx),
                format!("User's request: {user_message}"),
            );
            messages.extend(exchange.iter().cloned());

            let action = match self
                .client
                .structured(Stage::Execute, complexity, messages, parse_step_action)
                .await
            {
                Ok(action) => action,
                Err(EngineError::Unparseable { reason, .. }) => {
                    let signal = BlockedSignal::new(
                        BlockedReason::PlanInvalid,
                        format!("step produced no usable action: {reason}"),
                        SuggestedNext::Replan,
                    );
                    return Ok(finish(StepEnd::Blocked(signal), affected, tool_calls));
                }
                Err(e) => return Err(e),
            };
            debug!(step = index, action = action.name(), "Step action");
            let echoed = serde_json::to_string(&action).unwrap_or_default();

            let feedback = match action {
                StepAction::ToolCall(request) => {
                    tool_calls += 1;
                    if tool_calls > limits.max_tool_calls_per_step {
                        warn!(
                            step = index,
                            cap = limits.max_tool_calls_per_step,
                            "Tool call cap reached without step_complete"
                        );
                        let signal = BlockedSignal::new(
                            BlockedReason::PlanInvalid,
                            format!(
                                "more than {} tool calls without completing the step",
                                limits.max_tool_calls_per_step
                            ),
                            SuggestedNext::Replan,
                        );
                        return Ok(finish(StepEnd::Blocked(signal), affected, tool_calls));
                    }
                    match self
                        .call_tool(draft, index, request, &collections, results, &mut affected)
                        .await
                    {
                        Ok(feedback) => feedback,
                        Err(signal) => {
                            return Ok(finish(StepEnd::Blocked(signal), affected, tool_calls));
                        }
                    }
                }
                StepAction::RequestSchema { collection } => {
                    schema_requests += 1;
                    info!(
                        step = index,
                        subdomain = %step.subdomain,
                        %collection,
                        request = schema_requests,
                        "Schema requested"
                    );
                    if schema_requests > limits.max_schema_requests_per_step {
                        warn!(
                            step = index,
                            cap = limits.max_schema_requests_per_step,
                            "Schema request cap reached"
                        );
                        let signal = BlockedSignal::new(
                            BlockedReason::PlanInvalid,
                            format!(
                                "more than {} schema requests in one step",
                                limits.max_schema_requests_per_step
                            ),
                            SuggestedNext::Replan,
                        );
                        return Ok(finish(StepEnd::Blocked(signal), affected, tool_calls));
                    }
                    match self.datastore.schema(&collection).await {
                        Ok(schema) => format!("Schema for {collection}: {schema}"),
                        Err(e) => format!(
                            "No schema available: {e}. Collections: {}",
                            collections.join(", ")
                        ),
                    }
                }
                StepAction::StepComplete {
                    note,
                    generated,
                    conclusions,
                } => {
                    for item in generated {
                        let entity_type = entity_type_slug(&item.entity_type, "generated");
                        let id = format!("gen-{}", Uuid::new_v4());
                        let token =
                            draft.register(&entity_type, &id, &item.label, EntityStatus::Generated);
                        draft.set_payload(&token, item.content);
                        push_unique(&mut affected, token);
                    }
                    let end = StepEnd::Completed { note, conclusions };
                    return Ok(finish(end, affected, tool_calls));
                }
                StepAction::AskUser { question } => {
                    return Ok(finish(StepEnd::AskedUser(question), affected, tool_calls));
                }
                StepAction::Blocked(signal) => {
                    warn!(
                        step = index,
                        reason = ?signal.reason_code,
                        suggested = ?signal.suggested_next,
                        details = %signal.details,
                        "Step blocked"
                    );
                    return Ok(finish(StepEnd::Blocked(signal), affected, tool_calls));
                }
                StepAction::Fail { reason } => {
                    warn!(step = index, %reason, "Step failed");
                    return Ok(finish(StepEnd::Failed(reason), affected, tool_calls));
                }
            };

            exchange.push(Message::assistant(echoed));
            exchange.push(Message::user(feedback));
        }
    }

    /// Run one datastore call. Rejected arguments come back as feedback for
    /// the model; a datastore failure blocks the step.
    async fn call_tool(
        &self,
        draft: &mut TurnDraft,
        index: usize,
        request: ToolRequest,
        collections: &[String],
        results: &mut StepResults,
        affected: &mut Vec<String>,
    ) -> Result<String, BlockedSignal> {
        if !collections.iter().any(|c| c == &request.collection) {
            return Ok(format!(
                "'{}' is not available to this step. Collections: {}",
                request.collection,
                collections.join(", ")
            ));
        }

        let (request, used) = match resolve_refs(request, &draft.doc().registry) {
            Ok(resolved) => resolved,
            Err(e) => return Ok(rejected(&e)),
        };
        for token in &used {
            draft.touch(token);
        }

        let user_id = draft.key().user_id.clone();
        match self.datastore.execute(&user_id, request).await {
            Ok(output) => Ok(self.absorb(draft, index, output, results, affected)),
            Err(ToolError::ExecutionFailed { collection, reason }) => {
                warn!(step = index, %collection, %reason, "Datastore call failed");
                Err(BlockedSignal::new(
                    BlockedReason::ToolFailure,
                    format!("{collection}: {reason}"),
                    SuggestedNext::Replan,
                ))
            }
            Err(e) => {
                debug!(step = index, error = %e, "Datastore call rejected");
                Ok(rejected(&e))
            }
        }
    }

    /// Register returned records and cache them for the rest of the turn.
    fn absorb(
        &self,
        draft: &mut TurnDraft,
        index: usize,
        output: ToolOutput,
        results: &mut StepResults,
        affected: &mut Vec<String>,
    ) -> String {
        let engine = &self.client.config().engine;
        let entity_type = entity_type_slug(&engine.entity_type_for(&output.collection), "record");
        let status = match output.op {
            ToolOp::Read => EntityStatus::Read,
            ToolOp::Create => EntityStatus::Created,
            ToolOp::Update => EntityStatus::Updated,
            ToolOp::Delete => EntityStatus::Deleted,
        };

        let mut shown = Vec::with_capacity(output.records.len());
        let mut tokens = Vec::new();
        for mut record in output.records {
            let Some(id) = record.get("id").and_then(Value::as_str).map(str::to_string) else {
                shown.push(record);
                continue;
            };
            let mut label = record_label(&record);
            if label == id {
                label = entity_type.clone();
            }
            let token = draft.register(&entity_type, &id, &label, status);
            if let Value::Object(obj) = &mut record {
                obj.remove("id");
                obj.insert("_ref".into(), Value::String(token.clone()));
            }
            if output.op != ToolOp::Delete {
                draft.set_payload(&token, record.clone());
            }
            push_unique(&mut tokens, token);
            shown.push(record);
        }
        // Mutations may report ids without returning the records
        for id in &output.affected_ids {
            if draft.doc().registry.lookup(&entity_type, id).is_none() {
                let token = draft.register(&entity_type, id, &entity_type, status);
                push_unique(&mut tokens, token);
            }
        }

        for token in &tokens {
            push_unique(affected, token.clone());
        }

        let feedback = if tokens.is_empty() {
            format!("{} on {} returned no records.", output.op.as_str(), output.collection)
        } else {
            format!(
                "{} on {} returned {} record(s): {}. Full records are in [Step Results].",
                output.op.as_str(),
                output.collection,
                tokens.len(),
                tokens.join(", ")
            )
        };
        results.push(StepResult::Records {
            step: index,
            table: output.collection,
            op: output.op,
            records: shown,
        });
        feedback
    }
}

fn rejected(error: &ToolError) -> String {
    format!("That call was rejected: {error}. Correct it and try again.")
}

fn push_unique(list: &mut Vec<String>, token: String) {
    if !list.contains(&token) {
        list.push(token);
    }
}

/// Lowercase `[a-z0-9_]` entity type, so every issued token stays parseable.
fn entity_type_slug(raw: &str, fallback: &str) -> String {
    let slug: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        fallback.to_string()
    } else {
        slug.to_string()
    }
}

/// Replace ref tokens in a request with underlying ids.
///
/// Filters on `id` (or `_ref`/`ref`) must use known tokens. Elsewhere a
/// string is only replaced when it is a known token. Returns the tokens used.
pub fn resolve_refs(
    mut request: ToolRequest,
    registry: &EntityRegistry,
) -> Result<(ToolRequest, Vec<String>), ToolError> {
    let mut used = Vec::new();
    for clause in &mut request.filters {
        if matches!(clause.field.as_str(), "_ref" | "ref" | "ref_token") {
            clause.field = "id".into();
        }
        let strict = clause.field == "id";
        clause.value = resolve_value(&clause.value, registry, strict, &mut used)?;
    }
    if let Some(data) = request.data.take() {
        request.data = Some(resolve_data(data, registry, &mut used));
    }
    Ok((request, used))
}

fn resolve_value(
    value: &Value,
    registry: &EntityRegistry,
    strict: bool,
    used: &mut Vec<String>,
) -> Result<Value, ToolError> {
    match value {
        Value::String(s) => match registry.resolve(s) {
            Some(id) => {
                used.push(s.clone());
                Ok(Value::String(id.to_string()))
            }
            None if strict => Err(ToolError::UnknownRef(s.clone())),
            None => Ok(value.clone()),
        },
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(v, registry, strict, used))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        _ => Ok(value.clone()),
    }
}

fn resolve_data(data: Value, registry: &EntityRegistry, used: &mut Vec<String>) -> Value {
    match data {
        Value::String(s) => match registry.resolve(&s) {
            Some(id) => {
                used.push(s);
                Value::String(id.to_string())
            }
            None => Value::String(s),
        },
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|v| resolve_data(v, registry, used))
                .collect(),
        ),
        Value::Object(obj) => Value::Object(
            obj.into_iter()
                .map(|(k, v)| (k, resolve_data(v, registry, used)))
                .collect(),
        ),
        other => other,
    }
}
