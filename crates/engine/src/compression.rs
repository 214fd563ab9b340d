//! Compression and summarization.
//!
//! Two independent triggers keep a session bounded:
//!
//! - **Mid-execution**, size-triggered: once the execution context grows past
//!   `compression.context_token_threshold`, results of steps older than the
//!   last `retention.step_result_window` steps are replaced by `summarized`
//!   stand-ins. It only ever touches this turn's step result cache.
//! - **Turn boundary**, always: conversation turns beyond
//!   `retention.conversation_window` are folded one sentence each into
//!   `history_summary`, and turn summaries beyond
//!   `retention.reasoning_window` into `reasoning_summary`. It only ever
//!   touches the session document, after execution has finished.
//!
//! Both are idempotent.

use crate::client::ModelClient;
use crate::prompts;
use crate::results::{StepResult, StepResults};
use crate::stage::Stage;
use serde_json::Value;
use tracing::{debug, info, warn};
use turnkeep_config::EngineConfig;
use turnkeep_core::history::{ConversationHistory, ConversationTurn};
use turnkeep_core::reasoning::ReasoningTrace;
use turnkeep_core::tool::ToolOp;
use turnkeep_tools::record_label;

// ── Mid-execution ─────────────────────────────────────────────────────────

/// Summarize the results of every step except the newest `keep` steps.
///
/// A step is one planned step, however many datastore calls it made. The
/// results of an older step are collapsed into one `summarized` entry per
/// table, in place of the first of them. Returns how many entries were
/// replaced; entries already summarized are left as they are.
pub fn summarize_step_results(results: &mut StepResults, keep: usize, sample_ids: usize) -> usize {
    let mut steps: Vec<usize> = results.entries().iter().map(StepResult::step).collect();
    steps.sort_unstable();
    steps.dedup();
    let older = &steps[..steps.len().saturating_sub(keep)];
    if older.is_empty() {
        return 0;
    }

    enum Slot {
        Keep(StepResult),
        Group,
    }
    let mut slots = Vec::with_capacity(results.len());
    let mut groups: Vec<(usize, String, Vec<(ToolOp, Vec<Value>)>)> = Vec::new();
    let mut replaced = 0;

    for entry in std::mem::take(results.entries_mut()) {
        match entry {
            StepResult::Records {
                step,
                table,
                op,
                records,
            } if older.binary_search(&step).is_ok() => {
                replaced += 1;
                match groups.iter_mut().find(|(s, t, _)| *s == step && *t == table) {
                    Some((_, _, parts)) => parts.push((op, records)),
                    None => {
                        slots.push(Slot::Group);
                        groups.push((step, table, vec![(op, records)]));
                    }
                }
            }
            other => slots.push(Slot::Keep(other)),
        }
    }

    let mut summarized = groups
        .into_iter()
        .map(|(step, table, parts)| summarize_group(step, table, &parts, sample_ids));
    *results.entries_mut() = slots
        .into_iter()
        .filter_map(|slot| match slot {
            Slot::Keep(entry) => Some(entry),
            Slot::Group => summarized.next(),
        })
        .collect();
    replaced
}

fn summarize_group(
    step: usize,
    table: String,
    parts: &[(ToolOp, Vec<Value>)],
    sample_ids: usize,
) -> StepResult {
    let summary = parts
        .iter()
        .map(|(op, records)| describe(*op, &table, records))
        .collect::<Vec<_>>()
        .join("; ");
    StepResult::Summarized {
        step,
        count: parts.iter().map(|(_, records)| records.len()).sum(),
        sample_ids: parts
            .iter()
            .flat_map(|(_, records)| records)
            .filter_map(|r| r.get("_ref").and_then(Value::as_str))
            .take(sample_ids)
            .map(str::to_string)
            .collect(),
        summary,
        table,
    }
}

/// Run mid-execution compression if `context_tokens` is over the threshold.
pub fn compress_if_needed(
    results: &mut StepResults,
    context_tokens: usize,
    engine: &EngineConfig,
) -> usize {
    if context_tokens <= engine.compression.context_token_threshold {
        return 0;
    }
    let replaced = summarize_step_results(
        results,
        engine.retention.step_result_window,
        engine.compression.sample_ids,
    );
    if replaced > 0 {
        info!(
            context_tokens,
            threshold = engine.compression.context_token_threshold,
            replaced,
            "Summarized older step results"
        );
    }
    replaced
}

fn describe(op: ToolOp, table: &str, records: &[Value]) -> String {
    let labels: Vec<String> = records.iter().take(5).map(record_label).collect();
    let mut summary = format!("{} {} {table} record(s)", op.as_str(), records.len());
    if !labels.is_empty() {
        summary.push_str(&format!(": {}", labels.join(", ")));
        if records.len() > labels.len() {
            summary.push_str(", ...");
        }
    }
    summary
}

// ── Turn boundary ─────────────────────────────────────────────────────────

/// What one turn-boundary pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundaryReport {
    pub turns_folded: usize,
    pub summaries_folded: usize,
}

/// Fold conversation turns and turn summaries that fell out of their
/// windows.
pub async fn compress_turn_boundary(
    client: &ModelClient,
    history: &mut ConversationHistory,
    reasoning: &mut ReasoningTrace,
) -> BoundaryReport {
    let engine = &client.config().engine;
    let turns_folded = fold_history(client, history, engine.retention.conversation_window).await;
    let summaries_folded = reasoning.compress(engine.retention.reasoning_window);
    if summaries_folded > 0 {
        debug!(
            summaries_folded,
            compressed_through = reasoning.compressed_through,
            "Folded reasoning trace"
        );
    }
    BoundaryReport {
        turns_folded,
        summaries_folded,
    }
}

/// One small completion per turn beyond `window`, oldest first.
///
/// A failed or empty completion falls back to a mechanical sentence; the
/// fold itself never fails.
pub async fn fold_history(
    client: &ModelClient,
    history: &mut ConversationHistory,
    window: usize,
) -> usize {
    let engine = &client.config().engine;
    let pending: Vec<ConversationTurn> = history.pending_folds(window).to_vec();
    let mut folded = 0;

    for turn in pending {
        let messages = ModelClient::messages(
            Stage::Summarize,
            prompts::FOLD,
            None,
            format!(
                "User: {}\nAssistant: {}",
                turn.user_text, turn.assistant_summary
            ),
        );
        let sentence = match client
            .text(
                Stage::Summarize,
                engine.stages.summarize,
                messages,
                Some(engine.compression.fold_max_tokens),
            )
            .await
        {
            Ok(text) => match clean_sentence(&text) {
                Some(s) => s,
                None => fallback_sentence(&turn),
            },
            Err(e) => {
                warn!(turn = turn.turn_number, error = %e, "History fold failed, using fallback");
                fallback_sentence(&turn)
            }
        };

        if history.apply_fold(turn.turn_number, &sentence) {
            debug!(turn = turn.turn_number, "Folded conversation turn");
            folded += 1;
        }
    }
    folded
}

fn clean_sentence(text: &str) -> Option<String> {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
    Some(collapsed.trim_matches('"').to_string())
}

fn fallback_sentence(turn: &ConversationTurn) -> String {
    format!(
        "Turn {}: the user said \"{}\" and the assistant answered \"{}\".",
        turn.turn_number,
        clip(&turn.user_text, 80),
        clip(&turn.assistant_summary, 80)
    )
}

/// Truncate to at most `max` characters on a char boundary.
pub(crate) fn clip(text: &str, max: usize) -> String {
    let text = text.trim();
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", text[..idx].trim_end()),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ScriptedProvider;
    use serde_json::json;
    use std::sync::Arc;
    use turnkeep_config::AppConfig;
    use turnkeep_core::history::RoutingDecision;

    fn read_result(step: usize, names: &[&str]) -> StepResult {
        StepResult::Records {
            step,
            table: "inventory".into(),
            op: ToolOp::Read,
            records: names
                .iter()
                .enumerate()
                .map(|(i, n)| json!({"_ref": format!("inventory_{}", step * 10 + i + 1), "name": n}))
                .collect(),
        }
    }

    #[test]
    fn last_k_results_are_never_touched() {
        let mut results = StepResults::new();
        for step in 0..5 {
            results.push(read_result(step, &["Rice", "Cod", "Flour", "Eggs"]));
        }
        let tail_before = results.entries()[3..].to_vec();

        let replaced = summarize_step_results(&mut results, 2, 3);
        assert_eq!(replaced, 3);
        assert_eq!(&results.entries()[3..], tail_before.as_slice());

        match &results.entries()[0] {
            StepResult::Summarized {
                table,
                count,
                sample_ids,
                summary,
                ..
            } => {
                assert_eq!(table, "inventory");
                assert_eq!(*count, 4);
                assert_eq!(sample_ids, &["inventory_1", "inventory_2", "inventory_3"]);
                assert!(summary.contains("Rice"));
            }
            other => panic!("expected summarized, got {other:?}"),
        }

        // Idempotent
        assert_eq!(summarize_step_results(&mut results, 2, 3), 0);
        assert_eq!(&results.entries()[3..], tail_before.as_slice());
    }

    #[test]
    fn window_counts_steps_not_calls() {
        let mut results = StepResults::new();
        results.push(read_result(0, &["Rice"]));
        results.push(read_result(0, &["Cod", "Eggs"]));
        for _ in 0..4 {
            results.push(read_result(1, &["Flour"]));
        }
        let current = results.entries()[2..].to_vec();

        // One older step, two calls on the same table: one stand-in
        assert_eq!(summarize_step_results(&mut results, 1, 5), 2);
        assert_eq!(results.len(), 5);
        assert_eq!(&results.entries()[1..], current.as_slice());
        match &results.entries()[0] {
            StepResult::Summarized {
                step,
                count,
                sample_ids,
                ..
            } => {
                assert_eq!(*step, 0);
                assert_eq!(*count, 3);
                assert_eq!(sample_ids, &["inventory_1", "inventory_1", "inventory_2"]);
            }
            other => panic!("expected summarized, got {other:?}"),
        }

        // A single running step is never summarized, however many calls it made
        let mut running = StepResults::new();
        for _ in 0..6 {
            running.push(read_result(3, &["Rice"]));
        }
        assert_eq!(summarize_step_results(&mut running, 1, 3), 0);
        assert!(running.entries().iter().all(|r| !r.is_summarized()));
    }

    #[test]
    fn compression_waits_for_threshold() {
        let engine = EngineConfig::default();
        let mut results = StepResults::new();
        for step in 0..4 {
            results.push(read_result(step, &["Rice"]));
        }
        assert_eq!(compress_if_needed(&mut results, 10, &engine), 0);
        assert!(results.entries().iter().all(|r| !r.is_summarized()));

        let over = engine.compression.context_token_threshold + 1;
        assert_eq!(compress_if_needed(&mut results, over, &engine), 2);
        assert!(!results.entries()[3].is_summarized());
    }

    fn turn(n: u32) -> ConversationTurn {
        ConversationTurn {
            turn_number: n,
            user_text: format!("message {n}"),
            assistant_summary: format!("answer {n}"),
            routing: RoutingDecision::default(),
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn fold_history_is_idempotent() {
        let provider = Arc::new(
            ScriptedProvider::new().script(Stage::Summarize, ["User opened with message 1."]),
        );
        let client = ModelClient::new(provider.clone(), Arc::new(AppConfig::default()));
        let mut history = ConversationHistory::default();
        for n in 1..=3 {
            history.push(turn(n));
        }

        assert_eq!(fold_history(&client, &mut history, 2).await, 1);
        assert_eq!(history.history_summary, "User opened with message 1.");
        assert_eq!(history.compressed_through, 1);

        assert_eq!(fold_history(&client, &mut history, 2).await, 0);
        assert_eq!(history.history_summary, "User opened with message 1.");
        assert_eq!(provider.requests_for(Stage::Summarize).len(), 1);
    }

    #[tokio::test]
    async fn fold_falls_back_when_provider_fails() {
        let provider = Arc::new(ScriptedProvider::new().failing(Stage::Summarize));
        let client = ModelClient::new(provider, Arc::new(AppConfig::default()));
        let mut history = ConversationHistory::default();
        for n in 1..=2 {
            history.push(turn(n));
        }
        assert_eq!(fold_history(&client, &mut history, 1).await, 1);
        assert!(history.history_summary.contains("message 1"));
    }

    #[test]
    fn clip_respects_char_boundaries() {
        assert_eq!(clip("héllo wörld", 5), "héllo...");
        assert_eq!(clip("short", 10), "short");
    }
}
