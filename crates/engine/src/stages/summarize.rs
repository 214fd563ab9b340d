//! Summarize: record the turn and compress at the boundary.

use crate::client::ModelClient;
use crate::commit::TurnDraft;
use crate::compression::{BoundaryReport, clip, compress_turn_boundary};
use tracing::debug;
use turnkeep_core::history::ConversationTurn;
use turnkeep_core::reasoning::TurnExecutionSummary;

const SUMMARY_CHARS: usize = 200;

/// Short form of a reply kept in the recent-turn window.
///
/// Whole sentences up to the limit; a single long sentence is clipped.
pub fn assistant_summary(reply: &str) -> String {
    let collapsed = reply.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= SUMMARY_CHARS {
        return collapsed;
    }
    let mut end = 0;
    for (count, (idx, c)) in collapsed.char_indices().enumerate() {
        if count >= SUMMARY_CHARS {
            break;
        }
        if matches!(c, '.' | '!' | '?') {
            end = idx + c.len_utf8();
        }
    }
    if end == 0 {
        clip(&collapsed, SUMMARY_CHARS)
    } else {
        collapsed[..end].to_string()
    }
}

/// Append this turn to history and the reasoning trace, then fold whatever
/// fell out of the windows.
pub async fn summarize(
    client: &ModelClient,
    draft: &mut TurnDraft,
    turn: ConversationTurn,
    summary: TurnExecutionSummary,
) -> BoundaryReport {
    draft.record_turn(turn, summary);
    let (history, reasoning) = draft.memory_mut();
    let report = compress_turn_boundary(client, history, reasoning).await;
    debug!(
        turns_folded = report.turns_folded,
        summaries_folded = report.summaries_folded,
        "Turn boundary compression"
    );
    report
}
