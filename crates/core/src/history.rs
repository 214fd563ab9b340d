//! Conversation history: the last few turns verbatim, everything older as
//! one running narrative.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the router classified a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// Short intent label ("plan_meals", "small_talk", ...)
    pub intent: String,
    /// Subdomains the turn touches
    #[serde(default)]
    pub scope: Vec<String>,
}

/// One completed user/assistant exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub turn_number: u32,
    pub user_text: String,
    pub assistant_summary: String,
    #[serde(default)]
    pub routing: RoutingDecision,
    /// Missing on documents written before timestamps were recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Recent turns plus the append-only summary of everything folded away.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationHistory {
    #[serde(default)]
    pub recent: Vec<ConversationTurn>,
    #[serde(default)]
    pub history_summary: String,
    /// Highest turn number already folded into `history_summary`.
    #[serde(default)]
    pub compressed_through: u32,
}

impl ConversationHistory {
    pub fn push(&mut self, turn: ConversationTurn) {
        self.recent.push(turn);
    }

    /// The last `n` turns, oldest first.
    pub fn last_turns(&self, n: usize) -> &[ConversationTurn] {
        let start = self.recent.len().saturating_sub(n);
        &self.recent[start..]
    }

    /// Turns that fall outside a verbatim window of `window` turns, oldest first.
    pub fn pending_folds(&self, window: usize) -> &[ConversationTurn] {
        let excess = self.recent.len().saturating_sub(window);
        &self.recent[..excess]
    }

    /// Replace a verbatim turn by one summary sentence.
    ///
    /// Returns `false` without touching anything when the turn was already
    /// folded, so a retried compression never duplicates narrative.
    pub fn apply_fold(&mut self, turn_number: u32, sentence: &str) -> bool {
        if turn_number <= self.compressed_through {
            self.recent.retain(|t| t.turn_number != turn_number);
            return false;
        }
        self.recent.retain(|t| t.turn_number != turn_number);
        self.append_narrative(sentence);
        self.compressed_through = turn_number;
        true
    }

    /// Append a sentence to the running summary.
    pub fn append_narrative(&mut self, sentence: &str) {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            return;
        }
        if !self.history_summary.is_empty() {
            self.history_summary.push(' ');
        }
        self.history_summary.push_str(sentence);
    }

    /// Fill in missing timestamps; returns how many were backfilled.
    pub fn backfill_timestamps(&mut self, fallback: DateTime<Utc>) -> usize {
        let mut filled = 0;
        for turn in self.recent.iter_mut().filter(|t| t.timestamp.is_none()) {
            turn.timestamp = Some(fallback);
            filled += 1;
        }
        filled
    }
}
