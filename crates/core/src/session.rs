//! Session document and the storage contract for it.
//!
//! Everything a session remembers lives in one versioned document: the
//! entity registry, conversation history, reasoning trace, pending state and
//! active mode. It is loaded fresh for every request and written back once
//! per turn.

use crate::entity::EntityRegistry;
use crate::error::StoreError;
use crate::history::ConversationHistory;
use crate::pending::PendingState;
use crate::reasoning::ReasoningTrace;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Current on-disk layout. Version 1 documents lacked turn timestamps.
pub const SCHEMA_VERSION: u32 = 2;

/// Storage key; every lookup is scoped by user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.session_id)
    }
}

/// One exchange held while a bypass mode is active. Cleared on exit, once
/// the exit handoff has been folded into history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeExchange {
    pub user: String,
    pub assistant: String,
}

/// The reply of the last committed turn, kept so a client that lost its
/// connection can still collect it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastReply {
    pub turn_number: u32,
    pub reply: String,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDocument {
    #[serde(default = "legacy_schema")]
    pub schema_version: u32,
    /// Optimistic-concurrency version, bumped by every commit.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub turn_count: u32,
    #[serde(default)]
    pub registry: EntityRegistry,
    #[serde(default)]
    pub history: ConversationHistory,
    #[serde(default)]
    pub reasoning: ReasoningTrace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingState>,
    /// Bypass mode the session is currently in, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mode_transcript: Vec<ModeExchange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reply: Option<LastReply>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn legacy_schema() -> u32 {
    1
}

impl Default for SessionDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionDocument {
    pub fn new() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            version: 0,
            turn_count: 0,
            registry: EntityRegistry::new(),
            history: ConversationHistory::default(),
            reasoning: ReasoningTrace::default(),
            pending: None,
            active_mode: None,
            mode_transcript: Vec::new(),
            last_reply: None,
            updated_at: Utc::now(),
        }
    }

    /// Parse a stored document, upgrading older layouts in place.
    pub fn from_json(session_id: &str, raw: &str) -> std::result::Result<Self, StoreError> {
        let doc: SessionDocument =
            serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
                session_id: session_id.to_string(),
                reason: e.to_string(),
            })?;
        Ok(doc.upgrade())
    }

    pub fn to_json(&self) -> std::result::Result<String, StoreError> {
        serde_json::to_string(self).map_err(|e| StoreError::Storage(e.to_string()))
    }

    /// Bring an older document up to [`SCHEMA_VERSION`].
    pub fn upgrade(mut self) -> Self {
        if self.schema_version < SCHEMA_VERSION {
            let filled = self.history.backfill_timestamps(self.updated_at);
            info!(
                from = self.schema_version,
                to = SCHEMA_VERSION,
                backfilled = filled,
                "Upgraded session document"
            );
            self.schema_version = SCHEMA_VERSION;
        }
        self
    }

    /// Number the next turn will carry.
    pub fn next_turn(&self) -> u32 {
        self.turn_count + 1
    }
}

/// Durable storage for session documents.
///
/// `commit` is a compare-and-swap on the document version; `force_commit`
/// overwrites regardless, which is how the last commit wins a race.
#[async_trait]
pub trait SessionStore: Send + Sync {
    fn name(&self) -> &str;

    /// Load a document. `None` when the session does not exist yet.
    async fn load(&self, key: &SessionKey)
    -> std::result::Result<Option<SessionDocument>, StoreError>;

    /// Write `doc` if the stored version still equals `expected_version`
    /// (0 for a session that does not exist yet). Returns the new version.
    async fn commit(
        &self,
        key: &SessionKey,
        doc: &SessionDocument,
        expected_version: u64,
    ) -> std::result::Result<u64, StoreError>;

    /// Write `doc` unconditionally. Returns the new version.
    async fn force_commit(
        &self,
        key: &SessionKey,
        doc: &SessionDocument,
    ) -> std::result::Result<u64, StoreError>;

    /// Session ids belonging to `user_id`.
    async fn list(&self, user_id: &str) -> std::result::Result<Vec<String>, StoreError>;

    async fn delete(&self, key: &SessionKey) -> std::result::Result<bool, StoreError>;

    /// Load a document or start a fresh one.
    async fn load_or_new(
        &self,
        key: &SessionKey,
    ) -> std::result::Result<SessionDocument, StoreError> {
        Ok(self.load(key).await?.unwrap_or_default())
    }
}
