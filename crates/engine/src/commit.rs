//! Session commit layer.
//!
//! A turn works on a [`TurnDraft`]: a private copy of the session document
//! loaded when the turn starts. Stages read it; every change goes through
//! the draft's methods; nothing reaches the store until [`SessionCommitter::commit`]
//! writes the whole document once. Readers of the session never see a half
//! finished turn.

use crate::error::EngineError;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use turnkeep_core::entity::{CurationOutcome, EntityStatus};
use turnkeep_core::error::StoreError;
use turnkeep_core::history::{ConversationHistory, ConversationTurn};
use turnkeep_core::pending::PendingState;
use turnkeep_core::reasoning::{ReasoningTrace, TurnExecutionSummary};
use turnkeep_core::session::{LastReply, ModeExchange, SessionDocument, SessionKey, SessionStore};

/// Working copy of one session for the duration of one turn.
#[derive(Debug, Clone)]
pub struct TurnDraft {
    key: SessionKey,
    base_version: u64,
    turn: u32,
    pub(crate) doc: SessionDocument,
}

impl TurnDraft {
    pub fn new(key: SessionKey, doc: SessionDocument) -> Self {
        Self {
            key,
            base_version: doc.version,
            turn: doc.next_turn(),
            doc,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Number of the turn being built.
    pub fn turn(&self) -> u32 {
        self.turn
    }

    /// Version the draft was loaded at.
    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    pub fn doc(&self) -> &SessionDocument {
        &self.doc
    }

    // ── Registry ──────────────────────────────────────────────────────────

    pub fn register(
        &mut self,
        entity_type: &str,
        underlying_id: &str,
        label: &str,
        status: EntityStatus,
    ) -> String {
        self.doc
            .registry
            .register(entity_type, underlying_id, label, status, self.turn)
    }

    pub fn set_payload(&mut self, ref_token: &str, payload: serde_json::Value) {
        self.doc.registry.set_payload(ref_token, payload);
    }

    pub fn touch(&mut self, ref_token: &str) -> bool {
        self.doc.registry.touch(ref_token, self.turn)
    }

    pub fn apply_curation(
        &mut self,
        retain: &[(String, String)],
        demote: &[String],
    ) -> CurationOutcome {
        self.doc.registry.curate(self.turn, retain, demote)
    }

    // ── Turn state ────────────────────────────────────────────────────────

    pub fn set_pending(&mut self, pending: Option<PendingState>) {
        self.doc.pending = pending;
    }

    /// Record the finished turn. Compression runs afterwards, on the
    /// updated history.
    pub fn record_turn(&mut self, turn: ConversationTurn, summary: TurnExecutionSummary) {
        self.doc.history.push(turn);
        self.doc.reasoning.push(summary);
    }

    /// Fold a sentence straight into the history narrative.
    pub fn append_narrative(&mut self, sentence: &str) {
        self.doc.history.append_narrative(sentence);
    }

    /// Close a turn that produced `reply`.
    pub fn finish(&mut self, reply: Option<&str>) {
        self.doc.turn_count = self.turn;
        if let Some(reply) = reply {
            self.doc.last_reply = Some(LastReply {
                turn_number: self.turn,
                reply: reply.to_string(),
                completed_at: Utc::now(),
            });
        }
    }

    pub(crate) fn memory_mut(&mut self) -> (&mut ConversationHistory, &mut ReasoningTrace) {
        (&mut self.doc.history, &mut self.doc.reasoning)
    }

    // ── Bypass modes ──────────────────────────────────────────────────────

    pub fn enter_mode(&mut self, mode: &str) {
        self.doc.active_mode = Some(mode.to_string());
        self.doc.mode_transcript.clear();
    }

    pub fn push_mode_exchange(&mut self, user: &str, assistant: &str) {
        self.doc.mode_transcript.push(ModeExchange {
            user: user.to_string(),
            assistant: assistant.to_string(),
        });
    }

    /// Leave the active mode, returning its transcript.
    pub fn exit_mode(&mut self) -> Vec<ModeExchange> {
        self.doc.active_mode = None;
        std::mem::take(&mut self.doc.mode_transcript)
    }
}

/// The only path by which turn state reaches the session store.
#[derive(Clone)]
pub struct SessionCommitter {
    store: Arc<dyn SessionStore>,
}

impl SessionCommitter {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Load the session fresh and open a draft on it.
    pub async fn begin(&self, key: &SessionKey) -> Result<TurnDraft, EngineError> {
        let doc = self.store.load_or_new(key).await?;
        Ok(TurnDraft::new(key.clone(), doc))
    }

    /// Write the draft in one step.
    ///
    /// The write is a compare-and-swap on the version the draft was loaded
    /// at. If another commit landed in between, this one still wins: the
    /// stored registry is merged under the draft's so tokens issued by the
    /// other commit survive where they do not collide, and the document is
    /// written unconditionally.
    pub async fn commit(&self, draft: TurnDraft) -> Result<SessionDocument, EngineError> {
        let TurnDraft {
            key,
            base_version,
            turn,
            mut doc,
        } = draft;
        doc.updated_at = Utc::now();

        let version = match self.store.commit(&key, &doc, base_version).await {
            Ok(version) => version,
            Err(StoreError::VersionConflict {
                expected, found, ..
            }) => {
                warn!(
                    session = %key,
                    turn,
                    expected,
                    found,
                    "Session changed during the turn, last commit wins"
                );
                if let Some(mut latest) = self.store.load(&key).await? {
                    match latest.registry.merge_from(&doc.registry) {
                        Ok(()) => doc.registry = latest.registry,
                        Err(e) => warn!(session = %key, error = %e, "Registry merge failed, keeping this turn's registry"),
                    }
                }
                self.store.force_commit(&key, &doc).await?
            }
            Err(e) => return Err(e.into()),
        };

        doc.version = version;
        info!(session = %key, turn, version, "Turn committed");
        Ok(doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnkeep_store::InMemorySessionStore;

    fn committer() -> SessionCommitter {
        SessionCommitter::new(Arc::new(InMemorySessionStore::new()))
    }

    #[tokio::test]
    async fn nothing_is_visible_before_commit() {
        let committer = committer();
        let key = SessionKey::new("u1", "s1");
        let mut draft = committer.begin(&key).await.unwrap();
        assert_eq!(draft.turn(), 1);
        draft.register("recipe", "uuid-a", "Cod Tacos", EntityStatus::Read);

        assert!(committer.store().load(&key).await.unwrap().is_none());

        draft.finish(Some("Here you go."));
        let committed = committer.commit(draft).await.unwrap();
        assert_eq!(committed.version, 1);

        let loaded = committer.store().load(&key).await.unwrap().unwrap();
        assert_eq!(loaded.turn_count, 1);
        assert_eq!(loaded.registry.resolve("recipe_1"), Some("uuid-a"));
        assert_eq!(loaded.last_reply.unwrap().reply, "Here you go.");
    }

    #[tokio::test]
    async fn overlapping_commit_is_last_commit_wins() {
        let committer = committer();
        let key = SessionKey::new("u1", "s1");

        let mut first = committer.begin(&key).await.unwrap();
        let mut second = committer.begin(&key).await.unwrap();

        first.register("recipe", "uuid-a", "Cod Tacos", EntityStatus::Read);
        first.finish(Some("first"));
        committer.commit(first).await.unwrap();

        second.register("pantry_item", "uuid-p", "Rice", EntityStatus::Read);
        second.finish(Some("second"));
        let doc = committer.commit(second).await.unwrap();
        assert_eq!(doc.version, 2);

        let loaded = committer.store().load(&key).await.unwrap().unwrap();
        assert_eq!(loaded.last_reply.unwrap().reply, "second");
        // Non-colliding tokens from the overwritten commit are kept
        assert_eq!(loaded.registry.resolve("recipe_1"), Some("uuid-a"));
        assert_eq!(loaded.registry.resolve("pantry_item_1"), Some("uuid-p"));
    }

    #[tokio::test]
    async fn mode_transcript_is_taken_on_exit() {
        let committer = committer();
        let mut draft = committer.begin(&SessionKey::new("u1", "s1")).await.unwrap();
        draft.enter_mode("freeform");
        draft.push_mode_exchange("hi", "hello");
        assert_eq!(draft.doc().active_mode.as_deref(), Some("freeform"));

        let transcript = draft.exit_mode();
        assert_eq!(transcript.len(), 1);
        assert!(draft.doc().active_mode.is_none());
        assert!(draft.doc().mode_transcript.is_empty());
    }
}
