//! Entity reference registry.
//!
//! Domain records the model sees are never addressed by their raw ids.
//! Each `(entity_type, underlying_id)` pair is bound once to a short token
//! such as `recipe_3`, and that binding holds for the life of the session.
//! The registry is an arena: entries are only ever appended, per-type
//! sequence numbers only ever grow, and the two lookup indexes are rebuilt
//! from the entries whenever a registry is loaded.

use crate::error::RegistryError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

/// What happened to an entity most recently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityStatus {
    Read,
    Created,
    Updated,
    Deleted,
    Generated,
    Linked,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
            Self::Generated => "generated",
            Self::Linked => "linked",
        }
    }

    /// Whether this status records a change made in the datastore.
    pub fn is_write(self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::Deleted | Self::Linked)
    }
}

/// One registered entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub ref_token: String,
    pub entity_type: String,
    pub underlying_id: String,
    pub label: String,
    pub status: EntityStatus,
    pub turn_created: u32,
    pub turn_last_referenced: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_reason: Option<String>,
    /// Turn in which curation explicitly demoted this entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub demoted_turn: Option<u32>,
    /// Last observed record body, shown only in full snapshots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl EntityRef {
    /// Whether the entity belongs to the active working set at `current_turn`.
    ///
    /// Demoted entities are never active. Retained ones always are. Everything
    /// else is active while it was referenced within the last `window` turns.
    pub fn is_active(&self, current_turn: u32, window: u32) -> bool {
        if self.demoted_turn.is_some() {
            return false;
        }
        self.retention_reason.is_some()
            || current_turn.saturating_sub(self.turn_last_referenced) < window
    }

    fn tier(&self, current_turn: u32, window: u32) -> ActivityTier {
        if self.demoted_turn.is_some() {
            ActivityTier::Demoted
        } else if self.retention_reason.is_some() {
            ActivityTier::Retained
        } else if self.is_active(current_turn, window) {
            ActivityTier::Recent
        } else {
            ActivityTier::Dormant
        }
    }
}

/// Where an entity sits relative to the active working set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityTier {
    Recent,
    Retained,
    Dormant,
    Demoted,
}

/// How much of each entity a snapshot exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// Active and generated entities with their payloads.
    Full,
    /// Active entities as token, type, label and status.
    RefsAndLabels,
    /// Active entities as type and label only, no tokens.
    LabelsOnly,
    /// Every entity in every tier, with retention state and payload.
    Curation,
}

/// A projected view of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityView {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_token: Option<String>,
    pub entity_type: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EntityStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<ActivityTier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_last_referenced: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// Result of one curation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurationOutcome {
    pub retained: Vec<String>,
    pub demoted: Vec<String>,
    pub unknown: Vec<String>,
    pub reasons: BTreeMap<String, String>,
}

/// Session-lifetime registry of entity tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RegistryRepr", into = "RegistryRepr")]
pub struct EntityRegistry {
    entries: Vec<EntityRef>,
    /// Highest sequence number ever issued per entity type.
    sequences: BTreeMap<String, u32>,
    by_token: HashMap<String, usize>,
    by_identity: HashMap<(String, String), usize>,
}

#[derive(Serialize, Deserialize)]
struct RegistryRepr {
    #[serde(default)]
    entries: Vec<EntityRef>,
    #[serde(default)]
    sequences: BTreeMap<String, u32>,
}

impl TryFrom<RegistryRepr> for EntityRegistry {
    type Error = RegistryError;

    fn try_from(repr: RegistryRepr) -> Result<Self, Self::Error> {
        let mut registry = EntityRegistry {
            sequences: repr.sequences,
            ..Default::default()
        };
        for entry in repr.entries {
            registry.insert_existing(entry)?;
        }
        Ok(registry)
    }
}

impl From<EntityRegistry> for RegistryRepr {
    fn from(registry: EntityRegistry) -> Self {
        RegistryRepr {
            entries: registry.entries,
            sequences: registry.sequences,
        }
    }
}

/// Split `recipe_12` into `("recipe", 12)`.
fn parse_token(token: &str) -> Option<(&str, u32)> {
    let (prefix, seq) = token.rsplit_once('_')?;
    if prefix.is_empty() {
        return None;
    }
    seq.parse().ok().map(|n| (prefix, n))
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityRef> {
        self.entries.iter()
    }

    pub fn get(&self, ref_token: &str) -> Option<&EntityRef> {
        self.by_token.get(ref_token).map(|&i| &self.entries[i])
    }

    /// Token currently bound to `(entity_type, underlying_id)`, if any.
    pub fn lookup(&self, entity_type: &str, underlying_id: &str) -> Option<&str> {
        self.by_identity
            .get(&(entity_type.to_string(), underlying_id.to_string()))
            .map(|&i| self.entries[i].ref_token.as_str())
    }

    /// Underlying id for a token. Tool calls go through this so the model
    /// never needs to see or construct raw ids.
    pub fn resolve(&self, ref_token: &str) -> Option<&str> {
        self.get(ref_token).map(|e| e.underlying_id.as_str())
    }

    /// Register an entity, or refresh it if it is already known.
    ///
    /// Idempotent on `(entity_type, underlying_id)`: the same pair always
    /// yields the same token. New pairs get the next sequence number for
    /// their type, so `recipe_4` follows `recipe_3` even if `recipe_3` was
    /// later demoted or deleted.
    pub fn register(
        &mut self,
        entity_type: &str,
        underlying_id: &str,
        label: &str,
        status: EntityStatus,
        turn: u32,
    ) -> String {
        let key = (entity_type.to_string(), underlying_id.to_string());
        if let Some(&idx) = self.by_identity.get(&key) {
            let entry = &mut self.entries[idx];
            if !label.is_empty() {
                entry.label = label.to_string();
            }
            entry.status = status;
            Self::touch_entry(entry, turn);
            return entry.ref_token.clone();
        }

        let seq = self.sequences.entry(entity_type.to_string()).or_insert(0);
        *seq += 1;
        let ref_token = format!("{entity_type}_{seq}");
        debug!(%ref_token, entity_type, underlying_id, turn, "Registered entity");

        let idx = self.entries.len();
        self.entries.push(EntityRef {
            ref_token: ref_token.clone(),
            entity_type: entity_type.to_string(),
            underlying_id: underlying_id.to_string(),
            label: label.to_string(),
            status,
            turn_created: turn,
            turn_last_referenced: turn,
            retention_reason: None,
            demoted_turn: None,
            payload: None,
        });
        self.by_token.insert(ref_token.clone(), idx);
        self.by_identity.insert(key, idx);
        ref_token
    }

    /// Adopt an entry that already carries a token (loaded from storage or
    /// merged from a turn draft).
    ///
    /// Re-adopting the exact same binding merges reference turns. Any attempt
    /// to bind a token to a different type or id, or an identity to a
    /// different token, is rejected.
    pub fn insert_existing(&mut self, entry: EntityRef) -> Result<(), RegistryError> {
        let (prefix, seq) = parse_token(&entry.ref_token)
            .ok_or_else(|| RegistryError::MalformedToken(entry.ref_token.clone()))?;

        if let Some(&idx) = self.by_token.get(&entry.ref_token) {
            let existing = &mut self.entries[idx];
            if existing.entity_type != entry.entity_type {
                return Err(RegistryError::TokenTypeConflict {
                    token: entry.ref_token,
                    existing: existing.entity_type.clone(),
                    requested: entry.entity_type,
                });
            }
            if existing.underlying_id != entry.underlying_id {
                return Err(RegistryError::TokenIdConflict {
                    token: entry.ref_token,
                });
            }
            existing.turn_last_referenced =
                existing.turn_last_referenced.max(entry.turn_last_referenced);
            return Ok(());
        }

        if prefix != entry.entity_type {
            return Err(RegistryError::TokenTypeConflict {
                token: entry.ref_token.clone(),
                existing: prefix.to_string(),
                requested: entry.entity_type,
            });
        }

        let key = (entry.entity_type.clone(), entry.underlying_id.clone());
        if let Some(&idx) = self.by_identity.get(&key) {
            return Err(RegistryError::IdentityConflict {
                entity_type: entry.entity_type,
                underlying_id: entry.underlying_id,
                existing: self.entries[idx].ref_token.clone(),
            });
        }

        let high = self.sequences.entry(entry.entity_type.clone()).or_insert(0);
        *high = (*high).max(seq);

        let idx = self.entries.len();
        self.by_token.insert(entry.ref_token.clone(), idx);
        self.by_identity.insert(key, idx);
        self.entries.push(entry);
        Ok(())
    }

    /// Attach the last observed record body to an entity.
    pub fn set_payload(&mut self, ref_token: &str, payload: serde_json::Value) {
        if let Some(&idx) = self.by_token.get(ref_token) {
            self.entries[idx].payload = Some(payload);
        }
    }

    /// Mark an entity as referenced in `turn`. Unknown tokens are ignored.
    pub fn touch(&mut self, ref_token: &str, turn: u32) -> bool {
        match self.by_token.get(ref_token) {
            Some(&idx) => {
                Self::touch_entry(&mut self.entries[idx], turn);
                true
            }
            None => {
                warn!(ref_token, turn, "Touch on unknown entity token ignored");
                false
            }
        }
    }

    fn touch_entry(entry: &mut EntityRef, turn: u32) {
        entry.turn_last_referenced = entry.turn_last_referenced.max(turn);
        // A reference in a later turn than the demotion brings it back.
        if entry.demoted_turn.is_some_and(|d| turn > d) {
            entry.demoted_turn = None;
        }
    }

    /// Apply one turn's curation decision.
    ///
    /// Retained entities get a reason and stay active regardless of age.
    /// Demoted entities leave the working set until referenced again in a
    /// later turn. A token listed in both ends up demoted.
    pub fn curate(
        &mut self,
        turn: u32,
        retain: &[(String, String)],
        demote: &[String],
    ) -> CurationOutcome {
        let mut outcome = CurationOutcome::default();

        for (token, reason) in retain {
            match self.by_token.get(token) {
                Some(&idx) => {
                    let entry = &mut self.entries[idx];
                    entry.retention_reason = Some(reason.clone());
                    entry.demoted_turn = None;
                    entry.turn_last_referenced = entry.turn_last_referenced.max(turn);
                    outcome.retained.push(token.clone());
                    outcome.reasons.insert(token.clone(), reason.clone());
                }
                None => outcome.unknown.push(token.clone()),
            }
        }

        for token in demote {
            match self.by_token.get(token) {
                Some(&idx) => {
                    let entry = &mut self.entries[idx];
                    entry.retention_reason = None;
                    entry.demoted_turn = Some(turn);
                    outcome.retained.retain(|t| t != token);
                    outcome.reasons.remove(token);
                    outcome.demoted.push(token.clone());
                }
                None => outcome.unknown.push(token.clone()),
            }
        }

        if !outcome.unknown.is_empty() {
            warn!(turn, unknown = ?outcome.unknown, "Curation referenced unknown tokens");
        }
        debug!(
            turn,
            retained = outcome.retained.len(),
            demoted = outcome.demoted.len(),
            "Curation applied"
        );
        outcome
    }

    /// Entities in the active working set.
    pub fn active(&self, current_turn: u32, window: u32) -> impl Iterator<Item = &EntityRef> {
        self.entries
            .iter()
            .filter(move |e| e.is_active(current_turn, window))
    }

    /// Project the registry for one consumer.
    pub fn snapshot(&self, mode: SnapshotMode, current_turn: u32, window: u32) -> Vec<EntityView> {
        self.entries
            .iter()
            .filter(|e| match mode {
                SnapshotMode::Curation => true,
                SnapshotMode::Full => {
                    e.is_active(current_turn, window)
                        || (e.status == EntityStatus::Generated && e.demoted_turn.is_none())
                }
                SnapshotMode::RefsAndLabels | SnapshotMode::LabelsOnly => {
                    e.is_active(current_turn, window)
                }
            })
            .map(|e| {
                let mut view = EntityView {
                    ref_token: None,
                    entity_type: e.entity_type.clone(),
                    label: e.label.clone(),
                    status: None,
                    tier: None,
                    retention_reason: None,
                    turn_last_referenced: None,
                    payload: None,
                };
                match mode {
                    SnapshotMode::LabelsOnly => {}
                    SnapshotMode::RefsAndLabels => {
                        view.ref_token = Some(e.ref_token.clone());
                        view.status = Some(e.status);
                    }
                    SnapshotMode::Full => {
                        view.ref_token = Some(e.ref_token.clone());
                        view.status = Some(e.status);
                        view.payload = e.payload.clone();
                    }
                    SnapshotMode::Curation => {
                        view.ref_token = Some(e.ref_token.clone());
                        view.status = Some(e.status);
                        view.tier = Some(e.tier(current_turn, window));
                        view.retention_reason = e.retention_reason.clone();
                        view.turn_last_referenced = Some(e.turn_last_referenced);
                        view.payload = e.payload.clone();
                    }
                }
                view
            })
            .collect()
    }

    /// Fold another registry (a turn draft) into this one.
    ///
    /// Entries already present are replaced by the draft's version; new
    /// entries are adopted with their tokens intact.
    pub fn merge_from(&mut self, draft: &EntityRegistry) -> Result<(), RegistryError> {
        for entry in &draft.entries {
            match self.by_token.get(&entry.ref_token) {
                Some(&idx) => {
                    let current = &self.entries[idx];
                    if current.entity_type != entry.entity_type
                        || current.underlying_id != entry.underlying_id
                    {
                        return Err(RegistryError::TokenIdConflict {
                            token: entry.ref_token.clone(),
                        });
                    }
                    self.entries[idx] = entry.clone();
                }
                None => self.insert_existing(entry.clone())?,
            }
        }
        for (entity_type, &seq) in &draft.sequences {
            let high = self.sequences.entry(entity_type.clone()).or_insert(0);
            *high = (*high).max(seq);
        }
        Ok(())
    }
}
