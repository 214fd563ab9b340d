//! In-memory session store for tests and throwaway sessions.
//!
//! Documents are kept serialized so a load always yields a fresh copy, the
//! same as reading them back from disk.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;
use turnkeep_core::error::StoreError;
use turnkeep_core::session::{SessionDocument, SessionKey, SessionStore};

#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<RwLock<HashMap<SessionKey, (u64, String)>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn stamped(doc: &SessionDocument, version: u64) -> Result<String, StoreError> {
        let mut doc = doc.clone();
        doc.version = version;
        doc.updated_at = Utc::now();
        doc.to_json()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn load(&self, key: &SessionKey) -> Result<Option<SessionDocument>, StoreError> {
        let sessions = self.sessions.read().await;
        match sessions.get(key) {
            Some((version, raw)) => {
                let mut doc = SessionDocument::from_json(&key.session_id, raw)?;
                doc.version = *version;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    async fn commit(
        &self,
        key: &SessionKey,
        doc: &SessionDocument,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let mut sessions = self.sessions.write().await;
        let found = sessions.get(key).map(|(v, _)| *v).unwrap_or(0);
        if found != expected_version {
            warn!(session = %key, expected = expected_version, found, "Commit lost version race");
            return Err(StoreError::VersionConflict {
                session_id: key.session_id.clone(),
                expected: expected_version,
                found,
            });
        }
        let new_version = expected_version + 1;
        sessions.insert(key.clone(), (new_version, Self::stamped(doc, new_version)?));
        Ok(new_version)
    }

    async fn force_commit(&self, key: &SessionKey, doc: &SessionDocument) -> Result<u64, StoreError> {
        let mut sessions = self.sessions.write().await;
        let new_version = sessions.get(key).map(|(v, _)| *v).unwrap_or(0) + 1;
        sessions.insert(key.clone(), (new_version, Self::stamped(doc, new_version)?));
        Ok(new_version)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let sessions = self.sessions.read().await;
        let mut ids: Vec<String> = sessions
            .keys()
            .filter(|k| k.user_id == user_id)
            .map(|k| k.session_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn delete(&self, key: &SessionKey) -> Result<bool, StoreError> {
        Ok(self.sessions.write().await.remove(key).is_some())
    }
}
