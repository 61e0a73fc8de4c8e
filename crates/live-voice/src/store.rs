//! Session metadata persistence
//!
//! Only what is needed to resume: the session id, model and the latest
//! resumption handle. Records are JSON under `session/{id}`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LiveError, LiveResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub model: String,
    pub resumption_handle: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub terminated: bool,
}

impl SessionRecord {
    pub fn new(session_id: impl Into<String>, model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            model: model.into(),
            resumption_handle: None,
            created_at: now,
            updated_at: now,
            terminated: false,
        }
    }
}

pub trait SessionStore: Send + Sync {
    fn save(&self, record: &SessionRecord) -> LiveResult<()>;
    fn load(&self, session_id: &str) -> LiveResult<Option<SessionRecord>>;
    fn remove(&self, session_id: &str) -> LiveResult<()>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    records: Mutex<HashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, SessionRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionStore for MemorySessionStore {
    fn save(&self, record: &SessionRecord) -> LiveResult<()> {
        self.records()
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    fn load(&self, session_id: &str) -> LiveResult<Option<SessionRecord>> {
        Ok(self.records().get(session_id).cloned())
    }

    fn remove(&self, session_id: &str) -> LiveResult<()> {
        self.records().remove(session_id);
        Ok(())
    }
}

/// Sled-backed store surviving restarts.
pub struct SledSessionStore {
    db: sled::Db,
}

impl SledSessionStore {
    pub fn open(path: impl AsRef<Path>) -> LiveResult<Self> {
        let db = sled::open(path.as_ref())?;
        debug!(path = %path.as_ref().display(), "session store opened");
        Ok(Self { db })
    }

    fn key(session_id: &str) -> String {
        format!("session/{}", session_id)
    }
}

impl SessionStore for SledSessionStore {
    fn save(&self, record: &SessionRecord) -> LiveResult<()> {
        let bytes = serde_json::to_vec(record)
            .map_err(|e| LiveError::Store(e.to_string()))?;
        self.db.insert(Self::key(&record.session_id), bytes)?;
        self.db.flush()?;
        Ok(())
    }

    fn load(&self, session_id: &str) -> LiveResult<Option<SessionRecord>> {
        match self.db.get(Self::key(session_id))? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| LiveError::Store(e.to_string())),
            None => Ok(None),
        }
    }

    fn remove(&self, session_id: &str) -> LiveResult<()> {
        self.db.remove(Self::key(session_id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(store: &dyn SessionStore) {
        let mut record = SessionRecord::new("s-1", "models/test");
        record.resumption_handle = Some("h-9".into());
        store.save(&record).unwrap();

        let loaded = store.load("s-1").unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.load("missing").unwrap().is_none());

        store.remove("s-1").unwrap();
        assert!(store.load("s-1").unwrap().is_none());
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemorySessionStore::new());
    }

    #[test]
    fn test_sled_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledSessionStore::open(dir.path().join("sessions")).unwrap();
        exercise(&store);
    }
}
