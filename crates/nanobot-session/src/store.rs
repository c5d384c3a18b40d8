//! Durable session index with exclusive per-id acquisition.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use nanobot_types::CoreError;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::db;
use crate::progress::ProgressFloor;
use crate::session::{PersistedSession, Session};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The session is exclusively held by an in-flight request.
    #[error("session {0} is acquired")]
    Busy(String),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Busy(id) => CoreError::internal(format!("session {} is busy", id)),
            StoreError::Sqlite(e) => CoreError::internal(e),
            StoreError::Json(e) => CoreError::Json(e),
        }
    }
}

/// Pull the session id off a request: the `Mcp-Session-Id` header, or a
/// configured query parameter as fallback.
pub fn extract_session_id(header: Option<&str>, query_param: Option<&str>) -> Option<String> {
    header
        .filter(|v| !v.is_empty())
        .or(query_param.filter(|v| !v.is_empty()))
        .map(str::to_string)
}

/// Durable session index keyed by id.
///
/// `acquire` is exclusive per id: a second caller blocks until `release`.
/// State written during a request is visible to the next `acquire` of the
/// same id.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Load and exclusively hold the session. `Ok(None)` when the id is
    /// unknown.
    async fn acquire(&self, id: &str) -> Result<Option<Arc<Session>>, StoreError>;

    /// Persist dirty state and release the exclusive hold.
    async fn release(&self, session: &Arc<Session>) -> Result<(), StoreError>;

    /// Persist a session without holding it (used right after initialize).
    async fn store(&self, session: &Arc<Session>) -> Result<(), StoreError>;

    /// Remove the session, returning its last persisted state. Removing an
    /// acquired session is an error; wait for release first.
    async fn load_and_delete(&self, id: &str) -> Result<Option<PersistedSession>, StoreError>;

    /// Read the last persisted state without acquiring. Serves the
    /// `session://<id>` resource scheme.
    async fn peek(&self, id: &str) -> Result<Option<PersistedSession>, StoreError>;

    /// The shared progress floor sessions built by this store use.
    fn progress_floor(&self) -> Arc<ProgressFloor>;
}

struct Locks {
    locks: DashMap<String, Arc<Mutex<()>>>,
    held: DashMap<String, OwnedMutexGuard<()>>,
}

impl Locks {
    fn new() -> Self {
        Self {
            locks: DashMap::new(),
            held: DashMap::new(),
        }
    }

    async fn lock(&self, id: &str) {
        let lock = self
            .locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        self.held.insert(id.to_string(), guard);
    }

    fn unlock(&self, id: &str) {
        self.held.remove(id);
    }

    fn is_held(&self, id: &str) -> bool {
        self.held.contains_key(id)
    }
}

/// In-memory store; state survives only for the process lifetime.
pub struct MemorySessionStore {
    persisted: DashMap<String, PersistedSession>,
    live: DashMap<String, Arc<Session>>,
    locks: Locks,
    progress: Arc<ProgressFloor>,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self {
            persisted: DashMap::new(),
            live: DashMap::new(),
            locks: Locks::new(),
            progress: Arc::new(ProgressFloor::new()),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn acquire(&self, id: &str) -> Result<Option<Arc<Session>>, StoreError> {
        self.locks.lock(id).await;
        if let Some(live) = self.live.get(id) {
            return Ok(Some(live.clone()));
        }
        match self.persisted.get(id) {
            Some(state) => {
                let session = Arc::new(Session::from_persisted(
                    state.value().clone(),
                    self.progress.clone(),
                ));
                self.live.insert(id.to_string(), session.clone());
                Ok(Some(session))
            }
            None => {
                self.locks.unlock(id);
                Ok(None)
            }
        }
    }

    async fn release(&self, session: &Arc<Session>) -> Result<(), StoreError> {
        if session.is_dirty() {
            self.persisted
                .insert(session.id().to_string(), session.to_persisted());
            session.clear_dirty();
        }
        self.locks.unlock(session.id());
        Ok(())
    }

    async fn store(&self, session: &Arc<Session>) -> Result<(), StoreError> {
        self.persisted
            .insert(session.id().to_string(), session.to_persisted());
        self.live.insert(session.id().to_string(), session.clone());
        session.clear_dirty();
        Ok(())
    }

    async fn load_and_delete(&self, id: &str) -> Result<Option<PersistedSession>, StoreError> {
        if self.locks.is_held(id) {
            return Err(StoreError::Busy(id.to_string()));
        }
        if let Some((_, live)) = self.live.remove(id) {
            live.close();
        }
        Ok(self.persisted.remove(id).map(|(_, state)| state))
    }

    async fn peek(&self, id: &str) -> Result<Option<PersistedSession>, StoreError> {
        if let Some(live) = self.live.get(id) {
            return Ok(Some(live.to_persisted()));
        }
        Ok(self.persisted.get(id).map(|state| state.value().clone()))
    }

    fn progress_floor(&self) -> Arc<ProgressFloor> {
        self.progress.clone()
    }
}

/// SQLite-backed store; sessions persist across restarts as JSON documents.
pub struct SqliteSessionStore {
    conn: StdMutex<Connection>,
    live: StdMutex<HashMap<String, Arc<Session>>>,
    locks: Locks,
    progress: Arc<ProgressFloor>,
}

impl SqliteSessionStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            conn: StdMutex::new(db::open_database(path)?),
            live: StdMutex::new(HashMap::new()),
            locks: Locks::new(),
            progress: Arc::new(ProgressFloor::new()),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            conn: StdMutex::new(db::open_in_memory()?),
            live: StdMutex::new(HashMap::new()),
            locks: Locks::new(),
            progress: Arc::new(ProgressFloor::new()),
        })
    }

    fn load_persisted(&self, id: &str) -> Result<Option<PersistedSession>, StoreError> {
        let conn = self.conn.lock().expect("lock");
        let raw: Option<String> = conn
            .query_row(
                "SELECT state FROM sessions WHERE id=?",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn write_persisted(&self, state: &PersistedSession) -> Result<(), StoreError> {
        let raw = serde_json::to_string(state)?;
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().expect("lock");
        conn.execute(
            "INSERT INTO sessions (id, parent, state, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET parent=excluded.parent,
                 state=excluded.state, updated_at=excluded.updated_at",
            params![state.id, state.parent, raw, now, now],
        )?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn acquire(&self, id: &str) -> Result<Option<Arc<Session>>, StoreError> {
        self.locks.lock(id).await;
        if let Some(live) = self.live.lock().expect("lock").get(id) {
            return Ok(Some(live.clone()));
        }
        match self.load_persisted(id)? {
            Some(state) => {
                let session = Arc::new(Session::from_persisted(state, self.progress.clone()));
                self.live
                    .lock()
                    .expect("lock")
                    .insert(id.to_string(), session.clone());
                Ok(Some(session))
            }
            None => {
                self.locks.unlock(id);
                Ok(None)
            }
        }
    }

    async fn release(&self, session: &Arc<Session>) -> Result<(), StoreError> {
        if session.is_dirty() {
            self.write_persisted(&session.to_persisted())?;
            session.clear_dirty();
            debug!(session = session.id(), "persisted on release");
        }
        self.locks.unlock(session.id());
        Ok(())
    }

    async fn store(&self, session: &Arc<Session>) -> Result<(), StoreError> {
        self.write_persisted(&session.to_persisted())?;
        self.live
            .lock()
            .expect("lock")
            .insert(session.id().to_string(), session.clone());
        session.clear_dirty();
        Ok(())
    }

    async fn load_and_delete(&self, id: &str) -> Result<Option<PersistedSession>, StoreError> {
        if self.locks.is_held(id) {
            return Err(StoreError::Busy(id.to_string()));
        }
        if let Some(live) = self.live.lock().expect("lock").remove(id) {
            live.close();
        }
        let state = self.load_persisted(id)?;
        let conn = self.conn.lock().expect("lock");
        conn.execute("DELETE FROM sessions WHERE id=?", params![id])?;
        Ok(state)
    }

    async fn peek(&self, id: &str) -> Result<Option<PersistedSession>, StoreError> {
        if let Some(live) = self.live.lock().expect("lock").get(id) {
            return Ok(Some(live.to_persisted()));
        }
        self.load_persisted(id)
    }

    fn progress_floor(&self) -> Arc<ProgressFloor> {
        self.progress.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn new_session(store: &dyn SessionStore, id: &str) -> Arc<Session> {
        Arc::new(Session::new(id, store.progress_floor()))
    }

    #[test]
    fn test_extract_session_id_prefers_header() {
        assert_eq!(
            extract_session_id(Some("h"), Some("q")).as_deref(),
            Some("h")
        );
        assert_eq!(extract_session_id(None, Some("q")).as_deref(), Some("q"));
        assert_eq!(extract_session_id(Some(""), None), None);
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemorySessionStore::new();
        let session = new_session(&store, "s-1");
        session.with_attrs(|attrs| {
            const NAME: crate::AttrKey<String> = crate::AttrKey::new("thread");
            attrs.set_persistable(&NAME, "main".to_string());
        });
        store.store(&session).await.unwrap();

        let loaded = store.acquire("s-1").await.unwrap().unwrap();
        assert_eq!(loaded.id(), "s-1");
        store.release(&loaded).await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_unknown_session() {
        let store = MemorySessionStore::new();
        assert!(store.acquire("nope").await.unwrap().is_none());
        // The lock must have been released so a later create can proceed.
        assert!(!store.locks.is_held("nope"));
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive_until_release() {
        let store = Arc::new(MemorySessionStore::new());
        let session = new_session(&*store, "s-1");
        store.store(&session).await.unwrap();

        let held = store.acquire("s-1").await.unwrap().unwrap();

        let contender = {
            let store = store.clone();
            tokio::spawn(async move { store.acquire("s-1").await.unwrap().is_some() })
        };
        // The contender cannot finish while we hold the session.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        store.release(&held).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap());
    }

    #[tokio::test]
    async fn test_delete_acquired_session_is_error() {
        let store = MemorySessionStore::new();
        let session = new_session(&store, "s-1");
        store.store(&session).await.unwrap();
        let _held = store.acquire("s-1").await.unwrap().unwrap();
        match store.load_and_delete("s-1").await {
            Err(StoreError::Busy(id)) => assert_eq!(id, "s-1"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_sqlite_store_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        {
            let store = SqliteSessionStore::open(&path).unwrap();
            let session = new_session(&store, "s-persist");
            session.set_initialize(
                nanobot_types::InitializeRequest {
                    protocol_version: "2025-06-18".into(),
                    ..Default::default()
                },
                nanobot_types::InitializeResult {
                    protocol_version: "2025-06-18".into(),
                    ..Default::default()
                },
            );
            store.store(&session).await.unwrap();
        }
        let store = SqliteSessionStore::open(&path).unwrap();
        let loaded = store.acquire("s-persist").await.unwrap().unwrap();
        let (req, _) = loaded.initialize_pair().unwrap();
        assert_eq!(req.protocol_version, "2025-06-18");
        store.release(&loaded).await.unwrap();
    }

    #[tokio::test]
    async fn test_sqlite_release_persists_dirty_state() {
        let store = SqliteSessionStore::in_memory().unwrap();
        let session = new_session(&store, "s-dirty");
        store.store(&session).await.unwrap();

        let held = store.acquire("s-dirty").await.unwrap().unwrap();
        held.with_attrs(|attrs| {
            const KEY: crate::AttrKey<u64> = crate::AttrKey::new("turns");
            attrs.set_persistable(&KEY, 3);
        });
        store.release(&held).await.unwrap();

        // Forget the live copy so the next acquire reads from SQLite.
        store.live.lock().unwrap().clear();
        let reloaded = store.acquire("s-dirty").await.unwrap().unwrap();
        let turns = reloaded.with_attrs(|attrs| {
            const KEY: crate::AttrKey<u64> = crate::AttrKey::new("turns");
            attrs.restore(&KEY)
        });
        assert_eq!(turns, Some(3));
        store.release(&reloaded).await.unwrap();
    }

    #[tokio::test]
    async fn test_load_and_delete_returns_last_state() {
        let store = MemorySessionStore::new();
        let session = new_session(&store, "s-del");
        store.store(&session).await.unwrap();
        let state = store.load_and_delete("s-del").await.unwrap().unwrap();
        assert_eq!(state.id, "s-del");
        assert!(store.acquire("s-del").await.unwrap().is_none());
    }
}
