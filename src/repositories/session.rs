use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::{
    crypto::token,
    error::{AppError, Result},
    models::session::{CloseReason, FileMeta, Session},
};

/// Draws before giving up on finding a free code.
const MAX_CODE_ATTEMPTS: usize = 10_000;

/// In-memory registry of all non-purged sessions, indexed by id and by code.
///
/// Cloning is cheap and every clone shares the same registry. All reads return
/// owned snapshots; all writes happen under one async mutex so a record is never
/// observed half-updated.
#[derive(Clone, Default)]
pub struct SessionStore {
    inner: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
    by_id: HashMap<String, Session>,
    /// code → id
    by_code: HashMap<String, String>,
}

/// Result of [`SessionStore::close`].
#[derive(Debug)]
pub struct CloseOutcome {
    /// `false` if this call performed the transition.
    pub already_closed: bool,
    /// File detached by the close, whose bytes the caller must delete.
    pub detached: Option<FileMeta>,
}

/// Why [`SessionStore::set_file`] refused to attach.
#[derive(Debug, PartialEq, Eq)]
pub enum AttachError {
    NotFound,
    Closed,
}

/// Everything one sweeper pass changed.
#[derive(Debug, Default)]
pub struct SweepOutcome {
    pub closed: Vec<(String, CloseReason)>,
    /// Files detached from sessions closed in this pass.
    pub detached: Vec<FileMeta>,
    /// Ids removed from the registry in this pass.
    pub purged: Vec<String>,
}

impl SessionStore {
    /// Creates a new, empty `SessionStore`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and indexes a waiting session with a fresh id, code and tokens.
    pub async fn create(&self, ttl_secs: i64, now: DateTime<Utc>) -> Result<Session> {
        let mut registry = self.inner.lock().await;

        let mut code = token::new_code();
        let mut attempts = 1;
        while registry.by_code.contains_key(&code) {
            if attempts >= MAX_CODE_ATTEMPTS {
                return Err(AppError::Internal(format!(
                    "No free session code after {} attempts ({} active sessions)",
                    attempts,
                    registry.by_id.len()
                )));
            }
            code = token::new_code();
            attempts += 1;
        }

        let mut id = token::new_id();
        while registry.by_id.contains_key(&id) {
            id = token::new_id();
        }

        let session = Session::new(
            id.clone(),
            code.clone(),
            token::new_token(),
            token::new_token(),
            ttl_secs,
            now,
        );

        registry.by_code.insert(code, id.clone());
        registry.by_id.insert(id, session.clone());

        Ok(session)
    }

    pub async fn get_by_id(&self, id: &str) -> Option<Session> {
        self.inner.lock().await.by_id.get(id).cloned()
    }

    /// Looks a session up by its pairing code (case-insensitive).
    pub async fn get_by_code(&self, code: &str) -> Option<Session> {
        let code = token::normalize_code(code);
        let registry = self.inner.lock().await;
        registry
            .by_code
            .get(&code)
            .and_then(|id| registry.by_id.get(id))
            .cloned()
    }

    /// Runs `f` against the live record under the registry guard.
    ///
    /// Returns `None` when the id is unknown.
    pub async fn update<T, F>(&self, id: &str, f: F) -> Option<T>
    where
        F: FnOnce(&mut Session) -> T,
    {
        let mut registry = self.inner.lock().await;
        registry.by_id.get_mut(id).map(f)
    }

    /// Records activity and slides the TTL deadline. Returns `false` if unknown.
    pub async fn touch(&self, id: &str, ttl_secs: i64, now: DateTime<Utc>) -> bool {
        self.update(id, |session| session.touch(ttl_secs, now))
            .await
            .is_some()
    }

    /// Closes a session. Closing an already-closed session keeps the first reason.
    pub async fn close(
        &self,
        id: &str,
        reason: CloseReason,
        now: DateTime<Utc>,
    ) -> Option<CloseOutcome> {
        self.update(id, |session| {
            let already_closed = session.is_closed();
            let detached = session.close(reason, now);
            CloseOutcome {
                already_closed,
                detached,
            }
        })
        .await
    }

    /// Removes a session from both indexes. Returns the removed record.
    pub async fn purge(&self, id: &str) -> Option<Session> {
        let mut registry = self.inner.lock().await;
        let session = registry.by_id.remove(id)?;
        registry.by_code.remove(&session.code);
        Some(session)
    }

    /// Attaches file metadata, returning the replaced file (if any).
    ///
    /// Refuses closed sessions so a close racing an upload can never leave a
    /// file on a closed record.
    pub async fn set_file(
        &self,
        id: &str,
        meta: FileMeta,
        now: DateTime<Utc>,
    ) -> std::result::Result<Option<FileMeta>, AttachError> {
        self.update(id, |session| {
            if session.is_closed() {
                return Err(AttachError::Closed);
            }
            session.last_activity_at = now;
            Ok(session.file.replace(meta))
        })
        .await
        .unwrap_or(Err(AttachError::NotFound))
    }

    /// Detaches whatever file the session holds.
    pub async fn clear_file(&self, id: &str, now: DateTime<Utc>) -> Option<FileMeta> {
        self.update(id, |session| {
            session.last_activity_at = now;
            session.file.take()
        })
        .await
        .flatten()
    }

    /// Detaches the file only if it is still the blob at `storage_path`.
    ///
    /// Used after a download so a replacement uploaded meanwhile survives.
    pub async fn clear_file_if(
        &self,
        id: &str,
        storage_path: &Path,
        now: DateTime<Utc>,
    ) -> Option<FileMeta> {
        self.update(id, |session| {
            let matches = session
                .file
                .as_ref()
                .is_some_and(|file| file.storage_path == storage_path);
            if !matches {
                return None;
            }
            session.last_activity_at = now;
            session.file.take()
        })
        .await
        .flatten()
    }

    /// Snapshot of every indexed session.
    pub async fn all_sessions(&self) -> Vec<Session> {
        self.inner.lock().await.by_id.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// One sweeper pass, atomic with respect to request handlers.
    ///
    /// Every open session is passed to `verdict`; a returned reason closes it.
    /// Closed sessions older than `tombstone` are purged. A session closed in
    /// this pass is never purged in the same pass.
    pub async fn sweep<F>(&self, now: DateTime<Utc>, tombstone: Duration, mut verdict: F) -> SweepOutcome
    where
        F: FnMut(&Session) -> Option<CloseReason>,
    {
        let mut outcome = SweepOutcome::default();
        let mut registry = self.inner.lock().await;

        for session in registry.by_id.values_mut() {
            if session.is_closed() {
                if session.file.is_some() {
                    outcome.detached.extend(session.file.take());
                }
                continue;
            }
            if let Some(reason) = verdict(session) {
                outcome.detached.extend(session.close(reason, now));
                outcome.closed.push((session.id.clone(), reason));
            }
        }

        let expired: Vec<(String, String)> = registry
            .by_id
            .values()
            .filter(|session| {
                session
                    .closed_at
                    .is_some_and(|closed_at| now - closed_at > tombstone)
            })
            .map(|session| (session.id.clone(), session.code.clone()))
            .collect();

        for (id, code) in expired {
            registry.by_id.remove(&id);
            registry.by_code.remove(&code);
            outcome.purged.push(id);
        }

        outcome
    }
}
