use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use sb_core::types::SessionStatus;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};
use crate::pty::PtyBackend;
use crate::session::{Session, SessionSpec};
use crate::sink::OutputSink;

/// Number of closed sessions whose final status stays queryable.
pub const CLOSED_HISTORY: usize = 64;

/// Registry of live sessions keyed by session id.
///
/// Lookups share a read lock; create and close take the write lock only for
/// the map mutation itself. Teardown I/O always runs outside the lock.
///
/// The final status of recently closed sessions is kept in a bounded
/// history so a client polling after its stream dropped still gets an
/// answer. Lock order is always `sessions` before `closed`.
pub struct SessionManager {
    backend: Arc<dyn PtyBackend>,
    max_sessions: usize,
    sessions: RwLock<AHashMap<String, Arc<Session>>>,
    closed: Mutex<VecDeque<SessionStatus>>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn PtyBackend>, max_sessions: usize) -> Arc<Self> {
        info!(backend = backend.name(), max_sessions, "creating SessionManager");
        Arc::new(Self {
            backend,
            max_sessions,
            sessions: RwLock::new(AHashMap::new()),
            closed: Mutex::new(VecDeque::with_capacity(CLOSED_HISTORY)),
        })
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Spawn a session and start its read loop bound to `sink`.
    pub async fn create_session(
        self: &Arc<Self>,
        id: impl Into<String>,
        sink: Arc<dyn OutputSink>,
        spec: &SessionSpec,
    ) -> Result<Arc<Session>> {
        let session = self.spawn_session(id, spec).await?;
        if let Err(e) = session.start_read_loop(sink) {
            self.close_session(session.id()).await;
            return Err(e);
        }
        Ok(session)
    }

    /// Spawn and register a session without starting its read loop; a
    /// connection attaches later through [`SessionManager::attach`].
    ///
    /// Nothing is registered if the spawn fails.
    pub async fn spawn_session(
        self: &Arc<Self>,
        id: impl Into<String>,
        spec: &SessionSpec,
    ) -> Result<Arc<Session>> {
        let id = id.into();
        {
            let sessions = self.sessions.read().await;
            if sessions.contains_key(&id) {
                return Err(SessionError::AlreadyExists(id));
            }
            if sessions.len() >= self.max_sessions {
                return Err(SessionError::AtCapacity {
                    max: self.max_sessions,
                });
            }
        }

        let session = Arc::new(Session::spawn(id.clone(), self.backend.as_ref(), spec)?);

        let rejected = {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&id) {
                Some(SessionError::AlreadyExists(id.clone()))
            } else if sessions.len() >= self.max_sessions {
                Some(SessionError::AtCapacity {
                    max: self.max_sessions,
                })
            } else {
                sessions.insert(id.clone(), Arc::clone(&session));
                self.closed.lock().await.retain(|s| s.session_id != id);
                None
            }
        };
        if let Some(err) = rejected {
            // Lost a race with a concurrent create; discard our process.
            close_blocking(Arc::clone(&session)).await;
            return Err(err);
        }

        self.spawn_reaper(&session);
        debug!(session_id = %id, "session registered");
        Ok(session)
    }

    /// Bind a registered session's read loop to `sink`.
    pub async fn attach(&self, id: &str, sink: Arc<dyn OutputSink>) -> Result<Arc<Session>> {
        let session = self.get_session(id).await?;
        session.start_read_loop(sink)?;
        info!(session_id = %id, "connection attached");
        Ok(session)
    }

    pub async fn get_session(&self, id: &str) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Status of a live session, or the final status of a recently
    /// closed one.
    pub async fn session_status(&self, id: &str) -> Result<SessionStatus> {
        if let Ok(session) = self.get_session(id).await {
            return Ok(session.status());
        }
        self.closed
            .lock()
            .await
            .iter()
            .rev()
            .find(|s| s.session_id == id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Remove a session and tear it down. Returns whether it was registered.
    pub async fn close_session(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id);
        match removed {
            Some(session) => {
                close_blocking(Arc::clone(&session)).await;
                self.remember_closed(session.status()).await;
                true
            }
            None => false,
        }
    }

    /// Close every session (daemon shutdown).
    pub async fn close_all(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, s)| s).collect()
        };
        info!(count = drained.len(), "closing all sessions");
        for session in drained {
            close_blocking(Arc::clone(&session)).await;
            self.remember_closed(session.status()).await;
        }
    }

    pub async fn list(&self) -> Vec<SessionStatus> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut statuses: Vec<SessionStatus> = sessions.iter().map(|s| s.status()).collect();
        statuses.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        statuses
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Drop the registry entry once a session closes on its own (process
    /// exit or dead connection).
    fn spawn_reaper(self: &Arc<Self>, session: &Arc<Session>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let session = Arc::downgrade(session);
        tokio::spawn(async move {
            let Some(watched) = session.upgrade() else {
                return;
            };
            let id = watched.id().to_string();
            // Hold only the receiver while waiting so an unregistered session
            // can still be dropped.
            let mut rx = watched.subscribe_closed();
            drop(watched);
            let _ = rx.wait_for(|closed| *closed).await;

            let Some(manager) = manager.upgrade() else {
                return;
            };
            let mut sessions = manager.sessions.write().await;
            let same = sessions
                .get(&id)
                .is_some_and(|current| Weak::ptr_eq(&Arc::downgrade(current), &session));
            if !same {
                return;
            }
            if let Some(reaped) = sessions.remove(&id) {
                manager.remember_closed(reaped.status()).await;
                debug!(session_id = %id, "closed session reaped from registry");
            }
        });
    }

    async fn remember_closed(&self, status: SessionStatus) {
        let mut closed = self.closed.lock().await;
        closed.retain(|s| s.session_id != status.session_id);
        closed.push_back(status);
        while closed.len() > CLOSED_HISTORY {
            closed.pop_front();
        }
    }
}

async fn close_blocking(session: Arc<Session>) {
    let id = session.id().to_string();
    if let Err(e) = tokio::task::spawn_blocking(move || session.close()).await {
        warn!(session_id = %id, error = %e, "session teardown task failed");
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("backend", &self.backend.name())
            .field("max_sessions", &self.max_sessions)
            .finish()
    }
}
