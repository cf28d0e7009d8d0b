//! Session registry.
//!
//! Tracks sessions, their tabs and passwords, and expires sessions that have
//! seen no activity for the configured TTL.

use crate::relay::validate_id;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tabrelay_core::{hash_password, verify_password, RelayError, RelayResult, SessionInfo, TabDescriptor};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One session: a group of tabs sharing activity, password and TTL.
pub struct Session {
    pub id: String,
    pub tabs: Vec<TabDescriptor>,
    password_hash: Option<String>,
    pub capabilities: Vec<String>,
    pub created_at: Instant,
    pub last_activity: Instant,
    /// Counter behind default tab names.
    tabs_created: u32,
}

impl Session {
    fn new(id: String, capabilities: Vec<String>) -> Self {
        let now = Instant::now();
        Self {
            id,
            tabs: Vec::new(),
            password_hash: None,
            capabilities,
            created_at: now,
            last_activity: now,
            tabs_created: 0,
        }
    }

    fn push_tab(&mut self, id: String, name: Option<String>) -> TabDescriptor {
        self.tabs_created += 1;
        let tab = TabDescriptor {
            id,
            name: name.unwrap_or_else(|| format!("Terminal {}", self.tabs_created)),
        };
        self.tabs.push(tab.clone());
        self.last_activity = Instant::now();
        tab
    }
}

/// A session removed by [`SessionRegistry::remove`] or [`SessionRegistry::gc`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedSession {
    pub id: String,
    pub tab_ids: Vec<String>,
}

/// In-memory registry of all sessions.
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Session>>>,
    max_sessions: usize,
    ttl: Duration,
    capabilities: Vec<String>,
}

impl SessionRegistry {
    /// `capabilities` is advertised by every session.
    pub fn new(max_sessions: usize, ttl: Duration, capabilities: Vec<String>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions,
            ttl,
            capabilities,
        }
    }

    /// Create the session on first use.
    pub async fn get_or_create(&self, session_id: &str) -> RelayResult<()> {
        validate_id("session id", session_id)?;
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(session_id) {
            return Ok(());
        }
        if sessions.len() >= self.max_sessions {
            return Err(RelayError::Other(format!(
                "max sessions ({}) reached",
                self.max_sessions
            )));
        }
        sessions.insert(
            session_id.to_string(),
            Session::new(session_id.to_string(), self.capabilities.clone()),
        );
        info!(session_id, sessions = sessions.len(), "session created");
        Ok(())
    }

    /// Public view of a session.
    pub async fn info(&self, session_id: &str) -> RelayResult<SessionInfo> {
        let sessions = self.sessions.read().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;
        let idle = session.last_activity.elapsed();
        Ok(SessionInfo {
            id: session.id.clone(),
            tabs: session.tabs.clone(),
            has_password: session.password_hash.is_some(),
            idle_secs: idle.as_secs(),
            idle_expires_in: self.ttl.saturating_sub(idle).as_secs(),
            capabilities: session.capabilities.clone(),
        })
    }

    /// Add a tab with a fresh id.
    pub async fn add_tab(&self, session_id: &str, name: Option<String>) -> RelayResult<TabDescriptor> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;
        let mut tab_id = generate_tab_id();
        while session.tabs.iter().any(|t| t.id == tab_id) {
            tab_id = generate_tab_id();
        }
        let tab = session.push_tab(tab_id, name);
        info!(session_id, tab_id = %tab.id, tabs = session.tabs.len(), "tab added");
        Ok(tab)
    }

    /// Return the tab, registering it under the client-chosen id if it is new.
    pub async fn ensure_tab(&self, session_id: &str, tab_id: &str) -> RelayResult<TabDescriptor> {
        validate_id("tab id", tab_id)?;
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;
        if let Some(tab) = session.tabs.iter().find(|t| t.id == tab_id) {
            return Ok(tab.clone());
        }
        let tab = session.push_tab(tab_id.to_string(), None);
        info!(session_id, tab_id, tabs = session.tabs.len(), "tab registered");
        Ok(tab)
    }

    pub async fn remove_tab(&self, session_id: &str, tab_id: &str) -> RelayResult<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;
        let before = session.tabs.len();
        session.tabs.retain(|t| t.id != tab_id);
        if session.tabs.len() == before {
            return Err(RelayError::TabNotFound(format!("{session_id}/{tab_id}")));
        }
        session.last_activity = Instant::now();
        info!(session_id, tab_id, tabs = session.tabs.len(), "tab removed");
        Ok(())
    }

    /// Set the session password, or clear it with `None`.
    pub async fn set_password(&self, session_id: &str, password: Option<&str>) -> RelayResult<()> {
        let hash = match password {
            Some(password) => {
                let password = password.to_string();
                Some(blocking(move || hash_password(&password)).await?)
            }
            None => None,
        };
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;
        session.password_hash = hash;
        info!(session_id, protected = session.password_hash.is_some(), "session password updated");
        Ok(())
    }

    pub async fn has_password(&self, session_id: &str) -> RelayResult<bool> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|s| s.password_hash.is_some())
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))
    }

    /// Check a candidate credential. Sessions without a password accept
    /// anything; protected sessions reject a missing candidate.
    pub async fn verify_password(&self, session_id: &str, candidate: Option<&str>) -> RelayResult<bool> {
        let stored = {
            let sessions = self.sessions.read().await;
            sessions
                .get(session_id)
                .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?
                .password_hash
                .clone()
        };
        match (stored, candidate) {
            (None, _) => Ok(true),
            (Some(_), None) => Ok(false),
            (Some(hash), Some(candidate)) => {
                let candidate = candidate.to_string();
                blocking(move || verify_password(&candidate, &hash)).await
            }
        }
    }

    /// Record activity on a session.
    pub async fn touch(&self, session_id: &str) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(session_id) {
            session.last_activity = Instant::now();
        }
    }

    pub async fn remove(&self, session_id: &str) -> RelayResult<RemovedSession> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .remove(session_id)
            .ok_or_else(|| RelayError::SessionNotFound(session_id.to_string()))?;
        info!(session_id, tabs = session.tabs.len(), "session removed");
        Ok(removed(session))
    }

    /// Remove sessions idle for longer than the TTL.
    pub async fn gc(&self) -> Vec<RemovedSession> {
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| s.last_activity.elapsed() > self.ttl)
            .map(|s| s.id.clone())
            .collect();

        let mut out = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some(session) = sessions.remove(&id) {
                warn!(
                    session_id = %id,
                    idle_secs = session.last_activity.elapsed().as_secs(),
                    "session expired"
                );
                out.push(removed(session));
            }
        }
        if !out.is_empty() {
            debug!(count = out.len(), "GC removed sessions");
        }
        out
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

fn removed(session: Session) -> RemovedSession {
    RemovedSession {
        id: session.id,
        tab_ids: session.tabs.into_iter().map(|t| t.id).collect(),
    }
}

/// Argon2 is deliberately slow; keep it off the async workers.
async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> RelayResult<T> + Send + 'static,
) -> RelayResult<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RelayError::Other(format!("join error: {e}")))?
}

/// Random tab id (hex-encoded, 4 bytes = 8 hex chars).
fn generate_tab_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: [u8; 4] = rng.gen();
    hex::encode(bytes)
}
