//! Process-wide map of live sessions keyed by connection id.
//!
//! The registry is the only structure shared between connections. Lookups take
//! a read lock; create and remove take the write lock, so two racing creates for
//! the same connection still produce a single session. Each session sits behind
//! its own mutex, which in practice only its connection ever locks.

use crate::error::GatewayError;
use crate::session::machine::{Session, SessionSettings, SessionState};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

pub type SharedSession = Arc<Mutex<Session>>;

/// Session counts for the metrics endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistrySummary {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub closing: usize,
    pub buffered_bytes: usize,
    pub max_sessions: usize,
}

/// One line of the session listing on the metrics endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub client_id: String,
    pub session_id: String,
    pub state: SessionState,
    pub language: String,
    pub chunks: u64,
    pub buffered_bytes: usize,
    pub speech_detected: bool,
    pub speaking: bool,
    pub created_at: String,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SharedSession>>,
    next_serial: AtomicU64,
    max_sessions: usize,
    settings: Arc<SessionSettings>,
}

impl SessionRegistry {
    pub fn new(settings: SessionSettings, max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
            max_sessions,
            settings: Arc::new(settings),
        }
    }

    /// Return the connection's session, creating it (Idle) on first contact.
    pub fn get_or_create(&self, client_id: &str) -> Result<SharedSession, GatewayError> {
        if let Some(session) = self.sessions.read().get(client_id) {
            return Ok(Arc::clone(session));
        }

        let mut sessions = self.sessions.write();
        if let Some(session) = sessions.get(client_id) {
            return Ok(Arc::clone(session));
        }

        if sessions.len() >= self.max_sessions {
            return Err(GatewayError::SessionLimit(self.max_sessions));
        }

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Mutex::new(Session::new(
            serial,
            client_id,
            Arc::clone(&self.settings),
            Instant::now(),
        )));
        sessions.insert(client_id.to_string(), Arc::clone(&session));

        debug!(client_id, serial, live = sessions.len(), "Session registered");
        Ok(session)
    }

    /// Drop the connection's session. Only removes it if it is still `serial`'s session.
    pub fn remove(&self, client_id: &str, serial: u64) -> Option<SharedSession> {
        let mut sessions = self.sessions.write();
        let matches = sessions
            .get(client_id)
            .map(|session| session.lock().serial() == serial)
            .unwrap_or(false);

        if !matches {
            return None;
        }

        let removed = sessions.remove(client_id);
        debug!(client_id, serial, live = sessions.len(), "Session unregistered");
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    pub fn summary(&self) -> RegistrySummary {
        let sessions = self.sessions.read();
        let mut summary = RegistrySummary {
            total: sessions.len(),
            max_sessions: self.max_sessions,
            ..Default::default()
        };

        for session in sessions.values() {
            let session = session.lock();
            match session.state() {
                SessionState::Idle => summary.idle += 1,
                SessionState::Active if session.is_closing() => summary.closing += 1,
                SessionState::Active => summary.active += 1,
                SessionState::Ended => {}
            }
            summary.buffered_bytes += session.buffered_bytes();
        }

        summary
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read();
        let mut listing: Vec<SessionSnapshot> = sessions
            .iter()
            .map(|(client_id, session)| {
                let session = session.lock();
                SessionSnapshot {
                    client_id: client_id.clone(),
                    session_id: session.id().to_string(),
                    state: session.state(),
                    language: session.language().to_string(),
                    chunks: session.chunk_count(),
                    buffered_bytes: session.buffered_bytes(),
                    speech_detected: session.speech_ever_detected(),
                    speaking: session.is_speaking(),
                    created_at: session.created_at().to_rfc3339(),
                }
            })
            .collect();
        listing.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        listing
    }
}
