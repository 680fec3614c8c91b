//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every WebSocket actor through
//! `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: the validated configuration, immutable after startup
//! - **registry**: the session registry (the only cross-connection session structure)
//! - **dispatcher**: the recognition worker pool
//! - **readiness**: whether the engine probe succeeded at startup
//! - **metrics**: connection-level counters for `/api/v1/metrics`
//!
//! ## Arc Pattern
//! `AppState` is cheap to clone: every field is an `Arc` (or `Copy`), so actix can
//! hand a copy to each worker thread while all of them see the same registry,
//! dispatcher and counters.

use crate::config::AppConfig;
use crate::session::{SessionRegistry, SessionSettings};
use crate::transcription::RecognitionDispatcher;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<SessionRegistry>,
    pub dispatcher: Arc<RecognitionDispatcher>,
    readiness: Arc<Readiness>,
    metrics: Arc<RwLock<ConnectionMetrics>>,
    /// When the server started
    pub start_time: Instant,
}

/// Engine availability as determined at startup.
#[derive(Debug, Default)]
struct Readiness {
    ready: AtomicBool,
    model_loaded: AtomicBool,
    reason: RwLock<Option<String>>,
}

/// Connection-level counters collected by the WebSocket actors.
///
/// ## Fields:
/// - **connections_opened / connections_closed**: lifetime of WebSocket actors
/// - **rejected_upgrades**: upgrade requests refused while not ready
/// - **text_messages / binary_messages**: frames received from clients
/// - **protocol_errors**: `error` messages sent for bad input
#[derive(Debug, Default, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub rejected_upgrades: u64,
    pub text_messages: u64,
    pub binary_messages: u64,
    pub protocol_errors: u64,
}

impl ConnectionMetrics {
    pub fn open_connections(&self) -> u64 {
        self.connections_opened.saturating_sub(self.connections_closed)
    }
}

impl AppState {
    /// Build the state from a validated configuration and a ready dispatcher.
    ///
    /// The gateway starts not-ready; `mark_ready` is called once the engine probe passes.
    pub fn new(config: AppConfig, dispatcher: RecognitionDispatcher) -> Self {
        let registry = SessionRegistry::new(
            SessionSettings::from_config(&config),
            config.session.max_concurrent_sessions,
        );

        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            dispatcher: Arc::new(dispatcher),
            readiness: Arc::new(Readiness::default()),
            metrics: Arc::new(RwLock::new(ConnectionMetrics::default())),
            start_time: Instant::now(),
        }
    }

    pub fn mark_ready(&self) {
        self.readiness.model_loaded.store(true, Ordering::SeqCst);
        self.readiness.ready.store(true, Ordering::SeqCst);
        *self.readiness.reason.write() = None;
    }

    /// Record why the gateway cannot accept sessions.
    pub fn mark_unavailable(&self, reason: impl Into<String>) {
        self.readiness.ready.store(false, Ordering::SeqCst);
        self.readiness.model_loaded.store(false, Ordering::SeqCst);
        *self.readiness.reason.write() = Some(reason.into());
    }

    pub fn is_ready(&self) -> bool {
        self.readiness.ready.load(Ordering::SeqCst)
    }

    pub fn is_model_loaded(&self) -> bool {
        self.readiness.model_loaded.load(Ordering::SeqCst)
    }

    pub fn not_ready_reason(&self) -> Option<String> {
        self.readiness.reason.read().clone()
    }

    /// Apply a change to the connection counters.
    pub fn record<F>(&self, update: F)
    where
        F: FnOnce(&mut ConnectionMetrics),
    {
        update(&mut self.metrics.write());
    }

    pub fn get_metrics_snapshot(&self) -> ConnectionMetrics {
        self.metrics.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
