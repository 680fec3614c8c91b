//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - **GatewayError**: failures inside the streaming pipeline (protocol, buffering,
//!   recognition, transport). These never cross the HTTP boundary; the WebSocket
//!   actor turns them into `error` messages and the session keeps running.
//! - **AppError**: failures of the HTTP side channel, today only a refused WebSocket
//!   upgrade. Implements actix's `ResponseError` so handlers can simply return `Err(...)`.
//!
//! ## Propagation Policy:
//! Per-frame and per-session errors are recovered locally and reported as structured
//! messages. Only an unavailable engine at startup keeps the gateway from becoming ready.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Errors raised by the streaming pipeline.
///
/// ## Error Categories:
/// - **Protocol**: malformed or unexpected message for the current session state
/// - **BufferOverflow**: the audio accumulator hit its configured byte cap
/// - **Recognition**: the engine call failed or produced unusable output
/// - **Transport**: the WebSocket connection failed underneath us
/// - **SessionLimit**: the registry is at `max_concurrent_sessions`
/// - **EngineUnavailable**: the recognition engine cannot be reached at startup
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayError {
    Protocol(String),

    BufferOverflow {
        /// Configured cap in bytes
        limit: usize,
        /// Size the buffer would have reached with the rejected chunk
        attempted: usize,
    },

    Recognition(String),

    Transport(String),

    SessionLimit(usize),

    EngineUnavailable(String),
}

impl GatewayError {
    /// Shorthand used all over the codec and the session machine.
    pub fn protocol(message: impl Into<String>) -> Self {
        GatewayError::Protocol(message.into())
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Protocol(msg) => write!(f, "{}", msg),
            GatewayError::BufferOverflow { limit, attempted } => write!(
                f,
                "audio buffer limit exceeded: {} bytes requested, limit is {} bytes",
                attempted, limit
            ),
            GatewayError::Recognition(msg) => write!(f, "recognition failed: {}", msg),
            GatewayError::Transport(msg) => write!(f, "transport failure: {}", msg),
            GatewayError::SessionLimit(max) => {
                write!(f, "maximum concurrent sessions ({}) reached", max)
            }
            GatewayError::EngineUnavailable(msg) => {
                write!(f, "recognition engine unavailable: {}", msg)
            }
        }
    }
}

impl std::error::Error for GatewayError {}

/// Errors returned by the HTTP surface.
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::ServiceUnavailable("engine not loaded".to_string()).into());
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Gateway is not ready to accept streams (503)
    ServiceUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts AppError into a JSON HTTP response.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "service_unavailable",
///     "message": "recognition engine unavailable: command not found",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            AppError::ServiceUnavailable(_) => actix_web::http::StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::ServiceUnavailable(msg) => ("service_unavailable", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}
