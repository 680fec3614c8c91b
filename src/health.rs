//! # HTTP Side Channel
//!
//! Request/response endpoints next to the streaming socket:
//! - `GET /health`, `GET /api/v1/health`: readiness probe (200 ready, 503 not ready)
//! - `GET /info`: static description of the service and its protocol
//! - `GET /api/v1/metrics`: dispatcher, session and connection counters

use crate::protocol::CLIENT_MESSAGE_TYPES;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let ready = state.is_ready();
    let config = &state.config;

    let body = json!({
        "status": if ready { "healthy" } else { "unavailable" },
        "ready": ready,
        "model_loaded": state.is_model_loaded(),
        "active_sessions": state.registry.len(),
        "uptime_seconds": state.get_uptime_seconds(),
        "engine": state.dispatcher.engine_name(),
        "model": config.engine.model,
        "websocket_path": config.server.ws_path,
        "reason": state.not_ready_reason(),
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });

    if ready {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

pub async fn service_info(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;

    HttpResponse::Ok().json(json!({
        "service": "speech-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Streaming speech recognition gateway with energy-based turn detection",
        "model": config.engine.model,
        "device": config.engine.device,
        "engine": state.dispatcher.engine_name(),
        "audio": {
            "sample_rate": config.audio.sample_rate,
            "channels": config.audio.channels,
            "bit_depth": config.audio.bit_depth,
            "encoding": "pcm_s16le",
        },
        "vad": {
            "enabled": true,
            "energy_threshold": config.vad.energy_threshold,
            "silence_duration": config.vad.silence_timeout_secs,
        },
        "partials": {
            "every_chunks": config.buffer.partial_every_chunks,
            "min_seconds": config.buffer.min_partial_secs,
        },
        "websocket_path": config.server.ws_path,
        "message_types": CLIENT_MESSAGE_TYPES,
        "speech_status_values": ["speech_started", "input_complete"],
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let connections = state.get_metrics_snapshot();
    let sessions = state.registry.summary();
    let session_usage = if sessions.max_sessions > 0 {
        sessions.total as f64 / sessions.max_sessions as f64
    } else {
        0.0
    };

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "ready": state.is_ready(),
        "dispatcher": state.dispatcher.stats(),
        "sessions": sessions,
        "session_usage_percent": (session_usage * 100.0).round(),
        "session_list": state.registry.snapshot(),
        "connections": {
            "open": connections.open_connections(),
            "counters": connections,
        },
        "memory": get_memory_info(),
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let field = |name: &str| -> u64 {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false
    })
}
