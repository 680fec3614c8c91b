//! # Speech Gateway - Main Application Entry Point
//!
//! Real-time streaming transcription gateway. Clients stream raw PCM over a
//! WebSocket; the gateway detects turns with an energy VAD, batches audio, runs
//! recognition on a bounded worker pool and streams partial/final results and
//! turn-boundary events back.
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, config.toml, environment)
//! - **error**: pipeline and HTTP error types
//! - **audio**: PCM helpers, turn detection, audio accumulator
//! - **session**: per-connection state machine and the session registry
//! - **transcription**: engine seam, worker pool, ordered delivery, tag parsing
//! - **protocol**: wire codec for the streaming protocol
//! - **websocket**: one actor per streaming connection
//! - **health**: readiness, info and metrics endpoints
//! - **state**: shared application state

mod audio;
mod config;
mod error;
mod health;
mod protocol;
mod session;
mod state;
mod transcription;
mod websocket;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::{CommandEngine, RecognitionDispatcher, RecognitionEngine};

/// Set once SIGINT or SIGTERM has been received.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// ## Startup sequence:
/// 1. Load `.env`, set up tracing, load and validate configuration
/// 2. Build the recognition engine and probe it
/// 3. Serve HTTP + WebSocket; a failed probe leaves the gateway not-ready
///    (health answers 503, upgrades are refused) instead of exiting
/// 4. Stop gracefully on SIGINT/SIGTERM
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting speech-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!(
        host = %config.server.host,
        port = config.server.port,
        ws_path = %config.server.ws_path,
        "Configuration loaded"
    );
    info!(
        energy_threshold = config.vad.energy_threshold,
        silence_timeout_secs = config.vad.silence_timeout_secs,
        partial_every_chunks = config.buffer.partial_every_chunks,
        "Turn detection configured"
    );

    let engine: Arc<dyn RecognitionEngine> = Arc::new(CommandEngine::new(&config.engine));
    let probe = engine.probe();

    let dispatcher = RecognitionDispatcher::new(
        Arc::clone(&engine),
        config.dispatcher.workers,
        Duration::from_secs(config.dispatcher.timeout_secs),
        config.audio.clone(),
    );

    let app_state = AppState::new(config.clone(), dispatcher);
    match probe {
        Ok(()) => {
            app_state.mark_ready();
            info!(engine = engine.name(), model = %config.engine.model, "Recognition engine available");
        }
        Err(err) => {
            let failure = error::GatewayError::EngineUnavailable(format!("{:#}", err));
            error!(error = %failure, "Gateway will not accept sessions");
            app_state.mark_unavailable(failure.to_string());
        }
    }

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let ws_path = config.server.ws_path.clone();

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(TracingLogger::default())
            .route(&ws_path, web::get().to(websocket::stream_endpoint))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/info", web::get().to(health::service_info))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Initialize tracing.
///
/// `RUST_LOG` controls the filter; without it the default is
/// `speech_gateway=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "speech_gateway=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Listen for SIGTERM and SIGINT and raise the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let (mut sigterm, mut sigint) =
                match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                    (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                    (Err(e), _) | (_, Err(e)) => {
                        warn!("Failed to install signal handlers: {}", e);
                        return;
                    }
                };

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = sigint.recv() => info!("Received SIGINT"),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C");
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
