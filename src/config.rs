//! # Configuration Management
//!
//! Loads gateway configuration from multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms set these)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_VAD__ENERGY_THRESHOLD`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! Nested keys are separated by a double underscore because many field names
//! contain single underscores themselves.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub audio: AudioFormatConfig,
    pub vad: VadConfig,
    pub buffer: BufferConfig,
    pub dispatcher: DispatcherConfig,
    pub session: SessionConfig,
}

/// Network settings.
///
/// ## Fields:
/// - `host` / `port`: where the HTTP server (health + WebSocket upgrade) binds
/// - `ws_path`: path of the streaming endpoint (clients connect to `ws://host:port/asr`)
/// - `max_frame_bytes`: largest WebSocket frame accepted from a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub ws_path: String,
    pub max_frame_bytes: usize,
}

/// External recognition engine settings.
///
/// The gateway never loads a model itself. It runs `command` with `args` for each
/// recognition and feeds it a WAV container on stdin. Args may contain the
/// placeholders `{language}`, `{sample_rate}` and `{channels}`.
///
/// `concurrent` declares whether the engine survives parallel invocations. When it
/// is false every call is serialized through a single worker slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Reported in `welcome`, `/health` and `/info`
    pub model: String,
    pub device: String,
    pub concurrent: bool,
}

/// Raw PCM format clients stream in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioFormatConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

/// Energy-based voice activity detection.
///
/// `energy_threshold` is the mean squared sample value above which a frame counts
/// as speech. It is tuned per deployment (microphone, gain, room); there is no
/// universally correct value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    pub energy_threshold: f64,
    pub silence_timeout_secs: f64,
}

/// Audio accumulator policy.
///
/// ## Fields:
/// - `partial_every_chunks`: try a partial recognition after this many chunks
///   (10 chunks of ~100ms is roughly one partial per second)
/// - `min_partial_secs`: never dispatch a partial shorter than this
/// - `max_buffer_bytes`: hard cap; reaching it during speech forces a final flush
/// - `lead_in_secs`: audio kept from before speech starts; older silence is dropped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    pub partial_every_chunks: usize,
    pub min_partial_secs: f64,
    pub max_buffer_bytes: usize,
    pub lead_in_secs: f64,
}

/// Recognition worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub workers: usize,
    pub timeout_secs: u64,
}

/// Session lifecycle limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub default_language: String,
    pub max_concurrent_sessions: usize,
    pub idle_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8767,
                ws_path: "/asr".to_string(),
                max_frame_bytes: 10 * 1024 * 1024,
            },
            engine: EngineConfig {
                command: "sensevoice-transcribe".to_string(),
                args: vec![
                    "--language".to_string(),
                    "{language}".to_string(),
                    "--sample-rate".to_string(),
                    "{sample_rate}".to_string(),
                ],
                model: "iic/SenseVoiceSmall".to_string(),
                device: "cpu".to_string(),
                concurrent: false,
            },
            audio: AudioFormatConfig {
                sample_rate: 16000,
                channels: 1,
                bit_depth: 16,
            },
            vad: VadConfig {
                energy_threshold: 1_000_000.0,
                silence_timeout_secs: 2.0,
            },
            buffer: BufferConfig {
                partial_every_chunks: 10,
                min_partial_secs: 0.5,
                // 60 seconds of 16kHz mono 16-bit audio
                max_buffer_bytes: 60 * 16000 * 2,
                lead_in_secs: 1.0,
            },
            dispatcher: DispatcherConfig {
                workers: 4,
                timeout_secs: 30,
            },
            session: SessionConfig {
                default_language: "auto".to_string(),
                max_concurrent_sessions: 100,
                idle_timeout_secs: 300,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
        }
    }
}

impl AudioFormatConfig {
    /// Bytes of raw PCM per second of audio.
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * (self.bit_depth as usize / 8)
    }

    /// Number of bytes holding `secs` seconds of audio.
    pub fn bytes_for(&self, secs: f64) -> usize {
        (self.bytes_per_second() as f64 * secs).ceil() as usize
    }
}

impl VadConfig {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.silence_timeout_secs)
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=9000`
    /// - `APP_ENGINE__COMMAND=/opt/asr/bin/transcribe`
    /// - `APP_VAD__ENERGY_THRESHOLD=250000`
    /// - `HOST=0.0.0.0` / `PORT=3000`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense together.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !self.server.ws_path.starts_with('/') {
            return Err(anyhow::anyhow!("WebSocket path must start with '/'"));
        }

        if self.engine.command.trim().is_empty() {
            return Err(anyhow::anyhow!("Engine command must not be empty"));
        }

        if self.audio.bit_depth != 16 {
            return Err(anyhow::anyhow!(
                "Only 16-bit PCM is supported, got {}-bit",
                self.audio.bit_depth
            ));
        }

        if self.audio.sample_rate == 0 || self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Sample rate and channel count must be greater than 0"));
        }

        if self.vad.silence_timeout_secs <= 0.0 || !self.vad.silence_timeout_secs.is_finite() {
            return Err(anyhow::anyhow!("Silence timeout must be a positive number of seconds"));
        }

        if self.vad.energy_threshold < 0.0 {
            return Err(anyhow::anyhow!("Energy threshold cannot be negative"));
        }

        if self.buffer.partial_every_chunks == 0 {
            return Err(anyhow::anyhow!("Partial cadence must be at least one chunk"));
        }

        if self.buffer.min_partial_secs < 0.0 {
            return Err(anyhow::anyhow!("Minimum partial duration cannot be negative"));
        }

        if self.buffer.max_buffer_bytes < self.audio.bytes_for(self.buffer.min_partial_secs) {
            return Err(anyhow::anyhow!(
                "Buffer cap ({} bytes) is smaller than one partial window",
                self.buffer.max_buffer_bytes
            ));
        }

        if self.buffer.lead_in_secs < 0.0
            || self.audio.bytes_for(self.buffer.lead_in_secs) >= self.buffer.max_buffer_bytes
        {
            return Err(anyhow::anyhow!(
                "Lead-in ({}s) must be non-negative and smaller than the buffer cap",
                self.buffer.lead_in_secs
            ));
        }

        if self.dispatcher.workers == 0 {
            return Err(anyhow::anyhow!("Dispatcher needs at least one worker"));
        }

        if self.dispatcher.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Recognition timeout must be greater than 0"));
        }

        if self.session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.session.idle_timeout_secs == 0
            || self.session.heartbeat_interval_secs == 0
            || self.session.client_timeout_secs == 0
        {
            return Err(anyhow::anyhow!("Session timers must be greater than 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8767);
        assert_eq!(config.server.ws_path, "/asr");
        assert_eq!(config.vad.silence_timeout(), Duration::from_secs(2));
        assert_eq!(config.buffer.partial_every_chunks, 10);
        assert_eq!(config.dispatcher.workers, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_byte_rate() {
        let audio = AppConfig::default().audio;
        assert_eq!(audio.bytes_per_second(), 32000);
        assert_eq!(audio.bytes_for(0.5), 16000);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.bit_depth = 24;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.dispatcher.workers = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.buffer.max_buffer_bytes = 100;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.vad.silence_timeout_secs = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.buffer.lead_in_secs = 60.0;
        assert!(config.validate().is_err());
    }
}
