//! # Streaming Protocol Codec
//!
//! Translates between WebSocket frames and the gateway's internal commands.
//!
//! ## Client → Server:
//! - **Binary frame**: raw 16-bit little-endian PCM
//! - **Text frame**: JSON object with a `type` field:
//!   `start_session`, `end_session`, `audio_chunk` (base64 `audio_data`), `ping`, `get_status`
//!
//! ## Server → Client:
//! JSON objects tagged with `type`, each carrying an RFC 3339 `timestamp`:
//! `welcome`, `session_started`, `session_ended`, `partial_result`, `final_result`,
//! `speech_status`, `server_status`, `pong`, `error`.
//!
//! Decoding never fails the connection: every problem is a `GatewayError::Protocol`
//! which the connection reports back as an `error` message.

use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::session::SessionCommand;
use crate::transcription::RecognitionResult;
use base64::Engine as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Message types a client may send.
pub const CLIENT_MESSAGE_TYPES: &[&str] = &[
    "start_session",
    "end_session",
    "audio_chunk",
    "ping",
    "get_status",
];

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    StartSession {
        #[serde(default)]
        language: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    EndSession {},
    AudioChunk {
        #[serde(default)]
        audio_data: Option<String>,
    },
    Ping {
        #[serde(default)]
        request_id: Option<Value>,
    },
    GetStatus {},
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Drives the session state machine
    Session(SessionCommand),
    /// Answered by the connection directly
    Ping { request_id: Option<Value> },
    GetStatus,
}

/// Decode a text frame.
pub fn decode_text(text: &str) -> Result<Inbound, GatewayError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|err| GatewayError::protocol(format!("invalid JSON: {}", err)))?;

    let kind = match value.get("type") {
        Some(Value::String(kind)) => kind.clone(),
        Some(_) => return Err(GatewayError::protocol("message 'type' must be a string")),
        None => return Err(GatewayError::protocol("message is missing the 'type' field")),
    };

    if !CLIENT_MESSAGE_TYPES.contains(&kind.as_str()) {
        return Err(GatewayError::protocol(format!("unknown message type: {}", kind)));
    }

    let message: ClientMessage = serde_json::from_value(value)
        .map_err(|err| GatewayError::protocol(format!("malformed {} message: {}", kind, err)))?;

    let inbound = match message {
        ClientMessage::StartSession {
            language,
            session_id,
        } => Inbound::Session(SessionCommand::Start {
            language: language.filter(|l| !l.trim().is_empty()),
            session_id: session_id.filter(|s| !s.trim().is_empty()),
        }),
        ClientMessage::EndSession {} => Inbound::Session(SessionCommand::End),
        ClientMessage::AudioChunk { audio_data } => {
            Inbound::Session(SessionCommand::Audio(decode_audio_data(audio_data)?))
        }
        ClientMessage::Ping { request_id } => Inbound::Ping { request_id },
        ClientMessage::GetStatus {} => Inbound::GetStatus,
    };

    Ok(inbound)
}

/// Decode a binary frame. Every binary frame is audio.
pub fn decode_binary(data: &[u8]) -> Result<Inbound, GatewayError> {
    if data.is_empty() {
        return Err(GatewayError::protocol("empty audio frame"));
    }
    Ok(Inbound::Session(SessionCommand::Audio(data.to_vec())))
}

fn decode_audio_data(audio_data: Option<String>) -> Result<Vec<u8>, GatewayError> {
    let encoded = audio_data
        .filter(|data| !data.is_empty())
        .ok_or_else(|| GatewayError::protocol("audio_chunk requires non-empty audio_data"))?;

    let audio = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|err| GatewayError::protocol(format!("invalid base64 audio_data: {}", err)))?;

    if audio.is_empty() {
        return Err(GatewayError::protocol("audio_chunk decoded to zero bytes"));
    }
    Ok(audio)
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

/// `speech_status` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechStatus {
    SpeechStarted,
    /// The turn boundary: the speaker has stopped talking
    InputComplete,
}

/// Static description of the gateway sent in `welcome`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerInfo {
    pub model: String,
    pub device: String,
    pub engine: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub vad_enabled: bool,
    pub silence_duration: f64,
    pub energy_threshold: f64,
    pub supported_messages: Vec<String>,
}

impl ServerInfo {
    pub fn new(config: &AppConfig, engine: &str) -> Self {
        Self {
            model: config.engine.model.clone(),
            device: config.engine.device.clone(),
            engine: engine.to_string(),
            sample_rate: config.audio.sample_rate,
            channels: config.audio.channels,
            vad_enabled: true,
            silence_duration: config.vad.silence_timeout_secs,
            energy_threshold: config.vad.energy_threshold,
            supported_messages: CLIENT_MESSAGE_TYPES.iter().map(|t| t.to_string()).collect(),
        }
    }
}

/// Per-connection part of `server_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub session_id: Option<String>,
    pub session_active: bool,
    pub total_chunks: u64,
}

/// Everything the server sends on the stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        message: String,
        client_id: String,
        server_info: ServerInfo,
        timestamp: String,
    },
    SessionStarted {
        client_id: String,
        session_id: String,
        language: String,
        message: String,
        timestamp: String,
    },
    SessionEnded {
        client_id: String,
        session_id: String,
        total_chunks: u64,
        timestamp: String,
    },
    PartialResult {
        client_id: String,
        session_id: String,
        result: RecognitionResult,
        is_final: bool,
        timestamp: String,
    },
    FinalResult {
        client_id: String,
        session_id: String,
        result: RecognitionResult,
        is_final: bool,
        speech_complete: bool,
        timestamp: String,
    },
    SpeechStatus {
        client_id: String,
        session_id: String,
        status: SpeechStatus,
        timestamp: String,
    },
    ServerStatus {
        server_ready: bool,
        model_loaded: bool,
        engine: String,
        active_clients: usize,
        client_info: ClientInfo,
        timestamp: String,
    },
    Pong {
        request_id: Option<Value>,
        server_status: String,
        timestamp: String,
    },
    Error {
        message: String,
        timestamp: String,
    },
}

impl ServerMessage {
    pub fn welcome(client_id: &str, server_info: ServerInfo) -> Self {
        ServerMessage::Welcome {
            message: "Connected to streaming speech recognition gateway".to_string(),
            client_id: client_id.to_string(),
            server_info,
            timestamp: now(),
        }
    }

    pub fn session_started(client_id: &str, session_id: &str, language: &str) -> Self {
        ServerMessage::SessionStarted {
            client_id: client_id.to_string(),
            session_id: session_id.to_string(),
            language: language.to_string(),
            message: "Session started, streaming audio accepted".to_string(),
            timestamp: now(),
        }
    }

    pub fn session_ended(client_id: &str, session_id: &str, total_chunks: u64) -> Self {
        ServerMessage::SessionEnded {
            client_id: client_id.to_string(),
            session_id: session_id.to_string(),
            total_chunks,
            timestamp: now(),
        }
    }

    pub fn result(client_id: &str, session_id: &str, is_final: bool, result: RecognitionResult) -> Self {
        if is_final {
            ServerMessage::FinalResult {
                client_id: client_id.to_string(),
                session_id: session_id.to_string(),
                result,
                is_final: true,
                speech_complete: true,
                timestamp: now(),
            }
        } else {
            ServerMessage::PartialResult {
                client_id: client_id.to_string(),
                session_id: session_id.to_string(),
                result,
                is_final: false,
                timestamp: now(),
            }
        }
    }

    pub fn speech_status(client_id: &str, session_id: &str, status: SpeechStatus) -> Self {
        ServerMessage::SpeechStatus {
            client_id: client_id.to_string(),
            session_id: session_id.to_string(),
            status,
            timestamp: now(),
        }
    }

    pub fn server_status(
        ready: bool,
        model_loaded: bool,
        engine: &str,
        active_clients: usize,
        client_info: ClientInfo,
    ) -> Self {
        ServerMessage::ServerStatus {
            server_ready: ready,
            model_loaded,
            engine: engine.to_string(),
            active_clients,
            client_info,
            timestamp: now(),
        }
    }

    pub fn pong(request_id: Option<Value>, ready: bool) -> Self {
        ServerMessage::Pong {
            request_id,
            server_status: if ready { "ready" } else { "loading" }.to_string(),
            timestamp: now(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            timestamp: now(),
        }
    }

    /// Wire name of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Welcome { .. } => "welcome",
            ServerMessage::SessionStarted { .. } => "session_started",
            ServerMessage::SessionEnded { .. } => "session_ended",
            ServerMessage::PartialResult { .. } => "partial_result",
            ServerMessage::FinalResult { .. } => "final_result",
            ServerMessage::SpeechStatus { .. } => "speech_status",
            ServerMessage::ServerStatus { .. } => "server_status",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }

    /// Serialize for a text frame.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            tracing::error!(kind = self.kind(), error = %err, "Failed to encode server message");
            format!(
                r#"{{"type":"error","message":"failed to encode {} message","timestamp":"{}"}}"#,
                self.kind(),
                now()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocol_message(err: GatewayError) -> String {
        match err {
            GatewayError::Protocol(msg) => msg,
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_start_session() {
        let inbound = decode_text(r#"{"type":"start_session","language":"zh"}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Session(SessionCommand::Start {
                language: Some("zh".to_string()),
                session_id: None,
            })
        );

        let inbound = decode_text(r#"{"type":"start_session","session_id":"abc","language":""}"#).unwrap();
        assert_eq!(
            inbound,
            Inbound::Session(SessionCommand::Start {
                language: None,
                session_id: Some("abc".to_string()),
            })
        );
    }

    #[test]
    fn test_decode_control_messages() {
        assert_eq!(
            decode_text(r#"{"type":"end_session"}"#).unwrap(),
            Inbound::Session(SessionCommand::End)
        );
        assert_eq!(decode_text(r#"{"type":"get_status","extra":1}"#).unwrap(), Inbound::GetStatus);
        assert_eq!(
            decode_text(r#"{"type":"ping","request_id":42}"#).unwrap(),
            Inbound::Ping { request_id: Some(serde_json::json!(42)) }
        );
        assert_eq!(decode_text(r#"{"type":"ping"}"#).unwrap(), Inbound::Ping { request_id: None });
    }

    #[test]
    fn test_decode_audio_chunk() {
        // "AQID" is base64 for [1, 2, 3]
        assert_eq!(
            decode_text(r#"{"type":"audio_chunk","audio_data":"AQID"}"#).unwrap(),
            Inbound::Session(SessionCommand::Audio(vec![1, 2, 3]))
        );

        let missing = decode_text(r#"{"type":"audio_chunk"}"#).unwrap_err();
        assert!(protocol_message(missing).contains("non-empty audio_data"));

        let empty = decode_text(r#"{"type":"audio_chunk","audio_data":""}"#).unwrap_err();
        assert!(protocol_message(empty).contains("non-empty audio_data"));

        let invalid = decode_text(r#"{"type":"audio_chunk","audio_data":"!!not base64!!"}"#).unwrap_err();
        assert!(protocol_message(invalid).starts_with("invalid base64"));
    }

    #[test]
    fn test_decode_errors() {
        assert!(protocol_message(decode_text("{nope").unwrap_err()).starts_with("invalid JSON"));
        assert!(protocol_message(decode_text(r#"{"language":"en"}"#).unwrap_err()).contains("'type'"));
        assert_eq!(
            protocol_message(decode_text(r#"{"type":"dance"}"#).unwrap_err()),
            "unknown message type: dance"
        );
        assert!(protocol_message(decode_text(r#"{"type":"start_session","language":5}"#).unwrap_err())
            .starts_with("malformed start_session"));
    }

    #[test]
    fn test_decode_binary() {
        assert_eq!(
            decode_binary(&[9, 8]).unwrap(),
            Inbound::Session(SessionCommand::Audio(vec![9, 8]))
        );
        assert!(decode_binary(&[]).is_err());
    }

    #[test]
    fn test_encode_messages() {
        let json: Value = serde_json::from_str(
            &ServerMessage::speech_status("c1", "s1", SpeechStatus::InputComplete).encode(),
        )
        .unwrap();
        assert_eq!(json["type"], "speech_status");
        assert_eq!(json["status"], "input_complete");
        assert_eq!(json["session_id"], "s1");
        assert!(json["timestamp"].is_string());

        let final_json: Value = serde_json::from_str(
            &ServerMessage::result("c1", "s1", true, RecognitionResult::failure("boom")).encode(),
        )
        .unwrap();
        assert_eq!(final_json["type"], "final_result");
        assert_eq!(final_json["is_final"], true);
        assert_eq!(final_json["speech_complete"], true);
        assert_eq!(final_json["result"]["transcription"], "");
        assert_eq!(final_json["result"]["error"], "boom");

        let partial_json: Value = serde_json::from_str(
            &ServerMessage::result("c1", "s1", false, RecognitionResult::failure("x")).encode(),
        )
        .unwrap();
        assert_eq!(partial_json["type"], "partial_result");
        assert_eq!(partial_json["is_final"], false);
        assert!(partial_json.get("speech_complete").is_none());

        let pong: Value = serde_json::from_str(&ServerMessage::pong(Some("r1".into()), false).encode()).unwrap();
        assert_eq!(pong["request_id"], "r1");
        assert_eq!(pong["server_status"], "loading");
    }

    #[test]
    fn test_welcome_carries_server_info() {
        let info = ServerInfo::new(&AppConfig::default(), "command:asr");
        let json: Value = serde_json::from_str(&ServerMessage::welcome("c1", info).encode()).unwrap();

        assert_eq!(json["type"], "welcome");
        assert_eq!(json["client_id"], "c1");
        assert_eq!(json["server_info"]["sample_rate"], 16000);
        assert_eq!(json["server_info"]["silence_duration"], 2.0);
        assert_eq!(json["server_info"]["supported_messages"][2], "audio_chunk");
    }
}
