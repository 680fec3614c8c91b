//! # Session State Machine
//!
//! One `Session` per live connection. `handle` is the whole transition table:
//! it takes a decoded command plus the current time and returns the effects the
//! connection must carry out. Nothing here touches the network or the worker
//! pool, so every transition is testable with scripted input.
//!
//! ## States:
//! - **Idle**: registered, no turn in progress
//! - **Active**: accepting audio (may be *closing* after `end_session`)
//! - **Ended**: terminal; the registry drops the session
//!
//! ## Transition table:
//! | state          | start                       | audio                          | end                 | disconnect / idle |
//! |----------------|-----------------------------|--------------------------------|---------------------|-------------------|
//! | Idle           | → Active                    | → Active (compatibility)       | error               | → Ended           |
//! | Active         | final flush, new turn       | VAD + accumulate               | closing, final flush| final flush → Ended |
//! | Active/closing | error                       | error                          | error               | final flush → Ended |
//! | Ended          | error                       | error                          | error               | no-op             |

use crate::audio::{AudioAccumulator, TurnDetector, TurnEvent};
use crate::config::AppConfig;
use crate::error::GatewayError;
use crate::protocol::{ClientInfo, ServerMessage, SpeechStatus};
use crate::transcription::{RecognitionResult, RecognitionTask};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Input to the state machine, decoded from the wire or raised by the connection.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    Start {
        language: Option<String>,
        session_id: Option<String>,
    },
    End,
    Audio(Vec<u8>),
    /// The transport went away
    Disconnect,
    /// No client activity for the configured idle timeout
    IdleTimeout,
}

/// What the connection must do after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(ServerMessage),
    Recognize(RecognitionTask),
    /// Acknowledge the end once every recognition queued so far is delivered
    EndAfterPending { session_serial: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Active,
    Ended,
}

/// Session tuning shared by every session of the process.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub energy_threshold: f64,
    pub silence_timeout: Duration,
    pub partial_every_chunks: usize,
    pub min_partial_bytes: usize,
    pub max_buffer_bytes: usize,
    pub lead_in_bytes: usize,
    pub default_language: String,
    pub idle_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            energy_threshold: config.vad.energy_threshold,
            silence_timeout: config.vad.silence_timeout(),
            partial_every_chunks: config.buffer.partial_every_chunks,
            min_partial_bytes: config.audio.bytes_for(config.buffer.min_partial_secs),
            max_buffer_bytes: config.buffer.max_buffer_bytes,
            lead_in_bytes: config.audio.bytes_for(config.buffer.lead_in_secs),
            default_language: config.session.default_language.clone(),
            idle_timeout: Duration::from_secs(config.session.idle_timeout_secs),
        }
    }
}

#[derive(Debug)]
pub struct Session {
    serial: u64,
    id: String,
    client_id: String,
    state: SessionState,
    /// `end_session` received, waiting for pending recognitions
    closing: bool,
    language: String,
    created_at: DateTime<Utc>,
    last_activity_at: Instant,
    chunk_count: u64,
    turn: TurnDetector,
    buffer: AudioAccumulator,
    settings: Arc<SessionSettings>,
}

impl Session {
    pub fn new(serial: u64, client_id: &str, settings: Arc<SessionSettings>, now: Instant) -> Self {
        Self {
            serial,
            id: Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            state: SessionState::Idle,
            closing: false,
            language: settings.default_language.clone(),
            created_at: Utc::now(),
            last_activity_at: now,
            chunk_count: 0,
            turn: TurnDetector::new(settings.energy_threshold, settings.silence_timeout),
            buffer: AudioAccumulator::new(settings.max_buffer_bytes),
            settings,
        }
    }

    /// Apply one command. Protocol violations become `error` messages; the state
    /// is left untouched in that case.
    pub fn handle(&mut self, command: SessionCommand, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();

        let outcome = match command {
            SessionCommand::Start {
                language,
                session_id,
            } => self.start(language, session_id, now, &mut effects),
            SessionCommand::End => self.end(now, &mut effects),
            SessionCommand::Audio(chunk) => self.ingest(chunk, now, &mut effects),
            SessionCommand::Disconnect => {
                self.terminate("client disconnected", &mut effects);
                Ok(())
            }
            SessionCommand::IdleTimeout => {
                self.terminate("idle timeout", &mut effects);
                Ok(())
            }
        };

        if let Err(err) = outcome {
            debug!(client_id = %self.client_id, session_id = %self.id, error = %err, "Rejected message");
            effects.push(Effect::Send(ServerMessage::error(err.to_string())));
        }

        effects
    }

    fn start(
        &mut self,
        language: Option<String>,
        session_id: Option<String>,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) -> Result<(), GatewayError> {
        match self.state {
            SessionState::Ended => return Err(GatewayError::protocol("session has ended")),
            SessionState::Active if self.closing => {
                return Err(GatewayError::protocol(
                    "session is ending; wait for session_ended before starting again",
                ))
            }
            SessionState::Active => {
                // New logical turn: whatever is buffered belongs to the old one
                self.dispatch_final(effects);
            }
            SessionState::Idle => {}
        }

        self.id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        self.language = language.unwrap_or_else(|| self.settings.default_language.clone());
        self.activate(now, effects);
        Ok(())
    }

    fn activate(&mut self, now: Instant, effects: &mut Vec<Effect>) {
        self.turn.reset();
        self.buffer.flush();
        self.chunk_count = 0;
        self.state = SessionState::Active;
        self.last_activity_at = now;

        info!(
            client_id = %self.client_id,
            session_id = %self.id,
            language = %self.language,
            "Session started"
        );
        effects.push(Effect::Send(ServerMessage::session_started(
            &self.client_id,
            &self.id,
            &self.language,
        )));
    }

    fn end(&mut self, now: Instant, effects: &mut Vec<Effect>) -> Result<(), GatewayError> {
        match self.state {
            SessionState::Idle => Err(GatewayError::protocol("no active session to end")),
            SessionState::Ended => Err(GatewayError::protocol("session has ended")),
            SessionState::Active if self.closing => {
                Err(GatewayError::protocol("session is already ending"))
            }
            SessionState::Active => {
                self.closing = true;
                self.last_activity_at = now;
                self.dispatch_final(effects);
                info!(
                    client_id = %self.client_id,
                    session_id = %self.id,
                    chunks = self.chunk_count,
                    "Session ending"
                );
                effects.push(Effect::EndAfterPending {
                    session_serial: self.serial,
                });
                Ok(())
            }
        }
    }

    fn ingest(&mut self, chunk: Vec<u8>, now: Instant, effects: &mut Vec<Effect>) -> Result<(), GatewayError> {
        match self.state {
            SessionState::Ended => return Err(GatewayError::protocol("session has ended")),
            SessionState::Active if self.closing => {
                return Err(GatewayError::protocol("session is ending; audio rejected"))
            }
            _ => {}
        }

        // A chunk that can never fit is dropped before it reaches the detector
        let limit = self.buffer.max_bytes();
        if chunk.len() > limit {
            warn!(session_id = %self.id, bytes = chunk.len(), limit, "Oversized audio chunk dropped");
            effects.push(Effect::Send(ServerMessage::error(format!(
                "audio chunk of {} bytes exceeds the {} byte buffer limit and was dropped",
                chunk.len(),
                limit
            ))));
            return Ok(());
        }

        if self.state == SessionState::Idle {
            debug!(client_id = %self.client_id, "Audio before start_session; activating session");
            self.activate(now, effects);
        }

        self.last_activity_at = now;
        self.chunk_count += 1;

        let event = self.turn.update(&chunk, now);
        let in_turn = self.turn.is_speaking() || matches!(event, Some(TurnEvent::TurnComplete));
        self.append(chunk, in_turn, effects);

        match event {
            Some(TurnEvent::TurnComplete) => {
                info!(
                    client_id = %self.client_id,
                    session_id = %self.id,
                    buffered_bytes = self.buffer.byte_len(),
                    "Turn complete"
                );
                effects.push(Effect::Send(ServerMessage::speech_status(
                    &self.client_id,
                    &self.id,
                    SpeechStatus::InputComplete,
                )));
                self.dispatch_final(effects);
            }
            Some(TurnEvent::SpeechStarted) => {
                info!(client_id = %self.client_id, session_id = %self.id, "Speech started");
                effects.push(Effect::Send(ServerMessage::speech_status(
                    &self.client_id,
                    &self.id,
                    SpeechStatus::SpeechStarted,
                )));
                self.maybe_dispatch_partial(effects);
            }
            None if self.turn.is_speaking() => self.maybe_dispatch_partial(effects),
            None => self.trim_lead_in(),
        }

        Ok(())
    }

    /// Between turns only the lead-in window is kept; older silence is dropped.
    fn trim_lead_in(&mut self) {
        let dropped = self.buffer.retain_lead_in(self.settings.lead_in_bytes);
        if dropped > 0 {
            trace!(
                session_id = %self.id,
                dropped_bytes = dropped,
                kept_bytes = self.buffer.byte_len(),
                reason = "no speech in progress",
                "Audio dropped from accumulator"
            );
        }
    }

    /// Append a chunk. When the cap would be exceeded a turn in progress is
    /// flushed as final; lead-in silence is simply dropped.
    fn append(&mut self, chunk: Vec<u8>, in_turn: bool, effects: &mut Vec<Effect>) {
        let limit = self.buffer.max_bytes();
        let attempted = self.buffer.byte_len() + chunk.len();
        if attempted > limit && !in_turn {
            let dropped = self.buffer.retain_lead_in(0);
            trace!(session_id = %self.id, dropped_bytes = dropped, reason = "lead-in over cap", "Audio dropped from accumulator");
        } else if attempted > limit {
            let overflow = GatewayError::BufferOverflow { limit, attempted };
            warn!(session_id = %self.id, error = %overflow, "Forcing final flush");
            self.dispatch_final(effects);
            effects.push(Effect::Send(ServerMessage::error(overflow.to_string())));
        }

        if let Err(err) = self.buffer.append(chunk) {
            effects.push(Effect::Send(ServerMessage::error(err.to_string())));
        }
    }

    fn maybe_dispatch_partial(&mut self, effects: &mut Vec<Effect>) {
        if self.buffer.chunks_since_partial() < self.settings.partial_every_chunks {
            return;
        }

        // Too little new audio: keep accumulating and re-check on the next chunk
        if self.buffer.bytes_since_partial() < self.settings.min_partial_bytes {
            return;
        }

        let audio = self.buffer.take_partial();
        effects.push(Effect::Recognize(self.task(audio, false)));
    }

    fn dispatch_final(&mut self, effects: &mut Vec<Effect>) {
        if self.buffer.is_empty() {
            return;
        }
        let audio = self.buffer.flush();
        effects.push(Effect::Recognize(self.task(audio, true)));
    }

    fn task(&self, audio: Vec<u8>, is_final: bool) -> RecognitionTask {
        RecognitionTask {
            session_serial: self.serial,
            session_id: self.id.clone(),
            audio,
            language: self.language.clone(),
            is_final,
        }
    }

    /// Best-effort final flush and move to Ended. No acknowledgment is sent.
    fn terminate(&mut self, reason: &str, effects: &mut Vec<Effect>) {
        if self.state == SessionState::Ended {
            return;
        }

        if self.state == SessionState::Active {
            self.dispatch_final(effects);
        }

        info!(
            client_id = %self.client_id,
            session_id = %self.id,
            chunks = self.chunk_count,
            reason,
            "Session terminated"
        );
        self.state = SessionState::Ended;
        self.closing = false;
    }

    /// Finish a requested end. Returns the `session_ended` acknowledgment, once.
    pub fn complete_end(&mut self) -> Option<ServerMessage> {
        if self.state == SessionState::Ended {
            return None;
        }

        self.state = SessionState::Ended;
        self.closing = false;
        info!(
            client_id = %self.client_id,
            session_id = %self.id,
            chunks = self.chunk_count,
            "Session ended"
        );
        Some(ServerMessage::session_ended(
            &self.client_id,
            &self.id,
            self.chunk_count,
        ))
    }

    /// Shape a delivered recognition for the client.
    ///
    /// Results of an ended session are dropped, as are partials with nothing to show.
    pub fn result_message(
        &self,
        session_id: &str,
        is_final: bool,
        result: RecognitionResult,
    ) -> Option<ServerMessage> {
        if self.state == SessionState::Ended {
            debug!(session_id, is_final, "Result for ended session discarded");
            return None;
        }

        if !is_final && result.transcript.is_empty() && result.error.is_none() {
            return None;
        }

        Some(ServerMessage::result(&self.client_id, session_id, is_final, result))
    }

    /// Connection details for `server_status`. The id is only reported once the
    /// client has been told about it in `session_started`.
    pub fn client_info(&self) -> ClientInfo {
        ClientInfo {
            id: self.client_id.clone(),
            session_id: (self.state != SessionState::Idle).then(|| self.id.clone()),
            session_active: self.is_active(),
            total_chunks: self.chunk_count,
        }
    }

    pub fn is_idle_expired(&self, now: Instant) -> bool {
        self.state != SessionState::Ended
            && now.saturating_duration_since(self.last_activity_at) >= self.settings.idle_timeout
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffer.byte_len()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn speech_ever_detected(&self) -> bool {
        self.turn.speech_ever_detected()
    }

    pub fn is_speaking(&self) -> bool {
        self.turn.is_speaking()
    }
}
