//! # WebSocket Streaming Handler
//!
//! Serves the streaming protocol on `server.ws_path` (default `/asr`).
//!
//! ## Connection lifecycle:
//! 1. **Upgrade**: refused with 503 while the gateway is not ready
//! 2. **Welcome**: the actor greets the client with its `client_id` and server info
//! 3. **Streaming**: text frames carry control messages, binary frames carry PCM audio;
//!    the session is created on the first decoded message
//! 4. **Results**: recognitions run on the dispatcher and come back through the
//!    connection's outbox as `Delivery` messages, in submission order
//! 5. **Teardown**: disconnect, heartbeat loss or idle timeout end the session with a
//!    best-effort final flush
//!
//! ## Actor Model:
//! Each connection is one actor, so frames from a client are processed strictly one
//! at a time while other connections and the worker pool run independently. The
//! actor never waits on recognition; it only enqueues it.

use crate::error::{AppError, GatewayError};
use crate::protocol::{self, Inbound, ServerInfo, ServerMessage};
use crate::session::{Effect, SessionCommand, SharedSession};
use crate::state::AppState;
use crate::transcription::{Delivery, SessionOutbox};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How often idle sessions are looked for, at most.
const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// WebSocket actor for one client connection.
pub struct GatewaySocket {
    client_id: String,
    state: web::Data<AppState>,
    /// Created on the first decoded message, cleared once the session has ended
    session: Option<SharedSession>,
    /// Ordered result queue; started together with the actor
    outbox: Option<SessionOutbox>,
    /// Last frame of any kind from the client
    last_heartbeat: Instant,
    /// Last decoded client message, for idle checks before a session exists
    last_message_at: Instant,
}

impl GatewaySocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        let now = Instant::now();
        Self {
            client_id: Uuid::new_v4().to_string(),
            state,
            session: None,
            outbox: None,
            last_heartbeat: now,
            last_message_at: now,
        }
    }

    fn send(&self, message: ServerMessage, ctx: &mut ws::WebsocketContext<Self>) {
        if let ServerMessage::Error { message: text, .. } = &message {
            self.state.record(|m| m.protocol_errors += 1);
            debug!(client_id = %self.client_id, error = %text, "Sending error to client");
        }
        ctx.text(message.encode());
    }

    /// The connection's session, created on first use.
    fn session(&mut self) -> Result<SharedSession, GatewayError> {
        if let Some(session) = &self.session {
            return Ok(session.clone());
        }

        let session = self.state.registry.get_or_create(&self.client_id)?;
        self.session = Some(session.clone());
        Ok(session)
    }

    fn handle_inbound(
        &mut self,
        decoded: Result<Inbound, GatewayError>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let inbound = match decoded {
            Ok(inbound) => inbound,
            Err(err) => {
                self.send(ServerMessage::error(err.to_string()), ctx);
                return;
            }
        };

        self.last_message_at = Instant::now();

        let session = match self.session() {
            Ok(session) => session,
            Err(err) => {
                warn!(client_id = %self.client_id, error = %err, "Refusing session");
                self.send(ServerMessage::error(err.to_string()), ctx);
                ctx.close(Some((ws::CloseCode::Again, err.to_string()).into()));
                ctx.stop();
                return;
            }
        };

        match inbound {
            Inbound::Session(command) => {
                let effects = session.lock().handle(command, Instant::now());
                self.apply(effects, ctx);
            }
            Inbound::Ping { request_id } => {
                self.send(ServerMessage::pong(request_id, self.state.is_ready()), ctx);
            }
            Inbound::GetStatus => {
                let client_info = session.lock().client_info();
                let status = ServerMessage::server_status(
                    self.state.is_ready(),
                    self.state.is_model_loaded(),
                    self.state.dispatcher.engine_name(),
                    self.state.registry.len(),
                    client_info,
                );
                self.send(status, ctx);
            }
        }
    }

    /// Carry out the effects of a session transition.
    fn apply(&mut self, effects: Vec<Effect>, ctx: &mut ws::WebsocketContext<Self>) {
        for effect in effects {
            match effect {
                Effect::Send(message) => self.send(message, ctx),
                Effect::Recognize(task) => {
                    let serial = task.session_serial;
                    let session_id = task.session_id.clone();
                    let is_final = task.is_final;
                    let handle = self.state.dispatcher.submit(task);

                    match &self.outbox {
                        Some(outbox) => outbox.push(serial, session_id, is_final, handle),
                        None => warn!(client_id = %self.client_id, "No outbox; result will not be delivered"),
                    }
                }
                Effect::EndAfterPending { session_serial } => {
                    if let Some(outbox) = &self.outbox {
                        outbox.push_end(session_serial);
                    }
                }
            }
        }
    }

    /// End the session without acknowledgment (disconnect or idle timeout).
    fn terminate_session(&mut self, command: SessionCommand) {
        let Some(session) = self.session.take() else {
            return;
        };

        let (effects, serial) = {
            let mut session = session.lock();
            (session.handle(command, Instant::now()), session.serial())
        };

        // Best-effort final flush: the result is only logged by the dispatcher
        for effect in effects {
            if let Effect::Recognize(task) = effect {
                drop(self.state.dispatcher.submit(task));
            }
        }

        self.state.registry.remove(&self.client_id, serial);
    }

    fn check_idle(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let now = Instant::now();
        let idle_timeout = Duration::from_secs(self.state.config.session.idle_timeout_secs);

        let expired = match &self.session {
            Some(session) => session.lock().is_idle_expired(now),
            None => now.saturating_duration_since(self.last_message_at) >= idle_timeout,
        };

        if !expired {
            return;
        }

        info!(client_id = %self.client_id, idle_secs = idle_timeout.as_secs(), "Closing idle connection");
        self.send(
            ServerMessage::error(format!(
                "session idle for more than {} seconds; closing connection",
                idle_timeout.as_secs()
            )),
            ctx,
        );
        self.terminate_session(SessionCommand::IdleTimeout);
        ctx.close(Some((ws::CloseCode::Normal, "idle timeout").into()));
        ctx.stop();
    }
}

impl Actor for GatewaySocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(client_id = %self.client_id, "WebSocket connection started");
        self.state.record(|m| m.connections_opened += 1);

        self.outbox = Some(SessionOutbox::spawn(ctx.address().recipient()));

        let info = ServerInfo::new(&self.state.config, self.state.dispatcher.engine_name());
        self.send(ServerMessage::welcome(&self.client_id, info), ctx);

        let session_config = &self.state.config.session;
        let heartbeat = Duration::from_secs(session_config.heartbeat_interval_secs);
        let client_timeout = Duration::from_secs(session_config.client_timeout_secs);

        ctx.run_interval(heartbeat, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > client_timeout {
                warn!(client_id = %act.client_id, "WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });

        let idle_check = IDLE_CHECK_INTERVAL.min(Duration::from_secs(session_config.idle_timeout_secs));
        ctx.run_interval(idle_check, |act, ctx| act.check_idle(ctx));
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.terminate_session(SessionCommand::Disconnect);
        self.state.record(|m| m.connections_closed += 1);
        info!(client_id = %self.client_id, "WebSocket connection stopped");
    }
}

/// Handle incoming WebSocket frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for GatewaySocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => {
                self.state.record(|m| m.text_messages += 1);
                self.handle_inbound(protocol::decode_text(&text), ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.state.record(|m| m.binary_messages += 1);
                self.handle_inbound(protocol::decode_binary(&data), ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(client_id = %self.client_id, ?reason, "WebSocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(client_id = %self.client_id, "Received unexpected continuation frame");
                self.send(ServerMessage::error("fragmented frames are not supported"), ctx);
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                let failure = GatewayError::Transport(err.to_string());
                warn!(client_id = %self.client_id, error = %failure, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Recognition results and end acknowledgments, in submission order.
impl Handler<Delivery> for GatewaySocket {
    type Result = ();

    fn handle(&mut self, delivery: Delivery, ctx: &mut Self::Context) {
        let Some(session) = self.session.clone() else {
            debug!(client_id = %self.client_id, ?delivery, "No session; delivery discarded");
            return;
        };

        match delivery {
            Delivery::Result {
                session_serial,
                session_id,
                is_final,
                result,
            } => {
                let message = {
                    let session = session.lock();
                    if session.serial() != session_serial {
                        None
                    } else {
                        session.result_message(&session_id, is_final, result)
                    }
                };

                if let Some(message) = message {
                    self.send(message, ctx);
                }
            }
            Delivery::Ended { session_serial } => {
                let ack = {
                    let mut session = session.lock();
                    if session.serial() != session_serial {
                        return;
                    }
                    session.complete_end()
                };

                if let Some(ack) = ack {
                    self.send(ack, ctx);
                }
                self.state.registry.remove(&self.client_id, session_serial);
                self.session = None;
            }
        }
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Refuses with 503 while the engine is unavailable. Otherwise the connection is
/// handed to a `GatewaySocket` actor with the configured maximum frame size.
pub async fn stream_endpoint(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!(peer = ?req.connection_info().peer_addr(), "WebSocket upgrade request");

    if !state.is_ready() {
        state.record(|m| m.rejected_upgrades += 1);
        let reason = state
            .not_ready_reason()
            .unwrap_or_else(|| "gateway is starting".to_string());
        return Err(AppError::ServiceUnavailable(reason).into());
    }

    let max_frame_bytes = state.config.server.max_frame_bytes;
    ws::WsResponseBuilder::new(GatewaySocket::new(state), &req, stream)
        .frame_size(max_frame_bytes)
        .start()
}
