//! Session manager: the per-connection relay loop.
//!
//! One task per push connection. It sends the session identifier, opens the
//! backend socket, and then multiplexes three sources until one of them ends
//! the session: backend events, client frames, and the server shutdown
//! signal. Whatever ends the session, the backend socket is closed and the
//! registry entry released before the task returns.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};

use crate::api::AppState;
use crate::backend::{BackendError, BackendEvent, BackendTarget};
use crate::config::BridgeConfig;
use crate::format::{format_or_raw, ChunkCarry, Formatter};
use crate::protocol::PushMessage;
use crate::session::{is_quit_command, Session, SessionIds, SessionSlot, SessionState};

/// Upper bound on delivering the terminal notice and close frame to a client
/// that has stopped reading.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Settings shared by every session.
pub struct RelayConfig {
    pub target: BackendTarget,
    pub formatter: Arc<dyn Formatter>,
    pub ids: SessionIds,
}

impl RelayConfig {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            target: config.backend_target(),
            formatter: config.format.formatter(),
            ids: config.session_ids(),
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Quit,
    ClientDisconnected,
    BackendClosed,
    BackendFailed,
    /// The backend stopped reading and its input queue filled up.
    BackendStalled,
    ServerShutdown,
}

impl EndReason {
    /// A client that went away cannot be told anything.
    pub fn notifies_client(self) -> bool {
        self != EndReason::ClientDisconnected
    }

    fn close_reason(self) -> &'static str {
        match self {
            EndReason::Quit => "quit",
            EndReason::ClientDisconnected => "client disconnected",
            EndReason::BackendClosed => "backend closed",
            EndReason::BackendFailed => "backend unavailable",
            EndReason::BackendStalled => "backend not responding",
            EndReason::ServerShutdown => "server shutting down",
        }
    }
}

enum ClientAction {
    Continue,
    End(EndReason),
}

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

/// Drive one session from upgrade to teardown.
pub async fn run_session(socket: WebSocket, slot: SessionSlot, state: AppState) {
    let (_guard, mut shutdown_rx) = state.shutdown.register();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let id = slot.id();
    let (mut session, mut backend_events) = Session::open(slot, state.relay.target.clone());
    tracing::info!(
        session = id,
        conn = session.key(),
        backend = %state.relay.target,
        "client connected"
    );

    let reason = if send(&mut ws_tx, PushMessage::Id(id)).await.is_err() {
        EndReason::ClientDisconnected
    } else {
        relay(
            &mut session,
            &mut backend_events,
            &mut ws_tx,
            &mut ws_rx,
            &mut shutdown_rx,
            state.relay.formatter.as_ref(),
        )
        .await
    };

    session.close();

    if reason.notifies_client() {
        let farewell = async {
            send(&mut ws_tx, PushMessage::disconnected()).await?;
            let frame = CloseFrame {
                code: close_code::NORMAL,
                reason: reason.close_reason().into(),
            };
            ws_tx.send(Message::Close(Some(frame))).await?;
            ws_tx.flush().await
        };
        match tokio::time::timeout(CLOSE_TIMEOUT, farewell).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(session = id, error = %e, "failed to deliver disconnect notice"),
            Err(_) => tracing::debug!(session = id, "timed out delivering disconnect notice"),
        }
    }

    tracing::info!(session = id, conn = session.key(), ?reason, "session ended");
}

async fn relay(
    session: &mut Session,
    backend_events: &mut mpsc::Receiver<BackendEvent>,
    ws_tx: &mut WsSink,
    ws_rx: &mut WsStream,
    shutdown_rx: &mut watch::Receiver<bool>,
    formatter: &dyn Formatter,
) -> EndReason {
    if *shutdown_rx.borrow() {
        return EndReason::ServerShutdown;
    }

    let mut carry = ChunkCarry::new();
    loop {
        tokio::select! {
            event = backend_events.recv() => match event {
                Some(BackendEvent::Connected) => {
                    session.transition(SessionState::Active);
                }
                Some(BackendEvent::Data(chunk)) => {
                    let ready = carry.complete(&chunk);
                    if ready.is_empty() {
                        continue;
                    }
                    if deliver(ws_tx, formatter, &ready).await.is_err() {
                        return EndReason::ClientDisconnected;
                    }
                }
                Some(BackendEvent::Closed) | None => {
                    return flush_then(ws_tx, formatter, &mut carry, EndReason::BackendClosed).await;
                }
                Some(BackendEvent::Failed(e)) => {
                    tracing::warn!(session = session.id(), error = %e, "backend failed");
                    return flush_then(ws_tx, formatter, &mut carry, EndReason::BackendFailed).await;
                }
            },

            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let ClientAction::End(reason) = on_client_message(session, text.as_str()) {
                        return reason;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return EndReason::ClientDisconnected,
                Some(Ok(_)) => continue, // binary frames ignored; ping/pong handled by axum
                Some(Err(e)) => {
                    tracing::debug!(session = session.id(), error = %e, "push connection error");
                    return EndReason::ClientDisconnected;
                }
            },

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return EndReason::ServerShutdown;
                }
            }
        }
    }
}

/// Format and send one complete run of backend output.
async fn deliver(ws_tx: &mut WsSink, formatter: &dyn Formatter, raw: &[u8]) -> Result<(), axum::Error> {
    let markup = format_or_raw(formatter, raw);
    send(ws_tx, PushMessage::ChatMessage(markup)).await
}

/// Deliver bytes still held at a chunk boundary before the session ends.
async fn flush_then(
    ws_tx: &mut WsSink,
    formatter: &dyn Formatter,
    carry: &mut ChunkCarry,
    reason: EndReason,
) -> EndReason {
    let rest = carry.flush();
    if !rest.is_empty() && deliver(ws_tx, formatter, &rest).await.is_err() {
        return EndReason::ClientDisconnected;
    }
    reason
}

fn on_client_message(session: &Session, text: &str) -> ClientAction {
    let command = match PushMessage::decode(text) {
        Ok(PushMessage::ChatMessage(command)) => command,
        Ok(other) => {
            tracing::debug!(session = session.id(), event = other.event_name(), "ignoring client event");
            return ClientAction::Continue;
        }
        Err(e) => {
            tracing::debug!(session = session.id(), error = %e, "ignoring malformed frame");
            return ClientAction::Continue;
        }
    };

    if command.is_empty() {
        return ClientAction::Continue;
    }
    if is_quit_command(&command) {
        tracing::debug!(session = session.id(), "quit requested");
        return ClientAction::End(EndReason::Quit);
    }

    match session.forward_command(&command) {
        Ok(()) => ClientAction::Continue,
        Err(BackendError::Backpressure) => {
            tracing::warn!(session = session.id(), "backend stopped reading, ending session");
            ClientAction::End(EndReason::BackendStalled)
        }
        Err(e) => {
            // The terminal backend event follows and ends the session.
            tracing::debug!(session = session.id(), error = %e, "dropped command for closed backend");
            ClientAction::Continue
        }
    }
}

async fn send(ws_tx: &mut WsSink, msg: PushMessage) -> Result<(), axum::Error> {
    tracing::trace!(event = msg.event_name(), "relay -> client");
    ws_tx.send(Message::Text(msg.encode().into())).await
}
