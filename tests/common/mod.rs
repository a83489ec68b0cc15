#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use mudbridge::api::{router, AppState};
use mudbridge::backend::BackendTarget;
use mudbridge::format::{AnsiHtml, Formatter};
use mudbridge::protocol::PushMessage;
use mudbridge::relay::RelayConfig;
use mudbridge::session::{IdStrategy, SessionIds, SessionRegistry};

/// Upper bound for any single step of a test conversation.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn relay_config(backend: SocketAddr, formatter: Arc<dyn Formatter>) -> RelayConfig {
    RelayConfig {
        target: BackendTarget {
            host: backend.ip().to_string(),
            port: backend.port(),
            connect_timeout: Duration::from_secs(2),
        },
        formatter,
        ids: SessionIds::new(IdStrategy::Sequential, 1..=1000),
    }
}

/// App state relaying to `backend` with HTML formatting and no session limit.
pub fn create_test_state(backend: SocketAddr) -> AppState {
    AppState::new(
        SessionRegistry::with_max_sessions(None),
        relay_config(backend, Arc::new(AnsiHtml)),
    )
}

/// Serve the router for `state` on an ephemeral port.
pub async fn start_server(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

/// A stand-in game server: a TCP listener the relay dials into.
pub struct FakeBackend {
    listener: TcpListener,
    pub addr: SocketAddr,
}

impl FakeBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        Self { listener, addr }
    }

    /// Wait for the relay to open its connection for a new session.
    pub async fn accept(&self) -> BufReader<TcpStream> {
        let (stream, _) = tokio::time::timeout(STEP_TIMEOUT, self.listener.accept())
            .await
            .expect("relay should connect to the backend in time")
            .unwrap();
        BufReader::new(stream)
    }
}

/// An address nothing is listening on.
pub async fn unreachable_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Read one newline-terminated line the relay wrote to the backend.
pub async fn read_line(conn: &mut BufReader<TcpStream>) -> String {
    let mut line = String::new();
    tokio::time::timeout(STEP_TIMEOUT, conn.read_line(&mut line))
        .await
        .expect("backend should receive a line in time")
        .unwrap();
    line
}

/// True once the relay has closed its end of the backend connection.
pub async fn backend_sees_eof(conn: &mut BufReader<TcpStream>) -> bool {
    let mut rest = String::new();
    match tokio::time::timeout(STEP_TIMEOUT, conn.read_line(&mut rest)).await {
        Ok(Ok(0)) => true,
        Ok(Err(_)) => true,
        _ => false,
    }
}

pub async fn connect(addr: SocketAddr) -> Client {
    let url = format!("ws://{}/ws", addr);
    let (ws, _response) = tokio::time::timeout(STEP_TIMEOUT, connect_async(&url))
        .await
        .expect("WebSocket connect should not time out")
        .expect("WebSocket connect should succeed");
    ws
}

pub async fn send_command(ws: &mut Client, command: &str) {
    let frame = PushMessage::ChatMessage(command.to_string()).encode();
    ws.send(Message::Text(frame.into())).await.unwrap();
}

/// Next push message, or `None` once the server closes the connection.
pub async fn recv(ws: &mut Client) -> Option<PushMessage> {
    loop {
        let msg = tokio::time::timeout(STEP_TIMEOUT, ws.next())
            .await
            .expect("should receive a frame in time");
        match msg {
            Some(Ok(Message::Text(text))) => {
                return Some(PushMessage::decode(text.as_str()).expect("valid push message"))
            }
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

/// Read the identifier the server sends first.
pub async fn recv_id(ws: &mut Client) -> u32 {
    match recv(ws).await {
        Some(PushMessage::Id(id)) => id,
        other => panic!("expected id event first, got {:?}", other),
    }
}

/// Collect chat messages until one contains `needle`, returning the joined text.
pub async fn recv_until(ws: &mut Client, needle: &str) -> String {
    let mut seen = String::new();
    while !seen.contains(needle) {
        match recv(ws).await {
            Some(PushMessage::ChatMessage(text)) => seen.push_str(&text),
            other => panic!("expected output containing {needle:?}, got {other:?} after {seen:?}"),
        }
    }
    seen
}

/// Read past any remaining output to the close frame.
pub async fn recv_close(ws: &mut Client) -> Option<CloseFrame> {
    loop {
        let msg = tokio::time::timeout(STEP_TIMEOUT, ws.next())
            .await
            .expect("should receive close in time");
        match msg {
            Some(Ok(Message::Close(frame))) => return frame,
            Some(Ok(_)) => continue,
            None | Some(Err(_)) => return None,
        }
    }
}

/// Poll until `check` holds or the step timeout expires.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + STEP_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
