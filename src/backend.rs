//! Backend connector: one TCP socket per session.
//!
//! [`BackendConnector::connect`] spawns a task that owns the socket for its
//! whole lifetime. The caller gets a [`BackendHandle`] for writes and close,
//! plus an event receiver yielding `Connected`, any number of `Data` chunks,
//! and then exactly one terminal event (`Closed` or `Failed`). The socket is
//! dropped on every exit path of the task.
//!
//! Writes never wait on the socket. They go through a bounded queue, and a
//! backend that stops reading long enough to fill it is reported as
//! [`BackendError::Backpressure`] so the caller can end the session.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

const READ_BUF_SIZE: usize = 4096;
const WRITE_QUEUE_CAPACITY: usize = 256;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTarget {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
}

impl fmt::Display for BackendTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("failed to connect to backend {target}: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to backend {0}")]
    ConnectTimeout(String),

    #[error("backend read failed: {0}")]
    Read(#[source] std::io::Error),

    #[error("backend write failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("backend connection is closed")]
    Closed,

    #[error("backend is not accepting input")]
    Backpressure,
}

#[derive(Debug)]
pub enum BackendEvent {
    Connected,
    /// One read from the socket. Chunk boundaries are whatever TCP delivered.
    Data(Bytes),
    /// EOF from the backend, or a local close.
    Closed,
    Failed(BackendError),
}

/// Count of backend sockets currently open across all sessions.
#[derive(Clone, Default)]
pub struct SocketCounter(Arc<AtomicUsize>);

/// Holds one slot of a [`SocketCounter`] while a socket is open.
pub struct SocketGuard(Arc<AtomicUsize>);

impl SocketCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self) -> SocketGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        SocketGuard(Arc::clone(&self.0))
    }

    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Write/close side of a backend connection. Dropping the handle closes it.
pub struct BackendHandle {
    write_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl BackendHandle {
    /// Queue bytes for the backend without waiting. Writes issued while the
    /// connection is still being established are sent, in order, once it is
    /// up. A full queue means the backend has stopped reading.
    pub fn write(&self, data: Bytes) -> Result<(), BackendError> {
        if self.cancel.is_cancelled() {
            return Err(BackendError::Closed);
        }
        self.write_tx.try_send(data).map_err(|e| match e {
            TrySendError::Full(_) => BackendError::Backpressure,
            TrySendError::Closed(_) => BackendError::Closed,
        })
    }

    /// Close the socket. Safe to call any number of times; unsent writes are
    /// discarded.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for BackendHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct BackendConnector;

impl BackendConnector {
    /// Start connecting to `target`. Connection failures are reported as a
    /// `Failed` event rather than returned here.
    pub fn connect(
        target: BackendTarget,
        sockets: SocketCounter,
    ) -> (BackendHandle, mpsc::Receiver<BackendEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();

        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            let terminal = drive(&target, write_rx, &event_tx, task_cancel, sockets).await;
            match &terminal {
                BackendEvent::Failed(e) => {
                    tracing::debug!(backend = %target, error = %e, "backend connection failed")
                }
                _ => tracing::debug!(backend = %target, "backend connection closed"),
            }
            // The receiver may already be gone if the session ended first.
            let _ = event_tx.send(terminal).await;
        });

        (BackendHandle { write_tx, cancel }, event_rx)
    }
}

/// Own the socket until EOF, error, or cancellation. Returns the terminal
/// event; the socket and its counter slot are released before it is sent.
///
/// Reads and writes run side by side so a blocked write never holds up
/// reading, and cancellation interrupts either one.
async fn drive(
    target: &BackendTarget,
    write_rx: mpsc::Receiver<Bytes>,
    event_tx: &mpsc::Sender<BackendEvent>,
    cancel: CancellationToken,
    sockets: SocketCounter,
) -> BackendEvent {
    let connect = tokio::time::timeout(
        target.connect_timeout,
        TcpStream::connect((target.host.as_str(), target.port)),
    );

    let stream = tokio::select! {
        _ = cancel.cancelled() => return BackendEvent::Closed,
        result = connect => match result {
            Err(_) => return BackendEvent::Failed(BackendError::ConnectTimeout(target.to_string())),
            Ok(Err(source)) => {
                return BackendEvent::Failed(BackendError::Connect {
                    target: target.to_string(),
                    source,
                })
            }
            Ok(Ok(stream)) => stream,
        }
    };
    let _slot = sockets.track();
    let _ = stream.set_nodelay(true);
    tracing::debug!(backend = %target, "backend connected");

    if event_tx.send(BackendEvent::Connected).await.is_err() {
        return BackendEvent::Closed;
    }

    let (reader, writer) = stream.into_split();

    tokio::select! {
        biased;

        _ = cancel.cancelled() => BackendEvent::Closed,
        terminal = read_loop(target, reader, event_tx) => terminal,
        terminal = write_loop(target, writer, write_rx) => terminal,
    }
}

async fn read_loop(
    target: &BackendTarget,
    mut reader: OwnedReadHalf,
    event_tx: &mpsc::Sender<BackendEvent>,
) -> BackendEvent {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return BackendEvent::Closed,
            Ok(n) => {
                tracing::trace!(backend = %target, len = n, "backend -> relay");
                let chunk = Bytes::copy_from_slice(&buf[..n]);
                if event_tx.send(BackendEvent::Data(chunk)).await.is_err() {
                    return BackendEvent::Closed;
                }
            }
            Err(e) => return BackendEvent::Failed(BackendError::Read(e)),
        }
    }
}

async fn write_loop(
    target: &BackendTarget,
    mut writer: OwnedWriteHalf,
    mut write_rx: mpsc::Receiver<Bytes>,
) -> BackendEvent {
    while let Some(data) = write_rx.recv().await {
        tracing::trace!(backend = %target, len = data.len(), "relay -> backend");
        if let Err(e) = writer.write_all(&data).await {
            return BackendEvent::Failed(BackendError::Write(e));
        }
    }
    // every handle is gone
    BackendEvent::Closed
}
