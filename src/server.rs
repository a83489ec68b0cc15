//! Listeners and process lifecycle.
//!
//! The router is served either over plain HTTP (`axum::serve`) or over TLS
//! through a manual accept loop, optionally alongside a plain listener that
//! redirects every request to HTTPS. Shutdown first tells every session to
//! say goodbye, waits for them to drain, then stops the listeners.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Redirect, Response},
    Router,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::api::{self, AppState};
use crate::config::BridgeConfig;
use crate::relay::RelayConfig;
use crate::session::SessionRegistry;
use crate::tls::{self, TlsError};

/// How long sessions get to deliver their disconnect notice on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("listener failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("listener task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// Run the relay until `signal` resolves, then drain and stop.
pub async fn run(
    config: BridgeConfig,
    signal: impl Future<Output = ()> + Send,
) -> Result<(), ServerError> {
    let sessions = SessionRegistry::with_max_sessions(config.session_limit());
    let state = AppState::new(sessions, RelayConfig::from_config(&config));
    let shutdown = state.shutdown.clone();
    let app = api::router(state);
    let stop = CancellationToken::new();

    let listener = bind(config.bind).await?;
    let local = listener.local_addr()?;
    let mut tasks = Vec::new();

    match &config.tls {
        Some(tls_config) => {
            let acceptor = tls::load_tls_config(&tls_config.cert, &tls_config.key)?;
            tracing::info!(addr = %local, backend = %config.backend_target(), "HTTPS listening");
            tasks.push(tokio::spawn(serve_tls(listener, acceptor, app, stop.clone())));

            if let Some(redirect_addr) = tls_config.redirect_bind {
                let redirect_listener = bind(redirect_addr).await?;
                tracing::info!(addr = %redirect_addr, "HTTP redirect listening");
                tasks.push(tokio::spawn(serve_plain(
                    redirect_listener,
                    redirect_router(local.port()),
                    stop.clone(),
                )));
            }
        }
        None => {
            tracing::info!(addr = %local, backend = %config.backend_target(), "HTTP listening");
            tasks.push(tokio::spawn(serve_plain(listener, app, stop.clone())));
        }
    }

    signal.await;
    tracing::info!(sessions = shutdown.active_count(), "shutting down");

    shutdown.shutdown();
    if !shutdown.wait_for_all_closed(DRAIN_TIMEOUT).await {
        tracing::warn!(remaining = shutdown.active_count(), "sessions still open after drain timeout");
    }
    stop.cancel();

    for task in tasks {
        task.await??;
    }
    tracing::info!("mudbridge exiting");
    Ok(())
}

/// Serve `app` over plain HTTP until `stop` fires.
pub async fn serve_plain(
    listener: TcpListener,
    app: Router,
    stop: CancellationToken,
) -> Result<(), ServerError> {
    axum::serve(listener, app)
        .with_graceful_shutdown(stop.cancelled_owned())
        .await?;
    Ok(())
}

/// Serve `app` over TLS until `stop` fires. WebSocket upgrades are enabled on
/// every connection.
pub async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    stop: CancellationToken,
) -> Result<(), ServerError> {
    loop {
        let (tcp_stream, peer) = tokio::select! {
            _ = stop.cancelled() => break,
            result = listener.accept() => match result {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::debug!(error = %e, "accept failed");
                    continue;
                }
            }
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(tcp_stream).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(%peer, error = %e, "TLS handshake failed");
                    return;
                }
            };

            let io = hyper_util::rt::TokioIo::new(tls_stream);
            let service = hyper_util::service::TowerToHyperService::new(app);
            let builder =
                hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new());
            if let Err(e) = builder.serve_connection_with_upgrades(io, service).await {
                tracing::debug!(%peer, error = %e, "connection error");
            }
        });
    }
    Ok(())
}

/// Router that answers everything with a permanent redirect to HTTPS.
pub fn redirect_router(https_port: u16) -> Router {
    Router::new()
        .fallback(redirect_to_https)
        .with_state(https_port)
}

async fn redirect_to_https(
    State(https_port): State<u16>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.parse::<axum::http::uri::Authority>().ok());
    let Some(host) = host else {
        return (StatusCode::BAD_REQUEST, "missing Host header").into_response();
    };

    let authority = if https_port == 443 {
        host.host().to_string()
    } else {
        format!("{}:{}", host.host(), https_port)
    };
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    Redirect::permanent(&format!("https://{}{}", authority, path)).into_response()
}
