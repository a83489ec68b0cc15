//! mudbridge - browser front door for a line-oriented MUD.
//!
//! Serves the terminal page, accepts push connections on `/ws`, and relays
//! each one to its own TCP connection on the game backend.
//!
//! Settings come from `~/.config/mudbridge/config.toml` (or `--config`),
//! with command-line flags taking precedence.

use clap::Parser as ClapParser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use mudbridge::{
    config::{BridgeConfig, ConfigError, Overrides},
    server::{self, ServerError},
};

/// mudbridge - WebSocket to TCP relay for MUD servers
#[derive(ClapParser, Debug)]
#[command(name = "mudbridge", version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file
    #[arg(long, env = "MUDBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind the HTTP/WebSocket listener
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Game backend host
    #[arg(long)]
    backend_host: Option<String>,

    /// Game backend port
    #[arg(long)]
    backend_port: Option<u16>,

    /// PEM certificate chain; enables HTTPS together with --tls-key
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Plain HTTP listener that redirects to HTTPS
    #[arg(long)]
    redirect_bind: Option<SocketAddr>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            bind: self.bind,
            backend_host: self.backend_host.clone(),
            backend_port: self.backend_port,
            tls_cert: self.tls_cert.clone(),
            tls_key: self.tls_key.clone(),
            redirect_bind: self.redirect_bind,
        }
    }
}

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("server error: {0}")]
    Server(#[from] ServerError),

    #[error("could not render config: {0}")]
    Render(#[from] toml::ser::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("mudbridge: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), BridgeError> {
    let mut config = BridgeConfig::resolve(cli.config.as_deref())?;
    config.apply(cli.overrides())?;

    if cli.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    tracing::info!("mudbridge starting");
    server::run(config, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received Ctrl+C"),
        Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl+C"),
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "mudbridge=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}
