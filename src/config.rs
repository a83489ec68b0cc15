use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::BackendTarget;
use crate::format::FormatMode;
use crate::session::{IdStrategy, SessionIds};

/// Top-level relay config, loaded from TOML. Every field has a default, so an
/// empty file (or no file at all) is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Address for the HTTP/WebSocket listener.
    pub bind: SocketAddr,
    pub backend: BackendConfig,
    /// How display identifiers are assigned to new sessions.
    pub session_ids: IdStrategy,
    /// Inclusive `[low, high]` range for session identifiers.
    pub id_range: [u32; 2],
    /// Maximum concurrent sessions. 0 means unlimited.
    pub max_sessions: usize,
    /// Formatter applied to backend output.
    pub format: FormatMode,
    pub tls: Option<TlsConfig>,
}

/// The line-oriented TCP service every session connects to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    /// PEM certificate chain.
    pub cert: PathBuf,
    /// PEM private key.
    pub key: PathBuf,
    /// Optional plain-HTTP listener that redirects every request to HTTPS.
    pub redirect_bind: Option<SocketAddr>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3000)),
            backend: BackendConfig::default(),
            session_ids: IdStrategy::Random,
            id_range: [0, 100],
            max_sessions: 256,
            format: FormatMode::Html,
            tls: None,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8089,
            connect_timeout_secs: 10,
        }
    }
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub bind: Option<SocketAddr>,
    pub backend_host: Option<String>,
    pub backend_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub redirect_bind: Option<SocketAddr>,
}

impl BridgeConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        Ok(Some(config))
    }

    /// Resolve the config to use at startup.
    ///
    /// An explicitly requested file must exist; the default location is
    /// optional and falls back to built-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        match explicit {
            Some(path) => {
                Self::load(path)?.ok_or_else(|| ConfigError::NotFound(path.to_path_buf()))
            }
            None => match default_config_path() {
                Some(path) => {
                    let loaded = Self::load(&path)?;
                    if loaded.is_some() {
                        tracing::debug!(path = %path.display(), "loaded config");
                    }
                    Ok(loaded.unwrap_or_default())
                }
                None => Ok(Self::default()),
            },
        }
    }

    /// Apply command-line overrides, then validate the result.
    pub fn apply(&mut self, overrides: Overrides) -> Result<(), ConfigError> {
        if let Some(bind) = overrides.bind {
            self.bind = bind;
        }
        if let Some(host) = overrides.backend_host {
            self.backend.host = host;
        }
        if let Some(port) = overrides.backend_port {
            self.backend.port = port;
        }

        match (overrides.tls_cert, overrides.tls_key) {
            (Some(cert), Some(key)) => {
                let redirect_bind = self.tls.as_ref().and_then(|t| t.redirect_bind);
                self.tls = Some(TlsConfig {
                    cert,
                    key,
                    redirect_bind,
                });
            }
            (None, None) => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "--tls-cert and --tls-key must be given together".to_string(),
                ))
            }
        }

        if let Some(redirect) = overrides.redirect_bind {
            match self.tls.as_mut() {
                Some(tls) => tls.redirect_bind = Some(redirect),
                None => {
                    return Err(ConfigError::Invalid(
                        "an HTTPS redirect listener requires TLS to be configured".to_string(),
                    ))
                }
            }
        }

        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.host.trim().is_empty() {
            return Err(ConfigError::Invalid("backend.host must not be empty".into()));
        }
        if self.backend.port == 0 {
            return Err(ConfigError::Invalid("backend.port must not be 0".into()));
        }
        if self.backend.connect_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "backend.connect_timeout_secs must be at least 1".into(),
            ));
        }
        let [low, high] = self.id_range;
        if low > high {
            return Err(ConfigError::Invalid(format!(
                "id_range is empty: {} > {}",
                low, high
            )));
        }
        Ok(())
    }

    pub fn backend_target(&self) -> BackendTarget {
        BackendTarget {
            host: self.backend.host.clone(),
            port: self.backend.port,
            connect_timeout: Duration::from_secs(self.backend.connect_timeout_secs),
        }
    }

    pub fn session_ids(&self) -> SessionIds {
        SessionIds::new(self.session_ids, self.id_range[0]..=self.id_range[1])
    }

    pub fn session_limit(&self) -> Option<usize> {
        (self.max_sessions > 0).then_some(self.max_sessions)
    }
}

/// `<config dir>/mudbridge/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("mudbridge").join("config.toml"))
}

/// Errors that can occur when loading or validating config.
#[derive(Debug)]
pub enum ConfigError {
    NotFound(PathBuf),
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(path) => write!(f, "Config file not found: {}", path.display()),
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(detail) => write!(f, "Invalid config: {}", detail),
        }
    }
}

impl std::error::Error for ConfigError {}
