//! HTTPS listener setup.
//!
//! Reads the PEM certificate chain and private key named in `[tls]` and turns
//! them into the `TlsAcceptor` used by the accept loop in [`crate::server`].

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::TlsAcceptor;

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("cannot read TLS certificate {}: {source}", .path.display())]
    CertRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot read TLS key {}: {source}", .path.display())]
    KeyRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} holds no PEM certificates", .0.display())]
    NoCerts(PathBuf),

    #[error("{} holds no PEM private key", .0.display())]
    NoKey(PathBuf),

    #[error("certificate and key were rejected: {0}")]
    Config(#[from] rustls::Error),
}

/// Build the acceptor for the HTTPS listener from a certificate chain and key.
pub fn load_tls_config(cert: &Path, key: &Path) -> Result<TlsAcceptor, TlsError> {
    let chain = read_cert_chain(cert)?;
    warn_if_key_exposed(key);
    let private_key = read_private_key(key)?;

    // a second install in the same process is a no-op
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let chain_len = chain.len();
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, private_key)?;
    tracing::debug!(cert = %cert.display(), chain_len, "loaded TLS certificate");

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn read_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let unreadable = |source| TlsError::CertRead {
        path: path.to_owned(),
        source,
    };
    let pem = std::fs::read(path).map_err(unreadable)?;
    let chain = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(unreadable)?;
    if chain.is_empty() {
        return Err(TlsError::NoCerts(path.to_owned()));
    }
    Ok(chain)
}

/// PKCS#8, PKCS#1 and SEC1 keys are accepted; the first one in the file wins.
fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let unreadable = |source| TlsError::KeyRead {
        path: path.to_owned(),
        source,
    };
    let pem = std::fs::read(path).map_err(unreadable)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(unreadable)?
        .ok_or_else(|| TlsError::NoKey(path.to_owned()))
}

#[cfg(unix)]
fn warn_if_key_exposed(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    let Ok(metadata) = std::fs::metadata(path) else {
        return;
    };
    let mode = metadata.permissions().mode() & 0o777;
    if others_can_read(mode) {
        tracing::warn!(
            key = %path.display(),
            mode = format_args!("{:o}", mode),
            "TLS key is readable by other users, restrict it to 600"
        );
    }
}

#[cfg(not(unix))]
fn warn_if_key_exposed(_path: &Path) {}

#[cfg(unix)]
fn others_can_read(mode: u32) -> bool {
    mode & 0o004 != 0
}
