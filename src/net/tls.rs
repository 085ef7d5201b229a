//! TLS configuration, certificate loading and the TLS accept path.
//!
//! A TLS server is a TCP accept loop with a handshake stage in front of
//! connection creation. A failed handshake drops that peer only.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_rustls::rustls::{self, ServerConfig};
use tokio_rustls::TlsAcceptor;

use crate::net::stream::{accept_loop, StreamServer};
use crate::server::ServerError;

/// Peers that have not finished the handshake by then are dropped.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Load TLS configuration from certificate and key files.
pub fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>, ServerError> {
    // Basic validation
    if !cert_path.exists() {
        return Err(ServerError::Tls(format!("Certificate file not found: {:?}", cert_path)));
    }
    if !key_path.exists() {
        return Err(ServerError::Tls(format!("Private key file not found: {:?}", key_path)));
    }

    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(ServerError::Tls(format!("No certificates found in {:?}", cert_path)));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| ServerError::Tls(format!("No private key found in {:?}", key_path)))?;

    let config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| ServerError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ServerError::Tls(e.to_string()))?;

    Ok(Arc::new(config))
}

/// Accept connections until `shutdown` fires, handshaking each one on its
/// own task.
pub(crate) async fn serve(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    server: Arc<StreamServer>,
    shutdown: broadcast::Receiver<()>,
) {
    let title = server.title.clone();
    accept_loop(title, listener, shutdown, move |stream, peer| {
        let acceptor = acceptor.clone();
        let server = server.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(tls)) => {
                    server.spawn_connection(tls, peer);
                }
                Ok(Err(e)) => {
                    tracing::debug!(title = %server.title, peer = %peer, error = %e, "TLS handshake failed")
                }
                Err(_) => tracing::debug!(title = %server.title, peer = %peer, "TLS handshake timed out"),
            }
        });
    })
    .await
}
