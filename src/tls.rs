// Backend TLS
//
// Client-side TLS for the call-aware backend connection. The proxy presents
// the configured client certificate and verifies the backend against the
// webpki root set.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::config::TlsConfig;
use crate::error::{ProxyError, ProxyResult};

fn load_certs(path: &Path) -> ProxyResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| ProxyError::Tls(format!("failed to open {}: {}", path.display(), e)))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("failed to parse {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> ProxyResult<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| ProxyError::Tls(format!("failed to open {}: {}", path.display(), e)))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ProxyError::Tls(format!("failed to parse {}: {}", path.display(), e)))?
        .ok_or_else(|| ProxyError::Tls(format!("no private key found in {}", path.display())))
}

/// Build a connector presenting the configured client certificate.
///
/// Returns `Ok(None)` when no certificate is configured.
///
/// # Errors
///
/// Fails if the PEM files cannot be read or rustls rejects the key.
pub fn client_connector(config: &TlsConfig) -> ProxyResult<Option<TlsConnector>> {
    Ok(client_config(config)?.map(|client| TlsConnector::from(Arc::new(client))))
}

/// rustls client settings: webpki roots, the client identity, ALPN `h2`
pub fn client_config(config: &TlsConfig) -> ProxyResult<Option<ClientConfig>> {
    let (Some(cert_path), Some(key_path)) = (&config.client_cert, &config.client_key) else {
        return Ok(None);
    };

    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut client = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ProxyError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(|e| ProxyError::Tls(e.to_string()))?;
    client.alpn_protocols = vec![b"h2".to_vec()];

    Ok(Some(client))
}

/// Run the TLS handshake on an already connected backend socket
pub async fn connect(
    connector: &TlsConnector,
    dial: &str,
    stream: TcpStream,
) -> ProxyResult<TlsStream<TcpStream>> {
    let host = dial
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(dial)
        .trim_start_matches('[')
        .trim_end_matches(']');
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| ProxyError::Tls(format!("invalid server name {:?}: {}", host, e)))?;
    connector
        .connect(server_name, stream)
        .await
        .map_err(|e| ProxyError::Tls(format!("handshake with {} failed: {}", dial, e)))
}
