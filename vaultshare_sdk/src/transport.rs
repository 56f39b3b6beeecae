//! TCP + TLS plumbing shared by the server listener and the client
//! connector. Certificates and keys are PEM files on disk; the client
//! trusts exactly the configured root.

use rustls::{ClientConfig, RootCertStore, ServerConfig};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client;
use tokio_rustls::{TlsAcceptor, TlsConnector};

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("connection to '{0}' failed: {1}")]
    Connection(String, std::io::Error),
    #[error("{0}")]
    Tls(#[from] rustls::Error),
    #[error("missing TLS certificate or key file '{0}'")]
    MissingFile(String),
    #[error("invalid TLS certificate in '{0}'")]
    Certificate(String),
    #[error("invalid TLS key '{0}'")]
    Key(String),
    #[error("invalid server name '{0}'")]
    ServerName(String),
}

pub fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    CertificateDer::pem_file_iter(path)
        .map_err(|_| TransportError::MissingFile(path.display().to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| TransportError::Certificate(path.display().to_string()))
}

pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    PrivateKeyDer::from_pem_file(path)
        .map_err(|_| TransportError::Key(path.display().to_string()))
}

/// Build the server side acceptor from a certificate chain and key.
pub fn acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TransportError> {
    let certs = load_certificates(cert_path)?;
    let key = load_key(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build the client side connector, trusting the given root
/// certificate only. Client authentication happens at the
/// application layer, not via TLS client certificates.
pub fn connector(root_ca_path: &Path) -> Result<TlsConnector, TransportError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certificates(root_ca_path)? {
        roots.add(cert)?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

pub async fn connect(
    connector: &TlsConnector,
    address: &str,
    server_name: &str,
) -> Result<client::TlsStream<TcpStream>, TransportError> {
    let tcp = TcpStream::connect(address)
        .await
        .map_err(|e| TransportError::Connection(address.to_string(), e))?;

    let dns_name = ServerName::try_from(server_name.to_owned())
        .map_err(|_| TransportError::ServerName(server_name.to_string()))?;

    connector
        .connect(dns_name, tcp)
        .await
        .map_err(|e| TransportError::Connection(address.to_string(), e))
}
