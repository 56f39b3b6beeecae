//! The workspace server: TLS listener, per-connection workers, and
//! the shared stores they dispatch against.
//!
//! On-disk layout under the data directory:
//!
//! ```text
//! mac.key           server-private HMAC key for ledger integrity
//! users.txt(.mac)   credential ledger
//! workspaces.txt(.mac)  membership ledger
//! files/<ws>/       stored workspace files and detached signatures
//! keys/             wrapped workspace-key records
//! tmp/              staging area for in-flight uploads
//! ```

use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::Error;
use crate::transfer::Registry;
use crate::transport;

pub use error::StoreError;
pub use users::AuthOutcome;

mod connection;
mod error;
mod integrity;
mod routes;
mod users;
mod workspaces;

use users::UserStore;
use workspaces::WorkspaceStore;

/// Everything the route handlers share across connections.
pub struct ServerState {
    pub(crate) users: UserStore,
    pub(crate) workspaces: WorkspaceStore,
    pub(crate) registry: Registry,
}

impl ServerState {
    /// Open a server data directory, creating the layout on first
    /// run. Both ledgers must pass integrity verification; a tampered
    /// ledger refuses to load rather than serving from it.
    pub fn open(data_dir: &Path) -> Result<ServerState, Error> {
        let files_root = data_dir.join("files");
        let keys_root = data_dir.join("keys");
        let temp_dir = data_dir.join("tmp");
        for dir in [data_dir, &files_root, &keys_root, &temp_dir] {
            std::fs::create_dir_all(dir).map_err(StoreError::Io)?;
        }

        let mac_key = integrity::load_or_create_mac_key(&data_dir.join("mac.key"))?;
        let users_path = data_dir.join("users.txt");
        let workspaces_path = data_dir.join("workspaces.txt");
        integrity::verify_file_authenticity(&users_path, &mac_key)?;
        integrity::verify_file_authenticity(&workspaces_path, &mac_key)?;

        let users = UserStore::open(users_path, mac_key.clone())?;
        let workspaces =
            WorkspaceStore::open(workspaces_path, files_root, keys_root, mac_key)?;

        let registry = Registry::new(temp_dir);
        let swept = registry.sweep_orphans().map_err(StoreError::Io)?;
        if swept > 0 {
            tracing::info!(swept, "removed orphaned staging files");
        }

        Ok(ServerState {
            users,
            workspaces,
            registry,
        })
    }

    /// Serve a single already-established stream. Exposed so the
    /// listener and the tests share one code path.
    pub async fn serve_connection<S>(self: &Arc<ServerState>, stream: S)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        if let Err(e) = connection::serve(Arc::clone(self), stream).await {
            tracing::warn!("connection terminated: {e}");
        }
    }
}

pub struct Server {
    state: Arc<ServerState>,
    listener: TcpListener,
    acceptor: TlsAcceptor,
}

impl Server {
    /// Bind the TLS listener and open the data directory.
    pub async fn bind(
        address: &str,
        data_dir: &Path,
        certificate: &Path,
        private_key: &Path,
    ) -> Result<Server, Error> {
        let state = Arc::new(ServerState::open(data_dir)?);
        let acceptor = transport::acceptor(certificate, private_key)?;
        let listener = TcpListener::bind(address).await?;
        tracing::info!(address = %listener.local_addr()?, "listening");

        Ok(Server {
            state,
            listener,
            acceptor,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop; runs until the process is stopped.
    pub async fn run(self) -> Result<(), Error> {
        loop {
            let (tcp, peer) = self.listener.accept().await?;
            let acceptor = self.acceptor.clone();
            let state = Arc::clone(&self.state);

            tokio::spawn(async move {
                match acceptor.accept(tcp).await {
                    Ok(tls) => state.serve_connection(tls).await,
                    Err(e) => tracing::warn!(%peer, "TLS handshake failed: {e}"),
                }
            });
        }
    }
}
