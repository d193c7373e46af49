//! Unix Socket Listener
//!
//! Local clients connect through a socket file. The file is created with
//! 0600 permissions; a stale file left by a previous run is replaced.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::UnixListener;

use parley_core::{Connection, Origin};

use super::Acceptor;

/// Accepts clients on a Unix domain socket
pub struct UnixAcceptor {
    listener: UnixListener,
    path: PathBuf,
}

impl UnixAcceptor {
    /// Prepare the socket path and bind
    pub fn bind(path: &Path) -> Result<Self> {
        prepare_socket(path)?;

        let listener = UnixListener::bind(path)
            .with_context(|| format!("Failed to bind to {}", path.display()))?;

        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;

        tracing::info!(path = %path.display(), "Listening on Unix socket");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Socket file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Create the parent directory if needed and remove a stale socket file
fn prepare_socket(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create socket directory: {}", parent.display())
            })?;
            tracing::info!(path = %parent.display(), "Created socket directory");
        }
    }

    if path.exists() {
        tracing::warn!(path = %path.display(), "Removing stale socket file");
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket: {}", path.display()))?;
    }

    Ok(())
}

/// Remove the socket file, logging instead of failing
pub fn remove_socket_file(path: &Path) {
    if path.exists() {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::info!(path = %path.display(), "Socket file removed"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove socket file"),
        }
    }
}

#[async_trait]
impl Acceptor for UnixAcceptor {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn local_addr(&self) -> String {
        self.path().display().to_string()
    }

    async fn accept(&mut self) -> io::Result<Connection> {
        let (stream, _addr) = self.listener.accept().await?;
        let conn = Connection::new(stream, Origin::human("unix"));
        tracing::debug!(conn_id = %conn.id(), "Unix client accepted");
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;

    #[tokio::test]
    async fn test_bind_sets_owner_only_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("parley.sock");

        let acceptor = UnixAcceptor::bind(&path).unwrap();

        let mode = std::fs::metadata(acceptor.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.sock");
        std::fs::write(&path, b"stale").unwrap();

        let acceptor = UnixAcceptor::bind(&path).unwrap();
        assert!(acceptor.path().exists());

        remove_socket_file(&path);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_accepts_client() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("parley.sock");
        let mut acceptor = UnixAcceptor::bind(&path).unwrap();

        let mut client = UnixStream::connect(&path).await.unwrap();
        let mut conn = acceptor.accept().await.unwrap();
        assert_eq!(conn.origin(), Origin::human("unix"));

        client.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 8];
        let n = conn.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi");
    }
}
