//! The TFTP server: dispatcher and per-transfer workers.
//!
//! The dispatcher owns the well-known port and does nothing but accept
//! initial requests: each decoded RRQ/WRQ is handed to a spawned task with
//! its own freshly bound ephemeral socket, whose port becomes the server's
//! transfer ID for that exchange. Anything else arriving on the main socket
//! is ignored. Workers share no state; one failing transfer never disturbs
//! the dispatcher or its siblings.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;

use crate::error::TransferError;
use crate::event::{EventSink, LogSink};
use crate::fsutil::{PartialFile, available_space};
use crate::link::Link;
use crate::netascii::{BlockReader, BlockWriter};
use crate::options::{SessionOptions, negotiate_server};
use crate::protocol::{DEFAULT_TIMEOUT_SECS, ErrorCode, Mode, OptionKey, OptionSet, Packet, RequestKind};
use crate::transfer::{await_ack, receive_blocks, send_blocks};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address of the well-known port, e.g. `0.0.0.0:69`.
    pub bind_address: String,
    /// Directory served files live in and uploads land in.
    pub root_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: format!("0.0.0.0:{}", crate::protocol::DEFAULT_PORT),
            root_dir: PathBuf::from("."),
        }
    }
}

/// The dispatcher.
pub struct TftpServer {
    config: ServerConfig,
    socket: Option<UdpSocket>,
    sink: Arc<dyn EventSink>,
}

impl TftpServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            socket: None,
            sink: Arc::new(LogSink),
        }
    }

    /// Replace the default logging sink.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the well-known port. Useful before [`run`](Self::run) when the
    /// caller wants to learn an ephemeral bind address first.
    pub async fn bind(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(&self.config.bind_address)
            .await
            .with_context(|| format!("failed to bind {}", self.config.bind_address))?;
        tracing::info!(
            "listening on {}, serving {}",
            socket.local_addr()?,
            self.config.root_dir.display()
        );
        self.socket = Some(socket);
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Accept initial requests until the task is cancelled.
    pub async fn run(&mut self) -> Result<()> {
        if self.socket.is_none() {
            self.bind().await?;
        }
        let socket = self.socket.as_ref().expect("bound above");

        let mut buffer = [0u8; 2048];
        loop {
            let (len, client) = socket.recv_from(&mut buffer).await?;
            self.dispatch(&buffer[..len], client);
        }
    }

    /// Decode one datagram from the main socket and spawn a worker for it.
    fn dispatch(&self, datagram: &[u8], client: SocketAddr) {
        let (kind, filename, mode, options) = match Packet::decode(datagram) {
            Ok(Packet::Request {
                kind,
                filename,
                mode,
                options,
            }) => (kind, filename, mode, options),
            Ok(other) => {
                // only initial requests belong on the well-known port
                tracing::debug!("ignoring {} from {} on the request socket", other.opcode(), client);
                return;
            }
            Err(e) => {
                tracing::warn!("undecodable datagram from {}: {}", client, e);
                return;
            }
        };

        tracing::info!("{} {} \"{}\" {}{}", kind.opcode(), client, filename, mode, options);

        let request = AcceptedRequest {
            client,
            kind,
            filename: filename.to_string(),
            mode,
            options,
            root_dir: self.config.root_dir.clone(),
            sink: self.sink.clone(),
        };
        tokio::spawn(async move {
            let filename = request.filename.clone();
            let client = request.client;
            match serve_transfer(request).await {
                Ok(()) => tracing::info!("transfer of \"{}\" with {} complete", filename, client),
                Err(e) => tracing::warn!("transfer of \"{}\" with {} failed: {}", filename, client, e),
            }
        });
    }
}

/// Everything a worker needs, owned, so the dispatcher can move on.
struct AcceptedRequest {
    client: SocketAddr,
    kind: RequestKind,
    filename: String,
    mode: Mode,
    options: OptionSet,
    root_dir: PathBuf,
    sink: Arc<dyn EventSink>,
}

/// Run one transfer on its own ephemeral socket.
async fn serve_transfer(request: AcceptedRequest) -> Result<(), TransferError> {
    let bind_addr = match request.client {
        SocketAddr::V4(_) => "0.0.0.0:0",
        SocketAddr::V6(_) => "[::]:0",
    };
    let socket = UdpSocket::bind(bind_addr).await?;
    tracing::debug!("transfer socket bound to {}", socket.local_addr()?);

    let mut link = Link::established(
        socket,
        request.client,
        Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        request.sink.clone(),
    );

    let path = match resolve_in_root(&request.root_dir, &request.filename) {
        Ok(path) => path,
        Err(e) => {
            if let Some(code) = e.wire_code() {
                link.send_error(code, &e.to_string()).await;
            }
            return Err(e);
        }
    };

    match request.kind {
        RequestKind::Read => serve_read(&mut link, &path, &request).await,
        RequestKind::Write => serve_write(&mut link, &path, &request).await,
    }
}

/// RRQ: the file must exist; its size answers a `tsize` probe.
async fn serve_read(link: &mut Link, path: &Path, request: &AcceptedRequest) -> Result<(), TransferError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) if metadata.is_file() => metadata,
        _ => {
            let e = TransferError::FileNotFound(request.filename.clone());
            link.send_error(ErrorCode::FileNotFound, &e.to_string()).await;
            return Err(e);
        }
    };

    let session = if request.options.is_empty() {
        SessionOptions::default()
    } else {
        let (session, reply) = match negotiate_server(&request.options, metadata.len()) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                if let Some(code) = e.wire_code() {
                    link.send_error(code, &e.to_string()).await;
                }
                return Err(e);
            }
        };
        link.set_timeout(session.timeout);
        let pending = link.send(&Packet::Oack { options: reply }).await?;

        // the client echoes ACK 0 before the first DATA may go out
        let mut buf = vec![0u8; session.datagram_size()];
        await_ack(link, &mut buf, &pending, 0).await?;
        session
    };

    let file = tokio::fs::File::open(path).await?;
    let mut reader = BlockReader::new(file, request.mode);
    send_blocks(link, &mut reader, &session).await
}

/// WRQ: the file must not exist; an announced `tsize` is checked against the
/// space left in the root before anything is accepted.
async fn serve_write(link: &mut Link, path: &Path, request: &AcceptedRequest) -> Result<(), TransferError> {
    if tokio::fs::try_exists(path).await? {
        let e = TransferError::FileExists(request.filename.clone());
        link.send_error(ErrorCode::FileAlreadyExists, &e.to_string()).await;
        return Err(e);
    }

    if let Some(announced) = request.options.get(OptionKey::TransferSize)
        && available_space(&request.root_dir)? < announced
    {
        let e = TransferError::DiskFull(format!("no room for {} announced bytes", announced));
        link.send_error(ErrorCode::DiskFull, &e.to_string()).await;
        return Err(e);
    }

    let (session, pending) = if request.options.is_empty() {
        let pending = link.send(&Packet::Ack { block: 0 }).await?;
        (SessionOptions::default(), pending)
    } else {
        let announced = request.options.get(OptionKey::TransferSize).unwrap_or(0);
        let (session, reply) = match negotiate_server(&request.options, announced) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                if let Some(code) = e.wire_code() {
                    link.send_error(code, &e.to_string()).await;
                }
                return Err(e);
            }
        };
        link.set_timeout(session.timeout);
        let pending = link.send(&Packet::Oack { options: reply }).await?;
        (session, pending)
    };

    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    let mut guard = PartialFile::new(path.to_path_buf());
    let mut writer = BlockWriter::new(file, request.mode);

    receive_blocks(link, &mut writer, &session, 1, pending).await?;
    guard.keep();
    Ok(())
}

/// Resolve a requested filename inside the served root.
///
/// The root and the name's directory part are canonicalized, so `..` runs
/// and symlinks cannot name anything outside the root.
fn resolve_in_root(root: &Path, filename: &str) -> Result<PathBuf, TransferError> {
    let root = root.canonicalize()?;
    let joined = root.join(filename);

    let leaf = joined
        .file_name()
        .ok_or_else(|| TransferError::AccessViolation(filename.to_string()))?
        .to_os_string();
    let dir = joined
        .parent()
        .ok_or_else(|| TransferError::AccessViolation(filename.to_string()))?
        .canonicalize()
        .map_err(|_| TransferError::FileNotFound(filename.to_string()))?;

    let resolved = dir.join(leaf);
    if !resolved.starts_with(&root) {
        return Err(TransferError::AccessViolation(filename.to_string()));
    }
    Ok(resolved)
}

/// Convenience entry point: build a server and run it.
pub async fn run_server(bind_address: String, root_dir: PathBuf) -> Result<()> {
    let mut server = TftpServer::new(ServerConfig { bind_address, root_dir });
    server.run().await
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn resolve_stays_inside_the_root() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir(root.join("sub")).unwrap();
        std::fs::write(root.join("sub/file.bin"), b"x").unwrap();

        let resolved = resolve_in_root(root, "sub/file.bin").unwrap();
        assert_eq!(resolved, root.canonicalize().unwrap().join("sub/file.bin"));

        // a name that does not exist yet still resolves (upload target)
        let fresh = resolve_in_root(root, "incoming.bin").unwrap();
        assert_eq!(fresh, root.canonicalize().unwrap().join("incoming.bin"));
    }

    #[test]
    fn resolve_rejects_traversal() {
        let dir = tempdir().unwrap();
        let result = resolve_in_root(dir.path(), "../../etc/passwd");
        assert!(matches!(result, Err(TransferError::AccessViolation(_))));
    }

    #[test]
    fn default_config_serves_the_well_known_port() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address, "0.0.0.0:69");
        assert_eq!(config.root_dir, PathBuf::from("."));
    }

    #[tokio::test]
    async fn bind_exposes_the_local_address() {
        let dir = tempdir().unwrap();
        let mut server = TftpServer::new(ServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            root_dir: dir.path().to_path_buf(),
        });
        assert!(server.local_addr().is_none());

        server.bind().await.unwrap();
        let addr = server.local_addr().unwrap();
        assert_eq!(addr.ip(), "127.0.0.1".parse::<std::net::IpAddr>().unwrap());
        assert_ne!(addr.port(), 0);
    }
}
