//! Client-side transfers.
//!
//! [`download`] fetches a remote file into a local path that must not exist
//! yet; [`upload`] stages a byte stream (typically standard input) into a
//! temporary file, so the write request can announce an exact transfer size,
//! and then sends it under a remote name.
//!
//! The client sends its request to the server's well-known port; the first
//! reply arrives from the ephemeral port the server picked for the transfer,
//! which from then on is the only source this side accepts.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::net::UdpSocket;

use crate::error::TransferError;
use crate::event::{EventSink, LogSink};
use crate::fsutil::{PartialFile, available_space};
use crate::link::Link;
use crate::netascii::{BlockReader, BlockWriter};
use crate::options::{SessionOptions, negotiate_client};
use crate::protocol::{DEFAULT_TIMEOUT_SECS, ErrorCode, Mode, OptionKey, OptionSet, Packet, RequestKind};
use crate::transfer::{final_ack_dally, receive_blocks, send_blocks};

/// Per-transfer client settings.
#[derive(Clone)]
pub struct ClientConfig {
    pub mode: Mode,
    /// Options to propose in the request; empty proposes none.
    pub options: OptionSet,
    pub sink: Arc<dyn EventSink>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Octet,
            options: OptionSet::new(),
            sink: Arc::new(LogSink),
        }
    }
}

impl ClientConfig {
    /// The retransmission interval in effect before negotiation settles:
    /// the proposed `timeout` if one is on offer, the default otherwise.
    fn initial_timeout(&self) -> Duration {
        let secs = self.options.get(OptionKey::Timeout).unwrap_or(DEFAULT_TIMEOUT_SECS);
        Duration::from_secs(secs)
    }
}

async fn ephemeral_socket(server: SocketAddr) -> std::io::Result<UdpSocket> {
    let bind_addr = match server {
        SocketAddr::V4(_) => "0.0.0.0:0",
        SocketAddr::V6(_) => "[::]:0",
    };
    UdpSocket::bind(bind_addr).await
}

/// Download `remote` from `server` into `dest`.
///
/// `dest` must not exist; on any failure after it was created, including
/// cancellation, the partial file is removed.
pub async fn download(
    server: SocketAddr,
    remote: &str,
    dest: &Path,
    config: &ClientConfig,
) -> Result<(), TransferError> {
    // refuse before the first packet goes out
    if tokio::fs::try_exists(dest).await? {
        return Err(TransferError::FileExists(dest.display().to_string()));
    }

    let socket = ephemeral_socket(server).await?;
    let mut link = Link::pending(socket, server, config.initial_timeout(), config.sink.clone());

    let request = Packet::Request {
        kind: RequestKind::Read,
        filename: remote,
        mode: config.mode,
        options: config.options.clone(),
    };
    let pending = link.send(&request).await?;

    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dest)
        .await
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                TransferError::FileExists(dest.display().to_string())
            } else {
                TransferError::Io(e)
            }
        })?;
    let mut guard = PartialFile::new(dest.to_path_buf());
    let mut writer = BlockWriter::new(file, config.mode);

    let mut buf = vec![0u8; SessionOptions::default().datagram_size()];
    let len = link.recv_retransmitting(&mut buf, &pending, "first reply to RRQ").await?;

    match Packet::decode(&buf[..len])? {
        Packet::Oack { options: reply } => {
            let session = accept_oack(&link, &config.options, &reply).await?;

            // a tsize query means we asked how big the download will be;
            // refuse it while the refusal is still cheap
            if config.options.get(OptionKey::TransferSize) == Some(0)
                && let Some(announced) = session.transfer_size
            {
                let dir = dest.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
                if available_space(dir)? < announced {
                    let reason = format!("not enough space on disk for {} bytes", announced);
                    link.send_error(ErrorCode::DiskFull, &reason).await;
                    return Err(TransferError::DiskFull(reason));
                }
            }

            link.set_timeout(session.timeout);
            let pending = link.send(&Packet::Ack { block: 0 }).await?;
            receive_blocks(&mut link, &mut writer, &session, 1, pending).await?;
        }
        Packet::Data { block: 1, payload } => {
            // no options accepted; the transfer runs on defaults
            let session = SessionOptions::default();
            writer.write_block(payload).await?;
            let last = payload.len() < session.block_size;
            let pending = link.send(&Packet::Ack { block: 1 }).await?;
            if last {
                writer.finish().await?;
                let mut buf = vec![0u8; session.datagram_size()];
                final_ack_dally(&mut link, &mut buf, 1, &session).await?;
            } else {
                receive_blocks(&mut link, &mut writer, &session, 2, pending).await?;
            }
        }
        Packet::Error { code, message } => {
            return Err(TransferError::Peer {
                code,
                message: message.to_string(),
            });
        }
        other => {
            let reason = format!("expected OACK or DATA 1, server sent {}", other.opcode());
            link.send_error(ErrorCode::IllegalOperation, &reason).await;
            return Err(TransferError::illegal(reason));
        }
    }

    guard.keep();
    Ok(())
}

/// Upload `source` to `server` under the name `remote`.
///
/// The stream is staged into a temporary file first so the request can carry
/// its size when `tsize` is proposed; the staging file is removed when the
/// transfer ends, successfully or not.
pub async fn upload<R: AsyncRead + Unpin>(
    server: SocketAddr,
    remote: &str,
    source: &mut R,
    config: &ClientConfig,
) -> Result<(), TransferError> {
    // removed on drop, whatever happens to the transfer
    let staged = tempfile::NamedTempFile::new()?;

    let mut staging = tokio::fs::File::from_std(staged.reopen()?);
    let staged_size = tokio::io::copy(source, &mut staging).await?;
    staging.flush().await?;
    drop(staging);

    let mut options = config.options.clone();
    if options.contains(OptionKey::TransferSize) {
        options.set(OptionKey::TransferSize, staged_size);
    }

    let socket = ephemeral_socket(server).await?;
    let mut link = Link::pending(socket, server, config.initial_timeout(), config.sink.clone());

    let request = Packet::Request {
        kind: RequestKind::Write,
        filename: remote,
        mode: config.mode,
        options: options.clone(),
    };
    let pending = link.send(&request).await?;

    let mut buf = vec![0u8; SessionOptions::default().datagram_size()];
    let len = link.recv_retransmitting(&mut buf, &pending, "first reply to WRQ").await?;

    let session = match Packet::decode(&buf[..len])? {
        Packet::Ack { block: 0 } => SessionOptions::default(),
        Packet::Oack { options: reply } => {
            let session = accept_oack(&link, &options, &reply).await?;
            link.set_timeout(session.timeout);
            session
        }
        Packet::Error { code, message } => {
            return Err(TransferError::Peer {
                code,
                message: message.to_string(),
            });
        }
        other => {
            let reason = format!("expected ACK 0 or OACK, server sent {}", other.opcode());
            link.send_error(ErrorCode::IllegalOperation, &reason).await;
            return Err(TransferError::illegal(reason));
        }
    };

    let mut reader = BlockReader::new(tokio::fs::File::from_std(staged.reopen()?), config.mode);
    send_blocks(&mut link, &mut reader, &session).await
}

/// Run client-side negotiation, answering a bad OACK with ERROR 8.
async fn accept_oack(link: &Link, offered: &OptionSet, reply: &OptionSet) -> Result<SessionOptions, TransferError> {
    match negotiate_client(offered, reply) {
        Ok(session) => Ok(session),
        Err(e) => {
            if let Some(code) = e.wire_code() {
                link.send_error(code, &e.to_string()).await;
            }
            Err(e)
        }
    }
}
