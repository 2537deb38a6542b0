//! TFTP (Trivial File Transfer Protocol) - both ends of the wire.
//!
//! This crate implements the complete per-transfer protocol engine of
//! RFC 1350 with the option extensions of RFC 2347/2348/2349, and the two
//! hosts built on it:
//!
//! - a client that downloads a remote file to a local path or uploads a
//!   byte stream (typically standard input) under a remote name, and
//! - a server that concurrently serves reads and writes out of a rooted
//!   directory, one ephemeral socket per transfer.
//!
//! Supported features:
//!
//! - Binary (octet) and text (netascii) transfer modes, the latter as a
//!   streaming transcoder that handles line endings split across blocks
//! - Block size, timeout and transfer size negotiation
//!   (`blksize`/`timeout`/`tsize`)
//! - Lock-step retransmission with exponential backoff and the classic
//!   duplicate-ACK suppression (no Sorcerer's Apprentice traffic doubling)
//! - Transfer-ID validation: datagrams from unexpected source ports are
//!   answered with ERROR 5 and never disturb a running transfer
//! - Per-packet event reporting through a pluggable [`EventSink`]
//!
//! # Basic usage
//!
//! ```rust,no_run
//! use std::path::{Path, PathBuf};
//! use tftp::{ClientConfig, ServerConfig, TftpServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // serve a directory
//!     let mut server = TftpServer::new(ServerConfig {
//!         bind_address: "0.0.0.0:69".to_string(),
//!         root_dir: PathBuf::from("/srv/tftp"),
//!     });
//!     tokio::spawn(async move { server.run().await });
//!
//!     // fetch a file from it
//!     let config = ClientConfig::default();
//!     tftp::download("127.0.0.1:69".parse()?, "boot.img", Path::new("boot.img"), &config).await?;
//!     Ok(())
//! }
//! ```

mod client;
mod error;
mod event;
mod fsutil;
mod link;
mod netascii;
mod options;
mod protocol;
mod server;
mod transfer;

pub use client::{ClientConfig, download, upload};
pub use error::TransferError;
pub use event::{Anomaly, Direction, EventSink, LogSink, PacketEvent, PacketSummary};
pub use link::{Link, MAX_RETRIES};
pub use netascii::{BlockReader, BlockWriter};
pub use options::{SessionOptions, negotiate_client, negotiate_server};
pub use protocol::{
    DATA_HEADER_LEN, DEFAULT_BLOCK_SIZE, DEFAULT_PORT, DEFAULT_TIMEOUT_SECS, ErrorCode, MAX_BLOCK_SIZE,
    MAX_TIMEOUT_SECS, MIN_BLOCK_SIZE, MIN_TIMEOUT_SECS, Mode, Opcode, OptionKey, OptionSet, Packet, RequestKind,
};
pub use server::{ServerConfig, TftpServer, run_server};
pub use transfer::{receive_blocks, send_blocks};
