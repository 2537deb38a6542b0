//! Option negotiation (RFC 2347/2348/2349).
//!
//! Both entry points produce the session values a transfer runs with. The
//! server echoes acceptable client values; the client checks the server's
//! reply against what it asked for. An option the peer did not mention falls
//! back to the protocol default.

use std::time::Duration;

use crate::error::TransferError;
use crate::protocol::{
    DEFAULT_BLOCK_SIZE, DEFAULT_TIMEOUT_SECS, MAX_BLOCK_SIZE, MAX_TIMEOUT_SECS, MIN_BLOCK_SIZE, MIN_TIMEOUT_SECS,
    OptionKey, OptionSet,
};

/// Values a transfer session runs with once negotiation settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// DATA payload size in bytes.
    pub block_size: usize,
    /// Retransmission interval.
    pub timeout: Duration,
    /// Peer-announced total size, when the `tsize` option was agreed on.
    pub transfer_size: Option<u64>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            transfer_size: None,
        }
    }
}

impl SessionOptions {
    /// Size of the receive buffer: one full DATA packet.
    pub fn datagram_size(&self) -> usize {
        self.block_size + crate::protocol::DATA_HEADER_LEN
    }
}

fn blksize_in_range(value: u64) -> bool {
    (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&value)
}

fn timeout_in_range(value: u64) -> bool {
    (MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&value)
}

/// Server-side acceptance of a client's requested options.
///
/// Returns the session values together with the OACK to send. The OACK
/// contains exactly the options the client listed, in the client's order;
/// `tsize` is answered with `tsize_reply` (the file size on a read, the
/// client's own announcement on a write). An out-of-range value rejects the
/// whole request.
pub fn negotiate_server(requested: &OptionSet, tsize_reply: u64) -> Result<(SessionOptions, OptionSet), TransferError> {
    let mut session = SessionOptions::default();
    let mut reply = OptionSet::new();

    for (key, value) in requested.iter() {
        match key {
            OptionKey::BlockSize => {
                if !blksize_in_range(value) {
                    return Err(TransferError::OptionRejected(format!(
                        "block size {} is outside of the range <{}, {}>",
                        value, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
                    )));
                }
                session.block_size = value as usize;
                reply.set(key, value);
            }
            OptionKey::Timeout => {
                if !timeout_in_range(value) {
                    return Err(TransferError::OptionRejected(format!(
                        "timeout interval {} is outside of the range <{}, {}>",
                        value, MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS
                    )));
                }
                session.timeout = Duration::from_secs(value);
                reply.set(key, value);
            }
            OptionKey::TransferSize => {
                session.transfer_size = Some(tsize_reply);
                reply.set(key, tsize_reply);
            }
        }
    }

    Ok((session, reply))
}

/// Client-side acceptance of the server's OACK.
///
/// The server must not introduce options the client never asked for. A
/// `blksize` reply is accepted when it does not exceed the offer and is in
/// range; the session adopts the server's number. A `timeout` reply must
/// match the offer exactly. Options absent from the reply revert to their
/// defaults.
pub fn negotiate_client(offered: &OptionSet, reply: &OptionSet) -> Result<SessionOptions, TransferError> {
    for (key, _) in reply.iter() {
        if !offered.contains(key) {
            return Err(TransferError::OptionRejected(format!(
                "server answered with option {} that was never requested",
                key
            )));
        }
    }

    let mut session = SessionOptions::default();

    if let Some(theirs) = reply.get(OptionKey::BlockSize) {
        let ours = offered.get(OptionKey::BlockSize).unwrap_or(0);
        if theirs > ours || !blksize_in_range(theirs) {
            return Err(TransferError::OptionRejected(format!(
                "block size {} was not accepted (offered {})",
                theirs, ours
            )));
        }
        session.block_size = theirs as usize;
    }

    if let Some(theirs) = reply.get(OptionKey::Timeout) {
        let ours = offered.get(OptionKey::Timeout).unwrap_or(0);
        if theirs != ours || !timeout_in_range(theirs) {
            return Err(TransferError::OptionRejected(format!(
                "timeout interval {} was not accepted (offered {})",
                theirs, ours
            )));
        }
        session.timeout = Duration::from_secs(theirs);
    }

    session.transfer_size = reply.get(OptionKey::TransferSize);

    Ok(session)
}
