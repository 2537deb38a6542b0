//! TFTP wire format.
//!
//! Packet layouts follow RFC 1350 with the option extension of RFC 2347:
//!
//! - RRQ/WRQ: | Opcode | Filename | 0 | Mode | 0 | [Options] |
//! - DATA:    | Opcode | Block# | Payload |
//! - ACK:     | Opcode | Block# |
//! - ERROR:   | Opcode | ErrorCode | Message | 0 |
//! - OACK:    | Opcode | Opt1 | 0 | Value1 | 0 | ... |
//!
//! All 16-bit integers are big-endian. Decoding borrows from the received
//! datagram; a DATA payload is a view into the buffer, never a copy sized to
//! the maximum block.

use std::fmt;
use std::str::FromStr;

use crate::error::TransferError;

/// Well-known TFTP server port.
pub const DEFAULT_PORT: u16 = 69;

/// Block size in effect when `blksize` was not negotiated (RFC 1350).
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Retransmission interval in effect when `timeout` was not negotiated.
pub const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// Smallest negotiable block size (RFC 2348).
pub const MIN_BLOCK_SIZE: u64 = 8;

/// Largest negotiable block size (RFC 2348).
pub const MAX_BLOCK_SIZE: u64 = 65464;

/// Smallest negotiable retransmission interval in seconds (RFC 2349).
pub const MIN_TIMEOUT_SECS: u64 = 1;

/// Largest negotiable retransmission interval in seconds (RFC 2349).
pub const MAX_TIMEOUT_SECS: u64 = 255;

/// Bytes of opcode + block number in front of a DATA payload.
pub const DATA_HEADER_LEN: usize = 4;

/// TFTP packet opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Read Request - client asks to read a file from the server.
    ReadRequest = 1,
    /// Write Request - client asks to write a file to the server.
    WriteRequest = 2,
    /// One block of file content.
    Data = 3,
    /// Acknowledges a DATA block, or (block 0) a WRQ/OACK.
    Acknowledgment = 4,
    /// Terminates the transfer with a code and a human-readable message.
    Error = 5,
    /// Option Acknowledgment - confirms negotiated options (RFC 2347).
    OptionAck = 6,
}

impl Opcode {
    /// Convert a wire value to an opcode.
    ///
    /// # Examples
    /// ```
    /// use tftp::Opcode;
    ///
    /// assert_eq!(Opcode::from_u16(1), Some(Opcode::ReadRequest));
    /// assert_eq!(Opcode::from_u16(99), None);
    /// ```
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::ReadRequest),
            2 => Some(Self::WriteRequest),
            3 => Some(Self::Data),
            4 => Some(Self::Acknowledgment),
            5 => Some(Self::Error),
            6 => Some(Self::OptionAck),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Short protocol name, as used in transfer logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadRequest => "RRQ",
            Self::WriteRequest => "WRQ",
            Self::Data => "DATA",
            Self::Acknowledgment => "ACK",
            Self::Error => "ERROR",
            Self::OptionAck => "OACK",
        }
    }
}

impl From<Opcode> for u16 {
    fn from(opcode: Opcode) -> Self {
        opcode.as_u16()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// TFTP error codes (RFC 1350 plus the RFC 2347 negotiation failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileAlreadyExists = 6,
    NoSuchUser = 7,
    OptionNegotiationFailed = 8,
}

impl ErrorCode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(Self::NotDefined),
            1 => Some(Self::FileNotFound),
            2 => Some(Self::AccessViolation),
            3 => Some(Self::DiskFull),
            4 => Some(Self::IllegalOperation),
            5 => Some(Self::UnknownTransferId),
            6 => Some(Self::FileAlreadyExists),
            7 => Some(Self::NoSuchUser),
            8 => Some(Self::OptionNegotiationFailed),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Default message for the code, used when the sender supplies none.
    pub fn default_message(self) -> &'static str {
        match self {
            Self::NotDefined => "Undefined error",
            Self::FileNotFound => "File not found",
            Self::AccessViolation => "Access violation",
            Self::DiskFull => "Disk full or allocation exceeded",
            Self::IllegalOperation => "Illegal TFTP operation",
            Self::UnknownTransferId => "Unknown transfer ID",
            Self::FileAlreadyExists => "File already exists",
            Self::NoSuchUser => "No such user",
            Self::OptionNegotiationFailed => "Option negotiation failed",
        }
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        code.as_u16()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.default_message(), self.as_u16())
    }
}

/// Transfer modes.
///
/// `octet` moves bytes untouched; `netascii` normalizes line endings on the
/// wire (see the `netascii` module). Mode strings are matched
/// case-insensitively and canonicalized to lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    #[default]
    Octet,
    Netascii,
}

impl Mode {
    /// Parse a mode string, case-insensitively.
    ///
    /// # Examples
    /// ```
    /// use tftp::Mode;
    ///
    /// assert_eq!(Mode::from_str_opt("octet"), Some(Mode::Octet));
    /// assert_eq!(Mode::from_str_opt("NETASCII"), Some(Mode::Netascii));
    /// assert_eq!(Mode::from_str_opt("mail"), None);
    /// ```
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "octet" => Some(Self::Octet),
            "netascii" => Some(Self::Netascii),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Octet => "octet",
            Self::Netascii => "netascii",
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_str_opt(s).ok_or_else(|| format!("unsupported transfer mode: {}", s))
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The negotiable options this implementation understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionKey {
    /// `blksize` - DATA payload size in bytes (RFC 2348).
    BlockSize,
    /// `timeout` - retransmission interval in seconds (RFC 2349).
    Timeout,
    /// `tsize` - total transfer size in bytes (RFC 2349).
    TransferSize,
}

impl OptionKey {
    /// Match an option name from the wire. Names are case-insensitive;
    /// anything unrecognized returns `None` and is skipped by the decoder.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "blksize" => Some(Self::BlockSize),
            "timeout" => Some(Self::Timeout),
            "tsize" => Some(Self::TransferSize),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::BlockSize => "blksize",
            Self::Timeout => "timeout",
            Self::TransferSize => "tsize",
        }
    }
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// An ordered set of request options.
///
/// Order is the order the peer listed the options in, preserved so that logs
/// and echoed OACKs reflect the request. A key appears at most once; the
/// decoder keeps the first occurrence of a duplicated key.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OptionSet {
    entries: Vec<(OptionKey, u64)>,
}

impl OptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, key: OptionKey) -> bool {
        self.entries.iter().any(|(k, _)| *k == key)
    }

    pub fn get(&self, key: OptionKey) -> Option<u64> {
        self.entries.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    /// Set `key` to `value`, keeping its position if already present.
    pub fn set(&mut self, key: OptionKey, value: u64) -> &mut Self {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
        self
    }

    /// Entries in the order the peer listed them.
    pub fn iter(&self) -> impl Iterator<Item = (OptionKey, u64)> + '_ {
        self.entries.iter().copied()
    }

    fn push_first_seen(&mut self, key: OptionKey, value: u64) {
        if !self.contains(key) {
            self.entries.push((key, value));
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        for (key, value) in self.iter() {
            out.extend_from_slice(key.name().as_bytes());
            out.push(0);
            out.extend_from_slice(value.to_string().as_bytes());
            out.push(0);
        }
    }

    /// Decode an option trailer starting at `pos`.
    ///
    /// Unknown option names are skipped along with their value, as is any
    /// option whose value does not parse as a non-negative integer. A name or
    /// value that is not NUL-terminated within the datagram is malformed.
    fn decode(buf: &[u8], mut pos: usize) -> Result<Self, TransferError> {
        let mut options = Self::new();
        while pos < buf.len() {
            let (name, next) = take_zstring(buf, pos, "option name")?;
            let (value, after) = take_zstring(buf, next, "option value")?;
            pos = after;

            let Some(key) = OptionKey::from_name(name) else {
                continue;
            };
            let Ok(value) = value.parse::<u64>() else {
                continue;
            };
            options.push_first_seen(key, value);
        }
        Ok(options)
    }
}

impl fmt::Display for OptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in self.iter() {
            write!(f, " {}={}", key, value)?;
        }
        Ok(())
    }
}

/// Whether an initial request asks to read or to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write,
}

impl RequestKind {
    pub fn opcode(self) -> Opcode {
        match self {
            Self::Read => Opcode::ReadRequest,
            Self::Write => Opcode::WriteRequest,
        }
    }
}

/// A decoded TFTP packet.
///
/// Borrows string and payload data from the datagram it was decoded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet<'a> {
    Request {
        kind: RequestKind,
        filename: &'a str,
        mode: Mode,
        options: OptionSet,
    },
    Data {
        block: u16,
        payload: &'a [u8],
    },
    Ack {
        block: u16,
    },
    Error {
        code: u16,
        message: &'a str,
    },
    Oack {
        options: OptionSet,
    },
}

impl<'a> Packet<'a> {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Request { kind, .. } => kind.opcode(),
            Self::Data { .. } => Opcode::Data,
            Self::Ack { .. } => Opcode::Acknowledgment,
            Self::Error { .. } => Opcode::Error,
            Self::Oack { .. } => Opcode::OptionAck,
        }
    }

    /// Serialize to wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_hint());
        out.extend_from_slice(&self.opcode().as_u16().to_be_bytes());
        match self {
            Self::Request {
                filename,
                mode,
                options,
                ..
            } => {
                out.extend_from_slice(filename.as_bytes());
                out.push(0);
                out.extend_from_slice(mode.as_str().as_bytes());
                out.push(0);
                options.encode_into(&mut out);
            }
            Self::Data { block, payload } => {
                out.extend_from_slice(&block.to_be_bytes());
                out.extend_from_slice(payload);
            }
            Self::Ack { block } => {
                out.extend_from_slice(&block.to_be_bytes());
            }
            Self::Error { code, message } => {
                out.extend_from_slice(&code.to_be_bytes());
                out.extend_from_slice(message.as_bytes());
                out.push(0);
            }
            Self::Oack { options } => {
                options.encode_into(&mut out);
            }
        }
        out
    }

    fn encoded_hint(&self) -> usize {
        match self {
            Self::Data { payload, .. } => DATA_HEADER_LEN + payload.len(),
            Self::Error { message, .. } => DATA_HEADER_LEN + message.len() + 1,
            _ => 64,
        }
    }

    /// Decode a received datagram.
    ///
    /// Fails with a malformed-packet error when the opcode is unknown, a
    /// fixed header exceeds the datagram, or a string field is not
    /// NUL-terminated.
    pub fn decode(buf: &'a [u8]) -> Result<Self, TransferError> {
        if buf.len() < 2 {
            return Err(TransferError::malformed("datagram shorter than an opcode"));
        }
        let raw_opcode = u16::from_be_bytes([buf[0], buf[1]]);
        let opcode = Opcode::from_u16(raw_opcode)
            .ok_or_else(|| TransferError::malformed(format!("unknown opcode {}", raw_opcode)))?;

        match opcode {
            Opcode::ReadRequest | Opcode::WriteRequest => {
                let kind = if opcode == Opcode::ReadRequest {
                    RequestKind::Read
                } else {
                    RequestKind::Write
                };
                let (filename, pos) = take_zstring(buf, 2, "filename")?;
                let (mode_str, pos) = take_zstring(buf, pos, "mode")?;
                let mode = Mode::from_str_opt(mode_str)
                    .ok_or_else(|| TransferError::malformed(format!("unsupported mode {:?}", mode_str)))?;
                let options = OptionSet::decode(buf, pos)?;
                Ok(Self::Request {
                    kind,
                    filename,
                    mode,
                    options,
                })
            }
            Opcode::Data => {
                if buf.len() < DATA_HEADER_LEN {
                    return Err(TransferError::malformed("DATA shorter than its header"));
                }
                Ok(Self::Data {
                    block: u16::from_be_bytes([buf[2], buf[3]]),
                    payload: &buf[DATA_HEADER_LEN..],
                })
            }
            Opcode::Acknowledgment => {
                if buf.len() < 4 {
                    return Err(TransferError::malformed("ACK shorter than its header"));
                }
                Ok(Self::Ack {
                    block: u16::from_be_bytes([buf[2], buf[3]]),
                })
            }
            Opcode::Error => {
                if buf.len() < 4 {
                    return Err(TransferError::malformed("ERROR shorter than its header"));
                }
                let code = u16::from_be_bytes([buf[2], buf[3]]);
                let (message, _) = take_zstring(buf, 4, "error message")?;
                Ok(Self::Error { code, message })
            }
            Opcode::OptionAck => {
                let options = OptionSet::decode(buf, 2)?;
                Ok(Self::Oack { options })
            }
        }
    }
}

impl fmt::Display for Packet<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request {
                filename,
                mode,
                options,
                ..
            } => write!(f, "{} \"{}\" {}{}", self.opcode(), filename, mode, options),
            Self::Data { block, payload } => write!(f, "DATA {} ({} bytes)", block, payload.len()),
            Self::Ack { block } => write!(f, "ACK {}", block),
            Self::Error { code, message } => write!(f, "ERROR {} \"{}\"", code, message),
            Self::Oack { options } => write!(f, "OACK{}", options),
        }
    }
}

/// Borrow the NUL-terminated string starting at `start`; returns it with the
/// index just past the terminator.
fn take_zstring<'a>(buf: &'a [u8], start: usize, what: &str) -> Result<(&'a str, usize), TransferError> {
    if start > buf.len() {
        return Err(TransferError::malformed(format!("{} missing", what)));
    }
    let end = buf[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|pos| start + pos)
        .ok_or_else(|| TransferError::malformed(format!("{} not NUL-terminated", what)))?;
    let s = std::str::from_utf8(&buf[start..end])
        .map_err(|_| TransferError::malformed(format!("{} is not valid UTF-8", what)))?;
    Ok((s, end + 1))
}
