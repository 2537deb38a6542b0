//! Per-packet transfer events.
//!
//! The engine reports every packet it sends or receives, plus the unusual
//! conditions (stranger TID, expired deadline, retransmission), through the
//! narrow [`EventSink`] trait. [`LogSink`] is the default sink; it renders
//! the compact one-line-per-packet log of the CLIs. Hosts can plug in their
//! own sink to consume the records differently.

use std::net::SocketAddr;

use crate::protocol::{Mode, OptionSet, Packet, RequestKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// An owned summary of one packet, detached from the receive buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketSummary {
    Request {
        kind: RequestKind,
        filename: String,
        mode: Mode,
        options: OptionSet,
    },
    Data {
        block: u16,
        size: usize,
    },
    Ack {
        block: u16,
    },
    Error {
        code: u16,
        message: String,
    },
    Oack {
        options: OptionSet,
    },
}

impl PacketSummary {
    pub fn of(packet: &Packet<'_>) -> Self {
        match packet {
            Packet::Request {
                kind,
                filename,
                mode,
                options,
            } => Self::Request {
                kind: *kind,
                filename: (*filename).to_string(),
                mode: *mode,
                options: options.clone(),
            },
            Packet::Data { block, payload } => Self::Data {
                block: *block,
                size: payload.len(),
            },
            Packet::Ack { block } => Self::Ack { block: *block },
            Packet::Error { code, message } => Self::Error {
                code: *code,
                message: (*message).to_string(),
            },
            Packet::Oack { options } => Self::Oack {
                options: options.clone(),
            },
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Request {
                kind: RequestKind::Read,
                ..
            } => "RRQ",
            Self::Request {
                kind: RequestKind::Write,
                ..
            } => "WRQ",
            Self::Data { .. } => "DATA",
            Self::Ack { .. } => "ACK",
            Self::Error { .. } => "ERROR",
            Self::Oack { .. } => "OACK",
        }
    }
}

/// One record per packet crossing the transfer's socket.
#[derive(Debug, Clone, PartialEq)]
pub struct PacketEvent {
    pub direction: Direction,
    /// The remote endpoint the packet went to or came from.
    pub peer: SocketAddr,
    /// Local port of the transfer's socket, once bound.
    pub local_port: Option<u16>,
    pub packet: PacketSummary,
}

/// Conditions outside the happy path, reported once each time they occur.
#[derive(Debug, Clone, PartialEq)]
pub enum Anomaly {
    /// A datagram arrived from a port other than the established peer TID.
    StrangerTid { source: SocketAddr },
    /// A receive deadline elapsed without any datagram.
    Timeout { attempt: u32 },
    /// The pending packet was sent again after a timeout.
    Retransmit { attempt: u32 },
}

/// Consumer of transfer events.
///
/// Called synchronously from the transfer task; implementations should be
/// cheap and must not block.
pub trait EventSink: Send + Sync {
    fn packet(&self, event: &PacketEvent);

    fn anomaly(&self, peer: SocketAddr, anomaly: &Anomaly);
}

/// Default sink: one `tracing` line per packet.
///
/// Received packets log at info level in the form
/// `DATA 192.0.2.1:2000:49152 7`, where the trailing number after the peer
/// address is the local TID; sends and anomalies stay at debug/warn.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl LogSink {
    fn line(event: &PacketEvent) -> String {
        let mut line = String::new();
        line.push_str(event.packet.kind_name());
        line.push(' ');
        line.push_str(&event.peer.to_string());
        if let Some(port) = event.local_port {
            line.push_str(&format!(":{}", port));
        }
        match &event.packet {
            PacketSummary::Request {
                filename, mode, options, ..
            } => {
                line.push_str(&format!(" \"{}\" {}{}", filename, mode, options));
            }
            PacketSummary::Data { block, .. } | PacketSummary::Ack { block } => {
                line.push_str(&format!(" {}", block));
            }
            PacketSummary::Error { code, message } => {
                line.push_str(&format!(" {} \"{}\"", code, message));
            }
            PacketSummary::Oack { options } => {
                line.push_str(&options.to_string());
            }
        }
        line
    }
}

impl EventSink for LogSink {
    fn packet(&self, event: &PacketEvent) {
        match event.direction {
            Direction::Receive => tracing::info!("{}", Self::line(event)),
            Direction::Send => tracing::debug!("sent {}", Self::line(event)),
        }
    }

    fn anomaly(&self, peer: SocketAddr, anomaly: &Anomaly) {
        match anomaly {
            Anomaly::StrangerTid { source } => {
                tracing::warn!("dropping datagram from {} (established peer is {})", source, peer);
            }
            Anomaly::Timeout { attempt } => {
                tracing::warn!("no reply from {} (attempt {})", peer, attempt + 1);
            }
            Anomaly::Retransmit { attempt } => {
                tracing::debug!("retransmitting to {} (attempt {})", peer, attempt + 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::OptionKey;

    fn peer() -> SocketAddr {
        "192.0.2.1:2000".parse().unwrap()
    }

    #[test]
    fn data_line_carries_both_ports() {
        let event = PacketEvent {
            direction: Direction::Receive,
            peer: peer(),
            local_port: Some(49152),
            packet: PacketSummary::Data { block: 7, size: 512 },
        };
        assert_eq!(LogSink::line(&event), "DATA 192.0.2.1:2000:49152 7");
    }

    #[test]
    fn request_line_lists_options_in_order() {
        let mut options = OptionSet::new();
        options.set(OptionKey::TransferSize, 0).set(OptionKey::BlockSize, 1024);
        let event = PacketEvent {
            direction: Direction::Receive,
            peer: peer(),
            local_port: None,
            packet: PacketSummary::Request {
                kind: RequestKind::Read,
                filename: "boot.img".into(),
                mode: Mode::Octet,
                options,
            },
        };
        assert_eq!(LogSink::line(&event), "RRQ 192.0.2.1:2000 \"boot.img\" octet tsize=0 blksize=1024");
    }

    #[test]
    fn error_line_quotes_the_message() {
        let event = PacketEvent {
            direction: Direction::Send,
            peer: peer(),
            local_port: Some(49152),
            packet: PacketSummary::Error {
                code: 5,
                message: "Unknown transfer ID".into(),
            },
        };
        assert_eq!(LogSink::line(&event), "ERROR 192.0.2.1:2000:49152 5 \"Unknown transfer ID\"");
    }
}
