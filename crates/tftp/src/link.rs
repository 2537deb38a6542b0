//! The transfer's view of its UDP socket.
//!
//! A [`Link`] owns the one socket a transfer runs on and knows the peer it
//! talks to. It implements the two protocol-level socket behaviors that every
//! state shares: the deadline-bounded receive that retransmits the pending
//! packet, and transfer-ID enforcement once the peer's ephemeral port is
//! known.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::error::TransferError;
use crate::event::{Anomaly, Direction, EventSink, PacketEvent, PacketSummary};
use crate::protocol::{ErrorCode, Packet};

/// How many times a pending packet is re-sent before giving up.
pub const MAX_RETRIES: u32 = 3;

pub struct Link {
    socket: UdpSocket,
    peer: SocketAddr,
    /// Set once the peer's TID is established; from then on datagrams from
    /// any other source are rejected without touching transfer state.
    peer_locked: bool,
    timeout: Duration,
    local_port: Option<u16>,
    sink: Arc<dyn EventSink>,
}

impl Link {
    /// A link whose peer TID is not established yet: the first accepted
    /// datagram locks onto its source. This is the client side, which sends
    /// its request to the well-known port but gets answered from the
    /// server's ephemeral transfer port.
    pub fn pending(socket: UdpSocket, peer: SocketAddr, timeout: Duration, sink: Arc<dyn EventSink>) -> Self {
        let local_port = socket.local_addr().ok().map(|addr| addr.port());
        Self {
            socket,
            peer,
            peer_locked: false,
            timeout,
            local_port,
            sink,
        }
    }

    /// A link to a peer whose TID is already known - the server side, where
    /// the initial request fixed the client's endpoint.
    pub fn established(socket: UdpSocket, peer: SocketAddr, timeout: Duration, sink: Arc<dyn EventSink>) -> Self {
        let mut link = Self::pending(socket, peer, timeout, sink);
        link.peer_locked = true;
        link
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    /// Adopt the retransmission interval settled by option negotiation.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    /// Encode and transmit one packet, returning its wire form so the caller
    /// can keep it as the pending packet for retransmission.
    pub async fn send(&self, packet: &Packet<'_>) -> Result<Vec<u8>, TransferError> {
        let bytes = packet.encode();
        self.socket.send_to(&bytes, self.peer).await?;
        self.sink.packet(&PacketEvent {
            direction: Direction::Send,
            peer: self.peer,
            local_port: self.local_port,
            packet: PacketSummary::of(packet),
        });
        Ok(bytes)
    }

    /// Wait for the peer's next datagram, retransmitting `pending` on
    /// expired deadlines.
    ///
    /// The deadline for attempt `i` is `timeout * max(1, 2i)`; after
    /// [`MAX_RETRIES`] retransmissions the wait for `expecting` fails with a
    /// timeout. A datagram from a source other than the locked peer is
    /// answered with a one-shot ERROR 5 and does not consume a retry. The
    /// first accepted datagram of an unlocked link locks the peer TID.
    ///
    /// Returns the datagram length in `buf`.
    pub async fn recv_retransmitting(
        &mut self,
        buf: &mut [u8],
        pending: &[u8],
        expecting: &'static str,
    ) -> Result<usize, TransferError> {
        let mut retries: u32 = 0;
        loop {
            let deadline = self.timeout * 1.max(2 * retries);
            match timeout(deadline, self.socket.recv_from(buf)).await {
                Err(_elapsed) => {
                    self.sink.anomaly(self.peer, &Anomaly::Timeout { attempt: retries });
                    if retries >= MAX_RETRIES {
                        return Err(TransferError::Timeout(expecting, retries));
                    }
                    self.socket.send_to(pending, self.peer).await?;
                    self.sink.anomaly(self.peer, &Anomaly::Retransmit { attempt: retries });
                    retries += 1;
                }
                Ok(Ok((len, source))) => {
                    if self.peer_locked && source != self.peer {
                        self.reject_stranger(&buf[..len], source).await;
                        continue;
                    }
                    if !self.peer_locked {
                        self.peer = source;
                        self.peer_locked = true;
                    }
                    let packet = Packet::decode(&buf[..len])?;
                    self.sink.packet(&PacketEvent {
                        direction: Direction::Receive,
                        peer: self.peer,
                        local_port: self.local_port,
                        packet: PacketSummary::of(&packet),
                    });
                    return Ok(len);
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Wait for one datagram within a single deadline, without
    /// retransmitting anything. `None` means the deadline elapsed.
    ///
    /// Strangers are rejected exactly as in
    /// [`recv_retransmitting`](Self::recv_retransmitting).
    pub async fn recv_within(&mut self, buf: &mut [u8], deadline: Duration) -> Result<Option<usize>, TransferError> {
        loop {
            match timeout(deadline, self.socket.recv_from(buf)).await {
                Err(_elapsed) => return Ok(None),
                Ok(Ok((len, source))) => {
                    if self.peer_locked && source != self.peer {
                        self.reject_stranger(&buf[..len], source).await;
                        continue;
                    }
                    let packet = Packet::decode(&buf[..len])?;
                    self.sink.packet(&PacketEvent {
                        direction: Direction::Receive,
                        peer: self.peer,
                        local_port: self.local_port,
                        packet: PacketSummary::of(&packet),
                    });
                    return Ok(Some(len));
                }
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Answer a datagram from the wrong source port with ERROR 5, sent once,
    /// addressed to the offender.
    async fn reject_stranger(&self, datagram: &[u8], source: SocketAddr) {
        self.sink.anomaly(self.peer, &Anomaly::StrangerTid { source });
        if let Ok(packet) = Packet::decode(datagram) {
            self.sink.packet(&PacketEvent {
                direction: Direction::Receive,
                peer: source,
                local_port: self.local_port,
                packet: PacketSummary::of(&packet),
            });
        }
        let error = Packet::Error {
            code: ErrorCode::UnknownTransferId.as_u16(),
            message: "Transfer ID does not match the established communication",
        };
        if self.socket.send_to(&error.encode(), source).await.is_ok() {
            self.sink.packet(&PacketEvent {
                direction: Direction::Send,
                peer: source,
                local_port: self.local_port,
                packet: PacketSummary::of(&error),
            });
        }
    }

    /// Transmit an ERROR packet with delivery retries.
    ///
    /// Errors are fire-and-forget: the packet is re-sent while traffic keeps
    /// arriving within the timeout window (the peer evidently did not get
    /// it), and silence is taken as delivery. Never fails and never blocks
    /// shutdown beyond the bounded wait.
    pub async fn send_error(&self, code: ErrorCode, message: &str) {
        let error = Packet::Error {
            code: code.as_u16(),
            message,
        };
        let bytes = error.encode();
        let mut scratch = [0u8; 256];

        for attempt in 0..MAX_RETRIES {
            if self.socket.send_to(&bytes, self.peer).await.is_err() {
                return;
            }
            self.sink.packet(&PacketEvent {
                direction: Direction::Send,
                peer: self.peer,
                local_port: self.local_port,
                packet: PacketSummary::of(&error),
            });

            let deadline = self.timeout * 1.max(2 * attempt);
            match timeout(deadline, self.socket.recv_from(&mut scratch)).await {
                // silence: the peer most probably got the error
                Err(_elapsed) => return,
                Ok(_) => continue,
            }
        }
    }
}
