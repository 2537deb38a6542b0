//! The lock-step transfer loops.
//!
//! Both endpoints run the same two loops once a transfer is set up: the
//! sending side emits DATA blocks one at a time and waits for each matching
//! ACK, the receiving side waits for each expected DATA and answers with an
//! ACK. Exactly one packet is pending acknowledgment at any moment;
//! retransmission on silence is handled by [`Link`].
//!
//! Duplicates are where the lock-step scheme bites back: a duplicated ACK
//! must never trigger a retransmission of the DATA it acknowledges (the
//! Sorcerer's Apprentice failure mode, where every duplicate doubles the
//! traffic from then on), while a duplicated DATA is answered with its ACK
//! again so a lost ACK cannot stall the sender.

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::TransferError;
use crate::link::{Link, MAX_RETRIES};
use crate::netascii::{BlockReader, BlockWriter};
use crate::options::SessionOptions;
use crate::protocol::{ErrorCode, Packet};

/// Drive the sending side: read blocks from `source`, send DATA(n), await
/// ACK(n), until a block shorter than the block size ends the transfer.
pub async fn send_blocks<R: AsyncRead + Unpin>(
    link: &mut Link,
    source: &mut BlockReader<R>,
    options: &SessionOptions,
) -> Result<(), TransferError> {
    let mut buf = vec![0u8; options.datagram_size()];
    let mut payload = Vec::with_capacity(options.block_size);
    let mut block_number: u16 = 1;

    loop {
        let n = source.next_block(&mut payload, options.block_size).await?;
        let pending = link
            .send(&Packet::Data {
                block: block_number,
                payload: &payload,
            })
            .await?;

        await_ack(link, &mut buf, &pending, block_number).await?;

        if n < options.block_size {
            return Ok(());
        }
        block_number = match block_number.checked_add(1) {
            Some(next) => next,
            None => {
                let reason = "block number space exhausted";
                link.send_error(ErrorCode::IllegalOperation, reason).await;
                return Err(TransferError::illegal(reason));
            }
        };
    }
}

/// Wait for ACK(`block_number`), absorbing duplicates of older ACKs.
pub(crate) async fn await_ack(
    link: &mut Link,
    buf: &mut [u8],
    pending: &[u8],
    block_number: u16,
) -> Result<(), TransferError> {
    loop {
        let len = link.recv_retransmitting(buf, pending, "ACK").await?;
        match Packet::decode(&buf[..len])? {
            Packet::Ack { block } if block == block_number => return Ok(()),
            Packet::Ack { block } if block < block_number => {
                // duplicate of an earlier ACK: keep waiting, and above all do
                // not retransmit the pending DATA in response
                continue;
            }
            Packet::Ack { block } => {
                let reason = format!("ACK for block {} which was never sent", block);
                link.send_error(ErrorCode::IllegalOperation, &reason).await;
                return Err(TransferError::illegal(reason));
            }
            Packet::Error { code, message } => {
                return Err(TransferError::Peer {
                    code,
                    message: message.to_string(),
                });
            }
            other => {
                let reason = format!("expected ACK, peer sent {}", other.opcode());
                link.send_error(ErrorCode::IllegalOperation, &reason).await;
                return Err(TransferError::illegal(reason));
            }
        }
    }
}

/// Drive the receiving side: await DATA(expected), write it out, answer with
/// ACK(expected), until a short block arrives.
///
/// `expected` is the first block number to wait for and `pending` the packet
/// whose loss the peer would react to (the ACK 0, OACK, or request that this
/// side sent last) for retransmission on silence.
pub async fn receive_blocks<W: AsyncWrite + Unpin>(
    link: &mut Link,
    writer: &mut BlockWriter<W>,
    options: &SessionOptions,
    mut expected: u16,
    mut pending: Vec<u8>,
) -> Result<(), TransferError> {
    let mut buf = vec![0u8; options.datagram_size()];

    loop {
        let len = link.recv_retransmitting(&mut buf, &pending, "DATA").await?;
        match Packet::decode(&buf[..len])? {
            Packet::Data { block, payload } if block == expected => {
                writer.write_block(payload).await?;
                let last = payload.len() < options.block_size;
                pending = link.send(&Packet::Ack { block: expected }).await?;

                if last {
                    writer.finish().await?;
                    return final_ack_dally(link, &mut buf, expected, options).await;
                }
                expected = match expected.checked_add(1) {
                    Some(next) => next,
                    None => {
                        let reason = "block number space exhausted";
                        link.send_error(ErrorCode::IllegalOperation, reason).await;
                        return Err(TransferError::illegal(reason));
                    }
                };
            }
            Packet::Data { block, .. } if block < expected => {
                // duplicated DATA: its ACK evidently got lost, answer again
                // without advancing
                link.send(&Packet::Ack { block }).await?;
            }
            Packet::Data { block, .. } => {
                let reason = format!("DATA block {} ahead of expected {}", block, expected);
                link.send_error(ErrorCode::IllegalOperation, &reason).await;
                return Err(TransferError::illegal(reason));
            }
            Packet::Error { code, message } => {
                return Err(TransferError::Peer {
                    code,
                    message: message.to_string(),
                });
            }
            other => {
                let reason = format!("expected DATA, peer sent {}", other.opcode());
                link.send_error(ErrorCode::IllegalOperation, &reason).await;
                return Err(TransferError::illegal(reason));
            }
        }
    }
}

/// Linger after acknowledging the final DATA.
///
/// The last ACK of a transfer is the one packet whose loss this side cannot
/// observe, so the receiver may not exit immediately: it keeps listening
/// through a few quiet windows and answers a retransmitted final DATA with
/// the final ACK again. Silence ends the transfer.
pub(crate) async fn final_ack_dally(
    link: &mut Link,
    buf: &mut [u8],
    final_block: u16,
    options: &SessionOptions,
) -> Result<(), TransferError> {
    for _ in 0..MAX_RETRIES {
        match link.recv_within(buf, options.timeout).await? {
            None => break,
            Some(len) => match Packet::decode(&buf[..len])? {
                Packet::Data { block, .. } if block == final_block => {
                    link.send(&Packet::Ack { block: final_block }).await?;
                }
                Packet::Error { code, message } => {
                    return Err(TransferError::Peer {
                        code,
                        message: message.to_string(),
                    });
                }
                _ => {}
            },
        }
    }
    Ok(())
}
