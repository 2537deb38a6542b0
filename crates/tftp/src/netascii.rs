//! Streaming netascii transcoding.
//!
//! On the wire, netascii text uses CR LF for a line break and CR NUL for a
//! literal carriage return. Both directions are streaming filters with a
//! single byte of state, so an expansion pair may split across a block
//! boundary: the encoder carries the pending second byte into the head of the
//! next block, the decoder carries a "saw CR" flag into the next block.
//!
//! Octet mode uses the same types with the conversion switched off.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::Mode;

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const NUL: u8 = 0;

const READ_CHUNK: usize = 4096;

/// Produces DATA payloads from a byte source.
///
/// Every block is exactly the requested size except the last; a final block
/// shorter than the block size (possibly empty) signals the end of the
/// transfer to the peer.
pub struct BlockReader<R> {
    inner: R,
    mode: Mode,
    /// Second byte of an expansion pair cut off by the previous block.
    carry: Option<u8>,
    raw: Vec<u8>,
    pos: usize,
    len: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin> BlockReader<R> {
    pub fn new(inner: R, mode: Mode) -> Self {
        Self {
            inner,
            mode,
            carry: None,
            raw: vec![0; READ_CHUNK],
            pos: 0,
            len: 0,
            eof: false,
        }
    }

    /// Refill the read-ahead buffer; false at end of input.
    async fn refill(&mut self) -> io::Result<bool> {
        if self.pos < self.len {
            return Ok(true);
        }
        if self.eof {
            return Ok(false);
        }
        let n = self.inner.read(&mut self.raw).await?;
        if n == 0 {
            self.eof = true;
            return Ok(false);
        }
        self.pos = 0;
        self.len = n;
        Ok(true)
    }

    /// Fill `block` with the next payload of up to `block_size` bytes.
    ///
    /// Returns the payload length; a value below `block_size` means the
    /// source is exhausted.
    pub async fn next_block(&mut self, block: &mut Vec<u8>, block_size: usize) -> io::Result<usize> {
        block.clear();
        if let Some(byte) = self.carry.take() {
            block.push(byte);
        }

        match self.mode {
            Mode::Octet => {
                while block.len() < block_size {
                    if !self.refill().await? {
                        break;
                    }
                    let want = block_size - block.len();
                    let take = want.min(self.len - self.pos);
                    block.extend_from_slice(&self.raw[self.pos..self.pos + take]);
                    self.pos += take;
                }
            }
            Mode::Netascii => {
                while block.len() < block_size {
                    if !self.refill().await? {
                        break;
                    }
                    let byte = self.raw[self.pos];
                    self.pos += 1;
                    let expansion = match byte {
                        LF => Some(LF),
                        CR => Some(NUL),
                        _ => None,
                    };
                    match expansion {
                        Some(second) => {
                            block.push(CR);
                            if block.len() == block_size {
                                self.carry = Some(second);
                            } else {
                                block.push(second);
                            }
                        }
                        None => block.push(byte),
                    }
                }
            }
        }

        Ok(block.len())
    }
}

/// Writes received DATA payloads to a byte sink.
pub struct BlockWriter<W> {
    inner: W,
    mode: Mode,
    /// A CR ended the previous block; its partner arrives in the next one.
    saw_cr: bool,
    scratch: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> BlockWriter<W> {
    pub fn new(inner: W, mode: Mode) -> Self {
        Self {
            inner,
            mode,
            saw_cr: false,
            scratch: Vec::new(),
        }
    }

    /// Decode one payload and append it to the sink.
    pub async fn write_block(&mut self, payload: &[u8]) -> io::Result<()> {
        match self.mode {
            Mode::Octet => self.inner.write_all(payload).await,
            Mode::Netascii => {
                self.scratch.clear();
                for &byte in payload {
                    if self.saw_cr {
                        self.saw_cr = false;
                        match byte {
                            LF => self.scratch.push(LF),
                            NUL => self.scratch.push(CR),
                            CR => {
                                // stray CR; keep it and stay armed
                                self.scratch.push(CR);
                                self.saw_cr = true;
                            }
                            other => {
                                self.scratch.push(CR);
                                self.scratch.push(other);
                            }
                        }
                    } else if byte == CR {
                        self.saw_cr = true;
                    } else {
                        self.scratch.push(byte);
                    }
                }
                self.inner.write_all(&self.scratch).await
            }
        }
    }

    /// Flush the sink, emitting a carried CR left dangling by the final
    /// block.
    pub async fn finish(&mut self) -> io::Result<()> {
        if self.saw_cr {
            self.saw_cr = false;
            self.inner.write_all(&[CR]).await?;
        }
        self.inner.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn encode_with_block_size(input: &[u8], mode: Mode, block_size: usize) -> Vec<Vec<u8>> {
        let mut reader = BlockReader::new(input, mode);
        let mut blocks = Vec::new();
        loop {
            let mut block = Vec::new();
            let n = reader.next_block(&mut block, block_size).await.unwrap();
            blocks.push(block);
            if n < block_size {
                break;
            }
        }
        blocks
    }

    async fn decode_blocks(blocks: &[Vec<u8>], mode: Mode) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut writer = BlockWriter::new(&mut out, mode);
            for block in blocks {
                writer.write_block(block).await.unwrap();
            }
            writer.finish().await.unwrap();
        }
        out
    }

    #[tokio::test]
    async fn octet_blocks_pass_through() {
        let input = b"0123456789abcdef!".as_slice();
        let blocks = encode_with_block_size(input, Mode::Octet, 8).await;
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0], b"01234567");
        assert_eq!(blocks[1], b"89abcdef");
        assert_eq!(blocks[2], b"!");

        assert_eq!(decode_blocks(&blocks, Mode::Octet).await, input);
    }

    #[tokio::test]
    async fn newline_expands_to_cr_lf() {
        let blocks = encode_with_block_size(b"a\nb", Mode::Netascii, 512).await;
        assert_eq!(blocks[0], b"a\r\nb");
    }

    #[tokio::test]
    async fn bare_cr_expands_to_cr_nul() {
        let blocks = encode_with_block_size(b"a\rb", Mode::Netascii, 512).await;
        assert_eq!(blocks[0], b"a\r\0b");
    }

    #[tokio::test]
    async fn expansion_pair_splits_across_blocks() {
        // "ab\n" expands to "ab CR LF"; with 3-byte blocks the LF is carried
        let blocks = encode_with_block_size(b"ab\ncd", Mode::Netascii, 3).await;
        assert_eq!(blocks[0], b"ab\r");
        assert_eq!(blocks[1], b"\ncd");
        assert_eq!(decode_blocks(&blocks, Mode::Netascii).await, b"ab\ncd");
    }

    #[tokio::test]
    async fn decoder_carries_cr_state_across_blocks() {
        // CR at the end of one payload, NUL at the start of the next
        let blocks = vec![b"ab\r".to_vec(), b"\0cd".to_vec()];
        assert_eq!(decode_blocks(&blocks, Mode::Netascii).await, b"ab\rcd");
    }

    #[tokio::test]
    async fn trailing_cr_survives() {
        let input = b"end\r".as_slice();
        let blocks = encode_with_block_size(input, Mode::Netascii, 512).await;
        assert_eq!(blocks[0], b"end\r\0");
        assert_eq!(decode_blocks(&blocks, Mode::Netascii).await, input);
    }

    #[tokio::test]
    async fn round_trip_at_awkward_block_sizes() {
        let input: Vec<u8> = b"line one\nline two\r\nmixed\rbare\n\n\r\r tail".to_vec();
        for block_size in [1, 2, 3, 5, 8, 16, 512] {
            let blocks = encode_with_block_size(&input, Mode::Netascii, block_size).await;
            // every block except the last is exactly block_size long
            for block in &blocks[..blocks.len() - 1] {
                assert_eq!(block.len(), block_size);
            }
            assert!(blocks.last().unwrap().len() < block_size);
            assert_eq!(decode_blocks(&blocks, Mode::Netascii).await, input, "block_size={}", block_size);
        }
    }

    #[tokio::test]
    async fn exact_multiple_produces_empty_final_block() {
        let blocks = encode_with_block_size(b"12345678", Mode::Octet, 4).await;
        assert_eq!(blocks.len(), 3);
        assert!(blocks[2].is_empty());
    }
}
