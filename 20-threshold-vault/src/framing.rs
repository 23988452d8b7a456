//! Length-prefixed framing for the replica wire protocol.
//!
//! Every frame is a 4-byte big-endian payload length followed by the payload
//! itself. TCP hands us the stream in arbitrary chunks, so [`FrameBuffer`]
//! accumulates bytes and releases whole payloads only once they are complete.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Size of the length header in bytes.
pub const HEADER_LEN: usize = 4;

/// Largest payload a peer may announce before we give up on the connection.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },
}

/// Prepends the 4-byte big-endian length header to `payload`.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Writes one framed payload and flushes so the peer sees it promptly.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(payload)).await?;
    writer.flush().await
}

/// Reassembles frames from an append-only byte stream.
///
/// Feed raw socket reads into [`FrameBuffer::write`] and drain with
/// [`FrameBuffer::try_read`] until it yields `Ok(None)`. Partial frames stay
/// buffered untouched until the rest of their bytes arrive.
#[derive(Debug)]
pub struct FrameBuffer {
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::with_max_frame_len(MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_len,
        }
    }

    /// Appends freshly read bytes.
    pub fn write(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete payload, consuming exactly its header and body.
    ///
    /// `Ok(None)` means more bytes are needed; nothing is consumed in that
    /// case. An announced length above the limit is reported as an error and
    /// the caller is expected to drop the connection.
    pub fn try_read(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let Some(len) = self.next_length() else {
            return Ok(None);
        };
        if len > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buf.drain(..HEADER_LEN + len);
        Ok(Some(payload))
    }

    /// Number of buffered bytes not yet returned as payloads.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn next_length(&self) -> Option<usize> {
        let header: [u8; HEADER_LEN] = self.buf.get(..HEADER_LEN)?.try_into().ok()?;
        Some(u32::from_be_bytes(header) as usize)
    }
}
