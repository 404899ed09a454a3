//! Reading and writing device-link frames on a byte stream.
//!
//! # Why a buffer is needed
//!
//! TCP is a stream protocol.  One `read()` may return half a frame or
//! several frames at once.  [`FrameReader`] keeps the leftover bytes in a
//! `BytesMut` between reads and only hands out whole frames.
//!
//! All buffered state lives in the reader, never in a future, so
//! [`FrameReader::next_frame`] can be used as a `tokio::select!` branch and
//! dropped without losing bytes.

use std::io;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::warn;
use ttyhub_core::{decode_frame, encode_frame, frame_len, Frame, ProtocolError};

const INITIAL_CAPACITY: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum FrameReadError {
    #[error("read failed: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("stream ended in the middle of a frame ({0} bytes buffered)")]
    Truncated(usize),
}

pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Reads the next frame that decodes.
    ///
    /// Frames with an unknown type or a body that does not parse are logged
    /// and skipped.  Returns `Ok(None)` when the peer closes cleanly between
    /// frames.
    ///
    /// # Errors
    ///
    /// I/O failures, an unsupported protocol version (the rest of the stream
    /// cannot be trusted), or EOF inside a frame.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, FrameReadError> {
        loop {
            if let Some(len) = frame_len(&self.buf)? {
                let raw = self.buf.split_to(len);
                match decode_frame(&raw) {
                    Ok((frame, _)) => return Ok(Some(frame)),
                    Err(err) if err.is_fatal() => return Err(err.into()),
                    Err(err) => {
                        warn!(%err, len, "skipping undecodable frame");
                        continue;
                    }
                }
            }

            if self.inner.read_buf(&mut self.buf).await? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(FrameReadError::Truncated(self.buf.len()))
                };
            }
        }
    }
}

/// Encodes `frame` and writes it in full.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_frame(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&bytes).await
}
