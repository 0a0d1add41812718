//! Reassembles length-prefixed frames from a chunked byte stream.

use bytes::{Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::codec::{self, CodecError};

/// Largest frame (length prefix included) the protocol allows.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 2_097_151;
/// The length prefix of a frame may not use more than three `VarInt` bytes.
pub const MAX_LENGTH_PREFIX_LEN: usize = 3;

const READ_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame length prefix is longer than 3 bytes")]
    LengthPrefixTooLong,
    #[error("frame declares a negative length ({0})")]
    NegativeLength(i32),
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("malformed frame length prefix: {0}")]
    Codec(#[from] CodecError),
    #[error("source closed with {buffered} bytes buffered and no complete frame")]
    SourceExhausted { buffered: usize },
    #[error("failed to read from source: {0}")]
    Io(#[from] io::Error),
}

/// One complete frame: length prefix, packet id and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Bytes,
    prefix_len: usize,
}

impl Frame {
    /// Wraps a packet body (packet id + payload) with its length prefix.
    #[must_use]
    pub fn from_body(body: &[u8]) -> Self {
        let length = codec::length_prefix(body.len());
        let prefix_len = codec::var_int_len(length);

        let mut bytes = BytesMut::with_capacity(prefix_len + body.len());
        codec::write_var_int(&mut bytes, length);
        bytes.extend_from_slice(body);

        Self {
            bytes: bytes.freeze(),
            prefix_len,
        }
    }

    /// The complete frame exactly as it appeared on the wire.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Packet id and payload, without the length prefix.
    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.bytes[self.prefix_len..]
    }

    pub fn packet_id(&self) -> Result<i32, CodecError> {
        codec::read_var_int(&mut self.body())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Reads frames off an [`AsyncRead`] source.
///
/// Bytes that arrive before a frame is complete stay in an internal buffer, so
/// a frame split across any number of reads is reassembled without loss. Only
/// the bytes of a returned frame are ever consumed.
pub struct FrameReader<R> {
    source: R,
    buffer: BytesMut,
    max_frame_size: usize,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(source: R) -> Self {
        Self::with_max_frame_size(source, DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(source: R, max_frame_size: usize) -> Self {
        Self {
            source,
            buffer: BytesMut::with_capacity(READ_CHUNK_SIZE),
            max_frame_size,
        }
    }

    /// Reads until one complete frame is buffered and returns it.
    ///
    /// Size violations are reported as soon as the length prefix is decoded,
    /// without waiting for the payload.
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        loop {
            if let Some(frame) = self.split_frame()? {
                return Ok(frame);
            }

            self.buffer.reserve(READ_CHUNK_SIZE);
            if self.source.read_buf(&mut self.buffer).await? == 0 {
                return Err(FrameError::SourceExhausted {
                    buffered: self.buffer.len(),
                });
            }
        }
    }

    /// Bytes received past the last returned frame.
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Gives back the source along with any bytes already read from it but
    /// not yet returned as part of a frame.
    pub fn into_parts(self) -> (R, Bytes) {
        (self.source, self.buffer.freeze())
    }

    fn split_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let head = &self.buffer[..self.buffer.len().min(MAX_LENGTH_PREFIX_LEN)];

        let (declared, prefix_len) = match codec::peek_var_int(head)? {
            Some(decoded) => decoded,
            None if head.len() == MAX_LENGTH_PREFIX_LEN => {
                return Err(FrameError::LengthPrefixTooLong);
            }
            None => return Ok(None),
        };

        let Ok(length) = usize::try_from(declared) else {
            return Err(FrameError::NegativeLength(declared));
        };

        let size = prefix_len + length;
        if size > self.max_frame_size {
            return Err(FrameError::TooLarge {
                size,
                max: self.max_frame_size,
            });
        }

        if self.buffer.len() < size {
            return Ok(None);
        }

        Ok(Some(Frame {
            bytes: self.buffer.split_to(size).freeze(),
            prefix_len,
        }))
    }
}
