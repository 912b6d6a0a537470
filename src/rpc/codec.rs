//! Newline-delimited JSON framing for the child's stdio streams.
//!
//! [`FrameCodec`] keeps the scan position between calls in the style of
//! [`tokio_util::codec::LinesCodec`]: bytes are accumulated in the
//! [`FramedRead`](tokio_util::codec::FramedRead) buffer and only the newly
//! arrived suffix is searched for a delimiter, so a frame split across many
//! reads is never rescanned from the start.
//!
//! Unlike `LinesCodec`, the decoder never fails on payload content. Invalid
//! UTF-8 or JSON is left for the message layer to reject, and a frame that
//! exceeds the length limit is discarded up to its delimiter and reported as
//! [`Frame::Oversized`]. A decode error would otherwise end the `FramedRead`
//! stream and desynchronise everything after the bad frame.
//!
//! Bytes left without a delimiter when the stream ends are not a frame: a
//! peer that dies mid-write leaves a truncated message there. They are
//! reported as [`Frame::Unterminated`] and never parsed.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::DEFAULT_MAX_FRAME_BYTES;
use crate::rpc::message::OutboundMessage;
use crate::{AppError, Result};

/// Frame delimiter.
pub const DELIMITER: u8 = b'\n';

/// One unit produced by [`FrameCodec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Payload bytes of a complete frame, delimiter and trailing `\r` removed.
    Message(Bytes),
    /// A frame longer than the limit was seen and is being discarded.
    Oversized {
        /// Limit that was exceeded.
        limit: usize,
    },
    /// Bytes without a delimiter at end of stream, discarded.
    Unterminated {
        /// Number of bytes discarded.
        len: usize,
    },
}

/// NDJSON codec for child-process streams.
///
/// # Decoder
///
/// Yields one [`Frame`] per delimiter. Empty frames (consecutive delimiters
/// or a lone `\r`) are skipped. Only I/O failures surface as errors.
///
/// # Encoder
///
/// Serialises an [`OutboundMessage`] as compact JSON followed by `\n`.
/// `serde_json` escapes control characters inside strings, so the encoded
/// body never contains a raw delimiter.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    /// Offset into the buffer up to which no delimiter exists.
    next_index: usize,
    /// Maximum frame length, excluding the delimiter.
    max_length: usize,
    /// Currently dropping the remainder of an oversized frame.
    is_discarding: bool,
}

impl FrameCodec {
    /// Codec with the default 1 MiB frame limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_FRAME_BYTES)
    }

    /// Codec with a custom frame limit.
    #[must_use]
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            next_index: 0,
            max_length,
            is_discarding: false,
        }
    }

    /// Configured frame limit.
    #[must_use]
    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = AppError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            // Look at most one byte past the limit: a delimiter there still
            // terminates a frame of exactly `max_length` bytes.
            let read_to = self.max_length.saturating_add(1).min(buf.len());
            let delimiter = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == DELIMITER);

            match (self.is_discarding, delimiter) {
                (true, Some(offset)) => {
                    buf.advance(self.next_index + offset + 1);
                    self.next_index = 0;
                    self.is_discarding = false;
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let mut frame = buf.split_to(end + 1);
                    frame.truncate(end);
                    if frame.last() == Some(&b'\r') {
                        frame.truncate(end - 1);
                    }
                    if frame.is_empty() {
                        continue;
                    }
                    return Ok(Some(Frame::Message(frame.freeze())));
                }
                (false, None) if buf.len() > self.max_length => {
                    self.is_discarding = true;
                    return Ok(Some(Frame::Oversized {
                        limit: self.max_length,
                    }));
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }

        if self.is_discarding || buf.is_empty() {
            buf.clear();
            self.next_index = 0;
            return Ok(None);
        }

        let tail = buf.split();
        self.next_index = 0;
        if tail.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(Frame::Unterminated { len: tail.len() }))
    }
}

impl Encoder<OutboundMessage> for FrameCodec {
    type Error = AppError;

    fn encode(&mut self, item: OutboundMessage, dst: &mut BytesMut) -> Result<()> {
        serde_json::to_writer(dst.writer(), &item).map_err(|e| {
            AppError::Protocol(format!("failed to serialise outbound message: {e}"))
        })?;
        dst.put_u8(DELIMITER);
        Ok(())
    }
}
