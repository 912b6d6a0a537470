//! Reader loop for the child's stdout.
//!
//! Drives a [`FramedRead`] backed by [`FrameCodec`], decodes each frame into
//! an [`InboundMessage`], and routes it:
//!
//! | Inbound shape               | Destination                              |
//! |-----------------------------|------------------------------------------|
//! | response with `result`      | [`Correlator::resolve`]                  |
//! | response with `error`       | [`Correlator::reject`] with `AppError::Rpc` |
//! | notification (`method`)     | [`ClientEvent::Notification`]            |
//! | request (`method` + `id`)   | [`ClientEvent::ServerRequest`]           |
//! | undecodable / oversized     | logged, [`ClientEvent::FrameDropped`]    |
//!
//! Bad frames never stop the loop; only EOF, an I/O error, or cancellation
//! do.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::events::{emit, ClientEvent};
use crate::rpc::codec::{Frame, FrameCodec};
use crate::rpc::correlator::Correlator;
use crate::rpc::message::InboundMessage;
use crate::{AppError, Result};

/// Why [`run_reader`] returned.
#[derive(Debug, Clone, PartialEq)]
pub enum ReaderExit {
    /// The stream reached end of file.
    Eof,
    /// The cancellation token fired.
    Cancelled,
    /// The underlying stream returned an I/O error.
    Failed(AppError),
}

/// Decode a single frame.
///
/// - `Ok(Some(message))` for a well-formed message.
/// - `Ok(None)` for a whitespace-only frame, which is skipped.
///
/// # Errors
///
/// Returns [`AppError::Protocol`] when the frame cannot be decoded.
pub fn parse_inbound(frame: &[u8]) -> Result<Option<InboundMessage>> {
    if frame.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    InboundMessage::from_slice(frame).map(Some)
}

/// Route one decoded message to the correlator or the owner's event channel.
pub fn dispatch(
    message: InboundMessage,
    correlator: &Correlator,
    event_tx: &mpsc::Sender<ClientEvent>,
) {
    match message {
        InboundMessage::Response { id, outcome } => {
            let matched = match outcome {
                Ok(result) => correlator.resolve(id, result),
                Err(error) => correlator.reject(id, error.into()),
            };
            if !matched {
                debug!(id, "reader: response for unknown or completed request ignored");
            }
        }
        InboundMessage::Notification { method, params } => {
            debug!(method, "reader: server notification");
            emit(event_tx, ClientEvent::Notification { method, params });
        }
        InboundMessage::Request { id, method, params } => {
            debug!(method, %id, "reader: server-initiated request surfaced to owner");
            emit(event_tx, ClientEvent::ServerRequest { id, method, params });
        }
    }
}

/// Reader task: consume `stdout` until EOF, error, or cancellation.
///
/// Every complete frame is decoded and dispatched in arrival order, so
/// responses reach the correlator in exactly the order the peer wrote them.
pub async fn run_reader<R>(
    stdout: R,
    codec: FrameCodec,
    correlator: Arc<Correlator>,
    event_tx: mpsc::Sender<ClientEvent>,
    cancel: CancellationToken,
) -> ReaderExit
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(stdout, codec);

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!("reader: cancellation received, stopping");
                return ReaderExit::Cancelled;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!("reader: EOF detected");
                        return ReaderExit::Eof;
                    }

                    Some(Err(e)) => {
                        warn!(error = %e, "reader: stream error, stopping");
                        return ReaderExit::Failed(AppError::Transport(format!(
                            "stream error: {e}"
                        )));
                    }

                    Some(Ok(Frame::Oversized { limit })) => {
                        warn!(limit, "reader: frame exceeds limit, discarding");
                        emit(&event_tx, ClientEvent::FrameDropped {
                            reason: format!("frame exceeded {limit} bytes"),
                        });
                    }

                    Some(Ok(Frame::Unterminated { len })) => {
                        warn!(len, "reader: stream ended inside a frame, discarding");
                        emit(&event_tx, ClientEvent::FrameDropped {
                            reason: format!("unterminated frame of {len} bytes at end of stream"),
                        });
                    }

                    Some(Ok(Frame::Message(bytes))) => match parse_inbound(&bytes) {
                        Ok(Some(message)) => dispatch(message, &correlator, &event_tx),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(
                                error = %e,
                                raw_frame = %String::from_utf8_lossy(&bytes),
                                "reader: undecodable frame, skipping"
                            );
                            emit(&event_tx, ClientEvent::FrameDropped {
                                reason: e.to_string(),
                            });
                        }
                    },
                }
            }
        }
    }
}
