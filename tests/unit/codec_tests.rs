//! Unit tests for `FrameCodec` framing.
//!
//! Covers:
//! - single and batched frames
//! - frames split across reads at arbitrary offsets
//! - empty frames and CRLF terminators
//! - oversized frames are discarded without losing the next frame
//! - unterminated trailing bytes at EOF are reported, never parsed
//! - outbound encoding is one compact line per message

use bytes::{Bytes, BytesMut};
use serde_json::json;
use tokio_util::codec::{Decoder, Encoder};

use toolpipe::rpc::codec::{Frame, FrameCodec};
use toolpipe::rpc::message::OutboundMessage;

fn message(raw: &str) -> Frame {
    Frame::Message(Bytes::copy_from_slice(raw.as_bytes()))
}

/// Feed `chunks` one at a time and collect every decoded frame.
fn decode_chunks(codec: &mut FrameCodec, chunks: &[&[u8]]) -> Vec<Frame> {
    let mut buf = BytesMut::new();
    let mut frames = Vec::new();
    for chunk in chunks {
        buf.extend_from_slice(chunk);
        while let Some(frame) = codec.decode(&mut buf).expect("decode never fails") {
            frames.push(frame);
        }
    }
    frames
}

// ── Basic framing ───────────────────────────────────────────────────────────

/// A complete line is returned without its delimiter.
#[test]
fn single_frame_is_decoded_without_delimiter() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from("{\"id\":1,\"result\":{}}\n");

    let frame = codec.decode(&mut buf).expect("decode must succeed");

    assert_eq!(frame, Some(message("{\"id\":1,\"result\":{}}")));
    assert!(buf.is_empty(), "delimiter must be consumed");
}

/// Several frames in one read come out one per `decode` call.
#[test]
fn batched_frames_are_each_decoded() {
    let mut codec = FrameCodec::new();
    let frames = decode_chunks(&mut codec, &[b"{\"a\":1}\n{\"b\":2}\n{\"c\":3}\n"]);

    assert_eq!(
        frames,
        vec![message("{\"a\":1}"), message("{\"b\":2}"), message("{\"c\":3}")]
    );
}

/// Without a delimiter nothing is emitted yet.
#[test]
fn partial_frame_waits_for_delimiter() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from("{\"id\":1,");

    assert_eq!(codec.decode(&mut buf).expect("decode"), None);
    assert_eq!(buf.len(), 8, "partial bytes stay buffered");
}

// ── Split delivery ──────────────────────────────────────────────────────────

/// Splitting one frame at every possible offset yields the same single frame.
#[test]
fn split_at_every_offset_yields_identical_frame() {
    let raw = b"{\"jsonrpc\":\"2.0\",\"id\":7,\"result\":{\"ok\":true}}\n";
    let whole = decode_chunks(&mut FrameCodec::new(), &[raw]);
    assert_eq!(whole.len(), 1);

    for offset in 1..raw.len() {
        let (head, tail) = raw.split_at(offset);
        let frames = decode_chunks(&mut FrameCodec::new(), &[head, tail]);
        assert_eq!(frames, whole, "split at byte {offset} must not change the frame");
    }
}

/// A frame trickled in byte by byte is still emitted exactly once.
#[test]
fn byte_by_byte_delivery_yields_one_frame() {
    let raw = b"{\"method\":\"notifications/progress\"}\n";
    let chunks: Vec<&[u8]> = raw.chunks(1).collect();

    let frames = decode_chunks(&mut FrameCodec::new(), &chunks);

    assert_eq!(frames, vec![message("{\"method\":\"notifications/progress\"}")]);
}

// ── Empty frames and CRLF ───────────────────────────────────────────────────

/// Consecutive delimiters produce no frames.
#[test]
fn empty_frames_are_skipped() {
    let frames = decode_chunks(&mut FrameCodec::new(), &[b"\n\n{\"a\":1}\n\n\r\n{\"b\":2}\n"]);

    assert_eq!(frames, vec![message("{\"a\":1}"), message("{\"b\":2}")]);
}

/// A trailing carriage return is stripped.
#[test]
fn crlf_terminator_is_tolerated() {
    let frames = decode_chunks(&mut FrameCodec::new(), &[b"{\"a\":1}\r\n"]);

    assert_eq!(frames, vec![message("{\"a\":1}")]);
}

/// Payload validity is not the codec's concern.
#[test]
fn invalid_json_is_still_framed() {
    let frames = decode_chunks(&mut FrameCodec::new(), &[b"not json\n{\"a\":1}\n"]);

    assert_eq!(frames, vec![message("not json"), message("{\"a\":1}")]);
}

// ── Length limit ────────────────────────────────────────────────────────────

/// An oversized frame is reported once and the following frame survives.
#[test]
fn oversized_frame_is_discarded_and_framing_resumes() {
    let mut codec = FrameCodec::with_max_length(8);
    let frames = decode_chunks(&mut codec, &[b"0123456789abcdef", b"ghij\n{\"a\":1}\n"]);

    assert_eq!(frames, vec![Frame::Oversized { limit: 8 }, message("{\"a\":1}")]);
}

/// A frame of exactly the limit is accepted.
#[test]
fn frame_at_limit_is_accepted() {
    let mut codec = FrameCodec::with_max_length(7);
    let frames = decode_chunks(&mut codec, &[b"{\"a\":1}\n"]);

    assert_eq!(frames, vec![message("{\"a\":1}")]);
}

// ── EOF ─────────────────────────────────────────────────────────────────────

/// Trailing bytes without a delimiter are reported at EOF, not parsed.
#[test]
fn unterminated_tail_is_dropped_at_eof() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from("{\"id\":3,\"result\":null}");

    assert_eq!(codec.decode(&mut buf).expect("decode"), None);
    let last = codec.decode_eof(&mut buf).expect("decode_eof");

    assert_eq!(last, Some(Frame::Unterminated { len: 22 }));
    assert!(buf.is_empty());
    assert_eq!(codec.decode_eof(&mut buf).expect("decode_eof"), None);
}

/// Trailing whitespace after the last delimiter is not a dropped frame.
#[test]
fn whitespace_tail_is_ignored_at_eof() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from("{\"id\":1}\n\r");

    assert_eq!(codec.decode(&mut buf).expect("decode"), Some(message("{\"id\":1}")));
    assert_eq!(codec.decode_eof(&mut buf).expect("decode_eof"), None);
}

// ── Encoding ────────────────────────────────────────────────────────────────

/// A request is written as one compact JSON line.
#[test]
fn request_is_encoded_as_single_line() {
    let mut codec = FrameCodec::new();
    let mut dst = BytesMut::new();
    let request = OutboundMessage::request(4, "tools/call", Some(json!({"text": "a\nb"})));

    codec.encode(request, &mut dst).expect("encode must succeed");

    let line = std::str::from_utf8(&dst).expect("utf-8");
    assert!(line.ends_with('\n'));
    assert_eq!(line.matches('\n').count(), 1, "embedded newlines must be escaped");

    let value: serde_json::Value = serde_json::from_str(line.trim_end()).expect("json");
    assert_eq!(
        value,
        json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call", "params": {"text": "a\nb"}})
    );
}

/// A notification carries no id, and absent params are omitted.
#[test]
fn notification_is_encoded_without_id() {
    let mut codec = FrameCodec::new();
    let mut dst = BytesMut::new();

    codec
        .encode(
            OutboundMessage::notification("notifications/initialized", None),
            &mut dst,
        )
        .expect("encode must succeed");

    assert_eq!(
        &dst[..],
        b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n"
    );
}
