use bytes::{Buf, BytesMut};
use serde::Deserialize;

use loom_core::delta::StreamDelta;
use loom_core::errors::{FRAME_PARSE_ERROR, UNKNOWN_STREAM_ERROR};
use loom_core::events::TimelineEvent;
use loom_core::frames::StreamFrame;
use loom_core::ids::WorldlineId;

/// Incremental decoder for the `event: <kind>\ndata: <json>\n\n` transport.
///
/// Chunk boundaries are arbitrary: a frame split across chunks is retained in
/// the internal buffer until its terminator arrives. Feeding one buffer whole
/// or split at any byte offset yields the same frame sequence.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Consume a chunk and return every frame completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamFrame> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some((end, term_len)) = find_terminator(&self.buf) {
            let block = self.buf.split_to(end);
            self.buf.advance(term_len);
            if let Some(frame) = parse_block(&block) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Process whatever terminated-but-unflushed frame remains, e.g. a frame
    /// missing only the final blank line at end of stream.
    pub fn flush(&mut self) -> Vec<StreamFrame> {
        let rest = self.buf.split();
        if rest.iter().all(|b| b.is_ascii_whitespace()) {
            return Vec::new();
        }
        parse_block(&rest).into_iter().collect()
    }

    /// Bytes currently held for an incomplete frame.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

/// Earliest frame terminator in `buf`: `\n\n` or `\r\n\r\n`.
fn find_terminator(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| (i, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if b.0 < a.0 { b } else { a }),
        (a, b) => a.or(b),
    }
}

/// Parse one terminator-delimited block into a typed frame.
/// Unknown kinds are skipped; malformed JSON becomes an error frame so the
/// stream keeps flowing.
fn parse_block(block: &[u8]) -> Option<StreamFrame> {
    let text = String::from_utf8_lossy(block);
    let mut kind = String::new();
    let mut data = String::new();

    for line in text.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(rest) = line.strip_prefix("event:") {
            kind = rest.trim_start().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }

    if kind.is_empty() {
        return None;
    }

    match kind.as_str() {
        "event" => match serde_json::from_str::<EventPayload>(&data) {
            Ok(p) => Some(StreamFrame::Event {
                seq: p.seq,
                worldline_id: p.worldline_id,
                event: p.event,
            }),
            Err(_) => Some(parse_failure()),
        },
        "delta" => match serde_json::from_str::<DeltaPayload>(&data) {
            Ok(p) => Some(StreamFrame::Delta {
                seq: p.seq,
                worldline_id: p.worldline_id,
                delta: p.delta,
            }),
            Err(_) => Some(parse_failure()),
        },
        "done" => match serde_json::from_str::<DonePayload>(&data) {
            Ok(p) => Some(StreamFrame::Done { seq: p.seq, worldline_id: p.worldline_id }),
            Err(_) => Some(parse_failure()),
        },
        "error" => match serde_json::from_str::<ErrorPayload>(&data) {
            Ok(p) => Some(StreamFrame::Error {
                message: p.error.unwrap_or_else(|| UNKNOWN_STREAM_ERROR.to_string()),
            }),
            Err(_) => Some(parse_failure()),
        },
        _ => None, // ping, comments, future kinds
    }
}

fn parse_failure() -> StreamFrame {
    StreamFrame::ParseError { message: FRAME_PARSE_ERROR.to_string() }
}

// --- Wire payload shapes ---

#[derive(Deserialize)]
struct EventPayload {
    seq: u64,
    worldline_id: WorldlineId,
    event: TimelineEvent,
}

#[derive(Deserialize)]
struct DeltaPayload {
    seq: u64,
    worldline_id: WorldlineId,
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct DonePayload {
    seq: u64,
    worldline_id: WorldlineId,
}

#[derive(Deserialize)]
struct ErrorPayload {
    error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::events::TimelineEventType;

    fn event_frame_bytes(seq: u64) -> String {
        format!(
            "event: event\ndata: {{\"seq\":{seq},\"worldline_id\":\"wl_1\",\"event\":{{\"id\":\"evt_{seq}\",\"parent_event_id\":null,\"type\":\"user_message\",\"payload\":{{\"text\":\"hi\"}},\"created_at\":\"2026-08-29T12:00:00Z\"}}}}\n\n"
        )
    }

    #[test]
    fn decodes_single_event_frame() {
        let mut dec = FrameDecoder::new();
        let frames = dec.feed(event_frame_bytes(1).as_bytes());
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            StreamFrame::Event { seq, worldline_id, event } => {
                assert_eq!(*seq, 1);
                assert_eq!(worldline_id.as_str(), "wl_1");
                assert_eq!(event.event_type, TimelineEventType::UserMessage);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(dec.pending_len(), 0);
    }

    #[test]
    fn decodes_delta_done_error() {
        let raw = concat!(
            "event: delta\ndata: {\"seq\":1,\"worldline_id\":\"wl_1\",\"delta\":{\"kind\":\"assistant_text\",\"delta\":\"Hi\"}}\n\n",
            "event: done\ndata: {\"seq\":2,\"worldline_id\":\"wl_1\",\"done\":true}\n\n",
            "event: error\ndata: {\"error\":\"server busy\"}\n\n",
        );
        let mut dec = FrameDecoder::new();
        let frames = dec.feed(raw.as_bytes());
        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[0], StreamFrame::Delta { .. }));
        assert!(matches!(frames[1], StreamFrame::Done { seq: 2, .. }));
        assert!(matches!(&frames[2], StreamFrame::Error { message } if message == "server busy"));
    }

    #[test]
    fn error_frame_without_field_uses_fallback() {
        let mut dec = FrameDecoder::new();
        let frames = dec.feed(b"event: error\ndata: {}\n\n");
        assert!(matches!(&frames[0], StreamFrame::Error { message } if message == UNKNOWN_STREAM_ERROR));
    }

    #[test]
    fn malformed_json_is_reported_and_does_not_abort() {
        let raw = concat!(
            "event: delta\ndata: {not json\n\n",
            "event: done\ndata: {\"seq\":9,\"worldline_id\":\"wl_1\"}\n\n",
        );
        let mut dec = FrameDecoder::new();
        let frames = dec.feed(raw.as_bytes());
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], StreamFrame::ParseError { message } if message == FRAME_PARSE_ERROR));
        assert!(!frames[0].is_terminal());
        assert!(matches!(frames[1], StreamFrame::Done { seq: 9, .. }));
    }

    #[test]
    fn unknown_kinds_are_skipped() {
        let raw = "event: ping\ndata: {}\n\nevent: done\ndata: {\"seq\":1,\"worldline_id\":\"wl_1\"}\n\n";
        let mut dec = FrameDecoder::new();
        let frames = dec.feed(raw.as_bytes());
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], StreamFrame::Done { .. }));
    }

    #[test]
    fn split_at_every_offset_matches_whole_feed() {
        let raw = format!(
            "{}event: delta\ndata: {{\"seq\":2,\"worldline_id\":\"wl_1\",\"delta\":{{\"kind\":\"assistant_text\",\"delta\":\"Hello\"}}}}\n\nevent: done\ndata: {{\"seq\":3,\"worldline_id\":\"wl_1\"}}\n\n",
            event_frame_bytes(1)
        );
        let bytes = raw.as_bytes();

        let mut whole = FrameDecoder::new();
        let mut expected = whole.feed(bytes);
        expected.extend(whole.flush());
        let expected_json: Vec<String> = expected
            .iter()
            .map(|f| serde_json::to_string(f).unwrap())
            .collect();

        for split in 1..bytes.len() {
            let mut dec = FrameDecoder::new();
            let mut got = dec.feed(&bytes[..split]);
            got.extend(dec.feed(&bytes[split..]));
            got.extend(dec.flush());
            let got_json: Vec<String> =
                got.iter().map(|f| serde_json::to_string(f).unwrap()).collect();
            assert_eq!(got_json, expected_json, "diverged at split {split}");
        }
    }

    #[test]
    fn crlf_terminators_decode() {
        let raw = "event: done\r\ndata: {\"seq\":1,\"worldline_id\":\"wl_1\"}\r\n\r\n";
        let mut dec = FrameDecoder::new();
        let frames = dec.feed(raw.as_bytes());
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], StreamFrame::Done { seq: 1, .. }));
    }

    #[test]
    fn flush_completes_trailing_frame() {
        let mut dec = FrameDecoder::new();
        // Terminated by a single newline only — not a complete frame yet.
        let frames = dec.feed(b"event: done\ndata: {\"seq\":4,\"worldline_id\":\"wl_1\"}\n");
        assert!(frames.is_empty());
        assert!(dec.pending_len() > 0);

        let flushed = dec.flush();
        assert_eq!(flushed.len(), 1);
        assert!(matches!(flushed[0], StreamFrame::Done { seq: 4, .. }));
        assert_eq!(dec.pending_len(), 0);
    }

    #[test]
    fn flush_on_whitespace_is_empty() {
        let mut dec = FrameDecoder::new();
        let _ = dec.feed(b"\n");
        assert!(dec.flush().is_empty());
    }

    #[test]
    fn frame_order_is_preserved() {
        let raw: String = (0..5).map(event_frame_bytes).collect();
        let mut dec = FrameDecoder::new();
        let frames = dec.feed(raw.as_bytes());
        let seqs: Vec<u64> = frames
            .iter()
            .filter_map(|f| match f {
                StreamFrame::Event { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }
}
