use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Future, Stream};
use tracing::debug;

use loom_core::frames::StreamFrame;

use crate::decoder::FrameDecoder;

const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Ordered frame stream for one turn. Ends after the terminal frame.
pub type FrameStream = Pin<Box<dyn Stream<Item = StreamFrame> + Send>>;

/// Decode a transport byte stream into frames.
///
/// Chunk boundaries carry no meaning; trailing bytes are flushed when the
/// connection closes. A transport error or idle timeout surfaces as a final
/// error frame so consumers see a terminal frame either way.
pub fn frame_stream(
    byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
) -> FrameStream {
    Box::pin(DecodedFrames::with_idle_timeout(byte_stream, STREAM_IDLE_TIMEOUT))
}

struct DecodedFrames {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    decoder: FrameDecoder,
    pending: Vec<StreamFrame>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl DecodedFrames {
    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            decoder: FrameDecoder::new(),
            pending: Vec::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }
}

impl Stream for DecodedFrames {
    type Item = StreamFrame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if !self.pending.is_empty() {
            return Poll::Ready(Some(self.pending.remove(0)));
        }
        if self.finished {
            return Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    let frames = self.decoder.feed(&bytes);
                    self.pending.extend(frames);
                    if !self.pending.is_empty() {
                        return Poll::Ready(Some(self.pending.remove(0)));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    debug!(error = %e, "stream transport error");
                    self.finished = true;
                    return Poll::Ready(Some(StreamFrame::Error { message: e.to_string() }));
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    // Frame terminators can be missing on the last block.
                    let frames = self.decoder.flush();
                    self.pending.extend(frames);
                    if !self.pending.is_empty() {
                        return Poll::Ready(Some(self.pending.remove(0)));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.finished = true;
                        return Poll::Ready(Some(StreamFrame::Error {
                            message: format!(
                                "stream idle timeout after {}s",
                                self.idle_duration.as_secs()
                            ),
                        }));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn chunks(
        parts: Vec<&'static str>,
    ) -> impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> {
        futures::stream::iter(parts.into_iter().map(|p| Ok(bytes::Bytes::from(p))))
    }

    #[tokio::test]
    async fn decodes_frames_across_chunk_boundaries() {
        let stream = frame_stream(chunks(vec![
            "event: delta\ndata: {\"seq\":1,\"worldline_id\":\"wl_1\",",
            "\"delta\":{\"kind\":\"assistant_text\",\"delta\":\"hi\"}}\n\n",
            "event: done\ndata: {\"seq\":2,\"worldline_id\":\"wl_1\"}\n\n",
        ]));
        let frames: Vec<StreamFrame> = stream.collect().await;
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], StreamFrame::Delta { seq: 1, .. }));
        assert!(matches!(frames[1], StreamFrame::Done { seq: 2, .. }));
    }

    #[tokio::test]
    async fn flushes_unterminated_trailing_frame_at_eof() {
        let stream = frame_stream(chunks(vec![
            "event: done\ndata: {\"seq\":1,\"worldline_id\":\"wl_1\"}",
        ]));
        let frames: Vec<StreamFrame> = stream.collect().await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_terminal());
    }

    #[tokio::test]
    async fn ends_after_eof() {
        let mut stream = frame_stream(chunks(vec![
            "event: done\ndata: {\"seq\":1,\"worldline_id\":\"wl_1\"}\n\n",
        ]));
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn idle_timeout_yields_error_frame() {
        tokio::time::pause();

        let byte_stream = futures::stream::pending::<Result<bytes::Bytes, reqwest::Error>>();
        let mut stream = Box::pin(DecodedFrames::with_idle_timeout(
            byte_stream,
            Duration::from_secs(5),
        ));

        tokio::time::advance(Duration::from_secs(6)).await;

        let frame = stream.next().await;
        assert!(
            matches!(&frame, Some(StreamFrame::Error { message }) if message.contains("idle timeout")),
            "expected idle timeout error, got: {frame:?}"
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn idle_timeout_resets_on_data() {
        tokio::time::pause();

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, reqwest::Error>>(16);
        let rx_stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        let mut stream = Box::pin(DecodedFrames::with_idle_timeout(
            rx_stream,
            Duration::from_secs(5),
        ));

        tx.send(Ok(bytes::Bytes::from(
            "event: delta\ndata: {\"seq\":1,\"worldline_id\":\"wl_1\",\"delta\":{\"kind\":\"assistant_text\",\"delta\":\"a\"}}\n\n",
        )))
        .await
        .unwrap();
        let _frame = stream.next().await;

        tokio::time::advance(Duration::from_secs(4)).await;

        tx.send(Ok(bytes::Bytes::from(
            "event: done\ndata: {\"seq\":2,\"worldline_id\":\"wl_1\"}\n\n",
        )))
        .await
        .unwrap();
        let _frame = stream.next().await;

        drop(tx);
        let frame = stream.next().await;
        assert!(frame.is_none(), "expected stream end, got: {frame:?}");
    }
}
