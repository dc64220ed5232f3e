//! Server-sent event framing for streamed provider responses
//!
//! Providers flush whatever they have, so one network chunk may hold half an event or several
//! events. [`SseBufferedStream`] re-frames the byte stream into whole events, and
//! [`data_payloads`] pulls the `data:` fields out of one.

use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Yields one complete event (including its terminating blank line) at a time.
pub struct SseBufferedStream<S> {
    inner: S,
    buffer: BytesMut,
}

impl<S> SseBufferedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffer: BytesMut::new(),
        }
    }
}

impl<S, E> Stream for SseBufferedStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        loop {
            if let Some(end) = event_end(&this.buffer) {
                return Poll::Ready(Some(Ok(this.buffer.split_to(end).freeze())));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.buffer.extend_from_slice(&chunk),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) if this.buffer.is_empty() => return Poll::Ready(None),
                // Whatever is left is the (unterminated) last event.
                Poll::Ready(None) => return Poll::Ready(Some(Ok(this.buffer.split().freeze()))),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Index just past the first event terminator (`\n\n` or `\r\n\r\n`).
fn event_end(buf: &[u8]) -> Option<usize> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| p + 2);
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// The values of every `data:` field of one event, in order. Comments and other fields are
/// ignored.
pub fn data_payloads(event: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(event)
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value).trim_end().to_string())
        .collect()
}
