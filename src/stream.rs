//! Throttled streaming of a byte window.
//!
//! [`ThrottledStream`] copies one contiguous window of a seekable source in
//! bounded chunks, suspending between chunks so a single connection cannot
//! monopolize server bandwidth. The pacing sleep is the only deliberate
//! yield point and holds nothing while suspended; the source handle is owned
//! by the stream and dropped on every exit path.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use std::{io, mem};

use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::{pin_mut, Stream, StreamExt};
use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::Sleep;

use crate::resolve::ByteWindow;
use crate::AsyncSeekStart;

/// Default chunk size, in bytes.
pub const DEFAULT_CHUNK_BYTES: usize = 40960;

/// Default pause between chunks.
pub const DEFAULT_DELAY: Duration = Duration::from_millis(100);

/// Pacing policy for one transfer: at most `chunk_bytes` per write, with
/// `delay` between consecutive writes.
///
/// Passed by value when a transfer starts; not consulted again mid-transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    pub chunk_bytes: usize,
    pub delay: Duration,
}

impl ThrottleConfig {
    /// A zero `chunk_bytes` is bumped to one byte so the transfer can make
    /// progress.
    pub fn new(chunk_bytes: usize, delay: Duration) -> Self {
        ThrottleConfig { chunk_bytes: chunk_bytes.max(1), delay }
    }

    /// Disable pacing: stream as fast as the sink accepts.
    pub fn unthrottled() -> Self {
        ThrottleConfig::new(DEFAULT_CHUNK_BYTES, Duration::ZERO)
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig::new(DEFAULT_CHUNK_BYTES, DEFAULT_DELAY)
    }
}

/// Paced response body over a byte window of `B`.
///
/// Implements [`Stream`], [`Body`], and [`IntoResponse`]. Yields chunks of
/// at most `chunk_bytes` and never more than the window length in total,
/// truncating the final chunk at the window boundary.
#[pin_project]
pub struct ThrottledStream<B> {
    state: StreamState,
    length: u64,
    throttle: ThrottleConfig,
    #[pin]
    body: B,
}

impl<B: AsyncRead + AsyncSeekStart> ThrottledStream<B> {
    pub fn new(body: B, window: ByteWindow, throttle: ThrottleConfig) -> Self {
        ThrottledStream {
            state: StreamState::Seek { start: window.start },
            length: window.len(),
            throttle,
            body,
        }
    }
}

enum StreamState {
    Seek { start: u64 },
    Seeking { remaining: u64 },
    Reading { buffer: BytesMut, remaining: u64 },
    Sleeping { delay: Pin<Box<Sleep>>, remaining: u64 },
    Done,
}

impl<B: AsyncRead + AsyncSeekStart + Send + 'static> IntoResponse for ThrottledStream<B> {
    fn into_response(self) -> Response {
        Response::new(axum::body::Body::new(self))
    }
}

impl<B: AsyncRead + AsyncSeekStart> Body for ThrottledStream<B> {
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.length)
    }

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<io::Result<Frame<Bytes>>>> {
        self.poll_next(cx)
            .map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl<B: AsyncRead + AsyncSeekStart> Stream for ThrottledStream<B> {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        let mut this = self.project();

        loop {
            match this.state {
                StreamState::Seek { start } => {
                    let remaining = *this.length;
                    // seeking to the start of the source is a no-op
                    if *start == 0 {
                        let buffer = allocate_buffer(this.throttle.chunk_bytes);
                        *this.state = StreamState::Reading { buffer, remaining };
                        continue;
                    }
                    match this.body.as_mut().start_seek(*start) {
                        Err(e) => {
                            *this.state = StreamState::Done;
                            return Poll::Ready(Some(Err(e)));
                        }
                        Ok(()) => {
                            *this.state = StreamState::Seeking { remaining };
                        }
                    }
                }

                StreamState::Seeking { remaining } => {
                    match this.body.as_mut().poll_complete(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => {
                            *this.state = StreamState::Done;
                            return Poll::Ready(Some(Err(e)));
                        }
                        Poll::Ready(Ok(())) => {
                            let buffer = allocate_buffer(this.throttle.chunk_bytes);
                            let remaining = *remaining;
                            *this.state = StreamState::Reading { buffer, remaining };
                        }
                    }
                }

                StreamState::Reading { buffer, remaining } => {
                    if *remaining == 0 {
                        *this.state = StreamState::Done;
                        return Poll::Ready(None);
                    }

                    // the allocator may hand back more capacity than asked
                    // for, so cap at chunk_bytes explicitly
                    let chunk_bytes = this.throttle.chunk_bytes.max(1);
                    let uninit = buffer.spare_capacity_mut();

                    // read at most a chunk, and never past the window end
                    let nbytes = std::cmp::min(
                        uninit.len().min(chunk_bytes),
                        usize::try_from(*remaining).unwrap_or(usize::MAX),
                    );

                    let mut read_buf = ReadBuf::uninit(&mut uninit[0..nbytes]);

                    match this.body.as_mut().poll_read(cx, &mut read_buf) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => {
                            *this.state = StreamState::Done;
                            return Poll::Ready(Some(Err(e)));
                        }
                        Poll::Ready(Ok(())) => match read_buf.filled().len() {
                            0 => {
                                // source exhausted before the window was
                                // covered, e.g. the file shrank mid-transfer
                                *this.state = StreamState::Done;
                                return Poll::Ready(None);
                            }
                            n => {
                                // SAFETY: poll_read has filled the buffer
                                // with `n` additional bytes past its length
                                unsafe { buffer.set_len(buffer.len() + n) };

                                // n <= remaining due to the cmp::min above
                                let remaining = *remaining - n as u64;
                                let chunk = mem::take(buffer).freeze();

                                // pacing happens between chunks, never after
                                // the final one
                                *this.state = if remaining > 0 && !this.throttle.delay.is_zero() {
                                    StreamState::Sleeping {
                                        delay: Box::pin(tokio::time::sleep(this.throttle.delay)),
                                        remaining,
                                    }
                                } else {
                                    StreamState::Reading {
                                        buffer: allocate_buffer(this.throttle.chunk_bytes),
                                        remaining,
                                    }
                                };

                                return Poll::Ready(Some(Ok(chunk)));
                            }
                        },
                    }
                }

                StreamState::Sleeping { delay, remaining } => match delay.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(()) => {
                        let buffer = allocate_buffer(this.throttle.chunk_bytes);
                        let remaining = *remaining;
                        *this.state = StreamState::Reading { buffer, remaining };
                    }
                },

                StreamState::Done => return Poll::Ready(None),
            }
        }
    }
}

fn allocate_buffer(chunk_bytes: usize) -> BytesMut {
    BytesMut::with_capacity(chunk_bytes.max(1))
}

/// Copy `window` from `source` into `sink`, paced by `throttle`.
///
/// Flushes after every chunk and polls `is_aborted` once per chunk; a peer
/// disconnect reported through it ends the transfer silently. Returns the
/// number of bytes actually written, which is short of the window length
/// when the source ran out early or the transfer was aborted.
pub async fn stream_range<B, W, F>(
    source: B,
    window: ByteWindow,
    throttle: ThrottleConfig,
    sink: &mut W,
    mut is_aborted: F,
) -> io::Result<u64>
where
    B: AsyncRead + AsyncSeekStart,
    W: AsyncWrite + Unpin,
    F: FnMut() -> bool,
{
    let stream = ThrottledStream::new(source, window, throttle);
    pin_mut!(stream);

    let mut sent: u64 = 0;
    while let Some(chunk) = stream.next().await {
        if is_aborted() {
            tracing::debug!(sent, "peer disconnected, transfer stopped");
            break;
        }
        let chunk = chunk?;
        sink.write_all(&chunk).await?;
        sink.flush().await?;
        sent += chunk.len() as u64;
    }

    Ok(sent)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::time::Duration;

    use futures::{pin_mut, StreamExt};

    use super::{stream_range, ThrottleConfig, ThrottledStream, DEFAULT_CHUNK_BYTES};
    use crate::resolve::ByteWindow;

    fn source(len: usize) -> Cursor<Vec<u8>> {
        Cursor::new((0..len).map(|i| (i % 251) as u8).collect())
    }

    async fn collect_chunks(
        body: Cursor<Vec<u8>>,
        window: ByteWindow,
        throttle: ThrottleConfig,
    ) -> Vec<Vec<u8>> {
        let stream = ThrottledStream::new(body, window, throttle);
        pin_mut!(stream);
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk.unwrap().to_vec());
        }
        chunks
    }

    #[test]
    fn default_throttle_values() {
        let throttle = ThrottleConfig::default();
        assert_eq!(DEFAULT_CHUNK_BYTES, throttle.chunk_bytes);
        assert_eq!(Duration::from_millis(100), throttle.delay);
    }

    #[test]
    fn zero_chunk_size_is_bumped() {
        assert_eq!(1, ThrottleConfig::new(0, Duration::ZERO).chunk_bytes);
    }

    #[tokio::test]
    async fn window_is_copied_exactly() {
        let data = source(1000);
        let expected = data.get_ref()[200..300].to_vec();

        let chunks = collect_chunks(
            data,
            ByteWindow::new(200, 300),
            ThrottleConfig::unthrottled(),
        )
        .await;

        let total: Vec<u8> = chunks.concat();
        assert_eq!(100, total.len());
        assert_eq!(expected, total);
    }

    #[tokio::test]
    async fn chunks_respect_chunk_size() {
        let chunks = collect_chunks(
            source(50),
            ByteWindow::full(50),
            ThrottleConfig::new(20, Duration::ZERO),
        )
        .await;

        let sizes: Vec<usize> = chunks.iter().map(Vec::len).collect();
        assert_eq!(vec![20, 20, 10], sizes);
    }

    #[tokio::test]
    async fn never_reads_past_source_end() {
        // window longer than the source: stop at EOF, no error
        let chunks = collect_chunks(
            source(30),
            ByteWindow::full(100),
            ThrottleConfig::unthrottled(),
        )
        .await;

        assert_eq!(30, chunks.concat().len());
    }

    #[tokio::test]
    async fn empty_window_yields_nothing() {
        let chunks = collect_chunks(
            source(30),
            ByteWindow::new(0, 0),
            ThrottleConfig::unthrottled(),
        )
        .await;
        assert!(chunks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pacing_sleeps_between_chunks_only() {
        let begin = tokio::time::Instant::now();
        let chunks = collect_chunks(
            source(50),
            ByteWindow::full(50),
            ThrottleConfig::new(20, Duration::from_millis(100)),
        )
        .await;

        assert_eq!(3, chunks.len());
        // three chunks, two suspensions: no sleep before the first chunk or
        // after the last
        let elapsed = begin.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(300), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn stream_range_writes_window_to_sink() {
        let data = source(1000);
        let expected = data.get_ref()[200..300].to_vec();

        let mut sink: Vec<u8> = Vec::new();
        let sent = stream_range(
            data,
            ByteWindow::new(200, 300),
            ThrottleConfig::unthrottled(),
            &mut sink,
            || false,
        )
        .await
        .unwrap();

        assert_eq!(100, sent);
        assert_eq!(expected, sink);
    }

    #[tokio::test]
    async fn stream_range_sends_whole_file_without_window_limit() {
        let data = source(500);
        let all = data.get_ref().clone();

        let mut sink: Vec<u8> = Vec::new();
        let sent = stream_range(
            data,
            ByteWindow::full(500),
            ThrottleConfig::unthrottled(),
            &mut sink,
            || false,
        )
        .await
        .unwrap();

        assert_eq!(500, sent);
        assert_eq!(all, sink);
    }

    #[tokio::test]
    async fn abort_stops_within_one_chunk() {
        let mut polls = 0;
        let mut sink: Vec<u8> = Vec::new();

        let sent = stream_range(
            source(100),
            ByteWindow::full(100),
            ThrottleConfig::new(10, Duration::ZERO),
            &mut sink,
            || {
                polls += 1;
                polls > 3
            },
        )
        .await
        .unwrap();

        // three chunks went out before the abort was observed; no error
        assert_eq!(30, sent);
        assert_eq!(30, sink.len());
    }
}
