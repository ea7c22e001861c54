//! Bounded, truncation-aware body capture
//!
//! `CaptureBuffer` wraps any readable body, forwarding every byte unchanged
//! to the consumer while mirroring the first `MAX_BODY_CAPTURE` bytes into
//! an in-memory buffer. It never alters the delivered byte sequence and
//! preserves EOF signaling exactly.

use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, ReadBuf};

use crate::record::MAX_BODY_CAPTURE;

/// Accumulates a bounded prefix of a streaming body.
#[derive(Debug)]
pub struct BodyCapture {
    buf: Vec<u8>,
    truncated: bool,
    cap: usize,
}

impl BodyCapture {
    pub fn new() -> Self {
        Self::with_cap(MAX_BODY_CAPTURE)
    }

    pub fn with_cap(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            truncated: false,
            cap,
        }
    }

    /// Mirror a chunk that is being forwarded downstream. Bytes past the cap
    /// are counted only toward the truncation flag.
    pub fn push(&mut self, chunk: &[u8]) {
        if chunk.is_empty() {
            return;
        }
        let room = self.cap.saturating_sub(self.buf.len());
        if chunk.len() > room {
            self.truncated = true;
        }
        if room > 0 {
            self.buf.extend_from_slice(&chunk[..room.min(chunk.len())]);
        }
    }

    pub fn into_parts(self) -> (Vec<u8>, bool) {
        (self.buf, self.truncated)
    }
}

impl Default for BodyCapture {
    fn default() -> Self {
        Self::new()
    }
}

/// `AsyncRead` tee over a body source.
#[derive(Debug)]
pub struct CaptureBuffer<R> {
    inner: R,
    capture: BodyCapture,
}

impl<R: AsyncRead + Unpin> CaptureBuffer<R> {
    pub fn new(inner: R) -> Self {
        Self::with_capture(inner, BodyCapture::new())
    }

    pub fn with_capture(inner: R, capture: BodyCapture) -> Self {
        Self { inner, capture }
    }

    /// `(captured_bytes, truncated_flag)` once the stream has been drained.
    pub fn into_parts(self) -> (Vec<u8>, bool) {
        self.capture.into_parts()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for CaptureBuffer<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut me.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let filled = &buf.filled()[before..];
                me.capture.push(filled);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}
