//! Capturing write streams

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{BufferLimitError, BufferingPolicy, SpillBuffer};

/// Write stream that fills a [`SpillBuffer`] up to a limit
///
/// A write that would cross the limit fails as a whole; nothing of it is
/// buffered.
pub struct BufferingWriter {
    buffer: SpillBuffer,
    limit: Option<u64>,
    written: u64,
}

impl BufferingWriter {
    /// Writer buffering per `policy`
    pub fn new(policy: &BufferingPolicy) -> Self {
        Self::with_buffer(policy.new_buffer(), policy.limit())
    }

    /// Writer over an existing buffer
    pub fn with_buffer(buffer: SpillBuffer, limit: Option<u64>) -> Self {
        Self {
            buffer,
            limit,
            written: 0,
        }
    }

    /// Bytes accepted so far
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush and rewind; the buffer is ready to be read from the start
    pub async fn finish(mut self) -> io::Result<SpillBuffer> {
        self.buffer.flush().await?;
        self.buffer.rewind().await?;
        Ok(self.buffer)
    }

    /// Drop everything captured, deleting any temporary file
    pub async fn release(self) -> io::Result<()> {
        self.buffer.release().await
    }
}

impl fmt::Debug for BufferingWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferingWriter")
            .field("limit", &self.limit)
            .field("written", &self.written)
            .field("buffer", &self.buffer)
            .finish()
    }
}

impl AsyncWrite for BufferingWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if let Some(limit) = this.limit
            && this.written + buf.len() as u64 > limit
        {
            tracing::debug!(limit, "Response body exceeds the buffering limit");
            return Poll::Ready(Err(BufferLimitError::Write { limit }.into()));
        }

        let n = ready!(Pin::new(&mut this.buffer).poll_write(cx, buf))?;
        this.written += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().buffer).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().buffer).poll_shutdown(cx)
    }
}

/// Write stream that forwards to `W` and captures a copy
///
/// Every write lands in the capture buffer first and is then forwarded in
/// full before the call completes, so both sides always hold the same bytes.
/// A write refused by the capture (limit, spill failure) is never forwarded.
///
/// Once captured, a write stays owed to `W` until forwarded. If `W` returns
/// `Pending`, the next call must resubmit a buffer starting with the same
/// bytes; anything else fails with [`io::ErrorKind::InvalidInput`].
pub struct TeeWriter<W> {
    inner: W,
    capture: BufferingWriter,
    pending: Vec<u8>,
    forwarded: usize,
}

impl<W> TeeWriter<W> {
    /// Forward to `inner`, capturing into `capture`
    pub fn new(inner: W, capture: BufferingWriter) -> Self {
        Self {
            inner,
            capture,
            pending: Vec::new(),
            forwarded: 0,
        }
    }

    /// The forwarding destination
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// The forwarding destination
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Bytes captured so far
    pub fn captured(&self) -> u64 {
        self.capture.written()
    }
}

impl<W: AsyncWrite + Unpin> TeeWriter<W> {
    /// Flush both sides and hand back the destination and the rewound capture
    pub async fn finish(mut self) -> io::Result<(W, SpillBuffer)> {
        self.inner.flush().await?;
        let captured = self.capture.finish().await?;
        Ok((self.inner, captured))
    }

    /// Drop the capture, deleting any temporary file
    pub async fn release(self) -> io::Result<()> {
        self.capture.release().await
    }
}

impl<W> fmt::Debug for TeeWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeeWriter")
            .field("capture", &self.capture)
            .field("pending", &(self.pending.len() - self.forwarded))
            .finish_non_exhaustive()
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for TeeWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if !this.pending.is_empty() && !buf.starts_with(&this.pending) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "tee write resumed with a different buffer",
            )));
        }

        if this.pending.is_empty() {
            let n = ready!(Pin::new(&mut this.capture).poll_write(cx, buf))?;
            if n == 0 {
                return Poll::Ready(Ok(0));
            }
            this.pending.extend_from_slice(&buf[..n]);
            this.forwarded = 0;
        }

        while this.forwarded < this.pending.len() {
            let remaining = &this.pending[this.forwarded..];
            let n = ready!(Pin::new(&mut this.inner).poll_write(cx, remaining))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            this.forwarded += n;
        }

        let n = this.pending.len();
        this.pending.clear();
        this.forwarded = 0;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.capture).poll_flush(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.capture).poll_flush(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
