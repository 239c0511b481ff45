//! Read-through mirroring stream

use std::fmt;
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, ReadBuf};

use super::{BufferLimitError, SpillBuffer};
use crate::PAYLOAD_CHUNK_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Pulling from the source, mirroring every chunk
    Streaming,
    /// Source exhausted, flushing the buffer
    Flushing,
    /// Served from the buffer; seeking allowed
    Buffered,
    Failed,
}

/// Stream that copies everything it reads into a [`SpillBuffer`]
///
/// Until the source is exhausted each chunk is written to the buffer before
/// it is handed to the caller, and seeking fails. Once fully buffered, reads
/// and seeks are served from the buffer only.
pub struct BufferingReader<R> {
    source: R,
    buffer: SpillBuffer,
    limit: Option<u64>,
    chunk: Box<[u8]>,
    filled: usize,
    mirrored: usize,
    delivered: usize,
    pulled: u64,
    position: u64,
    phase: Phase,
}

impl<R> BufferingReader<R> {
    /// Mirror `source` into `buffer`, failing once more than `limit` bytes arrive
    pub fn new(source: R, buffer: SpillBuffer, limit: Option<u64>) -> Self {
        Self {
            source,
            buffer,
            limit,
            chunk: vec![0; PAYLOAD_CHUNK_SIZE].into_boxed_slice(),
            filled: 0,
            mirrored: 0,
            delivered: 0,
            pulled: 0,
            position: 0,
            phase: Phase::Streaming,
        }
    }

    /// Whether the source has been read to the end
    pub fn is_fully_buffered(&self) -> bool {
        self.phase == Phase::Buffered
    }

    /// Position of the next byte handed to the caller
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Bytes pulled from the source so far
    pub fn bytes_buffered(&self) -> u64 {
        self.pulled
    }

    /// Give up the source and keep the buffer
    pub fn into_buffer(self) -> SpillBuffer {
        self.buffer
    }
}

impl<R: AsyncRead + Unpin> BufferingReader<R> {
    fn poll_stream(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            while self.mirrored < self.filled {
                let chunk = &self.chunk[self.mirrored..self.filled];
                let written = match ready!(Pin::new(&mut self.buffer).poll_write(cx, chunk)) {
                    Ok(0) => Err(io::ErrorKind::WriteZero.into()),
                    other => other,
                };
                match written {
                    Ok(n) => self.mirrored += n,
                    Err(e) => {
                        self.phase = Phase::Failed;
                        return Poll::Ready(Err(e));
                    }
                }
            }

            if self.delivered < self.filled {
                let n = buf.remaining().min(self.filled - self.delivered);
                buf.put_slice(&self.chunk[self.delivered..self.delivered + n]);
                self.delivered += n;
                self.position += n as u64;
                return Poll::Ready(Ok(()));
            }

            self.filled = 0;
            self.mirrored = 0;
            self.delivered = 0;

            let mut scratch = ReadBuf::new(&mut self.chunk);
            if let Err(e) = ready!(Pin::new(&mut self.source).poll_read(cx, &mut scratch)) {
                self.phase = Phase::Failed;
                return Poll::Ready(Err(e));
            }
            let n = scratch.filled().len();

            if n == 0 {
                self.phase = Phase::Flushing;
                return self.poll_flushing(cx);
            }

            self.pulled += n as u64;
            if let Some(limit) = self.limit
                && self.pulled > limit
            {
                tracing::debug!(limit, "Request body exceeds the buffering limit");
                self.phase = Phase::Failed;
                return Poll::Ready(Err(BufferLimitError::Read { limit }.into()));
            }
            self.filled = n;
        }
    }

    fn poll_flushing(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Err(e) = ready!(Pin::new(&mut self.buffer).poll_flush(cx)) {
            self.phase = Phase::Failed;
            return Poll::Ready(Err(e));
        }
        tracing::trace!(bytes = self.pulled, "Body fully buffered");
        self.phase = Phase::Buffered;
        Poll::Ready(Ok(()))
    }
}

fn failed() -> io::Error {
    io::Error::other("buffering stream failed earlier")
}

impl<R: AsyncRead + Unpin> AsyncRead for BufferingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.phase {
            Phase::Streaming => this.poll_stream(cx, buf),
            Phase::Flushing => this.poll_flushing(cx),
            Phase::Buffered => {
                let before = buf.filled().len();
                ready!(Pin::new(&mut this.buffer).poll_read(cx, buf))?;
                this.position += (buf.filled().len() - before) as u64;
                Poll::Ready(Ok(()))
            }
            Phase::Failed => Poll::Ready(Err(failed())),
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncSeek for BufferingReader<R> {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        match this.phase {
            Phase::Buffered => Pin::new(&mut this.buffer).start_seek(position),
            Phase::Streaming | Phase::Flushing => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "cannot seek before the body is fully buffered",
            )),
            Phase::Failed => Err(failed()),
        }
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        let this = self.get_mut();
        if this.phase != Phase::Buffered {
            return Poll::Ready(Ok(this.position));
        }
        let position = ready!(Pin::new(&mut this.buffer).poll_complete(cx))?;
        this.position = position;
        Poll::Ready(Ok(position))
    }
}

impl<R> fmt::Debug for BufferingReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferingReader")
            .field("phase", &self.phase)
            .field("limit", &self.limit)
            .field("pulled", &self.pulled)
            .field("position", &self.position)
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}
