//! Memory buffer that moves to a temporary file past a threshold

use std::fmt;
use std::future::Future;
use std::io::{self, Cursor, SeekFrom};
use std::mem;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures::future::BoxFuture;
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::temp_directory;

const TEMP_FILE_PREFIX: &str = "jws-detached-";

enum Storage {
    Memory(Cursor<Vec<u8>>),
    /// Temp file being created and filled with the memory contents
    Spilling(BoxFuture<'static, io::Result<(File, TempPath)>>),
    File(File),
    Failed,
}

/// Seekable byte buffer backed by memory, then by a temporary file
///
/// The temporary file is created lazily, in the resolved temp directory, the
/// first time a write would grow the buffer beyond the threshold. It is
/// deleted when the buffer is released or dropped.
pub struct SpillBuffer {
    storage: Storage,
    // declared after `storage` so the file handle is closed before deletion
    path: Option<TempPath>,
    threshold: Option<usize>,
    temp_dir: Option<PathBuf>,
    position: u64,
    len: u64,
    seek_started: bool,
}

impl SpillBuffer {
    /// Buffer that never leaves memory
    pub fn memory() -> Self {
        Self::new(None, None)
    }

    /// Buffer that spills once it would hold more than `threshold` bytes
    pub fn with_threshold(threshold: usize, temp_dir: Option<PathBuf>) -> Self {
        Self::new(Some(threshold), temp_dir)
    }

    fn new(threshold: Option<usize>, temp_dir: Option<PathBuf>) -> Self {
        Self {
            storage: Storage::Memory(Cursor::new(Vec::new())),
            path: None,
            threshold,
            temp_dir,
            position: 0,
            len: 0,
            seek_started: false,
        }
    }

    /// Number of bytes held
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether nothing has been written
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current read/write position
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Path of the temporary file, once spilled
    pub fn spill_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Seek back to the start
    pub async fn rewind(&mut self) -> io::Result<()> {
        self.seek(SeekFrom::Start(0)).await.map(drop)
    }

    /// Close the file handle and delete the temporary file
    pub async fn release(mut self) -> io::Result<()> {
        if let Storage::Spilling(spill) = mem::replace(&mut self.storage, Storage::Failed) {
            // wait for the file so it can be deleted here instead of leaking
            if let Ok((file, path)) = spill.await {
                self.storage = Storage::File(file);
                self.path = Some(path);
            }
        }

        if let Storage::File(file) = &mut self.storage {
            file.flush().await?;
        }
        self.storage = Storage::Failed;

        if let Some(path) = self.path.take() {
            tracing::trace!(path = %path.display(), "Deleting spilled buffer");
            path.close()?;
        }
        Ok(())
    }

    fn begin_spill(&mut self) {
        if let Storage::Memory(cursor) = mem::replace(&mut self.storage, Storage::Failed) {
            let position = cursor.position();
            let contents = cursor.into_inner();
            let temp_dir = self.temp_dir.clone();
            self.storage = Storage::Spilling(Box::pin(spill(contents, position, temp_dir)));
        }
    }

    /// Finish a pending spill
    fn poll_settle(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Storage::Spilling(spill) = &mut self.storage {
            match ready!(spill.as_mut().poll(cx)) {
                Ok((file, path)) => {
                    tracing::debug!(
                        path = %path.display(),
                        bytes = self.len,
                        "Spilled body buffer to temporary file"
                    );
                    self.path = Some(path);
                    self.storage = Storage::File(file);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to spill body buffer");
                    self.storage = Storage::Failed;
                    return Poll::Ready(Err(e));
                }
            }
        }

        if matches!(self.storage, Storage::Failed) {
            return Poll::Ready(Err(io::Error::other("buffer is unusable after a failed spill")));
        }
        Poll::Ready(Ok(()))
    }

    fn exceeds_threshold(&self, incoming: usize) -> bool {
        self.threshold
            .is_some_and(|threshold| self.position + incoming as u64 > threshold as u64)
    }
}

async fn spill(
    contents: Vec<u8>,
    position: u64,
    temp_dir: Option<PathBuf>,
) -> io::Result<(File, TempPath)> {
    let (file, path) = tokio::task::spawn_blocking(move || {
        let dir = temp_directory(temp_dir.as_deref())?;
        let file = tempfile::Builder::new()
            .prefix(TEMP_FILE_PREFIX)
            .tempfile_in(dir)?;
        io::Result::Ok(file.into_parts())
    })
    .await
    .map_err(io::Error::other)??;

    let mut file = File::from_std(file);
    file.write_all(&contents).await?;
    file.seek(SeekFrom::Start(position)).await?;
    Ok((file, path))
}

impl fmt::Debug for SpillBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let storage = match self.storage {
            Storage::Memory(_) => "memory",
            Storage::Spilling(_) => "spilling",
            Storage::File(_) => "file",
            Storage::Failed => "failed",
        };
        f.debug_struct("SpillBuffer")
            .field("storage", &storage)
            .field("path", &self.spill_path())
            .field("threshold", &self.threshold)
            .field("position", &self.position)
            .field("len", &self.len)
            .finish()
    }
}

impl AsyncRead for SpillBuffer {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_settle(cx))?;

        let before = buf.filled().len();
        match &mut this.storage {
            Storage::Memory(cursor) => ready!(Pin::new(cursor).poll_read(cx, buf))?,
            Storage::File(file) => ready!(Pin::new(file).poll_read(cx, buf))?,
            Storage::Spilling(_) | Storage::Failed => return Poll::Ready(Ok(())),
        }
        this.position += (buf.filled().len() - before) as u64;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for SpillBuffer {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if matches!(this.storage, Storage::Memory(_)) && this.exceeds_threshold(buf.len()) {
            this.begin_spill();
        }
        ready!(this.poll_settle(cx))?;

        let written = match &mut this.storage {
            Storage::Memory(cursor) => io::Write::write(cursor, buf)?,
            Storage::File(file) => ready!(Pin::new(file).poll_write(cx, buf))?,
            Storage::Spilling(_) | Storage::Failed => 0,
        };
        this.position += written as u64;
        this.len = this.len.max(this.position);
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_settle(cx))?;
        match &mut this.storage {
            Storage::File(file) => Pin::new(file).poll_flush(cx),
            _ => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_settle(cx))?;
        match &mut this.storage {
            Storage::File(file) => Pin::new(file).poll_shutdown(cx),
            _ => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncSeek for SpillBuffer {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        match &mut this.storage {
            Storage::Memory(cursor) => Pin::new(cursor).start_seek(position)?,
            Storage::File(file) => Pin::new(file).start_seek(position)?,
            Storage::Spilling(_) => {
                return Err(io::Error::other(
                    "spill in progress, call poll_complete before start_seek",
                ));
            }
            Storage::Failed => {
                return Err(io::Error::other("buffer is unusable after a failed spill"));
            }
        }
        this.seek_started = true;
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        let this = self.get_mut();
        ready!(this.poll_settle(cx))?;

        let position = match &mut this.storage {
            Storage::Memory(cursor) => ready!(Pin::new(cursor).poll_complete(cx))?,
            Storage::File(file) => {
                let position = ready!(Pin::new(file).poll_complete(cx))?;
                if this.seek_started {
                    position
                } else {
                    this.position
                }
            }
            Storage::Spilling(_) | Storage::Failed => this.position,
        };

        this.seek_started = false;
        this.position = position;
        Poll::Ready(Ok(position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_memory_buffer_round_trip() {
        let mut buffer = SpillBuffer::memory();
        buffer.write_all(b"hello ").await.unwrap();
        buffer.write_all(b"world").await.unwrap();
        assert_eq!(buffer.len(), 11);

        buffer.rewind().await.unwrap();
        let mut out = String::new();
        buffer.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
        assert!(buffer.spill_path().is_none());
    }

    #[tokio::test]
    async fn test_spills_past_threshold_and_deletes_on_release() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = SpillBuffer::with_threshold(4, Some(dir.path().to_path_buf()));

        buffer.write_all(b"abc").await.unwrap();
        assert!(buffer.spill_path().is_none());

        buffer.write_all(b"defgh").await.unwrap();
        buffer.flush().await.unwrap();
        let path = buffer.spill_path().unwrap().to_path_buf();
        assert!(path.starts_with(dir.path()));
        assert!(path.exists());

        buffer.seek(SeekFrom::Start(2)).await.unwrap();
        let mut out = Vec::new();
        buffer.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"cdefgh");
        assert_eq!(buffer.position(), 8);

        buffer.release().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_drop_deletes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = SpillBuffer::with_threshold(1, Some(dir.path().to_path_buf()));
        buffer.write_all(b"spilled").await.unwrap();
        buffer.flush().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        drop(buffer);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_missing_temp_dir_fails_write() {
        let missing = PathBuf::from("/definitely/not/a/dir");
        let mut buffer = SpillBuffer::with_threshold(1, Some(missing));
        let err = buffer.write_all(b"too big").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        // the buffer stays failed
        assert!(buffer.write_all(b"x").await.is_err());
        buffer.release().await.unwrap();
    }
}
