//! Replayable body buffering
//!
//! HTTP bodies are single-pass. Verification has to read the body before the
//! handler does, so the body is mirrored into a [`SpillBuffer`] while it is
//! read and served from that buffer afterwards. Memory use is bounded by an
//! optional limit and by spilling to a temporary file past a threshold.

use std::env;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt, ReadBuf};

use crate::{errors::JwsDetachedError, DEFAULT_FILE_BUFFER_THRESHOLD, Result, TEMP_DIR_ENV};

mod reader;
mod spill;
mod writer;

pub use reader::BufferingReader;
pub use spill::SpillBuffer;
pub use writer::{BufferingWriter, TeeWriter};

/// A configured buffer ceiling was hit
///
/// Travels inside [`io::Error`] so it can cross `AsyncRead`/`AsyncWrite`
/// boundaries; recover it with [`BufferLimitError::from_io`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferLimitError {
    /// Reading (request side) went past the limit
    #[error("read buffer limit of {limit} bytes exceeded")]
    Read {
        /// Configured ceiling in bytes
        limit: u64,
    },

    /// Writing (response side) went past the limit
    #[error("write buffer limit of {limit} bytes exceeded")]
    Write {
        /// Configured ceiling in bytes
        limit: u64,
    },
}

impl BufferLimitError {
    /// Find a buffer limit error wrapped in `err`
    pub fn from_io(err: &io::Error) -> Option<Self> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<Self>())
            .copied()
    }
}

impl From<BufferLimitError> for io::Error {
    fn from(err: BufferLimitError) -> Self {
        io::Error::other(err)
    }
}

/// How a body is made replayable
///
/// Deserializes from `{"mode": "memory", "limit": 1048576}` and friends. A
/// missing mode selects the file-backed default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum BufferingPolicy {
    /// No buffering; the body stays single-pass
    Disabled,

    /// Growable in-memory buffer
    Memory {
        /// Maximum number of buffered bytes
        #[serde(default)]
        limit: Option<u64>,
    },

    /// In-memory buffer that spills to a temporary file
    File {
        /// Bytes kept in memory before spilling (defaults to 30 KiB)
        #[serde(default)]
        threshold: Option<usize>,

        /// Maximum number of buffered bytes
        #[serde(default)]
        limit: Option<u64>,

        /// Directory for the temporary file
        #[serde(default)]
        temp_dir: Option<PathBuf>,
    },
}

impl Default for BufferingPolicy {
    fn default() -> Self {
        Self::file()
    }
}

impl BufferingPolicy {
    /// Unlimited in-memory buffering
    pub fn memory() -> Self {
        Self::Memory { limit: None }
    }

    /// File-backed buffering with the default threshold
    pub fn file() -> Self {
        Self::File {
            threshold: None,
            limit: None,
            temp_dir: None,
        }
    }

    /// Set the byte limit (ignored for [`BufferingPolicy::Disabled`])
    pub fn with_limit(mut self, bytes: u64) -> Self {
        match &mut self {
            Self::Memory { limit } | Self::File { limit, .. } => *limit = Some(bytes),
            Self::Disabled => {}
        }
        self
    }

    /// Set the spill threshold (file mode only)
    pub fn with_threshold(mut self, bytes: usize) -> Self {
        if let Self::File { threshold, .. } = &mut self {
            *threshold = Some(bytes);
        }
        self
    }

    /// Set the temporary directory (file mode only)
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        if let Self::File { temp_dir, .. } = &mut self {
            *temp_dir = Some(dir.into());
        }
        self
    }

    /// Configured byte limit
    pub fn limit(&self) -> Option<u64> {
        match self {
            Self::Memory { limit } | Self::File { limit, .. } => *limit,
            Self::Disabled => None,
        }
    }

    /// Whether buffering is off
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }

    /// Check the policy before it is used for the first time
    pub fn validate(&self) -> Result<()> {
        if let Self::File {
            threshold: Some(0), ..
        } = self
        {
            return Err(JwsDetachedError::ConfigurationError {
                reason: "file buffering threshold must be greater than zero".to_string(),
            });
        }

        if let Self::File {
            temp_dir: Some(dir),
            ..
        } = self
            && !dir.is_dir()
        {
            return Err(JwsDetachedError::ConfigurationError {
                reason: format!("temporary directory {} does not exist", dir.display()),
            });
        }

        Ok(())
    }

    /// Fresh, empty buffer for one body
    pub fn new_buffer(&self) -> SpillBuffer {
        match self {
            Self::File {
                threshold,
                temp_dir,
                ..
            } => SpillBuffer::with_threshold(
                threshold.unwrap_or(DEFAULT_FILE_BUFFER_THRESHOLD),
                temp_dir.clone(),
            ),
            Self::Memory { .. } | Self::Disabled => SpillBuffer::memory(),
        }
    }
}

/// Resolve the directory for spilled buffers.
///
/// Uses `configured` if given, else `$JWS_DETACHED_TEMP`, else the OS temp
/// directory. The directory must already exist.
pub fn temp_directory(configured: Option<&Path>) -> io::Result<PathBuf> {
    let dir = match configured {
        Some(dir) => dir.to_path_buf(),
        None => env::var_os(TEMP_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir),
    };

    if !dir.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("temporary directory {} does not exist", dir.display()),
        ));
    }
    Ok(dir)
}

/// Readable and seekable
pub trait SeekableRead: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> SeekableRead for T {}

/// A body as handed to [`make_seekable`]
pub enum BodyStream {
    /// Already supports rewinding
    Seekable(Box<dyn SeekableRead>),

    /// Single-pass stream
    Sequential(Box<dyn AsyncRead + Send + Unpin>),
}

impl BodyStream {
    /// Wrap a stream that can already seek
    pub fn seekable(stream: impl SeekableRead + 'static) -> Self {
        Self::Seekable(Box::new(stream))
    }

    /// Wrap a single-pass stream
    pub fn sequential(stream: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::Sequential(Box::new(stream))
    }
}

impl std::fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Seekable(_) => f.write_str("BodyStream::Seekable"),
            Self::Sequential(_) => f.write_str("BodyStream::Sequential"),
        }
    }
}

/// Make `stream` replayable according to `policy`.
///
/// A stream that can already seek is returned untouched; no read goes through
/// a wrapper. Nothing is read here; mirroring happens as the result is read.
pub fn make_seekable(stream: BodyStream, policy: &BufferingPolicy) -> SeekableBody {
    match stream {
        BodyStream::Seekable(stream) => SeekableBody::PassThrough(stream),
        BodyStream::Sequential(stream) if policy.is_disabled() => SeekableBody::Unbuffered(stream),
        BodyStream::Sequential(stream) => {
            tracing::trace!(?policy, "Buffering body");
            SeekableBody::Buffered(BufferingReader::new(
                stream,
                policy.new_buffer(),
                policy.limit(),
            ))
        }
    }
}

/// Result of [`make_seekable`]
///
/// Owns the buffer. Dropping it deletes any temporary file; [`release`]
/// does the same and reports errors.
///
/// [`release`]: SeekableBody::release
pub enum SeekableBody {
    /// The original seekable stream
    PassThrough(Box<dyn SeekableRead>),

    /// Mirrored into a buffer, seekable once fully read
    Buffered(BufferingReader<Box<dyn AsyncRead + Send + Unpin>>),

    /// Buffering disabled; seeking always fails
    Unbuffered(Box<dyn AsyncRead + Send + Unpin>),
}

impl SeekableBody {
    /// Whether the original stream was returned unchanged
    pub fn is_pass_through(&self) -> bool {
        matches!(self, Self::PassThrough(_))
    }

    /// Whether the body can be rewound at some point
    pub fn is_replayable(&self) -> bool {
        !matches!(self, Self::Unbuffered(_))
    }

    /// Position to come back to after verification.
    ///
    /// Buffered bodies report it without seeking, which they cannot do yet.
    pub async fn position(&mut self) -> io::Result<u64> {
        match self {
            Self::PassThrough(stream) => stream.stream_position().await,
            Self::Buffered(reader) => Ok(reader.position()),
            Self::Unbuffered(_) => Err(not_seekable()),
        }
    }

    /// Seek back to a position obtained from [`position`](Self::position)
    pub async fn restore(&mut self, position: u64) -> io::Result<()> {
        self.seek(SeekFrom::Start(position)).await.map(drop)
    }

    /// Dispose of the buffer, deleting any temporary file
    pub async fn release(self) -> io::Result<()> {
        match self {
            Self::Buffered(reader) => reader.into_buffer().release().await,
            Self::PassThrough(_) | Self::Unbuffered(_) => Ok(()),
        }
    }
}

impl std::fmt::Debug for SeekableBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PassThrough(_) => f.write_str("SeekableBody::PassThrough"),
            Self::Buffered(reader) => f.debug_tuple("SeekableBody::Buffered").field(reader).finish(),
            Self::Unbuffered(_) => f.write_str("SeekableBody::Unbuffered"),
        }
    }
}

fn not_seekable() -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, "body buffering is disabled")
}

impl AsyncRead for SeekableBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::PassThrough(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Buffered(reader) => Pin::new(reader).poll_read(cx, buf),
            Self::Unbuffered(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncSeek for SeekableBody {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        match self.get_mut() {
            Self::PassThrough(stream) => Pin::new(stream).start_seek(position),
            Self::Buffered(reader) => Pin::new(reader).start_seek(position),
            Self::Unbuffered(_) => Err(not_seekable()),
        }
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        match self.get_mut() {
            Self::PassThrough(stream) => Pin::new(stream).poll_complete(cx),
            Self::Buffered(reader) => Pin::new(reader).poll_complete(cx),
            Self::Unbuffered(_) => Poll::Ready(Err(not_seekable())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    /// Seekable stream that counts reads
    struct CountingCursor {
        inner: Cursor<Vec<u8>>,
        reads: Arc<AtomicUsize>,
    }

    impl AsyncRead for CountingCursor {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl AsyncSeek for CountingCursor {
        fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
            Pin::new(&mut self.inner).start_seek(position)
        }

        fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
            Pin::new(&mut self.inner).poll_complete(cx)
        }
    }

    #[tokio::test]
    async fn test_seekable_stream_passes_through() {
        let reads = Arc::new(AtomicUsize::new(0));
        let stream = CountingCursor {
            inner: Cursor::new(b"payload".to_vec()),
            reads: Arc::clone(&reads),
        };

        let mut body = make_seekable(BodyStream::seekable(stream), &BufferingPolicy::memory());
        assert!(body.is_pass_through());
        assert_eq!(reads.load(Ordering::SeqCst), 0);

        let mut out = String::new();
        body.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "payload");
        body.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_sequential_stream_replays_after_full_read() {
        let mut body = make_seekable(
            BodyStream::sequential(&b"Request body"[..]),
            &BufferingPolicy::memory(),
        );
        assert!(!body.is_pass_through());

        let mut first = Vec::new();
        body.read_to_end(&mut first).await.unwrap();
        body.seek(SeekFrom::Start(0)).await.unwrap();
        let mut second = Vec::new();
        body.read_to_end(&mut second).await.unwrap();

        assert_eq!(first, b"Request body");
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_disabled_policy_is_single_pass() {
        let mut body = make_seekable(
            BodyStream::sequential(&b"once"[..]),
            &BufferingPolicy::Disabled,
        );
        assert!(!body.is_replayable());

        let err = body.seek(SeekFrom::Start(0)).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[tokio::test]
    async fn test_read_limit_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let policy = BufferingPolicy::file()
            .with_threshold(4)
            .with_limit(8)
            .with_temp_dir(dir.path());

        // the first chunk spills, the second one crosses the limit
        let source = (&[7u8; 6][..]).chain(&[7u8; 58][..]);
        let mut body = make_seekable(BodyStream::sequential(source), &policy);
        let err = body.read_to_end(&mut Vec::new()).await.unwrap_err();
        assert_eq!(
            BufferLimitError::from_io(&err),
            Some(BufferLimitError::Read { limit: 8 })
        );

        body.release().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_policy_serde() {
        let policy: BufferingPolicy = serde_json::from_str(r#"{"mode":"memory","limit":10}"#).unwrap();
        assert_eq!(policy, BufferingPolicy::memory().with_limit(10));

        let policy: BufferingPolicy = serde_json::from_str(r#"{"mode":"file"}"#).unwrap();
        assert_eq!(policy, BufferingPolicy::default());

        let policy: BufferingPolicy = serde_json::from_str(r#"{"mode":"disabled"}"#).unwrap();
        assert!(policy.is_disabled());
        assert_eq!(policy.with_limit(5).limit(), None);
    }

    #[test]
    fn test_policy_validation() {
        assert!(BufferingPolicy::file().with_threshold(0).validate().is_err());
        assert!(
            BufferingPolicy::file()
                .with_temp_dir("/definitely/not/a/dir")
                .validate()
                .is_err()
        );
        assert!(BufferingPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_temp_directory_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(temp_directory(Some(dir.path())).unwrap(), dir.path());

        let err = temp_directory(Some(Path::new("/definitely/not/a/dir"))).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
