use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::io::{self, SeekFrom};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

/// The byte source a connection pumps an rrq transfer from.
///
/// `chunk` is a positioned read: at most `max_len` bytes starting at
///  `offset`. A return shorter than `max_len` (possibly empty) means the
///  source is exhausted at that point and marks the final block of the
///  transfer. Streaming assets implement this directly; seekable readers go
///  through [`FileSource`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChunkSource: Send + Sync + 'static {
    async fn chunk(&mut self, offset: u64, max_len: usize) -> io::Result<Vec<u8>>;
}

/// The byte sink a connection pumps a wrq transfer into. Blocks arrive in
///  order, each exactly once.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChunkSink: Send + Sync + 'static {
    async fn append(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Adapts any seekable reader (typically `tokio::fs::File`) to
///  [`ChunkSource`].
pub struct FileSource<R> {
    inner: R,
}

impl<R> FileSource<R> {
    pub fn new(inner: R) -> FileSource<R> {
        FileSource { inner }
    }
}

#[async_trait]
impl<R> ChunkSource for FileSource<R>
where
    R: AsyncRead + AsyncSeek + Unpin + Send + Sync + 'static,
{
    async fn chunk(&mut self, offset: u64, max_len: usize) -> io::Result<Vec<u8>> {
        self.inner.seek(SeekFrom::Start(offset)).await?;

        // a single read may return short of max_len well before EOF, and a
        //  short chunk terminates the transfer, so fill until EOF or full
        let mut buf = vec![0u8; max_len];
        let mut filled = 0;
        while filled < max_len {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

/// Adapts any writer (typically `tokio::fs::File`) to [`ChunkSink`].
pub struct FileSink<W> {
    inner: W,
}

impl<W> FileSink<W> {
    pub fn new(inner: W) -> FileSink<W> {
        FileSink { inner }
    }
}

#[async_trait]
impl<W> ChunkSink for FileSink<W>
where
    W: AsyncWrite + Unpin + Send + Sync + 'static,
{
    async fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.inner.write_all(data).await
    }
}
