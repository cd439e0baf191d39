//! Fixed-size chunking of file contents.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Default number of bytes sent per chunk.
pub const CHUNK_SIZE: usize = 1024;

/// Reads a source in chunks of a fixed size.
///
/// Every chunk except the last one is exactly `chunk_size` bytes long, no
/// matter how the source splits its reads. An empty source yields no chunks.
#[derive(Debug)]
pub struct ChunkReader<R> {
    inner: R,
    buf: Vec<u8>,
    done: bool,
}

impl<R: AsyncRead + Unpin> ChunkReader<R> {
    /// Chunk `inner` using [`CHUNK_SIZE`].
    pub fn new(inner: R) -> Self {
        Self::with_chunk_size(inner, CHUNK_SIZE)
    }

    /// Chunk `inner` using a custom chunk size (at least one byte).
    pub fn with_chunk_size(inner: R, chunk_size: usize) -> Self {
        Self {
            inner,
            buf: vec![0; chunk_size.max(1)],
            done: false,
        }
    }

    /// Size of a full chunk.
    pub fn chunk_size(&self) -> usize {
        self.buf.len()
    }

    /// Read the next chunk, or `None` at end of input.
    pub async fn next_chunk(&mut self) -> io::Result<Option<&[u8]>> {
        if self.done {
            return Ok(None);
        }

        let mut filled = 0;
        while filled < self.buf.len() {
            match self.inner.read(&mut self.buf[filled..]).await {
                Ok(0) => {
                    self.done = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if filled == 0 {
            Ok(None)
        } else {
            Ok(Some(&self.buf[..filled]))
        }
    }

    /// Recover the underlying reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn chunk_sizes<R: AsyncRead + Unpin>(mut reader: ChunkReader<R>) -> Vec<usize> {
        let mut sizes = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            sizes.push(chunk.len());
        }
        sizes
    }

    #[tokio::test]
    async fn test_2500_bytes_make_three_chunks() {
        let data = vec![7u8; 2500];
        let sizes = chunk_sizes(ChunkReader::new(&data[..])).await;
        assert_eq!(sizes, vec![1024, 1024, 452]);
    }

    #[tokio::test]
    async fn test_exact_multiple() {
        let data = vec![0u8; 2048];
        let sizes = chunk_sizes(ChunkReader::new(&data[..])).await;
        assert_eq!(sizes, vec![1024, 1024]);
    }

    #[tokio::test]
    async fn test_empty_source_yields_nothing() {
        let data: Vec<u8> = Vec::new();
        let sizes = chunk_sizes(ChunkReader::new(&data[..])).await;
        assert!(sizes.is_empty());
    }

    #[tokio::test]
    async fn test_short_reads_are_coalesced() {
        let (mut writer, reader) = tokio::io::duplex(7);
        let feed = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for _ in 0..10 {
                writer.write_all(&[1u8; 5]).await.unwrap();
            }
        });

        let sizes = chunk_sizes(ChunkReader::with_chunk_size(reader, 16)).await;
        feed.await.unwrap();
        assert_eq!(sizes, vec![16, 16, 16, 2]);
    }

    #[tokio::test]
    async fn test_contents_preserved() {
        let data: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = ChunkReader::new(&data[..]);
        let mut out = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            out.extend_from_slice(chunk);
        }
        assert_eq!(out, data);
    }

    #[test]
    fn test_zero_chunk_size_clamped() {
        let reader = ChunkReader::with_chunk_size(&b""[..], 0);
        assert_eq!(reader.chunk_size(), 1);
    }
}
