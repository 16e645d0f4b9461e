// SPDX-License-Identifier: MIT OR Apache-2.0
//! Single-pass input sources fed to a child's stdin.

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

const READER_CHUNK: usize = 64 * 1024;

/// A finite, single-pass sequence of bytes, such as a request body or a
/// fetched upstream object.
///
/// The engine consumes a source exactly once and drops it afterwards, which
/// closes whatever connection or file backs it.
pub struct ByteSource {
    chunks: BoxStream<'static, io::Result<Bytes>>,
    len: Option<u64>,
    in_memory: bool,
}

impl ByteSource {
    /// A source over an in-memory payload.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let len = bytes.len() as u64;
        let chunks = if bytes.is_empty() {
            stream::empty().boxed()
        } else {
            stream::once(async move { Ok(bytes) }).boxed()
        };
        Self {
            chunks,
            len: Some(len),
            in_memory: true,
        }
    }

    /// A source over a stream of chunks of unknown total length.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            chunks: stream.boxed(),
            len: None,
            in_memory: false,
        }
    }

    /// A source that reads `reader` to EOF in fixed-size chunks.
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let chunks = stream::try_unfold(reader, |mut reader| async move {
            let mut buf = vec![0u8; READER_CHUNK];
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                return Ok(None);
            }
            buf.truncate(n);
            Ok::<_, io::Error>(Some((Bytes::from(buf), reader)))
        });
        Self::from_stream(chunks)
    }

    /// Attach a known total length (e.g. from `content-length`).
    pub fn with_len(mut self, len: u64) -> Self {
        self.len = Some(len);
        self
    }

    /// Total length, when known up front.
    pub fn len_hint(&self) -> Option<u64> {
        self.len
    }

    /// `true` when the whole payload already sits in memory.
    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    /// Next chunk, or `None` once the source is exhausted.
    pub async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        self.chunks.next().await
    }
}

impl fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteSource")
            .field("len", &self.len)
            .field("in_memory", &self.in_memory)
            .finish_non_exhaustive()
    }
}

impl From<Bytes> for ByteSource {
    fn from(bytes: Bytes) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<Vec<u8>> for ByteSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut source: ByteSource) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = source.next_chunk().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn bytes_source_reports_length_and_memory() {
        let source = ByteSource::from_bytes("hello");
        assert_eq!(source.len_hint(), Some(5));
        assert!(source.is_in_memory());
        assert_eq!(drain(source).await, b"hello");
    }

    #[tokio::test]
    async fn empty_bytes_source_yields_nothing() {
        let mut source = ByteSource::from_bytes(Bytes::new());
        assert!(source.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn reader_source_reads_to_eof() {
        let data = vec![7u8; READER_CHUNK * 2 + 13];
        let source = ByteSource::from_reader(std::io::Cursor::new(data.clone()));
        assert!(!source.is_in_memory());
        assert_eq!(source.len_hint(), None);
        assert_eq!(drain(source).await, data);
    }

    #[tokio::test]
    async fn stream_source_surfaces_errors() {
        let chunks = stream::iter(vec![
            Ok(Bytes::from_static(b"a")),
            Err(io::Error::other("reset")),
        ]);
        let mut source = ByteSource::from_stream(chunks).with_len(10);
        assert_eq!(source.len_hint(), Some(10));
        assert!(source.next_chunk().await.unwrap().is_ok());
        assert!(source.next_chunk().await.unwrap().is_err());
    }
}
