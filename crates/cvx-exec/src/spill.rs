// SPDX-License-Identifier: MIT OR Apache-2.0
//! Memory-then-disk accumulator for drained process output.

use bytes::Bytes;
use std::io::{self, SeekFrom};
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;

/// Default in-memory ceiling before output moves to disk (8 MiB).
pub const DEFAULT_SPILL_THRESHOLD: usize = 8 * 1024 * 1024;

/// Unbounded byte sink that keeps the first `threshold` bytes in memory and
/// moves everything to an anonymous temp file once that is exceeded.
///
/// The temp file has no name on disk; it disappears when the buffer (or the
/// [`SpillReader`] made from it) is dropped.
#[derive(Debug)]
pub struct SpillBuffer {
    threshold: usize,
    dir: Option<PathBuf>,
    memory: Vec<u8>,
    file: Option<File>,
    len: u64,
}

impl SpillBuffer {
    /// Create a buffer that spills after `threshold` bytes.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            dir: None,
            memory: Vec::new(),
            file: None,
            len: 0,
        }
    }

    /// Create spill files in `dir` instead of the system temp dir.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Total bytes written so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// `true` if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `true` once the contents live on disk.
    pub fn is_spilled(&self) -> bool {
        self.file.is_some()
    }

    /// Append `chunk`, spilling to disk first if it would cross the threshold.
    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        if self.file.is_none() && self.memory.len() + chunk.len() > self.threshold {
            self.spill().await?;
        }
        match self.file.as_mut() {
            Some(file) => file.write_all(chunk).await?,
            None => self.memory.extend_from_slice(chunk),
        }
        self.len += chunk.len() as u64;
        Ok(())
    }

    async fn spill(&mut self) -> io::Result<()> {
        let file = match &self.dir {
            Some(dir) => tempfile::tempfile_in(dir)?,
            None => tempfile::tempfile()?,
        };
        let mut file = File::from_std(file);
        file.write_all(&self.memory).await?;
        debug!(
            target: "cvx.exec",
            in_memory = self.memory.len(),
            threshold = self.threshold,
            "spilling output buffer to disk"
        );
        self.memory = Vec::new();
        self.file = Some(file);
        Ok(())
    }

    /// Finish writing and rewind for replay.
    pub async fn into_reader(self) -> io::Result<SpillReader> {
        let inner = match self.file {
            Some(mut file) => {
                file.flush().await?;
                file.seek(SeekFrom::Start(0)).await?;
                Backing::Disk(file)
            }
            None => Backing::Memory(Bytes::from(self.memory)),
        };
        Ok(SpillReader {
            inner,
            remaining: self.len,
        })
    }
}

#[derive(Debug)]
enum Backing {
    Memory(Bytes),
    Disk(File),
}

/// Replays the contents of a [`SpillBuffer`] front to back, once.
#[derive(Debug)]
pub struct SpillReader {
    inner: Backing,
    remaining: u64,
}

impl SpillReader {
    /// Bytes not yet returned.
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Read up to `max` bytes; `None` at the end.
    pub async fn read_chunk(&mut self, max: usize) -> io::Result<Option<Bytes>> {
        let want = (max as u64).min(self.remaining) as usize;
        if want == 0 {
            return Ok(None);
        }
        let chunk = match &mut self.inner {
            Backing::Memory(bytes) => bytes.split_to(want),
            Backing::Disk(file) => {
                // Full chunks only; a short file surfaces as UnexpectedEof.
                let mut buf = vec![0u8; want];
                file.read_exact(&mut buf).await?;
                Bytes::from(buf)
            }
        };
        self.remaining -= chunk.len() as u64;
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn replay(buffer: SpillBuffer, chunk: usize) -> Vec<u8> {
        let mut reader = buffer.into_reader().await.unwrap();
        let mut out = Vec::new();
        while let Some(bytes) = reader.read_chunk(chunk).await.unwrap() {
            assert!(bytes.len() <= chunk);
            out.extend_from_slice(&bytes);
        }
        assert_eq!(reader.remaining(), 0);
        out
    }

    #[tokio::test]
    async fn stays_in_memory_below_threshold() {
        let mut buf = SpillBuffer::new(1024);
        buf.write(b"hello ").await.unwrap();
        buf.write(b"world").await.unwrap();
        assert!(!buf.is_spilled());
        assert_eq!(buf.len(), 11);
        assert_eq!(replay(buf, 4).await, b"hello world");
    }

    #[tokio::test]
    async fn spills_when_threshold_crossed() {
        let mut buf = SpillBuffer::new(8);
        buf.write(b"12345").await.unwrap();
        assert!(!buf.is_spilled());
        buf.write(b"6789").await.unwrap();
        assert!(buf.is_spilled());
        buf.write(b"abc").await.unwrap();
        assert_eq!(buf.len(), 12);
        assert_eq!(replay(buf, 5).await, b"123456789abc");
    }

    #[tokio::test]
    async fn zero_threshold_goes_straight_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = SpillBuffer::new(0).with_dir(dir.path());
        buf.write(b"x").await.unwrap();
        assert!(buf.is_spilled());
        assert_eq!(replay(buf, 64).await, b"x");
    }

    #[tokio::test]
    async fn spill_file_has_no_name_in_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut buf = SpillBuffer::new(0).with_dir(dir.path());
        buf.write(&[1u8; 4096]).await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn empty_buffer_replays_nothing() {
        let buf = SpillBuffer::new(16);
        assert!(buf.is_empty());
        let mut reader = buf.into_reader().await.unwrap();
        assert!(reader.read_chunk(16).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn large_payload_round_trips_through_disk() {
        let data: Vec<u8> = (0..3 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        let mut buf = SpillBuffer::new(64 * 1024);
        for piece in data.chunks(10_000) {
            buf.write(piece).await.unwrap();
        }
        assert!(buf.is_spilled());
        assert_eq!(replay(buf, 64 * 1024).await, data);
    }
}
