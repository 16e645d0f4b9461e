// SPDX-License-Identifier: MIT OR Apache-2.0
//! Lazy replay of a successful invocation's output.

use bytes::Bytes;
use futures::stream::{self, Stream};
use tracing::debug;

use crate::error::{ExecError, ExitInfo};
use crate::process::{InvocationState, ProcessHandle};
use crate::spill::SpillReader;

/// Single-pass producer over the stdout of a child that exited zero.
///
/// Emits the spilled output in chunks of the configured size, in the exact
/// order the child wrote it. After the last chunk the process handle is
/// closed; dropping the producer early releases everything as well.
#[derive(Debug)]
pub struct OutputProducer {
    handle: Option<ProcessHandle>,
    reader: Option<SpillReader>,
    chunk_size: usize,
    len: u64,
    exit: ExitInfo,
    state: InvocationState,
}

impl OutputProducer {
    pub(crate) fn new(
        handle: ProcessHandle,
        reader: SpillReader,
        chunk_size: usize,
        exit: ExitInfo,
    ) -> Self {
        Self {
            state: handle.state(),
            handle: Some(handle),
            len: reader.remaining(),
            reader: Some(reader),
            chunk_size: chunk_size.max(1),
            exit,
        }
    }

    /// Total output length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// `true` when the child wrote nothing to stdout.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// How the child exited (always a success).
    pub fn exit(&self) -> ExitInfo {
        self.exit
    }

    /// Lifecycle state of the underlying invocation.
    pub fn state(&self) -> InvocationState {
        self.state
    }

    /// Next output chunk, or `None` once everything has been emitted.
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, ExecError>> {
        let reader = self.reader.as_mut()?;
        match reader.read_chunk(self.chunk_size).await {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.finish(true).await;
                None
            }
            Err(err) => {
                self.finish(false).await;
                Some(Err(ExecError::Spill(err)))
            }
        }
    }

    async fn finish(&mut self, drained: bool) {
        self.reader = None;
        if let Some(mut handle) = self.handle.take() {
            if drained {
                handle.advance(InvocationState::Drained);
            }
            handle.close().await;
            self.state = handle.state();
        }
        debug!(target: "cvx.exec", bytes = self.len, drained, "output producer finished");
    }

    /// Adapt into a [`Stream`] of chunks.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, ExecError>> + Send + 'static {
        stream::unfold(self, |mut producer| async move {
            let chunk = producer.next_chunk().await?;
            Some((chunk, producer))
        })
    }

    /// Drain everything into one buffer. Meant for tests and small outputs.
    pub async fn collect(mut self) -> Result<Vec<u8>, ExecError> {
        let mut out = Vec::with_capacity(usize::try_from(self.len).unwrap_or(0));
        while let Some(chunk) = self.next_chunk().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}
