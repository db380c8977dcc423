// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Chunked streaming byte store for file nodes
//!
//! Each file node owns one [`FileContent`]. Its lock is independent of all
//! structural state, so a long streamed read proceeds while the owning node
//! is concurrently relocated in the tree.

use parking_lot::RwLock;
use std::io::{Read, Write};

use crate::error::{FsError, FsResult};

#[derive(Debug)]
struct ContentState {
    bytes: Vec<u8>,
    chunk_size: usize,
}

/// Mutable byte buffer with chunked streaming read/write access
#[derive(Debug)]
pub struct FileContent {
    state: RwLock<ContentState>,
}

impl FileContent {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            state: RwLock::new(ContentState {
                bytes: Vec::new(),
                chunk_size: chunk_size.max(1),
            }),
        }
    }

    pub fn len(&self) -> u64 {
        self.state.read().bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().bytes.is_empty()
    }

    pub fn chunk_size(&self) -> usize {
        self.state.read().chunk_size
    }

    pub fn set_chunk_size(&self, chunk_size: usize) {
        self.state.write().chunk_size = chunk_size.max(1);
    }

    /// Snapshot of the full contents
    pub fn contents(&self) -> Vec<u8> {
        self.state.read().bytes.clone()
    }

    /// Replace the contents wholesale
    pub fn set_contents(&self, bytes: Vec<u8>) {
        self.state.write().bytes = bytes;
    }

    /// Stream the full contents into `sink` in chunk-size pieces.
    /// Holds the shared content lock for the duration of the stream.
    pub fn read_to(&self, sink: &mut dyn Write) -> FsResult<u64> {
        let state = self.state.read();
        let len = state.bytes.len();
        Self::stream_range(&state, 0, len, sink)
    }

    /// Stream `len` bytes starting at `offset` into `sink`
    pub fn read_range_to(&self, offset: usize, len: usize, sink: &mut dyn Write) -> FsResult<u64> {
        let state = self.state.read();
        if offset.checked_add(len).map_or(true, |end| end > state.bytes.len()) {
            return Err(FsError::InvalidArgument);
        }
        Self::stream_range(&state, offset, len, sink)
    }

    fn stream_range(
        state: &ContentState,
        offset: usize,
        len: usize,
        sink: &mut dyn Write,
    ) -> FsResult<u64> {
        let mut written = 0u64;
        for chunk in state.bytes[offset..offset + len].chunks(state.chunk_size) {
            sink.write_all(chunk)?;
            written += chunk.len() as u64;
        }
        sink.flush()?;
        Ok(written)
    }

    /// Drain `source` in chunk-size pieces and splice the bytes in at
    /// `start`: bytes before `start` and past the written range survive, and
    /// the buffer grows when the write extends beyond its current end.
    pub fn write_from(&self, source: &mut dyn Read, start: usize) -> FsResult<u64> {
        let mut state = self.state.write();
        if start > state.bytes.len() {
            return Err(FsError::InvalidArgument);
        }

        let mut incoming = Vec::new();
        let mut chunk = vec![0u8; state.chunk_size];
        loop {
            let n = source.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            incoming.extend_from_slice(&chunk[..n]);
        }

        let end = start + incoming.len();
        if end > state.bytes.len() {
            state.bytes.resize(end, 0);
        }
        state.bytes[start..end].copy_from_slice(&incoming);
        Ok(incoming.len() as u64)
    }

    /// Independent copy with the same bytes and chunk size
    pub fn deep_copy(&self) -> Self {
        let state = self.state.read();
        Self {
            state: RwLock::new(ContentState {
                bytes: state.bytes.clone(),
                chunk_size: state.chunk_size,
            }),
        }
    }
}
