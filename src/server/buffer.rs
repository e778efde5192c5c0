// src/server/buffer.rs

//! Chunked byte queues backing descriptor reads and writes.
//!
//! Reads append whole chunks as they come off the socket; codecs consume
//! from the front. Chunks are `Bytes`, so splicing a packet from a backend
//! buffer into a client buffer is a refcount bump, not a copy.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::io::{self, Read, Write};

/// An append-only queue of byte chunks with a running total length.
#[derive(Debug, Default)]
pub struct ChunkQueue {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ChunkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of unconsumed bytes across all chunks.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends one chunk to the back of the queue.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Returns the buffered bytes as one contiguous slice, coalescing
    /// chunks first if more than one is queued.
    pub fn coalesced(&mut self) -> &[u8] {
        if self.chunks.len() > 1 {
            let mut merged = BytesMut::with_capacity(self.len);
            for chunk in self.chunks.drain(..) {
                merged.extend_from_slice(&chunk);
            }
            self.chunks.push_back(merged.freeze());
        }
        self.chunks.front().map(|c| c.as_ref()).unwrap_or(&[])
    }

    /// Splits off and returns the first `n` bytes.
    ///
    /// Cheap when the front chunk already holds at least `n` bytes;
    /// coalesces otherwise. Panics if fewer than `n` bytes are buffered.
    pub fn split_to(&mut self, n: usize) -> Bytes {
        assert!(n <= self.len, "split_to past end of buffered data");
        if n == 0 {
            return Bytes::new();
        }
        if self.chunks.front().map(|c| c.len()).unwrap_or(0) < n {
            self.coalesced();
        }
        let front = self.chunks.front_mut().expect("non-empty after check");
        let out = front.split_to(n);
        if front.is_empty() {
            self.chunks.pop_front();
        }
        self.len -= n;
        out
    }

    /// Discards the first `n` bytes.
    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.len, "advance past end of buffered data");
        let mut remaining = n;
        while remaining > 0 {
            let front = self.chunks.front_mut().expect("len invariant");
            if front.len() > remaining {
                front.advance(remaining);
                remaining = 0;
            } else {
                remaining -= front.len();
                self.chunks.pop_front();
            }
        }
        self.len -= n;
    }

    /// Drops all buffered data.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }

    /// Moves every chunk onto the back of `other`.
    pub fn drain_into(&mut self, other: &mut ChunkQueue) {
        other.len += self.len;
        other.chunks.append(&mut self.chunks);
        self.len = 0;
    }

    /// Reads from `src` until it would block or reports EOF, appending
    /// chunks to the queue. Returns the bytes read and whether EOF was hit.
    pub fn fill_from(&mut self, src: &mut impl Read) -> io::Result<ReadOutcome> {
        let mut total = 0usize;
        let mut scratch = [0u8; 16 * 1024];
        loop {
            match src.read(&mut scratch) {
                Ok(0) => return Ok(ReadOutcome { bytes: total, eof: true }),
                Ok(n) => {
                    self.push(Bytes::copy_from_slice(&scratch[..n]));
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome { bytes: total, eof: false });
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Writes buffered chunks into `dst` until everything has drained or
    /// the sink would block. Returns the bytes written and whether data is
    /// still pending.
    pub fn drain_to(&mut self, dst: &mut impl Write) -> io::Result<WriteOutcome> {
        let mut total = 0usize;
        while let Some(front) = self.chunks.front_mut() {
            match dst.write(front) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "socket wrote zero"));
                }
                Ok(n) => {
                    total += n;
                    self.len -= n;
                    if n == front.len() {
                        self.chunks.pop_front();
                    } else {
                        front.advance(n);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteOutcome { bytes: total, pending: true });
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(WriteOutcome { bytes: total, pending: false })
    }
}

/// Result of one `fill_from` pass.
#[derive(Debug, Clone, Copy)]
pub struct ReadOutcome {
    pub bytes: usize,
    pub eof: bool,
}

/// Result of one `drain_to` pass.
#[derive(Debug, Clone, Copy)]
pub struct WriteOutcome {
    pub bytes: usize,
    pub pending: bool,
}
