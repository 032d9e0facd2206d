//! Fixed-capacity I/O buffer
//!
//! Every connection owns one receive and one send buffer for its whole
//! pooled lifetime. The backing storage is allocated once; `reset` only
//! rewinds the cursors.
//!
//! ```text
//!  0          read             write              capacity
//!  ├───────────┼─────────────────┼───────────────────┤
//!  │ consumed  │    readable     │     writable      │
//!  └───────────┴─────────────────┴───────────────────┘
//! ```

use std::io::{self, Read, Write};

/// A fixed-capacity byte region with read and write cursors
pub struct Buffer {
    data: Box<[u8]>,
    read: usize,
    write: usize,
}

impl Buffer {
    /// Allocate a buffer of `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
        }
    }

    /// Total capacity in bytes
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Number of readable (filled, not yet consumed) bytes
    pub fn len(&self) -> usize {
        self.write - self.read
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    /// True when no more bytes can be accepted, even after compaction
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Bytes that could still be written after compaction
    pub fn available(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Readable bytes
    pub fn readable(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    /// Free space at the tail, compacting first if the tail is exhausted
    pub fn writable(&mut self) -> &mut [u8] {
        if self.write == self.capacity() && self.read > 0 {
            self.compact();
        }
        &mut self.data[self.write..]
    }

    /// Mark `n` bytes of the writable region as filled
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.write + n <= self.capacity());
        self.write += n;
    }

    /// Discard `n` readable bytes
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len());
        self.read += n;
        if self.read == self.write {
            self.read = 0;
            self.write = 0;
        }
    }

    /// Move the readable region to the front of the storage
    pub fn compact(&mut self) {
        if self.read == 0 {
            return;
        }
        self.data.copy_within(self.read..self.write, 0);
        self.write -= self.read;
        self.read = 0;
    }

    /// Append `bytes` if they fit. Returns false (and writes nothing) otherwise.
    pub fn put_slice(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.available() {
            return false;
        }
        if bytes.len() > self.capacity() - self.write {
            self.compact();
        }
        self.data[self.write..self.write + bytes.len()].copy_from_slice(bytes);
        self.write += bytes.len();
        true
    }

    /// Rewind both cursors. Contents are logically discarded, storage is kept.
    pub fn reset(&mut self) {
        self.read = 0;
        self.write = 0;
    }

    /// One `read` call from `reader` into the writable region.
    ///
    /// Returns `Ok(0)` both on EOF and when the buffer is full; callers tell
    /// the two apart with [`Buffer::is_full`].
    pub fn fill_from<R: Read + ?Sized>(&mut self, reader: &mut R) -> io::Result<usize> {
        let space = self.writable();
        if space.is_empty() {
            return Ok(0);
        }
        let n = reader.read(space)?;
        self.commit(n);
        Ok(n)
    }

    /// One `write` call of the readable region into `writer`
    pub fn drain_to<W: Write + ?Sized>(&mut self, writer: &mut W) -> io::Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let n = writer.write(self.readable())?;
        self.consume(n);
        Ok(n)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("capacity", &self.capacity())
            .field("read", &self.read)
            .field("write", &self.write)
            .finish()
    }
}

/// Readable bytes as a `bytes::Buf`, so decoders can use `get_u8`/`get_u32`.
impl bytes::Buf for Buffer {
    fn remaining(&self) -> usize {
        self.len()
    }

    fn chunk(&self) -> &[u8] {
        self.readable()
    }

    fn advance(&mut self, cnt: usize) {
        self.consume(cnt);
    }
}

/// Lets a TLS session pull ciphertext that arrived before it was created.
impl Read for Buffer {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = out.len().min(self.len());
        out[..n].copy_from_slice(&self.readable()[..n]);
        self.consume(n);
        Ok(n)
    }
}
