//! Views into memory buffers.

use std::fmt;
use std::sync::Arc;

use crate::error::CacheError;
use crate::membuf::MemoryBuffer;

/// A file range backed by (part of) a [`MemoryBuffer`].
///
/// The chunk map keeps exactly one `ByteChunk` per cached sub-range.
/// `get()` hands out clones (possibly narrowed to the requested range) that
/// share the same buffer. A chunk's range can shrink independently of its
/// buffer when part of it is released.
///
/// ```text
/// MemoryBuffer  [==============================)
///               ^ membuf.offset()
/// ByteChunk            [=========)
///                      ^ offset
///               |------| buffer_offset
/// ```
#[derive(Clone)]
pub struct ByteChunk {
    /// File offset of the first byte.
    offset: u64,
    /// Number of bytes.
    length: u64,
    /// Displacement of `offset` into the buffer.
    buffer_offset: u64,
    /// Allocated by the `get()` that returned it; holds no valid data yet.
    is_new: bool,
    /// Caller-private progress cursor, in bytes from `offset`.
    pub pvt: u64,
    /// Number of backend calls issued for this chunk.
    pub num_backend_calls_issued: u32,
    /// Shared buffer.
    membuf: Arc<MemoryBuffer>,
}

impl ByteChunk {
    /// Chunk spanning a whole buffer.
    pub(crate) fn whole(membuf: Arc<MemoryBuffer>, is_new: bool) -> Self {
        Self {
            offset: membuf.offset(),
            length: membuf.length(),
            buffer_offset: 0,
            is_new,
            pvt: 0,
            num_backend_calls_issued: 0,
            membuf,
        }
    }

    /// Narrow this chunk to `[offset, offset+length)`, which must lie inside
    /// it. The returned chunk shares the buffer and is never new.
    pub(crate) fn view(&self, offset: u64, length: u64) -> Self {
        assert!(
            offset >= self.offset && offset + length <= self.end(),
            "view [{}, {}) outside chunk [{}, {})",
            offset,
            offset + length,
            self.offset,
            self.end()
        );

        Self {
            offset,
            length,
            buffer_offset: self.buffer_offset + (offset - self.offset),
            is_new: false,
            pvt: 0,
            num_backend_calls_issued: 0,
            membuf: self.membuf.clone(),
        }
    }

    /// Drop `n` bytes from the front.
    pub(crate) fn trim_left(&mut self, n: u64) {
        assert!(n < self.length);
        self.offset += n;
        self.buffer_offset += n;
        self.length -= n;
    }

    /// Drop `n` bytes from the back.
    pub(crate) fn trim_right(&mut self, n: u64) {
        assert!(n < self.length);
        self.length -= n;
    }

    /// File offset of the first byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// File offset one past the last byte.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Displacement into the buffer.
    pub fn buffer_offset(&self) -> u64 {
        self.buffer_offset
    }

    /// True if this chunk was allocated by the call that returned it.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// True if this chunk spans its entire buffer.
    ///
    /// Only a whole chunk can be filled completely, and so only a whole
    /// chunk may mark its buffer uptodate.
    pub fn is_whole(&self) -> bool {
        self.buffer_offset == 0 && self.length == self.membuf.length()
    }

    /// Get the backing buffer.
    pub fn membuf(&self) -> &Arc<MemoryBuffer> {
        &self.membuf
    }

    /// Bytes not yet covered by `pvt`.
    pub fn remaining(&self) -> u64 {
        self.length.saturating_sub(self.pvt)
    }

    /// Buffer is dirty and has no write in flight.
    pub fn needs_flush(&self) -> bool {
        self.membuf.needs_flush()
    }

    /// Buffer is neither in use, locked nor dirty, so the chunk can be
    /// dropped from the cache.
    pub fn safe_to_release(&self) -> bool {
        if self.membuf.is_inuse() {
            return false;
        }
        let flags = self.membuf.flags();
        !flags.locked && !flags.dirty
    }

    /// Copy bytes out of the chunk.
    ///
    /// # Arguments
    /// * `chunk_offset` - Offset from the start of this chunk
    /// * `dst` - Destination, filled completely
    pub fn read(&self, chunk_offset: u64, dst: &mut [u8]) -> Result<(), CacheError> {
        assert!(chunk_offset + dst.len() as u64 <= self.length);
        self.membuf.read(self.buffer_offset + chunk_offset, dst)
    }

    /// Copy bytes into the chunk. The buffer must be locked.
    ///
    /// # Arguments
    /// * `chunk_offset` - Offset from the start of this chunk
    /// * `src` - Bytes to copy
    pub fn write(&self, chunk_offset: u64, src: &[u8]) -> Result<(), CacheError> {
        assert!(chunk_offset + src.len() as u64 <= self.length);
        self.membuf.write(self.buffer_offset + chunk_offset, src)
    }
}

impl fmt::Debug for ByteChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ByteChunk[{}, {}){}{} buf@{}",
            self.offset,
            self.end(),
            if self.is_new { " new" } else { "" },
            if self.is_whole() { " whole" } else { "" },
            self.membuf.offset() + self.buffer_offset
        )
    }
}
