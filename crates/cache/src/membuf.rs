//! Memory buffers and their state machine.
//!
//! A [`MemoryBuffer`] is the physical storage behind one or more
//! [`ByteChunk`](crate::ByteChunk)s. It caches the file range
//! `[offset, offset+length)` and carries:
//!
//! ```text
//! flags (under one mutex + condvar):
//!   locked    - exclusive gate for changing contents or flags
//!   uptodate  - contents are valid file data
//!   dirty     - contents must be written back (implies uptodate)
//!   flushing  - backend write of dirty contents is in flight
//! inuse (atomic):
//!   number of callers working on the buffer; protects it from eviction
//! ```
//!
//! # Protocol
//!
//! `get()` -> `set_locked()` -> I/O -> `set_uptodate()`/`set_dirty()`/... ->
//! `clear_locked()` -> `clear_inuse()`.
//!
//! Flag changes other than locking require the caller to hold the lock and
//! an in-use reference. Violations panic.
//!
//! # Data access
//!
//! Contents are changed only by the lock holder. Readers of an uptodate
//! buffer do not need the lock and may observe a mix of old and new bytes if
//! they race with a writer.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use crate::error::CacheError;
use crate::stats::{CacheCounters, Counter};
use crate::storage::{BufferStorage, Region};

/// How long one condvar wait lasts before re-checking the lock.
const LOCK_WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// Waiting longer than this for a buffer lock is logged (and again every
/// further interval of this length).
const LOCK_WARN_AFTER: Duration = Duration::from_secs(30);

/// Snapshot of the buffer flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags {
    /// Contents are valid file data.
    pub uptodate: bool,
    /// Someone holds the buffer lock.
    pub locked: bool,
    /// Contents differ from the backend.
    pub dirty: bool,
    /// Backend write of the dirty contents is in flight.
    pub flushing: bool,
}

/// Physical storage for a cached file range.
pub struct MemoryBuffer {
    /// File offset of the first byte.
    offset: u64,
    /// Number of bytes.
    length: u64,
    /// Flag state, protected together with `unlocked`.
    state: Mutex<BufferFlags>,
    /// Signalled when the lock is released.
    unlocked: Condvar,
    /// Number of callers currently working on this buffer.
    inuse: AtomicU32,
    /// Contents; `None` once a file-backed buffer's memory was dropped.
    data: RwLock<Option<Region>>,
    /// Allocator the contents came from.
    storage: Arc<dyn BufferStorage>,
    /// Owning cache's counters, for accounting only.
    counters: Weak<CacheCounters>,
}

impl MemoryBuffer {
    /// Allocate a new buffer.
    ///
    /// # Arguments
    /// * `offset` - File offset of the first byte
    /// * `length` - Buffer size in bytes (non-zero)
    /// * `storage` - Allocator for the contents
    /// * `counters` - Owning cache's counters
    pub(crate) fn new(
        offset: u64,
        length: u64,
        storage: Arc<dyn BufferStorage>,
        counters: Weak<CacheCounters>,
    ) -> Result<Self, CacheError> {
        assert!(length > 0, "zero-length buffer at offset {}", offset);

        let region: Region = storage.allocate(offset, length)?;

        let membuf = Self {
            offset,
            length,
            state: Mutex::new(BufferFlags::default()),
            unlocked: Condvar::new(),
            inuse: AtomicU32::new(0),
            data: RwLock::new(Some(region)),
            storage,
            counters,
        };
        membuf.account_add(Counter::Allocated, length);
        Ok(membuf)
    }

    /// File offset of the first byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Buffer length in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// File offset one past the last byte.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// True if the memory comes from a scratch file.
    pub fn is_file_backed(&self) -> bool {
        self.storage.is_file_backed()
    }

    // ========================================================================
    // Accounting
    // ========================================================================

    fn account_add(&self, kind: Counter, n: u64) {
        if let Some(counters) = self.counters.upgrade() {
            counters.add(kind, n);
        }
    }

    fn account_sub(&self, kind: Counter, n: u64) {
        if let Some(counters) = self.counters.upgrade() {
            counters.sub(kind, n);
        }
    }

    // ========================================================================
    // Flags
    // ========================================================================

    /// Get a snapshot of all flags.
    pub fn flags(&self) -> BufferFlags {
        *self.state.lock()
    }

    /// Check if contents are valid file data.
    pub fn is_uptodate(&self) -> bool {
        self.state.lock().uptodate
    }

    /// Check if someone holds the buffer lock.
    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    /// Check if contents must be written back.
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    /// Check if a backend write is in flight.
    pub fn is_flushing(&self) -> bool {
        self.state.lock().flushing
    }

    /// Dirty and not already being flushed.
    pub fn needs_flush(&self) -> bool {
        let flags: BufferFlags = self.flags();
        flags.dirty && !flags.flushing
    }

    /// Current in-use count.
    pub fn inuse(&self) -> u32 {
        self.inuse.load(Ordering::Acquire)
    }

    /// Check if any caller is working on this buffer.
    pub fn is_inuse(&self) -> bool {
        self.inuse() > 0
    }

    /// Take an in-use reference.
    pub fn set_inuse(&self) {
        let prev: u32 = self.inuse.fetch_add(1, Ordering::AcqRel);
        if prev == 0 {
            self.account_add(Counter::InUse, self.length);
        }
    }

    /// Drop an in-use reference taken by `get()` or `set_inuse()`.
    pub fn clear_inuse(&self) {
        let prev: u32 = self.inuse.fetch_sub(1, Ordering::AcqRel);
        assert!(
            prev > 0,
            "clear_inuse() on buffer [{}, {}) not in use",
            self.offset,
            self.end()
        );
        if prev == 1 {
            self.account_sub(Counter::InUse, self.length);
        }
    }

    /// Lock the buffer, waiting as long as needed.
    ///
    /// Spins once, then sleeps on the condvar. Long waits are logged but never
    /// abandoned.
    pub fn set_locked(&self) {
        assert!(
            self.is_inuse(),
            "set_locked() on buffer [{}, {}) not in use",
            self.offset,
            self.end()
        );

        let mut state: MutexGuard<'_, BufferFlags> = self.state.lock();

        if state.locked {
            MutexGuard::unlocked(&mut state, std::thread::yield_now);
        }

        let start: Instant = Instant::now();
        let mut warn_at: Duration = LOCK_WARN_AFTER;

        while state.locked {
            let _ = self.unlocked.wait_for(&mut state, LOCK_WAIT_INTERVAL);

            let waited: Duration = start.elapsed();
            if state.locked && waited >= warn_at {
                tracing::warn!(
                    "Still waiting for lock on buffer [{}, {}) after {:?}",
                    self.offset,
                    self.end(),
                    waited
                );
                warn_at += LOCK_WARN_AFTER;
            }
        }

        state.locked = true;
        drop(state);

        self.account_add(Counter::Locked, self.length);
    }

    /// Try to lock the buffer without waiting.
    ///
    /// # Returns
    /// True if the lock was taken.
    pub fn try_lock(&self) -> bool {
        assert!(self.is_inuse(), "try_lock() on buffer not in use");

        let mut state: MutexGuard<'_, BufferFlags> = self.state.lock();
        if state.locked {
            return false;
        }
        state.locked = true;
        drop(state);

        self.account_add(Counter::Locked, self.length);
        true
    }

    /// Release the buffer lock and wake one waiter.
    pub fn clear_locked(&self) {
        let mut state: MutexGuard<'_, BufferFlags> = self.state.lock();
        assert!(
            state.locked,
            "clear_locked() on unlocked buffer [{}, {})",
            self.offset,
            self.end()
        );
        state.locked = false;
        drop(state);

        self.unlocked.notify_one();
        self.account_sub(Counter::Locked, self.length);
    }

    /// Lock the flag state, checking that the caller holds the buffer lock
    /// and an in-use reference.
    fn locked_state(&self, op: &str) -> MutexGuard<'_, BufferFlags> {
        let state: MutexGuard<'_, BufferFlags> = self.state.lock();
        assert!(
            state.locked && self.is_inuse(),
            "{}() on buffer [{}, {}) requires locked+inuse (locked={}, inuse={})",
            op,
            self.offset,
            self.end(),
            state.locked,
            self.inuse()
        );
        state
    }

    /// Mark contents as valid.
    ///
    /// Only whoever filled the entire buffer may call this.
    pub fn set_uptodate(&self) {
        let mut state = self.locked_state("set_uptodate");
        if !state.uptodate {
            state.uptodate = true;
            drop(state);
            self.account_add(Counter::Uptodate, self.length);
        }
    }

    /// Mark contents as invalid. Not allowed while dirty.
    pub fn clear_uptodate(&self) {
        let mut state = self.locked_state("clear_uptodate");
        assert!(!state.dirty, "clear_uptodate() on dirty buffer");
        if state.uptodate {
            state.uptodate = false;
            drop(state);
            self.account_sub(Counter::Uptodate, self.length);
        }
    }

    /// Mark contents as needing write-back.
    ///
    /// The buffer must be uptodate: either the writer filled all of it (and
    /// called `set_uptodate()` first), or it was uptodate before a partial
    /// write. A partial write into a buffer that is not uptodate must read
    /// the whole buffer first.
    pub fn set_dirty(&self) {
        let mut state = self.locked_state("set_dirty");
        assert!(
            state.uptodate,
            "set_dirty() on buffer [{}, {}) that is not uptodate",
            self.offset,
            self.end()
        );
        if !state.dirty {
            state.dirty = true;
            drop(state);
            self.account_add(Counter::Dirty, self.length);
        }
    }

    /// Mark dirty contents as written back.
    pub fn clear_dirty(&self) {
        let mut state = self.locked_state("clear_dirty");
        if state.dirty {
            state.dirty = false;
            drop(state);
            self.account_sub(Counter::Dirty, self.length);
        }
    }

    /// Mark a backend write as in flight. The buffer must be dirty.
    pub fn set_flushing(&self) {
        let mut state = self.locked_state("set_flushing");
        assert!(state.dirty, "set_flushing() on clean buffer");
        if !state.flushing {
            state.flushing = true;
            drop(state);
            self.account_add(Counter::Flushing, self.length);
        }
    }

    /// Mark the backend write as finished.
    ///
    /// On success clear dirty first; on failure leave dirty set so the data
    /// is written again later.
    pub fn clear_flushing(&self) {
        let mut state = self.locked_state("clear_flushing");
        if state.flushing {
            state.flushing = false;
            drop(state);
            self.account_sub(Counter::Flushing, self.length);
        }
    }

    // ========================================================================
    // Contents
    // ========================================================================

    /// Check if the buffer memory is present.
    pub fn is_loaded(&self) -> bool {
        self.data.read().is_some()
    }

    /// Map the buffer memory again if it was dropped.
    ///
    /// # Returns
    /// True if memory was mapped by this call.
    pub(crate) fn load(&self) -> Result<bool, CacheError> {
        if self.is_loaded() {
            return Ok(false);
        }

        let mut data = self.data.write();
        if data.is_some() {
            return Ok(false);
        }

        *data = Some(self.storage.allocate(self.offset, self.length)?);
        drop(data);

        tracing::trace!("Loaded buffer [{}, {})", self.offset, self.end());
        self.account_add(Counter::Allocated, self.length);
        Ok(true)
    }

    /// Release the memory of a file-backed buffer, keeping its flags.
    ///
    /// The bytes stay in the scratch file and are mapped again by `load()`.
    ///
    /// # Returns
    /// Number of bytes released (0 for heap buffers or if already dropped).
    pub(crate) fn drop_memory(&self) -> u64 {
        if !self.is_file_backed() {
            return 0;
        }

        let mut data = self.data.write();
        if data.take().is_none() {
            return 0;
        }
        drop(data);

        tracing::trace!("Dropped buffer memory [{}, {})", self.offset, self.end());
        self.account_sub(Counter::Allocated, self.length);
        self.length
    }

    fn check_range(&self, buffer_offset: u64, len: usize) {
        assert!(
            buffer_offset + len as u64 <= self.length,
            "access [{}, {}) outside buffer of length {}",
            buffer_offset,
            buffer_offset + len as u64,
            self.length
        );
    }

    /// Copy bytes out of the buffer.
    ///
    /// # Arguments
    /// * `buffer_offset` - Offset within the buffer
    /// * `dst` - Destination, filled completely
    pub fn read(&self, buffer_offset: u64, dst: &mut [u8]) -> Result<(), CacheError> {
        self.check_range(buffer_offset, dst.len());

        let data = self.data.read();
        let region: &Region = data.as_ref().ok_or(CacheError::NotLoaded {
            offset: self.offset,
            length: self.length,
        })?;

        let start: usize = buffer_offset as usize;
        dst.copy_from_slice(&region.as_slice()[start..start + dst.len()]);
        Ok(())
    }

    /// Copy bytes into the buffer. Caller must hold the buffer lock.
    ///
    /// # Arguments
    /// * `buffer_offset` - Offset within the buffer
    /// * `src` - Bytes to copy
    pub fn write(&self, buffer_offset: u64, src: &[u8]) -> Result<(), CacheError> {
        self.check_range(buffer_offset, src.len());
        assert!(self.is_locked(), "write() to unlocked buffer");

        let mut data = self.data.write();
        let region: &mut Region = data.as_mut().ok_or(CacheError::NotLoaded {
            offset: self.offset,
            length: self.length,
        })?;

        let start: usize = buffer_offset as usize;
        region.as_mut_slice()[start..start + src.len()].copy_from_slice(src);
        Ok(())
    }

    /// Access the whole buffer contents with a read lock.
    ///
    /// # Arguments
    /// * `f` - Closure that receives the contents
    pub fn with_data<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&[u8]) -> R,
    {
        let data = self.data.read();
        let region: &Region = data.as_ref().ok_or(CacheError::NotLoaded {
            offset: self.offset,
            length: self.length,
        })?;
        Ok(f(region.as_slice()))
    }
}

impl Drop for MemoryBuffer {
    fn drop(&mut self) {
        let flags: BufferFlags = *self.state.get_mut();
        let inuse: u32 = *self.inuse.get_mut();

        if flags.locked || flags.dirty || inuse > 0 {
            tracing::error!(
                "Destroying buffer [{}, {}) in state {:?} inuse={}",
                self.offset,
                self.end(),
                flags,
                inuse
            );
        }

        let Some(counters) = self.counters.upgrade() else {
            return;
        };

        if self.data.get_mut().is_some() {
            counters.sub(Counter::Allocated, self.length);
        }
        if flags.uptodate {
            counters.sub(Counter::Uptodate, self.length);
        }
        if flags.dirty {
            counters.sub(Counter::Dirty, self.length);
        }
        if flags.flushing {
            counters.sub(Counter::Flushing, self.length);
        }
        if flags.locked {
            counters.sub(Counter::Locked, self.length);
        }
        if inuse > 0 {
            counters.sub(Counter::InUse, self.length);
        }
    }
}

impl fmt::Debug for MemoryBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBuffer")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("flags", &self.flags())
            .field("inuse", &self.inuse())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}
