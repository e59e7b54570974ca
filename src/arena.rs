//! Raw memory arena
//!
//! A fixed-length, zero-initialized byte region with bounds-checked typed
//! access at byte offsets. Each table owns its arenas exclusively and frees
//! them exactly once, either through [`Arena::free`] or on drop.
//!
//! ## Concurrency
//! Reads and `&mut self` writes follow normal borrow rules. The active table
//! appends from several threads at once, each into a range it reserved under
//! its append lock; that path goes through the `unsafe` [`Arena::write_shared`].

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::{CacheError, Result};

const ALIGN: usize = 8;

/// Contiguous heap region addressed by byte offset
pub struct Arena {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the arena owns its allocation. Shared access only reads, except for
// `write_shared`, whose caller guarantees exclusive access to the range.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    /// Allocate a zeroed region of `len` bytes. A zero length allocates nothing.
    pub fn with_capacity(len: usize) -> Result<Self> {
        if len == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                len: 0,
            });
        }

        let layout = Self::layout(len)?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            CacheError::Memory(format!("failed to allocate arena of {} bytes", len))
        })?;

        Ok(Self { ptr, len })
    }

    /// Length in bytes (0 once freed)
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Borrow `len` bytes starting at `offset`
    pub fn read(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check(offset, len)?;
        if len == 0 {
            return Ok(&[]);
        }
        // SAFETY: range checked above, allocation lives as long as `self`.
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) })
    }

    pub fn get_u8(&self, offset: usize) -> Result<u8> {
        Ok(self.read(offset, 1)?[0])
    }

    pub fn get_u32(&self, offset: usize) -> Result<u32> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.read(offset, 4)?);
        Ok(u32::from_le_bytes(buf))
    }

    pub fn get_u64(&self, offset: usize) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.read(offset, 8)?);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn get_i64(&self, offset: usize) -> Result<i64> {
        Ok(self.get_u64(offset)? as i64)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Copy `bytes` into the arena at `offset`
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        // SAFETY: `&mut self` rules out any other access.
        unsafe { self.write_shared(offset, bytes) }
    }

    /// Copy `bytes` into the arena at `offset` through a shared reference.
    ///
    /// # Safety
    /// No other thread may read or write `offset..offset + bytes.len()`
    /// until this call returns and the write has been published with a
    /// release/acquire pair.
    pub unsafe fn write_shared(&self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check(offset, bytes.len())?;
        if bytes.is_empty() {
            return Ok(());
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.as_ptr().add(offset), bytes.len());
        Ok(())
    }

    pub fn put_u8(&mut self, offset: usize, value: u8) -> Result<()> {
        self.write(offset, &[value])
    }

    pub fn put_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn put_u64(&mut self, offset: usize, value: u64) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn put_i64(&mut self, offset: usize, value: i64) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    // =========================================================================
    // Bulk Operations
    // =========================================================================

    /// Copy `len` bytes from this arena into `dst`
    pub fn copy_to(&self, src_offset: usize, dst: &mut Arena, dst_offset: usize, len: usize) -> Result<()> {
        let src = self.read(src_offset, len)?;
        dst.write(dst_offset, src)
    }

    /// New arena holding exactly the first `len` bytes of this one
    pub fn shrink_to(&self, len: usize) -> Result<Arena> {
        let mut shrunk = Arena::with_capacity(len)?;
        self.copy_to(0, &mut shrunk, 0, len)?;
        Ok(shrunk)
    }

    /// Release the allocation. Further access fails with `CacheError::Memory`.
    pub fn free(&mut self) {
        if self.len == 0 {
            return;
        }
        if let Ok(layout) = Self::layout(self.len) {
            // SAFETY: allocated in `with_capacity` with this exact layout,
            // and `len` is reset so this runs once.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
        self.ptr = NonNull::dangling();
        self.len = 0;
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn layout(len: usize) -> Result<Layout> {
        Layout::from_size_align(len, ALIGN)
            .map_err(|e| CacheError::Memory(format!("invalid arena size {}: {}", len, e)))
    }

    fn check(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(CacheError::Memory(format!(
                "access {}..{} out of bounds for arena of {} bytes",
                offset,
                offset.saturating_add(len),
                self.len
            ))),
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.free();
    }
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena").field("len", &self.len).finish()
    }
}
