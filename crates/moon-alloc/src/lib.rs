//! Raw backing-store allocators.
//!
//! The collector never talks to the system heap directly. Every byte block it
//! hands out (userdata payloads, string bytes) goes through an [`Allocator`],
//! which exposes a single `reallocate` primitive in the classic
//! allocate/resize/free style. Object bodies that live in the collector's own
//! arena are settled with [`Allocator::reserve`]. A failed request surfaces
//! as [`AllocError`] so the caller can collect garbage and retry.

use std::fmt;
use std::ptr::NonNull;

mod limited;
mod system;

pub use limited::{Budget, LimitedAllocator};
pub use system::SystemAllocator;

/// The backing store refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("backing store refused a request for {requested} bytes")]
pub struct AllocError {
    /// Size of the block that could not be provided.
    pub requested: usize,
}

/// A raw allocate/reallocate/free triple.
///
/// # Safety
///
/// Implementors must return blocks that are valid for reads and writes of
/// `new_size` bytes, and must accept back any pointer they produced together
/// with the size it was last allocated at.
pub unsafe trait Allocator {
    /// Allocates, resizes or frees a block.
    ///
    /// * `ptr == None`: allocate `new_size` bytes.
    /// * `new_size == 0`: free `ptr` and return `None`.
    /// * otherwise: resize `ptr` from `old_size` to `new_size`, preserving the
    ///   common prefix.
    ///
    /// Returns `None` when the request cannot be satisfied. On a failed resize
    /// the original block is left untouched.
    ///
    /// # Safety
    ///
    /// `ptr` must be `None` or a pointer previously returned by this allocator
    /// whose current size is `old_size`.
    unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>>;

    /// Allocates a zero-filled block of `size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if the backing store refuses the request.
    fn allocate(&mut self, size: usize) -> Result<RawBlock, AllocError> {
        if size == 0 {
            return Ok(RawBlock::empty());
        }
        // SAFETY: fresh allocation, no previous block.
        let ptr = unsafe { self.reallocate(None, 0, size) }.ok_or(AllocError { requested: size })?;
        // SAFETY: the allocator guarantees `size` writable bytes.
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Ok(RawBlock { ptr, len: size })
    }

    /// Grows or shrinks `block` in place or by moving it. New bytes are zeroed.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] and leaves `block` untouched if the backing
    /// store refuses the request.
    fn resize(&mut self, block: &mut RawBlock, new_size: usize) -> Result<(), AllocError> {
        if new_size == block.len {
            return Ok(());
        }
        if new_size == 0 {
            let old = std::mem::replace(block, RawBlock::empty());
            self.free(old);
            return Ok(());
        }
        let old_ptr = (block.len != 0).then_some(block.ptr);
        // SAFETY: `block` was produced by this allocator at `block.len` bytes.
        let ptr = unsafe { self.reallocate(old_ptr, block.len, new_size) }
            .ok_or(AllocError { requested: new_size })?;
        if new_size > block.len {
            // SAFETY: bytes past the old length are inside the new block.
            unsafe { ptr.as_ptr().add(block.len).write_bytes(0, new_size - block.len) };
        }
        block.ptr = ptr;
        block.len = new_size;
        Ok(())
    }

    /// Returns `block` to the backing store.
    fn free(&mut self, block: RawBlock) {
        if block.len == 0 {
            return;
        }
        // SAFETY: `block` was produced by this allocator at `block.len` bytes.
        unsafe {
            self.reallocate(Some(block.ptr), block.len, 0);
        }
    }

    /// Accounts for memory the caller keeps outside any block, replacing an
    /// earlier reservation of `old_size` bytes with one of `new_size`.
    ///
    /// The default accepts every request. Shrinking must never fail.
    ///
    /// # Errors
    ///
    /// Returns [`AllocError`] if the backing store cannot cover the growth.
    fn reserve(&mut self, old_size: usize, new_size: usize) -> Result<(), AllocError> {
        let _ = (old_size, new_size);
        Ok(())
    }
}

/// An owned byte block obtained from an [`Allocator`].
///
/// The block does not free itself. Whoever holds it must hand it back with
/// [`Allocator::free`] on the allocator that produced it.
pub struct RawBlock {
    ptr: NonNull<u8>,
    len: usize,
}

impl RawBlock {
    /// A zero-length block that owns no memory.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            len: 0,
        }
    }

    /// Size of the block in bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `len` initialized bytes (zero-filled on
        // allocation) or dangling with `len == 0`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl fmt::Debug for RawBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBlock")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}
