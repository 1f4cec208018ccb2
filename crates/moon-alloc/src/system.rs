use std::ptr::NonNull;

use crate::Allocator;

/// The C runtime heap (`malloc`/`realloc`/`free`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

// SAFETY: libc's malloc family returns blocks valid for the requested size and
// accepts back any pointer it produced.
unsafe impl Allocator for SystemAllocator {
    unsafe fn reallocate(
        &mut self,
        ptr: Option<NonNull<u8>>,
        _old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        match (ptr, new_size) {
            (None, 0) => None,
            (Some(p), 0) => {
                // SAFETY: caller guarantees `p` came from this allocator.
                unsafe { libc::free(p.as_ptr().cast()) };
                None
            }
            // SAFETY: plain allocation.
            (None, n) => NonNull::new(unsafe { libc::malloc(n) }.cast()),
            // SAFETY: caller guarantees `p` came from this allocator.
            (Some(p), n) => NonNull::new(unsafe { libc::realloc(p.as_ptr().cast(), n) }.cast()),
        }
    }
}
