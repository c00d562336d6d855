//! Aligned, fixed-size element buffers.

use std::alloc::{self, Layout};
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Minimum alignment, chosen to satisfy device-transfer and vectorized
/// access requirements.
pub const MIN_ALIGN: usize = 64;

/// A fixed-size block of `T` with guaranteed alignment.
///
/// Owns its memory exclusively and never reallocates; it is destroyed only
/// when its pool slot is recycled at teardown. The initial allocation is
/// zeroed, but recycled checkouts see whatever the previous holder wrote —
/// producers must not assume zero-initialization.
pub struct AlignedBuffer<T: Copy> {
    ptr: NonNull<T>,
    len: usize,
    layout: Layout,
    _marker: PhantomData<T>,
}

impl<T: Copy> AlignedBuffer<T> {
    /// Allocate a buffer of `len` elements.
    ///
    /// # Errors
    ///
    /// Returns an error if `len` is zero or the allocation fails.
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::AllocationFailed(
                "buffer length must be greater than 0".into(),
            ));
        }

        let align = MIN_ALIGN.max(std::mem::align_of::<T>());
        let size = len
            .checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| Error::AllocationFailed("buffer size overflows usize".into()))?;
        let layout = Layout::from_size_align(size, align)
            .map_err(|e| Error::AllocationFailed(e.to_string()))?;

        // Zeroed so the very first checkout reads initialized memory; the
        // recycle path leaves contents as the previous holder wrote them.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw as *mut T)
            .ok_or_else(|| Error::AllocationFailed(format!("allocation of {size} bytes failed")))?;

        Ok(Self {
            ptr,
            len,
            layout,
            _marker: PhantomData,
        })
    }

    /// Element count.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the buffer has zero length (cannot happen after
    /// construction).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The contents as a slice.
    pub fn as_slice(&self) -> &[T] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The contents as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Raw base pointer.
    pub fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }
}

impl<T: Copy> Drop for AlignedBuffer<T> {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr() as *mut u8, self.layout) };
    }
}

// The buffer owns its allocation outright; `T: Copy` rules out any interior
// ownership that could make a cross-thread move unsound.
unsafe impl<T: Copy + Send> Send for AlignedBuffer<T> {}
unsafe impl<T: Copy + Sync> Sync for AlignedBuffer<T> {}
