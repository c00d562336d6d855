//! Shared, reference-counted payload handles.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::header::PayloadHeader;
use crate::memory::PoolInner;

/// A shared handle to one pooled buffer plus a small header.
///
/// Payloads are the unit of handoff between pipeline stages; the buffer
/// itself never moves or copies. Cloning a payload increments the slot's
/// refcount; dropping the last clone returns the slot to the pool, free for
/// the next checkout.
///
/// Mutable access to the buffer is only granted while the handle is unique
/// (refcount 1), so a stage can never scribble over data another stage is
/// still reading. Once `header().valid` is false, the contents must not be
/// interpreted.
pub struct Payload<T: Copy> {
    inner: Arc<PoolInner<T>>,
    slot: usize,
    header: PayloadHeader,
}

impl<T: Copy> Payload<T> {
    /// Called by the pool with the slot refcount already set to 1.
    pub(crate) fn from_slot(inner: Arc<PoolInner<T>>, slot: usize, header: PayloadHeader) -> Self {
        Self {
            inner,
            slot,
            header,
        }
    }

    /// The payload header.
    pub fn header(&self) -> &PayloadHeader {
        &self.header
    }

    /// Mutable access to the header (each clone carries its own copy).
    pub fn header_mut(&mut self) -> &mut PayloadHeader {
        &mut self.header
    }

    /// Element count of the backing slot.
    pub fn len(&self) -> usize {
        // The pool guarantees the slot outlives every handle; shared reads
        // are sound because writers require a unique handle.
        unsafe { (*self.inner.slots[self.slot].buf.get()).len() }
    }

    /// Returns true if the slot is empty (cannot happen for pooled slots).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The buffer contents.
    pub fn as_slice(&self) -> &[T] {
        unsafe { (*self.inner.slots[self.slot].buf.get()).as_slice() }
    }

    /// Mutable buffer contents, only while this handle is the sole owner.
    ///
    /// Returns `None` when clones exist; callers that need to write must
    /// hold the only handle.
    pub fn as_mut_slice(&mut self) -> Option<&mut [T]> {
        if self.refcount() == 1 {
            Some(unsafe { (*self.inner.slots[self.slot].buf.get()).as_mut_slice() })
        } else {
            None
        }
    }

    /// Current refcount of the backing slot (a snapshot).
    pub fn refcount(&self) -> u32 {
        self.inner.slots[self.slot].refs.load(Ordering::Acquire)
    }

    /// Index of the backing slot within its pool.
    pub fn slot_index(&self) -> usize {
        self.slot
    }
}

impl<T: Copy> Clone for Payload<T> {
    fn clone(&self) -> Self {
        let prev = self.inner.slots[self.slot].refs.fetch_add(1, Ordering::Relaxed);
        debug_assert!(prev >= 1, "clone of a released payload");
        Self {
            inner: Arc::clone(&self.inner),
            slot: self.slot,
            header: self.header.clone(),
        }
    }
}

impl<T: Copy> Drop for Payload<T> {
    fn drop(&mut self) {
        self.inner.release(self.slot);
    }
}

impl<T: Copy> std::fmt::Debug for Payload<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payload")
            .field("slot", &self.slot)
            .field("refcount", &self.refcount())
            .field("header", &self.header)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::CubeShape;
    use crate::memory::{BufferPool, CheckoutPolicy};
    use std::time::Duration;

    fn pool() -> BufferPool<f32> {
        BufferPool::new(2, 64, CheckoutPolicy::FailFast).unwrap()
    }

    fn header(seq: u64) -> PayloadHeader {
        PayloadHeader::new(seq, Duration::ZERO, CubeShape::new(1, 1, 8, 8))
    }

    #[test]
    fn test_refcount_conservation() {
        let pool = pool();
        let p = pool.checkout(header(0)).unwrap();
        assert_eq!(p.refcount(), 1);

        let clones: Vec<_> = (0..3).map(|_| p.clone()).collect();
        assert_eq!(p.refcount(), 4);
        assert_eq!(pool.available(), 1);

        drop(clones);
        assert_eq!(p.refcount(), 1);
        drop(p);
        assert_eq!(pool.available(), 2);

        // Slot is checkout-eligible again.
        let again = pool.checkout(header(1)).unwrap();
        assert_eq!(again.refcount(), 1);
    }

    #[test]
    fn test_mut_access_requires_unique_handle() {
        let pool = pool();
        let mut p = pool.checkout(header(0)).unwrap();
        assert!(p.as_mut_slice().is_some());

        let clone = p.clone();
        assert!(p.as_mut_slice().is_none());
        drop(clone);
        assert!(p.as_mut_slice().is_some());
    }

    #[test]
    fn test_writes_visible_to_clones() {
        let pool = pool();
        let mut p = pool.checkout(header(5)).unwrap();
        p.as_mut_slice().unwrap()[7] = 3.5;

        let clone = p.clone();
        assert_eq!(clone.as_slice()[7], 3.5);
        assert_eq!(clone.header().sequence, 5);
    }

    #[test]
    fn test_recycled_slot_not_zeroed() {
        let pool = BufferPool::<f32>::new(1, 8, CheckoutPolicy::FailFast).unwrap();
        {
            let mut p = pool.checkout(header(0)).unwrap();
            p.as_mut_slice().unwrap()[0] = 9.0;
        }
        let p = pool.checkout(header(1)).unwrap();
        assert_eq!(p.as_slice()[0], 9.0);
    }
}
