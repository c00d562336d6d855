//! Lock-free refcounted buffer pool.

use std::cell::UnsafeCell;
use std::sync::atomic::{self, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::header::PayloadHeader;
use crate::memory::AlignedBuffer;
use crate::payload::Payload;

/// What a checkout does when every slot is taken.
///
/// Exhaustion is an expected condition used for backpressure, so the policy
/// is a pool-level choice rather than a per-call error path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutPolicy {
    /// Return [`Error::PoolExhausted`] immediately.
    FailFast,
    /// Wait up to the given bound for a release, then fail.
    Wait(Duration),
}

pub(crate) struct Slot<T: Copy> {
    /// 0 = free, >= 1 = number of live Payload handles.
    pub(crate) refs: AtomicU32,
    pub(crate) buf: UnsafeCell<AlignedBuffer<T>>,
}

pub(crate) struct PoolInner<T: Copy> {
    pub(crate) slots: Box<[Slot<T>]>,
    /// Pairing mutex for `on_free`; slot state itself is atomic.
    pub(crate) free_lock: Mutex<()>,
    pub(crate) on_free: Condvar,
}

// Slots hand out &mut access only through a unique Payload handle; the
// refcount transitions make that exclusive across threads.
unsafe impl<T: Copy + Send> Send for PoolInner<T> {}
unsafe impl<T: Copy + Send> Sync for PoolInner<T> {}

impl<T: Copy> PoolInner<T> {
    pub(crate) fn release(&self, slot: usize) {
        let prev = self.slots[slot].refs.fetch_sub(1, Ordering::Release);
        debug_assert!(prev >= 1, "release of a free slot");
        if prev == 1 {
            // Last holder: the slot is free the instant the store lands.
            atomic::fence(Ordering::Acquire);
            let _guard = self.free_lock.lock().unwrap();
            self.on_free.notify_one();
        }
    }
}

/// A fixed-capacity set of reusable [`AlignedBuffer`]s with atomic
/// refcounted checkout.
///
/// Invariant: a slot is either free (refcount 0) or checked out (refcount
/// >= 1, owned jointly by every live [`Payload`] referencing it). Checkout
/// claims a slot with a compare-and-swap 0 -> 1; no global lock serializes
/// checkout against release. The pool never allocates past its configured
/// capacity.
///
/// Released slots become checkout-eligible immediately and their contents
/// are left as-is, not zeroed.
///
/// # Example
///
/// ```rust
/// use aperture::memory::{BufferPool, CheckoutPolicy};
/// use aperture::header::{CubeShape, PayloadHeader};
/// use std::time::Duration;
///
/// let pool = BufferPool::<f32>::new(4, 1024, CheckoutPolicy::FailFast).unwrap();
/// let shape = CubeShape::new(1, 4, 16, 16);
/// let payload = pool
///     .checkout(PayloadHeader::new(0, Duration::ZERO, shape))
///     .unwrap();
/// assert_eq!(pool.available(), 3);
/// drop(payload);
/// assert_eq!(pool.available(), 4);
/// ```
pub struct BufferPool<T: Copy> {
    inner: Arc<PoolInner<T>>,
    slot_len: usize,
    policy: CheckoutPolicy,
}

impl<T: Copy> BufferPool<T> {
    /// Create a pool of `capacity` buffers of `slot_len` elements each.
    pub fn new(capacity: usize, slot_len: usize, policy: CheckoutPolicy) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::AllocationFailed(
                "pool capacity must be greater than 0".into(),
            ));
        }

        let slots = (0..capacity)
            .map(|_| {
                Ok(Slot {
                    refs: AtomicU32::new(0),
                    buf: UnsafeCell::new(AlignedBuffer::new(slot_len)?),
                })
            })
            .collect::<Result<Vec<_>>>()?
            .into_boxed_slice();

        Ok(Self {
            inner: Arc::new(PoolInner {
                slots,
                free_lock: Mutex::new(()),
                on_free: Condvar::new(),
            }),
            slot_len,
            policy,
        })
    }

    /// Claim one free buffer, attaching `header` to the resulting payload.
    ///
    /// Never hands out a slot whose refcount is nonzero. On exhaustion the
    /// pool's [`CheckoutPolicy`] decides between an immediate
    /// [`Error::PoolExhausted`] and a bounded wait for a release.
    pub fn checkout(&self, header: PayloadHeader) -> Result<Payload<T>> {
        debug_assert!(
            header.shape.len() <= self.slot_len,
            "payload shape exceeds slot length"
        );

        if let Some(idx) = self.try_claim() {
            return Ok(Payload::from_slot(Arc::clone(&self.inner), idx, header));
        }

        match self.policy {
            CheckoutPolicy::FailFast => Err(Error::PoolExhausted),
            CheckoutPolicy::Wait(limit) => {
                let deadline = Instant::now() + limit;
                let mut guard = self.inner.free_lock.lock().unwrap();
                loop {
                    // Re-scan under the pairing lock; a release may have
                    // signalled between the scan and the wait.
                    if let Some(idx) = self.try_claim() {
                        return Ok(Payload::from_slot(Arc::clone(&self.inner), idx, header));
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::PoolExhausted);
                    }
                    let (g, _timeout) = self
                        .inner
                        .on_free
                        .wait_timeout(guard, deadline - now)
                        .unwrap();
                    guard = g;
                }
            }
        }
    }

    fn try_claim(&self) -> Option<usize> {
        for (idx, slot) in self.inner.slots.iter().enumerate() {
            if slot
                .refs
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return Some(idx);
            }
        }
        None
    }

    /// Configured slot count.
    pub fn capacity(&self) -> usize {
        self.inner.slots.len()
    }

    /// Elements per slot.
    pub fn slot_len(&self) -> usize {
        self.slot_len
    }

    /// Free slots right now (a snapshot; may change immediately).
    pub fn available(&self) -> usize {
        self.inner
            .slots
            .iter()
            .filter(|s| s.refs.load(Ordering::Relaxed) == 0)
            .count()
    }

    /// Wait until every outstanding checkout has been released.
    ///
    /// Part of shutdown: the pool must not be torn down while payloads are
    /// still in flight. Returns an error if the timeout expires first.
    pub fn drain(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.free_lock.lock().unwrap();
        loop {
            if self.available() == self.capacity() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::DeviceFault {
                    device: u32::MAX,
                    reason: format!(
                        "pool drain timed out with {} of {} slots still checked out",
                        self.capacity() - self.available(),
                        self.capacity()
                    ),
                });
            }
            let (g, _timeout) = self
                .inner
                .on_free
                .wait_timeout(guard, deadline - now)
                .unwrap();
            guard = g;
        }
    }
}
