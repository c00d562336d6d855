//! Pooled memory for zero-copy payload passing.
//!
//! The buffer pool is the only structure shared across stage boundaries:
//! stages check buffers out, hand them downstream inside
//! [`crate::payload::Payload`] handles, and the last handle dropped returns
//! the slot to the pool. No component frees memory directly.
//!
//! - [`AlignedBuffer`]: fixed-size, alignment-guaranteed element storage
//! - [`BufferPool`]: lock-free refcounted slot set with a checkout policy
//! - [`CheckoutPolicy`]: fail-fast vs bounded-wait on exhaustion

mod aligned;
mod pool;

pub use aligned::AlignedBuffer;
pub use pool::{BufferPool, CheckoutPolicy};

pub(crate) use pool::PoolInner;
