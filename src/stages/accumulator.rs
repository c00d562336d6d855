//! Fixed-count image accumulation.

use std::sync::Arc;

use tracing::warn;

use crate::error::{Error, Result};
use crate::header::CubeShape;
use crate::memory::BufferPool;
use crate::payload::Payload;
use crate::stage::{StageKind, TransformStage};

/// Sums a fixed number of consecutive cubes into one, trading time
/// resolution for sensitivity before anything is persisted.
///
/// The running sum lives in a slot checked out from the output pool and
/// held across calls; each input cube is added in place and released. When
/// `nimg` cubes have landed the sum is emitted and a fresh slot starts the
/// next window. An end-of-stream [`flush`](Self::flush) hands back a
/// partial sum with its header marked invalid so downstream sinks can tell
/// it apart from a complete window.
pub struct Accumulator {
    nimg: u32,
    shape: CubeShape,
    out_pool: Arc<BufferPool<f32>>,
    current: Option<Payload<f32>>,
    count: u32,
    skipped: u64,
}

impl Accumulator {
    /// An accumulator over windows of `nimg` cubes of `shape`.
    pub fn new(shape: CubeShape, nimg: u32, out_pool: Arc<BufferPool<f32>>) -> Result<Self> {
        if nimg == 0 {
            return Err(Error::AllocationFailed(
                "accumulation window must cover at least one image".into(),
            ));
        }
        if out_pool.slot_len() < shape.len() {
            return Err(Error::AllocationFailed(format!(
                "accumulator pool slots hold {} elements but a cube needs {}",
                out_pool.slot_len(),
                shape.len()
            )));
        }
        Ok(Self {
            nimg,
            shape,
            out_pool,
            current: None,
            count: 0,
            skipped: 0,
        })
    }

    /// Emit the partial window, if any. The emitted header is invalidated.
    pub fn flush(&mut self) -> Option<Payload<f32>> {
        self.count = 0;
        let mut partial = self.current.take()?;
        partial.header_mut().invalidate();
        Some(partial)
    }

    /// Cubes dropped so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl TransformStage for Accumulator {
    type Input = Payload<f32>;
    type Output = Payload<f32>;

    fn transform(&mut self, cube: Payload<f32>) -> Result<Option<Payload<f32>>> {
        if !cube.header().valid || cube.header().shape != self.shape {
            self.skipped += 1;
            warn!(seq = cube.header().sequence, "dropping misshapen cube");
            return Ok(None);
        }

        let len = self.shape.len();
        if self.current.is_none() {
            // Window opens with the first cube's identity.
            let mut sum = match self.out_pool.checkout(cube.header().clone()) {
                Ok(p) => p,
                Err(Error::PoolExhausted) => {
                    self.skipped += 1;
                    warn!(
                        seq = cube.header().sequence,
                        "accumulator pool exhausted, dropping cube"
                    );
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };
            sum.as_mut_slice()
                .expect("fresh checkout has a unique handle")[..len]
                .copy_from_slice(&cube.as_slice()[..len]);
            self.current = Some(sum);
            self.count = 1;
        } else if let Some(sum) = self.current.as_mut() {
            let dst = &mut sum
                .as_mut_slice()
                .expect("running sum is never cloned")[..len];
            for (d, s) in dst.iter_mut().zip(&cube.as_slice()[..len]) {
                *d += s;
            }
            self.count += 1;
        }

        if self.count == self.nimg {
            self.count = 0;
            return Ok(self.current.take());
        }
        Ok(None)
    }

    fn kind(&self) -> StageKind {
        StageKind::Accumulator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::PayloadHeader;
    use crate::memory::CheckoutPolicy;
    use std::time::Duration;

    fn shape() -> CubeShape {
        CubeShape::new(2, 2, 4, 4)
    }

    fn cube(pool: &BufferPool<f32>, seq: u64, value: f32) -> Payload<f32> {
        let mut p = pool
            .checkout(PayloadHeader::new(
                seq,
                Duration::from_millis(seq * 10),
                shape(),
            ))
            .unwrap();
        p.as_mut_slice().unwrap()[..shape().len()].fill(value);
        p
    }

    fn pools() -> (BufferPool<f32>, Arc<BufferPool<f32>>) {
        let len = shape().len();
        (
            BufferPool::new(4, len, CheckoutPolicy::FailFast).unwrap(),
            Arc::new(BufferPool::new(2, len, CheckoutPolicy::FailFast).unwrap()),
        )
    }

    #[test]
    fn test_emits_sum_after_window_fills() {
        let (in_pool, out_pool) = pools();
        let mut acc = Accumulator::new(shape(), 3, out_pool).unwrap();

        assert!(acc.transform(cube(&in_pool, 0, 1.0)).unwrap().is_none());
        assert!(acc.transform(cube(&in_pool, 1, 2.0)).unwrap().is_none());
        let sum = acc
            .transform(cube(&in_pool, 2, 3.0))
            .unwrap()
            .expect("window complete");

        // Header carries the first contributor's identity.
        assert_eq!(sum.header().sequence, 0);
        assert_eq!(sum.header().start_time, Duration::ZERO);
        assert!(sum.header().valid);
        assert!(sum.as_slice()[..shape().len()].iter().all(|&v| v == 6.0));

        // All input slots went home.
        assert_eq!(in_pool.available(), 4);
    }

    #[test]
    fn test_windows_do_not_bleed() {
        let (in_pool, out_pool) = pools();
        let mut acc = Accumulator::new(shape(), 2, out_pool).unwrap();

        let first = acc.transform(cube(&in_pool, 0, 1.0)).unwrap();
        assert!(first.is_none());
        let a = acc.transform(cube(&in_pool, 1, 1.0)).unwrap().unwrap();
        assert!(a.as_slice()[0] == 2.0);

        let b = {
            acc.transform(cube(&in_pool, 2, 5.0)).unwrap();
            acc.transform(cube(&in_pool, 3, 5.0)).unwrap().unwrap()
        };
        assert_eq!(b.header().sequence, 2);
        assert!(b.as_slice()[0] == 10.0);
    }

    #[test]
    fn test_flush_marks_partial_invalid() {
        let (in_pool, out_pool) = pools();
        let mut acc = Accumulator::new(shape(), 4, out_pool).unwrap();

        acc.transform(cube(&in_pool, 7, 2.0)).unwrap();
        let partial = acc.flush().expect("partial window");
        assert!(!partial.header().valid);
        assert_eq!(partial.header().sequence, 7);
        assert!(acc.flush().is_none());
    }

    #[test]
    fn test_invalid_input_skipped() {
        let (in_pool, out_pool) = pools();
        let mut acc = Accumulator::new(shape(), 2, out_pool).unwrap();

        let mut bad = cube(&in_pool, 0, 1.0);
        bad.header_mut().invalidate();
        assert!(acc.transform(bad).unwrap().is_none());
        assert_eq!(acc.skipped(), 1);
        // The window never opened.
        assert!(acc.flush().is_none());
    }
}
