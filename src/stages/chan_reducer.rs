//! Adjacent-channel binner.

use std::sync::Arc;

use tracing::warn;

use crate::error::{Error, Result};
use crate::header::{CubeShape, PayloadHeader};
use crate::memory::BufferPool;
use crate::payload::Payload;
use crate::stage::{StageKind, TransformStage};

/// Sums groups of `nbin` adjacent channels of a correlated cube into one
/// output channel each, shrinking the cube by the binning factor while
/// leaving the polarization planes and pixel grid untouched. Summation
/// keeps total flux, matching the accumulator's convention downstream.
///
/// With `nbin == 1` the stage still copies into a fresh slot so the input
/// cube can be released back to its pool immediately.
pub struct ChanReducer {
    nbin: usize,
    in_shape: CubeShape,
    out_shape: CubeShape,
    out_pool: Arc<BufferPool<f32>>,
    skipped: u64,
}

impl ChanReducer {
    /// A reducer from `in_shape` to `in_shape.nchan / nbin` channels.
    ///
    /// The channel count must divide evenly; validation guarantees it for
    /// configs that reach stage construction.
    pub fn new(
        in_shape: CubeShape,
        nbin: usize,
        out_pool: Arc<BufferPool<f32>>,
    ) -> Result<Self> {
        if nbin == 0 || in_shape.nchan % nbin != 0 {
            return Err(Error::AllocationFailed(format!(
                "{} channels do not bin by {nbin}",
                in_shape.nchan
            )));
        }
        let out_shape = CubeShape::new(
            in_shape.nchan / nbin,
            in_shape.npol,
            in_shape.nrow,
            in_shape.ncol,
        );
        if out_pool.slot_len() < out_shape.len() {
            return Err(Error::AllocationFailed(format!(
                "reduced pool slots hold {} elements but a cube needs {}",
                out_pool.slot_len(),
                out_shape.len()
            )));
        }
        Ok(Self {
            nbin,
            in_shape,
            out_shape,
            out_pool,
            skipped: 0,
        })
    }

    /// Windows dropped so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}

impl TransformStage for ChanReducer {
    type Input = Payload<f32>;
    type Output = Payload<f32>;

    fn transform(&mut self, cube: Payload<f32>) -> Result<Option<Payload<f32>>> {
        if !cube.header().valid || cube.header().shape != self.in_shape {
            self.skipped += 1;
            warn!(seq = cube.header().sequence, "dropping misshapen cube");
            return Ok(None);
        }

        let header = PayloadHeader::new(
            cube.header().sequence,
            cube.header().start_time,
            self.out_shape,
        );
        let mut out = match self.out_pool.checkout(header) {
            Ok(p) => p,
            Err(Error::PoolExhausted) => {
                self.skipped += 1;
                warn!(seq = cube.header().sequence, "reduced pool exhausted, dropping cube");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let stride = self.in_shape.chan_stride();
        let input = &cube.as_slice()[..self.in_shape.len()];
        let output = &mut out
            .as_mut_slice()
            .expect("fresh checkout has a unique handle")[..self.out_shape.len()];

        for (oc, dst) in output.chunks_exact_mut(stride).enumerate() {
            let group = &input[oc * self.nbin * stride..(oc + 1) * self.nbin * stride];
            let (first, rest) = group.split_at(stride);
            dst.copy_from_slice(first);
            for chan in rest.chunks_exact(stride) {
                for (d, s) in dst.iter_mut().zip(chan) {
                    *d += s;
                }
            }
        }

        Ok(Some(out))
    }

    fn kind(&self) -> StageKind {
        StageKind::ChanReducer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::CheckoutPolicy;
    use std::time::Duration;

    fn cube_payload(pool: &BufferPool<f32>, shape: CubeShape, seq: u64) -> Payload<f32> {
        let header = PayloadHeader::new(seq, Duration::ZERO, shape);
        let mut p = pool.checkout(header).unwrap();
        let data = p.as_mut_slice().unwrap();
        // Channel c holds the constant value c + 1.
        for c in 0..shape.nchan {
            data[c * shape.chan_stride()..(c + 1) * shape.chan_stride()]
                .fill((c + 1) as f32);
        }
        p
    }

    #[test]
    fn test_binning_sums_adjacent_channels() {
        let shape = CubeShape::new(4, 2, 4, 4);
        let in_pool = BufferPool::new(2, shape.len(), CheckoutPolicy::FailFast).unwrap();
        let out_pool =
            Arc::new(BufferPool::new(2, shape.len() / 2, CheckoutPolicy::FailFast).unwrap());
        let mut reducer = ChanReducer::new(shape, 2, out_pool).unwrap();

        let reduced = reducer
            .transform(cube_payload(&in_pool, shape, 9))
            .unwrap()
            .expect("reduced cube");
        assert_eq!(reduced.header().sequence, 9);
        assert_eq!(reduced.header().shape.nchan, 2);

        let stride = reduced.header().shape.chan_stride();
        let data = reduced.as_slice();
        // 1 + 2 and 3 + 4.
        assert!(data[..stride].iter().all(|&v| (v - 3.0).abs() < 1e-6));
        assert!(data[stride..2 * stride].iter().all(|&v| (v - 7.0).abs() < 1e-6));
    }

    #[test]
    fn test_ramp_reduction_128_by_4() {
        let shape = CubeShape::new(128, 4, 8, 8);
        let in_pool = BufferPool::new(1, shape.len(), CheckoutPolicy::FailFast).unwrap();
        let out_pool =
            Arc::new(BufferPool::new(1, shape.len() / 4, CheckoutPolicy::FailFast).unwrap());
        let mut reducer = ChanReducer::new(shape, 4, out_pool).unwrap();

        let reduced = reducer
            .transform(cube_payload(&in_pool, shape, 0))
            .unwrap()
            .expect("reduced cube");
        let out_shape = reduced.header().shape;
        assert_eq!(out_shape.nchan, 32);

        let stride = out_shape.chan_stride();
        let data = reduced.as_slice();
        for oc in 0..32usize {
            // Channel c held c + 1 everywhere, so the bin of 4 sums to
            // (4c+1) + .. + (4c+4).
            let expected: f32 = (0..4).map(|i| (4 * oc + i + 1) as f32).sum();
            assert!(data[oc * stride..(oc + 1) * stride]
                .iter()
                .all(|&v| (v - expected).abs() < 1e-4));
        }
    }

    #[test]
    fn test_nbin_one_copies() {
        let shape = CubeShape::new(2, 2, 4, 4);
        let in_pool = BufferPool::new(1, shape.len(), CheckoutPolicy::FailFast).unwrap();
        let out_pool =
            Arc::new(BufferPool::new(1, shape.len(), CheckoutPolicy::FailFast).unwrap());
        let mut reducer = ChanReducer::new(shape, 1, out_pool).unwrap();

        let input = cube_payload(&in_pool, shape, 0);
        let expected: Vec<f32> = input.as_slice()[..shape.len()].to_vec();
        let out = reducer.transform(input).unwrap().expect("copied cube");
        assert_eq!(&out.as_slice()[..shape.len()], expected.as_slice());
        // Input slot went back to its pool.
        assert_eq!(in_pool.available(), 1);
    }

    #[test]
    fn test_uneven_bin_rejected_at_construction() {
        let shape = CubeShape::new(3, 2, 4, 4);
        let out_pool =
            Arc::new(BufferPool::new(1, shape.len(), CheckoutPolicy::FailFast).unwrap());
        assert!(ChanReducer::new(shape, 2, out_pool).is_err());
    }

    #[test]
    fn test_invalid_cube_skipped() {
        let shape = CubeShape::new(2, 2, 4, 4);
        let in_pool = BufferPool::new(1, shape.len(), CheckoutPolicy::FailFast).unwrap();
        let out_pool =
            Arc::new(BufferPool::new(1, shape.len(), CheckoutPolicy::FailFast).unwrap());
        let mut reducer = ChanReducer::new(shape, 2, out_pool).unwrap();

        let mut cube = cube_payload(&in_pool, shape, 0);
        cube.header_mut().invalidate();
        assert!(reducer.transform(cube).unwrap().is_none());
        assert_eq!(reducer.skipped(), 1);
    }
}
