//! Gridding correlator.

use std::ops::Range;
use std::sync::Arc;

use tracing::warn;

use crate::config::{CorrelatorDesc, NPOL_PRODUCTS, SAMPLE_LANES};
use crate::error::{Error, Result};
use crate::gridding::{antenna_grid, bf16_round, KernelLut};
use crate::header::{CubeShape, PayloadHeader};
use crate::memory::BufferPool;
use crate::payload::Payload;
use crate::stage::{StageKind, TransformStage};

/// Transforms one gulp of raw dual-pol antenna samples into a multi-channel
/// image cube by convolutional gridding.
///
/// One correlator instance is pinned to one device; its descriptor is
/// immutable for the stage's lifetime. Channel groups are partitioned
/// across `nstreams` concurrent execution streams, each writing a disjoint
/// slice of the output cube.
///
/// Failure semantics are drop-and-continue: a malformed window or an
/// exhausted output pool skips the gulp (`Ok(None)`), it never kills the
/// stage.
pub struct GriddingCorrelator {
    desc: CorrelatorDesc,
    lut: KernelLut,
    antennas: Vec<(f32, f32)>,
    out_pool: Arc<BufferPool<f32>>,
    gulp_shape: CubeShape,
    cube_shape: CubeShape,
    skipped: u64,
}

impl GriddingCorrelator {
    /// Build a correlator for one device from its immutable descriptor.
    pub fn new(desc: CorrelatorDesc, out_pool: Arc<BufferPool<f32>>) -> Result<Self> {
        let size = desc.image_size as usize;
        let cube_shape = CubeShape::new(desc.nchan_out as usize, NPOL_PRODUCTS, size, size);
        if out_pool.slot_len() < cube_shape.len() {
            return Err(Error::AllocationFailed(format!(
                "output pool slots hold {} elements but a cube needs {}",
                out_pool.slot_len(),
                cube_shape.len()
            )));
        }

        let gulp_shape = CubeShape::new(
            desc.nseq_per_gulp as usize,
            desc.nchan_out as usize,
            desc.nant as usize,
            SAMPLE_LANES,
        );

        let lut = KernelLut::from_desc(&desc);
        let antennas = antenna_grid(desc.nant as usize, size);

        Ok(Self {
            desc,
            lut,
            antennas,
            out_pool,
            gulp_shape,
            cube_shape,
            skipped: 0,
        })
    }

    /// The device this instance is pinned to.
    pub fn device_id(&self) -> u32 {
        self.desc.device_id
    }

    /// Windows dropped so far (short input or pool exhaustion).
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Grid `chans` of the gulp into `out`, one `(pol, row, col)` block per
    /// channel. Runs on one execution stream.
    fn grid_channels(&self, raw: &[u8], chans: Range<usize>, out: &mut [f32]) {
        let nseq = self.desc.nseq_per_gulp as usize;
        let nant = self.desc.nant as usize;
        let size = self.desc.image_size as usize;
        let plane = size * size;
        let dim = self.lut.dim();
        let half = (dim / 2) as isize;
        let bf16 = self.desc.use_bf16_accum;
        let stride = self.cube_shape.chan_stride();

        for (ci, chan) in chans.enumerate() {
            let cube = &mut out[ci * stride..(ci + 1) * stride];
            for seq in 0..nseq {
                for (ant, &(px, py)) in self.antennas.iter().enumerate() {
                    let base = self.gulp_shape.index(seq, chan, ant, 0);
                    let xr = raw[base] as i8 as f32;
                    let xi = raw[base + 1] as i8 as f32;
                    let yr = raw[base + 2] as i8 as f32;
                    let yi = raw[base + 3] as i8 as f32;

                    let prods = [
                        xr * xr + xi * xi,           // XX
                        yr * yr + yi * yi,           // YY
                        xr * yr + xi * yi,           // Re(X * conj(Y))
                        xi * yr - xr * yi,           // Im(X * conj(Y))
                    ];

                    let cx = px.round();
                    let cy = py.round();
                    let fp = self.lut.footprint(py - cy, px - cx);

                    for ty in 0..dim {
                        let y = cy as isize + ty as isize - half;
                        if y < 0 || y >= size as isize {
                            continue;
                        }
                        for tx in 0..dim {
                            let x = cx as isize + tx as isize - half;
                            if x < 0 || x >= size as isize {
                                continue;
                            }
                            let w = fp[ty * dim + tx];
                            let pix = y as usize * size + x as usize;
                            for (p, &v) in prods.iter().enumerate() {
                                let idx = p * plane + pix;
                                let acc = cube[idx] + w * v;
                                cube[idx] = if bf16 { bf16_round(acc) } else { acc };
                            }
                        }
                    }
                }
            }
        }
    }
}

impl TransformStage for GriddingCorrelator {
    type Input = Payload<u8>;
    type Output = Payload<f32>;

    fn transform(&mut self, gulp: Payload<u8>) -> Result<Option<Payload<f32>>> {
        if !gulp.header().valid {
            self.skipped += 1;
            warn!(
                device = self.desc.device_id,
                seq = gulp.header().sequence,
                "dropping invalid gulp"
            );
            return Ok(None);
        }

        let expected = self.gulp_shape.len();
        if gulp.header().shape != self.gulp_shape || gulp.len() < expected {
            self.skipped += 1;
            warn!(
                device = self.desc.device_id,
                seq = gulp.header().sequence,
                expected,
                got = gulp.len(),
                "dropping short or misshapen gulp"
            );
            return Ok(None);
        }

        let header = PayloadHeader::new(
            gulp.header().sequence,
            gulp.header().start_time,
            self.cube_shape,
        );
        let mut out = match self.out_pool.checkout(header) {
            Ok(p) => p,
            Err(Error::PoolExhausted) => {
                self.skipped += 1;
                warn!(
                    device = self.desc.device_id,
                    seq = gulp.header().sequence,
                    "cube pool exhausted, dropping gulp"
                );
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let raw = &gulp.as_slice()[..expected];
        let cube_len = self.cube_shape.len();
        let out_slice = &mut out
            .as_mut_slice()
            .expect("fresh checkout has a unique handle")[..cube_len];
        // Pool slots are recycled without zeroing.
        out_slice.fill(0.0);

        let nchan = self.desc.nchan_out as usize;
        let nstreams = (self.desc.nstreams as usize).min(nchan);
        let stride = self.cube_shape.chan_stride();
        let per_stream = nchan / nstreams;
        let extra = nchan % nstreams;

        let this = &*self;
        std::thread::scope(|s| {
            let mut rest = out_slice;
            let mut chan0 = 0usize;
            for stream in 0..nstreams {
                let nch = per_stream + usize::from(stream < extra);
                let (head, tail) = rest.split_at_mut(nch * stride);
                rest = tail;
                let range = chan0..chan0 + nch;
                chan0 += nch;
                s.spawn(move || this.grid_channels(raw, range, head));
            }
        });

        Ok(Some(out))
    }

    fn kind(&self) -> StageKind {
        StageKind::Correlator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ImagerConfig, ValidatedConfig};
    use crate::device::HostProbe;
    use crate::memory::CheckoutPolicy;
    use std::time::Duration;

    fn config() -> ValidatedConfig {
        ImagerConfig {
            image_size: 64,
            nseq_per_gulp: 8,
            seq_accum_ms: 40,
            nchan_out: 4,
            chan_nbin: 1,
            support: 1,
            nstreams: 2,
            nant: 4,
            ..ImagerConfig::default()
        }
        .validate(&HostProbe::default())
        .unwrap()
    }

    fn make_gulp(cfg: &ValidatedConfig, pool: &BufferPool<u8>, seq: u64, fill: u8) -> Payload<u8> {
        let shape = cfg.gulp_shape();
        let header = PayloadHeader::new(seq, Duration::ZERO, shape);
        let mut p = pool.checkout(header).unwrap();
        p.as_mut_slice().unwrap()[..shape.len()].fill(fill);
        p
    }

    fn pools(cfg: &ValidatedConfig) -> (BufferPool<u8>, Arc<BufferPool<f32>>) {
        let raw = BufferPool::new(4, cfg.gulp_shape().len(), CheckoutPolicy::FailFast).unwrap();
        let cube = Arc::new(
            BufferPool::new(4, cfg.cube_shape().len(), CheckoutPolicy::FailFast).unwrap(),
        );
        (raw, cube)
    }

    #[test]
    fn test_single_tap_is_direct_binning() {
        let cfg = config();
        let (raw_pool, cube_pool) = pools(&cfg);
        let mut corr =
            GriddingCorrelator::new(cfg.correlator_desc(0), Arc::clone(&cube_pool)).unwrap();

        // All-ones samples: X = Y = 1 + 1i, so XX = YY = Re(XY) = 2, Im = 0.
        let gulp = make_gulp(&cfg, &raw_pool, 3, 1);
        let cube = corr.transform(gulp).unwrap().expect("cube emitted");
        assert_eq!(cube.header().sequence, 3);
        assert_eq!(cube.header().shape, cfg.cube_shape());

        let shape = cfg.cube_shape();
        let data = cube.as_slice();
        let nseq = 8.0f32;
        let positions = antenna_grid(4, 64);

        for chan in 0..shape.nchan {
            // Flux conservation: every sample lands on exactly one pixel.
            let xx_plane =
                &data[shape.index(chan, 0, 0, 0)..shape.index(chan, 0, 0, 0) + 64 * 64];
            let total: f32 = xx_plane.iter().sum();
            assert!((total - nseq * 4.0 * 2.0).abs() < 1e-3, "total {total}");

            for &(x, y) in &positions {
                let pix = shape.index(chan, 0, y.round() as usize, x.round() as usize);
                assert!((data[pix] - nseq * 2.0).abs() < 1e-3);
                // Im(XY) stays zero for identical pols.
                let pix_im = shape.index(chan, 3, y.round() as usize, x.round() as usize);
                assert!(data[pix_im].abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_bf16_matches_f32_for_small_integers() {
        let cfg = config();
        let (raw_pool, cube_pool) = pools(&cfg);

        let mut desc = cfg.correlator_desc(0);
        let mut corr_f32 =
            GriddingCorrelator::new(desc.clone(), Arc::clone(&cube_pool)).unwrap();
        desc.use_bf16_accum = true;
        let mut corr_bf16 = GriddingCorrelator::new(desc, Arc::clone(&cube_pool)).unwrap();

        let a = corr_f32
            .transform(make_gulp(&cfg, &raw_pool, 0, 1))
            .unwrap()
            .unwrap();
        let b = corr_bf16
            .transform(make_gulp(&cfg, &raw_pool, 0, 1))
            .unwrap()
            .unwrap();
        // Sums of small integers are exactly representable in bf16.
        assert_eq!(a.as_slice()[..cfg.cube_shape().len()], b.as_slice()[..cfg.cube_shape().len()]);
    }

    #[test]
    fn test_misshapen_gulp_is_skipped() {
        let cfg = config();
        let (raw_pool, cube_pool) = pools(&cfg);
        let mut corr =
            GriddingCorrelator::new(cfg.correlator_desc(0), Arc::clone(&cube_pool)).unwrap();

        let mut gulp = make_gulp(&cfg, &raw_pool, 0, 1);
        gulp.header_mut().shape = CubeShape::new(1, 1, 1, 1);
        assert!(corr.transform(gulp).unwrap().is_none());
        assert_eq!(corr.skipped(), 1);
    }

    #[test]
    fn test_pool_exhaustion_skips_not_errors() {
        let cfg = config();
        let raw_pool =
            BufferPool::new(2, cfg.gulp_shape().len(), CheckoutPolicy::FailFast).unwrap();
        let cube_pool = Arc::new(
            BufferPool::new(1, cfg.cube_shape().len(), CheckoutPolicy::FailFast).unwrap(),
        );
        let mut corr =
            GriddingCorrelator::new(cfg.correlator_desc(0), Arc::clone(&cube_pool)).unwrap();

        let first = corr
            .transform(make_gulp(&cfg, &raw_pool, 0, 1))
            .unwrap()
            .expect("first cube");
        // Pool of one is now empty; the next gulp must be dropped, not fail.
        let second = corr.transform(make_gulp(&cfg, &raw_pool, 1, 1)).unwrap();
        assert!(second.is_none());
        assert_eq!(corr.skipped(), 1);
        drop(first);
    }
}
