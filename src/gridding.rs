//! Gridding convolution function (GCF) lookup tables and array geometry.
//!
//! The correlator spreads each antenna sample onto nearby grid pixels using
//! a finite-support kernel. The kernel is precomputed into an oversampled
//! lookup table at startup: one normalized footprint per sub-pixel offset,
//! so the hot path is a table walk, not a transcendental per tap.

use crate::config::CorrelatorDesc;

/// Precomputed, oversampled gridding kernel.
///
/// The footprint spans `2 * support - 1` taps per axis, so a support of 1
/// is a single tap and gridding degenerates to direct binning. Each
/// footprint is normalized to deposit unit total weight, which keeps total
/// flux per sample independent of support and sub-pixel position.
pub struct KernelLut {
    support: usize,
    oversample: usize,
    dim: usize,
    /// `oversample^2` footprints of `dim^2` weights each, indexed
    /// `((oy * oversample) + ox) * dim^2`.
    weights: Vec<f32>,
}

impl KernelLut {
    /// Build the table from a correlator descriptor.
    pub fn from_desc(desc: &CorrelatorDesc) -> Self {
        Self::new(
            desc.support_size as usize,
            desc.kernel_oversampling_factor as usize,
            // Taper width in pixels: physical radius (decimeters) against
            // the angular resolution of the grid.
            (desc.gcf_kernel_dim / 10.0) / (2.0 * desc.grid_res_deg.max(f32::EPSILON)),
        )
    }

    /// Build a table with `support` half-width, `oversample` sub-pixel bins
    /// per axis and a Gaussian taper of `sigma_pix` pixels.
    pub fn new(support: usize, oversample: usize, sigma_pix: f32) -> Self {
        assert!(support >= 1 && oversample >= 1);
        let dim = 2 * support - 1;
        let sigma = sigma_pix.max(0.25);
        let inv_two_sigma_sq = 1.0 / (2.0 * sigma * sigma);
        let center = (support - 1) as f32;

        let mut weights = Vec::with_capacity(oversample * oversample * dim * dim);
        for oy in 0..oversample {
            for ox in 0..oversample {
                // Sub-pixel offset of the sample relative to the center tap,
                // in [-0.5, 0.5).
                let fy = (oy as f32 + 0.5) / oversample as f32 - 0.5;
                let fx = (ox as f32 + 0.5) / oversample as f32 - 0.5;

                let start = weights.len();
                let mut sum = 0.0f32;
                for ty in 0..dim {
                    for tx in 0..dim {
                        let dy = ty as f32 - center - fy;
                        let dx = tx as f32 - center - fx;
                        let w = (-(dy * dy + dx * dx) * inv_two_sigma_sq).exp();
                        weights.push(w);
                        sum += w;
                    }
                }
                for w in &mut weights[start..] {
                    *w /= sum;
                }
            }
        }

        Self {
            support,
            oversample,
            dim,
            weights,
        }
    }

    /// Kernel half-width in pixels.
    pub fn support(&self) -> usize {
        self.support
    }

    /// Taps per footprint axis.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// The normalized footprint for a sample at fractional offset
    /// `(fy, fx)` from its nearest pixel, both in [-0.5, 0.5).
    pub fn footprint(&self, fy: f32, fx: f32) -> &[f32] {
        let oy = self.sub_bin(fy);
        let ox = self.sub_bin(fx);
        let block = self.dim * self.dim;
        let idx = (oy * self.oversample + ox) * block;
        &self.weights[idx..idx + block]
    }

    fn sub_bin(&self, frac: f32) -> usize {
        let bin = ((frac + 0.5) * self.oversample as f32) as isize;
        bin.clamp(0, self.oversample as isize - 1) as usize
    }
}

/// Deterministic station layout in grid-pixel coordinates.
///
/// Stations sit on a coarse lattice inset from the image edge, so every
/// kernel footprint of reasonable support lands inside the grid. The real
/// array feed supplies measured positions through the same shape of data.
pub fn antenna_grid(nant: usize, image_size: usize) -> Vec<(f32, f32)> {
    let side = (nant as f32).sqrt().ceil() as usize;
    let spacing = image_size as f32 / (side + 1) as f32;
    (0..nant)
        .map(|i| {
            let row = i / side;
            let col = i % side;
            (
                (col + 1) as f32 * spacing,
                (row + 1) as f32 * spacing,
            )
        })
        .collect()
}

/// Round an f32 through bf16 storage precision (truncate to the top 16
/// bits). Used for the reduced-precision accumulation path.
#[inline]
pub fn bf16_round(v: f32) -> f32 {
    f32::from_bits(v.to_bits() & 0xffff_0000)
}
