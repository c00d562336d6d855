//! Imager configuration and startup validation.
//!
//! All knobs are checked once, before any pool or stage is constructed.
//! Invalid combinations reject startup with a specific message; nothing in
//! the running pipeline re-validates. A successful validation yields a
//! [`ValidatedConfig`], the only type the stage factories accept.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::device::{DeviceInventory, DeviceProbe};
use crate::header::CubeShape;

/// Fixed sequence cadence of the upstream F-engine, microseconds.
pub const SEQ_CADENCE_US: u64 = 40;

/// Polarization products per imaged pixel: XX, YY, Re(XY), Im(XY).
pub const NPOL_PRODUCTS: usize = 4;

/// Sample lanes per antenna per sequence: X re/im, Y re/im as signed bytes.
pub const SAMPLE_LANES: usize = 4;

/// A configuration rejection, produced before any resource is allocated.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Port outside the accepted range.
    #[error("invalid port number: {0}. Port must be in 1-32768")]
    InvalidPort(u16),

    /// Image size other than the two supported grids.
    #[error("invalid image size: {0}. Image size can only be 64 or 128")]
    InvalidImageSize(u32),

    /// Pixel resolution must be positive.
    #[error("invalid image resolution: {0} deg. Resolution must be positive")]
    InvalidImageRes(f32),

    /// Sequences per gulp must be positive.
    #[error("the number of sequences per gulp must be at least 1")]
    NoSequences,

    /// Accumulation window shorter than one gulp.
    #[error(
        "sequence accumulation time ({accum_ms} ms) must be greater than the gulp size ({gulp_ms} ms)"
    )]
    AccumTooShort {
        /// Configured accumulation window in milliseconds.
        accum_ms: u32,
        /// Duration of one gulp in milliseconds.
        gulp_ms: u32,
    },

    /// At least one image to accumulate.
    #[error("the number of images to accumulate must be at least 1")]
    NoImagesToAccum,

    /// Channel count must be positive.
    #[error("the number of output channels must be at least 1")]
    NoChannels,

    /// Channel count beyond what the device supports.
    #[error("device {device} only supports output channels up to {cap}, requested {requested}")]
    TooManyChannels {
        /// Device the cap came from.
        device: u32,
        /// Device channel cap.
        cap: u32,
        /// Requested channel count.
        requested: u32,
    },

    /// Antenna effective area must be positive.
    #[error("antenna effective area cannot be smaller than or equal to zero: {0}")]
    InvalidAeff(f32),

    /// Support size must be a power of two within the device bound.
    #[error(
        "invalid support size: {support}. Support must be a power of two no larger than {max}"
    )]
    InvalidSupport {
        /// Requested support size.
        support: u32,
        /// Device-supported maximum.
        max: u32,
    },

    /// Kernel oversampling factor must be a power of two.
    #[error("kernel oversampling factor must be a power of 2, got {0}")]
    OversampleNotPow2(u32),

    /// Channel count not divisible by the binning factor.
    #[error(
        "number of channels ({channels}) must be an integral multiple of the binning factor ({nbin})"
    )]
    ChannelsNotDivisible {
        /// Output channel count.
        channels: u32,
        /// Binning factor.
        nbin: u32,
    },

    /// Stream count must be positive.
    #[error("the number of streams must be greater than 0")]
    NoStreams,

    /// Requested more devices than available.
    #[error("requested {requested} gpu(s) but only {available} available")]
    TooManyGpus {
        /// Requested device count.
        requested: u32,
        /// Devices actually present.
        available: u32,
    },

    /// Device count must be positive.
    #[error("ngpus must be greater than 0")]
    NoGpus,

    /// Offline mode needs a recording to read.
    #[error("offline mode requires a recorded data file path")]
    OfflineWithoutFile,

    /// Array must have at least one antenna.
    #[error("the antenna count must be at least 1")]
    NoAntennas,
}

/// Full configuration surface of the imager.
///
/// Field names follow the operator-facing option names; see the field docs
/// for the constraint each one must satisfy.
#[derive(Debug, Clone)]
pub struct ImagerConfig {
    /// F-engine UDP stream address.
    pub addr: String,
    /// F-engine UDP stream ports, each in 1-32768.
    pub ports: Vec<u16>,
    /// 1-D image size in pixels; 64 or 128.
    pub image_size: u32,
    /// Pixel resolution in degrees; positive.
    pub image_res: f32,
    /// Sequences per gulp (`nts`).
    pub nseq_per_gulp: u32,
    /// Sequence accumulation window in milliseconds (`seq_accum`); at
    /// least the gulp duration implied by `nseq_per_gulp`.
    pub seq_accum_ms: u32,
    /// Images to accumulate before persisting (`nimg_accum`).
    pub nimg_accum: u32,
    /// Output channels (`channels`); multiple of `chan_nbin`, within the
    /// device cap.
    pub nchan_out: u32,
    /// Gridding kernel support size (half-width in pixels); a power of two
    /// within the device-supported maximum.
    pub support: u32,
    /// Antenna effective area in square meters; positive.
    pub aeff: f32,
    /// Kernel lookup-table oversampling factor; a power of two.
    pub kernel_oversample: u32,
    /// Use reduced-precision on-chip accumulation.
    pub accum_16bit: bool,
    /// Channel binning factor.
    pub chan_nbin: u32,
    /// Execution streams per device.
    pub nstreams: u32,
    /// Devices to run on.
    pub ngpus: u32,
    /// Read recorded data from disk instead of the network.
    pub offline: bool,
    /// Recorded data path; required when `offline` is set.
    pub data_file: Option<PathBuf>,
    /// Stations in the array.
    pub nant: u32,
}

impl Default for ImagerConfig {
    fn default() -> Self {
        Self {
            addr: "239.168.40.11".to_string(),
            ports: vec![4015],
            image_size: 128,
            image_res: 1.0,
            nseq_per_gulp: 1000,
            seq_accum_ms: 40,
            nimg_accum: 1,
            nchan_out: 128,
            support: 2,
            aeff: 25.0,
            kernel_oversample: 2,
            accum_16bit: false,
            chan_nbin: 4,
            nstreams: 8,
            ngpus: 1,
            offline: false,
            data_file: None,
            nant: 64,
        }
    }
}

impl ImagerConfig {
    /// Duration of one gulp at the fixed sequence cadence.
    pub fn gulp_duration(&self) -> Duration {
        Duration::from_micros(self.nseq_per_gulp as u64 * SEQ_CADENCE_US)
    }

    /// Validate every knob against the device inventory reported by `probe`.
    ///
    /// Returns the first violation found; the order mirrors the option
    /// table so operators see the same message for the same mistake every
    /// time.
    pub fn validate(self, probe: &dyn DeviceProbe) -> Result<ValidatedConfig, ConfigError> {
        for &port in &self.ports {
            if port == 0 || port > 32768 {
                return Err(ConfigError::InvalidPort(port));
            }
        }

        if self.image_size != 64 && self.image_size != 128 {
            return Err(ConfigError::InvalidImageSize(self.image_size));
        }

        if self.image_res <= 0.0 {
            return Err(ConfigError::InvalidImageRes(self.image_res));
        }

        if self.nseq_per_gulp == 0 {
            return Err(ConfigError::NoSequences);
        }

        let gulp_ms = self.gulp_duration().as_millis() as u32;
        if self.seq_accum_ms < gulp_ms {
            return Err(ConfigError::AccumTooShort {
                accum_ms: self.seq_accum_ms,
                gulp_ms,
            });
        }

        if self.nimg_accum == 0 {
            return Err(ConfigError::NoImagesToAccum);
        }

        if self.nchan_out == 0 {
            return Err(ConfigError::NoChannels);
        }

        let inventory = probe.inventory();

        if self.ngpus == 0 {
            return Err(ConfigError::NoGpus);
        }
        if self.ngpus > inventory.count() {
            return Err(ConfigError::TooManyGpus {
                requested: self.ngpus,
                available: inventory.count(),
            });
        }

        for dev in inventory.iter().take(self.ngpus as usize) {
            if self.nchan_out > dev.max_channels {
                return Err(ConfigError::TooManyChannels {
                    device: dev.id,
                    cap: dev.max_channels,
                    requested: self.nchan_out,
                });
            }
            if !self.support.is_power_of_two() || self.support > dev.max_support {
                return Err(ConfigError::InvalidSupport {
                    support: self.support,
                    max: dev.max_support,
                });
            }
        }

        if self.aeff <= 0.0 {
            return Err(ConfigError::InvalidAeff(self.aeff));
        }

        if !self.kernel_oversample.is_power_of_two() {
            return Err(ConfigError::OversampleNotPow2(self.kernel_oversample));
        }

        if self.nchan_out % self.chan_nbin != 0 {
            return Err(ConfigError::ChannelsNotDivisible {
                channels: self.nchan_out,
                nbin: self.chan_nbin,
            });
        }

        if self.nstreams == 0 {
            return Err(ConfigError::NoStreams);
        }

        if self.offline && self.data_file.is_none() {
            return Err(ConfigError::OfflineWithoutFile);
        }

        if self.nant == 0 {
            return Err(ConfigError::NoAntennas);
        }

        Ok(ValidatedConfig {
            cfg: self,
            inventory,
        })
    }
}

/// A configuration that passed [`ImagerConfig::validate`].
///
/// Carries the device inventory it was validated against so stage factories
/// never consult global device state.
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    cfg: ImagerConfig,
    inventory: DeviceInventory,
}

impl ValidatedConfig {
    /// The validated knobs.
    pub fn get(&self) -> &ImagerConfig {
        &self.cfg
    }

    /// The inventory the config was validated against.
    pub fn inventory(&self) -> &DeviceInventory {
        &self.inventory
    }

    /// Output channels after binning.
    pub fn nchan_reduced(&self) -> usize {
        (self.cfg.nchan_out / self.cfg.chan_nbin) as usize
    }

    /// Shape of one raw gulp: `(nseq, nchan, nant, lanes)` in signed bytes.
    pub fn gulp_shape(&self) -> CubeShape {
        CubeShape::new(
            self.cfg.nseq_per_gulp as usize,
            self.cfg.nchan_out as usize,
            self.cfg.nant as usize,
            SAMPLE_LANES,
        )
    }

    /// Shape of one correlator output cube.
    pub fn cube_shape(&self) -> CubeShape {
        let size = self.cfg.image_size as usize;
        CubeShape::new(self.cfg.nchan_out as usize, NPOL_PRODUCTS, size, size)
    }

    /// Shape of one channel-reduced cube.
    pub fn reduced_shape(&self) -> CubeShape {
        let size = self.cfg.image_size as usize;
        CubeShape::new(self.nchan_reduced(), NPOL_PRODUCTS, size, size)
    }

    /// Build the immutable correlator descriptor for one device.
    pub fn correlator_desc(&self, device_id: u32) -> CorrelatorDesc {
        CorrelatorDesc {
            device_id,
            image_size: self.cfg.image_size,
            grid_res_deg: self.cfg.image_res,
            nseq_per_gulp: self.cfg.nseq_per_gulp,
            accum_time_ms: self.cfg.seq_accum_ms,
            nchan_out: self.cfg.nchan_out,
            support_size: self.cfg.support,
            kernel_oversampling_factor: self.cfg.kernel_oversample,
            // Physical kernel radius in decimeters, fixed by the effective
            // collecting area.
            gcf_kernel_dim: self.cfg.aeff.sqrt() * 10.0,
            use_bf16_accum: self.cfg.accum_16bit,
            nstreams: self.cfg.nstreams,
            nant: self.cfg.nant,
        }
    }
}

/// Immutable per-device correlator descriptor.
///
/// Created once at startup from the validated config and owned by the
/// correlator for its entire lifetime; no field changes at runtime.
#[derive(Debug, Clone)]
pub struct CorrelatorDesc {
    /// Device this correlator is pinned to.
    pub device_id: u32,
    /// Linear image dimension in pixels.
    pub image_size: u32,
    /// Pixel resolution in degrees.
    pub grid_res_deg: f32,
    /// Sequences per gulp.
    pub nseq_per_gulp: u32,
    /// Sequence accumulation window in milliseconds.
    pub accum_time_ms: u32,
    /// Output channels.
    pub nchan_out: u32,
    /// Kernel support half-width in pixels.
    pub support_size: u32,
    /// Kernel lookup-table oversampling factor.
    pub kernel_oversampling_factor: u32,
    /// Physical kernel radius in decimeters, derived from `aeff`.
    pub gcf_kernel_dim: f32,
    /// Reduced-precision accumulation switch.
    pub use_bf16_accum: bool,
    /// Execution streams on this device.
    pub nstreams: u32,
    /// Stations in the array.
    pub nant: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::HostProbe;

    fn probe() -> HostProbe {
        HostProbe::default()
    }

    fn small() -> ImagerConfig {
        ImagerConfig {
            image_size: 64,
            nseq_per_gulp: 100,
            seq_accum_ms: 40,
            nchan_out: 8,
            chan_nbin: 2,
            nstreams: 2,
            nant: 4,
            ..ImagerConfig::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(ImagerConfig::default().validate(&probe()).is_ok());
    }

    #[test]
    fn test_invalid_image_size_rejected() {
        let cfg = ImagerConfig {
            image_size: 100,
            ..small()
        };
        assert_eq!(
            cfg.validate(&probe()).unwrap_err(),
            ConfigError::InvalidImageSize(100)
        );
    }

    #[test]
    fn test_support_not_power_of_two_rejected() {
        let cfg = ImagerConfig {
            support: 3,
            ..small()
        };
        assert!(matches!(
            cfg.validate(&probe()).unwrap_err(),
            ConfigError::InvalidSupport { support: 3, .. }
        ));
    }

    #[test]
    fn test_support_beyond_device_cap_rejected() {
        let cfg = ImagerConfig {
            support: 64,
            ..small()
        };
        let err = cfg.validate(&probe()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSupport { support: 64, .. }));
    }

    #[test]
    fn test_channels_not_divisible_rejected() {
        let cfg = ImagerConfig {
            nchan_out: 10,
            chan_nbin: 3,
            ..small()
        };
        assert_eq!(
            cfg.validate(&probe()).unwrap_err(),
            ConfigError::ChannelsNotDivisible {
                channels: 10,
                nbin: 3
            }
        );
    }

    #[test]
    fn test_too_many_gpus_names_both_counts() {
        let cfg = ImagerConfig {
            ngpus: 4,
            ..small()
        };
        let err = cfg.validate(&probe()).unwrap_err();
        assert_eq!(
            err,
            ConfigError::TooManyGpus {
                requested: 4,
                available: 1
            }
        );
        let msg = err.to_string();
        assert!(msg.contains('4') && msg.contains('1'), "message: {msg}");
    }

    #[test]
    fn test_accum_shorter_than_gulp_rejected() {
        // 2000 sequences at 40 us = 80 ms of data per gulp.
        let cfg = ImagerConfig {
            nseq_per_gulp: 2000,
            seq_accum_ms: 40,
            ..small()
        };
        assert!(matches!(
            cfg.validate(&probe()).unwrap_err(),
            ConfigError::AccumTooShort {
                accum_ms: 40,
                gulp_ms: 80
            }
        ));
    }

    #[test]
    fn test_offline_requires_file() {
        let cfg = ImagerConfig {
            offline: true,
            data_file: None,
            ..small()
        };
        assert_eq!(
            cfg.validate(&probe()).unwrap_err(),
            ConfigError::OfflineWithoutFile
        );
    }

    #[test]
    fn test_port_range() {
        let cfg = ImagerConfig {
            ports: vec![40000],
            ..small()
        };
        assert_eq!(
            cfg.validate(&probe()).unwrap_err(),
            ConfigError::InvalidPort(40000)
        );
    }

    #[test]
    fn test_shapes() {
        let v = small().validate(&probe()).unwrap();
        assert_eq!(v.nchan_reduced(), 4);
        assert_eq!(v.gulp_shape().len(), 100 * 8 * 4 * SAMPLE_LANES);
        assert_eq!(v.cube_shape().len(), 8 * NPOL_PRODUCTS * 64 * 64);
        assert_eq!(v.reduced_shape().nchan, 4);
    }

    #[test]
    fn test_correlator_desc_derives_kernel_dim() {
        let v = small().validate(&probe()).unwrap();
        let desc = v.correlator_desc(0);
        assert_eq!(desc.device_id, 0);
        assert!((desc.gcf_kernel_dim - 25.0_f32.sqrt() * 10.0).abs() < 1e-6);
    }
}
