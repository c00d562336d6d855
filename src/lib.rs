//! Real-time streaming imager for an all-sky radio interferometer.
//!
//! Channelized dual-polarization voltages arrive from the array's F-engine
//! as a continuous stream; this crate turns them into accumulated sky
//! images and per-source pixel streams, keeping up with the stream by
//! dropping windows rather than stalling it.
//!
//! The dataflow is a fixed pipeline of stages connected by bounded
//! channels:
//!
//! ```text
//! packet_gen -> correlator (xN devices) -> chan_reducer -> accumulator
//!                                                            |-> disk_saver
//!                                                            '-> pixel_extractor -> db_ingester
//!                                                                     ^
//!                                                               index_fetcher
//! ```
//!
//! Data moves as [`payload::Payload`] handles over slots of a fixed
//! [`memory::BufferPool`]; nothing on the hot path allocates or copies a
//! cube. Cloning a payload is how the accumulated stream tees into the
//! persistence and extraction branches.
//!
//! # Example
//!
//! ```rust,no_run
//! use aperture::config::ImagerConfig;
//! use aperture::device::HostProbe;
//! use aperture::pipeline::{ImagingPipeline, PipelineOptions};
//!
//! fn main() -> aperture::Result<()> {
//!     let cfg = ImagerConfig {
//!         image_size: 64,
//!         nchan_out: 16,
//!         ..ImagerConfig::default()
//!     }
//!     .validate(&HostProbe::default())?;
//!
//!     let mut opts = PipelineOptions::new("./cubes".into());
//!     opts.ngulps = 100;
//!     let pipeline = ImagingPipeline::start(cfg, opts)?;
//!     let stats = pipeline.wait()?;
//!     println!("saved {} cubes", stats.saved());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod gridding;
pub mod header;
pub mod memory;
pub mod payload;
pub mod pipeline;
pub mod stage;
pub mod stages;

pub use error::{Error, Result};
pub use header::{CubeShape, PayloadHeader};
pub use memory::{BufferPool, CheckoutPolicy};
pub use payload::Payload;
pub use pipeline::{ImagingPipeline, PipelineOptions, PipelineStats};
pub use stage::{SinkStage, SourceStage, StageKind, TransformStage};
