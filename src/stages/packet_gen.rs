//! Gulp sources: synthetic generation and offline playback.
//!
//! Both sources emit raw gulps checked out of the shared byte pool. A gulp
//! the pool cannot supply a slot for is dropped and counted; the stream
//! itself never stalls on a slow consumer.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::ValidatedConfig;
use crate::error::{Error, Result};
use crate::header::{CubeShape, PayloadHeader};
use crate::memory::BufferPool;
use crate::payload::Payload;
use crate::stage::{SourceStage, StageKind};

/// Synthetic gulp generator.
///
/// Emits a fixed number of gulps with every sample lane set to a constant
/// signed byte, then signals end of stream. Deterministic by construction,
/// which makes downstream pixel values computable by hand.
pub struct PacketGen {
    pool: Arc<BufferPool<u8>>,
    shape: CubeShape,
    gulp_duration: Duration,
    fill: i8,
    sequence: u64,
    remaining: u64,
    dropped: u64,
}

impl PacketGen {
    /// A generator that emits `ngulps` windows of unit samples.
    pub fn new(cfg: &ValidatedConfig, pool: Arc<BufferPool<u8>>, ngulps: u64) -> Self {
        Self {
            pool,
            shape: cfg.gulp_shape(),
            gulp_duration: cfg.get().gulp_duration(),
            fill: 1,
            sequence: 0,
            remaining: ngulps,
            dropped: 0,
        }
    }

    /// Override the constant sample value.
    pub fn with_fill(mut self, fill: i8) -> Self {
        self.fill = fill;
        self
    }

    /// Gulps dropped because no slot was free at generation time.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl SourceStage for PacketGen {
    type Output = Payload<u8>;

    fn produce(&mut self) -> Result<Option<Payload<u8>>> {
        loop {
            if self.remaining == 0 {
                return Ok(None);
            }

            let seq = self.sequence;
            let header =
                PayloadHeader::new(seq, self.gulp_duration * seq as u32, self.shape);
            match self.pool.checkout(header) {
                Ok(mut gulp) => {
                    self.sequence += 1;
                    self.remaining -= 1;
                    let data = gulp
                        .as_mut_slice()
                        .expect("fresh checkout has a unique handle");
                    data[..self.shape.len()].fill(self.fill as u8);
                    return Ok(Some(gulp));
                }
                Err(Error::PoolExhausted) => {
                    // The window's timeslot has passed; its data is gone.
                    self.sequence += 1;
                    self.remaining -= 1;
                    self.dropped += 1;
                    warn!(seq, "gulp pool exhausted, dropping window");
                    std::thread::yield_now();
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn kind(&self) -> StageKind {
        StageKind::PacketGen
    }
}

/// Offline playback source.
///
/// Streams raw gulps from a recorded capture file, one gulp's worth of
/// bytes per window, preserving the capture's sample layout. A truncated
/// tail shorter than one gulp is dropped with a warning.
pub struct OfflineSource {
    reader: BufReader<File>,
    pool: Arc<BufferPool<u8>>,
    shape: CubeShape,
    gulp_duration: Duration,
    sequence: u64,
    dropped: u64,
    eos: bool,
}

impl OfflineSource {
    /// Open `path` for playback against the validated config's gulp shape.
    pub fn open(
        cfg: &ValidatedConfig,
        pool: Arc<BufferPool<u8>>,
        path: &Path,
    ) -> Result<Self> {
        let file = File::open(path)?;
        debug!(path = %path.display(), "opened recorded capture");
        Ok(Self {
            reader: BufReader::new(file),
            pool,
            shape: cfg.gulp_shape(),
            gulp_duration: cfg.get().gulp_duration(),
            sequence: 0,
            dropped: 0,
            eos: false,
        })
    }

    /// Gulps dropped because no slot was free at read time.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn read_gulp(&mut self, buf: &mut [u8]) -> Result<bool> {
        match self.reader.read_exact(buf) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.eos = true;
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl SourceStage for OfflineSource {
    type Output = Payload<u8>;

    fn produce(&mut self) -> Result<Option<Payload<u8>>> {
        loop {
            if self.eos {
                return Ok(None);
            }

            let seq = self.sequence;
            let header =
                PayloadHeader::new(seq, self.gulp_duration * seq as u32, self.shape);
            match self.pool.checkout(header) {
                Ok(mut gulp) => {
                    let len = self.shape.len();
                    let data = gulp
                        .as_mut_slice()
                        .expect("fresh checkout has a unique handle");
                    if !self.read_gulp(&mut data[..len])? {
                        // Drop the half-filled slot with the handle.
                        return Ok(None);
                    }
                    self.sequence += 1;
                    return Ok(Some(gulp));
                }
                Err(Error::PoolExhausted) => {
                    // Skip this window's bytes to stay aligned on gulps.
                    let len = self.shape.len();
                    let mut sink = vec![0u8; len.min(1 << 16)];
                    let mut left = len;
                    while left > 0 {
                        let take = left.min(sink.len());
                        if !self.read_gulp(&mut sink[..take])? {
                            return Ok(None);
                        }
                        left -= take;
                    }
                    self.sequence += 1;
                    self.dropped += 1;
                    warn!(seq, "gulp pool exhausted, skipping recorded window");
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn kind(&self) -> StageKind {
        StageKind::PacketGen
    }

    fn name(&self) -> &str {
        "offline_source"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImagerConfig;
    use crate::device::HostProbe;
    use crate::memory::CheckoutPolicy;
    use std::io::Write;

    fn config() -> ValidatedConfig {
        ImagerConfig {
            image_size: 64,
            nseq_per_gulp: 4,
            seq_accum_ms: 40,
            nchan_out: 2,
            chan_nbin: 1,
            nstreams: 1,
            nant: 3,
            ..ImagerConfig::default()
        }
        .validate(&HostProbe::default())
        .unwrap()
    }

    #[test]
    fn test_packet_gen_emits_then_ends() {
        let cfg = config();
        let pool = Arc::new(
            BufferPool::new(4, cfg.gulp_shape().len(), CheckoutPolicy::FailFast).unwrap(),
        );
        let mut src = PacketGen::new(&cfg, pool, 3).with_fill(2);

        for seq in 0..3u64 {
            let gulp = src.produce().unwrap().expect("gulp");
            assert_eq!(gulp.header().sequence, seq);
            assert_eq!(gulp.header().start_time, cfg.get().gulp_duration() * seq as u32);
            assert!(gulp.as_slice()[..cfg.gulp_shape().len()]
                .iter()
                .all(|&b| b as i8 == 2));
        }
        assert!(src.produce().unwrap().is_none());
        assert_eq!(src.dropped(), 0);
    }

    #[test]
    fn test_packet_gen_drops_on_exhaustion() {
        let cfg = config();
        let pool = Arc::new(
            BufferPool::new(1, cfg.gulp_shape().len(), CheckoutPolicy::FailFast).unwrap(),
        );
        let mut src = PacketGen::new(&cfg, Arc::clone(&pool), 2);

        let held = src.produce().unwrap().expect("first gulp");
        // The only slot is held downstream; the second window is lost and
        // the source reports end of stream.
        assert!(src.produce().unwrap().is_none());
        assert_eq!(src.dropped(), 1);
        drop(held);
    }

    #[test]
    fn test_offline_source_plays_back_and_drops_tail() {
        let cfg = config();
        let gulp_len = cfg.gulp_shape().len();

        let dir = std::env::temp_dir().join(format!("aperture-offline-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("capture.raw");
        {
            let mut f = File::create(&path).unwrap();
            let mut bytes = vec![7u8; gulp_len * 2];
            // Truncated third gulp.
            bytes.extend(std::iter::repeat(7u8).take(gulp_len / 2));
            f.write_all(&bytes).unwrap();
        }

        let pool = Arc::new(
            BufferPool::new(4, gulp_len, CheckoutPolicy::FailFast).unwrap(),
        );
        let mut src = OfflineSource::open(&cfg, pool, &path).unwrap();

        let a = src.produce().unwrap().expect("first gulp");
        assert_eq!(a.header().sequence, 0);
        assert!(a.as_slice()[..gulp_len].iter().all(|&b| b == 7));
        let b = src.produce().unwrap().expect("second gulp");
        assert_eq!(b.header().sequence, 1);
        assert!(src.produce().unwrap().is_none());

        std::fs::remove_file(&path).ok();
        std::fs::remove_dir(&dir).ok();
    }
}
