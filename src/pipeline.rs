//! Pipeline composition and lifecycle.
//!
//! One thread per stage (correlators replicated per device), wired with
//! bounded channels. Backpressure never propagates upstream past a channel:
//! when a downstream queue is full the window is dropped and counted, and
//! the stream keeps its cadence. Shutdown is a cascade: the sources stop,
//! every channel closes in turn, and the pools are drained before the
//! pipeline reports completion.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::{ConfigError, ValidatedConfig};
use crate::error::{Error, Result};
use crate::memory::{BufferPool, CheckoutPolicy};
use crate::payload::Payload;
use crate::stage::{SinkStage, SourceStage, TransformStage};
use crate::stages::{
    Accumulator, ChanReducer, CoordSource, CoordTable, DbIngester, DiskSaver,
    GriddingCorrelator, IndexFetcher, OfflineSource, PacketGen, PixelExtractor, Reorder,
};

/// How long a pool checkout may wait for a slot before the window is
/// declared lost.
const CHECKOUT_WAIT: Duration = Duration::from_millis(50);

/// Runtime knobs that are not part of the imaging configuration.
pub struct PipelineOptions {
    /// Gulps the synthetic source emits before end of stream. Ignored in
    /// offline mode, where playback length comes from the capture file.
    pub ngulps: u64,
    /// Bounded depth of every inter-stage channel.
    pub channel_depth: usize,
    /// Pending-cube bound of the reorder window between the correlators
    /// and the accumulator.
    pub reorder_depth: usize,
    /// Directory accumulated cubes are persisted into.
    pub output_dir: PathBuf,
    /// Pixel-row log path; the extraction branch runs only when set.
    pub pixel_log: Option<PathBuf>,
    /// Feed of watched-source coordinates for the extraction branch.
    pub coord_source: Option<Box<dyn CoordSource>>,
    /// Poll cadence of the coordinate feed.
    pub coord_poll: Duration,
    /// Bound on waiting for in-flight payloads at shutdown.
    pub drain_timeout: Duration,
}

impl PipelineOptions {
    /// Defaults for a run persisting into `output_dir`.
    pub fn new(output_dir: PathBuf) -> Self {
        Self {
            ngulps: u64::MAX,
            channel_depth: 8,
            reorder_depth: 8,
            output_dir,
            pixel_log: None,
            coord_source: None,
            coord_poll: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Monotonic per-stage counters, shared by every stage thread.
///
/// Counters only ever increase within a run; `dropped` aggregates every
/// window lost anywhere (pool exhaustion, full channels, malformed input,
/// abandoned reorder gaps).
#[derive(Debug, Default)]
pub struct PipelineStats {
    gulps: AtomicU64,
    cubes: AtomicU64,
    reduced: AtomicU64,
    accumulated: AtomicU64,
    saved: AtomicU64,
    tables: AtomicU64,
    rows: AtomicU64,
    dropped: AtomicU64,
}

impl PipelineStats {
    /// Gulps emitted by the source.
    pub fn gulps(&self) -> u64 {
        self.gulps.load(Ordering::Relaxed)
    }

    /// Cubes produced by the correlators.
    pub fn cubes(&self) -> u64 {
        self.cubes.load(Ordering::Relaxed)
    }

    /// Channel-reduced cubes.
    pub fn reduced(&self) -> u64 {
        self.reduced.load(Ordering::Relaxed)
    }

    /// Completed accumulation windows.
    pub fn accumulated(&self) -> u64 {
        self.accumulated.load(Ordering::Relaxed)
    }

    /// Cubes persisted to disk.
    pub fn saved(&self) -> u64 {
        self.saved.load(Ordering::Relaxed)
    }

    /// Pixel tables ingested.
    pub fn tables(&self) -> u64 {
        self.tables.load(Ordering::Relaxed)
    }

    /// Pixel rows ingested.
    pub fn rows(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    /// Windows lost anywhere in the pipeline.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn count(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn drop_window(&self, stage: &'static str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(stage, "window dropped");
    }
}

/// Offer `item` downstream without blocking.
///
/// Returns false when the receiving side is gone; a full queue drops the
/// item (releasing any pooled slot it held) and counts it.
fn offer<T>(
    tx: &kanal::Sender<T>,
    item: T,
    stats: &PipelineStats,
    stage: &'static str,
) -> bool {
    match tx.try_send(item) {
        Ok(true) => true,
        Ok(false) => {
            stats.drop_window(stage);
            true
        }
        Err(_) => false,
    }
}

/// A running imaging pipeline.
///
/// Built by [`ImagingPipeline::start`]; runs until its source ends or
/// [`stop`](Self::stop) is called, then [`wait`](Self::wait) joins every
/// stage thread and drains the pools.
pub struct ImagingPipeline {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<Result<()>>>,
    stats: Arc<PipelineStats>,
    raw_pool: Arc<BufferPool<u8>>,
    cube_pool: Arc<BufferPool<f32>>,
    reduced_pool: Arc<BufferPool<f32>>,
    drain_timeout: Duration,
}

impl ImagingPipeline {
    /// Allocate the pools, construct every stage from `cfg`, and start the
    /// stage threads.
    pub fn start(cfg: ValidatedConfig, opts: PipelineOptions) -> Result<Self> {
        let knobs = cfg.get();
        let ngpus = knobs.ngpus as usize;
        let depth = opts.channel_depth.max(1);

        let raw_pool = Arc::new(BufferPool::new(
            depth + ngpus + 2,
            cfg.gulp_shape().len(),
            CheckoutPolicy::FailFast,
        )?);
        let cube_pool = Arc::new(BufferPool::new(
            depth + ngpus + 2,
            cfg.cube_shape().len(),
            CheckoutPolicy::Wait(CHECKOUT_WAIT),
        )?);
        // Reduced slots back both the in-flight cubes and the running sums.
        let reduced_pool = Arc::new(BufferPool::new(
            2 * depth + opts.reorder_depth + 4,
            cfg.reduced_shape().len(),
            CheckoutPolicy::Wait(CHECKOUT_WAIT),
        )?);

        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(PipelineStats::default());
        let mut threads = Vec::new();

        let (gulp_tx, gulp_rx) = kanal::bounded::<Payload<u8>>(depth);
        let (cube_tx, cube_rx) = kanal::bounded::<Payload<f32>>(depth);
        let (acc_tx, acc_rx) = kanal::bounded::<Payload<f32>>(depth);

        // Pixel branch, only when a row log was requested.
        let (extract_tx, extract_rx) = match &opts.pixel_log {
            Some(_) => {
                let (tx, rx) = kanal::bounded::<Payload<f32>>(depth);
                (Some(tx), Some(rx))
            }
            None => (None, None),
        };
        let (coord_tx, coord_rx) = match (&extract_rx, &opts.coord_source) {
            (Some(_), Some(_)) => {
                let (tx, rx) = kanal::bounded::<CoordTable>(4);
                (Some(tx), Some(rx))
            }
            _ => (None, None),
        };

        // Source thread.
        let mut source: Box<dyn SourceStage<Output = Payload<u8>>> = if knobs.offline {
            let Some(path) = knobs.data_file.clone() else {
                return Err(ConfigError::OfflineWithoutFile.into());
            };
            Box::new(OfflineSource::open(&cfg, Arc::clone(&raw_pool), &path)?)
        } else {
            Box::new(PacketGen::new(&cfg, Arc::clone(&raw_pool), opts.ngulps))
        };
        {
            let stop = Arc::clone(&stop);
            let stats = Arc::clone(&stats);
            threads.push(
                thread::Builder::new()
                    .name(source.name().to_string())
                    .spawn(move || -> Result<()> {
                        while !stop.load(Ordering::Relaxed) {
                            let Some(gulp) = source.produce()? else {
                                break;
                            };
                            stats.count(&stats.gulps);
                            if !offer(&gulp_tx, gulp, &stats, "packet_gen") {
                                break;
                            }
                        }
                        Ok(())
                    })?,
            );
        }

        // One correlator thread per device, sharing the gulp queue.
        for device in 0..knobs.ngpus {
            let mut corr =
                GriddingCorrelator::new(cfg.correlator_desc(device), Arc::clone(&cube_pool))?;
            let rx = gulp_rx.clone();
            let tx = cube_tx.clone();
            let stats = Arc::clone(&stats);
            threads.push(
                thread::Builder::new()
                    .name(format!("correlator{device}"))
                    .spawn(move || -> Result<()> {
                        while let Ok(gulp) = rx.recv() {
                            match corr.transform(gulp)? {
                                Some(cube) => {
                                    stats.count(&stats.cubes);
                                    if !offer(&tx, cube, &stats, "correlator") {
                                        break;
                                    }
                                }
                                None => stats.drop_window("correlator"),
                            }
                        }
                        Ok(())
                    })?,
            );
        }
        drop(gulp_rx);
        drop(cube_tx);

        // Reducer thread: binning, order restoration, and the tee of the
        // ordered reduced stream into the accumulation and extraction
        // branches. The tee is a payload clone, never a copy.
        {
            let mut reducer = ChanReducer::new(
                cfg.cube_shape(),
                knobs.chan_nbin as usize,
                Arc::clone(&reduced_pool),
            )?;
            let mut reorder = Reorder::new(opts.reorder_depth.max(1));
            let stats = Arc::clone(&stats);
            let tee = extract_tx;
            threads.push(
                thread::Builder::new()
                    .name("chan_reducer".to_string())
                    .spawn(move || -> Result<()> {
                        let forward = |ready: Payload<f32>| -> bool {
                            if let Some(tx) = &tee {
                                offer(tx, ready.clone(), &stats, "extract_tee");
                            }
                            offer(&acc_tx, ready, &stats, "reorder")
                        };
                        'recv: while let Ok(cube) = cube_rx.recv() {
                            match reducer.transform(cube)? {
                                Some(cube) => {
                                    stats.count(&stats.reduced);
                                    for ready in reorder.push(cube) {
                                        if !forward(ready) {
                                            break 'recv;
                                        }
                                    }
                                }
                                None => stats.drop_window("chan_reducer"),
                            }
                        }
                        for ready in reorder.flush() {
                            if !forward(ready) {
                                break;
                            }
                        }
                        for _ in 0..reorder.dropped() {
                            stats.drop_window("reorder");
                        }
                        Ok(())
                    })?,
            );
        }

        // Accumulator thread, with the disk saver inline: persistence
        // happens in window order without another queue.
        {
            let mut acc = Accumulator::new(
                cfg.reduced_shape(),
                knobs.nimg_accum,
                Arc::clone(&reduced_pool),
            )?;
            let mut saver = DiskSaver::new(&opts.output_dir)?;
            let stats = Arc::clone(&stats);
            threads.push(
                thread::Builder::new()
                    .name("accumulator".to_string())
                    .spawn(move || -> Result<()> {
                        while let Ok(cube) = acc_rx.recv() {
                            let Some(sum) = acc.transform(cube)? else {
                                continue;
                            };
                            stats.count(&stats.accumulated);
                            saver.consume(sum)?;
                            stats.saved.store(saver.saved(), Ordering::Relaxed);
                        }
                        if let Some(partial) = acc.flush() {
                            // Marked invalid; the saver counts it, nothing
                            // is written.
                            saver.consume(partial)?;
                        }
                        Ok(())
                    })?,
            );
        }

        // Extraction branch: pixel gather with the row sink inline.
        if let (Some(rx), Some(log)) = (extract_rx, opts.pixel_log.clone()) {
            let mut extractor =
                PixelExtractor::new(cfg.reduced_shape(), CoordTable::default(), coord_rx);
            let mut sink = DbIngester::open(&log)?;
            let stats = Arc::clone(&stats);
            threads.push(
                thread::Builder::new()
                    .name("pixel_extractor".to_string())
                    .spawn(move || -> Result<()> {
                        while let Ok(cube) = rx.recv() {
                            match extractor.transform(cube)? {
                                Some(table) => {
                                    stats
                                        .rows
                                        .fetch_add(table.rows.len() as u64, Ordering::Relaxed);
                                    stats.count(&stats.tables);
                                    sink.consume(table)?;
                                }
                                None => stats.drop_window("pixel_extractor"),
                            }
                        }
                        Ok(())
                    })?,
            );
        }

        // Coordinate feed for the extraction branch.
        if let (Some(tx), Some(src)) = (coord_tx, opts.coord_source) {
            let mut fetcher = IndexFetcher::new(src, opts.coord_poll);
            let stop = Arc::clone(&stop);
            let stats = Arc::clone(&stats);
            threads.push(
                thread::Builder::new()
                    .name("index_fetcher".to_string())
                    .spawn(move || -> Result<()> {
                        while !stop.load(Ordering::Relaxed) {
                            let Some(table) = fetcher.produce()? else {
                                break;
                            };
                            if !offer(&tx, table, &stats, "index_fetcher") {
                                break;
                            }
                        }
                        Ok(())
                    })?,
            );
        }

        info!(
            devices = knobs.ngpus,
            channel_depth = depth,
            "pipeline started"
        );

        Ok(Self {
            stop,
            threads,
            stats,
            raw_pool,
            cube_pool,
            reduced_pool,
            drain_timeout: opts.drain_timeout,
        })
    }

    /// Live counters. Cheap to poll while the pipeline runs.
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Ask the sources to stop; the shutdown cascades downstream through
    /// channel closure. Returns immediately.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Join every stage thread, drain the pools, and return the final
    /// counters. The first stage error, if any, is returned instead.
    pub fn wait(mut self) -> Result<Arc<PipelineStats>> {
        for handle in self.threads.drain(..) {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => {
                    return Err(Error::DeviceFault {
                        device: u32::MAX,
                        reason: "stage thread panicked".to_string(),
                    })
                }
            }
        }
        self.raw_pool.drain(self.drain_timeout)?;
        self.cube_pool.drain(self.drain_timeout)?;
        self.reduced_pool.drain(self.drain_timeout)?;
        info!(
            gulps = self.stats.gulps(),
            saved = self.stats.saved(),
            dropped = self.stats.dropped(),
            "pipeline finished"
        );
        Ok(Arc::clone(&self.stats))
    }
}
