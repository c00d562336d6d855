//! Sparse per-source pixel gather.
//!
//! The live imaging path persists whole cubes; the transient-search path
//! only needs a handful of pixels per known source. The extractor gathers
//! those pixels out of every accumulated cube against a coordinate table
//! that can be swapped at runtime without stopping the stream.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Result;
use crate::header::CubeShape;
use crate::payload::Payload;
use crate::stage::{StageKind, TransformStage};

/// One watched source, in grid-pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceCoord {
    /// Catalog identifier.
    pub id: u32,
    /// Column of the source pixel.
    pub x: u32,
    /// Row of the source pixel.
    pub y: u32,
}

/// A versioned snapshot of watched sources.
///
/// Snapshots are totally ordered by `epoch`; the extractor only ever moves
/// forward, so a stale snapshot delivered late is ignored.
#[derive(Debug, Clone, Default)]
pub struct CoordTable {
    /// Monotonic snapshot version.
    pub epoch: u64,
    /// Watched sources.
    pub sources: Vec<SourceCoord>,
}

/// Pixel values gathered for one source: `nchan * npol` values in channel-
/// major order.
#[derive(Debug, Clone)]
pub struct PixelRow {
    /// The source this row was gathered for.
    pub source: SourceCoord,
    /// One value per `(channel, pol)` pair.
    pub values: Vec<f32>,
}

/// Everything gathered from one accumulated cube.
#[derive(Debug, Clone)]
pub struct PixelTable {
    /// Sequence number of the cube the pixels came from.
    pub sequence: u64,
    /// Stream time of the cube.
    pub start_time: Duration,
    /// Epoch of the coordinate snapshot used for the gather.
    pub epoch: u64,
    /// Channels per row.
    pub nchan: usize,
    /// Polarization products per channel.
    pub npol: usize,
    /// One row per in-bounds source.
    pub rows: Vec<PixelRow>,
}

/// Gathers watched-source pixels from accumulated cubes.
///
/// Coordinate updates arrive on a channel from the index fetcher and are
/// applied between windows; a window is always gathered against exactly one
/// snapshot. Sources outside the grid are dropped row-wise, never failing
/// the whole window.
pub struct PixelExtractor {
    shape: CubeShape,
    coords: CoordTable,
    updates: Option<kanal::Receiver<CoordTable>>,
    skipped: u64,
}

impl PixelExtractor {
    /// An extractor over cubes of `shape`, starting from `initial`
    /// coordinates and following updates on `updates`, if supplied.
    pub fn new(
        shape: CubeShape,
        initial: CoordTable,
        updates: Option<kanal::Receiver<CoordTable>>,
    ) -> Self {
        Self {
            shape,
            coords: initial,
            updates,
            skipped: 0,
        }
    }

    /// Windows dropped so far.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Epoch of the snapshot currently in use.
    pub fn epoch(&self) -> u64 {
        self.coords.epoch
    }

    fn apply_updates(&mut self) {
        let Some(rx) = self.updates.as_ref() else {
            return;
        };
        // Drain everything queued; the newest epoch wins.
        while let Ok(Some(table)) = rx.try_recv() {
            if table.epoch >= self.coords.epoch {
                debug!(
                    epoch = table.epoch,
                    sources = table.sources.len(),
                    "coordinate snapshot updated"
                );
                self.coords = table;
            } else {
                warn!(
                    epoch = table.epoch,
                    current = self.coords.epoch,
                    "ignoring stale coordinate snapshot"
                );
            }
        }
    }
}

impl TransformStage for PixelExtractor {
    type Input = Payload<f32>;
    type Output = PixelTable;

    fn transform(&mut self, cube: Payload<f32>) -> Result<Option<PixelTable>> {
        self.apply_updates();

        if !cube.header().valid || cube.header().shape != self.shape {
            self.skipped += 1;
            warn!(seq = cube.header().sequence, "dropping misshapen cube");
            return Ok(None);
        }

        let data = &cube.as_slice()[..self.shape.len()];
        let mut rows = Vec::with_capacity(self.coords.sources.len());
        for &src in &self.coords.sources {
            let (x, y) = (src.x as usize, src.y as usize);
            if x >= self.shape.ncol || y >= self.shape.nrow {
                warn!(id = src.id, x, y, "source off the grid, skipping row");
                continue;
            }
            let mut values = Vec::with_capacity(self.shape.nchan * self.shape.npol);
            for chan in 0..self.shape.nchan {
                for pol in 0..self.shape.npol {
                    values.push(data[self.shape.index(chan, pol, y, x)]);
                }
            }
            rows.push(PixelRow { source: src, values });
        }

        Ok(Some(PixelTable {
            sequence: cube.header().sequence,
            start_time: cube.header().start_time,
            epoch: self.coords.epoch,
            nchan: self.shape.nchan,
            npol: self.shape.npol,
            rows,
        }))
    }

    fn kind(&self) -> StageKind {
        StageKind::PixelExtractor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::PayloadHeader;
    use crate::memory::{BufferPool, CheckoutPolicy};

    fn shape() -> CubeShape {
        CubeShape::new(2, 4, 8, 8)
    }

    fn cube(pool: &BufferPool<f32>, seq: u64) -> Payload<f32> {
        let mut p = pool
            .checkout(PayloadHeader::new(seq, Duration::ZERO, shape()))
            .unwrap();
        let data = p.as_mut_slice().unwrap();
        let s = shape();
        for chan in 0..s.nchan {
            for pol in 0..s.npol {
                for y in 0..s.nrow {
                    for x in 0..s.ncol {
                        data[s.index(chan, pol, y, x)] =
                            (chan * 1000 + pol * 100 + y * 10 + x) as f32;
                    }
                }
            }
        }
        p
    }

    fn pool() -> BufferPool<f32> {
        BufferPool::new(2, shape().len(), CheckoutPolicy::FailFast).unwrap()
    }

    #[test]
    fn test_gathers_watched_pixels() {
        let pool = pool();
        let coords = CoordTable {
            epoch: 1,
            sources: vec![SourceCoord { id: 42, x: 3, y: 5 }],
        };
        let mut ex = PixelExtractor::new(shape(), coords, None);

        let table = ex.transform(cube(&pool, 11)).unwrap().expect("table");
        assert_eq!(table.sequence, 11);
        assert_eq!(table.epoch, 1);
        assert_eq!(table.rows.len(), 1);
        let row = &table.rows[0];
        assert_eq!(row.source.id, 42);
        // chan 0 pol 0 at (y=5, x=3), then pol 1.
        assert_eq!(row.values[0], 53.0);
        assert_eq!(row.values[1], 153.0);
        // chan 1 pol 0.
        assert_eq!(row.values[4], 1053.0);
    }

    #[test]
    fn test_off_grid_source_dropped_rowwise() {
        let pool = pool();
        let coords = CoordTable {
            epoch: 0,
            sources: vec![
                SourceCoord { id: 1, x: 99, y: 0 },
                SourceCoord { id: 2, x: 0, y: 0 },
            ],
        };
        let mut ex = PixelExtractor::new(shape(), coords, None);
        let table = ex.transform(cube(&pool, 0)).unwrap().unwrap();
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].source.id, 2);
    }

    #[test]
    fn test_updates_applied_newest_epoch_wins() {
        let pool = pool();
        let (tx, rx) = kanal::bounded(4);
        let mut ex = PixelExtractor::new(shape(), CoordTable::default(), Some(rx));

        tx.send(CoordTable {
            epoch: 3,
            sources: vec![SourceCoord { id: 7, x: 1, y: 1 }],
        })
        .unwrap();
        // Stale snapshot queued behind a newer one.
        tx.send(CoordTable {
            epoch: 2,
            sources: vec![],
        })
        .unwrap();

        let table = ex.transform(cube(&pool, 0)).unwrap().unwrap();
        assert_eq!(table.epoch, 3);
        assert_eq!(table.rows.len(), 1);
        assert_eq!(ex.epoch(), 3);
    }

    #[test]
    fn test_invalid_cube_skipped() {
        let pool = pool();
        let mut ex = PixelExtractor::new(shape(), CoordTable::default(), None);
        let mut bad = cube(&pool, 0);
        bad.header_mut().invalidate();
        assert!(ex.transform(bad).unwrap().is_none());
        assert_eq!(ex.skipped(), 1);
    }
}
