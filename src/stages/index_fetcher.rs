//! Watched-source coordinate snapshots.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;
use crate::stage::{SourceStage, StageKind};
use crate::stages::pixel_extractor::{CoordTable, SourceCoord};

/// Where coordinate snapshots come from.
///
/// The production feed queries a catalog service; tests and offline runs
/// use [`FixedCatalog`]. A fetch returning `Ok(None)` ends the snapshot
/// stream, the extractor then keeps its last table for the rest of the run.
pub trait CoordSource: Send {
    /// Fetch the current set of watched sources.
    fn fetch(&mut self) -> Result<Option<Vec<SourceCoord>>>;
}

/// A canned sequence of snapshots, served one per fetch.
#[derive(Debug, Default)]
pub struct FixedCatalog {
    snapshots: VecDeque<Vec<SourceCoord>>,
}

impl FixedCatalog {
    /// Serve `snapshots` in order, then end the stream.
    pub fn new(snapshots: Vec<Vec<SourceCoord>>) -> Self {
        Self {
            snapshots: snapshots.into(),
        }
    }
}

impl CoordSource for FixedCatalog {
    fn fetch(&mut self) -> Result<Option<Vec<SourceCoord>>> {
        Ok(self.snapshots.pop_front())
    }
}

/// Polls a [`CoordSource`] on a fixed cadence and stamps each snapshot with
/// a monotonically increasing epoch.
///
/// Runs as a pipeline source feeding the pixel extractor's update channel;
/// the stamped epochs are what let the extractor discard stale snapshots
/// regardless of delivery order.
pub struct IndexFetcher {
    source: Box<dyn CoordSource>,
    interval: Duration,
    epoch: u64,
    first: bool,
}

impl IndexFetcher {
    /// Poll `source` every `interval`. The first fetch happens immediately.
    pub fn new(source: Box<dyn CoordSource>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            epoch: 0,
            first: true,
        }
    }
}

impl SourceStage for IndexFetcher {
    type Output = CoordTable;

    fn produce(&mut self) -> Result<Option<CoordTable>> {
        if self.first {
            self.first = false;
        } else if !self.interval.is_zero() {
            std::thread::sleep(self.interval);
        }

        let Some(sources) = self.source.fetch()? else {
            return Ok(None);
        };
        self.epoch += 1;
        debug!(epoch = self.epoch, sources = sources.len(), "snapshot fetched");
        Ok(Some(CoordTable {
            epoch: self.epoch,
            sources,
        }))
    }

    fn kind(&self) -> StageKind {
        StageKind::IndexFetcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epochs_increase_monotonically() {
        let catalog = FixedCatalog::new(vec![
            vec![SourceCoord { id: 1, x: 0, y: 0 }],
            vec![],
            vec![SourceCoord { id: 2, x: 1, y: 1 }],
        ]);
        let mut fetcher = IndexFetcher::new(Box::new(catalog), Duration::ZERO);

        let a = fetcher.produce().unwrap().unwrap();
        let b = fetcher.produce().unwrap().unwrap();
        let c = fetcher.produce().unwrap().unwrap();
        assert_eq!((a.epoch, b.epoch, c.epoch), (1, 2, 3));
        assert_eq!(a.sources.len(), 1);
        assert!(b.sources.is_empty());

        // Catalog drained: snapshot stream ends.
        assert!(fetcher.produce().unwrap().is_none());
    }
}
