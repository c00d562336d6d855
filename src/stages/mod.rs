//! The stage set.
//!
//! Every stage here carries a [`crate::stage::StageKind`] identity and is
//! built from a [`crate::config::ValidatedConfig`] plus the pools and
//! channels the pipeline wires up. See [`crate::pipeline`] for how they
//! compose.

mod accumulator;
mod chan_reducer;
mod correlator;
mod db_ingester;
mod disk_saver;
mod index_fetcher;
mod packet_gen;
mod pixel_extractor;
mod reorder;

pub use accumulator::Accumulator;
pub use chan_reducer::ChanReducer;
pub use correlator::GriddingCorrelator;
pub use db_ingester::DbIngester;
pub use disk_saver::DiskSaver;
pub use index_fetcher::{CoordSource, FixedCatalog, IndexFetcher};
pub use packet_gen::{OfflineSource, PacketGen};
pub use pixel_extractor::{CoordTable, PixelExtractor, PixelRow, PixelTable, SourceCoord};
pub use reorder::{Ready, Reorder};
