//! Stage traits and stage identities.
//!
//! Every pipeline unit is one of three shapes: a source that produces
//! items, a transform that maps one input to at most one output, or a sink
//! that consumes items. Configuration and device assignment are fixed for a
//! stage's lifetime; wiring between stages is fixed at pipeline
//! construction.
//!
//! Drop-and-continue is expressed in the return types: a transform returns
//! `Ok(None)` to skip a window (short input, pool exhaustion) and the
//! pipeline moves on to the next one. A failed checkout must leave no
//! partial side effects behind.

use crate::error::Result;

/// Identity of a pipeline stage.
///
/// Stages carry an explicit identity tag (see [`crate::stages`] for the
/// instances) instead of compile-time specialization per kind; the tag
/// labels per-stage log events and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Synthetic or offline gulp source.
    PacketGen,
    /// Gridding correlator.
    Correlator,
    /// Channel binner.
    ChanReducer,
    /// Sparse pixel gather.
    PixelExtractor,
    /// Coordinate-table snapshot provider.
    IndexFetcher,
    /// Pixel-table sink.
    DbIngester,
    /// Time accumulator.
    Accumulator,
    /// Cube sink.
    DiskSaver,
}

impl StageKind {
    /// Short label used in logs and stats.
    pub fn label(&self) -> &'static str {
        match self {
            StageKind::PacketGen => "packet_gen",
            StageKind::Correlator => "correlator",
            StageKind::ChanReducer => "chan_reducer",
            StageKind::PixelExtractor => "pixel_extractor",
            StageKind::IndexFetcher => "index_fetcher",
            StageKind::DbIngester => "db_ingester",
            StageKind::Accumulator => "accumulator",
            StageKind::DiskSaver => "disk_saver",
        }
    }
}

/// A stage that produces items.
pub trait SourceStage: Send {
    /// The type of item this source produces.
    type Output: Send + 'static;

    /// Produce the next item.
    ///
    /// Returns `Ok(None)` when the source is exhausted (end of stream).
    /// Windows lost to exhaustion or malformed input are skipped
    /// internally, never surfaced as errors.
    fn produce(&mut self) -> Result<Option<Self::Output>>;

    /// This stage's identity.
    fn kind(&self) -> StageKind;

    /// Name for logging.
    fn name(&self) -> &str {
        self.kind().label()
    }
}

/// A stage that maps an input item to at most one output item.
pub trait TransformStage: Send {
    /// The type of item this transform accepts.
    type Input: Send + 'static;
    /// The type of item this transform produces.
    type Output: Send + 'static;

    /// Transform one input.
    ///
    /// Returns `Ok(None)` to drop the window and continue (skip signal);
    /// stateful transforms may also buffer internally and emit later.
    fn transform(&mut self, input: Self::Input) -> Result<Option<Self::Output>>;

    /// This stage's identity.
    fn kind(&self) -> StageKind;

    /// Name for logging.
    fn name(&self) -> &str {
        self.kind().label()
    }
}

/// A stage that consumes items.
pub trait SinkStage: Send {
    /// The type of item this sink consumes.
    type Input: Send + 'static;

    /// Consume one item. The sink must release or copy the payload
    /// promptly to avoid starving the pool.
    fn consume(&mut self, item: Self::Input) -> Result<()>;

    /// This stage's identity.
    fn kind(&self) -> StageKind;

    /// Name for logging.
    fn name(&self) -> &str {
        self.kind().label()
    }
}
