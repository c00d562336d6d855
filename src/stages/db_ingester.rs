//! Pixel-table ingestion.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use tracing::debug;

use crate::error::Result;
use crate::stage::{SinkStage, StageKind};
use crate::stages::pixel_extractor::PixelTable;

/// Appends gathered pixel rows to a line-oriented log.
///
/// Each row becomes one record: sequence, stream time, snapshot epoch,
/// source identity and position, then the channel-major values. The log is
/// the hand-off point to the search backend; it only ever grows within a
/// run, so a crash loses at most the buffered tail.
pub struct DbIngester {
    writer: BufWriter<File>,
    rows: u64,
    tables: u64,
}

impl DbIngester {
    /// Open `path` for appending, creating it if missing.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            rows: 0,
            tables: 0,
        })
    }

    /// Rows written so far.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Tables ingested so far.
    pub fn tables(&self) -> u64 {
        self.tables
    }
}

impl SinkStage for DbIngester {
    type Input = PixelTable;

    fn consume(&mut self, table: PixelTable) -> Result<()> {
        for row in &table.rows {
            write!(
                self.writer,
                "{} {} {} {} {} {}",
                table.sequence,
                table.start_time.as_micros(),
                table.epoch,
                row.source.id,
                row.source.x,
                row.source.y
            )?;
            for v in &row.values {
                write!(self.writer, " {v}")?;
            }
            writeln!(self.writer)?;
            self.rows += 1;
        }
        self.writer.flush()?;
        self.tables += 1;
        debug!(
            seq = table.sequence,
            rows = table.rows.len(),
            "pixel table ingested"
        );
        Ok(())
    }

    fn kind(&self) -> StageKind {
        StageKind::DbIngester
    }
}
