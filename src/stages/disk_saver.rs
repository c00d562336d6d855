//! Accumulated-cube persistence.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::Result;
use crate::payload::Payload;
use crate::stage::{SinkStage, StageKind};

/// File magic for persisted cubes.
pub const CUBE_MAGIC: &[u8; 4] = b"APTC";
/// On-disk format version.
pub const CUBE_VERSION: u32 = 1;

/// Writes each accumulated cube to its own file under a fixed directory.
///
/// Files are named by sequence number and stream time and carry a small
/// self-describing header followed by the raw little-endian samples, so a
/// cube can be reloaded without the config that produced it. Partial
/// windows (header marked invalid) are not persisted.
pub struct DiskSaver {
    dir: PathBuf,
    saved: u64,
    skipped: u64,
}

impl DiskSaver {
    /// A saver writing into `dir`, created if missing.
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            saved: 0,
            skipped: 0,
        })
    }

    /// Cubes persisted so far.
    pub fn saved(&self) -> u64 {
        self.saved
    }

    /// Cubes rejected (partial windows).
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn write_cube(&self, cube: &Payload<f32>, path: &Path) -> Result<()> {
        let header = cube.header();
        let shape = header.shape;
        let mut w = BufWriter::new(File::create(path)?);

        w.write_all(CUBE_MAGIC)?;
        w.write_all(&CUBE_VERSION.to_le_bytes())?;
        w.write_all(&header.sequence.to_le_bytes())?;
        w.write_all(&(header.start_time.as_micros() as u64).to_le_bytes())?;
        for dim in [shape.nchan, shape.npol, shape.nrow, shape.ncol] {
            w.write_all(&(dim as u32).to_le_bytes())?;
        }
        for &v in &cube.as_slice()[..shape.len()] {
            w.write_all(&v.to_le_bytes())?;
        }
        w.flush()?;
        Ok(())
    }
}

impl SinkStage for DiskSaver {
    type Input = Payload<f32>;

    fn consume(&mut self, cube: Payload<f32>) -> Result<()> {
        if !cube.header().valid {
            self.skipped += 1;
            warn!(seq = cube.header().sequence, "not persisting partial window");
            return Ok(());
        }

        let name = format!(
            "cube_{:08}_{}us.aptc",
            cube.header().sequence,
            cube.header().start_time.as_micros()
        );
        let path = self.dir.join(name);
        self.write_cube(&cube, &path)?;
        self.saved += 1;
        info!(seq = cube.header().sequence, path = %path.display(), "cube saved");
        Ok(())
    }

    fn kind(&self) -> StageKind {
        StageKind::DiskSaver
    }
}
