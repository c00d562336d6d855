//! Payload header types.
//!
//! Every payload carries a small header next to its pooled buffer: the gulp
//! sequence id, the start time of the window, a validity flag and the logical
//! shape of the contents. Downstream stages key ordering decisions off the
//! sequence id and must not interpret the buffer of an invalid payload.

use std::time::Duration;

/// Logical 4-D shape of a payload's contents.
///
/// Image cubes are indexed `(channel, pol product, row, column)` with
/// row/column contiguous per channel. Raw gulps reuse the same type with
/// `(sequence, channel, antenna, lane)` semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CubeShape {
    /// Number of channels (or sequences, for raw windows).
    pub nchan: usize,
    /// Number of polarization products (or channels, for raw windows).
    pub npol: usize,
    /// Rows (image height, or antennas for raw windows).
    pub nrow: usize,
    /// Columns (image width, or sample lanes for raw windows).
    pub ncol: usize,
}

impl CubeShape {
    /// Create a new shape.
    pub const fn new(nchan: usize, npol: usize, nrow: usize, ncol: usize) -> Self {
        Self {
            nchan,
            npol,
            nrow,
            ncol,
        }
    }

    /// Total element count.
    pub const fn len(&self) -> usize {
        self.nchan * self.npol * self.nrow * self.ncol
    }

    /// Returns true if any axis is zero.
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat index of `(chan, pol, row, col)`.
    #[inline]
    pub const fn index(&self, chan: usize, pol: usize, row: usize, col: usize) -> usize {
        ((chan * self.npol + pol) * self.nrow + row) * self.ncol + col
    }

    /// Element count of one `(pol, row, col)` block.
    pub const fn chan_stride(&self) -> usize {
        self.npol * self.nrow * self.ncol
    }
}

/// Header attached to every [`crate::payload::Payload`].
#[derive(Debug, Clone)]
pub struct PayloadHeader {
    /// Monotonic gulp sequence id assigned by the source.
    pub sequence: u64,
    /// Start time of the window relative to the observation epoch.
    pub start_time: Duration,
    /// Whether the buffer contents may be interpreted.
    ///
    /// Cleared for partial accumulations and windows with detected partial
    /// writes; consumers must not read the data of an invalid payload.
    pub valid: bool,
    /// Logical shape of the contents.
    pub shape: CubeShape,
}

impl PayloadHeader {
    /// Create a header for the given sequence and shape.
    pub fn new(sequence: u64, start_time: Duration, shape: CubeShape) -> Self {
        Self {
            sequence,
            start_time,
            valid: true,
            shape,
        }
    }

    /// Mark the payload as not interpretable.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }
}
