//! Sequence-order restoration between parallel correlators.

use std::collections::BTreeMap;

use smallvec::SmallVec;
use tracing::warn;

use crate::payload::Payload;

/// Ready cubes released by one push, already in sequence order.
pub type Ready = SmallVec<[Payload<f32>; 4]>;

/// Restores monotonic sequence order on a stream fanned out across several
/// correlator instances.
///
/// Cubes are held until every earlier sequence has either arrived or been
/// given up on. The hold is bounded by `depth`: when more cubes are pending
/// than that, the gap is declared lost and emission advances past it. A
/// cube arriving after its slot was given up on is dropped.
pub struct Reorder {
    next_seq: u64,
    depth: usize,
    pending: BTreeMap<u64, Payload<f32>>,
    dropped: u64,
}

impl Reorder {
    /// A reorder window holding at most `depth` pending cubes.
    pub fn new(depth: usize) -> Self {
        Self {
            next_seq: 0,
            depth: depth.max(1),
            pending: BTreeMap::new(),
            dropped: 0,
        }
    }

    /// Offer one cube; returns every cube that became emittable.
    pub fn push(&mut self, cube: Payload<f32>) -> Ready {
        let seq = cube.header().sequence;
        if seq < self.next_seq {
            self.dropped += 1;
            warn!(seq, expected = self.next_seq, "dropping late cube");
            return Ready::new();
        }
        self.pending.insert(seq, cube);

        let mut ready = Ready::new();
        loop {
            match self.pending.first_key_value() {
                Some((&head, _)) if head == self.next_seq => {}
                // A gap at the head: wait unless the window is full, then
                // give up on the missing sequences.
                Some((&head, _)) if self.pending.len() > self.depth => {
                    warn!(
                        from = self.next_seq,
                        to = head,
                        "giving up on missing sequences"
                    );
                    self.next_seq = head;
                }
                _ => break,
            }
            if let Some((seq, cube)) = self.pending.pop_first() {
                self.next_seq = seq + 1;
                ready.push(cube);
            }
        }
        ready
    }

    /// Release everything still pending, in order. Used at end of stream.
    pub fn flush(&mut self) -> Ready {
        let mut ready = Ready::new();
        while let Some((seq, cube)) = self.pending.pop_first() {
            self.next_seq = seq + 1;
            ready.push(cube);
        }
        ready
    }

    /// Cubes dropped for arriving after their slot was abandoned.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Cubes currently held back.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
