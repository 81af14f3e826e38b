//! Monotonic segment-sequence allocation.

use std::cell::Cell;

use segstore_types::{SegmentKind, SegmentSeq};
use tracing::debug;

/// Hands out strictly increasing segment sequences for one segment type.
///
/// The journal and OOL streams each own an allocator; replay primes them
/// with the highest sequence observed on disk.
#[derive(Debug)]
pub struct SegmentSeqAllocator {
    kind: SegmentKind,
    next: Cell<u32>,
}

impl SegmentSeqAllocator {
    #[must_use]
    pub fn new(kind: SegmentKind) -> Self {
        Self {
            kind,
            next: Cell::new(0),
        }
    }

    /// Next unused sequence; advances the counter.
    #[must_use]
    pub fn get_and_inc_next_segment_seq(&self) -> SegmentSeq {
        let seq = self.next.get();
        self.next.set(seq + 1);
        SegmentSeq::new(seq)
    }

    /// Prime the counter so the next allocation returns at least `seq`.
    /// Never regresses.
    pub fn set_next_segment_seq(&self, seq: SegmentSeq) {
        assert!(!seq.is_null());
        if seq.get() > self.next.get() {
            debug!(kind = %self.kind, from = self.next.get(), to = seq.get(), "advancing next segment seq");
            self.next.set(seq.get());
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
