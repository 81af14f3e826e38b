//! Journal sequence numbers.
//!
//! A [`JournalSeq`] names a position in the sequential record log:
//! `(segment_seq, paddr)` ordered lexicographically. Byte arithmetic on
//! journal positions rolls across segment boundaries, so the helpers here
//! take the roll size (the shared segment size) as a parameter.

use std::cmp::Ordering;
use std::fmt;

use crate::addr::{AddrKind, Paddr, PaddrParts, SegmentId};

// ---------------------------------------------------------------------------
// SegmentSeq
// ---------------------------------------------------------------------------

/// A 32-bit monotonic per-segment-type sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SegmentSeq(u32);

impl SegmentSeq {
    /// Null sentinel (maximum value).
    pub const NULL: Self = Self(u32::MAX);
    /// First sequence.
    pub const MIN: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(seq: u32) -> Self {
        Self(seq)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == Self::NULL.0
    }

    /// The next sequence.
    ///
    /// # Panics
    ///
    /// Panics on the null sentinel.
    #[inline]
    #[must_use]
    pub const fn succ(self) -> Self {
        assert!(!self.is_null());
        Self(self.0 + 1)
    }
}

impl fmt::Display for SegmentSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("seq(null)")
        } else {
            write!(f, "seq({})", self.0)
        }
    }
}

// ---------------------------------------------------------------------------
// JournalSeq
// ---------------------------------------------------------------------------

/// A position in the journal: `(segment_seq, offset)`.
///
/// Ordering is lexicographic on `(segment_seq, offset-within-device,
/// segment-id)`; the null sequence is the maximum.
#[derive(Debug, Clone, Copy)]
pub struct JournalSeq {
    pub seq: SegmentSeq,
    pub offset: Paddr,
}

impl JournalSeq {
    /// Null sentinel, compares greater than every real sequence.
    pub const NULL: Self = Self {
        seq: SegmentSeq::NULL,
        offset: Paddr::NULL,
    };

    /// Smallest sequence.
    pub const MIN: Self = Self {
        seq: SegmentSeq::MIN,
        offset: Paddr::MIN,
    };

    #[inline]
    #[must_use]
    pub const fn new(seq: SegmentSeq, offset: Paddr) -> Self {
        Self { seq, offset }
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.seq.is_null()
    }

    /// Comparison key: offsets compare by `(byte offset, segment id)` so that
    /// positions within one journal segment order by offset first.
    fn key(&self) -> (u32, i64, u32) {
        let (off, seg) = match self.offset.parts() {
            PaddrParts::Segment { segment, offset } => (i64::from(offset), segment.raw()),
            PaddrParts::Block { offset, .. } => (offset as i64, SegmentId::NULL.raw()),
            PaddrParts::Reserved { offset, .. } => (i64::from(offset), SegmentId::NULL.raw()),
        };
        (self.seq.get(), off, seg)
    }

    /// Move this position by `delta` bytes, rolling across segments of
    /// `roll_size` bytes. Going below the start of the journal saturates at
    /// [`JournalSeq::MIN`]. The segment id of the offset is preserved; only
    /// the ordering of the result is meaningful across segments.
    ///
    /// # Panics
    ///
    /// Panics if this sequence is null, its offset is not segmented, or
    /// `roll_size` is zero.
    #[must_use]
    pub fn add_offset(self, delta: i64, roll_size: u32) -> Self {
        assert!(!self.is_null());
        assert!(matches!(self.offset.kind(), AddrKind::Segment));
        assert!(roll_size > 0);
        let roll = i64::from(roll_size);

        let mut seq = i64::from(self.seq.get());
        let mut off = i64::from(self.offset.segment_off());
        if delta >= 0 {
            seq += delta / roll;
            off += delta % roll;
            if off >= roll {
                seq += 1;
                off -= roll;
            }
        } else {
            let back = -delta;
            seq -= back / roll;
            off -= back % roll;
            if off < 0 {
                seq -= 1;
                off += roll;
            }
            if seq < 0 {
                return Self::MIN;
            }
        }
        debug_assert!((0..roll).contains(&off));
        Self {
            seq: SegmentSeq::new(u32::try_from(seq).expect("segment seq overflow")),
            offset: self.offset.with_segment_off(off as u32),
        }
    }

    /// Bytes from `tail` (inclusive) up to this position, rolling across
    /// segments of `roll_size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if either sequence is null or `tail` is ahead of `self`.
    #[must_use]
    pub fn bytes_since(self, tail: JournalSeq, roll_size: u32) -> u64 {
        assert!(!self.is_null() && !tail.is_null());
        let head_lin = i64::from(self.seq.get()) * i64::from(roll_size)
            + i64::from(self.offset.segment_off());
        let tail_lin = i64::from(tail.seq.get()) * i64::from(roll_size)
            + i64::from(tail.offset.segment_off());
        assert!(
            head_lin >= tail_lin,
            "journal tail {tail} is ahead of head {self}"
        );
        (head_lin - tail_lin) as u64
    }
}

impl PartialEq for JournalSeq {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for JournalSeq {}

impl PartialOrd for JournalSeq {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for JournalSeq {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for JournalSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("jseq(null)")
        } else {
            write!(f, "jseq({}, {})", self.seq.get(), self.offset)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
