//! Segment classification types.

use std::fmt;

/// Nonce stamped into a segment's header and tail; the tail is only trusted
/// when its nonce matches the header's.
pub type SegmentNonce = u32;

// ---------------------------------------------------------------------------
// SegmentKind
// ---------------------------------------------------------------------------

/// What a segment holds: the sequential record log, or out-of-line extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SegmentKind {
    Journal = 0,
    Ool = 1,
}

impl SegmentKind {
    /// On-disk byte.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode the on-disk byte.
    #[inline]
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Journal),
            1 => Some(Self::Ool),
            _ => None,
        }
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Journal => f.write_str("journal"),
            Self::Ool => f.write_str("ool"),
        }
    }
}

// ---------------------------------------------------------------------------
// DataCategory
// ---------------------------------------------------------------------------

/// Rough content class of a segment, used for placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataCategory {
    Metadata = 0,
    Data = 1,
}

impl DataCategory {
    /// On-disk byte.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode the on-disk byte.
    #[inline]
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Metadata),
            1 => Some(Self::Data),
            _ => None,
        }
    }
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Metadata => f.write_str("metadata"),
            Self::Data => f.write_str("data"),
        }
    }
}

// ---------------------------------------------------------------------------
// ReclaimGen
// ---------------------------------------------------------------------------

/// Number of reclaim generations.
pub const RECLAIM_GENERATIONS: u8 = 3;

/// Reclaim generation of a segment: separates hot data (fresh writes) from
/// data that survived one or more rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ReclaimGen(u8);

impl ReclaimGen {
    /// Target of fresh user writes.
    pub const HOT: Self = Self(0);
    /// Target of dirty-extent rewrites during journal trimming.
    pub const DIRTY: Self = Self(1);

    /// Validate a raw generation.
    #[inline]
    #[must_use]
    pub const fn new(gen: u8) -> Option<Self> {
        if gen < RECLAIM_GENERATIONS {
            Some(Self(gen))
        } else {
            None
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for ReclaimGen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen{}", self.0)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_byte_round_trip() {
        for kind in [SegmentKind::Journal, SegmentKind::Ool] {
            assert_eq!(SegmentKind::from_u8(kind.as_u8()), Some(kind));
        }
        assert_eq!(SegmentKind::from_u8(7), None);
    }

    #[test]
    fn category_byte_round_trip() {
        for cat in [DataCategory::Metadata, DataCategory::Data] {
            assert_eq!(DataCategory::from_u8(cat.as_u8()), Some(cat));
        }
        assert_eq!(DataCategory::from_u8(2), None);
    }

    #[test]
    fn reclaim_gen_bounds() {
        assert_eq!(ReclaimGen::new(0), Some(ReclaimGen::HOT));
        assert_eq!(ReclaimGen::new(1), Some(ReclaimGen::DIRTY));
        assert!(ReclaimGen::new(RECLAIM_GENERATIONS - 1).is_some());
        assert_eq!(ReclaimGen::new(RECLAIM_GENERATIONS), None);
    }

    #[test]
    fn display_names() {
        assert_eq!(SegmentKind::Journal.to_string(), "journal");
        assert_eq!(DataCategory::Data.to_string(), "data");
        assert_eq!(ReclaimGen::DIRTY.to_string(), "gen1");
    }
}
