//! Packed physical-address types.
//!
//! Every address on a segmented device fits in a single `u64`. The top eight
//! bits carry the device id, whose value range partitions the address space:
//!
//! ```text
//! device id 0..=127     SEGMENT       (segment_id << 32) | segment_offset
//! device id 128..=248   RANDOM_BLOCK  (device_id << 56) | block_offset
//! device id 249..=255   RESERVED      (device_id << 56) | signed_offset
//! ```
//!
//! Reserved device ids denote the distinguished addresses (null, zero, root,
//! record-relative, block-relative, delayed, fake). Addresses are totally
//! ordered by their packed representation.

use std::fmt;

/// Bits of a device id.
pub const DEVICE_ID_BITS: u32 = 8;
/// Bits of a per-device segment index within a [`SegmentId`].
pub const DEVICE_SEGMENT_ID_BITS: u32 = 24;
/// Bits of a segment offset within a [`Paddr`].
pub const SEGMENT_OFF_BITS: u32 = 32;
/// Bits of a random-block offset within a [`Paddr`].
pub const BLOCK_OFF_BITS: u32 = 64 - DEVICE_ID_BITS;

/// Largest per-device segment index.
pub const DEVICE_SEGMENT_ID_MAX: u32 = (1 << DEVICE_SEGMENT_ID_BITS) - 1;
/// Largest random-block offset.
pub const BLOCK_OFF_MAX: u64 = (1 << BLOCK_OFF_BITS) - 1;

// ---------------------------------------------------------------------------
// DeviceId
// ---------------------------------------------------------------------------

/// An 8-bit device identifier.
///
/// The value range decides how a [`Paddr`] carrying it is interpreted, see
/// [`AddrKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct DeviceId(u8);

impl DeviceId {
    /// Null device (also the device id of [`Paddr::NULL`]).
    pub const NULL: Self = Self(u8::MAX);
    /// Record-relative reserved device.
    pub const RECORD_RELATIVE: Self = Self(u8::MAX - 1);
    /// Block-relative reserved device.
    pub const BLOCK_RELATIVE: Self = Self(u8::MAX - 2);
    /// Delayed-allocation reserved device.
    pub const DELAYED: Self = Self(u8::MAX - 3);
    /// Fake device used by tests.
    pub const FAKE: Self = Self(u8::MAX - 4);
    /// Zero-extent reserved device.
    pub const ZERO: Self = Self(u8::MAX - 5);
    /// Root reserved device.
    pub const ROOT: Self = Self(u8::MAX - 6);
    /// Largest device id that addresses real storage.
    pub const MAX_VALID: Self = Self(u8::MAX - 7);
    /// Largest device id that addresses a segmented device.
    pub const MAX_VALID_SEGMENT: Self = Self(u8::MAX >> 1);

    /// Wrap a raw device id.
    #[inline]
    #[must_use]
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    /// Raw value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Address interpretation for addresses carrying this device id.
    #[inline]
    #[must_use]
    pub const fn addr_kind(self) -> AddrKind {
        if self.0 > Self::MAX_VALID.0 {
            AddrKind::Reserved
        } else if self.0 <= Self::MAX_VALID_SEGMENT.0 {
            AddrKind::Segment
        } else {
            AddrKind::RandomBlock
        }
    }

    /// Whether reserved addresses of this device carry a meaningful offset.
    #[inline]
    #[must_use]
    pub const fn has_reserved_off(self) -> bool {
        matches!(
            self,
            Self::RECORD_RELATIVE | Self::BLOCK_RELATIVE | Self::DELAYED | Self::FAKE
        )
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NULL => f.write_str("Dnull"),
            Self::RECORD_RELATIVE => f.write_str("Drecrel"),
            Self::BLOCK_RELATIVE => f.write_str("Dblkrel"),
            Self::DELAYED => f.write_str("Ddelayed"),
            Self::FAKE => f.write_str("Dfake"),
            Self::ZERO => f.write_str("Dzero"),
            Self::ROOT => f.write_str("Droot"),
            Self(id) => write!(f, "D{id}"),
        }
    }
}

/// The three interpretations of a packed address, discriminated on the
/// device-id range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddrKind {
    /// `(segment_id, segment_offset)` on a segmented device.
    Segment,
    /// `(device_id, block_offset)` on a random-block device.
    RandomBlock,
    /// A distinguished address (null, zero, root, relative, ...).
    Reserved,
}

// ---------------------------------------------------------------------------
// SegmentId
// ---------------------------------------------------------------------------

/// A 32-bit segment identifier, packed `(device_id << 24) | device_segment`.
///
/// The device id of a segment id is always in the segmented range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SegmentId(u32);

impl SegmentId {
    /// Null segment id (all bits of the valid range set).
    pub const NULL: Self =
        Self::new(DeviceId::MAX_VALID_SEGMENT, DEVICE_SEGMENT_ID_MAX);
    /// Smallest segment id.
    pub const MIN: Self = Self::new(DeviceId::new(0), 0);

    /// Pack a `(device, index)` pair.
    ///
    /// # Panics
    ///
    /// Panics if `device` is not a segmented device or `index` exceeds the
    /// 24-bit range.
    #[inline]
    #[must_use]
    pub const fn new(device: DeviceId, index: u32) -> Self {
        assert!(matches!(device.addr_kind(), AddrKind::Segment));
        assert!(index <= DEVICE_SEGMENT_ID_MAX);
        Self(((device.get() as u32) << DEVICE_SEGMENT_ID_BITS) | index)
    }

    /// Rebuild from the raw packed representation.
    ///
    /// # Panics
    ///
    /// Panics if the embedded device id is not in the segmented range.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        let id = Self(raw);
        assert!(matches!(id.device_id().addr_kind(), AddrKind::Segment));
        id
    }

    /// Raw packed value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Device owning this segment.
    #[inline]
    #[must_use]
    pub const fn device_id(self) -> DeviceId {
        DeviceId::new((self.0 >> DEVICE_SEGMENT_ID_BITS) as u8)
    }

    /// Index of this segment within its device.
    #[inline]
    #[must_use]
    pub const fn device_segment(self) -> u32 {
        self.0 & DEVICE_SEGMENT_ID_MAX
    }

    /// Whether this is the null sentinel.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == Self::NULL.0
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("Snull")
        } else {
            write!(f, "{}S{}", self.device_id(), self.device_segment())
        }
    }
}

// ---------------------------------------------------------------------------
// Paddr
// ---------------------------------------------------------------------------

/// A packed 64-bit physical address.
///
/// Construction goes through the typed constructors; reading goes through
/// [`Paddr::parts`] or the asserting accessors. The derived ordering is the
/// total order on the packed representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Paddr(u64);

/// Decoded view of a [`Paddr`], for pattern matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddrParts {
    /// Absolute address on a segmented device.
    Segment { segment: SegmentId, offset: u32 },
    /// Absolute address on a random-block device.
    Block { device: DeviceId, offset: u64 },
    /// Distinguished or relative address.
    Reserved { device: DeviceId, offset: i32 },
}

impl Paddr {
    /// Smallest address.
    pub const MIN: Self = Self(0);
    /// Null address (device null, offset 0). Also the maximum.
    pub const NULL: Self = Self((DeviceId::NULL.get() as u64) << BLOCK_OFF_BITS);
    /// Distinguished zero-extent address.
    pub const ZERO: Self = Self((DeviceId::ZERO.get() as u64) << BLOCK_OFF_BITS);
    /// Distinguished root address.
    pub const ROOT: Self = Self((DeviceId::ROOT.get() as u64) << BLOCK_OFF_BITS);

    /// Absolute segmented address.
    #[inline]
    #[must_use]
    pub const fn new_seg(segment: SegmentId, offset: u32) -> Self {
        Self(((segment.raw() as u64) << SEGMENT_OFF_BITS) | offset as u64)
    }

    /// Absolute random-block address.
    ///
    /// # Panics
    ///
    /// Panics if `device` is not in the random-block range or the offset
    /// exceeds 56 bits.
    #[inline]
    #[must_use]
    pub const fn new_blk(device: DeviceId, offset: u64) -> Self {
        assert!(matches!(device.addr_kind(), AddrKind::RandomBlock));
        assert!(offset <= BLOCK_OFF_MAX);
        Self(((device.get() as u64) << BLOCK_OFF_BITS) | offset)
    }

    /// Reserved address with a signed offset.
    ///
    /// # Panics
    ///
    /// Panics if `device` is not in the reserved range.
    #[inline]
    #[must_use]
    pub const fn new_res(device: DeviceId, offset: i32) -> Self {
        assert!(matches!(device.addr_kind(), AddrKind::Reserved));
        Self(((device.get() as u64) << BLOCK_OFF_BITS) | offset as u32 as u64)
    }

    /// Record-relative address.
    #[inline]
    #[must_use]
    pub const fn record_relative(offset: i32) -> Self {
        Self::new_res(DeviceId::RECORD_RELATIVE, offset)
    }

    /// Block-relative address.
    #[inline]
    #[must_use]
    pub const fn block_relative(offset: i32) -> Self {
        Self::new_res(DeviceId::BLOCK_RELATIVE, offset)
    }

    /// Rebuild from the packed representation (on-disk decode path).
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Packed representation (on-disk encode path).
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Device id embedded in the top bits.
    #[inline]
    #[must_use]
    pub const fn device_id(self) -> DeviceId {
        DeviceId::new((self.0 >> BLOCK_OFF_BITS) as u8)
    }

    /// Address interpretation.
    #[inline]
    #[must_use]
    pub const fn kind(self) -> AddrKind {
        self.device_id().addr_kind()
    }

    /// Decode into the matching variant.
    #[must_use]
    pub const fn parts(self) -> PaddrParts {
        match self.kind() {
            AddrKind::Segment => PaddrParts::Segment {
                segment: SegmentId::from_raw((self.0 >> SEGMENT_OFF_BITS) as u32),
                offset: self.0 as u32,
            },
            AddrKind::RandomBlock => PaddrParts::Block {
                device: self.device_id(),
                offset: self.0 & BLOCK_OFF_MAX,
            },
            AddrKind::Reserved => PaddrParts::Reserved {
                device: self.device_id(),
                offset: self.0 as u32 as i32,
            },
        }
    }

    /// Segment id of a segmented address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not segmented.
    #[inline]
    #[must_use]
    pub const fn segment_id(self) -> SegmentId {
        assert!(matches!(self.kind(), AddrKind::Segment));
        SegmentId::from_raw((self.0 >> SEGMENT_OFF_BITS) as u32)
    }

    /// Byte offset of a segmented address within its segment.
    ///
    /// # Panics
    ///
    /// Panics if the address is not segmented.
    #[inline]
    #[must_use]
    pub const fn segment_off(self) -> u32 {
        assert!(matches!(self.kind(), AddrKind::Segment));
        self.0 as u32
    }

    /// Same segment, different offset.
    ///
    /// # Panics
    ///
    /// Panics if the address is not segmented.
    #[inline]
    #[must_use]
    pub const fn with_segment_off(self, offset: u32) -> Self {
        Self::new_seg(self.segment_id(), offset)
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == Self::NULL.0
    }

    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == Self::ZERO.0
    }

    #[inline]
    #[must_use]
    pub const fn is_root(self) -> bool {
        self.0 == Self::ROOT.0
    }

    /// Whether the address names a physical location (absolute, relative, or
    /// delayed) rather than a pure sentinel.
    #[inline]
    #[must_use]
    pub const fn is_real(self) -> bool {
        !self.is_null() && !self.is_zero() && !self.is_root()
    }

    /// Whether the address is absolute (segment or random-block).
    #[inline]
    #[must_use]
    pub const fn is_absolute(self) -> bool {
        !matches!(self.kind(), AddrKind::Reserved)
    }
}

impl fmt::Display for Paddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parts() {
            PaddrParts::Segment { segment, offset } => {
                write!(f, "{segment}+{offset:#x}")
            }
            PaddrParts::Block { device, offset } => {
                write!(f, "{device}+{offset:#x}")
            }
            PaddrParts::Reserved { device, offset } => {
                if self.is_null() {
                    f.write_str("Pnull")
                } else if self.is_zero() {
                    f.write_str("Pzero")
                } else if self.is_root() {
                    f.write_str("Proot")
                } else {
                    write!(f, "{device}{offset:+#x}")
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Laddr
// ---------------------------------------------------------------------------

/// A 64-bit opaque logical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Laddr(u64);

impl Laddr {
    /// Smallest logical address.
    pub const MIN: Self = Self(0);
    /// Null sentinel (maximum value).
    pub const NULL: Self = Self(u64::MAX);
    /// Root sentinel.
    pub const ROOT: Self = Self(u64::MAX - 1);

    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == Self::NULL.0
    }
}

impl fmt::Display for Laddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("Lnull")
        } else {
            write!(f, "L{:#x}", self.0)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_kind_partition() {
        assert_eq!(DeviceId::new(0).addr_kind(), AddrKind::Segment);
        assert_eq!(DeviceId::new(127).addr_kind(), AddrKind::Segment);
        assert_eq!(DeviceId::new(128).addr_kind(), AddrKind::RandomBlock);
        assert_eq!(DeviceId::MAX_VALID.addr_kind(), AddrKind::RandomBlock);
        assert_eq!(DeviceId::NULL.addr_kind(), AddrKind::Reserved);
        assert_eq!(DeviceId::ROOT.addr_kind(), AddrKind::Reserved);
        assert_eq!(DeviceId::RECORD_RELATIVE.addr_kind(), AddrKind::Reserved);
    }

    #[test]
    fn segment_id_packing_round_trip() {
        let id = SegmentId::new(DeviceId::new(3), 0x00_1234);
        assert_eq!(id.device_id(), DeviceId::new(3));
        assert_eq!(id.device_segment(), 0x1234);
        assert_eq!(SegmentId::from_raw(id.raw()), id);
    }

    #[test]
    fn segment_id_null_is_max_of_valid_range() {
        assert_eq!(SegmentId::NULL.device_id(), DeviceId::MAX_VALID_SEGMENT);
        assert_eq!(SegmentId::NULL.device_segment(), DEVICE_SEGMENT_ID_MAX);
        assert!(SegmentId::NULL.is_null());
        assert!(!SegmentId::MIN.is_null());
    }

    #[test]
    fn seg_paddr_round_trip() {
        let seg = SegmentId::new(DeviceId::new(1), 7);
        let addr = Paddr::new_seg(seg, 4096);
        assert_eq!(addr.kind(), AddrKind::Segment);
        assert_eq!(addr.segment_id(), seg);
        assert_eq!(addr.segment_off(), 4096);
        match addr.parts() {
            PaddrParts::Segment { segment, offset } => {
                assert_eq!(segment, seg);
                assert_eq!(offset, 4096);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn blk_paddr_round_trip() {
        let addr = Paddr::new_blk(DeviceId::new(200), 0xABCDEF);
        assert_eq!(addr.kind(), AddrKind::RandomBlock);
        match addr.parts() {
            PaddrParts::Block { device, offset } => {
                assert_eq!(device, DeviceId::new(200));
                assert_eq!(offset, 0xABCDEF);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn res_paddr_keeps_sign() {
        let addr = Paddr::record_relative(-64);
        match addr.parts() {
            PaddrParts::Reserved { device, offset } => {
                assert_eq!(device, DeviceId::RECORD_RELATIVE);
                assert_eq!(offset, -64);
            }
            other => panic!("wrong variant: {other:?}"),
        }
        assert!(!addr.is_absolute());
    }

    #[test]
    fn paddr_total_order_matches_packed() {
        let seg = SegmentId::new(DeviceId::new(0), 0);
        let a = Paddr::new_seg(seg, 0);
        let b = Paddr::new_seg(seg, 512);
        let c = Paddr::new_seg(SegmentId::new(DeviceId::new(0), 1), 0);
        assert!(a < b);
        assert!(b < c);
        assert!(c < Paddr::NULL);
        assert_eq!(Paddr::MIN, a);
    }

    #[test]
    fn distinguished_addresses() {
        assert!(Paddr::NULL.is_null());
        assert!(Paddr::ZERO.is_zero());
        assert!(Paddr::ROOT.is_root());
        assert!(!Paddr::NULL.is_real());
        assert!(!Paddr::ZERO.is_real());
        let real = Paddr::new_seg(SegmentId::MIN, 0);
        assert!(real.is_real());
        assert!(real.is_absolute());
    }

    #[test]
    fn with_segment_off_preserves_segment() {
        let seg = SegmentId::new(DeviceId::new(2), 9);
        let addr = Paddr::new_seg(seg, 0).with_segment_off(768);
        assert_eq!(addr.segment_id(), seg);
        assert_eq!(addr.segment_off(), 768);
    }

    #[test]
    fn laddr_sentinels() {
        assert!(Laddr::NULL.is_null());
        assert!(!Laddr::ROOT.is_null());
        assert_eq!(Laddr::ROOT.get(), u64::MAX - 1);
        assert!(Laddr::new(42) < Laddr::ROOT);
    }

    #[test]
    fn display_formats() {
        let seg = SegmentId::new(DeviceId::new(1), 2);
        assert_eq!(seg.to_string(), "D1S2");
        assert_eq!(SegmentId::NULL.to_string(), "Snull");
        assert_eq!(Paddr::new_seg(seg, 256).to_string(), "D1S2+0x100");
        assert_eq!(Paddr::NULL.to_string(), "Pnull");
        assert_eq!(Laddr::NULL.to_string(), "Lnull");
    }
}
