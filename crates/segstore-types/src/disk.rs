//! Bit-exact on-disk segment metadata.
//!
//! Every segment carries a [`SegmentHeader`] in its first block and, when it
//! was closed cleanly, a [`SegmentTail`] in its last block. Both are encoded
//! little-endian behind a two-byte `(struct_version, compat_version)`
//! envelope and a `u32` payload length:
//!
//! ```text
//! header payload: seq u32 | segment u32 | dirty_tail (u32+u64)
//!               | alloc_tail (u32+u64) | nonce u32 | type u8
//!               | category u8 | generation u8              (39 bytes)
//! tail payload:   seq u32 | segment u32 | nonce u32 | type u8
//!               | modify_time i64 | num_extents u64        (29 bytes)
//! ```
//!
//! Decoders accept trailing padding (callers hand in whole device blocks).

use segstore_error::{Result, StoreError};

use crate::addr::{AddrKind, DeviceId, Paddr, SegmentId, DEVICE_SEGMENT_ID_BITS};
use crate::journal::{JournalSeq, SegmentSeq};
use crate::segment::{DataCategory, ReclaimGen, SegmentKind, SegmentNonce};
use crate::time::ModTime;

/// Current structure version.
pub const DISK_STRUCT_VERSION: u8 = 1;
/// Oldest readable structure version.
pub const DISK_COMPAT_VERSION: u8 = 1;

/// Envelope: version byte, compat byte, payload length.
const ENVELOPE_SIZE: usize = 2 + 4;

/// Encoded size of a [`SegmentHeader`].
pub const SEGMENT_HEADER_SIZE: usize = ENVELOPE_SIZE + 39;
/// Encoded size of a [`SegmentTail`].
pub const SEGMENT_TAIL_SIZE: usize = ENVELOPE_SIZE + 29;

// ---------------------------------------------------------------------------
// Field-level helpers
// ---------------------------------------------------------------------------

struct Writer<'a> {
    buf: &'a mut Vec<u8>,
}

impl Writer<'_> {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn journal_seq(&mut self, v: JournalSeq) {
        self.u32(v.seq.get());
        self.u64(v.offset.raw());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(StoreError::Corrupt {
                detail: format!("{} truncated at byte {}", self.what, self.pos),
            });
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().expect("4 bytes")))
    }
    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }
    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().expect("8 bytes")))
    }

    fn journal_seq(&mut self) -> Result<JournalSeq> {
        let seq = SegmentSeq::new(self.u32()?);
        let offset = Paddr::from_raw(self.u64()?);
        Ok(JournalSeq::new(seq, offset))
    }

    /// A segment id must carry a segmented device id; hostile bytes fail
    /// decode rather than trip the constructor's assertion.
    fn segment_id(&mut self) -> Result<SegmentId> {
        let raw = self.u32()?;
        let device = DeviceId::new((raw >> DEVICE_SEGMENT_ID_BITS) as u8);
        if !matches!(device.addr_kind(), AddrKind::Segment) {
            return Err(self.corrupt(format!("bad segment id {raw:#x}")));
        }
        Ok(SegmentId::from_raw(raw))
    }

    /// Validate the envelope and that the payload covers `expected` bytes.
    fn envelope(&mut self, expected: usize) -> Result<()> {
        let version = self.u8()?;
        let compat = self.u8()?;
        if version < DISK_COMPAT_VERSION || compat > DISK_STRUCT_VERSION {
            return Err(StoreError::Corrupt {
                detail: format!(
                    "{} version {}/{} is not readable by {}/{}",
                    self.what, version, compat, DISK_STRUCT_VERSION, DISK_COMPAT_VERSION
                ),
            });
        }
        let len = self.u32()? as usize;
        if len != expected {
            return Err(StoreError::Corrupt {
                detail: format!("{} payload length {} != {}", self.what, len, expected),
            });
        }
        Ok(())
    }

    fn corrupt(&self, detail: String) -> StoreError {
        StoreError::Corrupt {
            detail: format!("{}: {detail}", self.what),
        }
    }
}

fn encode_envelope(buf: &mut Vec<u8>, payload_len: usize) {
    buf.push(DISK_STRUCT_VERSION);
    buf.push(DISK_COMPAT_VERSION);
    buf.extend_from_slice(&(payload_len as u32).to_le_bytes());
}

// ---------------------------------------------------------------------------
// SegmentHeader
// ---------------------------------------------------------------------------

/// Metadata written to the first block of every segment when it opens.
///
/// Replay bootstraps from the headers alone: the newest journal header wins
/// and its embedded tails seed the journal bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub seq: SegmentSeq,
    pub physical_segment_id: SegmentId,
    pub dirty_tail: JournalSeq,
    pub alloc_tail: JournalSeq,
    pub nonce: SegmentNonce,
    pub kind: SegmentKind,
    pub category: DataCategory,
    pub generation: ReclaimGen,
}

impl SegmentHeader {
    /// Encode to the exact on-disk byte layout.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SEGMENT_HEADER_SIZE);
        encode_envelope(&mut buf, SEGMENT_HEADER_SIZE - ENVELOPE_SIZE);
        let mut w = Writer { buf: &mut buf };
        w.u32(self.seq.get());
        w.u32(self.physical_segment_id.raw());
        w.journal_seq(self.dirty_tail);
        w.journal_seq(self.alloc_tail);
        w.u32(self.nonce);
        w.u8(self.kind.as_u8());
        w.u8(self.category.as_u8());
        w.u8(self.generation.get());
        debug_assert_eq!(buf.len(), SEGMENT_HEADER_SIZE);
        buf
    }

    /// Decode from a device block; trailing padding is ignored.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf, "segment header");
        r.envelope(SEGMENT_HEADER_SIZE - ENVELOPE_SIZE)?;
        let seq = SegmentSeq::new(r.u32()?);
        let physical_segment_id = r.segment_id()?;
        let dirty_tail = r.journal_seq()?;
        let alloc_tail = r.journal_seq()?;
        let nonce = r.u32()?;
        let kind_raw = r.u8()?;
        let kind = SegmentKind::from_u8(kind_raw)
            .ok_or_else(|| r.corrupt(format!("bad segment type {kind_raw}")))?;
        let category_raw = r.u8()?;
        let category = DataCategory::from_u8(category_raw)
            .ok_or_else(|| r.corrupt(format!("bad category {category_raw}")))?;
        let gen_raw = r.u8()?;
        let generation = ReclaimGen::new(gen_raw)
            .ok_or_else(|| r.corrupt(format!("bad generation {gen_raw}")))?;
        Ok(Self {
            seq,
            physical_segment_id,
            dirty_tail,
            alloc_tail,
            nonce,
            kind,
            category,
            generation,
        })
    }
}

// ---------------------------------------------------------------------------
// SegmentTail
// ---------------------------------------------------------------------------

/// Metadata written to the last block of a segment as it closes.
///
/// Valid only when its nonce matches the header's; a mismatch means the
/// close never completed and the segment must be scanned instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentTail {
    pub seq: SegmentSeq,
    pub physical_segment_id: SegmentId,
    pub nonce: SegmentNonce,
    pub kind: SegmentKind,
    pub modify_time: ModTime,
    pub num_extents: u64,
}

impl SegmentTail {
    /// Encode to the exact on-disk byte layout.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SEGMENT_TAIL_SIZE);
        encode_envelope(&mut buf, SEGMENT_TAIL_SIZE - ENVELOPE_SIZE);
        let mut w = Writer { buf: &mut buf };
        w.u32(self.seq.get());
        w.u32(self.physical_segment_id.raw());
        w.u32(self.nonce);
        w.u8(self.kind.as_u8());
        w.i64(self.modify_time.as_millis());
        w.u64(self.num_extents);
        debug_assert_eq!(buf.len(), SEGMENT_TAIL_SIZE);
        buf
    }

    /// Decode from a device block; trailing padding is ignored.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf, "segment tail");
        r.envelope(SEGMENT_TAIL_SIZE - ENVELOPE_SIZE)?;
        let seq = SegmentSeq::new(r.u32()?);
        let physical_segment_id = r.segment_id()?;
        let nonce = r.u32()?;
        let kind_raw = r.u8()?;
        let kind = SegmentKind::from_u8(kind_raw)
            .ok_or_else(|| r.corrupt(format!("bad segment type {kind_raw}")))?;
        let modify_time = ModTime::from_millis(r.i64()?);
        let num_extents = r.u64()?;
        Ok(Self {
            seq,
            physical_segment_id,
            nonce,
            kind,
            modify_time,
            num_extents,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::DeviceId;

    fn sample_header() -> SegmentHeader {
        let journal_seg = SegmentId::new(DeviceId::new(0), 1);
        SegmentHeader {
            seq: SegmentSeq::new(7),
            physical_segment_id: SegmentId::new(DeviceId::new(0), 3),
            dirty_tail: JournalSeq::new(SegmentSeq::new(5), Paddr::new_seg(journal_seg, 128)),
            alloc_tail: JournalSeq::new(SegmentSeq::new(6), Paddr::new_seg(journal_seg, 512)),
            nonce: 0xDEAD_BEEF,
            kind: SegmentKind::Journal,
            category: DataCategory::Metadata,
            generation: ReclaimGen::HOT,
        }
    }

    fn sample_tail() -> SegmentTail {
        SegmentTail {
            seq: SegmentSeq::new(7),
            physical_segment_id: SegmentId::new(DeviceId::new(0), 3),
            nonce: 0xDEAD_BEEF,
            kind: SegmentKind::Ool,
            modify_time: ModTime::from_millis(1_700_000_000_000),
            num_extents: 42,
        }
    }

    #[test]
    fn header_round_trip() {
        let header = sample_header();
        let bytes = header.encode();
        assert_eq!(bytes.len(), SEGMENT_HEADER_SIZE);
        assert_eq!(SegmentHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn tail_round_trip() {
        let tail = sample_tail();
        let bytes = tail.encode();
        assert_eq!(bytes.len(), SEGMENT_TAIL_SIZE);
        assert_eq!(SegmentTail::decode(&bytes).unwrap(), tail);
    }

    #[test]
    fn decode_ignores_block_padding() {
        let mut block = sample_header().encode();
        block.resize(4096, 0);
        assert_eq!(SegmentHeader::decode(&block).unwrap(), sample_header());
    }

    #[test]
    fn header_layout_is_fixed() {
        let bytes = sample_header().encode();
        // Envelope.
        assert_eq!(bytes[0], DISK_STRUCT_VERSION);
        assert_eq!(bytes[1], DISK_COMPAT_VERSION);
        assert_eq!(u32::from_le_bytes(bytes[2..6].try_into().unwrap()), 39);
        // seq at offset 6, little-endian.
        assert_eq!(u32::from_le_bytes(bytes[6..10].try_into().unwrap()), 7);
        // dirty_tail.seq at offset 14.
        assert_eq!(u32::from_le_bytes(bytes[14..18].try_into().unwrap()), 5);
        // nonce at offset 38.
        assert_eq!(
            u32::from_le_bytes(bytes[38..42].try_into().unwrap()),
            0xDEAD_BEEF
        );
        // type, category, generation trail the payload.
        assert_eq!(&bytes[42..45], &[0, 0, 0]);
    }

    #[test]
    fn truncated_buffer_is_corrupt() {
        let bytes = sample_tail().encode();
        let err = SegmentTail::decode(&bytes[..10]).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[test]
    fn bad_discriminants_are_corrupt() {
        let mut bytes = sample_header().encode();
        bytes[42] = 9; // segment type
        assert!(matches!(
            SegmentHeader::decode(&bytes),
            Err(StoreError::Corrupt { .. })
        ));

        let mut bytes = sample_header().encode();
        bytes[44] = crate::segment::RECLAIM_GENERATIONS; // generation out of range
        assert!(matches!(
            SegmentHeader::decode(&bytes),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn wrong_length_is_corrupt() {
        let mut bytes = sample_header().encode();
        bytes[2] = 38;
        assert!(matches!(
            SegmentHeader::decode(&bytes),
            Err(StoreError::Corrupt { .. })
        ));
    }
}
