//! Core identifier, address, and on-disk types for the segstore engine.
//!
//! Everything here is a plain value type: packed addresses, sequence
//! numbers, segment classification, the generic segment index, and the
//! bit-exact on-disk header/tail codecs. No I/O, no async.

pub mod addr;
pub mod disk;
pub mod journal;
pub mod segment;
pub mod segment_map;
pub mod time;

pub use addr::{AddrKind, DeviceId, Laddr, Paddr, PaddrParts, SegmentId};
pub use disk::{SEGMENT_HEADER_SIZE, SEGMENT_TAIL_SIZE, SegmentHeader, SegmentTail};
pub use journal::{JournalSeq, SegmentSeq};
pub use segment::{DataCategory, RECLAIM_GENERATIONS, ReclaimGen, SegmentKind, SegmentNonce};
pub use segment_map::SegmentMap;
pub use time::ModTime;
