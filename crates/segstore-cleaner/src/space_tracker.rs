//! Per-segment live-byte accounting.
//!
//! Two interchangeable trackers stand behind the [`SpaceTracker`] trait:
//!
//! - [`SimpleSpaceTracker`] keeps one live-byte counter per segment. O(1)
//!   per operation; the production default.
//! - [`DetailedSpaceTracker`] additionally keeps a block-granular bitmap per
//!   segment, catching double-allocates and double-releases exactly. Used
//!   in audits.
//!
//! Under an identical operation stream the two must agree; [`SpaceTracker::
//! equals`] verifies that in tests. Accounting violations are fatal: once
//! live-byte tracking is wrong there is no safe way to reclaim anything.

use segstore_types::{DeviceId, SegmentId, SegmentMap};
use tracing::{debug, error};

/// Per-device geometry handed to tracker constructors at mount.
#[derive(Debug, Clone, Copy)]
pub struct TrackerDeviceSpec {
    pub device: DeviceId,
    pub num_segments: u32,
    pub segment_size: u32,
    pub block_size: u32,
}

/// Live-byte accounting per segment.
///
/// Offsets and lengths are multiples of the device block size.
pub trait SpaceTracker {
    /// Mark `[offset, offset + len)` of `segment` live; returns the
    /// segment's new live-byte count.
    fn allocate(&mut self, segment: SegmentId, offset: u32, len: u32) -> i64;

    /// Mark `[offset, offset + len)` of `segment` dead; returns the
    /// segment's new live-byte count.
    fn release(&mut self, segment: SegmentId, offset: u32, len: u32) -> i64;

    /// Live bytes of `segment`; zero iff every block is free.
    fn get_usage(&self, segment: SegmentId) -> i64;

    /// Log the live state of `segment` (error level; precedes an abort).
    fn dump_usage(&self, segment: SegmentId);

    /// Zero all counters. Mount uses this before journal replay
    /// repopulates the accounting.
    fn reset(&mut self);

    /// Per-segment usage in `(device, index)` order, for audits.
    fn usage_snapshot(&self) -> Vec<(SegmentId, i64)>;

    /// Whether `other` agrees on every segment's usage. Test audit hook.
    fn equals(&self, other: &dyn SpaceTracker) -> bool {
        let mine = self.usage_snapshot();
        let theirs = other.usage_snapshot();
        if mine.len() != theirs.len() {
            error!(
                mine = mine.len(),
                theirs = theirs.len(),
                "space tracker segment counts differ, bug in test setup"
            );
            return false;
        }
        let mut all_match = true;
        for ((id, a), (other_id, b)) in mine.iter().zip(theirs.iter()) {
            debug_assert_eq!(id, other_id);
            if a != b {
                all_match = false;
                debug!(segment = %id, mine = a, theirs = b, "live byte mismatch");
            }
        }
        all_match
    }
}

// ---------------------------------------------------------------------------
// SimpleSpaceTracker
// ---------------------------------------------------------------------------

/// Counter-only tracker.
pub struct SimpleSpaceTracker {
    live_bytes_by_segment: SegmentMap<i64>,
}

impl SimpleSpaceTracker {
    #[must_use]
    pub fn new(devices: &[TrackerDeviceSpec]) -> Self {
        let mut live_bytes_by_segment = SegmentMap::new();
        for spec in devices {
            live_bytes_by_segment.add_device(spec.device, spec.num_segments as usize, &0);
        }
        Self {
            live_bytes_by_segment,
        }
    }

    fn update_usage(&mut self, segment: SegmentId, delta: i64) -> i64 {
        let live = &mut self.live_bytes_by_segment[segment];
        *live += delta;
        assert!(
            *live >= 0,
            "segment {segment} live bytes went negative ({live})"
        );
        *live
    }
}

impl SpaceTracker for SimpleSpaceTracker {
    fn allocate(&mut self, segment: SegmentId, _offset: u32, len: u32) -> i64 {
        self.update_usage(segment, i64::from(len))
    }

    fn release(&mut self, segment: SegmentId, _offset: u32, len: u32) -> i64 {
        self.update_usage(segment, -i64::from(len))
    }

    fn get_usage(&self, segment: SegmentId) -> i64 {
        self.live_bytes_by_segment[segment]
    }

    fn dump_usage(&self, segment: SegmentId) {
        error!(
            segment = %segment,
            live_bytes = self.live_bytes_by_segment[segment],
            "segment usage"
        );
    }

    fn reset(&mut self) {
        let ids: Vec<SegmentId> = self
            .live_bytes_by_segment
            .iter()
            .map(|(id, _)| id)
            .collect();
        for id in ids {
            self.live_bytes_by_segment[id] = 0;
        }
    }

    fn usage_snapshot(&self) -> Vec<(SegmentId, i64)> {
        self.live_bytes_by_segment
            .iter()
            .map(|(id, live)| (id, *live))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// DetailedSpaceTracker
// ---------------------------------------------------------------------------

/// Bitmap state of one segment.
#[derive(Debug, Clone)]
struct SegmentUsage {
    bitmap: Vec<bool>,
    live_bytes: i64,
}

impl SegmentUsage {
    fn new(blocks: usize) -> Self {
        Self {
            bitmap: vec![false; blocks],
            live_bytes: 0,
        }
    }
}

/// Bitmap tracker catching exact double-allocate / double-release.
pub struct DetailedSpaceTracker {
    segment_usage: SegmentMap<SegmentUsage>,
    /// Block size per device id, indexed by raw device id.
    block_size_by_device: Vec<u32>,
}

impl DetailedSpaceTracker {
    #[must_use]
    pub fn new(devices: &[TrackerDeviceSpec]) -> Self {
        let mut segment_usage = SegmentMap::new();
        let mut block_size_by_device = vec![0; usize::from(u8::MAX) + 1];
        for spec in devices {
            assert!(spec.block_size > 0);
            assert_eq!(spec.segment_size % spec.block_size, 0);
            let blocks = (spec.segment_size / spec.block_size) as usize;
            segment_usage.add_device(
                spec.device,
                spec.num_segments as usize,
                &SegmentUsage::new(blocks),
            );
            block_size_by_device[usize::from(spec.device.get())] = spec.block_size;
        }
        Self {
            segment_usage,
            block_size_by_device,
        }
    }

    fn block_size(&self, segment: SegmentId) -> u32 {
        self.block_size_by_device[usize::from(segment.device_id().get())]
    }

    fn block_range(&self, segment: SegmentId, offset: u32, len: u32) -> (usize, usize) {
        let block_size = self.block_size(segment);
        assert_eq!(offset % block_size, 0, "offset {offset} is not block aligned");
        assert_eq!(len % block_size, 0, "length {len} is not block aligned");
        (
            (offset / block_size) as usize,
            ((offset + len) / block_size) as usize,
        )
    }
}

impl SpaceTracker for DetailedSpaceTracker {
    fn allocate(&mut self, segment: SegmentId, offset: u32, len: u32) -> i64 {
        let (begin, end) = self.block_range(segment, offset, len);
        let usage = &mut self.segment_usage[segment];
        for block in begin..end {
            if usage.bitmap[block] {
                error!(
                    segment = %segment,
                    offset,
                    len,
                    block,
                    "double allocate"
                );
                panic!("segment {segment} block {block} allocated twice");
            }
            usage.bitmap[block] = true;
        }
        usage.live_bytes += i64::from(len);
        usage.live_bytes
    }

    fn release(&mut self, segment: SegmentId, offset: u32, len: u32) -> i64 {
        let (begin, end) = self.block_range(segment, offset, len);
        let usage = &mut self.segment_usage[segment];
        for block in begin..end {
            if !usage.bitmap[block] {
                error!(
                    segment = %segment,
                    offset,
                    len,
                    block,
                    "double release"
                );
                panic!("segment {segment} block {block} released twice");
            }
            usage.bitmap[block] = false;
        }
        usage.live_bytes -= i64::from(len);
        assert!(usage.live_bytes >= 0);
        usage.live_bytes
    }

    fn get_usage(&self, segment: SegmentId) -> i64 {
        self.segment_usage[segment].live_bytes
    }

    fn dump_usage(&self, segment: SegmentId) {
        let block_size = self.block_size(segment);
        let usage = &self.segment_usage[segment];
        error!(segment = %segment, live_bytes = usage.live_bytes, "segment usage");
        for (block, live) in usage.bitmap.iter().enumerate() {
            if *live {
                let offset = block as u32 * block_size;
                error!(offset, "block still live");
            }
        }
    }

    fn reset(&mut self) {
        let ids: Vec<SegmentId> = self.segment_usage.iter().map(|(id, _)| id).collect();
        for id in ids {
            let usage = &mut self.segment_usage[id];
            usage.bitmap.fill(false);
            usage.live_bytes = 0;
        }
    }

    fn usage_snapshot(&self) -> Vec<(SegmentId, i64)> {
        self.segment_usage
            .iter()
            .map(|(id, usage)| (id, usage.live_bytes))
            .collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SEGMENT_SIZE: u32 = 1024;
    const BLOCK_SIZE: u32 = 256;

    fn spec() -> Vec<TrackerDeviceSpec> {
        vec![TrackerDeviceSpec {
            device: DeviceId::new(0),
            num_segments: 2,
            segment_size: SEGMENT_SIZE,
            block_size: BLOCK_SIZE,
        }]
    }

    fn seg(index: u32) -> SegmentId {
        SegmentId::new(DeviceId::new(0), index)
    }

    #[test]
    fn simple_tracks_totals() {
        let mut tracker = SimpleSpaceTracker::new(&spec());
        assert_eq!(tracker.allocate(seg(0), 0, 256), 256);
        assert_eq!(tracker.allocate(seg(0), 512, 256), 512);
        assert_eq!(tracker.release(seg(0), 0, 256), 256);
        assert_eq!(tracker.get_usage(seg(0)), 256);
        assert_eq!(tracker.get_usage(seg(1)), 0);
    }

    #[test]
    fn detailed_tracks_totals() {
        let mut tracker = DetailedSpaceTracker::new(&spec());
        assert_eq!(tracker.allocate(seg(0), 0, 512), 512);
        assert_eq!(tracker.release(seg(0), 256, 256), 256);
        assert_eq!(tracker.get_usage(seg(0)), 256);
    }

    #[test]
    #[should_panic(expected = "allocated twice")]
    fn detailed_catches_double_allocate() {
        let mut tracker = DetailedSpaceTracker::new(&spec());
        tracker.allocate(seg(0), 0, 512);
        tracker.allocate(seg(0), 256, 256);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn detailed_catches_double_release() {
        let mut tracker = DetailedSpaceTracker::new(&spec());
        tracker.allocate(seg(0), 0, 256);
        tracker.release(seg(0), 0, 256);
        tracker.release(seg(0), 0, 256);
    }

    #[test]
    #[should_panic]
    fn detailed_rejects_unaligned_offset() {
        let mut tracker = DetailedSpaceTracker::new(&spec());
        tracker.allocate(seg(0), 100, 256);
    }

    #[test]
    #[should_panic(expected = "went negative")]
    fn simple_catches_negative_usage() {
        let mut tracker = SimpleSpaceTracker::new(&spec());
        tracker.release(seg(0), 0, 256);
    }

    #[test]
    fn trackers_agree_under_identical_streams() {
        let mut simple = SimpleSpaceTracker::new(&spec());
        let mut detailed = DetailedSpaceTracker::new(&spec());
        let ops: [(u32, u32, u32, bool); 6] = [
            (0, 0, 256, true),
            (0, 512, 512, true),
            (1, 0, 1024, true),
            (0, 512, 256, false),
            (1, 0, 512, false),
            (0, 256, 256, true),
        ];
        for (segment, offset, len, is_alloc) in ops {
            if is_alloc {
                simple.allocate(seg(segment), offset, len);
                detailed.allocate(seg(segment), offset, len);
            } else {
                simple.release(seg(segment), offset, len);
                detailed.release(seg(segment), offset, len);
            }
        }
        assert!(simple.equals(&detailed));
        assert!(detailed.equals(&simple));

        simple.allocate(seg(1), 512, 256);
        assert!(!simple.equals(&detailed));
    }

    #[test]
    fn reset_zeroes_everything() {
        let mut tracker = DetailedSpaceTracker::new(&spec());
        tracker.allocate(seg(0), 0, 1024);
        tracker.reset();
        assert_eq!(tracker.get_usage(seg(0)), 0);
        // Blocks are free again after the reset.
        assert_eq!(tracker.allocate(seg(0), 0, 256), 256);
    }
}
