//! Property tests: the simple and detailed space trackers agree under any
//! double-free-free operation stream, and usage always matches the ground
//! truth.

use std::collections::BTreeSet;

use proptest::prelude::*;

use segstore_cleaner::{
    DetailedSpaceTracker, SimpleSpaceTracker, SpaceTracker, TrackerDeviceSpec,
};
use segstore_types::{DeviceId, SegmentId};

const SEGMENT_SIZE: u32 = 1024;
const BLOCK_SIZE: u32 = 256;
const BLOCKS_PER_SEGMENT: u32 = SEGMENT_SIZE / BLOCK_SIZE;
const NUM_SEGMENTS: u32 = 4;

fn specs() -> Vec<TrackerDeviceSpec> {
    vec![TrackerDeviceSpec {
        device: DeviceId::new(0),
        num_segments: NUM_SEGMENTS,
        segment_size: SEGMENT_SIZE,
        block_size: BLOCK_SIZE,
    }]
}

fn seg(index: u32) -> SegmentId {
    SegmentId::new(DeviceId::new(0), index)
}

proptest! {
    /// Allocate a unique set of blocks, free an arbitrary subset, and check
    /// both trackers land on the ground truth.
    #[test]
    fn trackers_agree_and_match_ground_truth(
        allocations in prop::collection::btree_set(
            (0u32..NUM_SEGMENTS, 0u32..BLOCKS_PER_SEGMENT),
            0..=(NUM_SEGMENTS * BLOCKS_PER_SEGMENT) as usize,
        ),
        free_seed in any::<u64>(),
    ) {
        let mut simple = SimpleSpaceTracker::new(&specs());
        let mut detailed = DetailedSpaceTracker::new(&specs());

        for &(segment, block) in &allocations {
            let offset = block * BLOCK_SIZE;
            let a = simple.allocate(seg(segment), offset, BLOCK_SIZE);
            let b = detailed.allocate(seg(segment), offset, BLOCK_SIZE);
            prop_assert_eq!(a, b);
        }

        // Free a pseudo-random subset; never a block that was not allocated.
        let freed: BTreeSet<(u32, u32)> = allocations
            .iter()
            .copied()
            .filter(|(segment, block)| {
                (u64::from(*segment) * 31 + u64::from(*block)).wrapping_add(free_seed) % 2 == 0
            })
            .collect();
        for &(segment, block) in &freed {
            let offset = block * BLOCK_SIZE;
            let a = simple.release(seg(segment), offset, BLOCK_SIZE);
            let b = detailed.release(seg(segment), offset, BLOCK_SIZE);
            prop_assert_eq!(a, b);
        }

        // Ground truth per segment.
        for segment in 0..NUM_SEGMENTS {
            let live_blocks = allocations
                .iter()
                .filter(|(s, b)| *s == segment && !freed.contains(&(*s, *b)))
                .count() as i64;
            let expected = live_blocks * i64::from(BLOCK_SIZE);
            prop_assert_eq!(simple.get_usage(seg(segment)), expected);
            prop_assert_eq!(detailed.get_usage(seg(segment)), expected);
        }

        prop_assert!(simple.equals(&detailed));
        prop_assert!(detailed.equals(&simple));

        // Aggregate live bytes match the stream.
        let total_live = (allocations.len() - freed.len()) as i64 * i64::from(BLOCK_SIZE);
        let sum: i64 = simple.usage_snapshot().iter().map(|(_, v)| v).sum();
        prop_assert_eq!(sum, total_live);
    }

    /// A fully-freed stream always ends at zero everywhere.
    #[test]
    fn full_round_trip_ends_at_zero(
        allocations in prop::collection::btree_set(
            (0u32..NUM_SEGMENTS, 0u32..BLOCKS_PER_SEGMENT),
            0..=(NUM_SEGMENTS * BLOCKS_PER_SEGMENT) as usize,
        ),
    ) {
        let mut simple = SimpleSpaceTracker::new(&specs());
        let mut detailed = DetailedSpaceTracker::new(&specs());
        for &(segment, block) in &allocations {
            simple.allocate(seg(segment), block * BLOCK_SIZE, BLOCK_SIZE);
            detailed.allocate(seg(segment), block * BLOCK_SIZE, BLOCK_SIZE);
        }
        for &(segment, block) in allocations.iter().rev() {
            simple.release(seg(segment), block * BLOCK_SIZE, BLOCK_SIZE);
            detailed.release(seg(segment), block * BLOCK_SIZE, BLOCK_SIZE);
        }
        for segment in 0..NUM_SEGMENTS {
            prop_assert_eq!(simple.get_usage(seg(segment)), 0);
            prop_assert_eq!(detailed.get_usage(seg(segment)), 0);
        }
        prop_assert!(simple.equals(&detailed));
    }
}
