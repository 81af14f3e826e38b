//! Progress cursor for reclaiming one closed segment in bounded chunks.

use segstore_types::{Paddr, ReclaimGen, SegmentId};

/// Tracks how far the reclaim of one victim segment has advanced.
///
/// Each GC reclaim cycle advances the `[start_pos, end_pos)` window by the
/// configured byte budget; the cycle's reads are idempotent over the fixed
/// window, so a conflicted transaction can simply re-run.
#[derive(Debug, Clone)]
pub struct ReclaimState {
    /// Generation of the victim segment.
    pub generation: ReclaimGen,
    /// Generation rewritten extents are placed into.
    pub target_generation: ReclaimGen,
    segment_size: u32,
    /// Start of the window being reclaimed (null before the first advance).
    pub start_pos: Paddr,
    /// End of the window; its segment id names the victim.
    pub end_pos: Paddr,
}

impl ReclaimState {
    /// Start a cursor over `segment`. Rewrites stay in the victim's own
    /// generation: reclaimed data is no younger than it was.
    #[must_use]
    pub fn create(segment: SegmentId, generation: ReclaimGen, segment_size: u32) -> Self {
        Self {
            generation,
            target_generation: generation,
            segment_size,
            start_pos: Paddr::NULL,
            end_pos: Paddr::new_seg(segment, 0),
        }
    }

    /// The victim segment.
    #[must_use]
    pub fn segment_id(&self) -> SegmentId {
        self.end_pos.segment_id()
    }

    /// Whether the cursor has covered the whole segment.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.end_pos.segment_off() >= self.segment_size
    }

    /// Slide the window forward by up to `bytes`.
    ///
    /// # Panics
    ///
    /// Panics if the cursor already reached the end of the segment.
    pub fn advance(&mut self, bytes: u64) {
        assert!(!self.is_complete());
        self.start_pos = self.end_pos;
        let next_off = u64::from(self.end_pos.segment_off()).saturating_add(bytes);
        let capped = next_off.min(u64::from(self.segment_size)) as u32;
        self.end_pos = self.end_pos.with_segment_off(capped);
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use segstore_types::DeviceId;

    fn seg() -> SegmentId {
        SegmentId::new(DeviceId::new(0), 5)
    }

    #[test]
    fn advances_in_bounded_chunks() {
        let mut state = ReclaimState::create(seg(), ReclaimGen::HOT, 1024);
        assert!(state.start_pos.is_null());
        assert!(!state.is_complete());

        state.advance(400);
        assert_eq!(state.start_pos, Paddr::new_seg(seg(), 0));
        assert_eq!(state.end_pos, Paddr::new_seg(seg(), 400));
        assert!(!state.is_complete());

        state.advance(400);
        assert_eq!(state.start_pos, Paddr::new_seg(seg(), 400));
        assert_eq!(state.end_pos, Paddr::new_seg(seg(), 800));

        // The final chunk is clamped to the segment end.
        state.advance(400);
        assert_eq!(state.end_pos, Paddr::new_seg(seg(), 1024));
        assert!(state.is_complete());
    }

    #[test]
    fn single_chunk_covers_whole_segment() {
        let mut state = ReclaimState::create(seg(), ReclaimGen::DIRTY, 1024);
        state.advance(1 << 20);
        assert!(state.is_complete());
        assert_eq!(state.segment_id(), seg());
    }

    #[test]
    fn rewrites_target_the_victims_generation() {
        let state = ReclaimState::create(seg(), ReclaimGen::DIRTY, 1024);
        assert_eq!(state.target_generation, ReclaimGen::DIRTY);
    }

    #[test]
    #[should_panic]
    fn advance_past_end_is_fatal() {
        let mut state = ReclaimState::create(seg(), ReclaimGen::HOT, 512);
        state.advance(512);
        state.advance(1);
    }
}
