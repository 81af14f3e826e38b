//! Aggregate segment lifecycle state.
//!
//! [`SegmentsInfo`] owns one [`SegmentInfo`] record per segment on every
//! registered device plus the aggregate counters derived from them. Every
//! lifecycle transition funnels through here so the counters can never
//! drift from the per-segment records:
//!
//! ```text
//! EMPTY ──mark_open──► OPEN ──mark_closed──► CLOSED ──mark_empty──► EMPTY
//!   └───────────────init_closed (mount)──────────►┘
//! ```
//!
//! Transition preconditions are asserted fatally; see the error policy in
//! `segstore-error`.

use std::collections::BTreeMap;
use std::fmt;

use segstore_types::{
    DataCategory, DeviceId, JournalSeq, ModTime, Paddr, ReclaimGen, SegmentId, SegmentKind,
    SegmentMap, SegmentSeq,
};
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// SegmentInfo
// ---------------------------------------------------------------------------

/// Lifecycle state of one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Empty,
    Open,
    Closed,
}

impl fmt::Display for SegmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty"),
            Self::Open => f.write_str("open"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

/// Everything the cleaner tracks about one segment.
///
/// When the state is `Empty`, `seq` is null and the classification fields
/// are `None`; that equivalence is asserted on every transition.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    state: SegmentState,
    pub seq: SegmentSeq,
    pub kind: Option<SegmentKind>,
    pub category: Option<DataCategory>,
    pub generation: Option<ReclaimGen>,
    /// Average modify time of the extents written to this segment.
    pub modify_time: ModTime,
    /// Number of extents contributing to `modify_time`.
    pub num_extents: u64,
    /// Bytes written so far; frozen when the segment closes.
    pub written_to: u32,
}

impl Default for SegmentInfo {
    fn default() -> Self {
        Self {
            state: SegmentState::Empty,
            seq: SegmentSeq::NULL,
            kind: None,
            category: None,
            generation: None,
            modify_time: ModTime::NULL,
            num_extents: 0,
            written_to: 0,
        }
    }
}

impl SegmentInfo {
    #[inline]
    #[must_use]
    pub fn state(&self) -> SegmentState {
        self.state
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state == SegmentState::Empty
    }

    #[inline]
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state == SegmentState::Open
    }

    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == SegmentState::Closed
    }

    /// Whether this segment still holds journal records at or above the
    /// committed tail.
    #[inline]
    #[must_use]
    pub fn is_in_journal(&self, journal_tail: JournalSeq) -> bool {
        self.kind == Some(SegmentKind::Journal) && journal_tail.seq <= self.seq
    }

    fn set_open(
        &mut self,
        seq: SegmentSeq,
        kind: SegmentKind,
        category: DataCategory,
        generation: ReclaimGen,
    ) {
        assert!(!seq.is_null());
        assert!(self.modify_time.is_null() && self.num_extents == 0);
        self.state = SegmentState::Open;
        self.seq = seq;
        self.kind = Some(kind);
        self.category = Some(category);
        self.generation = Some(generation);
        self.written_to = 0;
    }

    fn set_closed(&mut self) {
        self.state = SegmentState::Closed;
        // the rest of the record is unchanged
    }

    fn set_empty(&mut self) {
        *self = Self::default();
    }

    fn init_closed(
        &mut self,
        seq: SegmentSeq,
        kind: SegmentKind,
        category: DataCategory,
        generation: ReclaimGen,
        segment_size: u32,
    ) {
        assert!(!seq.is_null());
        self.state = SegmentState::Closed;
        self.seq = seq;
        self.kind = Some(kind);
        self.category = Some(category);
        self.generation = Some(generation);
        self.written_to = segment_size;
    }
}

impl fmt::Display for SegmentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg_info(state={}", self.state)?;
        if !self.is_empty() {
            if let (Some(kind), Some(category), Some(generation)) =
                (self.kind, self.category, self.generation)
            {
                write!(f, " {kind} {} {category} {generation}", self.seq)?;
            }
            write!(
                f,
                ", modify_time={}, num_extents={}, written_to={}",
                self.modify_time, self.num_extents, self.written_to
            )?;
        }
        f.write_str(")")
    }
}

// ---------------------------------------------------------------------------
// SegmentsInfo
// ---------------------------------------------------------------------------

/// Aggregate state of every segment on every device.
pub struct SegmentsInfo {
    segments: SegmentMap<SegmentInfo>,
    segment_size: u32,

    /// Most recently opened journal segment.
    journal_segment_id: SegmentId,
    num_in_journal_open: usize,
    num_type_journal: usize,
    num_type_ool: usize,

    num_open: usize,
    num_empty: usize,
    num_closed: usize,

    count_open_journal: u64,
    count_open_ool: u64,
    count_release_journal: u64,
    count_release_ool: u64,
    count_close_journal: u64,
    count_close_ool: u64,

    total_bytes: u64,
    avail_bytes_in_open: u64,

    /// Multiset of the modify times of non-empty segments with extents.
    modify_times: BTreeMap<ModTime, usize>,
}

impl SegmentsInfo {
    #[must_use]
    pub fn new() -> Self {
        Self {
            segments: SegmentMap::new(),
            segment_size: 0,
            journal_segment_id: SegmentId::NULL,
            num_in_journal_open: 0,
            num_type_journal: 0,
            num_type_ool: 0,
            num_open: 0,
            num_empty: 0,
            num_closed: 0,
            count_open_journal: 0,
            count_open_ool: 0,
            count_release_journal: 0,
            count_release_ool: 0,
            count_close_journal: 0,
            count_close_ool: 0,
            total_bytes: 0,
            avail_bytes_in_open: 0,
            modify_times: BTreeMap::new(),
        }
    }

    /// Drop every device and counter, back to the freshly-constructed state.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Register a device. All devices must share one segment size.
    pub fn add_device(
        &mut self,
        device: DeviceId,
        num_segments: u32,
        segment_size: u32,
        device_size: u64,
    ) {
        info!(
            device = %device,
            num_segments,
            segment_size,
            device_size,
            "adding segmented device"
        );
        assert!(num_segments > 0);
        assert!(segment_size > 0);
        assert!(device_size > 0);

        self.segments
            .add_device(device, num_segments as usize, &SegmentInfo::default());

        if self.segment_size == 0 {
            self.segment_size = segment_size;
        } else {
            assert_eq!(
                self.segment_size, segment_size,
                "devices must share a segment size"
            );
        }

        // Segments start out empty.
        self.num_empty += num_segments as usize;
        self.total_bytes += device_size;
    }

    // -- accessors ----------------------------------------------------------

    #[must_use]
    pub fn get(&self, id: SegmentId) -> &SegmentInfo {
        &self.segments[id]
    }

    pub fn iter(&self) -> impl Iterator<Item = (SegmentId, &SegmentInfo)> {
        self.segments.iter()
    }

    #[must_use]
    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn segment_size(&self) -> u32 {
        self.segment_size
    }

    #[must_use]
    pub fn journal_segment_id(&self) -> SegmentId {
        self.journal_segment_id
    }

    #[must_use]
    pub fn num_in_journal_open(&self) -> usize {
        self.num_in_journal_open
    }

    #[must_use]
    pub fn num_type_journal(&self) -> usize {
        self.num_type_journal
    }

    #[must_use]
    pub fn num_type_ool(&self) -> usize {
        self.num_type_ool
    }

    #[must_use]
    pub fn num_open(&self) -> usize {
        self.num_open
    }

    #[must_use]
    pub fn num_empty(&self) -> usize {
        self.num_empty
    }

    #[must_use]
    pub fn num_closed(&self) -> usize {
        self.num_closed
    }

    #[must_use]
    pub fn count_open(&self, kind: SegmentKind) -> u64 {
        match kind {
            SegmentKind::Journal => self.count_open_journal,
            SegmentKind::Ool => self.count_open_ool,
        }
    }

    #[must_use]
    pub fn count_close(&self, kind: SegmentKind) -> u64 {
        match kind {
            SegmentKind::Journal => self.count_close_journal,
            SegmentKind::Ool => self.count_close_ool,
        }
    }

    #[must_use]
    pub fn count_release(&self, kind: SegmentKind) -> u64 {
        match kind {
            SegmentKind::Journal => self.count_release_journal,
            SegmentKind::Ool => self.count_release_ool,
        }
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    #[must_use]
    pub fn avail_bytes_in_open(&self) -> u64 {
        self.avail_bytes_in_open
    }

    #[must_use]
    pub fn available_bytes(&self) -> u64 {
        self.num_empty as u64 * u64::from(self.segment_size) + self.avail_bytes_in_open
    }

    #[must_use]
    pub fn unavailable_bytes(&self) -> u64 {
        debug_assert!(self.total_bytes >= self.available_bytes());
        self.total_bytes - self.available_bytes()
    }

    #[must_use]
    pub fn available_ratio(&self) -> f64 {
        self.available_bytes() as f64 / self.total_bytes as f64
    }

    /// Minimum modify time across non-empty segments with extents, or null.
    #[must_use]
    pub fn get_time_bound(&self) -> ModTime {
        self.modify_times
            .keys()
            .next()
            .copied()
            .unwrap_or(ModTime::NULL)
    }

    /// The highest journal position any record could have been submitted to,
    /// or null if no journal segment has been opened yet.
    #[must_use]
    pub fn get_submitted_journal_head(&self) -> JournalSeq {
        if self.journal_segment_id.is_null() {
            return JournalSeq::NULL;
        }
        let info = &self.segments[self.journal_segment_id];
        JournalSeq::new(
            info.seq,
            Paddr::new_seg(self.journal_segment_id, info.written_to),
        )
    }

    // -- modify-time multiset -----------------------------------------------

    fn insert_modify_time(&mut self, time: ModTime) {
        assert!(!time.is_null());
        *self.modify_times.entry(time).or_insert(0) += 1;
    }

    fn erase_modify_time(&mut self, time: ModTime) {
        assert!(!time.is_null());
        let count = self
            .modify_times
            .get_mut(&time)
            .expect("modify time must be tracked");
        *count -= 1;
        if *count == 0 {
            self.modify_times.remove(&time);
        }
    }

    /// Fold `num` extents modified around `time` into the segment's average.
    ///
    /// Usable on empty segments (mount-time reconstruction) and open
    /// segments (foreground writes); the multiset only tracks non-empty
    /// segments.
    pub fn update_modify_time(&mut self, id: SegmentId, time: ModTime, num: u64) {
        if num == 0 {
            return;
        }
        assert!(!time.is_null());
        let info = &mut self.segments[id];
        let old_time = info.modify_time;
        if info.modify_time.is_null() {
            info.modify_time = time;
            info.num_extents = num;
        } else {
            info.modify_time = ModTime::average(info.modify_time, info.num_extents, time, num);
            info.num_extents += num;
        }
        let new_time = info.modify_time;
        if !info.is_empty() {
            if !old_time.is_null() {
                self.erase_modify_time(old_time);
            }
            self.insert_modify_time(new_time);
        }
    }

    // -- lifecycle transitions ----------------------------------------------

    /// Boot-time shortcut `EMPTY → CLOSED` with `written_to = segment_size`.
    ///
    /// Any modify time already reconstructed for the segment enters the
    /// multiset here.
    pub fn init_closed(
        &mut self,
        id: SegmentId,
        seq: SegmentSeq,
        kind: SegmentKind,
        category: DataCategory,
        generation: ReclaimGen,
    ) {
        let info = &self.segments[id];
        debug!(
            segment = %id, %kind, %seq, %category, %generation, info = %info,
            num_empty = self.num_empty, num_open = self.num_open, num_closed = self.num_closed,
            "initiating closed segment"
        );
        assert!(info.is_empty());
        assert!(self.num_empty > 0);
        self.num_empty -= 1;
        self.num_closed += 1;
        if kind == SegmentKind::Journal {
            // init_closed never initializes journal_segment_id.
            assert!(self.get_submitted_journal_head().is_null());
            self.num_type_journal += 1;
        } else {
            self.num_type_ool += 1;
        }
        // Operation counts are not bumped for boot-time transitions.

        let info = &mut self.segments[id];
        if info.modify_time.is_null() {
            assert_eq!(info.num_extents, 0);
        }
        info.init_closed(seq, kind, category, generation, self.segment_size);
        let time = self.segments[id].modify_time;
        if !time.is_null() {
            self.insert_modify_time(time);
        }
    }

    /// `EMPTY → OPEN`.
    pub fn mark_open(
        &mut self,
        id: SegmentId,
        seq: SegmentSeq,
        kind: SegmentKind,
        category: DataCategory,
        generation: ReclaimGen,
    ) {
        let info = &self.segments[id];
        info!(
            segment = %id, %kind, %seq, %category, %generation, info = %info,
            num_empty = self.num_empty, num_open = self.num_open, num_closed = self.num_closed,
            "opening segment"
        );
        assert!(info.is_empty());
        assert!(self.num_empty > 0);
        self.num_empty -= 1;
        self.num_open += 1;
        if kind == SegmentKind::Journal {
            if !self.journal_segment_id.is_null() {
                let last = &self.segments[self.journal_segment_id];
                assert!(last.is_closed());
                assert_eq!(last.kind, Some(SegmentKind::Journal));
                assert_eq!(last.seq.succ(), seq, "journal sequences must be consecutive");
            }
            self.journal_segment_id = id;
            self.num_in_journal_open += 1;
            self.num_type_journal += 1;
            self.count_open_journal += 1;
        } else {
            self.num_type_ool += 1;
            self.count_open_ool += 1;
        }
        self.avail_bytes_in_open += u64::from(self.segment_size);

        self.segments[id].set_open(seq, kind, category, generation);
    }

    /// `OPEN → CLOSED`. Freezes `written_to`.
    pub fn mark_closed(&mut self, id: SegmentId) {
        let info = &self.segments[id];
        info!(
            segment = %id, info = %info,
            num_empty = self.num_empty, num_open = self.num_open, num_closed = self.num_closed,
            "closing segment"
        );
        assert!(info.is_open());
        assert!(self.num_open > 0);
        self.num_open -= 1;
        self.num_closed += 1;
        if info.kind == Some(SegmentKind::Journal) {
            assert!(self.num_in_journal_open > 0);
            self.num_in_journal_open -= 1;
            self.count_close_journal += 1;
        } else {
            self.count_close_ool += 1;
        }
        let written_to = info.written_to;
        assert!(self.segment_size >= written_to);
        let seg_avail_bytes = u64::from(self.segment_size - written_to);
        assert!(self.avail_bytes_in_open >= seg_avail_bytes);
        self.avail_bytes_in_open -= seg_avail_bytes;

        self.segments[id].set_closed();
    }

    /// `CLOSED → EMPTY`. The collaborator must have released the segment.
    pub fn mark_empty(&mut self, id: SegmentId) {
        let info = &self.segments[id];
        info!(
            segment = %id, info = %info,
            num_empty = self.num_empty, num_open = self.num_open, num_closed = self.num_closed,
            "releasing segment"
        );
        assert!(info.is_closed());
        let kind = info.kind.expect("closed segment has a kind");
        assert!(self.num_closed > 0);
        self.num_closed -= 1;
        self.num_empty += 1;
        match kind {
            SegmentKind::Journal => {
                assert!(self.num_type_journal > 0);
                self.num_type_journal -= 1;
                self.count_release_journal += 1;
            }
            SegmentKind::Ool => {
                assert!(self.num_type_ool > 0);
                self.num_type_ool -= 1;
                self.count_release_ool += 1;
            }
        }

        let time = self.segments[id].modify_time;
        if time.is_null() {
            assert_eq!(self.segments[id].num_extents, 0);
        } else {
            self.erase_modify_time(time);
        }

        self.segments[id].set_empty();
    }

    /// Advance the write cursor of the open segment `offset` points into.
    ///
    /// # Panics
    ///
    /// Panics if the segment is not open, is not of `kind`, or the cursor
    /// would regress or overrun the segment.
    pub fn update_written_to(&mut self, kind: SegmentKind, offset: Paddr) {
        let id = offset.segment_id();
        let new_written_to = offset.segment_off();
        let segment_size = self.segment_size;
        let info = &self.segments[id];
        assert!(
            info.is_open(),
            "segment {id} is not open: {info} (offset {offset})"
        );
        assert!(new_written_to <= segment_size);
        assert!(
            info.written_to <= new_written_to,
            "segment {id} written_to regressed: {} -> {new_written_to}",
            info.written_to
        );
        assert_eq!(info.kind, Some(kind));
        debug!(segment = %id, %kind, %offset, info = %info, "updating write cursor");

        let avail_deduction = u64::from(new_written_to - info.written_to);
        assert!(self.avail_bytes_in_open >= avail_deduction);
        self.avail_bytes_in_open -= avail_deduction;
        self.segments[id].written_to = new_written_to;
    }
}

impl Default for SegmentsInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SegmentsInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "segments(empty={}, open={}, closed={}, type_journal={}, type_ool={}, \
             total={}B, available={}B, unavailable={}B, available_ratio={:.2}, \
             submitted_head={}, time_bound={})",
            self.num_empty,
            self.num_open,
            self.num_closed,
            self.num_type_journal,
            self.num_type_ool,
            self.total_bytes,
            self.available_bytes(),
            self.unavailable_bytes(),
            self.available_ratio(),
            self.get_submitted_journal_head(),
            self.get_time_bound(),
        )
    }
}

// ===========================================================================
// Tests
// ===========================================================================
