//! The asynchronous segment cleaner.
//!
//! [`AsyncCleaner`] owns the space accounting, the segment lifecycle, the
//! journal-tail bookkeeping, the GC cycle, and writer admission control.
//! It is built for a single-threaded cooperative shard: every method takes
//! `&self`, state lives behind `RefCell`/`Cell`, and no borrow is ever held
//! across an await point, so all bookkeeping updates are atomic between
//! suspensions.
//!
//! The GC task is spawned on the current thread's `LocalSet` at
//! [`AsyncCleaner::complete_init`] and runs until [`AsyncCleaner::stop`]:
//!
//! ```text
//! loop {
//!   wait until should_run or stopping
//!   trim_alloc | trim_dirty | reclaim      (first predicate that fires)
//! }
//! ```
//!
//! Foreground writers reserve projected usage before writing and may
//! suspend on the single-slot admission wake until trimming or reclaim
//! frees space.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::future::Future;
use std::rc::Rc;

use segstore_error::{Result, StoreError};
use segstore_types::{
    AddrKind, DataCategory, JournalSeq, ModTime, Paddr, ReclaimGen, SegmentHeader, SegmentId,
    SegmentKind, SegmentSeq,
};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::CleanerConfig;
use crate::interfaces::{
    BackrefEntry, BackrefManager, BackrefPin, CleanerTransaction, DeviceGroup, ExtentCallback,
    TransactionSource,
};
use crate::metrics::{CleanerMetricsSnapshot, CleanerStats, UtilizationHistogram};
use crate::policy::{benefit_cost, GcFormula, GC_FORMULA};
use crate::reclaim::ReclaimState;
use crate::segments::SegmentsInfo;
use crate::seq_allocator::SegmentSeqAllocator;
use crate::space_tracker::{
    DetailedSpaceTracker, SimpleSpaceTracker, SpaceTracker, TrackerDeviceSpec,
};

// ---------------------------------------------------------------------------
// repeat_eagain
// ---------------------------------------------------------------------------

/// Re-run `attempt` until it stops failing with a transient conflict.
///
/// Yields between attempts so foreground work can drain the conflicting
/// transaction first.
pub(crate) async fn repeat_eagain<T, F, Fut>(what: &'static str, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        match attempt().await {
            Err(e) if e.is_transient() => {
                debug!(what, "transaction conflict, retrying");
                tokio::task::yield_now().await;
            }
            other => return other,
        }
    }
}

// ---------------------------------------------------------------------------
// Mutable cleaner state
// ---------------------------------------------------------------------------

struct CleanerState {
    segments: SegmentsInfo,
    space_tracker: Box<dyn SpaceTracker>,
    journal_head: JournalSeq,
    journal_dirty_tail: JournalSeq,
    journal_alloc_tail: JournalSeq,
    stats: CleanerStats,
    reclaim_state: Option<ReclaimState>,
}

impl CleanerState {
    fn calc_utilization(&self, id: SegmentId) -> f64 {
        let info = self.segments.get(id);
        if info.is_empty() {
            0.0
        } else {
            self.space_tracker.get_usage(id) as f64 / f64::from(self.segments.segment_size())
        }
    }

    fn adjust_segment_util(&mut self, old: f64, new: f64) {
        self.stats.segment_util.adjust(old, new);
    }

    /// The committed journal tail: everything below it is persisted.
    fn journal_tail(&self) -> JournalSeq {
        self.journal_dirty_tail.min(self.journal_alloc_tail)
    }
}

// ---------------------------------------------------------------------------
// GcProcess
// ---------------------------------------------------------------------------

/// The cooperative GC task plus its run/stop signaling.
struct GcProcess {
    stopping: Cell<bool>,
    wake: Notify,
    handle: RefCell<Option<JoinHandle<()>>>,
}

impl GcProcess {
    fn new() -> Self {
        Self {
            stopping: Cell::new(false),
            wake: Notify::new(),
            handle: RefCell::new(None),
        }
    }

    fn is_stopping(&self) -> bool {
        self.stopping.get()
    }
}

// ---------------------------------------------------------------------------
// AsyncCleaner
// ---------------------------------------------------------------------------

/// Facade over segment state, space accounting, GC, and admission control.
pub struct AsyncCleaner {
    config: CleanerConfig,
    devices: DeviceGroup,
    backrefs: Rc<dyn BackrefManager>,
    ecb: RefCell<Option<Rc<dyn ExtentCallback>>>,
    state: RefCell<CleanerState>,
    init_complete: Cell<bool>,
    /// Single-slot admission wake; the pipeline admits one reserver at a
    /// time, so at most one sender is ever parked here.
    blocked_io_wake: RefCell<Option<oneshot::Sender<()>>>,
    gc: GcProcess,
    journal_seq_allocator: Rc<SegmentSeqAllocator>,
    ool_seq_allocator: Rc<SegmentSeqAllocator>,
}

impl AsyncCleaner {
    /// Build a cleaner over `devices`. [`AsyncCleaner::set_extent_callback`]
    /// must bind the transaction engine before GC can run.
    #[must_use]
    pub fn new(
        config: CleanerConfig,
        devices: DeviceGroup,
        backrefs: Rc<dyn BackrefManager>,
    ) -> Rc<Self> {
        config.validate();
        Rc::new(Self {
            config,
            devices,
            backrefs,
            ecb: RefCell::new(None),
            state: RefCell::new(CleanerState {
                segments: SegmentsInfo::new(),
                space_tracker: Box::new(SimpleSpaceTracker::new(&[])),
                journal_head: JournalSeq::NULL,
                journal_dirty_tail: JournalSeq::NULL,
                journal_alloc_tail: JournalSeq::NULL,
                stats: CleanerStats::default(),
                reclaim_state: None,
            }),
            init_complete: Cell::new(false),
            blocked_io_wake: RefCell::new(None),
            gc: GcProcess::new(),
            journal_seq_allocator: Rc::new(SegmentSeqAllocator::new(SegmentKind::Journal)),
            ool_seq_allocator: Rc::new(SegmentSeqAllocator::new(SegmentKind::Ool)),
        })
    }

    /// Bind the extent-callback interface (late, to break the construction
    /// cycle with the transaction engine).
    pub fn set_extent_callback(&self, ecb: Rc<dyn ExtentCallback>) {
        *self.ecb.borrow_mut() = Some(ecb);
    }

    fn ecb(&self) -> Rc<dyn ExtentCallback> {
        self.ecb
            .borrow()
            .as_ref()
            .expect("extent callback is bound")
            .clone()
    }

    #[must_use]
    pub fn journal_seq_allocator(&self) -> Rc<SegmentSeqAllocator> {
        self.journal_seq_allocator.clone()
    }

    #[must_use]
    pub fn ool_seq_allocator(&self) -> Rc<SegmentSeqAllocator> {
        self.ool_seq_allocator.clone()
    }

    // -- derived quantities -------------------------------------------------

    fn segments_in_journal_with(&self, state: &CleanerState) -> usize {
        let tail = state.journal_tail();
        if tail.is_null() {
            state.segments.num_type_journal()
        } else {
            assert!(matches!(tail.offset.kind(), AddrKind::Segment));
            state
                .segments
                .iter()
                .filter(|(_, info)| info.is_in_journal(tail))
                .count()
        }
    }

    fn segments_in_journal_closed_with(&self, state: &CleanerState) -> usize {
        self.segments_in_journal_with(state)
            .saturating_sub(state.segments.num_in_journal_open())
    }

    fn segments_reclaimable_with(&self, state: &CleanerState) -> usize {
        let in_journal_closed = self.segments_in_journal_closed_with(state);
        assert!(state.segments.num_closed() >= in_journal_closed);
        state.segments.num_closed() - in_journal_closed
    }

    fn unavailable_unreclaimable_bytes_with(&self, state: &CleanerState) -> u64 {
        let covered = (state.segments.num_open() + self.segments_in_journal_closed_with(state))
            as u64
            * u64::from(state.segments.segment_size());
        assert!(covered >= state.segments.avail_bytes_in_open());
        covered - state.segments.avail_bytes_in_open()
    }

    fn unavailable_reclaimable_bytes_with(&self, state: &CleanerState) -> u64 {
        let ret = self.segments_reclaimable_with(state) as u64
            * u64::from(state.segments.segment_size());
        debug_assert_eq!(
            ret + self.unavailable_unreclaimable_bytes_with(state),
            state.segments.unavailable_bytes()
        );
        ret
    }

    fn unavailable_unused_bytes_with(&self, state: &CleanerState) -> u64 {
        let unavailable = state.segments.unavailable_bytes();
        assert!(unavailable >= state.stats.used_bytes);
        unavailable - state.stats.used_bytes
    }

    fn reclaim_ratio_with(&self, state: &CleanerState) -> f64 {
        let unavailable = state.segments.unavailable_bytes();
        if unavailable == 0 {
            return 0.0;
        }
        self.unavailable_unused_bytes_with(state) as f64 / unavailable as f64
    }

    fn projected_available_ratio_with(&self, state: &CleanerState) -> f64 {
        let projected_available = state
            .segments
            .available_bytes()
            .saturating_sub(state.stats.projected_used_bytes);
        projected_available as f64 / state.segments.total_bytes() as f64
    }

    fn tail_limit_with(&self, state: &CleanerState) -> JournalSeq {
        state.journal_head.add_offset(
            -(self.config.journal_tail_limit_bytes as i64),
            state.segments.segment_size(),
        )
    }

    fn dirty_tail_target_with(&self, state: &CleanerState) -> JournalSeq {
        state.journal_head.add_offset(
            -(self.config.target_journal_dirty_bytes as i64),
            state.segments.segment_size(),
        )
    }

    fn alloc_tail_target_with(&self, state: &CleanerState) -> JournalSeq {
        state.journal_head.add_offset(
            -(self.config.target_journal_alloc_bytes as i64),
            state.segments.segment_size(),
        )
    }

    fn dirty_journal_bytes_with(&self, state: &CleanerState) -> u64 {
        if state.journal_head.is_null() || state.journal_dirty_tail.is_null() {
            return 0;
        }
        state
            .journal_head
            .bytes_since(state.journal_dirty_tail, state.segments.segment_size())
    }

    fn alloc_journal_bytes_with(&self, state: &CleanerState) -> u64 {
        if state.journal_head.is_null() || state.journal_alloc_tail.is_null() {
            return 0;
        }
        state
            .journal_head
            .bytes_since(state.journal_alloc_tail, state.segments.segment_size())
    }

    // -- public read surface -------------------------------------------------

    #[must_use]
    pub fn journal_head(&self) -> JournalSeq {
        self.state.borrow().journal_head
    }

    #[must_use]
    pub fn journal_dirty_tail(&self) -> JournalSeq {
        self.state.borrow().journal_dirty_tail
    }

    #[must_use]
    pub fn journal_alloc_tail(&self) -> JournalSeq {
        self.state.borrow().journal_alloc_tail
    }

    /// `min(dirty_tail, alloc_tail)`.
    #[must_use]
    pub fn journal_tail(&self) -> JournalSeq {
        self.state.borrow().journal_tail()
    }

    #[must_use]
    pub fn segments_reclaimable(&self) -> usize {
        self.segments_reclaimable_with(&self.state.borrow())
    }

    #[must_use]
    pub fn projected_available_ratio(&self) -> f64 {
        self.projected_available_ratio_with(&self.state.borrow())
    }

    /// Live bytes of `segment` over the segment size (0 for empty).
    #[must_use]
    pub fn calc_utilization(&self, segment: SegmentId) -> f64 {
        self.state.borrow().calc_utilization(segment)
    }

    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.state.borrow().stats.used_bytes
    }

    #[must_use]
    pub fn num_empty_segments(&self) -> usize {
        self.state.borrow().segments.num_empty()
    }

    #[must_use]
    pub fn init_complete(&self) -> bool {
        self.init_complete.get()
    }

    // -- admission predicates -------------------------------------------------

    fn should_block_on_trim_with(&self, state: &CleanerState) -> bool {
        if state.journal_head.is_null() {
            return false;
        }
        self.tail_limit_with(state) > state.journal_tail()
    }

    fn should_block_on_reclaim_with(&self, state: &CleanerState) -> bool {
        if self.segments_reclaimable_with(state) == 0 {
            return false;
        }
        self.projected_available_ratio_with(state) < self.config.available_ratio_hard_limit
    }

    fn should_block_on_gc_with(&self, state: &CleanerState) -> bool {
        self.should_block_on_trim_with(state) || self.should_block_on_reclaim_with(state)
    }

    #[must_use]
    pub fn should_block_on_gc(&self) -> bool {
        self.should_block_on_gc_with(&self.state.borrow())
    }

    // -- GC predicates --------------------------------------------------------

    fn gc_should_trim_dirty_with(&self, state: &CleanerState) -> bool {
        if self.config.disable_trim
            || state.journal_head.is_null()
            || state.journal_dirty_tail.is_null()
        {
            return false;
        }
        self.dirty_tail_target_with(state) > state.journal_dirty_tail
    }

    fn gc_should_trim_alloc_with(&self, state: &CleanerState) -> bool {
        if self.config.disable_trim
            || state.journal_head.is_null()
            || state.journal_alloc_tail.is_null()
        {
            return false;
        }
        self.alloc_tail_target_with(state) > state.journal_alloc_tail
    }

    fn gc_should_reclaim_space_with(&self, state: &CleanerState) -> bool {
        self.projected_available_ratio_with(state) < self.config.available_ratio_gc_start
            && self.segments_reclaimable_with(state) > 0
    }

    fn gc_should_run(&self) -> bool {
        let state = self.state.borrow();
        self.gc_should_trim_alloc_with(&state)
            || self.gc_should_trim_dirty_with(&state)
            || self.gc_should_reclaim_space_with(&state)
    }

    fn log_gc_state(&self, caller: &'static str) {
        if !self.init_complete.get() {
            debug!(caller, "gc state: init");
            return;
        }
        let state = self.state.borrow();
        debug!(
            caller,
            should_block_on_trim = self.should_block_on_trim_with(&state),
            should_block_on_reclaim = self.should_block_on_reclaim_with(&state),
            should_trim_alloc = self.gc_should_trim_alloc_with(&state),
            should_trim_dirty = self.gc_should_trim_dirty_with(&state),
            should_reclaim = self.gc_should_reclaim_space_with(&state),
            projected_avail_ratio = self.projected_available_ratio_with(&state),
            reclaim_ratio = self.reclaim_ratio_with(&state),
            journal_head = %state.journal_head,
            dirty_tail = %state.journal_dirty_tail,
            alloc_tail = %state.journal_alloc_tail,
            "gc state"
        );
    }

    // -- space accounting -----------------------------------------------------

    /// Mark `[addr, addr + len)` live. A no-op for non-segment addresses and,
    /// outside the init scan, before `complete_init`.
    pub fn mark_space_used(&self, addr: Paddr, len: u32, init_scan: bool) {
        if !matches!(addr.kind(), AddrKind::Segment) {
            return;
        }
        if !init_scan && !self.init_complete.get() {
            return;
        }
        let segment = addr.segment_id();
        {
            let mut state = self.state.borrow_mut();
            state.stats.used_bytes += u64::from(len);
            let old_usage = state.calc_utilization(segment);
            let live = state
                .space_tracker
                .allocate(segment, addr.segment_off(), len);
            assert!(live > 0);
            let new_usage = state.calc_utilization(segment);
            state.adjust_segment_util(old_usage, new_usage);
            debug!(segment = %segment, addr = %addr, len, live, "space used");
        }
        self.maybe_wake_gc_on_space_used();
    }

    /// Mark `[addr, addr + len)` dead; may unblock a waiting writer.
    pub fn mark_space_free(&self, addr: Paddr, len: u32, init_scan: bool) {
        if !init_scan && !self.init_complete.get() {
            return;
        }
        if !matches!(addr.kind(), AddrKind::Segment) {
            return;
        }
        let segment = addr.segment_id();
        {
            let mut state = self.state.borrow_mut();
            assert!(state.stats.used_bytes >= u64::from(len));
            state.stats.used_bytes -= u64::from(len);
            let old_usage = state.calc_utilization(segment);
            let live = state.space_tracker.release(segment, addr.segment_off(), len);
            assert!(live >= 0);
            let new_usage = state.calc_utilization(segment);
            state.adjust_segment_util(old_usage, new_usage);
            debug!(segment = %segment, addr = %addr, len, live, "space freed");
        }
        self.maybe_wake_gc_blocked_io();
    }

    // -- segment lifecycle ----------------------------------------------------

    /// Open the first empty segment for `kind` writes.
    ///
    /// # Panics
    ///
    /// Panics when no empty segment exists; callers gate on a prior
    /// reservation.
    pub fn allocate_segment(
        &self,
        seq: SegmentSeq,
        kind: SegmentKind,
        category: DataCategory,
        generation: ReclaimGen,
    ) -> SegmentId {
        assert!(!seq.is_null());
        let opened = {
            let mut state = self.state.borrow_mut();
            let empty = state
                .segments
                .iter()
                .find(|(_, info)| info.is_empty())
                .map(|(id, _)| id);
            match empty {
                Some(id) => {
                    let old_usage = state.calc_utilization(id);
                    state.segments.mark_open(id, seq, kind, category, generation);
                    let new_usage = state.calc_utilization(id);
                    state.adjust_segment_util(old_usage, new_usage);
                    Some(id)
                }
                None => None,
            }
        };
        match opened {
            Some(id) => {
                self.maybe_wake_gc_on_space_used();
                info!(segment = %id, %seq, %kind, %category, %generation, "segment opened");
                id
            }
            None => {
                error!(%seq, %kind, %category, %generation, "out of empty segments");
                panic!("allocate_segment with no empty segment; reserve before allocating");
            }
        }
    }

    /// Close an open segment, freezing its write cursor.
    pub fn close_segment(&self, segment: SegmentId) {
        let mut state = self.state.borrow_mut();
        let old_usage = state.calc_utilization(segment);
        state.segments.mark_closed(segment);
        let usage = state.space_tracker.get_usage(segment) as u64;
        let segment_size = u64::from(state.segments.segment_size());
        match state.segments.get(segment).kind {
            Some(SegmentKind::Journal) => {
                state.stats.closed_journal_used_bytes += usage;
                state.stats.closed_journal_total_bytes += segment_size;
            }
            _ => {
                state.stats.closed_ool_used_bytes += usage;
                state.stats.closed_ool_total_bytes += segment_size;
            }
        }
        let new_usage = state.calc_utilization(segment);
        state.adjust_segment_util(old_usage, new_usage);
    }

    /// Advance the write cursor of the open segment `offset` points into.
    pub fn update_written_to(&self, kind: SegmentKind, offset: Paddr) {
        self.state.borrow_mut().segments.update_written_to(kind, offset);
        self.maybe_wake_gc_on_space_used();
    }

    /// Fold extent modify times into the segment's running average.
    pub fn update_modify_time(&self, segment: SegmentId, time: ModTime, num_extents: u64) {
        self.state
            .borrow_mut()
            .segments
            .update_modify_time(segment, time, num_extents);
    }

    // -- journal bookkeeping --------------------------------------------------

    /// Record the highest submitted journal position.
    pub fn set_journal_head(&self, head: JournalSeq) {
        {
            let mut state = self.state.borrow_mut();
            assert!(self.config.disable_trim || !head.is_null());
            if head.is_null() {
                return;
            }
            assert!(state.journal_head.is_null() || head >= state.journal_head);
            assert!(state.journal_dirty_tail.is_null() || head >= state.journal_dirty_tail);
            assert!(state.journal_alloc_tail.is_null() || head >= state.journal_alloc_tail);
            debug!(from = %state.journal_head, to = %head, "journal head advanced");
            state.journal_head = head;
        }
        self.maybe_wake_gc_on_space_used();
    }

    /// Advance the persisted journal tails. Tails never regress; a
    /// regression is fatal.
    pub fn update_journal_tails(&self, dirty_tail: JournalSeq, alloc_tail: JournalSeq) {
        if self.config.disable_trim {
            return;
        }
        {
            let mut state = self.state.borrow_mut();
            if !dirty_tail.is_null() {
                assert!(!matches!(dirty_tail.offset.kind(), AddrKind::RandomBlock));
                assert!(state.journal_head.is_null() || state.journal_head >= dirty_tail);
                if !state.journal_dirty_tail.is_null() && state.journal_dirty_tail > dirty_tail {
                    error!(
                        from = %state.journal_dirty_tail,
                        to = %dirty_tail,
                        "journal dirty tail regressed"
                    );
                    panic!("journal dirty tail would regress");
                }
                if state.journal_dirty_tail.seq == dirty_tail.seq {
                    debug!(from = %state.journal_dirty_tail, to = %dirty_tail, "dirty tail");
                } else {
                    info!(from = %state.journal_dirty_tail, to = %dirty_tail, "dirty tail");
                }
                state.journal_dirty_tail = dirty_tail;
            }
            if !alloc_tail.is_null() {
                assert!(!matches!(alloc_tail.offset.kind(), AddrKind::RandomBlock));
                assert!(state.journal_head.is_null() || state.journal_head >= alloc_tail);
                if !state.journal_alloc_tail.is_null() && state.journal_alloc_tail > alloc_tail {
                    error!(
                        from = %state.journal_alloc_tail,
                        to = %alloc_tail,
                        "journal alloc tail regressed"
                    );
                    panic!("journal alloc tail would regress");
                }
                if state.journal_alloc_tail.seq == alloc_tail.seq {
                    debug!(from = %state.journal_alloc_tail, to = %alloc_tail, "alloc tail");
                } else {
                    info!(from = %state.journal_alloc_tail, to = %alloc_tail, "alloc tail");
                }
                state.journal_alloc_tail = alloc_tail;
            }
        }
        self.maybe_wake_gc_on_space_used();
        self.maybe_wake_gc_blocked_io();
    }

    // -- admission control ----------------------------------------------------

    /// Reserve `projected_usage` bytes of forward footprint, suspending
    /// while the journal is over its hard limit or reclaimable space is
    /// critically low. Never errors; completes when admission is granted.
    pub async fn reserve_projected_usage(&self, projected_usage: u64) {
        if self.config.disable_trim {
            return;
        }
        assert!(self.init_complete.get());
        // The pipeline admits one reservation at a time; the wake slot must
        // be free on entry.
        assert!(self.blocked_io_wake.borrow().is_none());
        let is_blocked = {
            let mut guard = self.state.borrow_mut();
            let trim = self.should_block_on_trim_with(&guard);
            let reclaim = self.should_block_on_reclaim_with(&guard);
            let state = &mut *guard;
            state.stats.io_count += 1;
            if trim {
                state.stats.io_blocked_count_trim += 1;
            }
            if reclaim {
                state.stats.io_blocked_count_reclaim += 1;
            }
            if trim || reclaim {
                state.stats.io_blocking_num += 1;
                state.stats.io_blocked_count += 1;
                state.stats.io_blocked_sum += state.stats.io_blocking_num;
            }
            trim || reclaim
        };

        loop {
            self.log_gc_state("await_hard_limits");
            if !self.should_block_on_gc() {
                break;
            }
            let (tx, rx) = oneshot::channel();
            *self.blocked_io_wake.borrow_mut() = Some(tx);
            // Woken by exactly one maybe_wake_gc_blocked_io; if the
            // condition regressed since, loop and wait again.
            let _ = rx.await;
        }

        assert!(self.blocked_io_wake.borrow().is_none());
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        state.stats.projected_used_bytes += projected_usage;
        state.stats.projected_count += 1;
        state.stats.projected_used_bytes_sum += state.stats.projected_used_bytes;
        if is_blocked {
            assert!(state.stats.io_blocking_num > 0);
            state.stats.io_blocking_num -= 1;
        }
    }

    /// Return a reservation; may unblock a waiting writer.
    pub fn release_projected_usage(&self, projected_usage: u64) {
        if self.config.disable_trim {
            return;
        }
        assert!(self.init_complete.get());
        {
            let mut state = self.state.borrow_mut();
            assert!(state.stats.projected_used_bytes >= projected_usage);
            state.stats.projected_used_bytes -= projected_usage;
        }
        self.maybe_wake_gc_blocked_io();
    }

    /// Wake the parked reservation iff admission would now succeed.
    fn maybe_wake_gc_blocked_io(&self) {
        if !self.init_complete.get() {
            return;
        }
        if !self.should_block_on_gc() {
            if let Some(wake) = self.blocked_io_wake.borrow_mut().take() {
                let _ = wake.send(());
            }
        }
    }

    /// Nudge the GC task when a signal it sleeps on may have changed.
    fn maybe_wake_gc_on_space_used(&self) {
        if !self.init_complete.get() || self.gc.is_stopping() {
            return;
        }
        if self.gc_should_run() {
            self.gc.wake.notify_one();
        }
    }

    // -- GC cycles ------------------------------------------------------------

    async fn maybe_wait_should_run(&self) {
        while !self.gc.is_stopping() && !self.gc_should_run() {
            self.gc.wake.notified().await;
        }
    }

    async fn gc_run(self: Rc<Self>) {
        loop {
            if self.gc.is_stopping() {
                break;
            }
            self.maybe_wait_should_run().await;
            if self.gc.is_stopping() {
                break;
            }
            self.log_gc_state("gc_process_run");
            self.do_gc_cycle().await;
            // Let foreground tasks run between cycles.
            tokio::task::yield_now().await;
        }
        debug!("gc process exits");
    }

    async fn do_gc_cycle(&self) {
        let (trim_alloc, trim_dirty, reclaim) = {
            let state = self.state.borrow();
            (
                self.gc_should_trim_alloc_with(&state),
                self.gc_should_trim_dirty_with(&state),
                self.gc_should_reclaim_space_with(&state),
            )
        };
        if trim_alloc {
            if let Err(e) = self.gc_trim_alloc().await {
                panic!("gc_trim_alloc hit invalid error: {e}");
            }
        } else if trim_dirty {
            if let Err(e) = self.gc_trim_dirty().await {
                panic!("gc_trim_dirty hit invalid error: {e}");
            }
        } else if reclaim {
            if let Err(e) = self.gc_reclaim_space().await {
                panic!("gc_reclaim_space hit invalid error: {e}");
            }
        }
    }

    async fn gc_trim_alloc(&self) -> Result<()> {
        repeat_eagain("trim_alloc", move || self.gc_trim_alloc_attempt()).await
    }

    async fn gc_trim_alloc_attempt(&self) -> Result<()> {
        let ecb = self.ecb();
        let mut t = ecb
            .begin_transaction(TransactionSource::CleanerTrimAlloc, "trim_alloc")
            .await?;
        let target = self.alloc_tail_target_with(&self.state.borrow());
        debug!(target = %target, "trimming alloc tail");
        let trim_alloc_to = self
            .backrefs
            .merge_cached_backrefs(&mut t, target, self.config.rewrite_backref_bytes_per_cycle)
            .await?;
        if !trim_alloc_to.is_null() {
            ecb.submit_transaction(&mut t, Some(trim_alloc_to)).await?;
        }
        Ok(())
    }

    async fn gc_trim_dirty(&self) -> Result<()> {
        repeat_eagain("trim_dirty", move || self.gc_trim_dirty_attempt()).await
    }

    async fn gc_trim_dirty_attempt(&self) -> Result<()> {
        let ecb = self.ecb();
        let mut t = ecb
            .begin_transaction(TransactionSource::CleanerTrimDirty, "trim_dirty")
            .await?;
        let target = self.dirty_tail_target_with(&self.state.borrow());
        let dirty_list = ecb
            .get_next_dirty_extents(&mut t, target, self.config.rewrite_dirty_bytes_per_cycle)
            .await?;
        debug!(target = %target, extents = dirty_list.len(), "rewriting dirty extents");
        for extent in dirty_list {
            debug!(paddr = %extent.paddr, len = extent.len, "cleaning");
            ecb.rewrite_extent(&mut t, extent, ReclaimGen::DIRTY, ModTime::NULL)
                .await?;
        }
        ecb.submit_transaction(&mut t, None).await
    }

    /// Pick the closed, out-of-journal segment with the best benefit-cost
    /// score. Ties go to the lowest segment id.
    ///
    /// # Panics
    ///
    /// Panics when no candidate scores; the caller must have gated on
    /// `segments_reclaimable > 0`.
    #[must_use]
    pub fn get_next_reclaim_segment(&self) -> SegmentId {
        let state = self.state.borrow();
        let now = if GC_FORMULA == GcFormula::Greedy {
            ModTime::NULL
        } else {
            ModTime::now()
        };
        let bound = if GC_FORMULA == GcFormula::Benefit {
            let bound = state.segments.get_time_bound();
            if bound.is_null() {
                warn!("benefit formula without a time bound");
            }
            bound
        } else {
            ModTime::NULL
        };

        let journal_tail = state.journal_tail();
        let mut best: Option<(SegmentId, f64)> = None;
        for (id, info) in state.segments.iter() {
            if info.is_closed() && !info.is_in_journal(journal_tail) {
                let score = benefit_cost(
                    GC_FORMULA,
                    state.calc_utilization(id),
                    info.modify_time,
                    now,
                    bound,
                );
                if score > best.map_or(0.0, |(_, s)| s) {
                    best = Some((id, score));
                }
            }
        }
        match best {
            Some((id, score)) => {
                debug!(segment = %id, score, "reclaim victim selected");
                id
            }
            None => {
                assert_eq!(self.segments_reclaimable_with(&state), 0);
                // gc_should_reclaim_space() gated on reclaimable > 0
                panic!("no reclaim candidate despite the reclaim gate");
            }
        }
    }

    async fn retrieve_backref_mappings(
        &self,
        start: Paddr,
        end: Paddr,
    ) -> Result<Vec<BackrefPin>> {
        repeat_eagain("get_backref_mappings", move || async move {
            let ecb = self.ecb();
            let mut t = ecb
                .begin_transaction(TransactionSource::Read, "get_backref_mappings")
                .await?;
            self.backrefs.get_mappings(&mut t, start, end).await
        })
        .await
    }

    async fn gc_reclaim_space(&self) -> Result<()> {
        if self.state.borrow().reclaim_state.is_none() {
            let victim = self.get_next_reclaim_segment();
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let info = state.segments.get(victim);
            assert!(info.is_closed());
            let generation = info.generation.expect("closed segment has a generation");
            info!(
                segment = %victim,
                info = %info,
                time_bound = %state.segments.get_time_bound(),
                "reclaim start"
            );
            state.reclaim_state = Some(ReclaimState::create(
                victim,
                generation,
                state.segments.segment_size(),
            ));
        }

        let (start, end) = {
            let mut state = self.state.borrow_mut();
            let cursor = state.reclaim_state.as_mut().expect("cursor just ensured");
            cursor.advance(self.config.reclaim_bytes_per_cycle);
            (cursor.start_pos, cursor.end_pos)
        };
        debug!(start = %start, end = %end, "reclaiming range");

        let pin_list = self.retrieve_backref_mappings(start, end).await?;
        let pins: &[BackrefPin] = &pin_list;
        let reclaimed = repeat_eagain("reclaim_space", move || {
            self.gc_reclaim_attempt(pins, start, end)
        })
        .await?;

        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        state.stats.reclaiming_bytes += reclaimed;
        let (complete, victim) = {
            let cursor = state.reclaim_state.as_ref().expect("cursor active");
            (cursor.is_complete(), cursor.segment_id())
        };
        if complete {
            let segment_size = u64::from(state.segments.segment_size());
            info!(
                segment = %victim,
                reclaimed_alive_ratio =
                    state.stats.reclaiming_bytes as f64 / segment_size as f64,
                "reclaim finish"
            );
            state.stats.reclaimed_bytes += state.stats.reclaiming_bytes;
            state.stats.reclaimed_segment_bytes += segment_size;
            state.stats.reclaiming_bytes = 0;
            state.reclaim_state = None;
        }
        Ok(())
    }

    async fn gc_reclaim_attempt(
        &self,
        pin_list: &[BackrefPin],
        start: Paddr,
        end: Paddr,
    ) -> Result<u64> {
        let ecb = self.ecb();
        let mut t = ecb
            .begin_transaction(TransactionSource::CleanerReclaim, "reclaim_space")
            .await?;

        // Pull the cached backref tree extents into the transaction so they
        // get rewritten along with everything else in the range.
        let cached_extents = self
            .backrefs
            .get_cached_backref_extents_in_range(start, end);
        self.backrefs
            .retrieve_backref_extents(&mut t, cached_extents)
            .await?;

        // Combine persisted pins with cached deltas: a null-laddr delta
        // retires the matching allocation, anything else allocates.
        let mut backrefs: BTreeMap<Paddr, BackrefEntry> = pin_list
            .iter()
            .map(|pin| {
                (
                    pin.paddr,
                    BackrefEntry {
                        paddr: pin.paddr,
                        laddr: pin.laddr,
                        len: pin.len,
                        kind: pin.kind,
                        seq: JournalSeq::NULL,
                    },
                )
            })
            .collect();
        for entry in self.backrefs.get_cached_backref_entries_in_range(start, end) {
            if entry.laddr.is_null() {
                let removed = backrefs
                    .remove(&entry.paddr)
                    .expect("retirement of an unknown backref");
                assert_eq!(removed.len, entry.len);
            } else {
                backrefs.insert(entry.paddr, entry);
            }
        }

        // Of those, keep what the extent layer still considers live.
        let mut live_extents = Vec::new();
        for entry in backrefs.values() {
            debug!(paddr = %entry.paddr, len = entry.len, kind = %entry.kind, "probing extent");
            let extents = ecb
                .get_extents_if_live(&mut t, entry.kind, entry.paddr, entry.laddr, entry.len)
                .await?;
            if extents.is_empty() {
                debug!(paddr = %entry.paddr, "dead, skipping");
            } else {
                live_extents.extend(extents);
            }
        }

        let (victim, target_generation, modify_time, complete) = {
            let state = self.state.borrow();
            let cursor = state.reclaim_state.as_ref().expect("cursor active");
            (
                cursor.segment_id(),
                cursor.target_generation,
                state.segments.get(cursor.segment_id()).modify_time,
                cursor.is_complete(),
            )
        };

        let mut reclaimed = 0_u64;
        for extent in live_extents {
            reclaimed += u64::from(extent.len);
            ecb.rewrite_extent(&mut t, extent, target_generation, modify_time)
                .await?;
        }

        if complete {
            t.mark_segment_to_release(victim);
        }
        ecb.submit_transaction(&mut t, None).await?;
        self.maybe_release_segment(&t).await?;
        Ok(reclaimed)
    }

    /// Post-commit segment release: assert the tracker agrees the segment
    /// is dead, release it on the device, and transition it to empty.
    pub async fn maybe_release_segment(&self, t: &CleanerTransaction) -> Result<()> {
        let to_release = t.segment_to_release();
        if to_release.is_null() {
            return Ok(());
        }
        info!(segment = %to_release, "releasing segment");
        self.devices.release_segment(to_release).await?;
        {
            let mut state = self.state.borrow_mut();
            let old_usage = state.calc_utilization(to_release);
            if state.space_tracker.get_usage(to_release) != 0 {
                state.space_tracker.dump_usage(to_release);
                error!(segment = %to_release, "releasing a segment with live bytes");
                panic!("segment {to_release} still has live bytes at release");
            }
            state.segments.mark_empty(to_release);
            let new_usage = state.calc_utilization(to_release);
            state.adjust_segment_util(old_usage, new_usage);
        }
        self.maybe_wake_gc_blocked_io();
        Ok(())
    }

    // -- mount / init / stop --------------------------------------------------

    /// Reconstruct segment state from on-disk headers and tails.
    ///
    /// # Errors
    ///
    /// Propagates device I/O errors and corrupt metadata. Missing headers
    /// skip the segment; missing or nonce-mismatched tails fall back to a
    /// record scan.
    pub async fn mount(&self) -> Result<()> {
        info!("mounting cleaner");
        self.init_complete.set(false);
        {
            let mut state = self.state.borrow_mut();
            state.journal_head = JournalSeq::NULL;
            state.journal_dirty_tail = JournalSeq::NULL;
            state.journal_alloc_tail = JournalSeq::NULL;
            state.reclaim_state = None;

            let specs: Vec<TrackerDeviceSpec> = self
                .devices
                .devices()
                .map(|d| TrackerDeviceSpec {
                    device: d.device_id(),
                    num_segments: d.num_segments(),
                    segment_size: d.segment_size(),
                    block_size: d.block_size(),
                })
                .collect();
            state.space_tracker = if self.config.detailed_space_tracking {
                Box::new(DetailedSpaceTracker::new(&specs))
            } else {
                Box::new(SimpleSpaceTracker::new(&specs))
            };

            state.segments.reset();
            for device in self.devices.devices() {
                state.segments.add_device(
                    device.device_id(),
                    device.num_segments(),
                    device.segment_size(),
                    device.size(),
                );
            }
            state.stats = CleanerStats::default();
            state.stats.segment_util =
                UtilizationHistogram::new(state.segments.num_segments() as u64);
        }

        let segment_ids: Vec<SegmentId> = {
            let state = self.state.borrow();
            state.segments.iter().map(|(id, _)| id).collect()
        };
        info!(segments = segment_ids.len(), "scanning segment headers");

        for segment in segment_ids {
            let header = match self.devices.read_segment_header(segment).await {
                Ok(header) => header,
                Err(StoreError::NotFound { .. }) | Err(StoreError::NoData { .. }) => {
                    debug!(segment = %segment, "no header, leaving empty");
                    continue;
                }
                Err(e) => return Err(e),
            };
            debug!(segment = %segment, seq = %header.seq, kind = %header.kind, "decoded header");

            match self.devices.read_segment_tail(segment).await {
                Ok(tail) if tail.nonce == header.nonce => {
                    if tail.modify_time.is_null() != (tail.num_extents == 0) {
                        return Err(StoreError::Corrupt {
                            detail: format!(
                                "segment {segment} tail has modify_time {} with {} extents",
                                tail.modify_time, tail.num_extents
                            ),
                        });
                    }
                    self.state.borrow_mut().segments.update_modify_time(
                        segment,
                        tail.modify_time,
                        tail.num_extents,
                    );
                    self.init_mark_segment_closed(segment, &header);
                }
                Ok(_) => {
                    // Tail from an earlier life of this segment.
                    self.scan_no_tail_segment(segment, &header).await?;
                }
                Err(StoreError::NoData { .. }) => {
                    self.scan_no_tail_segment(segment, &header).await?;
                }
                Err(e) => return Err(e),
            }
        }

        // The journal replay that follows rebuilds the live-byte accounting
        // from scratch.
        self.state.borrow_mut().space_tracker.reset();
        info!(segments = %self.state.borrow().segments, "mount done");
        Ok(())
    }

    /// Reconstruct a segment's modify time by scanning its records.
    async fn scan_no_tail_segment(
        &self,
        segment: SegmentId,
        header: &SegmentHeader,
    ) -> Result<()> {
        info!(segment = %segment, seq = %header.seq, "scanning segment without tail");
        let records = self
            .devices
            .scan_valid_records(segment, header.nonce)
            .await?;
        {
            let mut state = self.state.borrow_mut();
            for record in records {
                if record.num_extents == 0 || !record.modify_time.is_null() {
                    state
                        .segments
                        .update_modify_time(segment, record.modify_time, record.num_extents);
                } else {
                    return Err(StoreError::Corrupt {
                        detail: format!(
                            "segment {segment} record with {} extents and a null modify time",
                            record.num_extents
                        ),
                    });
                }
            }
        }
        self.init_mark_segment_closed(segment, header);
        Ok(())
    }

    fn init_mark_segment_closed(&self, segment: SegmentId, header: &SegmentHeader) {
        {
            let mut state = self.state.borrow_mut();
            let old_usage = state.calc_utilization(segment);
            state.segments.init_closed(
                segment,
                header.seq,
                header.kind,
                header.category,
                header.generation,
            );
            let new_usage = state.calc_utilization(segment);
            state.adjust_segment_util(old_usage, new_usage);
        }
        let allocator = match header.kind {
            SegmentKind::Journal => &self.journal_seq_allocator,
            SegmentKind::Ool => &self.ool_seq_allocator,
        };
        allocator.set_next_segment_seq(header.seq.succ());
    }

    /// Called once journal replay has repopulated the accounting and the
    /// journal head/tails. Starts the GC task on the current `LocalSet`.
    pub fn complete_init(self: &Rc<Self>) {
        if self.config.disable_trim {
            self.init_complete.set(true);
            return;
        }
        {
            let state = self.state.borrow();
            assert!(!state.journal_head.is_null());
            assert!(!state.journal_alloc_tail.is_null());
            assert!(!state.journal_dirty_tail.is_null());
        }
        self.init_complete.set(true);
        info!("init complete, starting gc");
        let cleaner = Rc::clone(self);
        let handle = tokio::task::spawn_local(cleaner.gc_run());
        *self.gc.handle.borrow_mut() = Some(handle);
    }

    /// Stop the GC task and wait for it to exit.
    pub async fn stop(&self) {
        self.gc.stopping.set(true);
        self.gc.wake.notify_one();
        let handle = self.gc.handle.borrow_mut().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("cleaner stopped");
    }

    // -- metrics ----------------------------------------------------------------

    /// Assemble the full metric surface.
    #[must_use]
    pub fn metrics(&self) -> CleanerMetricsSnapshot {
        let state = self.state.borrow();
        let stats = &state.stats;
        CleanerMetricsSnapshot {
            segments_number: state.segments.num_segments() as u64,
            segment_size: u64::from(state.segments.segment_size()),
            segments_in_journal: self.segments_in_journal_with(&state) as u64,
            segments_type_journal: state.segments.num_type_journal() as u64,
            segments_type_ool: state.segments.num_type_ool() as u64,
            segments_open: state.segments.num_open() as u64,
            segments_empty: state.segments.num_empty() as u64,
            segments_closed: state.segments.num_closed() as u64,
            count_open_journal: state.segments.count_open(SegmentKind::Journal),
            count_open_ool: state.segments.count_open(SegmentKind::Ool),
            count_release_journal: state.segments.count_release(SegmentKind::Journal),
            count_release_ool: state.segments.count_release(SegmentKind::Ool),
            count_close_journal: state.segments.count_close(SegmentKind::Journal),
            count_close_ool: state.segments.count_close(SegmentKind::Ool),
            total_bytes: state.segments.total_bytes(),
            available_bytes: state.segments.available_bytes(),
            unavailable_unreclaimable_bytes: self.unavailable_unreclaimable_bytes_with(&state),
            unavailable_reclaimable_bytes: self.unavailable_reclaimable_bytes_with(&state),
            used_bytes: stats.used_bytes,
            unavailable_unused_bytes: self.unavailable_unused_bytes_with(&state),
            dirty_journal_bytes: self.dirty_journal_bytes_with(&state),
            alloc_journal_bytes: self.alloc_journal_bytes_with(&state),
            projected_count: stats.projected_count,
            projected_used_bytes_sum: stats.projected_used_bytes_sum,
            io_count: stats.io_count,
            io_blocked_count: stats.io_blocked_count,
            io_blocked_count_trim: stats.io_blocked_count_trim,
            io_blocked_count_reclaim: stats.io_blocked_count_reclaim,
            io_blocked_sum: stats.io_blocked_sum,
            reclaimed_bytes: stats.reclaimed_bytes,
            reclaimed_segment_bytes: stats.reclaimed_segment_bytes,
            closed_journal_used_bytes: stats.closed_journal_used_bytes,
            closed_journal_total_bytes: stats.closed_journal_total_bytes,
            closed_ool_used_bytes: stats.closed_ool_used_bytes,
            closed_ool_total_bytes: stats.closed_ool_total_bytes,
            available_ratio: state.segments.available_ratio(),
            reclaim_ratio: self.reclaim_ratio_with(&state),
            segment_utilization_distribution: *stats.segment_util.buckets(),
        }
    }

    /// Audit hook: verify an independently-maintained tracker agrees with
    /// the production one.
    #[must_use]
    pub fn audit_space_tracker(&self, other: &dyn SpaceTracker) -> bool {
        self.state.borrow().space_tracker.equals(other)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
