//! In-memory collaborator mocks for cleaner integration tests.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::future::Future;
use std::rc::{Rc, Weak};

use async_trait::async_trait;
use segstore_cleaner::{
    AsyncCleaner, BackrefEntry, BackrefManager, BackrefPin, CleanerTransaction, ExtentCallback,
    ExtentInfo, ExtentKind, RecordSummary, SegmentDevice, TransactionSource,
};
use segstore_error::{Result, StoreError};
use segstore_types::{
    DeviceId, JournalSeq, Laddr, ModTime, Paddr, ReclaimGen, SegmentHeader, SegmentId,
    SegmentNonce, SegmentTail,
};

pub const SEGMENT_SIZE: u32 = 1024;
pub const BLOCK_SIZE: u32 = 256;

/// Run a future on a current-thread runtime with a `LocalSet`, matching the
/// cleaner's single-shard execution model.
pub fn run_local<F: Future>(fut: F) -> F::Output {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("build runtime");
    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, fut)
}

pub fn seg(index: u32) -> SegmentId {
    SegmentId::new(DeviceId::new(0), index)
}

pub fn paddr(segment: u32, offset: u32) -> Paddr {
    Paddr::new_seg(seg(segment), offset)
}

pub fn jseq(sequence: u32, segment: u32, offset: u32) -> JournalSeq {
    JournalSeq::new(segstore_types::SegmentSeq::new(sequence), paddr(segment, offset))
}

// ---------------------------------------------------------------------------
// MemoryDevice
// ---------------------------------------------------------------------------

/// A segmented device living entirely in memory.
pub struct MemoryDevice {
    device: DeviceId,
    num_segments: u32,
    headers: RefCell<BTreeMap<SegmentId, SegmentHeader>>,
    tails: RefCell<BTreeMap<SegmentId, SegmentTail>>,
    records: RefCell<BTreeMap<SegmentId, Vec<RecordSummary>>>,
    pub released: RefCell<Vec<SegmentId>>,
}

impl MemoryDevice {
    pub fn new(device: DeviceId, num_segments: u32) -> Rc<Self> {
        Rc::new(Self {
            device,
            num_segments,
            headers: RefCell::new(BTreeMap::new()),
            tails: RefCell::new(BTreeMap::new()),
            records: RefCell::new(BTreeMap::new()),
            released: RefCell::new(Vec::new()),
        })
    }

    pub fn put_header(&self, segment: SegmentId, header: SegmentHeader) {
        self.headers.borrow_mut().insert(segment, header);
    }

    pub fn put_tail(&self, segment: SegmentId, tail: SegmentTail) {
        self.tails.borrow_mut().insert(segment, tail);
    }

    pub fn put_records(&self, segment: SegmentId, records: Vec<RecordSummary>) {
        self.records.borrow_mut().insert(segment, records);
    }
}

#[async_trait(?Send)]
impl SegmentDevice for MemoryDevice {
    fn device_id(&self) -> DeviceId {
        self.device
    }

    fn num_segments(&self) -> u32 {
        self.num_segments
    }

    fn segment_size(&self) -> u32 {
        SEGMENT_SIZE
    }

    fn block_size(&self) -> u32 {
        BLOCK_SIZE
    }

    fn size(&self) -> u64 {
        u64::from(self.num_segments) * u64::from(SEGMENT_SIZE)
    }

    async fn read_segment_header(&self, segment: SegmentId) -> Result<SegmentHeader> {
        self.headers
            .borrow()
            .get(&segment)
            .copied()
            .ok_or_else(|| StoreError::NotFound {
                what: format!("segment header {segment}"),
            })
    }

    async fn read_segment_tail(&self, segment: SegmentId) -> Result<SegmentTail> {
        self.tails
            .borrow()
            .get(&segment)
            .copied()
            .ok_or_else(|| StoreError::NoData {
                what: format!("segment tail {segment}"),
            })
    }

    async fn scan_valid_records(
        &self,
        segment: SegmentId,
        _nonce: SegmentNonce,
    ) -> Result<Vec<RecordSummary>> {
        Ok(self
            .records
            .borrow()
            .get(&segment)
            .cloned()
            .unwrap_or_default())
    }

    async fn release_segment(&self, segment: SegmentId) -> Result<()> {
        self.released.borrow_mut().push(segment);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockBackrefs
// ---------------------------------------------------------------------------

/// Programmable backref manager.
#[derive(Default)]
pub struct MockBackrefs {
    /// Persisted mappings, keyed by paddr.
    pub pins: RefCell<BTreeMap<Paddr, BackrefPin>>,
    /// Cached deltas not yet merged.
    pub cached_entries: RefCell<Vec<BackrefEntry>>,
    /// Cached backref tree extent addresses.
    pub cached_extents: RefCell<Vec<Paddr>>,
    /// Whether `merge_cached_backrefs` has deltas to merge; when true it
    /// reports the requested limit as the new alloc tail.
    pub mergeable: Cell<bool>,
    pub merge_calls: Cell<u32>,
    pub retrieved_extents: RefCell<Vec<Paddr>>,
}

impl MockBackrefs {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn put_pin(&self, pin: BackrefPin) {
        self.pins.borrow_mut().insert(pin.paddr, pin);
    }
}

#[async_trait(?Send)]
impl BackrefManager for MockBackrefs {
    async fn get_mappings(
        &self,
        _t: &mut CleanerTransaction,
        start: Paddr,
        end: Paddr,
    ) -> Result<Vec<BackrefPin>> {
        Ok(self
            .pins
            .borrow()
            .range(start..end)
            .map(|(_, pin)| *pin)
            .collect())
    }

    async fn merge_cached_backrefs(
        &self,
        _t: &mut CleanerTransaction,
        limit: JournalSeq,
        _byte_budget: u64,
    ) -> Result<JournalSeq> {
        self.merge_calls.set(self.merge_calls.get() + 1);
        if self.mergeable.get() {
            self.mergeable.set(false);
            Ok(limit)
        } else {
            Ok(JournalSeq::NULL)
        }
    }

    async fn retrieve_backref_extents(
        &self,
        _t: &mut CleanerTransaction,
        cached_extents: Vec<Paddr>,
    ) -> Result<()> {
        self.retrieved_extents.borrow_mut().extend(cached_extents);
        Ok(())
    }

    fn get_cached_backref_extents_in_range(&self, start: Paddr, end: Paddr) -> Vec<Paddr> {
        self.cached_extents
            .borrow()
            .iter()
            .copied()
            .filter(|addr| (start..end).contains(addr))
            .collect()
    }

    fn get_cached_backref_entries_in_range(&self, start: Paddr, end: Paddr) -> Vec<BackrefEntry> {
        self.cached_entries
            .borrow()
            .iter()
            .copied()
            .filter(|entry| (start..end).contains(&entry.paddr))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// MockEngine (ExtentCallback)
// ---------------------------------------------------------------------------

/// One recorded rewrite.
#[derive(Debug, Clone, Copy)]
pub struct RewriteCall {
    pub extent: ExtentInfo,
    pub target_generation: ReclaimGen,
    pub modify_time: ModTime,
}

/// Mock transaction engine.
///
/// Keeps a live-extent map; a reclaim submit relocates every extent
/// rewritten in that transaction to `rewrite_target` and updates the
/// cleaner's space accounting the way a committed transaction would. A
/// trim submit advances the matching journal tail to the limit last asked
/// for, standing in for the journal's tail records.
#[derive(Default)]
pub struct MockEngine {
    cleaner: RefCell<Option<Weak<AsyncCleaner>>>,
    /// Extents the LBA layer still maps, keyed by paddr.
    pub live: RefCell<BTreeMap<Paddr, ExtentInfo>>,
    /// Dirty extents awaiting a trim-dirty rewrite.
    pub dirty: RefCell<Vec<ExtentInfo>>,
    /// Where reclaim rewrites land: `(segment, next offset)`.
    pub rewrite_target: Cell<Option<(SegmentId, u32)>>,
    /// Pending submit failures, consumed one per submit.
    pub conflicts_remaining: Cell<u32>,
    pub begin_calls: Cell<u32>,
    pub submit_calls: Cell<u32>,
    pub rewrites: RefCell<Vec<RewriteCall>>,
    last_dirty_limit: Cell<Option<JournalSeq>>,
    /// Rewrites staged by the open transaction, applied on submit.
    staged_rewrites: RefCell<Vec<RewriteCall>>,
}

impl MockEngine {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn bind(&self, cleaner: &Rc<AsyncCleaner>) {
        *self.cleaner.borrow_mut() = Some(Rc::downgrade(cleaner));
    }

    fn cleaner(&self) -> Rc<AsyncCleaner> {
        self.cleaner
            .borrow()
            .as_ref()
            .expect("engine bound to a cleaner")
            .upgrade()
            .expect("cleaner alive")
    }

    pub fn put_live(&self, extent: ExtentInfo) {
        self.live.borrow_mut().insert(extent.paddr, extent);
    }

    /// Apply a staged reclaim rewrite: free the old location, place the
    /// extent at the target segment, and keep the live map coherent.
    fn commit_reclaim_rewrite(&self, call: &RewriteCall) {
        let cleaner = self.cleaner();
        let (target, offset) = self.rewrite_target.get().expect("rewrite target set");
        let old = call.extent;
        self.live.borrow_mut().remove(&old.paddr);
        cleaner.mark_space_free(old.paddr, old.len, false);

        let new_paddr = Paddr::new_seg(target, offset);
        let moved = ExtentInfo {
            paddr: new_paddr,
            ..old
        };
        self.live.borrow_mut().insert(new_paddr, moved);
        cleaner.mark_space_used(new_paddr, old.len, false);
        self.rewrite_target.set(Some((target, offset + old.len)));
    }
}

#[async_trait(?Send)]
impl ExtentCallback for MockEngine {
    async fn begin_transaction(
        &self,
        source: TransactionSource,
        name: &'static str,
    ) -> Result<CleanerTransaction> {
        self.begin_calls.set(self.begin_calls.get() + 1);
        self.staged_rewrites.borrow_mut().clear();
        Ok(CleanerTransaction::new(source, name))
    }

    async fn get_next_dirty_extents(
        &self,
        _t: &mut CleanerTransaction,
        limit: JournalSeq,
        byte_budget: u64,
    ) -> Result<Vec<ExtentInfo>> {
        self.last_dirty_limit.set(Some(limit));
        let dirty = self.dirty.borrow();
        let mut taken = Vec::new();
        let mut budget = byte_budget;
        for extent in dirty.iter() {
            if extent.seq <= limit && u64::from(extent.len) <= budget {
                budget -= u64::from(extent.len);
                taken.push(*extent);
            }
        }
        Ok(taken)
    }

    async fn rewrite_extent(
        &self,
        t: &mut CleanerTransaction,
        extent: ExtentInfo,
        target_generation: ReclaimGen,
        modify_time: ModTime,
    ) -> Result<()> {
        let call = RewriteCall {
            extent,
            target_generation,
            modify_time,
        };
        self.rewrites.borrow_mut().push(call);
        if t.source() == TransactionSource::CleanerReclaim {
            self.staged_rewrites.borrow_mut().push(call);
        }
        Ok(())
    }

    async fn get_extents_if_live(
        &self,
        _t: &mut CleanerTransaction,
        _kind: ExtentKind,
        paddr: Paddr,
        _laddr: Laddr,
        _len: u32,
    ) -> Result<Vec<ExtentInfo>> {
        Ok(self.live.borrow().get(&paddr).copied().into_iter().collect())
    }

    async fn submit_transaction(
        &self,
        t: &mut CleanerTransaction,
        new_alloc_tail: Option<JournalSeq>,
    ) -> Result<()> {
        self.submit_calls.set(self.submit_calls.get() + 1);
        if self.conflicts_remaining.get() > 0 {
            self.conflicts_remaining.set(self.conflicts_remaining.get() - 1);
            self.staged_rewrites.borrow_mut().clear();
            return Err(StoreError::TransientConflict);
        }
        let cleaner = self.cleaner();
        match t.source() {
            TransactionSource::CleanerTrimAlloc => {
                let tail = new_alloc_tail.expect("trim-alloc submits carry a tail");
                cleaner.update_journal_tails(JournalSeq::NULL, tail);
            }
            TransactionSource::CleanerTrimDirty => {
                // Everything at or below the limit was rewritten; the
                // journal's tail record lands with the commit.
                let limit = self.last_dirty_limit.get().expect("dirty limit recorded");
                self.dirty.borrow_mut().retain(|e| e.seq > limit);
                cleaner.update_journal_tails(limit, JournalSeq::NULL);
            }
            TransactionSource::CleanerReclaim => {
                let staged: Vec<RewriteCall> = self.staged_rewrites.borrow_mut().drain(..).collect();
                for call in &staged {
                    self.commit_reclaim_rewrite(call);
                }
            }
            TransactionSource::Read => {}
        }
        Ok(())
    }
}
