//! Contracts between the cleaner and its collaborators.
//!
//! The cleaner never touches records or the logical-address tree itself; it
//! drives three external parties:
//!
//! - [`SegmentDevice`] / [`DeviceGroup`]: raw segment read/release and the
//!   mount-time header, tail, and record scans.
//! - [`BackrefManager`]: physical-to-logical reverse mappings, both the
//!   persisted tree and the in-memory delta cache.
//! - [`ExtentCallback`]: opens cleaner transactions, rewrites extents, and
//!   submits the result through the transaction engine.
//!
//! All traits are `?Send`: the engine is single-threaded per shard, and the
//! cleaner's bookkeeping relies on running without preemption between await
//! points.

use std::fmt;
use std::rc::Rc;

use async_trait::async_trait;
use segstore_error::Result;
use segstore_types::{
    DeviceId, JournalSeq, Laddr, ModTime, Paddr, ReclaimGen, SegmentHeader, SegmentId,
    SegmentNonce, SegmentTail,
};

// ---------------------------------------------------------------------------
// Extent descriptions
// ---------------------------------------------------------------------------

/// Opaque extent type tag; the cleaner only shuttles it between
/// collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ExtentKind(pub u8);

impl fmt::Display for ExtentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ext{}", self.0)
    }
}

/// An extent as the cleaner sees it: a fully opaque
/// `(physical, logical, length, type, sequence)` tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentInfo {
    pub paddr: Paddr,
    pub laddr: Laddr,
    pub len: u32,
    pub kind: ExtentKind,
    pub seq: JournalSeq,
}

/// A persisted backref mapping returned by [`BackrefManager::get_mappings`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackrefPin {
    pub paddr: Paddr,
    pub laddr: Laddr,
    pub len: u32,
    pub kind: ExtentKind,
}

/// A cached backref delta. `laddr == Laddr::NULL` encodes a retirement of
/// the matching allocation; anything else is an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackrefEntry {
    pub paddr: Paddr,
    pub laddr: Laddr,
    pub len: u32,
    pub kind: ExtentKind,
    pub seq: JournalSeq,
}

/// Summary of one record group found while scanning a segment without a
/// valid tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSummary {
    pub modify_time: ModTime,
    pub num_extents: u64,
}

// ---------------------------------------------------------------------------
// Cleaner transactions
// ---------------------------------------------------------------------------

/// Why a cleaner transaction was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionSource {
    /// Read-only backref lookup.
    Read,
    CleanerTrimAlloc,
    CleanerTrimDirty,
    CleanerReclaim,
}

impl fmt::Display for TransactionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::CleanerTrimAlloc => f.write_str("cleaner_trim_alloc"),
            Self::CleanerTrimDirty => f.write_str("cleaner_trim_dirty"),
            Self::CleanerReclaim => f.write_str("cleaner_reclaim"),
        }
    }
}

/// A transaction handle threaded through the extent-callback interface.
///
/// The cleaner marks a victim segment here; after the transaction commits,
/// [`crate::AsyncCleaner`] observes the marker and releases the segment.
#[derive(Debug)]
pub struct CleanerTransaction {
    source: TransactionSource,
    name: &'static str,
    segment_to_release: SegmentId,
}

impl CleanerTransaction {
    #[must_use]
    pub fn new(source: TransactionSource, name: &'static str) -> Self {
        Self {
            source,
            name,
            segment_to_release: SegmentId::NULL,
        }
    }

    #[must_use]
    pub fn source(&self) -> TransactionSource {
        self.source
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Release `segment` when this transaction commits.
    pub fn mark_segment_to_release(&mut self, segment: SegmentId) {
        assert!(self.segment_to_release.is_null());
        self.segment_to_release = segment;
    }

    /// The marked segment, or null.
    #[must_use]
    pub fn segment_to_release(&self) -> SegmentId {
        self.segment_to_release
    }
}

// ---------------------------------------------------------------------------
// SegmentDevice / DeviceGroup
// ---------------------------------------------------------------------------

/// One segmented device.
#[async_trait(?Send)]
pub trait SegmentDevice {
    fn device_id(&self) -> DeviceId;
    fn num_segments(&self) -> u32;
    fn segment_size(&self) -> u32;
    fn block_size(&self) -> u32;
    /// Total managed bytes of this device.
    fn size(&self) -> u64;

    /// Read and decode the header block.
    ///
    /// # Errors
    ///
    /// `NotFound` if the segment was never written, `Corrupt` if the block
    /// does not decode, or `Io` on device failure.
    async fn read_segment_header(&self, segment: SegmentId) -> Result<SegmentHeader>;

    /// Read and decode the tail block.
    ///
    /// # Errors
    ///
    /// `NoData` if the tail was never written, `Corrupt` or `Io` otherwise.
    async fn read_segment_tail(&self, segment: SegmentId) -> Result<SegmentTail>;

    /// Walk the record groups of `segment`, validating against `nonce`, and
    /// summarize each group's modify time and extent count.
    async fn scan_valid_records(
        &self,
        segment: SegmentId,
        nonce: SegmentNonce,
    ) -> Result<Vec<RecordSummary>>;

    /// Return the segment's space to the device.
    async fn release_segment(&self, segment: SegmentId) -> Result<()>;
}

/// Routes by device id across the registered [`SegmentDevice`]s.
pub struct DeviceGroup {
    devices: Vec<Rc<dyn SegmentDevice>>,
}

impl DeviceGroup {
    /// # Panics
    ///
    /// Panics on an empty set or duplicate device ids.
    #[must_use]
    pub fn new(devices: Vec<Rc<dyn SegmentDevice>>) -> Self {
        assert!(!devices.is_empty());
        for (i, a) in devices.iter().enumerate() {
            for b in &devices[i + 1..] {
                assert_ne!(
                    a.device_id(),
                    b.device_id(),
                    "duplicate device {}",
                    a.device_id()
                );
            }
        }
        Self { devices }
    }

    pub fn devices(&self) -> impl Iterator<Item = &Rc<dyn SegmentDevice>> {
        self.devices.iter()
    }

    fn device(&self, id: DeviceId) -> &Rc<dyn SegmentDevice> {
        self.devices
            .iter()
            .find(|d| d.device_id() == id)
            .unwrap_or_else(|| panic!("device {id} is not registered"))
    }

    pub async fn read_segment_header(&self, segment: SegmentId) -> Result<SegmentHeader> {
        self.device(segment.device_id())
            .read_segment_header(segment)
            .await
    }

    pub async fn read_segment_tail(&self, segment: SegmentId) -> Result<SegmentTail> {
        self.device(segment.device_id())
            .read_segment_tail(segment)
            .await
    }

    pub async fn scan_valid_records(
        &self,
        segment: SegmentId,
        nonce: SegmentNonce,
    ) -> Result<Vec<RecordSummary>> {
        self.device(segment.device_id())
            .scan_valid_records(segment, nonce)
            .await
    }

    pub async fn release_segment(&self, segment: SegmentId) -> Result<()> {
        self.device(segment.device_id())
            .release_segment(segment)
            .await
    }
}

// ---------------------------------------------------------------------------
// BackrefManager
// ---------------------------------------------------------------------------

/// Reverse-mapping lookups and delta merging.
#[async_trait(?Send)]
pub trait BackrefManager {
    /// Persisted mappings covering `[start, end)`.
    async fn get_mappings(
        &self,
        t: &mut CleanerTransaction,
        start: Paddr,
        end: Paddr,
    ) -> Result<Vec<BackrefPin>>;

    /// Merge cached backref deltas with journal positions below `limit`
    /// into the persisted tree, up to `byte_budget` bytes. Returns the new
    /// alloc tail, or [`JournalSeq::NULL`] if nothing was merged.
    async fn merge_cached_backrefs(
        &self,
        t: &mut CleanerTransaction,
        limit: JournalSeq,
        byte_budget: u64,
    ) -> Result<JournalSeq>;

    /// Pull the listed cached backref tree extents into the transaction so
    /// a reclaim can rewrite them alongside user data.
    async fn retrieve_backref_extents(
        &self,
        t: &mut CleanerTransaction,
        cached_extents: Vec<Paddr>,
    ) -> Result<()>;

    /// Addresses of cached backref tree extents within `[start, end)`.
    fn get_cached_backref_extents_in_range(&self, start: Paddr, end: Paddr) -> Vec<Paddr>;

    /// Cached backref deltas within `[start, end)`.
    fn get_cached_backref_entries_in_range(&self, start: Paddr, end: Paddr) -> Vec<BackrefEntry>;
}

// ---------------------------------------------------------------------------
// ExtentCallback
// ---------------------------------------------------------------------------

/// Rewrites extents and submits cleaner transactions.
#[async_trait(?Send)]
pub trait ExtentCallback {
    /// Open a transaction attributed to `source`.
    async fn begin_transaction(
        &self,
        source: TransactionSource,
        name: &'static str,
    ) -> Result<CleanerTransaction>;

    /// Up to `byte_budget` bytes of dirty extents whose journal position is
    /// at or below `limit`, oldest first.
    async fn get_next_dirty_extents(
        &self,
        t: &mut CleanerTransaction,
        limit: JournalSeq,
        byte_budget: u64,
    ) -> Result<Vec<ExtentInfo>>;

    /// Copy `extent` into a segment of `target_generation`, carrying
    /// `modify_time` forward (null for journal-trim rewrites).
    async fn rewrite_extent(
        &self,
        t: &mut CleanerTransaction,
        extent: ExtentInfo,
        target_generation: ReclaimGen,
        modify_time: ModTime,
    ) -> Result<()>;

    /// The live extents still mapped at `paddr`, or empty if the address
    /// is dead.
    async fn get_extents_if_live(
        &self,
        t: &mut CleanerTransaction,
        kind: ExtentKind,
        paddr: Paddr,
        laddr: Laddr,
        len: u32,
    ) -> Result<Vec<ExtentInfo>>;

    /// Commit the transaction, optionally carrying a new alloc tail.
    ///
    /// # Errors
    ///
    /// `TransientConflict` when a foreground mutator won the race; the
    /// caller retries the whole cycle.
    async fn submit_transaction(
        &self,
        t: &mut CleanerTransaction,
        new_alloc_tail: Option<JournalSeq>,
    ) -> Result<()>;
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_release_marker() {
        let mut t = CleanerTransaction::new(TransactionSource::CleanerReclaim, "reclaim_space");
        assert!(t.segment_to_release().is_null());
        let victim = SegmentId::new(DeviceId::new(0), 3);
        t.mark_segment_to_release(victim);
        assert_eq!(t.segment_to_release(), victim);
    }

    #[test]
    #[should_panic]
    fn double_release_marker_is_fatal() {
        let mut t = CleanerTransaction::new(TransactionSource::CleanerReclaim, "reclaim_space");
        let victim = SegmentId::new(DeviceId::new(0), 3);
        t.mark_segment_to_release(victim);
        t.mark_segment_to_release(victim);
    }

    #[test]
    fn source_names() {
        assert_eq!(TransactionSource::CleanerTrimDirty.to_string(), "cleaner_trim_dirty");
        assert_eq!(TransactionSource::Read.to_string(), "read");
    }
}
