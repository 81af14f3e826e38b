//! Asynchronous segment cleaner for the segstore engine.
//!
//! Owns space accounting, the segment lifecycle state machine, journal-tail
//! bookkeeping, the GC policy and cycle, and writer admission control. The
//! engine's device, backref, and transaction layers plug in through the
//! traits in [`interfaces`].

pub mod cleaner;
pub mod config;
pub mod interfaces;
pub mod metrics;
pub mod policy;
pub mod reclaim;
pub mod segments;
pub mod seq_allocator;
pub mod space_tracker;

pub use cleaner::AsyncCleaner;
pub use config::CleanerConfig;
pub use interfaces::{
    BackrefEntry, BackrefManager, BackrefPin, CleanerTransaction, DeviceGroup, ExtentCallback,
    ExtentInfo, ExtentKind, RecordSummary, SegmentDevice, TransactionSource,
};
pub use metrics::{CleanerMetricsSnapshot, CleanerStats, UtilizationHistogram, UTIL_BUCKETS};
pub use policy::{benefit_cost, GcFormula, GC_FORMULA};
pub use reclaim::ReclaimState;
pub use segments::{SegmentInfo, SegmentState, SegmentsInfo};
pub use seq_allocator::SegmentSeqAllocator;
pub use space_tracker::{
    DetailedSpaceTracker, SimpleSpaceTracker, SpaceTracker, TrackerDeviceSpec,
};
