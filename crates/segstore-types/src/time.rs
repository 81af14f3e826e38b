//! Extent modify-time tracking.
//!
//! A segment's modify time is the running average of its extents'
//! modification timestamps, weighted by extent count. Milliseconds since the
//! Unix epoch; zero is the null sentinel (no extent has contributed yet).

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch; zero means "no time recorded".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ModTime(i64);

impl ModTime {
    /// Null sentinel.
    pub const NULL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    #[inline]
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self(ms)
    }

    /// Merge two averaged times weighted by their extent counts.
    ///
    /// Divides before multiplying so large timestamps cannot overflow.
    ///
    /// # Panics
    ///
    /// Panics if either time is null or both counts are zero.
    #[must_use]
    pub fn average(t1: ModTime, n1: u64, t2: ModTime, n2: u64) -> Self {
        assert!(!t1.is_null());
        assert!(!t2.is_null());
        let total = n1 + n2;
        assert!(total > 0);
        let c1 = t1.0 / total as i64 * n1 as i64;
        let c2 = t2.0 / total as i64 * n2 as i64;
        Self(c1 + c2)
    }
}

impl fmt::Display for ModTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("time(null)")
        } else {
            write!(f, "time({}ms)", self.0)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
