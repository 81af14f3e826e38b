//! Compact two-level segment index.
//!
//! [`SegmentMap`] maps `(device, device-segment)` to a value with O(1)
//! lookup and iteration in ascending `(device, index)` order. Devices are
//! registered up front with [`SegmentMap::add_device`]; touching an
//! unregistered or out-of-range id is a programming error and panics.

use std::ops::{Index, IndexMut};

use crate::addr::{DeviceId, SegmentId};

/// `(device, device-segment) → T`, device-major.
#[derive(Debug, Clone)]
pub struct SegmentMap<T> {
    /// Indexed by device id. An empty inner vector means "device not added".
    device_to_segments: Vec<Vec<T>>,
    total_segments: usize,
}

impl<T> SegmentMap<T> {
    #[must_use]
    pub fn new() -> Self {
        let slots = usize::from(DeviceId::MAX_VALID_SEGMENT.get()) + 1;
        Self {
            device_to_segments: (0..slots).map(|_| Vec::new()).collect(),
            total_segments: 0,
        }
    }

    /// Register `device` with `segments` slots initialized to `init`.
    ///
    /// # Panics
    ///
    /// Panics if the device is not a segmented device, was already added, or
    /// `segments` is zero.
    pub fn add_device(&mut self, device: DeviceId, segments: usize, init: &T)
    where
        T: Clone,
    {
        let slot = usize::from(device.get());
        assert!(
            slot < self.device_to_segments.len(),
            "device {device} is out of the segmented range"
        );
        assert!(
            self.device_to_segments[slot].is_empty(),
            "device {device} added twice"
        );
        assert!(segments > 0);
        self.device_to_segments[slot] = vec![init.clone(); segments];
        self.total_segments += segments;
    }

    /// Drop every registered device.
    pub fn clear(&mut self) {
        for segments in &mut self.device_to_segments {
            segments.clear();
        }
        self.total_segments = 0;
    }

    /// Whether `id` falls within a registered device's range.
    #[must_use]
    pub fn contains(&self, id: SegmentId) -> bool {
        self.device_to_segments
            .get(usize::from(id.device_id().get()))
            .is_some_and(|segs| (id.device_segment() as usize) < segs.len())
    }

    /// Total registered segments across all devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.total_segments
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_segments == 0
    }

    /// Iterate `(segment_id, &T)` in ascending `(device, index)` order.
    pub fn iter(&self) -> impl Iterator<Item = (SegmentId, &T)> {
        self.device_to_segments
            .iter()
            .enumerate()
            .flat_map(|(device, segments)| {
                segments.iter().enumerate().map(move |(index, value)| {
                    (
                        SegmentId::new(DeviceId::new(device as u8), index as u32),
                        value,
                    )
                })
            })
    }
}

impl<T> Default for SegmentMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Index<SegmentId> for SegmentMap<T> {
    type Output = T;

    fn index(&self, id: SegmentId) -> &T {
        assert!(self.contains(id), "segment {id} is not registered");
        &self.device_to_segments[usize::from(id.device_id().get())][id.device_segment() as usize]
    }
}

impl<T> IndexMut<SegmentId> for SegmentMap<T> {
    fn index_mut(&mut self, id: SegmentId) -> &mut T {
        assert!(self.contains(id), "segment {id} is not registered");
        &mut self.device_to_segments[usize::from(id.device_id().get())]
            [id.device_segment() as usize]
    }
}

// ===========================================================================
// Tests
// ===========================================================================
