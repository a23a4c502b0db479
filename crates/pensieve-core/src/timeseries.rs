//! Fixed-capacity time series storage.
//!
//! [`RingBuffer`] holds the most recent `capacity` samples and overwrites the
//! oldest one once full. It carries no lock of its own: callers that share a
//! buffer wrap it (usually together with related counters) in their own lock,
//! so several buffers can be updated under a single acquisition.

use serde::{Deserialize, Serialize};

/// Capacity used when a non-positive capacity is requested.
pub const DEFAULT_CAPACITY: usize = 60;

/// A single `(timestamp, value)` sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    /// Unix timestamp in seconds.
    pub timestamp: i64,
    /// Sample value.
    pub value: f64,
}

/// Circular buffer of time series samples.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    slots: Vec<TimeSeriesPoint>,
    /// Index of the logically oldest sample.
    head: usize,
    len: usize,
    capacity: usize,
}

impl RingBuffer {
    /// Create a buffer holding at most `capacity` samples.
    ///
    /// A capacity of zero or less falls back to [`DEFAULT_CAPACITY`].
    pub fn new(capacity: i64) -> Self {
        let capacity = if capacity <= 0 {
            DEFAULT_CAPACITY
        } else {
            capacity as usize
        };
        Self {
            slots: Vec::with_capacity(capacity),
            head: 0,
            len: 0,
            capacity,
        }
    }

    /// Append a sample, evicting the oldest one if the buffer is full.
    pub fn add(&mut self, timestamp: i64, value: f64) {
        let point = TimeSeriesPoint { timestamp, value };
        if self.slots.len() < self.capacity {
            // Still growing into the backing storage.
            self.slots.push(point);
            self.len += 1;
            return;
        }
        self.slots[self.head] = point;
        self.head = (self.head + 1) % self.capacity;
    }

    /// All stored samples, oldest first.
    pub fn get_all(&self) -> Vec<TimeSeriesPoint> {
        self.iter().collect()
    }

    /// The `n` most recent samples, oldest first.
    ///
    /// Returns an empty vector for `n <= 0` and everything available when
    /// `n` exceeds the current length.
    pub fn get_last(&self, n: i64) -> Vec<TimeSeriesPoint> {
        if n <= 0 {
            return Vec::new();
        }
        let take = (n as usize).min(self.len);
        self.iter().skip(self.len - take).collect()
    }

    /// Most recent sample, if any.
    pub fn latest(&self) -> Option<TimeSeriesPoint> {
        if self.len == 0 {
            return None;
        }
        Some(self.slots[(self.head + self.len - 1) % self.capacity])
    }

    /// Drop every sample. Capacity is unchanged.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.head = 0;
        self.len = 0;
    }

    /// Number of stored samples.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of samples.
    pub fn cap(&self) -> usize {
        self.capacity
    }

    fn iter(&self) -> impl Iterator<Item = TimeSeriesPoint> + '_ {
        (0..self.len).map(move |i| self.slots[(self.head + i) % self.capacity])
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY as i64)
    }
}
