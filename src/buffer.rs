//! # Recency Buffer
//!
//! Bounded, insertion-ordered store of the most recent measurements.
//!
//! [`RingBuffer`] is a fixed arena with a head index and a length, so a push
//! at capacity overwrites the oldest slot in O(1). [`RecencyBuffer`] wraps it
//! in a mutex for one writer (the acquisition loop) and any number of readers
//! (HTTP handlers). Every critical section is a single push or copy; no lock
//! is held across an await point or any I/O.

use std::sync::{Mutex, MutexGuard};

use crate::telemetry::Measurement;

/// Default number of measurements kept in memory
pub const DEFAULT_CAPACITY: usize = 1000;

/// Fixed-capacity FIFO ring
#[derive(Debug)]
pub struct RingBuffer<T> {
    slots: Vec<Option<T>>,
    /// Index of the oldest element
    head: usize,
    len: usize,
}

impl<T: Clone> RingBuffer<T> {
    /// Create an empty ring. A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            head: 0,
            len: 0,
        }
    }

    /// Append an item, returning the evicted oldest item when full
    pub fn push(&mut self, item: T) -> Option<T> {
        let capacity = self.slots.len();
        if self.len == capacity {
            let evicted = self.slots[self.head].replace(item);
            self.head = (self.head + 1) % capacity;
            evicted
        } else {
            let tail = (self.head + self.len) % capacity;
            self.slots[tail] = Some(item);
            self.len += 1;
            None
        }
    }

    /// Copy of the last `limit` items in arrival order
    ///
    /// `limit` is clamped to the current length.
    pub fn snapshot(&self, limit: usize) -> Vec<T> {
        let capacity = self.slots.len();
        let count = limit.min(self.len);
        let start = self.len - count;

        (start..self.len)
            .filter_map(|i| self.slots[(self.head + i) % capacity].clone())
            .collect()
    }

    /// Most recently pushed item
    pub fn last(&self) -> Option<&T> {
        if self.len == 0 {
            return None;
        }
        let index = (self.head + self.len - 1) % self.slots.len();
        self.slots[index].as_ref()
    }

    /// Current number of items
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the ring holds no items
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of items held
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

/// Shared recency buffer of measurements
#[derive(Debug)]
pub struct RecencyBuffer {
    inner: Mutex<RingBuffer<Measurement>>,
}

impl Default for RecencyBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl RecencyBuffer {
    /// Create an empty buffer holding at most `capacity` measurements
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(RingBuffer::new(capacity)),
        }
    }

    // A panic while holding the lock cannot leave the ring half-updated,
    // so a poisoned guard is safe to reuse.
    fn lock(&self) -> MutexGuard<'_, RingBuffer<Measurement>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a measurement, evicting the oldest if at capacity
    pub fn push(&self, measurement: Measurement) {
        self.lock().push(measurement);
    }

    /// The last `limit` measurements in arrival order
    pub fn snapshot(&self, limit: usize) -> Vec<Measurement> {
        self.lock().snapshot(limit)
    }

    /// The last `limit` measurements together with the total buffered,
    /// read under one lock so the two agree
    pub fn window(&self, limit: usize) -> (Vec<Measurement>, usize) {
        let ring = self.lock();
        (ring.snapshot(limit), ring.len())
    }

    /// Newest measurement, if any
    pub fn latest(&self) -> Option<Measurement> {
        self.lock().last().cloned()
    }

    /// Number of buffered measurements
    pub fn size(&self) -> usize {
        self.lock().len()
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.lock().capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::Sample;
    use chrono::Utc;
    use std::sync::Arc;

    fn measurement(time_s: f64) -> Measurement {
        Measurement::new(
            Sample {
                time_s,
                phase: 0,
                pwm_left: 0,
                pwm_right: 0,
                speed_1: 0.0,
                speed_2: 0.0,
                angle_x: 0.0,
                gyro_y: 0.0,
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut ring = RingBuffer::new(3);
        assert_eq!(ring.push('A'), None);
        assert_eq!(ring.push('B'), None);
        assert_eq!(ring.push('C'), None);
        assert_eq!(ring.push('D'), Some('A'));

        assert_eq!(ring.snapshot(10), vec!['B', 'C', 'D']);
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_ring_snapshot_limit() {
        let mut ring = RingBuffer::new(5);
        for i in 0..8 {
            ring.push(i);
        }

        assert_eq!(ring.snapshot(2), vec![6, 7]);
        assert_eq!(ring.snapshot(5), vec![3, 4, 5, 6, 7]);
        assert_eq!(ring.snapshot(0), Vec::<i32>::new());
    }

    #[test]
    fn test_ring_partial_fill() {
        let mut ring = RingBuffer::new(4);
        ring.push(1);
        ring.push(2);

        assert_eq!(ring.snapshot(100), vec![1, 2]);
        assert_eq!(ring.last(), Some(&2));
        assert!(!ring.is_empty());
    }

    #[test]
    fn test_ring_empty() {
        let ring: RingBuffer<u8> = RingBuffer::new(4);
        assert!(ring.is_empty());
        assert_eq!(ring.last(), None);
        assert!(ring.snapshot(4).is_empty());
    }

    #[test]
    fn test_ring_zero_capacity_holds_one() {
        let mut ring = RingBuffer::new(0);
        assert_eq!(ring.capacity(), 1);
        ring.push(1);
        assert_eq!(ring.push(2), Some(1));
        assert_eq!(ring.snapshot(5), vec![2]);
    }

    #[test]
    fn test_ring_wraps_many_times() {
        let mut ring = RingBuffer::new(3);
        for i in 0..1000 {
            ring.push(i);
        }
        assert_eq!(ring.snapshot(3), vec![997, 998, 999]);
        assert_eq!(ring.last(), Some(&999));
    }

    #[test]
    fn test_recency_buffer_overflow() {
        let buffer = RecencyBuffer::new(3);
        for t in [1.0, 2.0, 3.0, 4.0] {
            buffer.push(measurement(t));
        }

        let times: Vec<f64> = buffer
            .snapshot(10)
            .iter()
            .map(|m| m.sample().time_s)
            .collect();
        assert_eq!(times, vec![2.0, 3.0, 4.0]);
        assert_eq!(buffer.size(), 3);
        assert_eq!(buffer.capacity(), 3);
        assert_eq!(buffer.latest().map(|m| m.sample().time_s), Some(4.0));
    }

    #[test]
    fn test_default_capacity() {
        let buffer = RecencyBuffer::default();
        assert_eq!(buffer.capacity(), DEFAULT_CAPACITY);
        assert_eq!(buffer.size(), 0);
        assert!(buffer.latest().is_none());
    }

    #[test]
    fn test_concurrent_readers_see_ordered_snapshots() {
        let buffer = Arc::new(RecencyBuffer::new(50));

        let writer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for i in 0..2000 {
                    buffer.push(measurement(i as f64));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let snap = buffer.snapshot(50);
                        assert!(snap.len() <= 50);
                        for pair in snap.windows(2) {
                            assert!(pair[0].sample().time_s < pair[1].sample().time_s);
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }

        assert_eq!(buffer.latest().map(|m| m.sample().time_s), Some(1999.0));
    }

    #[test]
    fn test_window_count_matches_data_under_concurrent_pushes() {
        let buffer = Arc::new(RecencyBuffer::new(100));

        let writer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for i in 0..2000 {
                    buffer.push(measurement(i as f64));
                }
            })
        };

        for _ in 0..500 {
            let (data, count) = buffer.window(20);
            assert_eq!(data.len(), count.min(20));
            assert!(count <= 100);
        }

        writer.join().unwrap();
        let (data, count) = buffer.window(usize::MAX);
        assert_eq!(count, 100);
        assert_eq!(data.len(), 100);
    }
}
