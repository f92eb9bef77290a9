//! Bounded ring buffer used for sliding-window statistics.

use std::collections::VecDeque;
use std::time::Duration;

/// Fixed-capacity FIFO buffer. Pushing into a full buffer evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    /// Create a buffer holding at most `capacity` items (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }
}

impl RingBuffer<bool> {
    /// Fraction of entries equal to `value`, or `None` when empty.
    pub fn ratio_of(&self, value: bool) -> Option<f64> {
        if self.items.is_empty() {
            return None;
        }
        let matching = self.items.iter().filter(|v| **v == value).count();
        Some(matching as f64 / self.items.len() as f64)
    }
}

impl RingBuffer<Duration> {
    /// Mean of the recorded durations, or `None` when empty.
    pub fn mean(&self) -> Option<Duration> {
        if self.items.is_empty() {
            return None;
        }
        let total: Duration = self.items.iter().sum();
        Some(total / self.items.len() as u32)
    }

    /// Fraction of durations strictly above `threshold`.
    pub fn ratio_above(&self, threshold: Duration) -> Option<f64> {
        if self.items.is_empty() {
            return None;
        }
        let slow = self.items.iter().filter(|d| **d > threshold).count();
        Some(slow as f64 / self.items.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_oldest() {
        let mut buf = RingBuffer::new(3);
        for i in 0..5 {
            buf.push(i);
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn test_ratios() {
        let mut outcomes = RingBuffer::new(4);
        assert_eq!(outcomes.ratio_of(false), None);
        outcomes.push(true);
        outcomes.push(false);
        outcomes.push(false);
        outcomes.push(true);
        assert_eq!(outcomes.ratio_of(false), Some(0.5));

        let mut durations = RingBuffer::new(4);
        durations.push(Duration::from_millis(10));
        durations.push(Duration::from_millis(30));
        assert_eq!(durations.mean(), Some(Duration::from_millis(20)));
        assert_eq!(durations.ratio_above(Duration::from_millis(20)), Some(0.5));
    }
}
