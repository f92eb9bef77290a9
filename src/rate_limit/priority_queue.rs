//! Bounded priority queue backed by a slot arena.
//!
//! The heap holds small keys; entries live in `slots` and are moved out
//! exactly once, by pop or by [`PriorityQueue::remove`]. Ties on priority
//! are broken by insertion order.
//!
//! A removed entry leaves its key behind in the heap. The slot stays
//! reserved until that key is discarded, so a dead key never points at a
//! newer entry, and the heap's top key is always live.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::time::Instant;
use uuid::Uuid;

use super::Priority;

#[derive(Debug)]
pub struct QueueEntry<T> {
    pub request_id: Uuid,
    pub priority: Priority,
    pub enqueued_at: Instant,
    pub expires_at: Option<Instant>,
    pub value: T,
}

impl<T> QueueEntry<T> {
    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Key {
    priority: Priority,
    seq: u64,
    slot: usize,
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
pub struct PriorityQueue<T> {
    slots: Vec<Option<QueueEntry<T>>>,
    free: Vec<usize>,
    heap: BinaryHeap<Key>,
    index: HashMap<Uuid, usize>,
    live: usize,
    next_seq: u64,
    capacity: usize,
}

impl<T> PriorityQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            heap: BinaryHeap::new(),
            index: HashMap::new(),
            live: 0,
            next_seq: 0,
            capacity,
        }
    }

    /// Enqueue `value`. Hands the value back when the queue is full.
    pub fn push(
        &mut self,
        priority: Priority,
        expires_at: Option<Instant>,
        value: T,
    ) -> Result<Uuid, T> {
        if self.len() >= self.capacity {
            return Err(value);
        }

        let request_id = Uuid::new_v4();
        let entry = QueueEntry {
            request_id,
            priority,
            enqueued_at: Instant::now(),
            expires_at,
            value,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Key { priority, seq, slot });
        self.index.insert(request_id, slot);
        self.live += 1;
        Ok(request_id)
    }

    pub fn peek(&self) -> Option<&QueueEntry<T>> {
        self.heap
            .peek()
            .and_then(|key| self.slots.get(key.slot))
            .and_then(Option::as_ref)
    }

    pub fn pop(&mut self) -> Option<QueueEntry<T>> {
        let key = self.heap.pop()?;
        let entry = self.slots.get_mut(key.slot).and_then(Option::take);
        self.free.push(key.slot);
        if let Some(entry) = &entry {
            self.index.remove(&entry.request_id);
            self.live -= 1;
        }
        self.prune_head();
        entry
    }

    /// Take out the entry with `request_id`, wherever it sits.
    /// `None` if it was already popped or removed.
    pub fn remove(&mut self, request_id: &Uuid) -> Option<QueueEntry<T>> {
        let slot = self.index.remove(request_id)?;
        let entry = self.slots.get_mut(slot).and_then(Option::take)?;
        self.live -= 1;
        self.prune_head();
        if self.heap.len() > self.capacity.saturating_mul(2).max(16) {
            self.compact();
        }
        Some(entry)
    }

    fn is_live(&self, slot: usize) -> bool {
        matches!(self.slots.get(slot), Some(Some(_)))
    }

    /// Drop dead keys from the top of the heap.
    fn prune_head(&mut self) {
        while let Some(slot) = self.heap.peek().map(|key| key.slot) {
            if self.is_live(slot) {
                break;
            }
            self.heap.pop();
            self.free.push(slot);
        }
    }

    /// Drop every dead key and release its slot.
    fn compact(&mut self) {
        let slots = &self.slots;
        let free = &mut self.free;
        self.heap.retain(|key| {
            let live = matches!(slots.get(key.slot), Some(Some(_)));
            if !live {
                free.push(key.slot);
            }
            live
        });
    }

    /// Pop head entries that are past their deadline or that `is_dead`
    /// rejects, stopping at the first live one.
    pub fn discard_stale<F>(&mut self, now: Instant, is_dead: F) -> Vec<QueueEntry<T>>
    where
        F: Fn(&T) -> bool,
    {
        let mut discarded = Vec::new();
        while let Some(head) = self.peek() {
            if !(head.is_expired(now) || is_dead(&head.value)) {
                break;
            }
            match self.pop() {
                Some(entry) => discarded.push(entry),
                None => break,
            }
        }
        discarded
    }

    /// Remove every entry in service order.
    pub fn drain(&mut self) -> Vec<QueueEntry<T>> {
        let mut drained = Vec::with_capacity(self.len());
        while let Some(entry) = self.pop() {
            drained.push(entry);
        }
        self.heap.clear();
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        drained
    }

    /// Entries still waiting; removed entries do not count.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_priority_then_fifo() {
        let mut q = PriorityQueue::new(10);
        q.push(Priority::Low, None, "low").unwrap();
        q.push(Priority::High, None, "high-1").unwrap();
        q.push(Priority::Normal, None, "normal").unwrap();
        q.push(Priority::High, None, "high-2").unwrap();
        q.push(Priority::Critical, None, "critical").unwrap();

        let order: Vec<_> = q.drain().into_iter().map(|e| e.value).collect();
        assert_eq!(order, vec!["critical", "high-1", "high-2", "normal", "low"]);
    }

    #[test]
    fn test_capacity_and_slot_reuse() {
        let mut q = PriorityQueue::new(2);
        q.push(Priority::Normal, None, 1).unwrap();
        q.push(Priority::Normal, None, 2).unwrap();
        assert_eq!(q.push(Priority::Critical, None, 3), Err(3));

        assert_eq!(q.pop().map(|e| e.value), Some(1));
        q.push(Priority::Normal, None, 4).unwrap();
        assert_eq!(q.slots.len(), 2);
        assert_eq!(q.pop().map(|e| e.value), Some(2));
        assert_eq!(q.pop().map(|e| e.value), Some(4));
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_remove_frees_capacity_behind_the_head() {
        let mut q = PriorityQueue::new(2);
        q.push(Priority::Critical, None, "critical").unwrap();
        let low = q.push(Priority::Low, None, "low").unwrap();
        assert_eq!(q.push(Priority::Normal, None, "normal"), Err("normal"));

        assert_eq!(q.remove(&low).map(|e| e.value), Some("low"));
        assert!(q.remove(&low).is_none());
        assert_eq!(q.len(), 1);
        q.push(Priority::Normal, None, "normal").unwrap();

        // The removed entry's slot is not reused while its key is still queued.
        assert_eq!(q.slots.len(), 3);
        let order: Vec<_> = q.drain().into_iter().map(|e| e.value).collect();
        assert_eq!(order, vec!["critical", "normal"]);
    }

    #[test]
    fn test_removed_head_is_skipped() {
        let mut q = PriorityQueue::new(4);
        let high = q.push(Priority::High, None, 1).unwrap();
        q.push(Priority::Low, None, 2).unwrap();
        q.remove(&high).unwrap();

        assert_eq!(q.peek().map(|e| e.value), Some(2));
        assert_eq!(q.pop().map(|e| e.value), Some(2));
        assert!(q.is_empty());
        assert!(q.heap.is_empty());
    }

    #[test]
    fn test_discard_stale_stops_at_live_head() {
        let now = Instant::now();
        let mut q = PriorityQueue::new(10);
        q.push(Priority::High, Some(now - Duration::from_millis(1)), "expired").unwrap();
        q.push(Priority::Normal, None, "dead").unwrap();
        q.push(Priority::Low, None, "live").unwrap();
        q.push(Priority::Low, Some(now - Duration::from_millis(1)), "expired-behind").unwrap();

        let dropped: Vec<_> = q
            .discard_stale(now, |v| *v == "dead")
            .into_iter()
            .map(|e| e.value)
            .collect();
        assert_eq!(dropped, vec!["expired", "dead"]);
        assert_eq!(q.peek().map(|e| e.value), Some("live"));
        assert_eq!(q.len(), 2);
    }
}
