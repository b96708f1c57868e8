//! Ordered, optionally bounded item container used by every discipline.

use std::collections::VecDeque;

#[derive(Debug, Clone)]
struct Entry<T> {
    key: u64,
    item: T,
}

/// FIFO queue with optional capacity and key-ordered insertion.
///
/// Insertion methods hand the item back in `Err` when the queue is full,
/// leaving the length unchanged. `len()` always equals
/// `admitted() - removed()`.
#[derive(Debug, Clone)]
pub struct Queue<T> {
    entries: VecDeque<Entry<T>>,
    capacity: Option<usize>,
    admitted: u64,
    removed: u64,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl<T> Queue<T> {
    /// Creates a queue without a capacity limit.
    pub fn unbounded() -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: None,
            admitted: 0,
            removed: 0,
        }
    }

    /// Creates a queue holding at most `capacity` items.
    pub fn bounded(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity: Some(capacity),
            admitted: 0,
            removed: 0,
        }
    }

    /// Current capacity limit.
    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Changes the capacity limit.
    ///
    /// Shrinking below the current length keeps the queued items; further
    /// insertions fail until the queue drains below the new limit.
    pub fn set_capacity(&mut self, capacity: Option<usize>) {
        self.capacity = capacity;
    }

    /// Whether another item would be rejected.
    pub fn is_full(&self) -> bool {
        self.capacity
            .is_some_and(|capacity| self.entries.len() >= capacity)
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total items ever admitted.
    pub fn admitted(&self) -> u64 {
        self.admitted
    }

    /// Total items ever removed.
    pub fn removed(&self) -> u64 {
        self.removed
    }

    /// Appends at the tail.
    ///
    /// # Errors
    ///
    /// Returns the item if the queue is full.
    pub fn enqueue(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.entries.push_back(Entry { key: 0, item });
        self.admitted += 1;
        Ok(())
    }

    /// Inserts at the head.
    ///
    /// # Errors
    ///
    /// Returns the item if the queue is full.
    pub fn enqueue_head(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.entries.push_front(Entry { key: 0, item });
        self.admitted += 1;
        Ok(())
    }

    /// Inserts keeping keys ascending; equal keys keep arrival order.
    ///
    /// The position is searched from the tail, so appending nearly-sorted
    /// keys costs O(1) amortized. Ordering is only meaningful when every
    /// entry was inserted through this method.
    ///
    /// # Errors
    ///
    /// Returns the item if the queue is full.
    pub fn enqueue_ordered(&mut self, item: T, key: u64) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        let position = self
            .entries
            .iter()
            .rposition(|entry| entry.key <= key)
            .map_or(0, |index| index + 1);
        self.entries.insert(position, Entry { key, item });
        self.admitted += 1;
        Ok(())
    }

    /// Removes the head item.
    pub fn dequeue(&mut self) -> Option<T> {
        let entry = self.entries.pop_front()?;
        self.removed += 1;
        Some(entry.item)
    }

    /// Removes the head item together with its ordering key.
    pub fn dequeue_keyed(&mut self) -> Option<(T, u64)> {
        let entry = self.entries.pop_front()?;
        self.removed += 1;
        Some((entry.item, entry.key))
    }

    /// Removes the tail item.
    pub fn dequeue_tail(&mut self) -> Option<T> {
        let entry = self.entries.pop_back()?;
        self.removed += 1;
        Some(entry.item)
    }

    /// Removes the first item matching `predicate`.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        let index = self.entries.iter().position(|entry| predicate(&entry.item))?;
        let entry = self.entries.remove(index)?;
        self.removed += 1;
        Some(entry.item)
    }

    /// Head item without removing it.
    pub fn peek_first(&self) -> Option<&T> {
        self.entries.front().map(|entry| &entry.item)
    }

    /// Tail item without removing it.
    pub fn peek_last(&self) -> Option<&T> {
        self.entries.back().map(|entry| &entry.item)
    }

    /// Ordering key of the head item.
    pub fn first_key(&self) -> Option<u64> {
        self.entries.front().map(|entry| entry.key)
    }

    /// Iterates head to tail.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|entry| &entry.item)
    }

    /// Iterates head to tail with mutable access.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.iter_mut().map(|entry| &mut entry.item)
    }

    /// Subtracts `delta` from every ordering key, saturating at zero.
    ///
    /// Order is preserved because the shift is uniform.
    pub fn shift_keys_down(&mut self, delta: u64) {
        for entry in &mut self.entries {
            entry.key = entry.key.saturating_sub(delta);
        }
    }

    /// Removes every item, head first.
    pub fn drain(&mut self) -> Vec<T> {
        self.removed += self.entries.len() as u64;
        self.entries.drain(..).map(|entry| entry.item).collect()
    }
}

impl<T: PartialEq> Queue<T> {
    /// Removes the first item equal to `item`; returns whether one was found.
    pub fn remove(&mut self, item: &T) -> bool {
        self.remove_where(|queued| queued == item).is_some()
    }

    /// Whether an equal item is queued.
    pub fn contains(&self, item: &T) -> bool {
        self.iter().any(|queued| queued == item)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_bounded_queue_rejects_when_full() {
        let mut queue = Queue::bounded(2);
        assert!(queue.enqueue(1).is_ok());
        assert!(queue.enqueue(2).is_ok());
        assert_eq!(queue.enqueue(3), Err(3));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.enqueue_head(0), Err(0));
        assert_eq!(queue.enqueue_ordered(9, 9), Err(9));
    }

    #[test]
    fn test_head_and_tail_operations() {
        let mut queue = Queue::unbounded();
        queue.enqueue(2).unwrap();
        queue.enqueue(3).unwrap();
        queue.enqueue_head(1).unwrap();

        assert_eq!(queue.peek_first(), Some(&1));
        assert_eq!(queue.peek_last(), Some(&3));
        assert_eq!(queue.dequeue_tail(), Some(3));
        assert_eq!(queue.dequeue(), Some(1));
        assert_eq!(queue.dequeue(), Some(2));
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn test_ordered_insertion_keeps_ties_fifo() {
        let mut queue = Queue::unbounded();
        queue.enqueue_ordered("c", 30).unwrap();
        queue.enqueue_ordered("a", 10).unwrap();
        queue.enqueue_ordered("b1", 20).unwrap();
        queue.enqueue_ordered("b2", 20).unwrap();
        queue.enqueue_ordered("d", 40).unwrap();

        let order: Vec<_> = queue.iter().copied().collect();
        assert_eq!(order, vec!["a", "b1", "b2", "c", "d"]);
        assert_eq!(queue.first_key(), Some(10));
    }

    #[test]
    fn test_shift_keys_preserves_order() {
        let mut queue = Queue::unbounded();
        queue.enqueue_ordered('x', 1_000).unwrap();
        queue.enqueue_ordered('y', 1_500).unwrap();
        queue.shift_keys_down(1_000);

        assert_eq!(queue.dequeue_keyed(), Some(('x', 0)));
        assert_eq!(queue.dequeue_keyed(), Some(('y', 500)));
    }

    #[test]
    fn test_remove_named_item() {
        let mut queue = Queue::unbounded();
        for value in [4, 5, 6] {
            queue.enqueue(value).unwrap();
        }
        assert!(queue.remove(&5));
        assert!(!queue.remove(&5));
        assert!(!queue.contains(&5));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.removed(), 1);
    }

    #[test]
    fn test_capacity_change_at_runtime() {
        let mut queue = Queue::bounded(3);
        for value in 0..3 {
            queue.enqueue(value).unwrap();
        }
        queue.set_capacity(Some(2));
        assert!(queue.is_full());
        assert_eq!(queue.len(), 3);

        queue.dequeue();
        queue.dequeue();
        assert!(queue.enqueue(7).is_ok());

        queue.set_capacity(None);
        assert!(!queue.is_full());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue(u8),
        EnqueueHead(u8),
        EnqueueOrdered(u8),
        Dequeue,
        DequeueTail,
        Remove(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<u8>().prop_map(Op::Enqueue),
            any::<u8>().prop_map(Op::EnqueueHead),
            any::<u8>().prop_map(Op::EnqueueOrdered),
            Just(Op::Dequeue),
            Just(Op::DequeueTail),
            any::<u8>().prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn prop_length_equals_admitted_minus_removed(
            capacity in 1usize..8,
            ops in prop::collection::vec(op_strategy(), 0..64),
        ) {
            let mut queue = Queue::bounded(capacity);
            for op in ops {
                let before = queue.len();
                match op {
                    Op::Enqueue(v) | Op::EnqueueHead(v) | Op::EnqueueOrdered(v) => {
                        let full = queue.is_full();
                        let result = match op {
                            Op::Enqueue(_) => queue.enqueue(v),
                            Op::EnqueueHead(_) => queue.enqueue_head(v),
                            _ => queue.enqueue_ordered(v, u64::from(v)),
                        };
                        prop_assert_eq!(result.is_err(), full);
                        if full {
                            prop_assert_eq!(queue.len(), before);
                        }
                    }
                    Op::Dequeue => { queue.dequeue(); }
                    Op::DequeueTail => { queue.dequeue_tail(); }
                    Op::Remove(v) => { queue.remove(&v); }
                }
                prop_assert!(queue.len() <= capacity);
                prop_assert_eq!(queue.len() as u64, queue.admitted() - queue.removed());
            }
        }
    }
}
