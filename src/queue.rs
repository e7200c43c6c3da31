//! Growable ring-buffer FIFO used as the executor's pending and active queues.
//!
//! Slots are `Option<T>` so a dequeued slot drops its reference immediately.
//! Logical index `i` lives at physical slot `(head + i) % capacity`.

use std::fmt;
use std::iter::FusedIterator;

use crate::error::QueueError;

/// Capacity used for the first allocation of an empty queue.
const DEFAULT_CAPACITY: usize = 4;

/// Smallest absolute growth step.
const MIN_GROW: usize = 4;

/// Resizable circular FIFO queue.
pub struct CircularQueue<T> {
    items: Vec<Option<T>>,
    head: usize,
    tail: usize,
    count: usize,
    version: u64,
}

impl<T> CircularQueue<T> {
    /// Create an empty queue without allocating.
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            head: 0,
            tail: 0,
            count: 0,
            version: 0,
        }
    }

    /// Create an empty queue with room for `capacity` items.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut queue = Self::new();
        queue.items = Self::empty_slots(capacity);
        queue
    }

    /// Number of live items.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of slots in the backing storage.
    pub fn capacity(&self) -> usize {
        self.items.len()
    }

    /// Mutation counter, bumped by every structural change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Append an item at the tail, growing the backing storage if full.
    pub fn enqueue(&mut self, item: T) {
        if self.count == self.items.len() {
            self.grow();
        }
        self.items[self.tail] = Some(item);
        self.tail = (self.tail + 1) % self.items.len();
        self.count += 1;
        self.version = self.version.wrapping_add(1);
    }

    /// Remove and return the head item.
    pub fn dequeue(&mut self) -> Result<T, QueueError> {
        self.try_dequeue().ok_or(QueueError::Empty)
    }

    /// Remove and return the head item, or `None` when empty.
    pub fn try_dequeue(&mut self) -> Option<T> {
        if self.count == 0 {
            return None;
        }
        let item = self.items[self.head].take();
        self.head = (self.head + 1) % self.items.len();
        self.count -= 1;
        self.version = self.version.wrapping_add(1);
        item
    }

    /// The head item without removing it.
    pub fn peek(&self) -> Result<&T, QueueError> {
        self.at(0).map_err(|_| QueueError::Empty)
    }

    /// The tail item without removing it.
    pub fn peek_back(&self) -> Result<&T, QueueError> {
        self.at_from_end(0).map_err(|_| QueueError::Empty)
    }

    /// Item `index` positions from the head.
    pub fn at(&self, index: usize) -> Result<&T, QueueError> {
        let slot = self.physical(index)?;
        self.items[slot]
            .as_ref()
            .ok_or(QueueError::IndexOutOfRange {
                index,
                len: self.count,
            })
    }

    /// Mutable access to the item `index` positions from the head.
    pub fn at_mut(&mut self, index: usize) -> Result<&mut T, QueueError> {
        let slot = self.physical(index)?;
        let len = self.count;
        self.items[slot]
            .as_mut()
            .ok_or(QueueError::IndexOutOfRange { index, len })
    }

    /// Item `index` positions back from the tail; `0` is the most recently enqueued.
    pub fn at_from_end(&self, index: usize) -> Result<&T, QueueError> {
        if index >= self.count {
            return Err(QueueError::IndexOutOfRange {
                index,
                len: self.count,
            });
        }
        self.at(self.count - 1 - index)
    }

    /// Linear copy of the live items in head-to-tail order.
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.iter().cloned().collect()
    }

    /// Shrink the backing storage to exactly `len()` slots.
    pub fn trim_excess(&mut self) {
        if self.items.len() != self.count {
            self.resize(self.count);
        }
    }

    /// Drop every live item and reset the indices. Capacity is kept.
    pub fn clear(&mut self) {
        for i in 0..self.count {
            let slot = (self.head + i) % self.items.len();
            self.items[slot] = None;
        }
        self.head = 0;
        self.tail = 0;
        self.count = 0;
        self.version = self.version.wrapping_add(1);
    }

    /// Move every item of `other` onto the tail of `self`, leaving `other` empty.
    ///
    /// When `self` is empty the two buffers are swapped instead of copied.
    pub fn append(&mut self, other: &mut CircularQueue<T>) {
        if other.is_empty() {
            return;
        }
        if self.is_empty() && other.capacity() >= self.capacity() {
            std::mem::swap(self, other);
            self.version = self.version.wrapping_add(1);
            other.version = other.version.wrapping_add(1);
            return;
        }
        while let Some(item) = other.try_dequeue() {
            self.enqueue(item);
        }
    }

    /// Front-to-back iterator.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            queue: self,
            front: 0,
            back: self.count,
        }
    }

    fn physical(&self, index: usize) -> Result<usize, QueueError> {
        if index >= self.count {
            return Err(QueueError::IndexOutOfRange {
                index,
                len: self.count,
            });
        }
        Ok((self.head + index) % self.items.len())
    }

    fn grow(&mut self) {
        let capacity = self.items.len();
        let new_capacity = if capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            (capacity * 2).max(capacity + MIN_GROW)
        };
        self.resize(new_capacity);
    }

    fn resize(&mut self, new_capacity: usize) {
        debug_assert!(new_capacity >= self.count);
        let mut items = Self::empty_slots(new_capacity);
        for (i, slot) in items.iter_mut().enumerate().take(self.count) {
            let from = (self.head + i) % self.items.len();
            *slot = self.items[from].take();
        }
        self.items = items;
        self.head = 0;
        self.tail = if new_capacity == 0 {
            0
        } else {
            self.count % new_capacity
        };
        self.version = self.version.wrapping_add(1);
    }

    fn empty_slots(capacity: usize) -> Vec<Option<T>> {
        let mut items = Vec::with_capacity(capacity);
        items.resize_with(capacity, || None);
        items
    }
}

impl<T> Default for CircularQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Clone for CircularQueue<T> {
    fn clone(&self) -> Self {
        let mut queue = Self::with_capacity(self.count);
        queue.extend(self.iter().cloned());
        queue
    }
}

impl<T: fmt::Debug> fmt::Debug for CircularQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T> Extend<T> for CircularQueue<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for item in iter {
            self.enqueue(item);
        }
    }
}

impl<T> FromIterator<T> for CircularQueue<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let iter = iter.into_iter();
        let mut queue = Self::with_capacity(iter.size_hint().0);
        queue.extend(iter);
        queue
    }
}

/// Borrowing iterator over a [`CircularQueue`].
pub struct Iter<'a, T> {
    queue: &'a CircularQueue<T>,
    front: usize,
    back: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        if self.front == self.back {
            return None;
        }
        let item = self.queue.at(self.front).ok();
        self.front += 1;
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.back - self.front;
        (remaining, Some(remaining))
    }
}

impl<T> DoubleEndedIterator for Iter<'_, T> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.front == self.back {
            return None;
        }
        self.back -= 1;
        self.queue.at(self.back).ok()
    }
}

impl<T> ExactSizeIterator for Iter<'_, T> {}
impl<T> FusedIterator for Iter<'_, T> {}

impl<'a, T> IntoIterator for &'a CircularQueue<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Owning iterator that dequeues from the head.
pub struct IntoIter<T>(CircularQueue<T>);

impl<T> Iterator for IntoIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.0.try_dequeue()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.0.len(), Some(self.0.len()))
    }
}

impl<T> ExactSizeIterator for IntoIter<T> {}

impl<T> IntoIterator for CircularQueue<T> {
    type Item = T;
    type IntoIter = IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        IntoIter(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Queue whose head sits in the middle of the buffer so the live range wraps.
    fn wrapped_queue() -> CircularQueue<u32> {
        let mut queue = CircularQueue::with_capacity(4);
        queue.extend([0, 1, 2, 3]);
        assert_eq!(queue.dequeue().unwrap(), 0);
        assert_eq!(queue.dequeue().unwrap(), 1);
        queue.enqueue(4);
        queue.enqueue(5);
        assert_eq!(queue.capacity(), 4);
        queue
    }

    #[test]
    fn fifo_order() {
        let mut queue = CircularQueue::new();
        for i in 0..10 {
            queue.enqueue(i);
        }
        let drained: Vec<_> = std::iter::from_fn(|| queue.try_dequeue()).collect();
        assert_eq!(drained, (0..10).collect::<Vec<_>>());
        assert!(queue.is_empty());
    }

    #[test]
    fn empty_queue_errors() {
        let mut queue: CircularQueue<u8> = CircularQueue::new();
        assert_eq!(queue.dequeue(), Err(QueueError::Empty));
        assert_eq!(queue.peek(), Err(QueueError::Empty));
        assert_eq!(queue.peek_back(), Err(QueueError::Empty));
        assert!(queue.try_dequeue().is_none());
        assert_eq!(queue.capacity(), 0);
    }

    #[test]
    fn first_enqueue_allocates_default_capacity() {
        let mut queue = CircularQueue::new();
        queue.enqueue('a');
        assert_eq!(queue.capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn growth_past_capacity_happens_once_and_keeps_order() {
        let capacity = 8;
        let mut queue = CircularQueue::with_capacity(capacity);
        for i in 0..capacity {
            queue.enqueue(i);
        }
        assert_eq!(queue.capacity(), capacity);

        queue.enqueue(capacity);
        assert_eq!(queue.capacity(), capacity * 2);
        assert_eq!(queue.to_vec(), (0..=capacity).collect::<Vec<_>>());
    }

    #[test]
    fn small_capacity_uses_minimum_increment() {
        let mut queue = CircularQueue::with_capacity(1);
        queue.enqueue(1);
        queue.enqueue(2);
        assert_eq!(queue.capacity(), 1 + MIN_GROW);
    }

    #[test]
    fn growth_while_wrapped_rebases_head() {
        let mut queue = wrapped_queue();
        queue.enqueue(6);
        assert_eq!(queue.capacity(), 8);
        assert_eq!(queue.to_vec(), vec![2, 3, 4, 5, 6]);
        assert_eq!(queue.peek(), Ok(&2));
        assert_eq!(queue.peek_back(), Ok(&6));
    }

    #[test]
    fn indexed_access_from_both_ends() {
        let queue = wrapped_queue();
        assert_eq!(queue.at(0), Ok(&2));
        assert_eq!(queue.at(3), Ok(&5));
        assert_eq!(queue.at_from_end(0), Ok(&5));
        assert_eq!(queue.at_from_end(3), Ok(&2));
        assert_eq!(
            queue.at(4),
            Err(QueueError::IndexOutOfRange { index: 4, len: 4 })
        );
        assert_eq!(
            queue.at_from_end(7),
            Err(QueueError::IndexOutOfRange { index: 7, len: 4 })
        );
    }

    #[test]
    fn at_mut_updates_in_place() {
        let mut queue = wrapped_queue();
        *queue.at_mut(1).unwrap() = 30;
        assert_eq!(queue.to_vec(), vec![2, 30, 4, 5]);
    }

    #[test]
    fn trim_excess_shrinks_to_len() {
        let mut queue = wrapped_queue();
        queue.enqueue(6);
        assert_eq!(queue.capacity(), 8);
        queue.trim_excess();
        assert_eq!(queue.capacity(), 5);
        assert_eq!(queue.to_vec(), vec![2, 3, 4, 5, 6]);

        // Full after trimming, so the next enqueue must grow again.
        queue.enqueue(7);
        assert_eq!(queue.capacity(), 10);
        assert_eq!(queue.to_vec(), vec![2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn trim_excess_on_empty_releases_storage() {
        let mut queue: CircularQueue<u8> = CircularQueue::with_capacity(16);
        queue.trim_excess();
        assert_eq!(queue.capacity(), 0);
        queue.enqueue(1);
        assert_eq!(queue.dequeue(), Ok(1));
    }

    #[test]
    fn clear_drops_references() {
        use std::rc::Rc;

        let shared = Rc::new(());
        let mut queue = CircularQueue::new();
        for _ in 0..3 {
            queue.enqueue(Rc::clone(&shared));
        }
        assert_eq!(Rc::strong_count(&shared), 4);
        queue.clear();
        assert_eq!(Rc::strong_count(&shared), 1);
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), 4);
    }

    #[test]
    fn dequeue_drops_slot_reference() {
        use std::rc::Rc;

        let shared = Rc::new(());
        let mut queue = CircularQueue::new();
        queue.enqueue(Rc::clone(&shared));
        drop(queue.dequeue().unwrap());
        assert_eq!(Rc::strong_count(&shared), 1);
    }

    #[test]
    fn version_tracks_mutations() {
        let mut queue = CircularQueue::new();
        let v0 = queue.version();
        queue.enqueue(1);
        let v1 = queue.version();
        assert_ne!(v0, v1);
        let _ = queue.peek();
        let _ = queue.at(0);
        assert_eq!(queue.version(), v1);
        queue.dequeue().unwrap();
        assert_ne!(queue.version(), v1);
    }

    #[test]
    fn append_swaps_into_empty_queue() {
        let mut active: CircularQueue<u32> = CircularQueue::new();
        let mut inbox: CircularQueue<u32> = (0..5).collect();
        active.append(&mut inbox);
        assert!(inbox.is_empty());
        assert_eq!(active.to_vec(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn append_moves_onto_tail() {
        let mut active = wrapped_queue();
        let mut inbox: CircularQueue<u32> = (10..13).collect();
        active.append(&mut inbox);
        assert!(inbox.is_empty());
        assert_eq!(active.to_vec(), vec![2, 3, 4, 5, 10, 11, 12]);
    }

    #[test]
    fn iterators() {
        let queue = wrapped_queue();
        assert_eq!(queue.iter().len(), 4);
        assert_eq!(queue.iter().rev().copied().collect::<Vec<_>>(), vec![5, 4, 3, 2]);
        assert_eq!((&queue).into_iter().count(), 4);
        assert_eq!(format!("{queue:?}"), "[2, 3, 4, 5]");

        let cloned = queue.clone();
        assert_eq!(cloned.capacity(), 4);
        assert_eq!(cloned.into_iter().collect::<Vec<_>>(), vec![2, 3, 4, 5]);
    }
}
