// Sliding Window - Fixed-capacity candle buffer with a running index
// The running index is the x-axis trendlines are fitted on

use std::collections::VecDeque;

/// FIFO of the most recent `capacity` items, each tagged with an absolute,
/// strictly increasing index. Single owner; eviction is the only removal.
#[derive(Debug, Clone)]
pub struct SlidingWindow<T> {
    capacity: usize,
    items: VecDeque<T>,
    indices: VecDeque<u64>,
    next_index: u64,
}

impl<T> SlidingWindow<T> {
    pub fn new(capacity: usize) -> Self {
        Self::starting_at(capacity, 0)
    }

    /// Window whose first appended item receives `first_index`
    pub fn starting_at(capacity: usize, first_index: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
            indices: VecDeque::with_capacity(capacity),
            next_index: first_index,
        }
    }

    /// Push to the tail, evicting the head past capacity. Returns the index assigned.
    pub fn append(&mut self, item: T) -> u64 {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
            self.indices.pop_front();
        }

        let index = self.next_index;
        self.items.push_back(item);
        self.indices.push_back(index);
        self.next_index += 1;
        index
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    /// Item at a window position (0 = oldest)
    pub fn get(&self, position: usize) -> Option<&T> {
        self.items.get(position)
    }

    /// Running index of the item at a window position
    pub fn index_at(&self, position: usize) -> Option<u64> {
        self.indices.get(position).copied()
    }

    /// Index the next appended item will receive
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn first(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// (running index, item) pairs, oldest first
    pub fn iter_indexed(&self) -> impl Iterator<Item = (u64, &T)> {
        self.indices.iter().copied().zip(self.items.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_operations() {
        let mut window: SlidingWindow<i32> = SlidingWindow::new(3);
        assert!(window.is_empty());

        assert_eq!(window.append(10), 0);
        assert_eq!(window.append(20), 1);
        assert_eq!(window.len(), 2);
        assert!(!window.is_full());
        assert_eq!(window.last(), Some(&20));
        assert_eq!(window.next_index(), 2);
    }

    #[test]
    fn test_fifo_eviction_and_contiguous_indices() {
        let mut window: SlidingWindow<i32> = SlidingWindow::new(4);
        for v in 0..10 {
            window.append(v);
            assert!(window.len() <= window.capacity());
        }

        assert!(window.is_full());
        assert_eq!(window.first(), Some(&6));
        let indices: Vec<u64> = window.iter_indexed().map(|(i, _)| i).collect();
        assert_eq!(indices, vec![6, 7, 8, 9]);
        assert!(indices.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(window.next_index(), 10);
    }

    #[test]
    fn test_starting_index() {
        let mut window: SlidingWindow<&str> = SlidingWindow::starting_at(2, 100);
        window.append("a");
        window.append("b");
        window.append("c");
        assert_eq!(window.index_at(0), Some(101));
        assert_eq!(window.get(1), Some(&"c"));
        assert_eq!(window.index_at(2), None);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut window: SlidingWindow<u8> = SlidingWindow::new(0);
        window.append(1);
        window.append(2);
        assert_eq!(window.capacity(), 1);
        assert_eq!(window.len(), 1);
        assert_eq!(window.first(), Some(&2));
    }
}
