//! A thread-safe bounded priority queue that keeps the top-`capacity` items.
//!
//! Used by the reporters to retain the N most interesting spans between
//! emission ticks without unbounded growth: once full, an incoming item
//! either replaces the current minimum (if it ranks higher) or is dropped,
//! and either way the drop counter advances so the next report can state how
//! many candidates were seen in total.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use parking_lot::Mutex;

/// Fixed-capacity concurrent min-heap with a drop-smallest overflow policy.
#[derive(Debug)]
pub struct ConcurrentFixedQueue<T: Ord> {
    inner: Mutex<Inner<T>>,
    capacity: usize,
}

#[derive(Debug)]
struct Inner<T: Ord> {
    // Reverse turns std's max-heap into the min-heap we need: the root is
    // always the smallest retained item, i.e. the eviction candidate.
    heap: BinaryHeap<Reverse<T>>,
    dropped: usize,
}

impl<T: Ord> ConcurrentFixedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        ConcurrentFixedQueue {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::with_capacity(capacity),
                dropped: 0,
            }),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().heap.is_empty()
    }

    /// Insert `item`, retaining only the top-`capacity` items seen so far.
    ///
    /// When the queue is full the drop counter advances and `item` replaces
    /// the current minimum only if it ranks strictly higher.
    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock();
        if inner.heap.len() < self.capacity {
            inner.heap.push(Reverse(item));
            return;
        }
        inner.dropped += 1;
        if let Some(min) = inner.heap.peek() {
            if item > min.0 {
                inner.heap.pop();
                inner.heap.push(Reverse(item));
            }
        }
    }

    /// Atomically swap out the contents, returning the retained items sorted
    /// high-to-low along with the number of items dropped since the last
    /// steal.
    pub fn steal_data(&self) -> (Vec<T>, usize) {
        let (heap, dropped) = {
            let mut inner = self.inner.lock();
            let heap = std::mem::take(&mut inner.heap);
            let dropped = std::mem::replace(&mut inner.dropped, 0);
            (heap, dropped)
        };
        let mut items: Vec<T> = heap.into_iter().map(|Reverse(item)| item).collect();
        items.sort_by(|a, b| b.cmp(a));
        (items, dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_top_items_and_counts_drops() {
        let queue = ConcurrentFixedQueue::new(4);
        for duration in [200u64, 100, 400, 300, 600, 500] {
            queue.push(duration);
        }
        assert_eq!(queue.len(), 4);

        let (items, dropped) = queue.steal_data();
        assert_eq!(items, vec![600, 500, 400, 300]);
        assert_eq!(dropped, 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn steal_resets_drop_counter() {
        let queue = ConcurrentFixedQueue::new(1);
        queue.push(1u64);
        queue.push(2);
        queue.push(3);
        let (items, dropped) = queue.steal_data();
        assert_eq!(items, vec![3]);
        assert_eq!(dropped, 2);

        queue.push(7);
        let (items, dropped) = queue.steal_data();
        assert_eq!(items, vec![7]);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn smaller_item_on_overflow_is_dropped_whole() {
        let queue = ConcurrentFixedQueue::new(2);
        queue.push(10u64);
        queue.push(20);
        queue.push(5);
        let (items, dropped) = queue.steal_data();
        assert_eq!(items, vec![20, 10]);
        assert_eq!(dropped, 1);
    }

    proptest::proptest! {
        #[test]
        fn retains_exactly_the_top_capacity_items(
            mut items in proptest::collection::vec(0u64..1_000, 0..64),
            capacity in 1usize..16,
        ) {
            let queue = ConcurrentFixedQueue::new(capacity);
            for item in &items {
                queue.push(*item);
            }
            let (kept, dropped) = queue.steal_data();

            items.sort_unstable_by(|a, b| b.cmp(a));
            let expected: Vec<u64> = items.iter().copied().take(capacity).collect();
            proptest::prop_assert_eq!(kept, expected);
            proptest::prop_assert_eq!(dropped, items.len().saturating_sub(capacity));
        }
    }

    #[test]
    fn concurrent_pushes_never_exceed_capacity() {
        use std::sync::Arc;

        let queue = Arc::new(ConcurrentFixedQueue::new(8));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..1000u64 {
                        queue.push(t * 1000 + i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let (items, dropped) = queue.steal_data();
        assert_eq!(items.len(), 8);
        assert_eq!(dropped, 4000 - 8);
        // Highest values across all threads survive.
        assert_eq!(items[0], 3999);
    }
}
