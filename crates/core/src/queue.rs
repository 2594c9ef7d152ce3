//! Bounded, thread-safe producer/consumer queue.
//!
//! One instance per metadata sink. Producers never block by default:
//! a full queue returns the item back to the caller (drop-newest) rather
//! than waiting. Consumers block on an "item added" condition; the
//! blocking wait is bounded by a poll interval so callers can check a
//! cancellation flag between waits without real thread-cancellation
//! primitives.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Default ring capacity used by each metadata sink queue.
pub const DEFAULT_CAPACITY: usize = 500;

struct State<T> {
    items: VecDeque<T>,
}

/// A fixed-capacity FIFO queue shared between one producer-side fan-out
/// call and one consumer worker thread.
pub struct BoundedQueue<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    item_added: Condvar,
    item_removed: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
            }),
            item_added: Condvar::new(),
            item_removed: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current occupancy. Always in `[0, capacity]`.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert an item.
    ///
    /// When `block` is `false` (the path every publisher in this crate
    /// uses) a full queue returns the item back to the caller immediately
    /// rather than waiting — a full sink queue must never stall the
    /// request path. When `block` is `true`, waits for room, released by
    /// consumers signalling `item_removed`.
    pub fn add_item(&self, item: T, block: bool) -> Result<(), T> {
        let mut guard = self.state.lock();
        if !block && guard.items.len() >= self.capacity {
            return Err(item);
        }
        while guard.items.len() >= self.capacity {
            self.item_removed.wait(&mut guard);
        }
        guard.items.push_back(item);
        self.item_added.notify_one();
        Ok(())
    }

    /// Block until an item is available, then remove and return it.
    pub fn get_item(&self) -> T {
        let mut guard = self.state.lock();
        loop {
            if let Some(item) = guard.items.pop_front() {
                self.item_removed.notify_one();
                return item;
            }
            self.item_added.wait(&mut guard);
        }
    }

    /// Cancellation-safe variant of [`get_item`](Self::get_item): waits in
    /// `poll` slices and re-checks `stop` between them so a consumer
    /// thread can be told to exit without leaving the mutex or condvar in
    /// an inconsistent state.
    ///
    /// Returns `None` once `stop` is observed, without having consumed an
    /// item.
    pub fn get_item_cancelable(&self, stop: &AtomicBool, poll: Duration) -> Option<T> {
        let mut guard = self.state.lock();
        loop {
            if let Some(item) = guard.items.pop_front() {
                self.item_removed.notify_one();
                return Some(item);
            }
            if stop.load(Ordering::Acquire) {
                return None;
            }
            self.item_added.wait_for(&mut guard, poll);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn occupancy_stays_in_bounds() {
        let q: BoundedQueue<u32> = BoundedQueue::new(2);
        assert!(q.add_item(1, false).is_ok());
        assert!(q.add_item(2, false).is_ok());
        assert_eq!(q.add_item(3, false), Err(3));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn full_queue_never_blocks_nonblocking_producer() {
        let q: BoundedQueue<u32> = BoundedQueue::new(1);
        q.add_item(1, false).unwrap();
        let start = std::time::Instant::now();
        let result = q.add_item(2, false);
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(result, Err(2));
    }

    #[test]
    fn get_item_fifo_order() {
        let q: BoundedQueue<u32> = BoundedQueue::new(4);
        q.add_item(1, false).unwrap();
        q.add_item(2, false).unwrap();
        assert_eq!(q.get_item(), 1);
        assert_eq!(q.get_item(), 2);
    }

    #[test]
    fn cancelable_get_returns_none_on_stop_without_consuming() {
        let q: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(4));
        let stop = Arc::new(AtomicBool::new(false));
        let q2 = q.clone();
        let stop2 = stop.clone();
        let handle = thread::spawn(move || q2.get_item_cancelable(&stop2, Duration::from_millis(10)));
        thread::sleep(Duration::from_millis(30));
        stop.store(true, Ordering::Release);
        let result = handle.join().unwrap();
        assert!(result.is_none());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn cancelable_get_returns_item_when_available() {
        let q: BoundedQueue<u32> = BoundedQueue::new(4);
        q.add_item(7, false).unwrap();
        let stop = AtomicBool::new(false);
        let item = q.get_item_cancelable(&stop, Duration::from_millis(50));
        assert_eq!(item, Some(7));
    }
}
