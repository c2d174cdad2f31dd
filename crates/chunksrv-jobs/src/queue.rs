use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

/// A bounded, FIFO, multi-producer multi-consumer work queue. Submitters
/// block in [`BoundedQueue::push`] when the queue is at capacity; workers
/// block in [`BoundedQueue::pop`] when it is empty. `close` wakes every
/// blocked thread and makes further `pop` calls return `None` once the
/// queue has drained, used to tear the pool down without workers spinning
/// on a closed channel.
pub struct BoundedQueue<T> {
    capacity: usize,
    inner: Mutex<Inner<T>>,
    not_full: Condvar,
    not_empty: Condvar,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        })
    }

    /// Returns `true` without blocking (`job_pool_can_add` in the
    /// original): a submitter uses this to decide whether to reject a job
    /// up front instead of blocking, when backpressure should be visible
    /// to the caller rather than absorbed.
    pub fn can_add(&self) -> bool {
        let guard = self.inner.lock().unwrap();
        guard.items.len() < self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Blocks until there is room. Returns `false` if the queue was
    /// closed before room became available.
    pub fn push(&self, item: T) -> bool {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if guard.closed {
                return false;
            }
            if guard.items.len() < self.capacity {
                guard.items.push_back(item);
                self.not_empty.notify_one();
                return true;
            }
            guard = self.not_full.wait(guard).unwrap();
        }
    }

    /// Blocks until an item is available or the queue is closed and
    /// drained, at which point it returns `None`.
    pub fn pop(&self) -> Option<T> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(item) = guard.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if guard.closed {
                return None;
            }
            guard = self.not_empty.wait(guard).unwrap();
        }
    }

    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn push_then_pop_preserves_fifo_order() {
        let q = BoundedQueue::new(4);
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn push_blocks_until_capacity_frees_up() {
        let q = BoundedQueue::new(1);
        q.push(1);
        assert!(!q.can_add());
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || {
            q2.push(2);
        });
        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.pop(), Some(1));
        handle.join().unwrap();
        assert_eq!(q.pop(), Some(2));
    }

    #[test]
    fn close_wakes_blocked_poppers() {
        let q: Arc<BoundedQueue<i32>> = BoundedQueue::new(2);
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.pop());
        thread::sleep(Duration::from_millis(50));
        q.close();
        assert_eq!(handle.join().unwrap(), None);
    }
}
