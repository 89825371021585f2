//! Bounded FIFO ring buffers feeding streaming consumers (log and
//! strategy-update streams). Producers never block: on overflow the oldest
//! entry is dropped. A condvar wakes waiting consumers on every push.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Default capacity of the runtime's stream buffers.
pub const DEFAULT_RING_CAPACITY: usize = 1000;

pub struct RingBuffer<T> {
    inner: Mutex<VecDeque<T>>,
    signal: Condvar,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            signal: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append one entry, dropping the oldest when full, and wake consumers.
    pub fn push(&self, item: T) {
        let mut queue = self.inner.lock().expect("ring poisoned");
        if queue.len() == self.capacity {
            queue.pop_front();
        }
        queue.push_back(item);
        drop(queue);
        self.signal.notify_all();
    }

    /// Take everything currently buffered.
    pub fn drain(&self) -> Vec<T> {
        let mut queue = self.inner.lock().expect("ring poisoned");
        queue.drain(..).collect()
    }

    /// Block up to `timeout` for at least one entry, then take everything.
    /// An empty result means the wait timed out.
    pub fn wait_and_drain(&self, timeout: Duration) -> Vec<T> {
        let queue = self.inner.lock().expect("ring poisoned");
        let (mut queue, _) = self
            .signal
            .wait_timeout_while(queue, timeout, |queue| queue.is_empty())
            .expect("ring poisoned");
        queue.drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("ring poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for RingBuffer<T> {
    fn default() -> Self {
        Self::new(DEFAULT_RING_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn overflow_drops_oldest_first() {
        let ring = RingBuffer::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.drain(), vec![2, 3, 4]);
        assert!(ring.is_empty());
    }

    #[test]
    fn wait_and_drain_wakes_on_push() {
        let ring = Arc::new(RingBuffer::new(8));
        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.wait_and_drain(Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        ring.push(42u32);
        assert_eq!(consumer.join().unwrap(), vec![42]);
    }

    #[test]
    fn wait_times_out_empty() {
        let ring: RingBuffer<u32> = RingBuffer::new(2);
        assert!(ring.wait_and_drain(Duration::from_millis(10)).is_empty());
    }
}
