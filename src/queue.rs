//! Bounded inter-thread queue
//!
//! Every producer/consumer hop in the client goes through a `BoundedQueue`:
//! the reader loop feeds video and audio segments in, the decode and playback
//! threads pull them out. Producers never block; a full queue tail-drops the
//! incoming item. Consumers block on `wait` until data or shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Buf;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

/// One owned payload buffer travelling between threads.
///
/// `offset` bytes of per-frame sub-header are skipped when the consumer asks
/// for the payload; the raw buffer stays addressable for header peeks like the
/// audio format id.
#[derive(Debug)]
pub struct Segment {
    buf: Vec<u8>,
    offset: usize,
}

impl Segment {
    pub fn new(buf: Vec<u8>, offset: usize) -> Self {
        debug_assert!(offset <= buf.len());
        Self { buf, offset }
    }

    /// Segment with `pad` zero bytes appended past the logical end; the video
    /// decoder reads scratch space beyond the last byte it is given.
    pub fn with_padding(mut buf: Vec<u8>, offset: usize, pad: usize) -> Self {
        buf.resize(buf.len() + pad, 0);
        Self::new(buf, offset)
    }

    /// Payload after the sub-header skip
    pub fn payload(&self) -> &[u8] {
        &self.buf[self.offset..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.offset..]
    }

    pub fn payload_len(&self) -> usize {
        self.buf.len() - self.offset
    }

    /// Little-endian i32 at `offset` into the raw, unskipped buffer
    pub fn int_at(&self, offset: usize) -> Option<i32> {
        if self.buf.len() < offset + 4 {
            return None;
        }
        let mut raw = &self.buf[offset..];
        Some(raw.get_i32_le())
    }

    /// Raw buffer including the sub-header
    pub fn raw(&self) -> &[u8] {
        &self.buf
    }
}

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
}

/// Fixed-capacity FIFO with blocking wait and wake-all shutdown.
///
/// Single mutex + condition variable; safe for any number of producers and
/// consumers, though each instance here carries one of each.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                capacity,
            }),
            available: Condvar::new(),
        }
    }

    /// Push unless full. A rejected item is returned to the caller, who
    /// normally just drops it (tail-drop).
    pub fn push_discard(&self, item: T) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.items.len() == inner.capacity {
                return false;
            }
            inner.items.push_back(item);
        }
        self.available.notify_one();
        true
    }

    pub fn pop(&self) -> Option<T> {
        self.inner.lock().items.pop_front()
    }

    /// Inspect the head item without consuming it. The pull-model audio
    /// consumer uses this to decide on device configuration before it commits
    /// to draining the queue.
    pub fn peek_with<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let inner = self.inner.lock();
        inner.items.front().map(f)
    }

    /// Block until more than `above` items are queued, `active` goes false, or
    /// `timeout` elapses. Returns true when woken for data.
    pub fn wait(&self, active: &AtomicBool, above: usize, timeout: Option<Duration>) -> bool {
        let mut inner = self.inner.lock();
        loop {
            if inner.items.len() > above {
                return true;
            }
            if !active.load(Ordering::Acquire) {
                return false;
            }
            match timeout {
                Some(t) => {
                    if self.available.wait_for(&mut inner, t).timed_out() {
                        return inner.items.len() > above;
                    }
                }
                None => self.available.wait(&mut inner),
            }
        }
    }

    /// Wake every blocked `wait`, typically right after clearing the active
    /// flag during shutdown.
    pub fn notify_all(&self) {
        self.available.notify_all();
    }

    /// Drop all queued items. Never deadlocks against a blocked `wait`.
    pub fn clear(&self) {
        let drained: Vec<T> = self.inner.lock().items.drain(..).collect();
        // Items are dropped outside the lock
        drop(drained);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn fifo_order() {
        let queue = BoundedQueue::new(4);
        assert!(queue.push_discard(1));
        assert!(queue.push_discard(2));
        assert!(queue.push_discard(3));
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn tail_drop_at_capacity() {
        let queue = BoundedQueue::new(2);
        assert!(queue.push_discard("a"));
        assert!(queue.push_discard("b"));
        assert!(!queue.push_discard("c"));
        assert_eq!(queue.len(), 2);
        // Oldest item survives; the rejected one never entered
        assert_eq!(queue.pop(), Some("a"));
    }

    #[test]
    fn peek_does_not_consume() {
        let queue = BoundedQueue::new(4);
        queue.push_discard(Segment::new(vec![7, 0, 0, 0, 9], 4));
        assert_eq!(queue.peek_with(|s| s.int_at(0)), Some(Some(7)));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().unwrap().payload(), &[9]);
    }

    #[test]
    fn wait_returns_on_data() {
        let queue = Arc::new(BoundedQueue::new(4));
        let active = Arc::new(AtomicBool::new(true));

        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                queue.push_discard(42u32);
            })
        };

        assert!(queue.wait(&active, 0, Some(Duration::from_secs(5))));
        assert_eq!(queue.pop(), Some(42));
        producer.join().unwrap();
    }

    #[test]
    fn shutdown_wakes_empty_wait() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(4));
        let active = Arc::new(AtomicBool::new(true));

        let waiter = {
            let queue = queue.clone();
            let active = active.clone();
            std::thread::spawn(move || {
                let start = Instant::now();
                let woke_for_data = queue.wait(&active, 0, None);
                (woke_for_data, start.elapsed())
            })
        };

        std::thread::sleep(Duration::from_millis(20));
        active.store(false, Ordering::Release);
        queue.notify_all();

        let (woke_for_data, elapsed) = waiter.join().unwrap();
        assert!(!woke_for_data);
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn clear_then_wait_does_not_deadlock() {
        let queue: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(4));
        let active = AtomicBool::new(true);
        queue.push_discard(1);
        queue.clear();
        assert!(queue.is_empty());
        // Timed wait on the now-empty queue must come back
        assert!(!queue.wait(&active, 0, Some(Duration::from_millis(10))));
    }

    #[test]
    fn segment_padding_is_zero_filled() {
        let segment = Segment::with_padding(vec![1u8; 24], 20, 8);
        assert_eq!(segment.payload_len(), 12);
        assert_eq!(&segment.payload()[..4], &[1, 1, 1, 1]);
        assert_eq!(&segment.payload()[4..], &[0; 8]);
    }

    #[test]
    fn segment_int_at_bounds() {
        let segment = Segment::new(vec![1, 0, 0, 0, 2], 0);
        assert_eq!(segment.int_at(0), Some(1));
        assert_eq!(segment.int_at(2), None);
    }

    proptest! {
        #[test]
        fn count_never_exceeds_capacity(ops in proptest::collection::vec(any::<bool>(), 0..64)) {
            let queue = BoundedQueue::new(5);
            for push in ops {
                if push {
                    queue.push_discard(0u8);
                } else {
                    queue.pop();
                }
                prop_assert!(queue.len() <= 5);
            }
        }
    }
}
