use anyhow::{bail, Result};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{Region, SharedRegion, ShmLayout};

// 各カウンタは別キャッシュラインに置く
const CAPACITY_OFFSET: usize = 0;
const HEAD_OFFSET: usize = 64;
const TAIL_OFFSET: usize = 128;
const DROPPED_OFFSET: usize = 192;
const SLOTS_OFFSET: usize = 256;

pub(super) fn region_len(capacity: usize) -> usize {
    SLOTS_OFFSET + 8 * capacity
}

/// Single-producer single-consumer FIFO of frame timestamps.
///
/// The acquisition process pushes, the tracking process pops. A push into a
/// full queue drops the timestamp and counts it instead of blocking the
/// camera loop.
pub struct TimestampQueue {
    region: SharedRegion,
    capacity: u64,
}

impl TimestampQueue {
    pub fn create(layout: &ShmLayout) -> Result<Self> {
        if layout.queue_capacity == 0 {
            bail!("timestamp queue capacity must be at least 1");
        }
        let region = layout.create(Region::TimestampQueue)?;
        region
            .atomic_u64(CAPACITY_OFFSET)
            .store(layout.queue_capacity as u64, Ordering::Release);
        Ok(Self {
            region,
            capacity: layout.queue_capacity as u64,
        })
    }

    pub fn attach(layout: &ShmLayout) -> Result<Self> {
        let region = layout.attach(Region::TimestampQueue)?;
        let stored = region.atomic_u64(CAPACITY_OFFSET).load(Ordering::Acquire);
        if stored != layout.queue_capacity as u64 {
            bail!(
                "timestamp queue capacity mismatch: region has {}, config says {}",
                stored,
                layout.queue_capacity
            );
        }
        Ok(Self {
            region,
            capacity: stored,
        })
    }

    fn head(&self) -> &AtomicU64 {
        self.region.atomic_u64(HEAD_OFFSET)
    }

    fn tail(&self) -> &AtomicU64 {
        self.region.atomic_u64(TAIL_OFFSET)
    }

    fn slot(&self, index: u64) -> &AtomicU64 {
        self.region
            .atomic_u64(SLOTS_OFFSET + 8 * (index % self.capacity) as usize)
    }

    /// Producer side. Returns `false` when the queue was full and the
    /// timestamp was dropped.
    pub fn try_push(&self, timestamp: f64) -> bool {
        let tail = self.tail().load(Ordering::Relaxed);
        let head = self.head().load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.capacity {
            self.region
                .atomic_u64(DROPPED_OFFSET)
                .fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.slot(tail).store(timestamp.to_bits(), Ordering::Relaxed);
        self.tail().store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Consumer side.
    pub fn try_pop(&self) -> Option<f64> {
        let head = self.head().load(Ordering::Relaxed);
        let tail = self.tail().load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let bits = self.slot(head).load(Ordering::Relaxed);
        self.head().store(head.wrapping_add(1), Ordering::Release);
        Some(f64::from_bits(bits))
    }

    pub fn len(&self) -> usize {
        let tail = self.tail().load(Ordering::Acquire);
        let head = self.head().load(Ordering::Acquire);
        tail.wrapping_sub(head) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Timestamps dropped because the consumer fell behind.
    pub fn dropped(&self) -> u64 {
        self.region
            .atomic_u64(DROPPED_OFFSET)
            .load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::test_layout;

    #[test]
    fn test_fifo_order_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let layout = test_layout(dir.path());
        let producer = TimestampQueue::create(&layout).unwrap();
        let consumer = TimestampQueue::attach(&layout).unwrap();

        assert_eq!(consumer.try_pop(), None);
        for t in [1.0, 1.5, 2.25] {
            assert!(producer.try_push(t));
        }
        assert_eq!(consumer.len(), 3);
        assert_eq!(consumer.try_pop(), Some(1.0));
        assert_eq!(consumer.try_pop(), Some(1.5));
        assert_eq!(consumer.try_pop(), Some(2.25));
        assert_eq!(consumer.try_pop(), None);
    }

    #[test]
    fn test_full_queue_drops_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let layout = test_layout(dir.path());
        let queue = TimestampQueue::create(&layout).unwrap();

        for i in 0..layout.queue_capacity {
            assert!(queue.try_push(i as f64));
        }
        assert!(!queue.try_push(99.0));
        assert!(!queue.try_push(100.0));
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.len(), layout.queue_capacity);

        // 取り出せば再び積める
        assert_eq!(queue.try_pop(), Some(0.0));
        assert!(queue.try_push(101.0));
    }

    #[test]
    fn test_wraps_many_times() {
        let dir = tempfile::tempdir().unwrap();
        let layout = test_layout(dir.path());
        let queue = TimestampQueue::create(&layout).unwrap();
        for i in 0..100 {
            assert!(queue.try_push(i as f64));
            assert!(queue.try_push(i as f64 + 0.5));
            assert_eq!(queue.try_pop(), Some(i as f64));
            assert_eq!(queue.try_pop(), Some(i as f64 + 0.5));
        }
        assert!(queue.is_empty());
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn test_threads_preserve_order() {
        let dir = tempfile::tempdir().unwrap();
        let layout = test_layout(dir.path());
        let producer = TimestampQueue::create(&layout).unwrap();
        let consumer = TimestampQueue::attach(&layout).unwrap();

        let handle = std::thread::spawn(move || {
            let mut pushed = 0;
            while pushed < 1000 {
                if producer.try_push(pushed as f64) {
                    pushed += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });

        let mut expected = 0.0;
        while expected < 1000.0 {
            if let Some(t) = consumer.try_pop() {
                assert_eq!(t, expected);
                expected += 1.0;
            }
        }
        handle.join().unwrap();
    }

    #[test]
    fn test_capacity_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let layout = test_layout(dir.path());
        let _queue = TimestampQueue::create(&layout).unwrap();
        let mut smaller = layout.clone();
        smaller.queue_capacity = 4;
        assert!(TimestampQueue::attach(&smaller).is_err());
    }
}
