//! Audio ingress: the hand-off between whoever receives audio and the streaming worker.
//!
//! Producers call [`AudioIngressQueue::push`] from any thread or runtime and never
//! block. The single streaming worker awaits [`AudioIngressQueue::pop`]. The queue is
//! a mutex-guarded deque plus a `Notify`, neither of which is tied to a scheduler,
//! so the gateway's runtime and the worker's own runtime can share it.
//!
//! When the depth limit is hit the oldest frame is evicted: stale audio is worthless
//! for a live emotion signal.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

/// One opaque chunk of audio as received from the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    data: Vec<u8>,
}

impl AudioFrame {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl From<Vec<u8>> for AudioFrame {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<&[u8]> for AudioFrame {
    fn from(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }
}

/// Bounded FIFO of audio frames with oldest-first eviction.
pub struct AudioIngressQueue {
    frames: Mutex<VecDeque<AudioFrame>>,
    available: Notify,
    max_depth: usize,
    dropped: AtomicU64,
}

impl AudioIngressQueue {
    /// `max_depth` of 0 is treated as 1.
    pub fn new(max_depth: usize) -> Self {
        let max_depth = max_depth.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(max_depth.min(1024))),
            available: Notify::new(),
            max_depth,
            dropped: AtomicU64::new(0),
        }
    }

    fn frames(&self) -> MutexGuard<'_, VecDeque<AudioFrame>> {
        self.frames.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a frame. Never blocks and never fails.
    pub fn push(&self, frame: impl Into<AudioFrame>) {
        {
            let mut frames = self.frames();
            if frames.len() >= self.max_depth {
                frames.pop_front();
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(target: "aura::ingress", dropped_total = total, "queue full, evicted oldest frame");
            }
            frames.push_back(frame.into());
        }
        self.available.notify_one();
    }

    /// Take the oldest frame if one is queued.
    pub fn try_pop(&self) -> Option<AudioFrame> {
        self.frames().pop_front()
    }

    /// Wait until a frame is available and take it.
    ///
    /// Cancel-safe: dropping the future never loses a frame, frames only leave the
    /// deque through `try_pop`.
    pub async fn pop(&self) -> AudioFrame {
        loop {
            let notified = self.available.notified();
            if let Some(frame) = self.try_pop() {
                return frame;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.frames().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames().is_empty()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Frames evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn fifo_order() {
        let queue = AudioIngressQueue::new(8);
        queue.push(b"A".to_vec());
        queue.push(b"B".to_vec());
        queue.push(b"C".to_vec());
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop().unwrap().as_bytes(), b"A");
        assert_eq!(queue.try_pop().unwrap().as_bytes(), b"B");
        assert_eq!(queue.try_pop().unwrap().as_bytes(), b"C");
        assert!(queue.try_pop().is_none());
    }

    #[test]
    fn full_queue_evicts_oldest() {
        let queue = AudioIngressQueue::new(2);
        queue.push(b"1".to_vec());
        queue.push(b"2".to_vec());
        queue.push(b"3".to_vec());
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.try_pop().unwrap().as_bytes(), b"2");
        assert_eq!(queue.try_pop().unwrap().as_bytes(), b"3");
    }

    #[test]
    fn zero_depth_still_holds_one_frame() {
        let queue = AudioIngressQueue::new(0);
        assert_eq!(queue.max_depth(), 1);
        queue.push(vec![1u8]);
        queue.push(vec![2u8]);
        assert_eq!(queue.try_pop().unwrap().into_bytes(), vec![2u8]);
    }

    #[tokio::test]
    async fn pop_waits_for_push_from_another_thread() {
        let queue = Arc::new(AudioIngressQueue::new(4));
        let producer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.push(b"late".to_vec());
        });
        let frame = tokio::time::timeout(Duration::from_secs(2), queue.pop())
            .await
            .expect("pop should wake on push");
        assert_eq!(frame.as_bytes(), b"late");
        handle.join().unwrap();
    }

    #[test]
    fn pop_works_across_independent_runtimes() {
        let queue = Arc::new(AudioIngressQueue::new(16));

        let consumer_queue = Arc::clone(&queue);
        let consumer = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let mut seen = Vec::new();
                for _ in 0..3 {
                    seen.push(consumer_queue.pop().await.into_bytes());
                }
                seen
            })
        });

        let producer_rt = tokio::runtime::Runtime::new().unwrap();
        producer_rt.block_on(async {
            for frame in [b"A", b"B", b"C"] {
                queue.push(frame.to_vec());
                tokio::task::yield_now().await;
            }
        });

        let seen = consumer.join().unwrap();
        assert_eq!(seen, vec![b"A".to_vec(), b"B".to_vec(), b"C".to_vec()]);
    }
}
