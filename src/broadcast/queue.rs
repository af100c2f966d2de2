// Copyright 2025 Lablup Inc. and Jeongkyu Shin
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::common::sync::lock;

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    /// Highest version accepted through `push_versioned`.
    last_version: u64,
}

struct QueueShared<T> {
    state: Mutex<QueueState<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

/// Producer half of a bounded, latest-value-wins queue.
///
/// `push` never waits: once the queue holds `capacity` items the oldest one is
/// evicted to make room. A capacity of one turns the queue into a mailbox that
/// only ever holds the most recent value.
pub struct CoalescingQueue<T> {
    shared: Arc<QueueShared<T>>,
}

/// Consumer half of a [`CoalescingQueue`].
pub struct QueueReceiver<T> {
    shared: Arc<QueueShared<T>>,
}

/// Create a queue holding at most `capacity` pending items (minimum 1).
pub fn coalescing_queue<T>(capacity: usize) -> (CoalescingQueue<T>, QueueReceiver<T>) {
    let capacity = capacity.max(1);
    let shared = Arc::new(QueueShared {
        state: Mutex::new(QueueState {
            items: VecDeque::with_capacity(capacity),
            closed: false,
            last_version: 0,
        }),
        notify: Notify::new(),
        capacity,
        dropped: AtomicU64::new(0),
    });
    (
        CoalescingQueue {
            shared: shared.clone(),
        },
        QueueReceiver { shared },
    )
}

impl<T> Clone for CoalescingQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> CoalescingQueue<T> {
    /// Enqueue `item`, evicting the oldest pending item when full.
    ///
    /// Returns `false` (and counts a drop) when the queue is already closed.
    pub fn push(&self, item: T) -> bool {
        {
            let mut state = lock(&self.shared.state);
            if state.closed {
                drop(state);
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            self.insert(&mut state, item);
        }
        self.shared.notify.notify_one();
        true
    }

    /// Enqueue `item` only if `version` is newer than anything accepted before.
    ///
    /// Used by the broadcaster so a value replayed on subscribe and the same
    /// value delivered by a racing publish reach the consumer once.
    pub(crate) fn push_versioned(&self, version: u64, item: T) -> bool {
        {
            let mut state = lock(&self.shared.state);
            if state.closed || version <= state.last_version {
                return false;
            }
            state.last_version = version;
            self.insert(&mut state, item);
        }
        self.shared.notify.notify_one();
        true
    }

    fn insert(&self, state: &mut QueueState<T>, item: T) {
        if state.items.len() >= self.shared.capacity {
            state.items.pop_front();
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        state.items.push_back(item);
    }

    /// Close the queue. Pending items remain readable; afterwards the
    /// receiver observes `None`. Idempotent.
    pub fn close(&self) {
        {
            let mut state = lock(&self.shared.state);
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.shared.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.shared.state).closed
    }

    /// Number of items discarded because of eviction or a closed queue.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl<T> QueueReceiver<T> {
    /// Wait for the next item. Returns `None` once the queue is closed and
    /// drained. Cancel-safe: no item is lost if the future is dropped.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            {
                let mut state = lock(&self.shared.state);
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Take the next pending item without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        lock(&self.shared.state).items.pop_front()
    }

    pub fn pending(&self) -> usize {
        lock(&self.shared.state).items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_capacity_one_keeps_latest() {
        let (tx, mut rx) = coalescing_queue(1);
        for value in 1..=5 {
            assert!(tx.push(value));
            assert_eq!(rx.pending(), 1);
        }
        assert_eq!(rx.try_recv(), Some(5));
        assert_eq!(rx.try_recv(), None);
        assert_eq!(tx.dropped(), 4);
    }

    #[test]
    fn test_larger_capacity_drops_oldest() {
        let (tx, mut rx) = coalescing_queue(3);
        for value in 1..=5 {
            tx.push(value);
        }
        assert_eq!(rx.try_recv(), Some(3));
        assert_eq!(rx.try_recv(), Some(4));
        assert_eq!(rx.try_recv(), Some(5));
        assert_eq!(tx.dropped(), 2);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let (tx, mut rx) = coalescing_queue(0);
        tx.push("a");
        tx.push("b");
        assert_eq!(rx.try_recv(), Some("b"));
    }

    #[test]
    fn test_versioned_push_ignores_stale_versions() {
        let (tx, mut rx) = coalescing_queue(1);
        assert!(tx.push_versioned(2, "second"));
        assert!(!tx.push_versioned(2, "second again"));
        assert!(!tx.push_versioned(1, "first"));
        assert_eq!(rx.try_recv(), Some("second"));
        assert!(tx.push_versioned(3, "third"));
        assert_eq!(rx.try_recv(), Some("third"));
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let (tx, mut rx) = coalescing_queue(4);
        tx.push(1);
        tx.close();
        tx.close();
        assert!(!tx.push(2));
        assert!(tx.is_closed());
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let (tx, mut rx) = coalescing_queue(1);
        let waiter = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.push(42);
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("receiver should wake")
            .expect("task should not panic");
        assert_eq!(got, Some(42));
    }

    #[tokio::test]
    async fn test_recv_wakes_on_close() {
        let (tx, mut rx) = coalescing_queue::<u8>(1);
        let waiter = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.close();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("receiver should wake")
            .expect("task should not panic");
        assert_eq!(got, None);
    }
}
