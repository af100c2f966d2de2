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

//! Keyed latest-value cache with coalescing fan-out.
//!
//! Producers call [`Broadcaster::publish`] and never wait on consumers. Each
//! subscriber owns a one-slot mailbox: a value that has not been read yet is
//! replaced by a newer one, so slow readers see staleness, never backlog.

pub mod queue;

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

pub use queue::{coalescing_queue, CoalescingQueue, QueueReceiver};

use crate::common::sync::lock;

/// Capacity of every subscriber mailbox.
pub const MAILBOX_CAPACITY: usize = 1;

struct Registry<K, V> {
    latest: HashMap<K, (u64, V)>,
    subscribers: HashMap<K, HashMap<u64, CoalescingQueue<V>>>,
    next_seq: u64,
    next_subscriber: u64,
    closed: bool,
}

struct Inner<K, V> {
    registry: Mutex<Registry<K, V>>,
}

impl<K: Eq + Hash, V> Inner<K, V> {
    fn remove(&self, key: &K, id: u64) {
        let mailbox = {
            let mut registry = lock(&self.registry);
            let Some(set) = registry.subscribers.get_mut(key) else {
                return;
            };
            let mailbox = set.remove(&id);
            if set.is_empty() {
                registry.subscribers.remove(key);
            }
            mailbox
        };
        if let Some(mailbox) = mailbox {
            mailbox.close();
        }
    }
}

/// Cache + fan-out keyed by `K`, shared by the sampler and the process scanner.
pub struct Broadcaster<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for Broadcaster<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> Default for Broadcaster<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Broadcaster<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry {
                    latest: HashMap::new(),
                    subscribers: HashMap::new(),
                    next_seq: 0,
                    next_subscriber: 0,
                    closed: false,
                }),
            }),
        }
    }

    /// Store `value` as the latest for `key` and deliver it to every current
    /// subscriber of `key`.
    pub fn publish(&self, key: K, value: V) {
        let (seq, mailboxes) = {
            let mut registry = lock(&self.inner.registry);
            registry.next_seq += 1;
            let seq = registry.next_seq;
            registry.latest.insert(key.clone(), (seq, value.clone()));
            let mailboxes: Vec<CoalescingQueue<V>> = registry
                .subscribers
                .get(&key)
                .map(|set| set.values().cloned().collect())
                .unwrap_or_default();
            (seq, mailboxes)
        };

        for mailbox in mailboxes {
            mailbox.push_versioned(seq, value.clone());
        }
    }

    /// The cached value for `key`, if anything was published for it.
    pub fn latest(&self, key: &K) -> Option<V> {
        lock(&self.inner.registry)
            .latest
            .get(key)
            .map(|(_, value)| value.clone())
    }

    /// Register a mailbox for `key`, seeded with the cached value if present.
    ///
    /// After [`close_all`](Self::close_all) the returned subscription is
    /// already closed and yields `None`.
    pub fn subscribe(&self, key: K) -> Subscription<K, V> {
        let (mailbox, receiver) = coalescing_queue(MAILBOX_CAPACITY);
        let mut registry = lock(&self.inner.registry);
        registry.next_subscriber += 1;
        let id = registry.next_subscriber;

        if registry.closed {
            mailbox.close();
        } else {
            if let Some((seq, value)) = registry.latest.get(&key) {
                mailbox.push_versioned(*seq, value.clone());
            }
            registry
                .subscribers
                .entry(key.clone())
                .or_default()
                .insert(id, mailbox);
        }
        drop(registry);

        Subscription {
            receiver,
            handle: Unsubscribe {
                inner: Arc::downgrade(&self.inner),
                key,
                id,
                done: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    /// Number of live subscribers for `key`.
    pub fn subscriber_count(&self, key: &K) -> usize {
        lock(&self.inner.registry)
            .subscribers
            .get(key)
            .map_or(0, HashMap::len)
    }

    /// Close every mailbox and refuse further subscriptions. Idempotent.
    pub fn close_all(&self) {
        let mailboxes: Vec<CoalescingQueue<V>> = {
            let mut registry = lock(&self.inner.registry);
            registry.closed = true;
            registry
                .subscribers
                .drain()
                .flat_map(|(_, set)| set.into_values())
                .collect()
        };
        for mailbox in mailboxes {
            mailbox.close();
        }
    }
}

/// A live subscription to one key. Dropping it unsubscribes.
pub struct Subscription<K: Eq + Hash, V> {
    receiver: QueueReceiver<V>,
    handle: Unsubscribe<K, V>,
}

impl<K: Eq + Hash, V> Subscription<K, V> {
    /// Wait for the next value. `None` means the mailbox was closed, either by
    /// unsubscribing or by the producer shutting down.
    pub async fn recv(&mut self) -> Option<V> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<V> {
        self.receiver.try_recv()
    }

    pub fn key(&self) -> &K {
        &self.handle.key
    }

    /// A handle that can end this subscription from another task.
    pub fn unsubscribe_handle(&self) -> Unsubscribe<K, V>
    where
        K: Clone,
    {
        self.handle.clone()
    }

    pub fn unsubscribe(&self) {
        self.handle.unsubscribe();
    }
}

impl<K: Eq + Hash, V> Drop for Subscription<K, V> {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}

/// Idempotent unsubscribe handle, safe to call from any task.
pub struct Unsubscribe<K, V> {
    inner: Weak<Inner<K, V>>,
    key: K,
    id: u64,
    done: Arc<AtomicBool>,
}

impl<K: Clone, V> Clone for Unsubscribe<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            key: self.key.clone(),
            id: self.id,
            done: self.done.clone(),
        }
    }
}

impl<K: Eq + Hash, V> Unsubscribe<K, V> {
    pub fn unsubscribe(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.remove(&self.key, self.id);
        }
    }
}

/// Monotonic id source for sessions and other short-lived consumers.
#[derive(Debug, Default)]
pub struct IdGenerator(AtomicU64);

impl IdGenerator {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_coalescing_keeps_latest_value() {
        let hub: Broadcaster<String, u32> = Broadcaster::new();
        let mut sub = hub.subscribe("card0".to_string());
        for value in 1..=10 {
            hub.publish("card0".to_string(), value);
        }
        assert_eq!(sub.try_recv(), Some(10));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_replay_on_subscribe() {
        let hub: Broadcaster<String, u32> = Broadcaster::new();
        hub.publish("card0".to_string(), 7);
        let mut sub = hub.subscribe("card0".to_string());
        assert_eq!(sub.try_recv(), Some(7));
        hub.publish("card0".to_string(), 8);
        assert_eq!(sub.try_recv(), Some(8));
    }

    #[test]
    fn test_subscribe_without_cache_is_empty() {
        let hub: Broadcaster<String, u32> = Broadcaster::new();
        let mut sub = hub.subscribe("card1".to_string());
        hub.publish("card0".to_string(), 1);
        assert_eq!(sub.try_recv(), None);
        assert_eq!(hub.latest(&"card0".to_string()), Some(1));
        assert_eq!(hub.latest(&"card1".to_string()), None);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_closes() {
        let hub: Broadcaster<String, u32> = Broadcaster::new();
        let mut sub = hub.subscribe("card0".to_string());
        let handle = sub.unsubscribe_handle();
        assert_eq!(hub.subscriber_count(&"card0".to_string()), 1);

        handle.unsubscribe();
        handle.unsubscribe();
        sub.unsubscribe();

        assert_eq!(hub.subscriber_count(&"card0".to_string()), 0);
        hub.publish("card0".to_string(), 3);
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let hub: Broadcaster<String, u32> = Broadcaster::new();
        {
            let _sub = hub.subscribe("card0".to_string());
            assert_eq!(hub.subscriber_count(&"card0".to_string()), 1);
        }
        assert_eq!(hub.subscriber_count(&"card0".to_string()), 0);
    }

    #[tokio::test]
    async fn test_close_all_unblocks_receivers() {
        let hub: Broadcaster<String, u32> = Broadcaster::new();
        let mut sub = hub.subscribe("card0".to_string());
        let waiter = tokio::spawn(async move { sub.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        hub.close_all();
        hub.close_all();

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("receiver should be released")
            .expect("task should not panic");
        assert_eq!(got, None);

        let mut late = hub.subscribe("card0".to_string());
        assert_eq!(late.recv().await, None);
    }

    #[tokio::test]
    async fn test_values_arrive_in_publish_order() {
        let hub: Broadcaster<String, u32> = Broadcaster::new();
        let mut sub = hub.subscribe("card0".to_string());
        for value in 1..=3 {
            hub.publish("card0".to_string(), value);
            assert_eq!(sub.recv().await, Some(value));
        }
    }

    #[test]
    fn test_id_generator_is_monotonic() {
        let ids = IdGenerator::default();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
    }
}
