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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::broadcast::{Broadcaster, Subscription};
use crate::device::traits::MetricsReader;
use crate::error::{Error, Result};
use crate::sampler::types::MetricsSnapshot;

pub type MetricsSubscription = Subscription<String, MetricsSnapshot>;

/// Owns one acquisition task per device and fans samples out to subscribers.
pub struct SamplerManager {
    interval: Duration,
    readers: Vec<Arc<dyn MetricsReader>>,
    hub: Broadcaster<String, MetricsSnapshot>,
    closed: AtomicBool,
}

impl SamplerManager {
    pub fn new(interval: Duration, readers: Vec<Arc<dyn MetricsReader>>) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::InvalidConfig("sample interval must be > 0".into()));
        }
        Ok(Self {
            interval,
            readers,
            hub: Broadcaster::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Sample every device until `cancel` fires, then shut down.
    ///
    /// Each device gets its own task; the first tick fires immediately so the
    /// cache is primed as soon as the manager starts.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if self.readers.is_empty() {
            tracing::info!("no metrics readers configured, sampler idle");
            cancel.cancelled().await;
            self.shutdown();
            return;
        }

        let mut tasks = JoinSet::new();
        for reader in &self.readers {
            tasks.spawn(sample_loop(self.clone(), reader.clone(), cancel.clone()));
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                tracing::error!(error = %e, "sampler task terminated abnormally");
            }
        }
        self.shutdown();
    }

    pub fn latest(&self, device_id: &str) -> Option<MetricsSnapshot> {
        self.hub.latest(&device_id.to_string())
    }

    /// Subscribe to samples of `device_id`; the cached sample, if any, is
    /// delivered first.
    pub fn subscribe(&self, device_id: &str) -> Result<MetricsSubscription> {
        if !self.knows(device_id) {
            return Err(Error::UnknownDevice(device_id.to_string()));
        }
        Ok(self.hub.subscribe(device_id.to_string()))
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.readers
            .iter()
            .map(|reader| reader.device_id().to_string())
            .collect()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// True once every sampled device has produced at least one sample.
    pub fn ready(&self) -> bool {
        self.readers
            .iter()
            .all(|reader| self.hub.latest(&reader.device_id().to_string()).is_some())
    }

    /// Close every reader and subscriber mailbox. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for reader in &self.readers {
            reader.close();
        }
        self.hub.close_all();
        tracing::debug!("sampler manager closed");
    }

    pub(crate) fn store(&self, snapshot: MetricsSnapshot) {
        self.hub.publish(snapshot.device_id.clone(), snapshot);
    }

    fn knows(&self, device_id: &str) -> bool {
        self.readers
            .iter()
            .any(|reader| reader.device_id() == device_id)
    }
}

async fn sample_loop(
    manager: Arc<SamplerManager>,
    reader: Arc<dyn MetricsReader>,
    cancel: CancellationToken,
) {
    let gpu_id = reader.device_id().to_string();
    tracing::info!(gpu_id = %gpu_id, interval = ?manager.interval, "sampler started");

    let mut ticker = tokio::time::interval(manager.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!(gpu_id = %gpu_id, "sampler stopping");
                return;
            }
            _ = ticker.tick() => {}
        }

        let blocking_reader = reader.clone();
        match tokio::task::spawn_blocking(move || blocking_reader.sample()).await {
            Ok(mut snapshot) => {
                snapshot.device_id.clone_from(&gpu_id);
                manager.store(snapshot);
            }
            Err(e) => tracing::warn!(gpu_id = %gpu_id, error = %e, "sample task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::types::Metrics;
    use chrono::Utc;
    use std::sync::atomic::AtomicU32;

    struct CountingReader {
        id: String,
        samples: AtomicU32,
        closes: AtomicU32,
    }

    impl CountingReader {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                samples: AtomicU32::new(0),
                closes: AtomicU32::new(0),
            })
        }
    }

    impl MetricsReader for CountingReader {
        fn device_id(&self) -> &str {
            &self.id
        }

        fn sample(&self) -> MetricsSnapshot {
            let n = self.samples.fetch_add(1, Ordering::SeqCst) + 1;
            MetricsSnapshot::new(
                self.id.clone(),
                Utc::now(),
                Metrics {
                    gpu_busy_pct: Some(f64::from(n)),
                    ..Metrics::default()
                },
            )
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn snapshot(id: &str, busy: f64) -> MetricsSnapshot {
        MetricsSnapshot::new(
            id,
            Utc::now(),
            Metrics {
                gpu_busy_pct: Some(busy),
                ..Metrics::default()
            },
        )
    }

    #[test]
    fn test_new_rejects_zero_interval() {
        assert!(SamplerManager::new(Duration::ZERO, Vec::new()).is_err());
    }

    #[test]
    fn test_subscribe_unknown_device() {
        let manager =
            SamplerManager::new(Duration::from_secs(1), vec![CountingReader::new("card0")])
                .unwrap();
        assert!(matches!(
            manager.subscribe("card9"),
            Err(Error::UnknownDevice(id)) if id == "card9"
        ));
    }

    #[test]
    fn test_ready_and_latest() {
        let manager = SamplerManager::new(
            Duration::from_secs(1),
            vec![CountingReader::new("card0"), CountingReader::new("card1")],
        )
        .unwrap();
        assert!(!manager.ready());
        manager.store(snapshot("card0", 1.0));
        assert!(!manager.ready());
        manager.store(snapshot("card1", 2.0));
        assert!(manager.ready());
        assert_eq!(
            manager.latest("card1").unwrap().metrics.gpu_busy_pct,
            Some(2.0)
        );
        assert!(manager.latest("card5").is_none());
    }

    #[test]
    fn test_ready_without_readers() {
        let manager = SamplerManager::new(Duration::from_secs(1), Vec::new()).unwrap();
        assert!(manager.ready());
        assert!(manager.device_ids().is_empty());
    }

    #[test]
    fn test_coalescing_subscription() {
        let manager =
            SamplerManager::new(Duration::from_secs(1), vec![CountingReader::new("card0")])
                .unwrap();
        let mut sub = manager.subscribe("card0").unwrap();
        for busy in [1.0, 2.0, 3.0] {
            manager.store(snapshot("card0", busy));
        }
        assert_eq!(sub.try_recv().unwrap().metrics.gpu_busy_pct, Some(3.0));
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_run_primes_cache_and_shuts_down() {
        let reader = CountingReader::new("card0");
        let manager = Arc::new(
            SamplerManager::new(Duration::from_millis(20), vec![reader.clone()]).unwrap(),
        );
        let mut sub = manager.subscribe("card0").unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(manager.clone().run(cancel.clone()));

        let first = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("first sample")
            .expect("subscription open");
        assert_eq!(first.device_id, "card0");
        assert!(manager.ready());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("run returns after cancel")
            .unwrap();

        // Drain anything published before shutdown, then the mailbox is closed.
        while sub.recv().await.is_some() {}
        assert_eq!(reader.closes.load(Ordering::SeqCst), 1);

        manager.shutdown();
        assert_eq!(reader.closes.load(Ordering::SeqCst), 1);
    }
}
