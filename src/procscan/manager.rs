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

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::broadcast::{Broadcaster, Subscription};
use crate::common::config::ProcConfig;
use crate::common::sync::lock;
use crate::error::{Error, Result};
use crate::procscan::aggregate::{aggregate_device, ClientPeaks, EngineBaseline};
use crate::procscan::collector::UsageCollector;
use crate::procscan::types::ProcessSnapshot;

pub type ProcessSubscription = Subscription<String, ProcessSnapshot>;

/// State carried from one scan to the next.
#[derive(Default)]
struct ScanState {
    peaks: HashMap<String, ClientPeaks>,
    baselines: HashMap<String, EngineBaseline>,
    last_scan: Option<DateTime<Utc>>,
}

/// Runs the shared process scan and publishes one [`ProcessSnapshot`] per
/// device per successful scan.
pub struct ProcScanManager {
    config: ProcConfig,
    device_ids: Vec<String>,
    collector: Arc<dyn UsageCollector>,
    hub: Broadcaster<String, ProcessSnapshot>,
    state: Mutex<ScanState>,
    closed: AtomicBool,
}

impl ProcScanManager {
    pub fn new(
        config: ProcConfig,
        device_ids: Vec<String>,
        collector: Arc<dyn UsageCollector>,
    ) -> Result<Self> {
        if config.scan_interval.is_zero() {
            return Err(Error::InvalidConfig("scan interval must be > 0".into()));
        }
        Ok(Self {
            config,
            device_ids,
            collector,
            hub: Broadcaster::new(),
            state: Mutex::new(ScanState::default()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn enabled(&self) -> bool {
        self.config.enable
    }

    /// Scan on every tick until `cancel` fires, then shut down. Idles when
    /// disabled or when there are no devices to attribute usage to.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.config.enable || self.device_ids.is_empty() {
            tracing::info!(
                enabled = self.config.enable,
                devices = self.device_ids.len(),
                "process scanner idle"
            );
            cancel.cancelled().await;
            self.shutdown();
            return;
        }

        tracing::info!(interval = ?self.config.scan_interval, "process scanner started");
        let mut ticker = tokio::time::interval(self.config.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("process scanner stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if self.scan_once(Utc::now()).await.is_err() {
                        // Logged inside; the next tick retries.
                        continue;
                    }
                }
            }
        }
        self.shutdown();
    }

    /// Perform one full scan stamped `now`.
    ///
    /// On failure nothing is published and the previous snapshots, peaks and
    /// engine baselines are kept as they were.
    pub async fn scan_once(&self, now: DateTime<Utc>) -> Result<()> {
        let collector = self.collector.clone();
        let collected = tokio::task::spawn_blocking(move || collector.collect())
            .await
            .map_err(|e| Error::ScanFailed(format!("scan task failed: {e}")))
            .and_then(|result| result);

        let mut raw = match collected {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "process scan failed, keeping previous snapshots");
                return Err(e);
            }
        };

        let snapshots: Vec<ProcessSnapshot> = {
            let mut state = lock(&self.state);
            let ScanState {
                peaks,
                baselines,
                last_scan,
            } = &mut *state;

            let snapshots = self
                .device_ids
                .iter()
                .map(|device_id| {
                    let readings = raw.remove(device_id).unwrap_or_default();
                    let (snapshot, baseline) = aggregate_device(
                        device_id,
                        &readings,
                        peaks.entry(device_id.clone()).or_default(),
                        baselines.get(device_id),
                        now,
                    );
                    baselines.insert(device_id.clone(), baseline);
                    snapshot
                })
                .collect();
            *last_scan = Some(now);
            snapshots
        };

        for snapshot in snapshots {
            tracing::trace!(
                gpu_id = %snapshot.device_id,
                processes = snapshot.processes.len(),
                "process snapshot published"
            );
            self.store(snapshot);
        }
        Ok(())
    }

    pub(crate) fn store(&self, snapshot: ProcessSnapshot) {
        self.hub.publish(snapshot.device_id.clone(), snapshot);
    }

    pub fn latest(&self, device_id: &str) -> Option<ProcessSnapshot> {
        self.hub.latest(&device_id.to_string())
    }

    pub fn subscribe(&self, device_id: &str) -> Result<ProcessSubscription> {
        if !self.config.enable {
            return Err(Error::FeatureDisabled("process scanner"));
        }
        if !self.device_ids.iter().any(|id| id == device_id) {
            return Err(Error::UnknownDevice(device_id.to_string()));
        }
        Ok(self.hub.subscribe(device_id.to_string()))
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.device_ids.clone()
    }

    /// True once at least one scan completed.
    pub fn ready(&self) -> bool {
        lock(&self.state).last_scan.is_some()
    }

    /// Close the collector and every subscriber mailbox. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.collector.close();
        self.hub.close_all();
        tracing::debug!("process scanner closed");
    }
}
