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

//! Turns raw per-descriptor readings into a per-device [`ProcessSnapshot`].
//!
//! Everything here is a pure function of its inputs: the readings of the
//! current scan, the client memory peaks carried between scans and the
//! engine baseline of the previous scan.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::procscan::types::{Capabilities, DescriptorUsage, ProcessSnapshot, ProcessUsage};

/// Highest VRAM/GTT value observed for one DRM client on one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientMemoryPeak {
    pub vram_bytes: u64,
    pub gtt_bytes: u64,
}

/// Client id -> peak, for one device.
pub type ClientPeaks = HashMap<u64, ClientMemoryPeak>;

/// Cumulative engine time per pid as of `taken_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineBaseline {
    pub taken_at: DateTime<Utc>,
    pub totals: HashMap<u32, u64>,
}

/// Engine busy rate in milliseconds per wall-clock second.
///
/// `None` when there is no baseline for `pid`, the counter went backwards
/// (reset or pid reuse) or no time has elapsed.
pub fn engine_rate(
    baseline: Option<&EngineBaseline>,
    pid: u32,
    total_ns: u64,
    now: DateTime<Utc>,
) -> Option<f64> {
    let baseline = baseline?;
    let previous = *baseline.totals.get(&pid)?;
    if total_ns < previous {
        return None;
    }
    let elapsed = (now - baseline.taken_at).to_std().ok()?.as_secs_f64();
    if elapsed <= 0.0 {
        return None;
    }
    Some((total_ns - previous) as f64 / 1_000_000.0 / elapsed)
}

/// Sort heaviest consumer first (VRAM + GTT), ties by ascending pid.
pub fn sort_processes(processes: &mut [ProcessUsage]) {
    processes.sort_by(|a, b| {
        b.memory_total()
            .cmp(&a.memory_total())
            .then_with(|| a.pid.cmp(&b.pid))
    });
}

struct ProcessAccumulator {
    usage: ProcessUsage,
    vram_bytes: u64,
    gtt_bytes: u64,
    has_memory: bool,
    engine_ns: u64,
    has_engine: bool,
    clients: HashSet<u64>,
}

impl ProcessAccumulator {
    fn new(reading: &DescriptorUsage) -> Self {
        Self {
            usage: ProcessUsage {
                pid: reading.pid,
                uid: reading.uid,
                user: reading.user.clone(),
                name: reading.name.clone(),
                cmd: reading.cmd.clone(),
                render_node: reading.render_node.clone(),
                vram_bytes: None,
                gtt_bytes: None,
                gpu_time_ms_per_s: None,
            },
            vram_bytes: 0,
            gtt_bytes: 0,
            has_memory: false,
            engine_ns: 0,
            has_engine: false,
            clients: HashSet::new(),
        }
    }

    fn add_memory(&mut self, reading: &DescriptorUsage, peaks: &mut ClientPeaks) {
        let fd = &reading.usage;
        self.has_memory = true;

        let Some(client_id) = fd.client_id else {
            self.vram_bytes = self.vram_bytes.saturating_add(fd.vram_bytes);
            self.gtt_bytes = self.gtt_bytes.saturating_add(fd.gtt_bytes);
            return;
        };

        // Every descriptor of a client re-reports the client's running total,
        // so the process is credited with the client's peak exactly once.
        let peak = peaks.entry(client_id).or_default();
        if self.clients.insert(client_id) {
            self.vram_bytes = self.vram_bytes.saturating_add(peak.vram_bytes);
            self.gtt_bytes = self.gtt_bytes.saturating_add(peak.gtt_bytes);
        }
        if fd.vram_bytes > peak.vram_bytes {
            self.vram_bytes = self
                .vram_bytes
                .saturating_add(fd.vram_bytes - peak.vram_bytes);
            peak.vram_bytes = fd.vram_bytes;
        }
        if fd.gtt_bytes > peak.gtt_bytes {
            self.gtt_bytes = self.gtt_bytes.saturating_add(fd.gtt_bytes - peak.gtt_bytes);
            peak.gtt_bytes = fd.gtt_bytes;
        }
    }
}

/// Build the snapshot for one device and the engine baseline for the next
/// scan.
///
/// `peaks` is updated in place; clients that no longer appear in `readings`
/// are forgotten.
pub fn aggregate_device(
    device_id: &str,
    readings: &[DescriptorUsage],
    peaks: &mut ClientPeaks,
    baseline: Option<&EngineBaseline>,
    now: DateTime<Utc>,
) -> (ProcessSnapshot, EngineBaseline) {
    let mut order: Vec<u32> = Vec::new();
    let mut by_pid: HashMap<u32, ProcessAccumulator> = HashMap::new();
    let mut seen_clients: HashSet<u64> = HashSet::new();

    for reading in readings {
        let acc = by_pid.entry(reading.pid).or_insert_with(|| {
            order.push(reading.pid);
            ProcessAccumulator::new(reading)
        });
        if let Some(client_id) = reading.usage.client_id {
            seen_clients.insert(client_id);
        }
        if reading.usage.has_memory {
            acc.add_memory(reading, peaks);
        }
        if reading.usage.has_engine {
            acc.engine_ns = acc.engine_ns.saturating_add(reading.usage.engine_ns);
            acc.has_engine = true;
        }
    }
    peaks.retain(|client_id, _| seen_clients.contains(client_id));

    let mut capabilities = Capabilities::default();
    let mut totals = HashMap::new();
    let mut processes = Vec::with_capacity(order.len());

    for pid in order {
        let Some(acc) = by_pid.remove(&pid) else {
            continue;
        };
        let mut usage = acc.usage;
        if acc.has_memory {
            capabilities.vram_gtt_from_fdinfo = true;
            usage.vram_bytes = Some(acc.vram_bytes);
            usage.gtt_bytes = Some(acc.gtt_bytes);
        }
        if acc.has_engine {
            capabilities.engine_time_from_fdinfo = true;
            totals.insert(pid, acc.engine_ns);
            usage.gpu_time_ms_per_s = engine_rate(baseline, pid, acc.engine_ns, now);
        }
        processes.push(usage);
    }
    sort_processes(&mut processes);

    (
        ProcessSnapshot {
            device_id: device_id.to_string(),
            ts: now,
            capabilities,
            processes,
        },
        EngineBaseline {
            taken_at: now,
            totals,
        },
    )
}
