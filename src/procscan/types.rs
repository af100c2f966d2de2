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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-device result of one process scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    #[serde(rename = "gpu_id")]
    pub device_id: String,
    pub ts: DateTime<Utc>,
    pub capabilities: Capabilities,
    /// Heaviest consumer first.
    pub processes: Vec<ProcessUsage>,
}

/// Which kinds of data at least one process produced during the scan, so a
/// viewer can tell "zero usage" apart from "not available".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub vram_gtt_from_fdinfo: bool,
    pub engine_time_from_fdinfo: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessUsage {
    pub pid: u32,
    pub uid: u32,
    pub user: String,
    pub name: String,
    pub cmd: String,
    /// Basename of the matched render node, e.g. "renderD128".
    pub render_node: String,
    pub vram_bytes: Option<u64>,
    pub gtt_bytes: Option<u64>,
    /// Milliseconds of engine time per wall-clock second since the last scan.
    pub gpu_time_ms_per_s: Option<f64>,
}

impl ProcessUsage {
    /// VRAM + GTT with missing values counted as zero.
    pub fn memory_total(&self) -> u64 {
        self.vram_bytes
            .unwrap_or(0)
            .saturating_add(self.gtt_bytes.unwrap_or(0))
    }
}

/// Usage parsed from one descriptor's fdinfo blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FdUsage {
    pub vram_bytes: u64,
    pub gtt_bytes: u64,
    pub has_memory: bool,
    /// Sum of all engine busy times, in nanoseconds.
    pub engine_ns: u64,
    pub has_engine: bool,
    pub client_id: Option<u64>,
}

/// One matched descriptor of one process, before deduplication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorUsage {
    pub pid: u32,
    pub uid: u32,
    pub user: String,
    pub name: String,
    pub cmd: String,
    pub render_node: String,
    pub usage: FdUsage,
}
