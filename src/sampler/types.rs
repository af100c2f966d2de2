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

/// GPU telemetry for one tick. Every field is independently nullable and
/// serializes as `null` when the source could not be read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub gpu_busy_pct: Option<f64>,
    pub mem_busy_pct: Option<f64>,
    pub sclk_mhz: Option<f64>,
    pub mclk_mhz: Option<f64>,
    pub temp_c: Option<f64>,
    pub fan_rpm: Option<f64>,
    pub power_w: Option<f64>,
    pub vram_used_bytes: Option<u64>,
    pub vram_total_bytes: Option<u64>,
    pub gtt_used_bytes: Option<u64>,
    pub gtt_total_bytes: Option<u64>,
}

/// One published sample for one device. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    #[serde(rename = "gpu_id")]
    pub device_id: String,
    pub ts: DateTime<Utc>,
    pub metrics: Metrics,
}

impl MetricsSnapshot {
    pub fn new(device_id: impl Into<String>, ts: DateTime<Utc>, metrics: Metrics) -> Self {
        Self {
            device_id: device_id.into(),
            ts,
            metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_serialize_as_null() {
        let snapshot = MetricsSnapshot::new(
            "card0",
            Utc::now(),
            Metrics {
                gpu_busy_pct: Some(12.0),
                ..Metrics::default()
            },
        );
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["gpu_id"], "card0");
        assert_eq!(json["metrics"]["gpu_busy_pct"], 12.0);
        assert!(json["metrics"]["temp_c"].is_null());
        assert!(json["metrics"]["vram_total_bytes"].is_null());
    }
}
