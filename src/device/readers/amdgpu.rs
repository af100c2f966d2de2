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

//! amdgpu telemetry read from sysfs, with an optional debugfs fallback.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::device::discovery::card_index;
use crate::device::traits::MetricsReader;
use crate::error::{Error, Result};
use crate::parsing::common::{extract_clock_mhz, extract_first_float, parse_number};
use crate::sampler::types::{Metrics, MetricsSnapshot};

const GPU_BUSY_FILE: &str = "gpu_busy_percent";
const MEM_BUSY_FILE: &str = "mem_busy_percent";
const SCLK_FILE: &str = "pp_dpm_sclk";
const MCLK_FILE: &str = "pp_dpm_mclk";
const VRAM_USED_FILE: &str = "mem_info_vram_used";
const VRAM_TOTAL_FILE: &str = "mem_info_vram_total";
const GTT_USED_FILE: &str = "mem_info_gtt_used";
const GTT_TOTAL_FILE: &str = "mem_info_gtt_total";
const HWMON_TEMP_FILE: &str = "temp1_input";
const HWMON_FAN_FILE: &str = "fan1_input";
const HWMON_POWER_AVERAGE_FILE: &str = "power1_average";
const HWMON_POWER_INPUT_FILE: &str = "power1_input";
const DEBUG_PM_INFO_FILE: &str = "amdgpu_pm_info";

/// Reads one card's metrics from `<sysfs>/class/drm/<card>/device`.
pub struct SysfsReader {
    card_id: String,
    device_dir: PathBuf,
    hwmon_dir: Option<PathBuf>,
    debug_dir: Option<PathBuf>,
}

impl SysfsReader {
    /// Build a reader for `card_id` (e.g. "card0").
    ///
    /// Fails when the card id is malformed or its device directory is
    /// missing; the caller excludes such devices from sampling.
    pub fn new(card_id: &str, sysfs_root: &Path, debugfs_root: &Path) -> Result<Self> {
        let index = card_index(card_id).ok_or_else(|| Error::ReaderInit {
            device: card_id.to_string(),
            reason: "invalid card id".to_string(),
        })?;

        let device_dir = sysfs_root.join("class/drm").join(card_id).join("device");
        if !device_dir.is_dir() {
            return Err(Error::ReaderInit {
                device: card_id.to_string(),
                reason: format!("{} is not a directory", device_dir.display()),
            });
        }

        let debug_dir = Some(debugfs_root.join("dri").join(index.to_string()))
            .filter(|dir| dir.is_dir());

        Ok(Self {
            card_id: card_id.to_string(),
            hwmon_dir: detect_hwmon(&device_dir),
            device_dir,
            debug_dir,
        })
    }

    fn read_percent(&self, name: &str) -> Option<f64> {
        let value: f64 = read_value(&self.device_dir.join(name))?;
        if value < 0.0 {
            return None;
        }
        if value > 100.0 {
            // Some kernels report busy % scaled by 100.
            return Some((value / 100.0).clamp(0.0, 100.0));
        }
        Some(value)
    }

    fn read_current_clock(&self, name: &str) -> Option<f64> {
        let contents = fs::read_to_string(self.device_dir.join(name)).ok()?;
        contents
            .lines()
            .filter(|line| line.contains('*'))
            .find_map(extract_clock_mhz)
    }

    fn read_hwmon(&self, name: &str, divisor: f64) -> Option<f64> {
        let dir = self.hwmon_dir.as_ref()?;
        read_value::<f64>(&dir.join(name)).map(|value| value / divisor)
    }

    fn read_debug_info(&self) -> DebugInfo {
        let Some(dir) = &self.debug_dir else {
            return DebugInfo::default();
        };
        match fs::read_to_string(dir.join(DEBUG_PM_INFO_FILE)) {
            Ok(contents) => DebugInfo::parse(&contents),
            Err(e) => {
                tracing::trace!(gpu_id = %self.card_id, error = %e, "debugfs pm info unavailable");
                DebugInfo::default()
            }
        }
    }
}

impl MetricsReader for SysfsReader {
    fn device_id(&self) -> &str {
        &self.card_id
    }

    fn sample(&self) -> MetricsSnapshot {
        let ts = Utc::now();
        let mut metrics = Metrics {
            gpu_busy_pct: self.read_percent(GPU_BUSY_FILE),
            mem_busy_pct: self.read_percent(MEM_BUSY_FILE),
            sclk_mhz: self.read_current_clock(SCLK_FILE),
            mclk_mhz: self.read_current_clock(MCLK_FILE),
            temp_c: self.read_hwmon(HWMON_TEMP_FILE, 1_000.0),
            fan_rpm: self.read_hwmon(HWMON_FAN_FILE, 1.0),
            power_w: self
                .read_hwmon(HWMON_POWER_AVERAGE_FILE, 1_000_000.0)
                .or_else(|| self.read_hwmon(HWMON_POWER_INPUT_FILE, 1_000_000.0)),
            vram_used_bytes: read_value(&self.device_dir.join(VRAM_USED_FILE)),
            vram_total_bytes: read_value(&self.device_dir.join(VRAM_TOTAL_FILE)),
            gtt_used_bytes: read_value(&self.device_dir.join(GTT_USED_FILE)),
            gtt_total_bytes: read_value(&self.device_dir.join(GTT_TOTAL_FILE)),
        };

        let incomplete = metrics.gpu_busy_pct.is_none()
            || metrics.sclk_mhz.is_none()
            || metrics.mclk_mhz.is_none()
            || metrics.power_w.is_none()
            || metrics.temp_c.is_none();
        if incomplete {
            let info = self.read_debug_info();
            metrics.gpu_busy_pct = metrics.gpu_busy_pct.or(info.gpu_load);
            metrics.sclk_mhz = metrics.sclk_mhz.or(info.sclk_mhz);
            metrics.mclk_mhz = metrics.mclk_mhz.or(info.mclk_mhz);
            metrics.power_w = metrics.power_w.or(info.power_w);
            metrics.temp_c = metrics.temp_c.or(info.temp_c);
        }

        MetricsSnapshot::new(self.card_id.clone(), ts, metrics)
    }
}

/// Values recovered from `amdgpu_pm_info` in debugfs.
#[derive(Debug, Default, PartialEq)]
struct DebugInfo {
    gpu_load: Option<f64>,
    sclk_mhz: Option<f64>,
    mclk_mhz: Option<f64>,
    temp_c: Option<f64>,
    power_w: Option<f64>,
}

impl DebugInfo {
    fn parse(contents: &str) -> Self {
        let mut info = Self::default();
        for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let lower = line.to_ascii_lowercase();
            let value = extract_first_float(line);
            if lower.starts_with("gpu load") {
                info.gpu_load = value.or(info.gpu_load);
            } else if lower.starts_with("sclk") || lower.starts_with("average gfxclk") {
                info.sclk_mhz = value.or(info.sclk_mhz);
            } else if lower.starts_with("mclk") || lower.starts_with("average memclk") {
                info.mclk_mhz = value.or(info.mclk_mhz);
            } else if lower.starts_with("gpu temperature") {
                info.temp_c = value.or(info.temp_c);
            } else if lower.starts_with("gpu power") || lower.starts_with("power:") {
                info.power_w = value.or(info.power_w);
            } else if lower.contains("gpu load") && info.gpu_load.is_none() {
                info.gpu_load = value;
            }
        }
        info
    }
}

fn detect_hwmon(device_dir: &Path) -> Option<PathBuf> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(device_dir.join("hwmon"))
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();
    dirs.into_iter().next()
}

fn read_value<T: std::str::FromStr>(path: &Path) -> Option<T> {
    let contents = fs::read_to_string(path).ok()?;
    let value = parse_number(&contents);
    if value.is_none() && !contents.trim().is_empty() {
        tracing::debug!(path = %path.display(), value = %contents.trim(), "failed to parse sysfs value");
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn card_dir(root: &Path) -> PathBuf {
        root.join("sys/class/drm/card0/device")
    }

    #[test]
    fn test_new_rejects_bad_card() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            SysfsReader::new("renderD128", tmp.path(), tmp.path()),
            Err(Error::ReaderInit { .. })
        ));
        assert!(matches!(
            SysfsReader::new("card0", tmp.path(), tmp.path()),
            Err(Error::ReaderInit { .. })
        ));
    }

    #[test]
    fn test_sample_reads_sysfs_and_hwmon() {
        let tmp = TempDir::new().unwrap();
        let device = card_dir(tmp.path());
        write(&device.join(GPU_BUSY_FILE), "37\n");
        write(&device.join(MEM_BUSY_FILE), "1250\n");
        write(&device.join(SCLK_FILE), "0: 500Mhz\n1: 2100Mhz *\n");
        write(&device.join(MCLK_FILE), "0: 96Mhz *\n1: 1000Mhz\n");
        write(&device.join(VRAM_USED_FILE), "1048576\n");
        write(&device.join(VRAM_TOTAL_FILE), "17163091968\n");
        write(&device.join(GTT_USED_FILE), "garbage\n");
        write(&device.join("hwmon/hwmon3").join(HWMON_TEMP_FILE), "54000\n");
        write(&device.join("hwmon/hwmon3").join(HWMON_FAN_FILE), "1200\n");
        write(
            &device.join("hwmon/hwmon3").join(HWMON_POWER_INPUT_FILE),
            "45000000\n",
        );

        let reader =
            SysfsReader::new("card0", &tmp.path().join("sys"), &tmp.path().join("debug")).unwrap();
        let snapshot = reader.sample();
        let m = snapshot.metrics;

        assert_eq!(snapshot.device_id, "card0");
        assert_eq!(m.gpu_busy_pct, Some(37.0));
        assert_eq!(m.mem_busy_pct, Some(12.5));
        assert_eq!(m.sclk_mhz, Some(2100.0));
        assert_eq!(m.mclk_mhz, Some(96.0));
        assert_eq!(m.vram_used_bytes, Some(1_048_576));
        assert_eq!(m.vram_total_bytes, Some(17_163_091_968));
        assert_eq!(m.gtt_used_bytes, None);
        assert_eq!(m.gtt_total_bytes, None);
        assert_eq!(m.temp_c, Some(54.0));
        assert_eq!(m.fan_rpm, Some(1200.0));
        assert_eq!(m.power_w, Some(45.0));
    }

    #[test]
    fn test_debugfs_fills_missing_fields() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(card_dir(tmp.path())).unwrap();
        write(
            &tmp.path().join("debug/dri/0").join(DEBUG_PM_INFO_FILE),
            "GFX Clocks and Power:\n\t1800 MHz (MCLK)\n\tSCLK: 1,200 MHz\n\
             GPU Temperature: 61 C\nGPU Load: 88 %\n",
        );

        let reader =
            SysfsReader::new("card0", &tmp.path().join("sys"), &tmp.path().join("debug")).unwrap();
        let m = reader.sample().metrics;
        assert_eq!(m.gpu_busy_pct, Some(88.0));
        assert_eq!(m.sclk_mhz, Some(1200.0));
        assert_eq!(m.temp_c, Some(61.0));
        assert_eq!(m.power_w, None);
    }

    #[test]
    fn test_debug_info_parse() {
        let info = DebugInfo::parse("average GFXCLK: 2000 MHz\naverage MEMCLK: 900 MHz\npower: 30.5 W\n");
        assert_eq!(info.sclk_mhz, Some(2000.0));
        assert_eq!(info.mclk_mhz, Some(900.0));
        assert_eq!(info.power_w, Some(30.5));
        assert_eq!(info.gpu_load, None);
    }
}
