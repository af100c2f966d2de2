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

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::common::config::{parse_duration, AppConfig};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Address the HTTP/WebSocket server binds to (":8080" binds all interfaces).
    #[arg(long, env = "APP_LISTEN_ADDR", default_value = AppConfig::DEFAULT_LISTEN_ADDR)]
    pub listen_addr: String,

    /// Interval between metric samples, e.g. "500ms", "2s", "1m" or bare milliseconds.
    #[arg(long, env = "APP_SAMPLE_INTERVAL", default_value = "2s", value_parser = parse_duration)]
    pub sample_interval: Duration,

    /// Comma separated list of allowed WebSocket origins ("*" allows any).
    #[arg(
        long,
        env = "APP_ALLOWED_ORIGINS",
        default_value = "*",
        value_delimiter = ','
    )]
    pub allowed_origins: Vec<String>,

    /// GPU a new session subscribes to first ("auto" picks the first discovered GPU).
    #[arg(long, env = "APP_DEFAULT_GPU", default_value = AppConfig::DEFAULT_GPU_AUTO)]
    pub default_gpu: String,

    /// Log level: trace, debug, info, warn or error. RUST_LOG takes precedence.
    #[arg(long, env = "APP_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Root of the sysfs mount used for discovery and sampling.
    #[arg(long, env = "APP_SYSFS_ROOT", default_value = "/sys")]
    pub sysfs_root: PathBuf,

    /// Root of debugfs, used as a fallback source for clock readings.
    #[arg(long, env = "APP_DEBUGFS_ROOT", default_value = "/sys/kernel/debug")]
    pub debugfs_root: PathBuf,

    /// Root of procfs scanned for per-process GPU usage.
    #[arg(long, env = "APP_PROC_ROOT", default_value = "/proc")]
    pub proc_root: PathBuf,

    /// Maximum number of concurrent WebSocket sessions.
    #[arg(long, env = "APP_WS_MAX_CLIENTS", default_value_t = AppConfig::DEFAULT_WS_MAX_CLIENTS)]
    pub ws_max_clients: usize,

    /// Time allowed for a single WebSocket frame write.
    #[arg(long, env = "APP_WS_WRITE_TIMEOUT", default_value = "3s", value_parser = parse_duration)]
    pub ws_write_timeout: Duration,

    /// Enable the per-process GPU usage scanner.
    #[arg(
        long,
        env = "APP_PROC_ENABLE",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub proc_enable: bool,

    /// Interval between process scans.
    #[arg(long, env = "APP_PROC_SCAN_INTERVAL", default_value = "2s", value_parser = parse_duration)]
    pub proc_scan_interval: Duration,

    /// Maximum number of GPU-using processes collected per scan.
    #[arg(long, env = "APP_PROC_MAX_PIDS", default_value_t = AppConfig::DEFAULT_PROC_MAX_PIDS)]
    pub proc_max_pids: usize,

    /// Maximum number of file descriptors inspected per process.
    #[arg(long, env = "APP_PROC_MAX_FDS_PER_PID", default_value_t = AppConfig::DEFAULT_PROC_MAX_FDS_PER_PID)]
    pub proc_max_fds_per_pid: usize,
}
