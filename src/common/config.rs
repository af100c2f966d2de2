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

use crate::cli::Cli;
use crate::error::{Error, Result};

/// Application configuration constants
pub struct AppConfig;

impl AppConfig {
    // Server
    pub const DEFAULT_LISTEN_ADDR: &'static str = ":8080";
    pub const DEFAULT_GPU_AUTO: &'static str = "auto";

    // WebSocket sessions
    pub const DEFAULT_WS_MAX_CLIENTS: usize = 1024;
    pub const OUTBOUND_QUEUE_CAPACITY: usize = 16;
    pub const INBOUND_CHANNEL_CAPACITY: usize = 8;

    // Process scanner
    pub const DEFAULT_PROC_MAX_PIDS: usize = 5000;
    pub const DEFAULT_PROC_MAX_FDS_PER_PID: usize = 64;
    pub const CMDLINE_MAX_CHARS: usize = 256;
}

/// WebSocket tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsConfig {
    pub max_clients: usize,
    pub write_timeout: Duration,
}

/// Process scanner tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcConfig {
    pub enable: bool,
    pub scan_interval: Duration,
    pub max_pids: usize,
    pub max_fds_per_pid: usize,
}

impl Default for ProcConfig {
    fn default() -> Self {
        Self {
            enable: true,
            scan_interval: Duration::from_secs(2),
            max_pids: AppConfig::DEFAULT_PROC_MAX_PIDS,
            max_fds_per_pid: AppConfig::DEFAULT_PROC_MAX_FDS_PER_PID,
        }
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub listen_addr: String,
    pub sample_interval: Duration,
    pub allowed_origins: Vec<String>,
    pub default_gpu: String,
    pub log_level: String,
    pub sysfs_root: PathBuf,
    pub debugfs_root: PathBuf,
    pub proc_root: PathBuf,
    pub ws: WsConfig,
    pub proc: ProcConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: AppConfig::DEFAULT_LISTEN_ADDR.to_string(),
            sample_interval: Duration::from_secs(2),
            allowed_origins: vec!["*".to_string()],
            default_gpu: AppConfig::DEFAULT_GPU_AUTO.to_string(),
            log_level: "info".to_string(),
            sysfs_root: PathBuf::from("/sys"),
            debugfs_root: PathBuf::from("/sys/kernel/debug"),
            proc_root: PathBuf::from("/proc"),
            ws: WsConfig {
                max_clients: AppConfig::DEFAULT_WS_MAX_CLIENTS,
                write_timeout: Duration::from_secs(3),
            },
            proc: ProcConfig::default(),
        }
    }
}

impl Config {
    /// Build and validate a configuration from parsed command line arguments.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let config = Self {
            listen_addr: cli.listen_addr.trim().to_string(),
            sample_interval: cli.sample_interval,
            allowed_origins: cli
                .allowed_origins
                .iter()
                .map(|origin| origin.trim())
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect(),
            default_gpu: cli.default_gpu.trim().to_string(),
            log_level: cli.log_level.trim().to_ascii_lowercase(),
            sysfs_root: cli.sysfs_root.clone(),
            debugfs_root: cli.debugfs_root.clone(),
            proc_root: cli.proc_root.clone(),
            ws: WsConfig {
                max_clients: cli.ws_max_clients,
                write_timeout: cli.ws_write_timeout,
            },
            proc: ProcConfig {
                enable: cli.proc_enable,
                scan_interval: cli.proc_scan_interval,
                max_pids: cli.proc_max_pids,
                max_fds_per_pid: cli.proc_max_fds_per_pid,
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::InvalidConfig("listen address must not be empty".into()));
        }
        if self.sample_interval.is_zero() {
            return Err(Error::InvalidConfig("sample interval must be > 0".into()));
        }
        if self.allowed_origins.is_empty() {
            return Err(Error::InvalidConfig("allowed origins must not be empty".into()));
        }
        if self.ws.max_clients == 0 {
            return Err(Error::InvalidConfig("ws max clients must be > 0".into()));
        }
        if self.ws.write_timeout.is_zero() {
            return Err(Error::InvalidConfig("ws write timeout must be > 0".into()));
        }
        if self.proc.scan_interval.is_zero() {
            return Err(Error::InvalidConfig("proc scan interval must be > 0".into()));
        }
        if self.proc.max_pids == 0 {
            return Err(Error::InvalidConfig("proc max pids must be > 0".into()));
        }
        if self.proc.max_fds_per_pid == 0 {
            return Err(Error::InvalidConfig("proc max fds per pid must be > 0".into()));
        }
        if !matches!(
            self.log_level.as_str(),
            "trace" | "debug" | "info" | "warn" | "warning" | "error"
        ) {
            return Err(Error::InvalidConfig(format!(
                "unsupported log level {:?}",
                self.log_level
            )));
        }
        Ok(())
    }

    /// Socket address suitable for `TcpListener::bind`; a bare ":port" binds
    /// every interface.
    pub fn bind_addr(&self) -> String {
        if self.listen_addr.starts_with(':') {
            format!("0.0.0.0{}", self.listen_addr)
        } else {
            self.listen_addr.clone()
        }
    }

    /// Configured default GPU, or `None` when discovery order should decide.
    pub fn preferred_gpu(&self) -> Option<&str> {
        let gpu = self.default_gpu.as_str();
        if gpu.is_empty() || gpu.eq_ignore_ascii_case(AppConfig::DEFAULT_GPU_AUTO) {
            None
        } else {
            Some(gpu)
        }
    }

    /// Filter directive for `tracing_subscriber::EnvFilter`.
    pub fn log_filter(&self) -> String {
        let level = match self.log_level.as_str() {
            "warning" => "warn",
            other => other,
        };
        format!("gputop_web={level},tower_http={level}")
    }

    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.iter().any(|allowed| allowed == "*") {
            return true;
        }
        match origin {
            // Non-browser clients send no Origin header.
            None => true,
            Some(origin) => self
                .allowed_origins
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(origin)),
        }
    }
}

/// Parse a duration such as "500ms", "2s", "1m", "1h" or a bare number of
/// milliseconds.
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let value = input.trim();
    if value.is_empty() {
        return Err("empty duration".to_string());
    }

    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration {input:?}"))?;

    let millis = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "ms" => number,
        "us" | "µs" => number / 1_000.0,
        "s" => number * 1_000.0,
        "m" => number * 60_000.0,
        "h" => number * 3_600_000.0,
        other => return Err(format!("unknown duration unit {other:?} in {input:?}")),
    };

    if !millis.is_finite() || millis < 0.0 {
        return Err(format!("invalid duration {input:?}"));
    }
    Duration::try_from_secs_f64(millis / 1_000.0)
        .map_err(|_| format!("invalid duration {input:?}"))
}
