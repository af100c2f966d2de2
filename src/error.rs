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

//! Error types shared by the samplers, the process scanner and the
//! WebSocket sessions.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A configuration value was rejected during validation.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The requested GPU is not tracked by the component that was asked.
    ///
    /// The message text is forwarded verbatim to WebSocket clients as a
    /// soft `error` frame.
    #[error("unknown gpu {0:?}")]
    UnknownDevice(String),

    /// The component exists in the code base but is disabled at runtime
    /// (e.g. the process scanner with `--proc-enable=false`).
    #[error("{0} unavailable")]
    FeatureDisabled(&'static str),

    /// A per-device metrics reader could not be constructed.
    ///
    /// The device is excluded from sampling; discovery output still lists it.
    #[error("Metrics reader initialization failed for {device}: {reason}")]
    ReaderInit { device: String, reason: String },

    /// A whole process scan failed, typically because the proc root is gone
    /// or unreadable. Individual vanished processes never produce this.
    #[error("Process scan failed: {0}")]
    ScanFailed(String),

    /// Reading from or writing to a session transport failed.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
