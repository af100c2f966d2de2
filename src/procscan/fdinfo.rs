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

//! Parser for DRM fdinfo blobs (`/proc/<pid>/fdinfo/<fd>`).
//!
//! The parser is line oriented and tracks one of three sections. A line
//! starting with `drm-memory` enters the memory section and a line starting
//! with `drm-engine` enters the engine section; the remainder of such a line
//! (e.g. `vram: 1024 KiB` out of `drm-memory-vram: 1024 KiB`) is then parsed
//! within the new section. Memory keys are also recognised before any
//! section header, which covers kernels that only expose
//! `amd-requested-*` totals.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::parsing::common::{binary_bytes, last_integer_token, to_nanos};
use crate::procscan::types::FdUsage;

static BYTES_VALUE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([-+]?\d+(?:\.\d+)?)\s*(bytes?|byte|kib|kb|mib|mb|gib|gb|b)?")
        .expect("bytes pattern is valid")
});

static ENGINE_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([-+]?\d+(?:\.\d+)?)\s*(ns|us|ms|s)").expect("engine pattern is valid"));

const MEMORY_HEADER: &str = "drm-memory";
const ENGINE_HEADER: &str = "drm-engine";
const CLIENT_ID_KEY: &str = "drm-client-id";

const VRAM_KEYS: [&str; 3] = ["vram", "drm-memory-vram", "amd-requested-vram"];
const GTT_KEYS: [&str; 3] = ["gtt", "drm-memory-gtt", "amd-requested-gtt"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Memory,
    Engine,
}

/// Parse one fdinfo blob into per-descriptor usage.
///
/// Within one descriptor the largest VRAM and GTT values win; engine times
/// are summed in nanoseconds.
pub fn parse_fdinfo(contents: &str) -> FdUsage {
    let mut usage = FdUsage::default();
    let mut section = Section::None;

    for raw in contents.lines() {
        let mut line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let mut lower = line.to_ascii_lowercase();

        if lower.starts_with(CLIENT_ID_KEY) {
            // Zero means the driver did not assign a client.
            if let Some(id) = last_integer_token::<u64>(line).filter(|&id| id > 0) {
                usage.client_id = Some(id);
            }
            continue;
        }

        for (header, target) in [
            (MEMORY_HEADER, Section::Memory),
            (ENGINE_HEADER, Section::Engine),
        ] {
            if lower.starts_with(header) {
                section = target;
                line = line[header.len()..].trim_start_matches([':', '-', ' ', '\t']);
                lower = line.to_ascii_lowercase();
                break;
            }
        }
        if line.is_empty() {
            continue;
        }

        match section {
            Section::None | Section::Memory => {
                if has_prefix(&lower, &VRAM_KEYS) {
                    if let Some(value) = parse_bytes_value(&lower) {
                        usage.vram_bytes = usage.vram_bytes.max(value);
                        usage.has_memory = true;
                    }
                } else if has_prefix(&lower, &GTT_KEYS) {
                    if let Some(value) = parse_bytes_value(&lower) {
                        usage.gtt_bytes = usage.gtt_bytes.max(value);
                        usage.has_memory = true;
                    }
                }
            }
            Section::Engine => {
                if let Some(value) = parse_engine_value(&lower) {
                    usage.engine_ns = usage.engine_ns.saturating_add(value);
                    usage.has_engine = true;
                }
            }
        }
    }

    usage
}

fn has_prefix(lower: &str, keys: &[&str]) -> bool {
    keys.iter().any(|key| lower.starts_with(key))
}

/// Last `<number>[unit]` token of a memory line, in bytes.
fn parse_bytes_value(lower: &str) -> Option<u64> {
    let caps = BYTES_VALUE.captures_iter(value_part(lower)).last()?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    binary_bytes(value, caps.get(2).map_or("", |m| m.as_str()))
}

/// Last `<number><time unit>` token of an engine line, in nanoseconds.
fn parse_engine_value(lower: &str) -> Option<u64> {
    let caps = ENGINE_VALUE.captures_iter(value_part(lower)).last()?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    to_nanos(value, caps.get(2)?.as_str())
}

/// Text after the key, so digits inside key names (e.g. `compute0`) are not
/// mistaken for values.
fn value_part(lower: &str) -> &str {
    lower.split_once(':').map_or(lower, |(_, value)| value)
}
