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

// Common parsing utilities for number extraction and unit conversion of
// kernel-exposed text (sysfs, debugfs, procfs).

use std::str::FromStr;

/// Parse a number from a string after sanitizing by removing commas, underscores, and trimming.
/// Returns None if parsing fails.
pub fn parse_number<T: FromStr>(s: &str) -> Option<T> {
    let cleaned = s.trim().replace([',', '_'], "");
    cleaned.parse::<T>().ok()
}

/// Convert a quantity with a memory unit into bytes.
///
/// Supported units (case-insensitive): "", B, byte, bytes, KB, KiB, MB, MiB,
/// GB, GiB. The kernel reports binary multiples under both spellings, so
/// "KB" and "KiB" are both 1024. Negative or non-finite values yield `None`.
pub fn binary_bytes(value: f64, unit: &str) -> Option<u64> {
    let mul = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" | "byte" | "bytes" => 1.0,
        "kb" | "kib" => 1024.0,
        "mb" | "mib" => 1024.0_f64.powi(2),
        "gb" | "gib" => 1024.0_f64.powi(3),
        _ => return None,
    };
    let bytes = value * mul;
    if bytes.is_finite() && bytes >= 0.0 {
        Some(bytes as u64)
    } else {
        None
    }
}

/// Convert a quantity with a time unit (ns, us, ms, s) into nanoseconds.
pub fn to_nanos(value: f64, unit: &str) -> Option<u64> {
    let mul = match unit.trim().to_ascii_lowercase().as_str() {
        "ns" => 1.0,
        "us" => 1_000.0,
        "ms" => 1_000_000.0,
        "s" => 1_000_000_000.0,
        _ => return None,
    };
    let nanos = value * mul;
    if nanos.is_finite() && nanos >= 0.0 {
        Some(nanos as u64)
    } else {
        None
    }
}

/// Extract the substring that appears after the first ':' character, trimmed.
/// Returns None if ':' is not present.
pub fn after_colon_trimmed(line: &str) -> Option<&str> {
    line.split_once(':').map(|x| x.1).map(|s| s.trim())
}

/// Return the first number embedded in a free-form line such as
/// "GPU Load: 42 %" or "SCLK: 1,200 MHz". Thousands separators inside the
/// number are skipped.
pub fn extract_first_float(line: &str) -> Option<f64> {
    let mut buf = String::new();
    for ch in line.chars() {
        if ch.is_ascii_digit() || ch == '.' || (ch == '-' && buf.is_empty()) {
            buf.push(ch);
        } else if !buf.is_empty() {
            if ch == ',' {
                continue;
            }
            break;
        }
    }
    if buf.is_empty() {
        return None;
    }
    buf.parse().ok()
}

/// Parse the clock of a `pp_dpm_*` level line such as "1: 1800Mhz *".
pub fn extract_clock_mhz(line: &str) -> Option<f64> {
    line.trim()
        .trim_end_matches('*')
        .split_whitespace()
        .map(|field| field.trim_end_matches('*').to_ascii_lowercase())
        .find_map(|field| field.strip_suffix("mhz").and_then(|v| v.parse().ok()))
}

/// The last whitespace-separated token of `line` that parses as an integer,
/// ignoring surrounding parentheses and commas.
pub fn last_integer_token<T: FromStr>(line: &str) -> Option<T> {
    line.split_whitespace()
        .rev()
        .map(|token| token.trim_matches(|c| c == '(' || c == ')' || c == ','))
        .filter(|token| !token.is_empty())
        .find_map(|token| token.parse::<T>().ok())
}
