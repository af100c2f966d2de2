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

//! Marketing names from the PCI ID database bundled by `pci-ids`.

use pci_ids::Device;

/// Resolve a device name for `vendor:device`, preferring the subsystem
/// entry when the board vendor ids are known. Ids are hex, with or without
/// a `0x` prefix.
pub fn lookup_gpu_name(
    vendor: &str,
    device: &str,
    subsystem: Option<(&str, &str)>,
) -> Option<&'static str> {
    let product = Device::from_vid_pid(parse_pci_hex(vendor)?, parse_pci_hex(device)?)?;

    let subsystem =
        subsystem.and_then(|(sv, sd)| Some((parse_pci_hex(sv)?, parse_pci_hex(sd)?)));
    if let Some((subvendor, subdevice)) = subsystem {
        let board = product
            .subsystems()
            .find(|sub| sub.subvendor() == subvendor && sub.subdevice() == subdevice)
            .map(|sub| sub.name())
            .filter(|name| !name.is_empty());
        if board.is_some() {
            return board;
        }
    }

    Some(product.name()).filter(|name| !name.is_empty())
}

/// Whether `current` is a placeholder that a database name should replace.
pub fn should_use_resolved_name(current: &str) -> bool {
    let lower = current.trim().to_ascii_lowercase();
    lower.is_empty()
        || matches!(lower.as_str(), "amdgpu" | "radeon" | "unknown")
        || lower.starts_with("pci device")
        || lower.starts_with("0x")
}

fn parse_pci_hex(raw: &str) -> Option<u16> {
    let value = raw.trim();
    let value = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    if value.is_empty() {
        return None;
    }
    u16::from_str_radix(value, 16).ok()
}
