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

//! Sysfs-based DRM card discovery.
//!
//! Walks `<sysfs>/class/drm`, keeps the `cardN` entries (connector entries
//! such as `card0-DP-1` are skipped) and resolves PCI identity, a display
//! name and the render node of each card. Generic names such as the driver
//! name are replaced by the PCI ID database entry when one exists.

use std::fs;
use std::io;
use std::path::Path;

use crate::device::names::{lookup_gpu_name, should_use_resolved_name};
use crate::device::types::DeviceDescriptor;
use crate::error::Result;

const DRM_CLASS_PATH: &str = "class/drm";
const DEV_DRI: &str = "/dev/dri";

/// Enumerate DRM cards below `sysfs_root`, ordered by card index.
///
/// A missing `class/drm` directory yields an empty list; a card whose
/// `device` directory cannot be opened is skipped with a warning.
pub fn discover(sysfs_root: &Path) -> Result<Vec<DeviceDescriptor>> {
    let class_dir = sysfs_root.join(DRM_CLASS_PATH);
    let entries = match fs::read_dir(&class_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            tracing::warn!(path = %class_dir.display(), "drm class path missing");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e.into()),
    };

    let mut cards: Vec<(u32, String)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            card_index(&name).map(|index| (index, name))
        })
        .collect();
    cards.sort();

    let mut devices = Vec::with_capacity(cards.len());
    for (_, card) in cards {
        match load_card(&class_dir.join(&card), &card) {
            Ok(device) => devices.push(device),
            Err(e) => tracing::warn!(card = %card, error = %e, "failed to load card info"),
        }
    }
    Ok(devices)
}

/// Numeric index of a `cardN` entry, `None` for anything else.
pub fn card_index(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("card")?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn load_card(card_dir: &Path, card: &str) -> io::Result<DeviceDescriptor> {
    let device_dir = card_dir.join("device");
    if !device_dir.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", device_dir.display()),
        ));
    }

    let uevent = read_trimmed(&device_dir.join("uevent")).unwrap_or_default();
    let mut pci = uevent_value(&uevent, "PCI_SLOT_NAME").unwrap_or_default();
    let mut pci_id = uevent_value(&uevent, "PCI_ID").unwrap_or_default();
    let mut name = uevent_value(&uevent, "PCI_ID_NAME")
        .or_else(|| uevent_value(&uevent, "DRIVER"))
        .unwrap_or_default();

    if pci.is_empty() {
        // The device symlink points at the PCI function directory.
        if let Ok(target) = fs::read_link(&device_dir) {
            if let Some(slot) = target.file_name() {
                pci = slot.to_string_lossy().into_owned();
            }
        }
    }

    if pci_id.is_empty() {
        if let (Some(vendor), Some(device)) = (
            read_trimmed(&device_dir.join("vendor")),
            read_trimmed(&device_dir.join("device")),
        ) {
            pci_id = format_pci_id(&vendor, &device);
        }
    }

    if let Some(product) = read_trimmed(&device_dir.join("product_name")) {
        if name.is_empty() || name.eq_ignore_ascii_case("amdgpu") {
            name = product;
        }
    }

    let (mut sub_vendor, mut sub_device) = uevent_value(&uevent, "PCI_SUBSYS_ID")
        .and_then(|subsys| {
            subsys
                .split_once(':')
                .map(|(v, d)| (v.to_string(), d.to_string()))
        })
        .unzip();
    if sub_vendor.is_none() {
        sub_vendor = read_trimmed(&device_dir.join("subsystem_vendor"));
    }
    if sub_device.is_none() {
        sub_device = read_trimmed(&device_dir.join("subsystem_device"));
    }

    if should_use_resolved_name(&name) {
        if let Some((vendor, device)) = pci_id.split_once(':') {
            let subsystem = sub_vendor.as_deref().zip(sub_device.as_deref());
            if let Some(resolved) = lookup_gpu_name(vendor, device, subsystem) {
                name = resolved.to_string();
            }
        }
    }
    if name.is_empty() {
        name = card.to_string();
    }

    Ok(DeviceDescriptor {
        id: card.to_string(),
        pci,
        pci_id: pci_id.to_ascii_lowercase(),
        name,
        render_node: find_render_node(&device_dir).unwrap_or_default(),
    })
}

fn find_render_node(device_dir: &Path) -> Option<String> {
    let mut nodes: Vec<String> = fs::read_dir(device_dir.join("drm"))
        .ok()?
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("renderD"))
        .collect();
    nodes.sort();
    nodes
        .into_iter()
        .next()
        .map(|node| format!("{DEV_DRI}/{node}"))
}

fn uevent_value(uevent: &str, key: &str) -> Option<String> {
    uevent.lines().find_map(|line| {
        line.strip_prefix(key)
            .and_then(|rest| rest.strip_prefix('='))
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn format_pci_id(vendor: &str, device: &str) -> String {
    let vendor = vendor.trim_start_matches("0x");
    let device = device.trim_start_matches("0x");
    format!("{vendor}:{device}")
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_card_index() {
        assert_eq!(card_index("card0"), Some(0));
        assert_eq!(card_index("card12"), Some(12));
        assert_eq!(card_index("card0-DP-1"), None);
        assert_eq!(card_index("renderD128"), None);
        assert_eq!(card_index("card"), None);
    }

    #[test]
    fn test_missing_class_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        assert!(discover(tmp.path()).unwrap().is_empty());
    }

    #[test]
    fn test_discover_reads_uevent_and_render_node() {
        let tmp = TempDir::new().unwrap();
        let drm = tmp.path().join("class/drm");
        write(
            &drm.join("card0/device/uevent"),
            "DRIVER=amdgpu\nPCI_ID=1002:73BF\nPCI_SLOT_NAME=0000:03:00.0\n",
        );
        fs::create_dir_all(drm.join("card0/device/drm/renderD128")).unwrap();
        fs::create_dir_all(drm.join("card0/device/drm/card0")).unwrap();
        fs::create_dir_all(drm.join("card0-DP-1")).unwrap();

        write(&drm.join("card10/device/vendor"), "0x1002\n");
        write(&drm.join("card10/device/device"), "0x744c\n");
        write(
            &drm.join("card10/device/product_name"),
            "Radeon RX 7900 XTX\n",
        );
        write(&drm.join("card2/device/uevent"), "DRIVER=amdgpu\n");

        let devices = discover(tmp.path()).unwrap();
        let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["card0", "card2", "card10"]);

        assert_eq!(devices[0].pci, "0000:03:00.0");
        assert_eq!(devices[0].pci_id, "1002:73bf");
        assert_eq!(
            Some(devices[0].name.as_str()),
            lookup_gpu_name("1002", "73bf", None)
        );
        assert_ne!(devices[0].name, "amdgpu");
        assert_eq!(devices[0].render_node, "/dev/dri/renderD128");

        assert_eq!(devices[2].pci_id, "1002:744c");
        assert_eq!(devices[2].name, "Radeon RX 7900 XTX");
        assert_eq!(devices[2].render_node, "");
    }

    #[test]
    fn test_name_falls_back_when_ids_are_unknown() {
        let tmp = TempDir::new().unwrap();
        let drm = tmp.path().join("class/drm");
        write(
            &drm.join("card0/device/uevent"),
            "DRIVER=amdgpu\nPCI_ID=FFFF:FFFF\nPCI_SUBSYS_ID=FFFF:FFFF\n",
        );
        write(&drm.join("card1/device/vendor"), "0xffff\n");
        write(&drm.join("card1/device/device"), "0xfffe\n");

        let devices = discover(tmp.path()).unwrap();
        assert_eq!(devices[0].name, "amdgpu");
        assert_eq!(devices[1].pci_id, "ffff:fffe");
        assert_eq!(devices[1].name, "card1");
    }

    #[test]
    fn test_subsystem_name_from_sysfs_files() {
        let product = pci_ids::Device::from_vid_pid(0x1002, 0x73bf).unwrap();
        let Some(board) = product.subsystems().find(|sub| !sub.name().is_empty()) else {
            return;
        };
        let tmp = TempDir::new().unwrap();
        let device = tmp.path().join("class/drm/card0/device");
        write(&device.join("uevent"), "DRIVER=amdgpu\nPCI_ID=1002:73BF\n");
        write(
            &device.join("subsystem_vendor"),
            &format!("0x{:04x}\n", board.subvendor()),
        );
        write(
            &device.join("subsystem_device"),
            &format!("0x{:04x}\n", board.subdevice()),
        );

        let devices = discover(tmp.path()).unwrap();
        assert_eq!(devices[0].name, board.name());
    }

    #[test]
    fn test_card_without_device_dir_is_skipped() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("class/drm/card0")).unwrap();
        assert!(discover(tmp.path()).unwrap().is_empty());
    }
}
