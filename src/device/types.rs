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

use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Identity of one DRM card, resolved once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Card name under `class/drm`, e.g. "card0". Used as the device key everywhere.
    pub id: String,
    /// PCI slot, e.g. "0000:03:00.0".
    pub pci: String,
    /// PCI vendor:device pair, e.g. "1002:73bf".
    pub pci_id: String,
    pub name: String,
    /// Render node path, e.g. "/dev/dri/renderD128". Empty when the card has none.
    pub render_node: String,
}

/// Read-only, ordered set of discovered devices shared by both managers and
/// the HTTP layer. Cloning is cheap.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: Arc<Vec<DeviceDescriptor>>,
}

impl DeviceRegistry {
    pub fn new(devices: Vec<DeviceDescriptor>) -> Self {
        Self {
            devices: Arc::new(devices),
        }
    }

    pub fn get(&self, id: &str) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|device| device.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> Vec<String> {
        self.devices.iter().map(|device| device.id.clone()).collect()
    }

    pub fn descriptors(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// The device a new session binds to: `preferred` when it names a known
    /// device, otherwise the first discovered one.
    pub fn default_device(&self, preferred: Option<&str>) -> Option<&DeviceDescriptor> {
        preferred
            .and_then(|id| self.get(id))
            .or_else(|| self.devices.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(id: &str) -> DeviceDescriptor {
        DeviceDescriptor {
            id: id.to_string(),
            pci: String::new(),
            pci_id: String::new(),
            name: format!("GPU {id}"),
            render_node: String::new(),
        }
    }

    #[test]
    fn test_default_device_resolution() {
        let registry = DeviceRegistry::new(vec![descriptor("card0"), descriptor("card1")]);
        assert_eq!(registry.default_device(None).unwrap().id, "card0");
        assert_eq!(registry.default_device(Some("card1")).unwrap().id, "card1");
        assert_eq!(registry.default_device(Some("card7")).unwrap().id, "card0");
        assert!(DeviceRegistry::default().default_device(None).is_none());
    }

    #[test]
    fn test_lookup() {
        let registry = DeviceRegistry::new(vec![descriptor("card0")]);
        assert!(registry.contains("card0"));
        assert!(!registry.contains("card1"));
        assert_eq!(registry.ids(), vec!["card0".to_string()]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_descriptor_json_field_names() {
        let json = serde_json::to_value(descriptor("card0")).unwrap();
        for key in ["id", "pci", "pci_id", "name", "render_node"] {
            assert!(json.get(key).is_some(), "missing {key}");
        }
    }
}
