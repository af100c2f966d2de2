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

//! Process lifecycle: discovery, readers, managers, HTTP server, shutdown.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::api::server;
use crate::app_state::AppState;
use crate::common::config::Config;
use crate::device::readers::SysfsReader;
use crate::device::{discover, DeviceRegistry, MetricsReader};
use crate::error::Result;
use crate::procscan::{ProcScanManager, ProcfsCollector, RenderNodeLookup};
use crate::sampler::SamplerManager;

/// Run the service until `cancel` fires or the server fails.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<()> {
    config.validate()?;

    let registry = DeviceRegistry::new(discover(&config.sysfs_root)?);
    if registry.is_empty() {
        tracing::warn!(sysfs_root = %config.sysfs_root.display(), "no GPUs detected");
    }
    for device in registry.descriptors() {
        tracing::info!(
            gpu_id = %device.id,
            pci = %device.pci,
            name = %device.name,
            render_node = %device.render_node,
            "gpu detected"
        );
    }

    let sampler = Arc::new(SamplerManager::new(
        config.sample_interval,
        build_readers(&registry, &config),
    )?);

    let collector = ProcfsCollector::new(
        config.proc_root.clone(),
        config.proc.max_pids,
        config.proc.max_fds_per_pid,
        RenderNodeLookup::new(registry.descriptors()),
    );
    let procs = Arc::new(ProcScanManager::new(
        config.proc.clone(),
        registry.ids(),
        Arc::new(collector),
    )?);

    let sampler_task = tokio::spawn(sampler.clone().run(cancel.clone()));
    let procs_task = tokio::spawn(procs.clone().run(cancel.clone()));

    let state = Arc::new(AppState::new(
        config,
        registry,
        sampler.clone(),
        procs.clone(),
        cancel.clone(),
    ));
    let served = server::serve(state, cancel.clone()).await;
    if let Err(e) = &served {
        tracing::error!(error = %e, "HTTP server failed");
    }

    cancel.cancel();
    for (name, task) in [("sampler", sampler_task), ("process scanner", procs_task)] {
        if let Err(e) = task.await {
            tracing::error!(task = name, error = %e, "background task terminated abnormally");
        }
    }
    sampler.shutdown();
    procs.shutdown();
    tracing::info!("shutdown complete");
    served
}

/// One reader per discovered device. A device whose reader cannot be built is
/// logged and left out of sampling but stays in the device list.
pub(crate) fn build_readers(
    registry: &DeviceRegistry,
    config: &Config,
) -> Vec<Arc<dyn MetricsReader>> {
    registry
        .descriptors()
        .iter()
        .filter_map(
            |device| match SysfsReader::new(&device.id, &config.sysfs_root, &config.debugfs_root) {
                Ok(reader) => Some(Arc::new(reader) as Arc<dyn MetricsReader>),
                Err(e) => {
                    tracing::warn!(gpu_id = %device.id, error = %e, "metrics reader unavailable");
                    None
                }
            },
        )
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn fake_card(sysfs: &std::path::Path, card: &str) {
        let device = sysfs.join("class/drm").join(card).join("device");
        fs::create_dir_all(device.join("drm")).unwrap();
        fs::write(device.join("uevent"), "DRIVER=amdgpu\n").unwrap();
        fs::write(device.join("gpu_busy_percent"), "5\n").unwrap();
    }

    #[test]
    fn test_reader_failure_excludes_only_that_device() {
        let sysfs = TempDir::new().unwrap();
        fake_card(sysfs.path(), "card0");
        fake_card(sysfs.path(), "card1");
        let registry = DeviceRegistry::new(discover(sysfs.path()).unwrap());
        assert_eq!(registry.ids(), vec!["card0".to_string(), "card1".to_string()]);

        // card1 vanishes between discovery and reader construction.
        fs::remove_dir_all(sysfs.path().join("class/drm/card1/device")).unwrap();

        let config = Config {
            sysfs_root: sysfs.path().to_path_buf(),
            debugfs_root: sysfs.path().join("debug"),
            ..Config::default()
        };
        let readers = build_readers(&registry, &config);
        let sampler = SamplerManager::new(Duration::from_millis(50), readers).unwrap();

        assert_eq!(sampler.device_ids(), vec!["card0".to_string()]);
        assert!(sampler.subscribe("card0").is_ok());
        assert!(matches!(
            sampler.subscribe("card1"),
            Err(Error::UnknownDevice(id)) if id == "card1"
        ));
        assert_eq!(registry.ids().len(), 2);
    }
}
