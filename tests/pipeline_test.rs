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

//! Discovery, sampling and process scanning against fake sysfs/procfs trees.

use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use gputop_web::common::config::ProcConfig;
use gputop_web::device::readers::SysfsReader;
use gputop_web::device::{discover, DeviceRegistry, MetricsReader};
use gputop_web::procscan::{ProcScanManager, ProcfsCollector, RenderNodeLookup};
use gputop_web::sampler::SamplerManager;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const MIB: u64 = 1024 * 1024;

fn write(path: &Path, contents: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

fn fake_sysfs(root: &Path) {
    let device = root.join("class/drm/card0/device");
    write(
        &device.join("uevent"),
        "DRIVER=amdgpu\nPCI_ID=1002:73BF\nPCI_SLOT_NAME=0000:03:00.0\n",
    );
    fs::create_dir_all(device.join("drm/renderD128")).unwrap();
    write(&device.join("gpu_busy_percent"), "42\n");
    write(&device.join("mem_info_vram_used"), "1073741824\n");
}

fn add_process(proc_root: &Path, pid: u32, fdinfo: &str) {
    let dir = proc_root.join(pid.to_string());
    fs::create_dir_all(dir.join("fd")).unwrap();
    write(&dir.join("comm"), "render\n");
    write(&dir.join("cmdline"), "/opt/render\0--gpu\0");
    write(&dir.join("status"), "Name:\trender\nUid:\t0\t0\t0\t0\n");
    symlink("/dev/dri/renderD128", dir.join("fd/7")).unwrap();
    write(&dir.join("fdinfo/7"), fdinfo);
}

fn fdinfo(vram_mib: u64, engine_ns: u64) -> String {
    format!(
        "pos:\t0\nflags:\t02100002\ndrm-driver:\tamdgpu\ndrm-client-id:\t11\n\
         drm-memory-vram:\t{} KiB\ndrm-memory-gtt:\t0 KiB\ndrm-engine-gfx:\t{engine_ns} ns\n",
        vram_mib * 1024
    )
}

#[tokio::test]
async fn test_discovery_feeds_sampler() {
    let sysfs = TempDir::new().unwrap();
    fake_sysfs(sysfs.path());

    let registry = DeviceRegistry::new(discover(sysfs.path()).unwrap());
    assert_eq!(registry.ids(), vec!["card0".to_string()]);
    assert_eq!(registry.get("card0").unwrap().render_node, "/dev/dri/renderD128");

    let reader = SysfsReader::new("card0", sysfs.path(), &sysfs.path().join("debug")).unwrap();
    let readers: Vec<Arc<dyn MetricsReader>> = vec![Arc::new(reader)];
    let sampler = Arc::new(SamplerManager::new(Duration::from_millis(50), readers).unwrap());
    let mut subscription = sampler.subscribe("card0").unwrap();

    let cancel = CancellationToken::new();
    let task = tokio::spawn(sampler.clone().run(cancel.clone()));

    let snapshot = tokio::time::timeout(Duration::from_secs(2), subscription.recv())
        .await
        .expect("first sample should arrive")
        .expect("subscription should be open");
    assert_eq!(snapshot.device_id, "card0");
    assert_eq!(snapshot.metrics.gpu_busy_pct, Some(42.0));
    assert_eq!(snapshot.metrics.vram_used_bytes, Some(1024 * MIB));
    assert_eq!(snapshot.metrics.temp_c, None);
    assert!(sampler.ready());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("sampler should stop")
        .unwrap();
    // A sample published just before shutdown may still be pending.
    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        while subscription.recv().await.is_some() {}
    })
    .await;
    assert!(drained.is_ok(), "subscription should close on shutdown");
}

#[tokio::test]
async fn test_process_scan_reports_memory_and_engine_rate() {
    let sysfs = TempDir::new().unwrap();
    fake_sysfs(sysfs.path());
    let registry = DeviceRegistry::new(discover(sysfs.path()).unwrap());

    let proc = TempDir::new().unwrap();
    add_process(proc.path(), 4242, &fdinfo(64, 1_000_000_000));

    let collector = ProcfsCollector::new(
        proc.path(),
        100,
        16,
        RenderNodeLookup::new(registry.descriptors()),
    );
    collector.cache_user(0, "root");
    let manager = ProcScanManager::new(ProcConfig::default(), registry.ids(), Arc::new(collector))
        .unwrap();

    let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
    manager.scan_once(t0).await.unwrap();
    let first = manager.latest("card0").unwrap();
    assert!(first.capabilities.vram_gtt_from_fdinfo);
    assert!(first.capabilities.engine_time_from_fdinfo);
    assert_eq!(first.processes.len(), 1);
    let process = &first.processes[0];
    assert_eq!(process.pid, 4242);
    assert_eq!(process.name, "render");
    assert_eq!(process.cmd, "/opt/render --gpu");
    assert_eq!(process.user, "root");
    assert_eq!(process.render_node, "renderD128");
    assert_eq!(process.vram_bytes, Some(64 * MIB));
    assert_eq!(process.gpu_time_ms_per_s, None);

    // 500 ms of engine time over two seconds of wall clock.
    write(
        &proc.path().join("4242/fdinfo/7"),
        &fdinfo(64, 1_500_000_000),
    );
    manager
        .scan_once(t0 + chrono::Duration::seconds(2))
        .await
        .unwrap();
    let second = manager.latest("card0").unwrap();
    let rate = second.processes[0].gpu_time_ms_per_s.unwrap();
    assert!((rate - 250.0).abs() < 1e-9, "unexpected rate {rate}");
}

#[tokio::test]
async fn test_missing_proc_root_keeps_previous_snapshot() {
    let sysfs = TempDir::new().unwrap();
    fake_sysfs(sysfs.path());
    let registry = DeviceRegistry::new(discover(sysfs.path()).unwrap());

    let proc = TempDir::new().unwrap();
    add_process(proc.path(), 7, &fdinfo(8, 0));
    let proc_root = proc.path().to_path_buf();

    let collector = ProcfsCollector::new(
        proc_root.clone(),
        100,
        16,
        RenderNodeLookup::new(registry.descriptors()),
    );
    collector.cache_user(0, "root");
    let manager = ProcScanManager::new(ProcConfig::default(), registry.ids(), Arc::new(collector))
        .unwrap();

    let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap();
    manager.scan_once(t0).await.unwrap();
    let before = manager.latest("card0").unwrap();

    fs::remove_dir_all(&proc_root).unwrap();
    assert!(manager
        .scan_once(t0 + chrono::Duration::seconds(2))
        .await
        .is_err());
    assert_eq!(manager.latest("card0").unwrap(), before);
}
