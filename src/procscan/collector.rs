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

//! Walks procfs and reports every descriptor that points at a known render
//! node, together with its parsed fdinfo.

use std::collections::HashMap;
use std::ffi::CStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::common::config::AppConfig;
use crate::common::sync::lock;
use crate::device::DeviceDescriptor;
use crate::error::{Error, Result};
use crate::parsing::common::after_colon_trimmed;
use crate::procscan::fdinfo::parse_fdinfo;
use crate::procscan::types::DescriptorUsage;

/// Raw readings for every device, keyed by device id.
pub type RawUsage = HashMap<String, Vec<DescriptorUsage>>;

/// Source of per-descriptor GPU usage for the whole process table.
///
/// `collect` does blocking I/O and is called from `spawn_blocking`. An error
/// means the scan as a whole failed; unreadable individual processes are
/// skipped by the implementation.
pub trait UsageCollector: Send + Sync {
    fn collect(&self) -> Result<RawUsage>;
    fn close(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderNodeMatch {
    pub device_id: String,
    /// Render node basename, e.g. "renderD128".
    pub base: String,
}

/// Maps descriptor targets to devices: exact render node path first, then
/// basename.
#[derive(Debug, Clone, Default)]
pub struct RenderNodeLookup {
    by_path: HashMap<PathBuf, RenderNodeMatch>,
    by_base: HashMap<String, RenderNodeMatch>,
}

impl RenderNodeLookup {
    pub fn new(devices: &[DeviceDescriptor]) -> Self {
        let mut lookup = Self::default();
        for device in devices.iter().filter(|d| !d.render_node.is_empty()) {
            let path = PathBuf::from(&device.render_node);
            let Some(base) = path.file_name().map(|b| b.to_string_lossy().into_owned()) else {
                continue;
            };
            let entry = RenderNodeMatch {
                device_id: device.id.clone(),
                base: base.clone(),
            };
            lookup.by_path.insert(path, entry.clone());
            lookup.by_base.insert(base, entry);
        }
        lookup
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    pub fn match_target(&self, target: &Path) -> Option<&RenderNodeMatch> {
        self.by_path.get(target).or_else(|| {
            let base = target.file_name()?.to_str()?;
            self.by_base.get(base)
        })
    }
}

/// [`UsageCollector`] reading `<proc_root>/<pid>/{comm,cmdline,status,fd,fdinfo}`.
pub struct ProcfsCollector {
    proc_root: PathBuf,
    max_pids: usize,
    max_fds: usize,
    lookup: RenderNodeLookup,
    users: Mutex<HashMap<u32, String>>,
}

impl ProcfsCollector {
    pub fn new(
        proc_root: impl Into<PathBuf>,
        max_pids: usize,
        max_fds: usize,
        lookup: RenderNodeLookup,
    ) -> Self {
        Self {
            proc_root: proc_root.into(),
            max_pids,
            max_fds,
            lookup,
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Pre-seed the user name cache, bypassing the passwd lookup for `uid`.
    pub fn cache_user(&self, uid: u32, name: impl Into<String>) {
        lock(&self.users).insert(uid, name.into());
    }

    fn scan_process(&self, pid: u32, dir: &Path) -> Vec<(String, DescriptorUsage)> {
        let Ok(comm) = fs::read_to_string(dir.join("comm")) else {
            return Vec::new();
        };
        let Some(uid) = read_uid(&dir.join("status")) else {
            return Vec::new();
        };
        let Ok(fd_entries) = fs::read_dir(dir.join("fd")) else {
            return Vec::new();
        };

        let mut fds: Vec<(u32, String)> = fd_entries
            .flatten()
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.parse().ok().map(|fd| (fd, name))
            })
            .collect();
        fds.sort_unstable();

        let fd_dir = dir.join("fd");
        let mut found = Vec::new();
        let mut identity: Option<(String, String)> = None;

        for (_, fd) in fds.into_iter().take(self.max_fds) {
            let Ok(target) = fs::read_link(fd_dir.join(&fd)) else {
                continue;
            };
            let target = normalize_target(&fd_dir, &target);
            let Some(matched) = self.lookup.match_target(&target) else {
                continue;
            };
            let Ok(info) = fs::read_to_string(dir.join("fdinfo").join(&fd)) else {
                continue;
            };

            let (user, cmd) = identity
                .get_or_insert_with(|| {
                    let cmdline = fs::read(dir.join("cmdline")).unwrap_or_default();
                    (self.lookup_user(uid), format_cmdline(&cmdline))
                })
                .clone();

            found.push((
                matched.device_id.clone(),
                DescriptorUsage {
                    pid,
                    uid,
                    user,
                    name: comm.trim().to_string(),
                    cmd,
                    render_node: matched.base.clone(),
                    usage: parse_fdinfo(&info),
                },
            ));
        }
        found
    }

    fn lookup_user(&self, uid: u32) -> String {
        if let Some(name) = lock(&self.users).get(&uid) {
            return name.clone();
        }
        let name = passwd_name(uid).unwrap_or_else(|| uid.to_string());
        lock(&self.users).insert(uid, name.clone());
        name
    }
}

impl UsageCollector for ProcfsCollector {
    fn collect(&self) -> Result<RawUsage> {
        let entries = fs::read_dir(&self.proc_root)
            .map_err(|e| Error::ScanFailed(format!("{}: {e}", self.proc_root.display())))?;

        let mut pids: Vec<u32> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .filter(|pid| *pid > 0)
            .collect();
        pids.sort_unstable();

        let mut results = RawUsage::new();
        let mut matched_pids = 0;
        for pid in pids {
            if matched_pids >= self.max_pids {
                tracing::debug!(max_pids = self.max_pids, "process scan limit reached");
                break;
            }
            let found = self.scan_process(pid, &self.proc_root.join(pid.to_string()));
            if found.is_empty() {
                continue;
            }
            matched_pids += 1;
            for (device_id, usage) in found {
                results.entry(device_id).or_default().push(usage);
            }
        }
        Ok(results)
    }
}

fn normalize_target(fd_dir: &Path, target: &Path) -> PathBuf {
    let target = target
        .to_str()
        .and_then(|t| t.strip_suffix(" (deleted)"))
        .map(PathBuf::from)
        .unwrap_or_else(|| target.to_path_buf());
    if target.is_absolute() {
        target
    } else {
        fd_dir.join(target)
    }
}

fn read_uid(status: &Path) -> Option<u32> {
    let contents = fs::read_to_string(status).ok()?;
    contents
        .lines()
        .find(|line| line.starts_with("Uid:"))
        .and_then(after_colon_trimmed)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}

/// NUL separated argv joined with spaces, capped in length.
pub fn format_cmdline(raw: &[u8]) -> String {
    let joined = String::from_utf8_lossy(raw)
        .split('\0')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    joined.chars().take(AppConfig::CMDLINE_MAX_CHARS).collect()
}

/// User name for `uid` from the passwd database.
fn passwd_name(uid: u32) -> Option<String> {
    let mut buf = vec![0 as libc::c_char; 4096];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    // SAFETY: every pointer refers to a live local; getpwuid_r writes at most
    // `buf.len()` bytes into `buf` and only sets `result` to `&mut pwd`.
    let rc = unsafe {
        libc::getpwuid_r(
            uid as libc::uid_t,
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() || pwd.pw_name.is_null() {
        return None;
    }
    // SAFETY: pw_name points into `buf`, which is still alive, and is NUL terminated.
    let name = unsafe { CStr::from_ptr(pwd.pw_name) };
    name.to_str()
        .ok()
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}
