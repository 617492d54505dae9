//! Cgroup v1 hierarchy discovery
//!
//! Looks up controller mountpoints from `mountinfo`, the cgroup of PID 1,
//! the cgroups of the current process, and device names from `/proc/devices`.
//! The proc root is configurable so the lookups can run against a fake tree.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use procfs::process::MountInfos;
use procfs::{FromRead, ProcessCGroups};

use super::config::DeviceType;
use super::utils::read_cgroup_file;
use crate::error::{CgroupError, Result};
use crate::systemd::SLICE_SUFFIX;

/// Name under which the systemd-owned named hierarchy appears
pub const SYSTEMD_HIERARCHY: &str = "name=systemd";

const CGROUP_V1_FSTYPE: &str = "cgroup";
const INIT_SCOPE: &str = "init.scope";

/// Host cgroup hierarchy as seen through a proc filesystem
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hierarchy {
    proc_root: PathBuf,
}

impl Default for Hierarchy {
    fn default() -> Self {
        Self::host()
    }
}

impl Hierarchy {
    /// The running host (`/proc`)
    pub fn host() -> Self {
        Self::with_proc_root("/proc")
    }

    pub fn with_proc_root(root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: root.into(),
        }
    }

    pub fn proc_root(&self) -> &Path {
        &self.proc_root
    }

    /// Mountpoint of the v1 hierarchy carrying `subsystem`
    pub fn find_mountpoint(&self, subsystem: &str) -> Result<PathBuf> {
        let mounts = MountInfos::from_file(self.proc_root.join("self/mountinfo"))?;

        mounts
            .into_iter()
            .find(|m| {
                m.fs_type == CGROUP_V1_FSTYPE && mount_has_subsystem(&m.super_options, subsystem)
            })
            .map(|m| m.mount_point)
            .ok_or_else(|| CgroupError::NotFound(format!("mountpoint for {}", subsystem)))
    }

    /// Cgroup of PID 1 for `subsystem`
    pub fn init_cgroup(&self, subsystem: &str) -> Result<String> {
        let cgroups = self.parse_cgroup_file(&self.proc_root.join("1/cgroup"))?;
        cgroups
            .get(subsystem)
            .cloned()
            .ok_or_else(|| CgroupError::NotFound(format!("init cgroup for {}", subsystem)))
    }

    /// Controller name to cgroup path for the current process
    pub fn self_cgroups(&self) -> Result<HashMap<String, String>> {
        self.parse_cgroup_file(&self.proc_root.join("self/cgroup"))
    }

    fn parse_cgroup_file(&self, path: &Path) -> Result<HashMap<String, String>> {
        let groups = ProcessCGroups::from_file(path)?;
        let mut map = HashMap::new();

        for group in groups {
            for controller in group.controllers.iter().filter(|c| !c.is_empty()) {
                map.insert(controller.clone(), group.pathname.clone());
            }
        }

        Ok(map)
    }

    /// Where a container's cgroup for `subsystem` lives
    ///
    /// mountpoint + PID 1's cgroup (without a trailing `init.scope`) +
    /// expanded slice + unit name.
    pub fn subsystem_path(&self, subsystem: &str, slice: &str, unit: &str) -> Result<PathBuf> {
        let mountpoint = self.find_mountpoint(subsystem)?;
        let init_path = self.init_cgroup(subsystem)?;

        // systemd >= 226 keeps PID 1 in init.scope rather than the root
        let init_path = init_path.trim_end_matches('/');
        let init_path = init_path.strip_suffix(INIT_SCOPE).unwrap_or(init_path);

        let mut path = mountpoint;
        for segment in init_path
            .split('/')
            .chain(expand_slice(slice)?.split('/'))
            .filter(|s| !s.is_empty())
        {
            path.push(segment);
        }
        path.push(unit);

        Ok(path)
    }

    /// Kernel name of a device major number (`/proc/devices`)
    pub fn device_name(&self, kind: DeviceType, major: i64) -> Result<Option<String>> {
        let section = match kind {
            DeviceType::Char => "Character devices:",
            DeviceType::Block => "Block devices:",
            DeviceType::All => return Ok(None),
        };

        let content = read_cgroup_file(&self.proc_root.join("devices"))?;
        let mut in_section = false;

        for line in content.lines() {
            let line = line.trim();
            if line.ends_with(':') {
                in_section = line == section;
                continue;
            }
            if !in_section {
                continue;
            }
            if let Some((num, name)) = line.split_once(char::is_whitespace) {
                if num.parse::<i64>().ok() == Some(major) {
                    return Ok(Some(name.trim().to_string()));
                }
            }
        }

        Ok(None)
    }
}

fn mount_has_subsystem(options: &HashMap<String, Option<String>>, subsystem: &str) -> bool {
    match subsystem.strip_prefix("name=") {
        Some(name) => {
            options.get("name").map(|v| v.as_deref()) == Some(Some(name))
                || options.contains_key(subsystem)
        }
        None => options.contains_key(subsystem),
    }
}

/// Expand a slice name into its path below the hierarchy root
///
/// `a-b-c.slice` becomes `a.slice/a-b.slice/a-b-c.slice`; `-.slice` is the root.
pub fn expand_slice(slice: &str) -> Result<String> {
    let invalid = || CgroupError::InvalidSlice(slice.to_string());

    let name = slice.strip_suffix(SLICE_SUFFIX).ok_or_else(invalid)?;
    if name.contains('/') {
        return Err(invalid());
    }
    if name == "-" {
        return Ok(String::new());
    }
    if name.is_empty() || name.starts_with('-') || name.ends_with('-') || name.contains("--") {
        return Err(invalid());
    }

    let mut path = String::new();
    let mut prefix = String::new();
    for component in name.split('-') {
        if !prefix.is_empty() {
            prefix.push('-');
        }
        prefix.push_str(component);

        if !path.is_empty() {
            path.push('/');
        }
        path.push_str(&prefix);
        path.push_str(SLICE_SUFFIX);
    }

    Ok(path)
}
