//! Nested cgroup for the container's own init
//!
//! The child lives below the systemd-delegated cgroup and is managed purely
//! through the filesystem; systemd never sees it. Handing its ownership to
//! the container's root user lets the init delegate further.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::unistd::{chown, Gid, Uid};
use tracing::debug;

use super::config::Resources;
use super::controller::CpusetController;
use super::hierarchy::SYSTEMD_HIERARCHY;
use super::io::CgroupIo;
use super::utils::write_cgroup_proc;
use crate::error::Result;

/// Filesystem-only manager of the child cgroup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildCgroupDelegator {
    paths: HashMap<String, PathBuf>,
}

impl ChildCgroupDelegator {
    /// Child cgroup `dir_name` below each of `parent_paths`
    pub fn new(parent_paths: &HashMap<String, PathBuf>, dir_name: &str) -> Self {
        let paths = parent_paths
            .iter()
            .filter(|(name, _)| name.as_str() != SYSTEMD_HIERARCHY)
            .map(|(name, path)| (name.clone(), path.join(dir_name)))
            .collect();

        Self { paths }
    }

    pub fn paths(&self) -> &HashMap<String, PathBuf> {
        &self.paths
    }

    /// Create every child directory, owned by `owner` (uid, gid) when given
    pub fn create(&self, io: &dyn CgroupIo, owner: Option<(u32, u32)>) -> Result<()> {
        for (name, path) in &self.paths {
            if name == "cpuset" {
                CpusetController::apply_dir(io, path, &Resources::default(), None)?;
            } else {
                fs::create_dir_all(path)?;
            }

            if let Some((uid, gid)) = owner {
                chown_cgroup(path, uid, gid)?;
            }
            debug!("Created child cgroup {:?}", path);
        }
        Ok(())
    }

    /// Move `pid` into every child cgroup
    pub fn apply(&self, io: &dyn CgroupIo, pid: u32) -> Result<()> {
        for path in self.paths.values() {
            write_cgroup_proc(io, path, Some(pid))?;
        }
        Ok(())
    }
}

/// Give a cgroup directory and its control files to `uid`:`gid`
fn chown_cgroup(path: &Path, uid: u32, gid: u32) -> Result<()> {
    let owner = (Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)));

    chown(path, owner.0, owner.1).map_err(io::Error::from)?;
    for entry in fs::read_dir(path)? {
        chown(&entry?.path(), owner.0, owner.1).map_err(io::Error::from)?;
    }
    Ok(())
}
