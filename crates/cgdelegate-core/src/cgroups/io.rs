//! Raw access to per-controller cgroup files
//!
//! Every controller file read or write goes through [`CgroupIo`], so the
//! manager can run against the host or against an instrumented tree.

use std::path::Path;

use super::utils::{read_cgroup_file, write_cgroup_file};
use crate::error::Result;

/// Reads and writes control files inside a cgroup directory
pub trait CgroupIo: Send + Sync {
    /// Read `file` inside the cgroup directory `dir`
    fn read_file(&self, dir: &Path, file: &str) -> Result<String>;

    /// Write `data` to `file` inside the cgroup directory `dir`
    fn write_file(&self, dir: &Path, file: &str, data: &str) -> Result<()>;
}

/// Direct filesystem access on the host
#[derive(Debug, Clone, Copy, Default)]
pub struct HostIo;

impl CgroupIo for HostIo {
    fn read_file(&self, dir: &Path, file: &str) -> Result<String> {
        read_cgroup_file(&dir.join(file))
    }

    fn write_file(&self, dir: &Path, file: &str, data: &str) -> Result<()> {
        write_cgroup_file(&dir.join(file), data)
    }
}
