//! Cgroup v1 subsystems and the ordered registry the manager walks

use std::fmt;
use std::fs;
use std::path::Path;

use super::config::CgroupConfig;
use super::controller::{
    BlkioController, CpuController, CpuacctController, CpusetController, DevicesController,
    FreezerController, HugetlbController, MemoryController, NetClsController, NetPrioController,
    PidsController,
};
use super::hierarchy::SYSTEMD_HIERARCHY;
use super::io::CgroupIo;
use super::stats::Stats;
use super::utils::write_cgroup_proc;
use crate::error::Result;

/// One cgroup v1 controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Cpuset,
    Devices,
    Memory,
    Cpu,
    Cpuacct,
    Pids,
    Blkio,
    Hugetlb,
    PerfEvent,
    Freezer,
    NetPrio,
    NetCls,
    /// The `name=systemd` hierarchy; membership there is systemd's business
    Systemd,
}

impl Subsystem {
    /// Controller name as it appears in `/proc/self/cgroup` and mount options
    pub fn name(&self) -> &'static str {
        match self {
            Subsystem::Cpuset => "cpuset",
            Subsystem::Devices => "devices",
            Subsystem::Memory => "memory",
            Subsystem::Cpu => "cpu",
            Subsystem::Cpuacct => "cpuacct",
            Subsystem::Pids => "pids",
            Subsystem::Blkio => "blkio",
            Subsystem::Hugetlb => "hugetlb",
            Subsystem::PerfEvent => "perf_event",
            Subsystem::Freezer => "freezer",
            Subsystem::NetPrio => "net_prio",
            Subsystem::NetCls => "net_cls",
            Subsystem::Systemd => SYSTEMD_HIERARCHY,
        }
    }

    /// Managed by systemd; never joined or written directly
    pub fn is_placeholder(&self) -> bool {
        *self == Subsystem::Systemd
    }

    /// Add this controller's statistics at `path` to `stats`
    pub fn get_stats(&self, io: &dyn CgroupIo, path: &Path, stats: &mut Stats) -> Result<()> {
        match self {
            Subsystem::Cpuset => CpusetController::get_stats(io, path, stats),
            Subsystem::Memory => MemoryController::get_stats(io, path, stats),
            Subsystem::Cpu => CpuController::get_stats(io, path, stats),
            Subsystem::Cpuacct => CpuacctController::get_stats(io, path, stats),
            Subsystem::Pids => PidsController::get_stats(io, path, stats),
            Subsystem::Blkio => BlkioController::get_stats(io, path, stats),
            Subsystem::Hugetlb => HugetlbController::get_stats(io, path, stats),
            Subsystem::Devices
            | Subsystem::PerfEvent
            | Subsystem::Freezer
            | Subsystem::NetPrio
            | Subsystem::NetCls
            | Subsystem::Systemd => Ok(()),
        }
    }

    /// Write the limits of `config` that this controller owns at `path`
    pub fn set(&self, io: &dyn CgroupIo, path: &Path, config: &CgroupConfig) -> Result<()> {
        let resources = &config.resources;
        match self {
            Subsystem::Cpuset => CpusetController::set(io, path, resources),
            Subsystem::Devices if config.skip_devices => Ok(()),
            Subsystem::Devices => DevicesController::set(io, path, &resources.devices),
            Subsystem::Memory => MemoryController::set(io, path, resources),
            Subsystem::Cpu => CpuController::set(io, path, resources),
            Subsystem::Pids => PidsController::set(io, path, resources),
            Subsystem::Blkio => BlkioController::set(io, path, resources),
            Subsystem::Hugetlb => HugetlbController::set(io, path, resources),
            Subsystem::Freezer => FreezerController::set(io, path, resources.freezer),
            Subsystem::NetPrio => NetPrioController::set(io, path, resources),
            Subsystem::NetCls => NetClsController::set(io, path, resources),
            Subsystem::Cpuacct | Subsystem::PerfEvent | Subsystem::Systemd => Ok(()),
        }
    }

    /// Create the cgroup directory at `path` if needed and move `pid` into it
    ///
    /// Cpuset needs its masks populated before the kernel accepts a task,
    /// so it goes through its own routine.
    pub fn join(
        &self,
        io: &dyn CgroupIo,
        path: &Path,
        config: &CgroupConfig,
        pid: Option<u32>,
    ) -> Result<()> {
        match self {
            Subsystem::Systemd => Ok(()),
            Subsystem::Cpuset => CpusetController::apply_dir(io, path, &config.resources, pid),
            _ => {
                fs::create_dir_all(path)?;
                write_cgroup_proc(io, path, pid)
            }
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordered set of subsystems a manager operates on
///
/// Order matters: cpuset is joined first so its masks exist before anything
/// else references the cgroup, and the systemd placeholder comes last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsystemRegistry {
    subsystems: Vec<Subsystem>,
}

impl Default for SubsystemRegistry {
    fn default() -> Self {
        Self::legacy()
    }
}

impl SubsystemRegistry {
    /// Every cgroup v1 controller, in join order
    pub fn legacy() -> Self {
        Self::new(vec![
            Subsystem::Cpuset,
            Subsystem::Devices,
            Subsystem::Memory,
            Subsystem::Cpu,
            Subsystem::Cpuacct,
            Subsystem::Pids,
            Subsystem::Blkio,
            Subsystem::Hugetlb,
            Subsystem::PerfEvent,
            Subsystem::Freezer,
            Subsystem::NetPrio,
            Subsystem::NetCls,
            Subsystem::Systemd,
        ])
    }

    pub fn new(subsystems: Vec<Subsystem>) -> Self {
        Self { subsystems }
    }

    pub fn iter(&self) -> impl Iterator<Item = Subsystem> + '_ {
        self.subsystems.iter().copied()
    }

    pub fn get(&self, name: &str) -> Option<Subsystem> {
        self.iter().find(|s| s.name() == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.subsystems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subsystems.is_empty()
    }
}
