//! Cgroup v1 management under systemd delegation
//!
//! Provides the container cgroup manager and the pieces it is built from:
//! hierarchy discovery, per-controller subsystems, the freezer bracket and
//! the nested child cgroup.
//!
//! # Safety
//! - Only the cgroup v1 (legacy) hierarchy is handled; unified resources are rejected
//! - The devices controller is mandatory
//! - `destroy` removes every directory the manager knows about

pub mod child;
pub mod config;
pub mod controller;
pub mod freezer;
pub mod hierarchy;
pub mod io;
pub mod manager;
pub mod stats;
pub mod subsystem;
pub mod utils;

pub use child::ChildCgroupDelegator;
pub use config::{
    CgroupConfig, ContainerConfig, DeviceRule, DeviceType, FreezerState, HugepageLimit, IdMap,
    IfPrioMap, Resources, DEFAULT_CHILD_CGROUP_DIR,
};
pub use freezer::FreezerCoordinator;
pub use hierarchy::{expand_slice, Hierarchy, SYSTEMD_HIERARCHY};
pub use io::{CgroupIo, HostIo};
pub use manager::{CgroupManager, CgroupManagerBuilder, CgroupType};
pub use stats::{
    BlkioStatEntry, BlkioStats, CpuStats, CpuUsage, CpusetStats, HugetlbStats, MemoryData,
    MemoryStats, PidsStats, Stats, ThrottlingStats,
};
pub use subsystem::{Subsystem, SubsystemRegistry};
