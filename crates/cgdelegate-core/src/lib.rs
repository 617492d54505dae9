//! cgdelegate Core Library
//!
//! Manages the cgroup v1 resource groups of containers on hosts where
//! systemd owns the hierarchy and delegates a subtree to the runtime.
//! Provides the cgroup lifecycle manager, systemd unit control over D-Bus,
//! and hierarchy discovery.

pub mod cgroups;
pub mod error;
pub mod systemd;

pub use cgroups::{
    CgroupConfig, CgroupIo, CgroupManager, CgroupType, ContainerConfig, DeviceRule, DeviceType,
    FreezerState, Hierarchy, HostIo, Resources, Stats, Subsystem, SubsystemRegistry,
};
pub use error::{CgroupError, Result};
pub use systemd::{DbusClient, Property, PropertyValue, SystemdClient};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
