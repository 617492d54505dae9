//! Error types for cgroup operations

use std::io;
use thiserror::Error;

/// Cgroup operation errors
#[derive(Debug, Error)]
pub enum CgroupError {
    /// The controller hierarchy is not mounted on this host
    #[error("Cgroup not found: {0}")]
    NotFound(String),

    #[error("Unsupported cgroup configuration: {0}")]
    UnsupportedConfig(String),

    #[error("systemd version {found} is too old; cgroup delegation requires >= {required}")]
    UnsupportedSystemdVersion { found: u32, required: u32 },

    #[error("Unsupported unit type: {0}")]
    UnsupportedUnitType(String),

    /// The operation needs a controller path that was never resolved
    #[error("Cgroup subsystem {0} does not exist")]
    SubsystemUnresolved(String),

    #[error("D-Bus error: {0}")]
    Dbus(#[from] zbus::Error),

    #[error("Systemd error: {0}")]
    Systemd(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid limit value: {0}")]
    InvalidLimit(String),

    #[error("Invalid slice name: {0}")]
    InvalidSlice(String),

    /// The kernel did not reach the requested freezer state
    #[error("Freezer error: {0}")]
    Freezer(String),

    #[error("Failed to parse cgroup file: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("procfs error: {0}")]
    Proc(#[from] procfs::ProcError),

    #[error("Can't place process in child cgroup because child cgroup has not been created")]
    ChildCgroupNotCreated,

    #[error("Can't place pid in delegated cgroup unless it was placed in container cgroup first")]
    ContainerCgroupNotJoined,

    #[error("Child cgroup error: {0}")]
    ChildCgroup(String),
}

impl CgroupError {
    /// True for the "hierarchy absent on this host" class that callers may tolerate
    pub fn is_not_found(&self) -> bool {
        matches!(self, CgroupError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, CgroupError>;
