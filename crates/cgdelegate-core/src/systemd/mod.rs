//! systemd integration
//!
//! Transient delegated units are created and updated over the system bus;
//! cgroup limits are expressed as unit properties.

pub mod dbus;
pub mod properties;

pub use dbus::{DbusClient, SystemdClient};
pub use properties::{
    device_properties, parse_version, resource_properties, transient_unit_properties, Property,
    PropertyValue,
};

pub const DEFAULT_SLICE: &str = "system.slice";
pub const SLICE_SUFFIX: &str = ".slice";
pub const SCOPE_SUFFIX: &str = ".scope";
pub const SERVICE_SUFFIX: &str = ".service";

pub const UNIT_MODE_REPLACE: &str = "replace";
pub const NO_SUCH_UNIT_ERROR: &str = "org.freedesktop.systemd1.NoSuchUnit";
pub const UNIT_EXISTS_ERROR: &str = "org.freedesktop.systemd1.UnitExists";

/// First systemd release supporting `Delegate=`
pub const MIN_DELEGATE_VERSION: u32 = 218;

/// First release accepting `CPUQuotaPeriodUSec`
pub const MIN_QUOTA_PERIOD_VERSION: u32 = 242;

/// First release accepting `AllowedCPUs` / `AllowedMemoryNodes`
pub const MIN_CPUSET_VERSION: u32 = 244;
