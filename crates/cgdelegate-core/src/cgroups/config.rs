//! Container cgroup configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use crate::error::{CgroupError, Result};
use crate::systemd::{Property, DEFAULT_SLICE, SCOPE_SUFFIX, SERVICE_SUFFIX, SLICE_SUFFIX};

/// Directory name of the nested cgroup handed to the container's init
pub const DEFAULT_CHILD_CGROUP_DIR: &str = "syscont-cgroup-root";

/// Freezer controller state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreezerState {
    #[default]
    Undefined,
    Frozen,
    Thawed,
}

impl FreezerState {
    /// Value written to `freezer.state`, `None` for `Undefined`
    pub fn as_kernel_str(&self) -> Option<&'static str> {
        match self {
            FreezerState::Undefined => None,
            FreezerState::Frozen => Some("FROZEN"),
            FreezerState::Thawed => Some("THAWED"),
        }
    }
}

impl fmt::Display for FreezerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FreezerState::Undefined => "undefined",
            FreezerState::Frozen => "frozen",
            FreezerState::Thawed => "thawed",
        };
        f.write_str(s)
    }
}

/// Device node class a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    #[serde(rename = "a")]
    All,
    #[serde(rename = "c")]
    Char,
    #[serde(rename = "b")]
    Block,
}

impl DeviceType {
    pub fn as_char(&self) -> char {
        match self {
            DeviceType::All => 'a',
            DeviceType::Char => 'c',
            DeviceType::Block => 'b',
        }
    }
}

/// One device access rule, in the order it must be applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRule {
    #[serde(rename = "type")]
    pub kind: DeviceType,

    /// `None` matches every major number
    #[serde(default)]
    pub major: Option<i64>,

    /// `None` matches every minor number
    #[serde(default)]
    pub minor: Option<i64>,

    /// Any combination of `r`, `w` and `m`
    pub permissions: String,

    pub allow: bool,
}

impl DeviceRule {
    pub fn allow_all() -> Self {
        Self {
            kind: DeviceType::All,
            major: None,
            minor: None,
            permissions: "rwm".to_string(),
            allow: true,
        }
    }

    pub fn deny_all() -> Self {
        Self {
            allow: false,
            ..Self::allow_all()
        }
    }

    pub fn allow(kind: DeviceType, major: Option<i64>, minor: Option<i64>, permissions: &str) -> Self {
        Self {
            kind,
            major,
            minor,
            permissions: permissions.to_string(),
            allow: true,
        }
    }

    pub fn deny(kind: DeviceType, major: Option<i64>, minor: Option<i64>, permissions: &str) -> Self {
        Self {
            allow: false,
            ..Self::allow(kind, major, minor, permissions)
        }
    }

    /// Line accepted by `devices.allow` / `devices.deny`, e.g. `c 1:3 rwm`
    pub fn cgroup_string(&self) -> String {
        let major = self.major.map_or_else(|| "*".to_string(), |m| m.to_string());
        let minor = self.minor.map_or_else(|| "*".to_string(), |m| m.to_string());
        format!(
            "{} {}:{} {}",
            self.kind.as_char(),
            major,
            minor,
            self.permissions
        )
    }

    /// True for the `a *:* rwm` rule
    pub fn is_wildcard_all(&self) -> bool {
        self.kind == DeviceType::All && self.major.is_none() && self.minor.is_none()
    }
}

/// Hugepage limit for one page size (e.g. `2MB`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HugepageLimit {
    pub pagesize: String,
    pub limit: u64,
}

/// Network interface priority for `net_prio.ifpriomap`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IfPrioMap {
    pub interface: String,
    pub priority: u32,
}

impl IfPrioMap {
    pub fn cgroup_string(&self) -> String {
        format!("{} {}", self.interface, self.priority)
    }
}

/// Largest CFS quota the kernel accepts (microseconds)
pub const MAX_CPU_QUOTA: i64 = (1 << 44) - 1;

fn unless_zero<T: Default + PartialEq>(value: Option<T>) -> Option<T> {
    value.filter(|v| *v != T::default())
}

/// Resource limits to apply to the container cgroup
///
/// `None` means "leave as is", and so does `0` for memory, swap, kernel memory,
/// cpu shares and blkio weight. For memory, swap and pids, `-1` means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    /// Memory limit (bytes)
    pub memory: Option<i64>,

    /// Memory + swap limit (bytes)
    pub memory_swap: Option<i64>,

    /// Kernel memory limit (bytes); accounting must be enabled before any task joins
    pub kernel_memory: Option<i64>,

    /// Relative CPU weight (cgroup v1 `cpu.shares`)
    pub cpu_shares: Option<u64>,

    /// CFS quota in microseconds per period, `-1` for unlimited
    pub cpu_quota: Option<i64>,

    /// CFS period in microseconds
    pub cpu_period: Option<u64>,

    /// CPUs in list syntax, e.g. `0-3,7`
    pub cpuset_cpus: Option<String>,

    /// Memory nodes in list syntax
    pub cpuset_mems: Option<String>,

    /// Block IO weight (10-1000)
    pub blkio_weight: Option<u16>,

    /// Maximum number of tasks
    pub pids_limit: Option<i64>,

    /// Device access rules, applied in order
    pub devices: Vec<DeviceRule>,

    /// Requested freezer state
    pub freezer: FreezerState,

    pub hugetlb_limits: Vec<HugepageLimit>,

    pub net_cls_classid: Option<u32>,

    pub net_prio_ifpriomap: Vec<IfPrioMap>,

    /// Unified (cgroup v2) key/values; never accepted by the v1 manager
    pub unified: Option<HashMap<String, String>>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_memory(mut self, bytes: i64) -> Self {
        self.memory = Some(bytes);
        self
    }

    pub fn with_memory_swap(mut self, bytes: i64) -> Self {
        self.memory_swap = Some(bytes);
        self
    }

    pub fn with_kernel_memory(mut self, bytes: i64) -> Self {
        self.kernel_memory = Some(bytes);
        self
    }

    pub fn with_cpu_shares(mut self, shares: u64) -> Self {
        self.cpu_shares = Some(shares);
        self
    }

    pub fn with_cpu_quota(mut self, quota: i64, period: u64) -> Self {
        self.cpu_quota = Some(quota);
        self.cpu_period = Some(period);
        self
    }

    pub fn with_cpuset(mut self, cpus: &str, mems: &str) -> Self {
        self.cpuset_cpus = Some(cpus.to_string());
        self.cpuset_mems = Some(mems.to_string());
        self
    }

    pub fn with_blkio_weight(mut self, weight: u16) -> Self {
        self.blkio_weight = Some(weight);
        self
    }

    pub fn with_pids_limit(mut self, limit: i64) -> Self {
        self.pids_limit = Some(limit);
        self
    }

    pub fn with_device(mut self, rule: DeviceRule) -> Self {
        self.devices.push(rule);
        self
    }

    /// Memory limit, if one was requested
    pub fn memory_limit(&self) -> Option<i64> {
        unless_zero(self.memory)
    }

    pub fn memory_swap_limit(&self) -> Option<i64> {
        unless_zero(self.memory_swap)
    }

    /// Kernel memory limit; any value here turns kmem accounting on
    pub fn kernel_memory_limit(&self) -> Option<i64> {
        unless_zero(self.kernel_memory)
    }

    pub fn cpu_shares_weight(&self) -> Option<u64> {
        unless_zero(self.cpu_shares)
    }

    pub fn blkio_weight_value(&self) -> Option<u16> {
        unless_zero(self.blkio_weight)
    }

    /// Reject configuration only a cgroup v2 manager could honour
    pub fn ensure_v1(&self) -> Result<()> {
        if self.unified.is_some() {
            return Err(CgroupError::UnsupportedConfig(
                "unified resources cannot be applied on a cgroup v1 hierarchy".to_string(),
            ));
        }
        Ok(())
    }

    /// Validate limits are reasonable
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("Memory", self.memory_limit()),
            ("Memory swap", self.memory_swap_limit()),
            ("Kernel memory", self.kernel_memory_limit()),
        ] {
            if let Some(v) = value {
                if v < -1 {
                    return Err(CgroupError::InvalidLimit(format!(
                        "{} limit must be positive or -1, got {}",
                        name, v
                    )));
                }
            }
        }

        if let Some(limit) = self.pids_limit {
            if limit == 0 || limit < -1 {
                return Err(CgroupError::InvalidLimit(format!(
                    "Pids limit must be positive or -1, got {}",
                    limit
                )));
            }
        }

        if let (Some(mem), Some(swap)) = (self.memory_limit(), self.memory_swap_limit()) {
            if mem > 0 && swap > 0 && swap < mem {
                return Err(CgroupError::InvalidLimit(format!(
                    "Memory swap limit {} cannot be lower than memory limit {}",
                    swap, mem
                )));
            }
        }

        if let Some(shares) = self.cpu_shares_weight() {
            if shares < 2 {
                return Err(CgroupError::InvalidLimit(format!(
                    "CPU shares must be >= 2, got {}",
                    shares
                )));
            }
        }

        if let Some(quota) = self.cpu_quota {
            if quota == 0 || quota < -1 {
                return Err(CgroupError::InvalidLimit(format!(
                    "CPU quota must be positive or -1, got {}",
                    quota
                )));
            }
            if quota > MAX_CPU_QUOTA {
                return Err(CgroupError::InvalidLimit(format!(
                    "CPU quota cannot exceed {}us, got {}",
                    MAX_CPU_QUOTA, quota
                )));
            }
        }

        if self.cpu_period == Some(0) {
            return Err(CgroupError::InvalidLimit(
                "CPU period cannot be 0".to_string(),
            ));
        }

        if let Some(weight) = self.blkio_weight_value() {
            if !(10..=1000).contains(&weight) {
                return Err(CgroupError::InvalidLimit(format!(
                    "Block IO weight must be 10-1000, got {}",
                    weight
                )));
            }
        }

        Ok(())
    }
}

/// Cgroup configuration of one container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CgroupConfig {
    /// Container name; the unit name is derived from it
    pub name: String,

    /// Parent slice, `system.slice` when empty
    pub parent: String,

    /// Optional prefix for the scope unit (`<prefix>-<name>.scope`)
    pub scope_prefix: String,

    pub resources: Resources,

    /// Pre-existing cgroup paths to join instead of creating a unit
    pub paths: Option<HashMap<String, PathBuf>>,

    /// Extra unit properties passed verbatim to systemd on unit creation
    pub systemd_props: Vec<Property>,

    /// Container does not need device isolation; no freezing around updates
    pub skip_devices: bool,

    /// Directory name of the nested cgroup for the container's init
    pub child_cgroup_dir: String,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            parent: String::new(),
            scope_prefix: String::new(),
            resources: Resources::default(),
            paths: None,
            systemd_props: Vec::new(),
            skip_devices: false,
            child_cgroup_dir: DEFAULT_CHILD_CGROUP_DIR.to_string(),
        }
    }
}

impl CgroupConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_parent(mut self, parent: &str) -> Self {
        self.parent = parent.to_string();
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_paths(mut self, paths: HashMap<String, PathBuf>) -> Self {
        self.paths = Some(paths);
        self
    }

    /// Join mode: operate on caller-provided paths, never on systemd
    pub fn is_join_mode(&self) -> bool {
        self.paths.is_some()
    }

    /// Parent slice of the unit
    pub fn slice(&self) -> &str {
        if self.parent.is_empty() {
            DEFAULT_SLICE
        } else {
            &self.parent
        }
    }

    /// Deterministic systemd unit name for this container
    pub fn unit_name(&self) -> String {
        if [SLICE_SUFFIX, SCOPE_SUFFIX, SERVICE_SUFFIX]
            .iter()
            .any(|suffix| self.name.ends_with(suffix))
        {
            return self.name.clone();
        }

        if self.scope_prefix.is_empty() {
            format!("{}{}", self.name, SCOPE_SUFFIX)
        } else {
            format!("{}-{}{}", self.scope_prefix, self.name, SCOPE_SUFFIX)
        }
    }
}

/// User namespace id mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMap {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

/// The parts of a container's configuration the cgroup manager consumes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub cgroup: CgroupConfig,
    pub uid_mappings: Vec<IdMap>,
    pub gid_mappings: Vec<IdMap>,
}

impl ContainerConfig {
    pub fn new(cgroup: CgroupConfig) -> Self {
        Self {
            cgroup,
            ..Self::default()
        }
    }

    /// Host uid that container root maps to
    pub fn host_root_uid(&self) -> Option<u32> {
        host_id_of_root(&self.uid_mappings)
    }

    /// Host gid that container root maps to
    pub fn host_root_gid(&self) -> Option<u32> {
        host_id_of_root(&self.gid_mappings)
    }
}

fn host_id_of_root(mappings: &[IdMap]) -> Option<u32> {
    mappings
        .iter()
        .find(|m| m.container_id == 0 && m.size > 0)
        .map(|m| m.host_id)
}
