//! Translation of cgroup resources into systemd unit properties

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{MIN_CPUSET_VERSION, MIN_QUOTA_PERIOD_VERSION};
use crate::cgroups::config::{CgroupConfig, DeviceRule, DeviceType};
use crate::cgroups::hierarchy::Hierarchy;
use crate::cgroups::utils::parse_list;
use crate::error::{CgroupError, Result};

/// CFS period systemd assumes when none is configured (microseconds)
const DEFAULT_CPU_PERIOD: u64 = 100_000;

/// systemd rounds `CPUQuotaPerSecUSec` to 10ms
const CPU_QUOTA_GRANULARITY: u64 = 10_000;

/// A typed unit property value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyValue {
    Bool(bool),
    U64(u64),
    Str(String),
    /// `au`
    U32Array(Vec<u32>),
    /// `ay`
    Bytes(Vec<u8>),
    /// `a(ss)` device path / permission pairs
    DeviceAllow(Vec<(String, String)>),
}

/// One systemd unit property
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: PropertyValue,
}

impl Property {
    pub fn new(name: &str, value: PropertyValue) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }

    pub fn bool(name: &str, value: bool) -> Self {
        Self::new(name, PropertyValue::Bool(value))
    }

    pub fn u64(name: &str, value: u64) -> Self {
        Self::new(name, PropertyValue::U64(value))
    }

    pub fn string(name: &str, value: &str) -> Self {
        Self::new(name, PropertyValue::Str(value.to_string()))
    }
}

/// Leading release number of systemd's `Version` property
///
/// Accepts `249`, `v245`, `249.11-1.fc35` and `252 (252.5-2)`.
pub fn parse_version(version: &str) -> Result<u32> {
    let re = Regex::new(r"^v?(\d+)").map_err(|e| CgroupError::Systemd(e.to_string()))?;

    re.captures(version.trim())
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .ok_or_else(|| CgroupError::Systemd(format!("unable to parse systemd version {:?}", version)))
}

/// `CPUQuotaPerSecUSec` for a CFS quota
///
/// `-1` means no quota. Values are rounded up to systemd's 10ms granularity
/// so the effective quota is never lower than requested, and saturate at
/// infinity.
pub fn cpu_quota_per_sec(quota: i64, period: Option<u64>) -> u64 {
    if quota < 0 {
        return u64::MAX;
    }

    let period = period.filter(|p| *p > 0).unwrap_or(DEFAULT_CPU_PERIOD);
    let granularity = CPU_QUOTA_GRANULARITY as u128;
    let mut per_sec = quota as u128 * 1_000_000 / period as u128;
    if per_sec % granularity != 0 {
        per_sec = (per_sec / granularity + 1) * granularity;
    }
    u64::try_from(per_sec).unwrap_or(u64::MAX)
}

/// Little-endian byte mask of a list such as `0-3,7`
pub fn cpuset_bits(list: &str) -> Result<Vec<u8>> {
    let indices = parse_list(list)?;
    let Some(max) = indices.last() else {
        return Ok(Vec::new());
    };

    let mut bits = vec![0u8; *max as usize / 8 + 1];
    for index in indices {
        bits[index as usize / 8] |= 1 << (index % 8);
    }
    Ok(bits)
}

fn limit_or_infinity(value: i64) -> u64 {
    if value < 0 {
        u64::MAX
    } else {
        value as u64
    }
}

/// Unit properties expressing `config`'s resource limits
pub fn resource_properties(
    config: &CgroupConfig,
    version: u32,
    hierarchy: &Hierarchy,
) -> Result<Vec<Property>> {
    let resources = &config.resources;
    let mut props = Vec::new();

    if let Some(memory) = resources.memory_limit() {
        props.push(Property::u64("MemoryLimit", limit_or_infinity(memory)));
    }

    if let Some(shares) = resources.cpu_shares_weight() {
        props.push(Property::u64("CPUShares", shares));
    }

    if let Some(quota) = resources.cpu_quota {
        props.push(Property::u64(
            "CPUQuotaPerSecUSec",
            cpu_quota_per_sec(quota, resources.cpu_period),
        ));
    }
    if let Some(period) = resources.cpu_period {
        if version >= MIN_QUOTA_PERIOD_VERSION {
            props.push(Property::u64("CPUQuotaPeriodUSec", period));
        } else {
            debug!(
                "systemd {} does not support CPUQuotaPeriodUSec, leaving it to the cpu controller",
                version
            );
        }
    }

    if let Some(weight) = resources.blkio_weight_value() {
        props.push(Property::u64("BlockIOWeight", weight as u64));
    }

    if let Some(limit) = resources.pids_limit {
        props.push(Property::bool("TasksAccounting", true));
        props.push(Property::u64("TasksMax", limit_or_infinity(limit)));
    }

    for (name, list) in [
        ("AllowedCPUs", &resources.cpuset_cpus),
        ("AllowedMemoryNodes", &resources.cpuset_mems),
    ] {
        let Some(list) = list.as_deref().filter(|l| !l.is_empty()) else {
            continue;
        };
        if version < MIN_CPUSET_VERSION {
            debug!("systemd {} does not support {}, skipping", version, name);
            continue;
        }
        props.push(Property::new(name, PropertyValue::Bytes(cpuset_bits(list)?)));
    }

    if !config.skip_devices {
        props.extend(device_properties(&resources.devices, hierarchy)?);
    }

    Ok(props)
}

/// Properties of a new transient delegated unit
///
/// Delegation and accounting are always on, whatever the caller asked for.
pub fn transient_unit_properties(
    config: &CgroupConfig,
    unit: &str,
    pid: Option<u32>,
    version: u32,
    hierarchy: &Hierarchy,
) -> Result<Vec<Property>> {
    let mut props = vec![Property::string(
        "Description",
        &format!("cgdelegate container {}", config.name),
    )];

    // Slice units are refused before we get here, so the unit always has a parent slice
    props.push(Property::string("Slice", config.slice()));

    if let Some(pid) = pid {
        props.push(Property::new("PIDs", PropertyValue::U32Array(vec![pid])));
    }

    props.push(Property::bool("Delegate", true));
    props.push(Property::bool("MemoryAccounting", true));
    props.push(Property::bool("CPUAccounting", true));
    props.push(Property::bool("BlockIOAccounting", true));
    props.push(Property::bool("DefaultDependencies", false));

    props.extend(resource_properties(config, version, hierarchy)?);
    props.extend(config.systemd_props.iter().cloned());

    Ok(props)
}

/// A pending `DeviceAllow` entry
#[derive(Debug, Clone, PartialEq, Eq)]
struct AllowEntry {
    kind: DeviceType,
    major: Option<i64>,
    minor: Option<i64>,
    permissions: String,
}

impl AllowEntry {
    fn matches(&self, rule: &DeviceRule) -> bool {
        (rule.kind == DeviceType::All || rule.kind == self.kind)
            && (rule.major.is_none() || rule.major == self.major)
            && (rule.minor.is_none() || rule.minor == self.minor)
    }
}

/// Folds an ordered rule list into systemd's allow-list model
#[derive(Debug, Default)]
struct DeviceEmulator {
    default_allow: bool,
    allowed: Vec<AllowEntry>,
}

impl DeviceEmulator {
    fn apply(&mut self, rule: &DeviceRule) {
        if rule.is_wildcard_all() {
            self.default_allow = rule.allow;
            self.allowed.clear();
            return;
        }

        if rule.allow {
            if self.default_allow {
                return;
            }
            let kinds: &[DeviceType] = match rule.kind {
                DeviceType::All => &[DeviceType::Char, DeviceType::Block],
                DeviceType::Char => &[DeviceType::Char],
                DeviceType::Block => &[DeviceType::Block],
            };
            for kind in kinds {
                self.allowed.push(AllowEntry {
                    kind: *kind,
                    major: rule.major,
                    minor: rule.minor,
                    permissions: rule.permissions.clone(),
                });
            }
            return;
        }

        if self.default_allow {
            warn!(
                "Device rule {:?} cannot be expressed on top of allow-all, ignoring",
                rule.cgroup_string()
            );
            return;
        }

        for entry in self.allowed.iter_mut().filter(|e| e.matches(rule)) {
            entry.permissions.retain(|p| !rule.permissions.contains(p));
        }
        self.allowed.retain(|e| !e.permissions.is_empty());
    }
}

/// `DevicePolicy` and `DeviceAllow` for an ordered rule list
///
/// An empty list leaves the unit's device policy alone.
pub fn device_properties(rules: &[DeviceRule], hierarchy: &Hierarchy) -> Result<Vec<Property>> {
    if rules.is_empty() {
        return Ok(Vec::new());
    }

    let mut emulator = DeviceEmulator::default();
    for rule in rules {
        emulator.apply(rule);
    }

    if emulator.default_allow {
        return Ok(vec![
            Property::string("DevicePolicy", "auto"),
            Property::new("DeviceAllow", PropertyValue::DeviceAllow(Vec::new())),
        ]);
    }

    let mut allow = Vec::new();
    for entry in &emulator.allowed {
        let group = match entry.kind {
            DeviceType::Block => "block",
            _ => "char",
        };

        let path = match (entry.major, entry.minor) {
            (None, _) => format!("{}-*", group),
            (Some(major), None) => match hierarchy.device_name(entry.kind, major)? {
                Some(name) => format!("{}-{}", group, name),
                None => {
                    warn!("No {} device with major {}, skipping rule", group, major);
                    continue;
                }
            },
            (Some(major), Some(minor)) => format!("/dev/{}/{}:{}", group, major, minor),
        };
        allow.push((path, entry.permissions.clone()));
    }

    Ok(vec![
        Property::string("DevicePolicy", "strict"),
        Property::new("DeviceAllow", PropertyValue::DeviceAllow(allow)),
    ])
}
