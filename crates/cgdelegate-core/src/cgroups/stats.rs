//! Resource usage statistics gathered from the controllers

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// CPU throttling statistics (`cpu.stat`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottlingStats {
    /// Number of enforcement periods
    pub periods: u64,

    /// Number of throttled periods
    pub throttled_periods: u64,

    /// Total throttled time (nanoseconds)
    pub throttled_time: u64,
}

impl ThrottlingStats {
    /// Calculate throttle percentage
    pub fn throttle_percentage(&self) -> f64 {
        if self.periods == 0 {
            return 0.0;
        }
        (self.throttled_periods as f64 / self.periods as f64) * 100.0
    }
}

/// CPU accounting statistics (`cpuacct.*`), all in nanoseconds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuUsage {
    pub total_usage: u64,
    pub percpu_usage: Vec<u64>,
    pub usage_in_kernelmode: u64,
    pub usage_in_usermode: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuStats {
    pub usage: CpuUsage,
    pub throttling: ThrottlingStats,
}

/// Usage counters of one memory resource (memory, memsw or kmem)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryData {
    pub usage: u64,
    pub max_usage: u64,
    pub failcnt: u64,
    pub limit: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    /// Page cache (bytes)
    pub cache: u64,
    pub usage: MemoryData,
    pub swap_usage: MemoryData,
    pub kernel_usage: MemoryData,
    /// Raw `memory.stat` values
    pub stats: HashMap<String, u64>,
}

impl MemoryStats {
    /// Get current usage in MB
    pub fn usage_mb(&self) -> u64 {
        self.usage.usage / 1024 / 1024
    }

    /// Get peak usage in MB
    pub fn max_usage_mb(&self) -> u64 {
        self.usage.max_usage / 1024 / 1024
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidsStats {
    pub current: u64,
    /// 0 when unlimited
    pub limit: u64,
}

/// One line of a blkio statistics file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlkioStatEntry {
    pub major: u64,
    pub minor: u64,
    pub op: String,
    pub value: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlkioStats {
    pub io_service_bytes_recursive: Vec<BlkioStatEntry>,
    pub io_serviced_recursive: Vec<BlkioStatEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HugetlbStats {
    pub usage: u64,
    pub max_usage: u64,
    pub failcnt: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpusetStats {
    pub cpus: Vec<u32>,
    pub mems: Vec<u32>,
}

/// Aggregate statistics of every resolved controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub cpu: CpuStats,
    pub memory: MemoryStats,
    pub pids: PidsStats,
    pub blkio: BlkioStats,
    /// Keyed by page size, e.g. `2MB`
    pub hugetlb: HashMap<String, HugetlbStats>,
    pub cpuset: CpusetStats,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }
}
