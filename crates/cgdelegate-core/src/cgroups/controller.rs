//! Controller-specific operations for the cgroup v1 controllers

use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::debug;

use super::config::{DeviceRule, FreezerState, Resources};
use super::io::CgroupIo;
use super::stats::{
    BlkioStatEntry, BlkioStats, CpusetStats, HugetlbStats, MemoryData, Stats,
};
use super::utils::{
    is_missing_file, parse_flat_keyed, parse_list, parse_uint, read_optional_u64, read_u64,
    write_cgroup_proc,
};
use crate::error::{CgroupError, Result};

/// Kernel reports `cpuacct.stat` in USER_HZ, which is 100 on Linux
const USER_HZ: u64 = 100;
const NANOS_PER_SEC: u64 = 1_000_000_000;

fn write_if_set<T: ToString>(
    io: &dyn CgroupIo,
    path: &Path,
    file: &str,
    value: Option<T>,
) -> Result<()> {
    if let Some(value) = value {
        io.write_file(path, file, &value.to_string())?;
    }
    Ok(())
}

/// Read a file whose absence means "empty"
fn read_or_empty(io: &dyn CgroupIo, path: &Path, file: &str) -> Result<String> {
    match io.read_file(path, file) {
        Ok(content) => Ok(content.trim().to_string()),
        Err(e) if is_missing_file(&e) => Ok(String::new()),
        Err(e) => Err(e),
    }
}

/// Cpuset controller operations
pub struct CpusetController;

impl CpusetController {
    const CPUS: &'static str = "cpuset.cpus";
    const MEMS: &'static str = "cpuset.mems";

    pub fn set(io: &dyn CgroupIo, path: &Path, resources: &Resources) -> Result<()> {
        let non_empty = |v: &Option<String>| v.as_ref().filter(|s| !s.is_empty()).cloned();
        write_if_set(io, path, Self::CPUS, non_empty(&resources.cpuset_cpus))?;
        write_if_set(io, path, Self::MEMS, non_empty(&resources.cpuset_mems))?;
        Ok(())
    }

    /// Effective masks, or the configured ones on kernels without `effective_*`
    pub fn get_stats(io: &dyn CgroupIo, path: &Path, stats: &mut Stats) -> Result<()> {
        let read_mask = |effective: &str, configured: &str| -> Result<Vec<u32>> {
            let value = read_or_empty(io, path, effective)?;
            if !value.is_empty() {
                return parse_list(&value);
            }
            parse_list(&read_or_empty(io, path, configured)?)
        };

        stats.cpuset = CpusetStats {
            cpus: read_mask("cpuset.effective_cpus", Self::CPUS)?,
            mems: read_mask("cpuset.effective_mems", Self::MEMS)?,
        };
        Ok(())
    }

    /// Create `dir` and move `pid` into it
    ///
    /// The kernel refuses tasks in a cpuset without CPUs or memory nodes, so
    /// empty ancestors inherit their parent's masks first, then `dir` gets
    /// either the configured masks or its parent's.
    pub fn apply_dir(
        io: &dyn CgroupIo,
        dir: &Path,
        resources: &Resources,
        pid: Option<u32>,
    ) -> Result<()> {
        if let Some(parent) = dir.parent() {
            Self::ensure_parent(io, parent)?;
        }

        if !dir.exists() {
            fs::create_dir(dir)?;
        }

        Self::set(io, dir, resources)?;
        if let Some(parent) = dir.parent() {
            Self::copy_if_needed(io, dir, parent)?;
        }

        write_cgroup_proc(io, dir, pid)
    }

    fn ensure_parent(io: &dyn CgroupIo, current: &Path) -> Result<()> {
        if Self::has_masks(io, current)? {
            return Ok(());
        }

        let Some(parent) = current.parent() else {
            return Ok(());
        };
        Self::ensure_parent(io, parent)?;

        if !current.exists() {
            fs::create_dir(current)?;
        }
        Self::copy_if_needed(io, current, parent)
    }

    fn has_masks(io: &dyn CgroupIo, dir: &Path) -> Result<bool> {
        Ok(!read_or_empty(io, dir, Self::CPUS)?.is_empty()
            && !read_or_empty(io, dir, Self::MEMS)?.is_empty())
    }

    fn copy_if_needed(io: &dyn CgroupIo, current: &Path, parent: &Path) -> Result<()> {
        for file in [Self::CPUS, Self::MEMS] {
            if !read_or_empty(io, current, file)?.is_empty() {
                continue;
            }
            let inherited = read_or_empty(io, parent, file)?;
            if !inherited.is_empty() {
                debug!("Inheriting {} {:?} into {:?}", file, inherited, current);
                io.write_file(current, file, &inherited)?;
            }
        }
        Ok(())
    }
}

/// Devices controller operations
pub struct DevicesController;

impl DevicesController {
    pub fn set(io: &dyn CgroupIo, path: &Path, rules: &[DeviceRule]) -> Result<()> {
        for rule in rules {
            let file = if rule.allow {
                "devices.allow"
            } else {
                "devices.deny"
            };
            io.write_file(path, file, &rule.cgroup_string())?;
        }
        Ok(())
    }
}

/// Memory controller operations
pub struct MemoryController;

impl MemoryController {
    const LIMIT: &'static str = "memory.limit_in_bytes";
    const SWAP_LIMIT: &'static str = "memory.memsw.limit_in_bytes";
    const KMEM_LIMIT: &'static str = "memory.kmem.limit_in_bytes";

    pub fn set(io: &dyn CgroupIo, path: &Path, resources: &Resources) -> Result<()> {
        Self::set_memory_and_swap(io, path, resources)?;
        write_if_set(io, path, Self::KMEM_LIMIT, resources.kernel_memory_limit())?;
        Ok(())
    }

    /// Write memory and swap limits in an order the kernel accepts
    ///
    /// The kernel requires `limit <= memsw.limit` at every step, so when the
    /// swap limit grows past the current limit it must be written first.
    fn set_memory_and_swap(io: &dyn CgroupIo, path: &Path, resources: &Resources) -> Result<()> {
        let memory = resources.memory_limit();
        let mut swap = resources.memory_swap_limit();

        // Unlimited memory with unset swap means unlimited swap too
        if memory == Some(-1) && swap.is_none() {
            swap = Some(-1);
        }

        if let (Some(mem), Some(sw)) = (memory, swap) {
            let current = read_optional_u64(io, path, Self::LIMIT)?.unwrap_or(0);
            if sw == -1 || current < sw as u64 {
                io.write_file(path, Self::SWAP_LIMIT, &sw.to_string())?;
                io.write_file(path, Self::LIMIT, &mem.to_string())?;
                return Ok(());
            }
        }

        write_if_set(io, path, Self::LIMIT, memory)?;
        write_if_set(io, path, Self::SWAP_LIMIT, swap)?;
        Ok(())
    }

    /// Turn on kernel memory accounting
    ///
    /// Kernel memory is not accounted until a limit is set, and the limit
    /// can't be set once the cgroup has tasks. Kernels built without kmem
    /// have no limit file; nothing to do there.
    pub fn enable_kernel_memory_accounting(io: &dyn CgroupIo, path: &Path) -> Result<()> {
        if !path.join(Self::KMEM_LIMIT).exists() {
            return Ok(());
        }
        for value in ["1", "-1"] {
            io.write_file(path, Self::KMEM_LIMIT, value)?;
        }
        Ok(())
    }

    pub fn get_stats(io: &dyn CgroupIo, path: &Path, stats: &mut Stats) -> Result<()> {
        let values = parse_flat_keyed(&io.read_file(path, "memory.stat")?)?;
        stats.memory.cache = values.get("cache").copied().unwrap_or(0);
        stats.memory.stats = values;

        stats.memory.usage = Self::get_data(io, path, "")?.unwrap_or_default();
        stats.memory.swap_usage = Self::get_data(io, path, "memsw")?.unwrap_or_default();
        stats.memory.kernel_usage = Self::get_data(io, path, "kmem")?.unwrap_or_default();
        Ok(())
    }

    /// Usage counters for `memory`, `memory.memsw` or `memory.kmem`
    ///
    /// `None` when the kernel does not provide that resource (swap
    /// accounting off, kmem compiled out).
    fn get_data(io: &dyn CgroupIo, path: &Path, name: &str) -> Result<Option<MemoryData>> {
        let prefix = if name.is_empty() {
            "memory".to_string()
        } else {
            format!("memory.{}", name)
        };

        let Some(usage) = read_optional_u64(io, path, &format!("{}.usage_in_bytes", prefix))? else {
            if name.is_empty() {
                return Err(CgroupError::ParseError(format!(
                    "{:?} has no memory.usage_in_bytes",
                    path
                )));
            }
            return Ok(None);
        };

        Ok(Some(MemoryData {
            usage,
            max_usage: read_u64(io, path, &format!("{}.max_usage_in_bytes", prefix))?,
            failcnt: read_u64(io, path, &format!("{}.failcnt", prefix))?,
            limit: read_u64(io, path, &format!("{}.limit_in_bytes", prefix))?,
        }))
    }
}

/// CPU controller operations
pub struct CpuController;

impl CpuController {
    pub fn set(io: &dyn CgroupIo, path: &Path, resources: &Resources) -> Result<()> {
        write_if_set(io, path, "cpu.shares", resources.cpu_shares_weight())?;
        // Period first: a quota is validated against the current period
        write_if_set(io, path, "cpu.cfs_period_us", resources.cpu_period)?;
        write_if_set(io, path, "cpu.cfs_quota_us", resources.cpu_quota)?;
        Ok(())
    }

    /// Throttling statistics from `cpu.stat`
    pub fn get_stats(io: &dyn CgroupIo, path: &Path, stats: &mut Stats) -> Result<()> {
        let content = match io.read_file(path, "cpu.stat") {
            Ok(content) => content,
            Err(e) if is_missing_file(&e) => return Ok(()),
            Err(e) => return Err(e),
        };
        let values = parse_flat_keyed(&content)?;

        let throttling = &mut stats.cpu.throttling;
        throttling.periods = values.get("nr_periods").copied().unwrap_or(0);
        throttling.throttled_periods = values.get("nr_throttled").copied().unwrap_or(0);
        throttling.throttled_time = values.get("throttled_time").copied().unwrap_or(0);
        Ok(())
    }
}

/// CPU accounting controller operations
pub struct CpuacctController;

impl CpuacctController {
    pub fn get_stats(io: &dyn CgroupIo, path: &Path, stats: &mut Stats) -> Result<()> {
        let usage = &mut stats.cpu.usage;
        usage.total_usage = read_u64(io, path, "cpuacct.usage")?;
        usage.percpu_usage = io
            .read_file(path, "cpuacct.usage_percpu")?
            .split_whitespace()
            .map(parse_uint)
            .collect::<Result<Vec<_>>>()?;

        let ticks = parse_flat_keyed(&io.read_file(path, "cpuacct.stat")?)?;
        let to_nanos = |ticks: u64| ticks.saturating_mul(NANOS_PER_SEC / USER_HZ);
        usage.usage_in_usermode = to_nanos(ticks.get("user").copied().unwrap_or(0));
        usage.usage_in_kernelmode = to_nanos(ticks.get("system").copied().unwrap_or(0));
        Ok(())
    }
}

/// Pids controller operations
pub struct PidsController;

impl PidsController {
    pub fn set(io: &dyn CgroupIo, path: &Path, resources: &Resources) -> Result<()> {
        if let Some(limit) = resources.pids_limit {
            let value = if limit < 0 {
                "max".to_string()
            } else {
                limit.to_string()
            };
            io.write_file(path, "pids.max", &value)?;
        }
        Ok(())
    }

    pub fn get_stats(io: &dyn CgroupIo, path: &Path, stats: &mut Stats) -> Result<()> {
        stats.pids.current = read_u64(io, path, "pids.current")?;
        let limit = read_u64(io, path, "pids.max")?;
        stats.pids.limit = if limit == u64::MAX { 0 } else { limit };
        Ok(())
    }
}

/// Block IO controller operations
pub struct BlkioController;

impl BlkioController {
    pub fn set(io: &dyn CgroupIo, path: &Path, resources: &Resources) -> Result<()> {
        write_if_set(io, path, "blkio.weight", resources.blkio_weight_value())
    }

    /// CFQ statistics, or the throttling ones when CFQ is not in use
    pub fn get_stats(io: &dyn CgroupIo, path: &Path, stats: &mut Stats) -> Result<()> {
        let read = |primary: &str, fallback: &str| -> Result<Vec<BlkioStatEntry>> {
            let entries = parse_blkio(&read_or_empty(io, path, primary)?)?;
            if !entries.is_empty() {
                return Ok(entries);
            }
            parse_blkio(&read_or_empty(io, path, fallback)?)
        };

        stats.blkio = BlkioStats {
            io_service_bytes_recursive: read(
                "blkio.io_service_bytes_recursive",
                "blkio.throttle.io_service_bytes",
            )?,
            io_serviced_recursive: read(
                "blkio.io_serviced_recursive",
                "blkio.throttle.io_serviced",
            )?,
        };
        Ok(())
    }
}

/// Parse blkio statistic lines
///
/// Format:
/// ```text
/// 8:0 Read 4096
/// 8:0 Write 0
/// Total 4096
/// ```
fn parse_blkio(content: &str) -> Result<Vec<BlkioStatEntry>> {
    let mut entries = Vec::new();

    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 3 {
            continue;
        }
        let Some((major, minor)) = fields[0].split_once(':') else {
            continue;
        };
        let invalid = || CgroupError::ParseError(format!("Invalid blkio line: {}", line));

        entries.push(BlkioStatEntry {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
            op: fields[1].to_string(),
            value: parse_uint(fields[2])?,
        });
    }

    Ok(entries)
}

/// Hugetlb controller operations
pub struct HugetlbController;

impl HugetlbController {
    pub fn set(io: &dyn CgroupIo, path: &Path, resources: &Resources) -> Result<()> {
        for limit in &resources.hugetlb_limits {
            io.write_file(
                path,
                &format!("hugetlb.{}.limit_in_bytes", limit.pagesize),
                &limit.limit.to_string(),
            )?;
        }
        Ok(())
    }

    pub fn get_stats(io: &dyn CgroupIo, path: &Path, stats: &mut Stats) -> Result<()> {
        for entry in fs::read_dir(path)? {
            let file_name = entry?.file_name();
            let Some(pagesize) = file_name
                .to_str()
                .and_then(|n| n.strip_prefix("hugetlb."))
                .and_then(|n| n.strip_suffix(".usage_in_bytes"))
            else {
                continue;
            };

            let prefix = format!("hugetlb.{}", pagesize);
            stats.hugetlb.insert(
                pagesize.to_string(),
                HugetlbStats {
                    usage: read_u64(io, path, &format!("{}.usage_in_bytes", prefix))?,
                    max_usage: read_u64(io, path, &format!("{}.max_usage_in_bytes", prefix))?,
                    failcnt: read_u64(io, path, &format!("{}.failcnt", prefix))?,
                },
            );
        }
        Ok(())
    }
}

/// Freezer controller operations
pub struct FreezerController;

impl FreezerController {
    const STATE: &'static str = "freezer.state";
    const RETRIES: usize = 1000;
    const RETRY_DELAY: Duration = Duration::from_micros(100);

    /// Move the cgroup to `state` and wait until the kernel reports it
    pub fn set(io: &dyn CgroupIo, path: &Path, state: FreezerState) -> Result<()> {
        let Some(value) = state.as_kernel_str() else {
            return Ok(());
        };

        for _ in 0..Self::RETRIES {
            io.write_file(path, Self::STATE, value)?;
            if Self::get_state(io, path)? == state {
                return Ok(());
            }
            thread::sleep(Self::RETRY_DELAY);
        }

        if state == FreezerState::Frozen {
            // Never leave a half-frozen cgroup behind
            let _ = io.write_file(path, Self::STATE, "THAWED");
        }

        Err(CgroupError::Freezer(format!(
            "unable to set freezer state of {:?} to {}",
            path, value
        )))
    }

    /// Current state; `FREEZING` settles into `FROZEN` or is reported as such
    pub fn get_state(io: &dyn CgroupIo, path: &Path) -> Result<FreezerState> {
        for _ in 0..Self::RETRIES {
            match io.read_file(path, Self::STATE)?.trim() {
                "THAWED" => return Ok(FreezerState::Thawed),
                "FROZEN" => return Ok(FreezerState::Frozen),
                "FREEZING" => thread::sleep(Self::RETRY_DELAY),
                other => {
                    return Err(CgroupError::ParseError(format!(
                        "unknown freezer state {:?}",
                        other
                    )))
                }
            }
        }
        Ok(FreezerState::Frozen)
    }
}

/// Network classifier controller operations
pub struct NetClsController;

impl NetClsController {
    pub fn set(io: &dyn CgroupIo, path: &Path, resources: &Resources) -> Result<()> {
        write_if_set(io, path, "net_cls.classid", resources.net_cls_classid)
    }
}

/// Network priority controller operations
pub struct NetPrioController;

impl NetPrioController {
    pub fn set(io: &dyn CgroupIo, path: &Path, resources: &Resources) -> Result<()> {
        for entry in &resources.net_prio_ifpriomap {
            io.write_file(path, "net_prio.ifpriomap", &entry.cgroup_string())?;
        }
        Ok(())
    }
}
