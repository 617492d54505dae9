//! Utility functions for cgroup operations

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use super::io::CgroupIo;
use crate::error::{CgroupError, Result};

/// Per-cgroup process membership file
pub const CGROUP_PROCS: &str = "cgroup.procs";

/// Per-cgroup task (thread) list
pub const CGROUP_TASKS: &str = "tasks";

/// Safe read file to string
pub fn read_cgroup_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| {
        if e.kind() == io::ErrorKind::PermissionDenied {
            CgroupError::PermissionDenied(format!("{:?}", path))
        } else {
            CgroupError::Io(e)
        }
    })
}

/// Safe write file
pub fn write_cgroup_file(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).map_err(|e| {
        if e.kind() == io::ErrorKind::PermissionDenied {
            CgroupError::PermissionDenied(format!("{:?}", path))
        } else {
            CgroupError::Io(e)
        }
    })
}

/// True when the error is a read or write of a file that does not exist
pub fn is_missing_file(err: &CgroupError) -> bool {
    matches!(err, CgroupError::Io(e) if e.kind() == io::ErrorKind::NotFound)
}

/// Parse a single cgroup value; `max` means unlimited
pub fn parse_uint(value: &str) -> Result<u64> {
    let value = value.trim();
    if value == "max" {
        return Ok(u64::MAX);
    }

    value.parse::<u64>().or_else(|e| {
        // The kernel reports some unlimited values as negative numbers
        match value.parse::<i64>() {
            Ok(v) if v < 0 => Ok(0),
            _ => Err(CgroupError::ParseError(format!(
                "Invalid value {:?}: {}",
                value, e
            ))),
        }
    })
}

/// Read a single-value cgroup file as an unsigned integer
pub fn read_u64(io: &dyn CgroupIo, dir: &Path, file: &str) -> Result<u64> {
    parse_uint(&io.read_file(dir, file)?)
}

/// Like `read_u64` but a missing file yields `None`
pub fn read_optional_u64(io: &dyn CgroupIo, dir: &Path, file: &str) -> Result<Option<u64>> {
    match read_u64(io, dir, file) {
        Ok(v) => Ok(Some(v)),
        Err(e) if is_missing_file(&e) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Parse flat keyed files such as `cpu.stat` or `memory.stat`
///
/// Format:
/// ```text
/// nr_periods 1000
/// nr_throttled 100
/// throttled_time 50000000
/// ```
pub fn parse_flat_keyed(content: &str) -> Result<HashMap<String, u64>> {
    let mut values = HashMap::new();

    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let mut parts = line.split_whitespace();
        let key = parts
            .next()
            .ok_or_else(|| CgroupError::ParseError(format!("Invalid line: {}", line)))?;
        let value = parts
            .next()
            .ok_or_else(|| CgroupError::ParseError(format!("Missing value for: {}", key)))?;
        values.insert(key.to_string(), parse_uint(value)?);
    }

    Ok(values)
}

/// Highest CPU or memory node index a list may name (the kernel's `NR_CPUS` ceiling)
pub const MAX_LIST_INDEX: u32 = 8191;

/// Parse the kernel list format (`0-3,7`) into sorted indices
pub fn parse_list(list: &str) -> Result<Vec<u32>> {
    let mut out = Vec::new();

    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        let invalid = || CgroupError::ParseError(format!("Invalid list entry: {:?}", part));
        let index = |s: &str| -> Result<u32> {
            let index: u32 = s.trim().parse().map_err(|_| invalid())?;
            if index > MAX_LIST_INDEX {
                return Err(CgroupError::ParseError(format!(
                    "List index {} in {:?} exceeds {}",
                    index, part, MAX_LIST_INDEX
                )));
            }
            Ok(index)
        };
        match part.split_once('-') {
            Some((start, end)) => {
                let start = index(start)?;
                let end = index(end)?;
                if end < start {
                    return Err(invalid());
                }
                out.extend(start..=end);
            }
            None => out.push(index(part)?),
        }
    }

    out.sort_unstable();
    out.dedup();
    Ok(out)
}

/// Place `pid` in the cgroup at `dir`; `None` is a no-op
pub fn write_cgroup_proc(io: &dyn CgroupIo, dir: &Path, pid: Option<u32>) -> Result<()> {
    let Some(pid) = pid else {
        return Ok(());
    };

    // EINVAL shows up when the task is mid-fork or mid-exit
    let mut attempt = 0;
    loop {
        match io.write_file(dir, CGROUP_PROCS, &pid.to_string()) {
            Err(CgroupError::Io(e)) if e.raw_os_error() == Some(libc::EINVAL) && attempt < 5 => {
                attempt += 1;
                thread::sleep(Duration::from_millis(30));
            }
            Err(e) => return Err(e),
            Ok(()) => {
                debug!("Added process {} to cgroup {:?}", pid, dir);
                return Ok(());
            }
        }
    }
}

/// Join `pid` into every existing path of the map
pub fn enter_pid(io: &dyn CgroupIo, paths: &HashMap<String, PathBuf>, pid: Option<u32>) -> Result<()> {
    for path in paths.values() {
        if path.exists() {
            write_cgroup_proc(io, path, pid)?;
        }
    }
    Ok(())
}

fn parse_pids(content: &str) -> Vec<u32> {
    content
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect()
}

/// Processes directly in the cgroup at `dir`
pub fn get_pids(io: &dyn CgroupIo, dir: &Path) -> Result<Vec<u32>> {
    Ok(parse_pids(&io.read_file(dir, CGROUP_PROCS)?))
}

/// Processes in the cgroup at `dir` and all of its descendants
pub fn get_all_pids(io: &dyn CgroupIo, dir: &Path) -> Result<Vec<u32>> {
    let mut pids = match io.read_file(dir, CGROUP_PROCS) {
        Ok(content) => parse_pids(&content),
        Err(e) if is_missing_file(&e) => Vec::new(),
        Err(e) => return Err(e),
    };

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            pids.extend(get_all_pids(io, &entry.path())?);
        }
    }

    Ok(pids)
}

/// Check if a path exists on disk
pub fn path_exists(path: &Path) -> bool {
    !path.as_os_str().is_empty() && path.exists()
}

/// Remove a cgroup directory and every child cgroup below it
///
/// On cgroupfs the control files vanish with the directory, so a plain
/// `rmdir` is enough once children are gone. A busy cgroup is retried.
pub fn remove_path(path: &Path) -> Result<()> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            remove_path(&entry.path())?;
        }
    }

    let mut delay = Duration::from_millis(10);
    for attempt in 0..5 {
        match fs::remove_dir(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => {
                // Not cgroupfs: the directory holds real files
                fs::remove_dir_all(path)?;
                return Ok(());
            }
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempt < 4 => {
                thread::sleep(delay);
                delay *= 2;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Remove every path of the map
///
/// Every path is attempted even after a failure; the first failure is
/// returned once all attempts are done.
pub fn remove_paths(paths: &HashMap<String, PathBuf>) -> Result<()> {
    let mut first_error = None;

    for (name, path) in paths {
        if let Err(e) = remove_path(path) {
            warn!("Failed to remove {} cgroup {:?}: {}", name, path, e);
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
