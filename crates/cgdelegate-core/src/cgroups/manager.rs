//! Lifecycle manager of one container's systemd-delegated cgroups
//!
//! A transient systemd unit owns the container's cgroup; limits are pushed
//! as unit properties and, for knobs systemd does not expose, written to the
//! controller files directly. With caller-provided paths the manager only
//! joins them and never talks to systemd.
//!
//! Every public operation is one-shot. `apply` does not stop a unit it
//! already started when a later step fails: callers must follow a failed
//! `apply` with `destroy`. `destroy` is the only best-effort operation; it
//! removes every known directory even after the unit failed to stop.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::child::ChildCgroupDelegator;
use super::config::{CgroupConfig, ContainerConfig, FreezerState};
use super::controller::{FreezerController, MemoryController};
use super::freezer::FreezerCoordinator;
use super::hierarchy::Hierarchy;
use super::io::{CgroupIo, HostIo};
use super::stats::Stats;
use super::subsystem::{Subsystem, SubsystemRegistry};
use super::utils::{
    enter_pid, get_all_pids, get_pids, is_missing_file, path_exists, remove_paths, CGROUP_TASKS,
};
use crate::error::{CgroupError, Result};
use crate::systemd::{
    resource_properties, transient_unit_properties, DbusClient, SystemdClient,
    MIN_DELEGATE_VERSION, SLICE_SUFFIX,
};

const DEVICES: &str = "devices";
const FREEZER: &str = "freezer";
const MEMORY: &str = "memory";

/// Kind of cgroup manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CgroupType {
    /// cgroup v1 hierarchy delegated by systemd
    V1Systemd,
}

impl fmt::Display for CgroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CgroupType::V1Systemd => f.write_str("cgroup v1 (systemd)"),
        }
    }
}

/// Mutable manager state, guarded by the manager's lock
#[derive(Debug)]
struct ManagerState {
    config: CgroupConfig,

    /// Controller name to cgroup path; empty until `apply` succeeds
    paths: HashMap<String, PathBuf>,

    child_cgroup_created: bool,
}

/// Cgroup manager for one container
pub struct CgroupManager {
    state: Mutex<ManagerState>,
    client: Arc<dyn SystemdClient>,
    registry: SubsystemRegistry,
    hierarchy: Hierarchy,
    io: Arc<dyn CgroupIo>,
}

/// Builder for [`CgroupManager`]; unset collaborators default to the host's
pub struct CgroupManagerBuilder {
    config: CgroupConfig,
    client: Option<Arc<dyn SystemdClient>>,
    registry: SubsystemRegistry,
    hierarchy: Hierarchy,
    io: Option<Arc<dyn CgroupIo>>,
    paths: Option<HashMap<String, PathBuf>>,
}

impl CgroupManagerBuilder {
    pub fn client(mut self, client: Arc<dyn SystemdClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn registry(mut self, registry: SubsystemRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn hierarchy(mut self, hierarchy: Hierarchy) -> Self {
        self.hierarchy = hierarchy;
        self
    }

    pub fn io(mut self, io: Arc<dyn CgroupIo>) -> Self {
        self.io = Some(io);
        self
    }

    /// Paths of an already applied container, e.g. saved by an earlier process
    pub fn paths(mut self, paths: HashMap<String, PathBuf>) -> Self {
        self.paths = Some(paths);
        self
    }

    pub fn build(self) -> CgroupManager {
        let restored = self.paths.is_some();

        CgroupManager {
            state: Mutex::new(ManagerState {
                config: self.config,
                paths: self.paths.unwrap_or_default(),
                child_cgroup_created: restored,
            }),
            client: self.client.unwrap_or_else(|| Arc::new(DbusClient::new())),
            registry: self.registry,
            hierarchy: self.hierarchy,
            io: self.io.unwrap_or_else(|| Arc::new(HostIo)),
        }
    }
}

impl CgroupManager {
    /// Manager for `config` on the running host
    pub fn new(config: CgroupConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: CgroupConfig) -> CgroupManagerBuilder {
        CgroupManagerBuilder {
            config,
            client: None,
            registry: SubsystemRegistry::legacy(),
            hierarchy: Hierarchy::host(),
            io: None,
            paths: None,
        }
    }

    /// Manager for a container whose cgroups were applied earlier
    ///
    /// The child cgroup is assumed to exist as well.
    pub fn with_paths(config: CgroupConfig, paths: HashMap<String, PathBuf>) -> Self {
        Self::builder(config).paths(paths).build()
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        // The state holds no invariant a panicking holder could break halfway
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create (or join) the container's cgroups and move `pid` into them
    ///
    /// `None` creates the unit without attaching a process.
    pub fn apply(&self, pid: Option<u32>) -> Result<()> {
        let mut state = self.lock();
        state.config.resources.ensure_v1()?;
        state.config.resources.validate()?;

        if let Some(paths) = state.config.paths.clone() {
            return self.join_existing_locked(&mut state, paths, pid);
        }

        let unit = state.config.unit_name();
        if unit.ends_with(SLICE_SUFFIX) {
            return Err(CgroupError::UnsupportedUnitType(format!(
                "{}: cgroup delegation does not work for slices",
                unit
            )));
        }

        let version = self.client.version()?;
        if version < MIN_DELEGATE_VERSION {
            return Err(CgroupError::UnsupportedSystemdVersion {
                found: version,
                required: MIN_DELEGATE_VERSION,
            });
        }

        let properties =
            transient_unit_properties(&state.config, &unit, pid, version, &self.hierarchy)?;

        if state.config.resources.kernel_memory_limit().is_some() {
            self.enable_kernel_memory_locked(&state.config, &unit)?;
        }

        self.client.start_transient_unit(&unit, &properties)?;
        info!("Started transient unit {} (systemd {})", unit, version);

        let slice = state.config.slice().to_string();
        let mut paths = HashMap::new();
        for subsystem in self.registry.iter() {
            match self.hierarchy.subsystem_path(subsystem.name(), &slice, &unit) {
                Ok(path) => {
                    paths.insert(subsystem.name().to_string(), path);
                }
                // Device isolation is mandatory
                Err(e) if subsystem == Subsystem::Devices => return Err(e),
                Err(e) if e.is_not_found() => {
                    debug!("Controller {} not available on this host: {}", subsystem, e);
                }
                Err(e) => return Err(e),
            }
        }
        state.paths = paths;

        self.join_cgroups_locked(&state, pid)
    }

    /// Join mode: keep the caller's paths for controllers mounted here
    fn join_existing_locked(
        &self,
        state: &mut ManagerState,
        paths: HashMap<String, PathBuf>,
        pid: Option<u32>,
    ) -> Result<()> {
        let mounted = self.hierarchy.self_cgroups()?;

        state.paths = paths
            .into_iter()
            .filter(|(name, _)| {
                let keep = mounted.contains_key(name);
                if !keep {
                    debug!("Dropping path for unmounted controller {}", name);
                }
                keep
            })
            .collect();

        enter_pid(self.io.as_ref(), &state.paths, pid)
    }

    fn join_cgroups_locked(&self, state: &ManagerState, pid: Option<u32>) -> Result<()> {
        for subsystem in self.registry.iter() {
            let Some(path) = state.paths.get(subsystem.name()) else {
                continue;
            };
            subsystem.join(self.io.as_ref(), path, &state.config, pid)?;
        }
        Ok(())
    }

    /// Kernel memory accounting can only be switched on while the memory
    /// cgroup has no tasks, so it happens before the unit starts
    fn enable_kernel_memory_locked(&self, config: &CgroupConfig, unit: &str) -> Result<()> {
        let path = match self.hierarchy.subsystem_path(MEMORY, config.slice(), unit) {
            Ok(path) => path,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        fs::create_dir_all(&path)?;

        let tasks = match self.io.read_file(&path, CGROUP_TASKS) {
            Ok(tasks) => tasks,
            Err(e) if is_missing_file(&e) => String::new(),
            Err(e) => return Err(e),
        };
        if !tasks.trim().is_empty() {
            debug!(
                "Memory cgroup {:?} already has tasks, leaving kernel memory accounting as is",
                path
            );
            return Ok(());
        }

        MemoryController::enable_kernel_memory_accounting(self.io.as_ref(), &path)
    }

    /// Update the container's limits
    ///
    /// Properties go to systemd first, with the container frozen unless this
    /// manager was created with `skip_devices`, then every controller writes
    /// its own files. Managers in join mode never own resource policy.
    pub fn set(&self, config: &CgroupConfig) -> Result<()> {
        let state = self.lock();
        if state.config.is_join_mode() {
            return Ok(());
        }
        config.resources.ensure_v1()?;
        config.resources.validate()?;

        let version = self.client.version()?;
        let properties = resource_properties(config, version, &self.hierarchy)?;
        let unit = state.config.unit_name();
        let push = || self.client.set_unit_properties(&unit, true, &properties);

        if state.config.skip_devices {
            push()?;
        } else {
            let freezer_path = state.paths.get(FREEZER).map(PathBuf::as_path);
            FreezerCoordinator::new(self.io.as_ref(), freezer_path).run(push)?;
        }

        for subsystem in self.registry.iter() {
            let Some(path) = state.paths.get(subsystem.name()) else {
                continue;
            };
            subsystem.set(self.io.as_ref(), path, config)?;
        }
        Ok(())
    }

    /// Stop the unit and remove every cgroup directory
    ///
    /// Directories are removed even when stopping fails. A removal failure
    /// is returned first; otherwise the stop outcome is.
    pub fn destroy(&self) -> Result<()> {
        let mut state = self.lock();
        if state.config.is_join_mode() {
            return Ok(());
        }

        let unit = state.config.unit_name();
        let stopped = self.client.stop_unit(&unit);
        if let Err(e) = &stopped {
            warn!("Failed to stop unit {}: {}", unit, e);
        }

        remove_paths(&state.paths)?;
        state.paths.clear();
        state.child_cgroup_created = false;

        info!("Destroyed cgroups of unit {}", unit);
        stopped
    }

    /// Move the container to `freezer_state`
    pub fn freeze(&self, freezer_state: FreezerState) -> Result<()> {
        let mut state = self.lock();
        let path = state
            .paths
            .get(FREEZER)
            .cloned()
            .ok_or_else(|| CgroupError::SubsystemUnresolved(FREEZER.to_string()))?;

        let previous = state.config.resources.freezer;
        state.config.resources.freezer = freezer_state;

        if let Err(e) = FreezerController::set(self.io.as_ref(), &path, freezer_state) {
            state.config.resources.freezer = previous;
            return Err(e);
        }
        Ok(())
    }

    /// Live freezer state; `Undefined` without a freezer cgroup
    pub fn get_freezer_state(&self) -> Result<FreezerState> {
        let state = self.lock();
        match state.paths.get(FREEZER) {
            Some(path) => FreezerController::get_state(self.io.as_ref(), path),
            None => Ok(FreezerState::Undefined),
        }
    }

    /// Statistics of every resolved controller
    pub fn get_stats(&self) -> Result<Stats> {
        let state = self.lock();
        let mut stats = Stats::new();

        for subsystem in self.registry.iter() {
            let Some(path) = state.paths.get(subsystem.name()) else {
                continue;
            };
            subsystem.get_stats(self.io.as_ref(), path, &mut stats)?;
        }
        Ok(stats)
    }

    fn devices_path(&self) -> Result<PathBuf> {
        self.lock()
            .paths
            .get(DEVICES)
            .cloned()
            .ok_or_else(|| CgroupError::SubsystemUnresolved(DEVICES.to_string()))
    }

    /// Processes directly in the container cgroup
    pub fn get_pids(&self) -> Result<Vec<u32>> {
        get_pids(self.io.as_ref(), &self.devices_path()?)
    }

    /// Processes in the container cgroup and any cgroup below it
    pub fn get_all_pids(&self) -> Result<Vec<u32>> {
        get_all_pids(self.io.as_ref(), &self.devices_path()?)
    }

    pub fn path(&self, subsystem: &str) -> Option<PathBuf> {
        self.lock().paths.get(subsystem).cloned()
    }

    pub fn get_paths(&self) -> HashMap<String, PathBuf> {
        self.lock().paths.clone()
    }

    pub fn get_cgroups(&self) -> CgroupConfig {
        self.lock().config.clone()
    }

    pub fn get_type(&self) -> CgroupType {
        CgroupType::V1Systemd
    }

    /// Whether the container's devices cgroup is on disk
    pub fn exists(&self) -> bool {
        self.lock()
            .paths
            .get(DEVICES)
            .is_some_and(|path| path_exists(path))
    }

    fn child_delegator(state: &ManagerState) -> ChildCgroupDelegator {
        ChildCgroupDelegator::new(&state.paths, &state.config.child_cgroup_dir)
    }

    /// Create the nested cgroup the container's init delegates from
    pub fn create_child_cgroup(&self, container: &ContainerConfig) -> Result<()> {
        let mut state = self.lock();
        if state.paths.is_empty() {
            return Err(CgroupError::ContainerCgroupNotJoined);
        }

        let owner = container.host_root_uid().zip(container.host_root_gid());
        Self::child_delegator(&state)
            .create(self.io.as_ref(), owner)
            .map_err(|e| CgroupError::ChildCgroup(format!("failed to create: {}", e)))?;

        state.child_cgroup_created = true;
        Ok(())
    }

    /// Move `pid` into the nested cgroup
    pub fn apply_child_cgroup(&self, pid: u32) -> Result<()> {
        let state = self.lock();
        if !state.child_cgroup_created {
            return Err(CgroupError::ChildCgroupNotCreated);
        }
        if state.paths.is_empty() {
            return Err(CgroupError::ContainerCgroupNotJoined);
        }

        Self::child_delegator(&state)
            .apply(self.io.as_ref(), pid)
            .map_err(|e| CgroupError::ChildCgroup(format!("failed to join pid {}: {}", pid, e)))
    }

    /// Paths of the nested cgroup; empty until it was created
    pub fn get_child_cgroup_paths(&self) -> HashMap<String, PathBuf> {
        let state = self.lock();
        if !state.child_cgroup_created {
            return HashMap::new();
        }
        Self::child_delegator(&state).paths().clone()
    }
}
