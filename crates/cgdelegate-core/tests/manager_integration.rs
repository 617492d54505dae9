// Integration tests for CgroupManager
// A fake /proc and cgroup tree live in a temporary directory; systemd is
// replaced by a recording client. Tests against a real systemd are #[ignore]d.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cgdelegate_core::cgroups::config::IdMap;
use cgdelegate_core::cgroups::io::HostIo;
use cgdelegate_core::{
    CgroupConfig, CgroupError, CgroupIo, CgroupManager, ContainerConfig, FreezerState, Hierarchy,
    Property, PropertyValue, Resources, Result, SystemdClient,
};
use tempfile::TempDir;

const ALL_CONTROLLERS: &[&str] = &[
    "cpuset",
    "devices",
    "memory",
    "cpu,cpuacct",
    "pids",
    "blkio",
    "freezer",
    "name=systemd",
];

/// A host with cgroup v1 controllers mounted below a temporary directory
struct FakeHost {
    dir: TempDir,
}

impl FakeHost {
    fn new(controllers: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let host = Self { dir };

        let mut mountinfo = String::new();
        let mut cgroup = String::new();
        for (i, controller) in controllers.iter().enumerate() {
            let (mount_dir, options) = match controller.strip_prefix("name=") {
                Some(name) => (name.to_string(), format!("rw,xattr,{}", controller)),
                None => (controller.to_string(), format!("rw,{}", controller)),
            };
            let mountpoint = host.cgroup_root().join(&mount_dir);
            fs::create_dir_all(&mountpoint).unwrap();

            mountinfo.push_str(&format!(
                "{id} 25 0:{id} / {mp} rw,nosuid,nodev,noexec,relatime shared:{id} - cgroup cgroup {opts}\n",
                id = 30 + i,
                mp = mountpoint.display(),
                opts = options,
            ));
            // systemd >= 226 keeps PID 1 in init.scope on some hierarchies
            let init = if *controller == "cpuset" { "/" } else { "/init.scope" };
            cgroup.push_str(&format!("{}:{}:{}\n", i + 1, controller, init));
        }

        let proc_root = host.proc_root();
        fs::create_dir_all(proc_root.join("self")).unwrap();
        fs::create_dir_all(proc_root.join("1")).unwrap();
        fs::write(proc_root.join("self/mountinfo"), mountinfo).unwrap();
        fs::write(proc_root.join("self/cgroup"), &cgroup).unwrap();
        fs::write(proc_root.join("1/cgroup"), &cgroup).unwrap();
        fs::write(
            proc_root.join("devices"),
            "Character devices:\n  1 mem\n136 pts\n\nBlock devices:\n  8 sd\n",
        )
        .unwrap();

        let cpuset = host.cgroup_root().join("cpuset");
        if cpuset.exists() {
            fs::write(cpuset.join("cpuset.cpus"), "0-3\n").unwrap();
            fs::write(cpuset.join("cpuset.mems"), "0\n").unwrap();
        }

        host
    }

    fn proc_root(&self) -> PathBuf {
        self.dir.path().join("proc")
    }

    fn cgroup_root(&self) -> PathBuf {
        self.dir.path().join("cgroup")
    }

    fn hierarchy(&self) -> Hierarchy {
        Hierarchy::with_proc_root(self.proc_root())
    }

    /// Where a unit's cgroup lives for a controller mounted at `mount_dir`
    fn unit_path(&self, mount_dir: &str, unit: &str) -> PathBuf {
        self.cgroup_root()
            .join(mount_dir)
            .join("system.slice")
            .join(unit)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Version,
    Start(String, Vec<Property>),
    Stop(String),
    SetProperties(String, bool, Vec<Property>),
}

/// Records every request; optionally fails some of them
#[derive(Default)]
struct MockSystemd {
    version: u32,
    fail_stop: bool,
    fail_set: bool,
    calls: Mutex<Vec<Call>>,
    /// freezer.state to sample whenever properties are pushed
    watched_freezer: Mutex<Option<PathBuf>>,
    freezer_during_set: Mutex<Vec<String>>,
}

impl MockSystemd {
    fn new(version: u32) -> Arc<Self> {
        Arc::new(Self {
            version,
            ..Default::default()
        })
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn watch_freezer(&self, path: &Path) {
        *self.watched_freezer.lock().unwrap() = Some(path.join("freezer.state"));
    }

    fn freezer_during_set(&self) -> Vec<String> {
        self.freezer_during_set.lock().unwrap().clone()
    }
}

impl SystemdClient for MockSystemd {
    fn version(&self) -> Result<u32> {
        self.record(Call::Version);
        Ok(self.version)
    }

    fn start_transient_unit(&self, unit: &str, properties: &[Property]) -> Result<()> {
        self.record(Call::Start(unit.to_string(), properties.to_vec()));
        Ok(())
    }

    fn stop_unit(&self, unit: &str) -> Result<()> {
        self.record(Call::Stop(unit.to_string()));
        if self.fail_stop {
            return Err(CgroupError::Systemd("stop job failed".to_string()));
        }
        Ok(())
    }

    fn set_unit_properties(&self, unit: &str, runtime: bool, properties: &[Property]) -> Result<()> {
        self.record(Call::SetProperties(
            unit.to_string(),
            runtime,
            properties.to_vec(),
        ));
        if let Some(path) = self.watched_freezer.lock().unwrap().as_ref() {
            let state = fs::read_to_string(path).unwrap();
            self.freezer_during_set.lock().unwrap().push(state.trim().to_string());
        }
        if self.fail_set {
            return Err(CgroupError::Systemd("set properties job failed".to_string()));
        }
        Ok(())
    }
}

/// Host filesystem access whose writes to one file always fail
struct FaultyIo {
    failing_file: &'static str,
}

impl CgroupIo for FaultyIo {
    fn read_file(&self, dir: &Path, file: &str) -> Result<String> {
        HostIo.read_file(dir, file)
    }

    fn write_file(&self, dir: &Path, file: &str, data: &str) -> Result<()> {
        if file == self.failing_file {
            return Err(CgroupError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        HostIo.write_file(dir, file, data)
    }
}

fn manager(host: &FakeHost, client: Arc<MockSystemd>, config: CgroupConfig) -> CgroupManager {
    CgroupManager::builder(config)
        .client(client)
        .hierarchy(host.hierarchy())
        .build()
}

fn find<'a>(properties: &'a [Property], name: &str) -> Option<&'a PropertyValue> {
    properties
        .iter()
        .find(|p| p.name == name)
        .map(|p| &p.value)
}

fn started_properties(client: &MockSystemd) -> Vec<Property> {
    client
        .calls()
        .into_iter()
        .find_map(|call| match call {
            Call::Start(_, properties) => Some(properties),
            _ => None,
        })
        .expect("no unit was started")
}

#[test]
fn test_apply_creates_delegated_unit() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let client = MockSystemd::new(249);
    let manager = manager(&host, client.clone(), CgroupConfig::new("c1"));

    manager.apply(Some(4242)).unwrap();

    let calls = client.calls();
    assert_eq!(calls[0], Call::Version);
    assert!(matches!(&calls[1], Call::Start(unit, _) if unit == "c1.scope"));

    let properties = started_properties(&client);
    assert_eq!(
        find(&properties, "Slice"),
        Some(&PropertyValue::Str("system.slice".to_string()))
    );
    assert_eq!(
        find(&properties, "PIDs"),
        Some(&PropertyValue::U32Array(vec![4242]))
    );
    for flag in ["Delegate", "MemoryAccounting", "CPUAccounting", "BlockIOAccounting"] {
        assert_eq!(find(&properties, flag), Some(&PropertyValue::Bool(true)));
    }
    assert_eq!(
        find(&properties, "DefaultDependencies"),
        Some(&PropertyValue::Bool(false))
    );

    let devices = host.unit_path("devices", "c1.scope");
    assert_eq!(manager.path("devices"), Some(devices.clone()));
    assert_eq!(
        fs::read_to_string(devices.join("cgroup.procs")).unwrap(),
        "4242"
    );
    assert!(manager.exists());
    assert_eq!(manager.get_pids().unwrap(), vec![4242]);

    // cpuset inherited the root's masks before the pid was written
    let cpuset = host.unit_path("cpuset", "c1.scope");
    assert_eq!(fs::read_to_string(cpuset.join("cpuset.cpus")).unwrap(), "0-3");
    assert_eq!(fs::read_to_string(cpuset.join("cgroup.procs")).unwrap(), "4242");

    // cpu and cpuacct share a hierarchy
    assert_eq!(manager.path("cpu"), manager.path("cpuacct"));

    // systemd's own hierarchy is resolved but never touched
    assert!(manager.path("name=systemd").is_some());
    assert!(!host.unit_path("systemd", "c1.scope").exists());
}

#[test]
fn test_apply_tolerates_missing_controllers() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let manager = manager(&host, MockSystemd::new(249), CgroupConfig::new("c1"));

    manager.apply(Some(1)).unwrap();

    let paths = manager.get_paths();
    for absent in ["hugetlb", "perf_event", "net_cls", "net_prio"] {
        assert!(!paths.contains_key(absent), "{} should be absent", absent);
    }
    assert_eq!(paths.len(), 9);
}

#[test]
fn test_apply_requires_devices() {
    let controllers: Vec<&str> = ALL_CONTROLLERS
        .iter()
        .copied()
        .filter(|c| *c != "devices")
        .collect();
    let host = FakeHost::new(&controllers);
    let manager = manager(&host, MockSystemd::new(249), CgroupConfig::new("c1"));

    let err = manager.apply(Some(4242)).unwrap_err();
    assert!(err.is_not_found());
    assert!(manager.get_paths().is_empty());
    assert!(!manager.exists());
}

#[test]
fn test_apply_aborts_on_invalid_parent_slice() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let config = CgroupConfig::new("c1").with_parent("a--b.slice");
    let manager = manager(&host, MockSystemd::new(249), config);

    let err = manager.apply(Some(4242)).unwrap_err();
    assert!(matches!(err, CgroupError::InvalidSlice(_)), "{:?}", err);
    assert!(manager.get_paths().is_empty());
    assert!(!manager.exists());
}

#[test]
fn test_zero_limits_are_not_applied() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let client = MockSystemd::new(249);
    let config = CgroupConfig::new("c1")
        .with_parent("")
        .with_resources(Resources::new().with_memory(0).with_cpu_shares(0));
    let manager = manager(&host, client.clone(), config.clone());

    manager.apply(Some(4242)).unwrap();

    let properties = started_properties(&client);
    assert_eq!(
        find(&properties, "Slice"),
        Some(&PropertyValue::Str("system.slice".to_string()))
    );
    assert_eq!(find(&properties, "Delegate"), Some(&PropertyValue::Bool(true)));
    assert!(find(&properties, "MemoryLimit").is_none());
    assert!(find(&properties, "CPUShares").is_none());
    assert_eq!(
        fs::read_to_string(host.unit_path("devices", "c1.scope").join("cgroup.procs")).unwrap(),
        "4242"
    );

    let freezer = manager.path("freezer").unwrap();
    fs::write(freezer.join("freezer.state"), "THAWED\n").unwrap();
    manager.set(&config).unwrap();

    let memory = manager.path("memory").unwrap();
    assert!(!memory.join("memory.limit_in_bytes").exists());
    assert!(!manager.path("cpu").unwrap().join("cpu.shares").exists());
}

#[test]
fn test_join_mode_never_calls_systemd() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let client = MockSystemd::new(249);

    let devices = host.cgroup_root().join("devices/custom");
    let memory = host.cgroup_root().join("memory/custom");
    let rdma = host.cgroup_root().join("rdma/custom");
    for path in [&devices, &memory, &rdma] {
        fs::create_dir_all(path).unwrap();
    }
    let config = CgroupConfig::new("c1").with_paths(HashMap::from([
        ("devices".to_string(), devices.clone()),
        ("memory".to_string(), memory.clone()),
        ("rdma".to_string(), rdma.clone()),
    ]));
    let manager = manager(&host, client.clone(), config.clone());

    manager.apply(Some(7)).unwrap();

    assert!(client.calls().is_empty());
    let paths = manager.get_paths();
    assert_eq!(paths.len(), 2);
    assert!(!paths.contains_key("rdma"));
    assert_eq!(fs::read_to_string(devices.join("cgroup.procs")).unwrap(), "7");
    assert!(!rdma.join("cgroup.procs").exists());

    // Join-mode managers own no policy and no unit
    manager
        .set(&config.clone().with_resources(Resources::new().with_cpu_shares(512)))
        .unwrap();
    manager.destroy().unwrap();
    assert!(client.calls().is_empty());
    assert!(devices.exists());
}

#[test]
fn test_slice_unit_rejected_before_any_change() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let client = MockSystemd::new(249);
    let manager = manager(&host, client.clone(), CgroupConfig::new("pool.slice"));

    let err = manager.apply(Some(4242)).unwrap_err();
    assert!(matches!(err, CgroupError::UnsupportedUnitType(_)));
    assert!(client.calls().is_empty());
    assert!(!host.cgroup_root().join("devices/system.slice").exists());
}

#[test]
fn test_systemd_version_gate() {
    let host = FakeHost::new(ALL_CONTROLLERS);

    let client = MockSystemd::new(217);
    let err = manager(&host, client.clone(), CgroupConfig::new("c1"))
        .apply(None)
        .unwrap_err();
    assert!(matches!(
        err,
        CgroupError::UnsupportedSystemdVersion {
            found: 217,
            required: 218
        }
    ));
    assert_eq!(client.calls(), vec![Call::Version]);

    let client = MockSystemd::new(218);
    manager(&host, client.clone(), CgroupConfig::new("c1"))
        .apply(None)
        .unwrap();
    assert!(find(&started_properties(&client), "PIDs").is_none());
}

#[test]
fn test_set_freezes_around_property_push() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let client = MockSystemd::new(249);
    let manager = manager(&host, client.clone(), CgroupConfig::new("c1"));
    manager.apply(Some(4242)).unwrap();

    let freezer = manager.path("freezer").unwrap();
    fs::write(freezer.join("freezer.state"), "THAWED\n").unwrap();
    client.watch_freezer(&freezer);

    let update = CgroupConfig::new("c1").with_resources(Resources::new().with_cpu_shares(512));
    manager.set(&update).unwrap();

    assert_eq!(client.freezer_during_set(), vec!["FROZEN"]);
    assert_eq!(manager.get_freezer_state().unwrap(), FreezerState::Thawed);

    let pushed = client
        .calls()
        .into_iter()
        .find_map(|call| match call {
            Call::SetProperties(unit, runtime, properties) => Some((unit, runtime, properties)),
            _ => None,
        })
        .unwrap();
    assert_eq!(pushed.0, "c1.scope");
    assert!(pushed.1, "updates must be runtime-only");
    assert_eq!(find(&pushed.2, "CPUShares"), Some(&PropertyValue::U64(512)));

    // The cpu controller wrote the same value itself
    let cpu = manager.path("cpu").unwrap();
    assert_eq!(fs::read_to_string(cpu.join("cpu.shares")).unwrap(), "512");
}

#[test]
fn test_set_restores_freezer_after_failed_push() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let client = Arc::new(MockSystemd {
        version: 249,
        fail_set: true,
        ..Default::default()
    });
    let manager = manager(&host, client.clone(), CgroupConfig::new("c1"));
    manager.apply(Some(4242)).unwrap();

    let freezer = manager.path("freezer").unwrap();
    fs::write(freezer.join("freezer.state"), "THAWED\n").unwrap();
    client.watch_freezer(&freezer);

    let update = CgroupConfig::new("c1").with_resources(Resources::new().with_cpu_shares(512));
    let err = manager.set(&update).unwrap_err();

    assert!(matches!(err, CgroupError::Systemd(_)));
    assert_eq!(client.freezer_during_set(), vec!["FROZEN"]);
    assert_eq!(manager.get_freezer_state().unwrap(), FreezerState::Thawed);
    // Nothing written directly after systemd refused
    let cpu = manager.path("cpu").unwrap();
    assert!(!cpu.join("cpu.shares").exists());
}

#[test]
fn test_set_keeps_frozen_container_frozen() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let client = MockSystemd::new(249);
    let manager = manager(&host, client.clone(), CgroupConfig::new("c1"));
    manager.apply(Some(4242)).unwrap();

    let freezer = manager.path("freezer").unwrap();
    fs::write(freezer.join("freezer.state"), "FROZEN\n").unwrap();

    manager
        .set(&CgroupConfig::new("c1").with_resources(Resources::new().with_pids_limit(64)))
        .unwrap();
    assert_eq!(manager.get_freezer_state().unwrap(), FreezerState::Frozen);
}

#[test]
fn test_set_skip_devices_does_not_freeze() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let client = MockSystemd::new(249);
    let mut config = CgroupConfig::new("c1");
    config.skip_devices = true;
    let manager = manager(&host, client.clone(), config);
    manager.apply(Some(4242)).unwrap();

    let freezer = manager.path("freezer").unwrap();
    fs::write(freezer.join("freezer.state"), "THAWED\n").unwrap();
    client.watch_freezer(&freezer);

    let update = CgroupConfig::new("c1").with_resources(Resources::new().with_cpu_shares(256));
    manager.set(&update).unwrap();

    assert_eq!(client.freezer_during_set(), vec!["THAWED"]);
}

#[test]
fn test_update_cannot_opt_out_of_freeze() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let client = MockSystemd::new(249);
    let manager = manager(&host, client.clone(), CgroupConfig::new("c1"));
    manager.apply(Some(4242)).unwrap();

    let freezer = manager.path("freezer").unwrap();
    fs::write(freezer.join("freezer.state"), "THAWED\n").unwrap();
    client.watch_freezer(&freezer);

    // The manager's own config decides, not the update
    let mut update = CgroupConfig::new("c1").with_resources(Resources::new().with_cpu_shares(256));
    update.skip_devices = true;
    manager.set(&update).unwrap();

    assert_eq!(client.freezer_during_set(), vec!["FROZEN"]);
    assert_eq!(manager.get_freezer_state().unwrap(), FreezerState::Thawed);
}

#[test]
fn test_set_with_unreadable_freezer_pushes_nothing() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let client = MockSystemd::new(249);
    let manager = manager(&host, client.clone(), CgroupConfig::new("c1"));
    manager.apply(Some(4242)).unwrap();

    // No freezer.state in the container's freezer cgroup
    let freezer = manager.path("freezer").unwrap();
    assert!(!freezer.join("freezer.state").exists());

    let update = CgroupConfig::new("c1").with_resources(Resources::new().with_cpu_shares(512));
    assert!(manager.set(&update).is_err());

    assert!(!client
        .calls()
        .iter()
        .any(|call| matches!(call, Call::SetProperties(..))));
    let cpu = manager.path("cpu").unwrap();
    assert!(!cpu.join("cpu.shares").exists());
}

#[test]
fn test_failed_freeze_keeps_previous_state() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let manager = CgroupManager::builder(CgroupConfig::new("c1"))
        .client(MockSystemd::new(249))
        .hierarchy(host.hierarchy())
        .io(Arc::new(FaultyIo {
            failing_file: "freezer.state",
        }))
        .build();
    manager.apply(Some(4242)).unwrap();

    let freezer = manager.path("freezer").unwrap();
    fs::write(freezer.join("freezer.state"), "THAWED\n").unwrap();

    let err = manager.freeze(FreezerState::Frozen).unwrap_err();
    assert!(err.to_string().contains("injected write failure"));
    assert_eq!(manager.get_freezer_state().unwrap(), FreezerState::Thawed);
    assert_eq!(manager.get_cgroups().resources.freezer, FreezerState::Undefined);
}

#[test]
fn test_freeze_and_thaw() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let manager = manager(&host, MockSystemd::new(249), CgroupConfig::new("c1"));
    manager.apply(Some(4242)).unwrap();

    let freezer = manager.path("freezer").unwrap();
    fs::write(freezer.join("freezer.state"), "THAWED\n").unwrap();

    manager.freeze(FreezerState::Frozen).unwrap();
    assert_eq!(manager.get_freezer_state().unwrap(), FreezerState::Frozen);
    assert_eq!(manager.get_cgroups().resources.freezer, FreezerState::Frozen);

    manager.freeze(FreezerState::Thawed).unwrap();
    assert_eq!(manager.get_freezer_state().unwrap(), FreezerState::Thawed);
}

#[test]
fn test_destroy_removes_everything_even_if_stop_fails() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let client = Arc::new(MockSystemd {
        version: 249,
        fail_stop: true,
        ..Default::default()
    });
    let manager = manager(&host, client.clone(), CgroupConfig::new("c1"));
    manager.apply(Some(4242)).unwrap();

    // Something below the container cgroup, as a nested runtime would leave
    let nested = manager.path("memory").unwrap().join("inner");
    fs::create_dir_all(&nested).unwrap();
    fs::write(nested.join("cgroup.procs"), "").unwrap();

    let paths = manager.get_paths();
    let err = manager.destroy().unwrap_err();

    assert!(matches!(err, CgroupError::Systemd(msg) if msg == "stop job failed"));
    assert!(client.calls().contains(&Call::Stop("c1.scope".to_string())));
    for (name, path) in &paths {
        assert!(!path.exists(), "{} cgroup {:?} still exists", name, path);
    }
    assert!(manager.get_paths().is_empty());
}

#[test]
fn test_destroy_after_clean_stop() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let manager = manager(&host, MockSystemd::new(249), CgroupConfig::new("c1"));
    manager.apply(Some(4242)).unwrap();

    manager.destroy().unwrap();
    assert!(!manager.exists());
    assert!(!host.unit_path("devices", "c1.scope").exists());
}

#[test]
fn test_kernel_memory_enabled_before_unit_start() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let memory = host.unit_path("memory", "c1.scope");
    fs::create_dir_all(&memory).unwrap();
    fs::write(memory.join("memory.kmem.limit_in_bytes"), "0").unwrap();

    let config = CgroupConfig::new("c1")
        .with_resources(Resources::new().with_kernel_memory(64 * 1024 * 1024));
    manager(&host, MockSystemd::new(249), config)
        .apply(Some(4242))
        .unwrap();

    assert_eq!(
        fs::read_to_string(memory.join("memory.kmem.limit_in_bytes")).unwrap(),
        "-1"
    );
}

#[test]
fn test_kernel_memory_left_alone_with_tasks() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let memory = host.unit_path("memory", "c1.scope");
    fs::create_dir_all(&memory).unwrap();
    fs::write(memory.join("memory.kmem.limit_in_bytes"), "0").unwrap();
    fs::write(memory.join("tasks"), "1234\n").unwrap();

    let config = CgroupConfig::new("c1")
        .with_resources(Resources::new().with_kernel_memory(64 * 1024 * 1024));
    manager(&host, MockSystemd::new(249), config)
        .apply(Some(4242))
        .unwrap();

    assert_eq!(
        fs::read_to_string(memory.join("memory.kmem.limit_in_bytes")).unwrap(),
        "0"
    );
}

#[test]
fn test_get_stats() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let manager = manager(&host, MockSystemd::new(249), CgroupConfig::new("c1"));
    manager.apply(Some(4242)).unwrap();

    let memory = manager.path("memory").unwrap();
    let files = [
        ("memory.stat", "cache 4096\nrss 8192\n"),
        ("memory.usage_in_bytes", "12288\n"),
        ("memory.max_usage_in_bytes", "16384\n"),
        ("memory.failcnt", "0\n"),
        ("memory.limit_in_bytes", "536870912\n"),
    ];
    for (file, content) in files {
        fs::write(memory.join(file), content).unwrap();
    }

    // Without cpuacct files the aggregation fails as a whole
    assert!(manager.get_stats().is_err());

    let cpu = manager.path("cpuacct").unwrap();
    fs::write(cpu.join("cpuacct.usage"), "2000000000\n").unwrap();
    fs::write(cpu.join("cpuacct.usage_percpu"), "1500000000 500000000\n").unwrap();
    fs::write(cpu.join("cpuacct.stat"), "user 150\nsystem 50\n").unwrap();
    fs::write(cpu.join("cpu.stat"), "nr_periods 10\nnr_throttled 1\nthrottled_time 5\n").unwrap();

    let pids = manager.path("pids").unwrap();
    fs::write(pids.join("pids.current"), "3\n").unwrap();
    fs::write(pids.join("pids.max"), "max\n").unwrap();

    let stats = manager.get_stats().unwrap();
    assert_eq!(stats.memory.cache, 4096);
    assert_eq!(stats.memory.usage.limit, 536870912);
    assert_eq!(stats.cpu.usage.total_usage, 2_000_000_000);
    assert_eq!(stats.cpu.usage.percpu_usage.len(), 2);
    assert_eq!(stats.cpu.throttling.throttled_periods, 1);
    assert_eq!(stats.pids.current, 3);
    assert_eq!(stats.pids.limit, 0);
    assert_eq!(stats.cpuset.cpus, vec![0, 1, 2, 3]);
}

#[test]
fn test_get_all_pids_includes_nested_cgroups() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let manager = manager(&host, MockSystemd::new(249), CgroupConfig::new("c1"));
    manager.apply(Some(4242)).unwrap();

    let nested = manager.path("devices").unwrap().join("inner");
    fs::create_dir_all(&nested).unwrap();
    fs::write(nested.join("cgroup.procs"), "5\n").unwrap();

    let mut pids = manager.get_all_pids().unwrap();
    pids.sort_unstable();
    assert_eq!(pids, vec![5, 4242]);
    assert_eq!(manager.get_pids().unwrap(), vec![4242]);
}

#[test]
fn test_child_cgroup_lifecycle() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let mut config = CgroupConfig::new("c1");
    config.child_cgroup_dir = "init".to_string();
    let manager = manager(&host, MockSystemd::new(249), config.clone());

    assert!(matches!(
        manager.apply_child_cgroup(4243),
        Err(CgroupError::ChildCgroupNotCreated)
    ));

    manager.apply(Some(4242)).unwrap();

    let uid = nix::unistd::getuid().as_raw();
    let gid = nix::unistd::getgid().as_raw();
    let mut container = ContainerConfig::new(config);
    container.uid_mappings = vec![IdMap {
        container_id: 0,
        host_id: uid,
        size: 65536,
    }];
    container.gid_mappings = vec![IdMap {
        container_id: 0,
        host_id: gid,
        size: 65536,
    }];

    manager.create_child_cgroup(&container).unwrap();
    manager.apply_child_cgroup(4243).unwrap();

    let child_paths = manager.get_child_cgroup_paths();
    assert!(!child_paths.contains_key("name=systemd"));
    assert_eq!(
        child_paths["devices"],
        host.unit_path("devices", "c1.scope").join("init")
    );
    assert_eq!(
        fs::read_to_string(child_paths["devices"].join("cgroup.procs")).unwrap(),
        "4243"
    );
    assert_eq!(
        fs::read_to_string(child_paths["cpuset"].join("cpuset.cpus")).unwrap(),
        "0-3"
    );
}

#[test]
fn test_with_paths_reopens_applied_container() {
    let host = FakeHost::new(ALL_CONTROLLERS);
    let client = MockSystemd::new(249);
    let first = manager(&host, client.clone(), CgroupConfig::new("c1"));
    first.apply(Some(4242)).unwrap();
    let saved = serde_json::to_string(&first.get_paths()).unwrap();

    let paths: HashMap<String, PathBuf> = serde_json::from_str(&saved).unwrap();
    let reopened = CgroupManager::builder(CgroupConfig::new("c1"))
        .client(client.clone())
        .hierarchy(host.hierarchy())
        .paths(paths)
        .build();

    assert!(reopened.exists());
    assert_eq!(reopened.get_pids().unwrap(), vec![4242]);
    reopened.destroy().unwrap();
    assert!(!host.unit_path("devices", "c1.scope").exists());
}

#[test]
#[ignore] // Requires root, systemd >= 218 and a cgroup v1 host
fn test_real_systemd_lifecycle() {
    let name = format!("cgdelegate-test-{}", std::process::id());
    let manager = CgroupManager::new(CgroupConfig::new(&name));

    match manager.apply(None) {
        Ok(()) => {
            assert!(manager.exists());
            manager.destroy().unwrap();
            assert!(!manager.exists());
        }
        Err(e) => {
            println!("Apply failed (unsupported host?): {}", e);
            let _ = manager.destroy();
        }
    }
}
