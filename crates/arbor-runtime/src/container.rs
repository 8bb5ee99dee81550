//! The container node: identity, declared policy and runtime state.
//!
//! A [`ContainerCell`] is the shared handle the registry owns. Identity is
//! immutable; the current state lives in an atomic so lock predicates and
//! queries can read it without touching the data lock; everything else sits
//! behind a short-held `RwLock`. Serialization of whole operations is the
//! job of the hierarchical tree lock, not of this data lock.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use arbor_common::config::ArborConfig;
use arbor_common::cpumask::CpuMask;
use arbor_common::error::{ArborError, Result};
use arbor_common::types::{ContainerState, CpuPolicy, CpuSetSpec, Cred, CtId, VirtMode};
use arbor_core::caps::CapSet;
use arbor_core::cgroup::{Controller, ControllerSet};

use crate::props::{Prop, PropMask};
use crate::waiter::Waiter;

/// Shared handle to one container.
#[derive(Debug)]
pub struct ContainerCell {
    /// Numeric id, unique while the container exists.
    pub id: CtId,
    /// Full slash-separated path; `/` for the root.
    pub name: String,
    /// Final path segment; empty for the root.
    pub first_name: String,
    /// Depth in the tree; the root is level 0.
    pub level: u32,
    /// Parent id; `None` only for the root.
    pub parent: Option<CtId>,
    state: AtomicU8,
    data: RwLock<ContainerData>,
    waiters: Mutex<Vec<Weak<Waiter>>>,
}

fn state_to_u8(state: ContainerState) -> u8 {
    match state {
        ContainerState::Stopped => 0,
        ContainerState::Starting => 1,
        ContainerState::Running => 2,
        ContainerState::Meta => 3,
        ContainerState::Stopping => 4,
        ContainerState::Paused => 5,
        ContainerState::Dead => 6,
        ContainerState::Destroyed => 7,
    }
}

fn state_from_u8(raw: u8) -> ContainerState {
    match raw {
        0 => ContainerState::Stopped,
        1 => ContainerState::Starting,
        2 => ContainerState::Running,
        3 => ContainerState::Meta,
        4 => ContainerState::Stopping,
        5 => ContainerState::Paused,
        6 => ContainerState::Dead,
        _ => ContainerState::Destroyed,
    }
}

impl ContainerCell {
    /// Creates a stopped container under the given parent identity.
    #[must_use]
    pub fn new(
        id: CtId,
        name: String,
        parent: Option<(&ContainerCell, CtId)>,
        config: &ArborConfig,
        supported: ControllerSet,
    ) -> Self {
        let (first_name, level, parent_id) = match parent {
            Some((parent_cell, parent_id)) => {
                let first = if parent_cell.is_root() {
                    name.clone()
                } else {
                    name[parent_cell.name.len() + 1..].to_string()
                };
                (first, parent_cell.level + 1, Some(parent_id))
            }
            None => (String::new(), 0, None),
        };
        let data = ContainerData::with_defaults(level, config, supported);
        Self {
            id,
            name,
            first_name,
            level,
            parent: parent_id,
            state: AtomicU8::new(state_to_u8(ContainerState::Stopped)),
            data: RwLock::new(data),
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ContainerState {
        state_from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Raw state write; use the tree's `set_state` so ancestor counters
    /// and waiters stay consistent.
    pub(crate) fn store_state(&self, state: ContainerState) {
        self.state.store(state_to_u8(state), Ordering::SeqCst);
    }

    /// Whether this is the root container.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Read access to the container data. Held briefly; never across
    /// kernel calls.
    ///
    /// # Panics
    ///
    /// Panics if the data lock is poisoned, which means another thread
    /// panicked mid-update and the invariants are gone.
    #[must_use]
    pub fn read(&self) -> RwLockReadGuard<'_, ContainerData> {
        self.data.read().unwrap_or_else(|e| {
            panic!("container data poisoned for {}: {e}", self.name)
        })
    }

    /// Write access to the container data.
    ///
    /// # Panics
    ///
    /// Panics if the data lock is poisoned.
    #[must_use]
    pub fn write(&self) -> RwLockWriteGuard<'_, ContainerData> {
        self.data.write().unwrap_or_else(|e| {
            panic!("container data poisoned for {}: {e}", self.name)
        })
    }

    /// Whether the container has no own task by construction.
    #[must_use]
    pub fn is_meta(&self) -> bool {
        let data = self.read();
        data.command.is_empty() || data.virt_mode == VirtMode::Job
    }

    /// Registers a waiter for this container's transitions.
    pub fn add_waiter(&self, waiter: &std::sync::Arc<Waiter>) {
        let mut list = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        list.retain(|w| w.strong_count() > 0);
        list.push(std::sync::Arc::downgrade(waiter));
    }

    /// Wakes every live waiter with this container's current state.
    pub fn notify_waiters(&self) {
        let state = self.state();
        let mut list = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        list.retain(|w| match w.upgrade() {
            Some(waiter) => {
                waiter.wake(&self.name, state, |key| {
                    self.read().labels.contains_key(key)
                });
                true
            }
            None => false,
        });
    }

    /// Work directory of this container under the configured root.
    #[must_use]
    pub fn work_dir(&self, config: &ArborConfig) -> PathBuf {
        if self.is_root() {
            config.work_dir.clone()
        } else {
            config.work_dir.join(&self.name)
        }
    }

    /// Working directory the task starts in: the configured `cwd`, or the
    /// work directory when none is set.
    #[must_use]
    pub fn get_cwd(&self, config: &ArborConfig) -> PathBuf {
        let data = self.read();
        match &data.cwd {
            Some(cwd) if cwd.is_absolute() => cwd.clone(),
            Some(cwd) => self.work_dir(config).join(cwd),
            None if self.is_root() => PathBuf::from("/"),
            None if data.root != PathBuf::from("/") => PathBuf::from("/"),
            None => self.work_dir(config),
        }
    }

    /// Non-fatal misconfiguration diagnostics for this container.
    #[must_use]
    pub fn taint(&self) -> Vec<String> {
        let data = self.read();
        let mut taint = Vec::new();
        if data.owner_cred.is_root() {
            taint.push("container owned by root has unrestricted capabilities".to_string());
        }
        if !data.oom_is_fatal {
            taint.push(
                "oom_is_fatal=false leaves containers in a broken state after OOM".to_string(),
            );
        }
        if data.virt_mode == VirtMode::Os
            && !data.command.is_empty()
            && data.command != "/sbin/init"
        {
            taint.push("virt_mode=os with a custom command tends to leak zombies".to_string());
        }
        if data.cpu_policy == CpuPolicy::Rt && data.cpu_limit != 0 {
            taint.push(
                "rt scheduling degrades badly when usage hits cpu_limit; prefer cpu_policy=high"
                    .to_string(),
            );
        }
        if self.level == 1 {
            if data.mem_limit == 0 {
                taint.push("first level container without memory_limit".to_string());
            }
            if data.cpu_limit == 0 {
                taint.push("first level container without cpu_limit".to_string());
            }
            if !data.isolate {
                taint.push("first level container without pid namespace".to_string());
            }
        }
        taint
    }

    /// The parent component of a container path; `/` for first-level names.
    #[must_use]
    pub fn parent_name(name: &str) -> &str {
        match name.rfind('/') {
            Some(sep) => &name[..sep],
            None => arbor_common::constants::ROOT_CONTAINER,
        }
    }
}

/// Everything mutable about a container.
#[derive(Debug)]
pub struct ContainerData {
    /// Credentials of whoever created the container.
    pub owner_cred: Cred,
    /// Credentials the task runs under.
    pub task_cred: Cred,

    /// Command line, whitespace separated; empty for meta containers.
    pub command: String,
    /// Environment entries in `KEY=value` form.
    pub env: Vec<String>,
    /// Working directory override.
    pub cwd: Option<PathBuf>,
    /// Chroot directory; `/` means the host root.
    pub root: PathBuf,
    /// Hostname inside the container.
    pub hostname: String,
    /// resolv.conf override, one line per entry.
    pub resolv_conf: Vec<String>,
    /// Declared bind mounts, `src dst [ro]` per entry.
    pub bind_mounts: Vec<String>,
    /// Symlinks maintained inside the container.
    pub symlinks: BTreeMap<String, String>,
    /// Whether the task gets its own pid namespace.
    pub isolate: bool,
    /// Virtualization mode.
    pub virt_mode: VirtMode,

    /// Memory limit in bytes; 0 is unlimited.
    pub mem_limit: u64,
    /// Applied memory guarantee in bytes.
    pub mem_guarantee: u64,
    /// Staged memory guarantee awaiting admission.
    pub new_mem_guarantee: u64,
    /// Anonymous memory limit in bytes.
    pub anon_limit: u64,
    /// Dirty page limit in bytes.
    pub dirty_limit: u64,
    /// Huge page limit in bytes.
    pub hugetlb_limit: u64,
    /// Applied soft limit; negative means none.
    pub mem_soft_limit: i64,
    /// Whether an OOM kill takes the whole container down.
    pub oom_is_fatal: bool,
    /// Whether dead containers get squeezed by a soft limit.
    pub pressurize_on_death: bool,
    /// OOM events observed so far.
    pub oom_events: u64,
    /// Whether the container died from an OOM kill.
    pub oom_killed: bool,
    /// Armed OOM eventfd while resources are held.
    pub oom_event: Option<File>,

    /// Cpu limit in cpu power units; 0 is unlimited.
    pub cpu_limit: u64,
    /// Applied cpu limit.
    pub cpu_limit_cur: u64,
    /// Aggregated subtree cpu limit.
    pub cpu_limit_sum: u64,
    /// Cpu guarantee in cpu power units.
    pub cpu_guarantee: u64,
    /// Applied cpu guarantee.
    pub cpu_guarantee_cur: u64,
    /// Aggregated children cpu guarantee.
    pub cpu_guarantee_sum: u64,
    /// Scheduling class.
    pub cpu_policy: CpuPolicy,
    /// Relative weight, 100 is neutral.
    pub cpu_weight: u64,
    /// CFS period in nanoseconds.
    pub cpu_period: u64,
    /// Declared cpu placement policy.
    pub cpu_set: CpuSetSpec,
    /// Resolved cpu affinity.
    pub cpu_affinity: CpuMask,
    /// Cpus not yet handed to children.
    pub cpu_vacant: CpuMask,
    /// Threads reserved exclusively for this container.
    pub cpu_reserve: CpuMask,

    /// Io scheduler policy name; empty keeps the kernel default.
    pub io_policy: String,
    /// Io weight, 100 is neutral.
    pub io_weight: u64,
    /// Per-device byte throttles; key `fs` throttles the filesystem layer.
    pub io_bps_limit: BTreeMap<String, u64>,
    /// Per-device iops throttles.
    pub io_ops_limit: BTreeMap<String, u64>,

    /// Thread count limit; 0 is unlimited.
    pub thread_limit: u64,
    /// Rlimits by resource name: (soft, hard).
    pub ulimit: BTreeMap<String, (u64, u64)>,

    /// Declared capability limit.
    pub cap_limit: CapSet,
    /// Declared ambient capabilities.
    pub cap_ambient: CapSet,
    /// Computed upper bound.
    pub cap_bound: CapSet,
    /// Computed ambient bound.
    pub cap_allowed: CapSet,

    /// Controllers this container owns a cgroup in.
    pub controllers: ControllerSet,
    /// Controllers that must stay enabled.
    pub required_controllers: ControllerSet,

    /// Whether the container restarts itself after death.
    pub respawn: bool,
    /// Respawn budget; negative is unlimited.
    pub respawn_limit: i64,
    /// Respawns performed so far.
    pub respawn_count: u64,
    /// Delay before an automatic respawn, in milliseconds.
    pub respawn_delay_ms: u64,
    /// How long a dead container lingers, in milliseconds.
    pub aging_time_ms: u64,
    /// Whether the container dies with its last client handle.
    pub is_weak: bool,

    /// User labels.
    pub labels: BTreeMap<String, String>,
    /// Free-form client annotation.
    pub private: String,

    /// Main task pid.
    pub task_pid: Option<i32>,
    /// Pid whose exit ends the container; differs from the main pid when
    /// an extra fork built the pid namespace.
    pub wait_pid: Option<i32>,
    /// Pid of the adopted watcher after a seize.
    pub seize_pid: Option<i32>,
    /// Raw exit status of the main task.
    pub exit_status: Option<i32>,
    /// Start moment, unix epoch milliseconds.
    pub start_time_ms: Option<u64>,
    /// Death moment, unix epoch milliseconds.
    pub death_time_ms: Option<u64>,

    /// Properties holding a non-default value.
    pub prop_set: PropMask,
    /// Properties pending kernel application.
    pub prop_dirty: PropMask,
}

impl ContainerData {
    fn with_defaults(level: u32, config: &ArborConfig, supported: ControllerSet) -> Self {
        let mut controllers = ControllerSet::from(Controller::Freezer);
        if supported.contains(Controller::Cpuacct) {
            controllers.insert(Controller::Cpuacct);
        }
        if level <= 1 {
            for c in [
                Controller::Memory,
                Controller::Cpu,
                Controller::NetCls,
                Controller::Devices,
                Controller::Blkio,
                Controller::Cpuset,
                Controller::Hugetlb,
            ] {
                if supported.contains(c) {
                    controllers.insert(c);
                }
            }
        }
        let mut thread_limit = 0;
        let mut prop_set = PropMask::default();
        if level == 1 && supported.contains(Controller::Pids) {
            controllers.insert(Controller::Pids);
            thread_limit = config.container.default_thread_limit;
            if thread_limit != 0 {
                prop_set.set(Prop::ThreadLimit);
            }
        }

        Self {
            owner_cred: Cred::default(),
            task_cred: Cred::default(),
            command: String::new(),
            env: Vec::new(),
            cwd: None,
            root: PathBuf::from("/"),
            hostname: String::new(),
            resolv_conf: Vec::new(),
            bind_mounts: Vec::new(),
            symlinks: BTreeMap::new(),
            isolate: true,
            virt_mode: VirtMode::App,
            mem_limit: 0,
            mem_guarantee: 0,
            new_mem_guarantee: 0,
            anon_limit: 0,
            dirty_limit: 0,
            hugetlb_limit: 0,
            mem_soft_limit: -1,
            oom_is_fatal: true,
            pressurize_on_death: config.container.pressurize_on_death,
            oom_events: 0,
            oom_killed: false,
            oom_event: None,
            cpu_limit: 0,
            cpu_limit_cur: 0,
            cpu_limit_sum: 0,
            cpu_guarantee: 0,
            cpu_guarantee_cur: 0,
            cpu_guarantee_sum: 0,
            cpu_policy: CpuPolicy::Normal,
            cpu_weight: 100,
            cpu_period: config.container.cpu_period_ns,
            cpu_set: CpuSetSpec::Inherit,
            cpu_affinity: CpuMask::new(),
            cpu_vacant: CpuMask::new(),
            cpu_reserve: CpuMask::new(),
            io_policy: String::new(),
            io_weight: 100,
            io_bps_limit: BTreeMap::new(),
            io_ops_limit: BTreeMap::new(),
            thread_limit,
            ulimit: BTreeMap::new(),
            cap_limit: CapSet::empty(),
            cap_ambient: CapSet::empty(),
            cap_bound: CapSet::empty(),
            cap_allowed: CapSet::empty(),
            controllers,
            required_controllers: ControllerSet::from(Controller::Freezer),
            respawn: false,
            respawn_limit: -1,
            respawn_count: 0,
            respawn_delay_ms: config.container.respawn_delay_ms,
            aging_time_ms: config.container.default_aging_time_ms,
            is_weak: false,
            labels: BTreeMap::new(),
            private: String::new(),
            task_pid: None,
            wait_pid: None,
            seize_pid: None,
            exit_status: None,
            start_time_ms: None,
            death_time_ms: None,
            prop_set,
            prop_dirty: PropMask::default(),
        }
    }

    /// Drops every pid the container knew about.
    pub fn forget_pids(&mut self) {
        self.task_pid = None;
        self.wait_pid = None;
        self.seize_pid = None;
    }
}

/// Validates a container path per the naming rules.
///
/// # Errors
///
/// Fails with `InvalidValue` describing the first violation found.
pub fn valid_name(name: &str, superuser: bool) -> Result<()> {
    use arbor_common::constants::{
        CONTAINER_LEVEL_MAX, CONTAINER_NAME_MAX, CONTAINER_PATH_MAX,
        CONTAINER_PATH_MAX_SUPERUSER, DOT_CONTAINER, ROOT_CONTAINER, SELF_CONTAINER,
    };

    if name.is_empty() {
        return Err(ArborError::invalid_value("container path too short"));
    }
    let path_max = if superuser {
        CONTAINER_PATH_MAX_SUPERUSER
    } else {
        CONTAINER_PATH_MAX
    };
    if name.len() > path_max {
        return Err(ArborError::invalid_value(format!(
            "container path too long, limit is {path_max}"
        )));
    }
    if name.starts_with('/') {
        if name == ROOT_CONTAINER {
            return Ok(());
        }
        return Err(ArborError::invalid_value(format!(
            "container path starts with '/': {name}"
        )));
    }
    let mut depth = 0u32;
    for segment in name.split('/') {
        depth += 1;
        if segment.is_empty() {
            return Err(ArborError::invalid_value(format!(
                "double or trailing '/' in container path: {name}"
            )));
        }
        if segment.len() > CONTAINER_NAME_MAX {
            return Err(ArborError::invalid_value(format!(
                "container name component too long, limit is {CONTAINER_NAME_MAX}: '{segment}'"
            )));
        }
        if segment == SELF_CONTAINER {
            return Err(ArborError::invalid_value("container name 'self' is reserved"));
        }
        if segment == DOT_CONTAINER {
            return Err(ArborError::invalid_value("container name '.' is reserved"));
        }
        for ch in segment.chars() {
            let ok = ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '@' | ':' | '.');
            if !ok {
                return Err(ArborError::invalid_value(format!(
                    "forbidden character {:#x} in container name",
                    ch as u32
                )));
            }
        }
    }
    if depth > CONTAINER_LEVEL_MAX {
        return Err(ArborError::invalid_value(format!(
            "container too deep, maximum level is {CONTAINER_LEVEL_MAX}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        for name in ["a", "a/b", "web-1", "job@2:batch.v1", "A_b-c"] {
            valid_name(name, false).expect(name);
        }
        valid_name("/", false).expect("root");
    }

    #[test]
    fn invalid_names() {
        assert!(valid_name("", false).is_err());
        assert!(valid_name("/a", false).is_err());
        assert!(valid_name("a//b", false).is_err());
        assert!(valid_name("a/b/", false).is_err());
        assert!(valid_name("self", false).is_err());
        assert!(valid_name("a/./b", false).is_err());
        assert!(valid_name("sp ace", false).is_err());
        assert!(valid_name(&"x".repeat(129), false).is_err());
        let deep = vec!["d"; 17].join("/");
        assert!(valid_name(&deep, false).is_err());
    }

    #[test]
    fn superuser_gets_longer_paths() {
        let long = vec!["seg"; 52].join("/");
        assert!(long.len() > 200 && long.len() <= 220);
        assert!(valid_name(&long, false).is_err());
        // depth still binds even for the superuser
        let wide = format!("{}/{}", "y".repeat(110), "z".repeat(100));
        assert!(valid_name(&wide, true).is_ok());
    }

    #[test]
    fn parent_name_extraction() {
        assert_eq!(ContainerCell::parent_name("a/b/c"), "a/b");
        assert_eq!(ContainerCell::parent_name("a"), "/");
    }
}
