//! The engine: public surface over the container tree.
//!
//! One [`Engine`] owns the registry, the cgroup driver, the event queue
//! and the pluggable collaborators (task starter, volume hooks, network
//! provider, record store). Request handlers call into it; the event loop
//! thread calls back into it through `dispatch_event`.

use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, Weak};

use arbor_common::config::ArborConfig;
use arbor_common::constants::{CGROUP_PREFIX, ROOT_CONTAINER, ROOT_CONTAINER_ID};
use arbor_common::error::{ArborError, ErrorKind, Result};
use arbor_common::types::{ContainerState, CtId};
use arbor_core::cgroup::{Cgroup, CgroupDriver, Controller, ControllerSet};
use arbor_core::topology::CpuTopology;

use crate::container::ContainerCell;
use crate::events::EventQueue;
use crate::persist::{FileKvStore, KvStore};
use crate::props;
use crate::spawn::{ProcessStarter, TaskStarter};
use crate::stats::Statistics;
use crate::tree::Tree;
use crate::waiter::{WaitEvent, Waiter};

/// Volume subsystem hooks; the storage engine itself lives elsewhere.
pub trait VolumeHooks: Send + Sync {
    /// Mounts every volume link of a starting container.
    ///
    /// # Errors
    ///
    /// Returns an error when a required link cannot be mounted.
    fn mount_links(&self, name: &str) -> Result<()>;

    /// Unmounts the links of a stopping container. Best effort.
    fn unmount_links(&self, name: &str);

    /// Unlinks every volume of a container being destroyed. Best effort.
    fn unlink_all(&self, name: &str);
}

/// Network subsystem hooks.
pub trait NetworkProvider: Send + Sync {
    /// Assigns a traffic class id for a starting container.
    ///
    /// # Errors
    ///
    /// Returns an error when the class cannot be provisioned.
    fn init_class(&self, name: &str) -> Result<u32>;

    /// Releases a container's traffic class. Best effort.
    fn release_class(&self, name: &str, classid: u32);
}

/// Defaults that do nothing; the daemon wires real subsystems in.
#[derive(Debug, Default)]
pub struct NoVolumes;

impl VolumeHooks for NoVolumes {
    fn mount_links(&self, _name: &str) -> Result<()> {
        Ok(())
    }
    fn unmount_links(&self, _name: &str) {}
    fn unlink_all(&self, _name: &str) {}
}

/// No traffic shaping; every container shares the default class.
#[derive(Debug, Default)]
pub struct NoNetwork;

impl NetworkProvider for NoNetwork {
    fn init_class(&self, _name: &str) -> Result<u32> {
        Ok(0)
    }
    fn release_class(&self, _name: &str, _classid: u32) {}
}

/// Snapshot returned by `GetContainer`.
#[derive(Debug, Clone)]
pub struct ContainerStatus {
    /// Container path.
    pub name: String,
    /// Numeric id.
    pub id: CtId,
    /// Current state.
    pub state: ContainerState,
    /// Main task pid when running.
    pub task_pid: Option<i32>,
    /// Raw exit status when dead.
    pub exit_status: Option<i32>,
    /// Whether the OOM killer took the task.
    pub oom_killed: bool,
    /// Automatic restarts performed.
    pub respawn_count: u64,
    /// Start moment, epoch milliseconds.
    pub start_time_ms: Option<u64>,
    /// Death moment, epoch milliseconds.
    pub death_time_ms: Option<u64>,
    /// User labels.
    pub labels: std::collections::BTreeMap<String, String>,
    /// Non-fatal misconfiguration diagnostics.
    pub taint: Vec<String>,
}

/// A registered wait: keep the handle alive for as long as the client
/// cares, read notifications from `rx`.
#[derive(Debug)]
pub struct WaitHandle {
    /// The registration; containers hold weak references to it.
    pub waiter: Arc<Waiter>,
    /// Notification stream.
    pub rx: Receiver<WaitEvent>,
}

/// The container management engine.
pub struct Engine {
    /// Registry and lock manager.
    pub tree: Tree,
    /// Cgroup driver over the mounted hierarchies.
    pub driver: CgroupDriver,
    /// Event queue owned by the loop thread.
    pub events: EventQueue,
    /// Daemon configuration.
    pub config: ArborConfig,
    /// Daemon-wide counters.
    pub stats: Statistics,
    pub(crate) starter: Box<dyn TaskStarter>,
    pub(crate) volumes: Box<dyn VolumeHooks>,
    pub(crate) network: Box<dyn NetworkProvider>,
    pub(crate) kv: Box<dyn KvStore>,
    pub(crate) topology: Mutex<CpuTopology>,
    pub(crate) wildcard_waiters: Mutex<Vec<Weak<Waiter>>>,
    /// Serializes cpu distribution across the tree.
    pub(crate) cpu_lock: Mutex<()>,
    pub(crate) proc_root: PathBuf,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builder-style assembly so the daemon and tests can swap collaborators.
pub struct EngineBuilder {
    config: ArborConfig,
    starter: Box<dyn TaskStarter>,
    volumes: Box<dyn VolumeHooks>,
    network: Box<dyn NetworkProvider>,
    kv: Option<Box<dyn KvStore>>,
    proc_root: PathBuf,
}

impl EngineBuilder {
    /// Starts a builder over a configuration.
    #[must_use]
    pub fn new(config: ArborConfig) -> Self {
        Self {
            config,
            starter: Box::new(ProcessStarter),
            volumes: Box::new(NoVolumes),
            network: Box::new(NoNetwork),
            kv: None,
            proc_root: PathBuf::from("/proc"),
        }
    }

    /// Swaps the task starter.
    #[must_use]
    pub fn starter(mut self, starter: Box<dyn TaskStarter>) -> Self {
        self.starter = starter;
        self
    }

    /// Swaps the volume hooks.
    #[must_use]
    pub fn volumes(mut self, volumes: Box<dyn VolumeHooks>) -> Self {
        self.volumes = volumes;
        self
    }

    /// Swaps the network provider.
    #[must_use]
    pub fn network(mut self, network: Box<dyn NetworkProvider>) -> Self {
        self.network = network;
        self
    }

    /// Swaps the record store.
    #[must_use]
    pub fn kv(mut self, kv: Box<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    /// Overrides the `/proc` root for tests.
    #[must_use]
    pub fn proc_root(mut self, root: PathBuf) -> Self {
        self.proc_root = root;
        self
    }

    /// Probes the host, creates the root container and brings the engine
    /// up.
    ///
    /// # Errors
    ///
    /// Returns an error when the host probing or root setup fails.
    pub fn build(self) -> Result<Arc<Engine>> {
        let driver = CgroupDriver::probe(&self.config.cgroup_root, CGROUP_PREFIX);
        let kv = match self.kv {
            Some(kv) => kv,
            None => Box::new(FileKvStore::open(&self.config.kv_dir)?),
        };
        let engine = Arc::new(Engine {
            tree: Tree::new(),
            events: EventQueue::new()?,
            config: self.config,
            stats: Statistics::default(),
            starter: self.starter,
            volumes: self.volumes,
            network: self.network,
            kv,
            topology: Mutex::new(CpuTopology::default()),
            wildcard_waiters: Mutex::new(Vec::new()),
            cpu_lock: Mutex::new(()),
            driver,
            proc_root: self.proc_root,
        });
        engine.init_root()?;
        Ok(engine)
    }
}

impl Engine {
    /// Milliseconds since the unix epoch.
    #[must_use]
    pub fn now_ms() -> u64 {
        u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
    }

    fn init_root(&self) -> Result<()> {
        let id = self.tree.alloc_id_at(ROOT_CONTAINER_ID)?;
        let root = Arc::new(ContainerCell::new(
            id,
            ROOT_CONTAINER.to_string(),
            None,
            &self.config,
            self.driver.supported(),
        ));
        self.tree.register(Arc::clone(&root))?;

        let topo = CpuTopology::read(&self.config.sysfs_root).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "cpu topology unavailable, assuming one cpu");
            CpuTopology {
                online: arbor_common::cpumask::CpuMask::from_cpus([0]),
                ..CpuTopology::default()
            }
        });
        {
            let mut data = root.write();
            data.cpu_affinity = topo.online.clone();
            data.cpu_vacant = topo.online.clone();
            data.cpu_limit =
                u64::from(topo.online.weight()) * arbor_common::constants::CPU_POWER_PER_SEC;
            data.prop_set.set(props::Prop::CpuLimit);
            data.controllers = self.driver.supported();
        }
        *self.topology.lock().unwrap_or_else(|e| e.into_inner()) = topo;

        let notify = self.tree.set_state(&root, ContainerState::Meta);
        self.notify_state_change(notify);
        tracing::info!("root container ready");
        Ok(())
    }

    /// The root container.
    ///
    /// # Panics
    ///
    /// Panics when the root is missing, which cannot happen after a
    /// successful build.
    #[must_use]
    pub fn root(&self) -> Arc<ContainerCell> {
        self.tree
            .require(ROOT_CONTAINER)
            .expect("root container exists for the daemon lifetime")
    }

    /// All container names, sorted.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.tree.names()
    }

    /// Snapshot of one container for `GetContainer` responses.
    ///
    /// # Errors
    ///
    /// Fails with `ContainerDoesNotExist`.
    pub fn status(&self, name: &str) -> Result<ContainerStatus> {
        let cell = self.tree.require(name)?;
        let mut status = {
            let data = cell.read();
            ContainerStatus {
                name: cell.name.clone(),
                id: cell.id,
                state: cell.state(),
                task_pid: data.task_pid,
                exit_status: data.exit_status,
                oom_killed: data.oom_killed,
                respawn_count: data.respawn_count,
                start_time_ms: data.start_time_ms,
                death_time_ms: data.death_time_ms,
                labels: data.labels.clone(),
                taint: Vec::new(),
            }
        };
        status.taint = cell.taint();
        Ok(status)
    }

    /// Wakes waiters after a state transition; call with no locks held.
    pub(crate) fn notify_state_change(&self, cells: Vec<Arc<ContainerCell>>) {
        for cell in cells {
            cell.notify_waiters();
            if !cell.is_root() {
                self.notify_wildcards(&cell);
            }
        }
    }

    fn notify_wildcards(&self, cell: &ContainerCell) {
        let state = cell.state();
        let mut list = self
            .wildcard_waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        list.retain(|w| match w.upgrade() {
            Some(waiter) => {
                if waiter.matches_wildcard(&cell.name) {
                    waiter.wake(&cell.name, state, |key| {
                        cell.read().labels.contains_key(key)
                    });
                }
                true
            }
            None => false,
        });
    }

    /// Registers a wait on the given name patterns.
    ///
    /// # Errors
    ///
    /// Fails when none of the exact names exist and no wildcard was
    /// given.
    pub fn wait(
        &self,
        patterns: Vec<String>,
        labels: Vec<String>,
        timeout_ms: Option<u64>,
    ) -> Result<WaitHandle> {
        let (waiter, rx) = Waiter::new(patterns, labels);
        let mut registered = false;
        for target in waiter.targets() {
            if let Some(cell) = self.tree.find(target) {
                cell.add_waiter(&waiter);
                registered = true;
            }
        }
        if waiter.has_wildcards() {
            self.wildcard_waiters
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(Arc::downgrade(&waiter));
            registered = true;
        }
        if !registered {
            return Err(ArborError::no_container("no container matches the wait"));
        }
        if let Some(ms) = timeout_ms {
            self.events.push_after(
                std::time::Duration::from_millis(ms),
                crate::events::Event::WaitTimeout(Arc::downgrade(&waiter)),
            );
        }
        Ok(WaitHandle { waiter, rx })
    }

    /// Derives the container's cgroup in one controller hierarchy.
    ///
    /// The root maps to the controller root. The freezer is owned at
    /// every level and keeps the slash-joined path; systemd flattens the
    /// whole path with `%`; other controllers join owning levels with `/`
    /// and non-owning levels with `%` so the kernel sees one directory
    /// per owning level.
    ///
    /// # Errors
    ///
    /// Fails with `NotSupported` when the controller is absent.
    pub fn get_cgroup(&self, cell: &Arc<ContainerCell>, controller: Controller) -> Result<Cgroup> {
        if cell.is_root() {
            return self.driver.root_cgroup(controller);
        }
        let prefix = self.driver.prefix();
        match controller {
            Controller::Freezer => self
                .driver
                .named(controller, &format!("{prefix}/{}", cell.name)),
            Controller::Systemd => {
                if cell.read().controllers.contains(Controller::Systemd) {
                    let flat = cell.name.replace('/', "%");
                    self.driver.named(controller, &format!("{prefix}%{flat}"))
                } else {
                    self.driver.root_cgroup(controller)
                }
            }
            _ => {
                let mut chain = vec![Arc::clone(cell)];
                chain.extend(self.tree.ancestors(cell.id));
                let mut cg = String::new();
                for ct in &chain {
                    if ct.is_root() {
                        break;
                    }
                    let enabled = ct.read().controllers.contains(controller);
                    if !cg.is_empty() {
                        cg.insert(0, if enabled { '/' } else { '%' });
                    }
                    if !cg.is_empty() || enabled {
                        cg.insert_str(0, &ct.first_name);
                    }
                }
                if cg.is_empty() {
                    self.driver.root_cgroup(controller)
                } else {
                    self.driver.named(controller, &format!("{prefix}%{cg}"))
                }
            }
        }
    }

    /// Reads a property; a dotted name is a raw cgroup knob read.
    ///
    /// # Errors
    ///
    /// Fails for unknown properties, disabled controllers, and knob
    /// reads on stopped containers.
    pub fn get_property(&self, name: &str, prop: &str) -> Result<String> {
        let cell = self.tree.require(name)?;
        let (prop_name, index) = props::split_index(prop)?;
        if index.is_none() {
            if let Some((ctl_name, _)) = prop_name.split_once('.') {
                if let Ok(controller) = ctl_name.parse::<Controller>() {
                    return self.get_cgroup_knob(&cell, controller, prop_name);
                }
            }
        }
        props::get(&cell, &self.config, prop_name, index)
    }

    fn get_cgroup_knob(
        &self,
        cell: &Arc<ContainerCell>,
        controller: Controller,
        knob: &str,
    ) -> Result<String> {
        if cell.state() == ContainerState::Stopped {
            return Err(ArborError::invalid_state(format!(
                "{knob} is not available in the stopped state"
            )));
        }
        if !cell.read().controllers.contains(controller) {
            return Err(ArborError::no_value(format!(
                "controller {controller} is disabled"
            )));
        }
        let cg = self.get_cgroup(cell, controller)?;
        if !cg.has_knob(knob) {
            return Err(ArborError::invalid_property(format!(
                "unknown cgroup attribute: {knob}"
            )));
        }
        cg.get_knob(knob)
    }

    /// Stages and applies a property change, rolling back on kernel
    /// failure, and persists the container.
    ///
    /// # Errors
    ///
    /// Fails for unknown properties, invalid values, wrong state, and
    /// surviving kernel errors.
    pub fn set_property(&self, name: &str, prop: &str, value: &str) -> Result<()> {
        let cell = self.tree.require(name)?;
        if cell.is_root() {
            return Err(ArborError::permission("the root container is read-only"));
        }
        let _guard = self.tree.lock_write(&cell)?;

        let (prop_name, index) = props::split_index(prop)?;
        let desc = props::find(prop_name).ok_or_else(|| {
            ArborError::invalid_property(format!("unknown property: {prop_name}"))
        })?;
        props::can_set(&cell, desc)?;
        self.enable_controllers(&cell, desc.req_controllers)?;

        let old = props::get(&cell, &self.config, prop_name, index).ok();
        props::set(&cell, desc, index, value)?;

        if self.has_resources(&cell) {
            if let Err(e) = self.apply_dynamic_properties(&cell) {
                if let Some(old) = old {
                    let _ = props::set(&cell, desc, index, &old);
                }
                cell.write().prop_dirty.clear(desc.prop);
                return Err(e);
            }
        }
        self.save(&cell)
    }

    pub(crate) fn has_resources(&self, cell: &ContainerCell) -> bool {
        !matches!(
            cell.state(),
            ContainerState::Stopped | ContainerState::Destroyed
        )
    }

    fn enable_controllers(&self, cell: &Arc<ContainerCell>, wanted: &[Controller]) -> Result<()> {
        if wanted.is_empty() {
            return Ok(());
        }
        let wanted: ControllerSet = wanted.iter().copied().collect();
        let mut data = cell.write();
        if cell.state() == ContainerState::Stopped {
            data.controllers = data.controllers.with(wanted);
            data.required_controllers = data.required_controllers.with(wanted);
            Ok(())
        } else if data.controllers.contains_all(wanted) {
            Ok(())
        } else {
            Err(ArborError::not_supported(
                "cannot enable controllers at runtime",
            ))
        }
    }

    /// Moves a process into every cgroup of a running container.
    ///
    /// # Errors
    ///
    /// Fails unless the container is running or meta.
    pub fn attach_process(&self, name: &str, pid: i32) -> Result<()> {
        let cell = self.tree.require(name)?;
        let _guard = self.tree.lock_read(&cell)?;
        if !matches!(
            cell.state(),
            ContainerState::Running | ContainerState::Meta
        ) {
            return Err(ArborError::invalid_state(format!(
                "cannot attach to a {} container",
                cell.state()
            )));
        }
        let controllers = cell.read().controllers;
        for controller in controllers.iter() {
            if !self.driver.supported().contains(controller) {
                continue;
            }
            let cg = self.get_cgroup(&cell, controller)?;
            if cg.exists() {
                cg.attach(pid)?;
            }
        }
        tracing::info!(name, pid, "process attached");
        Ok(())
    }

    /// Declares (or, with an empty target, removes) a symlink maintained
    /// inside the container. The mount-namespace write happens through
    /// the task starter's filesystem machinery at start.
    ///
    /// # Errors
    ///
    /// Fails when the container is gone or the change cannot be staged.
    pub fn set_symlink(&self, name: &str, link: &str, target: &str) -> Result<()> {
        self.set_property(name, &format!("symlink[{link}]"), target)
    }

    /// Sets one label.
    ///
    /// # Errors
    ///
    /// Fails on malformed keys/values and on the per-container cap.
    pub fn set_label(&self, name: &str, key: &str, value: &str) -> Result<()> {
        self.set_property(name, &format!("labels[{key}]"), value)
    }

    /// Atomically adds to a decimal-valued label, creating it at zero.
    /// Returns the new value.
    ///
    /// # Errors
    ///
    /// Fails when the existing value is not an integer.
    pub fn inc_label(&self, name: &str, key: &str, add: i64) -> Result<i64> {
        let cell = self.tree.require(name)?;
        let _guard = self.tree.lock_write(&cell)?;
        props::validate_label_key(key)?;
        let next = {
            let mut data = cell.write();
            let current = match data.labels.get(key) {
                Some(raw) => raw.parse::<i64>().map_err(|_| {
                    ArborError::new(
                        ErrorKind::InvalidLabel,
                        format!("label {key} is not a counter: {raw}"),
                    )
                })?,
                None => 0,
            };
            let next = current.saturating_add(add);
            data.labels.insert(key.to_string(), next.to_string());
            data.prop_set.set(props::Prop::Labels);
            next
        };
        self.save(&cell)?;
        Ok(next)
    }

    /// Finds a label across the tree; returns `(container, value)` pairs.
    #[must_use]
    pub fn find_label(&self, key: &str) -> Vec<(String, String)> {
        let mut out = Vec::new();
        for name in self.tree.names() {
            let Some(cell) = self.tree.find(&name) else { continue };
            let guard = cell.read();
            if let Some(value) = guard.labels.get(key) {
                out.push((name, value.clone()));
            }
        }
        out
    }

    /// Drains a container's OOM eventfd; true when at least one event
    /// was pending.
    pub(crate) fn recv_oom_events(&self, cell: &Arc<ContainerCell>) -> bool {
        let mut data = cell.write();
        let Some(fd) = data.oom_event.as_mut() else {
            return false;
        };
        let mut buf = [0u8; 8];
        match fd.read(&mut buf) {
            Ok(8) => {
                let count = u64::from_ne_bytes(buf);
                if count == 0 {
                    return false;
                }
                data.oom_events += count;
                drop(data);
                Statistics::add(&self.stats.containers_oom, count);
                tracing::warn!(name = %cell.name, count, "oom event");
                true
            }
            _ => false,
        }
    }

    pub(crate) fn take_oom_fd(&self, cell: &Arc<ContainerCell>) -> Option<File> {
        cell.write().oom_event.take()
    }
}
