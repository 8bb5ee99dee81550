//! Lifecycle engine: the container state machine.
//!
//! Create, start, stop, pause, resume, kill, reap, destroy and respawn,
//! plus the dynamic-property application pass, restore-time state
//! reconciliation and the event dispatcher. Callers go through the public
//! methods, which take the hierarchical lock; the internal `_locked`
//! variants assume it is held.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arbor_common::error::{ArborError, ErrorKind, Result};
use arbor_common::types::{signal_status, ContainerState, Cred, CtId, VirtMode};
use arbor_core::caps::CapSet;
use arbor_core::cgroup::{
    blkio, devices, freezer, hugetlb, memory, netcls, pids, Controller,
};
use arbor_core::proc::{self, SchedParams};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::container::{valid_name, ContainerCell};
use crate::engine::Engine;
use crate::events::Event;
use crate::props::{self, Prop};
use crate::spawn::StartSpec;
use crate::stats::Statistics;
use crate::stdio;
use crate::tree::TreeGuard;
use crate::waiter::glob_match;

/// Signals the init helper encodes into exit codes above 128.
const SIGRTMIN: i32 = 34;

impl Engine {
    fn freeze_wait(&self) -> freezer::FreezeWait {
        freezer::FreezeWait {
            attempts: self.config.daemon.freezer_wait_attempts,
            interval: Duration::from_millis(self.config.daemon.freezer_wait_interval_ms),
        }
    }

    fn set_state(&self, cell: &Arc<ContainerCell>, state: ContainerState) {
        let notify = self.tree.set_state(cell, state);
        self.notify_state_change(notify);
    }

    /// Creates a stopped container under an existing parent.
    ///
    /// # Errors
    ///
    /// Fails on invalid names, a missing parent, a name collision, an
    /// exhausted id space or the container count limit.
    pub fn create(&self, name: &str, owner: Cred) -> Result<Arc<ContainerCell>> {
        valid_name(name, owner.is_root())?;
        if name == arbor_common::constants::ROOT_CONTAINER {
            return Err(ArborError::new(
                ErrorKind::ContainerAlreadyExists,
                "the root container always exists",
            ));
        }

        let mut max = self.config.daemon.max_containers;
        if owner.is_root() {
            max += self.config.daemon.superuser_extra_containers;
        }
        if self.tree.names().len() >= max {
            return Err(ArborError::no_resource(format!(
                "number of containers reached limit: {max}"
            )));
        }

        let parent = self.tree.require(ContainerCell::parent_name(name))?;
        let _parent_guard = self.tree.lock_read(&parent)?;
        if !owner.is_root() && parent.read().owner_cred.uid != owner.uid && !parent.is_root() {
            return Err(ArborError::permission(format!(
                "cannot create under container {} owned by uid {}",
                parent.name,
                parent.read().owner_cred.uid
            )));
        }

        let id = self.tree.alloc_id()?;
        tracing::info!(id = %id, name, "create container");
        let cell = Arc::new(ContainerCell::new(
            id,
            name.to_string(),
            Some((&parent, parent.id)),
            &self.config,
            self.driver.supported(),
        ));
        {
            let mut data = cell.write();
            data.owner_cred = owner;
            data.task_cred = owner;
            data.prop_set.set(Prop::OwnerUser);
            data.prop_set.set(Prop::OwnerGroup);
            data.prop_set.set(Prop::User);
            data.prop_set.set(Prop::Group);
            data.prop_set.set(Prop::RespawnCount);
        }
        self.sanitize_capabilities(&cell);

        if let Err(e) = self.save(&cell) {
            self.tree.release_id(id);
            return Err(e);
        }
        if let Err(e) = self.tree.register(Arc::clone(&cell)) {
            let _ = self.kv.delete(id);
            self.tree.release_id(id);
            return Err(e);
        }
        Statistics::inc(&self.stats.containers_created);
        Statistics::inc(&self.stats.containers_count);
        Ok(cell)
    }

    /// Computes the capability bounds from the ancestor chain: a non-root
    /// owner is clipped to the host bound, the chroot bound where a
    /// chroot applies, every ancestor's declared limit, and loses the
    /// capability groups whose isolation is absent.
    pub(crate) fn sanitize_capabilities(&self, cell: &Arc<ContainerCell>) {
        let owner_root = cell.read().owner_cred.is_root();
        if owner_root {
            let mut data = cell.write();
            let bound = if data.prop_set.has(Prop::Capabilities) {
                data.cap_limit
            } else {
                CapSet::host_bound()
            };
            data.cap_bound = bound;
            data.cap_allowed = bound;
            if !data.prop_set.has(Prop::Capabilities) {
                data.cap_limit = bound;
            }
            return;
        }

        let mut bound = CapSet::host_bound();
        let mut chroot = false;
        let mut pidns = false;
        let mut memcg = false;
        let mut chain = vec![Arc::clone(cell)];
        chain.extend(self.tree.ancestors(cell.id));
        for ct in &chain {
            let data = ct.read();
            chroot |= data.root != PathBuf::from("/");
            pidns |= data.isolate;
            memcg |= data.mem_limit != 0;
            if data.prop_set.has(Prop::Capabilities) {
                bound = bound.intersect(data.cap_limit);
            }
        }

        let mut remove = CapSet::net_ns_group();
        if !pidns {
            remove = remove.with(CapSet::pid_ns_group());
        }
        if !memcg {
            remove = remove.with(CapSet::mem_cg_group());
        }

        let mut data = cell.write();
        let allowed;
        if chroot {
            bound = bound.intersect(CapSet::chroot_bound()).without(remove);
            allowed = bound;
        } else {
            allowed = bound.without(remove);
        }
        data.cap_bound = bound;
        data.cap_allowed = allowed;
        if !data.prop_set.has(Prop::Capabilities) {
            data.cap_limit = bound;
        }
    }

    fn prepare_start(&self, cell: &Arc<ContainerCell>) -> Result<()> {
        self.sanitize_capabilities(cell);
        let data = cell.read();

        // a non-racy credential check against a chroot is impossible;
        // inside one the kernel is the only honest referee
        let chrooted = data.root != PathBuf::from("/");
        if !chrooted && data.task_cred.uid == 0 && !data.owner_cred.is_root() {
            return Err(ArborError::permission("user=root requires chroot"));
        }
        if !data.cap_limit.is_subset_of(data.cap_bound) {
            return Err(ArborError::permission(format!(
                "capabilities out of bounds: {}",
                data.cap_limit.without(data.cap_bound)
            )));
        }
        if !data.cap_ambient.is_subset_of(data.cap_allowed) {
            return Err(ArborError::permission(format!(
                "ambient capabilities out of bounds: {}",
                data.cap_ambient.without(data.cap_allowed)
            )));
        }
        Ok(())
    }

    /// Starts a container, bringing stopped ancestors up first.
    ///
    /// # Errors
    ///
    /// Fails unless the container is stopped; start failures roll back
    /// to stopped and surface the cause.
    pub fn start(self: &Arc<Self>, name: &str) -> Result<()> {
        let cell = self.tree.require(name)?;
        self.start_parents(&cell)?;
        let mut guard = self.tree.lock_write(&cell)?;
        self.start_locked(&cell, &mut guard)
    }

    fn start_parents(self: &Arc<Self>, cell: &Arc<ContainerCell>) -> Result<()> {
        let Some(parent_id) = cell.parent else {
            return Ok(());
        };
        let parent = self
            .tree
            .cell(parent_id)
            .ok_or_else(|| ArborError::no_container("parent container is gone"))?;

        if let Ok(cg) = self.get_cgroup(&parent, Controller::Freezer) {
            if cg.exists() && freezer::is_frozen(&cg) {
                return Err(ArborError::invalid_state("parent container is frozen"));
            }
        }
        let running = |state: ContainerState| {
            matches!(state, ContainerState::Running | ContainerState::Meta)
        };
        if running(parent.state()) {
            return Ok(());
        }

        loop {
            // topmost stopped ancestor under a running one starts first
            let mut target = Arc::clone(&parent);
            loop {
                let Some(up_id) = target.parent else { break };
                let Some(up) = self.tree.cell(up_id) else { break };
                if running(up.state()) {
                    break;
                }
                target = up;
            }
            let mut guard = self.tree.lock_write(&target)?;
            self.start_locked(&target, &mut guard)?;
            drop(guard);
            if target.id == parent.id {
                return Ok(());
            }
        }
    }

    fn start_locked(
        self: &Arc<Self>,
        cell: &Arc<ContainerCell>,
        guard: &mut TreeGuard<'_>,
    ) -> Result<()> {
        if cell.state() != ContainerState::Stopped {
            return Err(ArborError::invalid_state(format!(
                "cannot start container {} in state {}",
                cell.name,
                cell.state()
            )));
        }
        tracing::info!(id = %cell.id, name = %cell.name, "start container");

        if let Err(e) = self.prepare_start(cell) {
            Statistics::inc(&self.stats.containers_failed_start);
            return Err(e);
        }

        self.set_state(cell, ContainerState::Starting);
        {
            let mut data = cell.write();
            data.start_time_ms = Some(Self::now_ms());
            data.prop_set.set(Prop::StartTime);
        }

        if let Err(e) = self.prepare_resources(cell) {
            self.free_resources(cell);
            self.set_state(cell, ContainerState::Stopped);
            Statistics::inc(&self.stats.containers_failed_start);
            return Err(e);
        }

        guard.downgrade();
        let started = self.start_task(cell);
        guard.upgrade();

        if let Err(e) = started {
            self.set_state(cell, ContainerState::Stopping);
            if let Err(te) = self.terminate(cell, 0) {
                tracing::warn!(name = %cell.name, error = %te, "cleanup kill failed");
            }
            self.free_resources(cell);
            self.set_state(cell, ContainerState::Stopped);
            Statistics::inc(&self.stats.containers_failed_start);
            return Err(e);
        }

        let next = if cell.is_meta() {
            ContainerState::Meta
        } else {
            ContainerState::Running
        };
        self.set_state(cell, next);
        cell.write().prop_set.set(Prop::RootPid);

        if let Err(e) = self.save(cell) {
            tracing::error!(name = %cell.name, error = %e, "cannot save state after start");
            self.reap(cell, false);
            Statistics::inc(&self.stats.containers_failed_start);
            return Err(e);
        }
        Statistics::inc(&self.stats.containers_started);
        Ok(())
    }

    fn prepare_resources(&self, cell: &Arc<ContainerCell>) -> Result<()> {
        if cell.is_root() {
            return self.distribute_cpus(cell);
        }
        self.check_mem_guarantee()?;
        self.create_work_dir(cell)?;
        self.prepare_cgroups(cell)?;
        self.volumes.mount_links(&cell.name)?;
        self.propagate_cpu_limit(cell);
        Ok(())
    }

    fn prepare_cgroups(&self, cell: &Arc<ContainerCell>) -> Result<()> {
        if let Some(parent_id) = cell.parent {
            if let Some(parent) = self.tree.cell(parent_id) {
                let _serialize = self.cpu_lock.lock().unwrap_or_else(|e| e.into_inner());
                let parent_data = parent.read();
                let has_cpu_set = cell.read().prop_set.has(Prop::CpuSet);
                if !has_cpu_set {
                    if parent_data.cpu_affinity != parent_data.cpu_vacant
                        && self.driver.supported().contains(Controller::Cpuset)
                    {
                        // parent reserved cpus for a sibling; this one
                        // needs its own cpuset to stay out of them
                        tracing::info!(name = %cell.name, "cpuset forced by sibling reservation");
                        let mut data = cell.write();
                        data.controllers.insert(Controller::Cpuset);
                        data.required_controllers.insert(Controller::Cpuset);
                    } else {
                        let mut data = cell.write();
                        data.cpu_affinity = parent_data.cpu_affinity.clone();
                        data.cpu_vacant = parent_data.cpu_affinity.clone();
                    }
                }
            }
        }
        {
            let mut data = cell.write();
            if data.controllers.contains(Controller::Cpuset) {
                data.prop_set.set(Prop::CpuSet);
                data.prop_dirty.set(Prop::CpuSet);
            }
        }

        let controllers = cell.read().controllers;
        let missing = controllers.missing_from(self.driver.supported());
        if !missing.is_empty() {
            return Err(ArborError::not_supported(format!(
                "cgroup controllers are not available: {missing}"
            )));
        }
        for controller in controllers.iter() {
            let cg = self.get_cgroup(cell, controller)?;
            cg.create()?;
        }

        if controllers.contains(Controller::Memory) {
            let cg = self.get_cgroup(cell, Controller::Memory)?;
            memory::use_hierarchy(&cg)?;
            match memory::setup_oom_event(&cg) {
                Ok(Some(fd)) => {
                    self.events.register_oom(cell.id, &fd)?;
                    cell.write().oom_event = Some(fd);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(name = %cell.name, error = %e, "cannot arm oom monitor");
                    return Err(e);
                }
            }
        }

        if cell.level == 1 && controllers.contains(Controller::Devices) {
            let cg = self.get_cgroup(cell, Controller::Devices)?;
            devices::allow_all(&cg)?;
        }

        if controllers.contains(Controller::NetCls) {
            let classid = self.network.init_class(&cell.name)?;
            let cg = self.get_cgroup(cell, Controller::NetCls)?;
            netcls::set_classid(&cg, classid)?;
        }

        self.update_soft_limit(cell)
    }

    fn start_task(self: &Arc<Self>, cell: &Arc<ContainerCell>) -> Result<()> {
        if cell.is_root() {
            return Ok(());
        }

        // after a fresh cgroup setup every set property is pending
        {
            let mut data = cell.write();
            let set = data.prop_set;
            data.prop_dirty.merge(set);
            data.prop_dirty.clear(Prop::ResolvConf);
        }
        self.apply_dynamic_properties(cell)?;

        // meta containers hold cgroups and children but never a task of
        // their own; the last dying child moves them to dead
        if cell.is_meta() {
            return Ok(());
        }

        let (command, env, root, cred, hostname, isolate, os_mode, controllers) = {
            let data = cell.read();
            (
                data.command.clone(),
                data.env.clone(),
                data.root.clone(),
                data.task_cred,
                data.hostname.clone(),
                data.isolate,
                data.virt_mode == VirtMode::Os,
                data.controllers,
            )
        };
        let mut cgroup_paths = Vec::new();
        for controller in controllers.iter() {
            cgroup_paths.push(self.get_cgroup(cell, controller)?.path().to_path_buf());
        }
        let work_dir = cell.work_dir(&self.config);
        let spec = StartSpec {
            name: cell.name.clone(),
            argv: command.split_whitespace().map(str::to_string).collect(),
            env: self.build_environment(cell, &env),
            cwd: cell.get_cwd(&self.config),
            root,
            cred,
            hostname,
            isolate,
            os_mode,
            cgroup_paths,
            stdout_path: stdio::stdout_path(&work_dir),
            stderr_path: stdio::stderr_path(&work_dir),
        };

        let started = match self.starter.start(&spec) {
            Ok(started) => started,
            Err(e) => {
                // a kill racing with the start may surface here first
                if self.recv_oom_events(cell) {
                    return Err(ArborError::no_resource(format!(
                        "OOM at container {} start: {e}",
                        cell.name
                    )));
                }
                return Err(e);
            }
        };

        {
            let mut data = cell.write();
            data.task_pid = Some(started.pid);
            data.wait_pid = Some(started.wait_pid);
        }
        if let Some(mut child) = started.child {
            let engine = Arc::clone(self);
            let pid = started.wait_pid;
            std::thread::Builder::new()
                .name(format!("wait-{}", cell.name))
                .spawn(move || {
                    use std::os::unix::process::ExitStatusExt;
                    match child.wait() {
                        Ok(status) => {
                            engine.events.push(Event::Exit {
                                pid,
                                status: status.into_raw(),
                            });
                        }
                        // a concurrent reaper already collected the status
                        // and reported it as a child exit
                        Err(e) => tracing::debug!(pid, error = %e, "wait lost the race"),
                    }
                })
                .map_err(|e| ArborError::new(ErrorKind::Unknown, format!("wait thread: {e}")))?;
        }
        Ok(())
    }

    fn build_environment(&self, cell: &Arc<ContainerCell>, own: &[String]) -> Vec<String> {
        let mut env = vec![
            "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            format!("container={}", arbor_common::constants::APP_NAME),
            format!("ARBOR_NAME={}", cell.name),
        ];
        env.extend(own.iter().cloned());
        // ancestors fill in what the container itself left unset
        for ancestor in self.tree.ancestors(cell.id) {
            let data = ancestor.read();
            for entry in &data.env {
                let key = entry.split('=').next().unwrap_or(entry);
                if !env.iter().any(|e| e.split('=').next() == Some(key)) {
                    env.push(entry.clone());
                }
            }
            if data.isolate {
                break;
            }
        }
        env
    }

    /// Stops the whole subtree; `timeout_ms` is the graceful budget
    /// before the killing escalates to SIGKILL. Idempotent on a stopped
    /// container.
    ///
    /// # Errors
    ///
    /// Fails when a frozen ancestor holds the subtree or persistence
    /// fails; kernel kill errors are logged and do not stop the walk.
    pub fn stop(&self, name: &str, timeout_ms: u64) -> Result<()> {
        let cell = self.tree.require(name)?;
        let mut guard = self.tree.lock_write(&cell)?;
        self.stop_locked(&cell, &mut guard, timeout_ms)
    }

    pub(crate) fn stop_locked(
        &self,
        cell: &Arc<ContainerCell>,
        guard: &mut TreeGuard<'_>,
        timeout_ms: u64,
    ) -> Result<()> {
        if cell.state() == ContainerState::Stopped {
            return Ok(());
        }
        tracing::info!(id = %cell.id, name = %cell.name, timeout_ms, "stop container");

        if cell.read().controllers.contains(Controller::Freezer) {
            let cg = self.get_cgroup(cell, Controller::Freezer)?;
            if cg.exists() && freezer::is_parent_freezing(&cg) {
                return Err(ArborError::invalid_state("parent container is paused"));
            }
        } else if cell.read().task_pid.is_some() {
            return Err(ArborError::not_supported("cannot stop without freezer"));
        }

        let deadline = if timeout_ms > 0 {
            Self::now_ms() + timeout_ms
        } else {
            0
        };
        let subtree = self.tree.subtree_children_first(cell.id);

        if timeout_ms == 0 {
            for ct in &subtree {
                let data = ct.read();
                if data.isolate {
                    if let Some(pid) = data.wait_pid {
                        let _ = nix::sys::signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
                    }
                }
            }
        } else {
            guard.downgrade();
        }

        for ct in &subtree {
            if ct.is_root() || ct.state() == ContainerState::Stopped {
                continue;
            }
            self.set_state(ct, ContainerState::Stopping);
            if let Err(e) = self.terminate(ct, deadline) {
                tracing::error!(name = %ct.name, error = %e, "cannot terminate tasks");
            }
            if let Ok(cg) = self.get_cgroup(ct, Controller::Freezer) {
                if cg.exists() && freezer::is_self_freezing(&cg) {
                    tracing::info!(name = %ct.name, "thawing terminated paused container");
                    if let Err(e) = freezer::thaw(&cg, None) {
                        tracing::error!(name = %ct.name, error = %e, "cannot thaw");
                    }
                }
            }
        }

        if timeout_ms > 0 {
            guard.upgrade();
        }

        for ct in &subtree {
            if ct.is_root() || ct.state() == ContainerState::Stopped {
                continue;
            }
            {
                let mut data = ct.write();
                data.forget_pids();
                data.prop_set.clear(Prop::RootPid);
                data.prop_set.clear(Prop::SeizePid);
                data.death_time_ms = None;
                data.prop_set.clear(Prop::DeathTime);
                data.exit_status = None;
                data.prop_set.clear(Prop::ExitStatus);
                data.oom_events = 0;
                data.oom_killed = false;
                data.prop_set.clear(Prop::OomKilled);
            }
            self.free_resources(ct);
            self.set_state(ct, ContainerState::Stopped);
            self.save(ct)?;
        }
        Ok(())
    }

    /// Signals, waits for the graceful deadline, then kills everything
    /// in the container's freezer cgroup.
    ///
    /// # Errors
    ///
    /// Fails for the root, without a freezer, or when kills fail.
    pub(crate) fn terminate(&self, cell: &Arc<ContainerCell>, deadline_ms: u64) -> Result<()> {
        if cell.is_root() {
            return Err(ArborError::permission("cannot terminate the root container"));
        }
        let (task_pid, wait_pid, isolate, os_mode) = {
            let data = cell.read();
            (
                data.task_pid,
                data.wait_pid,
                data.isolate,
                data.virt_mode == VirtMode::Os,
            )
        };
        if !cell.read().controllers.contains(Controller::Freezer) {
            if task_pid.is_some() {
                return Err(ArborError::not_supported("cannot terminate without freezer"));
            }
            return Ok(());
        }
        let cg = self.get_cgroup(cell, Controller::Freezer)?;
        if !cg.exists() || cg.is_empty() {
            return Ok(());
        }
        tracing::info!(name = %cell.name, "terminate tasks");

        if freezer::is_frozen(&cg) {
            return cg.kill_all(Signal::SIGKILL);
        }

        if let Some(pid) = task_pid {
            if deadline_ms > 0 && !cell.is_meta() {
                let mut sig = Some(Signal::SIGTERM);
                if isolate && os_mode {
                    if proc::handles_signal(pid, Signal::SIGPWR) {
                        sig = Some(Signal::SIGPWR);
                    } else if !proc::handles_signal(pid, Signal::SIGTERM) {
                        sig = None;
                    }
                }
                if let Some(sig) = sig {
                    if nix::sys::signal::kill(Pid::from_raw(pid), sig).is_ok() {
                        tracing::info!(name = %cell.name, pid, sig = %sig, "graceful wait");
                        while proc::alive(pid)
                            && !proc::is_zombie(pid)
                            && Self::now_ms() < deadline_ms
                        {
                            std::thread::sleep(Duration::from_millis(10));
                        }
                    }
                }
            }
        }

        if isolate {
            if let Some(pid) = wait_pid {
                let _ = nix::sys::signal::kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
        }
        if cg.is_empty() {
            return Ok(());
        }
        cg.kill_all(Signal::SIGKILL)
    }

    /// Freezes the container and marks every live descendant paused.
    ///
    /// # Errors
    ///
    /// Fails unless the container is running or meta, or without the
    /// freezer controller.
    pub fn pause(&self, name: &str) -> Result<()> {
        let cell = self.tree.require(name)?;
        let _guard = self.tree.lock_write(&cell)?;
        if !matches!(
            cell.state(),
            ContainerState::Running | ContainerState::Meta
        ) {
            return Err(ArborError::invalid_state("container is not running"));
        }
        if !cell.read().controllers.contains(Controller::Freezer) {
            return Err(ArborError::not_supported("cannot pause without freezer"));
        }
        let cg = self.get_cgroup(&cell, Controller::Freezer)?;
        freezer::freeze(&cg, self.freeze_wait())?;

        for ct in self.tree.subtree_children_first(cell.id) {
            if matches!(
                ct.state(),
                ContainerState::Running | ContainerState::Meta
            ) {
                self.set_state(&ct, ContainerState::Paused);
                self.propagate_cpu_limit(&ct);
                if let Err(e) = self.save(&ct) {
                    tracing::error!(name = %ct.name, error = %e, "cannot save after pause");
                }
            }
        }
        Ok(())
    }

    /// Thaws a paused container and restores the subtree's states.
    ///
    /// # Errors
    ///
    /// Fails when the container is not self-frozen or an ancestor holds
    /// the freeze.
    pub fn resume(&self, name: &str) -> Result<()> {
        let cell = self.tree.require(name)?;
        let _guard = self.tree.lock_write(&cell)?;
        if !cell.read().controllers.contains(Controller::Freezer) {
            return Err(ArborError::not_supported("cannot resume without freezer"));
        }
        let cg = self.get_cgroup(&cell, Controller::Freezer)?;
        if freezer::is_parent_freezing(&cg) {
            return Err(ArborError::invalid_state("parent container is paused"));
        }
        if !freezer::is_self_freezing(&cg) {
            return Err(ArborError::invalid_state("container is not paused"));
        }
        freezer::thaw(&cg, Some(self.freeze_wait()))?;

        for ct in self.tree.subtree_children_first(cell.id) {
            if let Ok(child_cg) = self.get_cgroup(&ct, Controller::Freezer) {
                if child_cg.exists() && freezer::is_self_freezing(&child_cg) {
                    let _ = freezer::thaw(&child_cg, None);
                }
            }
            if ct.state() == ContainerState::Paused {
                let next = if ct.is_meta() {
                    ContainerState::Meta
                } else {
                    ContainerState::Running
                };
                self.set_state(&ct, next);
                self.propagate_cpu_limit(&ct);
            }
            if let Err(e) = self.save(&ct) {
                tracing::error!(name = %ct.name, error = %e, "cannot save after resume");
            }
        }
        Ok(())
    }

    /// Sends a signal to the main task only.
    ///
    /// # Errors
    ///
    /// Fails unless the container is running.
    pub fn kill(&self, name: &str, signal: i32) -> Result<()> {
        let cell = self.tree.require(name)?;
        let _guard = self.tree.lock_read(&cell)?;
        if cell.state() != ContainerState::Running {
            return Err(ArborError::invalid_state("container is not running"));
        }
        let pid = cell
            .read()
            .task_pid
            .ok_or_else(|| ArborError::invalid_state("container has no task"))?;
        let signal = Signal::try_from(signal)
            .map_err(|_| ArborError::invalid_value(format!("bad signal: {signal}")))?;
        tracing::info!(name, pid, sig = %signal, "kill");
        nix::sys::signal::kill(Pid::from_raw(pid), signal)
            .map_err(|e| ArborError::new(ErrorKind::Unknown, format!("kill: {e}")).with_errno(e as i32))
    }

    /// Moves a terminated container to dead: records the death, rotates
    /// stdio, releases runtime resources and arms the respawn timer.
    pub(crate) fn reap(&self, cell: &Arc<ContainerCell>, oom_killed: bool) {
        tracing::info!(name = %cell.name, oom_killed, "reap");
        if let Err(e) = self.terminate(cell, 0) {
            tracing::warn!(name = %cell.name, error = %e, "cannot terminate while reaping");
        }
        {
            let mut data = cell.write();
            data.death_time_ms = Some(Self::now_ms());
            data.prop_set.set(Prop::DeathTime);
            if oom_killed {
                data.oom_killed = true;
                data.prop_set.set(Prop::OomKilled);
            }
            data.forget_pids();
            data.prop_set.clear(Prop::RootPid);
            data.prop_set.clear(Prop::SeizePid);
        }

        let work_dir = cell.work_dir(&self.config);
        let limit = self.config.container.stdio_limit;
        for path in [stdio::stdout_path(&work_dir), stdio::stderr_path(&work_dir)] {
            if let Err(e) = stdio::rotate(&path, limit) {
                tracing::warn!(name = %cell.name, error = %e, "stdio rotation failed");
            }
        }

        self.set_state(cell, ContainerState::Dead);
        self.free_runtime_resources(cell);
        if let Err(e) = self.save(cell) {
            tracing::warn!(name = %cell.name, error = %e, "cannot save after exit");
        }

        let auto_respawn = cell.read().respawn;
        if auto_respawn && self.may_respawn(cell).is_ok() {
            self.schedule_respawn(cell);
        }

        if let Some(parent_id) = cell.parent {
            if let Some(parent) = self.tree.cell(parent_id) {
                let (starting, running) = self.tree.child_counters(parent.id);
                if !parent.is_root()
                    && parent.state() == ContainerState::Meta
                    && starting == 0
                    && running == 0
                {
                    self.events.push(Event::MetaExit(parent.id));
                }
            }
        }
    }

    fn schedule_respawn(&self, cell: &Arc<ContainerCell>) {
        let delay = Duration::from_millis(cell.read().respawn_delay_ms);
        tracing::info!(name = %cell.name, delay_ms = delay.as_millis() as u64, "respawn scheduled");
        self.events.push_after(delay, Event::Respawn(cell.id));
    }

    /// Handles the main task's exit: decodes the status, detects OOM
    /// kills, and reaps the whole subtree.
    pub(crate) fn exit(&self, cell: &Arc<ContainerCell>, status: i32, oom_hint: bool) {
        if cell.state() == ContainerState::Stopped {
            return;
        }
        // SIGKILL can land before the OOM notification is readable
        let mut oom = oom_hint || self.recv_oom_events(cell);

        let mut status = status;
        let (task_pid, wait_pid, oom_is_fatal) = {
            let data = cell.read();
            (data.task_pid, data.wait_pid, data.oom_is_fatal)
        };
        if wait_pid != task_pid && status & 0x7f == 0 {
            // the init helper reports a fatal signal as 128+sig because
            // it cannot kill itself with it
            let code = (status >> 8) & 0xff;
            if code > 128 && code < 128 + SIGRTMIN * 2 {
                let sig = if code > 128 + SIGRTMIN {
                    code - SIGRTMIN
                } else {
                    code - 128
                };
                status = signal_status(sig);
            }
        }
        tracing::info!(
            name = %cell.name,
            status = %arbor_common::types::format_exit_status(status),
            oom,
            "task exited"
        );
        {
            let mut data = cell.write();
            data.exit_status = Some(status);
            data.prop_set.set(Prop::ExitStatus);
        }

        if !oom && oom_is_fatal {
            if let Ok(cg) = self.get_cgroup(cell, Controller::Memory) {
                if cg.exists() && memory::get_oom_events(&cg).unwrap_or(0) > 0 {
                    tracing::warn!(name = %cell.name, "memory limit hit during exit");
                    oom = true;
                }
            }
        }

        for ct in self.tree.subtree_children_first(cell.id) {
            if !matches!(
                ct.state(),
                ContainerState::Stopped | ContainerState::Dead
            ) {
                self.reap(&ct, oom);
            }
        }
    }

    fn may_respawn(&self, cell: &Arc<ContainerCell>) -> Result<()> {
        if cell.state() != ContainerState::Dead {
            return Err(ArborError::invalid_state("cannot respawn a non-dead container"));
        }
        if let Some(parent_id) = cell.parent {
            let parent = self
                .tree
                .cell(parent_id)
                .ok_or_else(|| ArborError::no_container("parent container is gone"))?;
            if !matches!(
                parent.state(),
                ContainerState::Running | ContainerState::Meta
            ) {
                return Err(ArborError::invalid_state(
                    "cannot respawn: parent container is not running",
                ));
            }
        }
        let data = cell.read();
        if data.respawn_limit >= 0 && data.respawn_count >= data.respawn_limit.unsigned_abs() {
            return Err(ArborError::no_resource("respawn limit reached"));
        }
        Ok(())
    }

    /// Restarts a dead container, counting the attempt.
    ///
    /// # Errors
    ///
    /// Fails when the container is not dead, the parent is down or the
    /// respawn budget is exhausted.
    pub fn respawn(self: &Arc<Self>, name: &str) -> Result<()> {
        let cell = self.tree.require(name)?;
        let mut guard = self.tree.lock_write(&cell)?;
        self.respawn_locked(&cell, &mut guard)
    }

    fn respawn_locked(
        self: &Arc<Self>,
        cell: &Arc<ContainerCell>,
        guard: &mut TreeGuard<'_>,
    ) -> Result<()> {
        self.may_respawn(cell)?;
        tracing::info!(name = %cell.name, "respawn");
        self.stop_locked(cell, guard, 0)?;
        {
            let mut data = cell.write();
            data.respawn_count += 1;
            data.prop_set.set(Prop::RespawnCount);
        }
        self.start_locked(cell, guard)
    }

    /// Destroys a container and its whole subtree: stops everything,
    /// unlinks volumes, removes persistence records and releases ids.
    ///
    /// # Errors
    ///
    /// Fails for the root container and when the stop fails.
    pub fn destroy(&self, name: &str) -> Result<()> {
        let cell = self.tree.require(name)?;
        let mut guard = self.tree.lock_write(&cell)?;
        self.destroy_locked(&cell, &mut guard)
    }

    fn destroy_locked(&self, cell: &Arc<ContainerCell>, guard: &mut TreeGuard<'_>) -> Result<()> {
        if cell.is_root() {
            return Err(ArborError::permission("cannot destroy the root container"));
        }
        tracing::info!(id = %cell.id, name = %cell.name, "destroy container");

        if cell.state() != ContainerState::Stopped {
            self.stop_locked(cell, guard, 0)?;
        }

        for ct in self.tree.subtree_children_first(cell.id) {
            self.volumes.unlink_all(&ct.name);
            self.tree.unregister(ct.id);
            if let Err(e) = self.kv.delete(ct.id) {
                tracing::error!(name = %ct.name, error = %e, "cannot remove persistence record");
            }
            Statistics::dec(&self.stats.containers_count);
            ct.notify_waiters();
        }
        Ok(())
    }

    /// Applies every dirty dynamic property to the kernel in the fixed
    /// order, clearing dirty bits as writes land.
    ///
    /// # Errors
    ///
    /// Returns the first kernel failure; the failing property's dirty
    /// bit stays set.
    pub fn apply_dynamic_properties(&self, cell: &Arc<ContainerCell>) -> Result<()> {
        if cell.is_root() {
            return Ok(());
        }
        let controllers = cell.read().controllers;

        if controllers.contains(Controller::Memory) {
            let memcg = self.get_cgroup(cell, Controller::Memory)?;

            if cell.write().prop_dirty.take(Prop::MemGuarantee) {
                self.check_mem_guarantee()?;
                let wanted = cell.read().new_mem_guarantee;
                memory::set_guarantee(&memcg, wanted)?;
                cell.write().mem_guarantee = wanted;
            }
            if cell.write().prop_dirty.take(Prop::MemLimit) {
                memory::set_limit(&memcg, cell.read().mem_limit)?;
            }
            if cell.write().prop_dirty.take(Prop::AnonLimit) {
                memory::set_anon_limit(&memcg, cell.read().anon_limit)?;
            }
            if cell.write().prop_dirty.take(Prop::DirtyLimit) {
                memory::set_dirty_limit(&memcg, cell.read().dirty_limit)?;
            }
            if cell.write().prop_dirty.take(Prop::PressurizeOnDeath) {
                self.update_soft_limit(cell)?;
            }
            cell.write().prop_dirty.clear(Prop::OomIsFatal);
        }

        if cell.write().prop_dirty.take(Prop::IoLimit) {
            self.apply_io_throttle(cell, false)?;
        }
        if cell.write().prop_dirty.take(Prop::IoOpsLimit) {
            self.apply_io_throttle(cell, true)?;
        }
        let io_weight_dirty = cell.write().prop_dirty.take(Prop::IoWeight);
        let io_policy_dirty = cell.read().prop_dirty.has(Prop::IoPolicy);
        if (io_weight_dirty || io_policy_dirty) && controllers.contains(Controller::Blkio) {
            let cg = self.get_cgroup(cell, Controller::Blkio)?;
            let (policy, weight) = {
                let data = cell.read();
                (data.io_policy.clone(), data.io_weight)
            };
            blkio::set_weight(&cg, &policy, weight)?;
        }
        if cell.write().prop_dirty.take(Prop::IoPolicy) {
            self.apply_io_policy(cell)?;
        }

        if controllers.contains(Controller::Hugetlb)
            && cell.write().prop_dirty.take(Prop::HugetlbLimit)
        {
            let cg = self.get_cgroup(cell, Controller::Hugetlb)?;
            let limit = cell.read().hugetlb_limit;
            hugetlb::set_limit(&cg, limit)?;
        }

        if controllers.contains(Controller::Cpu) {
            let period_dirty = cell.read().prop_dirty.has(Prop::CpuPeriod);
            let guarantee_dirty = cell.write().prop_dirty.take(Prop::CpuGuarantee);
            if period_dirty || guarantee_dirty {
                let mut chain = vec![Arc::clone(cell)];
                chain.extend(self.tree.ancestors(cell.id));
                for ct in chain {
                    self.apply_cpu_guarantee(&ct)?;
                }
            }
        }

        if cell.read().prop_dirty.has(Prop::CpuLimit) {
            self.propagate_cpu_limit(cell);
        }
        if controllers.contains(Controller::Cpu) {
            let policy_dirty = cell.read().prop_dirty.has(Prop::CpuPolicy);
            let weight_dirty = cell.read().prop_dirty.has(Prop::CpuWeight);
            let limit_dirty = cell.write().prop_dirty.take(Prop::CpuLimit);
            let period_dirty = cell.write().prop_dirty.take(Prop::CpuPeriod);
            if policy_dirty || weight_dirty || limit_dirty || period_dirty {
                self.apply_cpu_limit(cell)?;
            }
        }
        let policy_dirty = cell.write().prop_dirty.take(Prop::CpuPolicy);
        let weight_dirty = cell.write().prop_dirty.take(Prop::CpuWeight);
        if policy_dirty || weight_dirty {
            self.apply_sched_policy(cell)?;
        }

        if cell.write().prop_dirty.take(Prop::CpuSet) {
            if let Some(parent_id) = cell.parent {
                if let Some(parent) = self.tree.cell(parent_id) {
                    self.distribute_cpus(&parent)?;
                }
            }
        }

        if cell.write().prop_dirty.take(Prop::Ulimit) {
            for ct in self.tree.subtree_children_first(cell.id) {
                if matches!(
                    ct.state(),
                    ContainerState::Stopped | ContainerState::Dead
                ) {
                    continue;
                }
                self.apply_ulimits(&ct)?;
            }
        }

        if controllers.contains(Controller::Pids)
            && cell.write().prop_dirty.take(Prop::ThreadLimit)
        {
            let cg = self.get_cgroup(cell, Controller::Pids)?;
            let limit = cell.read().thread_limit;
            pids::set_limit(&cg, limit)?;
        }

        if cell.write().prop_dirty.take(Prop::ResolvConf) {
            self.apply_resolv_conf(cell)?;
        }

        Ok(())
    }

    fn apply_io_throttle(&self, cell: &Arc<ContainerCell>, ops: bool) -> Result<()> {
        let map = {
            let data = cell.read();
            if ops {
                data.io_ops_limit.clone()
            } else {
                data.io_bps_limit.clone()
            }
        };
        let controllers = cell.read().controllers;
        for (key, value) in &map {
            if key == "fs" {
                if controllers.contains(Controller::Memory) {
                    let memcg = self.get_cgroup(cell, Controller::Memory)?;
                    if ops {
                        memory::set_fs_iops_limit(&memcg, *value)?;
                    } else {
                        memory::set_fs_bps_limit(&memcg, *value)?;
                    }
                }
                continue;
            }
            if controllers.contains(Controller::Blkio) {
                let cg = self.get_cgroup(cell, Controller::Blkio)?;
                let device = blkio::resolve_device(&self.config.sysfs_root, key)?;
                blkio::set_throttle(&cg, &device, *value, ops)?;
            }
        }
        Ok(())
    }

    /// Retries over the freezer task list until it stabilizes; tasks may
    /// fork while the walk is in progress.
    fn for_each_task<F: FnMut(i32) -> Result<()>>(
        &self,
        cell: &Arc<ContainerCell>,
        mut apply: F,
    ) -> Result<()> {
        let cg = self.get_cgroup(cell, Controller::Freezer)?;
        if !cg.exists() {
            return Ok(());
        }
        let mut prev: Vec<i32> = Vec::new();
        for _ in 0..100 {
            let tasks = cg.get_tasks()?;
            let mut progressed = false;
            for pid in &tasks {
                if prev.contains(pid) {
                    continue;
                }
                match apply(*pid) {
                    Ok(()) => {}
                    Err(e) if e.errno() == Some(libc::ESRCH) => {}
                    Err(e) => return Err(e),
                }
                progressed = true;
            }
            if !progressed {
                return Ok(());
            }
            prev = tasks;
        }
        Ok(())
    }

    fn apply_ulimits(&self, cell: &Arc<ContainerCell>) -> Result<()> {
        tracing::info!(name = %cell.name, "apply ulimits");
        // merged map: own entries win over ancestors'
        let mut merged = cell.read().ulimit.clone();
        for ancestor in self.tree.ancestors(cell.id) {
            for (key, pair) in &ancestor.read().ulimit {
                merged.entry(key.clone()).or_insert(*pair);
            }
        }
        let limits: Vec<(arbor_core::proc::RlimitResource, u64, u64)> = merged
            .iter()
            .filter_map(|(name, (soft, hard))| {
                proc::rlimit_by_name(name).ok().map(|res| (res, *soft, *hard))
            })
            .collect();
        self.for_each_task(cell, |pid| {
            for (res, soft, hard) in &limits {
                proc::set_rlimit(pid, *res, *soft, *hard)?;
            }
            Ok(())
        })
    }

    fn apply_sched_policy(&self, cell: &Arc<ContainerCell>) -> Result<()> {
        let (policy, weight) = {
            let data = cell.read();
            (data.cpu_policy, data.cpu_weight)
        };
        let params = SchedParams::choose(policy, weight);
        tracing::info!(name = %cell.name, policy = %policy, "apply scheduler policy");
        self.for_each_task(cell, |pid| proc::set_scheduler(pid, params))
    }

    fn apply_io_policy(&self, cell: &Arc<ContainerCell>) -> Result<()> {
        let level = match cell.read().io_policy.as_str() {
            "high" => 0,
            "" | "none" | "normal" => 4,
            "batch" => 5,
            "idle" => 7,
            other => {
                return Err(ArborError::invalid_value(format!(
                    "unknown io policy: {other}"
                )))
            }
        };
        self.for_each_task(cell, |pid| proc::set_io_prio(pid, level))
    }

    fn apply_resolv_conf(&self, cell: &Arc<ContainerCell>) -> Result<()> {
        let (pid, lines) = {
            let data = cell.read();
            (data.task_pid, data.resolv_conf.clone())
        };
        if lines.is_empty() {
            return Ok(());
        }
        let Some(pid) = pid else {
            return Err(ArborError::invalid_state("container has no task"));
        };
        let path = format!("/proc/{pid}/root/etc/resolv.conf");
        tracing::info!(name = %cell.name, "apply resolv.conf");
        std::fs::write(&path, lines.join("\n") + "\n")
            .map_err(|e| ArborError::io(&path, &e))
    }

    pub(crate) fn free_runtime_resources(&self, cell: &Arc<ContainerCell>) {
        if let Some(fd) = self.take_oom_fd(cell) {
            self.events.unregister_oom(cell.id, &fd);
        }
        if let Err(e) = self.update_soft_limit(cell) {
            tracing::warn!(name = %cell.name, error = %e, "cannot update soft limit");
        }

        let had_reserve = !cell.read().cpu_reserve.is_empty();
        if had_reserve {
            if let Some(parent_id) = cell.parent {
                if let Some(parent) = self.tree.cell(parent_id) {
                    tracing::info!(name = %cell.name, "releasing reserved cpus");
                    if let Err(e) = self.distribute_cpus(&parent) {
                        tracing::error!(name = %cell.name, error = %e, "cannot redistribute cpus");
                    }
                }
            }
        }
        self.propagate_cpu_limit(cell);

        if cell.read().cpu_guarantee != 0 {
            for ancestor in self.tree.ancestors(cell.id) {
                let _ = self.apply_cpu_guarantee(&ancestor);
            }
        }
    }

    pub(crate) fn free_resources(&self, cell: &Arc<ContainerCell>) {
        self.free_runtime_resources(cell);
        if cell.is_root() {
            return;
        }
        let controllers = cell.read().controllers;
        for controller in controllers.iter() {
            if let Ok(cg) = self.get_cgroup(cell, controller) {
                if let Err(e) = cg.remove() {
                    tracing::warn!(name = %cell.name, error = %e, "cannot remove cgroup");
                }
            }
        }
        self.volumes.unmount_links(&cell.name);
        self.network.release_class(&cell.name, 0);
        self.remove_work_dir(cell);
    }

    fn create_work_dir(&self, cell: &Arc<ContainerCell>) -> Result<()> {
        let dir = cell.work_dir(&self.config);
        if dir.exists() {
            tracing::info!(name = %cell.name, "removing stale work dir");
            let _ = std::fs::remove_dir_all(&dir);
        }
        std::fs::create_dir_all(&dir).map_err(|e| ArborError::io(&dir, &e))?;
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o775);
        std::fs::set_permissions(&dir, perms).map_err(|e| ArborError::io(&dir, &e))?;
        let cred = cell.read().task_cred;
        if let Err(e) = nix::unistd::chown(
            &dir,
            Some(nix::unistd::Uid::from_raw(cred.uid)),
            Some(nix::unistd::Gid::from_raw(cred.gid)),
        ) {
            // unprivileged test runs cannot chown; the kernel will say so
            tracing::debug!(name = %cell.name, error = %e, "cannot chown work dir");
        }
        Ok(())
    }

    fn remove_work_dir(&self, cell: &Arc<ContainerCell>) {
        if cell.is_root() {
            return;
        }
        let dir = cell.work_dir(&self.config);
        if !dir.exists() {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&dir) {
            tracing::warn!(name = %cell.name, error = %e, "cannot remove work dir");
        }
    }

    /// Persists the container's raw identity and every set persisted
    /// property.
    ///
    /// # Errors
    ///
    /// Returns the storage failure.
    pub fn save(&self, cell: &Arc<ContainerCell>) -> Result<()> {
        let mut records = vec![
            ("id".to_string(), cell.id.0.to_string()),
            ("name".to_string(), cell.name.clone()),
        ];
        for desc in props::PROPERTIES {
            if !desc.persist {
                continue;
            }
            let relevant = desc.prop == Prop::State || cell.read().prop_set.has(desc.prop);
            if !relevant {
                continue;
            }
            match props::get(cell, &self.config, desc.name, None) {
                Ok(value) => records.push((desc.name.to_string(), value)),
                Err(e) if e.kind() == ErrorKind::NoValue => {}
                Err(e) => return Err(e),
            }
        }
        self.kv.put(cell.id, &records)
    }

    /// Rebuilds the tree from the record store and reconciles each
    /// container against the kernel.
    ///
    /// # Errors
    ///
    /// Returns storage enumeration failures; individual broken records
    /// are logged and skipped.
    pub fn restore(self: &Arc<Self>) -> Result<()> {
        for id in self.kv.list()? {
            if id.0 == arbor_common::constants::ROOT_CONTAINER_ID {
                continue;
            }
            if let Err(e) = self.restore_one(id) {
                tracing::error!(id = %id, error = %e, "cannot restore container");
                let _ = self.kv.delete(id);
            }
        }
        Ok(())
    }

    fn restore_one(self: &Arc<Self>, id: CtId) -> Result<()> {
        let records = self.kv.get(id)?;
        let name = records
            .iter()
            .find(|(key, _)| key == "name")
            .map(|(_, value)| value.clone())
            .ok_or_else(|| ArborError::invalid_value("record has no name"))?;
        tracing::info!(id = %id, name, "restore container");

        let parent = self.tree.require(ContainerCell::parent_name(&name))?;
        self.tree.alloc_id_at(id.0)?;
        let cell = Arc::new(ContainerCell::new(
            id,
            name,
            Some((&parent, parent.id)),
            &self.config,
            self.driver.supported(),
        ));
        if let Err(e) = self.tree.register(Arc::clone(&cell)) {
            self.tree.release_id(id);
            return Err(e);
        }
        Statistics::inc(&self.stats.containers_count);

        if let Err(e) = self.restore_body(&cell, &records) {
            self.set_state(&cell, ContainerState::Stopped);
            self.remove_work_dir(&cell);
            self.tree.unregister(cell.id);
            Statistics::dec(&self.stats.containers_count);
            return Err(e);
        }
        Ok(())
    }

    fn restore_body(
        &self,
        cell: &Arc<ContainerCell>,
        records: &[crate::persist::Record],
    ) -> Result<()> {
        let mut state = ContainerState::Stopped;
        let mut broken = false;
        for (key, value) in records {
            if key == "id" || key == "name" {
                continue;
            }
            if key == "state" {
                // applied last: properties behave differently per state
                state = value.parse().unwrap_or(ContainerState::Stopped);
                continue;
            }
            let Some(desc) = props::find(key) else {
                tracing::warn!(key = %key, "unknown persisted property skipped");
                continue;
            };
            if let Err(e) = props::load(cell, desc, value) {
                tracing::error!(key = %key, error = %e, "cannot load property");
                broken = true;
            }
        }
        cell.write().prop_dirty = crate::props::PropMask::default();
        self.sanitize_capabilities(cell);
        if broken && state != ContainerState::Stopped {
            state = ContainerState::Dead;
        }
        self.set_state(cell, state);

        self.sync_state(cell);

        if self.has_resources(cell) && cell.state() != ContainerState::Dead {
            self.prepare_cgroups(cell)?;
            self.apply_dynamic_properties(cell)?;
            self.propagate_cpu_limit(cell);
            self.sync_cgroups(cell)?;
        }

        let auto_respawn = cell.read().respawn;
        if auto_respawn && self.may_respawn(cell).is_ok() {
            self.schedule_respawn(cell);
        }
        if cell.read().is_weak {
            self.events.push(Event::DestroyWeak(cell.id));
        }
        self.save(cell)?;
        if cell.state() == ContainerState::Stopped {
            self.remove_work_dir(cell);
        }
        Ok(())
    }

    /// Reconciles the in-memory state against the kernel: a missing
    /// freezer means stopped, a missing task means dead, a reparented
    /// task is seized, and the parent state clamps the child. Runs for
    /// every container during restore.
    pub fn sync_state(&self, cell: &Arc<ContainerCell>) {
        tracing::info!(name = %cell.name, state = %cell.state(), "sync state");

        let Ok(freezer_cg) = self.get_cgroup(cell, Controller::Freezer) else {
            return;
        };
        if !freezer_cg.exists() {
            if cell.state() != ContainerState::Stopped {
                tracing::warn!(name = %cell.name, "freezer not found");
            }
            let mut data = cell.write();
            data.forget_pids();
            data.prop_set.clear(Prop::RootPid);
            data.prop_set.clear(Prop::SeizePid);
            drop(data);
            self.set_state(cell, ContainerState::Stopped);
            return;
        }

        if cell.state() == ContainerState::Starting {
            let next = if cell.is_meta() {
                ContainerState::Meta
            } else {
                ContainerState::Running
            };
            self.set_state(cell, next);
        }

        if freezer::is_frozen(&freezer_cg) {
            if cell.state() != ContainerState::Paused {
                let _ = freezer::thaw(&freezer_cg, None);
            }
        } else if cell.state() == ContainerState::Paused {
            let next = if cell.is_meta() {
                ContainerState::Meta
            } else {
                ContainerState::Running
            };
            self.set_state(cell, next);
        }

        let (wait_pid, isolate) = {
            let data = cell.read();
            (data.wait_pid, data.isolate)
        };

        if cell.state() == ContainerState::Stopped {
            tracing::warn!(name = %cell.name, "unexpected freezer for a stopped container");
            self.reap(cell, false);
        } else if cell.state() == ContainerState::Meta && wait_pid.is_none() && !isolate {
            // hollow meta container, nothing to check
        } else if let Some(pid) = wait_pid {
            if !proc::alive(pid) {
                if cell.state() != ContainerState::Dead {
                    tracing::warn!(name = %cell.name, pid, "task not found");
                    self.reap(cell, false);
                }
            } else if proc::is_zombie(pid) {
                tracing::info!(name = %cell.name, pid, "task is a zombie");
                cell.write().task_pid = None;
            } else if proc::ppid(pid) != Some(std::process::id() as i32) {
                let ppid = proc::ppid(pid).unwrap_or(0);
                tracing::info!(name = %cell.name, pid, ppid, "task reparented, seizing");
                match self
                    .starter
                    .seize(&cell.name, pid, freezer_cg.path())
                {
                    Ok(seize_pid) => {
                        let mut data = cell.write();
                        data.seize_pid = Some(seize_pid);
                        data.prop_set.set(Prop::SeizePid);
                    }
                    Err(e) => {
                        tracing::warn!(name = %cell.name, error = %e, "cannot seize");
                        self.reap(cell, false);
                    }
                }
            }
        } else if cell.state() != ContainerState::Dead {
            tracing::warn!(name = %cell.name, "no task recorded");
            self.reap(cell, false);
        }

        // the parent state binds the child's
        if let Some(parent) = cell.parent.and_then(|id| self.tree.cell(id)) {
            match parent.state() {
                ContainerState::Stopped => {
                    if cell.state() != ContainerState::Stopped {
                        let mut guard = self
                            .tree
                            .acquire(cell, false, true)
                            .ok();
                        if let Some(guard) = guard.as_mut() {
                            let _ = self.stop_locked(cell, guard, 0);
                        }
                    }
                }
                ContainerState::Dead => {
                    if !matches!(
                        cell.state(),
                        ContainerState::Dead | ContainerState::Stopped
                    ) {
                        self.reap(cell, false);
                    }
                }
                ContainerState::Paused => {
                    if matches!(
                        cell.state(),
                        ContainerState::Running | ContainerState::Meta
                    ) {
                        self.set_state(cell, ContainerState::Paused);
                    }
                }
                _ => {}
            }
        }
    }

    fn sync_cgroups(&self, cell: &Arc<ContainerCell>) -> Result<()> {
        let controllers = cell.read().controllers;
        if !controllers.contains(Controller::Freezer) {
            return Err(ArborError::not_supported("cannot sync cgroups without freezer"));
        }
        let freezer_cg = self.get_cgroup(cell, Controller::Freezer)?;
        if !freezer_cg.exists() {
            return Ok(());
        }
        for controller in controllers.iter() {
            if controller == Controller::Freezer {
                continue;
            }
            let cg = self.get_cgroup(cell, controller)?;
            if cg.exists() {
                cg.attach_all(&freezer_cg)?;
            }
        }
        Ok(())
    }

    /// Handles one event from the loop. Containers locked by concurrent
    /// requests get their event requeued.
    pub fn dispatch_event(self: &Arc<Self>, event: Event) {
        match event {
            Event::Oom(id) => {
                let Some(cell) = self.tree.cell(id) else { return };
                match self.tree.try_lock_write(&cell) {
                    Ok(_guard) => {
                        if self.recv_oom_events(&cell) && cell.read().oom_is_fatal {
                            self.exit(&cell, signal_status(libc::SIGKILL), true);
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Busy => {
                        self.events.push_after(Duration::from_millis(50), Event::Oom(id));
                    }
                    Err(_) => {}
                }
            }
            Event::Exit { pid, status } | Event::ChildExit { pid, status } => {
                let Some(cell) = self.tree.find_by_pid(pid) else {
                    tracing::debug!(pid, status, "exit of an unknown task");
                    return;
                };
                match self.tree.try_lock_write(&cell) {
                    Ok(_guard) => {
                        let matched = {
                            let data = cell.read();
                            data.wait_pid == Some(pid) || data.seize_pid == Some(pid)
                        };
                        if matched {
                            self.exit(&cell, status, false);
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Busy => {
                        self.events
                            .push_after(Duration::from_millis(50), Event::Exit { pid, status });
                    }
                    Err(_) => {}
                }
            }
            Event::Respawn(id) => {
                let Some(cell) = self.tree.cell(id) else { return };
                match self.tree.try_lock_write(&cell) {
                    Ok(mut guard) => {
                        if let Err(e) = self.respawn_locked(&cell, &mut guard) {
                            tracing::warn!(name = %cell.name, error = %e, "respawn failed");
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Busy => {
                        self.events
                            .push_after(Duration::from_millis(50), Event::Respawn(id));
                    }
                    Err(_) => {}
                }
            }
            Event::MetaExit(id) => {
                let Some(cell) = self.tree.cell(id) else { return };
                if cell.is_root() {
                    return;
                }
                match self.tree.try_lock_write(&cell) {
                    Ok(_guard) => {
                        let (starting, running) = self.tree.child_counters(cell.id);
                        if cell.state() == ContainerState::Meta && starting == 0 && running == 0 {
                            self.reap(&cell, false);
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Busy => {
                        self.events
                            .push_after(Duration::from_millis(50), Event::MetaExit(id));
                    }
                    Err(_) => {}
                }
            }
            Event::DestroyAged(id) => {
                let Some(cell) = self.tree.cell(id) else { return };
                let expired = {
                    let data = cell.read();
                    cell.state() == ContainerState::Dead
                        && data
                            .death_time_ms
                            .is_some_and(|death| Self::now_ms() >= death + data.aging_time_ms)
                };
                if !expired {
                    return;
                }
                match self.tree.try_lock_write(&cell) {
                    Ok(mut guard) => {
                        tracing::info!(name = %cell.name, "destroying aged container");
                        Statistics::inc(&self.stats.removed_dead);
                        if let Err(e) = self.destroy_locked(&cell, &mut guard) {
                            tracing::warn!(name = %cell.name, error = %e, "aged destroy failed");
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Busy => {
                        self.events
                            .push_after(Duration::from_millis(50), Event::DestroyAged(id));
                    }
                    Err(_) => {}
                }
            }
            Event::DestroyWeak(id) => {
                let Some(cell) = self.tree.cell(id) else { return };
                if !cell.read().is_weak {
                    return;
                }
                match self.tree.try_lock_write(&cell) {
                    Ok(mut guard) => {
                        if let Err(e) = self.destroy_locked(&cell, &mut guard) {
                            tracing::warn!(name = %cell.name, error = %e, "weak destroy failed");
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Busy => {
                        self.events
                            .push_after(Duration::from_millis(50), Event::DestroyWeak(id));
                    }
                    Err(_) => {}
                }
            }
            Event::WaitTimeout(waiter) => {
                if let Some(waiter) = waiter.upgrade() {
                    waiter.wake_timeout();
                }
            }
            Event::RotateLogs => {
                let limit = self.config.container.stdio_limit;
                for ct in self.tree.subtree_children_first(self.root().id) {
                    match ct.state() {
                        ContainerState::Dead => {
                            let data = ct.read();
                            if data
                                .death_time_ms
                                .is_some_and(|death| Self::now_ms() >= death + data.aging_time_ms)
                            {
                                self.events.push(Event::DestroyAged(ct.id));
                            }
                        }
                        ContainerState::Running => {
                            let dir = ct.work_dir(&self.config);
                            for path in [stdio::stdout_path(&dir), stdio::stderr_path(&dir)] {
                                if let Err(e) = stdio::rotate(&path, limit) {
                                    tracing::warn!(name = %ct.name, error = %e, "rotation failed");
                                }
                            }
                        }
                        _ => {}
                    }
                }
                self.events.push_after(
                    Duration::from_millis(self.config.daemon.log_rotate_ms),
                    Event::RotateLogs,
                );
            }
        }
    }

    /// Runs the event loop until `shutdown` flips. Call from a dedicated
    /// thread.
    pub fn run_event_loop(self: &Arc<Self>, shutdown: &AtomicBool) {
        self.events.push_after(
            Duration::from_millis(self.config.daemon.log_rotate_ms),
            Event::RotateLogs,
        );
        while !shutdown.load(Ordering::SeqCst) {
            if let Some(event) = self.events.wait_next(Duration::from_millis(500)) {
                self.dispatch_event(event);
            }
        }
        tracing::info!("event loop drained");
    }

    /// Resolves containers matching a pattern list for `List` requests.
    #[must_use]
    pub fn list_matching(&self, patterns: &[String]) -> Vec<String> {
        let names = self.tree.names();
        if patterns.is_empty() {
            return names;
        }
        names
            .into_iter()
            .filter(|name| patterns.iter().any(|p| p == name || glob_match(p, name)))
            .collect()
    }
}
