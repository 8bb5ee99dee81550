//! Cgroup-v1 resource management.
//!
//! Each controller is mounted as its own hierarchy under the cgroup root;
//! the driver probes which ones are present and hands out [`Cgroup`]
//! handles that read and write controller knobs. Container-to-path
//! derivation lives with the container tree; this layer only knows
//! controller-relative names.

pub mod blkio;
pub mod cpu;
pub mod cpuset;
pub mod devices;
pub mod freezer;
pub mod hugetlb;
pub mod memory;
pub mod netcls;
pub mod pids;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use arbor_common::error::{ArborError, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// One kernel cgroup controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Controller {
    /// `memory` — limits, guarantees, OOM control.
    Memory,
    /// `freezer` — suspend and resume task groups.
    Freezer,
    /// `cpu` — bandwidth and shares.
    Cpu,
    /// `cpuacct` — usage accounting.
    Cpuacct,
    /// `cpuset` — cpu and memory node placement.
    Cpuset,
    /// `blkio` — block io weights and throttles.
    Blkio,
    /// `devices` — device node access policy.
    Devices,
    /// `net_cls` — packet classid tagging.
    NetCls,
    /// `pids` — task count limit.
    Pids,
    /// `hugetlb` — huge page limits.
    Hugetlb,
    /// `systemd` — named hierarchy, no resource control.
    Systemd,
}

impl Controller {
    /// Every controller the driver knows about.
    pub const ALL: [Controller; 11] = [
        Controller::Memory,
        Controller::Freezer,
        Controller::Cpu,
        Controller::Cpuacct,
        Controller::Cpuset,
        Controller::Blkio,
        Controller::Devices,
        Controller::NetCls,
        Controller::Pids,
        Controller::Hugetlb,
        Controller::Systemd,
    ];

    /// The controller's mount directory name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Freezer => "freezer",
            Self::Cpu => "cpu",
            Self::Cpuacct => "cpuacct",
            Self::Cpuset => "cpuset",
            Self::Blkio => "blkio",
            Self::Devices => "devices",
            Self::NetCls => "net_cls",
            Self::Pids => "pids",
            Self::Hugetlb => "hugetlb",
            Self::Systemd => "systemd",
        }
    }

    fn bit(self) -> u16 {
        match self {
            Self::Memory => 1 << 0,
            Self::Freezer => 1 << 1,
            Self::Cpu => 1 << 2,
            Self::Cpuacct => 1 << 3,
            Self::Cpuset => 1 << 4,
            Self::Blkio => 1 << 5,
            Self::Devices => 1 << 6,
            Self::NetCls => 1 << 7,
            Self::Pids => 1 << 8,
            Self::Hugetlb => 1 << 9,
            Self::Systemd => 1 << 10,
        }
    }
}

impl fmt::Display for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Controller {
    type Err = ArborError;

    fn from_str(s: &str) -> Result<Self> {
        Controller::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ArborError::invalid_value(format!("unknown controller: {s}")))
    }
}

/// A set of controllers, used for enabled/required bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerSet(u16);

impl ControllerSet {
    /// The empty set.
    #[must_use]
    pub fn empty() -> Self {
        Self(0)
    }

    /// Membership test.
    #[must_use]
    pub fn contains(self, c: Controller) -> bool {
        self.0 & c.bit() != 0
    }

    /// True when every controller of `other` is in `self`.
    #[must_use]
    pub fn contains_all(self, other: ControllerSet) -> bool {
        self.0 & other.0 == other.0
    }

    /// Adds one controller.
    pub fn insert(&mut self, c: Controller) {
        self.0 |= c.bit();
    }

    /// Removes one controller.
    pub fn remove(&mut self, c: Controller) {
        self.0 &= !c.bit();
    }

    /// Union.
    #[must_use]
    pub fn with(self, other: ControllerSet) -> Self {
        Self(self.0 | other.0)
    }

    /// Set difference: members of `self` missing from `other`.
    #[must_use]
    pub fn missing_from(self, other: ControllerSet) -> Self {
        Self(self.0 & !other.0)
    }

    /// True when no controller is set.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Iterates members in declaration order.
    pub fn iter(self) -> impl Iterator<Item = Controller> {
        Controller::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl From<Controller> for ControllerSet {
    fn from(c: Controller) -> Self {
        Self(c.bit())
    }
}

impl FromIterator<Controller> for ControllerSet {
    fn from_iter<I: IntoIterator<Item = Controller>>(iter: I) -> Self {
        let mut set = Self::empty();
        for c in iter {
            set.insert(c);
        }
        set
    }
}

impl fmt::Display for ControllerSet {
    /// Formats as a semicolon-separated list: `memory; cpu`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for c in self.iter() {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            f.write_str(c.as_str())?;
        }
        Ok(())
    }
}

impl FromStr for ControllerSet {
    fn from_str(s: &str) -> Result<Self> {
        let mut set = Self::empty();
        for part in s.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            set.insert(part.parse()?);
        }
        Ok(set)
    }

    type Err = ArborError;
}

/// Driver over the mounted cgroup-v1 hierarchies.
#[derive(Debug)]
pub struct CgroupDriver {
    root: PathBuf,
    prefix: String,
    supported: ControllerSet,
}

impl CgroupDriver {
    /// Probes the cgroup root for mounted controller hierarchies.
    #[must_use]
    pub fn probe(root: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        let root = root.into();
        let supported = Controller::ALL
            .into_iter()
            .filter(|c| root.join(c.as_str()).is_dir())
            .collect();
        let driver = Self {
            root,
            prefix: prefix.into(),
            supported,
        };
        tracing::info!(root = %driver.root.display(), supported = %driver.supported, "cgroup driver probed");
        driver
    }

    /// The set of controllers present on this host.
    #[must_use]
    pub fn supported(&self) -> ControllerSet {
        self.supported
    }

    /// Daemon cgroup directory name placed under every controller root.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The controller's own root cgroup.
    ///
    /// # Errors
    ///
    /// Fails with `NotSupported` when the controller is not mounted.
    pub fn root_cgroup(&self, controller: Controller) -> Result<Cgroup> {
        self.named(controller, "")
    }

    /// A cgroup by controller-relative name (empty name is the root).
    ///
    /// # Errors
    ///
    /// Fails with `NotSupported` when the controller is not mounted.
    pub fn named(&self, controller: Controller, name: &str) -> Result<Cgroup> {
        if !self.supported.contains(controller) {
            return Err(ArborError::not_supported(format!(
                "cgroup controller {controller} is not available"
            )));
        }
        let mut path = self.root.join(controller.as_str());
        if !name.is_empty() {
            path.push(name);
        }
        Ok(Cgroup { controller, path })
    }
}

/// Handle to one cgroup directory in one controller hierarchy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cgroup {
    controller: Controller,
    path: PathBuf,
}

impl fmt::Display for Cgroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.controller, self.path.display())
    }
}

impl Cgroup {
    /// The controller this cgroup belongs to.
    #[must_use]
    pub fn controller(&self) -> Controller {
        self.controller
    }

    /// The cgroup directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the cgroup directory exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Creates the cgroup directory (and any missing owning ancestors).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create(&self) -> Result<()> {
        if self.exists() {
            return Ok(());
        }
        tracing::debug!(cg = %self, "create cgroup");
        std::fs::create_dir_all(&self.path).map_err(|e| ArborError::io(&self.path, &e))
    }

    /// Removes the cgroup directory, retrying briefly while the kernel
    /// still holds it busy.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory still cannot be removed.
    pub fn remove(&self) -> Result<()> {
        if !self.exists() {
            return Ok(());
        }
        tracing::debug!(cg = %self, "remove cgroup");
        let mut last = None;
        for _ in 0..10 {
            match std::fs::remove_dir(&self.path) {
                Ok(()) => return Ok(()),
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                    last = Some(e);
                    std::thread::sleep(Duration::from_millis(20));
                }
                Err(e) => return Err(ArborError::io(&self.path, &e)),
            }
        }
        match last {
            Some(e) => Err(ArborError::io(&self.path, &e)),
            None => Ok(()),
        }
    }

    /// Whether the knob file exists in this cgroup.
    #[must_use]
    pub fn has_knob(&self, key: &str) -> bool {
        self.path.join(key).is_file()
    }

    /// Reads a knob as a string, trailing newline stripped.
    ///
    /// # Errors
    ///
    /// Returns an error if the knob cannot be read.
    pub fn get_knob(&self, key: &str) -> Result<String> {
        let path = self.path.join(key);
        let raw = std::fs::read_to_string(&path).map_err(|e| ArborError::io(&path, &e))?;
        Ok(raw.trim_end_matches('\n').to_string())
    }

    /// Reads a knob as an unsigned integer.
    ///
    /// # Errors
    ///
    /// Returns an error if the knob cannot be read or parsed.
    pub fn get_knob_u64(&self, key: &str) -> Result<u64> {
        let value = self.get_knob(key)?;
        value
            .trim()
            .parse()
            .map_err(|_| ArborError::invalid_value(format!("{self} {key}: not a number: {value}")))
    }

    /// Writes a knob.
    ///
    /// # Errors
    ///
    /// Returns an error (with captured errno) if the write fails.
    pub fn set_knob(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path.join(key);
        tracing::trace!(cg = %self, key, value, "set knob");
        std::fs::write(&path, value).map_err(|e| ArborError::io(&path, &e))
    }

    /// Writes a numeric knob.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn set_knob_u64(&self, key: &str, value: u64) -> Result<()> {
        self.set_knob(key, &value.to_string())
    }

    /// Moves a single process into this cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if `cgroup.procs` cannot be written.
    pub fn attach(&self, pid: i32) -> Result<()> {
        self.set_knob("cgroup.procs", &pid.to_string())
    }

    /// Moves every task of `from` into this cgroup, repeating until the
    /// source stops producing new tasks.
    ///
    /// # Errors
    ///
    /// Returns an error if task enumeration or attach fails.
    pub fn attach_all(&self, from: &Cgroup) -> Result<()> {
        let mut prev: Vec<i32> = Vec::new();
        loop {
            let tasks = from.get_tasks()?;
            let mut moved = false;
            for pid in &tasks {
                if prev.contains(pid) {
                    continue;
                }
                match self.set_knob("tasks", &pid.to_string()) {
                    Ok(()) => moved = true,
                    // the task can die between enumeration and attach
                    Err(e) if e.errno() == Some(libc::ESRCH) => {}
                    Err(e) => return Err(e),
                }
            }
            if !moved {
                return Ok(());
            }
            prev = tasks;
        }
    }

    /// Lists task (thread) ids in this cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the `tasks` file cannot be read.
    pub fn get_tasks(&self) -> Result<Vec<i32>> {
        let raw = self.get_knob("tasks")?;
        Ok(raw.lines().filter_map(|l| l.trim().parse().ok()).collect())
    }

    /// Counts threads or processes in this cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing file cannot be read.
    pub fn count(&self, threads: bool) -> Result<u64> {
        let key = if threads { "tasks" } else { "cgroup.procs" };
        let raw = self.get_knob(key)?;
        Ok(raw.lines().filter(|l| !l.trim().is_empty()).count() as u64)
    }

    /// True when the cgroup holds no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.get_tasks().map(|t| t.is_empty()).unwrap_or(true)
    }

    /// Signals every task in the cgroup, repeating while new tasks appear.
    ///
    /// # Errors
    ///
    /// Returns an error if task enumeration fails.
    pub fn kill_all(&self, signal: Signal) -> Result<()> {
        tracing::debug!(cg = %self, sig = %signal, "kill all tasks");
        let mut prev: Vec<i32> = Vec::new();
        for _ in 0..100 {
            let tasks = self.get_tasks()?;
            let mut sent = false;
            for pid in &tasks {
                if prev.contains(pid) {
                    continue;
                }
                // exited tasks are expected here
                let _ = kill(Pid::from_raw(*pid), signal);
                sent = true;
            }
            if !sent {
                return Ok(());
            }
            prev = tasks;
        }
        tracing::warn!(cg = %self, "tasks keep spawning during kill");
        Ok(())
    }
}
