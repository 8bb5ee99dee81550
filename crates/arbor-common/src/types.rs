//! Domain primitive types used across the arbor workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::CPU_POWER_PER_SEC;
use crate::error::{ArborError, Result};

/// Numeric container identifier, dense in `1..=4095`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CtId(pub u32);

impl fmt::Display for CtId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CT{}", self.0)
    }
}

/// Lifecycle state of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerState {
    /// No task, no cgroups, nothing but configuration.
    Stopped,
    /// Start is in flight.
    Starting,
    /// Main task is alive.
    Running,
    /// No main task of its own; lives while children do.
    Meta,
    /// Stop is in flight.
    Stopping,
    /// Frozen by the freezer controller.
    Paused,
    /// Task exited; exit status and cgroups are retained.
    Dead,
    /// Unregistered; terminal state stale handles observe.
    Destroyed,
}

impl ContainerState {
    /// True for the short-lived states waiters are not told about.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Starting | Self::Stopping)
    }

    /// True while the container participates in its parent's liveness,
    /// i.e. ancestors must stay alive too.
    #[must_use]
    pub fn is_alive(self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running | Self::Meta | Self::Stopping | Self::Paused
        )
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Meta => "meta",
            Self::Stopping => "stopping",
            Self::Paused => "paused",
            Self::Dead => "dead",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

impl FromStr for ContainerState {
    type Err = ArborError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stopped" => Ok(Self::Stopped),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "meta" => Ok(Self::Meta),
            "stopping" => Ok(Self::Stopping),
            "paused" => Ok(Self::Paused),
            "dead" => Ok(Self::Dead),
            "destroyed" => Ok(Self::Destroyed),
            other => Err(ArborError::invalid_value(format!(
                "unknown container state: {other}"
            ))),
        }
    }
}

/// Virtualization mode of a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VirtMode {
    /// Ordinary application container.
    #[default]
    App,
    /// Runs an init-like command as pid 1 of its own pid namespace.
    Os,
    /// Grouping node only; no task of its own.
    Job,
}

impl fmt::Display for VirtMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::App => "app",
            Self::Os => "os",
            Self::Job => "job",
        };
        f.write_str(name)
    }
}

impl FromStr for VirtMode {
    type Err = ArborError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "app" => Ok(Self::App),
            "os" => Ok(Self::Os),
            "job" => Ok(Self::Job),
            other => Err(ArborError::invalid_value(format!(
                "unknown virt mode: {other}"
            ))),
        }
    }
}

/// Kernel scheduling class requested for the container's tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuPolicy {
    /// SCHED_OTHER with neutral nice.
    #[default]
    Normal,
    /// SCHED_IDLE.
    Idle,
    /// SCHED_BATCH.
    Batch,
    /// SCHED_OTHER with boosted nice.
    High,
    /// SCHED_RR real-time.
    Rt,
    /// SCHED_ISO where the kernel offers it.
    Iso,
}

impl fmt::Display for CpuPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "normal",
            Self::Idle => "idle",
            Self::Batch => "batch",
            Self::High => "high",
            Self::Rt => "rt",
            Self::Iso => "iso",
        };
        f.write_str(name)
    }
}

impl FromStr for CpuPolicy {
    type Err = ArborError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "normal" => Ok(Self::Normal),
            "idle" => Ok(Self::Idle),
            "batch" => Ok(Self::Batch),
            "high" => Ok(Self::High),
            "rt" => Ok(Self::Rt),
            "iso" => Ok(Self::Iso),
            other => Err(ArborError::invalid_value(format!(
                "unknown cpu policy: {other}"
            ))),
        }
    }
}

/// How a container acquires its CPU set from the parent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuSetSpec {
    /// Adopt whatever the parent has left vacant.
    #[default]
    Inherit,
    /// Pin to an explicit cpu list.
    Absolute(String),
    /// Pin to one NUMA node's cpus.
    Node(u32),
    /// Claim N whole physical cores.
    Cores(u32),
    /// Claim N hardware threads.
    Threads(u32),
    /// Remove N threads from parent vacancy but keep the full affinity.
    Reserve(u32),
}

impl fmt::Display for CpuSetSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inherit => Ok(()),
            Self::Absolute(list) => f.write_str(list),
            Self::Node(n) => write!(f, "node {n}"),
            Self::Cores(n) => write!(f, "cores {n}"),
            Self::Threads(n) => write!(f, "threads {n}"),
            Self::Reserve(n) => write!(f, "reserve {n}"),
        }
    }
}

impl FromStr for CpuSetSpec {
    type Err = ArborError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s == "all" || s == "inherit" {
            return Ok(Self::Inherit);
        }
        if let Some((word, arg)) = s.split_once(char::is_whitespace) {
            let arg: u32 = arg.trim().parse().map_err(|_| {
                ArborError::invalid_value(format!("invalid cpu_set argument: {arg}"))
            })?;
            return match word {
                "node" => Ok(Self::Node(arg)),
                "cores" => Ok(Self::Cores(arg)),
                "threads" => Ok(Self::Threads(arg)),
                "reserve" => Ok(Self::Reserve(arg)),
                other => Err(ArborError::invalid_value(format!(
                    "unknown cpu_set policy: {other}"
                ))),
            };
        }
        Ok(Self::Absolute(s.to_string()))
    }
}

/// Numeric owner credentials attached to a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cred {
    /// User id.
    pub uid: u32,
    /// Group id.
    pub gid: u32,
}

impl Cred {
    /// Creates credentials from raw ids.
    #[must_use]
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }

    /// Whether these credentials are the superuser.
    #[must_use]
    pub fn is_root(self) -> bool {
        self.uid == 0
    }
}

/// Parses a byte size with optional binary suffix (`K`, `M`, `G`, `T`,
/// also accepting `Ki`/`KiB` spellings). A bare number is bytes; `0` and
/// the empty string mean unlimited.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (num, suffix) = s.split_at(digits_end);
    let value: u64 = num
        .parse()
        .map_err(|_| ArborError::invalid_value(format!("invalid size: {s}")))?;
    let mult = match suffix.trim().trim_end_matches(['i', 'B']) {
        "" => 1,
        "K" | "k" => 1u64 << 10,
        "M" | "m" => 1u64 << 20,
        "G" | "g" => 1u64 << 30,
        "T" | "t" => 1u64 << 40,
        other => {
            return Err(ArborError::invalid_value(format!(
                "invalid size suffix: {other}"
            )))
        }
    };
    value
        .checked_mul(mult)
        .ok_or_else(|| ArborError::invalid_value(format!("size overflow: {s}")))
}

/// Formats a byte size back into the shortest exact suffix form.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const UNITS: [(u64, &str); 4] = [
        (1u64 << 40, "T"),
        (1u64 << 30, "G"),
        (1u64 << 20, "M"),
        (1u64 << 10, "K"),
    ];
    for (mult, suffix) in UNITS {
        if bytes >= mult && bytes % mult == 0 {
            return format!("{}{suffix}", bytes / mult);
        }
    }
    bytes.to_string()
}

/// Parses a cpu power value: `Nc` is N cores, `N%` is N percent of one
/// core, a bare number is cores. Fractions are accepted; `0` or the empty
/// string mean unlimited. One full core equals [`CPU_POWER_PER_SEC`].
pub fn parse_cpu_power(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }
    let (num, scale) = if let Some(num) = s.strip_suffix('c') {
        (num, 1.0)
    } else if let Some(num) = s.strip_suffix('%') {
        (num, 0.01)
    } else {
        (s, 1.0)
    };
    let value: f64 = num
        .trim()
        .parse()
        .map_err(|_| ArborError::invalid_value(format!("invalid cpu value: {s}")))?;
    if !(0.0..=4096.0).contains(&value) {
        return Err(ArborError::invalid_value(format!(
            "cpu value out of range: {s}"
        )));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok((value * scale * CPU_POWER_PER_SEC as f64).round() as u64)
}

/// Formats a cpu power value as cores with a `c` suffix.
#[must_use]
pub fn format_cpu_power(power: u64) -> String {
    if power == 0 {
        return "0".to_string();
    }
    if power % CPU_POWER_PER_SEC == 0 {
        return format!("{}c", power / CPU_POWER_PER_SEC);
    }
    #[allow(clippy::cast_precision_loss)]
    let cores = power as f64 / CPU_POWER_PER_SEC as f64;
    format!("{cores}c")
}

/// Parses a boolean property value.
pub fn parse_bool(s: &str) -> Result<bool> {
    match s.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ArborError::invalid_value(format!(
            "invalid boolean value: {other}"
        ))),
    }
}

/// Renders a raw `wait(2)` status the way humans read it.
#[must_use]
pub fn format_exit_status(status: i32) -> String {
    if status & 0x7f != 0 {
        let sig = status & 0x7f;
        if status & 0x80 != 0 {
            format!("killed by signal {sig} (core dumped)")
        } else {
            format!("killed by signal {sig}")
        }
    } else {
        format!("exited with code {}", (status >> 8) & 0xff)
    }
}

/// Builds a raw `wait(2)` status from a termination signal number.
#[must_use]
pub fn signal_status(sig: i32) -> i32 {
    sig & 0x7f
}

/// Builds a raw `wait(2)` status from an exit code.
#[must_use]
pub fn exit_code_status(code: i32) -> i32 {
    (code & 0xff) << 8
}
