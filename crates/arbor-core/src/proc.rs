//! Per-task knobs and `/proc` queries.
//!
//! The lifecycle engine pushes scheduler class, io priority and rlimits
//! onto every task of a container, and inspects task liveness during state
//! reconciliation. Tasks can exit at any moment, so `ESRCH` is treated as
//! success by the callers' retry loops, not here.

use std::path::Path;

use arbor_common::error::{ArborError, Result};
use arbor_common::types::CpuPolicy;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Kernel scheduling parameters derived from a cpu policy and weight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedParams {
    /// `SCHED_*` class constant.
    pub policy: i32,
    /// Realtime priority, only meaningful for `SCHED_RR`.
    pub priority: i32,
    /// Nice value for the fair classes.
    pub nice: i32,
}

impl SchedParams {
    /// Picks the kernel scheduler class for a container policy.
    ///
    /// Weight shifts nice for the fair classes (every doubling is worth
    /// roughly one rt priority step or a couple of nice steps).
    #[must_use]
    pub fn choose(policy: CpuPolicy, weight: u64) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let weight_boost = (f64::from(u32::try_from(weight.max(1)).unwrap_or(u32::MAX)))
            .log2()
            .round() as i32;
        match policy {
            CpuPolicy::Rt => Self {
                policy: libc::SCHED_RR,
                priority: (10 + weight_boost).clamp(1, 99),
                nice: -10,
            },
            CpuPolicy::High => Self {
                policy: libc::SCHED_OTHER,
                priority: 0,
                nice: (-10 - weight_boost).clamp(-20, 19),
            },
            CpuPolicy::Batch => Self {
                policy: libc::SCHED_BATCH,
                priority: 0,
                nice: 0,
            },
            CpuPolicy::Idle => Self {
                policy: libc::SCHED_IDLE,
                priority: 0,
                nice: 0,
            },
            CpuPolicy::Iso => Self {
                // SCHED_ISO where patched kernels offer it
                policy: 4,
                priority: 0,
                nice: -10,
            },
            CpuPolicy::Normal => Self {
                policy: libc::SCHED_OTHER,
                priority: 0,
                nice: (7 - weight_boost).clamp(-20, 19).min(0),
            },
        }
    }
}

/// Applies scheduler class and nice value to one task.
///
/// # Errors
///
/// Returns an error (with errno) when the kernel refuses; `ESRCH` is
/// surfaced like any other errno.
pub fn set_scheduler(pid: i32, params: SchedParams) -> Result<()> {
    // SAFETY: plain syscalls on a pid; no memory is shared with the kernel
    // beyond the param struct below.
    unsafe {
        if libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, params.nice) != 0 {
            return Err(ArborError::system(format!("setpriority({pid})")));
        }
        let sched = libc::sched_param {
            sched_priority: params.priority,
        };
        if libc::sched_setscheduler(pid, params.policy, &sched) != 0 {
            return Err(ArborError::system(format!("sched_setscheduler({pid})")));
        }
    }
    Ok(())
}

/// Applies a best-effort io priority level (0 highest, 7 lowest).
///
/// # Errors
///
/// Returns an error when the syscall fails.
pub fn set_io_prio(pid: i32, level: u8) -> Result<()> {
    const IOPRIO_WHO_PROCESS: libc::c_int = 1;
    const IOPRIO_CLASS_BE: libc::c_int = 2;
    let prio = (IOPRIO_CLASS_BE << 13) | libc::c_int::from(level.min(7));
    // SAFETY: ioprio_set takes three scalar arguments.
    let rc = unsafe { libc::syscall(libc::SYS_ioprio_set, IOPRIO_WHO_PROCESS, pid, prio) };
    if rc != 0 {
        return Err(ArborError::system(format!("ioprio_set({pid})")));
    }
    Ok(())
}

/// Kernel rlimit resource identifier.
pub type RlimitResource = libc::__rlimit_resource_t;

/// Sets one rlimit on a running task via `prlimit(2)`.
///
/// # Errors
///
/// Returns an error when the syscall fails.
pub fn set_rlimit(pid: i32, resource: RlimitResource, soft: u64, hard: u64) -> Result<()> {
    let lim = libc::rlimit {
        rlim_cur: soft,
        rlim_max: hard,
    };
    // SAFETY: prlimit reads the new limit struct and writes nothing back
    // when the old-limit pointer is null.
    let rc = unsafe { libc::prlimit(pid, resource, &lim, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(ArborError::system(format!("prlimit({pid})")));
    }
    Ok(())
}

/// Maps an rlimit name (`nofile`, `memlock`, ...) to its constant.
///
/// # Errors
///
/// Fails with `InvalidValue` for unknown names.
pub fn rlimit_by_name(name: &str) -> Result<RlimitResource> {
    let res = match name {
        "as" => libc::RLIMIT_AS,
        "core" => libc::RLIMIT_CORE,
        "cpu" => libc::RLIMIT_CPU,
        "data" => libc::RLIMIT_DATA,
        "fsize" => libc::RLIMIT_FSIZE,
        "locks" => libc::RLIMIT_LOCKS,
        "memlock" => libc::RLIMIT_MEMLOCK,
        "msgqueue" => libc::RLIMIT_MSGQUEUE,
        "nice" => libc::RLIMIT_NICE,
        "nofile" => libc::RLIMIT_NOFILE,
        "nproc" => libc::RLIMIT_NPROC,
        "rss" => libc::RLIMIT_RSS,
        "rtprio" => libc::RLIMIT_RTPRIO,
        "sigpending" => libc::RLIMIT_SIGPENDING,
        "stack" => libc::RLIMIT_STACK,
        other => {
            return Err(ArborError::invalid_value(format!(
                "unknown ulimit resource: {other}"
            )))
        }
    };
    Ok(res)
}

/// Whether the task still exists.
#[must_use]
pub fn alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Whether the task is a zombie, judged from `/proc/<pid>/stat`.
#[must_use]
pub fn is_zombie(pid: i32) -> bool {
    stat_field(pid, 2).is_some_and(|state| state == "Z")
}

/// Parent pid of a task, or `None` when it is gone.
#[must_use]
pub fn ppid(pid: i32) -> Option<i32> {
    stat_field(pid, 3).and_then(|f| f.parse().ok())
}

/// Command name of a task.
#[must_use]
pub fn task_name(pid: i32) -> Option<String> {
    std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .ok()
        .map(|s| s.trim().to_string())
}

/// Signal mask the task has handlers installed for, from `SigCgt`.
#[must_use]
pub fn handled_signals(pid: i32) -> u64 {
    let Ok(status) = std::fs::read_to_string(format!("/proc/{pid}/status")) else {
        return 0;
    };
    for line in status.lines() {
        if let Some(hex) = line.strip_prefix("SigCgt:") {
            return u64::from_str_radix(hex.trim(), 16).unwrap_or(0);
        }
    }
    0
}

/// Whether a task has a handler installed for the signal.
#[must_use]
pub fn handles_signal(pid: i32, sig: Signal) -> bool {
    let bit = sig as i32 - 1;
    handled_signals(pid) & (1 << bit) != 0
}

fn stat_field(pid: i32, index: usize) -> Option<String> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // the comm field is parenthesized and may contain spaces
    let rest = stat.rsplit_once(')').map(|(_, rest)| rest)?;
    if index < 2 {
        return None;
    }
    rest.split_whitespace().nth(index - 2).map(str::to_string)
}

/// Total host memory in bytes, from `MemTotal` in meminfo.
///
/// # Errors
///
/// Returns an error if meminfo is unreadable or malformed.
pub fn host_memory(proc_root: &Path) -> Result<u64> {
    let path = proc_root.join("meminfo");
    let raw = std::fs::read_to_string(&path).map_err(|e| ArborError::io(&path, &e))?;
    for line in raw.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            let kib: u64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .map_err(|_| ArborError::invalid_value(format!("bad meminfo line: {line}")))?;
            return Ok(kib * 1024);
        }
    }
    Err(ArborError::invalid_value("meminfo has no MemTotal"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sched_params_for_policies() {
        let rt = SchedParams::choose(CpuPolicy::Rt, 100);
        assert_eq!(rt.policy, libc::SCHED_RR);
        assert!(rt.priority >= 1);

        let idle = SchedParams::choose(CpuPolicy::Idle, 100);
        assert_eq!(idle.policy, libc::SCHED_IDLE);

        let high = SchedParams::choose(CpuPolicy::High, 100);
        assert!(high.nice < 0);
    }

    #[test]
    fn rlimit_names() {
        assert!(rlimit_by_name("nofile").is_ok());
        assert!(rlimit_by_name("memlock").is_ok());
        assert!(rlimit_by_name("sandwiches").is_err());
    }

    #[test]
    fn own_task_is_alive_and_not_zombie() {
        let pid = std::process::id() as i32;
        assert!(alive(pid));
        assert!(!is_zombie(pid));
        assert!(ppid(pid).is_some());
    }

    #[test]
    fn host_memory_from_fixture() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("meminfo"),
            "MemTotal:       16384 kB\nMemFree:        1024 kB\n",
        )
        .expect("seed");
        assert_eq!(host_memory(dir.path()).expect("read"), 16384 * 1024);
    }
}
