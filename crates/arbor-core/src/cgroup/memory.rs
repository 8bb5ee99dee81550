//! Memory controller knobs.

use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use arbor_common::error::{ArborError, Result};

use super::Cgroup;

/// Sets the hard memory limit; `0` means unlimited.
///
/// The kernel refuses a limit below current usage with `EBUSY`, which is
/// reported to the caller as an invalid value.
///
/// # Errors
///
/// Returns an error if the knob write fails.
pub fn set_limit(cg: &Cgroup, bytes: u64) -> Result<()> {
    let value = if bytes == 0 { "-1".to_string() } else { bytes.to_string() };
    cg.set_knob("memory.limit_in_bytes", &value).map_err(|e| {
        if e.errno() == Some(libc::EBUSY) {
            ArborError::invalid_value(format!("limit too low: {bytes}")).with_errno(libc::EBUSY)
        } else {
            e
        }
    })
}

/// Sets the soft limit; negative means unlimited.
///
/// # Errors
///
/// Returns an error if the knob write fails.
pub fn set_soft_limit(cg: &Cgroup, bytes: i64) -> Result<()> {
    cg.set_knob("memory.soft_limit_in_bytes", &bytes.to_string())
}

/// Sets the memory guarantee, where the kernel offers the knob.
///
/// # Errors
///
/// Returns an error if the knob write fails.
pub fn set_guarantee(cg: &Cgroup, bytes: u64) -> Result<()> {
    if !cg.has_knob("memory.guarantee") {
        tracing::debug!(cg = %cg, "kernel has no memory guarantee knob");
        return Ok(());
    }
    cg.set_knob_u64("memory.guarantee", bytes)
}

/// Sets the anonymous memory limit, where the kernel offers the knob.
///
/// # Errors
///
/// Returns an error if the knob write fails.
pub fn set_anon_limit(cg: &Cgroup, bytes: u64) -> Result<()> {
    if !cg.has_knob("memory.anon.limit") {
        return Ok(());
    }
    let value = if bytes == 0 { "-1".to_string() } else { bytes.to_string() };
    cg.set_knob("memory.anon.limit", &value)
}

/// Sets the dirty page limit, where the kernel offers the knob.
///
/// # Errors
///
/// Returns an error if the knob write fails.
pub fn set_dirty_limit(cg: &Cgroup, bytes: u64) -> Result<()> {
    if !cg.has_knob("memory.dirty_limit_in_bytes") {
        return Ok(());
    }
    cg.set_knob_u64("memory.dirty_limit_in_bytes", bytes)
}

/// Sets the filesystem bandwidth throttle, where the kernel offers it.
///
/// # Errors
///
/// Returns an error if the knob write fails.
pub fn set_fs_bps_limit(cg: &Cgroup, bytes_per_sec: u64) -> Result<()> {
    if !cg.has_knob("memory.fs_bps_limit") {
        return Ok(());
    }
    cg.set_knob_u64("memory.fs_bps_limit", bytes_per_sec)
}

/// Sets the filesystem iops throttle, where the kernel offers it.
///
/// # Errors
///
/// Returns an error if the knob write fails.
pub fn set_fs_iops_limit(cg: &Cgroup, iops: u64) -> Result<()> {
    if !cg.has_knob("memory.fs_iops_limit") {
        return Ok(());
    }
    cg.set_knob_u64("memory.fs_iops_limit", iops)
}

/// Turns on hierarchical accounting for the cgroup.
///
/// # Errors
///
/// Returns an error if the knob write fails.
pub fn use_hierarchy(cg: &Cgroup) -> Result<()> {
    cg.set_knob("memory.use_hierarchy", "1")
}

/// Reads the OOM kill counter from `memory.oom_control`.
///
/// # Errors
///
/// Returns an error if the knob cannot be read.
pub fn get_oom_events(cg: &Cgroup) -> Result<u64> {
    let raw = cg.get_knob("memory.oom_control")?;
    for line in raw.lines() {
        if let Some(value) = line.strip_prefix("oom_kill ") {
            return value
                .trim()
                .parse()
                .map_err(|_| ArborError::invalid_value(format!("bad oom_control line: {line}")));
        }
    }
    Ok(0)
}

/// Wires an eventfd to the cgroup's OOM notifications through
/// `cgroup.event_control` and returns it as a nonblocking [`File`].
/// Returns `None` when the kernel exposes no `memory.oom_control`.
///
/// # Errors
///
/// Returns an error if the eventfd cannot be created or registered.
pub fn setup_oom_event(cg: &Cgroup) -> Result<Option<File>> {
    if !cg.has_knob("memory.oom_control") {
        tracing::debug!(cg = %cg, "kernel offers no oom_control");
        return Ok(None);
    }
    let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if raw < 0 {
        return Err(ArborError::system("eventfd"));
    }
    // SAFETY: eventfd just returned this descriptor and nothing else owns it.
    let event_fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let control_path = cg.path().join("memory.oom_control");
    let control = File::open(&control_path).map_err(|e| ArborError::io(&control_path, &e))?;

    let request = format!("{} {}", event_fd.as_raw_fd(), control.as_raw_fd());
    cg.set_knob("cgroup.event_control", &request)?;

    tracing::debug!(cg = %cg, "oom event armed");
    Ok(Some(File::from(event_fd)))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::cgroup::{CgroupDriver, Controller};

    fn memory_cg(dir: &Path) -> Cgroup {
        std::fs::create_dir_all(dir.join("memory")).expect("mkdir");
        let driver = CgroupDriver::probe(dir, "arbord");
        let cg = driver.named(Controller::Memory, "arbord%a").expect("cgroup");
        cg.create().expect("create");
        cg
    }

    #[test]
    fn zero_limit_writes_unlimited() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cg = memory_cg(dir.path());
        set_limit(&cg, 0).expect("set");
        assert_eq!(cg.get_knob("memory.limit_in_bytes").expect("read"), "-1");
        set_limit(&cg, 4096).expect("set");
        assert_eq!(cg.get_knob("memory.limit_in_bytes").expect("read"), "4096");
    }

    #[test]
    fn guarantee_without_knob_is_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cg = memory_cg(dir.path());
        set_guarantee(&cg, 1 << 30).expect("skip");
        assert!(!cg.has_knob("memory.guarantee"));
        cg.set_knob("memory.guarantee", "0").expect("seed");
        set_guarantee(&cg, 1 << 30).expect("set");
        assert_eq!(cg.get_knob_u64("memory.guarantee").expect("read"), 1 << 30);
    }

    #[test]
    fn oom_counter_parsing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cg = memory_cg(dir.path());
        cg.set_knob(
            "memory.oom_control",
            "oom_kill_disable 0\nunder_oom 0\noom_kill 3\n",
        )
        .expect("seed");
        assert_eq!(get_oom_events(&cg).expect("read"), 3);
    }
}
