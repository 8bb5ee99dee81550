//! Pids controller: task count limits.

use arbor_common::error::Result;

use super::Cgroup;

/// Sets the task limit; `0` means unlimited.
///
/// # Errors
///
/// Returns an error if the knob write fails.
pub fn set_limit(cg: &Cgroup, limit: u64) -> Result<()> {
    if limit == 0 {
        cg.set_knob("pids.max", "max")
    } else {
        cg.set_knob_u64("pids.max", limit)
    }
}

/// Reads the current task count.
///
/// # Errors
///
/// Returns an error if the knob cannot be read.
pub fn get_usage(cg: &Cgroup) -> Result<u64> {
    cg.get_knob_u64("pids.current")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::{CgroupDriver, Controller};

    #[test]
    fn limit_and_usage() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("pids")).expect("mkdir");
        let driver = CgroupDriver::probe(dir.path(), "arbord");
        let cg = driver.named(Controller::Pids, "arbord%a").expect("cgroup");
        cg.create().expect("create");

        set_limit(&cg, 0).expect("set");
        assert_eq!(cg.get_knob("pids.max").expect("read"), "max");
        set_limit(&cg, 100).expect("set");
        assert_eq!(cg.get_knob_u64("pids.max").expect("read"), 100);

        cg.set_knob("pids.current", "7").expect("seed");
        assert_eq!(get_usage(&cg).expect("usage"), 7);
    }
}
