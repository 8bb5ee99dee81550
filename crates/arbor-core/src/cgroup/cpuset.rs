//! Cpuset controller: cpu and memory node placement.

use arbor_common::cpumask::CpuMask;
use arbor_common::error::{ArborError, Result};

use super::Cgroup;

/// Writes the cpu placement mask.
///
/// # Errors
///
/// Returns an error if the knob write fails or the mask is empty.
pub fn set_cpus(cg: &Cgroup, cpus: &CpuMask) -> Result<()> {
    if cpus.is_empty() {
        return Err(ArborError::invalid_value(format!("{cg}: empty cpu set")));
    }
    cg.set_knob("cpuset.cpus", &cpus.to_string())
}

/// Writes the memory node placement; an empty string inherits the parent
/// directory's nodes.
///
/// # Errors
///
/// Returns an error if the parent nodes cannot be read or the write fails.
pub fn set_mems(cg: &Cgroup, mems: &str) -> Result<()> {
    if !mems.is_empty() {
        return cg.set_knob("cpuset.mems", mems);
    }
    let parent = cg
        .path()
        .parent()
        .map(|p| p.join("cpuset.mems"))
        .filter(|p| p.is_file());
    let Some(parent) = parent else {
        return Ok(());
    };
    let inherited =
        std::fs::read_to_string(&parent).map_err(|e| ArborError::io(&parent, &e))?;
    let inherited = inherited.trim();
    if inherited.is_empty() {
        return Ok(());
    }
    cg.set_knob("cpuset.mems", inherited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::{CgroupDriver, Controller};

    #[test]
    fn cpus_write_and_empty_rejection() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("cpuset")).expect("mkdir");
        let driver = CgroupDriver::probe(dir.path(), "arbord");
        let cg = driver.named(Controller::Cpuset, "arbord%a").expect("cgroup");
        cg.create().expect("create");

        set_cpus(&cg, &"0-3".parse().expect("mask")).expect("set");
        assert_eq!(cg.get_knob("cpuset.cpus").expect("read"), "0-3");
        assert!(set_cpus(&cg, &CpuMask::new()).is_err());
    }

    #[test]
    fn mems_inherit_from_parent_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("cpuset")).expect("mkdir");
        std::fs::write(dir.path().join("cpuset/cpuset.mems"), "0-1\n").expect("seed");
        let driver = CgroupDriver::probe(dir.path(), "arbord");
        let cg = driver.named(Controller::Cpuset, "arbord%a").expect("cgroup");
        cg.create().expect("create");

        set_mems(&cg, "").expect("inherit");
        assert_eq!(cg.get_knob("cpuset.mems").expect("read"), "0-1");
    }
}
