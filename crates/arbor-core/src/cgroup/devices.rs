//! Devices controller: device node access policy.

use arbor_common::error::Result;

use super::Cgroup;

/// Applies a device policy: deny everything, then allow each listed rule
/// (`c 1:3 rwm` style lines).
///
/// # Errors
///
/// Returns an error if a knob write fails.
pub fn apply(cg: &Cgroup, allow: &[String]) -> Result<()> {
    cg.set_knob("devices.deny", "a")?;
    for rule in allow {
        cg.set_knob("devices.allow", rule)?;
    }
    Ok(())
}

/// Grants everything; used for the first-level copy of the root policy.
///
/// # Errors
///
/// Returns an error if the knob write fails.
pub fn allow_all(cg: &Cgroup) -> Result<()> {
    cg.set_knob("devices.allow", "a")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::{CgroupDriver, Controller};

    #[test]
    fn policy_denies_then_allows() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("devices")).expect("mkdir");
        let driver = CgroupDriver::probe(dir.path(), "arbord");
        let cg = driver.named(Controller::Devices, "arbord%a").expect("cgroup");
        cg.create().expect("create");

        apply(&cg, &["c 1:3 rwm".to_string()]).expect("apply");
        assert_eq!(cg.get_knob("devices.deny").expect("read"), "a");
        assert_eq!(cg.get_knob("devices.allow").expect("read"), "c 1:3 rwm");
    }
}
