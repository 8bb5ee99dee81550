//! Net_cls controller: packet classid tagging.

use arbor_common::error::Result;

use super::Cgroup;

/// Stamps the traffic class id on the cgroup.
///
/// # Errors
///
/// Returns an error if the knob write fails.
pub fn set_classid(cg: &Cgroup, classid: u32) -> Result<()> {
    cg.set_knob_u64("net_cls.classid", u64::from(classid))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::{CgroupDriver, Controller};

    #[test]
    fn classid_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("net_cls")).expect("mkdir");
        let driver = CgroupDriver::probe(dir.path(), "arbord");
        let cg = driver.named(Controller::NetCls, "arbord%a").expect("cgroup");
        cg.create().expect("create");
        set_classid(&cg, 0x0001_0002).expect("set");
        assert_eq!(cg.get_knob_u64("net_cls.classid").expect("read"), 0x0001_0002);
    }
}
