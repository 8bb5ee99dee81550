//! Hugetlb controller: huge page reservation limits.

use arbor_common::error::Result;

use super::Cgroup;

/// Sets the byte limit on every huge page size the kernel exposes.
///
/// # Errors
///
/// Returns an error if directory enumeration or a knob write fails.
pub fn set_limit(cg: &Cgroup, bytes: u64) -> Result<()> {
    let entries = match std::fs::read_dir(cg.path()) {
        Ok(entries) => entries,
        Err(e) => return Err(arbor_common::error::ArborError::io(cg.path(), &e)),
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with("hugetlb.") && name.ends_with(".limit_in_bytes") {
            cg.set_knob_u64(name, bytes)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::{CgroupDriver, Controller};

    #[test]
    fn limit_covers_every_page_size() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("hugetlb")).expect("mkdir");
        let driver = CgroupDriver::probe(dir.path(), "arbord");
        let cg = driver.named(Controller::Hugetlb, "arbord%a").expect("cgroup");
        cg.create().expect("create");
        cg.set_knob("hugetlb.2MB.limit_in_bytes", "0").expect("seed");
        cg.set_knob("hugetlb.1GB.limit_in_bytes", "0").expect("seed");

        set_limit(&cg, 1 << 21).expect("set");
        assert_eq!(cg.get_knob_u64("hugetlb.2MB.limit_in_bytes").expect("read"), 1 << 21);
        assert_eq!(cg.get_knob_u64("hugetlb.1GB.limit_in_bytes").expect("read"), 1 << 21);
    }
}
