//! Block io controller: weights and per-device throttles.

use std::path::Path;

use arbor_common::error::{ArborError, Result};

use super::Cgroup;

/// Resolves a block device name (`sda`) to its `major:minor` pair; a key
/// that already looks like `major:minor` passes through.
///
/// # Errors
///
/// Returns an error if the device is unknown to sysfs.
pub fn resolve_device(sysfs_root: &Path, name: &str) -> Result<String> {
    if name.contains(':') {
        return Ok(name.to_string());
    }
    let path = sysfs_root.join("class/block").join(name).join("dev");
    let dev = std::fs::read_to_string(&path)
        .map_err(|_| ArborError::invalid_value(format!("unknown block device: {name}")))?;
    Ok(dev.trim().to_string())
}

/// Applies the io weight through whichever weight knob the scheduler
/// exposes; `policy` selects the bfq knob when present.
///
/// # Errors
///
/// Returns an error if no weight knob exists or the write fails.
pub fn set_weight(cg: &Cgroup, policy: &str, weight: u64) -> Result<()> {
    let weight = weight.clamp(10, 1000);
    let knob = if policy == "bfq" && cg.has_knob("blkio.bfq.weight") {
        "blkio.bfq.weight"
    } else if cg.has_knob("blkio.weight") {
        "blkio.weight"
    } else if cg.has_knob("blkio.bfq.weight") {
        "blkio.bfq.weight"
    } else {
        tracing::debug!(cg = %cg, "kernel exposes no io weight knob");
        return Ok(());
    };
    cg.set_knob_u64(knob, weight)
}

/// Sets a per-device byte or operation throttle for both directions.
/// A zero value clears the throttle.
///
/// # Errors
///
/// Returns an error if a knob write fails.
pub fn set_throttle(cg: &Cgroup, device: &str, value: u64, ops: bool) -> Result<()> {
    let knobs = if ops {
        ["blkio.throttle.read_iops_device", "blkio.throttle.write_iops_device"]
    } else {
        ["blkio.throttle.read_bps_device", "blkio.throttle.write_bps_device"]
    };
    for knob in knobs {
        cg.set_knob(knob, &format!("{device} {value}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::{CgroupDriver, Controller};

    fn blkio_cg(dir: &Path) -> Cgroup {
        std::fs::create_dir_all(dir.join("blkio")).expect("mkdir");
        let driver = CgroupDriver::probe(dir, "arbord");
        let cg = driver.named(Controller::Blkio, "arbord%a").expect("cgroup");
        cg.create().expect("create");
        cg
    }

    #[test]
    fn device_passthrough_and_sysfs_lookup() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(resolve_device(dir.path(), "8:0").expect("pass"), "8:0");

        let dev_dir = dir.path().join("class/block/sda");
        std::fs::create_dir_all(&dev_dir).expect("mkdir");
        std::fs::write(dev_dir.join("dev"), "8:0\n").expect("seed");
        assert_eq!(resolve_device(dir.path(), "sda").expect("lookup"), "8:0");
        assert!(resolve_device(dir.path(), "sdz").is_err());
    }

    #[test]
    fn weight_prefers_available_knob() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cg = blkio_cg(dir.path());
        cg.set_knob("blkio.weight", "500").expect("seed");
        set_weight(&cg, "", 200).expect("set");
        assert_eq!(cg.get_knob_u64("blkio.weight").expect("read"), 200);
    }

    #[test]
    fn throttle_writes_both_directions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cg = blkio_cg(dir.path());
        set_throttle(&cg, "8:0", 1_048_576, false).expect("set");
        assert_eq!(
            cg.get_knob("blkio.throttle.read_bps_device").expect("read"),
            "8:0 1048576"
        );
        assert_eq!(
            cg.get_knob("blkio.throttle.write_bps_device").expect("read"),
            "8:0 1048576"
        );
    }
}
