//! CPU controller: bandwidth limits, shares, realtime budget.

use arbor_common::constants::CPU_POWER_PER_SEC;
use arbor_common::error::Result;
use arbor_common::types::CpuPolicy;

use super::Cgroup;

fn period_us(period_ns: u64) -> u64 {
    (period_ns / 1000).clamp(1000, 1_000_000)
}

/// Sets the CFS bandwidth limit from a cpu power value; `0` removes it.
///
/// # Errors
///
/// Returns an error if a knob write fails.
pub fn set_limit(cg: &Cgroup, period_ns: u64, power: u64) -> Result<()> {
    let period = period_us(period_ns);
    cg.set_knob_u64("cpu.cfs_period_us", period)?;
    if power == 0 {
        cg.set_knob("cpu.cfs_quota_us", "-1")
    } else {
        let quota = (power.saturating_mul(period) / CPU_POWER_PER_SEC).max(1000);
        cg.set_knob_u64("cpu.cfs_quota_us", quota)
    }
}

/// Sets the realtime runtime budget from a cpu power value.
///
/// # Errors
///
/// Returns an error if a knob write fails.
pub fn set_rt_limit(cg: &Cgroup, period_ns: u64, power: u64) -> Result<()> {
    if !cg.has_knob("cpu.rt_runtime_us") {
        return Ok(());
    }
    let period = period_us(period_ns);
    cg.set_knob_u64("cpu.rt_period_us", period)?;
    if power == 0 {
        cg.set_knob("cpu.rt_runtime_us", "-1")
    } else {
        cg.set_knob_u64("cpu.rt_runtime_us", power.saturating_mul(period) / CPU_POWER_PER_SEC)
    }
}

/// Applies the guarantee as cpu shares, scaled by the container weight.
///
/// # Errors
///
/// Returns an error if a knob write fails.
pub fn set_guarantee(
    cg: &Cgroup,
    policy: CpuPolicy,
    weight: u64,
    power: u64,
) -> Result<()> {
    let base = 1024 * power / CPU_POWER_PER_SEC;
    let shares = (base.max(1024) * weight / 100).clamp(2, 262_144);
    cg.set_knob_u64("cpu.shares", shares)?;
    if cg.has_knob("cpu.idle") {
        cg.set_knob("cpu.idle", if policy == CpuPolicy::Idle { "1" } else { "0" })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::cgroup::{CgroupDriver, Controller};

    fn cpu_cg(dir: &Path) -> Cgroup {
        std::fs::create_dir_all(dir.join("cpu")).expect("mkdir");
        let driver = CgroupDriver::probe(dir, "arbord");
        let cg = driver.named(Controller::Cpu, "arbord%a").expect("cgroup");
        cg.create().expect("create");
        cg
    }

    #[test]
    fn limit_of_two_cores_on_default_period() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cg = cpu_cg(dir.path());
        set_limit(&cg, 100_000_000, 2 * CPU_POWER_PER_SEC).expect("set");
        assert_eq!(cg.get_knob_u64("cpu.cfs_period_us").expect("read"), 100_000);
        assert_eq!(cg.get_knob_u64("cpu.cfs_quota_us").expect("read"), 200_000);
    }

    #[test]
    fn zero_limit_is_unlimited_quota() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cg = cpu_cg(dir.path());
        set_limit(&cg, 100_000_000, 0).expect("set");
        assert_eq!(cg.get_knob("cpu.cfs_quota_us").expect("read"), "-1");
    }

    #[test]
    fn guarantee_scales_with_weight() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cg = cpu_cg(dir.path());
        set_guarantee(&cg, CpuPolicy::Normal, 200, CPU_POWER_PER_SEC).expect("set");
        assert_eq!(cg.get_knob_u64("cpu.shares").expect("read"), 2048);
    }
}
