//! Global configuration model for the arbor daemon.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::constants;

/// Root configuration for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArborConfig {
    /// Base directory for daemon state and data.
    pub data_dir: PathBuf,
    /// Directory holding one persistence record file per container id.
    pub kv_dir: PathBuf,
    /// Root of per-container work directories.
    pub work_dir: PathBuf,
    /// Mount point of the cgroup-v1 controller hierarchies.
    pub cgroup_root: PathBuf,
    /// Sysfs root used for cpu topology discovery.
    pub sysfs_root: PathBuf,
    /// Daemon behavior tunables.
    pub daemon: DaemonConfig,
    /// Per-container defaults.
    pub container: ContainerConfig,
}

/// Daemon-level tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Attempts made while waiting for a freezer state flip.
    pub freezer_wait_attempts: u32,
    /// Sleep between freezer state checks, in milliseconds.
    pub freezer_wait_interval_ms: u64,
    /// Host memory kept out of guarantee admission, in bytes.
    pub memory_guarantee_reserve: u64,
    /// Period of the log rotation / aging sweep, in milliseconds.
    pub log_rotate_ms: u64,
    /// Memory soft limit applied to dead containers, in bytes.
    pub dead_memory_soft_limit: u64,
    /// Maximum number of user containers.
    pub max_containers: usize,
    /// Extra containers allowed to the superuser.
    pub superuser_extra_containers: usize,
}

/// Defaults stamped onto newly created containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Delay before an auto-respawn, in milliseconds.
    pub respawn_delay_ms: u64,
    /// How long a dead container lingers before aging out, in milliseconds.
    pub default_aging_time_ms: u64,
    /// Default cpu period, in nanoseconds.
    pub cpu_period_ns: u64,
    /// Byte cap on captured stdout/stderr before rotation.
    pub stdio_limit: u64,
    /// Default thread limit for first-level containers; 0 disables.
    pub default_thread_limit: u64,
    /// Whether dead containers get a tight memory soft limit.
    pub pressurize_on_death: bool,
}

impl Default for ArborConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(constants::DEFAULT_DATA_DIR),
            kv_dir: PathBuf::from(constants::DEFAULT_KV_DIR),
            work_dir: PathBuf::from(constants::DEFAULT_WORK_DIR),
            cgroup_root: PathBuf::from(constants::DEFAULT_CGROUP_ROOT),
            sysfs_root: PathBuf::from(constants::DEFAULT_SYSFS_ROOT),
            daemon: DaemonConfig::default(),
            container: ContainerConfig::default(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            freezer_wait_attempts: 100,
            freezer_wait_interval_ms: 100,
            memory_guarantee_reserve: 1 << 30,
            log_rotate_ms: 60_000,
            dead_memory_soft_limit: 1 << 20,
            max_containers: 3000,
            superuser_extra_containers: 100,
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            respawn_delay_ms: 1000,
            default_aging_time_ms: 24 * 60 * 60 * 1000,
            cpu_period_ns: 100_000_000,
            stdio_limit: 8 << 20,
            default_thread_limit: 10_000,
            pressurize_on_death: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ArborConfig::default();
        assert_eq!(cfg.daemon.freezer_wait_attempts, 100);
        assert_eq!(cfg.daemon.freezer_wait_interval_ms, 100);
        assert!(cfg.container.default_aging_time_ms >= 60_000);
    }

    #[test]
    fn config_serializes_to_json() {
        let cfg = ArborConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize");
        let back: ArborConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.daemon.max_containers, cfg.daemon.max_containers);
    }
}
