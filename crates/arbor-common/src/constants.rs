//! System-wide constants and default paths.

/// Default base directory for arbor state and data.
pub const DEFAULT_DATA_DIR: &str = "/var/lib/arbor";

/// Default directory for per-container persistence records.
pub const DEFAULT_KV_DIR: &str = "/var/lib/arbor/containers";

/// Default root of per-container work directories.
pub const DEFAULT_WORK_DIR: &str = "/var/lib/arbor/work";

/// Mount point under which cgroup-v1 controller hierarchies live.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Sysfs root for cpu topology discovery.
pub const DEFAULT_SYSFS_ROOT: &str = "/sys";

/// Name of the daemon's cgroup directory under every controller root.
pub const CGROUP_PREFIX: &str = "arbord";

/// Default control socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/run/arbord.sock";

/// Cpu power unit: one full core per second.
pub const CPU_POWER_PER_SEC: u64 = 1_000_000_000;

/// Name of the root container.
pub const ROOT_CONTAINER: &str = "/";

/// Reserved path segments.
pub const DOT_CONTAINER: &str = ".";
/// Alias clients use for their own container.
pub const SELF_CONTAINER: &str = "self";

/// Maximum length of one path segment.
pub const CONTAINER_NAME_MAX: usize = 128;
/// Maximum length of a full container path.
pub const CONTAINER_PATH_MAX: usize = 200;
/// Maximum path length granted to the superuser.
pub const CONTAINER_PATH_MAX_SUPERUSER: usize = 220;
/// Maximum nesting depth.
pub const CONTAINER_LEVEL_MAX: u32 = 16;

/// Highest container id; the id space is `1..=CONTAINER_ID_MAX`.
pub const CONTAINER_ID_MAX: u32 = 4095;
/// Id of the root container.
pub const ROOT_CONTAINER_ID: u32 = 1;
/// Id reserved for the default user container.
pub const DEFAULT_CONTAINER_ID: u32 = 2;
/// Id reserved for legacy compatibility.
pub const LEGACY_CONTAINER_ID: u32 = 3;
/// First id handed out to user containers.
pub const FIRST_USER_CONTAINER_ID: u32 = 4;

/// Maximum number of labels on one container.
pub const LABELS_MAX: usize = 64;
/// Maximum length of a label value.
pub const LABEL_VALUE_MAX: usize = 256;

/// Application name used in logs.
pub const APP_NAME: &str = "arbor";

/// Binary name of the daemon.
pub const BIN_NAME: &str = "arbord";
