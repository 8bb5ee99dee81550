//! Declared container properties.
//!
//! A process-wide table maps property names to typed accessors over the
//! container data. Every property tracks a `set` bit (value differs from
//! the default) and a `dirty` bit (pending kernel application); the
//! lifecycle engine consumes dirty bits in a fixed order when it applies
//! dynamic changes.

use std::collections::BTreeMap;
use std::sync::Arc;

use arbor_common::config::ArborConfig;
use arbor_common::error::{ArborError, ErrorKind, Result};
use arbor_common::types::{
    format_cpu_power, format_size, parse_bool, parse_cpu_power, parse_size, ContainerState,
};
use arbor_core::cgroup::Controller;

use crate::container::ContainerCell;

/// Typed property identifier; doubles as the bit index of the set/dirty
/// masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Prop {
    State,
    ExitStatus,
    OomKilled,
    RootPid,
    SeizePid,
    StartTime,
    DeathTime,
    RespawnCount,
    CpuSetAffinity,
    Command,
    Env,
    Cwd,
    Root,
    Hostname,
    ResolvConf,
    Bind,
    Symlink,
    Isolate,
    VirtMode,
    User,
    Group,
    OwnerUser,
    OwnerGroup,
    MemLimit,
    MemGuarantee,
    AnonLimit,
    DirtyLimit,
    HugetlbLimit,
    OomIsFatal,
    PressurizeOnDeath,
    CpuLimit,
    CpuGuarantee,
    CpuPolicy,
    CpuWeight,
    CpuPeriod,
    CpuSet,
    IoPolicy,
    IoWeight,
    IoLimit,
    IoOpsLimit,
    ThreadLimit,
    Ulimit,
    Capabilities,
    CapabilitiesAmbient,
    Controllers,
    Respawn,
    RespawnLimit,
    RespawnDelay,
    AgingTime,
    Weak,
    Labels,
    Private,
}

/// Bitset over [`Prop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropMask(u64);

impl PropMask {
    /// Tests a bit.
    #[must_use]
    pub fn has(self, prop: Prop) -> bool {
        self.0 & (1 << prop as u8) != 0
    }

    /// Sets a bit.
    pub fn set(&mut self, prop: Prop) {
        self.0 |= 1 << prop as u8;
    }

    /// Clears a bit.
    pub fn clear(&mut self, prop: Prop) {
        self.0 &= !(1 << prop as u8);
    }

    /// Tests and clears in one step; the apply pass is built on this.
    pub fn take(&mut self, prop: Prop) -> bool {
        let had = self.has(prop);
        self.clear(prop);
        had
    }

    /// Copies every bit of `other` into `self`.
    pub fn merge(&mut self, other: PropMask) {
        self.0 |= other.0;
    }
}

/// Static descriptor of one property.
#[derive(Debug)]
pub struct PropDesc {
    /// Wire name.
    pub name: &'static str,
    /// Typed identifier.
    pub prop: Prop,
    /// Never settable by clients.
    pub read_only: bool,
    /// Settable while the container holds resources.
    pub dynamic: bool,
    /// Included in the persistence record.
    pub persist: bool,
    /// Controllers the property needs enabled.
    pub req_controllers: &'static [Controller],
}

const fn desc(
    name: &'static str,
    prop: Prop,
    read_only: bool,
    dynamic: bool,
    persist: bool,
    req_controllers: &'static [Controller],
) -> PropDesc {
    PropDesc {
        name,
        prop,
        read_only,
        dynamic,
        persist,
        req_controllers,
    }
}

/// The property table, in registration order.
pub static PROPERTIES: &[PropDesc] = &[
    desc("state", Prop::State, true, false, true, &[]),
    desc("exit_status", Prop::ExitStatus, true, false, true, &[]),
    desc("oom_killed", Prop::OomKilled, true, false, true, &[]),
    desc("root_pid", Prop::RootPid, true, false, true, &[]),
    desc("seize_pid", Prop::SeizePid, true, false, true, &[]),
    desc("start_time", Prop::StartTime, true, false, true, &[]),
    desc("death_time", Prop::DeathTime, true, false, true, &[]),
    desc("respawn_count", Prop::RespawnCount, false, true, true, &[]),
    desc("cpu_set_affinity", Prop::CpuSetAffinity, true, false, true, &[]),
    desc("command", Prop::Command, false, false, true, &[]),
    desc("env", Prop::Env, false, false, true, &[]),
    desc("cwd", Prop::Cwd, false, false, true, &[]),
    desc("root", Prop::Root, false, false, true, &[]),
    desc("hostname", Prop::Hostname, false, false, true, &[]),
    desc("resolv_conf", Prop::ResolvConf, false, true, true, &[]),
    desc("bind", Prop::Bind, false, false, true, &[]),
    desc("symlink", Prop::Symlink, false, true, true, &[]),
    desc("isolate", Prop::Isolate, false, false, true, &[]),
    desc("virt_mode", Prop::VirtMode, false, false, true, &[]),
    desc("user", Prop::User, false, false, true, &[]),
    desc("group", Prop::Group, false, false, true, &[]),
    desc("owner_user", Prop::OwnerUser, false, false, true, &[]),
    desc("owner_group", Prop::OwnerGroup, false, false, true, &[]),
    desc("memory_limit", Prop::MemLimit, false, true, true, &[Controller::Memory]),
    desc("memory_guarantee", Prop::MemGuarantee, false, true, true, &[Controller::Memory]),
    desc("anon_limit", Prop::AnonLimit, false, true, true, &[Controller::Memory]),
    desc("dirty_limit", Prop::DirtyLimit, false, true, true, &[Controller::Memory]),
    desc("hugetlb_limit", Prop::HugetlbLimit, false, true, true, &[Controller::Hugetlb]),
    desc("oom_is_fatal", Prop::OomIsFatal, false, true, true, &[Controller::Memory]),
    desc("pressurize_on_death", Prop::PressurizeOnDeath, false, true, true, &[Controller::Memory]),
    desc("cpu_limit", Prop::CpuLimit, false, true, true, &[Controller::Cpu]),
    desc("cpu_guarantee", Prop::CpuGuarantee, false, true, true, &[Controller::Cpu]),
    desc("cpu_policy", Prop::CpuPolicy, false, true, true, &[Controller::Cpu]),
    desc("cpu_weight", Prop::CpuWeight, false, true, true, &[Controller::Cpu]),
    desc("cpu_period", Prop::CpuPeriod, false, true, true, &[Controller::Cpu]),
    desc("cpu_set", Prop::CpuSet, false, true, true, &[Controller::Cpuset]),
    desc("io_policy", Prop::IoPolicy, false, true, true, &[]),
    desc("io_weight", Prop::IoWeight, false, true, true, &[Controller::Blkio]),
    desc("io_limit", Prop::IoLimit, false, true, true, &[Controller::Blkio]),
    desc("io_ops_limit", Prop::IoOpsLimit, false, true, true, &[Controller::Blkio]),
    desc("thread_limit", Prop::ThreadLimit, false, true, true, &[Controller::Pids]),
    desc("ulimit", Prop::Ulimit, false, true, true, &[]),
    desc("capabilities", Prop::Capabilities, false, false, true, &[]),
    desc("capabilities_ambient", Prop::CapabilitiesAmbient, false, false, true, &[]),
    desc("controllers", Prop::Controllers, false, false, true, &[]),
    desc("respawn", Prop::Respawn, false, true, true, &[]),
    desc("respawn_limit", Prop::RespawnLimit, false, true, true, &[]),
    desc("respawn_delay", Prop::RespawnDelay, false, true, true, &[]),
    desc("aging_time", Prop::AgingTime, false, true, true, &[]),
    desc("weak", Prop::Weak, false, true, false, &[]),
    desc("labels", Prop::Labels, false, true, true, &[]),
    desc("private", Prop::Private, false, true, true, &[]),
];

/// Finds a descriptor by wire name.
#[must_use]
pub fn find(name: &str) -> Option<&'static PropDesc> {
    PROPERTIES.iter().find(|d| d.name == name)
}

/// Splits `name[index]` into name and index.
///
/// # Errors
///
/// Fails on an empty index.
pub fn split_index(raw: &str) -> Result<(&str, Option<&str>)> {
    let Some(stripped) = raw.strip_suffix(']') else {
        return Ok((raw, None));
    };
    let Some((name, index)) = stripped.split_once('[') else {
        return Ok((raw, None));
    };
    if index.is_empty() {
        return Err(ArborError::invalid_property("empty property index"));
    }
    Ok((name, Some(index)))
}

/// Checks whether a set is allowed in the container's current state.
///
/// # Errors
///
/// Fails with `Permission` for read-only properties and `InvalidState`
/// for non-dynamic ones on a live container.
pub fn can_set(cell: &ContainerCell, desc: &PropDesc) -> Result<()> {
    if desc.read_only {
        return Err(ArborError::permission(format!(
            "property {} is read-only",
            desc.name
        )));
    }
    if !desc.dynamic && cell.state() != ContainerState::Stopped {
        return Err(ArborError::invalid_state(format!(
            "cannot change {} while container is {}",
            desc.name,
            cell.state()
        )));
    }
    Ok(())
}

fn list_to_string(items: &[String]) -> String {
    items.join("; ")
}

fn list_from_string(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn map_to_string<V: std::fmt::Display>(map: &BTreeMap<String, V>) -> String {
    map.iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join("; ")
}

fn map_entry(line: &str) -> Result<(String, String)> {
    let (key, value) = line
        .split_once(':')
        .ok_or_else(|| ArborError::invalid_value(format!("expected 'key: value': {line}")))?;
    Ok((key.trim().to_string(), value.trim().to_string()))
}

fn size_map_from_string(value: &str) -> Result<BTreeMap<String, u64>> {
    let mut map = BTreeMap::new();
    for line in list_from_string(value) {
        let (key, raw) = map_entry(&line)?;
        map.insert(key, parse_size(&raw)?);
    }
    Ok(map)
}

fn size_map_to_string(map: &BTreeMap<String, u64>) -> String {
    map.iter()
        .map(|(k, v)| format!("{k}: {}", format_size(*v)))
        .collect::<Vec<_>>()
        .join("; ")
}

fn ulimit_to_string(map: &BTreeMap<String, (u64, u64)>) -> String {
    map.iter()
        .map(|(k, (soft, hard))| {
            let soft = fmt_rlim(*soft);
            let hard = fmt_rlim(*hard);
            format!("{k}: {soft} {hard}")
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn fmt_rlim(value: u64) -> String {
    if value == u64::MAX {
        "unlimited".to_string()
    } else {
        value.to_string()
    }
}

fn parse_rlim(raw: &str) -> Result<u64> {
    if raw == "unlimited" {
        return Ok(u64::MAX);
    }
    raw.parse()
        .map_err(|_| ArborError::invalid_value(format!("invalid ulimit value: {raw}")))
}

fn parse_ulimit_pair(raw: &str) -> Result<(u64, u64)> {
    let mut parts = raw.split_whitespace();
    let soft = parse_rlim(
        parts
            .next()
            .ok_or_else(|| ArborError::invalid_value("empty ulimit value"))?,
    )?;
    let hard = match parts.next() {
        Some(hard) => parse_rlim(hard)?,
        None => soft,
    };
    if parts.next().is_some() {
        return Err(ArborError::invalid_value(format!(
            "expected 'soft hard': {raw}"
        )));
    }
    Ok((soft, hard))
}

fn validate_ulimit_name(name: &str) -> Result<()> {
    arbor_core::proc::rlimit_by_name(name).map(|_| ())
}

/// Validates a label key: a dotted namespace prefix, limited charset.
///
/// # Errors
///
/// Fails with `InvalidLabel`.
pub fn validate_label_key(key: &str) -> Result<()> {
    let valid_chars = key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    let (ns, rest) = match key.split_once('.') {
        Some(parts) => parts,
        None => ("", ""),
    };
    if !valid_chars || ns.is_empty() || rest.is_empty() || key.len() > 128 {
        return Err(ArborError::new(
            ErrorKind::InvalidLabel,
            format!("invalid label name: {key}"),
        ));
    }
    Ok(())
}

/// Validates a label value.
///
/// # Errors
///
/// Fails with `InvalidLabel` when the value is too long or multi-line.
pub fn validate_label_value(value: &str) -> Result<()> {
    if value.len() > arbor_common::constants::LABEL_VALUE_MAX || value.contains('\n') {
        return Err(ArborError::new(
            ErrorKind::InvalidLabel,
            "label value too long or multi-line",
        ));
    }
    Ok(())
}

fn user_to_string(uid: u32) -> String {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map_or_else(|| uid.to_string(), |u| u.name)
}

fn group_to_string(gid: u32) -> String {
    nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
        .ok()
        .flatten()
        .map_or_else(|| gid.to_string(), |g| g.name)
}

fn user_from_string(raw: &str) -> Result<u32> {
    if let Ok(uid) = raw.parse() {
        return Ok(uid);
    }
    nix::unistd::User::from_name(raw)
        .ok()
        .flatten()
        .map(|u| u.uid.as_raw())
        .ok_or_else(|| ArborError::invalid_value(format!("unknown user: {raw}")))
}

fn group_from_string(raw: &str) -> Result<u32> {
    if let Ok(gid) = raw.parse() {
        return Ok(gid);
    }
    nix::unistd::Group::from_name(raw)
        .ok()
        .flatten()
        .map(|g| g.gid.as_raw())
        .ok_or_else(|| ArborError::invalid_value(format!("unknown group: {raw}")))
}

fn indexed_get(cell: &ContainerCell, prop: Prop, index: &str) -> Result<String> {
    let data = cell.read();
    let missing = || ArborError::no_value(format!("no value at index {index}"));
    match prop {
        Prop::IoLimit => data
            .io_bps_limit
            .get(index)
            .map(|v| format_size(*v))
            .ok_or_else(missing),
        Prop::IoOpsLimit => data
            .io_ops_limit
            .get(index)
            .map(|v| format_size(*v))
            .ok_or_else(missing),
        Prop::Ulimit => data
            .ulimit
            .get(index)
            .map(|(soft, hard)| format!("{} {}", fmt_rlim(*soft), fmt_rlim(*hard)))
            .ok_or_else(missing),
        Prop::Labels => data
            .labels
            .get(index)
            .cloned()
            .ok_or_else(|| ArborError::new(ErrorKind::LabelNotFound, format!("label {index} not set"))),
        Prop::Symlink => data.symlinks.get(index).cloned().ok_or_else(missing),
        _ => Err(ArborError::invalid_property(format!(
            "property is not indexed: {index}"
        ))),
    }
}

fn indexed_set(cell: &ContainerCell, prop: Prop, index: &str, value: &str) -> Result<()> {
    let mut data = cell.write();
    match prop {
        Prop::IoLimit => {
            data.io_bps_limit.insert(index.to_string(), parse_size(value)?);
        }
        Prop::IoOpsLimit => {
            data.io_ops_limit.insert(index.to_string(), parse_size(value)?);
        }
        Prop::Ulimit => {
            validate_ulimit_name(index)?;
            let pair = parse_ulimit_pair(value)?;
            data.ulimit.insert(index.to_string(), pair);
        }
        Prop::Labels => {
            validate_label_key(index)?;
            validate_label_value(value)?;
            if value.is_empty() {
                data.labels.remove(index);
            } else {
                if data.labels.len() >= arbor_common::constants::LABELS_MAX
                    && !data.labels.contains_key(index)
                {
                    return Err(ArborError::no_resource("too many labels"));
                }
                data.labels.insert(index.to_string(), value.to_string());
            }
        }
        Prop::Symlink => {
            if value.is_empty() {
                data.symlinks.remove(index);
            } else {
                data.symlinks.insert(index.to_string(), value.to_string());
            }
        }
        _ => {
            return Err(ArborError::invalid_property(format!(
                "property is not indexed: {index}"
            )))
        }
    }
    data.prop_set.set(prop);
    data.prop_dirty.set(prop);
    Ok(())
}

/// Reads a property in its canonical string form.
///
/// # Errors
///
/// Fails for unknown properties and unset runtime values.
pub fn get(
    cell: &Arc<ContainerCell>,
    config: &ArborConfig,
    name: &str,
    index: Option<&str>,
) -> Result<String> {
    let desc = find(name)
        .ok_or_else(|| ArborError::invalid_property(format!("unknown property: {name}")))?;
    if let Some(index) = index {
        return indexed_get(cell, desc.prop, index);
    }
    // resolved outside the data guard: it walks the container itself
    if desc.prop == Prop::Cwd {
        return Ok(cell.get_cwd(config).display().to_string());
    }
    let data = cell.read();
    let value = match desc.prop {
        Prop::State => cell.state().to_string(),
        Prop::ExitStatus => match data.exit_status {
            Some(status) => status.to_string(),
            None => return Err(ArborError::no_value("container has not exited")),
        },
        Prop::OomKilled => data.oom_killed.to_string(),
        Prop::RootPid => match data.task_pid {
            Some(pid) => pid.to_string(),
            None => return Err(ArborError::no_value("container has no task")),
        },
        Prop::SeizePid => match data.seize_pid {
            Some(pid) => pid.to_string(),
            None => return Err(ArborError::no_value("container has no seized task")),
        },
        Prop::StartTime => match data.start_time_ms {
            Some(ms) => ms.to_string(),
            None => return Err(ArborError::no_value("container never started")),
        },
        Prop::DeathTime => match data.death_time_ms {
            Some(ms) => ms.to_string(),
            None => return Err(ArborError::no_value("container is not dead")),
        },
        Prop::RespawnCount => data.respawn_count.to_string(),
        Prop::CpuSetAffinity => data.cpu_affinity.to_string(),
        Prop::Command => data.command.clone(),
        Prop::Env => list_to_string(&data.env),
        Prop::Cwd => unreachable!("handled before the data guard"),
        Prop::Root => data.root.display().to_string(),
        Prop::Hostname => data.hostname.clone(),
        Prop::ResolvConf => list_to_string(&data.resolv_conf),
        Prop::Bind => list_to_string(&data.bind_mounts),
        Prop::Symlink => map_to_string(&data.symlinks),
        Prop::Isolate => data.isolate.to_string(),
        Prop::VirtMode => data.virt_mode.to_string(),
        Prop::User => user_to_string(data.task_cred.uid),
        Prop::Group => group_to_string(data.task_cred.gid),
        Prop::OwnerUser => user_to_string(data.owner_cred.uid),
        Prop::OwnerGroup => group_to_string(data.owner_cred.gid),
        Prop::MemLimit => format_size(data.mem_limit),
        Prop::MemGuarantee => format_size(data.new_mem_guarantee),
        Prop::AnonLimit => format_size(data.anon_limit),
        Prop::DirtyLimit => format_size(data.dirty_limit),
        Prop::HugetlbLimit => format_size(data.hugetlb_limit),
        Prop::OomIsFatal => data.oom_is_fatal.to_string(),
        Prop::PressurizeOnDeath => data.pressurize_on_death.to_string(),
        Prop::CpuLimit => format_cpu_power(data.cpu_limit),
        Prop::CpuGuarantee => format_cpu_power(data.cpu_guarantee),
        Prop::CpuPolicy => data.cpu_policy.to_string(),
        Prop::CpuWeight => data.cpu_weight.to_string(),
        Prop::CpuPeriod => data.cpu_period.to_string(),
        Prop::CpuSet => data.cpu_set.to_string(),
        Prop::IoPolicy => data.io_policy.clone(),
        Prop::IoWeight => data.io_weight.to_string(),
        Prop::IoLimit => size_map_to_string(&data.io_bps_limit),
        Prop::IoOpsLimit => size_map_to_string(&data.io_ops_limit),
        Prop::ThreadLimit => data.thread_limit.to_string(),
        Prop::Ulimit => ulimit_to_string(&data.ulimit),
        Prop::Capabilities => data.cap_limit.to_string(),
        Prop::CapabilitiesAmbient => data.cap_ambient.to_string(),
        Prop::Controllers => data.controllers.to_string(),
        Prop::Respawn => data.respawn.to_string(),
        Prop::RespawnLimit => data.respawn_limit.to_string(),
        Prop::RespawnDelay => data.respawn_delay_ms.to_string(),
        Prop::AgingTime => data.aging_time_ms.to_string(),
        Prop::Weak => data.is_weak.to_string(),
        Prop::Labels => map_to_string(&data.labels),
        Prop::Private => data.private.clone(),
    };
    Ok(value)
}

/// Stages a property value onto the container and marks it set and dirty.
/// Kernel application is the lifecycle engine's business.
///
/// # Errors
///
/// Fails when the value does not parse or validate.
pub fn set(
    cell: &Arc<ContainerCell>,
    desc: &PropDesc,
    index: Option<&str>,
    value: &str,
) -> Result<()> {
    if let Some(index) = index {
        return indexed_set(cell, desc.prop, index, value);
    }
    let value = value.trim();
    let mut data = cell.write();
    match desc.prop {
        Prop::RespawnCount => data.respawn_count = value.parse().map_err(|_| bad(desc, value))?,
        Prop::Command => data.command = value.to_string(),
        Prop::Env => data.env = list_from_string(value),
        Prop::Cwd => {
            data.cwd = if value.is_empty() {
                None
            } else {
                Some(std::path::PathBuf::from(value))
            }
        }
        Prop::Root => {
            let path = std::path::PathBuf::from(value);
            if path.components().any(|c| c.as_os_str() == "..") {
                return Err(ArborError::permission("root path with .."));
            }
            data.root = path;
        }
        Prop::Hostname => data.hostname = value.to_string(),
        Prop::ResolvConf => data.resolv_conf = list_from_string(value),
        Prop::Bind => data.bind_mounts = list_from_string(value),
        Prop::Symlink => {
            let mut map = BTreeMap::new();
            for line in list_from_string(value) {
                let (key, target) = map_entry(&line)?;
                map.insert(key, target);
            }
            data.symlinks = map;
        }
        Prop::Isolate => data.isolate = parse_bool(value)?,
        Prop::VirtMode => data.virt_mode = value.parse()?,
        Prop::User => data.task_cred.uid = user_from_string(value)?,
        Prop::Group => data.task_cred.gid = group_from_string(value)?,
        Prop::OwnerUser => data.owner_cred.uid = user_from_string(value)?,
        Prop::OwnerGroup => data.owner_cred.gid = group_from_string(value)?,
        Prop::MemLimit => data.mem_limit = parse_size(value)?,
        Prop::MemGuarantee => data.new_mem_guarantee = parse_size(value)?,
        Prop::AnonLimit => data.anon_limit = parse_size(value)?,
        Prop::DirtyLimit => data.dirty_limit = parse_size(value)?,
        Prop::HugetlbLimit => data.hugetlb_limit = parse_size(value)?,
        Prop::OomIsFatal => data.oom_is_fatal = parse_bool(value)?,
        Prop::PressurizeOnDeath => data.pressurize_on_death = parse_bool(value)?,
        Prop::CpuLimit => data.cpu_limit = parse_cpu_power(value)?,
        Prop::CpuGuarantee => data.cpu_guarantee = parse_cpu_power(value)?,
        Prop::CpuPolicy => data.cpu_policy = value.parse()?,
        Prop::CpuWeight => {
            let weight: u64 = value.parse().map_err(|_| bad(desc, value))?;
            if !(1..=10000).contains(&weight) {
                return Err(ArborError::invalid_value(format!(
                    "cpu_weight out of range 1..10000: {value}"
                )));
            }
            data.cpu_weight = weight;
        }
        Prop::CpuPeriod => {
            let period: u64 = value.parse().map_err(|_| bad(desc, value))?;
            if !(1_000_000..=1_000_000_000).contains(&period) {
                return Err(ArborError::invalid_value(format!(
                    "cpu_period out of range 1ms..1s: {value}"
                )));
            }
            data.cpu_period = period;
        }
        Prop::CpuSet => data.cpu_set = value.parse()?,
        Prop::IoPolicy => data.io_policy = value.to_string(),
        Prop::IoWeight => data.io_weight = value.parse().map_err(|_| bad(desc, value))?,
        Prop::IoLimit => data.io_bps_limit = size_map_from_string(value)?,
        Prop::IoOpsLimit => data.io_ops_limit = size_map_from_string(value)?,
        Prop::ThreadLimit => data.thread_limit = value.parse().map_err(|_| bad(desc, value))?,
        Prop::Ulimit => {
            let mut map = BTreeMap::new();
            for line in list_from_string(value) {
                let (name, pair) = map_entry(&line)?;
                validate_ulimit_name(&name)?;
                map.insert(name, parse_ulimit_pair(&pair)?);
            }
            data.ulimit = map;
        }
        Prop::Capabilities => data.cap_limit = value.parse()?,
        Prop::CapabilitiesAmbient => data.cap_ambient = value.parse()?,
        Prop::Controllers => {
            let set = value.parse()?;
            data.required_controllers = set;
            data.controllers = data.controllers.with(set);
        }
        Prop::Respawn => data.respawn = parse_bool(value)?,
        Prop::RespawnLimit => data.respawn_limit = value.parse().map_err(|_| bad(desc, value))?,
        Prop::RespawnDelay => data.respawn_delay_ms = value.parse().map_err(|_| bad(desc, value))?,
        Prop::AgingTime => data.aging_time_ms = value.parse().map_err(|_| bad(desc, value))?,
        Prop::Weak => data.is_weak = parse_bool(value)?,
        Prop::Labels => {
            let mut map = BTreeMap::new();
            for line in list_from_string(value) {
                let (key, label) = map_entry(&line)?;
                validate_label_key(&key)?;
                validate_label_value(&label)?;
                map.insert(key, label);
            }
            if map.len() > arbor_common::constants::LABELS_MAX {
                return Err(ArborError::no_resource("too many labels"));
            }
            data.labels = map;
        }
        Prop::Private => data.private = value.to_string(),
        Prop::State
        | Prop::ExitStatus
        | Prop::OomKilled
        | Prop::RootPid
        | Prop::SeizePid
        | Prop::StartTime
        | Prop::DeathTime
        | Prop::CpuSetAffinity => {
            return Err(ArborError::permission(format!(
                "property {} is read-only",
                desc.name
            )))
        }
    }
    data.prop_set.set(desc.prop);
    data.prop_dirty.set(desc.prop);
    Ok(())
}

fn bad(desc: &PropDesc, value: &str) -> ArborError {
    ArborError::invalid_value(format!("invalid {} value: {value}", desc.name))
}

/// Loads a persisted record back onto the container, including the
/// runtime properties clients may never set. Restore-only.
///
/// # Errors
///
/// Fails when the stored value does not parse.
pub fn load(cell: &Arc<ContainerCell>, desc: &PropDesc, value: &str) -> Result<()> {
    let prop = desc.prop;
    match prop {
        Prop::ExitStatus => {
            cell.write().exit_status = Some(value.parse().map_err(|_| bad(desc, value))?);
        }
        Prop::OomKilled => cell.write().oom_killed = parse_bool(value)?,
        Prop::RootPid => {
            let pid = value.parse().map_err(|_| bad(desc, value))?;
            let mut data = cell.write();
            data.task_pid = Some(pid);
            data.wait_pid = Some(pid);
        }
        Prop::SeizePid => {
            cell.write().seize_pid = Some(value.parse().map_err(|_| bad(desc, value))?);
        }
        Prop::StartTime => {
            cell.write().start_time_ms = Some(value.parse().map_err(|_| bad(desc, value))?);
        }
        Prop::DeathTime => {
            cell.write().death_time_ms = Some(value.parse().map_err(|_| bad(desc, value))?);
        }
        Prop::CpuSetAffinity => cell.write().cpu_affinity = value.parse()?,
        Prop::State => {
            return Err(ArborError::invalid_property(
                "state is restored by the lifecycle engine",
            ))
        }
        _ => return set(cell, desc, None, value),
    }
    cell.write().prop_set.set(prop);
    Ok(())
}

#[cfg(test)]
mod tests {
    use arbor_core::cgroup::ControllerSet;

    use super::*;

    fn cell() -> Arc<ContainerCell> {
        Arc::new(ContainerCell::new(
            arbor_common::types::CtId(4),
            "a".to_string(),
            None,
            &ArborConfig::default(),
            ControllerSet::empty(),
        ))
    }

    #[test]
    fn mask_set_take() {
        let mut mask = PropMask::default();
        mask.set(Prop::MemLimit);
        assert!(mask.has(Prop::MemLimit));
        assert!(mask.take(Prop::MemLimit));
        assert!(!mask.take(Prop::MemLimit));
    }

    #[test]
    fn property_names_are_unique() {
        for (i, a) in PROPERTIES.iter().enumerate() {
            for b in &PROPERTIES[i + 1..] {
                assert_ne!(a.name, b.name);
                assert_ne!(a.prop, b.prop);
            }
        }
    }

    #[test]
    fn index_splitting() {
        assert_eq!(split_index("io_limit[sda]").unwrap(), ("io_limit", Some("sda")));
        assert_eq!(split_index("memory_limit").unwrap(), ("memory_limit", None));
        assert!(split_index("labels[]").is_err());
    }

    #[test]
    fn set_then_get_roundtrips_string_form() {
        let cell = cell();
        let config = ArborConfig::default();
        for (name, value) in [
            ("command", "/bin/sleep 1000"),
            ("memory_limit", "512M"),
            ("cpu_limit", "2c"),
            ("cpu_policy", "batch"),
            ("cpu_set", "cores 2"),
            ("isolate", "false"),
            ("env", "A=1; B=2"),
            ("ulimit", "nofile: 1024 2048"),
            ("io_limit", "fs: 1M"),
            ("thread_limit", "500"),
            ("respawn", "true"),
            ("labels", "app.tier: web"),
        ] {
            let desc = find(name).expect(name);
            set(&cell, desc, None, value).expect(name);
            let back = get(&cell, &config, name, None).expect(name);
            assert_eq!(back, value, "round trip of {name}");
        }
    }

    #[test]
    fn set_marks_set_and_dirty() {
        let cell = cell();
        let desc = find("memory_limit").expect("desc");
        set(&cell, desc, None, "1G").expect("set");
        let data = cell.read();
        assert!(data.prop_set.has(Prop::MemLimit));
        assert!(data.prop_dirty.has(Prop::MemLimit));
        assert_eq!(data.mem_limit, 1 << 30);
    }

    #[test]
    fn read_only_properties_reject_set() {
        let cell = cell();
        let desc = find("state").expect("desc");
        assert!(can_set(&cell, desc).is_err());
        assert!(set(&cell, desc, None, "running").is_err());
    }

    #[test]
    fn non_dynamic_property_needs_stopped_state() {
        let cell = cell();
        cell.store_state(ContainerState::Running);
        let desc = find("command").expect("desc");
        let err = can_set(&cell, desc).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        let desc = find("memory_limit").expect("desc");
        can_set(&cell, desc).expect("dynamic ok");
    }

    #[test]
    fn indexed_ulimit_and_labels() {
        let cell = cell();
        let desc = find("ulimit").expect("desc");
        set(&cell, desc, Some("nofile"), "100 200").expect("set");
        assert_eq!(indexed_get(&cell, Prop::Ulimit, "nofile").expect("get"), "100 200");
        assert!(set(&cell, desc, Some("sandwiches"), "1 2").is_err());

        let desc = find("labels").expect("desc");
        set(&cell, desc, Some("app.tier"), "db").expect("set");
        assert_eq!(indexed_get(&cell, Prop::Labels, "app.tier").expect("get"), "db");
        let err = indexed_get(&cell, Prop::Labels, "app.other").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LabelNotFound);
        assert!(set(&cell, desc, Some("nodots"), "x").is_err());
    }

    #[test]
    fn bad_values_are_rejected() {
        let cell = cell();
        assert!(set(&cell, find("memory_limit").unwrap(), None, "lots").is_err());
        assert!(set(&cell, find("cpu_weight").unwrap(), None, "0").is_err());
        assert!(set(&cell, find("cpu_period").unwrap(), None, "10").is_err());
        assert!(set(&cell, find("virt_mode").unwrap(), None, "hypervisor").is_err());
        assert!(set(&cell, find("root").unwrap(), None, "/a/../b").is_err());
    }

    #[test]
    fn unset_runtime_values_report_no_value() {
        let cell = cell();
        let config = ArborConfig::default();
        let err = get(&cell, &config, "exit_status", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoValue);
        let err = get(&cell, &config, "death_time", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoValue);
    }
}
