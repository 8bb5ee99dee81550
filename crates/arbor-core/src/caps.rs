//! Linux capability sets for least-privilege container tasks.
//!
//! Capabilities are tracked as a bitmask over the kernel's capability
//! indices. The named groups are the ones the start path subtracts when a
//! container lacks the matching isolation.

use std::fmt;
use std::str::FromStr;

use arbor_common::error::{ArborError, Result};

/// A set of Linux capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapSet(pub u64);

macro_rules! caps {
    ($($name:ident = $bit:expr, $label:literal;)*) => {
        impl CapSet {
            $(
                #[doc = concat!("`", $label, "`")]
                pub const $name: CapSet = CapSet(1 << $bit);
            )*

            const NAMES: &'static [(u64, &'static str)] = &[
                $((1 << $bit, $label),)*
            ];
        }
    };
}

caps! {
    CHOWN = 0, "CHOWN";
    DAC_OVERRIDE = 1, "DAC_OVERRIDE";
    DAC_READ_SEARCH = 2, "DAC_READ_SEARCH";
    FOWNER = 3, "FOWNER";
    FSETID = 4, "FSETID";
    KILL = 5, "KILL";
    SETGID = 6, "SETGID";
    SETUID = 7, "SETUID";
    SETPCAP = 8, "SETPCAP";
    NET_BIND_SERVICE = 10, "NET_BIND_SERVICE";
    NET_ADMIN = 12, "NET_ADMIN";
    NET_RAW = 13, "NET_RAW";
    IPC_LOCK = 14, "IPC_LOCK";
    SYS_CHROOT = 18, "SYS_CHROOT";
    SYS_PTRACE = 19, "SYS_PTRACE";
    SYS_ADMIN = 21, "SYS_ADMIN";
    SYS_BOOT = 22, "SYS_BOOT";
    SYS_NICE = 23, "SYS_NICE";
    SYS_RESOURCE = 24, "SYS_RESOURCE";
    MKNOD = 27, "MKNOD";
    AUDIT_WRITE = 29, "AUDIT_WRITE";
    SETFCAP = 31, "SETFCAP";
}

impl CapSet {
    /// The empty set.
    #[must_use]
    pub fn empty() -> Self {
        Self(0)
    }

    /// Everything the daemon may ever grant on the host.
    #[must_use]
    pub fn host_bound() -> Self {
        Self::NAMES
            .iter()
            .fold(Self::empty(), |acc, (bit, _)| Self(acc.0 | bit))
    }

    /// The bound inside a chroot: no host-administration capabilities.
    #[must_use]
    pub fn chroot_bound() -> Self {
        let mut set = Self::host_bound();
        set = set.without(Self::SYS_ADMIN);
        set = set.without(Self::SYS_BOOT);
        set = set.without(Self::SYS_RESOURCE);
        set
    }

    /// Capabilities that only make sense with a private pid namespace.
    #[must_use]
    pub fn pid_ns_group() -> Self {
        Self::KILL.with(Self::SYS_PTRACE).with(Self::SYS_BOOT)
    }

    /// Capabilities that only make sense under a memory limit.
    #[must_use]
    pub fn mem_cg_group() -> Self {
        Self::IPC_LOCK.with(Self::SYS_RESOURCE)
    }

    /// Capabilities that only make sense with a private network namespace.
    #[must_use]
    pub fn net_ns_group() -> Self {
        Self::NET_ADMIN.with(Self::NET_RAW)
    }

    /// Union.
    #[must_use]
    pub fn with(self, other: CapSet) -> Self {
        Self(self.0 | other.0)
    }

    /// Set difference.
    #[must_use]
    pub fn without(self, other: CapSet) -> Self {
        Self(self.0 & !other.0)
    }

    /// Intersection.
    #[must_use]
    pub fn intersect(self, other: CapSet) -> Self {
        Self(self.0 & other.0)
    }

    /// True when every capability of `self` is in `other`.
    #[must_use]
    pub fn is_subset_of(self, other: CapSet) -> bool {
        self.0 & !other.0 == 0
    }

    /// True when nothing is set.
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CapSet {
    /// Formats as a semicolon-separated list of capability names.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (bit, label) in Self::NAMES {
            if self.0 & bit != 0 {
                if !first {
                    f.write_str("; ")?;
                }
                first = false;
                f.write_str(label)?;
            }
        }
        Ok(())
    }
}

impl FromStr for CapSet {
    type Err = ArborError;

    fn from_str(s: &str) -> Result<Self> {
        let mut set = Self::empty();
        for part in s.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let found = Self::NAMES
                .iter()
                .find(|(_, label)| *label == part)
                .ok_or_else(|| {
                    ArborError::invalid_value(format!("unknown capability: {part}"))
                })?;
            set.0 |= found.0;
        }
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_and_parse_roundtrip() {
        let set = CapSet::CHOWN.with(CapSet::KILL).with(CapSet::NET_ADMIN);
        let text = set.to_string();
        assert_eq!(text, "CHOWN; KILL; NET_ADMIN");
        assert_eq!(text.parse::<CapSet>().expect("parse"), set);
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!("CAP_OF_INVISIBILITY".parse::<CapSet>().is_err());
    }

    #[test]
    fn chroot_bound_strips_host_administration() {
        let bound = CapSet::chroot_bound();
        assert!(!CapSet::SYS_ADMIN.is_subset_of(bound));
        assert!(CapSet::NET_BIND_SERVICE.is_subset_of(bound));
    }

    #[test]
    fn subset_and_difference() {
        let small = CapSet::KILL;
        let big = CapSet::pid_ns_group();
        assert!(small.is_subset_of(big));
        assert!(!big.is_subset_of(small));
        assert!(big.without(big).is_empty());
    }
}
