//! Kernel-facing primitives for the arbor daemon.
//!
//! Everything in this crate talks to Linux directly: the cgroup-v1 driver
//! with its per-controller helpers, host cpu topology discovery, capability
//! sets, and per-task knobs (scheduler, io priority, rlimits). Paths to
//! `/sys` and the cgroup mount are injected so all of it can run against
//! fixture trees in tests.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod caps;
pub mod cgroup;
pub mod proc;
pub mod topology;
