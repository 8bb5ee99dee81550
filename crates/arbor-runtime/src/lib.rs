//! Container lifecycle engine for the arbor daemon.
//!
//! Owns the in-memory container tree and everything that animates it: the
//! hierarchical lock manager, the property registry, the cgroup
//! provisioning pipeline, the cpu distribution pass, the event loop with
//! its waiter machinery, and the persistence adapter that rebuilds the
//! tree after a daemon restart.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod container;
pub mod engine;
pub mod events;
pub mod ids;
pub mod lifecycle;
pub mod persist;
pub mod props;
pub mod resources;
pub mod spawn;
pub mod stats;
pub mod stdio;
pub mod tree;
pub mod waiter;
