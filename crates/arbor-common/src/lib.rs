//! Shared foundation for the arbor workspace.
//!
//! Carries the workspace-wide error type, domain primitive types, the CPU
//! bitmap used by the cpuset machinery, the daemon configuration model and
//! system-wide constants. Higher crates depend on this one and nothing else
//! in the workspace.

pub mod config;
pub mod constants;
pub mod cpumask;
pub mod error;
pub mod types;
