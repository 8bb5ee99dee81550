//! Host CPU topology discovery from sysfs.
//!
//! The cpu distribution pass needs to know which hardware threads share a
//! physical core and which belong to which NUMA node. Everything comes
//! from `/sys/devices/system`; the root is injected so tests can run
//! against a fixture tree.

use std::path::{Path, PathBuf};

use arbor_common::cpumask::CpuMask;
use arbor_common::error::{ArborError, Result};

/// Snapshot of the host's cpu layout.
#[derive(Debug, Clone, Default)]
pub struct CpuTopology {
    /// Online cpus.
    pub online: CpuMask,
    /// Per-cpu mask of sibling threads sharing the physical core,
    /// indexed by cpu id. Offline cpus hold an empty mask.
    pub core_threads: Vec<CpuMask>,
    /// Online NUMA nodes.
    pub nodes: CpuMask,
    /// Per-node cpu masks, indexed by node id.
    pub node_threads: Vec<CpuMask>,
}

impl CpuTopology {
    /// Reads the topology from a sysfs root.
    ///
    /// # Errors
    ///
    /// Returns an error if the online cpu list is unreadable; missing
    /// sibling or node files degrade to single-thread cores.
    pub fn read(sysfs_root: &Path) -> Result<Self> {
        let cpu_dir = sysfs_root.join("devices/system/cpu");
        let online = read_mask(&cpu_dir.join("online"))?;

        let mut core_threads = Vec::new();
        for cpu in online.iter() {
            let path = cpu_dir.join(format!("cpu{cpu}/topology/thread_siblings_list"));
            let siblings = read_mask(&path).unwrap_or_else(|_| CpuMask::from_cpus([cpu]));
            if core_threads.len() <= cpu as usize {
                core_threads.resize(cpu as usize + 1, CpuMask::new());
            }
            core_threads[cpu as usize] = siblings;
        }

        let node_dir = sysfs_root.join("devices/system/node");
        let nodes = read_mask(&node_dir.join("online")).unwrap_or_default();
        let mut node_threads = Vec::new();
        for node in nodes.iter() {
            let mask = read_mask(&node_dir.join(format!("node{node}/cpulist")))?;
            if node_threads.len() <= node as usize {
                node_threads.resize(node as usize + 1, CpuMask::new());
            }
            node_threads[node as usize] = mask;
        }

        tracing::debug!(
            online = %online,
            nodes = %nodes,
            "cpu topology discovered"
        );

        Ok(Self {
            online,
            core_threads,
            nodes,
            node_threads,
        })
    }

    /// Sibling threads of the given cpu (including itself).
    #[must_use]
    pub fn siblings(&self, cpu: u32) -> CpuMask {
        self.core_threads
            .get(cpu as usize)
            .cloned()
            .unwrap_or_else(|| CpuMask::from_cpus([cpu]))
    }

    /// Cpus of one NUMA node, if the node exists.
    #[must_use]
    pub fn node_cpus(&self, node: u32) -> Option<&CpuMask> {
        if !self.nodes.get(node) {
            return None;
        }
        self.node_threads.get(node as usize)
    }
}

fn read_mask(path: &PathBuf) -> Result<CpuMask> {
    let raw = std::fs::read_to_string(path).map_err(|e| ArborError::io(path, &e))?;
    raw.trim().parse()
}

/// Writes a fixture topology for tests: `cores` physical cores with
/// `threads_per_core` hardware threads each, one NUMA node.
///
/// # Errors
///
/// Returns an error if fixture files cannot be written.
pub fn write_fixture(sysfs_root: &Path, cores: u32, threads_per_core: u32) -> Result<()> {
    let total = cores * threads_per_core;
    let cpu_dir = sysfs_root.join("devices/system/cpu");
    std::fs::create_dir_all(&cpu_dir).map_err(|e| ArborError::io(&cpu_dir, &e))?;
    let online = CpuMask::from_cpus(0..total);
    std::fs::write(cpu_dir.join("online"), format!("{online}\n"))
        .map_err(|e| ArborError::io(&cpu_dir, &e))?;
    for cpu in 0..total {
        let core = cpu / threads_per_core;
        let siblings =
            CpuMask::from_cpus((0..threads_per_core).map(|t| core * threads_per_core + t));
        let dir = cpu_dir.join(format!("cpu{cpu}/topology"));
        std::fs::create_dir_all(&dir).map_err(|e| ArborError::io(&dir, &e))?;
        std::fs::write(dir.join("thread_siblings_list"), format!("{siblings}\n"))
            .map_err(|e| ArborError::io(&dir, &e))?;
    }
    let node_dir = sysfs_root.join("devices/system/node/node0");
    std::fs::create_dir_all(&node_dir).map_err(|e| ArborError::io(&node_dir, &e))?;
    std::fs::write(node_dir.join("cpulist"), format!("{online}\n"))
        .map_err(|e| ArborError::io(&node_dir, &e))?;
    std::fs::write(
        sysfs_root.join("devices/system/node/online"),
        "0\n",
    )
    .map_err(|e| ArborError::io(sysfs_root, &e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_topology_reads_back() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_fixture(dir.path(), 4, 2).expect("fixture");
        let topo = CpuTopology::read(dir.path()).expect("read");

        assert_eq!(topo.online.weight(), 8);
        assert_eq!(topo.siblings(0).to_string(), "0-1");
        assert_eq!(topo.siblings(7).to_string(), "6-7");
        assert_eq!(topo.node_cpus(0).expect("node 0").weight(), 8);
        assert!(topo.node_cpus(3).is_none());
    }

    #[test]
    fn missing_sibling_files_degrade_to_single_threads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cpu_dir = dir.path().join("devices/system/cpu");
        std::fs::create_dir_all(&cpu_dir).expect("mkdir");
        std::fs::write(cpu_dir.join("online"), "0-1\n").expect("seed");

        let topo = CpuTopology::read(dir.path()).expect("read");
        assert_eq!(topo.siblings(0).to_string(), "0");
        assert_eq!(topo.siblings(1).to_string(), "1");
    }
}
