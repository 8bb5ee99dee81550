//! Resource resolver: cpu distribution and aggregated limits.
//!
//! Host cpus are partitioned among siblings in a fixed policy order, cpu
//! limits and guarantees aggregate along the tree, and memory guarantees
//! pass admission against host memory before anything starts.

use std::sync::Arc;

use arbor_common::constants::CPU_POWER_PER_SEC;
use arbor_common::cpumask::CpuMask;
use arbor_common::error::{ArborError, Result};
use arbor_common::types::{format_cpu_power, ContainerState, CpuSetSpec};
use arbor_core::cgroup::{cpu, cpuset, memory, Controller};
use arbor_core::proc::host_memory;
use arbor_core::topology::CpuTopology;

use crate::container::ContainerCell;
use crate::engine::Engine;
use crate::props::Prop;

/// Claims threads and whole cores from a vacancy mask.
///
/// Core requests take only fully vacant sibling sets. Thread requests
/// prefer threads whose siblings are already taken, so whole cores stay
/// available for later core requests; only when no such thread remains
/// do they break into a vacant core. Lowest cpu index wins ties.
///
/// Returns `(threads, cores)`: every claimed thread, and the lead cpu of
/// each claimed core. On failure the vacancy mask is left untouched.
///
/// # Errors
///
/// Fails with `ResourceNotAvailable` when the request cannot be met, or
/// when `keep_one` is set and the claim would empty the vacancy.
pub fn reserve_cpus(
    topo: &CpuTopology,
    vacant: &mut CpuMask,
    mut nr_threads: u32,
    mut nr_cores: u32,
    keep_one: bool,
) -> Result<(CpuMask, CpuMask)> {
    let mut threads = CpuMask::new();
    let mut cores = CpuMask::new();
    let mut try_thread = true;

    loop {
        for cpu in vacant.clone().iter() {
            if !vacant.get(cpu) {
                continue;
            }
            let siblings = topo.siblings(cpu);
            if siblings.is_subset_of(vacant) {
                if nr_cores > 0 {
                    nr_cores -= 1;
                    cores.set(cpu);
                    threads.add(&siblings);
                    vacant.remove(&siblings);
                } else if !try_thread && nr_threads > 0 {
                    nr_threads -= 1;
                    threads.set(cpu);
                    vacant.clear(cpu);
                    try_thread = true;
                }
            } else if nr_threads > 0 {
                nr_threads -= 1;
                threads.set(cpu);
                vacant.clear(cpu);
            }
            if nr_threads == 0 && nr_cores == 0 {
                break;
            }
        }
        if try_thread && nr_threads > 0 {
            try_thread = false;
            continue;
        }
        break;
    }

    if nr_threads > 0 || nr_cores > 0 || (keep_one && vacant.is_empty()) {
        vacant.add(&threads);
        return Err(ArborError::no_resource("not enough cpus"));
    }
    Ok((threads, cores))
}

const DISTRIBUTION_ORDER: [fn(&CpuSetSpec) -> bool; 6] = [
    |s| matches!(s, CpuSetSpec::Absolute(_)),
    |s| matches!(s, CpuSetSpec::Node(_)),
    |s| matches!(s, CpuSetSpec::Cores(_)),
    |s| matches!(s, CpuSetSpec::Threads(_)),
    |s| matches!(s, CpuSetSpec::Reserve(_)),
    |s| matches!(s, CpuSetSpec::Inherit),
];

fn skip_state(state: ContainerState) -> bool {
    matches!(state, ContainerState::Stopped | ContainerState::Dead)
}

impl Engine {
    /// Recomputes cpu affinity for the whole subtree of `cell` and writes
    /// the result to the cpuset hierarchy.
    ///
    /// The subtree is walked parents first; each parent resets its
    /// vacancy to its affinity and hands cpus to children in the policy
    /// order absolute, node, cores, threads, reserve, inherit. Kernel
    /// writes happen in two passes: first every changed cgroup is widened
    /// to this subtree root's affinity (parents first), then narrowed to
    /// its exact mask (children first), so no task is ever affine to an
    /// empty set.
    ///
    /// # Errors
    ///
    /// Fails with `ResourceNotAvailable` when a child cannot be placed
    /// and on unexpected kernel errors.
    pub fn distribute_cpus(&self, cell: &Arc<ContainerCell>) -> Result<()> {
        let _serialize = self.cpu_lock.lock().unwrap_or_else(|e| e.into_inner());

        if cell.is_root() {
            let topo = CpuTopology::read(&self.config.sysfs_root)?;
            {
                let mut data = cell.write();
                data.cpu_affinity = topo.online.clone();
            }
            *self.topology.lock().unwrap_or_else(|e| e.into_inner()) = topo;
        }
        let topo = self
            .topology
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        {
            let mut data = cell.write();
            data.cpu_vacant = data.cpu_affinity.clone();
        }

        let subtree = self.tree.subtree_parents_first(cell.id);

        for parent in &subtree {
            if !parent.is_root() && skip_state(parent.state()) {
                continue;
            }
            let children = self.tree.children(parent.id);
            if children.is_empty() {
                continue;
            }
            tracing::debug!(
                parent = %parent.name,
                vacant = %parent.read().cpu_vacant,
                "distributing cpus"
            );

            let mut vacant_guarantee: u64 = 0;

            for pass in DISTRIBUTION_ORDER {
                for child in &children {
                    if skip_state(child.state()) || !pass(&child.read().cpu_set) {
                        continue;
                    }
                    let spec = child.read().cpu_set.clone();
                    let parent_affinity = parent.read().cpu_affinity.clone();
                    let mut reserve = CpuMask::new();

                    let affinity = match &spec {
                        CpuSetSpec::Inherit => parent.read().cpu_vacant.clone(),
                        CpuSetSpec::Absolute(list) => list.parse::<CpuMask>()?,
                        CpuSetSpec::Node(node) => topo
                            .node_cpus(*node)
                            .cloned()
                            .ok_or_else(|| {
                                ArborError::no_resource(format!(
                                    "numa node {node} not found for {}",
                                    child.name
                                ))
                            })?,
                        CpuSetSpec::Cores(n) => {
                            let mut vacant = parent.read().cpu_vacant.clone();
                            let (threads, _cores) =
                                reserve_cpus(&topo, &mut vacant, 0, *n, parent.is_root())?;
                            parent.write().cpu_vacant = vacant;
                            reserve = threads.clone();
                            threads
                        }
                        CpuSetSpec::Threads(n) => {
                            let mut vacant = parent.read().cpu_vacant.clone();
                            let (threads, _cores) =
                                reserve_cpus(&topo, &mut vacant, *n, 0, parent.is_root())?;
                            parent.write().cpu_vacant = vacant;
                            reserve = threads.clone();
                            threads
                        }
                        CpuSetSpec::Reserve(n) => {
                            let mut vacant = parent.read().cpu_vacant.clone();
                            let (threads, _cores) =
                                reserve_cpus(&topo, &mut vacant, *n, 0, parent.is_root())?;
                            parent.write().cpu_vacant = vacant;
                            reserve = threads;
                            parent_affinity.clone()
                        }
                    };

                    if affinity.is_empty() || !affinity.is_subset_of(&parent_affinity) {
                        return Err(ArborError::no_resource(format!(
                            "not enough cpus for {}",
                            child.name
                        )));
                    }

                    let mut data = child.write();
                    if data.cpu_affinity != affinity {
                        data.cpu_affinity = affinity;
                        data.prop_set.set(Prop::CpuSetAffinity);
                        data.prop_dirty.set(Prop::CpuSetAffinity);
                    }
                    data.cpu_reserve = reserve;
                    data.cpu_vacant = data.cpu_affinity.clone();
                    if data.cpu_reserve.is_empty() {
                        vacant_guarantee = vacant_guarantee
                            .saturating_add(data.cpu_guarantee.max(data.cpu_guarantee_sum));
                    } else {
                        tracing::info!(
                            name = %child.name,
                            reserve = %data.cpu_reserve,
                            "cpus reserved"
                        );
                    }
                    tracing::debug!(name = %child.name, cpus = %data.cpu_affinity, "cpus assigned");
                }
            }

            let parent_data = parent.read();
            let vacant_weight = u64::from(parent_data.cpu_vacant.weight());
            if vacant_guarantee > vacant_weight * CPU_POWER_PER_SEC {
                if parent_data.cpu_vacant != parent_data.cpu_affinity {
                    return Err(ArborError::no_resource(format!(
                        "not enough cpus for cpu_guarantee in {}",
                        parent.name
                    )));
                }
                tracing::warn!(
                    name = %parent.name,
                    wanted = %format_cpu_power(vacant_guarantee),
                    "cpu guarantee overcommit"
                );
            }
        }

        let wide = cell.read().cpu_affinity.clone();

        // widen first so narrowing later never strands a task
        for ct in &subtree {
            if Arc::ptr_eq(ct, cell) || skip_state(ct.state()) {
                continue;
            }
            let pending = {
                let data = ct.read();
                data.controllers.contains(Controller::Cpuset)
                    && data.prop_dirty.has(Prop::CpuSetAffinity)
            };
            if !pending {
                continue;
            }
            let cg = self.get_cgroup(ct, Controller::Cpuset)?;
            if cg.exists() {
                cpuset::set_cpus(&cg, &wide)?;
            }
        }

        for ct in subtree.iter().rev() {
            if Arc::ptr_eq(ct, cell) || skip_state(ct.state()) {
                continue;
            }
            let exact = {
                let mut data = ct.write();
                if !data.controllers.contains(Controller::Cpuset)
                    || !data.prop_dirty.take(Prop::CpuSetAffinity)
                {
                    continue;
                }
                data.cpu_affinity.clone()
            };
            let cg = self.get_cgroup(ct, Controller::Cpuset)?;
            if !cg.exists() {
                continue;
            }
            cpuset::set_cpus(&cg, &exact)?;
            cpuset::set_mems(&cg, "")?;
        }

        Ok(())
    }

    /// Recomputes the aggregated cpu limit along the ancestor chain,
    /// stopping at the first ancestor whose cached sum is unchanged.
    pub fn propagate_cpu_limit(&self, cell: &Arc<ContainerCell>) {
        let max = self.root().read().cpu_limit;
        let mut chain = vec![Arc::clone(cell)];
        chain.extend(self.tree.ancestors(cell.id));

        for ct in chain {
            let mut sum: u64 = 0;
            {
                let data = ct.read();
                let state = ct.state();
                if state == ContainerState::Running
                    || (state == ContainerState::Starting && !ct.is_meta())
                {
                    sum += if data.cpu_limit != 0 { data.cpu_limit } else { max };
                }
            }
            for child in self.tree.children(ct.id) {
                let data = child.read();
                let state = child.state();
                let limit = if data.cpu_limit != 0 { data.cpu_limit } else { max };
                if state == ContainerState::Running
                    || (state == ContainerState::Starting && !child.is_meta())
                {
                    sum += limit;
                } else if state == ContainerState::Meta {
                    sum += limit.min(data.cpu_limit_sum);
                }
            }
            let mut data = ct.write();
            if data.cpu_limit_sum == sum {
                break;
            }
            tracing::debug!(
                name = %ct.name,
                sum = %format_cpu_power(sum),
                "cpu limit sum updated"
            );
            data.cpu_limit_sum = sum;
        }
    }

    fn set_cpu_limit(&self, cell: &Arc<ContainerCell>, limit: u64) -> Result<()> {
        let (period, policy, current) = {
            let data = cell.read();
            (data.cpu_period, data.cpu_policy, data.cpu_limit_cur)
        };
        tracing::info!(
            name = %cell.name,
            from = %format_cpu_power(current),
            to = %format_cpu_power(limit),
            "set cpu limit"
        );
        let cg = self.get_cgroup(cell, Controller::Cpu)?;
        if let Err(e) = cpu::set_rt_limit(&cg, period, limit) {
            if policy == arbor_common::types::CpuPolicy::Rt {
                return Err(e);
            }
            tracing::warn!(name = %cell.name, error = %e, "cannot set rt cpu limit");
        }
        cpu::set_limit(&cg, period, limit)?;
        cell.write().cpu_limit_cur = limit;
        Ok(())
    }

    /// Applies the container's cpu limit, pushing a tightened limit down
    /// to descendants first so the subtree never transiently exceeds it.
    /// A limit no tighter than an ancestor's is written as unlimited.
    ///
    /// # Errors
    ///
    /// Returns the first kernel failure.
    pub fn apply_cpu_limit(&self, cell: &Arc<ContainerCell>) -> Result<()> {
        let mut limit = cell.read().cpu_limit;
        for ancestor in self.tree.ancestors(cell.id) {
            let up = ancestor.read().cpu_limit;
            if up != 0 && up <= limit {
                tracing::info!(
                    name = %cell.name,
                    ancestor = %ancestor.name,
                    "ancestor limit is tighter, disabling own cpu limit"
                );
                limit = 0;
                break;
            }
        }

        let subtree = self.tree.subtree_parents_first(cell.id);

        let current = cell.read().cpu_limit_cur;
        if limit != 0 && (limit < current || current == 0) {
            for ct in &subtree {
                if Arc::ptr_eq(ct, cell) || ct.state() == ContainerState::Stopped {
                    continue;
                }
                let above = {
                    let data = ct.read();
                    data.controllers.contains(Controller::Cpu) && data.cpu_limit_cur > limit
                };
                if above {
                    self.set_cpu_limit(ct, limit)?;
                }
            }
        }

        self.set_cpu_limit(cell, limit)?;

        for ct in &subtree {
            if Arc::ptr_eq(ct, cell) || ct.state() == ContainerState::Stopped {
                continue;
            }
            if !ct.read().controllers.contains(Controller::Cpu) {
                continue;
            }
            let mut effective = ct.read().cpu_limit;
            if effective != 0 {
                for ancestor in self.tree.ancestors(ct.id) {
                    let up = ancestor.read().cpu_limit;
                    if up != 0 && up <= effective {
                        effective = 0;
                        break;
                    }
                }
            }
            if effective != ct.read().cpu_limit_cur {
                self.set_cpu_limit(ct, effective)?;
            }
        }

        Ok(())
    }

    /// Recomputes and applies the cpu guarantee of one container from its
    /// own value and its live children's aggregates.
    ///
    /// # Errors
    ///
    /// Returns the kernel failure when the shares cannot be written.
    pub fn apply_cpu_guarantee(&self, cell: &Arc<ContainerCell>) -> Result<()> {
        let mut sum: u64 = 0;
        for child in self.tree.children(cell.id) {
            if matches!(
                child.state(),
                ContainerState::Running
                    | ContainerState::Meta
                    | ContainerState::Starting
                    | ContainerState::Stopping
            ) {
                let data = child.read();
                sum += data.cpu_guarantee.max(data.cpu_guarantee_sum);
            }
        }
        let (own, current, policy, weight) = {
            let mut data = cell.write();
            data.cpu_guarantee_sum = sum;
            (
                data.cpu_guarantee,
                data.cpu_guarantee_cur,
                data.cpu_policy,
                data.cpu_weight,
            )
        };
        let wanted = own.max(sum);
        if cell.is_root()
            || !cell.read().controllers.contains(Controller::Cpu)
            || wanted == current
        {
            return Ok(());
        }
        tracing::info!(
            name = %cell.name,
            from = %format_cpu_power(current),
            to = %format_cpu_power(wanted),
            "set cpu guarantee"
        );
        let cg = self.get_cgroup(cell, Controller::Cpu)?;
        cpu::set_guarantee(&cg, policy, weight, wanted)?;
        cell.write().cpu_guarantee_cur = wanted;
        Ok(())
    }

    /// Admission check: the aggregated memory guarantee of the whole tree
    /// plus the configured reserve must fit in host memory.
    ///
    /// # Errors
    ///
    /// Fails with `ResourceNotAvailable` on overcommit.
    pub fn check_mem_guarantee(&self) -> Result<()> {
        let total = host_memory(&self.proc_root)?;
        let usage = self.total_mem_guarantee(&self.root());
        let reserve = self.config.daemon.memory_guarantee_reserve;
        if usage.saturating_add(reserve) > total {
            return Err(ArborError::no_resource(format!(
                "memory guarantee overcommit by {} bytes",
                usage + reserve - total
            )));
        }
        Ok(())
    }

    /// Aggregated guarantee of a subtree: the maximum of the container's
    /// own staged guarantee and the sum over its children. Stopped
    /// containers hold no guarantee.
    #[must_use]
    pub fn total_mem_guarantee(&self, cell: &Arc<ContainerCell>) -> u64 {
        if !cell.is_root() && cell.state() == ContainerState::Stopped {
            return 0;
        }
        let sum: u64 = self
            .tree
            .children(cell.id)
            .iter()
            .map(|child| self.total_mem_guarantee(child))
            .sum();
        cell.read().new_mem_guarantee.max(sum)
    }

    /// Tightest memory limit over a subtree: a meta container without an
    /// own limit is bounded by the sum of its children's totals, clamped
    /// by ancestor limits.
    #[must_use]
    pub fn total_mem_limit(&self, cell: &Arc<ContainerCell>) -> u64 {
        let mut limit: u64 = 0;
        if cell.is_meta() {
            for child in self.tree.children(cell.id) {
                if child.state() == ContainerState::Stopped {
                    continue;
                }
                let child_limit = self.total_mem_limit(&child);
                if child_limit == 0 || child_limit > u64::MAX - limit {
                    limit = 0;
                    break;
                }
                limit += child_limit;
            }
        }
        let mut chain = vec![Arc::clone(cell)];
        chain.extend(self.tree.ancestors(cell.id));
        for ct in chain {
            let own = ct.read().mem_limit;
            if own != 0 && (limit == 0 || own < limit) {
                limit = own;
            }
        }
        limit
    }

    /// Applies the dead-memory soft limit along the ancestor chain: dead
    /// and hollow-meta containers with `pressurize_on_death` get squeezed,
    /// everything else is restored to unlimited.
    ///
    /// # Errors
    ///
    /// Returns the first kernel failure.
    pub fn update_soft_limit(&self, cell: &Arc<ContainerCell>) -> Result<()> {
        let mut chain = vec![Arc::clone(cell)];
        chain.extend(self.tree.ancestors(cell.id));
        for ct in chain {
            if ct.is_root() || !ct.read().controllers.contains(Controller::Memory) {
                continue;
            }
            let (starting, running) = self.tree.child_counters(ct.id);
            let squeeze = ct.read().pressurize_on_death
                && (ct.state() == ContainerState::Dead
                    || (ct.state() == ContainerState::Meta && starting == 0 && running == 0));
            let wanted: i64 = if squeeze {
                i64::try_from(self.config.daemon.dead_memory_soft_limit).unwrap_or(i64::MAX)
            } else {
                -1
            };
            if ct.read().mem_soft_limit == wanted {
                continue;
            }
            let cg = self.get_cgroup(&ct, Controller::Memory)?;
            if cg.exists() {
                memory::set_soft_limit(&cg, wanted)?;
            }
            ct.write().mem_soft_limit = wanted;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use arbor_core::topology::write_fixture;

    use super::*;

    fn topo_4x2() -> CpuTopology {
        let dir = tempfile::tempdir().expect("tempdir");
        write_fixture(dir.path(), 4, 2).expect("fixture");
        CpuTopology::read(dir.path()).expect("read")
    }

    #[test]
    fn cores_take_whole_sibling_sets() {
        let topo = topo_4x2();
        let mut vacant = topo.online.clone();
        let (threads, cores) = reserve_cpus(&topo, &mut vacant, 0, 2, true).expect("reserve");
        assert_eq!(threads.to_string(), "0-3");
        assert_eq!(cores.weight(), 2);
        assert_eq!(vacant.to_string(), "4-7");
    }

    #[test]
    fn threads_prefer_broken_cores() {
        let topo = topo_4x2();
        let mut vacant: CpuMask = "1-7".parse().expect("mask");
        // cpu 1's sibling 0 is taken, so the first thread request must
        // land there instead of breaking core 1
        let (threads, _) = reserve_cpus(&topo, &mut vacant, 1, 0, false).expect("reserve");
        assert_eq!(threads.to_string(), "1");
        assert_eq!(vacant.to_string(), "2-7");
    }

    #[test]
    fn threads_break_vacant_core_when_needed() {
        let topo = topo_4x2();
        let mut vacant: CpuMask = "2-3".parse().expect("mask");
        let (threads, _) = reserve_cpus(&topo, &mut vacant, 1, 0, false).expect("reserve");
        assert_eq!(threads.to_string(), "2");
        assert_eq!(vacant.to_string(), "3");
    }

    #[test]
    fn unsatisfiable_request_restores_vacancy() {
        let topo = topo_4x2();
        let mut vacant: CpuMask = "0-2".parse().expect("mask");
        let err = reserve_cpus(&topo, &mut vacant, 0, 2, false).unwrap_err();
        assert_eq!(err.kind(), arbor_common::error::ErrorKind::ResourceNotAvailable);
        assert_eq!(vacant.to_string(), "0-2");
    }

    #[test]
    fn root_keeps_one_cpu_vacant() {
        let topo = topo_4x2();
        let mut vacant = topo.online.clone();
        assert!(reserve_cpus(&topo, &mut vacant, 0, 4, true).is_err());
        assert_eq!(vacant, topo.online);
        let (threads, _) = reserve_cpus(&topo, &mut vacant, 0, 3, true).expect("three fit");
        assert_eq!(threads.weight(), 6);
    }
}
