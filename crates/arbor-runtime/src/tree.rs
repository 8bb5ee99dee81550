//! Container registry and hierarchical subtree locking.
//!
//! One mutex and condvar guard the name registry, the parent/child links,
//! the id pool and every per-node lock counter. Operations take a read or
//! write lock on a node before touching its subtree; a write lock excludes
//! readers and writers on the node, on every descendant and on every
//! ancestor. Long kernel work happens outside the mutex while the logical
//! lock stays held.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::ThreadId;

use arbor_common::error::{ArborError, Result};
use arbor_common::types::{ContainerState, CtId};

use crate::container::ContainerCell;
use crate::ids::IdMap;

#[derive(Debug, Default)]
struct LockState {
    /// Positive: read holders; negative: one write holder.
    locked: i32,
    /// A writer is waiting; blocks new readers.
    pending_write: bool,
    /// Read locks held somewhere below this node.
    subtree_read: u32,
    /// Write locks held somewhere below this node.
    subtree_write: u32,
    /// Last thread that took the lock, for diagnostics.
    last_owner: Option<ThreadId>,
}

#[derive(Debug)]
struct Entry {
    cell: Arc<ContainerCell>,
    children: Vec<CtId>,
    lock: LockState,
    starting_children: u32,
    running_children: u32,
}

#[derive(Debug, Default)]
struct TreeInner {
    by_name: HashMap<String, CtId>,
    entries: HashMap<CtId, Entry>,
    ids: IdMap,
}

/// The container registry with its lock manager.
#[derive(Debug)]
pub struct Tree {
    inner: Mutex<TreeInner>,
    cond: Condvar,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

impl Tree {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TreeInner {
                by_name: HashMap::new(),
                entries: HashMap::new(),
                ids: IdMap::new(),
            }),
            cond: Condvar::new(),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, TreeInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocates the least available user id.
    ///
    /// # Errors
    ///
    /// Fails when the id space is exhausted.
    pub fn alloc_id(&self) -> Result<CtId> {
        self.lock_inner().ids.get()
    }

    /// Claims a specific id for restore or service containers.
    ///
    /// # Errors
    ///
    /// Fails when the id is out of range or taken.
    pub fn alloc_id_at(&self, id: u32) -> Result<CtId> {
        self.lock_inner().ids.get_at(id)
    }

    /// Returns an unused id to the pool without a registration.
    pub fn release_id(&self, id: CtId) {
        self.lock_inner().ids.put(id);
    }

    /// Registers a cell under its name and links it to its parent.
    ///
    /// # Errors
    ///
    /// Fails when the name is already taken.
    pub fn register(&self, cell: Arc<ContainerCell>) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.by_name.contains_key(&cell.name) {
            return Err(ArborError::new(
                arbor_common::error::ErrorKind::ContainerAlreadyExists,
                format!("container {} already exists", cell.name),
            ));
        }
        if let Some(parent) = cell.parent {
            let entry = inner
                .entries
                .get_mut(&parent)
                .unwrap_or_else(|| panic!("parent {parent} not registered"));
            entry.children.push(cell.id);
        }
        inner.by_name.insert(cell.name.clone(), cell.id);
        inner.entries.insert(
            cell.id,
            Entry {
                cell,
                children: Vec::new(),
                lock: LockState::default(),
                starting_children: 0,
                running_children: 0,
            },
        );
        Ok(())
    }

    /// Unregisters a stopped container: unlinks it from the parent,
    /// returns its id and marks the cell destroyed.
    ///
    /// # Panics
    ///
    /// Panics when the container is not stopped; destroy must stop first.
    pub fn unregister(&self, id: CtId) {
        let mut inner = self.lock_inner();
        let Some(entry) = inner.entries.remove(&id) else {
            return;
        };
        assert_eq!(
            entry.cell.state(),
            ContainerState::Stopped,
            "unregister of a non-stopped container {}",
            entry.cell.name
        );
        inner.by_name.remove(&entry.cell.name);
        if let Some(parent) = entry.cell.parent {
            if let Some(parent_entry) = inner.entries.get_mut(&parent) {
                parent_entry.children.retain(|c| *c != id);
            }
        }
        inner.ids.put(id);
        entry.cell.store_state(ContainerState::Destroyed);
        self.cond.notify_all();
    }

    /// Looks a container up by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<ContainerCell>> {
        let inner = self.lock_inner();
        let id = inner.by_name.get(name)?;
        inner.entries.get(id).map(|e| Arc::clone(&e.cell))
    }

    /// Looks a container up by name, failing when it is gone.
    ///
    /// # Errors
    ///
    /// Fails with `ContainerDoesNotExist`.
    pub fn require(&self, name: &str) -> Result<Arc<ContainerCell>> {
        self.find(name)
            .ok_or_else(|| ArborError::no_container(format!("container {name} not found")))
    }

    /// Looks a container up by id.
    #[must_use]
    pub fn cell(&self, id: CtId) -> Option<Arc<ContainerCell>> {
        let inner = self.lock_inner();
        inner.entries.get(&id).map(|e| Arc::clone(&e.cell))
    }

    /// All container names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let inner = self.lock_inner();
        let mut names: Vec<String> = inner.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of a node's children.
    #[must_use]
    pub fn children(&self, id: CtId) -> Vec<Arc<ContainerCell>> {
        let inner = self.lock_inner();
        let Some(entry) = inner.entries.get(&id) else {
            return Vec::new();
        };
        entry
            .children
            .iter()
            .filter_map(|c| inner.entries.get(c))
            .map(|e| Arc::clone(&e.cell))
            .collect()
    }

    /// Ancestors from the parent up to the root.
    #[must_use]
    pub fn ancestors(&self, id: CtId) -> Vec<Arc<ContainerCell>> {
        let inner = self.lock_inner();
        let mut out = Vec::new();
        let mut cursor = inner.entries.get(&id).and_then(|e| e.cell.parent);
        while let Some(pid) = cursor {
            let Some(entry) = inner.entries.get(&pid) else { break };
            out.push(Arc::clone(&entry.cell));
            cursor = entry.cell.parent;
        }
        out
    }

    /// Subtree including `id`, children before parents.
    #[must_use]
    pub fn subtree_children_first(&self, id: CtId) -> Vec<Arc<ContainerCell>> {
        let mut parents_first = self.subtree_parents_first(id);
        parents_first.reverse();
        parents_first
    }

    /// Subtree including `id`, parents before children.
    #[must_use]
    pub fn subtree_parents_first(&self, id: CtId) -> Vec<Arc<ContainerCell>> {
        let inner = self.lock_inner();
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            let Some(entry) = inner.entries.get(&next) else { continue };
            out.push(Arc::clone(&entry.cell));
            for child in entry.children.iter().rev() {
                stack.push(*child);
            }
        }
        out
    }

    /// Starting/running child counters of a node.
    #[must_use]
    pub fn child_counters(&self, id: CtId) -> (u32, u32) {
        let inner = self.lock_inner();
        inner
            .entries
            .get(&id)
            .map(|e| (e.starting_children, e.running_children))
            .unwrap_or_default()
    }

    /// Finds the container whose wait or seize pid matches.
    #[must_use]
    pub fn find_by_pid(&self, pid: i32) -> Option<Arc<ContainerCell>> {
        let inner = self.lock_inner();
        inner
            .entries
            .values()
            .find(|e| {
                let data = e.cell.read();
                data.wait_pid == Some(pid) || data.seize_pid == Some(pid)
            })
            .map(|e| Arc::clone(&e.cell))
    }

    /// Moves a container to a new state, maintains the ancestors'
    /// starting/running counters, and returns the cells whose waiters
    /// must be notified (outside any tree lock).
    #[must_use]
    pub fn set_state(&self, cell: &Arc<ContainerCell>, next: ContainerState) -> Vec<Arc<ContainerCell>> {
        let prev = cell.state();
        if prev == next {
            return Vec::new();
        }
        tracing::info!(id = %cell.id, name = %cell.name, from = %prev, to = %next, "state change");

        let mut notify = Vec::new();
        {
            let mut inner = self.lock_inner();
            cell.store_state(next);

            if prev == ContainerState::Starting || next == ContainerState::Starting {
                let delta: i32 = if next == ContainerState::Starting { 1 } else { -1 };
                let mut cursor = cell.parent;
                while let Some(pid) = cursor {
                    let Some(entry) = inner.entries.get_mut(&pid) else { break };
                    entry.starting_children = entry.starting_children.saturating_add_signed(delta);
                    cursor = entry.cell.parent;
                }
            }

            if prev == ContainerState::Running || next == ContainerState::Running {
                let delta: i32 = if next == ContainerState::Running { 1 } else { -1 };
                let mut cursor = cell.parent;
                while let Some(pid) = cursor {
                    let Some(entry) = inner.entries.get_mut(&pid) else { break };
                    entry.running_children = entry.running_children.saturating_add_signed(delta);
                    if entry.running_children == 0
                        && entry.cell.state() == ContainerState::Meta
                    {
                        notify.push(Arc::clone(&entry.cell));
                    }
                    cursor = entry.cell.parent;
                }
            }
        }
        self.cond.notify_all();

        if !next.is_transient() {
            notify.push(Arc::clone(cell));
        }
        notify
    }

    fn lock_blocked(inner: &TreeInner, id: CtId, for_read: bool) -> bool {
        let Some(entry) = inner.entries.get(&id) else {
            return false;
        };
        let lock = &entry.lock;
        let mut busy = if for_read {
            lock.locked < 0 || lock.pending_write || lock.subtree_write > 0
        } else {
            lock.locked != 0 || lock.subtree_read > 0 || lock.subtree_write > 0
        };
        let mut cursor = entry.cell.parent;
        while !busy {
            let Some(pid) = cursor else { break };
            let Some(parent) = inner.entries.get(&pid) else { break };
            busy = parent.lock.pending_write
                || if for_read {
                    parent.lock.locked < 0
                } else {
                    parent.lock.locked != 0
                };
            cursor = parent.cell.parent;
        }
        busy
    }

    /// Acquires a subtree lock, blocking unless `try_lock`.
    ///
    /// # Errors
    ///
    /// Fails with `Busy` on a contended `try_lock` and with
    /// `ContainerDoesNotExist` when the container is destroyed while
    /// waiting.
    pub fn acquire(
        &self,
        cell: &Arc<ContainerCell>,
        for_read: bool,
        try_lock: bool,
    ) -> Result<TreeGuard<'_>> {
        tracing::trace!(
            id = %cell.id,
            mode = if for_read { "read" } else { "write" },
            "lock subtree"
        );
        let mut inner = self.lock_inner();
        loop {
            if cell.state() == ContainerState::Destroyed {
                return Err(ArborError::no_container(format!(
                    "container {} was destroyed",
                    cell.name
                )));
            }
            if !Self::lock_blocked(&inner, cell.id, for_read) {
                break;
            }
            if try_lock {
                return Err(ArborError::busy(format!("container {} is busy", cell.name)));
            }
            if !for_read {
                if let Some(entry) = inner.entries.get_mut(&cell.id) {
                    entry.lock.pending_write = true;
                }
            }
            inner = self
                .cond
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }

        let entry = inner
            .entries
            .get_mut(&cell.id)
            .expect("destroyed state checked above");
        entry.lock.pending_write = false;
        entry.lock.locked += if for_read { 1 } else { -1 };
        entry.lock.last_owner = Some(std::thread::current().id());

        let mut cursor = cell.parent;
        while let Some(pid) = cursor {
            let Some(parent) = inner.entries.get_mut(&pid) else { break };
            if for_read {
                parent.lock.subtree_read += 1;
            } else {
                parent.lock.subtree_write += 1;
            }
            cursor = parent.cell.parent;
        }

        Ok(TreeGuard {
            tree: self,
            cell: Arc::clone(cell),
            for_read,
            released: false,
        })
    }

    /// Blocking read lock on a subtree.
    ///
    /// # Errors
    ///
    /// See [`Tree::acquire`].
    pub fn lock_read(&self, cell: &Arc<ContainerCell>) -> Result<TreeGuard<'_>> {
        self.acquire(cell, true, false)
    }

    /// Blocking write lock on a subtree.
    ///
    /// # Errors
    ///
    /// See [`Tree::acquire`].
    pub fn lock_write(&self, cell: &Arc<ContainerCell>) -> Result<TreeGuard<'_>> {
        self.acquire(cell, false, false)
    }

    /// Non-blocking write lock on a subtree.
    ///
    /// # Errors
    ///
    /// See [`Tree::acquire`].
    pub fn try_lock_write(&self, cell: &Arc<ContainerCell>) -> Result<TreeGuard<'_>> {
        self.acquire(cell, false, true)
    }

    fn release(&self, cell: &ContainerCell, for_read: bool) {
        let mut inner = self.lock_inner();
        if let Some(entry) = inner.entries.get_mut(&cell.id) {
            debug_assert!(if for_read {
                entry.lock.locked > 0
            } else {
                entry.lock.locked < 0
            });
            entry.lock.locked += if for_read { -1 } else { 1 };
        }
        let mut cursor = cell.parent;
        while let Some(pid) = cursor {
            let Some(parent) = inner.entries.get_mut(&pid) else { break };
            if for_read {
                parent.lock.subtree_read = parent.lock.subtree_read.saturating_sub(1);
            } else {
                parent.lock.subtree_write = parent.lock.subtree_write.saturating_sub(1);
            }
            cursor = parent.cell.parent;
        }
        drop(inner);
        self.cond.notify_all();
    }

    fn downgrade(&self, cell: &ContainerCell) {
        let mut inner = self.lock_inner();
        if let Some(entry) = inner.entries.get_mut(&cell.id) {
            debug_assert_eq!(entry.lock.locked, -1, "downgrade without a write lock");
            entry.lock.locked = 1;
        }
        let mut cursor = cell.parent;
        while let Some(pid) = cursor {
            let Some(parent) = inner.entries.get_mut(&pid) else { break };
            parent.lock.subtree_write = parent.lock.subtree_write.saturating_sub(1);
            parent.lock.subtree_read += 1;
            cursor = parent.cell.parent;
        }
        drop(inner);
        self.cond.notify_all();
    }

    fn upgrade(&self, cell: &ContainerCell) {
        let mut inner = self.lock_inner();
        if let Some(entry) = inner.entries.get_mut(&cell.id) {
            entry.lock.pending_write = true;
        }
        let mut cursor = cell.parent;
        while let Some(pid) = cursor {
            let Some(parent) = inner.entries.get_mut(&pid) else { break };
            parent.lock.subtree_read = parent.lock.subtree_read.saturating_sub(1);
            parent.lock.subtree_write += 1;
            cursor = parent.cell.parent;
        }
        loop {
            let locked = inner
                .entries
                .get(&cell.id)
                .map(|e| e.lock.locked)
                .unwrap_or(1);
            if locked == 1 {
                break;
            }
            inner = self
                .cond
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
        if let Some(entry) = inner.entries.get_mut(&cell.id) {
            entry.lock.locked = -1;
            entry.lock.pending_write = false;
            entry.lock.last_owner = Some(std::thread::current().id());
        }
    }

    /// Logs every held or pending lock.
    pub fn dump_locks(&self) {
        let inner = self.lock_inner();
        for entry in inner.entries.values() {
            let lock = &entry.lock;
            if lock.locked != 0 || lock.pending_write || lock.subtree_read > 0 || lock.subtree_write > 0
            {
                tracing::info!(
                    id = %entry.cell.id,
                    name = %entry.cell.name,
                    locked = lock.locked,
                    owner = ?lock.last_owner,
                    subtree_read = lock.subtree_read,
                    subtree_write = lock.subtree_write,
                    pending_write = lock.pending_write,
                    "lock held"
                );
            }
        }
    }
}

/// Held subtree lock; releases on drop.
#[derive(Debug)]
pub struct TreeGuard<'t> {
    tree: &'t Tree,
    cell: Arc<ContainerCell>,
    for_read: bool,
    released: bool,
}

impl TreeGuard<'_> {
    /// Converts a held write lock to a read lock so long kernel work can
    /// run while queries proceed.
    pub fn downgrade(&mut self) {
        assert!(!self.for_read, "downgrade of a read lock");
        tracing::trace!(id = %self.cell.id, "downgrade write to read");
        self.tree.downgrade(&self.cell);
        self.for_read = true;
    }

    /// Converts the read lock back to a write lock, waiting out other
    /// readers.
    pub fn upgrade(&mut self) {
        assert!(self.for_read, "upgrade of a write lock");
        tracing::trace!(id = %self.cell.id, "upgrade read back to write");
        self.tree.upgrade(&self.cell);
        self.for_read = false;
    }

    /// The locked container.
    #[must_use]
    pub fn cell(&self) -> &Arc<ContainerCell> {
        &self.cell
    }
}

impl Drop for TreeGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.tree.release(&self.cell, self.for_read);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use arbor_common::config::ArborConfig;
    use arbor_core::cgroup::ControllerSet;

    use super::*;

    fn build_tree() -> (Tree, Arc<ContainerCell>, Arc<ContainerCell>, Arc<ContainerCell>) {
        let tree = Tree::new();
        let config = ArborConfig::default();
        let root = Arc::new(ContainerCell::new(
            tree.alloc_id_at(1).expect("root id"),
            "/".to_string(),
            None,
            &config,
            ControllerSet::empty(),
        ));
        tree.register(Arc::clone(&root)).expect("register root");
        let a = Arc::new(ContainerCell::new(
            tree.alloc_id().expect("id"),
            "a".to_string(),
            Some((&root, root.id)),
            &config,
            ControllerSet::empty(),
        ));
        tree.register(Arc::clone(&a)).expect("register a");
        let b = Arc::new(ContainerCell::new(
            tree.alloc_id().expect("id"),
            "a/b".to_string(),
            Some((&a, a.id)),
            &config,
            ControllerSet::empty(),
        ));
        tree.register(Arc::clone(&b)).expect("register b");
        (tree, root, a, b)
    }

    #[test]
    fn register_find_unregister() {
        let (tree, _root, a, b) = build_tree();
        assert_eq!(tree.require("a/b").expect("find").id, b.id);
        assert_eq!(tree.children(a.id).len(), 1);
        tree.unregister(b.id);
        assert!(tree.find("a/b").is_none());
        assert_eq!(b.state(), ContainerState::Destroyed);
        assert!(tree.children(a.id).is_empty());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let (tree, root, _a, _b) = build_tree();
        let config = ArborConfig::default();
        let dup = Arc::new(ContainerCell::new(
            tree.alloc_id().expect("id"),
            "a".to_string(),
            Some((&root, root.id)),
            &config,
            ControllerSet::empty(),
        ));
        assert!(tree.register(dup).is_err());
    }

    #[test]
    fn subtree_orders() {
        let (tree, root, a, b) = build_tree();
        let down: Vec<CtId> = tree
            .subtree_parents_first(root.id)
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(down, vec![root.id, a.id, b.id]);
        let up: Vec<CtId> = tree
            .subtree_children_first(root.id)
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(up, vec![b.id, a.id, root.id]);
    }

    #[test]
    fn read_locks_share_write_locks_exclude() {
        let (tree, _root, a, _b) = build_tree();
        let g1 = tree.lock_read(&a).expect("read 1");
        let _g2 = tree.lock_read(&a).expect("read 2");
        assert!(tree.try_lock_write(&a).is_err());
        drop(g1);
        assert!(tree.try_lock_write(&a).is_err());
    }

    #[test]
    fn child_lock_blocks_parent_write() {
        let (tree, _root, a, b) = build_tree();
        let _gb = tree.lock_read(&b).expect("read b");
        assert!(tree.try_lock_write(&a).is_err());
        // another reader on the parent is still fine
        let _ga = tree.lock_read(&a).expect("read a");
    }

    #[test]
    fn parent_write_blocks_child_lock() {
        let (tree, _root, a, b) = build_tree();
        let _ga = tree.lock_write(&a).expect("write a");
        assert!(tree.try_lock_write(&b).is_err());
        assert!(tree.acquire(&b, true, true).is_err());
    }

    #[test]
    fn write_lock_released_on_drop() {
        let (tree, _root, a, _b) = build_tree();
        {
            let _g = tree.lock_write(&a).expect("write");
            assert!(tree.try_lock_write(&a).is_err());
        }
        let _g = tree.try_lock_write(&a).expect("write after drop");
    }

    #[test]
    fn downgrade_admits_readers_upgrade_excludes() {
        let (tree, _root, a, _b) = build_tree();
        let mut g = tree.lock_write(&a).expect("write");
        g.downgrade();
        let reader = tree.lock_read(&a).expect("concurrent read");
        drop(reader);
        g.upgrade();
        assert!(tree.acquire(&a, true, true).is_err());
    }

    #[test]
    fn blocked_writer_eventually_acquires() {
        let (tree, _root, a, _b) = build_tree();
        let tree = Arc::new(tree);
        let g = tree.lock_read(&a).expect("read");
        let t2 = {
            let tree = Arc::clone(&tree);
            let a = Arc::clone(&a);
            std::thread::spawn(move || {
                let _g = tree.lock_write(&a).expect("write");
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!t2.is_finished());
        drop(g);
        t2.join().expect("writer thread");
    }

    #[test]
    fn lock_on_destroyed_container_fails() {
        let (tree, _root, _a, b) = build_tree();
        tree.unregister(b.id);
        assert!(tree.lock_read(&b).is_err());
    }

    #[test]
    fn state_change_maintains_ancestor_counters() {
        let (tree, root, a, b) = build_tree();
        let _ = tree.set_state(&b, ContainerState::Starting);
        assert_eq!(tree.child_counters(a.id), (1, 0));
        assert_eq!(tree.child_counters(root.id), (1, 0));
        let _ = tree.set_state(&b, ContainerState::Running);
        assert_eq!(tree.child_counters(a.id), (0, 1));
        let _ = tree.set_state(&b, ContainerState::Dead);
        assert_eq!(tree.child_counters(a.id), (0, 0));
        assert_eq!(tree.child_counters(root.id), (0, 0));
    }

    #[test]
    fn meta_parent_is_notified_when_last_running_child_leaves() {
        let (tree, _root, a, b) = build_tree();
        let _ = tree.set_state(&a, ContainerState::Meta);
        let _ = tree.set_state(&b, ContainerState::Running);
        let notify = tree.set_state(&b, ContainerState::Dead);
        assert!(notify.iter().any(|c| c.id == a.id));
        assert!(notify.iter().any(|c| c.id == b.id));
    }
}
