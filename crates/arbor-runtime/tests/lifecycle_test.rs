//! End-to-end scenarios for the container lifecycle engine.
//!
//! Everything runs against fixture cgroup, sysfs and proc trees in a
//! tempdir, with a mock task starter handing out fake pids, so the state
//! machine, the cpu distribution pass, admission control and persistence
//! are exercised without a privileged kernel.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arbor_common::config::ArborConfig;
use arbor_common::error::ErrorKind;
use arbor_common::types::{exit_code_status, ContainerState, Cred};
use arbor_runtime::engine::{Engine, EngineBuilder};
use arbor_runtime::events::Event;
use arbor_runtime::spawn::{StartSpec, StartedTask, TaskStarter};

// ── Fixture harness ──────────────────────────────────────────────────

#[derive(Debug)]
struct MockStarter {
    next_pid: AtomicI32,
}

impl MockStarter {
    fn new() -> Self {
        // far above any real pid_max, so stray signals hit nothing
        Self {
            next_pid: AtomicI32::new(2_000_000_000),
        }
    }
}

impl TaskStarter for MockStarter {
    fn start(&self, spec: &StartSpec) -> arbor_common::error::Result<StartedTask> {
        assert!(!spec.argv.is_empty(), "meta containers never reach the starter");
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(StartedTask {
            pid,
            wait_pid: pid,
            child: None,
        })
    }

    fn seize(
        &self,
        _name: &str,
        _pid: i32,
        _freezer: &Path,
    ) -> arbor_common::error::Result<i32> {
        Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }
}

fn seed_host(dir: &Path) {
    let cgroups = dir.join("cgroups");
    for controller in [
        "memory", "freezer", "cpu", "cpuacct", "cpuset", "blkio", "devices", "net_cls",
        "pids", "hugetlb",
    ] {
        std::fs::create_dir_all(cgroups.join(controller)).expect("controller root");
    }
    std::fs::write(cgroups.join("cpuset/cpuset.mems"), "0\n").expect("root mems");
    arbor_core::topology::write_fixture(&dir.join("sys"), 4, 2).expect("sysfs fixture");
    std::fs::create_dir_all(dir.join("proc")).expect("proc");
    std::fs::write(dir.join("proc/meminfo"), "MemTotal:       16777216 kB\n")
        .expect("meminfo");
}

fn engine_at(dir: &Path) -> Arc<Engine> {
    if !dir.join("cgroups").exists() {
        seed_host(dir);
    }
    let mut config = ArborConfig::default();
    config.data_dir = dir.to_path_buf();
    config.kv_dir = dir.join("kv");
    config.work_dir = dir.join("work");
    config.cgroup_root = dir.join("cgroups");
    config.sysfs_root = dir.join("sys");
    EngineBuilder::new(config)
        .starter(Box::new(MockStarter::new()))
        .proc_root(dir.join("proc"))
        .build()
        .expect("engine")
}

fn root_cred() -> Cred {
    Cred::new(0, 0)
}

fn state_of(engine: &Engine, name: &str) -> ContainerState {
    engine.tree.require(name).expect(name).state()
}

fn pump_events(engine: &Arc<Engine>, budget: Duration) {
    let deadline = Instant::now() + budget;
    while Instant::now() < deadline {
        match engine.events.pop_due() {
            Some(event) => engine.dispatch_event(event),
            None => std::thread::sleep(Duration::from_millis(2)),
        }
    }
}

fn wait_pid_of(engine: &Engine, name: &str) -> i32 {
    engine
        .tree
        .require(name)
        .expect(name)
        .read()
        .wait_pid
        .expect("container has a task")
}

// ── Create / Start / Stop ────────────────────────────────────────────

#[test]
fn create_start_exit_tracks_status() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());

    engine.create("a", root_cred()).expect("create");
    engine.set_property("a", "command", "/bin/true").expect("command");
    assert_eq!(state_of(&engine, "a"), ContainerState::Stopped);

    engine.start("a").expect("start");
    assert_eq!(state_of(&engine, "a"), ContainerState::Running);

    let pid = wait_pid_of(&engine, "a");
    engine.dispatch_event(Event::Exit {
        pid,
        status: exit_code_status(0),
    });

    assert_eq!(state_of(&engine, "a"), ContainerState::Dead);
    assert_eq!(engine.get_property("a", "exit_status").expect("status"), "0");
    assert_eq!(engine.get_property("a", "oom_killed").expect("oom"), "false");
}

#[test]
fn invalid_names_are_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());

    for name in ["", "/a", "a//b", "self", "a/.", "spa ce"] {
        let err = engine.create(name, root_cred()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue, "{name}");
    }
    let err = engine.create("orphan/child", root_cred()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContainerDoesNotExist);
}

#[test]
fn duplicate_create_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");
    let err = engine.create("a", root_cred()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContainerAlreadyExists);
}

#[test]
fn start_requires_stopped_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");
    engine.set_property("a", "command", "/bin/sleep 9").expect("command");
    engine.start("a").expect("start");
    let err = engine.start("a").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[test]
fn stop_is_idempotent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");
    engine.set_property("a", "command", "/bin/sleep 9").expect("command");
    engine.start("a").expect("start");

    engine.stop("a", 0).expect("stop");
    assert_eq!(state_of(&engine, "a"), ContainerState::Stopped);
    engine.stop("a", 0).expect("stop again");
    assert_eq!(state_of(&engine, "a"), ContainerState::Stopped);
    // runtime fields are gone
    assert_eq!(
        engine.get_property("a", "exit_status").unwrap_err().kind(),
        ErrorKind::NoValue
    );
}

#[test]
fn starting_a_nested_container_brings_ancestors_up() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create a");
    engine.create("a/b", root_cred()).expect("create b");
    engine.set_property("a/b", "command", "/bin/sleep 9").expect("command");

    engine.start("a/b").expect("start");
    // the meta parent came up first
    assert_eq!(state_of(&engine, "a"), ContainerState::Meta);
    assert_eq!(state_of(&engine, "a/b"), ContainerState::Running);
}

#[test]
fn alive_containers_always_have_alive_ancestors() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");
    engine.create("a/b", root_cred()).expect("create");
    engine.create("a/b/c", root_cred()).expect("create");
    engine.set_property("a/b/c", "command", "/bin/sleep 9").expect("command");
    engine.start("a/b/c").expect("start");

    for name in engine.list() {
        let cell = engine.tree.require(&name).expect("cell");
        if cell.state().is_alive() {
            for ancestor in engine.tree.ancestors(cell.id) {
                assert!(
                    ancestor.state().is_alive(),
                    "{} is {} under dead ancestor {}",
                    name,
                    cell.state(),
                    ancestor.name
                );
            }
        }
    }
}

#[test]
fn stopping_a_subtree_stops_children_first() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");
    engine.create("a/b", root_cred()).expect("create");
    engine.set_property("a/b", "command", "/bin/sleep 9").expect("command");
    engine.start("a/b").expect("start");

    engine.stop("a", 0).expect("stop subtree");
    assert_eq!(state_of(&engine, "a"), ContainerState::Stopped);
    assert_eq!(state_of(&engine, "a/b"), ContainerState::Stopped);
}

// ── Property model ───────────────────────────────────────────────────

#[test]
fn property_set_then_get_round_trips() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");

    for (prop, value) in [
        ("command", "/bin/sleep 9"),
        ("memory_limit", "512M"),
        ("cpu_limit", "2c"),
        ("cpu_policy", "batch"),
        ("isolate", "false"),
        ("respawn_limit", "3"),
        ("labels", "app.tier: web"),
    ] {
        engine.set_property("a", prop, value).expect(prop);
        assert_eq!(engine.get_property("a", prop).expect(prop), value);
    }
}

#[test]
fn dotted_property_reads_the_cgroup_knob() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");
    engine.set_property("a", "command", "/bin/sleep 9").expect("command");
    engine.set_property("a", "memory_limit", "1M").expect("limit");

    let err = engine.get_property("a", "memory.limit_in_bytes").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState, "stopped: no cgroups yet");

    engine.start("a").expect("start");
    assert_eq!(
        engine
            .get_property("a", "memory.limit_in_bytes")
            .expect("knob"),
        "1048576"
    );
    let err = engine.get_property("a", "memory.no_such_knob").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidProperty);
}

#[test]
fn non_dynamic_property_rejected_while_running() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");
    engine.set_property("a", "command", "/bin/sleep 9").expect("command");
    engine.start("a").expect("start");

    let err = engine.set_property("a", "command", "/bin/false").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    // dynamic properties still fly
    engine.set_property("a", "memory_limit", "64M").expect("dynamic");
}

#[test]
fn root_container_is_read_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    let err = engine.set_property("/", "cpu_limit", "1c").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Permission);
}

#[test]
fn concurrent_property_writes_serialize() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");

    let mut handles = Vec::new();
    for i in 1..=16u32 {
        let engine = Arc::clone(&engine);
        handles.push(std::thread::spawn(move || {
            engine
                .set_property("a", "cpu_limit", &format!("{i}c"))
                .expect("set");
        }));
    }
    for handle in handles {
        handle.join().expect("writer");
    }

    let value = engine.get_property("a", "cpu_limit").expect("get");
    let accepted: Vec<String> = (1..=16).map(|i| format!("{i}c")).collect();
    assert!(accepted.contains(&value), "unexpected value {value}");
}

// ── CPU set distribution ─────────────────────────────────────────────

#[test]
fn cores_and_threads_partition_the_host() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());

    engine.create("a", root_cred()).expect("create a");
    engine.set_property("a", "command", "/bin/sleep 9").expect("command");
    engine.set_property("a", "cpu_set", "cores 2").expect("cpu_set a");

    engine.create("b", root_cred()).expect("create b");
    engine.set_property("b", "command", "/bin/sleep 9").expect("command");
    engine.set_property("b", "cpu_set", "threads 3").expect("cpu_set b");

    engine.start("a").expect("start a");
    engine.start("b").expect("start b");

    let a = engine.tree.require("a").expect("a");
    let b = engine.tree.require("b").expect("b");
    let (a_mask, a_reserve) = {
        let data = a.read();
        (data.cpu_affinity.clone(), data.cpu_reserve.clone())
    };
    let (b_mask, b_reserve) = {
        let data = b.read();
        (data.cpu_affinity.clone(), data.cpu_reserve.clone())
    };

    // two whole cores of two threads each
    assert_eq!(a_mask.weight(), 4);
    assert_eq!(a_mask.to_string(), "0-3");
    assert_eq!(b_mask.weight(), 3);
    assert!(a_mask.is_disjoint(&b_mask));
    assert!(a_reserve.is_disjoint(&b_reserve));

    let root = engine.root();
    assert_eq!(root.read().cpu_vacant.weight(), 8 - 4 - 3);

    // the kernel saw the exact masks
    let a_cpus = std::fs::read_to_string(
        dir.path().join("cgroups/cpuset/arbord%a/cpuset.cpus"),
    )
    .expect("a cpus");
    assert_eq!(a_cpus, "0-3");
}

#[test]
fn sibling_reserves_stay_subsets_of_the_parent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");
    engine.set_property("a", "command", "/bin/sleep 9").expect("command");
    engine.set_property("a", "cpu_set", "reserve 2").expect("reserve");
    engine.start("a").expect("start");

    let a = engine.tree.require("a").expect("a");
    let root_affinity = engine.root().read().cpu_affinity.clone();
    let data = a.read();
    assert_eq!(data.cpu_reserve.weight(), 2);
    assert!(data.cpu_reserve.is_subset_of(&data.cpu_affinity));
    assert!(data.cpu_affinity.is_subset_of(&root_affinity));
    // reserve keeps the full parent affinity
    assert_eq!(data.cpu_affinity, root_affinity);
}

#[test]
fn impossible_cpu_request_fails_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");
    engine.set_property("a", "command", "/bin/sleep 9").expect("command");
    engine.set_property("a", "cpu_set", "cores 9").expect("cpu_set");

    let err = engine.start("a").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceNotAvailable);
    assert_eq!(state_of(&engine, "a"), ContainerState::Stopped);
}

// ── Memory guarantee admission ───────────────────────────────────────

#[test]
fn guarantee_overcommit_refuses_the_second_start() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());

    engine.create("a", root_cred()).expect("create a");
    engine.set_property("a", "command", "/bin/sleep 9").expect("command");
    engine.set_property("a", "memory_guarantee", "10G").expect("guarantee a");
    engine.start("a").expect("start a");

    engine.create("b", root_cred()).expect("create b");
    engine.set_property("b", "command", "/bin/sleep 9").expect("command");
    engine.set_property("b", "memory_guarantee", "6G").expect("guarantee b");

    // 10G + 6G + 1G reserve > 16G of host memory
    let err = engine.start("b").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ResourceNotAvailable);
    assert_eq!(state_of(&engine, "b"), ContainerState::Stopped);

    engine.set_property("b", "memory_guarantee", "4G").expect("shrink");
    engine.start("b").expect("start b fits");
}

// ── Pause / Resume ───────────────────────────────────────────────────

#[test]
fn pause_and_resume_propagate_through_the_subtree() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");
    engine.set_property("a", "command", "/bin/sleep 9").expect("command");
    engine.create("a/b", root_cred()).expect("create");
    engine.set_property("a/b", "command", "/bin/sleep 9").expect("command");
    engine.start("a").expect("start a");
    engine.start("a/b").expect("start b");

    engine.pause("a").expect("pause");
    assert_eq!(state_of(&engine, "a"), ContainerState::Paused);
    assert_eq!(state_of(&engine, "a/b"), ContainerState::Paused);

    // the fixture kernel does not flip self_freezing on its own
    std::fs::write(
        dir.path().join("cgroups/freezer/arbord/a/freezer.self_freezing"),
        "1",
    )
    .expect("seed");

    engine.resume("a").expect("resume");
    assert_eq!(state_of(&engine, "a"), ContainerState::Running);
    assert_eq!(state_of(&engine, "a/b"), ContainerState::Running);
}

#[test]
fn pause_requires_a_live_container() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");
    let err = engine.pause("a").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

// ── Sync against the kernel ──────────────────────────────────────────

#[test]
fn vanished_freezer_stops_the_container_on_sync() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");
    engine.set_property("a", "command", "/bin/sleep 9").expect("command");
    engine.start("a").expect("start");
    assert_eq!(state_of(&engine, "a"), ContainerState::Running);

    std::fs::remove_dir_all(dir.path().join("cgroups/freezer/arbord/a")).expect("vanish");

    let cell = engine.tree.require("a").expect("a");
    engine.sync_state(&cell);
    assert_eq!(cell.state(), ContainerState::Stopped);
    assert!(cell.read().task_pid.is_none());
    assert!(cell.read().wait_pid.is_none());
}

// ── Respawn ──────────────────────────────────────────────────────────

#[test]
fn respawn_stops_at_the_limit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");
    engine.set_property("a", "command", "/bin/false").expect("command");
    engine.set_property("a", "respawn", "true").expect("respawn");
    engine.set_property("a", "respawn_limit", "2").expect("limit");
    engine.set_property("a", "respawn_delay", "1").expect("delay");

    engine.start("a").expect("start");

    for _ in 0..3 {
        let pid = wait_pid_of(&engine, "a");
        engine.dispatch_event(Event::Exit {
            pid,
            status: exit_code_status(1),
        });
        assert_eq!(state_of(&engine, "a"), ContainerState::Dead);
        pump_events(&engine, Duration::from_millis(50));
        if state_of(&engine, "a") != ContainerState::Running {
            break;
        }
    }

    // two respawns happened, the third death is final
    assert_eq!(state_of(&engine, "a"), ContainerState::Dead);
    assert_eq!(engine.get_property("a", "respawn_count").expect("count"), "2");
}

// ── Meta death ───────────────────────────────────────────────────────

#[test]
fn meta_parent_dies_with_its_last_child() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");
    engine.create("a/b", root_cred()).expect("create");
    engine.set_property("a/b", "command", "/bin/sleep 9").expect("command");
    engine.start("a/b").expect("start");
    assert_eq!(state_of(&engine, "a"), ContainerState::Meta);

    let pid = wait_pid_of(&engine, "a/b");
    engine.dispatch_event(Event::Exit {
        pid,
        status: exit_code_status(0),
    });
    assert_eq!(state_of(&engine, "a/b"), ContainerState::Dead);

    pump_events(&engine, Duration::from_millis(30));
    assert_eq!(state_of(&engine, "a"), ContainerState::Dead);
}

// ── Destroy ──────────────────────────────────────────────────────────

#[test]
fn destroy_is_absorbing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");
    engine.set_property("a", "command", "/bin/sleep 9").expect("command");
    engine.start("a").expect("start");

    let stale = engine.tree.require("a").expect("handle");
    engine.destroy("a").expect("destroy");

    assert_eq!(stale.state(), ContainerState::Destroyed);
    assert_eq!(
        engine.start("a").unwrap_err().kind(),
        ErrorKind::ContainerDoesNotExist
    );
    assert_eq!(
        engine.tree.lock_read(&stale).unwrap_err().kind(),
        ErrorKind::ContainerDoesNotExist
    );
}

#[test]
fn destroy_takes_the_whole_subtree() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");
    engine.create("a/b", root_cred()).expect("create");
    engine.create("a/b/c", root_cred()).expect("create");

    engine.destroy("a").expect("destroy");
    for name in ["a", "a/b", "a/b/c"] {
        assert!(engine.tree.find(name).is_none(), "{name} survived");
    }
    assert_eq!(engine.list(), vec!["/".to_string()]);
}

#[test]
fn root_cannot_be_destroyed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    assert_eq!(engine.destroy("/").unwrap_err().kind(), ErrorKind::Permission);
}

// ── Wait ─────────────────────────────────────────────────────────────

#[test]
fn waiters_hear_about_death() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");
    engine.set_property("a", "command", "/bin/sleep 9").expect("command");
    engine.start("a").expect("start");

    let handle = engine
        .wait(vec!["a".to_string()], Vec::new(), None)
        .expect("wait");

    let pid = wait_pid_of(&engine, "a");
    engine.dispatch_event(Event::Exit {
        pid,
        status: exit_code_status(0),
    });

    let event = handle
        .rx
        .recv_timeout(Duration::from_millis(200))
        .expect("notification");
    assert_eq!(event.name, "a");
    assert_eq!(event.state, Some(ContainerState::Dead));
}

#[test]
fn wildcard_waiters_match_new_containers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    let handle = engine
        .wait(vec!["job-*".to_string()], Vec::new(), None)
        .expect("wait");

    engine.create("job-1", root_cred()).expect("create");
    engine.set_property("job-1", "command", "/bin/sleep 9").expect("command");
    engine.start("job-1").expect("start");

    let event = handle
        .rx
        .recv_timeout(Duration::from_millis(200))
        .expect("notification");
    assert_eq!(event.name, "job-1");
    assert_eq!(event.state, Some(ContainerState::Running));
}

#[test]
fn wait_timeout_delivers_an_empty_name() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");

    let handle = engine
        .wait(vec!["a".to_string()], Vec::new(), Some(5))
        .expect("wait");
    std::thread::sleep(Duration::from_millis(10));
    pump_events(&engine, Duration::from_millis(20));

    let event = handle
        .rx
        .recv_timeout(Duration::from_millis(200))
        .expect("timeout notification");
    assert!(event.name.is_empty());
}

// ── Labels ───────────────────────────────────────────────────────────

#[test]
fn labels_set_inc_find() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");
    engine.create("b", root_cred()).expect("create");

    engine.set_label("a", "app.tier", "web").expect("set");
    assert_eq!(engine.get_property("a", "labels[app.tier]").expect("get"), "web");

    assert_eq!(engine.inc_label("b", "app.restarts", 1).expect("inc"), 1);
    assert_eq!(engine.inc_label("b", "app.restarts", 2).expect("inc"), 3);

    let found = engine.find_label("app.tier");
    assert_eq!(found, vec![("a".to_string(), "web".to_string())]);

    let err = engine.set_label("a", "nodots", "x").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidLabel);
    let err = engine.get_property("a", "labels[app.missing]").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LabelNotFound);
}

// ── OOM handling ─────────────────────────────────────────────────────

#[test]
fn fatal_oom_reaps_the_container() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");
    engine.set_property("a", "command", "/bin/sleep 9").expect("command");
    engine.start("a").expect("start");

    // the fixture memory controller reports a kill
    std::fs::write(
        dir.path().join("cgroups/memory/arbord%a/memory.oom_control"),
        "oom_kill_disable 0\nunder_oom 0\noom_kill 1\n",
    )
    .expect("seed oom");

    let pid = wait_pid_of(&engine, "a");
    engine.dispatch_event(Event::Exit {
        pid,
        status: arbor_common::types::signal_status(9),
    });

    assert_eq!(state_of(&engine, "a"), ContainerState::Dead);
    assert_eq!(engine.get_property("a", "oom_killed").expect("oom"), "true");
}

// ── Persistence ──────────────────────────────────────────────────────

#[test]
fn restart_restores_the_tree_and_its_properties() {
    let dir = tempfile::tempdir().expect("tempdir");
    let snapshot: Vec<(String, Vec<(String, String)>)> = {
        let engine = engine_at(dir.path());
        engine.create("a", root_cred()).expect("create");
        engine.set_property("a", "command", "/bin/sleep 9").expect("command");
        engine.set_property("a", "memory_limit", "512M").expect("limit");
        engine.set_property("a", "labels", "app.tier: db").expect("labels");
        engine.create("a/b", root_cred()).expect("create");
        engine.set_property("a/b", "cpu_weight", "200").expect("weight");

        engine
            .list()
            .into_iter()
            .filter(|name| name != "/")
            .map(|name| {
                let props = ["command", "memory_limit", "labels", "cpu_weight", "state"]
                    .iter()
                    .filter_map(|p| {
                        engine
                            .get_property(&name, p)
                            .ok()
                            .map(|v| ((*p).to_string(), v))
                    })
                    .collect();
                (name, props)
            })
            .collect()
    };

    let engine = engine_at(dir.path());
    engine.restore().expect("restore");

    for (name, props) in snapshot {
        for (prop, expected) in props {
            assert_eq!(
                engine.get_property(&name, &prop).expect(&prop),
                expected,
                "{name}.{prop} after restart"
            );
        }
    }
}

#[test]
fn restore_keeps_ids_stable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (id_a, id_b) = {
        let engine = engine_at(dir.path());
        let a = engine.create("a", root_cred()).expect("create");
        let b = engine.create("b", root_cred()).expect("create");
        (a.id, b.id)
    };

    let engine = engine_at(dir.path());
    engine.restore().expect("restore");
    assert_eq!(engine.tree.require("a").expect("a").id, id_a);
    assert_eq!(engine.tree.require("b").expect("b").id, id_b);
    // the restored ids are out of circulation
    let c = engine.create("c", root_cred()).expect("create");
    assert_ne!(c.id, id_a);
    assert_ne!(c.id, id_b);
}

#[test]
fn destroy_removes_the_persistence_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let engine = engine_at(dir.path());
        engine.create("a", root_cred()).expect("create");
        engine.destroy("a").expect("destroy");
    }
    let engine = engine_at(dir.path());
    engine.restore().expect("restore");
    assert!(engine.tree.find("a").is_none());
}

// ── Status ───────────────────────────────────────────────────────────

#[test]
fn status_reports_the_snapshot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = engine_at(dir.path());
    engine.create("a", root_cred()).expect("create");
    engine.set_property("a", "command", "/bin/sleep 9").expect("command");
    engine.start("a").expect("start");

    let status = engine.status("a").expect("status");
    assert_eq!(status.name, "a");
    assert_eq!(status.state, ContainerState::Running);
    assert!(status.task_pid.is_some());
    assert!(status.start_time_ms.is_some());
    // root-owned container gets flagged
    assert!(!status.taint.is_empty());
}
