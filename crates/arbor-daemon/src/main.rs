//! # arbord — container management daemon
//!
//! Owns the container tree, restores it from the record store, runs the
//! event loop and reaps child tasks. The RPC surface plugs in on top of
//! [`arbor_runtime::engine::Engine`]; this binary wires the pieces and
//! keeps them alive.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use arbor_common::config::ArborConfig;
use arbor_runtime::engine::EngineBuilder;
use arbor_runtime::events::Event;

#[derive(Debug, Parser)]
#[command(name = arbor_common::constants::BIN_NAME, about = "container management daemon")]
struct Args {
    /// Control socket path.
    #[arg(long, default_value = arbor_common::constants::DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Base directory for daemon state.
    #[arg(long, default_value = arbor_common::constants::DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Cgroup hierarchy mount point.
    #[arg(long, default_value = arbor_common::constants::DEFAULT_CGROUP_ROOT)]
    cgroup_root: PathBuf,

    /// Skip restoring persisted containers.
    #[arg(long)]
    no_restore: bool,

    /// Internal: adopt a reparented task and wait for it.
    #[arg(long, hide = true)]
    seize: Option<i32>,

    /// Internal: container name for `--seize`.
    #[arg(long, hide = true)]
    container: Option<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    if let Some(pid) = args.seize {
        return seize(args.container.as_deref().unwrap_or("?"), pid);
    }

    let mut config = ArborConfig::default();
    config.data_dir.clone_from(&args.data_dir);
    config.kv_dir = args.data_dir.join("containers");
    config.work_dir = args.data_dir.join("work");
    config.cgroup_root = args.cgroup_root;

    let engine = EngineBuilder::new(config)
        .build()
        .map_err(|e| anyhow::anyhow!("engine bring-up failed: {e}"))?;

    if !args.no_restore {
        engine
            .restore()
            .map_err(|e| anyhow::anyhow!("restore failed: {e}"))?;
    }

    let shutdown = Arc::new(AtomicBool::new(false));

    let reaper = {
        let engine = Arc::clone(&engine);
        let shutdown = Arc::clone(&shutdown);
        std::thread::Builder::new()
            .name("reaper".to_string())
            .spawn(move || reap_children(&engine, &shutdown))?
    };

    tracing::info!(socket = %args.socket.display(), "arbord is up");
    engine.run_event_loop(&shutdown);

    shutdown.store(true, Ordering::SeqCst);
    let _ = reaper.join();
    Ok(())
}

/// Collects exited children and feeds their statuses to the engine.
fn reap_children(engine: &Arc<arbor_runtime::engine::Engine>, shutdown: &AtomicBool) {
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

    while !shutdown.load(Ordering::SeqCst) {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                engine.events.push(Event::ChildExit {
                    pid: pid.as_raw(),
                    status: arbor_common::types::exit_code_status(code),
                });
            }
            Ok(WaitStatus::Signaled(pid, sig, _core)) => {
                engine.events.push(Event::ChildExit {
                    pid: pid.as_raw(),
                    status: arbor_common::types::signal_status(sig as i32),
                });
            }
            Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD) => {
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "waitpid failed");
                std::thread::sleep(std::time::Duration::from_millis(100));
            }
        }
    }
}

/// `--seize` mode: linger next to an adopted task so its exit has a
/// watcher, mirroring what the init helper does for reparented tasks.
fn seize(container: &str, pid: i32) -> anyhow::Result<()> {
    tracing::info!(container, pid, "watching seized task");
    while nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok() {
        std::thread::sleep(std::time::Duration::from_millis(500));
    }
    Ok(())
}
