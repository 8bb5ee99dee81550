//! Task starting seam.
//!
//! The engine hands a fully prepared start specification to a
//! [`TaskStarter`]; how the task actually enters its namespaces is the
//! starter's business. The bundled [`ProcessStarter`] covers plain
//! first-level workloads: it forks through `std::process::Command`,
//! enters the prepared cgroups and drops credentials from the child side
//! before exec. Containers needing full mount-namespace construction
//! plug in a starter that drives the init helper binary.

use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use arbor_common::error::{ArborError, ErrorKind, Result};
use arbor_common::types::Cred;

/// Everything a starter needs to launch one container task.
#[derive(Debug)]
pub struct StartSpec {
    /// Container path, for logs and the helper's `--container` flag.
    pub name: String,
    /// Command line, already split into argv.
    pub argv: Vec<String>,
    /// Environment in `KEY=value` form; replaces the daemon environment.
    pub env: Vec<String>,
    /// Working directory for the task.
    pub cwd: PathBuf,
    /// Chroot directory; `/` means none.
    pub root: PathBuf,
    /// Credentials the task runs under.
    pub cred: Cred,
    /// Hostname to set when isolation allows it.
    pub hostname: String,
    /// Whether the task gets its own pid namespace.
    pub isolate: bool,
    /// Whether the command is an init-like pid 1.
    pub os_mode: bool,
    /// Prepared cgroup directories the task must enter before exec.
    pub cgroup_paths: Vec<PathBuf>,
    /// File capturing stdout.
    pub stdout_path: PathBuf,
    /// File capturing stderr.
    pub stderr_path: PathBuf,
}

/// A started task as the engine tracks it.
#[derive(Debug)]
pub struct StartedTask {
    /// The main task pid.
    pub pid: i32,
    /// The pid whose exit ends the container; differs from `pid` when an
    /// intermediate fork built the pid namespace.
    pub wait_pid: i32,
    /// Handle for the wait thread when the starter forked directly.
    pub child: Option<std::process::Child>,
}

/// Launches and re-adopts container tasks.
pub trait TaskStarter: Send + Sync {
    /// Starts the task described by the spec.
    ///
    /// # Errors
    ///
    /// Returns an error when the task cannot be launched; the engine
    /// rolls the container back to stopped.
    fn start(&self, spec: &StartSpec) -> Result<StartedTask>;

    /// Adopts a task that reparented away from the daemon by spawning a
    /// watcher bound to the container's freezer cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error when the watcher cannot be spawned.
    fn seize(&self, name: &str, pid: i32, freezer_path: &std::path::Path) -> Result<i32>;
}

/// Plain fork/exec starter for workloads without mount namespaces.
#[derive(Debug, Default)]
pub struct ProcessStarter;

impl TaskStarter for ProcessStarter {
    fn start(&self, spec: &StartSpec) -> Result<StartedTask> {
        let Some(program) = spec.argv.first() else {
            return Err(ArborError::new(
                ErrorKind::InvalidCommand,
                format!("container {} has no command", spec.name),
            ));
        };
        tracing::info!(name = %spec.name, command = %program, "starting task");

        let stdout = std::fs::File::create(&spec.stdout_path)
            .map_err(|e| ArborError::io(&spec.stdout_path, &e))?;
        let stderr = std::fs::File::create(&spec.stderr_path)
            .map_err(|e| ArborError::io(&spec.stderr_path, &e))?;

        let mut command = Command::new(program);
        command
            .args(&spec.argv[1..])
            .env_clear()
            .envs(spec.env.iter().filter_map(|kv| kv.split_once('=')))
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        let cgroups = spec.cgroup_paths.clone();
        let root = spec.root.clone();
        let cred = spec.cred;
        // SAFETY: the closure runs between fork and exec and only performs
        // async-signal-safe work: open/write/close, chroot, setgid/setuid.
        unsafe {
            command.pre_exec(move || {
                for cg in &cgroups {
                    let procs = cg.join("cgroup.procs");
                    std::fs::write(&procs, std::process::id().to_string())?;
                }
                if root != std::path::Path::new("/") {
                    let c_root = std::ffi::CString::new(root.as_os_str().as_encoded_bytes())
                        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
                    if libc::chroot(c_root.as_ptr()) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    if libc::chdir(c"/".as_ptr()) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                if libc::setgid(cred.gid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::setuid(cred.uid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(|e| {
            ArborError::new(
                ErrorKind::InvalidCommand,
                format!("cannot execute {program}: {e}"),
            )
        })?;
        let pid = i32::try_from(child.id()).unwrap_or_default();
        Ok(StartedTask {
            pid,
            wait_pid: pid,
            child: Some(child),
        })
    }

    fn seize(&self, name: &str, pid: i32, freezer_path: &std::path::Path) -> Result<i32> {
        let exe = std::env::current_exe().map_err(|e| ArborError::io("/proc/self/exe", &e))?;
        tracing::info!(name, pid, "seizing reparented task");
        let cg = freezer_path.to_path_buf();
        let mut command = Command::new(exe);
        command
            .arg("--container")
            .arg(name)
            .arg("--seize")
            .arg(pid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // SAFETY: only a cgroup attach between fork and exec.
        unsafe {
            command.pre_exec(move || {
                std::fs::write(cg.join("cgroup.procs"), std::process::id().to_string())
            });
        }
        let child = command
            .spawn()
            .map_err(|e| ArborError::new(ErrorKind::Unknown, format!("cannot seize: {e}")))?;
        Ok(i32::try_from(child.id()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(dir: &std::path::Path, argv: &[&str]) -> StartSpec {
        StartSpec {
            name: "a".to_string(),
            argv: argv.iter().map(ToString::to_string).collect(),
            env: vec!["PATH=/usr/bin:/bin".to_string()],
            cwd: dir.to_path_buf(),
            root: PathBuf::from("/"),
            cred: Cred::new(
                nix::unistd::Uid::current().as_raw(),
                nix::unistd::Gid::current().as_raw(),
            ),
            hostname: String::new(),
            isolate: false,
            os_mode: false,
            cgroup_paths: Vec::new(),
            stdout_path: dir.join("stdout"),
            stderr_path: dir.join("stderr"),
        }
    }

    #[test]
    fn empty_command_is_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = ProcessStarter.start(&spec(dir.path(), &[])).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCommand);
    }

    #[test]
    fn true_runs_and_exits_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let task = ProcessStarter
            .start(&spec(dir.path(), &["/bin/true"]))
            .expect("start");
        assert!(task.pid > 0);
        let status = task.child.expect("child").wait().expect("wait");
        assert!(status.success());
    }

    #[test]
    fn stdout_is_captured() {
        let dir = tempfile::tempdir().expect("tempdir");
        let task = ProcessStarter
            .start(&spec(dir.path(), &["/bin/echo", "hello"]))
            .expect("start");
        task.child.expect("child").wait().expect("wait");
        let out = std::fs::read_to_string(dir.path().join("stdout")).expect("read");
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn missing_binary_fails_with_invalid_command() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = ProcessStarter
            .start(&spec(dir.path(), &["/no/such/bin"]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidCommand);
    }
}
