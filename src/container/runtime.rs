//! Execution of runtime phase commands.
//!
//! Phase commands are handed to a shell as opaque strings. The create phase
//! runs to completion in the caller; execute and destroy run back to back in
//! one supervised child so the caller is never blocked by the workload. That
//! child leads its own process group.
//!
//! # Notes on inherited descriptors
//!
//! The runtime's execute tool misbehaves when it inherits descriptors from
//! the orchestrator (sockets, pipes opened by gateways). Before the child
//! execs, every descriptor above the standard streams is marked
//! close-on-exec. Marking rather than closing keeps the std spawn error pipe
//! working.

#![allow(unsafe_code)]

use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::{Pid, SysconfVar, sysconf};
use serde::Serialize;
use tracing::{debug, instrument, trace, warn};

use crate::error::RuntimeError;

/// Upper bound on descriptors swept before exec when the limit is unknown.
const DEFAULT_FD_SWEEP: i32 = 1024;

/// Poll interval while waiting on a child with a deadline.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A stage of the runtime invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Allocate container resources.
    Create,
    /// Run the contained workload.
    Execute,
    /// Release container resources.
    Destroy,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Execute => write!(f, "execute"),
            Self::Destroy => write!(f, "destroy"),
        }
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum ExitOutcome {
    /// Normal exit with the given code.
    Exited(i32),
    /// Terminated by the given signal number.
    Signaled(i32),
}

impl ExitOutcome {
    /// Returns `true` for a zero exit code.
    #[must_use]
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Maps the outcome to a shell-style exit code (`128 + signo` for signals).
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exited(code) => *code,
            Self::Signaled(signo) => 128 + signo,
        }
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::Exited(code),
            (None, Some(signo)) => Self::Signaled(signo),
            // Neither code nor signal: only possible for stopped children, which we never request.
            (None, None) => Self::Exited(-1),
        }
    }
}

impl std::fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signo) => write!(f, "terminated by signal {signo}"),
        }
    }
}

/// Executables of the underlying container runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimePrograms {
    /// Program invoked for the create phase.
    pub create: String,
    /// Program invoked for the execute phase.
    pub execute: String,
    /// Program invoked for the destroy phase.
    pub destroy: String,
}

impl Default for RuntimePrograms {
    fn default() -> Self {
        Self {
            create: String::from("lxc-create"),
            execute: String::from("lxc-execute"),
            destroy: String::from("lxc-destroy"),
        }
    }
}

/// The child running the execute and destroy phases.
///
/// The child leads its own process group, so the runtime tools it starts can
/// be killed along with it.
#[derive(Debug)]
pub struct SupervisedProcess {
    child: Child,
    container: String,
    shell: PathBuf,
    destroy: String,
    started_at: DateTime<Utc>,
}

/// How a supervised child was reaped.
#[derive(Debug)]
pub struct Reaped {
    /// How the child ended.
    pub outcome: ExitOutcome,
    /// Set when the child outlived the timeout and its process group was
    /// killed. Holds the result of running destroy again afterwards.
    pub forced_destroy: Option<Result<ExitOutcome, RuntimeError>>,
}

impl SupervisedProcess {
    /// Returns the OS process id.
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Returns when the child was spawned.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Checks whether the child has exited without blocking.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Wait` if the status cannot be queried.
    pub fn try_outcome(&mut self) -> Result<Option<ExitOutcome>, RuntimeError> {
        self.child
            .try_wait()
            .map(|status| status.map(ExitOutcome::from))
            .map_err(|e| self.wait_error(e))
    }

    /// Blocks until the child exits and returns how it ended.
    ///
    /// With a timeout, once the deadline passes the child's whole process
    /// group is killed (SIGKILL), the child is reaped, and the destroy command
    /// is run again under the same timeout so container resources are
    /// released before this returns.
    ///
    /// # Errors
    ///
    /// Returns `RuntimeError::Wait` if waiting fails.
    #[instrument(skip(self), fields(container = %self.container, pid = self.child.id()))]
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Reaped, RuntimeError> {
        match wait_child(&mut self.child, timeout, &self.container, Phase::Execute) {
            Ok(outcome) => Ok(Reaped {
                outcome,
                forced_destroy: None,
            }),
            Err(RuntimeError::Timeout { timeout_ms, .. }) => {
                warn!(
                    timeout_ms = %timeout_ms,
                    "Supervised child did not exit in time, killing its process group"
                );
                self.kill_group();
                let outcome = self
                    .child
                    .wait()
                    .map(ExitOutcome::from)
                    .map_err(|e| self.wait_error(e))?;

                let destroyed = run_phase(
                    &self.shell,
                    &self.container,
                    Phase::Destroy,
                    &self.destroy,
                    timeout,
                );
                if let Err(e) = &destroyed {
                    warn!(error = %e, "Destroy after kill failed");
                }
                Ok(Reaped {
                    outcome,
                    forced_destroy: Some(destroyed),
                })
            }
            Err(e) => Err(e),
        }
    }

    fn kill_group(&mut self) {
        let killed = i32::try_from(self.child.id())
            .map_err(|_| nix::errno::Errno::ESRCH)
            .and_then(|pgid| killpg(Pid::from_raw(pgid), Signal::SIGKILL));
        if let Err(errno) = killed {
            debug!(%errno, "killpg failed, killing the child alone");
            let _ = self.child.kill();
        }
    }

    fn wait_error(&self, source: std::io::Error) -> RuntimeError {
        RuntimeError::Wait {
            container: self.container.clone(),
            phase: Phase::Execute,
            source,
        }
    }
}

/// Runs one phase command to completion through `shell -c`.
///
/// # Errors
///
/// Returns:
/// - `RuntimeError::Spawn` if the shell cannot be started
/// - `RuntimeError::Timeout` if `timeout` elapses (the process is killed)
/// - `RuntimeError::PhaseFailed` if the command exits unsuccessfully
#[instrument(skip(shell, command))]
pub fn run_phase(
    shell: &Path,
    container: &str,
    phase: Phase,
    command: &str,
    timeout: Option<Duration>,
) -> Result<ExitOutcome, RuntimeError> {
    debug!(command, "Running phase command");
    let mut child = Command::new(shell)
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .spawn()
        .map_err(|e| RuntimeError::Spawn {
            container: container.to_string(),
            phase,
            source: e,
        })?;

    let outcome = match wait_child(&mut child, timeout, container, phase) {
        Ok(outcome) => outcome,
        Err(e @ RuntimeError::Timeout { .. }) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }
        Err(e) => return Err(e),
    };

    if !outcome.success() {
        return Err(RuntimeError::PhaseFailed {
            container: container.to_string(),
            phase,
            outcome,
        });
    }

    debug!(%outcome, "Phase command completed");
    Ok(outcome)
}

/// Spawns the child that runs `execute` and then `destroy`, without waiting.
///
/// Destroy runs once execute returns, whatever its exit status.
///
/// # Errors
///
/// Returns `RuntimeError::Spawn` if the child cannot be started.
#[instrument(skip(shell, execute, destroy))]
pub fn spawn_supervised(
    shell: &Path,
    container: &str,
    execute: &str,
    destroy: &str,
) -> Result<SupervisedProcess, RuntimeError> {
    let script = format!("{execute}\n{destroy}\n");
    let sweep_limit = fd_sweep_limit();

    let mut command = Command::new(shell);
    command
        .arg("-c")
        .arg(&script)
        .stdin(Stdio::null())
        .process_group(0);

    // SAFETY: the closure only issues fcntl(2), which is async-signal-safe,
    // and allocates nothing between fork and exec.
    unsafe {
        command.pre_exec(move || {
            mark_inherited_fds_cloexec(sweep_limit);
            Ok(())
        });
    }

    trace!(sweep_limit, "Spawning supervised child");
    let child = command.spawn().map_err(|e| RuntimeError::Spawn {
        container: container.to_string(),
        phase: Phase::Execute,
        source: e,
    })?;

    debug!(pid = child.id(), "Supervised child running execute and destroy");
    Ok(SupervisedProcess {
        child,
        container: container.to_string(),
        shell: shell.to_path_buf(),
        destroy: destroy.to_string(),
        started_at: Utc::now(),
    })
}

fn wait_child(
    child: &mut Child,
    timeout: Option<Duration>,
    container: &str,
    phase: Phase,
) -> Result<ExitOutcome, RuntimeError> {
    let wait_err = |e| RuntimeError::Wait {
        container: container.to_string(),
        phase,
        source: e,
    };

    let Some(timeout) = timeout else {
        return child.wait().map(ExitOutcome::from).map_err(wait_err);
    };

    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status.into()),
            Ok(None) => {
                if start.elapsed() > timeout {
                    return Err(RuntimeError::Timeout {
                        container: container.to_string(),
                        phase,
                        timeout_ms: timeout.as_millis(),
                    });
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(wait_err(e)),
        }
    }
}

fn fd_sweep_limit() -> i32 {
    match sysconf(SysconfVar::OPEN_MAX) {
        Ok(Some(max)) => i32::try_from(max).unwrap_or(DEFAULT_FD_SWEEP).min(65536),
        _ => DEFAULT_FD_SWEEP,
    }
}

fn mark_inherited_fds_cloexec(limit: i32) {
    for fd in 3..limit {
        // EBADF for unused slots is expected.
        let _ = fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh() -> &'static Path {
        Path::new("/bin/sh")
    }

    #[test]
    fn test_exit_outcome_codes() {
        assert!(ExitOutcome::Exited(0).success());
        assert!(!ExitOutcome::Exited(3).success());
        assert_eq!(ExitOutcome::Exited(3).exit_code(), 3);
        assert_eq!(ExitOutcome::Signaled(9).exit_code(), 137);
        assert_eq!(ExitOutcome::Signaled(2).to_string(), "terminated by signal 2");
    }

    #[test]
    fn test_run_phase_success() {
        let outcome = run_phase(sh(), "c", Phase::Create, "true", None).unwrap();
        assert_eq!(outcome, ExitOutcome::Exited(0));
    }

    #[test]
    fn test_run_phase_failure_reports_outcome() {
        let result = run_phase(sh(), "c", Phase::Create, "exit 4", None);
        match result {
            Err(RuntimeError::PhaseFailed { phase, outcome, .. }) => {
                assert_eq!(phase, Phase::Create);
                assert_eq!(outcome, ExitOutcome::Exited(4));
            }
            other => panic!("expected PhaseFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_run_phase_timeout() {
        let result = run_phase(
            sh(),
            "c",
            Phase::Create,
            "sleep 5",
            Some(Duration::from_millis(100)),
        );
        assert!(matches!(result, Err(RuntimeError::Timeout { .. })));
    }

    #[test]
    fn test_spawn_supervised_returns_before_child_finishes() {
        let start = Instant::now();
        let mut child = spawn_supervised(sh(), "c", "sleep 1", "true").unwrap();
        assert!(start.elapsed() < Duration::from_millis(900));
        assert!(child.try_outcome().unwrap().is_none());

        let reaped = child.wait(None).unwrap();
        assert_eq!(reaped.outcome, ExitOutcome::Exited(0));
        assert!(reaped.forced_destroy.is_none());
    }

    #[test]
    fn test_supervised_reports_destroy_status() {
        let mut child = spawn_supervised(sh(), "c", "false", "exit 7").unwrap();
        assert_eq!(child.wait(None).unwrap().outcome, ExitOutcome::Exited(7));
    }

    #[test]
    fn test_supervised_wait_timeout_kills_child() {
        let mut child = spawn_supervised(sh(), "c", "sleep 5", "true").unwrap();
        let reaped = child.wait(Some(Duration::from_millis(100))).unwrap();
        assert_eq!(reaped.outcome, ExitOutcome::Signaled(9));
        assert!(matches!(reaped.forced_destroy, Some(Ok(ExitOutcome::Exited(0)))));
    }

    fn process_gone(pid: &str) -> bool {
        // A killed grandchild may linger as a zombie until init reaps it.
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit_once(')')
                .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        }
    }

    #[test]
    fn test_supervised_timeout_kills_workload_and_reruns_destroy() {
        let temp_dir = tempfile::TempDir::new().expect("failed to create temp dir");
        let pid_file = temp_dir.path().join("workload.pid");
        let marker = temp_dir.path().join("destroyed");

        // The workload is a grandchild: sh forks it because destroy follows.
        let execute = format!("sh -c 'echo $$ > {}; exec sleep 5'", pid_file.display());
        let destroy = format!("echo destroyed >> {}", marker.display());
        let mut child = spawn_supervised(sh(), "c", &execute, &destroy).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while !pid_file.exists() && Instant::now() < deadline {
            std::thread::sleep(POLL_INTERVAL);
        }
        let reaped = child.wait(Some(Duration::from_millis(200))).unwrap();

        assert_eq!(reaped.outcome, ExitOutcome::Signaled(9));
        assert!(matches!(reaped.forced_destroy, Some(Ok(_))));
        assert_eq!(
            std::fs::read_to_string(&marker).expect("failed to read destroy marker"),
            "destroyed\n"
        );

        let pid = std::fs::read_to_string(&pid_file).expect("failed to read workload pid");
        let pid = pid.trim();
        let deadline = Instant::now() + Duration::from_secs(1);
        while !process_gone(pid) && Instant::now() < deadline {
            std::thread::sleep(POLL_INTERVAL);
        }
        assert!(process_gone(pid), "workload {pid} survived the kill");
    }

    #[test]
    fn test_supervised_destroy_failure_after_kill_is_reported() {
        let mut child = spawn_supervised(sh(), "c", "sleep 5", "exit 3").unwrap();
        let reaped = child.wait(Some(Duration::from_millis(100))).unwrap();
        assert!(matches!(
            reaped.forced_destroy,
            Some(Err(RuntimeError::PhaseFailed { phase: Phase::Destroy, .. }))
        ));
    }
}
