//! A single supervised child process.
//!
//! `ProcessHandle` describes how to launch one replica (command, environment,
//! working directory, output sinks). `start` turns it into a `RunningProcess`
//! that the owning coordination task waits on and signals.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::env::Env;
use crate::output::{OutputRouter, StreamKind};

/// Whether the platform can ask a child to terminate gracefully.
#[cfg(unix)]
pub const GRACEFUL_TERMINATE_SUPPORTED: bool = true;
#[cfg(not(unix))]
pub const GRACEFUL_TERMINATE_SUPPORTED: bool = false;

/// How long `wait` keeps draining output after the child exits. Descendants
/// that outlive the child can hold the pipes open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Signals the supervisor sends to its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigTerm,
    SigKill,
}

impl ProcessSignal {
    pub fn label(self) -> &'static str {
        match self {
            ProcessSignal::SigTerm => "SIGTERM",
            ProcessSignal::SigKill => "SIGKILL",
        }
    }
}

/// Launch description for one replica.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    /// Display name, e.g. `web.1`.
    pub name: String,
    /// Shell command line.
    pub command: String,
    /// Variables added on top of the inherited environment.
    pub env: Env,
    /// Working directory.
    pub root: PathBuf,
    /// Template slot, selects the label color.
    pub slot: usize,
}

/// A launched child owned by exactly one coordination task.
pub struct RunningProcess {
    name: String,
    child: Child,
    pid: Option<u32>,
    pumps: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
    /// Spawns the child with stdin closed and both output streams attached to
    /// `router`.
    pub fn start(&self, router: &Arc<OutputRouter>) -> Result<RunningProcess> {
        let mut command = shell_command(&self.command);
        command
            .current_dir(&self.root)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.kill_on_drop(true);

        // Own process group so signals reach everything the shell spawns.
        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.name))?;
        let pid = child.id();
        tracing::debug!(name = %self.name, pid = ?pid, "process spawned");

        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            let outlet = router.sink(&self.name, self.slot, StreamKind::Stdout);
            pumps.push(tokio::spawn(outlet.pump(stdout)));
        }
        if let Some(stderr) = child.stderr.take() {
            let outlet = router.sink(&self.name, self.slot, StreamKind::Stderr);
            pumps.push(tokio::spawn(outlet.pump(stderr)));
        }

        Ok(RunningProcess {
            name: self.name.clone(),
            child,
            pid,
            pumps,
        })
    }
}

impl RunningProcess {
    /// Waits for the child to exit, reaps it and forwards whatever output it
    /// left in the pipes. Safe to call again after it has returned; the cached
    /// status is handed back.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        let status = self
            .child
            .wait()
            .await
            .with_context(|| format!("failed to wait for {}", self.name))?;
        self.drain_output().await;
        Ok(status)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    // Handles stay in `pumps` until they finish, so a cancelled wait resumes
    // draining on the next call.
    async fn drain_output(&mut self) {
        let deadline = tokio::time::Instant::now() + OUTPUT_DRAIN_TIMEOUT;
        while let Some(pump) = self.pumps.last_mut() {
            if tokio::time::timeout_at(deadline, pump).await.is_err() {
                tracing::debug!(name = %self.name, "output still open after exit, detaching");
                self.pumps.clear();
                return;
            }
            self.pumps.pop();
        }
    }

    /// Asks the child's process group to terminate.
    pub fn send_graceful_terminate(&self) {
        if let Some(pid) = self.pid {
            send_os_signal(&self.name, pid, ProcessSignal::SigTerm);
        }
    }

    /// Kills the child's process group outright.
    pub fn send_force_kill(&mut self) {
        if let Some(pid) = self.pid {
            send_os_signal(&self.name, pid, ProcessSignal::SigKill);
        }
        if let Err(err) = self.child.start_kill() {
            tracing::debug!(name = %self.name, error = %err, "start_kill failed");
        }
    }
}

#[cfg(unix)]
fn shell_command(line: &str) -> Command {
    let mut command = Command::new("/bin/sh");
    command.arg("-c").arg(line);
    command
}

#[cfg(not(unix))]
fn shell_command(line: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(line);
    command
}

#[cfg(unix)]
fn send_os_signal(name: &str, pid: u32, signal: ProcessSignal) {
    let sig = match signal {
        ProcessSignal::SigTerm => libc::SIGTERM,
        ProcessSignal::SigKill => libc::SIGKILL,
    };
    let pid = pid as i32;
    // The child leads its own group, so the group send already reaches it.
    // Signalling the leader as well would deliver the signal twice.
    if unsafe { libc::kill(-pid, sig) } == 0 {
        return;
    }
    let mut err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        if unsafe { libc::kill(pid, sig) } == 0 {
            return;
        }
        err = std::io::Error::last_os_error();
    }
    tracing::warn!(
        name,
        pid,
        signal = signal.label(),
        error = %err,
        "signal delivery failed"
    );
}

#[cfg(not(unix))]
fn send_os_signal(name: &str, pid: u32, signal: ProcessSignal) {
    // Only SIGKILL has a counterpart here and `start_kill` covers it.
    tracing::debug!(name, pid, signal = signal.label(), "no OS signal sent");
}

/// Runs `line` through the platform shell in the foreground with stdio
/// inherited, returning its exit status.
pub async fn run_foreground(line: &str, env: &Env, root: &std::path::Path) -> Result<ExitStatus> {
    let mut command = shell_command(line);
    command.current_dir(root).envs(env);
    let status = command
        .status()
        .await
        .with_context(|| format!("failed to run {}", line))?;
    Ok(status)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::output::{test_router, SharedBuffer};

    fn handle(command: &str, env: Env) -> ProcessHandle {
        ProcessHandle {
            name: "web.1".into(),
            command: command.into(),
            env,
            root: std::env::temp_dir(),
            slot: 0,
        }
    }

    #[tokio::test]
    async fn start_routes_output_and_env() {
        let buffer = SharedBuffer::default();
        let router = test_router(&buffer);
        let mut env = Env::new();
        env.insert("PORT".into(), "5000".into());
        let mut process = handle("echo port=$PORT; echo oops >&2", env)
            .start(&router)
            .unwrap();
        let status = process.wait().await.unwrap();
        assert!(status.success());
        let lines = buffer.lines();
        assert!(lines.contains(&"web.1      | port=5000".to_string()));
        assert!(lines.contains(&"web.1      | oops".to_string()));
    }

    #[tokio::test]
    async fn graceful_terminate_stops_child() {
        let buffer = SharedBuffer::default();
        let router = test_router(&buffer);
        let mut process = handle("sleep 30", Env::new()).start(&router).unwrap();
        process.send_graceful_terminate();
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), process.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn wait_returns_after_the_last_line_is_written() {
        let buffer = SharedBuffer::default();
        let router = test_router(&buffer);
        let mut process = handle("seq 1 3000 | sed s/^/line/", Env::new())
            .start(&router)
            .unwrap();
        process.wait().await.unwrap();
        let lines = buffer.lines();
        assert_eq!(lines.len(), 3000);
        assert_eq!(lines.last().unwrap(), "web.1      | line3000");
    }

    #[tokio::test]
    async fn graceful_terminate_is_delivered_once() {
        let buffer = SharedBuffer::default();
        let router = test_router(&buffer);
        let script = "n=0; trap 'n=$((n+1)); echo term$n' TERM; echo ready; \
                      i=0; while [ $i -lt 20 ]; do i=$((i+1)); sleep 0.05; done; echo done";
        let mut process = handle(script, Env::new()).start(&router).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !buffer.contents().contains("| ready") {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        process.send_graceful_terminate();
        tokio::time::timeout(std::time::Duration::from_secs(5), process.wait())
            .await
            .unwrap()
            .unwrap();
        let lines = buffer.lines();
        assert_eq!(lines.iter().filter(|line| line.contains("| term")).count(), 1);
        assert!(lines.contains(&"web.1      | done".to_string()));
    }

    #[tokio::test]
    async fn force_kill_stops_child_ignoring_term() {
        let buffer = SharedBuffer::default();
        let router = test_router(&buffer);
        let mut process = handle("trap '' TERM; sleep 30", Env::new())
            .start(&router)
            .unwrap();
        process.send_force_kill();
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), process.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
        // A second wait returns the cached status.
        assert_eq!(process.wait().await.unwrap(), status);
    }

    #[tokio::test]
    async fn bad_working_directory_fails_to_start() {
        let buffer = SharedBuffer::default();
        let router = test_router(&buffer);
        let mut bad = handle("true", Env::new());
        bad.root = PathBuf::from("/definitely/not/a/dir");
        assert!(bad.start(&router).is_err());
    }
}
