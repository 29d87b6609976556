//! Replica fan-out and per-replica supervision.
//!
//! `plan_replicas` expands the Procfile and concurrency settings into the full
//! list of replicas to run. `Supervisor::spawn_replicas` starts one
//! coordination task per replica and registers it with a task tracker, so the
//! entry point can wait for all of them after the group is torn down.
//!
//! Each coordination task is a small state machine:
//!
//! ```text
//! Starting -> Running -> Exited ------------------------> (restart) Starting
//!                    \                                 \-> (no restart) trip barrier, Done
//!                     -> Stopping -> Killing -> Reaping -> Done
//!                                \-------------/
//! ```

use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tokio_util::task::TaskTracker;

use crate::concurrency::Concurrency;
use crate::env::Env;
use crate::output::OutputRouter;
use crate::process::{ProcessHandle, RunningProcess, GRACEFUL_TERMINATE_SUPPORTED};
use crate::procfile::ProcessTemplate;
use crate::shutdown::ShutdownBarrier;

/// Time a child gets between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);

/// First pause after a failed launch. Doubles with each consecutive failure.
pub const LAUNCH_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Port block reserved for each template.
pub const PORT_STRIDE: u32 = 100;

/// One replica to run: `(template_index, replica_index)` plus what is derived
/// from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    pub template_index: usize,
    pub replica_index: usize,
    /// `"{template}.{replica_index + 1}"`.
    pub name: String,
    pub command: String,
    /// `base_port + template_index * 100`.
    pub port: u16,
}

/// Expands templates into replicas.
///
/// Ports are derived from the template position, so all replicas of one
/// template share a port.
pub fn plan_replicas(
    templates: &[ProcessTemplate],
    concurrency: &Concurrency,
    filter: Option<&str>,
    base_port: u16,
) -> Result<Vec<Replica>> {
    if let Some(name) = filter {
        if !templates.iter().any(|template| template.name == name) {
            bail!("no such process: {}", name);
        }
    }

    let mut replicas = Vec::new();
    for (template_index, template) in templates.iter().enumerate() {
        if filter.is_some_and(|name| name != template.name) {
            continue;
        }
        let count = concurrency.replicas(&template.name);
        if count == 0 {
            continue;
        }
        let port = u32::from(base_port) + template_index as u32 * PORT_STRIDE;
        let port = u16::try_from(port)
            .map_err(|_| anyhow!("port {} for {} is out of range", port, template.name))?;
        for replica_index in 0..usize::from(count) {
            replicas.push(Replica {
                template_index,
                replica_index,
                name: format!("{}.{}", template.name, replica_index + 1),
                command: template.command.clone(),
                port,
            });
        }
    }
    Ok(replicas)
}

/// Runtime knobs shared by every coordination task.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Working directory for every child (the Procfile's directory).
    pub root: PathBuf,
    /// Relaunch replicas that exit on their own instead of tearing down.
    pub restart: bool,
    /// Pause before a relaunch.
    pub restart_delay: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub grace_period: Duration,
}

/// Owns the barrier pair and the set of coordination tasks.
pub struct Supervisor {
    barrier: ShutdownBarrier,
    router: Arc<OutputRouter>,
    env: Arc<Env>,
    settings: Arc<SupervisorSettings>,
    tracker: TaskTracker,
}

impl Supervisor {
    pub fn new(
        barrier: ShutdownBarrier,
        router: Arc<OutputRouter>,
        env: Env,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            barrier,
            router,
            env: Arc::new(env),
            settings: Arc::new(settings),
            tracker: TaskTracker::new(),
        }
    }

    /// Starts one coordination task per replica without waiting on any of
    /// them. Returns the number of tasks spawned.
    pub fn spawn_replicas(&self, replicas: Vec<Replica>) -> usize {
        let mut spawned = 0;
        for replica in replicas {
            let mut env = (*self.env).clone();
            env.insert("PORT".to_string(), replica.port.to_string());
            let handle = ProcessHandle {
                name: replica.name.clone(),
                command: replica.command.clone(),
                env,
                root: self.settings.root.clone(),
                slot: replica.template_index,
            };
            let coordinator = Coordinator {
                replica,
                handle,
                barrier: self.barrier.clone(),
                router: Arc::clone(&self.router),
                settings: Arc::clone(&self.settings),
            };
            self.tracker.spawn(coordinator.run());
            spawned += 1;
        }
        spawned
    }

    /// Number of coordination tasks that have not finished yet.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Blocks until the graceful barrier trips, then until every replica has
    /// reaped its child.
    pub async fn run_until_shutdown(&self) {
        self.barrier.graceful().await;
        self.router.system("shutting down");
        tracing::debug!(remaining = self.active(), "waiting for replicas to finish");
        self.wait().await;
    }

    /// Waits for every spawned coordination task to finish.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

enum Phase {
    Starting { launch_failures: u32 },
    Running(RunningProcess),
    Exited { launch_failures: u32 },
    Stopping(RunningProcess),
    Killing(RunningProcess),
    Reaping(RunningProcess),
    Done,
}

struct Coordinator {
    replica: Replica,
    handle: ProcessHandle,
    barrier: ShutdownBarrier,
    router: Arc<OutputRouter>,
    settings: Arc<SupervisorSettings>,
}

impl Coordinator {
    async fn run(self) {
        let mut phase = Phase::Starting { launch_failures: 0 };
        loop {
            phase = match phase {
                Phase::Starting { launch_failures } => self.start(launch_failures),
                Phase::Running(process) => self.watch(process).await,
                Phase::Exited { launch_failures } => self.after_exit(launch_failures).await,
                Phase::Stopping(process) => self.stop(process).await,
                Phase::Killing(process) => self.kill(process),
                Phase::Reaping(process) => {
                    self.reap(process).await;
                    Phase::Done
                }
                Phase::Done => break,
            };
        }
        tracing::debug!(
            name = %self.replica.name,
            template = self.replica.template_index,
            replica = self.replica.replica_index,
            "coordinator finished"
        );
    }

    fn start(&self, launch_failures: u32) -> Phase {
        self.router.system(format!(
            "starting {} on port {}",
            self.replica.name, self.replica.port
        ));
        match self.handle.start(&self.router) {
            Ok(process) => Phase::Running(process),
            Err(err) => {
                self.router
                    .system(format!("failed to start {}: {:#}", self.replica.name, err));
                Phase::Exited {
                    launch_failures: launch_failures.saturating_add(1),
                }
            }
        }
    }

    // Races the child's own exit against the graceful barrier.
    async fn watch(&self, mut process: RunningProcess) -> Phase {
        let exited = tokio::select! {
            status = process.wait() => Some(status),
            _ = self.barrier.graceful() => None,
        };
        match exited {
            None => Phase::Stopping(process),
            Some(Ok(status)) => {
                self.router.system(exit_message(&self.replica.name, status));
                Phase::Exited { launch_failures: 0 }
            }
            Some(Err(err)) => {
                tracing::warn!(name = %self.replica.name, error = %err, "wait failed, killing");
                self.abandon(process).await
            }
        }
    }

    // Lost track of the child: kill and reap it before treating it as exited.
    async fn abandon(&self, mut process: RunningProcess) -> Phase {
        process.send_force_kill();
        self.reap(process).await;
        Phase::Exited { launch_failures: 0 }
    }

    async fn after_exit(&self, launch_failures: u32) -> Phase {
        if !self.settings.restart {
            self.barrier.signal_shutdown();
            return Phase::Done;
        }
        if self.barrier.is_shutting_down() {
            return Phase::Done;
        }
        let delay = restart_delay(launch_failures, self.settings.restart_delay);
        if delay.is_zero() {
            tokio::task::yield_now().await;
            return Phase::Starting { launch_failures };
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => Phase::Starting { launch_failures },
            _ = self.barrier.graceful() => Phase::Done,
        }
    }

    async fn stop(&self, mut process: RunningProcess) -> Phase {
        if !GRACEFUL_TERMINATE_SUPPORTED {
            return Phase::Killing(process);
        }
        self.router
            .system(format!("sending SIGTERM to {}", self.replica.name));
        process.send_graceful_terminate();

        let escalate = tokio::select! {
            _ = tokio::time::sleep(self.settings.grace_period) => true,
            _ = self.barrier.urgent() => true,
            _ = process.wait() => false,
        };
        if escalate {
            Phase::Killing(process)
        } else {
            Phase::Reaping(process)
        }
    }

    fn kill(&self, mut process: RunningProcess) -> Phase {
        self.router.system(format!("killing {}", self.replica.name));
        tracing::debug!(
            name = %self.replica.name,
            pid = ?process.pid(),
            urgent = self.barrier.is_urgent(),
            "force kill"
        );
        process.send_force_kill();
        Phase::Reaping(process)
    }

    async fn reap(&self, mut process: RunningProcess) {
        match process.wait().await {
            Ok(status) => {
                tracing::debug!(name = %self.replica.name, %status, "process reaped")
            }
            Err(err) => {
                tracing::warn!(name = %self.replica.name, error = %err, "failed to reap process")
            }
        }
    }
}

/// Pause before relaunching. Consecutive launch failures back off
/// exponentially so a replica that cannot start never spins.
fn restart_delay(launch_failures: u32, configured: Duration) -> Duration {
    if launch_failures == 0 {
        return configured;
    }
    let capped = launch_failures.saturating_sub(1).min(5);
    configured.max(LAUNCH_RETRY_DELAY * (1_u32 << capped))
}

fn exit_message(name: &str, status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("{} exited with code {}", name, code),
        None => format!("{} exited", name),
    }
}
