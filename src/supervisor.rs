use std::{
    path::Path,
    process::{ExitStatus, Stdio},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use thiserror::Error;
use tokio::{
    process::{Child, Command},
    sync::{oneshot, watch, Mutex},
    task::JoinHandle,
};

use crate::{model::CommandSpec, output::forward_output};

const APP_LOG_TARGET: &str = "repo_watchdog::app";

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("An instance is already running (pid {pid:?})")]
    AlreadyRunning { pid: Option<u32> },
    #[error("Could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Exited { code: i32 },
    /// Killed by a signal that the supervisor did not send.
    Signaled,
    Stopped,
    /// Waiting on the child failed, so how it ended is not known.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub generation: u64,
    pub kind: ExitKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotRunning,
    Running { generation: u64, pid: Option<u32> },
    /// Asked to terminate but not exited yet. Still counts as running.
    Stopping { generation: u64, pid: Option<u32> },
}

/// Keeps at most one instance of the application alive.
#[async_trait]
pub trait Supervisor {
    /// Returns as soon as the process is spawned. Must not be called while an
    /// instance is running.
    async fn launch(&self, spec: &CommandSpec, work_dir: &Path) -> Result<(), LaunchError>;

    async fn is_running(&self) -> bool;

    /// Terminates the running instance and waits until it has exited.
    /// Does nothing when no instance is running.
    async fn stop(&self);
}

struct Instance {
    generation: u64,
    pid: Option<u32>,
    /// Taken by the first `stop`, the instance stays in the slot until it exits.
    stop_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

#[derive(Default)]
struct Slot {
    current: Option<Instance>,
    last_exit: Option<ExitReport>,
    generations: u64,
}

pub struct ProcessSupervisor {
    name: String,
    stop_timeout: Duration,
    slot: Arc<Mutex<Slot>>,
}

impl ProcessSupervisor {
    /// `stop_timeout` bounds how long a stopped instance may take to exit
    /// after SIGTERM before it is killed.
    pub fn new(name: impl Into<String>, stop_timeout: Duration) -> Self {
        ProcessSupervisor {
            name: name.into(),
            stop_timeout,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    pub async fn state(&self) -> ProcessState {
        match &self.slot.lock().await.current {
            Some(instance) if instance.stop_tx.is_none() => ProcessState::Stopping {
                generation: instance.generation,
                pid: instance.pid,
            },
            Some(instance) => ProcessState::Running {
                generation: instance.generation,
                pid: instance.pid,
            },
            None => ProcessState::NotRunning,
        }
    }

    pub async fn last_exit(&self) -> Option<ExitReport> {
        self.slot.lock().await.last_exit
    }
}

#[async_trait]
impl Supervisor for ProcessSupervisor {
    async fn launch(&self, spec: &CommandSpec, work_dir: &Path) -> Result<(), LaunchError> {
        // Held until the instance is stored, so the exit monitor cannot run ahead of us
        let mut slot = self.slot.lock().await;
        if let Some(instance) = &slot.current {
            return Err(LaunchError::AlreadyRunning { pid: instance.pid });
        }

        let generation = slot.generations + 1;
        debug!(
            "Starting {} (generation {}): `{}` in {}",
            self.name,
            generation,
            spec,
            work_dir.display()
        );

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                program: spec.program.clone(),
                source,
            })?;
        slot.generations = generation;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let label = self.name.clone();
        let drain = tokio::spawn(async move {
            forward_output(stdout, stderr, APP_LOG_TARGET, &label).await;
            trace!("Output of {} closed", label);
        });

        let (stop_tx, stop_rx) = oneshot::channel();
        let (exited_tx, exited) = watch::channel(false);
        tokio::spawn(monitor(ExitMonitor {
            child,
            drain,
            stop_rx,
            exited_tx,
            generation,
            slot: Arc::clone(&self.slot),
            stop_timeout: self.stop_timeout,
            name: self.name.clone(),
        }));

        slot.current = Some(Instance {
            generation,
            pid,
            stop_tx: Some(stop_tx),
            exited,
        });
        info!("Launched {} (pid {:?})", self.name, pid);
        Ok(())
    }

    async fn is_running(&self) -> bool {
        self.slot.lock().await.current.is_some()
    }

    async fn stop(&self) {
        // The instance stays in the slot until the exit monitor removes it, so
        // `launch` keeps refusing while the old process is still alive
        let (generation, mut exited) = {
            let mut slot = self.slot.lock().await;
            let Some(instance) = slot.current.as_mut() else {
                trace!("No instance of {} to stop", self.name);
                return;
            };
            match instance.stop_tx.take() {
                Some(stop_tx) => {
                    info!("Stopping {} (pid {:?})", self.name, instance.pid);
                    // The monitor may have just seen a natural exit, in which case nobody listens
                    let _ = stop_tx.send(());
                }
                None => debug!("{} is already stopping, waiting for it", self.name),
            }
            (instance.generation, instance.exited.clone())
        };

        let reported = exited.wait_for(|done| *done).await.is_ok();
        if !reported {
            error!("Exit monitor of {} ended without reporting", self.name);
            let mut slot = self.slot.lock().await;
            if slot
                .current
                .as_ref()
                .is_some_and(|instance| instance.generation == generation)
            {
                slot.current = None;
            }
        }
        info!("Stopped {}", self.name);
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.try_lock() {
            if let Some(stop_tx) = slot.current.as_mut().and_then(|instance| instance.stop_tx.take()) {
                debug!("Supervisor dropped, terminating {} in the background", self.name);
                let _ = stop_tx.send(());
            }
        }
    }
}

struct ExitMonitor {
    child: Child,
    drain: JoinHandle<()>,
    stop_rx: oneshot::Receiver<()>,
    exited_tx: watch::Sender<bool>,
    generation: u64,
    slot: Arc<Mutex<Slot>>,
    stop_timeout: Duration,
    name: String,
}

async fn monitor(monitor: ExitMonitor) {
    let ExitMonitor {
        mut child,
        mut drain,
        stop_rx,
        exited_tx,
        generation,
        slot,
        stop_timeout,
        name,
    } = monitor;

    let kind = tokio::select! {
        status = child.wait() => exit_kind(status, &name),
        // A dropped sender means the supervisor is gone, terminate as well
        _ = stop_rx => {
            terminate(&mut child, stop_timeout, &name).await;
            ExitKind::Stopped
        }
    };

    {
        let mut slot = slot.lock().await;
        if slot
            .current
            .as_ref()
            .is_some_and(|instance| instance.generation == generation)
        {
            slot.current = None;
        }
        slot.last_exit = Some(ExitReport { generation, kind });
    }
    exited_tx.send_replace(true);

    match kind {
        ExitKind::Exited { code: 0 } => info!("{} exited normally", name),
        ExitKind::Exited { code } => warn!("{} exited with code {}", name, code),
        ExitKind::Signaled => warn!("{} was terminated by a signal", name),
        ExitKind::Stopped => debug!("{} terminated on request", name),
        ExitKind::Unknown => warn!("{} is gone, its exit status is unknown", name),
    }

    // Grandchildren may keep the pipes open after the child itself is gone
    if tokio::time::timeout(stop_timeout, &mut drain).await.is_err() {
        debug!("Output of {} still open after exit, detaching", name);
        drain.abort();
    }
}

fn exit_kind(status: std::io::Result<ExitStatus>, name: &str) -> ExitKind {
    match status {
        Ok(status) => match status.code() {
            Some(code) => ExitKind::Exited { code },
            None => ExitKind::Signaled,
        },
        Err(error) => {
            error!("Failed waiting for {}: {}", name, error);
            ExitKind::Unknown
        }
    }
}

async fn terminate(child: &mut Child, stop_timeout: Duration, name: &str) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            debug!("Sending SIGTERM to {} (pid {})", name, pid);
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => match tokio::time::timeout(stop_timeout, child.wait()).await {
                    Ok(_) => return,
                    Err(_) => warn!(
                        "{} did not exit within {:?}, sending SIGKILL",
                        name, stop_timeout
                    ),
                },
                Err(error) => warn!("Could not send SIGTERM to {}: {}", name, error),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = stop_timeout;

    if let Err(error) = child.kill().await {
        warn!("Could not kill {}: {}", name, error);
    }
}
