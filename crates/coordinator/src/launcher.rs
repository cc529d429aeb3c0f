//! Worker launchers
//!
//! A launcher turns one rank's worker-side queue ends into a running worker
//! unit. [`ProcessLauncher`] re-executes the `lockstep-worker` binary per
//! rank and bridges its stdin/stdout onto the queues; [`TaskLauncher`] runs
//! the unit as a tokio task in this process.
//!
//! Either way the launched worker reports its exit on the group's exit
//! channel so the group can notice ranks that die unexpectedly.

use crate::channels::WorkerEnds;
use lockstep_common::config::{
    rank_env, LaunchMode, LockstepConfig, RendezvousBackend, CONFIG_PATH_ENV,
};
use lockstep_common::error::{LockstepError, Result};
use lockstep_proto::Rank;
use lockstep_worker::frames::{read_frames, write_frames};
use lockstep_worker::{
    configured_factory, start_unit, GeneratorFactory, RendezvousParams, UnitSettings,
};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How a worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Clean,
    Failed(String),
    Killed,
}

/// Sent on the group's exit channel when a worker ends
#[derive(Debug, Clone)]
pub struct ExitNotice {
    pub rank: Rank,
    pub exit: WorkerExit,
}

pub type ExitSender = mpsc::UnboundedSender<ExitNotice>;

/// A running worker unit
pub struct WorkerProcess {
    rank: Rank,
    pid: Option<u32>,
    done: JoinHandle<WorkerExit>,
    kill: Option<oneshot::Sender<()>>,
}

impl WorkerProcess {
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// OS process id, `None` for in-process workers
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Wait up to `timeout` for the worker to end, killing it otherwise
    pub async fn stop(mut self, timeout: Duration) -> WorkerExit {
        match tokio::time::timeout(timeout, &mut self.done).await {
            Ok(Ok(exit)) => exit,
            Ok(Err(e)) if e.is_cancelled() => WorkerExit::Killed,
            Ok(Err(e)) => WorkerExit::Failed(format!("worker task panicked: {}", e)),
            Err(_) => {
                warn!(rank = self.rank, ?timeout, "Worker did not exit in time, killing");
                self.kill();
                match self.done.await {
                    Ok(exit) => exit,
                    Err(_) => WorkerExit::Killed,
                }
            }
        }
    }

    /// Terminate the worker without waiting
    pub fn kill(&mut self) {
        match self.kill.take() {
            Some(tx) => {
                let _ = tx.send(());
            }
            None => self.done.abort(),
        }
    }
}

/// Starts worker units
pub trait Launcher: Send + Sync {
    /// Start rank `ends.rank` of a group of `world_size`
    fn launch(
        &self,
        world_size: usize,
        ends: WorkerEnds,
        exits: ExitSender,
    ) -> Result<WorkerProcess>;

    /// Name for logs
    fn mode(&self) -> LaunchMode;
}

/// Pick the launcher named by `group.launch`
pub fn launcher_for(
    config: &LockstepConfig,
    config_path: Option<PathBuf>,
) -> Result<Box<dyn Launcher>> {
    Ok(match config.group.launch {
        LaunchMode::Process => Box::new(ProcessLauncher::from_config(config, config_path)?),
        LaunchMode::InProcess => Box::new(TaskLauncher::from_config(config)),
    })
}

/// One OS process per rank
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    worker_binary: PathBuf,
    config_path: Option<PathBuf>,
    master_addr: String,
    master_port: u16,
}

impl ProcessLauncher {
    pub fn from_config(config: &LockstepConfig, config_path: Option<PathBuf>) -> Result<Self> {
        let worker_binary = match &config.group.worker_binary {
            Some(path) => path.clone(),
            None => default_worker_binary()?,
        };
        if !worker_binary.is_file() {
            return Err(LockstepError::config(format!(
                "worker binary {} not found",
                worker_binary.display()
            )));
        }

        Ok(Self {
            worker_binary,
            config_path,
            master_addr: config.group.rendezvous.address.clone(),
            master_port: config.group.rendezvous.port,
        })
    }
}

fn default_worker_binary() -> Result<PathBuf> {
    let current = std::env::current_exe()?;
    Ok(current.with_file_name(format!("lockstep-worker{}", std::env::consts::EXE_SUFFIX)))
}

impl Launcher for ProcessLauncher {
    fn launch(
        &self,
        world_size: usize,
        ends: WorkerEnds,
        exits: ExitSender,
    ) -> Result<WorkerProcess> {
        let rank = ends.rank;
        info!(rank, world_size, binary = %self.worker_binary.display(), "Spawning worker process");

        let mut command = Command::new(&self.worker_binary);
        command
            .env(rank_env::RANK, rank.to_string())
            .env(rank_env::WORLD_SIZE, world_size.to_string())
            // Single host: the local rank is the rank.
            .env(rank_env::LOCAL_RANK, rank.to_string())
            .env(rank_env::MASTER_ADDR, &self.master_addr)
            .env(rank_env::MASTER_PORT, self.master_port.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(path) = &self.config_path {
            command.env(CONFIG_PATH_ENV, path);
        }
        // Terminal interrupts go to the coordinator only; workers stop on
        // the shutdown sentinel.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            LockstepError::worker_unavailable(format!(
                "failed to spawn worker rank {}: {}",
                rank, e
            ))
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LockstepError::internal("worker stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LockstepError::internal("worker stdout not captured"))?;

        let WorkerEnds { inbound, outbound, .. } = ends;
        tokio::spawn(async move {
            if let Err(e) = write_frames(stdin, inbound).await {
                debug!(rank, error = %e, "Worker stdin closed");
            }
        });
        tokio::spawn(async move {
            if let Err(e) = read_frames(stdout, outbound).await {
                debug!(rank, error = %e, "Worker stdout closed");
            }
        });

        let (kill_tx, kill_rx) = oneshot::channel();
        let done = tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) if status.success() => WorkerExit::Clean,
                    Ok(status) => WorkerExit::Failed(format!("exited with {}", status)),
                    Err(e) => WorkerExit::Failed(format!("wait failed: {}", e)),
                },
                _ = kill_rx => {
                    if let Err(e) = child.kill().await {
                        warn!(rank, error = %e, "Failed to kill worker process");
                    }
                    WorkerExit::Killed
                }
            };
            let _ = exits.send(ExitNotice { rank, exit: exit.clone() });
            exit
        });

        Ok(WorkerProcess {
            rank,
            pid,
            done,
            kill: Some(kill_tx),
        })
    }

    fn mode(&self) -> LaunchMode {
        LaunchMode::Process
    }
}

/// One tokio task per rank
#[derive(Clone)]
pub struct TaskLauncher {
    backend: RendezvousBackend,
    master_addr: String,
    master_port: u16,
    settings: UnitSettings,
    factory: GeneratorFactory,
    ready_timeout: Duration,
}

impl TaskLauncher {
    pub fn from_config(config: &LockstepConfig) -> Self {
        Self::with_factory(config, configured_factory(config))
    }

    /// Use `factory` instead of the configured backend
    pub fn with_factory(config: &LockstepConfig, factory: GeneratorFactory) -> Self {
        Self {
            backend: config.group.rendezvous.backend,
            master_addr: config.group.rendezvous.address.clone(),
            master_port: config.group.rendezvous.port,
            settings: UnitSettings::from_config(config),
            factory,
            ready_timeout: config.ready_timeout(),
        }
    }
}

impl Launcher for TaskLauncher {
    fn launch(
        &self,
        world_size: usize,
        ends: WorkerEnds,
        exits: ExitSender,
    ) -> Result<WorkerProcess> {
        let rank = ends.rank;
        debug!(rank, world_size, "Starting in-process worker");

        let params = RendezvousParams {
            backend: self.backend,
            rank,
            world_size,
            address: self.master_addr.clone(),
            port: self.master_port,
        };
        let unit = start_unit(
            params,
            self.settings.clone(),
            self.factory.clone(),
            self.ready_timeout,
            ends.inbound,
            ends.outbound,
        );

        let done = tokio::spawn(async move {
            let exit = match unit.await {
                Ok(()) => WorkerExit::Clean,
                Err(e) => WorkerExit::Failed(e.to_string()),
            };
            let _ = exits.send(ExitNotice { rank, exit: exit.clone() });
            exit
        });

        Ok(WorkerProcess {
            rank,
            pid: None,
            done,
            kill: None,
        })
    }

    fn mode(&self) -> LaunchMode {
        LaunchMode::InProcess
    }
}
