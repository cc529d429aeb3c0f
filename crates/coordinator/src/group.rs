//! Execution group
//!
//! Owns every rank's worker and queue pair for the lifetime of the service.
//! Startup spawns all ranks before waiting on any of them, since the
//! rendezvous needs every participant present, then reads exactly one
//! readiness token per rank in rank order.
//!
//! The channel set sits behind a single async mutex. Holding that mutex is
//! the permit for one fan-out/fan-in cycle; concurrent requests queue on it.

use crate::channels::{rank_pair, ChannelSet, RankChannels};
use crate::launcher::{ExitNotice, Launcher, WorkerExit, WorkerProcess};
use lockstep_common::config::LockstepConfig;
use lockstep_common::error::{LockstepError, Result};
use lockstep_common::METRICS;
use lockstep_proto::{Rank, WorkerCommand, WorkerEvent};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, MutexGuard};
use tracing::{debug, error, info, warn};

/// Group lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum GroupStatus {
    Starting,
    Ready,
    Failed(String),
    Stopping,
    Stopped,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Starting => "starting",
            GroupStatus::Ready => "ready",
            GroupStatus::Failed(_) => "failed",
            GroupStatus::Stopping => "stopping",
            GroupStatus::Stopped => "stopped",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            GroupStatus::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

/// Coordinator's view of one rank
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RankState {
    Starting,
    Idle,
    Busy,
    Stopped,
    Dead,
}

/// Fixed parameters of a group
#[derive(Debug, Clone)]
pub struct GroupSettings {
    pub size: usize,
    pub rendezvous_address: String,
    pub rendezvous_port: u16,
    pub ready_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl From<&LockstepConfig> for GroupSettings {
    fn from(config: &LockstepConfig) -> Self {
        Self {
            size: config.group.size,
            rendezvous_address: config.group.rendezvous.address.clone(),
            rendezvous_port: config.group.rendezvous.port,
            ready_timeout: config.ready_timeout(),
            shutdown_timeout: config.shutdown_timeout(),
        }
    }
}

/// One rank's worker and state
struct WorkerHandle {
    state: RankState,
    process: Option<WorkerProcess>,
}

/// The fixed set of ranks serving one model
pub struct ExecutionGroup {
    settings: GroupSettings,
    channels: tokio::sync::Mutex<ChannelSet>,
    workers: Mutex<Vec<WorkerHandle>>,
    status: RwLock<GroupStatus>,
    next_seq: AtomicU64,
}

impl ExecutionGroup {
    /// Start every rank and wait until all of them report ready
    ///
    /// Fails (after tearing down whatever was started) if a rank reports a
    /// startup failure, exits, or stays silent past the ready timeout.
    pub async fn start(settings: GroupSettings, launcher: &dyn Launcher) -> Result<Arc<Self>> {
        let size = settings.size;
        if size == 0 {
            return Err(LockstepError::config("execution group needs at least one rank"));
        }

        info!(
            size,
            mode = ?launcher.mode(),
            rendezvous = %format!("{}:{}", settings.rendezvous_address, settings.rendezvous_port),
            "Starting execution group"
        );

        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let mut channels = Vec::with_capacity(size);
        let mut workers = Vec::with_capacity(size);

        for rank in 0..size {
            let (coordinator_side, worker_side) = rank_pair(rank);
            match launcher.launch(size, worker_side, exit_tx.clone()) {
                Ok(process) => {
                    channels.push(coordinator_side);
                    workers.push(WorkerHandle {
                        state: RankState::Starting,
                        process: Some(process),
                    });
                }
                Err(e) => {
                    error!(rank, error = %e, "Failed to launch worker");
                    kill_all(&mut workers);
                    return Err(e);
                }
            }
        }
        METRICS.group.live_workers.set(size as i64);

        let group = Arc::new(Self {
            settings,
            channels: tokio::sync::Mutex::new(ChannelSet::new(channels)),
            workers: Mutex::new(workers),
            status: RwLock::new(GroupStatus::Starting),
            next_seq: AtomicU64::new(1),
        });

        tokio::spawn(supervise(Arc::downgrade(&group), exit_rx));

        if let Err(e) = group.await_ready().await {
            error!(error = %e, "Execution group failed to start");
            group.set_status(GroupStatus::Failed(e.to_string()));
            group.abort().await;
            return Err(e);
        }

        group.set_status(GroupStatus::Ready);
        METRICS.group.ready.set(1);
        info!(size, "Execution group ready");
        Ok(group)
    }

    /// Read one readiness token per rank, rank 0 first
    async fn await_ready(&self) -> Result<()> {
        let deadline = Instant::now() + self.settings.ready_timeout;
        let mut channels = self.channels.lock().await;

        for rank_channels in channels.iter_mut() {
            let rank = rank_channels.rank();
            let remaining = deadline.saturating_duration_since(Instant::now());
            let event = tokio::time::timeout(remaining, rank_channels.recv())
                .await
                .map_err(|_| {
                    LockstepError::timeout(format!(
                        "rank {} not ready within {:?}",
                        rank, self.settings.ready_timeout
                    ))
                })??;

            match event {
                WorkerEvent::Ready { rank: reported } if reported == rank => {
                    debug!(rank, "Rank ready");
                    self.set_rank_state(rank, RankState::Idle);
                }
                WorkerEvent::Failed { message, .. } => {
                    self.set_rank_state(rank, RankState::Dead);
                    return Err(LockstepError::worker_unavailable(format!(
                        "rank {} failed to start: {}",
                        rank, message
                    )));
                }
                other => {
                    return Err(LockstepError::protocol(format!(
                        "rank {} sent {} from rank {} before ready",
                        rank,
                        other.kind(),
                        other.rank()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.settings.size
    }

    pub fn status(&self) -> GroupStatus {
        self.status.read().clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.status.read() == GroupStatus::Ready
    }

    fn set_status(&self, status: GroupStatus) {
        debug!(?status, "Group status change");
        *self.status.write() = status;
    }

    /// Stop accepting requests for good
    ///
    /// Ranks cannot rejoin a collective individually, so there is no way
    /// back from here short of restarting the service.
    pub fn mark_failed(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut status = self.status.write();
        if matches!(*status, GroupStatus::Ready | GroupStatus::Starting) {
            error!(reason = %reason, "Execution group failed");
            *status = GroupStatus::Failed(reason);
            METRICS.group.ready.set(0);
            METRICS.group.group_failures.inc();
        }
    }

    pub fn rank_states(&self) -> Vec<RankState> {
        self.workers.lock().iter().map(|w| w.state).collect()
    }

    pub(crate) fn set_rank_state(&self, rank: Rank, state: RankState) {
        if let Some(worker) = self.workers.lock().get_mut(rank) {
            // A dead rank stays dead.
            if worker.state != RankState::Dead {
                worker.state = state;
            }
        }
    }

    pub(crate) fn set_all_rank_states(&self, state: RankState) {
        for worker in self.workers.lock().iter_mut() {
            if worker.state != RankState::Dead {
                worker.state = state;
            }
        }
    }

    /// Acquire the dispatch permit and the channel set with it
    pub(crate) async fn lock_channels(&self) -> MutexGuard<'_, ChannelSet> {
        self.channels.lock().await
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Send the shutdown sentinel to every rank and wait for them to exit
    ///
    /// Waits for an in-flight request to finish first (bounded by the
    /// shutdown timeout). Ranks that do not stop in time are killed.
    pub async fn shutdown(&self) {
        {
            let mut status = self.status.write();
            if matches!(*status, GroupStatus::Stopping | GroupStatus::Stopped) {
                return;
            }
            *status = GroupStatus::Stopping;
        }
        METRICS.group.ready.set(0);
        info!(size = self.size(), "Shutting down execution group");

        let timeout = self.settings.shutdown_timeout;
        match tokio::time::timeout(timeout, self.channels.lock()).await {
            Ok(mut channels) => {
                for rank_channels in channels.iter_mut() {
                    if let Err(e) = rank_channels.send(WorkerCommand::Shutdown) {
                        debug!(rank = rank_channels.rank(), error = %e, "Rank already gone");
                        continue;
                    }
                    await_stopped(rank_channels, timeout).await;
                }
                channels.close_all();
            }
            Err(_) => warn!(?timeout, "Dispatch lock still held, skipping graceful shutdown"),
        }

        self.reap(timeout).await;
        self.set_status(GroupStatus::Stopped);
        info!("Execution group stopped");
    }

    /// Kill every rank without the shutdown handshake
    async fn abort(&self) {
        self.set_status(GroupStatus::Stopping);
        kill_all(&mut self.workers.lock());
        self.channels.lock().await.close_all();
        self.reap(Duration::from_millis(500)).await;
        self.set_status(GroupStatus::Stopped);
    }

    async fn reap(&self, timeout: Duration) {
        let processes: Vec<WorkerProcess> = {
            let mut workers = self.workers.lock();
            workers.iter_mut().filter_map(|w| w.process.take()).collect()
        };

        for process in processes {
            let rank = process.rank();
            match process.stop(timeout).await {
                WorkerExit::Clean => debug!(rank, "Worker exited cleanly"),
                WorkerExit::Killed => warn!(rank, "Worker killed"),
                WorkerExit::Failed(reason) => {
                    warn!(rank, reason = %reason, "Worker exited with error")
                }
            }
            self.set_rank_state(rank, RankState::Stopped);
        }
        METRICS.group.live_workers.set(0);
    }
}

async fn await_stopped(channels: &mut RankChannels, timeout: Duration) {
    let rank = channels.rank();
    let wait = async {
        loop {
            match channels.recv().await {
                Ok(WorkerEvent::Stopped { .. }) => return,
                Ok(other) => debug!(rank, event = other.kind(), "Discarding event during shutdown"),
                Err(_) => return,
            }
        }
    };
    if tokio::time::timeout(timeout, wait).await.is_err() {
        warn!(rank, "Rank did not acknowledge shutdown");
    }
}

fn kill_all(workers: &mut [WorkerHandle]) {
    for worker in workers.iter_mut() {
        if let Some(process) = worker.process.as_mut() {
            process.kill();
        }
    }
}

/// Mark the group failed when a rank exits while the group is serving
async fn supervise(group: Weak<ExecutionGroup>, mut exits: mpsc::UnboundedReceiver<ExitNotice>) {
    while let Some(notice) = exits.recv().await {
        let Some(group) = group.upgrade() else {
            break;
        };

        match group.status() {
            GroupStatus::Stopping | GroupStatus::Stopped => continue,
            _ => {}
        }

        error!(rank = notice.rank, exit = ?notice.exit, "Worker exited unexpectedly");
        group.set_rank_state(notice.rank, RankState::Dead);
        METRICS.group.live_workers.dec();
        group.mark_failed(format!("rank {} exited: {:?}", notice.rank, notice.exit));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::TaskLauncher;
    use lockstep_common::config::LaunchMode;
    use lockstep_worker::{EchoGenerator, GeneratorFactory, Generator};

    fn config(size: usize) -> LockstepConfig {
        let mut config = LockstepConfig::default();
        config.group.size = size;
        config.group.launch = LaunchMode::InProcess;
        config.group.ready_timeout_secs = 5;
        config.group.shutdown_timeout_secs = 1;
        config
    }

    fn echo() -> GeneratorFactory {
        Arc::new(|_: Rank| -> Result<Arc<dyn Generator>> { Ok(Arc::new(EchoGenerator::new(4))) })
    }

    #[tokio::test]
    async fn test_group_starts_and_stops() {
        let config = config(3);
        let launcher = TaskLauncher::with_factory(&config, echo());

        let group = ExecutionGroup::start(GroupSettings::from(&config), &launcher).await.unwrap();
        assert_eq!(group.status(), GroupStatus::Ready);
        assert_eq!(group.rank_states(), vec![RankState::Idle; 3]);

        group.shutdown().await;
        assert_eq!(group.status(), GroupStatus::Stopped);
        assert_eq!(group.rank_states(), vec![RankState::Stopped; 3]);
    }

    #[tokio::test]
    async fn test_startup_failure_aborts_group() {
        let config = config(3);
        let factory: GeneratorFactory = Arc::new(|rank: Rank| -> Result<Arc<dyn Generator>> {
            if rank == 1 {
                Err(LockstepError::model("weights missing"))
            } else {
                Ok(Arc::new(EchoGenerator::new(4)))
            }
        });
        let launcher = TaskLauncher::with_factory(&config, factory);

        let err = ExecutionGroup::start(GroupSettings::from(&config), &launcher)
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("rank 1 failed to start"));
    }

    #[tokio::test]
    async fn test_ready_timeout() {
        let config = config(1);
        let factory: GeneratorFactory = Arc::new(|_: Rank| -> Result<Arc<dyn Generator>> {
            std::thread::sleep(Duration::from_millis(400));
            Ok(Arc::new(EchoGenerator::new(4)))
        });
        let launcher = TaskLauncher::with_factory(&config, factory);
        let mut settings = GroupSettings::from(&config);
        settings.ready_timeout = Duration::from_millis(50);

        let err = ExecutionGroup::start(settings, &launcher).await.err().unwrap();
        assert!(matches!(err, LockstepError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_mark_failed_is_sticky() {
        let config = config(1);
        let launcher = TaskLauncher::with_factory(&config, echo());
        let group = ExecutionGroup::start(GroupSettings::from(&config), &launcher).await.unwrap();

        group.mark_failed("rank 0 timed out");
        group.mark_failed("second reason");

        assert_eq!(group.status(), GroupStatus::Failed("rank 0 timed out".to_string()));
        assert!(!group.is_ready());
        group.shutdown().await;
    }

    #[test]
    fn test_status_serializes_with_reason() {
        let value = serde_json::to_value(GroupStatus::Failed("boom".to_string())).unwrap();
        assert_eq!(value, serde_json::json!({"status": "failed", "reason": "boom"}));

        let value = serde_json::to_value(GroupStatus::Ready).unwrap();
        assert_eq!(value, serde_json::json!({"status": "ready"}));
    }
}
