//! Worker unit
//!
//! One rank of the execution group. After joining the group and building
//! its generator the unit announces itself with a `Ready` event, then serves
//! its inbound queue one command at a time:
//!
//! ```text
//! Loading -> Ready -> Busy -> Ready -> ... -> Stopping -> Stopped
//! ```
//!
//! The unit never sees more than one request in flight; ordering across
//! ranks is the coordinator's job.

use crate::generator::{self, GenerationParams, Generator};
use crate::rendezvous::{join_group, RendezvousParams};
use lockstep_common::config::LockstepConfig;
use lockstep_common::error::{LockstepError, Result};
use lockstep_proto::{DispatchedRequest, Rank, RankOutput, WorkerCommand, WorkerEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

/// Lifecycle of a worker unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Loading,
    Ready,
    Busy,
    Stopping,
    Stopped,
}

/// Per-request settings every rank must share
#[derive(Debug, Clone)]
pub struct UnitSettings {
    pub default_system_prompt: String,
    pub params: GenerationParams,
}

impl UnitSettings {
    pub fn from_config(config: &LockstepConfig) -> Self {
        Self {
            default_system_prompt: config.chat.default_system_prompt.clone(),
            params: GenerationParams::from(&config.sampling),
        }
    }
}

/// A single rank's request loop
pub struct WorkerUnit {
    rank: Rank,
    generator: Arc<dyn Generator>,
    settings: UnitSettings,
    state: WorkerState,
}

impl WorkerUnit {
    pub fn new(rank: Rank, generator: Arc<dyn Generator>, settings: UnitSettings) -> Self {
        Self {
            rank,
            generator,
            settings,
            state: WorkerState::Loading,
        }
    }

    fn transition(&mut self, next: WorkerState) {
        debug!(rank = self.rank, from = ?self.state, to = ?next, "Worker state change");
        self.state = next;
    }

    /// Announce readiness, then serve commands until `Shutdown` or until the
    /// inbound queue closes
    pub async fn run(
        mut self,
        mut inbound: UnboundedReceiver<WorkerCommand>,
        outbound: UnboundedSender<WorkerEvent>,
    ) -> Result<()> {
        self.transition(WorkerState::Ready);
        send(&outbound, WorkerEvent::Ready { rank: self.rank })?;
        info!(rank = self.rank, backend = self.generator.name(), "Worker ready");

        loop {
            let command = match inbound.recv().await {
                Some(command) => command,
                None => {
                    debug!(rank = self.rank, "Inbound queue closed");
                    break;
                }
            };

            match command {
                WorkerCommand::Generate(request) => {
                    self.transition(WorkerState::Busy);
                    let event = self.serve(request).await;
                    self.transition(WorkerState::Ready);
                    send(&outbound, event)?;
                }
                WorkerCommand::Shutdown => {
                    info!(rank = self.rank, "Shutdown requested");
                    break;
                }
            }
        }

        self.transition(WorkerState::Stopping);
        // The coordinator may already be gone when the queue closed.
        let _ = outbound.send(WorkerEvent::Stopped { rank: self.rank });
        self.transition(WorkerState::Stopped);
        Ok(())
    }

    async fn serve(&self, request: DispatchedRequest) -> WorkerEvent {
        let start = Instant::now();
        let seq = request.seq;

        match self.generate(request).await {
            Ok(output) => {
                debug!(
                    rank = self.rank,
                    seq,
                    chars = output.generation.content.chars().count(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Generated reply"
                );
                WorkerEvent::Generated(output)
            }
            Err(e) => {
                error!(rank = self.rank, seq, error = %e, "Generation failed");
                WorkerEvent::Failed {
                    rank: self.rank,
                    seq: Some(seq),
                    message: e.to_string(),
                }
            }
        }
    }

    async fn generate(&self, request: DispatchedRequest) -> Result<RankOutput> {
        let dialog = request
            .dialog
            .with_default_system(&self.settings.default_system_prompt);
        let dialog_digest = dialog.digest();

        let generator = self.generator.clone();
        let params = self.settings.params.clone();
        let mut generations = tokio::task::spawn_blocking(move || {
            generator.generate(std::slice::from_ref(&dialog), &params)
        })
        .await
        .map_err(|e| LockstepError::internal(format!("generation task failed: {}", e)))??;

        if generations.len() != 1 {
            return Err(LockstepError::model(format!(
                "expected one generation, got {}",
                generations.len()
            )));
        }

        Ok(RankOutput {
            rank: self.rank,
            request_id: request.request_id,
            seq: request.seq,
            dialog_digest,
            generation: generations.remove(0).generation,
        })
    }
}

fn send(outbound: &UnboundedSender<WorkerEvent>, event: WorkerEvent) -> Result<()> {
    outbound
        .send(event)
        .map_err(|_| LockstepError::worker_unavailable("outbound queue closed"))
}

/// Builds a rank's generator once the rank has joined the group
pub type GeneratorFactory = Arc<dyn Fn(Rank) -> Result<Arc<dyn Generator>> + Send + Sync>;

/// Factory backed by [`generator::build`]
pub fn configured_factory(config: &LockstepConfig) -> GeneratorFactory {
    let model = config.model.clone();
    Arc::new(move |_rank: Rank| generator::build(&model))
}

/// Full worker lifecycle: rendezvous, model build, request loop
///
/// Startup failures are reported as a `Failed` event with no `seq` before
/// the error is returned.
pub async fn start_unit(
    params: RendezvousParams,
    settings: UnitSettings,
    factory: GeneratorFactory,
    ready_timeout: Duration,
    inbound: UnboundedReceiver<WorkerCommand>,
    outbound: UnboundedSender<WorkerEvent>,
) -> Result<()> {
    let rank = params.rank;
    debug!(rank, state = ?WorkerState::Loading, "Worker starting");

    let membership = match join_group(&params, ready_timeout).await {
        Ok(membership) => membership,
        Err(e) => return Err(report_startup_failure(&outbound, rank, e)),
    };

    let generator = match tokio::task::spawn_blocking(move || factory(rank)).await {
        Ok(Ok(generator)) => generator,
        Ok(Err(e)) => return Err(report_startup_failure(&outbound, rank, e)),
        Err(e) => {
            let e = LockstepError::internal(format!("model build task failed: {}", e));
            return Err(report_startup_failure(&outbound, rank, e));
        }
    };

    let result = WorkerUnit::new(rank, generator, settings).run(inbound, outbound).await;
    drop(membership);
    result
}

fn report_startup_failure(
    outbound: &UnboundedSender<WorkerEvent>,
    rank: Rank,
    err: LockstepError,
) -> LockstepError {
    warn!(rank, error = %err, "Worker failed to start");
    let _ = outbound.send(WorkerEvent::Failed {
        rank,
        seq: None,
        message: err.to_string(),
    });
    err
}
