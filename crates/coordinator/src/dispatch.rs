//! Request fan-out / fan-in
//!
//! One dispatch is one lockstep cycle over the whole group: take the
//! dispatch lock, push the request onto every rank's inbound queue in rank
//! order, then read exactly one event from every rank's outbound queue.
//! The reads run concurrently so a slow rank does not hold up reading the
//! others, but the cycle only finishes once every rank has answered.
//!
//! The last rank's generation is returned. The other ranks' outputs are
//! compared against it; ranks that saw different input or produced
//! different output are logged and counted, and rejected outright in
//! strict mode.

use crate::channels::{ChannelSet, RankChannels};
use crate::group::{ExecutionGroup, GroupStatus, RankState};
use futures::future::join_all;
use lockstep_common::config::LockstepConfig;
use lockstep_common::error::{LockstepError, Result};
use lockstep_common::metrics::LatencyTimer;
use lockstep_common::METRICS;
use lockstep_proto::{
    Dialog, DispatchedRequest, GenerationResult, Rank, RankOutput, WorkerCommand, WorkerEvent,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

pub struct Dispatcher {
    group: Arc<ExecutionGroup>,
    request_timeout: Option<Duration>,
    strict_consensus: bool,
}

impl Dispatcher {
    pub fn new(
        group: Arc<ExecutionGroup>,
        request_timeout: Option<Duration>,
        strict_consensus: bool,
    ) -> Self {
        Self {
            group,
            request_timeout,
            strict_consensus,
        }
    }

    pub fn from_config(group: Arc<ExecutionGroup>, config: &LockstepConfig) -> Self {
        Self::new(group, config.request_timeout(), config.chat.strict_consensus)
    }

    pub fn group(&self) -> &Arc<ExecutionGroup> {
        &self.group
    }

    /// Run one dialog through every rank and return the last rank's reply
    ///
    /// Errors that leave the ranks out of step mark the group failed before
    /// they are returned.
    #[instrument(skip_all, fields(messages = dialog.len()))]
    pub async fn dispatch(&self, dialog: Dialog) -> Result<GenerationResult> {
        self.ensure_ready()?;

        let wait_start = Instant::now();
        METRICS.chat.active_requests.inc();
        let mut channels = self.group.lock_channels().await;
        METRICS.chat.lock_wait.observe_since(wait_start);

        // The group may have failed while this request was queued.
        let result = match self.ensure_ready() {
            Ok(()) => {
                let request = DispatchedRequest {
                    request_id: Uuid::new_v4().to_string(),
                    seq: self.group.next_seq(),
                    dialog,
                };
                self.run_cycle(&mut channels, request).await
            }
            Err(e) => Err(e),
        };
        drop(channels);
        METRICS.chat.active_requests.dec();

        match &result {
            Err(e) if e.is_fatal() => self.group.mark_failed(e.to_string()),
            _ => self.group.set_all_rank_states(RankState::Idle),
        }
        result
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.group.status() {
            GroupStatus::Ready => Ok(()),
            GroupStatus::Failed(reason) => Err(LockstepError::group_unavailable(format!(
                "execution group failed: {}",
                reason
            ))),
            other => Err(LockstepError::group_unavailable(format!(
                "execution group is not serving ({:?})",
                other
            ))),
        }
    }

    async fn run_cycle(
        &self,
        channels: &mut ChannelSet,
        request: DispatchedRequest,
    ) -> Result<GenerationResult> {
        let seq = request.seq;
        let request_id = request.request_id.clone();
        debug!(seq, request_id = %request_id, ranks = channels.size(), "Dispatching request");

        self.group.set_all_rank_states(RankState::Busy);
        let started = Instant::now();
        channels.broadcast(&WorkerCommand::Generate(request))?;

        let reads = join_all(
            channels
                .iter_mut()
                .map(|rank_channels| collect_output(rank_channels, seq, &request_id, started)),
        );
        let outputs = match self.request_timeout {
            Some(timeout) => tokio::time::timeout(timeout, reads).await.map_err(|_| {
                LockstepError::timeout(format!(
                    "request {} not answered by every rank within {:?}",
                    seq, timeout
                ))
            })?,
            None => reads.await,
        };

        // Every rank has been read by now; report the lowest failing rank.
        let outputs = outputs.into_iter().collect::<Result<Vec<_>>>()?;
        debug!(seq, elapsed_ms = started.elapsed().as_millis() as u64, "All ranks answered");
        self.reconcile(seq, outputs)
    }

    /// Compare every rank against the last one and return the last one's reply
    fn reconcile(&self, seq: u64, mut outputs: Vec<RankOutput>) -> Result<GenerationResult> {
        let authoritative = outputs
            .pop()
            .ok_or_else(|| LockstepError::internal("execution group has no ranks"))?;

        let input_mismatch: Vec<Rank> = outputs
            .iter()
            .filter(|o| o.dialog_digest != authoritative.dialog_digest)
            .map(|o| o.rank)
            .collect();
        let output_mismatch: Vec<Rank> = outputs
            .iter()
            .filter(|o| o.generation != authoritative.generation)
            .map(|o| o.rank)
            .collect();

        if !input_mismatch.is_empty() || !output_mismatch.is_empty() {
            METRICS.group.rank_divergence.inc();
            warn!(
                seq,
                reference_rank = authoritative.rank,
                ?input_mismatch,
                ?output_mismatch,
                "Ranks diverged"
            );
            if self.strict_consensus {
                return Err(LockstepError::divergence(format!(
                    "request {}: ranks {:?} saw different input, \
                     ranks {:?} produced different output than rank {}",
                    seq, input_mismatch, output_mismatch, authoritative.rank
                )));
            }
        }

        Ok(authoritative.generation)
    }
}

/// Read one rank's answer to request `seq`
async fn collect_output(
    channels: &mut RankChannels,
    seq: u64,
    request_id: &str,
    started: Instant,
) -> Result<RankOutput> {
    let rank = channels.rank();
    let event = channels.recv().await?;
    let label = rank.to_string();
    METRICS
        .group
        .rank_latency
        .with_label_values(&[label.as_str()])
        .observe_since(started);

    match event {
        WorkerEvent::Generated(output)
            if output.seq == seq && output.request_id == request_id && output.rank == rank =>
        {
            Ok(output)
        }
        WorkerEvent::Generated(output) => Err(LockstepError::protocol(format!(
            "rank {} answered request {} ({}) as rank {} while request {} ({}) was in flight",
            rank, output.seq, output.request_id, output.rank, seq, request_id
        ))),
        WorkerEvent::Failed {
            seq: Some(failed_seq),
            message,
            ..
        } if failed_seq == seq => {
            error!(rank, seq, message = %message, "Rank failed to generate");
            Err(LockstepError::model(format!("rank {}: {}", rank, message)))
        }
        other => Err(LockstepError::protocol(format!(
            "rank {} sent {} while request {} was in flight",
            rank,
            other.kind(),
            seq
        ))),
    }
}
