//! Dispatch channel set
//!
//! One inbound and one outbound FIFO per rank. The coordinator holds the
//! sending half of every inbound queue and the receiving half of every
//! outbound queue; the worker side holds the opposite ends. Queues are
//! unbounded because only one request is ever in flight.

use lockstep_common::error::{LockstepError, Result};
use lockstep_proto::{Rank, WorkerCommand, WorkerEvent};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Coordinator side of one rank's queue pair
#[derive(Debug)]
pub struct RankChannels {
    rank: Rank,
    inbound: Option<UnboundedSender<WorkerCommand>>,
    outbound: UnboundedReceiver<WorkerEvent>,
}

/// Worker side of one rank's queue pair
#[derive(Debug)]
pub struct WorkerEnds {
    pub rank: Rank,
    pub inbound: UnboundedReceiver<WorkerCommand>,
    pub outbound: UnboundedSender<WorkerEvent>,
}

/// Create both queues for `rank`
pub fn rank_pair(rank: Rank) -> (RankChannels, WorkerEnds) {
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel();

    (
        RankChannels {
            rank,
            inbound: Some(in_tx),
            outbound: out_rx,
        },
        WorkerEnds {
            rank,
            inbound: in_rx,
            outbound: out_tx,
        },
    )
}

impl RankChannels {
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Push a command onto this rank's inbound queue
    pub fn send(&self, command: WorkerCommand) -> Result<()> {
        let inbound = self.inbound.as_ref().ok_or_else(|| {
            LockstepError::worker_unavailable(format!("rank {} inbound queue closed", self.rank))
        })?;
        inbound.send(command).map_err(|_| {
            LockstepError::worker_unavailable(format!("rank {} stopped reading", self.rank))
        })
    }

    /// Block until this rank's next event
    pub async fn recv(&mut self) -> Result<WorkerEvent> {
        self.outbound.recv().await.ok_or_else(|| {
            LockstepError::worker_unavailable(format!("rank {} outbound queue closed", self.rank))
        })
    }

    /// Drop the inbound sender; the worker sees end of input
    pub fn close(&mut self) {
        self.inbound = None;
    }
}

/// Queue pairs for every rank, indexed by rank
#[derive(Debug)]
pub struct ChannelSet {
    ranks: Vec<RankChannels>,
}

impl ChannelSet {
    pub fn new(mut ranks: Vec<RankChannels>) -> Self {
        ranks.sort_by_key(|c| c.rank);
        debug_assert!(ranks.iter().enumerate().all(|(i, c)| c.rank == i));
        Self { ranks }
    }

    pub fn size(&self) -> usize {
        self.ranks.len()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut RankChannels> {
        self.ranks.iter_mut()
    }

    /// Send `command` to every rank, rank 0 first
    ///
    /// Stops at the first rank that cannot be reached.
    pub fn broadcast(&self, command: &WorkerCommand) -> Result<()> {
        for channels in &self.ranks {
            channels.send(command.clone())?;
        }
        Ok(())
    }

    pub fn close_all(&mut self) {
        for channels in &mut self.ranks {
            channels.close();
        }
    }
}
