//! Execution group rendezvous
//!
//! Every rank calls [`join_group`] once, before building its generator. With
//! the `tcp` backend rank 0 listens on the master address and releases the
//! group only when all `world_size - 1` peers have announced themselves.
//!
//! Handshake, one line each way:
//!
//! ```text
//! peer  -> rank 0   join <rank> <world_size>
//! rank 0 -> peer    ready | reject <reason>
//! ```

use lockstep_common::config::{rank_env, LockstepConfig, RendezvousBackend};
use lockstep_common::error::{LockstepError, Result};
use lockstep_proto::Rank;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const CONNECT_RETRY: Duration = Duration::from_millis(200);

/// How long rank 0 waits for a connection's join line
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Where this process sits in the group and how to reach rank 0
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousParams {
    pub backend: RendezvousBackend,
    pub rank: Rank,
    pub world_size: usize,
    pub address: String,
    pub port: u16,
}

impl RendezvousParams {
    /// Read `RANK`, `WORLD_SIZE`, `MASTER_ADDR` and `MASTER_PORT`, falling
    /// back to the config for anything unset
    pub fn from_env(config: &LockstepConfig) -> Result<Self> {
        let rendezvous = &config.group.rendezvous;
        let params = Self {
            backend: rendezvous.backend,
            rank: parse_env(rank_env::RANK)?.unwrap_or(0),
            world_size: parse_env(rank_env::WORLD_SIZE)?.unwrap_or(config.group.size),
            address: std::env::var(rank_env::MASTER_ADDR)
                .unwrap_or_else(|_| rendezvous.address.clone()),
            port: parse_env(rank_env::MASTER_PORT)?.unwrap_or(rendezvous.port),
        };
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.world_size == 0 || self.rank >= self.world_size {
            return Err(LockstepError::rendezvous(format!(
                "rank {} outside group of size {}",
                self.rank, self.world_size
            )));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| LockstepError::config(format!("invalid {}: {}", name, value))),
        Err(_) => Ok(None),
    }
}

/// Membership in a joined group
///
/// Holds the rendezvous connections open; dropping it closes them.
#[derive(Debug)]
pub struct GroupMembership {
    pub rank: Rank,
    pub world_size: usize,
    links: Vec<BufReader<TcpStream>>,
}

impl GroupMembership {
    /// Number of open rendezvous connections (peers for rank 0, one otherwise)
    pub fn link_count(&self) -> usize {
        self.links.len()
    }
}

/// Join the execution group
pub async fn join_group(params: &RendezvousParams, timeout: Duration) -> Result<GroupMembership> {
    params.validate()?;

    let joined = match params.backend {
        RendezvousBackend::Local => Ok(GroupMembership {
            rank: params.rank,
            world_size: params.world_size,
            links: Vec::new(),
        }),
        RendezvousBackend::Tcp if params.world_size == 1 => Ok(GroupMembership {
            rank: 0,
            world_size: 1,
            links: Vec::new(),
        }),
        RendezvousBackend::Tcp => {
            let fut = async {
                if params.rank == 0 {
                    host(params).await
                } else {
                    attend(params).await
                }
            };
            tokio::time::timeout(timeout, fut).await.map_err(|_| {
                LockstepError::timeout(format!(
                    "rank {} did not complete rendezvous within {:?}",
                    params.rank, timeout
                ))
            })?
        }
    }?;

    info!(
        rank = joined.rank,
        world_size = joined.world_size,
        backend = ?params.backend,
        "Joined execution group"
    );
    Ok(joined)
}

/// Rank 0: accept every peer, then release them together
async fn host(params: &RendezvousParams) -> Result<GroupMembership> {
    let listener = TcpListener::bind((params.address.as_str(), params.port))
        .await
        .map_err(|e| {
            LockstepError::rendezvous(format!(
                "failed to bind {}:{}: {}",
                params.address, params.port, e
            ))
        })?;
    host_on(listener, params.world_size).await
}

async fn host_on(listener: TcpListener, world_size: usize) -> Result<GroupMembership> {
    let mut peers: BTreeMap<Rank, BufReader<TcpStream>> = BTreeMap::new();
    let (joins_tx, mut joins_rx) = mpsc::unbounded_channel();

    while peers.len() < world_size - 1 {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tokio::spawn(handshake(stream, addr, world_size, joins_tx.clone()));
                }
                Err(e) => warn!(error = %e, "Failed to accept rendezvous connection"),
            },
            Some(join) = joins_rx.recv() => {
                let PendingJoin { rank, addr, mut stream } = join;
                if peers.contains_key(&rank) {
                    warn!(rank, %addr, "Rejecting duplicate rank");
                    reply(&mut stream, "reject duplicate rank").await;
                } else {
                    debug!(rank, %addr, joined = peers.len() + 1, "Peer joined");
                    peers.insert(rank, stream);
                }
            }
        }
    }

    for (rank, stream) in peers.iter_mut() {
        stream.get_mut().write_all(b"ready\n").await.map_err(|e| {
            LockstepError::rendezvous(format!("failed to release rank {}: {}", rank, e))
        })?;
    }

    Ok(GroupMembership {
        rank: 0,
        world_size,
        links: peers.into_values().collect(),
    })
}

/// A peer whose join line parsed
struct PendingJoin {
    rank: Rank,
    addr: SocketAddr,
    stream: BufReader<TcpStream>,
}

/// Read one connection's join line
///
/// Connections that fail, close or stay silent past [`JOIN_TIMEOUT`] are
/// dropped without affecting the rest of the rendezvous.
async fn handshake(
    stream: TcpStream,
    addr: SocketAddr,
    world_size: usize,
    joins: mpsc::UnboundedSender<PendingJoin>,
) {
    let mut stream = BufReader::new(stream);
    let mut line = String::new();

    match tokio::time::timeout(JOIN_TIMEOUT, stream.read_line(&mut line)).await {
        Ok(Ok(0)) => {
            debug!(%addr, "Connection closed before join");
            return;
        }
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            warn!(%addr, error = %e, "Dropping rendezvous connection");
            return;
        }
        Err(_) => {
            warn!(%addr, timeout = ?JOIN_TIMEOUT, "No join received, dropping connection");
            return;
        }
    }

    match parse_join(&line, world_size) {
        Ok(rank) => {
            let _ = joins.send(PendingJoin { rank, addr, stream });
        }
        Err(reason) => {
            warn!(%addr, reason = %reason, "Rejecting rendezvous request");
            reply(&mut stream, &format!("reject {}", reason)).await;
        }
    }
}

async fn reply(stream: &mut BufReader<TcpStream>, message: &str) {
    let line = format!("{}\n", message);
    if let Err(e) = stream.get_mut().write_all(line.as_bytes()).await {
        debug!(error = %e, "Failed to send rendezvous reply");
    }
}

fn parse_join(line: &str, world_size: usize) -> std::result::Result<Rank, String> {
    let mut parts = line.split_whitespace();
    if parts.next() != Some("join") {
        return Err("malformed join".to_string());
    }

    let rank: Rank = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| "missing rank".to_string())?;
    let size: usize = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| "missing world size".to_string())?;

    if size != world_size {
        return Err(format!("world size {} does not match {}", size, world_size));
    }
    if rank == 0 || rank >= world_size {
        return Err(format!("rank {} out of range", rank));
    }
    Ok(rank)
}

/// Ranks 1..N: connect to rank 0 and wait for release
async fn attend(params: &RendezvousParams) -> Result<GroupMembership> {
    let stream = loop {
        match TcpStream::connect((params.address.as_str(), params.port)).await {
            Ok(stream) => break stream,
            Err(e) => {
                debug!(rank = params.rank, error = %e, "Rank 0 not reachable yet, retrying");
                tokio::time::sleep(CONNECT_RETRY).await;
            }
        }
    };

    let mut stream = BufReader::new(stream);
    let hello = format!("join {} {}\n", params.rank, params.world_size);
    stream.get_mut().write_all(hello.as_bytes()).await?;

    let mut line = String::new();
    stream.read_line(&mut line).await?;
    match line.trim() {
        "ready" => Ok(GroupMembership {
            rank: params.rank,
            world_size: params.world_size,
            links: vec![stream],
        }),
        other => Err(LockstepError::rendezvous(format!(
            "rank {} refused by rank 0: {}",
            params.rank,
            if other.is_empty() { "connection closed" } else { other }
        ))),
    }
}
