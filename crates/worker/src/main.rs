//! Lockstep Worker - Main Entry Point
//!
//! Started by the coordinator once per rank. Commands arrive on stdin and
//! events leave on stdout, one JSON frame per line; logs go to stderr.

use lockstep_common::LockstepConfig;
use lockstep_worker::frames::{read_frames, write_frames};
use lockstep_worker::{configured_factory, start_unit, RendezvousParams, UnitSettings};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = LockstepConfig::load()?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("lockstep_worker={}", config.observability.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let params = RendezvousParams::from_env(&config)?;
    info!(
        rank = params.rank,
        world_size = params.world_size,
        "Starting Lockstep Worker"
    );

    ignore_interrupts()?;

    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let reader = tokio::spawn(read_frames(tokio::io::stdin(), command_tx));
    let writer = tokio::spawn(write_frames(tokio::io::stdout(), event_rx));

    let result = start_unit(
        params,
        UnitSettings::from_config(&config),
        configured_factory(&config),
        config.ready_timeout(),
        command_rx,
        event_tx,
    )
    .await;

    // The unit dropped its sender; wait for the last events to be flushed.
    writer.await??;
    reader.abort();

    if let Err(e) = result {
        error!(error = %e, "Worker exited with error");
        return Err(e.into());
    }

    info!("Lockstep Worker shutdown complete");
    Ok(())
}

/// Keep running on SIGINT until the coordinator sends `shutdown` or closes
/// stdin
#[cfg(unix)]
fn ignore_interrupts() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    // Registered here so an interrupt arriving before the first poll is caught.
    let mut interrupts = signal(SignalKind::interrupt())?;
    tokio::spawn(async move {
        while interrupts.recv().await.is_some() {
            warn!("Interrupt received, waiting for shutdown from the coordinator");
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn ignore_interrupts() -> std::io::Result<()> {
    tokio::spawn(async {
        while tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, waiting for shutdown from the coordinator");
        }
    });
    Ok(())
}
