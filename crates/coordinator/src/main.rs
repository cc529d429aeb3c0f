//! Lockstep Coordinator - Main Entry Point
//!
//! Loads the configuration, starts one worker per rank, waits for the whole
//! group to report ready and then serves the chat API until interrupted.

use lockstep_common::LockstepConfig;
use lockstep_coordinator::{
    create_router, launcher_for, AppState, Dispatcher, ExecutionGroup, GroupSettings,
};
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = LockstepConfig::source_path();
    let config = LockstepConfig::load()?;

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                let level = &config.observability.log_level;
                format!(
                    "lockstep_coordinator={level},lockstep_worker={level},tower_http={level}"
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Lockstep Coordinator");
    info!(
        size = config.group.size,
        launch = ?config.group.launch,
        backend = %config.model.backend,
        bind = %config.bind_address(),
        config = ?config_path,
        "Configuration loaded"
    );

    let launcher = launcher_for(&config, config_path)?;
    let group = ExecutionGroup::start(GroupSettings::from(&config), launcher.as_ref()).await?;

    let dispatcher = Arc::new(Dispatcher::from_config(group.clone(), &config));
    let app = create_router(AppState::new(dispatcher, &config));

    let listener = tokio::net::TcpListener::bind(config.bind_address()).await?;
    info!(address = %listener.local_addr()?, "Lockstep Coordinator listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await;

    group.shutdown().await;
    served?;

    info!("Lockstep Coordinator shutdown complete");
    Ok(())
}
