//! Lockstep Coordinator
//!
//! Owns the execution group and serves `POST /chat` on top of it. Every
//! request is broadcast to all ranks and answered once all of them reply.

pub mod api;
pub mod channels;
pub mod dispatch;
pub mod format;
pub mod group;
pub mod launcher;
pub mod request;

pub use api::{create_router, ApiError, AppState};
pub use channels::{rank_pair, ChannelSet, RankChannels, WorkerEnds};
pub use dispatch::Dispatcher;
pub use format::ResponseFormatter;
pub use group::{ExecutionGroup, GroupSettings, GroupStatus, RankState};
pub use launcher::{
    launcher_for, Launcher, ProcessLauncher, TaskLauncher, WorkerExit, WorkerProcess,
};
pub use request::{ChatRequest, RequestError};
