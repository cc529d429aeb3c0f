//! Lockstep protocol types
//!
//! Shared between the coordinator and the worker processes. Chat types are
//! what the HTTP layer speaks; worker types are what travels over each rank's
//! inbound and outbound queues.

pub mod chat;
pub mod worker;

pub use chat::{
    ChatMessage, Choice, CompletionEnvelope, Dialog, GenerationResult, Usage, ASSISTANT_ROLE,
    SYSTEM_ROLE,
};
pub use worker::{
    decode_frame, encode_frame, DispatchedRequest, Rank, RankOutput, WorkerCommand, WorkerEvent,
};
