//! Lockstep Worker
//!
//! One rank of a lockstep execution group: joins the group, builds the
//! generator once, then answers one dispatched dialog at a time.

pub mod frames;
pub mod generator;
pub mod rendezvous;
pub mod unit;

pub use generator::{EchoGenerator, Generation, GenerationParams, Generator};
pub use rendezvous::{join_group, GroupMembership, RendezvousParams};
pub use unit::{
    configured_factory, start_unit, GeneratorFactory, UnitSettings, WorkerState, WorkerUnit,
};
