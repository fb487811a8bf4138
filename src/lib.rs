#![forbid(unsafe_code)]

//! Per-partition stream-processor controller over a durable, append-only log.
//!
//! A [`StreamProcessorController`] consumes ordered records from a
//! [`LogStream`], drives a user-supplied [`StreamProcessor`] through a strict
//! four-phase lifecycle per record (process, side-effects, write, update
//! state), and periodically persists snapshots of the processor's state so
//! that a restart resumes from the last durable point instead of replaying
//! the full history.

pub mod config;
pub mod controller;
pub mod log;
pub mod metrics;
pub mod processor;
pub mod record;
pub mod snapshot;

pub use config::{ControllerConfig, SchedulingHint};
pub use controller::runner::{ControllerHandle, spawn};
pub use controller::{ControllerError, Phase, StepOutcome, StreamProcessorController};
pub use log::memory::InMemoryLog;
pub use log::{AppendOutcome, CommitListener, CommitListenerId, EventWriter, LogReader, LogStream};
pub use processor::{
    Completion, EventFilter, EventLifecycleContext, EventProcessor, HandlerError, HandlerResult,
    ProcessorContext, SharedStateResource, StateResource, StreamProcessor, WriteResult,
};
pub use record::{Position, ProducerId, Record};
pub use snapshot::{
    FsSnapshotStore, MemorySnapshotStore, Snapshot, SnapshotError, SnapshotResult, SnapshotStore,
    SnapshotWriter,
};
