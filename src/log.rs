//! Log stream contracts consumed by the controller.
//!
//! The storage engine behind these traits is out of scope; the controller
//! only relies on ordered reads by position, stamped appends that assign a
//! new position, and a monotonically advancing commit position with change
//! notification.

use std::sync::Arc;

use bytes::Bytes;

use crate::record::{Position, ProducerId, Record};

pub mod memory;

/// Ordered reader over a log stream. Single-consumer per controller.
pub trait LogReader: Send {
    /// Position the reader so the next read returns the first record with
    /// position >= `position`. Returns true when a record at exactly
    /// `position` exists.
    fn seek(&mut self, position: Position) -> bool;

    /// Position the reader at the beginning of the log.
    fn seek_to_first(&mut self);

    fn has_next(&self) -> bool;

    fn next(&mut self) -> Option<Record>;
}

/// Outcome of an append attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The record was appended and assigned this position.
    Appended(Position),
    /// The log cannot accept the record right now; retry later.
    Backpressure,
}

/// Callback invoked by the log whenever the commit position advances.
pub type CommitListener = Arc<dyn Fn() + Send + Sync>;

/// Identifier of a registered commit-position listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CommitListenerId(u64);

impl CommitListenerId {
    pub const fn new(value: u64) -> Self {
        CommitListenerId(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Contract the controller consumes from the log storage engine.
///
/// Records at positions <= [`LogStream::commit_position`] are durable and
/// never lost; the commit position never exceeds the log head.
pub trait LogStream: Send + Sync {
    fn new_reader(&self) -> Box<dyn LogReader>;

    /// Append a record stamped with the given producer identity and causal
    /// source position. The log assigns the position.
    fn append_stamped(
        &self,
        producer_id: ProducerId,
        source_record_position: Option<Position>,
        payload: Bytes,
    ) -> AppendOutcome;

    /// Highest position known durable, or `None` when nothing has been
    /// committed yet.
    fn commit_position(&self) -> Option<Position>;

    fn register_commit_listener(&self, listener: CommitListener) -> CommitListenerId;

    fn deregister_commit_listener(&self, id: CommitListenerId);
}

/// Writer handed to `EventProcessor::write_event`.
///
/// The controller stamps it with its own producer id and the position of the
/// record currently being handled, so every output record carries the causal
/// link reprocessing depends on.
pub struct EventWriter<'a> {
    stream: &'a dyn LogStream,
    producer_id: ProducerId,
    source_record_position: Option<Position>,
}

impl<'a> EventWriter<'a> {
    pub(crate) fn new(
        stream: &'a dyn LogStream,
        producer_id: ProducerId,
        source_record_position: Option<Position>,
    ) -> Self {
        EventWriter {
            stream,
            producer_id,
            source_record_position,
        }
    }

    pub fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    pub fn source_record_position(&self) -> Option<Position> {
        self.source_record_position
    }

    pub fn append(&mut self, payload: Bytes) -> AppendOutcome {
        self.stream
            .append_stamped(self.producer_id, self.source_record_position, payload)
    }
}
