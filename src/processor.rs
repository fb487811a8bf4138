//! User-facing processing contracts.
//!
//! A [`StreamProcessor`] decides per record whether to handle it; each
//! handled record gets a fresh single-use [`EventProcessor`] that the
//! controller drives through process, side-effects, write, and update-state.

use std::io;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::log::EventWriter;
use crate::record::{Position, ProducerId, Record};

/// Failure raised by user-supplied processor code.
///
/// Always fatal to the controller; the current record is not retried.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError {
            message: message.into(),
        }
    }
}

pub type HandlerResult<T> = Result<T, HandlerError>;

/// Recoverable state owned by a stream processor.
///
/// The controller resets it on open, restores it from the latest snapshot,
/// and serializes it when writing snapshots. The blob format is opaque to
/// the controller.
pub trait StateResource: Send {
    fn reset(&mut self);

    fn serialize_to(&self, writer: &mut dyn io::Write) -> io::Result<()>;

    fn restore_from(&mut self, reader: &mut dyn io::Read) -> io::Result<()>;
}

/// Shared handle to a processor's state resource.
///
/// Shared so the controller can serialize a snapshot while a handler is
/// parked between retries; only the controller task ever locks it.
pub type SharedStateResource = Arc<Mutex<dyn StateResource>>;

/// What `EventProcessor::write_event` produced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteResult {
    /// The handler chose not to write output for this record.
    Nothing,
    /// Output was appended at the given position.
    Written(Position),
    /// The log pushed back; the controller retries the write phase.
    Backpressure,
}

/// Context handed to `EventProcessor::process`.
///
/// Carries at most one deferred completion: when the handler defers, the
/// controller parks until the handle resolves before entering the
/// side-effect phase (or update-state, during reprocessing).
pub struct EventLifecycleContext {
    reprocessing: bool,
    completion: Option<Completion>,
}

impl EventLifecycleContext {
    pub(crate) fn new(reprocessing: bool) -> Self {
        EventLifecycleContext {
            reprocessing,
            completion: None,
        }
    }

    /// True while the controller is replaying records whose effects are
    /// already durable. No side-effects or writes happen in that mode.
    pub fn is_reprocessing(&self) -> bool {
        self.reprocessing
    }

    /// Defer the outcome of the process phase. Returns a handle the handler
    /// completes later, possibly from another thread.
    pub fn defer(&mut self) -> Completion {
        let completion = Completion::new();
        self.completion = Some(completion.clone());
        completion
    }

    pub(crate) fn take_completion(&mut self) -> Option<Completion> {
        self.completion.take()
    }
}

/// Single-slot completion handle for a deferred process phase.
#[derive(Clone)]
pub struct Completion {
    state: Arc<Mutex<CompletionState>>,
}

enum CompletionState {
    Pending,
    Done(HandlerResult<()>),
}

impl Completion {
    fn new() -> Self {
        Completion {
            state: Arc::new(Mutex::new(CompletionState::Pending)),
        }
    }

    /// Resolve the completion successfully.
    pub fn complete(&self) {
        *self.state.lock().expect("completion lock poisoned") = CompletionState::Done(Ok(()));
    }

    /// Resolve the completion with a failure. The controller fails.
    pub fn fail(&self, error: HandlerError) {
        *self.state.lock().expect("completion lock poisoned") = CompletionState::Done(Err(error));
    }

    /// `None` while pending.
    pub(crate) fn poll(&self) -> Option<HandlerResult<()>> {
        match &*self.state.lock().expect("completion lock poisoned") {
            CompletionState::Pending => None,
            CompletionState::Done(result) => Some(result.clone()),
        }
    }
}

/// Pure, deterministic predicate over a record.
///
/// Invoked identically during reprocessing and live processing; replay
/// correctness depends on it being side-effect free.
pub trait EventFilter: Send {
    fn applies(&self, record: &Record) -> bool;
}

impl<F> EventFilter for F
where
    F: Fn(&Record) -> bool + Send,
{
    fn applies(&self, record: &Record) -> bool {
        self(record)
    }
}

/// Per-record handler, driven through four phases in strict order. One
/// handler per input record; never reused.
pub trait EventProcessor: Send {
    /// Phase 1: interpret the record. May defer via the context.
    fn process(&mut self, ctx: &mut EventLifecycleContext) -> HandlerResult<()>;

    /// Phase 2: apply side-effects. Returning `false` means "not yet";
    /// the controller yields and retries until success or close.
    fn execute_side_effects(&mut self) -> HandlerResult<bool> {
        Ok(true)
    }

    /// Phase 3: write follow-up output through the stamped writer.
    fn write_event(&mut self, _writer: &mut EventWriter<'_>) -> HandlerResult<WriteResult> {
        Ok(WriteResult::Nothing)
    }

    /// Phase 4: fold the record into the processor's state resource.
    fn update_state(&mut self) -> HandlerResult<()> {
        Ok(())
    }
}

/// Read-only view of the controller's identity, handed to `on_open`.
#[derive(Clone, Debug)]
pub struct ProcessorContext {
    name: String,
    producer_id: ProducerId,
    read_only: bool,
}

impl ProcessorContext {
    pub(crate) fn new(name: String, producer_id: ProducerId, read_only: bool) -> Self {
        ProcessorContext {
            name,
            producer_id,
            read_only,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn producer_id(&self) -> ProducerId {
        self.producer_id
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }
}

/// User-supplied per-partition processor.
pub trait StreamProcessor: Send {
    /// The recoverable state resource this processor owns. Called once at
    /// open; the controller holds the handle for recovery and snapshots.
    fn state_resource(&self) -> SharedStateResource;

    fn on_open(&mut self, _ctx: &ProcessorContext) -> HandlerResult<()> {
        Ok(())
    }

    /// Decide whether `record` is handled. `None` skips the record.
    fn on_event(&mut self, record: &Record) -> HandlerResult<Option<Box<dyn EventProcessor>>>;

    /// Called once reprocessing has caught up and live processing begins.
    fn on_recovered(&mut self) {}

    fn on_close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_resolves_once_set() {
        let mut ctx = EventLifecycleContext::new(false);
        let handle = ctx.defer();
        let polled = ctx.take_completion().expect("deferred completion");

        assert!(polled.poll().is_none());
        handle.complete();
        assert!(matches!(polled.poll(), Some(Ok(()))));
    }

    #[test]
    fn completion_carries_failure() {
        let mut ctx = EventLifecycleContext::new(false);
        let handle = ctx.defer();
        let polled = ctx.take_completion().expect("deferred completion");

        handle.fail(HandlerError::new("downstream unavailable"));
        match polled.poll() {
            Some(Err(error)) => assert_eq!(error.to_string(), "downstream unavailable"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn context_without_deferral_has_no_completion() {
        let mut ctx = EventLifecycleContext::new(true);
        assert!(ctx.is_reprocessing());
        assert!(ctx.take_completion().is_none());
    }

    #[test]
    fn closures_are_event_filters() {
        use bytes::Bytes;

        let filter = |record: &Record| record.position > Position::new(1);
        let early = Record::new(Position::new(1), ProducerId::new(0), None, Bytes::new());
        let late = Record::new(Position::new(2), ProducerId::new(0), None, Bytes::new());
        assert!(!filter.applies(&early));
        assert!(filter.applies(&late));
    }
}
