//! Shared fixtures for controller integration tests.
#![allow(dead_code)]

use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use millstream::{
    AppendOutcome, CommitListener, CommitListenerId, Completion, ControllerConfig,
    EventLifecycleContext, EventProcessor, EventWriter, HandlerError, HandlerResult, InMemoryLog,
    LogReader, LogStream, MemorySnapshotStore, Position, ProducerId, Record, SharedStateResource,
    SnapshotStore, StateResource, StreamProcessor, StreamProcessorController, WriteResult,
};

/// Producer id used for seeded input records.
pub const INPUT_PRODUCER: ProducerId = ProducerId::new(9);
/// Producer id the controller under test writes with.
pub const SELF_PRODUCER: ProducerId = ProducerId::new(1);

pub fn input_payload() -> Bytes {
    Bytes::from_static(b"input")
}

pub fn output_payload() -> Bytes {
    Bytes::from_static(b"output")
}

/// Append `count` input records from a foreign producer.
pub fn seed_inputs(log: &InMemoryLog, count: usize) -> Vec<Position> {
    (0..count)
        .map(|_| log.append(INPUT_PRODUCER, None, input_payload()))
        .collect()
}

/// Counter state, serialized as JSON.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CounterState {
    pub counter: u64,
}

impl StateResource for CounterState {
    fn reset(&mut self) {
        self.counter = 0;
    }

    fn serialize_to(&self, writer: &mut dyn io::Write) -> io::Result<()> {
        serde_json::to_writer(writer, self).map_err(io::Error::other)
    }

    fn restore_from(&mut self, reader: &mut dyn io::Read) -> io::Result<()> {
        let restored: CounterState = serde_json::from_reader(reader)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.counter = restored.counter;
        Ok(())
    }
}

/// One observed handler phase call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Process { position: Position, reprocessing: bool },
    SideEffects(Position),
    Write(Position),
    UpdateState(Position),
}

impl Call {
    pub fn position(&self) -> Position {
        match self {
            Call::Process { position, .. } => *position,
            Call::SideEffects(position) => *position,
            Call::Write(position) => *position,
            Call::UpdateState(position) => *position,
        }
    }
}

/// Shared call log recording every handler phase invocation in order.
#[derive(Clone, Default)]
pub struct Trace {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl Trace {
    pub fn new() -> Self {
        Trace::default()
    }

    fn record(&self, call: Call) {
        self.calls.lock().expect("trace lock").push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("trace lock").clone()
    }

    pub fn process_positions(&self) -> Vec<Position> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Process { position, .. } => Some(position),
                _ => None,
            })
            .collect()
    }

    pub fn side_effect_positions(&self) -> Vec<Position> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::SideEffects(position) => Some(position),
                _ => None,
            })
            .collect()
    }

    pub fn write_calls(&self) -> usize {
        self.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Write(_)))
            .count()
    }

    pub fn update_state_positions(&self) -> Vec<Position> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::UpdateState(position) => Some(position),
                _ => None,
            })
            .collect()
    }
}

/// Test processor counting handled records.
///
/// Skips records written by [`SELF_PRODUCER`]; optionally writes one output
/// record per input, injects a process-phase failure at a given position, or
/// defers the process phase at a given position.
pub struct CountingProcessor {
    state: Arc<Mutex<CounterState>>,
    trace: Trace,
    write_output: bool,
    fail_process_at: Option<Position>,
    defer_at: Option<Position>,
    deferred: Arc<Mutex<Option<Completion>>>,
}

impl CountingProcessor {
    pub fn new() -> Self {
        CountingProcessor {
            state: Arc::new(Mutex::new(CounterState::default())),
            trace: Trace::new(),
            write_output: false,
            fail_process_at: None,
            defer_at: None,
            deferred: Arc::new(Mutex::new(None)),
        }
    }

    /// Write one output record per handled input.
    pub fn writing() -> Self {
        let mut processor = CountingProcessor::new();
        processor.write_output = true;
        processor
    }

    pub fn fail_process_at(mut self, position: Position) -> Self {
        self.fail_process_at = Some(position);
        self
    }

    pub fn defer_at(mut self, position: Position) -> Self {
        self.defer_at = Some(position);
        self
    }

    pub fn trace(&self) -> Trace {
        self.trace.clone()
    }

    pub fn state_handle(&self) -> Arc<Mutex<CounterState>> {
        self.state.clone()
    }

    /// Slot the handler parks its deferred completion in.
    pub fn deferred_slot(&self) -> Arc<Mutex<Option<Completion>>> {
        self.deferred.clone()
    }
}

impl Default for CountingProcessor {
    fn default() -> Self {
        CountingProcessor::new()
    }
}

impl StreamProcessor for CountingProcessor {
    fn state_resource(&self) -> SharedStateResource {
        self.state.clone()
    }

    fn on_event(&mut self, record: &Record) -> HandlerResult<Option<Box<dyn EventProcessor>>> {
        if record.producer_id == SELF_PRODUCER {
            return Ok(None);
        }
        Ok(Some(Box::new(CountingHandler {
            position: record.position,
            state: self.state.clone(),
            trace: self.trace.clone(),
            write_output: self.write_output,
            fail_process: self.fail_process_at == Some(record.position),
            defer: self.defer_at == Some(record.position),
            deferred: self.deferred.clone(),
        })))
    }
}

struct CountingHandler {
    position: Position,
    state: Arc<Mutex<CounterState>>,
    trace: Trace,
    write_output: bool,
    fail_process: bool,
    defer: bool,
    deferred: Arc<Mutex<Option<Completion>>>,
}

impl EventProcessor for CountingHandler {
    fn process(&mut self, ctx: &mut EventLifecycleContext) -> HandlerResult<()> {
        self.trace.record(Call::Process {
            position: self.position,
            reprocessing: ctx.is_reprocessing(),
        });
        if self.fail_process {
            return Err(HandlerError::new("injected process failure"));
        }
        if self.defer {
            *self.deferred.lock().expect("deferred lock") = Some(ctx.defer());
        }
        Ok(())
    }

    fn execute_side_effects(&mut self) -> HandlerResult<bool> {
        self.trace.record(Call::SideEffects(self.position));
        Ok(true)
    }

    fn write_event(&mut self, writer: &mut EventWriter<'_>) -> HandlerResult<WriteResult> {
        self.trace.record(Call::Write(self.position));
        if !self.write_output {
            return Ok(WriteResult::Nothing);
        }
        match writer.append(output_payload()) {
            AppendOutcome::Appended(position) => Ok(WriteResult::Written(position)),
            AppendOutcome::Backpressure => Ok(WriteResult::Backpressure),
        }
    }

    fn update_state(&mut self) -> HandlerResult<()> {
        self.trace.record(Call::UpdateState(self.position));
        self.state.lock().expect("state lock").counter += 1;
        Ok(())
    }
}

/// Log wrapper rejecting the first `rejects` appends with backpressure.
#[derive(Clone)]
pub struct FlakyLog {
    inner: InMemoryLog,
    rejects: Arc<Mutex<u32>>,
}

impl FlakyLog {
    pub fn new(inner: InMemoryLog, rejects: u32) -> Self {
        FlakyLog {
            inner,
            rejects: Arc::new(Mutex::new(rejects)),
        }
    }
}

impl LogStream for FlakyLog {
    fn new_reader(&self) -> Box<dyn LogReader> {
        self.inner.new_reader()
    }

    fn append_stamped(
        &self,
        producer_id: ProducerId,
        source_record_position: Option<Position>,
        payload: Bytes,
    ) -> AppendOutcome {
        let mut rejects = self.rejects.lock().expect("rejects lock");
        if *rejects > 0 {
            *rejects -= 1;
            return AppendOutcome::Backpressure;
        }
        drop(rejects);
        self.inner
            .append_stamped(producer_id, source_record_position, payload)
    }

    fn commit_position(&self) -> Option<Position> {
        self.inner.commit_position()
    }

    fn register_commit_listener(&self, listener: CommitListener) -> CommitListenerId {
        self.inner.register_commit_listener(listener)
    }

    fn deregister_commit_listener(&self, id: CommitListenerId) {
        self.inner.deregister_commit_listener(id)
    }
}

pub fn test_config(name: &str) -> ControllerConfig {
    ControllerConfig::new(name, SELF_PRODUCER)
}

pub fn build_controller(
    name: &str,
    processor: CountingProcessor,
    log: Arc<dyn LogStream>,
    store: MemorySnapshotStore,
) -> StreamProcessorController {
    StreamProcessorController::new(test_config(name), Box::new(processor), log, Box::new(store))
}

/// Seed a snapshot of `CounterState { counter }` at `position`.
pub fn seed_snapshot(store: &MemorySnapshotStore, name: &str, position: Position, counter: u64) {
    let mut writer = store
        .create_snapshot(name, position)
        .expect("create seed snapshot");
    let state = CounterState { counter };
    writer.write(&state).expect("write seed snapshot");
    writer.commit().expect("commit seed snapshot");
}
