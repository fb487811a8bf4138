//! Stream-processor controller.
//!
//! Drives a user processor over a log stream through a strict lifecycle:
//! recover state from the latest snapshot, deterministically reprocess
//! records whose effects are already durable, then handle live records
//! through four phases (process, side-effects, write, update-state) while
//! periodically snapshotting under a commit-position safety gate.
//!
//! The controller is a cooperative, single-threaded task: all mutable state
//! lives here and is touched only by whoever steps the task. Work is a FIFO
//! job queue; a retrying phase yields by re-queueing itself at the back so
//! snapshot ticks and close requests interleave between retries.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender, unbounded};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{ControllerConfig, SchedulingHint};
use crate::log::{CommitListenerId, EventWriter, LogReader, LogStream};
use crate::metrics;
use crate::processor::{
    Completion, EventFilter, EventLifecycleContext, EventProcessor, HandlerError,
    ProcessorContext, SharedStateResource, StreamProcessor, WriteResult,
};
use crate::record::{Position, Record};
use crate::snapshot::{SnapshotError, SnapshotStore};

pub mod runner;

/// Lifecycle phase of a controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Reprocessing,
    Running,
    Suspended,
    Closing,
    Closed,
    Failed,
}

/// Fatal controller errors. Any of these transitions the controller to
/// [`Phase::Failed`]; the only recovery is constructing a fresh controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("stream processor '{name}' failed to recover: {source}")]
    SnapshotRecovery {
        name: String,
        #[source]
        source: SnapshotError,
    },
    #[error(
        "stream processor '{name}' failed to recover: no record at snapshot position {position}"
    )]
    SnapshotPositionNotFound { name: String, position: Position },
    #[error("stream processor '{name}' failed to open: {source}")]
    Open {
        name: String,
        #[source]
        source: HandlerError,
    },
    #[error(
        "stream processor '{name}' failed to reprocess: no source record at position {position}"
    )]
    MissingSourceRecord { name: String, position: Position },
    #[error("stream processor '{name}' failed to reprocess record at {position}: {source}")]
    Reprocessing {
        name: String,
        position: Position,
        #[source]
        source: HandlerError,
    },
    #[error("stream processor '{name}' failed to process record at {position}: {source}")]
    Processing {
        name: String,
        position: Position,
        #[source]
        source: HandlerError,
    },
}

/// Result of one cooperative step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// No runnable work; the task may park until a signal or timer.
    Idle,
    /// A job ran to completion.
    Progress,
    /// A retrying job ran without progress and re-queued itself.
    Yielded,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Job {
    ReprocessNext,
    AwaitReprocessCompletion,
    ReadNext,
    AwaitCompletion,
    ExecuteSideEffects,
    WriteEvent,
    UpdateState,
}

pub struct StreamProcessorController {
    config: ControllerConfig,
    processor: Box<dyn StreamProcessor>,
    state: SharedStateResource,
    stream: Arc<dyn LogStream>,
    snapshot_store: Box<dyn SnapshotStore>,
    filter: Option<Box<dyn EventFilter>>,

    reader: Option<Box<dyn LogReader>>,
    opened: Arc<AtomicBool>,
    failed: Arc<AtomicBool>,
    phase: Phase,
    suspended: bool,
    scheduling_hint: SchedulingHint,

    snapshot_position: Option<Position>,
    last_source_event_position: Option<Position>,
    last_processed_position: Option<Position>,
    last_written_position: Option<Position>,

    current_record: Option<Record>,
    current_handler: Option<Box<dyn EventProcessor>>,
    pending_completion: Option<Completion>,
    pending_write: Option<Position>,

    queue: VecDeque<Job>,
    commit_signal_tx: Sender<()>,
    commit_signal_rx: Receiver<()>,
    commit_listener: Option<CommitListenerId>,
    last_error: Option<ControllerError>,
}

impl StreamProcessorController {
    pub fn new(
        config: ControllerConfig,
        processor: Box<dyn StreamProcessor>,
        stream: Arc<dyn LogStream>,
        snapshot_store: Box<dyn SnapshotStore>,
    ) -> Self {
        let (commit_signal_tx, commit_signal_rx) = unbounded();
        let state = processor.state_resource();
        StreamProcessorController {
            config,
            processor,
            state,
            stream,
            snapshot_store,
            filter: None,
            reader: None,
            opened: Arc::new(AtomicBool::new(false)),
            failed: Arc::new(AtomicBool::new(false)),
            phase: Phase::Starting,
            suspended: false,
            scheduling_hint: SchedulingHint::CpuBound,
            snapshot_position: None,
            last_source_event_position: None,
            last_processed_position: None,
            last_written_position: None,
            current_record: None,
            current_handler: None,
            pending_completion: None,
            pending_write: None,
            queue: VecDeque::new(),
            commit_signal_tx,
            commit_signal_rx,
            commit_listener: None,
            last_error: None,
        }
    }

    pub fn with_event_filter(mut self, filter: Box<dyn EventFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn scheduling_hint(&self) -> SchedulingHint {
        self.scheduling_hint
    }

    pub fn snapshot_period(&self) -> Duration {
        self.config.snapshot_period
    }

    /// Position of the most recent durable snapshot.
    pub fn snapshot_position(&self) -> Option<Position> {
        self.snapshot_position
    }

    /// Upper bound of the reprocessing window established at open.
    pub fn last_source_event_position(&self) -> Option<Position> {
        self.last_source_event_position
    }

    /// Position of the latest input record whose four-phase handling
    /// completed.
    pub fn last_processed_position(&self) -> Option<Position> {
        self.last_processed_position
    }

    /// Position of the latest record this controller appended to the log.
    pub fn last_written_position(&self) -> Option<Position> {
        self.last_written_position
    }

    pub fn last_error(&self) -> Option<&ControllerError> {
        self.last_error.as_ref()
    }

    /// Receiver side of the commit-position signal channel. The runner
    /// parks on it so commit advances wake the task.
    pub fn commit_signals(&self) -> Receiver<()> {
        self.commit_signal_rx.clone()
    }

    /// Open the controller: reset and recover processor state, establish the
    /// reprocessing window, and start the cooperative task. Idempotent; a
    /// failed controller stays failed.
    pub fn open(&mut self) {
        if self.is_failed() {
            return;
        }
        if self
            .opened
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.phase = Phase::Starting;
        if let Err(error) = self.start() {
            self.fail(error);
        }
    }

    fn start(&mut self) -> Result<(), ControllerError> {
        self.state.lock().expect("state lock poisoned").reset();

        let mut reader = self.stream.new_reader();
        self.snapshot_position = self.recover_from_snapshot(reader.as_mut())?;
        self.last_source_event_position = self.scan_for_last_source_event(reader.as_mut());
        self.reader = Some(reader);

        let ctx = ProcessorContext::new(
            self.config.name.clone(),
            self.config.producer_id,
            self.config.read_only,
        );
        self.processor
            .on_open(&ctx)
            .map_err(|source| ControllerError::Open {
                name: self.config.name.clone(),
                source,
            })?;

        if self.last_source_event_position > self.snapshot_position {
            self.phase = Phase::Reprocessing;
            info!(
                controller = %self.config.name,
                until = %self.last_source_event_position.unwrap_or(Position::new(0)),
                "reprocessing durable records"
            );
            self.queue.push_back(Job::ReprocessNext);
        } else {
            self.on_recovered();
        }
        Ok(())
    }

    /// Load the latest snapshot for this controller, if any, and seek the
    /// reader past it.
    fn recover_from_snapshot(
        &mut self,
        reader: &mut dyn LogReader,
    ) -> Result<Option<Position>, ControllerError> {
        let snapshot = self
            .snapshot_store
            .last_snapshot(&self.config.name)
            .map_err(|source| ControllerError::SnapshotRecovery {
                name: self.config.name.clone(),
                source,
            })?;

        let Some(snapshot) = snapshot else {
            reader.seek_to_first();
            return Ok(None);
        };

        let position = snapshot.position();
        {
            let mut state = self.state.lock().expect("state lock poisoned");
            snapshot
                .restore(&mut *state)
                .map_err(|source| ControllerError::SnapshotRecovery {
                    name: self.config.name.clone(),
                    source,
                })?;
        }

        // The record the snapshot was taken at must still exist in the log.
        if !(reader.seek(position) && reader.has_next()) {
            return Err(ControllerError::SnapshotPositionNotFound {
                name: self.config.name.clone(),
                position,
            });
        }
        reader.seek(position.successor());

        info!(controller = %self.config.name, position = %position, "recovered from snapshot");
        Ok(Some(position))
    }

    /// Scan forward for records this controller wrote and note the highest
    /// input position their causal links point at. That position bounds the
    /// reprocessing window: everything at or below it already has durable
    /// output in the log.
    fn scan_for_last_source_event(&mut self, reader: &mut dyn LogReader) -> Option<Position> {
        if self.config.read_only || !reader.has_next() {
            return None;
        }

        let mut last_source = self.snapshot_position;
        while reader.has_next() {
            let Some(record) = reader.next() else {
                break;
            };
            if record.producer_id != self.config.producer_id {
                continue;
            }
            if let Some(source) = record.source_record_position {
                if Some(source) > last_source {
                    last_source = Some(source);
                }
            }
        }

        // Reset the reader to the first record after the snapshot.
        match self.snapshot_position {
            Some(position) => {
                reader.seek(position.successor());
            }
            None => reader.seek_to_first(),
        }
        last_source
    }

    fn on_recovered(&mut self) {
        let tx = self.commit_signal_tx.clone();
        let listener_id = self
            .stream
            .register_commit_listener(Arc::new(move || {
                let _ = tx.send(());
            }));
        self.commit_listener = Some(listener_id);

        self.phase = if self.suspended {
            Phase::Suspended
        } else {
            Phase::Running
        };
        self.processor.on_recovered();
        info!(controller = %self.config.name, "recovered, processing live records");
        self.queue.push_back(Job::ReadNext);
    }

    /// Run one cooperative step of the task.
    pub fn step(&mut self) -> StepOutcome {
        self.pump_commit_signals();
        let Some(job) = self.queue.pop_front() else {
            return StepOutcome::Idle;
        };
        self.dispatch(job)
    }

    /// Step the task until it parks. Retrying phases keep running until they
    /// succeed or the controller is closed, exactly like the live task.
    pub fn run_until_parked(&mut self) {
        while self.step() != StepOutcome::Idle {}
    }

    /// Entry point of the commit-position watcher: submits one read
    /// iteration.
    pub fn on_commit_position_updated(&mut self) {
        self.submit_read();
    }

    fn pump_commit_signals(&mut self) {
        let mut advanced = false;
        while self.commit_signal_rx.try_recv().is_ok() {
            advanced = true;
        }
        if advanced {
            self.submit_read();
        }
    }

    fn submit_read(&mut self) {
        // Coalesce: one queued read iteration is enough.
        if self.phase == Phase::Running && !self.queue.contains(&Job::ReadNext) {
            self.queue.push_back(Job::ReadNext);
        }
    }

    fn dispatch(&mut self, job: Job) -> StepOutcome {
        match job {
            Job::ReprocessNext => self.reprocess_next(),
            Job::AwaitReprocessCompletion => self.await_reprocess_completion(),
            Job::ReadNext => self.read_next(),
            Job::AwaitCompletion => self.await_completion(),
            Job::ExecuteSideEffects => self.execute_side_effects(),
            Job::WriteEvent => self.write_event(),
            Job::UpdateState => self.update_state(),
        }
    }

    // --- reprocessing ---

    fn reprocess_next(&mut self) -> StepOutcome {
        if self.phase != Phase::Reprocessing {
            return StepOutcome::Progress;
        }
        let Some(target) = self.last_source_event_position else {
            return StepOutcome::Progress;
        };

        let record = match self.reader.as_mut() {
            Some(reader) if reader.has_next() => reader.next(),
            _ => None,
        };
        let Some(record) = record else {
            self.fail(ControllerError::MissingSourceRecord {
                name: self.config.name.clone(),
                position: target,
            });
            return StepOutcome::Progress;
        };
        if record.position > target {
            self.fail(ControllerError::MissingSourceRecord {
                name: self.config.name.clone(),
                position: target,
            });
            return StepOutcome::Progress;
        }

        let position = record.position;
        self.current_record = Some(record.clone());

        if !self.filter_applies(&record) {
            return self.on_record_reprocessed(position);
        }

        let handler = match self.processor.on_event(&record) {
            Ok(handler) => handler,
            Err(source) => {
                self.fail_reprocessing(position, source);
                return StepOutcome::Progress;
            }
        };
        let Some(mut handler) = handler else {
            return self.on_record_reprocessed(position);
        };

        // No side-effects, no writes: only process and update-state run
        // against already-durable inputs.
        let mut ctx = EventLifecycleContext::new(true);
        if let Err(source) = handler.process(&mut ctx) {
            self.fail_reprocessing(position, source);
            return StepOutcome::Progress;
        }

        if let Some(completion) = ctx.take_completion() {
            self.pending_completion = Some(completion);
            self.current_handler = Some(handler);
            self.queue.push_back(Job::AwaitReprocessCompletion);
            return StepOutcome::Progress;
        }

        if let Err(source) = handler.update_state() {
            self.fail_reprocessing(position, source);
            return StepOutcome::Progress;
        }
        self.last_processed_position = Some(position);
        self.on_record_reprocessed(position)
    }

    fn await_reprocess_completion(&mut self) -> StepOutcome {
        let Some(completion) = self.pending_completion.clone() else {
            return StepOutcome::Progress;
        };
        match completion.poll() {
            None => {
                if self.is_opened() {
                    self.queue.push_back(Job::AwaitReprocessCompletion);
                    StepOutcome::Yielded
                } else {
                    StepOutcome::Progress
                }
            }
            Some(Ok(())) => {
                self.pending_completion = None;
                let position = self.current_position();
                let Some(mut handler) = self.current_handler.take() else {
                    return StepOutcome::Progress;
                };
                if let Err(source) = handler.update_state() {
                    self.fail_reprocessing(position, source);
                    return StepOutcome::Progress;
                }
                self.last_processed_position = Some(position);
                self.on_record_reprocessed(position)
            }
            Some(Err(source)) => {
                self.pending_completion = None;
                self.current_handler = None;
                let position = self.current_position();
                self.fail_reprocessing(position, source);
                StepOutcome::Progress
            }
        }
    }

    fn on_record_reprocessed(&mut self, position: Position) -> StepOutcome {
        if Some(position) == self.last_source_event_position {
            self.on_recovered();
        } else {
            self.queue.push_back(Job::ReprocessNext);
        }
        StepOutcome::Progress
    }

    // --- live processing ---

    fn read_next(&mut self) -> StepOutcome {
        if !self.is_opened() || self.phase != Phase::Running || self.current_handler.is_some() {
            return StepOutcome::Progress;
        }
        let record = match self.reader.as_mut() {
            Some(reader) if reader.has_next() => reader.next(),
            _ => None,
        };
        let Some(record) = record else {
            return StepOutcome::Progress;
        };

        self.current_record = Some(record.clone());

        if !self.filter_applies(&record) {
            metrics::event_skipped(&self.config.name);
            self.submit_read();
            return StepOutcome::Progress;
        }
        self.process_record(record)
    }

    fn process_record(&mut self, record: Record) -> StepOutcome {
        let position = record.position;
        let handler = match self.processor.on_event(&record) {
            Ok(handler) => handler,
            Err(source) => {
                self.fail_processing(position, source);
                return StepOutcome::Progress;
            }
        };
        let Some(mut handler) = handler else {
            metrics::event_skipped(&self.config.name);
            self.submit_read();
            return StepOutcome::Progress;
        };

        metrics::event_processed(&self.config.name);

        let mut ctx = EventLifecycleContext::new(false);
        if let Err(source) = handler.process(&mut ctx) {
            self.fail_processing(position, source);
            return StepOutcome::Progress;
        }

        self.current_handler = Some(handler);
        if let Some(completion) = ctx.take_completion() {
            self.pending_completion = Some(completion);
            self.queue.push_back(Job::AwaitCompletion);
        } else {
            self.queue.push_back(Job::ExecuteSideEffects);
        }
        StepOutcome::Progress
    }

    fn await_completion(&mut self) -> StepOutcome {
        let Some(completion) = self.pending_completion.clone() else {
            return StepOutcome::Progress;
        };
        match completion.poll() {
            None => {
                if self.is_opened() {
                    self.queue.push_back(Job::AwaitCompletion);
                    StepOutcome::Yielded
                } else {
                    StepOutcome::Progress
                }
            }
            Some(Ok(())) => {
                self.pending_completion = None;
                self.queue.push_back(Job::ExecuteSideEffects);
                StepOutcome::Progress
            }
            Some(Err(source)) => {
                self.pending_completion = None;
                let position = self.current_position();
                self.fail_processing(position, source);
                StepOutcome::Progress
            }
        }
    }

    fn execute_side_effects(&mut self) -> StepOutcome {
        let Some(handler) = self.current_handler.as_mut() else {
            return StepOutcome::Progress;
        };
        match handler.execute_side_effects() {
            Ok(true) => {
                if self.config.read_only {
                    self.queue.push_back(Job::UpdateState);
                } else {
                    self.queue.push_back(Job::WriteEvent);
                }
                StepOutcome::Progress
            }
            Ok(false) => {
                if self.is_opened() {
                    self.queue.push_back(Job::ExecuteSideEffects);
                    StepOutcome::Yielded
                } else {
                    StepOutcome::Progress
                }
            }
            Err(source) => {
                let position = self.current_position();
                self.fail_processing(position, source);
                StepOutcome::Progress
            }
        }
    }

    fn write_event(&mut self) -> StepOutcome {
        let source_position = self.current_record.as_ref().map(|record| record.position);
        let Some(handler) = self.current_handler.as_mut() else {
            return StepOutcome::Progress;
        };

        let mut writer =
            EventWriter::new(self.stream.as_ref(), self.config.producer_id, source_position);
        let result = handler.write_event(&mut writer);
        drop(writer);

        match result {
            Ok(WriteResult::Written(position)) => {
                self.pending_write = Some(position);
                metrics::event_written(&self.config.name);
                self.queue.push_back(Job::UpdateState);
                StepOutcome::Progress
            }
            Ok(WriteResult::Nothing) => {
                self.pending_write = None;
                self.queue.push_back(Job::UpdateState);
                StepOutcome::Progress
            }
            Ok(WriteResult::Backpressure) => {
                if self.is_opened() {
                    self.queue.push_back(Job::WriteEvent);
                    StepOutcome::Yielded
                } else {
                    StepOutcome::Progress
                }
            }
            Err(source) => {
                let position = self.current_position();
                self.fail_processing(position, source);
                StepOutcome::Progress
            }
        }
    }

    fn update_state(&mut self) -> StepOutcome {
        let Some(mut handler) = self.current_handler.take() else {
            return StepOutcome::Progress;
        };
        if let Err(source) = handler.update_state() {
            let position = self.current_position();
            self.fail_processing(position, source);
            return StepOutcome::Progress;
        }

        self.last_processed_position = self.current_record.as_ref().map(|record| record.position);
        if let Some(position) = self.pending_write.take() {
            self.last_written_position = Some(position);
        }

        // Handler is single-use; dropping it re-opens the read gate.
        self.submit_read();
        StepOutcome::Progress
    }

    // --- snapshots ---

    /// Periodic snapshot tick. Runs on the controller task, serialized with
    /// event handling. A no-op unless the controller is live.
    pub fn snapshot_tick(&mut self) {
        if self.phase != Phase::Running {
            return;
        }
        // Snapshot writing is I/O heavy; advertise it to the scheduler.
        self.scheduling_hint = SchedulingHint::IoBound;
        self.create_snapshot();
        self.scheduling_hint = SchedulingHint::CpuBound;
    }

    fn create_snapshot(&mut self) {
        if self.current_record.is_none() {
            return;
        }
        let Some(position) = self.last_processed_position else {
            return;
        };
        if self.last_processed_position <= self.snapshot_position {
            return;
        }
        // The written output must be replicated before state derived from it
        // may be persisted, or a failover could lose the output while the
        // snapshot claims it was processed.
        if self.stream.commit_position() < self.last_written_position {
            debug!(
                controller = %self.config.name,
                "skipping snapshot: last written record not yet committed"
            );
            return;
        }
        self.write_snapshot(position);
    }

    fn write_snapshot(&mut self, position: Position) {
        let started = Instant::now();
        info!(controller = %self.config.name, position = %position, "writing snapshot");

        let mut writer = match self
            .snapshot_store
            .create_snapshot(&self.config.name, position)
        {
            Ok(writer) => writer,
            Err(error) => {
                warn!(controller = %self.config.name, %error, "failed to create snapshot writer");
                return;
            }
        };

        let written = {
            let state = self.state.lock().expect("state lock poisoned");
            writer.write(&*state)
        };
        let size = match written {
            Ok(size) => size,
            Err(error) => {
                warn!(controller = %self.config.name, %error, "failed to write snapshot");
                writer.abort();
                return;
            }
        };
        if let Err(error) = writer.commit() {
            warn!(controller = %self.config.name, %error, "failed to commit snapshot");
            return;
        }

        let elapsed = started.elapsed();
        metrics::snapshot_size(&self.config.name, size);
        metrics::snapshot_duration(&self.config.name, elapsed);
        info!(
            controller = %self.config.name,
            position = %position,
            size,
            elapsed_ms = elapsed.as_millis() as u64,
            "snapshot written"
        );
        self.snapshot_position = Some(position);
    }

    // --- lifecycle ---

    /// Request suspension. Advisory: an in-flight four-phase sequence
    /// completes; only the read gate closes.
    pub fn suspend(&mut self) {
        self.suspended = true;
        if self.phase == Phase::Running {
            self.phase = Phase::Suspended;
            debug!(controller = %self.config.name, "suspended");
        }
    }

    pub fn resume(&mut self) {
        self.suspended = false;
        if self.phase == Phase::Suspended {
            self.phase = Phase::Running;
            debug!(controller = %self.config.name, "resumed");
            self.submit_read();
        }
    }

    /// Close the controller. When it has not failed, a final snapshot is
    /// attempted under the same safety gate as the periodic tick and the
    /// processor's `on_close` hook runs. Idempotent.
    pub fn close(&mut self) {
        if self
            .opened
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if self.is_failed() {
            return;
        }

        self.phase = Phase::Closing;
        self.queue.clear();
        self.current_handler = None;
        self.pending_completion = None;
        self.pending_write = None;

        self.create_snapshot();
        self.processor.on_close();
        self.teardown();
        self.phase = Phase::Closed;
        info!(controller = %self.config.name, "closed");
    }

    fn fail(&mut self, error: ControllerError) {
        if self
            .failed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        error!(controller = %self.config.name, %error, "stream processor failed, stopping");
        self.opened.store(false, Ordering::Release);
        self.phase = Phase::Failed;
        self.queue.clear();
        self.current_handler = None;
        self.pending_completion = None;
        self.pending_write = None;
        self.teardown();
        self.last_error = Some(error);
    }

    fn fail_reprocessing(&mut self, position: Position, source: HandlerError) {
        self.fail(ControllerError::Reprocessing {
            name: self.config.name.clone(),
            position,
            source,
        });
    }

    fn fail_processing(&mut self, position: Position, source: HandlerError) {
        self.fail(ControllerError::Processing {
            name: self.config.name.clone(),
            position,
            source,
        });
    }

    fn teardown(&mut self) {
        if let Some(id) = self.commit_listener.take() {
            self.stream.deregister_commit_listener(id);
        }
        self.reader = None;
    }

    fn filter_applies(&self, record: &Record) -> bool {
        self.filter
            .as_ref()
            .is_none_or(|filter| filter.applies(record))
    }

    fn current_position(&self) -> Position {
        self.current_record
            .as_ref()
            .map(|record| record.position)
            .unwrap_or(Position::new(0))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;

    use super::*;
    use crate::log::memory::InMemoryLog;
    use crate::processor::{HandlerResult, StateResource};
    use crate::record::ProducerId;
    use crate::snapshot::MemorySnapshotStore;

    struct NoState;

    impl StateResource for NoState {
        fn reset(&mut self) {}

        fn serialize_to(&self, _writer: &mut dyn std::io::Write) -> std::io::Result<()> {
            Ok(())
        }

        fn restore_from(&mut self, _reader: &mut dyn std::io::Read) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct NoopProcessor {
        state: Arc<Mutex<NoState>>,
        fail_open: bool,
    }

    impl NoopProcessor {
        fn new() -> Self {
            NoopProcessor {
                state: Arc::new(Mutex::new(NoState)),
                fail_open: false,
            }
        }
    }

    impl StreamProcessor for NoopProcessor {
        fn state_resource(&self) -> SharedStateResource {
            self.state.clone()
        }

        fn on_open(&mut self, _ctx: &ProcessorContext) -> HandlerResult<()> {
            if self.fail_open {
                Err(HandlerError::new("boom"))
            } else {
                Ok(())
            }
        }

        fn on_event(
            &mut self,
            _record: &Record,
        ) -> HandlerResult<Option<Box<dyn EventProcessor>>> {
            Ok(None)
        }
    }

    fn controller_with(processor: NoopProcessor) -> StreamProcessorController {
        StreamProcessorController::new(
            ControllerConfig::new("test", ProducerId::new(1)),
            Box::new(processor),
            Arc::new(InMemoryLog::new()),
            Box::new(MemorySnapshotStore::new()),
        )
    }

    #[test]
    fn open_is_idempotent() {
        let mut controller = controller_with(NoopProcessor::new());
        controller.open();
        assert!(controller.is_opened());
        assert_eq!(controller.phase(), Phase::Running);
        controller.open();
        assert_eq!(controller.phase(), Phase::Running);
    }

    #[test]
    fn open_after_failure_is_a_noop() {
        let mut processor = NoopProcessor::new();
        processor.fail_open = true;
        let mut controller = controller_with(processor);

        controller.open();
        assert!(controller.is_failed());
        assert!(!controller.is_opened());
        assert!(matches!(
            controller.last_error(),
            Some(ControllerError::Open { .. })
        ));

        controller.open();
        assert!(controller.is_failed());
        assert_eq!(controller.phase(), Phase::Failed);
    }

    #[test]
    fn suspend_and_resume_toggle_phase() {
        let mut controller = controller_with(NoopProcessor::new());
        controller.open();

        controller.suspend();
        assert!(controller.is_suspended());
        assert_eq!(controller.phase(), Phase::Suspended);

        controller.resume();
        assert!(!controller.is_suspended());
        assert_eq!(controller.phase(), Phase::Running);
    }

    #[test]
    fn close_is_idempotent_and_terminal() {
        let mut controller = controller_with(NoopProcessor::new());
        controller.open();
        controller.run_until_parked();

        controller.close();
        assert_eq!(controller.phase(), Phase::Closed);
        assert!(!controller.is_opened());

        controller.close();
        assert_eq!(controller.phase(), Phase::Closed);
    }

    #[test]
    fn skipped_records_still_advance_the_reader() {
        let log = Arc::new(InMemoryLog::new());
        for _ in 0..3 {
            log.append(ProducerId::new(9), None, Bytes::from_static(b"in"));
        }
        let mut controller = StreamProcessorController::new(
            ControllerConfig::new("test", ProducerId::new(1)),
            Box::new(NoopProcessor::new()),
            log.clone() as Arc<dyn LogStream>,
            Box::new(MemorySnapshotStore::new()),
        );

        controller.open();
        controller.run_until_parked();

        // All records were offered and skipped; nothing was written back.
        assert_eq!(log.len(), 3);
        assert_eq!(controller.last_processed_position(), None);
    }
}
