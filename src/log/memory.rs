//! In-memory log stream.
//!
//! Reference implementation of the [`LogStream`] contract, used by tests and
//! examples. Replication is simulated: the commit position is advanced
//! explicitly and clamped to the log head.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use super::{AppendOutcome, CommitListener, CommitListenerId, LogReader, LogStream};
use crate::record::{Position, ProducerId, Record};

/// Shared, append-only in-memory log. Clones share the same backing store.
#[derive(Clone)]
pub struct InMemoryLog {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    records: Vec<Record>,
    commit_position: Option<Position>,
    listeners: HashMap<u64, CommitListener>,
    next_listener_id: u64,
}

impl InMemoryLog {
    pub fn new() -> Self {
        InMemoryLog {
            inner: Arc::new(Mutex::new(Inner {
                records: Vec::new(),
                commit_position: None,
                listeners: HashMap::new(),
                next_listener_id: 0,
            })),
        }
    }

    /// Append a record directly, assigning the next position. Test setup
    /// uses this to seed input records from other producers.
    pub fn append(
        &self,
        producer_id: ProducerId,
        source_record_position: Option<Position>,
        payload: Bytes,
    ) -> Position {
        let mut inner = self.lock();
        let position = inner.head_position().map_or(Position::new(1), Position::successor);
        inner.records.push(Record::new(
            position,
            producer_id,
            source_record_position,
            payload,
        ));
        position
    }

    /// Advance the commit position. Clamped to the log head and monotone:
    /// a lower target than the current commit position is ignored. Notifies
    /// registered listeners when the position actually advances.
    pub fn set_commit_position(&self, position: Position) {
        let listeners: Vec<CommitListener> = {
            let mut inner = self.lock();
            let Some(head) = inner.head_position() else {
                return;
            };
            let target = position.min(head);
            if Some(target) <= inner.commit_position {
                return;
            }
            inner.commit_position = Some(target);
            inner.listeners.values().cloned().collect()
        };
        for listener in listeners {
            listener();
        }
    }

    /// Mark everything currently in the log as committed.
    pub fn commit_to_head(&self) {
        let head = self.head_position();
        if let Some(head) = head {
            self.set_commit_position(head);
        }
    }

    pub fn head_position(&self) -> Option<Position> {
        self.lock().head_position()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Snapshot of the current records, for assertions.
    pub fn records(&self) -> Vec<Record> {
        self.lock().records.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("log lock poisoned")
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        InMemoryLog::new()
    }
}

impl Inner {
    fn head_position(&self) -> Option<Position> {
        self.records.last().map(|record| record.position)
    }

    /// Index of the first record with position >= `position`.
    fn lower_bound(&self, position: Position) -> usize {
        self.records
            .partition_point(|record| record.position < position)
    }
}

impl LogStream for InMemoryLog {
    fn new_reader(&self) -> Box<dyn LogReader> {
        Box::new(InMemoryReader {
            inner: Arc::clone(&self.inner),
            next_index: 0,
        })
    }

    fn append_stamped(
        &self,
        producer_id: ProducerId,
        source_record_position: Option<Position>,
        payload: Bytes,
    ) -> AppendOutcome {
        AppendOutcome::Appended(self.append(producer_id, source_record_position, payload))
    }

    fn commit_position(&self) -> Option<Position> {
        self.lock().commit_position
    }

    fn register_commit_listener(&self, listener: CommitListener) -> CommitListenerId {
        let mut inner = self.lock();
        let id = inner.next_listener_id;
        inner.next_listener_id += 1;
        inner.listeners.insert(id, listener);
        CommitListenerId::new(id)
    }

    fn deregister_commit_listener(&self, id: CommitListenerId) {
        self.lock().listeners.remove(&id.get());
    }
}

struct InMemoryReader {
    inner: Arc<Mutex<Inner>>,
    next_index: usize,
}

impl LogReader for InMemoryReader {
    fn seek(&mut self, position: Position) -> bool {
        let inner = self.inner.lock().expect("log lock poisoned");
        self.next_index = inner.lower_bound(position);
        inner
            .records
            .get(self.next_index)
            .is_some_and(|record| record.position == position)
    }

    fn seek_to_first(&mut self) {
        self.next_index = 0;
    }

    fn has_next(&self) -> bool {
        let inner = self.inner.lock().expect("log lock poisoned");
        self.next_index < inner.records.len()
    }

    fn next(&mut self) -> Option<Record> {
        let inner = self.inner.lock().expect("log lock poisoned");
        let record = inner.records.get(self.next_index).cloned()?;
        drop(inner);
        self.next_index += 1;
        Some(record)
    }
}
