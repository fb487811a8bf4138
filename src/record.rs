//! Log record model: positions, producer identity, immutable records.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Position of a record in its log stream.
///
/// Positions are assigned by the log, strictly increase with append order,
/// and totally order the stream.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Position(u64);

impl Position {
    pub const fn new(value: u64) -> Self {
        Position(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// The next position after this one. Seeking to the successor of a
    /// processed position skips past it.
    pub fn successor(self) -> Position {
        Position(self.0.saturating_add(1))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity stamped on every record written by a controller.
///
/// Reprocessing uses it to recognize the controller's own past output.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ProducerId(u32);

impl ProducerId {
    pub const fn new(value: u32) -> Self {
        ProducerId(value)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable entry in the log.
///
/// `source_record_position` is the causal link back to the input record that
/// produced this one; `None` when the record was not produced by processing
/// another record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub position: Position,
    pub producer_id: ProducerId,
    pub source_record_position: Option<Position>,
    pub payload: Bytes,
}

impl Record {
    pub fn new(
        position: Position,
        producer_id: ProducerId,
        source_record_position: Option<Position>,
        payload: Bytes,
    ) -> Self {
        Record {
            position,
            producer_id,
            source_record_position,
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_order_by_value() {
        assert!(Position::new(1) < Position::new(2));
        assert_eq!(Position::new(7), Position::new(7));
        assert_eq!(Position::new(3).successor(), Position::new(4));
    }

    #[test]
    fn optional_positions_order_none_first() {
        // The controller compares optional positions directly; "no position
        // yet" must sort below every real position.
        assert!(None < Some(Position::new(0)));
        assert!(Some(Position::new(1)) < Some(Position::new(2)));
    }

    #[test]
    fn successor_saturates_at_max() {
        let max = Position::new(u64::MAX);
        assert_eq!(max.successor(), max);
    }
}
