//! Controller configuration surface.
//!
//! No CLI, env vars, or config files at this layer; callers construct the
//! options in code.

use std::time::Duration;

use crate::record::ProducerId;

/// Default period between snapshot ticks.
pub const DEFAULT_SNAPSHOT_PERIOD: Duration = Duration::from_secs(60);

/// Options recognized by a stream-processor controller.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Controller identity; also the snapshot key.
    pub name: String,
    /// Identity stamped on every record this controller writes.
    pub producer_id: ProducerId,
    /// Period between snapshot ticks.
    pub snapshot_period: Duration,
    /// Read-only processors never write output and skip the source-event
    /// scan on open.
    pub read_only: bool,
}

impl ControllerConfig {
    pub fn new(name: impl Into<String>, producer_id: ProducerId) -> Self {
        ControllerConfig {
            name: name.into(),
            producer_id,
            snapshot_period: DEFAULT_SNAPSHOT_PERIOD,
            read_only: false,
        }
    }

    pub fn with_snapshot_period(mut self, period: Duration) -> Self {
        self.snapshot_period = period;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

/// Scheduling hint a controller exposes to its scheduler pool.
///
/// CPU-bound by default; I/O-bound while a snapshot is being written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SchedulingHint {
    #[default]
    CpuBound,
    IoBound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_live_cpu_bound() {
        let config = ControllerConfig::new("payments", ProducerId::new(3));
        assert_eq!(config.name, "payments");
        assert_eq!(config.snapshot_period, DEFAULT_SNAPSHOT_PERIOD);
        assert!(!config.read_only);
        assert_eq!(SchedulingHint::default(), SchedulingHint::CpuBound);
    }

    #[test]
    fn builder_overrides() {
        let config = ControllerConfig::new("payments", ProducerId::new(3))
            .with_snapshot_period(Duration::from_millis(250))
            .read_only();
        assert_eq!(config.snapshot_period, Duration::from_millis(250));
        assert!(config.read_only);
    }
}
