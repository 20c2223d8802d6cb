//! Append-only record of incumbent changes.

use chrono::{DateTime, Utc};
use rc_types::{ConfigId, Configuration, InstanceSeedBudgetKey};
use serde::{Deserialize, Serialize};

/// One incumbent change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryEntry {
    /// Seconds since the optimization started.
    pub wallclock_time: f64,
    /// Trials finished when the change happened.
    pub trials_finished: usize,
    pub config_id: ConfigId,
    pub config: Configuration,
    /// Aggregate cost of the incumbent on `evaluated`.
    pub cost: f64,
    /// Instance/seed/budget keys the incumbent has been evaluated on.
    pub evaluated: Vec<InstanceSeedBudgetKey>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    entries: Vec<TrajectoryEntry>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: TrajectoryEntry) {
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[TrajectoryEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&TrajectoryEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrajectoryEntry> {
        self.entries.iter()
    }
}
