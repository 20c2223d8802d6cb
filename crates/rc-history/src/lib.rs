//! # rc-history
//!
//! The run history every Racer component reads from, the append-only
//! incumbent trajectory, and their JSON persistence.

mod persistence;
mod runhistory;
mod trajectory;

pub use persistence::RunHistoryStore;
pub use runhistory::{CostPolicy, RunEntry, RunHistory, RunHistorySnapshot, TrainingData};
pub use trajectory::{Trajectory, TrajectoryEntry};
