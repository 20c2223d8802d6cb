//! # rc-engine
//!
//! The Racer optimization loop: scenarios, initial designs, random
//! interleaving, racing and budgeted intensification, target execution, and
//! the preset-driven builder that wires them together.

pub mod builder;
pub mod executor;
pub mod initial_design;
pub mod intensification;
pub mod intensifier;
pub mod random_chooser;
pub mod scenario;
pub mod smbo;
pub mod successive_halving;

pub use builder::{Preset, SmboBuilder};
pub use executor::{
    ExecutorError, ExecutorResult, FunctionExecutor, OutcomeConverter, TargetExecutor,
};
pub use initial_design::{DesignSettings, DesignStrategy, InitialDesign};
pub use intensification::{IntensifierKind, IntensifierSettings};
pub use intensifier::{
    adaptive_cap, ChallengerQueue, Intensifier, IntensifierAction, RaceState, RacingSettings,
    Stage,
};
pub use random_chooser::{RandomChooserKind, RandomConfigurationChooser};
pub use scenario::{Scenario, TrialContext};
pub use smbo::{Smbo, SmboEvent, SmboOutcome, SmboState, SmboStats};
pub use successive_halving::{BracketSchedule, HalvingSettings, SuccessiveHalving};
