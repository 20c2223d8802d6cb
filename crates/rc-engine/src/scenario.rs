//! Optimization scenario: the search space, the target's properties, and
//! the budgets the loop must respect.

use rc_types::{config_error, ConfigSpace, RacerResult, RunObjective, DEFAULT_CRASH_COST};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub name: String,
    pub configspace: ConfigSpace,
    /// Repeated runs with the same configuration/instance give the same cost.
    pub deterministic: bool,
    pub objective: RunObjective,
    pub crash_cost: f64,
    /// Wall-clock budget for the whole optimization, in seconds.
    pub walltime_limit: Option<f64>,
    /// Maximum number of trials.
    pub n_trials: usize,
    /// Per-trial cutoff in seconds.
    pub algorithm_walltime_limit: Option<f64>,
    /// Problem instances; empty means a single instance-free target.
    pub instances: Vec<String>,
    pub min_budget: Option<f64>,
    pub max_budget: Option<f64>,
    pub seed: u64,
    pub output_directory: Option<PathBuf>,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            name: "racer".to_string(),
            configspace: ConfigSpace::new(),
            deterministic: false,
            objective: RunObjective::Quality,
            crash_cost: DEFAULT_CRASH_COST,
            walltime_limit: None,
            n_trials: 100,
            algorithm_walltime_limit: None,
            instances: Vec::new(),
            min_budget: None,
            max_budget: None,
            seed: 0,
            output_directory: None,
        }
    }
}

impl Scenario {
    pub fn new(configspace: ConfigSpace) -> Self {
        Self {
            configspace,
            ..Self::default()
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> RacerResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let scenario: Self = serde_json::from_str(&contents)?;
        scenario.validate()?;
        Ok(scenario)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    pub fn with_objective(mut self, objective: RunObjective) -> Self {
        self.objective = objective;
        self
    }

    pub fn with_crash_cost(mut self, crash_cost: f64) -> Self {
        self.crash_cost = crash_cost;
        self
    }

    pub fn with_walltime_limit(mut self, seconds: f64) -> Self {
        self.walltime_limit = Some(seconds);
        self
    }

    pub fn with_n_trials(mut self, n_trials: usize) -> Self {
        self.n_trials = n_trials;
        self
    }

    pub fn with_algorithm_walltime_limit(mut self, seconds: f64) -> Self {
        self.algorithm_walltime_limit = Some(seconds);
        self
    }

    pub fn with_instances<S: Into<String>>(mut self, instances: impl IntoIterator<Item = S>) -> Self {
        self.instances = instances.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_budgets(mut self, min_budget: f64, max_budget: f64) -> Self {
        self.min_budget = Some(min_budget);
        self.max_budget = Some(max_budget);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_output_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_directory = Some(path.into());
        self
    }

    /// Instance slots used by the intensifiers; `[None]` without instances.
    pub fn instance_slots(&self) -> Vec<Option<String>> {
        if self.instances.is_empty() {
            vec![None]
        } else {
            self.instances.iter().cloned().map(Some).collect()
        }
    }

    pub fn trial_context(&self) -> TrialContext {
        TrialContext {
            deterministic: self.deterministic,
            objective: self.objective,
            algorithm_walltime_limit: self.algorithm_walltime_limit,
            instances: self.instance_slots(),
        }
    }

    pub fn validate(&self) -> RacerResult<()> {
        if self.configspace.dimensionality() == 0 {
            return Err(config_error!("scenario '{}' has an empty configuration space", self.name));
        }
        if self.n_trials == 0 {
            return Err(config_error!("n_trials must be positive"));
        }
        if let Some(limit) = self.walltime_limit {
            if !(limit > 0.0) {
                return Err(config_error!("walltime_limit must be positive, got {limit}"));
            }
        }
        if let Some(limit) = self.algorithm_walltime_limit {
            if !(limit > 0.0) {
                return Err(config_error!(
                    "algorithm_walltime_limit must be positive, got {limit}"
                ));
            }
        }
        if let RunObjective::Runtime { par_factor } = self.objective {
            if par_factor < 1.0 {
                return Err(config_error!("par_factor must be at least 1, got {par_factor}"));
            }
        }
        match (self.min_budget, self.max_budget) {
            (Some(min), Some(max)) if !(min > 0.0 && min <= max) => Err(config_error!(
                "budgets must satisfy 0 < min_budget <= max_budget, got {min} and {max}"
            )),
            (Some(_), None) | (None, Some(_)) => Err(config_error!(
                "min_budget and max_budget must be set together"
            )),
            _ => Ok(()),
        }
    }
}

/// The parts of a scenario every intensifier needs to build trial requests.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialContext {
    pub deterministic: bool,
    pub objective: RunObjective,
    pub algorithm_walltime_limit: Option<f64>,
    pub instances: Vec<Option<String>>,
}

impl Default for TrialContext {
    fn default() -> Self {
        Self {
            deterministic: false,
            objective: RunObjective::Quality,
            algorithm_walltime_limit: None,
            instances: vec![None],
        }
    }
}
