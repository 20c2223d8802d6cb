//! Run keys, run values, and trial requests exchanged between the
//! intensifier, the target executor, and the run history.

use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::configuration::Configuration;
use crate::errors::TrialError;

/// Dense configuration identifier assigned by the run history.
pub type ConfigId = u32;

/// Hashable fidelity level (e.g. epochs, subset size).
pub type Budget = OrderedFloat<f64>;

/// Cost charged for crashed or out-of-memory trials unless overridden.
pub const DEFAULT_CRASH_COST: f64 = 2_147_483_647.0;

/// Outcome status of a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusType {
    Success,
    Crashed,
    Timeout,
    Memout,
    /// Stopped early by adaptive capping; the cost is only a lower bound.
    Capped,
    Running,
}

impl StatusType {
    /// Right-censored observations never enter an average as exact costs.
    pub fn is_censored(&self) -> bool {
        matches!(self, Self::Capped | Self::Running)
    }

    /// Statuses charged with the crash cost.
    pub fn is_crash(&self) -> bool {
        matches!(self, Self::Crashed | Self::Memout)
    }
}

impl fmt::Display for StatusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "SUCCESS",
            Self::Crashed => "CRASHED",
            Self::Timeout => "TIMEOUT",
            Self::Memout => "MEMOUT",
            Self::Capped => "CAPPED",
            Self::Running => "RUNNING",
        };
        f.write_str(s)
    }
}

/// What the optimizer minimizes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunObjective {
    /// Solution quality reported by the target.
    Quality,
    /// Target runtime; timeouts are charged `par_factor × cutoff`.
    Runtime { par_factor: f64 },
}

impl Default for RunObjective {
    fn default() -> Self {
        Self::Quality
    }
}

impl RunObjective {
    pub fn is_runtime(&self) -> bool {
        matches!(self, Self::Runtime { .. })
    }
}

/// Trial cost: a scalar, or one value per objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cost {
    Single(f64),
    Multi(Vec<f64>),
}

impl Cost {
    /// Scalarized cost: multi-objective costs use the unweighted mean.
    pub fn scalar(&self) -> f64 {
        match self {
            Self::Single(v) => *v,
            Self::Multi(values) if values.is_empty() => f64::NAN,
            Self::Multi(values) => values.iter().sum::<f64>() / values.len() as f64,
        }
    }
}

impl From<f64> for Cost {
    fn from(v: f64) -> Self {
        Self::Single(v)
    }
}

/// The per-configuration part of a [`RunKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceSeedBudgetKey {
    pub instance: Option<String>,
    pub seed: u64,
    pub budget: Option<Budget>,
}

impl InstanceSeedBudgetKey {
    pub fn new(instance: Option<String>, seed: u64, budget: Option<f64>) -> Self {
        Self {
            instance,
            seed,
            budget: budget.map(OrderedFloat),
        }
    }
}

impl fmt::Display for InstanceSeedBudgetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "instance={} seed={}",
            self.instance.as_deref().unwrap_or("-"),
            self.seed
        )?;
        if let Some(budget) = self.budget {
            write!(f, " budget={}", budget.0)?;
        }
        Ok(())
    }
}

/// Uniquely identifies one evaluation trial.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunKey {
    pub config_id: ConfigId,
    pub instance: Option<String>,
    pub seed: u64,
    pub budget: Option<Budget>,
}

impl RunKey {
    pub fn new(config_id: ConfigId, key: InstanceSeedBudgetKey) -> Self {
        Self {
            config_id,
            instance: key.instance,
            seed: key.seed,
            budget: key.budget,
        }
    }

    pub fn instance_seed_budget(&self) -> InstanceSeedBudgetKey {
        InstanceSeedBudgetKey {
            instance: self.instance.clone(),
            seed: self.seed,
            budget: self.budget,
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config {} / {}", self.config_id, self.instance_seed_budget())
    }
}

/// Outcome of a trial as stored in the run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunValue {
    pub cost: Cost,
    /// Measured runtime in seconds.
    pub time: f64,
    pub status: StatusType,
    pub starttime: DateTime<Utc>,
    pub endtime: DateTime<Utc>,
    #[serde(default)]
    pub additional_info: serde_json::Value,
}

impl RunValue {
    pub fn new(cost: impl Into<Cost>, time: f64, status: StatusType) -> Self {
        let now = Utc::now();
        Self {
            cost: cost.into(),
            time,
            status,
            starttime: now,
            endtime: now,
            additional_info: serde_json::Value::Null,
        }
    }

    pub fn success(cost: impl Into<Cost>, time: f64) -> Self {
        Self::new(cost, time, StatusType::Success)
    }

    pub fn with_times(mut self, starttime: DateTime<Utc>, endtime: DateTime<Utc>) -> Self {
        self.starttime = starttime;
        self.endtime = endtime;
        self
    }

    pub fn with_info(mut self, info: serde_json::Value) -> Self {
        self.additional_info = info;
        self
    }

    /// Why the trial did not finish normally, if it didn't.
    pub fn failure(&self) -> Option<TrialError> {
        let message = || {
            self.additional_info
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("no details")
                .to_string()
        };
        match self.status {
            StatusType::Crashed => Some(TrialError::Crashed { message: message() }),
            StatusType::Memout => Some(TrialError::Memout { message: message() }),
            StatusType::Timeout => Some(TrialError::Timeout { runtime: self.time }),
            StatusType::Capped => Some(TrialError::Capped { cutoff: self.time }),
            StatusType::Success | StatusType::Running => None,
        }
    }
}

/// An intensifier-emitted instruction to evaluate one configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRequest {
    pub id: Uuid,
    pub config: Configuration,
    pub instance: Option<String>,
    pub seed: u64,
    pub budget: Option<f64>,
    /// Contractual upper bound on the returned runtime, in seconds.
    pub cutoff: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl TrialRequest {
    pub fn new(config: Configuration, key: &InstanceSeedBudgetKey, cutoff: Option<f64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            instance: key.instance.clone(),
            seed: key.seed,
            budget: key.budget.map(|b| b.0),
            cutoff,
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> InstanceSeedBudgetKey {
        InstanceSeedBudgetKey::new(self.instance.clone(), self.seed, self.budget)
    }
}

/// Raw result returned by a target executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOutcome {
    pub cost: Cost,
    pub runtime: f64,
    pub status: StatusType,
    #[serde(default)]
    pub additional_info: serde_json::Value,
}

impl TrialOutcome {
    pub fn success(cost: impl Into<Cost>, runtime: f64) -> Self {
        Self {
            cost: cost.into(),
            runtime,
            status: StatusType::Success,
            additional_info: serde_json::Value::Null,
        }
    }

    pub fn with_status(mut self, status: StatusType) -> Self {
        self.status = status;
        self
    }
}
