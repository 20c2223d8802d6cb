//! Target-procedure execution and conversion of raw outcomes into run values.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rc_types::{Cost, RunObjective, RunValue, StatusType, TrialOutcome, TrialRequest};
use std::sync::Arc;

/// Errors surfaced by a target executor. Every variant becomes a run status;
/// none aborts the optimization.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("target failed: {message}")]
    TargetFailed { message: String },
    #[error("target ran out of memory: {message}")]
    OutOfMemory { message: String },
    #[error("executor task failed: {message}")]
    Task { message: String },
}

/// Result alias for executor operations.
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Runs one trial of the target procedure.
///
/// Implementations may run the target in-process, in a subprocess, or
/// remotely. The request's cutoff is a contractual upper bound: runs that
/// exceed it are reported as CAPPED or TIMEOUT by [`OutcomeConverter`].
#[async_trait]
pub trait TargetExecutor: Send + Sync {
    async fn execute(&self, request: &TrialRequest) -> ExecutorResult<TrialOutcome>;
}

type TargetFn = dyn Fn(&TrialRequest) -> ExecutorResult<TrialOutcome> + Send + Sync;

/// Executes a synchronous function on the blocking thread pool.
#[derive(Clone)]
pub struct FunctionExecutor {
    target: Arc<TargetFn>,
}

impl FunctionExecutor {
    pub fn new<F>(target: F) -> Self
    where
        F: Fn(&TrialRequest) -> ExecutorResult<TrialOutcome> + Send + Sync + 'static,
    {
        Self {
            target: Arc::new(target),
        }
    }
}

impl std::fmt::Debug for FunctionExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionExecutor").finish_non_exhaustive()
    }
}

#[async_trait]
impl TargetExecutor for FunctionExecutor {
    async fn execute(&self, request: &TrialRequest) -> ExecutorResult<TrialOutcome> {
        let target = Arc::clone(&self.target);
        let request = request.clone();
        tokio::task::spawn_blocking(move || target(&request))
            .await
            .map_err(|e| ExecutorError::Task {
                message: e.to_string(),
            })?
    }
}

/// Turns executor results into the run values stored in the history.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeConverter {
    pub objective: RunObjective,
    pub crash_cost: f64,
    pub algorithm_walltime_limit: Option<f64>,
}

impl OutcomeConverter {
    /// Status rules, in order:
    /// - executor errors become CRASHED (MEMOUT for out-of-memory) at the
    ///   crash cost;
    /// - a runtime above the request cutoff, or a reported TIMEOUT/CAPPED,
    ///   becomes CAPPED when the cutoff is tighter than the global limit and
    ///   TIMEOUT otherwise;
    /// - anything else keeps the reported status.
    pub fn convert(
        &self,
        request: &TrialRequest,
        result: ExecutorResult<TrialOutcome>,
        starttime: DateTime<Utc>,
        endtime: DateTime<Utc>,
    ) -> RunValue {
        let elapsed = (endtime - starttime).num_milliseconds() as f64 / 1000.0;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(error) => {
                let status = match error {
                    ExecutorError::OutOfMemory { .. } => StatusType::Memout,
                    _ => StatusType::Crashed,
                };
                return RunValue::new(self.crash_cost, elapsed, status)
                    .with_times(starttime, endtime)
                    .with_info(serde_json::json!({ "error": error.to_string() }));
            }
        };

        let over_cutoff = request.cutoff.is_some_and(|cutoff| outcome.runtime > cutoff)
            || matches!(outcome.status, StatusType::Timeout | StatusType::Capped);

        let value = match (over_cutoff, request.cutoff) {
            (true, Some(cutoff)) if self.is_adaptive(cutoff) => {
                // Right-censored: the cap is a lower bound on the true cost.
                let cost = match self.objective {
                    RunObjective::Runtime { .. } => Cost::Single(cutoff),
                    RunObjective::Quality => outcome.cost,
                };
                RunValue::new(cost, cutoff, StatusType::Capped)
            }
            (true, cutoff) => {
                let runtime = cutoff.unwrap_or(outcome.runtime);
                let cost = match self.objective {
                    RunObjective::Runtime { par_factor } => par_factor * runtime,
                    RunObjective::Quality => self.crash_cost,
                };
                RunValue::new(cost, runtime, StatusType::Timeout)
            }
            (false, _) if outcome.status.is_crash() => {
                RunValue::new(self.crash_cost, outcome.runtime, outcome.status)
            }
            (false, _) => {
                let cost = match self.objective {
                    RunObjective::Runtime { .. } => Cost::Single(outcome.runtime),
                    RunObjective::Quality => outcome.cost,
                };
                RunValue::new(cost, outcome.runtime, outcome.status)
            }
        };

        value
            .with_times(starttime, endtime)
            .with_info(outcome.additional_info)
    }

    /// A cutoff tighter than the global limit was set by adaptive capping.
    fn is_adaptive(&self, cutoff: f64) -> bool {
        self.algorithm_walltime_limit
            .map_or(true, |limit| cutoff < limit)
    }
}
