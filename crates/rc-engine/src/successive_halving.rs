//! Successive halving and Hyperband intensification.
//!
//! A bracket starts `n` configurations at a small budget, keeps the best
//! `1/eta` of them, and re-runs the survivors at `eta` times the budget until
//! `max_budget` is reached. Hyperband cycles brackets from the most
//! aggressive (`s = s_max`) to plain evaluation at the full budget (`s = 0`).

use chrono::Utc;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rc_history::{RunHistory, Trajectory, TrajectoryEntry};
use rc_types::{
    config_error, internal_error, Configuration, InstanceSeedBudgetKey, RacerResult, TrialRequest,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, info};

use crate::intensifier::{ChallengerQueue, IntensifierAction};
use crate::scenario::TrialContext;

/// Tolerance when taking `floor(log_eta(max / min))`.
const LOG_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BracketSchedule {
    /// Every bracket uses `s = s_max`.
    Fixed,
    /// Brackets cycle `s_max, s_max - 1, ..., 0`.
    Hyperband,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HalvingSettings {
    pub eta: f64,
    pub schedule: BracketSchedule,
}

impl Default for HalvingSettings {
    fn default() -> Self {
        Self {
            eta: 3.0,
            schedule: BracketSchedule::Fixed,
        }
    }
}

impl HalvingSettings {
    pub fn hyperband(eta: f64) -> Self {
        Self {
            eta,
            schedule: BracketSchedule::Hyperband,
        }
    }

    pub fn successive_halving(eta: f64) -> Self {
        Self {
            eta,
            schedule: BracketSchedule::Fixed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SuccessiveHalving {
    settings: HalvingSettings,
    context: TrialContext,
    max_budget: f64,
    s_max: usize,
    /// Current bracket index `s`.
    bracket: usize,
    stage: usize,
    /// Configurations of the current stage.
    configs: Vec<Configuration>,
    /// Keys of the dispatched stage; empty while no stage is pending.
    stage_keys: Vec<InstanceSeedBudgetKey>,
    in_flight: HashSet<(Configuration, InstanceSeedBudgetKey)>,
    incumbent: Option<Configuration>,
    incumbent_cost: f64,
    brackets_completed: usize,
    rng: ChaCha8Rng,
    started: Instant,
    trajectory: Trajectory,
}

impl SuccessiveHalving {
    pub fn new(
        settings: HalvingSettings,
        mut context: TrialContext,
        min_budget: f64,
        max_budget: f64,
        seed: u64,
    ) -> RacerResult<Self> {
        if !(settings.eta > 1.0) {
            return Err(config_error!("eta must exceed 1, got {}", settings.eta));
        }
        if !(min_budget > 0.0 && min_budget <= max_budget) {
            return Err(config_error!(
                "budgets must satisfy 0 < min_budget <= max_budget, got {min_budget} and {max_budget}"
            ));
        }
        let s_max =
            ((max_budget / min_budget).ln() / settings.eta.ln() + LOG_EPSILON).floor() as usize;
        debug!(s_max, eta = settings.eta, "successive halving brackets");
        if context.instances.is_empty() {
            context.instances.push(None);
        }

        Ok(Self {
            settings,
            context,
            max_budget,
            s_max,
            bracket: s_max,
            stage: 0,
            configs: Vec::new(),
            stage_keys: Vec::new(),
            in_flight: HashSet::new(),
            incumbent: None,
            incumbent_cost: f64::INFINITY,
            brackets_completed: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
            started: Instant::now(),
            trajectory: Trajectory::new(),
        })
    }

    pub fn s_max(&self) -> usize {
        self.s_max
    }

    pub fn bracket(&self) -> usize {
        self.bracket
    }

    pub fn stage(&self) -> usize {
        self.stage
    }

    pub fn brackets_completed(&self) -> usize {
        self.brackets_completed
    }

    pub fn incumbent(&self) -> Option<&Configuration> {
        self.incumbent.as_ref()
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    /// Configurations the first stage of bracket `s` starts with.
    pub fn bracket_size(&self, s: usize) -> usize {
        let eta_s = self.settings.eta.powi(s as i32);
        let n = match self.settings.schedule {
            BracketSchedule::Fixed => eta_s,
            BracketSchedule::Hyperband => (self.s_max + 1) as f64 / (s + 1) as f64 * eta_s,
        };
        n.ceil() as usize
    }

    /// Budget of stage `i` in bracket `s`: `max_budget * eta^(i - s)`.
    pub fn stage_budget(&self, s: usize, i: usize) -> f64 {
        self.max_budget / self.settings.eta.powi(s.saturating_sub(i) as i32)
    }

    /// `(configurations, budget)` per stage of bracket `s`, assuming the
    /// bracket is filled.
    pub fn bracket_plan(&self, s: usize) -> Vec<(usize, f64)> {
        let mut n = self.bracket_size(s);
        let mut plan = Vec::with_capacity(s + 1);
        for i in 0..=s {
            plan.push((n, self.stage_budget(s, i)));
            n = self.survivors(n);
        }
        plan
    }

    pub fn challengers_wanted(&self) -> usize {
        self.bracket_size(self.bracket)
    }

    pub fn on_result(&mut self, request: &TrialRequest) {
        self.in_flight.remove(&(request.config.clone(), request.key()));
    }

    pub fn next_action(
        &mut self,
        queue: &mut ChallengerQueue,
        history: &RunHistory,
    ) -> RacerResult<IntensifierAction> {
        loop {
            if !self.in_flight.is_empty() {
                return Ok(IntensifierAction::Wait);
            }

            if !self.stage_keys.is_empty() {
                self.finish_stage(history)?;
                if self.configs.is_empty() {
                    return Ok(IntensifierAction::RoundComplete);
                }
            }

            if self.configs.is_empty() {
                let n = self.bracket_size(self.bracket);
                while self.configs.len() < n {
                    let Some(config) = queue.pop_front() else {
                        break;
                    };
                    if !self.configs.contains(&config) {
                        self.configs.push(config);
                    }
                }
                if self.configs.is_empty() {
                    return Ok(IntensifierAction::RoundComplete);
                }
                debug!(
                    bracket = self.bracket,
                    configs = self.configs.len(),
                    wanted = n,
                    "starting bracket"
                );
                self.stage = 0;
            }

            let requests = self.dispatch_stage(history);
            if !requests.is_empty() {
                return Ok(IntensifierAction::Dispatch(requests));
            }
        }
    }

    fn survivors(&self, n: usize) -> usize {
        ((n as f64 / self.settings.eta).floor() as usize).max(1)
    }

    /// Every configuration on every instance at the current stage's budget.
    fn dispatch_stage(&mut self, history: &RunHistory) -> Vec<TrialRequest> {
        let budget = self.stage_budget(self.bracket, self.stage);
        let seed = if self.context.deterministic {
            0
        } else {
            u64::from(self.rng.random::<u32>())
        };
        self.stage_keys = self
            .context
            .instances
            .iter()
            .map(|instance| InstanceSeedBudgetKey::new(instance.clone(), seed, Some(budget)))
            .collect();

        let mut requests = Vec::new();
        for config in &self.configs {
            for key in &self.stage_keys {
                if history.contains(config, key) {
                    continue;
                }
                if self.in_flight.insert((config.clone(), key.clone())) {
                    requests.push(TrialRequest::new(
                        config.clone(),
                        key,
                        self.context.algorithm_walltime_limit,
                    ));
                }
            }
        }
        debug!(
            bracket = self.bracket,
            stage = self.stage,
            budget,
            trials = requests.len(),
            "dispatching stage"
        );
        requests
    }

    fn finish_stage(&mut self, history: &RunHistory) -> RacerResult<()> {
        let budget = self.stage_budget(self.bracket, self.stage);
        let keys = std::mem::take(&mut self.stage_keys);

        let mut ranked: Vec<(f64, Configuration)> = self
            .configs
            .drain(..)
            .map(|config| {
                let cost = history.cost_of(&config, &keys).unwrap_or(f64::INFINITY);
                (cost, config)
            })
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));

        if let Some((cost, best)) = ranked.first() {
            let incumbent_budget = self
                .incumbent
                .as_ref()
                .and_then(|incumbent| history.highest_budget(incumbent))
                .map_or(f64::NEG_INFINITY, |b| b.into_inner());
            let better = budget > incumbent_budget
                || (budget == incumbent_budget && *cost < self.incumbent_cost);
            if cost.is_finite() && better {
                self.promote(best.clone(), *cost, budget, keys, history)?;
            }
        }

        if self.stage >= self.bracket {
            self.brackets_completed += 1;
            info!(
                bracket = self.bracket,
                completed = self.brackets_completed,
                "bracket complete"
            );
            if self.settings.schedule == BracketSchedule::Hyperband {
                self.bracket = self.bracket.checked_sub(1).unwrap_or(self.s_max);
            }
            self.stage = 0;
            return Ok(());
        }

        let keep = self.survivors(ranked.len());
        self.configs = ranked.into_iter().take(keep).map(|(_, c)| c).collect();
        self.stage += 1;
        Ok(())
    }

    fn promote(
        &mut self,
        config: Configuration,
        cost: f64,
        budget: f64,
        evaluated: Vec<InstanceSeedBudgetKey>,
        history: &RunHistory,
    ) -> RacerResult<()> {
        let config_id = history
            .config_id(&config)
            .ok_or_else(|| internal_error!("incumbent {config} has no recorded runs"))?;
        self.trajectory.push(TrajectoryEntry {
            wallclock_time: self.started.elapsed().as_secs_f64(),
            trials_finished: history.len(),
            config_id,
            config: config.clone(),
            cost,
            evaluated,
            timestamp: Utc::now(),
        });
        info!(config_id, cost, budget, "new incumbent");
        self.incumbent = Some(config);
        self.incumbent_cost = cost;
        Ok(())
    }
}
