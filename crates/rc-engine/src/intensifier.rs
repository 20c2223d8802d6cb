//! Racing intensifier.
//!
//! Each round the incumbent gains one new instance/seed pair, then
//! challengers from the queue race it one at a time. A challenger replays the
//! incumbent's pairs in the incumbent's order, in batches that start at
//! `min_config_calls` and double. After every batch the two configurations
//! are compared on the pairs both have run, and the challenger is rejected as
//! soon as it is provably worse. With a runtime objective each challenger
//! trial is capped at `slack` times what the incumbent needed on the same
//! pairs.
//!
//! The intensifier never executes anything itself: it hands out
//! [`TrialRequest`]s through [`Intensifier::next_action`] and reads the
//! results back from the [`RunHistory`] once the caller has recorded them.

use chrono::Utc;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rc_history::{RunHistory, Trajectory, TrajectoryEntry};
use rc_types::{
    config_error, internal_error, Configuration, InstanceSeedBudgetKey, RacerResult, StatusType,
    TrialRequest,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::time::Instant;
use tracing::{debug, info};

use crate::scenario::TrialContext;

/// Attempts at drawing an unused seed before giving up on a new pair.
const MAX_SEED_DRAWS: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RacingSettings {
    /// Challengers raced per round.
    pub min_challenger: usize,
    pub min_config_calls: usize,
    pub max_config_calls: usize,
    /// Must exceed 1.
    pub adaptive_capping_slack: f64,
    /// Keep racing challengers until this many seconds have passed in the
    /// round, in addition to `min_challenger`.
    pub intensify_time_bound: Option<f64>,
}

impl Default for RacingSettings {
    fn default() -> Self {
        Self {
            min_challenger: 1,
            min_config_calls: 1,
            max_config_calls: 2000,
            adaptive_capping_slack: 1.2,
            intensify_time_bound: None,
        }
    }
}

impl RacingSettings {
    pub fn with_min_challenger(mut self, n: usize) -> Self {
        self.min_challenger = n;
        self
    }

    pub fn with_config_calls(mut self, min: usize, max: usize) -> Self {
        self.min_config_calls = min;
        self.max_config_calls = max;
        self
    }

    pub fn with_slack(mut self, slack: f64) -> Self {
        self.adaptive_capping_slack = slack;
        self
    }

    pub fn validate(&self) -> RacerResult<()> {
        if !(self.adaptive_capping_slack > 1.0) {
            return Err(config_error!(
                "adaptive capping slack must exceed 1, got {}",
                self.adaptive_capping_slack
            ));
        }
        if self.min_challenger == 0 {
            return Err(config_error!("min_challenger must be at least 1"));
        }
        if self.min_config_calls == 0 || self.max_config_calls < self.min_config_calls {
            return Err(config_error!(
                "config calls must satisfy 1 <= min ({}) <= max ({})",
                self.min_config_calls,
                self.max_config_calls
            ));
        }
        Ok(())
    }
}

/// Cutoff for a challenger trial given the incumbent's cumulative runtime on
/// the pairs used so far.
pub fn adaptive_cap(incumbent_runtime: f64, slack: f64, limit: Option<f64>) -> f64 {
    let cap = slack * incumbent_runtime;
    limit.map_or(cap, |limit| limit.min(cap))
}

/// FIFO of challengers. Initial-design configurations are always consumed
/// before proposals.
#[derive(Debug, Clone, Default)]
pub struct ChallengerQueue {
    initial: VecDeque<Configuration>,
    proposed: VecDeque<Configuration>,
}

impl ChallengerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_initial(&mut self, configs: impl IntoIterator<Item = Configuration>) {
        self.initial.extend(configs);
    }

    /// Replace the proposals; initial-design entries are kept.
    pub fn replace_proposed(&mut self, configs: impl IntoIterator<Item = Configuration>) {
        self.proposed.clear();
        self.proposed.extend(configs);
    }

    pub fn pop_front(&mut self) -> Option<Configuration> {
        self.initial
            .pop_front()
            .or_else(|| self.proposed.pop_front())
    }

    pub fn has_initial(&self) -> bool {
        !self.initial.is_empty()
    }

    pub fn len(&self) -> usize {
        self.initial.len() + self.proposed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    RunFirstConfig,
    RunIncumbent,
    RunChallenger,
}

/// State of the current challenger-versus-incumbent race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaceState {
    Proposed,
    /// `evaluated` pairs were compared before the batch in flight.
    Running { evaluated: usize },
    Won,
    Lost,
    CappedLost,
    Continue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntensifierAction {
    /// Run these trials, record every result, then ask again.
    Dispatch(Vec<TrialRequest>),
    /// Results of the previous dispatch are still outstanding.
    Wait,
    RoundComplete,
}

#[derive(Debug, Clone)]
pub struct Intensifier {
    settings: RacingSettings,
    context: TrialContext,
    rng: ChaCha8Rng,
    stage: Stage,
    incumbent: Option<Configuration>,
    /// Current challenger; during `RunFirstConfig` the first configuration.
    challenger: Option<Configuration>,
    race: RaceState,
    batch_size: usize,
    in_flight: HashSet<(Configuration, InstanceSeedBudgetKey)>,
    races_in_round: usize,
    round_started: Option<Instant>,
    started: Instant,
    trajectory: Trajectory,
}

impl Intensifier {
    pub fn new(mut settings: RacingSettings, mut context: TrialContext, seed: u64) -> RacerResult<Self> {
        settings.validate()?;
        if context.deterministic && settings.min_challenger != 1 {
            info!(
                requested = settings.min_challenger,
                "deterministic target, racing one challenger per round"
            );
            settings.min_challenger = 1;
        }
        if context.instances.is_empty() {
            context.instances.push(None);
        }

        Ok(Self {
            batch_size: settings.min_config_calls,
            settings,
            context,
            rng: ChaCha8Rng::seed_from_u64(seed),
            stage: Stage::RunFirstConfig,
            incumbent: None,
            challenger: None,
            race: RaceState::Proposed,
            in_flight: HashSet::new(),
            races_in_round: 0,
            round_started: None,
            started: Instant::now(),
            trajectory: Trajectory::new(),
        })
    }

    pub fn settings(&self) -> &RacingSettings {
        &self.settings
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn race_state(&self) -> RaceState {
        self.race
    }

    pub fn incumbent(&self) -> Option<&Configuration> {
        self.incumbent.as_ref()
    }

    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Adopt an already-evaluated configuration as the incumbent.
    pub fn set_incumbent(&mut self, config: Configuration, history: &RunHistory) -> RacerResult<()> {
        self.promote(config, history)?;
        self.stage = Stage::RunIncumbent;
        Ok(())
    }

    /// Release a request whose result has been recorded, or which was
    /// abandoned without a result.
    pub fn on_result(&mut self, request: &TrialRequest) {
        self.in_flight.remove(&(request.config.clone(), request.key()));
    }

    pub fn next_action(
        &mut self,
        queue: &mut ChallengerQueue,
        history: &RunHistory,
    ) -> RacerResult<IntensifierAction> {
        if self.round_started.is_none() {
            self.round_started = Some(Instant::now());
        }

        loop {
            if !self.in_flight.is_empty() {
                return Ok(IntensifierAction::Wait);
            }

            match self.stage {
                Stage::RunFirstConfig => {
                    if let Some(first) = self.challenger.take() {
                        self.promote(first, history)?;
                        self.races_in_round += 1;
                        self.stage = Stage::RunChallenger;
                        continue;
                    }
                    let Some(first) = queue.pop_front() else {
                        return Ok(self.finish_round());
                    };
                    let Some(key) = self.next_pair(&first, history) else {
                        return Err(internal_error!("no instance available for {first}"));
                    };
                    let request =
                        TrialRequest::new(first.clone(), &key, self.context.algorithm_walltime_limit);
                    self.challenger = Some(first);
                    let requests = self.dispatch(vec![request], history);
                    if !requests.is_empty() {
                        return Ok(IntensifierAction::Dispatch(requests));
                    }
                }
                Stage::RunIncumbent => {
                    self.stage = Stage::RunChallenger;
                    let Some(incumbent) = self.incumbent.clone() else {
                        self.stage = Stage::RunFirstConfig;
                        continue;
                    };
                    if history.num_trials(&incumbent) >= self.settings.max_config_calls {
                        continue;
                    }
                    if let Some(key) = self.next_pair(&incumbent, history) {
                        debug!(pair = %key, "extending incumbent evaluation");
                        let request =
                            TrialRequest::new(incumbent, &key, self.context.algorithm_walltime_limit);
                        let requests = self.dispatch(vec![request], history);
                        if !requests.is_empty() {
                            return Ok(IntensifierAction::Dispatch(requests));
                        }
                    }
                }
                Stage::RunChallenger => {
                    if self.challenger.is_none() {
                        if self.round_finished() {
                            return Ok(self.finish_round());
                        }
                        let Some(next) = self.next_challenger(queue) else {
                            return Ok(self.finish_round());
                        };
                        debug!(challenger = %next, "starting race");
                        self.challenger = Some(next);
                        self.race = RaceState::Proposed;
                        self.batch_size = self.settings.min_config_calls;
                    }
                    if let Some(requests) = self.advance_race(history)? {
                        return Ok(IntensifierAction::Dispatch(requests));
                    }
                }
            }
        }
    }

    /// Number of challengers one round consumes at least.
    pub fn challengers_wanted(&self) -> usize {
        self.settings.min_challenger
    }

    /// Cutoff for a challenger trial once it has used `used` pairs,
    /// including the one being dispatched.
    pub fn cutoff_for(
        &self,
        incumbent: &Configuration,
        used: &[InstanceSeedBudgetKey],
        history: &RunHistory,
    ) -> Option<f64> {
        if !self.context.objective.is_runtime() {
            return self.context.algorithm_walltime_limit;
        }
        Some(adaptive_cap(
            history.sum_runtime(incumbent, used),
            self.settings.adaptive_capping_slack,
            self.context.algorithm_walltime_limit,
        ))
    }

    fn round_finished(&self) -> bool {
        if self.races_in_round < self.settings.min_challenger {
            return false;
        }
        match (self.settings.intensify_time_bound, self.round_started) {
            (Some(bound), Some(started)) => started.elapsed().as_secs_f64() >= bound,
            _ => true,
        }
    }

    fn finish_round(&mut self) -> IntensifierAction {
        debug!(races = self.races_in_round, "intensification round complete");
        self.stage = if self.incumbent.is_some() {
            Stage::RunIncumbent
        } else {
            Stage::RunFirstConfig
        };
        self.races_in_round = 0;
        self.round_started = None;
        IntensifierAction::RoundComplete
    }

    fn next_challenger(&mut self, queue: &mut ChallengerQueue) -> Option<Configuration> {
        while let Some(config) = queue.pop_front() {
            if self.incumbent.as_ref() != Some(&config) {
                return Some(config);
            }
        }
        None
    }

    /// A pair `config` has not run yet: the least-used instance, with seed 0
    /// for deterministic targets and a fresh seed otherwise.
    fn next_pair(
        &mut self,
        config: &Configuration,
        history: &RunHistory,
    ) -> Option<InstanceSeedBudgetKey> {
        let runs = history.runs_for(config);
        let uses = |instance: &Option<String>| runs.iter().filter(|k| &k.instance == instance).count();

        if self.context.deterministic {
            return self
                .context
                .instances
                .iter()
                .find(|instance| uses(*instance) == 0)
                .map(|instance| InstanceSeedBudgetKey::new(instance.clone(), 0, None));
        }

        let instance = self
            .context
            .instances
            .iter()
            .min_by_key(|instance| uses(*instance))?
            .clone();
        for _ in 0..MAX_SEED_DRAWS {
            let seed = u64::from(self.rng.random::<u32>());
            let key = InstanceSeedBudgetKey::new(instance.clone(), seed, None);
            if !runs.contains(&key) {
                return Some(key);
            }
        }
        None
    }

    /// Decide the race if possible, otherwise return the next batch.
    fn advance_race(&mut self, history: &RunHistory) -> RacerResult<Option<Vec<TrialRequest>>> {
        let (Some(challenger), Some(incumbent)) = (self.challenger.clone(), self.incumbent.clone())
        else {
            return Err(internal_error!("race started without challenger and incumbent"));
        };

        let (common, missing): (Vec<_>, Vec<_>) = history
            .runs_for(&incumbent)
            .into_iter()
            .partition(|key| history.contains(&challenger, key));

        let state = if common.is_empty() && missing.is_empty() {
            RaceState::Lost
        } else if common.is_empty() {
            RaceState::Continue
        } else {
            self.judge(&challenger, &incumbent, &common, &missing, history)
        };
        if state != RaceState::Continue {
            self.conclude(state, challenger, history)?;
            return Ok(None);
        }

        let remaining_calls = self
            .settings
            .max_config_calls
            .saturating_sub(history.num_trials(&challenger))
            .max(1);
        let n = self.batch_size.min(missing.len()).min(remaining_calls);

        let mut used = common.clone();
        let mut requests = Vec::with_capacity(n);
        for key in &missing[..n] {
            used.push(key.clone());
            let cutoff = self.cutoff_for(&incumbent, &used, history);
            requests.push(TrialRequest::new(challenger.clone(), key, cutoff));
        }

        self.race = RaceState::Running {
            evaluated: common.len(),
        };
        self.batch_size = (self.batch_size * 2).min(self.settings.max_config_calls);

        let requests = self.dispatch(requests, history);
        if requests.is_empty() {
            return Err(internal_error!("race for {challenger} produced no new trials"));
        }
        Ok(Some(requests))
    }

    /// Compare challenger and incumbent on the pairs both have run.
    fn judge(
        &self,
        challenger: &Configuration,
        incumbent: &Configuration,
        common: &[InstanceSeedBudgetKey],
        missing: &[InstanceSeedBudgetKey],
        history: &RunHistory,
    ) -> RaceState {
        // An incumbent with fewer runs than `min_config_calls` caps the
        // requirement at its own run count.
        let required = self
            .settings
            .min_config_calls
            .min(common.len() + missing.len());
        let enough = common.len() >= required;
        let exhausted =
            missing.is_empty() || history.num_trials(challenger) >= self.settings.max_config_calls;
        let capped = common.iter().any(|key| {
            history
                .get_for(challenger, key)
                .is_some_and(|v| v.status == StatusType::Capped)
        });

        // Insufficient data on either side leaves the comparison undecided.
        let incumbent_cost = history.cost_of(incumbent, common).ok();
        let challenger_cost = history.cost_of(challenger, common).ok();
        let challenger_bound = history.lower_bound_of(challenger, common).ok();

        if capped {
            return RaceState::CappedLost;
        }
        match (challenger_cost, challenger_bound, incumbent_cost) {
            (_, Some(bound), Some(inc)) if bound > inc && enough => RaceState::Lost,
            (Some(cost), _, Some(inc)) if cost <= inc && enough && exhausted => RaceState::Won,
            _ if exhausted => RaceState::Lost,
            _ => RaceState::Continue,
        }
    }

    fn conclude(
        &mut self,
        state: RaceState,
        challenger: Configuration,
        history: &RunHistory,
    ) -> RacerResult<()> {
        match state {
            RaceState::Won => {
                info!(
                    challenger = %challenger,
                    trials = history.num_trials(&challenger),
                    "challenger replaces the incumbent"
                );
                self.promote(challenger, history)?;
            }
            _ => debug!(challenger = %challenger, outcome = ?state, "challenger rejected"),
        }
        self.race = state;
        self.challenger = None;
        self.races_in_round += 1;
        self.batch_size = self.settings.min_config_calls;
        Ok(())
    }

    fn promote(&mut self, config: Configuration, history: &RunHistory) -> RacerResult<()> {
        let config_id = history
            .config_id(&config)
            .ok_or_else(|| internal_error!("incumbent {config} has no recorded runs"))?;
        let evaluated = history.runs_for(&config);
        let cost = history
            .cost_of(&config, &evaluated)
            .or_else(|_| history.lower_bound_of(&config, &evaluated))?;

        self.trajectory.push(TrajectoryEntry {
            wallclock_time: self.started.elapsed().as_secs_f64(),
            trials_finished: history.len(),
            config_id,
            config: config.clone(),
            cost,
            evaluated,
            timestamp: Utc::now(),
        });
        info!(config_id, cost, "new incumbent");
        self.incumbent = Some(config);
        Ok(())
    }

    /// Register requests as in flight, dropping ones already running or
    /// recorded.
    fn dispatch(&mut self, requests: Vec<TrialRequest>, history: &RunHistory) -> Vec<TrialRequest> {
        let mut accepted = Vec::with_capacity(requests.len());
        for request in requests {
            let key = request.key();
            if history.contains(&request.config, &key) {
                debug!(pair = %key, "skipping trial already in the history");
                continue;
            }
            if !self.in_flight.insert((request.config.clone(), key)) {
                debug!(request = %request.id, "skipping duplicate in-flight trial");
                continue;
            }
            accepted.push(request);
        }
        accepted
    }
}
