//! Sequential model-based optimization loop tying the initial design,
//! surrogate model, acquisition optimizer, random chooser, and intensifier
//! together.

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use rand_chacha::ChaCha8Rng;
use rc_history::{RunHistory, RunHistoryStore, Trajectory};
use rc_model::{AcquisitionFunction, AcquisitionMaximizer, SurrogateModel};
use rc_types::{
    internal_error, ConfigId, Configuration, RacerError, RacerResult, RunValue, StatusType,
    TrialRequest,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::executor::{ExecutorError, OutcomeConverter, TargetExecutor};
use crate::intensification::IntensifierKind;
use crate::intensifier::{ChallengerQueue, IntensifierAction};
use crate::random_chooser::RandomConfigurationChooser;
use crate::scenario::Scenario;

/// Proposals requested from the acquisition optimizer per iteration, at least.
const MIN_PROPOSALS: usize = 10;
/// Consecutive rounds without a new trial before the loop gives up.
const MAX_IDLE_ROUNDS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SmboState {
    Init,
    Fit,
    Propose,
    Intensify,
    CheckBudget,
    Terminated,
}

/// Events emitted by the loop for external consumption (progress output,
/// dashboards).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SmboEvent {
    Started {
        n_initial: usize,
    },
    TrialFinished {
        key: String,
        status: StatusType,
        cost: f64,
    },
    IncumbentChanged {
        config_id: ConfigId,
        cost: f64,
        trials_finished: usize,
    },
    Terminated {
        reason: String,
        trials_finished: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmboStats {
    pub trials_finished: usize,
    pub crashed: usize,
    pub capped: usize,
    pub timeouts: usize,
    pub incumbent_changes: usize,
    pub iterations: usize,
    pub model_fits: usize,
    pub started_at: DateTime<Utc>,
    pub wallclock_seconds: f64,
}

impl SmboStats {
    fn new() -> Self {
        Self {
            trials_finished: 0,
            crashed: 0,
            capped: 0,
            timeouts: 0,
            incumbent_changes: 0,
            iterations: 0,
            model_fits: 0,
            started_at: Utc::now(),
            wallclock_seconds: 0.0,
        }
    }
}

/// Everything the loop produced.
#[derive(Debug, Clone)]
pub struct SmboOutcome {
    pub incumbent: Option<Configuration>,
    /// Aggregate cost of the incumbent when it was last promoted.
    pub incumbent_cost: Option<f64>,
    pub trajectory: Trajectory,
    pub stats: SmboStats,
    pub history: RunHistory,
    pub termination_reason: String,
    /// Every event emitted during the run, in order.
    pub events: Vec<SmboEvent>,
}

/// Assembled components, produced by [`crate::builder::SmboBuilder`].
pub(crate) struct SmboComponents {
    pub scenario: Scenario,
    pub executor: Arc<dyn TargetExecutor>,
    pub history: RunHistory,
    pub initial_design: Vec<Configuration>,
    pub model: Option<SurrogateModel>,
    pub acquisition: AcquisitionFunction,
    pub maximizer: AcquisitionMaximizer,
    pub maximizer_rng: ChaCha8Rng,
    pub chooser: RandomConfigurationChooser,
    pub intensifier: IntensifierKind,
    pub event_sender: Option<Sender<SmboEvent>>,
}

pub struct Smbo {
    scenario: Scenario,
    executor: Arc<dyn TargetExecutor>,
    converter: OutcomeConverter,
    history: RunHistory,
    queue: ChallengerQueue,
    initial_design: Vec<Configuration>,
    model: Option<SurrogateModel>,
    acquisition: AcquisitionFunction,
    maximizer: AcquisitionMaximizer,
    maximizer_rng: ChaCha8Rng,
    chooser: RandomConfigurationChooser,
    intensifier: IntensifierKind,
    state: SmboState,
    stats: SmboStats,
    events: Vec<SmboEvent>,
    event_sender: Option<Sender<SmboEvent>>,
    started: Instant,
    idle_rounds: usize,
    termination_reason: Option<String>,
}

impl Smbo {
    pub(crate) fn new(components: SmboComponents) -> Self {
        let converter = OutcomeConverter {
            objective: components.scenario.objective,
            crash_cost: components.scenario.crash_cost,
            algorithm_walltime_limit: components.scenario.algorithm_walltime_limit,
        };

        Self {
            scenario: components.scenario,
            executor: components.executor,
            converter,
            history: components.history,
            queue: ChallengerQueue::new(),
            initial_design: components.initial_design,
            model: components.model,
            acquisition: components.acquisition,
            maximizer: components.maximizer,
            maximizer_rng: components.maximizer_rng,
            chooser: components.chooser,
            intensifier: components.intensifier,
            state: SmboState::Init,
            stats: SmboStats::new(),
            events: Vec::new(),
            event_sender: components.event_sender,
            started: Instant::now(),
            idle_rounds: 0,
            termination_reason: None,
        }
    }

    /// Run until a budget is exhausted.
    pub async fn run(mut self) -> RacerResult<SmboOutcome> {
        self.started = Instant::now();
        self.stats.started_at = Utc::now();

        loop {
            self.state = match self.state {
                SmboState::Init => self.init(),
                SmboState::Fit => self.fit()?,
                SmboState::Propose => self.propose()?,
                SmboState::Intensify => self.intensify().await?,
                SmboState::CheckBudget => self.check_budget()?,
                SmboState::Terminated => break,
            };
        }

        let trajectory = self.intensifier.trajectory().clone();
        Ok(SmboOutcome {
            incumbent: self.intensifier.incumbent().cloned(),
            incumbent_cost: trajectory.last().map(|entry| entry.cost),
            trajectory,
            stats: self.stats,
            history: self.history,
            termination_reason: self.termination_reason.unwrap_or_default(),
            events: self.events,
        })
    }

    // -- accessors ----------------------------------------------------------

    pub fn state(&self) -> SmboState {
        self.state
    }

    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    pub fn stats(&self) -> &SmboStats {
        &self.stats
    }

    pub fn incumbent(&self) -> Option<&Configuration> {
        self.intensifier.incumbent()
    }

    pub fn initial_design(&self) -> &[Configuration] {
        &self.initial_design
    }

    // -- states -------------------------------------------------------------

    fn init(&mut self) -> SmboState {
        self.queue.push_initial(self.initial_design.iter().cloned());
        self.emit(SmboEvent::Started {
            n_initial: self.initial_design.len(),
        });
        info!(
            scenario = %self.scenario.name,
            n_initial = self.initial_design.len(),
            n_trials = self.scenario.n_trials,
            intensifier = self.intensifier.name(),
            model = self.model.as_ref().map_or("none", SurrogateModel::name),
            "optimization started"
        );
        SmboState::Fit
    }

    fn fit(&mut self) -> RacerResult<SmboState> {
        let data = self
            .history
            .training_data(&self.scenario.configspace, None)?;
        if data.is_empty() {
            debug!("no uncensored trials yet, skipping model fit");
            return Ok(SmboState::Propose);
        }

        if let Some(model) = self.model.as_mut() {
            match model.fit(&data) {
                Ok(()) => self.stats.model_fits += 1,
                Err(e) => warn!(
                    error = %e,
                    points = data.len(),
                    "surrogate fit failed, proposing from random search"
                ),
            }
        }

        let best = self
            .intensifier
            .incumbent()
            .and_then(|incumbent| self.history.average_cost(incumbent))
            .or_else(|| data.best_cost());
        if let Some(eta) = best {
            self.acquisition.update(eta);
        }
        Ok(SmboState::Propose)
    }

    fn propose(&mut self) -> RacerResult<SmboState> {
        if self.queue.has_initial() {
            return Ok(SmboState::Intensify);
        }

        let wanted = self.intensifier.challengers_wanted().max(MIN_PROPOSALS);
        let model = self.model.as_ref().filter(|model| model.is_fitted());
        let scored = self.maximizer.maximize(
            model,
            &self.acquisition,
            &self.history,
            &self.scenario.configspace,
            wanted,
            &mut self.maximizer_rng,
        )?;

        let space = &self.scenario.configspace;
        let mut seen = HashSet::new();
        let mut proposals = Vec::with_capacity(scored.len());
        for (index, (_, candidate)) in scored.into_iter().enumerate() {
            let config = if self.chooser.check(index) {
                match self.chooser.sample(space) {
                    Some(random) => random.with_origin("Random search"),
                    None => candidate,
                }
            } else {
                candidate
            };
            if let Err(e) = space.validate(&config) {
                warn!(config = %config, error = %e, "skipping invalid proposal");
                continue;
            }
            if self.history.config_id(&config).is_some() || !seen.insert(config.clone()) {
                continue;
            }
            proposals.push(config);
        }

        debug!(proposals = proposals.len(), "challengers proposed");
        self.queue.replace_proposed(proposals);
        self.chooser.next_smbo_iteration();
        self.stats.iterations += 1;
        Ok(SmboState::Intensify)
    }

    async fn intensify(&mut self) -> RacerResult<SmboState> {
        let trials_before = self.stats.trials_finished;

        loop {
            let promotions = self.intensifier.trajectory().len();
            let action = self.intensifier.next_action(&mut self.queue, &self.history)?;
            if self.intensifier.trajectory().len() > promotions {
                self.on_incumbent_changed();
            }

            match action {
                IntensifierAction::Dispatch(mut requests) => {
                    let remaining = self
                        .scenario
                        .n_trials
                        .saturating_sub(self.stats.trials_finished);
                    if requests.len() > remaining {
                        for request in requests.drain(remaining..) {
                            self.intensifier.on_result(&request);
                        }
                    }
                    if requests.is_empty() {
                        break;
                    }
                    self.execute_batch(requests).await?;
                    if self.exhausted_reason().is_some() {
                        self.settle()?;
                        break;
                    }
                }
                IntensifierAction::Wait => {
                    return Err(internal_error!(
                        "intensifier is waiting on results that were never dispatched"
                    ));
                }
                IntensifierAction::RoundComplete => break,
            }
        }

        if self.stats.trials_finished == trials_before {
            self.idle_rounds += 1;
        } else {
            self.idle_rounds = 0;
        }
        Ok(SmboState::CheckBudget)
    }

    fn check_budget(&mut self) -> RacerResult<SmboState> {
        let Some(reason) = self.exhausted_reason() else {
            return Ok(SmboState::Fit);
        };
        self.terminate(reason)?;
        Ok(SmboState::Terminated)
    }

    // -- helpers ------------------------------------------------------------

    /// Run every request concurrently and record the results in request
    /// order.
    async fn execute_batch(&mut self, requests: Vec<TrialRequest>) -> RacerResult<()> {
        debug!(trials = requests.len(), "dispatching batch");
        let mut tasks = JoinSet::new();
        for (index, request) in requests.iter().cloned().enumerate() {
            let executor = Arc::clone(&self.executor);
            tasks.spawn(async move {
                let starttime = Utc::now();
                let result = executor.execute(&request).await;
                (index, result, starttime, Utc::now())
            });
        }

        let mut results: Vec<Option<_>> = (0..requests.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result, starttime, endtime)) => {
                    results[index] = Some((result, starttime, endtime));
                }
                Err(e) => warn!(error = %e, "trial task failed"),
            }
        }

        for (request, slot) in requests.iter().zip(results) {
            let (result, starttime, endtime) = slot.unwrap_or_else(|| {
                let now = Utc::now();
                let error = ExecutorError::Task {
                    message: "trial task did not complete".to_string(),
                };
                (Err(error), now, now)
            });
            let value = self.converter.convert(request, result, starttime, endtime);
            self.record(request, value)?;
        }
        Ok(())
    }

    fn record(&mut self, request: &TrialRequest, value: RunValue) -> RacerResult<()> {
        let status = value.status;
        let cost = value.cost.scalar();
        let failure = value.failure();
        match self
            .history
            .record(&request.config, request.key(), value, false)
        {
            Ok(key) => {
                self.stats.trials_finished += 1;
                match status {
                    StatusType::Crashed | StatusType::Memout => self.stats.crashed += 1,
                    StatusType::Capped => self.stats.capped += 1,
                    StatusType::Timeout => self.stats.timeouts += 1,
                    _ => {}
                }
                match failure {
                    Some(error) => debug!(key = %key, error = %error, cost, "trial failed"),
                    None => debug!(key = %key, status = %status, cost, "trial finished"),
                }
                self.emit(SmboEvent::TrialFinished {
                    key: key.to_string(),
                    status,
                    cost,
                });
            }
            Err(RacerError::DuplicateRun { key }) => {
                warn!(key = %key, "duplicate trial result ignored");
            }
            Err(e) => return Err(e),
        }
        self.intensifier.on_result(request);
        Ok(())
    }

    /// Let the intensifier judge the last recorded batch without starting
    /// new trials.
    fn settle(&mut self) -> RacerResult<()> {
        let promotions = self.intensifier.trajectory().len();
        if let IntensifierAction::Dispatch(requests) =
            self.intensifier.next_action(&mut self.queue, &self.history)?
        {
            for request in &requests {
                self.intensifier.on_result(request);
            }
        }
        if self.intensifier.trajectory().len() > promotions {
            self.on_incumbent_changed();
        }
        Ok(())
    }

    fn on_incumbent_changed(&mut self) {
        let Some(entry) = self.intensifier.trajectory().last() else {
            return;
        };
        let event = SmboEvent::IncumbentChanged {
            config_id: entry.config_id,
            cost: entry.cost,
            trials_finished: self.stats.trials_finished,
        };
        self.stats.incumbent_changes += 1;
        self.emit(event);
    }

    fn exhausted_reason(&self) -> Option<String> {
        if let Some(limit) = self.scenario.walltime_limit {
            if self.started.elapsed().as_secs_f64() >= limit {
                return Some(format!("walltime limit of {limit}s reached"));
            }
        }
        if self.stats.trials_finished >= self.scenario.n_trials {
            return Some(format!("trial limit of {} reached", self.scenario.n_trials));
        }
        if let Some(size) = self.scenario.configspace.finite_size() {
            if self.history.num_configs() as u64 >= size {
                return Some(format!("all {size} configurations evaluated"));
            }
        }
        if self.idle_rounds >= MAX_IDLE_ROUNDS {
            return Some(format!("no new trials in {MAX_IDLE_ROUNDS} rounds"));
        }
        None
    }

    fn terminate(&mut self, reason: String) -> RacerResult<()> {
        self.stats.wallclock_seconds = self.started.elapsed().as_secs_f64();

        if let Some(dir) = &self.scenario.output_directory {
            let store = RunHistoryStore::new(dir)?;
            store.save(&self.history, self.intensifier.trajectory())?;
            info!(path = %dir.display(), "run history saved");
        }

        info!(
            reason = %reason,
            trials = self.stats.trials_finished,
            incumbent_changes = self.stats.incumbent_changes,
            wallclock_seconds = self.stats.wallclock_seconds,
            "optimization finished"
        );
        self.emit(SmboEvent::Terminated {
            reason: reason.clone(),
            trials_finished: self.stats.trials_finished,
        });
        self.termination_reason = Some(reason);
        Ok(())
    }

    fn emit(&mut self, event: SmboEvent) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event.clone()) {
                debug!(error = %e, "event receiver dropped");
            }
        }
        self.events.push(event);
    }
}
