//! Selection of the intensification strategy driven by the SMBO loop.

use rc_history::{RunHistory, Trajectory};
use rc_types::{config_error, Configuration, RacerResult, TrialRequest};
use serde::{Deserialize, Serialize};

use crate::intensifier::{ChallengerQueue, Intensifier, IntensifierAction, RacingSettings};
use crate::scenario::Scenario;
use crate::successive_halving::{HalvingSettings, SuccessiveHalving};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntensifierSettings {
    Racing(RacingSettings),
    /// Requires `min_budget` and `max_budget` on the scenario.
    SuccessiveHalving { eta: f64 },
    /// Requires `min_budget` and `max_budget` on the scenario.
    Hyperband { eta: f64 },
}

impl Default for IntensifierSettings {
    fn default() -> Self {
        Self::Racing(RacingSettings::default())
    }
}

impl IntensifierSettings {
    pub fn build(&self, scenario: &Scenario, seed: u64) -> RacerResult<IntensifierKind> {
        let context = scenario.trial_context();
        let halving = match self {
            Self::Racing(settings) => {
                return Ok(IntensifierKind::Racing(Intensifier::new(
                    settings.clone(),
                    context,
                    seed,
                )?))
            }
            Self::SuccessiveHalving { eta } => HalvingSettings::successive_halving(*eta),
            Self::Hyperband { eta } => HalvingSettings::hyperband(*eta),
        };
        let (Some(min_budget), Some(max_budget)) = (scenario.min_budget, scenario.max_budget) else {
            return Err(config_error!(
                "scenario '{}' needs min_budget and max_budget for budgeted intensification",
                scenario.name
            ));
        };
        Ok(IntensifierKind::Bracketed(SuccessiveHalving::new(
            halving, context, min_budget, max_budget, seed,
        )?))
    }
}

#[derive(Debug, Clone)]
pub enum IntensifierKind {
    Racing(Intensifier),
    Bracketed(SuccessiveHalving),
}

impl IntensifierKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Racing(_) => "racing",
            Self::Bracketed(_) => "successive_halving",
        }
    }

    pub fn next_action(
        &mut self,
        queue: &mut ChallengerQueue,
        history: &RunHistory,
    ) -> RacerResult<IntensifierAction> {
        match self {
            Self::Racing(intensifier) => intensifier.next_action(queue, history),
            Self::Bracketed(halving) => halving.next_action(queue, history),
        }
    }

    pub fn on_result(&mut self, request: &TrialRequest) {
        match self {
            Self::Racing(intensifier) => intensifier.on_result(request),
            Self::Bracketed(halving) => halving.on_result(request),
        }
    }

    pub fn incumbent(&self) -> Option<&Configuration> {
        match self {
            Self::Racing(intensifier) => intensifier.incumbent(),
            Self::Bracketed(halving) => halving.incumbent(),
        }
    }

    pub fn trajectory(&self) -> &Trajectory {
        match self {
            Self::Racing(intensifier) => intensifier.trajectory(),
            Self::Bracketed(halving) => halving.trajectory(),
        }
    }

    pub fn challengers_wanted(&self) -> usize {
        match self {
            Self::Racing(intensifier) => intensifier.challengers_wanted(),
            Self::Bracketed(halving) => halving.challengers_wanted(),
        }
    }
}
