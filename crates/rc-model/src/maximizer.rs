//! Acquisition maximisation: local search from promising start points
//! combined with a sorted pool of random samples.

use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rc_history::RunHistory;
use rc_types::{ConfigSpace, Configuration, RacerResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

use crate::acquisition::AcquisitionFunction;
use crate::model::SurrogateModel;

/// Score differences below this are treated as plateaus.
const SCORE_EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalSearchSettings {
    /// Walks started from evaluated configurations, and again from random
    /// samples.
    pub n_init: usize,
    pub max_steps: usize,
    pub n_steps_plateau_walk: usize,
    /// Gaussian moves per numeric parameter when building a neighbourhood.
    pub neighbors_per_numeric: usize,
}

impl Default for LocalSearchSettings {
    fn default() -> Self {
        Self {
            n_init: 10,
            max_steps: 100,
            n_steps_plateau_walk: 10,
            neighbors_per_numeric: 4,
        }
    }
}

/// A scored candidate; higher is better.
pub type ScoredConfiguration = (f64, Configuration);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AcquisitionMaximizer {
    LocalAndSortedRandomSearch {
        local: LocalSearchSettings,
        n_random: usize,
    },
    /// Model-free: random configurations in sample order.
    RandomSearch,
}

impl Default for AcquisitionMaximizer {
    fn default() -> Self {
        Self::LocalAndSortedRandomSearch {
            local: LocalSearchSettings::default(),
            n_random: 1000,
        }
    }
}

impl AcquisitionMaximizer {
    /// Up to `n_points` candidates, best first.
    ///
    /// `model` may be `None` only for [`AcquisitionMaximizer::RandomSearch`];
    /// the guided variant then degrades to random sampling as well.
    pub fn maximize(
        &self,
        model: Option<&SurrogateModel>,
        acquisition: &AcquisitionFunction,
        history: &RunHistory,
        space: &ConfigSpace,
        n_points: usize,
        rng: &mut ChaCha8Rng,
    ) -> RacerResult<Vec<ScoredConfiguration>> {
        let (local, n_random, model) = match (self, model) {
            (Self::LocalAndSortedRandomSearch { local, n_random }, Some(model))
                if model.is_fitted() =>
            {
                (local, *n_random, model)
            }
            _ => {
                return Ok(space
                    .sample(n_points, rng)
                    .into_iter()
                    .map(|c| (0.0, c))
                    .collect());
            }
        };

        let random_pool = score_all(model, acquisition, space, space.sample(n_random, rng))?;
        let mut sorted_random = random_pool.clone();
        sorted_random.sort_by(|a, b| b.0.total_cmp(&a.0));

        let starts = start_points(history, &sorted_random, local.n_init);
        let mut local_pool = Vec::with_capacity(starts.len());
        for start in starts {
            local_pool.push(local_walk(model, acquisition, space, local, start, rng)?);
        }

        let mut seen = HashSet::new();
        let mut candidates: Vec<ScoredConfiguration> = local_pool
            .into_iter()
            .chain(random_pool)
            .filter(|(_, config)| seen.insert(config.clone()))
            .collect();
        candidates.sort_by(|a, b| b.0.total_cmp(&a.0));
        candidates.truncate(n_points);

        debug!(
            candidates = candidates.len(),
            best = candidates.first().map(|c| c.0),
            "maximized acquisition function"
        );
        Ok(candidates)
    }
}

/// Score configurations in parallel, preserving input order.
fn score_all(
    model: &SurrogateModel,
    acquisition: &AcquisitionFunction,
    space: &ConfigSpace,
    configs: Vec<Configuration>,
) -> RacerResult<Vec<ScoredConfiguration>> {
    configs
        .into_par_iter()
        .map(|config| {
            let x = space.encode(&config)?;
            Ok((acquisition.score(model, &x)?, config))
        })
        .collect()
}

/// The `n_init` best evaluated configurations, then the `n_init` best
/// random samples.
fn start_points(
    history: &RunHistory,
    sorted_random: &[ScoredConfiguration],
    n_init: usize,
) -> Vec<Configuration> {
    let mut seen = HashSet::new();
    history
        .best_configurations(n_init)
        .into_iter()
        .map(|(config, _)| config)
        .chain(sorted_random.iter().take(n_init).map(|(_, config)| config.clone()))
        .filter(|config| seen.insert(config.clone()))
        .collect()
}

fn local_walk(
    model: &SurrogateModel,
    acquisition: &AcquisitionFunction,
    space: &ConfigSpace,
    settings: &LocalSearchSettings,
    start: Configuration,
    rng: &mut ChaCha8Rng,
) -> RacerResult<ScoredConfiguration> {
    let mut current_score = acquisition.score(model, &space.encode(&start)?)?;
    let mut current = start;
    let mut plateau_steps = 0;

    for _ in 0..settings.max_steps {
        let neighbors = space.neighbors(&current, settings.neighbors_per_numeric, rng);
        let scored = score_all(model, acquisition, space, neighbors)?;

        // Ties go to the earliest neighbour.
        let Some((best_score, best)) = scored
            .into_iter()
            .reduce(|best, next| if next.0 > best.0 { next } else { best })
        else {
            break;
        };

        if best_score > current_score + SCORE_EPSILON {
            plateau_steps = 0;
        } else if (best_score - current_score).abs() <= SCORE_EPSILON
            && plateau_steps < settings.n_steps_plateau_walk
        {
            plateau_steps += 1;
        } else {
            break;
        }
        current = best;
        current_score = best_score;
    }

    current.set_origin("Local search");
    Ok((current_score, current))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::AcquisitionKind;
    use crate::gp::GpSettings;
    use crate::model::ModelSettings;
    use rand::SeedableRng;
    use rc_types::{InstanceSeedBudgetKey, RunValue};

    fn space() -> ConfigSpace {
        ConfigSpace::new()
            .add_float("x", -5.0, 10.0)
            .add_float("y", 0.0, 15.0)
    }

    fn fitted(space: &ConfigSpace) -> (RunHistory, SurrogateModel, AcquisitionFunction) {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut history = RunHistory::default();
        for config in space.sample(12, &mut rng) {
            let x = config.get("x").and_then(|v| v.as_f64()).unwrap();
            let y = config.get("y").and_then(|v| v.as_f64()).unwrap();
            let cost = (x - 2.0).powi(2) + (y - 5.0).powi(2) / 4.0;
            history
                .record(
                    &config,
                    InstanceSeedBudgetKey::new(None, 0, None),
                    RunValue::success(cost, 0.1),
                    false,
                )
                .unwrap();
        }

        let mut model = ModelSettings::GaussianProcess(GpSettings::default().with_restarts(1))
            .build(space, 0);
        let data = history.training_data(space, None).unwrap();
        model.fit(&data).unwrap();

        let mut acquisition = AcquisitionFunction::new(AcquisitionKind::default());
        acquisition.update(data.best_cost().unwrap());
        (history, model, acquisition)
    }

    fn small_maximizer() -> AcquisitionMaximizer {
        AcquisitionMaximizer::LocalAndSortedRandomSearch {
            local: LocalSearchSettings {
                n_init: 3,
                max_steps: 20,
                ..LocalSearchSettings::default()
            },
            n_random: 50,
        }
    }

    #[test]
    fn output_is_sorted_and_unique() {
        let space = space();
        let (history, model, acquisition) = fitted(&space);
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        let candidates = small_maximizer()
            .maximize(Some(&model), &acquisition, &history, &space, 20, &mut rng)
            .unwrap();

        assert_eq!(candidates.len(), 20);
        assert!(candidates.windows(2).all(|w| w[0].0 >= w[1].0));
        let unique: HashSet<_> = candidates.iter().map(|(_, c)| c.clone()).collect();
        assert_eq!(unique.len(), candidates.len());
        assert!(candidates.iter().all(|(_, c)| space.is_valid(c)));
    }

    #[test]
    fn deterministic_for_fixed_seed_and_model() {
        let space = space();
        let (history, model, acquisition) = fitted(&space);

        let run = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            small_maximizer()
                .maximize(Some(&model), &acquisition, &history, &space, 10, &mut rng)
                .unwrap()
        };

        let first = run(3);
        let second = run(3);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(a.0, b.0);
            assert_eq!(a.1, b.1);
            assert_eq!(a.1.origin(), b.1.origin());
        }
    }

    #[test]
    fn local_search_never_worsens_its_start() {
        let space = space();
        let (_, model, acquisition) = fitted(&space);
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let start = space.default_configuration();
        let start_score = acquisition
            .score(&model, &space.encode(&start).unwrap())
            .unwrap();

        let (score, config) = local_walk(
            &model,
            &acquisition,
            &space,
            &LocalSearchSettings::default(),
            start,
            &mut rng,
        )
        .unwrap();
        assert!(score >= start_score);
        assert_eq!(config.origin(), Some("Local search"));
    }

    #[test]
    fn random_search_returns_zero_scores_in_sample_order() {
        let space = space();
        let history = RunHistory::default();
        let acquisition = AcquisitionFunction::new(AcquisitionKind::default());

        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let candidates = AcquisitionMaximizer::RandomSearch
            .maximize(None, &acquisition, &history, &space, 4, &mut rng)
            .unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let expected = space.sample(4, &mut rng);
        assert_eq!(candidates.len(), 4);
        assert!(candidates.iter().all(|(score, _)| *score == 0.0));
        let configs: Vec<_> = candidates.into_iter().map(|(_, c)| c).collect();
        assert_eq!(configs, expected);
    }
}
