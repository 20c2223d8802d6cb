//! GP surrogate that marginalises its hyperparameters with an ensemble of
//! Metropolis chains.

use nalgebra::DVector;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rc_types::{standard_normal, ConfigSpace, RacerError, RacerResult};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::gp::{categorical_mask, prepare_training, GpHyperparameters, Normaliser, Posterior};

/// Scale of the horseshoe prior on the noise term.
const HORSESHOE_SCALE: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McmcSettings {
    /// Number of chains; defaults to three per hyperparameter.
    pub n_walkers: Option<usize>,
    pub burnin_steps: usize,
    pub chain_length: usize,
    /// Random-walk step as a fraction of each hyperparameter's range.
    pub proposal_scale: f64,
}

impl Default for McmcSettings {
    fn default() -> Self {
        Self {
            n_walkers: None,
            burnin_steps: 250,
            chain_length: 250,
            proposal_scale: 0.05,
        }
    }
}

impl McmcSettings {
    pub fn with_walkers(mut self, n_walkers: usize) -> Self {
        self.n_walkers = Some(n_walkers);
        self
    }

    pub fn with_chain(mut self, burnin_steps: usize, chain_length: usize) -> Self {
        self.burnin_steps = burnin_steps;
        self.chain_length = chain_length;
        self
    }
}

/// Walker count for `n_hyperparameters`, rounded up to an even number.
pub fn resolve_walkers(requested: Option<usize>, n_hyperparameters: usize) -> usize {
    let n = requested.unwrap_or(3 * n_hyperparameters).max(2);
    n + n % 2
}

fn log_prior(theta: &[f64]) -> f64 {
    let log_amplitude = theta.first().copied().unwrap_or(0.0);
    let log_noise = theta.last().copied().unwrap_or(0.0);

    // Log-normal on the amplitude is a standard normal in log space.
    let amplitude = -0.5 * log_amplitude * log_amplitude;
    let noise = (1.0 + 3.0 * (HORSESHOE_SCALE / log_noise.exp()).powi(2))
        .ln()
        .ln();
    amplitude + noise
}

fn in_bounds(theta: &[f64], bounds: &[(f64, f64)]) -> bool {
    theta
        .iter()
        .zip(bounds)
        .all(|(t, (lo, hi))| *t >= *lo && *t <= *hi)
}

struct ChainInput<'a> {
    x: &'a [Vec<f64>],
    y: &'a DVector<f64>,
    categorical: &'a [bool],
    settings: &'a McmcSettings,
}

/// Run one walker and return the GP at its final position.
fn run_chain(seed: u64, input: &ChainInput<'_>) -> Option<Posterior> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let dim = input.categorical.len();
    let bounds = GpHyperparameters::bounds(dim);

    let evaluate = |theta: &[f64]| -> Option<(Posterior, f64)> {
        let posterior = Posterior::fit(
            input.x,
            input.y,
            GpHyperparameters::from_vec(theta),
            input.categorical,
        )?;
        let log_posterior = posterior.log_likelihood + log_prior(theta);
        log_posterior.is_finite().then_some((posterior, log_posterior))
    };

    let mut theta = GpHyperparameters::sample(dim, &mut rng).to_vec();
    let (mut current, mut current_lp) = match evaluate(&theta) {
        Some(state) => state,
        None => {
            theta = GpHyperparameters::initial(dim).to_vec();
            evaluate(&theta)?
        }
    };

    for _ in 0..input.settings.burnin_steps + input.settings.chain_length {
        let proposal: Vec<f64> = theta
            .iter()
            .zip(&bounds)
            .map(|(t, (lo, hi))| t + standard_normal(&mut rng) * input.settings.proposal_scale * (hi - lo))
            .collect();
        let u: f64 = rng.random();
        if !in_bounds(&proposal, &bounds) {
            continue;
        }
        if let Some((posterior, lp)) = evaluate(&proposal) {
            if u.ln() < lp - current_lp {
                theta = proposal;
                current = posterior;
                current_lp = lp;
            }
        }
    }

    Some(current)
}

#[derive(Debug, Clone)]
struct Ensemble {
    posteriors: Vec<Posterior>,
    normaliser: Normaliser,
}

/// Hyperparameter-marginalising GP; predictions are the moment-matched
/// mixture of one GP per walker.
#[derive(Debug, Clone)]
pub struct McmcGaussianProcess {
    categorical: Vec<bool>,
    settings: McmcSettings,
    n_walkers: usize,
    rng: ChaCha8Rng,
    fitted: Option<Ensemble>,
}

impl McmcGaussianProcess {
    pub fn new(space: &ConfigSpace, settings: McmcSettings, seed: u64) -> Self {
        let categorical = categorical_mask(space);
        let n_walkers = resolve_walkers(settings.n_walkers, categorical.len() + 2);
        Self {
            categorical,
            settings,
            n_walkers,
            rng: ChaCha8Rng::seed_from_u64(seed),
            fitted: None,
        }
    }

    pub fn n_walkers(&self) -> usize {
        self.n_walkers
    }

    pub fn fit(&mut self, x: &[Vec<f64>], y: &[f64]) -> RacerResult<()> {
        let (x, y) = prepare_training(x, y, self.categorical.len())?;
        let normaliser = Normaliser::new(&y);
        let y_std = normaliser.apply(&y);

        // Seeds are drawn before the parallel section so results do not
        // depend on scheduling.
        let seeds: Vec<u64> = (0..self.n_walkers).map(|_| self.rng.random()).collect();
        let input = ChainInput {
            x: &x,
            y: &y_std,
            categorical: &self.categorical,
            settings: &self.settings,
        };
        let posteriors: Vec<Posterior> = seeds
            .par_iter()
            .map(|seed| run_chain(*seed, &input))
            .collect::<Vec<_>>()
            .into_iter()
            .flatten()
            .collect();

        if posteriors.is_empty() {
            return Err(RacerError::Model("every MCMC walker failed to initialise".into()));
        }
        if posteriors.len() < self.n_walkers {
            warn!(
                walkers = self.n_walkers,
                usable = posteriors.len(),
                "some MCMC walkers were dropped"
            );
        }
        debug!(points = x.len(), walkers = posteriors.len(), "fitted MCMC gaussian process");

        self.fitted = Some(Ensemble {
            posteriors,
            normaliser,
        });
        Ok(())
    }

    pub fn predict(&self, x: &[f64]) -> RacerResult<(f64, f64)> {
        let ensemble = self
            .fitted
            .as_ref()
            .ok_or_else(|| RacerError::Model("MCMC gaussian process has not been fitted".into()))?;

        let n = ensemble.posteriors.len() as f64;
        let (sum_mean, sum_second) = ensemble
            .posteriors
            .iter()
            .map(|p| p.predict(x))
            .fold((0.0, 0.0), |(m, s), (mean, var)| (m + mean, s + var + mean * mean));
        let mean = sum_mean / n;
        let variance = (sum_second / n - mean * mean).max(0.0);
        Ok(ensemble.normaliser.restore(mean, variance))
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    /// Final hyperparameters of every surviving walker.
    pub fn samples(&self) -> Vec<GpHyperparameters> {
        self.fitted
            .as_ref()
            .map(|e| e.posteriors.iter().map(|p| p.params().clone()).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_settings() -> McmcSettings {
        McmcSettings::default().with_chain(20, 20)
    }

    fn data() -> (Vec<Vec<f64>>, Vec<f64>) {
        let x: Vec<Vec<f64>> = (0..6).map(|i| vec![i as f64 / 5.0, 0.5]).collect();
        let y = x.iter().map(|p| p[0] * 2.0 + 1.0).collect();
        (x, y)
    }

    fn plane() -> ConfigSpace {
        ConfigSpace::new().add_float("a", 0.0, 1.0).add_float("b", 0.0, 1.0)
    }

    #[test]
    fn walker_count_is_always_even() {
        assert_eq!(resolve_walkers(None, 4), 12);
        assert_eq!(resolve_walkers(None, 3), 10);
        assert_eq!(resolve_walkers(Some(5), 4), 6);
        assert_eq!(resolve_walkers(Some(1), 4), 2);
        assert_eq!(resolve_walkers(Some(8), 4), 8);

        let model = McmcGaussianProcess::new(&plane(), McmcSettings::default().with_walkers(7), 0);
        assert_eq!(model.n_walkers(), 8);
    }

    #[test]
    fn fit_and_predict_mixture() {
        let (x, y) = data();
        let mut model = McmcGaussianProcess::new(&plane(), small_settings().with_walkers(4), 11);
        model.fit(&x, &y).unwrap();

        assert!(model.is_fitted());
        assert_eq!(model.samples().len(), 4);
        let (mean, variance) = model.predict(&[0.4, 0.5]).unwrap();
        assert!(mean.is_finite());
        assert!(variance >= 0.0);
        assert!((mean - 1.8).abs() < 1.0);
    }

    #[test]
    fn walkers_stay_within_bounds() {
        let (x, y) = data();
        let mut model = McmcGaussianProcess::new(&plane(), small_settings().with_walkers(4), 5);
        model.fit(&x, &y).unwrap();
        let bounds = GpHyperparameters::bounds(2);
        for sample in model.samples() {
            assert!(in_bounds(&sample.to_vec(), &bounds));
        }
    }

    #[test]
    fn result_is_reproducible_for_a_seed() {
        let (x, y) = data();
        let mut a = McmcGaussianProcess::new(&plane(), small_settings().with_walkers(4), 99);
        let mut b = McmcGaussianProcess::new(&plane(), small_settings().with_walkers(4), 99);
        a.fit(&x, &y).unwrap();
        b.fit(&x, &y).unwrap();
        assert_eq!(a.samples(), b.samples());
        assert_eq!(a.predict(&[0.1, 0.9]).unwrap(), b.predict(&[0.1, 0.9]).unwrap());
    }

    #[test]
    fn empty_training_set_is_rejected() {
        let mut model = McmcGaussianProcess::new(&plane(), small_settings(), 0);
        assert!(matches!(
            model.fit(&[], &[]),
            Err(RacerError::InsufficientData { .. })
        ));
    }
}
