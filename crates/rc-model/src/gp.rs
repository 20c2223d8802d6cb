//! Gaussian-process surrogate over unit-hypercube encodings.
//!
//! The kernel is Matérn 5/2 on numeric dimensions multiplied by an
//! exponentiated Hamming term on categorical dimensions, both with one
//! length-scale per dimension. Targets are standardised before fitting and
//! predictions are mapped back to the original cost scale.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rc_types::{insufficient_data, ConfigSpace, RacerError, RacerResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

const SQRT_5: f64 = 2.236_067_977_499_79;
const LN_2PI: f64 = 1.837_877_066_409_345_3;
const JITTER: f64 = 1e-10;
const MIN_STEP: f64 = 1e-3;

pub(crate) const LOG_AMPLITUDE_BOUNDS: (f64, f64) = (-10.0, 2.0);
pub(crate) const LOG_LENGTHSCALE_BOUNDS: (f64, f64) = (-6.754, 0.0859);
pub(crate) const LOG_NOISE_BOUNDS: (f64, f64) = (-25.0, 2.0);

/// Only the most recent observations are used to bound the O(n³) fit.
pub(crate) const MAX_TRAINING_POINTS: usize = 150;

/// Settings for the point-estimate GP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpSettings {
    /// Random starting points in addition to the fixed default start.
    pub n_restarts: usize,
    /// Coordinate sweeps per start before giving up.
    pub max_sweeps: usize,
}

impl Default for GpSettings {
    fn default() -> Self {
        Self {
            n_restarts: 3,
            max_sweeps: 20,
        }
    }
}

impl GpSettings {
    pub fn with_restarts(mut self, n_restarts: usize) -> Self {
        self.n_restarts = n_restarts;
        self
    }

    pub fn with_max_sweeps(mut self, max_sweeps: usize) -> Self {
        self.max_sweeps = max_sweeps;
        self
    }
}

/// Kernel hyperparameters in log space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpHyperparameters {
    pub log_amplitude: f64,
    pub log_lengthscales: Vec<f64>,
    pub log_noise: f64,
}

impl GpHyperparameters {
    pub(crate) fn initial(dim: usize) -> Self {
        Self {
            log_amplitude: 0.0,
            log_lengthscales: vec![0.0; dim],
            log_noise: -8.0,
        }
    }

    pub(crate) fn sample<R: Rng + ?Sized>(dim: usize, rng: &mut R) -> Self {
        let theta: Vec<f64> = Self::bounds(dim)
            .into_iter()
            .map(|(lo, hi)| rng.random_range(lo..hi))
            .collect();
        Self::from_vec(&theta)
    }

    /// Bounds in vector order: amplitude, length-scales, noise.
    pub(crate) fn bounds(dim: usize) -> Vec<(f64, f64)> {
        let mut bounds = Vec::with_capacity(dim + 2);
        bounds.push(LOG_AMPLITUDE_BOUNDS);
        bounds.extend(std::iter::repeat(LOG_LENGTHSCALE_BOUNDS).take(dim));
        bounds.push(LOG_NOISE_BOUNDS);
        bounds
    }

    pub(crate) fn to_vec(&self) -> Vec<f64> {
        let mut theta = Vec::with_capacity(self.log_lengthscales.len() + 2);
        theta.push(self.log_amplitude);
        theta.extend_from_slice(&self.log_lengthscales);
        theta.push(self.log_noise);
        theta
    }

    pub(crate) fn from_vec(theta: &[f64]) -> Self {
        let last = theta.len().saturating_sub(1);
        Self {
            log_amplitude: theta.first().copied().unwrap_or(0.0),
            log_lengthscales: theta.get(1..last).map(<[f64]>::to_vec).unwrap_or_default(),
            log_noise: theta.get(last).copied().unwrap_or(LOG_NOISE_BOUNDS.0),
        }
    }

    pub fn amplitude(&self) -> f64 {
        self.log_amplitude.exp()
    }

    pub fn noise(&self) -> f64 {
        self.log_noise.exp()
    }

    pub fn lengthscales(&self) -> Vec<f64> {
        self.log_lengthscales.iter().map(|l| l.exp()).collect()
    }
}

/// Standardises targets to zero mean and unit variance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Normaliser {
    mean: f64,
    std: f64,
}

impl Normaliser {
    pub(crate) fn new(y: &[f64]) -> Self {
        let n = y.len().max(1) as f64;
        let mean = y.iter().sum::<f64>() / n;
        let var = y.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let std = var.sqrt();
        Self {
            mean,
            std: if std.is_finite() && std > 1e-12 { std } else { 1.0 },
        }
    }

    pub(crate) fn apply(&self, y: &[f64]) -> DVector<f64> {
        DVector::from_iterator(y.len(), y.iter().map(|v| (v - self.mean) / self.std))
    }

    pub(crate) fn restore(&self, mean: f64, variance: f64) -> (f64, f64) {
        (mean * self.std + self.mean, variance * self.std * self.std)
    }
}

fn kernel(a: &[f64], b: &[f64], amplitude: f64, lengthscales: &[f64], categorical: &[bool]) -> f64 {
    let mut r_sq = 0.0;
    let mut hamming = 0.0;
    for (i, ls) in lengthscales.iter().enumerate() {
        let diff = a[i] - b[i];
        if categorical[i] {
            if diff.abs() > 1e-12 {
                hamming += 1.0 / ls;
            }
        } else {
            let scaled = diff / ls;
            r_sq += scaled * scaled;
        }
    }
    let sqrt5_r = SQRT_5 * r_sq.sqrt();
    amplitude * (1.0 + sqrt5_r + 5.0 / 3.0 * r_sq) * (-sqrt5_r).exp() * (-hamming).exp()
}

/// A GP conditioned on standardised targets for one hyperparameter setting.
#[derive(Debug, Clone)]
pub(crate) struct Posterior {
    x: Vec<Vec<f64>>,
    categorical: Vec<bool>,
    params: GpHyperparameters,
    amplitude: f64,
    lengthscales: Vec<f64>,
    cholesky: Cholesky<f64, Dyn>,
    alpha: DVector<f64>,
    pub(crate) log_likelihood: f64,
}

impl Posterior {
    /// `None` when the kernel matrix is not positive definite.
    pub(crate) fn fit(
        x: &[Vec<f64>],
        y: &DVector<f64>,
        params: GpHyperparameters,
        categorical: &[bool],
    ) -> Option<Self> {
        let n = x.len();
        let amplitude = params.amplitude();
        let lengthscales = params.lengthscales();
        let noise = params.noise();

        let k = DMatrix::from_fn(n, n, |i, j| {
            let v = kernel(&x[i], &x[j], amplitude, &lengthscales, categorical);
            if i == j {
                v + noise + JITTER
            } else {
                v
            }
        });
        let cholesky = Cholesky::new(k)?;
        let alpha = cholesky.solve(y);
        let half_log_det: f64 = cholesky.l_dirty().diagonal().iter().map(|d| d.ln()).sum();
        let log_likelihood = -0.5 * y.dot(&alpha) - half_log_det - 0.5 * n as f64 * LN_2PI;
        if !log_likelihood.is_finite() {
            return None;
        }

        Some(Self {
            x: x.to_vec(),
            categorical: categorical.to_vec(),
            params,
            amplitude,
            lengthscales,
            cholesky,
            alpha,
            log_likelihood,
        })
    }

    /// Standardised mean and variance at `query`.
    pub(crate) fn predict(&self, query: &[f64]) -> (f64, f64) {
        let k_star = DVector::from_iterator(
            self.x.len(),
            self.x
                .iter()
                .map(|xi| kernel(query, xi, self.amplitude, &self.lengthscales, &self.categorical)),
        );
        let mean = k_star.dot(&self.alpha);
        let w = self.cholesky.solve(&k_star);
        let variance = (self.amplitude - k_star.dot(&w)).max(0.0);
        (mean, variance)
    }

    pub(crate) fn params(&self) -> &GpHyperparameters {
        &self.params
    }
}

/// Keep the last `MAX_TRAINING_POINTS` rows and check their width.
pub(crate) fn prepare_training(
    x: &[Vec<f64>],
    y: &[f64],
    dim: usize,
) -> RacerResult<(Vec<Vec<f64>>, Vec<f64>)> {
    if x.is_empty() || y.is_empty() {
        return Err(insufficient_data!("cannot fit a surrogate without observations"));
    }
    if x.len() != y.len() {
        return Err(RacerError::Model(format!(
            "{} inputs but {} targets",
            x.len(),
            y.len()
        )));
    }
    if let Some(row) = x.iter().find(|row| row.len() != dim) {
        return Err(RacerError::Model(format!(
            "expected {dim} features, got {}",
            row.len()
        )));
    }
    let start = x.len().saturating_sub(MAX_TRAINING_POINTS);
    Ok((x[start..].to_vec(), y[start..].to_vec()))
}

pub(crate) fn categorical_mask(space: &ConfigSpace) -> Vec<bool> {
    (0..space.dimensionality())
        .map(|dim| space.is_categorical(dim))
        .collect()
}

#[derive(Debug, Clone)]
struct Fitted {
    posterior: Posterior,
    normaliser: Normaliser,
}

/// Point-estimate GP with hyperparameters chosen by maximising the log
/// marginal likelihood.
#[derive(Debug, Clone)]
pub struct GaussianProcess {
    categorical: Vec<bool>,
    settings: GpSettings,
    rng: ChaCha8Rng,
    fitted: Option<Fitted>,
}

impl GaussianProcess {
    pub fn new(space: &ConfigSpace, settings: GpSettings, seed: u64) -> Self {
        Self {
            categorical: categorical_mask(space),
            settings,
            rng: ChaCha8Rng::seed_from_u64(seed),
            fitted: None,
        }
    }

    pub fn fit(&mut self, x: &[Vec<f64>], y: &[f64]) -> RacerResult<()> {
        let dim = self.categorical.len();
        let (x, y) = prepare_training(x, y, dim)?;
        let normaliser = Normaliser::new(&y);
        let y_std = normaliser.apply(&y);

        let mut starts = vec![GpHyperparameters::initial(dim)];
        for _ in 0..self.settings.n_restarts {
            starts.push(GpHyperparameters::sample(dim, &mut self.rng));
        }

        let best = starts
            .into_iter()
            .filter_map(|start| {
                coordinate_search(start, &x, &y_std, &self.categorical, self.settings.max_sweeps)
            })
            .max_by(|a, b| a.log_likelihood.total_cmp(&b.log_likelihood))
            .ok_or_else(|| {
                RacerError::Model("no hyperparameter setting gave a positive definite kernel".into())
            })?;

        debug!(
            points = x.len(),
            log_likelihood = best.log_likelihood,
            log_noise = best.params().log_noise,
            "fitted gaussian process"
        );
        self.fitted = Some(Fitted {
            posterior: best,
            normaliser,
        });
        Ok(())
    }

    /// Mean and variance in the original cost scale.
    pub fn predict(&self, x: &[f64]) -> RacerResult<(f64, f64)> {
        let fitted = self
            .fitted
            .as_ref()
            .ok_or_else(|| RacerError::Model("gaussian process has not been fitted".into()))?;
        let (mean, variance) = fitted.posterior.predict(x);
        Ok(fitted.normaliser.restore(mean, variance))
    }

    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    pub fn hyperparameters(&self) -> Option<&GpHyperparameters> {
        self.fitted.as_ref().map(|f| f.posterior.params())
    }
}

/// Greedy coordinate ascent on the log marginal likelihood, halving the step
/// whenever a full sweep finds no improvement.
fn coordinate_search(
    start: GpHyperparameters,
    x: &[Vec<f64>],
    y: &DVector<f64>,
    categorical: &[bool],
    max_sweeps: usize,
) -> Option<Posterior> {
    let bounds = GpHyperparameters::bounds(categorical.len());
    let mut theta: Vec<f64> = start
        .to_vec()
        .iter()
        .zip(&bounds)
        .map(|(t, (lo, hi))| t.clamp(*lo, *hi))
        .collect();
    let mut best = Posterior::fit(x, y, GpHyperparameters::from_vec(&theta), categorical)?;
    let mut step = 1.0;

    for _ in 0..max_sweeps {
        let mut improved = false;
        for i in 0..theta.len() {
            for direction in [1.0, -1.0] {
                let mut candidate = theta.clone();
                candidate[i] = (candidate[i] + direction * step).clamp(bounds[i].0, bounds[i].1);
                if candidate[i] == theta[i] {
                    continue;
                }
                let Some(posterior) =
                    Posterior::fit(x, y, GpHyperparameters::from_vec(&candidate), categorical)
                else {
                    continue;
                };
                if posterior.log_likelihood > best.log_likelihood {
                    theta = candidate;
                    best = posterior;
                    improved = true;
                    break;
                }
            }
        }
        if !improved {
            step *= 0.5;
            if step < MIN_STEP {
                break;
            }
        }
    }

    Some(best)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_space() -> ConfigSpace {
        ConfigSpace::new().add_float("x", 0.0, 1.0)
    }

    fn quadratic_data() -> (Vec<Vec<f64>>, Vec<f64>) {
        let x: Vec<Vec<f64>> = (0..8).map(|i| vec![i as f64 / 7.0]).collect();
        let y = x.iter().map(|p| (p[0] - 0.5).powi(2)).collect();
        (x, y)
    }

    #[test]
    fn fit_without_points_is_insufficient_data() {
        let mut gp = GaussianProcess::new(&line_space(), GpSettings::default(), 0);
        let err = gp.fit(&[], &[]).unwrap_err();
        assert!(matches!(err, RacerError::InsufficientData { .. }));
        assert!(!gp.is_fitted());
    }

    #[test]
    fn predict_before_fit_is_a_model_error() {
        let gp = GaussianProcess::new(&line_space(), GpSettings::default(), 0);
        assert!(matches!(gp.predict(&[0.5]), Err(RacerError::Model(_))));
    }

    #[test]
    fn interpolates_training_points() {
        let (x, y) = quadratic_data();
        let mut gp = GaussianProcess::new(&line_space(), GpSettings::default(), 3);
        gp.fit(&x, &y).unwrap();

        for (xi, yi) in x.iter().zip(&y) {
            let (mean, variance) = gp.predict(xi).unwrap();
            assert!((mean - yi).abs() < 0.05, "mean {mean} vs target {yi}");
            assert!(variance >= 0.0);
        }
    }

    #[test]
    fn variance_grows_away_from_data() {
        let x = vec![vec![0.0], vec![0.05], vec![0.1]];
        let y = vec![1.0, 1.1, 1.2];
        let mut gp = GaussianProcess::new(&line_space(), GpSettings::default(), 1);
        gp.fit(&x, &y).unwrap();

        let (_, near) = gp.predict(&[0.05]).unwrap();
        let (_, far) = gp.predict(&[1.0]).unwrap();
        assert!(far > near);
    }

    #[test]
    fn hyperparameters_stay_within_bounds() {
        let (x, y) = quadratic_data();
        let mut gp = GaussianProcess::new(&line_space(), GpSettings::default().with_restarts(5), 9);
        gp.fit(&x, &y).unwrap();

        let params = gp.hyperparameters().unwrap();
        let theta = params.to_vec();
        for (t, (lo, hi)) in theta.iter().zip(GpHyperparameters::bounds(1)) {
            assert!(*t >= lo && *t <= hi, "{t} outside [{lo}, {hi}]");
        }
    }

    #[test]
    fn constant_targets_are_handled() {
        let x = vec![vec![0.1], vec![0.4], vec![0.9]];
        let y = vec![2.0, 2.0, 2.0];
        let mut gp = GaussianProcess::new(&line_space(), GpSettings::default(), 0);
        gp.fit(&x, &y).unwrap();
        let (mean, _) = gp.predict(&[0.4]).unwrap();
        assert!((mean - 2.0).abs() < 1e-6);
    }

    #[test]
    fn same_seed_gives_same_fit() {
        let (x, y) = quadratic_data();
        let mut a = GaussianProcess::new(&line_space(), GpSettings::default(), 42);
        let mut b = GaussianProcess::new(&line_space(), GpSettings::default(), 42);
        a.fit(&x, &y).unwrap();
        b.fit(&x, &y).unwrap();
        assert_eq!(a.hyperparameters(), b.hyperparameters());
        assert_eq!(a.predict(&[0.33]).unwrap(), b.predict(&[0.33]).unwrap());
    }

    #[test]
    fn categorical_dimensions_use_hamming_distance() {
        let space = ConfigSpace::new().add_choice("algo", vec!["a", "b"]);
        assert_eq!(categorical_mask(&space), vec![true]);

        let ls = [1.0];
        let same = kernel(&[0.25], &[0.25], 1.0, &ls, &[true]);
        let different = kernel(&[0.25], &[0.75], 1.0, &ls, &[true]);
        assert!((same - 1.0).abs() < 1e-12);
        assert!((different - (-1.0f64).exp()).abs() < 1e-12);
    }

    #[test]
    fn mismatched_feature_width_is_rejected() {
        let mut gp = GaussianProcess::new(&line_space(), GpSettings::default(), 0);
        let err = gp.fit(&[vec![0.1, 0.2]], &[1.0]).unwrap_err();
        assert!(matches!(err, RacerError::Model(_)));
    }
}
