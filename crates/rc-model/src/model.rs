use rc_history::TrainingData;
use rc_types::{insufficient_data, ConfigSpace, RacerResult};
use serde::{Deserialize, Serialize};

use crate::gp::{GaussianProcess, GpSettings};
use crate::mcmc::{McmcGaussianProcess, McmcSettings};

/// Which surrogate to build, and with what settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSettings {
    GaussianProcess(GpSettings),
    McmcGaussianProcess(McmcSettings),
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self::GaussianProcess(GpSettings::default())
    }
}

impl ModelSettings {
    pub fn build(&self, space: &ConfigSpace, seed: u64) -> SurrogateModel {
        match self {
            Self::GaussianProcess(settings) => {
                SurrogateModel::GaussianProcess(GaussianProcess::new(space, settings.clone(), seed))
            }
            Self::McmcGaussianProcess(settings) => SurrogateModel::McmcGaussianProcess(
                McmcGaussianProcess::new(space, settings.clone(), seed),
            ),
        }
    }
}

/// Probabilistic model of cost over encoded configurations.
#[derive(Debug, Clone)]
pub enum SurrogateModel {
    GaussianProcess(GaussianProcess),
    McmcGaussianProcess(McmcGaussianProcess),
}

impl SurrogateModel {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GaussianProcess(_) => "gaussian_process",
            Self::McmcGaussianProcess(_) => "mcmc_gaussian_process",
        }
    }

    pub fn fit(&mut self, data: &TrainingData) -> RacerResult<()> {
        if data.is_empty() {
            return Err(insufficient_data!(
                "{} needs at least one uncensored observation",
                self.name()
            ));
        }
        match self {
            Self::GaussianProcess(gp) => gp.fit(&data.x, &data.y),
            Self::McmcGaussianProcess(gp) => gp.fit(&data.x, &data.y),
        }
    }

    /// Mean and variance in the original cost scale.
    pub fn predict(&self, x: &[f64]) -> RacerResult<(f64, f64)> {
        match self {
            Self::GaussianProcess(gp) => gp.predict(x),
            Self::McmcGaussianProcess(gp) => gp.predict(x),
        }
    }

    pub fn is_fitted(&self) -> bool {
        match self {
            Self::GaussianProcess(gp) => gp.is_fitted(),
            Self::McmcGaussianProcess(gp) => gp.is_fitted(),
        }
    }
}
