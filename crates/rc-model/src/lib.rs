//! # rc-model
//!
//! Surrogate models of configuration cost, the acquisition functions that
//! score candidates against the incumbent, and the optimizers that search
//! the configuration space for high-utility candidates.

mod acquisition;
mod gp;
mod maximizer;
mod mcmc;
mod model;

pub use acquisition::{AcquisitionFunction, AcquisitionKind};
pub use gp::{GaussianProcess, GpHyperparameters, GpSettings};
pub use maximizer::{AcquisitionMaximizer, LocalSearchSettings, ScoredConfiguration};
pub use mcmc::{resolve_walkers, McmcGaussianProcess, McmcSettings};
pub use model::{ModelSettings, SurrogateModel};
