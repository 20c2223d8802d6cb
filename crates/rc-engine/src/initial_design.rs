//! Initial designs: the configurations evaluated before any model exists.

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rc_types::{config_error, ConfigSpace, Configuration, RacerError, RacerResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

/// Grid points per continuous dimension in a factorial design.
const FACTORIAL_FLOAT_STEPS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesignStrategy {
    /// Only the space's default configuration.
    Default,
    Random,
    LatinHypercube,
    /// Owen-scrambled Sobol points.
    Sobol,
    /// Full factorial grid.
    Factorial,
}

impl DesignStrategy {
    fn origin(&self) -> &'static str {
        match self {
            Self::Default => "Initial design: Default",
            Self::Random => "Initial design: Random",
            Self::LatinHypercube => "Initial design: Latin hypercube",
            Self::Sobol => "Initial design: Sobol",
            Self::Factorial => "Initial design: Factorial",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DesignSettings {
    /// `None` leaves selection unimplemented unless `configs` is given.
    pub strategy: Option<DesignStrategy>,
    /// Explicit configurations; take precedence over every count setting.
    pub configs: Option<Vec<Configuration>>,
    pub n_configs: Option<usize>,
    pub n_configs_per_hyperparameter: Option<usize>,
    /// Upper bound on the design size as a fraction of the trial budget.
    pub max_config_ratio: f64,
}

impl Default for DesignSettings {
    fn default() -> Self {
        Self {
            strategy: None,
            configs: None,
            n_configs: None,
            n_configs_per_hyperparameter: Some(10),
            max_config_ratio: 0.25,
        }
    }
}

impl DesignSettings {
    pub fn new(strategy: DesignStrategy) -> Self {
        Self {
            strategy: Some(strategy),
            ..Self::default()
        }
    }

    pub fn with_configs(mut self, configs: Vec<Configuration>) -> Self {
        self.configs = Some(configs);
        self
    }

    pub fn with_n_configs(mut self, n_configs: usize) -> Self {
        self.n_configs = Some(n_configs);
        self
    }

    pub fn with_per_hyperparameter(mut self, n: Option<usize>) -> Self {
        self.n_configs_per_hyperparameter = n;
        self
    }

    pub fn with_max_config_ratio(mut self, ratio: f64) -> Self {
        self.max_config_ratio = ratio;
        self
    }
}

#[derive(Debug, Clone)]
pub struct InitialDesign {
    space: ConfigSpace,
    settings: DesignSettings,
    n_configs: usize,
    rng: ChaCha8Rng,
}

impl InitialDesign {
    /// Resolve the design size and validate it against the trial budget and
    /// the space. Every failure here is a [`RacerError::Configuration`].
    pub fn new(
        space: &ConfigSpace,
        settings: DesignSettings,
        n_trials: usize,
        seed: u64,
    ) -> RacerResult<Self> {
        let dim = space.dimensionality();
        let n_configs = if let Some(configs) = &settings.configs {
            configs.len()
        } else if let Some(n) = settings.n_configs {
            n
        } else if let Some(per_hp) = settings.n_configs_per_hyperparameter {
            let by_ratio = (settings.max_config_ratio * n_trials as f64).floor() as usize;
            (per_hp * dim).min(by_ratio).max(1)
        } else {
            return Err(config_error!(
                "initial design needs one of configs, n_configs or n_configs_per_hyperparameter"
            ));
        };
        // The default design yields a single configuration whatever was
        // requested.
        let n_configs = match (&settings.configs, settings.strategy) {
            (None, Some(DesignStrategy::Default)) => n_configs.min(1),
            _ => n_configs,
        };

        if n_configs > n_trials {
            return Err(config_error!(
                "initial design of {n_configs} configurations exceeds the {n_trials} trial budget"
            ));
        }
        if let Some(size) = space.finite_size() {
            if n_configs as u64 > size {
                return Err(config_error!(
                    "initial design of {n_configs} configurations exceeds the {size} configurations in the space"
                ));
            }
        }
        if settings.strategy == Some(DesignStrategy::Sobol)
            && dim > sobol_burley::NUM_DIMENSIONS as usize
        {
            return Err(config_error!(
                "Sobol design supports at most {} dimensions, the space has {dim}",
                sobol_burley::NUM_DIMENSIONS
            ));
        }

        debug!(n_configs, strategy = ?settings.strategy, "resolved initial design");
        Ok(Self {
            space: space.clone(),
            settings,
            n_configs,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    pub fn n_configs(&self) -> usize {
        self.n_configs
    }

    pub fn strategy(&self) -> Option<DesignStrategy> {
        self.settings.strategy
    }

    /// Configurations in evaluation order, without duplicates.
    pub fn select_configurations(&mut self) -> RacerResult<Vec<Configuration>> {
        if self.n_configs == 0 {
            return Ok(Vec::new());
        }

        let configs = match (&self.settings.configs, self.settings.strategy) {
            (Some(configs), _) => configs.clone(),
            (None, Some(strategy)) => self.generate(strategy),
            (None, None) => {
                return Err(RacerError::NotImplemented {
                    strategy: "InitialDesign".to_string(),
                })
            }
        };

        let mut seen = HashSet::new();
        let selected: Vec<Configuration> = configs
            .into_iter()
            .filter(|c| seen.insert(c.clone()))
            .map(|mut c| {
                if c.origin().is_none() {
                    c.set_origin("Initial design");
                }
                c
            })
            .collect();

        info!(
            requested = self.n_configs,
            selected = selected.len(),
            "selected initial design"
        );
        Ok(selected)
    }

    fn generate(&mut self, strategy: DesignStrategy) -> Vec<Configuration> {
        let n = self.n_configs;
        let dim = self.space.dimensionality();
        let points: Vec<Vec<f64>> = match strategy {
            DesignStrategy::Default => return vec![self.space.default_configuration()],
            DesignStrategy::Factorial => {
                return self.labelled(self.space.grid(FACTORIAL_FLOAT_STEPS), strategy)
            }
            DesignStrategy::Random => {
                let configs = self.space.sample(n, &mut self.rng);
                return self.labelled(configs, strategy);
            }
            DesignStrategy::LatinHypercube => latin_hypercube(n, dim, &mut self.rng),
            DesignStrategy::Sobol => {
                let seed: u32 = self.rng.random();
                (0..n as u32)
                    .map(|i| {
                        (0..dim as u32)
                            .map(|d| f64::from(sobol_burley::sample(i, d, seed)))
                            .collect()
                    })
                    .collect()
            }
        };

        // Points that decode to forbidden or invalid configurations are dropped.
        let configs = points
            .iter()
            .filter_map(|p| self.space.decode(p).ok())
            .collect();
        self.labelled(configs, strategy)
    }

    fn labelled(&self, configs: Vec<Configuration>, strategy: DesignStrategy) -> Vec<Configuration> {
        configs
            .into_iter()
            .map(|c| c.with_origin(strategy.origin()))
            .collect()
    }
}

/// One point per stratum in every dimension, strata shuffled independently.
fn latin_hypercube<R: Rng + ?Sized>(n: usize, dim: usize, rng: &mut R) -> Vec<Vec<f64>> {
    let mut points = vec![vec![0.0; dim]; n];
    for d in 0..dim {
        let mut strata: Vec<usize> = (0..n).collect();
        strata.shuffle(rng);
        for (point, stratum) in points.iter_mut().zip(strata) {
            point[d] = (stratum as f64 + rng.random::<f64>()) / n as f64;
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use rc_types::ParameterValue;

    fn plane() -> ConfigSpace {
        ConfigSpace::new()
            .add_float("x0", -5.0, 10.0)
            .add_float("x1", 0.0, 15.0)
    }

    fn explicit(n: usize) -> Vec<Configuration> {
        (0..n)
            .map(|i| [("x0", i as f64), ("x1", 1.0)].into_iter().collect())
            .collect()
    }

    #[test]
    fn explicit_configs_are_returned_verbatim() {
        let configs = explicit(3);
        let settings = DesignSettings::new(DesignStrategy::Sobol)
            .with_configs(configs.clone())
            .with_n_configs(10);
        let mut design = InitialDesign::new(&plane(), settings, 100, 0).unwrap();

        assert_eq!(design.n_configs(), 3);
        let selected = design.select_configurations().unwrap();
        assert_eq!(selected, configs);
        assert!(selected.iter().all(|c| c.origin() == Some("Initial design")));
    }

    #[test]
    fn explicit_configs_keep_their_origin_and_drop_duplicates() {
        let mut configs = explicit(2);
        configs[0].set_origin("user");
        configs.push(configs[0].clone());
        let settings = DesignSettings::default().with_configs(configs.clone());
        let mut design = InitialDesign::new(&plane(), settings, 100, 0).unwrap();

        let selected = design.select_configurations().unwrap();
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].origin(), Some("user"));
        assert_eq!(selected[1], configs[1]);
    }

    #[test]
    fn default_design_returns_only_the_default() {
        for n in [1, 5, 20] {
            let settings = DesignSettings::new(DesignStrategy::Default).with_n_configs(n);
            let mut design = InitialDesign::new(&plane(), settings, 100, 0).unwrap();
            let selected = design.select_configurations().unwrap();
            assert_eq!(selected, vec![plane().default_configuration()]);
        }
    }

    #[test]
    fn default_design_fits_small_finite_spaces() {
        let space = ConfigSpace::new().add_choice("solver", ["a", "b", "c"]);
        let settings = DesignSettings::new(DesignStrategy::Default);
        let mut design = InitialDesign::new(&space, settings, 1, 0).unwrap();

        assert_eq!(design.n_configs(), 1);
        let selected = design.select_configurations().unwrap();
        assert_eq!(selected, vec![space.default_configuration()]);
    }

    #[test]
    fn count_from_hyperparameters_is_capped_by_ratio() {
        let settings = DesignSettings::new(DesignStrategy::Random);
        let design = InitialDesign::new(&plane(), settings.clone(), 100, 0).unwrap();
        assert_eq!(design.n_configs(), 20);

        let design = InitialDesign::new(&plane(), settings.clone(), 40, 0).unwrap();
        assert_eq!(design.n_configs(), 10);

        let design = InitialDesign::new(&plane(), settings, 2, 0).unwrap();
        assert_eq!(design.n_configs(), 1);
    }

    #[test]
    fn missing_count_is_a_configuration_error() {
        let settings = DesignSettings::new(DesignStrategy::Random).with_per_hyperparameter(None);
        let err = InitialDesign::new(&plane(), settings, 100, 0).unwrap_err();
        assert!(matches!(err, RacerError::Configuration(_)));
    }

    #[test]
    fn more_configs_than_trials_is_rejected() {
        let settings = DesignSettings::new(DesignStrategy::Random).with_n_configs(11);
        let err = InitialDesign::new(&plane(), settings, 10, 0).unwrap_err();
        assert!(matches!(err, RacerError::Configuration(_)));
    }

    #[test]
    fn more_configs_than_the_finite_space_is_rejected() {
        let space = ConfigSpace::new()
            .add_choice("a", ["x", "y"])
            .add_int("b", 0, 1);
        let settings = DesignSettings::new(DesignStrategy::Random).with_n_configs(5);
        let err = InitialDesign::new(&space, settings, 100, 0).unwrap_err();
        assert!(matches!(err, RacerError::Configuration(_)));

        let settings = DesignSettings::new(DesignStrategy::Random).with_n_configs(4);
        assert!(InitialDesign::new(&space, settings, 100, 0).is_ok());
    }

    #[test]
    fn sobol_rejects_too_many_dimensions() {
        let mut space = ConfigSpace::new();
        for i in 0..=sobol_burley::NUM_DIMENSIONS {
            space = space.add_float(format!("x{i}"), 0.0, 1.0);
        }
        let settings = DesignSettings::new(DesignStrategy::Sobol).with_n_configs(4);
        let err = InitialDesign::new(&space, settings, 100, 0).unwrap_err();
        assert!(matches!(err, RacerError::Configuration(_)));
    }

    #[test]
    fn base_design_is_not_implemented() {
        let mut design = InitialDesign::new(&plane(), DesignSettings::default(), 100, 0).unwrap();
        let err = design.select_configurations().unwrap_err();
        assert!(matches!(err, RacerError::NotImplemented { .. }));
    }

    #[test]
    fn zero_configs_returns_empty() {
        let settings = DesignSettings::default().with_n_configs(0);
        let mut design = InitialDesign::new(&plane(), settings, 100, 0).unwrap();
        assert!(design.select_configurations().unwrap().is_empty());
    }

    #[test]
    fn space_filling_designs_return_valid_configs() {
        for strategy in [
            DesignStrategy::Random,
            DesignStrategy::LatinHypercube,
            DesignStrategy::Sobol,
        ] {
            let settings = DesignSettings::new(strategy).with_n_configs(8);
            let mut design = InitialDesign::new(&plane(), settings, 100, 3).unwrap();
            let selected = design.select_configurations().unwrap();
            assert_eq!(selected.len(), 8, "{strategy:?}");
            assert!(selected.iter().all(|c| plane().is_valid(c)));
            assert!(selected.iter().all(|c| c.origin() == Some(strategy.origin())));
        }
    }

    #[test]
    fn latin_hypercube_covers_every_stratum() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let points = latin_hypercube(5, 2, &mut rng);
        for d in 0..2 {
            let mut strata: Vec<usize> = points.iter().map(|p| (p[d] * 5.0) as usize).collect();
            strata.sort_unstable();
            assert_eq!(strata, vec![0, 1, 2, 3, 4]);
        }
    }

    #[test]
    fn factorial_design_enumerates_categoricals() {
        let space = ConfigSpace::new()
            .add_choice("a", ["x", "y"])
            .add_int("b", 0, 1);
        let settings = DesignSettings::new(DesignStrategy::Factorial).with_n_configs(4);
        let mut design = InitialDesign::new(&space, settings, 10, 0).unwrap();
        let selected = design.select_configurations().unwrap();
        assert_eq!(selected.len(), 4);
        assert!(selected
            .iter()
            .any(|c| c.get("a") == Some(&ParameterValue::Categorical("y".into()))));
    }

    #[test]
    fn same_seed_same_design() {
        let settings = DesignSettings::new(DesignStrategy::Sobol).with_n_configs(6);
        let mut a = InitialDesign::new(&plane(), settings.clone(), 100, 9).unwrap();
        let mut b = InitialDesign::new(&plane(), settings, 100, 9).unwrap();
        assert_eq!(
            a.select_configurations().unwrap(),
            b.select_configurations().unwrap()
        );
    }
}
