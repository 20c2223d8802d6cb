//! Assembly of an [`Smbo`] from a scenario and a named preset.
//!
//! A preset fills in every component setting; individual `with_*` calls
//! made afterwards override single components.

use crossbeam_channel::Sender;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rc_history::{CostPolicy, RunHistory};
use rc_model::{
    AcquisitionFunction, AcquisitionKind, AcquisitionMaximizer, McmcSettings, ModelSettings,
};
use rc_types::{config_error, RacerResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::executor::TargetExecutor;
use crate::initial_design::{DesignSettings, DesignStrategy, InitialDesign};
use crate::intensification::IntensifierSettings;
use crate::intensifier::RacingSettings;
use crate::random_chooser::{
    RandomChooserKind, RandomConfigurationChooser, BLACK_BOX_RANDOM_PROBABILITY,
};
use crate::scenario::Scenario;
use crate::smbo::{Smbo, SmboComponents, SmboEvent};

/// Initial-design configurations per hyperparameter in the black-box presets.
const BLACK_BOX_CONFIGS_PER_HYPERPARAMETER: usize = 8;
const DEFAULT_ETA: f64 = 3.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    /// Sobol design, GP surrogate, expected improvement, racing.
    BlackBox,
    /// As `BlackBox` with an MCMC-marginalised GP.
    BlackBoxMcmc,
    /// Default-configuration design, GP surrogate, heavy random interleaving.
    AlgorithmConfiguration,
    /// Model-free Hyperband over the scenario budgets.
    Hyperband,
    /// Model-free successive halving over the scenario budgets.
    SuccessiveHalving,
    /// Random proposals raced against the incumbent.
    RandomOnlineAggressiveRacing,
}

impl Preset {
    pub fn from_name(name: &str) -> RacerResult<Self> {
        match name.to_ascii_lowercase().replace('-', "_").as_str() {
            "black_box" | "blackbox" => Ok(Self::BlackBox),
            "black_box_mcmc" => Ok(Self::BlackBoxMcmc),
            "algorithm_configuration" | "ac" => Ok(Self::AlgorithmConfiguration),
            "hyperband" => Ok(Self::Hyperband),
            "successive_halving" | "sh" => Ok(Self::SuccessiveHalving),
            "random_online_aggressive_racing" | "roar" => Ok(Self::RandomOnlineAggressiveRacing),
            other => Err(config_error!("unknown preset '{other}'")),
        }
    }
}

pub struct SmboBuilder {
    scenario: Scenario,
    preset: Option<Preset>,
    design: DesignSettings,
    model: Option<ModelSettings>,
    acquisition: AcquisitionKind,
    maximizer: AcquisitionMaximizer,
    chooser: RandomChooserKind,
    intensifier: IntensifierSettings,
    event_sender: Option<Sender<SmboEvent>>,
}

impl SmboBuilder {
    /// Start from the black-box preset.
    pub fn new(scenario: Scenario) -> Self {
        Self {
            scenario,
            preset: None,
            design: DesignSettings::new(DesignStrategy::Sobol),
            model: None,
            acquisition: AcquisitionKind::default(),
            maximizer: AcquisitionMaximizer::default(),
            chooser: RandomChooserKind::default(),
            intensifier: IntensifierSettings::default(),
            event_sender: None,
        }
        .with_preset(Preset::BlackBox)
    }

    pub fn with_preset(mut self, preset: Preset) -> Self {
        self.preset = Some(preset);
        match preset {
            Preset::BlackBox | Preset::BlackBoxMcmc => {
                self.design = DesignSettings::new(DesignStrategy::Sobol)
                    .with_per_hyperparameter(Some(BLACK_BOX_CONFIGS_PER_HYPERPARAMETER));
                self.model = Some(if preset == Preset::BlackBoxMcmc {
                    ModelSettings::McmcGaussianProcess(McmcSettings::default())
                } else {
                    ModelSettings::default()
                });
                self.acquisition = AcquisitionKind::default();
                self.maximizer = AcquisitionMaximizer::default();
                self.chooser = RandomChooserKind::Probability {
                    prob: BLACK_BOX_RANDOM_PROBABILITY,
                };
                self.intensifier = IntensifierSettings::Racing(RacingSettings::default());
            }
            Preset::AlgorithmConfiguration => {
                self.design = DesignSettings::new(DesignStrategy::Default);
                self.model = Some(ModelSettings::default());
                self.acquisition = AcquisitionKind::default();
                self.maximizer = AcquisitionMaximizer::default();
                self.chooser = RandomChooserKind::Probability { prob: 0.5 };
                self.intensifier = IntensifierSettings::Racing(RacingSettings::default());
            }
            Preset::Hyperband | Preset::SuccessiveHalving => {
                self.design = DesignSettings::new(DesignStrategy::Random);
                self.model = None;
                self.maximizer = AcquisitionMaximizer::RandomSearch;
                self.chooser = RandomChooserKind::Probability { prob: 0.0 };
                self.intensifier = if preset == Preset::Hyperband {
                    IntensifierSettings::Hyperband { eta: DEFAULT_ETA }
                } else {
                    IntensifierSettings::SuccessiveHalving { eta: DEFAULT_ETA }
                };
            }
            Preset::RandomOnlineAggressiveRacing => {
                self.design = DesignSettings::new(DesignStrategy::Default);
                self.model = None;
                self.maximizer = AcquisitionMaximizer::RandomSearch;
                self.chooser = RandomChooserKind::Probability { prob: 0.0 };
                self.intensifier = IntensifierSettings::Racing(RacingSettings::default());
            }
        }
        self
    }

    pub fn with_initial_design(mut self, design: DesignSettings) -> Self {
        self.design = design;
        self
    }

    pub fn with_model(mut self, model: ModelSettings) -> Self {
        self.model = Some(model);
        self
    }

    pub fn without_model(mut self) -> Self {
        self.model = None;
        self
    }

    pub fn with_acquisition(mut self, kind: AcquisitionKind) -> Self {
        self.acquisition = kind;
        self
    }

    pub fn with_maximizer(mut self, maximizer: AcquisitionMaximizer) -> Self {
        self.maximizer = maximizer;
        self
    }

    pub fn with_random_chooser(mut self, kind: RandomChooserKind) -> Self {
        self.chooser = kind;
        self
    }

    pub fn with_intensifier(mut self, settings: IntensifierSettings) -> Self {
        self.intensifier = settings;
        self
    }

    pub fn with_event_sender(mut self, sender: Sender<SmboEvent>) -> Self {
        self.event_sender = Some(sender);
        self
    }

    /// Validate everything and select the initial design. Every
    /// configuration error surfaces here, before any trial runs.
    pub fn build(self, executor: Arc<dyn TargetExecutor>) -> RacerResult<Smbo> {
        let scenario = self.scenario;
        scenario.validate()?;
        let space = &scenario.configspace;

        // One stream per component, drawn in a fixed order.
        let mut seeds = ChaCha8Rng::seed_from_u64(scenario.seed);
        let design_seed: u64 = seeds.random();
        let model_seed: u64 = seeds.random();
        let maximizer_seed: u64 = seeds.random();
        let chooser_seed: u64 = seeds.random();
        let intensifier_seed: u64 = seeds.random();

        let mut design = InitialDesign::new(space, self.design, scenario.n_trials, design_seed)?;
        let initial_design = design.select_configurations()?;
        for config in &initial_design {
            space.validate(config)?;
        }

        let model = self.model.map(|settings| settings.build(space, model_seed));
        let chooser = RandomConfigurationChooser::new(self.chooser, chooser_seed)?;
        let intensifier = self.intensifier.build(&scenario, intensifier_seed)?;
        let history = RunHistory::new(CostPolicy {
            crash_cost: scenario.crash_cost,
        });

        info!(
            scenario = %scenario.name,
            preset = ?self.preset,
            n_initial = initial_design.len(),
            seed = scenario.seed,
            "optimizer assembled"
        );

        Ok(Smbo::new(SmboComponents {
            scenario,
            executor,
            history,
            initial_design,
            model,
            acquisition: AcquisitionFunction::new(self.acquisition),
            maximizer: self.maximizer,
            maximizer_rng: ChaCha8Rng::seed_from_u64(maximizer_seed),
            chooser,
            intensifier,
            event_sender: self.event_sender,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::FunctionExecutor;
    use rc_types::{ConfigSpace, Configuration, RacerError, TrialOutcome, TrialRequest};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn branin(request: &TrialRequest) -> crate::executor::ExecutorResult<TrialOutcome> {
        let x0 = request.config.get("x0").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let x1 = request.config.get("x1").and_then(|v| v.as_f64()).unwrap_or(0.0);
        let b = 5.1 / (4.0 * std::f64::consts::PI.powi(2));
        let c = 5.0 / std::f64::consts::PI;
        let t = 1.0 / (8.0 * std::f64::consts::PI);
        let cost = (x1 - b * x0 * x0 + c * x0 - 6.0).powi(2) + 10.0 * (1.0 - t) * x0.cos() + 10.0;
        Ok(TrialOutcome::success(cost, 0.0))
    }

    fn scenario() -> Scenario {
        let space = ConfigSpace::new()
            .add_float("x0", -5.0, 10.0)
            .add_float("x1", 0.0, 15.0);
        Scenario::new(space).with_deterministic(true).with_seed(3)
    }

    fn executor() -> Arc<dyn TargetExecutor> {
        Arc::new(FunctionExecutor::new(branin))
    }

    #[test]
    fn presets_parse_by_name() {
        assert_eq!(Preset::from_name("black-box").unwrap(), Preset::BlackBox);
        assert_eq!(Preset::from_name("ROAR").unwrap(), Preset::RandomOnlineAggressiveRacing);
        assert_eq!(Preset::from_name("hyperband").unwrap(), Preset::Hyperband);
        assert!(matches!(
            Preset::from_name("grid"),
            Err(RacerError::Configuration(_))
        ));
    }

    #[test]
    fn black_box_design_uses_eight_per_hyperparameter() {
        let smbo = SmboBuilder::new(scenario()).build(executor()).unwrap();
        assert_eq!(smbo.initial_design().len(), 16);
    }

    #[test]
    fn same_seed_same_initial_design() {
        let a = SmboBuilder::new(scenario()).build(executor()).unwrap();
        let b = SmboBuilder::new(scenario()).build(executor()).unwrap();
        assert_eq!(a.initial_design(), b.initial_design());

        let c = SmboBuilder::new(scenario().with_seed(4))
            .build(executor())
            .unwrap();
        assert_ne!(a.initial_design(), c.initial_design());
    }

    #[test]
    fn setup_errors_surface_before_any_trial() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let executor: Arc<dyn TargetExecutor> =
            Arc::new(FunctionExecutor::new(move |request: &TrialRequest| {
                counter.fetch_add(1, Ordering::SeqCst);
                branin(request)
            }));

        let configs: Vec<Configuration> = (0..5)
            .map(|i| [("x0", i as f64), ("x1", 1.0)].into_iter().collect())
            .collect();
        let result = SmboBuilder::new(scenario().with_n_trials(4))
            .with_initial_design(DesignSettings::new(DesignStrategy::Random).with_configs(configs))
            .build(Arc::clone(&executor));
        assert!(matches!(result, Err(RacerError::Configuration(_))));

        let result = SmboBuilder::new(scenario())
            .with_preset(Preset::Hyperband)
            .build(executor);
        assert!(matches!(result, Err(RacerError::Configuration(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn overrides_apply_after_the_preset() {
        let smbo = SmboBuilder::new(scenario())
            .with_preset(Preset::RandomOnlineAggressiveRacing)
            .with_initial_design(
                DesignSettings::new(DesignStrategy::LatinHypercube).with_n_configs(5),
            )
            .build(executor())
            .unwrap();
        assert_eq!(smbo.initial_design().len(), 5);
    }

    #[tokio::test]
    async fn black_box_preset_fits_the_model() {
        let smbo = SmboBuilder::new(scenario().with_n_trials(24))
            .build(executor())
            .unwrap();
        let outcome = smbo.run().await.unwrap();

        assert_eq!(outcome.stats.trials_finished, 24);
        assert!(outcome.stats.model_fits > 0);
        let best_initial = outcome
            .history
            .iter()
            .take(6)
            .map(|e| e.value.cost.scalar())
            .fold(f64::INFINITY, f64::min);
        assert!(outcome.incumbent_cost.unwrap() <= best_initial);
    }
}
