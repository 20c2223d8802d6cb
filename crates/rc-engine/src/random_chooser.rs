//! Decides when a proposal slot is filled by a uniformly random
//! configuration instead of the acquisition optimizer's candidate.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rc_types::{config_error, ConfigSpace, Configuration, RacerResult};
use serde::{Deserialize, Serialize};

/// Probability used by the black-box preset.
pub const BLACK_BOX_RANDOM_PROBABILITY: f64 = 0.084_472_323_717_205_52;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RandomChooserKind {
    /// Random with fixed probability.
    Probability { prob: f64 },
    /// Probability divided by `factor` after every SMBO iteration.
    ProbabilityCoolDown { prob: f64, factor: f64 },
    /// Every proposal whose index modulo `modulus` is below one is random.
    Modulus { modulus: f64 },
}

impl Default for RandomChooserKind {
    fn default() -> Self {
        Self::Probability {
            prob: BLACK_BOX_RANDOM_PROBABILITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RandomConfigurationChooser {
    kind: RandomChooserKind,
    prob: f64,
    rng: ChaCha8Rng,
}

impl RandomConfigurationChooser {
    pub fn new(kind: RandomChooserKind, seed: u64) -> RacerResult<Self> {
        let prob = match kind {
            RandomChooserKind::Probability { prob } => prob,
            RandomChooserKind::ProbabilityCoolDown { prob, factor } => {
                if factor <= 1.0 {
                    return Err(config_error!("cool-down factor must exceed 1, got {factor}"));
                }
                prob
            }
            RandomChooserKind::Modulus { modulus } => {
                if modulus <= 0.0 {
                    return Err(config_error!("modulus must be positive, got {modulus}"));
                }
                0.0
            }
        };
        if !(0.0..=1.0).contains(&prob) {
            return Err(config_error!("random probability must lie in [0, 1], got {prob}"));
        }

        Ok(Self {
            kind,
            prob,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    pub fn kind(&self) -> RandomChooserKind {
        self.kind
    }

    /// Current probability of a random proposal.
    pub fn probability(&self) -> f64 {
        self.prob
    }

    pub fn next_smbo_iteration(&mut self) {
        if let RandomChooserKind::ProbabilityCoolDown { factor, .. } = self.kind {
            self.prob /= factor;
        }
    }

    /// True when proposal `iteration` should be random.
    pub fn check(&mut self, iteration: usize) -> bool {
        match self.kind {
            RandomChooserKind::Modulus { modulus } => (iteration as f64) % modulus < 1.0,
            _ => self.rng.random::<f64>() < self.prob,
        }
    }

    /// A uniformly random configuration drawn from this chooser's stream.
    pub fn sample(&mut self, space: &ConfigSpace) -> Option<Configuration> {
        space.sample(1, &mut self.rng).pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rc_types::RacerError;

    #[test]
    fn extreme_probabilities() {
        let mut never = RandomConfigurationChooser::new(
            RandomChooserKind::Probability { prob: 0.0 },
            1,
        )
        .unwrap();
        let mut always = RandomConfigurationChooser::new(
            RandomChooserKind::Probability { prob: 1.0 },
            1,
        )
        .unwrap();
        assert!((0..100).all(|i| !never.check(i)));
        assert!((0..100).all(|i| always.check(i)));
    }

    #[test]
    fn probability_matches_frequency() {
        let mut chooser =
            RandomConfigurationChooser::new(RandomChooserKind::Probability { prob: 0.3 }, 7)
                .unwrap();
        let hits = (0..10_000).filter(|i| chooser.check(*i)).count();
        assert!((2_700..3_300).contains(&hits), "{hits} hits");
    }

    #[test]
    fn cool_down_divides_probability() {
        let mut chooser = RandomConfigurationChooser::new(
            RandomChooserKind::ProbabilityCoolDown {
                prob: 0.5,
                factor: 2.0,
            },
            0,
        )
        .unwrap();
        chooser.next_smbo_iteration();
        chooser.next_smbo_iteration();
        assert!((chooser.probability() - 0.125).abs() < 1e-12);
    }

    #[test]
    fn modulus_is_deterministic() {
        let mut chooser =
            RandomConfigurationChooser::new(RandomChooserKind::Modulus { modulus: 3.0 }, 0)
                .unwrap();
        let picks: Vec<bool> = (0..6).map(|i| chooser.check(i)).collect();
        assert_eq!(picks, vec![true, false, false, true, false, false]);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(matches!(
            RandomConfigurationChooser::new(RandomChooserKind::Probability { prob: 1.5 }, 0),
            Err(RacerError::Configuration(_))
        ));
        assert!(matches!(
            RandomConfigurationChooser::new(
                RandomChooserKind::ProbabilityCoolDown {
                    prob: 0.5,
                    factor: 1.0
                },
                0
            ),
            Err(RacerError::Configuration(_))
        ));
    }

    #[test]
    fn stream_is_independent_of_other_components() {
        let space = ConfigSpace::new().add_float("x", 0.0, 1.0);
        let mut a = RandomConfigurationChooser::new(RandomChooserKind::default(), 5).unwrap();
        let mut b = RandomConfigurationChooser::new(RandomChooserKind::default(), 5).unwrap();
        // Consuming another generator never changes this chooser's draws.
        let mut other = ChaCha8Rng::seed_from_u64(5);
        let _ = space.sample(10, &mut other);
        assert_eq!(a.sample(&space), b.sample(&space));
        assert_eq!(a.check(0), b.check(0));
    }
}
