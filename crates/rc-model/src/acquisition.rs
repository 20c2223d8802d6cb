//! Acquisition functions over a fitted surrogate. Every function returns a
//! utility where higher is better; costs are minimised.

use rc_types::{RacerError, RacerResult};
use serde::{Deserialize, Serialize};

use crate::model::SurrogateModel;

const MIN_STD: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AcquisitionKind {
    ExpectedImprovement { xi: f64 },
    ProbabilityOfImprovement { xi: f64 },
    LowerConfidenceBound { beta: f64 },
}

impl Default for AcquisitionKind {
    fn default() -> Self {
        Self::ExpectedImprovement { xi: 0.0 }
    }
}

/// An acquisition function together with the incumbent cost it improves on.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionFunction {
    kind: AcquisitionKind,
    eta: Option<f64>,
}

impl AcquisitionFunction {
    pub fn new(kind: AcquisitionKind) -> Self {
        Self { kind, eta: None }
    }

    pub fn kind(&self) -> AcquisitionKind {
        self.kind
    }

    /// Set the best observed cost.
    pub fn update(&mut self, eta: f64) {
        self.eta = Some(eta);
    }

    pub fn eta(&self) -> Option<f64> {
        self.eta
    }

    /// Utility of the encoded configuration `x`. NaN utilities map to
    /// negative infinity so they always sort last.
    pub fn score(&self, model: &SurrogateModel, x: &[f64]) -> RacerResult<f64> {
        let (mean, variance) = model.predict(x)?;
        let utility = self.utility(mean, variance)?;
        Ok(if utility.is_nan() {
            f64::NEG_INFINITY
        } else {
            utility
        })
    }

    pub fn utility(&self, mean: f64, variance: f64) -> RacerResult<f64> {
        let std = variance.max(0.0).sqrt();
        match self.kind {
            AcquisitionKind::ExpectedImprovement { xi } => {
                let eta = self.require_eta()?;
                if std < MIN_STD {
                    return Ok(0.0);
                }
                let improvement = eta - mean - xi;
                let z = improvement / std;
                Ok((improvement * norm_cdf(z) + std * norm_pdf(z)).max(0.0))
            }
            AcquisitionKind::ProbabilityOfImprovement { xi } => {
                let eta = self.require_eta()?;
                if std < MIN_STD {
                    return Ok(0.0);
                }
                Ok(norm_cdf((eta - mean - xi) / std))
            }
            AcquisitionKind::LowerConfidenceBound { beta } => Ok(-(mean - beta.sqrt() * std)),
        }
    }

    fn require_eta(&self) -> RacerResult<f64> {
        self.eta.ok_or_else(|| {
            RacerError::Model("acquisition function needs the incumbent cost; call update first".into())
        })
    }
}

fn norm_pdf(x: f64) -> f64 {
    const INV_SQRT_2PI: f64 = 0.398_942_280_401_432_7;
    INV_SQRT_2PI * (-0.5 * x * x).exp()
}

/// Standard normal CDF, Abramowitz-Stegun 26.2.17.
fn norm_cdf(x: f64) -> f64 {
    if x < -8.0 {
        return 0.0;
    }
    if x > 8.0 {
        return 1.0;
    }
    let t = 1.0 / (1.0 + 0.231_641_9 * x.abs());
    let poly = t
        * (0.319_381_530
            + t * (-0.356_563_782 + t * (1.781_477_937 + t * (-1.821_255_978 + t * 1.330_274_429))));
    let upper = 1.0 - norm_pdf(x.abs()) * poly;
    if x >= 0.0 {
        upper
    } else {
        1.0 - upper
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ei() -> AcquisitionFunction {
        let mut acq = AcquisitionFunction::new(AcquisitionKind::default());
        acq.update(1.0);
        acq
    }

    #[test]
    fn zero_variance_has_zero_improvement_utility() {
        assert_eq!(ei().utility(0.2, 0.0).unwrap(), 0.0);

        let mut pi = AcquisitionFunction::new(AcquisitionKind::ProbabilityOfImprovement { xi: 0.0 });
        pi.update(1.0);
        assert_eq!(pi.utility(0.2, 0.0).unwrap(), 0.0);
    }

    #[test]
    fn expected_improvement_prefers_lower_mean_and_higher_variance() {
        let acq = ei();
        let low_mean = acq.utility(0.5, 0.04).unwrap();
        let high_mean = acq.utility(0.9, 0.04).unwrap();
        assert!(low_mean > high_mean);

        let certain = acq.utility(1.2, 0.01).unwrap();
        let uncertain = acq.utility(1.2, 1.0).unwrap();
        assert!(uncertain > certain);
        assert!(certain >= 0.0);
    }

    #[test]
    fn expected_improvement_matches_closed_form_at_eta() {
        // mean == eta: EI = std * phi(0)
        let ei_value = ei().utility(1.0, 0.25).unwrap();
        assert!((ei_value - 0.5 * 0.398_942_280_401_432_7).abs() < 1e-9);
    }

    #[test]
    fn improvement_functions_require_eta() {
        let acq = AcquisitionFunction::new(AcquisitionKind::default());
        assert!(matches!(acq.utility(0.0, 1.0), Err(RacerError::Model(_))));
    }

    #[test]
    fn lower_confidence_bound_needs_no_eta() {
        let acq = AcquisitionFunction::new(AcquisitionKind::LowerConfidenceBound { beta: 4.0 });
        let value = acq.utility(1.0, 0.25).unwrap();
        assert!((value - 0.0).abs() < 1e-12);
    }

    #[test]
    fn norm_cdf_is_symmetric_and_bounded() {
        assert!((norm_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((norm_cdf(1.0) + norm_cdf(-1.0) - 1.0).abs() < 1e-12);
        assert!((norm_cdf(1.959_964) - 0.975).abs() < 1e-4);
        assert_eq!(norm_cdf(-10.0), 0.0);
        assert_eq!(norm_cdf(10.0), 1.0);
    }

    #[test]
    fn kind_serializes_with_tag() {
        let json = serde_json::to_string(&AcquisitionKind::default()).unwrap();
        assert_eq!(json, r#"{"kind":"expected_improvement","xi":0.0}"#);
    }
}
